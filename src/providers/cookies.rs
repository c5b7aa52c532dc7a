//! Chrome cookie database reader
//!
//! Each profile keeps an SQLite `Cookies` database. Values are either stored
//! in plaintext or encrypted with AES-128-CBC under a key derived from the
//! "Chrome Safe Storage" password (`v10`/`v11` prefixed blobs).

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::MonitorConfig;
use crate::providers::web::{BrowserCookie, BrowserSession, RemoteUsageError, SessionCookieSource};
use crate::storage::keyring;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const SESSION_COOKIE: &str = "sessionKey";
const DEFAULT_HOST: &str = "claude.ai";

const SALT: &[u8] = b"saltysalt";
const IV: [u8; 16] = [b' '; 16];
const MAC_ITERATIONS: u32 = 1003;
const LINUX_ITERATIONS: u32 = 1;
const LINUX_V10_PASSWORD: &[u8] = b"peanuts";
const SAFE_STORAGE_SERVICE: &str = "Chrome Safe Storage";
const SAFE_STORAGE_ACCOUNT: &str = "Chrome";

/// Databases from this schema version on prefix plaintext with SHA-256(host).
const DIGEST_DB_VERSION: i64 = 24;
const DIGEST_LEN: usize = 32;

/// Microseconds between 1601-01-01 and 1970-01-01
const WINDOWS_EPOCH_OFFSET_MICROS: i64 = 11_644_473_600_000_000;

#[derive(Debug, thiserror::Error)]
pub enum CookieError {
    #[error("Cookie database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Chrome Safe Storage key unavailable: {0}")]
    KeyUnavailable(String),
    #[error("Unsupported cookie encryption '{0}'")]
    UnsupportedEncryption(String),
    #[error("Cookie decryption failed")]
    Decrypt,
}

impl From<CookieError> for RemoteUsageError {
    fn from(e: CookieError) -> Self {
        RemoteUsageError::CookieStoreUnavailable(e.to_string())
    }
}

/// PBKDF2-HMAC-SHA1 over the Safe Storage password
pub fn derive_key(password: &[u8], iterations: u32) -> [u8; 16] {
    let mut key = [0u8; 16];
    pbkdf2::pbkdf2_hmac::<sha1::Sha1>(password, SALT, iterations, &mut key);
    key
}

/// Decrypt a cookie payload with its `v1x` prefix already removed
pub fn decrypt_value(payload: &[u8], key: &[u8; 16], strip_digest: bool) -> Result<String, CookieError> {
    let mut buf = payload.to_vec();
    let plain = Aes128CbcDec::new(key.into(), &IV.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| CookieError::Decrypt)?;
    let plain = if strip_digest && plain.len() >= DIGEST_LEN {
        &plain[DIGEST_LEN..]
    } else {
        plain
    };
    String::from_utf8(plain.to_vec()).map_err(|_| CookieError::Decrypt)
}

/// Convert Chrome's `expires_utc`; 0 marks a session cookie.
pub fn chrome_time(micros: i64) -> Option<DateTime<Utc>> {
    if micros == 0 {
        return None;
    }
    DateTime::from_timestamp_micros(micros.saturating_sub(WINDOWS_EPOCH_OFFSET_MICROS))
}

fn is_live(expires_utc: i64, now: DateTime<Utc>) -> bool {
    chrome_time(expires_utc).map_or(true, |expires| expires >= now)
}

fn sqlite_uri(path: &Path) -> String {
    let path = path
        .to_string_lossy()
        .replace('%', "%25")
        .replace('?', "%3f")
        .replace('#', "%23");
    format!("file:{}?immutable=1", path)
}

/// Open without taking locks so a running browser doesn't block us.
fn open_immutable(path: &Path) -> Result<Connection, CookieError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI;
    Ok(Connection::open_with_flags(sqlite_uri(path), flags)?)
}

struct StoredCookie {
    name: String,
    value: String,
    encrypted_value: Vec<u8>,
    expires_utc: i64,
}

pub struct ChromeCookieStore {
    user_data_dir: PathBuf,
    profiles: Vec<String>,
    host: String,
    safe_storage_key: Mutex<Option<[u8; 16]>>,
}

impl ChromeCookieStore {
    pub fn new(user_data_dir: impl Into<PathBuf>, profiles: Vec<String>, host: impl Into<String>) -> Self {
        Self {
            user_data_dir: user_data_dir.into(),
            profiles,
            host: host.into(),
            safe_storage_key: Mutex::new(None),
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        let host = reqwest::Url::parse(&config.web_base_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        Self::new(&config.chrome_user_data_dir, config.chrome_profiles.clone(), host)
    }

    fn cookie_db(&self, profile: &str) -> Option<PathBuf> {
        let dir = self.user_data_dir.join(profile);
        [dir.join("Network").join("Cookies"), dir.join("Cookies")]
            .into_iter()
            .find(|p| p.is_file())
    }

    fn keychain_key(&self) -> Result<[u8; 16], CookieError> {
        let mut cached = self
            .safe_storage_key
            .lock()
            .map_err(|_| CookieError::KeyUnavailable("key cache poisoned".into()))?;
        if let Some(key) = *cached {
            return Ok(key);
        }

        let password = keyring::read_password(SAFE_STORAGE_SERVICE, SAFE_STORAGE_ACCOUNT)
            .map_err(|e| CookieError::KeyUnavailable(e.to_string()))?
            .ok_or_else(|| CookieError::KeyUnavailable("no keychain entry".into()))?;
        let iterations = if cfg!(target_os = "macos") {
            MAC_ITERATIONS
        } else {
            LINUX_ITERATIONS
        };
        let key = derive_key(password.as_bytes(), iterations);
        *cached = Some(key);
        Ok(key)
    }

    fn key_for(&self, version: &[u8]) -> Result<[u8; 16], CookieError> {
        if cfg!(target_os = "windows") {
            return Err(CookieError::UnsupportedEncryption("DPAPI".into()));
        }
        if cfg!(target_os = "linux") && version == b"v10" {
            return Ok(derive_key(LINUX_V10_PASSWORD, LINUX_ITERATIONS));
        }
        self.keychain_key()
    }

    fn decrypt(&self, encrypted: &[u8], db_version: i64) -> Result<String, CookieError> {
        if encrypted.len() < 3 {
            return Err(CookieError::Decrypt);
        }
        let (version, payload) = encrypted.split_at(3);
        if version != b"v10" && version != b"v11" {
            return Err(CookieError::UnsupportedEncryption(
                String::from_utf8_lossy(version).into_owned(),
            ));
        }
        let key = self.key_for(version)?;
        decrypt_value(payload, &key, db_version >= DIGEST_DB_VERSION)
    }

    /// Live cookies for the target host in one database
    fn read_cookies(&self, db: &Path, now: DateTime<Utc>) -> Result<Vec<BrowserCookie>, CookieError> {
        let conn = open_immutable(db)?;
        let db_version: i64 = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                row.get::<_, String>(0)
            })
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let mut stmt = conn.prepare(
            "SELECT name, value, encrypted_value, expires_utc FROM cookies \
             WHERE host_key = ?1 OR host_key LIKE ?2",
        )?;
        let rows = stmt.query_map(
            [self.host.clone(), format!("%.{}", self.host)],
            |row| {
                Ok(StoredCookie {
                    name: row.get(0)?,
                    value: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    encrypted_value: match row.get_ref(2)? {
                        ValueRef::Blob(b) | ValueRef::Text(b) => b.to_vec(),
                        _ => Vec::new(),
                    },
                    expires_utc: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                })
            },
        )?;

        let mut cookies = Vec::new();
        for row in rows {
            let stored = row?;
            if !is_live(stored.expires_utc, now) {
                continue;
            }
            let value = if !stored.value.is_empty() {
                stored.value
            } else if !stored.encrypted_value.is_empty() {
                match self.decrypt(&stored.encrypted_value, db_version) {
                    Ok(value) => value,
                    Err(e) if stored.name == SESSION_COOKIE => return Err(e),
                    Err(e) => {
                        log::debug!("Skipping cookie '{}': {}", stored.name, e);
                        continue;
                    }
                }
            } else {
                continue;
            };
            cookies.push(BrowserCookie {
                name: stored.name,
                value,
            });
        }
        Ok(cookies)
    }
}

impl SessionCookieSource for ChromeCookieStore {
    fn find_session(&self) -> Result<BrowserSession, RemoteUsageError> {
        if !self.user_data_dir.is_dir() {
            return Err(RemoteUsageError::CookieStoreUnavailable(format!(
                "Chrome data directory not found: {}",
                self.user_data_dir.display()
            )));
        }

        let now = Utc::now();
        let mut readable = false;
        let mut last_error = None;

        for profile in &self.profiles {
            let Some(db) = self.cookie_db(profile) else {
                continue;
            };
            match self.read_cookies(&db, now) {
                Ok(cookies) => {
                    readable = true;
                    let has_session = cookies
                        .iter()
                        .any(|c| c.name == SESSION_COOKIE && !c.value.is_empty());
                    if has_session {
                        return Ok(BrowserSession {
                            profile: profile.clone(),
                            cookies,
                        });
                    }
                }
                Err(e) => {
                    log::debug!("Skipping Chrome profile '{}': {}", profile, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !readable => Err(e.into()),
            _ => Err(RemoteUsageError::NoSession),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;
    use chrono::Duration;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    fn to_chrome_time(dt: DateTime<Utc>) -> i64 {
        dt.timestamp_micros() + WINDOWS_EPOCH_OFFSET_MICROS
    }

    fn encrypt(plain: &[u8], key: &[u8; 16]) -> Vec<u8> {
        let mut buf = vec![0u8; plain.len() + 16];
        buf[..plain.len()].copy_from_slice(plain);
        let ct = Aes128CbcEnc::new(key.into(), &IV.into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plain.len())
            .unwrap();
        ct.to_vec()
    }

    fn write_db(path: &Path, version: &str, rows: &[(&str, &str, &str, Vec<u8>, i64)]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE cookies (host_key TEXT, name TEXT, value TEXT,
                                   encrypted_value BLOB, expires_utc INTEGER);",
        )
        .unwrap();
        conn.execute("INSERT INTO meta (key, value) VALUES ('version', ?1)", [version])
            .unwrap();
        for (host, name, value, encrypted, expires) in rows {
            conn.execute(
                "INSERT INTO cookies (host_key, name, value, encrypted_value, expires_utc)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![host, name, value, encrypted, expires],
            )
            .unwrap();
        }
    }

    fn store(dir: &Path) -> ChromeCookieStore {
        ChromeCookieStore::new(
            dir,
            vec!["Default".to_string(), "Profile 1".to_string()],
            "claude.ai",
        )
    }

    #[test]
    fn decrypts_v10_payload() {
        let key = derive_key(b"peanuts", 1);
        let blob = encrypt(b"sk-ant-sid01-abc", &key);
        assert_eq!(decrypt_value(&blob, &key, false).unwrap(), "sk-ant-sid01-abc");
    }

    #[test]
    fn strips_host_digest_on_new_databases() {
        let key = derive_key(b"secret", 1003);
        let mut plain = vec![7u8; DIGEST_LEN];
        plain.extend_from_slice(b"value");
        let blob = encrypt(&plain, &key);
        assert_eq!(decrypt_value(&blob, &key, true).unwrap(), "value");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let blob = encrypt(b"sk-ant-sid01-abc", &derive_key(b"peanuts", 1));
        assert!(decrypt_value(&blob, &derive_key(b"other", 1), false).is_err());
    }

    #[test]
    fn chrome_time_zero_is_session_cookie() {
        assert_eq!(chrome_time(0), None);
        let dt = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(chrome_time(to_chrome_time(dt)), Some(dt));
    }

    #[test]
    fn missing_data_dir_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir.path().join("nope"));
        assert!(matches!(
            store.find_session(),
            Err(RemoteUsageError::CookieStoreUnavailable(_))
        ));
    }

    #[test]
    fn finds_first_profile_with_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let future = to_chrome_time(Utc::now() + Duration::days(30));
        let past = to_chrome_time(Utc::now() - Duration::days(1));

        write_db(
            &dir.path().join("Default").join("Network").join("Cookies"),
            "23",
            &[(".claude.ai", SESSION_COOKIE, "expired", Vec::new(), past)],
        );
        write_db(
            &dir.path().join("Profile 1").join("Cookies"),
            "23",
            &[
                (".claude.ai", SESSION_COOKIE, "sk-live", Vec::new(), future),
                ("claude.ai", "lastActiveOrg", "org-1", Vec::new(), 0),
                (".example.com", SESSION_COOKIE, "other-site", Vec::new(), future),
            ],
        );

        let session = store(dir.path()).find_session().unwrap();
        assert_eq!(session.profile, "Profile 1");
        assert_eq!(session.cookies.len(), 2);
        assert!(session
            .cookies
            .iter()
            .any(|c| c.name == SESSION_COOKIE && c.value == "sk-live"));
    }

    #[test]
    fn profiles_without_session_yield_no_session() {
        let dir = tempfile::tempdir().unwrap();
        write_db(
            &dir.path().join("Default").join("Cookies"),
            "23",
            &[("claude.ai", "lastActiveOrg", "org-1", Vec::new(), 0)],
        );
        assert!(matches!(
            store(dir.path()).find_session(),
            Err(RemoteUsageError::NoSession)
        ));
    }

    #[test]
    fn undecryptable_side_cookies_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_db(
            &dir.path().join("Default").join("Cookies"),
            "23",
            &[
                (".claude.ai", "__cf_bm", "", b"v99garbage".to_vec(), 0),
                (".claude.ai", SESSION_COOKIE, "sk-plain", Vec::new(), 0),
            ],
        );

        let session = store(dir.path()).find_session().unwrap();
        assert_eq!(session.cookies.len(), 1);
        assert_eq!(session.cookies[0].name, SESSION_COOKIE);
        assert_eq!(session.cookies[0].value, "sk-plain");
    }

    #[test]
    fn undecryptable_session_cookie_fails_the_profile() {
        let dir = tempfile::tempdir().unwrap();
        write_db(
            &dir.path().join("Default").join("Cookies"),
            "23",
            &[(".claude.ai", SESSION_COOKIE, "", b"v99garbage".to_vec(), 0)],
        );
        assert!(matches!(
            store(dir.path()).find_session(),
            Err(RemoteUsageError::CookieStoreUnavailable(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn decrypts_linux_v10_cookies_from_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut blob = b"v10".to_vec();
        blob.extend(encrypt(b"sk-encrypted", &derive_key(LINUX_V10_PASSWORD, 1)));
        write_db(
            &dir.path().join("Default").join("Cookies"),
            "20",
            &[(".claude.ai", SESSION_COOKIE, "", blob, 0)],
        );

        let session = store(dir.path()).find_session().unwrap();
        assert_eq!(session.cookies[0].value, "sk-encrypted");
    }
}
