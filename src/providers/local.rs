//! Rolling-window token aggregation over locally written usage event logs.
//!
//! Every `*.jsonl` file under the projects directory is scanned on each call;
//! nothing is carried over between calls. Files that cannot be read and lines
//! that are not JSON are skipped, so aggregation itself never fails.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::MonitorConfig;
use crate::providers::traits::LocalUsageSource;
use crate::timestamps;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;
const LOG_EXTENSION: &str = "jsonl";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl TokenTotals {
    fn from_usage(usage: &Map<String, Value>) -> Self {
        let count = |key: &str| usage.get(key).map(token_count).unwrap_or(0);
        Self {
            input_tokens: count("input_tokens"),
            output_tokens: count("output_tokens"),
            cache_creation_input_tokens: count("cache_creation_input_tokens"),
            cache_read_input_tokens: count("cache_read_input_tokens"),
        }
    }

    pub fn add(&mut self, other: &TokenTotals) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .saturating_add(other.cache_creation_input_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .saturating_add(other.cache_read_input_tokens);
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_creation_input_tokens == 0
            && self.cache_read_input_tokens == 0
    }

    /// Uncached input plus cache writes. Cache reads never count toward quota.
    pub fn billable_input(&self) -> u64 {
        self.input_tokens.saturating_add(self.cache_creation_input_tokens)
    }

    pub fn billable_total(&self) -> u64 {
        self.billable_input().saturating_add(self.output_tokens)
    }
}

fn token_count(value: &Value) -> u64 {
    value
        .as_u64()
        .or_else(|| {
            value
                .as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f as u64)
        })
        .unwrap_or(0)
}

/// One usage-bearing line of an event log
#[derive(Debug, Clone, PartialEq)]
pub struct UsageEventRecord {
    pub tokens: TokenTotals,
    pub timestamp: Option<DateTime<Utc>>,
    pub source: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingWindowAggregate {
    pub window_hours: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Totals keyed by the parent directory name of each log file
    pub sessions: BTreeMap<String, TokenTotals>,
    pub totals: TokenTotals,
    pub record_count: usize,
    pub files_scanned: usize,
    /// Contents of the CLI's stats-cache.json, when readable
    pub stats_cache: Option<Value>,
}

impl RollingWindowAggregate {
    fn empty(window_start: DateTime<Utc>, window_end: DateTime<Utc>, window: Duration) -> Self {
        Self {
            window_hours: window.num_milliseconds() as f64 / 3_600_000.0,
            window_start,
            window_end,
            sessions: BTreeMap::new(),
            totals: TokenTotals::default(),
            record_count: 0,
            files_scanned: 0,
            stats_cache: None,
        }
    }

    pub fn billable_input(&self) -> u64 {
        self.totals.billable_input()
    }

    pub fn billable_total(&self) -> u64 {
        self.totals.billable_total()
    }

    /// Input plus output, ignoring cache categories
    pub fn total(&self) -> u64 {
        self.totals.input_tokens.saturating_add(self.totals.output_tokens)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Window length for `hours`; non-finite or negative input gives an empty
/// window and huge values clamp to the largest representable span.
pub fn window_from_hours(hours: f64) -> Duration {
    if !hours.is_finite() || hours <= 0.0 {
        return Duration::zero();
    }
    Duration::try_milliseconds((hours * 3_600_000.0).round() as i64).unwrap_or(Duration::MAX)
}

/// Where a producer put the usage object. Probed in declaration order; the
/// first non-empty match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UsageShape {
    /// `{"usage": {...}}`
    TopLevel,
    /// `{"message": {"usage": {...}}}`
    Message,
    /// `{"result": {"usage": {...}}}`
    Result,
}

impl UsageShape {
    const PROBE_ORDER: [UsageShape; 3] = [UsageShape::TopLevel, UsageShape::Message, UsageShape::Result];

    fn locate(self, entry: &Map<String, Value>) -> Option<&Value> {
        let nested = |key: &str| entry.get(key)?.as_object()?.get("usage");
        match self {
            UsageShape::TopLevel => entry.get("usage"),
            UsageShape::Message => nested("message"),
            UsageShape::Result => nested("result"),
        }
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn find_usage(entry: &Map<String, Value>) -> Option<&Value> {
    UsageShape::PROBE_ORDER
        .iter()
        .find_map(|shape| shape.locate(entry).filter(|v| is_present(v)))
}

/// Parse one log line. Returns `None` for malformed JSON, lines without a
/// usage object, and usage objects with no token activity.
pub fn parse_line(line: &str, source: &Path) -> Option<UsageEventRecord> {
    let entry: Value = serde_json::from_str(line).ok()?;
    let entry = entry.as_object()?;

    let timestamp = ["timestamp", "ts"]
        .iter()
        .filter_map(|key| entry.get(*key))
        .find(|v| is_present(v))
        .and_then(timestamps::from_json);

    let usage = find_usage(entry)?.as_object()?;
    let tokens = TokenTotals::from_usage(usage);
    if tokens.is_zero() {
        return None;
    }

    Some(UsageEventRecord {
        tokens,
        timestamp,
        source: source.to_path_buf(),
    })
}

fn session_key(path: &Path) -> String {
    path.parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub struct LocalUsageAggregator {
    projects_dir: PathBuf,
    stats_cache_path: Option<PathBuf>,
    max_file_size: u64,
}

impl LocalUsageAggregator {
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
            stats_cache_path: None,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(config.projects_dir())
            .with_stats_cache(config.stats_cache_path())
            .with_max_file_size(config.max_log_file_bytes())
    }

    pub fn with_stats_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.stats_cache_path = Some(path.into());
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Aggregate against an explicit `now`. Records without a parseable
    /// timestamp count as inside the window.
    // TODO: revisit keeping untimestamped records once producers always stamp events
    pub fn aggregate_at(&self, now: DateTime<Utc>, window: Duration) -> RollingWindowAggregate {
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut aggregate = RollingWindowAggregate::empty(cutoff, now, window);

        let files = self.log_files();
        aggregate.files_scanned = files.len();

        for path in &files {
            match std::fs::metadata(path) {
                Ok(meta) if meta.len() > self.max_file_size => {
                    log::debug!(
                        "Skipping {} ({} bytes exceeds limit)",
                        path.display(),
                        meta.len()
                    );
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            }

            let records = read_records(path, cutoff);
            if records.is_empty() {
                continue;
            }

            let session = aggregate.sessions.entry(session_key(path)).or_default();
            for record in &records {
                session.add(&record.tokens);
                aggregate.totals.add(&record.tokens);
            }
            aggregate.record_count += records.len();
        }

        aggregate.stats_cache = self.read_stats_cache();
        aggregate
    }

    fn log_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.projects_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry.path().extension().and_then(|ext| ext.to_str()) == Some(LOG_EXTENSION)
            })
            .map(|entry| entry.into_path())
            .collect();
        files.sort();
        files
    }

    fn read_stats_cache(&self) -> Option<Value> {
        let path = self.stats_cache_path.as_ref()?;
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }
}

/// Read the in-window records of one file. An I/O error ends the scan of
/// that file but keeps what was read before it.
fn read_records(path: &Path, cutoff: DateTime<Utc>) -> Vec<UsageEventRecord> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            log::debug!("Cannot open {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut records = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("Read error in {}: {}", path.display(), e);
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(record) = parse_line(line, path) else {
            continue;
        };
        if record.timestamp.is_some_and(|ts| ts < cutoff) {
            continue;
        }
        records.push(record);
    }

    records
}

impl LocalUsageSource for LocalUsageAggregator {
    fn aggregate(&self, window: Duration) -> RollingWindowAggregate {
        self.aggregate_at(Utc::now(), window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{SecondsFormat, TimeZone};
    use std::fs;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn iso(dt: DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn write_log(root: &Path, session: &str, file: &str, lines: &[String]) -> PathBuf {
        let dir = root.join(session);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file);
        fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    fn usage_line(ts: DateTime<Utc>, input: u64, output: u64) -> String {
        format!(
            r#"{{"timestamp":"{}","usage":{{"input_tokens":{},"output_tokens":{}}}}}"#,
            iso(ts),
            input,
            output
        )
    }

    #[test]
    fn all_three_usage_shapes_are_counted() {
        let root = tempfile::tempdir().unwrap();
        let ts = iso(now() - Duration::minutes(10));
        write_log(
            root.path(),
            "project",
            "events.jsonl",
            &[
                format!(r#"{{"timestamp":"{ts}","usage":{{"input_tokens":1}}}}"#),
                format!(r#"{{"timestamp":"{ts}","message":{{"usage":{{"output_tokens":2}}}}}}"#),
                format!(
                    r#"{{"timestamp":"{ts}","result":{{"usage":{{"cache_creation_input_tokens":3,"cache_read_input_tokens":4}}}}}}"#
                ),
            ],
        );

        let aggregate = LocalUsageAggregator::new(root.path()).aggregate_at(now(), Duration::hours(5));
        assert_eq!(aggregate.record_count, 3);
        assert_eq!(
            aggregate.totals,
            TokenTotals {
                input_tokens: 1,
                output_tokens: 2,
                cache_creation_input_tokens: 3,
                cache_read_input_tokens: 4,
            }
        );
        assert_eq!(aggregate.billable_input(), 4);
        assert_eq!(aggregate.billable_total(), 6);
        assert_eq!(aggregate.total(), 3);
    }

    #[test]
    fn empty_top_level_usage_falls_through_to_message() {
        let record = parse_line(
            r#"{"usage":{},"message":{"usage":{"input_tokens":7}}}"#,
            Path::new("a/b.jsonl"),
        )
        .unwrap();
        assert_eq!(record.tokens.input_tokens, 7);
        assert_eq!(record.timestamp, None);
    }

    #[test]
    fn top_level_usage_wins_over_nested() {
        let record = parse_line(
            r#"{"usage":{"input_tokens":1},"message":{"usage":{"input_tokens":99}}}"#,
            Path::new("a/b.jsonl"),
        )
        .unwrap();
        assert_eq!(record.tokens.input_tokens, 1);
    }

    #[test]
    fn lines_without_usable_data_are_discarded() {
        let source = Path::new("a/b.jsonl");
        assert!(parse_line("not json", source).is_none());
        assert!(parse_line("[1,2,3]", source).is_none());
        assert!(parse_line(r#"{"type":"user","message":"hi"}"#, source).is_none());
        assert!(parse_line(r#"{"usage":"lots"}"#, source).is_none());
        assert!(parse_line(
            r#"{"usage":{"input_tokens":0,"output_tokens":0,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}"#,
            source
        )
        .is_none());
    }

    #[test]
    fn zero_token_records_never_reach_totals() {
        let root = tempfile::tempdir().unwrap();
        let ts = iso(now());
        write_log(
            root.path(),
            "project",
            "events.jsonl",
            &[
                format!(r#"{{"timestamp":"{ts}","usage":{{"input_tokens":0,"output_tokens":0}}}}"#),
                "{broken".to_string(),
                String::new(),
            ],
        );

        let aggregate = LocalUsageAggregator::new(root.path()).aggregate_at(now(), Duration::hours(5));
        assert_eq!(aggregate.record_count, 0);
        assert!(aggregate.sessions.is_empty());
        assert!(aggregate.totals.is_zero());
        assert_eq!(aggregate.files_scanned, 1);
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let root = tempfile::tempdir().unwrap();
        let n = now();
        write_log(root.path(), "s1", "recent.jsonl", &[usage_line(n - Duration::minutes(299), 1, 0)]);
        write_log(root.path(), "s2", "stale.jsonl", &[usage_line(n - Duration::minutes(301), 10, 0)]);
        write_log(
            root.path(),
            "s3",
            "just-past.jsonl",
            &[usage_line(n - Duration::hours(5) - Duration::milliseconds(500), 100, 0)],
        );
        write_log(root.path(), "s4", "exact.jsonl", &[usage_line(n - Duration::hours(5), 1000, 0)]);

        let aggregate = LocalUsageAggregator::new(root.path()).aggregate_at(n, Duration::hours(5));
        assert_eq!(aggregate.totals.input_tokens, 1001);
        assert_eq!(aggregate.record_count, 2);
        assert_eq!(aggregate.files_scanned, 4);
        assert_eq!(aggregate.window_start, n - Duration::hours(5));
        assert_eq!(aggregate.window_end, n);
        assert_eq!(aggregate.window_hours, 5.0);
        assert!(aggregate.sessions.contains_key("s1"));
        assert!(!aggregate.sessions.contains_key("s2"));
        assert!(!aggregate.sessions.contains_key("s3"));
    }

    #[test]
    fn epoch_timestamps_and_ts_field_are_understood() {
        let root = tempfile::tempdir().unwrap();
        let n = now();
        let recent_ms = (n - Duration::hours(1)).timestamp_millis();
        let stale_secs = (n - Duration::hours(6)).timestamp();
        write_log(
            root.path(),
            "p",
            "events.jsonl",
            &[
                format!(r#"{{"ts":{recent_ms},"usage":{{"output_tokens":5}}}}"#),
                format!(r#"{{"timestamp":{stale_secs},"usage":{{"output_tokens":50}}}}"#),
            ],
        );

        let aggregate = LocalUsageAggregator::new(root.path()).aggregate_at(n, Duration::hours(5));
        assert_eq!(aggregate.totals.output_tokens, 5);
    }

    #[test]
    fn records_without_timestamp_are_kept() {
        let root = tempfile::tempdir().unwrap();
        write_log(
            root.path(),
            "p",
            "events.jsonl",
            &[
                r#"{"usage":{"input_tokens":3}}"#.to_string(),
                r#"{"timestamp":"garbage","usage":{"input_tokens":4}}"#.to_string(),
            ],
        );

        let aggregate = LocalUsageAggregator::new(root.path()).aggregate_at(now(), Duration::hours(5));
        assert_eq!(aggregate.totals.input_tokens, 7);
        assert_eq!(aggregate.record_count, 2);
    }

    #[test]
    fn sessions_group_by_parent_directory() {
        let root = tempfile::tempdir().unwrap();
        let ts = now() - Duration::minutes(5);
        write_log(root.path(), "alpha", "one.jsonl", &[usage_line(ts, 10, 1)]);
        write_log(root.path(), "alpha", "two.jsonl", &[usage_line(ts, 20, 2)]);
        write_log(&root.path().join("nested"), "beta", "three.jsonl", &[usage_line(ts, 5, 5)]);
        write_log(root.path(), "gamma", "notes.txt", &[usage_line(ts, 999, 999)]);

        let aggregate = LocalUsageAggregator::new(root.path()).aggregate_at(now(), Duration::hours(5));
        assert_eq!(aggregate.files_scanned, 3);
        assert_eq!(aggregate.session_count(), 2);
        assert_eq!(aggregate.sessions["alpha"].input_tokens, 30);
        assert_eq!(aggregate.sessions["alpha"].output_tokens, 3);
        assert_eq!(aggregate.sessions["beta"].input_tokens, 5);
        assert_eq!(aggregate.totals.input_tokens, 35);
    }

    #[test]
    fn oversized_files_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let ts = now();
        write_log(root.path(), "small", "a.jsonl", &[usage_line(ts, 1, 0)]);
        write_log(
            root.path(),
            "big",
            "b.jsonl",
            &[usage_line(ts, 1000, 0), usage_line(ts, 1000, 0), usage_line(ts, 1000, 0)],
        );

        let aggregate = LocalUsageAggregator::new(root.path())
            .with_max_file_size(150)
            .aggregate_at(now(), Duration::hours(5));
        assert_eq!(aggregate.totals.input_tokens, 1);
        assert_eq!(aggregate.files_scanned, 2);
    }

    #[test]
    fn missing_tree_yields_zero_aggregate() {
        let root = tempfile::tempdir().unwrap();
        let aggregate = LocalUsageAggregator::new(root.path().join("does-not-exist"))
            .aggregate_at(now(), Duration::hours(5));
        assert_eq!(aggregate.files_scanned, 0);
        assert_eq!(aggregate.record_count, 0);
        assert!(aggregate.totals.is_zero());
        assert_eq!(aggregate.stats_cache, None);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let ts = now() - Duration::minutes(30);
        write_log(root.path(), "a", "x.jsonl", &[usage_line(ts, 10, 20), usage_line(ts, 1, 2)]);
        write_log(root.path(), "b", "y.jsonl", &[r#"{"usage":{"input_tokens":3}}"#.to_string()]);

        let aggregator = LocalUsageAggregator::new(root.path());
        let first = aggregator.aggregate_at(now(), Duration::hours(5));
        let second = aggregator.aggregate_at(now(), Duration::hours(5));
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn stats_cache_is_attached_when_valid() {
        let root = tempfile::tempdir().unwrap();
        let cache = root.path().join("stats-cache.json");
        fs::write(&cache, r#"{"totalSessions": 12}"#).unwrap();

        let aggregate = LocalUsageAggregator::new(root.path().join("projects"))
            .with_stats_cache(&cache)
            .aggregate_at(now(), Duration::hours(5));
        assert_eq!(aggregate.stats_cache, Some(serde_json::json!({"totalSessions": 12})));
    }

    #[test]
    fn fractional_window_hours() {
        assert_eq!(window_from_hours(5.0), Duration::hours(5));
        assert_eq!(window_from_hours(0.5), Duration::minutes(30));
    }

    #[test]
    fn unusable_window_hours_do_not_panic() {
        assert_eq!(window_from_hours(-2.0), Duration::zero());
        assert_eq!(window_from_hours(f64::NAN), Duration::zero());
        assert_eq!(window_from_hours(1e300), Duration::MAX);

        let root = tempfile::tempdir().unwrap();
        write_log(
            root.path(),
            "project",
            "events.jsonl",
            &[usage_line(now() - Duration::days(400), 7, 3)],
        );
        let aggregate = LocalUsageAggregator::new(root.path()).aggregate_at(now(), window_from_hours(1e300));
        assert_eq!(aggregate.totals.input_tokens, 7);
        assert_eq!(aggregate.window_start, DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn huge_token_counts_saturate() {
        let root = tempfile::tempdir().unwrap();
        write_log(
            root.path(),
            "project",
            "events.jsonl",
            &[
                r#"{"usage":{"input_tokens":18446744073709551615,"cache_creation_input_tokens":5}}"#.to_string(),
                r#"{"usage":{"input_tokens":1,"output_tokens":2}}"#.to_string(),
            ],
        );

        let aggregate = LocalUsageAggregator::new(root.path()).aggregate_at(now(), Duration::hours(5));
        assert_eq!(aggregate.record_count, 2);
        assert_eq!(aggregate.totals.input_tokens, u64::MAX);
        assert_eq!(aggregate.totals.output_tokens, 2);
        assert_eq!(aggregate.billable_input(), u64::MAX);
        assert_eq!(aggregate.billable_total(), u64::MAX);
        assert_eq!(aggregate.total(), u64::MAX);
        assert_eq!(aggregate.sessions["project"].input_tokens, u64::MAX);
    }
}
