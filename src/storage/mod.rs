pub mod keyring;

pub use self::keyring::{CredentialsFile, PlatformSecretStore, SecretSource};
