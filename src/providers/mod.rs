pub mod cookies;
pub mod credentials;
pub mod local;
pub mod traits;
pub mod web;

pub use cookies::ChromeCookieStore;
pub use credentials::{CredentialError, CredentialStore};
pub use local::{LocalUsageAggregator, RollingWindowAggregate, TokenTotals};
pub use traits::*;
pub use web::{RemoteUsage, RemoteUsageError, WebUsageClient};
