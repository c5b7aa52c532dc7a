pub mod config;
pub mod monitor;
pub mod providers;
pub mod render;
pub mod scheduler;
pub mod snapshot;
pub mod storage;
pub mod timestamps;

pub use config::MonitorConfig;
pub use monitor::UsageMonitor;
pub use snapshot::CombinedSnapshot;
