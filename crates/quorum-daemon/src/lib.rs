pub mod config;
pub mod daemon;
pub mod error;

pub use config::{DaemonConfig, DaemonSettings};
pub use daemon::Daemon;
pub use error::DaemonError;
