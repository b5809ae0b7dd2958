//! Coordinator configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Entries kept in the parameter history unless configured otherwise.
pub const DEFAULT_HISTORY_CAPACITY: usize = 30;

/// Settings for a [`Master`](crate::Master).
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Device store file.
    pub device_db: PathBuf,
    /// Parameter store file.
    pub parameter_db: PathBuf,
    /// Number of parameter writes kept in history.
    pub history_capacity: usize,
    /// Longest the coordinator sleeps when nothing is due.
    pub max_sleep: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            device_db: PathBuf::from("ddb.json"),
            parameter_db: PathBuf::from("pdb.json"),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            max_sleep: Duration::from_secs(60),
        }
    }
}
