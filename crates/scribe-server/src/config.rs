//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the server role.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// Directory the server serves from.
    pub root_dir: PathBuf,
    /// Staging directory for received file transfers.
    pub temp_dir: PathBuf,
    /// Poll tick for the event loop; bounds shutdown latency.
    pub poll_interval: Duration,
    /// Read buffer size per connection.
    pub read_buffer_size: usize,
}

impl ServerConfig {
    /// Creates a configuration with defaults for everything but the
    /// listening port and served root.
    pub fn new(port: u16, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            port,
            root_dir: root_dir.into(),
            temp_dir: PathBuf::from(".proj2_temp"),
            poll_interval: Duration::from_millis(100),
            read_buffer_size: 4096,
        }
    }

    /// Sets the transfer staging directory.
    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }
}
