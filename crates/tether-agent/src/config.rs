//! Runtime configuration

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tether_proto::MAX_PACKET_SIZE;

use crate::error::AgentError;
use crate::queue::DEFAULT_QUEUE_CAPACITY;

/// Startup configuration of the core runtime
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Transport URIs to attach at startup
    pub uris: Vec<String>,
    /// Fixed identity; a UUID is generated when absent
    pub identity: Option<String>,
    /// Disable core dumps
    pub no_dump: bool,
    /// Blank the process name
    pub hide_name: bool,
    /// Default keep-alive flag of new sessions
    pub keep_alive: bool,
    /// Delay before reopening a dropped keep-alive tunnel
    pub reconnect_delay_ms: u64,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Capacity of each child input and output queue
    pub queue_capacity: usize,
    /// Largest packet accepted or sent
    pub max_packet_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            uris: Vec::new(),
            identity: None,
            no_dump: false,
            hide_name: false,
            keep_alive: false,
            reconnect_delay_ms: 5000,
            log_level: "info".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl CoreConfig {
    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, AgentError> {
        serde_json::from_str(json).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Load a JSON file
    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Reconnect delay as a duration
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
