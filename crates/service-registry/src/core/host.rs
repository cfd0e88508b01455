//! Worker host registration.

use serde::{Deserialize, Serialize};

/// Represents a worker host known to the registry.
///
/// Hosts are keyed by their base URL and are never deleted, only deactivated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostRegistration {
    pub base_url: String,
    pub ip_address: String,
    pub node_name: String,
    /// Memory in bytes.
    pub memory: u64,
    pub cores: u32,
    /// Maximum number of jobs the host processes concurrently.
    pub max_jobs: u32,
    pub online: bool,
    pub maintenance: bool,
    pub active: bool,
    pub version: u64,
}

impl HostRegistration {
    pub fn new(base_url: &str, ip_address: &str, node_name: &str, memory: u64, cores: u32, max_jobs: u32) -> Self {
        Self {
            base_url: base_url.to_string(),
            ip_address: ip_address.to_string(),
            node_name: node_name.to_string(),
            memory,
            cores,
            max_jobs,
            online: true,
            maintenance: false,
            active: true,
            version: 0,
        }
    }

    /// Returns whether jobs may be sent to services of this host.
    pub fn is_dispatch_target(&self) -> bool {
        self.active && self.online && !self.maintenance
    }
}

impl std::fmt::Display for HostRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "host {}", self.base_url)
    }
}
