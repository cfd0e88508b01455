//! Per-host load used for dispatch decisions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Load of a single host: number of queued or running jobs processed by its services.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub host: String,
    pub current: u32,
    pub max_jobs: u32,
}

impl NodeLoad {
    pub fn has_capacity(&self) -> bool {
        self.current < self.max_jobs
    }
}

/// Load of all known hosts keyed by base URL.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemLoad {
    nodes: BTreeMap<String, NodeLoad>,
}

impl SystemLoad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, host: &str, current: u32, max_jobs: u32) {
        self.nodes.insert(
            host.to_string(),
            NodeLoad {
                host: host.to_string(),
                current,
                max_jobs,
            },
        );
    }

    pub fn get(&self, host: &str) -> Option<&NodeLoad> {
        self.nodes.get(host)
    }

    /// Accounts for a job just handed to a service of the host.
    pub fn increment(&mut self, host: &str) {
        if let Some(node) = self.nodes.get_mut(host) {
            node.current += 1;
        }
    }
}
