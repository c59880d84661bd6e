// Per-node configuration: a plain `serde::Deserialize` struct loadable
// from TOML via the `toml` crate, with a `Default` giving every field a
// safe single-node/test value. Fixed for the node's lifetime — there is no
// dynamic reload; changing replication factor or retry bounds means
// restarting the node, consistent with the invariant that application sets
// are fixed cluster-wide.

use std::time::Duration;

use serde::Deserialize;

use beehive_app::OutboundPolicy;
use beehive_exec::ExecConfig;
use beehive_net::NodeID;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    pub node: NodeID,
    pub replication_factor: u32,
    pub outbound_policy: OutboundPolicy,
    pub exec: ExecConfig,
    /// Load cap `beehive-failover`'s placement heuristic enforces for this
    /// node.
    pub max_node_load: u32,
    shutdown_drain_millis: u64,
}

impl HiveConfig {
    pub fn single_node(node: NodeID) -> Self {
        HiveConfig {
            node,
            ..Self::default()
        }
    }

    pub fn from_toml(text: &str) -> beehive_base::Result<Self> {
        toml::from_str(text).map_err(beehive_base::Error::from)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_millis)
    }
}

impl Default for HiveConfig {
    fn default() -> Self {
        HiveConfig {
            node: NodeID(1),
            replication_factor: 1,
            outbound_policy: OutboundPolicy::default(),
            exec: ExecConfig::default(),
            max_node_load: 64,
            shutdown_drain_millis: 250,
        }
    }
}
