//! Time-pruned membership view of the node network.
//!
//! The registry is fed by the heartbeat observer and read by everything else.
//! An entry exists iff a heartbeat was seen within the last `node_lifetime`
//! (relative to "now" at the most recent prune). Pruning is lazy: it runs at
//! the top of every read, not on a background timer, so staleness is bounded
//! by access recency rather than wall-clock time.
//!
//! All mutation and reads serialize on one lock, held only for the registry
//! operation itself, never across a wait on the link. Callers always receive
//! copies of entries; nothing hands out a live reference that a concurrent
//! prune could tear.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::info;

use crate::wire::Heartbeat;
use crate::NodeId;

/// How long a node survives in the registry without a fresh heartbeat.
pub const DEFAULT_NODE_LIFETIME: Duration = Duration::from_secs(15);

/// Default window for "is this node alive right now" queries. Deliberately
/// tighter than the registry lifetime: presence means "seen recently",
/// aliveness means "seen just now".
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(3);

/// Everything observed about one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub node_id: NodeId,
    /// `major.minor.patch`, or "unknown" until discovery resolves it.
    pub sw_version: String,
    pub last_seen: Instant,
    pub heartbeat: Heartbeat,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<NodeId, NodeRecord>,
}

pub struct NodeRegistry {
    inner: Mutex<Inner>,
    node_lifetime: Duration,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_NODE_LIFETIME)
    }
}

impl NodeRegistry {
    pub fn new(node_lifetime: Duration) -> Self {
        NodeRegistry {
            inner: Mutex::new(Inner::default()),
            node_lifetime,
        }
    }

    /// Feeds one heartbeat into the view. First sighting of a node logs the
    /// online transition.
    pub fn observe_heartbeat(&self, hb: &Heartbeat) {
        self.observe_heartbeat_at(hb, Instant::now());
    }

    fn observe_heartbeat_at(&self, hb: &Heartbeat, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.nodes.entry(hb.node_id);
        match entry {
            std::collections::hash_map::Entry::Vacant(slot) => {
                info!("node {} online", hb.node_id);
                slot.insert(NodeRecord {
                    node_id: hb.node_id,
                    sw_version: "unknown".to_string(),
                    last_seen: now,
                    heartbeat: *hb,
                });
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                // Refresh liveness and payload; resolved attributes like the
                // firmware version are kept, never regressed to unknown.
                let record = slot.get_mut();
                record.last_seen = now;
                record.heartbeat = *hb;
            }
        }
    }

    /// Drops every entry whose heartbeat is older than the node lifetime,
    /// logging the offline transition per node.
    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }

    fn prune_at(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let lifetime = self.node_lifetime;
        inner.nodes.retain(|node_id, record| {
            let live = now.duration_since(record.last_seen) < lifetime;
            if !live {
                info!("node {node_id} offline");
            }
            live
        });
    }

    /// Ids of every node currently considered present.
    pub fn available_nodes(&self) -> Vec<NodeId> {
        self.available_nodes_at(Instant::now())
    }

    fn available_nodes_at(&self, now: Instant) -> Vec<NodeId> {
        self.prune_at(now);
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<NodeId> = inner.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    /// True iff a heartbeat from `node_id` arrived within `window`.
    pub fn is_alive(&self, node_id: NodeId, window: Duration) -> bool {
        self.is_alive_at(node_id, window, Instant::now())
    }

    fn is_alive_at(&self, node_id: NodeId, window: Duration, now: Instant) -> bool {
        self.prune_at(now);
        let inner = self.inner.lock().unwrap();
        match inner.nodes.get(&node_id) {
            Some(record) => now.duration_since(record.last_seen) < window,
            None => false,
        }
    }

    pub fn last_heartbeat(&self, node_id: NodeId) -> Option<Heartbeat> {
        self.prune_at(Instant::now());
        let inner = self.inner.lock().unwrap();
        inner.nodes.get(&node_id).map(|record| record.heartbeat)
    }

    /// Snapshot of one node's record.
    pub fn record(&self, node_id: NodeId) -> Option<NodeRecord> {
        self.prune_at(Instant::now());
        let inner = self.inner.lock().unwrap();
        inner.nodes.get(&node_id).cloned()
    }

    /// Backfills the firmware version once discovery has resolved it.
    pub fn set_sw_version(&self, node_id: NodeId, version: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.nodes.get_mut(&node_id) {
            record.sw_version = version.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hb(id: u64, boot_count: u32) -> Heartbeat {
        Heartbeat {
            node_id: NodeId(id),
            boot_count,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn present_after_heartbeat_absent_after_lifetime() {
        let reg = NodeRegistry::new(Duration::from_secs(15));
        let t0 = Instant::now();
        reg.observe_heartbeat_at(&hb(1, 1), t0);

        assert_eq!(reg.available_nodes_at(t0), vec![NodeId(1)]);
        // One tick short of the lifetime: still present.
        assert_eq!(
            reg.available_nodes_at(t0 + Duration::from_millis(14_999)),
            vec![NodeId(1)]
        );
        // At exactly the lifetime: pruned.
        assert!(reg
            .available_nodes_at(t0 + Duration::from_secs(15))
            .is_empty());
    }

    #[test]
    fn fresh_heartbeat_extends_lifetime() {
        let reg = NodeRegistry::new(Duration::from_secs(15));
        let t0 = Instant::now();
        reg.observe_heartbeat_at(&hb(1, 1), t0);
        reg.observe_heartbeat_at(&hb(1, 1), t0 + Duration::from_secs(10));
        assert_eq!(
            reg.available_nodes_at(t0 + Duration::from_secs(20)),
            vec![NodeId(1)]
        );
    }

    #[test]
    fn liveness_window_is_tighter_than_presence() {
        let reg = NodeRegistry::new(Duration::from_secs(15));
        let t0 = Instant::now();
        reg.observe_heartbeat_at(&hb(1, 1), t0);

        let t5 = t0 + Duration::from_secs(5);
        // Still present in the registry...
        assert_eq!(reg.available_nodes_at(t5), vec![NodeId(1)]);
        // ...but stale for a 3 s liveness window.
        assert!(!reg.is_alive_at(NodeId(1), Duration::from_secs(3), t5));
        assert!(reg.is_alive_at(NodeId(1), Duration::from_secs(6), t5));
    }

    #[test]
    fn prune_only_drops_stale_entries() {
        let reg = NodeRegistry::new(Duration::from_secs(15));
        let t0 = Instant::now();
        reg.observe_heartbeat_at(&hb(1, 1), t0);
        reg.observe_heartbeat_at(&hb(2, 1), t0 + Duration::from_secs(10));
        assert_eq!(
            reg.available_nodes_at(t0 + Duration::from_secs(16)),
            vec![NodeId(2)]
        );
    }

    #[test]
    fn heartbeat_refresh_keeps_resolved_version() {
        let reg = NodeRegistry::new(Duration::from_secs(15));
        let t0 = Instant::now();
        reg.observe_heartbeat_at(&hb(1, 1), t0);
        reg.set_sw_version(NodeId(1), "1.2.3");
        reg.observe_heartbeat_at(&hb(1, 2), t0 + Duration::from_secs(1));

        let record = reg.record(NodeId(1)).unwrap();
        assert_eq!(record.sw_version, "1.2.3");
        assert_eq!(record.heartbeat.boot_count, 2);
    }

    #[test]
    fn unknown_node_is_not_alive() {
        let reg = NodeRegistry::default();
        assert!(!reg.is_alive(NodeId(99), DEFAULT_LIVENESS_WINDOW));
        assert_eq!(reg.last_heartbeat(NodeId(99)), None);
    }
}
