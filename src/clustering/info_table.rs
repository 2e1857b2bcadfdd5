//! Per-neighbor information table.
//!
//! A plain sequence of observation rows. Inserts never deduplicate; the
//! periodic scan is responsible for dropping stale rows, so several rows
//! for the same peer can coexist between scans. The table's size doubles
//! as the node's cluster degree in the head-vs-head tie-break.

use embassy_time::{Duration, Instant};

use crate::clustering::message::NodeId;
use crate::clustering::role::NodeRole;

/// One observation of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRow {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub entry_time: Instant,
}

impl InfoRow {
    pub fn new(node_id: NodeId, role: NodeRole, entry_time: Instant) -> Self {
        Self {
            node_id,
            role,
            entry_time,
        }
    }
}

#[derive(Debug, Default)]
pub struct InformationTable {
    rows: Vec<InfoRow>,
}

impl InformationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row as-is.
    pub fn insert(&mut self, row: InfoRow) {
        self.rows.push(row);
    }

    /// Replace every row for `node_id` with a single fresh observation.
    pub fn upsert(&mut self, node_id: NodeId, role: NodeRole, now: Instant) {
        self.rows.retain(|row| row.node_id != node_id);
        self.rows.push(InfoRow::new(node_id, role, now));
    }

    /// Drop rows older than `max_age`.
    pub fn scan(&mut self, now: Instant, max_age: Duration) {
        self.rows.retain(|row| now.saturating_duration_since(row.entry_time) <= max_age);
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn count_heads(&self) -> usize {
        self.rows.iter().filter(|row| row.role == NodeRole::ClusterHead).count()
    }

    pub fn count_members_or_gateways(&self) -> usize {
        self.rows.iter().filter(|row| row.role.is_member_like()).count()
    }

    pub fn contains_gateway(&self) -> bool {
        self.rows.iter().any(|row| row.role == NodeRole::ClusterGateway)
    }

    pub fn first_head_id(&self) -> Option<NodeId> {
        self.rows
            .iter()
            .find(|row| row.role == NodeRole::ClusterHead)
            .map(|row| row.node_id)
    }

    /// Every distinct head currently present, in first-seen order.
    pub fn all_head_ids(&self) -> Vec<NodeId> {
        let mut heads = Vec::new();
        for row in &self.rows {
            if row.role == NodeRole::ClusterHead && !heads.contains(&row.node_id) {
                heads.push(row.node_id);
            }
        }
        heads
    }

    pub fn rows(&self) -> &[InfoRow] {
        &self.rows
    }
}
