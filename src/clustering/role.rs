//! Node roles in the cluster overlay.

use std::fmt;

/// The role a node currently plays in the self-organizing overlay.
///
/// The wire encoding (0..=5) follows the original enum order and must not
/// be reordered: peers store the raw discriminant in their information
/// tables and routing decisions key off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Unspecified,
    ClusterHead,
    ClusterMember,
    ClusterGateway,
    Standalone,
    ClusterGuest,
}

impl NodeRole {
    /// Wire discriminant used in packets and information-table rows.
    pub fn to_wire(self) -> u8 {
        match self {
            NodeRole::Unspecified => 0,
            NodeRole::ClusterHead => 1,
            NodeRole::ClusterMember => 2,
            NodeRole::ClusterGateway => 3,
            NodeRole::Standalone => 4,
            NodeRole::ClusterGuest => 5,
        }
    }

    /// Inverse of [`to_wire`](Self::to_wire). `None` for out-of-range values.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(NodeRole::Unspecified),
            1 => Some(NodeRole::ClusterHead),
            2 => Some(NodeRole::ClusterMember),
            3 => Some(NodeRole::ClusterGateway),
            4 => Some(NodeRole::Standalone),
            5 => Some(NodeRole::ClusterGuest),
            _ => None,
        }
    }

    /// Short label used in event logs and CSV rows.
    pub fn label(self) -> &'static str {
        match self {
            NodeRole::Unspecified => "Unspecified",
            NodeRole::ClusterHead => "CH",
            NodeRole::ClusterMember => "CM",
            NodeRole::ClusterGateway => "GW",
            NodeRole::Standalone => "Standalone",
            NodeRole::ClusterGuest => "CG",
        }
    }

    /// True for roles that can serve as an attachment point for a guest.
    pub fn is_member_like(self) -> bool {
        matches!(self, NodeRole::ClusterMember | NodeRole::ClusterGateway)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
