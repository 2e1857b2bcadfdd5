//! Run statistics: event logs, counters, aggregations, CSV export.
//!
//! One `Stats` value is owned by the network task; nodes report through
//! `StatEvent`s on their output channel, so no global mutable state is
//! involved. Event lists are append-only; all pairing (claim/resign,
//! join/leave) happens post-run over the recorded sequences.

use std::io::{self, Write};

use crate::clustering::message::{MessageKind, NodeId};
use crate::clustering::role::NodeRole;

/// Head lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChEventKind {
    Claim,
    ReceiveStatus,
    Resign,
}

impl ChEventKind {
    fn label(self) -> &'static str {
        match self {
            ChEventKind::Claim => "CH_Claim",
            ChEventKind::ReceiveStatus => "Receive_Status",
            ChEventKind::Resign => "Resign",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChEvent {
    pub node: NodeId,
    pub time_s: f64,
    pub kind: ChEventKind,
}

/// Cluster membership events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEventKind {
    Join,
    Leave,
    IResign,
    BecomesStandalone,
}

impl MemberEventKind {
    fn label(self) -> &'static str {
        match self {
            MemberEventKind::Join => "Join Cluster",
            MemberEventKind::Leave => "Leave Cluster",
            MemberEventKind::IResign => "I Resign",
            MemberEventKind::BecomesStandalone => "Becomes Standalone",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberEvent {
    pub role_label: &'static str,
    pub node: NodeId,
    pub time_s: f64,
    pub kind: MemberEventKind,
    /// The head the membership refers to (the node itself for `IResign`).
    pub head: NodeId,
}

/// One statistics report from a node's state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum StatEvent {
    ChClaim {
        node: NodeId,
        time_s: f64,
    },
    ChReceiveStatus {
        node: NodeId,
        time_s: f64,
    },
    /// Also records the coupled "I Resign" membership event, which closes
    /// every open membership under this head in the lifetime accounting.
    ChResign {
        node: NodeId,
        time_s: f64,
    },
    Join {
        role: NodeRole,
        node: NodeId,
        time_s: f64,
        head: NodeId,
    },
    Leave {
        role: NodeRole,
        node: NodeId,
        time_s: f64,
        head: NodeId,
    },
    BecomesStandalone {
        node: NodeId,
        time_s: f64,
    },
    /// A protocol message handed to the transport.
    MessageSent,
    /// A deduplicated protocol message delivered to a handler.
    MessageReceived {
        kind: MessageKind,
    },
    /// A role transition on some node.
    ClusterChange,
    /// One periodic role sample. `cluster_size` is reported by heads,
    /// `covering_heads` by gateways, `access_points` by guests.
    RoleSample {
        role: NodeRole,
        cluster_size: u64,
        covering_heads: u64,
        access_points: u64,
    },
}

#[derive(Debug, Default)]
pub struct Stats {
    ch_events: Vec<ChEvent>,
    member_events: Vec<MemberEvent>,

    pings: u64,
    claims: u64,
    statuses: u64,
    meetings: u64,
    resigns: u64,
    inquiries: u64,

    clustering_messages: u64,
    cluster_change_messages: u64,

    sampled_heads: u64,
    sampled_members: u64,
    sampled_gateways: u64,
    sampled_guests: u64,
    sampled_cluster_size: u64,
    sampled_heads_covering_gateways: u64,
    sampled_access_points: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: StatEvent) {
        match event {
            StatEvent::ChClaim { node, time_s } => {
                self.ch_events.push(ChEvent {
                    node,
                    time_s,
                    kind: ChEventKind::Claim,
                });
            }
            StatEvent::ChReceiveStatus { node, time_s } => {
                self.ch_events.push(ChEvent {
                    node,
                    time_s,
                    kind: ChEventKind::ReceiveStatus,
                });
            }
            StatEvent::ChResign { node, time_s } => {
                self.ch_events.push(ChEvent {
                    node,
                    time_s,
                    kind: ChEventKind::Resign,
                });
                self.member_events.push(MemberEvent {
                    role_label: NodeRole::ClusterHead.label(),
                    node,
                    time_s,
                    kind: MemberEventKind::IResign,
                    head: node,
                });
            }
            StatEvent::Join {
                role,
                node,
                time_s,
                head,
            } => {
                self.member_events.push(MemberEvent {
                    role_label: role.label(),
                    node,
                    time_s,
                    kind: MemberEventKind::Join,
                    head,
                });
            }
            StatEvent::Leave {
                role,
                node,
                time_s,
                head,
            } => {
                self.member_events.push(MemberEvent {
                    role_label: role.label(),
                    node,
                    time_s,
                    kind: MemberEventKind::Leave,
                    head,
                });
            }
            StatEvent::BecomesStandalone { node, time_s } => {
                self.member_events.push(MemberEvent {
                    role_label: NodeRole::Standalone.label(),
                    node,
                    time_s,
                    kind: MemberEventKind::BecomesStandalone,
                    head: 0,
                });
            }
            StatEvent::MessageSent => self.clustering_messages += 1,
            StatEvent::MessageReceived { kind } => match kind {
                MessageKind::Ping => self.pings += 1,
                MessageKind::Claim => self.claims += 1,
                MessageKind::Status => self.statuses += 1,
                MessageKind::Meeting => self.meetings += 1,
                MessageKind::Resign => self.resigns += 1,
                MessageKind::Inquiry => self.inquiries += 1,
            },
            StatEvent::ClusterChange => self.cluster_change_messages += 1,
            StatEvent::RoleSample {
                role,
                cluster_size,
                covering_heads,
                access_points,
            } => {
                match role {
                    NodeRole::ClusterHead => self.sampled_heads += 1,
                    NodeRole::ClusterMember => self.sampled_members += 1,
                    NodeRole::ClusterGateway => self.sampled_gateways += 1,
                    NodeRole::ClusterGuest => self.sampled_guests += 1,
                    NodeRole::Standalone | NodeRole::Unspecified => {}
                }
                self.sampled_cluster_size += cluster_size;
                self.sampled_heads_covering_gateways += covering_heads;
                self.sampled_access_points += access_points;
            }
        }
    }

    pub fn ch_events(&self) -> &[ChEvent] {
        &self.ch_events
    }

    pub fn member_events(&self) -> &[MemberEvent] {
        &self.member_events
    }

    /// Average cluster size by the formula `(a + b + Σnᵢ + Σmⱼ) / a`,
    /// where `a` is the sampled head count, `b` the sampled member count,
    /// `nᵢ` the heads covering each sampled gateway, and `mⱼ` the access
    /// points of each sampled guest.
    pub fn average_cluster_size_formula(&self) -> f64 {
        if self.sampled_heads == 0 {
            return 0.0;
        }
        let numerator = (self.sampled_heads
            + self.sampled_members
            + self.sampled_heads_covering_gateways
            + self.sampled_access_points) as f64;
        numerator / self.sampled_heads as f64
    }

    /// Average head lifetime: each claim pairs with that node's next
    /// resign; claims still open at `end_s` are charged until then.
    pub fn average_ch_lifetime(&self, end_s: f64) -> f64 {
        let mut open: Vec<(NodeId, f64)> = Vec::new();
        let mut total = 0.0;
        let mut matches = 0u32;

        for event in &self.ch_events {
            match event.kind {
                ChEventKind::Claim => open.push((event.node, event.time_s)),
                ChEventKind::Resign => {
                    open.retain(|&(node, claim_time)| {
                        if node == event.node {
                            total += event.time_s - claim_time;
                            matches += 1;
                            false
                        } else {
                            true
                        }
                    });
                }
                ChEventKind::ReceiveStatus => {}
            }
        }
        for &(_, claim_time) in &open {
            total += end_s - claim_time;
            matches += 1;
        }

        if matches == 0 { 0.0 } else { total / f64::from(matches) }
    }

    /// Average membership lifetime: each leave closes the earliest open
    /// join for the same (node, head) pair; a head's "I Resign" closes
    /// every open membership under it; memberships open at `end_s` are
    /// charged until then.
    pub fn average_membership_lifetime(&self, end_s: f64) -> f64 {
        let mut open: Vec<(NodeId, f64, NodeId)> = Vec::new();
        let mut total = 0.0;
        let mut matches = 0u32;

        for event in &self.member_events {
            match event.kind {
                MemberEventKind::Join => open.push((event.node, event.time_s, event.head)),
                MemberEventKind::Leave => {
                    // A node can hold several open entries for one head
                    // (a gateway's membership may be re-announced); only
                    // the earliest pairs with this leave.
                    let earliest = open
                        .iter()
                        .enumerate()
                        .filter(|&(_, &(node, _, head))| node == event.node && head == event.head)
                        .min_by(|(_, a), (_, b)| a.1.total_cmp(&b.1))
                        .map(|(index, _)| index);
                    if let Some(index) = earliest {
                        let (_, join_time, _) = open.swap_remove(index);
                        total += event.time_s - join_time;
                        matches += 1;
                    }
                }
                MemberEventKind::IResign => {
                    open.retain(|&(_, join_time, head)| {
                        if head == event.node {
                            total += event.time_s - join_time;
                            matches += 1;
                            false
                        } else {
                            true
                        }
                    });
                }
                MemberEventKind::BecomesStandalone => {}
            }
        }
        for &(_, join_time, _) in &open {
            total += end_s - join_time;
            matches += 1;
        }

        if matches == 0 { 0.0 } else { total / f64::from(matches) }
    }

    /// One CSV row per head event: role, node, time, event.
    pub fn write_ch_events(&self, writer: &mut impl Write) -> io::Result<()> {
        for event in &self.ch_events {
            writeln!(
                writer,
                "CH,{},{},{}",
                event.node,
                event.time_s,
                event.kind.label()
            )?;
        }
        Ok(())
    }

    /// One CSV row per membership event: role, node, time, event, head.
    pub fn write_member_events(&self, writer: &mut impl Write) -> io::Result<()> {
        for event in &self.member_events {
            writeln!(
                writer,
                "{},{},{},{},{}",
                event.role_label,
                event.node,
                event.time_s,
                event.kind.label(),
                event.head
            )?;
        }
        Ok(())
    }

    /// Append the run summary row to a FinalStats CSV.
    ///
    /// Per-role averages are sums over the one-per-minute role samples
    /// divided by the number of sampling rounds in `runtime_s`.
    pub fn write_final_stats(
        &self,
        writer: &mut impl Write,
        runtime_s: f64,
        num_nodes: u32,
        node_speed: f64,
        seed: u64,
    ) -> io::Result<()> {
        let rounds = (runtime_s / 60.0).max(1.0);
        writeln!(
            writer,
            "{},{},{},{},{},{},{},{},{},{},{},{},{}",
            seed,
            num_nodes,
            node_speed,
            self.sampled_cluster_size as f64 / rounds,
            self.average_cluster_size_formula(),
            self.sampled_heads as f64 / rounds,
            self.sampled_members as f64 / rounds,
            self.sampled_gateways as f64 / rounds,
            self.sampled_guests as f64 / rounds,
            self.cluster_change_messages,
            self.clustering_messages,
            self.average_ch_lifetime(runtime_s),
            self.average_membership_lifetime(runtime_s)
        )
    }

    /// Log the received-message totals at info level.
    pub fn log_totals(&self) {
        log::info!(
            "message totals: pings={} claims={} statuses={} meetings={} resigns={} inquiries={}",
            self.pings,
            self.claims,
            self.statuses,
            self.meetings,
            self.resigns,
            self.inquiries
        );
        log::info!(
            "clustering messages sent={} role changes={}",
            self.clustering_messages,
            self.cluster_change_messages
        );
    }
}
