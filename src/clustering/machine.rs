//! The per-node clustering state machine.
//!
//! One `ClusterMachine` instance runs per node. It is fully synchronous:
//! the owning task feeds it received frames and wakes it when its earliest
//! timer is due, and it answers with a batch of [`Action`]s (messages to
//! send, statistics to report). All randomness comes from a seeded
//! per-node stream so runs are reproducible.
//!
//! Protocol outline: after a randomized wakeup delay a node claims
//! cluster headship unless a claim arrived first, in which case it joins
//! as a member. Heads that hear each other exchange MEETING messages and
//! the smaller cluster resigns. Periodic hellos keep neighbor tables
//! fresh; a scan evicts stale rows; heads with shrunken clusters resign
//! in favor of a gateway.

use std::collections::HashSet;

use embassy_time::{Duration, Instant};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clustering::info_table::{InfoRow, InformationTable};
use crate::clustering::message::{Message, MessageIdStream, MessageKind, NodeId};
use crate::clustering::neighbor_table::NeighborTable;
use crate::clustering::role::NodeRole;
use crate::clustering::stats::StatEvent;
use crate::clustering::timer_queue::TimerQueue;

/// Number of neighbor-table generations kept for the change-degree metric.
const NEIGHBOR_GENERATIONS: usize = 2;

/// Delay between a scan observing head state and the resign check.
const CH_RESIGN_CHECK_DELAY: Duration = Duration::from_secs(3);

/// Role sampling: first sample time, period, and the warm-up guard before
/// which samples are discarded.
const ROLE_SAMPLE_START: Duration = Duration::from_secs(57);
const ROLE_SAMPLE_PERIOD: Duration = Duration::from_secs(60);
const ROLE_SAMPLE_GUARD_MS: u64 = 55_000;

/// Bounds of the re-claim delay drawn when a node finds itself headless.
const RECLAIM_DELAY_MIN_S: f64 = 0.1;
const RECLAIM_DELAY_MAX_S: f64 = 0.5;

/// Tunables of the clustering protocol.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Neighborhood hop count (H), the broadcast TTL.
    pub hops: u32,
    /// Lower bound of the wakeup delay.
    pub wait_time: Duration,
    /// Upper bound of the wakeup delay; also the end of the standoff
    /// window in absolute simulation time.
    pub standoff_time: Duration,
    /// Period of the routing-layer snapshot refresh.
    pub profile_delay: Duration,
    /// Hello broadcast period after wakeup.
    pub hello_message_timeout: Duration,
    /// Information/neighbor table refresh period.
    pub table_scan_timeout: Duration,
    /// Freshness window for information-table rows.
    pub valid_entry_timeout: Duration,
    /// Cluster size at or below which a covered head resigns.
    pub resign_threshold: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hops: 1,
            wait_time: Duration::from_secs(30),
            standoff_time: Duration::from_secs(3),
            profile_delay: Duration::from_secs(6),
            hello_message_timeout: Duration::from_secs(1),
            table_scan_timeout: Duration::from_millis(100),
            valid_entry_timeout: Duration::from_millis(2300),
            resign_threshold: 5,
        }
    }
}

/// Pending timer events of one machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerEvent {
    SendClaim,
    Hello,
    Scan,
    CheckChResign,
    RoleSample,
    RefreshRouting,
}

/// Output of a machine step, executed by the owning task.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Flood to the H-hop neighborhood.
    Broadcast(Message),
    /// Send to one peer.
    Unicast(NodeId, Message),
    /// Report to the run statistics.
    Stat(StatEvent),
    /// Ask the routing layer for a fresh table snapshot.
    RequestRoutingUpdate,
}

pub struct ClusterMachine {
    node_id: NodeId,
    config: ClusterConfig,
    role: NodeRole,
    info_table: InformationTable,
    neighbor_table: NeighborTable,
    seen_message_ids: HashSet<u64>,
    timers: TimerQueue<TimerEvent>,
    message_ids: MessageIdStream,
    rng: StdRng,
    /// Set while this node is an announced head awaiting statuses.
    ch_claim_flag: bool,
    /// The head this node currently belongs to, when it is a member.
    current_head: Option<NodeId>,
    /// Latest routing-table text received from the routing layer.
    routing_snapshot: Option<String>,
}

impl ClusterMachine {
    pub fn new(
        node_id: NodeId,
        config: ClusterConfig,
        message_ids: MessageIdStream,
        rng_seed: u64,
    ) -> Self {
        let hops = config.hops;
        Self {
            node_id,
            config,
            role: NodeRole::Unspecified,
            info_table: InformationTable::new(),
            neighbor_table: NeighborTable::new(NEIGHBOR_GENERATIONS, hops),
            seen_message_ids: HashSet::new(),
            timers: TimerQueue::new(),
            message_ids,
            rng: StdRng::seed_from_u64(rng_seed),
            ch_claim_flag: false,
            current_head: None,
            routing_snapshot: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn info_table(&self) -> &InformationTable {
        &self.info_table
    }

    pub fn neighbor_table(&self) -> &NeighborTable {
        &self.neighbor_table
    }

    pub fn seen_message_count(&self) -> usize {
        self.seen_message_ids.len()
    }

    /// Earliest pending timer; the owning task sleeps until then.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Store the latest routing-layer snapshot for the next scan.
    pub fn update_routing_snapshot(&mut self, table_text: String) {
        self.routing_snapshot = Some(table_text);
    }

    /// Enter the protocol: draw the wakeup delay and schedule the initial
    /// timers. Returns the initial actions (a routing snapshot request).
    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        self.role = NodeRole::Unspecified;

        let lo = self.config.wait_time.as_micros() as f64 / 1e6;
        let hi = self.config.standoff_time.as_micros() as f64 / 1e6;
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        let delay_s: f64 = self.rng.gen_range(lo..=hi);
        let wakeup = now + duration_from_secs_f64(delay_s);

        self.timers.schedule(wakeup, TimerEvent::SendClaim);
        self.timers
            .schedule(wakeup + self.config.hello_message_timeout, TimerEvent::Hello);
        self.timers.schedule(
            wakeup + self.config.hello_message_timeout + self.config.table_scan_timeout,
            TimerEvent::Scan,
        );
        self.timers.schedule(now + ROLE_SAMPLE_START, TimerEvent::RoleSample);
        self.timers
            .schedule(now + self.config.profile_delay, TimerEvent::RefreshRouting);

        vec![Action::RequestRoutingUpdate]
    }

    /// Cancel every pending timer. Called at node stop.
    pub fn stop(&mut self) {
        self.timers.clear();
    }

    /// Run every timer due at or before `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        while let Some(event) = self.timers.pop_due(now) {
            match event {
                TimerEvent::SendClaim => self.fire_send_claim(now, &mut actions),
                TimerEvent::Hello => self.fire_hello(now, &mut actions),
                TimerEvent::Scan => self.fire_scan(now, &mut actions),
                TimerEvent::CheckChResign => self.fire_check_ch_resign(now, &mut actions),
                TimerEvent::RoleSample => self.fire_role_sample(now, &mut actions),
                TimerEvent::RefreshRouting => {
                    actions.push(Action::RequestRoutingUpdate);
                    self.timers
                        .schedule(now + self.config.profile_delay, TimerEvent::RefreshRouting);
                }
            }
        }
        actions
    }

    /// Parse, deduplicate, and dispatch one received frame.
    pub fn handle_packet(&mut self, from: NodeId, frame: &[u8], now: Instant) -> Vec<Action> {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(error) => {
                log::warn!("node {}: malformed message from {}: {}", self.node_id, from, error);
                return Vec::new();
            }
        };

        if !self.seen_message_ids.insert(message.id) {
            log::trace!("node {}: duplicate message {} dropped", self.node_id, message.id);
            return Vec::new();
        }

        let mut actions = vec![Action::Stat(StatEvent::MessageReceived { kind: message.kind })];
        match message.kind {
            MessageKind::Ping => self.handle_ping(from, message.sender_role, now, &mut actions),
            MessageKind::Claim => self.handle_claim(from, now, &mut actions),
            MessageKind::Status => self.handle_status(from, message.sender_role, now, &mut actions),
            MessageKind::Meeting => {
                let sender_size = message.table_size.unwrap_or(0);
                self.handle_meeting(from, sender_size, now, &mut actions);
            }
            MessageKind::Resign => self.handle_resign(from, message.sender_role, now, &mut actions),
            MessageKind::Inquiry => self.handle_inquiry(from, message.sender_role, now, &mut actions),
        }
        actions
    }

    // ---------- timer handlers ----------

    fn fire_send_claim(&mut self, now: Instant, actions: &mut Vec<Action>) {
        self.set_role(NodeRole::ClusterHead, actions);
        self.current_head = None;
        self.ch_claim_flag = true;
        self.broadcast(MessageKind::Claim, None, now, actions);
        actions.push(Action::Stat(StatEvent::ChClaim {
            node: self.node_id,
            time_s: time_s(now),
        }));
        log::debug!("node {}: claiming cluster headship", self.node_id);
    }

    fn fire_hello(&mut self, now: Instant, actions: &mut Vec<Action>) {
        self.broadcast(MessageKind::Ping, None, now, actions);
        self.timers
            .schedule(now + self.config.hello_message_timeout, TimerEvent::Hello);
    }

    fn fire_scan(&mut self, now: Instant, actions: &mut Vec<Action>) {
        if let Some(text) = self.routing_snapshot.take() {
            self.neighbor_table.update(&text);
        }
        let heads_before = self.info_table.all_head_ids();
        self.info_table.scan(now, self.config.valid_entry_timeout);
        self.enforce_role_invariants(&heads_before, now, actions);

        if self.role == NodeRole::ClusterHead && !self.timers.has_event(&TimerEvent::CheckChResign) {
            self.timers.schedule(now + CH_RESIGN_CHECK_DELAY, TimerEvent::CheckChResign);
        }
        self.timers
            .schedule(now + self.config.table_scan_timeout, TimerEvent::Scan);
    }

    /// Demote roles whose supporting table rows expired: a gateway needs
    /// two heads, a guest needs a member or gateway to reach a cluster
    /// through.
    fn enforce_role_invariants(&mut self, heads_before: &[NodeId], now: Instant, actions: &mut Vec<Action>) {
        match self.role {
            NodeRole::ClusterGateway => {
                let heads = self.info_table.all_head_ids();
                if heads.len() >= 2 {
                    return;
                }
                for &vanished in heads_before.iter().filter(|head| !heads.contains(head)) {
                    actions.push(Action::Stat(StatEvent::Leave {
                        role: NodeRole::ClusterGateway,
                        node: self.node_id,
                        time_s: time_s(now),
                        head: vanished,
                    }));
                }
                if let [remaining] = heads[..] {
                    self.set_role(NodeRole::ClusterMember, actions);
                    self.current_head = Some(remaining);
                } else if self.info_table.count_members_or_gateways() >= 1 {
                    self.set_role(NodeRole::ClusterGuest, actions);
                    self.current_head = None;
                } else {
                    self.set_role(NodeRole::Standalone, actions);
                    self.current_head = None;
                    actions.push(Action::Stat(StatEvent::BecomesStandalone {
                        node: self.node_id,
                        time_s: time_s(now),
                    }));
                }
            }
            NodeRole::ClusterGuest => {
                if self.info_table.count_heads() == 0
                    && self.info_table.count_members_or_gateways() == 0
                {
                    self.set_role(NodeRole::Standalone, actions);
                    actions.push(Action::Stat(StatEvent::BecomesStandalone {
                        node: self.node_id,
                        time_s: time_s(now),
                    }));
                }
            }
            _ => {}
        }
    }

    fn fire_check_ch_resign(&mut self, now: Instant, actions: &mut Vec<Action>) {
        if self.role != NodeRole::ClusterHead {
            return;
        }
        if self.info_table.is_empty() {
            // A head nobody answers is alone.
            self.set_role(NodeRole::Standalone, actions);
            self.ch_claim_flag = false;
            actions.push(Action::Stat(StatEvent::ChResign {
                node: self.node_id,
                time_s: time_s(now),
            }));
            actions.push(Action::Stat(StatEvent::BecomesStandalone {
                node: self.node_id,
                time_s: time_s(now),
            }));
            log::debug!("node {}: empty cluster, standing alone", self.node_id);
        } else if self.info_table.size() + 1 <= self.config.resign_threshold
            && self.info_table.contains_gateway()
        {
            // Small cluster already bridged by a gateway: fold into the
            // neighboring cluster as a guest.
            self.set_role(NodeRole::ClusterGuest, actions);
            self.ch_claim_flag = false;
            self.broadcast(MessageKind::Resign, None, now, actions);
            actions.push(Action::Stat(StatEvent::ChResign {
                node: self.node_id,
                time_s: time_s(now),
            }));
            log::debug!("node {}: resigning small gatewayed cluster", self.node_id);
        }
    }

    fn fire_role_sample(&mut self, now: Instant, actions: &mut Vec<Action>) {
        if now.as_millis() > ROLE_SAMPLE_GUARD_MS {
            let cluster_size = if self.role == NodeRole::ClusterHead {
                self.info_table.size() as u64 + 1
            } else {
                0
            };
            let covering_heads = if self.role == NodeRole::ClusterGateway {
                self.info_table.all_head_ids().len() as u64
            } else {
                0
            };
            let access_points = if self.role == NodeRole::ClusterGuest {
                self.info_table.count_members_or_gateways() as u64
            } else {
                0
            };
            actions.push(Action::Stat(StatEvent::RoleSample {
                role: self.role,
                cluster_size,
                covering_heads,
                access_points,
            }));
        }
        self.timers.schedule(now + ROLE_SAMPLE_PERIOD, TimerEvent::RoleSample);
    }

    // ---------- message handlers ----------

    fn handle_ping(&mut self, from: NodeId, sender_role: NodeRole, now: Instant, actions: &mut Vec<Action>) {
        self.info_table.upsert(from, sender_role, now);

        match (sender_role, self.role) {
            (NodeRole::ClusterHead, NodeRole::Unspecified)
            | (NodeRole::ClusterHead, NodeRole::Standalone)
            | (NodeRole::ClusterHead, NodeRole::ClusterGuest) => {
                self.join_as_member(from, now, actions);
                self.unicast(from, MessageKind::Status, None, now, actions);
            }
            (NodeRole::ClusterHead, NodeRole::ClusterHead) => {
                let size = self.info_table.size() as u64;
                self.unicast(from, MessageKind::Meeting, Some(size), now, actions);
            }
            (NodeRole::ClusterHead, NodeRole::ClusterMember) => {
                if self.current_head != Some(from) {
                    // A second head in range makes this member a bridge.
                    self.set_role(NodeRole::ClusterGateway, actions);
                    actions.push(Action::Stat(StatEvent::Join {
                        role: NodeRole::ClusterGateway,
                        node: self.node_id,
                        time_s: time_s(now),
                        head: from,
                    }));
                }
            }
            (NodeRole::ClusterHead, NodeRole::ClusterGateway) => {}
            (NodeRole::ClusterMember, my) | (NodeRole::ClusterGateway, my)
                if matches!(my, NodeRole::Unspecified | NodeRole::Standalone) =>
            {
                // No head in earshot, but a cluster is reachable through
                // this neighbor.
                self.set_role(NodeRole::ClusterGuest, actions);
                self.unicast(from, MessageKind::Status, None, now, actions);
            }
            _ => {}
        }
    }

    fn handle_claim(&mut self, from: NodeId, now: Instant, actions: &mut Vec<Action>) {
        self.info_table
            .insert(InfoRow::new(from, NodeRole::ClusterHead, now));
        self.timers.cancel_event(&TimerEvent::SendClaim);

        let in_standoff_window = now.as_micros() < self.config.standoff_time.as_micros();
        if in_standoff_window {
            match self.role {
                NodeRole::Unspecified => {
                    self.join_as_member(from, now, actions);
                    self.unicast(from, MessageKind::Status, None, now, actions);
                }
                NodeRole::ClusterMember => {
                    self.set_role(NodeRole::ClusterGateway, actions);
                    actions.push(Action::Stat(StatEvent::Join {
                        role: NodeRole::ClusterGateway,
                        node: self.node_id,
                        time_s: time_s(now),
                        head: from,
                    }));
                    self.unicast(from, MessageKind::Status, None, now, actions);
                }
                _ => self.unicast(from, MessageKind::Status, None, now, actions),
            }
        } else {
            match self.role {
                NodeRole::ClusterMember => {
                    self.set_role(NodeRole::ClusterGateway, actions);
                    actions.push(Action::Stat(StatEvent::Join {
                        role: NodeRole::ClusterGateway,
                        node: self.node_id,
                        time_s: time_s(now),
                        head: from,
                    }));
                    self.broadcast(MessageKind::Ping, None, now, actions);
                }
                NodeRole::Standalone | NodeRole::ClusterGuest => {
                    self.join_as_member(from, now, actions);
                    self.broadcast(MessageKind::Ping, None, now, actions);
                }
                _ => self.unicast(from, MessageKind::Status, None, now, actions),
            }
        }
    }

    fn handle_status(&mut self, from: NodeId, sender_role: NodeRole, now: Instant, actions: &mut Vec<Action>) {
        self.info_table.upsert(from, sender_role, now);
        if self.ch_claim_flag {
            actions.push(Action::Stat(StatEvent::ChReceiveStatus {
                node: self.node_id,
                time_s: time_s(now),
            }));
        }
    }

    /// Head-vs-head tie-break: the larger cluster keeps its head; on a
    /// tie the receiver resigns.
    fn handle_meeting(&mut self, from: NodeId, sender_size: u64, now: Instant, actions: &mut Vec<Action>) {
        if self.role != NodeRole::ClusterHead {
            log::error!(
                "node {}: MEETING from {} while not a cluster head, dropping",
                self.node_id,
                from
            );
            return;
        }

        let my_size = self.info_table.size() as u64;
        if sender_size >= my_size {
            self.set_role(NodeRole::ClusterMember, actions);
            self.ch_claim_flag = false;
            self.current_head = Some(from);
            self.broadcast(MessageKind::Resign, None, now, actions);
            self.broadcast(MessageKind::Ping, None, now, actions);
            actions.push(Action::Stat(StatEvent::Join {
                role: NodeRole::ClusterMember,
                node: self.node_id,
                time_s: time_s(now),
                head: from,
            }));
            actions.push(Action::Stat(StatEvent::ChResign {
                node: self.node_id,
                time_s: time_s(now),
            }));
            log::debug!(
                "node {}: lost tie-break against {} ({} >= {})",
                self.node_id,
                from,
                sender_size,
                my_size
            );
        } else {
            let size = self.info_table.size() as u64;
            self.unicast(from, MessageKind::Meeting, Some(size), now, actions);
        }
    }

    fn handle_resign(&mut self, from: NodeId, sender_role: NodeRole, now: Instant, actions: &mut Vec<Action>) {
        self.info_table.upsert(from, sender_role, now);

        if self.role == NodeRole::ClusterGateway {
            let old_role = self.role;
            let heads = self.info_table.all_head_ids();
            match heads.len() {
                1 => {
                    self.set_role(NodeRole::ClusterMember, actions);
                    self.current_head = Some(heads[0]);
                    actions.push(Action::Stat(StatEvent::Leave {
                        role: old_role,
                        node: self.node_id,
                        time_s: time_s(now),
                        head: from,
                    }));
                    actions.push(Action::Stat(StatEvent::Join {
                        role: NodeRole::ClusterMember,
                        node: self.node_id,
                        time_s: time_s(now),
                        head: heads[0],
                    }));
                }
                0 => {
                    actions.push(Action::Stat(StatEvent::Leave {
                        role: old_role,
                        node: self.node_id,
                        time_s: time_s(now),
                        head: from,
                    }));
                    if self.info_table.count_members_or_gateways() >= 1 {
                        self.set_role(NodeRole::ClusterGuest, actions);
                    } else {
                        self.set_role(NodeRole::Standalone, actions);
                        actions.push(Action::Stat(StatEvent::BecomesStandalone {
                            node: self.node_id,
                            time_s: time_s(now),
                        }));
                    }
                    self.current_head = None;
                }
                _ => {
                    // Still bridging several clusters.
                    actions.push(Action::Stat(StatEvent::Leave {
                        role: old_role,
                        node: self.node_id,
                        time_s: time_s(now),
                        head: from,
                    }));
                    for head in heads {
                        actions.push(Action::Stat(StatEvent::Join {
                            role: NodeRole::ClusterGateway,
                            node: self.node_id,
                            time_s: time_s(now),
                            head,
                        }));
                    }
                }
            }
        }

        // A headless non-head re-enters the election after a short
        // randomized backoff.
        if self.role != NodeRole::ClusterHead
            && self.info_table.count_heads() == 0
            && !self.timers.has_event(&TimerEvent::SendClaim)
        {
            let delay_s: f64 = self.rng.gen_range(RECLAIM_DELAY_MIN_S..=RECLAIM_DELAY_MAX_S);
            self.timers
                .schedule(now + duration_from_secs_f64(delay_s), TimerEvent::SendClaim);
        }
    }

    fn handle_inquiry(&mut self, from: NodeId, sender_role: NodeRole, now: Instant, actions: &mut Vec<Action>) {
        self.info_table.upsert(from, sender_role, now);
        self.unicast(from, MessageKind::Status, None, now, actions);
    }

    // ---------- helpers ----------

    fn join_as_member(&mut self, head: NodeId, now: Instant, actions: &mut Vec<Action>) {
        self.set_role(NodeRole::ClusterMember, actions);
        self.current_head = Some(head);
        actions.push(Action::Stat(StatEvent::Join {
            role: NodeRole::ClusterMember,
            node: self.node_id,
            time_s: time_s(now),
            head,
        }));
    }

    fn set_role(&mut self, new_role: NodeRole, actions: &mut Vec<Action>) {
        if self.role != new_role {
            log::trace!("node {}: {} -> {}", self.node_id, self.role, new_role);
            self.role = new_role;
            actions.push(Action::Stat(StatEvent::ClusterChange));
        }
        // Joining any structure invalidates a still-pending election claim;
        // only an explicit reschedule (on losing the last head) revives it.
        if new_role != NodeRole::ClusterHead {
            self.timers.cancel_event(&TimerEvent::SendClaim);
        }
    }

    fn build_message(&mut self, kind: MessageKind, table_size: Option<u64>, now: Instant) -> Message {
        Message {
            id: self.message_ids.next_id(),
            timestamp_ms: now.as_millis(),
            sender_role: self.role,
            kind,
            table_size,
        }
    }

    fn broadcast(&mut self, kind: MessageKind, table_size: Option<u64>, now: Instant, actions: &mut Vec<Action>) {
        let message = self.build_message(kind, table_size, now);
        actions.push(Action::Broadcast(message));
        actions.push(Action::Stat(StatEvent::MessageSent));
    }

    fn unicast(
        &mut self,
        dest: NodeId,
        kind: MessageKind,
        table_size: Option<u64>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let message = self.build_message(kind, table_size, now);
        actions.push(Action::Unicast(dest, message));
        actions.push(Action::Stat(StatEvent::MessageSent));
    }
}

fn time_s(now: Instant) -> f64 {
    now.as_micros() as f64 / 1e6
}

fn duration_from_secs_f64(seconds: f64) -> Duration {
    Duration::from_micros((seconds * 1e6) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_A: NodeId = 0x0a01_0001;
    const NODE_B: NodeId = 0x0a01_0002;
    const NODE_C: NodeId = 0x0a01_0003;

    fn fast_config() -> ClusterConfig {
        ClusterConfig {
            wait_time: Duration::from_millis(0),
            standoff_time: Duration::from_secs(1),
            ..ClusterConfig::default()
        }
    }

    fn machine(node_id: NodeId, seed: u64) -> ClusterMachine {
        ClusterMachine::new(node_id, fast_config(), MessageIdStream::new(), seed)
    }

    fn at(millis: u64) -> Instant {
        Instant::from_millis(millis)
    }

    /// Extract sent messages: (destination, message), destination `None`
    /// for broadcasts.
    fn sent(actions: &[Action]) -> Vec<(Option<NodeId>, Message)> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Broadcast(message) => Some((None, message.clone())),
                Action::Unicast(dest, message) => Some((Some(*dest), message.clone())),
                _ => None,
            })
            .collect()
    }

    fn stat_events(actions: &[Action]) -> Vec<StatEvent> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Stat(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    /// Deliver every message of `actions` sent by `from` to `machine`
    /// (broadcasts and unicasts addressed to it), through the codec.
    fn deliver(from: NodeId, actions: &[Action], to: &mut ClusterMachine, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        for (dest, message) in sent(actions) {
            if dest.is_none() || dest == Some(to.node_id()) {
                out.extend(to.handle_packet(from, &message.encode(), now));
            }
        }
        out
    }

    fn make_head(machine: &mut ClusterMachine) -> Vec<Action> {
        let _ = machine.start(at(0));
        let wake = machine.next_deadline().unwrap();
        machine.poll(wake)
    }

    #[test]
    fn solo_node_claims_then_stands_alone() {
        let mut a = machine(NODE_A, 1);
        let actions = make_head(&mut a);
        assert_eq!(a.role(), NodeRole::ClusterHead);
        let messages = sent(&actions);
        assert!(messages.iter().any(|(dest, m)| dest.is_none() && m.kind == MessageKind::Claim));
        assert!(stat_events(&actions)
            .iter()
            .any(|event| matches!(event, StatEvent::ChClaim { node, .. } if *node == NODE_A)));

        // Let hello and scan fire; the scan schedules the resign check.
        let _ = a.poll(at(2_500));
        // The check fires three seconds later and finds an empty table.
        let actions = a.poll(at(6_000));
        assert_eq!(a.role(), NodeRole::Standalone);
        let resigns: Vec<_> = stat_events(&actions)
            .into_iter()
            .filter(|event| matches!(event, StatEvent::ChResign { .. }))
            .collect();
        assert_eq!(resigns.len(), 1);
    }

    #[test]
    fn claim_during_standoff_window_turns_rival_into_member() {
        let mut a = machine(NODE_A, 1);
        let mut b = machine(NODE_B, 2);
        let _ = a.start(at(0));
        let _ = b.start(at(0));

        let wake_a = a.next_deadline().unwrap();
        let claim_actions = a.poll(wake_a);
        assert_eq!(a.role(), NodeRole::ClusterHead);

        // The claim reaches B before its own wakeup fires.
        let b_actions = deliver(NODE_A, &claim_actions, &mut b, wake_a);
        assert_eq!(b.role(), NodeRole::ClusterMember);
        let replies = sent(&b_actions);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, Some(NODE_A));
        assert_eq!(replies[0].1.kind, MessageKind::Status);
        assert!(stat_events(&b_actions)
            .iter()
            .any(|event| matches!(event, StatEvent::Join { head, .. } if *head == NODE_A)));

        // B's cancelled claim never fires.
        let late = b.poll(at(10_000));
        assert_eq!(b.role(), NodeRole::ClusterMember);
        assert!(!sent(&late).iter().any(|(_, m)| m.kind == MessageKind::Claim));

        // The status reaches A while its claim flag is up.
        let a_actions = deliver(NODE_B, &b_actions, &mut a, wake_a);
        assert!(stat_events(&a_actions)
            .iter()
            .any(|event| matches!(event, StatEvent::ChReceiveStatus { node, .. } if *node == NODE_A)));
        assert_eq!(a.role(), NodeRole::ClusterHead);
    }

    #[test]
    fn meeting_resigns_the_smaller_head() {
        let mut a = machine(NODE_A, 3);
        let mut b = machine(NODE_B, 4);
        let _ = make_head(&mut a);
        let _ = make_head(&mut b);

        // Grow B's cluster past A's.
        for (index, peer) in [NODE_C, 0x0a01_0004, 0x0a01_0005].iter().enumerate() {
            let ping = Message {
                id: 1000 + index as u64,
                timestamp_ms: 1_500,
                sender_role: NodeRole::Unspecified,
                kind: MessageKind::Ping,
                table_size: None,
            };
            let _ = b.handle_packet(*peer, &ping.encode(), at(1_500));
        }
        assert!(b.info_table().size() > a.info_table().size());

        // A's hello reaches B: two heads meet.
        let mut hello = Vec::new();
        a.broadcast(MessageKind::Ping, None, at(2_000), &mut hello);
        let b_actions = deliver(NODE_A, &hello, &mut b, at(2_000));
        let meetings = sent(&b_actions);
        assert_eq!(meetings.len(), 1);
        assert_eq!(meetings[0].1.kind, MessageKind::Meeting);
        assert!(meetings[0].1.table_size.unwrap() >= 3);

        // B's meeting reports the larger cluster: A resigns.
        let a_actions = deliver(NODE_B, &b_actions, &mut a, at(2_100));
        assert_eq!(a.role(), NodeRole::ClusterMember);
        let a_sent = sent(&a_actions);
        assert!(a_sent.iter().any(|(dest, m)| dest.is_none() && m.kind == MessageKind::Resign));
        assert!(a_sent.iter().any(|(dest, m)| dest.is_none() && m.kind == MessageKind::Ping));
        let resigns: Vec<_> = stat_events(&a_actions)
            .into_iter()
            .filter(|event| matches!(event, StatEvent::ChResign { node, .. } if *node == NODE_A))
            .collect();
        assert_eq!(resigns.len(), 1);
        assert_eq!(b.role(), NodeRole::ClusterHead);
    }

    #[test]
    fn meeting_with_smaller_cluster_is_countered() {
        let mut a = machine(NODE_A, 5);
        let _ = make_head(&mut a);
        // A has one row, so a meeting reporting zero loses.
        let ping = Message {
            id: 2000,
            timestamp_ms: 1_500,
            sender_role: NodeRole::Unspecified,
            kind: MessageKind::Ping,
            table_size: None,
        };
        let _ = a.handle_packet(NODE_C, &ping.encode(), at(1_500));

        let meeting = Message {
            id: 2001,
            timestamp_ms: 2_000,
            sender_role: NodeRole::ClusterHead,
            kind: MessageKind::Meeting,
            table_size: Some(0),
        };
        let actions = a.handle_packet(NODE_B, &meeting.encode(), at(2_000));
        assert_eq!(a.role(), NodeRole::ClusterHead);
        let replies = sent(&actions);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, Some(NODE_B));
        assert_eq!(replies[0].1.kind, MessageKind::Meeting);
    }

    #[test]
    fn meeting_to_non_head_is_a_protocol_violation() {
        let mut c = machine(NODE_C, 6);
        let _ = c.start(at(0));
        let meeting = Message {
            id: 3000,
            timestamp_ms: 100,
            sender_role: NodeRole::ClusterHead,
            kind: MessageKind::Meeting,
            table_size: Some(9),
        };
        let actions = c.handle_packet(NODE_A, &meeting.encode(), at(100));
        assert_eq!(c.role(), NodeRole::Unspecified);
        assert!(sent(&actions).is_empty());
        assert_eq!(c.info_table().size(), 0);
    }

    #[test]
    fn two_claims_make_a_gateway() {
        let mut c = machine(NODE_C, 7);
        let _ = c.start(at(0));

        // First claim arrives inside the standoff window.
        let claim_a = Message {
            id: 4000,
            timestamp_ms: 500,
            sender_role: NodeRole::ClusterHead,
            kind: MessageKind::Claim,
            table_size: None,
        };
        let actions = c.handle_packet(NODE_A, &claim_a.encode(), at(500));
        assert_eq!(c.role(), NodeRole::ClusterMember);
        assert!(sent(&actions).iter().any(|(dest, m)| *dest == Some(NODE_A) && m.kind == MessageKind::Status));

        // Second claim arrives after the window closes.
        let claim_b = Message {
            id: 4001,
            timestamp_ms: 2_000,
            sender_role: NodeRole::ClusterHead,
            kind: MessageKind::Claim,
            table_size: None,
        };
        let actions = c.handle_packet(NODE_B, &claim_b.encode(), at(2_000));
        assert_eq!(c.role(), NodeRole::ClusterGateway);
        assert!(sent(&actions).iter().any(|(dest, m)| dest.is_none() && m.kind == MessageKind::Ping));
    }

    #[test]
    fn guest_reschedules_claim_when_last_head_resigns() {
        let mut c = machine(NODE_C, 8);
        let _ = c.start(at(0));

        // A member's ping makes the unspecified node a guest.
        let member_ping = Message {
            id: 5000,
            timestamp_ms: 400,
            sender_role: NodeRole::ClusterMember,
            kind: MessageKind::Ping,
            table_size: None,
        };
        let actions = c.handle_packet(NODE_B, &member_ping.encode(), at(400));
        assert_eq!(c.role(), NodeRole::ClusterGuest);
        assert!(sent(&actions).iter().any(|(dest, m)| *dest == Some(NODE_B) && m.kind == MessageKind::Status));

        // The (already resigned) head's RESIGN leaves no head in the
        // table: the guest schedules a fresh claim 0.1-0.5 s out.
        let resign = Message {
            id: 5001,
            timestamp_ms: 2_000,
            sender_role: NodeRole::ClusterGuest,
            kind: MessageKind::Resign,
            table_size: None,
        };
        let _ = c.handle_packet(NODE_A, &resign.encode(), at(2_000));
        assert!(c.timers.has_event(&TimerEvent::SendClaim));

        // The re-claim delay is at least 0.1 s out.
        let _ = c.poll(at(2_050));
        assert_eq!(c.role(), NodeRole::ClusterGuest);

        // And at most 0.5 s out.
        let actions = c.poll(at(2_500));
        assert_eq!(c.role(), NodeRole::ClusterHead);
        assert!(sent(&actions).iter().any(|(dest, m)| dest.is_none() && m.kind == MessageKind::Claim));
    }

    #[test]
    fn gateway_demotes_to_member_when_one_head_remains() {
        let mut c = machine(NODE_C, 9);
        let _ = c.start(at(0));

        // Claims from two heads (one in window, one after) make C a gateway.
        for (id, head, millis) in [(6000u64, NODE_A, 500u64), (6001, NODE_B, 2_000)] {
            let claim = Message {
                id,
                timestamp_ms: millis,
                sender_role: NodeRole::ClusterHead,
                kind: MessageKind::Claim,
                table_size: None,
            };
            let _ = c.handle_packet(head, &claim.encode(), at(millis));
        }
        assert_eq!(c.role(), NodeRole::ClusterGateway);

        // A resigns (now a member): B is the one remaining head.
        let resign = Message {
            id: 6002,
            timestamp_ms: 2_500,
            sender_role: NodeRole::ClusterMember,
            kind: MessageKind::Resign,
            table_size: None,
        };
        let actions = c.handle_packet(NODE_A, &resign.encode(), at(2_500));
        assert_eq!(c.role(), NodeRole::ClusterMember);
        let events = stat_events(&actions);
        assert!(events
            .iter()
            .any(|event| matches!(event, StatEvent::Leave { head, .. } if *head == NODE_A)));
        assert!(events
            .iter()
            .any(|event| matches!(event, StatEvent::Join { head, .. } if *head == NODE_B)));
    }

    #[test]
    fn gateway_demotes_at_scan_when_a_head_row_expires() {
        let mut c = machine(NODE_C, 18);
        let _ = c.start(at(0));

        for (id, head, millis) in [(6100u64, NODE_A, 500u64), (6101, NODE_B, 2_000)] {
            let claim = Message {
                id,
                timestamp_ms: millis,
                sender_role: NodeRole::ClusterHead,
                kind: MessageKind::Claim,
                table_size: None,
            };
            let _ = c.handle_packet(head, &claim.encode(), at(millis));
        }
        assert_eq!(c.role(), NodeRole::ClusterGateway);

        // By 2.9 s the first head's row (from 0.5 s) is past the 2.3 s
        // freshness window while the second (from 2.0 s) survives.
        let actions = c.poll(at(2_900));
        assert_eq!(c.role(), NodeRole::ClusterMember);
        assert!(stat_events(&actions)
            .iter()
            .any(|event| matches!(event, StatEvent::Leave { head, .. } if *head == NODE_A)));
    }

    #[test]
    fn duplicate_messages_have_no_side_effects() {
        let mut c = machine(NODE_C, 10);
        let _ = c.start(at(0));

        let ping = Message {
            id: 7000,
            timestamp_ms: 400,
            sender_role: NodeRole::ClusterHead,
            kind: MessageKind::Ping,
            table_size: None,
        };
        let frame = ping.encode();
        let first = c.handle_packet(NODE_A, &frame, at(400));
        assert!(!first.is_empty());
        let role_after = c.role();
        let table_after = c.info_table().size();
        let seen_after = c.seen_message_count();

        let second = c.handle_packet(NODE_A, &frame, at(500));
        assert!(second.is_empty());
        assert_eq!(c.role(), role_after);
        assert_eq!(c.info_table().size(), table_after);
        assert_eq!(c.seen_message_count(), seen_after);
    }

    #[test]
    fn malformed_frames_are_dropped_without_state_change() {
        let mut c = machine(NODE_C, 11);
        let _ = c.start(at(0));
        let actions = c.handle_packet(NODE_A, &[0xff, 0x00, 0x12], at(100));
        assert!(actions.is_empty());
        assert_eq!(c.role(), NodeRole::Unspecified);
        assert_eq!(c.seen_message_count(), 0);
    }

    #[test]
    fn ping_from_head_converts_unspecified_to_member() {
        // Property P3 directly.
        let mut c = machine(NODE_C, 12);
        let _ = c.start(at(0));
        let ping = Message {
            id: 8000,
            timestamp_ms: 300,
            sender_role: NodeRole::ClusterHead,
            kind: MessageKind::Ping,
            table_size: None,
        };
        let actions = c.handle_packet(NODE_A, &ping.encode(), at(300));
        assert_eq!(c.role(), NodeRole::ClusterMember);
        assert!(sent(&actions)
            .iter()
            .any(|(dest, m)| *dest == Some(NODE_A) && m.kind == MessageKind::Status));
    }

    #[test]
    fn member_ping_from_same_head_keeps_membership() {
        let mut c = machine(NODE_C, 13);
        let _ = c.start(at(0));
        let claim = Message {
            id: 9000,
            timestamp_ms: 500,
            sender_role: NodeRole::ClusterHead,
            kind: MessageKind::Claim,
            table_size: None,
        };
        let _ = c.handle_packet(NODE_A, &claim.encode(), at(500));
        assert_eq!(c.role(), NodeRole::ClusterMember);

        // A ping from the same head must not create a gateway.
        let ping = Message {
            id: 9001,
            timestamp_ms: 1_200,
            sender_role: NodeRole::ClusterHead,
            kind: MessageKind::Ping,
            table_size: None,
        };
        let _ = c.handle_packet(NODE_A, &ping.encode(), at(1_200));
        assert_eq!(c.role(), NodeRole::ClusterMember);

        // But a ping from a different head does.
        let ping = Message {
            id: 9002,
            timestamp_ms: 1_300,
            sender_role: NodeRole::ClusterHead,
            kind: MessageKind::Ping,
            table_size: None,
        };
        let _ = c.handle_packet(NODE_B, &ping.encode(), at(1_300));
        assert_eq!(c.role(), NodeRole::ClusterGateway);
    }

    #[test]
    fn inquiry_is_answered_with_status() {
        let mut c = machine(NODE_C, 14);
        let _ = c.start(at(0));
        let inquiry = Message {
            id: 9100,
            timestamp_ms: 700,
            sender_role: NodeRole::ClusterMember,
            kind: MessageKind::Inquiry,
            table_size: None,
        };
        let actions = c.handle_packet(NODE_B, &inquiry.encode(), at(700));
        assert!(sent(&actions)
            .iter()
            .any(|(dest, m)| *dest == Some(NODE_B) && m.kind == MessageKind::Status));
        assert_eq!(c.info_table().size(), 1);
    }

    #[test]
    fn scan_evicts_stale_rows() {
        let mut c = machine(NODE_C, 15);
        let _ = c.start(at(0));
        let ping = Message {
            id: 9200,
            timestamp_ms: 10,
            sender_role: NodeRole::ClusterMember,
            kind: MessageKind::Ping,
            table_size: None,
        };
        let _ = c.handle_packet(NODE_B, &ping.encode(), at(10));
        assert_eq!(c.info_table().size(), 1);

        // No fresh ping: after scans at t=3 s the row is past the 2.3 s
        // freshness window.
        let _ = c.poll(at(3_000));
        assert_eq!(c.info_table().size(), 0);
    }

    #[test]
    fn role_sample_reports_cluster_size_for_heads() {
        let mut a = machine(NODE_A, 16);
        let _ = make_head(&mut a);

        // Keep the table non-empty so the head survives resign checks.
        let keep_alive = |a: &mut ClusterMachine, id: u64, millis: u64| {
            let ping = Message {
                id,
                timestamp_ms: millis,
                sender_role: NodeRole::ClusterMember,
                kind: MessageKind::Ping,
                table_size: None,
            };
            let _ = a.handle_packet(NODE_B, &ping.encode(), at(millis));
        };

        keep_alive(&mut a, 9300, 56_500);
        let actions = a.poll(at(57_000));
        let samples: Vec<_> = stat_events(&actions)
            .into_iter()
            .filter(|event| matches!(event, StatEvent::RoleSample { .. }))
            .collect();
        assert_eq!(samples.len(), 1);
        match &samples[0] {
            StatEvent::RoleSample {
                role, cluster_size, ..
            } => {
                assert_eq!(*role, NodeRole::ClusterHead);
                assert_eq!(*cluster_size, 2);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn stop_cancels_all_timers() {
        let mut a = machine(NODE_A, 17);
        let _ = a.start(at(0));
        assert!(a.next_deadline().is_some());
        a.stop();
        assert!(a.next_deadline().is_none());
        assert!(a.poll(at(60_000)).is_empty());
    }
}
