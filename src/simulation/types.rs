//! Type definitions for the simulation harness.
//!
//! Contains the communication channels between node tasks and the network
//! task, the per-node runtime state kept by the network task, and the
//! basic geometry types.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::clustering::message::NodeId;
use crate::clustering::stats::StatEvent;
use crate::simulation::mobility::Walker;

/// Upper bound on simulated nodes; sizes the embassy task pool.
pub const MAX_NODE_COUNT: usize = 4096;

/// Depth of the per-node control channel (network → node).
/// Deliveries past a full queue are dropped like any lost radio frame.
pub const NODE_INPUT_QUEUE_SIZE: usize = 32;
/// Bounded channel used to deliver frames and control messages to a node.
pub type NodeInputQueue =
    embassy_sync::channel::Channel<CriticalSectionRawMutex, NodeInputMessage, NODE_INPUT_QUEUE_SIZE>;
/// Receiver side of the node input channel.
pub type NodeInputQueueReceiver = embassy_sync::channel::Receiver<
    'static,
    CriticalSectionRawMutex,
    NodeInputMessage,
    NODE_INPUT_QUEUE_SIZE,
>;
/// Sender side of the node input channel.
pub type NodeInputQueueSender = embassy_sync::channel::Sender<
    'static,
    CriticalSectionRawMutex,
    NodeInputMessage,
    NODE_INPUT_QUEUE_SIZE,
>;

/// Depth of the shared output channel (nodes → network task). The network
/// loop drains it continuously, so a modest depth suffices.
pub const NODES_OUTPUT_QUEUE_SIZE: usize = 64;
/// Bounded channel used by node tasks to publish events for the network task.
pub type NodesOutputQueue =
    embassy_sync::channel::Channel<CriticalSectionRawMutex, NodeOutputMessage, NODES_OUTPUT_QUEUE_SIZE>;
/// Sender side of the nodes output channel.
pub type NodesOutputQueueSender = embassy_sync::channel::Sender<
    'static,
    CriticalSectionRawMutex,
    NodeOutputMessage,
    NODES_OUTPUT_QUEUE_SIZE,
>;
/// Receiver side of the nodes output channel.
pub type NodesOutputQueueReceiver = embassy_sync::channel::Receiver<
    'static,
    CriticalSectionRawMutex,
    NodeOutputMessage,
    NODES_OUTPUT_QUEUE_SIZE,
>;

/// Control messages delivered to a node task.
#[derive(Debug, Clone)]
pub enum NodeInputMessage {
    /// An encoded protocol frame arriving over the radio.
    Deliver { from: NodeId, frame: Vec<u8> },
    /// Fresh routing-table text from the routing layer.
    RoutingUpdate(String),
    /// Stop the node: cancel timers and acknowledge with `Stopped`.
    Shutdown,
}

/// Events a node task publishes to the network task.
#[derive(Debug, Clone)]
pub enum NodeOutputPayload {
    /// Flood this frame to the H-hop neighborhood.
    Broadcast(Vec<u8>),
    /// Route this frame to one destination.
    Unicast { dest: NodeId, frame: Vec<u8> },
    /// A statistics event for the run's `Stats`.
    Stat(StatEvent),
    /// The node wants a fresh routing-table snapshot.
    RoutingRequest,
    /// Acknowledgement of `Shutdown`.
    Stopped,
}

/// Envelope for events emitted by node tasks into the network loop.
#[derive(Debug, Clone)]
pub struct NodeOutputMessage {
    pub node_id: NodeId,
    pub payload: NodeOutputPayload,
}

/// Simple 2D point in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn distance_to(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Runtime state the network task keeps per node.
pub struct SimNode {
    pub node_id: NodeId,
    pub position: Point,
    pub walker: Walker,
    pub input: NodeInputQueueSender,
    /// Last routing-table text pushed to the node; used to skip redundant
    /// updates when the neighborhood has not changed.
    pub last_routing_table: String,
    /// Whether the node acknowledged shutdown.
    pub stopped: bool,
}
