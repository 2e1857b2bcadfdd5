//! Per-node asynchronous task logic.
//!
//! Each node runs an independent task that owns its clustering state
//! machine. The loop waits on the node's input channel and on the
//! machine's earliest timer, feeds both into the machine, and flushes the
//! resulting actions (encoded frames, statistics events) to the network
//! task.

use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Instant, Timer};

use crate::clustering::machine::{Action, ClusterConfig, ClusterMachine};
use crate::clustering::message::{MessageIdStream, NodeId};
use crate::simulation::types::{
    MAX_NODE_COUNT, NodeInputMessage, NodeInputQueueReceiver, NodeOutputMessage, NodeOutputPayload,
    NodesOutputQueueSender,
};

/// Sleep horizon used when the machine has no pending timer.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Context tying one machine to its channels.
struct NodeContext {
    node_id: NodeId,
    machine: ClusterMachine,
    out_tx: NodesOutputQueueSender,
}

impl NodeContext {
    fn new(
        node_id: NodeId,
        config: ClusterConfig,
        message_ids: MessageIdStream,
        rng_seed: u64,
        out_tx: NodesOutputQueueSender,
    ) -> Self {
        Self {
            node_id,
            machine: ClusterMachine::new(node_id, config, message_ids, rng_seed),
            out_tx,
        }
    }

    /// Execute machine actions: encode outgoing frames at the transport
    /// boundary and forward statistics reports.
    async fn flush(&mut self, actions: Vec<Action>) {
        for action in actions {
            let payload = match action {
                Action::Broadcast(message) => NodeOutputPayload::Broadcast(message.encode()),
                Action::Unicast(dest, message) => NodeOutputPayload::Unicast {
                    dest,
                    frame: message.encode(),
                },
                Action::Stat(event) => NodeOutputPayload::Stat(event),
                Action::RequestRoutingUpdate => NodeOutputPayload::RoutingRequest,
            };
            self.out_tx
                .send(NodeOutputMessage {
                    node_id: self.node_id,
                    payload,
                })
                .await;
        }
    }

    /// Handle one input message. Returns false when the node should stop.
    async fn handle_input(&mut self, message: NodeInputMessage) -> bool {
        match message {
            NodeInputMessage::Deliver { from, frame } => {
                let actions = self.machine.handle_packet(from, &frame, Instant::now());
                self.flush(actions).await;
            }
            NodeInputMessage::RoutingUpdate(table_text) => {
                self.machine.update_routing_snapshot(table_text);
            }
            NodeInputMessage::Shutdown => {
                self.machine.stop();
                self.out_tx
                    .send(NodeOutputMessage {
                        node_id: self.node_id,
                        payload: NodeOutputPayload::Stopped,
                    })
                    .await;
                return false;
            }
        }
        true
    }
}

/// Per-node task bridging a clustering machine and the network task.
#[embassy_executor::task(pool_size = MAX_NODE_COUNT)]
pub async fn node_task(
    config: ClusterConfig,
    node_id: NodeId,
    message_ids: MessageIdStream,
    rng_seed: u64,
    out_tx: NodesOutputQueueSender,
    in_rx: NodeInputQueueReceiver,
) {
    let mut context = NodeContext::new(node_id, config, message_ids, rng_seed, out_tx);

    let actions = context.machine.start(Instant::now());
    context.flush(actions).await;

    loop {
        let deadline = context
            .machine
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

        match select(in_rx.receive(), Timer::at(deadline)).await {
            Either::First(message) => {
                if !context.handle_input(message).await {
                    break;
                }
            }
            Either::Second(()) => {
                let actions = context.machine.poll(Instant::now());
                context.flush(actions).await;
            }
        }
    }

    log::debug!("node {}: stopped", node_id);
}
