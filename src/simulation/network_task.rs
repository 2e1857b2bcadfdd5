//! Central network task driving the simulation timeline.
//!
//! High-level flow each loop turn:
//! 1) Wait for either a node event or the next deadline (mobility tick or
//!    end of run).
//! 2) Node events: deliver broadcasts to the H-hop flood targets, route
//!    unicasts along the connectivity graph, apply statistics events,
//!    answer routing snapshot requests.
//! 3) Mobility ticks: advance every walker, recompute the connectivity
//!    graph, and push fresh routing-table text to nodes whose
//!    neighborhood changed.
//! 4) At end of run: shut nodes down, drain their last events, write the
//!    CSV outputs, and signal completion to the main thread.

use anyhow::Context;
use embassy_executor::Spawner;
use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Instant, Timer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::sync::mpsc;

use crate::clustering::message::{MessageIdStream, NodeId};
use crate::clustering::stats::Stats;
use crate::config::SimulationConfig;
use crate::simulation::mobility::Walker;
use crate::simulation::node_task::node_task;
use crate::simulation::routing::{Route, adjacency, node_address, render_routing_table, routes_from};
use crate::simulation::types::{
    NodeInputMessage, NodeInputQueue, NodeOutputMessage, NodeOutputPayload, NodesOutputQueue, Point,
    SimNode,
};

/// Period of walker movement and topology recomputation.
const MOBILITY_TICK: Duration = Duration::from_millis(250);

/// Virtual time allowed for nodes to acknowledge shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Spawn node tasks and build the network task's per-node state.
///
/// Node positions are drawn uniformly over the simulation area; every
/// node gets a dedicated input queue and a derived random seed.
fn initialize_nodes(
    spawner: &Spawner,
    config: &SimulationConfig,
    message_ids: &MessageIdStream,
    nodes_output: &'static NodesOutputQueue,
    rng: &mut StdRng,
) -> Vec<SimNode> {
    let mut nodes = Vec::with_capacity(config.total_nodes as usize);

    for index in 0..config.total_nodes {
        // INTENTIONAL LEAK: Box::leak provides the 'static lifetime the
        // embassy channels require. The queues live until process exit.
        let input_queue: &'static NodeInputQueue = Box::leak(Box::new(NodeInputQueue::new()));
        let node_id = node_address(index);

        let spawn_result = spawner.spawn(node_task(
            config.cluster_config(),
            node_id,
            message_ids.clone(),
            config.seed.wrapping_add(u64::from(index) + 1),
            nodes_output.sender(),
            input_queue.receiver(),
        ));
        if spawn_result.is_err() {
            log::error!("failed to spawn task for node {}", node_id);
            continue;
        }

        let position = Point {
            x: rng.gen_range(0.0..=config.area_width),
            y: rng.gen_range(0.0..=config.area_length),
        };
        nodes.push(SimNode {
            node_id,
            position,
            walker: Walker::new(
                config.traveller_velocity,
                config.traveller_walk_dist,
                config.traveller_walk_time,
                config.traveller_walk_mode,
                rng,
            ),
            input: input_queue.sender(),
            last_routing_table: String::new(),
            stopped: false,
        });
    }

    nodes
}

/// Recompute connectivity and push routing-table text to every node whose
/// table changed. Returns the per-node route cache used for delivery.
fn update_topology(config: &SimulationConfig, nodes: &mut [SimNode]) -> HashMap<NodeId, Vec<Route>> {
    let positions: Vec<(NodeId, Point)> =
        nodes.iter().map(|node| (node.node_id, node.position)).collect();
    let graph = adjacency(&positions, config.wifi_radius);

    let mut route_cache = HashMap::with_capacity(nodes.len());
    for node in nodes.iter_mut() {
        let routes = routes_from(&graph, node.node_id);
        let table_text = render_routing_table(config.routing, node.node_id, &routes);
        if table_text != node.last_routing_table {
            // A full queue here is the same as a lost snapshot: the next
            // refresh request repairs it.
            let _ = node
                .input
                .try_send(NodeInputMessage::RoutingUpdate(table_text.clone()));
            node.last_routing_table = table_text;
        }
        route_cache.insert(node.node_id, routes);
    }
    route_cache
}

/// Deliver one frame into a node's input queue; drops on overflow like a
/// lost radio frame.
fn deliver(node: &SimNode, from: NodeId, frame: Vec<u8>) {
    if node
        .input
        .try_send(NodeInputMessage::Deliver { from, frame })
        .is_err()
    {
        log::debug!("frame from {} to {} dropped: input queue full", from, node.node_id);
    }
}

struct NetworkState {
    config: SimulationConfig,
    nodes: Vec<SimNode>,
    index_by_id: HashMap<NodeId, usize>,
    route_cache: HashMap<NodeId, Vec<Route>>,
    stats: Stats,
}

impl NetworkState {
    fn handle_node_event(&mut self, event: NodeOutputMessage) {
        let NodeOutputMessage { node_id, payload } = event;
        match payload {
            NodeOutputPayload::Broadcast(frame) => {
                let Some(routes) = self.route_cache.get(&node_id) else {
                    return;
                };
                for route in routes {
                    if route.hops <= self.config.hops {
                        if let Some(&index) = self.index_by_id.get(&route.dest) {
                            deliver(&self.nodes[index], node_id, frame.clone());
                        }
                    }
                }
            }
            NodeOutputPayload::Unicast { dest, frame } => {
                let routable = self
                    .route_cache
                    .get(&node_id)
                    .is_some_and(|routes| routes.iter().any(|route| route.dest == dest));
                if !routable {
                    log::debug!("unicast from {} to {} dropped: no route", node_id, dest);
                    return;
                }
                if let Some(&index) = self.index_by_id.get(&dest) {
                    deliver(&self.nodes[index], node_id, frame);
                }
            }
            NodeOutputPayload::Stat(event) => self.stats.apply(event),
            NodeOutputPayload::RoutingRequest => {
                if let Some(&index) = self.index_by_id.get(&node_id) {
                    let node = &self.nodes[index];
                    let _ = node.input.try_send(NodeInputMessage::RoutingUpdate(
                        node.last_routing_table.clone(),
                    ));
                }
            }
            NodeOutputPayload::Stopped => {
                if let Some(&index) = self.index_by_id.get(&node_id) {
                    self.nodes[index].stopped = true;
                }
            }
        }
    }

    fn mobility_tick(&mut self, rng: &mut StdRng) {
        let dt = MOBILITY_TICK.as_micros() as f64 / 1e6;
        for node in &mut self.nodes {
            node.walker.step(
                &mut node.position,
                dt,
                self.config.area_width,
                self.config.area_length,
                rng,
            );
        }
        self.route_cache = update_topology(&self.config, &mut self.nodes);
    }
}

/// Write the three CSV outputs of the run.
fn write_outputs(stats: &Stats, config: &SimulationConfig) -> anyhow::Result<()> {
    let ch_path = format!("CHEvents_{}.csv", config.seed);
    let mut ch_file = File::create(&ch_path).with_context(|| format!("creating {}", ch_path))?;
    stats
        .write_ch_events(&mut ch_file)
        .with_context(|| format!("writing {}", ch_path))?;

    let member_path = format!("MembershipEvents_{}.csv", config.seed);
    let mut member_file =
        File::create(&member_path).with_context(|| format!("creating {}", member_path))?;
    stats
        .write_member_events(&mut member_file)
        .with_context(|| format!("writing {}", member_path))?;

    let mut final_file = OpenOptions::new()
        .append(true)
        .create(true)
        .open("FinalStats.csv")
        .context("opening FinalStats.csv")?;
    stats
        .write_final_stats(
            &mut final_file,
            config.run_time,
            config.total_nodes,
            config.traveller_velocity,
            config.seed,
        )
        .context("writing FinalStats.csv")?;

    log::info!("wrote {}, {}, and FinalStats.csv", ch_path, member_path);
    Ok(())
}

/// Central simulation task. Spawned once by `main` on the executor.
#[embassy_executor::task]
pub async fn network_task(spawner: Spawner, config: SimulationConfig, done_tx: mpsc::Sender<()>) {
    log::info!(
        "starting simulation: {} nodes, {:?} routing, {} s runtime, seed {}",
        config.total_nodes,
        config.routing,
        config.run_time,
        config.seed
    );

    let mut rng = StdRng::seed_from_u64(config.seed);
    let message_ids = MessageIdStream::new();

    // INTENTIONAL LEAK: the shared output channel must outlive every node
    // task; it is reclaimed at process exit.
    let nodes_output: &'static NodesOutputQueue = Box::leak(Box::new(NodesOutputQueue::new()));
    let output_rx = nodes_output.receiver();

    let mut nodes = initialize_nodes(&spawner, &config, &message_ids, nodes_output, &mut rng);
    let index_by_id: HashMap<NodeId, usize> = nodes
        .iter()
        .enumerate()
        .map(|(index, node)| (node.node_id, index))
        .collect();
    let route_cache = update_topology(&config, &mut nodes);

    let mut state = NetworkState {
        config,
        nodes,
        index_by_id,
        route_cache,
        stats: Stats::new(),
    };

    let start = Instant::now();
    let end_time = start + state.config.run_time_duration();
    let mut next_tick = start + MOBILITY_TICK;

    loop {
        let deadline = next_tick.min(end_time);
        match select(output_rx.receive(), Timer::at(deadline)).await {
            Either::First(event) => state.handle_node_event(event),
            Either::Second(()) => {
                let now = Instant::now();
                if now >= end_time {
                    break;
                }
                state.mobility_tick(&mut rng);
                next_tick += MOBILITY_TICK;
            }
        }
    }

    // Shut nodes down and drain their final reports.
    let grace_end = Instant::now() + SHUTDOWN_GRACE;
    loop {
        for node in state.nodes.iter().filter(|node| !node.stopped) {
            let _ = node.input.try_send(NodeInputMessage::Shutdown);
        }
        if state.nodes.iter().all(|node| node.stopped) {
            break;
        }
        match select(output_rx.receive(), Timer::at(grace_end)).await {
            Either::First(event) => state.handle_node_event(event),
            Either::Second(()) => {
                let pending = state.nodes.iter().filter(|node| !node.stopped).count();
                log::warn!("{} nodes did not acknowledge shutdown", pending);
                break;
            }
        }
    }

    state.stats.log_totals();
    log::info!(
        "average cluster size (formula): {:.2}, CH lifetime: {:.2} s, membership lifetime: {:.2} s",
        state.stats.average_cluster_size_formula(),
        state.stats.average_ch_lifetime(state.config.run_time),
        state.stats.average_membership_lifetime(state.config.run_time)
    );

    if let Err(error) = write_outputs(&state.stats, &state.config) {
        log::error!("failed to write result files: {:#}", error);
    }

    let _ = done_tx.send(());
}
