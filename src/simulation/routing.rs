//! The emulated routing layer.
//!
//! Connectivity follows a constant-range model: two nodes are linked when
//! they are within the wifi radius of each other. On top of that graph
//! this module computes per-node hop counts (breadth-first), decides which
//! nodes an H-hop broadcast flood reaches, and renders the per-node
//! routing table text (DSDV or AODV layout) that the clustering layer's
//! neighbor parser consumes.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::clustering::message::NodeId;
use crate::clustering::neighbor_table::format_ipv4;
use crate::config::RoutingProtocol;
use crate::simulation::types::Point;

/// Base address of the simulated /16 network.
const NETWORK_BASE: u32 = 0x0A01_0000; // 10.1.0.0
/// Broadcast address of the /16 network.
const NETWORK_BROADCAST: u32 = 0x0A01_FFFF; // 10.1.255.255

/// IPv4-derived node id for the node at `index` (0-based).
pub fn node_address(index: u32) -> NodeId {
    NETWORK_BASE + index + 1
}

/// One reachable destination from some node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub dest: NodeId,
    /// First hop on the path towards `dest`.
    pub gateway: NodeId,
    pub hops: u32,
}

/// Undirected adjacency over all node positions within `radius`.
pub fn adjacency(positions: &[(NodeId, Point)], radius: f64) -> HashMap<NodeId, Vec<NodeId>> {
    let mut graph: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for (id, _) in positions {
        graph.entry(*id).or_default();
    }
    for (i, (id_a, pos_a)) in positions.iter().enumerate() {
        for (id_b, pos_b) in positions.iter().skip(i + 1) {
            if pos_a.distance_to(pos_b) <= radius {
                graph.entry(*id_a).or_default().push(*id_b);
                graph.entry(*id_b).or_default().push(*id_a);
            }
        }
    }
    graph
}

/// Breadth-first routes from `source` to every reachable node.
pub fn routes_from(graph: &HashMap<NodeId, Vec<NodeId>>, source: NodeId) -> Vec<Route> {
    let mut routes = Vec::new();
    let mut visited: HashSet<NodeId> = HashSet::from([source]);
    let mut frontier: VecDeque<(NodeId, NodeId, u32)> = VecDeque::new();

    if let Some(neighbors) = graph.get(&source) {
        for &neighbor in neighbors {
            if visited.insert(neighbor) {
                frontier.push_back((neighbor, neighbor, 1));
            }
        }
    }
    while let Some((node, gateway, hops)) = frontier.pop_front() {
        routes.push(Route {
            dest: node,
            gateway,
            hops,
        });
        if let Some(neighbors) = graph.get(&node) {
            for &neighbor in neighbors {
                if visited.insert(neighbor) {
                    frontier.push_back((neighbor, gateway, hops + 1));
                }
            }
        }
    }
    routes
}

/// Render the routing table of `own_id` the way the emulated protocol
/// prints it, including the loopback and broadcast rows real tables carry
/// (the clustering-side parser is expected to filter those out).
pub fn render_routing_table(
    protocol: RoutingProtocol,
    own_id: NodeId,
    routes: &[Route],
) -> String {
    let own = format_ipv4(own_id);
    let broadcast = format_ipv4(NETWORK_BROADCAST);
    let mut sorted: Vec<&Route> = routes.iter().collect();
    sorted.sort_by_key(|route| route.dest);

    let mut text = String::new();
    match protocol {
        RoutingProtocol::Dsdv => {
            text.push_str("Node: DSDV Routing table\n");
            text.push_str("Destination      Gateway          Interface        HopCount  SeqNo\n");
            for route in sorted {
                text.push_str(&format!(
                    "{:<16} {:<16} {:<16} {:<9} {}\n",
                    format_ipv4(route.dest),
                    format_ipv4(route.gateway),
                    own,
                    route.hops,
                    route.hops * 2
                ));
            }
            text.push_str(&format!(
                "{:<16} {:<16} {:<16} {:<9} {}\n",
                broadcast, broadcast, own, 1, 0
            ));
            text.push_str(&format!(
                "{:<16} {:<16} {:<16} {:<9} {}\n",
                "127.0.0.1", "127.0.0.1", "127.0.0.1", 1, 0
            ));
        }
        RoutingProtocol::Aodv => {
            text.push_str("Node: AODV Routing table\n");
            text.push_str("Destination      Gateway          Interface        Flag  Expire    Hops\n");
            for route in sorted {
                text.push_str(&format!(
                    "{:<16} {:<16} {:<16} {:<5} {:<9} {}\n",
                    format_ipv4(route.dest),
                    format_ipv4(route.gateway),
                    own,
                    "UP",
                    format!("{:.2}", 10.0 - f64::from(route.hops.min(10)) * 0.5),
                    route.hops
                ));
            }
            text.push_str(&format!(
                "{:<16} {:<16} {:<16} {:<5} {:<9} {}\n",
                broadcast, broadcast, own, "UP", "10.00", 1
            ));
            text.push_str(&format!(
                "{:<16} {:<16} {:<16} {:<5} {:<9} {}\n",
                "127.0.0.1", "127.0.0.1", "127.0.0.1", "UP", "10.00", 1
            ));
        }
    }
    text
}
