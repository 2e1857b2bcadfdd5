//! Multi-node simulation harness.
//!
//! Provides the environment the clustering core runs in:
//! - `types`: channels, queues, per-node runtime state
//! - `mobility`: random-walk movement over the simulation area
//! - `routing`: constant-range connectivity and routing-table rendering
//! - `node_task`: per-node task driving one clustering machine
//! - `network_task`: central task coordinating delivery, mobility, and
//!   statistics
//!
//! The main entry point is `network_task`, spawned once on the embassy
//! executor; it spawns all node tasks itself.

pub mod mobility;
pub mod network_task;
pub mod node_task;
pub mod routing;
pub mod types;

pub use network_task::network_task;
