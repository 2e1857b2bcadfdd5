//! The ECS clustering protocol core.
//!
//! Everything in this tree is independent of the simulation harness: the
//! state machine consumes received frames and virtual-time wakeups and
//! produces messages and statistics events. The harness under
//! `crate::simulation` wires machines to each other through the simulated
//! radio topology.
//!
//! - `role`: the six node roles and their wire encoding
//! - `message`: the six message kinds and the binary codec
//! - `info_table`: freshness-windowed per-neighbor observations
//! - `neighbor_table`: routing-table snapshots and the change degree
//! - `timer_queue`: the virtual-time event queue of one machine
//! - `machine`: the clustering state machine itself
//! - `stats`: event logs, counters, aggregations, CSV export

pub mod info_table;
pub mod machine;
pub mod message;
pub mod neighbor_table;
pub mod role;
pub mod stats;
pub mod timer_queue;
