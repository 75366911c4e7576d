//! Node Registry Module
//!
//! Authoritative store of node identity, location metadata, and liveness
//! state. 256-way sharded so per-node mutations serialize without global
//! contention, plus the background staleness sweep.

pub mod events;
pub mod node_registry;
pub mod sweeper;

pub use events::*;
pub use node_registry::*;
pub use sweeper::*;
