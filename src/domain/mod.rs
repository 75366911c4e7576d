//! Domain Types
//!
//! Wire and validation types shared between the control plane and the
//! node agent.

pub mod protocol;

pub use protocol::*;
