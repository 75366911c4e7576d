//! Control Plane API
//!
//! REST surface for node agents and operators.

pub mod rest;
pub mod server;

pub use rest::RestRouter;
pub use server::{ApiServer, ApiServerConfig};
