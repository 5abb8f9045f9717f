//! Control-plane API: one listener per configured transport, one connection
//! handler per accepted client, all dispatching into a shared Orchestrator.

pub mod connection;
pub mod notify;
pub mod server;

pub use server::{ApiServer, ApiServerError};
