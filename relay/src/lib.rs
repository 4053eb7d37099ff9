//! Burrow Relay
//!
//! Terminates public HTTP inside the remote context and forwards each
//! request over the single attached bridge channel.

pub mod channel;
pub mod config;
pub mod pending;
pub mod registry;
pub mod server;
pub mod state;

pub use config::RelayConfig;
pub use server::router;
pub use state::RelayState;
