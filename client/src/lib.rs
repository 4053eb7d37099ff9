//! Burrow client: exposes a local HTTP service through a relay running in
//! a remote sandbox.

pub mod bridge;
pub mod config;
pub mod credentials;
pub mod provision;
pub mod proxy;
pub mod sandbox;
pub mod session;
pub mod store;
pub mod tunnel;

pub use config::BurrowConfig;
pub use tunnel::{Tunnel, TunnelOptions};
