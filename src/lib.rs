//! xvp: a multiplexing VNC proxy for the consoles of pool-hosted
//! virtual machines.
//!
//! The proxy listens on one TCP port per configured VM (plus an
//! optional shared multiplex port), authenticates each client with the
//! VM's VNC password, then bridges the client to the VM's console
//! stream obtained through the pool's management API.

pub mod context;
pub mod logging;
pub mod registry;
pub mod relay;
pub mod session;
pub mod supervisor;

pub use context::ProxyContext;
