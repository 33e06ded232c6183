//! Console backends: how the proxy reaches a VM's RFB stream.
//!
//! The proxy core only sees the [`ConsoleBackend`] contract: open a
//! tunneled byte stream to the console, wait for the console to be torn
//! down, and run VM lifecycle commands.  The real implementation speaks
//! XenAPI; tests use the scripted mock.

pub mod mock;
pub mod tunnel;
pub mod types;
pub mod xapi;

pub use types::{BackendError, BackendErrorKind, BackendFactory, ConsoleBackend, TunnelStream};
pub use xapi::XapiFactory;
