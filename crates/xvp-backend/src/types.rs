//! The backend contract the proxy core consumes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use xvp_config::{Config, VmId};
use xvp_rfb::XvpCode;

/// Anything that can carry the console byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A full-duplex console stream, positioned at the server's RFB banner.
pub type TunnelStream = Box<dyn AsyncStream>;

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Management API refused or failed a call.
    Api,
    /// The console tunnel could not be established.
    Tunnel,
    /// The console spoke something other than the expected protocol.
    Protocol,
    /// VM or console not found.
    NotFound,
}

#[derive(Debug, Clone)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn api(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Api,
            message: message.into(),
        }
    }

    pub fn tunnel(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Tunnel,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Protocol,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::NotFound,
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::tunnel(e.to_string())
    }
}

// ── The contract ────────────────────────────────────────────────────────

/// What the proxy core needs from the machinery behind a VM's console.
///
/// One backend instance serves one session; it may cache management-API
/// state across reconnects of the same session.
#[async_trait]
pub trait ConsoleBackend: Send + Sync {
    /// Establish the console byte stream, positioned at the start of the
    /// server's RFB version banner.
    async fn open_stream(&self) -> Result<TunnelStream, BackendError>;

    /// Block until the console resource is deleted (VM shutdown, reboot
    /// or migration).  Returns false on an unrecoverable API error.
    async fn event_wait(&self) -> bool;

    /// Run a VM lifecycle command on behalf of the client.
    async fn handle_message_code(&self, code: XvpCode) -> bool;
}

/// Creates the backend for a freshly authenticated session.
pub trait BackendFactory: Send + Sync {
    fn create(&self, config: &Arc<Config>, vm: VmId) -> Arc<dyn ConsoleBackend>;
}
