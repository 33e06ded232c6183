//! Scripted console backend for tests.
//!
//! Plays the server side of the RFB handshake over an in-memory duplex
//! stream, records everything the proxy sends after the handshake, and
//! lets tests trigger the console-deleted event.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use xvp_config::{Config, VmId};
use xvp_rfb::protocol::{build_banner, parse_banner};
use xvp_rfb::{ServerInit, XvpCode, RFB_MAJOR};

use crate::types::{BackendError, BackendFactory, ConsoleBackend, TunnelStream};

/// Shared observation point for one mock backend.
#[derive(Debug, Default)]
pub struct MockState {
    /// Bytes received from the proxy after each handshake, one entry
    /// per `open_stream` incarnation.
    pub received: Mutex<Vec<Vec<u8>>>,
    /// Lifecycle codes the proxy dispatched.
    pub codes: Mutex<Vec<XvpCode>>,
    /// How many times the proxy opened a stream.
    pub opens: AtomicUsize,
}

pub struct MockBackend {
    /// Framebuffer geometry advertised in ServerInit.
    pub width: u16,
    pub height: u16,
    pub pixel_format: [u8; 16],
    /// What `handle_message_code` reports.
    code_result: AtomicBool,
    state: Arc<MockState>,
    delete_rx: Mutex<mpsc::UnboundedReceiver<()>>,
    delete_tx: mpsc::UnboundedSender<()>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        let (delete_tx, delete_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            width: 800,
            height: 600,
            pixel_format: [0x20; 16],
            code_result: AtomicBool::new(true),
            state: Arc::new(MockState::default()),
            delete_rx: Mutex::new(delete_rx),
            delete_tx,
        })
    }

    pub fn state(&self) -> Arc<MockState> {
        self.state.clone()
    }

    /// Make subsequent lifecycle commands fail.
    pub fn refuse_lifecycle(&self) {
        self.code_result.store(false, Ordering::SeqCst);
    }

    /// Simulate the console resource being deleted.
    pub fn delete_console(&self) {
        let _ = self.delete_tx.send(());
    }
}

#[async_trait]
impl ConsoleBackend for MockBackend {
    async fn open_stream(&self) -> Result<TunnelStream, BackendError> {
        let incarnation = self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.state.received.lock().await.push(Vec::new());

        let (proxy_end, mut server_end) = duplex(16 * 1024);
        let state = self.state.clone();
        let init = ServerInit {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            name: "scripted console".into(),
        };

        tokio::spawn(async move {
            // Server side of the RFB 3.3 handshake.
            if server_end.write_all(&build_banner(RFB_MAJOR, 3)).await.is_err() {
                return;
            }
            let mut banner = [0u8; 12];
            if server_end.read_exact(&mut banner).await.is_err() {
                return;
            }
            if parse_banner(&banner).is_none() {
                return;
            }
            if server_end.write_all(&1u32.to_be_bytes()).await.is_err() {
                return;
            }
            let mut shared = [0u8; 1];
            if server_end.read_exact(&mut shared).await.is_err() {
                return;
            }
            if server_end.write_all(&init.to_bytes()).await.is_err() {
                return;
            }

            // Record everything that follows until the proxy hangs up.
            let mut buf = [0u8; 4096];
            loop {
                match server_end.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        state.received.lock().await[incarnation]
                            .extend_from_slice(&buf[..n]);
                    }
                }
            }
        });

        Ok(Box::new(proxy_end))
    }

    async fn event_wait(&self) -> bool {
        self.delete_rx.lock().await.recv().await.is_some()
    }

    async fn handle_message_code(&self, code: XvpCode) -> bool {
        self.state.codes.lock().await.push(code);
        self.code_result.load(Ordering::SeqCst)
    }
}

/// Factory returning the same mock for every session.
pub struct MockFactory {
    pub backend: Arc<MockBackend>,
}

impl MockFactory {
    pub fn new(backend: Arc<MockBackend>) -> Arc<Self> {
        Arc::new(Self { backend })
    }
}

impl BackendFactory for MockFactory {
    fn create(&self, _config: &Arc<Config>, _vm: VmId) -> Arc<dyn ConsoleBackend> {
        self.backend.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_performs_server_handshake() {
        let backend = MockBackend::new();
        let mut stream = backend.open_stream().await.unwrap();

        let mut banner = [0u8; 12];
        stream.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"RFB 003.003\n");

        stream.write_all(b"RFB 003.003\n").await.unwrap();

        let mut security = [0u8; 4];
        stream.read_exact(&mut security).await.unwrap();
        assert_eq!(u32::from_be_bytes(security), 1);

        stream.write_all(&[1]).await.unwrap();

        let mut head = [0u8; 24];
        stream.read_exact(&mut head).await.unwrap();
        let (w, h, _, name_len) = ServerInit::parse_fixed(&head);
        assert_eq!((w, h), (800, 600));
        let mut name = vec![0u8; name_len];
        stream.read_exact(&mut name).await.unwrap();

        // Post-handshake bytes are recorded.
        stream.write_all(b"hello").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(backend.state().received.lock().await[0], b"hello");
    }

    #[tokio::test]
    async fn delete_console_wakes_event_wait() {
        let backend = MockBackend::new();
        backend.delete_console();
        assert!(backend.event_wait().await);
    }

    #[tokio::test]
    async fn lifecycle_codes_are_recorded() {
        let backend = MockBackend::new();
        assert!(backend.handle_message_code(XvpCode::Reboot).await);
        backend.refuse_lifecycle();
        assert!(!backend.handle_message_code(XvpCode::Reset).await);
        assert_eq!(
            *backend.state().codes.lock().await,
            vec![XvpCode::Reboot, XvpCode::Reset]
        );
    }
}
