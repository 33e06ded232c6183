//! Bidirectional relaying between the client socket and the console.
//!
//! The writer task reads typed messages from the client so it can cache
//! what a reconnect needs, consume XVP extension messages, and rewrite
//! cut text as key events; everything else goes to the console
//! verbatim.  The reader task copies console bytes back unparsed.
//! Cancellation is observed at message boundaries through a watch
//! channel, and the writer hands the client read-half back so the
//! session can resume it on a fresh console stream.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use xvp_backend::{ConsoleBackend, TunnelStream};
use xvp_rfb::cuttext::cut_text_key_events;
use xvp_rfb::protocol::{build_xvp_message, set_encodings_list};
use xvp_rfb::trace::{trace_client, trace_server};
use xvp_rfb::{ClientMessageType, XvpCode, XVP_ENCODING, XVP_MESSAGE_VERSION};

use crate::session::SessionEvent;

/// Modest buffer: many relay instances may be running.
pub const RELAY_BUF_SIZE: usize = 4096;

/// Client state replayed into a reconnected console.
#[derive(Debug, Default)]
pub struct ReplayCache {
    /// Complete SetPixelFormat message, as last sent.
    pub pixel_format: Option<Vec<u8>>,
    /// Complete SetEncodings message, as last sent.
    pub encodings: Option<Vec<u8>>,
    encodings_seen: bool,
}

/// Handles on a running relay pair.
pub struct Relay {
    cancel: watch::Sender<bool>,
    writer: JoinHandle<OwnedReadHalf>,
    reader: JoinHandle<()>,
}

impl Relay {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        client_rd: OwnedReadHalf,
        client_wr: Arc<Mutex<OwnedWriteHalf>>,
        server: TunnelStream,
        backend: Arc<dyn ConsoleBackend>,
        replay: Arc<Mutex<ReplayCache>>,
        vm_is_host: bool,
        trace: bool,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (server_rd, server_wr) = tokio::io::split(server);

        let writer = tokio::spawn(writer_task(
            client_rd,
            server_wr,
            client_wr.clone(),
            backend,
            replay,
            vm_is_host,
            trace,
            cancel_rx.clone(),
            events.clone(),
        ));
        let reader = tokio::spawn(reader_task(server_rd, client_wr, trace, cancel_rx, events));

        Self {
            cancel: cancel_tx,
            writer,
            reader,
        }
    }

    /// Stop both directions, shut the console stream down, and recover
    /// the client read-half for a later restart.
    pub async fn cancel(self) -> OwnedReadHalf {
        let _ = self.cancel.send(true);
        let client_rd = self.writer.await.expect("relay writer task");
        let _ = self.reader.await;
        client_rd
    }
}

#[allow(clippy::too_many_arguments)]
async fn writer_task(
    mut client_rd: OwnedReadHalf,
    mut server_wr: WriteHalf<TunnelStream>,
    client_wr: Arc<Mutex<OwnedWriteHalf>>,
    backend: Arc<dyn ConsoleBackend>,
    replay: Arc<Mutex<ReplayCache>>,
    vm_is_host: bool,
    trace: bool,
    mut cancel: watch::Receiver<bool>,
    events: mpsc::Sender<SessionEvent>,
) -> OwnedReadHalf {
    loop {
        // One message at a time: several can arrive back to back, and
        // some arrive one byte per read, so frame on the type byte.
        let first = tokio::select! {
            _ = cancel.changed() => {
                let _ = server_wr.shutdown().await;
                return client_rd;
            }
            r = client_rd.read_u8() => r,
        };
        let Ok(type_byte) = first else { break };

        let Some(mtype) = ClientMessageType::from_byte(type_byte) else {
            log::error!("Unrecognised client message type {}", type_byte);
            break;
        };

        let mut msg = vec![0u8; mtype.fixed_len()];
        msg[0] = type_byte;
        if client_rd.read_exact(&mut msg[1..]).await.is_err() {
            break;
        }

        match mtype {
            ClientMessageType::SetPixelFormat => {
                replay.lock().await.pixel_format = Some(msg.clone());
            }

            ClientMessageType::SetEncodings => {
                let count = u16::from_be_bytes([msg[2], msg[3]]) as usize;
                let at = msg.len();
                msg.resize(at + count * 4, 0);
                if client_rd.read_exact(&mut msg[at..]).await.is_err() {
                    break;
                }

                let mut cache = replay.lock().await;
                let first_seen = !cache.encodings_seen;
                cache.encodings_seen = true;
                cache.encodings = Some(msg.clone());
                if first_seen && set_encodings_list(&msg).contains(&XVP_ENCODING) {
                    drop(cache);
                    log::debug!("Client supports XVP extensions to RFB");
                    if !vm_is_host {
                        let init = build_xvp_message(XvpCode::Init);
                        if client_wr.lock().await.write_all(&init).await.is_err() {
                            break;
                        }
                    }
                }
            }

            ClientMessageType::ClientCutText => {
                let len = u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]) as usize;
                let at = msg.len();
                msg.resize(at + len, 0);
                if client_rd.read_exact(&mut msg[at..]).await.is_err() {
                    break;
                }
                if trace {
                    trace_client(&msg, false);
                }
                // The console ignores cut text; replay it as key events.
                let keys = cut_text_key_events(&msg[8..]);
                if server_wr.write_all(&keys).await.is_err() {
                    return client_rd;
                }
                continue;
            }

            ClientMessageType::Xvp => {
                let (version, code) = (msg[2], msg[3]);
                if version != XVP_MESSAGE_VERSION {
                    log::error!("Unrecognised client XVP extension version {}", version);
                    break;
                }
                if trace {
                    trace_client(&msg, false);
                }
                // Lifecycle calls can block on the management API, so
                // they run beside the relay; a refusal is reported back
                // to the client.
                let backend = backend.clone();
                let client_wr = client_wr.clone();
                tokio::spawn(async move {
                    let ok = match XvpCode::from_byte(code) {
                        Some(code) => backend.handle_message_code(code).await,
                        None => false,
                    };
                    if !ok {
                        let fail = build_xvp_message(XvpCode::Fail);
                        let _ = client_wr.lock().await.write_all(&fail).await;
                    }
                });
                continue;
            }

            _ => {}
        }

        if trace {
            trace_client(&msg, false);
        }
        if server_wr.write_all(&msg).await.is_err() {
            // Console side gone; the reader notices and reports.
            return client_rd;
        }
    }

    let _ = events.send(SessionEvent::RelayEnded).await;
    client_rd
}

async fn reader_task(
    mut server_rd: ReadHalf<TunnelStream>,
    client_wr: Arc<Mutex<OwnedWriteHalf>>,
    trace: bool,
    mut cancel: watch::Receiver<bool>,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut buf = [0u8; RELAY_BUF_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.changed() => return,
            r = server_rd.read(&mut buf) => match r {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        if trace {
            trace_server(&buf[..n]);
        }
        if client_wr.lock().await.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = events.send(SessionEvent::RelayEnded).await;
}
