//! The per-client proxy session.
//!
//! One task per accepted client.  The client-side handshake runs first:
//! version negotiation, security selection (plain VNC or the XVP
//! user/target extension), challenge-response authentication.  Only
//! after the client has been validated is the console side brought up,
//! by a helper task, so a blocked backend never stops the session from
//! noticing a dead client or a disconnect request.  Once both ends are
//! ready the relay tasks take over and the session just reacts to
//! events: relay termination, console loss (reconnect), disconnects.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use xvp_backend::{BackendError, ConsoleBackend, TunnelStream};
use xvp_config::{is_uuid, Target, VmId};
use xvp_rfb::protocol::{
    build_banner, build_failure_reason, build_fb_update_request, parse_banner,
};
use xvp_rfb::trace::trace_client;
use xvp_rfb::{
    version_known, SecurityType, ServerInit, RFB_MAJOR, RFB_MINOR_CLIENT, RFB_MINOR_SERVER,
};

use crate::context::ProxyContext;
use crate::registry::SessionRegistry;
use crate::relay::{Relay, ReplayCache};

/// Commands a session accepts from the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Disconnect,
}

/// Events the helper tasks feed back to the session.
pub enum SessionEvent {
    /// The backend handshake finished, successfully or not.
    BackendReady {
        result: Option<(TunnelStream, ServerDetails)>,
    },
    /// The console resource was deleted behind us.
    ConsoleDeleted,
    /// A relay direction terminated.
    RelayEnded,
}

/// What the console advertised in its ServerInit.
#[derive(Debug, Clone, Copy)]
pub struct ServerDetails {
    pub width: u16,
    pub height: u16,
    pub pixel_format: [u8; 16],
}

/// How a session ended; becomes the logged exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// Normal teardown (client EOF, disconnect request, reconnect
    /// policy expiry).
    Clean,
    /// The client broke protocol, failed authentication, or vanished.
    ClientGone,
    /// The console backend could not be brought up.
    BackendFailed,
}

impl SessionExit {
    pub fn code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::ClientGone => 1,
            Self::BackendFailed => 2,
        }
    }
}

/// Everything a session needs at spawn time.
pub struct SessionParams {
    pub ctx: Arc<ProxyContext>,
    pub id: String,
    pub target: Target,
    pub client_name: String,
    pub client_ip: Ipv4Addr,
    pub stream: TcpStream,
    pub registry: Arc<SessionRegistry>,
}

struct ClientHandshake {
    shared: bool,
    vm: VmId,
}

struct Session {
    ctx: Arc<ProxyContext>,
    id: String,
    target: Target,
    client_name: String,
    client_ip: Ipv4Addr,
    registry: Arc<SessionRegistry>,
}

/// Run one session to completion.
pub async fn run(params: SessionParams, control: mpsc::Receiver<SessionControl>) -> SessionExit {
    // The backend handshake/watcher tasks block on the management API;
    // they must not outlive the session they serve.
    let mut helpers: Vec<tokio::task::JoinHandle<()>> = Vec::new();
    let exit = drive(params, control, &mut helpers).await;
    for helper in helpers {
        helper.abort();
    }
    exit
}

async fn drive(
    params: SessionParams,
    mut control: mpsc::Receiver<SessionControl>,
    helpers: &mut Vec<tokio::task::JoinHandle<()>>,
) -> SessionExit {
    let SessionParams {
        ctx,
        id,
        target,
        client_name,
        client_ip,
        stream,
        registry,
    } = params;

    stream.set_nodelay(true).ok();
    let (mut client_rd, client_wr) = stream.into_split();
    let client_wr = Arc::new(Mutex::new(client_wr));

    let mut session = Session {
        ctx,
        id,
        target,
        client_name,
        client_ip,
        registry,
    };

    // The handshake itself blocks only on the client; a disconnect
    // request must still get through.
    let handshake = tokio::select! {
        r = session.client_handshake(&mut client_rd, &client_wr) => r,
        _ = control.recv() => return SessionExit::Clean,
    };
    let handshake = match handshake {
        Ok(handshake) => handshake,
        Err(exit) => return exit,
    };

    let ctx = session.ctx.clone();
    let vm = handshake.vm;
    let vm_name = ctx.config.vm(vm).name.clone();
    let vm_is_host = ctx.config.vm_is_host(vm);
    let backend = ctx.factory.create(&ctx.config, vm);
    let replay = Arc::new(Mutex::new(ReplayCache::default()));
    let (ev_tx, mut ev_rx) = mpsc::channel::<SessionEvent>(16);

    helpers.push(spawn_backend_task(
        backend.clone(),
        handshake.shared,
        false,
        replay.clone(),
        ctx.trace,
        ev_tx.clone(),
    ));

    // Waiting for the first backend handshake.  The client has nothing
    // to say until it sees ServerInit; readability means it is gone.
    let mut probe = [0u8; 1];
    let (server_stream, details) = loop {
        tokio::select! {
            ev = ev_rx.recv() => match ev {
                Some(SessionEvent::BackendReady { result: Some(ready) }) => break ready,
                Some(SessionEvent::BackendReady { result: None }) => return SessionExit::BackendFailed,
                Some(_) => {}
                None => return SessionExit::BackendFailed,
            },
            _ = control.recv() => return SessionExit::Clean,
            _ = client_rd.read(&mut probe) => return SessionExit::ClientGone,
        }
    };

    // Synthesize our own ServerInit: the console's geometry, our name.
    let init = ServerInit {
        width: details.width,
        height: details.height,
        pixel_format: details.pixel_format,
        name: format!("VM Console - {}", vm_name),
    };
    if client_wr.lock().await.write_all(&init.to_bytes()).await.is_err() {
        return SessionExit::ClientGone;
    }

    log::debug!("Starting relay tasks");
    let mut relay = Some(Relay::start(
        client_rd,
        client_wr.clone(),
        server_stream,
        backend.clone(),
        replay.clone(),
        vm_is_host,
        ctx.trace,
        ev_tx.clone(),
    ));

    // Idling: the relay does the work, we watch for events.
    loop {
        tokio::select! {
            ev = ev_rx.recv() => match ev {
                Some(SessionEvent::RelayEnded) => {
                    if let Some(relay) = relay.take() {
                        relay.cancel().await;
                    }
                    return SessionExit::Clean;
                }
                Some(SessionEvent::ConsoleDeleted) => {
                    let Some(active) = relay.take() else { continue };
                    let client_rd = active.cancel().await;
                    log::debug!("Closed old console connection");

                    let delay = ctx.reconnect_delay;
                    if delay <= 0 {
                        tokio::time::sleep(Duration::from_secs(delay.unsigned_abs())).await;
                        log::info!("Terminating after console loss");
                        return SessionExit::Clean;
                    }
                    log::info!("Reconnect attempt in {} seconds", delay);
                    tokio::time::sleep(Duration::from_secs(delay as u64)).await;

                    helpers.push(spawn_backend_task(
                        backend.clone(),
                        handshake.shared,
                        true,
                        replay.clone(),
                        ctx.trace,
                        ev_tx.clone(),
                    ));
                    let stream = loop {
                        tokio::select! {
                            ev = ev_rx.recv() => match ev {
                                Some(SessionEvent::BackendReady { result: Some((stream, _)) }) => break stream,
                                Some(SessionEvent::BackendReady { result: None }) => return SessionExit::BackendFailed,
                                Some(SessionEvent::RelayEnded) => return SessionExit::Clean,
                                Some(SessionEvent::ConsoleDeleted) => {}
                                None => return SessionExit::BackendFailed,
                            },
                            _ = control.recv() => return SessionExit::Clean,
                        }
                    };
                    relay = Some(Relay::start(
                        client_rd,
                        client_wr.clone(),
                        stream,
                        backend.clone(),
                        replay.clone(),
                        vm_is_host,
                        ctx.trace,
                        ev_tx.clone(),
                    ));
                }
                Some(SessionEvent::BackendReady { .. }) => {}
                None => {
                    if let Some(relay) = relay.take() {
                        relay.cancel().await;
                    }
                    return SessionExit::Clean;
                }
            },
            _ = control.recv() => {
                if let Some(relay) = relay.take() {
                    relay.cancel().await;
                }
                return SessionExit::Clean;
            }
        }
    }
}

impl Session {
    /// Version, security and authentication against the client.
    async fn client_handshake(
        &mut self,
        client_rd: &mut OwnedReadHalf,
        client_wr: &Arc<Mutex<OwnedWriteHalf>>,
    ) -> Result<ClientHandshake, SessionExit> {
        let config = self.ctx.config.clone();

        // SERVER_VERSION: we offer the highest version we speak.
        write_client(client_wr, &build_banner(RFB_MAJOR, RFB_MINOR_CLIENT)).await?;

        // CLIENT_VERSION
        let mut banner = [0u8; 16];
        let mut got = 0;
        while got < banner.len() {
            let b = client_rd.read_u8().await.map_err(|_| SessionExit::ClientGone)?;
            banner[got] = b;
            got += 1;
            if b == b'\n' {
                break;
            }
        }
        let (major, minor) =
            parse_banner(&banner[..got]).ok_or(SessionExit::ClientGone)?;
        if !version_known(major, minor) {
            return Err(SessionExit::ClientGone);
        }
        log::debug!("RFB version {:03}.{:03} agreed", major, minor);

        // REQUIRE_AUTH / SELECT_AUTH
        let security = if minor == 3 {
            // 3.3: no list, we decide.
            write_client(client_wr, &(SecurityType::Vnc.to_byte() as u32).to_be_bytes()).await?;
            SecurityType::Vnc
        } else {
            let list = [2u8, SecurityType::Vnc.to_byte(), SecurityType::Xvp.to_byte()];
            write_client(client_wr, &list).await?;
            let choice = client_rd.read_u8().await.map_err(|_| SessionExit::ClientGone)?;
            match SecurityType::from_byte(choice) {
                Some(s @ (SecurityType::Vnc | SecurityType::Xvp)) => s,
                _ => return Err(SessionExit::ClientGone),
            }
        };
        log::debug!("RFB security type {} agreed", security.to_byte());

        // USER_TARGET: the XVP flavor carries "user" and "[pool:]vm".
        // A bad target is remembered, not rejected: the exchange must
        // continue so that a probing client cannot tell an unknown VM
        // from a bad password by timing.
        let mut wrongvm = false;
        if security == SecurityType::Xvp {
            let user_len = client_rd.read_u8().await.map_err(|_| SessionExit::ClientGone)? as usize;
            let target_len = client_rd.read_u8().await.map_err(|_| SessionExit::ClientGone)? as usize;
            let mut buf = vec![0u8; user_len + target_len];
            client_rd
                .read_exact(&mut buf)
                .await
                .map_err(|_| SessionExit::ClientGone)?;
            let username = String::from_utf8_lossy(&buf[..user_len]).into_owned();
            let target_text = String::from_utf8_lossy(&buf[user_len..]).into_owned();
            log::info!("XVP auth credentials {}@{}", username, target_text);

            let (pool_name, vm_name) = match target_text.split_once(':') {
                Some((pool, vm)) => (Some(pool.to_string()), vm.to_string()),
                None => (None, target_text),
            };

            let pool = match &pool_name {
                Some(name) => match config.pool_by_name(name) {
                    Some(pool) => Some(pool),
                    None => {
                        wrongvm = true;
                        None
                    }
                },
                None => None,
            };

            if !wrongvm {
                let resolved = if is_uuid(&vm_name) {
                    config.vm_by_uuid(pool, &vm_name)
                } else {
                    config.vm_by_name(pool, &vm_name)
                };

                match self.target {
                    Target::Multiplex => match resolved {
                        Some(vm) => {
                            self.target = Target::Vm(vm);
                            log::info!(
                                "Multiplexer selecting VM {} in pool {}",
                                config.vm(vm).name,
                                config.pool(vm).name
                            );
                            let name = format!(
                                "proxy: {} to {}",
                                self.client_name,
                                config.vm(vm).name
                            );
                            self.registry.rename(&self.id, name).await;
                        }
                        None => wrongvm = true,
                    },
                    Target::Vm(current) => {
                        // Connected to a VM-specific port: a selector,
                        // if given, had better match.
                        if (pool_name.is_some() || !vm_name.is_empty())
                            && resolved != Some(current)
                        {
                            wrongvm = true;
                        }
                    }
                }
            }
        }

        // CHALLENGE_AUTH / RESPONSE_AUTH
        let mut challenge = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut challenge);
        write_client(client_wr, &challenge).await?;

        let mut response = [0u8; 16];
        client_rd
            .read_exact(&mut response)
            .await
            .map_err(|_| SessionExit::ClientGone)?;

        let authok = !wrongvm
            && match self.target {
                Target::Vm(vm) => xvp_auth::vnc_challenge_ok(
                    &config.vm(vm).password,
                    config.otp,
                    self.client_ip,
                    &challenge,
                    &response,
                ),
                // No target was ever selected on the multiplex port.
                Target::Multiplex => false,
            };

        // CONFIRM_AUTH
        let result: u32 = if authok { 0 } else { 1 };
        write_client(client_wr, &result.to_be_bytes()).await?;
        if !authok {
            log::info!("Client authentication failed");
            if minor >= RFB_MINOR_CLIENT {
                let _ = client_wr
                    .lock()
                    .await
                    .write_all(&build_failure_reason("Access denied"))
                    .await;
            }
            return Err(SessionExit::ClientGone);
        }
        log::debug!("Client authentication succeeded");

        // CLIENT_INIT
        let shared = client_rd.read_u8().await.map_err(|_| SessionExit::ClientGone)? != 0;

        match self.target {
            Target::Vm(vm) => Ok(ClientHandshake { shared, vm }),
            Target::Multiplex => Err(SessionExit::ClientGone),
        }
    }
}

async fn write_client(
    client_wr: &Arc<Mutex<OwnedWriteHalf>>,
    buf: &[u8],
) -> Result<(), SessionExit> {
    client_wr
        .lock()
        .await
        .write_all(buf)
        .await
        .map_err(|_| SessionExit::ClientGone)
}

// ── Backend handshake helper ────────────────────────────────────────────

/// Bring up the console side without blocking the session, then stay
/// around watching for console deletion.
fn spawn_backend_task(
    backend: Arc<dyn ConsoleBackend>,
    shared: bool,
    reinit: bool,
    replay: Arc<Mutex<ReplayCache>>,
    trace: bool,
    events: mpsc::Sender<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let result = server_handshake(backend.as_ref(), shared, reinit, &replay, trace).await;
        let ok = result.is_ok();
        match result {
            Ok(ready) => {
                let _ = events
                    .send(SessionEvent::BackendReady { result: Some(ready) })
                    .await;
            }
            Err(e) => {
                log::error!("{}", e);
                let _ = events.send(SessionEvent::BackendReady { result: None }).await;
            }
        }

        if ok && backend.event_wait().await {
            log::info!("Lost connection to console");
            let _ = events.send(SessionEvent::ConsoleDeleted).await;
        }
    })
}

/// The console-side handshake: RFB 3.3, security NONE, ClientInit,
/// ServerInit.  On a reconnect the cached client state is replayed so
/// the client never notices the console changed underneath it.
async fn server_handshake(
    backend: &dyn ConsoleBackend,
    shared: bool,
    reinit: bool,
    replay: &Mutex<ReplayCache>,
    trace: bool,
) -> Result<(TunnelStream, ServerDetails), BackendError> {
    let mut stream = backend.open_stream().await?;

    let mut banner = [0u8; 12];
    stream.read_exact(&mut banner).await?;
    let (major, minor) = parse_banner(&banner).ok_or_else(|| {
        BackendError::protocol(format!(
            "Unsupported server version: {}",
            String::from_utf8_lossy(&banner)
        ))
    })?;
    if !version_known(major, minor) {
        return Err(BackendError::protocol(format!(
            "Unsupported server version: {:03}.{:03}",
            major, minor
        )));
    }
    stream
        .write_all(&build_banner(RFB_MAJOR, RFB_MINOR_SERVER))
        .await?;

    let mut security = [0u8; 4];
    stream.read_exact(&mut security).await?;
    let security = u32::from_be_bytes(security);
    if security != u32::from(SecurityType::None.to_byte()) {
        return Err(BackendError::protocol(format!(
            "Unexpected security type: {}",
            security
        )));
    }

    stream.write_all(&[u8::from(shared)]).await?;

    let mut head = [0u8; 24];
    stream.read_exact(&mut head).await?;
    let (width, height, pixel_format, name_len) = ServerInit::parse_fixed(&head);
    let mut name = vec![0u8; name_len];
    stream.read_exact(&mut name).await?;

    if reinit {
        let (pixel_format_msg, encodings_msg) = {
            let cache = replay.lock().await;
            (cache.pixel_format.clone(), cache.encodings.clone())
        };
        if let Some(msg) = pixel_format_msg {
            if trace {
                trace_client(&msg, true);
            }
            stream.write_all(&msg).await?;
        }
        if let Some(msg) = encodings_msg {
            if trace {
                trace_client(&msg, true);
            }
            stream.write_all(&msg).await?;
        }
        let request = build_fb_update_request(false, 0, 0, width, height);
        if trace {
            trace_client(&request, true);
        }
        stream.write_all(&request).await?;
    }

    log::debug!("Server handshake successful");
    Ok((
        stream,
        ServerDetails {
            width,
            height,
            pixel_format,
        },
    ))
}
