//! Listener ownership, signal handling, and session spawning.
//!
//! The supervisor binds one listening socket per configured VM plus the
//! multiplex port, and owns the signal surface: a dedicated task turns
//! POSIX signals into typed events on the control channel, so the main
//! loop is a single `select!` over accepts and control events.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use xvp_config::{parser, Target, VNC_PORT_MAX, VNC_PORT_MIN};

use crate::context::ProxyContext;
use crate::registry::SessionRegistry;
use crate::session::{self, SessionParams};
use crate::{logging, session::SessionControl};

/// Pending-connection backlog per listening socket.
pub const LISTEN_BACKLOG: u32 = 10;

/// Control events, mostly signal-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// SIGHUP: re-open the log file.
    ReopenLog,
    /// SIGINT / SIGTERM: shut down cleanly.
    Terminate(i32),
    /// SIGUSR1: rebuild the configuration and all listeners.
    Reload,
    /// SIGUSR2: log the active session list.
    Dump,
    /// SIGQUIT: disconnect all sessions but keep serving.
    DisconnectAll,
}

struct Accepted {
    target: Target,
    stream: TcpStream,
    peer: SocketAddr,
}

pub struct Supervisor {
    ctx: Arc<ProxyContext>,
    config_path: PathBuf,
    registry: Arc<SessionRegistry>,
    listener_tasks: Vec<JoinHandle<()>>,
    accept_tx: mpsc::Sender<Accepted>,
    accept_rx: mpsc::Receiver<Accepted>,
    control_tx: mpsc::Sender<ControlEvent>,
    control_rx: mpsc::Receiver<ControlEvent>,
}

impl Supervisor {
    pub fn new(ctx: Arc<ProxyContext>, config_path: PathBuf) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::channel(16);
        Self {
            ctx,
            config_path,
            registry: SessionRegistry::new(),
            listener_tasks: Vec::new(),
            accept_tx,
            accept_rx,
            control_tx,
            control_rx,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Handle for injecting control events (signals do this in
    /// production; tests do it directly).
    pub fn control_sender(&self) -> mpsc::Sender<ControlEvent> {
        self.control_tx.clone()
    }

    /// Serve until told to terminate.  Returns the process exit code.
    pub async fn run(&mut self) -> i32 {
        spawn_signal_task(self.control_tx.clone());

        if let Err(e) = self.bind_all() {
            log::error!("{}", e);
            return 1;
        }

        loop {
            tokio::select! {
                accepted = self.accept_rx.recv() => {
                    let Some(accepted) = accepted else { return 0 };
                    self.spawn_session(accepted).await;
                }
                event = self.control_rx.recv() => {
                    let Some(event) = event else { return 0 };
                    match event {
                        ControlEvent::ReopenLog => logging::reopen(),
                        ControlEvent::Terminate(signo) => {
                            log::info!(
                                "Terminating on signal {} ({})",
                                signo,
                                signal_name(signo)
                            );
                            self.registry.disconnect_all().await;
                            return 0;
                        }
                        ControlEvent::Reload => {
                            if !self.reload().await {
                                return 1;
                            }
                        }
                        ControlEvent::Dump => {
                            log::info!("Dumping active session list");
                            self.registry.dump().await;
                        }
                        ControlEvent::DisconnectAll => {
                            log::info!("Disconnecting all active sessions");
                            self.registry.disconnect_all().await;
                        }
                    }
                }
            }
        }
    }

    /// Bind every configured port and start its accept loop.
    fn bind_all(&mut self) -> Result<(), String> {
        for (target, port) in self.ctx.config.listen_targets() {
            let listener = bind_listener(port).map_err(|e| {
                format!("Unable to set up listening socket on port {}: {}", port, e)
            })?;
            let name = self.ctx.config.target_name(target);
            if (VNC_PORT_MIN..=VNC_PORT_MAX).contains(&port) {
                log::info!(
                    "Listening on port {} (VNC :{}) for {}",
                    port,
                    port - VNC_PORT_MIN,
                    name
                );
            } else {
                log::info!("Listening on port {} for {}", port, name);
            }
            self.listener_tasks
                .push(tokio::spawn(accept_loop(listener, target, self.accept_tx.clone())));
        }
        Ok(())
    }

    /// SIGUSR1: throw the whole graph away and rebuild it.  Sessions in
    /// flight keep their snapshot of the old one.
    async fn reload(&mut self) -> bool {
        log::info!("Re-reading config file on signal");
        for task in self.listener_tasks.drain(..) {
            task.abort();
        }

        let config = match parser::load(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("{}", e);
                return false;
            }
        };
        config.log_summary();
        self.ctx = Arc::new(self.ctx.with_config(config));

        match self.bind_all() {
            Ok(()) => true,
            Err(e) => {
                log::error!("{}", e);
                false
            }
        }
    }

    async fn spawn_session(&self, accepted: Accepted) {
        let IpAddr::V4(client_ip) = accepted.peer.ip() else {
            log::error!("Unexpected non-IPv4 peer {}", accepted.peer);
            return;
        };
        let client_name = resolve_client_name(client_ip).await;

        let ctx = self.ctx.clone();
        let id = Uuid::new_v4().to_string();
        let name = format!(
            "proxy: {} to {}",
            client_name,
            ctx.config.target_name(accepted.target)
        );
        let (control_tx, control_rx) = mpsc::channel::<SessionControl>(4);
        self.registry.insert(id.clone(), name.clone(), control_tx).await;
        log::info!("Starting {}", name);

        let registry = self.registry.clone();
        let params = SessionParams {
            ctx,
            id: id.clone(),
            target: accepted.target,
            client_name,
            client_ip,
            stream: accepted.stream,
            registry: registry.clone(),
        };
        tokio::spawn(async move {
            let exit = session::run(params, control_rx).await;
            let name = registry.remove(&id).await.unwrap_or(name);
            log::debug!("Session exited {} ({})", exit.code(), name);
            log::info!("Stopping: {}", name);
        });
    }
}

fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
    socket.listen(LISTEN_BACKLOG)
}

async fn accept_loop(listener: TcpListener, target: Target, tx: mpsc::Sender<Accepted>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if tx.send(Accepted { target, stream, peer }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                log::error!("accept: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// A printable name for the client, as the session logs want it.
async fn resolve_client_name(ip: Ipv4Addr) -> String {
    if ip.is_loopback() {
        return "localhost".to_string();
    }
    let lookup =
        tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&IpAddr::V4(ip))).await;
    match lookup {
        Ok(Ok(name)) => name,
        _ => ip.to_string(),
    }
}

fn signal_name(signo: i32) -> &'static str {
    match signo {
        2 => "SIGINT",
        15 => "SIGTERM",
        _ => "signal",
    }
}

/// Turn POSIX signals into control events.  The handlers do nothing but
/// feed the channel; all real work happens in the supervisor loop.
fn spawn_signal_task(tx: mpsc::Sender<ControlEvent>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("Unable to install signal handlers: {}", e);
                return;
            }
        };
        let Ok(mut int) = signal(SignalKind::interrupt()) else { return };
        let Ok(mut term) = signal(SignalKind::terminate()) else { return };
        let Ok(mut usr1) = signal(SignalKind::user_defined1()) else { return };
        let Ok(mut usr2) = signal(SignalKind::user_defined2()) else { return };
        let Ok(mut quit) = signal(SignalKind::quit()) else { return };

        loop {
            let event = tokio::select! {
                _ = hup.recv() => ControlEvent::ReopenLog,
                _ = int.recv() => ControlEvent::Terminate(2),
                _ = term.recv() => ControlEvent::Terminate(15),
                _ = usr1.recv() => ControlEvent::Reload,
                _ = usr2.recv() => ControlEvent::Dump,
                _ = quit.recv() => ControlEvent::DisconnectAll,
            };
            if tx.send(event).await.is_err() {
                return;
            }
        }
    });
}
