//! End-to-end proxy sessions over loopback sockets against the
//! scripted mock backend.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use xvp::context::ProxyContext;
use xvp::registry::SessionRegistry;
use xvp::session::{self, SessionControl, SessionExit, SessionParams};
use xvp::supervisor::{ControlEvent, Supervisor};
use xvp_auth::{encrypt_vnc, to_hex, vnc_challenge_response, OtpPolicy};
use xvp_backend::mock::{MockBackend, MockFactory};
use xvp_config::{parser, Config, Host, Pool, Target, Vm, VmId};
use xvp_rfb::protocol::build_fb_update_request;
use xvp_rfb::XVP_ENCODING;

const VM1_PASSWORD: &str = "secret1";
const VM2_PASSWORD: &str = "secret2";

fn test_config() -> Config {
    Config {
        otp: OtpPolicy::default(),
        multiplex_port: Some(5999),
        pools: vec![Pool {
            name: "pool1".into(),
            domain: ".example.com".into(),
            manager: "root".into(),
            password: [0u8; 16],
            hosts: vec![Host {
                hostname: "xen1".into(),
                address: String::new(),
                hostname_is_ipv4: false,
            }],
            vms: vec![
                Vm {
                    port: 5901,
                    name: "vm1".into(),
                    uuid: None,
                    password: encrypt_vnc(VM1_PASSWORD),
                },
                Vm {
                    port: 5902,
                    name: "vm2".into(),
                    uuid: None,
                    password: encrypt_vnc(VM2_PASSWORD),
                },
            ],
        }],
    }
}

struct Harness {
    client: TcpStream,
    handle: JoinHandle<SessionExit>,
    control: mpsc::Sender<SessionControl>,
    registry: Arc<SessionRegistry>,
    backend: Arc<MockBackend>,
}

async fn start_session(target: Target, reconnect: i64) -> Harness {
    let backend = MockBackend::new();
    start_session_with(target, reconnect, backend).await
}

async fn start_session_with(target: Target, reconnect: i64, backend: Arc<MockBackend>) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (proxy_side, _) = listener.accept().await.unwrap();

    let ctx = Arc::new(ProxyContext {
        config: Arc::new(test_config()),
        reconnect_delay: reconnect,
        trace: false,
        factory: MockFactory::new(backend.clone()),
    });
    let registry = SessionRegistry::new();
    let (control_tx, control_rx) = mpsc::channel(4);
    registry
        .insert(
            "test-session".into(),
            format!("proxy: localhost to {}", ctx.config.target_name(target)),
            control_tx.clone(),
        )
        .await;

    let params = SessionParams {
        ctx,
        id: "test-session".into(),
        target,
        client_name: "localhost".into(),
        client_ip: Ipv4Addr::LOCALHOST,
        stream: proxy_side,
        registry: registry.clone(),
    };
    let handle = tokio::spawn(session::run(params, control_rx));

    Harness {
        client,
        handle,
        control: control_tx,
        registry,
        backend,
    }
}

/// Drive the plain VNC-security handshake through ServerInit.
async fn vnc_handshake(client: &mut TcpStream, password: &str) -> String {
    let mut banner = [0u8; 12];
    client.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"RFB 003.008\n");
    client.write_all(b"RFB 003.008\n").await.unwrap();

    let mut count = [0u8; 1];
    client.read_exact(&mut count).await.unwrap();
    assert_eq!(count[0], 2);
    let mut types = [0u8; 2];
    client.read_exact(&mut types).await.unwrap();
    assert_eq!(types, [2, 22]);
    client.write_all(&[2]).await.unwrap();

    complete_challenge(client, password).await;
    read_server_init(client).await
}

/// The XVP-security variant: send `user@target`, then authenticate.
async fn xvp_handshake(client: &mut TcpStream, user: &str, target: &str, password: &str) {
    let mut banner = [0u8; 12];
    client.read_exact(&mut banner).await.unwrap();
    client.write_all(b"RFB 003.008\n").await.unwrap();

    let mut list = [0u8; 3];
    client.read_exact(&mut list).await.unwrap();
    assert_eq!(list, [2, 2, 22]);
    client.write_all(&[22]).await.unwrap();

    client
        .write_all(&[user.len() as u8, target.len() as u8])
        .await
        .unwrap();
    client.write_all(user.as_bytes()).await.unwrap();
    client.write_all(target.as_bytes()).await.unwrap();

    complete_challenge(client, password).await;
}

async fn complete_challenge(client: &mut TcpStream, password: &str) {
    let mut challenge = [0u8; 16];
    client.read_exact(&mut challenge).await.unwrap();
    let response = vnc_challenge_response(password, &challenge);
    client.write_all(&response).await.unwrap();
}

async fn read_auth_result(client: &mut TcpStream) -> u32 {
    let mut result = [0u8; 4];
    client.read_exact(&mut result).await.unwrap();
    u32::from_be_bytes(result)
}

/// Send ClientInit and read back the synthetic ServerInit name.
async fn read_server_init(client: &mut TcpStream) -> String {
    let result = read_auth_result(client).await;
    assert_eq!(result, 0, "authentication should have succeeded");
    client.write_all(&[1]).await.unwrap();

    let mut head = [0u8; 24];
    client.read_exact(&mut head).await.unwrap();
    let name_len = u32::from_be_bytes([head[20], head[21], head[22], head[23]]) as usize;
    let mut name = vec![0u8; name_len];
    client.read_exact(&mut name).await.unwrap();
    String::from_utf8(name).unwrap()
}

/// Poll until the mock has recorded `len` bytes in `incarnation`.
async fn wait_for_received(backend: &MockBackend, incarnation: usize, len: usize) -> Vec<u8> {
    for _ in 0..200 {
        {
            let state = backend.state();
            let received = state.received.lock().await;
            if received.len() > incarnation && received[incarnation].len() >= len {
                return received[incarnation].clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("mock backend never received {} bytes", len);
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn valid_login_relays_client_bytes_verbatim() {
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let mut h = start_session(vm1, 20).await;

    let name = vnc_handshake(&mut h.client, VM1_PASSWORD).await;
    assert_eq!(name, "VM Console - vm1");

    let key_event = [4u8, 1, 0, 0, 0, 0, 0, 0x61];
    h.client.write_all(&key_event).await.unwrap();

    let received = wait_for_received(&h.backend, 0, key_event.len()).await;
    assert_eq!(received, key_event);

    drop(h.client);
    let exit = h.handle.await.unwrap();
    assert_eq!(exit.code(), 0);
}

#[tokio::test]
async fn server_bytes_reach_the_client() {
    // FramebufferUpdateRequest is forwarded to the console, and its
    // (scripted) reply would flow back; here we check the request
    // arrives and the connection stays healthy.
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let mut h = start_session(vm1, 20).await;
    vnc_handshake(&mut h.client, VM1_PASSWORD).await;

    let request = build_fb_update_request(false, 0, 0, 800, 600);
    h.client.write_all(&request).await.unwrap();
    let received = wait_for_received(&h.backend, 0, request.len()).await;
    assert_eq!(received, request.to_vec());

    drop(h.client);
    assert_eq!(h.handle.await.unwrap(), SessionExit::Clean);
}

#[tokio::test]
async fn wrong_password_is_denied_with_reason() {
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let mut h = start_session(vm1, 20).await;

    let mut banner = [0u8; 12];
    h.client.read_exact(&mut banner).await.unwrap();
    h.client.write_all(b"RFB 003.008\n").await.unwrap();
    let mut list = [0u8; 3];
    h.client.read_exact(&mut list).await.unwrap();
    h.client.write_all(&[2]).await.unwrap();
    complete_challenge(&mut h.client, "not the password").await;

    assert_eq!(read_auth_result(&mut h.client).await, 1);
    let mut len = [0u8; 4];
    h.client.read_exact(&mut len).await.unwrap();
    let mut reason = vec![0u8; u32::from_be_bytes(len) as usize];
    h.client.read_exact(&mut reason).await.unwrap();
    assert_eq!(reason, b"Access denied");

    assert_eq!(h.handle.await.unwrap(), SessionExit::ClientGone);
}

#[tokio::test]
async fn rfb_33_client_gets_single_security_type() {
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let mut h = start_session(vm1, 20).await;

    let mut banner = [0u8; 12];
    h.client.read_exact(&mut banner).await.unwrap();
    h.client.write_all(b"RFB 003.003\n").await.unwrap();

    // 3.3: one big-endian u32, no list, no selection.
    let mut security = [0u8; 4];
    h.client.read_exact(&mut security).await.unwrap();
    assert_eq!(u32::from_be_bytes(security), 2);

    complete_challenge(&mut h.client, VM1_PASSWORD).await;
    let name = read_server_init(&mut h.client).await;
    assert_eq!(name, "VM Console - vm1");

    drop(h.client);
    assert_eq!(h.handle.await.unwrap(), SessionExit::Clean);
}

#[tokio::test]
async fn unknown_pool_still_runs_challenge_then_denies() {
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let mut h = start_session(vm1, 20).await;

    // The challenge/response completes even though the target is bogus,
    // so a probing client cannot distinguish this from a bad password.
    xvp_handshake(&mut h.client, "user", "nosuchpool:vm1", VM1_PASSWORD).await;

    assert_eq!(read_auth_result(&mut h.client).await, 1);
    let mut len = [0u8; 4];
    h.client.read_exact(&mut len).await.unwrap();
    let mut reason = vec![0u8; u32::from_be_bytes(len) as usize];
    h.client.read_exact(&mut reason).await.unwrap();
    assert_eq!(reason, b"Access denied");

    assert_eq!(h.handle.await.unwrap(), SessionExit::ClientGone);
}

#[tokio::test]
async fn multiplex_client_selects_vm_by_pool_and_name() {
    let mut h = start_session(Target::Multiplex, 20).await;

    xvp_handshake(&mut h.client, "operator", "pool1:vm2", VM2_PASSWORD).await;
    let name = read_server_init(&mut h.client).await;
    assert_eq!(name, "VM Console - vm2");

    // The session is renamed after target selection.
    assert_eq!(
        h.registry.name_of("test-session").await.unwrap(),
        "proxy: localhost to vm2"
    );

    drop(h.client);
    assert_eq!(h.handle.await.unwrap(), SessionExit::Clean);
}

#[tokio::test]
async fn multiplex_without_selection_fails_auth() {
    let mut h = start_session(Target::Multiplex, 20).await;

    // VNC security on the multiplex port: no target was ever chosen.
    let mut banner = [0u8; 12];
    h.client.read_exact(&mut banner).await.unwrap();
    h.client.write_all(b"RFB 003.008\n").await.unwrap();
    let mut list = [0u8; 3];
    h.client.read_exact(&mut list).await.unwrap();
    h.client.write_all(&[2]).await.unwrap();
    complete_challenge(&mut h.client, VM1_PASSWORD).await;

    assert_eq!(read_auth_result(&mut h.client).await, 1);
    assert_eq!(h.handle.await.unwrap(), SessionExit::ClientGone);
}

#[tokio::test]
async fn selector_mismatch_on_vm_port_is_denied() {
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let mut h = start_session(vm1, 20).await;

    // Connected to vm1's port but asking for vm2, with vm2's password.
    xvp_handshake(&mut h.client, "user", "pool1:vm2", VM2_PASSWORD).await;
    assert_eq!(read_auth_result(&mut h.client).await, 1);
    assert_eq!(h.handle.await.unwrap(), SessionExit::ClientGone);
}

#[tokio::test]
async fn xvp_encoding_triggers_unsolicited_init() {
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let mut h = start_session(vm1, 20).await;
    vnc_handshake(&mut h.client, VM1_PASSWORD).await;

    let mut msg = vec![2u8, 0, 0, 2];
    msg.extend_from_slice(&0i32.to_be_bytes());
    msg.extend_from_slice(&XVP_ENCODING.to_be_bytes());
    h.client.write_all(&msg).await.unwrap();

    // The proxy announces extension support with an INIT message.
    let mut init = [0u8; 4];
    h.client.read_exact(&mut init).await.unwrap();
    assert_eq!(init, [250, 0, 1, 1]);

    // The SetEncodings itself still reaches the console.
    let received = wait_for_received(&h.backend, 0, msg.len()).await;
    assert_eq!(received, msg);

    drop(h.client);
    assert_eq!(h.handle.await.unwrap(), SessionExit::Clean);
}

#[tokio::test]
async fn xvp_reboot_is_dispatched_and_refusal_reported() {
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let mut h = start_session(vm1, 20).await;
    vnc_handshake(&mut h.client, VM1_PASSWORD).await;

    // REBOOT: recorded by the backend, nothing forwarded, no reply.
    h.client.write_all(&[250, 0, 1, 3]).await.unwrap();
    for _ in 0..200 {
        if !h.backend.state().codes.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        *h.backend.state().codes.lock().await,
        vec![xvp_rfb::XvpCode::Reboot]
    );

    // A refused RESET comes back as FAIL.
    h.backend.refuse_lifecycle();
    h.client.write_all(&[250, 0, 1, 4]).await.unwrap();
    let mut fail = [0u8; 4];
    h.client.read_exact(&mut fail).await.unwrap();
    assert_eq!(fail, [250, 0, 1, 0]);

    // Nothing of either extension message reached the console.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.backend.state().received.lock().await[0].is_empty());

    drop(h.client);
    assert_eq!(h.handle.await.unwrap(), SessionExit::Clean);
}

#[tokio::test]
async fn cut_text_is_replayed_as_key_events() {
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let mut h = start_session(vm1, 20).await;
    vnc_handshake(&mut h.client, VM1_PASSWORD).await;

    let text = b"Ab!";
    let mut msg = vec![6u8, 0, 0, 0];
    msg.extend_from_slice(&(text.len() as u32).to_be_bytes());
    msg.extend_from_slice(text);
    h.client.write_all(&msg).await.unwrap();

    let expected = xvp_rfb::cuttext::cut_text_key_events(text);
    let received = wait_for_received(&h.backend, 0, expected.len()).await;
    assert_eq!(received, expected);

    drop(h.client);
    assert_eq!(h.handle.await.unwrap(), SessionExit::Clean);
}

#[tokio::test]
async fn unknown_client_message_ends_the_session() {
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let mut h = start_session(vm1, 20).await;
    vnc_handshake(&mut h.client, VM1_PASSWORD).await;

    h.client.write_all(&[99u8]).await.unwrap();
    assert_eq!(h.handle.await.unwrap(), SessionExit::Clean);
}

#[tokio::test]
async fn console_loss_reconnects_and_replays_client_state() {
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let mut h = start_session(vm1, 1).await;
    vnc_handshake(&mut h.client, VM1_PASSWORD).await;

    // Establish replayable state.
    let mut pixel_format = vec![0u8; 20];
    pixel_format[4] = 32;
    let mut encodings = vec![2u8, 0, 0, 1];
    encodings.extend_from_slice(&0i32.to_be_bytes());
    h.client.write_all(&pixel_format).await.unwrap();
    h.client.write_all(&encodings).await.unwrap();
    wait_for_received(&h.backend, 0, pixel_format.len() + encodings.len()).await;

    // The console goes away; within the reconnect delay a new stream
    // comes up and sees the cached state plus a full update request.
    h.backend.delete_console();

    let mut expected = Vec::new();
    expected.extend_from_slice(&pixel_format);
    expected.extend_from_slice(&encodings);
    expected.extend_from_slice(&build_fb_update_request(false, 0, 0, 800, 600));
    let replayed = wait_for_received(&h.backend, 1, expected.len()).await;
    assert_eq!(replayed, expected);
    assert_eq!(h.backend.state().opens.load(std::sync::atomic::Ordering::SeqCst), 2);

    // The relay is live again afterwards.
    let key_event = [4u8, 0, 0, 0, 0, 0, 0, 0x62];
    h.client.write_all(&key_event).await.unwrap();
    let after = wait_for_received(&h.backend, 1, expected.len() + key_event.len()).await;
    assert_eq!(&after[expected.len()..], key_event);

    drop(h.client);
    assert_eq!(h.handle.await.unwrap(), SessionExit::Clean);
}

#[tokio::test]
async fn negative_reconnect_policy_terminates_after_console_loss() {
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let mut h = start_session(vm1, 0).await;
    vnc_handshake(&mut h.client, VM1_PASSWORD).await;

    h.backend.delete_console();
    let exit = h.handle.await.unwrap();
    assert_eq!(exit, SessionExit::Clean);
    assert_eq!(h.backend.state().opens.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disconnect_request_ends_an_idling_session() {
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let mut h = start_session(vm1, 20).await;
    vnc_handshake(&mut h.client, VM1_PASSWORD).await;

    h.control.send(SessionControl::Disconnect).await.unwrap();
    assert_eq!(h.handle.await.unwrap(), SessionExit::Clean);
}

#[tokio::test]
async fn two_sessions_are_independent_and_both_dump() {
    let backend = MockBackend::new();
    let vm1 = Target::Vm(VmId { pool: 0, vm: 0 });
    let vm2 = Target::Vm(VmId { pool: 0, vm: 1 });
    let mut a = start_session_with(vm1, 20, backend.clone()).await;
    let mut b = start_session_with(vm2, 20, backend).await;

    assert_eq!(vnc_handshake(&mut a.client, VM1_PASSWORD).await, "VM Console - vm1");
    assert_eq!(vnc_handshake(&mut b.client, VM2_PASSWORD).await, "VM Console - vm2");

    // Each harness has its own registry holding one session line.
    assert_eq!(a.registry.dump_lines().await.len(), 1);
    assert_eq!(b.registry.dump_lines().await.len(), 1);

    // Ending one session leaves the other fully functional.
    drop(a.client);
    assert_eq!(a.handle.await.unwrap(), SessionExit::Clean);

    let key_event = [4u8, 1, 0, 0, 0, 0, 0, 0x63];
    b.client.write_all(&key_event).await.unwrap();
    let received = wait_for_received(&b.backend, 1, key_event.len()).await;
    assert_eq!(received, key_event);

    drop(b.client);
    assert_eq!(b.handle.await.unwrap(), SessionExit::Clean);
}

// ── Supervisor-level scenarios ──────────────────────────────────────────

fn write_config(path: &PathBuf, port: u16) {
    let hex = to_hex(&encrypt_vnc(VM1_PASSWORD));
    let text = format!(
        "POOL pool1\n    DOMAIN example.com\n    MANAGER root {}\n    HOST xen1\n    VM {} vm1 {}\n",
        "00".repeat(16),
        port,
        hex
    );
    std::fs::write(path, text).unwrap();
}

#[tokio::test]
async fn reload_rebinds_listeners_and_leaves_sessions_alone() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("xvp.conf");
    write_config(&config_path, 42811);

    let config = parser::load(&config_path).unwrap();
    let ctx = Arc::new(ProxyContext {
        config: Arc::new(config),
        reconnect_delay: 20,
        trace: false,
        factory: MockFactory::new(MockBackend::new()),
    });

    let mut supervisor = Supervisor::new(ctx, config_path.clone());
    let control = supervisor.control_sender();
    let run = tokio::spawn(async move { supervisor.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A client on the original port gets a session.
    let mut early = TcpStream::connect("127.0.0.1:42811").await.unwrap();
    let mut banner = [0u8; 12];
    early.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"RFB 003.008\n");

    // Reload onto a different port.
    write_config(&config_path, 42812);
    control.send(ControlEvent::Reload).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut late = TcpStream::connect("127.0.0.1:42812").await.unwrap();
    late.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"RFB 003.008\n");

    // The pre-reload session is still live on its old snapshot.
    early.write_all(b"RFB 003.008\n").await.unwrap();
    let mut list = [0u8; 3];
    early.read_exact(&mut list).await.unwrap();
    assert_eq!(list, [2, 2, 22]);

    control.send(ControlEvent::Terminate(15)).await.unwrap();
    assert_eq!(run.await.unwrap(), 0);
}

#[tokio::test]
async fn bad_reload_is_fatal_to_the_master() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("xvp.conf");
    write_config(&config_path, 42813);

    let config = parser::load(&config_path).unwrap();
    let ctx = Arc::new(ProxyContext {
        config: Arc::new(config),
        reconnect_delay: 20,
        trace: false,
        factory: MockFactory::new(MockBackend::new()),
    });

    let mut supervisor = Supervisor::new(ctx, config_path.clone());
    let control = supervisor.control_sender();
    let run = tokio::spawn(async move { supervisor.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    std::fs::write(&config_path, "POOL broken\n").unwrap();
    control.send(ControlEvent::Reload).await.unwrap();
    assert_eq!(run.await.unwrap(), 1);
}
