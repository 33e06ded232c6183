//! Packet-trace logging for the relay's trace mode.

use crate::protocol::set_encodings_list;
use crate::types::{ClientMessageType, ServerMessageType};

/// Log one client-to-server message at debug level.
///
/// `from_proxy` marks messages the proxy injects itself (replays).
pub fn trace_client(buf: &[u8], from_proxy: bool) {
    let who = if from_proxy { "Proxy" } else { "Client" };
    let Some(mtype) = buf.first().copied().and_then(ClientMessageType::from_byte) else {
        log::debug!("{} unrecognised message", who);
        return;
    };
    log::debug!("{} {}", who, mtype.name());

    match mtype {
        ClientMessageType::SetEncodings => {
            for e in set_encodings_list(buf) {
                log::debug!("  {:08x} {}", e as u32, e);
            }
        }
        ClientMessageType::FramebufferUpdateRequest if buf.len() >= 10 => {
            log::debug!(
                "  incr {}, x {}, y {}, w {}, h {}",
                buf[1],
                u16::from_be_bytes([buf[2], buf[3]]),
                u16::from_be_bytes([buf[4], buf[5]]),
                u16::from_be_bytes([buf[6], buf[7]]),
                u16::from_be_bytes([buf[8], buf[9]])
            );
        }
        ClientMessageType::ClientCutText if buf.len() >= 8 => {
            log::debug!("  {}", String::from_utf8_lossy(&buf[8..]));
        }
        ClientMessageType::KeyEvent if buf.len() >= 8 => {
            let key = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let c = if (33..127).contains(&key) {
                key as u8 as char
            } else {
                ' '
            };
            log::debug!(
                "  key 0x{:08x} {} {}",
                key,
                c,
                if buf[1] != 0 { "down" } else { "up" }
            );
        }
        ClientMessageType::PointerEvent if buf.len() >= 6 => {
            log::debug!(
                "  pointer 0x{:1x}, {} {}",
                buf[1],
                u16::from_be_bytes([buf[2], buf[3]]),
                u16::from_be_bytes([buf[4], buf[5]])
            );
        }
        _ => {}
    }
}

/// Log one chunk of server-to-client bytes at debug level.
pub fn trace_server(buf: &[u8]) {
    let name = buf
        .first()
        .copied()
        .and_then(ServerMessageType::from_byte)
        .map(ServerMessageType::name)
        .unwrap_or("unrecognised message");
    log::debug!("Server {} {}", name, buf.len());
}
