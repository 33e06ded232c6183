//! RFB message builders and parsers.

use crate::types::{XvpCode, XVP_MESSAGE_TYPE, XVP_MESSAGE_VERSION};

/// Build a 12-byte version banner, e.g. `RFB 003.008\n`.
pub fn build_banner(major: u32, minor: u32) -> [u8; 12] {
    let text = format!("RFB {:03}.{:03}\n", major, minor);
    let mut buf = [0u8; 12];
    buf.copy_from_slice(text.as_bytes());
    buf
}

/// Parse a version banner of the form `RFB 003.XXX\n`.
///
/// Trailing bytes after the newline are ignored so a short read of the
/// 12-byte banner plus terminator parses the same way.
pub fn parse_banner(buf: &[u8]) -> Option<(u32, u32)> {
    if buf.len() < 12 || &buf[..4] != b"RFB " || buf[7] != b'.' {
        return None;
    }
    let major = parse_decimal(&buf[4..7])?;
    let minor = parse_decimal(&buf[8..11])?;
    if buf[11] != b'\n' {
        return None;
    }
    Some((major, minor))
}

fn parse_decimal(digits: &[u8]) -> Option<u32> {
    let mut value = 0u32;
    for &d in digits {
        if !d.is_ascii_digit() {
            return None;
        }
        value = value * 10 + u32::from(d - b'0');
    }
    Some(value)
}

/// Build a KeyEvent message (type 4).
pub fn build_key_event(down: bool, key: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0] = 4;
    buf[1] = u8::from(down);
    buf[4..].copy_from_slice(&key.to_be_bytes());
    buf
}

/// Build a FramebufferUpdateRequest message (type 3).
pub fn build_fb_update_request(
    incremental: bool,
    x: u16,
    y: u16,
    width: u16,
    height: u16,
) -> [u8; 10] {
    let mut buf = [0u8; 10];
    buf[0] = 3;
    buf[1] = u8::from(incremental);
    buf[2..4].copy_from_slice(&x.to_be_bytes());
    buf[4..6].copy_from_slice(&y.to_be_bytes());
    buf[6..8].copy_from_slice(&width.to_be_bytes());
    buf[8..].copy_from_slice(&height.to_be_bytes());
    buf
}

/// Build an XVP extension message `{250, 0, version, code}`.
pub fn build_xvp_message(code: XvpCode) -> [u8; 4] {
    [XVP_MESSAGE_TYPE, 0, XVP_MESSAGE_VERSION, code as u8]
}

/// Extension version and code carried in a type-250 message.
pub fn parse_xvp_message(buf: &[u8; 4]) -> (u8, u8) {
    (buf[2], buf[3])
}

/// The failure tail of a SecurityResult: u32 length plus reason text.
pub fn build_failure_reason(reason: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + reason.len());
    buf.extend_from_slice(&(reason.len() as u32).to_be_bytes());
    buf.extend_from_slice(reason.as_bytes());
    buf
}

/// Encoding values of a complete SetEncodings message.
pub fn set_encodings_list(msg: &[u8]) -> Vec<i32> {
    if msg.len() < 4 {
        return Vec::new();
    }
    let count = u16::from_be_bytes([msg[2], msg[3]]) as usize;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let at = 4 + i * 4;
        if at + 4 > msg.len() {
            break;
        }
        out.push(i32::from_be_bytes([
            msg[at],
            msg[at + 1],
            msg[at + 2],
            msg[at + 3],
        ]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_roundtrip() {
        let buf = build_banner(3, 8);
        assert_eq!(&buf, b"RFB 003.008\n");
        assert_eq!(parse_banner(&buf), Some((3, 8)));
    }

    #[test]
    fn banner_server_side() {
        assert_eq!(&build_banner(3, 3), b"RFB 003.003\n");
    }

    #[test]
    fn banner_rejects_garbage() {
        assert_eq!(parse_banner(b"RFB 003.00"), None);
        assert_eq!(parse_banner(b"HTTP/1.1 200"), None);
        assert_eq!(parse_banner(b"RFB 0x3.008\n"), None);
        assert_eq!(parse_banner(b"RFB 003.008 "), None);
    }

    #[test]
    fn key_event_layout() {
        let msg = build_key_event(true, 0xffe1);
        assert_eq!(msg[0], 4);
        assert_eq!(msg[1], 1);
        assert_eq!(&msg[2..4], &[0, 0]);
        assert_eq!(u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]), 0xffe1);

        let up = build_key_event(false, 0x61);
        assert_eq!(up[1], 0);
    }

    #[test]
    fn fb_update_request_layout() {
        let msg = build_fb_update_request(false, 0, 0, 800, 600);
        assert_eq!(msg[0], 3);
        assert_eq!(msg[1], 0);
        assert_eq!(u16::from_be_bytes([msg[6], msg[7]]), 800);
        assert_eq!(u16::from_be_bytes([msg[8], msg[9]]), 600);
    }

    #[test]
    fn xvp_message_layout() {
        let msg = build_xvp_message(XvpCode::Reboot);
        assert_eq!(msg, [250, 0, 1, 3]);
        assert_eq!(parse_xvp_message(&msg), (1, 3));
    }

    #[test]
    fn failure_reason_layout() {
        let buf = build_failure_reason("Access denied");
        assert_eq!(&buf[..4], &13u32.to_be_bytes());
        assert_eq!(&buf[4..], b"Access denied");
    }

    #[test]
    fn set_encodings_list_parses_entries() {
        let mut msg = vec![2u8, 0, 0, 3];
        for enc in [0i32, 1, crate::types::XVP_ENCODING] {
            msg.extend_from_slice(&enc.to_be_bytes());
        }
        assert_eq!(set_encodings_list(&msg), vec![0, 1, crate::types::XVP_ENCODING]);
    }

    #[test]
    fn set_encodings_list_tolerates_short_buffer() {
        assert!(set_encodings_list(&[2, 0]).is_empty());
        let msg = vec![2u8, 0, 0, 2, 0, 0, 0, 1];
        assert_eq!(set_encodings_list(&msg), vec![1]);
    }
}
