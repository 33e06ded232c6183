//! RFB wire types: versions, security types, message types, XVP numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The only RFB major version that exists in the wild.
pub const RFB_MAJOR: u32 = 3;
/// Highest minor version offered to clients.
pub const RFB_MINOR_CLIENT: u32 = 8;
/// Minor version spoken to the console side.
pub const RFB_MINOR_SERVER: u32 = 3;

/// XVP extension numbers, officially allocated by RealVNC Ltd.
pub const XVP_SECURITY_TYPE: u8 = 22;
pub const XVP_MESSAGE_TYPE: u8 = 250;
pub const XVP_MESSAGE_VERSION: u8 = 1;
pub const XVP_ENCODING: i32 = 0xfffffecbu32 as i32;

/// Is this a protocol version we can speak?
pub fn version_known(major: u32, minor: u32) -> bool {
    major == RFB_MAJOR && matches!(minor, 3 | 7 | 8)
}

// ── Security types ──────────────────────────────────────────────────────

/// Security types the proxy negotiates with clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SecurityType {
    /// No authentication (console side only).
    None = 1,
    /// VNC DES challenge-response.
    Vnc = 2,
    /// XVP user/target selection followed by VNC challenge-response.
    Xvp = XVP_SECURITY_TYPE,
}

impl SecurityType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::None),
            2 => Some(Self::Vnc),
            XVP_SECURITY_TYPE => Some(Self::Xvp),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

// ── Client messages ─────────────────────────────────────────────────────

/// Client-to-server message types the relay recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ClientMessageType {
    SetPixelFormat = 0,
    SetEncodings = 2,
    FramebufferUpdateRequest = 3,
    KeyEvent = 4,
    PointerEvent = 5,
    ClientCutText = 6,
    Xvp = XVP_MESSAGE_TYPE,
}

impl ClientMessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::SetPixelFormat),
            2 => Some(Self::SetEncodings),
            3 => Some(Self::FramebufferUpdateRequest),
            4 => Some(Self::KeyEvent),
            5 => Some(Self::PointerEvent),
            6 => Some(Self::ClientCutText),
            XVP_MESSAGE_TYPE => Some(Self::Xvp),
            _ => None,
        }
    }

    /// Length of the message, or of its fixed part for the two
    /// variable-length messages (SetEncodings, ClientCutText).
    pub fn fixed_len(self) -> usize {
        match self {
            Self::SetPixelFormat => 20,
            Self::SetEncodings => 4,
            Self::FramebufferUpdateRequest => 10,
            Self::KeyEvent => 8,
            Self::PointerEvent => 6,
            Self::ClientCutText => 8,
            Self::Xvp => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SetPixelFormat => "SetPixelFormat",
            Self::SetEncodings => "SetEncodings",
            Self::FramebufferUpdateRequest => "FrameBufferUpdateRequest",
            Self::KeyEvent => "KeyEvent",
            Self::PointerEvent => "PointerEvent",
            Self::ClientCutText => "ClientCutText",
            Self::Xvp => "XVP",
        }
    }
}

// ── Server messages (tracing only) ──────────────────────────────────────

/// Server-to-client message types, recognised for trace logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMessageType {
    FramebufferUpdate,
    SetColourMapEntries,
    Bell,
    ServerCutText,
}

impl ServerMessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::FramebufferUpdate),
            1 => Some(Self::SetColourMapEntries),
            2 => Some(Self::Bell),
            3 => Some(Self::ServerCutText),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::FramebufferUpdate => "FrameBufferUpdate",
            Self::SetColourMapEntries => "SetColourMapEntries",
            Self::Bell => "Bell",
            Self::ServerCutText => "ServerCutText",
        }
    }
}

// ── XVP extension codes ─────────────────────────────────────────────────

/// Codes carried in XVP extension messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum XvpCode {
    Fail = 0,
    Init = 1,
    Shutdown = 2,
    Reboot = 3,
    Reset = 4,
}

impl XvpCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Fail),
            1 => Some(Self::Init),
            2 => Some(Self::Shutdown),
            3 => Some(Self::Reboot),
            4 => Some(Self::Reset),
            _ => None,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Init => "init",
            Self::Shutdown => "shutdown",
            Self::Reboot => "reboot",
            Self::Reset => "reset",
        }
    }
}

impl fmt::Display for XvpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

// ── ServerInit ──────────────────────────────────────────────────────────

/// The fixed part of a ServerInit plus the desktop name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub pixel_format: [u8; 16],
    pub name: String,
}

impl ServerInit {
    /// Parse the 24-byte fixed part; the name follows on the wire.
    pub fn parse_fixed(buf: &[u8; 24]) -> (u16, u16, [u8; 16], usize) {
        let width = u16::from_be_bytes([buf[0], buf[1]]);
        let height = u16::from_be_bytes([buf[2], buf[3]]);
        let mut pixel_format = [0u8; 16];
        pixel_format.copy_from_slice(&buf[4..20]);
        let name_len = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]) as usize;
        (width, height, pixel_format, name_len)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let mut buf = Vec::with_capacity(24 + name.len());
        buf.extend_from_slice(&self.width.to_be_bytes());
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.extend_from_slice(&self.pixel_format);
        buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
        buf.extend_from_slice(name);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_known_accepts_3x() {
        assert!(version_known(3, 3));
        assert!(version_known(3, 7));
        assert!(version_known(3, 8));
        assert!(!version_known(3, 5));
        assert!(!version_known(4, 8));
    }

    #[test]
    fn security_type_bytes() {
        assert_eq!(SecurityType::Vnc.to_byte(), 2);
        assert_eq!(SecurityType::Xvp.to_byte(), 22);
        assert_eq!(SecurityType::from_byte(22), Some(SecurityType::Xvp));
        assert_eq!(SecurityType::from_byte(99), None);
    }

    #[test]
    fn message_fixed_lengths() {
        assert_eq!(ClientMessageType::SetPixelFormat.fixed_len(), 20);
        assert_eq!(ClientMessageType::SetEncodings.fixed_len(), 4);
        assert_eq!(ClientMessageType::FramebufferUpdateRequest.fixed_len(), 10);
        assert_eq!(ClientMessageType::KeyEvent.fixed_len(), 8);
        assert_eq!(ClientMessageType::PointerEvent.fixed_len(), 6);
        assert_eq!(ClientMessageType::ClientCutText.fixed_len(), 8);
        assert_eq!(ClientMessageType::Xvp.fixed_len(), 4);
    }

    #[test]
    fn xvp_encoding_value() {
        assert_eq!(XVP_ENCODING, -309);
    }

    #[test]
    fn xvp_code_text() {
        assert_eq!(XvpCode::Reboot.text(), "reboot");
        assert_eq!(XvpCode::from_byte(4), Some(XvpCode::Reset));
        assert_eq!(XvpCode::from_byte(9), None);
    }

    #[test]
    fn server_init_roundtrip() {
        let init = ServerInit {
            width: 1024,
            height: 768,
            pixel_format: [7u8; 16],
            name: "VM Console - web1".into(),
        };
        let bytes = init.to_bytes();
        assert_eq!(bytes.len(), 24 + init.name.len());

        let mut fixed = [0u8; 24];
        fixed.copy_from_slice(&bytes[..24]);
        let (w, h, pf, name_len) = ServerInit::parse_fixed(&fixed);
        assert_eq!(w, 1024);
        assert_eq!(h, 768);
        assert_eq!(pf, [7u8; 16]);
        assert_eq!(name_len, init.name.len());
        assert_eq!(&bytes[24..], init.name.as_bytes());
    }
}
