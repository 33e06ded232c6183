//! DES password codecs and VNC challenge verification.
//!
//! Stored passwords come in two shapes: the 8-byte VNC password of each
//! VM (DES-ECB under a fixed key) and the 16-byte pool-manager password
//! (two single-block DES-CBC chains under another fixed key, second block
//! first).  Challenge verification reproduces the VNC convention of
//! bit-reversing every key byte, plus the one-time-password variant that
//! derives a fresh challenge key from the current time window.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::Des;
use serde::{Deserialize, Serialize};

/// Significant length of a VNC password.
pub const VNC_PASSWORD_LEN: usize = 8;
/// Significant length of a pool-manager password.
pub const MANAGER_PASSWORD_LEN: usize = 16;

/// Upper bound for the OTP time window, in seconds.
pub const OTP_MAX_WINDOW: u32 = 3600;

const VNC_KEY: [u8; 8] = [0xc1, 0x24, 0x08, 0x99, 0xc2, 0x26, 0x07, 0x05];
const MANAGER_KEY: [u8; 8] = [0xcc, 0x10, 0x10, 0x58, 0xbe, 0x03, 0x07, 0x66];

// ── OTP policy ──────────────────────────────────────────────────────────

/// Whether one-time passwords are rejected, accepted alongside the
/// permanent password, or the only accepted form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OtpMode {
    Deny,
    Allow,
    Require,
}

/// How the client address participates in OTP key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpCheck {
    Off,
    On,
    Http,
}

/// Process-wide OTP settings, fixed at configuration load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpPolicy {
    pub mode: OtpMode,
    pub ipcheck: IpCheck,
    /// Window size in seconds, 1..=3600.
    pub window: u32,
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self {
            mode: OtpMode::Allow,
            ipcheck: IpCheck::Off,
            window: 60,
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Rejection while decoding a stored password form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordError {
    pub message: String,
}

impl PasswordError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for PasswordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PasswordError {}

// ── DES primitives ──────────────────────────────────────────────────────

fn des_encrypt_block(key: &[u8; 8], block: &[u8; 8]) -> [u8; 8] {
    let cipher = Des::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    let mut result = [0u8; 8];
    result.copy_from_slice(&out);
    result
}

fn des_decrypt_block(key: &[u8; 8], block: &[u8; 8]) -> [u8; 8] {
    let cipher = Des::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut out);
    let mut result = [0u8; 8];
    result.copy_from_slice(&out);
    result
}

/// Reverse the bits in a byte (VNC DES key quirk).
fn reverse_bits(mut b: u8) -> u8 {
    let mut result = 0u8;
    for _ in 0..8 {
        result = (result << 1) | (b & 1);
        b >>= 1;
    }
    result
}

fn pad_bytes<const N: usize>(plain: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = plain.as_bytes();
    let take = bytes.len().min(N);
    out[..take].copy_from_slice(&bytes[..take]);
    out
}

fn xor8(a: &[u8; 8], b: &[u8; 8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for i in 0..8 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn bytes_to_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

// ── Stored-password codecs ──────────────────────────────────────────────

/// Encrypt a VNC password (up to 8 significant characters, zero padded).
pub fn encrypt_vnc(plain: &str) -> [u8; VNC_PASSWORD_LEN] {
    des_encrypt_block(&VNC_KEY, &pad_bytes::<VNC_PASSWORD_LEN>(plain))
}

fn decrypt_vnc_raw(encrypted: &[u8; VNC_PASSWORD_LEN]) -> [u8; VNC_PASSWORD_LEN] {
    des_decrypt_block(&VNC_KEY, encrypted)
}

/// Decrypt a stored VNC password back to text.
pub fn decrypt_vnc(encrypted: &[u8; VNC_PASSWORD_LEN]) -> String {
    bytes_to_string(&decrypt_vnc_raw(encrypted))
}

/// Encrypt a pool-manager password (up to 16 significant characters).
///
/// The two 8-byte halves are chained in reverse order: the second half is
/// encrypted first with a zero IV, then the first half with the second
/// half's ciphertext as IV.  Existing configuration files are written
/// this way, so the order is a wire contract.
pub fn encrypt_manager(plain: &str) -> [u8; MANAGER_PASSWORD_LEN] {
    let padded = pad_bytes::<MANAGER_PASSWORD_LEN>(plain);
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&padded[..8]);
    second.copy_from_slice(&padded[8..]);

    let c2 = des_encrypt_block(&MANAGER_KEY, &second);
    let c1 = des_encrypt_block(&MANAGER_KEY, &xor8(&first, &c2));

    let mut out = [0u8; MANAGER_PASSWORD_LEN];
    out[..8].copy_from_slice(&c1);
    out[8..].copy_from_slice(&c2);
    out
}

fn decrypt_manager_raw(encrypted: &[u8; MANAGER_PASSWORD_LEN]) -> [u8; MANAGER_PASSWORD_LEN] {
    let mut c1 = [0u8; 8];
    let mut c2 = [0u8; 8];
    c1.copy_from_slice(&encrypted[..8]);
    c2.copy_from_slice(&encrypted[8..]);

    let p2 = des_decrypt_block(&MANAGER_KEY, &c2);
    let p1 = xor8(&des_decrypt_block(&MANAGER_KEY, &c1), &c2);

    let mut out = [0u8; MANAGER_PASSWORD_LEN];
    out[..8].copy_from_slice(&p1);
    out[8..].copy_from_slice(&p2);
    out
}

/// Decrypt a stored pool-manager password back to text.
pub fn decrypt_manager(encrypted: &[u8; MANAGER_PASSWORD_LEN]) -> String {
    bytes_to_string(&decrypt_manager_raw(encrypted))
}

// ── Hex forms ───────────────────────────────────────────────────────────

/// Lowercase hex form of an encrypted password.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

fn from_hex<const N: usize>(text: &str) -> Result<[u8; N], PasswordError> {
    if text.len() != N * 2 {
        return Err(PasswordError::new(format!(
            "Encrypted password must be {} hex characters",
            N * 2
        )));
    }
    let decoded = hex::decode(text)
        .map_err(|_| PasswordError::new("Encrypted password is not valid hex"))?;
    let mut out = [0u8; N];
    out.copy_from_slice(&decoded);
    Ok(out)
}

/// Decode the 16-hex-character form of a VNC password.
pub fn vnc_password_from_hex(text: &str) -> Result<[u8; VNC_PASSWORD_LEN], PasswordError> {
    from_hex::<VNC_PASSWORD_LEN>(text)
}

/// Decode the 32-hex-character form of a manager password.
pub fn manager_password_from_hex(
    text: &str,
) -> Result<[u8; MANAGER_PASSWORD_LEN], PasswordError> {
    from_hex::<MANAGER_PASSWORD_LEN>(text)
}

// ── Challenge verification ──────────────────────────────────────────────

fn vnc_key_from_password(padded: &[u8; 8]) -> [u8; 8] {
    let mut key = *padded;
    for b in &mut key {
        *b = reverse_bits(*b);
    }
    key
}

fn encrypt_challenge(key: &[u8; 8], challenge: &[u8; 16]) -> [u8; 16] {
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&challenge[..8]);
    second.copy_from_slice(&challenge[8..]);

    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&des_encrypt_block(key, &first));
    out[8..].copy_from_slice(&des_encrypt_block(key, &second));
    out
}

/// Compute the response a viewer sends for `challenge` when it knows the
/// plain password.  Used by the password helper and by tests.
pub fn vnc_challenge_response(password: &str, challenge: &[u8; 16]) -> [u8; 16] {
    let key = vnc_key_from_password(&pad_bytes::<8>(password));
    encrypt_challenge(&key, challenge)
}

/// Round `now` to the nearest OTP window, half up.  Float arithmetic is
/// deliberate: compatible viewers round the same way.
fn otp_round(now: i64, window: u32) -> i64 {
    let w = window as f64;
    (((now as f64 + w * 0.5) / w) as i64) * window as i64
}

fn otp_time_block(t: i64, ipcheck: IpCheck, client_ip: Ipv4Addr) -> [u8; 8] {
    let mut block = [0u8; 8];
    block[..4].copy_from_slice(&(t as u32).to_be_bytes());
    match ipcheck {
        IpCheck::Off => block.copy_within(..4, 4),
        IpCheck::On => block[4..].copy_from_slice(&client_ip.octets()),
        IpCheck::Http => {
            for (i, m) in b"HTTP".iter().enumerate() {
                block[4 + i] = block[i] ^ m;
            }
        }
    }
    block
}

/// Verify a VNC challenge response against the stored encrypted password.
///
/// Tries the permanent password first (unless OTP is required), then the
/// time-windowed one-time keys (unless OTP is denied).
pub fn vnc_challenge_ok(
    stored: &[u8; VNC_PASSWORD_LEN],
    policy: OtpPolicy,
    client_ip: Ipv4Addr,
    challenge: &[u8; 16],
    response: &[u8; 16],
) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    vnc_challenge_ok_at(stored, policy, client_ip, challenge, response, now)
}

/// Deterministic core of [`vnc_challenge_ok`].
pub fn vnc_challenge_ok_at(
    stored: &[u8; VNC_PASSWORD_LEN],
    policy: OtpPolicy,
    client_ip: Ipv4Addr,
    challenge: &[u8; 16],
    response: &[u8; 16],
    now: i64,
) -> bool {
    let key = vnc_key_from_password(&decrypt_vnc_raw(stored));

    if policy.mode != OtpMode::Require && encrypt_challenge(&key, challenge) == *response {
        return true;
    }

    if policy.mode == OtpMode::Deny {
        return false;
    }

    // The offsets accumulate, so the instants tested are the rounded
    // time, one window back, and one window forward, in that order.
    let mut t = otp_round(now, policy.window);
    for i in [0i64, -1, 2] {
        t += policy.window as i64 * i;

        let block = otp_time_block(t, policy.ipcheck, client_ip);
        let mut derived = des_encrypt_block(&key, &block);
        for b in &mut derived {
            *b = reverse_bits(*b);
        }

        if encrypt_challenge(&derived, challenge) == *response {
            return true;
        }
    }

    false
}
