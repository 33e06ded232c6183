//! Password handling for the proxy.
//!
//! Everything in here exists for wire compatibility with the existing
//! configuration files and viewers: fixed-key DES encryption of stored
//! passwords, the bit-reversed DES keying that VNC authentication uses,
//! and the time-windowed one-time-password derivation.  None of it is a
//! security primitive in the modern sense.

pub mod password;

pub use password::*;
