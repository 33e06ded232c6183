//! RFB protocol pieces shared by the proxy.
//!
//! Only what a pass-through proxy needs: version banners, security
//! negotiation values, client message framing, the XVP extension
//! numbers, and the cut-text keyboard translation.  Framebuffer payloads
//! are relayed without interpretation.

pub mod cuttext;
pub mod protocol;
pub mod trace;
pub mod types;

pub use types::*;
