//! ClientCutText to KeyEvent translation.
//!
//! The consoles behind the proxy ignore RFB ClientCutText, so pasted
//! text is replayed as key presses instead.  Shift state has to be faked
//! for uppercase letters and for the symbols that sit on shifted keys of
//! a standard US PC layout; other layouts will get some symbols wrong,
//! which is the accepted limitation of this translation.

use crate::protocol::build_key_event;

/// X11 keysym for Return.
pub const KEYSYM_RETURN: u32 = 0xff0d;
/// X11 keysym for the left Shift key.
pub const KEYSYM_LEFT_SHIFT: u32 = 0xffe1;

/// Symbols that need Shift on a US PC keyboard.
const SHIFTED_SYMBOLS: &[u8] = b"~!@#$%^&*()_+|{}:\"<>?";

fn needs_shift(c: u8) -> bool {
    c.is_ascii_uppercase() || SHIFTED_SYMBOLS.contains(&c)
}

/// Translate a cut-text buffer into a sequence of KeyEvent messages.
///
/// Each byte of the (possibly UTF-8) buffer is treated as an individual
/// key: `\n` becomes Return, other control bytes are dropped, and shifted
/// characters are wrapped in LeftShift down/up events.  Treating bytes
/// individually also lets Latin-1 accented characters come out right on
/// the console side.
pub fn cut_text_key_events(text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() * 16);

    for &c in text {
        let (key, shifted) = if c == b'\n' {
            (KEYSYM_RETURN, false)
        } else if c < 0x20 {
            continue;
        } else {
            (u32::from(c), needs_shift(c))
        };

        if shifted {
            out.extend_from_slice(&build_key_event(true, KEYSYM_LEFT_SHIFT));
        }
        out.extend_from_slice(&build_key_event(true, key));
        out.extend_from_slice(&build_key_event(false, key));
        if shifted {
            out.extend_from_slice(&build_key_event(false, KEYSYM_LEFT_SHIFT));
        }
    }

    out
}
