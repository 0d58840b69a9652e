//! Logging helpers that keep AT traffic on one log line.
//! CR, LF and the abort ESC would otherwise split or garble log output.

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - other control bytes (ESC, Ctrl-Z) => `\\xNN`
///
/// Very long strings (modem dumps, PDUs) are cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// [`escape_log`] for raw bytes read from a port.
pub fn escape_bytes(b: &[u8]) -> String {
    escape_log(&String::from_utf8_lossy(b))
}
