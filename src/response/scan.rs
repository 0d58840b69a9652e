//! Byte-level helpers for walking AT response text.

pub const CRLF: &[u8] = b"\r\n";

/// Offset of the first occurrence of `needle` in `hay`.
pub fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if needle.len() > hay.len() {
        return None;
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

/// Offset just past the first occurrence of `needle`.
pub fn find_and_skip(hay: &[u8], needle: &[u8]) -> Option<usize> {
    find(hay, needle).map(|p| p + needle.len())
}

/// Length of a leading CRLF, if any.
pub fn skip_rsp_start(buf: &[u8]) -> usize {
    if buf.starts_with(CRLF) {
        CRLF.len()
    } else {
        0
    }
}

/// Parse a decimal number at the start of `buf`. Returns the value and the
/// number of bytes consumed (leading spaces included).
pub fn extract_uint(buf: &[u8]) -> Option<(u32, usize)> {
    let spaces = buf.iter().take_while(|b| **b == b' ').count();
    let digits = buf[spaces..].iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let mut value: u32 = 0;
    for b in &buf[spaces..spaces + digits] {
        value = value.checked_mul(10)?.checked_add(u32::from(b - b'0'))?;
    }
    Some((value, spaces + digits))
}

/// Offset just past the end of the line starting at `buf` (after its CRLF).
pub fn line_end(buf: &[u8]) -> Option<usize> {
    find_and_skip(buf, CRLF)
}

/// Strip a trailing `\r\n` and surrounding whitespace from a line.
pub fn trim_line(line: &str) -> &str {
    line.trim_matches(|c: char| c == '\r' || c == '\n' || c == ' ')
}

/// Split `s` on commas, honouring double quotes and stripping them.
pub fn split_fields(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    for ch in s.chars() {
        match ch {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                out.push(cur.trim().to_string());
                cur.clear();
            }
            c => cur.push(c),
        }
    }
    out.push(cur.trim().to_string());
    out
}
