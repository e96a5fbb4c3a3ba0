//! Percent escaping for tokens in URL paths and header lines.
//!
//! Tokens are opaque bytes chosen by applications, so they must survive a
//! round trip through an HTTP request path and the `rdv/1` header line.

use crate::Error;

/// Escapes a token so it can appear in a URL path segment.
///
/// Unreserved characters (RFC 3986) pass through, everything else becomes
/// `%XX`.
pub fn path_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Reverses [`path_escape`]. Any `%XX` sequence is decoded; `+` is left
/// alone (path semantics, not query semantics).
pub fn path_unescape(s: &str) -> Result<String, Error> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => out.push(b),
                    None => return Err(Error::Protocol("invalid percent escape".into())),
                }
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| Error::Protocol("escaped token is not utf-8".into()))
}
