//! Identifier escaping for bus names and object paths.
//!
//! Arbitrary strings are made safe for use as a single bus-name or
//! object-path component by replacing every byte that is not an ASCII
//! letter (and every leading digit) with `_` followed by two lowercase hex
//! digits. The empty string becomes a lone `_`.

use tracing::warn;

use crate::error::{TpError, TpResult};

/// Escapes `s` into a valid identifier component.
///
/// Underscores are escaped too (`_5f`), which keeps the mapping reversible.
pub fn escape_as_identifier(s: &str) -> String {
    if s.is_empty() {
        return "_".to_string();
    }
    let mut out = String::with_capacity(s.len());
    for (i, byte) in s.bytes().enumerate() {
        let keep = byte.is_ascii_alphabetic() || (i > 0 && byte.is_ascii_digit());
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{byte:02x}"));
        }
    }
    out
}

/// Reverses [`escape_as_identifier`].
///
/// # Errors
///
/// Returns `InvalidArgument` if `s` contains a character that the escaper
/// never produces, a truncated escape, or decodes to invalid UTF-8.
pub fn unescape_identifier(s: &str) -> TpResult<String> {
    if s == "_" {
        return Ok(String::new());
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| {
                        TpError::invalid_argument(format!("truncated escape in {s:?}"))
                    })?;
                out.push(hex);
                i += 3;
            }
            b if b.is_ascii_alphanumeric() => {
                out.push(b);
                i += 1;
            }
            other => {
                return Err(TpError::invalid_argument(format!(
                    "unexpected byte {other:#04x} in escaped identifier {s:?}"
                )));
            }
        }
    }
    String::from_utf8(out)
        .map_err(|_| TpError::invalid_argument(format!("{s:?} does not decode to UTF-8")))
}

/// Returns true if `name` is a well-formed protocol name:
/// an ASCII letter followed by letters, digits and hyphens.
pub fn is_valid_protocol_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
        }
        _ => false,
    }
}

/// Turns a protocol name into a bus-name component.
///
/// Well-formed names only have their hyphens replaced; anything else falls
/// back to the full identifier escape.
pub fn escape_protocol(name: &str) -> String {
    if is_valid_protocol_name(name) {
        name.replace('-', "_")
    } else {
        warn!(protocol = name, "protocol name is not valid, escaping it");
        escape_as_identifier(name)
    }
}

/// Recovers a protocol name from a bus-name component.
///
/// Older managers wrote `-` as `_2d`; both that and the current `_` form
/// decode to `-`.
pub fn unescape_protocol(component: &str) -> String {
    component.replace("_2d", "-").replace('_', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn escapes_special_bytes() {
        assert_eq!(escape_as_identifier(""), "_");
        assert_eq!(escape_as_identifier("badger"), "badger");
        assert_eq!(escape_as_identifier("0123abc_xyz\x01\u{ff}"), "_30123abc_5fxyz_01_c3_bf");
        assert_eq!(escape_as_identifier("a.b@c"), "a_2eb_40c");
    }

    #[test]
    fn unescapes_known_forms() {
        assert_eq!(unescape_identifier("_").unwrap(), "");
        assert_eq!(unescape_identifier("a_2eb_40c").unwrap(), "a.b@c");
        assert!(unescape_identifier("a_2").is_err());
        assert!(unescape_identifier("a-b").is_err());
    }

    #[test]
    fn protocol_names() {
        assert!(is_valid_protocol_name("jabber"));
        assert!(is_valid_protocol_name("local-xmpp"));
        assert!(!is_valid_protocol_name("1337"));
        assert!(!is_valid_protocol_name(""));
        assert!(!is_valid_protocol_name("a b"));
        assert_eq!(escape_protocol("local-xmpp"), "local_xmpp");
        assert_eq!(escape_protocol("a b"), "a_20b");
    }

    #[test]
    fn protocol_decoding_accepts_legacy_hyphen_escape() {
        assert_eq!(unescape_protocol("local_xmpp"), "local-xmpp");
        assert_eq!(unescape_protocol("local_2dxmpp"), "local-xmpp");
        assert_eq!(unescape_protocol("jabber"), "jabber");
    }

    proptest! {
        #[test]
        fn escape_round_trips(s in ".*") {
            let escaped = escape_as_identifier(&s);
            prop_assert!(escaped.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'));
            prop_assert!(!escaped.as_bytes()[0].is_ascii_digit());
            prop_assert_eq!(unescape_identifier(&escaped).unwrap(), s);
        }

        #[test]
        fn protocol_round_trips(name in "[A-Za-z][A-Za-z0-9]{0,8}(-[A-Za-z][A-Za-z0-9]{0,8}){0,2}") {
            prop_assert_eq!(unescape_protocol(&escape_protocol(&name)), name);
        }
    }
}
