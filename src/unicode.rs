//! Text decoding helpers for response files and manifest paths.

use std::borrow::Cow;
use std::env;

use unicode_normalization::UnicodeNormalization;

/// Decode the bytes of a response file.
///
/// MSVC-style response files may be UTF-16 with a BOM in either byte
/// order; detection consumes exactly one UTF-16 unit (the BOM itself).
/// Anything without a UTF-16 BOM is treated as UTF-8.
pub fn decode_response_file(bytes: &[u8]) -> String {
    if bytes.len() >= 2 {
        let le = bytes[0] == 0xff && bytes[1] == 0xfe;
        let be = bytes[0] == 0xfe && bytes[1] == 0xff;
        if le || be {
            let units: Vec<u16> = bytes[2..]
                .chunks_exact(2)
                .map(|pair| {
                    if le {
                        u16::from_le_bytes([pair[0], pair[1]])
                    } else {
                        u16::from_be_bytes([pair[0], pair[1]])
                    }
                })
                .collect();
            return String::from_utf16_lossy(&units);
        }
    }
    String::from_utf8_lossy(bytes).into_owned()
}

/// Expand `%VAR%` environment references.
///
/// References to unset variables are left verbatim, matching the behavior
/// of the Windows shell. A lone `%` is passed through unchanged.
pub fn expand_env_vars(input: &str) -> String {
    if !input.contains('%') {
        return input.to_string();
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        out.push('%');
                        out.push_str(name);
                        out.push('%');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                // No closing separator (or an empty "%%" pair): literal.
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Normalize a string to Unicode NFC.
pub fn nfc(s: &str) -> Cow<'_, str> {
    if s.is_ascii() {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(s.nfc().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16le(s: &str) -> Vec<u8> {
        let mut bytes = vec![0xff, 0xfe];
        for unit in s.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes
    }

    fn utf16be(s: &str) -> Vec<u8> {
        let mut bytes = vec![0xfe, 0xff];
        for unit in s.encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        bytes
    }

    #[test]
    fn decodes_utf8_without_bom() {
        assert_eq!(decode_response_file(b"/c /Fo:out.obj"), "/c /Fo:out.obj");
    }

    #[test]
    fn decodes_utf16_little_endian() {
        let bytes = utf16le("/c main.cpp");
        assert_eq!(decode_response_file(&bytes), "/c main.cpp");
    }

    #[test]
    fn decodes_utf16_big_endian() {
        let bytes = utf16be("/O2 /c");
        assert_eq!(decode_response_file(&bytes), "/O2 /c");
    }

    #[test]
    fn bom_is_consumed_not_emitted() {
        let bytes = utf16le("x");
        let decoded = decode_response_file(&bytes);
        assert_eq!(decoded, "x");
        assert!(!decoded.starts_with('\u{feff}'));
    }

    #[test]
    fn expands_known_variable() {
        env::set_var("BUILDCACHE_TEST_EXPAND", "value");
        assert_eq!(
            expand_env_vars("pre %BUILDCACHE_TEST_EXPAND% post"),
            "pre value post"
        );
    }

    #[test]
    fn unknown_variable_left_verbatim() {
        env::remove_var("BUILDCACHE_TEST_MISSING");
        assert_eq!(
            expand_env_vars("%BUILDCACHE_TEST_MISSING%"),
            "%BUILDCACHE_TEST_MISSING%"
        );
    }

    #[test]
    fn lone_percent_passes_through() {
        assert_eq!(expand_env_vars("100%"), "100%");
        assert_eq!(expand_env_vars("a%b"), "a%b");
    }

    #[test]
    fn nfc_composes_decomposed_input() {
        // "e" + combining acute accent composes to a single code point.
        let decomposed = "e\u{0301}";
        assert_eq!(nfc(decomposed).as_ref(), "\u{00e9}");
    }

    #[test]
    fn nfc_borrows_ascii() {
        assert!(matches!(nfc("plain ascii"), Cow::Borrowed(_)));
    }
}
