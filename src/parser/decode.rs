//! Percent-decoding of the raw query text. Decoding precedes all lexing;
//! every later span refers to the decoded text.

use crate::error::{Error, Reason, Result, Span};

/// Decodes `%HH` escapes and validates the result as NUL-free UTF-8.
pub fn percent_decode(raw: &str) -> Result<String> {
    let mut bytes: Vec<u8> = Vec::with_capacity(raw.len());
    let mut chars = raw.chars().enumerate().peekable();

    while let Some((position, c)) = chars.next() {
        if c == '\0' {
            return Err(bad_encoding("null byte", position, position + 1));
        }
        if c != '%' {
            let mut buffer = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buffer).as_bytes());
            continue;
        }

        let high = chars.next().map(|(_, c)| c);
        let low = chars.next().map(|(_, c)| c);
        let octet = match (high.and_then(hex), low.and_then(hex)) {
            (Some(high), Some(low)) => high * 16 + low,
            _ => {
                return Err(bad_encoding(
                    "a `%` must be followed by two hexadecimal digits",
                    position,
                    position + 3,
                ))
            }
        };
        if octet == 0 {
            return Err(bad_encoding("`%00` is not allowed", position, position + 3));
        }
        bytes.push(octet);
    }

    String::from_utf8(bytes).map_err(|_| {
        Error::new(Reason::BadEncoding {
            detail: "decoded text is not valid UTF-8".to_string(),
        })
        .into()
    })
}

fn hex(c: char) -> Option<u8> {
    c.to_digit(16).map(|d| d as u8)
}

fn bad_encoding(detail: &str, start: usize, end: usize) -> anyhow::Error {
    Error::new(Reason::BadEncoding {
        detail: detail.to_string(),
    })
    .with_span(Some(Span { start, end }))
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_passes_through() {
        assert_eq!(percent_decode("/school{name}").unwrap(), "/school{name}");
    }

    #[test]
    fn test_escapes_decode() {
        assert_eq!(
            percent_decode("/school%7Bname%7D").unwrap(),
            "/school{name}"
        );
        assert_eq!(percent_decode("%27x%27").unwrap(), "'x'");
    }

    #[test]
    fn test_decode_then_encode_is_identity() {
        let original = "/school?campus='north'";
        let encoded: String = original
            .bytes()
            .map(|b| format!("%{b:02X}"))
            .collect();
        assert_eq!(percent_decode(&encoded).unwrap(), original);
    }

    #[test]
    fn test_bad_escapes() {
        assert!(percent_decode("/a%0").is_err());
        assert!(percent_decode("/a%zz").is_err());
        assert!(percent_decode("/a%00b").is_err());
        assert!(percent_decode("/a\0b").is_err());
        // an unpaired continuation byte
        assert!(percent_decode("/a%80").is_err());
    }

    #[test]
    fn test_multibyte_utf8() {
        assert_eq!(percent_decode("/caf%C3%A9").unwrap(), "/café");
    }
}
