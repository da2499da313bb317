//! Copy-codecs for the textual encodings used across the server: URL
//! (query strings, cookies, session lines), hex (client-side session
//! cookies), HTML entities (error pages) and SQL quote doubling.
//!
//! All of them are byte oriented and round-trip: `decode(encode(s)) == s`
//! for every byte string `s`.

use crate::error::EncodingError;

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";
const HEX_LOWER: &[u8; 16] = b"0123456789abcdef";

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// URL-encode `src`. Space becomes `+`, ASCII alphanumerics and `_-.`
/// pass through, everything else becomes `%XX`.
pub fn url_encode(src: &[u8]) -> String {
    let mut out = String::with_capacity(src.len());
    for &c in src {
        match c {
            b' ' => out.push('+'),
            b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'_' | b'-' | b'.' => out.push(c as char),
            _ => {
                out.push('%');
                out.push(HEX_UPPER[(c >> 4) as usize] as char);
                out.push(HEX_UPPER[(c & 0xf) as usize] as char);
            }
        }
    }
    out
}

/// Decode an URL-encoded string. `+` maps back to space; a `%` not
/// followed by two hex digits is an error.
pub fn url_decode(src: &[u8]) -> Result<Vec<u8>, EncodingError> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            b'%' => {
                let (hi, lo) = match (src.get(i + 1), src.get(i + 2)) {
                    (Some(&h), Some(&l)) => (hex_val(h), hex_val(l)),
                    _ => (None, None),
                };
                match (hi, lo) {
                    (Some(h), Some(l)) => out.push(h << 4 | l),
                    _ => return Err(EncodingError::BadEscape(i)),
                }
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Lowercase hex encoding.
pub fn hex_encode(src: &[u8]) -> String {
    let mut out = String::with_capacity(src.len() * 2);
    for &c in src {
        out.push(HEX_LOWER[(c >> 4) as usize] as char);
        out.push(HEX_LOWER[(c & 0xf) as usize] as char);
    }
    out
}

/// Decode a hex string; the input length must be even.
pub fn hex_decode(src: &[u8]) -> Result<Vec<u8>, EncodingError> {
    if src.len() % 2 != 0 {
        return Err(EncodingError::OddHexLength(src.len()));
    }
    let mut out = Vec::with_capacity(src.len() / 2);
    for (i, pair) in src.chunks_exact(2).enumerate() {
        match (hex_val(pair[0]), hex_val(pair[1])) {
            (Some(h), Some(l)) => out.push(h << 4 | l),
            _ => return Err(EncodingError::BadEscape(i * 2)),
        }
    }
    Ok(out)
}

const HTML_ENTITIES: &[(u8, &str)] = &[
    (b'&', "&amp;"),
    (b'<', "&lt;"),
    (b'>', "&gt;"),
    (b'"', "&quot;"),
    (b'\'', "&#39;"),
];

/// Escape the five HTML-significant characters.
pub fn html_encode(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    'outer: for c in src.chars() {
        if c.is_ascii() {
            for &(raw, ent) in HTML_ENTITIES {
                if raw == c as u8 {
                    out.push_str(ent);
                    continue 'outer;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Reverse of [`html_encode`]; unknown entities are left untouched.
pub fn html_decode(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let bytes = src.as_bytes();
    let mut i = 0;
    'outer: while i < bytes.len() {
        if bytes[i] == b'&' {
            for &(raw, ent) in HTML_ENTITIES {
                if src[i..].starts_with(ent) {
                    out.push(raw as char);
                    i += ent.len();
                    continue 'outer;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// SQL-escape by doubling single quotes.
pub fn sql_encode(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for c in src.chars() {
        out.push(c);
        if c == '\'' {
            out.push('\'');
        }
    }
    out
}

/// Undo [`sql_encode`].
pub fn sql_decode(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut last = '\0';
    for c in src.chars() {
        if c == '\'' && last == '\'' {
            last = '\0';
            continue;
        }
        out.push(c);
        last = c;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_round_trip_all_bytes() {
        let all: Vec<u8> = (0..=255u8).collect();
        let enc = url_encode(&all);
        assert_eq!(url_decode(enc.as_bytes()).unwrap(), all);
    }

    #[test]
    fn test_url_space_is_plus() {
        assert_eq!(url_encode(b"a b"), "a+b");
        assert_eq!(url_decode(b"a+b").unwrap(), b"a b");
    }

    #[test]
    fn test_url_bad_escape() {
        assert!(url_decode(b"%zz").is_err());
        assert!(url_decode(b"abc%2").is_err());
    }

    #[test]
    fn test_hex_round_trip_all_bytes() {
        let all: Vec<u8> = (0..=255u8).collect();
        let enc = hex_encode(&all);
        assert_eq!(hex_decode(enc.as_bytes()).unwrap(), all);
    }

    #[test]
    fn test_hex_odd_length() {
        assert!(hex_decode(b"abc").is_err());
    }

    #[test]
    fn test_html_entities() {
        assert_eq!(html_encode("&<>\"'"), "&amp;&lt;&gt;&quot;&#39;");
        assert_eq!(html_decode("&amp;&lt;&gt;&quot;&#39;"), "&<>\"'");
    }

    #[test]
    fn test_html_round_trip() {
        let s = "a <b> & \"c\" 'd' plain";
        assert_eq!(html_decode(&html_encode(s)), s);
    }

    #[test]
    fn test_sql_round_trip() {
        let s = "it's a 'quoted' string";
        assert_eq!(sql_decode(&sql_encode(s)), s);
        assert_eq!(sql_encode("a'b"), "a''b");
    }
}
