//! Static extension → MIME type table. The `compressible` flag marks
//! types worth deflating on the wire.

pub struct MimeEntry {
    pub ext: &'static str,
    pub mime_type: &'static str,
    pub compressible: bool,
}

pub const DEFAULT_MIME: &MimeEntry = &MIME_TABLE[0];

/// First entry is the fallback for unknown extensions.
static MIME_TABLE: &[MimeEntry] = &[
    MimeEntry { ext: "", mime_type: "application/octet-stream", compressible: false },
    MimeEntry { ext: "html", mime_type: "text/html", compressible: true },
    MimeEntry { ext: "htm", mime_type: "text/html", compressible: true },
    MimeEntry { ext: "xhtml", mime_type: "application/xhtml+xml", compressible: true },
    MimeEntry { ext: "css", mime_type: "text/css", compressible: true },
    MimeEntry { ext: "js", mime_type: "application/javascript", compressible: true },
    MimeEntry { ext: "json", mime_type: "application/json", compressible: true },
    MimeEntry { ext: "txt", mime_type: "text/plain", compressible: true },
    MimeEntry { ext: "xml", mime_type: "text/xml", compressible: true },
    MimeEntry { ext: "csv", mime_type: "text/csv", compressible: true },
    MimeEntry { ext: "svg", mime_type: "image/svg+xml", compressible: true },
    MimeEntry { ext: "ico", mime_type: "image/x-icon", compressible: true },
    MimeEntry { ext: "bmp", mime_type: "image/bmp", compressible: true },
    MimeEntry { ext: "gif", mime_type: "image/gif", compressible: false },
    MimeEntry { ext: "jpg", mime_type: "image/jpeg", compressible: false },
    MimeEntry { ext: "jpeg", mime_type: "image/jpeg", compressible: false },
    MimeEntry { ext: "png", mime_type: "image/png", compressible: false },
    MimeEntry { ext: "webp", mime_type: "image/webp", compressible: false },
    MimeEntry { ext: "pdf", mime_type: "application/pdf", compressible: false },
    MimeEntry { ext: "ps", mime_type: "application/postscript", compressible: true },
    MimeEntry { ext: "gz", mime_type: "application/x-gzip", compressible: false },
    MimeEntry { ext: "tgz", mime_type: "application/x-gzip", compressible: false },
    MimeEntry { ext: "zip", mime_type: "application/zip", compressible: false },
    MimeEntry { ext: "tar", mime_type: "application/x-tar", compressible: true },
    MimeEntry { ext: "mp3", mime_type: "audio/mpeg", compressible: false },
    MimeEntry { ext: "ogg", mime_type: "application/ogg", compressible: false },
    MimeEntry { ext: "wav", mime_type: "audio/x-wav", compressible: true },
    MimeEntry { ext: "mp4", mime_type: "video/mp4", compressible: false },
    MimeEntry { ext: "avi", mime_type: "video/x-msvideo", compressible: false },
    MimeEntry { ext: "mpg", mime_type: "video/mpeg", compressible: false },
    MimeEntry { ext: "mpeg", mime_type: "video/mpeg", compressible: false },
    MimeEntry { ext: "wasm", mime_type: "application/wasm", compressible: true },
    MimeEntry { ext: "woff", mime_type: "font/woff", compressible: false },
    MimeEntry { ext: "woff2", mime_type: "font/woff2", compressible: false },
];

/// Look up the table entry for a file name; unknown or missing extensions
/// yield the octet-stream fallback.
pub fn mime_map(file_name: &str) -> &'static MimeEntry {
    let ext = match file_name.rsplit_once('.') {
        Some((_, e)) => e,
        None => return DEFAULT_MIME,
    };
    MIME_TABLE[1..]
        .iter()
        .find(|m| m.ext.eq_ignore_ascii_case(ext))
        .unwrap_or(DEFAULT_MIME)
}

/// Shortcut for the mime type string alone.
pub fn guess_mime_type(file_name: &str) -> &'static str {
    mime_map(file_name).mime_type
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_extensions() {
        assert_eq!(guess_mime_type("index.html"), "text/html");
        assert_eq!(guess_mime_type("A.JPG"), "image/jpeg");
        assert!(mime_map("style.css").compressible);
        assert!(!mime_map("photo.png").compressible);
    }

    #[test]
    fn test_unknown_falls_back() {
        assert_eq!(guess_mime_type("data.xyz"), "application/octet-stream");
        assert_eq!(guess_mime_type("noext"), "application/octet-stream");
    }
}
