//! Header fields: ordered, case-insensitively searchable, folded-line
//! aware.

use ember_io::Stream;

use crate::error::HttpError;
use crate::status;

/// Hard cap on fields per header; past this the peer is abusing us.
const MAX_FIELD_COUNT: usize = 256;
/// Longest accepted header line, folded fragments included.
const MAX_LINE: usize = 8 * 1024;

/// How [`Header::load_ex`] treats a field whose name is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Always append (multiple `Set-Cookie`, `Cookie`, ...).
    Add,
    /// Drop any previous field with the same name, then append.
    Override,
    /// Append only when the name is new.
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: String,
    value: String,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Field {
        Field {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parse a `Name: value` line.
    pub fn from_line(line: &str) -> Result<Field, HttpError> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::request(status::BAD_REQUEST, format!("bad header line: {line}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HttpError::request(status::BAD_REQUEST, "empty header name"));
        }
        Ok(Field {
            name: name.to_owned(),
            value: value.trim().to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// The value of one `; key=value` parameter inside this field
    /// (e.g. `boundary` of a Content-Type).
    pub fn param(&self, key: &str) -> Option<&str> {
        for part in self.value.split(';') {
            let part = part.trim();
            if let Some((k, v)) = part.split_once('=') {
                if k.trim().eq_ignore_ascii_case(key) {
                    return Some(v.trim().trim_matches('"').trim_matches('\''));
                }
            }
        }
        None
    }
}

/// Ordered sequence of fields.
#[derive(Debug, Clone, Default)]
pub struct Header {
    fields: Vec<Field>,
}

impl Header {
    pub fn new() -> Header {
        Header::default()
    }

    pub fn count(&self) -> usize {
        self.fields.len()
    }

    pub fn field_n(&self, idx: usize) -> Option<&Field> {
        self.fields.get(idx)
    }

    /// First field whose name matches, ignoring case.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| f.value())
    }

    pub fn add(&mut self, f: Field) {
        self.fields.push(f);
    }

    /// Replace the first field with this name, or append.
    pub fn set(&mut self, name: &str, value: &str) {
        match self
            .fields
            .iter_mut()
            .find(|f| f.name.eq_ignore_ascii_case(name))
        {
            Some(f) => f.value = value.to_owned(),
            None => self.fields.push(Field::new(name, value)),
        }
    }

    /// Remove the first field with this name; true when found.
    pub fn del(&mut self, name: &str) -> bool {
        match self
            .fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
        {
            Some(i) => {
                self.fields.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    fn process_line(&mut self, line: &str, mode: LoadMode) -> Result<(), HttpError> {
        if line.is_empty() {
            return Ok(());
        }
        let f = Field::from_line(line)?;
        match mode {
            LoadMode::Add => self.add(f),
            LoadMode::Override => {
                self.del(f.name());
                self.add(f);
            }
            LoadMode::Keep => {
                if self.field(f.name()).is_none() {
                    self.add(f);
                }
            }
        }
        Ok(())
    }

    /// Read `Name: value` lines from `io` up to the first empty line,
    /// joining RFC 822 folded continuations (a line starting with space
    /// or tab extends the previous one).
    pub fn load_ex(&mut self, io: &Stream, mode: LoadMode) -> Result<(), HttpError> {
        let mut unfolded = String::new();
        let mut budget = MAX_FIELD_COUNT;

        loop {
            let Some(line) = io.gets(MAX_LINE)? else { break };
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if budget == 0 {
                return Err(HttpError::request(status::BAD_REQUEST, "too many header fields"));
            }
            budget -= 1;

            if line.starts_with(' ') || line.starts_with('\t') {
                // folded continuation of the previous line
                unfolded.push_str(line);
            } else {
                if !unfolded.is_empty() {
                    self.process_line(&unfolded, mode)?;
                    unfolded.clear();
                }
                unfolded.push_str(line);
            }
        }

        if !unfolded.is_empty() {
            self.process_line(&unfolded, mode)?;
        }
        Ok(())
    }

    pub fn load(&mut self, io: &Stream) -> Result<(), HttpError> {
        self.load_ex(io, LoadMode::Add)
    }

    /// Import `HTTP_*` variables from the process environment, mapping
    /// `HTTP_USER_AGENT` to `User-Agent` style names. Used in CGI mode.
    pub fn load_from_cgi_env(&mut self) {
        for (k, v) in std::env::vars() {
            if let Some(raw) = k.strip_prefix("HTTP_") {
                if raw.is_empty() {
                    continue;
                }
                let name = raw.replace('_', "-");
                self.set(&name, &v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(text: &str) -> Stream {
        Stream::from_vec(text.as_bytes().to_vec())
    }

    #[test]
    fn test_load_preserves_order_and_case_insensitive_lookup() {
        let mut h = Header::new();
        h.load(&stream("Host: example\r\nX-One: 1\r\nx-two: 2\r\n\r\nBODY")).unwrap();
        assert_eq!(h.count(), 3);
        assert_eq!(h.value("host"), Some("example"));
        assert_eq!(h.value("X-TWO"), Some("2"));
        assert_eq!(h.field_n(1).unwrap().name(), "X-One");
    }

    #[test]
    fn test_folded_lines_are_joined() {
        let mut h = Header::new();
        h.load(&stream("X-Long: part one\r\n\tpart two\r\n continued\r\n\r\n")).unwrap();
        assert_eq!(h.count(), 1);
        assert_eq!(h.value("X-Long"), Some("part one\tpart two continued"));
    }

    #[test]
    fn test_load_modes() {
        let mut h = Header::new();
        h.set("A", "old");
        h.load_ex(&stream("A: dup\r\n\r\n"), LoadMode::Add).unwrap();
        assert_eq!(h.count(), 2);

        let mut h = Header::new();
        h.set("A", "old");
        h.load_ex(&stream("A: new\r\n\r\n"), LoadMode::Override).unwrap();
        assert_eq!(h.count(), 1);
        assert_eq!(h.value("A"), Some("new"));

        let mut h = Header::new();
        h.set("A", "old");
        h.load_ex(&stream("A: ignored\r\nB: kept\r\n\r\n"), LoadMode::Keep).unwrap();
        assert_eq!(h.value("A"), Some("old"));
        assert_eq!(h.value("B"), Some("kept"));
    }

    #[test]
    fn test_first_match_wins() {
        let mut h = Header::new();
        h.add(Field::new("Set-Cookie", "a=1"));
        h.add(Field::new("Set-Cookie", "b=2"));
        assert_eq!(h.value("set-cookie"), Some("a=1"));
    }

    #[test]
    fn test_field_cap() {
        let mut lines = String::new();
        for i in 0..300 {
            lines.push_str(&format!("X-{i}: v\r\n"));
        }
        lines.push_str("\r\n");
        let mut h = Header::new();
        assert!(h.load(&stream(&lines)).is_err());
    }

    #[test]
    fn test_field_param() {
        let f = Field::new("Content-Type", "multipart/form-data; boundary=AaB03x");
        assert_eq!(f.param("boundary"), Some("AaB03x"));
        assert_eq!(f.param("missing"), None);
        let f = Field::new("Content-Disposition", "form-data; name=\"file\"; filename=\"a.txt\"");
        assert_eq!(f.param("name"), Some("file"));
        assert_eq!(f.param("filename"), Some("a.txt"));
    }
}
