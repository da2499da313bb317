//! Ordered name/value lists. Used for query arguments, cookies, session
//! variables and upload records. Values are byte buffers: form fields and
//! session variables may carry binary data (e.g. the resource cipher key).

use crate::encoding::{url_decode, url_encode};
use crate::error::EncodingError;

/// A single named value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Var {
    name: String,
    value: Vec<u8>,
}

impl Var {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Value as UTF-8, lossy. Fine for everything except binary vars,
    /// which callers access through [`Var::value`].
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }

    pub fn set_value(&mut self, value: impl Into<Vec<u8>>) {
        self.value = value.into();
    }

    /// Parse a `name=value` token, url-decoding both halves. A token
    /// without `=` is rejected.
    pub fn from_urlvar(tok: &str) -> Result<Self, EncodingError> {
        let (n, v) = tok.split_once('=').ok_or(EncodingError::BadEscape(0))?;
        Ok(Self {
            name: String::from_utf8_lossy(&url_decode(n.as_bytes())?).into_owned(),
            value: url_decode(v.as_bytes())?,
        })
    }

    /// Serialise as an url-encoded `name=value` line (no newline).
    pub fn to_urlvar(&self) -> String {
        format!("{}={}", url_encode(self.name.as_bytes()), url_encode(&self.value))
    }
}

/// Insertion-ordered list of [`Var`]s. Lookup returns the first match;
/// duplicate names are allowed (repeated form fields, cookies).
#[derive(Debug, Clone, Default)]
pub struct Vars {
    list: Vec<Var>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, v: Var) {
        self.list.push(v);
    }

    /// Parse and add an url-encoded `name=value` token; malformed tokens
    /// are ignored, as browsers routinely send junk.
    pub fn add_urlvar(&mut self, tok: &str) -> Option<&Var> {
        match Var::from_urlvar(tok) {
            Ok(v) => {
                self.list.push(v);
                self.list.last()
            }
            Err(_) => None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Var> {
        self.list.iter().find(|v| v.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Var> {
        self.list.iter_mut().find(|v| v.name == name)
    }

    /// The `idx`-th var with the given name.
    pub fn get_nth(&self, name: &str, idx: usize) -> Option<&Var> {
        self.list.iter().filter(|v| v.name == name).nth(idx)
    }

    pub fn get_value(&self, name: &str) -> Option<&[u8]> {
        self.get(name).map(|v| v.value())
    }

    pub fn get_str(&self, name: &str) -> Option<std::borrow::Cow<'_, str>> {
        self.get(name).map(|v| v.value_str())
    }

    /// Set or replace the first var with this name.
    pub fn set(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        match self.get_mut(name) {
            Some(v) => v.set_value(value),
            None => self.add(Var::new(name, value)),
        }
    }

    /// Delete the first var with this name; true when something was removed.
    pub fn del(&mut self, name: &str) -> bool {
        match self.list.iter().position(|v| v.name == name) {
            Some(i) => {
                self.list.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Var> {
        self.list.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urlvar_round_trip() {
        let v = Var::new("user name", "a&b=c");
        let line = v.to_urlvar();
        assert_eq!(line, "user+name=a%26b%3Dc");
        assert_eq!(Var::from_urlvar(&line).unwrap(), v);
    }

    #[test]
    fn test_first_match_and_nth() {
        let mut vs = Vars::new();
        vs.add(Var::new("k", "one"));
        vs.add(Var::new("k", "two"));
        assert_eq!(vs.get("k").unwrap().value(), b"one");
        assert_eq!(vs.get_nth("k", 1).unwrap().value(), b"two");
        assert!(vs.get_nth("k", 2).is_none());
    }

    #[test]
    fn test_set_replaces_first() {
        let mut vs = Vars::new();
        vs.add(Var::new("a", "1"));
        vs.set("a", "2");
        vs.set("b", "3");
        assert_eq!(vs.get_value("a").unwrap(), b"2");
        assert_eq!(vs.len(), 2);
    }

    #[test]
    fn test_bad_urlvar_ignored() {
        let mut vs = Vars::new();
        assert!(vs.add_urlvar("novalue").is_none());
        assert!(vs.is_empty());
    }
}
