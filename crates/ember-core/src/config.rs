//! Hierarchical configuration tree.
//!
//! The on-disk syntax is line oriented: `key value` pairs, `key { ... }`
//! nested sections, `#` comments. Keys may repeat (aliases, error pages,
//! log filters), so the tree preserves order and supports indexed lookup.
//!
//! ```text
//! server_list   www
//! www
//! {
//!     type      http
//!     addr      0.0.0.0:8080
//!     dir_alias /img /var/www/images
//!     dir_alias /css /var/www/styles
//! }
//! ```

use std::fmt;
use std::path::Path;

use crate::error::ConfigError;

/// A configuration node: a key, an optional scalar value and ordered
/// children.
#[derive(Debug, Clone, Default)]
pub struct Config {
    key: String,
    value: Option<String>,
    children: Vec<Config>,
}

impl Config {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            children: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn set_value(&mut self, v: impl Into<String>) {
        self.value = Some(v.into());
    }

    pub fn children(&self) -> impl Iterator<Item = &Config> {
        self.children.iter()
    }

    pub fn add_child(&mut self, child: Config) -> &mut Config {
        self.children.push(child);
        self.children.last_mut().unwrap()
    }

    /// First child with the given key.
    pub fn child(&self, key: &str) -> Option<&Config> {
        self.children.iter().find(|c| c.key.eq_ignore_ascii_case(key))
    }

    /// The `n`-th child with the given key, or the `n`-th child overall
    /// when `key` is `None`.
    pub fn child_n(&self, key: Option<&str>, n: usize) -> Option<&Config> {
        match key {
            Some(k) => self
                .children
                .iter()
                .filter(|c| c.key.eq_ignore_ascii_case(k))
                .nth(n),
            None => self.children.get(n),
        }
    }

    /// Dotted-path lookup: `subkey("http.session.type")`. A key written
    /// literally with dots (`error.404 /notfound.html`) is found too.
    pub fn subkey(&self, path: &str) -> Option<&Config> {
        let mut cur = self;
        let mut descended = true;
        for part in path.split('.') {
            match cur.child(part) {
                Some(c) => cur = c,
                None => {
                    descended = false;
                    break;
                }
            }
        }
        if descended {
            return Some(cur);
        }
        self.child(path)
    }

    pub fn subkey_value(&self, path: &str) -> Option<&str> {
        self.subkey(path).and_then(|c| c.value())
    }

    /// Integer value with a default when the key is absent.
    pub fn subkey_value_i(&self, path: &str, default: i64) -> Result<i64, ConfigError> {
        match self.subkey_value(path) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| ConfigError::BadValue {
                key: path.to_owned(),
                value: v.to_owned(),
            }),
        }
    }

    /// Boolean value (`yes`/`no`, `true`/`false`, `1`/`0`) with a default.
    pub fn subkey_value_b(&self, path: &str, default: bool) -> Result<bool, ConfigError> {
        match self.subkey_value(path) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "yes" | "true" | "1" | "on" => Ok(true),
                "no" | "false" | "0" | "off" => Ok(false),
                _ => Err(ConfigError::BadValue {
                    key: path.to_owned(),
                    value: v.to_owned(),
                }),
            },
        }
    }

    /// Copy keys from `from` into `self`, skipping keys named in `skip`
    /// and any subtree that itself looks like a virtual host (has a
    /// `dir_root` child). Existing keys in `self` win.
    pub fn inherit(&mut self, from: &Config, skip: &[&str]) {
        for child in &from.children {
            if child.child("dir_root").is_some() {
                continue;
            }
            if skip.iter().any(|s| s.eq_ignore_ascii_case(&child.key)) {
                continue;
            }
            if self.child(&child.key).is_none() {
                self.children.push(child.clone());
            }
        }
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse the text syntax into an anonymous root node.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut root = Config::new("");
        let mut stack: Vec<Config> = Vec::new();
        let mut pending: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(p) => &raw[..p],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let err = |reason: &str| ConfigError::Syntax {
                line: lineno + 1,
                reason: reason.to_owned(),
            };

            if line == "{" {
                let key = pending.take().ok_or_else(|| err("'{' without a key"))?;
                stack.push(Config::new(key));
                continue;
            }
            if line == "}" {
                if let Some(key) = pending.take() {
                    let node = Config::new(key);
                    Self::top(&mut root, &mut stack).children.push(node);
                }
                let done = stack.pop().ok_or_else(|| err("unmatched '}'"))?;
                Self::top(&mut root, &mut stack).children.push(done);
                continue;
            }

            // a bare key may introduce a section on the next line
            if let Some(key) = pending.take() {
                Self::top(&mut root, &mut stack).children.push(Config::new(key));
            }

            match line.split_once(char::is_whitespace) {
                Some((key, rest)) => {
                    let rest = rest.trim();
                    if rest == "{" {
                        stack.push(Config::new(key));
                    } else {
                        let mut node = Config::new(key);
                        node.set_value(rest);
                        Self::top(&mut root, &mut stack).children.push(node);
                    }
                }
                None => pending = Some(line.to_owned()),
            }
        }

        if let Some(key) = pending.take() {
            Self::top(&mut root, &mut stack).children.push(Config::new(key));
        }
        if !stack.is_empty() {
            return Err(ConfigError::Syntax {
                line: text.lines().count(),
                reason: "unclosed section".to_owned(),
            });
        }
        Ok(root)
    }

    fn top<'a>(root: &'a mut Config, stack: &'a mut [Config]) -> &'a mut Config {
        match stack.last_mut() {
            Some(t) => t,
            None => root,
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn dump(c: &Config, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let pad = "    ".repeat(depth);
            match (&c.value, c.children.is_empty()) {
                (Some(v), true) => writeln!(f, "{pad}{} {v}", c.key)?,
                _ => {
                    writeln!(f, "{pad}{}", c.key)?;
                    writeln!(f, "{pad}{{")?;
                    for ch in &c.children {
                        dump(ch, depth + 1, f)?;
                    }
                    writeln!(f, "{pad}}}")?;
                }
            }
            Ok(())
        }
        for c in &self.children {
            dump(c, 0, f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
# main section
server_list www admin
www
{
    type http
    addr 0.0.0.0:8080
    dir_alias /img /var/www/images
    dir_alias /css /var/www/styles
    session {
        type memory
        memory.max_count 10
    }
}
";

    #[test]
    fn test_parse_and_lookup() {
        let c = Config::parse(SAMPLE).unwrap();
        assert_eq!(c.subkey_value("server_list"), Some("www admin"));
        assert_eq!(c.subkey_value("www.type"), Some("http"));
        assert_eq!(c.subkey_value("www.session.type"), Some("memory"));
    }

    #[test]
    fn test_repeated_keys_ordered() {
        let c = Config::parse(SAMPLE).unwrap();
        let www = c.child("www").unwrap();
        assert_eq!(
            www.child_n(Some("dir_alias"), 0).unwrap().value(),
            Some("/img /var/www/images")
        );
        assert_eq!(
            www.child_n(Some("dir_alias"), 1).unwrap().value(),
            Some("/css /var/www/styles")
        );
        assert!(www.child_n(Some("dir_alias"), 2).is_none());
    }

    #[test]
    fn test_typed_accessors() {
        let c = Config::parse("flag yes\ncount 42\n").unwrap();
        assert!(c.subkey_value_b("flag", false).unwrap());
        assert_eq!(c.subkey_value_i("count", 0).unwrap(), 42);
        assert_eq!(c.subkey_value_i("missing", 7).unwrap(), 7);
        assert!(Config::parse("flag maybe\n").unwrap().subkey_value_b("flag", false).is_err());
    }

    #[test]
    fn test_inherit_skips_vhosts_and_listed() {
        let c = Config::parse("idle_timeout 5\naddr 1.2.3.4:80\nvh { dir_root /www }\n").unwrap();
        let mut dst = Config::parse("idle_timeout 9\n").unwrap();
        dst.inherit(&c, &["addr"]);
        assert_eq!(dst.subkey_value("idle_timeout"), Some("9"));
        assert!(dst.child("addr").is_none());
        assert!(dst.child("vh").is_none());
    }

    #[test]
    fn test_unbalanced_brace_is_error() {
        assert!(Config::parse("a {\n b 1\n").is_err());
        assert!(Config::parse("}\n").is_err());
    }
}
