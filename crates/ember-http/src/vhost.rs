//! Virtual hosts: one config subtree per served host name, index 0
//! being the implicit default that also carries the top-level config.

use std::cell::RefCell;
use std::rc::Rc;

use ember_core::config::Config;
use ember_core::klog::Klog;
use tracing::{info, warn};

use crate::error::HttpError;

const SERVER_SIG: &str = concat!("ember/", env!("CARGO_PKG_VERSION"));

/// Keys a vhost must not inherit from the enclosing server config.
const DONT_INHERIT: &[&str] = &[
    "addr",
    "model",
    "type",
    "dir_root",
    "dir_alias",
    "script_alias",
    "access_log",
];

pub struct Vhost {
    pub id: usize,
    pub host: String,
    pub config: Config,
    pub dir_root: String,
    pub index: Option<String>,
    pub server_sig: String,
    pub send_deflate: bool,
    pub klog: Option<Rc<RefCell<Klog>>>,
    pub al_config: Option<Config>,
}

#[derive(Default)]
pub struct VhostList {
    list: Vec<Rc<Vhost>>,
}

impl VhostList {
    /// Build the list from a backend config: the config itself becomes
    /// the default vhost, then any child subtree carrying a `dir_root`
    /// key becomes a named one, inheriting the top-level values.
    pub fn from_config(cfg: &Config) -> Result<VhostList, HttpError> {
        let mut vl = VhostList::default();
        vl.add("", cfg.clone(), true)?;

        for n in 0.. {
            let Some(child) = cfg.child_n(None, n) else { break };
            if child.child("dir_root").is_none() {
                continue;
            }
            info!(host = child.key(), "configuring virtual host");
            let mut sub = child.clone();
            sub.inherit(cfg, DONT_INHERIT);
            vl.add(child.key(), sub, false)?;
        }
        Ok(vl)
    }

    fn add(&mut self, host: &str, config: Config, default: bool) -> Result<(), HttpError> {
        let dir_root = match config.subkey_value("dir_root") {
            Some(v) => v.to_owned(),
            None if default => String::new(),
            None => {
                return Err(HttpError::Other(format!("dir_root must be set (vhost: {host})")));
            }
        };

        // a vhost without its own access_log inherits the default's
        let (klog, al_config) = match config.child("access_log") {
            Some(al) if al.value() != Some("no") => {
                let klog = match Klog::open_from_config(al) {
                    Ok(k) => Some(Rc::new(RefCell::new(k))),
                    Err(e) => {
                        warn!(host, "cannot open access log: {e}");
                        None
                    }
                };
                (klog, Some(al.clone()))
            }
            Some(_) => (None, None),
            None => match self.list.first() {
                Some(top) => (top.klog.clone(), top.al_config.clone()),
                None => (None, None),
            },
        };

        let vhost = Vhost {
            id: self.list.len(),
            host: host.to_owned(),
            send_deflate: config.subkey_value_b("send_enc_deflate", false)?,
            server_sig: config
                .subkey_value("server_sig")
                .unwrap_or(SERVER_SIG)
                .to_owned(),
            index: config.subkey_value("index").map(str::to_owned),
            dir_root,
            klog,
            al_config,
            config,
        };
        self.list.push(Rc::new(vhost));
        Ok(())
    }

    /// Find by host name; `None` when unknown (callers fall back to the
    /// default, index 0).
    pub fn get(&self, host: &str) -> Option<Rc<Vhost>> {
        self.list
            .iter()
            .find(|v| !v.host.is_empty() && v.host.eq_ignore_ascii_case(host))
            .cloned()
    }

    pub fn get_n(&self, idx: usize) -> Option<Rc<Vhost>> {
        self.list.get(idx).cloned()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: &str = "
idle_timeout 7
dir_root /var/www/default
send_enc_deflate yes
www.example.com
{
    dir_root /var/www/example
    index index.html
}
bare.example.com
{
    dir_root /var/www/bare
}
";

    #[test]
    fn test_vhost_selection_and_default() {
        let cfg = Config::parse(CFG).unwrap();
        let vl = VhostList::from_config(&cfg).unwrap();
        assert_eq!(vl.len(), 3);
        assert_eq!(vl.get("WWW.EXAMPLE.COM").unwrap().dir_root, "/var/www/example");
        assert!(vl.get("unknown.host").is_none());
        assert_eq!(vl.get_n(0).unwrap().dir_root, "/var/www/default");
    }

    #[test]
    fn test_vhosts_inherit_top_level_values() {
        let cfg = Config::parse(CFG).unwrap();
        let vl = VhostList::from_config(&cfg).unwrap();
        let vh = vl.get("www.example.com").unwrap();
        assert_eq!(vh.config.subkey_value("idle_timeout"), Some("7"));
        // but never the dir_root of the parent
        assert_eq!(vh.dir_root, "/var/www/example");
        assert_eq!(vh.index.as_deref(), Some("index.html"));
    }
}
