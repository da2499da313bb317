//! A backend is one listening endpoint: protocol, address, serving
//! model and its limits, plus the HTTP engine that answers on it.

use std::cell::RefCell;
use std::net::TcpListener;
use std::rc::Rc;

use ember_core::config::Config;
use ember_core::klog::Klog;
use ember_http::dynpage::DynRoutes;
use ember_http::embfs::EmbFs;
use ember_http::http::{HttpEngine, TlsProvider};
use tracing::warn;

use crate::error::ServerError;

const DEFAULT_BACKEND_MAX_CHILD: usize = 32;
const DEFAULT_START_CHILD: usize = 3;
const DEFAULT_MAX_RQ_PER_CHILD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerModel {
    Iterative,
    Fork,
    Prefork,
}

impl ServerModel {
    fn from_str(v: &str) -> Result<ServerModel, ServerError> {
        match v.to_ascii_lowercase().as_str() {
            "iterative" => Ok(ServerModel::Iterative),
            "fork" => Ok(ServerModel::Fork),
            "prefork" => Ok(ServerModel::Prefork),
            other => Err(ServerError::BadConfig(format!("unknown server model '{other}'"))),
        }
    }
}

pub struct Backend {
    pub id: i32,
    pub name: String,
    pub proto: String,
    pub addr: String,
    pub model: ServerModel,
    pub max_child: usize,
    pub start_child: usize,
    pub max_rq_per_child: usize,
    /// Workers still owed to this backend; the parent loop drains it.
    pub fork_child: usize,
    /// Live workers.
    pub nchild: usize,
    pub listener: Option<TcpListener>,
    pub klog: Option<Rc<RefCell<Klog>>>,
    pub engine: HttpEngine,
}

impl Backend {
    /// Build a backend from its named config subtree. `foreground`
    /// forces the iterative model regardless of configuration.
    pub fn from_config(
        name: &str,
        cfg: &Config,
        id: i32,
        embfs: Rc<EmbFs>,
        routes: Rc<DynRoutes>,
        tls: Option<Box<dyn TlsProvider>>,
        foreground: bool,
    ) -> Result<Backend, ServerError> {
        let proto = cfg
            .subkey_value("type")
            .ok_or_else(|| ServerError::BadConfig(format!("missing '{name}.type' value")))?
            .to_ascii_lowercase();
        if proto != "http" && proto != "https" {
            return Err(ServerError::BadConfig(format!("backend type '{proto}' not found")));
        }
        if proto == "https" && tls.is_none() {
            warn!(backend = name, "https backend without a TLS provider");
        }

        let addr = cfg
            .subkey_value("addr")
            .ok_or_else(|| ServerError::BadConfig(format!("missing or bad '{name}.addr' value")))?
            .to_owned();

        let mut model = match cfg.subkey_value("model") {
            Some(v) => ServerModel::from_str(v)?,
            None => ServerModel::Prefork,
        };
        if foreground {
            model = ServerModel::Iterative;
        }

        let mut max_child = DEFAULT_BACKEND_MAX_CHILD;
        let mut start_child = DEFAULT_START_CHILD;
        let mut max_rq_per_child = DEFAULT_MAX_RQ_PER_CHILD;
        match model {
            ServerModel::Fork => {
                max_child = cfg.subkey_value_i("fork.max_child", max_child as i64)? as usize;
            }
            ServerModel::Prefork => {
                max_child = cfg.subkey_value_i("prefork.max_child", max_child as i64)? as usize;
                start_child =
                    cfg.subkey_value_i("prefork.start_child", start_child as i64)? as usize;
                max_rq_per_child = cfg
                    .subkey_value_i("prefork.max_requests_per_child", max_rq_per_child as i64)?
                    as usize;
            }
            ServerModel::Iterative => {}
        }

        let klog = match cfg.child("log") {
            Some(lc) => match Klog::open_from_config(lc) {
                Ok(k) => Some(Rc::new(RefCell::new(k))),
                Err(e) => {
                    warn!(backend = name, "cannot open backend log: {e}");
                    None
                }
            },
            None => None,
        };

        let engine = HttpEngine::new(cfg.clone(), embfs, routes, tls)?;

        Ok(Backend {
            id,
            name: name.to_owned(),
            proto,
            addr,
            model,
            max_child,
            start_child,
            max_rq_per_child,
            fork_child: if model == ServerModel::Prefork { start_child } else { 0 },
            nchild: 0,
            listener: None,
            klog,
            engine,
        })
    }

    pub fn listen(&mut self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.addr).map_err(|e| {
            ServerError::BadConfig(format!("cannot bind {} ({}): {e}", self.name, self.addr))
        })?;
        self.listener = Some(listener);
        Ok(())
    }
}
