//! The HTTP engine: one instance per backend, driving a connection
//! from accept to close — parse, vhost and alias resolution, index
//! pages, the broker, error pages and the access log.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::SystemTime;

use nix::sys::socket::{SockaddrLike, SockaddrStorage, getpeername, getsockname};
use tracing::warn;

use ember_core::config::Config;
use ember_core::ppc::PpcChannel;
use ember_io::{Stream, TlsSession};

use crate::access::access_log;
use crate::broker::{Broker, SupMatch};
use crate::dynpage::DynRoutes;
use crate::embfs::EmbFs;
use crate::error::HttpError;
use crate::request::{Method, Request};
use crate::response::Response;
use crate::session::{SessionOpts, WorkerLink};
use crate::status;
use crate::sup_cgi::SupCgi;
use crate::sup_dyn::SupDyn;
use crate::sup_emb::SupEmb;
use crate::uri;
use crate::vhost::{Vhost, VhostList};

/// The TLS side of an `https` backend; binding a real TLS library is
/// someone else's job, the engine only needs accepted sessions.
pub trait TlsProvider {
    fn accept(&self, fd: RawFd) -> std::io::Result<Box<dyn TlsSession>>;
}

/// Identity of the process serving requests: set after fork, carried
/// into sessions and the access log so shared state goes through the
/// parent.
#[derive(Clone, Default)]
pub struct WorkerCtx {
    pub link: Option<Rc<RefCell<PpcChannel>>>,
    pub backend_id: i32,
    pub prefork: bool,
}

impl WorkerCtx {
    /// Put a line on the server log. Workers hand it to the parent,
    /// which owns the log sinks; without a parent link the line goes to
    /// the local diagnostic log.
    pub fn log(&self, level: ember_core::klog::Level, line: &str) {
        match &self.link {
            Some(link) => {
                let msg = ember_core::ppc::PpcMessage::LogAdd {
                    bid: self.backend_id,
                    level: level.as_u8(),
                    line: line.to_owned(),
                };
                if let Err(e) = link.borrow_mut().send(&msg) {
                    warn!("cannot reach the parent log: {e}");
                }
            }
            None => warn!(target: "server_log", "{line}"),
        }
    }

    /// Fetch the nth most recent memory-log line through the parent
    /// (synchronous round-trip); `None` past the end.
    pub fn log_line(&self, index: usize) -> Option<String> {
        let link = self.link.as_ref()?;
        let reply = link
            .borrow_mut()
            .call(&ember_core::ppc::PpcMessage::LogGet {
                bid: self.backend_id,
                index: index as i64,
            })
            .ok()?;
        match reply {
            ember_core::ppc::PpcMessage::LogGetReply { index, line } if index >= 0 => Some(line),
            _ => None,
        }
    }
}

static DEFAULT_INDEXES: &[&str] = &[
    "/index.kl1",
    "/index.html",
    "/index.htm",
    "/index.klx",
    "/index.klone",
    "/index.klc",
];

pub struct HttpEngine {
    config: Config,
    vhosts: Rc<VhostList>,
    broker: Broker,
    sess_opts: Rc<SessionOpts>,
    ctx: RefCell<WorkerCtx>,
    tls: Option<Box<dyn TlsProvider>>,
}

impl HttpEngine {
    /// Build an engine from a backend config subtree and the embedded
    /// resources. Passing a TLS provider makes it an `https` engine.
    pub fn new(
        config: Config,
        embfs: Rc<EmbFs>,
        routes: Rc<DynRoutes>,
        tls: Option<Box<dyn TlsProvider>>,
    ) -> Result<HttpEngine, HttpError> {
        let vhosts = Rc::new(VhostList::from_config(&config)?);
        let sess_opts = Rc::new(SessionOpts::from_config(config.child("session"))?);

        let broker = Broker::new(vec![
            Box::new(SupEmb::new(
                Rc::clone(&embfs),
                Rc::clone(&sess_opts),
                Rc::clone(&vhosts),
            )),
            Box::new(SupDyn::new(routes, Rc::clone(&sess_opts))),
            Box::new(SupCgi::new(Rc::clone(&vhosts))),
        ]);

        Ok(HttpEngine {
            config,
            vhosts,
            broker,
            sess_opts,
            ctx: RefCell::new(WorkerCtx::default()),
            tls,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vhosts(&self) -> &Rc<VhostList> {
        &self.vhosts
    }

    pub fn session_opts(&self) -> &Rc<SessionOpts> {
        &self.sess_opts
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Called in the child right after fork, and in the parent at
    /// startup for iterative backends.
    pub fn set_worker_ctx(&self, ctx: WorkerCtx) {
        self.sess_opts.set_worker_link(WorkerLink {
            link: ctx.link.clone(),
            prefork: ctx.prefork,
        });
        *self.ctx.borrow_mut() = ctx;
    }

    pub fn worker_ctx(&self) -> WorkerCtx {
        self.ctx.borrow().clone()
    }

    /// Rewrite a URI through the vhost's `dir_alias` (and the CGI
    /// `script_alias`) tables; unmatched URIs get `dir_root` prepended.
    fn alias_resolv(&self, vhost: &Vhost, uri: &str) -> String {
        for n in 0.. {
            let Some(sub) = vhost.config.child_n(Some("dir_alias"), n) else { break };
            if let Some(dst) = sub.value().and_then(|v| try_resolv(v, uri)) {
                return dst;
            }
        }
        if let Some(cgi) = vhost.config.subkey("cgi") {
            for n in 0.. {
                let Some(sub) = cgi.child_n(Some("script_alias"), n) else { break };
                if let Some(dst) = sub.value().and_then(|v| try_resolv(v, uri)) {
                    return dst;
                }
            }
        }
        uri::join(&vhost.dir_root, uri)
    }

    /// Can some supplier serve this URI, as given or alias-resolved?
    pub fn validate_uri(&self, vhost: &Vhost, uri: &str) -> Option<SupMatch> {
        if let Some(m) = self.broker.is_valid_uri(Some(vhost), uri) {
            return Some(m);
        }
        let resolved = self.alias_resolv(vhost, uri);
        self.broker.is_valid_uri(Some(vhost), &resolved)
    }

    fn resolv_request(&self, rq: &mut Request, vhost: &Vhost) {
        if let Some(f) = rq.filename().map(str::to_owned) {
            rq.set_resolved_filename(&self.alias_resolv(vhost, &f));
        }
        if let Some(pi) = rq.path_info().map(str::to_owned) {
            rq.set_resolved_path_info(&self.alias_resolv(vhost, &pi));
        }
    }

    /// Probe one candidate index name under the resolved directory.
    fn is_valid_index(&self, rq: &Request, vhost: &Vhost, name: &str) -> Option<SupMatch> {
        let dir = rq.resolved_filename()?;
        let candidate = uri::join(dir, name);
        self.broker.is_valid_uri(Some(vhost), &candidate)
    }

    /// Turn a directory request into its index page: the configured
    /// `index` list first, then the built-in names.
    fn set_index_request(&self, rq: &mut Request, vhost: &Vhost) -> bool {
        let configured: Vec<String> = vhost
            .index
            .as_deref()
            .map(|s| s.split_ascii_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();

        let found = configured
            .iter()
            .map(String::as_str)
            .find_map(|n| self.is_valid_index(rq, vhost, n).map(|m| (n.to_owned(), m)))
            .or_else(|| {
                DEFAULT_INDEXES
                    .iter()
                    .find_map(|n| self.is_valid_index(rq, vhost, n).map(|m| (n.to_string(), m)))
            });

        match found {
            Some((name, m)) => {
                let base = rq.filename().unwrap_or("").to_owned();
                rq.set_filename(&uri::join(&base, &name));
                rq.set_sup_info(Some(m));
                self.resolv_request(rq, vhost);
                true
            }
            None => false,
        }
    }

    fn pick_vhost(&self, rq: &Request) -> Rc<Vhost> {
        if let Some(host) = rq.field_value("Host") {
            let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
            if let Some(vh) = self.vhosts.get(host) {
                return vh;
            }
        }
        self.vhosts.get_n(0).expect("vhost list cannot be empty")
    }

    /// Serve one accepted connection (or one CGI invocation when fd 0
    /// comes from a web server gateway).
    pub fn serve(&self, fd: RawFd) -> Result<(), HttpError> {
        let cgi = fd == 0 && std::env::var("GATEWAY_INTERFACE").is_ok();

        let mut rq = Request::new();
        rq.set_cgi(cgi);
        self.set_request_addrs(&mut rq, fd, cgi);

        let input = match (&self.tls, cgi) {
            (Some(tls), false) => Stream::from_tls(tls.accept(fd)?),
            _ => Stream::from_fd(fd, true),
        };
        input.set_name("client connection");
        rq.bind(input);

        let default_vh = self.vhosts.get_n(0).expect("vhost list cannot be empty");
        rq.load_config(&default_vh.config);

        // CGI mode writes to our own stdout; otherwise the response
        // shares the connection stream
        let out = if cgi {
            Stream::from_fd(1, false)
        } else {
            rq.io().expect("request just bound")
        };
        let rs = Response::new(out, cgi);
        rs.set_method(Method::Get);
        rs.set_status(status::BAD_REQUEST);

        // parse under the default vhost; the real one is only known
        // once the Host header is in
        let parsed = {
            let vh = Rc::clone(&default_vh);
            let mut validator = |uri: &str| self.validate_uri(&vh, uri);
            rq.parse_header(Some(&mut validator))
        };
        if let Err(e) = parsed {
            self.worker_ctx().log(
                ember_core::klog::Level::Warning,
                &format!("bad request from {}: {e}", rq.peer_addr()),
            );
            self.print_error_page(&mut rq, &rs, e.status())?;
            return self.teardown(&rs);
        }

        rs.set_method(rq.method());
        let vhost = self.pick_vhost(&rq);
        rq.set_vhost(vhost.id);
        self.resolv_request(&mut rq, &vhost);

        // a directory URI is answered with its index page
        if rq.sup_info().is_none() && rq.filename().is_some_and(|f| f.ends_with('/')) {
            self.set_index_request(&mut rq, &vhost);
        }

        rs.set_field("Server", &vhost.server_sig);
        rs.set_date(SystemTime::now());
        rs.set_status(status::OK);

        let mut rc = self.broker.serve(Some(&vhost), &mut rq, &rs).err();

        // 404 on a slashless URI that holds an index page: redirect to
        // the directory form
        if rs.status() == status::NOT_FOUND && !uri_path(rq.uri()).ends_with('/') {
            if self.set_index_request(&mut rq, &vhost) {
                let mut nuri = format!("{}/", uri_path(rq.uri()));
                if let Some(q) = rq.query_string() {
                    nuri.push('?');
                    nuri.push_str(q);
                }
                rs.redirect(&nuri);
                rc = Some(status::MOVED_TEMPORARILY);
            }
        }

        if let Err(e) = access_log(&vhost, &self.worker_ctx(), &rq, &rs) {
            warn!("access log failed: {e}");
        }

        if let Some(st) = rc {
            self.print_error_page(&mut rq, &rs, st)?;
        }
        self.teardown(&rs)
    }

    fn teardown(&self, rs: &Response) -> Result<(), HttpError> {
        let io = rs.io();
        io.codecs_remove()?;
        io.flush()?;
        Ok(())
    }

    fn set_request_addrs(&self, rq: &mut Request, fd: RawFd, cgi: bool) {
        if cgi {
            if let Ok(a) = std::env::var("REMOTE_ADDR") {
                let p = std::env::var("REMOTE_PORT").unwrap_or_default();
                rq.set_peer_addr(&format!("{a}:{p}"));
            }
            if let Ok(a) = std::env::var("SERVER_ADDR") {
                let p = std::env::var("SERVER_PORT").unwrap_or_else(|_| "80".into());
                rq.set_local_addr(&format!("{a}:{p}"));
            }
            return;
        }
        if let Ok(ss) = getsockname::<SockaddrStorage>(fd) {
            rq.set_local_addr(&fmt_sockaddr(&ss));
        }
        if let Ok(ss) = getpeername::<SockaddrStorage>(fd) {
            rq.set_peer_addr(&fmt_sockaddr(&ss));
        }
    }

    /// Emit an error (or redirect) page: the configured `error.<code>`
    /// URI when it resolves, a minimal built-in page otherwise.
    pub fn print_error_page(
        &self,
        rq: &mut Request,
        rs: &Response,
        code: u16,
    ) -> Result<(), HttpError> {
        let vhost = self.pick_vhost(rq);

        // redirects keep their Location, everything else starts clean
        if code != status::MOVED_TEMPORARILY {
            rs.body().borrow_mut().header_mut().clear();
        }
        rs.set_field("Server", &vhost.server_sig);
        rs.set_date(SystemTime::now());
        rs.disable_caching();

        if let Some(err_page) = vhost.config.subkey_value(&format!("error.{code}")) {
            let err_page = err_page.to_owned();
            if rq.set_uri(&err_page, None).is_ok() {
                self.resolv_request(rq, &vhost);
                let plain = uri_path(&err_page).to_owned();
                if let Some(m) = self.validate_uri(&vhost, &plain) {
                    rq.set_sup_info(Some(m));
                    rs.set_status(code);
                    if self.broker.serve(Some(&vhost), rq, rs).is_ok() {
                        return Ok(());
                    }
                }
                warn!(code, page = %err_page, "error handler page not found");
            }
        }

        rs.set_status(code);
        rs.print_header()?;
        if rq.method() == Method::Head {
            return Ok(());
        }

        let io = rs.io();
        let body = format!(
            "<!DOCTYPE HTML PUBLIC \"-//IETF//DTD HTML 2.0//EN\">\
             <html><head><title>{code} {desc}</title></head>\n\
             <body><h1>{desc}</h1><p>URL: {url}</p><hr>\
             <address>{sig} embedded web server</address></body></html>",
            desc = status::desc(code),
            url = ember_core::encoding::html_encode(rq.uri()),
            sig = vhost.server_sig,
        );
        io.write(body.as_bytes())?;
        Ok(())
    }
}

/// The path part of a request URI (query stripped).
fn uri_path(uri: &str) -> &str {
    uri.split_once('?').map(|(p, _)| p).unwrap_or(uri)
}

/// `src dst` alias resolution: when `uri` lives under the `src` prefix
/// it is rewritten below `dst`.
fn try_resolv(alias: &str, uri: &str) -> Option<String> {
    let (src, dst) = alias.split_once(char::is_whitespace)?;
    let (src, dst) = (src.trim(), dst.trim());
    if src.is_empty() || dst.is_empty() || !uri.starts_with(src) {
        return None;
    }
    // the prefix must end on a path component boundary
    if !src.ends_with('/') && uri.as_bytes().get(src.len()) != Some(&b'/') {
        return None;
    }
    Some(uri::join(dst, &uri[src.len()..]))
}

fn fmt_sockaddr(ss: &SockaddrStorage) -> String {
    if let Some(sin) = ss.as_sockaddr_in() {
        return sin.to_string();
    }
    if let Some(sin6) = ss.as_sockaddr_in6() {
        return sin6.to_string();
    }
    match ss.family() {
        Some(fam) => format!("{fam:?}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn engine_with(config: &str) -> HttpEngine {
        let mut fs = EmbFs::new();
        fs.register_file("/index.html", b"<h1>home</h1>".as_slice(), 1_559_347_200);
        fs.register_file("/docs/index.html", b"docs index".as_slice(), 1_559_347_200);
        fs.register_file("/err/404.html", b"custom not found".as_slice(), 1_559_347_200);

        let mut routes = DynRoutes::new();
        routes
            .add(r"^/hello/(\w+)$", |ctx| {
                ctx.rs.set_status(status::OK);
                ctx.rs.set_content_type("text/plain");
                let who = ctx.argv.get(1).cloned().unwrap_or_default();
                let mut out = ctx.out.dup();
                write!(out, "hi {who}")?;
                Ok(())
            }, vec![])
            .unwrap();

        let cfg = Config::parse(config).unwrap();
        HttpEngine::new(cfg, Rc::new(fs), Rc::new(routes), None).unwrap()
    }

    fn run(engine: &HttpEngine, request: &[u8]) -> (Request, Response, String) {
        // drive the internals the way serve(fd) does, but over memory
        // streams
        let mut rq = Request::new();
        rq.bind(Stream::from_vec(request.to_vec()));
        rq.set_local_addr("127.0.0.1:8080");
        rq.set_peer_addr("10.0.0.1:4242");

        let out = Stream::mem();
        let rs = Response::new(out.dup(), false);
        rs.set_method(Method::Get);
        rs.set_status(status::BAD_REQUEST);

        let default_vh = engine.vhosts.get_n(0).unwrap();
        let parsed = {
            let vh = Rc::clone(&default_vh);
            let mut validator = |uri: &str| engine.validate_uri(&vh, uri);
            rq.parse_header(Some(&mut validator))
        };

        if let Err(e) = parsed {
            engine.print_error_page(&mut rq, &rs, e.status()).unwrap();
        } else {
            rs.set_method(rq.method());
            let vhost = engine.pick_vhost(&rq);
            rq.set_vhost(vhost.id);
            engine.resolv_request(&mut rq, &vhost);
            if rq.sup_info().is_none() && rq.filename().is_some_and(|f| f.ends_with('/')) {
                engine.set_index_request(&mut rq, &vhost);
            }
            rs.set_field("Server", &vhost.server_sig);
            rs.set_status(status::OK);

            let mut rc = engine.broker.serve(Some(&vhost), &mut rq, &rs).err();
            if rs.status() == status::NOT_FOUND && !uri_path(rq.uri()).ends_with('/') {
                if engine.set_index_request(&mut rq, &vhost) {
                    let mut nuri = format!("{}/", uri_path(rq.uri()));
                    if let Some(q) = rq.query_string() {
                        nuri.push('?');
                        nuri.push_str(q);
                    }
                    rs.redirect(&nuri);
                    rc = Some(status::MOVED_TEMPORARILY);
                }
            }
            if let Some(st) = rc {
                engine.print_error_page(&mut rq, &rs, st).unwrap();
            }
        }
        engine.teardown(&rs).unwrap();
        out.flush().unwrap();
        let text = String::from_utf8_lossy(&out.mem_contents().unwrap()).into_owned();
        (rq, rs, text)
    }

    #[test]
    fn test_static_page_served() {
        let engine = engine_with("dir_root /\n");
        let (_, rs, text) = run(&engine, b"GET /index.html HTTP/1.0\r\nHost: x\r\n\r\n");
        assert_eq!(rs.status(), status::OK);
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.ends_with("<h1>home</h1>"));
    }

    #[test]
    fn test_conditional_get_304() {
        let engine = engine_with("dir_root /\n");
        // resource mtime is 2019-06-01; a 2020 IMS yields 304, no body
        let (_, rs, text) = run(
            &engine,
            b"GET /index.html HTTP/1.0\r\nHost: x\r\nIf-Modified-Since: Wed, 01 Jan 2020 00:00:00 GMT\r\n\r\n",
        );
        assert_eq!(rs.status(), status::NOT_MODIFIED);
        assert!(text.starts_with("HTTP/1.0 304 Not Modified\r\n"));
        assert!(text.ends_with("\r\n\r\n"), "304 must have no body: {text}");
    }

    #[test]
    fn test_conditional_get_equal_mtime_is_304() {
        let engine = engine_with("dir_root /\n");
        // exactly the resource mtime
        let (_, rs, _) = run(
            &engine,
            b"GET /index.html HTTP/1.0\r\nHost: x\r\nIf-Modified-Since: Sat, 01 Jun 2019 00:00:00 GMT\r\n\r\n",
        );
        assert_eq!(rs.status(), status::NOT_MODIFIED);
    }

    #[test]
    fn test_conditional_get_stale_ims_yields_200() {
        let engine = engine_with("dir_root /\n");
        let (_, rs, text) = run(
            &engine,
            b"GET /index.html HTTP/1.0\r\nHost: x\r\nIf-Modified-Since: Wed, 01 Jan 2014 00:00:00 GMT\r\n\r\n",
        );
        assert_eq!(rs.status(), status::OK);
        assert!(text.ends_with("<h1>home</h1>"));
    }

    #[test]
    fn test_directory_uri_serves_index() {
        let engine = engine_with("dir_root /\n");
        let (_, rs, text) = run(&engine, b"GET /docs/ HTTP/1.0\r\nHost: x\r\n\r\n");
        assert_eq!(rs.status(), status::OK);
        assert!(text.ends_with("docs index"));
    }

    #[test]
    fn test_trailing_slash_redirect() {
        let engine = engine_with("dir_root /\n");
        let (_, rs, text) = run(&engine, b"GET /docs HTTP/1.0\r\nHost: x\r\n\r\n");
        assert_eq!(rs.status(), status::MOVED_TEMPORARILY);
        assert!(text.contains("Location: /docs/\r\n"), "{text}");
    }

    #[test]
    fn test_dynamic_route() {
        let engine = engine_with("dir_root /\n");
        let (_, rs, text) = run(&engine, b"GET /hello/world HTTP/1.0\r\nHost: x\r\n\r\n");
        assert_eq!(rs.status(), status::OK);
        assert!(text.ends_with("hi world"));
    }

    #[test]
    fn test_builtin_error_page() {
        let engine = engine_with("dir_root /\n");
        let (_, rs, text) = run(&engine, b"GET /missing.html HTTP/1.0\r\nHost: x\r\n\r\n");
        assert_eq!(rs.status(), status::NOT_FOUND);
        assert!(text.starts_with("HTTP/1.0 404 Not Found\r\n"));
        assert!(text.contains("<h1>Not Found</h1>"));
    }

    #[test]
    fn test_custom_error_page() {
        let engine = engine_with("dir_root /\nerror.404 /err/404.html\n");
        let (_, _, text) = run(&engine, b"GET /missing.html HTTP/1.0\r\nHost: x\r\n\r\n");
        assert!(text.ends_with("custom not found"), "{text}");
    }

    #[test]
    fn test_alias_resolution() {
        let engine = engine_with("dir_root /web\ndir_alias /static /\n");
        // /static/index.html resolves to the embedded /index.html
        let (_, rs, text) = run(&engine, b"GET /static/index.html HTTP/1.0\r\nHost: x\r\n\r\n");
        assert_eq!(rs.status(), status::OK);
        assert!(text.ends_with("<h1>home</h1>"));
    }

    #[test]
    fn test_try_resolv_boundaries() {
        assert_eq!(try_resolv("/img /var/www", "/img/a.png"), Some("/var/www/a.png".into()));
        assert_eq!(try_resolv("/img /var/www", "/imgs/a.png"), None);
        assert_eq!(try_resolv("/img /var/www", "/img"), None);
        assert_eq!(try_resolv("/img/ /var/www", "/img/a"), Some("/var/www/a".into()));
    }

    #[test]
    fn test_head_request_has_headers_only() {
        let engine = engine_with("dir_root /\n");
        let (_, rs, text) = run(&engine, b"HEAD /index.html HTTP/1.0\r\nHost: x\r\n\r\n");
        assert_eq!(rs.status(), status::OK);
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(!text.contains("<h1>"));
    }
}
