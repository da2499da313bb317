//! Filesystem CGI supplier: scripts under a `script_alias` directory
//! (or with a configured extension handler) are executed with the
//! canonical CGI/1.1 environment, stdin wired to the request body and
//! stdout merged back into the response.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, dup2, execve, fork, pipe};
use tracing::{debug, warn};

use ember_io::Stream;

use crate::broker::{SupMatch, Supplier};
use crate::error::HttpError;
use crate::header::LoadMode;
use crate::request::{Method, Request};
use crate::response::Response;
use crate::rsfilter::ResponseFilter;
use crate::status;
use crate::vhost::{Vhost, VhostList};

pub struct SupCgi {
    vhosts: Rc<VhostList>,
}

impl SupCgi {
    pub fn new(vhosts: Rc<VhostList>) -> SupCgi {
        SupCgi { vhosts }
    }

    fn vhost_of(&self, rq: &Request) -> Option<Rc<Vhost>> {
        self.vhosts
            .get_n(rq.vhost().unwrap_or(0))
            .or_else(|| self.vhosts.get_n(0))
    }

    /// The configured interpreter for this file's extension, if any.
    /// `exec` means "run the file itself".
    fn ext_handler(vhost: &Vhost, path: &str) -> Option<String> {
        let cgi = vhost.config.subkey("cgi")?;
        let ext = path.rsplit_once('.')?.1;
        let handler = cgi.subkey_value(&format!("{ext}.handler"))?;
        Some(handler.to_owned())
    }

    fn is_executable(path: &str) -> bool {
        nix::unistd::access(path, nix::unistd::AccessFlags::X_OK).is_ok()
    }

    /// True when `path` lives under one of the vhost's script_alias
    /// target directories.
    fn under_script_alias(vhost: &Vhost, path: &str) -> bool {
        let Some(cgi) = vhost.config.subkey("cgi") else { return false };
        for n in 0.. {
            let Some(sub) = cgi.child_n(Some("script_alias"), n) else { break };
            let Some(value) = sub.value() else { continue };
            // value is "<uri prefix> <directory>"
            let Some((_, dir)) = value.rsplit_once(char::is_whitespace) else { continue };
            if path.starts_with(dir.trim()) {
                return true;
            }
        }
        false
    }
}

impl Supplier for SupCgi {
    fn name(&self) -> &'static str {
        "cgi supplier"
    }

    fn owns_error_statuses(&self) -> bool {
        false
    }

    fn is_valid_uri(&self, vhost: Option<&Vhost>, uri: &str) -> Option<(Option<usize>, u64)> {
        let vhost = vhost?;
        if !std::path::Path::new(uri).is_file() {
            return None;
        }
        if Self::under_script_alias(vhost, uri) && Self::is_executable(uri) {
            return Some((None, 0));
        }
        if Self::ext_handler(vhost, uri).is_some() {
            return Some((None, 0));
        }
        None
    }

    fn serve(&self, rq: &mut Request, rs: &Response, _m: &SupMatch) -> Result<(), HttpError> {
        rs.set_status(status::BAD_REQUEST);

        let fqn = rq
            .resolved_filename()
            .ok_or_else(|| HttpError::Other("cgi without a resolved filename".into()))?
            .to_owned();
        let vhost = self
            .vhost_of(rq)
            .ok_or_else(|| HttpError::Other("no vhost".into()))?;

        let (child, cgi_stdin, cgi_stdout) = cgi_exec(rq, &vhost, &fqn)?;

        rs.disable_caching();

        // relay any POSTed bytes to the script's stdin
        if rq.method() == Method::Post {
            if let (Some(clen), Some(rio)) = (rq.content_length(), rq.io()) {
                if clen > 0 {
                    let cgi_in = Stream::from_fd(cgi_stdin, true);
                    // the script may stop reading early, don't fail on that
                    if let Err(e) = cgi_in.copy(&rio, clen) {
                        debug!("cgi stdin copy interrupted: {e}");
                    }
                }
            } else {
                let _ = nix::unistd::close(cgi_stdin);
            }
        } else {
            let _ = nix::unistd::close(cgi_stdin);
        }

        let cgi_out = Stream::from_fd(cgi_stdout, true);
        let out = rs.io();

        let script_name = fqn.rsplit('/').next().unwrap_or(&fqn);
        if !script_name.starts_with("nph-") {
            out.codec_add_tail(Box::new(ResponseFilter::new(rs.body(), None)));

            // merge the script's header into ours
            {
                let body = rs.body();
                let mut body = body.borrow_mut();
                body.header_mut().load_ex(&cgi_out, LoadMode::Override)?;
            }
            if let Some(v) = rs.field_value("Status") {
                let code = v
                    .split_ascii_whitespace()
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(status::INTERNAL_SERVER_ERROR);
                rs.set_status(code);
                rs.del_field("Status");
            } else if rs.field_value("Location").is_some() {
                rs.set_status(status::MOVED_TEMPORARILY);
            } else {
                rs.set_status(status::OK);
            }
        } else {
            rs.set_status(status::OK);
        }

        let total = out.pipe(&cgi_out)?;
        if total == 0 {
            // force at least one write so the filter emits the header
            out.write(b"\n")?;
        }
        out.codecs_remove()?;

        match waitpid(child, None) {
            Ok(st) => debug!(?st, "cgi finished"),
            Err(e) => warn!("waitpid: {e}"),
        }
        Ok(())
    }
}

/// Fork and exec the script; returns (child pid, its stdin write end,
/// its stdout read end).
fn cgi_exec(
    rq: &Request,
    vhost: &Vhost,
    fqn: &str,
) -> Result<(nix::unistd::Pid, RawFd, RawFd), HttpError> {
    let env = cgi_env(rq, vhost, fqn)?;
    let argv: Vec<CString> = match SupCgi::ext_handler(vhost, fqn) {
        Some(h) if !h.eq_ignore_ascii_case("exec") => {
            vec![cstr(&h)?, cstr(fqn)?]
        }
        _ => vec![cstr(fqn)?],
    };

    use std::os::unix::io::IntoRawFd as _;
    let (in_rd, in_wr) = pipe().map_err(nix_err)?;
    let (in_rd, in_wr) = (in_rd.into_raw_fd(), in_wr.into_raw_fd());
    let (out_rd, out_wr) = pipe().map_err(nix_err)?;
    let (out_rd, out_wr) = (out_rd.into_raw_fd(), out_wr.into_raw_fd());

    match unsafe { fork() }.map_err(nix_err)? {
        ForkResult::Child => {
            // wire the pipes onto stdio, silence stderr, become the cgi
            let _ = dup2(in_rd, 0);
            let _ = dup2(out_wr, 1);
            if let Ok(null) = nix::fcntl::open(
                "/dev/null",
                nix::fcntl::OFlag::O_WRONLY,
                nix::sys::stat::Mode::empty(),
            ) {
                let _ = dup2(null, 2);
            }
            let _ = nix::unistd::close(in_wr);
            let _ = nix::unistd::close(out_rd);
            let _ = execve(&argv[0], &argv, &env);
            unsafe { nix::libc::_exit(1) }
        }
        ForkResult::Parent { child } => {
            let _ = nix::unistd::close(in_rd);
            let _ = nix::unistd::close(out_wr);
            Ok((child, in_wr, out_rd))
        }
    }
}

fn cstr(s: &str) -> Result<CString, HttpError> {
    CString::new(s).map_err(|e| HttpError::Other(e.to_string()))
}

fn nix_err(e: nix::Error) -> HttpError {
    HttpError::Io(std::io::Error::from_raw_os_error(e as i32))
}

fn cgi_env(rq: &Request, vhost: &Vhost, fqn: &str) -> Result<Vec<CString>, HttpError> {
    let mut env: Vec<(String, String)> = vec![
        (
            "SERVER_SOFTWARE".into(),
            concat!("ember/", env!("CARGO_PKG_VERSION")).into(),
        ),
        ("SERVER_PROTOCOL".into(), "HTTP/1.0".into()),
        ("GATEWAY_INTERFACE".into(), "CGI/1.1".into()),
        ("REDIRECT_STATUS".into(), "200".into()),
        ("REQUEST_METHOD".into(), rq.method().as_str().into()),
        ("SCRIPT_FILENAME".into(), fqn.into()),
    ];

    let split_addr = |addr: &str| -> (String, String) {
        match addr.rsplit_once(':') {
            Some((ip, port)) => (ip.to_owned(), port.to_owned()),
            None => (addr.to_owned(), String::new()),
        }
    };
    if !rq.local_addr().is_empty() {
        let (ip, port) = split_addr(rq.local_addr());
        env.push(("SERVER_ADDR".into(), ip));
        env.push(("SERVER_PORT".into(), port));
    }
    if !vhost.host.is_empty() {
        env.push(("SERVER_NAME".into(), vhost.host.clone()));
    }
    if !rq.peer_addr().is_empty() {
        let (ip, port) = split_addr(rq.peer_addr());
        env.push(("REMOTE_ADDR".into(), ip));
        env.push(("REMOTE_PORT".into(), port));
    }
    if rq.io().is_some_and(|io| io.is_secure()) {
        env.push(("HTTPS".into(), "on".into()));
    }
    if let Some(pi) = rq.path_info() {
        env.push(("PATH_INFO".into(), pi.into()));
    }
    if let Some(pi) = rq.resolved_path_info() {
        env.push(("PATH_TRANSLATED".into(), pi.into()));
    }
    if let Some(q) = rq.query_string() {
        env.push(("QUERY_STRING".into(), q.into()));
    }
    if let Some(cl) = rq.content_length() {
        env.push(("CONTENT_LENGTH".into(), cl.to_string()));
    }
    if let Some(ct) = rq.field_value("Content-Type") {
        env.push(("CONTENT_TYPE".into(), ct.into()));
    }
    if let Some(fname) = rq.filename() {
        env.push(("SCRIPT_NAME".into(), fname.into()));
    }
    env.push(("REQUEST_URI".into(), rq.uri().into()));
    if let Ok(root) = std::env::var("SYSTEMROOT") {
        env.push(("SYSTEMROOT".into(), root));
    }

    // every request header, canonical HTTP_ form
    for f in rq.header().iter() {
        let name = format!("HTTP_{}", f.name().to_ascii_uppercase().replace('-', "_"));
        env.push((name, f.value().to_owned()));
    }

    env.into_iter()
        .map(|(k, v)| cstr(&format!("{k}={v}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::config::Config;
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;

    fn vhost_with_cgi(dir: &str) -> Rc<VhostList> {
        let cfg = Config::parse(&format!(
            "dir_root /www\ncgi {{\n    script_alias /cgi-bin {dir}\n}}\n"
        ))
        .unwrap();
        Rc::new(VhostList::from_config(&cfg).unwrap())
    }

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{body}").unwrap();
        let mut perm = f.metadata().unwrap().permissions();
        perm.set_mode(0o755);
        std::fs::set_permissions(&path, perm).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_is_valid_uri_requires_alias_and_exec_bit() {
        let dir = tempfile::tempdir().unwrap();
        let vl = vhost_with_cgi(&dir.path().to_string_lossy());
        let vh = vl.get_n(0).unwrap();
        let sup = SupCgi::new(Rc::clone(&vl));

        let script = write_script(dir.path(), "hello.cgi", "#!/bin/sh\necho\n");
        assert!(sup.is_valid_uri(Some(&vh), &script).is_some());

        // non-executable file in the same dir is rejected
        let plain = dir.path().join("data.txt");
        std::fs::write(&plain, "x").unwrap();
        assert!(sup.is_valid_uri(Some(&vh), &plain.to_string_lossy()).is_none());

        // executable outside any script_alias dir is rejected
        let other = tempfile::tempdir().unwrap();
        let outside = write_script(other.path(), "evil.cgi", "#!/bin/sh\necho\n");
        assert!(sup.is_valid_uri(Some(&vh), &outside).is_none());
    }

    #[test]
    fn test_serve_merges_cgi_headers() {
        let dir = tempfile::tempdir().unwrap();
        let vl = vhost_with_cgi(&dir.path().to_string_lossy());
        let sup = SupCgi::new(Rc::clone(&vl));
        let script = write_script(
            dir.path(),
            "hi.cgi",
            "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\nX-Script: yes\\r\\n\\r\\nbody here'\n",
        );

        let mut rq = Request::new();
        rq.bind(Stream::from_vec(b"GET /cgi-bin/hi.cgi HTTP/1.0\r\n\r\n".to_vec()));
        rq.parse_header(None).unwrap();
        rq.set_vhost(0);
        rq.set_resolved_filename(&script);

        let out = Stream::mem();
        let rs = Response::new(out.dup(), false);
        let m = SupMatch { sup: 0, handle: None, mtime: 0 };
        sup.serve(&mut rq, &rs, &m).unwrap();
        out.flush().unwrap();

        let text = String::from_utf8_lossy(&out.mem_contents().unwrap()).into_owned();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "{text}");
        assert!(text.contains("X-Script: yes\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.ends_with("body here"));
    }

    #[test]
    fn test_serve_honours_status_field() {
        let dir = tempfile::tempdir().unwrap();
        let vl = vhost_with_cgi(&dir.path().to_string_lossy());
        let sup = SupCgi::new(Rc::clone(&vl));
        let script = write_script(
            dir.path(),
            "gone.cgi",
            "#!/bin/sh\nprintf 'Status: 404 Not Found\\r\\n\\r\\nnope'\n",
        );

        let mut rq = Request::new();
        rq.bind(Stream::from_vec(b"GET /cgi-bin/gone.cgi HTTP/1.0\r\n\r\n".to_vec()));
        rq.parse_header(None).unwrap();
        rq.set_vhost(0);
        rq.set_resolved_filename(&script);

        let out = Stream::mem();
        let rs = Response::new(out.dup(), false);
        let m = SupMatch { sup: 0, handle: None, mtime: 0 };
        sup.serve(&mut rq, &rs, &m).unwrap();
        assert_eq!(rs.status(), status::NOT_FOUND);
    }
}
