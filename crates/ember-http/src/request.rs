//! Request parsing: request line, headers, cookies, urlencoded and
//! multipart bodies, upload spooling, idle/post timeouts.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ember_core::config::Config;
use ember_core::encoding::url_decode;
use ember_core::timer::{self, TimerAction};
use ember_core::vars::{Var, Vars};
use ember_io::Stream;
use tracing::warn;

use crate::broker::SupMatch;
use crate::error::HttpError;
use crate::header::{Header, LoadMode};
use crate::status;
use crate::uri;

const DEFAULT_IDLE_TIMEOUT: u32 = 10; // seconds
const DEFAULT_POST_TIMEOUT: u32 = 600;
const DEFAULT_POST_MAXSIZE: u64 = 5 * 1024 * 1000;

const LINE_MAX: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Unknown,
}

impl Method {
    fn parse(s: &str) -> Method {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Unknown => "UNKNOWN",
        }
    }
}

/// A file uploaded through `multipart/form-data`, spooled to disk. The
/// spool file is unlinked when the request goes away.
#[derive(Debug)]
pub struct Upload {
    field: String,
    client_filename: String,
    mime_type: String,
    size: u64,
    path: PathBuf,
}

impl Upload {
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn client_filename(&self) -> &str {
        &self.client_filename
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Upload {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to unlink upload spool: {e}");
        }
    }
}

/// Checks whether some prefix of the decoded path names a servable
/// resource, and reports which supplier claimed it.
pub type UriValidator<'a> = dyn FnMut(&str) -> Option<SupMatch> + 'a;

#[derive(Debug)]
pub struct Request {
    io: Option<Stream>,
    header: Header,
    method: Method,
    cli_rq: String,
    uri: String,
    protocol: String,
    path_info: Option<String>,
    query: Option<String>,
    filename: Option<String>,
    resolved_filename: Option<String>,
    resolved_path_info: Option<String>,
    args: Vars,
    args_get: Vars,
    args_post: Vars,
    cookies: Vars,
    uploads: Vec<Upload>,
    content_length: Option<u64>,
    if_modified_since: Option<SystemTime>,
    local_addr: String,
    peer_addr: String,
    cgi: bool,
    idle_timeout: u32,
    post_timeout: u32,
    post_maxsize: u64,
    temp_dir: Option<PathBuf>,
    vhost: Option<usize>,
    sup_info: Option<SupMatch>,
    body_off: u64,
}

impl Request {
    pub fn new() -> Request {
        Request {
            io: None,
            header: Header::new(),
            method: Method::Unknown,
            cli_rq: String::new(),
            uri: String::new(),
            protocol: String::new(),
            path_info: None,
            query: None,
            filename: None,
            resolved_filename: None,
            resolved_path_info: None,
            args: Vars::new(),
            args_get: Vars::new(),
            args_post: Vars::new(),
            cookies: Vars::new(),
            uploads: Vec::new(),
            content_length: None,
            if_modified_since: None,
            local_addr: String::new(),
            peer_addr: String::new(),
            cgi: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            post_timeout: DEFAULT_POST_TIMEOUT,
            post_maxsize: DEFAULT_POST_MAXSIZE,
            temp_dir: None,
            vhost: None,
            sup_info: None,
            body_off: 0,
        }
    }

    /// Pick up the per-vhost request limits.
    pub fn load_config(&mut self, cfg: &Config) {
        if let Some(v) = cfg.subkey_value("idle_timeout") {
            self.idle_timeout = v.parse().map(|n: u32| n.max(1)).unwrap_or(DEFAULT_IDLE_TIMEOUT);
        }
        if let Some(v) = cfg.subkey_value("post_timeout") {
            self.post_timeout = v.parse().map(|n: u32| n.max(5)).unwrap_or(DEFAULT_POST_TIMEOUT);
        }
        if let Some(v) = cfg.subkey_value("post_maxsize") {
            self.post_maxsize = v.parse().map(|n: u64| n.max(1024)).unwrap_or(DEFAULT_POST_MAXSIZE);
        }
        if let Some(v) = cfg.subkey_value("temp_dir") {
            self.temp_dir = Some(PathBuf::from(v));
        }
    }

    pub fn bind(&mut self, io: Stream) {
        self.io = Some(io);
    }

    pub fn io(&self) -> Option<Stream> {
        self.io.as_ref().map(Stream::dup)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn client_request(&self) -> &str {
        &self.cli_rq
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn set_filename(&mut self, fname: &str) {
        self.filename = Some(fname.to_owned());
    }

    pub fn resolved_filename(&self) -> Option<&str> {
        self.resolved_filename.as_deref()
    }

    pub fn set_resolved_filename(&mut self, fname: &str) {
        self.resolved_filename = Some(fname.to_owned());
    }

    pub fn path_info(&self) -> Option<&str> {
        self.path_info.as_deref()
    }

    pub fn set_path_info(&mut self, pi: &str) {
        self.path_info = Some(pi.to_owned());
    }

    pub fn resolved_path_info(&self) -> Option<&str> {
        self.resolved_path_info.as_deref()
    }

    pub fn set_resolved_path_info(&mut self, pi: &str) {
        self.resolved_path_info = Some(pi.to_owned());
    }

    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn field_value(&self, name: &str) -> Option<&str> {
        self.header.value(name)
    }

    pub fn args(&self) -> &Vars {
        &self.args
    }

    pub fn get_args(&self) -> &Vars {
        &self.args_get
    }

    pub fn post_args(&self) -> &Vars {
        &self.args_post
    }

    pub fn arg(&self, name: &str) -> Option<std::borrow::Cow<'_, str>> {
        self.args.get_str(name)
    }

    pub fn cookies(&self) -> &Vars {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<std::borrow::Cow<'_, str>> {
        self.cookies.get_str(name)
    }

    pub fn uploads(&self) -> &[Upload] {
        &self.uploads
    }

    /// The `idx`-th upload posted under form field `name`.
    pub fn uploaded_file(&self, name: &str, idx: usize) -> Option<&Upload> {
        self.uploads.iter().filter(|u| u.field == name).nth(idx)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn if_modified_since(&self) -> Option<SystemTime> {
        self.if_modified_since
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn set_local_addr(&mut self, a: &str) {
        self.local_addr = a.to_owned();
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn set_peer_addr(&mut self, a: &str) {
        self.peer_addr = a.to_owned();
    }

    pub fn is_cgi(&self) -> bool {
        self.cgi
    }

    pub fn set_cgi(&mut self, cgi: bool) {
        self.cgi = cgi;
    }

    pub fn vhost(&self) -> Option<usize> {
        self.vhost
    }

    pub fn set_vhost(&mut self, idx: usize) {
        self.vhost = Some(idx);
    }

    pub fn sup_info(&self) -> Option<&SupMatch> {
        self.sup_info.as_ref()
    }

    pub fn set_sup_info(&mut self, m: Option<SupMatch>) {
        self.sup_info = m;
    }

    /// True when the `Accept-Encoding` header lists `encoding`.
    pub fn is_encoding_accepted(&self, encoding: &str) -> bool {
        match self.header.value("Accept-Encoding") {
            None => false,
            Some(v) => v
                .split([',', ' '])
                .any(|tok| {
                    let tok = tok.split(';').next().unwrap_or(tok).trim();
                    tok.eq_ignore_ascii_case(encoding)
                }),
        }
    }

    /// Parse the URI: store it verbatim, split off the query string,
    /// decode and normalise the path, then shrink it prefix-by-prefix
    /// until the validator recognises a resource; the rest is path info.
    pub fn set_uri(&mut self, raw: &str, validator: Option<&mut UriValidator>) -> Result<(), HttpError> {
        if raw.len() >= LINE_MAX {
            return Err(HttpError::request(status::BAD_REQUEST, "request URI too long"));
        }
        self.uri = raw.to_owned();
        self.path_info = None;
        self.sup_info = None;

        let path_part = match raw.split_once('?') {
            Some((p, q)) => {
                self.query = Some(q.to_owned());
                p
            }
            None => raw,
        };

        let decoded = url_decode(path_part.as_bytes())
            .map_err(|_| HttpError::request(status::BAD_REQUEST, "bad URI escape"))?;
        let decoded = String::from_utf8_lossy(&decoded).into_owned();
        let norm = uri::normalize(&decoded);

        self.filename = Some(norm.clone());

        if let Some(validator) = validator {
            let mut pi = norm.len();
            loop {
                if let Some(m) = validator(&norm[..pi]) {
                    self.filename = Some(norm[..pi].to_owned());
                    if pi < norm.len() {
                        self.path_info = Some(norm[pi..].to_owned());
                    }
                    self.sup_info = Some(m);
                    break;
                }
                match norm[..pi].rfind('/') {
                    Some(0) | None => break, // nothing matched; keep the whole path
                    Some(p) => pi = p,
                }
            }
        }
        Ok(())
    }

    /// Parse the request line and headers. The whole read is guarded by
    /// the idle timeout: on expiry the connection fd is closed and the
    /// blocked read fails.
    pub fn parse_header(&mut self, validator: Option<&mut UriValidator>) -> Result<(), HttpError> {
        let io = self
            .io
            .as_ref()
            .ok_or_else(|| HttpError::Other("request not bound to a stream".into()))?
            .dup();

        let alarm = io
            .raw_fd()
            .map(|fd| timer::add(self.idle_timeout, TimerAction::CloseFd(fd)))
            .transpose()
            .map_err(|e| HttpError::Other(e.to_string()))?;

        let r = self.parse_header_inner(&io, validator);

        if let Some(al) = alarm {
            timer::del(al);
        }
        r
    }

    fn parse_header_inner(
        &mut self,
        io: &Stream,
        validator: Option<&mut UriValidator>,
    ) -> Result<(), HttpError> {
        if !self.cgi {
            let line = io
                .gets(LINE_MAX)?
                .ok_or_else(|| HttpError::request(status::BAD_REQUEST, "empty request"))?;
            self.cli_rq = line.trim_end_matches(['\r', '\n']).to_owned();

            let mut tokens = self.cli_rq.split_ascii_whitespace();
            let method = tokens
                .next()
                .ok_or_else(|| HttpError::request(status::BAD_REQUEST, "missing method"))?;
            self.method = Method::parse(method);
            if self.method == Method::Unknown {
                return Err(HttpError::request(
                    status::BAD_REQUEST,
                    format!("unknown method {method}"),
                ));
            }

            let uri = tokens
                .next()
                .ok_or_else(|| HttpError::request(status::BAD_REQUEST, "missing URI"))?
                .to_owned();

            let proto = tokens
                .next()
                .ok_or_else(|| HttpError::request(status::BAD_REQUEST, "missing protocol"))?
                .to_owned();

            self.set_uri(&uri, validator)?;

            if !proto.to_ascii_lowercase().starts_with("http") {
                return Err(HttpError::request(
                    status::BAD_REQUEST,
                    format!("unsupported protocol {proto}"),
                ));
            }
            self.protocol = proto;

            self.header.load(io)?;
        } else {
            self.header.load_from_cgi_env();
            self.set_from_cgi_env(validator)?;
        }

        if let Some(ims) = self.header.value("If-Modified-Since") {
            self.if_modified_since = httpdate::parse_http_date(ims).ok();
        }

        self.parse_cookies();

        if self.method == Method::Post {
            self.parse_content_length()?;
        }
        Ok(())
    }

    /// Synthesise the request from the canonical CGI environment.
    fn set_from_cgi_env(&mut self, validator: Option<&mut UriValidator>) -> Result<(), HttpError> {
        let env = |k: &str| std::env::var(k).ok();
        let method = env("REQUEST_METHOD").unwrap_or_else(|| "GET".into());
        self.method = Method::parse(&method);

        let mut uri = env("SCRIPT_NAME").unwrap_or_else(|| "/".into());
        if let Some(pi) = env("PATH_INFO") {
            uri.push_str(&pi);
        }
        if let Some(qs) = env("QUERY_STRING") {
            if !qs.is_empty() {
                uri.push('?');
                uri.push_str(&qs);
            }
        }
        self.cli_rq = format!("{method} {uri} CGI/1.1");
        self.set_uri(&uri, validator)?;

        if let Some(ct) = env("CONTENT_TYPE") {
            self.header.set("Content-Type", &ct);
        }
        if let Some(cl) = env("CONTENT_LENGTH") {
            self.header.set("Content-Length", &cl);
        }
        Ok(())
    }

    fn parse_content_length(&mut self) -> Result<(), HttpError> {
        let v = self
            .header
            .value("Content-Length")
            .ok_or_else(|| HttpError::request(status::LENGTH_REQUIRED, "POST without Content-Length"))?;
        let len: u64 = v.parse().map_err(|_| {
            HttpError::request(status::LENGTH_REQUIRED, format!("bad Content-Length {v}"))
        })?;
        self.content_length = Some(len);
        Ok(())
    }

    fn parse_cookies(&mut self) {
        let mut cookies = Vars::new();
        for f in self.header.iter() {
            if !f.name().eq_ignore_ascii_case("cookie") {
                continue;
            }
            for tok in f.value().split([';', ' ']) {
                if tok.is_empty() {
                    continue;
                }
                cookies.add_urlvar(tok);
            }
        }
        self.cookies = cookies;
    }

    fn add_query_vars(&mut self, query: &str, post: bool) {
        for tok in query.split('&') {
            if tok.is_empty() {
                continue;
            }
            if let Ok(v) = Var::from_urlvar(tok) {
                self.args.add(v.clone());
                if post {
                    self.args_post.add(v);
                } else {
                    self.args_get.add(v);
                }
            }
        }
    }

    /// Parse the body. GET and friends only get their query string
    /// split; POST bodies go through the urlencoded or multipart
    /// parsers under the post timeout and the size cap.
    pub fn parse_data(&mut self) -> Result<(), HttpError> {
        let query = self.query.clone().unwrap_or_default();
        self.add_query_vars(&query, false);

        if self.method != Method::Post {
            return Ok(());
        }

        let len = match self.content_length {
            None => {
                return Err(HttpError::request(
                    status::LENGTH_REQUIRED,
                    "POST without Content-Length",
                ))
            }
            Some(0) => return Ok(()),
            Some(n) => n,
        };
        if len > self.post_maxsize {
            return Err(HttpError::request(
                status::REQUEST_TOO_LARGE,
                format!("{len} bytes posted, cap is {}", self.post_maxsize),
            ));
        }

        let io = self
            .io
            .as_ref()
            .ok_or_else(|| HttpError::Other("request not bound to a stream".into()))?
            .dup();
        self.body_off = io.total_read();

        let alarm = io
            .raw_fd()
            .map(|fd| timer::add(self.post_timeout, TimerAction::CloseFd(fd)))
            .transpose()
            .map_err(|e| HttpError::Other(e.to_string()))?;

        let r = self.parse_body(&io, len);

        if let Some(al) = alarm {
            timer::del(al);
        }
        r
    }

    fn parse_body(&mut self, io: &Stream, len: u64) -> Result<(), HttpError> {
        let ctype = self.header.value("Content-Type").map(str::to_owned);
        let is_multipart = ctype
            .as_deref()
            .is_some_and(|c| c.to_ascii_lowercase().starts_with("multipart/form-data"));
        let is_urlencoded = match ctype.as_deref() {
            None => true,
            Some(c) => c
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded"),
        };

        if is_multipart {
            self.parse_multipart(io, len)
        } else if is_urlencoded {
            self.parse_urlencoded(io, len)
        } else {
            // opaque body, the handler reads it itself
            Ok(())
        }
    }

    fn parse_urlencoded(&mut self, io: &Stream, len: u64) -> Result<(), HttpError> {
        let mut body = vec![0u8; len as usize];
        let mut off = 0;
        while off < body.len() {
            let n = io.read(&mut body[off..])?;
            if n == 0 {
                return Err(HttpError::request(status::BAD_REQUEST, "short POST body"));
            }
            off += n;
        }
        let body = String::from_utf8_lossy(&body).into_owned();

        // the body extends the query string
        match &mut self.query {
            Some(q) if !q.is_empty() => {
                q.push('&');
                q.push_str(&body);
            }
            _ => self.query = Some(body.clone()),
        }
        self.add_query_vars(&body, true);
        Ok(())
    }

    fn parse_multipart(&mut self, io: &Stream, len: u64) -> Result<(), HttpError> {
        let ct = self
            .header
            .field("Content-Type")
            .ok_or_else(|| HttpError::request(status::BAD_REQUEST, "missing Content-Type"))?;
        let boundary = ct
            .param("boundary")
            .ok_or_else(|| HttpError::request(status::BAD_REQUEST, "missing multipart boundary"))?;
        let boundary = format!("--{boundary}");

        // skip the MIME preamble up to the first boundary line
        loop {
            let line = io
                .gets(LINE_MAX)?
                .ok_or_else(|| HttpError::request(status::BAD_REQUEST, "missing first boundary"))?;
            if line.starts_with(&boundary) {
                break;
            }
        }

        let nl_boundary = format!("\r\n{boundary}");
        let mut eof = false;
        while !eof {
            self.parse_multipart_chunk(io, nl_boundary.as_bytes(), len, &mut eof)?;
        }
        Ok(())
    }

    fn parse_multipart_chunk(
        &mut self,
        io: &Stream,
        boundary: &[u8],
        len: u64,
        eof: &mut bool,
    ) -> Result<(), HttpError> {
        let mut h = Header::new();
        h.load_ex(io, LoadMode::Add)?;

        if h.value("Content-Type")
            .is_some_and(|c| c.to_ascii_lowercase().starts_with("multipart/mixed"))
        {
            return Err(HttpError::request(
                status::BAD_REQUEST,
                "multipart/mixed content is not supported",
            ));
        }
        if let Some(cte) = h.value("Content-Transfer-Encoding") {
            if !cte.eq_ignore_ascii_case("binary") {
                return Err(HttpError::request(
                    status::BAD_REQUEST,
                    format!("unsupported transfer encoding {cte}"),
                ));
            }
        }

        let cd = h
            .field("Content-Disposition")
            .ok_or_else(|| HttpError::request(status::BAD_REQUEST, "part without Content-Disposition"))?;
        if !cd.value().trim_start().starts_with("form-data") {
            return Err(HttpError::request(status::BAD_REQUEST, "part is not form-data"));
        }
        let name = cd.param("name").unwrap_or("").to_owned();
        let filename = cd.param("filename").map(str::to_owned);

        match filename {
            Some(client_filename) if !client_filename.is_empty() => {
                self.spool_upload(io, boundary, &name, &client_filename, h.value("Content-Type"))?;
            }
            _ => {
                let data = self.read_part_into_memory(io, boundary)?;
                let v = Var::new(name.as_str(), data);
                self.args.add(v.clone());
                self.args_post.add(v);
            }
        }

        // "\r\n" between parts, "--" after the last one
        let mut tail = [0u8; 2];
        let mut got = 0;
        while got < 2 {
            let n = io.read(&mut tail[got..])?;
            if n == 0 {
                return Err(HttpError::request(status::BAD_REQUEST, "truncated multipart body"));
            }
            got += n;
        }
        if &tail == b"--" {
            *eof = true;
            // drain the epilogue, bounded by Content-Length
            let limit = len + self.body_off;
            let mut buf = [0u8; 1024];
            while io.total_read() < limit {
                let want = ((limit - io.total_read()) as usize).min(buf.len());
                if io.read(&mut buf[..want])? == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    fn spool_upload(
        &mut self,
        io: &Stream,
        boundary: &[u8],
        name: &str,
        client_filename: &str,
        mime_type: Option<&str>,
    ) -> Result<(), HttpError> {
        let dir = self
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let spool = tempfile::Builder::new()
            .prefix("ember_upload_")
            .tempfile_in(&dir)?;
        let (mut file, tmp_path) = spool.into_parts();

        let mut buf = [0u8; 4096];
        let mut size = 0u64;
        loop {
            let (n, found) = read_until(io, boundary, &mut buf)?;
            if n == 0 && !found {
                return Err(HttpError::request(status::BAD_REQUEST, "truncated upload"));
            }
            let keep = if found { n - boundary.len() } else { n };
            file.write_all(&buf[..keep])?;
            size += keep as u64;
            if size > self.post_maxsize {
                return Err(HttpError::request(
                    status::REQUEST_TOO_LARGE,
                    "upload exceeds post_maxsize",
                ));
            }
            if found {
                break;
            }
        }
        file.flush()?;
        drop(file);

        let path = tmp_path.keep().map_err(|e| HttpError::Other(e.to_string()))?;
        self.uploads.push(Upload {
            field: name.to_owned(),
            client_filename: client_filename.to_owned(),
            mime_type: mime_type.unwrap_or("").to_owned(),
            size,
            path,
        });
        Ok(())
    }

    fn read_part_into_memory(&mut self, io: &Stream, boundary: &[u8]) -> Result<Vec<u8>, HttpError> {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let (n, found) = read_until(io, boundary, &mut buf)?;
            if n == 0 && !found {
                return Err(HttpError::request(status::BAD_REQUEST, "truncated multipart part"));
            }
            let keep = if found { n - boundary.len() } else { n };
            data.extend_from_slice(&buf[..keep]);
            if data.len() as u64 > self.post_maxsize {
                return Err(HttpError::request(
                    status::REQUEST_TOO_LARGE,
                    "POST data exceeds post_maxsize",
                ));
            }
            if found {
                return Ok(data);
            }
        }
    }
}

impl Default for Request {
    fn default() -> Self {
        Request::new()
    }
}

/// Read bytes into `obuf` until the `stop_at` marker has been fully
/// read or the buffer cannot hold another marker. Returns the bytes
/// written (marker included when found) and whether it was found.
fn read_until(io: &Stream, stop_at: &[u8], obuf: &mut [u8]) -> Result<(usize, bool), HttpError> {
    debug_assert!(obuf.len() > stop_at.len());
    let mut matched = 0;
    let mut n = 0;
    loop {
        // keep room so the marker always fits in this buffer; a single
        // matched byte can be abandoned to the data without harm
        if matched <= 1 && obuf.len() - n < stop_at.len() + 1 {
            return Ok((n, false));
        }
        let Some(b) = io.getc()? else { return Ok((n, false)) };
        obuf[n] = b;
        n += 1;
        if stop_at[matched] != b {
            matched = 0;
        }
        if stop_at[matched] == b {
            matched += 1;
            if matched == stop_at.len() {
                return Ok((n, true));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(text: &[u8]) -> Stream {
        Stream::from_vec(text.to_vec())
    }

    fn parse(text: &[u8]) -> Result<Request, HttpError> {
        let mut rq = Request::new();
        rq.bind(stream(text));
        rq.parse_header(None)?;
        rq.parse_data()?;
        Ok(rq)
    }

    #[test]
    fn test_get_with_query() {
        let rq = parse(b"GET /page?name=foo&x=a%20b HTTP/1.0\r\nHost: h\r\n\r\n").unwrap();
        assert_eq!(rq.method(), Method::Get);
        assert_eq!(rq.uri(), "/page?name=foo&x=a%20b");
        assert_eq!(rq.filename(), Some("/page"));
        assert_eq!(rq.query_string(), Some("name=foo&x=a%20b"));
        assert_eq!(rq.arg("name").unwrap(), "foo");
        assert_eq!(rq.arg("x").unwrap(), "a b");
        assert_eq!(rq.get_args().len(), 2);
        assert!(rq.post_args().is_empty());
    }

    #[test]
    fn test_uri_is_normalized() {
        let rq = parse(b"GET /a/../b//c/./d HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(rq.filename(), Some("/b/c/d"));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let err = parse(b"BREW /pot HTTP/1.0\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), status::BAD_REQUEST);
    }

    #[test]
    fn test_non_http_protocol_rejected() {
        let err = parse(b"GET / GOPHER/1.0\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), status::BAD_REQUEST);
    }

    #[test]
    fn test_urlencoded_post() {
        let rq = parse(
            b"POST /submit HTTP/1.0\r\nHost: x\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 15\r\n\r\nname=foo&age=42",
        )
        .unwrap();
        assert_eq!(rq.post_args().get_str("name").unwrap(), "foo");
        assert_eq!(rq.post_args().get_str("age").unwrap(), "42");
        assert_eq!(rq.args().get_str("name").unwrap(), "foo");
        assert_eq!(rq.args().get_str("age").unwrap(), "42");
    }

    #[test]
    fn test_post_without_length_is_411() {
        let err = parse(b"POST /submit HTTP/1.0\r\nHost: x\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), status::LENGTH_REQUIRED);
    }

    #[test]
    fn test_post_at_and_over_maxsize() {
        let mk = |len: u64| {
            let mut rq = Request::new();
            rq.post_maxsize = 64;
            let body = vec![b'a'; 70]; // more than we will ever read
            let mut text = format!(
                "POST /s HTTP/1.0\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {len}\r\n\r\n"
            )
            .into_bytes();
            text.extend_from_slice(&body);
            rq.bind(stream(&text));
            rq.parse_header(None).unwrap();
            rq.parse_data()
        };
        assert!(mk(64).is_ok());
        let err = mk(65).unwrap_err();
        assert_eq!(err.status(), status::REQUEST_TOO_LARGE);
    }

    #[test]
    fn test_cookies_parsed_and_decoded() {
        let rq = parse(b"GET / HTTP/1.0\r\nCookie: sid=abc123; theme=dark%20mode\r\n\r\n").unwrap();
        assert_eq!(rq.cookie("sid").unwrap(), "abc123");
        assert_eq!(rq.cookie("theme").unwrap(), "dark mode");
    }

    #[test]
    fn test_if_modified_since() {
        let rq =
            parse(b"GET / HTTP/1.0\r\nIf-Modified-Since: Wed, 01 Jan 2020 00:00:00 GMT\r\n\r\n")
                .unwrap();
        assert!(rq.if_modified_since().is_some());
    }

    #[test]
    fn test_accept_encoding() {
        let rq = parse(b"GET / HTTP/1.0\r\nAccept-Encoding: gzip, deflate\r\n\r\n").unwrap();
        assert!(rq.is_encoding_accepted("deflate"));
        assert!(rq.is_encoding_accepted("GZIP"));
        assert!(!rq.is_encoding_accepted("br"));
    }

    const MULTIPART: &[u8] = b"POST /up HTTP/1.0\r\n\
        Host: x\r\n\
        Content-Type: multipart/form-data; boundary=AaB03x\r\n\
        Content-Length: 201\r\n\r\n\
        --AaB03x\r\n\
        Content-Disposition: form-data; name=\"note\"\r\n\r\n\
        just text\r\n\
        --AaB03x\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        hello\r\n\
        --AaB03x--\r\n";

    #[test]
    fn test_multipart_upload_and_cleanup() {
        let rq = parse(MULTIPART).unwrap();

        assert_eq!(rq.post_args().get_str("note").unwrap(), "just text");

        assert_eq!(rq.uploads().len(), 1);
        let up = rq.uploaded_file("file", 0).unwrap();
        assert_eq!(up.client_filename(), "a.txt");
        assert_eq!(up.mime_type(), "text/plain");
        assert_eq!(up.size(), 5);
        let path = up.path().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        drop(rq);
        assert!(!path.exists(), "spool file must be unlinked on request drop");
    }

    #[test]
    fn test_multipart_rejects_transfer_encoding() {
        let body = b"POST /up HTTP/1.0\r\n\
            Content-Type: multipart/form-data; boundary=AaB03x\r\n\
            Content-Length: 120\r\n\r\n\
            --AaB03x\r\n\
            Content-Disposition: form-data; name=\"f\"\r\n\
            Content-Transfer-Encoding: base64\r\n\r\n\
            aGVsbG8=\r\n\
            --AaB03x--\r\n";
        assert!(parse(body).is_err());
    }

    #[test]
    fn test_path_info_split_with_validator() {
        let mut rq = Request::new();
        rq.bind(stream(b"GET /app/extra/bits HTTP/1.0\r\n\r\n"));
        let mut validator = |uri: &str| {
            if uri == "/app" {
                Some(SupMatch { sup: 0, handle: None, mtime: 0 })
            } else {
                None
            }
        };
        rq.parse_header(Some(&mut validator)).unwrap();
        assert_eq!(rq.filename(), Some("/app"));
        assert_eq!(rq.path_info(), Some("/extra/bits"));
    }
}
