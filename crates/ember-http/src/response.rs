//! The response object: status, header and cookie mutators over a
//! shared body record, plus the output stream. The body record is
//! shared with the response filter, which serialises it when the first
//! body byte is about to hit the wire.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::SystemTime;

use ember_core::encoding::url_encode;
use ember_io::Stream;

use crate::error::HttpError;
use crate::header::{Field, Header};
use crate::request::Method;
use crate::status;

/// The mutable part of a response, shared between the [`Response`]
/// handle and the response filter.
#[derive(Debug)]
pub struct RsBody {
    status: u16,
    method: Method,
    header: Header,
    cgi: bool,
}

impl RsBody {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn set_method(&mut self, m: Method) {
        self.method = m;
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn is_cgi(&self) -> bool {
        self.cgi
    }

    /// Serialise the status line (suppressed in CGI mode) and every
    /// header field, terminated by the empty line.
    pub fn print_header_to(&self, io: &mut dyn Write) -> std::io::Result<()> {
        if !self.cgi {
            write!(io, "HTTP/1.0 {} {}\r\n", self.status, status::desc(self.status))?;
        }
        for f in self.header.iter() {
            write!(io, "{}: {}\r\n", f.name(), f.value())?;
        }
        write!(io, "\r\n")
    }
}

pub type RsBodyRef = Rc<RefCell<RsBody>>;

/// Build a `Set-Cookie` field. A missing value deletes the cookie on
/// the client by expiring it in the distant past.
pub fn cookie_field(
    name: &str,
    value: Option<&str>,
    expire: Option<SystemTime>,
    path: Option<&str>,
    domain: Option<&str>,
    secure: bool,
) -> Field {
    let mut buf = match value {
        None => format!("{name}=; expires=Wed, 01-Jan-1990 10:10:10 GMT"),
        Some(v) => {
            let mut s = format!("{name}={}", url_encode(v.as_bytes()));
            if let Some(t) = expire {
                s.push_str("; expires=");
                s.push_str(&httpdate::fmt_http_date(t));
            }
            s
        }
    };
    if let Some(p) = path {
        buf.push_str("; path=");
        buf.push_str(p);
    }
    if let Some(d) = domain {
        buf.push_str("; domain=");
        buf.push_str(d);
    }
    if secure {
        buf.push_str("; secure");
    }
    Field::new("Set-Cookie", buf)
}

pub struct Response {
    body: RsBodyRef,
    io: Stream,
}

impl Response {
    pub fn new(io: Stream, cgi: bool) -> Response {
        Response {
            body: Rc::new(RefCell::new(RsBody {
                status: status::BAD_REQUEST,
                method: Method::Get,
                header: Header::new(),
                cgi,
            })),
            io,
        }
    }

    /// The shared body record (for the response filter and sessions).
    pub fn body(&self) -> RsBodyRef {
        Rc::clone(&self.body)
    }

    /// A handle on the output stream.
    pub fn io(&self) -> Stream {
        self.io.dup()
    }

    pub fn status(&self) -> u16 {
        self.body.borrow().status
    }

    pub fn set_status(&self, status: u16) {
        self.body.borrow_mut().status = status;
    }

    pub fn method(&self) -> Method {
        self.body.borrow().method
    }

    pub fn set_method(&self, m: Method) {
        self.body.borrow_mut().method = m;
    }

    pub fn set_field(&self, name: &str, value: &str) {
        self.body.borrow_mut().header.set(name, value);
    }

    pub fn del_field(&self, name: &str) -> bool {
        self.body.borrow_mut().header.del(name)
    }

    pub fn field_value(&self, name: &str) -> Option<String> {
        self.body.borrow().header.value(name).map(str::to_owned)
    }

    pub fn set_content_type(&self, mime: &str) {
        self.set_field("Content-Type", mime);
    }

    pub fn set_content_length(&self, len: u64) {
        self.set_field("Content-Length", &len.to_string());
    }

    pub fn set_content_encoding(&self, enc: &str) {
        self.set_field("Content-Encoding", enc);
    }

    pub fn set_date(&self, t: SystemTime) {
        self.set_field("Date", &httpdate::fmt_http_date(t));
    }

    pub fn set_last_modified(&self, t: SystemTime) {
        self.set_field("Last-Modified", &httpdate::fmt_http_date(t));
    }

    /// Make browsers revalidate every time.
    pub fn disable_caching(&self) {
        self.set_field("Cache-Control", "no-cache, must-revalidate");
        self.set_field("Expires", "Mon, 1 Jan 1990 05:00:00 GMT");
        self.set_field("Pragma", "no-cache");
    }

    pub fn enable_caching(&self) {
        let mut b = self.body.borrow_mut();
        b.header.del("Cache-Control");
        b.header.del("Expires");
        b.header.del("Pragma");
    }

    /// 302 + `Location`.
    pub fn redirect(&self, url: &str) {
        let mut b = self.body.borrow_mut();
        b.status = status::MOVED_TEMPORARILY;
        b.header.add(Field::new("Location", url));
    }

    /// Append a `Set-Cookie` field; `value == None` deletes the cookie
    /// on the client by expiring it in the distant past.
    pub fn set_cookie(
        &self,
        name: &str,
        value: Option<&str>,
        expire: Option<SystemTime>,
        path: Option<&str>,
        domain: Option<&str>,
        secure: bool,
    ) {
        self.body
            .borrow_mut()
            .header
            .add(cookie_field(name, value, expire, path, domain, secure));
    }

    /// Write the header straight to the output stream. Only used on
    /// paths that bypass the response filter (304, error pages).
    pub fn print_header(&self) -> Result<(), HttpError> {
        let mut out = Vec::new();
        self.body.borrow().print_header_to(&mut out)?;
        self.io.write(&out)?;
        Ok(())
    }
}
