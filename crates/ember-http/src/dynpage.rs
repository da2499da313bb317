//! Dynamic pages: native handlers routed by URL regex, invoked with a
//! session and a filtered response stream.

use std::rc::Rc;

use ember_io::Stream;
use regex::Regex;
use tracing::warn;

use crate::error::HttpError;
use crate::request::Request;
use crate::response::Response;
use crate::rsfilter::ResponseFilter;
use crate::session::{Session, SessionOpts, SessionRef};

/// What a page handler gets to work with.
pub struct PageCtx<'a> {
    pub rq: &'a mut Request,
    pub rs: &'a Response,
    pub ss: SessionRef,
    /// Output stream, fronted by the response filter.
    pub out: Stream,
    /// Positional captures from the URL pattern (capture 0 first).
    pub argv: Vec<String>,
    /// Named parameters attached to the route at registration time.
    pub params: Vec<(String, String)>,
}

impl PageCtx<'_> {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub type PageFn = fn(&mut PageCtx) -> Result<(), HttpError>;

pub struct DynRoute {
    pattern: Regex,
    fun: PageFn,
    params: Vec<(String, String)>,
}

impl DynRoute {
    pub fn fun(&self) -> PageFn {
        self.fun
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }
}

/// The compiled URL routing table, scanned in registration order.
#[derive(Default)]
pub struct DynRoutes {
    routes: Vec<DynRoute>,
}

impl DynRoutes {
    pub fn new() -> DynRoutes {
        DynRoutes::default()
    }

    pub fn add(
        &mut self,
        pattern: &str,
        fun: PageFn,
        params: Vec<(String, String)>,
    ) -> Result<(), HttpError> {
        let pattern = Regex::new(pattern).map_err(|e| HttpError::Other(e.to_string()))?;
        self.routes.push(DynRoute { pattern, fun, params });
        Ok(())
    }

    /// Index of the first route matching `uri`.
    pub fn match_uri(&self, uri: &str) -> Option<usize> {
        self.routes.iter().position(|r| r.pattern.is_match(uri))
    }

    pub fn route(&self, idx: usize) -> Option<&DynRoute> {
        self.routes.get(idx)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Run a page handler: parse the body, create the session, front the
/// response with the postponed-header filter, call the handler, save
/// the session and flush the filter chain.
pub fn serve_page(
    fun: PageFn,
    rq: &mut Request,
    rs: &Response,
    sess_opts: &Rc<SessionOpts>,
    argv: Vec<String>,
    params: Vec<(String, String)>,
) -> Result<(), HttpError> {
    rq.parse_data()?;

    let ss = Session::create(Rc::clone(sess_opts), rq, rs.body())?;

    let out = rs.io();
    out.codec_add_tail(Box::new(ResponseFilter::new(rs.body(), Some(Rc::clone(&ss)))));

    let r = {
        let mut ctx = PageCtx {
            rq,
            rs,
            ss: Rc::clone(&ss),
            out: out.dup(),
            argv,
            params,
        };
        (fun)(&mut ctx)
    };

    // persist before the filter seals the header, so a freshly created
    // session can still announce its cookie
    {
        let mut ss = ss.borrow_mut();
        if !ss.is_removed() {
            if let Err(e) = ss.save() {
                warn!("session save failed: {e}");
            }
        }
    }

    out.codecs_remove()?;
    r
}

/// Route glue for a page that dispatches to another embedded page
/// named by the `script` route parameter.
pub fn run_script(ctx: &mut PageCtx, embfs: &crate::embfs::EmbFs) -> Result<(), HttpError> {
    let script = ctx
        .param("script")
        .ok_or_else(|| HttpError::Other("missing 'script' param".into()))?
        .to_owned();
    match embfs.lookup(&script) {
        Some(crate::embfs::EmbRes::Page(p)) => (p.fun)(ctx),
        _ => {
            ctx.rs.set_status(crate::status::NOT_FOUND);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_: &mut PageCtx) -> Result<(), HttpError> {
        Ok(())
    }

    #[test]
    fn test_routes_match_in_registration_order() {
        let mut routes = DynRoutes::new();
        routes.add(r"^/blog/\d+$", nop, vec![]).unwrap();
        routes.add(r"^/blog/.*$", nop, vec![]).unwrap();
        assert_eq!(routes.match_uri("/blog/42"), Some(0));
        assert_eq!(routes.match_uri("/blog/about"), Some(1));
        assert_eq!(routes.match_uri("/other"), None);
    }

    #[test]
    fn test_bad_pattern_is_an_error() {
        let mut routes = DynRoutes::new();
        assert!(routes.add(r"([", nop, vec![]).is_err());
    }
}
