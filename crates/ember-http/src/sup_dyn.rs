//! Supplier for regex-routed dynamic pages: the URL table is scanned
//! in registration order, submatches become positional handler
//! arguments.

use std::rc::Rc;

use crate::broker::{SupMatch, Supplier};
use crate::dynpage::{self, DynRoutes};
use crate::error::HttpError;
use crate::request::Request;
use crate::response::Response;
use crate::session::SessionOpts;
use crate::status;
use crate::vhost::Vhost;

pub struct SupDyn {
    routes: Rc<DynRoutes>,
    sess: Rc<SessionOpts>,
}

impl SupDyn {
    pub fn new(routes: Rc<DynRoutes>, sess: Rc<SessionOpts>) -> SupDyn {
        SupDyn { routes, sess }
    }
}

impl Supplier for SupDyn {
    fn name(&self) -> &'static str {
        "dynamic page supplier"
    }

    fn is_valid_uri(&self, _vhost: Option<&Vhost>, uri: &str) -> Option<(Option<usize>, u64)> {
        self.routes.match_uri(uri).map(|idx| (Some(idx), 0))
    }

    fn serve(&self, rq: &mut Request, rs: &Response, m: &SupMatch) -> Result<(), HttpError> {
        let file_name = rq.filename().unwrap_or("").to_owned();

        // the match is cached from URI resolution so the whole table is
        // not rescanned; fall back to a scan if it is missing
        let idx = match m.handle {
            Some(idx) => idx,
            None => match self.routes.match_uri(&file_name) {
                Some(idx) => idx,
                None => {
                    rs.set_status(status::NOT_FOUND);
                    return Ok(());
                }
            },
        };
        let route = self
            .routes
            .route(idx)
            .ok_or_else(|| HttpError::Other(format!("dangling route handle {idx}")))?;

        let argv: Vec<String> = match route.pattern().captures(&file_name) {
            Some(caps) => caps
                .iter()
                .flatten()
                .map(|c| c.as_str().to_owned())
                .collect(),
            None => {
                rs.set_status(status::NOT_FOUND);
                return Ok(());
            }
        };

        dynpage::serve_page(route.fun(), rq, rs, &self.sess, argv, route.params().to_vec())
    }
}
