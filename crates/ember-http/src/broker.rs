//! The broker: resolves a URI to the supplier that can serve it, and
//! drives conditional GET before any supplier runs.

use std::time::{Duration, UNIX_EPOCH};

use tracing::debug;

use crate::error::HttpError;
use crate::request::Request;
use crate::response::Response;
use crate::status;
use crate::vhost::Vhost;

/// Cached resolution: which supplier accepted a URI, an opaque
/// supplier-private handle, and the resource mtime (0 = not cacheable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupMatch {
    pub sup: usize,
    pub handle: Option<usize>,
    pub mtime: u64,
}

/// A strategy that may recognise and serve URIs.
pub trait Supplier {
    fn name(&self) -> &'static str;

    /// Does this URI name a resource we can serve? Returns the private
    /// handle and the resource mtime.
    fn is_valid_uri(&self, vhost: Option<&Vhost>, uri: &str) -> Option<(Option<usize>, u64)>;

    fn serve(&self, rq: &mut Request, rs: &Response, m: &SupMatch) -> Result<(), HttpError>;

    /// True when a ≥400 status set by this supplier's handlers is an
    /// application answer rather than a broker-level failure.
    fn owns_error_statuses(&self) -> bool {
        true
    }
}

pub struct Broker {
    suppliers: Vec<Box<dyn Supplier>>,
}

impl Broker {
    pub fn new(suppliers: Vec<Box<dyn Supplier>>) -> Broker {
        Broker { suppliers }
    }

    /// Probe suppliers in registration order.
    pub fn is_valid_uri(&self, vhost: Option<&Vhost>, uri: &str) -> Option<SupMatch> {
        for (i, sup) in self.suppliers.iter().enumerate() {
            if let Some((handle, mtime)) = sup.is_valid_uri(vhost, uri) {
                return Some(SupMatch {
                    sup: i,
                    handle,
                    mtime,
                });
            }
        }
        None
    }

    /// Serve the resolved request; `Err(status)` asks the engine to
    /// emit an error page.
    pub fn serve(
        &self,
        vhost: Option<&Vhost>,
        rq: &mut Request,
        rs: &Response,
    ) -> Result<(), u16> {
        let m = match rq.sup_info().cloned() {
            Some(m) => m,
            None => {
                let file_name = rq.resolved_filename().unwrap_or("").to_owned();
                match self.is_valid_uri(vhost, &file_name) {
                    Some(m) => m,
                    None => {
                        rs.set_status(status::NOT_FOUND);
                        debug!(file = %file_name, "404, no supplier accepts");
                        return Err(status::NOT_FOUND);
                    }
                }
            }
        };

        // conditional GET: an If-Modified-Since at or past the resource
        // mtime short-circuits to a bodyless 304
        let ims = rq
            .if_modified_since()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        if let Some(ims) = ims {
            if m.mtime != 0 && ims >= m.mtime {
                rs.set_status(status::NOT_MODIFIED);
                rs.set_last_modified(UNIX_EPOCH + Duration::from_secs(m.mtime));
                if rs.print_header().is_err() {
                    return Err(status::INTERNAL_SERVER_ERROR);
                }
                return Ok(());
            }
        }

        let sup = &self.suppliers[m.sup];
        if let Err(e) = sup.serve(rq, rs, &m) {
            debug!(supplier = sup.name(), "serve failed: {e}");
            // protocol errors keep their status; anything else is a 404
            let st = match &e {
                HttpError::Request { status, .. } => *status,
                _ => status::NOT_FOUND,
            };
            rs.set_status(st);
            return Err(st);
        }

        let st = rs.status();
        if st == status::EXT_KEY_NEEDED {
            return Err(st);
        }
        if st >= 400 && !sup.owns_error_statuses() {
            return Err(st);
        }
        Ok(())
    }

    pub fn supplier_name(&self, idx: usize) -> Option<&'static str> {
        self.suppliers.get(idx).map(|s| s.name())
    }
}
