//! Supplier for embedded resources: static files straight from the
//! registry, dynamic pages through the handler glue.

use std::rc::Rc;
use std::time::{Duration, UNIX_EPOCH};

use ember_io::{CipherCodec, GzipCodec};
use tracing::debug;

use crate::broker::{SupMatch, Supplier};
use crate::dynpage;
use crate::embfs::{EmbFile, EmbFs, EmbRes};
use crate::error::HttpError;
use crate::request::{Method, Request};
use crate::response::Response;
use crate::rsfilter::ResponseFilter;
use crate::session::{Session, SessionOpts};
use crate::status;
use crate::vhost::{Vhost, VhostList};

pub struct SupEmb {
    fs: Rc<EmbFs>,
    sess: Rc<SessionOpts>,
    vhosts: Rc<VhostList>,
}

impl SupEmb {
    pub fn new(fs: Rc<EmbFs>, sess: Rc<SessionOpts>, vhosts: Rc<VhostList>) -> SupEmb {
        SupEmb { fs, sess, vhosts }
    }

    /// Pull the resource decryption key out of the request's session.
    fn cipher_key(&self, rq: &Request, rs: &Response) -> Option<Vec<u8>> {
        let ss = Session::create(Rc::clone(&self.sess), rq, rs.body()).ok()?;
        let key = ss.borrow().cipher_key().map(<[u8]>::to_vec);
        key
    }

    fn serve_static(
        &self,
        rq: &mut Request,
        rs: &Response,
        e: &EmbFile,
    ) -> Result<(), HttpError> {
        let out = rs.io();
        out.codec_add_tail(Box::new(ResponseFilter::new(rs.body(), None)));

        rs.set_content_type(&e.mime_type);
        rs.set_last_modified(UNIX_EPOCH + Duration::from_secs(e.mtime));
        rs.set_content_length(e.file_size);

        // when the client talks deflate, compressed resources can go
        // out exactly as stored
        let vhost = rq.vhost().and_then(|i| self.vhosts.get_n(i));
        let send_as_is = e.compressed
            && vhost.as_ref().is_some_and(|v| v.send_deflate)
            && rq.is_encoding_accepted("deflate");
        if send_as_is {
            rs.set_content_encoding("deflate");
            rs.set_content_length(e.data.len() as u64);
        }

        if rq.method() == Method::Head {
            out.codecs_remove()?;
            return Ok(());
        }

        if e.compressed && !send_as_is {
            out.codec_add_head(Box::new(GzipCodec::decompress()));
        }

        let mut decrypting = false;
        if e.encrypted {
            let Some(key) = self.cipher_key(rq, rs) else {
                debug!("cipher key not found, asking the client for one");
                rs.set_status(status::EXT_KEY_NEEDED);
                out.codecs_remove()?;
                return Ok(());
            };
            rs.disable_caching();
            match CipherCodec::decrypt(&key, None) {
                Ok(c) => out.codec_add_head(Box::new(c)),
                Err(_) => {
                    rs.set_status(status::EXT_KEY_NEEDED);
                    out.codecs_remove()?;
                    return Ok(());
                }
            }
            decrypting = true;
        }

        let wrote = out
            .write(&e.data)
            .and_then(|()| out.codecs_remove());
        if let Err(err) = wrote {
            if decrypting {
                // almost always a wrong key; let the client supply a
                // better one
                debug!("decrypt failed: {err}");
                rs.set_status(status::EXT_KEY_NEEDED);
                return Ok(());
            }
            return Err(err.into());
        }
        Ok(())
    }
}

impl Supplier for SupEmb {
    fn name(&self) -> &'static str {
        "embedded content supplier"
    }

    fn is_valid_uri(&self, _vhost: Option<&Vhost>, uri: &str) -> Option<(Option<usize>, u64)> {
        match self.fs.lookup(uri)? {
            // encrypted content must never be cached: report no mtime
            EmbRes::File(f) if !f.encrypted => Some((None, f.mtime)),
            _ => Some((None, 0)),
        }
    }

    fn serve(&self, rq: &mut Request, rs: &Response, _m: &SupMatch) -> Result<(), HttpError> {
        let name = rq
            .resolved_filename()
            .or(rq.filename())
            .unwrap_or("")
            .to_owned();
        match self.fs.lookup(&name) {
            None => {
                rs.set_status(status::NOT_FOUND);
                Ok(())
            }
            Some(EmbRes::File(e)) => self.serve_static(rq, rs, e),
            Some(EmbRes::Page(p)) => {
                dynpage::serve_page(p.fun, rq, rs, &self.sess, Vec::new(), Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embfs::EmbRes;
    use ember_io::Stream;

    fn fixture(encrypted_key: Option<&[u8; 32]>) -> (Rc<EmbFs>, Rc<SessionOpts>, Rc<VhostList>) {
        let mut fs = EmbFs::new();
        fs.register_file("/index.html", b"<h1>hi</h1>".as_slice(), 1_559_347_200);

        // a deflated resource, stored compressed
        let deflated = {
            let s = Stream::mem();
            s.codec_add_tail(Box::new(GzipCodec::compress()));
            s.write(b"squeeze me ".repeat(100).as_slice()).unwrap();
            s.codecs_remove().unwrap();
            s.flush().unwrap();
            s.mem_contents().unwrap()
        };
        fs.register(EmbRes::File(EmbFile {
            path: "/page.html".into(),
            mime_type: "text/html".into(),
            mtime: 1_559_347_200,
            file_size: 1100,
            compressed: true,
            encrypted: false,
            data: deflated.into(),
        }));

        if let Some(key) = encrypted_key {
            let secret =
                ember_io::cipher::encrypt_once(key, &[0u8; 16], b"classified bytes").unwrap();
            fs.register(EmbRes::File(EmbFile {
                path: "/secret.bin".into(),
                mime_type: "application/octet-stream".into(),
                mtime: 1_559_347_200,
                file_size: 16,
                compressed: false,
                encrypted: true,
                data: secret.into(),
            }));
        }

        let sess = Rc::new(SessionOpts::from_config(None).unwrap());
        let vhosts = Rc::new(
            VhostList::from_config(&ember_core::config::Config::parse("dir_root /\n").unwrap())
                .unwrap(),
        );
        (Rc::new(fs), sess, vhosts)
    }

    fn request(text: &[u8]) -> Request {
        let mut rq = Request::new();
        rq.bind(Stream::from_vec(text.to_vec()));
        rq.parse_header(None).unwrap();
        rq.set_vhost(0);
        rq
    }

    fn serve(sup: &SupEmb, rq: &mut Request) -> (Response, String) {
        let out = Stream::mem();
        let rs = Response::new(out.dup(), false);
        rs.set_status(status::OK);
        rs.set_method(rq.method());
        rq.set_resolved_filename(&rq.filename().unwrap().to_owned());
        let m = SupMatch { sup: 0, handle: None, mtime: 0 };
        sup.serve(rq, &rs, &m).unwrap();
        out.flush().unwrap();
        let text = String::from_utf8_lossy(&out.mem_contents().unwrap()).into_owned();
        (rs, text)
    }

    #[test]
    fn test_plain_static_file() {
        let (fs, sess, vhosts) = fixture(None);
        let sup = SupEmb::new(fs, sess, vhosts);
        let mut rq = request(b"GET /index.html HTTP/1.0\r\n\r\n");
        let (_, text) = serve(&sup, &mut rq);
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("<h1>hi</h1>"));
    }

    #[test]
    fn test_head_has_no_body() {
        let (fs, sess, vhosts) = fixture(None);
        let sup = SupEmb::new(fs, sess, vhosts);
        let mut rq = request(b"HEAD /index.html HTTP/1.0\r\n\r\n");
        let (_, text) = serve(&sup, &mut rq);
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(!text.contains("<h1>"));
    }

    #[test]
    fn test_compressed_resource_is_inflated_for_plain_clients() {
        let (fs, sess, vhosts) = fixture(None);
        let sup = SupEmb::new(fs, sess, vhosts);
        let mut rq = request(b"GET /page.html HTTP/1.0\r\n\r\n");
        let (_, text) = serve(&sup, &mut rq);
        assert!(text.contains("squeeze me squeeze me"));
        assert!(!text.contains("Content-Encoding"));
    }

    #[test]
    fn test_encrypted_resource_without_key_yields_430() {
        let key = [0x55u8; 32];
        let (fs, sess, vhosts) = fixture(Some(&key));
        let sup = SupEmb::new(fs, sess, vhosts);
        let mut rq = request(b"GET /secret.bin HTTP/1.0\r\n\r\n");
        let (rs, _) = serve(&sup, &mut rq);
        assert_eq!(rs.status(), status::EXT_KEY_NEEDED);
    }

    #[test]
    fn test_encrypted_mtime_is_hidden() {
        let key = [0x55u8; 32];
        let (fs, sess, vhosts) = fixture(Some(&key));
        let sup = SupEmb::new(fs, sess, vhosts);
        assert_eq!(sup.is_valid_uri(None, "/secret.bin"), Some((None, 0)));
        assert_eq!(
            sup.is_valid_uri(None, "/index.html"),
            Some((None, 1_559_347_200))
        );
    }
}
