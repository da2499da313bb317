//! The response filter: a codec sitting at the head of the response
//! stream that postpones header emission.
//!
//! While buffering, up to 4 KiB of body bytes are absorbed and nothing
//! reaches the wire, so handlers may keep changing the status, headers
//! and cookies. The filter flips to flushing when the buffer fills or
//! when the stream is flushed at end of response; at that edge it
//! serialises the status line and header once, replays the buffered
//! body, and from then on passes writes straight through. On HEAD
//! requests body bytes are swallowed entirely.

use ember_io::codec::{Codec, Flush};
use ember_io::error::CodecError;

use crate::request::Method;
use crate::response::RsBodyRef;
use crate::session::SessionRef;

/// Body bytes buffered before the header is forced out.
pub const RFBUFSZ: usize = 4096;

enum State {
    Buffering,
    Flushing,
}

pub struct ResponseFilter {
    rs: RsBodyRef,
    ss: Option<SessionRef>,
    state: State,
    buf: Vec<u8>,
    staged: Vec<u8>,
    staged_off: usize,
}

impl ResponseFilter {
    pub fn new(rs: RsBodyRef, ss: Option<SessionRef>) -> ResponseFilter {
        ResponseFilter {
            rs,
            ss,
            state: State::Buffering,
            buf: Vec::with_capacity(RFBUFSZ),
            staged: Vec::new(),
            staged_off: 0,
        }
    }

    fn is_head(&self) -> bool {
        self.rs.borrow().method() == Method::Head
    }

    /// Serialise header + buffered body into the staging area.
    fn stage(&mut self) -> Result<(), CodecError> {
        self.rs
            .borrow()
            .print_header_to(&mut self.staged)
            .map_err(|e| CodecError::Other(e.to_string()))?;
        if !self.is_head() {
            self.staged.extend_from_slice(&self.buf);
        }
        self.buf = Vec::new();
        Ok(())
    }

    fn drain(&mut self, dst: &mut [u8]) -> usize {
        let avail = self.staged.len() - self.staged_off;
        let n = avail.min(dst.len());
        dst[..n].copy_from_slice(&self.staged[self.staged_off..self.staged_off + n]);
        self.staged_off += n;
        if self.staged_off == self.staged.len() {
            self.staged = Vec::new();
            self.staged_off = 0;
        }
        n
    }
}

impl Codec for ResponseFilter {
    fn transform(&mut self, dst: &mut [u8], src: &[u8]) -> Result<(usize, usize), CodecError> {
        if self.is_head() {
            // the header goes out at flush time; the body never does
            return Ok((src.len(), 0));
        }

        if let State::Buffering = self.state {
            if self.buf.len() + src.len() < RFBUFSZ {
                self.buf.extend_from_slice(src);
                return Ok((src.len(), 0));
            }
            // buffer full: last chance to mutate the header, so a
            // session that still lacks an id gets one (and its cookie)
            // right now
            if let Some(ss) = &self.ss {
                let mut ss = ss.borrow_mut();
                if ss.id().is_empty() {
                    ss.ensure_id().map_err(|e| CodecError::Other(e.to_string()))?;
                }
            }
            self.state = State::Flushing;
            self.stage()?;
        }

        if self.staged_off < self.staged.len() {
            return Ok((0, self.drain(dst)));
        }

        let n = dst.len().min(src.len());
        dst[..n].copy_from_slice(&src[..n]);
        Ok((n, n))
    }

    fn flush(&mut self, dst: &mut [u8]) -> Result<(usize, Flush), CodecError> {
        if let State::Buffering = self.state {
            self.state = State::Flushing;
            self.stage()?;
        }
        if self.staged_off < self.staged.len() {
            return Ok((self.drain(dst), Flush::Chunk));
        }
        Ok((0, Flush::Complete))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Response;
    use crate::status;
    use ember_io::Stream;

    fn wire_of(rs: &Response, out: &Stream) -> String {
        out.codecs_remove().unwrap();
        out.flush().unwrap();
        let _ = rs;
        String::from_utf8_lossy(&out.mem_contents().unwrap()).into_owned()
    }

    #[test]
    fn test_header_emitted_before_body_and_late_mutation_wins() {
        let out = Stream::mem();
        let rs = Response::new(out.dup(), false);
        rs.set_status(status::OK);
        out.codec_add_tail(Box::new(ResponseFilter::new(rs.body(), None)));

        out.write(b"<html>").unwrap();
        // headers are still mutable because nothing was flushed yet
        rs.set_field("X-Late", "yes");
        out.write(b"</html>").unwrap();

        let text = wire_of(&rs, &out);
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("X-Late: yes\r\n"));
        assert!(text.ends_with("\r\n\r\n<html></html>"));
    }

    #[test]
    fn test_big_body_forces_header_out() {
        let out = Stream::mem();
        let rs = Response::new(out.dup(), false);
        rs.set_status(status::OK);
        out.codec_add_tail(Box::new(ResponseFilter::new(rs.body(), None)));

        let chunk = vec![b'x'; RFBUFSZ * 2];
        out.write(&chunk).unwrap();
        out.flush().unwrap();
        // header already on the wire even though the stream wasn't torn down
        let so_far = out.mem_contents().unwrap();
        assert!(so_far.starts_with(b"HTTP/1.0 200 OK\r\n"));

        let text = wire_of(&rs, &out);
        assert_eq!(text.matches("HTTP/1.0").count(), 1);
        assert!(text.ends_with(&"x".repeat(RFBUFSZ * 2)));
    }

    #[test]
    fn test_head_suppresses_body() {
        let out = Stream::mem();
        let rs = Response::new(out.dup(), false);
        rs.set_status(status::OK);
        rs.set_method(Method::Head);
        out.codec_add_tail(Box::new(ResponseFilter::new(rs.body(), None)));

        out.write(b"this body must not appear").unwrap();
        let text = wire_of(&rs, &out);
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(!text.contains("body"));
    }

    #[test]
    fn test_empty_body_still_emits_header() {
        let out = Stream::mem();
        let rs = Response::new(out.dup(), false);
        rs.set_status(status::NO_CONTENT);
        out.codec_add_tail(Box::new(ResponseFilter::new(rs.body(), None)));
        let text = wire_of(&rs, &out);
        assert!(text.starts_with("HTTP/1.0 204 No Content\r\n"));
    }
}
