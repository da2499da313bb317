//! Buffered, reference-counted byte streams with a codec chain.
//!
//! A [`Stream`] is a cheap handle: `dup` clones the handle and the
//! buffers, codecs and underlying device are shared until the last
//! handle is dropped, at which point the chain is flushed and the device
//! closed. Devices are file descriptors, in-memory buffers or TLS
//! sessions.
//!
//! Reads fill a raw 4 KiB buffer from the device, push it through the
//! codec chain and hand out transformed bytes; at device EOF the chain
//! is flushed until every codec reports completion. Writes buffer 4 KiB
//! of transformed output and push it to the device when full or on
//! `flush`.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::codec::{Chain, Codec, Flush};
use crate::error::StreamError;

const RD_BUFSZ: usize = 4096;
const WR_BUFSZ: usize = 4096;

/// The contract a TLS implementation must honour to act as a stream
/// device. Binding an actual TLS library is out of scope here.
pub trait TlsSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn shutdown(&mut self) -> io::Result<()>;
}

enum Device {
    Fd { fd: RawFd, owned: bool },
    Mem { buf: Vec<u8>, pos: usize },
    Tls(Box<dyn TlsSession>),
}

impl Device {
    fn read(&mut self, out: &mut [u8]) -> Result<usize, StreamError> {
        match self {
            Device::Fd { fd, .. } => loop {
                match nix::unistd::read(*fd, out) {
                    Ok(n) => return Ok(n),
                    Err(nix::Error::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
            },
            Device::Mem { buf, pos } => {
                let avail = buf.len().saturating_sub(*pos);
                let n = avail.min(out.len());
                out[..n].copy_from_slice(&buf[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            Device::Tls(s) => loop {
                match s.read(out) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            },
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, StreamError> {
        match self {
            Device::Fd { fd, .. } => loop {
                match nix::unistd::write(*fd, data) {
                    Ok(n) => return Ok(n),
                    Err(nix::Error::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
            },
            Device::Mem { buf, pos } => {
                let n = data.len();
                let end = *pos + n;
                if end > buf.len() {
                    buf.resize(end, 0);
                }
                buf[*pos..end].copy_from_slice(data);
                *pos = end;
                Ok(n)
            }
            Device::Tls(s) => loop {
                match s.write(data) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            },
        }
    }

    fn close(&mut self) -> Result<(), StreamError> {
        match self {
            Device::Fd { fd, owned } => {
                if *owned {
                    nix::unistd::close(*fd)?;
                }
                Ok(())
            }
            Device::Mem { .. } => Ok(()),
            Device::Tls(s) => Ok(s.shutdown()?),
        }
    }

    fn seek(&mut self, off: usize) -> Result<usize, StreamError> {
        match self {
            Device::Fd { fd, .. } => {
                let n = nix::unistd::lseek(*fd, off as i64, nix::unistd::Whence::SeekSet)?;
                Ok(n as usize)
            }
            Device::Mem { pos, .. } => {
                *pos = off;
                Ok(off)
            }
            Device::Tls(_) => Err(StreamError::Unsupported("seek")),
        }
    }

    fn tell(&self) -> Result<usize, StreamError> {
        match self {
            Device::Fd { fd, .. } => {
                let n = nix::unistd::lseek(*fd, 0, nix::unistd::Whence::SeekCur)?;
                Ok(n as usize)
            }
            Device::Mem { pos, .. } => Ok(*pos),
            Device::Tls(_) => Err(StreamError::Unsupported("tell")),
        }
    }
}

struct Inner {
    dev: Device,
    name: String,
    secure: bool,
    closed: bool,
    eof: bool,
    wrote: bool,
    rtot: u64,
    chain: Chain,
    // transformed bytes ready for the consumer
    rbuf: Box<[u8; RD_BUFSZ]>,
    roff: usize,
    rcount: usize,
    // raw device bytes not yet through the chain
    ubuf: Box<[u8; RD_BUFSZ]>,
    uoff: usize,
    ucount: usize,
    // transformed output waiting for the device
    wbuf: Box<[u8; WR_BUFSZ]>,
    wcount: usize,
}

/// A shared handle to one buffered stream.
#[derive(Clone)]
pub struct Stream {
    inner: Rc<RefCell<Inner>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

impl Stream {
    fn from_device(dev: Device, secure: bool) -> Stream {
        Stream {
            inner: Rc::new(RefCell::new(Inner {
                dev,
                name: String::new(),
                secure,
                closed: false,
                eof: false,
                wrote: false,
                rtot: 0,
                chain: Chain::new(),
                rbuf: Box::new([0u8; RD_BUFSZ]),
                roff: 0,
                rcount: 0,
                ubuf: Box::new([0u8; RD_BUFSZ]),
                uoff: 0,
                ucount: 0,
                wbuf: Box::new([0u8; WR_BUFSZ]),
                wcount: 0,
            })),
        }
    }

    /// Wrap a file descriptor. When `owned` the fd is closed with the
    /// last handle.
    pub fn from_fd(fd: RawFd, owned: bool) -> Stream {
        Stream::from_device(Device::Fd { fd, owned }, false)
    }

    /// A readable in-memory stream over existing bytes.
    pub fn from_vec(buf: Vec<u8>) -> Stream {
        Stream::from_device(Device::Mem { buf, pos: 0 }, false)
    }

    /// An empty, growable in-memory stream.
    pub fn mem() -> Stream {
        Stream::from_device(Device::Mem { buf: Vec::new(), pos: 0 }, false)
    }

    /// Wrap an established TLS session; the stream reports itself secure.
    pub fn from_tls(sess: Box<dyn TlsSession>) -> Stream {
        Stream::from_device(Device::Tls(sess), true)
    }

    /// Another handle on the same stream.
    pub fn dup(&self) -> Stream {
        Stream { inner: Rc::clone(&self.inner) }
    }

    /// True when both handles lead to the same stream.
    pub fn same_as(&self, other: &Stream) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_name(&self, name: &str) {
        self.inner.borrow_mut().name = name.to_owned();
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    pub fn is_secure(&self) -> bool {
        self.inner.borrow().secure
    }

    /// Total bytes handed to readers so far; the request parser uses it
    /// to bound body reads.
    pub fn total_read(&self) -> u64 {
        self.inner.borrow().rtot
    }

    /// The raw fd, when the device has one (timeout alarms need it).
    pub fn raw_fd(&self) -> Option<RawFd> {
        match self.inner.borrow().dev {
            Device::Fd { fd, .. } => Some(fd),
            _ => None,
        }
    }

    pub fn codec_add_head(&self, codec: Box<dyn Codec>) {
        self.inner.borrow_mut().chain.add_head(codec);
    }

    pub fn codec_add_tail(&self, codec: Box<dyn Codec>) {
        self.inner.borrow_mut().chain.add_tail(codec);
    }

    pub fn has_codecs(&self) -> bool {
        !self.inner.borrow().chain.is_empty()
    }

    /// Flush the chain (when this stream has been written through it)
    /// and drop every codec. The only way to be sure gzip or cipher
    /// tails reach the device.
    pub fn codecs_remove(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.borrow_mut();
        inner.codecs_remove()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.inner.borrow_mut().read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<(), StreamError> {
        self.inner.borrow_mut().write_all(buf)
    }

    pub fn flush(&self) -> Result<(), StreamError> {
        self.inner.borrow_mut().flush()
    }

    pub fn getc(&self) -> Result<Option<u8>, StreamError> {
        let mut b = [0u8; 1];
        Ok(match self.read(&mut b)? {
            0 => None,
            _ => Some(b[0]),
        })
    }

    pub fn putc(&self, c: u8) -> Result<(), StreamError> {
        self.write(&[c])
    }

    /// Read until `stop` (inclusive) or until `max` bytes. An empty
    /// result means EOF; a result not ending in `stop` means the cap was
    /// hit (partial line).
    pub fn get_until(&self, stop: u8, max: usize) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::new();
        let mut inner = self.inner.borrow_mut();
        while out.len() < max {
            match inner.read_byte()? {
                None => break,
                Some(b) => {
                    out.push(b);
                    if b == stop {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    /// One `\n`-terminated line, lossily decoded.
    pub fn gets(&self, max: usize) -> Result<Option<String>, StreamError> {
        let raw = self.get_until(b'\n', max)?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
    }

    pub fn seek(&self, off: usize) -> Result<usize, StreamError> {
        let mut inner = self.inner.borrow_mut();
        inner.flush()?;
        inner.rcount = 0;
        inner.roff = 0;
        inner.dev.seek(off)
    }

    pub fn tell(&self) -> Result<usize, StreamError> {
        let mut inner = self.inner.borrow_mut();
        inner.flush()?;
        inner.dev.tell()
    }

    /// Close the device now. Safe to call more than once; also invoked
    /// asynchronously by the request timeout alarms.
    pub fn close(&self) -> Result<(), StreamError> {
        self.inner.borrow_mut().close()
    }

    /// Copy everything from `src` until EOF; returns the byte count.
    pub fn pipe(&self, src: &Stream) -> Result<u64, StreamError> {
        let mut buf = [0u8; 4096];
        let mut total = 0u64;
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.write(&buf[..n])?;
            total += n as u64;
        }
        Ok(total)
    }

    /// Copy up to `size` bytes from `src`; may stop early at EOF.
    pub fn copy(&self, src: &Stream, size: u64) -> Result<u64, StreamError> {
        let mut buf = [0u8; 4096];
        let mut rem = size;
        while rem > 0 {
            let want = (rem as usize).min(buf.len());
            let n = src.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            self.write(&buf[..n])?;
            rem -= n as u64;
        }
        Ok(size - rem)
    }

    /// The accumulated bytes of a memory stream.
    pub fn mem_contents(&self) -> Option<Vec<u8>> {
        let inner = self.inner.borrow();
        match &inner.dev {
            Device::Mem { buf, .. } => Some(buf.clone()),
            _ => None,
        }
    }
}

impl Inner {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if self.eof && self.rcount == 0 {
            return Ok(0);
        }
        let mut copied = 0;
        while copied < buf.len() {
            if self.rcount == 0 && self.underflow()? == 0 {
                break;
            }
            let n = self.rcount.min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&self.rbuf[self.roff..self.roff + n]);
            self.roff += n;
            self.rcount -= n;
            self.rtot += n as u64;
            copied += n;
        }
        Ok(copied)
    }

    fn read_byte(&mut self) -> Result<Option<u8>, StreamError> {
        if self.rcount == 0 {
            if self.eof {
                return Ok(None);
            }
            if self.underflow()? == 0 {
                return Ok(None);
            }
        }
        let b = self.rbuf[self.roff];
        self.roff += 1;
        self.rcount -= 1;
        self.rtot += 1;
        Ok(Some(b))
    }

    /// Refill the transformed read buffer.
    fn underflow(&mut self) -> Result<usize, StreamError> {
        while self.rcount == 0 {
            if self.ucount == 0 {
                let n = {
                    let ubuf: &mut [u8] = &mut self.ubuf[..];
                    // borrow dance: device and buffer are disjoint fields
                    let dev = &mut self.dev;
                    dev.read(ubuf)?
                };
                if n == 0 {
                    // device EOF: drain whatever the codecs still hold
                    if !self.chain.is_empty() {
                        let (sz, fl) = self.chain.flush_chunk(&mut self.rbuf[..])?;
                        self.rcount = sz;
                        self.roff = 0;
                        if fl == Flush::Complete {
                            self.eof = true;
                        }
                    } else {
                        self.eof = true;
                    }
                    break;
                }
                self.uoff = 0;
                self.ucount = n;
            }

            let src = &self.ubuf[self.uoff..self.uoff + self.ucount];
            let (consumed, produced) = self.chain.transfer(&mut self.rbuf[..], src)?;
            self.ucount -= consumed;
            if self.ucount == 0 {
                self.uoff = 0;
            } else {
                self.uoff += consumed;
            }
            self.rcount = produced;
            self.roff = 0;
        }
        Ok(self.rcount)
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<(), StreamError> {
        self.wrote = true;
        while !buf.is_empty() {
            if self.wcount == WR_BUFSZ {
                self.flush()?;
            }
            let start = self.wcount;
            let (consumed, produced) = {
                let wbuf: &mut [u8] = &mut self.wbuf[start..];
                self.chain.transfer(wbuf, buf)?
            };
            self.wcount += produced;
            buf = &buf[consumed..];
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        let mut off = 0;
        while off < self.wcount {
            let n = self.dev.write(&self.wbuf[off..self.wcount])?;
            if n == 0 {
                break;
            }
            off += n;
        }
        self.wcount = 0;
        Ok(())
    }

    fn codecs_remove(&mut self) -> Result<(), StreamError> {
        if !self.chain.is_empty() && self.wrote {
            let mut buf = [0u8; 4096];
            loop {
                let (count, fl) = self.chain.flush_chunk(&mut buf)?;
                let mut off = 0;
                while off < count {
                    if self.wcount == WR_BUFSZ {
                        self.flush()?;
                    }
                    let n = (count - off).min(WR_BUFSZ - self.wcount);
                    let at = self.wcount;
                    self.wbuf[at..at + n].copy_from_slice(&buf[off..off + n]);
                    self.wcount += n;
                    off += n;
                }
                if fl == Flush::Complete {
                    break;
                }
            }
        }
        self.chain.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.dev.close()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.codecs_remove();
        let _ = self.flush();
        let _ = self.close();
    }
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(self, buf).map_err(Into::into)
    }
}

impl io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(self, buf).map_err(io::Error::from)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Stream::flush(self).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherCodec;
    use crate::codec::Identity;
    use crate::gzip::GzipCodec;
    use std::io::Write as _;

    const KEY: [u8; 32] = [9u8; 32];
    const IV: [u8; 16] = [4u8; 16];

    /// Write `data` through `make_out` codecs into a memory stream, read
    /// it back through `make_in` codecs.
    fn round_trip(
        data: &[u8],
        out_codecs: Vec<Box<dyn crate::codec::Codec>>,
        in_codecs: Vec<Box<dyn crate::codec::Codec>>,
    ) -> Vec<u8> {
        let out = Stream::mem();
        for c in out_codecs {
            out.codec_add_tail(c);
        }
        out.write(data).unwrap();
        out.codecs_remove().unwrap();
        out.flush().unwrap();
        let wire = out.mem_contents().unwrap();

        let inp = Stream::from_vec(wire);
        for c in in_codecs {
            inp.codec_add_tail(c);
        }
        let mut got = Vec::new();
        let mut buf = [0u8; 311]; // odd size on purpose
        loop {
            let n = inp.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        got
    }

    #[test]
    fn test_identity_round_trip() {
        let data = b"plain bytes".repeat(777);
        let got = round_trip(
            &data,
            vec![Box::new(Identity), Box::new(Identity)],
            vec![Box::new(Identity), Box::new(Identity)],
        );
        assert_eq!(got, data);
    }

    #[test]
    fn test_gzip_round_trip() {
        let data = b"0123456789 abcdefgh ".repeat(4096);
        let got = round_trip(
            &data,
            vec![Box::new(GzipCodec::compress())],
            vec![Box::new(GzipCodec::decompress())],
        );
        assert_eq!(got, data);
    }

    #[test]
    fn test_cipher_round_trip() {
        let data = b"secret payload".repeat(991);
        let got = round_trip(
            &data,
            vec![Box::new(CipherCodec::encrypt(&KEY, Some(&IV)).unwrap())],
            vec![Box::new(CipherCodec::decrypt(&KEY, Some(&IV)).unwrap())],
        );
        assert_eq!(got, data);
    }

    #[test]
    fn test_gzip_then_cipher_round_trip() {
        // wire sees cipher(gzip(plain)); decode applies the inverses in
        // reverse order
        let data = b"layered codecs, layered fun. ".repeat(2048);
        let got = round_trip(
            &data,
            vec![
                Box::new(GzipCodec::compress()),
                Box::new(CipherCodec::encrypt(&KEY, Some(&IV)).unwrap()),
            ],
            vec![
                Box::new(CipherCodec::decrypt(&KEY, Some(&IV)).unwrap()),
                Box::new(GzipCodec::decompress()),
            ],
        );
        assert_eq!(got, data);
    }

    #[test]
    fn test_get_until_lines_and_partial() {
        let s = Stream::from_vec(b"first line\nsecond\nno newline".to_vec());
        assert_eq!(s.get_until(b'\n', 4096).unwrap(), b"first line\n");
        assert_eq!(s.gets(4096).unwrap().unwrap(), "second\n");
        assert_eq!(s.get_until(b'\n', 4096).unwrap(), b"no newline");
        assert!(s.get_until(b'\n', 4096).unwrap().is_empty());
    }

    #[test]
    fn test_get_until_respects_cap() {
        let s = Stream::from_vec(b"abcdefghij\n".to_vec());
        let part = s.get_until(b'\n', 4).unwrap();
        assert_eq!(part, b"abcd");
    }

    #[test]
    fn test_dup_shares_state() {
        let a = Stream::from_vec(b"xyz".to_vec());
        let b = a.dup();
        assert_eq!(a.getc().unwrap(), Some(b'x'));
        assert_eq!(b.getc().unwrap(), Some(b'y'));
        assert!(a.same_as(&b));
    }

    #[test]
    fn test_total_read_counter() {
        let s = Stream::from_vec(vec![0u8; 100]);
        let mut buf = [0u8; 60];
        s.read(&mut buf).unwrap();
        assert_eq!(s.total_read(), 60);
        s.read(&mut buf).unwrap();
        assert_eq!(s.total_read(), 100);
    }

    #[test]
    fn test_fd_stream_file_round_trip() {
        use std::os::unix::io::IntoRawFd;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let f = std::fs::File::create(&path).unwrap();
        let s = Stream::from_fd(f.into_raw_fd(), true);
        s.write(b"written through fd").unwrap();
        drop(s); // flush + close

        let f = std::fs::File::open(&path).unwrap();
        let s = Stream::from_fd(f.into_raw_fd(), true);
        let mut buf = [0u8; 64];
        let n = s.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"written through fd");
    }

    #[test]
    fn test_write_macro_via_io_write() {
        let mut s = Stream::mem();
        write!(s, "HTTP/1.0 {} {}\r\n", 200, "OK").unwrap();
        s.flush().unwrap();
        assert_eq!(s.mem_contents().unwrap(), b"HTTP/1.0 200 OK\r\n");
    }

    #[test]
    fn test_seek_tell_mem() {
        let s = Stream::mem();
        s.write(b"0123456789").unwrap();
        assert_eq!(s.tell().unwrap(), 10);
        s.seek(2).unwrap();
        let mut b = [0u8; 3];
        s.read(&mut b).unwrap();
        assert_eq!(&b, b"234");
    }
}
