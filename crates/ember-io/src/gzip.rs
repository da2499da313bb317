//! Deflate codec on top of flate2, in raw-deflate framing (no zlib or
//! gzip header) — the format embedded resources and compressed sessions
//! are stored in.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::codec::{Codec, Flush};
use crate::error::CodecError;

enum Inner {
    Deflate(Compress),
    Inflate(Decompress),
}

pub struct GzipCodec {
    inner: Inner,
    finished: bool,
}

impl GzipCodec {
    pub fn compress() -> GzipCodec {
        GzipCodec {
            inner: Inner::Deflate(Compress::new(Compression::default(), false)),
            finished: false,
        }
    }

    pub fn decompress() -> GzipCodec {
        GzipCodec {
            inner: Inner::Inflate(Decompress::new(false)),
            finished: false,
        }
    }
}

impl Codec for GzipCodec {
    fn transform(&mut self, dst: &mut [u8], src: &[u8]) -> Result<(usize, usize), CodecError> {
        match &mut self.inner {
            Inner::Deflate(z) => {
                let (in0, out0) = (z.total_in(), z.total_out());
                z.compress(src, dst, FlushCompress::None)
                    .map_err(|e| CodecError::Gzip(e.to_string()))?;
                Ok(((z.total_in() - in0) as usize, (z.total_out() - out0) as usize))
            }
            Inner::Inflate(z) => {
                let (in0, out0) = (z.total_in(), z.total_out());
                let status = z
                    .decompress(src, dst, FlushDecompress::None)
                    .map_err(|e| CodecError::Gzip(e.to_string()))?;
                if status == Status::StreamEnd {
                    self.finished = true;
                }
                Ok(((z.total_in() - in0) as usize, (z.total_out() - out0) as usize))
            }
        }
    }

    fn flush(&mut self, dst: &mut [u8]) -> Result<(usize, Flush), CodecError> {
        if self.finished {
            return Ok((0, Flush::Complete));
        }
        if dst.is_empty() {
            // downstream is backed up; try again once it drained
            return Ok((0, Flush::Chunk));
        }
        match &mut self.inner {
            Inner::Deflate(z) => {
                let out0 = z.total_out();
                let status = z
                    .compress(&[], dst, FlushCompress::Finish)
                    .map_err(|e| CodecError::Gzip(e.to_string()))?;
                let produced = (z.total_out() - out0) as usize;
                if status == Status::StreamEnd {
                    self.finished = true;
                    if produced == 0 {
                        return Ok((0, Flush::Complete));
                    }
                }
                Ok((produced, Flush::Chunk))
            }
            Inner::Inflate(z) => {
                let out0 = z.total_out();
                let status = z
                    .decompress(&[], dst, FlushDecompress::None)
                    .map_err(|e| CodecError::Gzip(e.to_string()))?;
                let produced = (z.total_out() - out0) as usize;
                match status {
                    Status::StreamEnd => {
                        self.finished = true;
                        if produced == 0 {
                            return Ok((0, Flush::Complete));
                        }
                        Ok((produced, Flush::Chunk))
                    }
                    // no progress and no end marker: truncated input
                    Status::BufError if produced == 0 => {
                        Err(CodecError::Gzip("truncated deflate stream".into()))
                    }
                    _ => Ok((produced, Flush::Chunk)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump(codec: &mut GzipCodec, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        let mut src = input;
        while !src.is_empty() {
            let (c, p) = codec.transform(&mut buf, src).unwrap();
            out.extend_from_slice(&buf[..p]);
            src = &src[c..];
            assert!(c > 0 || p > 0);
        }
        loop {
            let (p, fl) = codec.flush(&mut buf).unwrap();
            out.extend_from_slice(&buf[..p]);
            if fl == Flush::Complete {
                break;
            }
        }
        out
    }

    #[test]
    fn test_compress_then_decompress() {
        let data = b"compressible compressible compressible data".repeat(100);
        let packed = pump(&mut GzipCodec::compress(), &data);
        assert!(packed.len() < data.len());
        let unpacked = pump(&mut GzipCodec::decompress(), &packed);
        assert_eq!(unpacked, data);
    }

    #[test]
    fn test_flush_complete_is_sticky() {
        let mut c = GzipCodec::compress();
        let mut buf = [0u8; 64];
        loop {
            let (_, fl) = c.flush(&mut buf).unwrap();
            if fl == Flush::Complete {
                break;
            }
        }
        assert_eq!(c.flush(&mut buf).unwrap(), (0, Flush::Complete));
    }

    #[test]
    fn test_truncated_stream_fails_flush() {
        let data = b"some data to compress, long enough to matter".repeat(50);
        let packed = pump(&mut GzipCodec::compress(), &data);
        let mut d = GzipCodec::decompress();
        let mut buf = [0u8; 4096];
        let cut = &packed[..packed.len() / 2];
        let mut src = cut;
        while !src.is_empty() {
            let (c, _) = d.transform(&mut buf, src).unwrap();
            src = &src[c..];
        }
        let mut failed = false;
        for _ in 0..64 {
            match d.flush(&mut buf) {
                Err(_) => {
                    failed = true;
                    break;
                }
                Ok((_, Flush::Complete)) => break,
                Ok(_) => continue,
            }
        }
        assert!(failed);
    }
}
