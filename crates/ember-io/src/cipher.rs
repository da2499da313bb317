//! AES-256-CBC codec with PKCS#7 padding.
//!
//! Encrypting buffers input up to a block boundary and pads on flush;
//! decrypting holds back the most recent plaintext block until flush so
//! the padding can be stripped once the input really is over.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::codec::{Codec, Flush};
use crate::error::CodecError;

pub const CIPHER_KEY_LEN: usize = 32;
pub const CIPHER_IV_LEN: usize = 16;
const BLOCK: usize = 16;

/// Largest slice of input processed per transform call.
const CIPHER_MAX_INPUT: usize = 4096;

type Enc = cbc::Encryptor<Aes256>;
type Dec = cbc::Decryptor<Aes256>;

enum Mode {
    Encrypt(Enc),
    Decrypt(Dec),
}

pub struct CipherCodec {
    mode: Mode,
    partial: [u8; BLOCK],
    partial_len: usize,
    held: Option<[u8; BLOCK]>,
    out: Vec<u8>,
    out_off: usize,
    finished: bool,
}

fn check_key_iv(key: &[u8], iv: Option<&[u8]>) -> Result<[u8; CIPHER_IV_LEN], CodecError> {
    if key.len() != CIPHER_KEY_LEN {
        return Err(CodecError::Cipher(format!(
            "key must be {CIPHER_KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    let mut ivb = [0u8; CIPHER_IV_LEN];
    if let Some(iv) = iv {
        if iv.len() != CIPHER_IV_LEN {
            return Err(CodecError::Cipher(format!(
                "iv must be {CIPHER_IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        ivb.copy_from_slice(iv);
    }
    Ok(ivb)
}

impl CipherCodec {
    /// Encrypting codec; a missing IV means an all-zero IV.
    pub fn encrypt(key: &[u8], iv: Option<&[u8]>) -> Result<CipherCodec, CodecError> {
        let ivb = check_key_iv(key, iv)?;
        Ok(Self::new(Mode::Encrypt(Enc::new(
            GenericArray::from_slice(key),
            GenericArray::from_slice(&ivb),
        ))))
    }

    pub fn decrypt(key: &[u8], iv: Option<&[u8]>) -> Result<CipherCodec, CodecError> {
        let ivb = check_key_iv(key, iv)?;
        Ok(Self::new(Mode::Decrypt(Dec::new(
            GenericArray::from_slice(key),
            GenericArray::from_slice(&ivb),
        ))))
    }

    fn new(mode: Mode) -> CipherCodec {
        CipherCodec {
            mode,
            partial: [0u8; BLOCK],
            partial_len: 0,
            held: None,
            out: Vec::new(),
            out_off: 0,
            finished: false,
        }
    }

    fn drain(&mut self, dst: &mut [u8]) -> usize {
        let avail = self.out.len() - self.out_off;
        let n = avail.min(dst.len());
        dst[..n].copy_from_slice(&self.out[self.out_off..self.out_off + n]);
        self.out_off += n;
        if self.out_off == self.out.len() {
            self.out.clear();
            self.out_off = 0;
        }
        n
    }

    fn process_block(&mut self, block: [u8; BLOCK]) {
        let mut ga = GenericArray::clone_from_slice(&block);
        match &mut self.mode {
            Mode::Encrypt(e) => {
                e.encrypt_block_mut(&mut ga);
                self.out.extend_from_slice(&ga);
            }
            Mode::Decrypt(d) => {
                d.decrypt_block_mut(&mut ga);
                if let Some(prev) = self.held.replace(ga.into()) {
                    self.out.extend_from_slice(&prev);
                }
            }
        }
    }
}

impl Codec for CipherCodec {
    fn transform(&mut self, dst: &mut [u8], src: &[u8]) -> Result<(usize, usize), CodecError> {
        if self.out_off < self.out.len() {
            return Ok((0, self.drain(dst)));
        }

        let take = src.len().min(CIPHER_MAX_INPUT);
        let mut i = 0;
        while i < take {
            let room = BLOCK - self.partial_len;
            let n = room.min(take - i);
            self.partial[self.partial_len..self.partial_len + n].copy_from_slice(&src[i..i + n]);
            self.partial_len += n;
            i += n;
            if self.partial_len == BLOCK {
                let block = self.partial;
                self.partial_len = 0;
                self.process_block(block);
            }
        }

        let produced = self.drain(dst);
        if take == 0 && produced == 0 {
            return Err(CodecError::Stalled);
        }
        Ok((take, produced))
    }

    fn flush(&mut self, dst: &mut [u8]) -> Result<(usize, Flush), CodecError> {
        if self.out_off < self.out.len() {
            return Ok((self.drain(dst), Flush::Chunk));
        }
        if self.finished {
            return Ok((0, Flush::Complete));
        }
        self.finished = true;

        match &mut self.mode {
            Mode::Encrypt(_) => {
                // PKCS#7: always emit a final padded block
                let pad = (BLOCK - self.partial_len) as u8;
                let mut block = self.partial;
                for b in block[self.partial_len..].iter_mut() {
                    *b = pad;
                }
                self.partial_len = 0;
                self.process_block(block);
            }
            Mode::Decrypt(_) => {
                if self.partial_len != 0 {
                    return Err(CodecError::Cipher(
                        "ciphertext is not a multiple of the block size".into(),
                    ));
                }
                match self.held.take() {
                    None => return Ok((0, Flush::Complete)), // empty stream
                    Some(block) => {
                        let pad = block[BLOCK - 1] as usize;
                        if pad == 0
                            || pad > BLOCK
                            || block[BLOCK - pad..].iter().any(|&b| b as usize != pad)
                        {
                            return Err(CodecError::Cipher("bad padding".into()));
                        }
                        self.out.extend_from_slice(&block[..BLOCK - pad]);
                    }
                }
            }
        }

        let n = self.drain(dst);
        if n == 0 && self.out.is_empty() {
            return Ok((0, Flush::Complete));
        }
        Ok((n, Flush::Chunk))
    }
}

/// One-shot convenience encryption of a small buffer (used for the
/// session-held resource key).
pub fn encrypt_once(key: &[u8], iv: &[u8], plain: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut codec = CipherCodec::encrypt(key, Some(iv))?;
    run_once(&mut codec, plain)
}

/// One-shot decryption, inverse of [`encrypt_once`].
pub fn decrypt_once(key: &[u8], iv: &[u8], cipher: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut codec = CipherCodec::decrypt(key, Some(iv))?;
    run_once(&mut codec, cipher)
}

fn run_once(codec: &mut CipherCodec, input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    let mut src = input;
    while !src.is_empty() {
        let (c, p) = codec.transform(&mut buf, src)?;
        out.extend_from_slice(&buf[..p]);
        src = &src[c..];
    }
    loop {
        let (p, fl) = codec.flush(&mut buf)?;
        out.extend_from_slice(&buf[..p]);
        if fl == Flush::Complete {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];
    const IV: [u8; 16] = [3u8; 16];

    #[test]
    fn test_round_trip() {
        let data = b"attack at dawn, bring snacks".repeat(33);
        let enc = encrypt_once(&KEY, &IV, &data).unwrap();
        assert_eq!(enc.len() % 16, 0);
        assert!(enc.len() > data.len());
        let dec = decrypt_once(&KEY, &IV, &enc).unwrap();
        assert_eq!(dec, data);
    }

    #[test]
    fn test_round_trip_block_multiple() {
        let data = [0x42u8; 64];
        let enc = encrypt_once(&KEY, &IV, &data).unwrap();
        // full pad block appended
        assert_eq!(enc.len(), 80);
        assert_eq!(decrypt_once(&KEY, &IV, &enc).unwrap(), data);
    }

    #[test]
    fn test_empty_input() {
        let enc = encrypt_once(&KEY, &IV, b"").unwrap();
        assert_eq!(enc.len(), 16);
        assert_eq!(decrypt_once(&KEY, &IV, &enc).unwrap(), b"");
    }

    #[test]
    fn test_wrong_key_fails() {
        let data = b"sixteen byte msg";
        let enc = encrypt_once(&KEY, &IV, data).unwrap();
        let mut bad = KEY;
        bad[0] ^= 1;
        match decrypt_once(&bad, &IV, &enc) {
            Err(_) => {}
            Ok(plain) => assert_ne!(plain, data),
        }
    }

    #[test]
    fn test_ragged_ciphertext_fails() {
        let enc = encrypt_once(&KEY, &IV, b"hello").unwrap();
        assert!(decrypt_once(&KEY, &IV, &enc[..enc.len() - 1]).is_err());
    }

    #[test]
    fn test_bad_key_length_rejected() {
        assert!(CipherCodec::encrypt(&[0u8; 16], None).is_err());
        assert!(CipherCodec::encrypt(&[0u8; 32], Some(&[0u8; 8])).is_err());
    }
}
