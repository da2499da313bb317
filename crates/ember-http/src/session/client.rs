//! Client-side session backend: the whole session rides in cookies,
//! authenticated with a keyed MAC so the server can stay stateless.
//!
//! Four cookies travel together: the hex-encoded (compressed,
//! encrypted) data, the save timestamp, the per-save IV and
//! `HMAC(data ‖ sid ‖ mtime ‖ iv)` under a key only this server
//! process knows. A MAC mismatch throws the whole session away.

use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use sha2::Sha256;

use ember_core::encoding::{hex_decode, hex_encode};

use super::{HashKind, Session, SessionError, now_secs};
use crate::request::Request;
use crate::response::cookie_field;

pub(super) const DATA_COOKIE: &str = "KL1_CLISES_DATA";
pub(super) const MTIME_COOKIE: &str = "KL1_CLISES_MTIME";
pub(super) const IV_COOKIE: &str = "KL1_CLISES_IV";
pub(super) const HMAC_COOKIE: &str = "KL1_CLISES_HMAC";

/// Hex payload size cap; past this the session must move server-side.
const COOKIE_MAX_SIZE: usize = 4096;

/// Cookie material captured from the request at session creation.
#[derive(Default)]
pub(super) struct ClientState {
    data: Option<String>,
    mtime: Option<String>,
    iv: Option<String>,
    hmac: Option<String>,
}

impl ClientState {
    pub(super) fn from_request(rq: &Request) -> ClientState {
        let get = |n: &str| rq.cookie(n).map(|c| c.into_owned());
        ClientState {
            data: get(DATA_COOKIE),
            mtime: get(MTIME_COOKIE),
            iv: get(IV_COOKIE),
            hmac: get(HMAC_COOKIE),
        }
    }
}

fn mac_hex(
    ss: &Session,
    data: &str,
    mtime: &str,
    iv: Option<&str>,
) -> Result<String, SessionError> {
    let feed = |mac: &mut dyn FnMut(&[u8])| {
        mac(data.as_bytes());
        mac(ss.id.as_bytes());
        mac(mtime.as_bytes());
        if let Some(iv) = iv {
            mac(iv.as_bytes());
        }
    };
    let raw = match ss.opts.hash {
        HashKind::Sha256 => {
            let mut m = <Hmac<Sha256>>::new_from_slice(&ss.opts.hmac_key)
                .map_err(|e| SessionError::Other(e.to_string()))?;
            feed(&mut |b| m.update(b));
            m.finalize().into_bytes().to_vec()
        }
        HashKind::Md5 => {
            let mut m = <Hmac<Md5>>::new_from_slice(&ss.opts.hmac_key)
                .map_err(|e| SessionError::Other(e.to_string()))?;
            feed(&mut |b| m.update(b));
            m.finalize().into_bytes().to_vec()
        }
    };
    Ok(hex_encode(&raw))
}

pub(super) fn save(ss: &mut Session) -> Result<(), SessionError> {
    // fresh IV for every save; it rides in its own cookie
    let iv_hex = {
        let mut iv = ss.opts.cipher_iv.borrow_mut();
        rand::thread_rng().fill_bytes(&mut *iv);
        hex_encode(&*iv)
    };
    set_cookie(ss, IV_COOKIE, &iv_hex);

    let buf = ss.save_to_buf()?;
    if buf.len() > COOKIE_MAX_SIZE {
        return Err(SessionError::TooBig(buf.len()));
    }
    let data_hex = hex_encode(&buf);
    set_cookie(ss, DATA_COOKIE, &data_hex);

    ss.mtime = now_secs();
    let mtime = ss.mtime.to_string();
    set_cookie(ss, MTIME_COOKIE, &mtime);

    let mac = mac_hex(ss, &data_hex, &mtime, Some(&iv_hex))?;
    set_cookie(ss, HMAC_COOKIE, &mac);
    Ok(())
}

pub(super) fn load(ss: &mut Session) -> Result<(), SessionError> {
    let cli = std::mem::take(&mut ss.cli);
    let (Some(data), Some(mtime), Some(mac)) = (&cli.data, &cli.mtime, &cli.hmac) else {
        return Err(SessionError::NotFound);
    };

    let expect = mac_hex(ss, data, mtime, cli.iv.as_deref())?;
    if expect != *mac {
        // stale or forged; drop everything client-side too
        ss.remove()?;
        return Err(SessionError::BadMac);
    }

    if let Some(iv_hex) = &cli.iv {
        let iv = hex_decode(iv_hex.as_bytes())
            .map_err(|e| SessionError::Other(e.to_string()))?;
        if iv.len() == ss.opts.cipher_iv.borrow().len() {
            ss.opts.cipher_iv.borrow_mut().copy_from_slice(&iv);
        }
    }

    ss.mtime = mtime.parse().unwrap_or(0);

    if data.len() > COOKIE_MAX_SIZE {
        return Err(SessionError::TooBig(data.len()));
    }
    let raw = hex_decode(data.as_bytes()).map_err(|e| SessionError::Other(e.to_string()))?;
    ss.load_from_buf(&raw)?;
    Ok(())
}

pub(super) fn remove(ss: &Session) -> Result<(), SessionError> {
    for name in [DATA_COOKIE, MTIME_COOKIE, HMAC_COOKIE, IV_COOKIE] {
        ss.rs
            .borrow_mut()
            .header_mut()
            .add(cookie_field(name, None, None, None, None, false));
    }
    Ok(())
}

fn set_cookie(ss: &Session, name: &str, value: &str) {
    ss.rs
        .borrow_mut()
        .header_mut()
        .add(cookie_field(name, Some(value), None, None, None, false));
}
