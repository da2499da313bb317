//! Sessions: a key/value store bound to a client cookie, with three
//! interchangeable backends — on-disk files, parent-held memory atoms
//! and HMAC-authenticated client-side cookies.

mod client;
mod file;
mod mem;

pub use mem::AtomStore;

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use rand::RngCore;

use ember_core::config::Config;
use ember_core::ppc::PpcChannel;
use ember_core::vars::{Var, Vars};
use ember_io::cipher::{CIPHER_IV_LEN, CIPHER_KEY_LEN, decrypt_once, encrypt_once};
use ember_io::{CipherCodec, GzipCodec, Stream};
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::request::Request;
use crate::response::{RsBodyRef, cookie_field};

/// Reserved variable holding the key that unlocks encrypted embedded
/// resources. Stored encrypted with a per-process key of its own.
pub const SESSION_KEY_VAR: &str = "KLONE_CIPHER_KEY";

pub const SESSION_ID_LENGTH: usize = 32;
const DEFAULT_SID_NAME: &str = "klone_sid";
const DEFAULT_MAX_AGE: u64 = 20 * 60; // seconds

const HMAC_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    File,
    Memory,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha256,
    Md5,
}

/// The PPC link of a prefork worker; absent in the parent and in
/// iterative/fork children, which own a private copy of the atom list.
#[derive(Clone, Default)]
pub struct WorkerLink {
    pub link: Option<Rc<RefCell<PpcChannel>>>,
    pub prefork: bool,
}

/// Per-backend session settings plus the process state the backends
/// share (atom store, cipher material, worker link).
pub struct SessionOpts {
    pub kind: SessionKind,
    pub max_age: u64,
    pub compress: bool,
    pub encrypt: bool,
    pub name: String,
    pub path: PathBuf,
    pub max_count: usize,
    pub mem_limit: usize,
    hash: HashKind,
    cipher_key: [u8; CIPHER_KEY_LEN],
    cipher_iv: RefCell<[u8; CIPHER_IV_LEN]>,
    session_key: [u8; CIPHER_KEY_LEN],
    session_iv: [u8; CIPHER_IV_LEN],
    hmac_key: [u8; HMAC_KEY_LEN],
    atoms: RefCell<AtomStore>,
    worker: RefCell<WorkerLink>,
}

impl SessionOpts {
    /// Read the `session { ... }` config subtree; missing keys fall
    /// back to a file store with a twenty minute lifetime.
    pub fn from_config(cfg: Option<&Config>) -> Result<SessionOpts, SessionError> {
        let mut rng = rand::thread_rng();
        let mut cipher_key = [0u8; CIPHER_KEY_LEN];
        let mut cipher_iv = [0u8; CIPHER_IV_LEN];
        let mut session_key = [0u8; CIPHER_KEY_LEN];
        let mut session_iv = [0u8; CIPHER_IV_LEN];
        let mut hmac_key = [0u8; HMAC_KEY_LEN];
        rng.fill_bytes(&mut cipher_key);
        rng.fill_bytes(&mut cipher_iv);
        rng.fill_bytes(&mut session_key);
        rng.fill_bytes(&mut session_iv);
        rng.fill_bytes(&mut hmac_key);

        let mut so = SessionOpts {
            kind: SessionKind::File,
            max_age: DEFAULT_MAX_AGE,
            compress: false,
            encrypt: false,
            name: DEFAULT_SID_NAME.to_owned(),
            path: std::env::temp_dir(),
            max_count: 0,
            mem_limit: 0,
            hash: HashKind::Sha256,
            cipher_key,
            cipher_iv: RefCell::new(cipher_iv),
            session_key,
            session_iv,
            hmac_key,
            atoms: RefCell::new(AtomStore::new()),
            worker: RefCell::new(WorkerLink::default()),
        };

        let Some(cfg) = cfg else { return Ok(so) };

        match cfg.subkey_value("type") {
            None | Some("file") => so.kind = SessionKind::File,
            Some("memory") => so.kind = SessionKind::Memory,
            Some("client") => so.kind = SessionKind::Client,
            Some(other) => {
                return Err(SessionError::Other(format!("bad session type '{other}'")));
            }
        }
        if let Some(v) = cfg.subkey_value("max_age") {
            // configured in minutes, silently floored to one
            let mins: u64 = v
                .parse()
                .map_err(|_| SessionError::Other(format!("bad max_age '{v}'")))?;
            so.max_age = (mins * 60).max(60);
        }
        so.compress = cfg
            .subkey_value_b("compress", false)
            .map_err(|e| SessionError::Other(e.to_string()))?;
        so.encrypt = cfg
            .subkey_value_b("encrypt", false)
            .map_err(|e| SessionError::Other(e.to_string()))?;
        if let Some(v) = cfg.subkey_value("sid_name") {
            so.name = v.to_owned();
        }
        if let Some(v) = cfg.subkey_value("file.path") {
            so.path = PathBuf::from(v);
        }
        so.max_count = cfg.subkey_value_i("memory.max_count", 0).unwrap_or(0) as usize;
        so.mem_limit = cfg.subkey_value_i("memory.limit", 0).unwrap_or(0) as usize;

        if so.kind == SessionKind::Client {
            // client-side sessions travel on the wire, encryption is
            // not optional there
            if !so.encrypt {
                warn!("encryption is required for client side sessions, forcing it on");
            }
            so.encrypt = true;
            if let Some(h) = cfg.subkey_value("client.hash_function") {
                so.hash = match h.to_ascii_lowercase().as_str() {
                    "md5" => HashKind::Md5,
                    "sha256" | "sha-256" => HashKind::Sha256,
                    other => {
                        return Err(SessionError::Other(format!("bad hash_function '{other}'")));
                    }
                };
            }
        }

        Ok(so)
    }

    pub fn set_worker_link(&self, link: WorkerLink) {
        *self.worker.borrow_mut() = link;
    }

    /// Parent-side handle on the atom list, for the PPC handlers.
    pub fn atoms(&self) -> &RefCell<AtomStore> {
        &self.atoms
    }

    fn worker(&self) -> WorkerLink {
        self.worker.borrow().clone()
    }
}

pub struct Session {
    opts: Rc<SessionOpts>,
    rs: RsBodyRef,
    id: String,
    vars: Vars,
    mtime: u64,
    removed: bool,
    addr: String,
    // client backend scratch, carried from load to save
    cli: client::ClientState,
}

pub type SessionRef = Rc<RefCell<Session>>;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn is_good_id(id: &str) -> bool {
    id.len() == SESSION_ID_LENGTH && id.bytes().all(|b| b.is_ascii_hexdigit())
}

impl Session {
    /// Build the session for a request: adopt the client's cookie when
    /// it looks like a session id, load the stored data, and expire it
    /// when too old.
    pub fn create(
        opts: Rc<SessionOpts>,
        rq: &Request,
        rs: RsBodyRef,
    ) -> Result<SessionRef, SessionError> {
        let mut ss = Session {
            opts: Rc::clone(&opts),
            rs,
            id: String::new(),
            vars: Vars::new(),
            mtime: now_secs(),
            removed: false,
            // the session store is keyed by the *server* address: the
            // client port changes per connection
            addr: rq.local_addr().to_owned(),
            cli: client::ClientState::from_request(rq),
        };

        if let Some(sid) = rq.cookie(&opts.name) {
            if is_good_id(&sid) {
                ss.id = sid.into_owned();
            }
        }

        if !ss.id.is_empty() {
            if let Err(e) = ss.load() {
                debug!("session load failed: {e}");
            }
            if ss.age() > opts.max_age {
                debug!(id = %ss.id, "session expired");
                ss.vars.clear();
                ss.remove()?;
            }
        }

        Ok(Rc::new(RefCell::new(ss)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    pub fn get(&self, name: &str) -> Option<std::borrow::Cow<'_, str>> {
        self.vars.get_str(name)
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.vars.set(name, value.as_bytes());
    }

    pub fn del(&mut self, name: &str) -> bool {
        self.vars.del(name)
    }

    /// Drop every variable.
    pub fn clean(&mut self) {
        self.vars.clear();
    }

    /// Seconds since the last save.
    pub fn age(&self) -> u64 {
        now_secs().saturating_sub(self.mtime)
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Store the resource decryption key; kept as an opaque binary
    /// variable and encrypted at rest.
    pub fn set_cipher_key(&mut self, key: &[u8]) {
        self.vars.del(SESSION_KEY_VAR);
        self.vars.add(Var::new(SESSION_KEY_VAR, key));
    }

    pub fn cipher_key(&self) -> Option<&[u8]> {
        self.vars.get_value(SESSION_KEY_VAR)
    }

    /// Give the session a fresh id and announce it with a cookie.
    /// Id is the MD5 hex of time, pid and randomness.
    pub fn ensure_id(&mut self) -> Result<(), SessionError> {
        if !self.id.is_empty() {
            return Ok(());
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seed = format!(
            "{}{}{}{}",
            now.as_secs(),
            std::process::id(),
            now.subsec_micros(),
            rand::random::<u64>()
        );
        let digest = Md5::digest(seed.as_bytes());
        self.id = ember_core::encoding::hex_encode(&digest);

        // announce the new id; exactly one cookie field carries it
        self.rs.borrow_mut().header_mut().add(cookie_field(
            &self.opts.name,
            Some(&self.id),
            None,
            None,
            None,
            false,
        ));
        Ok(())
    }

    /// The key this session is stored under (file name, atom id).
    fn storage_key(&self) -> String {
        format!("klone_sess_{}_{}", self.id, self.addr)
    }

    fn load(&mut self) -> Result<(), SessionError> {
        match self.opts.kind {
            SessionKind::File => file::load(self),
            SessionKind::Memory => mem::load(self),
            SessionKind::Client => client::load(self),
        }
    }

    /// Persist the session. With no variables this is a no-op for a
    /// fresh session and a removal for an existing one; otherwise a
    /// missing id is generated (setting the cookie) before the backend
    /// write.
    pub fn save(&mut self) -> Result<(), SessionError> {
        if self.vars.is_empty() {
            if self.id.is_empty() {
                return Ok(());
            }
            return self.remove();
        }
        self.ensure_id()?;
        match self.opts.kind {
            SessionKind::File => file::save(self),
            SessionKind::Memory => mem::save(self),
            SessionKind::Client => client::save(self),
        }
    }

    /// Forget the session on both ends: clear the cookie and drop the
    /// stored copy.
    pub fn remove(&mut self) -> Result<(), SessionError> {
        self.rs
            .borrow_mut()
            .header_mut()
            .add(cookie_field(&self.opts.name, None, None, None, None, false));
        self.removed = true;
        match self.opts.kind {
            SessionKind::File => file::remove(self),
            SessionKind::Memory => mem::remove(self),
            SessionKind::Client => client::remove(self),
        }
    }

    /// Serialise the variables as url-encoded `name=value` lines,
    /// optionally deflated and encrypted, into a buffer.
    fn save_to_buf(&self) -> Result<Vec<u8>, SessionError> {
        let out = Stream::mem();
        self.save_to_io(&out)?;
        out.flush()?;
        Ok(out.mem_contents().unwrap_or_default())
    }

    fn save_to_io(&self, out: &Stream) -> Result<(), SessionError> {
        if self.opts.compress {
            out.codec_add_tail(Box::new(GzipCodec::compress()));
        }
        if self.opts.encrypt {
            let iv = *self.opts.cipher_iv.borrow();
            out.codec_add_tail(Box::new(CipherCodec::encrypt(&self.opts.cipher_key, Some(&iv))?));
        }

        let r = self.write_vars(out);
        // tear the codecs down even on failure, they hold buffered data
        out.codecs_remove()?;
        r
    }

    fn write_vars(&self, out: &Stream) -> Result<(), SessionError> {
        for v in self.vars.iter() {
            let line = if v.name() == SESSION_KEY_VAR {
                // the resource key is never stored in the clear
                let enc = encrypt_once(&self.opts.session_key, &self.opts.session_iv, v.value())?;
                Var::new(SESSION_KEY_VAR, enc).to_urlvar()
            } else {
                v.to_urlvar()
            };
            out.write(line.as_bytes())?;
            out.write(b"\n")?;
        }
        Ok(())
    }

    fn load_from_buf(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let io = Stream::from_vec(data.to_vec());
        self.load_from_io(&io)
    }

    fn load_from_io(&mut self, io: &Stream) -> Result<(), SessionError> {
        if self.opts.encrypt {
            let iv = *self.opts.cipher_iv.borrow();
            io.codec_add_tail(Box::new(CipherCodec::decrypt(&self.opts.cipher_key, Some(&iv))?));
        }
        if self.opts.compress {
            io.codec_add_tail(Box::new(GzipCodec::decompress()));
        }

        self.vars.clear();
        while let Some(line) = io.gets(8 * 1024)? {
            let line = line.trim_end_matches('\n');
            if line.is_empty() {
                continue;
            }
            if let Some(v) = self.vars.add_urlvar(line) {
                if v.name() == SESSION_KEY_VAR {
                    let enc = v.value().to_vec();
                    match decrypt_once(&self.opts.session_key, &self.opts.session_iv, &enc) {
                        Ok(plain) => {
                            if let Some(v) = self.vars.get_mut(SESSION_KEY_VAR) {
                                v.set_value(plain);
                            }
                        }
                        Err(_) => {
                            // key written by another process incarnation
                            self.vars.del(SESSION_KEY_VAR);
                        }
                    }
                }
            }
        }
        io.codecs_remove()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use crate::response::Response;
    use ember_io::Stream;

    fn opts(kind: SessionKind, dir: &std::path::Path) -> Rc<SessionOpts> {
        let mut so = SessionOpts::from_config(None).unwrap();
        so.kind = kind;
        so.path = dir.to_path_buf();
        if kind == SessionKind::Client {
            so.encrypt = true;
        }
        Rc::new(so)
    }

    fn request_with_cookies(cookies: &[(String, String)]) -> Request {
        let mut text = b"GET / HTTP/1.0\r\n".to_vec();
        for (n, v) in cookies {
            text.extend_from_slice(format!("Cookie: {n}={v}\r\n").as_bytes());
        }
        text.extend_from_slice(b"\r\n");
        let mut rq = Request::new();
        rq.bind(Stream::from_vec(text));
        rq.parse_header(None).unwrap();
        rq.set_local_addr("127.0.0.1:8080");
        rq
    }

    fn sid_cookies_of(rs: &Response) -> Vec<(String, String)> {
        let body = rs.body();
        let body = body.borrow();
        body.header()
            .iter()
            .filter(|f| f.name() == "Set-Cookie")
            .filter_map(|f| {
                let (n, v) = f.value().split_once('=')?;
                let v = v.split(';').next().unwrap_or("");
                Some((n.to_owned(), v.to_owned()))
            })
            .collect()
    }

    #[test]
    fn test_save_with_no_vars_and_no_id_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let so = opts(SessionKind::File, dir.path());
        let rq = request_with_cookies(&[]);
        let rs = Response::new(Stream::mem(), false);
        let ss = Session::create(so, &rq, rs.body()).unwrap();
        ss.borrow_mut().save().unwrap();
        assert!(sid_cookies_of(&rs).is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_file_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let so = opts(SessionKind::File, dir.path());

        // first request: save a variable, receive the session cookie
        let rq = request_with_cookies(&[]);
        let rs = Response::new(Stream::mem(), false);
        let ss = Session::create(Rc::clone(&so), &rq, rs.body()).unwrap();
        ss.borrow_mut().set("user", "alice");
        ss.borrow_mut().save().unwrap();
        let id = ss.borrow().id().to_owned();
        assert_eq!(id.len(), SESSION_ID_LENGTH);
        let cookies = sid_cookies_of(&rs);
        assert_eq!(cookies.last().unwrap().1, id);
        // the session cookie is announced exactly once
        assert_eq!(cookies.iter().filter(|(n, _)| n == "klone_sid").count(), 1);

        // second request: replay the cookie, find the variable
        let rq = request_with_cookies(&[("klone_sid".into(), id.clone())]);
        let rs = Response::new(Stream::mem(), false);
        let ss = Session::create(so, &rq, rs.body()).unwrap();
        assert_eq!(ss.borrow().get("user").unwrap(), "alice");
    }

    #[test]
    fn test_file_session_compressed_encrypted_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut base = SessionOpts::from_config(None).unwrap();
        base.kind = SessionKind::File;
        base.path = dir.path().to_path_buf();
        base.compress = true;
        base.encrypt = true;
        let so = Rc::new(base);

        let rq = request_with_cookies(&[]);
        let rs = Response::new(Stream::mem(), false);
        let ss = Session::create(Rc::clone(&so), &rq, rs.body()).unwrap();
        ss.borrow_mut().set("k", "v");
        ss.borrow_mut().set("long", &"x".repeat(5000));
        ss.borrow_mut().save().unwrap();
        let id = ss.borrow().id().to_owned();

        let rq = request_with_cookies(&[("klone_sid".into(), id)]);
        let rs = Response::new(Stream::mem(), false);
        let ss = Session::create(so, &rq, rs.body()).unwrap();
        assert_eq!(ss.borrow().get("k").unwrap(), "v");
        assert_eq!(ss.borrow().get("long").unwrap().len(), 5000);
    }

    #[test]
    fn test_expired_session_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let mut base = SessionOpts::from_config(None).unwrap();
        base.kind = SessionKind::File;
        base.path = dir.path().to_path_buf();
        base.max_age = 60;
        let so = Rc::new(base);

        let rq = request_with_cookies(&[]);
        let rs = Response::new(Stream::mem(), false);
        let ss = Session::create(Rc::clone(&so), &rq, rs.body()).unwrap();
        ss.borrow_mut().set("user", "bob");
        ss.borrow_mut().save().unwrap();
        let id = ss.borrow().id().to_owned();

        // age the file far past max_age
        let path = dir.path().join(format!("klone_sess_{id}_127.0.0.1:8080"));
        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_times(std::fs::FileTimes::new().set_modified(old)).unwrap();

        let rq = request_with_cookies(&[("klone_sid".into(), id)]);
        let rs = Response::new(Stream::mem(), false);
        let ss = Session::create(so, &rq, rs.body()).unwrap();
        assert!(ss.borrow().get("user").is_none());
        assert!(ss.borrow().is_removed());
        assert!(!path.exists());
    }

    #[test]
    fn test_memory_session_round_trip_local() {
        let dir = tempfile::tempdir().unwrap();
        let so = opts(SessionKind::Memory, dir.path());

        let rq = request_with_cookies(&[]);
        let rs = Response::new(Stream::mem(), false);
        let ss = Session::create(Rc::clone(&so), &rq, rs.body()).unwrap();
        ss.borrow_mut().set("n", "1");
        ss.borrow_mut().save().unwrap();
        let id = ss.borrow().id().to_owned();
        assert_eq!(so.atoms().borrow().count(), 1);

        let rq = request_with_cookies(&[("klone_sid".into(), id)]);
        let rs = Response::new(Stream::mem(), false);
        let ss = Session::create(so, &rq, rs.body()).unwrap();
        assert_eq!(ss.borrow().get("n").unwrap(), "1");
    }

    #[test]
    fn test_cipher_key_round_trips_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let so = opts(SessionKind::File, dir.path());

        let rq = request_with_cookies(&[]);
        let rs = Response::new(Stream::mem(), false);
        let ss = Session::create(Rc::clone(&so), &rq, rs.body()).unwrap();
        let key = [0xaau8; 32];
        ss.borrow_mut().set_cipher_key(&key);
        ss.borrow_mut().save().unwrap();
        let id = ss.borrow().id().to_owned();

        // the stored line must not contain the key bytes in the clear
        let path = dir.path().join(format!("klone_sess_{id}_127.0.0.1:8080"));
        let stored = std::fs::read(&path).unwrap();
        let key_hex = ember_core::encoding::url_encode(&key);
        assert!(!String::from_utf8_lossy(&stored).contains(&key_hex));

        let rq = request_with_cookies(&[("klone_sid".into(), id)]);
        let rs = Response::new(Stream::mem(), false);
        let ss = Session::create(so, &rq, rs.body()).unwrap();
        assert_eq!(ss.borrow().cipher_key().unwrap(), key);
    }

    #[test]
    fn test_client_session_round_trip_and_tamper() {
        let dir = tempfile::tempdir().unwrap();
        let so = opts(SessionKind::Client, dir.path());

        let rq = request_with_cookies(&[]);
        let rs = Response::new(Stream::mem(), false);
        let ss = Session::create(Rc::clone(&so), &rq, rs.body()).unwrap();
        ss.borrow_mut().set("user", "alice");
        ss.borrow_mut().save().unwrap();

        let cookies = sid_cookies_of(&rs);
        let get = |n: &str| {
            cookies
                .iter()
                .rev()
                .find(|(cn, _)| cn == n)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        for n in ["KL1_CLISES_DATA", "KL1_CLISES_MTIME", "KL1_CLISES_IV", "KL1_CLISES_HMAC"] {
            assert!(cookies.iter().any(|(cn, _)| cn == n), "missing {n}");
        }

        // replay all four cookies: the session loads
        let sid = ss.borrow().id().to_owned();
        let replay = vec![
            ("klone_sid".to_string(), sid.clone()),
            ("KL1_CLISES_DATA".to_string(), get("KL1_CLISES_DATA")),
            ("KL1_CLISES_MTIME".to_string(), get("KL1_CLISES_MTIME")),
            ("KL1_CLISES_IV".to_string(), get("KL1_CLISES_IV")),
            ("KL1_CLISES_HMAC".to_string(), get("KL1_CLISES_HMAC")),
        ];
        let rq = request_with_cookies(&replay);
        let rs = Response::new(Stream::mem(), false);
        let ss2 = Session::create(Rc::clone(&so), &rq, rs.body()).unwrap();
        assert_eq!(ss2.borrow().get("user").unwrap(), "alice");

        // flip one nibble of the payload: the HMAC check must reject it
        // and every client cookie must be cleared
        let mut tampered = replay.clone();
        let data = &mut tampered[1].1;
        let flipped = if data.as_bytes()[0] == b'0' { "1" } else { "0" };
        data.replace_range(0..1, flipped);

        let rq = request_with_cookies(&tampered);
        let rs = Response::new(Stream::mem(), false);
        let ss3 = Session::create(so, &rq, rs.body()).unwrap();
        assert!(ss3.borrow().get("user").is_none());
        assert!(ss3.borrow().is_removed());
        let cleared = sid_cookies_of(&rs);
        for n in ["KL1_CLISES_DATA", "KL1_CLISES_MTIME", "KL1_CLISES_IV", "KL1_CLISES_HMAC"] {
            assert!(
                cleared.iter().any(|(cn, v)| cn == n && v.is_empty()),
                "cookie {n} not cleared"
            );
        }
    }

    #[test]
    fn test_save_to_buf_load_from_buf_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let so = opts(SessionKind::File, dir.path());
        let rq = request_with_cookies(&[]);
        let rs = Response::new(Stream::mem(), false);
        let ss = Session::create(so, &rq, rs.body()).unwrap();
        {
            let mut s = ss.borrow_mut();
            s.set("a", "1");
            s.set("weird name", "va&l=ue");
            s.set("empty", "");
        }
        let buf = ss.borrow().save_to_buf().unwrap();
        let mut s = ss.borrow_mut();
        s.vars.clear();
        s.load_from_buf(&buf).unwrap();
        assert_eq!(s.get("a").unwrap(), "1");
        assert_eq!(s.get("weird name").unwrap(), "va&l=ue");
        assert_eq!(s.get("empty").unwrap(), "");
    }
}
