//! Memory session backend.
//!
//! The authoritative copy of every session ("atom") lives in the
//! parent process; prefork workers reach it over PPC and keep a local
//! mirror only as a fast path for the other serving models, where the
//! process actually owns its copy.

use ember_core::ppc::PpcMessage;

use super::{Session, SessionError, now_secs};

struct Atom {
    id: String,
    data: Vec<u8>,
    mtime: u64,
}

/// The atom list with its two caps: entry count and total byte size.
/// Eviction drops the oldest atom, repeatedly, until both caps hold.
#[derive(Default)]
pub struct AtomStore {
    atoms: Vec<Atom>,
    total: usize,
}

impl AtomStore {
    pub fn new() -> AtomStore {
        AtomStore::default()
    }

    pub fn count(&self) -> usize {
        self.atoms.len()
    }

    pub fn total_size(&self) -> usize {
        self.total
    }

    pub fn get(&self, id: &str) -> Option<(u64, Vec<u8>)> {
        self.atoms
            .iter()
            .find(|a| a.id == id)
            .map(|a| (a.mtime, a.data.clone()))
    }

    pub fn remove(&mut self, id: &str) {
        if let Some(pos) = self.atoms.iter().position(|a| a.id == id) {
            let a = self.atoms.remove(pos);
            self.total -= a.data.len();
        }
    }

    /// Evict the atom with the smallest mtime.
    pub fn del_oldest(&mut self) {
        let Some(pos) = self
            .atoms
            .iter()
            .enumerate()
            .min_by_key(|(_, a)| a.mtime)
            .map(|(i, _)| i)
        else {
            return;
        };
        let a = self.atoms.remove(pos);
        self.total -= a.data.len();
    }

    /// Store (or replace) an atom, evicting old ones until both the
    /// count cap and the size cap are satisfied.
    pub fn save(
        &mut self,
        id: &str,
        mtime: u64,
        data: Vec<u8>,
        max_count: usize,
        mem_limit: usize,
    ) -> Result<(), SessionError> {
        if mem_limit > 0 && data.len() > mem_limit {
            return Err(SessionError::Other(
                "session is bigger than the memory limit, save aborted".into(),
            ));
        }

        let old_size = self
            .atoms
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.data.len());

        loop {
            let count = self.atoms.len() - usize::from(old_size.is_some());
            let size = self.total - old_size.unwrap_or(0) + data.len();
            let over_count = max_count > 0 && count >= max_count;
            let over_size = mem_limit > 0 && size > mem_limit && count > 0;
            if !over_count && !over_size {
                break;
            }
            self.del_oldest();
        }

        self.remove(id);
        self.total += data.len();
        self.atoms.push(Atom {
            id: id.to_owned(),
            data,
            mtime,
        });
        Ok(())
    }
}

pub(super) fn save(ss: &mut Session) -> Result<(), SessionError> {
    let key = ss.storage_key();
    let data = ss.save_to_buf()?;
    let mtime = now_secs();
    let worker = ss.opts.worker();

    if let (true, Some(link)) = (worker.prefork, worker.link.as_ref()) {
        link.borrow_mut().send(&PpcMessage::MsesSave {
            id: key.clone(),
            mtime,
            data: data.clone(),
        })?;
    }

    // the local copy serves iterative/fork models and doubles as a
    // read-only mirror under prefork
    ss.opts.atoms().borrow_mut().save(
        &key,
        mtime,
        data,
        ss.opts.max_count,
        ss.opts.mem_limit,
    )?;
    ss.mtime = mtime;
    Ok(())
}

pub(super) fn load(ss: &mut Session) -> Result<(), SessionError> {
    let key = ss.storage_key();
    let worker = ss.opts.worker();

    if let (true, Some(link)) = (worker.prefork, worker.link.as_ref()) {
        // the parent holds the fresh copy
        let reply = link.borrow_mut().call(&PpcMessage::MsesGet { id: key })?;
        return match reply {
            PpcMessage::MsesReply { found: true, mtime, data } => {
                ss.load_from_buf(&data)?;
                ss.mtime = mtime;
                Ok(())
            }
            _ => Err(SessionError::NotFound),
        };
    }

    let got = ss.opts.atoms().borrow().get(&key);
    match got {
        Some((mtime, data)) => {
            ss.load_from_buf(&data)?;
            ss.mtime = mtime;
            Ok(())
        }
        None => Err(SessionError::NotFound),
    }
}

pub(super) fn remove(ss: &Session) -> Result<(), SessionError> {
    let key = ss.storage_key();
    let worker = ss.opts.worker();
    if let (true, Some(link)) = (worker.prefork, worker.link.as_ref()) {
        link.borrow_mut().send(&PpcMessage::MsesRemove { id: key.clone() })?;
    }
    ss.opts.atoms().borrow_mut().remove(&key);
    Ok(())
}
