//! File session backend: one flat file per session under the
//! configured path, written whole on save. Concurrent workers touching
//! the same session are serialised with an advisory flock, released
//! when the file closes.

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Write as _};
use std::os::unix::io::AsRawFd;
use std::time::UNIX_EPOCH;

use nix::fcntl::{FlockArg, flock};

use super::{Session, SessionError};

fn path_of(ss: &Session) -> std::path::PathBuf {
    ss.opts.path.join(ss.storage_key())
}

pub(super) fn save(ss: &Session) -> Result<(), SessionError> {
    let path = path_of(ss);
    // rewritten from scratch every time
    let _ = std::fs::remove_file(&path);
    if ss.vars.is_empty() {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    flock(file.as_raw_fd(), FlockArg::LockExclusive)
        .map_err(|e| SessionError::Other(format!("flock: {e}")))?;

    let buf = ss.save_to_buf()?;
    file.write_all(&buf)?;
    Ok(())
}

pub(super) fn load(ss: &mut Session) -> Result<(), SessionError> {
    let path = path_of(ss);
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(SessionError::NotFound),
        Err(e) => return Err(e.into()),
    };
    let mtime = file
        .metadata()?
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    flock(file.as_raw_fd(), FlockArg::LockShared)
        .map_err(|e| SessionError::Other(format!("flock: {e}")))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    ss.load_from_buf(&data)?;
    ss.mtime = mtime;
    Ok(())
}

pub(super) fn remove(ss: &Session) -> Result<(), SessionError> {
    let _ = std::fs::remove_file(path_of(ss));
    Ok(())
}
