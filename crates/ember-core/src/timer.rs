//! Process-local alarm wheel on top of `alarm(2)` / `SIGALRM`.
//!
//! One sorted list of pending alarms per process; the earliest expiry is
//! armed on the kernel timer. Alarms carry the pid that created them so a
//! forked child silently discards entries inherited from its parent.
//!
//! Actions are restricted to what is safe inside a signal handler:
//! closing a file descriptor (aborts a read blocked on the connection,
//! which is how the request timeouts work) and writing a pre-encoded
//! frame to a file descriptor (how a busy prefork worker asks the parent
//! for reinforcements mid-request).
//!
//! SIGALRM is blocked around every list mutation; when the mutation is
//! performed by the handler itself the blocking is skipped, since the
//! signal is already masked for the duration of the handler.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::error::TimerError;

/// What to do when an alarm fires.
#[derive(Debug, Clone)]
pub enum TimerAction {
    /// Close the fd, aborting any read or write blocked on it.
    CloseFd(RawFd),
    /// Write `frame` to `fd` and raise the process-wide notify flag
    /// (see [`take_notified`]).
    NotifyFd { fd: RawFd, frame: Arc<[u8]> },
}

/// Handle to a pending alarm; used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alarm(u64);

struct Entry {
    id: u64,
    expire: u64,
    owner: Pid,
    action: TimerAction,
}

#[derive(Default)]
struct Wheel {
    list: Vec<Entry>,
    next_id: u64,
}

static WHEEL: OnceLock<Mutex<Wheel>> = OnceLock::new();
static IN_HANDLER: AtomicBool = AtomicBool::new(false);
static NOTIFIED: AtomicBool = AtomicBool::new(false);

fn wheel() -> &'static Mutex<Wheel> {
    WHEEL.get_or_init(|| Mutex::new(Wheel::default()))
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn block_alarms() {
    if IN_HANDLER.load(Ordering::Relaxed) {
        return;
    }
    let mut set = SigSet::empty();
    set.add(Signal::SIGALRM);
    let _ = signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&set), None);
}

fn unblock_alarms() {
    if IN_HANDLER.load(Ordering::Relaxed) {
        return;
    }
    let mut set = SigSet::empty();
    set.add(Signal::SIGALRM);
    let _ = signal::sigprocmask(signal::SigmaskHow::SIG_UNBLOCK, Some(&set), None);
}

/// Arm the kernel timer for the earliest pending alarm. Caller holds the
/// wheel lock.
fn arm_next(w: &Wheel) {
    if let Some(first) = w.list.first() {
        let secs = first.expire.saturating_sub(now()).max(1);
        nix::unistd::alarm::set(secs as u32);
    }
}

extern "C" fn on_sigalrm(_sig: i32) {
    IN_HANDLER.store(true, Ordering::Relaxed);
    let me = Pid::this();
    let t = now();

    if let Ok(mut w) = wheel().lock() {
        loop {
            // inherited alarms are dropped, not fired
            while let Some(first) = w.list.first() {
                if first.owner != me {
                    w.list.remove(0);
                } else {
                    break;
                }
            }
            let Some(first) = w.list.first() else { break };
            if first.expire > t {
                break;
            }
            let entry = w.list.remove(0);
            match entry.action {
                TimerAction::CloseFd(fd) => {
                    let _ = nix::unistd::close(fd);
                }
                TimerAction::NotifyFd { fd, frame } => {
                    let mut off = 0;
                    while off < frame.len() {
                        match nix::unistd::write(fd, &frame[off..]) {
                            Ok(0) => break,
                            Ok(n) => off += n,
                            Err(nix::Error::EINTR) => continue,
                            Err(_) => break,
                        }
                    }
                    NOTIFIED.store(true, Ordering::Relaxed);
                }
            }
        }
        arm_next(&w);
    }

    IN_HANDLER.store(false, Ordering::Relaxed);
}

fn install_handler() -> Result<(), TimerError> {
    static INSTALLED: AtomicBool = AtomicBool::new(false);
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let sa = SigAction::new(
        SigHandler::Handler(on_sigalrm),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGALRM, &sa) }?;
    Ok(())
}

/// Schedule `action` to run in `secs` seconds.
pub fn add(secs: u32, action: TimerAction) -> Result<Alarm, TimerError> {
    install_handler()?;
    block_alarms();

    let alarm = {
        let mut w = wheel().lock().expect("timer wheel poisoned");
        let id = w.next_id;
        w.next_id += 1;
        let entry = Entry {
            id,
            expire: now() + u64::from(secs),
            owner: Pid::this(),
            action,
        };
        let pos = w
            .list
            .iter()
            .position(|e| entry.expire < e.expire)
            .unwrap_or(w.list.len());
        w.list.insert(pos, entry);
        arm_next(&w);
        Alarm(id)
    };

    unblock_alarms();
    Ok(alarm)
}

/// Cancel a pending alarm. Cancelling one that already fired is not an
/// error.
pub fn del(alarm: Alarm) {
    block_alarms();
    {
        let mut w = wheel().lock().expect("timer wheel poisoned");
        if let Some(pos) = w.list.iter().position(|e| e.id == alarm.0) {
            w.list.remove(pos);
        }
        arm_next(&w);
    }
    unblock_alarms();
}

/// True once after a [`TimerAction::NotifyFd`] alarm fired in this
/// process. The prefork worker checks this after each request to decide
/// whether to retire.
pub fn take_notified() -> bool {
    NOTIFIED.swap(false, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_and_cancel() {
        let a = add(1000, TimerAction::CloseFd(-1)).unwrap();
        let b = add(500, TimerAction::CloseFd(-1)).unwrap();
        {
            let w = wheel().lock().unwrap();
            assert!(w.list.len() >= 2);
            assert!(w.list.windows(2).all(|p| p[0].expire <= p[1].expire));
        }
        del(b);
        del(a);
        let w = wheel().lock().unwrap();
        assert!(w.list.iter().all(|e| e.id != a.0 && e.id != b.0));
    }
}
