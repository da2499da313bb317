//! Parent procedure calls: the framed, typed message channel between a
//! worker process and the listening parent, carried over one half of a
//! `socketpair(2)`.
//!
//! Wire format is a 5-byte header — command byte plus little-endian
//! `u32` payload size — followed by the payload, a JSON-encoded
//! [`PpcMessage`]. Frames above [`PPC_MAX_DATA_SIZE`] are a protocol
//! violation and poison the channel.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::PpcError;

/// Upper bound for a frame payload.
pub const PPC_MAX_DATA_SIZE: usize = 8 * 1024;

/// Command codes as they travel on the wire.
pub mod cmd {
    pub const NOP: u8 = 0x10;
    pub const LOG_ADD: u8 = 0x11;
    pub const LOG_GET: u8 = 0x12;
    pub const ACCESS_LOG: u8 = 0x13;
    pub const FORK_CHILD: u8 = 0x14;
    pub const MSES_SAVE: u8 = 0x20;
    pub const MSES_GET: u8 = 0x21;
    pub const MSES_DELOLD: u8 = 0x22;
    pub const MSES_REMOVE: u8 = 0x23;
    pub const RESPONSE_OK: u8 = 0x30;
    pub const RESPONSE_ERROR: u8 = 0x31;
}

/// Typed payloads; each maps to exactly one command byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PpcMessage {
    Nop,
    /// Worker → parent: append a line to the server/backend log.
    LogAdd { bid: i32, level: u8, line: String },
    /// Worker → parent: fetch the nth memory-log line (synchronous).
    LogGet { bid: i32, index: i64 },
    /// Parent → worker: reply to `LogGet`; `index` is −1 on EOF/error.
    LogGetReply { index: i64, line: String },
    /// Worker → parent: append an access-log line for a vhost.
    AccessLog { bid: i32, vhost: usize, line: String },
    /// Worker → parent: spawn another worker for this backend.
    ForkChild { bid: i32 },
    /// Worker → parent: store a memory session.
    MsesSave { id: String, mtime: u64, data: Vec<u8> },
    /// Worker → parent: fetch a memory session (synchronous).
    MsesGet { id: String },
    /// Parent → worker: reply to `MsesGet`.
    MsesReply { found: bool, mtime: u64, data: Vec<u8> },
    /// Worker → parent: evict the oldest memory session.
    MsesDelOld,
    /// Worker → parent: drop a memory session.
    MsesRemove { id: String },
    /// Generic acknowledgements.
    Ok,
    Error,
}

impl PpcMessage {
    pub fn cmd(&self) -> u8 {
        match self {
            PpcMessage::Nop => cmd::NOP,
            PpcMessage::LogAdd { .. } => cmd::LOG_ADD,
            PpcMessage::LogGet { .. } => cmd::LOG_GET,
            PpcMessage::LogGetReply { .. } => cmd::LOG_GET,
            PpcMessage::AccessLog { .. } => cmd::ACCESS_LOG,
            PpcMessage::ForkChild { .. } => cmd::FORK_CHILD,
            PpcMessage::MsesSave { .. } => cmd::MSES_SAVE,
            PpcMessage::MsesGet { .. } => cmd::MSES_GET,
            PpcMessage::MsesReply { .. } => cmd::MSES_GET,
            PpcMessage::MsesDelOld => cmd::MSES_DELOLD,
            PpcMessage::MsesRemove { .. } => cmd::MSES_REMOVE,
            PpcMessage::Ok => cmd::RESPONSE_OK,
            PpcMessage::Error => cmd::RESPONSE_ERROR,
        }
    }
}

/// Encode one frame; used both by the channel and by the alarm wheel,
/// which must prepare its frame before the signal handler runs.
pub fn encode_frame(msg: &PpcMessage) -> Result<Vec<u8>, PpcError> {
    let payload = serde_json::to_vec(msg).map_err(|e| PpcError::BadPayload {
        cmd: msg.cmd(),
        reason: e.to_string(),
    })?;
    if payload.len() > PPC_MAX_DATA_SIZE {
        return Err(PpcError::Oversize(payload.len()));
    }
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(msg.cmd());
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, payload.len() as u32);
    frame.extend_from_slice(&len);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// One endpoint of a PPC channel.
pub struct PpcChannel {
    stream: UnixStream,
}

impl PpcChannel {
    pub fn new(stream: UnixStream) -> PpcChannel {
        PpcChannel { stream }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Blocking send of one message.
    pub fn send(&mut self, msg: &PpcMessage) -> Result<(), PpcError> {
        let frame = encode_frame(msg)?;
        write_all_eintr(&mut self.stream, &frame)
    }

    /// Blocking receive of one message. `Err(Closed)` means the peer went
    /// away.
    pub fn recv(&mut self) -> Result<(u8, PpcMessage), PpcError> {
        let mut head = [0u8; 5];
        read_exact_eintr(&mut self.stream, &mut head)?;
        let cmd = head[0];
        let size = LittleEndian::read_u32(&head[1..5]) as usize;
        if size > PPC_MAX_DATA_SIZE {
            return Err(PpcError::Oversize(size));
        }
        let mut payload = vec![0u8; size];
        read_exact_eintr(&mut self.stream, &mut payload)?;
        let msg = serde_json::from_slice(&payload).map_err(|e| PpcError::BadPayload {
            cmd,
            reason: e.to_string(),
        })?;
        Ok((cmd, msg))
    }

    /// Send and wait for the reply; used by the two synchronous calls
    /// (`LogGet`, `MsesGet`).
    pub fn call(&mut self, msg: &PpcMessage) -> Result<PpcMessage, PpcError> {
        self.send(msg)?;
        let (_, reply) = self.recv()?;
        Ok(reply)
    }
}

fn write_all_eintr<W: Write>(w: &mut W, mut buf: &[u8]) -> Result<(), PpcError> {
    while !buf.is_empty() {
        match w.write(buf) {
            Ok(0) => return Err(PpcError::Closed),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PpcError::Io(e)),
        }
    }
    Ok(())
}

fn read_exact_eintr<R: Read>(r: &mut R, mut buf: &mut [u8]) -> Result<(), PpcError> {
    while !buf.is_empty() {
        match r.read(buf) {
            Ok(0) => return Err(PpcError::Closed),
            Ok(n) => buf = &mut buf[n..],
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PpcError::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (PpcChannel, PpcChannel) {
        let (a, b) = UnixStream::pair().unwrap();
        (PpcChannel::new(a), PpcChannel::new(b))
    }

    #[test]
    fn test_round_trip() {
        let (mut a, mut b) = pair();
        let msg = PpcMessage::LogAdd {
            bid: 3,
            level: 4,
            line: "disk on fire".into(),
        };
        a.send(&msg).unwrap();
        let (cmd, got) = b.recv().unwrap();
        assert_eq!(cmd, cmd::LOG_ADD);
        assert_eq!(got, msg);
    }

    #[test]
    fn test_peer_close_is_detected() {
        let (a, mut b) = pair();
        drop(a);
        assert!(matches!(b.recv(), Err(PpcError::Closed)));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let (mut a, mut b) = pair();
        // hand-craft a frame with a bogus size field
        let mut frame = vec![cmd::NOP];
        frame.extend_from_slice(&(PPC_MAX_DATA_SIZE as u32 + 1).to_le_bytes());
        use std::io::Write as _;
        a.stream.write_all(&frame).unwrap();
        assert!(matches!(b.recv(), Err(PpcError::Oversize(_))));
    }

    #[test]
    fn test_synchronous_call() {
        let (mut a, mut b) = pair();
        let t = std::thread::spawn(move || {
            let (_, msg) = b.recv().unwrap();
            assert!(matches!(msg, PpcMessage::MsesGet { .. }));
            b.send(&PpcMessage::MsesReply {
                found: true,
                mtime: 7,
                data: vec![1, 2, 3],
            })
            .unwrap();
        });
        let reply = a
            .call(&PpcMessage::MsesGet { id: "abc".into() })
            .unwrap();
        t.join().unwrap();
        assert_eq!(
            reply,
            PpcMessage::MsesReply {
                found: true,
                mtime: 7,
                data: vec![1, 2, 3]
            }
        );
    }
}
