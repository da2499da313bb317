use std::os::unix::net::UnixDatagram;
use std::process;

use super::Level;
use crate::error::KlogError;

const DEV_LOG: &str = "/dev/log";

/// RFC 3164 datagrams to the local syslog socket. Default facility is
/// LOG_LOCAL7, matching the usual daemon setup.
pub struct SyslogSink {
    sock: UnixDatagram,
    facility: u8,
}

pub(super) fn facility(name: Option<&str>) -> u8 {
    match name.map(|s| s.to_ascii_uppercase()).as_deref() {
        Some("LOG_LOCAL0") => 16,
        Some("LOG_LOCAL1") => 17,
        Some("LOG_LOCAL2") => 18,
        Some("LOG_LOCAL3") => 19,
        Some("LOG_LOCAL4") => 20,
        Some("LOG_LOCAL5") => 21,
        Some("LOG_LOCAL6") => 22,
        _ => 23, // LOG_LOCAL7
    }
}

fn severity(level: Level) -> u8 {
    match level {
        Level::Emerg => 0,
        Level::Alert => 1,
        Level::Crit => 2,
        Level::Err => 3,
        Level::Warning => 4,
        Level::Notice => 5,
        Level::Info => 6,
        Level::Debug => 7,
    }
}

impl SyslogSink {
    pub fn open(facility: u8) -> Result<SyslogSink, KlogError> {
        let sock = UnixDatagram::unbound()?;
        sock.connect(DEV_LOG)?;
        Ok(SyslogSink { sock, facility })
    }

    pub fn append(&mut self, ident: &str, level: Level, msg: &str) -> Result<(), KlogError> {
        let pri = (self.facility as u32) * 8 + severity(level) as u32;
        let line = format!("<{pri}>{ident}[{}]: {msg}", process::id());
        // a full or missing syslogd must not take the server down
        let _ = self.sock.send(line.as_bytes());
        Ok(())
    }
}
