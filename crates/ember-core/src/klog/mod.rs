//! Server log sinks.
//!
//! Three sinks share one front door: an in-memory bounded ring (retrievable
//! newest-first, used by admin pages), a rotating set of fixed-size files
//! with a `.head` sidecar that survives restarts, and syslog. Which one a
//! server or backend uses comes from its `log { ... }` config subtree.

mod file;
mod mem;
mod syslog;

pub use file::FileSink;
pub use mem::MemSink;
pub use syslog::SyslogSink;

use crate::config::Config;
use crate::error::KlogError;

/// Log severities, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Notice,
    Warning,
    Err,
    Crit,
    Alert,
    Emerg,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "dbg",
            Level::Info => "inf",
            Level::Notice => "ntc",
            Level::Warning => "wrn",
            Level::Err => "err",
            Level::Crit => "crt",
            Level::Alert => "alr",
            Level::Emerg => "emg",
        }
    }

    pub fn from_str(s: &str) -> Option<Level> {
        Some(match s.to_ascii_lowercase().as_str() {
            "debug" | "dbg" => Level::Debug,
            "info" | "inf" => Level::Info,
            "notice" | "ntc" => Level::Notice,
            "warning" | "warn" | "wrn" => Level::Warning,
            "err" | "error" => Level::Err,
            "crit" | "crt" => Level::Crit,
            "alert" | "alr" => Level::Alert,
            "emerg" | "emg" => Level::Emerg,
            _ => return None,
        })
    }

    /// Severity as encoded on a PPC log frame.
    pub fn from_u8(v: u8) -> Level {
        match v {
            0 => Level::Debug,
            1 => Level::Info,
            2 => Level::Notice,
            3 => Level::Warning,
            4 => Level::Err,
            5 => Level::Crit,
            6 => Level::Alert,
            _ => Level::Emerg,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Level::Debug => 0,
            Level::Info => 1,
            Level::Notice => 2,
            Level::Warning => 3,
            Level::Err => 4,
            Level::Crit => 5,
            Level::Alert => 6,
            Level::Emerg => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Mem,
    File,
    Syslog,
}

enum Sink {
    Mem(MemSink),
    File(FileSink),
    Syslog(SyslogSink),
}

/// A configured log device.
pub struct Klog {
    ident: String,
    threshold: Level,
    sink: Sink,
}

impl Klog {
    /// Build a log device from a `log { type ...; ... }` config subtree.
    pub fn open_from_config(cfg: &Config) -> Result<Klog, KlogError> {
        let ident = cfg.subkey_value("ident").unwrap_or("ember").to_owned();
        let threshold = match cfg.subkey_value("threshold") {
            Some(t) => {
                Level::from_str(t).ok_or_else(|| KlogError::BadConfig(format!("bad threshold '{t}'")))?
            }
            None => Level::Debug,
        };

        let sink = match cfg.subkey_value("type") {
            Some("memory") => {
                let limit = cfg
                    .subkey_value("memory.limit")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(mem::DEFAULT_LINE_LIMIT);
                Sink::Mem(MemSink::new(limit))
            }
            Some("file") => {
                let base = cfg
                    .subkey_value("file.basename")
                    .ok_or_else(|| KlogError::BadConfig("file.basename is mandatory".into()))?;
                let splits = cfg
                    .subkey_value("file.splits")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(file::DEFAULT_PAGES);
                let limit = cfg
                    .subkey_value("file.limit")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(file::DEFAULT_LINES_PER_PAGE);
                Sink::File(FileSink::open(base, splits, limit)?)
            }
            Some("syslog") => {
                let facility = syslog::facility(cfg.subkey_value("syslog.facility"));
                Sink::Syslog(SyslogSink::open(facility)?)
            }
            Some(other) => return Err(KlogError::BadConfig(format!("unknown log type '{other}'"))),
            None => return Err(KlogError::BadConfig("missing log type".into())),
        };

        Ok(Klog { ident, threshold, sink })
    }

    pub fn open_mem(ident: &str, limit: usize) -> Klog {
        Klog {
            ident: ident.to_owned(),
            threshold: Level::Debug,
            sink: Sink::Mem(MemSink::new(limit)),
        }
    }

    pub fn open_file(ident: &str, base: &str, pages: usize, lines: usize) -> Result<Klog, KlogError> {
        Ok(Klog {
            ident: ident.to_owned(),
            threshold: Level::Debug,
            sink: Sink::File(FileSink::open(base, pages, lines)?),
        })
    }

    pub fn kind(&self) -> SinkKind {
        match self.sink {
            Sink::Mem(_) => SinkKind::Mem,
            Sink::File(_) => SinkKind::File,
            Sink::Syslog(_) => SinkKind::Syslog,
        }
    }

    /// Append a line; messages below the threshold are dropped.
    pub fn log(&mut self, level: Level, msg: &str) -> Result<(), KlogError> {
        if level < self.threshold {
            return Ok(());
        }
        match &mut self.sink {
            Sink::Mem(s) => s.append(level, msg),
            Sink::File(s) => s.append(&self.ident, level, msg),
            Sink::Syslog(s) => s.append(&self.ident, level, msg),
        }
    }

    /// The `nth` most recent line of a memory sink (0 = newest).
    pub fn get_line(&self, nth: usize) -> Result<Option<String>, KlogError> {
        match &self.sink {
            Sink::Mem(s) => Ok(s.get(nth)),
            _ => Err(KlogError::WrongSink("get_line")),
        }
    }

    pub fn count_lines(&self) -> Result<usize, KlogError> {
        match &self.sink {
            Sink::Mem(s) => Ok(s.len()),
            _ => Err(KlogError::WrongSink("count_lines")),
        }
    }

    pub fn clear(&mut self) -> Result<(), KlogError> {
        match &mut self.sink {
            Sink::Mem(s) => {
                s.clear();
                Ok(())
            }
            _ => Err(KlogError::WrongSink("clear")),
        }
    }

    /// Push buffered data to the device; meaningful for the file sink.
    pub fn flush(&mut self) -> Result<(), KlogError> {
        match &mut self.sink {
            Sink::File(s) => s.flush(),
            _ => Ok(()),
        }
    }
}

impl Drop for Klog {
    fn drop(&mut self) {
        if let Sink::File(s) = &mut self.sink {
            let _ = s.dump_head();
        }
    }
}
