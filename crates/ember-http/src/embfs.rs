//! The embedded filesystem: resources compiled into the server binary,
//! registered at startup and looked up by exact path.
//!
//! Files carry their stored form — possibly deflated, possibly
//! encrypted — next to the original size and modification time. Pages
//! are native handler functions.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::dynpage::PageFn;

pub struct EmbFile {
    pub path: String,
    /// Stored bytes, after compression/encryption if any.
    pub data: Cow<'static, [u8]>,
    pub mime_type: String,
    /// Unix mtime of the original file; what conditional GET compares.
    pub mtime: u64,
    /// Size of the original, uncompressed content.
    pub file_size: u64,
    pub compressed: bool,
    pub encrypted: bool,
}

pub struct EmbPage {
    pub path: String,
    pub fun: PageFn,
}

pub enum EmbRes {
    File(EmbFile),
    Page(EmbPage),
}

impl EmbRes {
    pub fn path(&self) -> &str {
        match self {
            EmbRes::File(f) => &f.path,
            EmbRes::Page(p) => &p.path,
        }
    }
}

/// The registry. Populated once at startup by the generated
/// registration code; read-only afterwards.
#[derive(Default)]
pub struct EmbFs {
    map: HashMap<String, EmbRes>,
}

impl EmbFs {
    pub fn new() -> EmbFs {
        EmbFs::default()
    }

    pub fn register(&mut self, res: EmbRes) {
        tracing::debug!(path = res.path(), "registering embedded resource");
        self.map.insert(res.path().to_owned(), res);
    }

    /// Register a plain static file stored verbatim.
    pub fn register_file(&mut self, path: &str, data: impl Into<Cow<'static, [u8]>>, mtime: u64) {
        let data = data.into();
        self.register(EmbRes::File(EmbFile {
            path: path.to_owned(),
            mime_type: ember_core::mime::guess_mime_type(path).to_owned(),
            mtime,
            file_size: data.len() as u64,
            compressed: false,
            encrypted: false,
            data,
        }));
    }

    pub fn register_page(&mut self, path: &str, fun: PageFn) {
        self.register(EmbRes::Page(EmbPage {
            path: path.to_owned(),
            fun,
        }));
    }

    pub fn lookup(&self, path: &str) -> Option<&EmbRes> {
        self.map.get(path)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
