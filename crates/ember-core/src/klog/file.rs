use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::PathBuf;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::Local;

use super::Level;
use crate::error::KlogError;

pub(super) const DEFAULT_PAGES: usize = 4;
pub(super) const DEFAULT_LINES_PER_PAGE: usize = 250;

const HEAD_MAGIC: u32 = 0x454d_4c31; // "EML1"

/// A file log is a circular set of pages named `<basename>.<page_id>`,
/// each holding a fixed number of lines. The write position survives
/// restarts through the `<basename>.head` sidecar; a sidecar whose
/// geometry disagrees with the configuration is discarded and the log
/// restarts from page zero.
pub struct FileSink {
    basename: String,
    npages: usize,
    nlines: usize,
    wpageid: usize,
    offset: usize,
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn open(basename: &str, npages: usize, nlines: usize) -> Result<FileSink, KlogError> {
        let npages = npages.max(2);
        let nlines = nlines.max(1);

        let (wpageid, offset) = match Self::load_head(basename) {
            Some((np, nl, pid, off)) if np == npages && nl == nlines => (pid, off),
            _ => (0, 0),
        };

        let writer = BufWriter::new(Self::open_page(basename, wpageid, offset != 0)?);

        Ok(FileSink {
            basename: basename.to_owned(),
            npages,
            nlines,
            wpageid,
            offset,
            writer,
        })
    }

    fn page_path(basename: &str, id: usize) -> PathBuf {
        PathBuf::from(format!("{basename}.{id}"))
    }

    fn head_path(basename: &str) -> PathBuf {
        PathBuf::from(format!("{basename}.head"))
    }

    fn open_page(basename: &str, id: usize, append: bool) -> Result<File, KlogError> {
        let f = OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(Self::page_path(basename, id))?;
        Ok(f)
    }

    fn load_head(basename: &str) -> Option<(usize, usize, usize, usize)> {
        let mut f = File::open(Self::head_path(basename)).ok()?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).ok()?;
        let mut cur = &buf[..];
        if cur.read_u32::<LittleEndian>().ok()? != HEAD_MAGIC {
            return None;
        }
        let npages = cur.read_u32::<LittleEndian>().ok()? as usize;
        let nlines = cur.read_u32::<LittleEndian>().ok()? as usize;
        let wpageid = cur.read_u32::<LittleEndian>().ok()? as usize;
        let offset = cur.read_u32::<LittleEndian>().ok()? as usize;
        if wpageid >= npages || offset > nlines {
            return None;
        }
        Some((npages, nlines, wpageid, offset))
    }

    /// Persist the write position so the next run continues where this
    /// one stopped.
    pub fn dump_head(&mut self) -> Result<(), KlogError> {
        self.writer.flush()?;
        let mut buf = Vec::with_capacity(20);
        buf.write_u32::<LittleEndian>(HEAD_MAGIC)?;
        buf.write_u32::<LittleEndian>(self.npages as u32)?;
        buf.write_u32::<LittleEndian>(self.nlines as u32)?;
        buf.write_u32::<LittleEndian>(self.wpageid as u32)?;
        buf.write_u32::<LittleEndian>(self.offset as u32)?;
        std::fs::write(Self::head_path(&self.basename), &buf)?;
        Ok(())
    }

    pub fn append(&mut self, ident: &str, level: Level, msg: &str) -> Result<(), KlogError> {
        if self.offset >= self.nlines {
            self.shift_page()?;
        }
        let stamp = Local::now().format("%a %b %e %H:%M:%S %Y");
        writeln!(self.writer, "[{}] {stamp} <{ident}>: {msg}", level.as_str())?;
        self.offset += 1;
        self.writer.flush()?;
        Ok(())
    }

    fn shift_page(&mut self) -> Result<(), KlogError> {
        self.writer.flush()?;
        self.wpageid = (self.wpageid + 1) % self.npages;
        self.offset = 0;
        self.writer = BufWriter::new(Self::open_page(&self.basename, self.wpageid, false)?);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), KlogError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(dir: &tempfile::TempDir) -> String {
        dir.path().join("srv.log").to_string_lossy().into_owned()
    }

    fn page_count(dir: &tempfile::TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[test]
    fn test_rotation_stays_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = FileSink::open(&base(&dir), 3, 2).unwrap();
        for i in 0..20 {
            s.append("t", Level::Info, &format!("line {i}")).unwrap();
        }
        s.dump_head().unwrap();
        // at most npages pages plus the .head sidecar
        assert!(page_count(&dir) <= 4);
    }

    #[test]
    fn test_head_restores_position() {
        let dir = tempfile::tempdir().unwrap();
        let b = base(&dir);
        {
            let mut s = FileSink::open(&b, 3, 10).unwrap();
            s.append("t", Level::Info, "one").unwrap();
            s.append("t", Level::Info, "two").unwrap();
            s.dump_head().unwrap();
        }
        let s = FileSink::open(&b, 3, 10).unwrap();
        assert_eq!(s.wpageid, 0);
        assert_eq!(s.offset, 2);
    }

    #[test]
    fn test_geometry_change_resets() {
        let dir = tempfile::tempdir().unwrap();
        let b = base(&dir);
        {
            let mut s = FileSink::open(&b, 3, 10).unwrap();
            for _ in 0..15 {
                s.append("t", Level::Info, "x").unwrap();
            }
            s.dump_head().unwrap();
        }
        let s = FileSink::open(&b, 4, 10).unwrap();
        assert_eq!(s.wpageid, 0);
        assert_eq!(s.offset, 0);
    }
}
