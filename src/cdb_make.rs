//! Write side of the constant database: records are streamed out as they
//! are added, then the 256 hash tables are appended and the header is
//! written last.

use std::fs::{self, File};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::cdb::{HEADER_LEN, hash};

#[derive(Debug, Error)]
pub enum MakeError {
    #[error("database write failed: {0}")]
    Io(#[from] io::Error),
    #[error("database would exceed 4 GiB")]
    TooBig,
}

struct Slot {
    hash: u32,
    pos: u32,
}

pub struct CdbMaker<W: Write + Seek> {
    out: BufWriter<W>,
    slots: Vec<Slot>,
    pos: u32,
}

impl<W: Write + Seek> CdbMaker<W> {
    pub fn start(mut inner: W) -> Result<Self, MakeError> {
        inner.seek(SeekFrom::Start(0))?;
        let mut out = BufWriter::new(inner);
        out.write_all(&[0u8; HEADER_LEN as usize])?;
        Ok(Self {
            out,
            slots: Vec::new(),
            pos: HEADER_LEN,
        })
    }

    pub fn add(&mut self, key: &[u8], data: &[u8]) -> Result<(), MakeError> {
        let klen = u32::try_from(key.len()).map_err(|_| MakeError::TooBig)?;
        let dlen = u32::try_from(data.len()).map_err(|_| MakeError::TooBig)?;
        let next = self
            .pos
            .checked_add(8)
            .and_then(|p| p.checked_add(klen))
            .and_then(|p| p.checked_add(dlen))
            .ok_or(MakeError::TooBig)?;

        self.out.write_all(&klen.to_le_bytes())?;
        self.out.write_all(&dlen.to_le_bytes())?;
        self.out.write_all(key)?;
        self.out.write_all(data)?;

        self.slots.push(Slot {
            hash: hash(key),
            pos: self.pos,
        });
        self.pos = next;
        Ok(())
    }

    /// Write the hash tables and header; returns the underlying writer.
    pub fn finish(mut self) -> Result<W, MakeError> {
        let mut by_table: Vec<Vec<&Slot>> = (0..256).map(|_| Vec::new()).collect();
        for slot in &self.slots {
            by_table[(slot.hash & 255) as usize].push(slot);
        }

        let mut header = [0u8; HEADER_LEN as usize];
        let mut table: Vec<(u32, u32)> = Vec::new();

        for (i, entries) in by_table.iter().enumerate() {
            let len = entries.len() * 2;
            let len32 = u32::try_from(len).map_err(|_| MakeError::TooBig)?;
            header[i * 8..i * 8 + 4].copy_from_slice(&self.pos.to_le_bytes());
            header[i * 8 + 4..i * 8 + 8].copy_from_slice(&len32.to_le_bytes());

            table.clear();
            table.resize(len, (0, 0));
            for slot in entries {
                let mut at = (slot.hash >> 8) as usize % len;
                while table[at].1 != 0 {
                    at = (at + 1) % len;
                }
                table[at] = (slot.hash, slot.pos);
            }

            for (h, p) in &table {
                self.out.write_all(&h.to_le_bytes())?;
                self.out.write_all(&p.to_le_bytes())?;
            }
            self.pos = len32
                .checked_mul(8)
                .and_then(|n| self.pos.checked_add(n))
                .ok_or(MakeError::TooBig)?;
        }

        self.out.seek(SeekFrom::Start(0))?;
        self.out.write_all(&header)?;
        self.out.flush()?;
        self.out.into_inner().map_err(|e| MakeError::Io(e.into_error()))
    }
}

/// Build a database at `path` by writing `<path>.tmp` and renaming it into
/// place, so readers see either the old file or the complete new one.
pub fn write_atomic<'a, I>(path: &Path, pairs: I) -> Result<(), MakeError>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut tmp = PathBuf::from(path);
    tmp.as_mut_os_string().push(".tmp");

    let mut maker = CdbMaker::start(File::create(&tmp)?)?;
    for (k, v) in pairs {
        maker.add(k, v)?;
    }
    let file = maker.finish()?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdb::Cdb;
    use std::io::Cursor;

    #[test]
    fn tables_are_half_full_and_header_points_at_them() {
        let maker = {
            let mut m = CdbMaker::start(Cursor::new(Vec::new())).unwrap();
            m.add(b"one", b"1").unwrap();
            m.add(b"two", b"22").unwrap();
            m
        };
        let bytes = maker.finish().unwrap().into_inner();

        let records_end = HEADER_LEN as usize + (8 + 3 + 1) + (8 + 3 + 2);
        // two entries, two slots each
        assert_eq!(bytes.len(), records_end + 2 * 2 * 8);

        let table = (hash(b"one") & 255) as usize;
        let sharing = if hash(b"two") & 255 == hash(b"one") & 255 { 2 } else { 1 };
        let slots = u32::from_le_bytes(bytes[table * 8 + 4..table * 8 + 8].try_into().unwrap());
        assert_eq!(slots, 2 * sharing);
        let tpos = u32::from_le_bytes(bytes[table * 8..table * 8 + 4].try_into().unwrap());
        assert!(tpos as usize >= records_end);
    }

    #[test]
    fn write_atomic_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.cdb");
        write_atomic(&path, [(&b"k"[..], &b"v1"[..])]).unwrap();
        write_atomic(&path, [(&b"k"[..], &b"v2"[..])]).unwrap();
        let db = Cdb::open(&path).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert!(!dir.path().join("data.cdb.tmp").exists());
    }
}
