//! Read side of the constant database.
//!
//! File layout (all numbers 32-bit little-endian):
//! a 2048-byte header of 256 `(table position, slot count)` pairs, then the
//! records `(keylen, datalen, key, data)`, then the 256 hash tables whose
//! slots are `(hash, record position)` with position 0 marking an empty slot.
//!
//! A key hashes to table `h & 255` and is searched by linear probing from
//! slot `(h >> 8) % slots`. The builder keeps tables at most half full, so
//! probes are short; they are bounded by the slot count in any case.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

pub const HEADER_LEN: u32 = 2048;
const HASH_START: u32 = 5381;

#[derive(Debug, Error)]
pub enum CdbError {
    #[error("database read failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed database: {len} bytes at offset {pos} lie outside the file")]
    Format { pos: u32, len: u32 },
}

pub fn hash(key: &[u8]) -> u32 {
    key.iter()
        .fold(HASH_START, |h, &b| h.wrapping_add(h << 5) ^ b as u32)
}

enum Source {
    Map(Mmap),
    File(File),
}

/// An open database. Lookups go through [`Finder`]s, any number of which
/// may search the same handle independently.
pub struct Cdb {
    source: Source,
}

impl Cdb {
    pub fn open(path: &Path) -> Result<Self, CdbError> {
        Ok(Self::from_file(File::open(path)?))
    }

    /// Map the file if it can be mapped, otherwise fall back to positional reads.
    pub fn from_file(file: File) -> Self {
        let mappable = file
            .metadata()
            .map(|m| m.len() > 0 && m.len() <= u32::MAX as u64)
            .unwrap_or(false);
        if mappable {
            // SAFETY: the file is opened read-only and databases are replaced
            // by rename, never rewritten in place.
            match unsafe { Mmap::map(&file) } {
                Ok(map) => return Self { source: Source::Map(map) },
                Err(err) => debug!(target = "cdb", error = %err, "mmap failed, using reads"),
            }
        }
        Self::from_file_unmapped(file)
    }

    pub fn from_file_unmapped(file: File) -> Self {
        Self {
            source: Source::File(file),
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.source, Source::Map(_))
    }

    /// Fill `buf` from offset `pos`. Reads that would leave the file are a
    /// format error, never a short read.
    pub fn read(&self, buf: &mut [u8], pos: u32) -> Result<(), CdbError> {
        let len = buf.len();
        let format = || CdbError::Format {
            pos,
            len: len as u32,
        };
        match &self.source {
            Source::Map(map) => {
                let start = pos as usize;
                if start > map.len() || map.len() - start < len {
                    return Err(format());
                }
                buf.copy_from_slice(&map[start..start + len]);
                Ok(())
            }
            // read_exact_at retries EINTR itself
            Source::File(file) => match file.read_exact_at(buf, pos as u64) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(format()),
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Size of the underlying file in bytes.
    pub fn file_len(&self) -> Result<u64, CdbError> {
        match &self.source {
            Source::Map(map) => Ok(map.len() as u64),
            Source::File(file) => Ok(file.metadata()?.len()),
        }
    }

    /// Copy out a record's data. The length is checked against the file
    /// before anything is allocated.
    pub fn read_data(&self, data: DataRef) -> Result<Vec<u8>, CdbError> {
        if data.pos as u64 + data.len as u64 > self.file_len()? {
            return Err(CdbError::Format {
                pos: data.pos,
                len: data.len,
            });
        }
        let mut buf = vec![0u8; data.len as usize];
        self.read(&mut buf, data.pos)?;
        Ok(buf)
    }

    pub fn finder(&self) -> Finder<'_> {
        Finder {
            cdb: self,
            probes: 0,
            khash: 0,
            kpos: 0,
            hpos: 0,
            hslots: 0,
        }
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CdbError> {
        match self.finder().find(key)? {
            Some(d) => self.read_data(d).map(Some),
            None => Ok(None),
        }
    }

    /// Every value stored under `key`, in file order of the probe sequence.
    pub fn get_all(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, CdbError> {
        let mut finder = self.finder();
        let mut out = Vec::new();
        while let Some(d) = finder.find_next(key)? {
            out.push(self.read_data(d)?);
        }
        Ok(out)
    }
}

/// Location of a record's data inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRef {
    pub pos: u32,
    pub len: u32,
}

/// Probe state of one search. Call [`Finder::find_start`] (or [`Finder::find`])
/// before searching for a different key.
pub struct Finder<'a> {
    cdb: &'a Cdb,
    // slots examined so far for the current key; 0 means not started
    probes: u32,
    khash: u32,
    kpos: u32,
    hpos: u32,
    hslots: u32,
}

impl<'a> Finder<'a> {
    pub fn find_start(&mut self) {
        self.probes = 0;
    }

    pub fn find(&mut self, key: &[u8]) -> Result<Option<DataRef>, CdbError> {
        self.find_start();
        self.find_next(key)
    }

    /// Next record for `key` after the previous hit, `None` once the probe
    /// sequence hits an empty slot or has covered the whole table.
    pub fn find_next(&mut self, key: &[u8]) -> Result<Option<DataRef>, CdbError> {
        let mut buf = [0u8; 8];

        if self.probes == 0 {
            let h = hash(key);
            self.cdb.read(&mut buf, (h << 3) & (HEADER_LEN - 1))?;
            let (hpos, hslots) = split_pair(&buf);
            if hslots == 0 {
                return Ok(None);
            }
            self.hpos = hpos;
            self.hslots = hslots;
            self.khash = h;
            self.kpos = slot_offset(hpos, (h >> 8) % hslots)?;
        }

        while self.probes < self.hslots {
            self.cdb.read(&mut buf, self.kpos)?;
            let (slot_hash, pos) = split_pair(&buf);
            if pos == 0 {
                return Ok(None);
            }

            self.probes += 1;
            self.kpos = self.kpos.wrapping_add(8);
            if self.kpos == slot_offset(self.hpos, self.hslots)? {
                self.kpos = self.hpos;
            }

            if slot_hash != self.khash {
                continue;
            }
            self.cdb.read(&mut buf, pos)?;
            let (klen, dlen) = split_pair(&buf);
            if klen as usize != key.len() {
                continue;
            }
            let key_pos = pos.checked_add(8).ok_or(CdbError::Format { pos, len: 8 })?;
            if self.matches(key, key_pos)? {
                let data_pos = key_pos
                    .checked_add(klen)
                    .ok_or(CdbError::Format { pos: key_pos, len: klen })?;
                return Ok(Some(DataRef {
                    pos: data_pos,
                    len: dlen,
                }));
            }
        }
        Ok(None)
    }

    fn matches(&self, key: &[u8], mut pos: u32) -> Result<bool, CdbError> {
        let mut buf = [0u8; 32];
        for chunk in key.chunks(buf.len()) {
            let part = &mut buf[..chunk.len()];
            self.cdb.read(part, pos)?;
            if part != chunk {
                return Ok(false);
            }
            pos = pos.wrapping_add(chunk.len() as u32);
        }
        Ok(true)
    }
}

#[inline]
fn split_pair(buf: &[u8; 8]) -> (u32, u32) {
    (
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
    )
}

fn slot_offset(hpos: u32, slot: u32) -> Result<u32, CdbError> {
    slot.checked_mul(8)
        .and_then(|off| hpos.checked_add(off))
        .ok_or(CdbError::Format { pos: hpos, len: 8 })
}
