// ABOUTME: Append-only per-run cache index of fixed-width records
// ABOUTME: Each record is the 16-byte task hash plus a 1-byte cached flag, in binding order

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use super::error::{CacheError, Result};
use crate::task::{TaskHash, HASH_LEN};

pub const RECORD_LEN: usize = HASH_LEN + 1;

/// One index record: the fingerprint of a bound task and whether the task
/// was resumed from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub hash: TaskHash,
    pub cached: bool,
}

/// Appender for `index.<runName>`. Records are written in the order the
/// owning processor bound its tasks.
#[derive(Debug)]
pub struct IndexWriter {
    file: File,
}

impl IndexWriter {
    /// Create or truncate the index file for a fresh run.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn append(&mut self, hash: &TaskHash, cached: bool) -> Result<()> {
        let mut record = [0u8; RECORD_LEN];
        record[..HASH_LEN].copy_from_slice(hash.as_bytes());
        record[HASH_LEN] = cached as u8;
        self.file.write_all(&record)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Sequential reader over an index file.
#[derive(Debug)]
pub struct IndexReader {
    path: PathBuf,
}

impl IndexReader {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(CacheError::MissingIndex(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Read every record in file order.
    pub fn records(&self) -> Result<Vec<IndexRecord>> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        let mut buf = [0u8; RECORD_LEN];
        let mut offset: u64 = 0;
        loop {
            match read_exact_or_eof(&mut reader, &mut buf)? {
                ReadOutcome::Eof => break,
                ReadOutcome::Partial => {
                    return Err(CacheError::CorruptIndex {
                        path: self.path.clone(),
                        offset,
                    })
                }
                ReadOutcome::Full => {
                    let mut hash_bytes = [0u8; HASH_LEN];
                    hash_bytes.copy_from_slice(&buf[..HASH_LEN]);
                    records.push(IndexRecord {
                        hash: TaskHash::from_bytes(hash_bytes),
                        cached: buf[HASH_LEN] != 0,
                    });
                    offset += RECORD_LEN as u64;
                }
            }
        }
        Ok(records)
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Partial
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}
