// ABOUTME: Content-addressed task fingerprinting
// ABOUTME: Builds the 128-bit digest over session, process, source, inputs and free variables

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use super::config::HashMode;
use super::context::Value;
use super::error::{Result, TaskError};

pub const HASH_LEN: usize = 16;

/// A 128-bit task fingerprint.
///
/// The hex form splits as `[0..2]` / `[2..]` to derive the two-level work
/// directory below the session work dir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHash([u8; HASH_LEN]);

impl TaskHash {
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// First two hex characters: the bucket directory name.
    pub fn prefix(&self) -> String {
        self.to_hex()[..2].to_string()
    }

    /// Remaining hex characters: the leaf directory name.
    pub fn suffix(&self) -> String {
        self.to_hex()[2..].to_string()
    }

    /// Derive an alternative hash for work-dir collision resolution.
    /// `tries == 0` returns the hash unchanged.
    pub fn rehash(&self, tries: u32) -> TaskHash {
        if tries == 0 {
            return *self;
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.0);
        hasher.update(&tries.to_le_bytes());
        truncate(hasher)
    }
}

impl fmt::Display for TaskHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for TaskHash {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != HASH_LEN * 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TaskError::InvalidHash(s.to_string()));
        }
        let mut bytes = [0u8; HASH_LEN];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| TaskError::InvalidHash(s.into()))?;
            bytes[i] =
                u8::from_str_radix(hex, 16).map_err(|_| TaskError::InvalidHash(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for TaskHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TaskHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn truncate(hasher: blake3::Hasher) -> TaskHash {
    let digest = hasher.finalize();
    let mut bytes = [0u8; HASH_LEN];
    bytes.copy_from_slice(&digest.as_bytes()[..HASH_LEN]);
    TaskHash(bytes)
}

/// Incremental fingerprint builder.
///
/// Items are absorbed in a fixed canonical order; file inputs go through
/// [`FingerprintBuilder::push_file_bag`], which sorts per-file digests before
/// absorbing so the result is invariant to input file order.
pub struct FingerprintBuilder {
    hasher: blake3::Hasher,
    mode: HashMode,
}

impl FingerprintBuilder {
    pub fn new(mode: HashMode) -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            mode,
        }
    }

    pub fn push_str(&mut self, item: &str) -> &mut Self {
        self.hasher.update(&(item.len() as u64).to_le_bytes());
        self.hasher.update(item.as_bytes());
        self
    }

    /// Absorb a named non-file value: `(name, canonical rendering)`.
    pub fn push_named(&mut self, name: &str, value: &Value) -> &mut Self {
        self.push_str(name);
        self.push_str(&value.render());
        self
    }

    /// Absorb a set of staged files as an unordered bag. Each file
    /// contributes `(basename, content digest)`; the per-file digests are
    /// sorted before they reach the main hasher.
    pub fn push_file_bag(&mut self, name: &str, paths: &[&Path]) -> Result<&mut Self> {
        self.push_str(name);
        let mut digests = Vec::with_capacity(paths.len());
        for path in paths {
            digests.push(file_digest(path, self.mode)?);
        }
        digests.sort();
        for digest in digests {
            self.hasher.update(&digest);
        }
        Ok(self)
    }

    pub fn finish(self) -> TaskHash {
        truncate(self.hasher)
    }
}

/// Digest of one file under the given mode. `Standard` hashes the metadata
/// triple `(size, mtime-seconds, path)`; `Deep` hashes the content bytes.
/// The basename participates in both so a rename invalidates the entry.
fn file_digest(path: &Path, mode: HashMode) -> Result<[u8; 32]> {
    let mut hasher = blake3::Hasher::new();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    hasher.update(name.as_bytes());

    match mode {
        HashMode::Standard => {
            let meta = std::fs::metadata(path)?;
            let mtime = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            hasher.update(&meta.len().to_le_bytes());
            hasher.update(&mtime.to_le_bytes());
            hasher.update(path.to_string_lossy().as_bytes());
        }
        HashMode::Deep => {
            let mut file = std::fs::File::open(path)?;
            std::io::copy(&mut file, &mut hasher)?;
        }
    }
    Ok(*hasher.finalize().as_bytes())
}
