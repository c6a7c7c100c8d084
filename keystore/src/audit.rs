//! Append-only audit trail of key store operations.
//!
//! Entries form a SHA-256 hash chain: each entry commits to the previous
//! entry's hash, so editing or dropping a line breaks every later link.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crypto::hashes::sha256_fields;
use crypto::identity::current_timestamp;
use crypto::Fingerprint;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{KeyStoreError, Result};

const GENESIS_HASH: [u8; 32] = [0u8; 32];
/// Upper bound on one serialized entry; the tail read looks this far back.
const MAX_LINE_LEN: u64 = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Generate,
    Rotate,
    Load,
    LoadArchived,
    Delete,
    Import,
    Export,
    Purge,
    AddContact,
    RemoveContact,
}

impl AuditOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOperation::Generate => "generate",
            AuditOperation::Rotate => "rotate",
            AuditOperation::Load => "load",
            AuditOperation::LoadArchived => "load_archived",
            AuditOperation::Delete => "delete",
            AuditOperation::Import => "import",
            AuditOperation::Export => "export",
            AuditOperation::Purge => "purge",
            AuditOperation::AddContact => "add_contact",
            AuditOperation::RemoveContact => "remove_contact",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub operation: AuditOperation,
    pub name: String,
    /// Hex fingerprint of the key the operation touched, if any.
    pub fingerprint: Option<String>,
    pub timestamp: u64,
    pub previous_hash: String,
    pub entry_hash: String,
}

impl AuditEntry {
    fn compute_hash(
        sequence: u64,
        operation: AuditOperation,
        name: &str,
        fingerprint: Option<&str>,
        timestamp: u64,
        previous_hash: &str,
    ) -> String {
        hex::encode(sha256_fields(&[
            &sequence.to_le_bytes(),
            operation.as_str().as_bytes(),
            name.as_bytes(),
            fingerprint.unwrap_or("").as_bytes(),
            &timestamp.to_le_bytes(),
            previous_hash.as_bytes(),
        ]))
    }

    /// Whether `entry_hash` matches the entry's contents.
    pub fn is_consistent(&self) -> bool {
        Self::compute_hash(
            self.sequence,
            self.operation,
            &self.name,
            self.fingerprint.as_deref(),
            self.timestamp,
            &self.previous_hash,
        ) == self.entry_hash
    }
}

/// Position at the end of a hash chain.
#[derive(Clone, Debug)]
struct ChainHead {
    next_sequence: u64,
    last_hash: String,
}

impl Default for ChainHead {
    fn default() -> Self {
        Self {
            next_sequence: 0,
            last_hash: hex::encode(GENESIS_HASH),
        }
    }
}

impl ChainHead {
    /// Head just past `last`, or the genesis head for an empty log.
    fn after(last: Option<&AuditEntry>) -> Result<Self> {
        match last {
            None => Ok(Self::default()),
            Some(entry) if entry.is_consistent() => Ok(Self {
                next_sequence: entry.sequence + 1,
                last_hash: entry.entry_hash.clone(),
            }),
            Some(entry) => Err(KeyStoreError::Audit(format!(
                "hash chain broken at sequence {}",
                entry.sequence
            ))),
        }
    }

    fn append(
        &mut self,
        operation: AuditOperation,
        name: &str,
        fingerprint: Option<&Fingerprint>,
    ) -> AuditEntry {
        let fingerprint = fingerprint.map(Fingerprint::to_hex);
        let timestamp = current_timestamp();
        let entry_hash = AuditEntry::compute_hash(
            self.next_sequence,
            operation,
            name,
            fingerprint.as_deref(),
            timestamp,
            &self.last_hash,
        );
        let entry = AuditEntry {
            sequence: self.next_sequence,
            operation,
            name: name.to_string(),
            fingerprint,
            timestamp,
            previous_hash: std::mem::replace(&mut self.last_hash, entry_hash.clone()),
            entry_hash,
        };
        self.next_sequence += 1;
        entry
    }

    /// Check that `entry` extends this head, then advance past it.
    fn accept(&mut self, entry: &AuditEntry) -> Result<()> {
        if entry.sequence != self.next_sequence {
            return Err(KeyStoreError::Audit(format!(
                "expected sequence {}, found {}",
                self.next_sequence, entry.sequence
            )));
        }
        if entry.previous_hash != self.last_hash || !entry.is_consistent() {
            return Err(KeyStoreError::Audit(format!(
                "hash chain broken at sequence {}",
                entry.sequence
            )));
        }
        self.next_sequence += 1;
        self.last_hash = entry.entry_hash.clone();
        Ok(())
    }
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    fn record(
        &self,
        operation: AuditOperation,
        name: &str,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<AuditEntry>;
}

/// Keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    inner: Mutex<(ChainHead, Vec<AuditEntry>)>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .map(|guard| guard.1.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(
        &self,
        operation: AuditOperation,
        name: &str,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<AuditEntry> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| KeyStoreError::Audit("audit log poisoned".into()))?;
        let entry = guard.0.append(operation, name, fingerprint);
        guard.1.push(entry.clone());
        Ok(entry)
    }
}

/// One JSON object per line.
///
/// Any number of handles, in this or other processes, may append to the same
/// file: each append takes an exclusive lock on it, resumes the chain from
/// the last line on disk and syncs before unlocking.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
}

impl JsonlAuditLog {
    /// Open (or create) the log. Fails if the existing chain does not verify.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            Self::replay(&path)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verify the whole chain and return the number of entries.
    pub fn verify<P: AsRef<Path>>(path: P) -> Result<u64> {
        Ok(Self::replay(path.as_ref())?.len() as u64)
    }

    pub fn entries<P: AsRef<Path>>(path: P) -> Result<Vec<AuditEntry>> {
        Self::replay(path.as_ref())
    }

    fn replay(path: &Path) -> Result<Vec<AuditEntry>> {
        let file = File::open(path)?;
        file.lock_shared()?;
        let entries = Self::read_chain(&file);
        let _ = FileExt::unlock(&file);
        entries
    }

    fn read_chain(file: &File) -> Result<Vec<AuditEntry>> {
        let reader = BufReader::new(file);
        let mut head = ChainHead::default();
        let mut entries = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| {
                KeyStoreError::Audit(format!("line {}: {e}", index + 1))
            })?;
            head.accept(&entry)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// The last complete entry in `file`, read from its tail.
    fn last_entry(file: &mut File) -> Result<Option<AuditEntry>> {
        let len = file.metadata()?.len();
        let start = len.saturating_sub(MAX_LINE_LEN);
        file.seek(SeekFrom::Start(start))?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail)?;
        let tail = String::from_utf8_lossy(&tail);

        let body = tail.trim_end();
        if body.is_empty() {
            return Ok(None);
        }
        let last = match body.rfind('\n') {
            Some(newline) => &body[newline + 1..],
            None if start == 0 => body,
            None => {
                return Err(KeyStoreError::Audit(
                    "last entry exceeds maximum length".into(),
                ))
            }
        };
        let entry = serde_json::from_str(last)
            .map_err(|e| KeyStoreError::Audit(format!("last entry: {e}")))?;
        Ok(Some(entry))
    }

    fn append_locked(
        file: &mut File,
        operation: AuditOperation,
        name: &str,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<AuditEntry> {
        let last = Self::last_entry(file)?;
        let entry = ChainHead::after(last.as_ref())?.append(operation, name, fingerprint);

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(entry)
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(
        &self,
        operation: AuditOperation,
        name: &str,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<AuditEntry> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let appended = Self::append_locked(&mut file, operation, name, fingerprint);
        let _ = FileExt::unlock(&file);
        appended
    }
}
