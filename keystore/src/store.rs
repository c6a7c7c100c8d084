use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, Key, KeyInit,
};
use crypto::identity::{current_timestamp, IdentityPublicKey, IDENTITY_ALGORITHM};
use crypto::traits::{SigningKey, VerifyKey};
use crypto::{Fingerprint, IdentityKeypair};
use fs2::FileExt;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::audit::{AuditOperation, AuditSink, JsonlAuditLog, MemoryAuditLog};
use crate::config::KeyStoreConfig;
use crate::error::{KeyStoreError, Result};
use crate::export::{encode_public, PublicKeyFormat};

const RECORD_VERSION: u32 = 1;
const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const MAX_NAME_LEN: usize = 64;
const RECORD_EXTENSION: &str = "key";
const ARCHIVE_DIR: &str = "archive";
const CONTACTS_DIR: &str = "contacts";
const CONTACT_EXTENSION: &str = "json";
pub const AUDIT_FILE: &str = "audit.jsonl";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl From<&KeyStoreConfig> for KdfParams {
    fn from(config: &KeyStoreConfig) -> Self {
        Self {
            memory_kib: config.kdf_memory_kib,
            iterations: config.kdf_iterations,
            parallelism: config.kdf_parallelism,
        }
    }
}

/// One identity key as stored on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct KeyRecord {
    version: u32,
    name: String,
    algorithm_id: String,
    salt: [u8; SALT_LEN],
    kdf_params: KdfParams,
    nonce: [u8; NONCE_LEN],
    encrypted_private_key: Vec<u8>,
    public_key: Vec<u8>,
    fingerprint: [u8; 32],
    created_at: u64,
    retired_at: Option<u64>,
}

/// The authenticated part of a record. `retired_at` is left out so a key
/// can be archived without its passphrase.
#[derive(Serialize)]
struct RecordHeader<'a> {
    version: u32,
    name: &'a str,
    algorithm_id: &'a str,
    salt: &'a [u8; SALT_LEN],
    kdf_params: &'a KdfParams,
    public_key: &'a [u8],
    fingerprint: &'a [u8; 32],
    created_at: u64,
}

impl KeyRecord {
    fn header_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&RecordHeader {
            version: self.version,
            name: &self.name,
            algorithm_id: &self.algorithm_id,
            salt: &self.salt,
            kdf_params: &self.kdf_params,
            public_key: &self.public_key,
            fingerprint: &self.fingerprint,
            created_at: self.created_at,
        })?)
    }

    fn seal(
        name: &str,
        keypair: &IdentityKeypair,
        passphrase: &str,
        kdf_params: KdfParams,
    ) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut record = KeyRecord {
            version: RECORD_VERSION,
            name: name.to_string(),
            algorithm_id: keypair.algorithm_id().to_string(),
            salt,
            kdf_params,
            nonce,
            encrypted_private_key: Vec::new(),
            public_key: keypair.public_key().as_bytes().to_vec(),
            fingerprint: *keypair.fingerprint().as_bytes(),
            created_at: keypair.created_at(),
            retired_at: None,
        };

        let key = derive_key(passphrase, &salt, &kdf_params)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let header = record.header_bytes()?;
        let secret = keypair.private_key_bytes();
        record.encrypted_private_key = cipher
            .encrypt(
                &nonce.into(),
                Payload {
                    msg: &secret[..],
                    aad: &header,
                },
            )
            .map_err(|_| KeyStoreError::Corrupt("encryption failed".into()))?;
        Ok(record)
    }

    fn open(&self, passphrase: &str) -> Result<IdentityKeypair> {
        let key = derive_key(passphrase, &self.salt, &self.kdf_params)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let header = self.header_bytes()?;
        let secret = Zeroizing::new(
            cipher
                .decrypt(
                    &self.nonce.into(),
                    Payload {
                        msg: &self.encrypted_private_key,
                        aad: &header,
                    },
                )
                .map_err(|_| KeyStoreError::WrongPassphrase)?,
        );
        let keypair = IdentityKeypair::from_parts(
            &self.algorithm_id,
            &secret,
            &self.public_key,
            self.created_at,
        )?;
        Ok(keypair)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let record: KeyRecord =
            bincode::deserialize(bytes).map_err(|e| KeyStoreError::Corrupt(e.to_string()))?;
        if record.version != RECORD_VERSION {
            return Err(KeyStoreError::UnsupportedVersion(record.version));
        }
        if Fingerprint::of(&record.public_key).as_bytes() != &record.fingerprint {
            return Err(KeyStoreError::Corrupt(
                "fingerprint does not match public key".into(),
            ));
        }
        Ok(record)
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_bytes(self.fingerprint)
    }

    fn info(&self) -> KeyInfo {
        KeyInfo {
            name: self.name.clone(),
            algorithm_id: self.algorithm_id.clone(),
            fingerprint: self.fingerprint(),
            created_at: self.created_at,
            retired_at: self.retired_at,
        }
    }
}

/// Public metadata of a stored key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub name: String,
    pub algorithm_id: String,
    pub fingerprint: Fingerprint,
    pub created_at: u64,
    pub retired_at: Option<u64>,
}

/// A peer's public identity, pinned by name. Stored as JSON at
/// `<dir>/contacts/<name>.json`; no secret material.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ContactRecord {
    name: String,
    algorithm_id: String,
    /// Hex public key
    public_key: String,
    added_at: u64,
}

impl ContactRecord {
    fn public_key(&self) -> Result<IdentityPublicKey> {
        let bytes = hex::decode(&self.public_key)
            .map_err(|e| KeyStoreError::Corrupt(format!("contact {:?}: {e}", self.name)))?;
        Ok(IdentityPublicKey::from_bytes(&bytes)?)
    }

    fn info(&self) -> Result<ContactInfo> {
        Ok(ContactInfo {
            name: self.name.clone(),
            algorithm_id: self.algorithm_id.clone(),
            fingerprint: self.public_key()?.fingerprint(),
            added_at: self.added_at,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub name: String,
    pub algorithm_id: String,
    pub fingerprint: Fingerprint,
    pub added_at: u64,
}

/// Exclusive advisory lock on one key name, released on drop.
struct NameLock {
    file: File,
}

impl NameLock {
    fn acquire(dir: &Path, name: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(format!(".{name}.lock")))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for NameLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Passphrase-protected store of named identity keys.
///
/// Active keys live at `<dir>/<name>.key`; rotated-out keys move to
/// `<dir>/archive/<name>.<fingerprint>.key` and stay loadable for the
/// configured grace period.
pub struct KeyManager {
    dir: PathBuf,
    passphrase: Zeroizing<String>,
    config: KeyStoreConfig,
    audit: Box<dyn AuditSink>,
}

impl KeyManager {
    pub fn open<P: AsRef<Path>>(dir: P, passphrase: &str, config: KeyStoreConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        create_private_dir(&dir)?;
        create_private_dir(&dir.join(ARCHIVE_DIR))?;
        create_private_dir(&dir.join(CONTACTS_DIR))?;

        let audit: Box<dyn AuditSink> = if config.audit_log {
            Box::new(JsonlAuditLog::open(dir.join(AUDIT_FILE))?)
        } else {
            Box::new(MemoryAuditLog::new())
        };

        tracing::debug!(dir = %dir.display(), "opened key store");
        Ok(Self {
            dir,
            passphrase: Zeroizing::new(passphrase.to_string()),
            config,
            audit,
        })
    }

    /// Replace the audit destination.
    pub fn with_audit_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &KeyStoreConfig {
        &self.config
    }

    /// Create a fresh identity under `name`.
    pub fn generate(&self, name: &str, overwrite: bool) -> Result<Fingerprint> {
        let keypair = IdentityKeypair::generate();
        self.insert(name, &keypair, overwrite)?;
        self.audit
            .record(AuditOperation::Generate, name, Some(&keypair.fingerprint()))?;
        tracing::info!(name, fingerprint = %keypair.fingerprint().short(), "generated identity key");
        Ok(keypair.fingerprint())
    }

    /// Store an existing keypair under `name`.
    pub fn insert(&self, name: &str, keypair: &IdentityKeypair, overwrite: bool) -> Result<()> {
        validate_name(name)?;
        let _lock = NameLock::acquire(&self.dir, name)?;
        let path = self.active_path(name);
        if path.exists() && !overwrite {
            return Err(KeyStoreError::KeyExists(name.to_string()));
        }
        let record = KeyRecord::seal(name, keypair, &self.passphrase, self.kdf_params())?;
        self.write_record(&path, &record)
    }

    pub fn load(&self, name: &str, passphrase: &str) -> Result<IdentityKeypair> {
        validate_name(name)?;
        let record = self.read_record(&self.active_path(name), name)?;
        let keypair = record.open(passphrase)?;
        self.audit
            .record(AuditOperation::Load, name, Some(&keypair.fingerprint()))?;
        Ok(keypair)
    }

    pub fn info(&self, name: &str) -> Result<KeyInfo> {
        validate_name(name)?;
        Ok(self.read_record(&self.active_path(name), name)?.info())
    }

    pub fn fingerprint(&self, name: &str) -> Result<Fingerprint> {
        Ok(self.info(name)?.fingerprint)
    }

    /// Replace `name` with a fresh identity, archiving the old one.
    ///
    /// Returns `(old, new)` fingerprints. Archived records of `name` past
    /// the grace period are purged in the same step.
    pub fn rotate(&self, name: &str) -> Result<(Fingerprint, Fingerprint)> {
        validate_name(name)?;
        let _lock = NameLock::acquire(&self.dir, name)?;
        let active = self.active_path(name);
        let mut old = self.read_record(&active, name)?;
        // The replacement is sealed under this store's passphrase; refuse to
        // rotate a key this passphrase cannot open.
        old.open(&self.passphrase)?;

        let keypair = IdentityKeypair::generate();
        let new = KeyRecord::seal(name, &keypair, &self.passphrase, self.kdf_params())?;

        let old_fingerprint = old.fingerprint();
        old.retired_at = Some(current_timestamp());
        self.write_record(&self.archive_path(name, &old_fingerprint), &old)?;
        self.write_record(&active, &new)?;
        let purged = self.purge_archive_locked(name)?;

        self.audit
            .record(AuditOperation::Rotate, name, Some(&keypair.fingerprint()))?;
        tracing::info!(
            name,
            old = %old_fingerprint.short(),
            new = %keypair.fingerprint().short(),
            purged,
            "rotated identity key"
        );
        Ok((old_fingerprint, keypair.fingerprint()))
    }

    /// Load a rotated-out key that is still inside its grace period.
    pub fn load_archived(
        &self,
        name: &str,
        fingerprint: &Fingerprint,
        passphrase: &str,
    ) -> Result<IdentityKeypair> {
        validate_name(name)?;
        let record = self.read_record(&self.archive_path(name, fingerprint), name)?;
        if self.is_expired(&record, current_timestamp()) {
            return Err(KeyStoreError::Expired {
                name: name.to_string(),
                fingerprint: *fingerprint,
            });
        }
        let keypair = record.open(passphrase)?;
        self.audit
            .record(AuditOperation::LoadArchived, name, Some(fingerprint))?;
        Ok(keypair)
    }

    /// Delete every archived record past its grace period.
    pub fn purge_expired(&self) -> Result<usize> {
        let mut names: Vec<String> = self
            .list_archived()?
            .into_iter()
            .map(|info| info.name)
            .collect();
        names.dedup();

        let mut purged = 0;
        for name in names {
            let _lock = NameLock::acquire(&self.dir, &name)?;
            purged += self.purge_archive_locked(&name)?;
        }
        Ok(purged)
    }

    /// Active keys, sorted by name.
    pub fn list(&self) -> Result<Vec<KeyInfo>> {
        let mut keys = Vec::new();
        for path in record_files(&self.dir)? {
            match read_record_file(&path) {
                Ok(record) => keys.push(record.info()),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        keys.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(keys)
    }

    /// Archived keys, sorted by name then retirement time.
    pub fn list_archived(&self) -> Result<Vec<KeyInfo>> {
        let mut keys = Vec::new();
        for path in record_files(&self.dir.join(ARCHIVE_DIR))? {
            match read_record_file(&path) {
                Ok(record) => keys.push(record.info()),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        keys.sort_by(|a, b| a.name.cmp(&b.name).then(a.retired_at.cmp(&b.retired_at)));
        Ok(keys)
    }

    /// Remove `name` and any archived records of it.
    pub fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let _lock = NameLock::acquire(&self.dir, name)?;
        let active = self.active_path(name);
        let record = self.read_record(&active, name)?;
        fs::remove_file(&active)?;
        for info in self.list_archived()?.into_iter().filter(|i| i.name == name) {
            remove_if_exists(&self.archive_path(name, &info.fingerprint))?;
        }
        self.audit
            .record(AuditOperation::Delete, name, Some(&record.fingerprint()))?;
        tracing::info!(name, "deleted identity key");
        Ok(())
    }

    /// The encrypted record exactly as stored, for backup or transfer.
    pub fn export_record(&self, name: &str) -> Result<Vec<u8>> {
        validate_name(name)?;
        let path = self.active_path(name);
        let bytes = read_existing(&path, name)?;
        let record = KeyRecord::decode(&bytes)?;
        self.audit
            .record(AuditOperation::Export, name, Some(&record.fingerprint()))?;
        Ok(bytes)
    }

    /// Install a record produced by [`export_record`](Self::export_record).
    /// The record stays encrypted under the passphrase it was exported with.
    pub fn import_record(&self, name: &str, bytes: &[u8], overwrite: bool) -> Result<Fingerprint> {
        validate_name(name)?;
        let mut record = KeyRecord::decode(bytes)?;
        if record.name != name {
            return Err(KeyStoreError::NameMismatch {
                expected: name.to_string(),
                found: record.name,
            });
        }
        record.retired_at = None;

        let _lock = NameLock::acquire(&self.dir, name)?;
        let path = self.active_path(name);
        if path.exists() && !overwrite {
            return Err(KeyStoreError::KeyExists(name.to_string()));
        }
        self.write_record(&path, &record)?;
        let fingerprint = record.fingerprint();
        self.audit
            .record(AuditOperation::Import, name, Some(&fingerprint))?;
        Ok(fingerprint)
    }

    pub fn public_key(&self, name: &str) -> Result<IdentityPublicKey> {
        validate_name(name)?;
        let record = self.read_record(&self.active_path(name), name)?;
        Ok(IdentityPublicKey::from_bytes(&record.public_key)?)
    }

    pub fn export_public(&self, name: &str, format: PublicKeyFormat) -> Result<String> {
        Ok(encode_public(&self.public_key(name)?, format))
    }

    /// Pin a peer's public key under `name`.
    pub fn add_contact(
        &self,
        name: &str,
        key: &IdentityPublicKey,
        overwrite: bool,
    ) -> Result<Fingerprint> {
        validate_name(name)?;
        let contacts = self.dir.join(CONTACTS_DIR);
        let _lock = NameLock::acquire(&contacts, name)?;
        let path = self.contact_path(name);
        if path.exists() && !overwrite {
            return Err(KeyStoreError::ContactExists(name.to_string()));
        }
        let record = ContactRecord {
            name: name.to_string(),
            algorithm_id: IDENTITY_ALGORITHM.to_string(),
            public_key: hex::encode(key.as_bytes()),
            added_at: current_timestamp(),
        };
        write_atomic(&path, &serde_json::to_vec_pretty(&record)?)?;

        let fingerprint = key.fingerprint();
        self.audit
            .record(AuditOperation::AddContact, name, Some(&fingerprint))?;
        tracing::info!(name, fingerprint = %fingerprint.short(), "added contact");
        Ok(fingerprint)
    }

    pub fn contact(&self, name: &str) -> Result<IdentityPublicKey> {
        self.read_contact(name)?.public_key()
    }

    pub fn contact_fingerprint(&self, name: &str) -> Result<Fingerprint> {
        Ok(self.contact(name)?.fingerprint())
    }

    /// Contacts, sorted by name. Unreadable files are skipped.
    pub fn list_contacts(&self) -> Result<Vec<ContactInfo>> {
        let mut contacts = Vec::new();
        for path in files_with_extension(&self.dir.join(CONTACTS_DIR), CONTACT_EXTENSION)? {
            match read_contact_file(&path).and_then(|record| record.info()) {
                Ok(info) => contacts.push(info),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable contact"),
            }
        }
        contacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(contacts)
    }

    /// The contact pinned to `fingerprint`, if any.
    pub fn find_contact(&self, fingerprint: &Fingerprint) -> Result<Option<ContactInfo>> {
        Ok(self
            .list_contacts()?
            .into_iter()
            .find(|info| info.fingerprint == *fingerprint))
    }

    pub fn remove_contact(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let _lock = NameLock::acquire(&self.dir.join(CONTACTS_DIR), name)?;
        let record = self.read_contact(name)?;
        fs::remove_file(self.contact_path(name))?;
        let fingerprint = record.public_key()?.fingerprint();
        self.audit
            .record(AuditOperation::RemoveContact, name, Some(&fingerprint))?;
        tracing::info!(name, "removed contact");
        Ok(())
    }

    /// Delete active keys created more than `max_age` ago.
    pub fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let now = current_timestamp();
        let mut deleted = 0;
        for info in self.list()? {
            if now.saturating_sub(info.created_at) >= max_age.as_secs() {
                self.delete(&info.name)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn kdf_params(&self) -> KdfParams {
        KdfParams::from(&self.config)
    }

    fn active_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{RECORD_EXTENSION}"))
    }

    fn contact_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(CONTACTS_DIR)
            .join(format!("{name}.{CONTACT_EXTENSION}"))
    }

    fn read_contact(&self, name: &str) -> Result<ContactRecord> {
        validate_name(name)?;
        let record = match fs::read(self.contact_path(name)) {
            Ok(bytes) => serde_json::from_slice::<ContactRecord>(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(KeyStoreError::ContactNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if record.name != name {
            return Err(KeyStoreError::NameMismatch {
                expected: name.to_string(),
                found: record.name,
            });
        }
        Ok(record)
    }

    fn archive_path(&self, name: &str, fingerprint: &Fingerprint) -> PathBuf {
        self.dir
            .join(ARCHIVE_DIR)
            .join(format!("{name}.{}.{RECORD_EXTENSION}", fingerprint.to_hex()))
    }

    fn is_expired(&self, record: &KeyRecord, now: u64) -> bool {
        match record.retired_at {
            Some(retired_at) => {
                now >= retired_at.saturating_add(self.config.key_rotation_grace_period_secs)
            }
            None => false,
        }
    }

    /// Caller holds the lock for `name`.
    fn purge_archive_locked(&self, name: &str) -> Result<usize> {
        let now = current_timestamp();
        let mut purged = 0;
        for path in record_files(&self.dir.join(ARCHIVE_DIR))? {
            let record = match read_record_file(&path) {
                Ok(record) if record.name == name => record,
                _ => continue,
            };
            if self.is_expired(&record, now) {
                remove_if_exists(&path)?;
                self.audit
                    .record(AuditOperation::Purge, name, Some(&record.fingerprint()))?;
                tracing::debug!(name, fingerprint = %record.fingerprint().short(), "purged archived key");
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn read_record(&self, path: &Path, name: &str) -> Result<KeyRecord> {
        let record = KeyRecord::decode(&read_existing(path, name)?)?;
        if record.name != name {
            return Err(KeyStoreError::NameMismatch {
                expected: name.to_string(),
                found: record.name,
            });
        }
        Ok(record)
    }

    fn write_record(&self, path: &Path, record: &KeyRecord) -> Result<()> {
        write_atomic(path, &bincode::serialize(record)?)
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Key names: 1-64 of `[A-Za-z0-9_.-]`, no leading dot.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(KeyStoreError::InvalidName(name.to_string()))
    }
}

fn derive_key(
    passphrase: &str,
    salt: &[u8; SALT_LEN],
    kdf: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_LEN))
        .map_err(|e| KeyStoreError::Kdf(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| KeyStoreError::Kdf(e.to_string()))?;
    Ok(key)
}

fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn read_existing(path: &Path, name: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => KeyStoreError::KeyNotFound(name.to_string()),
        _ => KeyStoreError::Io(e),
    })
}

fn read_record_file(path: &Path) -> Result<KeyRecord> {
    KeyRecord::decode(&fs::read(path)?)
}

fn read_contact_file(path: &Path) -> Result<ContactRecord> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

/// Write via a temporary file and rename so readers never see a torn file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_suffix = [0u8; 8];
    OsRng.fill_bytes(&mut tmp_suffix);
    let tmp = path.with_extension(format!("tmp-{:x}", u64::from_le_bytes(tmp_suffix)));

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    let written = file.write_all(bytes).and_then(|_| file.sync_all());
    drop(file);
    if let Err(e) = written.and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// `*.key` files directly inside `dir`, hidden files excluded.
fn record_files(dir: &Path) -> Result<Vec<PathBuf>> {
    files_with_extension(dir, RECORD_EXTENSION)
}

fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(true, |n| n.starts_with('.'));
        let is_record = path.extension().and_then(|e| e.to_str()) == Some(extension);
        if is_record && !hidden && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
