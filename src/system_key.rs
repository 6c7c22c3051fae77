//! Versioned system keys for keyring-mode tablespaces and the redo log.
//!
//! System keys live in the keyring under `percona_innodb-<key_id>-<uuid>`.
//! The keyring versions them: fetching the bare name returns the latest
//! version as a `<version>:<key>` blob, and `<name>:<version>` addresses one
//! version directly. The 32 byte keys are used as-is for page encryption;
//! they are never wrapped with a master key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::key_name;
use crate::keyring::{Keyring, KeyringError};
use crate::master_key::{KEY_LEN, KeyBytes};

/// Version value meaning "no valid key version".
pub const ENCRYPTION_KEY_VERSION_INVALID: u32 = u32::MAX;

/// Key version recovered from a redo-log block that was written without
/// keyring encryption.
pub const REDO_LOG_ENCRYPT_NO_VERSION: u32 = 0;

#[derive(Debug, thiserror::Error)]
/// An error raised while resolving a system key.
pub enum SystemKeyError {
    #[error(transparent)]
    /// The keyring reported a failure.
    Keyring(#[from] KeyringError),
    #[error("malformed system key blob for {0}")]
    /// The fetched blob does not parse as `<version>:<32 byte key>`.
    Malformed(String),
}

/// Parse a `<version>:<key>` system key blob.
pub fn parse_system_key(blob: &[u8]) -> Option<(u32, KeyBytes)> {
    let split = blob.iter().position(|&b| b == b':')?;
    let version: u32 = std::str::from_utf8(&blob[..split]).ok()?.parse().ok()?;
    let raw = &blob[split + 1..];
    if raw.len() != KEY_LEN {
        return None;
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(raw);
    Some((version, Zeroizing::new(key)))
}

fn fetch_latest(
    keyring: &dyn Keyring,
    name: &str,
) -> Result<Option<(u32, KeyBytes)>, SystemKeyError> {
    match keyring.fetch(name) {
        Ok((blob, _)) => parse_system_key(&blob)
            .map(Some)
            .ok_or_else(|| SystemKeyError::Malformed(name.to_owned())),
        Err(KeyringError::NotFound(_)) => Ok(None),
        Err(error) => Err(error.into()),
    }
}

fn fetch_version(keyring: &dyn Keyring, name: &str) -> Result<KeyBytes, SystemKeyError> {
    let (bytes, _) = keyring.fetch(name)?;
    if bytes.len() != KEY_LEN {
        return Err(SystemKeyError::Malformed(name.to_owned()));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(Zeroizing::new(key))
}

/// Generate a tablespace key and return it with its assigned version.
///
/// Generating under an existing name advances the version, so this also
/// implements tablespace key rotation.
pub fn create_tablespace_key(
    keyring: &dyn Keyring,
    key_id: u32,
    uuid: &str,
) -> Result<(u32, KeyBytes), SystemKeyError> {
    let name = key_name::system_key_name(key_id, uuid);
    keyring.generate(&name, "AES", KEY_LEN)?;
    fetch_latest(keyring, &name)?.ok_or_else(|| {
        tracing::error!(%name, "generated tablespace key is not fetchable");
        SystemKeyError::Keyring(KeyringError::NotFound(name))
    })
}

/// The newest version of a tablespace key, if the key exists.
pub fn latest_tablespace_key(
    keyring: &dyn Keyring,
    key_id: u32,
    uuid: &str,
) -> Result<Option<(u32, KeyBytes)>, SystemKeyError> {
    fetch_latest(keyring, &key_name::system_key_name(key_id, uuid))
}

/// Fetch one specific version of a tablespace key.
pub fn tablespace_key(
    keyring: &dyn Keyring,
    key_id: u32,
    uuid: &str,
    version: u32,
) -> Result<KeyBytes, SystemKeyError> {
    let name = key_name::versioned_system_key_name(key_id, uuid, version);
    fetch_version(keyring, &name).map_err(|error| {
        tracing::error!(
            key_id,
            version,
            "tablespace key not found, check that the keyring plugin is loaded"
        );
        error
    })
}

/// The newest tablespace key, creating version 1 if none exists yet.
pub fn latest_key_or_create(
    keyring: &dyn Keyring,
    key_id: u32,
    uuid: &str,
) -> Result<(u32, KeyBytes), SystemKeyError> {
    match latest_tablespace_key(keyring, key_id, uuid)? {
        Some(found) => Ok(found),
        None => create_tablespace_key(keyring, key_id, uuid),
    }
}

/// Whether a tablespace key exists for `(key_id, uuid)`.
pub fn tablespace_key_exists(
    keyring: &dyn Keyring,
    key_id: u32,
    uuid: &str,
) -> Result<bool, SystemKeyError> {
    Ok(latest_tablespace_key(keyring, key_id, uuid)?.is_some())
}

/// The newest key version for `(key_id, uuid)`, or
/// [`ENCRYPTION_KEY_VERSION_INVALID`] if the key does not exist.
pub fn latest_version(keyring: &dyn Keyring, key_id: u32, uuid: &str) -> u32 {
    match latest_tablespace_key(keyring, key_id, uuid) {
        Ok(Some((version, _))) => version,
        _ => ENCRYPTION_KEY_VERSION_INVALID,
    }
}

#[derive(Debug)]
/// Redo-log key manager: resolves redo keys by version and caches them.
///
/// Recovery may scan log blocks written under several key versions; the
/// cache keeps each version's key around so the scan does not hit the
/// keyring once per block.
pub struct RedoLogKeys {
    keyring: Arc<dyn Keyring>,
    uuid: String,
    cache: Mutex<HashMap<u32, KeyBytes>>,
}

impl RedoLogKeys {
    pub fn new(keyring: Arc<dyn Keyring>, uuid: impl Into<String>) -> Self {
        Self {
            keyring,
            uuid: uuid.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The uuid redo keys are scoped by.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The newest redo key, creating version 1 if none exists yet.
    pub fn latest_or_create(&self) -> Result<(u32, KeyBytes), SystemKeyError> {
        let name = key_name::redo_key_name(&self.uuid);
        if let Some((version, key)) = fetch_latest(self.keyring.as_ref(), &name)? {
            self.cache.lock().insert(version, key.clone());
            return Ok((version, key));
        }

        self.keyring.generate(&name, "AES", KEY_LEN)?;
        let (version, key) = fetch_latest(self.keyring.as_ref(), &name)?.ok_or_else(|| {
            tracing::error!(%name, "generated redo key is not fetchable");
            SystemKeyError::Keyring(KeyringError::NotFound(name))
        })?;
        self.cache.lock().insert(version, key.clone());
        Ok((version, key))
    }

    /// The redo key for a specific version, from cache or the keyring.
    pub fn load_key_version(&self, version: u32) -> Result<KeyBytes, SystemKeyError> {
        if let Some(key) = self.cache.lock().get(&version) {
            return Ok(key.clone());
        }

        let name = key_name::versioned_redo_key_name(&self.uuid, version);
        let key = fetch_version(self.keyring.as_ref(), &name)?;
        self.cache.lock().insert(version, key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::MemoryKeyring;

    const UUID: &str = "00000000-0000-0000-0000-000000000001";

    #[test]
    fn test_parse_system_key() {
        let mut blob = b"7:".to_vec();
        blob.extend_from_slice(&[0x11; KEY_LEN]);
        let (version, key) = parse_system_key(&blob).unwrap();
        assert_eq!(version, 7);
        assert_eq!(*key, [0x11; KEY_LEN]);

        assert!(parse_system_key(b"no separator").is_none());
        assert!(parse_system_key(b"x:short").is_none());
        let mut bad = b"nine:".to_vec();
        bad.extend_from_slice(&[0u8; KEY_LEN]);
        assert!(parse_system_key(&bad).is_none());
    }

    #[test]
    fn test_create_and_rotate_tablespace_key() {
        let keyring = MemoryKeyring::new();
        let (v1, key1) = create_tablespace_key(&keyring, 0, UUID).unwrap();
        assert_eq!(v1, 1);

        let (v2, key2) = create_tablespace_key(&keyring, 0, UUID).unwrap();
        assert_eq!(v2, 2);
        assert_ne!(*key1, *key2);

        // Old versions stay fetchable for decryption.
        assert_eq!(*tablespace_key(&keyring, 0, UUID, 1).unwrap(), *key1);
        assert_eq!(latest_version(&keyring, 0, UUID), 2);
    }

    #[test]
    fn test_latest_key_or_create() {
        let keyring = MemoryKeyring::new();
        assert!(!tablespace_key_exists(&keyring, 3, UUID).unwrap());
        assert_eq!(
            latest_version(&keyring, 3, UUID),
            ENCRYPTION_KEY_VERSION_INVALID
        );

        let (version, key) = latest_key_or_create(&keyring, 3, UUID).unwrap();
        assert_eq!(version, 1);
        assert!(tablespace_key_exists(&keyring, 3, UUID).unwrap());

        let (again_version, again_key) = latest_key_or_create(&keyring, 3, UUID).unwrap();
        assert_eq!(again_version, 1);
        assert_eq!(*key, *again_key);
    }

    #[test]
    fn test_redo_keys_cache_and_versions() {
        let keyring = Arc::new(MemoryKeyring::new());
        let redo = RedoLogKeys::new(keyring.clone(), UUID);

        let (v1, key1) = redo.latest_or_create().unwrap();
        assert_eq!(v1, 1);

        // Rotate the redo key behind the manager's back.
        keyring
            .generate(&key_name::redo_key_name(UUID), "AES", KEY_LEN)
            .unwrap();

        let loaded_v1 = redo.load_key_version(1).unwrap();
        assert_eq!(*loaded_v1, *key1);
        let loaded_v2 = redo.load_key_version(2).unwrap();
        assert_ne!(*loaded_v2, *key1);

        let (latest_version, latest_key) = redo.latest_or_create().unwrap();
        assert_eq!(latest_version, 2);
        assert_eq!(*latest_key, *loaded_v2);
    }

    #[test]
    fn test_missing_redo_version_fails() {
        let redo = RedoLogKeys::new(Arc::new(MemoryKeyring::new()), UUID);
        assert!(matches!(
            redo.load_key_version(5),
            Err(SystemKeyError::Keyring(KeyringError::NotFound(_)))
        ));
    }
}
