//! Narrow gateway to the external keyring.
//!
//! All key material enters and leaves the process through this interface.
//! The gateway never caches and never retries; failures from the backend are
//! reported to the caller as-is.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::key_name;

/// Key bytes returned by the keyring; wiped when dropped.
pub type SecretBytes = Zeroizing<Vec<u8>>;

/// Name of the throwaway key used to probe keyring liveness.
pub const KEYRING_TEST_KEY_NAME: &str = "percona_keyring_test";

#[derive(Debug, thiserror::Error)]
/// An error reported by the keyring backend.
pub enum KeyringError {
    #[error("key not found: {0}")]
    /// No key is stored under the requested name.
    NotFound(String),
    #[error("key already exists: {0}")]
    /// A key already exists under the requested name and the backend
    /// refuses to overwrite it.
    AlreadyExists(String),
    #[error("keyring unavailable: {0}")]
    /// The backend could not be reached or failed internally.
    Unavailable(String),
}

/// Capability over an external key-value keyring.
///
/// Implementations must be callable from multiple threads; the engine
/// invokes the gateway from tablespace open/create and rotation paths, never
/// from the page I/O hot path.
pub trait Keyring: Send + Sync + std::fmt::Debug {
    /// Create a new random key of `len` bytes under `name`.
    ///
    /// Generating a name that already exists must not silently overwrite
    /// the stored key.
    fn generate(&self, name: &str, algorithm: &str, len: usize) -> Result<(), KeyringError>;

    /// Fetch the key stored under `name`, returning the raw bytes and the
    /// backend's key type tag (normally `"AES"`).
    fn fetch(&self, name: &str) -> Result<(SecretBytes, String), KeyringError>;

    /// Remove the key stored under `name`.
    fn remove(&self, name: &str) -> Result<(), KeyringError>;
}

/// Probe the keyring by fetching, or failing that generating, a fixed
/// throwaway key. Success means the keyring responds.
pub fn is_alive(keyring: &dyn Keyring) -> bool {
    if keyring.fetch(KEYRING_TEST_KEY_NAME).is_ok() {
        return true;
    }
    keyring
        .generate(KEYRING_TEST_KEY_NAME, "AES", crate::master_key::KEY_LEN)
        .is_ok()
}

#[derive(Debug, Default)]
/// In-process keyring backend.
///
/// Plain names hold a single key and refuse regeneration. System-key names
/// (see [`key_name::is_system_key_name`]) are versioned: regenerating one
/// appends a new version while older versions stay fetchable, fetching the
/// bare name yields the latest version as a `<version>:<key>` blob, and
/// fetching `<name>:<version>` yields that version's raw bytes.
pub struct MemoryKeyring {
    store: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

impl MemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Drop for MemoryKeyring {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        for versions in self.store.get_mut().values_mut() {
            for key in versions.iter_mut() {
                key.zeroize();
            }
        }
    }
}

impl Keyring for MemoryKeyring {
    fn generate(&self, name: &str, _algorithm: &str, len: usize) -> Result<(), KeyringError> {
        let mut store = self.store.lock();
        let mut key = vec![0u8; len];
        OsRng.fill_bytes(&mut key);

        if key_name::is_system_key_name(name) {
            store.entry(name.to_owned()).or_default().push(key);
            return Ok(());
        }

        match store.entry(name.to_owned()) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(KeyringError::AlreadyExists(name.to_owned()))
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(vec![key]);
                Ok(())
            }
        }
    }

    fn fetch(&self, name: &str) -> Result<(SecretBytes, String), KeyringError> {
        let store = self.store.lock();

        // `<name>:<version>` addresses one version of a system key directly.
        if let Some((base, version)) = name.rsplit_once(':') {
            if key_name::is_system_key_name(base) {
                let version: usize = version
                    .parse()
                    .map_err(|_| KeyringError::NotFound(name.to_owned()))?;
                let key = store
                    .get(base)
                    .and_then(|versions| version.checked_sub(1).and_then(|v| versions.get(v)))
                    .ok_or_else(|| KeyringError::NotFound(name.to_owned()))?;
                return Ok((Zeroizing::new(key.clone()), "AES".to_owned()));
            }
        }

        let versions = store
            .get(name)
            .ok_or_else(|| KeyringError::NotFound(name.to_owned()))?;

        if key_name::is_system_key_name(name) {
            let latest = versions.len();
            let key = versions.last().expect("system key entry cannot be empty");
            let mut blob = format!("{latest}:").into_bytes();
            blob.extend_from_slice(key);
            Ok((Zeroizing::new(blob), "AES".to_owned()))
        } else {
            let key = versions.last().expect("key entry cannot be empty");
            Ok((Zeroizing::new(key.clone()), "AES".to_owned()))
        }
    }

    fn remove(&self, name: &str) -> Result<(), KeyringError> {
        use zeroize::Zeroize;
        let mut versions = self
            .store
            .lock()
            .remove(name)
            .ok_or_else(|| KeyringError::NotFound(name.to_owned()))?;
        for key in versions.iter_mut() {
            key.zeroize();
        }
        Ok(())
    }
}
