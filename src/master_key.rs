//! Process-wide master key lifecycle.
//!
//! The engine owns a single [`MasterKeyManager`]; the current master key id
//! and uuid live behind one mutex. The id only ever moves forward within a
//! running process; a fetch failure after the id advanced does not rewind
//! it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::key_name;
use crate::keyring::{Keyring, KeyringError, SecretBytes};

/// Length of every symmetric key handled by the core.
pub const KEY_LEN: usize = 32;

/// Master key id before any rotation has happened on this instance.
pub const DEFAULT_MASTER_KEY_ID: u32 = 0;

/// Hard-coded master key used while bootstrap tablespaces exist but the
/// server uuid does not yet.
pub const DEFAULT_MASTER_KEY: &str = "DefaultMasterKey";

/// A 32 byte key; wiped when dropped.
pub type KeyBytes = Zeroizing<[u8; KEY_LEN]>;

/// The master key used for bootstrap tablespaces, zero padded to
/// [`KEY_LEN`].
pub fn default_master_key() -> KeyBytes {
    let mut key = [0u8; KEY_LEN];
    key[..DEFAULT_MASTER_KEY.len()].copy_from_slice(DEFAULT_MASTER_KEY.as_bytes());
    Zeroizing::new(key)
}

pub(crate) fn key_from_bytes(name: &str, bytes: SecretBytes) -> Result<KeyBytes, MasterKeyError> {
    if bytes.len() != KEY_LEN {
        return Err(MasterKeyError::BadKeyLength {
            name: name.to_owned(),
            len: bytes.len(),
        });
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(Zeroizing::new(key))
}

#[derive(Debug, thiserror::Error)]
/// An error raised while resolving or rotating a master key.
pub enum MasterKeyError {
    #[error(transparent)]
    /// The keyring reported a failure.
    Keyring(#[from] KeyringError),
    #[error("master key {name} has unexpected length {len}")]
    /// The keyring returned a key that is not [`KEY_LEN`] bytes.
    BadKeyLength { name: String, len: usize },
}

#[derive(Debug)]
struct MasterKeyState {
    current_id: u32,
    current_uuid: String,
}

#[derive(Debug)]
/// Owner of the process-wide `(current_master_key_id, current_uuid)` pair.
pub struct MasterKeyManager {
    keyring: Arc<dyn Keyring>,
    server_uuid: String,
    server_id: u32,
    state: Mutex<MasterKeyState>,
    default_key_used: AtomicBool,
    alive_checked: AtomicBool,
}

impl MasterKeyManager {
    /// Create a manager for this server instance.
    ///
    /// `server_uuid` scopes every key name generated from now on; changing
    /// it orphans keys created under the previous uuid. `server_id` is only
    /// used to look up keys written by servers that predate uuid scoping.
    pub fn new(keyring: Arc<dyn Keyring>, server_uuid: impl Into<String>, server_id: u32) -> Self {
        Self {
            keyring,
            server_uuid: server_uuid.into(),
            server_id,
            state: Mutex::new(MasterKeyState {
                current_id: DEFAULT_MASTER_KEY_ID,
                current_uuid: String::new(),
            }),
            default_key_used: AtomicBool::new(false),
            alive_checked: AtomicBool::new(false),
        }
    }

    /// The server uuid this manager scopes new keys with.
    pub fn server_uuid(&self) -> &str {
        &self.server_uuid
    }

    /// The current master key id.
    pub fn current_master_key_id(&self) -> u32 {
        self.state.lock().current_id
    }

    /// The uuid the current master key is scoped by.
    pub fn current_uuid(&self) -> String {
        self.state.lock().current_uuid.clone()
    }

    /// Whether any encryption info was ever written under the bootstrap
    /// default master key.
    pub fn default_master_key_used(&self) -> bool {
        self.default_key_used.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_default_master_key_used(&self) {
        self.default_key_used.store(true, Ordering::Relaxed);
    }

    fn fetch_key(&self, name: &str) -> Result<KeyBytes, MasterKeyError> {
        let (bytes, _key_type) = self.keyring.fetch(name)?;
        key_from_bytes(name, bytes)
    }

    /// Return the current master key, creating the very first one if no
    /// rotation has ever happened on this instance.
    pub fn get_or_create(&self) -> Result<(u32, KeyBytes), MasterKeyError> {
        let mut state = self.state.lock();

        if state.current_id == DEFAULT_MASTER_KEY_ID {
            // First encrypted tablespace on this instance: generate master
            // key 1 under the server uuid.
            let name = key_name::master_key_name(&self.server_uuid, 1);
            if let Err(error) = self.keyring.generate(&name, "AES", KEY_LEN) {
                // A leftover key from an earlier run is fine; fetch decides.
                tracing::warn!(%name, %error, "master key generate failed");
            }
            let key = self.fetch_key(&name)?;
            state.current_id = 1;
            state.current_uuid = self.server_uuid.clone();
            return Ok((1, key));
        }

        let id = state.current_id;
        let name = key_name::master_key_name(&state.current_uuid, id);
        match self.fetch_key(&name) {
            Ok(key) => Ok((id, key)),
            Err(_) => {
                // 5.7.11 compatibility: retry with the server-id based name.
                let legacy = key_name::legacy_master_key_name(self.server_id, id);
                self.fetch_key(&legacy).map(|key| (id, key)).map_err(|error| {
                    tracing::error!(
                        %name,
                        "master key not found, check that the keyring plugin is loaded"
                    );
                    error
                })
            }
        }
    }

    /// Fetch a specific master key for decryption.
    ///
    /// `uuid == None` means the encryption info predates uuid scoping and
    /// the legacy `server_id` based name is used.
    pub fn get(&self, master_key_id: u32, uuid: Option<&str>) -> Result<KeyBytes, MasterKeyError> {
        let name = match uuid {
            Some(uuid) => {
                debug_assert!(!uuid.is_empty());
                key_name::master_key_name(uuid, master_key_id)
            }
            None => key_name::legacy_master_key_name(self.server_id, master_key_id),
        };
        self.fetch_key(&name).map_err(|error| {
            tracing::error!(
                %name,
                "master key not found, check that the keyring plugin is loaded"
            );
            error
        })
    }

    /// Generate the next master key and advance the current id.
    ///
    /// The new key is fetched back before the id advances so a dead keyring
    /// cannot move the id past a key that does not exist. After a successful
    /// rotation every encrypted tablespace must be re-wrapped, see
    /// [`crate::layout::info::rewrap_all`].
    pub fn rotate(&self) -> Result<u32, MasterKeyError> {
        let mut state = self.state.lock();

        if state.current_uuid != self.server_uuid {
            state.current_uuid = self.server_uuid.clone();
        }

        let next_id = state.current_id + 1;
        let name = key_name::master_key_name(&state.current_uuid, next_id);
        if let Err(error) = self.keyring.generate(&name, "AES", KEY_LEN) {
            tracing::warn!(%name, %error, "master key generate failed");
        }
        self.fetch_key(&name)?;

        state.current_id = next_id;
        tracing::info!(master_key_id = next_id, "rotated master key");
        Ok(next_id)
    }

    /// Sanity probe that the keyring holds (or can hold) our master key.
    ///
    /// Before the first rotation this generates, fetches and removes a dummy
    /// key; the result is latched so the dance runs at most once. Afterwards
    /// it fetches the current master key.
    pub fn check_alive(&self) -> bool {
        let (id, uuid) = {
            let state = self.state.lock();
            (state.current_id, state.current_uuid.clone())
        };

        if id == DEFAULT_MASTER_KEY_ID {
            if self.alive_checked.load(Ordering::Relaxed) {
                return true;
            }
            if let Err(error) = self.keyring.generate(DEFAULT_MASTER_KEY, "AES", KEY_LEN) {
                tracing::warn!(%error, "keyring probe generate failed");
            }
            let ok = self.keyring.fetch(DEFAULT_MASTER_KEY).is_ok();
            if ok {
                let _ = self.keyring.remove(DEFAULT_MASTER_KEY);
                self.alive_checked.store(true, Ordering::Relaxed);
            } else {
                tracing::error!("keyring probe failed, check that the keyring plugin is loaded");
            }
            ok
        } else {
            self.fetch_key(&key_name::master_key_name(&uuid, id)).is_ok()
        }
    }

    /// Catch up with encryption info decoded from disk.
    ///
    /// After a restart the first decoded tablespace may carry a newer master
    /// key id than the in-memory default; adopt it so new info blobs keep
    /// using the newest key. Never moves the id backwards.
    pub fn observe_decoded(&self, master_key_id: u32, uuid: Option<&str>) {
        let mut state = self.state.lock();
        if master_key_id > state.current_id {
            state.current_id = master_key_id;
            if let Some(uuid) = uuid {
                state.current_uuid = uuid.to_owned();
            }
        }
    }
}
