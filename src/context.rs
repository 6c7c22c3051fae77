//! Per-tablespace encryption state.
//!
//! An [`EncryptionContext`] is created when a tablespace is opened or
//! created, owned by the tablespace handle and shared read-only with the I/O
//! workers encrypting its pages. Mode changes and key rotation build a new
//! context and publish it under the tablespace latch; the hot path never
//! mutates a shared context. Key material is wiped when the context drops.

use std::str::FromStr;

use zeroize::Zeroizing;

use crate::master_key::KEY_LEN;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// How a tablespace is encrypted.
pub enum EncryptionMode {
    /// No encryption.
    None,
    /// Master-key wrapped tablespace key, AES-256-CBC pages.
    Aes,
    /// Keyring-versioned system key, AES-256-CBC pages with key-version
    /// stamping.
    Keyring,
}

impl EncryptionMode {
    /// The value this mode takes in the `ENCRYPTION=` table option.
    pub fn as_ddl_str(&self) -> &'static str {
        match self {
            EncryptionMode::None => "N",
            EncryptionMode::Aes => "Y",
            EncryptionMode::Keyring => "KEYRING",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported encryption mode: {0}")]
/// The `ENCRYPTION=` option value is not one of `N`, `Y` or `KEYRING`.
pub struct UnsupportedMode(String);

impl FromStr for EncryptionMode {
    type Err = UnsupportedMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "N" | "n" | "" => Ok(EncryptionMode::None),
            "Y" | "y" => Ok(EncryptionMode::Aes),
            "KEYRING" | "keyring" => Ok(EncryptionMode::Keyring),
            other => Err(UnsupportedMode(other.to_owned())),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// Whether the tablespace is mid-way through an encryption migration.
pub enum EncryptionRotation {
    /// Steady state.
    None,
    /// Pages are being re-encrypted from master-key mode to keyring mode;
    /// keyring-encrypted pages carry a post-encryption checksum until the
    /// migration finishes.
    MasterKeyToKeyring,
}

/// Per-tablespace key material and mode, snapshot at open time.
pub struct EncryptionContext {
    mode: EncryptionMode,
    key: Zeroizing<[u8; KEY_LEN]>,
    iv: Zeroizing<[u8; KEY_LEN]>,
    key_version: u32,
    key_id: u32,
    key_id_uuid: String,
    rotation: EncryptionRotation,
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("EncryptionContext")
            .field("mode", &self.mode)
            .field("key_version", &self.key_version)
            .field("key_id", &self.key_id)
            .field("rotation", &self.rotation)
            .finish_non_exhaustive()
    }
}

impl Default for EncryptionContext {
    fn default() -> Self {
        Self::unencrypted()
    }
}

impl EncryptionContext {
    /// A context for a tablespace with encryption disabled.
    pub fn unencrypted() -> Self {
        Self {
            mode: EncryptionMode::None,
            key: Zeroizing::new([0u8; KEY_LEN]),
            iv: Zeroizing::new([0u8; KEY_LEN]),
            key_version: 0,
            key_id: 0,
            key_id_uuid: String::new(),
            rotation: EncryptionRotation::None,
        }
    }

    /// Install key material and switch the context to `mode`.
    pub fn set_encryption(
        &mut self,
        mode: EncryptionMode,
        key: &[u8; KEY_LEN],
        iv: &[u8; KEY_LEN],
    ) {
        self.mode = mode;
        self.key.copy_from_slice(key);
        self.iv.copy_from_slice(iv);
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub(crate) fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub(crate) fn iv(&self) -> &[u8; KEY_LEN] {
        &self.iv
    }

    /// The keyring key version pages are stamped with.
    pub fn key_version(&self) -> u32 {
        self.key_version
    }

    pub fn set_key_version(&mut self, key_version: u32) {
        self.key_version = key_version;
    }

    /// Swap in a different key version mid-decrypt (redo recovery only).
    pub(crate) fn swap_key(&mut self, key: &[u8; KEY_LEN], key_version: u32) {
        self.key.copy_from_slice(key);
        self.key_version = key_version;
    }

    /// The system key id this tablespace encrypts under (keyring mode).
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn set_key_id(&mut self, key_id: u32) {
        self.key_id = key_id;
    }

    /// The uuid scoping this tablespace's key names.
    pub fn key_id_uuid(&self) -> &str {
        &self.key_id_uuid
    }

    pub fn set_key_id_uuid(&mut self, uuid: impl Into<String>) {
        self.key_id_uuid = uuid.into();
    }

    pub fn rotation(&self) -> EncryptionRotation {
        self.rotation
    }

    pub fn set_rotation(&mut self, rotation: EncryptionRotation) {
        self.rotation = rotation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_mode_roundtrip() {
        for (value, mode) in [
            ("N", EncryptionMode::None),
            ("Y", EncryptionMode::Aes),
            ("KEYRING", EncryptionMode::Keyring),
        ] {
            let parsed: EncryptionMode = value.parse().unwrap();
            assert_eq!(parsed, mode);
            assert_eq!(mode.as_ddl_str(), value);
        }

        assert!("AES256".parse::<EncryptionMode>().is_err());
    }

    #[test]
    fn test_set_encryption_installs_material() {
        let mut ctx = EncryptionContext::unencrypted();
        assert_eq!(ctx.mode(), EncryptionMode::None);

        let key = [0x0Fu8; KEY_LEN];
        let iv = [0xF0u8; KEY_LEN];
        ctx.set_encryption(EncryptionMode::Keyring, &key, &iv);
        ctx.set_key_version(3);
        ctx.set_key_id(0);
        ctx.set_key_id_uuid("00000000-0000-0000-0000-000000000001");

        assert_eq!(ctx.mode(), EncryptionMode::Keyring);
        assert_eq!(ctx.key(), &key);
        assert_eq!(ctx.iv(), &iv);
        assert_eq!(ctx.key_version(), 3);
        assert_eq!(ctx.rotation(), EncryptionRotation::None);
    }
}
