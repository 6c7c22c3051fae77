//! Transparent data-at-rest encryption for a page-based storage engine.
//!
//! Every byte written to or read from the data and redo-log files passes
//! through this crate. It maintains the master-key hierarchy held in an
//! external keyring, derives and persists per-tablespace keys and IVs, and
//! transforms fixed-size pages and 512 byte log blocks in place during I/O.
//!
//! The crate deliberately stays narrow: the keyring backend, the buffer
//! pool, file I/O, the redo-log writer and the DDL surface are external
//! collaborators that drive the operations exposed here.

pub mod context;
pub mod key_name;
pub mod keyring;
pub mod layout;
pub mod master_key;
pub mod system_key;

pub use self::context::{EncryptionContext, EncryptionMode, EncryptionRotation};
pub use self::keyring::{Keyring, KeyringError, MemoryKeyring, SecretBytes};
pub use self::layout::info::{
    DecodedInfo, InfoVersion, decode_encryption_info, decode_redo_log_info,
    fill_encryption_info, fill_redo_log_info, rewrap_all,
};
pub use self::layout::log::{decrypt_log, encrypt_log};
pub use self::layout::page::{decrypt_page, encrypt_page};
pub use self::master_key::{KEY_LEN, MasterKeyError, MasterKeyManager};
pub use self::system_key::RedoLogKeys;
