//! Serialization of per-tablespace encryption metadata.
//!
//! The info blob lives in the tablespace's first page and records which
//! master key wraps the tablespace key:
//!
//! - magic (3 bytes, selects the format version)
//! - master key id (u32 BE)
//! - server uuid (36 bytes, v2/v3 only)
//! - ``key || iv`` wrapped with the master key via AES-256-ECB (64 bytes)
//! - CRC32 of the *plaintext* ``key || iv`` (u32 BE)
//!
//! Three versions decode; v3 is the only emit format. v1 and v2 exist solely
//! to read databases created by older servers: v1 has no uuid and may store
//! the key id as 8 bytes, v2 adds the uuid but keeps the legacy id padding.
//! A fixed-length variant (`lRB`) records redo-log keyring metadata.

use zeroize::Zeroizing;

use super::cipher;
use crate::key_name::SERVER_UUID_LEN;
use crate::master_key::{
    DEFAULT_MASTER_KEY_ID, KEY_LEN, KeyBytes, MasterKeyError, MasterKeyManager,
    default_master_key,
};

/// Size of the version magic.
pub const MAGIC_SIZE: usize = 3;

const KEY_MAGIC_V1: &[u8; MAGIC_SIZE] = b"lCA";
const KEY_MAGIC_V2: &[u8; MAGIC_SIZE] = b"lCB";
const KEY_MAGIC_V3: &[u8; MAGIC_SIZE] = b"lCC";
const KEY_MAGIC_RK_V2: &[u8; MAGIC_SIZE] = b"lRB";

/// Size of a v3 encryption info blob.
pub const INFO_SIZE: usize = MAGIC_SIZE + 4 + SERVER_UUID_LEN + KEY_LEN * 2 + 4;

/// Upper bound on any decodable info blob: v1/v2 may carry a 4 byte legacy
/// id padding.
pub const INFO_MAX_SIZE: usize = INFO_SIZE + 4;

/// Size of a redo-log encryption info blob.
pub const REDO_INFO_SIZE: usize = MAGIC_SIZE + 4 + SERVER_UUID_LEN + KEY_LEN + 4;

/// CRC of the redo info covers this many leading bytes of the blob.
const REDO_INFO_CRC_LEN: usize = KEY_LEN;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// Encryption info format version, selected by the magic bytes.
pub enum InfoVersion {
    V1,
    V2,
    V3,
}

#[derive(Debug, thiserror::Error)]
/// An error that prevented encryption info from being encoded.
pub enum FillInfoError {
    #[error(transparent)]
    /// The master key could not be resolved.
    MasterKey(#[from] MasterKeyError),
    #[error("failed to wrap tablespace key: {0}")]
    /// The AES primitive rejected the key material.
    Cipher(cipher::BadData),
}

#[derive(Debug, thiserror::Error)]
/// An error that prevented encryption info from being decoded.
pub enum DecodeInfoError {
    #[error("unrecognized encryption info magic")]
    /// The blob does not start with any known magic.
    BadMagic,
    #[error("encryption info too short")]
    /// The blob is shorter than its format version requires.
    TooShort,
    #[error("encryption info checksum mismatch, has the key file been changed?")]
    /// The CRC over the unwrapped ``key || iv`` does not match the stored
    /// value: either the keyring returned the wrong master key or the blob
    /// was tampered with.
    Corrupt,
    #[error("plaintext key info requires a v3 blob")]
    /// Only v3 blobs may carry an unwrapped tablespace key.
    PlaintextNeedsV3,
    #[error(transparent)]
    /// The master key could not be resolved.
    MasterKey(#[from] MasterKeyError),
    #[error("failed to unwrap tablespace key: {0}")]
    /// The AES primitive rejected the wrapped region.
    Cipher(cipher::BadData),
}

#[derive(Debug)]
/// Outcome of decoding an encryption info blob.
pub enum DecodedInfo {
    /// The blob decoded to a tablespace key and IV.
    Decoded {
        key: KeyBytes,
        iv: KeyBytes,
        master_key_id: u32,
        version: InfoVersion,
    },
    /// The blob carries no recognizable info. Only reported during
    /// recovery, where the info may simply never have been flushed.
    NotPresent,
}

fn write_uuid(out: &mut [u8], uuid: &str) {
    let bytes = uuid.as_bytes();
    let len = bytes.len().min(SERVER_UUID_LEN);
    out[..len].copy_from_slice(&bytes[..len]);
}

fn read_uuid(buf: &[u8]) -> String {
    let end = buf[..SERVER_UUID_LEN]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(SERVER_UUID_LEN);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Encode the encryption info for a tablespace, always in the v3 format.
///
/// For bootstrap tablespaces (or before the server uuid exists) the
/// hard-coded default master key is used and the stored master key id is 0.
/// `encrypt_key = false` stores the ``key || iv`` pair unwrapped; only the
/// clone path does that.
pub fn fill_encryption_info(
    manager: &MasterKeyManager,
    key: &[u8; KEY_LEN],
    iv: &[u8; KEY_LEN],
    is_boot: bool,
    encrypt_key: bool,
) -> Result<[u8; INFO_SIZE], FillInfoError> {
    let mut master_key_id = DEFAULT_MASTER_KEY_ID;
    let mut master_key = None;

    if encrypt_key {
        if is_boot || manager.server_uuid().is_empty() {
            master_key = Some(default_master_key());
            manager.mark_default_master_key_used();
        } else {
            let (id, resolved) = manager.get_or_create()?;
            master_key_id = id;
            master_key = Some(resolved);
        }
    }

    let mut info = [0u8; INFO_SIZE];
    info[..MAGIC_SIZE].copy_from_slice(KEY_MAGIC_V3);
    info[MAGIC_SIZE..MAGIC_SIZE + 4].copy_from_slice(&master_key_id.to_be_bytes());

    let uuid_offset = MAGIC_SIZE + 4;
    write_uuid(&mut info[uuid_offset..], &manager.current_uuid());

    let mut key_info = Zeroizing::new([0u8; KEY_LEN * 2]);
    key_info[..KEY_LEN].copy_from_slice(key);
    key_info[KEY_LEN..].copy_from_slice(iv);

    let wrapped_offset = uuid_offset + SERVER_UUID_LEN;
    let wrapped = &mut info[wrapped_offset..wrapped_offset + KEY_LEN * 2];
    if encrypt_key {
        let master_key = master_key.as_ref().expect("master key resolved above");
        cipher::ecb_encrypt(master_key, &key_info[..], wrapped)
            .map_err(FillInfoError::Cipher)?;
    } else {
        // Keep the tablespace key unencrypted. Used by clone.
        wrapped.copy_from_slice(&key_info[..]);
    }

    // The checksum always covers the plaintext pair, so a wrong master key
    // and a tampered blob fail the same check.
    let crc = crc32fast::hash(&key_info[..]);
    info[INFO_SIZE - 4..].copy_from_slice(&crc.to_be_bytes());

    Ok(info)
}

/// Resolve the master key an info blob was wrapped with.
///
/// Returns the key together with the offset of the wrapped region and the
/// uuid stored in the blob, if the version carries one.
fn master_key_from_info(
    manager: &MasterKeyManager,
    blob: &[u8],
    version: InfoVersion,
) -> Result<(KeyBytes, usize, Option<String>, u32), DecodeInfoError> {
    if blob.len() < MAGIC_SIZE + 8 + SERVER_UUID_LEN {
        return Err(DecodeInfoError::TooShort);
    }

    let mut offset = MAGIC_SIZE;
    let master_key_id = super::read_u32(blob, offset);
    offset += 4;

    // v1 and v2 blobs may store the key id as 8 bytes; the high word is
    // always zero.
    if version != InfoVersion::V3 && super::read_u32(blob, offset) == 0 {
        offset += 4;
    }

    match version {
        InfoVersion::V1 => {
            let key = manager.get(master_key_id, None)?;
            Ok((key, offset, None, master_key_id))
        }
        InfoVersion::V2 => {
            let uuid = read_uuid(&blob[offset..]);
            offset += SERVER_UUID_LEN;
            if uuid.is_empty() {
                return Err(DecodeInfoError::Corrupt);
            }
            let key = manager.get(master_key_id, Some(&uuid))?;
            Ok((key, offset, Some(uuid), master_key_id))
        }
        InfoVersion::V3 => {
            let uuid = read_uuid(&blob[offset..]);
            offset += SERVER_UUID_LEN;
            if master_key_id == DEFAULT_MASTER_KEY_ID {
                // Bootstrap info, wrapped with the default master key.
                Ok((default_master_key(), offset, Some(uuid), master_key_id))
            } else {
                if uuid.is_empty() {
                    return Err(DecodeInfoError::Corrupt);
                }
                let key = manager.get(master_key_id, Some(&uuid))?;
                Ok((key, offset, Some(uuid), master_key_id))
            }
        }
    }
}

/// Decode the encryption info from the first page of a tablespace.
///
/// During recovery an unrecognized magic is not an error, since the info may
/// simply not have been flushed yet; it decodes to
/// [`DecodedInfo::NotPresent`].
pub fn decode_encryption_info(
    manager: &MasterKeyManager,
    blob: &[u8],
    decrypt_key: bool,
    in_recovery: bool,
) -> Result<DecodedInfo, DecodeInfoError> {
    if blob.len() < MAGIC_SIZE {
        return Err(DecodeInfoError::TooShort);
    }

    let version = if blob[..MAGIC_SIZE] == *KEY_MAGIC_V1 {
        InfoVersion::V1
    } else if blob[..MAGIC_SIZE] == *KEY_MAGIC_V2 {
        InfoVersion::V2
    } else if blob[..MAGIC_SIZE] == *KEY_MAGIC_V3 {
        InfoVersion::V3
    } else {
        if in_recovery {
            return Ok(DecodedInfo::NotPresent);
        }
        tracing::error!("failed to decode encryption information, unexpected version");
        return Err(DecodeInfoError::BadMagic);
    };

    let mut key_info = Zeroizing::new([0u8; KEY_LEN * 2]);
    let wrapped_offset;
    let master_key_id;
    let mut uuid = None;

    if decrypt_key {
        let (master_key, offset, blob_uuid, id) =
            master_key_from_info(manager, blob, version)?;
        if blob.len() < offset + KEY_LEN * 2 + 4 {
            return Err(DecodeInfoError::TooShort);
        }
        cipher::ecb_decrypt(
            &master_key,
            &blob[offset..offset + KEY_LEN * 2],
            &mut key_info[..],
        )
        .map_err(DecodeInfoError::Cipher)?;
        wrapped_offset = offset;
        master_key_id = id;
        uuid = blob_uuid;
    } else {
        // Unwrapped info is only ever written in the v3 layout.
        if version != InfoVersion::V3 {
            return Err(DecodeInfoError::PlaintextNeedsV3);
        }
        let offset = MAGIC_SIZE + 4 + SERVER_UUID_LEN;
        if blob.len() < offset + KEY_LEN * 2 + 4 {
            return Err(DecodeInfoError::TooShort);
        }
        key_info.copy_from_slice(&blob[offset..offset + KEY_LEN * 2]);
        wrapped_offset = offset;
        master_key_id = super::read_u32(blob, MAGIC_SIZE);
    }

    let stored_crc = super::read_u32(blob, wrapped_offset + KEY_LEN * 2);
    let actual_crc = crc32fast::hash(&key_info[..]);
    if stored_crc != actual_crc {
        tracing::error!(
            "failed to decrypt encryption information, please check whether \
             the key file has been changed"
        );
        return Err(DecodeInfoError::Corrupt);
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    let mut iv = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&key_info[..KEY_LEN]);
    iv.copy_from_slice(&key_info[KEY_LEN..]);

    if decrypt_key {
        // Catch up after restart: the blob may carry a newer master key id
        // than the in-memory state. v1 blobs have no uuid and never touch
        // the current one.
        manager.observe_decoded(master_key_id, uuid.as_deref());
    }

    Ok(DecodedInfo::Decoded {
        key,
        iv,
        master_key_id,
        version,
    })
}

#[derive(Debug, thiserror::Error)]
/// An error raised while re-wrapping tablespace info after rotation.
pub enum RewrapError {
    #[error(transparent)]
    /// A blob failed to decode under its recorded master key.
    Decode(#[from] DecodeInfoError),
    #[error(transparent)]
    /// A blob failed to re-encode under the current master key.
    Fill(#[from] FillInfoError),
}

/// Re-wrap every tablespace's encryption info under the current master key.
///
/// Called after [`MasterKeyManager::rotate`]; each blob is decoded with the
/// master key it names and re-encoded as v3 under the current one, which
/// also upgrades v1/v2 blobs in place. Returns the number of re-wrapped
/// blobs.
pub fn rewrap_all<'a, I>(manager: &MasterKeyManager, blobs: I) -> Result<usize, RewrapError>
where
    I: IntoIterator<Item = &'a mut [u8]>,
{
    let mut rewrapped = 0;
    for blob in blobs {
        if blob.len() < INFO_SIZE {
            return Err(RewrapError::Decode(DecodeInfoError::TooShort));
        }
        let decoded = decode_encryption_info(manager, blob, true, false)?;
        let DecodedInfo::Decoded { key, iv, .. } = decoded else {
            continue;
        };
        let fresh = fill_encryption_info(manager, &key, &iv, false, true)?;
        blob[..INFO_SIZE].copy_from_slice(&fresh);
        // Clear any legacy padding left over from a v1/v2 layout.
        blob[INFO_SIZE..].fill(0);
        rewrapped += 1;
    }
    Ok(rewrapped)
}

#[derive(Debug)]
/// Redo-log keyring metadata decoded from the log header.
pub struct RedoLogInfo {
    pub key_version: u32,
    pub server_uuid: String,
    pub iv: [u8; KEY_LEN],
}

/// Encode the redo-log encryption info.
pub fn fill_redo_log_info(
    key_version: u32,
    server_uuid: &str,
    iv: &[u8; KEY_LEN],
) -> [u8; REDO_INFO_SIZE] {
    let mut info = [0u8; REDO_INFO_SIZE];
    info[..MAGIC_SIZE].copy_from_slice(KEY_MAGIC_RK_V2);
    info[MAGIC_SIZE..MAGIC_SIZE + 4].copy_from_slice(&key_version.to_be_bytes());

    let uuid_offset = MAGIC_SIZE + 4;
    write_uuid(&mut info[uuid_offset..], server_uuid);

    let iv_offset = uuid_offset + SERVER_UUID_LEN;
    info[iv_offset..iv_offset + KEY_LEN].copy_from_slice(iv);

    let crc = crc32fast::hash(&info[..REDO_INFO_CRC_LEN]);
    info[REDO_INFO_SIZE - 4..].copy_from_slice(&crc.to_be_bytes());
    info
}

/// Decode the redo-log encryption info.
pub fn decode_redo_log_info(blob: &[u8]) -> Result<RedoLogInfo, DecodeInfoError> {
    if blob.len() < REDO_INFO_SIZE {
        return Err(DecodeInfoError::TooShort);
    }
    if blob[..MAGIC_SIZE] != *KEY_MAGIC_RK_V2 {
        return Err(DecodeInfoError::BadMagic);
    }

    let stored_crc = super::read_u32(blob, REDO_INFO_SIZE - 4);
    let actual_crc = crc32fast::hash(&blob[..REDO_INFO_CRC_LEN]);
    if stored_crc != actual_crc {
        tracing::error!("redo log encryption information is corrupt");
        return Err(DecodeInfoError::Corrupt);
    }

    let key_version = super::read_u32(blob, MAGIC_SIZE);
    let uuid_offset = MAGIC_SIZE + 4;
    let server_uuid = read_uuid(&blob[uuid_offset..]);

    let iv_offset = uuid_offset + SERVER_UUID_LEN;
    let mut iv = [0u8; KEY_LEN];
    iv.copy_from_slice(&blob[iv_offset..iv_offset + KEY_LEN]);

    Ok(RedoLogInfo {
        key_version,
        server_uuid,
        iv,
    })
}
