//! Redo-log block encryption and decryption.
//!
//! Log writes arrive as runs of fixed 512 byte blocks; each block is
//! transformed independently with the same two-pass CBC scheme pages use.
//! The header stays plaintext with the encrypted bit set, and in keyring
//! mode the checksum trailer also stays plaintext: the stored checksum
//! becomes `crc(cipher block) + key_version`, so a recovery scan can recover
//! the key version of any block by subtraction and ask the redo-log key
//! manager for that exact key.

use zeroize::Zeroizing;

use super::cipher::{self, AES_BLOCK_SIZE};
use super::{
    LOG_BLOCK_HDR_SIZE, LOG_BLOCK_SIZE, LOG_BLOCK_TRL_SIZE, is_encrypted_log,
    log_block_checksum, log_block_get_checksum, log_block_set_checksum,
    log_block_set_encrypt_bit,
};
use crate::context::{EncryptionContext, EncryptionMode};
use crate::system_key::{REDO_LOG_ENCRYPT_NO_VERSION, RedoLogKeys, SystemKeyError};

const TAIL_WINDOW: usize = 2 * AES_BLOCK_SIZE;

#[derive(Debug, thiserror::Error)]
/// An error that prevented log blocks from being encrypted or decrypted.
pub enum LogCryptError {
    #[error("source and destination buffers differ in size")]
    /// `src` and `dst` must be the same length.
    BufferMismatch,
    #[error("log buffer of {0} bytes is not a whole number of blocks")]
    /// The buffer length must be a multiple of [`LOG_BLOCK_SIZE`].
    BadLength(usize),
    #[error("encryption context has no key material")]
    /// The context mode is `None`.
    ModeNone,
    #[error("encrypted log block reached a context without key material")]
    /// An encrypted block cannot be decrypted in mode `None`.
    MissingKey,
    #[error("log block was encrypted under key version {0} which is unavailable")]
    /// The block's key version could not be resolved.
    KeyVersionUnavailable(u32),
    #[error("aes transform failed: {0}")]
    /// The AES primitive rejected the data.
    Cipher(#[from] cipher::BadData),
    #[error(transparent)]
    /// The redo-log key manager failed to load a key version.
    SystemKey(#[from] SystemKeyError),
}

fn check_buffers(src: &[u8], dst: &[u8]) -> Result<(), LogCryptError> {
    if src.len() != dst.len() {
        return Err(LogCryptError::BufferMismatch);
    }
    if src.len() % LOG_BLOCK_SIZE != 0 {
        return Err(LogCryptError::BadLength(src.len()));
    }
    Ok(())
}

fn payload_len(keyring: bool) -> usize {
    let trailer = if keyring { LOG_BLOCK_TRL_SIZE } else { 0 };
    LOG_BLOCK_SIZE - LOG_BLOCK_HDR_SIZE - trailer
}

fn encrypt_block(
    ctx: &EncryptionContext,
    src: &[u8],
    dst: &mut [u8],
) -> Result<(), LogCryptError> {
    let keyring = ctx.mode() == EncryptionMode::Keyring;
    let data_len = payload_len(keyring);
    let chunk_len = (data_len / AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
    let remain_len = data_len - chunk_len;

    dst[..LOG_BLOCK_HDR_SIZE].copy_from_slice(&src[..LOG_BLOCK_HDR_SIZE]);

    cipher::cbc_encrypt(
        ctx.key(),
        ctx.iv(),
        &src[LOG_BLOCK_HDR_SIZE..LOG_BLOCK_HDR_SIZE + chunk_len],
        &mut dst[LOG_BLOCK_HDR_SIZE..LOG_BLOCK_HDR_SIZE + chunk_len],
    )?;

    if remain_len != 0 {
        dst[LOG_BLOCK_HDR_SIZE + chunk_len..LOG_BLOCK_HDR_SIZE + data_len].copy_from_slice(
            &src[LOG_BLOCK_HDR_SIZE + chunk_len..LOG_BLOCK_HDR_SIZE + data_len],
        );

        let tail = LOG_BLOCK_HDR_SIZE + data_len - TAIL_WINDOW;
        let mut window = Zeroizing::new([0u8; TAIL_WINDOW]);
        window.copy_from_slice(&dst[tail..tail + TAIL_WINDOW]);
        cipher::cbc_encrypt(
            ctx.key(),
            ctx.iv(),
            &window[..],
            &mut dst[tail..tail + TAIL_WINDOW],
        )?;
    }

    if keyring {
        // The trailer stays plaintext; its checksum is rewritten below.
        let trailer = LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE;
        dst[trailer..].copy_from_slice(&src[trailer..]);
    }

    log_block_set_encrypt_bit(dst, true);

    if keyring {
        debug_assert!(ctx.key_version() != REDO_LOG_ENCRYPT_NO_VERSION);
        let crc = log_block_checksum(dst);
        log_block_set_checksum(dst, crc.wrapping_add(ctx.key_version()));
    }

    Ok(())
}

fn decrypt_block(
    ctx: &mut EncryptionContext,
    redo_keys: Option<&RedoLogKeys>,
    src: &[u8],
    dst: &mut [u8],
) -> Result<(), LogCryptError> {
    let keyring = ctx.mode() == EncryptionMode::Keyring;

    if keyring {
        // Recover the key version the block was written under.
        let block_crc = log_block_checksum(src);
        let written_crc = log_block_get_checksum(src);
        let enc_key_version = written_crc.wrapping_sub(block_crc);

        if enc_key_version != ctx.key_version()
            && enc_key_version != REDO_LOG_ENCRYPT_NO_VERSION
        {
            let redo_keys = redo_keys
                .ok_or(LogCryptError::KeyVersionUnavailable(enc_key_version))?;
            let key = redo_keys.load_key_version(enc_key_version)?;
            tracing::info!(
                key_version = enc_key_version,
                "switching redo log decryption key version"
            );
            ctx.swap_key(&key, enc_key_version);
        }
    }

    let data_len = payload_len(keyring);
    let chunk_len = (data_len / AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
    let remain_len = data_len - chunk_len;

    dst.copy_from_slice(src);

    if remain_len != 0 {
        let tail = LOG_BLOCK_HDR_SIZE + data_len - TAIL_WINDOW;
        let mut window = Zeroizing::new([0u8; TAIL_WINDOW]);
        cipher::cbc_decrypt(
            ctx.key(),
            ctx.iv(),
            &src[tail..tail + TAIL_WINDOW],
            &mut window[..],
        )?;

        let boundary = LOG_BLOCK_HDR_SIZE + data_len - TAIL_WINDOW;
        dst[LOG_BLOCK_HDR_SIZE..boundary].copy_from_slice(&src[LOG_BLOCK_HDR_SIZE..boundary]);
        dst[boundary..LOG_BLOCK_HDR_SIZE + chunk_len]
            .copy_from_slice(&window[..TAIL_WINDOW - remain_len]);
        cipher::cbc_decrypt_in_place(
            ctx.key(),
            ctx.iv(),
            &mut dst[LOG_BLOCK_HDR_SIZE..LOG_BLOCK_HDR_SIZE + chunk_len],
        )?;
        dst[LOG_BLOCK_HDR_SIZE + chunk_len..LOG_BLOCK_HDR_SIZE + data_len]
            .copy_from_slice(&window[TAIL_WINDOW - remain_len..]);
    } else {
        cipher::cbc_decrypt(
            ctx.key(),
            ctx.iv(),
            &src[LOG_BLOCK_HDR_SIZE..LOG_BLOCK_HDR_SIZE + chunk_len],
            &mut dst[LOG_BLOCK_HDR_SIZE..LOG_BLOCK_HDR_SIZE + chunk_len],
        )?;
    }

    log_block_set_encrypt_bit(dst, false);

    if keyring {
        // Put the canonical checksum back now that the version stamp is
        // no longer needed.
        let crc = log_block_checksum(dst);
        log_block_set_checksum(dst, crc);
    }

    Ok(())
}

/// Encrypt a run of log blocks from `src` into `dst`.
///
/// On failure the destination holds no usable ciphertext and the error names
/// the block that failed.
pub fn encrypt_log(
    ctx: &EncryptionContext,
    src: &[u8],
    dst: &mut [u8],
) -> Result<(), LogCryptError> {
    check_buffers(src, dst)?;
    if ctx.mode() == EncryptionMode::None {
        return Err(LogCryptError::ModeNone);
    }

    for (src_block, dst_block) in src
        .chunks_exact(LOG_BLOCK_SIZE)
        .zip(dst.chunks_exact_mut(LOG_BLOCK_SIZE))
    {
        encrypt_block(ctx, src_block, dst_block).inspect_err(|error| {
            tracing::error!(%error, "cannot encrypt redo log data");
        })?;
    }
    Ok(())
}

/// Decrypt a run of log blocks from `src` into `dst`.
///
/// Blocks without the encrypted bit pass through unchanged. In keyring mode
/// a block written under a different key version swaps that version's key
/// into the context via `redo_keys` before decrypting.
pub fn decrypt_log(
    ctx: &mut EncryptionContext,
    redo_keys: Option<&RedoLogKeys>,
    src: &[u8],
    dst: &mut [u8],
) -> Result<(), LogCryptError> {
    check_buffers(src, dst)?;

    for (src_block, dst_block) in src
        .chunks_exact(LOG_BLOCK_SIZE)
        .zip(dst.chunks_exact_mut(LOG_BLOCK_SIZE))
    {
        if !is_encrypted_log(src_block) {
            dst_block.copy_from_slice(src_block);
            continue;
        }
        if ctx.mode() == EncryptionMode::None {
            return Err(LogCryptError::MissingKey);
        }
        decrypt_block(ctx, redo_keys, src_block, dst_block)?;
    }
    Ok(())
}
