//! Page encryption and decryption.
//!
//! A page is transformed between separate source and destination buffers of
//! identical size; ciphertext length always equals plaintext length. The
//! header is carried verbatim apart from the page-type bookkeeping, and only
//! the data region goes through AES-256-CBC.
//!
//! CBC needs block-aligned input but page payloads rarely are, so both
//! directions use a two-pass scheme: transform the block-aligned prefix,
//! copy the residual tail through, then re-transform the last two blocks of
//! the data region in place. Decryption runs the passes in reverse: the
//! trailing two ciphertext blocks decode to the missing middle ciphertext
//! plus the residual plaintext.

use zeroize::Zeroizing;

use super::cipher::{self, AES_BLOCK_SIZE};
use super::{
    FIL_PAGE_COMPRESS_SIZE_V1, FIL_PAGE_COMPRESSED, FIL_PAGE_COMPRESSED_AND_ENCRYPTED,
    FIL_PAGE_DATA, FIL_PAGE_ENCRYPTED, FIL_PAGE_ENCRYPTED_RTREE,
    FIL_PAGE_ENCRYPTION_KEY_VERSION, FIL_PAGE_LSN, FIL_PAGE_ORIGINAL_TYPE_V1,
    FIL_PAGE_RTREE, FIL_PAGE_TYPE, is_encrypted_page, read_u16, write_u16, write_u32,
};
use crate::context::{EncryptionContext, EncryptionMode, EncryptionRotation};

/// Smallest data span the cryptor will encrypt; shorter compressed payloads
/// are extended to this length.
pub const MIN_ENCRYPTION_LEN: usize = 2 * AES_BLOCK_SIZE + FIL_PAGE_DATA;

/// Bytes reserved after the header of a keyring-encrypted compressed page
/// for the post-encryption checksum and key version.
const KEYRING_COMPRESSED_RESERVED: usize = 8;

/// Width of the re-encrypted trailing window.
const TAIL_WINDOW: usize = 2 * AES_BLOCK_SIZE;

#[derive(Debug, thiserror::Error)]
/// An error that prevented a page from being encrypted.
///
/// The destination buffer holds no usable ciphertext after a failure; the
/// source is untouched.
pub enum PageEncryptError {
    #[error("source and destination buffers differ in size")]
    /// `src` and `dst` must be the same length.
    BufferMismatch,
    #[error("page is already encrypted")]
    /// Encrypting an encrypted page would destroy the key bookkeeping.
    AlreadyEncrypted,
    #[error("encryption context has no key material")]
    /// The context mode is `None`.
    ModeNone,
    #[error("page of {0} bytes is too small to encrypt")]
    /// The page cannot hold the minimum encryptable span.
    TooSmall(usize),
    #[error("compressed payload length exceeds the page")]
    /// The stored compressed size points past the end of the page.
    CompressedPayloadOutOfBounds,
    #[error("aes encrypt failed: {0}")]
    /// The AES primitive rejected the data.
    Cipher(#[from] cipher::BadData),
}

#[derive(Debug, thiserror::Error)]
/// An error that prevented a page from being decrypted.
pub enum PageDecryptError {
    #[error("source and destination buffers differ in size")]
    /// `src` and `dst` must be the same length.
    BufferMismatch,
    #[error("page is encrypted but the context holds no key")]
    /// An encrypted page reached a context whose mode is `None`.
    MissingKey,
    #[error("page of {0} bytes is too small to decrypt")]
    /// The page cannot hold the minimum encryptable span.
    TooSmall(usize),
    #[error("compressed payload length exceeds the page")]
    /// The stored compressed size points past the end of the page.
    CompressedPayloadOutOfBounds,
    #[error("aes decrypt failed: {0}")]
    /// The AES primitive rejected the data.
    Cipher(#[from] cipher::BadData),
}

/// CRC32 stamped on keyring pages while a master-key tablespace is being
/// migrated to keyring encryption; covers the ciphertext region only.
fn post_encryption_checksum(dst: &[u8], cipher_start: usize, data_len: usize) -> u32 {
    crc32fast::hash(&dst[cipher_start..cipher_start + data_len])
}

/// Encrypt a plaintext page from `src` into `dst`.
pub fn encrypt_page(
    ctx: &EncryptionContext,
    src: &[u8],
    dst: &mut [u8],
) -> Result<(), PageEncryptError> {
    if src.len() != dst.len() {
        return Err(PageEncryptError::BufferMismatch);
    }
    if is_encrypted_page(src) {
        return Err(PageEncryptError::AlreadyEncrypted);
    }
    if ctx.mode() == EncryptionMode::None {
        return Err(PageEncryptError::ModeNone);
    }

    let src_len = src.len();
    if src_len < MIN_ENCRYPTION_LEN {
        return Err(PageEncryptError::TooSmall(src_len));
    }

    let page_type = read_u16(src, FIL_PAGE_TYPE);
    let compressed = page_type == FIL_PAGE_COMPRESSED;
    let keyring = ctx.mode() == EncryptionMode::Keyring;

    // Compressed pages only encrypt the stored payload, never the garbage
    // beyond it.
    let mut src_enc_len = src_len;
    if compressed {
        src_enc_len = read_u16(src, FIL_PAGE_COMPRESS_SIZE_V1) as usize + FIL_PAGE_DATA;
        if src_enc_len < MIN_ENCRYPTION_LEN {
            src_enc_len = MIN_ENCRYPTION_LEN;
        }
        let reserved = if keyring { KEYRING_COMPRESSED_RESERVED } else { 0 };
        if src_enc_len + reserved > src_len {
            return Err(PageEncryptError::CompressedPayloadOutOfBounds);
        }
    }

    let dst_header = if keyring && compressed {
        FIL_PAGE_DATA + KEYRING_COMPRESSED_RESERVED
    } else {
        FIL_PAGE_DATA
    };

    let data_len = if keyring && !compressed {
        // The trailing 4 bytes duplicate the LSN in the header; leave them
        // plaintext and re-derive them on decrypt.
        src_enc_len - FIL_PAGE_DATA - 4
    } else {
        src_enc_len - FIL_PAGE_DATA
    };
    if data_len < TAIL_WINDOW {
        return Err(PageEncryptError::TooSmall(src_len));
    }

    let chunk_len = (data_len / AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
    let remain_len = data_len - chunk_len;

    cipher::cbc_encrypt(
        ctx.key(),
        ctx.iv(),
        &src[FIL_PAGE_DATA..FIL_PAGE_DATA + chunk_len],
        &mut dst[dst_header..dst_header + chunk_len],
    )?;

    if remain_len != 0 {
        // Copy the residual tail through, then re-encrypt the last two
        // blocks of the destination data region in place.
        dst[dst_header + chunk_len..dst_header + data_len]
            .copy_from_slice(&src[FIL_PAGE_DATA + chunk_len..FIL_PAGE_DATA + data_len]);

        let tail = dst_header + data_len - TAIL_WINDOW;
        let mut window = Zeroizing::new([0u8; TAIL_WINDOW]);
        window.copy_from_slice(&dst[tail..tail + TAIL_WINDOW]);
        cipher::cbc_encrypt(
            ctx.key(),
            ctx.iv(),
            &window[..],
            &mut dst[tail..tail + TAIL_WINDOW],
        )?;
    }

    // Carry the header as-is, then rewrite the type bookkeeping.
    dst[..FIL_PAGE_DATA].copy_from_slice(&src[..FIL_PAGE_DATA]);

    if compressed {
        // Compressed pages keep their pre-compression type in the
        // compression control fields already.
        write_u16(dst, FIL_PAGE_TYPE, FIL_PAGE_COMPRESSED_AND_ENCRYPTED);
    } else if page_type == FIL_PAGE_RTREE {
        write_u16(dst, FIL_PAGE_TYPE, FIL_PAGE_ENCRYPTED_RTREE);
    } else {
        write_u16(dst, FIL_PAGE_TYPE, FIL_PAGE_ENCRYPTED);
        write_u16(dst, FIL_PAGE_ORIGINAL_TYPE_V1, page_type);
    }

    // Zero the unused span beyond a compressed payload.
    if src_len > src_enc_len {
        dst[dst_header + data_len..].fill(0);
    }

    if keyring {
        // A key version of zero would read back as "plaintext".
        debug_assert!(ctx.key_version() != 0);

        let mut checksum = 0u32;
        if compressed {
            dst[FIL_PAGE_DATA..FIL_PAGE_DATA + 4].fill(0);
            write_u32(dst, FIL_PAGE_DATA + 4, ctx.key_version());
        }
        if ctx.rotation() == EncryptionRotation::MasterKeyToKeyring {
            checksum = post_encryption_checksum(dst, dst_header, data_len);
        }

        write_u32(dst, FIL_PAGE_ENCRYPTION_KEY_VERSION, ctx.key_version());

        if compressed {
            if checksum != 0 {
                write_u32(dst, FIL_PAGE_DATA, checksum);
            }
        } else {
            // Mirror the low LSN word into the unencrypted trailer slot;
            // mid-migration the post-encryption checksum takes its place
            // and decrypt re-derives the mirror from the header.
            dst[src_len - 4..].copy_from_slice(&src[FIL_PAGE_LSN + 4..FIL_PAGE_LSN + 8]);
            if checksum != 0 {
                write_u32(dst, src_len - 4, checksum);
            }
        }
    }

    Ok(())
}

/// Decrypt an encrypted page from `src` into `dst`.
///
/// A page that carries no encrypted type passes through unchanged.
pub fn decrypt_page(
    ctx: &EncryptionContext,
    src: &[u8],
    dst: &mut [u8],
) -> Result<(), PageDecryptError> {
    if src.len() != dst.len() {
        return Err(PageDecryptError::BufferMismatch);
    }

    if !is_encrypted_page(src) {
        dst.copy_from_slice(src);
        return Ok(());
    }
    if ctx.mode() == EncryptionMode::None {
        tracing::error!("encrypted page reached a tablespace without key material");
        return Err(PageDecryptError::MissingKey);
    }

    let src_len = src.len();
    let page_type = read_u16(src, FIL_PAGE_TYPE);
    let compressed = page_type == FIL_PAGE_COMPRESSED_AND_ENCRYPTED;
    let keyring = ctx.mode() == EncryptionMode::Keyring;

    // Reconstruct the encrypted span of a compressed page from its stored
    // payload length.
    let mut enc_len = src_len;
    if compressed {
        let z_len = read_u16(src, FIL_PAGE_COMPRESS_SIZE_V1) as usize;
        enc_len = z_len + FIL_PAGE_DATA;
        if enc_len < MIN_ENCRYPTION_LEN {
            enc_len = MIN_ENCRYPTION_LEN;
        }
        let reserved = if keyring { KEYRING_COMPRESSED_RESERVED } else { 0 };
        if enc_len + reserved > src_len {
            return Err(PageDecryptError::CompressedPayloadOutOfBounds);
        }
    }

    let header_size = if keyring && compressed {
        FIL_PAGE_DATA + KEYRING_COMPRESSED_RESERVED
    } else {
        FIL_PAGE_DATA
    };
    let original_type = read_u16(src, FIL_PAGE_ORIGINAL_TYPE_V1);

    let mut data_len = enc_len - header_size;
    if keyring && compressed {
        // The reserved bytes sit between the header and the payload; the
        // ciphertext itself is as long as the plaintext payload.
        data_len += KEYRING_COMPRESSED_RESERVED;
    } else if keyring && page_type == FIL_PAGE_ENCRYPTED {
        // The trailing LSN mirror was never encrypted.
        data_len -= 4;
    }
    if data_len < TAIL_WINDOW {
        return Err(PageDecryptError::TooSmall(src_len));
    }

    let chunk_len = (data_len / AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
    let remain_len = data_len - chunk_len;

    // The plaintext payload of a keyring compressed page moves back up to
    // the header boundary; the reserved bytes disappear.
    let out = if keyring && compressed {
        FIL_PAGE_DATA
    } else {
        header_size
    };

    dst.copy_from_slice(src);

    if remain_len != 0 {
        // Undo the second pass first: the trailing two ciphertext blocks
        // decode to the overwritten middle ciphertext plus the residual
        // plaintext.
        let tail = header_size + data_len - TAIL_WINDOW;
        let mut window = Zeroizing::new([0u8; TAIL_WINDOW]);
        cipher::cbc_decrypt(
            ctx.key(),
            ctx.iv(),
            &src[tail..tail + TAIL_WINDOW],
            &mut window[..],
        )?;

        let boundary = data_len - TAIL_WINDOW;
        dst[out..out + boundary].copy_from_slice(&src[header_size..header_size + boundary]);
        dst[out + boundary..out + chunk_len]
            .copy_from_slice(&window[..TAIL_WINDOW - remain_len]);
        cipher::cbc_decrypt_in_place(ctx.key(), ctx.iv(), &mut dst[out..out + chunk_len])?;
        dst[out + chunk_len..out + data_len]
            .copy_from_slice(&window[TAIL_WINDOW - remain_len..]);
    } else {
        cipher::cbc_decrypt(
            ctx.key(),
            ctx.iv(),
            &src[header_size..header_size + chunk_len],
            &mut dst[out..out + chunk_len],
        )?;
    }

    if keyring && compressed {
        // The reserved checksum/key-version slot is spent; the payload is
        // followed by zeros again.
        dst[out + data_len..out + data_len + KEYRING_COMPRESSED_RESERVED].fill(0);
    }

    if keyring && page_type == FIL_PAGE_ENCRYPTED {
        // Restore the unencrypted trailing LSN copy from the header.
        let (head, tail) = dst.split_at_mut(src_len - 4);
        tail.copy_from_slice(&head[FIL_PAGE_LSN + 4..FIL_PAGE_LSN + 8]);
    }

    // Restore the page type. A compressed page goes back to the compressed
    // type; decompression happens later.
    if page_type == FIL_PAGE_ENCRYPTED {
        write_u16(dst, FIL_PAGE_TYPE, original_type);
    } else if page_type == FIL_PAGE_ENCRYPTED_RTREE {
        write_u16(dst, FIL_PAGE_TYPE, FIL_PAGE_RTREE);
    } else {
        write_u16(dst, FIL_PAGE_TYPE, FIL_PAGE_COMPRESSED);
    }

    Ok(())
}

/// The key version a page was encrypted with, zero for plaintext pages.
pub fn page_key_version(page: &[u8]) -> u32 {
    super::read_u32(page, FIL_PAGE_ENCRYPTION_KEY_VERSION)
}
