//! Byte layout of data pages and redo-log blocks.
//!
//! Every page carries a fixed 56 byte header followed by the data region and
//! an 8 byte trailer:
//!
//! - Page Header
//!     * Checksum, page number, prev/next pointers and the 8 byte LSN.
//!     * `FIL_PAGE_TYPE` at offset 24 discriminates the page kind; encrypted
//!       pages rewrite it and preserve the pre-encryption type at
//!       `FIL_PAGE_ORIGINAL_TYPE_V1`.
//!     * `FIL_PAGE_ENCRYPTION_KEY_VERSION` is non-zero on pages encrypted in
//!       keyring mode; zero means plaintext.
//!     * Transparently compressed pages keep their compression control
//!       fields (version, algorithm, original/compressed sizes) in the
//!       header as well.
//! - Data region
//!     * The only part transformed by encryption. Ciphertext length always
//!       equals plaintext length.
//! - Page Trailer
//!     * Old-style checksum plus a mirror of the low 32 bits of the LSN.
//!
//! Redo-log blocks are fixed 512 byte units with a 12 byte header and a
//! 4 byte checksum trailer. All multi-byte fields are big-endian.

pub mod cipher;
pub mod info;
pub mod log;
pub mod page;
#[cfg(all(test, not(miri)))]
mod tests;

/// Checksum of the page contents (storage format dependent).
pub const FIL_PAGE_SPACE_OR_CHKSUM: usize = 0;
/// Page number within the tablespace.
pub const FIL_PAGE_OFFSET: usize = 4;
/// Previous page in the same index level.
pub const FIL_PAGE_PREV: usize = 8;
/// Next page in the same index level.
pub const FIL_PAGE_NEXT: usize = 12;
/// LSN of the newest modification to the page.
pub const FIL_PAGE_LSN: usize = 16;
/// Page type discriminator.
pub const FIL_PAGE_TYPE: usize = 24;
/// Key version the page was encrypted with; zero on plaintext pages.
pub const FIL_PAGE_ENCRYPTION_KEY_VERSION: usize = 26;
/// Space id of the tablespace the page belongs to.
pub const FIL_PAGE_ARCH_LOG_NO_OR_SPACE_ID: usize = 30;
/// Compression control format version.
pub const FIL_PAGE_VERSION: usize = 34;
/// Compression algorithm identifier.
pub const FIL_PAGE_ALGORITHM_V1: usize = 35;
/// Uncompressed length of a transparently compressed page.
pub const FIL_PAGE_ORIGINAL_SIZE_V1: usize = 36;
/// Stored length of the compressed payload.
pub const FIL_PAGE_COMPRESS_SIZE_V1: usize = 40;
/// Pre-encryption page type, preserved while the page is encrypted.
///
/// Plaintext pages mirror their `FIL_PAGE_TYPE` here, so a round trip
/// through the cryptor reproduces the page byte for byte.
pub const FIL_PAGE_ORIGINAL_TYPE_V1: usize = 54;
/// End of the page header; the data region starts here.
pub const FIL_PAGE_DATA: usize = 56;

/// Size of the page trailer: old-style checksum followed by a mirror of the
/// low 32 bits of `FIL_PAGE_LSN`.
pub const FIL_PAGE_END_LSN_OLD_CHKSUM: usize = 8;

/// Freshly allocated page, no content yet.
pub const FIL_PAGE_TYPE_ALLOCATED: u16 = 0;
/// File space header page.
pub const FIL_PAGE_TYPE_FSP_HDR: u16 = 8;
/// Extent descriptor page.
pub const FIL_PAGE_TYPE_XDES: u16 = 9;
/// Transparently compressed page.
pub const FIL_PAGE_COMPRESSED: u16 = 14;
/// Encrypted page.
pub const FIL_PAGE_ENCRYPTED: u16 = 15;
/// Compressed, then encrypted page.
pub const FIL_PAGE_COMPRESSED_AND_ENCRYPTED: u16 = 16;
/// Encrypted R-tree page.
pub const FIL_PAGE_ENCRYPTED_RTREE: u16 = 17;
/// Spatial index page.
pub const FIL_PAGE_RTREE: u16 = 17854;
/// B-tree index page.
pub const FIL_PAGE_INDEX: u16 = 17855;

/// Fixed size of one redo-log block.
pub const LOG_BLOCK_SIZE: usize = 512;
/// Log block header: block number, data length, first record group offset
/// and checkpoint number.
pub const LOG_BLOCK_HDR_SIZE: usize = 12;
/// Offset of the data length field inside the log block header.
pub const LOG_BLOCK_HDR_DATA_LEN: usize = 4;
/// Log block trailer, holding the block checksum.
pub const LOG_BLOCK_TRL_SIZE: usize = 4;

/// Mask of the encrypted bit inside the log block data length field.
const LOG_BLOCK_ENCRYPT_BIT: u16 = 0x8000;

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap())
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Returns whether the page carries one of the encrypted page types.
pub fn is_encrypted_page(page: &[u8]) -> bool {
    let page_type = read_u16(page, FIL_PAGE_TYPE);
    page_type == FIL_PAGE_ENCRYPTED
        || page_type == FIL_PAGE_COMPRESSED_AND_ENCRYPTED
        || page_type == FIL_PAGE_ENCRYPTED_RTREE
}

/// Returns whether the page was compressed before it was encrypted.
pub fn is_encrypted_and_compressed(page: &[u8]) -> bool {
    read_u16(page, FIL_PAGE_TYPE) == FIL_PAGE_COMPRESSED_AND_ENCRYPTED
}

/// Whether a page of this type may be encrypted in keyring mode.
///
/// File space headers, extent descriptors and spatial index pages stay
/// plaintext so that offline tools can still walk the tablespace.
pub fn can_page_be_keyring_encrypted(page_type: u16) -> bool {
    !matches!(
        page_type,
        FIL_PAGE_TYPE_FSP_HDR | FIL_PAGE_TYPE_XDES | FIL_PAGE_RTREE
    )
}

/// Returns whether the log block has the encrypted bit set.
pub fn is_encrypted_log(block: &[u8]) -> bool {
    read_u16(block, LOG_BLOCK_HDR_DATA_LEN) & LOG_BLOCK_ENCRYPT_BIT != 0
}

pub(crate) fn log_block_set_encrypt_bit(block: &mut [u8], enabled: bool) {
    let mut data_len = read_u16(block, LOG_BLOCK_HDR_DATA_LEN);
    if enabled {
        data_len |= LOG_BLOCK_ENCRYPT_BIT;
    } else {
        data_len &= !LOG_BLOCK_ENCRYPT_BIT;
    }
    write_u16(block, LOG_BLOCK_HDR_DATA_LEN, data_len);
}

/// CRC32 of the log block contents, excluding the checksum trailer.
pub(crate) fn log_block_checksum(block: &[u8]) -> u32 {
    crc32fast::hash(&block[..LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE])
}

pub(crate) fn log_block_get_checksum(block: &[u8]) -> u32 {
    read_u32(block, LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE)
}

pub(crate) fn log_block_set_checksum(block: &mut [u8], checksum: u32) {
    write_u32(block, LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE, checksum);
}
