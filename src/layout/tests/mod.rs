use std::sync::Arc;

use crate::context::{EncryptionContext, EncryptionMode};
use crate::keyring::MemoryKeyring;
use crate::layout::{
    FIL_PAGE_ALGORITHM_V1, FIL_PAGE_ARCH_LOG_NO_OR_SPACE_ID, FIL_PAGE_COMPRESS_SIZE_V1,
    FIL_PAGE_COMPRESSED, FIL_PAGE_COMPRESSED_AND_ENCRYPTED, FIL_PAGE_DATA,
    FIL_PAGE_ENCRYPTED, FIL_PAGE_ENCRYPTED_RTREE, FIL_PAGE_ENCRYPTION_KEY_VERSION,
    FIL_PAGE_END_LSN_OLD_CHKSUM, FIL_PAGE_INDEX, FIL_PAGE_LSN, FIL_PAGE_OFFSET,
    FIL_PAGE_ORIGINAL_SIZE_V1, FIL_PAGE_ORIGINAL_TYPE_V1, FIL_PAGE_RTREE, FIL_PAGE_TYPE,
    FIL_PAGE_TYPE_ALLOCATED, FIL_PAGE_TYPE_FSP_HDR, FIL_PAGE_TYPE_XDES, FIL_PAGE_VERSION,
    LOG_BLOCK_HDR_DATA_LEN, LOG_BLOCK_SIZE, can_page_be_keyring_encrypted,
    is_encrypted_and_compressed, is_encrypted_log, is_encrypted_page, log_block_checksum,
    log_block_get_checksum, log_block_set_checksum, log_block_set_encrypt_bit, read_u16,
    write_u16, write_u32,
};
use crate::master_key::{KEY_LEN, MasterKeyManager};


pub(crate) const UUID: &str = "00000000-0000-0000-0000-000000000001";
pub(crate) const SERVER_ID: u32 = 42;
pub(crate) const PAGE_SIZE: usize = 16 << 10;

pub(crate) fn test_key() -> [u8; KEY_LEN] {
    core::array::from_fn(|i| i as u8)
}

pub(crate) fn test_iv() -> [u8; KEY_LEN] {
    core::array::from_fn(|i| (i + 0x20) as u8)
}

pub(crate) fn manager_with_keyring() -> (Arc<MemoryKeyring>, MasterKeyManager) {
    let keyring = Arc::new(MemoryKeyring::new());
    let manager = MasterKeyManager::new(keyring.clone(), UUID, SERVER_ID);
    (keyring, manager)
}

pub(crate) fn aes_context() -> EncryptionContext {
    let mut ctx = EncryptionContext::unencrypted();
    ctx.set_encryption(EncryptionMode::Aes, &test_key(), &test_iv());
    ctx
}

pub(crate) fn keyring_context(key_version: u32) -> EncryptionContext {
    let mut ctx = EncryptionContext::unencrypted();
    ctx.set_encryption(EncryptionMode::Keyring, &test_key(), &test_iv());
    ctx.set_key_version(key_version);
    ctx.set_key_id_uuid(UUID);
    ctx
}

/// A page the way the engine hands it to the cryptor: header fields filled
/// in, the type mirrored in the preserved-type slot, patterned payload and a
/// trailer carrying the low LSN word.
pub(crate) fn build_page(page_type: u16, key_version: u32, len: usize) -> Vec<u8> {
    let lsn: u64 = 0x0000_0012_3456_789A;
    let mut page = vec![0u8; len];

    write_u32(&mut page, FIL_PAGE_OFFSET, 17);
    page[FIL_PAGE_LSN..FIL_PAGE_LSN + 8].copy_from_slice(&lsn.to_be_bytes());
    write_u16(&mut page, FIL_PAGE_TYPE, page_type);
    write_u32(&mut page, FIL_PAGE_ENCRYPTION_KEY_VERSION, key_version);
    write_u32(&mut page, FIL_PAGE_ARCH_LOG_NO_OR_SPACE_ID, 3);
    write_u16(&mut page, FIL_PAGE_ORIGINAL_TYPE_V1, page_type);

    for (i, byte) in page[FIL_PAGE_DATA..len - FIL_PAGE_END_LSN_OLD_CHKSUM]
        .iter_mut()
        .enumerate()
    {
        *byte = ((i * 7 + 13) & 0xFF) as u8;
    }

    // Trailer: old-style checksum slot plus the low LSN word mirror.
    page[len - 4..].copy_from_slice(&(lsn as u32).to_be_bytes());
    page
}

/// A transparently compressed page: compression control fields set and a
/// payload of `z_len` bytes followed by zeros.
pub(crate) fn build_compressed_page(z_len: usize, key_version: u32, len: usize) -> Vec<u8> {
    let mut page = build_page(FIL_PAGE_COMPRESSED, key_version, len);
    page[FIL_PAGE_VERSION] = 1;
    page[FIL_PAGE_ALGORITHM_V1] = 1;
    write_u32(&mut page, FIL_PAGE_ORIGINAL_SIZE_V1, (len - FIL_PAGE_DATA) as u32);
    write_u16(&mut page, FIL_PAGE_COMPRESS_SIZE_V1, z_len as u16);
    for byte in page[FIL_PAGE_DATA + z_len..].iter_mut() {
        *byte = 0;
    }
    page
}

#[test]
fn test_encrypted_page_predicates() {
    let mut page = vec![0u8; FIL_PAGE_DATA];
    write_u16(&mut page, FIL_PAGE_TYPE, FIL_PAGE_INDEX);
    assert!(!is_encrypted_page(&page));

    for page_type in [
        FIL_PAGE_ENCRYPTED,
        FIL_PAGE_COMPRESSED_AND_ENCRYPTED,
        FIL_PAGE_ENCRYPTED_RTREE,
    ] {
        write_u16(&mut page, FIL_PAGE_TYPE, page_type);
        assert!(is_encrypted_page(&page));
    }

    write_u16(&mut page, FIL_PAGE_TYPE, FIL_PAGE_COMPRESSED_AND_ENCRYPTED);
    assert!(is_encrypted_and_compressed(&page));
    write_u16(&mut page, FIL_PAGE_TYPE, FIL_PAGE_ENCRYPTED);
    assert!(!is_encrypted_and_compressed(&page));
}

#[test]
fn test_keyring_page_type_exclusions() {
    assert!(!can_page_be_keyring_encrypted(FIL_PAGE_TYPE_FSP_HDR));
    assert!(!can_page_be_keyring_encrypted(FIL_PAGE_TYPE_XDES));
    assert!(!can_page_be_keyring_encrypted(FIL_PAGE_RTREE));
    assert!(can_page_be_keyring_encrypted(FIL_PAGE_INDEX));
    assert!(can_page_be_keyring_encrypted(FIL_PAGE_TYPE_ALLOCATED));
}

#[test]
fn test_log_block_encrypt_bit_roundtrip() {
    let mut block = vec![0u8; LOG_BLOCK_SIZE];
    write_u16(&mut block, LOG_BLOCK_HDR_DATA_LEN, 496);

    log_block_set_encrypt_bit(&mut block, true);
    assert!(is_encrypted_log(&block));
    assert_eq!(read_u16(&block, LOG_BLOCK_HDR_DATA_LEN) & 0x7FFF, 496);

    log_block_set_encrypt_bit(&mut block, false);
    assert!(!is_encrypted_log(&block));
    assert_eq!(read_u16(&block, LOG_BLOCK_HDR_DATA_LEN), 496);
}

#[test]
fn test_log_block_checksum_excludes_trailer() {
    let mut block = vec![0u8; LOG_BLOCK_SIZE];
    let before = log_block_checksum(&block);
    log_block_set_checksum(&mut block, 0xDEAD_BEEF);
    assert_eq!(log_block_checksum(&block), before);
    assert_eq!(log_block_get_checksum(&block), 0xDEAD_BEEF);
}
