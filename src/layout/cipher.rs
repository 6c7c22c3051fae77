//! AES primitives used by the page and info codecs.
//!
//! Pages and log blocks use AES-256-CBC without padding; the tablespace
//! key and IV are wrapped with AES-256-ECB under a master key. Padding is
//! never applied, so every input must already be block aligned; callers
//! handle the non-aligned tail with a second pass over the last two blocks.

use aes::Aes256;
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};

use crate::master_key::KEY_LEN;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256EcbEnc = ecb::Encryptor<Aes256>;
type Aes256EcbDec = ecb::Decryptor<Aes256>;

/// The AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// Length of the CBC initialization vector actually consumed by the cipher.
///
/// Tablespace IVs are 32 bytes on disk; only the first half seeds CBC.
pub const CBC_IV_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
#[error("cipher rejected input data")]
/// The AES primitive rejected the input, typically because the buffer is
/// not a whole number of blocks or the output buffer is the wrong size.
pub struct BadData;

fn check_aligned(src: &[u8], dst: &[u8]) -> Result<(), BadData> {
    if src.len() % AES_BLOCK_SIZE != 0 || src.len() != dst.len() {
        return Err(BadData);
    }
    Ok(())
}

/// AES-256-CBC encrypt `src` into `dst` using the first 16 bytes of `iv`.
///
/// Each call starts a fresh CBC chain; callers re-encrypting a trailing
/// window rely on that.
pub fn cbc_encrypt(
    key: &[u8; KEY_LEN],
    iv: &[u8; KEY_LEN],
    src: &[u8],
    dst: &mut [u8],
) -> Result<(), BadData> {
    check_aligned(src, dst)?;
    let cipher =
        Aes256CbcEnc::new_from_slices(key, &iv[..CBC_IV_LEN]).map_err(|_| BadData)?;
    cipher
        .encrypt_padded_b2b_mut::<NoPadding>(src, dst)
        .map_err(|_| BadData)?;
    Ok(())
}

/// AES-256-CBC decrypt `src` into `dst` using the first 16 bytes of `iv`.
pub fn cbc_decrypt(
    key: &[u8; KEY_LEN],
    iv: &[u8; KEY_LEN],
    src: &[u8],
    dst: &mut [u8],
) -> Result<(), BadData> {
    check_aligned(src, dst)?;
    let cipher =
        Aes256CbcDec::new_from_slices(key, &iv[..CBC_IV_LEN]).map_err(|_| BadData)?;
    cipher
        .decrypt_padded_b2b_mut::<NoPadding>(src, dst)
        .map_err(|_| BadData)?;
    Ok(())
}

/// AES-256-CBC decrypt `buf` in place.
pub fn cbc_decrypt_in_place(
    key: &[u8; KEY_LEN],
    iv: &[u8; KEY_LEN],
    buf: &mut [u8],
) -> Result<(), BadData> {
    if buf.len() % AES_BLOCK_SIZE != 0 {
        return Err(BadData);
    }
    let cipher =
        Aes256CbcDec::new_from_slices(key, &iv[..CBC_IV_LEN]).map_err(|_| BadData)?;
    cipher
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| BadData)?;
    Ok(())
}

/// AES-256-ECB encrypt `src` into `dst` under a master key.
///
/// Used only to wrap the 64 byte ``key || iv`` pair. The wrapped content is
/// random and never repeats, which is what makes ECB acceptable here.
pub fn ecb_encrypt(
    key: &[u8; KEY_LEN],
    src: &[u8],
    dst: &mut [u8],
) -> Result<(), BadData> {
    check_aligned(src, dst)?;
    let cipher = Aes256EcbEnc::new_from_slice(key).map_err(|_| BadData)?;
    cipher
        .encrypt_padded_b2b_mut::<NoPadding>(src, dst)
        .map_err(|_| BadData)?;
    Ok(())
}

/// AES-256-ECB decrypt `src` into `dst` under a master key.
pub fn ecb_decrypt(
    key: &[u8; KEY_LEN],
    src: &[u8],
    dst: &mut [u8],
) -> Result<(), BadData> {
    check_aligned(src, dst)?;
    let cipher = Aes256EcbDec::new_from_slice(key).map_err(|_| BadData)?;
    cipher
        .decrypt_padded_b2b_mut::<NoPadding>(src, dst)
        .map_err(|_| BadData)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; KEY_LEN] {
        core::array::from_fn(|i| i as u8)
    }

    fn iv() -> [u8; KEY_LEN] {
        core::array::from_fn(|i| (i + 0x20) as u8)
    }

    #[test]
    fn test_cbc_roundtrip() {
        let src = [0xAB; 64];
        let mut encrypted = [0u8; 64];
        cbc_encrypt(&key(), &iv(), &src, &mut encrypted).unwrap();
        assert_ne!(encrypted, src);

        let mut decrypted = [0u8; 64];
        cbc_decrypt(&key(), &iv(), &encrypted, &mut decrypted).unwrap();
        assert_eq!(decrypted, src);
    }

    #[test]
    fn test_cbc_fresh_chain_per_call() {
        let src = [0x77; 32];
        let mut once = [0u8; 32];
        let mut twice = [0u8; 32];
        cbc_encrypt(&key(), &iv(), &src, &mut once).unwrap();
        cbc_encrypt(&key(), &iv(), &src, &mut twice).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_cbc_decrypt_in_place_matches_b2b() {
        let src = [0x5A; 48];
        let mut encrypted = [0u8; 48];
        cbc_encrypt(&key(), &iv(), &src, &mut encrypted).unwrap();

        let mut in_place = encrypted;
        cbc_decrypt_in_place(&key(), &iv(), &mut in_place).unwrap();
        assert_eq!(in_place, src);
    }

    #[test]
    fn test_ecb_roundtrip() {
        let src = [0x42; 64];
        let mut wrapped = [0u8; 64];
        ecb_encrypt(&key(), &src, &mut wrapped).unwrap();
        assert_ne!(wrapped, src);

        let mut unwrapped = [0u8; 64];
        ecb_decrypt(&key(), &wrapped, &mut unwrapped).unwrap();
        assert_eq!(unwrapped, src);
    }

    #[test]
    fn test_unaligned_input_rejected() {
        let src = [0u8; 30];
        let mut dst = [0u8; 30];
        assert!(cbc_encrypt(&key(), &iv(), &src, &mut dst).is_err());
        assert!(ecb_decrypt(&key(), &src, &mut dst).is_err());
    }

    #[test]
    fn test_mismatched_buffers_rejected() {
        let src = [0u8; 32];
        let mut dst = [0u8; 48];
        assert!(cbc_encrypt(&key(), &iv(), &src, &mut dst).is_err());
    }
}
