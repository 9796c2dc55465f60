use std::{io::Read, path::Path};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::{
    error::{KagiError, KagiResult},
    key::KeyMaterial,
    util::{
        atomic::{write_atomic, write_if_changed},
        Fingerprint,
    },
};

pub use crate::util::atomic::PublishOutcome;

pub const BLOCK_SIZE: u64 = 16;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES-128-CBC with PKCS#7 padding, as HLS `METHOD=AES-128` expects.
pub fn encrypt_segment(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
}

pub fn decrypt_segment(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> KagiResult<Vec<u8>> {
    Ok(Aes128CbcDec::new(key.into(), iv.into()).decrypt_padded_vec_mut::<Pkcs7>(data)?)
}

/// PKCS#7 always adds at least one byte of padding.
pub fn ciphertext_len(plain_len: u64) -> u64 {
    (plain_len / BLOCK_SIZE + 1) * BLOCK_SIZE
}

/// Encrypt the media segment at `src` and publish it at `dest`.
///
/// Returns the fingerprint of the source version that was encrypted. If the
/// source changes while it is read, nothing is published.
pub fn encrypt_file(
    src: &Path,
    dest: &Path,
    key: &KeyMaterial,
    sequence: u64,
) -> KagiResult<Fingerprint> {
    let (data, fingerprint) = read_stable(src)?;
    let encrypted = encrypt_segment(&data, key.key(), &key.iv_for(sequence));
    write_atomic(dest, &encrypted)?;
    Ok(fingerprint)
}

/// Copy the initialization segment verbatim. It is never encrypted.
pub fn copy_init(src: &Path, dest: &Path) -> KagiResult<(Fingerprint, PublishOutcome)> {
    let (data, fingerprint) = read_stable(src)?;
    Ok((fingerprint, write_if_changed(dest, &data)?))
}

/// Whether `dest` already holds the ciphertext of the current `src` under `key`.
///
/// Used on restart to re-confirm segments instead of encrypting them again.
/// The ciphertext length must match, the destination must not be older than
/// the source, and the first cipher block must be what `key` and the IV of
/// `sequence` produce. Sources shorter than one block are encrypted and
/// compared in full.
pub fn is_current(src: &Path, dest: &Path, key: &KeyMaterial, sequence: u64) -> bool {
    let (Ok(src_fp), Ok(dest_fp)) = (Fingerprint::of(src), Fingerprint::of(dest)) else {
        return false;
    };

    let newer = match (src_fp.modified, dest_fp.modified) {
        (Some(src), Some(dest)) => dest >= src,
        _ => false,
    };
    if !newer || dest_fp.len != ciphertext_len(src_fp.len) {
        return false;
    }

    let (Ok(head), Ok(existing)) = (read_head(src), read_head(dest)) else {
        return false;
    };
    let iv = key.iv_for(sequence);
    if head.len() < BLOCK_SIZE as usize {
        // one padded block, compare it whole
        return encrypt_segment(&head, key.key(), &iv) == existing;
    }
    // the first CBC block only depends on the key, the IV and the first plain block
    encrypt_segment(&head, key.key(), &iv)[..BLOCK_SIZE as usize] == existing[..]
}

/// Up to the first cipher block of a file.
fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(BLOCK_SIZE as usize);
    std::fs::File::open(path)?
        .take(BLOCK_SIZE)
        .read_to_end(&mut head)?;
    Ok(head)
}

fn read_stable(src: &Path) -> KagiResult<(Vec<u8>, Fingerprint)> {
    let before = Fingerprint::of(src)?;
    let data = std::fs::read(src)?;
    let after = Fingerprint::of(src)?;
    if before != after || after.len != data.len() as u64 {
        return Err(KagiError::SourceChanged(src.to_path_buf()));
    }
    Ok((data, after))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::IvMode;

    const KEY: [u8; 16] = u128::to_be_bytes(0xa8cda0ee5390b716298ffad0a1f1a021);

    #[test]
    fn test_ciphertext_len() {
        assert_eq!(ciphertext_len(0), 16);
        assert_eq!(ciphertext_len(15), 16);
        assert_eq!(ciphertext_len(16), 32);
        assert_eq!(ciphertext_len(17), 32);
    }

    #[test]
    fn test_roundtrip() {
        let iv = 5u128.to_be_bytes();
        for len in [0usize, 1, 15, 16, 17, 4096 + 3] {
            let plain: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let encrypted = encrypt_segment(&plain, &KEY, &iv);
            assert_eq!(encrypted.len() as u64, ciphertext_len(len as u64));
            if len > 0 {
                assert_ne!(&encrypted[..len.min(16)], &plain[..len.min(16)]);
            }
            assert_eq!(decrypt_segment(&encrypted, &KEY, &iv).unwrap(), plain);
        }
    }

    #[test]
    fn test_distinct_iv_per_sequence() {
        let key = KeyMaterial::new(KEY, "k", IvMode::SequenceDerived);
        let plain = [0u8; 32];
        let a = encrypt_segment(&plain, key.key(), &key.iv_for(0));
        let b = encrypt_segment(&plain, key.key(), &key.iv_for(1));
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let encrypted = encrypt_segment(b"hello world", &KEY, &[0; 16]);
        let result = decrypt_segment(&encrypted, &[0; 16], &[0; 16]);
        // wrong keys almost always break the padding, never restore the data
        assert!(result.map_or(true, |d| d != b"hello world"));
    }

    #[test]
    fn test_encrypt_file_and_is_current() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("index003.m4s");
        let dest = dir.path().join("out.m4s");
        std::fs::write(&src, b"some fragmented mp4 bytes").unwrap();

        let key = KeyMaterial::new(KEY, "k", IvMode::SequenceDerived);
        assert!(!is_current(&src, &dest, &key, 3));

        let fingerprint = encrypt_file(&src, &dest, &key, 3).unwrap();
        assert_eq!(fingerprint.len, 25);
        assert!(is_current(&src, &dest, &key, 3));

        let encrypted = std::fs::read(&dest).unwrap();
        let decrypted = decrypt_segment(&encrypted, &KEY, &3u128.to_be_bytes()).unwrap();
        assert_eq!(decrypted, b"some fragmented mp4 bytes");
    }

    #[test]
    fn test_is_current_checks_key_and_iv() {
        let dir = tempfile::tempdir().unwrap();
        for len in [5usize, 16, 100] {
            let src = dir.path().join(format!("index{len:03}.m4s"));
            let dest = dir.path().join(format!("out{len:03}.m4s"));
            std::fs::write(&src, vec![0x5a; len]).unwrap();

            let key = KeyMaterial::new(KEY, "k", IvMode::SequenceDerived);
            encrypt_file(&src, &dest, &key, 1).unwrap();
            assert!(is_current(&src, &dest, &key, 1));

            // another sequence means another IV
            assert!(!is_current(&src, &dest, &key, 2));

            let rotated = KeyMaterial::new([0x11; 16], "k", IvMode::SequenceDerived);
            assert!(!is_current(&src, &dest, &rotated, 1));

            let explicit = KeyMaterial::new(KEY, "k", IvMode::Explicit([0x22; 16]));
            assert!(!is_current(&src, &dest, &explicit, 1));
        }
    }

    #[test]
    fn test_copy_init() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("init.mp4");
        let dest = dir.path().join("dest.mp4");
        std::fs::write(&src, b"ftypmoov").unwrap();

        let (_, outcome) = copy_init(&src, &dest).unwrap();
        assert_eq!(outcome, PublishOutcome::Written);
        assert_eq!(std::fs::read(&dest).unwrap(), b"ftypmoov");

        let (_, outcome) = copy_init(&src, &dest).unwrap();
        assert_eq!(outcome, PublishOutcome::Unchanged);
    }

    #[test]
    fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyMaterial::new(KEY, "k", IvMode::SequenceDerived);
        let result = encrypt_file(
            &dir.path().join("missing.m4s"),
            &dir.path().join("out.m4s"),
            &key,
            0,
        );
        assert!(matches!(result, Err(KagiError::IOError(_))));
    }
}
