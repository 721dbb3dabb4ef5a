//! Crypto primitives for the enrollment handshake: HMAC-SHA256 signing,
//! AES-256-CBC/PKCS7 decryption, and P-256 ECDH key agreement.
//!
//! These are pure functions with no bus/network/file dependencies — every
//! other component that needs crypto goes through this crate rather than
//! reaching for `sha2`/`aes`/`p256` directly.

pub mod ecdh;

use aes::Aes256;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

const BLOCK_SIZE: usize = 16;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("serializing payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("hex decode: {0}")]
    HexDecode(#[from] hex::FromHexError),
    #[error("cipher setup: {0}")]
    CipherSetup(String),
    #[error("invalid padding")]
    InvalidPadding,
    #[error("key material must be at least {KEY_LEN} + {IV_LEN} bytes, got {0}")]
    KeyMaterialTooShort(usize),
}

/// Serialize `payload` as canonical JSON and return the hex-encoded
/// HMAC-SHA256 digest under `secret`.
///
/// Fails only if `payload` cannot be serialized — the caller is malformed
/// in that case, not the crypto layer.
pub fn sign<T: Serialize>(payload: &T, secret: &str) -> Result<String, CryptoError> {
    let body = serde_json::to_vec(payload)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(&body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Decrypt `ciphertext_hex` with AES-256-CBC under `key_material`.
///
/// `key_material` must be at least 48 bytes: the first 32 are the AES key,
/// the next 16 are the IV. PKCS#7 padding is stripped manually so that an
/// invalid pad is reported as [`CryptoError::InvalidPadding`] rather than a
/// generic cipher error.
pub fn decrypt(ciphertext_hex: &str, key_material: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key_material.len() < KEY_LEN + IV_LEN {
        return Err(CryptoError::KeyMaterialTooShort(key_material.len()));
    }
    let key = &key_material[..KEY_LEN];
    let iv = &key_material[KEY_LEN..KEY_LEN + IV_LEN];

    let mut buf = hex::decode(ciphertext_hex)?;
    if buf.is_empty() || buf.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::CipherSetup(format!(
            "ciphertext length {} is not a non-zero multiple of the block size",
            buf.len()
        )));
    }

    let decryptor = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| CryptoError::CipherSetup(e.to_string()))?;
    // NoPadding: we strip PKCS#7 ourselves below, matching the exact
    // validation rules the controller's Go implementation uses.
    let len = decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| CryptoError::CipherSetup(e.to_string()))?
        .len();
    buf.truncate(len);

    pkcs7_unpad(buf)
}

fn pkcs7_unpad(mut data: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
    let len = data.len();
    if len == 0 {
        return Err(CryptoError::InvalidPadding);
    }
    let pad = data[len - 1] as usize;
    if pad == 0 || pad > len || pad > BLOCK_SIZE {
        return Err(CryptoError::InvalidPadding);
    }
    if data[len - pad..].iter().any(|&b| b as usize != pad) {
        return Err(CryptoError::InvalidPadding);
    }
    data.truncate(len - pad);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::block_padding::Pkcs7;
    use cbc::cipher::BlockEncryptMut;
    use serde::Serialize;

    type Aes256CbcEnc = cbc::Encryptor<Aes256>;

    fn encrypt(plaintext: &[u8], key_material: &[u8]) -> String {
        let key = &key_material[..KEY_LEN];
        let iv = &key_material[KEY_LEN..KEY_LEN + IV_LEN];
        let enc = Aes256CbcEnc::new_from_slices(key, iv).unwrap();
        let ciphertext = enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        hex::encode(ciphertext)
    }

    fn key_material() -> Vec<u8> {
        (0u8..48).collect()
    }

    #[test]
    fn decrypt_round_trips_for_varied_lengths() {
        let km = key_material();
        for len in [0usize, 1, 15, 16, 17, 63, 1024] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let ciphertext_hex = encrypt(&plaintext, &km);
            let out = decrypt(&ciphertext_hex, &km).unwrap();
            assert_eq!(out, plaintext, "length {len}");
        }
    }

    #[test]
    fn decrypt_rejects_invalid_padding() {
        let km = key_material();
        let ciphertext_hex = encrypt(b"hello world", &km);
        let mut ciphertext = hex::decode(&ciphertext_hex).unwrap();
        // Corrupt the last byte so the padding is no longer self-consistent.
        *ciphertext.last_mut().unwrap() ^= 0xFF;
        let ciphertext_hex = hex::encode(&ciphertext);

        match decrypt(&ciphertext_hex, &km) {
            Err(CryptoError::InvalidPadding) => {}
            other => panic!("expected InvalidPadding, got {other:?}"),
        }
    }

    #[test]
    fn decrypt_rejects_bad_hex() {
        let km = key_material();
        assert!(matches!(
            decrypt("not-hex-zz", &km),
            Err(CryptoError::HexDecode(_))
        ));
    }

    #[test]
    fn decrypt_rejects_short_key_material() {
        let short = vec![0u8; 40];
        match decrypt("00", &short) {
            Err(CryptoError::KeyMaterialTooShort(40)) => {}
            other => panic!("expected KeyMaterialTooShort, got {other:?}"),
        }
    }

    #[derive(Serialize)]
    struct Body {
        id: String,
        key: String,
    }

    #[test]
    fn sign_is_deterministic_and_verifiable() {
        let body = Body {
            id: "a1".into(),
            key: "04abc".into(),
        };
        let sig1 = sign(&body, "secret").unwrap();
        let sig2 = sign(&body, "secret").unwrap();
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64, "hex-encoded SHA-256 digest is 64 chars");
    }

    #[test]
    fn sign_changes_with_one_bit_flip_in_payload() {
        let body_a = Body {
            id: "a1".into(),
            key: "04abc".into(),
        };
        let body_b = Body {
            id: "a2".into(),
            key: "04abc".into(),
        };
        assert_ne!(
            sign(&body_a, "secret").unwrap(),
            sign(&body_b, "secret").unwrap()
        );
    }

    #[test]
    fn sign_changes_with_different_secret() {
        let body = Body {
            id: "a1".into(),
            key: "04abc".into(),
        };
        assert_ne!(
            sign(&body, "secret-one").unwrap(),
            sign(&body, "secret-two").unwrap()
        );
    }
}
