//! P-256 (NIST secp256r1) ECDH key agreement.
//!
//! The shared secret used elsewhere in the handshake is the lowercase-hex
//! encoding of the raw X-coordinate bytes, not the raw bytes themselves —
//! callers should treat [`SharedSecret::to_hex`] as the canonical form.

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EcdhError {
    #[error("hex decode: {0}")]
    HexDecode(#[from] hex::FromHexError),
    #[error("invalid P-256 public key: {0}")]
    InvalidPublicKey(String),
}

/// An ephemeral P-256 keypair generated for a single handshake.
pub struct Keypair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut rand::thread_rng());
        let public = secret.public_key();
        Self { secret, public }
    }

    /// The uncompressed SEC1 public key, lowercase-hex encoded (65 bytes -> 130 chars).
    pub fn public_hex(&self) -> String {
        hex::encode(self.public.to_encoded_point(false).as_bytes())
    }

    /// Compute the shared secret against a peer's uncompressed SEC1 public key.
    pub fn agree(&self, peer_public_hex: &str) -> Result<SharedSecret, EcdhError> {
        let bytes = hex::decode(peer_public_hex)?;
        let peer = PublicKey::from_sec1_bytes(&bytes)
            .map_err(|e| EcdhError::InvalidPublicKey(e.to_string()))?;
        let shared = self.secret.diffie_hellman(&peer);
        // `raw_secret_bytes()` is the X coordinate of the shared point, 32 bytes.
        let bytes: [u8; 32] = (*shared.raw_secret_bytes()).into();
        Ok(SharedSecret(bytes))
    }
}

/// The 32-byte X coordinate resulting from an ECDH agreement.
#[derive(Clone)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Lowercase-hex encoding (64 ASCII chars) — this is the string used as
    /// both the HMAC signing key and (as raw ASCII bytes) the AES key
    /// material source throughout the rest of the handshake.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();

        let a_view_of_shared = a.agree(&b.public_hex()).unwrap();
        let b_view_of_shared = b.agree(&a.public_hex()).unwrap();

        assert_eq!(a_view_of_shared.to_hex(), b_view_of_shared.to_hex());
    }

    #[test]
    fn shared_secret_hex_is_64_chars() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let shared = a.agree(&b.public_hex()).unwrap();
        assert_eq!(shared.to_hex().len(), 64);
    }

    #[test]
    fn public_hex_is_130_chars_uncompressed_point() {
        let kp = Keypair::generate();
        assert_eq!(kp.public_hex().len(), 130);
        assert!(kp.public_hex().starts_with("04"));
    }

    #[test]
    fn agree_rejects_invalid_hex() {
        let a = Keypair::generate();
        assert!(matches!(a.agree("zz"), Err(EcdhError::HexDecode(_))));
    }

    #[test]
    fn agree_rejects_malformed_point() {
        let a = Keypair::generate();
        assert!(matches!(
            a.agree("0400"),
            Err(EcdhError::InvalidPublicKey(_))
        ));
    }
}
