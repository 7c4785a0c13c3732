//! Point decoding and signature verification behind the validation context.

use meridian_primitives::sha256;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1};
use thiserror::Error;

/// Length of a compact (r ‖ s) signature.
pub const SIGNATURE_LEN: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum CryptoError {
    #[error("invalid public key encoding")]
    InvalidPoint,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("signature verification failed")]
    VerifyFailed,
}

/// Decodes a SEC1 compressed or uncompressed public key.
pub fn decode_point(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    PublicKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPoint)
}

/// Verifies a compact ECDSA signature over sha256(data).
pub fn verify(pubkey: &PublicKey, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignature);
    }
    let sig =
        Signature::from_compact(signature).map_err(|_| CryptoError::InvalidSignature)?;
    let msg = Message::from_digest_slice(&sha256(data))
        .map_err(|_| CryptoError::InvalidSignature)?;
    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&msg, &sig, pubkey)
        .map_err(|_| CryptoError::VerifyFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    fn test_key(byte: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[byte; 32]).expect("secret key");
        let public = PublicKey::from_secret_key(&secp, &secret);
        (secret, public)
    }

    fn sign(secret: &SecretKey, data: &[u8]) -> Vec<u8> {
        let secp = Secp256k1::signing_only();
        let msg = Message::from_digest_slice(&sha256(data)).expect("digest");
        secp.sign_ecdsa(&msg, secret).serialize_compact().to_vec()
    }

    #[test]
    fn verify_accepts_own_signature() {
        let (secret, public) = test_key(0x11);
        let sig = sign(&secret, b"payload");
        verify(&public, b"payload", &sig).expect("valid signature");
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let (secret, public) = test_key(0x11);
        let sig = sign(&secret, b"payload");
        assert_eq!(
            verify(&public, b"other", &sig),
            Err(CryptoError::VerifyFailed)
        );
    }

    #[test]
    fn verify_rejects_malformed_signature() {
        let (_, public) = test_key(0x11);
        assert_eq!(
            verify(&public, b"payload", &[0u8; 12]),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn decode_point_rejects_garbage() {
        assert_eq!(decode_point(&[0u8; 33]), Err(CryptoError::InvalidPoint));
    }
}
