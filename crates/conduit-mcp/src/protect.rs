//! Secret protection for the stateless session envelope.
//!
//! The stateless Streamable HTTP mode hands the client an encrypted envelope
//! as its session id; the envelope must be authenticated so a tampered or
//! forged id fails decryption instead of impersonating a session.

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::Rng;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum ProtectError {
    #[error("protected payload too short")]
    Truncated,
    #[error("authentication failed")]
    Unauthenticated,
    #[error("encryption failed")]
    Encrypt,
}

/// AEAD wrapper around a process-held key.
pub trait SecretProtector: Send + Sync + 'static {
    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtectError>;
    fn unprotect(&self, protected: &[u8]) -> Result<Vec<u8>, ProtectError>;
}

/// ChaCha20-Poly1305 with a random 12-byte nonce prefixed to each payload.
pub struct ChaChaProtector {
    cipher: ChaCha20Poly1305,
}

impl ChaChaProtector {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Fresh random key. Envelopes sealed by one process are then
    /// undecryptable by any other, matching the process-local session model.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self::new(&key)
    }
}

impl SecretProtector for ChaChaProtector {
    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtectError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ProtectError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unprotect(&self, protected: &[u8]) -> Result<Vec<u8>, ProtectError> {
        if protected.len() < NONCE_LEN {
            return Err(ProtectError::Truncated);
        }
        let (nonce, ciphertext) = protected.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtectError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let protector = ChaChaProtector::generate();
        let protected = protector.protect(b"client-identity").unwrap();
        assert_eq!(protector.unprotect(&protected).unwrap(), b"client-identity");
    }

    #[test]
    fn test_tampering_fails_authentication() {
        let protector = ChaChaProtector::generate();
        let mut protected = protector.protect(b"client-identity").unwrap();
        let last = protected.len() - 1;
        protected[last] ^= 0x01;
        assert!(matches!(
            protector.unprotect(&protected),
            Err(ProtectError::Unauthenticated)
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let protector = ChaChaProtector::generate();
        assert!(matches!(
            protector.unprotect(b"short"),
            Err(ProtectError::Truncated)
        ));
    }

    #[test]
    fn test_keys_do_not_cross_processes() {
        let sealer = ChaChaProtector::generate();
        let other = ChaChaProtector::generate();
        let protected = sealer.protect(b"client-identity").unwrap();
        assert!(other.unprotect(&protected).is_err());
    }

    #[test]
    fn test_same_key_shares_envelopes() {
        let key = [7u8; 32];
        let sealer = ChaChaProtector::new(&key);
        let opener = ChaChaProtector::new(&key);
        let protected = sealer.protect(b"payload").unwrap();
        assert_eq!(opener.unprotect(&protected).unwrap(), b"payload");
    }
}
