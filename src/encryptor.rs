//! Encryptors and the descriptors that build them.
//!
//! A [`Key`](crate::key::Key) never holds a live cipher. It holds an
//! [`EncryptorDescriptor`], and the key ring asks the descriptor for an
//! [`AuthenticatedEncryptor`] the first time the key is actually used.
//!
//! The built-in descriptor is AES-256-GCM:
//!
//! ```text
//! subkey     = HKDF-SHA256(master, salt=None, info=LABEL || key_id, len=32)
//! ciphertext = nonce(12) || AES-256-GCM(subkey, nonce, plaintext, aad)
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use getrandom::getrandom;
use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::EncryptorError;
use crate::types::KeyId;

/// HKDF info label binding subkeys to this construction.
pub const SUBKEY_LABEL: &[u8] = b"citadel-keyring|aes256gcm|v1|";

pub const NONCE_BYTES: usize = 12;
pub const TAG_BYTES: usize = 16;
pub const MASTER_KEY_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A ready-to-use authenticated cipher bound to one key.
pub trait AuthenticatedEncryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, EncryptorError>;
    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, EncryptorError>;
}

/// Encryptor factory attached to each key.
///
/// `create_encryptor` may fail (corrupt material, missing algorithm); callers
/// treat that as "this key is not viable", never as a fatal error.
pub trait EncryptorDescriptor: Send + Sync {
    fn create_encryptor(&self, key_id: &KeyId) -> Result<Arc<dyn AuthenticatedEncryptor>, EncryptorError>;
}

// ---------------------------------------------------------------------------
// AES-256-GCM descriptor
// ---------------------------------------------------------------------------

/// Master key material for AES-256-GCM. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Aes256GcmDescriptor {
    master: [u8; MASTER_KEY_BYTES],
}

impl Aes256GcmDescriptor {
    /// Generate fresh random master key material.
    pub fn generate() -> Result<Self, EncryptorError> {
        let mut master = [0u8; MASTER_KEY_BYTES];
        getrandom(&mut master).map_err(|_| EncryptorError::InvalidKeyMaterial)?;
        Ok(Self { master })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncryptorError> {
        let master: [u8; MASTER_KEY_BYTES] =
            bytes.try_into().map_err(|_| EncryptorError::InvalidKeyMaterial)?;
        Ok(Self { master })
    }
}

impl fmt::Debug for Aes256GcmDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Aes256GcmDescriptor { master: [REDACTED] }")
    }
}

impl EncryptorDescriptor for Aes256GcmDescriptor {
    fn create_encryptor(&self, key_id: &KeyId) -> Result<Arc<dyn AuthenticatedEncryptor>, EncryptorError> {
        let mut info = Vec::with_capacity(SUBKEY_LABEL.len() + 16);
        info.extend_from_slice(SUBKEY_LABEL);
        info.extend_from_slice(key_id.as_uuid().as_bytes());

        let hk = Hkdf::<Sha256>::new(None, &self.master);
        let mut subkey = [0u8; 32];
        hk.expand(&info, &mut subkey)
            .map_err(|_| EncryptorError::InvalidKeyMaterial)?;

        let cipher = Aes256Gcm::new_from_slice(&subkey);
        subkey.zeroize();
        let cipher = cipher.map_err(|_| EncryptorError::InvalidKeyMaterial)?;
        Ok(Arc::new(Aes256GcmEncryptor { cipher }))
    }
}

// ---------------------------------------------------------------------------
// AES-256-GCM encryptor
// ---------------------------------------------------------------------------

pub struct Aes256GcmEncryptor {
    cipher: Aes256Gcm,
}

impl AuthenticatedEncryptor for Aes256GcmEncryptor {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, EncryptorError> {
        let mut nonce = [0u8; NONCE_BYTES];
        getrandom(&mut nonce).map_err(|_| EncryptorError::Encrypt)?;

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| EncryptorError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_BYTES + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, EncryptorError> {
        if ciphertext.len() < NONCE_BYTES + TAG_BYTES {
            return Err(EncryptorError::Decrypt);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_BYTES);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: body, aad })
            .map_err(|_| EncryptorError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encryptor_for(desc: &Aes256GcmDescriptor, id: &KeyId) -> Arc<dyn AuthenticatedEncryptor> {
        desc.create_encryptor(id).unwrap()
    }

    #[test]
    fn roundtrip_with_aad() {
        let desc = Aes256GcmDescriptor::generate().unwrap();
        let enc = encryptor_for(&desc, &KeyId::generate());
        let ct = enc.encrypt(b"payload", b"purpose").unwrap();
        assert_eq!(ct.len(), NONCE_BYTES + b"payload".len() + TAG_BYTES);
        assert_eq!(enc.decrypt(&ct, b"purpose").unwrap(), b"payload");
    }

    #[test]
    fn wrong_aad_fails() {
        let desc = Aes256GcmDescriptor::generate().unwrap();
        let enc = encryptor_for(&desc, &KeyId::generate());
        let ct = enc.encrypt(b"payload", b"purpose-a").unwrap();
        assert_eq!(enc.decrypt(&ct, b"purpose-b"), Err(EncryptorError::Decrypt));
    }

    #[test]
    fn subkeys_are_bound_to_key_id() {
        let desc = Aes256GcmDescriptor::from_bytes(&[7u8; 32]).unwrap();
        let a = encryptor_for(&desc, &KeyId::generate());
        let b = encryptor_for(&desc, &KeyId::generate());
        let ct = a.encrypt(b"payload", b"").unwrap();
        assert_eq!(b.decrypt(&ct, b""), Err(EncryptorError::Decrypt));
    }

    #[test]
    fn same_material_and_id_interoperate() {
        let id = KeyId::generate();
        let a = encryptor_for(&Aes256GcmDescriptor::from_bytes(&[9u8; 32]).unwrap(), &id);
        let b = encryptor_for(&Aes256GcmDescriptor::from_bytes(&[9u8; 32]).unwrap(), &id);
        let ct = a.encrypt(b"shared", b"ctx").unwrap();
        assert_eq!(b.decrypt(&ct, b"ctx").unwrap(), b"shared");
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let desc = Aes256GcmDescriptor::generate().unwrap();
        let enc = encryptor_for(&desc, &KeyId::generate());
        assert_eq!(enc.decrypt(&[0u8; 27], b""), Err(EncryptorError::Decrypt));
    }

    #[test]
    fn short_material_rejected() {
        assert!(matches!(
            Aes256GcmDescriptor::from_bytes(&[1u8; 16]),
            Err(EncryptorError::InvalidKeyMaterial)
        ));
    }

    #[test]
    fn debug_redacts_material() {
        let desc = Aes256GcmDescriptor::from_bytes(&[0xAB; 32]).unwrap();
        assert!(!format!("{:?}", desc).contains("171"));
    }
}
