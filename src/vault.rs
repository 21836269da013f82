//! Credential vault for wallet keys and OAuth tokens
//!
//! ChaCha20-Poly1305 AEAD with a fresh random nonce per encryption. The key
//! is process-wide configuration loaded from the environment; it is never
//! logged and no accessor returns it. Decryption failure is a hard failure -
//! no partial plaintext ever escapes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use solana_sdk::signature::Keypair;
use tracing::debug;

use crate::error::{Error, Result};

/// Storage envelope version prefix
const ENVELOPE_PREFIX: &str = "enc:v1";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Ciphertext plus the nonce it was sealed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// Render as the stable storage form `enc:v1:<nonce-b64>:<ct-b64>`
    pub fn to_envelope(&self) -> String {
        format!(
            "{}:{}:{}",
            ENVELOPE_PREFIX,
            URL_SAFE_NO_PAD.encode(self.nonce),
            URL_SAFE_NO_PAD.encode(&self.ciphertext)
        )
    }

    /// Parse the storage form back into a blob
    pub fn from_envelope(envelope: &str) -> Result<Self> {
        let mut parts = envelope.split(':');
        let version = parts.next().unwrap_or_default();
        let sub_version = parts.next().unwrap_or_default();
        let nonce_b64 = parts.next().unwrap_or_default();
        let ct_b64 = parts.next().unwrap_or_default();

        if version != "enc" || sub_version != "v1" || parts.next().is_some() {
            return Err(Error::VaultDecrypt("malformed envelope".into()));
        }

        let nonce_raw = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|e| Error::VaultDecrypt(format!("bad nonce encoding: {}", e)))?;
        let nonce: [u8; NONCE_LEN] = nonce_raw
            .try_into()
            .map_err(|_| Error::VaultDecrypt("nonce length is invalid".into()))?;

        let ciphertext = URL_SAFE_NO_PAD
            .decode(ct_b64)
            .map_err(|e| Error::VaultDecrypt(format!("bad ciphertext encoding: {}", e)))?;

        Ok(Self { nonce, ciphertext })
    }
}

/// Decrypted signing key, scoped to one signing operation
///
/// Holds the plaintext key bytes only for the lifetime of the guard and
/// zeroes them on drop, on every exit path.
pub struct SigningKey {
    keypair: Keypair,
    secret: Vec<u8>,
}

impl SigningKey {
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        for b in self.secret.iter_mut() {
            *b = 0;
        }
    }
}

/// Encrypts and decrypts secrets at rest
pub struct CredentialVault {
    cipher: ChaCha20Poly1305,
}

impl CredentialVault {
    /// Build a vault from a raw 32-byte key
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(Error::VaultKey(format!(
                "expected {} key bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| Error::VaultKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Build a vault from a base64-encoded key in the given environment variable
    pub fn from_env(var: &str) -> Result<Self> {
        let encoded =
            std::env::var(var).map_err(|_| Error::MissingEnvVar(var.to_string()))?;
        let key = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| Error::VaultKey(format!("key is not valid base64: {}", e)))?;
        let vault = Self::new(&key)?;
        debug!("Credential vault initialized from {}", var);
        Ok(vault)
    }

    /// Encrypt plaintext under a fresh random nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::VaultEncrypt(e.to_string()))?;
        Ok(EncryptedBlob {
            nonce: nonce.into(),
            ciphertext,
        })
    }

    /// Decrypt a blob, failing hard on tag mismatch or corruption
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(&blob.nonce), blob.ciphertext.as_ref())
            .map_err(|_| Error::VaultDecrypt("authentication tag mismatch".into()))
    }

    /// Encrypt straight to the storage envelope form
    pub fn encrypt_to_envelope(&self, plaintext: &[u8]) -> Result<String> {
        Ok(self.encrypt(plaintext)?.to_envelope())
    }

    /// Decrypt a storage envelope
    pub fn decrypt_envelope(&self, envelope: &str) -> Result<Vec<u8>> {
        self.decrypt(&EncryptedBlob::from_envelope(envelope)?)
    }

    /// Decrypt a wallet signing key for the duration of one signing operation
    ///
    /// The returned guard zeroes the plaintext bytes when it goes out of scope.
    pub fn decrypt_signing_key(&self, envelope: &str) -> Result<SigningKey> {
        let secret = self.decrypt_envelope(envelope)?;
        let keypair = Keypair::from_bytes(&secret)
            .map_err(|e| Error::InvalidKeypair(e.to_string()))?;
        Ok(SigningKey { keypair, secret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::signer::Signer;

    fn test_vault() -> CredentialVault {
        CredentialVault::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let vault = test_vault();
        for plaintext in [&b""[..], b"x", b"hello world", &[0u8; 1024]] {
            let blob = vault.encrypt(plaintext).unwrap();
            assert_eq!(vault.decrypt(&blob).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_nonce_per_operation() {
        let vault = test_vault();
        let a = vault.encrypt(b"same input").unwrap();
        let b = vault.encrypt(b"same input").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let vault = test_vault();
        let mut blob = vault.encrypt(b"secret key material").unwrap();
        blob.ciphertext[0] ^= 0x01;
        match vault.decrypt(&blob) {
            Err(Error::VaultDecrypt(_)) => {}
            other => panic!("expected VaultDecrypt, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_key_rejected() {
        let blob = test_vault().encrypt(b"secret").unwrap();
        let other = CredentialVault::new(&[8u8; 32]).unwrap();
        assert!(other.decrypt(&blob).is_err());
    }

    #[test]
    fn test_envelope_round_trip() {
        let vault = test_vault();
        let envelope = vault.encrypt_to_envelope(b"token").unwrap();
        assert!(envelope.starts_with("enc:v1:"));
        assert_eq!(vault.decrypt_envelope(&envelope).unwrap(), b"token");
    }

    #[test]
    fn test_malformed_envelope_rejected() {
        let vault = test_vault();
        for bad in ["", "enc:v2:AAAA:BBBB", "enc:v1:notbase64!!:x", "plain text"] {
            assert!(vault.decrypt_envelope(bad).is_err(), "accepted: {}", bad);
        }
    }

    #[test]
    fn test_signing_key_scoped_decrypt() {
        let vault = test_vault();
        let keypair = Keypair::new();
        let expected = keypair.pubkey();
        let envelope = vault.encrypt_to_envelope(&keypair.to_bytes()).unwrap();

        let key = vault.decrypt_signing_key(&envelope).unwrap();
        assert_eq!(key.keypair().pubkey(), expected);
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(CredentialVault::new(&[1u8; 16]).is_err());
    }
}
