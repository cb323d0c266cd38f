//! AES-256-GCM envelope keyed by HKDF-SHA256 over the deploy secret.
//!
//! Layout: `version (1 byte) || nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! The nonce is derived from the plaintext under a separate HKDF key, so the
//! same plaintext always seals to the same bytes and `encrypt(decrypt(c)) == c`.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::VaultError;

const VERSION: u8 = 1;
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;

const SALT: &[u8] = b"jobpilot-vault";
const KEY_INFO: &[u8] = b"jobpilot vault v1 aes-256-gcm key";
const NONCE_INFO: &[u8] = b"jobpilot vault v1 nonce key";

pub struct Cipher {
    aead: Aes256Gcm,
    nonce_key: Zeroizing<[u8; KEY_SIZE]>,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(..)")
    }
}

impl Cipher {
    /// Derives both keys from the deploy secret. An empty secret is refused.
    pub fn from_secret(secret: &str) -> Result<Self, VaultError> {
        if secret.trim().is_empty() {
            return Err(VaultError::SecretUnavailable);
        }
        let hk = Hkdf::<Sha256>::new(Some(SALT), secret.as_bytes());

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        hk.expand(KEY_INFO, key.as_mut())
            .map_err(|e| VaultError::Crypto(format!("key derivation failed: {e}")))?;
        let mut nonce_key = Zeroizing::new([0u8; KEY_SIZE]);
        hk.expand(NONCE_INFO, nonce_key.as_mut())
            .map_err(|e| VaultError::Crypto(format!("key derivation failed: {e}")))?;

        let aead = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| VaultError::Crypto(format!("key init failed: {e}")))?;
        Ok(Self { aead, nonce_key })
    }

    fn nonce_for(&self, plaintext: &[u8]) -> Result<[u8; NONCE_SIZE], VaultError> {
        let hk = Hkdf::<Sha256>::new(Some(self.nonce_key.as_ref()), plaintext);
        let mut nonce = [0u8; NONCE_SIZE];
        hk.expand(b"nonce", &mut nonce)
            .map_err(|e| VaultError::Crypto(format!("nonce derivation failed: {e}")))?;
        Ok(nonce)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let nonce_bytes = self.nonce_for(plaintext)?;
        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| VaultError::Crypto(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(1 + NONCE_SIZE + sealed.len());
        out.push(VERSION);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<Vec<u8>, VaultError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        if ciphertext.len() < 1 + NONCE_SIZE + TAG_SIZE {
            return Err(VaultError::DecryptFailure("ciphertext too short".to_string()));
        }
        if ciphertext[0] != VERSION {
            return Err(VaultError::DecryptFailure(format!(
                "unknown envelope version {}",
                ciphertext[0]
            )));
        }
        let nonce = Nonce::from_slice(&ciphertext[1..1 + NONCE_SIZE]);
        self.aead
            .decrypt(nonce, &ciphertext[1 + NONCE_SIZE..])
            .map(Zeroizing::new)
            .map_err(|_| VaultError::DecryptFailure("authentication failed".to_string()))
    }

    pub fn decrypt_string(&self, ciphertext: &[u8]) -> Result<Zeroizing<String>, VaultError> {
        let bytes = self.decrypt(ciphertext)?;
        std::str::from_utf8(&bytes)
            .map(|s| Zeroizing::new(s.to_string()))
            .map_err(|e| VaultError::DecryptFailure(format!("not utf-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let cipher = Cipher::from_secret("deploy-secret").unwrap();
        let ct = cipher.encrypt_str("hunter2").unwrap();
        assert_eq!(ct[0], VERSION);
        assert_eq!(cipher.decrypt_string(&ct).unwrap().as_str(), "hunter2");
    }

    #[test]
    fn test_reencrypting_plaintext_reproduces_ciphertext() {
        let cipher = Cipher::from_secret("deploy-secret").unwrap();
        let ct = cipher.encrypt_str("refresh-token-abc").unwrap();
        let pt = cipher.decrypt(&ct).unwrap();
        assert_eq!(cipher.encrypt(&pt).unwrap(), ct);
    }

    #[test]
    fn test_other_process_with_same_secret_can_decrypt() {
        let a = Cipher::from_secret("shared").unwrap();
        let b = Cipher::from_secret("shared").unwrap();
        let ct = a.encrypt_str("pw").unwrap();
        assert_eq!(b.decrypt_string(&ct).unwrap().as_str(), "pw");
    }

    #[test]
    fn test_wrong_secret_fails_to_decrypt() {
        let a = Cipher::from_secret("right").unwrap();
        let b = Cipher::from_secret("wrong").unwrap();
        let ct = a.encrypt_str("pw").unwrap();
        assert!(matches!(b.decrypt(&ct), Err(VaultError::DecryptFailure(_))));
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let cipher = Cipher::from_secret("secret").unwrap();
        let mut ct = cipher.encrypt_str("pw").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(cipher.decrypt(&ct).is_err());
        assert!(cipher.decrypt(&[VERSION, 1, 2]).is_err());
    }

    #[test]
    fn test_empty_secret_is_unavailable() {
        assert!(matches!(
            Cipher::from_secret("  "),
            Err(VaultError::SecretUnavailable)
        ));
    }
}
