//! Passphrase key derivation and private key sealing.
//!
//! Argon2id turns the passphrase into a 32-byte key. A blake3 hash of that key
//! is stored as the verifier so a wrong passphrase is rejected before any
//! ciphertext is touched. Each private key is sealed on its own with
//! ChaCha20-Poly1305 and a fresh nonce.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::core::fs::{decode_base64, encode_base64};
use crate::error::{Result, WalletError};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 16;

const AAD_PRIVATE_KEY: &[u8] = b"beespv-private-key";

/// Argon2id cost parameters. Stored alongside the salt so a wallet written with
/// one set of costs still opens after the defaults change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self { Self { memory_kib: 64 * 1024, iterations: 3, parallelism: 4 } }
}

impl KdfParams {
    /// Minimal costs for tests and throwaway regtest wallets.
    pub fn insecure_fast() -> Self { Self { memory_kib: 1024, iterations: 1, parallelism: 1 } }
}

/// Key derived from the passphrase. Wiped on drop.
#[derive(Clone)]
pub struct DerivedKey(Zeroizing<[u8; KEY_LEN]>);

impl DerivedKey {
    fn verifier(&self) -> String { blake3::hash(self.0.as_ref()).to_hex().to_string() }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("DerivedKey(..)") }
}

/// Salt, verifier and costs. Everything needed to turn a passphrase back into
/// the sealing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCrypter {
    pub salt: String,
    pub verifier: String,
    pub params: KdfParams,
}

impl KeyCrypter {
    /// Fresh salt, derive, record verifier.
    pub fn create(passphrase: &str, params: KdfParams) -> Result<(Self, DerivedKey)> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let key = derive(passphrase, &salt, params)?;
        let crypter = Self { salt: encode_base64(&salt), verifier: key.verifier(), params };
        Ok((crypter, key))
    }

    /// Derive and check against the verifier.
    pub fn unlock(&self, passphrase: &str) -> Result<DerivedKey> {
        let salt = decode_base64(&self.salt)?;
        let key = derive(passphrase, &salt, self.params)?;
        if key.verifier() != self.verifier {
            return Err(WalletError::WrongPassphrase);
        }
        Ok(key)
    }
}

fn derive(passphrase: &str, salt: &[u8], params: KdfParams) -> Result<DerivedKey> {
    let argon_params = Params::new(params.memory_kib, params.iterations, params.parallelism, Some(KEY_LEN))
        .map_err(|e| WalletError::Unknown(format!("argon2 params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    argon
        .hash_password_into(passphrase.as_bytes(), salt, out.as_mut())
        .map_err(|e| WalletError::Unknown(format!("argon2: {e}")))?;
    Ok(DerivedKey(out))
}

/// A sealed private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub nonce: String,
    pub ciphertext: String,
}

pub fn seal(key: &DerivedKey, plaintext: &[u8]) -> Result<Sealed> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.0.as_ref())
        .map_err(|e| WalletError::Unknown(format!("cipher init: {e}")))?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: AAD_PRIVATE_KEY })
        .map_err(|e| WalletError::Unknown(format!("encrypt: {e}")))?;
    Ok(Sealed { nonce: encode_base64(&nonce), ciphertext: encode_base64(&ciphertext) })
}

pub fn open(key: &DerivedKey, sealed: &Sealed) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.0.as_ref())
        .map_err(|e| WalletError::Unknown(format!("cipher init: {e}")))?;
    let nonce: [u8; NONCE_LEN] = decode_base64(&sealed.nonce)?
        .try_into()
        .map_err(|_| WalletError::StorageFailure("sealed key nonce invalid".into()))?;
    let ciphertext = decode_base64(&sealed.ciphertext)?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: &ciphertext, aad: AAD_PRIVATE_KEY })
        .map(Zeroizing::new)
        .map_err(|_| WalletError::WrongPassphrase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlock_accepts_right_passphrase_only() {
        let (crypter, key) = KeyCrypter::create("hunter2", KdfParams::insecure_fast()).unwrap();
        let again = crypter.unlock("hunter2").unwrap();
        assert_eq!(key.verifier(), again.verifier());
        assert!(matches!(crypter.unlock("hunter3"), Err(WalletError::WrongPassphrase)));
    }

    #[test]
    fn seal_open_with_other_key_fails() {
        let (_, key) = KeyCrypter::create("a", KdfParams::insecure_fast()).unwrap();
        let (_, other) = KeyCrypter::create("b", KdfParams::insecure_fast()).unwrap();
        let sealed = seal(&key, &[7u8; 32]).unwrap();
        assert_eq!(open(&key, &sealed).unwrap().as_slice(), &[7u8; 32]);
        assert!(matches!(open(&other, &sealed), Err(WalletError::WrongPassphrase)));
    }

    #[test]
    fn nonces_differ_per_seal() {
        let (_, key) = KeyCrypter::create("a", KdfParams::insecure_fast()).unwrap();
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
    }
}
