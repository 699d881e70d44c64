//! AES-256-CTR wrapper.

use super::Wrapper;
use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use md5::{Digest, Md5};
use rand::RngCore;
use stowage_core::{Error, Result, WrapTag};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 16;

/// How the CTR nonce is chosen per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceMode {
    /// Fresh random 16-byte nonce per wrap, prefixed to the ciphertext.
    ///
    /// Identical plaintext wraps to different ciphertext, so content-addressed
    /// dedup is lost across identical fragments.
    Random,
    /// One fixed nonce derived from the key (its MD5). Identical plaintext
    /// wraps identically, preserving dedup, but every message under the same
    /// key shares a keystream.
    KeyDerived,
}

/// AES-256 in counter mode, keyed at construction.
///
/// Not registered by default; the owner of the key registers an instance
/// under the `aes256` tag.
pub struct Aes256CtrWrapper {
    key: [u8; KEY_LEN],
    mode: NonceMode,
}

impl Aes256CtrWrapper {
    /// A wrapper using a random per-message nonce.
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self::with_mode(key, NonceMode::Random)
    }

    /// A wrapper with an explicit nonce mode.
    pub fn with_mode(key: [u8; KEY_LEN], mode: NonceMode) -> Self {
        Self { key, mode }
    }

    fn derived_nonce(&self) -> [u8; NONCE_LEN] {
        let digest = Md5::digest(self.key);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest);
        nonce
    }

    fn apply(&self, nonce: &[u8; NONCE_LEN], data: &[u8]) -> Vec<u8> {
        let mut cipher = Aes256Ctr::new(&self.key.into(), &(*nonce).into());
        let mut out = data.to_vec();
        cipher.apply_keystream(&mut out);
        out
    }
}

impl Wrapper for Aes256CtrWrapper {
    fn tag(&self) -> WrapTag {
        WrapTag::new("aes256")
    }

    fn wrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.mode {
            NonceMode::Random => {
                let mut nonce = [0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce);
                let mut out = Vec::with_capacity(NONCE_LEN + data.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&self.apply(&nonce, data));
                Ok(out)
            }
            NonceMode::KeyDerived => Ok(self.apply(&self.derived_nonce(), data)),
        }
    }

    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.mode {
            NonceMode::Random => {
                if data.len() < NONCE_LEN {
                    return Err(Error::unwrap_failed("ciphertext shorter than nonce"));
                }
                let mut nonce = [0u8; NONCE_LEN];
                nonce.copy_from_slice(&data[..NONCE_LEN]);
                Ok(self.apply(&nonce, &data[NONCE_LEN..]))
            }
            NonceMode::KeyDerived => Ok(self.apply(&self.derived_nonce(), data)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];

    #[test]
    fn test_random_mode_roundtrip() {
        let w = Aes256CtrWrapper::new(KEY);
        let data = b"secret bytes";
        let wrapped = w.wrap(data).unwrap();
        assert_eq!(wrapped.len(), data.len() + 16);
        assert_eq!(w.unwrap(&wrapped).unwrap(), data);
    }

    #[test]
    fn test_random_mode_is_randomized() {
        let w = Aes256CtrWrapper::new(KEY);
        let a = w.wrap(b"same plaintext").unwrap();
        let b = w.wrap(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_derived_mode_is_deterministic() {
        let w = Aes256CtrWrapper::with_mode(KEY, NonceMode::KeyDerived);
        let a = w.wrap(b"same plaintext").unwrap();
        let b = w.wrap(b"same plaintext").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), b"same plaintext".len());
        assert_eq!(w.unwrap(&a).unwrap(), b"same plaintext");
    }

    #[test]
    fn test_wrong_key_garbles() {
        let w = Aes256CtrWrapper::with_mode(KEY, NonceMode::KeyDerived);
        let other = Aes256CtrWrapper::with_mode([0x43; 32], NonceMode::KeyDerived);
        let wrapped = w.wrap(b"secret bytes").unwrap();
        assert_ne!(other.unwrap(&wrapped).unwrap(), b"secret bytes");
    }

    #[test]
    fn test_short_ciphertext_rejected_in_random_mode() {
        let w = Aes256CtrWrapper::new(KEY);
        assert!(w.unwrap(&[0u8; 8]).is_err());
    }
}
