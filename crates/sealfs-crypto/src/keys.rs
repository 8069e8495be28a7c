//! Key material: derived keys, the wrapped master key and its sub-keys

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use sealfs_core::{SealfsError, SealfsResult};

use crate::KEY_LENGTH;

/// Master key length for format versions 1-3 (one shared key)
pub const LEGACY_MASTER_KEY_LENGTH: usize = KEY_LENGTH;

/// Master key length for format version 4 (four independent sub-keys)
pub const SPLIT_MASTER_KEY_LENGTH: usize = 4 * KEY_LENGTH;

/// A 256-bit secret (KDF output, HMAC output, sub-key). Zeroized on drop.
#[derive(Clone)]
pub struct SecretKey {
    bytes: [u8; KEY_LENGTH],
}

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> SealfsResult<Self> {
        let bytes = <[u8; KEY_LENGTH]>::try_from(bytes).map_err(|_| {
            SealfsError::crypto(format!(
                "key has wrong size: {} bytes (expected {KEY_LENGTH})",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    pub fn random() -> Self {
        let mut key = Self {
            bytes: [0u8; KEY_LENGTH],
        };
        rand::thread_rng().fill_bytes(&mut key.bytes);
        key
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.bytes
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The random key stored (wrapped) in the security config.
///
/// 32 bytes for format versions 1-3, 128 bytes for version 4.
#[derive(Clone)]
pub struct MasterKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl MasterKey {
    /// Fresh random master key of the length `version` requires.
    pub fn generate(version: u32) -> SealfsResult<Self> {
        let mut bytes = Zeroizing::new(vec![0u8; Self::expected_length(version)?]);
        rand::thread_rng().fill_bytes(&mut bytes);
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: Zeroizing<Vec<u8>>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn expected_length(version: u32) -> SealfsResult<usize> {
        match version {
            1..=3 => Ok(LEGACY_MASTER_KEY_LENGTH),
            4 => Ok(SPLIT_MASTER_KEY_LENGTH),
            v => Err(SealfsError::config(format!("unsupported format version {v}"))),
        }
    }

    /// Split into purpose-specific keys.
    ///
    /// A 128-byte key yields four distinct sub-keys in the order
    /// name, content, xattr, padding. A 32-byte key is used for everything.
    pub fn key_set(&self) -> SealfsResult<KeySet> {
        match self.bytes.len() {
            LEGACY_MASTER_KEY_LENGTH => {
                let key = SecretKey::from_slice(&self.bytes)?;
                Ok(KeySet {
                    name: key.clone(),
                    content: key.clone(),
                    xattr: key.clone(),
                    padding: key,
                })
            }
            SPLIT_MASTER_KEY_LENGTH => {
                let mut parts = self.bytes.chunks_exact(KEY_LENGTH);
                let mut next = || -> SealfsResult<SecretKey> {
                    let part = parts
                        .next()
                        .ok_or_else(|| SealfsError::crypto("master key truncated"))?;
                    SecretKey::from_slice(part)
                };
                Ok(KeySet {
                    name: next()?,
                    content: next()?,
                    xattr: next()?,
                    padding: next()?,
                })
            }
            n => Err(SealfsError::crypto(format!(
                "master key has wrong size: {n} bytes"
            ))),
        }
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.as_slice() == other.bytes.as_slice()
    }
}

impl Eq for MasterKey {}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Purpose-specific keys handed to the object model.
#[derive(Clone, Debug)]
pub struct KeySet {
    pub name: SecretKey,
    pub content: SecretKey,
    pub xattr: SecretKey,
    pub padding: SecretKey,
}

/// HMAC-SHA256 of `message` under `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> SecretKey {
    let mut mac = match <Hmac<Sha256> as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
    };
    mac.update(message);
    let mut tag = mac.finalize().into_bytes();
    let mut key = SecretKey {
        bytes: [0u8; KEY_LENGTH],
    };
    key.bytes.copy_from_slice(&tag);
    tag.as_mut_slice().zeroize();
    key
}

/// Fill a fixed-size array from the thread RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
