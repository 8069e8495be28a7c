//! Extended-attribute value encryption
//!
//! Each object gets its own AES-256-GCM context, keyed by
//! `HKDF-SHA256(xattr_key, salt = object id, info = "sealfs-xattr")`.
//! Every value is sealed under a fresh 16-byte IV with `id ‖ name` as
//! associated data, so a value cannot be replayed under another name or
//! onto another object.
//!
//! Stored blob: `[16-byte IV][ciphertext][16-byte tag]`

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use sealfs_core::{ObjectId, SealfsError, SealfsResult};

use crate::keys::{random_bytes, SecretKey};
use crate::KEY_LENGTH;

pub const XATTR_IV_LENGTH: usize = 16;
pub const XATTR_MAC_LENGTH: usize = 16;

const XATTR_HKDF_INFO: &[u8] = b"sealfs-xattr";

type XattrAead = AesGcm<Aes256, U16>;

/// Per-object extended-attribute cipher; built once when the object is loaded.
pub struct XattrCipher {
    id: ObjectId,
    aead: XattrAead,
}

impl XattrCipher {
    pub fn new(xattr_key: &SecretKey, id: &ObjectId) -> SealfsResult<Self> {
        let hkdf = Hkdf::<Sha256>::new(Some(id.as_bytes()), xattr_key.as_bytes());
        let mut okm = Zeroizing::new([0u8; KEY_LENGTH]);
        hkdf.expand(XATTR_HKDF_INFO, &mut okm[..])
            .map_err(|e| SealfsError::crypto(format!("HKDF expand failed: {e}")))?;
        let aead = XattrAead::new_from_slice(&okm[..])
            .map_err(|e| SealfsError::crypto(format!("AES-256-GCM key: {e}")))?;
        Ok(Self { id: *id, aead })
    }

    fn associated_data(&self, name: &str) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.id.as_bytes().len() + name.len());
        aad.extend_from_slice(self.id.as_bytes());
        aad.extend_from_slice(name.as_bytes());
        aad
    }

    /// Seal `value` for attribute `name`.
    pub fn seal(&self, name: &str, value: &[u8]) -> SealfsResult<Vec<u8>> {
        let iv: [u8; XATTR_IV_LENGTH] = random_bytes();
        let aad = self.associated_data(name);
        let ciphertext = self
            .aead
            .encrypt(
                Nonce::<U16>::from_slice(&iv),
                Payload {
                    msg: value,
                    aad: &aad,
                },
            )
            .map_err(|_| SealfsError::crypto("xattr encryption failed"))?;

        let mut blob = Vec::with_capacity(XATTR_IV_LENGTH + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Open a blob produced by [`XattrCipher::seal`] for the same name.
    pub fn open(&self, name: &str, blob: &[u8]) -> SealfsResult<Vec<u8>> {
        if blob.len() < XATTR_IV_LENGTH + XATTR_MAC_LENGTH {
            return Err(SealfsError::crypto(format!(
                "xattr {name:?} too short: {} bytes",
                blob.len()
            )));
        }
        let (iv, sealed) = blob.split_at(XATTR_IV_LENGTH);
        let aad = self.associated_data(name);
        self.aead
            .decrypt(
                Nonce::<U16>::from_slice(iv),
                Payload {
                    msg: sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| SealfsError::crypto(format!("xattr {name:?} failed authentication")))
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.id
    }
}

impl std::fmt::Debug for XattrCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XattrCipher")
            .field("id", &self.id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}
