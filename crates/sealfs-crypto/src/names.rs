//! Long-name components: fixed-length stand-ins for over-long encrypted names
//!
//! An encrypted name that exceeds the backing filesystem's component limit is
//! stored under `"_" + hex(AES-SIV(name_key, SHA-256(encrypted_name))) + "_"`.
//! The full name is recovered through a lookup table keyed by that component.

use aes_siv::aead::KeyInit;
use aes_siv::siv::Aes128Siv;
use sha2::{Digest, Sha256};

use sealfs_core::{SealfsError, SealfsResult};

use crate::keys::SecretKey;

/// Default path-component limit of the backing filesystem (bytes)
pub const DEFAULT_NAME_LIMIT: usize = 255;

/// SIV tag (16) + encrypted digest (32), hex encoded
const COMPONENT_HEX_LENGTH: usize = 2 * (16 + 32);

/// Total component length including both underscores
pub const LONG_NAME_COMPONENT_LENGTH: usize = COMPONENT_HEX_LENGTH + 2;

/// Whether an encrypted name must be replaced by a long-name component.
pub fn needs_long_name_component(encrypted_name: &str, limit: usize) -> bool {
    encrypted_name.len() > limit
}

/// Deterministic stand-in component for `encrypted_name`.
pub fn long_name_component(name_key: &SecretKey, encrypted_name: &str) -> SealfsResult<String> {
    let digest = Sha256::digest(encrypted_name.as_bytes());
    let mut siv = Aes128Siv::new_from_slice(name_key.as_bytes())
        .map_err(|e| SealfsError::crypto(format!("AES-SIV key: {e}")))?;
    let no_headers: [&[u8]; 0] = [];
    let sealed = siv
        .encrypt(no_headers, digest.as_slice())
        .map_err(|_| SealfsError::crypto("AES-SIV encryption failed"))?;

    let mut component = String::with_capacity(LONG_NAME_COMPONENT_LENGTH);
    component.push('_');
    component.push_str(&hex::encode(sealed));
    component.push('_');
    Ok(component)
}

/// Whether `component` has the shape produced by [`long_name_component`].
pub fn is_long_name_component(component: &str) -> bool {
    component.len() == LONG_NAME_COMPONENT_LENGTH
        && component.starts_with('_')
        && component.ends_with('_')
        && component[1..component.len() - 1]
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
