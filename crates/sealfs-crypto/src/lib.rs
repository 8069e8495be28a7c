//! sealfs-crypto: everything between a password and usable key material
//!
//! Unlock path:
//! ```text
//! password (+ keyfile) ─┐
//!                       ├─ HMAC-SHA256(salt, keyfile) ─► effective salt
//! salt ─────────────────┘                                     │
//!                            PBKDF2 / scrypt / Argon2id ◄─────┘
//!                                        │ 256-bit wrapping key
//!                                        ▼
//!             AES-256-GCM (32-byte IV, AAD = version header) ─► master key
//!                                        │
//!            version 4: name ‖ content ‖ xattr ‖ padding (4 × 256-bit)
//!            versions 1-3: one 256-bit key for every purpose
//! ```
//!
//! Older filesystems were wrapped with `HMAC-SHA256(derived_key, keyfile)`
//! instead of salting first; `parse` accepts both orders.

pub mod config_file;
pub mod kdf;
pub mod keys;
pub mod names;
pub mod security_config;
pub mod xattr;

pub use config_file::{change_credentials, create_config_file, load_format, read_config, Credentials};
pub use kdf::{derive, derive_new, KdfParams, KdfSettings, PbkdfAlgorithm};
pub use keys::{hmac_sha256, KeySet, MasterKey, SecretKey};
pub use names::long_name_component;
pub use security_config::{generate, parse, FormatParams, SecurityConfig};
pub use xattr::XattrCipher;

/// Size of every symmetric key and derived key (256-bit)
pub const KEY_LENGTH: usize = 32;

/// Size of the random salt stored in the security config
pub const SALT_LENGTH: usize = 32;
