//! Security config codec: the JSON document that wraps the master key
//!
//! ```json
//! {
//!   "version": 4,
//!   "pbkdf": "argon2id",
//!   "iterations": 9,
//!   "argon2_m_cost": 262144,
//!   "argon2_p": 4,
//!   "salt": "<64 hex>",
//!   "encrypted_key": { "IV": "<64 hex>", "MAC": "<32 hex>", "key": "<hex>" },
//!   "block_size": 4096,
//!   "iv_size": 12
//! }
//! ```
//!
//! The master key is sealed with AES-256-GCM under a 32-byte IV, with the
//! version header as associated data.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::aead::consts::U32;
use aes_gcm::{AesGcm, Nonce};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use sealfs_core::{SealfsError, SealfsResult};

use crate::kdf::{self, KdfParams, KdfSettings, PbkdfAlgorithm};
use crate::keys::{self, hmac_sha256, KeySet, MasterKey, SecretKey};
use crate::SALT_LENGTH;

pub const CONFIG_IV_LENGTH: usize = 32;
pub const CONFIG_MAC_LENGTH: usize = 16;

/// How the master key is sealed, as reported by `info`.
pub const KEY_WRAPPING_ALGORITHM: &str = "AES-256-GCM";

/// Version 1 fixes the content layout.
pub const V1_BLOCK_SIZE: u32 = 4096;
pub const V1_IV_SIZE: u32 = 32;

pub const MIN_FORMAT_VERSION: u32 = 1;
pub const MAX_FORMAT_VERSION: u32 = 4;

/// AES-256-GCM with the 32-byte nonce the config format uses.
type ConfigCipher = AesGcm<Aes256, U32>;

/// Associated data bound to the sealed master key.
///
/// Versions 1-3 share one header; existing filesystems depend on it.
pub fn version_header(version: u32) -> SealfsResult<&'static str> {
    match version {
        1..=3 => Ok("version=1"),
        4 => Ok("version=4"),
        v => Err(SealfsError::config(format!("unknown format version {v}"))),
    }
}

fn default_pbkdf() -> String {
    PbkdfAlgorithm::Pbkdf2HmacSha256.as_str().to_string()
}

fn is_zero(v: &Option<u32>) -> bool {
    matches!(v, None | Some(0))
}

fn is_false(v: &Option<bool>) -> bool {
    !matches!(v, Some(true))
}

/// The on-disk security config, field for field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub version: u32,
    #[serde(default = "default_pbkdf")]
    pub pbkdf: String,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrypt_r: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrypt_p: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argon2_m_cost: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argon2_p: Option<u32>,
    pub salt: String,
    pub encrypted_key: EncryptedKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv_size: Option<u32>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_padding: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub long_name_component: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKey {
    #[serde(rename = "IV")]
    pub iv: String,
    #[serde(rename = "MAC")]
    pub mac: String,
    pub key: String,
}

impl SecurityConfig {
    pub fn from_json(json: &str) -> SealfsResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| SealfsError::config(format!("malformed security config: {e}")))
    }

    pub fn to_json_pretty(&self) -> SealfsResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SealfsError::config(format!("serializing security config: {e}")))
    }

    /// Cost parameters recorded in this config.
    pub fn kdf_params(&self) -> SealfsResult<KdfParams> {
        let algorithm: PbkdfAlgorithm = self.pbkdf.parse()?;
        let required = |field: Option<u32>, name: &str| {
            field.ok_or_else(|| SealfsError::config(format!("{} config lacks {name}", self.pbkdf)))
        };
        Ok(match algorithm {
            PbkdfAlgorithm::Pbkdf2HmacSha256 => KdfParams::Pbkdf2 {
                iterations: self.iterations,
            },
            PbkdfAlgorithm::Scrypt => KdfParams::Scrypt {
                n: self.iterations,
                r: required(self.scrypt_r, "scrypt_r")?,
                p: required(self.scrypt_p, "scrypt_p")?,
            },
            PbkdfAlgorithm::Argon2id => KdfParams::Argon2id {
                t_cost: self.iterations,
                m_cost: required(self.argon2_m_cost, "argon2_m_cost")?,
                parallelism: required(self.argon2_p, "argon2_p")?,
            },
        })
    }

    pub fn salt_bytes(&self) -> SealfsResult<[u8; SALT_LENGTH]> {
        decode_hex_array(&self.salt, "salt")
    }

    /// Non-secret summary for display.
    pub fn info(&self) -> ConfigInfo {
        ConfigInfo {
            version: self.version,
            pbkdf: self.pbkdf.clone(),
            iterations: self.iterations,
            scrypt_r: self.scrypt_r,
            scrypt_p: self.scrypt_p,
            argon2_m_cost: self.argon2_m_cost,
            argon2_p: self.argon2_p,
            has_salt: !self.salt.is_empty(),
            key_wrapping: KEY_WRAPPING_ALGORITHM,
            block_size: self.block_size.unwrap_or(V1_BLOCK_SIZE),
            iv_size: self.iv_size.unwrap_or(V1_IV_SIZE),
            max_padding: self.max_padding.unwrap_or(0),
            long_name_component: self.long_name_component.unwrap_or(false),
        }
    }
}

/// What `sealfs info` prints; never contains key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigInfo {
    pub version: u32,
    pub pbkdf: String,
    pub iterations: u32,
    pub scrypt_r: Option<u32>,
    pub scrypt_p: Option<u32>,
    pub argon2_m_cost: Option<u32>,
    pub argon2_p: Option<u32>,
    pub has_salt: bool,
    pub key_wrapping: &'static str,
    pub block_size: u32,
    pub iv_size: u32,
    pub max_padding: u32,
    pub long_name_component: bool,
}

/// Decrypted filesystem parameters: the plaintext behind a security config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatParams {
    pub version: u32,
    pub master_key: MasterKey,
    pub block_size: u32,
    pub iv_size: u32,
    pub max_padding: u32,
    pub long_name_component: bool,
}

impl FormatParams {
    /// Fresh parameters with a random master key.
    ///
    /// Version 1 ignores `block_size` and `iv_size` and uses 4096 / 32.
    pub fn new(
        version: u32,
        block_size: u32,
        iv_size: u32,
        max_padding: u32,
        long_name_component: bool,
    ) -> SealfsResult<Self> {
        let master_key = MasterKey::generate(version)?;
        let (block_size, iv_size) = if version == 1 {
            (V1_BLOCK_SIZE, V1_IV_SIZE)
        } else {
            (block_size, iv_size)
        };
        Ok(Self {
            version,
            master_key,
            block_size,
            iv_size,
            max_padding,
            long_name_component,
        })
    }

    /// Timestamps are encrypted into object headers from version 3 on.
    pub fn store_time(&self) -> bool {
        self.version >= 3
    }

    pub fn key_set(&self) -> SealfsResult<KeySet> {
        self.master_key.key_set()
    }
}

/// Seal `format` into a new security config.
///
/// With a keyfile the KDF salt is `HMAC-SHA256(salt, keyfile)`; the stored
/// salt is always the raw one.
pub fn generate(
    algorithm: PbkdfAlgorithm,
    keyfile: Option<&[u8]>,
    salt: &[u8; SALT_LENGTH],
    password: &[u8],
    settings: &KdfSettings,
    format: &FormatParams,
) -> SealfsResult<SecurityConfig> {
    let header = version_header(format.version)?;
    let expected = MasterKey::expected_length(format.version)?;
    if format.master_key.len() != expected {
        return Err(SealfsError::config(format!(
            "version {} needs a {expected}-byte master key, got {}",
            format.version,
            format.master_key.len()
        )));
    }

    let effective_salt = salt_with_keyfile(salt, keyfile);
    let (params, wrapping_key) =
        kdf::derive_new(algorithm, settings, password, effective_salt.as_bytes())?;

    let iv: [u8; CONFIG_IV_LENGTH] = keys::random_bytes();
    let (ciphertext, mac) = seal_master_key(&wrapping_key, &iv, header, format.master_key.as_bytes())?;

    let (scrypt_r, scrypt_p, argon2_m_cost, argon2_p) = match params {
        KdfParams::Pbkdf2 { .. } => (None, None, None, None),
        KdfParams::Scrypt { r, p, .. } => (Some(r), Some(p), None, None),
        KdfParams::Argon2id {
            m_cost,
            parallelism,
            ..
        } => (None, None, Some(m_cost), Some(parallelism)),
    };
    let versioned = format.version >= 2;

    tracing::debug!(
        version = format.version,
        pbkdf = %algorithm,
        rounds = params.rounds(),
        keyfile = keyfile.is_some(),
        "generated security config"
    );

    Ok(SecurityConfig {
        version: format.version,
        pbkdf: algorithm.as_str().to_string(),
        iterations: params.rounds(),
        scrypt_r,
        scrypt_p,
        argon2_m_cost,
        argon2_p,
        salt: hex::encode(salt),
        encrypted_key: EncryptedKey {
            iv: hex::encode(iv),
            mac: hex::encode(mac),
            key: hex::encode(&ciphertext),
        },
        block_size: versioned.then_some(format.block_size),
        iv_size: versioned.then_some(format.iv_size),
        max_padding: (format.max_padding > 0).then_some(format.max_padding),
        long_name_component: format.long_name_component.then_some(true),
    })
}

/// Unseal a security config.
///
/// Tries the current derivation order (keyfile folded into the salt), then
/// the legacy order (keyfile HMAC'd over the derived key). Both failing gives
/// the same `Authentication` error regardless of which input was wrong.
pub fn parse(
    config: &SecurityConfig,
    keyfile: Option<&[u8]>,
    password: &[u8],
) -> SealfsResult<FormatParams> {
    let version = config.version;
    let (block_size, iv_size) = match version {
        1 => (V1_BLOCK_SIZE, V1_IV_SIZE),
        2..=4 => (
            config
                .block_size
                .ok_or_else(|| SealfsError::config("security config lacks block_size"))?,
            config
                .iv_size
                .ok_or_else(|| SealfsError::config("security config lacks iv_size"))?,
        ),
        v => return Err(SealfsError::config(format!("unsupported format version {v}"))),
    };
    let header = version_header(version)?;
    let params = config.kdf_params()?;

    let salt = config.salt_bytes()?;
    let iv: [u8; CONFIG_IV_LENGTH] = decode_hex_array(&config.encrypted_key.iv, "IV")?;
    let mac: [u8; CONFIG_MAC_LENGTH] = decode_hex_array(&config.encrypted_key.mac, "MAC")?;
    let ciphertext = hex::decode(&config.encrypted_key.key)
        .map_err(|e| SealfsError::config(format!("encrypted key is not hex: {e}")))?;
    let expected = MasterKey::expected_length(version)?;
    if ciphertext.len() != expected {
        return Err(SealfsError::config(format!(
            "encrypted key is {} bytes, version {version} needs {expected}",
            ciphertext.len()
        )));
    }

    let unseal = |wrapping_key: &SecretKey| {
        open_master_key(wrapping_key, &iv, header, &ciphertext, &mac)
    };

    let effective_salt = salt_with_keyfile(&salt, keyfile);
    let derived = kdf::derive(&params, password, effective_salt.as_bytes())?;
    let mut master = unseal(&derived)?;

    // Without a keyfile both orders derive the same wrapping key.
    if master.is_none() {
        if let Some(keyfile) = keyfile {
            let derived = kdf::derive(&params, password, &salt)?;
            let wrapping_key = hmac_sha256(derived.as_bytes(), keyfile);
            master = unseal(&wrapping_key)?;
            if master.is_some() {
                tracing::debug!("security config unlocked with legacy keyfile derivation");
            }
        }
    }

    let master_key = master.ok_or(SealfsError::Authentication)?;
    Ok(FormatParams {
        version,
        master_key: MasterKey::from_bytes(master_key),
        block_size,
        iv_size,
        max_padding: config.max_padding.unwrap_or(0),
        long_name_component: config.long_name_component.unwrap_or(false),
    })
}

/// `HMAC-SHA256(salt, keyfile)` with a keyfile, otherwise the salt itself.
pub fn salt_with_keyfile(salt: &[u8; SALT_LENGTH], keyfile: Option<&[u8]>) -> SecretKey {
    match keyfile {
        Some(contents) => hmac_sha256(salt, contents),
        None => SecretKey::from_bytes(*salt),
    }
}

fn cipher(key: &SecretKey) -> SealfsResult<ConfigCipher> {
    ConfigCipher::new_from_slice(key.as_bytes())
        .map_err(|e| SealfsError::crypto(format!("AES-256-GCM key: {e}")))
}

/// Returns `(ciphertext, tag)`.
pub(crate) fn seal_master_key(
    key: &SecretKey,
    iv: &[u8; CONFIG_IV_LENGTH],
    header: &str,
    master: &[u8],
) -> SealfsResult<(Vec<u8>, [u8; CONFIG_MAC_LENGTH])> {
    let mut sealed = cipher(key)?
        .encrypt(
            Nonce::<U32>::from_slice(iv),
            Payload {
                msg: master,
                aad: header.as_bytes(),
            },
        )
        .map_err(|_| SealfsError::crypto("master key encryption failed"))?;
    let tag = sealed.split_off(sealed.len() - CONFIG_MAC_LENGTH);
    let mut mac = [0u8; CONFIG_MAC_LENGTH];
    mac.copy_from_slice(&tag);
    Ok((sealed, mac))
}

/// `Ok(None)` when the tag does not verify.
fn open_master_key(
    key: &SecretKey,
    iv: &[u8; CONFIG_IV_LENGTH],
    header: &str,
    ciphertext: &[u8],
    mac: &[u8; CONFIG_MAC_LENGTH],
) -> SealfsResult<Option<Zeroizing<Vec<u8>>>> {
    let mut sealed = Vec::with_capacity(ciphertext.len() + CONFIG_MAC_LENGTH);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(mac);
    Ok(cipher(key)?
        .decrypt(
            Nonce::<U32>::from_slice(iv),
            Payload {
                msg: &sealed,
                aad: header.as_bytes(),
            },
        )
        .ok()
        .map(Zeroizing::new))
}

fn decode_hex_array<const N: usize>(hex_str: &str, field: &str) -> SealfsResult<[u8; N]> {
    let mut out = [0u8; N];
    hex::decode_to_slice(hex_str, &mut out).map_err(|e| {
        SealfsError::config(format!("{field} must be {} hex characters: {e}", N * 2))
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_settings() -> KdfSettings {
        KdfSettings {
            rounds: 1,
            argon2_m_cost: Some(1024),
            argon2_p: Some(1),
            ..KdfSettings::default()
        }
    }

    fn cheap_settings_for(algorithm: PbkdfAlgorithm) -> KdfSettings {
        match algorithm {
            PbkdfAlgorithm::Scrypt => KdfSettings {
                rounds: 1024,
                ..cheap_settings()
            },
            PbkdfAlgorithm::Pbkdf2HmacSha256 => KdfSettings {
                rounds: 1000,
                ..cheap_settings()
            },
            PbkdfAlgorithm::Argon2id => cheap_settings(),
        }
    }

    fn format(version: u32) -> FormatParams {
        FormatParams::new(version, 4096, 12, 0, false).unwrap()
    }

    fn cheap_params(algorithm: PbkdfAlgorithm) -> KdfParams {
        match algorithm {
            PbkdfAlgorithm::Pbkdf2HmacSha256 => KdfParams::Pbkdf2 { iterations: 1000 },
            PbkdfAlgorithm::Scrypt => KdfParams::Scrypt { n: 1024, r: 8, p: 1 },
            PbkdfAlgorithm::Argon2id => KdfParams::Argon2id {
                t_cost: 1,
                m_cost: 1024,
                parallelism: 1,
            },
        }
    }

    /// Seal a config the way older releases did: derive from the raw salt,
    /// then HMAC the keyfile over the derived key.
    fn generate_legacy(
        params: KdfParams,
        keyfile: &[u8],
        salt: &[u8; SALT_LENGTH],
        password: &[u8],
        format: &FormatParams,
    ) -> SecurityConfig {
        let derived = kdf::derive(&params, password, salt).unwrap();
        let wrapping_key = hmac_sha256(derived.as_bytes(), keyfile);
        let iv = [9u8; CONFIG_IV_LENGTH];
        let header = version_header(format.version).unwrap();
        let (ciphertext, mac) =
            seal_master_key(&wrapping_key, &iv, header, format.master_key.as_bytes()).unwrap();
        let (scrypt_r, scrypt_p, argon2_m_cost, argon2_p) = match params {
            KdfParams::Pbkdf2 { .. } => (None, None, None, None),
            KdfParams::Scrypt { r, p, .. } => (Some(r), Some(p), None, None),
            KdfParams::Argon2id { m_cost, parallelism, .. } => (None, None, Some(m_cost), Some(parallelism)),
        };
        SecurityConfig {
            version: format.version,
            pbkdf: params.algorithm().as_str().into(),
            iterations: params.rounds(),
            scrypt_r,
            scrypt_p,
            argon2_m_cost,
            argon2_p,
            salt: hex::encode(salt),
            encrypted_key: EncryptedKey {
                iv: hex::encode(iv),
                mac: hex::encode(mac),
                key: hex::encode(ciphertext),
            },
            block_size: (format.version > 1).then_some(format.block_size),
            iv_size: (format.version > 1).then_some(format.iv_size),
            max_padding: None,
            long_name_component: None,
        }
    }

    #[test]
    fn test_roundtrip_all_algorithms_and_versions() {
        let salt = [3u8; SALT_LENGTH];
        for algorithm in PbkdfAlgorithm::ALL {
            for version in MIN_FORMAT_VERSION..=MAX_FORMAT_VERSION {
                let plain = format(version);
                let settings = cheap_settings_for(algorithm);
                let config = generate(algorithm, None, &salt, b"correct horse", &settings, &plain).unwrap();

                let json = config.to_json_pretty().unwrap();
                let reparsed = SecurityConfig::from_json(&json).unwrap();
                assert_eq!(reparsed, config);

                let opened = parse(&reparsed, None, b"correct horse").unwrap();
                assert_eq!(opened, plain, "{algorithm} v{version}");
            }
        }
    }

    #[test]
    fn test_v1_uses_fixed_layout() {
        let plain = FormatParams::new(1, 8192, 16, 0, false).unwrap();
        assert_eq!((plain.block_size, plain.iv_size), (4096, 32));

        let config = generate(
            PbkdfAlgorithm::Pbkdf2HmacSha256,
            None,
            &[0u8; SALT_LENGTH],
            b"pw",
            &cheap_settings_for(PbkdfAlgorithm::Pbkdf2HmacSha256),
            &plain,
        )
        .unwrap();
        assert!(config.block_size.is_none());
        assert!(config.iv_size.is_none());
        let json = config.to_json_pretty().unwrap();
        assert!(!json.contains("block_size"));
    }

    #[test]
    fn test_optional_fields_omitted_when_default() {
        let plain = format(4);
        let settings = cheap_settings_for(PbkdfAlgorithm::Pbkdf2HmacSha256);
        let config = generate(PbkdfAlgorithm::Pbkdf2HmacSha256, None, &[1u8; 32], b"pw", &settings, &plain).unwrap();
        let json = config.to_json_pretty().unwrap();
        assert!(!json.contains("max_padding"));
        assert!(!json.contains("long_name_component"));
        assert!(!json.contains("scrypt_r"));
        assert!(!json.contains("argon2_m_cost"));
        assert!(json.contains("\"IV\""));
        assert!(json.contains("\"MAC\""));

        let padded = FormatParams::new(4, 4096, 12, 64, true).unwrap();
        let config = generate(PbkdfAlgorithm::Pbkdf2HmacSha256, None, &[1u8; 32], b"pw", &settings, &padded).unwrap();
        let json = config.to_json_pretty().unwrap();
        assert!(json.contains("\"max_padding\": 64"));
        assert!(json.contains("\"long_name_component\": true"));
        let opened = parse(&config, None, b"pw").unwrap();
        assert_eq!(opened.max_padding, 64);
        assert!(opened.long_name_component);
    }

    #[test]
    fn test_field_encodings() {
        let plain = format(4);
        let config = generate(
            PbkdfAlgorithm::Scrypt,
            None,
            &[0xab; SALT_LENGTH],
            b"pw",
            &cheap_settings_for(PbkdfAlgorithm::Scrypt),
            &plain,
        )
        .unwrap();
        assert_eq!(config.salt, "ab".repeat(32));
        assert_eq!(config.encrypted_key.iv.len(), 64);
        assert_eq!(config.encrypted_key.mac.len(), 32);
        assert_eq!(config.encrypted_key.key.len(), 256);
        assert_eq!(config.iterations, 1024);
        assert_eq!(config.scrypt_r, Some(8));
        assert_eq!(config.scrypt_p, Some(1));
    }

    #[test]
    fn test_wrong_password_or_keyfile_is_generic_auth_error() {
        let salt = [5u8; SALT_LENGTH];
        let keyfile = &b"keyfile contents"[..];
        for algorithm in PbkdfAlgorithm::ALL {
            let settings = cheap_settings_for(algorithm);
            for version in MIN_FORMAT_VERSION..=MAX_FORMAT_VERSION {
                let plain = format(version);

                let with_keyfile = generate(algorithm, Some(keyfile), &salt, b"right", &settings, &plain).unwrap();
                assert_eq!(parse(&with_keyfile, Some(keyfile), b"right").unwrap(), plain);
                for (keyfile, password) in [
                    (Some(keyfile), &b"wrong"[..]),
                    (Some(&b"other keyfile"[..]), &b"right"[..]),
                    (None, &b"right"[..]),
                ] {
                    let err = parse(&with_keyfile, keyfile, password).unwrap_err();
                    assert!(matches!(err, SealfsError::Authentication), "{algorithm} v{version}");
                }

                let password_only = generate(algorithm, None, &salt, b"right", &settings, &plain).unwrap();
                for (keyfile, password) in [(None, &b"wrong"[..]), (Some(keyfile), &b"right"[..])] {
                    let err = parse(&password_only, keyfile, password).unwrap_err();
                    assert!(matches!(err, SealfsError::Authentication), "{algorithm} v{version}");
                }
            }
        }
    }

    #[test]
    fn test_legacy_keyfile_order_still_opens() {
        let salt = [6u8; SALT_LENGTH];
        for algorithm in PbkdfAlgorithm::ALL {
            for version in MIN_FORMAT_VERSION..=MAX_FORMAT_VERSION {
                let plain = format(version);
                let config = generate_legacy(cheap_params(algorithm), b"my keyfile", &salt, b"pw", &plain);

                let opened = parse(&config, Some(&b"my keyfile"[..]), b"pw").unwrap();
                assert_eq!(opened.master_key, plain.master_key, "{algorithm} v{version}");
                assert!(matches!(
                    parse(&config, Some(&b"not my keyfile"[..]), b"pw"),
                    Err(SealfsError::Authentication)
                ));
                assert!(matches!(
                    parse(&config, Some(&b"my keyfile"[..]), b"wrong"),
                    Err(SealfsError::Authentication)
                ));
            }
        }
    }

    #[test]
    fn test_version_header_is_authenticated() {
        let plain = format(3);
        let settings = cheap_settings_for(PbkdfAlgorithm::Pbkdf2HmacSha256);
        let mut config =
            generate(PbkdfAlgorithm::Pbkdf2HmacSha256, None, &[2u8; 32], b"pw", &settings, &plain).unwrap();

        // v1-3 share a header, so a 32-byte key still opens as v2...
        config.version = 2;
        assert!(parse(&config, None, b"pw").is_ok());

        // ...but the tag no longer verifies with a flipped bit.
        let mut mac = hex::decode(&config.encrypted_key.mac).unwrap();
        mac[0] ^= 1;
        config.encrypted_key.mac = hex::encode(mac);
        assert!(matches!(parse(&config, None, b"pw"), Err(SealfsError::Authentication)));
    }

    #[test]
    fn test_missing_pbkdf_defaults_to_pbkdf2() {
        let plain = format(2);
        let settings = cheap_settings_for(PbkdfAlgorithm::Pbkdf2HmacSha256);
        let config =
            generate(PbkdfAlgorithm::Pbkdf2HmacSha256, None, &[4u8; 32], b"pw", &settings, &plain).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&config.to_json_pretty().unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("pbkdf");

        let stripped = SecurityConfig::from_json(&value.to_string()).unwrap();
        assert_eq!(stripped.pbkdf, "pkcs5-pbkdf2-hmac-sha256");
        assert_eq!(parse(&stripped, None, b"pw").unwrap(), plain);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let plain = format(4);
        let settings = cheap_settings_for(PbkdfAlgorithm::Pbkdf2HmacSha256);
        let mut config =
            generate(PbkdfAlgorithm::Pbkdf2HmacSha256, None, &[4u8; 32], b"pw", &settings, &plain).unwrap();
        for version in [0, 5, 99] {
            config.version = version;
            assert!(matches!(parse(&config, None, b"pw"), Err(SealfsError::Config(_))));
        }
        assert!(version_header(5).is_err());
    }

    #[test]
    fn test_encrypted_key_length_checked_before_decrypting() {
        let plain = format(4);
        let settings = cheap_settings_for(PbkdfAlgorithm::Pbkdf2HmacSha256);
        let mut config =
            generate(PbkdfAlgorithm::Pbkdf2HmacSha256, None, &[4u8; 32], b"pw", &settings, &plain).unwrap();
        config.version = 3;
        assert!(matches!(parse(&config, None, b"pw"), Err(SealfsError::Config(_))));
    }

    #[test]
    fn test_malformed_documents_rejected() {
        assert!(matches!(SecurityConfig::from_json("{"), Err(SealfsError::Config(_))));
        assert!(matches!(
            SecurityConfig::from_json(r#"{"version": 4}"#),
            Err(SealfsError::Config(_))
        ));

        let plain = format(2);
        let settings = cheap_settings_for(PbkdfAlgorithm::Pbkdf2HmacSha256);
        let mut config =
            generate(PbkdfAlgorithm::Pbkdf2HmacSha256, None, &[4u8; 32], b"pw", &settings, &plain).unwrap();
        config.salt = "zz".into();
        assert!(matches!(parse(&config, None, b"pw"), Err(SealfsError::Config(_))));

        config.salt = hex::encode([4u8; 32]);
        config.pbkdf = "md5".into();
        assert!(matches!(parse(&config, None, b"pw"), Err(SealfsError::Config(_))));
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let json = r#"{"version": 4, "version": 3, "iterations": 1, "salt": "", "encrypted_key": {"IV": "", "MAC": "", "key": ""}}"#;
        assert!(SecurityConfig::from_json(json).is_err());
    }

    #[test]
    fn test_argon2id_default_rounds_with_small_memory() {
        // Argon2id, rounds 0 → t_cost 9; memory kept small for the test.
        let plain = format(4);
        let settings = KdfSettings {
            rounds: 0,
            argon2_m_cost: Some(1024),
            argon2_p: Some(2),
            ..KdfSettings::default()
        };
        let config = generate(PbkdfAlgorithm::Argon2id, None, &[8u8; 32], b"hunter2", &settings, &plain).unwrap();
        assert_eq!(config.iterations, 9);
        assert_eq!(config.argon2_m_cost, Some(1024));
        assert_eq!(config.argon2_p, Some(2));

        let opened = parse(&config, None, b"hunter2").unwrap();
        assert_eq!(opened.master_key.len(), 128);
        assert!(matches!(parse(&config, None, b"wrong"), Err(SealfsError::Authentication)));
    }

    #[test]
    fn test_info_has_no_secrets() {
        let plain = format(4);
        let settings = cheap_settings_for(PbkdfAlgorithm::Pbkdf2HmacSha256);
        let config = generate(PbkdfAlgorithm::Pbkdf2HmacSha256, None, &[4u8; 32], b"pw", &settings, &plain).unwrap();
        let info = config.info();
        assert_eq!(info.version, 4);
        assert_eq!(info.iterations, 1000);
        assert_eq!(info.block_size, 4096);
        assert!(info.has_salt);
        assert_eq!(info.key_wrapping, "AES-256-GCM");
        let rendered = format!("{info:?}");
        assert!(!rendered.contains(&config.encrypted_key.key));
        assert!(!rendered.contains(&config.salt));
    }
}
