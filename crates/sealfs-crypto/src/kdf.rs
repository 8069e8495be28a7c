//! Password stretching: PBKDF2-HMAC-SHA256, scrypt, Argon2id → 256-bit key

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use argon2::{Algorithm, Argon2, Version};
use sha2::Sha256;

use sealfs_core::{SealfsError, SealfsResult};

use crate::keys::SecretKey;
use crate::KEY_LENGTH;

/// PBKDF2 never runs with fewer iterations than this.
pub const PBKDF2_MIN_ITERATIONS: u32 = 20_000;

/// Target wall-clock time when PBKDF2 iterations are picked automatically.
pub const PBKDF2_MIN_DURATION: Duration = Duration::from_secs(1);

pub const SCRYPT_DEFAULT_N: u32 = 1 << 18;
pub const SCRYPT_DEFAULT_R: u32 = 8;
pub const SCRYPT_DEFAULT_P: u32 = 1;

pub const ARGON2_DEFAULT_T_COST: u32 = 9;
/// Memory cost in KiB (256 MiB)
pub const ARGON2_DEFAULT_M_COST: u32 = 1 << 18;
pub const ARGON2_DEFAULT_PARALLELISM: u32 = 4;

/// Overrides the Argon2id memory cost of newly generated configs.
pub const ENV_ARGON2_M_COST: &str = "SEALFS_ARGON2_M_COST";
/// Overrides the Argon2id parallelism of newly generated configs.
pub const ENV_ARGON2_P: &str = "SEALFS_ARGON2_P";

/// Password-based key derivation function, by its config-file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PbkdfAlgorithm {
    Pbkdf2HmacSha256,
    Scrypt,
    Argon2id,
}

impl PbkdfAlgorithm {
    pub const ALL: [PbkdfAlgorithm; 3] = [
        PbkdfAlgorithm::Pbkdf2HmacSha256,
        PbkdfAlgorithm::Scrypt,
        PbkdfAlgorithm::Argon2id,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PbkdfAlgorithm::Pbkdf2HmacSha256 => "pkcs5-pbkdf2-hmac-sha256",
            PbkdfAlgorithm::Scrypt => "scrypt",
            PbkdfAlgorithm::Argon2id => "argon2id",
        }
    }
}

impl fmt::Display for PbkdfAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PbkdfAlgorithm {
    type Err = SealfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PbkdfAlgorithm::ALL
            .into_iter()
            .find(|alg| alg.as_str() == s)
            .ok_or_else(|| SealfsError::config(format!("unknown pbkdf algorithm {s:?}")))
    }
}

/// Fully resolved cost parameters, exactly as persisted in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfParams {
    Pbkdf2 {
        iterations: u32,
    },
    Scrypt {
        n: u32,
        r: u32,
        p: u32,
    },
    Argon2id {
        t_cost: u32,
        /// KiB
        m_cost: u32,
        parallelism: u32,
    },
}

impl KdfParams {
    pub fn algorithm(&self) -> PbkdfAlgorithm {
        match self {
            KdfParams::Pbkdf2 { .. } => PbkdfAlgorithm::Pbkdf2HmacSha256,
            KdfParams::Scrypt { .. } => PbkdfAlgorithm::Scrypt,
            KdfParams::Argon2id { .. } => PbkdfAlgorithm::Argon2id,
        }
    }

    /// The value stored in the config's `iterations` field.
    pub fn rounds(&self) -> u32 {
        match *self {
            KdfParams::Pbkdf2 { iterations } => iterations,
            KdfParams::Scrypt { n, .. } => n,
            KdfParams::Argon2id { t_cost, .. } => t_cost,
        }
    }
}

/// Knobs for choosing cost parameters when a config is generated.
///
/// `rounds == 0` means "pick the default": auto-tuned for PBKDF2, 2^18 for
/// scrypt, 9 for Argon2id. Unset Argon2id values come from
/// `SEALFS_ARGON2_M_COST` / `SEALFS_ARGON2_P`, then the built-in defaults.
#[derive(Debug, Clone)]
pub struct KdfSettings {
    pub rounds: u32,
    pub argon2_m_cost: Option<u32>,
    pub argon2_p: Option<u32>,
    pub pbkdf2_min_duration: Duration,
}

impl Default for KdfSettings {
    fn default() -> Self {
        Self {
            rounds: 0,
            argon2_m_cost: None,
            argon2_p: None,
            pbkdf2_min_duration: PBKDF2_MIN_DURATION,
        }
    }
}

impl KdfSettings {
    pub fn with_rounds(rounds: u32) -> Self {
        Self {
            rounds,
            ..Self::default()
        }
    }

    fn argon2_m_cost(&self) -> SealfsResult<u32> {
        match self.argon2_m_cost {
            Some(m) => Ok(m),
            None => env_u32(ENV_ARGON2_M_COST).map(|v| v.unwrap_or(ARGON2_DEFAULT_M_COST)),
        }
    }

    fn argon2_p(&self) -> SealfsResult<u32> {
        match self.argon2_p {
            Some(p) => Ok(p),
            None => env_u32(ENV_ARGON2_P).map(|v| v.unwrap_or(ARGON2_DEFAULT_PARALLELISM)),
        }
    }
}

fn env_u32(var: &str) -> SealfsResult<Option<u32>> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SealfsError::config(format!("{var} must be an unsigned integer, got {value:?}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(SealfsError::config(format!("{var}: {e}"))),
    }
}

/// Derive a 256-bit key with fixed, already-resolved parameters.
pub fn derive(params: &KdfParams, password: &[u8], salt: &[u8]) -> SealfsResult<SecretKey> {
    let mut out = [0u8; KEY_LENGTH];
    match *params {
        KdfParams::Pbkdf2 { iterations } => {
            if iterations == 0 {
                return Err(SealfsError::config("PBKDF2 iteration count must be positive"));
            }
            pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
        }
        KdfParams::Scrypt { n, r, p } => {
            if n < 2 || !n.is_power_of_two() {
                return Err(SealfsError::config(format!(
                    "scrypt N must be a power of two, got {n}"
                )));
            }
            let log_n = n.trailing_zeros() as u8;
            let scrypt_params = scrypt::Params::new(log_n, r, p, KEY_LENGTH)
                .map_err(|e| SealfsError::config(format!("invalid scrypt params: {e}")))?;
            scrypt::scrypt(password, salt, &scrypt_params, &mut out)
                .map_err(|e| SealfsError::crypto(format!("scrypt KDF failed: {e}")))?;
        }
        KdfParams::Argon2id {
            t_cost,
            m_cost,
            parallelism,
        } => {
            let argon2_params = argon2::Params::new(m_cost, t_cost, parallelism, Some(KEY_LENGTH))
                .map_err(|e| SealfsError::config(format!("invalid Argon2id params: {e}")))?;
            Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
                .hash_password_into(password, salt, &mut out)
                .map_err(|e| SealfsError::crypto(format!("Argon2id KDF failed: {e}")))?;
        }
    }
    let key = SecretKey::from_bytes(out);
    zeroize::Zeroize::zeroize(&mut out);
    Ok(key)
}

/// Pick parameters for `algorithm` from `settings` and derive a key.
///
/// Returns the parameters actually used so they can be persisted.
pub fn derive_new(
    algorithm: PbkdfAlgorithm,
    settings: &KdfSettings,
    password: &[u8],
    salt: &[u8],
) -> SealfsResult<(KdfParams, SecretKey)> {
    let params = match algorithm {
        PbkdfAlgorithm::Pbkdf2HmacSha256 if settings.rounds == 0 => {
            return derive_pbkdf2_tuned(settings.pbkdf2_min_duration, password, salt);
        }
        PbkdfAlgorithm::Pbkdf2HmacSha256 => KdfParams::Pbkdf2 {
            iterations: settings.rounds,
        },
        PbkdfAlgorithm::Scrypt => KdfParams::Scrypt {
            n: if settings.rounds == 0 {
                SCRYPT_DEFAULT_N
            } else {
                settings.rounds
            },
            r: SCRYPT_DEFAULT_R,
            p: SCRYPT_DEFAULT_P,
        },
        PbkdfAlgorithm::Argon2id => KdfParams::Argon2id {
            t_cost: if settings.rounds == 0 {
                ARGON2_DEFAULT_T_COST
            } else {
                settings.rounds
            },
            m_cost: settings.argon2_m_cost()?,
            parallelism: settings.argon2_p()?,
        },
    };
    let key = derive(&params, password, salt)?;
    Ok((params, key))
}

/// Calibrate PBKDF2 so one derivation takes at least `min_duration`.
///
/// Runs once at the floor iteration count, then scales linearly from the
/// measured time. The floor is kept even on slow machines.
fn derive_pbkdf2_tuned(
    min_duration: Duration,
    password: &[u8],
    salt: &[u8],
) -> SealfsResult<(KdfParams, SecretKey)> {
    let probe = KdfParams::Pbkdf2 {
        iterations: PBKDF2_MIN_ITERATIONS,
    };
    let start = Instant::now();
    let key = derive(&probe, password, salt)?;
    let elapsed = start.elapsed().max(Duration::from_micros(1));

    if elapsed >= min_duration {
        tracing::debug!(
            iterations = PBKDF2_MIN_ITERATIONS,
            elapsed_ms = elapsed.as_millis() as u64,
            "PBKDF2 floor already meets target duration"
        );
        return Ok((probe, key));
    }

    let scaled = u128::from(PBKDF2_MIN_ITERATIONS) * min_duration.as_nanos() / elapsed.as_nanos() + 1;
    let iterations = u32::try_from(scaled)
        .unwrap_or(u32::MAX)
        .max(PBKDF2_MIN_ITERATIONS);
    tracing::debug!(
        iterations,
        probe_ms = elapsed.as_millis() as u64,
        "PBKDF2 iteration count calibrated"
    );

    let params = KdfParams::Pbkdf2 { iterations };
    let key = derive(&params, password, salt)?;
    Ok((params, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_argon2() -> KdfParams {
        KdfParams::Argon2id {
            t_cost: 1,
            m_cost: 1024,
            parallelism: 1,
        }
    }

    #[test]
    fn test_algorithm_names_roundtrip() {
        for alg in PbkdfAlgorithm::ALL {
            assert_eq!(alg.as_str().parse::<PbkdfAlgorithm>().unwrap(), alg);
        }
        assert!(matches!(
            "bcrypt".parse::<PbkdfAlgorithm>(),
            Err(SealfsError::Config(_))
        ));
    }

    #[test]
    fn test_kdf_deterministic() {
        let salt = [7u8; 32];
        for params in [
            KdfParams::Pbkdf2 { iterations: 1000 },
            KdfParams::Scrypt { n: 1024, r: 8, p: 1 },
            cheap_argon2(),
        ] {
            let k1 = derive(&params, b"hunter2", &salt).unwrap();
            let k2 = derive(&params, b"hunter2", &salt).unwrap();
            assert_eq!(k1.as_bytes(), k2.as_bytes(), "{params:?} must be deterministic");

            let other = derive(&params, b"hunter3", &salt).unwrap();
            assert_ne!(k1.as_bytes(), other.as_bytes());
        }
    }

    #[test]
    fn test_pbkdf2_known_vector() {
        // RFC 7914 section 11, first 32 bytes
        let key = derive(&KdfParams::Pbkdf2 { iterations: 1 }, b"passwd", b"salt").unwrap();
        assert_eq!(
            hex::encode(key.as_bytes()),
            "55ac046e56e3089fec1691c22544b605f94185216dde0465e68b9d57c20dacbc"
        );
    }

    #[test]
    fn test_algorithms_produce_different_keys() {
        let salt = [1u8; 32];
        let a = derive(&KdfParams::Pbkdf2 { iterations: 1000 }, b"pw", &salt).unwrap();
        let b = derive(&KdfParams::Scrypt { n: 1024, r: 8, p: 1 }, b"pw", &salt).unwrap();
        let c = derive(&cheap_argon2(), b"pw", &salt).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(b.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_scrypt_rejects_non_power_of_two() {
        let err = derive(&KdfParams::Scrypt { n: 1000, r: 8, p: 1 }, b"pw", b"salt").unwrap_err();
        assert!(matches!(err, SealfsError::Config(_)));
    }

    #[test]
    fn test_pbkdf2_zero_iterations_rejected() {
        let err = derive(&KdfParams::Pbkdf2 { iterations: 0 }, b"pw", b"salt").unwrap_err();
        assert!(matches!(err, SealfsError::Config(_)));
    }

    #[test]
    fn test_explicit_rounds_used_exactly() {
        let settings = KdfSettings::with_rounds(1234);
        let (params, _) =
            derive_new(PbkdfAlgorithm::Pbkdf2HmacSha256, &settings, b"pw", b"salt").unwrap();
        assert_eq!(params, KdfParams::Pbkdf2 { iterations: 1234 });

        let (params, _) = derive_new(PbkdfAlgorithm::Scrypt, &KdfSettings::with_rounds(2048), b"pw", b"salt")
            .unwrap();
        assert_eq!(params, KdfParams::Scrypt { n: 2048, r: 8, p: 1 });
    }

    #[test]
    fn test_argon2_settings_override_defaults() {
        let settings = KdfSettings {
            rounds: 0,
            argon2_m_cost: Some(1024),
            argon2_p: Some(1),
            ..KdfSettings::default()
        };
        let (params, _) = derive_new(PbkdfAlgorithm::Argon2id, &settings, b"pw", b"salt1234").unwrap();
        assert_eq!(
            params,
            KdfParams::Argon2id {
                t_cost: ARGON2_DEFAULT_T_COST,
                m_cost: 1024,
                parallelism: 1
            }
        );
        assert_eq!(params.rounds(), 9);
    }

    #[test]
    fn test_argon2_env_overrides() {
        // The only test in this binary that leaves the Argon2 costs unset.
        std::env::set_var(ENV_ARGON2_M_COST, "2048");
        std::env::set_var(ENV_ARGON2_P, " 2 ");
        let from_env = KdfSettings::with_rounds(1);
        let (params, _) = derive_new(PbkdfAlgorithm::Argon2id, &from_env, b"pw", b"salt1234").unwrap();
        assert_eq!(
            params,
            KdfParams::Argon2id {
                t_cost: 1,
                m_cost: 2048,
                parallelism: 2
            }
        );

        std::env::set_var(ENV_ARGON2_M_COST, "lots");
        let err = derive_new(PbkdfAlgorithm::Argon2id, &from_env, b"pw", b"salt1234").unwrap_err();
        assert!(matches!(err, SealfsError::Config(ref msg) if msg.contains(ENV_ARGON2_M_COST)));

        // Explicit settings never consult the environment.
        let explicit = KdfSettings {
            argon2_m_cost: Some(1024),
            argon2_p: Some(1),
            ..KdfSettings::with_rounds(1)
        };
        let (params, _) = derive_new(PbkdfAlgorithm::Argon2id, &explicit, b"pw", b"salt1234").unwrap();
        assert_eq!(
            params,
            KdfParams::Argon2id {
                t_cost: 1,
                m_cost: 1024,
                parallelism: 1
            }
        );

        std::env::remove_var(ENV_ARGON2_M_COST);
        std::env::remove_var(ENV_ARGON2_P);
        assert_eq!(from_env.argon2_m_cost().unwrap(), ARGON2_DEFAULT_M_COST);
        assert_eq!(from_env.argon2_p().unwrap(), ARGON2_DEFAULT_PARALLELISM);
    }

    #[test]
    fn test_pbkdf2_autotune_keeps_floor() {
        let settings = KdfSettings {
            pbkdf2_min_duration: Duration::from_nanos(1),
            ..KdfSettings::default()
        };
        let (params, key) =
            derive_new(PbkdfAlgorithm::Pbkdf2HmacSha256, &settings, b"pw", b"salt").unwrap();
        assert_eq!(params.rounds(), PBKDF2_MIN_ITERATIONS);
        assert_eq!(key.as_bytes(), derive(&params, b"pw", b"salt").unwrap().as_bytes());
    }

    #[test]
    fn test_pbkdf2_autotune_scales_up() {
        let settings = KdfSettings {
            pbkdf2_min_duration: Duration::from_millis(50),
            ..KdfSettings::default()
        };
        let (params, key) =
            derive_new(PbkdfAlgorithm::Pbkdf2HmacSha256, &settings, b"pw", b"salt").unwrap();
        assert!(params.rounds() >= PBKDF2_MIN_ITERATIONS);
        assert_eq!(key.as_bytes(), derive(&params, b"pw", b"salt").unwrap().as_bytes());
    }
}
