//! Security config on disk: exclusive creation and atomic credential change

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use sealfs_core::{SealfsError, SealfsResult};

use crate::kdf::{KdfSettings, PbkdfAlgorithm};
use crate::keys::random_bytes;
use crate::security_config::{self, FormatParams, SecurityConfig};
use crate::SALT_LENGTH;

/// File name of the security config inside the data directory
pub const CONFIG_FILE_NAME: &str = ".sealfs.json";

/// Password used when only a keyfile is supplied.
pub const EMPTY_PASSWORD_WHEN_KEY_FILE_IS_USED: &[u8] = b" ";

/// Password and optional keyfile contents.
#[derive(Clone, Copy)]
pub struct Credentials<'a> {
    pub password: &'a [u8],
    pub keyfile: Option<&'a [u8]>,
}

impl<'a> Credentials<'a> {
    pub fn new(password: &'a [u8], keyfile: Option<&'a [u8]>) -> Self {
        Self { password, keyfile }
    }

    /// Keyfile-only unlock.
    pub fn keyfile_only(keyfile: &'a [u8]) -> Self {
        Self {
            password: EMPTY_PASSWORD_WHEN_KEY_FILE_IS_USED,
            keyfile: Some(keyfile),
        }
    }
}

impl std::fmt::Debug for Credentials<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &"[REDACTED]")
            .field("keyfile", &self.keyfile.map(|_| "[REDACTED]"))
            .finish()
    }
}

/// `<data_dir>/.sealfs.json`
pub fn default_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

pub fn read_config(path: &Path) -> SealfsResult<SecurityConfig> {
    let json = fs::read_to_string(path)?;
    SecurityConfig::from_json(&json)
}

/// Read and unseal the config at `path`.
pub fn load_format(path: &Path, credentials: Credentials<'_>) -> SealfsResult<FormatParams> {
    let config = read_config(path)?;
    security_config::parse(&config, credentials.keyfile, credentials.password)
}

/// Removes the file at `path` on drop unless committed.
struct PendingFile<'a> {
    path: &'a Path,
    committed: bool,
}

impl<'a> PendingFile<'a> {
    fn new(path: &'a Path) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingFile<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = fs::remove_file(self.path) {
            tracing::warn!("failed to remove {}: {e}", self.path.display());
        }
    }
}

fn create_exclusive(path: &Path) -> SealfsResult<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    Ok(options.open(path)?)
}

fn write_synced(mut file: File, json: &str) -> SealfsResult<()> {
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Create a new security config at `path`.
///
/// Fails if `path` already exists and leaves it untouched. If anything goes
/// wrong after the file is created, the partial file is removed.
pub fn create_config_file(
    path: &Path,
    algorithm: PbkdfAlgorithm,
    credentials: Credentials<'_>,
    settings: &KdfSettings,
    format: &FormatParams,
) -> SealfsResult<SecurityConfig> {
    let file = create_exclusive(path)?;
    let pending = PendingFile::new(path);

    let salt: [u8; SALT_LENGTH] = random_bytes();
    let config = security_config::generate(
        algorithm,
        credentials.keyfile,
        &salt,
        credentials.password,
        settings,
        format,
    )?;
    write_synced(file, &config.to_json_pretty()?)?;

    pending.commit();
    tracing::info!(
        "created security config: {} (version {}, {})",
        path.display(),
        config.version,
        config.pbkdf
    );
    Ok(config)
}

/// Re-wrap the master key under new credentials.
///
/// The new config is written next to the old one under a random name,
/// verified by unsealing it with the new credentials, then renamed over
/// the original. The temporary file never survives a failure.
pub fn change_credentials(
    path: &Path,
    old: Credentials<'_>,
    new: Credentials<'_>,
    algorithm: PbkdfAlgorithm,
    settings: &KdfSettings,
) -> SealfsResult<()> {
    let format = load_format(path, old)?;

    let salt: [u8; SALT_LENGTH] = random_bytes();
    let config = security_config::generate(
        algorithm,
        new.keyfile,
        &salt,
        new.password,
        settings,
        &format,
    )?;

    let tmp_path = temp_path_for(path);
    let file = create_exclusive(&tmp_path)?;
    let pending = PendingFile::new(&tmp_path);

    write_synced(file, &config.to_json_pretty()?)?;

    let verified = load_format(&tmp_path, new)?;
    if verified.master_key != format.master_key {
        return Err(SealfsError::crypto(
            "rewrapped config does not unseal to the same master key",
        ));
    }

    fs::rename(&tmp_path, path)?;
    pending.commit();

    tracing::info!("security config credentials changed: {}", path.display());
    Ok(())
}

/// `<path><32 random hex chars>`
fn temp_path_for(path: &Path) -> PathBuf {
    let suffix: [u8; 16] = random_bytes();
    let mut name = OsString::from(path.as_os_str());
    name.push(hex::encode(suffix));
    PathBuf::from(name)
}
