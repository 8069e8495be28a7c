//! sealfs: encrypted overlay filesystem administration
//!
//! Commands:
//!   create <data-dir>   - write a new security config and an empty root directory
//!   chpass <data-dir>   - re-wrap the master key under a new password and/or keyfile
//!   info   <data-dir>   - print the non-secret parameters of a filesystem
//!   check  <data-dir>   - unlock a filesystem and open its root directory
//!
//! Passwords are prompted on the terminal unless SEALFS_PASSWORD (and, for
//! chpass, SEALFS_NEW_PASSWORD) is set.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use sealfs_core::config::SealfsConfig;
use sealfs_core::ObjectId;
use sealfs_crypto::config_file::{
    change_credentials, create_config_file, default_config_path, load_format, read_config, Credentials,
};
use sealfs_crypto::{FormatParams, KdfSettings, PbkdfAlgorithm, SecurityConfig};
use sealfs_objects::{DirectoryStore, LocalOs, ModelParams, ObjectStore, ObjectTable, OsService, SystemClock};

const PASSWORD_ENV: &str = "SEALFS_PASSWORD";
const NEW_PASSWORD_ENV: &str = "SEALFS_NEW_PASSWORD";

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "sealfs", version, about = "Encrypted overlay filesystem tool")]
struct Cli {
    /// Path to sealfs.toml settings file
    #[arg(
        long,
        short = 'c',
        env = "SEALFS_CONFIG",
        default_value = "/etc/sealfs/sealfs.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the settings file
    #[arg(long, env = "SEALFS_LOG")]
    log: Option<String>,

    /// Log format; overrides the settings file
    #[arg(long, env = "SEALFS_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new filesystem in DATA_DIR
    Create {
        data_dir: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
        #[command(flatten)]
        kdf: KdfArgs,
        /// Format version (1-4); defaults to the settings file
        #[arg(long)]
        format_version: Option<u32>,
        /// Replace over-long encrypted names with lookup components
        #[arg(long)]
        long_names: bool,
    },

    /// Change the password and/or keyfile of a filesystem
    Chpass {
        data_dir: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
        /// New keyfile (omit to stop using one)
        #[arg(long)]
        new_keyfile: Option<PathBuf>,
        /// Unlock with the new keyfile alone afterwards
        #[arg(long, requires = "new_keyfile")]
        new_keyfile_only: bool,
        #[command(flatten)]
        kdf: KdfArgs,
    },

    /// Print the non-secret parameters of a filesystem
    Info {
        data_dir: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Unlock a filesystem and open its root directory
    Check {
        data_dir: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
    },
}

#[derive(Args, Debug)]
struct KeyArgs {
    /// File whose contents are mixed into the key derivation
    #[arg(long, short = 'k')]
    keyfile: Option<PathBuf>,
    /// Unlock with the keyfile alone, without a password
    #[arg(long, requires = "keyfile")]
    keyfile_only: bool,
}

#[derive(Args, Debug)]
struct KdfArgs {
    /// pkcs5-pbkdf2-hmac-sha256, scrypt or argon2id; defaults to the settings file
    #[arg(long)]
    pbkdf: Option<String>,
    /// PBKDF2 iterations, scrypt N or Argon2 time cost (0 = automatic)
    #[arg(long)]
    rounds: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn from_settings(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

// ── entry point ────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = SealfsConfig::load(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| settings.logging.level.clone());
    let format = cli
        .log_format
        .unwrap_or_else(|| LogFormat::from_settings(&settings.logging.format));
    init_logging(&level, format);

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "sealfs starting");

    match cli.command {
        Commands::Create {
            data_dir,
            key,
            kdf,
            format_version,
            long_names,
        } => cmd_create(&settings, &data_dir, &key, &kdf, format_version, long_names),
        Commands::Chpass {
            data_dir,
            key,
            new_keyfile,
            new_keyfile_only,
            kdf,
        } => cmd_chpass(&settings, &data_dir, &key, new_keyfile.as_deref(), new_keyfile_only, &kdf),
        Commands::Info { data_dir, json } => cmd_info(&data_dir, json),
        Commands::Check { data_dir, key } => cmd_check(&data_dir, &key),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let layer = fmt::layer().with_writer(std::io::stderr);

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
}

// ── commands ───────────────────────────────────────────────────────────────────

fn cmd_create(
    settings: &SealfsConfig,
    data_dir: &Path,
    key: &KeyArgs,
    kdf: &KdfArgs,
    format_version: Option<u32>,
    long_names: bool,
) -> Result<()> {
    let (algorithm, kdf_settings) = kdf_choice(settings, kdf)?;
    let version = format_version.unwrap_or_else(|| settings.format.effective_version());
    let format = FormatParams::new(
        version,
        settings.format.block_size,
        settings.format.iv_size,
        settings.format.max_padding,
        long_names || settings.format.long_name_component,
    )?;

    std::fs::create_dir_all(data_dir).with_context(|| format!("creating {}", data_dir.display()))?;
    let config_path = default_config_path(data_dir);
    if config_path.exists() {
        bail!("{} already contains a filesystem", data_dir.display());
    }

    let keyfile = read_keyfile(key.keyfile.as_deref())?;
    let password = if key.keyfile_only {
        None
    } else {
        Some(obtain_password("New password: ", PASSWORD_ENV, true)?)
    };
    let creds = credentials(password.as_ref(), keyfile_bytes(&keyfile))?;

    let config = initialize(data_dir, algorithm, creds, &kdf_settings, &format)?;

    println!(
        "created {} (format version {}, {})",
        data_dir.display(),
        config.version,
        config.pbkdf
    );
    Ok(())
}

fn cmd_chpass(
    settings: &SealfsConfig,
    data_dir: &Path,
    key: &KeyArgs,
    new_keyfile: Option<&Path>,
    new_keyfile_only: bool,
    kdf: &KdfArgs,
) -> Result<()> {
    let config_path = default_config_path(data_dir);
    let (algorithm, kdf_settings) = kdf_choice(settings, kdf)?;

    let old_keyfile = read_keyfile(key.keyfile.as_deref())?;
    let old_password = if key.keyfile_only {
        None
    } else {
        Some(obtain_password("Current password: ", PASSWORD_ENV, false)?)
    };
    let old = credentials(old_password.as_ref(), keyfile_bytes(&old_keyfile))?;

    let new_keyfile = read_keyfile(new_keyfile)?;
    let new_password = if new_keyfile_only {
        None
    } else {
        Some(obtain_password("New password: ", NEW_PASSWORD_ENV, true)?)
    };
    let new = credentials(new_password.as_ref(), keyfile_bytes(&new_keyfile))?;

    change_credentials(&config_path, old, new, algorithm, &kdf_settings)
        .with_context(|| format!("changing credentials of {}", data_dir.display()))?;
    println!("credentials changed for {}", data_dir.display());
    Ok(())
}

fn cmd_info(data_dir: &Path, json: bool) -> Result<()> {
    let config_path = default_config_path(data_dir);
    let info = read_config(&config_path)
        .with_context(|| format!("reading {}", config_path.display()))?
        .info();

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("format version:      {}", info.version);
    println!("key derivation:      {}", info.pbkdf);
    println!("  cost (rounds):     {}", info.iterations);
    if let (Some(r), Some(p)) = (info.scrypt_r, info.scrypt_p) {
        println!("  scrypt r / p:      {r} / {p}");
    }
    if let (Some(m), Some(p)) = (info.argon2_m_cost, info.argon2_p) {
        println!("  argon2 memory:     {m} KiB");
        println!("  argon2 lanes:      {p}");
    }
    println!("salt present:        {}", info.has_salt);
    println!("key wrapping:        {}", info.key_wrapping);
    println!("block size:          {}", info.block_size);
    println!("IV size:             {}", info.iv_size);
    println!("max padding:         {}", info.max_padding);
    println!("long-name component: {}", info.long_name_component);
    Ok(())
}

fn cmd_check(data_dir: &Path, key: &KeyArgs) -> Result<()> {
    let config_path = default_config_path(data_dir);
    let keyfile = read_keyfile(key.keyfile.as_deref())?;
    let password = if key.keyfile_only {
        None
    } else {
        Some(obtain_password("Password: ", PASSWORD_ENV, false)?)
    };
    let format = load_format(&config_path, credentials(password.as_ref(), keyfile_bytes(&keyfile))?)
        .with_context(|| format!("unlocking {}", data_dir.display()))?;

    let table = open_table(data_dir, &format)?;
    let root = table.open_root()?;
    let mut guard = root.lock();
    let stat = guard.stat()?;
    let mut entries = 0usize;
    guard.as_directory()?.iterate(|_, _, _| {
        entries += 1;
        true
    })?;

    println!("unlocked {} (format version {})", data_dir.display(), format.version);
    println!("root: mode {:o}, {} entries", stat.mode, entries);
    Ok(())
}

// ── helpers ────────────────────────────────────────────────────────────────────

fn kdf_choice(settings: &SealfsConfig, kdf: &KdfArgs) -> Result<(PbkdfAlgorithm, KdfSettings)> {
    let name = kdf.pbkdf.as_deref().unwrap_or(&settings.kdf.pbkdf);
    let algorithm: PbkdfAlgorithm = name.parse()?;
    let kdf_settings = KdfSettings {
        rounds: kdf.rounds.unwrap_or(settings.kdf.rounds),
        argon2_m_cost: settings.kdf.argon2_m_cost,
        argon2_p: settings.kdf.argon2_p,
        ..KdfSettings::default()
    };
    Ok((algorithm, kdf_settings))
}

/// Write the security config and the empty root directory. If the root cannot
/// be created, the config (and any partial root) is removed again.
fn initialize(
    data_dir: &Path,
    algorithm: PbkdfAlgorithm,
    creds: Credentials<'_>,
    kdf_settings: &KdfSettings,
    format: &FormatParams,
) -> Result<SecurityConfig> {
    let config_path = default_config_path(data_dir);
    let config = create_config_file(&config_path, algorithm, creds, kdf_settings, format)
        .with_context(|| format!("creating {}", config_path.display()))?;

    if let Err(e) = open_table(data_dir, format) {
        tracing::warn!("root creation failed, removing {}", config_path.display());
        DirectoryStore::new(Arc::new(LocalOs::new(data_dir))).unlink(&ObjectId::ROOT);
        if let Err(remove) = std::fs::remove_file(&config_path) {
            tracing::error!("could not remove {}: {remove}", config_path.display());
        }
        return Err(e);
    }
    Ok(config)
}

fn open_table(data_dir: &Path, format: &FormatParams) -> Result<ObjectTable> {
    let os = Arc::new(LocalOs::new(data_dir));
    let params = Arc::new(ModelParams::from_format(format, Arc::new(SystemClock))?);
    let store = Arc::new(DirectoryStore::new(os.clone()));
    let table = ObjectTable::new(store, params, os.uid(), os.gid())
        .with_context(|| format!("opening root directory in {}", data_dir.display()))?;
    Ok(table)
}

fn read_keyfile(path: Option<&Path>) -> Result<Option<Zeroizing<Vec<u8>>>> {
    match path {
        Some(path) => {
            let bytes = std::fs::read(path).with_context(|| format!("reading keyfile {}", path.display()))?;
            Ok(Some(Zeroizing::new(bytes)))
        }
        None => Ok(None),
    }
}

fn keyfile_bytes(keyfile: &Option<Zeroizing<Vec<u8>>>) -> Option<&[u8]> {
    keyfile.as_ref().map(|k| k.as_slice())
}

fn credentials<'a>(password: Option<&'a SecretString>, keyfile: Option<&'a [u8]>) -> Result<Credentials<'a>> {
    match (password, keyfile) {
        (Some(password), keyfile) => Ok(Credentials::new(password.expose_secret().as_bytes(), keyfile)),
        (None, Some(keyfile)) => Ok(Credentials::keyfile_only(keyfile)),
        (None, None) => bail!("a password or a keyfile is required"),
    }
}

/// Read a password from `env_var`, or prompt for it on the terminal.
fn obtain_password(prompt: &str, env_var: &str, confirm: bool) -> Result<SecretString> {
    if let Ok(value) = std::env::var(env_var) {
        tracing::debug!("using password from {env_var}");
        return Ok(SecretString::from(value));
    }

    let first = SecretString::from(rpassword::prompt_password(prompt).context("reading password")?);
    if !confirm {
        return Ok(first);
    }
    let second = Zeroizing::new(rpassword::prompt_password("Repeat: ").context("reading password")?);
    confirmed(first, &second)
}

/// `first`, if the repeated entry matches it. Both are wiped on mismatch.
fn confirmed(first: SecretString, second: &Zeroizing<String>) -> Result<SecretString> {
    if first.expose_secret() != second.as_str() {
        bail!("passwords do not match");
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_password_confirmation() {
        let ok = confirmed(SecretString::from("hunter2".to_string()), &Zeroizing::new("hunter2".to_string()));
        assert_eq!(ok.unwrap().expose_secret(), "hunter2");

        let err = confirmed(SecretString::from("hunter2".to_string()), &Zeroizing::new("hunter3".to_string()));
        assert!(err.unwrap_err().to_string().contains("do not match"));
    }

    #[test]
    fn test_parse_create() {
        let cli = Cli::try_parse_from([
            "sealfs",
            "--log",
            "debug",
            "create",
            "/tmp/data",
            "--keyfile",
            "/tmp/key",
            "--keyfile-only",
            "--pbkdf",
            "scrypt",
            "--rounds",
            "16384",
            "--format-version",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.log.as_deref(), Some("debug"));
        match cli.command {
            Commands::Create {
                data_dir,
                key,
                kdf,
                format_version,
                long_names,
            } => {
                assert_eq!(data_dir, PathBuf::from("/tmp/data"));
                assert!(key.keyfile_only);
                assert_eq!(kdf.pbkdf.as_deref(), Some("scrypt"));
                assert_eq!(kdf.rounds, Some(16384));
                assert_eq!(format_version, Some(3));
                assert!(!long_names);
            }
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn test_keyfile_only_requires_keyfile() {
        assert!(Cli::try_parse_from(["sealfs", "check", "/tmp/data", "--keyfile-only"]).is_err());
        assert!(Cli::try_parse_from(["sealfs", "chpass", "/tmp/data", "--new-keyfile-only"]).is_err());
    }

    #[test]
    fn test_log_format_from_settings() {
        assert_eq!(LogFormat::from_settings("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_settings("text"), LogFormat::Text);
        assert_eq!(LogFormat::from_settings("pretty"), LogFormat::Text);
    }

    #[test]
    fn test_credentials_selection() {
        let password = SecretString::from("pw".to_string());
        let creds = credentials(Some(&password), Some(&b"kf"[..])).unwrap();
        assert_eq!(creds.password, b"pw");
        assert_eq!(creds.keyfile, Some(&b"kf"[..]));

        let creds = credentials(None, Some(&b"kf"[..])).unwrap();
        assert_eq!(creds.password, b" ");

        assert!(credentials(None, None).is_err());
    }

    #[test]
    fn test_kdf_choice_prefers_arguments() {
        let settings = SealfsConfig::default();
        let args = KdfArgs {
            pbkdf: Some("pkcs5-pbkdf2-hmac-sha256".into()),
            rounds: Some(5000),
        };
        let (algorithm, kdf) = kdf_choice(&settings, &args).unwrap();
        assert_eq!(algorithm, PbkdfAlgorithm::Pbkdf2HmacSha256);
        assert_eq!(kdf.rounds, 5000);

        let (algorithm, kdf) = kdf_choice(&settings, &KdfArgs { pbkdf: None, rounds: None }).unwrap();
        assert_eq!(algorithm, PbkdfAlgorithm::Argon2id);
        assert_eq!(kdf.rounds, 0);

        let bad = KdfArgs {
            pbkdf: Some("md5".into()),
            rounds: None,
        };
        assert!(kdf_choice(&settings, &bad).is_err());
    }

    #[test]
    fn test_open_table_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let format = FormatParams::new(4, 4096, 12, 0, false).unwrap();
        let table = open_table(dir.path(), &format).unwrap();
        assert!(table.open_root().is_ok());
        drop(table);
        assert!(dir.path().join("00").is_dir());
    }

    #[test]
    fn test_initialize_writes_config_and_root() {
        let dir = tempfile::tempdir().unwrap();
        let format = FormatParams::new(4, 4096, 12, 0, false).unwrap();
        let config = initialize(
            dir.path(),
            PbkdfAlgorithm::Pbkdf2HmacSha256,
            Credentials::new(b"pw", None),
            &KdfSettings::with_rounds(1_000),
            &format,
        )
        .unwrap();
        assert_eq!(config.version, 4);
        assert!(default_config_path(dir.path()).exists());
        assert!(dir.path().join("00").is_dir());
    }

    #[test]
    fn test_initialize_removes_config_when_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        // A plain file where the root's shard directory belongs.
        std::fs::write(dir.path().join("00"), b"").unwrap();
        let format = FormatParams::new(4, 4096, 12, 0, false).unwrap();

        let result = initialize(
            dir.path(),
            PbkdfAlgorithm::Pbkdf2HmacSha256,
            Credentials::new(b"pw", None),
            &KdfSettings::with_rounds(1_000),
            &format,
        );
        assert!(result.is_err());
        assert!(!default_config_path(dir.path()).exists());
    }

    #[test]
    fn test_read_keyfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, b"secret material").unwrap();
        let keyfile = read_keyfile(Some(path.as_path())).unwrap();
        assert_eq!(keyfile_bytes(&keyfile), Some(&b"secret material"[..]));
        assert!(read_keyfile(None).unwrap().is_none());
        assert!(read_keyfile(Some(dir.path().join("absent").as_path())).is_err());
    }
}
