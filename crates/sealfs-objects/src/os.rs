//! OS collaborators: clock, file-stream acquisition, process credentials

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use sealfs_core::Timespec;

use crate::stream::{FileStream, OsFileStream};

pub trait Clock: Send + Sync {
    fn now(&self) -> Timespec;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timespec {
        Timespec::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timespec>,
}

impl ManualClock {
    pub fn new(start: Timespec) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, t: Timespec) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = t;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        let nanos = u64::from(now.nanos) + u64::from(by.subsec_nanos());
        now.secs += by.as_secs() as i64 + (nanos / 1_000_000_000) as i64;
        now.nanos = (nanos % 1_000_000_000) as u32;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timespec {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Filesystem access rooted at the encrypted data directory.
///
/// All paths are relative to that root.
pub trait OsService: Clock {
    /// Open a stream read-write. With `create`, the file must not exist yet.
    fn open_file_stream(&self, path: &Path, create: bool) -> io::Result<Box<dyn FileStream>>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Create `path` (and parents) if missing.
    fn ensure_directory(&self, path: &Path) -> io::Result<()>;

    /// Remove an empty directory.
    fn remove_directory(&self, path: &Path) -> io::Result<()>;

    fn uid(&self) -> u32;

    fn gid(&self) -> u32;
}

/// [`OsService`] over the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalOs {
    root: PathBuf,
}

impl LocalOs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl Clock for LocalOs {
    fn now(&self) -> Timespec {
        Timespec::now()
    }
}

impl OsService for LocalOs {
    fn open_file_stream(&self, path: &Path, create: bool) -> io::Result<Box<dyn FileStream>> {
        let full = self.resolve(path);
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if create {
            options.create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
        }
        let file = options.open(&full)?;
        Ok(Box::new(OsFileStream::new(file, full)))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }

    fn ensure_directory(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(self.resolve(path))
    }

    fn remove_directory(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(self.resolve(path))
    }

    #[cfg(unix)]
    fn uid(&self) -> u32 {
        // SAFETY: getuid has no preconditions and cannot fail.
        unsafe { libc::getuid() }
    }

    #[cfg(unix)]
    fn gid(&self) -> u32 {
        // SAFETY: getgid has no preconditions and cannot fail.
        unsafe { libc::getgid() }
    }

    #[cfg(not(unix))]
    fn uid(&self) -> u32 {
        0
    }

    #[cfg(not(unix))]
    fn gid(&self) -> u32 {
        0
    }
}
