use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Size of an object identifier in bytes
pub const ID_LENGTH: usize = 32;

/// Mask selecting the file-type bits of a POSIX mode
pub const S_IFMT: u32 = 0o170_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFLNK: u32 = 0o120_000;
pub const S_IFDIR: u32 = 0o040_000;

/// Random, immutable identifier of a filesystem object.
///
/// Ordering is bytewise; callers that lock two objects at once acquire them
/// in ascending id order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; ID_LENGTH]);

impl ObjectId {
    /// The root directory always lives at the all-zero id.
    pub const ROOT: ObjectId = ObjectId([0u8; ID_LENGTH]);

    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; ID_LENGTH]>::try_from(bytes).ok().map(Self)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }

    /// Inode number reported to the kernel: the first eight bytes, little-endian.
    pub fn inode(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(head)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

/// The three kinds of object the store knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    RegularFile,
    Symlink,
    Directory,
}

impl FileKind {
    /// Persisted kind code: the mode's type bits shifted down by 12.
    pub fn code(self) -> u32 {
        self.mode_bits() >> 12
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::from_mode(code << 12)
    }

    pub fn mode_bits(self) -> u32 {
        match self {
            FileKind::RegularFile => S_IFREG,
            FileKind::Symlink => S_IFLNK,
            FileKind::Directory => S_IFDIR,
        }
    }

    /// Kind encoded in the type bits of `mode`, if it is one we store.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(FileKind::RegularFile),
            S_IFLNK => Some(FileKind::Symlink),
            S_IFDIR => Some(FileKind::Directory),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FileKind::RegularFile => "regular_file",
            FileKind::Symlink => "symbolic_link",
            FileKind::Directory => "directory",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Seconds + nanoseconds since the Unix epoch, as persisted in object headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timespec {
    pub secs: i64,
    pub nanos: u32,
}

impl Timespec {
    pub const fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }
}

impl From<SystemTime> for Timespec {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Timespec::new(d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => {
                // Pre-epoch: borrow a second so nanos stays non-negative.
                let d = e.duration();
                if d.subsec_nanos() == 0 {
                    Timespec::new(-(d.as_secs() as i64), 0)
                } else {
                    Timespec::new(-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
                }
            }
        }
    }
}

impl From<Timespec> for SystemTime {
    fn from(t: Timespec) -> Self {
        if t.secs >= 0 {
            UNIX_EPOCH + Duration::new(t.secs as u64, t.nanos)
        } else {
            UNIX_EPOCH - Duration::from_secs(t.secs.unsigned_abs()) + Duration::from_nanos(u64::from(t.nanos))
        }
    }
}
