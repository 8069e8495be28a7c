//! Fixed binary object header stored at offset 0 of the meta stream
//!
//! ```text
//! 0        4        8        12       16       20       24       28    32
//! ┌────────┬────────┬────────┬────────┬────────┬────────┬────────┬─────┐
//! │ mode   │ uid    │ gid    │ nlink  │ opaque │ opaque │ opaque │ pad │   base (32)
//! └────────┴────────┴────────┴────────┴────────┴────────┴────────┴─────┘
//!
//! with timestamps (80), each {u64 secs, u32 nanos} from offset 28:
//!   28 atime   40 mtime   52 ctime   64 birthtime   76..80 pad
//! ```
//!
//! All integers are little-endian.

use std::io;

use sealfs_core::{SealfsError, SealfsResult, Timespec};

pub const FLAG_COUNT: usize = 7;

pub const FLAG_MODE: usize = 0;
pub const FLAG_UID: usize = 1;
pub const FLAG_GID: usize = 2;
pub const FLAG_NLINK: usize = 3;

/// Flags 4-6 belong to the directory storage engine; never interpreted here.
pub const OPAQUE_FLAGS: std::ops::Range<usize> = 4..FLAG_COUNT;

pub const BASE_HEADER_LENGTH: usize = 32;
pub const TIMED_HEADER_LENGTH: usize = 80;

const TIMES_OFFSET: usize = FLAG_COUNT * 4;
const TIMESPEC_LENGTH: usize = 12;

/// The four persisted timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Times {
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub birthtime: Timespec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectHeader {
    pub flags: [u32; FLAG_COUNT],
    /// Present only when timestamps are stored.
    pub times: Option<Times>,
}

impl ObjectHeader {
    pub fn encoded_len(store_time: bool) -> usize {
        if store_time {
            TIMED_HEADER_LENGTH
        } else {
            BASE_HEADER_LENGTH
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::encoded_len(self.times.is_some())];
        for (i, flag) in self.flags.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&flag.to_le_bytes());
        }
        if let Some(times) = &self.times {
            let all = [times.atime, times.mtime, times.ctime, times.birthtime];
            for (i, t) in all.iter().enumerate() {
                let at = TIMES_OFFSET + i * TIMESPEC_LENGTH;
                buf[at..at + 8].copy_from_slice(&(t.secs as u64).to_le_bytes());
                buf[at + 8..at + 12].copy_from_slice(&t.nanos.to_le_bytes());
            }
        }
        buf
    }

    /// Decode a header; a short buffer means the object was never initialized.
    pub fn decode(buf: &[u8], store_time: bool) -> SealfsResult<Self> {
        let needed = Self::encoded_len(store_time);
        if buf.len() < needed {
            return Err(SealfsError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("object header truncated: {} of {needed} bytes", buf.len()),
            )));
        }

        let mut flags = [0u32; FLAG_COUNT];
        for (i, flag) in flags.iter_mut().enumerate() {
            *flag = read_u32(buf, i * 4);
        }

        let times = store_time.then(|| {
            let at = |i: usize| {
                let off = TIMES_OFFSET + i * TIMESPEC_LENGTH;
                Timespec::new(read_u64(buf, off) as i64, read_u32(buf, off + 8))
            };
            Times {
                atime: at(0),
                mtime: at(1),
                ctime: at(2),
                birthtime: at(3),
            }
        });

        Ok(Self { flags, times })
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}
