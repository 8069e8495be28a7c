//! sealfs-core: types and errors shared by every sealfs crate.

pub mod config;
pub mod error;
pub mod types;

pub use error::{SealfsError, SealfsResult};
pub use types::{FileKind, ObjectId, Timespec, ID_LENGTH};
