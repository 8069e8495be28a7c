//! sealfs-objects: the encrypted file-object model
//!
//! ```text
//!   ObjectTable ──► ObjectSlot { refcount, Mutex<FileObject> }
//!                                     │
//!                   FileObject = ObjectBase (header, streams, xattr cipher)
//!                              + ObjectBody::{RegularFile, Symlink, Directory}
//!                                     │
//!                   ObjectStore ──► (data stream, meta stream) per id
//! ```
//!
//! Every accessor and mutator is reached through the object's mutex guard.
//! Operations spanning two objects lock them with [`table::lock_pair`].

pub mod directory;
pub mod header;
pub mod long_name;
pub mod object;
pub mod os;
pub mod params;
pub mod store;
pub mod stream;
pub mod table;

pub use directory::{DirectoryTable, SimpleDirectory};
pub use long_name::{LongNameLookup, MemoryLongNameTable};
pub use object::{Directory, FileObject, ObjectStat, RegularFile, Symlink, TimeUpdate, XattrFlags};
pub use os::{Clock, LocalOs, ManualClock, OsService, SystemClock};
pub use params::ModelParams;
pub use store::{DirectoryStore, MemoryStore, ObjectStore, StreamPair};
pub use stream::{FileStream, MemoryStream, OsFileStream};
pub use table::{lock_pair, LockedPair, ObjectHandle, ObjectTable};

/// Longest entry name a directory accepts, in bytes
pub const MAX_NAME_LENGTH: usize = 255;
