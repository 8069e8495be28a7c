//! Object storage: id → (data stream, meta stream)

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use sealfs_core::{ObjectId, SealfsResult};

use crate::os::OsService;
use crate::stream::{FileStream, MemoryStream};

/// The two streams behind one object.
pub struct StreamPair {
    pub data: Box<dyn FileStream>,
    pub meta: Box<dyn FileStream>,
}

impl std::fmt::Debug for StreamPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPair").finish_non_exhaustive()
    }
}

pub trait ObjectStore: Send + Sync {
    /// Open the streams of an existing object (ENOENT if absent).
    fn open(&self, id: &ObjectId) -> SealfsResult<StreamPair>;

    /// Create the streams of a new object (EEXIST if present).
    fn create(&self, id: &ObjectId) -> SealfsResult<StreamPair>;

    /// Reclaim an object's storage. Best effort: failures are logged only.
    fn unlink(&self, id: &ObjectId);
}

/// Sharded on-disk layout:
///
/// ```text
/// <hex(id[0])>/<hex(id[1..])>        data
/// <hex(id[0])>/<hex(id[1..])>.meta   metadata
/// ```
pub struct DirectoryStore {
    os: Arc<dyn OsService>,
}

impl DirectoryStore {
    pub fn new(os: Arc<dyn OsService>) -> Self {
        Self { os }
    }

    fn shard(id: &ObjectId) -> PathBuf {
        PathBuf::from(hex::encode(&id.as_bytes()[..1]))
    }

    /// `(data path, meta path)` relative to the data directory.
    pub fn paths(id: &ObjectId) -> (PathBuf, PathBuf) {
        let rest = hex::encode(&id.as_bytes()[1..]);
        let shard = Self::shard(id);
        (shard.join(&rest), shard.join(format!("{rest}.meta")))
    }

    fn open_pair(&self, id: &ObjectId, create: bool) -> io::Result<StreamPair> {
        let (data_path, meta_path) = Self::paths(id);
        let data = self.os.open_file_stream(&data_path, create)?;
        let meta = match self.os.open_file_stream(&meta_path, create) {
            Ok(meta) => meta,
            Err(e) => {
                if create {
                    drop(data);
                    let _ = self.os.remove_file(&data_path);
                }
                return Err(e);
            }
        };
        Ok(StreamPair { data, meta })
    }
}

impl ObjectStore for DirectoryStore {
    fn open(&self, id: &ObjectId) -> SealfsResult<StreamPair> {
        Ok(self.open_pair(id, false)?)
    }

    fn create(&self, id: &ObjectId) -> SealfsResult<StreamPair> {
        self.os.ensure_directory(&Self::shard(id))?;
        Ok(self.open_pair(id, true)?)
    }

    fn unlink(&self, id: &ObjectId) {
        let (data_path, meta_path) = Self::paths(id);
        for path in [&data_path, &meta_path] {
            if let Err(e) = self.os.remove_file(path) {
                tracing::warn!(%id, "failed to remove {}: {e}", path.display());
            }
        }
        // Succeeds only once the shard is empty.
        let _ = self.os.remove_directory(&Self::shard(id));
    }
}

/// In-memory store; streams stay inspectable through [`MemoryStore::streams`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<ObjectId, (MemoryStream, MemoryStream)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(data, meta)` of a stored object.
    pub fn streams(&self, id: &ObjectId) -> Option<(MemoryStream, MemoryStream)> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.streams(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn pair((data, meta): (MemoryStream, MemoryStream)) -> StreamPair {
    StreamPair {
        data: Box::new(data),
        meta: Box::new(meta),
    }
}

impl ObjectStore for MemoryStore {
    fn open(&self, id: &ObjectId) -> SealfsResult<StreamPair> {
        let streams = self
            .streams(id)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        Ok(pair(streams))
    }

    fn create(&self, id: &ObjectId) -> SealfsResult<StreamPair> {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        if objects.contains_key(id) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST).into());
        }
        let streams = (MemoryStream::new(), MemoryStream::new());
        objects.insert(*id, streams.clone());
        Ok(pair(streams))
    }

    fn unlink(&self, id: &ObjectId) {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}
