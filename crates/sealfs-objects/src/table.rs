//! Open-object table: one slot per loaded object, shared by reference count
//!
//! Opening an id that is already loaded hands out the same slot, so every
//! caller sees (and locks) the same [`FileObject`]. The last handle to go
//! away flushes the object and, if its link count reached zero, reclaims its
//! storage.
//!
//! Lock order: the slot map before any object, and objects in ascending id
//! order (see [`lock_pair`]). Loading, the final flush and storage reclaim run
//! with the slot map unlocked; a slot being released stays in the map, marked
//! closing, until its object has been written back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sealfs_core::types::S_IFDIR;
use sealfs_core::{FileKind, ObjectId, SealfsError, SealfsResult};

use crate::object::FileObject;
use crate::params::ModelParams;
use crate::store::ObjectStore;

struct ObjectSlot {
    id: ObjectId,
    kind: FileKind,
    refcount: AtomicUsize,
    closing: AtomicBool,
    object: Mutex<FileObject>,
}

impl ObjectSlot {
    fn new(id: ObjectId, kind: FileKind, object: FileObject) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            refcount: AtomicUsize::new(1),
            closing: AtomicBool::new(false),
            object: Mutex::new(object),
        })
    }

    fn lock_object(&self) -> MutexGuard<'_, FileObject> {
        self.object.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct TableInner {
    store: Arc<dyn ObjectStore>,
    params: Arc<ModelParams>,
    slots: Mutex<HashMap<ObjectId, Arc<ObjectSlot>>>,
}

#[derive(Clone)]
pub struct ObjectTable {
    inner: Arc<TableInner>,
}

impl ObjectTable {
    /// Open the table, creating an empty root directory owned by
    /// `uid`/`gid` if the store has none.
    pub fn new(store: Arc<dyn ObjectStore>, params: Arc<ModelParams>, uid: u32, gid: u32) -> SealfsResult<Self> {
        let table = Self {
            inner: Arc::new(TableInner {
                store,
                params,
                slots: Mutex::new(HashMap::new()),
            }),
        };

        match table.open_root() {
            Ok(_) => {}
            Err(e) if e.errno() == libc::ENOENT => {
                let streams = table.inner.store.create(&ObjectId::ROOT)?;
                let mut root = FileObject::create(
                    ObjectId::ROOT,
                    FileKind::Directory,
                    streams,
                    table.inner.params.clone(),
                    S_IFDIR | 0o755,
                    uid,
                    gid,
                )?;
                root.flush()?;
                tracing::info!("initialized empty root directory");
            }
            Err(e) => return Err(e),
        }
        Ok(table)
    }

    pub fn params(&self) -> &Arc<ModelParams> {
        &self.inner.params
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<ObjectId, Arc<ObjectSlot>>> {
        self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of objects currently loaded.
    pub fn open_count(&self) -> usize {
        self.lock_slots().len()
    }

    /// Create a new object under a fresh random id.
    pub fn create_as(&self, kind: FileKind, mode: u32, uid: u32, gid: u32) -> SealfsResult<ObjectHandle> {
        let id = ObjectId::random();
        let streams = self.inner.store.create(&id)?;
        let mut object = FileObject::create(id, kind, streams, self.inner.params.clone(), mode, uid, gid)?;
        object.flush()?;

        let slot = ObjectSlot::new(id, kind, object);
        self.lock_slots().insert(id, slot.clone());
        Ok(self.handle(slot))
    }

    /// Open `id` as `kind`, sharing the slot if it is already loaded.
    pub fn open_as(&self, id: &ObjectId, kind: FileKind) -> SealfsResult<ObjectHandle> {
        if id.is_root() && kind != FileKind::Directory {
            return Err(SealfsError::InvalidCast {
                id: *id,
                expected: kind,
                actual: FileKind::Directory,
            });
        }

        loop {
            if let Some(handle) = self.share_loaded(id, kind)? {
                return Ok(handle);
            }

            let streams = self.inner.store.open(id)?;
            let object = FileObject::load(*id, kind, streams, self.inner.params.clone())?;

            let mut slots = self.lock_slots();
            if slots.contains_key(id) {
                // Another opener won the race; use its slot.
                drop(slots);
                drop(object);
                continue;
            }
            let slot = ObjectSlot::new(*id, kind, object);
            slots.insert(*id, slot.clone());
            drop(slots);
            return Ok(self.handle(slot));
        }
    }

    /// A new handle on an already loaded slot, waiting out a release in
    /// progress. `None` if `id` is not loaded.
    fn share_loaded(&self, id: &ObjectId, kind: FileKind) -> SealfsResult<Option<ObjectHandle>> {
        loop {
            let slots = self.lock_slots();
            let Some(slot) = slots.get(id).cloned() else {
                return Ok(None);
            };
            if slot.closing.load(Ordering::SeqCst) {
                drop(slots);
                // The releasing thread holds the object lock until write-back ends.
                drop(slot.lock_object());
                std::thread::yield_now();
                continue;
            }
            if slot.kind != kind {
                return Err(SealfsError::InvalidCast {
                    id: *id,
                    expected: kind,
                    actual: slot.kind,
                });
            }
            slot.refcount.fetch_add(1, Ordering::SeqCst);
            drop(slots);
            return Ok(Some(self.handle(slot)));
        }
    }

    fn handle(&self, slot: Arc<ObjectSlot>) -> ObjectHandle {
        ObjectHandle {
            table: self.clone(),
            slot,
        }
    }

    pub fn open_root(&self) -> SealfsResult<ObjectHandle> {
        self.open_as(&ObjectId::ROOT, FileKind::Directory)
    }

    /// Called after a handle dropped the count to zero.
    fn release(&self, slot: &Arc<ObjectSlot>) {
        let mut slots = self.lock_slots();
        let current = slots.get(&slot.id).is_some_and(|s| Arc::ptr_eq(s, slot));
        if !current || slot.refcount.load(Ordering::SeqCst) != 0 || slot.closing.load(Ordering::SeqCst) {
            // Reopened (or already being released) in the meantime.
            return;
        }
        // No handles means no guards, so this lock is uncontended.
        let mut object = slot.lock_object();
        slot.closing.store(true, Ordering::SeqCst);
        drop(slots);

        if let Err(e) = object.flush() {
            tracing::error!(id = %slot.id, "flush on close failed: {e}");
        }
        if object.is_unlinked() {
            tracing::debug!(id = %slot.id, "reclaiming unlinked object");
            self.inner.store.unlink(&slot.id);
        }
        drop(object);

        let mut slots = self.lock_slots();
        if slots.get(&slot.id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&slot.id);
        }
    }
}

impl std::fmt::Debug for ObjectTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectTable")
            .field("open", &self.open_count())
            .finish_non_exhaustive()
    }
}

/// A counted reference to a loaded object.
pub struct ObjectHandle {
    table: ObjectTable,
    slot: Arc<ObjectSlot>,
}

impl ObjectHandle {
    pub fn id(&self) -> &ObjectId {
        &self.slot.id
    }

    pub fn kind(&self) -> FileKind {
        self.slot.kind
    }

    pub fn lock(&self) -> MutexGuard<'_, FileObject> {
        self.slot.lock_object()
    }

    pub fn refcount(&self) -> usize {
        self.slot.refcount.load(Ordering::SeqCst)
    }
}

impl Clone for ObjectHandle {
    fn clone(&self) -> Self {
        self.slot.refcount.fetch_add(1, Ordering::SeqCst);
        Self {
            table: self.table.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        let previous = self
            .slot
            .refcount
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(1) => self.table.release(&self.slot),
            Ok(_) => {}
            Err(_) => tracing::error!(id = %self.slot.id, "refcount underflow on close"),
        }
    }
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("id", &self.slot.id)
            .field("kind", &self.slot.kind)
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Guards for two objects locked together.
pub enum LockedPair<'a> {
    /// Both handles refer to the same object.
    Same(MutexGuard<'a, FileObject>),
    /// Guards in argument order.
    Distinct(MutexGuard<'a, FileObject>, MutexGuard<'a, FileObject>),
}

/// Lock two objects in ascending id order; a single lock if they are the same.
pub fn lock_pair<'a>(a: &'a ObjectHandle, b: &'a ObjectHandle) -> LockedPair<'a> {
    if a.id() == b.id() {
        return LockedPair::Same(a.lock());
    }
    if a.id() < b.id() {
        let first = a.lock();
        let second = b.lock();
        LockedPair::Distinct(first, second)
    } else {
        let second = b.lock();
        let first = a.lock();
        LockedPair::Distinct(first, second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::ManualClock;
    use crate::store::MemoryStore;
    use crate::test_support::params_with_clock;
    use sealfs_core::Timespec;

    fn table() -> (Arc<MemoryStore>, ObjectTable) {
        let store = Arc::new(MemoryStore::new());
        let params = params_with_clock(Arc::new(ManualClock::new(Timespec::new(1, 0))), true);
        let table = ObjectTable::new(store.clone(), params, 1000, 100).unwrap();
        (store, table)
    }

    #[test]
    fn test_new_creates_root_once() {
        let (store, table) = table();
        assert!(store.contains(&ObjectId::ROOT));
        assert_eq!(table.open_count(), 0);

        let root = table.open_root().unwrap();
        let stat = root.lock().stat().unwrap();
        assert_eq!(stat.mode, S_IFDIR | 0o755);
        assert_eq!((stat.uid, stat.gid), (1000, 100));
        root.lock()
            .as_directory()
            .unwrap()
            .add_entry("keep", ObjectId::random(), FileKind::RegularFile)
            .unwrap();
        drop(root);

        let again = ObjectTable::new(store.clone(), table.params().clone(), 0, 0).unwrap();
        let root = again.open_root().unwrap();
        let mut guard = root.lock();
        assert!(guard.as_directory().unwrap().get_entry("keep").unwrap().is_some());
        assert_eq!(guard.uid(), 1000);
    }

    #[test]
    fn test_open_shares_slot() {
        let (_, table) = table();
        let a = table.open_root().unwrap();
        let b = table.open_root().unwrap();
        assert_eq!(a.refcount(), 2);
        assert_eq!(table.open_count(), 1);

        let c = b.clone();
        assert_eq!(a.refcount(), 3);
        drop(b);
        drop(c);
        assert_eq!(a.refcount(), 1);
        assert_eq!(table.open_count(), 1);
        drop(a);
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_open_kind_mismatch() {
        let (_, table) = table();
        let file = table.create_as(FileKind::RegularFile, 0o644, 0, 0).unwrap();
        let err = table.open_as(file.id(), FileKind::Directory).unwrap_err();
        assert!(matches!(
            err,
            SealfsError::InvalidCast {
                expected: FileKind::Directory,
                actual: FileKind::RegularFile,
                ..
            }
        ));
        assert_eq!(file.refcount(), 1);

        let err = table.open_as(&ObjectId::ROOT, FileKind::Symlink).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_open_missing_is_enoent() {
        let (_, table) = table();
        let err = table.open_as(&ObjectId::random(), FileKind::RegularFile).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_create_persists_header_immediately() {
        let (store, table) = table();
        let file = table.create_as(FileKind::Symlink, 0o777, 5, 6).unwrap();
        let (_, meta) = store.streams(file.id()).unwrap();
        assert_eq!(meta.contents().len(), 80);
        assert!(!file.lock().is_dirty());
    }

    #[test]
    fn test_last_close_reclaims_unlinked() {
        let (store, table) = table();
        let file = table.create_as(FileKind::RegularFile, 0o644, 0, 0).unwrap();
        let id = *file.id();
        let other = table.open_as(&id, FileKind::RegularFile).unwrap();

        file.lock().unlink();
        drop(file);
        assert!(store.contains(&id), "still open elsewhere");

        drop(other);
        assert!(!store.contains(&id));
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_last_close_keeps_linked() {
        let (store, table) = table();
        let file = table.create_as(FileKind::RegularFile, 0o644, 0, 0).unwrap();
        let id = *file.id();
        file.lock().chmod(0o600);
        drop(file);

        assert!(store.contains(&id));
        let reopened = table.open_as(&id, FileKind::RegularFile).unwrap();
        assert_eq!(reopened.lock().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_concurrent_clone_and_drop_keep_count() {
        let (_, table) = table();
        let a = table.open_root().unwrap();
        let b = a.clone();

        std::thread::scope(|s| {
            for handle in [&a, &b] {
                s.spawn(move || {
                    for _ in 0..20_000 {
                        let extra = handle.clone();
                        drop(extra);
                    }
                });
            }
        });

        assert_eq!(a.refcount(), 2);
        assert_eq!(table.open_count(), 1);
        drop(b);
        drop(a);
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_open_close_cycles_share_one_object() {
        let (_, table) = table();
        let id = {
            let file = table.create_as(FileKind::RegularFile, 0o644, 0, 0).unwrap();
            file.lock().as_regular_file().unwrap().write(0, &0u64.to_le_bytes()).unwrap();
            *file.id()
        };

        std::thread::scope(|s| {
            for _ in 0..4 {
                let table = &table;
                s.spawn(move || {
                    for _ in 0..500 {
                        let handle = table.open_as(&id, FileKind::RegularFile).unwrap();
                        let mut guard = handle.lock();
                        let mut file = guard.as_regular_file().unwrap();
                        let mut buf = [0u8; 8];
                        assert_eq!(file.read(0, &mut buf).unwrap(), 8);
                        let next = u64::from_le_bytes(buf) + 1;
                        file.write(0, &next.to_le_bytes()).unwrap();
                    }
                });
            }
        });

        assert_eq!(table.open_count(), 0);
        let handle = table.open_as(&id, FileKind::RegularFile).unwrap();
        let mut guard = handle.lock();
        let mut buf = [0u8; 8];
        guard.as_regular_file().unwrap().read(0, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 2_000);
    }

    #[test]
    fn test_lock_pair_orders_guards() {
        let (_, table) = table();
        let a = table.create_as(FileKind::RegularFile, 0o644, 0, 0).unwrap();
        let b = table.create_as(FileKind::Directory, 0o755, 0, 0).unwrap();

        match lock_pair(&a, &b) {
            LockedPair::Distinct(first, second) => {
                assert_eq!(first.id(), a.id());
                assert_eq!(second.id(), b.id());
            }
            LockedPair::Same(_) => panic!("distinct objects locked once"),
        }
        match lock_pair(&b, &a) {
            LockedPair::Distinct(first, second) => {
                assert_eq!(first.id(), b.id());
                assert_eq!(second.id(), a.id());
            }
            LockedPair::Same(_) => panic!("distinct objects locked once"),
        }

        let a2 = a.clone();
        assert!(matches!(lock_pair(&a, &a2), LockedPair::Same(_)));
    }
}
