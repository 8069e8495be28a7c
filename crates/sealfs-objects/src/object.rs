//! File objects: shared metadata plus a regular-file, symlink or directory body
//!
//! A [`FileObject`] is only reachable through its slot's mutex guard (see
//! [`crate::table`]), so every method here runs with the object locked.
//! Typed views ([`RegularFile`], [`Symlink`], [`Directory`]) are obtained with
//! the checked `as_*` casts.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use sealfs_core::types::S_IFMT;
use sealfs_core::{FileKind, ObjectId, SealfsError, SealfsResult, Timespec};
use sealfs_crypto::XattrCipher;

use crate::directory::{validate_name, DirectoryTable, SimpleDirectory};
use crate::header::{ObjectHeader, Times, FLAG_COUNT, FLAG_GID, FLAG_MODE, FLAG_NLINK, FLAG_UID, OPAQUE_FLAGS};
use crate::params::ModelParams;
use crate::store::StreamPair;
use crate::stream::{read_all, FileStream};

/// How `set_xattr` treats an existing attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrFlags {
    /// Create or replace.
    Any,
    /// Fail with EEXIST if the attribute exists.
    Create,
    /// Fail with ENODATA if the attribute does not exist.
    Replace,
}

/// Per-field instruction for [`ObjectBase::utimens`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUpdate {
    Now,
    Omit,
    Set(Timespec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub birthtime: Timespec,
}

/// Metadata and streams common to every kind of object.
pub struct ObjectBase {
    id: ObjectId,
    kind: FileKind,
    flags: [u32; FLAG_COUNT],
    times: Times,
    dirty: bool,
    data: Box<dyn FileStream>,
    meta: Box<dyn FileStream>,
    xattr: XattrCipher,
    params: Arc<ModelParams>,
}

impl ObjectBase {
    fn new(id: ObjectId, kind: FileKind, streams: StreamPair, params: Arc<ModelParams>) -> SealfsResult<Self> {
        let xattr = XattrCipher::new(&params.keys.xattr, &id)?;
        let now = params.clock.now();
        Ok(Self {
            id,
            kind,
            flags: [0; FLAG_COUNT],
            times: Times {
                atime: now,
                mtime: now,
                ctime: now,
                birthtime: now,
            },
            dirty: false,
            data: streams.data,
            meta: streams.meta,
            xattr,
            params,
        })
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Kind this object was opened as (from its directory entry).
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn mode(&self) -> u32 {
        self.flags[FLAG_MODE]
    }

    pub fn uid(&self) -> u32 {
        self.flags[FLAG_UID]
    }

    pub fn gid(&self) -> u32 {
        self.flags[FLAG_GID]
    }

    pub fn nlink(&self) -> u32 {
        self.flags[FLAG_NLINK]
    }

    pub fn flag(&self, index: usize) -> Option<u32> {
        self.flags.get(index).copied()
    }

    pub fn times(&self) -> Times {
        self.times
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn store_time(&self) -> bool {
        self.params.store_time
    }

    pub fn is_unlinked(&self) -> bool {
        self.nlink() == 0
    }

    fn now(&self) -> Timespec {
        self.params.clock.now()
    }

    /// Set up a freshly created object: nlink 1, all timestamps now.
    pub fn initialize_empty(&mut self, mode: u32, uid: u32, gid: u32) {
        self.flags[FLAG_MODE] = mode;
        self.flags[FLAG_UID] = uid;
        self.flags[FLAG_GID] = gid;
        self.flags[FLAG_NLINK] = 1;
        if self.store_time() {
            let now = self.now();
            self.times = Times {
                atime: now,
                mtime: now,
                ctime: now,
                birthtime: now,
            };
        }
        self.dirty = true;
    }

    /// Relatime-style: only when atime is older than mtime or ctime.
    fn touch_atime(&mut self) {
        if !self.store_time() {
            return;
        }
        if self.times.atime.secs < self.times.mtime.secs || self.times.atime.secs < self.times.ctime.secs {
            self.times.atime = self.now();
            self.dirty = true;
        }
    }

    fn touch_mtime(&mut self) {
        if !self.store_time() {
            return;
        }
        self.times.mtime = self.now();
        self.times.ctime = self.times.mtime;
        self.dirty = true;
    }

    fn touch_ctime(&mut self) {
        if !self.store_time() {
            return;
        }
        self.times.ctime = self.now();
        self.dirty = true;
    }

    fn update_flag(&mut self, index: usize, value: u32) {
        if self.flags[index] == value {
            return;
        }
        self.flags[index] = value;
        self.touch_ctime();
        self.dirty = true;
    }

    /// Raw mode including type bits. No-op if unchanged.
    pub fn set_mode(&mut self, mode: u32) {
        self.update_flag(FLAG_MODE, mode);
    }

    pub fn set_uid(&mut self, uid: u32) {
        self.update_flag(FLAG_UID, uid);
    }

    pub fn set_gid(&mut self, gid: u32) {
        self.update_flag(FLAG_GID, gid);
    }

    pub fn set_nlink(&mut self, nlink: u32) {
        self.update_flag(FLAG_NLINK, nlink);
    }

    /// Store one of the directory-engine integers (indices 4-6).
    pub fn set_opaque_flag(&mut self, index: usize, value: u32) -> SealfsResult<()> {
        if !OPAQUE_FLAGS.contains(&index) {
            return Err(SealfsError::from_errno(libc::EINVAL));
        }
        self.update_flag(index, value);
        Ok(())
    }

    /// Change permission bits, keeping the file-type bits.
    pub fn chmod(&mut self, mode: u32) {
        let new_mode = (self.mode() & S_IFMT) | (mode & !S_IFMT);
        self.set_mode(new_mode);
    }

    pub fn chown(&mut self, uid: Option<u32>, gid: Option<u32>) {
        if let Some(uid) = uid {
            self.set_uid(uid);
        }
        if let Some(gid) = gid {
            self.set_gid(gid);
        }
    }

    /// Drop one hard link. At zero the storage is reclaimed on last close.
    pub fn unlink(&mut self) {
        self.set_nlink(self.nlink().saturating_sub(1));
    }

    pub fn link(&mut self) {
        self.set_nlink(self.nlink().saturating_add(1));
    }

    pub fn utimens(&mut self, atime: TimeUpdate, mtime: TimeUpdate) {
        let now = self.now();
        let resolve = |update: TimeUpdate, current: Timespec| match update {
            TimeUpdate::Now => now,
            TimeUpdate::Omit => current,
            TimeUpdate::Set(t) => t,
        };
        self.times.atime = resolve(atime, self.times.atime);
        self.times.mtime = resolve(mtime, self.times.mtime);
        self.times.ctime = now;
        self.dirty = true;
    }

    pub fn stat(&mut self) -> SealfsResult<ObjectStat> {
        Ok(ObjectStat {
            ino: self.id.inode(),
            mode: self.mode(),
            uid: self.uid(),
            gid: self.gid(),
            nlink: self.nlink(),
            size: self.data.size()?,
            atime: self.times.atime,
            mtime: self.times.mtime,
            ctime: self.times.ctime,
            birthtime: self.times.birthtime,
        })
    }

    /// Force both streams to stable storage. Does not flush the header.
    pub fn fsync(&mut self) -> SealfsResult<()> {
        self.data.fsync()?;
        self.meta.fsync()?;
        Ok(())
    }

    // ── extended attributes ─────────────────────────────────────────────────

    pub fn list_xattr(&mut self) -> SealfsResult<Vec<String>> {
        Ok(self.data.list_xattr()?)
    }

    pub fn get_xattr(&mut self, name: &str) -> SealfsResult<Vec<u8>> {
        let blob = self.data.get_xattr(name)?;
        self.xattr.open(name, &blob)
    }

    pub fn set_xattr(&mut self, name: &str, value: &[u8], flags: XattrFlags) -> SealfsResult<()> {
        if flags != XattrFlags::Any {
            let exists = match self.data.get_xattr(name) {
                Ok(_) => true,
                Err(e) if e.raw_os_error() == Some(libc::ENODATA) => false,
                Err(e) => return Err(e.into()),
            };
            match (flags, exists) {
                (XattrFlags::Create, true) => return Err(SealfsError::from_errno(libc::EEXIST)),
                (XattrFlags::Replace, false) => return Err(SealfsError::from_errno(libc::ENODATA)),
                _ => {}
            }
        }
        let blob = self.xattr.seal(name, value)?;
        self.data.set_xattr(name, &blob)?;
        self.touch_ctime();
        Ok(())
    }

    pub fn remove_xattr(&mut self, name: &str) -> SealfsResult<()> {
        self.data.remove_xattr(name)?;
        self.touch_ctime();
        Ok(())
    }

    // ── header ──────────────────────────────────────────────────────────────

    fn header(&self) -> ObjectHeader {
        ObjectHeader {
            flags: self.flags,
            times: self.store_time().then_some(self.times),
        }
    }

    fn load_header(&mut self) -> SealfsResult<()> {
        let mut buf = vec![0u8; ObjectHeader::encoded_len(self.store_time())];
        let n = self.meta.read_at(0, &mut buf)?;
        let header = ObjectHeader::decode(&buf[..n], self.store_time())?;
        self.flags = header.flags;
        if let Some(times) = header.times {
            self.times = times;
        }
        Ok(())
    }

    fn write_header(&mut self) -> SealfsResult<()> {
        let encoded = self.header().encode();
        self.meta.write_at(0, &encoded)?;
        Ok(())
    }
}

impl std::fmt::Debug for ObjectBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBase")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("times", &self.times)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

enum ObjectBody {
    RegularFile,
    Symlink,
    Directory(Box<dyn DirectoryTable>),
}

impl ObjectBody {
    fn empty(kind: FileKind) -> Self {
        match kind {
            FileKind::RegularFile => ObjectBody::RegularFile,
            FileKind::Symlink => ObjectBody::Symlink,
            FileKind::Directory => ObjectBody::Directory(Box::new(SimpleDirectory::new())),
        }
    }
}

/// One filesystem object. Flushed one last time when dropped.
pub struct FileObject {
    base: ObjectBase,
    body: ObjectBody,
}

impl FileObject {
    /// A brand-new object; `mode`'s type bits are replaced by `kind`'s.
    pub fn create(
        id: ObjectId,
        kind: FileKind,
        streams: StreamPair,
        params: Arc<ModelParams>,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> SealfsResult<Self> {
        let mut base = ObjectBase::new(id, kind, streams, params)?;
        base.initialize_empty((mode & !S_IFMT) | kind.mode_bits(), uid, gid);
        tracing::debug!(%id, %kind, "created object");
        Ok(Self {
            base,
            body: ObjectBody::empty(kind),
        })
    }

    /// Load an existing object, declared as `kind` by whoever referenced it.
    ///
    /// A directory's entries are read eagerly. If the stored mode disagrees
    /// with `kind` the object still loads; the `as_*` casts report it.
    pub fn load(id: ObjectId, kind: FileKind, streams: StreamPair, params: Arc<ModelParams>) -> SealfsResult<Self> {
        let mut base = ObjectBase::new(id, kind, streams, params)?;
        base.load_header()?;
        let consistent = FileKind::from_mode(base.mode()) == Some(kind);
        let body = match kind {
            FileKind::Directory if consistent => {
                ObjectBody::Directory(Box::new(SimpleDirectory::load(base.data.as_mut())?))
            }
            _ => ObjectBody::empty(kind),
        };
        tracing::debug!(%id, %kind, "loaded object");
        Ok(Self { base, body })
    }

    /// Persist the header (and directory entries) if anything changed.
    ///
    /// A failure leaves the object dirty so a later flush retries.
    pub fn flush(&mut self) -> SealfsResult<()> {
        if !self.base.dirty {
            return Ok(());
        }
        self.base.write_header()?;
        if let ObjectBody::Directory(table) = &mut self.body {
            table.flush(self.base.data.as_mut())?;
        }
        self.base.data.flush()?;
        self.base.meta.flush()?;
        self.base.dirty = false;
        Ok(())
    }

    fn check_kind(&self, expected: FileKind) -> SealfsResult<()> {
        let mode = self.base.mode();
        if FileKind::from_mode(mode) != Some(self.base.kind) {
            return Err(SealfsError::TypeConsistency {
                id: self.base.id,
                declared: self.base.kind,
                mode,
            });
        }
        if self.base.kind != expected {
            return Err(SealfsError::InvalidCast {
                id: self.base.id,
                expected,
                actual: self.base.kind,
            });
        }
        Ok(())
    }

    pub fn as_regular_file(&mut self) -> SealfsResult<RegularFile<'_>> {
        self.check_kind(FileKind::RegularFile)?;
        Ok(RegularFile { base: &mut self.base })
    }

    pub fn as_symlink(&mut self) -> SealfsResult<Symlink<'_>> {
        self.check_kind(FileKind::Symlink)?;
        Ok(Symlink { base: &mut self.base })
    }

    pub fn as_directory(&mut self) -> SealfsResult<Directory<'_>> {
        self.check_kind(FileKind::Directory)?;
        match &mut self.body {
            ObjectBody::Directory(table) => Ok(Directory {
                base: &mut self.base,
                table: table.as_mut(),
            }),
            _ => Err(SealfsError::InvalidCast {
                id: self.base.id,
                expected: FileKind::Directory,
                actual: self.base.kind,
            }),
        }
    }
}

impl Deref for FileObject {
    type Target = ObjectBase;

    fn deref(&self) -> &ObjectBase {
        &self.base
    }
}

impl DerefMut for FileObject {
    fn deref_mut(&mut self) -> &mut ObjectBase {
        &mut self.base
    }
}

impl Drop for FileObject {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!(id = %self.base.id, "final flush failed: {e}");
        }
    }
}

impl std::fmt::Debug for FileObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileObject").field("base", &self.base).finish_non_exhaustive()
    }
}

// ── typed views ─────────────────────────────────────────────────────────────

pub struct RegularFile<'a> {
    base: &'a mut ObjectBase,
}

impl RegularFile<'_> {
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> SealfsResult<usize> {
        self.base.touch_atime();
        Ok(self.base.data.read_at(offset, buf)?)
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> SealfsResult<()> {
        self.base.touch_mtime();
        Ok(self.base.data.write_at(offset, data)?)
    }

    pub fn truncate(&mut self, len: u64) -> SealfsResult<()> {
        self.base.touch_mtime();
        Ok(self.base.data.resize(len)?)
    }

    pub fn size(&mut self) -> SealfsResult<u64> {
        Ok(self.base.data.size()?)
    }
}

pub struct Symlink<'a> {
    base: &'a mut ObjectBase,
}

impl Symlink<'_> {
    /// The stored target, without any terminator.
    pub fn get(&mut self) -> SealfsResult<String> {
        self.base.touch_atime();
        let bytes = read_all(self.base.data.as_mut())?;
        String::from_utf8(bytes).map_err(|_| {
            SealfsError::Io(io::Error::new(io::ErrorKind::InvalidData, "symlink target is not UTF-8"))
        })
    }

    pub fn set(&mut self, target: &str) -> SealfsResult<()> {
        self.base.data.write_at(0, target.as_bytes())?;
        self.base.data.resize(target.len() as u64)?;
        self.base.touch_mtime();
        Ok(())
    }
}

pub struct Directory<'a> {
    base: &'a mut ObjectBase,
    table: &'a mut dyn DirectoryTable,
}

impl Directory<'_> {
    pub fn get_entry(&mut self, name: &str) -> SealfsResult<Option<(ObjectId, FileKind)>> {
        self.base.touch_atime();
        self.table.get(self.base.data.as_mut(), name)
    }

    /// Fails with `EntryExists`, leaving the current entry alone, if `name` is taken.
    pub fn add_entry(&mut self, name: &str, id: ObjectId, kind: FileKind) -> SealfsResult<()> {
        validate_name(name)?;
        if !self.table.insert(self.base.data.as_mut(), name, id, kind)? {
            return Err(SealfsError::EntryExists(name.to_string()));
        }
        self.base.touch_mtime();
        self.base.dirty = true;
        Ok(())
    }

    pub fn remove_entry(&mut self, name: &str) -> SealfsResult<Option<(ObjectId, FileKind)>> {
        let removed = self.table.remove(self.base.data.as_mut(), name)?;
        if removed.is_some() {
            self.base.touch_mtime();
            self.base.dirty = true;
        }
        Ok(removed)
    }

    /// Visit entries until `visit` returns `false`.
    pub fn iterate(&mut self, mut visit: impl FnMut(&str, &ObjectId, FileKind) -> bool) -> SealfsResult<()> {
        self.base.touch_atime();
        self.table.for_each(self.base.data.as_mut(), &mut visit)
    }

    pub fn is_empty(&mut self) -> SealfsResult<bool> {
        self.table.is_empty(self.base.data.as_mut())
    }
}

impl std::fmt::Debug for RegularFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegularFile").field("id", &self.base.id).finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Symlink<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Symlink").field("id", &self.base.id).finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Directory<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory").field("id", &self.base.id).finish_non_exhaustive()
    }
}
