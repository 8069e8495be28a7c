//! Directory entry tables: name → (id, kind)

use std::collections::HashMap;
use std::io;

use sealfs_core::{FileKind, ObjectId, SealfsError, SealfsResult, ID_LENGTH};

use crate::stream::{read_all, FileStream};
use crate::MAX_NAME_LENGTH;

/// Storage engine behind a directory object.
///
/// Every call receives the directory's data stream so paged implementations
/// can read and write on demand. Callers hold the directory's lock.
pub trait DirectoryTable: Send {
    fn get(&mut self, stream: &mut dyn FileStream, name: &str) -> SealfsResult<Option<(ObjectId, FileKind)>>;

    /// Insert a new entry. Returns `false`, changing nothing, if `name` exists.
    fn insert(
        &mut self,
        stream: &mut dyn FileStream,
        name: &str,
        id: ObjectId,
        kind: FileKind,
    ) -> SealfsResult<bool>;

    fn remove(&mut self, stream: &mut dyn FileStream, name: &str) -> SealfsResult<Option<(ObjectId, FileKind)>>;

    /// Visit entries in unspecified order until `visit` returns `false`.
    fn for_each(
        &mut self,
        stream: &mut dyn FileStream,
        visit: &mut dyn FnMut(&str, &ObjectId, FileKind) -> bool,
    ) -> SealfsResult<()>;

    fn is_empty(&mut self, stream: &mut dyn FileStream) -> SealfsResult<bool>;

    /// Persist pending changes to `stream`.
    fn flush(&mut self, stream: &mut dyn FileStream) -> SealfsResult<()>;
}

/// Name field width in a persisted record (NUL padded)
pub const RECORD_NAME_LENGTH: usize = MAX_NAME_LENGTH + 1;

/// name (256) + id (32) + kind code (4)
pub const RECORD_LENGTH: usize = RECORD_NAME_LENGTH + ID_LENGTH + 4;

/// Whole-table directory: every entry in memory, rewritten on flush.
///
/// Records are fixed 292-byte slots; order on disk is unspecified.
#[derive(Debug, Default)]
pub struct SimpleDirectory {
    entries: HashMap<String, (ObjectId, FileKind)>,
    dirty: bool,
}

impl SimpleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every record from `stream`.
    pub fn load(stream: &mut dyn FileStream) -> SealfsResult<Self> {
        let buf = read_all(stream)?;
        if buf.len() % RECORD_LENGTH != 0 {
            return Err(corrupt(format!(
                "directory table is {} bytes, not a multiple of {RECORD_LENGTH}",
                buf.len()
            )));
        }

        let mut entries = HashMap::with_capacity(buf.len() / RECORD_LENGTH);
        for record in buf.chunks_exact(RECORD_LENGTH) {
            let (name, id, kind) = decode_record(record)?;
            if entries.insert(name.clone(), (id, kind)).is_some() {
                return Err(corrupt(format!("duplicate directory entry {name:?}")));
            }
        }
        Ok(Self {
            entries,
            dirty: false,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl DirectoryTable for SimpleDirectory {
    fn get(&mut self, _stream: &mut dyn FileStream, name: &str) -> SealfsResult<Option<(ObjectId, FileKind)>> {
        Ok(self.entries.get(name).copied())
    }

    fn insert(
        &mut self,
        _stream: &mut dyn FileStream,
        name: &str,
        id: ObjectId,
        kind: FileKind,
    ) -> SealfsResult<bool> {
        validate_name(name)?;
        if self.entries.contains_key(name) {
            return Ok(false);
        }
        self.entries.insert(name.to_string(), (id, kind));
        self.dirty = true;
        Ok(true)
    }

    fn remove(&mut self, _stream: &mut dyn FileStream, name: &str) -> SealfsResult<Option<(ObjectId, FileKind)>> {
        let removed = self.entries.remove(name);
        if removed.is_some() {
            self.dirty = true;
        }
        Ok(removed)
    }

    fn for_each(
        &mut self,
        _stream: &mut dyn FileStream,
        visit: &mut dyn FnMut(&str, &ObjectId, FileKind) -> bool,
    ) -> SealfsResult<()> {
        for (name, (id, kind)) in &self.entries {
            if !visit(name, id, *kind) {
                break;
            }
        }
        Ok(())
    }

    fn is_empty(&mut self, _stream: &mut dyn FileStream) -> SealfsResult<bool> {
        Ok(self.entries.is_empty())
    }

    fn flush(&mut self, stream: &mut dyn FileStream) -> SealfsResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(self.entries.len() * RECORD_LENGTH);
        for (name, (id, kind)) in &self.entries {
            encode_record(&mut buf, name, id, *kind);
        }
        stream.resize(0)?;
        stream.write_at(0, &buf)?;
        self.dirty = false;
        Ok(())
    }
}

/// Names must be non-empty, at most 255 bytes, and free of NUL.
pub fn validate_name(name: &str) -> SealfsResult<()> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(SealfsError::NameTooLong(name.len()));
    }
    if name.is_empty() || name.contains('\0') {
        return Err(SealfsError::from_errno(libc::EINVAL));
    }
    Ok(())
}

fn corrupt(msg: String) -> SealfsError {
    SealfsError::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
}

fn encode_record(buf: &mut Vec<u8>, name: &str, id: &ObjectId, kind: FileKind) {
    let start = buf.len();
    buf.resize(start + RECORD_LENGTH, 0);
    let record = &mut buf[start..];
    record[..name.len()].copy_from_slice(name.as_bytes());
    record[RECORD_NAME_LENGTH..RECORD_NAME_LENGTH + ID_LENGTH].copy_from_slice(id.as_bytes());
    record[RECORD_NAME_LENGTH + ID_LENGTH..].copy_from_slice(&kind.code().to_le_bytes());
}

fn decode_record(record: &[u8]) -> SealfsResult<(String, ObjectId, FileKind)> {
    let name_field = &record[..RECORD_NAME_LENGTH];
    let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(RECORD_NAME_LENGTH);
    let name = std::str::from_utf8(&name_field[..name_len])
        .map_err(|_| corrupt("directory entry name is not UTF-8".into()))?
        .to_string();
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(corrupt(format!("directory entry name has bad length {}", name.len())));
    }

    let id = ObjectId::from_slice(&record[RECORD_NAME_LENGTH..RECORD_NAME_LENGTH + ID_LENGTH])
        .ok_or_else(|| corrupt("directory entry id truncated".into()))?;

    let mut code = [0u8; 4];
    code.copy_from_slice(&record[RECORD_NAME_LENGTH + ID_LENGTH..]);
    let code = u32::from_le_bytes(code);
    let kind = FileKind::from_code(code)
        .ok_or_else(|| corrupt(format!("directory entry {name:?} has unknown kind {code}")))?;

    Ok((name, id, kind))
}
