//! Lookup tables mapping long-name components back to full encrypted names
//!
//! Each directory that holds long-name components keeps one table. Moving an
//! entry between directories goes through [`transfer`], which updates both
//! tables under one critical section and restores them if the insert fails.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sealfs_core::{SealfsError, SealfsResult};
use sealfs_crypto::names::{is_long_name_component, long_name_component, needs_long_name_component};
use sealfs_crypto::SecretKey;

pub trait LongNameLookup: Send + Sync {
    fn lookup(&self, hash: &str) -> SealfsResult<Option<String>>;

    /// Record `hash → name`; an existing mapping for `hash` is kept.
    fn insert(&self, hash: &str, name: &str) -> SealfsResult<()>;

    fn remove(&self, hash: &str) -> SealfsResult<()>;

    fn list_hashes(&self) -> SealfsResult<Vec<String>>;
}

static NEXT_TABLE_ORDER: AtomicU64 = AtomicU64::new(0);

/// In-memory [`LongNameLookup`].
#[derive(Debug)]
pub struct MemoryLongNameTable {
    order: u64,
    entries: Mutex<BTreeMap<String, String>>,
}

impl Default for MemoryLongNameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLongNameTable {
    pub fn new() -> Self {
        Self {
            order: NEXT_TABLE_ORDER.fetch_add(1, Ordering::Relaxed),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LongNameLookup for MemoryLongNameTable {
    fn lookup(&self, hash: &str) -> SealfsResult<Option<String>> {
        Ok(self.entries().get(hash).cloned())
    }

    fn insert(&self, hash: &str, name: &str) -> SealfsResult<()> {
        self.entries()
            .entry(hash.to_string())
            .or_insert_with(|| name.to_string());
        Ok(())
    }

    fn remove(&self, hash: &str) -> SealfsResult<()> {
        self.entries().remove(hash);
        Ok(())
    }

    fn list_hashes(&self) -> SealfsResult<Vec<String>> {
        Ok(self.entries().keys().cloned().collect())
    }
}

/// Move `name` from `src_hash` in `src` to `dst_hash` in `dst`.
///
/// Fails with EEXIST if `dst_hash` already maps to a different name; both
/// tables are then left exactly as they were.
pub fn transfer(
    src: &MemoryLongNameTable,
    dst: &MemoryLongNameTable,
    src_hash: &str,
    dst_hash: &str,
    name: &str,
) -> SealfsResult<()> {
    if std::ptr::eq(src, dst) {
        let mut entries = src.entries();
        let snapshot = entries.clone();
        entries.remove(src_hash);
        let result = apply_insert(&mut entries, dst_hash, name);
        if result.is_err() {
            *entries = snapshot;
        }
        return result;
    }

    let (mut src_entries, mut dst_entries) = if src.order < dst.order {
        let s = src.entries();
        let d = dst.entries();
        (s, d)
    } else {
        let d = dst.entries();
        let s = src.entries();
        (s, d)
    };

    let src_snapshot = src_entries.clone();
    let dst_snapshot = dst_entries.clone();
    src_entries.remove(src_hash);
    let result = apply_insert(&mut dst_entries, dst_hash, name);
    if result.is_err() {
        *src_entries = src_snapshot;
        *dst_entries = dst_snapshot;
    }
    result
}

fn apply_insert(entries: &mut BTreeMap<String, String>, hash: &str, name: &str) -> SealfsResult<()> {
    match entries.get(hash) {
        Some(existing) if existing != name => {
            tracing::warn!(hash, "long-name component already maps to another name");
            Err(SealfsError::from_errno(libc::EEXIST))
        }
        Some(_) => Ok(()),
        None => {
            entries.insert(hash.to_string(), name.to_string());
            Ok(())
        }
    }
}

/// The on-disk component for `encrypted_name`.
///
/// Names within `limit` are used as-is; longer ones are replaced by their
/// long-name component after recording the mapping in `table`.
pub fn store_name(
    table: &dyn LongNameLookup,
    name_key: &SecretKey,
    encrypted_name: &str,
    limit: usize,
) -> SealfsResult<String> {
    if !needs_long_name_component(encrypted_name, limit) {
        return Ok(encrypted_name.to_string());
    }
    let component = long_name_component(name_key, encrypted_name)?;
    table.insert(&component, encrypted_name)?;
    Ok(component)
}

/// Inverse of [`store_name`]. A long-name component with no mapping is ENOENT.
pub fn resolve_name(table: &dyn LongNameLookup, component: &str) -> SealfsResult<String> {
    if !is_long_name_component(component) {
        return Ok(component.to_string());
    }
    table
        .lookup(component)?
        .ok_or_else(|| SealfsError::from_errno(libc::ENOENT))
}
