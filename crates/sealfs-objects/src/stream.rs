//! Byte streams backing each object (one for data, one for metadata)

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Random-access byte stream with optional extended attributes.
///
/// Implementations block the calling thread for the duration of the I/O.
pub trait FileStream: Send {
    /// Read up to `buf.len()` bytes at `offset`; short only at end of stream.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    fn resize(&mut self, len: u64) -> io::Result<()>;

    fn size(&mut self) -> io::Result<u64>;

    fn flush(&mut self) -> io::Result<()>;

    fn fsync(&mut self) -> io::Result<()>;

    fn get_xattr(&mut self, _name: &str) -> io::Result<Vec<u8>> {
        Err(unsupported())
    }

    fn set_xattr(&mut self, _name: &str, _value: &[u8]) -> io::Result<()> {
        Err(unsupported())
    }

    fn list_xattr(&mut self) -> io::Result<Vec<String>> {
        Err(unsupported())
    }

    fn remove_xattr(&mut self, _name: &str) -> io::Result<()> {
        Err(unsupported())
    }
}

fn unsupported() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOTSUP)
}

/// Read the whole stream.
pub fn read_all(stream: &mut dyn FileStream) -> io::Result<Vec<u8>> {
    let len = usize::try_from(stream.size()?)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "stream too large"))?;
    let mut buf = vec![0u8; len];
    let n = stream.read_at(0, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

// ── MemoryStream ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryInner {
    data: Vec<u8>,
    xattrs: BTreeMap<String, Vec<u8>>,
    writes: u64,
    fsyncs: u64,
    fail_writes: bool,
}

/// In-memory stream. Clones share the same contents.
///
/// Counts mutating calls so tests can assert that a flush did no I/O, and
/// can be switched to fail every write with EIO.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner().data.clone()
    }

    /// Number of write, resize and xattr-mutation calls so far.
    pub fn write_count(&self) -> u64 {
        self.inner().writes
    }

    pub fn fsync_count(&self) -> u64 {
        self.inner().fsyncs
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner().fail_writes = fail;
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut MemoryInner) -> io::Result<T>) -> io::Result<T> {
        let mut inner = self.inner();
        if inner.fail_writes {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        inner.writes += 1;
        f(&mut inner)
    }
}

fn to_index(offset: u64) -> io::Result<usize> {
    usize::try_from(offset).map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))
}

impl FileStream for MemoryStream {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let inner = self.inner();
        let start = to_index(offset)?;
        if start >= inner.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(inner.data.len() - start);
        buf[..n].copy_from_slice(&inner.data[start..start + n]);
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = to_index(offset)?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EFBIG))?;
        self.mutate(|inner| {
            if inner.data.len() < end {
                inner.data.resize(end, 0);
            }
            inner.data[start..end].copy_from_slice(data);
            Ok(())
        })
    }

    fn resize(&mut self, len: u64) -> io::Result<()> {
        let len = to_index(len)?;
        self.mutate(|inner| {
            inner.data.resize(len, 0);
            Ok(())
        })
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.inner().data.len() as u64)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn fsync(&mut self) -> io::Result<()> {
        self.inner().fsyncs += 1;
        Ok(())
    }

    fn get_xattr(&mut self, name: &str) -> io::Result<Vec<u8>> {
        self.inner()
            .xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODATA))
    }

    fn set_xattr(&mut self, name: &str, value: &[u8]) -> io::Result<()> {
        self.mutate(|inner| {
            inner.xattrs.insert(name.to_string(), value.to_vec());
            Ok(())
        })
    }

    fn list_xattr(&mut self) -> io::Result<Vec<String>> {
        Ok(self.inner().xattrs.keys().cloned().collect())
    }

    fn remove_xattr(&mut self, name: &str) -> io::Result<()> {
        self.mutate(|inner| match inner.xattrs.remove(name) {
            Some(_) => Ok(()),
            None => Err(io::Error::from_raw_os_error(libc::ENODATA)),
        })
    }
}

// ── OsFileStream ─────────────────────────────────────────────────────────────

/// Stream over a regular file on the backing filesystem.
#[derive(Debug)]
pub struct OsFileStream {
    file: File,
    path: PathBuf,
}

impl OsFileStream {
    pub fn new(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileStream for OsFileStream {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn resize(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn fsync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    #[cfg(target_os = "linux")]
    fn get_xattr(&mut self, name: &str) -> io::Result<Vec<u8>> {
        linux_xattr::get(&self.file, name)
    }

    #[cfg(target_os = "linux")]
    fn set_xattr(&mut self, name: &str, value: &[u8]) -> io::Result<()> {
        linux_xattr::set(&self.file, name, value)
    }

    #[cfg(target_os = "linux")]
    fn list_xattr(&mut self) -> io::Result<Vec<String>> {
        linux_xattr::list(&self.file)
    }

    #[cfg(target_os = "linux")]
    fn remove_xattr(&mut self, name: &str) -> io::Result<()> {
        linux_xattr::remove(&self.file, name)
    }
}

#[cfg(target_os = "linux")]
mod linux_xattr {
    use std::ffi::CString;
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    fn c_name(name: &str) -> io::Result<CString> {
        CString::new(name).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn check(ret: libc::ssize_t) -> io::Result<usize> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }

    pub fn get(file: &File, name: &str) -> io::Result<Vec<u8>> {
        let name = c_name(name)?;
        let fd = file.as_raw_fd();
        loop {
            // SAFETY: a null buffer of size 0 only queries the value length.
            let len = check(unsafe { libc::fgetxattr(fd, name.as_ptr(), std::ptr::null_mut(), 0) })?;
            let mut buf = vec![0u8; len];
            // SAFETY: buf is valid for writes of buf.len() bytes.
            let ret = unsafe { libc::fgetxattr(fd, name.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
            match check(ret) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                // Value grew between the two calls.
                Err(e) if e.raw_os_error() == Some(libc::ERANGE) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn set(file: &File, name: &str, value: &[u8]) -> io::Result<()> {
        let name = c_name(name)?;
        // SAFETY: value is valid for reads of value.len() bytes.
        let ret = unsafe {
            libc::fsetxattr(file.as_raw_fd(), name.as_ptr(), value.as_ptr().cast(), value.len(), 0)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn list(file: &File) -> io::Result<Vec<String>> {
        let fd = file.as_raw_fd();
        loop {
            // SAFETY: a null buffer of size 0 only queries the list length.
            let len = check(unsafe { libc::flistxattr(fd, std::ptr::null_mut(), 0) })?;
            let mut buf = vec![0u8; len];
            // SAFETY: buf is valid for writes of buf.len() bytes.
            let ret = unsafe { libc::flistxattr(fd, buf.as_mut_ptr().cast(), buf.len()) };
            match check(ret) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf
                        .split(|&b| b == 0)
                        .filter(|s| !s.is_empty())
                        .map(|s| String::from_utf8_lossy(s).into_owned())
                        .collect());
                }
                Err(e) if e.raw_os_error() == Some(libc::ERANGE) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn remove(file: &File, name: &str) -> io::Result<()> {
        let name = c_name(name)?;
        // SAFETY: name is a valid NUL-terminated string.
        let ret = unsafe { libc::fremovexattr(file.as_raw_fd(), name.as_ptr()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
