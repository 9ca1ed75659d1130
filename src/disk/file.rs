//! The file handle primitive the storage layer does its IO through.
//!
//! A [`FileHandle`] is opened with an explicit mode bit-set and offers
//! positioned reads and writes that never move a shared file cursor, so one
//! handle can serve many worker threads at once. A region of the file can
//! additionally be memory mapped for read or read-write access; the mapping
//! is released when dropped.

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use memmap2::{Mmap, MmapMut, MmapOptions};
use nix::fcntl::PosixFadviseAdvice;

/// The open-mode bits of a file handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenMode(u16);

impl OpenMode {
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(1 << 1);
    pub const TRUNCATE: Self = Self(1 << 2);
    /// Bypass the page cache where the platform allows it.
    pub const NO_CACHE: Self = Self(1 << 3);
    /// Don't update the access time on reads. Falls back silently when the
    /// kernel refuses it for non-owned files.
    pub const NO_ATIME: Self = Self(1 << 4);
    /// Advise the kernel that access will be sequential.
    pub const SEQUENTIAL: Self = Self(1 << 5);
    /// Advise the kernel that access will be random.
    pub const RANDOM_ACCESS: Self = Self(1 << 6);
    /// Create the file hidden. Only meaningful on platforms with a hidden
    /// attribute; a no-op here.
    pub const HIDDEN: Self = Self(1 << 7);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpenMode {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for OpenMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// An open file plus the mode it was opened with.
#[derive(Debug)]
pub struct FileHandle {
    file: File,
    mode: OpenMode,
    /// Set whenever bytes are written through this handle; cleared by
    /// [`flush`](Self::flush).
    dirty: AtomicBool,
}

impl FileHandle {
    /// Opens a file with the given mode bits.
    ///
    /// When `WRITE` is set and the parent directory is missing, the parent
    /// chain is created and the open retried once.
    pub fn open(path: &Path, mode: OpenMode) -> io::Result<Self> {
        match Self::open_impl(path, mode) {
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    && mode.contains(OpenMode::WRITE) =>
            {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Self::open_impl(path, mode)
            }
            other => other,
        }
    }

    fn open_impl(path: &Path, mode: OpenMode) -> io::Result<Self> {
        #[allow(unused_mut)]
        let mut flags = 0;
        #[cfg(target_os = "linux")]
        {
            if mode.contains(OpenMode::NO_CACHE) {
                flags |= libc::O_DIRECT;
            }
            if mode.contains(OpenMode::NO_ATIME) {
                flags |= libc::O_NOATIME;
            }
        }

        let mut options = OpenOptions::new();
        options
            .read(true)
            .write(mode.contains(OpenMode::WRITE))
            .create(mode.contains(OpenMode::WRITE))
            .truncate(mode.contains(OpenMode::TRUNCATE))
            .custom_flags(flags);

        let file = match options.open(path) {
            Ok(file) => file,
            // O_NOATIME is only allowed for the file's owner
            #[cfg(target_os = "linux")]
            Err(e)
                if mode.contains(OpenMode::NO_ATIME)
                    && e.raw_os_error() == Some(libc::EPERM) =>
            {
                options
                    .custom_flags(flags & !libc::O_NOATIME)
                    .open(path)?
            }
            Err(e) => return Err(e),
        };

        let advice = if mode.contains(OpenMode::SEQUENTIAL) {
            Some(PosixFadviseAdvice::POSIX_FADV_SEQUENTIAL)
        } else if mode.contains(OpenMode::RANDOM_ACCESS) {
            Some(PosixFadviseAdvice::POSIX_FADV_RANDOM)
        } else {
            None
        };
        if let Some(advice) = advice {
            // purely advisory; not worth failing the open over
            let _ = nix::fcntl::posix_fadvise(file.as_raw_fd(), 0, 0, advice);
        }

        Ok(Self { file, mode, dirty: AtomicBool::new(false) })
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn size(&self) -> io::Result<u64> {
        self.file.metadata().map(|m| m.len())
    }

    /// Reads into `buf` at the absolute file offset, retrying partial reads.
    /// Returns the number of bytes read, which is only smaller than the
    /// buffer when the end of the file is reached.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            match nix::sys::uio::pread(
                self.file.as_raw_fd(),
                &mut buf[read..],
                (offset + read as u64) as i64,
            )
            .map_err(nix_to_io)?
            {
                0 => break,
                n => read += n,
            }
        }
        Ok(read)
    }

    /// Writes all of `buf` at the absolute file offset, retrying partial
    /// writes.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match nix::sys::uio::pwrite(
                self.file.as_raw_fd(),
                &buf[written..],
                (offset + written as u64) as i64,
            )
            .map_err(nix_to_io)?
            {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "file refused further bytes",
                    ))
                }
                n => written += n,
            }
        }
        self.dirty.store(true, Ordering::Relaxed);
        Ok(written)
    }

    /// Preallocates the file up to `size` bytes.
    pub fn allocate(&self, size: u64) -> io::Result<()> {
        nix::fcntl::posix_fallocate(self.file.as_raw_fd(), 0, size as i64)
            .map_err(nix_to_io)
    }

    /// Flushes written data to disk if any write went through this handle
    /// since the last flush.
    pub fn flush(&self) -> io::Result<()> {
        if self.dirty.swap(false, Ordering::Relaxed) {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Maps up to `size` bytes of the file for reading. The mapping covers
    /// `min(file size, size)` bytes; a zero-sized region yields an empty
    /// mapping.
    pub fn map(&self, size: u64) -> io::Result<FileMapping> {
        let len = self.size()?.min(size);
        if len == 0 {
            return Ok(FileMapping { map: None });
        }
        let map = unsafe { MmapOptions::new().len(len as usize).map(&self.file) }?;
        // keep bulk file data out of core dumps; the advice is best-effort
        #[cfg(target_os = "linux")]
        let _ = map.advise(memmap2::Advice::DontDump);
        Ok(FileMapping { map: Some(map) })
    }

    /// Maps `size` bytes of the file for reading and writing, growing the
    /// file first if it is shorter.
    pub fn map_mut(&self, size: u64) -> io::Result<FileMappingMut> {
        if size == 0 {
            return Ok(FileMappingMut { map: None });
        }
        if self.size()? < size {
            self.file.set_len(size)?;
        }
        let map =
            unsafe { MmapOptions::new().len(size as usize).map_mut(&self.file) }?;
        #[cfg(target_os = "linux")]
        let _ = map.advise(memmap2::Advice::DontDump);
        self.dirty.store(true, Ordering::Relaxed);
        Ok(FileMappingMut { map: Some(map) })
    }
}

/// A read-only mapped region of a file, unmapped on drop.
#[derive(Debug)]
pub struct FileMapping {
    map: Option<Mmap>,
}

impl FileMapping {
    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A read-write mapped region of a file, unmapped on drop.
#[derive(Debug)]
pub struct FileMappingMut {
    map: Option<MmapMut>,
}

impl FileMappingMut {
    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.map {
            Some(m) => &mut m[..],
            None => &mut [],
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        match &self.map {
            Some(m) => m.flush(),
            None => Ok(()),
        }
    }
}

pub(crate) fn nix_to_io(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_at() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let handle = FileHandle::open(
            &path,
            OpenMode::READ | OpenMode::WRITE,
        )
        .unwrap();

        handle.write_at(b"hello world", 5).unwrap();
        let mut buf = [0; 5];
        let n = handle.read_at(&mut buf, 11).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"world");

        // reading at the tail yields a short read, not an error
        let mut buf = [0; 10];
        let n = handle.read_at(&mut buf, 11).unwrap();
        assert_eq!(n, 5);
    }

    #[test]
    fn test_open_creates_missing_parents_in_write_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c/file");
        let handle = FileHandle::open(
            &path,
            OpenMode::READ | OpenMode::WRITE,
        )
        .unwrap();
        handle.write_at(b"x", 0).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_open_read_only_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope");
        let err = FileHandle::open(&path, OpenMode::READ).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapped");
        let handle = FileHandle::open(
            &path,
            OpenMode::READ | OpenMode::WRITE,
        )
        .unwrap();
        handle.write_at(&[7; 1000], 0).unwrap();

        // a read mapping is clamped to the file size
        let map = handle.map(4096).unwrap();
        assert_eq!(map.len(), 1000);
        assert_eq!(map.as_slice()[999], 7);

        // a write mapping extends the file
        let mut map = handle.map_mut(2000).unwrap();
        map.as_mut_slice()[1999] = 9;
        map.flush().unwrap();
        drop(map);
        assert_eq!(handle.size().unwrap(), 2000);

        // zero-sized region maps to "no mapping"
        let empty = FileHandle::open(
            &dir.path().join("empty"),
            OpenMode::READ | OpenMode::WRITE,
        )
        .unwrap();
        assert!(empty.map(4096).unwrap().is_empty());
    }

    #[test]
    fn test_flush_tracks_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let handle = FileHandle::open(
            &dir.path().join("f"),
            OpenMode::READ | OpenMode::WRITE,
        )
        .unwrap();
        assert!(!handle.dirty.load(Ordering::Relaxed));
        handle.write_at(b"data", 0).unwrap();
        assert!(handle.dirty.load(Ordering::Relaxed));
        handle.flush().unwrap();
        assert!(!handle.dirty.load(Ordering::Relaxed));
    }
}
