//! Word storage behind a filter: process-owned heap words, or a shared
//! mapping of a backing file.

use libc::{madvise, mmap, msync, munmap, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;

use crate::error::{CqfError, Result};

const WORD_BYTES: usize = std::mem::size_of::<u64>();

pub trait Storage: Send + Sync {
    fn words(&self) -> &[AtomicU64];

    /// Backing file, if the words live in a mapping.
    fn path(&self) -> Option<&Path>;

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn advise_sequential(&self) {}

    fn advise_random(&self) {}

    fn len_bytes(&self) -> usize {
        self.words().len() * WORD_BYTES
    }
}

pub struct HeapStorage {
    words: Box<[AtomicU64]>,
}

impl HeapStorage {
    pub fn new(len: usize) -> Self {
        let words = (0..len).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }

    pub fn from_words(words: Vec<u64>) -> Self {
        Self {
            words: words.into_iter().map(AtomicU64::new).collect(),
        }
    }
}

impl Storage for HeapStorage {
    fn words(&self) -> &[AtomicU64] {
        &self.words
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}

/// A `MAP_SHARED` mapping of a whole file, viewed as words.
pub struct MmapStorage {
    ptr: NonNull<AtomicU64>,
    len: usize,
    path: PathBuf,
}

// The mapping is only ever accessed through atomics.
unsafe impl Send for MmapStorage {}
unsafe impl Sync for MmapStorage {}

impl MmapStorage {
    /// Creates a zero-filled file of `len` words and maps it. Fails if the
    /// file already exists.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(CqfError::InvalidArguments("cannot map an empty file".into()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len((len * WORD_BYTES) as u64)?;
        let ptr = Self::map(&file, len)?;
        Ok(Self {
            ptr,
            len,
            path: path.to_path_buf(),
        })
    }

    /// Maps an existing file. Its length must be a whole number of words.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(io::Error::from(io::ErrorKind::NotFound).into());
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let bytes = file.metadata()?.len() as usize;
        if bytes == 0 || bytes % WORD_BYTES != 0 {
            return Err(CqfError::MalformedPersisted(format!(
                "{} is not a whole number of words ({bytes} bytes)",
                path.display()
            )));
        }
        let len = bytes / WORD_BYTES;
        let ptr = Self::map(&file, len)?;
        Ok(Self {
            ptr,
            len,
            path: path.to_path_buf(),
        })
    }

    fn map(file: &std::fs::File, len: usize) -> Result<NonNull<AtomicU64>> {
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len * WORD_BYTES,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(CqfError::Mmap(io::Error::last_os_error()));
        }
        NonNull::new(ptr as *mut AtomicU64)
            .ok_or_else(|| CqfError::Mmap(io::Error::from(io::ErrorKind::OutOfMemory)))
    }
}

impl Storage for MmapStorage {
    fn words(&self) -> &[AtomicU64] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn sync(&self) -> io::Result<()> {
        let rc = unsafe {
            msync(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.len * WORD_BYTES,
                libc::MS_SYNC,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn advise_sequential(&self) {
        unsafe {
            madvise(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.len * WORD_BYTES,
                libc::MADV_SEQUENTIAL,
            )
        };
    }

    fn advise_random(&self) {
        unsafe {
            madvise(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.len * WORD_BYTES,
                libc::MADV_RANDOM,
            )
        };
    }
}

impl Drop for MmapStorage {
    fn drop(&mut self) {
        unsafe {
            munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len * WORD_BYTES);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn heap_words_start_zeroed() {
        let storage = HeapStorage::new(10);
        assert_eq!(storage.words().len(), 10);
        assert!(storage.words().iter().all(|w| w.load(Ordering::Relaxed) == 0));
        assert_eq!(storage.len_bytes(), 80);
        assert!(storage.path().is_none());
    }

    #[test]
    fn mapped_words_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words.bin");
        {
            let storage = MmapStorage::create(&path, 16).unwrap();
            for (i, word) in storage.words().iter().enumerate() {
                word.store(i as u64 * 3, Ordering::Relaxed);
            }
            storage.sync().unwrap();
        }
        let storage = MmapStorage::open(&path).unwrap();
        assert_eq!(storage.words().len(), 16);
        for (i, word) in storage.words().iter().enumerate() {
            assert_eq!(word.load(Ordering::Relaxed), i as u64 * 3);
        }
        assert_eq!(storage.path(), Some(path.as_path()));
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words.bin");
        let _first = MmapStorage::create(&path, 4).unwrap();
        match MmapStorage::create(&path, 4) {
            Err(CqfError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::AlreadyExists),
            _ => panic!("expected AlreadyExists"),
        }
    }

    #[test]
    fn open_rejects_ragged_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.bin");
        std::fs::write(&path, [0u8; 13]).unwrap();
        assert!(matches!(
            MmapStorage::open(&path),
            Err(CqfError::MalformedPersisted(_))
        ));
        match MmapStorage::open(&dir.path().join("missing")) {
            Err(CqfError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::NotFound),
            _ => panic!("expected NotFound"),
        }
    }
}
