//! The shared segment: where the one `FrameMetadata` record actually lives.
//!
//! Two flavors behind one enum. `Memory` keeps the record in-process behind
//! an `Arc`, which is what the tests and any single-process pipeline use.
//! `Named` maps the OS-level named file mapping and pairs it with the named
//! mutex, for the real cross-process exchange on Windows.
//!
//! Torn reads are prevented by a seqlock: a generation counter leads the
//! record, the writer makes it odd before mutating and even (+2) after, and
//! readers copy the record out between two matching even loads. Readers never
//! take the mutex.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::shm::metadata::FrameMetadata;

/// The segment's in-memory layout: generation word first, record after.
#[repr(C)]
pub(crate) struct SharedRecord {
    generation: AtomicU64,
    body: UnsafeCell<FrameMetadata>,
}

// Readers copy `body` out volatilely and validate with the generation; the
// single writer mutates only while holding the segment lock.
unsafe impl Sync for SharedRecord {}

impl SharedRecord {
    fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            body: UnsafeCell::new(FrameMetadata::default()),
        }
    }

    /// One seqlock read attempt. `None` means the writer was mid-update, or
    /// raced us between the two generation loads; callers retry a bounded
    /// number of times.
    fn try_read(&self) -> Option<FrameMetadata> {
        let before = self.generation.load(Ordering::Acquire);
        if before & 1 != 0 {
            return None;
        }
        let copy = unsafe { std::ptr::read_volatile(self.body.get()) };
        std::sync::atomic::fence(Ordering::Acquire);
        if self.generation.load(Ordering::Acquire) == before {
            Some(copy)
        } else {
            None
        }
    }

    /// Mutate the record under the seqlock. The caller must hold the segment
    /// lock; this is what makes "single writer" true.
    fn write_with(&self, f: impl FnOnce(&mut FrameMetadata)) {
        let before = self.generation.load(Ordering::Relaxed);
        self.generation
            .store(before.wrapping_add(1), Ordering::SeqCst);
        unsafe { f(&mut *self.body.get()) };
        self.generation
            .store(before.wrapping_add(2), Ordering::SeqCst);
    }

    /// Zero the record after a writer died holding the lock. The generation
    /// may have been left odd mid-write, so this forces it odd, clears the
    /// body, and lands on an even value readers accept again.
    fn reset(&self) {
        let mid_write = self.generation.load(Ordering::Relaxed) | 1;
        self.generation.store(mid_write, Ordering::SeqCst);
        unsafe { *self.body.get() = FrameMetadata::default() };
        self.generation
            .store(mid_write.wrapping_add(1), Ordering::SeqCst);
    }
}

/// Portable in-process segment. Clones share the same record, so a writer
/// and any number of readers built from clones behave like separate
/// processes attached to the same mapping.
#[derive(Clone)]
pub struct MemorySegment {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    locked: AtomicBool,
    record: SharedRecord,
}

impl MemorySegment {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                locked: AtomicBool::new(false),
                record: SharedRecord::new(),
            }),
        }
    }
}

impl Default for MemorySegment {
    fn default() -> Self {
        Self::new()
    }
}

/// A mapped named segment plus its named mutex.
#[cfg(target_os = "windows")]
pub struct NamedSegment {
    view: windows::Win32::System::Memory::MEMORY_MAPPED_VIEW_ADDRESS,
    mapping: windows::Win32::Foundation::HANDLE,
    mutex: windows::Win32::Foundation::HANDLE,
}

#[cfg(target_os = "windows")]
// Access to the view is serialized by the seqlock and the named mutex.
unsafe impl Send for NamedSegment {}
#[cfg(target_os = "windows")]
unsafe impl Sync for NamedSegment {}

#[cfg(target_os = "windows")]
impl NamedSegment {
    /// Create-or-open the version-scoped mapping and mutex. The first
    /// attacher creates them; the kernel hands everyone else the same
    /// objects because the names match.
    pub fn open() -> anyhow::Result<Self> {
        use anyhow::Context;
        use windows::Win32::Foundation::INVALID_HANDLE_VALUE;
        use windows::Win32::System::Memory::{
            CreateFileMappingW, FILE_MAP_ALL_ACCESS, MapViewOfFile, PAGE_READWRITE,
        };
        use windows::Win32::System::Threading::CreateMutexW;
        use windows::core::PCWSTR;

        let size = std::mem::size_of::<SharedRecord>();
        let shm_name = widestring::U16CString::from_str(crate::config::shm_path())?;
        let mutex_name = widestring::U16CString::from_str(crate::config::mutex_path())?;

        let mapping = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                0,
                size as u32,
                PCWSTR(shm_name.as_ptr()),
            )
        }
        .context("creating shared memory mapping")?;

        let view = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            unsafe {
                let _ = windows::Win32::Foundation::CloseHandle(mapping);
            }
            anyhow::bail!("mapping a view of the shared segment failed");
        }

        let mutex = unsafe { CreateMutexW(None, false, PCWSTR(mutex_name.as_ptr())) }
            .context("creating shared memory mutex")?;

        Ok(Self {
            view,
            mapping,
            mutex,
        })
    }

    fn record(&self) -> &SharedRecord {
        // The mapping is zero-initialized by the kernel and at least
        // size_of::<SharedRecord>() bytes; an all-zero record reads as
        // "no feeder" because the magic is absent.
        unsafe { &*(self.view.Value as *const SharedRecord) }
    }
}

#[cfg(target_os = "windows")]
impl Drop for NamedSegment {
    fn drop(&mut self) {
        use windows::Win32::Foundation::CloseHandle;
        use windows::Win32::System::Memory::UnmapViewOfFile;
        unsafe {
            let _ = UnmapViewOfFile(self.view);
            let _ = CloseHandle(self.mapping);
            let _ = CloseHandle(self.mutex);
        }
    }
}

/// One attached shared segment, either flavor.
pub enum Segment {
    Memory(MemorySegment),
    #[cfg(target_os = "windows")]
    Named(NamedSegment),
}

impl Segment {
    /// Attach to the real OS-named segment.
    #[cfg(target_os = "windows")]
    pub fn named() -> anyhow::Result<Self> {
        Ok(Self::Named(NamedSegment::open()?))
    }

    /// A fresh in-process segment; clone it to hand to readers.
    pub fn memory() -> Self {
        Self::Memory(MemorySegment::new())
    }

    fn record(&self) -> &SharedRecord {
        match self {
            Self::Memory(m) => &m.inner.record,
            #[cfg(target_os = "windows")]
            Self::Named(n) => n.record(),
        }
    }

    /// One seqlock read attempt; see `SharedRecord::try_read`.
    pub fn try_read(&self) -> Option<FrameMetadata> {
        self.record().try_read()
    }

    /// Mutate the record. The caller must hold the lock.
    pub fn write_with(&self, f: impl FnOnce(&mut FrameMetadata)) {
        self.record().write_with(f);
    }

    /// Block until the writer lock is held.
    ///
    /// On Windows, `WAIT_ABANDONED` means a previous writer died while
    /// holding the mutex; the record is zeroed so stale handles cannot
    /// outlive their process, and the lock is held as usual.
    pub fn lock(&self) -> anyhow::Result<()> {
        match self {
            Self::Memory(m) => {
                while m
                    .inner
                    .locked
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    std::thread::yield_now();
                }
                Ok(())
            }
            #[cfg(target_os = "windows")]
            Self::Named(n) => {
                use windows::Win32::Foundation::{WAIT_ABANDONED, WAIT_OBJECT_0};
                use windows::Win32::System::Threading::{INFINITE, WaitForSingleObject};
                let result = unsafe { WaitForSingleObject(n.mutex, INFINITE) };
                match result {
                    WAIT_OBJECT_0 => Ok(()),
                    WAIT_ABANDONED => {
                        log::warn!("previous writer died holding the lock; clearing the record");
                        n.record().reset();
                        Ok(())
                    }
                    other => anyhow::bail!("waiting for the segment mutex failed: {:?}", other),
                }
            }
        }
    }

    /// Non-blocking variant of `lock`; `Ok(false)` means someone else holds
    /// it.
    pub fn try_lock(&self) -> anyhow::Result<bool> {
        match self {
            Self::Memory(m) => Ok(m
                .inner
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()),
            #[cfg(target_os = "windows")]
            Self::Named(n) => {
                use windows::Win32::Foundation::{WAIT_ABANDONED, WAIT_OBJECT_0, WAIT_TIMEOUT};
                use windows::Win32::System::Threading::WaitForSingleObject;
                let result = unsafe { WaitForSingleObject(n.mutex, 0) };
                match result {
                    WAIT_OBJECT_0 => Ok(true),
                    WAIT_ABANDONED => {
                        log::warn!("previous writer died holding the lock; clearing the record");
                        n.record().reset();
                        Ok(true)
                    }
                    WAIT_TIMEOUT => Ok(false),
                    other => anyhow::bail!("polling the segment mutex failed: {:?}", other),
                }
            }
        }
    }

    /// Release the lock taken by `lock`/`try_lock`.
    pub fn unlock(&self) {
        match self {
            Self::Memory(m) => m.inner.locked.store(false, Ordering::Release),
            #[cfg(target_os = "windows")]
            Self::Named(n) => unsafe {
                let _ = windows::Win32::System::Threading::ReleaseMutex(n.mutex);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_segment_reads_as_empty() {
        let segment = Segment::memory();
        let meta = segment.try_read().expect("no writer, read must succeed");
        assert!(!meta.have_feeder());
    }

    #[test]
    fn test_write_is_visible_through_clone() {
        let shared = MemorySegment::new();
        let writer = Segment::Memory(shared.clone());
        let reader = Segment::Memory(shared);

        writer.lock().unwrap();
        writer.write_with(|meta| meta.frame_number = 7);
        writer.unlock();

        let meta = reader.try_read().expect("writer is idle");
        assert_eq!(meta.frame_number, 7);
    }

    #[test]
    fn test_try_lock_reports_contention() {
        let shared = MemorySegment::new();
        let a = Segment::Memory(shared.clone());
        let b = Segment::Memory(shared);

        assert!(a.try_lock().unwrap());
        assert!(!b.try_lock().unwrap());
        a.unlock();
        assert!(b.try_lock().unwrap());
        b.unlock();
    }

    #[test]
    fn test_torn_reads_are_rejected_under_concurrent_writes() {
        let shared = MemorySegment::new();
        let writer = Segment::Memory(shared.clone());
        let reader = Segment::Memory(shared);

        let stop = Arc::new(AtomicBool::new(false));
        let writer_stop = stop.clone();
        let handle = std::thread::spawn(move || {
            let mut n = 0u64;
            while !writer_stop.load(Ordering::Relaxed) {
                n += 1;
                writer.lock().unwrap();
                writer.write_with(|meta| {
                    meta.frame_number = n;
                    meta.session_id = n;
                });
                writer.unlock();
            }
        });

        // Every successful read must be internally consistent.
        for _ in 0..10_000 {
            if let Some(meta) = reader.try_read() {
                assert_eq!(meta.frame_number, meta.session_id);
            }
        }
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
