//! Last-seen timestamps per consumer kind, in a second tiny segment.
//!
//! Consumers stamp their kind on every poll; the producer reads the stamps
//! to decide things like "is any OpenXR bridge alive, so the SteamVR path
//! should stay quiet". Each stamp is one independent atomic, so no lock or
//! seqlock is involved.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::shm::metadata::ConsumerKind;

/// Milliseconds since the Unix epoch; zero means "never seen".
#[repr(C)]
#[derive(Default)]
struct ConsumerTimestamps {
    steam_vr: AtomicU64,
    openxr_d3d11: AtomicU64,
    openxr_d3d12: AtomicU64,
    openxr_vulkan: AtomicU64,
    viewer: AtomicU64,
}

impl ConsumerTimestamps {
    fn slot(&self, kind: ConsumerKind) -> &AtomicU64 {
        match kind {
            ConsumerKind::SteamVr => &self.steam_vr,
            ConsumerKind::OpenXrD3D11 => &self.openxr_d3d11,
            ConsumerKind::OpenXrD3D12 => &self.openxr_d3d12,
            ConsumerKind::OpenXrVulkan => &self.openxr_vulkan,
            ConsumerKind::Viewer => &self.viewer,
        }
    }

    fn clear(&self) {
        for kind in ConsumerKind::ALL {
            self.slot(kind).store(0, Ordering::Relaxed);
        }
    }
}

pub enum ActiveConsumers {
    Memory(Arc<ConsumerTimestampsHolder>),
    #[cfg(target_os = "windows")]
    Named(NamedTimestamps),
}

pub struct ConsumerTimestampsHolder {
    stamps: ConsumerTimestamps,
}

#[cfg(target_os = "windows")]
pub struct NamedTimestamps {
    view: windows::Win32::System::Memory::MEMORY_MAPPED_VIEW_ADDRESS,
    mapping: windows::Win32::Foundation::HANDLE,
}

#[cfg(target_os = "windows")]
unsafe impl Send for NamedTimestamps {}
#[cfg(target_os = "windows")]
unsafe impl Sync for NamedTimestamps {}

#[cfg(target_os = "windows")]
impl Drop for NamedTimestamps {
    fn drop(&mut self) {
        unsafe {
            let _ = windows::Win32::System::Memory::UnmapViewOfFile(self.view);
            let _ = windows::Win32::Foundation::CloseHandle(self.mapping);
        }
    }
}

impl ActiveConsumers {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(ConsumerTimestampsHolder {
            stamps: ConsumerTimestamps::default(),
        }))
    }

    /// Create-or-open the named timestamps mapping.
    #[cfg(target_os = "windows")]
    pub fn named() -> anyhow::Result<Self> {
        use anyhow::Context;
        use windows::Win32::Foundation::INVALID_HANDLE_VALUE;
        use windows::Win32::System::Memory::{
            CreateFileMappingW, FILE_MAP_ALL_ACCESS, MapViewOfFile, PAGE_READWRITE,
        };
        use windows::core::PCWSTR;

        let size = std::mem::size_of::<ConsumerTimestamps>();
        let name = widestring::U16CString::from_str(crate::config::consumers_path())?;
        let mapping = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                0,
                size as u32,
                PCWSTR(name.as_ptr()),
            )
        }
        .context("creating the consumer-timestamps mapping")?;
        let view = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            unsafe {
                let _ = windows::Win32::Foundation::CloseHandle(mapping);
            }
            anyhow::bail!("mapping the consumer-timestamps view failed");
        }
        Ok(Self::Named(NamedTimestamps { view, mapping }))
    }

    fn stamps(&self) -> &ConsumerTimestamps {
        match self {
            Self::Memory(holder) => &holder.stamps,
            #[cfg(target_os = "windows")]
            Self::Named(named) => unsafe { &*(named.view.Value as *const ConsumerTimestamps) },
        }
    }

    /// Record that a consumer of `kind` polled just now.
    pub fn touch(&self, kind: ConsumerKind) {
        self.stamps().slot(kind).store(now_millis(), Ordering::Relaxed);
    }

    /// When a consumer of `kind` last polled, if ever.
    pub fn last_seen(&self, kind: ConsumerKind) -> Option<SystemTime> {
        match self.stamps().slot(kind).load(Ordering::Relaxed) {
            0 => None,
            millis => Some(UNIX_EPOCH + Duration::from_millis(millis)),
        }
    }

    /// True if a consumer of `kind` polled within `window`.
    pub fn seen_within(&self, kind: ConsumerKind, window: Duration) -> bool {
        self.last_seen(kind)
            .and_then(|seen| SystemTime::now().duration_since(seen).ok())
            .map(|age| age <= window)
            .unwrap_or(false)
    }

    /// True if any OpenXR bridge polled within `window`; the SteamVR path
    /// defers to OpenXR when both are injected into the same title.
    pub fn openxr_seen_within(&self, window: Duration) -> bool {
        [
            ConsumerKind::OpenXrD3D11,
            ConsumerKind::OpenXrD3D12,
            ConsumerKind::OpenXrVulkan,
        ]
        .into_iter()
        .any(|kind| self.seen_within(kind, window))
    }

    pub fn clear(&self) {
        self.stamps().clear();
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untouched_kinds_are_unseen() {
        let consumers = ActiveConsumers::memory();
        for kind in ConsumerKind::ALL {
            assert!(consumers.last_seen(kind).is_none());
        }
    }

    #[test]
    fn test_touch_is_per_kind() {
        let consumers = ActiveConsumers::memory();
        consumers.touch(ConsumerKind::Viewer);
        assert!(consumers.seen_within(ConsumerKind::Viewer, Duration::from_secs(5)));
        assert!(!consumers.seen_within(ConsumerKind::SteamVr, Duration::from_secs(5)));
        assert!(!consumers.openxr_seen_within(Duration::from_secs(5)));

        consumers.touch(ConsumerKind::OpenXrVulkan);
        assert!(consumers.openxr_seen_within(Duration::from_secs(5)));

        consumers.clear();
        assert!(consumers.last_seen(ConsumerKind::Viewer).is_none());
    }
}
