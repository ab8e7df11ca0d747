//! The seam between the protocol core and the graphics APIs.
//!
//! The cached reader is generic over one `TextureCopier` implementation,
//! chosen explicitly at consumer startup. Each backend owns its import
//! arena: a map from raw producer-side handle value to the imported
//! resource, filled on first use and emptied only by `release_ipc_handles`.
//! GPU resources need deterministic release ordering relative to fences, so
//! nothing in here is dropped implicitly while a session is live.

use std::any::Any;
use std::sync::Arc;

use crate::shm::geometry::PixelSize;

#[cfg(target_os = "windows")]
pub mod d3d11;
#[cfg(target_os = "windows")]
pub mod d3d12;
#[cfg(target_os = "windows")]
pub mod vulkan;

/// A shareable handle as its raw value in the producer process. Meaningless
/// in this process until duplicated.
pub type RawIpcHandle = u64;

/// Everything a backend needs to copy one published slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRequest {
    pub texture_handle: RawIpcHandle,
    pub fence_handle: RawIpcHandle,
    /// The fence value the producer signals when its writes to this slot
    /// are complete. The backend device-waits on it; it must never CPU-wait.
    pub fence_value_in: u64,
    pub feeder_process_id: u32,
}

/// A consumer-owned cache texture for one swapchain slot.
///
/// Downcast via `as_any` to the backend's concrete type to bind it into a
/// render pass.
pub trait IpcClientTexture: Send + Sync {
    fn dimensions(&self) -> PixelSize;
    fn swapchain_index(&self) -> u32;
    fn as_any(&self) -> &dyn Any;
}

/// One graphics-API backend.
pub trait TextureCopier: Send {
    /// LUID of the adapter this consumer renders on; compared against the
    /// producer's declared LUID before any import is attempted.
    fn gpu_luid(&self) -> u64;

    /// Create a cache texture for the given slot and dimensions.
    fn create_client_texture(
        &mut self,
        dimensions: PixelSize,
        swapchain_index: u32,
    ) -> anyhow::Result<Arc<dyn IpcClientTexture>>;

    /// Import (or reuse an already-imported) source texture and fence for
    /// `request`, device-wait on the producer's fence value, copy into
    /// `destination`, and signal this consumer's completion fence.
    fn copy(
        &mut self,
        request: &CopyRequest,
        destination: &dyn IpcClientTexture,
    ) -> anyhow::Result<()>;

    /// Wait (CPU-side, bounded) for every copy issued so far to complete.
    /// Must run before a cache texture that was a copy destination is
    /// dropped.
    fn wait_for_pending_copies(&mut self);

    /// Wait (CPU-side, bounded) for all in-flight copies, then close every
    /// imported handle and clear the arena. Must run on session change and
    /// on shutdown, strictly in that wait-then-close order.
    fn release_ipc_handles(&mut self);
}

/// Duplicate a raw handle out of the producer process into this one.
#[cfg(target_os = "windows")]
pub(crate) fn duplicate_ipc_handle(
    feeder_process_id: u32,
    handle: RawIpcHandle,
) -> anyhow::Result<windows::Win32::Foundation::HANDLE> {
    use anyhow::Context;
    use windows::Win32::Foundation::{
        CloseHandle, DUPLICATE_SAME_ACCESS, DuplicateHandle, HANDLE,
    };
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcess, PROCESS_DUP_HANDLE};

    anyhow::ensure!(handle != 0, "cannot duplicate a null handle");
    let feeder = unsafe { OpenProcess(PROCESS_DUP_HANDLE, false, feeder_process_id) }
        .with_context(|| format!("opening feeder process {feeder_process_id}"))?;
    let mut duplicated = HANDLE::default();
    let result = unsafe {
        DuplicateHandle(
            feeder,
            HANDLE(handle as *mut core::ffi::c_void),
            GetCurrentProcess(),
            &mut duplicated,
            0,
            false,
            DUPLICATE_SAME_ACCESS,
        )
    };
    unsafe {
        let _ = CloseHandle(feeder);
    }
    result.with_context(|| format!("duplicating handle {handle:#x} from {feeder_process_id}"))?;
    Ok(duplicated)
}
