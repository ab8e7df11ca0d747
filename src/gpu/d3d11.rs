//! Direct3D 11 consumer backend.
//!
//! The copy is three calls on the immediate context: device-wait on the
//! producer's fence value, `CopySubresourceRegion` into the cache texture,
//! signal the consumer's completion fence. The CPU never waits on the
//! producer; CPU-side fence waits happen only in `release_ipc_handles` and
//! on drop.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D11::{
    D3D11_BIND_RENDER_TARGET, D3D11_BIND_SHADER_RESOURCE, D3D11_FENCE_FLAG_NONE,
    D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT, ID3D11Device, ID3D11Device5,
    ID3D11DeviceContext4, ID3D11Fence, ID3D11ShaderResourceView, ID3D11Texture2D,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::IDXGIDevice;
use windows::Win32::System::Threading::{CreateEventW, INFINITE, WaitForSingleObject};
use windows::core::Interface;

use crate::config::SHARED_TEXTURE_DXGI_FORMAT;
use crate::gpu::{CopyRequest, IpcClientTexture, RawIpcHandle, TextureCopier, duplicate_ipc_handle};
use crate::shm::geometry::PixelSize;

/// A consumer-owned cache texture plus the view render passes bind.
pub struct Texture {
    dimensions: PixelSize,
    swapchain_index: u32,
    texture: ID3D11Texture2D,
    shader_resource_view: ID3D11ShaderResourceView,
}

// COM pointers on an immediate-context device; the exchange hands them
// across threads but uses them from one render thread at a time.
unsafe impl Send for Texture {}
unsafe impl Sync for Texture {}

impl Texture {
    pub fn d3d11_texture(&self) -> &ID3D11Texture2D {
        &self.texture
    }

    pub fn shader_resource_view(&self) -> &ID3D11ShaderResourceView {
        &self.shader_resource_view
    }
}

impl IpcClientTexture for Texture {
    fn dimensions(&self) -> PixelSize {
        self.dimensions
    }

    fn swapchain_index(&self) -> u32 {
        self.swapchain_index
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// An imported resource together with the duplicated handle it came from;
/// the handle is closed when the entry is evicted.
struct ImportedTexture {
    texture: ID3D11Texture2D,
    handle: HANDLE,
}

struct ImportedFence {
    fence: ID3D11Fence,
    handle: HANDLE,
    /// Last producer value we device-waited on; `release_ipc_handles` waits
    /// for it CPU-side before closing the handle.
    last_value: u64,
}

pub struct D3D11TextureCopier {
    device: ID3D11Device5,
    context: ID3D11DeviceContext4,
    gpu_luid: u64,
    copy_fence: ID3D11Fence,
    copy_fence_value: u64,
    ipc_textures: HashMap<RawIpcHandle, ImportedTexture>,
    ipc_fences: HashMap<RawIpcHandle, ImportedFence>,
}

unsafe impl Send for D3D11TextureCopier {}

impl D3D11TextureCopier {
    pub fn new(device: &ID3D11Device) -> anyhow::Result<Self> {
        let device5: ID3D11Device5 = device.cast().context("device lacks ID3D11Device5")?;
        let mut context = None;
        unsafe { device.GetImmediateContext(&mut context) };
        let context: ID3D11DeviceContext4 = context
            .context("device has no immediate context")?
            .cast()
            .context("context lacks ID3D11DeviceContext4")?;

        let dxgi: IDXGIDevice = device.cast()?;
        let adapter = unsafe { dxgi.GetAdapter() }?;
        let desc = unsafe { adapter.GetDesc() }?;
        let gpu_luid =
            ((desc.AdapterLuid.HighPart as u64) << 32) | desc.AdapterLuid.LowPart as u64;
        log::info!("D3D11 frame consumer on adapter LUID {gpu_luid:#018x}");

        let mut copy_fence = None;
        unsafe { device5.CreateFence(0, D3D11_FENCE_FLAG_NONE, &mut copy_fence) }
            .context("creating the copy completion fence")?;

        Ok(Self {
            device: device5,
            context,
            gpu_luid,
            copy_fence: copy_fence.context("fence creation returned nothing")?,
            copy_fence_value: 0,
            ipc_textures: HashMap::new(),
            ipc_fences: HashMap::new(),
        })
    }

    fn ipc_texture(
        &mut self,
        feeder_process_id: u32,
        handle: RawIpcHandle,
    ) -> anyhow::Result<ID3D11Texture2D> {
        if let Some(imported) = self.ipc_textures.get(&handle) {
            return Ok(imported.texture.clone());
        }
        let duplicated = duplicate_ipc_handle(feeder_process_id, handle)?;
        let mut texture: Option<ID3D11Texture2D> = None;
        if let Err(error) = unsafe { self.device.OpenSharedResource1(duplicated, &mut texture) } {
            unsafe {
                let _ = CloseHandle(duplicated);
            }
            return Err(error).context("opening the shared texture");
        }
        let texture = texture.context("shared texture open returned nothing")?;
        self.ipc_textures.insert(
            handle,
            ImportedTexture {
                texture: texture.clone(),
                handle: duplicated,
            },
        );
        Ok(texture)
    }

    fn ipc_fence(
        &mut self,
        feeder_process_id: u32,
        handle: RawIpcHandle,
    ) -> anyhow::Result<ID3D11Fence> {
        if let Some(imported) = self.ipc_fences.get(&handle) {
            return Ok(imported.fence.clone());
        }
        let duplicated = duplicate_ipc_handle(feeder_process_id, handle)?;
        let mut fence: Option<ID3D11Fence> = None;
        if let Err(error) = unsafe { self.device.OpenSharedFence(duplicated, &mut fence) } {
            unsafe {
                let _ = CloseHandle(duplicated);
            }
            return Err(error).context("opening the shared fence");
        }
        let fence = fence.context("shared fence open returned nothing")?;
        self.ipc_fences.insert(
            handle,
            ImportedFence {
                fence: fence.clone(),
                handle: duplicated,
                last_value: 0,
            },
        );
        Ok(fence)
    }

}

impl TextureCopier for D3D11TextureCopier {
    fn gpu_luid(&self) -> u64 {
        self.gpu_luid
    }

    fn create_client_texture(
        &mut self,
        dimensions: PixelSize,
        swapchain_index: u32,
    ) -> anyhow::Result<Arc<dyn IpcClientTexture>> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: dimensions.width,
            Height: dimensions.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT(SHARED_TEXTURE_DXGI_FORMAT as i32),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_SHADER_RESOURCE | D3D11_BIND_RENDER_TARGET).0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut texture)) }
            .context("creating the cache texture")?;
        let texture = texture.context("cache texture creation returned nothing")?;

        let mut view: Option<ID3D11ShaderResourceView> = None;
        unsafe {
            self.device
                .CreateShaderResourceView(&texture, None, Some(&mut view))
        }
        .context("creating the cache texture view")?;

        Ok(Arc::new(Texture {
            dimensions,
            swapchain_index,
            texture,
            shader_resource_view: view.context("view creation returned nothing")?,
        }))
    }

    fn copy(
        &mut self,
        request: &CopyRequest,
        destination: &dyn IpcClientTexture,
    ) -> anyhow::Result<()> {
        let destination = destination
            .as_any()
            .downcast_ref::<Texture>()
            .context("destination texture is not a D3D11 texture")?;

        let source = self.ipc_texture(request.feeder_process_id, request.texture_handle)?;
        let fence_in = self.ipc_fence(request.feeder_process_id, request.fence_handle)?;

        unsafe {
            self.context
                .Wait(&fence_in, request.fence_value_in)
                .context("queueing the wait on the producer fence")?;
            self.context.CopySubresourceRegion(
                &destination.texture,
                0,
                0,
                0,
                0,
                &source,
                0,
                None,
            );
            self.copy_fence_value += 1;
            self.context
                .Signal(&self.copy_fence, self.copy_fence_value)
                .context("signaling the copy completion fence")?;
        }
        if let Some(imported) = self.ipc_fences.get_mut(&request.fence_handle) {
            imported.last_value = request.fence_value_in;
        }
        Ok(())
    }

    fn wait_for_pending_copies(&mut self) {
        if self.copy_fence_value == 0 {
            return;
        }
        if let Err(error) = wait_for_fence_value(&self.copy_fence, self.copy_fence_value) {
            log::warn!("waiting for pending copies failed: {error:#}");
        }
    }

    fn release_ipc_handles(&mut self) {
        self.wait_for_pending_copies();
        for imported in self.ipc_fences.values() {
            if imported.last_value != 0 {
                if let Err(error) = wait_for_fence_value(&imported.fence, imported.last_value) {
                    log::warn!("waiting for an imported fence failed: {error:#}");
                }
            }
        }
        for imported in self.ipc_fences.drain().map(|(_, imported)| imported) {
            unsafe {
                let _ = CloseHandle(imported.handle);
            }
        }
        for imported in self.ipc_textures.drain().map(|(_, imported)| imported) {
            unsafe {
                let _ = CloseHandle(imported.handle);
            }
        }
    }
}

impl Drop for D3D11TextureCopier {
    fn drop(&mut self) {
        self.release_ipc_handles();
    }
}

fn wait_for_fence_value(fence: &ID3D11Fence, value: u64) -> anyhow::Result<()> {
    if unsafe { fence.GetCompletedValue() } >= value {
        return Ok(());
    }
    let event = unsafe { CreateEventW(None, false, false, None) }?;
    let result = unsafe {
        fence.SetEventOnCompletion(value, event)?;
        WaitForSingleObject(event, INFINITE)
    };
    unsafe {
        let _ = CloseHandle(event);
    }
    anyhow::ensure!(result == WAIT_OBJECT_0, "fence wait ended with {result:?}");
    Ok(())
}
