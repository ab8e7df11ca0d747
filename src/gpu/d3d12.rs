//! Direct3D 12 consumer backend.
//!
//! Same contract as the D3D11 backend, but the wait/copy/signal chain goes
//! through a command queue: `queue.Wait` on the imported producer fence,
//! execute a recorded copy list, `queue.Signal` the consumer's completion
//! fence. Each swapchain slot gets its own command allocator so a slot's
//! commands are only reset once that slot's previous copy has retired.

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use anyhow::Context;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D12::{
    D3D12_CLEAR_VALUE, D3D12_COMMAND_LIST_TYPE_DIRECT, D3D12_CPU_DESCRIPTOR_HANDLE,
    D3D12_DESCRIPTOR_HEAP_DESC, D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
    D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV, D3D12_FENCE_FLAG_NONE, D3D12_GPU_DESCRIPTOR_HANDLE,
    D3D12_HEAP_FLAG_NONE, D3D12_HEAP_PROPERTIES, D3D12_HEAP_TYPE_DEFAULT,
    D3D12_RESOURCE_BARRIER, D3D12_RESOURCE_BARRIER_0, D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
    D3D12_RESOURCE_BARRIER_FLAG_NONE, D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
    D3D12_RESOURCE_DESC, D3D12_RESOURCE_DIMENSION_TEXTURE2D,
    D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET, D3D12_RESOURCE_STATE_COMMON,
    D3D12_RESOURCE_STATE_COPY_DEST, D3D12_RESOURCE_STATE_COPY_SOURCE, D3D12_RESOURCE_STATES,
    D3D12_RESOURCE_TRANSITION_BARRIER, D3D12_TEXTURE_LAYOUT_UNKNOWN, ID3D12CommandAllocator,
    ID3D12CommandQueue, ID3D12DescriptorHeap, ID3D12Device, ID3D12Fence,
    ID3D12GraphicsCommandList, ID3D12Resource,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC};
use windows::Win32::System::Threading::{CreateEventW, INFINITE, WaitForSingleObject};
use windows::core::Interface;

use crate::config::{SHARED_TEXTURE_DXGI_FORMAT, SWAPCHAIN_LENGTH};
use crate::gpu::{CopyRequest, IpcClientTexture, RawIpcHandle, TextureCopier, duplicate_ipc_handle};
use crate::shm::geometry::PixelSize;

pub struct Texture {
    dimensions: PixelSize,
    swapchain_index: u32,
    resource: ID3D12Resource,
    shader_resource_view_gpu: D3D12_GPU_DESCRIPTOR_HANDLE,
}

unsafe impl Send for Texture {}
unsafe impl Sync for Texture {}

impl Texture {
    pub fn d3d12_resource(&self) -> &ID3D12Resource {
        &self.resource
    }

    /// Shader-visible descriptor for binding this texture in a render pass.
    pub fn shader_resource_view(&self) -> D3D12_GPU_DESCRIPTOR_HANDLE {
        self.shader_resource_view_gpu
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

struct ImportedTexture {
    resource: ID3D12Resource,
    handle: HANDLE,
}

struct ImportedFence {
    fence: ID3D12Fence,
    handle: HANDLE,
    last_value: u64,
}

struct SlotResources {
    command_allocator: ID3D12CommandAllocator,
    command_list: ID3D12GraphicsCommandList,
    /// Completion-fence value of this slot's last submission; zero before
    /// the first copy. The allocator must not be reset below this value.
    last_copy_fence_value: u64,
}

pub struct D3D12TextureCopier {
    device: ID3D12Device,
    queue: ID3D12CommandQueue,
    gpu_luid: u64,
    // One shader-visible SRV slot per swapchain index.
    srv_heap: ID3D12DescriptorHeap,
    srv_increment: u32,
    slots: Vec<SlotResources>,
    copy_fence: ID3D12Fence,
    copy_fence_value: u64,
    ipc_textures: HashMap<RawIpcHandle, ImportedTexture>,
    ipc_fences: HashMap<RawIpcHandle, ImportedFence>,
}

unsafe impl Send for D3D12TextureCopier {}

impl D3D12TextureCopier {
    pub fn new(device: &ID3D12Device, queue: &ID3D12CommandQueue) -> anyhow::Result<Self> {
        let luid = unsafe { device.GetAdapterLuid() };
        let gpu_luid = ((luid.HighPart as u64) << 32) | luid.LowPart as u64;
        log::info!("D3D12 frame consumer on adapter LUID {gpu_luid:#018x}");

        let heap_desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
            NumDescriptors: SWAPCHAIN_LENGTH as u32,
            Flags: D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
            NodeMask: 0,
        };
        let srv_heap: ID3D12DescriptorHeap = unsafe { device.CreateDescriptorHeap(&heap_desc) }
            .context("creating the SRV descriptor heap")?;
        let srv_increment = unsafe {
            device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV)
        };

        let mut slots = Vec::with_capacity(SWAPCHAIN_LENGTH);
        for _ in 0..SWAPCHAIN_LENGTH {
            let command_allocator: ID3D12CommandAllocator =
                unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }
                    .context("creating a slot command allocator")?;
            let command_list: ID3D12GraphicsCommandList = unsafe {
                device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &command_allocator, None)
            }
            .context("creating a slot command list")?;
            // Lists are created open; close so every copy starts with Reset.
            unsafe { command_list.Close() }?;
            slots.push(SlotResources {
                command_allocator,
                command_list,
                last_copy_fence_value: 0,
            });
        }

        let copy_fence: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }
            .context("creating the copy completion fence")?;

        Ok(Self {
            device: device.clone(),
            queue: queue.clone(),
            gpu_luid,
            srv_heap,
            srv_increment,
            slots,
            copy_fence,
            copy_fence_value: 0,
            ipc_textures: HashMap::new(),
            ipc_fences: HashMap::new(),
        })
    }

    pub fn shader_resource_view_heap(&self) -> &ID3D12DescriptorHeap {
        &self.srv_heap
    }

    fn ipc_texture(
        &mut self,
        feeder_process_id: u32,
        handle: RawIpcHandle,
    ) -> anyhow::Result<ID3D12Resource> {
        if let Some(imported) = self.ipc_textures.get(&handle) {
            return Ok(imported.resource.clone());
        }
        let duplicated = duplicate_ipc_handle(feeder_process_id, handle)?;
        let mut resource: Option<ID3D12Resource> = None;
        if let Err(error) = unsafe { self.device.OpenSharedHandle(duplicated, &mut resource) } {
            unsafe {
                let _ = CloseHandle(duplicated);
            }
            return Err(error).context("opening the shared texture");
        }
        let resource = resource.context("shared texture open returned nothing")?;
        self.ipc_textures.insert(
            handle,
            ImportedTexture {
                resource: resource.clone(),
                handle: duplicated,
            },
        );
        Ok(resource)
    }

    fn ipc_fence(
        &mut self,
        feeder_process_id: u32,
        handle: RawIpcHandle,
    ) -> anyhow::Result<ID3D12Fence> {
        if let Some(imported) = self.ipc_fences.get(&handle) {
            return Ok(imported.fence.clone());
        }
        let duplicated = duplicate_ipc_handle(feeder_process_id, handle)?;
        let mut fence: Option<ID3D12Fence> = None;
        if let Err(error) = unsafe { self.device.OpenSharedHandle(duplicated, &mut fence) } {
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

impl TextureCopier for D3D12TextureCopier {
    fn gpu_luid(&self) -> u64 {
        self.gpu_luid
    }

    fn create_client_texture(
        &mut self,
        dimensions: PixelSize,
        swapchain_index: u32,
    ) -> anyhow::Result<Arc<dyn IpcClientTexture>> {
        let format = DXGI_FORMAT(SHARED_TEXTURE_DXGI_FORMAT as i32);
        let heap = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_DEFAULT,
            ..Default::default()
        };
        let desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Alignment: 0,
            Width: dimensions.width as u64,
            Height: dimensions.height,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: format,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET,
        };
        let clear = D3D12_CLEAR_VALUE {
            Format: format,
            ..Default::default()
        };
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &heap,
                D3D12_HEAP_FLAG_NONE,
                &desc,
                D3D12_RESOURCE_STATE_COMMON,
                Some(&clear),
                &mut resource,
            )
        }
        .context("creating the cache texture")?;
        let resource = resource.context("cache texture creation returned nothing")?;

        let slot = swapchain_index as usize % SWAPCHAIN_LENGTH;
        let cpu = D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: unsafe { self.srv_heap.GetCPUDescriptorHandleForHeapStart() }.ptr
                + slot * self.srv_increment as usize,
        };
        let gpu = D3D12_GPU_DESCRIPTOR_HANDLE {
            ptr: unsafe { self.srv_heap.GetGPUDescriptorHandleForHeapStart() }.ptr
                + (slot as u64) * self.srv_increment as u64,
        };
        unsafe { self.device.CreateShaderResourceView(&resource, None, cpu) };

        Ok(Arc::new(Texture {
            dimensions,
            swapchain_index,
            resource,
            shader_resource_view_gpu: gpu,
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
            .context("destination texture is not a D3D12 texture")?;

        let source = self.ipc_texture(request.feeder_process_id, request.texture_handle)?;
        let fence_in = self.ipc_fence(request.feeder_process_id, request.fence_handle)?;

        let slot_index = destination.swapchain_index as usize % SWAPCHAIN_LENGTH;
        // Resetting an allocator whose commands may still be executing is
        // invalid; retire this slot's previous copy first.
        let pending = self.slots[slot_index].last_copy_fence_value;
        if pending != 0 {
            wait_for_fence_value(&self.copy_fence, pending)
                .context("waiting for the slot's previous copy")?;
        }

        let slot = &self.slots[slot_index];
        unsafe {
            slot.command_allocator
                .Reset()
                .context("resetting the slot allocator")?;
            slot.command_list
                .Reset(&slot.command_allocator, None)
                .context("resetting the slot command list")?;

            let into_copy = [
                transition_barrier(
                    &source,
                    D3D12_RESOURCE_STATE_COMMON,
                    D3D12_RESOURCE_STATE_COPY_SOURCE,
                ),
                transition_barrier(
                    &destination.resource,
                    D3D12_RESOURCE_STATE_COMMON,
                    D3D12_RESOURCE_STATE_COPY_DEST,
                ),
            ];
            slot.command_list.ResourceBarrier(&into_copy);
            slot.command_list.CopyResource(&destination.resource, &source);
            let out_of_copy = [
                transition_barrier(
                    &source,
                    D3D12_RESOURCE_STATE_COPY_SOURCE,
                    D3D12_RESOURCE_STATE_COMMON,
                ),
                transition_barrier(
                    &destination.resource,
                    D3D12_RESOURCE_STATE_COPY_DEST,
                    D3D12_RESOURCE_STATE_COMMON,
                ),
            ];
            slot.command_list.ResourceBarrier(&out_of_copy);
            drop_barriers(into_copy);
            drop_barriers(out_of_copy);
            slot.command_list
                .Close()
                .context("closing the copy command list")?;

            self.queue
                .Wait(&fence_in, request.fence_value_in)
                .context("queueing the wait on the producer fence")?;
            self.queue
                .ExecuteCommandLists(&[Some(slot.command_list.cast()?)]);
            self.copy_fence_value += 1;
            self.queue
                .Signal(&self.copy_fence, self.copy_fence_value)
                .context("signaling the copy completion fence")?;
        }
        self.slots[slot_index].last_copy_fence_value = self.copy_fence_value;
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

impl Drop for D3D12TextureCopier {
    fn drop(&mut self) {
        self.release_ipc_handles();
    }
}

fn transition_barrier(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: ManuallyDrop::new(Some(resource.clone())),
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

// The barrier union holds a ManuallyDrop'd COM reference that must be
// released by hand once the command list has recorded it.
fn drop_barriers<const N: usize>(barriers: [D3D12_RESOURCE_BARRIER; N]) {
    for barrier in barriers {
        unsafe {
            let transition = ManuallyDrop::into_inner(barrier.Anonymous.Transition);
            drop(ManuallyDrop::into_inner(transition.pResource));
        }
    }
}

fn wait_for_fence_value(fence: &ID3D12Fence, value: u64) -> anyhow::Result<()> {
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
