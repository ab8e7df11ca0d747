//! Vulkan consumer backend.
//!
//! The producer's resources are Direct3D objects, so the imports cross an
//! API boundary: the shared texture arrives as external memory of type
//! `D3D11_TEXTURE`, and the shared fence as a timeline semaphore imported
//! with handle type `D3D12_FENCE`. The wait/copy/signal chain is a single
//! queue submission with a timeline wait on the producer's value and a
//! timeline signal on the consumer's completion semaphore.
//!
//! Requires a device created with `VK_KHR_external_memory_win32` and
//! `VK_KHR_external_semaphore_win32`, plus timeline semaphores (core 1.2).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use ash::vk;
use windows::Win32::Foundation::{CloseHandle, HANDLE};

use crate::config::SWAPCHAIN_LENGTH;
use crate::gpu::{CopyRequest, IpcClientTexture, RawIpcHandle, TextureCopier, duplicate_ipc_handle};
use crate::shm::geometry::PixelSize;

const SHARED_TEXTURE_VK_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

pub struct Texture {
    dimensions: PixelSize,
    swapchain_index: u32,
    device: ash::Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
}

impl Texture {
    pub fn vk_image(&self) -> vk::Image {
        self.image
    }

    pub fn vk_image_view(&self) -> vk::ImageView {
        self.view
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

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

struct ImportedImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
    dimensions: PixelSize,
    handle: HANDLE,
}

struct ImportedSemaphore {
    semaphore: vk::Semaphore,
    handle: HANDLE,
}

pub struct VulkanTextureCopier {
    device: ash::Device,
    external_semaphore: ash::khr::external_semaphore_win32::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    /// Completion-timeline value of each slot's last submission; zero before
    /// the first copy. A command buffer must not be re-recorded below it.
    slot_completion_values: [u64; SWAPCHAIN_LENGTH],
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    gpu_luid: u64,
    completion_semaphore: vk::Semaphore,
    completion_value: u64,
    ipc_images: HashMap<RawIpcHandle, ImportedImage>,
    ipc_semaphores: HashMap<RawIpcHandle, ImportedSemaphore>,
}

unsafe impl Send for VulkanTextureCopier {}

impl VulkanTextureCopier {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
        queue_family_index: u32,
        queue: vk::Queue,
    ) -> anyhow::Result<Self> {
        let mut id_properties = vk::PhysicalDeviceIDProperties::default();
        let mut properties = vk::PhysicalDeviceProperties2::default().push_next(&mut id_properties);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties) };
        anyhow::ensure!(
            id_properties.device_luid_valid == vk::TRUE,
            "physical device reports no LUID; cannot match against producers"
        );
        let gpu_luid = u64::from_le_bytes(id_properties.device_luid);
        log::info!("Vulkan frame consumer on adapter LUID {gpu_luid:#018x}");

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(queue_family_index),
                None,
            )
        }
        .context("creating the copy command pool")?;
        let command_buffers = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(SWAPCHAIN_LENGTH as u32),
            )
        }
        .context("allocating slot command buffers")?;

        let mut semaphore_type = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let completion_semaphore = unsafe {
            device.create_semaphore(
                &vk::SemaphoreCreateInfo::default().push_next(&mut semaphore_type),
                None,
            )
        }
        .context("creating the completion semaphore")?;

        Ok(Self {
            device: device.clone(),
            external_semaphore: ash::khr::external_semaphore_win32::Device::new(instance, device),
            queue,
            command_pool,
            command_buffers,
            slot_completion_values: [0; SWAPCHAIN_LENGTH],
            memory_properties,
            gpu_luid,
            completion_semaphore,
            completion_value: 0,
            ipc_images: HashMap::new(),
            ipc_semaphores: HashMap::new(),
        })
    }

    fn memory_type_index(
        &self,
        requirements: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> anyhow::Result<u32> {
        (0..self.memory_properties.memory_type_count)
            .find(|&index| {
                (requirements.memory_type_bits & (1 << index)) != 0
                    && self.memory_properties.memory_types[index as usize]
                        .property_flags
                        .contains(flags)
            })
            .context("no suitable memory type")
    }

    fn ipc_image(
        &mut self,
        feeder_process_id: u32,
        handle: RawIpcHandle,
        dimensions: PixelSize,
    ) -> anyhow::Result<vk::Image> {
        if let Some(imported) = self.ipc_images.get(&handle) {
            anyhow::ensure!(
                imported.dimensions == dimensions,
                "imported image {handle:#x} changed dimensions without a new handle"
            );
            return Ok(imported.image);
        }
        let duplicated = duplicate_ipc_handle(feeder_process_id, handle)?;
        match self.import_image(duplicated, dimensions) {
            Ok((image, memory)) => {
                self.ipc_images.insert(
                    handle,
                    ImportedImage {
                        image,
                        memory,
                        dimensions,
                        handle: duplicated,
                    },
                );
                Ok(image)
            }
            Err(error) => {
                unsafe {
                    let _ = CloseHandle(duplicated);
                }
                Err(error)
            }
        }
    }

    fn import_image(
        &self,
        handle: HANDLE,
        dimensions: PixelSize,
    ) -> anyhow::Result<(vk::Image, vk::DeviceMemory)> {
        let mut external = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::D3D11_TEXTURE);
        let image = unsafe {
            self.device.create_image(
                &vk::ImageCreateInfo::default()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(SHARED_TEXTURE_VK_FORMAT)
                    .extent(vk::Extent3D {
                        width: dimensions.width,
                        height: dimensions.height,
                        depth: 1,
                    })
                    .mip_levels(1)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(vk::ImageUsageFlags::TRANSFER_SRC)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .push_next(&mut external),
                None,
            )
        }
        .context("creating the import image")?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let mut import = vk::ImportMemoryWin32HandleInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::D3D11_TEXTURE)
            .handle(handle.0);
        let memory = unsafe {
            self.device.allocate_memory(
                &vk::MemoryAllocateInfo::default()
                    .allocation_size(requirements.size)
                    .memory_type_index(self.memory_type_index(
                        &requirements,
                        vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    )?)
                    .push_next(&mut dedicated)
                    .push_next(&mut import),
                None,
            )
        };
        let memory = match memory {
            Ok(memory) => memory,
            Err(error) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(error).context("importing the shared texture memory");
            }
        };
        if let Err(error) = unsafe { self.device.bind_image_memory(image, memory, 0) } {
            unsafe {
                self.device.destroy_image(image, None);
                self.device.free_memory(memory, None);
            }
            return Err(error).context("binding imported texture memory");
        }
        Ok((image, memory))
    }

    fn ipc_semaphore(
        &mut self,
        feeder_process_id: u32,
        handle: RawIpcHandle,
    ) -> anyhow::Result<vk::Semaphore> {
        if let Some(imported) = self.ipc_semaphores.get(&handle) {
            return Ok(imported.semaphore);
        }
        let duplicated = duplicate_ipc_handle(feeder_process_id, handle)?;
        let mut semaphore_type = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore = unsafe {
            self.device.create_semaphore(
                &vk::SemaphoreCreateInfo::default().push_next(&mut semaphore_type),
                None,
            )
        }
        .context("creating the import semaphore")?;
        let import = vk::ImportSemaphoreWin32HandleInfoKHR::default()
            .semaphore(semaphore)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::D3D12_FENCE)
            .handle(duplicated.0);
        if let Err(error) = unsafe {
            self.external_semaphore
                .import_semaphore_win32_handle(&import)
        } {
            unsafe {
                self.device.destroy_semaphore(semaphore, None);
                let _ = CloseHandle(duplicated);
            }
            return Err(error).context("importing the shared fence");
        }
        self.ipc_semaphores.insert(
            handle,
            ImportedSemaphore {
                semaphore,
                handle: duplicated,
            },
        );
        Ok(semaphore)
    }

    /// Bounded CPU-side wait for the completion timeline to reach `value`.
    fn wait_for_timeline_value(&self, value: u64) -> anyhow::Result<()> {
        if value == 0 {
            return Ok(());
        }
        let semaphores = [self.completion_semaphore];
        let values = [value];
        let wait = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait, 5_000_000_000) }
            .context("waiting on the completion timeline")
    }
}

impl TextureCopier for VulkanTextureCopier {
    fn gpu_luid(&self) -> u64 {
        self.gpu_luid
    }

    fn create_client_texture(
        &mut self,
        dimensions: PixelSize,
        swapchain_index: u32,
    ) -> anyhow::Result<Arc<dyn IpcClientTexture>> {
        let image = unsafe {
            self.device.create_image(
                &vk::ImageCreateInfo::default()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(SHARED_TEXTURE_VK_FORMAT)
                    .extent(vk::Extent3D {
                        width: dimensions.width,
                        height: dimensions.height,
                        depth: 1,
                    })
                    .mip_levels(1)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED),
                None,
            )
        }
        .context("creating the cache image")?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory = unsafe {
            self.device.allocate_memory(
                &vk::MemoryAllocateInfo::default()
                    .allocation_size(requirements.size)
                    .memory_type_index(self.memory_type_index(
                        &requirements,
                        vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    )?),
                None,
            )
        }
        .context("allocating cache image memory")?;
        unsafe { self.device.bind_image_memory(image, memory, 0) }
            .context("binding cache image memory")?;

        let view = unsafe {
            self.device.create_image_view(
                &vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(SHARED_TEXTURE_VK_FORMAT)
                    .subresource_range(full_color_range()),
                None,
            )
        }
        .context("creating the cache image view")?;

        Ok(Arc::new(Texture {
            dimensions,
            swapchain_index,
            device: self.device.clone(),
            image,
            memory,
            view,
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
            .context("destination texture is not a Vulkan texture")?;
        let dimensions = destination.dimensions;

        let source = self.ipc_image(request.feeder_process_id, request.texture_handle, dimensions)?;
        let wait_semaphore = self.ipc_semaphore(request.feeder_process_id, request.fence_handle)?;

        let slot_index = destination.swapchain_index as usize % SWAPCHAIN_LENGTH;
        // Re-recording a command buffer that is still pending is undefined;
        // retire this slot's previous submission first.
        self.wait_for_timeline_value(self.slot_completion_values[slot_index])
            .context("waiting for the slot's previous copy")?;

        let command_buffer = self.command_buffers[slot_index];
        unsafe {
            self.device
                .begin_command_buffer(
                    command_buffer,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .context("beginning the copy command buffer")?;

            let into_copy = [
                image_barrier(
                    source,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_READ,
                ),
                image_barrier(
                    destination.image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                ),
            ];
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &into_copy,
            );

            let region = vk::ImageCopy::default()
                .src_subresource(full_color_layers())
                .dst_subresource(full_color_layers())
                .extent(vk::Extent3D {
                    width: dimensions.width,
                    height: dimensions.height,
                    depth: 1,
                });
            self.device.cmd_copy_image(
                command_buffer,
                source,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                destination.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            let to_sampled = [image_barrier(
                destination.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
            )];
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &to_sampled,
            );
            self.device
                .end_command_buffer(command_buffer)
                .context("ending the copy command buffer")?;

            self.completion_value += 1;
            let wait_semaphores = [wait_semaphore];
            let wait_values = [request.fence_value_in];
            let wait_stages = [vk::PipelineStageFlags::TRANSFER];
            let signal_semaphores = [self.completion_semaphore];
            let signal_values = [self.completion_value];
            let command_buffers = [command_buffer];
            let mut timeline = vk::TimelineSemaphoreSubmitInfo::default()
                .wait_semaphore_values(&wait_values)
                .signal_semaphore_values(&signal_values);
            let submit = vk::SubmitInfo::default()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores)
                .push_next(&mut timeline);
            self.device
                .queue_submit(self.queue, &[submit], vk::Fence::null())
                .context("submitting the copy")?;
        }
        self.slot_completion_values[slot_index] = self.completion_value;
        Ok(())
    }

    fn wait_for_pending_copies(&mut self) {
        if let Err(error) = self.wait_for_timeline_value(self.completion_value) {
            log::warn!("waiting for pending copies failed: {error:#}");
        }
    }

    fn release_ipc_handles(&mut self) {
        self.wait_for_pending_copies();
        for imported in self.ipc_semaphores.drain().map(|(_, imported)| imported) {
            unsafe {
                self.device.destroy_semaphore(imported.semaphore, None);
                let _ = CloseHandle(imported.handle);
            }
        }
        for imported in self.ipc_images.drain().map(|(_, imported)| imported) {
            unsafe {
                self.device.destroy_image(imported.image, None);
                self.device.free_memory(imported.memory, None);
                let _ = CloseHandle(imported.handle);
            }
        }
    }
}

impl Drop for VulkanTextureCopier {
    fn drop(&mut self) {
        self.release_ipc_handles();
        unsafe {
            self.device.destroy_semaphore(self.completion_semaphore, None);
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

fn full_color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn full_color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn image_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .image(image)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .subresource_range(full_color_range())
}
