//! The fixed-layout frame metadata record and its embedded config types.
//!
//! One `FrameMetadata` record is the entire content of the shared segment.
//! Everything here is `#[repr(C)]` and `Copy`: readers snapshot the record
//! with a single volatile copy and must never chase pointers into another
//! process.

use crate::config::{MAX_LAYERS, SWAPCHAIN_LENGTH};
use crate::shm::geometry::{PixelRect, PixelSize};

/// "KNCASTFM" — guards against a mapping that happens to exist but was never
/// initialized by a writer.
pub const METADATA_MAGIC: u64 = u64::from_le_bytes(*b"KNCASTFM");

/// Set while a producer is attached; cleared by `Writer::detach`.
pub const FLAG_FEEDER_ATTACHED: u64 = 1 << 0;

/// Which kind of downstream renderer a reader represents.
///
/// Used for advisory filtering only: a reader whose kind does not match the
/// writer's target pattern still reads metadata, it just skips the GPU copy.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerKind {
    SteamVr = 1 << 0,
    OpenXrD3D11 = 1 << 1,
    OpenXrD3D12 = 1 << 2,
    OpenXrVulkan = 1 << 3,
    Viewer = u32::MAX,
}

impl ConsumerKind {
    pub const ALL: [ConsumerKind; 5] = [
        ConsumerKind::SteamVr,
        ConsumerKind::OpenXrD3D11,
        ConsumerKind::OpenXrD3D12,
        ConsumerKind::OpenXrVulkan,
        ConsumerKind::Viewer,
    ];
}

/// Bitmask of `ConsumerKind`s a frame is intended for.
///
/// An empty pattern matches every consumer.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerPattern(u32);

impl ConsumerPattern {
    pub const fn new(mask: u32) -> Self {
        Self(mask)
    }

    pub const fn matches(&self, kind: ConsumerKind) -> bool {
        (self.0 & kind as u32) == self.0
    }

    pub const fn raw_mask(&self) -> u32 {
        self.0
    }
}

impl From<ConsumerKind> for ConsumerPattern {
    fn from(kind: ConsumerKind) -> Self {
        Self(kind as u32)
    }
}

/// In-world pose of a VR layer. Distances in metres, rotations in radians.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VrPose {
    pub x: f32,
    pub floor_y: f32,
    pub eye_y: f32,
    pub z: f32,
    pub rx: f32,
    pub ry: f32,
    pub rz: f32,
}

impl Default for VrPose {
    fn default() -> Self {
        Self {
            x: 0.15,
            floor_y: 0.6,
            eye_y: -0.7,
            z: -0.4,
            rx: -2.0 * core::f32::consts::PI / 5.0,
            ry: -core::f32::consts::PI / 32.0,
            rz: 0.0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GazeTargetScale {
    pub vertical: f32,
    pub horizontal: f32,
}

impl Default for GazeTargetScale {
    fn default() -> Self {
        Self {
            vertical: 1.0,
            horizontal: 1.0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VrOpacity {
    pub normal: f32,
    pub gaze: f32,
}

impl Default for VrOpacity {
    fn default() -> Self {
        Self {
            normal: 1.0,
            gaze: 1.0,
        }
    }
}

/// Per-layer VR placement and behavior.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VrLayer {
    pub pose: VrPose,
    /// Physical size in metres (width, height).
    pub physical_width: f32,
    pub physical_height: f32,
    pub enable_gaze_zoom: bool,
    pub zoom_scale: f32,
    pub gaze_target_scale: GazeTargetScale,
    pub opacity: VrOpacity,
}

impl Default for VrLayer {
    fn default() -> Self {
        Self {
            pose: VrPose::default(),
            physical_width: 0.25,
            physical_height: 0.25,
            enable_gaze_zoom: true,
            zoom_scale: 2.0,
            gaze_target_scale: GazeTargetScale::default(),
            opacity: VrOpacity::default(),
        }
    }
}

/// Frame-level VR settings.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VrRenderSettings {
    /// Quirk/feature bits; see `vr_flags`.
    pub flags: u32,
    /// Incremented every time the user recenters; consumers reset their
    /// reference pose when this changes.
    pub recenter_count: u64,
}

pub mod vr_flags {
    pub const DISCARD_DEPTH_INFORMATION: u32 = 1 << 0;
    pub const GAZE_ZOOM: u32 = 1 << 1;
    pub const GAZE_INPUT_FOCUS: u32 = 1 << 2;
}

impl Default for VrRenderSettings {
    fn default() -> Self {
        Self {
            flags: vr_flags::DISCARD_DEPTH_INFORMATION
                | vr_flags::GAZE_ZOOM
                | vr_flags::GAZE_INPUT_FOCUS,
            recenter_count: 0,
        }
    }
}

/// Frame-level configuration, published with every frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub global_input_layer_id: u64,
    pub vr: VrRenderSettings,
    pub target: ConsumerPattern,
    pub texture_size: PixelSize,
    /// RGBA tint, premultiplied against the shared texture at render time.
    pub tint: [f32; 4],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global_input_layer_id: 0,
            vr: VrRenderSettings::default(),
            target: ConsumerPattern::default(),
            texture_size: PixelSize::default(),
            tint: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

/// Per-layer configuration.
///
/// `layer_id` is stable across frames for the same logical view; consumers
/// key per-view state on it, never on the array index.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct LayerConfig {
    pub layer_id: u64,
    pub vr_enabled: bool,
    pub vr: VrLayer,
    /// Where this layer's pixels live on the shared texture.
    pub location_on_texture: PixelRect,
}

impl LayerConfig {
    pub fn is_valid(&self) -> bool {
        !self.location_on_texture.size.is_empty()
    }
}

/// One swapchain slot's shareable handles, as raw values in the feeder
/// process. Consumers duplicate them before importing.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandles {
    pub texture_handle: u64,
    pub fence_handle: u64,
    /// Fence value the producer signals once its writes to this slot are
    /// complete; the copy backend device-waits on it.
    pub fence_value: u64,
}

impl SlotHandles {
    pub fn is_populated(&self) -> bool {
        self.texture_handle != 0 && self.fence_handle != 0
    }
}

/// The complete shared record. Mutated only by the writer, under its lock;
/// snapshotted by readers via the segment's seqlock.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FrameMetadata {
    pub magic: u64,
    pub flags: u64,
    /// Random per-attach epoch; changing it is how consumers are told to
    /// drop every cached handle.
    pub session_id: u64,
    /// Monotonic within a session. Wraps are acceptable, repeats are not.
    pub frame_number: u64,
    pub feeder_process_id: u32,
    /// Which slot the most recent frame was published into.
    pub texture_index: u32,
    /// LUID of the adapter the producer rendered on.
    pub gpu_luid: u64,
    pub config: Config,
    pub layer_count: u32,
    _reserved: u32,
    pub layers: [LayerConfig; MAX_LAYERS],
    pub slots: [SlotHandles; SWAPCHAIN_LENGTH],
}

impl Default for FrameMetadata {
    fn default() -> Self {
        Self {
            magic: METADATA_MAGIC,
            flags: 0,
            session_id: 0,
            frame_number: 0,
            feeder_process_id: 0,
            texture_index: 0,
            gpu_luid: 0,
            config: Config::default(),
            layer_count: 0,
            _reserved: 0,
            layers: [LayerConfig::default(); MAX_LAYERS],
            slots: [SlotHandles::default(); SWAPCHAIN_LENGTH],
        }
    }
}

impl FrameMetadata {
    pub fn have_feeder(&self) -> bool {
        self.magic == METADATA_MAGIC && (self.flags & FLAG_FEEDER_ATTACHED) != 0
    }

    /// The value downstream renderers compare to decide whether to re-render.
    ///
    /// Mixes the session id (already random) with the frame number, so it
    /// changes across producer restarts even if the frame number resets.
    pub fn render_cache_key(&self) -> u64 {
        mix64(self.session_id) ^ mix64(self.frame_number)
    }

    pub fn layer_configs(&self) -> &[LayerConfig] {
        &self.layers[..(self.layer_count as usize).min(MAX_LAYERS)]
    }

    pub fn current_slot(&self) -> &SlotHandles {
        &self.slots[self.texture_index as usize % SWAPCHAIN_LENGTH]
    }
}

/// splitmix64 finalizer; good avalanche for cheap cache keys.
fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

// The record must fit comfortably in one page along with the seqlock word.
const _: () = assert!(core::mem::size_of::<FrameMetadata>() <= 4000);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_pattern_matching() {
        let any = ConsumerPattern::default();
        assert!(any.matches(ConsumerKind::SteamVr));
        assert!(any.matches(ConsumerKind::Viewer));

        let openxr: ConsumerPattern = ConsumerKind::OpenXrD3D11.into();
        assert!(openxr.matches(ConsumerKind::OpenXrD3D11));
        assert!(!openxr.matches(ConsumerKind::SteamVr));
        // Viewer's kind is all-ones, so it matches any target pattern.
        assert!(openxr.matches(ConsumerKind::Viewer));
    }

    #[test]
    fn test_have_feeder_requires_magic_and_flag() {
        let mut meta = FrameMetadata::default();
        assert!(!meta.have_feeder());

        meta.flags |= FLAG_FEEDER_ATTACHED;
        assert!(meta.have_feeder());

        // Uninitialized memory with the attach bit set must not count.
        meta.magic = 0;
        assert!(!meta.have_feeder());
    }

    #[test]
    fn test_render_cache_key_changes_with_frame_and_session() {
        let mut meta = FrameMetadata {
            session_id: 0xdead_beef,
            frame_number: 41,
            ..Default::default()
        };
        let key = meta.render_cache_key();

        meta.frame_number = 42;
        let next = meta.render_cache_key();
        assert_ne!(key, next);

        // Same frame number, different session: still a different key.
        meta.frame_number = 41;
        meta.session_id = 0xfeed_f00d;
        assert_ne!(key, meta.render_cache_key());
    }

    #[test]
    fn test_layer_slice_is_bounded() {
        let mut meta = FrameMetadata::default();
        meta.layer_count = 3;
        assert_eq!(meta.layer_configs().len(), 3);

        meta.layer_count = u32::MAX;
        assert_eq!(meta.layer_configs().len(), MAX_LAYERS);
    }
}
