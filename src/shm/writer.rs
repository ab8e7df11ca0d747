//! The producing side of the exchange.
//!
//! Exactly one writer owns the segment at a time. It rotates through the
//! swapchain slots, publishes metadata under the segment lock, and never
//! blocks on consumers. The pixel-producing pipeline drives it as:
//! `lock` -> `begin_frame` -> render into the returned slot and signal the
//! returned fence value -> `submit_frame` (which publishes and unlocks).

use anyhow::Context;

use crate::config::{MAX_LAYERS, SWAPCHAIN_LENGTH};
use crate::shm::metadata::{
    Config, FLAG_FEEDER_ATTACHED, LayerConfig, METADATA_MAGIC, SlotHandles,
};
use crate::shm::segment::Segment;

/// What `begin_frame` hands the caller: which slot to render into and which
/// fence value to signal once its GPU writes are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub texture_index: u32,
    pub fence_out: u64,
}

pub struct Writer {
    segment: Segment,
    gpu_luid: u64,
    /// `None` between `detach` and the next `begin_frame`.
    session_id: Option<u64>,
    frame_number: u64,
    fence_value: u64,
    pending: Option<FrameInfo>,
    locked: bool,
}

impl Writer {
    /// Attach to the OS-named segment. Failing to create the underlying
    /// primitives is an error the caller reports upward; there is no retry.
    #[cfg(target_os = "windows")]
    pub fn new(gpu_luid: u64) -> anyhow::Result<Self> {
        Ok(Self::with_segment(
            Segment::named().context("attaching the writer segment")?,
            gpu_luid,
        ))
    }

    /// A writer over an explicit segment; this is how in-process pipelines
    /// and the tests construct one.
    pub fn with_segment(segment: Segment, gpu_luid: u64) -> Self {
        Self {
            segment,
            gpu_luid,
            session_id: None,
            frame_number: 0,
            fence_value: 0,
            pending: None,
            locked: false,
        }
    }

    pub fn lock(&mut self) -> anyhow::Result<()> {
        if !self.locked {
            self.segment.lock()?;
            self.locked = true;
        }
        Ok(())
    }

    pub fn try_lock(&mut self) -> anyhow::Result<bool> {
        if self.locked {
            return Ok(true);
        }
        if self.segment.try_lock()? {
            self.locked = true;
        }
        Ok(self.locked)
    }

    pub fn unlock(&mut self) {
        if self.locked {
            self.segment.unlock();
            self.locked = false;
        }
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Pick the next swapchain slot and the fence value the caller must
    /// signal for it. Starts a fresh session if the writer is detached.
    /// Never blocks on consumers.
    pub fn begin_frame(&mut self) -> anyhow::Result<FrameInfo> {
        anyhow::ensure!(self.locked, "begin_frame requires the writer lock");
        if self.session_id.is_none() {
            let session = new_session_id();
            log::info!("starting session {session:#018x}");
            self.session_id = Some(session);
            self.frame_number = 0;
            self.fence_value = 0;
        }
        self.fence_value += 1;
        let info = FrameInfo {
            texture_index: ((self.frame_number + 1) % SWAPCHAIN_LENGTH as u64) as u32,
            fence_out: self.fence_value,
        };
        self.pending = Some(info);
        Ok(info)
    }

    /// Publish the frame begun by `begin_frame` and release the lock.
    ///
    /// The handles are the raw shareable values of the slot's texture and
    /// fence in this process; consumers duplicate them by PID. The sequence
    /// number advances unconditionally, content-identical frames included.
    pub fn submit_frame(
        &mut self,
        config: Config,
        layers: &[LayerConfig],
        texture_handle: u64,
        fence_handle: u64,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(self.locked, "submit_frame requires the writer lock");
        anyhow::ensure!(
            layers.len() <= MAX_LAYERS,
            "{} layers exceeds the limit of {MAX_LAYERS}",
            layers.len()
        );
        let info = self
            .pending
            .take()
            .context("submit_frame without a matching begin_frame")?;
        let session_id = self
            .session_id
            .context("submit_frame on a detached writer")?;

        self.frame_number += 1;
        let frame_number = self.frame_number;
        let gpu_luid = self.gpu_luid;

        self.segment.write_with(|meta| {
            meta.magic = METADATA_MAGIC;
            meta.flags |= FLAG_FEEDER_ATTACHED;
            meta.session_id = session_id;
            meta.frame_number = frame_number;
            meta.feeder_process_id = std::process::id();
            meta.gpu_luid = gpu_luid;
            meta.config = config;
            meta.layer_count = layers.len() as u32;
            meta.layers = [LayerConfig::default(); MAX_LAYERS];
            meta.layers[..layers.len()].copy_from_slice(layers);
            meta.texture_index = info.texture_index;
            meta.slots[info.texture_index as usize] = SlotHandles {
                texture_handle,
                fence_handle,
                fence_value: info.fence_out,
            };
        });
        self.unlock();
        Ok(())
    }

    /// Publish "alive, but nothing to show": a frame with zero layers.
    /// Session and cache-key machinery behave exactly as for real frames.
    pub fn submit_empty_frame(&mut self) -> anyhow::Result<()> {
        let was_locked = self.locked;
        self.lock()?;
        if self.pending.is_none() {
            self.begin_frame()?;
        }
        let result = self.submit_frame(Config::default(), &[], 0, 0);
        if was_locked && result.is_ok() {
            // submit_frame released the lock the caller was holding.
            self.lock()?;
        }
        result
    }

    /// Tear down this session. Consumers see the attach flag drop and, when
    /// a new session starts, a session id that forces them to discard every
    /// cached handle.
    pub fn detach(&mut self) -> anyhow::Result<()> {
        if self.session_id.is_none() {
            return Ok(());
        }
        let was_locked = self.locked;
        self.lock()?;
        self.segment.write_with(|meta| {
            meta.flags &= !FLAG_FEEDER_ATTACHED;
            meta.layer_count = 0;
            meta.slots = [SlotHandles::default(); SWAPCHAIN_LENGTH];
        });
        if !was_locked {
            self.unlock();
        }
        log::info!(
            "detached session {:#018x}",
            self.session_id.unwrap_or_default()
        );
        self.session_id = None;
        self.pending = None;
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Err(error) = self.detach() {
            log::warn!("detach on drop failed: {error:#}");
        }
        self.unlock();
    }
}

/// High half is the producer PID, low half is random. The PID makes
/// collisions across concurrent producers impossible and gives consumers
/// the owning process for handle duplication without an extra field.
fn new_session_id() -> u64 {
    ((std::process::id() as u64) << 32) | rand::random::<u32>() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::segment::MemorySegment;

    fn writer_reader_pair() -> (Writer, Segment) {
        let shared = MemorySegment::new();
        let writer = Writer::with_segment(Segment::Memory(shared.clone()), 0x1234);
        (writer, Segment::Memory(shared))
    }

    #[test]
    fn test_begin_frame_rotates_slots() {
        let (mut writer, _) = writer_reader_pair();
        writer.lock().unwrap();
        let a = writer.begin_frame().unwrap();
        writer.submit_frame(Config::default(), &[], 1, 2).unwrap();
        writer.lock().unwrap();
        let b = writer.begin_frame().unwrap();
        writer.submit_frame(Config::default(), &[], 3, 4).unwrap();
        assert_ne!(a.texture_index, b.texture_index);
        assert!(b.fence_out > a.fence_out);
    }

    #[test]
    fn test_submit_requires_lock_and_begin() {
        let (mut writer, _) = writer_reader_pair();
        assert!(writer.begin_frame().is_err());
        writer.lock().unwrap();
        assert!(
            writer
                .submit_frame(Config::default(), &[], 0, 0)
                .is_err()
        );
        writer.unlock();
    }

    #[test]
    fn test_detach_starts_a_new_session() {
        let (mut writer, segment) = writer_reader_pair();
        writer.lock().unwrap();
        writer.begin_frame().unwrap();
        writer
            .submit_frame(Config::default(), &[], 10, 20)
            .unwrap();
        let first = writer.session_id().unwrap();
        assert!(segment.try_read().unwrap().have_feeder());

        writer.detach().unwrap();
        assert!(!segment.try_read().unwrap().have_feeder());

        writer.lock().unwrap();
        writer.begin_frame().unwrap();
        writer
            .submit_frame(Config::default(), &[], 10, 20)
            .unwrap();
        assert_ne!(writer.session_id().unwrap(), first);
    }

    #[test]
    fn test_empty_frame_clears_layers() {
        let (mut writer, segment) = writer_reader_pair();
        let layers = [LayerConfig {
            layer_id: 1,
            location_on_texture: crate::shm::geometry::PixelRect::new(0, 0, 640, 480),
            ..Default::default()
        }];
        writer.lock().unwrap();
        writer.begin_frame().unwrap();
        writer
            .submit_frame(Config::default(), &layers, 5, 6)
            .unwrap();
        assert_eq!(segment.try_read().unwrap().layer_count, 1);

        writer.submit_empty_frame().unwrap();
        let meta = segment.try_read().unwrap();
        assert_eq!(meta.layer_count, 0);
        assert!(meta.have_feeder());
    }
}
