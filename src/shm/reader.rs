//! Metadata-only consumer side: `Reader` and the `Snapshot` it produces.
//!
//! A `Reader` never takes the segment lock and never touches the GPU; it is
//! safe to poll from a render loop at any rate. The GPU-copying layer on top
//! lives in `cached`.

use std::sync::Arc;

use crate::config::SEQLOCK_MAX_RETRIES;
use crate::gpu::IpcClientTexture;
use crate::shm::metadata::{Config, FrameMetadata, LayerConfig};
use crate::shm::segment::Segment;

/// Validity of a `Snapshot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    /// No producer attached, or the record was mid-write too many times in a
    /// row. Transient; poll again.
    Empty,
    /// The producer rendered on a different physical GPU. Permanent until
    /// the producer restarts on a matching adapter.
    IncorrectGpu,
    /// Opening or importing a shared handle failed. Retried on the next
    /// sequence number.
    IpcHandleError,
    /// Metadata only; the cheap polling result.
    ValidWithoutTexture,
    /// Metadata plus a consumer-owned copy of the frame's pixels.
    ValidWithTexture,
}

/// An immutable point-in-time view of the most recent published frame.
///
/// Cheap to clone; the client texture, when present, is shared and stays
/// alive as long as any clone of the snapshot does.
#[derive(Clone)]
pub struct Snapshot {
    state: SnapshotState,
    metadata: FrameMetadata,
    texture: Option<Arc<dyn IpcClientTexture>>,
}

impl Snapshot {
    pub(crate) fn empty() -> Self {
        Self::stateful(SnapshotState::Empty)
    }

    pub(crate) fn incorrect_gpu() -> Self {
        Self::stateful(SnapshotState::IncorrectGpu)
    }

    pub(crate) fn ipc_handle_error() -> Self {
        Self::stateful(SnapshotState::IpcHandleError)
    }

    fn stateful(state: SnapshotState) -> Self {
        Self {
            state,
            metadata: FrameMetadata::default(),
            texture: None,
        }
    }

    pub(crate) fn metadata_only(metadata: FrameMetadata) -> Self {
        Self {
            state: SnapshotState::ValidWithoutTexture,
            metadata,
            texture: None,
        }
    }

    pub(crate) fn with_texture(
        metadata: FrameMetadata,
        texture: Arc<dyn IpcClientTexture>,
    ) -> Self {
        Self {
            state: SnapshotState::ValidWithTexture,
            metadata,
            texture: Some(texture),
        }
    }

    pub fn state(&self) -> SnapshotState {
        self.state
    }

    pub fn is_valid(&self) -> bool {
        matches!(
            self.state,
            SnapshotState::ValidWithoutTexture | SnapshotState::ValidWithTexture
        )
    }

    /// `None` unless the snapshot is valid; invalid snapshots must never
    /// compare equal to a real frame's key.
    pub fn render_cache_key(&self) -> Option<u64> {
        self.is_valid().then(|| self.metadata.render_cache_key())
    }

    pub fn session_id(&self) -> u64 {
        self.metadata.session_id
    }

    /// The raw sequence number. Useful for frame-rate metrics; for "should I
    /// re-render" decisions use `render_cache_key` instead.
    pub fn frame_number(&self) -> u64 {
        self.metadata.frame_number
    }

    pub fn config(&self) -> &Config {
        &self.metadata.config
    }

    pub fn layer_count(&self) -> usize {
        if self.is_valid() {
            self.metadata.layer_configs().len()
        } else {
            0
        }
    }

    pub fn layer_config(&self, index: usize) -> Option<&LayerConfig> {
        if self.is_valid() {
            self.metadata.layer_configs().get(index)
        } else {
            None
        }
    }

    pub fn texture(&self) -> Option<&Arc<dyn IpcClientTexture>> {
        self.texture.as_ref()
    }

    pub(crate) fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }
}

pub struct Reader {
    segment: Segment,
}

impl Reader {
    /// Attach to the OS-named segment read-side.
    #[cfg(target_os = "windows")]
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self::with_segment(Segment::named()?))
    }

    pub fn with_segment(segment: Segment) -> Self {
        Self { segment }
    }

    /// Snapshot the current metadata without GPU work.
    ///
    /// A producer mid-write is tolerated by retrying the seqlock read a
    /// bounded number of times; persistent contention degrades to `Empty`
    /// rather than spinning, since the next poll will land between writes.
    pub fn maybe_get_metadata(&self) -> Snapshot {
        match self.read_metadata() {
            Some(meta) if meta.have_feeder() => Snapshot::metadata_only(meta),
            _ => Snapshot::empty(),
        }
    }

    pub(crate) fn read_metadata(&self) -> Option<FrameMetadata> {
        for _ in 0..SEQLOCK_MAX_RETRIES {
            if let Some(meta) = self.segment.try_read() {
                return Some(meta);
            }
        }
        log::debug!("metadata read contended {SEQLOCK_MAX_RETRIES} times; treating as empty");
        None
    }

    /// The value to compare for "has visible content changed"; `None` while
    /// no producer is attached.
    pub fn render_cache_key(&self) -> Option<u64> {
        self.read_metadata()
            .filter(FrameMetadata::have_feeder)
            .map(|meta| meta.render_cache_key())
    }

    pub fn is_feeder_attached(&self) -> bool {
        self.read_metadata()
            .map(|meta| meta.have_feeder())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::segment::MemorySegment;
    use crate::shm::writer::Writer;

    fn pair() -> (Writer, Reader) {
        let shared = MemorySegment::new();
        (
            Writer::with_segment(Segment::Memory(shared.clone()), 0xabcd),
            Reader::with_segment(Segment::Memory(shared)),
        )
    }

    #[test]
    fn test_empty_until_first_submit() {
        let (mut writer, reader) = pair();
        assert_eq!(reader.maybe_get_metadata().state(), SnapshotState::Empty);
        assert!(reader.render_cache_key().is_none());

        writer.lock().unwrap();
        writer.begin_frame().unwrap();
        writer
            .submit_frame(Config::default(), &[], 1, 2)
            .unwrap();

        let snapshot = reader.maybe_get_metadata();
        assert_eq!(snapshot.state(), SnapshotState::ValidWithoutTexture);
        assert!(snapshot.render_cache_key().is_some());
    }

    #[test]
    fn test_config_round_trips() {
        let (mut writer, reader) = pair();
        let config = Config {
            global_input_layer_id: 99,
            texture_size: crate::shm::geometry::PixelSize::new(2048, 2048),
            tint: [0.5, 0.25, 0.125, 1.0],
            ..Default::default()
        };
        let layers = [LayerConfig {
            layer_id: 7,
            vr_enabled: true,
            location_on_texture: crate::shm::geometry::PixelRect::new(0, 0, 1024, 768),
            ..Default::default()
        }];

        writer.lock().unwrap();
        writer.begin_frame().unwrap();
        writer.submit_frame(config, &layers, 1, 2).unwrap();

        let snapshot = reader.maybe_get_metadata();
        assert_eq!(*snapshot.config(), config);
        assert_eq!(snapshot.layer_count(), 1);
        assert_eq!(snapshot.layer_config(0), Some(&layers[0]));
        assert_eq!(snapshot.layer_config(1), None);
    }

    #[test]
    fn test_sequence_never_regresses_under_load() {
        let shared = MemorySegment::new();
        let mut writer = Writer::with_segment(Segment::Memory(shared.clone()), 0xabcd);
        let reader = Reader::with_segment(Segment::Memory(shared));

        let publisher = std::thread::spawn(move || {
            for _ in 0..2_000 {
                writer.lock().unwrap();
                writer.begin_frame().unwrap();
                writer
                    .submit_frame(Config::default(), &[], 1, 2)
                    .unwrap();
            }
        });

        let mut last = 0u64;
        loop {
            let snapshot = reader.maybe_get_metadata();
            if snapshot.is_valid() {
                assert!(snapshot.frame_number() >= last);
                last = snapshot.frame_number();
            }
            if last == 2_000 {
                break;
            }
            if publisher.is_finished() && last < 2_000 {
                // One final read after the publisher stopped.
                last = reader.maybe_get_metadata().frame_number();
                assert_eq!(last, 2_000);
                break;
            }
        }
        publisher.join().unwrap();
    }

    #[test]
    fn test_cache_key_changes_per_submit() {
        let (mut writer, reader) = pair();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            writer.lock().unwrap();
            writer.begin_frame().unwrap();
            writer
                .submit_frame(Config::default(), &[], 1, 2)
                .unwrap();
            assert!(seen.insert(reader.render_cache_key().unwrap()));
        }
    }
}
