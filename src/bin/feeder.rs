//! Metadata-only demo producer.
//!
//! Publishes frames at a fixed rate with a layer that slides across the
//! canvas, so a probe (or any consumer) can watch sequence numbers, cache
//! keys, and session changes without a real render pipeline attached. Slot
//! handles are left empty; consumers see `ValidWithoutTexture`.

use clap::{Arg, Command};
use kneecast::config::{app_name, app_version};
use kneecast::shm::geometry::{PixelRect, PixelSize};
use kneecast::shm::metadata::{Config, LayerConfig};
use kneecast::shm::segment::Segment;
use kneecast::shm::writer::Writer;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(format!("{}-feeder", app_name()))
        .version(app_version())
        .about("Publishes demo frames into the shared-memory exchange.")
        .arg(
            Arg::new("fps")
                .short('f')
                .long("fps")
                .value_name("FPS")
                .help("Frames published per second.")
                .default_value("30"),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .value_name("PIXELS")
                .help("Canvas width.")
                .default_value("2048"),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .value_name("PIXELS")
                .help("Canvas height.")
                .default_value("2048"),
        )
        .get_matches();

    let fps: u64 = matches
        .get_one::<String>("fps")
        .map(|value| value.parse())
        .transpose()?
        .filter(|&fps| fps > 0)
        .unwrap_or(30);
    let width: u32 = matches
        .get_one::<String>("width")
        .map(|value| value.parse())
        .transpose()?
        .unwrap_or(2048);
    let height: u32 = matches
        .get_one::<String>("height")
        .map(|value| value.parse())
        .transpose()?
        .unwrap_or(2048);

    #[cfg(target_os = "windows")]
    let segment = Segment::named()?;
    #[cfg(not(target_os = "windows"))]
    let segment = {
        log::warn!("named segments are Windows-only; feeding a process-local segment");
        Segment::memory()
    };

    let mut writer = Writer::with_segment(segment, 0);
    let config = Config {
        texture_size: PixelSize::new(width, height),
        ..Default::default()
    };

    log::info!("feeding {width}x{height} at {fps} fps");
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs_f64(1.0 / fps as f64));
    let mut step: u32 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        // A layer that slides down the canvas, one row per frame.
        let band = (height / 2).max(1);
        let layer = LayerConfig {
            layer_id: 1,
            location_on_texture: PixelRect::new(0, step % band, width, band),
            ..Default::default()
        };
        step = step.wrapping_add(1);

        writer.lock()?;
        writer.begin_frame()?;
        writer.submit_frame(config, &[layer], 0, 0)?;

        if step % (fps as u32 * 10) == 0 {
            log::info!(
                "published frame {step} in session {:#018x}",
                writer.session_id().unwrap_or_default()
            );
        }
    }

    writer.detach()?;
    log::info!("detached");
    Ok(())
}
