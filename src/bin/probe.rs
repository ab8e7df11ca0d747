//! Read-side diagnostics: polls the exchange and prints what a consumer
//! would see, without touching any GPU.

use clap::{Arg, Command};
use kneecast::config::{app_name, app_version};
use kneecast::shm::active_consumers::ActiveConsumers;
use kneecast::shm::metadata::ConsumerKind;
use kneecast::shm::reader::Reader;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(format!("{}-probe", app_name()))
        .version(app_version())
        .about("Prints the exchange's current metadata at a fixed interval.")
        .arg(
            Arg::new("interval-ms")
                .short('i')
                .long("interval")
                .value_name("MILLISECONDS")
                .help("Time between polls.")
                .default_value("1000"),
        )
        .get_matches();

    let interval_ms: u64 = matches
        .get_one::<String>("interval-ms")
        .map(|value| value.parse())
        .transpose()?
        .filter(|&ms| ms > 0)
        .unwrap_or(1000);

    #[cfg(target_os = "windows")]
    let (reader, consumers) = (Reader::new()?, ActiveConsumers::named()?);
    #[cfg(not(target_os = "windows"))]
    let (reader, consumers) = {
        log::warn!("named segments are Windows-only; probing a process-local segment");
        (
            Reader::with_segment(kneecast::shm::segment::Segment::memory()),
            ActiveConsumers::memory(),
        )
    };

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        consumers.touch(ConsumerKind::Viewer);
        let snapshot = reader.maybe_get_metadata();
        if !snapshot.is_valid() {
            println!("no feeder attached");
            continue;
        }
        println!(
            "session {:#018x} frame {} cache-key {:#018x} layers {} canvas {}x{}",
            snapshot.session_id(),
            snapshot.frame_number(),
            snapshot.render_cache_key().unwrap_or_default(),
            snapshot.layer_count(),
            snapshot.config().texture_size.width,
            snapshot.config().texture_size.height,
        );
    }
    Ok(())
}
