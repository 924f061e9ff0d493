use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use frame_bus::{
    FrameBus, PipelineState, StreamError, backend::MediaBackend, dump::dump_frame,
    synthetic::{self, SyntheticBackend},
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, Cli, ConsumerConfig};

mod config;

fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .filter_module("ffmpeg_next", level)
        .filter_module("frame_bus", level)
        .init();
}

#[cfg(feature = "ffmpeg")]
fn file_backend() -> anyhow::Result<Arc<dyn MediaBackend>> {
    frame_bus::init()?;
    Ok(Arc::new(frame_bus::av::AvBackend::default()))
}

#[cfg(not(feature = "ffmpeg"))]
fn file_backend() -> anyhow::Result<Arc<dyn MediaBackend>> {
    anyhow::bail!("built without the ffmpeg feature; only synthetic:// inputs are supported")
}

fn backend_for(input: &str) -> anyhow::Result<Arc<dyn MediaBackend>> {
    if input.starts_with(synthetic::SCHEME) {
        return Ok(Arc::new(SyntheticBackend::new()));
    }
    file_backend()
}

/// Reads frames for one consumer until cancelled, the budget is spent or
/// the pipeline closes. Returns the number of frames served.
fn run_consumer(
    bus: Arc<FrameBus>,
    consumer: ConsumerConfig,
    budget: Option<u64>,
    cancel: CancellationToken,
) -> anyhow::Result<u64> {
    let mut dump = match &consumer.dump {
        Some(path) => Some(BufWriter::new(
            OpenOptions::new().create(true).append(true).open(path)?,
        )),
        None => None,
    };
    let request = consumer.request();
    let mut served = 0;
    let mut last_sequence = None;

    while !cancel.is_cancelled() && budget.is_none_or(|budget| served < budget) {
        let frame = match bus.get_frame(&consumer.name, request) {
            Ok(frame) => frame,
            Err(e) if e.is_transient() => {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            Err(StreamError::PipelineClosed) => break,
            Err(e) => return Err(e.into()),
        };
        // without pacing the same frame can be served twice in a row
        if last_sequence == Some(frame.source_sequence()) {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        last_sequence = Some(frame.source_sequence());
        served += 1;
        log::debug!("{}: {}", consumer.name, frame);

        if let Some(out) = dump.as_mut() {
            dump_frame(&frame, out)?;
        }
    }

    if let Some(mut out) = dump {
        out.flush()?;
    }
    log::info!("{}: served {} frames", consumer.name, served);
    Ok(served)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(Cli::parse())?;
    init_logging(config.log_level()?);

    let bus = Arc::new(FrameBus::new(
        backend_for(&config.input)?,
        config.bus.clone(),
    ));
    bus.initialize(&config.input, config.buffer)?;
    log::info!(
        "stream parameters: {}",
        serde_json::to_string(&bus.get_parameters()?)?
    );
    bus.start()?;

    let cancel = CancellationToken::new();
    let mut consumers = JoinSet::new();
    for consumer in config.consumers.iter().cloned() {
        let bus = bus.clone();
        let cancel = cancel.clone();
        let budget = config.frames;
        consumers.spawn_blocking(move || run_consumer(bus, consumer, budget, cancel));
    }

    let mut watch = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted");
                break;
            }
            Some(finished) = consumers.join_next() => {
                match finished? {
                    Ok(_) => {}
                    Err(e) => log::error!("consumer failed: {:#}", e),
                }
                if consumers.is_empty() {
                    break;
                }
            }
            _ = watch.tick() => {
                if bus.state() == PipelineState::Closed {
                    break;
                }
            }
        }
    }

    cancel.cancel();
    let mode = config.close_mode();
    let closing = bus.clone();
    tokio::task::spawn_blocking(move || closing.close(mode)).await?;
    while let Some(finished) = consumers.join_next().await {
        if let Err(e) = finished? {
            log::error!("consumer failed: {:#}", e);
        }
    }

    if let Some(error) = bus.last_error() {
        anyhow::bail!("pipeline stopped: {}", error);
    }
    log::info!("closed after {:?} frames", bus.latest_sequence());
    Ok(())
}
