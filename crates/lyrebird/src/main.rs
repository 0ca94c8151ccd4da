//! Lyrebird CLI shell
//!
//! Thin entry point around the pipeline engine: argument parsing, logging
//! setup (console + session log file), source selection and Ctrl-C
//! handling. All real behavior lives in the library crates.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use directories::ProjectDirs;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use lyrebird_core::{EngineConfig, PipelineEvent, TranscriberEngine};
use lyrebird_platform::{
    CaptureConfig, CaptureSource, CpalLoopbackSource, FixedTranscriptionClient, SimConfig,
    SimulatedSource, TranscriptionClient,
};
use lyrebird_storage::SessionLayout;

#[derive(Parser, Debug)]
#[command(name = "lyrebird", about = "Stereo loopback capture and transcription")]
struct Args {
    /// Base directory for recordings, logs and transcripts
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Capture device name (defaults to the default input device)
    #[arg(long)]
    device: Option<String>,

    /// Run against the deterministic simulated source instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Stop after this many seconds (runs until Ctrl-C when omitted)
    #[arg(long)]
    duration: Option<u64>,

    /// Archive the session on exit
    #[arg(long)]
    archive: bool,
}

fn default_base_dir() -> PathBuf {
    ProjectDirs::from("io", "lyrebird", "lyrebird")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./lyrebird-data"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let base_dir = args.base_dir.clone().unwrap_or_else(default_base_dir);

    // Console + per-session file logging; the file guard is handed to the
    // engine so the CLOSING_LOGS cleanup step owns its teardown
    let layout = SessionLayout::new(&base_dir);
    layout.ensure().context("creating session directories")?;
    let log_file = tracing_appender::rolling::never(
        layout.logs_dir(),
        SessionLayout::log_file_name(Local::now()),
    );
    let (file_writer, file_guard) = tracing_appender::non_blocking(log_file);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    let config = EngineConfig::new(&base_dir);
    info!(base_dir = %base_dir.display(), session = %config.session_id, "lyrebird starting");

    let source: Box<dyn CaptureSource> = if args.simulate {
        info!("using simulated capture source");
        Box::new(SimulatedSource::new(SimConfig {
            realtime: true,
            ..Default::default()
        }))
    } else {
        Box::new(CpalLoopbackSource::new(CaptureConfig {
            device_name: args.device.clone(),
            sample_rate: config.sample_rate,
            frame_samples: config.frame_samples,
            ..Default::default()
        }))
    };

    // The remote transcription client is wired in by deployment; the
    // offline build ships a fixed stand-in so the pipeline is runnable
    // end to end.
    let client: Arc<dyn TranscriptionClient> =
        Arc::new(FixedTranscriptionClient::new("[offline transcription]", 0.0));

    let engine = TranscriberEngine::new(config, source, client).context("building engine")?;

    let mut guard = Some(file_guard);
    engine.set_log_closer(Box::new(move || {
        // Dropping the guard flushes and closes the non-blocking writer
        guard.take();
    }));

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("installing Ctrl-C handler")?;

    engine.start().context("starting engine")?;

    let deadline = args
        .duration
        .map(|secs| std::time::Instant::now() + Duration::from_secs(secs));

    loop {
        if interrupted.load(Ordering::SeqCst) {
            info!("interrupt received");
            break;
        }
        if engine.is_shutdown_requested() {
            // Failed recovery inside the pipeline hands control to cleanup
            info!("engine requested shutdown");
            break;
        }
        if let Some(deadline) = deadline {
            if std::time::Instant::now() >= deadline {
                info!("configured duration elapsed");
                break;
            }
        }
        match engine.wait_event(Duration::from_millis(200)) {
            Some(PipelineEvent::TranscriptionReady {
                channel,
                text,
                confidence,
            }) => {
                println!("[{}] ({confidence:.2}) {text}", channel.as_str());
            }
            Some(PipelineEvent::CaptureEnded) => {
                info!("capture ended");
                break;
            }
            Some(PipelineEvent::DegradedFallback { reason }) => {
                warn!(reason, "pipeline degraded");
            }
            Some(PipelineEvent::Error { component, message }) => {
                warn!(component, message, "pipeline error");
            }
            _ => {}
        }
    }

    if args.archive {
        match engine.archive_session() {
            Ok(path) => info!(path = %path.display(), "session archived"),
            Err(e) => warn!(error = %e, "archiving failed"),
        }
    }

    engine.shutdown().context("shutting down")?;
    Ok(())
}
