mod config;
mod error;
mod input;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use adaptive_engine::manifest::{CLOCK_FREQ, Tick};
use adaptive_engine::proxy::ProxyConfig;
use adaptive_engine::{
    AdaptationLogicKind, AdaptiveConfig, Context, ControlQuery, ControlReply, DemuxStatus,
    ManagerEvent, PlaylistManager,
};
use clap::Parser;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::config::FileConfig;
use crate::error::{AppError, Result};
use crate::output::StatsOutput;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Playback step handed to the manager on each iteration.
const STEP: Tick = CLOCK_FREQ / 10;

#[derive(Parser, Debug)]
#[command(name = "adaptive", author, version, about, long_about = None)]
struct Args {
    /// Manifest URL (HLS playlist, DASH MPD or Smooth Streaming manifest)
    url: String,

    /// Representation selection policy
    #[arg(long, value_enum)]
    logic: Option<AdaptationLogicKind>,

    /// Target bitrate in bits per second, used by the fixed logic
    #[arg(long)]
    bitrate: Option<u64>,

    #[arg(long)]
    max_width: Option<u32>,

    #[arg(long)]
    max_height: Option<u32>,

    /// Stop after this many seconds of media
    #[arg(long)]
    duration: Option<f64>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Proxy for every request (http://, https:// or socks5://)
    #[arg(long)]
    proxy: Option<String>,

    /// Debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Errors only
    #[arg(short, long)]
    quiet: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(verbose: bool, quiet: bool, json: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let subscriber = tracing_subscriber::registry().with(filter);
    if json {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn build_config(args: &Args) -> Result<AdaptiveConfig> {
    let mut config = AdaptiveConfig::default();
    if let Some(path) = &args.config {
        FileConfig::load(path)?.apply(&mut config)?;
    }
    if let Some(kind) = args.logic {
        config.logic.kind = kind;
    }
    if let Some(bitrate) = args.bitrate {
        config.logic.fixed_bitrate = bitrate;
    }
    config.logic.max_width = args.max_width.or(config.logic.max_width);
    config.logic.max_height = args.max_height.or(config.logic.max_height);
    if let Some(proxy) = &args.proxy {
        config.http.proxy = Some(ProxyConfig::from_url(proxy.clone()));
    }
    if config.logic.kind == AdaptationLogicKind::Fixed && config.logic.fixed_bitrate == 0 {
        return Err(AppError::InvalidInput(
            "the fixed logic needs --bitrate".to_string(),
        ));
    }
    Ok(config)
}

fn current_time(manager: &PlaylistManager) -> Option<Tick> {
    match manager.control(ControlQuery::GetTime) {
        Ok(ControlReply::Time(time)) => Some(time),
        _ => None,
    }
}

/// Returns false when the session cannot continue.
fn log_event(event: ManagerEvent) -> bool {
    match event {
        ManagerEvent::ManifestStalled { failures } => {
            error!(failures, "Manifest stalled, stopping");
            return false;
        }
        ManagerEvent::UpdateFailed { attempt, reason } => {
            warn!(attempt, reason = %reason, "Playlist update failed");
        }
        ManagerEvent::RepresentationDegraded {
            representation,
            reason,
        } => warn!(representation = %representation, reason = %reason, "Representation degraded"),
        ManagerEvent::RepresentationSwitched { set, from, to } => {
            info!(set = %set, from = ?from, to = %to, "Representation switched")
        }
        other => debug!(event = ?other, "Manager event"),
    }
    true
}

fn play(args: &Args, token: &CancellationToken) -> Result<StatsOutput> {
    let config = build_config(args)?;
    let ctx = Arc::new(Context::new(config)?);
    let manager = PlaylistManager::open(&args.url, ctx)?;
    manager.init()?;
    manager.start()?;
    let mut events = manager.take_events();
    info!(url = %args.url, logic = manager.logic_name(), "Playback started");

    let limit = args.duration.map(|secs| (secs * CLOCK_FREQ as f64) as Tick);
    let mut output = StatsOutput::new();
    let mut start = None;
    let started = Instant::now();
    let result = loop {
        if token.is_cancelled() {
            info!("Playback cancelled");
            break Ok(());
        }
        let before = current_time(&manager);
        let status = match manager.do_demux(STEP, &mut output) {
            Ok(status) => status,
            Err(e) => break Err(AppError::from(e)),
        };
        if let Some(events) = events.as_mut() {
            let mut keep_going = true;
            while let Ok(event) = events.try_recv() {
                keep_going &= log_event(event);
            }
            if !keep_going {
                break Err(AppError::Playback("manifest stalled".to_string()));
            }
        }
        match status {
            DemuxStatus::Eof => {
                info!("End of stream");
                break Ok(());
            }
            DemuxStatus::Error => break Err(AppError::Playback("demux error".to_string())),
            DemuxStatus::Success => {}
        }

        let now = current_time(&manager);
        if let Some(now) = now {
            let first = *start.get_or_insert(now);
            if limit.is_some_and(|limit| now - first >= limit) {
                info!(seconds = (now - first) / CLOCK_FREQ, "Requested duration reached");
                break Ok(());
            }
        }
        if now == before {
            manager.wait_activity(Duration::from_millis(200));
        }
    };

    manager.stop();
    info!(elapsed = ?started.elapsed(), "Session closed");
    result.map(|_| output)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet, args.log_json);

    let token = CancellationToken::new();
    let input = input::spawn_input_handler(token.clone());
    let result = play(&args, &token);
    token.cancel();
    if input.join().is_err() {
        warn!("Input thread panicked");
    }

    match result {
        Ok(stats) => {
            println!("{stats}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Application error: {}", e);
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
