use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webrtc::track::track_remote::TrackRemote;

use webrtc_reader::config::{ReaderConfig, RETRY_PAUSE_MS};
use webrtc_reader::events::{EventBus, ReaderEvent};
use webrtc_reader::webrtc::{ReaderState, ReceivedTrack, WebRtcReader, WebRtcTransportFactory};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// WHEP reader command line arguments
#[derive(Parser, Debug)]
#[command(name = "webrtc-reader")]
#[command(version, about = "Read a WebRTC stream from a WHEP endpoint", long_about = None)]
struct CliArgs {
    /// WHEP endpoint URL (a `jwt` query parameter is used as bearer token)
    #[arg(short = 'u', long, env = "WEBRTC_READER_URL", value_name = "URL")]
    url: String,

    /// Bearer token (overrides the `jwt` query parameter)
    #[arg(short = 't', long, env = "WEBRTC_READER_TOKEN", value_name = "TOKEN")]
    token: Option<String>,

    /// Pause before retrying a failed session, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = RETRY_PAUSE_MS)]
    retry_pause_ms: u64,

    /// Delete the WHEP session when exiting
    #[arg(long)]
    delete_on_close: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.log_json);

    let config = ReaderConfig {
        auth_token: args.token,
        retry_pause_ms: args.retry_pause_ms,
        delete_session_on_close: args.delete_on_close,
        ..ReaderConfig::with_url(args.url)
    };

    let events = Arc::new(EventBus::new());
    let mut rx = events.subscribe();
    let reader = WebRtcReader::start(
        config,
        events,
        Arc::new(WebRtcTransportFactory::new()),
    )?;
    tracing::info!("Reader {} started", reader.id());
    let mut state = reader.state_watch();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for CTRL+C: {}", e);
                }
                tracing::info!("Shutdown signal received");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow();
                tracing::debug!("Reader state: {}", current);
                // no automatic retry leaves this state
                if current == ReaderState::Error {
                    break;
                }
            }
            event = rx.recv() => match event {
                Ok(event) => handle_event(event),
                Err(RecvError::Lagged(n)) => tracing::warn!("Missed {} reader events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    reader.close().await;
    Ok(())
}

fn handle_event(event: ReaderEvent) {
    match event {
        ReaderEvent::Track(track) => {
            tracing::info!(
                "Track {} ({}, {}, pt {})",
                track.info.id,
                track.info.kind,
                track.info.mime_type,
                track.info.payload_type
            );
            spawn_packet_counter(track);
        }
        ReaderEvent::Ready(info) => match serde_json::to_string(&info.summary()) {
            Ok(summary) => tracing::info!("Stream ready: {}", summary),
            Err(_) => tracing::info!("Stream ready with {} track(s)", info.track_count),
        },
        ReaderEvent::Error(message) => tracing::warn!("Reader error: {}", message),
    }
}

/// Drain RTP from a received track and report how much arrived
fn spawn_packet_counter(track: ReceivedTrack) {
    let Some(remote) = track.downcast::<TrackRemote>() else {
        return;
    };

    tokio::spawn(async move {
        let mut packets: u64 = 0;
        let mut bytes: u64 = 0;

        while let Ok((packet, _)) = remote.read_rtp().await {
            packets += 1;
            bytes += packet.payload.len() as u64;
            if packets % 1000 == 0 {
                tracing::debug!("Track {}: {} packets, {} bytes", track.info.id, packets, bytes);
            }
        }

        tracing::info!(
            "Track {} ended after {} packets ({} bytes)",
            track.info.id,
            packets,
            bytes
        );
    });
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "webrtc_reader=error,webrtc=error",
        LogLevel::Warn => "webrtc_reader=warn,webrtc=warn",
        LogLevel::Info => "webrtc_reader=info,webrtc=warn",
        LogLevel::Verbose => "webrtc_reader=debug,webrtc=warn",
        LogLevel::Debug => "webrtc_reader=debug,webrtc=info",
        LogLevel::Trace => "webrtc_reader=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
