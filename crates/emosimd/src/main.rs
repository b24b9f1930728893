//! emosimd - background simulation service
//!
//! Runs the emotional agent/environment loop at the configured frame rate and
//! serves a JSON-lines control protocol on 127.0.0.1:9877.
//!
//! Storage locations (override with `EMOSIM_DATA_DIR`):
//! - Linux: ~/.local/share/emosim/
//! - Windows: %APPDATA%\emosim\
//! - MacOS: ~/Library/Application Support/emosim/

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use emosim::config::SimConfig;
use emosim::error::LoadError;
use emosim::simulation::TickOutcome;
use emosim::snapshot::LoadOutcome;
use emosim::storage::FileStore;
use emosim_models::{assemble, Assembled};

mod paths;
mod protocol;

use paths::AppPaths;
use protocol::{parse_request, DaemonState, Response};

const LISTEN_ADDR: &str = "127.0.0.1:9877";

async fn handle_client(
    stream: TcpStream,
    state: Arc<RwLock<DaemonState>>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let response: Response = match parse_request(&line) {
            Ok(request) => state.write().await.handle(request),
            Err(resp) => resp,
        };
        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

fn cold_start(state: &mut DaemonState) {
    match state.sim.cold_start_load() {
        Some(Ok(LoadOutcome::Loaded(report))) => {
            info!("Resumed from snapshot saved at {}", report.timestamp)
        }
        Some(Ok(LoadOutcome::NoSavedState)) | None => info!("Starting with fresh state"),
        Some(Err(LoadError::Corrupt(reason))) => {
            warn!("Saved snapshot is corrupt ({}); discarding it", reason);
            if let Err(e) = state.sim.clear_saved() {
                warn!("Could not remove corrupt snapshot: {}", e);
            }
        }
        Some(Err(e)) if e.is_critical() => error!("Cold-start load failed: {}", e),
        Some(Err(e)) => warn!("Could not load saved state: {}", e),
    }
}

fn seed_from_env() -> u64 {
    std::env::var("EMOSIM_SEED")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0x5EED)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let paths = AppPaths::new()?;
    info!("Data directory: {}", paths.data_dir().display());
    let cfg = match SimConfig::load_file(&paths.config_file()) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("Ignoring {}: {}", paths.config_file().display(), e);
            SimConfig::default()
        }
    }
    .with_env_overrides();
    let frame_millis = cfg.frame_millis();
    info!(
        "Persistence initialized ({}; key {})",
        paths.snapshot_dir().display(),
        cfg.storage_key
    );

    let store = FileStore::new(paths.snapshot_dir())?;
    let Assembled {
        simulation,
        history,
    } = assemble(cfg, Box::new(store), seed_from_env())?;

    let cancel = CancellationToken::new();
    let state = Arc::new(RwLock::new(DaemonState::new(
        simulation,
        history,
        cancel.clone(),
    )));

    {
        let mut s = state.write().await;
        cold_start(&mut s);
        if let Err(e) = s.sim.start() {
            warn!("Simulation not started: {}", e);
        }
    }

    // Ctrl-C triggers the same teardown as a Shutdown request.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
                cancel.cancel();
            }
        });
    }

    // Tick loop task
    let ticker = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_millis(frame_millis));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let mut s = state.write().await;
                if let TickOutcome::Halted(cause) = s.sim.tick() {
                    error!("Tick loop stopped: {}", cause);
                    break;
                }
            }
        })
    };

    let listener = TcpListener::bind(LISTEN_ADDR).await?;
    info!("emosim daemon listening on {}", LISTEN_ADDR);

    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        info!("Client connected: {}", addr);
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, state, cancel).await {
                error!("Client handler error: {}", e);
            }
        });
    }

    if let Err(e) = ticker.await {
        error!("Tick task ended abnormally: {}", e);
    }
    state.write().await.teardown();
    info!("emosim daemon stopped");
    Ok(())
}
