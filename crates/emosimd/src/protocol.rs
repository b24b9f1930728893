//! JSON-lines control protocol and the request handler.
//!
//! One request per line, one response per line. Requests are tagged by `type`:
//!
//! ```text
//! {"type":"GetState"}
//! {"type":"Chat","text":"hello there"}
//! ```

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::info;

use emosim::observer::{MetricsHistory, MetricsSample};
use emosim::simulation::{Phase, Simulation, TickStats};
use emosim::snapshot::LoadOutcome;
use emosim::state::StateView;

fn default_history_limit() -> usize {
    64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    GetState,
    /// Recent chart samples, newest last.
    GetHistory {
        #[serde(default = "default_history_limit")]
        limit: usize,
    },
    Start,
    /// Pause the loop; the daemon keeps serving.
    Stop,
    Save,
    Load,
    Chat {
        text: String,
    },
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
#[allow(clippy::large_enum_variant)]
pub enum Response {
    State {
        phase: Phase,
        controls_enabled: bool,
        status: Option<String>,
        view: StateView,
        stats: TickStats,
    },
    History {
        samples: Vec<MetricsSample>,
    },
    Success {
        message: String,
    },
    Error {
        message: String,
    },
}

impl Response {
    fn ok(message: impl Into<String>) -> Self {
        Self::Success {
            message: message.into(),
        }
    }

    fn err(message: impl std::fmt::Display) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}

pub struct DaemonState {
    pub sim: Simulation,
    pub history: Arc<Mutex<MetricsHistory>>,
    pub cancel: CancellationToken,
}

impl DaemonState {
    pub fn new(
        sim: Simulation,
        history: Arc<Mutex<MetricsHistory>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sim,
            history,
            cancel,
        }
    }

    pub fn handle(&mut self, request: Request) -> Response {
        match request {
            Request::GetState => Response::State {
                phase: self.sim.phase(),
                controls_enabled: self.sim.controls_enabled(),
                status: self.sim.status().map(str::to_string),
                view: self.sim.view(),
                stats: self.sim.stats(),
            },
            Request::GetHistory { limit } => {
                let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
                let samples = history.to_vec();
                let skip = samples.len().saturating_sub(limit);
                Response::History {
                    samples: samples.into_iter().skip(skip).collect(),
                }
            }
            Request::Start => match self.sim.start() {
                Ok(()) => Response::ok("Simulation running"),
                Err(e) => Response::err(e),
            },
            Request::Stop => {
                self.sim.pause();
                Response::ok("Simulation paused")
            }
            Request::Save => match self.sim.save() {
                Ok(report) => Response::ok(format!(
                    "State saved ({} bytes at {})",
                    report.bytes, report.timestamp
                )),
                Err(e) => Response::err(e),
            },
            Request::Load => match self.sim.load() {
                Ok(LoadOutcome::Loaded(report)) => {
                    Response::ok(format!("State loaded (saved {})", report.timestamp))
                }
                Ok(LoadOutcome::NoSavedState) => Response::ok("No saved state"),
                Err(e) => Response::err(e),
            },
            Request::Chat { text } => match self.sim.submit_text(&text) {
                Ok(true) => Response::ok("Message queued"),
                Ok(false) => Response::ok("Empty message ignored"),
                Err(e) => Response::err(e),
            },
            Request::Shutdown => {
                info!("Shutdown requested");
                self.cancel.cancel();
                Response::ok("Shutting down")
            }
        }
    }

    /// Release collaborators and tensors. Snapshots are only written by an
    /// explicit `Save`. Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.sim.phase() != Phase::Stopped {
            info!("Tearing down simulation at frame {}", self.sim.state().frame);
        }
        self.sim.shutdown();
    }
}

pub fn parse_request(line: &str) -> Result<Request, Response> {
    serde_json::from_str(line).map_err(|e| Response::err(format!("Invalid request: {e}")))
}
