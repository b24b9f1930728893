//! Versioned snapshots and the save/load state machine.
//!
//! Format (JSON, one value under the configured storage key):
//!
//! ```text
//! { version, timestamp, environment, agent,
//!   metrics: { rih, affinity, trust, context, intParam, refParam } }
//! ```
//!
//! `environment` and `agent` are opaque to the core. The version tag is
//! compared for exact equality; there is no migration path.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::collab::check_opaque_state;
use crate::error::{LoadError, LoadStage, SaveError};
use crate::simulation::{Phase, Simulation};
use crate::state::{HmLabel, Metrics};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetrics {
    pub rih: f32,
    pub affinity: f32,
    pub trust: f32,
    #[serde(default)]
    pub context: String,
    #[serde(rename = "intParam")]
    pub int_param: f32,
    #[serde(rename = "refParam")]
    pub ref_param: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub timestamp: String,
    pub environment: Value,
    pub agent: Value,
    pub metrics: SnapshotMetrics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaveReport {
    pub key: String,
    pub timestamp: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub timestamp: String,
    /// Emotions came from the agent's restored previous emotions.
    pub emotions_from_agent: bool,
    /// Metric names recomputed from the collaborators.
    pub recomputed: Vec<&'static str>,
    /// Metric names taken from the snapshot's `metrics` block.
    pub from_snapshot: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(LoadReport),
    /// Nothing has been saved under the configured key.
    NoSavedState,
}

/// Parse raw snapshot text, gating on the exact version tag before the shape.
pub fn parse_snapshot(raw: &str, expected_version: &str) -> Result<Snapshot, LoadError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| LoadError::Corrupt(format!("not JSON: {e}")))?;
    let found = value
        .get("version")
        .and_then(Value::as_str)
        .ok_or_else(|| LoadError::Corrupt("missing version tag".into()))?;
    if found != expected_version {
        return Err(LoadError::IncompatibleVersion {
            found: found.to_string(),
            expected: expected_version.to_string(),
        });
    }
    let snapshot: Snapshot = serde_json::from_value(value)
        .map_err(|e| LoadError::Corrupt(format!("unexpected snapshot shape: {e}")))?;
    check_opaque_state(&snapshot.environment)
        .map_err(|e| LoadError::Corrupt(format!("environment {e}")))?;
    check_opaque_state(&snapshot.agent).map_err(|e| LoadError::Corrupt(format!("agent {e}")))?;
    Ok(snapshot)
}

fn pick(
    name: &'static str,
    live: Option<f32>,
    fallback: f32,
    recomputed: &mut Vec<&'static str>,
    from_snapshot: &mut Vec<&'static str>,
) -> f32 {
    match live.filter(|v| v.is_finite()) {
        Some(v) => {
            recomputed.push(name);
            v
        }
        None => {
            from_snapshot.push(name);
            fallback
        }
    }
}

impl Simulation {
    /// Persist environment and agent state as one snapshot.
    pub fn save(&self) -> Result<SaveReport, SaveError> {
        if matches!(self.phase, Phase::Halted | Phase::Stopped) {
            return Err(SaveError::NotReady("simulation is not running"));
        }
        let env = self
            .environment
            .as_deref()
            .ok_or(SaveError::NotReady("environment not attached"))?;
        let agent = self
            .agent
            .as_deref()
            .ok_or(SaveError::NotReady("agent not attached"))?;

        let environment = env
            .get_state()
            .map_err(|e| SaveError::InvalidState(format!("environment: {e}")))?;
        check_opaque_state(&environment)
            .map_err(|e| SaveError::InvalidState(format!("environment {e}")))?;
        let agent_state = agent
            .get_state()
            .map_err(|e| SaveError::InvalidState(format!("agent: {e}")))?;
        check_opaque_state(&agent_state)
            .map_err(|e| SaveError::InvalidState(format!("agent {e}")))?;

        let m = self.state.metrics.sanitized();
        let snapshot = Snapshot {
            version: self.cfg.snapshot_version.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            environment,
            agent: agent_state,
            metrics: SnapshotMetrics {
                rih: m.rih_score,
                affinity: m.avg_affinity,
                trust: m.trust_score,
                context: self.state.context.clone(),
                int_param: m.integration_param,
                ref_param: m.reflexivity_param,
            },
        };

        let raw = serde_json::to_string(&snapshot)?;
        self.store.set(&self.cfg.storage_key, &raw)?;
        info!(
            "Saved snapshot {} ({} bytes) under {}",
            snapshot.version,
            raw.len(),
            self.cfg.storage_key
        );
        Ok(SaveReport {
            key: self.cfg.storage_key.clone(),
            timestamp: snapshot.timestamp,
            bytes: raw.len(),
        })
    }

    /// Restore the saved snapshot. The loop is paused for the duration and only
    /// resumes after a successful load; on failure it stays paused.
    pub fn load(&mut self) -> Result<LoadOutcome, LoadError> {
        if matches!(self.phase, Phase::Halted | Phase::Stopped) {
            return Err(LoadError::NotReady("simulation is not running"));
        }
        if !self.collaborators_ready() {
            return Err(LoadError::NotReady("collaborators not attached"));
        }

        let resume_to = match self.phase {
            Phase::Stepping => Phase::Ready,
            other => other,
        };
        self.phase = Phase::Paused;

        let result = self.load_paused();
        match &result {
            Ok(LoadOutcome::Loaded(report)) => {
                self.phase = resume_to;
                info!("Loaded snapshot saved at {}", report.timestamp);
            }
            Ok(LoadOutcome::NoSavedState) => {
                self.phase = resume_to;
                info!("No saved state under {}", self.cfg.storage_key);
            }
            Err(e) if e.is_critical() => {
                error!("Load failed mid-restore: {}", e);
                self.status = Some(format!("Critical: {e}"));
            }
            Err(e) => {
                warn!("Load aborted before touching live state: {}", e);
                self.status = Some(format!("Load failed: {e}"));
            }
        }
        result
    }

    fn load_paused(&mut self) -> Result<LoadOutcome, LoadError> {
        // Stage 1: read and validate; nothing live is touched until this passes.
        let Some(raw) = self.store.get(&self.cfg.storage_key)? else {
            return Ok(LoadOutcome::NoSavedState);
        };
        let snapshot = parse_snapshot(&raw, &self.cfg.snapshot_version)?;

        let (Some(env), Some(agent)) = (self.environment.as_deref_mut(), self.agent.as_deref_mut())
        else {
            return Err(LoadError::NotReady("collaborators not attached"));
        };

        // Stage 2: mutate. Any failure from here on is partial.
        env.load_state(&snapshot.environment)
            .map_err(|e| LoadError::PartialLoadFailure {
                stage: LoadStage::Environment,
                message: e.to_string(),
            })?;
        agent
            .load_state(&snapshot.agent)
            .map_err(|e| LoadError::PartialLoadFailure {
                stage: LoadStage::Agent,
                message: e.to_string(),
            })?;

        let emotion_shape = self.cfg.emotion_shape();
        let restored = agent
            .prev_emotions()
            .filter(|t| !t.is_disposed() && t.shape() == emotion_shape)
            .and_then(|t| t.duplicate().ok());
        let emotions_from_agent = restored.is_some();
        let emotions = match restored {
            Some(t) => t,
            None => self.backend.zeros(emotion_shape).map_err(|e| {
                LoadError::PartialLoadFailure {
                    stage: LoadStage::Emotions,
                    message: e.to_string(),
                }
            })?,
        };
        self.state.emotions.replace(emotions);

        let derived = agent.derived_metrics();
        let saved = &snapshot.metrics;
        let mut recomputed = Vec::new();
        let mut from_snapshot = Vec::new();
        let metrics = Metrics {
            rih_score: pick("rih", derived.rih_score, saved.rih, &mut recomputed, &mut from_snapshot),
            avg_affinity: pick(
                "affinity",
                derived.avg_affinity,
                saved.affinity,
                &mut recomputed,
                &mut from_snapshot,
            ),
            trust_score: pick(
                "trust",
                derived.trust_score,
                saved.trust,
                &mut recomputed,
                &mut from_snapshot,
            ),
            integration_param: pick(
                "intParam",
                derived.integration_param,
                saved.int_param,
                &mut recomputed,
                &mut from_snapshot,
            ),
            reflexivity_param: pick(
                "refParam",
                derived.reflexivity_param,
                saved.ref_param,
                &mut recomputed,
                &mut from_snapshot,
            ),
            belief_norm: derived.belief_norm.unwrap_or(0.0),
            self_state_norm: derived.self_state_norm.unwrap_or(0.0),
        };

        let s = &mut self.state;
        s.metrics = metrics.sanitized();
        s.hm_label = HmLabel::Idle;
        s.cascade_history.clear();
        s.last_event_type = None;
        s.context = if saved.context.trim().is_empty() {
            "State loaded".to_string()
        } else {
            saved.context.clone()
        };

        Ok(LoadOutcome::Loaded(LoadReport {
            timestamp: snapshot.timestamp,
            emotions_from_agent,
            recomputed,
            from_snapshot,
        }))
    }

    /// Single load attempt allowed at process start. Later calls return `None`.
    pub fn cold_start_load(&mut self) -> Option<Result<LoadOutcome, LoadError>> {
        if self.cold_start_attempted {
            return None;
        }
        self.cold_start_attempted = true;
        Some(self.load())
    }

    /// Drop the stored snapshot (e.g. after it was found corrupt).
    pub fn clear_saved(&self) -> Result<(), SaveError> {
        self.store.remove(&self.cfg.storage_key)?;
        info!("Cleared saved snapshot {}", self.cfg.storage_key);
        Ok(())
    }
}
