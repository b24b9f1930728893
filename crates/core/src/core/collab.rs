//! Contracts for the collaborators the core drives each tick.
//!
//! Collaborators hand tensors across this boundary by value: whatever a call
//! returns is owned by the caller from then on. The core validates every
//! response once, here, before anything in the tick body reads it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CollabError, StepError};
use crate::state::{normalize_state_vector, SimulationState};
use crate::tensor::{Shape, Tensor};

/// Result of one environment step.
#[derive(Debug)]
pub struct EnvStep {
    pub state: Tensor,
    pub reward: f32,
    pub done: bool,
    pub context: String,
    pub event_type: Option<String>,
}

/// Deferred event queued on the environment between ticks (e.g. from chat).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub kind: String,
    pub impact: Vec<f32>,
    #[serde(default)]
    pub note: String,
}

pub trait Environment: Send + Sync {
    /// Start a new episode; returns the initial state tensor.
    fn reset(&mut self) -> Result<Tensor, CollabError>;

    fn step(
        &mut self,
        emotions: &Tensor,
        rih_score: f32,
        avg_affinity: f32,
    ) -> Result<EnvStep, CollabError>;

    fn get_state(&self) -> Result<Value, CollabError>;

    fn load_state(&mut self, snapshot: &Value) -> Result<(), CollabError>;

    /// Caller-owned impact tensor for a piece of user text.
    fn emotional_impact_from_text(&mut self, text: &str) -> Result<Tensor, CollabError>;

    /// Schedule an event to be folded into the next `step`.
    fn queue_event(&mut self, event: QueuedEvent);

    fn cleanup(&mut self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StepContext<'a> {
    pub event_type: Option<&'a str>,
    pub reward: f32,
}

#[derive(Debug)]
pub struct AgentResponse {
    pub emotions: Tensor,
    pub rih_score: f32,
    pub trust_score: f32,
    pub affinities: Vec<f32>,
    pub hm_label: String,
    pub cascade_history: Vec<Vec<f32>>,
    pub integration: f32,
    pub reflexivity: f32,
    pub belief_norm: Option<f32>,
    pub self_state_norm: Option<f32>,
}

/// Scalars an agent can recompute from its own (possibly just restored) state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DerivedMetrics {
    pub rih_score: Option<f32>,
    pub trust_score: Option<f32>,
    pub avg_affinity: Option<f32>,
    pub integration_param: Option<f32>,
    pub reflexivity_param: Option<f32>,
    pub belief_norm: Option<f32>,
    pub self_state_norm: Option<f32>,
}

pub trait Agent: Send + Sync {
    fn process(
        &mut self,
        state_vector: &[f32],
        graph: &GraphFeatures,
        ctx: StepContext<'_>,
    ) -> Result<AgentResponse, CollabError>;

    fn get_state(&self) -> Result<Value, CollabError>;

    fn load_state(&mut self, snapshot: &Value) -> Result<(), CollabError>;

    /// The agent's own copy of its last emitted emotions. Borrowed; callers clone.
    fn prev_emotions(&self) -> Option<&Tensor>;

    fn derived_metrics(&self) -> DerivedMetrics;

    /// Caller-owned copy of the current belief embedding.
    fn latest_belief_embedding(&self) -> Option<Tensor>;

    fn cleanup(&mut self) {}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphFeatures {
    pub values: Vec<f32>,
}

/// Computes auxiliary graph features the agent consumes alongside the state vector.
pub trait GraphFeatureSource: Send + Sync {
    fn features(
        &mut self,
        state: &SimulationState,
        emotions: &[f32],
    ) -> Result<GraphFeatures, CollabError>;
}

/// Feature source for setups without a graph collaborator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGraph;

impl GraphFeatureSource for NoGraph {
    fn features(&mut self, _: &SimulationState, _: &[f32]) -> Result<GraphFeatures, CollabError> {
        Ok(GraphFeatures::default())
    }
}

/// Environment output after boundary checks. The state tensor has already been
/// read and released.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEnvStep {
    pub state_vector: Vec<f32>,
    pub reward: f32,
    pub done: bool,
    pub context: String,
    pub event_type: Option<String>,
}

pub fn validate_env_step(step: EnvStep, base_state_dim: usize) -> Result<ValidatedEnvStep, StepError> {
    let EnvStep {
        state,
        reward,
        done,
        context,
        event_type,
    } = step;

    if state.is_disposed() {
        return Err(StepError::StepFailure(
            "environment returned a disposed state tensor".into(),
        ));
    }
    let [rows, cols] = state.shape();
    if rows != 1 || cols == 0 {
        return Err(StepError::StepFailure(format!(
            "environment state tensor has shape {:?}, expected [1, n]",
            state.shape()
        )));
    }
    let raw = state.to_vec()?;
    // Per-call transient; never retained past this read.
    state.dispose();
    drop(state);

    if raw.len() != base_state_dim {
        tracing::debug!(
            "normalizing environment state vector from {} to {} values",
            raw.len(),
            base_state_dim
        );
    }

    Ok(ValidatedEnvStep {
        state_vector: normalize_state_vector(raw, base_state_dim),
        reward: if reward.is_finite() { reward } else { 0.0 },
        done,
        context,
        event_type: event_type.filter(|e| !e.trim().is_empty()),
    })
}

/// Reject a response whose emotions tensor is unusable. The tensor is released
/// on the error path because the caller owns it.
pub fn validate_agent_response(
    response: AgentResponse,
    emotion_shape: Shape,
) -> Result<AgentResponse, StepError> {
    if response.emotions.is_disposed() {
        return Err(StepError::StepFailure(
            "agent returned a disposed emotions tensor".into(),
        ));
    }
    if response.emotions.shape() != emotion_shape {
        let got = response.emotions.shape();
        response.emotions.dispose();
        return Err(StepError::StepFailure(format!(
            "agent emotions tensor has shape {got:?}, expected {emotion_shape:?}"
        )));
    }
    Ok(response)
}

/// Opaque collaborator state must be non-null and carry no `error` field.
pub fn check_opaque_state(value: &Value) -> Result<(), String> {
    if value.is_null() {
        return Err("state is null".into());
    }
    if let Some(obj) = value.as_object() {
        if let Some(err) = obj.get("error") {
            return Err(format!("state carries an error field: {err}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Backend;
    use serde_json::json;

    fn env_step(backend: &Backend, values: &[f32]) -> EnvStep {
        EnvStep {
            state: backend.row(values).unwrap(),
            reward: 0.25,
            done: false,
            context: "calm".into(),
            event_type: Some(" ".into()),
        }
    }

    #[test]
    fn env_step_is_normalized_and_released() {
        let backend = Backend::new();
        let v = validate_env_step(env_step(&backend, &[1.0, 2.0, 3.0]), 5).unwrap();
        assert_eq!(v.state_vector, vec![1.0, 2.0, 3.0, 0.0, 0.0]);
        assert_eq!(v.event_type, None);
        assert_eq!(backend.stats().live, 0);
    }

    #[test]
    fn env_step_with_matrix_state_is_rejected() {
        let backend = Backend::new();
        let step = EnvStep {
            state: backend.zeros([2, 3]).unwrap(),
            reward: 0.0,
            done: false,
            context: String::new(),
            event_type: None,
        };
        assert!(matches!(
            validate_env_step(step, 6),
            Err(StepError::StepFailure(_))
        ));
        assert_eq!(backend.stats().live, 0);
    }

    #[test]
    fn wrong_emotion_shape_is_rejected_and_released() {
        let backend = Backend::new();
        let response = AgentResponse {
            emotions: backend.zeros([1, 3]).unwrap(),
            rih_score: 0.0,
            trust_score: 0.0,
            affinities: vec![],
            hm_label: "idle".into(),
            cascade_history: vec![],
            integration: 0.0,
            reflexivity: 0.0,
            belief_norm: None,
            self_state_norm: None,
        };
        assert!(validate_agent_response(response, [1, 4]).is_err());
        assert_eq!(backend.stats().live, 0);
    }

    #[test]
    fn opaque_state_checks() {
        assert!(check_opaque_state(&Value::Null).is_err());
        assert!(check_opaque_state(&json!({ "error": "nan weights" })).is_err());
        assert!(check_opaque_state(&json!({ "weights": [1, 2] })).is_ok());
    }
}
