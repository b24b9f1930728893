use serde::{Deserialize, Serialize};

use crate::tensor::{SlotStats, Tensor, TensorId, TensorSlot};

/// Avatar movement labels the agent can request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HmLabel {
    #[default]
    Idle,
    Nod,
    Shake,
    Tilt,
    LeanIn,
    Recoil,
    Wave,
    Bounce,
}

impl HmLabel {
    pub const ALL: [HmLabel; 8] = [
        Self::Idle,
        Self::Nod,
        Self::Shake,
        Self::Tilt,
        Self::LeanIn,
        Self::Recoil,
        Self::Wave,
        Self::Bounce,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" | "" => Some(Self::Idle),
            "nod" => Some(Self::Nod),
            "shake" => Some(Self::Shake),
            "tilt" => Some(Self::Tilt),
            "lean_in" | "lean-in" | "leanin" => Some(Self::LeanIn),
            "recoil" => Some(Self::Recoil),
            "wave" => Some(Self::Wave),
            "bounce" => Some(Self::Bounce),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Nod => "nod",
            Self::Shake => "shake",
            Self::Tilt => "tilt",
            Self::LeanIn => "lean_in",
            Self::Recoil => "recoil",
            Self::Wave => "wave",
            Self::Bounce => "bounce",
        }
    }
}

/// Scalar metrics surfaced to sinks every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub rih_score: f32,
    pub avg_affinity: f32,
    pub trust_score: f32,
    pub belief_norm: f32,
    pub self_state_norm: f32,
    pub integration_param: f32,
    pub reflexivity_param: f32,
}

fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

impl Metrics {
    /// Coerce every field into its documented range. Non-finite values become 0.
    pub fn sanitized(self) -> Self {
        Self {
            rih_score: finite_or_zero(self.rih_score).clamp(0.0, 1.0),
            avg_affinity: finite_or_zero(self.avg_affinity).clamp(-1.0, 1.0),
            trust_score: finite_or_zero(self.trust_score).clamp(0.0, 1.0),
            belief_norm: finite_or_zero(self.belief_norm).max(0.0),
            self_state_norm: finite_or_zero(self.self_state_norm).max(0.0),
            integration_param: finite_or_zero(self.integration_param),
            reflexivity_param: finite_or_zero(self.reflexivity_param),
        }
    }
}

/// Pad with zeros or truncate so the vector is exactly `dim` long.
pub fn normalize_state_vector(mut values: Vec<f32>, dim: usize) -> Vec<f32> {
    values.resize(dim, 0.0);
    for v in values.iter_mut() {
        *v = finite_or_zero(*v);
    }
    values
}

/// Mean of the agent's affinities, 0 when there are none.
pub fn mean_affinity(affinities: &[f32]) -> f32 {
    let finite: Vec<f32> = affinities.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return 0.0;
    }
    finite.iter().sum::<f32>() / finite.len() as f32
}

pub const DEFAULT_CONTEXT: &str = "Initializing";

/// The canonical simulation record. Only the core mutates it.
#[derive(Debug)]
pub struct SimulationState {
    pub state_vector: Vec<f32>,
    pub(crate) emotions: TensorSlot,
    pub metrics: Metrics,
    pub hm_label: HmLabel,
    pub context: String,
    pub cascade_history: Vec<Vec<f32>>,
    pub frame: u64,
    pub episode: u64,
    pub last_reward: f32,
    pub last_event_type: Option<String>,
}

impl SimulationState {
    pub fn new(base_state_dim: usize, emotions: Tensor) -> Self {
        Self {
            state_vector: vec![0.0; base_state_dim],
            emotions: TensorSlot::new(emotions),
            metrics: Metrics::default(),
            hm_label: HmLabel::Idle,
            context: DEFAULT_CONTEXT.to_string(),
            cascade_history: Vec::new(),
            frame: 0,
            episode: 0,
            last_reward: 0.0,
            last_event_type: None,
        }
    }

    /// Canonical emotions tensor, if the slot is occupied.
    pub fn emotions(&self) -> Option<&Tensor> {
        self.emotions.get()
    }

    pub fn emotions_live(&self) -> bool {
        self.emotions.is_live()
    }

    pub fn emotion_stats(&self) -> SlotStats {
        self.emotions.stats()
    }

    /// Plain-data copy of everything observable, for comparison and display.
    pub fn view(&self) -> StateView {
        let canonical = self.emotions.get();
        StateView {
            frame: self.frame,
            episode: self.episode,
            state_vector: self.state_vector.clone(),
            emotions: canonical.and_then(|t| t.to_vec().ok()).unwrap_or_default(),
            emotions_id: canonical.map(Tensor::id),
            metrics: self.metrics.sanitized(),
            hm_label: self.hm_label,
            context: self.context.clone(),
            cascade_history: self.cascade_history.clone(),
            last_reward: finite_or_zero(self.last_reward),
            last_event_type: self.last_event_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateView {
    pub frame: u64,
    pub episode: u64,
    pub state_vector: Vec<f32>,
    pub emotions: Vec<f32>,
    pub emotions_id: Option<TensorId>,
    pub metrics: Metrics,
    pub hm_label: HmLabel,
    pub context: String,
    pub cascade_history: Vec<Vec<f32>>,
    pub last_reward: f32,
    #[serde(default)]
    pub last_event_type: Option<String>,
}
