//! Small recurrent belief agent.
//!
//! One tanh belief layer fed by the state vector, graph features and its own
//! previous belief; a sigmoid read-out to emotions blended with the previous
//! emotions; a reward-modulated Hebbian update on the read-out weights.
//!
//! Everything that shapes future output (weights, belief, memory, scalar
//! parameters) is persisted by `get_state` and restored all-or-nothing by
//! `load_state`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

use emosim::collab::{Agent, AgentResponse, DerivedMetrics, GraphFeatures, StepContext};
use emosim::error::CollabError;
use emosim::state::mean_affinity;
use emosim::tensor::{Backend, Tensor};

use crate::prng::Prng;

const STATE_VERSION: u32 = 2;
const WEIGHT_LIMIT: f32 = 2.0;

/// Movement label per dominant emotion channel (see `text_impact::CHANNELS`).
const LABELS: [&str; 10] = [
    "bounce", "nod", "recoil", "tilt", "idle", "shake", "shake", "lean_in", "tilt", "idle",
];

#[derive(Debug, Clone)]
pub struct AgentParams {
    pub state_dim: usize,
    pub emotion_dim: usize,
    pub graph_dim: usize,
    pub belief_dim: usize,
    /// Belief vectors kept for affinity scoring.
    pub memory_len: usize,
    pub learning_rate: f32,
    /// Weight of the previous emotions in the blended output.
    pub inertia: f32,
    pub seed: u64,
}

impl AgentParams {
    pub fn new(state_dim: usize, emotion_dim: usize) -> Self {
        Self {
            state_dim,
            emotion_dim,
            graph_dim: crate::graph::FEATURE_COUNT,
            belief_dim: 8,
            memory_len: 16,
            learning_rate: 0.01,
            inertia: 0.3,
            seed: 0xB311EF,
        }
    }

    fn input_dim(&self) -> usize {
        self.state_dim + self.graph_dim
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Weights {
    w_in: Vec<Vec<f32>>,
    w_rec: Vec<Vec<f32>>,
    w_out: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

impl Weights {
    fn random(p: &AgentParams, rng: &mut Prng) -> Self {
        let mut matrix = |rows: usize, cols: usize| -> Vec<Vec<f32>> {
            let scale = 1.0 / (cols.max(1) as f32).sqrt();
            (0..rows)
                .map(|_| (0..cols).map(|_| rng.range_f32(-scale, scale)).collect())
                .collect()
        };
        let w_in = matrix(p.belief_dim, p.input_dim());
        let w_rec = matrix(p.belief_dim, p.belief_dim);
        let w_out = matrix(p.emotion_dim, p.belief_dim);
        Self {
            w_in,
            w_rec,
            w_out,
            bias: vec![0.0; p.belief_dim],
        }
    }

    fn check(&self, p: &AgentParams) -> Result<(), String> {
        fn shape_ok(m: &[Vec<f32>], rows: usize, cols: usize) -> bool {
            m.len() == rows && m.iter().all(|r| r.len() == cols)
        }
        if !shape_ok(&self.w_in, p.belief_dim, p.input_dim()) {
            return Err("wIn has the wrong shape".into());
        }
        if !shape_ok(&self.w_rec, p.belief_dim, p.belief_dim) {
            return Err("wRec has the wrong shape".into());
        }
        if !shape_ok(&self.w_out, p.emotion_dim, p.belief_dim) {
            return Err("wOut has the wrong shape".into());
        }
        if self.bias.len() != p.belief_dim {
            return Err("bias has the wrong length".into());
        }
        let all = self
            .w_in
            .iter()
            .chain(&self.w_rec)
            .chain(&self.w_out)
            .flatten()
            .chain(&self.bias);
        if all.into_iter().any(|v| !v.is_finite()) {
            return Err("weights contain non-finite values".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentState {
    version: u32,
    belief: Vec<f32>,
    prev_emotions: Vec<f32>,
    memory_buffer: Vec<Vec<f32>>,
    #[serde(rename = "lastRIH")]
    last_rih: f32,
    /// Mean affinity reported with the last response; absent before the first step.
    #[serde(default)]
    last_affinity: Option<f32>,
    latest_trust_score: f32,
    integration_param: f32,
    reflexivity_param: f32,
    self_state: Vec<f32>,
    weights: Weights,
}

pub struct BeliefAgent {
    backend: Backend,
    params: AgentParams,
    weights: Weights,
    belief: Vec<f32>,
    self_state: Vec<f32>,
    memory: VecDeque<Vec<f32>>,
    /// Agent-owned copy of the last emitted emotions.
    prev_emotions: Option<Tensor>,
    last_rih: f32,
    last_affinity: Option<f32>,
    trust: f32,
    integration: f32,
    reflexivity: f32,
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let d = norm(a) * norm(b);
    if d <= f32::EPSILON {
        0.0
    } else {
        (dot(a, b) / d).clamp(-1.0, 1.0)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl BeliefAgent {
    pub fn new(backend: Backend, params: AgentParams) -> Self {
        let mut rng = Prng::new(params.seed);
        let weights = Weights::random(&params, &mut rng);
        Self {
            backend,
            weights,
            belief: vec![0.0; params.belief_dim],
            self_state: vec![0.0; params.belief_dim],
            memory: VecDeque::with_capacity(params.memory_len),
            prev_emotions: None,
            last_rih: 0.0,
            last_affinity: None,
            trust: 0.5,
            integration: 0.5,
            reflexivity: 0.5,
            params,
        }
    }

    pub fn params(&self) -> &AgentParams {
        &self.params
    }

    pub fn belief(&self) -> &[f32] {
        &self.belief
    }

    fn prev_values(&self) -> Vec<f32> {
        self.prev_emotions
            .as_ref()
            .and_then(|t| t.to_vec().ok())
            .filter(|v| v.len() == self.params.emotion_dim)
            .unwrap_or_else(|| vec![0.0; self.params.emotion_dim])
    }

    fn affinities(&self, belief: &[f32]) -> Vec<f32> {
        self.memory.iter().map(|m| cosine(belief, m)).collect()
    }

    fn assemble_input(&self, state_vector: &[f32], graph: &GraphFeatures) -> Vec<f32> {
        let mut x = Vec::with_capacity(self.params.input_dim());
        x.extend(
            (0..self.params.state_dim).map(|i| state_vector.get(i).copied().unwrap_or(0.0)),
        );
        x.extend(
            (0..self.params.graph_dim).map(|i| graph.values.get(i).copied().unwrap_or(0.0)),
        );
        x
    }

    fn learn(&mut self, reward: f32, emotions: &[f32], belief: &[f32]) {
        let lr = self.params.learning_rate * reward.clamp(-1.0, 1.0);
        if lr == 0.0 {
            return;
        }
        for (row, e) in self.weights.w_out.iter_mut().zip(emotions) {
            for (w, b) in row.iter_mut().zip(belief) {
                *w = (*w + lr * (e - 0.5) * b).clamp(-WEIGHT_LIMIT, WEIGHT_LIMIT);
            }
        }
    }

    fn to_state(&self) -> AgentState {
        AgentState {
            version: STATE_VERSION,
            belief: self.belief.clone(),
            prev_emotions: self.prev_values(),
            memory_buffer: self.memory.iter().cloned().collect(),
            last_rih: self.last_rih,
            last_affinity: self.last_affinity,
            latest_trust_score: self.trust,
            integration_param: self.integration,
            reflexivity_param: self.reflexivity,
            self_state: self.self_state.clone(),
            weights: self.weights.clone(),
        }
    }

    fn check_state(&self, s: &AgentState) -> Result<(), String> {
        let p = &self.params;
        if s.version != STATE_VERSION {
            return Err(format!("agent state version {} is not supported", s.version));
        }
        if s.belief.len() != p.belief_dim || s.self_state.len() != p.belief_dim {
            return Err("belief dimension mismatch".into());
        }
        if s.prev_emotions.len() != p.emotion_dim {
            return Err(format!(
                "prevEmotions has {} values, expected {}",
                s.prev_emotions.len(),
                p.emotion_dim
            ));
        }
        if s.memory_buffer.iter().any(|m| m.len() != p.belief_dim) {
            return Err("memoryBuffer entry has the wrong length".into());
        }
        let scalars = [
            s.last_rih,
            s.last_affinity.unwrap_or(0.0),
            s.latest_trust_score,
            s.integration_param,
            s.reflexivity_param,
        ];
        let vectors = s
            .belief
            .iter()
            .chain(&s.self_state)
            .chain(&s.prev_emotions)
            .chain(s.memory_buffer.iter().flatten());
        if scalars.iter().chain(vectors).any(|v| !v.is_finite()) {
            return Err("agent state contains non-finite values".into());
        }
        s.weights.check(p)
    }
}

impl Agent for BeliefAgent {
    fn process(
        &mut self,
        state_vector: &[f32],
        graph: &GraphFeatures,
        ctx: StepContext<'_>,
    ) -> Result<AgentResponse, CollabError> {
        let x = self.assemble_input(state_vector, graph);
        let w = &self.weights;

        let pre: Vec<f32> = (0..self.params.belief_dim)
            .map(|j| dot(&w.w_in[j], &x) + dot(&w.w_rec[j], &self.belief) + w.bias[j])
            .collect();
        let belief: Vec<f32> = pre.iter().map(|v| v.tanh()).collect();

        let prev = self.prev_values();
        let inertia = self.params.inertia.clamp(0.0, 1.0);
        let emotions: Vec<f32> = w
            .w_out
            .iter()
            .zip(&prev)
            .map(|(row, p)| (1.0 - inertia) * sigmoid(dot(row, &belief)) + inertia * p)
            .collect();

        // Coherence of the new belief with the previous one.
        let rih = if norm(&self.belief) <= f32::EPSILON {
            0.0
        } else {
            (cosine(&belief, &self.belief) + 1.0) * 0.5
        };
        let affinities = self.affinities(&belief);

        let reward01 = ((ctx.reward.clamp(-1.0, 1.0)) + 1.0) * 0.5;
        let chat_boost = if ctx.event_type == Some("chat") { 0.05 } else { 0.0 };
        self.trust = (0.9 * self.trust + 0.1 * reward01 + chat_boost).clamp(0.0, 1.0);
        self.integration = 0.95 * self.integration + 0.05 * rih;
        for (s, b) in self.self_state.iter_mut().zip(&belief) {
            *s = 0.9 * *s + 0.1 * b;
        }
        let gap: f32 = self
            .self_state
            .iter()
            .zip(&belief)
            .map(|(s, b)| (s - b).abs())
            .sum::<f32>()
            / self.params.belief_dim.max(1) as f32;
        self.reflexivity = 0.9 * self.reflexivity + 0.1 * (1.0 - gap.min(1.0));

        self.learn(ctx.reward, &emotions, &belief);

        if self.memory.len() == self.params.memory_len.max(1) {
            self.memory.pop_front();
        }
        self.memory.push_back(belief.clone());
        self.last_rih = rih;
        self.last_affinity = Some(mean_affinity(&affinities));

        let dominant = emotions
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let hm_label = LABELS[dominant % LABELS.len()].to_string();

        let out = self.backend.row(&emotions)?;
        self.prev_emotions = Some(out.duplicate()?);
        self.belief = belief.clone();

        Ok(AgentResponse {
            emotions: out,
            rih_score: rih,
            trust_score: self.trust,
            affinities,
            hm_label,
            cascade_history: vec![x, pre, belief, emotions],
            integration: self.integration,
            reflexivity: self.reflexivity,
            belief_norm: Some(norm(&self.belief)),
            self_state_norm: Some(norm(&self.self_state)),
        })
    }

    fn get_state(&self) -> Result<Value, CollabError> {
        let state = self.to_state();
        self.check_state(&state).map_err(CollabError::invalid)?;
        Ok(serde_json::to_value(state)?)
    }

    fn load_state(&mut self, snapshot: &Value) -> Result<(), CollabError> {
        let s: AgentState = serde_json::from_value(snapshot.clone())?;
        self.check_state(&s).map_err(CollabError::invalid)?;
        let prev = self.backend.row(&s.prev_emotions)?;

        self.weights = s.weights;
        self.belief = s.belief;
        self.self_state = s.self_state;
        self.memory = s.memory_buffer.into_iter().collect();
        while self.memory.len() > self.params.memory_len.max(1) {
            self.memory.pop_front();
        }
        self.prev_emotions = Some(prev);
        self.last_rih = s.last_rih;
        self.last_affinity = s.last_affinity;
        self.trust = s.latest_trust_score;
        self.integration = s.integration_param;
        self.reflexivity = s.reflexivity_param;
        Ok(())
    }

    fn prev_emotions(&self) -> Option<&Tensor> {
        self.prev_emotions.as_ref()
    }

    fn derived_metrics(&self) -> DerivedMetrics {
        DerivedMetrics {
            rih_score: Some(self.last_rih),
            trust_score: Some(self.trust),
            avg_affinity: self.last_affinity,
            integration_param: Some(self.integration),
            reflexivity_param: Some(self.reflexivity),
            belief_norm: Some(norm(&self.belief)),
            self_state_norm: Some(norm(&self.self_state)),
        }
    }

    fn latest_belief_embedding(&self) -> Option<Tensor> {
        self.backend.row(&self.belief).ok()
    }

    fn cleanup(&mut self) {
        self.prev_emotions = None;
        self.memory.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> (Backend, BeliefAgent) {
        let backend = Backend::new();
        let agent = BeliefAgent::new(backend.clone(), AgentParams::new(6, 4));
        (backend, agent)
    }

    fn ctx(reward: f32) -> StepContext<'static> {
        StepContext {
            event_type: None,
            reward,
        }
    }

    fn feed(agent: &mut BeliefAgent, steps: usize) -> AgentResponse {
        let graph = GraphFeatures::default();
        let mut last = None;
        for i in 0..steps {
            let s: Vec<f32> = (0..6).map(|k| ((i + k) as f32 * 0.3).sin()).collect();
            last = Some(agent.process(&s, &graph, ctx(0.5)).unwrap());
        }
        last.unwrap()
    }

    #[test]
    fn response_is_well_formed() {
        let (backend, mut agent) = agent();
        let r = feed(&mut agent, 3);
        assert_eq!(r.emotions.shape(), [1, 4]);
        assert!(r.emotions.to_vec().unwrap().iter().all(|v| (0.0..=1.0).contains(v)));
        assert!((0.0..=1.0).contains(&r.rih_score));
        assert_eq!(r.affinities.len(), 2);
        assert_eq!(r.cascade_history.len(), 4);
        assert!(r.belief_norm.unwrap() > 0.0);
        // Response tensor plus the agent's own previous-emotions copy.
        assert_eq!(backend.stats().live, 2);
    }

    #[test]
    fn prev_emotions_survive_disposal_of_the_response() {
        let (_, mut agent) = agent();
        let r = feed(&mut agent, 2);
        let values = r.emotions.to_vec().unwrap();
        drop(r);
        let prev = agent.prev_emotions().unwrap();
        assert!(!prev.is_disposed());
        assert_eq!(prev.to_vec().unwrap(), values);
    }

    #[test]
    fn restored_agent_continues_identically() {
        let (_, mut a) = agent();
        feed(&mut a, 5);
        let saved = a.get_state().unwrap();
        assert!(saved["lastRIH"].is_number());
        assert!(saved["weights"]["wOut"].is_array());

        let params = AgentParams {
            seed: 99,
            ..AgentParams::new(6, 4)
        };
        let mut b = BeliefAgent::new(Backend::new(), params);
        b.load_state(&saved).unwrap();
        assert_eq!(b.get_state().unwrap(), saved);

        let s = vec![0.2; 6];
        let graph = GraphFeatures::default();
        let x = a.process(&s, &graph, ctx(0.1)).unwrap();
        let y = b.process(&s, &graph, ctx(0.1)).unwrap();
        assert_eq!(x.emotions.to_vec().unwrap(), y.emotions.to_vec().unwrap());
        assert_eq!(x.rih_score, y.rih_score);
    }

    #[test]
    fn rejected_load_leaves_agent_untouched() {
        let (_, mut a) = agent();
        feed(&mut a, 3);
        let before = a.get_state().unwrap();
        let mut bad = before.clone();
        bad["weights"]["wOut"][0][0] = serde_json::json!(null);
        assert!(a.load_state(&bad).is_err());
        let mut short = before.clone();
        short["prevEmotions"] = serde_json::json!([0.1]);
        assert!(a.load_state(&short).is_err());
        assert_eq!(a.get_state().unwrap(), before);
    }

    #[test]
    fn derived_metrics_cover_every_scalar_after_some_steps() {
        let (_, mut a) = agent();
        assert!(a.derived_metrics().avg_affinity.is_none());
        let r = feed(&mut a, 4);
        let m = a.derived_metrics();
        assert_eq!(m.rih_score, Some(r.rih_score));
        assert_eq!(m.avg_affinity, Some(mean_affinity(&r.affinities)));
        assert!(m.trust_score.unwrap() > 0.5);
    }

    #[test]
    fn reported_affinity_survives_a_state_round_trip() {
        let (_, mut a) = agent();
        let r = feed(&mut a, 6);
        let saved = a.get_state().unwrap();
        assert!(saved["lastAffinity"].is_number());

        let mut b = BeliefAgent::new(Backend::new(), AgentParams::new(6, 4));
        b.load_state(&saved).unwrap();
        let restored = b.derived_metrics().avg_affinity.unwrap();
        assert!((restored - mean_affinity(&r.affinities)).abs() < 1e-6);
    }

    #[test]
    fn embedding_is_a_caller_owned_copy() {
        let (backend, mut a) = agent();
        feed(&mut a, 1);
        let live = backend.stats().live;
        let emb = a.latest_belief_embedding().unwrap();
        assert_eq!(emb.to_vec().unwrap(), a.belief());
        drop(emb);
        assert_eq!(backend.stats().live, live);
    }
}
