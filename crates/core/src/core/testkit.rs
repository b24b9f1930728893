//! Scripted collaborators for unit tests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::collab::{
    Agent, AgentResponse, DerivedMetrics, EnvStep, Environment, GraphFeatures, QueuedEvent,
    StepContext,
};
use crate::config::SimConfig;
use crate::error::CollabError;
use crate::observer::{FrameSink, FrameView, SinkError};
use crate::simulation::Simulation;
use crate::state::Metrics;
use crate::storage::{MemoryStore, SnapshotStore};
use crate::tensor::{Backend, Tensor, TensorError};

#[derive(Debug, Default)]
struct ProbeData {
    agent_inputs: Vec<Vec<f32>>,
    queued: Vec<QueuedEvent>,
    env_resets: u32,
    env_loads: u32,
    agent_loads: u32,
    cleanups: u32,
}

/// Shared view into what the scripted collaborators were asked to do.
#[derive(Debug, Clone, Default)]
pub struct Probes(Arc<Mutex<ProbeData>>);

impl Probes {
    fn with<T>(&self, f: impl FnOnce(&mut ProbeData) -> T) -> T {
        f(&mut self.0.lock().unwrap())
    }

    pub fn agent_inputs(&self) -> Vec<Vec<f32>> {
        self.with(|p| p.agent_inputs.clone())
    }

    pub fn queued_events(&self) -> Vec<QueuedEvent> {
        self.with(|p| p.queued.clone())
    }

    pub fn env_resets(&self) -> u32 {
        self.with(|p| p.env_resets)
    }

    pub fn env_loads(&self) -> u32 {
        self.with(|p| p.env_loads)
    }

    pub fn agent_loads(&self) -> u32 {
        self.with(|p| p.agent_loads)
    }

    pub fn cleanups(&self) -> u32 {
        self.with(|p| p.cleanups)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnvScript {
    /// Length of the emitted state row; defaults to the configured dimension.
    pub state_len: Option<usize>,
    /// 1-based step numbers that fail.
    pub fail_on: Vec<u32>,
    pub done_on: Vec<u32>,
    pub fail_load: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptedEnvState {
    pub steps: u32,
    pub level: f32,
}

pub struct ScriptedEnvironment {
    backend: Backend,
    script: EnvScript,
    dim: usize,
    state: ScriptedEnvState,
    probes: Probes,
}

impl Environment for ScriptedEnvironment {
    fn reset(&mut self) -> Result<Tensor, CollabError> {
        self.probes.with(|p| p.env_resets += 1);
        self.state.level = 0.0;
        Ok(self.backend.zeros([1, self.dim])?)
    }

    fn step(&mut self, emotions: &Tensor, rih: f32, _aff: f32) -> Result<EnvStep, CollabError> {
        self.state.steps += 1;
        let n = self.state.steps;
        if self.script.fail_on.contains(&n) {
            return Err(CollabError::invalid("scripted environment failure"));
        }
        let e = emotions.to_vec()?;
        self.state.level += 0.1 + rih * 0.01;
        let len = self.script.state_len.unwrap_or(self.dim);
        let values: Vec<f32> = (0..len)
            .map(|i| self.state.level + e.get(i % e.len().max(1)).copied().unwrap_or(0.0) + 1.0)
            .collect();
        Ok(EnvStep {
            state: self.backend.row(&values)?,
            reward: 0.5,
            done: self.script.done_on.contains(&n),
            context: format!("step {n}"),
            event_type: (n % 2 == 0).then(|| "ping".to_string()),
        })
    }

    fn get_state(&self) -> Result<Value, CollabError> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn load_state(&mut self, snapshot: &Value) -> Result<(), CollabError> {
        self.probes.with(|p| p.env_loads += 1);
        if self.script.fail_load {
            return Err(CollabError::invalid("scripted environment load failure"));
        }
        self.state = serde_json::from_value(snapshot.clone())?;
        Ok(())
    }

    fn emotional_impact_from_text(&mut self, text: &str) -> Result<Tensor, CollabError> {
        let v = (text.len() % 7) as f32 / 7.0;
        Ok(self.backend.row(&[v, -v])?)
    }

    fn queue_event(&mut self, event: QueuedEvent) {
        self.probes.with(|p| p.queued.push(event));
    }

    fn cleanup(&mut self) {
        self.probes.with(|p| p.cleanups += 1);
    }
}

#[derive(Debug, Clone)]
pub struct AgentScript {
    pub rih: f32,
    pub trust: f32,
    pub integration: f32,
    pub reflexivity: f32,
    /// 1-based process calls whose emotions tensor is disposed before returning.
    pub dispose_output_on: Vec<u32>,
    pub lose_backend_on: Vec<u32>,
    pub report_belief_norm: bool,
    pub fail_load: bool,
    /// Emit `"error"` in `get_state`.
    pub state_error: bool,
    /// Skip reporting derived metrics after a load.
    pub opaque_metrics: bool,
    /// Restore scalars but not the previous emotions.
    pub forget_prev_on_load: bool,
}

impl Default for AgentScript {
    fn default() -> Self {
        Self {
            rih: 0.42,
            trust: 0.73,
            integration: 0.55,
            reflexivity: 0.31,
            dispose_output_on: Vec::new(),
            lose_backend_on: Vec::new(),
            report_belief_norm: true,
            fail_load: false,
            state_error: false,
            opaque_metrics: false,
            forget_prev_on_load: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptedAgentState {
    pub version: u32,
    pub prev_emotions: Vec<f32>,
    #[serde(rename = "lastRIH")]
    pub last_rih: f32,
    pub latest_trust_score: f32,
    pub integration_param: f32,
    pub reflexivity_param: f32,
    pub calls: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ScriptedAgent {
    backend: Backend,
    script: AgentScript,
    emo: usize,
    calls: u32,
    last_rih: f32,
    last_trust: f32,
    integration: f32,
    reflexivity: f32,
    prev: Option<Tensor>,
    probes: Probes,
}

impl Agent for ScriptedAgent {
    fn process(
        &mut self,
        state_vector: &[f32],
        _graph: &GraphFeatures,
        ctx: StepContext<'_>,
    ) -> Result<AgentResponse, CollabError> {
        self.calls += 1;
        self.probes.with(|p| p.agent_inputs.push(state_vector.to_vec()));
        if self.script.lose_backend_on.contains(&self.calls) {
            return Err(CollabError::Tensor(TensorError::BackendUnavailable));
        }
        let values: Vec<f32> = (0..self.emo)
            .map(|i| ((self.calls as f32 + i as f32) * 0.1 + ctx.reward * 0.01).fract())
            .collect();
        let emotions = self.backend.row(&values)?;
        self.prev = Some(emotions.duplicate()?);
        self.last_rih = self.script.rih;
        self.last_trust = self.script.trust;
        self.integration = self.script.integration;
        self.reflexivity = self.script.reflexivity;
        if self.script.dispose_output_on.contains(&self.calls) {
            emotions.dispose();
        }
        Ok(AgentResponse {
            emotions,
            rih_score: self.script.rih,
            trust_score: self.script.trust,
            affinities: vec![0.2, -0.4, 0.8],
            hm_label: "nod".into(),
            cascade_history: vec![vec![1.0], vec![0.5, 0.25]],
            integration: self.script.integration,
            reflexivity: self.script.reflexivity,
            belief_norm: self.script.report_belief_norm.then_some(1.25),
            self_state_norm: Some(0.5),
        })
    }

    fn get_state(&self) -> Result<Value, CollabError> {
        let prev_emotions = match &self.prev {
            Some(t) => t.to_vec()?,
            None => vec![0.0; self.emo],
        };
        Ok(serde_json::to_value(ScriptedAgentState {
            version: 1,
            prev_emotions,
            last_rih: self.last_rih,
            latest_trust_score: self.last_trust,
            integration_param: self.integration,
            reflexivity_param: self.reflexivity,
            calls: self.calls,
            error: self.script.state_error.then(|| "weights contain NaN".to_string()),
        })?)
    }

    fn load_state(&mut self, snapshot: &Value) -> Result<(), CollabError> {
        self.probes.with(|p| p.agent_loads += 1);
        if self.script.fail_load {
            return Err(CollabError::invalid("scripted agent load failure"));
        }
        let s: ScriptedAgentState = serde_json::from_value(snapshot.clone())?;
        self.prev = if self.script.forget_prev_on_load {
            None
        } else {
            Some(self.backend.row(&s.prev_emotions)?)
        };
        self.last_rih = s.last_rih;
        self.last_trust = s.latest_trust_score;
        self.integration = s.integration_param;
        self.reflexivity = s.reflexivity_param;
        self.calls = s.calls;
        Ok(())
    }

    fn prev_emotions(&self) -> Option<&Tensor> {
        self.prev.as_ref()
    }

    fn derived_metrics(&self) -> DerivedMetrics {
        if self.script.opaque_metrics {
            return DerivedMetrics::default();
        }
        DerivedMetrics {
            rih_score: Some(self.last_rih),
            trust_score: Some(self.last_trust),
            avg_affinity: None,
            integration_param: Some(self.integration),
            reflexivity_param: Some(self.reflexivity),
            belief_norm: None,
            self_state_norm: None,
        }
    }

    fn latest_belief_embedding(&self) -> Option<Tensor> {
        self.backend.row(&[3.0, 4.0]).ok()
    }

    fn cleanup(&mut self) {
        self.prev = None;
        self.probes.with(|p| p.cleanups += 1);
    }
}

pub fn test_config(base: usize, emo: usize) -> SimConfig {
    SimConfig {
        base_state_dim: base,
        emotion_dim: emo,
        ..SimConfig::default()
    }
}

pub fn scripted_sim(
    base: usize,
    emo: usize,
    env: EnvScript,
    agent: AgentScript,
) -> (Simulation, Probes) {
    scripted_sim_with_store(base, emo, env, agent, Box::new(MemoryStore::new()))
}

pub fn scripted_sim_with_store(
    base: usize,
    emo: usize,
    env: EnvScript,
    agent: AgentScript,
    store: Box<dyn SnapshotStore>,
) -> (Simulation, Probes) {
    let backend = Backend::new();
    let probes = Probes::default();
    let env = ScriptedEnvironment {
        backend: backend.clone(),
        script: env,
        dim: base,
        state: ScriptedEnvState {
            steps: 0,
            level: 0.0,
        },
        probes: probes.clone(),
    };
    let agent = ScriptedAgent {
        backend: backend.clone(),
        script: agent,
        emo,
        calls: 0,
        last_rih: 0.0,
        last_trust: 0.0,
        integration: 0.0,
        reflexivity: 0.0,
        prev: None,
        probes: probes.clone(),
    };
    let sim = Simulation::new(test_config(base, emo), backend, store)
        .unwrap()
        .with_environment(Box::new(env))
        .with_agent(Box::new(agent));
    (sim, probes)
}

#[derive(Debug, Clone, Default)]
pub struct SinkLog(Arc<Mutex<Vec<(u64, Metrics)>>>);

impl SinkLog {
    pub fn frames(&self) -> Vec<u64> {
        self.0.lock().unwrap().iter().map(|(f, _)| *f).collect()
    }

    pub fn last_metrics(&self) -> Option<Metrics> {
        self.0.lock().unwrap().last().map(|(_, m)| *m)
    }
}

pub struct CountingSink {
    log: SinkLog,
}

impl CountingSink {
    pub fn new(log: SinkLog) -> Self {
        Self { log }
    }
}

impl FrameSink for CountingSink {
    fn name(&self) -> &str {
        "counting"
    }

    fn render(&mut self, frame: &FrameView<'_>) -> Result<(), SinkError> {
        if frame.emotions.is_disposed() {
            return Err(SinkError::new("counting", "frame clone already released"));
        }
        self.log.0.lock().unwrap().push((frame.frame, frame.metrics));
        Ok(())
    }
}
