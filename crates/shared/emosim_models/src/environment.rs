//! Reactive environment: a leaky state vector pushed around by the agent's
//! emotions, ambient events and queued chat input.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::debug;

use emosim::collab::{EnvStep, Environment, QueuedEvent};
use emosim::error::CollabError;
use emosim::tensor::{Backend, Tensor};

use crate::prng::Prng;
use crate::text_impact::impact_from_text;

const STATE_VERSION: u32 = 1;
const MAX_PENDING: usize = 16;

/// Ambient events: name, emotion channel nudged, magnitude.
const AMBIENT: &[(&str, usize, f32)] = &[
    ("praise", 0, 0.6),
    ("threat", 2, 0.7),
    ("novelty", 3, 0.5),
    ("loss", 4, 0.6),
    ("quiet", 9, 0.4),
];

#[derive(Debug, Clone)]
pub struct EnvParams {
    pub state_dim: usize,
    pub emotion_dim: usize,
    /// Steps per episode before `done` is reported.
    pub episode_length: u32,
    /// Fraction of the previous state kept each step.
    pub leak: f32,
    /// Per-step probability of an ambient event.
    pub event_rate: f32,
    pub seed: u64,
}

impl EnvParams {
    pub fn new(state_dim: usize, emotion_dim: usize) -> Self {
        Self {
            state_dim,
            emotion_dim,
            episode_length: 600,
            leak: 0.85,
            event_rate: 0.05,
            seed: 0x5EED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvState {
    version: u32,
    state: Vec<f32>,
    step_count: u32,
    episode: u32,
    rng_state: u64,
    #[serde(default)]
    pending: VecDeque<QueuedEvent>,
    #[serde(default)]
    last_event: Option<String>,
}

pub struct ReactiveEnvironment {
    backend: Backend,
    params: EnvParams,
    state: Vec<f32>,
    step_count: u32,
    episode: u32,
    rng: Prng,
    pending: VecDeque<QueuedEvent>,
    last_event: Option<String>,
}

impl ReactiveEnvironment {
    pub fn new(backend: Backend, params: EnvParams) -> Self {
        let rng = Prng::new(params.seed);
        Self {
            backend,
            state: vec![0.0; params.state_dim],
            step_count: 0,
            episode: 0,
            rng,
            pending: VecDeque::new(),
            last_event: None,
            params,
        }
    }

    pub fn params(&self) -> &EnvParams {
        &self.params
    }

    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    pub fn episode(&self) -> u32 {
        self.episode
    }

    fn apply_impact(&mut self, impact: &[f32], scale: f32) {
        if impact.is_empty() {
            return;
        }
        for (i, slot) in self.state.iter_mut().enumerate() {
            *slot += scale * impact[i % impact.len()];
        }
    }

    fn next_event(&mut self) -> Option<(String, String)> {
        if let Some(ev) = self.pending.pop_front() {
            let impact = ev.impact.clone();
            self.apply_impact(&impact, 1.0);
            let context = if ev.note.is_empty() {
                format!("User {}", ev.kind)
            } else {
                format!("User: {}", ev.note)
            };
            return Some((ev.kind, context));
        }
        if self.rng.chance(self.params.event_rate) {
            let (name, channel, magnitude) = AMBIENT[self.rng.index(AMBIENT.len())];
            let mut impact = vec![0.0; self.params.emotion_dim.max(1)];
            if let Some(slot) = impact.get_mut(channel) {
                *slot = magnitude;
            }
            self.apply_impact(&impact, 1.0);
            return Some((name.to_string(), format!("Ambient {name}")));
        }
        None
    }

    fn describe(&self) -> String {
        let energy = self.state.iter().map(|v| v.abs()).sum::<f32>() / self.state.len().max(1) as f32;
        match energy {
            e if e < 0.1 => "Calm surroundings".to_string(),
            e if e < 0.4 => "Gentle activity".to_string(),
            _ => "Turbulent surroundings".to_string(),
        }
    }
}

impl Environment for ReactiveEnvironment {
    fn reset(&mut self) -> Result<Tensor, CollabError> {
        self.state.iter_mut().for_each(|v| *v = 0.0);
        self.step_count = 0;
        self.episode += 1;
        self.last_event = None;
        Ok(self.backend.row(&self.state)?)
    }

    fn step(
        &mut self,
        emotions: &Tensor,
        rih_score: f32,
        avg_affinity: f32,
    ) -> Result<EnvStep, CollabError> {
        let emo = emotions.to_vec()?;
        if emo.is_empty() {
            return Err(CollabError::invalid("empty emotions tensor"));
        }
        let leak = self.params.leak.clamp(0.0, 1.0);
        let drive_gain = 0.5 + 0.5 * rih_score.clamp(0.0, 1.0);
        for (i, v) in self.state.iter_mut().enumerate() {
            let drive = emo[i % emo.len()] * drive_gain + 0.1 * avg_affinity;
            *v = leak * *v + (1.0 - leak) * drive;
        }
        for v in self.state.iter_mut() {
            *v += self.rng.range_f32(-0.02, 0.02);
            *v = v.clamp(-2.0, 2.0);
        }

        let event = self.next_event();
        self.step_count += 1;

        let spread = {
            let mean = self.state.iter().sum::<f32>() / self.state.len().max(1) as f32;
            self.state.iter().map(|v| (v - mean).powi(2)).sum::<f32>()
                / self.state.len().max(1) as f32
        };
        let reward = (0.5 * avg_affinity + 0.5 * rih_score - spread).clamp(-1.0, 1.0);
        let done = self.step_count >= self.params.episode_length;

        let (event_type, context) = match event {
            Some((kind, context)) => (Some(kind), context),
            None => (None, self.describe()),
        };
        self.last_event = event_type.clone();

        Ok(EnvStep {
            state: self.backend.row(&self.state)?,
            reward,
            done,
            context,
            event_type,
        })
    }

    fn get_state(&self) -> Result<Value, CollabError> {
        Ok(serde_json::to_value(EnvState {
            version: STATE_VERSION,
            state: self.state.clone(),
            step_count: self.step_count,
            episode: self.episode,
            rng_state: self.rng.state(),
            pending: self.pending.clone(),
            last_event: self.last_event.clone(),
        })?)
    }

    fn load_state(&mut self, snapshot: &Value) -> Result<(), CollabError> {
        let s: EnvState = serde_json::from_value(snapshot.clone())?;
        if s.version != STATE_VERSION {
            return Err(CollabError::invalid(format!(
                "environment state version {} is not supported",
                s.version
            )));
        }
        if s.state.len() != self.params.state_dim {
            return Err(CollabError::invalid(format!(
                "environment state has {} values, expected {}",
                s.state.len(),
                self.params.state_dim
            )));
        }
        if s.state.iter().any(|v| !v.is_finite()) {
            return Err(CollabError::invalid("environment state is not finite"));
        }
        self.state = s.state;
        self.step_count = s.step_count;
        self.episode = s.episode;
        self.rng = Prng::from_state(s.rng_state);
        self.pending = s.pending;
        self.last_event = s.last_event;
        Ok(())
    }

    fn emotional_impact_from_text(&mut self, text: &str) -> Result<Tensor, CollabError> {
        let impact = impact_from_text(text, self.params.emotion_dim);
        Ok(self.backend.row(&impact)?)
    }

    fn queue_event(&mut self, event: QueuedEvent) {
        if self.pending.len() == MAX_PENDING {
            if let Some(dropped) = self.pending.pop_front() {
                debug!("event queue full; dropping oldest {:?}", dropped.kind);
            }
        }
        self.pending.push_back(event);
    }

    fn cleanup(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_env(state_dim: usize) -> (Backend, ReactiveEnvironment) {
        let backend = Backend::new();
        let mut params = EnvParams::new(state_dim, 4);
        params.event_rate = 0.0;
        let env = ReactiveEnvironment::new(backend.clone(), params);
        (backend, env)
    }

    #[test]
    fn step_emits_a_caller_owned_row() {
        let (backend, mut env) = make_env(6);
        let emo = backend.row(&[0.5, 0.1, 0.0, 0.2]).unwrap();
        let out = env.step(&emo, 0.5, 0.2).unwrap();
        assert_eq!(out.state.shape(), [1, 6]);
        assert!(out.event_type.is_none());
        assert!(!out.done);
        assert_eq!(backend.stats().live, 2);
        drop(out);
        assert_eq!(backend.stats().live, 1);
    }

    #[test]
    fn queued_chat_is_consumed_on_the_next_step() {
        let (backend, mut env) = make_env(6);
        env.queue_event(QueuedEvent {
            kind: "chat".into(),
            impact: vec![1.0, 0.0, 0.0, 0.0],
            note: "hello".into(),
        });
        let emo = backend.zeros([1, 4]).unwrap();
        let out = env.step(&emo, 0.0, 0.0).unwrap();
        assert_eq!(out.event_type.as_deref(), Some("chat"));
        assert_eq!(out.context, "User: hello");
        assert_eq!(env.pending_events(), 0);
        let next = env.step(&emo, 0.0, 0.0).unwrap();
        assert!(next.event_type.is_none());
    }

    #[test]
    fn episode_ends_after_configured_length() {
        let (backend, mut env) = make_env(3);
        env.params.episode_length = 2;
        let emo = backend.zeros([1, 4]).unwrap();
        assert!(!env.step(&emo, 0.0, 0.0).unwrap().done);
        assert!(env.step(&emo, 0.0, 0.0).unwrap().done);
        env.reset().unwrap();
        assert_eq!(env.episode(), 1);
        assert!(!env.step(&emo, 0.0, 0.0).unwrap().done);
    }

    #[test]
    fn state_round_trip_replays_identically() {
        let (backend, mut a) = make_env(5);
        a.params.event_rate = 0.5;
        let emo = backend.row(&[0.3, 0.6, 0.1, 0.9]).unwrap();
        for _ in 0..5 {
            a.step(&emo, 0.4, 0.1).unwrap();
        }
        let saved = a.get_state().unwrap();

        let (_, mut b) = make_env(5);
        b.params.event_rate = 0.5;
        b.load_state(&saved).unwrap();
        for _ in 0..5 {
            let x = a.step(&emo, 0.4, 0.1).unwrap();
            let y = b.step(&emo, 0.4, 0.1).unwrap();
            assert_eq!(x.state.to_vec().unwrap(), y.state.to_vec().unwrap());
            assert_eq!(x.event_type, y.event_type);
        }
    }

    #[test]
    fn load_rejects_wrong_dimension_without_mutating() {
        let (backend, mut env) = make_env(5);
        let emo = backend.row(&[0.3, 0.6, 0.1, 0.9]).unwrap();
        env.step(&emo, 0.4, 0.1).unwrap();
        let before = env.get_state().unwrap();
        let (_, other) = make_env(3);
        let err = env.load_state(&other.get_state().unwrap()).unwrap_err();
        assert!(err.to_string().contains("expected 5"));
        assert_eq!(env.get_state().unwrap(), before);
    }

    #[test]
    fn queue_is_bounded() {
        let (_, mut env) = make_env(3);
        for i in 0..(MAX_PENDING + 3) {
            env.queue_event(QueuedEvent {
                kind: "chat".into(),
                impact: vec![],
                note: i.to_string(),
            });
        }
        assert_eq!(env.pending_events(), MAX_PENDING);
    }
}
