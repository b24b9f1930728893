//! The simulation context and its per-frame step protocol.
//!
//! A [`Simulation`] owns the canonical [`SimulationState`], both collaborators,
//! the visualization sinks and the snapshot store. Callers drive it by calling
//! [`Simulation::tick`] once per frame; ticks are serialized by `&mut self`, which
//! is the only concurrency control the state needs.
//!
//! Phase machine:
//!
//! ```text
//!   Paused --start--> Ready --tick--> Stepping --ok/err--> Ready
//!                       ^  \--pause/load--> Paused          |
//!                       |                                   +--backend lost--> Halted
//!   any --shutdown--> Stopped
//! ```

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::collab::{
    validate_agent_response, validate_env_step, Agent, AgentResponse, Environment,
    GraphFeatureSource, NoGraph, QueuedEvent, StepContext,
};
use crate::config::SimConfig;
use crate::error::{CollabError, ConfigError, ControlError, StepError};
use crate::observer::{FrameSink, FrameView};
use crate::state::{mean_affinity, normalize_state_vector, HmLabel, Metrics, SimulationState, StateView};
use crate::storage::SnapshotStore;
use crate::tensor::{Backend, FrameClone, FrameCounters, SlotStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ready,
    Stepping,
    Paused,
    Halted,
    Stopped,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Stepping => "stepping",
            Self::Paused => "paused",
            Self::Halted => "halted",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The loop is not in `Ready`; nothing ran.
    Skipped(Phase),
    Success,
    /// A recoverable error was absorbed; the frame still rendered.
    Recovered(StepError),
    /// Fatal; no further ticks will run.
    Halted(StepError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickStats {
    pub successes: u64,
    pub step_errors: u64,
    pub frame_clones_created: u64,
    pub frame_clones_disposed: u64,
    pub canonical: SlotStats,
}

pub struct Simulation {
    pub(crate) cfg: SimConfig,
    pub(crate) backend: Backend,
    pub(crate) environment: Option<Box<dyn Environment>>,
    pub(crate) agent: Option<Box<dyn Agent>>,
    graph: Box<dyn GraphFeatureSource>,
    sinks: Vec<Box<dyn FrameSink>>,
    pub(crate) store: Box<dyn SnapshotStore>,
    pub(crate) state: SimulationState,
    pub(crate) phase: Phase,
    pub(crate) status: Option<String>,
    frames: Arc<FrameCounters>,
    successes: u64,
    step_errors: u64,
    pub(crate) cold_start_attempted: bool,
}

impl Simulation {
    /// Build a paused simulation holding a zero emotions tensor.
    pub fn new(
        cfg: SimConfig,
        backend: Backend,
        store: Box<dyn SnapshotStore>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let zeros = backend.zeros(cfg.emotion_shape())?;
        let state = SimulationState::new(cfg.base_state_dim, zeros);
        Ok(Self {
            cfg,
            backend,
            environment: None,
            agent: None,
            graph: Box::new(NoGraph),
            sinks: Vec::new(),
            store,
            state,
            phase: Phase::Paused,
            status: None,
            frames: Arc::new(FrameCounters::default()),
            successes: 0,
            step_errors: 0,
            cold_start_attempted: false,
        })
    }

    pub fn with_environment(mut self, env: Box<dyn Environment>) -> Self {
        self.environment = Some(env);
        self
    }

    pub fn with_agent(mut self, agent: Box<dyn Agent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_graph(mut self, graph: Box<dyn GraphFeatureSource>) -> Self {
        self.graph = graph;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn view(&self) -> StateView {
        self.state.view()
    }

    /// Last user-visible status message, if any.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn take_status(&mut self) -> Option<String> {
        self.status.take()
    }

    /// Interactive controls are disabled for good once halted or stopped.
    pub fn controls_enabled(&self) -> bool {
        !matches!(self.phase, Phase::Halted | Phase::Stopped)
    }

    pub fn collaborators_ready(&self) -> bool {
        self.environment.is_some() && self.agent.is_some()
    }

    pub fn stats(&self) -> TickStats {
        TickStats {
            successes: self.successes,
            step_errors: self.step_errors,
            frame_clones_created: self.frames.created(),
            frame_clones_disposed: self.frames.disposed(),
            canonical: self.state.emotion_stats(),
        }
    }

    pub fn start(&mut self) -> Result<(), ControlError> {
        match self.phase {
            Phase::Halted => Err(ControlError::Halted),
            Phase::Stopped => Err(ControlError::NotReady("simulation stopped")),
            _ => {
                self.phase = Phase::Ready;
                Ok(())
            }
        }
    }

    pub fn pause(&mut self) {
        if matches!(self.phase, Phase::Ready | Phase::Stepping) {
            self.phase = Phase::Paused;
        }
    }

    pub fn resume(&mut self) -> Result<(), ControlError> {
        self.start()
    }

    /// Run one step of the simulation. Recoverable failures never escape.
    pub fn tick(&mut self) -> TickOutcome {
        if self.phase != Phase::Ready {
            return TickOutcome::Skipped(self.phase);
        }
        self.phase = Phase::Stepping;

        let outcome = match self.step_once() {
            Ok(frame) => {
                self.successes += 1;
                self.render(frame);
                TickOutcome::Success
            }
            Err(cause) if cause.is_fatal() => self.halt(cause),
            Err(cause) => self.recover(cause),
        };

        if self.phase == Phase::Stepping {
            self.phase = Phase::Ready;
        }
        outcome
    }

    fn step_once(&mut self) -> Result<FrameClone, StepError> {
        if !self.backend.is_available() {
            return Err(StepError::BackendUnavailable);
        }
        let env = self
            .environment
            .as_deref_mut()
            .ok_or_else(|| StepError::PrerequisitesMissing("environment not attached".into()))?;
        let agent = self
            .agent
            .as_deref_mut()
            .ok_or_else(|| StepError::PrerequisitesMissing("agent not attached".into()))?;
        let canonical = match self.state.emotions.get() {
            Some(t) if !t.is_disposed() => t,
            _ => {
                return Err(StepError::PrerequisitesMissing(
                    "canonical emotions tensor is not live".into(),
                ))
            }
        };

        let metrics = self.state.metrics.sanitized();
        let step = env
            .step(canonical, metrics.rih_score, metrics.avg_affinity)
            .map_err(|e| StepError::from_collab("environment.step", e))?;
        let step = validate_env_step(step, self.cfg.base_state_dim)?;

        let emotions_now = canonical.to_vec()?;
        let graph = self
            .graph
            .features(&self.state, &emotions_now)
            .map_err(|e| StepError::from_collab("graph features", e))?;

        let response = agent
            .process(
                &step.state_vector,
                &graph,
                StepContext {
                    event_type: step.event_type.as_deref(),
                    reward: step.reward,
                },
            )
            .map_err(|e| StepError::from_collab("agent.process", e))?;
        let AgentResponse {
            emotions,
            rih_score,
            trust_score,
            affinities,
            hm_label,
            cascade_history,
            integration,
            reflexivity,
            belief_norm,
            self_state_norm,
        } = validate_agent_response(response, self.cfg.emotion_shape())?;

        self.state.emotions.replace(emotions);
        let frame = {
            let installed = self.state.emotions.get().ok_or_else(|| {
                StepError::StepFailure("canonical slot empty after install".into())
            })?;
            FrameClone::of(installed, &self.frames)?
        };

        let belief_norm = match belief_norm {
            Some(n) => n,
            None => match agent.latest_belief_embedding() {
                Some(embedding) => {
                    let n = embedding.norm().unwrap_or(0.0);
                    embedding.dispose();
                    n
                }
                None => 0.0,
            },
        };

        let s = &mut self.state;
        s.state_vector = step.state_vector;
        s.metrics = Metrics {
            rih_score,
            avg_affinity: mean_affinity(&affinities),
            trust_score,
            belief_norm,
            self_state_norm: self_state_norm.unwrap_or(0.0),
            integration_param: integration,
            reflexivity_param: reflexivity,
        }
        .sanitized();
        s.hm_label = HmLabel::parse(&hm_label).unwrap_or_else(|| {
            debug!("unknown movement label {:?}; using idle", hm_label);
            HmLabel::Idle
        });
        s.cascade_history = cascade_history;
        s.context = if step.context.trim().is_empty() {
            "Running".to_string()
        } else {
            step.context
        };
        s.last_reward = step.reward;
        s.last_event_type = step.event_type;

        if step.done {
            s.episode += 1;
            match env.reset() {
                Ok(initial) => {
                    initial.dispose();
                    info!("Episode {} finished; environment reset", s.episode);
                }
                Err(e) => warn!("Environment reset after episode end failed: {}", e),
            }
        }

        Ok(frame)
    }

    fn recover(&mut self, cause: StepError) -> TickOutcome {
        self.step_errors += 1;
        warn!("Tick {} failed: {}", self.state.frame + 1, cause);
        self.status = Some(format!("Simulation step failed: {cause}"));
        self.state.context = format!("Error: {cause}");
        self.state.metrics = self.state.metrics.sanitized();

        let zeros = match self.backend.zeros(self.cfg.emotion_shape()) {
            Ok(t) => t,
            Err(_) => return self.halt(StepError::BackendUnavailable),
        };
        self.state.emotions.replace(zeros);

        let frame = match self.state.emotions.get().map(|t| FrameClone::of(t, &self.frames)) {
            Some(Ok(frame)) => frame,
            _ => return self.halt(StepError::BackendUnavailable),
        };
        self.render(frame);
        TickOutcome::Recovered(cause)
    }

    fn halt(&mut self, cause: StepError) -> TickOutcome {
        error!("Simulation halted: {}", cause);
        self.phase = Phase::Halted;
        self.status = Some("Numeric backend unavailable; reload to recover".to_string());
        self.state.context = format!("Halted: {cause}");
        TickOutcome::Halted(cause)
    }

    /// Lend the frame clone to every sink, then release it.
    fn render(&mut self, frame: FrameClone) {
        self.state.frame += 1;
        let view = FrameView {
            frame: self.state.frame,
            emotions: frame.tensor(),
            metrics: self.state.metrics.sanitized(),
            state: &self.state,
        };
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.render(&view) {
                warn!("Sink {} failed on frame {}: {}", sink.name(), view.frame, e);
            }
        }
        drop(frame);
    }

    /// Turn user text into a deferred environment event for the next step.
    ///
    /// Returns `Ok(false)` when the text is blank and nothing was queued.
    pub fn submit_text(&mut self, text: &str) -> Result<bool, ControlError> {
        match self.phase {
            Phase::Halted => return Err(ControlError::Halted),
            Phase::Stopped => return Err(ControlError::NotReady("simulation stopped")),
            _ => {}
        }
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }
        let env = self
            .environment
            .as_deref_mut()
            .ok_or(ControlError::NotReady("environment not attached"))?;

        let impact = env.emotional_impact_from_text(text)?;
        let values = impact.to_vec();
        impact.dispose();
        let values = values.map_err(CollabError::from)?;

        let note: String = text.chars().take(80).collect();
        env.queue_event(QueuedEvent {
            kind: "chat".to_string(),
            impact: normalize_state_vector(values, self.cfg.emotion_dim),
            note,
        });
        debug!("Queued chat event for the next step");
        Ok(true)
    }

    /// Release collaborators and the canonical tensor. Idempotent.
    pub fn shutdown(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        if let Some(mut env) = self.environment.take() {
            env.cleanup();
        }
        if let Some(mut agent) = self.agent.take() {
            agent.cleanup();
        }
        self.state.emotions.clear();
        self.phase = Phase::Stopped;
        info!("Simulation stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::testkit::{scripted_sim, AgentScript, CountingSink, EnvScript, SinkLog};
    use crate::observer::SinkError;

    const BASE: usize = 6;
    const EMO: usize = 4;

    #[test]
    fn successful_ticks_replace_and_dispose_canonical_once_each() {
        let (mut sim, _) = scripted_sim(BASE, EMO, EnvScript::default(), AgentScript::default());
        sim.start().unwrap();
        let first = sim.state().emotions().unwrap().id();
        for _ in 0..7 {
            assert_eq!(sim.tick(), TickOutcome::Success);
        }
        let stats = sim.stats();
        assert_eq!(stats.successes, 7);
        assert_eq!(stats.canonical, SlotStats { replaced: 7, disposed: 7 });
        assert_eq!(stats.frame_clones_created, 7);
        assert_eq!(stats.frame_clones_disposed, 7);
        assert_ne!(sim.state().emotions().unwrap().id(), first);
        // Canonical plus the agent's own previous-emotions copy.
        assert_eq!(sim.backend().stats().live, 2);
    }

    #[test]
    fn short_state_vector_is_zero_padded_before_agent() {
        let env = EnvScript {
            state_len: Some(BASE - 2),
            ..EnvScript::default()
        };
        let (mut sim, probes) = scripted_sim(BASE, EMO, env, AgentScript::default());
        sim.start().unwrap();
        assert_eq!(sim.tick(), TickOutcome::Success);
        let seen = probes.agent_inputs();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), BASE);
        assert_eq!(&seen[0][BASE - 2..], &[0.0, 0.0]);
        assert_eq!(sim.state().state_vector.len(), BASE);
    }

    #[test]
    fn disposed_agent_emotions_end_in_step_failure_with_zero_canonical() {
        let agent = AgentScript {
            dispose_output_on: vec![2],
            ..AgentScript::default()
        };
        let (mut sim, _) = scripted_sim(BASE, EMO, EnvScript::default(), agent);
        sim.start().unwrap();
        assert_eq!(sim.tick(), TickOutcome::Success);
        let before = sim.stats();

        let outcome = sim.tick();
        assert!(matches!(outcome, TickOutcome::Recovered(StepError::StepFailure(_))));
        let canonical = sim.state().emotions().unwrap();
        assert!(!canonical.is_disposed());
        assert_eq!(canonical.shape(), [1, EMO]);
        assert_eq!(canonical.to_vec().unwrap(), vec![0.0; EMO]);
        assert!(sim.state().context.contains("Error"));
        assert!(sim.status().is_some());

        let after = sim.stats();
        assert_eq!(after.frame_clones_disposed - before.frame_clones_disposed, 1);
        assert_eq!(after.frame_clones_created, after.frame_clones_disposed);
        assert_eq!(sim.phase(), Phase::Ready);

        // The loop keeps going afterwards.
        assert_eq!(sim.tick(), TickOutcome::Success);
    }

    #[test]
    fn environment_failure_is_recovered_and_releases_everything() {
        let env = EnvScript {
            fail_on: vec![1],
            ..EnvScript::default()
        };
        let (mut sim, _) = scripted_sim(BASE, EMO, env, AgentScript::default());
        sim.start().unwrap();
        assert!(matches!(sim.tick(), TickOutcome::Recovered(StepError::StepFailure(_))));
        assert!(sim.state().emotions_live());
        // Canonical zeros only: env state tensor and frame clone are released.
        assert_eq!(sim.backend().stats().live, 1);
        assert_eq!(sim.stats().step_errors, 1);
    }

    #[test]
    fn missing_agent_is_a_prerequisite_error() {
        let backend = Backend::new();
        let cfg = SimConfig {
            base_state_dim: BASE,
            emotion_dim: EMO,
            ..SimConfig::default()
        };
        let mut sim = Simulation::new(cfg, backend, Box::new(MemoryStore::new())).unwrap();
        sim.start().unwrap();
        let outcome = sim.tick();
        assert!(matches!(
            outcome,
            TickOutcome::Recovered(StepError::PrerequisitesMissing(_))
        ));
        assert!(sim.state().emotions_live());
        assert_eq!(sim.stats().frame_clones_disposed, 1);
    }

    #[test]
    fn backend_loss_halts_and_disables_controls() {
        let (mut sim, _) = scripted_sim(BASE, EMO, EnvScript::default(), AgentScript::default());
        sim.start().unwrap();
        assert_eq!(sim.tick(), TickOutcome::Success);
        sim.backend().set_available(false);
        assert_eq!(sim.tick(), TickOutcome::Halted(StepError::BackendUnavailable));
        assert_eq!(sim.phase(), Phase::Halted);
        assert!(!sim.controls_enabled());
        assert_eq!(sim.tick(), TickOutcome::Skipped(Phase::Halted));
        assert!(matches!(sim.start(), Err(ControlError::Halted)));
        assert!(matches!(sim.submit_text("hello"), Err(ControlError::Halted)));
    }

    #[test]
    fn agent_allocation_failure_mid_tick_halts() {
        let agent = AgentScript {
            lose_backend_on: vec![1],
            ..AgentScript::default()
        };
        let (mut sim, _) = scripted_sim(BASE, EMO, EnvScript::default(), agent);
        sim.start().unwrap();
        assert_eq!(sim.tick(), TickOutcome::Halted(StepError::BackendUnavailable));
    }

    #[test]
    fn paused_simulation_does_not_step() {
        let (mut sim, probes) = scripted_sim(BASE, EMO, EnvScript::default(), AgentScript::default());
        assert_eq!(sim.tick(), TickOutcome::Skipped(Phase::Paused));
        sim.start().unwrap();
        sim.pause();
        assert_eq!(sim.tick(), TickOutcome::Skipped(Phase::Paused));
        assert!(probes.agent_inputs().is_empty());
        sim.resume().unwrap();
        assert_eq!(sim.tick(), TickOutcome::Success);
    }

    #[test]
    fn failing_sink_does_not_stop_other_sinks_or_leak_the_frame() {
        struct Broken;
        impl FrameSink for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn render(&mut self, _: &FrameView<'_>) -> Result<(), SinkError> {
                Err(SinkError::new("broken", "renderer lost context"))
            }
        }

        let log = SinkLog::default();
        let (sim, _) = scripted_sim(BASE, EMO, EnvScript::default(), AgentScript::default());
        let mut sim = sim
            .with_sink(Box::new(Broken))
            .with_sink(Box::new(CountingSink::new(log.clone())));
        sim.start().unwrap();
        for _ in 0..3 {
            assert_eq!(sim.tick(), TickOutcome::Success);
        }
        assert_eq!(log.frames(), vec![1, 2, 3]);
        assert_eq!(sim.stats().frame_clones_disposed, 3);
    }

    #[test]
    fn sinks_receive_sanitized_metrics() {
        let agent = AgentScript {
            rih: f32::NAN,
            trust: 3.0,
            ..AgentScript::default()
        };
        let log = SinkLog::default();
        let (sim, _) = scripted_sim(BASE, EMO, EnvScript::default(), agent);
        let mut sim = sim.with_sink(Box::new(CountingSink::new(log.clone())));
        sim.start().unwrap();
        sim.tick();
        let m = log.last_metrics().unwrap();
        assert_eq!(m.rih_score, 0.0);
        assert_eq!(m.trust_score, 1.0);
    }

    #[test]
    fn belief_norm_falls_back_to_embedding_and_releases_it() {
        let agent = AgentScript {
            report_belief_norm: false,
            ..AgentScript::default()
        };
        let (mut sim, _) = scripted_sim(BASE, EMO, EnvScript::default(), agent);
        sim.start().unwrap();
        sim.tick();
        // Embedding is [3, 4] in the script.
        assert!((sim.state().metrics.belief_norm - 5.0).abs() < 1e-6);
        assert_eq!(sim.backend().stats().live, 2);
    }

    #[test]
    fn done_resets_environment_and_counts_episode() {
        let env = EnvScript {
            done_on: vec![2],
            ..EnvScript::default()
        };
        let (mut sim, probes) = scripted_sim(BASE, EMO, env, AgentScript::default());
        sim.start().unwrap();
        sim.tick();
        sim.tick();
        assert_eq!(sim.state().episode, 1);
        assert_eq!(probes.env_resets(), 1);
        assert_eq!(sim.backend().stats().live, 2);
    }

    #[test]
    fn chat_queues_a_deferred_event_without_touching_canonical() {
        let (mut sim, probes) = scripted_sim(BASE, EMO, EnvScript::default(), AgentScript::default());
        let before = sim.state().emotions().unwrap().id();
        assert!(sim.submit_text("  you did great  ").unwrap());
        assert!(!sim.submit_text("   ").unwrap());
        let events = probes.queued_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "chat");
        assert_eq!(events[0].impact.len(), EMO);
        assert_eq!(events[0].note, "you did great");
        assert_eq!(sim.state().emotions().unwrap().id(), before);
        assert_eq!(sim.backend().stats().live, 1);
    }

    #[test]
    fn shutdown_releases_canonical_exactly_once() {
        let (mut sim, probes) = scripted_sim(BASE, EMO, EnvScript::default(), AgentScript::default());
        sim.start().unwrap();
        sim.tick();
        sim.shutdown();
        sim.shutdown();
        assert_eq!(sim.phase(), Phase::Stopped);
        assert!(sim.state().emotions().is_none());
        assert_eq!(probes.cleanups(), 2);
        let stats = sim.stats().canonical;
        assert_eq!(stats.disposed, stats.replaced + 1);
        assert_eq!(sim.backend().stats().live, 0);
    }
}
