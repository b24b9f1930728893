//! Reference collaborators for the `emosim` core: a reactive environment, a
//! recurrent belief agent and an emotion co-activation graph.

use std::sync::{Arc, Mutex};

use emosim::config::SimConfig;
use emosim::error::ConfigError;
use emosim::observer::{MetricsHistory, MetricsRecorder};
use emosim::simulation::Simulation;
use emosim::storage::SnapshotStore;
use emosim::tensor::Backend;

pub mod agent;
pub mod environment;
pub mod graph;
pub mod prng;
pub mod text_impact;

pub use agent::{AgentParams, BeliefAgent};
pub use environment::{EnvParams, ReactiveEnvironment};
pub use graph::EmotionGraph;

/// A simulation wired to the reference models, plus the chart feed.
pub struct Assembled {
    pub simulation: Simulation,
    pub history: Arc<Mutex<MetricsHistory>>,
}

/// Build a paused simulation driven by [`ReactiveEnvironment`] and [`BeliefAgent`].
pub fn assemble(
    cfg: SimConfig,
    store: Box<dyn SnapshotStore>,
    seed: u64,
) -> Result<Assembled, ConfigError> {
    let backend = Backend::new();

    let mut env_params = EnvParams::new(cfg.base_state_dim, cfg.emotion_dim);
    env_params.seed = seed;
    let mut agent_params = AgentParams::new(cfg.base_state_dim, cfg.emotion_dim);
    agent_params.seed = seed.rotate_left(17) ^ 0xA5A5;

    let recorder = MetricsRecorder::new(cfg.metrics_history);
    let history = recorder.history();
    let graph = EmotionGraph::new(cfg.emotion_dim);

    let simulation = Simulation::new(cfg, backend.clone(), store)?
        .with_environment(Box::new(ReactiveEnvironment::new(backend.clone(), env_params)))
        .with_agent(Box::new(BeliefAgent::new(backend, agent_params)))
        .with_graph(Box::new(graph))
        .with_sink(Box::new(recorder));

    Ok(Assembled {
        simulation,
        history,
    })
}
