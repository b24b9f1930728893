//! Emotion co-activation graph.
//!
//! Nodes are emotion channels; edge weights are an exponential moving average
//! of pairwise co-activation. The feature vector handed to the agent is a fixed
//! summary of the current emotions and the graph.

use emosim::collab::{GraphFeatureSource, GraphFeatures};
use emosim::error::CollabError;
use emosim::state::SimulationState;

/// Length of the vector produced by [`EmotionGraph::features`].
pub const FEATURE_COUNT: usize = 5;

pub struct EmotionGraph {
    dim: usize,
    /// Row-major `dim x dim`, symmetric, zero diagonal.
    edges: Vec<f32>,
    decay: f32,
    last: Vec<f32>,
}

impl EmotionGraph {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            edges: vec![0.0; dim * dim],
            decay: 0.9,
            last: vec![0.0; dim],
        }
    }

    pub fn edge(&self, a: usize, b: usize) -> f32 {
        if a >= self.dim || b >= self.dim {
            return 0.0;
        }
        self.edges[a * self.dim + b]
    }

    fn update_edges(&mut self, e: &[f32]) {
        let d = self.dim;
        for i in 0..d {
            for j in (i + 1)..d {
                let co = e[i] * e[j];
                let w = self.decay * self.edges[i * d + j] + (1.0 - self.decay) * co;
                self.edges[i * d + j] = w;
                self.edges[j * d + i] = w;
            }
        }
    }
}

impl GraphFeatureSource for EmotionGraph {
    fn features(
        &mut self,
        state: &SimulationState,
        emotions: &[f32],
    ) -> Result<GraphFeatures, CollabError> {
        if emotions.len() != self.dim {
            return Err(CollabError::invalid(format!(
                "graph expects {} emotions, got {}",
                self.dim,
                emotions.len()
            )));
        }
        let e: Vec<f32> = emotions
            .iter()
            .map(|v| if v.is_finite() { *v } else { 0.0 })
            .collect();
        self.update_edges(&e);

        let n = self.dim.max(1) as f32;
        let mean = e.iter().sum::<f32>() / n;
        let spread = e.iter().copied().fold(f32::MIN, f32::max)
            - e.iter().copied().fold(f32::MAX, f32::min);
        let pairs = (self.dim * self.dim.saturating_sub(1)).max(1) as f32;
        let mean_edge = self.edges.iter().sum::<f32>() / pairs;
        let max_edge = self.edges.iter().copied().fold(0.0f32, f32::max);
        let drift = e
            .iter()
            .zip(&self.last)
            .map(|(a, b)| (a - b).abs())
            .sum::<f32>()
            / n;
        self.last = e;

        // Dampen drift while the agent's read-out is already coherent.
        let coherence = state.metrics.sanitized().rih_score;

        Ok(GraphFeatures {
            values: vec![
                mean,
                if spread.is_finite() { spread } else { 0.0 },
                mean_edge,
                max_edge,
                drift * (1.0 - 0.5 * coherence),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emosim::tensor::Backend;

    fn state() -> SimulationState {
        let backend = Backend::new();
        SimulationState::new(4, backend.zeros([1, 3]).unwrap())
    }

    #[test]
    fn features_have_fixed_length_and_track_coactivation() {
        let s = state();
        let mut g = EmotionGraph::new(3);
        let f = g.features(&s, &[0.9, 0.8, 0.0]).unwrap();
        assert_eq!(f.values.len(), FEATURE_COUNT);
        assert!(g.edge(0, 1) > 0.0);
        assert_eq!(g.edge(0, 1), g.edge(1, 0));
        assert_eq!(g.edge(0, 2), 0.0);
        assert_eq!(g.edge(5, 0), 0.0);
    }

    #[test]
    fn drift_is_zero_for_a_steady_signal() {
        let s = state();
        let mut g = EmotionGraph::new(3);
        g.features(&s, &[0.2, 0.4, 0.6]).unwrap();
        let f = g.features(&s, &[0.2, 0.4, 0.6]).unwrap();
        assert_eq!(f.values[4], 0.0);
    }

    #[test]
    fn wrong_width_is_an_error() {
        let s = state();
        let mut g = EmotionGraph::new(3);
        assert!(g.features(&s, &[0.1]).is_err());
    }
}
