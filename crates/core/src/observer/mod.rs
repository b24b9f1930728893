use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::state::{HmLabel, Metrics, SimulationState};
use crate::tensor::Tensor;

/// What a visualization sink sees for one frame.
///
/// Design intent:
/// - Sinks cannot mutate the simulation; everything here is borrowed.
/// - `emotions` is the frame clone, valid only for the duration of `render`.
/// - `metrics` is already sanitized (finite, in range).
pub struct FrameView<'a> {
    pub frame: u64,
    pub emotions: &'a Tensor,
    pub metrics: Metrics,
    pub state: &'a SimulationState,
}

#[derive(Debug, Error)]
#[error("{sink}: {message}")]
pub struct SinkError {
    pub sink: String,
    pub message: String,
}

impl SinkError {
    pub fn new(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sink: sink.into(),
            message: message.into(),
        }
    }
}

pub trait FrameSink: Send + Sync {
    fn name(&self) -> &str;
    fn render(&mut self, frame: &FrameView<'_>) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub frame: u64,
    pub metrics: Metrics,
    pub hm_label: HmLabel,
    pub dominant_emotion: usize,
}

/// Bounded per-frame metric history (the chart feed).
#[derive(Debug, Clone)]
pub struct MetricsHistory {
    cap: usize,
    samples: VecDeque<MetricsSample>,
}

impl MetricsHistory {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            samples: VecDeque::with_capacity(cap),
        }
    }

    pub fn push(&mut self, sample: MetricsSample) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&MetricsSample> {
        self.samples.back()
    }

    pub fn to_vec(&self) -> Vec<MetricsSample> {
        self.samples.iter().copied().collect()
    }
}

/// Sink that records sanitized metrics into a shared [`MetricsHistory`].
pub struct MetricsRecorder {
    history: Arc<Mutex<MetricsHistory>>,
}

impl MetricsRecorder {
    pub fn new(cap: usize) -> Self {
        Self {
            history: Arc::new(Mutex::new(MetricsHistory::new(cap))),
        }
    }

    /// Handle for readers outside the tick (UI, daemon responses).
    pub fn history(&self) -> Arc<Mutex<MetricsHistory>> {
        Arc::clone(&self.history)
    }
}

impl FrameSink for MetricsRecorder {
    fn name(&self) -> &str {
        "metrics"
    }

    fn render(&mut self, frame: &FrameView<'_>) -> Result<(), SinkError> {
        let values = frame
            .emotions
            .to_vec()
            .map_err(|e| SinkError::new(self.name(), e.to_string()))?;
        let dominant_emotion = values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push(MetricsSample {
            frame: frame.frame,
            metrics: frame.metrics,
            hm_label: frame.state.hm_label,
            dominant_emotion,
        });
        Ok(())
    }
}
