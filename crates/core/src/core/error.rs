use thiserror::Error;

use crate::tensor::TensorError;

/// Failure reported by an Environment, Agent or graph-feature collaborator.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("state (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl CollabError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    fn is_backend_loss(&self) -> bool {
        matches!(self, Self::Tensor(TensorError::BackendUnavailable))
    }
}

/// Why a tick did not reach SUCCESS.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("prerequisites missing: {0}")]
    PrerequisitesMissing(String),
    #[error("step failure: {0}")]
    StepFailure(String),
    #[error("numeric backend unavailable")]
    BackendUnavailable,
}

impl StepError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BackendUnavailable)
    }

    pub(crate) fn from_collab(stage: &str, err: CollabError) -> Self {
        if err.is_backend_loss() {
            Self::BackendUnavailable
        } else {
            Self::StepFailure(format!("{stage}: {err}"))
        }
    }
}

impl From<TensorError> for StepError {
    fn from(err: TensorError) -> Self {
        match err {
            TensorError::BackendUnavailable => Self::BackendUnavailable,
            other => Self::StepFailure(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("save not allowed: {0}")]
    NotReady(&'static str),
    #[error("collaborator state rejected: {0}")]
    InvalidState(String),
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Which part of the live state a load had begun rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Environment,
    Agent,
    Emotions,
}

impl LoadStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Environment => "environment",
            Self::Agent => "agent",
            Self::Emotions => "emotions",
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("load not allowed: {0}")]
    NotReady(&'static str),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("saved snapshot is corrupt: {0}")]
    Corrupt(String),
    #[error("saved snapshot version {found:?} does not match {expected:?}")]
    IncompatibleVersion { found: String, expected: String },
    #[error("load failed while restoring {}: {message}; live state may be inconsistent", stage.as_str())]
    PartialLoadFailure { stage: LoadStage, message: String },
}

impl LoadError {
    /// True once collaborators or the canonical tensor were touched.
    pub fn mutated_live_state(&self) -> bool {
        matches!(self, Self::PartialLoadFailure { .. })
    }

    pub fn is_critical(&self) -> bool {
        self.mutated_live_state()
    }
}

/// Refusal of an interactive control (start, pause, chat).
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("simulation halted; reload required")]
    Halted,
    #[error("not ready: {0}")]
    NotReady(&'static str),
    #[error(transparent)]
    Collaborator(#[from] CollabError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("numeric backend: {0}")]
    Backend(#[from] TensorError),
}
