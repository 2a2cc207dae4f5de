use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Simulation '{id}' not found")]
    SimulationNotFound { id: String },

    #[error("Simulation '{id}' is {actual}, cannot {action}")]
    InvalidStatus {
        id: String,
        actual: String,
        action: &'static str,
    },

    #[error("Scenario '{id}' not configured")]
    UnknownScenario { id: String },

    #[error("Replay rate limit exceeded for '{actor}' (max {max} per window)")]
    ReplayRateLimited { actor: String, max: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SimResult<T> = Result<T, SimError>;

/// Failure taxonomy for anything that went wrong while executing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Network,
    Timeout,
    Auth,
    Validation,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 6] = [
        ErrorCategory::RateLimit,
        ErrorCategory::Network,
        ErrorCategory::Timeout,
        ErrorCategory::Auth,
        ErrorCategory::Validation,
        ErrorCategory::Unknown,
    ];

    /// `unknown` is retried on purpose: most unclassified failures are transient.
    pub fn is_retryable(self) -> bool {
        match self {
            Self::RateLimit | Self::Network | Self::Timeout | Self::Unknown => true,
            Self::Auth | Self::Validation => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified job failure, carried from execution to routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub category: ErrorCategory,
    pub message:  String,
}

impl JobFailure {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self { category, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

/// Store errors inside job execution surface as `unknown` failures.
impl From<SimError> for JobFailure {
    fn from(e: SimError) -> Self {
        JobFailure::new(ErrorCategory::Unknown, e.to_string())
    }
}
