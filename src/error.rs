//! Error Model
//!
//! One error enum for the orchestration core. Agents return it from
//! `execute`; the executor turns it into a failed `AgentResult` at the
//! task boundary, so it never crosses a fan-out barrier.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("agent execution failed: {0}")]
    Execution(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("no agent registered for role '{0}'")]
    AgentNotFound(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("budget tracking error: {0}")]
    Budget(String),

    #[error("planning error: {0}")]
    Planning(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
