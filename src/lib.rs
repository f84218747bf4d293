//! Research Agency
//!
//! Orchestration core for multi-agent question answering:
//! - Role-based agent registry behind one `Agent` trait
//! - Staged pipeline with parallel fan-out and per-agent timeouts
//! - Scatter-gather for comparative queries
//! - Namespaced response cache and token budgeting

pub mod agent;
pub mod error;
pub mod orchestrator;
pub mod server;
pub mod utils;

// Re-exports for convenience
pub use agent::{Agent, AgentRegistry, AgentResult, AgentRole};
pub use error::{AgentError, Result};
pub use orchestrator::{PipelineConfig, QueryContext, Response, Supervisor};
