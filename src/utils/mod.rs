//! Utils Module
pub mod telemetry;
pub mod truncate;

pub use truncate::{approx_token_count, truncate_text};
