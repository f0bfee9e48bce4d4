//! TRT-LLM client common library
//!
//! This crate contains the error taxonomy, configuration and metrics shared by
//! the client crates.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{ClientConfig, GenerationDefaults, HttpConfig, TransportKind, TrimConfig};
pub use error::{Result, TrtLlmError};
pub use metrics::{MetricsRegistry, METRICS};
