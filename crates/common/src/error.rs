//! Common error types for the TRT-LLM client
//!
//! This module defines all error types used across the client crates.
//! Readiness and connection failures surface synchronously before any token is
//! produced; failures inside an open stream are wrapped in [`TrtLlmError::Stream`]
//! together with the request they belong to.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the TRT-LLM client
#[derive(Error, Debug)]
pub enum TrtLlmError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// gRPC communication errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// gRPC transport errors
    #[error("gRPC transport error: {0}")]
    GrpcTransport(#[from] tonic::transport::Error),

    /// HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Model did not become ready in time
    #[error("Failed to load {model} on Triton in {}s", timeout.as_secs_f64())]
    LoadTimeout { model: String, timeout: Duration },

    /// Call issued against a model that is not loaded
    #[error("Model {0} is not ready")]
    ModelNotReady(String),

    /// Failure inside an open stream, tagged with its request
    #[error("Stream {request_id} on model {model} failed: {source}")]
    Stream {
        request_id: String,
        model: String,
        #[source]
        source: Box<TrtLlmError>,
    },

    /// Error reported by the inference server
    #[error("Server error: {0}")]
    Server(String),

    /// Malformed server payload
    #[error("Decode error: {0}")]
    Decode(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TrtLlmError {
    /// Whether this error came from the network or the server rather than the caller
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TrtLlmError::Stream { .. }
                | TrtLlmError::Server(_)
                | TrtLlmError::Decode(_)
                | TrtLlmError::Grpc(_)
                | TrtLlmError::GrpcTransport(_)
                | TrtLlmError::Http(_)
                | TrtLlmError::Connection(_)
        )
    }

    /// Wrap an error raised inside a stream with the request it belongs to
    pub fn in_stream(self, request_id: impl Into<String>, model: impl Into<String>) -> Self {
        TrtLlmError::Stream {
            request_id: request_id.into(),
            model: model.into(),
            source: Box::new(self),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        TrtLlmError::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        TrtLlmError::Connection(msg.into())
    }

    /// Create a load timeout error
    pub fn load_timeout(model: impl Into<String>, timeout: Duration) -> Self {
        TrtLlmError::LoadTimeout {
            model: model.into(),
            timeout,
        }
    }

    /// Create a model-not-ready error
    pub fn model_not_ready(model: impl Into<String>) -> Self {
        TrtLlmError::ModelNotReady(model.into())
    }

    /// Create a server error
    pub fn server(msg: impl Into<String>) -> Self {
        TrtLlmError::Server(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        TrtLlmError::Decode(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        TrtLlmError::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        TrtLlmError::Internal(msg.into())
    }
}

/// Result type alias for TRT-LLM client operations
pub type Result<T> = std::result::Result<T, TrtLlmError>;
