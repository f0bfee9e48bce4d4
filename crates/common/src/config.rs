//! Configuration structures for the TRT-LLM client
//!
//! This module defines the client configuration: which server to talk to, which
//! transport to use, the generation defaults merged under every call, and the
//! stop words and trimming rules applied to generated text.
//! Configurations are loaded from YAML files and can be overridden by environment variables.

use crate::error::{Result, TrtLlmError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Inference server address (host:port or URL)
    pub server_url: String,

    /// Transport variant, fixed for the lifetime of a client
    #[serde(default)]
    pub transport: TransportKind,

    /// Model that receives generation requests
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Model that receives stop signals for an open stream
    #[serde(default = "default_cancel_model_name")]
    pub cancel_model_name: String,

    /// Maximum time to wait for a model to become ready
    #[serde(default = "default_load_timeout")]
    pub load_timeout_secs: u64,

    /// Interval between readiness polls while waiting for a model
    #[serde(default = "default_poll_interval")]
    pub readiness_poll_interval_ms: u64,

    /// Request one combined response over the stream instead of token streaming
    #[serde(default)]
    pub force_batch: bool,

    /// Decoded values that terminate a stream and are never forwarded
    #[serde(default = "default_stop_words")]
    pub stop_words: Vec<String>,

    /// Seed sent with every request
    #[serde(default)]
    pub random_seed: u64,

    /// Rules for cutting echoed prompts out of batch responses
    #[serde(default)]
    pub trim: TrimConfig,

    /// Sampling defaults merged under per-call overrides
    #[serde(default)]
    pub defaults: GenerationDefaults,

    /// HTTP transport settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Transport variant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent gRPC stream with token-by-token delivery
    #[default]
    Streaming,

    /// One-shot HTTP request/response
    Batch,
}

impl std::str::FromStr for TransportKind {
    type Err = TrtLlmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "streaming" | "grpc" => Ok(TransportKind::Streaming),
            "batch" | "http" => Ok(TransportKind::Batch),
            other => Err(TrtLlmError::config(format!("Invalid transport: {}", other))),
        }
    }
}

/// Delimiters used to trim batch responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrimConfig {
    /// Marker that closes the echoed instruction
    #[serde(default = "default_instruction_close")]
    pub instruction_close: String,

    /// Marker that ends the generated answer
    #[serde(default = "default_end_of_sequence")]
    pub end_of_sequence: String,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            instruction_close: default_instruction_close(),
            end_of_sequence: default_end_of_sequence(),
        }
    }
}

/// Sampling defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationDefaults {
    /// Maximum number of tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_top_k")]
    pub top_k: u32,

    #[serde(default)]
    pub top_p: f32,

    #[serde(default = "default_one")]
    pub temperature: f32,

    #[serde(default = "default_one")]
    pub repetition_penalty: f32,

    #[serde(default = "default_one")]
    pub length_penalty: f32,

    #[serde(default = "default_beam_width")]
    pub beam_width: u32,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            top_k: default_top_k(),
            top_p: 0.0,
            temperature: default_one(),
            repetition_penalty: default_one(),
            length_penalty: default_one(),
            beam_width: default_beam_width(),
        }
    }
}

/// HTTP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Bearer token for hosted endpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Additional headers sent with every request
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,

    /// Use the binary tensor data extension instead of JSON arrays
    #[serde(default = "default_binary_data")]
    pub binary_data: bool,

    /// Per-request timeout (no timeout when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            extra_headers: HashMap::new(),
            binary_data: default_binary_data(),
            request_timeout_secs: None,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Default value functions
fn default_model_name() -> String {
    "ensemble".to_string()
}

fn default_cancel_model_name() -> String {
    "tensorrt_llm".to_string()
}

fn default_load_timeout() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    10
}

fn default_stop_words() -> Vec<String> {
    vec!["</s>".to_string()]
}

fn default_instruction_close() -> String {
    "[/INST]".to_string()
}

fn default_end_of_sequence() -> String {
    "</s>".to_string()
}

fn default_max_tokens() -> u32 {
    100
}

fn default_top_k() -> u32 {
    1
}

fn default_one() -> f32 {
    1.0
}

fn default_beam_width() -> u32 {
    1
}

fn default_binary_data() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ClientConfig {
    /// Configuration with defaults for everything except the server address
    pub fn new(server_url: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            server_url: server_url.into(),
            transport,
            model_name: default_model_name(),
            cancel_model_name: default_cancel_model_name(),
            load_timeout_secs: default_load_timeout(),
            readiness_poll_interval_ms: default_poll_interval(),
            force_batch: false,
            stop_words: default_stop_words(),
            random_seed: 0,
            trim: TrimConfig::default(),
            defaults: GenerationDefaults::default(),
            http: HttpConfig::default(),
            observability: None,
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            TrtLlmError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config = Self::from_yaml(&content).map_err(|e| {
            TrtLlmError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        Ok(config)
    }

    /// Parse and validate configuration from a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(content)
            .map_err(|e| TrtLlmError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let server_url = std::env::var("TRTLLM_SERVER_URL")
            .unwrap_or_else(|_| "localhost:8001".to_string());
        let transport = match std::env::var("TRTLLM_TRANSPORT") {
            Ok(value) => value.parse()?,
            Err(_) => TransportKind::Streaming,
        };

        let mut config = ClientConfig::new(server_url, transport);

        if let Ok(model_name) = std::env::var("TRTLLM_MODEL_NAME") {
            config.model_name = model_name;
        }
        if let Ok(api_key) = std::env::var("TRTLLM_API_KEY") {
            config.http.api_key = Some(api_key);
        }
        if let Ok(force_batch) = std::env::var("TRTLLM_FORCE_BATCH") {
            config.force_batch = force_batch.parse().map_err(|_| {
                TrtLlmError::Config(format!("Invalid TRTLLM_FORCE_BATCH: {}", force_batch))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(TrtLlmError::config("server_url must not be empty"));
        }
        if self.model_name.trim().is_empty() {
            return Err(TrtLlmError::config("model_name must not be empty"));
        }
        if self.cancel_model_name.trim().is_empty() {
            return Err(TrtLlmError::config("cancel_model_name must not be empty"));
        }
        if self.stop_words.iter().any(|w| w.is_empty()) {
            return Err(TrtLlmError::config("stop_words must not contain empty entries"));
        }
        if self.readiness_poll_interval_ms == 0 {
            return Err(TrtLlmError::config("readiness_poll_interval_ms must be positive"));
        }
        Ok(())
    }

    /// Get the model load timeout as Duration
    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    /// Get the readiness poll interval as Duration
    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_yaml() {
        let config = ClientConfig::from_yaml("server_url: localhost:8001\n").unwrap();

        assert_eq!(config.transport, TransportKind::Streaming);
        assert_eq!(config.model_name, "ensemble");
        assert_eq!(config.cancel_model_name, "tensorrt_llm");
        assert_eq!(config.stop_words, vec!["</s>".to_string()]);
        assert_eq!(config.load_timeout(), Duration::from_secs(1000));
        assert_eq!(config.defaults.max_tokens, 100);
        assert_eq!(config.defaults.top_k, 1);
        assert_eq!(config.trim.instruction_close, "[/INST]");
        assert!(config.http.binary_data);
    }

    #[test]
    fn test_config_batch_transport_with_headers() {
        let yaml = r#"
server_url: https://endpoint.example.com
transport: batch
force_batch: true
http:
  api_key: secret
  extra_headers:
    azureml-model-deployment: llama
defaults:
  max_tokens: 256
  temperature: 0.2
"#;
        let config = ClientConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.transport, TransportKind::Batch);
        assert!(config.force_batch);
        assert_eq!(config.http.api_key.as_deref(), Some("secret"));
        assert_eq!(
            config
                .http
                .extra_headers
                .get("azureml-model-deployment")
                .map(String::as_str),
            Some("llama")
        );
        assert_eq!(config.defaults.max_tokens, 256);
        assert_eq!(config.defaults.temperature, 0.2);
        assert_eq!(config.defaults.beam_width, 1);
    }

    #[test]
    fn test_config_validation_rejects_empty_stop_word() {
        let mut config = ClientConfig::new("localhost:8001", TransportKind::Streaming);
        assert!(config.validate().is_ok());

        config.stop_words.push(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_zero_poll_interval() {
        let mut config = ClientConfig::new("localhost:8001", TransportKind::Batch);
        config.readiness_poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("grpc".parse::<TransportKind>().unwrap(), TransportKind::Streaming);
        assert_eq!("HTTP".parse::<TransportKind>().unwrap(), TransportKind::Batch);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }
}
