//! Text-generation adapter
//!
//! [`TensorRtLlm`] answers "generate a complete string for this prompt" on top
//! of [`Client`]. When the client can stream, tokens are forwarded to an
//! optional callback as they arrive and throughput is logged; otherwise a
//! single batch request is made.

use crate::client::{Client, StreamOptions};
use crate::tensor::GenerationOverrides;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::info;
use trtllm_common::{Result, METRICS};

/// Identifier reported by [`TensorRtLlm::llm_type`]
pub const LLM_TYPE: &str = "triton_tensorrt";

/// Generation adapter bound to one model
#[derive(Debug, Clone)]
pub struct TensorRtLlm {
    client: Client,
    model_name: String,
}

impl TensorRtLlm {
    /// Adapter for the model named in the client's configuration
    pub fn new(client: Client) -> Self {
        let model_name = client.config().model_name.clone();
        Self { client, model_name }
    }

    pub fn with_model(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn llm_type(&self) -> &'static str {
        LLM_TYPE
    }

    /// Parameters that identify this adapter's output
    pub fn identifying_params(&self) -> BTreeMap<&'static str, String> {
        let config = self.client.config();
        let defaults = &config.defaults;

        let mut params = BTreeMap::new();
        params.insert("server_url", config.server_url.clone());
        params.insert("model_name", self.model_name.clone());
        params.insert("tokens", defaults.max_tokens.to_string());
        params.insert("top_k", defaults.top_k.to_string());
        params.insert("top_p", defaults.top_p.to_string());
        params.insert("temperature", defaults.temperature.to_string());
        params.insert("repetition_penalty", defaults.repetition_penalty.to_string());
        params.insert("length_penalty", defaults.length_penalty.to_string());
        params.insert("beam_width", defaults.beam_width.to_string());
        params
    }

    /// Generate the full response for `prompt`
    ///
    /// `on_token` sees every streamed chunk in order, or the whole text once
    /// when the client has no streaming transport.
    pub async fn generate<F>(
        &self,
        prompt: &str,
        overrides: &GenerationOverrides,
        mut on_token: Option<F>,
    ) -> Result<String>
    where
        F: FnMut(&str),
    {
        self.client.ensure_model_ready(&self.model_name).await?;

        if !self.client.supports_streaming() {
            let text = self.client.infer_text(&self.model_name, prompt, overrides).await?;
            if let Some(callback) = on_token.as_mut() {
                callback(&text);
            }
            return Ok(text);
        }

        let options = StreamOptions::default().with_overrides(overrides.clone());
        let mut stream = self
            .client
            .open_token_stream(&self.model_name, prompt, options)
            .await?;

        let start = Instant::now();
        let mut response = String::new();
        let mut tokens_generated = 0usize;
        while let Some(token) = stream.next_chunk().await? {
            if let Some(callback) = on_token.as_mut() {
                callback(&token);
            }
            tokens_generated += 1;
            response.push_str(&token);
        }

        let elapsed = start.elapsed().as_secs_f64();
        info!("Generated {} tokens in {:.3} seconds", tokens_generated, elapsed);
        if elapsed > 0.0 {
            let rate = tokens_generated as f64 / elapsed;
            METRICS.client.tokens_per_second.observe(rate);
            info!("{:.2} tokens/sec", rate);
        }

        Ok(response)
    }
}
