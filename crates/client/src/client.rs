//! Client facade
//!
//! Owns the transports chosen at construction and exposes the two generation
//! calls: [`Client::stream`] for token-by-token delivery and [`Client::request`]
//! for a single trimmed response.

use crate::postprocess::{decode_text, trim_batch_response};
use crate::readiness::ReadinessPolicy;
use crate::request_id::{RandomRequestIds, RequestIdGenerator, RequestRegistry};
use crate::stream::{StreamDelivery, TokenStream};
use crate::tensor::{build_outputs, GenerationOverrides, InferenceParameters, TEXT_OUTPUT};
use crate::transport::{
    BatchTransport, GrpcTransport, HttpTransport, ModelTarget, StreamingTransport,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use trtllm_common::{ClientConfig, Result, TransportKind, TrtLlmError, METRICS};

/// Per-call options for [`Client::stream`]
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Caller-chosen correlation id; generated when unset
    pub request_id: Option<String>,
    /// Override the configured forced-batch mode
    pub force_batch: Option<bool>,
    pub overrides: GenerationOverrides,
}

impl StreamOptions {
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_force_batch(mut self, force_batch: bool) -> Self {
        self.force_batch = Some(force_batch);
        self
    }

    pub fn with_overrides(mut self, overrides: GenerationOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Inference client for a TensorRT-LLM model served by Triton
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    batch: Arc<dyn BatchTransport>,
    streaming: Option<Arc<dyn StreamingTransport>>,
    ids: Arc<dyn RequestIdGenerator>,
    registry: Arc<RequestRegistry>,
    stop_words: Arc<[String]>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_url", &self.config.server_url)
            .field("transport", &self.batch.kind())
            .field("streaming", &self.streaming.is_some())
            .field("in_flight", &self.registry.in_flight())
            .finish()
    }
}

impl Client {
    /// Build a client with the transport named in `config`
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        match config.transport {
            TransportKind::Streaming => {
                let transport = Arc::new(GrpcTransport::connect(&config.server_url).await?);
                Ok(Self::with_streaming_transport(config, transport))
            }
            TransportKind::Batch => {
                let transport = Arc::new(HttpTransport::new(&config.server_url, &config.http)?);
                Ok(Self::with_batch_transport(config, transport))
            }
        }
    }

    /// Build a client over a transport that can stream and serve batch calls
    pub fn with_streaming_transport<T>(config: ClientConfig, transport: Arc<T>) -> Self
    where
        T: StreamingTransport + BatchTransport + 'static,
    {
        let streaming: Arc<dyn StreamingTransport> = transport.clone();
        Self::build(config, transport, Some(streaming))
    }

    /// Build a client over a batch-only transport
    pub fn with_batch_transport<T>(config: ClientConfig, transport: Arc<T>) -> Self
    where
        T: BatchTransport + 'static,
    {
        Self::build(config, transport, None)
    }

    fn build(
        config: ClientConfig,
        batch: Arc<dyn BatchTransport>,
        streaming: Option<Arc<dyn StreamingTransport>>,
    ) -> Self {
        let stop_words: Arc<[String]> = Arc::from(config.stop_words.clone());
        Self {
            config: Arc::new(config),
            batch,
            streaming,
            ids: Arc::new(RandomRequestIds),
            registry: RequestRegistry::new(),
            stop_words,
        }
    }

    /// Replace the request id source
    pub fn with_request_ids(mut self, ids: Arc<dyn RequestIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether token streaming is available
    pub fn supports_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    /// Number of streams currently open through this client
    pub fn in_flight(&self) -> usize {
        self.registry.in_flight()
    }

    pub fn readiness_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy::new(self.config.load_timeout(), self.config.readiness_poll_interval())
    }

    /// Wait until `model` is ready, loading it if needed
    pub async fn ensure_model_ready(&self, model: &str) -> Result<()> {
        self.batch.ensure_model_ready(model, &self.readiness_policy()).await
    }

    /// Models in the server's repository
    pub async fn list_models(&self) -> Result<Vec<String>> {
        self.batch.list_models().await
    }

    /// Number of instances serving `model`
    pub async fn model_concurrency(&self, model: &str) -> Result<u32> {
        self.batch.model_concurrency(model, &self.readiness_policy()).await
    }

    /// Stream a generation for `prompt`
    ///
    /// Loads the model if needed, then opens the stream. Chunks are produced
    /// only as the returned [`TokenStream`] is pulled.
    pub async fn stream(
        &self,
        model: &str,
        prompt: &str,
        options: StreamOptions,
    ) -> Result<TokenStream> {
        self.ensure_model_ready(model).await?;
        self.open_token_stream(model, prompt, options).await
    }

    /// Open a stream against a model that must already be loaded
    pub async fn open_token_stream(
        &self,
        model: &str,
        prompt: &str,
        options: StreamOptions,
    ) -> Result<TokenStream> {
        let streaming = self.streaming.as_ref().ok_or_else(|| {
            TrtLlmError::config(format!("{} transport cannot stream", self.batch.kind()))
        })?;

        if !streaming.is_model_ready(model).await? {
            return Err(TrtLlmError::model_not_ready(model));
        }

        let lease = match &options.request_id {
            Some(id) => self.registry.reserve(id).ok_or_else(|| {
                TrtLlmError::invalid_input(format!("request id {} is already in flight", id))
            })?,
            None => self.registry.reserve_generated(self.ids.as_ref())?,
        };
        let request_id = lease.request_id().to_string();
        let force_batch = options.force_batch.unwrap_or(self.config.force_batch);

        let params = InferenceParameters::resolve(
            prompt,
            &self.config.defaults,
            &options.overrides,
            self.config.random_seed,
            !force_batch,
        );

        let (delivery, events) = StreamDelivery::channel(
            Arc::clone(&self.stop_words),
            force_batch,
            self.config.trim.clone(),
        );
        let target = ModelTarget {
            model_name: model.to_string(),
            request_id: request_id.clone(),
        };

        METRICS.client.requests_total.inc();
        let control = match streaming
            .open_stream(&target, params.to_tensors(), build_outputs(), delivery)
            .await
        {
            Ok(control) => control,
            Err(e) => {
                METRICS.client.requests_failed.inc();
                warn!("Failed to open stream {} on {}: {}", request_id, model, e);
                return Err(e);
            }
        };
        METRICS.client.streams_opened.inc();
        debug!("Streaming request {} on {} (force_batch={})", request_id, model, force_batch);

        Ok(TokenStream::new(
            events,
            control,
            model,
            self.config.cancel_model_name.clone(),
            request_id,
            force_batch,
            Some(lease),
        ))
    }

    /// Generate a complete response for `prompt` in one request
    pub async fn request(
        &self,
        model: &str,
        prompt: &str,
        overrides: &GenerationOverrides,
    ) -> Result<String> {
        self.ensure_model_ready(model).await?;
        self.infer_text(model, prompt, overrides).await
    }

    /// Single request against a model that must already be loaded
    pub async fn infer_text(
        &self,
        model: &str,
        prompt: &str,
        overrides: &GenerationOverrides,
    ) -> Result<String> {
        if !self.batch.is_model_ready(model).await? {
            return Err(TrtLlmError::model_not_ready(model));
        }

        let params = InferenceParameters::resolve(
            prompt,
            &self.config.defaults,
            overrides,
            self.config.random_seed,
            false,
        );

        METRICS.client.requests_total.inc();
        let start = Instant::now();
        let result = match self.batch.infer(model, &params.to_tensors(), &build_outputs()).await {
            Ok(result) => result,
            Err(e) => {
                METRICS.client.requests_failed.inc();
                return Err(e);
            }
        };
        METRICS
            .client
            .request_duration
            .observe(start.elapsed().as_secs_f64());

        let output = result.output(TEXT_OUTPUT).ok_or_else(|| {
            TrtLlmError::decode(format!("response from {} has no {}", model, TEXT_OUTPUT))
        })?;
        let text = decode_text(output)?;
        info!("Request to {} returned {} bytes in {:?}", model, text.len(), start.elapsed());

        Ok(trim_batch_response(&text, &self.config.trim))
    }
}
