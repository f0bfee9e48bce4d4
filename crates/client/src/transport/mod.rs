//! Transports to the inference server
//!
//! [`Transport`] is the capability every transport shares: readiness, model
//! loading and the model catalog. [`StreamingTransport`] adds a persistent
//! duplex stream with callback delivery, [`BatchTransport`] adds one-shot
//! inference. The gRPC transport implements both; the HTTP transport is
//! batch only.

pub mod grpc;
pub mod http;

pub use grpc::GrpcTransport;
pub use http::HttpTransport;

use crate::readiness::{self, ReadinessPolicy};
use crate::stream::StreamDelivery;
use crate::tensor::{NamedTensor, RequestedOutput};
use async_trait::async_trait;
use trtllm_common::Result;

/// The model a request is addressed to and its correlation key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTarget {
    pub model_name: String,
    pub request_id: String,
}

/// One instance group from a model configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceGroup {
    pub name: String,
    pub count: u32,
    pub gpus: Vec<i32>,
}

/// Output tensor data as received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputPayload {
    /// Raw wire bytes (BYTES elements are length-prefixed)
    Raw(Vec<u8>),
    /// Already-separated byte-string elements
    Elements(Vec<Vec<u8>>),
}

/// A named output tensor in a server response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferOutput {
    pub name: String,
    pub datatype: String,
    pub shape: Vec<i64>,
    pub payload: OutputPayload,
}

/// A complete inference response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferResult {
    pub model_name: String,
    pub id: String,
    pub outputs: Vec<InferOutput>,
}

impl InferResult {
    /// Look up an output by name
    pub fn output(&self, name: &str) -> Option<&InferOutput> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

/// One message received on an open stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialResponse {
    /// Outputs carried by this message; the closing message may have none
    pub outputs: Vec<InferOutput>,
    /// Server marked this as the last response for the request
    pub final_response: bool,
}

/// Capabilities shared by every transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs
    fn kind(&self) -> &'static str;

    async fn is_model_ready(&self, model: &str) -> Result<bool>;

    async fn load_model(&self, model: &str) -> Result<()>;

    async fn model_instance_groups(&self, model: &str) -> Result<Vec<InstanceGroup>>;

    /// Names of the models in the server's repository
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Wait until `model` is ready, loading it if needed
    async fn ensure_model_ready(&self, model: &str, policy: &ReadinessPolicy) -> Result<()> {
        readiness::wait_until_ready(self, model, policy).await
    }

    /// Number of model instances the server runs
    ///
    /// Sum of count x GPUs over the instance groups, saturating at `u32::MAX`.
    async fn model_concurrency(&self, model: &str, policy: &ReadinessPolicy) -> Result<u32> {
        self.ensure_model_ready(model, policy).await?;
        let groups = self.model_instance_groups(model).await?;
        let total = groups
            .iter()
            .map(|g| u64::from(g.count).saturating_mul(g.gpus.len() as u64))
            .fold(0u64, u64::saturating_add);
        Ok(u32::try_from(total).unwrap_or(u32::MAX))
    }
}

/// One-shot request/response inference
#[async_trait]
pub trait BatchTransport: Transport {
    /// Send one request and wait for the complete response
    async fn infer(
        &self,
        model: &str,
        inputs: &[NamedTensor],
        outputs: &[RequestedOutput],
    ) -> Result<InferResult>;
}

/// Persistent duplex streaming inference
#[async_trait]
pub trait StreamingTransport: Transport {
    /// Open a stream and send the request on it
    ///
    /// Each partial server response is handed to `delivery` from a background
    /// task. Errors establishing the stream are returned here, before any
    /// response is delivered.
    async fn open_stream(
        &self,
        target: &ModelTarget,
        inputs: Vec<NamedTensor>,
        outputs: Vec<RequestedOutput>,
        delivery: StreamDelivery,
    ) -> Result<Box<dyn StreamControl>>;
}

/// Handle to an open stream
pub trait StreamControl: Send {
    /// Stop the stream
    ///
    /// When `graceful`, the stop tensors are sent to `model` for `request_id`
    /// on the same stream first. The local stream handle is always released.
    /// Calling this again after release is a no-op.
    fn send_stop(&mut self, model: &str, request_id: &str, graceful: bool) -> Result<()>;
}

/// Add a scheme to bare `host:port` addresses and drop trailing slashes
pub(crate) fn normalize_url(server_url: &str) -> String {
    let url = server_url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}
