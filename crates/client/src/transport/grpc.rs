//! gRPC transport
//!
//! Talks to Triton's `GRPCInferenceService`. Streaming requests share one
//! bidirectional `ModelStreamInfer` call per request: the generation request
//! and, when the stream is stopped gracefully, the stop request both go out on
//! the same outbound channel.

use super::{
    normalize_url, BatchTransport, InferOutput, InferResult, InstanceGroup, ModelTarget,
    OutputPayload, PartialResponse, StreamControl, StreamingTransport, Transport,
};
use crate::stream::StreamDelivery;
use crate::tensor::{build_stop_inputs, NamedTensor, RequestedOutput};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, trace, warn};
use trtllm_common::{Result, TrtLlmError};
use trtllm_proto::{
    GrpcInferenceServiceClient, InferInputTensor, InferParameter, InferRequestedOutputTensor,
    ModelConfigRequest, ModelInferRequest, ModelInferResponse, ModelReadyRequest,
    ModelStreamInferResponse, RepositoryIndexRequest, RepositoryModelLoadRequest,
};

/// Response parameter carrying the server's last-response flag
pub const FINAL_RESPONSE_PARAM: &str = "triton_final_response";

/// Request parameter marking a stop request on a streaming call
pub const STREAMING_PARAM: &str = "Streaming";

/// Upper bound on a single decoded message
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Triton gRPC transport
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    client: GrpcInferenceServiceClient<Channel>,
    url: String,
}

impl GrpcTransport {
    /// Connect to `server_url`, failing if the server cannot be reached
    pub async fn connect(server_url: &str) -> Result<Self> {
        let url = normalize_url(server_url);
        let channel = Endpoint::from_shared(url.clone())?
            .connect()
            .await
            .map_err(|e| TrtLlmError::connection(format!("failed to connect to {}: {}", url, e)))?;
        info!("Connected to Triton gRPC endpoint at {}", url);
        Ok(Self::from_channel(channel, url))
    }

    /// Create a transport that connects on first use
    pub fn connect_lazy(server_url: &str) -> Result<Self> {
        let url = normalize_url(server_url);
        let channel = Endpoint::from_shared(url.clone())?.connect_lazy();
        Ok(Self::from_channel(channel, url))
    }

    fn from_channel(channel: Channel, url: String) -> Self {
        let client = GrpcInferenceServiceClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);
        Self { client, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    // Clients share the underlying channel
    fn client(&self) -> GrpcInferenceServiceClient<Channel> {
        self.client.clone()
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    fn kind(&self) -> &'static str {
        "grpc"
    }

    async fn is_model_ready(&self, model: &str) -> Result<bool> {
        let response = self
            .client()
            .model_ready(ModelReadyRequest {
                name: model.to_string(),
                version: String::new(),
            })
            .await?;
        Ok(response.into_inner().ready)
    }

    async fn load_model(&self, model: &str) -> Result<()> {
        self.client()
            .repository_model_load(RepositoryModelLoadRequest {
                repository_name: String::new(),
                model_name: model.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn model_instance_groups(&self, model: &str) -> Result<Vec<InstanceGroup>> {
        let response = self
            .client()
            .model_config(ModelConfigRequest {
                name: model.to_string(),
                version: String::new(),
            })
            .await?;

        let config = response.into_inner().config.ok_or_else(|| {
            TrtLlmError::decode(format!("config response for {} has no config", model))
        })?;

        Ok(config
            .instance_group
            .into_iter()
            .map(|group| InstanceGroup {
                name: group.name,
                count: group.count.max(0) as u32,
                gpus: group.gpus,
            })
            .collect())
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client()
            .repository_index(RepositoryIndexRequest {
                repository_name: String::new(),
                ready: false,
            })
            .await?;
        Ok(response.into_inner().models.into_iter().map(|m| m.name).collect())
    }
}

#[async_trait]
impl BatchTransport for GrpcTransport {
    async fn infer(
        &self,
        model: &str,
        inputs: &[NamedTensor],
        outputs: &[RequestedOutput],
    ) -> Result<InferResult> {
        let request = build_infer_request(model, "", inputs, outputs, HashMap::new());
        let response = self.client().model_infer(request).await?.into_inner();

        Ok(InferResult {
            model_name: response.model_name.clone(),
            id: response.id.clone(),
            outputs: convert_outputs(response)?,
        })
    }
}

#[async_trait]
impl StreamingTransport for GrpcTransport {
    async fn open_stream(
        &self,
        target: &ModelTarget,
        inputs: Vec<NamedTensor>,
        outputs: Vec<RequestedOutput>,
        mut delivery: StreamDelivery,
    ) -> Result<Box<dyn StreamControl>> {
        let (outbound, requests) = mpsc::unbounded_channel();
        let request = build_infer_request(
            &target.model_name,
            &target.request_id,
            &inputs,
            &outputs,
            HashMap::new(),
        );
        outbound
            .send(request)
            .map_err(|_| TrtLlmError::internal("outbound request channel closed"))?;

        let response = self
            .client()
            .model_stream_infer(UnboundedReceiverStream::new(requests))
            .await?;
        let mut inbound = response.into_inner();

        debug!(
            "Opened stream for request {} on {}",
            target.request_id, target.model_name
        );

        let request_id = target.request_id.clone();
        let reader = tokio::spawn(async move {
            loop {
                let next = match inbound.message().await {
                    Ok(Some(message)) => partial_from_stream(message),
                    Ok(None) => {
                        trace!("Server closed stream for request {}", request_id);
                        break;
                    }
                    Err(status) => Err(TrtLlmError::from(status)),
                };
                if !delivery.deliver(next) {
                    break;
                }
            }
        });

        Ok(Box::new(GrpcStreamSession {
            outbound: Some(outbound),
            reader: Some(reader),
        }))
    }
}

/// An open `ModelStreamInfer` call
#[derive(Debug)]
struct GrpcStreamSession {
    outbound: Option<mpsc::UnboundedSender<ModelInferRequest>>,
    reader: Option<JoinHandle<()>>,
}

impl StreamControl for GrpcStreamSession {
    fn send_stop(&mut self, model: &str, request_id: &str, graceful: bool) -> Result<()> {
        let Some(outbound) = self.outbound.take() else {
            return Ok(());
        };

        if graceful {
            debug!("Sending stop signal for request {} to {}", request_id, model);
            if outbound.send(build_stop_request(model, request_id)).is_err() {
                // The call already ended on the server side
                debug!("Stream for request {} closed before stop signal", request_id);
            }
        }
        // Dropping the sender half-closes the call
        drop(outbound);

        if let Some(reader) = self.reader.take() {
            if !graceful {
                reader.abort();
            }
        }
        Ok(())
    }
}

impl Drop for GrpcStreamSession {
    fn drop(&mut self) {
        if self.outbound.is_some() {
            warn!("Stream session dropped without being stopped");
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Build a `ModelInferRequest` with all tensor data in `raw_input_contents`
pub(crate) fn build_infer_request(
    model: &str,
    request_id: &str,
    inputs: &[NamedTensor],
    outputs: &[RequestedOutput],
    parameters: HashMap<String, InferParameter>,
) -> ModelInferRequest {
    ModelInferRequest {
        model_name: model.to_string(),
        model_version: String::new(),
        id: request_id.to_string(),
        parameters,
        inputs: inputs
            .iter()
            .map(|tensor| InferInputTensor {
                name: tensor.name.clone(),
                datatype: tensor.dtype.as_str().to_string(),
                shape: tensor.shape.clone(),
                parameters: HashMap::new(),
                contents: None,
            })
            .collect(),
        outputs: outputs
            .iter()
            .map(|output| InferRequestedOutputTensor {
                name: output.name.clone(),
                parameters: HashMap::new(),
            })
            .collect(),
        raw_input_contents: inputs.iter().map(|tensor| tensor.data.clone()).collect(),
    }
}

/// The request that stops generation for `request_id`
pub(crate) fn build_stop_request(model: &str, request_id: &str) -> ModelInferRequest {
    let mut parameters = HashMap::new();
    parameters.insert(STREAMING_PARAM.to_string(), InferParameter::bool(true));
    build_infer_request(model, request_id, &build_stop_inputs(), &[], parameters)
}

fn convert_outputs(response: ModelInferResponse) -> Result<Vec<InferOutput>> {
    let ModelInferResponse {
        outputs,
        mut raw_output_contents,
        ..
    } = response;
    let has_raw = !raw_output_contents.is_empty();

    outputs
        .into_iter()
        .enumerate()
        .map(|(i, output)| {
            let payload = if has_raw {
                let raw = raw_output_contents.get_mut(i).ok_or_else(|| {
                    TrtLlmError::decode(format!("no raw contents for output {}", output.name))
                })?;
                OutputPayload::Raw(std::mem::take(raw))
            } else if let Some(contents) = output.contents {
                OutputPayload::Elements(contents.bytes_contents)
            } else {
                return Err(TrtLlmError::decode(format!("output {} carries no data", output.name)));
            };

            Ok(InferOutput {
                name: output.name,
                datatype: output.datatype,
                shape: output.shape,
                payload,
            })
        })
        .collect()
}

/// Turn one streamed message into a partial response or the error it reports
pub(crate) fn partial_from_stream(message: ModelStreamInferResponse) -> Result<PartialResponse> {
    if !message.error_message.is_empty() {
        return Err(TrtLlmError::server(message.error_message));
    }

    let response = message
        .infer_response
        .ok_or_else(|| TrtLlmError::decode("stream message has neither a response nor an error"))?;

    let final_response = response
        .parameters
        .get(FINAL_RESPONSE_PARAM)
        .and_then(InferParameter::as_bool)
        .unwrap_or(false);

    Ok(PartialResponse {
        outputs: convert_outputs(response)?,
        final_response,
    })
}
