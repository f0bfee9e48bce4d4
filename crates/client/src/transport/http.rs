//! HTTP transport
//!
//! One-shot requests against Triton's KServe v2 REST API. Tensor data is sent
//! with the binary data extension by default: a JSON header followed by the
//! raw tensor bytes, with the header length in `Inference-Header-Content-Length`.
//! Servers or proxies without the extension can use plain JSON arrays instead.

use super::{
    normalize_url, BatchTransport, InferOutput, InferResult, InstanceGroup, OutputPayload,
    Transport,
};
use crate::tensor::{NamedTensor, RequestedOutput, TensorDType};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};
use trtllm_common::{HttpConfig, Result, TrtLlmError};

/// Header carrying the length of the JSON part of a binary-extension body
pub const HEADER_LENGTH: &str = "Inference-Header-Content-Length";

/// Triton HTTP transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    binary_data: bool,
}

impl HttpTransport {
    pub fn new(server_url: &str, config: &HttpConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| TrtLlmError::config(format!("Invalid API key: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &config.extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TrtLlmError::config(format!("Invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                TrtLlmError::config(format!("Invalid value for header {}: {}", name, e))
            })?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        let base_url = normalize_url(server_url);
        info!("Using Triton HTTP endpoint at {}", base_url);

        Ok(Self {
            client: builder.build()?,
            base_url,
            binary_data: config.binary_data,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2/{}", self.base_url, path)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn is_model_ready(&self, model: &str) -> Result<bool> {
        let response = self.client.get(self.url(&format!("models/{}/ready", model))).send().await?;
        Ok(response.status().is_success())
    }

    async fn load_model(&self, model: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("repository/models/{}/load", model)))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn model_instance_groups(&self, model: &str) -> Result<Vec<InstanceGroup>> {
        let response = self.client.get(self.url(&format!("models/{}/config", model))).send().await?;
        let config: ModelConfigBody = check_status(response).await?.json().await?;

        Ok(config
            .instance_group
            .into_iter()
            .map(|group| InstanceGroup {
                name: group.name,
                count: group.count,
                gpus: group.gpus,
            })
            .collect())
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .post(self.url("repository/index"))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let index: Vec<ModelIndexEntry> = check_status(response).await?.json().await?;
        Ok(index.into_iter().map(|entry| entry.name).collect())
    }
}

#[async_trait]
impl BatchTransport for HttpTransport {
    async fn infer(
        &self,
        model: &str,
        inputs: &[NamedTensor],
        outputs: &[RequestedOutput],
    ) -> Result<InferResult> {
        let body = encode_infer_request(inputs, outputs, self.binary_data)?;
        debug!("Sending {} byte infer request to {}", body.body.len(), model);

        let mut request = self
            .client
            .post(self.url(&format!("models/{}/infer", model)))
            .body(body.body);
        request = match body.header_length {
            Some(len) => request
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(HEADER_LENGTH, len.to_string()),
            None => request.header(CONTENT_TYPE, "application/json"),
        };

        let response = check_status(request.send().await?).await?;
        let header_length = response
            .headers()
            .get(HEADER_LENGTH)
            .map(|value| {
                value
                    .to_str()
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(|| TrtLlmError::decode(format!("invalid {} header", HEADER_LENGTH)))
            })
            .transpose()?;
        let bytes = response.bytes().await?;

        decode_infer_response(&bytes, header_length)
    }
}

/// Turn a non-success status into a server error carrying the body's message
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(TrtLlmError::server(describe_failure(status, &body)))
}

fn describe_failure(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| body.trim().to_string());
    if message.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, message)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct ModelConfigBody {
    #[serde(default)]
    instance_group: Vec<InstanceGroupBody>,
}

#[derive(Debug, Deserialize)]
struct InstanceGroupBody {
    #[serde(default)]
    name: String,
    #[serde(default)]
    count: u32,
    #[serde(default)]
    gpus: Vec<i32>,
}

#[derive(Debug, Deserialize)]
struct ModelIndexEntry {
    name: String,
}

#[derive(Debug, Serialize)]
struct InferRequestBody {
    inputs: Vec<InputBody>,
    outputs: Vec<RequestedOutputBody>,
}

#[derive(Debug, Serialize)]
struct InputBody {
    name: String,
    shape: Vec<i64>,
    datatype: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<BinarySize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Vec<Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BinarySize {
    binary_data_size: usize,
}

#[derive(Debug, Serialize)]
struct RequestedOutputBody {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<BinaryFlag>,
}

#[derive(Debug, Serialize)]
struct BinaryFlag {
    binary_data: bool,
}

#[derive(Debug, Deserialize)]
struct InferResponseBody {
    #[serde(default)]
    model_name: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    outputs: Vec<OutputBody>,
}

#[derive(Debug, Deserialize)]
struct OutputBody {
    name: String,
    datatype: String,
    #[serde(default)]
    shape: Vec<i64>,
    #[serde(default)]
    parameters: Option<OutputParameters>,
    #[serde(default)]
    data: Option<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct OutputParameters {
    #[serde(default)]
    binary_data_size: Option<usize>,
}

/// An encoded infer request body
#[derive(Debug)]
pub(crate) struct EncodedRequest {
    pub body: Vec<u8>,
    /// Length of the JSON header when the binary extension is used
    pub header_length: Option<usize>,
}

pub(crate) fn encode_infer_request(
    inputs: &[NamedTensor],
    outputs: &[RequestedOutput],
    binary_data: bool,
) -> Result<EncodedRequest> {
    let inputs_json = inputs
        .iter()
        .map(|tensor| {
            let (parameters, data) = if binary_data {
                (
                    Some(BinarySize {
                        binary_data_size: tensor.data.len(),
                    }),
                    None,
                )
            } else {
                (None, Some(tensor_to_json(tensor)?))
            };
            Ok(InputBody {
                name: tensor.name.clone(),
                shape: tensor.shape.clone(),
                datatype: tensor.dtype.as_str(),
                parameters,
                data,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let outputs_json = outputs
        .iter()
        .map(|output| RequestedOutputBody {
            name: output.name.clone(),
            parameters: binary_data.then_some(BinaryFlag { binary_data: true }),
        })
        .collect();

    let mut body = serde_json::to_vec(&InferRequestBody {
        inputs: inputs_json,
        outputs: outputs_json,
    })?;

    if !binary_data {
        return Ok(EncodedRequest {
            body,
            header_length: None,
        });
    }

    let header_length = body.len();
    for tensor in inputs {
        body.extend_from_slice(&tensor.data);
    }
    Ok(EncodedRequest {
        body,
        header_length: Some(header_length),
    })
}

fn tensor_to_json(tensor: &NamedTensor) -> Result<Vec<Value>> {
    let values = match tensor.dtype {
        TensorDType::Bytes => tensor
            .as_byte_elements()?
            .into_iter()
            .map(|element| {
                String::from_utf8(element).map(Value::from).map_err(|_| {
                    TrtLlmError::invalid_input(format!(
                        "tensor {} is not valid UTF-8 for JSON encoding",
                        tensor.name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?,
        TensorDType::Bool => tensor.as_bools()?.into_iter().map(Value::from).collect(),
        TensorDType::Int32 => tensor.as_i32s()?.into_iter().map(Value::from).collect(),
        TensorDType::UInt32 => tensor.as_u32s()?.into_iter().map(Value::from).collect(),
        TensorDType::UInt64 => tensor.as_u64s()?.into_iter().map(Value::from).collect(),
        TensorDType::Fp32 => tensor.as_f32s()?.into_iter().map(Value::from).collect(),
    };
    Ok(values)
}

pub(crate) fn decode_infer_response(
    body: &[u8],
    header_length: Option<usize>,
) -> Result<InferResult> {
    let (header, mut binary) = match header_length {
        Some(len) => {
            if len > body.len() {
                return Err(TrtLlmError::decode(format!(
                    "response header length {} exceeds body of {} bytes",
                    len,
                    body.len()
                )));
            }
            body.split_at(len)
        }
        None => (body, &[][..]),
    };

    let response: InferResponseBody = serde_json::from_slice(header)?;

    let mut outputs = Vec::with_capacity(response.outputs.len());
    for output in response.outputs {
        let binary_size = output.parameters.as_ref().and_then(|p| p.binary_data_size);
        let payload = match (binary_size, output.data) {
            (Some(size), _) => {
                if size > binary.len() {
                    return Err(TrtLlmError::decode(format!(
                        "output {} claims {} binary bytes but only {} remain",
                        output.name,
                        size,
                        binary.len()
                    )));
                }
                let (data, rest) = binary.split_at(size);
                binary = rest;
                OutputPayload::Raw(data.to_vec())
            }
            (None, Some(data)) => json_to_payload(&output.name, &output.datatype, data)?,
            (None, None) => {
                return Err(TrtLlmError::decode(format!("output {} carries no data", output.name)));
            }
        };

        outputs.push(InferOutput {
            name: output.name,
            datatype: output.datatype,
            shape: output.shape,
            payload,
        });
    }

    Ok(InferResult {
        model_name: response.model_name,
        id: response.id,
        outputs,
    })
}

fn json_to_payload(name: &str, datatype: &str, data: Vec<Value>) -> Result<OutputPayload> {
    let dtype = datatype.parse::<TensorDType>().map_err(|_| {
        TrtLlmError::decode(format!("output {} has unsupported datatype {}", name, datatype))
    })?;
    let invalid = || {
        TrtLlmError::decode(format!("output {} has a value that is not {}", name, datatype))
    };

    if dtype == TensorDType::Bytes {
        let elements = data
            .into_iter()
            .map(|value| match value {
                Value::String(s) => Ok(s.into_bytes()),
                _ => Err(invalid()),
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(OutputPayload::Elements(elements));
    }

    let mut raw = Vec::new();
    for value in &data {
        match dtype {
            TensorDType::Bool => raw.push(u8::from(value.as_bool().ok_or_else(invalid)?)),
            TensorDType::Int32 => {
                let v = value.as_i64().and_then(|v| i32::try_from(v).ok()).ok_or_else(invalid)?;
                raw.extend_from_slice(&v.to_le_bytes());
            }
            TensorDType::UInt32 => {
                let v = value.as_u64().and_then(|v| u32::try_from(v).ok()).ok_or_else(invalid)?;
                raw.extend_from_slice(&v.to_le_bytes());
            }
            TensorDType::UInt64 => {
                let v = value.as_u64().ok_or_else(invalid)?;
                raw.extend_from_slice(&v.to_le_bytes());
            }
            TensorDType::Fp32 => {
                let v = value.as_f64().ok_or_else(invalid)? as f32;
                raw.extend_from_slice(&v.to_le_bytes());
            }
            TensorDType::Bytes => return Err(invalid()),
        }
    }
    Ok(OutputPayload::Raw(raw))
}
