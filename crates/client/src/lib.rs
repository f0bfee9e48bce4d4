//! TRT-LLM Client
//!
//! Client for TensorRT-LLM models served by Triton Inference Server. Builds the
//! named input tensors, waits for the model to load, and delivers generated
//! text either token by token over a gRPC stream or as one trimmed response.

pub mod client;
pub mod llm;
pub mod postprocess;
pub mod readiness;
pub mod request_id;
pub mod stream;
pub mod tensor;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{Client, StreamOptions};
pub use llm::TensorRtLlm;
pub use postprocess::{decode_text, trim_batch_response};
pub use readiness::{wait_until_ready, ReadinessPolicy};
pub use request_id::{RandomRequestIds, RequestIdGenerator, RequestRegistry, SequentialRequestIds};
pub use stream::{StreamDelivery, StreamEvent, Termination, TokenStream};
pub use tensor::{
    GenerationOverrides, InferenceParameters, NamedTensor, RequestedOutput, TensorDType,
};
pub use transport::{
    BatchTransport, GrpcTransport, HttpTransport, InferOutput, InferResult, InstanceGroup,
    ModelTarget, OutputPayload, PartialResponse, StreamControl, StreamingTransport, Transport,
};
