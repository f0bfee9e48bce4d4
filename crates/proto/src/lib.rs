//! TRT-LLM Client Protocol Buffers
//!
//! Message types and the client stub for the KServe v2 `GRPCInferenceService`
//! exposed by Triton Inference Server. The generated code lives in
//! `inference.rs`; see `build.rs` for how to regenerate it.

#[allow(clippy::all)]
pub mod inference;

pub use inference::grpc_inference_service_client::GrpcInferenceServiceClient;
pub use inference::infer_parameter::ParameterChoice;
pub use inference::model_infer_request::{InferInputTensor, InferRequestedOutputTensor};
pub use inference::model_infer_response::InferOutputTensor;
pub use inference::*;

impl InferParameter {
    /// Build a boolean parameter
    pub fn bool(value: bool) -> Self {
        Self {
            parameter_choice: Some(ParameterChoice::BoolParam(value)),
        }
    }

    /// The boolean value, if this parameter holds one
    pub fn as_bool(&self) -> Option<bool> {
        match self.parameter_choice {
            Some(ParameterChoice::BoolParam(v)) => Some(v),
            _ => None,
        }
    }
}
