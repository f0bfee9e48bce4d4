//! In-process test doubles for the transport traits

use crate::stream::StreamDelivery;
use crate::tensor::{encode_bytes_elements, NamedTensor, RequestedOutput, TEXT_OUTPUT};
use crate::transport::{
    BatchTransport, InferOutput, InferResult, InstanceGroup, ModelTarget, OutputPayload,
    PartialResponse, StreamControl, StreamingTransport, Transport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use trtllm_common::{Result, TrtLlmError};

/// A `text_output` partial response carrying `text`
pub fn text_response(text: &str, final_response: bool) -> PartialResponse {
    PartialResponse {
        outputs: vec![text_output(text)],
        final_response,
    }
}

fn text_output(text: &str) -> InferOutput {
    InferOutput {
        name: TEXT_OUTPUT.to_string(),
        datatype: "BYTES".to_string(),
        shape: vec![1, 1],
        payload: OutputPayload::Raw(encode_bytes_elements([text.as_bytes()])),
    }
}

/// One recorded `send_stop` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopCall {
    pub model: String,
    pub request_id: String,
    pub graceful: bool,
}

impl StopCall {
    pub fn new(model: &str, request_id: &str, graceful: bool) -> Self {
        Self {
            model: model.to_string(),
            request_id: request_id.to_string(),
            graceful,
        }
    }
}

/// Stream control that records every stop call
#[derive(Debug, Default)]
pub struct RecordingControl {
    calls: Arc<Mutex<Vec<StopCall>>>,
}

impl RecordingControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn sharing(calls: Arc<Mutex<Vec<StopCall>>>) -> Self {
        Self { calls }
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<StopCall>>> {
        Arc::clone(&self.calls)
    }
}

impl StreamControl for RecordingControl {
    fn send_stop(&mut self, model: &str, request_id: &str, graceful: bool) -> Result<()> {
        self.calls.lock().push(StopCall::new(model, request_id, graceful));
        Ok(())
    }
}

/// A step in a scripted stream
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(PartialResponse),
    Delay(Duration),
    Fail(String),
}

#[derive(Debug, Clone, Copy)]
enum Readiness {
    Always,
    AfterPolls(usize),
    Never,
}

#[derive(Debug)]
struct State {
    readiness: Readiness,
    load_calls: usize,
    load_error: Option<String>,
    instance_groups: Vec<InstanceGroup>,
    models: Vec<String>,
    script: Vec<ScriptStep>,
    open_error: Option<String>,
    opened: Vec<(ModelTarget, Vec<NamedTensor>)>,
    batch_reply: String,
    batch_requests: Vec<(String, Vec<NamedTensor>)>,
}

/// Fake inference server implementing every transport capability
#[derive(Debug)]
pub struct ScriptedServer {
    state: Mutex<State>,
    stops: Arc<Mutex<Vec<StopCall>>>,
}

impl ScriptedServer {
    fn with_readiness(readiness: Readiness) -> Self {
        Self {
            state: Mutex::new(State {
                readiness,
                load_calls: 0,
                load_error: None,
                instance_groups: Vec::new(),
                models: vec!["ensemble".to_string(), "tensorrt_llm".to_string()],
                script: Vec::new(),
                open_error: None,
                opened: Vec::new(),
                batch_reply: String::new(),
                batch_requests: Vec::new(),
            }),
            stops: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn ready() -> Self {
        Self::with_readiness(Readiness::Always)
    }

    /// Not ready for the first `polls` readiness checks
    pub fn ready_after_polls(polls: usize) -> Self {
        Self::with_readiness(Readiness::AfterPolls(polls))
    }

    pub fn never_ready() -> Self {
        Self::with_readiness(Readiness::Never)
    }

    pub fn fail_loads(&self, message: &str) {
        self.state.lock().load_error = Some(message.to_string());
    }

    pub fn fail_open(&self, message: &str) {
        self.state.lock().open_error = Some(message.to_string());
    }

    pub fn load_calls(&self) -> usize {
        self.state.lock().load_calls
    }

    pub fn set_instance_groups(&self, groups: Vec<InstanceGroup>) {
        self.state.lock().instance_groups = groups;
    }

    /// Steps played back on every stream opened from now on
    pub fn script(&self, steps: Vec<ScriptStep>) {
        self.state.lock().script = steps;
    }

    /// Stream the given tokens; the last one carries the final flag
    pub fn script_tokens(&self, tokens: &[&str]) {
        let steps = tokens
            .iter()
            .enumerate()
            .map(|(i, token)| ScriptStep::Respond(text_response(token, i + 1 == tokens.len())))
            .collect();
        self.script(steps);
    }

    pub fn set_batch_reply(&self, text: &str) {
        self.state.lock().batch_reply = text.to_string();
    }

    pub fn stop_calls(&self) -> Vec<StopCall> {
        self.stops.lock().clone()
    }

    pub fn opened_streams(&self) -> Vec<(ModelTarget, Vec<NamedTensor>)> {
        self.state.lock().opened.clone()
    }

    pub fn batch_requests(&self) -> Vec<(String, Vec<NamedTensor>)> {
        self.state.lock().batch_requests.clone()
    }
}

#[async_trait]
impl Transport for ScriptedServer {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn is_model_ready(&self, _model: &str) -> Result<bool> {
        let mut state = self.state.lock();
        Ok(match state.readiness {
            Readiness::Always => true,
            Readiness::Never => false,
            Readiness::AfterPolls(0) => {
                state.readiness = Readiness::Always;
                true
            }
            Readiness::AfterPolls(n) => {
                state.readiness = Readiness::AfterPolls(n - 1);
                false
            }
        })
    }

    async fn load_model(&self, _model: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.load_calls += 1;
        match &state.load_error {
            Some(message) => Err(TrtLlmError::server(message.clone())),
            None => Ok(()),
        }
    }

    async fn model_instance_groups(&self, _model: &str) -> Result<Vec<InstanceGroup>> {
        Ok(self.state.lock().instance_groups.clone())
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().models.clone())
    }
}

#[async_trait]
impl BatchTransport for ScriptedServer {
    async fn infer(
        &self,
        model: &str,
        inputs: &[NamedTensor],
        _outputs: &[RequestedOutput],
    ) -> Result<InferResult> {
        let mut state = self.state.lock();
        state.batch_requests.push((model.to_string(), inputs.to_vec()));
        Ok(InferResult {
            model_name: model.to_string(),
            id: String::new(),
            outputs: vec![text_output(&state.batch_reply)],
        })
    }
}

#[async_trait]
impl StreamingTransport for ScriptedServer {
    async fn open_stream(
        &self,
        target: &ModelTarget,
        inputs: Vec<NamedTensor>,
        _outputs: Vec<RequestedOutput>,
        mut delivery: StreamDelivery,
    ) -> Result<Box<dyn StreamControl>> {
        let steps = {
            let mut state = self.state.lock();
            if let Some(message) = &state.open_error {
                return Err(TrtLlmError::connection(message.clone()));
            }
            state.opened.push((target.clone(), inputs));
            state.script.clone()
        };

        tokio::spawn(async move {
            for step in steps {
                let keep_going = match step {
                    ScriptStep::Respond(response) => delivery.deliver(Ok(response)),
                    ScriptStep::Delay(delay) => {
                        tokio::time::sleep(delay).await;
                        true
                    }
                    ScriptStep::Fail(message) => {
                        delivery.deliver(Err(TrtLlmError::server(message)))
                    }
                };
                if !keep_going {
                    break;
                }
            }
        });

        Ok(Box::new(RecordingControl::sharing(Arc::clone(&self.stops))))
    }
}
