//! Stream delivery and consumption
//!
//! A transport drives [`StreamDelivery`] from its own task, once per partial
//! server response. Delivery never blocks: it pushes onto an unbounded channel
//! that the caller drains through [`TokenStream`], in server production order.
//!
//! Three things end a stream: a stop word, the server's final-response flag,
//! and an error. All of them go through the same teardown, which calls
//! [`StreamControl::send_stop`] exactly once.

use crate::postprocess::{decode_text, trim_batch_response};
use crate::request_id::RequestLease;
use crate::tensor::TEXT_OUTPUT;
use crate::transport::{PartialResponse, StreamControl};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_stream::Stream;
use tracing::{debug, trace, warn};
use trtllm_common::{Result, TrtLlmError, TrimConfig, METRICS};

/// Why a stream ended normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Decoded text matched a stop word
    StopWord,
    /// The server flagged its last response
    FinalResponse,
}

/// An item on the delivery channel
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(String),
    Finished(Termination),
    Failed(TrtLlmError),
}

/// Producer side of a stream, owned by the transport's delivery task
#[derive(Debug)]
pub struct StreamDelivery {
    tx: mpsc::UnboundedSender<StreamEvent>,
    stop_words: Arc<[String]>,
    force_batch: bool,
    trim: TrimConfig,
    finished: bool,
}

impl StreamDelivery {
    /// Create a delivery path and the receiver its events arrive on
    pub fn channel(
        stop_words: Arc<[String]>,
        force_batch: bool,
        trim: TrimConfig,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let delivery = Self {
            tx,
            stop_words,
            force_batch,
            trim,
            finished: false,
        };
        (delivery, rx)
    }

    /// Handle one server message. Returns `false` once nothing more will arrive.
    pub fn deliver(&mut self, response: Result<PartialResponse>) -> bool {
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.push(StreamEvent::Failed(e));
                return false;
            }
        };

        // The closing message may carry only the final flag
        if let Some(output) = response.outputs.iter().find(|o| o.name == TEXT_OUTPUT) {
            let text = match decode_text(output) {
                Ok(text) => text,
                Err(e) => {
                    self.push(StreamEvent::Failed(e));
                    return false;
                }
            };
            let text = if self.force_batch {
                trim_batch_response(&text, &self.trim)
            } else {
                text
            };

            if is_stop_word(&self.stop_words, &text) {
                self.finish(Termination::StopWord);
            } else {
                trace!("Delivering chunk of {} bytes", text.len());
                self.push(StreamEvent::Chunk(text));
            }
        }

        if response.final_response {
            self.finish(Termination::FinalResponse);
            return false;
        }

        true
    }

    fn finish(&mut self, termination: Termination) {
        if !self.finished {
            self.finished = true;
            self.push(StreamEvent::Finished(termination));
        }
    }

    fn push(&self, event: StreamEvent) {
        // The consumer may already be gone
        let _ = self.tx.send(event);
    }
}

fn is_stop_word(stop_words: &[String], text: &str) -> bool {
    stop_words.iter().any(|w| w == text)
}

/// Consumer side of a stream
///
/// A lazy, finite sequence of text chunks. Pull with [`TokenStream::next_chunk`]
/// or through the [`Stream`] impl; both end with `None` after a stop word or the
/// final response, and yield one error (then `None`) if the stream fails.
pub struct TokenStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    control: Option<Box<dyn StreamControl>>,
    model: String,
    cancel_model: String,
    request_id: String,
    force_batch: bool,
    lease: Option<RequestLease>,
    done: bool,
}

/// How a stream ended, as seen from events still queued when pulling stopped
#[derive(Debug)]
enum QueuedEnd {
    /// Still generating
    Open,
    StopWord,
    FinalResponse,
    Failed(TrtLlmError),
    /// Producer went away without a final response
    Closed,
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("model", &self.model)
            .field("request_id", &self.request_id)
            .field("force_batch", &self.force_batch)
            .field("done", &self.done)
            .finish()
    }
}

impl TokenStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<StreamEvent>,
        control: Box<dyn StreamControl>,
        model: impl Into<String>,
        cancel_model: impl Into<String>,
        request_id: impl Into<String>,
        force_batch: bool,
        lease: Option<RequestLease>,
    ) -> Self {
        METRICS.client.active_streams.inc();
        Self {
            events,
            control: Some(control),
            model: model.into(),
            cancel_model: cancel_model.into(),
            request_id: request_id.into(),
            force_batch,
            lease,
            done: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether the stream has ended
    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Wait for the next chunk; `Ok(None)` once the stream has ended
    pub async fn next_chunk(&mut self) -> Result<Option<String>> {
        if self.done {
            return Ok(None);
        }
        let event = self.events.recv().await;
        self.on_event(event).transpose()
    }

    /// Drain the stream into one string
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk().await? {
            text.push_str(&chunk);
        }
        Ok(text)
    }

    /// Stop the stream before it finishes
    ///
    /// Sends the stop signal unless the stream ran in forced-batch mode, then
    /// releases it. No further chunks are yielded. A stream whose final
    /// response or error is already queued is only released.
    pub fn cancel(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;

        let graceful = match self.drain_queued() {
            QueuedEnd::Open => {
                METRICS.client.stream_cancellations.inc();
                debug!("Cancelling stream {} on {}", self.request_id, self.model);
                !self.force_batch
            }
            QueuedEnd::StopWord => !self.force_batch,
            QueuedEnd::FinalResponse | QueuedEnd::Closed => false,
            QueuedEnd::Failed(e) => {
                METRICS.client.stream_errors.inc();
                warn!(
                    "Stream {} on {} failed before it was consumed: {}",
                    self.request_id, self.model, e
                );
                false
            }
        };

        self.teardown(graceful)
            .map_err(|e| e.in_stream(&self.request_id, &self.model))
    }

    /// Discard queued chunks up to the first terminal event
    fn drain_queued(&mut self) -> QueuedEnd {
        loop {
            match self.events.try_recv() {
                Ok(StreamEvent::Chunk(_)) => continue,
                Ok(StreamEvent::Finished(Termination::StopWord)) => return QueuedEnd::StopWord,
                Ok(StreamEvent::Finished(Termination::FinalResponse)) => {
                    return QueuedEnd::FinalResponse
                }
                Ok(StreamEvent::Failed(e)) => return QueuedEnd::Failed(e),
                Err(TryRecvError::Empty) => return QueuedEnd::Open,
                Err(TryRecvError::Disconnected) => return QueuedEnd::Closed,
            }
        }
    }

    fn on_event(&mut self, event: Option<StreamEvent>) -> Option<Result<String>> {
        match event {
            Some(StreamEvent::Chunk(text)) => {
                METRICS.client.tokens_streamed.inc();
                Some(Ok(text))
            }
            Some(StreamEvent::Finished(Termination::StopWord)) => self.finish(!self.force_batch),
            // The server already closed the request; nothing to cancel
            Some(StreamEvent::Finished(Termination::FinalResponse)) => self.finish(false),
            Some(StreamEvent::Failed(e)) => Some(Err(self.fail(e))),
            None => Some(Err(self.fail(TrtLlmError::server(
                "stream closed before the final response",
            )))),
        }
    }

    fn finish(&mut self, graceful: bool) -> Option<Result<String>> {
        self.done = true;
        debug!("Stream {} on {} finished", self.request_id, self.model);
        self.teardown(graceful)
            .err()
            .map(|e| Err(e.in_stream(&self.request_id, &self.model)))
    }

    fn fail(&mut self, error: TrtLlmError) -> TrtLlmError {
        self.done = true;
        METRICS.client.stream_errors.inc();
        warn!("Stream {} on {} failed: {}", self.request_id, self.model, error);
        if let Err(e) = self.teardown(false) {
            warn!("Teardown of stream {} failed: {}", self.request_id, e);
        }
        error.in_stream(&self.request_id, &self.model)
    }

    fn teardown(&mut self, graceful: bool) -> Result<()> {
        let Some(mut control) = self.control.take() else {
            return Ok(());
        };
        METRICS.client.active_streams.dec();
        self.lease.take();
        control.send_stop(&self.cancel_model, &self.request_id, graceful)
    }
}

impl Stream for TokenStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.events.poll_recv(cx) {
            Poll::Ready(event) => Poll::Ready(this.on_event(event)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.cancel() {
            warn!("Failed to stop abandoned stream {}: {}", self.request_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{text_response, RecordingControl, StopCall};
    use std::time::Duration;
    use tokio_stream::StreamExt;

    type StopLog = Arc<parking_lot::Mutex<Vec<StopCall>>>;

    fn open(force_batch: bool) -> (StreamDelivery, TokenStream, StopLog) {
        open_with_stop_words(&["</s>"], force_batch)
    }

    fn open_with_stop_words(
        stop_words: &[&str],
        force_batch: bool,
    ) -> (StreamDelivery, TokenStream, StopLog) {
        let stop_words: Arc<[String]> = stop_words.iter().map(|w| w.to_string()).collect();
        let (delivery, events) =
            StreamDelivery::channel(stop_words, force_batch, TrimConfig::default());
        let control = RecordingControl::new();
        let stops = control.calls();
        let stream = TokenStream::new(
            events,
            Box::new(control),
            "ensemble",
            "tensorrt_llm",
            "1234",
            force_batch,
            None,
        );
        (delivery, stream, stops)
    }

    #[tokio::test]
    async fn test_stop_word_ends_stream_gracefully() {
        let (mut delivery, mut stream, stops) = open(false);
        assert!(delivery.deliver(Ok(text_response("Hello", false))));
        assert!(delivery.deliver(Ok(text_response("</s>", false))));

        assert_eq!(stream.next_chunk().await.unwrap().as_deref(), Some("Hello"));
        assert_eq!(stream.next_chunk().await.unwrap(), None);
        assert_eq!(stream.next_chunk().await.unwrap(), None);

        let stops = stops.lock();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0], StopCall::new("tensorrt_llm", "1234", true));
    }

    #[tokio::test]
    async fn test_final_flag_ends_stream_without_stop_signal() {
        let (mut delivery, mut stream, stops) = open(false);
        assert!(!delivery.deliver(Ok(text_response("The answer", true))));

        assert_eq!(stream.next_chunk().await.unwrap().as_deref(), Some("The answer"));
        assert_eq!(stream.next_chunk().await.unwrap(), None);

        let stops = stops.lock();
        assert_eq!(stops.len(), 1);
        assert!(!stops[0].graceful);
    }

    #[tokio::test]
    async fn test_stop_word_then_final_flag_tears_down_once() {
        let (mut delivery, mut stream, stops) = open(false);
        delivery.deliver(Ok(text_response("</s>", false)));
        delivery.deliver(Ok(PartialResponse {
            outputs: vec![],
            final_response: true,
        }));

        assert_eq!(stream.next_chunk().await.unwrap(), None);
        drop(stream);
        assert_eq!(stops.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_forced_batch_stop_word_is_not_graceful() {
        let (mut delivery, mut stream, stops) = open_with_stop_words(&["<|eot|>"], true);
        delivery.deliver(Ok(text_response("<|eot|>", false)));

        assert_eq!(stream.next_chunk().await.unwrap(), None);
        let stops = stops.lock();
        assert_eq!(stops.len(), 1);
        assert!(!stops[0].graceful);
    }

    #[tokio::test]
    async fn test_forced_batch_trims_end_marker_to_empty_chunk() {
        let (mut delivery, mut stream, stops) = open(true);
        assert!(delivery.deliver(Ok(text_response("</s>", false))));
        assert!(!delivery.deliver(Ok(PartialResponse {
            outputs: vec![],
            final_response: true,
        })));

        assert_eq!(stream.next_chunk().await.unwrap().as_deref(), Some(""));
        assert_eq!(stream.next_chunk().await.unwrap(), None);
        assert_eq!(stops.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_forced_batch_trims_each_response() {
        let (mut delivery, mut stream, _stops) = open(true);
        delivery.deliver(Ok(text_response("[INST] hi [/INST] Hello there</s>", true)));

        assert_eq!(stream.next_chunk().await.unwrap().as_deref(), Some("Hello there"));
        assert_eq!(stream.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order_with_delays() {
        let (mut delivery, stream, _stops) = open(false);

        tokio::spawn(async move {
            for (i, token) in ["A", "B", "C"].iter().enumerate() {
                tokio::time::sleep(Duration::from_millis(5 * (3 - i as u64))).await;
                delivery.deliver(Ok(text_response(token, i == 2)));
            }
        });

        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_mid_stream_error_surfaces_on_next_pull() {
        let (mut delivery, mut stream, stops) = open(false);
        delivery.deliver(Ok(text_response("Hel", false)));
        assert!(!delivery.deliver(Err(TrtLlmError::server("connection reset by peer"))));

        assert_eq!(stream.next_chunk().await.unwrap().as_deref(), Some("Hel"));

        let err = stream.next_chunk().await.unwrap_err();
        match &err {
            TrtLlmError::Stream { request_id, model, source } => {
                assert_eq!(request_id, "1234");
                assert_eq!(model, "ensemble");
                assert!(matches!(**source, TrtLlmError::Server(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_transport());
        assert_eq!(stream.next_chunk().await.unwrap(), None);

        let stops = stops.lock();
        assert_eq!(stops.len(), 1);
        assert!(!stops[0].graceful);
    }

    #[tokio::test]
    async fn test_decode_error_fails_stream() {
        let (mut delivery, mut stream, _stops) = open(false);
        let mut bad = text_response("x", false);
        bad.outputs[0].payload = crate::transport::OutputPayload::Raw(vec![9, 0, 0, 0, b'x']);
        assert!(!delivery.deliver(Ok(bad)));

        let err = stream.next_chunk().await.unwrap_err();
        assert!(matches!(
            err,
            TrtLlmError::Stream { ref source, .. } if matches!(**source, TrtLlmError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_without_final_is_an_error() {
        let (delivery, mut stream, _stops) = open(false);
        drop(delivery);

        assert!(stream.next_chunk().await.is_err());
        assert_eq!(stream.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropping_unfinished_stream_sends_stop() {
        let (mut delivery, mut stream, stops) = open(false);
        delivery.deliver(Ok(text_response("partial", false)));
        assert_eq!(stream.next_chunk().await.unwrap().as_deref(), Some("partial"));

        drop(stream);
        let stops = stops.lock();
        assert_eq!(stops.len(), 1);
        assert!(stops[0].graceful);
    }

    #[tokio::test]
    async fn test_dropping_stream_with_queued_error_is_not_graceful() {
        let (mut delivery, mut stream, stops) = open(false);
        delivery.deliver(Ok(text_response("Hel", false)));
        delivery.deliver(Err(TrtLlmError::server("connection reset")));
        assert_eq!(stream.next_chunk().await.unwrap().as_deref(), Some("Hel"));

        drop(stream);
        let stops = stops.lock();
        assert_eq!(stops.len(), 1);
        assert!(!stops[0].graceful);
    }

    #[tokio::test]
    async fn test_dropping_stream_with_queued_final_is_not_graceful() {
        let (mut delivery, mut stream, stops) = open(false);
        delivery.deliver(Ok(text_response("A", true)));
        assert_eq!(stream.next_chunk().await.unwrap().as_deref(), Some("A"));

        drop(stream);
        let stops = stops.lock();
        assert_eq!(stops.len(), 1);
        assert!(!stops[0].graceful);
    }

    #[tokio::test]
    async fn test_cancel_skips_queued_chunks() {
        let (mut delivery, mut stream, stops) = open(false);
        delivery.deliver(Ok(text_response("unread", false)));

        stream.cancel().unwrap();
        assert_eq!(stream.next_chunk().await.unwrap(), None);
        assert_eq!(stops.lock()[0], StopCall::new("tensorrt_llm", "1234", true));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (_delivery, mut stream, stops) = open(false);
        stream.cancel().unwrap();
        stream.cancel().unwrap();

        assert_eq!(stream.next_chunk().await.unwrap(), None);
        assert_eq!(stops.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_collect_text() {
        let (mut delivery, stream, _stops) = open(false);
        for token in ["Paris", " is", " the capital."] {
            delivery.deliver(Ok(text_response(token, false)));
        }
        delivery.deliver(Ok(text_response("</s>", true)));

        assert_eq!(stream.collect_text().await.unwrap(), "Paris is the capital.");
    }
}
