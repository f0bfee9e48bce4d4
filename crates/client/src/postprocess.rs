//! Response post-processing
//!
//! Turns the server's `text_output` tensor into text, and cuts the echoed
//! prompt out of responses produced in non-streaming mode.

use crate::tensor::split_bytes_elements;
use crate::transport::{InferOutput, OutputPayload};
use trtllm_common::{Result, TrtLlmError, TrimConfig};

/// Decode an output tensor into text
///
/// The payload is either one string or an ordered array of byte-string
/// tokens; the elements are concatenated in order.
pub fn decode_text(output: &InferOutput) -> Result<String> {
    let elements = match &output.payload {
        OutputPayload::Raw(raw) => split_bytes_elements(raw)?,
        OutputPayload::Elements(elements) => elements.clone(),
    };

    let mut text = String::new();
    for element in elements {
        let token = String::from_utf8(element).map_err(|e| {
            TrtLlmError::decode(format!("output {} is not valid UTF-8: {}", output.name, e))
        })?;
        text.push_str(&token);
    }
    Ok(text)
}

/// Keep only the generated part of a response that echoes its prompt
///
/// Everything up to the last instruction-closing delimiter is dropped. If the
/// remainder contains an end-of-sequence marker it is cut there and
/// whitespace-trimmed; otherwise it is returned as is.
pub fn trim_batch_response(text: &str, rules: &TrimConfig) -> String {
    let close = rules.instruction_close.as_str();
    let end_marker = rules.end_of_sequence.as_str();

    // An empty marker never matches
    let generated = match text.rfind(close).filter(|_| !close.is_empty()) {
        Some(idx) => &text[idx + close.len()..],
        None => text,
    };

    match generated.find(end_marker).filter(|_| !end_marker.is_empty()) {
        Some(end) => generated[..end].trim().to_string(),
        None => generated.to_string(),
    }
}
