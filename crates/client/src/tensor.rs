//! Named tensors sent to and received from the inference server
//!
//! Every generation call sends the same ten input tensors, each with batch
//! dimension 1 and shape `[1, 1]`. Element data is kept in the server's raw
//! wire form: little-endian numerics, one byte per BOOL, and BYTES elements
//! prefixed with a 4-byte little-endian length.

use trtllm_common::{GenerationDefaults, Result, TrtLlmError};

/// Name of the single output produced by the TensorRT-LLM ensemble
pub const TEXT_OUTPUT: &str = "text_output";

/// Shape used by every scalar tensor (batch of one, one element)
pub const SCALAR_SHAPE: [i64; 2] = [1, 1];

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDType {
    Bool,
    Int32,
    UInt32,
    UInt64,
    Fp32,
    /// Variable-length byte strings
    Bytes,
}

impl TensorDType {
    /// Convert to the server's datatype string
    pub fn as_str(&self) -> &'static str {
        match self {
            TensorDType::Bool => "BOOL",
            TensorDType::Int32 => "INT32",
            TensorDType::UInt32 => "UINT32",
            TensorDType::UInt64 => "UINT64",
            TensorDType::Fp32 => "FP32",
            TensorDType::Bytes => "BYTES",
        }
    }
}

/// Parse from the server's datatype string
impl std::str::FromStr for TensorDType {
    type Err = TrtLlmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BOOL" => Ok(TensorDType::Bool),
            "INT32" => Ok(TensorDType::Int32),
            "UINT32" => Ok(TensorDType::UInt32),
            "UINT64" => Ok(TensorDType::UInt64),
            "FP32" => Ok(TensorDType::Fp32),
            "BYTES" => Ok(TensorDType::Bytes),
            other => Err(TrtLlmError::decode(format!("unsupported datatype {}", other))),
        }
    }
}

/// A named, typed, shaped block of raw tensor data
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub dtype: TensorDType,
    pub shape: Vec<i64>,
    /// Raw wire bytes
    pub data: Vec<u8>,
}

impl NamedTensor {
    /// Create a tensor from already-encoded raw data
    pub fn from_raw(
        name: impl Into<String>,
        dtype: TensorDType,
        shape: Vec<i64>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            data,
        }
    }

    fn scalar(name: impl Into<String>, dtype: TensorDType, data: Vec<u8>) -> Self {
        Self::from_raw(name, dtype, SCALAR_SHAPE.to_vec(), data)
    }

    pub fn scalar_string(name: impl Into<String>, value: &str) -> Self {
        Self::scalar(name, TensorDType::Bytes, encode_bytes_elements([value.as_bytes()]))
    }

    pub fn scalar_u32(name: impl Into<String>, value: u32) -> Self {
        Self::scalar(name, TensorDType::UInt32, value.to_le_bytes().to_vec())
    }

    pub fn scalar_u64(name: impl Into<String>, value: u64) -> Self {
        Self::scalar(name, TensorDType::UInt64, value.to_le_bytes().to_vec())
    }

    pub fn scalar_i32(name: impl Into<String>, value: i32) -> Self {
        Self::scalar(name, TensorDType::Int32, value.to_le_bytes().to_vec())
    }

    pub fn scalar_f32(name: impl Into<String>, value: f32) -> Self {
        Self::scalar(name, TensorDType::Fp32, value.to_le_bytes().to_vec())
    }

    pub fn scalar_bool(name: impl Into<String>, value: bool) -> Self {
        Self::scalar(name, TensorDType::Bool, vec![u8::from(value)])
    }

    /// Number of elements implied by the shape
    pub fn element_count(&self) -> usize {
        self.shape.iter().map(|&d| d.max(0) as usize).product()
    }

    fn fixed_width<const N: usize>(&self, expected: TensorDType) -> Result<Vec<[u8; N]>> {
        if self.dtype != expected {
            return Err(TrtLlmError::decode(format!(
                "tensor {} has datatype {}, expected {}",
                self.name,
                self.dtype.as_str(),
                expected.as_str()
            )));
        }
        if self.data.len() % N != 0 {
            return Err(TrtLlmError::decode(format!(
                "tensor {} holds {} bytes, not a multiple of {}",
                self.name,
                self.data.len(),
                N
            )));
        }

        Ok(self
            .data
            .chunks_exact(N)
            .map(|chunk| {
                let mut element = [0u8; N];
                element.copy_from_slice(chunk);
                element
            })
            .collect())
    }

    pub fn as_u32s(&self) -> Result<Vec<u32>> {
        let elements = self.fixed_width::<4>(TensorDType::UInt32)?;
        Ok(elements.into_iter().map(u32::from_le_bytes).collect())
    }

    pub fn as_u64s(&self) -> Result<Vec<u64>> {
        let elements = self.fixed_width::<8>(TensorDType::UInt64)?;
        Ok(elements.into_iter().map(u64::from_le_bytes).collect())
    }

    pub fn as_i32s(&self) -> Result<Vec<i32>> {
        let elements = self.fixed_width::<4>(TensorDType::Int32)?;
        Ok(elements.into_iter().map(i32::from_le_bytes).collect())
    }

    pub fn as_f32s(&self) -> Result<Vec<f32>> {
        let elements = self.fixed_width::<4>(TensorDType::Fp32)?;
        Ok(elements.into_iter().map(f32::from_le_bytes).collect())
    }

    pub fn as_bools(&self) -> Result<Vec<bool>> {
        let elements = self.fixed_width::<1>(TensorDType::Bool)?;
        Ok(elements.into_iter().map(|[b]| b != 0).collect())
    }

    /// Split BYTES data into its elements
    pub fn as_byte_elements(&self) -> Result<Vec<Vec<u8>>> {
        if self.dtype != TensorDType::Bytes {
            return Err(TrtLlmError::decode(format!(
                "tensor {} has datatype {}, expected BYTES",
                self.name,
                self.dtype.as_str()
            )));
        }
        split_bytes_elements(&self.data)
    }
}

/// An output the server is asked to return
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedOutput {
    pub name: String,
}

/// Serialize byte strings in the BYTES wire layout
pub fn encode_bytes_elements<'a, I>(elements: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = Vec::new();
    for element in elements {
        out.extend_from_slice(&(element.len() as u32).to_le_bytes());
        out.extend_from_slice(element);
    }
    out
}

/// Parse the BYTES wire layout back into byte strings
pub fn split_bytes_elements(raw: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut elements = Vec::new();
    let mut offset = 0;

    while offset < raw.len() {
        let header = raw.get(offset..offset + 4).ok_or_else(|| {
            TrtLlmError::decode(format!("truncated BYTES length prefix at offset {}", offset))
        })?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        offset += 4;

        let element = raw.get(offset..offset + len).ok_or_else(|| {
            TrtLlmError::decode(format!(
                "BYTES element at offset {} claims {} bytes but only {} remain",
                offset,
                len,
                raw.len() - offset
            ))
        })?;
        elements.push(element.to_vec());
        offset += len;
    }

    Ok(elements)
}

/// Per-call sampling overrides; unset fields fall back to the client defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOverrides {
    pub max_tokens: Option<u32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub temperature: Option<f32>,
    pub repetition_penalty: Option<f32>,
    pub length_penalty: Option<f32>,
    pub beam_width: Option<u32>,
}

impl GenerationOverrides {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_repetition_penalty(mut self, repetition_penalty: f32) -> Self {
        self.repetition_penalty = Some(repetition_penalty);
        self
    }

    pub fn with_length_penalty(mut self, length_penalty: f32) -> Self {
        self.length_penalty = Some(length_penalty);
        self
    }

    pub fn with_beam_width(mut self, beam_width: u32) -> Self {
        self.beam_width = Some(beam_width);
        self
    }
}

/// Fully resolved inputs for one generation call
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceParameters {
    pub prompt: String,
    pub max_tokens: u32,
    pub top_k: u32,
    pub top_p: f32,
    pub temperature: f32,
    pub repetition_penalty: f32,
    pub length_penalty: f32,
    pub beam_width: u32,
    pub random_seed: u64,
    pub stream: bool,
}

impl InferenceParameters {
    /// Merge per-call overrides onto the configured defaults
    pub fn resolve(
        prompt: impl Into<String>,
        defaults: &GenerationDefaults,
        overrides: &GenerationOverrides,
        random_seed: u64,
        stream: bool,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: overrides.max_tokens.unwrap_or(defaults.max_tokens),
            top_k: overrides.top_k.unwrap_or(defaults.top_k),
            top_p: overrides.top_p.unwrap_or(defaults.top_p),
            temperature: overrides.temperature.unwrap_or(defaults.temperature),
            repetition_penalty: overrides.repetition_penalty.unwrap_or(defaults.repetition_penalty),
            length_penalty: overrides.length_penalty.unwrap_or(defaults.length_penalty),
            beam_width: overrides.beam_width.unwrap_or(defaults.beam_width),
            random_seed,
            stream,
        }
    }

    /// Build the model input tensors, in the order the server expects them
    pub fn to_tensors(&self) -> Vec<NamedTensor> {
        vec![
            NamedTensor::scalar_string("text_input", &self.prompt),
            NamedTensor::scalar_u32("max_tokens", self.max_tokens),
            NamedTensor::scalar_u32("top_k", self.top_k),
            NamedTensor::scalar_f32("top_p", self.top_p),
            NamedTensor::scalar_f32("temperature", self.temperature),
            NamedTensor::scalar_f32("length_penalty", self.length_penalty),
            NamedTensor::scalar_f32("repetition_penalty", self.repetition_penalty),
            NamedTensor::scalar_u64("random_seed", self.random_seed),
            NamedTensor::scalar_u32("beam_width", self.beam_width),
            NamedTensor::scalar_bool("stream", self.stream),
        ]
    }
}

/// Outputs requested from every generation call
pub fn build_outputs() -> Vec<RequestedOutput> {
    vec![RequestedOutput {
        name: TEXT_OUTPUT.to_string(),
    }]
}

/// Tensors that tell the TensorRT-LLM backend to stop generating for a request
pub fn build_stop_inputs() -> Vec<NamedTensor> {
    vec![
        NamedTensor::scalar_i32("input_ids", 0),
        NamedTensor::scalar_i32("input_lengths", 0),
        NamedTensor::scalar_u32("request_output_len", 0),
        NamedTensor::scalar_bool("stop", true),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(prompt: &str) -> InferenceParameters {
        InferenceParameters::resolve(
            prompt,
            &GenerationDefaults::default(),
            &GenerationOverrides::default(),
            0,
            true,
        )
    }

    #[test]
    fn test_inputs_have_fixed_names_and_types() {
        let expected = [
            ("text_input", TensorDType::Bytes),
            ("max_tokens", TensorDType::UInt32),
            ("top_k", TensorDType::UInt32),
            ("top_p", TensorDType::Fp32),
            ("temperature", TensorDType::Fp32),
            ("length_penalty", TensorDType::Fp32),
            ("repetition_penalty", TensorDType::Fp32),
            ("random_seed", TensorDType::UInt64),
            ("beam_width", TensorDType::UInt32),
            ("stream", TensorDType::Bool),
        ];

        for prompt in ["", "What is the capital of France?", "ünïcødé ✓"] {
            let tensors = params(prompt).to_tensors();
            assert_eq!(tensors.len(), 10);

            for (tensor, (name, dtype)) in tensors.iter().zip(expected.iter()) {
                assert_eq!(tensor.name, *name);
                assert_eq!(tensor.dtype, *dtype);
                assert_eq!(tensor.shape, vec![1, 1]);
                assert_eq!(tensor.element_count(), 1);
            }
        }
    }

    #[test]
    fn test_overrides_merge_onto_defaults() {
        let overrides = GenerationOverrides::default()
            .with_max_tokens(512)
            .with_temperature(0.3);
        let defaults = GenerationDefaults::default();
        let resolved = InferenceParameters::resolve("hi", &defaults, &overrides, 7, false);

        assert_eq!(resolved.max_tokens, 512);
        assert_eq!(resolved.temperature, 0.3);
        assert_eq!(resolved.top_k, 1);
        assert_eq!(resolved.top_p, 0.0);
        assert_eq!(resolved.beam_width, 1);
        assert_eq!(resolved.random_seed, 7);
        assert!(!resolved.stream);
    }

    #[test]
    fn test_numeric_fields_decode_bit_exact() {
        let overrides = GenerationOverrides::default()
            .with_top_p(0.1)
            .with_temperature(f32::MIN_POSITIVE)
            .with_length_penalty(-0.0)
            .with_repetition_penalty(1.000_000_1);
        let defaults = GenerationDefaults::default();
        let resolved = InferenceParameters::resolve("x", &defaults, &overrides, u64::MAX, true);
        let tensors = resolved.to_tensors();

        assert_eq!(tensors[1].as_u32s().unwrap(), vec![resolved.max_tokens]);
        assert_eq!(tensors[3].as_f32s().unwrap()[0].to_bits(), resolved.top_p.to_bits());
        assert_eq!(tensors[4].as_f32s().unwrap()[0].to_bits(), resolved.temperature.to_bits());
        assert_eq!(tensors[5].as_f32s().unwrap()[0].to_bits(), (-0.0f32).to_bits());
        assert_eq!(
            tensors[6].as_f32s().unwrap()[0].to_bits(),
            resolved.repetition_penalty.to_bits()
        );
        assert_eq!(tensors[7].as_u64s().unwrap(), vec![u64::MAX]);
        assert_eq!(tensors[9].as_bools().unwrap(), vec![true]);
    }

    #[test]
    fn test_prompt_uses_bytes_layout() {
        let tensor = NamedTensor::scalar_string("text_input", "abc");
        assert_eq!(tensor.data, vec![3, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(tensor.as_byte_elements().unwrap(), vec![b"abc".to_vec()]);
    }

    #[test]
    fn test_stop_inputs() {
        let tensors = build_stop_inputs();
        let names: Vec<_> = tensors.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["input_ids", "input_lengths", "request_output_len", "stop"]);

        assert_eq!(tensors[0].dtype, TensorDType::Int32);
        assert_eq!(tensors[1].as_i32s().unwrap(), vec![0]);
        assert_eq!(tensors[2].as_u32s().unwrap(), vec![0]);
        assert_eq!(tensors[3].as_bools().unwrap(), vec![true]);
        assert!(tensors.iter().all(|t| t.shape == vec![1, 1]));
    }

    #[test]
    fn test_split_rejects_truncated_element() {
        let mut raw = encode_bytes_elements([b"hello".as_slice()]);
        raw.truncate(raw.len() - 1);
        assert!(split_bytes_elements(&raw).is_err());
        assert!(split_bytes_elements(&[1, 0]).is_err());
        assert!(split_bytes_elements(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_datatype() {
        assert_eq!("UINT64".parse::<TensorDType>().unwrap(), TensorDType::UInt64);
        assert_eq!("BYTES".parse::<TensorDType>().unwrap(), TensorDType::Bytes);
        for dtype in [TensorDType::Bool, TensorDType::Int32, TensorDType::Fp32] {
            assert_eq!(dtype.as_str().parse::<TensorDType>().unwrap(), dtype);
        }
        assert!(matches!("FP16".parse::<TensorDType>(), Err(TrtLlmError::Decode(_))));
    }

    #[test]
    fn test_wrong_dtype_is_decode_error() {
        let tensor = NamedTensor::scalar_u32("max_tokens", 5);
        assert!(matches!(tensor.as_f32s(), Err(TrtLlmError::Decode(_))));
    }
}
