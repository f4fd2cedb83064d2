//! Dense (fully connected) software engine
//!
//! A single-layer reference engine so the pipeline can run end to end on a
//! host without an external inference runtime. It reads a compact blob:
//!
//! ```text
//! Offset  Size            Field
//! 0       4               magic "DNS1"
//! 4       4               input length I (u32 LE)
//! 8       4               output length O (u32 LE)
//! 12      4               activation (u32 LE: 0 identity, 1 ReLU, 2 softmax)
//! 16      O×I×4           weights, row-major f32 LE (row per output)
//! 16+O×I×4 O×4            bias, f32 LE
//! ```
//!
//! Unlike the pipeline, the engine validates what it is given.

use crate::engine::{EngineFault, InferenceEngine};
use tracing::debug;

/// Blob magic
pub const DENSE_MAGIC: [u8; 4] = *b"DNS1";

const HEADER_BYTES: usize = 16;

/// Output activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// Raw scores
    #[default]
    Identity,
    /// `max(0, x)`
    Relu,
    /// Normalized exponentials
    Softmax,
}

impl Activation {
    const fn code(self) -> u32 {
        match self {
            Self::Identity => 0,
            Self::Relu => 1,
            Self::Softmax => 2,
        }
    }

    const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Identity),
            1 => Some(Self::Relu),
            2 => Some(Self::Softmax),
            _ => None,
        }
    }

    fn apply(self, values: &mut [f32]) {
        match self {
            Self::Identity => {}
            Self::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
            Self::Softmax => {
                let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for v in values.iter_mut() {
                    *v = (*v - max).exp();
                    sum += *v;
                }
                if sum > 0.0 {
                    values.iter_mut().for_each(|v| *v /= sum);
                }
            }
        }
    }
}

/// Single fully connected layer
#[derive(Debug, Default)]
pub struct DenseEngine {
    input_len: usize,
    output_len: usize,
    activation: Activation,
    weights: Vec<f32>, // [output_len × input_len]
    bias: Vec<f32>,
    input: Vec<f32>,
    output: Vec<f32>,
    ready: bool,
}

impl DenseEngine {
    /// Create an engine with no model loaded
    pub fn new() -> Self {
        Self::default()
    }

    /// Input length of the loaded model
    pub fn input_len(&self) -> usize {
        self.input_len
    }

    /// Output length of the loaded model
    pub fn output_len(&self) -> usize {
        self.output_len
    }

    /// Output activation of the loaded model
    pub fn activation(&self) -> Activation {
        self.activation
    }
}

fn read_u32(model: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&model[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl InferenceEngine for DenseEngine {
    fn init(&mut self, model: &[u8]) -> Result<(), EngineFault> {
        if model.len() < HEADER_BYTES {
            return Err(EngineFault::new(format!(
                "dense model too short: {} < {HEADER_BYTES} header bytes",
                model.len()
            )));
        }
        if model[..4] != DENSE_MAGIC {
            return Err(EngineFault::new(format!(
                "bad dense model magic {:02x?}",
                &model[..4]
            )));
        }
        let input_len = read_u32(model, 4) as usize;
        let output_len = read_u32(model, 8) as usize;
        let activation = Activation::from_code(read_u32(model, 12))
            .ok_or_else(|| EngineFault::new("unknown activation"))?;
        if input_len == 0 || output_len == 0 {
            return Err(EngineFault::new("dense model declares an empty tensor"));
        }

        let n_weights = output_len
            .checked_mul(input_len)
            .ok_or_else(|| EngineFault::new("dense model dimensions overflow"))?;
        let expected = n_weights
            .checked_add(output_len)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_BYTES))
            .ok_or_else(|| EngineFault::new("dense model dimensions overflow"))?;
        if model.len() < expected {
            return Err(EngineFault::new(format!(
                "dense model too short: {} < {expected}",
                model.len()
            )));
        }

        let weights_end = HEADER_BYTES + n_weights * 4;
        self.weights = read_f32s(&model[HEADER_BYTES..weights_end]);
        self.bias = read_f32s(&model[weights_end..expected]);
        self.input_len = input_len;
        self.output_len = output_len;
        self.activation = activation;
        self.input = vec![0.0; input_len];
        self.output = vec![0.0; output_len];
        self.ready = true;
        debug!("DenseEngine: loaded {input_len}→{output_len} ({activation:?})");
        Ok(())
    }

    fn input_buffer(&mut self, index: usize) -> Option<&mut [f32]> {
        (self.ready && index == 0).then_some(self.input.as_mut_slice())
    }

    fn output_buffer(&self, index: usize) -> Option<&[f32]> {
        (self.ready && index == 0).then_some(self.output.as_slice())
    }

    fn invoke(&mut self) -> Result<(), EngineFault> {
        if !self.ready {
            return Err(EngineFault::new("no model loaded"));
        }
        for (o, out) in self.output.iter_mut().enumerate() {
            let row = &self.weights[o * self.input_len..(o + 1) * self.input_len];
            *out = self.bias[o] + row.iter().zip(&self.input).map(|(w, x)| w * x).sum::<f32>();
        }
        self.activation.apply(&mut self.output);
        Ok(())
    }

    fn invoke_is_idempotent(&self) -> bool {
        true
    }
}

/// Serialize a dense model blob
///
/// `weights` is row-major `[output_len × input_len]`; `bias` has
/// `output_len` entries.
pub fn pack_dense_model(
    input_len: usize,
    output_len: usize,
    activation: Activation,
    weights: &[f32],
    bias: &[f32],
) -> Vec<u8> {
    let mut blob = Vec::with_capacity(HEADER_BYTES + (weights.len() + bias.len()) * 4);
    blob.extend_from_slice(&DENSE_MAGIC);
    blob.extend_from_slice(&(input_len as u32).to_le_bytes());
    blob.extend_from_slice(&(output_len as u32).to_le_bytes());
    blob.extend_from_slice(&activation.code().to_le_bytes());
    for &w in weights {
        blob.extend_from_slice(&w.to_le_bytes());
    }
    for &b in bias {
        blob.extend_from_slice(&b.to_le_bytes());
    }
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summing_engine(input_len: usize) -> DenseEngine {
        let weights = vec![1.0f32; input_len];
        let blob = pack_dense_model(input_len, 1, Activation::Identity, &weights, &[0.0]);
        let mut engine = DenseEngine::new();
        engine.init(&blob).unwrap();
        engine
    }

    #[test]
    fn sums_inputs_with_unit_weights() {
        let mut engine = summing_engine(4);
        engine.input_buffer(0).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        engine.invoke().unwrap();
        assert_eq!(engine.output_buffer(0).unwrap(), &[10.0]);
    }

    #[test]
    fn zero_input_gives_bias() {
        let blob = pack_dense_model(2, 2, Activation::Identity, &[5.0; 4], &[0.5, -1.0]);
        let mut engine = DenseEngine::new();
        engine.init(&blob).unwrap();
        engine.invoke().unwrap();
        assert_eq!(engine.output_buffer(0).unwrap(), &[0.5, -1.0]);
    }

    #[test]
    fn relu_clamps_negative_scores() {
        let blob = pack_dense_model(1, 2, Activation::Relu, &[1.0, -1.0], &[0.0, 0.0]);
        let mut engine = DenseEngine::new();
        engine.init(&blob).unwrap();
        engine.input_buffer(0).unwrap()[0] = 3.0;
        engine.invoke().unwrap();
        assert_eq!(engine.output_buffer(0).unwrap(), &[3.0, 0.0]);
    }

    #[test]
    fn softmax_sums_to_one() {
        let blob = pack_dense_model(1, 3, Activation::Softmax, &[1.0, 2.0, 3.0], &[0.0; 3]);
        let mut engine = DenseEngine::new();
        engine.init(&blob).unwrap();
        engine.input_buffer(0).unwrap()[0] = 1.0;
        engine.invoke().unwrap();
        let sum: f32 = engine.output_buffer(0).unwrap().iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let mut engine = DenseEngine::new();
        assert!(engine.init(b"XXXX\x01\0\0\0\x01\0\0\0\0\0\0\0").is_err());

        let mut blob = pack_dense_model(4, 2, Activation::Identity, &[0.0; 8], &[0.0; 2]);
        blob.truncate(blob.len() - 1);
        assert!(engine.init(&blob).is_err());
        assert!(engine.input_buffer(0).is_none());
    }

    #[test]
    fn buffers_only_exist_at_index_zero() {
        let mut engine = summing_engine(2);
        assert!(engine.input_buffer(1).is_none());
        assert!(engine.output_buffer(1).is_none());
        assert!(engine.invoke_is_idempotent());
    }
}
