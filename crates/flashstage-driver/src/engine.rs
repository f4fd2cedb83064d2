//! Inference engine boundary
//!
//! The engine is an external collaborator: it validates and interprets the
//! model, owns its tensor arena and exposes input/output buffers by index.
//! The pipeline never looks inside the model.

use std::fmt::Debug;
use thiserror::Error;

/// Failure reported by an engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct EngineFault {
    /// Engine-specific description
    pub reason: String,
}

impl EngineFault {
    /// Create a fault
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Engine contract
pub trait InferenceEngine: Debug {
    /// Build the engine from a model blob
    ///
    /// The blob is only borrowed for the call: an engine that needs the
    /// model afterwards must copy what it needs.
    ///
    /// # Errors
    ///
    /// Returns a fault if the model is malformed or unsupported.
    fn init(&mut self, model: &[u8]) -> Result<(), EngineFault>;

    /// Input tensor `index`, or `None` if the engine has none
    fn input_buffer(&mut self, index: usize) -> Option<&mut [f32]>;

    /// Output tensor `index`, or `None` if the engine has none
    fn output_buffer(&self, index: usize) -> Option<&[f32]>;

    /// Run one inference over the current input
    ///
    /// # Errors
    ///
    /// Returns a fault if the engine could not complete the run.
    fn invoke(&mut self) -> Result<(), EngineFault>;

    /// Whether repeating `invoke` with the same input is safe and yields the same output
    fn invoke_is_idempotent(&self) -> bool {
        false
    }
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn init(&mut self, model: &[u8]) -> Result<(), EngineFault> {
        (**self).init(model)
    }

    fn input_buffer(&mut self, index: usize) -> Option<&mut [f32]> {
        (**self).input_buffer(index)
    }

    fn output_buffer(&self, index: usize) -> Option<&[f32]> {
        (**self).output_buffer(index)
    }

    fn invoke(&mut self) -> Result<(), EngineFault> {
        (**self).invoke()
    }

    fn invoke_is_idempotent(&self) -> bool {
        (**self).invoke_is_idempotent()
    }
}
