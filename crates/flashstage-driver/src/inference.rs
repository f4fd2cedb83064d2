//! Inference driver
//!
//! Thin sequencing layer over an [`InferenceEngine`]:
//!
//! ```text
//! Uninitialized ─initialize─▶ Initialized ─bind_input─▶ InputBound ─invoke─▶ OutputReady
//!                                                           ▲                    │
//!                                                           └────bind_input──────┘
//! ```
//!
//! A failed `invoke` leaves the driver in `Invoked`, from which nothing is
//! valid: the run is over. A failed `initialize` leaves it `Uninitialized`.

use crate::engine::InferenceEngine;
use crate::error::{Result, StageError};
use crate::staging::{copy_tensor, InputTensor, ModelBlob};
use tracing::{debug, info, warn};

/// Driver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// No model handed to the engine yet
    Uninitialized,
    /// Engine built, no input bound
    Initialized,
    /// Input copied into the engine
    InputBound,
    /// Invoke failed; terminal
    Invoked,
    /// Output available
    OutputReady,
}

/// Borrowed view of the engine's output tensor
///
/// Valid until the next `bind_input`/`invoke` overwrites it; the borrow of
/// the driver enforces that.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputVector<'a>(&'a [f32]);

impl<'a> OutputVector<'a> {
    /// Output elements in declaration order
    pub const fn as_slice(&self) -> &'a [f32] {
        self.0
    }

    /// Number of elements
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// True for an empty output
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of the largest element (first on ties), `None` if empty or all NaN
    pub fn argmax(&self) -> Option<usize> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
                Some((_, b)) if b >= v => best,
                _ => Some((i, v)),
            })
            .map(|(i, _)| i)
    }
}

/// Drives one engine instance through its lifecycle
#[derive(Debug)]
pub struct InferenceDriver<E: InferenceEngine> {
    engine: E,
    state: DriverState,
    retry_idempotent_invoke: bool,
    invocations: u64,
}

impl<E: InferenceEngine> InferenceDriver<E> {
    /// Wrap an engine; no retries
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            state: DriverState::Uninitialized,
            retry_idempotent_invoke: false,
            invocations: 0,
        }
    }

    /// Allow one retry of a failed invoke when the engine declares it idempotent
    #[must_use]
    pub fn with_invoke_retry(mut self, enabled: bool) -> Self {
        self.retry_idempotent_invoke = enabled;
        self
    }

    /// Hand the staged model to the engine
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless `Uninitialized`, and `EngineInitFailed`
    /// if the engine rejects the model.
    pub fn initialize(&mut self, model: &ModelBlob<'_>) -> Result<()> {
        self.require(&[DriverState::Uninitialized], "initialize")?;
        self.engine
            .init(model.bytes())
            .map_err(|fault| StageError::engine_init_failed(fault.reason))?;
        self.state = DriverState::Initialized;
        info!("Engine initialized from {} byte model", model.len());
        Ok(())
    }

    /// Copy `tensor` into the engine's input buffer 0
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless `Initialized` or `OutputReady`,
    /// `NullBuffer` if the engine has no input buffer and `SizeMismatch` if
    /// its length differs from the tensor's.
    pub fn bind_input<const N: usize>(&mut self, tensor: &InputTensor<N>) -> Result<()> {
        self.require(
            &[DriverState::Initialized, DriverState::OutputReady],
            "bind_input",
        )?;
        let buffer = self.engine.input_buffer(0).ok_or(StageError::NullBuffer {
            direction: "input",
            index: 0,
        })?;
        copy_tensor(tensor, buffer)?;
        self.state = DriverState::InputBound;
        debug!("Bound {N} element input");
        Ok(())
    }

    /// Run the engine once
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless `InputBound`, and `InvokeFailed` if the
    /// engine fails (after the optional single retry).
    pub fn invoke(&mut self) -> Result<()> {
        self.require(&[DriverState::InputBound], "invoke")?;
        self.invocations += 1;
        let mut outcome = self.engine.invoke();
        if let Err(fault) = &outcome {
            if self.retry_idempotent_invoke && self.engine.invoke_is_idempotent() {
                warn!("Invoke failed ({fault}), retrying once");
                self.invocations += 1;
                outcome = self.engine.invoke();
            }
        }
        match outcome {
            Ok(()) => {
                self.state = DriverState::OutputReady;
                debug!("Invoke #{} complete", self.invocations);
                Ok(())
            }
            Err(fault) => {
                self.state = DriverState::Invoked;
                Err(StageError::invoke_failed(fault.reason))
            }
        }
    }

    /// Borrow the engine's output buffer 0
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless `OutputReady` and `NullBuffer` if the
    /// engine has no output buffer.
    pub fn read_output(&self) -> Result<OutputVector<'_>> {
        self.require(&[DriverState::OutputReady], "read_output")?;
        self.engine
            .output_buffer(0)
            .map(OutputVector)
            .ok_or(StageError::NullBuffer {
                direction: "output",
                index: 0,
            })
    }

    /// Current state
    pub const fn state(&self) -> DriverState {
        self.state
    }

    /// Number of engine `invoke` calls made, retries included
    pub const fn invocations(&self) -> u64 {
        self.invocations
    }

    /// Borrow the engine
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    fn require(&self, allowed: &[DriverState], operation: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(StageError::invalid_state(format!(
                "{operation} not valid in {:?}",
                self.state
            )))
        }
    }
}
