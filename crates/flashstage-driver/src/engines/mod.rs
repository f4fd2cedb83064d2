//! Software inference engines

pub mod dense;

pub use dense::{pack_dense_model, Activation, DenseEngine, DENSE_MAGIC};
