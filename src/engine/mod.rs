//! Grounded-Network Execution Engine
//!
//! Everything between a decoded [`crate::ir::Sample`] and an output tensor:
//!
//! - [`strata`]: partition the DAG into ordered, homogeneous execution
//!   layers for batched evaluation
//! - [`weights`]: materialize external weight descriptors as candle
//!   tensors with exact shape/broadcast semantics
//! - [`eval`]: the forward interpreter, per-neuron or layered
//! - [`hooks`]: synchronous delivery of intermediate neuron values to
//!   user callbacks
//!
//! Evaluation is single-threaded and synchronous per sample; coarser
//! parallelism (independent samples across worker threads) is the caller's
//! business and is safe as long as each invocation uses its own decoded
//! sample, while shared weights are only written during one externally
//! serialized backward/update step.

pub mod eval;
pub mod hooks;
pub mod strata;
pub mod weights;

pub use eval::Evaluator;
pub use hooks::HookRegistry;
pub use strata::{stratify, Layer, Strata};
pub use weights::{combine, MaterializedWeight, WeightTable};
