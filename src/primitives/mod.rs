//! Engine Primitives
//!
//! Device selection, activation functions and loss functions shared by the
//! evaluator, the gradient bridge and the training loop.
//!
//! ## Thread Safety
//!
//! Evaluation itself is single-threaded per sample; the supported
//! parallelism is coarser — independent samples across worker threads.
//! Metal GPU command buffers are **not thread-safe** for concurrent
//! encoding, so for such workloads see [`tensor_ops`]:
//!
//! - Set `GROUNDNET_NO_GPU=1` to force CPU mode
//! - Use [`thread_local_device`] for per-thread devices
//! - Use [`with_gpu_sync`] to serialize GPU access
//!
//! ## Submodules
//!
//! - [`activations`]: the transfer functions behind
//!   [`ActivationTag::apply`](crate::ir::ActivationTag::apply)
//! - [`tensor_ops`]: device selection and loss functions

mod activations;
mod tensor_ops;

// Re-export all primitives at module level
pub use activations::*;
pub use tensor_ops::*;
