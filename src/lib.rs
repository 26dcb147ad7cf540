//! # groundnet
//!
//! Execution engine for grounded relational-rule networks.
//!
//! ## Overview
//!
//! Users express models as relational/logic rules. An external grounding
//! service parses those rules, grounds them against facts, and owns the
//! authoritative weight store; what it hands this crate is a per-sample IR —
//! a fully instantiated computation DAG of neurons and weight references.
//! This crate is the part that runs those DAGs:
//!
//! - **`ir`**: decode the serialized IR into an in-memory [`ir::Sample`]
//! - **`engine`**: stratify the DAG into homogeneous layers, materialize
//!   weight descriptors as candle tensors, and evaluate forward (per-neuron
//!   or layered/batched)
//! - **`bridge`**: connect the externally-owned weight store to candle's
//!   autodiff, in pass-through or mirrored-parameter mode
//! - **`training`**: optimizers and an epoch-iterator training loop
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use groundnet::prelude::*;
//!
//! let sample = decode(raw_json)?;
//! let weights = WeightTable::materialize(&decode_weights(raw_weights)?, &Device::Cpu)?;
//!
//! let evaluator = Evaluator::new(Device::Cpu);
//! let output = evaluator.evaluate(&sample, &weights, true)?;
//! println!("prediction: {:.3}", output.flatten_all()?.to_vec1::<f32>()?[0]);
//! ```
//!
//! ## Feature Flags
//!
//! - `metal`: Apple Metal GPU acceleration (M1/M2/M3/M4)
//! - `cuda`: NVIDIA CUDA GPU acceleration

pub mod bridge;
pub mod engine;
pub mod ir;
pub mod primitives;
pub mod training;

// Re-export candle types for convenience
pub use candle_core::{DType, Device, Tensor, Var};

/// Error types for grounded-network execution
#[derive(Debug, thiserror::Error)]
pub enum GroundNetError {
    /// Decode-time structural violation: bad ordering, dangling reference,
    /// arity mismatch. Fatal; the producing side must fix the IR.
    #[error("Malformed IR: {0}")]
    MalformedIr(String),

    /// Two neurons forced into the same execution layer disagree on their
    /// activation tag (or pooling status).
    #[error("layer {layer} mixes activations '{expected}' and '{found}'")]
    MixedActivationInLayer {
        /// Index of the forced layer
        layer: usize,
        /// Activation already resident in the layer
        expected: crate::ir::ActivationTag,
        /// Activation of the neuron that could not be placed
        found: crate::ir::ActivationTag,
    },

    /// Two neurons forced into the same execution layer disagree on their
    /// weighted/unweighted status.
    #[error("layer {layer} mixes weighted and unweighted neurons")]
    MixedWeightingInLayer {
        /// Index of the forced layer
        layer: usize,
    },

    /// Activation tag outside the supported enumerated set, or a tag used
    /// in a position (pooling vs. transfer) it does not support.
    #[error("Unsupported activation: {0}")]
    UnsupportedActivation(String),

    /// Weight/input shapes incompatible under the combination rule.
    #[error("Shape mismatch: {0}")]
    Shape(String),

    /// A mirrored parameter's gradient was read before the backward pass
    /// populated the external gradient store.
    #[error("gradient for weight {index} not ready; run backward before reading it")]
    GradientNotReady {
        /// Index of the weight in the external table
        index: usize,
    },

    /// Tensor operation failed
    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for grounded-network operations
pub type Result<T> = std::result::Result<T, GroundNetError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{DType, Device, Tensor, Var};
    pub use crate::{GroundNetError, Result};

    // IR
    pub use crate::ir::{
        decode, decode_value, decode_weights, ActivationTag, Neuron, Sample, ValueLit,
        WeightDims, WeightRecord, WeightRef,
    };

    // Engine
    pub use crate::engine::{stratify, Evaluator, HookRegistry, Layer, Strata, WeightTable};

    // Bridge
    pub use crate::bridge::{
        bridge_gradient, GradientBridge, InMemoryWeightStore, MirrorSet, WeightMirror,
        WeightStore,
    };

    // Primitives
    pub use crate::primitives::{
        best_device, binary_cross_entropy, cpu_device, gpu_disabled, mse_loss, relu, sigmoid,
        tanh, thread_local_device, with_gpu_sync,
    };

    // Training
    pub use crate::training::{
        safe_optimizer_step, EpochStats, LearningConfig, LossKind, MetricsTracker, Optimizer,
        Trainer,
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let device = best_device();
        assert!(
            matches!(device, Device::Cpu)
                || matches!(device, Device::Metal(_))
                || matches!(device, Device::Cuda(_))
        );
    }
}
