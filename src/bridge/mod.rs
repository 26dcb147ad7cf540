//! Autograd Bridge
//!
//! The external grounding service owns the authoritative weight store and
//! does its own gradient bookkeeping, while users train with candle
//! optimizers and loss functions. This module connects the two worlds:
//!
//! - **Pass-through mode** ([`bridge_gradient`]): the evaluator's output is
//!   wrapped as a fresh gradient-tracked leaf behind a custom
//!   differentiable identity op. On backward, the op hands the incoming
//!   upstream gradient to [`GradientBridge::backprop`] — which pushes
//!   per-weight gradients into the external store — and returns a zero
//!   gradient to the host graph, whose upstream tensors are structural
//!   inputs, not differentiable values.
//! - **Mirrored-parameter mode** ([`mirror`]): every trainable weight is
//!   exposed as a live host tensor whose in-place mutations re-synchronize
//!   the external copy, and whose `.grad` is served from the external
//!   gradient store.
//!
//! The store is the sole owner of weight lifetime; everything here holds
//! non-owning indices into it. Within one training step, backward must
//! complete (store populated) before mirrored `.grad` reads — the standard
//! backward-then-step ordering of native autodiff.

pub mod mirror;

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{CpuStorage, CustomOp1, Layout, Shape, Tensor, Var};
use parking_lot::RwLock;
use tracing::debug;

use crate::engine::{Evaluator, WeightTable};
use crate::ir::{Sample, ValueLit};
use crate::{GroundNetError, Result};

pub use mirror::{MirrorSet, WeightMirror};

// ============================================================================
// External weight store
// ============================================================================

/// The engine's view of the externally-owned weight store.
///
/// `write_gradient`/`read_gradient` exchange the engine-computed *update
/// direction* (the negated loss gradient); [`WeightMirror::grad`] negates
/// it back so stock descent-style optimizers see an ordinary gradient.
pub trait WeightStore: Send + Sync {
    /// Current value of a weight.
    fn read(&self, index: usize) -> Option<ValueLit>;

    /// Push an updated weight value.
    fn write(&self, index: usize, value: ValueLit);

    /// Stored update direction for a weight, if backward has run.
    fn read_gradient(&self, index: usize) -> Option<ValueLit>;

    /// Record the update direction computed for a weight.
    fn write_gradient(&self, index: usize, grad: ValueLit);

    /// Drop all stored gradients (called after an update step).
    fn clear_gradients(&self);
}

/// Reference in-memory weight store, used by tests, demos and as a stand-in
/// when the real grounding service is not attached.
#[derive(Default)]
pub struct InMemoryWeightStore {
    values: RwLock<HashMap<usize, ValueLit>>,
    gradients: RwLock<HashMap<usize, ValueLit>>,
}

impl InMemoryWeightStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with a table's current weight values.
    pub fn seeded_from(table: &WeightTable) -> Result<Self> {
        let store = Self::new();
        for weight in table.iter() {
            store.write(weight.index, ValueLit::from_tensor(weight.value())?);
        }
        Ok(store)
    }
}

impl WeightStore for InMemoryWeightStore {
    fn read(&self, index: usize) -> Option<ValueLit> {
        self.values.read().get(&index).cloned()
    }

    fn write(&self, index: usize, value: ValueLit) {
        self.values.write().insert(index, value);
    }

    fn read_gradient(&self, index: usize) -> Option<ValueLit> {
        self.gradients.read().get(&index).cloned()
    }

    fn write_gradient(&self, index: usize, grad: ValueLit) {
        self.gradients.write().insert(index, grad);
    }

    fn clear_gradients(&self) {
        self.gradients.write().clear();
    }
}

// ============================================================================
// Pass-through bridge
// ============================================================================

/// Handle tying one sample to the weight table and the external store.
///
/// This is the "engine handle" the custom backward op calls into: it can
/// re-run the sample's forward pass over the table's trainable `Var`s and
/// turn an upstream gradient into per-weight gradients for the store.
pub struct GradientBridge {
    sample: Arc<Sample>,
    weights: Arc<WeightTable>,
    store: Arc<dyn WeightStore>,
}

impl GradientBridge {
    /// Create a bridge for one sample.
    pub fn new(sample: Arc<Sample>, weights: Arc<WeightTable>, store: Arc<dyn WeightStore>) -> Self {
        Self {
            sample,
            weights,
            store,
        }
    }

    /// The bridged sample.
    pub fn sample(&self) -> &Sample {
        &self.sample
    }

    /// The materialized weight table.
    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    /// The external store.
    pub fn store(&self) -> &Arc<dyn WeightStore> {
        &self.store
    }

    /// Run the engine-side backward pass for `upstream`, the gradient
    /// flowing into the bridged output.
    ///
    /// Re-evaluates the sample over the table's `Var`s, computes the
    /// vector-Jacobian product with candle's autodiff, and writes each
    /// trainable weight's update direction (negated gradient) into the
    /// external store.
    pub fn backprop(&self, upstream: &Tensor) -> Result<()> {
        let evaluator = Evaluator::new(self.weights.device().clone());
        let output = evaluator.forward(&self.sample, &self.weights)?;

        let objective = output
            .broadcast_mul(upstream)
            .map_err(|e| GroundNetError::Tensor(format!("upstream fold failed: {}", e)))?
            .sum_all()
            .map_err(|e| GroundNetError::Tensor(format!("upstream sum failed: {}", e)))?;
        let grads = objective
            .backward()
            .map_err(|e| GroundNetError::Tensor(format!("engine backward failed: {}", e)))?;

        let mut written = 0usize;
        for weight in self.weights.iter() {
            if !weight.trainable() {
                continue;
            }
            if let Some(grad) = grads.get(weight.value()) {
                let update = grad
                    .neg()
                    .map_err(|e| GroundNetError::Tensor(format!("grad negate failed: {}", e)))?;
                self.store
                    .write_gradient(weight.index, ValueLit::from_tensor(&update)?);
                written += 1;
            }
        }

        debug!(sample = %self.sample.id, gradients = written, "bridged backward pass");
        Ok(())
    }

    /// Fold the stored update directions into the `Var`s and the store's
    /// weight values: `w ← w + lr · update`. Clears the gradient store.
    pub fn apply_updates(&self, learning_rate: f64) -> Result<()> {
        for weight in self.weights.iter() {
            let Some(var) = weight.var() else { continue };
            let Some(update) = self.store.read_gradient(weight.index) else {
                continue;
            };

            let update = update
                .to_tensor(self.weights.device())?
                .reshape(var.as_tensor().dims())
                .map_err(|e| GroundNetError::Shape(format!("update reshape failed: {}", e)))?;
            let scaled = (update * learning_rate)
                .map_err(|e| GroundNetError::Tensor(format!("update scale failed: {}", e)))?;
            let next = (var.as_tensor() + &scaled)
                .map_err(|e| GroundNetError::Tensor(format!("update add failed: {}", e)))?;
            var.set(&next)
                .map_err(|e| GroundNetError::Tensor(format!("var set failed: {}", e)))?;

            self.store
                .write(weight.index, ValueLit::from_tensor(var.as_tensor())?);
        }

        self.store.clear_gradients();
        Ok(())
    }
}

impl std::fmt::Debug for GradientBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GradientBridge")
            .field("sample", &self.sample.id)
            .field("weights", &self.weights.len())
            .finish()
    }
}

/// The differentiable identity op behind pass-through mode.
///
/// Forward is a plain copy; backward routes the upstream gradient into the
/// engine and reports a zero gradient for its (structural) input.
struct PassThroughOp {
    bridge: Arc<GradientBridge>,
}

impl CustomOp1 for PassThroughOp {
    fn name(&self) -> &'static str {
        "groundnet-bridge"
    }

    fn cpu_fwd(
        &self,
        storage: &CpuStorage,
        layout: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let (start, end) = layout
            .contiguous_offsets()
            .ok_or_else(|| candle_core::Error::Msg("bridge input must be contiguous".into()))?;

        let copied = match storage {
            CpuStorage::F32(data) => CpuStorage::F32(data[start..end].to_vec()),
            CpuStorage::F64(data) => CpuStorage::F64(data[start..end].to_vec()),
            _ => {
                return Err(candle_core::Error::Msg(
                    "bridge supports f32/f64 outputs only".into(),
                ))
            }
        };

        Ok((copied, layout.shape().clone()))
    }

    fn bwd(
        &self,
        arg: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> candle_core::Result<Option<Tensor>> {
        self.bridge
            .backprop(grad_res)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        // The wrapped leaf is structural metadata to the host graph: the
        // real gradients went to the external store.
        Ok(Some(arg.zeros_like()?))
    }
}

/// Wrap an evaluator output for pass-through gradient bridging.
///
/// Returns a tensor that behaves like `output` in any downstream candle
/// expression; when the host framework's backward pass reaches it, the
/// engine's own backward runs against the external store and the host
/// graph receives a zero gradient upstream.
pub fn bridge_gradient(output: &Tensor, bridge: Arc<GradientBridge>) -> Result<Tensor> {
    let leaf = Var::from_tensor(&output.detach())
        .map_err(|e| GroundNetError::Tensor(format!("bridge leaf failed: {}", e)))?;
    leaf.as_tensor()
        .apply_op1(PassThroughOp { bridge })
        .map_err(|e| GroundNetError::Tensor(format!("bridge wrap failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Evaluator;
    use crate::ir::{decode, WeightDims, WeightRecord};
    use candle_core::Device;

    fn linear_sample() -> Arc<Sample> {
        // out = w * x with x = 3.0
        Arc::new(
            decode(
                r#"{
                    "id": "lin", "target": 6.0, "output_neuron": 1,
                    "network": [
                        { "name": "x", "inputs": [], "value": 3.0 },
                        { "name": "out", "weighted": true, "inputs": [0], "weights": [0] }
                    ]
                }"#,
            )
            .unwrap(),
        )
    }

    fn trainable_table(w: f64) -> Arc<WeightTable> {
        let records = vec![WeightRecord {
            index: 0,
            name: "w".into(),
            dimensions: WeightDims::Scalar,
            value: Some(ValueLit::Scalar(w)),
            fixed: false,
        }];
        Arc::new(WeightTable::materialize(&records, &Device::Cpu).unwrap())
    }

    fn scalar_of(t: &Tensor) -> f32 {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_store_round_trip() {
        let store = InMemoryWeightStore::new();
        store.write(0, ValueLit::Scalar(2.5));
        assert_eq!(store.read(0), Some(ValueLit::Scalar(2.5)));
        assert_eq!(store.read(1), None);

        store.write_gradient(0, ValueLit::Scalar(-1.0));
        assert_eq!(store.read_gradient(0), Some(ValueLit::Scalar(-1.0)));
        store.clear_gradients();
        assert_eq!(store.read_gradient(0), None);
    }

    #[test]
    fn test_passthrough_backward_populates_store() {
        let sample = linear_sample();
        let table = trainable_table(2.0);
        let store: Arc<dyn WeightStore> = Arc::new(InMemoryWeightStore::new());
        let bridge = Arc::new(GradientBridge::new(
            Arc::clone(&sample),
            Arc::clone(&table),
            Arc::clone(&store),
        ));

        let evaluator = Evaluator::new(Device::Cpu);
        let output = evaluator.forward(&sample, &table).unwrap();
        assert!((scalar_of(&output) - 6.0).abs() < 1e-6);

        let wrapped = bridge_gradient(&output, Arc::clone(&bridge)).unwrap();
        assert!((scalar_of(&wrapped) - 6.0).abs() < 1e-6);

        // Host-side expression scales the upstream gradient by 5.
        let loss = (&wrapped * 5.0).unwrap();
        loss.backward().unwrap();

        // d(5·w·x)/dw = 5·x = 15; the store holds the negated gradient.
        let grad = store.read_gradient(0).unwrap();
        match grad {
            ValueLit::Scalar(g) => assert!((g + 15.0).abs() < 1e-4),
            other => panic!("expected scalar gradient, got {:?}", other),
        }
    }

    #[test]
    fn test_passthrough_returns_zero_upstream_gradient() {
        let sample = linear_sample();
        let table = trainable_table(2.0);
        let store: Arc<dyn WeightStore> = Arc::new(InMemoryWeightStore::new());
        let bridge = Arc::new(GradientBridge::new(sample, table, store));

        let output = Tensor::from_vec(vec![6.0f32], (1, 1), &Device::Cpu).unwrap();
        let leaf = Var::from_tensor(&output).unwrap();
        let wrapped = leaf
            .as_tensor()
            .apply_op1(PassThroughOp {
                bridge: Arc::clone(&bridge),
            })
            .unwrap();

        let grads = wrapped.backward().unwrap();
        let upstream = grads.get(leaf.as_tensor()).expect("leaf gradient present");
        assert_eq!(scalar_of(upstream), 0.0);
    }

    #[test]
    fn test_apply_updates_syncs_var_and_store() {
        let sample = linear_sample();
        let table = trainable_table(2.0);
        let store: Arc<dyn WeightStore> = Arc::new(InMemoryWeightStore::new());
        let bridge = Arc::new(GradientBridge::new(
            Arc::clone(&sample),
            Arc::clone(&table),
            Arc::clone(&store),
        ));

        let evaluator = Evaluator::new(Device::Cpu);
        let output = evaluator.forward(&sample, &table).unwrap();
        let wrapped = bridge_gradient(&output, Arc::clone(&bridge)).unwrap();
        wrapped.backward().unwrap();

        // update = -x = -3; w ← 2 + 0.1·(-3) = 1.7
        bridge.apply_updates(0.1).unwrap();

        let w = scalar_of(table.get(&crate::ir::WeightRef::Index(0)).unwrap());
        assert!((w - 1.7).abs() < 1e-5);
        match store.read(0).unwrap() {
            ValueLit::Scalar(v) => assert!((v - 1.7).abs() < 1e-5),
            other => panic!("expected scalar value, got {:?}", other),
        }
        assert!(store.read_gradient(0).is_none());

        // The next forward pass sees the updated weight.
        let output = evaluator.forward(&sample, &table).unwrap();
        assert!((scalar_of(&output) - 5.1).abs() < 1e-4);
    }
}
