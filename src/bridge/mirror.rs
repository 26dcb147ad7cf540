//! Mirrored Parameters
//!
//! A [`WeightMirror`] is simultaneously a first-class candle parameter (a
//! clone of the table's `Var`, sharing storage) and a live view onto the
//! externally-owned weight value: every in-place mutation re-synchronizes
//! the external copy immediately after mutating the host tensor.
//!
//! Reading [`WeightMirror::grad`] does not touch candle's accumulated
//! gradients. It pulls the engine-computed update direction for the
//! weight's index from the external gradient store and negates it, so a
//! stock descent-style optimizer can treat externally-computed gradients
//! as ordinary autodiff gradients. Reading before backward has populated
//! the store is a usage error and raises
//! [`GroundNetError::GradientNotReady`] — never a stale or zero value.

use std::sync::Arc;

use candle_core::{Tensor, Var};

use super::WeightStore;
use crate::engine::WeightTable;
use crate::ir::ValueLit;
use crate::{GroundNetError, Result};

/// A bidirectional mirror of one trainable weight.
///
/// The mirror holds a non-owning index into the external table; the store
/// remains the sole owner of the weight's lifetime.
pub struct WeightMirror {
    index: usize,
    var: Var,
    store: Arc<dyn WeightStore>,
}

impl WeightMirror {
    /// Mirror an existing trainable `Var`.
    pub fn new(index: usize, var: Var, store: Arc<dyn WeightStore>) -> Self {
        Self { index, var, store }
    }

    /// Index of the mirrored weight in the external table.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The host tensor view.
    pub fn as_tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }

    /// The underlying host parameter.
    pub fn var(&self) -> &Var {
        &self.var
    }

    /// Replace the mirrored value in place, then re-sync the external copy.
    pub fn set(&self, value: &Tensor) -> Result<()> {
        self.var
            .set(value)
            .map_err(|e| GroundNetError::Tensor(format!("mirror set failed: {}", e)))?;
        self.sync_to_store()
    }

    /// In-place descent update `w ← w − scale · delta`, then re-sync the
    /// external copy. This is the mutation a host SGD step performs.
    pub fn sub_scaled(&self, delta: &Tensor, scale: f64) -> Result<()> {
        let scaled = (delta * scale)
            .map_err(|e| GroundNetError::Tensor(format!("mirror scale failed: {}", e)))?;
        let next = (self.var.as_tensor() - &scaled)
            .map_err(|e| GroundNetError::Tensor(format!("mirror update failed: {}", e)))?;
        self.var
            .set(&next)
            .map_err(|e| GroundNetError::Tensor(format!("mirror set failed: {}", e)))?;
        self.sync_to_store()
    }

    /// The loss gradient for this weight, pulled (negated) from the
    /// external gradient store.
    ///
    /// Raises [`GroundNetError::GradientNotReady`] when the corresponding
    /// backward pass has not populated the store yet.
    pub fn grad(&self) -> Result<Tensor> {
        let stored = self
            .store
            .read_gradient(self.index)
            .ok_or(GroundNetError::GradientNotReady { index: self.index })?;

        let update = stored
            .to_tensor(self.var.as_tensor().device())?
            .reshape(self.var.as_tensor().dims())
            .map_err(|e| GroundNetError::Shape(format!("gradient reshape failed: {}", e)))?;
        update
            .neg()
            .map_err(|e| GroundNetError::Tensor(format!("gradient negate failed: {}", e)))
    }

    /// Push the current host value to the external store.
    pub fn sync_to_store(&self) -> Result<()> {
        self.store
            .write(self.index, ValueLit::from_tensor(self.var.as_tensor())?);
        Ok(())
    }

    /// Pull the external store's value into the host tensor (the reverse
    /// direction, for when the grounding service updated the weight).
    pub fn sync_from_store(&self) -> Result<()> {
        let value = self.store.read(self.index).ok_or_else(|| {
            GroundNetError::MalformedIr(format!("weight {} not present in store", self.index))
        })?;
        let tensor = value
            .to_tensor(self.var.as_tensor().device())?
            .reshape(self.var.as_tensor().dims())
            .map_err(|e| GroundNetError::Shape(format!("store value reshape failed: {}", e)))?;
        self.var
            .set(&tensor)
            .map_err(|e| GroundNetError::Tensor(format!("mirror set failed: {}", e)))
    }
}

impl std::fmt::Debug for WeightMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightMirror")
            .field("index", &self.index)
            .field("dims", &self.var.as_tensor().dims())
            .finish()
    }
}

/// All mirrors of a table's trainable weights.
#[derive(Debug, Default)]
pub struct MirrorSet {
    mirrors: Vec<WeightMirror>,
}

impl MirrorSet {
    /// Mirror every trainable weight of `table` against `store`.
    ///
    /// Mirrors share storage with the table's `Var`s: an update through a
    /// mirror is immediately visible to evaluation, and vice versa.
    pub fn from_table(table: &WeightTable, store: Arc<dyn WeightStore>) -> Result<Self> {
        let mut mirrors = Vec::new();
        for weight in table.iter() {
            if let Some(var) = weight.var() {
                let mirror = WeightMirror::new(weight.index, var.clone(), Arc::clone(&store));
                mirror.sync_to_store()?;
                mirrors.push(mirror);
            }
        }
        Ok(Self { mirrors })
    }

    /// The mirrors, in table order.
    pub fn mirrors(&self) -> &[WeightMirror] {
        &self.mirrors
    }

    /// Iterate over the mirrors.
    pub fn iter(&self) -> impl Iterator<Item = &WeightMirror> {
        self.mirrors.iter()
    }

    /// Number of mirrored weights.
    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    /// Whether no weights are mirrored.
    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    /// Push every mirror's host value to the external store. Needed after
    /// an update performed outside the mirror's own mutators (e.g. a stock
    /// candle optimizer stepping the shared `Var`s directly).
    pub fn sync_all(&self) -> Result<()> {
        for mirror in &self.mirrors {
            mirror.sync_to_store()?;
        }
        Ok(())
    }
}
