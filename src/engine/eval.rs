//! Graph Evaluator
//!
//! The forward interpreter: walks a decoded sample bottom-up in dependency
//! order and produces the value of its output neuron. Two strategies are
//! supported and produce numerically identical results:
//!
//! - **per-sample** ([`Evaluator::forward`]): one neuron at a time, no
//!   bookkeeping — the baseline
//! - **layered** ([`Evaluator::forward_layered`]): uses the Stratifier's
//!   layers to apply each layer's shared activation to stacked member
//!   values in one call, which is where large graphs win their throughput
//!
//! Per-neuron rule:
//! 1. a leaf's value is its literal payload (transfer activation applied
//!    when present and not identity)
//! 2. each `(input, weight)` pair combines under [`combine`]; unweighted
//!    inputs pass through unchanged
//! 3. `pooling=false`: broadcast-sum the parts, add the offset bias, apply
//!    the transfer activation; `pooling=true`: stack the parts (broadcast
//!    up to the widest first) and reduce along the stacking axis with the
//!    reduction the activation tag names
//! 4. the value becomes available to dependents, and hooks fire

use candle_core::{Device, Tensor};

use super::hooks::HookRegistry;
use super::strata::{stratify, Strata};
use super::weights::{combine, WeightTable};
use crate::ir::{ActivationTag, Neuron, Sample};
use crate::{GroundNetError, Result};

/// Forward interpreter for grounded networks.
///
/// Holds no per-sample state: one evaluator can serve many samples, and
/// `&self` evaluation is safe to call from several threads as long as each
/// call works on its own sample.
#[derive(Debug)]
pub struct Evaluator {
    device: Device,
    hooks: HookRegistry,
}

impl Evaluator {
    /// Create an evaluator on `device`.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            hooks: HookRegistry::new(),
        }
    }

    /// Create an evaluator with a populated hook registry.
    pub fn with_hooks(device: Device, hooks: HookRegistry) -> Self {
        Self { device, hooks }
    }

    /// Mutable access to the hook registry.
    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    /// Device this evaluator materializes literals on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Evaluate `sample` and return the output neuron's value.
    ///
    /// `batched = true` stratifies on demand and runs the layered strategy;
    /// a stratification failure surfaces as-is — falling back to
    /// `batched = false` is the caller's decision, not an automatic retry.
    pub fn evaluate(&self, sample: &Sample, weights: &WeightTable, batched: bool) -> Result<Tensor> {
        if batched {
            let strata = stratify(sample)?;
            self.forward_layered(sample, &strata, weights)
        } else {
            self.forward(sample, weights)
        }
    }

    /// Per-sample strategy: walk neurons one at a time in index order.
    pub fn forward(&self, sample: &Sample, weights: &WeightTable) -> Result<Tensor> {
        let mut values: Vec<Option<Tensor>> = vec![None; sample.neurons.len()];

        for neuron in &sample.neurons {
            let value = self.eval_neuron(neuron, &values, weights)?;
            self.hooks.dispatch(neuron, &value)?;
            values[neuron.index] = Some(value);
        }

        take_output(&mut values, sample.output_neuron)
    }

    /// Layered strategy: evaluate one stratum at a time, applying the
    /// shared activation to stacked member values.
    pub fn forward_layered(
        &self,
        sample: &Sample,
        strata: &Strata,
        weights: &WeightTable,
    ) -> Result<Tensor> {
        let mut values: Vec<Option<Tensor>> = vec![None; sample.neurons.len()];

        for layer in &strata.layers {
            // Layer 0 (leaves) and pooling layers evaluate member-wise:
            // leaf activations are per neuron, and a pooling reduction is
            // already the member's whole activation step.
            if layer.index == 0 || layer.pooling {
                for &ix in &layer.members {
                    let neuron = &sample.neurons[ix];
                    let value = self.eval_neuron(neuron, &values, weights)?;
                    self.hooks.dispatch(neuron, &value)?;
                    values[ix] = Some(value);
                }
                continue;
            }

            // Linear layers: per-member pre-activations, then one batched
            // activation call per shape group.
            let mut pre = Vec::with_capacity(layer.members.len());
            for &ix in &layer.members {
                let neuron = &sample.neurons[ix];
                pre.push((ix, self.preactivation(neuron, &values, weights)?));
            }

            if layer.activation == ActivationTag::Identity {
                for (ix, value) in pre {
                    self.hooks.dispatch(&sample.neurons[ix], &value)?;
                    values[ix] = Some(value);
                }
                continue;
            }

            for (indices, stacked) in stack_by_shape(pre)? {
                let activated = layer.activation.apply(&stacked)?;
                for (k, ix) in indices.into_iter().enumerate() {
                    let value = activated.get(k).map_err(|e| {
                        GroundNetError::Tensor(format!("layer unstack failed: {}", e))
                    })?;
                    self.hooks.dispatch(&sample.neurons[ix], &value)?;
                    values[ix] = Some(value);
                }
            }
        }

        take_output(&mut values, sample.output_neuron)
    }

    // ========================================================================
    // Per-neuron evaluation
    // ========================================================================

    fn eval_neuron(
        &self,
        neuron: &Neuron,
        values: &[Option<Tensor>],
        weights: &WeightTable,
    ) -> Result<Tensor> {
        if neuron.is_leaf() {
            let lit = neuron.value.as_ref().ok_or_else(|| {
                GroundNetError::MalformedIr(format!("leaf neuron {} has no value", neuron.index))
            })?;
            let value = lit.to_tensor(&self.device)?;
            return if neuron.activation == ActivationTag::Identity {
                Ok(value)
            } else {
                neuron.activation.apply(&value)
            };
        }

        if neuron.pooling {
            let parts = self.combined_parts(neuron, values, weights)?;
            pool(&parts, neuron.activation)
        } else {
            let summed = self.preactivation(neuron, values, weights)?;
            neuron.activation.apply(&summed)
        }
    }

    /// Linear-combination path without the final activation: weighted
    /// combine, broadcast sum, offset bias.
    fn preactivation(
        &self,
        neuron: &Neuron,
        values: &[Option<Tensor>],
        weights: &WeightTable,
    ) -> Result<Tensor> {
        let parts = self.combined_parts(neuron, values, weights)?;

        let mut acc = parts[0].clone();
        for part in &parts[1..] {
            acc = acc
                .broadcast_add(part)
                .map_err(|e| GroundNetError::Shape(format!("input sum failed: {}", e)))?;
        }

        if let Some(ref offset) = neuron.offset {
            acc = acc
                .broadcast_add(weights.get(offset)?)
                .map_err(|e| GroundNetError::Shape(format!("offset add failed: {}", e)))?;
        }

        Ok(acc)
    }

    fn combined_parts(
        &self,
        neuron: &Neuron,
        values: &[Option<Tensor>],
        weights: &WeightTable,
    ) -> Result<Vec<Tensor>> {
        let mut parts = Vec::with_capacity(neuron.inputs.len());

        if neuron.weighted() {
            for (&input, weight_ref) in neuron.inputs.iter().zip(&neuron.weights) {
                let x = resolve(values, input)?;
                let w = weights.get(weight_ref)?;
                parts.push(combine(w, x)?);
            }
        } else {
            for &input in &neuron.inputs {
                parts.push(resolve(values, input)?.clone());
            }
        }

        Ok(parts)
    }
}

/// Look up an already-computed input value.
fn resolve(values: &[Option<Tensor>], index: usize) -> Result<&Tensor> {
    values
        .get(index)
        .and_then(|v| v.as_ref())
        .ok_or_else(|| {
            GroundNetError::MalformedIr(format!(
                "input {} referenced before it was computed",
                index
            ))
        })
}

fn take_output(values: &mut [Option<Tensor>], output: usize) -> Result<Tensor> {
    values
        .get_mut(output)
        .and_then(|v| v.take())
        .ok_or_else(|| {
            GroundNetError::MalformedIr(format!("output neuron {} was never computed", output))
        })
}

/// Stacking + reduction path of a pooling neuron.
///
/// Parts narrower than the widest part broadcast up to it before stacking;
/// the reduction then runs along the new leading axis.
fn pool(parts: &[Tensor], activation: ActivationTag) -> Result<Tensor> {
    let widest = parts
        .iter()
        .max_by_key(|p| p.elem_count())
        .expect("pooling neuron has inputs")
        .dims()
        .to_vec();

    let mut padded = Vec::with_capacity(parts.len());
    for part in parts {
        if part.dims() == widest.as_slice() {
            padded.push(part.clone());
        } else {
            padded.push(part.broadcast_as(widest.as_slice()).map_err(|e| {
                GroundNetError::Shape(format!(
                    "cannot broadcast {:?} up to {:?} for pooling: {}",
                    part.dims(),
                    widest,
                    e
                ))
            })?);
        }
    }

    let stacked = Tensor::stack(&padded, 0)
        .map_err(|e| GroundNetError::Tensor(format!("pooling stack failed: {}", e)))?;
    activation.reduce(&stacked)
}

/// Group `(index, tensor)` pairs by shape and stack each group along a new
/// leading axis, preserving first-seen group order.
fn stack_by_shape(pre: Vec<(usize, Tensor)>) -> Result<Vec<(Vec<usize>, Tensor)>> {
    let mut groups: Vec<(Vec<usize>, Vec<usize>, Vec<Tensor>)> = Vec::new();

    for (ix, tensor) in pre {
        let dims = tensor.dims().to_vec();
        match groups.iter_mut().find(|(shape, _, _)| *shape == dims) {
            Some((_, indices, tensors)) => {
                indices.push(ix);
                tensors.push(tensor);
            }
            None => groups.push((dims, vec![ix], vec![tensor])),
        }
    }

    groups
        .into_iter()
        .map(|(_, indices, tensors)| {
            let stacked = Tensor::stack(&tensors, 0)
                .map_err(|e| GroundNetError::Tensor(format!("layer stack failed: {}", e)))?;
            Ok((indices, stacked))
        })
        .collect()
}
