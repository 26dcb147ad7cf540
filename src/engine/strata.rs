//! Stratifier
//!
//! Groups a sample's neurons into ordered execution layers so the layered
//! evaluator can run one vectorized step per layer. Invariants:
//!
//! (a) every neuron's inputs live in a strictly earlier layer,
//! (b) all leaf neurons form layer 0,
//! (c) within a non-leaf layer every neuron shares the same activation tag,
//!     the same weighted/unweighted status, and the same pooling status.
//!
//! Neurons are processed in index order. A non-leaf neuron's depth floor is
//! `1 + max(layer of each input)`; from the floor, already-created layers
//! are scanned forward and the neuron joins the first one with a matching
//! signature. A new layer opens only when the floor is a new depth frontier
//! (one past the last layer). A neuron whose floor lands strictly inside
//! the existing range and matches nothing is forced into an incompatible
//! layer: that IR cannot be vectorized, which is fatal here — callers may
//! still fall back to the per-neuron strategy at their own discretion.
//!
//! The merge heuristic is one valid stratification, not a minimal one;
//! only homogeneity and topological validity are contractual.

use tracing::debug;

use crate::ir::{ActivationTag, Sample};
use crate::{GroundNetError, Result};

/// One execution layer: neuron indices sharing an evaluation signature.
///
/// Derived and ephemeral — rebuilt on demand, never part of the IR.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Position of this layer in the strata
    pub index: usize,
    /// Member neuron indices, ascending
    pub members: Vec<usize>,
    /// Shared activation tag (layer 0 keeps `Identity`; leaf activations
    /// are applied per neuron)
    pub activation: ActivationTag,
    /// Shared weighted/unweighted status
    pub weighted: bool,
    /// Shared pooling status
    pub pooling: bool,
}

impl Layer {
    fn matches(&self, activation: ActivationTag, weighted: bool, pooling: bool) -> bool {
        self.activation == activation && self.weighted == weighted && self.pooling == pooling
    }
}

/// The ordered layer partition of one sample.
#[derive(Debug, Clone)]
pub struct Strata {
    /// Layers in execution order; layer 0 holds the leaves
    pub layers: Vec<Layer>,
}

impl Strata {
    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether there are no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Partition `sample` into homogeneous execution layers.
pub fn stratify(sample: &Sample) -> Result<Strata> {
    let mut layers: Vec<Layer> = Vec::new();
    let mut layer_of = vec![0usize; sample.neurons.len()];

    for neuron in &sample.neurons {
        if neuron.is_leaf() {
            if layers.is_empty() {
                layers.push(Layer {
                    index: 0,
                    members: Vec::new(),
                    activation: ActivationTag::Identity,
                    weighted: false,
                    pooling: false,
                });
            }
            layers[0].members.push(neuron.index);
            layer_of[neuron.index] = 0;
            continue;
        }

        // All inputs are already placed (index order), so the floor is the
        // first layer that keeps them strictly earlier.
        let floor = 1 + neuron
            .inputs
            .iter()
            .map(|&i| layer_of[i])
            .max()
            .expect("non-leaf neuron has inputs");

        let placed = layers
            .iter()
            .skip(floor)
            .find(|layer| layer.matches(neuron.activation, neuron.weighted(), neuron.pooling))
            .map(|layer| layer.index);

        match placed {
            Some(target) => {
                layers[target].members.push(neuron.index);
                layer_of[neuron.index] = target;
            }
            None if floor == layers.len() => {
                layers.push(Layer {
                    index: floor,
                    members: vec![neuron.index],
                    activation: neuron.activation,
                    weighted: neuron.weighted(),
                    pooling: neuron.pooling,
                });
                layer_of[neuron.index] = floor;
            }
            None => {
                // Forced into the existing depth range with nothing
                // compatible: report against the floor layer.
                let forced = &layers[floor];
                if forced.activation != neuron.activation || forced.pooling != neuron.pooling {
                    return Err(GroundNetError::MixedActivationInLayer {
                        layer: floor,
                        expected: forced.activation,
                        found: neuron.activation,
                    });
                }
                return Err(GroundNetError::MixedWeightingInLayer { layer: floor });
            }
        }
    }

    debug!(
        id = %sample.id,
        neurons = sample.neurons.len(),
        layers = layers.len(),
        "stratified sample"
    );
    Ok(Strata { layers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Neuron, ValueLit, WeightRef};

    fn leaf(index: usize) -> Neuron {
        Neuron {
            index,
            name: format!("leaf_{}", index),
            inputs: vec![],
            weights: vec![],
            offset: None,
            activation: ActivationTag::Identity,
            pooling: false,
            value: Some(ValueLit::Scalar(1.0)),
        }
    }

    fn node(index: usize, inputs: Vec<usize>, activation: ActivationTag) -> Neuron {
        Neuron {
            index,
            name: format!("n_{}", index),
            inputs,
            weights: vec![],
            offset: None,
            activation,
            pooling: false,
            value: None,
        }
    }

    fn weighted_node(index: usize, inputs: Vec<usize>, activation: ActivationTag) -> Neuron {
        let weights = inputs.iter().map(|_| WeightRef::Unit).collect();
        Neuron {
            weights,
            ..node(index, inputs, activation)
        }
    }

    fn sample_with(neurons: Vec<Neuron>) -> Sample {
        Sample {
            id: "t".into(),
            target: ValueLit::Scalar(0.0),
            output_neuron: neurons.len() - 1,
            neurons,
        }
    }

    #[test]
    fn test_leaves_form_layer_zero() {
        let sample = sample_with(vec![
            leaf(0),
            leaf(1),
            node(2, vec![0, 1], ActivationTag::Sigmoid),
        ]);
        let strata = stratify(&sample).unwrap();

        assert_eq!(strata.len(), 2);
        assert_eq!(strata.layers[0].members, vec![0, 1]);
        assert_eq!(strata.layers[1].members, vec![2]);
        assert_eq!(strata.layers[1].activation, ActivationTag::Sigmoid);
    }

    #[test]
    fn test_same_signature_neurons_share_a_layer() {
        let sample = sample_with(vec![
            leaf(0),
            leaf(1),
            node(2, vec![0], ActivationTag::Tanh),
            node(3, vec![1], ActivationTag::Tanh),
            node(4, vec![2, 3], ActivationTag::Sigmoid),
        ]);
        let strata = stratify(&sample).unwrap();

        assert_eq!(strata.len(), 3);
        assert_eq!(strata.layers[1].members, vec![2, 3]);
        assert_eq!(strata.layers[2].members, vec![4]);
    }

    #[test]
    fn test_inputs_always_in_strictly_earlier_layers() {
        let sample = sample_with(vec![
            leaf(0),
            leaf(1),
            node(2, vec![0], ActivationTag::Tanh),
            node(3, vec![2], ActivationTag::Tanh),
            node(4, vec![1, 3], ActivationTag::Sigmoid),
        ]);
        let strata = stratify(&sample).unwrap();

        let mut layer_of = vec![0; sample.neurons.len()];
        for layer in &strata.layers {
            for &m in &layer.members {
                layer_of[m] = layer.index;
            }
        }
        for neuron in &sample.neurons {
            for &input in &neuron.inputs {
                assert!(layer_of[input] < layer_of[neuron.index]);
            }
        }
    }

    #[test]
    fn test_forced_mixed_activation_raises() {
        // Both non-leaves have depth floor 1; the second cannot join the
        // sigmoid layer and has no later frontier to open.
        let sample = sample_with(vec![
            leaf(0),
            node(1, vec![0], ActivationTag::Sigmoid),
            node(2, vec![0], ActivationTag::Tanh),
        ]);

        let err = stratify(&sample).unwrap_err();
        assert!(matches!(
            err,
            GroundNetError::MixedActivationInLayer { layer: 1, .. }
        ));
    }

    #[test]
    fn test_forward_merge_avoids_mixed_activation() {
        // Same two activation tags, but the tanh neuron's floor finds a
        // compatible later layer, so no error is raised.
        let sample = sample_with(vec![
            leaf(0),
            node(1, vec![0], ActivationTag::Sigmoid),
            node(2, vec![1], ActivationTag::Tanh),
            node(3, vec![0], ActivationTag::Tanh),
            node(4, vec![2, 3], ActivationTag::Sigmoid),
        ]);
        let strata = stratify(&sample).unwrap();

        // Neuron 3 (floor 1) merges forward into the tanh layer at depth 2.
        assert_eq!(strata.layers[2].members, vec![2, 3]);
        assert_eq!(strata.layers[2].activation, ActivationTag::Tanh);
    }

    #[test]
    fn test_forced_mixed_weighting_raises() {
        let sample = sample_with(vec![
            leaf(0),
            node(1, vec![0], ActivationTag::Sigmoid),
            weighted_node(2, vec![0], ActivationTag::Sigmoid),
        ]);

        let err = stratify(&sample).unwrap_err();
        assert!(matches!(
            err,
            GroundNetError::MixedWeightingInLayer { layer: 1 }
        ));
    }

    #[test]
    fn test_pooling_status_separates_layers() {
        let mut pooled = node(3, vec![1, 2], ActivationTag::Average);
        pooled.pooling = true;
        let sample = sample_with(vec![
            leaf(0),
            leaf(1),
            node(2, vec![0], ActivationTag::Tanh),
            pooled,
            node(4, vec![2, 3], ActivationTag::Sigmoid),
        ]);
        let strata = stratify(&sample).unwrap();

        let pooled_layer = strata
            .layers
            .iter()
            .find(|l| l.members.contains(&3))
            .unwrap();
        assert!(pooled_layer.pooling);
        assert!(!pooled_layer.members.contains(&2));
    }
}
