//! Grounded-Network IR
//!
//! The passive, decoded representation of one training/inference instance
//! as produced by the external grounding service: a [`Sample`] holding a
//! topologically ordered list of [`Neuron`]s, plus the [`WeightRecord`]
//! descriptors fetched separately from the service's weight store.
//!
//! Everything here is immutable once decoded; evaluation against a sample
//! is stateless and the same sample can be evaluated concurrently from
//! several threads.

pub mod decode;
pub mod validation;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

pub use decode::{decode, decode_value, decode_weights};

use crate::{GroundNetError, Result};

/// Activation / pooling-reduction tags, with their exact wire spellings.
///
/// The source of the IR keys these by string per backend; here the tag is
/// resolved once at decode time so an unknown spelling fails loudly with
/// [`GroundNetError::UnsupportedActivation`] instead of silently no-op'ing.
///
/// `Identity`..`Relu` are *transfer* tags (applied elementwise after a
/// linear combination); `Average`..`Minimum` are *reduction* tags (applied
/// along the stacking axis of a pooling neuron). `Sum` doubles as the plain
/// default reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationTag {
    /// No transformation
    Identity,
    /// σ(x) = 1 / (1 + e^-x)
    Sigmoid,
    /// Hyperbolic tangent
    Tanh,
    /// max(0, x)
    Relu,
    /// Mean over the pooling axis
    Average,
    /// Max over the pooling axis
    Maximum,
    /// Sum over the pooling axis
    Sum,
    /// Min over the pooling axis
    Minimum,
}

impl ActivationTag {
    /// Resolve a wire tag. Unknown spellings are fatal, never retried.
    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "identity" => Ok(Self::Identity),
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::Tanh),
            "relu" => Ok(Self::Relu),
            "average" => Ok(Self::Average),
            "maximum" => Ok(Self::Maximum),
            "sum" => Ok(Self::Sum),
            "minimum" => Ok(Self::Minimum),
            other => Err(GroundNetError::UnsupportedActivation(other.to_string())),
        }
    }

    /// Whether this tag is a pooling reduction (`average`/`maximum`/`sum`/`minimum`).
    pub fn is_reduction(&self) -> bool {
        matches!(self, Self::Average | Self::Maximum | Self::Sum | Self::Minimum)
    }

    /// Whether this tag is an elementwise transfer function.
    pub fn is_transfer(&self) -> bool {
        matches!(self, Self::Identity | Self::Sigmoid | Self::Tanh | Self::Relu)
    }

    /// Apply this tag as an elementwise transfer function.
    ///
    /// Routes to the corresponding implementation in [`crate::primitives`].
    /// Reduction tags are only meaningful on pooling neurons and are
    /// rejected here.
    pub fn apply(&self, tensor: &Tensor) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(tensor.clone()),
            Self::Sigmoid => crate::primitives::sigmoid(tensor),
            Self::Tanh => crate::primitives::tanh(tensor),
            Self::Relu => crate::primitives::relu(tensor),
            other => Err(GroundNetError::UnsupportedActivation(format!(
                "'{}' is a pooling reduction and cannot be applied as a transfer function",
                other
            ))),
        }
    }

    /// Apply this tag as a reduction along axis 0 of a stacked tensor.
    ///
    /// `identity` (the wire's "activation absent") reduces by plain sum.
    /// Transfer tags have no reduction meaning and are rejected.
    pub fn reduce(&self, stacked: &Tensor) -> Result<Tensor> {
        let reduced = match self {
            Self::Identity | Self::Sum => stacked.sum(0),
            Self::Average => stacked.mean(0),
            Self::Maximum => stacked.max(0),
            Self::Minimum => stacked.min(0),
            other => {
                return Err(GroundNetError::UnsupportedActivation(format!(
                    "'{}' cannot be used as a pooling reduction",
                    other
                )))
            }
        };
        reduced.map_err(|e| GroundNetError::Tensor(format!("pooling reduce failed: {}", e)))
    }
}

impl std::fmt::Display for ActivationTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Identity => "identity",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Relu => "relu",
            Self::Average => "average",
            Self::Maximum => "maximum",
            Self::Sum => "sum",
            Self::Minimum => "minimum",
        };
        write!(f, "{}", s)
    }
}

/// A literal numeric payload: scalar, vector, or matrix.
///
/// Used for leaf-neuron values, training targets, and weight values. The
/// tensor form is always rank-2 so the combination rule stays uniform:
/// scalars become `[1,1]`, vectors become columns `[n,1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueLit {
    /// Single number
    Scalar(f64),
    /// Flat vector, materialized as a column
    Vector(Vec<f64>),
    /// Row-major matrix
    Matrix(Vec<Vec<f64>>),
}

impl ValueLit {
    /// (rows, cols) of the rank-2 tensor this literal materializes to.
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Self::Scalar(_) => (1, 1),
            Self::Vector(v) => (v.len(), 1),
            Self::Matrix(rows) => (rows.len(), rows.first().map_or(0, |r| r.len())),
        }
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        let (r, c) = self.shape();
        r * c
    }

    /// Materialize as a rank-2 `f32` tensor on `device`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let (rows, cols) = self.shape();
        let data: Vec<f32> = match self {
            Self::Scalar(x) => vec![*x as f32],
            Self::Vector(v) => v.iter().map(|x| *x as f32).collect(),
            Self::Matrix(m) => {
                for row in m {
                    if row.len() != cols {
                        return Err(GroundNetError::MalformedIr(format!(
                            "ragged matrix literal: expected {} columns, found {}",
                            cols,
                            row.len()
                        )));
                    }
                }
                m.iter().flatten().map(|x| *x as f32).collect()
            }
        };
        Tensor::from_vec(data, (rows, cols), device)
            .map_err(|e| GroundNetError::Tensor(format!("literal tensor failed: {}", e)))
    }

    /// Read a tensor back into a literal (used when pushing values and
    /// gradients to the external weight store).
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        if tensor.elem_count() == 1 {
            let x = tensor
                .flatten_all()
                .and_then(|t| t.to_vec1::<f32>())
                .map_err(|e| GroundNetError::Tensor(format!("scalar read-back failed: {}", e)))?;
            return Ok(Self::Scalar(x[0] as f64));
        }
        let rows = tensor
            .to_vec2::<f32>()
            .map_err(|e| GroundNetError::Tensor(format!("tensor read-back failed: {}", e)))?;
        Ok(Self::Matrix(
            rows.into_iter()
                .map(|r| r.into_iter().map(|x| x as f64).collect())
                .collect(),
        ))
    }
}

/// Declared shape and orientation of a weight.
///
/// Orientation matters: a row vector pre-multiplies its input while a
/// column vector post-multiplies, so the shape is carried explicitly
/// rather than inferred from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightDims {
    /// `()` — scalar, combines by elementwise multiply
    Scalar,
    /// `(1, n)` — row vector
    Row(usize),
    /// `(n, 1)` — column vector
    Column(usize),
    /// `(n, m)` — 2-D matrix
    Matrix(usize, usize),
}

impl WeightDims {
    /// Build from the wire's tuple-of-ints form.
    pub fn from_wire(dims: &[usize]) -> Result<Self> {
        match dims {
            [] => Ok(Self::Scalar),
            [1, 1] => Ok(Self::Scalar),
            [n] => Ok(Self::Column(*n)),
            [1, n] => Ok(Self::Row(*n)),
            [n, 1] => Ok(Self::Column(*n)),
            [n, m] => Ok(Self::Matrix(*n, *m)),
            other => Err(GroundNetError::MalformedIr(format!(
                "weight dimensions {:?} have more than two axes",
                other
            ))),
        }
    }

    /// (rows, cols) of the materialized tensor.
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Self::Scalar => (1, 1),
            Self::Row(n) => (1, *n),
            Self::Column(n) => (*n, 1),
            Self::Matrix(n, m) => (*n, *m),
        }
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        let (r, c) = self.shape();
        r * c
    }
}

/// A weight descriptor fetched from the external weight store.
///
/// Weights are created once per model build, mutated every optimizer step,
/// and never deleted during a training run; the engine only reads
/// materialized copies and pushes back gradients for `fixed = false`
/// entries.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightRecord {
    /// Dense index into the learnable table (0..N-1)
    pub index: usize,
    /// Display name assigned by the grounding service
    pub name: String,
    /// Declared shape/orientation
    pub dimensions: WeightDims,
    /// Literal value; may be absent for non-fixed weights pending
    /// initialization
    pub value: Option<ValueLit>,
    /// `true` ⇒ materialized as a non-trainable constant
    pub fixed: bool,
}

/// A neuron's reference to a weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightRef {
    /// The `-1` / "unit" sentinel: a constant-1 scalar that is not part of
    /// the learnable table
    Unit,
    /// Index into the learnable table
    Index(usize),
}

impl WeightRef {
    /// Build from the wire's signed-integer form.
    pub fn from_wire(raw: i64) -> Result<Self> {
        match raw {
            -1 => Ok(Self::Unit),
            ix if ix >= 0 => Ok(Self::Index(ix as usize)),
            other => Err(GroundNetError::MalformedIr(format!(
                "weight index {} is neither non-negative nor the unit sentinel",
                other
            ))),
        }
    }
}

/// One node of the grounded computation DAG.
///
/// Immutable once decoded. `index` is the neuron's position in a
/// topologically valid ordering: every input index is strictly smaller.
#[derive(Debug, Clone)]
pub struct Neuron {
    /// Position in the sample's dependency order
    pub index: usize,
    /// Display/debug name; the trailing whitespace-separated token doubles
    /// as the hook key
    pub name: String,
    /// Indices of input neurons; empty ⇒ leaf
    pub inputs: Vec<usize>,
    /// Weight references, one per input; empty ⇒ unweighted pass-through
    pub weights: Vec<WeightRef>,
    /// Optional additive bias, materialized like any other weight
    pub offset: Option<WeightRef>,
    /// Transfer or reduction tag (`Identity` when absent on the wire)
    pub activation: ActivationTag,
    /// `true` ⇒ combine inputs by stacking + reduction instead of a linear
    /// combination
    pub pooling: bool,
    /// Literal payload, used only when `inputs` is empty
    pub value: Option<ValueLit>,
}

impl Neuron {
    /// Whether this is a leaf/input neuron.
    pub fn is_leaf(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Whether this neuron applies weights to its inputs.
    pub fn weighted(&self) -> bool {
        !self.weights.is_empty()
    }

    /// The key hooks are registered under: the trailing whitespace-separated
    /// token of the name (the whole name when it is a single token).
    pub fn hook_key(&self) -> &str {
        self.name.split_whitespace().last().unwrap_or("")
    }
}

/// One decoded training/inference instance.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Opaque identifier assigned by the grounding service
    pub id: String,
    /// Ground truth, scalar or tensor shaped
    pub target: ValueLit,
    /// Index of the designated output neuron (always the last neuron)
    pub output_neuron: usize,
    /// All neurons, sorted by index in valid dependency order
    pub neurons: Vec<Neuron>,
}

impl Sample {
    /// The designated output neuron.
    pub fn output(&self) -> &Neuron {
        &self.neurons[self.output_neuron]
    }

    /// Materialize the training target on `device`.
    pub fn target_tensor(&self, device: &Device) -> Result<Tensor> {
        self.target.to_tensor(device)
    }

    /// Number of neurons in the sample.
    pub fn len(&self) -> usize {
        self.neurons.len()
    }

    /// Whether the sample holds no neurons (never true for a decoded sample).
    pub fn is_empty(&self) -> bool {
        self.neurons.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_parse_known_tags() {
        for (raw, tag) in [
            ("identity", ActivationTag::Identity),
            ("sigmoid", ActivationTag::Sigmoid),
            ("tanh", ActivationTag::Tanh),
            ("relu", ActivationTag::Relu),
            ("average", ActivationTag::Average),
            ("maximum", ActivationTag::Maximum),
            ("sum", ActivationTag::Sum),
            ("minimum", ActivationTag::Minimum),
        ] {
            assert_eq!(ActivationTag::parse(raw).unwrap(), tag);
            assert_eq!(tag.to_string(), raw);
        }
    }

    #[test]
    fn test_activation_parse_unknown_tag() {
        let err = ActivationTag::parse("softplus").unwrap_err();
        assert!(matches!(err, GroundNetError::UnsupportedActivation(_)));
    }

    #[test]
    fn test_transfer_reduction_split() {
        assert!(ActivationTag::Sigmoid.is_transfer());
        assert!(!ActivationTag::Sigmoid.is_reduction());
        assert!(ActivationTag::Average.is_reduction());
        assert!(!ActivationTag::Average.is_transfer());
    }

    #[test]
    fn test_value_lit_shapes() {
        assert_eq!(ValueLit::Scalar(1.0).shape(), (1, 1));
        assert_eq!(ValueLit::Vector(vec![0.0, 0.0, 0.0]).shape(), (3, 1));
        assert_eq!(
            ValueLit::Matrix(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).shape(),
            (2, 2)
        );
    }

    #[test]
    fn test_value_lit_round_trip() {
        let device = Device::Cpu;
        let lit = ValueLit::Matrix(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        let tensor = lit.to_tensor(&device).unwrap();
        assert_eq!(tensor.dims(), &[2, 2]);

        let back = ValueLit::from_tensor(&tensor).unwrap();
        assert_eq!(back, lit);
    }

    #[test]
    fn test_value_lit_ragged_matrix() {
        let device = Device::Cpu;
        let lit = ValueLit::Matrix(vec![vec![1.0, 2.0], vec![3.0]]);
        assert!(lit.to_tensor(&device).is_err());
    }

    #[test]
    fn test_weight_dims_from_wire() {
        assert_eq!(WeightDims::from_wire(&[]).unwrap(), WeightDims::Scalar);
        assert_eq!(WeightDims::from_wire(&[4]).unwrap(), WeightDims::Column(4));
        assert_eq!(WeightDims::from_wire(&[1, 4]).unwrap(), WeightDims::Row(4));
        assert_eq!(WeightDims::from_wire(&[4, 1]).unwrap(), WeightDims::Column(4));
        assert_eq!(
            WeightDims::from_wire(&[3, 2]).unwrap(),
            WeightDims::Matrix(3, 2)
        );
        assert!(WeightDims::from_wire(&[2, 2, 2]).is_err());
    }

    #[test]
    fn test_weight_ref_from_wire() {
        assert_eq!(WeightRef::from_wire(-1).unwrap(), WeightRef::Unit);
        assert_eq!(WeightRef::from_wire(3).unwrap(), WeightRef::Index(3));
        assert!(WeightRef::from_wire(-2).is_err());
    }

    #[test]
    fn test_hook_key_trailing_token() {
        let neuron = Neuron {
            index: 0,
            name: "relation(person, city) watch_me".to_string(),
            inputs: vec![],
            weights: vec![],
            offset: None,
            activation: ActivationTag::Identity,
            pooling: false,
            value: Some(ValueLit::Scalar(0.0)),
        };
        assert_eq!(neuron.hook_key(), "watch_me");
    }
}
