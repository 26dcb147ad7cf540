//! IR Decoding
//!
//! Turns the grounding service's serialized per-sample records into
//! validated [`Sample`]s, and the separately fetched weight records into
//! [`WeightRecord`]s. Decoding is pure: no side effects, nothing retried —
//! a structurally invalid record is a [`GroundNetError::MalformedIr`] the
//! producing side has to fix.
//!
//! ## Wire format
//!
//! ```json
//! {
//!   "id": "query_17",
//!   "target": 1.0,
//!   "output_neuron": 2,
//!   "network": [
//!     { "name": "f(a)", "inputs": [], "value": 1.0 },
//!     { "name": "f(b)", "inputs": [], "value": [0.0, 0.0] },
//!     { "name": "h(a, b)", "weighted": true, "activation": "sigmoid",
//!       "inputs": [0, 1], "weights": [0, 1] }
//!   ]
//! }
//! ```
//!
//! Weight records are a flat list indexed `0..N-1`:
//!
//! ```json
//! [ { "index": 0, "name": "w_rule1", "dimensions": [], "value": 1.0, "fixed": true } ]
//! ```

use serde::Deserialize;
use tracing::debug;

use super::validation;
use super::{ActivationTag, Neuron, Sample, ValueLit, WeightDims, WeightRecord, WeightRef};
use crate::{GroundNetError, Result};

// ============================================================================
// Raw wire records
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawSample {
    id: serde_json::Value,
    target: ValueLit,
    #[serde(alias = "neuron")]
    output_neuron: usize,
    network: Vec<RawNeuron>,
}

#[derive(Debug, Deserialize)]
struct RawNeuron {
    /// Redundant on the wire (position is authoritative); checked when present
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    weighted: bool,
    #[serde(default)]
    activation: Option<String>,
    #[serde(default)]
    inputs: Vec<usize>,
    #[serde(default)]
    weights: Option<Vec<RawWeightRef>>,
    #[serde(default)]
    offset: Option<RawWeightRef>,
    #[serde(default)]
    value: Option<ValueLit>,
    #[serde(default)]
    pooling: bool,
}

/// A weight reference on the wire: a table index, `-1`, or the explicit
/// `"unit"` marker — both sentinels denote the constant-1 scalar weight.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawWeightRef {
    Index(i64),
    Marker(String),
}

impl RawWeightRef {
    fn resolve(self) -> Result<WeightRef> {
        match self {
            Self::Index(ix) => WeightRef::from_wire(ix),
            Self::Marker(m) if m == "unit" => Ok(WeightRef::Unit),
            Self::Marker(m) => Err(GroundNetError::MalformedIr(format!(
                "unknown weight marker '{}'",
                m
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawWeight {
    index: usize,
    #[serde(default)]
    name: String,
    dimensions: Vec<usize>,
    #[serde(default)]
    value: Option<ValueLit>,
    #[serde(default)]
    fixed: bool,
}

// ============================================================================
// Sample decoding
// ============================================================================

/// Decode one serialized sample.
pub fn decode(raw: &str) -> Result<Sample> {
    let raw: RawSample = serde_json::from_str(raw)?;
    build_sample(raw)
}

/// Decode one sample from an already-parsed JSON value.
pub fn decode_value(raw: &serde_json::Value) -> Result<Sample> {
    let raw: RawSample = serde_json::from_value(raw.clone())?;
    build_sample(raw)
}

fn build_sample(raw: RawSample) -> Result<Sample> {
    if raw.network.is_empty() {
        return Err(GroundNetError::MalformedIr(
            "sample holds no neurons".to_string(),
        ));
    }

    let mut neurons = Vec::with_capacity(raw.network.len());
    for (position, n) in raw.network.into_iter().enumerate() {
        neurons.push(build_neuron(position, n)?);
    }

    let sample = Sample {
        id: opaque_id(&raw.id),
        target: raw.target,
        output_neuron: raw.output_neuron,
        neurons,
    };

    validation::validate_strict(&sample)?;

    debug!(
        id = %sample.id,
        neurons = sample.neurons.len(),
        output = sample.output_neuron,
        "decoded sample"
    );
    Ok(sample)
}

fn build_neuron(position: usize, raw: RawNeuron) -> Result<Neuron> {
    if let Some(declared) = raw.index {
        if declared != position {
            return Err(GroundNetError::MalformedIr(format!(
                "neuron at position {} declares index {}; records must arrive in dependency order",
                position, declared
            )));
        }
    }

    let weights = match raw.weights {
        Some(ws) if !ws.is_empty() => ws
            .into_iter()
            .map(RawWeightRef::resolve)
            .collect::<Result<Vec<_>>>()?,
        _ => Vec::new(),
    };

    // The wire carries `weighted` redundantly; a disagreement with the
    // weight list means the producer is confused about this neuron.
    if raw.weighted && weights.is_empty() {
        return Err(GroundNetError::MalformedIr(format!(
            "neuron {} is flagged weighted but carries no weights",
            position
        )));
    }
    if !raw.weighted && !weights.is_empty() {
        return Err(GroundNetError::MalformedIr(format!(
            "neuron {} carries weights but is flagged unweighted",
            position
        )));
    }

    let activation = match raw.activation.as_deref() {
        Some(tag) => ActivationTag::parse(tag)?,
        None => ActivationTag::Identity,
    };

    let offset = raw.offset.map(RawWeightRef::resolve).transpose()?;

    Ok(Neuron {
        index: position,
        name: raw.name,
        inputs: raw.inputs,
        weights,
        offset,
        activation,
        pooling: raw.pooling,
        value: raw.value,
    })
}

fn opaque_id(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Weight decoding
// ============================================================================

/// Decode the weight-record list fetched from the external weight store.
///
/// Records must be dense and in order (`index == position`); the engine
/// addresses weights by that index for the lifetime of the model.
pub fn decode_weights(raw: &str) -> Result<Vec<WeightRecord>> {
    let raws: Vec<RawWeight> = serde_json::from_str(raw)?;
    let mut records = Vec::with_capacity(raws.len());

    for (position, w) in raws.into_iter().enumerate() {
        if w.index != position {
            return Err(GroundNetError::MalformedIr(format!(
                "weight at position {} declares index {}; the table must be dense and ordered",
                position, w.index
            )));
        }

        let dimensions = WeightDims::from_wire(&w.dimensions)?;

        if let Some(ref value) = w.value {
            if value.elem_count() != dimensions.elem_count() {
                return Err(GroundNetError::MalformedIr(format!(
                    "weight {} declares {:?} but its value holds {} elements",
                    w.index,
                    dimensions,
                    value.elem_count()
                )));
            }
        } else if w.fixed {
            return Err(GroundNetError::MalformedIr(format!(
                "fixed weight {} has no value",
                w.index
            )));
        }

        records.push(WeightRecord {
            index: w.index,
            name: w.name,
            dimensions,
            value: w.value,
            fixed: w.fixed,
        });
    }

    debug!(weights = records.len(), "decoded weight table");
    Ok(records)
}
