//! Weight Materializer
//!
//! Maps [`WeightRecord`] descriptors from the external weight store to
//! host-framework tensors. `fixed = true` records become non-trainable
//! constants; `fixed = false` records become [`Var`]s so host optimizers
//! can register them. The store stays the sole owner of weight lifetime —
//! the table only holds materialized copies addressed by index.
//!
//! Shapes are always rank-2 `f32`: scalars `[1,1]`, row vectors `[1,n]`,
//! column vectors `[n,1]`, matrices `[n,m]`. Orientation decides whether a
//! vector pre- or post-multiplies, which is why it is tracked in
//! [`WeightDims`] rather than recovered from the payload.

use std::path::Path;

use candle_core::{Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::ir::{ValueLit, WeightDims, WeightRecord, WeightRef};
use crate::{GroundNetError, Result};

// ============================================================================
// Combination rule
// ============================================================================

/// Combine an input value with its weight.
///
/// The single rule the whole engine uses, independent of neuron kind: when
/// either operand has scalar shape (one element total) the combination is a
/// broadcast elementwise multiply; otherwise it is the matrix/vector
/// product `w @ x`.
pub fn combine(weight: &Tensor, input: &Tensor) -> Result<Tensor> {
    if weight.elem_count() == 1 || input.elem_count() == 1 {
        weight
            .broadcast_mul(input)
            .map_err(|e| GroundNetError::Tensor(format!("scalar combine failed: {}", e)))
    } else {
        weight.matmul(input).map_err(|e| {
            GroundNetError::Shape(format!(
                "cannot combine weight {:?} with input {:?}: {}",
                weight.dims(),
                input.dims(),
                e
            ))
        })
    }
}

// ============================================================================
// Materialized weights
// ============================================================================

#[derive(Debug)]
enum WeightSlot {
    /// Non-trainable constant
    Fixed(Tensor),
    /// Trainable parameter, registered with host optimizers
    Trainable(Var),
}

/// One weight materialized on the host framework.
#[derive(Debug)]
pub struct MaterializedWeight {
    /// Index in the external table
    pub index: usize,
    /// Display name from the store
    pub name: String,
    /// Declared shape/orientation
    pub dims: WeightDims,
    slot: WeightSlot,
}

impl MaterializedWeight {
    /// Current value as a tensor view.
    pub fn value(&self) -> &Tensor {
        match &self.slot {
            WeightSlot::Fixed(t) => t,
            WeightSlot::Trainable(v) => v.as_tensor(),
        }
    }

    /// Whether this weight participates in training.
    pub fn trainable(&self) -> bool {
        matches!(self.slot, WeightSlot::Trainable(_))
    }

    /// The underlying `Var`, when trainable.
    pub fn var(&self) -> Option<&Var> {
        match &self.slot {
            WeightSlot::Trainable(v) => Some(v),
            WeightSlot::Fixed(_) => None,
        }
    }
}

/// The full set of materialized weights for one model.
///
/// Shared across all samples of the model: samples address weights through
/// [`WeightRef`] indices. Reads may happen concurrently; writes belong to a
/// single, externally serialized backward/update step.
#[derive(Debug)]
pub struct WeightTable {
    weights: Vec<MaterializedWeight>,
    /// Constant-1 scalar backing the `Unit` sentinel
    unit: Tensor,
    device: Device,
}

impl WeightTable {
    /// Materialize a decoded weight-record list on `device`.
    ///
    /// Non-fixed records without a value (pending initialization in the
    /// store) are initialized uniformly on `[-1, 1]`.
    pub fn materialize(records: &[WeightRecord], device: &Device) -> Result<Self> {
        let mut weights = Vec::with_capacity(records.len());

        for record in records {
            let shape = record.dimensions.shape();
            let tensor = match &record.value {
                Some(lit) => {
                    let t = lit.to_tensor(device)?;
                    // Literal vectors land as columns; reshape recovers the
                    // declared orientation.
                    t.reshape(shape).map_err(|e| {
                        GroundNetError::Shape(format!(
                            "weight {} value does not fit {:?}: {}",
                            record.index, record.dimensions, e
                        ))
                    })?
                }
                None => Tensor::rand(-1.0f32, 1.0, shape, device).map_err(|e| {
                    GroundNetError::Tensor(format!(
                        "weight {} init failed: {}",
                        record.index, e
                    ))
                })?,
            };

            let slot = if record.fixed {
                WeightSlot::Fixed(tensor)
            } else {
                WeightSlot::Trainable(Var::from_tensor(&tensor).map_err(|e| {
                    GroundNetError::Tensor(format!("weight {} var failed: {}", record.index, e))
                })?)
            };

            weights.push(MaterializedWeight {
                index: record.index,
                name: record.name.clone(),
                dims: record.dimensions,
                slot,
            });
        }

        let unit = Tensor::ones((1, 1), candle_core::DType::F32, device)
            .map_err(|e| GroundNetError::Tensor(format!("unit weight failed: {}", e)))?;

        Ok(Self {
            weights,
            unit,
            device: device.clone(),
        })
    }

    /// Resolve a neuron's weight reference.
    pub fn get(&self, weight_ref: &WeightRef) -> Result<&Tensor> {
        match weight_ref {
            WeightRef::Unit => Ok(&self.unit),
            WeightRef::Index(ix) => self.weights.get(*ix).map(|w| w.value()).ok_or_else(|| {
                GroundNetError::MalformedIr(format!(
                    "weight index {} out of range (table holds {})",
                    ix,
                    self.weights.len()
                ))
            }),
        }
    }

    /// All trainable variables, for host-optimizer registration.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.weights
            .iter()
            .filter_map(|w| w.var().cloned())
            .collect()
    }

    /// Iterate over the materialized weights.
    pub fn iter(&self) -> impl Iterator<Item = &MaterializedWeight> {
        self.weights.iter()
    }

    /// Number of weights (excluding the unit constant).
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Whether the table holds no weights.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Device the table lives on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    // ========================================================================
    // Checkpointing
    // ========================================================================

    /// Save the trainable weights to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors: std::collections::HashMap<String, Tensor> = self
            .weights
            .iter()
            .filter(|w| w.trainable())
            .map(|w| (format!("weight_{}", w.index), w.value().clone()))
            .collect();

        if tensors.is_empty() {
            return Err(GroundNetError::Training(
                "no trainable weights to save".into(),
            ));
        }

        candle_core::safetensors::save(&tensors, path.as_ref())
            .map_err(|e| GroundNetError::Serialization(format!("Failed to save: {}", e)))?;

        Ok(())
    }

    /// Load trainable weights from a previously saved checkpoint.
    ///
    /// The table must have been materialized from the same weight records
    /// (same indices, same dimensions).
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = std::fs::read(path.as_ref())
            .map_err(|e| GroundNetError::Serialization(format!("Failed to read file: {}", e)))?;

        let tensors = candle_core::safetensors::load_buffer(&data, &self.device)
            .map_err(|e| GroundNetError::Serialization(format!("Failed to deserialize: {}", e)))?;

        for weight in self.weights.iter().filter(|w| w.trainable()) {
            let name = format!("weight_{}", weight.index);
            let loaded = tensors.get(&name).ok_or_else(|| {
                GroundNetError::Serialization(format!("Missing parameter '{}'", name))
            })?;

            let var = weight.var().expect("trainable weight has a var");
            var.set(loaded)
                .map_err(|e| GroundNetError::Tensor(format!("Failed to set var: {}", e)))?;
        }

        Ok(())
    }

    /// Save with a metadata sidecar for version tracking.
    pub fn save_with_metadata(
        &self,
        path: impl AsRef<Path>,
        metadata: CheckpointMetadata,
    ) -> Result<()> {
        self.save(path.as_ref())?;

        let meta_path = path.as_ref().with_extension("meta.json");
        let json = serde_json::to_string_pretty(&metadata)?;
        std::fs::write(&meta_path, json)
            .map_err(|e| GroundNetError::Serialization(format!("Failed to save metadata: {}", e)))?;

        Ok(())
    }

    /// Read the metadata sidecar created by [`Self::save_with_metadata`].
    pub fn load_metadata(path: impl AsRef<Path>) -> Result<CheckpointMetadata> {
        let meta_path = path.as_ref().with_extension("meta.json");
        let json = std::fs::read_to_string(&meta_path).map_err(|e| {
            GroundNetError::Serialization(format!(
                "Failed to read metadata file '{}': {}",
                meta_path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Current value of a weight as a literal, for pushing back to the store.
    pub fn read_back(&self, index: usize) -> Result<ValueLit> {
        let weight = self.weights.get(index).ok_or_else(|| {
            GroundNetError::MalformedIr(format!("weight index {} out of range", index))
        })?;
        ValueLit::from_tensor(weight.value())
    }
}

/// Metadata for weight checkpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Model name
    pub name: String,

    /// Version string (e.g., "v1.2.3")
    pub version: String,

    /// Number of weights in the table at save time
    pub weight_count: usize,

    /// When this checkpoint was created
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

impl CheckpointMetadata {
    /// Create metadata for a table.
    pub fn new(name: impl Into<String>, version: impl Into<String>, table: &WeightTable) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            weight_count: table.len(),
            saved_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(records: Vec<WeightRecord>) -> WeightTable {
        WeightTable::materialize(&records, &Device::Cpu).unwrap()
    }

    fn scalar_weight(index: usize, value: f64, fixed: bool) -> WeightRecord {
        WeightRecord {
            index,
            name: format!("w{}", index),
            dimensions: WeightDims::Scalar,
            value: Some(ValueLit::Scalar(value)),
            fixed,
        }
    }

    #[test]
    fn test_materialize_shapes() {
        let t = table(vec![
            scalar_weight(0, 2.0, true),
            WeightRecord {
                index: 1,
                name: "row".into(),
                dimensions: WeightDims::Row(3),
                value: Some(ValueLit::Vector(vec![1.0, 2.0, 3.0])),
                fixed: true,
            },
            WeightRecord {
                index: 2,
                name: "col".into(),
                dimensions: WeightDims::Column(3),
                value: Some(ValueLit::Vector(vec![1.0, 2.0, 3.0])),
                fixed: false,
            },
        ]);

        assert_eq!(t.get(&WeightRef::Index(0)).unwrap().dims(), &[1, 1]);
        assert_eq!(t.get(&WeightRef::Index(1)).unwrap().dims(), &[1, 3]);
        assert_eq!(t.get(&WeightRef::Index(2)).unwrap().dims(), &[3, 1]);
        assert_eq!(t.trainable_vars().len(), 1);
    }

    #[test]
    fn test_unit_weight_is_constant_one() {
        let t = table(vec![]);
        let unit = t.get(&WeightRef::Unit).unwrap();
        assert_eq!(unit.dims(), &[1, 1]);
        let v = unit.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(v, vec![1.0]);
    }

    #[test]
    fn test_pending_init_gets_random_value() {
        let t = table(vec![WeightRecord {
            index: 0,
            name: "pending".into(),
            dimensions: WeightDims::Matrix(2, 2),
            value: None,
            fixed: false,
        }]);
        let w = t.get(&WeightRef::Index(0)).unwrap();
        assert_eq!(w.dims(), &[2, 2]);
        for v in w.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((-1.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_out_of_range_reference() {
        let t = table(vec![scalar_weight(0, 1.0, true)]);
        assert!(matches!(
            t.get(&WeightRef::Index(5)).unwrap_err(),
            GroundNetError::MalformedIr(_)
        ));
    }

    // ========================================================================
    // Combination law: scalar ⇒ elementwise, otherwise matrix product
    // ========================================================================

    fn tensor2(data: Vec<f32>, shape: (usize, usize)) -> Tensor {
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_combine_scalar_weight_any_input() {
        let w = tensor2(vec![2.0], (1, 1));

        for input in [
            tensor2(vec![3.0], (1, 1)),
            tensor2(vec![1.0, 2.0, 3.0], (3, 1)),
            tensor2(vec![1.0, 2.0, 3.0, 4.0], (2, 2)),
        ] {
            let out = combine(&w, &input).unwrap();
            assert_eq!(out.dims(), input.dims());
            let expected: Vec<f32> = input
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
                .iter()
                .map(|x| x * 2.0)
                .collect();
            assert_eq!(out.flatten_all().unwrap().to_vec1::<f32>().unwrap(), expected);
        }
    }

    #[test]
    fn test_combine_any_weight_scalar_input() {
        let x = tensor2(vec![3.0], (1, 1));
        let w = tensor2(vec![1.0, 2.0], (2, 1));

        let out = combine(&w, &x).unwrap();
        assert_eq!(out.dims(), &[2, 1]);
        assert_eq!(
            out.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![3.0, 6.0]
        );
    }

    #[test]
    fn test_combine_row_times_column_is_dot() {
        let w = tensor2(vec![0.5, 0.5], (1, 2));
        let x = tensor2(vec![2.0, 4.0], (2, 1));

        let out = combine(&w, &x).unwrap();
        assert_eq!(out.dims(), &[1, 1]);
        let v = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((v[0] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_combine_matrix_times_column() {
        let w = tensor2(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], (3, 2));
        let x = tensor2(vec![2.0, 5.0], (2, 1));

        let out = combine(&w, &x).unwrap();
        assert_eq!(out.dims(), &[3, 1]);
        assert_eq!(
            out.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![2.0, 5.0, 7.0]
        );
    }

    #[test]
    fn test_combine_incompatible_shapes_fail() {
        let w = tensor2(vec![1.0, 2.0], (2, 1));
        let x = tensor2(vec![1.0, 2.0], (2, 1));

        assert!(matches!(
            combine(&w, &x).unwrap_err(),
            GroundNetError::Shape(_)
        ));
    }

    // ========================================================================
    // Checkpointing
    // ========================================================================

    #[test]
    fn test_save_load_round_trip() {
        let t = table(vec![scalar_weight(0, 0.25, false)]);
        let path = std::env::temp_dir().join("groundnet_test_ckpt.safetensors");
        t.save(&path).unwrap();

        let t2 = table(vec![scalar_weight(0, 9.0, false)]);
        t2.load(&path).unwrap();

        let v = t2
            .get(&WeightRef::Index(0))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((v[0] - 0.25).abs() < 1e-6);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_save_without_trainables_errors() {
        let t = table(vec![scalar_weight(0, 1.0, true)]);
        let path = std::env::temp_dir().join("groundnet_test_none.safetensors");
        assert!(t.save(&path).is_err());
    }

    #[test]
    fn test_metadata_sidecar() {
        let t = table(vec![scalar_weight(0, 0.5, false)]);
        let path = std::env::temp_dir().join("groundnet_test_meta.safetensors");

        let meta = CheckpointMetadata::new("family_model", "v1.0.0", &t);
        t.save_with_metadata(&path, meta).unwrap();

        let loaded = WeightTable::load_metadata(&path).unwrap();
        assert_eq!(loaded.name, "family_model");
        assert_eq!(loaded.version, "v1.0.0");
        assert_eq!(loaded.weight_count, 1);

        std::fs::remove_file(&path).ok();
        std::fs::remove_file(path.with_extension("meta.json")).ok();
    }
}
