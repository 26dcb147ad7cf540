//! IR Validation
//!
//! Structural checks over a decoded [`Sample`].
//!
//! ## Checks Performed
//!
//! - **Dependency order**: every input index is strictly smaller than its
//!   dependent's index
//! - **Arity**: a weighted neuron carries exactly one weight per input
//! - **Leaves**: input neurons carry a literal value
//! - **Output designation**: the output neuron is the last neuron
//!
//! [`decode`](super::decode::decode) routes every sample through
//! [`validate_strict`]; the non-strict [`validate`] listing is for callers
//! that assemble samples programmatically and want every problem at once.

use super::Sample;
use crate::{GroundNetError, Result};

/// Validation error with location information
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Error message
    pub message: String,
    /// Neuron index where the error occurred
    pub neuron_index: Option<usize>,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(idx) = self.neuron_index {
            write!(f, " [neuron {}]", idx)?;
        }
        if let Some(ref sug) = self.suggestion {
            write!(f, "\n  = help: {}", sug)?;
        }
        Ok(())
    }
}

/// Validate a decoded sample.
///
/// Returns a list of validation errors (empty if valid).
pub fn validate(sample: &Sample) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for neuron in &sample.neurons {
        for &input in &neuron.inputs {
            if input >= neuron.index {
                errors.push(ValidationError {
                    message: format!(
                        "input {} is not strictly earlier in the dependency order",
                        input
                    ),
                    neuron_index: Some(neuron.index),
                    suggestion: Some(
                        "the grounding service must emit neurons topologically sorted".into(),
                    ),
                });
            }
        }

        if neuron.weighted() && neuron.weights.len() != neuron.inputs.len() {
            errors.push(ValidationError {
                message: format!(
                    "{} inputs but {} weights",
                    neuron.inputs.len(),
                    neuron.weights.len()
                ),
                neuron_index: Some(neuron.index),
                suggestion: Some("weighted neurons need exactly one weight per input".into()),
            });
        }

        if neuron.is_leaf() && neuron.value.is_none() {
            errors.push(ValidationError {
                message: "leaf neuron carries no literal value".into(),
                neuron_index: Some(neuron.index),
                suggestion: None,
            });
        }
    }

    if sample.output_neuron + 1 != sample.neurons.len() {
        errors.push(ValidationError {
            message: format!(
                "output neuron is {} but the last neuron is {}",
                sample.output_neuron,
                sample.neurons.len().saturating_sub(1)
            ),
            neuron_index: None,
            suggestion: Some("the output neuron must close the dependency order".into()),
        });
    }

    errors
}

/// Validate and return Result
pub fn validate_strict(sample: &Sample) -> Result<()> {
    let errors = validate(sample);
    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        Err(GroundNetError::MalformedIr(format!(
            "sample '{}':\n{}",
            sample.id, msg
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ActivationTag, Neuron, ValueLit, WeightRef};

    fn leaf(index: usize, value: f64) -> Neuron {
        Neuron {
            index,
            name: format!("leaf_{}", index),
            inputs: vec![],
            weights: vec![],
            offset: None,
            activation: ActivationTag::Identity,
            pooling: false,
            value: Some(ValueLit::Scalar(value)),
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
    fn test_valid_sample_passes() {
        let mut agg = leaf(1, 0.0);
        agg.inputs = vec![0];
        agg.weights = vec![WeightRef::Index(0)];
        agg.value = None;
        let sample = sample_with(vec![leaf(0, 1.0), agg]);

        assert!(validate(&sample).is_empty());
        assert!(validate_strict(&sample).is_ok());
    }

    #[test]
    fn test_self_reference_flagged() {
        let mut bad = leaf(1, 0.0);
        bad.inputs = vec![1];
        bad.value = None;
        let sample = sample_with(vec![leaf(0, 1.0), bad]);

        let errors = validate(&sample);
        assert_eq!(errors.len(), 2); // bad ordering + missing leaf value
        assert!(validate_strict(&sample).is_err());
    }

    #[test]
    fn test_leaf_without_value_flagged() {
        let mut bad = leaf(0, 0.0);
        bad.value = None;
        let sample = sample_with(vec![bad]);

        let errors = validate(&sample);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].neuron_index, Some(0));
    }

    #[test]
    fn test_output_not_last_flagged() {
        let mut sample = sample_with(vec![leaf(0, 1.0), leaf(1, 2.0)]);
        sample.output_neuron = 0;

        assert!(!validate(&sample).is_empty());
    }

    #[test]
    fn test_display_carries_location_and_help() {
        let err = ValidationError {
            message: "boom".into(),
            neuron_index: Some(7),
            suggestion: Some("fix it".into()),
        };
        let text = err.to_string();
        assert!(text.contains("[neuron 7]"));
        assert!(text.contains("help: fix it"));
    }
}
