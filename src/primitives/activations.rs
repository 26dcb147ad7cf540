//! Activation Functions
//!
//! The elementwise transfer functions a non-pooling neuron may apply to
//! its summed inputs. [`crate::ir::ActivationTag::apply`] routes here.

use crate::{GroundNetError, Result};
use candle_core::Tensor;

/// Sigmoid activation: σ(x) = 1 / (1 + e^(-x))
///
/// Maps any real number to (0, 1); the usual choice for rule heads whose
/// truth degree is read off the output neuron.
pub fn sigmoid(tensor: &Tensor) -> Result<Tensor> {
    let neg = tensor
        .neg()
        .map_err(|e| GroundNetError::Tensor(format!("sigmoid neg failed: {}", e)))?;
    let exp_neg = neg
        .exp()
        .map_err(|e| GroundNetError::Tensor(format!("sigmoid exp failed: {}", e)))?;
    let one_plus = (exp_neg + 1.0)
        .map_err(|e| GroundNetError::Tensor(format!("sigmoid add failed: {}", e)))?;
    one_plus
        .recip()
        .map_err(|e| GroundNetError::Tensor(format!("sigmoid recip failed: {}", e)))
}

/// ReLU activation: max(0, x)
pub fn relu(tensor: &Tensor) -> Result<Tensor> {
    tensor
        .relu()
        .map_err(|e| GroundNetError::Tensor(format!("ReLU failed: {}", e)))
}

/// Tanh activation: (e^x - e^(-x)) / (e^x + e^(-x))
///
/// Maps any real number to (-1, 1).
pub fn tanh(tensor: &Tensor) -> Result<Tensor> {
    tensor
        .tanh()
        .map_err(|e| GroundNetError::Tensor(format!("tanh failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor(vals: &[f32]) -> Tensor {
        Tensor::from_vec(vals.to_vec(), vals.len(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_sigmoid() {
        let t = tensor(&[0.0]);
        let s = sigmoid(&t).unwrap();
        let val = s.to_vec1::<f32>().unwrap()[0];

        // sigmoid(0) = 0.5
        assert!((val - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_sigmoid_extremes() {
        let t_large = tensor(&[100.0]);
        let val_large = sigmoid(&t_large).unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((val_large - 1.0).abs() < 0.001);

        let t_small = tensor(&[-100.0]);
        let val_small = sigmoid(&t_small).unwrap().to_vec1::<f32>().unwrap()[0];
        assert!(val_small.abs() < 0.001);
    }

    #[test]
    fn test_relu() {
        let t = tensor(&[-2.0, -1.0, 0.0, 1.0, 2.0]);
        let r = relu(&t).unwrap();
        let vals = r.to_vec1::<f32>().unwrap();

        assert_eq!(vals, vec![0.0, 0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_tanh() {
        let t = tensor(&[0.0]);
        let val = tanh(&t).unwrap().to_vec1::<f32>().unwrap()[0];

        // tanh(0) = 0
        assert!(val.abs() < 0.001);
    }
}
