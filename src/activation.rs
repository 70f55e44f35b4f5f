//! Activation functions and output-layer loss.
//!
//! Each function is applied in place on the data columns of a strided
//! activation matrix, leaving any trailing bias column untouched. The
//! backward direction never recomputes pre-activations: derivatives are
//! expressed in terms of the activation values themselves (e.g.
//! `sigmoid' = a * (1 - a)`), which is why layers keep their activations
//! alive until the backward sweep has consumed them.
//!
//! The output layer pairs an activation with a loss: softmax goes with
//! cross-entropy, where the combined gradient collapses to `a - y`, and
//! every other activation goes with squared error.

/// Activation function selector for a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Relu,
    Sigmoid,
    Tanh,
    /// Row-wise softmax. Only meaningful on an output layer paired with
    /// cross-entropy loss; its full Jacobian is never materialized.
    Softmax,
}

impl Activation {
    /// Apply the function in place over `rows x cols` of a strided matrix.
    pub fn apply(&self, data: &mut [f32], stride: usize, rows: usize, cols: usize) {
        match self {
            Activation::Identity => {}
            Activation::Relu => {
                for r in 0..rows {
                    for v in data[r * stride..r * stride + cols].iter_mut() {
                        if *v < 0.0 {
                            *v = 0.0;
                        }
                    }
                }
            }
            Activation::Sigmoid => {
                for r in 0..rows {
                    for v in data[r * stride..r * stride + cols].iter_mut() {
                        *v = 1.0 / (1.0 + (-*v).exp());
                    }
                }
            }
            Activation::Tanh => {
                for r in 0..rows {
                    for v in data[r * stride..r * stride + cols].iter_mut() {
                        *v = v.tanh();
                    }
                }
            }
            Activation::Softmax => {
                for r in 0..rows {
                    let row = &mut data[r * stride..r * stride + cols];
                    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                    let mut sum = 0.0;
                    for v in row.iter_mut() {
                        *v = (*v - max).exp();
                        sum += *v;
                    }
                    let inv = 1.0 / sum;
                    for v in row.iter_mut() {
                        *v *= inv;
                    }
                }
            }
        }
    }

    /// Derivative expressed through the activation value.
    fn derivative(&self, a: f32) -> f32 {
        match self {
            Activation::Identity => 1.0,
            Activation::Relu => {
                if a > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Sigmoid => a * (1.0 - a),
            Activation::Tanh => 1.0 - a * a,
            // Softmax never flows through the elementwise-derivative path:
            // its gradient is produced jointly with the loss.
            Activation::Softmax => 1.0,
        }
    }

    /// Multiply a gradient matrix in place by the activation derivative.
    ///
    /// `grad` is `[rows, cols]` with stride `grad_stride`; `acts` holds the
    /// corresponding activation values with its own stride.
    pub fn mul_derivative(
        &self,
        grad: &mut [f32],
        grad_stride: usize,
        acts: &[f32],
        act_stride: usize,
        rows: usize,
        cols: usize,
    ) {
        if *self == Activation::Identity {
            return;
        }
        for r in 0..rows {
            let g = &mut grad[r * grad_stride..r * grad_stride + cols];
            let a = &acts[r * act_stride..r * act_stride + cols];
            for (gv, &av) in g.iter_mut().zip(a.iter()) {
                *gv *= self.derivative(av);
            }
        }
    }

    /// Compute the loss gradient with respect to pre-activations into
    /// `grad`, and return the scalar loss summed over the batch.
    ///
    /// `labels` is a packed `[rows, cols]` matrix of targets. For softmax
    /// the loss is cross-entropy and the gradient is `a - y`; otherwise the
    /// loss is `0.5 * Σ (a - y)²` and the gradient is `(a - y) * f'(a)`.
    pub fn loss_gradient(
        &self,
        acts: &[f32],
        act_stride: usize,
        labels: &[f32],
        grad: &mut [f32],
        grad_stride: usize,
        rows: usize,
        cols: usize,
    ) -> f32 {
        let mut loss = 0.0;
        for r in 0..rows {
            let a = &acts[r * act_stride..r * act_stride + cols];
            let y = &labels[r * cols..(r + 1) * cols];
            let g = &mut grad[r * grad_stride..r * grad_stride + cols];
            match self {
                Activation::Softmax => {
                    for ((gv, &av), &yv) in g.iter_mut().zip(a.iter()).zip(y.iter()) {
                        *gv = av - yv;
                        if yv > 0.0 {
                            loss -= yv * av.max(1e-12).ln();
                        }
                    }
                }
                _ => {
                    for ((gv, &av), &yv) in g.iter_mut().zip(a.iter()).zip(y.iter()) {
                        let diff = av - yv;
                        loss += 0.5 * diff * diff;
                        *gv = diff * self.derivative(av);
                    }
                }
            }
        }
        loss
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu_clamps_negatives() {
        let mut v = [-1.0, 0.5, -0.25, 2.0];
        Activation::Relu.apply(&mut v, 2, 2, 2);
        assert_eq!(v, [0.0, 0.5, 0.0, 2.0]);
    }

    #[test]
    fn test_sigmoid_midpoint() {
        let mut v = [0.0];
        Activation::Sigmoid.apply(&mut v, 1, 1, 1);
        assert!((v[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut v = [1.0, 2.0, 3.0, -5.0, 0.0, 5.0];
        Activation::Softmax.apply(&mut v, 3, 2, 3);
        for r in 0..2 {
            let sum: f32 = v[r * 3..r * 3 + 3].iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            assert!(v[r * 3..r * 3 + 3].iter().all(|x| *x >= 0.0));
        }
    }

    #[test]
    fn test_softmax_skips_bias_column() {
        // stride 3, cols 2: the third column must survive.
        let mut v = [1.0, 2.0, 9.0];
        Activation::Softmax.apply(&mut v, 3, 1, 2);
        assert_eq!(v[2], 9.0);
        assert!((v[0] + v[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_sigmoid_derivative_through_activation() {
        let acts = [0.5, 0.25];
        let mut grad = [1.0, 1.0];
        Activation::Sigmoid.mul_derivative(&mut grad, 2, &acts, 2, 1, 2);
        assert!((grad[0] - 0.25).abs() < 1e-6);
        assert!((grad[1] - 0.1875).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_loss_gradient_is_a_minus_y() {
        let acts = [0.7, 0.2, 0.1];
        let labels = [1.0, 0.0, 0.0];
        let mut grad = [0.0; 3];
        let loss =
            Activation::Softmax.loss_gradient(&acts, 3, &labels, &mut grad, 3, 1, 3);
        assert!((grad[0] - (-0.3)).abs() < 1e-6);
        assert!((grad[1] - 0.2).abs() < 1e-6);
        assert!((loss - (-(0.7f32.ln()))).abs() < 1e-5);
    }

    #[test]
    fn test_squared_error_identity_gradient() {
        let acts = [2.0, -1.0];
        let labels = [1.0, 1.0];
        let mut grad = [0.0; 2];
        let loss =
            Activation::Identity.loss_gradient(&acts, 2, &labels, &mut grad, 2, 1, 2);
        assert_eq!(grad, [1.0, -2.0]);
        assert!((loss - (0.5 + 2.0)).abs() < 1e-6);
    }
}
