//! Fully connected layer.
//!
//! Weights are `[neurons, fan_in + 1]` with the last column holding the
//! bias weights, matching the biased activation contract: the forward pass
//! is one `[batch, fan_in+1] x [neurons, fan_in+1]ᵀ` product, no separate
//! bias add. Weights persist across sessions; the weight-gradient staging
//! matrix and the optimizer accumulators are session state, created during
//! planning and dropped at deinit.
//!
//! The backward pass stages `dLdW = dLdAᵀ · prev` into its own owned
//! buffer rather than reusing the gradient buffer as scratch, then hands
//! it straight to the optimizer.

use crate::activation::Activation;
use crate::arena::{Arena, ArenaRange, Carver};
use crate::checkpoint::Checkpoint;
use crate::error::{NetError, NetResult};
use crate::layers::{
    Activations, BatchPair, GradFlow, Layer, Pass, PlanReport, TopologyCursor, TrainContext,
};
use crate::matrix::{matmul_nn, matmul_nt, matmul_tn, Matrix};
use crate::optimizer::{GradientOptimizer, OptimizerConfig};
use crate::rng::{SeedRng, WeightInit};

pub struct DenseLayer {
    index: usize,
    neurons: usize,
    fan_in: usize,
    activation: Activation,
    output: bool,
    halt: bool,
    weight_init: WeightInit,
    weights: Option<Matrix>,
    weight_grad: Option<Matrix>,
    optimizer: GradientOptimizer,
    acts: Activations,
    max_batch: usize,
}

impl DenseLayer {
    pub fn new(neurons: usize, activation: Activation, optimizer: OptimizerConfig) -> Self {
        assert!(neurons > 0, "dense layer needs at least one neuron");
        Self {
            index: 0,
            neurons,
            fan_in: 0,
            activation,
            output: false,
            halt: false,
            weight_init: WeightInit::ScaledUniform,
            weights: None,
            weight_grad: None,
            optimizer: GradientOptimizer::new(optimizer),
            acts: Activations::default(),
            max_batch: 0,
        }
    }

    /// Mark this as the network's output layer: no bias column, and labels
    /// can be turned into a loss gradient.
    pub fn into_output(mut self) -> Self {
        self.output = true;
        self
    }

    /// Terminate backward chains here: layers below never need gradients.
    pub fn halt_backprop(mut self) -> Self {
        self.halt = true;
        self
    }

    pub fn with_weight_init(mut self, init: WeightInit) -> Self {
        self.weight_init = init;
        self
    }

    pub fn weights(&self) -> Option<&Matrix> {
        self.weights.as_ref()
    }

    fn state_tag(&self) -> String {
        format!("layer{}", self.index)
    }
}

impl Layer for DenseLayer {
    fn layer_index(&self) -> usize {
        self.index
    }

    fn neurons(&self) -> usize {
        self.neurons
    }

    fn activations(&self) -> Activations {
        self.acts
    }

    fn wire(&mut self, cursor: &mut TopologyCursor, fan_in: usize) -> NetResult<()> {
        self.index = cursor.assign();
        if fan_in == 0 {
            return Err(NetError::MissingFanIn {
                layer_index: self.index,
            });
        }
        self.fan_in = fan_in;
        // Weights carried over from a previous session or checkpoint must
        // still fit this topology.
        if let Some(w) = &self.weights {
            let expected = (self.neurons, fan_in + 1);
            if w.shape() != expected {
                return Err(NetError::WeightShape {
                    layer_index: self.index,
                    expected,
                    actual: w.shape(),
                });
            }
        }
        Ok(())
    }

    fn plan(&mut self, batch: BatchPair, ctx: &TrainContext) -> NetResult<PlanReport> {
        self.max_batch = batch.eval;
        let cols = self.fan_in + 1;
        if self.weights.is_none() {
            let mut w = Matrix::zeros(self.neurons, cols);
            let mut rng = SeedRng::derive(ctx.seed, self.index);
            rng.fill_weights(w.as_mut_slice(), self.weight_init, self.fan_in);
            self.weights = Some(w);
        }
        self.weight_grad = Some(Matrix::zeros(self.neurons, cols));
        self.optimizer
            .init(self.neurons, cols, ctx.seed ^ self.index as u64);
        Ok(PlanReport {
            out_batch: batch,
            persistent: Activations::storage(self.neurons, !self.output, batch.eval),
            eval_scratch: 0,
            train_scratch: 0,
            grad_envelope: batch.train * self.neurons.max(self.fan_in),
            params: self.neurons * cols,
        })
    }

    fn assign_memory(&mut self, persistent: &mut Carver, _scratch: ArenaRange) -> NetResult<()> {
        let range = persistent.carve(Activations::storage(
            self.neurons,
            !self.output,
            self.max_batch,
        ))?;
        self.acts = Activations {
            range,
            neurons: self.neurons,
            has_bias: !self.output,
            batch: 0,
        };
        Ok(())
    }

    fn set_batch_size(&mut self, batch: usize, arena: &mut Arena) -> usize {
        self.acts.batch = batch;
        self.acts.pin_bias(arena);
        batch
    }

    fn fprop(&mut self, prev: Activations, arena: &mut Arena, _pass: Pass) {
        debug_assert!(prev.has_bias, "dense layers read a biased input matrix");
        debug_assert_eq!(prev.neurons, self.fan_in);
        let batch = self.acts.batch;
        let own_stride = self.acts.stride();
        let prev_stride = prev.stride();
        if let Some(w) = &self.weights {
            let (prev_data, own_data) = arena.read_write(prev.range, self.acts.range);
            matmul_nt(
                own_data,
                own_stride,
                prev_data,
                prev_stride,
                w.as_slice(),
                self.fan_in + 1,
                batch,
                self.neurons,
                self.fan_in + 1,
            );
            self.activation
                .apply(own_data, own_stride, batch, self.neurons);
        }
    }

    fn bprop(
        &mut self,
        prev: Activations,
        dl_da: ArenaRange,
        dl_da_prev: ArenaRange,
        want_prev: bool,
        arena: &mut Arena,
    ) -> GradFlow {
        let batch = self.acts.batch;
        let n = self.neurons;

        // Output layers receive the gradient w.r.t. pre-activations
        // directly from the loss; everything else folds in f'(a) here.
        if !self.output {
            let (acts, grad) = arena.read_write(self.acts.range, dl_da);
            self.activation
                .mul_derivative(grad, n, acts, self.acts.stride(), batch, n);
        }

        // dLdW = dLdAᵀ · prev, summed over the batch.
        if let Some(wg) = self.weight_grad.as_mut() {
            let grad = arena.slice(dl_da);
            let prev_data = arena.slice(prev.range);
            matmul_tn(
                wg.as_mut_slice(),
                self.fan_in + 1,
                grad,
                n,
                prev_data,
                prev.stride(),
                n,
                self.fan_in + 1,
                batch,
            );
        }

        // dLdAPrev = dLdA · W, dropping the bias-weight column. Must run
        // before the optimizer mutates the weights.
        if want_prev && !self.halt {
            if let Some(w) = &self.weights {
                let (grad, prev_grad) = arena.read_write(dl_da, dl_da_prev);
                matmul_nn(
                    prev_grad,
                    self.fan_in,
                    grad,
                    n,
                    w.as_slice(),
                    self.fan_in + 1,
                    batch,
                    self.fan_in,
                    n,
                );
            }
        }

        if let (Some(w), Some(wg)) = (self.weights.as_mut(), self.weight_grad.as_mut()) {
            self.optimizer.apply_grad(w, wg);
        }
        GradFlow::InPrev
    }

    fn pre_training_fprop(&mut self) {
        if let Some(w) = self.weights.as_mut() {
            self.optimizer.pre_training_fprop(w);
        }
    }

    fn deinit(&mut self) {
        self.weight_grad = None;
        self.optimizer.deinit();
        self.acts = Activations::default();
        self.max_batch = 0;
    }

    fn stops_backprop(&self) -> bool {
        self.halt
    }

    fn is_output(&self) -> bool {
        self.output
    }

    fn loss_addendum(&self) -> f32 {
        match &self.weights {
            Some(w) => self.optimizer.loss_addendum(w),
            None => 0.0,
        }
    }

    fn loss_gradient(
        &mut self,
        labels: &[f32],
        grad: ArenaRange,
        arena: &mut Arena,
    ) -> NetResult<f32> {
        if !self.output {
            return Err(NetError::NoOutputLayer);
        }
        let batch = self.acts.batch;
        debug_assert_eq!(labels.len(), batch * self.neurons);
        let (acts, grad_data) = arena.read_write(self.acts.range, grad);
        Ok(self.activation.loss_gradient(
            acts,
            self.acts.stride(),
            labels,
            grad_data,
            self.neurons,
            batch,
            self.neurons,
        ))
    }

    fn export_state(&self, out: &mut Checkpoint) {
        let tag = self.state_tag();
        if let Some(w) = &self.weights {
            out.insert(&format!("{}.weights", tag), w.clone());
        }
        self.optimizer.export_state(&tag, out);
    }

    fn import_state(&mut self, ckpt: &Checkpoint) -> NetResult<()> {
        let tag = self.state_tag();
        let expected = (self.neurons, self.fan_in + 1);
        self.weights = Some(ckpt.get(&format!("{}.weights", tag), expected)?);
        self.optimizer.import_state(&tag, ckpt)
    }
}
