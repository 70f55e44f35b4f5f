//! The input layer.
//!
//! Index 0, zero incoming neurons. Its only job is to copy the caller's
//! packed input batch into the arena with a pinned bias column so the first
//! real layer sees the same `[batch, neurons + 1]` contract as everything
//! else. It never participates in the backward sweep.

use crate::arena::{Arena, ArenaRange, Carver};
use crate::error::NetResult;
use crate::layers::{
    Activations, BatchPair, GradFlow, Layer, Pass, PlanReport, TopologyCursor, TrainContext,
};

pub struct InputLayer {
    neurons: usize,
    index: usize,
    acts: Activations,
    max_batch: usize,
}

impl InputLayer {
    pub fn new(neurons: usize) -> Self {
        assert!(neurons > 0, "input layer needs at least one neuron");
        Self {
            neurons,
            index: 0,
            acts: Activations::default(),
            max_batch: 0,
        }
    }

    /// Copy a packed `[batch, neurons]` input into the activation matrix.
    pub fn load(&mut self, input: &[f32], arena: &mut Arena) {
        let batch = self.acts.batch;
        debug_assert_eq!(input.len(), batch * self.neurons);
        let stride = self.acts.stride();
        let data = arena.slice_mut(self.acts.range);
        for r in 0..batch {
            data[r * stride..r * stride + self.neurons]
                .copy_from_slice(&input[r * self.neurons..(r + 1) * self.neurons]);
        }
    }
}

impl Layer for InputLayer {
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
        debug_assert_eq!(fan_in, 0, "input layer has no incoming neurons");
        self.index = cursor.assign();
        debug_assert_eq!(self.index, 0, "input layer must be wired first");
        Ok(())
    }

    fn plan(&mut self, batch: BatchPair, _ctx: &TrainContext) -> NetResult<PlanReport> {
        self.max_batch = batch.eval;
        Ok(PlanReport {
            out_batch: batch,
            persistent: Activations::storage(self.neurons, true, batch.eval),
            eval_scratch: 0,
            train_scratch: 0,
            grad_envelope: 0,
            params: 0,
        })
    }

    fn assign_memory(&mut self, persistent: &mut Carver, _scratch: ArenaRange) -> NetResult<()> {
        let range = persistent.carve(Activations::storage(self.neurons, true, self.max_batch))?;
        self.acts = Activations {
            range,
            neurons: self.neurons,
            has_bias: true,
            batch: 0,
        };
        Ok(())
    }

    fn set_batch_size(&mut self, batch: usize, arena: &mut Arena) -> usize {
        self.acts.batch = batch;
        self.acts.pin_bias(arena);
        batch
    }

    fn fprop(&mut self, _prev: Activations, _arena: &mut Arena, _pass: Pass) {
        unreachable!("the driver loads input directly; input layers have no fprop")
    }

    fn bprop(
        &mut self,
        _prev: Activations,
        _dl_da: ArenaRange,
        _dl_da_prev: ArenaRange,
        _want_prev: bool,
        _arena: &mut Arena,
    ) -> GradFlow {
        unreachable!("backward sweeps never reach the input layer")
    }

    fn deinit(&mut self) {
        self.acts = Activations::default();
        self.max_batch = 0;
    }
}
