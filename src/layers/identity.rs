//! Pass-through layer.
//!
//! Forwards its input unchanged. It still owns an activation matrix —
//! downstream layers read from it, and packs rely on every child having
//! persistent output storage — but the backward direction is free: the
//! gradient of the identity is the gradient itself, so `bprop` leaves the
//! live values where they are and returns [`GradFlow::InCurr`]. This is
//! the layer that exercises the alternation flag in chains.

use crate::arena::{Arena, ArenaRange, Carver};
use crate::error::{NetError, NetResult};
use crate::layers::{
    Activations, BatchPair, GradFlow, Layer, Pass, PlanReport, TopologyCursor, TrainContext,
};
use crate::matrix::copy_block;

pub struct IdentityLayer {
    index: usize,
    neurons: usize,
    acts: Activations,
    max_batch: usize,
}

impl IdentityLayer {
    pub fn new() -> Self {
        Self {
            index: 0,
            neurons: 0,
            acts: Activations::default(),
            max_batch: 0,
        }
    }
}

impl Default for IdentityLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for IdentityLayer {
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
        self.neurons = fan_in;
        Ok(())
    }

    fn plan(&mut self, batch: BatchPair, _ctx: &TrainContext) -> NetResult<PlanReport> {
        self.max_batch = batch.eval;
        Ok(PlanReport {
            out_batch: batch,
            persistent: Activations::storage(self.neurons, true, batch.eval),
            eval_scratch: 0,
            train_scratch: 0,
            grad_envelope: batch.train * self.neurons,
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

    fn fprop(&mut self, prev: Activations, arena: &mut Arena, _pass: Pass) {
        debug_assert_eq!(prev.neurons, self.neurons);
        let batch = self.acts.batch;
        let dst_stride = self.acts.stride();
        let src_stride = prev.stride();
        let (src, dst) = arena.read_write(prev.range, self.acts.range);
        copy_block(dst, dst_stride, src, src_stride, batch, self.neurons);
    }

    fn bprop(
        &mut self,
        _prev: Activations,
        _dl_da: ArenaRange,
        _dl_da_prev: ArenaRange,
        _want_prev: bool,
        _arena: &mut Arena,
    ) -> GradFlow {
        // dL/dPrev == dL/dA: the live gradient stays in the caller's
        // dl_da buffer.
        GradFlow::InCurr
    }

    fn deinit(&mut self) {
        self.acts = Activations::default();
        self.max_batch = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AllocSite;

    #[test]
    fn test_fprop_copies_and_bprop_keeps_buffer() {
        let mut layer = IdentityLayer::new();
        let mut cursor = TopologyCursor::new();
        cursor.assign(); // input slot
        layer.wire(&mut cursor, 2).unwrap();
        assert_eq!(layer.neurons(), 2);
        let ctx = TrainContext { seed: 0 };
        layer.plan(BatchPair::new(1, 1).unwrap(), &ctx).unwrap();

        // Arena: [prev 0..3 | own 3..6]
        let mut arena = Arena::new(vec![5.0, 6.0, 1.0, 0.0, 0.0, 0.0]);
        let mut carver = Carver::new(ArenaRange { offset: 3, len: 3 }, AllocSite::Activations);
        layer.assign_memory(&mut carver, ArenaRange::EMPTY).unwrap();
        layer.set_batch_size(1, &mut arena);

        let prev = Activations {
            range: ArenaRange { offset: 0, len: 3 },
            neurons: 2,
            has_bias: true,
            batch: 1,
        };
        layer.fprop(prev, &mut arena, Pass::Eval);
        assert_eq!(arena.slice(layer.activations().range), &[5.0, 6.0, 1.0]);

        let flag = layer.bprop(
            prev,
            ArenaRange::EMPTY,
            ArenaRange::EMPTY,
            true,
            &mut arena,
        );
        assert_eq!(flag, GradFlow::InCurr);
    }

    #[test]
    fn test_wire_rejects_zero_fan_in() {
        let mut layer = IdentityLayer::new();
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        let err = layer.wire(&mut cursor, 0).unwrap_err();
        assert!(matches!(err, NetError::MissingFanIn { layer_index: 1 }));
    }
}
