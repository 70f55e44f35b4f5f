//! Activation penalty and dropout wrapper.
//!
//! Wraps any layer and, during training passes only, applies one or both
//! of:
//!
//! - an activation regularizer: an L1 or L2 penalty on the wrapped layer's
//!   activations, contributing a loss addendum on the forward pass and an
//!   additive gradient term on the backward pass;
//! - inverted dropout: each activation is zeroed with probability `p` or
//!   scaled by `1/(1-p)`, so eval passes need no rescaling at all.
//!
//! The penalty is always computed against the *pre-dropout* activations.
//! When dropout is enabled the wrapper keeps a persistent copy of the
//! clean data columns and restores them into the wrapped layer's
//! activation matrix at the start of `bprop`: downstream layers consumed
//! the dropped values during the forward sweep (correct), while the
//! wrapped layer's own derivative must see the values it actually
//! produced. The backward mask application is symmetric to the forward
//! one, with the same stored scale factors.

use crate::arena::{Arena, ArenaRange, Carver};
use crate::checkpoint::Checkpoint;
use crate::error::NetResult;
use crate::layers::{
    Activations, BatchPair, GradFlow, Layer, Pass, PlanReport, TopologyCursor, TrainContext,
};
use crate::rng::SeedRng;

/// Differentiable activation regularizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Penalty {
    /// `scale * Σ |a|`, gradient `scale * sign(a)`.
    L1 { scale: f32 },
    /// `scale * 0.5 * Σ a²`, gradient `scale * a`.
    L2 { scale: f32 },
}

impl Penalty {
    fn loss(&self, acts: &[f32], stride: usize, batch: usize, cols: usize) -> f32 {
        let mut sum = 0.0;
        for r in 0..batch {
            let row = &acts[r * stride..r * stride + cols];
            sum += match self {
                Penalty::L1 { .. } => row.iter().map(|a| a.abs()).sum::<f32>(),
                Penalty::L2 { .. } => row.iter().map(|a| a * a).sum::<f32>(),
            };
        }
        match self {
            Penalty::L1 { scale } => scale * sum,
            Penalty::L2 { scale } => scale * 0.5 * sum,
        }
    }

    fn add_gradient(
        &self,
        acts: &[f32],
        stride: usize,
        grad: &mut [f32],
        grad_stride: usize,
        batch: usize,
        cols: usize,
    ) {
        for r in 0..batch {
            let a = &acts[r * stride..r * stride + cols];
            let g = &mut grad[r * grad_stride..r * grad_stride + cols];
            match self {
                Penalty::L1 { scale } => {
                    for (gv, &av) in g.iter_mut().zip(a.iter()) {
                        *gv += scale
                            * if av > 0.0 {
                                1.0
                            } else if av < 0.0 {
                                -1.0
                            } else {
                                0.0
                            };
                    }
                }
                Penalty::L2 { scale } => {
                    for (gv, &av) in g.iter_mut().zip(a.iter()) {
                        *gv += scale * av;
                    }
                }
            }
        }
    }
}

pub struct PenaltyWrapper {
    index: usize,
    inner: Box<dyn Layer>,
    penalty: Option<Penalty>,
    /// Drop probability.
    dropout: Option<f32>,
    rng: SeedRng,
    /// Per-element scale factors: 0 or 1/(1-p). `[train_batch, neurons]`.
    mask: ArenaRange,
    /// Clean pre-dropout data columns, restored before the inner bprop.
    predrop: ArenaRange,
    loss: f32,
    masked: bool,
    train_batch: usize,
}

impl PenaltyWrapper {
    pub fn new(inner: Box<dyn Layer>, penalty: Option<Penalty>, dropout: Option<f32>) -> Self {
        if let Some(p) = dropout {
            assert!((0.0..1.0).contains(&p), "drop probability must be in [0, 1)");
        }
        Self {
            index: 0,
            inner,
            penalty,
            dropout,
            rng: SeedRng::new(0),
            mask: ArenaRange::EMPTY,
            predrop: ArenaRange::EMPTY,
            loss: 0.0,
            masked: false,
            train_batch: 0,
        }
    }
}

impl Layer for PenaltyWrapper {
    fn layer_index(&self) -> usize {
        self.index
    }

    fn neurons(&self) -> usize {
        self.inner.neurons()
    }

    fn activations(&self) -> Activations {
        self.inner.activations()
    }

    fn wire(&mut self, cursor: &mut TopologyCursor, fan_in: usize) -> NetResult<()> {
        self.index = cursor.assign();
        self.inner.wire(cursor, fan_in)
    }

    fn plan(&mut self, batch: BatchPair, ctx: &TrainContext) -> NetResult<PlanReport> {
        let report = self.inner.plan(batch, ctx)?;
        self.rng = SeedRng::derive(ctx.seed, self.index);
        self.train_batch = report.out_batch.train;
        let n = self.inner.neurons();
        let dropout_persistent = if self.dropout.is_some() {
            2 * self.train_batch * n
        } else {
            0
        };
        Ok(PlanReport {
            persistent: report.persistent + dropout_persistent,
            grad_envelope: report.grad_envelope.max(self.train_batch * n),
            ..report
        })
    }

    fn assign_memory(&mut self, persistent: &mut Carver, scratch: ArenaRange) -> NetResult<()> {
        if self.dropout.is_some() {
            let n = self.inner.neurons();
            self.mask = persistent.carve(self.train_batch * n)?;
            self.predrop = persistent.carve(self.train_batch * n)?;
        }
        self.inner.assign_memory(persistent, scratch)
    }

    fn set_batch_size(&mut self, batch: usize, arena: &mut Arena) -> usize {
        self.inner.set_batch_size(batch, arena)
    }

    fn fprop(&mut self, prev: Activations, arena: &mut Arena, pass: Pass) {
        self.inner.fprop(prev, arena, pass);
        self.loss = 0.0;
        self.masked = false;
        if pass != Pass::Train {
            return;
        }
        let acts = self.inner.activations();
        let batch = acts.batch;
        let n = acts.neurons;
        let stride = acts.stride();

        if let Some(penalty) = self.penalty {
            self.loss = penalty.loss(arena.slice(acts.range), stride, batch, n);
        }

        if let Some(p) = self.dropout {
            debug_assert!(batch <= self.train_batch);
            // Keep the clean activations for the backward sweep.
            {
                let (src, dst) = arena.read_write(acts.range, self.predrop);
                for r in 0..batch {
                    dst[r * n..(r + 1) * n]
                        .copy_from_slice(&src[r * stride..r * stride + n]);
                }
            }
            let inv_keep = 1.0 / (1.0 - p);
            {
                let mask = arena.slice_mut(self.mask);
                for v in mask[..batch * n].iter_mut() {
                    *v = if self.rng.chance(p) { 0.0 } else { inv_keep };
                }
            }
            let (mask, data) = arena.read_write(self.mask, acts.range);
            for r in 0..batch {
                let m = &mask[r * n..(r + 1) * n];
                let d = &mut data[r * stride..r * stride + n];
                for (dv, &mv) in d.iter_mut().zip(m.iter()) {
                    *dv *= mv;
                }
            }
            self.masked = true;
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
        let acts = self.inner.activations();
        let batch = acts.batch;
        let n = acts.neurons;
        let stride = acts.stride();

        if self.masked {
            // Same mask, same scaling: gradient of y = a * mask.
            {
                let (mask, grad) = arena.read_write(self.mask, dl_da);
                for (gv, &mv) in grad[..batch * n].iter_mut().zip(mask[..batch * n].iter()) {
                    *gv *= mv;
                }
            }
            // Put the clean activations back for the inner derivative.
            let (src, dst) = arena.read_write(self.predrop, acts.range);
            for r in 0..batch {
                dst[r * stride..r * stride + n].copy_from_slice(&src[r * n..(r + 1) * n]);
            }
            self.masked = false;
        }

        if let Some(penalty) = self.penalty {
            let (acts_data, grad) = arena.read_write(acts.range, dl_da);
            penalty.add_gradient(acts_data, stride, grad, n, batch, n);
        }

        self.inner.bprop(prev, dl_da, dl_da_prev, want_prev, arena)
    }

    fn pre_training_fprop(&mut self) {
        self.inner.pre_training_fprop();
    }

    fn deinit(&mut self) {
        self.inner.deinit();
        self.mask = ArenaRange::EMPTY;
        self.predrop = ArenaRange::EMPTY;
        self.loss = 0.0;
        self.masked = false;
        self.train_batch = 0;
    }

    fn stops_backprop(&self) -> bool {
        self.inner.stops_backprop()
    }

    fn is_output(&self) -> bool {
        self.inner.is_output()
    }

    fn loss_addendum(&self) -> f32 {
        self.loss + self.inner.loss_addendum()
    }

    fn loss_gradient(
        &mut self,
        labels: &[f32],
        grad: ArenaRange,
        arena: &mut Arena,
    ) -> NetResult<f32> {
        self.inner.loss_gradient(labels, grad, arena)
    }

    fn export_state(&self, out: &mut Checkpoint) {
        self.inner.export_state(out);
    }

    fn import_state(&mut self, ckpt: &Checkpoint) -> NetResult<()> {
        self.inner.import_state(ckpt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AllocSite;
    use crate::layers::IdentityLayer;

    fn build(penalty: Option<Penalty>, dropout: Option<f32>) -> (PenaltyWrapper, Arena, Activations) {
        let mut wrapper =
            PenaltyWrapper::new(Box::new(IdentityLayer::new()), penalty, dropout);
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        wrapper.wire(&mut cursor, 4).unwrap();
        let ctx = TrainContext { seed: 33 };
        let report = wrapper.plan(BatchPair::new(2, 2).unwrap(), &ctx).unwrap();

        let input_elems = 2 * 5;
        let total =
            input_elems + report.persistent + report.train_scratch + 2 * report.grad_envelope;
        let mut arena = Arena::new(vec![0.0; total]);
        let mut carver = Carver::new(
            ArenaRange { offset: input_elems, len: report.persistent },
            AllocSite::Activations,
        );
        let scratch = ArenaRange {
            offset: input_elems + report.persistent,
            len: report.train_scratch,
        };
        wrapper.assign_memory(&mut carver, scratch).unwrap();
        wrapper.set_batch_size(2, &mut arena);
        let prev = Activations {
            range: ArenaRange { offset: 0, len: input_elems },
            neurons: 4,
            has_bias: true,
            batch: 2,
        };
        (wrapper, arena, prev)
    }

    #[test]
    fn test_l2_penalty_loss_and_gradient() {
        let (mut wrapper, mut arena, prev) = build(Some(Penalty::L2 { scale: 0.1 }), None);
        arena
            .slice_mut(prev.range)
            .copy_from_slice(&[1.0, 2.0, 0.0, 0.0, 1.0, 0.0, 3.0, 0.0, 0.0, 1.0]);
        wrapper.fprop(prev, &mut arena, Pass::Train);
        // 0.1 * 0.5 * (1 + 4 + 9) = 0.7
        assert!((wrapper.loss_addendum() - 0.7).abs() < 1e-6);

        let env = 2 * 4;
        let base = arena.capacity() - 2 * env;
        let g0 = ArenaRange { offset: base, len: env };
        let g1 = ArenaRange { offset: base + env, len: env };
        arena.slice_mut(g0).iter_mut().for_each(|v| *v = 1.0);
        let flag = wrapper.bprop(prev, g0, g1, true, &mut arena);
        // Identity inner: the buffer does not alternate.
        assert_eq!(flag, GradFlow::InCurr);
        let g = arena.slice(g0);
        assert!((g[0] - 1.1).abs() < 1e-6);
        assert!((g[1] - 1.2).abs() < 1e-6);
        assert!((g[4] - 1.0).abs() < 1e-6);
        assert!((g[5] - 1.3).abs() < 1e-6);
    }

    #[test]
    fn test_eval_pass_skips_penalty_and_dropout() {
        let (mut wrapper, mut arena, prev) =
            build(Some(Penalty::L2 { scale: 0.1 }), Some(0.5));
        arena
            .slice_mut(prev.range)
            .copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 1.0, 5.0, 6.0, 7.0, 8.0, 1.0]);
        wrapper.fprop(prev, &mut arena, Pass::Eval);
        assert_eq!(wrapper.loss_addendum(), 0.0);
        let out = wrapper.activations();
        let data = arena.slice(out.range);
        // Inverted dropout: eval activations are the raw values.
        assert_eq!(&data[0..4], &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_dropout_masks_forward_and_backward_consistently() {
        let (mut wrapper, mut arena, prev) = build(None, Some(0.5));
        let input = [1.0, 2.0, 3.0, 4.0, 1.0, 5.0, 6.0, 7.0, 8.0, 1.0];
        arena.slice_mut(prev.range).copy_from_slice(&input);
        wrapper.fprop(prev, &mut arena, Pass::Train);

        let out = wrapper.activations();
        let masked: Vec<f32> = arena.slice(out.range).to_vec();
        // Every surviving entry is scaled by 1/(1-p) = 2.
        for r in 0..2 {
            for c in 0..4 {
                let v = masked[r * 5 + c];
                let raw = input[r * 5 + c];
                assert!(v == 0.0 || (v - 2.0 * raw).abs() < 1e-6);
            }
        }

        let env = 2 * 4;
        let base = arena.capacity() - 2 * env;
        let g0 = ArenaRange { offset: base, len: env };
        let g1 = ArenaRange { offset: base + env, len: env };
        arena.slice_mut(g0).iter_mut().for_each(|v| *v = 1.0);
        wrapper.bprop(prev, g0, g1, true, &mut arena);

        // Gradient entries mirror the forward mask.
        let g = arena.slice(g0);
        for r in 0..2 {
            for c in 0..4 {
                let dropped = masked[r * 5 + c] == 0.0 && input[r * 5 + c] != 0.0;
                if dropped {
                    assert_eq!(g[r * 4 + c], 0.0);
                } else if input[r * 5 + c] != 0.0 {
                    assert!((g[r * 4 + c] - 2.0).abs() < 1e-6);
                }
            }
        }
        // And the wrapped layer's activations are clean again.
        let restored = arena.slice(out.range);
        assert_eq!(restored, &input);
    }
}
