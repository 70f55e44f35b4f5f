//! Sequential stack of layers.
//!
//! The workhorse combinator: children run strictly in order, each feeding
//! the next. Forward threads activations bottom-to-top; backward threads
//! gradients top-to-bottom through the two shared ping-pong buffers,
//! swapping its notion of the live buffer on every child that returns
//! [`GradFlow::InPrev`]. The flag the pack itself returns is the XOR of
//! its children's flags, and the chain short-circuits at the first child
//! that stops backprop.
//!
//! The pack stages nothing itself: children keep their own persistent
//! activations and share the pack's scratch remainder, since sibling calls
//! never overlap in time.

use crate::arena::{Arena, ArenaRange, Carver};
use crate::checkpoint::Checkpoint;
use crate::error::{NetError, NetResult};
use crate::layers::{
    Activations, BatchPair, GradFlow, Layer, Pass, PlanReport, TopologyCursor, TrainContext,
};

pub struct VerticalPack {
    index: usize,
    children: Vec<Box<dyn Layer>>,
}

impl VerticalPack {
    pub fn new(children: Vec<Box<dyn Layer>>) -> Self {
        Self { index: 0, children }
    }

    pub fn children(&self) -> &[Box<dyn Layer>] {
        &self.children
    }
}

impl Layer for VerticalPack {
    fn layer_index(&self) -> usize {
        self.index
    }

    fn neurons(&self) -> usize {
        self.children.last().map_or(0, |c| c.neurons())
    }

    fn activations(&self) -> Activations {
        self.children
            .last()
            .map_or_else(Activations::default, |c| c.activations())
    }

    fn wire(&mut self, cursor: &mut TopologyCursor, fan_in: usize) -> NetResult<()> {
        self.index = cursor.assign();
        if self.children.is_empty() {
            return Err(NetError::EmptyPack {
                layer_index: self.index,
            });
        }
        let mut incoming = fan_in;
        for child in &mut self.children {
            child.wire(cursor, incoming)?;
            incoming = child.neurons();
        }
        Ok(())
    }

    fn plan(&mut self, batch: BatchPair, ctx: &TrainContext) -> NetResult<PlanReport> {
        let mut incoming = batch;
        let mut persistent = 0;
        let mut eval_scratch = 0;
        let mut train_scratch = 0;
        let mut grad_envelope = 0;
        let mut params = 0;
        for (done, child) in self.children.iter_mut().enumerate() {
            let report = match child.plan(incoming, ctx) {
                Ok(report) => report,
                Err(err) => {
                    // Symmetric teardown of the children that already
                    // initialized before the failing one.
                    for c in self.children[..done].iter_mut() {
                        c.deinit();
                    }
                    return Err(err);
                }
            };
            incoming = report.out_batch;
            persistent += report.persistent;
            eval_scratch = eval_scratch.max(report.eval_scratch);
            train_scratch = train_scratch.max(report.train_scratch);
            grad_envelope = grad_envelope.max(report.grad_envelope);
            params += report.params;
        }
        Ok(PlanReport {
            out_batch: incoming,
            persistent,
            eval_scratch,
            train_scratch,
            grad_envelope,
            params,
        })
    }

    fn assign_memory(&mut self, persistent: &mut Carver, scratch: ArenaRange) -> NetResult<()> {
        for child in &mut self.children {
            child.assign_memory(persistent, scratch)?;
        }
        Ok(())
    }

    fn set_batch_size(&mut self, batch: usize, arena: &mut Arena) -> usize {
        let mut b = batch;
        for child in &mut self.children {
            b = child.set_batch_size(b, arena);
        }
        b
    }

    fn fprop(&mut self, prev: Activations, arena: &mut Arena, pass: Pass) {
        let mut below = prev;
        for child in &mut self.children {
            child.fprop(below, arena, pass);
            below = child.activations();
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
        let mut cur = dl_da;
        let mut other = dl_da_prev;
        for i in (0..self.children.len()).rev() {
            let below = if i == 0 {
                prev
            } else {
                self.children[i - 1].activations()
            };
            let stops = self.children[i].stops_backprop();
            let want = if stops {
                false
            } else if i == 0 {
                want_prev
            } else {
                true
            };
            let flag = self.children[i].bprop(below, cur, other, want, arena);
            if flag == GradFlow::InPrev {
                std::mem::swap(&mut cur, &mut other);
            }
            if stops {
                break;
            }
        }
        if cur == dl_da {
            GradFlow::InCurr
        } else {
            GradFlow::InPrev
        }
    }

    fn pre_training_fprop(&mut self) {
        for child in &mut self.children {
            child.pre_training_fprop();
        }
    }

    fn deinit(&mut self) {
        for child in &mut self.children {
            child.deinit();
        }
    }

    fn stops_backprop(&self) -> bool {
        self.children.iter().any(|c| c.stops_backprop())
    }

    fn is_output(&self) -> bool {
        self.children.last().is_some_and(|c| c.is_output())
    }

    fn loss_addendum(&self) -> f32 {
        self.children.iter().map(|c| c.loss_addendum()).sum()
    }

    fn loss_gradient(
        &mut self,
        labels: &[f32],
        grad: ArenaRange,
        arena: &mut Arena,
    ) -> NetResult<f32> {
        match self.children.last_mut() {
            Some(top) => top.loss_gradient(labels, grad, arena),
            None => Err(NetError::NoOutputLayer),
        }
    }

    fn export_state(&self, out: &mut Checkpoint) {
        for child in &self.children {
            child.export_state(out);
        }
    }

    fn import_state(&mut self, ckpt: &Checkpoint) -> NetResult<()> {
        for child in &mut self.children {
            child.import_state(ckpt)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;
    use crate::error::AllocSite;
    use crate::layers::{DenseLayer, IdentityLayer};
    use crate::matrix::Matrix;
    use crate::optimizer::OptimizerConfig;

    fn build(children: Vec<Box<dyn Layer>>, fan_in: usize) -> (VerticalPack, Arena) {
        let mut pack = VerticalPack::new(children);
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        pack.wire(&mut cursor, fan_in).unwrap();
        let ctx = TrainContext { seed: 3 };
        let report = pack.plan(BatchPair::new(2, 2).unwrap(), &ctx).unwrap();

        // [input acts | children persistent | scratch | g0 | g1]
        let input_elems = 2 * (fan_in + 1);
        let total = input_elems + report.persistent + report.train_scratch
            + 2 * report.grad_envelope.max(1);
        let mut arena = Arena::new(vec![0.0; total]);
        let mut carver = Carver::new(
            ArenaRange { offset: input_elems, len: report.persistent },
            AllocSite::Activations,
        );
        let scratch = ArenaRange {
            offset: input_elems + report.persistent,
            len: report.train_scratch,
        };
        pack.assign_memory(&mut carver, scratch).unwrap();
        pack.set_batch_size(2, &mut arena);
        (pack, arena)
    }

    fn input_acts(fan_in: usize) -> Activations {
        Activations {
            range: ArenaRange { offset: 0, len: 2 * (fan_in + 1) },
            neurons: fan_in,
            has_bias: true,
            batch: 2,
        }
    }

    #[test]
    fn test_three_child_chain_flag_matches_child_xor() {
        // Three identities each return InCurr; their XOR is InCurr and the
        // pack must agree.
        let children: Vec<Box<dyn Layer>> = vec![
            Box::new(IdentityLayer::new()),
            Box::new(IdentityLayer::new()),
            Box::new(IdentityLayer::new()),
        ];
        let (mut pack, mut arena) = build(children, 3);
        let prev = input_acts(3);
        pack.fprop(prev, &mut arena, Pass::Train);

        let env = 2 * 3;
        let base = arena.capacity() - 2 * env;
        let g0 = ArenaRange { offset: base, len: env };
        let g1 = ArenaRange { offset: base + env, len: env };
        let flag = pack.bprop(prev, g0, g1, true, &mut arena);
        assert_eq!(flag, GradFlow::InCurr);
    }

    // Give a dense child an identity weight matrix (zero bias weights) so
    // it hands the gradient to the other buffer numerically unchanged.
    fn load_identity_weights(pack: &mut VerticalPack, layer_indices: &[usize]) {
        let eye = Matrix::from_vec(2, 3, vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let mut ckpt = Checkpoint::new();
        for idx in layer_indices {
            ckpt.insert(&format!("layer{}.weights", idx), eye.clone());
        }
        pack.import_state(&ckpt).unwrap();
    }

    #[test]
    fn test_mixed_chain_even_swaps_land_in_seed_buffer() {
        // dense -> identity -> dense: each dense hands off (InPrev), the
        // identity stays put (InCurr). Two swaps cancel, so the pack must
        // report InCurr with the live gradient back in the seeded buffer.
        let children: Vec<Box<dyn Layer>> = vec![
            Box::new(DenseLayer::new(2, Activation::Identity, OptimizerConfig::default())),
            Box::new(IdentityLayer::new()),
            Box::new(DenseLayer::new(2, Activation::Identity, OptimizerConfig::default())),
        ];
        let (mut pack, mut arena) = build(children, 2);
        load_identity_weights(&mut pack, &[2, 4]);

        let prev = input_acts(2);
        pack.fprop(prev, &mut arena, Pass::Train);

        let env = 2 * 2;
        let base = arena.capacity() - 2 * env;
        let g0 = ArenaRange { offset: base, len: env };
        let g1 = ArenaRange { offset: base + env, len: env };
        arena
            .slice_mut(g0)
            .copy_from_slice(&[1.0, -2.0, 3.0, -4.0]);

        let flag = pack.bprop(prev, g0, g1, true, &mut arena);
        assert_eq!(flag, GradFlow::InCurr);
        assert_eq!(arena.slice(g0), &[1.0, -2.0, 3.0, -4.0]);
    }

    #[test]
    fn test_mixed_chain_odd_swaps_land_in_other_buffer() {
        // dense -> identity: one hand-off, so the pack reports InPrev and
        // the live gradient sits in the buffer passed as dl_da_prev.
        let children: Vec<Box<dyn Layer>> = vec![
            Box::new(DenseLayer::new(2, Activation::Identity, OptimizerConfig::default())),
            Box::new(IdentityLayer::new()),
        ];
        let (mut pack, mut arena) = build(children, 2);
        load_identity_weights(&mut pack, &[2]);

        let prev = input_acts(2);
        pack.fprop(prev, &mut arena, Pass::Train);

        let env = 2 * 2;
        let base = arena.capacity() - 2 * env;
        let g0 = ArenaRange { offset: base, len: env };
        let g1 = ArenaRange { offset: base + env, len: env };
        arena
            .slice_mut(g0)
            .copy_from_slice(&[0.5, 1.5, -2.5, 4.0]);

        let flag = pack.bprop(prev, g0, g1, true, &mut arena);
        assert_eq!(flag, GradFlow::InPrev);
        assert_eq!(arena.slice(g1), &[0.5, 1.5, -2.5, 4.0]);
    }

    #[test]
    fn test_forward_threads_through_children() {
        let children: Vec<Box<dyn Layer>> = vec![
            Box::new(IdentityLayer::new()),
            Box::new(IdentityLayer::new()),
        ];
        let (mut pack, mut arena) = build(children, 2);
        let prev = input_acts(2);
        {
            let data = arena.slice_mut(prev.range);
            data.copy_from_slice(&[7.0, 8.0, 1.0, 9.0, 10.0, 1.0]);
        }
        pack.fprop(prev, &mut arena, Pass::Eval);
        let out = pack.activations();
        assert_eq!(out.neurons, 2);
        let data = arena.slice(out.range);
        assert_eq!(data, &[7.0, 8.0, 1.0, 9.0, 10.0, 1.0]);
    }

    #[test]
    fn test_empty_pack_rejected() {
        let mut pack = VerticalPack::new(vec![]);
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        let err = pack.wire(&mut cursor, 2).unwrap_err();
        assert!(matches!(err, NetError::EmptyPack { layer_index: 1 }));
    }

    #[test]
    fn test_scratch_is_max_of_children_not_sum() {
        let children: Vec<Box<dyn Layer>> = vec![
            Box::new(IdentityLayer::new()),
            Box::new(IdentityLayer::new()),
            Box::new(IdentityLayer::new()),
        ];
        let mut pack = VerticalPack::new(children);
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        pack.wire(&mut cursor, 4).unwrap();
        let ctx = TrainContext { seed: 3 };
        let report = pack.plan(BatchPair::new(2, 2).unwrap(), &ctx).unwrap();
        // Identities need no scratch; the envelope is the max single
        // child's, not three times it.
        assert_eq!(report.train_scratch, 0);
        assert_eq!(report.grad_envelope, 2 * 4);
        assert_eq!(report.persistent, 3 * 2 * 5);
    }
}
