//! Parallel concatenation over disjoint input slices.
//!
//! Each child reads its own `(offset, count)` slice of the incoming
//! neurons and the pack concatenates the children's outputs column-wise.
//! Wiring rejects any slice set that does not tile the incoming range
//! exactly: a gap or an overlap is a configuration error, caught once at
//! init.
//!
//! Children never see the pack's activation matrix directly. Forward
//! stages each child's input slice into a biased scratch view, runs the
//! child against it, and copies the child's output into the pack's concat
//! matrix. Backward slices the pack's incoming gradient per child, runs
//! the child against two staging gradient buffers, and accumulate-adds
//! each child's dLdAPrev into the shared incoming-gradient buffer —
//! addition, not overwrite, so the contract also holds for packs whose
//! slices are allowed to touch.

use crate::arena::{Arena, ArenaRange, Carver};
use crate::checkpoint::Checkpoint;
use crate::error::{AllocSite, NetError, NetResult};
use crate::layers::{
    slice_grad_columns, stage_biased, Activations, BatchPair, GradFlow, Layer, Pass, PlanReport,
    TopologyCursor, TrainContext,
};
use crate::matrix::{add_block, copy_block, zero_block};

/// A child's window into the pack's incoming neuron range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSlice {
    pub offset: usize,
    pub count: usize,
}

struct Child {
    layer: Box<dyn Layer>,
    slice: InputSlice,
    /// Column offset of this child's output in the concat matrix.
    col_off: usize,
}

pub struct HorizontalPack {
    index: usize,
    fan_in: usize,
    neurons: usize,
    children: Vec<Child>,
    acts: Activations,
    input_staging: ArenaRange,
    grad_staging: [ArenaRange; 2],
    max_slice: usize,
    child_envelope: usize,
    max_batch: usize,
    train_batch: usize,
}

impl HorizontalPack {
    pub fn new(children: Vec<(InputSlice, Box<dyn Layer>)>) -> Self {
        Self {
            index: 0,
            fan_in: 0,
            neurons: 0,
            children: children
                .into_iter()
                .map(|(slice, layer)| Child {
                    layer,
                    slice,
                    col_off: 0,
                })
                .collect(),
            acts: Activations::default(),
            input_staging: ArenaRange::EMPTY,
            grad_staging: [ArenaRange::EMPTY; 2],
            max_slice: 0,
            child_envelope: 0,
            max_batch: 0,
            train_batch: 0,
        }
    }

    /// Verify the children's slices tile `[0, fan_in)` with no gap and no
    /// overlap.
    fn check_coverage(&self, fan_in: usize) -> NetResult<()> {
        let mut slices: Vec<InputSlice> = self.children.iter().map(|c| c.slice).collect();
        slices.sort_by_key(|s| s.offset);
        let covered: usize = slices.iter().map(|s| s.count).sum();
        let mut cursor = 0;
        for s in &slices {
            if s.offset != cursor {
                return Err(NetError::SliceCoverage {
                    layer_index: self.index,
                    expected: fan_in,
                    covered,
                });
            }
            cursor = s.offset + s.count;
        }
        if cursor != fan_in {
            return Err(NetError::SliceCoverage {
                layer_index: self.index,
                expected: fan_in,
                covered,
            });
        }
        Ok(())
    }
}

impl Layer for HorizontalPack {
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
        if self.children.is_empty() {
            return Err(NetError::EmptyPack {
                layer_index: self.index,
            });
        }
        if fan_in == 0 {
            return Err(NetError::MissingFanIn {
                layer_index: self.index,
            });
        }
        self.fan_in = fan_in;
        self.check_coverage(fan_in)?;
        self.max_slice = self.children.iter().map(|c| c.slice.count).max().unwrap_or(0);
        let mut col_off = 0;
        for child in &mut self.children {
            child.layer.wire(cursor, child.slice.count)?;
            child.col_off = col_off;
            col_off += child.layer.neurons();
        }
        self.neurons = col_off;
        Ok(())
    }

    fn plan(&mut self, batch: BatchPair, ctx: &TrainContext) -> NetResult<PlanReport> {
        let mut out_batch: Option<BatchPair> = None;
        let mut persistent = 0;
        let mut child_eval = 0;
        let mut child_train = 0;
        let mut child_env = 0;
        let mut params = 0;
        for (done, child) in self.children.iter_mut().enumerate() {
            let report = match child.layer.plan(batch, ctx) {
                Ok(report) => report,
                Err(err) => {
                    for c in self.children[..done].iter_mut() {
                        c.layer.deinit();
                    }
                    return Err(err);
                }
            };
            match out_batch {
                None => out_batch = Some(report.out_batch),
                Some(expected) if expected != report.out_batch => {
                    for c in self.children[..=done].iter_mut() {
                        c.layer.deinit();
                    }
                    return Err(NetError::BatchMismatch {
                        layer_index: self.index,
                        expected: expected.train,
                        actual: report.out_batch.train,
                    });
                }
                Some(_) => {}
            }
            persistent += report.persistent;
            child_eval = child_eval.max(report.eval_scratch);
            child_train = child_train.max(report.train_scratch);
            child_env = child_env.max(report.grad_envelope);
            params += report.params;
        }
        let out_batch = out_batch.unwrap_or(batch);
        self.max_batch = out_batch.eval;
        self.train_batch = out_batch.train;
        self.child_envelope = child_env;
        let staging = batch.eval * (self.max_slice + 1);
        let own_persistent = Activations::storage(self.neurons, true, out_batch.eval);
        Ok(PlanReport {
            out_batch,
            persistent: persistent + own_persistent,
            eval_scratch: staging + child_eval,
            train_scratch: staging + 2 * child_env + child_train,
            grad_envelope: child_env
                .max(self.train_batch * self.neurons)
                .max(self.train_batch * self.fan_in),
            params,
        })
    }

    fn assign_memory(&mut self, persistent: &mut Carver, scratch: ArenaRange) -> NetResult<()> {
        let range = persistent.carve(Activations::storage(self.neurons, true, self.max_batch))?;
        self.acts = Activations {
            range,
            neurons: self.neurons,
            has_bias: true,
            batch: 0,
        };
        let mut carver = Carver::new(scratch, AllocSite::PackStaging);
        self.input_staging = carver.carve(self.max_batch * (self.max_slice + 1))?;
        self.grad_staging[0] = carver.carve(self.child_envelope)?;
        self.grad_staging[1] = carver.carve(self.child_envelope)?;
        let remainder = carver.remainder();
        for child in &mut self.children {
            child.layer.assign_memory(persistent, remainder)?;
        }
        Ok(())
    }

    fn set_batch_size(&mut self, batch: usize, arena: &mut Arena) -> usize {
        let mut out = batch;
        for child in &mut self.children {
            out = child.layer.set_batch_size(batch, arena);
        }
        self.acts.batch = out;
        self.acts.pin_bias(arena);
        out
    }

    fn fprop(&mut self, prev: Activations, arena: &mut Arena, pass: Pass) {
        let batch = self.acts.batch;
        let own_stride = self.acts.stride();
        for child in &mut self.children {
            let staged = stage_biased(
                arena,
                prev,
                child.slice.offset,
                child.slice.count,
                self.input_staging.sub(0, batch * (child.slice.count + 1)),
            );
            child.layer.fprop(staged, arena, pass);
            let out = child.layer.activations();
            let cols = child.layer.neurons();
            let (src, dst) = arena.read_write(out.range, self.acts.range);
            copy_block(
                &mut dst[child.col_off..],
                own_stride,
                src,
                out.stride(),
                batch,
                cols,
            );
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
        if want_prev {
            zero_block(
                arena.slice_mut(dl_da_prev),
                self.fan_in,
                batch,
                self.fan_in,
            );
        }
        for child in &mut self.children {
            let cols = child.layer.neurons();
            let child_dl = self.grad_staging[0].sub(0, batch * cols);
            slice_grad_columns(
                arena,
                dl_da,
                self.neurons,
                child.col_off,
                cols,
                batch,
                child_dl,
            );
            // The forward staging was clobbered by later siblings; rebuild
            // the child's biased input from the persistent prev matrix.
            let staged = stage_biased(
                arena,
                prev,
                child.slice.offset,
                child.slice.count,
                self.input_staging.sub(0, batch * (child.slice.count + 1)),
            );
            let want_child = want_prev && !child.layer.stops_backprop();
            let flag = child.layer.bprop(
                staged,
                self.grad_staging[0],
                self.grad_staging[1],
                want_child,
                arena,
            );
            if want_child {
                let result = match flag {
                    GradFlow::InPrev => self.grad_staging[1],
                    GradFlow::InCurr => self.grad_staging[0],
                };
                let (src, dst) = arena.read_write(
                    result.sub(0, batch * child.slice.count),
                    dl_da_prev,
                );
                add_block(
                    &mut dst[child.slice.offset..],
                    self.fan_in,
                    src,
                    child.slice.count,
                    batch,
                    child.slice.count,
                );
            }
        }
        GradFlow::InPrev
    }

    fn pre_training_fprop(&mut self) {
        for child in &mut self.children {
            child.layer.pre_training_fprop();
        }
    }

    fn deinit(&mut self) {
        for child in &mut self.children {
            child.layer.deinit();
        }
        self.acts = Activations::default();
        self.input_staging = ArenaRange::EMPTY;
        self.grad_staging = [ArenaRange::EMPTY; 2];
    }

    fn stops_backprop(&self) -> bool {
        self.children.iter().all(|c| c.layer.stops_backprop())
    }

    fn loss_addendum(&self) -> f32 {
        self.children.iter().map(|c| c.layer.loss_addendum()).sum()
    }

    fn export_state(&self, out: &mut Checkpoint) {
        for child in &self.children {
            child.layer.export_state(out);
        }
    }

    fn import_state(&mut self, ckpt: &Checkpoint) -> NetResult<()> {
        for child in &mut self.children {
            child.layer.import_state(ckpt)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::IdentityLayer;

    fn slices(parts: &[(usize, usize)]) -> Vec<(InputSlice, Box<dyn Layer>)> {
        parts
            .iter()
            .map(|&(offset, count)| {
                (
                    InputSlice { offset, count },
                    Box::new(IdentityLayer::new()) as Box<dyn Layer>,
                )
            })
            .collect()
    }

    #[test]
    fn test_gap_in_coverage_rejected() {
        let mut pack = HorizontalPack::new(slices(&[(0, 2), (3, 2)]));
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        let err = pack.wire(&mut cursor, 5).unwrap_err();
        assert!(matches!(
            err,
            NetError::SliceCoverage { layer_index: 1, expected: 5, covered: 4 }
        ));
    }

    #[test]
    fn test_overlap_rejected() {
        let mut pack = HorizontalPack::new(slices(&[(0, 3), (2, 3)]));
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        assert!(matches!(
            pack.wire(&mut cursor, 5).unwrap_err(),
            NetError::SliceCoverage { .. }
        ));
    }

    #[test]
    fn test_exact_tiling_accepted_in_any_order() {
        let mut pack = HorizontalPack::new(slices(&[(3, 2), (0, 3)]));
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        pack.wire(&mut cursor, 5).unwrap();
        assert_eq!(pack.neurons(), 5);
    }

    fn build(parts: &[(usize, usize)], fan_in: usize) -> (HorizontalPack, Arena, Activations) {
        let mut pack = HorizontalPack::new(slices(parts));
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        pack.wire(&mut cursor, fan_in).unwrap();
        let ctx = TrainContext { seed: 9 };
        let report = pack.plan(BatchPair::new(2, 2).unwrap(), &ctx).unwrap();

        let input_elems = 2 * (fan_in + 1);
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
        pack.assign_memory(&mut carver, scratch).unwrap();
        pack.set_batch_size(2, &mut arena);
        let prev = Activations {
            range: ArenaRange { offset: 0, len: input_elems },
            neurons: fan_in,
            has_bias: true,
            batch: 2,
        };
        (pack, arena, prev)
    }

    #[test]
    fn test_forward_concatenates_children() {
        let (mut pack, mut arena, prev) = build(&[(0, 2), (2, 1)], 3);
        arena
            .slice_mut(prev.range)
            .copy_from_slice(&[1.0, 2.0, 3.0, 1.0, 4.0, 5.0, 6.0, 1.0]);
        pack.fprop(prev, &mut arena, Pass::Eval);
        let out = pack.activations();
        assert_eq!(
            arena.slice(out.range),
            &[1.0, 2.0, 3.0, 1.0, 4.0, 5.0, 6.0, 1.0]
        );
    }

    #[test]
    fn test_backward_accumulates_into_slices() {
        let (mut pack, mut arena, prev) = build(&[(0, 2), (2, 1)], 3);
        arena
            .slice_mut(prev.range)
            .copy_from_slice(&[1.0, 2.0, 3.0, 1.0, 4.0, 5.0, 6.0, 1.0]);
        pack.fprop(prev, &mut arena, Pass::Train);

        let env = 2 * 3;
        let base = arena.capacity() - 2 * env;
        let g0 = ArenaRange { offset: base, len: env };
        let g1 = ArenaRange { offset: base + env, len: env };
        arena
            .slice_mut(g0)
            .copy_from_slice(&[10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);
        // Poison the other buffer: identity children must not leak it.
        arena.slice_mut(g1).iter_mut().for_each(|v| *v = -1.0);

        let flag = pack.bprop(prev, g0, g1, true, &mut arena);
        assert_eq!(flag, GradFlow::InPrev);
        // Identity children: incoming gradient equals outgoing, column by
        // column.
        assert_eq!(
            arena.slice(g1),
            &[10.0, 20.0, 30.0, 40.0, 50.0, 60.0]
        );
    }

    #[test]
    fn test_scratch_is_staging_plus_max_child() {
        let mut pack = HorizontalPack::new(slices(&[(0, 3), (3, 2)]));
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        pack.wire(&mut cursor, 5).unwrap();
        let ctx = TrainContext { seed: 9 };
        let report = pack.plan(BatchPair::new(2, 2).unwrap(), &ctx).unwrap();
        // Staging: 2 * (3 + 1); gradient staging: two buffers of the max
        // child envelope 2 * 3. Children themselves need none.
        assert_eq!(report.eval_scratch, 8);
        assert_eq!(report.train_scratch, 8 + 2 * 6);
    }
}
