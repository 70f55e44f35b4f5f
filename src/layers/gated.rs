//! Gate-masked parallel pack.
//!
//! One dedicated gate child produces a per-sample signal that masks the
//! outputs of the other children. The gate child always runs first in the
//! forward order; its output is optionally binarized against a threshold,
//! then broadcast-multiplied over each gated child's output columns. The
//! gate produces either one column (shared by every gated child) or one
//! column per gated child.
//!
//! The same mask is applied to the outgoing gradient before the gated
//! children's backward passes, so a sample whose gate is closed
//! contributes exactly zero to both activations and weight gradients. The
//! gate child itself is forward-only: a binarized gate has zero derivative
//! almost everywhere, so no gradient flows into it and its input slice
//! receives none.
//!
//! Structurally this works like a Horizontal pack: the gate and gated
//! children's input slices together must tile the incoming range exactly.

use crate::arena::{Arena, ArenaRange, Carver};
use crate::checkpoint::Checkpoint;
use crate::error::{AllocSite, NetError, NetResult};
use crate::layers::horizontal::InputSlice;
use crate::layers::{
    slice_grad_columns, stage_biased, Activations, BatchPair, GradFlow, Layer, Pass, PlanReport,
    TopologyCursor, TrainContext,
};
use crate::matrix::{add_block, copy_block, zero_block};

struct Child {
    layer: Box<dyn Layer>,
    slice: InputSlice,
    col_off: usize,
}

pub struct GatedPack {
    index: usize,
    fan_in: usize,
    neurons: usize,
    gate: Child,
    children: Vec<Child>,
    /// Binarization threshold for the gate signal; `None` trusts the gate
    /// child to produce already-binary values.
    threshold: Option<f32>,
    acts: Activations,
    input_staging: ArenaRange,
    grad_staging: [ArenaRange; 2],
    max_slice: usize,
    child_envelope: usize,
    max_batch: usize,
    train_batch: usize,
}

impl GatedPack {
    pub fn new(
        gate: (InputSlice, Box<dyn Layer>),
        children: Vec<(InputSlice, Box<dyn Layer>)>,
        threshold: Option<f32>,
    ) -> Self {
        Self {
            index: 0,
            fan_in: 0,
            neurons: 0,
            gate: Child {
                layer: gate.1,
                slice: gate.0,
                col_off: 0,
            },
            children: children
                .into_iter()
                .map(|(slice, layer)| Child {
                    layer,
                    slice,
                    col_off: 0,
                })
                .collect(),
            threshold,
            acts: Activations::default(),
            input_staging: ArenaRange::EMPTY,
            grad_staging: [ArenaRange::EMPTY; 2],
            max_slice: 0,
            child_envelope: 0,
            max_batch: 0,
            train_batch: 0,
        }
    }

    fn check_coverage(&self, fan_in: usize) -> NetResult<()> {
        let mut slices: Vec<InputSlice> =
            self.children.iter().map(|c| c.slice).collect();
        slices.push(self.gate.slice);
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

    fn gate_factor(&self, raw: f32) -> f32 {
        match self.threshold {
            Some(t) => {
                if raw >= t {
                    1.0
                } else {
                    0.0
                }
            }
            None => raw,
        }
    }

    /// Gate column feeding gated child `j`.
    fn gate_column(&self, j: usize) -> usize {
        if self.gate.layer.neurons() == 1 {
            0
        } else {
            j
        }
    }

    /// Multiply `cols` columns at `col_off` of a strided block by the
    /// per-sample gate factor.
    fn mask_block(
        &self,
        arena: &mut Arena,
        target: ArenaRange,
        target_stride: usize,
        col_off: usize,
        cols: usize,
        gate_col: usize,
        batch: usize,
    ) {
        let gate_acts = self.gate.layer.activations();
        let gate_stride = gate_acts.stride();
        let (gate_data, data) = arena.read_write(gate_acts.range, target);
        for r in 0..batch {
            let factor = self.gate_factor(gate_data[r * gate_stride + gate_col]);
            for v in data[r * target_stride + col_off..r * target_stride + col_off + cols]
                .iter_mut()
            {
                *v *= factor;
            }
        }
    }
}

impl Layer for GatedPack {
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
        self.max_slice = self
            .children
            .iter()
            .map(|c| c.slice.count)
            .chain(std::iter::once(self.gate.slice.count))
            .max()
            .unwrap_or(0);
        // Gate first: it also runs first in every forward pass.
        self.gate.layer.wire(cursor, self.gate.slice.count)?;
        let mut col_off = 0;
        for child in &mut self.children {
            child.layer.wire(cursor, child.slice.count)?;
            child.col_off = col_off;
            col_off += child.layer.neurons();
        }
        self.neurons = col_off;
        let gate_outputs = self.gate.layer.neurons();
        if gate_outputs != 1 && gate_outputs != self.children.len() {
            return Err(NetError::GateWidth {
                layer_index: self.index,
                gate_outputs,
                children: self.children.len(),
            });
        }
        Ok(())
    }

    fn plan(&mut self, batch: BatchPair, ctx: &TrainContext) -> NetResult<PlanReport> {
        let gate_report = self.gate.layer.plan(batch, ctx)?;
        let mut out_batch: Option<BatchPair> = None;
        let mut persistent = gate_report.persistent;
        let mut child_eval = gate_report.eval_scratch;
        let mut child_train = gate_report.train_scratch;
        let mut child_env = 0;
        let mut params = gate_report.params;
        for (done, child) in self.children.iter_mut().enumerate() {
            let report = match child.layer.plan(batch, ctx) {
                Ok(report) => report,
                Err(err) => {
                    self.gate.layer.deinit();
                    for c in self.children[..done].iter_mut() {
                        c.layer.deinit();
                    }
                    return Err(err);
                }
            };
            match out_batch {
                None => out_batch = Some(report.out_batch),
                Some(expected) if expected != report.out_batch => {
                    self.gate.layer.deinit();
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
        self.gate.layer.assign_memory(persistent, remainder)?;
        for child in &mut self.children {
            child.layer.assign_memory(persistent, remainder)?;
        }
        Ok(())
    }

    fn set_batch_size(&mut self, batch: usize, arena: &mut Arena) -> usize {
        self.gate.layer.set_batch_size(batch, arena);
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

        // Gate strictly first; the mask reads its persistent activations.
        let gate_staged = stage_biased(
            arena,
            prev,
            self.gate.slice.offset,
            self.gate.slice.count,
            self.input_staging
                .sub(0, batch * (self.gate.slice.count + 1)),
        );
        self.gate.layer.fprop(gate_staged, arena, pass);

        for j in 0..self.children.len() {
            let (slice, col_off, cols) = {
                let c = &self.children[j];
                (c.slice, c.col_off, c.layer.neurons())
            };
            let staged = stage_biased(
                arena,
                prev,
                slice.offset,
                slice.count,
                self.input_staging.sub(0, batch * (slice.count + 1)),
            );
            self.children[j].layer.fprop(staged, arena, pass);
            let out = self.children[j].layer.activations();
            let (src, dst) = arena.read_write(out.range, self.acts.range);
            copy_block(&mut dst[col_off..], own_stride, src, out.stride(), batch, cols);
            self.mask_block(
                arena,
                self.acts.range,
                own_stride,
                col_off,
                cols,
                self.gate_column(j),
                batch,
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
            // The gate child's input slice stays zero: no gradient ever
            // flows into a binarized gate.
            zero_block(
                arena.slice_mut(dl_da_prev),
                self.fan_in,
                batch,
                self.fan_in,
            );
        }
        for j in 0..self.children.len() {
            let (slice, col_off, cols) = {
                let c = &self.children[j];
                (c.slice, c.col_off, c.layer.neurons())
            };
            let child_dl = self.grad_staging[0].sub(0, batch * cols);
            slice_grad_columns(arena, dl_da, self.neurons, col_off, cols, batch, child_dl);
            // Masking the gradient symmetrically to the forward output
            // guarantees closed samples contribute zero weight gradient.
            self.mask_block(
                arena,
                child_dl,
                cols,
                0,
                cols,
                self.gate_column(j),
                batch,
            );
            let staged = stage_biased(
                arena,
                prev,
                slice.offset,
                slice.count,
                self.input_staging.sub(0, batch * (slice.count + 1)),
            );
            let want_child = want_prev && !self.children[j].layer.stops_backprop();
            let flag = self.children[j].layer.bprop(
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
                let (src, dst) =
                    arena.read_write(result.sub(0, batch * slice.count), dl_da_prev);
                add_block(
                    &mut dst[slice.offset..],
                    self.fan_in,
                    src,
                    slice.count,
                    batch,
                    slice.count,
                );
            }
        }
        GradFlow::InPrev
    }

    fn pre_training_fprop(&mut self) {
        self.gate.layer.pre_training_fprop();
        for child in &mut self.children {
            child.layer.pre_training_fprop();
        }
    }

    fn deinit(&mut self) {
        self.gate.layer.deinit();
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
        self.gate.layer.loss_addendum()
            + self.children.iter().map(|c| c.layer.loss_addendum()).sum::<f32>()
    }

    fn export_state(&self, out: &mut Checkpoint) {
        self.gate.layer.export_state(out);
        for child in &self.children {
            child.layer.export_state(out);
        }
    }

    fn import_state(&mut self, ckpt: &Checkpoint) -> NetResult<()> {
        self.gate.layer.import_state(ckpt)?;
        for child in &mut self.children {
            child.layer.import_state(ckpt)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;
    use crate::layers::{DenseLayer, IdentityLayer};
    use crate::matrix::Matrix;
    use crate::optimizer::OptimizerConfig;

    fn identity_slice(offset: usize, count: usize) -> (InputSlice, Box<dyn Layer>) {
        (
            InputSlice { offset, count },
            Box::new(IdentityLayer::new()) as Box<dyn Layer>,
        )
    }

    #[test]
    fn test_gate_width_mismatch_rejected() {
        // Gate produces 2 columns for 3 gated children.
        let mut pack = GatedPack::new(
            identity_slice(0, 2),
            vec![
                identity_slice(2, 1),
                identity_slice(3, 1),
                identity_slice(4, 1),
            ],
            Some(0.5),
        );
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        let err = pack.wire(&mut cursor, 5).unwrap_err();
        assert!(matches!(
            err,
            NetError::GateWidth { gate_outputs: 2, children: 3, .. }
        ));
    }

    fn build(threshold: Option<f32>) -> (GatedPack, Arena, Activations) {
        // fan_in 3: gate reads [0,1), one gated identity child reads [1,3).
        let mut pack = GatedPack::new(
            identity_slice(0, 1),
            vec![identity_slice(1, 2)],
            threshold,
        );
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        pack.wire(&mut cursor, 3).unwrap();
        let ctx = TrainContext { seed: 21 };
        let report = pack.plan(BatchPair::new(2, 2).unwrap(), &ctx).unwrap();

        let input_elems = 2 * 4;
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
            neurons: 3,
            has_bias: true,
            batch: 2,
        };
        (pack, arena, prev)
    }

    #[test]
    fn test_closed_gate_zeroes_forward_row() {
        let (mut pack, mut arena, prev) = build(Some(0.5));
        // Sample 0: gate 0.0 (closed). Sample 1: gate 0.9 (open).
        arena
            .slice_mut(prev.range)
            .copy_from_slice(&[0.0, 5.0, 6.0, 1.0, 0.9, 7.0, 8.0, 1.0]);
        pack.fprop(prev, &mut arena, Pass::Train);
        let out = pack.activations();
        assert_eq!(out.neurons, 2);
        let data = arena.slice(out.range);
        assert_eq!(&data[0..2], &[0.0, 0.0]);
        assert_eq!(&data[3..5], &[7.0, 8.0]);
    }

    #[test]
    fn test_closed_gate_blocks_gradient_and_gate_gets_none() {
        let (mut pack, mut arena, prev) = build(Some(0.5));
        arena
            .slice_mut(prev.range)
            .copy_from_slice(&[0.0, 5.0, 6.0, 1.0, 0.9, 7.0, 8.0, 1.0]);
        pack.fprop(prev, &mut arena, Pass::Train);

        let env = 2 * 3;
        let base = arena.capacity() - 2 * env;
        let g0 = ArenaRange { offset: base, len: env };
        let g1 = ArenaRange { offset: base + env, len: env };
        // Gradient [batch, 2] lives packed at the front of g0.
        arena.slice_mut(g0)[..4].copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);

        let flag = pack.bprop(prev, g0, g1, true, &mut arena);
        assert_eq!(flag, GradFlow::InPrev);
        let prev_grad = arena.slice(g1);
        // Row 0 (closed): nothing reaches the gated slice. Gate column 0
        // gets nothing in either row.
        assert_eq!(&prev_grad[0..3], &[0.0, 0.0, 0.0]);
        assert_eq!(&prev_grad[3..6], &[0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_all_closed_gate_leaves_weights_untouched() {
        // A learnable gated child behind an always-closed gate must see a
        // zero weight gradient on every step.
        let dense: Box<dyn Layer> = Box::new(DenseLayer::new(
            2,
            Activation::Identity,
            OptimizerConfig {
                learning_rate: 0.5,
                ..OptimizerConfig::default()
            },
        ));
        let mut pack = GatedPack::new(
            identity_slice(0, 1),
            vec![(InputSlice { offset: 1, count: 2 }, dense)],
            Some(0.5),
        );
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        pack.wire(&mut cursor, 3).unwrap();
        let ctx = TrainContext { seed: 21 };
        let report = pack.plan(BatchPair::new(1, 1).unwrap(), &ctx).unwrap();

        let input_elems = 4;
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
        pack.set_batch_size(1, &mut arena);
        let prev = Activations {
            range: ArenaRange { offset: 0, len: 4 },
            neurons: 3,
            has_bias: true,
            batch: 1,
        };
        arena.slice_mut(prev.range).copy_from_slice(&[0.0, 5.0, 6.0, 1.0]);
        pack.fprop(prev, &mut arena, Pass::Train);

        let weights_before: Matrix = {
            let mut ckpt = Checkpoint::new();
            pack.export_state(&mut ckpt);
            ckpt.get("layer3.weights", (2, 3)).unwrap()
        };

        let env = report.grad_envelope;
        let base = arena.capacity() - 2 * env;
        let g0 = ArenaRange { offset: base, len: env };
        let g1 = ArenaRange { offset: base + env, len: env };
        arena.slice_mut(g0)[..2].copy_from_slice(&[1.0, -1.0]);
        pack.bprop(prev, g0, g1, true, &mut arena);

        let mut ckpt = Checkpoint::new();
        pack.export_state(&mut ckpt);
        let weights_after = ckpt.get("layer3.weights", (2, 3)).unwrap();
        assert_eq!(weights_before, weights_after);
    }
}
