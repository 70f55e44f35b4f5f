//! One child layer replicated over K equal input groups.
//!
//! The child is instantiated once and owns a single weight set; the pack
//! makes it process all K groups in one call by folding the group axis
//! into the batch axis. The incoming `[batch, K·t]` matrix is rolled into
//! a staged `[K·batch, t+1]` matrix (group k of sample s becomes row
//! `k·batch + s`), the child runs once at K times the batch size, and the
//! child's `[K·batch, a]` output is unrolled back into `[batch, K·a]`.
//! Roll and unroll are exact transpositions of each other:
//! `unroll(roll(x)) == x`.
//!
//! Weight sharing falls out for free: the child's weight gradient already
//! sums over its batch axis, which here includes every tile.

use crate::arena::{Arena, ArenaRange, Carver};
use crate::checkpoint::Checkpoint;
use crate::error::{AllocSite, NetError, NetResult};
use crate::layers::{
    Activations, BatchPair, GradFlow, Layer, Pass, PlanReport, TopologyCursor, TrainContext,
};

pub struct TilePack {
    index: usize,
    tiles: usize,
    fan_in: usize,
    /// Incoming neurons per tile.
    tile_in: usize,
    neurons: usize,
    child: Box<dyn Layer>,
    acts: Activations,
    input_staging: ArenaRange,
    grad_staging: [ArenaRange; 2],
    child_envelope: usize,
    max_batch: usize,
}

impl TilePack {
    pub fn new(tiles: usize, child: Box<dyn Layer>) -> Self {
        assert!(tiles > 0, "a tile pack needs at least one tile");
        Self {
            index: 0,
            tiles,
            fan_in: 0,
            tile_in: 0,
            neurons: 0,
            child,
            acts: Activations::default(),
            input_staging: ArenaRange::EMPTY,
            grad_staging: [ArenaRange::EMPTY; 2],
            child_envelope: 0,
            max_batch: 0,
        }
    }

    /// Roll `[batch, K·w]` groups into `[K·batch, w (+bias)]` rows.
    fn roll(
        &self,
        arena: &mut Arena,
        src: ArenaRange,
        src_stride: usize,
        width: usize,
        batch: usize,
        dst: ArenaRange,
        with_bias: bool,
    ) {
        let dst_stride = width + usize::from(with_bias);
        let (s, d) = arena.read_write(src, dst);
        for k in 0..self.tiles {
            for r in 0..batch {
                let src_row = &s[r * src_stride + k * width..r * src_stride + (k + 1) * width];
                let dst_off = (k * batch + r) * dst_stride;
                d[dst_off..dst_off + width].copy_from_slice(src_row);
                if with_bias {
                    d[dst_off + width] = 1.0;
                }
            }
        }
    }

    /// Inverse transform: `[K·batch, w]` rows back into `[batch, K·w]`.
    fn unroll(
        &self,
        arena: &mut Arena,
        src: ArenaRange,
        src_stride: usize,
        width: usize,
        batch: usize,
        dst: ArenaRange,
        dst_stride: usize,
    ) {
        let (s, d) = arena.read_write(src, dst);
        for k in 0..self.tiles {
            for r in 0..batch {
                let src_off = (k * batch + r) * src_stride;
                let src_row = &s[src_off..src_off + width];
                d[r * dst_stride + k * width..r * dst_stride + (k + 1) * width]
                    .copy_from_slice(src_row);
            }
        }
    }
}

impl Layer for TilePack {
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
        if fan_in % self.tiles != 0 {
            return Err(NetError::TileMismatch {
                layer_index: self.index,
                fan_in,
                tiles: self.tiles,
            });
        }
        self.fan_in = fan_in;
        self.tile_in = fan_in / self.tiles;
        self.child.wire(cursor, self.tile_in)?;
        self.neurons = self.tiles * self.child.neurons();
        Ok(())
    }

    fn plan(&mut self, batch: BatchPair, ctx: &TrainContext) -> NetResult<PlanReport> {
        // The child sees the group axis folded into its batch axis.
        let report = self.child.plan(batch.scaled(self.tiles), ctx)?;
        self.max_batch = batch.eval;
        self.child_envelope = report.grad_envelope;
        let staging = self.tiles * batch.eval * (self.tile_in + 1);
        let own_persistent = Activations::storage(self.neurons, true, batch.eval);
        Ok(PlanReport {
            out_batch: batch,
            persistent: report.persistent + own_persistent,
            eval_scratch: staging + report.eval_scratch,
            train_scratch: staging + 2 * report.grad_envelope + report.train_scratch,
            grad_envelope: report
                .grad_envelope
                .max(batch.train * self.neurons)
                .max(batch.train * self.fan_in),
            params: report.params,
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
        self.input_staging =
            carver.carve(self.tiles * self.max_batch * (self.tile_in + 1))?;
        self.grad_staging[0] = carver.carve(self.child_envelope)?;
        self.grad_staging[1] = carver.carve(self.child_envelope)?;
        self.child.assign_memory(persistent, carver.remainder())
    }

    fn set_batch_size(&mut self, batch: usize, arena: &mut Arena) -> usize {
        self.child.set_batch_size(batch * self.tiles, arena);
        self.acts.batch = batch;
        self.acts.pin_bias(arena);
        batch
    }

    fn fprop(&mut self, prev: Activations, arena: &mut Arena, pass: Pass) {
        let batch = self.acts.batch;
        let staged_len = self.tiles * batch * (self.tile_in + 1);
        let staging = self.input_staging.sub(0, staged_len);
        self.roll(
            arena,
            prev.range,
            prev.stride(),
            self.tile_in,
            batch,
            staging,
            true,
        );
        let staged = Activations {
            range: staging,
            neurons: self.tile_in,
            has_bias: true,
            batch: self.tiles * batch,
        };
        self.child.fprop(staged, arena, pass);
        let out = self.child.activations();
        self.unroll(
            arena,
            out.range,
            out.stride(),
            self.child.neurons(),
            batch,
            self.acts.range,
            self.acts.stride(),
        );
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
        let a = self.child.neurons();

        // Fold the group axis of the outgoing gradient into the batch
        // axis, mirroring the forward roll.
        let child_dl = self.grad_staging[0].sub(0, self.tiles * batch * a);
        self.roll(arena, dl_da, self.neurons, a, batch, child_dl, false);

        // Forward staging is long gone; rebuild the rolled input from the
        // persistent prev matrix.
        let staged_len = self.tiles * batch * (self.tile_in + 1);
        let staging = self.input_staging.sub(0, staged_len);
        self.roll(
            arena,
            prev.range,
            prev.stride(),
            self.tile_in,
            batch,
            staging,
            true,
        );
        let staged = Activations {
            range: staging,
            neurons: self.tile_in,
            has_bias: true,
            batch: self.tiles * batch,
        };

        let want_child = want_prev && !self.child.stops_backprop();
        let flag = self.child.bprop(
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
            self.unroll(
                arena,
                result.sub(0, self.tiles * batch * self.tile_in),
                self.tile_in,
                self.tile_in,
                batch,
                dl_da_prev,
                self.fan_in,
            );
        }
        GradFlow::InPrev
    }

    fn pre_training_fprop(&mut self) {
        self.child.pre_training_fprop();
    }

    fn deinit(&mut self) {
        self.child.deinit();
        self.acts = Activations::default();
        self.input_staging = ArenaRange::EMPTY;
        self.grad_staging = [ArenaRange::EMPTY; 2];
    }

    fn stops_backprop(&self) -> bool {
        self.child.stops_backprop()
    }

    fn loss_addendum(&self) -> f32 {
        self.child.loss_addendum()
    }

    fn export_state(&self, out: &mut Checkpoint) {
        self.child.export_state(out);
    }

    fn import_state(&mut self, ckpt: &Checkpoint) -> NetResult<()> {
        self.child.import_state(ckpt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::IdentityLayer;

    #[test]
    fn test_indivisible_fan_in_rejected() {
        let mut pack = TilePack::new(3, Box::new(IdentityLayer::new()));
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        let err = pack.wire(&mut cursor, 7).unwrap_err();
        assert!(matches!(
            err,
            NetError::TileMismatch { layer_index: 1, fan_in: 7, tiles: 3 }
        ));
    }

    fn build(tiles: usize, fan_in: usize, batch: usize) -> (TilePack, Arena, Activations) {
        let mut pack = TilePack::new(tiles, Box::new(IdentityLayer::new()));
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        pack.wire(&mut cursor, fan_in).unwrap();
        let ctx = TrainContext { seed: 13 };
        let report = pack
            .plan(BatchPair::new(batch, batch).unwrap(), &ctx)
            .unwrap();

        let input_elems = batch * (fan_in + 1);
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
        pack.set_batch_size(batch, &mut arena);
        let prev = Activations {
            range: ArenaRange { offset: 0, len: input_elems },
            neurons: fan_in,
            has_bias: true,
            batch,
        };
        (pack, arena, prev)
    }

    #[test]
    fn test_roll_then_unroll_is_identity() {
        // With an identity child (a == t), forward is exactly
        // unroll(roll(x)) and must reproduce the input for K = 3.
        let (mut pack, mut arena, prev) = build(3, 6, 2);
        let input: Vec<f32> = (0..14).map(|i| i as f32).collect();
        arena.slice_mut(prev.range).copy_from_slice(&input);
        // Re-pin the bias column the fill just overwrote.
        prev.pin_bias(&mut arena);
        pack.fprop(prev, &mut arena, Pass::Eval);

        let out = pack.activations();
        assert_eq!(out.neurons, 6);
        let out_data = arena.slice(out.range);
        let in_data = arena.slice(prev.range);
        for r in 0..2 {
            assert_eq!(out_data[r * 7..r * 7 + 6], in_data[r * 7..r * 7 + 6]);
        }
    }

    #[test]
    fn test_backward_unrolls_gradient() {
        let (mut pack, mut arena, prev) = build(2, 4, 1);
        arena
            .slice_mut(prev.range)
            .copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 1.0]);
        pack.fprop(prev, &mut arena, Pass::Train);

        let env = 4;
        let base = arena.capacity() - 2 * env;
        let g0 = ArenaRange { offset: base, len: env };
        let g1 = ArenaRange { offset: base + env, len: env };
        arena.slice_mut(g0).copy_from_slice(&[10.0, 20.0, 30.0, 40.0]);

        let flag = pack.bprop(prev, g0, g1, true, &mut arena);
        assert_eq!(flag, GradFlow::InPrev);
        // Identity child: the gradient survives the roll/unroll round trip.
        assert_eq!(arena.slice(g1), &[10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_child_sees_scaled_batch() {
        let mut pack = TilePack::new(3, Box::new(IdentityLayer::new()));
        let mut cursor = TopologyCursor::new();
        cursor.assign();
        pack.wire(&mut cursor, 6).unwrap();
        let ctx = TrainContext { seed: 13 };
        let report = pack.plan(BatchPair::new(4, 2).unwrap(), &ctx).unwrap();
        // Pack-level batch is unchanged.
        assert_eq!(report.out_batch, BatchPair { eval: 4, train: 2 });
        // Child persistent storage is sized for 3 * 4 rows of (2 + 1).
        let child_persistent = 12 * 3;
        let own = 4 * 7;
        assert_eq!(report.persistent, child_persistent + own);
    }
}
