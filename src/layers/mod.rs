//! The layer contract.
//!
//! Every unit of computation in a network — primitive or pack — implements
//! [`Layer`]. The lifecycle is strict:
//!
//! 1. `wire`: topology discovery. Assigns the layer index (strictly
//!    increasing from the input at 0) and fixes the incoming neuron count.
//!    Packs recurse and validate child slice coverage here. No memory yet.
//! 2. `plan`: sizing. Given the session's batch-size pair, the layer
//!    reports its outgoing batch pair, persistent element count, scratch
//!    peaks for eval and train passes, gradient-buffer envelope, and
//!    learnable parameter count. Packs sum persistent storage and
//!    parameters but take the max of children's scratch and envelopes:
//!    sibling calls are sequential, never concurrent, so scratch is reused.
//! 3. `assign_memory`: carve ranges out of the arena in the same order the
//!    sizes were declared, then hand the scratch remainder to children.
//! 4. `set_batch_size` / `fprop` / `bprop` repeat for the session.
//! 5. `deinit`: symmetric teardown; ranges are forgotten, owned session
//!    state (optimizer accumulators) is dropped, weights survive.
//!
//! ## Gradient buffer alternation
//!
//! The backward sweep threads two shared buffers through the chain.
//! `bprop` receives the live gradient in `dl_da` and a free buffer in
//! `dl_da_prev`, and returns where the incoming gradient ended up:
//! [`GradFlow::InPrev`] if it was written into `dl_da_prev`, or
//! [`GradFlow::InCurr`] if the layer left it in `dl_da` (pass-through
//! layers, and packs whose children alternated an even number of times).
//! A caller chaining several `bprop` calls must swap its notion of "live"
//! buffer on every `InPrev` and keep it on every `InCurr`; the flag a pack
//! returns is exactly the XOR of its children's flags.

pub mod dense;
pub mod gated;
pub mod horizontal;
pub mod identity;
pub mod input;
pub mod penalty;
pub mod tile;
pub mod vertical;

pub use dense::DenseLayer;
pub use gated::GatedPack;
pub use horizontal::{HorizontalPack, InputSlice};
pub use identity::IdentityLayer;
pub use input::InputLayer;
pub use penalty::{Penalty, PenaltyWrapper};
pub use tile::TilePack;
pub use vertical::VerticalPack;

use crate::arena::{Arena, ArenaRange, Carver};
use crate::checkpoint::Checkpoint;
use crate::error::{NetError, NetResult};
use crate::matrix::copy_block;

/// Which kind of sweep is running. Dropout and penalty hooks only fire
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Eval,
    Train,
}

/// Where the true incoming gradient landed after a `bprop` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradFlow {
    /// The result is in the buffer the caller passed as `dl_da_prev`.
    InPrev,
    /// The layer alternated internally an even number of times; the result
    /// is in the buffer the caller passed as `dl_da`.
    InCurr,
}

impl GradFlow {
    /// Combine two alternation flags. `InPrev` toggles, `InCurr` does not.
    pub fn xor(self, other: GradFlow) -> GradFlow {
        if (self == GradFlow::InPrev) != (other == GradFlow::InPrev) {
            GradFlow::InPrev
        } else {
            GradFlow::InCurr
        }
    }
}

/// Maximum eval and train batch sizes for one session. Eval is the larger
/// of the two; every persistent activation buffer is sized for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPair {
    pub eval: usize,
    pub train: usize,
}

impl BatchPair {
    pub fn new(eval: usize, train: usize) -> NetResult<Self> {
        if eval == 0 || train == 0 || eval < train {
            return Err(NetError::InvalidBatch { eval, train });
        }
        Ok(Self { eval, train })
    }

    /// Scale both sizes, as a Tile pack does for its replicated child.
    pub fn scaled(&self, factor: usize) -> Self {
        Self {
            eval: self.eval * factor,
            train: self.train * factor,
        }
    }
}

/// What a layer reports back from the sizing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanReport {
    /// Batch pair seen by whatever consumes this layer's output.
    pub out_batch: BatchPair,
    /// Arena elements that stay live for the whole session (activations,
    /// dropout masks). Summed across children.
    pub persistent: usize,
    /// Peak scratch elements during an inference pass. Maxed across
    /// children, plus the pack's own staging overhead.
    pub eval_scratch: usize,
    /// Peak scratch elements during a training pass.
    pub train_scratch: usize,
    /// Elements either ping-pong gradient buffer must hold for this
    /// subtree. Maxed across children.
    pub grad_envelope: usize,
    /// Learnable parameters. Summed across children.
    pub params: usize,
}

/// Running index assignment during the wiring phase.
#[derive(Debug, Default)]
pub struct TopologyCursor {
    next_index: usize,
}

impl TopologyCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self) -> usize {
        let idx = self.next_index;
        self.next_index += 1;
        idx
    }

    pub fn count(&self) -> usize {
        self.next_index
    }
}

/// Session-wide context handed to every layer during planning.
#[derive(Debug, Clone, Copy)]
pub struct TrainContext {
    /// Base seed; layers derive their own streams from it and their index.
    pub seed: u64,
}

/// Metadata view of a layer's activation matrix inside the arena.
///
/// Shape is `[batch, neurons (+1 bias column)]`, row-major, with the
/// storage sized for the session's eval batch. The bias column, when
/// present, is pinned to 1.0 by `set_batch_size` and never written by
/// forward or backward code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Activations {
    pub range: ArenaRange,
    pub neurons: usize,
    pub has_bias: bool,
    pub batch: usize,
}

impl Activations {
    pub fn stride(&self) -> usize {
        self.neurons + usize::from(self.has_bias)
    }

    /// Elements of storage for `max_batch` rows.
    pub fn storage(neurons: usize, has_bias: bool, max_batch: usize) -> usize {
        (neurons + usize::from(has_bias)) * max_batch
    }

    /// Write 1.0 into the bias column for the current batch.
    pub fn pin_bias(&self, arena: &mut Arena) {
        if !self.has_bias {
            return;
        }
        let stride = self.stride();
        let data = arena.slice_mut(self.range);
        for r in 0..self.batch {
            data[r * stride + self.neurons] = 1.0;
        }
    }
}

/// Copy `cols` columns starting at `col_off` out of `src` into `dst`,
/// appending a pinned bias column. This is how packs give a child a
/// properly-biased view of an input slice: one explicit copy instead of
/// borrowing a neighbor's column.
pub fn stage_biased(
    arena: &mut Arena,
    src: Activations,
    col_off: usize,
    cols: usize,
    dst: ArenaRange,
) -> Activations {
    let batch = src.batch;
    let staged = Activations {
        range: dst,
        neurons: cols,
        has_bias: true,
        batch,
    };
    let (src_data, dst_data) = arena.read_write(src.range, dst);
    let src_stride = src.stride();
    let dst_stride = cols + 1;
    for r in 0..batch {
        let s = &src_data[r * src_stride + col_off..r * src_stride + col_off + cols];
        let d = &mut dst_data[r * dst_stride..r * dst_stride + cols];
        d.copy_from_slice(s);
        dst_data[r * dst_stride + cols] = 1.0;
    }
    staged
}

/// Copy a packed `[batch, cols]` block out of a gradient buffer starting
/// at column `col_off` of a `[batch, total]` matrix.
pub fn slice_grad_columns(
    arena: &mut Arena,
    src: ArenaRange,
    total: usize,
    col_off: usize,
    cols: usize,
    batch: usize,
    dst: ArenaRange,
) {
    let (src_data, dst_data) = arena.read_write(src, dst);
    copy_block(dst_data, cols, &src_data[col_off..], total, batch, cols);
}

/// The unit of computation. See the module docs for the lifecycle.
pub trait Layer {
    /// Index assigned during wiring; 0 is reserved for the input layer.
    fn layer_index(&self) -> usize;

    /// Outgoing neuron count (excluding the bias column).
    fn neurons(&self) -> usize;

    /// Metadata for this layer's (or its topmost child's) output matrix.
    fn activations(&self) -> Activations;

    /// Phase A: assign indices and fix the incoming neuron count.
    fn wire(&mut self, cursor: &mut TopologyCursor, fan_in: usize) -> NetResult<()>;

    /// Phase B: size everything for the session's batch pair.
    fn plan(&mut self, batch: BatchPair, ctx: &TrainContext) -> NetResult<PlanReport>;

    /// Carve arena ranges in the order declared by `plan`.
    fn assign_memory(&mut self, persistent: &mut Carver, scratch: ArenaRange) -> NetResult<()>;

    /// Switch the current batch size (≤ the planned maximum) and re-pin
    /// bias columns. Returns the outgoing batch size.
    fn set_batch_size(&mut self, batch: usize, arena: &mut Arena) -> usize;

    /// Compute this layer's activations from the previous layer's.
    fn fprop(&mut self, prev: Activations, arena: &mut Arena, pass: Pass);

    /// Consume the loss gradient in `dl_da` (packed `[batch, neurons]`),
    /// update weights, and produce the incoming gradient. When `want_prev`
    /// is false the layer sits directly above the input (or below a chain
    /// that stops backprop) and must skip the incoming-gradient product.
    fn bprop(
        &mut self,
        prev: Activations,
        dl_da: ArenaRange,
        dl_da_prev: ArenaRange,
        want_prev: bool,
        arena: &mut Arena,
    ) -> GradFlow;

    /// Hook invoked before each training forward pass (Nesterov momentum
    /// applies its velocity look-ahead here).
    fn pre_training_fprop(&mut self) {}

    /// Symmetric teardown: forget ranges, drop session state, keep weights.
    fn deinit(&mut self) {}

    /// A layer below this one never receives gradients.
    fn stops_backprop(&self) -> bool {
        false
    }

    /// Output layers have no bias column and can turn labels into a loss
    /// gradient.
    fn is_output(&self) -> bool {
        false
    }

    /// Regularizer loss accumulated during the most recent training fprop.
    fn loss_addendum(&self) -> f32 {
        0.0
    }

    /// For the output layer: write the loss gradient w.r.t. pre-activations
    /// into `grad` and return the scalar loss.
    fn loss_gradient(
        &mut self,
        _labels: &[f32],
        _grad: ArenaRange,
        _arena: &mut Arena,
    ) -> NetResult<f32> {
        Err(NetError::NoOutputLayer)
    }

    /// Persist name-tagged state (weights, optimizer accumulators). Only
    /// called between sessions.
    fn export_state(&self, _out: &mut Checkpoint) {}

    /// Restore name-tagged state. Only called between sessions.
    fn import_state(&mut self, _ckpt: &Checkpoint) -> NetResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grad_flow_xor() {
        use GradFlow::{InCurr, InPrev};
        assert_eq!(InPrev.xor(InPrev), InCurr);
        assert_eq!(InPrev.xor(InCurr), InPrev);
        assert_eq!(InCurr.xor(InPrev), InPrev);
        assert_eq!(InCurr.xor(InCurr), InCurr);
    }

    #[test]
    fn test_batch_pair_rejects_eval_below_train() {
        assert!(BatchPair::new(4, 8).is_err());
        assert!(BatchPair::new(0, 0).is_err());
        let pair = BatchPair::new(8, 4).unwrap();
        assert_eq!(pair.scaled(3), BatchPair { eval: 24, train: 12 });
    }

    #[test]
    fn test_stage_biased_copies_slice_and_pins_bias() {
        // Source: [2, 4+1] with bias, values 10*r + c.
        let mut data = vec![0.0; 10 + 2 * 5];
        for r in 0..2 {
            for c in 0..4 {
                data[10 + r * 5 + c] = (10 * r + c) as f32;
            }
            data[10 + r * 5 + 4] = 1.0;
        }
        let mut arena = Arena::new(data);
        let src = Activations {
            range: ArenaRange { offset: 10, len: 10 },
            neurons: 4,
            has_bias: true,
            batch: 2,
        };
        let dst = ArenaRange { offset: 0, len: 6 };
        let staged = stage_biased(&mut arena, src, 1, 2, dst);
        assert_eq!(staged.stride(), 3);
        assert_eq!(arena.slice(dst), &[1.0, 2.0, 1.0, 11.0, 12.0, 1.0]);
    }

    #[test]
    fn test_slice_grad_columns_packs_tightly() {
        // Gradient buffer [2, 3] at offset 0, extract columns 1..3.
        let mut arena = Arena::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0, 0.0, 0.0]);
        let src = ArenaRange { offset: 0, len: 6 };
        let dst = ArenaRange { offset: 6, len: 4 };
        slice_grad_columns(&mut arena, src, 3, 1, 2, 2, dst);
        assert_eq!(arena.slice(dst), &[2.0, 3.0, 5.0, 6.0]);
    }
}
