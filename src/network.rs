//! The network driver.
//!
//! Owns the input layer and the ordered stack above it, and walks the
//! whole lifecycle: `init` (wire + plan, returning the arena size the
//! caller must provide), `assign_memory`, `set_batch_size`, then repeated
//! `forward`/`backward` or `train_step` sweeps, and finally `deinit`.
//! Errors out of `init` carry the failing layer's index and the error
//! kind; once a session is up, sweeps do not fail under normal operation.
//!
//! The arena is laid out in three regions: persistent activations at the
//! front, the shared scratch region, and the two ping-pong gradient
//! buffers at the tail. `backward` seeds the first buffer with the output
//! layer's loss gradient and threads both buffers down the stack, swapping
//! its notion of the live buffer on every [`GradFlow::InPrev`] flag.

use crate::arena::{Arena, ArenaRange, Carver, MemoryRequirement};
use crate::checkpoint::Checkpoint;
use crate::error::{AllocSite, NetError, NetResult};
use crate::layers::{
    BatchPair, GradFlow, InputLayer, Layer, Pass, TopologyCursor, TrainContext,
};
use crate::matrix::{l2_norm, scale};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Planned,
    Ready,
}

pub struct Network {
    input: InputLayer,
    layers: Vec<Box<dyn Layer>>,
    seed: u64,
    grad_clip: Option<f32>,
    state: SessionState,
    arena: Arena,
    batch_pair: Option<BatchPair>,
    requirement: Option<MemoryRequirement>,
    persistent_total: usize,
    scratch_total: usize,
    envelope: usize,
    grad_buffers: [ArenaRange; 2],
    batch: usize,
    last_grad_norm: f32,
}

impl Network {
    pub fn new(input_neurons: usize) -> Self {
        Self {
            input: InputLayer::new(input_neurons),
            layers: Vec::new(),
            seed: 0,
            grad_clip: None,
            state: SessionState::Idle,
            arena: Arena::default(),
            batch_pair: None,
            requirement: None,
            persistent_total: 0,
            scratch_total: 0,
            envelope: 0,
            grad_buffers: [ArenaRange::EMPTY; 2],
            batch: 0,
            last_grad_norm: 0.0,
        }
    }

    /// Seed for weight initialization and dropout streams.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.set_seed(seed);
        self
    }

    /// Clip the output-layer loss gradient to this global L2 norm.
    pub fn with_grad_clip(mut self, threshold: f32) -> Self {
        self.set_grad_clip(threshold);
        self
    }

    /// In-place variant of [`Network::with_seed`]. Takes effect at the
    /// next `init`.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    /// In-place variant of [`Network::with_grad_clip`].
    pub fn set_grad_clip(&mut self, threshold: f32) {
        self.grad_clip = Some(threshold);
    }

    pub fn push(&mut self, layer: Box<dyn Layer>) -> &mut Self {
        self.layers.push(layer);
        self
    }

    pub fn output_neurons(&self) -> usize {
        self.layers.last().map_or(0, |l| l.neurons())
    }

    /// Wire and plan the whole graph for one session. Returns the arena
    /// requirement the caller must satisfy before `assign_memory`.
    pub fn init(&mut self, train_batch: usize, eval_batch: usize) -> NetResult<MemoryRequirement> {
        let pair = BatchPair::new(eval_batch, train_batch)?;
        if self.layers.is_empty() {
            return Err(NetError::NoOutputLayer);
        }

        // Phase A: indices and shapes.
        let mut cursor = TopologyCursor::new();
        self.input.wire(&mut cursor, 0)?;
        let mut fan_in = self.input.neurons();
        for layer in &mut self.layers {
            layer.wire(&mut cursor, fan_in)?;
            fan_in = layer.neurons();
        }

        // Phase B: sizing, with symmetric teardown on failure.
        let ctx = TrainContext { seed: self.seed };
        let input_report = self.input.plan(pair, &ctx)?;
        let mut incoming = input_report.out_batch;
        let mut persistent = input_report.persistent;
        let mut eval_scratch = 0;
        let mut train_scratch = 0;
        let mut envelope = 0;
        let mut params = 0;
        for (done, layer) in self.layers.iter_mut().enumerate() {
            let report = match layer.plan(incoming, &ctx) {
                Ok(report) => report,
                Err(err) => {
                    self.input.deinit();
                    for l in self.layers[..done].iter_mut() {
                        l.deinit();
                    }
                    return Err(err);
                }
            };
            incoming = report.out_batch;
            persistent += report.persistent;
            eval_scratch = eval_scratch.max(report.eval_scratch);
            train_scratch = train_scratch.max(report.train_scratch);
            envelope = envelope.max(report.grad_envelope);
            params += report.params;
        }

        self.persistent_total = persistent;
        self.scratch_total = train_scratch;
        self.envelope = envelope;
        self.batch_pair = Some(pair);
        let requirement = MemoryRequirement {
            eval_elements: persistent + eval_scratch,
            train_elements: persistent + train_scratch + 2 * envelope,
            parameters: params,
        };
        self.requirement = Some(requirement);
        self.state = SessionState::Planned;
        Ok(requirement)
    }

    /// Hand the session its backing storage and run the assignment pass.
    pub fn assign_memory(&mut self, buffer: Vec<f32>) -> NetResult<()> {
        let required = match (self.state, self.requirement) {
            (SessionState::Planned, Some(req)) => req.train_elements,
            _ => return Err(NetError::NotReady),
        };
        if buffer.len() < required {
            return Err(NetError::BufferTooSmall {
                required,
                provided: buffer.len(),
            });
        }
        self.arena = Arena::new(buffer);

        let mut persistent = Carver::new(
            ArenaRange {
                offset: 0,
                len: self.persistent_total,
            },
            AllocSite::Activations,
        );
        let scratch = ArenaRange {
            offset: self.persistent_total,
            len: self.scratch_total,
        };
        let mut tail = Carver::new(
            ArenaRange {
                offset: self.persistent_total + self.scratch_total,
                len: 2 * self.envelope,
            },
            AllocSite::GradientBuffers,
        );
        self.grad_buffers = [tail.carve(self.envelope)?, tail.carve(self.envelope)?];

        self.input.assign_memory(&mut persistent, scratch)?;
        for layer in &mut self.layers {
            layer.assign_memory(&mut persistent, scratch)?;
        }
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Switch the working batch size. Returns the output layer's batch.
    pub fn set_batch_size(&mut self, batch: usize) -> NetResult<usize> {
        if self.state != SessionState::Ready {
            return Err(NetError::NotReady);
        }
        let pair = self.batch_pair.ok_or(NetError::NotReady)?;
        if batch == 0 || batch > pair.eval {
            return Err(NetError::BatchTooLarge {
                requested: batch,
                max: pair.eval,
            });
        }
        let mut b = self.input.set_batch_size(batch, &mut self.arena);
        for layer in &mut self.layers {
            b = layer.set_batch_size(b, &mut self.arena);
        }
        self.batch = batch;
        Ok(b)
    }

    /// One forward sweep over a packed `[batch, input_neurons]` matrix.
    pub fn forward(&mut self, input: &[f32], pass: Pass) -> NetResult<()> {
        if self.state != SessionState::Ready || self.batch == 0 {
            return Err(NetError::NotReady);
        }
        let pair = self.batch_pair.ok_or(NetError::NotReady)?;
        if pass == Pass::Train && self.batch > pair.train {
            return Err(NetError::BatchTooLarge {
                requested: self.batch,
                max: pair.train,
            });
        }
        self.input.load(input, &mut self.arena);
        let mut below = self.input.activations();
        for layer in &mut self.layers {
            layer.fprop(below, &mut self.arena, pass);
            below = layer.activations();
        }
        Ok(())
    }

    /// One backward sweep from packed `[batch, output_neurons]` labels.
    /// Returns the scalar loss (data term plus regularizer addenda),
    /// summed over the batch.
    pub fn backward(&mut self, labels: &[f32]) -> NetResult<f32> {
        if self.state != SessionState::Ready || self.batch == 0 {
            return Err(NetError::NotReady);
        }
        // The gradient buffers are sized for the training batch, so an
        // eval-sized sweep must not reach them.
        let pair = self.batch_pair.ok_or(NetError::NotReady)?;
        if self.batch > pair.train {
            return Err(NetError::BatchTooLarge {
                requested: self.batch,
                max: pair.train,
            });
        }
        let [g0, g1] = self.grad_buffers;
        let top = self.layers.len() - 1;
        let mut loss = self.layers[top].loss_gradient(labels, g0, &mut self.arena)?;
        loss += self.layers.iter().map(|l| l.loss_addendum()).sum::<f32>();

        let live = self.batch * self.layers[top].neurons();
        let grad = &mut self.arena.slice_mut(g0)[..live];
        let norm = l2_norm(grad);
        self.last_grad_norm = norm;
        if let Some(clip) = self.grad_clip {
            if norm > clip {
                scale(grad, clip / norm);
            }
        }

        let mut cur = g0;
        let mut other = g1;
        for i in (0..self.layers.len()).rev() {
            let below = if i == 0 {
                self.input.activations()
            } else {
                self.layers[i - 1].activations()
            };
            let stops = self.layers[i].stops_backprop();
            let want = i > 0 && !stops;
            let flag = self.layers[i].bprop(below, cur, other, want, &mut self.arena);
            if flag == GradFlow::InPrev {
                std::mem::swap(&mut cur, &mut other);
            }
            if stops {
                break;
            }
        }
        Ok(loss)
    }

    /// L2 norm of the output-layer loss gradient from the most recent
    /// `backward`, measured before any clipping.
    pub fn last_grad_norm(&self) -> f32 {
        self.last_grad_norm
    }

    /// Nesterov look-ahead hooks, forward, backward.
    pub fn train_step(&mut self, input: &[f32], labels: &[f32]) -> NetResult<f32> {
        for layer in &mut self.layers {
            layer.pre_training_fprop();
        }
        self.forward(input, Pass::Train)?;
        self.backward(labels)
    }

    /// Copy the output layer's activations into a packed
    /// `[batch, output_neurons]` slice.
    pub fn output_into(&self, dst: &mut [f32]) {
        if let Some(top) = self.layers.last() {
            let acts = top.activations();
            let stride = acts.stride();
            let data = self.arena.slice(acts.range);
            for r in 0..acts.batch {
                dst[r * acts.neurons..(r + 1) * acts.neurons]
                    .copy_from_slice(&data[r * stride..r * stride + acts.neurons]);
            }
        }
    }

    /// Tear the session down. Weights survive; everything else resets.
    pub fn deinit(&mut self) {
        self.input.deinit();
        for layer in &mut self.layers {
            layer.deinit();
        }
        self.arena.release();
        self.grad_buffers = [ArenaRange::EMPTY; 2];
        self.batch = 0;
        self.last_grad_norm = 0.0;
        self.batch_pair = None;
        self.requirement = None;
        self.state = SessionState::Idle;
    }

    /// Collect every layer's persistent state. Call between sessions or
    /// between sweeps, never during one.
    pub fn export_checkpoint(&self) -> Checkpoint {
        let mut ckpt = Checkpoint::new();
        for layer in &self.layers {
            layer.export_state(&mut ckpt);
        }
        ckpt
    }

    /// Restore layer state from a checkpoint. Requires a wired topology so
    /// shapes can be validated.
    pub fn import_checkpoint(&mut self, ckpt: &Checkpoint) -> NetResult<()> {
        for layer in &mut self.layers {
            layer.import_state(ckpt)?;
        }
        Ok(())
    }
}
