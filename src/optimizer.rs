//! The gradient optimizer.
//!
//! One optimizer instance sits behind each learnable layer and turns that
//! layer's raw weight gradient into an in-place weight update. The update
//! pipeline runs in a fixed order:
//!
//! 1. Learning-rate dropout: randomly zero a fraction of the gradient
//!    entries for this step.
//! 2. Weight regularization: L1 (sign-scaled) and L2 (linear-scaled)
//!    contributions are added directly into the gradient, each with its own
//!    ignore-bias-column toggle.
//! 3. Update rule: the gradient is rewritten into a step direction —
//!    constant scaling, RMS-normalized variants, sign-only, or the
//!    first/second-moment family (Adam with or without bias correction,
//!    Nadam with Nesterov-style lookahead on the first moment).
//! 4. Per-weight adaptive gain: the step is scaled up when its sign agrees
//!    with a reference (the previous step, or the momentum velocity) and
//!    down when it disagrees, clamped to a configured band.
//! 5. Momentum: classical velocity, or Nesterov look-ahead split across
//!    [`GradientOptimizer::pre_training_fprop`] (applied before the forward
//!    pass that produces the *next* gradient) and a symmetric undo inside
//!    `apply_grad`. The two halves must stay paired or the momentum
//!    direction is wrong.
//! 6. Max-norm: each weight row's L2 norm is clamped to a cap.
//!
//! ## First step
//!
//! Every EMA-based rule seeds its accumulator from the first gradient
//! instead of blending against zero (for bias-corrected rules the
//! correction factor performs the same seeding arithmetically). Without
//! this the first update would divide by a near-zero RMS estimate and jump
//! wildly.
//!
//! ## Lifecycle
//!
//! Accumulators are sized like the weight matrix, allocated by `init`
//! (lazily, only for the features the configuration enables), and dropped
//! by `deinit`. Weights are owned by the layer and persist; accumulator
//! state is bound to one training session.

use rayon::prelude::*;

use crate::checkpoint::Checkpoint;
use crate::error::NetResult;
use crate::matrix::{clamp_row_norms, Matrix};
use crate::rng::SeedRng;

const EPSILON: f32 = 1e-8;

/// How the gradient becomes a step direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateRule {
    /// Plain scaled gradient.
    Constant,
    /// Divide by the root of an EMA of squared gradients.
    RmsProp { decay: f32 },
    /// Like `RmsProp`, but a second EMA dampens the denominator itself,
    /// smoothing out sudden swings in the RMS estimate.
    SmoothedRmsProp { decay: f32, smoothing: f32 },
    /// Sign-only step.
    Sign,
    /// First/second-moment estimates, optionally bias-corrected.
    Adam {
        beta1: f32,
        beta2: f32,
        bias_correction: bool,
    },
    /// Adam with a Nesterov-style lookahead blended into the first moment.
    Nadam { beta1: f32, beta2: f32 },
}

/// Momentum applied after the rule produces a step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Momentum {
    None,
    /// `v = μv + step; w -= v`.
    Classical { coefficient: f32 },
    /// Look-ahead variant: `w -= μv` before the next forward pass, undone
    /// and replayed through the velocity inside `apply_grad`.
    Nesterov { coefficient: f32 },
}

/// One weight-decay term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decay {
    pub scale: f32,
    /// Whether the bias column participates. Off by default.
    pub include_bias: bool,
}

impl Decay {
    pub fn new(scale: f32) -> Self {
        Self {
            scale,
            include_bias: false,
        }
    }
}

/// Per-weight adaptive gain configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainConfig {
    /// Added to the gain on sign agreement.
    pub up: f32,
    /// Multiplied into the gain on sign disagreement.
    pub down: f32,
    pub low: f32,
    pub high: f32,
    /// Compare against the momentum velocity instead of the previous step.
    /// Falls back to the previous step when momentum is off.
    pub against_velocity: bool,
}

/// Row max-norm clamp applied after the weight update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaxNorm {
    pub cap: f32,
    pub include_bias: bool,
}

/// Full optimizer configuration. Explicit named fields; an impossible
/// combination is unrepresentable.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    pub learning_rate: f32,
    pub rule: UpdateRule,
    pub momentum: Momentum,
    pub l1: Option<Decay>,
    pub l2: Option<Decay>,
    pub gain: Option<GainConfig>,
    /// Keep probability for learning-rate dropout.
    pub lr_dropout: Option<f32>,
    pub max_norm: Option<MaxNorm>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            rule: UpdateRule::Constant,
            momentum: Momentum::None,
            l1: None,
            l2: None,
            gain: None,
            lr_dropout: None,
            max_norm: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptState {
    Uninitialized,
    FirstStepPending,
    Steady,
}

/// Per-layer optimizer state machine.
pub struct GradientOptimizer {
    config: OptimizerConfig,
    state: OptState,
    step: u32,
    rows: usize,
    cols: usize,
    velocity: Option<Matrix>,
    moment1: Option<Matrix>,
    moment2: Option<Matrix>,
    smooth: Option<Matrix>,
    gain: Option<Matrix>,
    prev_step: Option<Matrix>,
    lookahead_applied: bool,
    rng: SeedRng,
}

impl GradientOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            state: OptState::Uninitialized,
            step: 0,
            rows: 0,
            cols: 0,
            velocity: None,
            moment1: None,
            moment2: None,
            smooth: None,
            gain: None,
            prev_step: None,
            lookahead_applied: false,
            rng: SeedRng::new(0),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Allocate accumulators for a `[rows, cols]` weight matrix and enter
    /// the first-step-pending state. Only the accumulators the enabled
    /// features need are created.
    pub fn init(&mut self, rows: usize, cols: usize, seed: u64) {
        self.rows = rows;
        self.cols = cols;
        self.step = 0;
        self.rng = SeedRng::new(seed);
        if !matches!(self.config.momentum, Momentum::None) {
            self.velocity = Some(Matrix::zeros(rows, cols));
        }
        match self.config.rule {
            UpdateRule::RmsProp { .. } => {
                self.moment2 = Some(Matrix::zeros(rows, cols));
            }
            UpdateRule::SmoothedRmsProp { .. } => {
                self.moment2 = Some(Matrix::zeros(rows, cols));
                self.smooth = Some(Matrix::zeros(rows, cols));
            }
            UpdateRule::Adam { .. } | UpdateRule::Nadam { .. } => {
                self.moment1 = Some(Matrix::zeros(rows, cols));
                self.moment2 = Some(Matrix::zeros(rows, cols));
            }
            UpdateRule::Constant | UpdateRule::Sign => {}
        }
        if let Some(gc) = self.config.gain {
            let mut g = Matrix::zeros(rows, cols);
            g.fill(1.0);
            self.gain = Some(g);
            // Without momentum there is no velocity to compare against;
            // the previous step stands in as the sign reference.
            if !gc.against_velocity || matches!(self.config.momentum, Momentum::None) {
                self.prev_step = Some(Matrix::zeros(rows, cols));
            }
        }
        self.lookahead_applied = false;
        self.state = OptState::FirstStepPending;
    }

    /// Drop all session state. Weights are untouched (the layer owns them).
    pub fn deinit(&mut self) {
        self.velocity = None;
        self.moment1 = None;
        self.moment2 = None;
        self.smooth = None;
        self.gain = None;
        self.prev_step = None;
        self.lookahead_applied = false;
        self.state = OptState::Uninitialized;
        self.step = 0;
    }

    /// Session parameter count for the accumulators this configuration
    /// allocates (reported to the planner, lives outside the arena).
    pub fn accumulator_count(&self, rows: usize, cols: usize) -> usize {
        let numel = rows * cols;
        let mut count = 0;
        if !matches!(self.config.momentum, Momentum::None) {
            count += numel;
        }
        count += match self.config.rule {
            UpdateRule::RmsProp { .. } => numel,
            UpdateRule::SmoothedRmsProp { .. } => 2 * numel,
            UpdateRule::Adam { .. } | UpdateRule::Nadam { .. } => 2 * numel,
            UpdateRule::Constant | UpdateRule::Sign => 0,
        };
        if let Some(gc) = self.config.gain {
            count += numel;
            if !gc.against_velocity || matches!(self.config.momentum, Momentum::None) {
                count += numel;
            }
        }
        count
    }

    /// Nesterov look-ahead: shift weights by the momentum velocity before
    /// the forward pass that produces the next gradient. A no-op for every
    /// other momentum mode.
    pub fn pre_training_fprop(&mut self, weights: &mut Matrix) {
        if self.state == OptState::Uninitialized {
            return;
        }
        if let Momentum::Nesterov { coefficient } = self.config.momentum {
            if let Some(v) = &self.velocity {
                for (w, &vv) in weights.as_mut_slice().iter_mut().zip(v.as_slice()) {
                    *w -= coefficient * vv;
                }
                self.lookahead_applied = true;
            }
        }
    }

    /// Regularizer loss contribution for the current weights, matching the
    /// gradient terms `apply_grad` adds.
    pub fn loss_addendum(&self, weights: &Matrix) -> f32 {
        let mut loss = 0.0;
        let cols = weights.cols();
        if let Some(l1) = self.config.l1 {
            let limit = if l1.include_bias { cols } else { cols - 1 };
            for r in 0..weights.rows() {
                loss += l1.scale * weights.row(r)[..limit].iter().map(|w| w.abs()).sum::<f32>();
            }
        }
        if let Some(l2) = self.config.l2 {
            let limit = if l2.include_bias { cols } else { cols - 1 };
            for r in 0..weights.rows() {
                loss +=
                    l2.scale * 0.5 * weights.row(r)[..limit].iter().map(|w| w * w).sum::<f32>();
            }
        }
        loss
    }

    /// One optimizer step. `grad` is consumed as scratch: on return it
    /// holds the final step direction, not the raw gradient.
    pub fn apply_grad(&mut self, weights: &mut Matrix, grad: &mut Matrix) {
        debug_assert_eq!(weights.shape(), grad.shape());
        debug_assert_ne!(self.state, OptState::Uninitialized, "apply_grad before init");
        let first = self.state == OptState::FirstStepPending;
        self.step += 1;

        self.drop_gradient_entries(grad);
        self.add_regularizers(weights, grad);
        self.rule_step(grad, first);
        self.apply_gain(grad);
        self.apply_momentum(weights, grad);
        if let Some(mn) = self.config.max_norm {
            let active = if mn.include_bias {
                self.cols
            } else {
                self.cols - 1
            };
            clamp_row_norms(weights, active, mn.cap);
        }
        self.state = OptState::Steady;
    }

    fn drop_gradient_entries(&mut self, grad: &mut Matrix) {
        if let Some(keep) = self.config.lr_dropout {
            for g in grad.as_mut_slice().iter_mut() {
                if !self.rng.chance(keep) {
                    *g = 0.0;
                }
            }
        }
    }

    fn add_regularizers(&mut self, weights: &Matrix, grad: &mut Matrix) {
        let cols = self.cols;
        if let Some(l1) = self.config.l1 {
            let limit = if l1.include_bias { cols } else { cols - 1 };
            for r in 0..self.rows {
                let w = weights.row(r);
                let g = grad.row_mut(r);
                for c in 0..limit {
                    g[c] += l1.scale * if w[c] > 0.0 { 1.0 } else if w[c] < 0.0 { -1.0 } else { 0.0 };
                }
            }
        }
        if let Some(l2) = self.config.l2 {
            let limit = if l2.include_bias { cols } else { cols - 1 };
            for r in 0..self.rows {
                let w = weights.row(r);
                let g = grad.row_mut(r);
                for c in 0..limit {
                    g[c] += l2.scale * w[c];
                }
            }
        }
    }

    /// Rewrite the gradient into a learning-rate-scaled step direction.
    fn rule_step(&mut self, grad: &mut Matrix, first: bool) {
        let lr = self.config.learning_rate;
        match self.config.rule {
            UpdateRule::Constant => {
                grad.as_mut_slice().par_iter_mut().for_each(|g| *g *= lr);
            }
            UpdateRule::Sign => {
                grad.as_mut_slice().par_iter_mut().for_each(|g| {
                    *g = if *g > 0.0 {
                        lr
                    } else if *g < 0.0 {
                        -lr
                    } else {
                        0.0
                    };
                });
            }
            UpdateRule::RmsProp { decay } => {
                if let Some(ms) = self.moment2.as_mut() {
                    grad.as_mut_slice()
                        .par_iter_mut()
                        .zip(ms.as_mut_slice().par_iter_mut())
                        .for_each(|(g, m)| {
                            *m = if first {
                                *g * *g
                            } else {
                                decay * *m + (1.0 - decay) * *g * *g
                            };
                            *g = lr * *g / (*m + EPSILON).sqrt();
                        });
                }
            }
            UpdateRule::SmoothedRmsProp { decay, smoothing } => {
                if let (Some(ms), Some(sm)) = (self.moment2.as_mut(), self.smooth.as_mut()) {
                    grad.as_mut_slice()
                        .par_iter_mut()
                        .zip(ms.as_mut_slice().par_iter_mut())
                        .zip(sm.as_mut_slice().par_iter_mut())
                        .for_each(|((g, m), s)| {
                            *m = if first {
                                *g * *g
                            } else {
                                decay * *m + (1.0 - decay) * *g * *g
                            };
                            let denom = (*m + EPSILON).sqrt();
                            *s = if first {
                                denom
                            } else {
                                smoothing * *s + (1.0 - smoothing) * denom
                            };
                            *g = lr * *g / (*s + EPSILON);
                        });
                }
            }
            UpdateRule::Adam {
                beta1,
                beta2,
                bias_correction,
            } => {
                if let (Some(m1), Some(m2)) = (self.moment1.as_mut(), self.moment2.as_mut()) {
                    // With bias correction the zero-initialized EMA plus the
                    // 1/(1-β^t) factor reproduces first-gradient seeding at
                    // t = 1 exactly; without it the seed is explicit.
                    let c1 = if bias_correction {
                        1.0 / (1.0 - beta1.powi(self.step as i32))
                    } else {
                        1.0
                    };
                    let c2 = if bias_correction {
                        1.0 / (1.0 - beta2.powi(self.step as i32))
                    } else {
                        1.0
                    };
                    let seed = first && !bias_correction;
                    grad.as_mut_slice()
                        .par_iter_mut()
                        .zip(m1.as_mut_slice().par_iter_mut())
                        .zip(m2.as_mut_slice().par_iter_mut())
                        .for_each(|((g, m), v)| {
                            if seed {
                                *m = *g;
                                *v = *g * *g;
                            } else {
                                *m = beta1 * *m + (1.0 - beta1) * *g;
                                *v = beta2 * *v + (1.0 - beta2) * *g * *g;
                            }
                            *g = lr * (*m * c1) / ((*v * c2).sqrt() + EPSILON);
                        });
                }
            }
            UpdateRule::Nadam { beta1, beta2 } => {
                if let (Some(m1), Some(m2)) = (self.moment1.as_mut(), self.moment2.as_mut()) {
                    let t = self.step as i32;
                    let c1 = 1.0 / (1.0 - beta1.powi(t + 1));
                    let cg = 1.0 / (1.0 - beta1.powi(t));
                    let c2 = 1.0 / (1.0 - beta2.powi(t));
                    grad.as_mut_slice()
                        .par_iter_mut()
                        .zip(m1.as_mut_slice().par_iter_mut())
                        .zip(m2.as_mut_slice().par_iter_mut())
                        .for_each(|((g, m), v)| {
                            *m = beta1 * *m + (1.0 - beta1) * *g;
                            *v = beta2 * *v + (1.0 - beta2) * *g * *g;
                            let lookahead = beta1 * *m * c1 + (1.0 - beta1) * *g * cg;
                            *g = lr * lookahead / ((*v * c2).sqrt() + EPSILON);
                        });
                }
            }
        }
    }

    fn apply_gain(&mut self, step: &mut Matrix) {
        let Some(gc) = self.config.gain else {
            return;
        };
        let Self {
            gain,
            velocity,
            prev_step,
            ..
        } = self;
        let Some(gains) = gain.as_mut() else {
            return;
        };
        let reference: Option<&[f32]> = match (gc.against_velocity, velocity.as_ref()) {
            (true, Some(v)) => Some(v.as_slice()),
            _ => prev_step.as_ref().map(|p| p.as_slice()),
        };
        if let Some(reference) = reference {
            for ((s, gain), &r) in step
                .as_mut_slice()
                .iter_mut()
                .zip(gains.as_mut_slice().iter_mut())
                .zip(reference.iter())
            {
                if r != 0.0 && *s != 0.0 {
                    if (r > 0.0) == (*s > 0.0) {
                        *gain += gc.up;
                    } else {
                        *gain *= gc.down;
                    }
                    *gain = gain.clamp(gc.low, gc.high);
                }
                *s *= *gain;
            }
        }
        if let Some(prev) = prev_step.as_mut() {
            prev.as_mut_slice().copy_from_slice(step.as_slice());
        }
    }

    fn apply_momentum(&mut self, weights: &mut Matrix, step: &Matrix) {
        match self.config.momentum {
            Momentum::None => {
                weights
                    .as_mut_slice()
                    .par_iter_mut()
                    .zip(step.as_slice().par_iter())
                    .for_each(|(w, &d)| *w -= d);
            }
            Momentum::Classical { coefficient } => {
                if let Some(v) = self.velocity.as_mut() {
                    weights
                        .as_mut_slice()
                        .par_iter_mut()
                        .zip(v.as_mut_slice().par_iter_mut())
                        .zip(step.as_slice().par_iter())
                        .for_each(|((w, vv), &d)| {
                            *vv = coefficient * *vv + d;
                            *w -= *vv;
                        });
                }
            }
            Momentum::Nesterov { coefficient } => {
                if let Some(v) = self.velocity.as_mut() {
                    // Undo the look-ahead shift taken before this step's
                    // forward pass, then step with the refreshed velocity.
                    let undo = self.lookahead_applied;
                    weights
                        .as_mut_slice()
                        .par_iter_mut()
                        .zip(v.as_mut_slice().par_iter_mut())
                        .zip(step.as_slice().par_iter())
                        .for_each(|((w, vv), &d)| {
                            if undo {
                                *w += coefficient * *vv;
                            }
                            *vv = coefficient * *vv + d;
                            *w -= *vv;
                        });
                    self.lookahead_applied = false;
                }
            }
        }
    }

    /// Persist accumulator state under `prefix`. Only meaningful between
    /// sweeps; the driver never calls it mid-sweep.
    pub fn export_state(&self, prefix: &str, out: &mut Checkpoint) {
        let entries: [(&str, &Option<Matrix>); 5] = [
            ("velocity", &self.velocity),
            ("moment1", &self.moment1),
            ("moment2", &self.moment2),
            ("smooth", &self.smooth),
            ("gain", &self.gain),
        ];
        for (name, slot) in entries {
            if let Some(m) = slot {
                out.insert(&format!("{}.opt.{}", prefix, name), m.clone());
            }
        }
    }

    /// Restore whichever accumulators the checkpoint carries. Missing
    /// entries keep their freshly-initialized values.
    pub fn import_state(&mut self, prefix: &str, ckpt: &Checkpoint) -> NetResult<()> {
        let slots: [(&str, &mut Option<Matrix>); 5] = [
            ("velocity", &mut self.velocity),
            ("moment1", &mut self.moment1),
            ("moment2", &mut self.moment2),
            ("smooth", &mut self.smooth),
            ("gain", &mut self.gain),
        ];
        for (name, slot) in slots {
            if slot.is_some() {
                let tag = format!("{}.opt.{}", prefix, name);
                if let Some(m) = ckpt.try_get(&tag, (self.rows, self.cols))? {
                    *slot = Some(m);
                    self.state = OptState::Steady;
                }
            }
        }
        Ok(())
    }
}
