//! Training Loop and Utilities
//!
//! This module glues a [`Network`] to a dataset: a mini-batch loader over
//! packed feature vectors, hyperparameter presets, a CSV/console logger,
//! and the epoch loop itself.
//!
//! ## How Batches Are Formed
//!
//! The loader holds the whole dataset as two packed row-major matrices
//! (inputs `[samples, input_width]`, targets `[samples, target_width]`).
//! Each epoch it shuffles a row-index permutation and deals fixed-size
//! batches from it:
//!
//! ```text
//! Samples: 0 1 2 3 4 5 6 7     batch_size: 3
//! Epoch order (shuffled): [5, 2, 7, 0, 4, 1, 6, 3]
//!
//! Batch 1: rows 5, 2, 7
//! Batch 2: rows 0, 4, 1
//! (rows 6, 3 are dropped; a partial batch would change the summed-loss
//!  scale between steps)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use strata::{Network, Trainer, TrainingConfig, VectorDataLoader};
//! # let mut network = Network::new(2);
//! let inputs = vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
//! let targets = vec![0.0, 1.0, 1.0, 0.0];
//! let loader = VectorDataLoader::new(inputs, 2, targets, 1, 4);
//!
//! let mut trainer = Trainer::new(network, TrainingConfig::tiny());
//! let final_loss = trainer.run(loader, None)?;
//! # Ok::<(), strata::NetError>(())
//! ```

use std::fs::File;
use std::io::Write as IoWrite;
use std::path::Path;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::NetResult;
use crate::layers::Pass;
use crate::network::Network;

/// Mini-batch loader over packed feature vectors.
///
/// Owns the dataset and a per-epoch shuffle order. `next_batch` gathers
/// the next `batch_size` rows into internal staging buffers, so the
/// network always sees contiguous `[batch, width]` slices regardless of
/// the shuffle.
pub struct VectorDataLoader {
    inputs: Vec<f32>,
    targets: Vec<f32>,
    input_width: usize,
    target_width: usize,
    batch_size: usize,
    order: Vec<usize>,
    position: usize,
    batch_inputs: Vec<f32>,
    batch_targets: Vec<f32>,
}

impl VectorDataLoader {
    /// Create a loader over packed row-major inputs and targets.
    ///
    /// # Panics
    ///
    /// Panics if the input and target matrices disagree on sample count
    /// or a width is zero.
    pub fn new(
        inputs: Vec<f32>,
        input_width: usize,
        targets: Vec<f32>,
        target_width: usize,
        batch_size: usize,
    ) -> Self {
        assert!(input_width > 0 && target_width > 0 && batch_size > 0);
        assert_eq!(inputs.len() % input_width, 0, "ragged input matrix");
        let samples = inputs.len() / input_width;
        assert_eq!(targets.len(), samples * target_width, "sample count mismatch");

        Self {
            inputs,
            targets,
            input_width,
            target_width,
            batch_size,
            order: (0..samples).collect(),
            position: 0,
            batch_inputs: vec![0.0; batch_size * input_width],
            batch_targets: vec![0.0; batch_size * target_width],
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn samples(&self) -> usize {
        self.order.len()
    }

    /// Full batches per epoch. Trailing rows that don't fill a batch are
    /// skipped.
    pub fn num_batches(&self) -> usize {
        self.samples() / self.batch_size
    }

    /// Start a new epoch with a fresh shuffle.
    pub fn start_epoch(&mut self, rng: &mut StdRng) {
        self.order.shuffle(rng);
        self.position = 0;
    }

    /// Gather the next batch, or `None` when the epoch is exhausted.
    ///
    /// Returns packed `[batch_size, input_width]` and
    /// `[batch_size, target_width]` slices.
    pub fn next_batch(&mut self) -> Option<(&[f32], &[f32])> {
        if self.position + self.batch_size > self.order.len() {
            return None;
        }
        for (slot, &row) in self.order[self.position..self.position + self.batch_size]
            .iter()
            .enumerate()
        {
            self.batch_inputs[slot * self.input_width..(slot + 1) * self.input_width]
                .copy_from_slice(&self.inputs[row * self.input_width..(row + 1) * self.input_width]);
            self.batch_targets[slot * self.target_width..(slot + 1) * self.target_width]
                .copy_from_slice(
                    &self.targets[row * self.target_width..(row + 1) * self.target_width],
                );
        }
        self.position += self.batch_size;
        Some((&self.batch_inputs, &self.batch_targets))
    }
}

/// Split a packed sample matrix into training and validation portions.
///
/// The validation rows come from the end of the data.
///
/// # Example
///
/// ```rust
/// # use strata::train_val_split;
/// let data = vec![1.0; 20]; // 10 samples, width 2
/// let (train, val) = train_val_split(&data, 2, 0.2);
/// assert_eq!(train.len(), 16);
/// assert_eq!(val.len(), 4);
/// ```
pub fn train_val_split(data: &[f32], width: usize, val_fraction: f32) -> (&[f32], &[f32]) {
    let samples = data.len() / width;
    let split = ((samples as f32) * (1.0 - val_fraction)) as usize;
    data.split_at(split * width)
}

/// Hyperparameters for one training run.
///
/// Per-weight settings (learning rate, momentum, update rule) live in
/// each layer's `OptimizerConfig`; this covers the outer loop.
pub struct TrainingConfig {
    /// Samples per training step.
    pub train_batch: usize,
    /// Maximum batch for evaluation sweeps. Must be >= `train_batch`.
    pub eval_batch: usize,
    /// Passes through the dataset.
    pub epochs: usize,
    /// Log metrics every N steps.
    pub log_every: usize,
    /// Seed for weight init, dropout, and the shuffle stream.
    pub seed: u64,
    /// Clip the output-layer loss gradient to this global L2 norm.
    pub grad_clip: Option<f32>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            train_batch: 16,
            eval_batch: 64,
            epochs: 10,
            log_every: 100,
            seed: 0,
            grad_clip: None,
        }
    }
}

impl TrainingConfig {
    /// A configuration small enough for quick experiments and tests.
    pub fn tiny() -> Self {
        Self {
            train_batch: 4,
            eval_batch: 4,
            epochs: 3,
            log_every: 10,
            seed: 0,
            grad_clip: None,
        }
    }

    /// A modest configuration for small datasets on one machine.
    pub fn small() -> Self {
        Self {
            train_batch: 8,
            eval_batch: 32,
            epochs: 5,
            log_every: 50,
            seed: 0,
            grad_clip: None,
        }
    }
}

/// Logs training metrics to CSV and console.
///
/// The CSV columns are `step`, `elapsed_seconds`, `train_loss`,
/// `grad_norm`, `val_loss` (empty when no validation set is in play).
/// The file is flushed on every row so a crashed run still leaves usable
/// data.
pub struct TrainingLogger {
    log_file: File,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingLogger {
    pub fn new(log_path: &Path) -> std::io::Result<Self> {
        let mut log_file = File::create(log_path)?;
        writeln!(log_file, "step,elapsed_seconds,train_loss,grad_norm,val_loss")?;
        let now = Instant::now();
        Ok(Self {
            log_file,
            start_time: now,
            last_log_time: now,
        })
    }

    pub fn log(
        &mut self,
        step: usize,
        train_loss: f32,
        grad_norm: f32,
        val_loss: Option<f32>,
    ) -> std::io::Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let val_cell = val_loss.map(|v| format!("{:.6}", v)).unwrap_or_default();
        writeln!(
            self.log_file,
            "{},{:.2},{:.6},{:.6},{}",
            step, elapsed, train_loss, grad_norm, val_cell
        )?;
        self.log_file.flush()?;

        let step_time = self.last_log_time.elapsed().as_secs_f32();
        match val_loss {
            Some(v) => println!(
                "Step {:5} | Time: {:7.1}s (+{:.1}s) | Train: {:.4} | Grad: {:.4} | Val: {:.4}",
                step, elapsed, step_time, train_loss, grad_norm, v
            ),
            None => println!(
                "Step {:5} | Time: {:7.1}s (+{:.1}s) | Train: {:.4} | Grad: {:.4}",
                step, elapsed, step_time, train_loss, grad_norm
            ),
        }
        self.last_log_time = Instant::now();
        Ok(())
    }
}

/// Mean squared error between packed predictions and targets, averaged
/// over samples. Used as the validation metric.
pub fn mean_squared_error(predictions: &[f32], targets: &[f32], width: usize) -> f32 {
    let samples = targets.len() / width;
    if samples == 0 {
        return 0.0;
    }
    let sum: f32 = predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| (p - t) * (p - t))
        .sum();
    sum / samples as f32
}

/// Runs the epoch loop: init, memory assignment, shuffled mini-batches,
/// optional periodic validation, teardown.
pub struct Trainer {
    network: Network,
    config: TrainingConfig,
    logger: Option<TrainingLogger>,
}

impl Trainer {
    pub fn new(network: Network, config: TrainingConfig) -> Self {
        Self {
            network,
            config,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: TrainingLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn into_network(self) -> Network {
        self.network
    }

    /// Train for the configured number of epochs. Returns the loss of the
    /// final training step.
    ///
    /// `validation` is an optional packed `(inputs, targets)` pair scored
    /// with [`mean_squared_error`] at every log point.
    pub fn run(
        &mut self,
        mut loader: VectorDataLoader,
        validation: Option<(&[f32], &[f32])>,
    ) -> NetResult<f32> {
        let Self {
            network,
            config,
            logger,
        } = self;
        network.set_seed(config.seed);
        if let Some(clip) = config.grad_clip {
            network.set_grad_clip(clip);
        }

        let requirement = network.init(config.train_batch, config.eval_batch)?;
        network.assign_memory(vec![0.0; requirement.train_elements])?;
        network.set_batch_size(config.train_batch)?;

        let mut rng = StdRng::seed_from_u64(config.seed ^ 0x5EED_DA7A);
        let mut step = 0usize;
        let mut last_loss = 0.0;
        for _ in 0..config.epochs {
            loader.start_epoch(&mut rng);
            while let Some((inputs, targets)) = loader.next_batch() {
                last_loss = network.train_step(inputs, targets)?;
                step += 1;
                if step % config.log_every == 0 {
                    let val = match validation {
                        Some((vi, vt)) => Some(Self::validation_loss(network, config, vi, vt)?),
                        None => None,
                    };
                    if let Some(logger) = logger.as_mut() {
                        logger.log(step, last_loss, network.last_grad_norm(), val).ok();
                    }
                }
            }
        }

        network.deinit();
        Ok(last_loss)
    }

    /// Evaluate MSE over a packed validation set, batching at the eval
    /// maximum. Leaves the network back at the training batch size.
    fn validation_loss(
        network: &mut Network,
        config: &TrainingConfig,
        inputs: &[f32],
        targets: &[f32],
    ) -> NetResult<f32> {
        let out_width = network.output_neurons();
        let in_width = inputs.len() / (targets.len() / out_width);
        let samples = targets.len() / out_width;

        let mut predictions = vec![0.0; samples * out_width];
        let mut done = 0;
        while done < samples {
            let batch = (samples - done).min(config.eval_batch);
            network.set_batch_size(batch)?;
            network.forward(&inputs[done * in_width..(done + batch) * in_width], Pass::Eval)?;
            network.output_into(&mut predictions[done * out_width..(done + batch) * out_width]);
            done += batch;
        }
        network.set_batch_size(config.train_batch)?;
        Ok(mean_squared_error(&predictions, targets, out_width))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;
    use crate::layers::DenseLayer;
    use crate::optimizer::OptimizerConfig;

    fn toy_loader() -> VectorDataLoader {
        // y = 2x over eight scalar samples.
        let inputs: Vec<f32> = (0..8).map(|i| i as f32 - 3.5).collect();
        let targets: Vec<f32> = inputs.iter().map(|x| 2.0 * x).collect();
        VectorDataLoader::new(inputs, 1, targets, 1, 4)
    }

    #[test]
    fn test_loader_deals_full_batches() {
        let mut loader = toy_loader();
        assert_eq!(loader.num_batches(), 2);
        let mut rng = StdRng::seed_from_u64(1);
        loader.start_epoch(&mut rng);
        let mut seen = Vec::new();
        while let Some((inputs, targets)) = loader.next_batch() {
            assert_eq!(inputs.len(), 4);
            assert_eq!(targets.len(), 4);
            for (&x, &y) in inputs.iter().zip(targets) {
                assert_eq!(y, 2.0 * x);
                seen.push(x);
            }
        }
        // Every sample appears exactly once per epoch.
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let expected: Vec<f32> = (0..8).map(|i| i as f32 - 3.5).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_loader_shuffle_is_seed_deterministic() {
        let mut a = toy_loader();
        let mut b = toy_loader();
        let mut rng_a = StdRng::seed_from_u64(9);
        let mut rng_b = StdRng::seed_from_u64(9);
        a.start_epoch(&mut rng_a);
        b.start_epoch(&mut rng_b);
        let batch_a = a.next_batch().unwrap().0.to_vec();
        let batch_b = b.next_batch().unwrap().0.to_vec();
        assert_eq!(batch_a, batch_b);
    }

    #[test]
    fn test_train_val_split_rows() {
        let data: Vec<f32> = (0..20).map(|i| i as f32).collect();
        let (train, val) = train_val_split(&data, 2, 0.3);
        assert_eq!(train.len(), 14);
        assert_eq!(val.len(), 6);
        assert_eq!(val[0], 14.0);
    }

    #[test]
    fn test_trainer_fits_linear_data() {
        let mut network = Network::new(1);
        network.push(Box::new(
            DenseLayer::new(
                1,
                Activation::Identity,
                OptimizerConfig {
                    learning_rate: 0.02,
                    ..OptimizerConfig::default()
                },
            )
            .into_output(),
        ));
        let mut trainer = Trainer::new(
            network,
            TrainingConfig {
                train_batch: 4,
                eval_batch: 8,
                epochs: 40,
                log_every: 1000,
                seed: 3,
                grad_clip: Some(10.0),
            },
        );
        let final_loss = trainer.run(toy_loader(), None).unwrap();
        assert!(final_loss < 0.1, "final loss {}", final_loss);
    }

    #[test]
    fn test_run_leaves_network_reusable() {
        let mut network = Network::new(1);
        network.push(Box::new(
            DenseLayer::new(1, Activation::Identity, OptimizerConfig::default()).into_output(),
        ));
        let mut trainer = Trainer::new(network, TrainingConfig::tiny());
        trainer.run(toy_loader(), None).unwrap();
        // The trainer still holds the real network, not a placeholder, so
        // a second run over the same instance works.
        assert_eq!(trainer.network().output_neurons(), 1);
        trainer.run(toy_loader(), None).unwrap();
    }

    #[test]
    fn test_logger_writes_csv_rows() {
        let path = std::env::temp_dir().join("strata_train_log_test.csv");
        {
            let mut logger = TrainingLogger::new(&path).unwrap();
            logger.log(10, 0.5, 1.25, Some(0.6)).unwrap();
            logger.log(20, 0.4, 0.75, None).unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "step,elapsed_seconds,train_loss,grad_norm,val_loss");
        assert!(lines[1].starts_with("10,"));
        assert!(lines[2].ends_with(','));
    }

    #[test]
    fn test_mean_squared_error() {
        let pred = [1.0, 2.0, 3.0, 4.0];
        let tgt = [1.0, 0.0, 3.0, 2.0];
        // Two samples of width 2, each contributing 4.0.
        assert!((mean_squared_error(&pred, &tgt, 2) - 4.0).abs() < 1e-6);
    }
}
