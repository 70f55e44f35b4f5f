//! Strata: Composable Neural Network Training Engine
//!
//! A feed-forward training engine built around explicit memory planning.
//! Networks are composed from layer primitives (dense, identity) and
//! structural packs (vertical stacks, horizontal splits, weight-sharing
//! tiles, gated branches, dropout/penalty wrappers); every activation and
//! gradient buffer lives in one caller-provided arena whose exact size
//! the network reports before any allocation happens.
//!
//! # Modules
//!
//! - [`layers`] - Layer primitives, packs, and the composition trait
//! - [`network`] - The session driver: wire, plan, assign, sweep
//! - [`optimizer`] - Per-layer gradient descent rules and momentum
//! - [`train`] - Epoch loop, data loader, metrics logging
//! - [`checkpoint`] - Weight and optimizer-state persistence
//!
//! # Example
//!
//! ```rust,no_run
//! use strata::{Activation, DenseLayer, Network, OptimizerConfig, Pass};
//!
//! let mut net = Network::new(2).with_seed(7);
//! net.push(Box::new(DenseLayer::new(
//!     8,
//!     Activation::Relu,
//!     OptimizerConfig::default(),
//! )));
//! net.push(Box::new(
//!     DenseLayer::new(1, Activation::Sigmoid, OptimizerConfig::default()).into_output(),
//! ));
//!
//! let requirement = net.init(4, 16)?;
//! net.assign_memory(vec![0.0; requirement.train_elements])?;
//! net.set_batch_size(4)?;
//! let loss = net.train_step(&[0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0], &[0.0, 1.0, 1.0, 0.0])?;
//! # let _ = loss;
//! # Ok::<(), strata::NetError>(())
//! ```

pub mod activation;
pub mod arena;
pub mod checkpoint;
pub mod error;
pub mod layers;
pub mod matrix;
pub mod network;
pub mod optimizer;
pub mod rng;
pub mod train;

// Re-export main types for convenience
pub use activation::Activation;
pub use arena::MemoryRequirement;
pub use checkpoint::Checkpoint;
pub use error::{NetError, NetResult};
pub use layers::{
    DenseLayer, GatedPack, HorizontalPack, IdentityLayer, InputLayer, InputSlice, Layer, Pass,
    Penalty, PenaltyWrapper, TilePack, VerticalPack,
};
pub use network::Network;
pub use optimizer::{
    Decay, GainConfig, MaxNorm, Momentum, OptimizerConfig, UpdateRule,
};
pub use train::{
    train_val_split, Trainer, TrainingConfig, TrainingLogger, VectorDataLoader,
};
