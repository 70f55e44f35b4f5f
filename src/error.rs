//! Error types for the strata engine.
//!
//! All failures surface during network initialization: configuration errors
//! (a pack whose children do not cover its input range, mismatched batch
//! sizes between siblings, a weight matrix carried over from a previous
//! session with the wrong shape) and resource errors (an arena region too
//! small for the plan). Once `init` and `assign_memory` have succeeded,
//! forward and backward sweeps do not fail — a shape mismatch at that point
//! is a bug in a layer implementation, not a runtime condition.
//!
//! Every variant that concerns a specific layer carries that layer's index
//! so the driver can report exactly which part of the graph was rejected.

use std::fmt;

/// Which subsystem ran out of memory.
///
/// Resource failures are enumerable so callers can log which part of the
/// plan could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocSite {
    /// Per-layer activation storage in the persistent arena region.
    Activations,
    /// Pack staging buffers in the scratch region.
    PackStaging,
    /// The two ping-pong gradient buffers.
    GradientBuffers,
}

impl fmt::Display for AllocSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocSite::Activations => write!(f, "activation storage"),
            AllocSite::PackStaging => write!(f, "pack staging scratch"),
            AllocSite::GradientBuffers => write!(f, "gradient buffers"),
        }
    }
}

/// All recoverable error conditions in the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum NetError {
    /// A Horizontal or Gated pack's child slices leave a gap or overlap in
    /// the pack's incoming neuron range.
    SliceCoverage {
        layer_index: usize,
        expected: usize,
        covered: usize,
    },
    /// Sibling children of a pack disagreed on the outgoing batch size.
    BatchMismatch {
        layer_index: usize,
        expected: usize,
        actual: usize,
    },
    /// A Tile pack's incoming neuron count is not divisible by its tile count.
    TileMismatch {
        layer_index: usize,
        fan_in: usize,
        tiles: usize,
    },
    /// A Gated pack's gate child produces neither one gate column nor one
    /// column per gated child.
    GateWidth {
        layer_index: usize,
        gate_outputs: usize,
        children: usize,
    },
    /// A pack was constructed with no children.
    EmptyPack { layer_index: usize },
    /// A non-input layer was wired with zero incoming neurons.
    MissingFanIn { layer_index: usize },
    /// Weights persisted from a previous session do not match the shape the
    /// current topology requires.
    WeightShape {
        layer_index: usize,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    /// The eval/train batch-size pair is invalid (zero, or eval < train).
    InvalidBatch { eval: usize, train: usize },
    /// The topmost layer cannot produce a loss gradient from labels.
    NoOutputLayer,
    /// The buffer handed to `assign_memory` is smaller than the computed
    /// requirement.
    BufferTooSmall { required: usize, provided: usize },
    /// A layer tried to carve more elements than its assigned range holds.
    ArenaExhausted {
        site: AllocSite,
        requested: usize,
        remaining: usize,
    },
    /// An operation was called in the wrong session state (e.g. forward
    /// before `assign_memory`).
    NotReady,
    /// A requested batch size exceeds the maximum planned for this session.
    BatchTooLarge { requested: usize, max: usize },
    /// A checkpoint is missing a named state entry.
    StateNotFound { name: String },
    /// A checkpoint entry has the wrong shape for the current topology.
    StateShape {
        name: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    /// Checkpoint file I/O or (de)serialization failure.
    Checkpoint { message: String },
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::SliceCoverage {
                layer_index,
                expected,
                covered,
            } => write!(
                f,
                "layer {}: child slices cover {} of {} incoming neurons (gaps or overlaps)",
                layer_index, covered, expected
            ),
            NetError::BatchMismatch {
                layer_index,
                expected,
                actual,
            } => write!(
                f,
                "layer {}: sibling outgoing batch size {} disagrees with {}",
                layer_index, actual, expected
            ),
            NetError::TileMismatch {
                layer_index,
                fan_in,
                tiles,
            } => write!(
                f,
                "layer {}: {} incoming neurons not divisible into {} tiles",
                layer_index, fan_in, tiles
            ),
            NetError::GateWidth {
                layer_index,
                gate_outputs,
                children,
            } => write!(
                f,
                "layer {}: gate produces {} columns for {} gated children",
                layer_index, gate_outputs, children
            ),
            NetError::EmptyPack { layer_index } => {
                write!(f, "layer {}: pack has no children", layer_index)
            }
            NetError::MissingFanIn { layer_index } => {
                write!(f, "layer {}: wired with zero incoming neurons", layer_index)
            }
            NetError::WeightShape {
                layer_index,
                expected,
                actual,
            } => write!(
                f,
                "layer {}: persisted weights are {}x{}, topology requires {}x{}",
                layer_index, actual.0, actual.1, expected.0, expected.1
            ),
            NetError::InvalidBatch { eval, train } => write!(
                f,
                "invalid batch pair: eval {} must be >= train {} and both positive",
                eval, train
            ),
            NetError::NoOutputLayer => {
                write!(f, "topmost layer cannot compute a loss gradient from labels")
            }
            NetError::BufferTooSmall { required, provided } => write!(
                f,
                "arena buffer holds {} elements, plan requires {}",
                provided, required
            ),
            NetError::ArenaExhausted {
                site,
                requested,
                remaining,
            } => write!(
                f,
                "{}: requested {} elements, {} remaining",
                site, requested, remaining
            ),
            NetError::NotReady => write!(f, "operation requires an initialized network"),
            NetError::BatchTooLarge { requested, max } => {
                write!(f, "batch size {} exceeds session maximum {}", requested, max)
            }
            NetError::StateNotFound { name } => {
                write!(f, "checkpoint entry not found: {}", name)
            }
            NetError::StateShape {
                name,
                expected,
                actual,
            } => write!(
                f,
                "checkpoint entry {}: shape {}x{}, expected {}x{}",
                name, actual.0, actual.1, expected.0, expected.1
            ),
            NetError::Checkpoint { message } => write!(f, "checkpoint: {}", message),
        }
    }
}

impl std::error::Error for NetError {}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        NetError::Checkpoint {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for NetError {
    fn from(err: serde_json::Error) -> Self {
        NetError::Checkpoint {
            message: err.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type NetResult<T> = Result<T, NetError>;
