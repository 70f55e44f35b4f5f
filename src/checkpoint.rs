//! Name-tagged persistence for weights and optimizer state.
//!
//! A checkpoint is a flat map from state tags ("layer3.weights",
//! "layer3.opt.velocity", ...) to matrices, serialized as JSON. Layers
//! write into it via `export_state` and read back via `import_state`; the
//! driver only ever invokes those hooks between sessions, never mid-sweep,
//! so no transient arena buffer can leak into a file.
//!
//! Imports are shape-checked against the current topology: a checkpoint
//! from a differently-shaped network is rejected with the offending tag.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};
use crate::matrix::Matrix;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    entries: BTreeMap<String, Matrix>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: &str, matrix: Matrix) {
        self.entries.insert(tag.to_string(), matrix);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetch a required entry, verifying its shape.
    pub fn get(&self, tag: &str, expected: (usize, usize)) -> NetResult<Matrix> {
        match self.try_get(tag, expected)? {
            Some(m) => Ok(m),
            None => Err(NetError::StateNotFound {
                name: tag.to_string(),
            }),
        }
    }

    /// Fetch an optional entry, verifying its shape when present.
    pub fn try_get(&self, tag: &str, expected: (usize, usize)) -> NetResult<Option<Matrix>> {
        match self.entries.get(tag) {
            None => Ok(None),
            Some(m) => {
                if m.shape() != expected {
                    return Err(NetError::StateShape {
                        name: tag.to_string(),
                        expected,
                        actual: m.shape(),
                    });
                }
                Ok(Some(m.clone()))
            }
        }
    }

    pub fn save(&self, path: &Path) -> NetResult<()> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> NetResult<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_checks_shape() {
        let mut ckpt = Checkpoint::new();
        ckpt.insert("layer1.weights", Matrix::zeros(2, 3));
        assert!(ckpt.get("layer1.weights", (2, 3)).is_ok());
        assert!(matches!(
            ckpt.get("layer1.weights", (3, 2)).unwrap_err(),
            NetError::StateShape { .. }
        ));
        assert!(matches!(
            ckpt.get("layer9.weights", (2, 3)).unwrap_err(),
            NetError::StateNotFound { .. }
        ));
    }

    #[test]
    fn test_try_get_missing_is_none() {
        let ckpt = Checkpoint::new();
        assert!(ckpt.try_get("nothing", (1, 1)).unwrap().is_none());
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut ckpt = Checkpoint::new();
        ckpt.insert(
            "layer1.weights",
            Matrix::from_vec(1, 3, vec![0.5, -0.25, 3.0]),
        );
        let path = std::env::temp_dir().join("strata_checkpoint_test.json");
        ckpt.save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        let m = loaded.get("layer1.weights", (1, 3)).unwrap();
        assert_eq!(m.as_slice(), &[0.5, -0.25, 3.0]);
    }
}
