//! File-backed oblivious-tree ensemble, the engine shipped with the gateway.
//!
//! A model file is JSON: every tree applies the same split at each depth,
//! so a row's leaf is the bit pattern of its split outcomes. Numeric splits
//! test `value > border`; categorical splits test equality with one value.
//! Score is `scale * sum(leaf values) + bias`.

use memmap2::Mmap;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::engine::{split_row, EngineError, FeatureValue, InferenceEngine, ModelHandle};

/// Trees deeper than this are rejected at load; `2^depth` leaves per tree.
pub const MAX_DEPTH: usize = 16;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Split {
    Float { index: usize, border: f64 },
    Category { index: usize, value: String },
}

#[derive(Debug, Deserialize)]
struct Tree {
    splits: Vec<Split>,
    leaf_values: Vec<f64>,
}

fn default_scale() -> f64 { 1.0 }

#[derive(Debug, Deserialize)]
pub struct ObliviousForest {
    float_feature_count: usize,
    #[serde(default)]
    cat_feature_count: usize,
    trees: Vec<Tree>,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(default)]
    bias: f64,
}

impl ObliviousForest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, String> {
        let forest: ObliviousForest = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        forest.validate()?;
        Ok(forest)
    }

    fn validate(&self) -> Result<(), String> {
        for (t, tree) in self.trees.iter().enumerate() {
            let depth = tree.splits.len();
            if depth > MAX_DEPTH {
                return Err(format!("tree {t}: depth {depth} exceeds {MAX_DEPTH}"));
            }
            if tree.leaf_values.len() != 1usize << depth {
                return Err(format!("tree {t}: {} leaf values for depth {depth}, expected {}", tree.leaf_values.len(), 1usize << depth));
            }
            for split in &tree.splits {
                match split {
                    Split::Float { index, .. } if *index >= self.float_feature_count => {
                        return Err(format!("tree {t}: numeric feature {index} out of range"));
                    }
                    Split::Category { index, .. } if *index >= self.cat_feature_count => {
                        return Err(format!("tree {t}: categorical feature {index} out of range"));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    pub fn tree_count(&self) -> usize { self.trees.len() }

    fn leaf_index(tree: &Tree, floats: &[f64], cats: &[&str]) -> usize {
        tree.splits.iter().enumerate().fold(0usize, |acc, (bit, split)| {
            let on = match split {
                Split::Float { index, border } => floats[*index] > *border,
                Split::Category { index, value } => cats[*index] == value.as_str(),
            };
            if on { acc | (1 << bit) } else { acc }
        })
    }
}

impl ModelHandle for ObliviousForest {
    fn score(&self, row: &[FeatureValue]) -> Result<f64, EngineError> {
        let (floats, cats) = split_row(row);
        if floats.len() != self.float_feature_count || cats.len() != self.cat_feature_count {
            return Err(EngineError::FeatureCount {
                expected_numeric: self.float_feature_count,
                expected_categorical: self.cat_feature_count,
                got_numeric: floats.len(),
                got_categorical: cats.len(),
            });
        }
        let sum: f64 = self.trees.iter().map(|tree| tree.leaf_values[Self::leaf_index(tree, &floats, &cats)]).sum();
        Ok(self.scale * sum + self.bias)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ObliviousForestEngine;

impl InferenceEngine for ObliviousForestEngine {
    fn load(&self, path: &Path) -> Result<Arc<dyn ModelHandle>, EngineError> {
        let io_err = |source| EngineError::Io { path: path.to_path_buf(), source };
        let file = File::open(path).map_err(io_err)?;
        if file.metadata().map_err(io_err)?.len() == 0 {
            return Err(EngineError::Format { path: path.to_path_buf(), reason: "empty file".into() });
        }
        // SAFETY: the mapping is read once and dropped before returning; a
        // concurrent truncation surfaces as a parse error at worst.
        let mmap = unsafe { Mmap::map(&file) }.map_err(io_err)?;
        let forest = ObliviousForest::from_slice(&mmap)
            .map_err(|reason| EngineError::Format { path: path.to_path_buf(), reason })?;
        tracing::debug!(path=%path.display(), trees = forest.tree_count(), "ensemble parsed");
        Ok(Arc::new(forest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"{
        "float_feature_count": 2,
        "cat_feature_count": 1,
        "trees": [
            {"splits": [{"float": {"index": 0, "border": 0.5}}, {"category": {"index": 0, "value": "red"}}],
             "leaf_values": [0.0, 1.0, 2.0, 3.0]},
            {"splits": [{"float": {"index": 1, "border": 10.0}}],
             "leaf_values": [0.25, 0.75]}
        ],
        "scale": 2.0,
        "bias": 1.0
    }"#;

    fn row(a: f64, b: f64, c: &str) -> Vec<FeatureValue> { vec![a.into(), b.into(), c.into()] }

    #[test]
    fn scores_by_split_bits() {
        let forest = ObliviousForest::from_slice(MODEL.as_bytes()).unwrap();
        // tree0 leaf 3 (both on) = 3.0, tree1 leaf 1 = 0.75 -> 2 * 3.75 + 1
        assert_eq!(forest.score(&row(0.9, 11.0, "red")).unwrap(), 8.5);
        // tree0 leaf 0, tree1 leaf 0 -> 2 * 0.25 + 1
        assert_eq!(forest.score(&row(0.1, 1.0, "blue")).unwrap(), 1.5);
        // only the category split fires -> leaf 2
        assert_eq!(forest.score(&row(0.5, 10.0, "red")).unwrap(), 2.0 * 2.25 + 1.0);
    }

    #[test]
    fn categorical_values_may_interleave() {
        let forest = ObliviousForest::from_slice(MODEL.as_bytes()).unwrap();
        let interleaved: Vec<FeatureValue> = vec![0.9.into(), "red".into(), 11.0.into()];
        assert_eq!(forest.score(&interleaved).unwrap(), 8.5);
    }

    #[test]
    fn feature_count_mismatch_is_an_error() {
        let forest = ObliviousForest::from_slice(MODEL.as_bytes()).unwrap();
        let short: Vec<FeatureValue> = vec![0.1.into(), "red".into()];
        let err = forest.score(&short).unwrap_err();
        assert!(matches!(err, EngineError::FeatureCount { expected_numeric: 2, got_numeric: 1, .. }));
    }

    #[test]
    fn rejects_bad_leaf_count_and_indices() {
        let bad_leaves = r#"{"float_feature_count": 1, "trees": [{"splits": [{"float": {"index": 0, "border": 0}}], "leaf_values": [1.0]}]}"#;
        assert!(ObliviousForest::from_slice(bad_leaves.as_bytes()).unwrap_err().contains("leaf values"));
        let bad_index = r#"{"float_feature_count": 1, "trees": [{"splits": [{"category": {"index": 0, "value": "x"}}], "leaf_values": [1.0, 2.0]}]}"#;
        assert!(ObliviousForest::from_slice(bad_index.as_bytes()).unwrap_err().contains("out of range"));
    }

    #[test]
    fn engine_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        std::fs::write(&path, MODEL).unwrap();
        let handle = ObliviousForestEngine.load(&path).unwrap();
        assert_eq!(handle.score(&row(0.9, 11.0, "red")).unwrap(), 8.5);

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "").unwrap();
        assert!(matches!(ObliviousForestEngine.load(&empty), Err(EngineError::Format { .. })));
        assert!(matches!(ObliviousForestEngine.load(&dir.path().join("missing.json")), Err(EngineError::Io { .. })));
    }
}
