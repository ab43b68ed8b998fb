//! Single classification tree in sklearn's flat node layout.
//!
//! # JSON Format
//!
//! ```json
//! {
//!   "n_nodes": 3,
//!   "nodes": [
//!     { "feature": 4, "threshold": 0.46, "left": 1, "right": 2, "value": null },
//!     { "feature": -1, "threshold": 0.0, "left": -1, "right": -1, "value": [1.0, 0.0] },
//!     { "feature": -1, "threshold": 0.0, "left": -1, "right": -1, "value": [0.2, 0.8] }
//!   ]
//! }
//! ```
//!
//! # Tree Traversal
//!
//! - Start at node 0 (root)
//! - If `feature == -1`, this is a leaf node; return `value` as probabilities
//! - Else: compare `features[node.feature]` to `node.threshold`
//!   - If `<= threshold` or `NaN`, go to `left` child
//!   - Else go to `right` child
//! - Repeat until reaching a leaf

use serde::{Deserialize, Serialize};

use crate::{EnsembleError, Result};

/// Feature index marking a leaf.
pub(crate) const LEAF: i32 = -1;

/// A single node in the decision tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Feature index to split on (-1 for leaf nodes).
    pub feature: i32,
    /// Threshold value for the split.
    pub threshold: f64,
    /// Index of left child (-1 for leaf nodes).
    pub left: i32,
    /// Index of right child (-1 for leaf nodes).
    pub right: i32,
    /// Class probabilities for leaf nodes (None for internal nodes).
    /// Columns follow the owning forest's `classes`.
    pub value: Option<Vec<f64>>,
}

impl TreeNode {
    pub fn leaf(value: Vec<f64>) -> Self {
        Self {
            feature: LEAF,
            threshold: 0.0,
            left: -1,
            right: -1,
            value: Some(value),
        }
    }

    pub fn split(feature: usize, threshold: f64, left: usize, right: usize) -> Self {
        Self {
            feature: feature as i32,
            threshold,
            left: left as i32,
            right: right as i32,
            value: None,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.feature == LEAF
    }
}

/// Decision tree, nodes in pre-order with node 0 as root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    n_nodes: usize,
    nodes: Vec<TreeNode>,
}

impl DecisionTree {
    /// Wrap nodes produced by a trainer. Call [`validate`](Self::validate)
    /// before trusting nodes from elsewhere.
    pub fn new(nodes: Vec<TreeNode>) -> Self {
        Self {
            n_nodes: nodes.len(),
            nodes,
        }
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Check child and feature indices and leaf widths.
    ///
    /// A valid tree can always be traversed to a leaf without panicking.
    pub fn validate(&self, n_features: usize, n_classes: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(EnsembleError::InvalidModel("tree has no nodes".into()));
        }
        if self.n_nodes != self.nodes.len() {
            return Err(EnsembleError::InvalidModel(format!(
                "n_nodes ({}) doesn't match nodes count ({})",
                self.n_nodes,
                self.nodes.len()
            )));
        }

        let n = self.nodes.len();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.is_leaf() {
                match &node.value {
                    Some(v) if v.len() == n_classes => {}
                    Some(v) => {
                        return Err(EnsembleError::InvalidModel(format!(
                            "leaf node {i} has {} probabilities, expected {n_classes}",
                            v.len()
                        )));
                    }
                    None => {
                        return Err(EnsembleError::InvalidModel(format!(
                            "leaf node {i} missing value array"
                        )));
                    }
                }
                continue;
            }
            // Children must point forward, otherwise traversal could loop.
            let child_ok = |c: i32| c > i as i32 && (c as usize) < n;
            if !child_ok(node.left) {
                return Err(EnsembleError::InvalidModel(format!(
                    "node {i} has invalid left child {}",
                    node.left
                )));
            }
            if !child_ok(node.right) {
                return Err(EnsembleError::InvalidModel(format!(
                    "node {i} has invalid right child {}",
                    node.right
                )));
            }
            if node.feature < 0 || node.feature as usize >= n_features {
                return Err(EnsembleError::InvalidModel(format!(
                    "node {i} has invalid feature index {}",
                    node.feature
                )));
            }
        }
        Ok(())
    }

    /// Leaf probabilities for one row.
    #[inline]
    pub fn leaf_value(&self, features: &[f64]) -> &[f64] {
        let mut node_idx = 0usize;

        loop {
            let node = &self.nodes[node_idx];

            if node.is_leaf() {
                return node.value.as_deref().unwrap_or(&[]);
            }

            // Get feature value (NaN-safe)
            let feature_val = features
                .get(node.feature as usize)
                .copied()
                .unwrap_or(f64::NAN);

            // NaN or <= threshold goes left
            if feature_val.is_nan() || feature_val <= node.threshold {
                node_idx = node.left as usize;
            } else {
                node_idx = node.right as usize;
            }
        }
    }
}
