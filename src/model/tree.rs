//! Decision tree classifier

use crate::error::{PipelineError, Result};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Decision tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeNode {
    /// Leaf node predicting the majority class
    Leaf {
        class_index: usize,
        /// Training samples per class that reached this leaf
        counts: Vec<usize>,
    },
    /// Internal node; samples with `x[feature] <= threshold` go left
    Split {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
        n_samples: usize,
        impurity: f64,
    },
}

impl TreeNode {
    fn depth(&self) -> usize {
        match self {
            TreeNode::Leaf { .. } => 0,
            TreeNode::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }

    fn n_leaves(&self) -> usize {
        match self {
            TreeNode::Leaf { .. } => 1,
            TreeNode::Split { left, right, .. } => left.n_leaves() + right.n_leaves(),
        }
    }
}

/// Gini-impurity classification tree.
///
/// With `max_leaf_nodes` set the tree grows best-first: the frontier node
/// whose split gives the largest weighted impurity decrease is expanded
/// next, until the leaf budget is spent. Without it every impure node is
/// split. Fitting involves no randomness; features are scanned in index
/// order and ties keep the earlier candidate, so the same data and
/// settings always give the same tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTreeClassifier {
    /// Leaf budget, at least 2
    pub max_leaf_nodes: Option<usize>,
    /// Minimum samples a node needs to be split
    pub min_samples_split: usize,
    root: Option<TreeNode>,
    classes: Vec<String>,
    n_features: usize,
}

impl Default for DecisionTreeClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Best split found for one node
#[derive(Debug, Clone)]
struct Candidate {
    feature: usize,
    threshold: f64,
    gain: f64,
    left: Vec<usize>,
    right: Vec<usize>,
}

/// Node under construction
#[derive(Debug)]
struct Growing {
    samples: Vec<usize>,
    counts: Vec<usize>,
    impurity: f64,
    /// (feature, threshold, left child id, right child id) once expanded
    split: Option<(usize, f64, usize, usize)>,
}

fn gini(counts: &[usize], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let n = total as f64;
    1.0 - counts
        .iter()
        .map(|&c| {
            let p = c as f64 / n;
            p * p
        })
        .sum::<f64>()
}

fn majority(counts: &[usize]) -> usize {
    let mut best = 0;
    for (i, &c) in counts.iter().enumerate() {
        if c > counts[best] {
            best = i;
        }
    }
    best
}

impl DecisionTreeClassifier {
    pub fn new() -> Self {
        Self {
            max_leaf_nodes: None,
            min_samples_split: 2,
            root: None,
            classes: Vec::new(),
            n_features: 0,
        }
    }

    /// Set leaf budget
    pub fn with_max_leaf_nodes(mut self, max_leaf_nodes: usize) -> Self {
        self.max_leaf_nodes = Some(max_leaf_nodes);
        self
    }

    pub fn with_min_samples_split(mut self, min_samples: usize) -> Self {
        self.min_samples_split = min_samples.max(2);
        self
    }

    /// Class labels in sorted order; leaf class indices point into this
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn is_fitted(&self) -> bool {
        self.root.is_some()
    }

    pub fn root(&self) -> Option<&TreeNode> {
        self.root.as_ref()
    }

    pub fn depth(&self) -> usize {
        self.root.as_ref().map_or(0, TreeNode::depth)
    }

    pub fn n_leaves(&self) -> usize {
        self.root.as_ref().map_or(0, TreeNode::n_leaves)
    }

    /// Fit the tree to training data
    pub fn fit(&mut self, x: &Array2<f64>, labels: &[String]) -> Result<&mut Self> {
        let n_samples = x.nrows();

        if n_samples != labels.len() {
            return Err(PipelineError::InvalidData(format!(
                "{} feature rows but {} labels",
                n_samples,
                labels.len()
            )));
        }
        if n_samples == 0 || x.ncols() == 0 {
            return Err(PipelineError::InvalidData(
                "Cannot fit a tree on an empty dataset".to_string(),
            ));
        }
        if let Some(max) = self.max_leaf_nodes {
            if max < 2 {
                return Err(PipelineError::InvalidData(format!(
                    "max_leaf_nodes must be at least 2, got {}",
                    max
                )));
            }
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::InvalidData(
                "Features must be finite numbers".to_string(),
            ));
        }

        self.classes = labels
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let y: Vec<usize> = labels
            .iter()
            .map(|l| self.classes.binary_search(l).unwrap_or(0))
            .collect();
        self.n_features = x.ncols();

        let budget = self.max_leaf_nodes.unwrap_or(usize::MAX);
        let mut nodes: Vec<Growing> = vec![self.growing((0..n_samples).collect(), &y)];
        // Frontier in insertion order; on equal gain the older node is expanded first
        let mut frontier: Vec<(usize, Candidate)> = Vec::new();
        if let Some(candidate) = self.best_split(x, &y, &nodes[0], n_samples) {
            frontier.push((0, candidate));
        }

        let mut leaves = 1;
        while leaves < budget && !frontier.is_empty() {
            let mut pick = 0;
            for (i, (_, candidate)) in frontier.iter().enumerate() {
                if candidate.gain > frontier[pick].1.gain {
                    pick = i;
                }
            }
            let (node_id, candidate) = frontier.remove(pick);

            let left_id = nodes.len();
            nodes.push(self.growing(candidate.left, &y));
            let right_id = nodes.len();
            nodes.push(self.growing(candidate.right, &y));
            nodes[node_id].split = Some((candidate.feature, candidate.threshold, left_id, right_id));
            leaves += 1;

            for child in [left_id, right_id] {
                if let Some(next) = self.best_split(x, &y, &nodes[child], n_samples) {
                    frontier.push((child, next));
                }
            }
        }

        self.root = Some(Self::assemble(&nodes, 0));
        Ok(self)
    }

    fn growing(&self, samples: Vec<usize>, y: &[usize]) -> Growing {
        let mut counts = vec![0; self.classes.len()];
        for &i in &samples {
            counts[y[i]] += 1;
        }
        let impurity = gini(&counts, samples.len());
        Growing {
            samples,
            counts,
            impurity,
            split: None,
        }
    }

    /// Best axis-aligned split of a node, if any lowers impurity
    fn best_split(
        &self,
        x: &Array2<f64>,
        y: &[usize],
        node: &Growing,
        n_total: usize,
    ) -> Option<Candidate> {
        let n = node.samples.len();
        if n < self.min_samples_split || node.impurity <= 0.0 {
            return None;
        }

        let mut best: Option<(usize, f64, f64)> = None;
        for feature in 0..x.ncols() {
            let column = x.column(feature);
            let mut order = node.samples.clone();
            order.sort_by(|&a, &b| column[a].total_cmp(&column[b]).then(a.cmp(&b)));

            let mut left_counts = vec![0; self.classes.len()];
            for pos in 0..n - 1 {
                left_counts[y[order[pos]]] += 1;
                let (lo, hi) = (column[order[pos]], column[order[pos + 1]]);
                if lo >= hi {
                    continue;
                }

                let n_left = pos + 1;
                let n_right = n - n_left;
                let right_counts: Vec<usize> = node
                    .counts
                    .iter()
                    .zip(&left_counts)
                    .map(|(total, left)| total - left)
                    .collect();
                let children = (n_left as f64 * gini(&left_counts, n_left)
                    + n_right as f64 * gini(&right_counts, n_right))
                    / n as f64;
                let gain = (n as f64 / n_total as f64) * (node.impurity - children);

                if best.map_or(true, |(_, _, g)| gain > g) {
                    best = Some((feature, midpoint(lo, hi), gain));
                }
            }
        }

        let (feature, threshold, gain) = best?;
        if gain <= f64::EPSILON {
            return None;
        }
        let column = x.column(feature);
        let (left, right): (Vec<usize>, Vec<usize>) = node
            .samples
            .iter()
            .copied()
            .partition(|&i| column[i] <= threshold);
        Some(Candidate {
            feature,
            threshold,
            gain,
            left,
            right,
        })
    }

    fn assemble(nodes: &[Growing], id: usize) -> TreeNode {
        let node = &nodes[id];
        match node.split {
            Some((feature, threshold, left, right)) => TreeNode::Split {
                feature,
                threshold,
                left: Box::new(Self::assemble(nodes, left)),
                right: Box::new(Self::assemble(nodes, right)),
                n_samples: node.samples.len(),
                impurity: node.impurity,
            },
            None => TreeNode::Leaf {
                class_index: majority(&node.counts),
                counts: node.counts.clone(),
            },
        }
    }

    fn root_checked(&self, n_features: usize) -> Result<&TreeNode> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidData("Model is not fitted".to_string()))?;
        if n_features != self.n_features {
            return Err(PipelineError::InvalidData(format!(
                "Expected {} features, got {}",
                self.n_features, n_features
            )));
        }
        Ok(root)
    }

    fn walk(mut node: &TreeNode, row: ArrayView1<f64>) -> usize {
        loop {
            match node {
                TreeNode::Leaf { class_index, .. } => return *class_index,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    node = if row[*feature] <= *threshold {
                        left.as_ref()
                    } else {
                        right.as_ref()
                    };
                }
            }
        }
    }

    /// Predict class labels for each row
    pub fn predict(&self, x: &Array2<f64>) -> Result<Vec<String>> {
        let root = self.root_checked(x.ncols())?;
        Ok(x.rows()
            .into_iter()
            .map(|row| self.classes[Self::walk(root, row)].clone())
            .collect())
    }

    /// Predict the label of a single feature vector
    pub fn predict_label(&self, features: &[f64]) -> Result<&str> {
        let root = self.root_checked(features.len())?;
        let index = Self::walk(root, ArrayView1::from(features));
        Ok(self.classes[index].as_str())
    }

    /// Fraction of rows predicted correctly
    pub fn score(&self, x: &Array2<f64>, labels: &[String]) -> Result<f64> {
        if labels.is_empty() {
            return Ok(0.0);
        }
        let predicted = self.predict(x)?;
        let correct = predicted.iter().zip(labels).filter(|(p, l)| p == l).count();
        Ok(correct as f64 / labels.len() as f64)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a saved model, rejecting trees whose indices don't fit its
    /// classes and features
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let model: Self = serde_json::from_str(&content)?;
        model.validate().map_err(|e| match e {
            PipelineError::InvalidData(message) => {
                PipelineError::InvalidData(format!("{}: {}", path.display(), message))
            }
            other => other,
        })?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let n_classes = self.classes.len();
        let mut pending = vec![root];
        while let Some(node) = pending.pop() {
            match node {
                TreeNode::Leaf {
                    class_index,
                    counts,
                } => {
                    if *class_index >= n_classes {
                        return Err(PipelineError::InvalidData(format!(
                            "Leaf predicts class {} but the model has {} classes",
                            class_index, n_classes
                        )));
                    }
                    if counts.len() != n_classes {
                        return Err(PipelineError::InvalidData(format!(
                            "Leaf has {} class counts but the model has {} classes",
                            counts.len(),
                            n_classes
                        )));
                    }
                }
                TreeNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } => {
                    if *feature >= self.n_features {
                        return Err(PipelineError::InvalidData(format!(
                            "Split on feature {} but the model has {} features",
                            feature, self.n_features
                        )));
                    }
                    pending.push(left.as_ref());
                    pending.push(right.as_ref());
                }
            }
        }
        Ok(())
    }
}

/// Threshold halfway between two distinct sorted values
fn midpoint(lo: f64, hi: f64) -> f64 {
    let mid = lo + (hi - lo) / 2.0;
    if mid >= hi {
        lo
    } else {
        mid
    }
}
