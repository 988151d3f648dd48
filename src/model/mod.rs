//! Models fitted by the training job

pub mod tree;

pub use tree::{DecisionTreeClassifier, TreeNode};
