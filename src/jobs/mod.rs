//! Programs run inside the pipeline's compute units

pub mod preprocess;
pub mod tabular;
pub mod train;

pub use preprocess::{PreprocessConfig, PreprocessReport};
pub use train::{TrainConfig, TrainingSummary};
