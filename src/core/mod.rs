//! Core domain models
//!
//! Steps, symbolic output references, validated pipelines, the definition
//! rendered for the backend, and execution state.

pub mod config;
pub mod definition;
pub mod pipeline;
pub mod reference;
pub mod settings;
pub mod state;
pub mod step;

pub use config::PipelineConfig;
pub use definition::PipelineDefinition;
pub use pipeline::*;
pub use reference::{OutputProperty, OutputRef};
pub use settings::Settings;
pub use state::*;
pub use step::*;
