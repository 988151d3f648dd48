//! Pipeline submission and execution monitoring

pub mod retry;
pub mod session;

pub use retry::RetryPolicy;
pub use session::{EventHandler, ExecutionEvent, PipelineSession, WaitOptions};
