pub mod buffer;
pub mod context;
pub mod engine;

pub use buffer::RegionBuffer;
pub use context::{ExecutionContext, ExecutionOptions};
pub use engine::{ExecutionJob, Kernel, PersistentCache, PlanExecutor};
