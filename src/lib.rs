pub mod error;
pub mod model;
pub mod memory;
pub mod execution;

// Re-export commonly used types
pub use error::{Error, Result};
pub use model::{DataType, Graph, InplacePair, OpId, OpSpec, Operation, Value, ValueId};
pub use memory::{
    ArgRole, BoundArgs, BufferAssignment, BufferKind, ExecutionArgsSet, MemoryPlan, MemoryPlanner,
    MemoryRef, MemoryReuse, OpArgs, PlanStats, PlannerOptions, SlotId,
};
pub use execution::{ExecutionContext, ExecutionJob, ExecutionOptions, Kernel, PlanExecutor, RegionBuffer};
