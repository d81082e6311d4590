pub mod alias;
pub mod allocator;
pub mod exec_args;
pub mod planner;
pub mod registry;

pub use alias::AliasMap;

pub use allocator::{BufferAssigner, SlotId};

pub use exec_args::{
    ArgBinding,
    ArgRole,
    BoundArgs,
    ExecArgs,
    ExecutionArgsSet,
    MemoryId,
    MemoryRecord,
    MemoryRef,
    OpArgs,
};

pub use planner::{
    BufferAssignment,
    BufferKind,
    MemoryPlan,
    MemoryPlanner,
    MemoryReuse,
    PlanStats,
    PlanSummary,
    PlannerOptions,
    ValueMemoryInfo,
    DEFAULT_MATCH_RANGE,
};

pub use registry::{Grantor, Registry, DEFAULT_ALIGNMENT};
