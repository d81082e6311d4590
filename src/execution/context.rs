use std::sync::Arc;

use crate::error::{Error, Result};
use crate::execution::buffer::RegionBuffer;
use crate::memory::exec_args::{BoundArgs, MemoryRef};
use crate::memory::planner::MemoryPlan;

/// Options for plan execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Number of threads used by batch execution (0 = use system default)
    pub thread_count: usize,
}

impl ExecutionOptions {
    /// Create a new execution options object
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of threads to use
    pub fn set_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }
}

/// Per-thread state for replaying a plan.
///
/// Owns its temporary region and its own bound argument table, so two
/// contexts never share scratch memory.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Bound handles for the current execution
    args: BoundArgs,
    /// Backing memory of the temporary region
    temporary: RegionBuffer,
    /// Completed executions
    pub(crate) executions: usize,
}

impl ExecutionContext {
    /// Create a context sized for a plan
    pub fn new(plan: &MemoryPlan) -> Result<Self> {
        let temporary = RegionBuffer::new(plan.total_internal_temporary_size(), plan.alignment())?;
        Ok(Self {
            args: plan.exec_args_set().instantiate(),
            temporary,
            executions: 0,
        })
    }

    /// Bind caller buffers and both regions for the next execution
    pub fn bind(
        &mut self,
        plan: &MemoryPlan,
        persistent: &RegionBuffer,
        inputs: &[MemoryRef],
        outputs: &[MemoryRef],
    ) -> Result<()> {
        if !Arc::ptr_eq(self.args.template(), plan.exec_args_set()) {
            return Err(Error::BindingError(
                "Execution context was created for a different plan".to_string(),
            ));
        }
        let temporary = plan.internal_temporary_grantor(self.temporary.as_mut_ptr())?;
        let persistent = plan.internal_persistent_grantor(persistent.as_mut_ptr())?;
        self.args.bind(inputs, outputs, &temporary, &persistent)
    }

    pub fn args(&self) -> &BoundArgs {
        &self.args
    }

    pub fn temporary(&self) -> &RegionBuffer {
        &self.temporary
    }

    /// Number of executions completed with this context
    pub fn executions(&self) -> usize {
        self.executions
    }
}
