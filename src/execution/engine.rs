use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::execution::buffer::RegionBuffer;
use crate::execution::context::{ExecutionContext, ExecutionOptions};
use crate::memory::exec_args::{MemoryRef, OpArgs};
use crate::memory::planner::MemoryPlan;
use crate::model::{Graph, Operation};

/// Compute implementation invoked once per operation
pub trait Kernel: Send + Sync {
    /// Run `op` reading and writing the bound memory in `args`
    fn execute(&self, op: &Operation, args: &OpArgs<'_>) -> Result<()>;
}

/// Persistent region shared by every execution of a plan
#[derive(Debug)]
pub struct PersistentCache {
    buffer: RegionBuffer,
    /// Set once constant operations have written their outputs
    filled: Mutex<bool>,
}

impl PersistentCache {
    pub fn new(plan: &MemoryPlan) -> Result<Self> {
        Ok(Self {
            buffer: RegionBuffer::new(plan.total_internal_persistent_size(), plan.alignment())?,
            filled: Mutex::new(false),
        })
    }

    pub fn buffer(&self) -> &RegionBuffer {
        &self.buffer
    }

    pub fn is_filled(&self) -> Result<bool> {
        Ok(*self.lock()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, bool>> {
        self.filled
            .lock()
            .map_err(|_| Error::ExecutionError("Persistent cache lock poisoned".to_string()))
    }
}

/// External buffers of one independent execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionJob {
    pub inputs: Vec<MemoryRef>,
    pub outputs: Vec<MemoryRef>,
}

/// Replays a memory plan through a [`Kernel`]
pub struct PlanExecutor {
    graph: Arc<Graph>,
    plan: Arc<MemoryPlan>,
    persistent: PersistentCache,
    options: ExecutionOptions,
    /// Operations up to the last cached constant producer
    cache_prefix: usize,
    /// Pool for batch execution, `None` uses the global rayon pool
    thread_pool: Option<rayon::ThreadPool>,
}

impl PlanExecutor {
    /// Create an executor for a planned graph
    pub fn new(graph: Arc<Graph>, plan: Arc<MemoryPlan>, options: ExecutionOptions) -> Result<Self> {
        if plan.execution_order().len() != graph.ops().len() {
            return Err(Error::InvalidState(format!(
                "Plan covers {} operations but the graph has {}",
                plan.execution_order().len(),
                graph.ops().len()
            )));
        }

        let thread_pool = if options.thread_count > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(options.thread_count)
                .build()
                .map_err(|e| Error::ExecutionError(format!("Failed to build thread pool: {}", e)))?;
            Some(pool)
        } else {
            None
        };

        let cache_prefix = plan
            .exec_args_set()
            .exec_args()
            .iter()
            .rposition(|args| args.constant)
            .map_or(0, |last| last + 1);

        Ok(Self {
            persistent: PersistentCache::new(&plan)?,
            cache_prefix,
            graph,
            plan,
            options,
            thread_pool,
        })
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn plan(&self) -> &Arc<MemoryPlan> {
        &self.plan
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn persistent(&self) -> &PersistentCache {
        &self.persistent
    }

    /// Whether constant operations already populated the persistent region
    pub fn constants_ready(&self) -> Result<bool> {
        self.persistent.is_filled()
    }

    /// Fresh per-thread context for this plan
    pub fn create_context(&self) -> Result<ExecutionContext> {
        ExecutionContext::new(&self.plan)
    }

    /// Run the whole graph once against the given external buffers
    pub fn execute<K: Kernel + ?Sized>(
        &self,
        ctx: &mut ExecutionContext,
        inputs: &[MemoryRef],
        outputs: &[MemoryRef],
        kernel: &K,
    ) -> Result<()> {
        ctx.bind(&self.plan, self.persistent.buffer(), inputs, outputs)?;

        let total = ctx.args().len();
        let mut filled = self.persistent.lock()?;
        if *filled {
            drop(filled);
            self.run_ops(ctx, kernel, 0..total, false)?;
        } else {
            // only one execution produces the cached values
            self.run_ops(ctx, kernel, 0..self.cache_prefix, true)?;
            *filled = true;
            drop(filled);
            debug!("persistent cache filled ({} bytes)", self.persistent.buffer().size());
            self.run_ops(ctx, kernel, self.cache_prefix..total, true)?;
        }

        self.copy_pass_throughs(inputs, outputs)?;
        ctx.executions += 1;
        Ok(())
    }

    /// Run independent jobs in parallel, one context per worker
    pub fn execute_batch<K: Kernel + ?Sized>(&self, jobs: &[ExecutionJob], kernel: &K) -> Result<()> {
        let run = || {
            jobs.par_iter()
                .map_init(
                    || self.create_context(),
                    |ctx, job| {
                        let ctx = ctx.as_mut().map_err(|e| {
                            Error::ExecutionError(format!("Failed to create execution context: {}", e))
                        })?;
                        self.execute(ctx, &job.inputs, &job.outputs, kernel)
                    },
                )
                .collect::<Result<Vec<()>>>()
        };

        match &self.thread_pool {
            Some(pool) => pool.install(run)?,
            None => run()?,
        };
        Ok(())
    }

    fn run_ops<K: Kernel + ?Sized>(
        &self,
        ctx: &ExecutionContext,
        kernel: &K,
        range: Range<usize>,
        include_constant: bool,
    ) -> Result<()> {
        let args = ctx.args();
        for index in range {
            let op_args = args.op_args(index).ok_or_else(|| {
                Error::ExecutionError(format!("Missing arguments for operation {}", index))
            })?;
            if op_args.is_constant() && !include_constant {
                continue;
            }
            let op = self.graph.op(op_args.op())?;
            trace!("executing {} ({})", op.name, op.op_type);
            kernel.execute(op, &op_args).map_err(|e| {
                Error::ExecutionError(format!("Operation {} failed: {}", op.name, e))
            })?;
        }
        Ok(())
    }

    fn copy_pass_throughs(&self, inputs: &[MemoryRef], outputs: &[MemoryRef]) -> Result<()> {
        for &(input, output) in self.plan.pass_throughs() {
            let value = self.graph.inputs()[input];
            let size = self.graph.value(value)?.size_in_bytes()?;
            let (source, target) = (inputs[input], outputs[output]);
            if source.len() < size || target.len() < size {
                return Err(Error::BindingError(format!(
                    "Pass-through {} needs {} bytes in input {} and output {}",
                    value, size, input, output
                )));
            }
            if size > 0 {
                unsafe { std::ptr::copy(source.as_ptr(), target.as_ptr(), size) };
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("operations", &self.graph.ops().len())
            .field("temporary_bytes", &self.plan.total_internal_temporary_size())
            .field("persistent_bytes", &self.plan.total_internal_persistent_size())
            .field("options", &self.options)
            .finish()
    }
}
