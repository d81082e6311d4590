use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;

use tensor_memplan::{
    memory::{ExecutionArgsSet, Registry},
    DataType, Error, ExecutionJob, ExecutionOptions, Graph, Kernel, MemoryPlan, MemoryPlanner,
    MemoryRef, MemoryReuse, OpArgs, OpSpec, Operation, PlanExecutor, PlannerOptions, RegionBuffer,
};

const LEN: usize = 16;

/// f32 kernels for the ops used by these tests
#[derive(Default)]
struct ReferenceKernel {
    packs: AtomicUsize,
}

impl Kernel for ReferenceKernel {
    fn execute(&self, op: &Operation, args: &OpArgs<'_>) -> tensor_memplan::Result<()> {
        let read = |index: usize| -> Vec<f32> {
            args.input(index)
                .map(|memory| unsafe { memory.as_slice::<f32>().to_vec() })
                .unwrap_or_default()
        };
        let output = args
            .output(0)
            .ok_or_else(|| Error::ExecutionError(format!("{} has no output", op.name)))?;
        let len = output.len() / std::mem::size_of::<f32>();

        let result: Vec<f32> = match op.op_type.as_str() {
            "Pack" => {
                self.packs.fetch_add(1, Ordering::SeqCst);
                (0..len).map(|i| i as f32 * 0.5).collect()
            }
            "Add" => read(0).iter().zip(read(1)).map(|(a, b)| a + b).collect(),
            "Scale" => read(0).iter().map(|&a| a * 2.0).collect(),
            "Relu" => read(0).iter().map(|&a| a.max(0.0)).collect(),
            "Smooth" => {
                let input = read(0);
                let scratch = args
                    .scratchpad()
                    .ok_or_else(|| Error::ExecutionError("Smooth needs a scratchpad".to_string()))?;
                let scratch = unsafe { scratch.as_mut_slice::<f32>() };
                scratch[..len].copy_from_slice(&input);
                (0..len).map(|i| scratch[i] + scratch[(i + 1) % len]).collect()
            }
            other => return Err(Error::UnsupportedOperation(other.to_string())),
        };

        unsafe { output.as_mut_slice::<f32>().copy_from_slice(&result) };
        Ok(())
    }
}

/// w = Pack(); t1 = x + w; t2 = 2 * t1 (in place); t3 = smooth(t2);
/// t4 = relu(t3) (in place); t5 = 2 * t4; y = t5 + x; outputs are [y, x]
fn model_graph() -> Graph {
    let mut graph = Graph::new();
    let names = ["x", "w", "t1", "t2", "t3", "t4", "t5", "y"];
    let v: Vec<_> = names
        .iter()
        .map(|name| graph.add_value(name, DataType::Float32, &[LEN]))
        .collect();

    graph.add_op(OpSpec::new("Pack").outputs(&[v[1]]).constant(true)).unwrap();
    graph.add_op(OpSpec::new("Add").inputs(&[v[0], v[1]]).outputs(&[v[2]])).unwrap();
    graph.add_op(OpSpec::new("Scale").inputs(&[v[2]]).outputs(&[v[3]]).inplace(0, 0)).unwrap();
    graph
        .add_op(OpSpec::new("Smooth").inputs(&[v[3]]).outputs(&[v[4]]).scratchpad(LEN * 4))
        .unwrap();
    graph.add_op(OpSpec::new("Relu").inputs(&[v[4]]).outputs(&[v[5]]).inplace(0, 0)).unwrap();
    graph.add_op(OpSpec::new("Scale").inputs(&[v[5]]).outputs(&[v[6]])).unwrap();
    graph.add_op(OpSpec::new("Add").inputs(&[v[6], v[0]]).outputs(&[v[7]])).unwrap();
    graph.set_inputs(&[v[0]]).unwrap();
    graph.set_outputs(&[v[7], v[0]]).unwrap();
    graph
}

fn expected(x: &[f32]) -> Vec<f32> {
    let t2: Vec<f32> = x.iter().enumerate().map(|(i, a)| (a + i as f32 * 0.5) * 2.0).collect();
    (0..LEN)
        .map(|i| (t2[i] + t2[(i + 1) % LEN]).max(0.0) * 2.0 + x[i])
        .collect()
}

fn input(seed: usize) -> Vec<f32> {
    (0..LEN).map(|i| (i as f32 - 8.0) * (seed as f32 + 1.0)).collect()
}

fn executor(graph: &Arc<Graph>, reuse: MemoryReuse, threads: usize) -> Result<PlanExecutor> {
    let mut planner = MemoryPlanner::new(PlannerOptions::new().set_memory_reuse(reuse))?;
    planner.run(graph)?;
    let plan: MemoryPlan = planner.into_plan().expect("plan after successful run");
    Ok(PlanExecutor::new(
        Arc::clone(graph),
        Arc::new(plan),
        ExecutionOptions::new().set_thread_count(threads),
    )?)
}

#[test]
fn test_execution_matches_reference() -> Result<()> {
    let graph = Arc::new(model_graph());
    let kernel = ReferenceKernel::default();

    for &reuse in &[MemoryReuse::Enabled, MemoryReuse::Disabled] {
        let executor = executor(&graph, reuse, 0)?;
        let mut ctx = executor.create_context()?;

        let mut x = input(0);
        let mut y = vec![0f32; LEN];
        let mut copy = vec![0f32; LEN];
        executor.execute(
            &mut ctx,
            &[MemoryRef::from_mut_slice(&mut x)],
            &[MemoryRef::from_mut_slice(&mut y), MemoryRef::from_mut_slice(&mut copy)],
            &kernel,
        )?;

        assert_eq!(y, expected(&input(0)));
        assert_eq!(copy, input(0));
        assert!(executor.constants_ready()?);
    }
    Ok(())
}

#[test]
fn test_reuse_packs_tighter_than_audit_mode() -> Result<()> {
    let graph = Arc::new(model_graph());
    let reused = executor(&graph, MemoryReuse::Enabled, 0)?;
    let audit = executor(&graph, MemoryReuse::Disabled, 0)?;
    assert!(
        reused.plan().total_internal_temporary_size() < audit.plan().total_internal_temporary_size()
    );
    assert_eq!(
        reused.plan().total_internal_persistent_size(),
        audit.plan().total_internal_persistent_size()
    );
    Ok(())
}

#[test]
fn test_constants_are_computed_once() -> Result<()> {
    let graph = Arc::new(model_graph());
    let executor = executor(&graph, MemoryReuse::Enabled, 0)?;
    let kernel = ReferenceKernel::default();
    let mut ctx = executor.create_context()?;
    assert!(!executor.constants_ready()?);

    for seed in 0..3 {
        let mut x = input(seed);
        let mut y = vec![0f32; LEN];
        let mut copy = vec![0f32; LEN];
        executor.execute(
            &mut ctx,
            &[MemoryRef::from_mut_slice(&mut x)],
            &[MemoryRef::from_mut_slice(&mut y), MemoryRef::from_mut_slice(&mut copy)],
            &kernel,
        )?;
        assert_eq!(y, expected(&input(seed)));
    }

    assert_eq!(kernel.packs.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.executions(), 3);
    Ok(())
}

#[test]
fn test_concurrent_batch_execution() -> Result<()> {
    let graph = Arc::new(model_graph());
    let executor = executor(&graph, MemoryReuse::Enabled, 4)?;
    let kernel = ReferenceKernel::default();

    let mut inputs: Vec<Vec<f32>> = (0..16).map(input).collect();
    let mut outputs: Vec<Vec<f32>> = vec![vec![0f32; LEN]; 16];
    let mut copies: Vec<Vec<f32>> = vec![vec![0f32; LEN]; 16];
    let jobs: Vec<ExecutionJob> = inputs
        .iter_mut()
        .zip(outputs.iter_mut())
        .zip(copies.iter_mut())
        .map(|((x, y), copy)| ExecutionJob {
            inputs: vec![MemoryRef::from_mut_slice(x)],
            outputs: vec![MemoryRef::from_mut_slice(y), MemoryRef::from_mut_slice(copy)],
        })
        .collect();

    executor.execute_batch(&jobs, &kernel)?;

    for (seed, (y, copy)) in outputs.iter().zip(copies.iter()).enumerate() {
        assert_eq!(y, &expected(&input(seed)), "job {} produced wrong output", seed);
        assert_eq!(copy, &input(seed));
    }
    assert_eq!(kernel.packs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_cloned_argument_sets_bind_independently_on_two_threads() -> Result<()> {
    let graph = model_graph();
    let mut planner = MemoryPlanner::new(PlannerOptions::default())?;
    planner.run(&graph)?;
    let plan = planner.plan().expect("plan after successful run");
    let template: &ExecutionArgsSet = plan.exec_args_set();

    let bind_on_thread = || -> Result<(ExecutionArgsSet, Vec<usize>)> {
        let copy = Arc::new(template.clone());
        let temporary = RegionBuffer::new(plan.total_internal_temporary_size(), plan.alignment())?;
        let persistent = RegionBuffer::new(plan.total_internal_persistent_size(), plan.alignment())?;

        let mut x = input(1);
        let mut y = vec![0f32; LEN];
        let mut copy_out = vec![0f32; LEN];
        let mut args = copy.instantiate();
        args.bind(
            &[MemoryRef::from_mut_slice(&mut x)],
            &[MemoryRef::from_mut_slice(&mut y), MemoryRef::from_mut_slice(&mut copy_out)],
            &plan.internal_temporary_grantor(temporary.as_mut_ptr())?,
            &plan.internal_persistent_grantor(persistent.as_mut_ptr())?,
        )?;

        let base = temporary.as_mut_ptr() as usize;
        let offsets = copy
            .mems_use_internal_temporary()
            .iter()
            .filter_map(|&(memory, _)| args.memory(memory))
            .filter(|handle| !handle.is_null())
            .map(|handle| handle.as_ptr() as usize - base)
            .collect();
        Ok(((*copy).clone(), offsets))
    };

    let (first, second) = std::thread::scope(|scope| {
        let first = scope.spawn(bind_on_thread);
        let second = scope.spawn(bind_on_thread);
        (first.join(), second.join())
    });
    let (first_set, first_offsets) = first.expect("thread panicked")?;
    let (second_set, second_offsets) = second.expect("thread panicked")?;

    assert_eq!(first_set, second_set);
    assert_eq!(&first_set, template);
    assert_eq!(first_offsets, second_offsets);
    assert!(!first_offsets.is_empty());
    Ok(())
}

#[test]
fn test_binding_errors() -> Result<()> {
    let graph = Arc::new(model_graph());
    let executor = executor(&graph, MemoryReuse::Enabled, 0)?;
    let mut ctx = executor.create_context()?;
    let kernel = ReferenceKernel::default();

    let mut x = input(0);
    let mut short = vec![0f32; LEN / 2];
    let mut copy = vec![0f32; LEN];
    let err = executor
        .execute(
            &mut ctx,
            &[MemoryRef::from_mut_slice(&mut x)],
            &[MemoryRef::from_mut_slice(&mut short), MemoryRef::from_mut_slice(&mut copy)],
            &kernel,
        )
        .unwrap_err();
    assert!(matches!(err, Error::BindingError(_)));

    let err = executor
        .execute(&mut ctx, &[MemoryRef::from_mut_slice(&mut x)], &[], &kernel)
        .unwrap_err();
    assert!(matches!(err, Error::BindingError(_)));

    // a context from another plan is refused
    let other = self::executor(&graph, MemoryReuse::Disabled, 0)?;
    let mut foreign = other.create_context()?;
    let mut y = vec![0f32; LEN];
    let err = executor
        .execute(
            &mut foreign,
            &[MemoryRef::from_mut_slice(&mut x)],
            &[MemoryRef::from_mut_slice(&mut y), MemoryRef::from_mut_slice(&mut copy)],
            &kernel,
        )
        .unwrap_err();
    assert!(matches!(err, Error::BindingError(_)));
    assert_eq!(ctx.executions(), 0);
    Ok(())
}

#[test]
fn test_unsupported_kernel_aborts_execution() -> Result<()> {
    let mut graph = Graph::new();
    let x = graph.add_value("x", DataType::Float32, &[LEN]);
    let y = graph.add_value("y", DataType::Float32, &[LEN]);
    graph.add_op(OpSpec::new("Mystery").inputs(&[x]).outputs(&[y]))?;
    graph.set_inputs(&[x])?;
    graph.set_outputs(&[y])?;
    let graph = Arc::new(graph);

    let executor = executor(&graph, MemoryReuse::Enabled, 0)?;
    let mut ctx = executor.create_context()?;
    let mut input = vec![0f32; LEN];
    let mut output = vec![0f32; LEN];
    let err = executor
        .execute(
            &mut ctx,
            &[MemoryRef::from_mut_slice(&mut input)],
            &[MemoryRef::from_mut_slice(&mut output)],
            &ReferenceKernel::default(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::ExecutionError(_)));
    assert!(err.to_string().contains("Mystery"));
    Ok(())
}

/// w = Pack(); y = op_type(x, w)
fn constant_then(op_type: &str) -> Result<Arc<Graph>> {
    let mut graph = Graph::new();
    let x = graph.add_value("x", DataType::Float32, &[LEN]);
    let w = graph.add_value("w", DataType::Float32, &[LEN]);
    let y = graph.add_value("y", DataType::Float32, &[LEN]);
    graph.add_op(OpSpec::new("Pack").outputs(&[w]).constant(true))?;
    graph.add_op(OpSpec::new(op_type).inputs(&[x, w]).outputs(&[y]))?;
    graph.set_inputs(&[x])?;
    graph.set_outputs(&[y])?;
    Ok(Arc::new(graph))
}

#[test]
fn test_cache_is_filled_before_per_execution_ops() -> Result<()> {
    let graph = constant_then("Mystery")?;
    let executor = executor(&graph, MemoryReuse::Enabled, 0)?;
    let kernel = ReferenceKernel::default();
    let mut ctx = executor.create_context()?;

    for _ in 0..2 {
        let mut input = vec![0f32; LEN];
        let mut output = vec![0f32; LEN];
        let result = executor.execute(
            &mut ctx,
            &[MemoryRef::from_mut_slice(&mut input)],
            &[MemoryRef::from_mut_slice(&mut output)],
            &kernel,
        );
        assert!(result.is_err());
        assert!(executor.constants_ready()?);
    }
    assert_eq!(kernel.packs.load(Ordering::SeqCst), 1);
    Ok(())
}

struct PanickingKernel;

impl Kernel for PanickingKernel {
    fn execute(&self, op: &Operation, _args: &OpArgs<'_>) -> tensor_memplan::Result<()> {
        panic!("{} crashed", op.name);
    }
}

#[test]
fn test_poisoned_cache_is_reported() -> Result<()> {
    let graph = constant_then("Add")?;
    let executor = executor(&graph, MemoryReuse::Enabled, 0)?;
    let mut ctx = executor.create_context()?;
    let mut input = vec![0f32; LEN];
    let mut output = vec![0f32; LEN];
    let inputs = [MemoryRef::from_mut_slice(&mut input)];
    let outputs = [MemoryRef::from_mut_slice(&mut output)];

    let crashed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        executor.execute(&mut ctx, &inputs, &outputs, &PanickingKernel)
    }));
    assert!(crashed.is_err());

    assert!(matches!(executor.constants_ready(), Err(Error::ExecutionError(_))));
    let err = executor
        .execute(&mut ctx, &inputs, &outputs, &ReferenceKernel::default())
        .unwrap_err();
    assert!(matches!(err, Error::ExecutionError(_)));
    Ok(())
}

#[test]
fn test_region_registry_matches_plan() -> Result<()> {
    let graph = model_graph();
    let mut planner = MemoryPlanner::new(PlannerOptions::default())?;
    planner.run(&graph)?;
    let plan = planner.plan().expect("plan after successful run");
    let region: &Registry = plan.temporary_region();
    assert!(region.is_frozen());
    assert_eq!(region.size(), plan.total_internal_temporary_size());
    assert_eq!(plan.stats().temporary_bytes, region.size());
    Ok(())
}
