use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::allocator::SlotId;
use crate::memory::planner::{BufferAssignment, BufferKind};
use crate::memory::registry::Grantor;
use crate::model::{OpId, ValueId};

/// Position of an argument in an operation's signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgRole {
    Input(usize),
    Output(usize),
    /// Op-local workspace
    Scratchpad,
}

/// Index into the memory record table of an [`ExecutionArgsSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryId(pub usize);

/// Where one distinct piece of memory lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// External index or internal slot
    pub assignment: BufferAssignment,
    /// Bytes the bound memory must provide
    pub size_bytes: usize,
    /// Value stored in this memory, `None` for scratchpads
    pub value: Option<ValueId>,
}

/// One argument of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgBinding {
    pub role: ArgRole,
    pub memory: MemoryId,
}

/// Ordered argument bindings of a single operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecArgs {
    pub op: OpId,
    /// Outputs live in the persistent region and only need computing once
    pub constant: bool,
    pub args: Vec<ArgBinding>,
}

impl ExecArgs {
    /// Memory bound to a role, if the operation has that argument
    pub fn memory_for(&self, role: ArgRole) -> Option<MemoryId> {
        self.args
            .iter()
            .find(|binding| binding.role == role)
            .map(|binding| binding.memory)
    }
}

/// Topologically ordered argument bindings for a planned graph.
///
/// Built append-only by the planner and read-only afterwards. `Clone` is a
/// deep copy; for concurrent execution prefer sharing the set through an
/// `Arc` and calling [`ExecutionArgsSet::instantiate`] once per thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionArgsSet {
    memories: Vec<MemoryRecord>,
    mems_use_external_inputs: Vec<(MemoryId, usize)>,
    mems_use_external_outputs: Vec<(MemoryId, usize)>,
    mems_use_internal_temporary: Vec<(MemoryId, SlotId)>,
    mems_use_internal_persistent: Vec<(MemoryId, SlotId)>,
    value_mem_map: HashMap<ValueId, MemoryId>,
    topo_ordered_exec_args: Vec<ExecArgs>,
    external_inputs: usize,
    external_outputs: usize,
}

impl ExecutionArgsSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a piece of memory and return its id
    pub fn add_memory(&mut self, record: MemoryRecord) -> MemoryId {
        let id = MemoryId(self.memories.len());
        self.memories.push(record);
        id
    }

    pub fn add_value_mem_map(&mut self, value: ValueId, memory: MemoryId) {
        self.value_mem_map.insert(value, memory);
    }

    pub fn add_mem_use_external_input(&mut self, memory: MemoryId, index: usize) {
        self.mems_use_external_inputs.push((memory, index));
    }

    pub fn add_mem_use_external_output(&mut self, memory: MemoryId, index: usize) {
        self.mems_use_external_outputs.push((memory, index));
    }

    pub fn add_mem_use_internal_temporary(&mut self, memory: MemoryId, slot: SlotId) {
        self.mems_use_internal_temporary.push((memory, slot));
    }

    pub fn add_mem_use_internal_persistent(&mut self, memory: MemoryId, slot: SlotId) {
        self.mems_use_internal_persistent.push((memory, slot));
    }

    /// Append the bindings of the next operation in execution order
    pub fn add_exec_args(&mut self, exec_args: ExecArgs) {
        self.topo_ordered_exec_args.push(exec_args);
    }

    /// Number of external buffers a binding must supply
    pub fn set_external_counts(&mut self, inputs: usize, outputs: usize) {
        self.external_inputs = inputs;
        self.external_outputs = outputs;
    }

    pub fn exec_args(&self) -> &[ExecArgs] {
        &self.topo_ordered_exec_args
    }

    pub fn find_value_mem(&self, value: ValueId) -> Option<MemoryId> {
        self.value_mem_map.get(&value).copied()
    }

    pub fn memory(&self, id: MemoryId) -> Option<&MemoryRecord> {
        self.memories.get(id.0)
    }

    pub fn memories(&self) -> &[MemoryRecord] {
        &self.memories
    }

    pub fn mems_use_external_inputs(&self) -> &[(MemoryId, usize)] {
        &self.mems_use_external_inputs
    }

    pub fn mems_use_external_outputs(&self) -> &[(MemoryId, usize)] {
        &self.mems_use_external_outputs
    }

    pub fn mems_use_internal_temporary(&self) -> &[(MemoryId, SlotId)] {
        &self.mems_use_internal_temporary
    }

    pub fn mems_use_internal_persistent(&self) -> &[(MemoryId, SlotId)] {
        &self.mems_use_internal_persistent
    }

    pub fn external_inputs(&self) -> usize {
        self.external_inputs
    }

    pub fn external_outputs(&self) -> usize {
        self.external_outputs
    }

    pub fn clear(&mut self) {
        self.memories.clear();
        self.mems_use_external_inputs.clear();
        self.mems_use_external_outputs.clear();
        self.mems_use_internal_temporary.clear();
        self.mems_use_internal_persistent.clear();
        self.value_mem_map.clear();
        self.topo_ordered_exec_args.clear();
        self.external_inputs = 0;
        self.external_outputs = 0;
    }

    /// Create an unbound per-thread handle table sharing this template
    pub fn instantiate(self: &Arc<Self>) -> BoundArgs {
        BoundArgs {
            template: Arc::clone(self),
            handles: vec![MemoryRef::null(); self.memories.len()],
            bound: false,
        }
    }
}

/// Raw view of bound memory handed to kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRef {
    ptr: *mut u8,
    len: usize,
}

// Handles are plain addresses; exclusivity is guaranteed by the plan layout.
unsafe impl Send for MemoryRef {}
unsafe impl Sync for MemoryRef {}

impl MemoryRef {
    pub fn null() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }

    pub fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// View a caller buffer as untyped memory
    pub fn from_mut_slice<T: Copy>(data: &mut [T]) -> Self {
        Self {
            ptr: data.as_mut_ptr() as *mut u8,
            len: std::mem::size_of_val(data),
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// # Safety
    /// The memory must be valid for reads of `len` bytes, suitably aligned
    /// for `T`, and not written through another handle while the slice lives.
    pub unsafe fn as_slice<'a, T: Copy>(&self) -> &'a [T] {
        if self.is_null() {
            return &[];
        }
        std::slice::from_raw_parts(self.ptr as *const T, self.len / std::mem::size_of::<T>())
    }

    /// # Safety
    /// The memory must be valid for writes of `len` bytes, suitably aligned
    /// for `T`, and not accessed through another handle while the slice lives.
    pub unsafe fn as_mut_slice<'a, T: Copy>(&self) -> &'a mut [T] {
        if self.is_null() {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.ptr as *mut T, self.len / std::mem::size_of::<T>())
    }
}

/// Per-thread materialization of an [`ExecutionArgsSet`]
#[derive(Debug, Clone)]
pub struct BoundArgs {
    template: Arc<ExecutionArgsSet>,
    handles: Vec<MemoryRef>,
    bound: bool,
}

impl BoundArgs {
    pub fn template(&self) -> &Arc<ExecutionArgsSet> {
        &self.template
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Resolve every memory record against concrete buffers
    pub fn bind(
        &mut self,
        inputs: &[MemoryRef],
        outputs: &[MemoryRef],
        temporary: &Grantor<'_>,
        persistent: &Grantor<'_>,
    ) -> Result<()> {
        self.bound = false;
        let template = &self.template;
        if inputs.len() != template.external_inputs() {
            return Err(Error::BindingError(format!(
                "Expected {} input buffers, got {}",
                template.external_inputs(),
                inputs.len()
            )));
        }
        if outputs.len() != template.external_outputs() {
            return Err(Error::BindingError(format!(
                "Expected {} output buffers, got {}",
                template.external_outputs(),
                outputs.len()
            )));
        }

        for (index, record) in template.memories().iter().enumerate() {
            let slot = SlotId(record.assignment.index);
            let handle = match record.assignment.kind {
                BufferKind::ExternalInput => external(inputs, record, "input")?,
                BufferKind::ExternalOutput => external(outputs, record, "output")?,
                BufferKind::InternalTemporary => internal(temporary, slot, record)?,
                BufferKind::InternalPersistent => internal(persistent, slot, record)?,
            };
            self.handles[index] = handle;
        }

        self.bound = true;
        Ok(())
    }

    pub fn memory(&self, id: MemoryId) -> Option<MemoryRef> {
        self.handles.get(id.0).copied()
    }

    /// Number of operations in the bound sequence
    pub fn len(&self) -> usize {
        self.template.exec_args().len()
    }

    pub fn is_empty(&self) -> bool {
        self.template.exec_args().is_empty()
    }

    /// Arguments of the `index`-th operation in execution order
    pub fn op_args(&self, index: usize) -> Option<OpArgs<'_>> {
        let exec_args = self.template.exec_args().get(index)?;
        Some(OpArgs {
            exec_args,
            handles: &self.handles,
        })
    }
}

fn external(buffers: &[MemoryRef], record: &MemoryRecord, what: &str) -> Result<MemoryRef> {
    let index = record.assignment.index;
    let buffer = buffers[index];
    if buffer.len() < record.size_bytes {
        return Err(Error::BindingError(format!(
            "External {} {} holds {} bytes but {} are required",
            what,
            index,
            buffer.len(),
            record.size_bytes
        )));
    }
    if record.size_bytes > 0 && buffer.is_null() {
        return Err(Error::BindingError(format!("External {} {} is null", what, index)));
    }
    Ok(MemoryRef::new(buffer.as_ptr(), record.size_bytes))
}

fn internal(grantor: &Grantor<'_>, slot: SlotId, record: &MemoryRecord) -> Result<MemoryRef> {
    if slot.is_none() || record.size_bytes == 0 {
        return Ok(MemoryRef::null());
    }
    match grantor.get_with_size(slot) {
        Some((ptr, size)) if size >= record.size_bytes => Ok(MemoryRef::new(ptr, record.size_bytes)),
        Some((_, size)) => Err(Error::BindingError(format!(
            "Slot {} holds {} bytes but {} are required",
            slot, size, record.size_bytes
        ))),
        None => Err(Error::BindingError(format!("Slot {} is not part of the region", slot))),
    }
}

/// Bound arguments of one operation
#[derive(Debug, Clone, Copy)]
pub struct OpArgs<'a> {
    exec_args: &'a ExecArgs,
    handles: &'a [MemoryRef],
}

impl<'a> OpArgs<'a> {
    pub fn op(&self) -> OpId {
        self.exec_args.op
    }

    pub fn is_constant(&self) -> bool {
        self.exec_args.constant
    }

    pub fn get(&self, role: ArgRole) -> Option<MemoryRef> {
        self.exec_args
            .memory_for(role)
            .and_then(|memory| self.handles.get(memory.0).copied())
    }

    pub fn input(&self, index: usize) -> Option<MemoryRef> {
        self.get(ArgRole::Input(index))
    }

    pub fn output(&self, index: usize) -> Option<MemoryRef> {
        self.get(ArgRole::Output(index))
    }

    pub fn scratchpad(&self) -> Option<MemoryRef> {
        self.get(ArgRole::Scratchpad)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArgRole, MemoryRef)> + 'a {
        let handles = self.handles;
        let exec_args = self.exec_args;
        exec_args
            .args
            .iter()
            .map(move |binding| (binding.role, handles[binding.memory.0]))
    }
}
