use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};
use crate::memory::alias::AliasMap;
use crate::memory::allocator::{BufferAssigner, SlotId};
use crate::memory::exec_args::{ArgBinding, ArgRole, ExecArgs, ExecutionArgsSet, MemoryId, MemoryRecord};
use crate::memory::registry::{Grantor, Registry, DEFAULT_ALIGNMENT};
use crate::model::{Graph, OpId, Operation, ValueId};

/// Default tolerance ratio of both slot assigners
pub const DEFAULT_MATCH_RANGE: usize = 16;

/// Which address space a value lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    /// Caller-supplied input buffer
    ExternalInput,
    /// Caller-supplied output buffer
    ExternalOutput,
    /// Slot of the per-execution temporary region
    InternalTemporary,
    /// Slot of the shared persistent region
    InternalPersistent,
}

/// `(kind, index)` pair every planned value resolves to.
///
/// External kinds index the caller's input or output list, internal kinds
/// carry a slot id of the matching region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferAssignment {
    pub kind: BufferKind,
    pub index: usize,
}

impl BufferAssignment {
    pub fn external_input(index: usize) -> Self {
        Self { kind: BufferKind::ExternalInput, index }
    }

    pub fn external_output(index: usize) -> Self {
        Self { kind: BufferKind::ExternalOutput, index }
    }

    pub fn temporary(slot: SlotId) -> Self {
        Self { kind: BufferKind::InternalTemporary, index: slot.0 }
    }

    pub fn persistent(slot: SlotId) -> Self {
        Self { kind: BufferKind::InternalPersistent, index: slot.0 }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.kind, BufferKind::ExternalInput | BufferKind::ExternalOutput)
    }

    /// Slot id for internal assignments
    pub fn slot(&self) -> Option<SlotId> {
        if self.is_external() {
            None
        } else {
            Some(SlotId(self.index))
        }
    }
}

impl fmt::Display for BufferAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            BufferKind::ExternalInput => write!(f, "external_in_{}", self.index),
            BufferKind::ExternalOutput => write!(f, "external_out_{}", self.index),
            BufferKind::InternalTemporary => write!(f, "temporary_{}", SlotId(self.index)),
            BufferKind::InternalPersistent => write!(f, "persistent_{}", SlotId(self.index)),
        }
    }
}

/// Whether released temporary slots may be handed to later values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MemoryReuse {
    /// Liveness-based slot sharing
    Enabled,
    /// One slot per value, for auditing reuse bugs
    Disabled,
}

impl Default for MemoryReuse {
    fn default() -> Self {
        MemoryReuse::Enabled
    }
}

/// Options for the memory planner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerOptions {
    /// Buffer reuse toggle
    pub memory_reuse: MemoryReuse,
    /// Tolerance ratio of the slot assigners (0 = exact fresh slots)
    pub match_range: usize,
    /// Alignment of every slot offset in bytes
    pub alignment: usize,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            memory_reuse: MemoryReuse::Enabled,
            match_range: DEFAULT_MATCH_RANGE,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl PlannerOptions {
    /// Create a new planner options object
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable buffer reuse
    pub fn set_memory_reuse(mut self, memory_reuse: MemoryReuse) -> Self {
        self.memory_reuse = memory_reuse;
        self
    }

    /// Set the slot matching tolerance
    pub fn set_match_range(mut self, match_range: usize) -> Self {
        self.match_range = match_range;
        self
    }

    /// Set the region alignment
    pub fn set_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    fn reuse_enabled(&self) -> bool {
        self.memory_reuse == MemoryReuse::Enabled
    }
}

/// Figures describing how well a plan packs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStats {
    /// Values with a buffer assignment
    pub planned_values: usize,
    /// In-place aliases that were honored
    pub aliases: usize,
    /// Bytes requested from the temporary assigner, scratchpads included
    pub requested_temporary_bytes: usize,
    /// Size of the packed temporary region
    pub temporary_bytes: usize,
    /// Size of the packed persistent region
    pub persistent_bytes: usize,
    pub temporary_slots: usize,
    pub persistent_slots: usize,
    /// Temporary requests served by a released slot
    pub temporary_reuses: usize,
}

impl PlanStats {
    /// Bytes saved by slot sharing compared to one slot per request
    pub fn bytes_saved(&self) -> usize {
        self.requested_temporary_bytes.saturating_sub(self.temporary_bytes)
    }
}

/// Per-value entry of a [`PlanSummary`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMemoryInfo {
    pub value: ValueId,
    pub name: String,
    pub size_bytes: usize,
    pub assignment: BufferAssignment,
    pub memory_info: String,
    /// Offset inside the owning internal region
    pub offset: Option<usize>,
}

/// Serializable description of a finished plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub memory_reuse: MemoryReuse,
    pub alignment: usize,
    pub stats: PlanStats,
    pub execution_order: Vec<OpId>,
    pub pass_throughs: Vec<(usize, usize)>,
    pub values: Vec<ValueMemoryInfo>,
}

/// Immutable result of a planning pass
#[derive(Debug, Clone)]
pub struct MemoryPlan {
    options: PlannerOptions,
    assignments: BTreeMap<ValueId, BufferAssignment>,
    values: Vec<ValueMemoryInfo>,
    temporary_region: Registry,
    persistent_region: Registry,
    exec_args: Arc<ExecutionArgsSet>,
    execution_order: Vec<OpId>,
    pass_throughs: Vec<(usize, usize)>,
    stats: PlanStats,
}

impl MemoryPlan {
    /// Bytes each executor must provide for its temporary region
    pub fn total_internal_temporary_size(&self) -> usize {
        self.temporary_region.size()
    }

    /// Bytes of the shared persistent region
    pub fn total_internal_persistent_size(&self) -> usize {
        self.persistent_region.size()
    }

    pub fn internal_temporary_grantor(&self, base: *mut u8) -> Result<Grantor<'_>> {
        self.temporary_region.grantor(base)
    }

    pub fn internal_persistent_grantor(&self, base: *mut u8) -> Result<Grantor<'_>> {
        self.persistent_region.grantor(base)
    }

    pub fn temporary_region(&self) -> &Registry {
        &self.temporary_region
    }

    pub fn persistent_region(&self) -> &Registry {
        &self.persistent_region
    }

    /// Alignment required of region base addresses
    pub fn alignment(&self) -> usize {
        self.options.alignment
    }

    pub fn options(&self) -> &PlannerOptions {
        &self.options
    }

    pub fn exec_args_set(&self) -> &Arc<ExecutionArgsSet> {
        &self.exec_args
    }

    pub fn assignment(&self, value: ValueId) -> Option<BufferAssignment> {
        self.assignments.get(&value).copied()
    }

    /// Human-readable buffer name such as `temporary_3`
    pub fn memory_info(&self, value: ValueId) -> Option<String> {
        self.assignment(value).map(|assignment| assignment.to_string())
    }

    pub fn execution_order(&self) -> &[OpId] {
        &self.execution_order
    }

    /// `(input index, output index)` of values that are both graph input and output
    pub fn pass_throughs(&self) -> &[(usize, usize)] {
        &self.pass_throughs
    }

    pub fn stats(&self) -> &PlanStats {
        &self.stats
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            memory_reuse: self.options.memory_reuse,
            alignment: self.options.alignment,
            stats: self.stats.clone(),
            execution_order: self.execution_order.clone(),
            pass_throughs: self.pass_throughs.clone(),
            values: self.values.clone(),
        }
    }

    /// Export the plan summary as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.summary())?)
    }

    /// Write the plan summary to a JSON file
    pub fn write_summary<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Compile-time planner assigning every value of a graph to a buffer.
///
/// One planner handles one graph at a time: [`MemoryPlanner::run`] fails
/// with [`Error::InvalidState`] while a plan is held, until
/// [`MemoryPlanner::clear`] is called.
#[derive(Debug)]
pub struct MemoryPlanner {
    options: PlannerOptions,
    /// In-place alias chains
    aliases: AliasMap,
    assignments: HashMap<ValueId, BufferAssignment>,
    /// Remaining uses per value
    uses: HashMap<ValueId, usize>,
    /// Remaining uses per live temporary slot
    slot_uses: HashMap<SlotId, usize>,
    persistent_slots: BufferAssigner,
    temporary_slots: BufferAssigner,
    persistent_region: Registry,
    temporary_region: Registry,
    exec_args: ExecutionArgsSet,
    scratchpads: HashMap<OpId, SlotId>,
    pass_throughs: Vec<(usize, usize)>,
    requested_temporary_bytes: usize,
    order: Vec<OpId>,
    plan: Option<MemoryPlan>,
}

impl MemoryPlanner {
    /// Create a planner, validating the options
    pub fn new(options: PlannerOptions) -> Result<Self> {
        let region = Registry::new(options.alignment)?;
        Ok(Self {
            aliases: AliasMap::new(),
            assignments: HashMap::new(),
            uses: HashMap::new(),
            slot_uses: HashMap::new(),
            persistent_slots: BufferAssigner::new(options.match_range),
            temporary_slots: BufferAssigner::new(options.match_range),
            persistent_region: region.clone(),
            temporary_region: region,
            exec_args: ExecutionArgsSet::new(),
            scratchpads: HashMap::new(),
            pass_throughs: Vec::new(),
            requested_temporary_bytes: 0,
            order: Vec::new(),
            plan: None,
            options,
        })
    }

    pub fn options(&self) -> &PlannerOptions {
        &self.options
    }

    /// Plan memory for a graph
    pub fn run(&mut self, graph: &Graph) -> Result<()> {
        if self.plan.is_some() {
            return Err(Error::InvalidState(
                "A plan already exists; call clear() before planning again".to_string(),
            ));
        }

        match self.plan_graph(graph) {
            Ok(plan) => {
                debug!(
                    "planned {} values: temporary {} bytes in {} slots, persistent {} bytes in {} slots",
                    plan.stats.planned_values,
                    plan.stats.temporary_bytes,
                    plan.stats.temporary_slots,
                    plan.stats.persistent_bytes,
                    plan.stats.persistent_slots
                );
                self.plan = Some(plan);
                Ok(())
            }
            Err(err) => {
                warn!("memory planning failed: {}", err);
                self.clear();
                Err(err)
            }
        }
    }

    pub fn is_planned(&self) -> bool {
        self.plan.is_some()
    }

    pub fn plan(&self) -> Option<&MemoryPlan> {
        self.plan.as_ref()
    }

    pub fn into_plan(self) -> Option<MemoryPlan> {
        self.plan
    }

    pub fn memory_info(&self, value: ValueId) -> Option<String> {
        self.plan.as_ref()?.memory_info(value)
    }

    /// Drop the current plan and all working state
    pub fn clear(&mut self) {
        self.aliases.clear();
        self.assignments.clear();
        self.uses.clear();
        self.slot_uses.clear();
        self.persistent_slots.clear();
        self.temporary_slots.clear();
        self.persistent_region.clear();
        self.temporary_region.clear();
        self.exec_args.clear();
        self.scratchpads.clear();
        self.pass_throughs.clear();
        self.requested_temporary_bytes = 0;
        self.order.clear();
        self.plan = None;
    }

    fn plan_graph(&mut self, graph: &Graph) -> Result<MemoryPlan> {
        self.order = graph.topological_order()?;

        self.bind_external_inputs(graph);
        self.bind_external_outputs(graph)?;
        self.discover_aliases(graph)?;
        self.count_uses(graph)?;
        self.assign_persistent(graph)?;
        self.assign_temporary(graph)?;
        self.book_regions()?;
        self.materialize_exec_args(graph)?;

        self.build_plan(graph)
    }

    fn bind_external_inputs(&mut self, graph: &Graph) {
        for (index, &input) in graph.inputs().iter().enumerate() {
            self.assignments.insert(input, BufferAssignment::external_input(index));
        }
    }

    fn bind_external_outputs(&mut self, graph: &Graph) -> Result<()> {
        for (index, &output) in graph.outputs().iter().enumerate() {
            if let Some(existing) = self.assignments.get(&output) {
                // pass-through keeps the input binding
                debug!("value {} passes through from input {} to output {}", output, existing.index, index);
                self.pass_throughs.push((existing.index, index));
                continue;
            }

            let value = graph.value(output)?;
            if value.producer.is_none() {
                return Err(Error::InvalidGraph(format!(
                    "Graph output {} is neither produced by an operation nor a graph input",
                    value.name
                )));
            }
            self.assignments.insert(output, BufferAssignment::external_output(index));
        }
        Ok(())
    }

    fn discover_aliases(&mut self, graph: &Graph) -> Result<()> {
        let position: HashMap<OpId, usize> =
            self.order.iter().enumerate().map(|(index, &op)| (op, index)).collect();

        for &op_id in &self.order {
            let op = graph.op(op_id)?;
            for pair in &op.inplace {
                let input = op.inputs[pair.input_index];
                let output = op.outputs[pair.output_index];
                if let Some(reason) = self.alias_conflict(graph, op, input, output, &position)? {
                    warn!(
                        "{} cannot write {} in place of {}: {}; running out of place",
                        op.name, output, input, reason
                    );
                    continue;
                }

                let root = self.aliases.resolve(input);
                self.aliases.record_alias(output, input)?;

                let output_binding = self.assignments.get(&output).copied();
                match (output_binding, self.assignments.get(&root).copied()) {
                    (Some(binding), None) => {
                        // the producer chain writes straight into the user buffer
                        for member in self.aliases.group(root) {
                            self.assignments.insert(member, binding);
                        }
                    }
                    (None, Some(binding)) => {
                        self.assignments.insert(output, binding);
                    }
                    _ => {}
                }
                trace!("{} aliases {} (root {})", output, input, root);
            }
        }

        debug!("recorded {} in-place aliases", self.aliases.len());
        Ok(())
    }

    /// Reason an in-place pair has to be ignored, if any
    fn alias_conflict(
        &self,
        graph: &Graph,
        op: &Operation,
        input: ValueId,
        output: ValueId,
        position: &HashMap<OpId, usize>,
    ) -> Result<Option<String>> {
        let input_value = graph.value(input)?;
        let output_value = graph.value(output)?;
        if input_value.size_in_bytes()? != output_value.size_in_bytes()? {
            return Ok(Some("sizes differ".to_string()));
        }

        let here = position.get(&op.id).copied().unwrap_or(0);
        let read_later = input_value
            .consumers
            .iter()
            .any(|consumer| *consumer != op.id && position.get(consumer).map_or(false, |&at| at > here));
        if read_later {
            return Ok(Some(format!("{} is still read by later operations", input)));
        }

        // a buffer has at most one in-place writer, any other output of the same op stays live
        if let Some(&other) = self.aliases.aliases_of(input).first() {
            return Ok(Some(format!("{} is already overwritten by {}", input, other)));
        }

        let root = self.aliases.resolve(input);
        if let Some(member) = self
            .aliases
            .group(root)
            .into_iter()
            .find(|&member| member != output && graph.is_output(member))
        {
            return Ok(Some(format!("{} is a graph output", member)));
        }

        let root_constant = match graph.value(root)?.producer {
            Some(producer) => graph.op(producer)?.constant,
            None => false,
        };
        if root_constant != op.constant {
            return Ok(Some("constant and per-execution buffers cannot be shared".to_string()));
        }

        if let (Some(out), Some(resolved)) = (self.assignments.get(&output), self.assignments.get(&root)) {
            if out != resolved {
                return Ok(Some(format!("{} is already bound to {}", root, resolved)));
            }
        }

        Ok(None)
    }

    fn count_uses(&mut self, graph: &Graph) -> Result<()> {
        for &op_id in &self.order {
            let op = graph.op(op_id)?;
            for &input in &op.inputs {
                let value = graph.value(input)?;
                if value.producer.is_none() && !self.assignments.contains_key(&input) {
                    return Err(Error::InvalidGraph(format!(
                        "Value {} is consumed by {} but is neither produced nor a graph input",
                        value.name, op.name
                    )));
                }
            }
        }

        for value in graph.values() {
            let uses = value.consumers.len() + usize::from(graph.is_output(value.id));
            self.uses.insert(value.id, uses);
        }
        Ok(())
    }

    fn assign_persistent(&mut self, graph: &Graph) -> Result<()> {
        for &op_id in &self.order {
            let op = graph.op(op_id)?;
            if !op.constant {
                continue;
            }
            for &output in &op.outputs {
                if self.assignments.contains_key(&output) || self.aliases.contains(output) {
                    continue;
                }
                let size = graph.value(output)?.size_in_bytes()?;
                let binding = BufferAssignment::persistent(self.persistent_slots.request(size));
                for member in self.aliases.group(output) {
                    self.assignments.entry(member).or_insert(binding);
                }
                trace!("{} -> {} ({} bytes)", output, binding, size);
            }
        }
        Ok(())
    }

    fn assign_temporary(&mut self, graph: &Graph) -> Result<()> {
        let reuse = self.options.reuse_enabled();

        for &op_id in &self.order {
            let op = graph.op(op_id)?;

            for &output in &op.outputs {
                if self.assignments.contains_key(&output) || !self.aliases.contains(output) {
                    continue;
                }
                let root = self.aliases.resolve(output);
                let binding = *self.assignments.get(&root).ok_or_else(|| {
                    Error::InvalidState(format!("Alias root {} of {} has no buffer", root, output))
                })?;
                self.assignments.insert(output, binding);
                if let Some(slot) = self.temporary_slot_of(output) {
                    let uses = self.uses_of(output);
                    *self.slot_uses.entry(slot).or_insert(0) += uses;
                }
            }

            for &output in &op.outputs {
                if self.assignments.contains_key(&output) {
                    continue;
                }
                let size = graph.value(output)?.size_in_bytes()?;
                let slot = self.temporary_slots.request(size);
                self.assignments.insert(output, BufferAssignment::temporary(slot));
                self.requested_temporary_bytes += size;
                if !slot.is_none() {
                    let uses = self.uses_of(output);
                    self.slot_uses.insert(slot, uses);
                }
                trace!("{} -> temporary_{} ({} bytes)", output, slot, size);
            }

            let scratchpad = self.temporary_slots.request(op.scratchpad_bytes);
            if !scratchpad.is_none() {
                self.requested_temporary_bytes += op.scratchpad_bytes;
                self.scratchpads.insert(op_id, scratchpad);
            }

            for &input in &op.inputs {
                let Some(slot) = self.temporary_slot_of(input) else {
                    continue;
                };
                let remaining = self
                    .slot_uses
                    .get_mut(&slot)
                    .unwrap_or_else(|| panic!("temporary slot {} has no use count", slot));
                assert!(*remaining > 0, "use count of temporary slot {} went negative", slot);
                *remaining -= 1;
                if *remaining == 0 && reuse {
                    self.temporary_slots.release(slot);
                }
            }

            if reuse {
                self.temporary_slots.release(scratchpad);
                for &output in &op.outputs {
                    if let Some(slot) = self.temporary_slot_of(output) {
                        let dead = self.slot_uses.get(&slot).map_or(true, |&count| count == 0);
                        if dead && !self.temporary_slots.is_free(slot) {
                            self.temporary_slots.release(slot);
                        }
                    }
                }
            }
        }

        debug!(
            "assigned {} temporary slots ({} reused) for {} requested bytes",
            self.temporary_slots.slot_count(),
            self.temporary_slots.reuse_count(),
            self.requested_temporary_bytes
        );
        Ok(())
    }

    fn uses_of(&self, value: ValueId) -> usize {
        self.uses.get(&value).copied().unwrap_or(0)
    }

    fn temporary_slot_of(&self, value: ValueId) -> Option<SlotId> {
        self.assignments
            .get(&value)
            .filter(|binding| binding.kind == BufferKind::InternalTemporary)
            .and_then(BufferAssignment::slot)
            .filter(|slot| !slot.is_none())
    }

    fn book_regions(&mut self) -> Result<()> {
        for index in 0..self.temporary_slots.slot_count() {
            let slot = SlotId(index);
            self.temporary_region.book(slot, self.temporary_slots.query_size(slot))?;
        }
        for index in 0..self.persistent_slots.slot_count() {
            let slot = SlotId(index);
            self.persistent_region.book(slot, self.persistent_slots.query_size(slot))?;
        }
        self.temporary_region.freeze();
        self.persistent_region.freeze();
        Ok(())
    }

    fn materialize_exec_args(&mut self, graph: &Graph) -> Result<()> {
        self.exec_args
            .set_external_counts(graph.inputs().len(), graph.outputs().len());

        let order = self.order.clone();
        for &op_id in &order {
            let op = graph.op(op_id)?;
            let mut args = Vec::with_capacity(op.inputs.len() + op.outputs.len() + 1);

            for (index, &input) in op.inputs.iter().enumerate() {
                let memory = self.value_memory(graph, input)?;
                args.push(ArgBinding { role: ArgRole::Input(index), memory });
            }
            for (index, &output) in op.outputs.iter().enumerate() {
                let memory = self.value_memory(graph, output)?;
                args.push(ArgBinding { role: ArgRole::Output(index), memory });
            }
            if let Some(&slot) = self.scratchpads.get(&op_id) {
                let memory = self.exec_args.add_memory(MemoryRecord {
                    assignment: BufferAssignment::temporary(slot),
                    size_bytes: op.scratchpad_bytes,
                    value: None,
                });
                self.exec_args.add_mem_use_internal_temporary(memory, slot);
                args.push(ArgBinding { role: ArgRole::Scratchpad, memory });
            }

            // only fully persistent producers can be cached across runs
            let constant = op.constant
                && op.outputs.iter().all(|output| {
                    self.assignments
                        .get(output)
                        .map_or(false, |binding| binding.kind == BufferKind::InternalPersistent)
                });
            self.exec_args.add_exec_args(ExecArgs { op: op_id, constant, args });
        }
        Ok(())
    }

    fn value_memory(&mut self, graph: &Graph, value: ValueId) -> Result<MemoryId> {
        if let Some(memory) = self.exec_args.find_value_mem(value) {
            return Ok(memory);
        }
        let assignment = *self.assignments.get(&value).ok_or_else(|| {
            Error::InvalidState(format!("Value {} has no buffer assignment", value))
        })?;
        let memory = self.exec_args.add_memory(MemoryRecord {
            assignment,
            size_bytes: graph.value(value)?.size_in_bytes()?,
            value: Some(value),
        });

        match assignment.kind {
            BufferKind::ExternalInput => self.exec_args.add_mem_use_external_input(memory, assignment.index),
            BufferKind::ExternalOutput => self.exec_args.add_mem_use_external_output(memory, assignment.index),
            BufferKind::InternalTemporary => {
                self.exec_args.add_mem_use_internal_temporary(memory, SlotId(assignment.index))
            }
            BufferKind::InternalPersistent => {
                self.exec_args.add_mem_use_internal_persistent(memory, SlotId(assignment.index))
            }
        }
        self.exec_args.add_value_mem_map(value, memory);
        Ok(memory)
    }

    fn build_plan(&self, graph: &Graph) -> Result<MemoryPlan> {
        let mut values = Vec::with_capacity(self.assignments.len());
        for value in graph.values() {
            let Some(&assignment) = self.assignments.get(&value.id) else {
                continue;
            };
            let offset = match assignment.kind {
                BufferKind::InternalTemporary => self.temporary_region.offset(SlotId(assignment.index)),
                BufferKind::InternalPersistent => self.persistent_region.offset(SlotId(assignment.index)),
                _ => None,
            };
            values.push(ValueMemoryInfo {
                value: value.id,
                name: value.name.clone(),
                size_bytes: value.size_in_bytes()?,
                assignment,
                memory_info: assignment.to_string(),
                offset,
            });
        }

        let stats = PlanStats {
            planned_values: values.len(),
            aliases: self.aliases.len(),
            requested_temporary_bytes: self.requested_temporary_bytes,
            temporary_bytes: self.temporary_region.size(),
            persistent_bytes: self.persistent_region.size(),
            temporary_slots: self.temporary_slots.slot_count(),
            persistent_slots: self.persistent_slots.slot_count(),
            temporary_reuses: self.temporary_slots.reuse_count(),
        };

        Ok(MemoryPlan {
            options: self.options.clone(),
            assignments: self.assignments.iter().map(|(&value, &binding)| (value, binding)).collect(),
            values,
            temporary_region: self.temporary_region.clone(),
            persistent_region: self.persistent_region.clone(),
            exec_args: Arc::new(self.exec_args.clone()),
            execution_order: self.order.clone(),
            pass_throughs: self.pass_throughs.clone(),
            stats,
        })
    }
}
