use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::mem::size_of;

use num_complex::Complex;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};

/// Handle of a value (graph edge) inside a [`Graph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub usize);

/// Handle of an operation (graph node) inside a [`Graph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub usize);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Element types understood by the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum DataType {
    Float32,
    Float64,
    Float16,
    BFloat16,
    Int8,
    Uint8,
    Int32,
    Int64,
    Bool,
    Complex64,
}

impl DataType {
    /// Size of a single element in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Float32 => size_of::<f32>(),
            DataType::Float64 => size_of::<f64>(),
            DataType::Float16 => size_of::<half::f16>(),
            DataType::BFloat16 => size_of::<half::bf16>(),
            DataType::Int8 => size_of::<i8>(),
            DataType::Uint8 => size_of::<u8>(),
            DataType::Int32 => size_of::<i32>(),
            DataType::Int64 => size_of::<i64>(),
            DataType::Bool => size_of::<bool>(),
            DataType::Complex64 => size_of::<Complex<f32>>(),
        }
    }
}

/// A tensor flowing between operations
#[derive(Debug, Clone)]
pub struct Value {
    pub id: ValueId,
    pub name: String,
    pub data_type: DataType,
    pub shape: Vec<usize>,
    /// Producing operation, `None` for graph-level tensors
    pub producer: Option<OpId>,
    /// Consuming operations, one entry per input occurrence
    pub consumers: Vec<OpId>,
}

impl Value {
    /// Number of elements described by the shape
    pub fn element_count(&self) -> Result<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| {
                Error::InvalidGraph(format!(
                    "Integer overflow calculating element count for value {} with shape {:?}",
                    self.name, self.shape
                ))
            })
    }

    /// Byte footprint of the value
    pub fn size_in_bytes(&self) -> Result<usize> {
        let element_size = self.data_type.size_in_bytes();
        self.element_count()?.checked_mul(element_size).ok_or_else(|| {
            Error::InvalidGraph(format!(
                "Integer overflow calculating size for value {} with shape {:?} of {}",
                self.name, self.shape, self.data_type
            ))
        })
    }
}

/// Declares that an output overwrites one of the inputs in place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InplacePair {
    pub input_index: usize,
    pub output_index: usize,
}

/// Node in the computation graph
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OpId,
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub inplace: Vec<InplacePair>,
    /// Op-local workspace, live only while the operation runs
    pub scratchpad_bytes: usize,
    /// Outputs are cached across executions (e.g. reordered weights)
    pub constant: bool,
}

/// Description of an operation to add to a [`Graph`]
#[derive(Debug, Clone, Default)]
pub struct OpSpec {
    name: Option<String>,
    op_type: String,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    inplace: Vec<InplacePair>,
    scratchpad_bytes: usize,
    constant: bool,
}

impl OpSpec {
    /// Start describing an operation of the given type
    pub fn new(op_type: &str) -> Self {
        Self {
            op_type: op_type.to_string(),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn inputs(mut self, inputs: &[ValueId]) -> Self {
        self.inputs = inputs.to_vec();
        self
    }

    pub fn outputs(mut self, outputs: &[ValueId]) -> Self {
        self.outputs = outputs.to_vec();
        self
    }

    /// Let output `output_index` overwrite input `input_index`
    pub fn inplace(mut self, input_index: usize, output_index: usize) -> Self {
        self.inplace.push(InplacePair { input_index, output_index });
        self
    }

    pub fn scratchpad(mut self, bytes: usize) -> Self {
        self.scratchpad_bytes = bytes;
        self
    }

    pub fn constant(mut self, constant: bool) -> Self {
        self.constant = constant;
        self
    }
}

/// Arena of values and operations making up a compiled subgraph
#[derive(Debug, Clone, Default)]
pub struct Graph {
    values: Vec<Value>,
    ops: Vec<Operation>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value with a concrete shape
    pub fn add_value(&mut self, name: &str, data_type: DataType, shape: &[usize]) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(Value {
            id,
            name: name.to_string(),
            data_type,
            shape: shape.to_vec(),
            producer: None,
            consumers: Vec::new(),
        });
        id
    }

    /// Add an operation and wire up producer/consumer links
    pub fn add_op(&mut self, spec: OpSpec) -> Result<OpId> {
        let id = OpId(self.ops.len());
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("{}_{}", spec.op_type.to_lowercase(), id.0));

        if spec.outputs.is_empty() {
            return Err(Error::InvalidGraph(format!("Operation {} has no outputs", name)));
        }

        for &value in spec.inputs.iter().chain(spec.outputs.iter()) {
            self.value(value)?;
        }

        let mut seen = HashSet::new();
        for &output in &spec.outputs {
            if !seen.insert(output) {
                return Err(Error::InvalidGraph(format!(
                    "Operation {} lists output {} more than once", name, output
                )));
            }
            if spec.inputs.contains(&output) {
                return Err(Error::InvalidGraph(format!(
                    "Operation {} consumes its own output {}; declare an in-place pair instead",
                    name, output
                )));
            }
            if let Some(producer) = self.values[output.0].producer {
                return Err(Error::InvalidGraph(format!(
                    "Value {} is already produced by {}", self.values[output.0].name, producer
                )));
            }
            if self.inputs.contains(&output) {
                return Err(Error::InvalidGraph(format!(
                    "Graph input {} cannot be produced by operation {}",
                    self.values[output.0].name, name
                )));
            }
        }

        let mut overwritten = HashSet::new();
        for pair in &spec.inplace {
            if pair.input_index >= spec.inputs.len() || pair.output_index >= spec.outputs.len() {
                return Err(Error::InvalidGraph(format!(
                    "In-place pair ({}, {}) of operation {} is out of range",
                    pair.input_index, pair.output_index, name
                )));
            }
            if !overwritten.insert(pair.output_index) {
                return Err(Error::InvalidGraph(format!(
                    "Output {} of operation {} is declared in place more than once",
                    pair.output_index, name
                )));
            }
        }

        for &input in &spec.inputs {
            self.values[input.0].consumers.push(id);
        }
        for &output in &spec.outputs {
            self.values[output.0].producer = Some(id);
        }

        self.ops.push(Operation {
            id,
            name,
            op_type: spec.op_type,
            inputs: spec.inputs,
            outputs: spec.outputs,
            inplace: spec.inplace,
            scratchpad_bytes: spec.scratchpad_bytes,
            constant: spec.constant,
        });

        Ok(id)
    }

    /// Set the ordered external input descriptors
    pub fn set_inputs(&mut self, inputs: &[ValueId]) -> Result<()> {
        let mut seen = HashSet::new();
        for &input in inputs {
            let value = self.value(input)?;
            if let Some(producer) = value.producer {
                return Err(Error::InvalidGraph(format!(
                    "Graph input {} is produced by {}", value.name, producer
                )));
            }
            if !seen.insert(input) {
                return Err(Error::InvalidGraph(format!(
                    "Graph input {} is listed more than once", value.name
                )));
            }
        }
        self.inputs = inputs.to_vec();
        Ok(())
    }

    /// Set the ordered external output descriptors
    pub fn set_outputs(&mut self, outputs: &[ValueId]) -> Result<()> {
        let mut seen = HashSet::new();
        for &output in outputs {
            let value = self.value(output)?;
            if !seen.insert(output) {
                return Err(Error::InvalidGraph(format!(
                    "Graph output {} is listed more than once", value.name
                )));
            }
        }
        self.outputs = outputs.to_vec();
        Ok(())
    }

    pub fn value(&self, id: ValueId) -> Result<&Value> {
        self.values
            .get(id.0)
            .ok_or_else(|| Error::InvalidGraph(format!("Value {} not found", id)))
    }

    pub fn op(&self, id: OpId) -> Result<&Operation> {
        self.ops
            .get(id.0)
            .ok_or_else(|| Error::InvalidGraph(format!("Operation {} not found", id)))
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn is_output(&self, value: ValueId) -> bool {
        self.outputs.contains(&value)
    }

    /// Dependency DAG with one node per operation and one edge per produced input
    pub fn dependency_graph(&self) -> DiGraph<OpId, ValueId> {
        let edge_count = self.ops.iter().map(|op| op.inputs.len()).sum();
        let mut dag = DiGraph::with_capacity(self.ops.len(), edge_count);
        for op in &self.ops {
            dag.add_node(op.id);
        }
        for op in &self.ops {
            for &input in &op.inputs {
                if let Some(producer) = self.values[input.0].producer {
                    dag.add_edge(NodeIndex::new(producer.0), NodeIndex::new(op.id.0), input);
                }
            }
        }
        dag
    }

    /// Deterministic topological order; among ready operations the lowest id runs first
    pub fn topological_order(&self) -> Result<Vec<OpId>> {
        let dag = self.dependency_graph();
        let mut in_degree: Vec<usize> = dag
            .node_indices()
            .map(|node| dag.neighbors_directed(node, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(index, _)| Reverse(index))
            .collect();

        let mut order = Vec::with_capacity(self.ops.len());
        while let Some(Reverse(index)) = ready.pop() {
            let node = NodeIndex::new(index);
            order.push(dag[node]);
            for next in dag.neighbors_directed(node, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next.index()));
                }
            }
        }

        if order.len() != self.ops.len() {
            let stuck = in_degree
                .iter()
                .position(|&degree| degree > 0)
                .map(|index| self.ops[index].name.clone())
                .unwrap_or_default();
            return Err(Error::InvalidGraph(format!(
                "Cycle detected in graph at operation {}", stuck
            )));
        }

        Ok(order)
    }
}
