use std::collections::{HashMap, VecDeque};

use log::warn;

use crate::error::{Error, Result};
use crate::model::ValueId;

/// Tracks in-place aliasing between values.
///
/// `forward` maps an output to the input whose buffer it overwrites,
/// `reverse` is the inverse. Chains are acyclic and end at a root that
/// aliases nothing.
#[derive(Debug, Clone, Default)]
pub struct AliasMap {
    forward: HashMap<ValueId, ValueId>,
    reverse: HashMap<ValueId, Vec<ValueId>>,
}

impl AliasMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `output` reuses the buffer of `input`
    pub fn record_alias(&mut self, output: ValueId, input: ValueId) -> Result<()> {
        if output == input {
            return Err(Error::InvalidGraph(format!("Value {} cannot alias itself", output)));
        }
        if let Some(existing) = self.forward.get(&output) {
            return Err(Error::InvalidGraph(format!(
                "Value {} already aliases {}", output, existing
            )));
        }
        if self.resolve(input) == output {
            return Err(Error::InvalidGraph(format!(
                "Aliasing {} onto {} would create a cycle", output, input
            )));
        }
        if self.reverse.contains_key(&input) {
            warn!("value {} is overwritten in place by more than one output", input);
        }

        self.forward.insert(output, input);
        self.reverse.entry(input).or_default().push(output);
        Ok(())
    }

    /// Follow the chain to the value that owns the buffer
    pub fn resolve(&self, value: ValueId) -> ValueId {
        let mut current = value;
        while let Some(&next) = self.forward.get(&current) {
            current = next;
        }
        current
    }

    /// Direct alias target of `value`
    pub fn alias_of(&self, value: ValueId) -> Option<ValueId> {
        self.forward.get(&value).copied()
    }

    /// Outputs that directly overwrite `value`
    pub fn aliases_of(&self, value: ValueId) -> &[ValueId] {
        self.reverse.get(&value).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every value sharing the buffer owned by `root`, root first
    pub fn group(&self, root: ValueId) -> Vec<ValueId> {
        let mut members = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(value) = queue.pop_front() {
            members.push(value);
            queue.extend(self.aliases_of(value).iter().copied());
        }
        members
    }

    /// Whether `value` is an aliased output
    pub fn contains(&self, value: ValueId) -> bool {
        self.forward.contains_key(&value)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }
}
