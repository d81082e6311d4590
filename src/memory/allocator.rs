use std::collections::BTreeMap;
use std::fmt;

use log::trace;
use serde::{Deserialize, Serialize};

/// Identifier of an abstract buffer slot inside a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl SlotId {
    /// Sentinel handed out for zero-sized requests
    pub const NONE: SlotId = SlotId(usize::MAX);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, Clone)]
struct SlotInfo {
    /// Largest size ever requested from this slot
    max_bytes: usize,
    /// Whether the slot currently sits in the free list
    free: bool,
}

/// Free-list allocator over abstract slots.
///
/// No bytes are handed out: a slot is an integer id whose size is the
/// maximum ever requested from it. Released slots are filed under that
/// size and matched against later requests within `[size / R, size * R]`,
/// larger candidates first.
#[derive(Debug, Clone)]
pub struct BufferAssigner {
    /// Tolerance ratio `R`, 0 disables matching
    match_range: usize,
    /// Released slots keyed by their current max size, in release order
    free: BTreeMap<usize, Vec<SlotId>>,
    slots: Vec<SlotInfo>,
    reuse_count: usize,
}

impl BufferAssigner {
    /// Create an assigner with the given match range
    pub fn new(match_range: usize) -> Self {
        Self {
            match_range,
            free: BTreeMap::new(),
            slots: Vec::new(),
            reuse_count: 0,
        }
    }

    /// Request a slot able to hold `size` bytes
    pub fn request(&mut self, size: usize) -> SlotId {
        if size == 0 {
            return SlotId::NONE;
        }
        if self.match_range == 0 {
            return self.alloc(size);
        }

        let low = size / self.match_range;
        let high = size.saturating_mul(self.match_range);

        // smallest free slot that is not smaller than the request
        let larger = self
            .free
            .range_mut(size..=high)
            .next()
            .map(|(&key, bucket)| (key, bucket.remove(0)));
        if let Some((key, slot)) = larger {
            return self.reuse(key, slot, size);
        }

        // largest smaller slot, grown to fit
        let smaller = self
            .free
            .range_mut(low..size)
            .next_back()
            .and_then(|(&key, bucket)| bucket.pop().map(|slot| (key, slot)));
        if let Some((key, slot)) = smaller {
            return self.reuse(key, slot, size);
        }

        self.alloc(size)
    }

    /// Return a slot to the free list
    pub fn release(&mut self, slot: SlotId) {
        if slot.is_none() {
            return;
        }
        let info = self
            .slots
            .get_mut(slot.0)
            .unwrap_or_else(|| panic!("invalid buffer id {}", slot));
        assert!(!info.free, "buffer {} released twice", slot);

        info.free = true;
        self.free.entry(info.max_bytes).or_default().push(slot);
        trace!("released slot {} ({} bytes)", slot, info.max_bytes);
    }

    /// Largest size ever requested from a slot
    pub fn query_size(&self, slot: SlotId) -> usize {
        if slot.is_none() {
            return 0;
        }
        self.slots
            .get(slot.0)
            .map(|info| info.max_bytes)
            .unwrap_or_else(|| panic!("invalid buffer id {}", slot))
    }

    /// Whether a slot is currently free
    pub fn is_free(&self, slot: SlotId) -> bool {
        self.slots.get(slot.0).map_or(false, |info| info.free)
    }

    /// Number of distinct slots created so far
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of requests served from the free list
    pub fn reuse_count(&self) -> usize {
        self.reuse_count
    }

    pub fn clear(&mut self) {
        self.free.clear();
        self.slots.clear();
        self.reuse_count = 0;
    }

    fn reuse(&mut self, key: usize, slot: SlotId, size: usize) -> SlotId {
        if self.free.get(&key).map_or(false, Vec::is_empty) {
            self.free.remove(&key);
        }

        let info = &mut self.slots[slot.0];
        info.max_bytes = info.max_bytes.max(size);
        info.free = false;
        self.reuse_count += 1;

        trace!("reused slot {} for {} bytes (now {} bytes)", slot, size, info.max_bytes);
        slot
    }

    fn alloc(&mut self, size: usize) -> SlotId {
        let slot = SlotId(self.slots.len());
        self.slots.push(SlotInfo {
            max_bytes: size,
            free: false,
        });
        trace!("created slot {} ({} bytes)", slot, size);
        slot
    }
}
