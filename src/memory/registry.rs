use std::collections::BTreeMap;

use log::debug;

use crate::error::{Error, Result};
use crate::memory::allocator::SlotId;

/// Widest vector width any consumer is assumed to need
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Align an offset up to a power-of-two alignment
pub fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

/// Collects the size of every slot of one region and packs them into a
/// single contiguous block once planning is done.
///
/// Offsets are a prefix sum over slot ids in ascending order, each aligned
/// to the registry alignment. After [`Registry::freeze`] the layout never
/// changes until [`Registry::clear`].
#[derive(Debug, Clone)]
pub struct Registry {
    alignment: usize,
    sizes: BTreeMap<SlotId, usize>,
    offsets: Option<BTreeMap<SlotId, usize>>,
    total: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            sizes: BTreeMap::new(),
            offsets: None,
            total: 0,
        }
    }
}

impl Registry {
    /// Create a registry aligning every slot to `alignment` bytes
    pub fn new(alignment: usize) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidState(format!(
                "Region alignment must be a power of two, got {}", alignment
            )));
        }
        Ok(Self {
            alignment,
            ..Self::default()
        })
    }

    /// Record that `slot` needs at least `bytes` bytes
    pub fn book(&mut self, slot: SlotId, bytes: usize) -> Result<()> {
        if self.is_frozen() {
            return Err(Error::InvalidState(format!(
                "Cannot book slot {} after the region layout was frozen", slot
            )));
        }
        if slot.is_none() || bytes == 0 {
            return Ok(());
        }
        let entry = self.sizes.entry(slot).or_insert(0);
        *entry = (*entry).max(bytes);
        Ok(())
    }

    /// Fix the offset of every booked slot
    pub fn freeze(&mut self) {
        if self.is_frozen() {
            return;
        }
        let (offsets, total) = self.layout();
        debug!(
            "froze region layout: {} slots, {} bytes, alignment {}",
            offsets.len(),
            total,
            self.alignment
        );
        self.offsets = Some(offsets);
        self.total = total;
    }

    pub fn is_frozen(&self) -> bool {
        self.offsets.is_some()
    }

    /// Total bytes the region needs
    pub fn size(&self) -> usize {
        if self.is_frozen() {
            self.total
        } else {
            self.layout().1
        }
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Number of booked slots
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Byte offset of a slot, available once frozen
    pub fn offset(&self, slot: SlotId) -> Option<usize> {
        self.offsets.as_ref()?.get(&slot).copied()
    }

    /// Booked size of a slot
    pub fn slot_size(&self, slot: SlotId) -> Option<usize> {
        self.sizes.get(&slot).copied()
    }

    /// Iterate `(slot, offset, size)` in layout order
    pub fn entries(&self) -> impl Iterator<Item = (SlotId, usize, usize)> + '_ {
        self.sizes
            .iter()
            .filter_map(move |(&slot, &size)| self.offset(slot).map(|offset| (slot, offset, size)))
    }

    /// Resolver mapping slots to addresses inside a region starting at `base`
    pub fn grantor(&self, base: *mut u8) -> Result<Grantor<'_>> {
        if !self.is_frozen() {
            return Err(Error::InvalidState(
                "Region layout must be frozen before granting memory".to_string(),
            ));
        }
        if (base as usize) % self.alignment != 0 {
            return Err(Error::BindingError(format!(
                "Region base {:p} is not aligned to {} bytes",
                base, self.alignment
            )));
        }
        Ok(Grantor {
            base,
            registry: self,
        })
    }

    pub fn clear(&mut self) {
        self.sizes.clear();
        self.offsets = None;
        self.total = 0;
    }

    fn layout(&self) -> (BTreeMap<SlotId, usize>, usize) {
        let mut offsets = BTreeMap::new();
        let mut total = 0;
        for (&slot, &size) in &self.sizes {
            let offset = align_up(total, self.alignment);
            offsets.insert(slot, offset);
            total = offset + size;
        }
        (offsets, total)
    }
}

/// Resolves slot ids of a frozen registry against a concrete base address
#[derive(Debug, Clone, Copy)]
pub struct Grantor<'a> {
    base: *mut u8,
    registry: &'a Registry,
}

impl<'a> Grantor<'a> {
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Address of a slot, `None` for the sentinel or unknown slots
    pub fn get(&self, slot: SlotId) -> Option<*mut u8> {
        self.registry
            .offset(slot)
            .map(|offset| self.base.wrapping_add(offset))
    }

    /// Address and booked size of a slot
    pub fn get_with_size(&self, slot: SlotId) -> Option<(*mut u8, usize)> {
        let size = self.registry.slot_size(slot)?;
        self.get(slot).map(|ptr| (ptr, size))
    }
}
