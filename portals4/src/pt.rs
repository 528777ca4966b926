//! The portal table: the per-NI array of indexes incoming operations are
//! addressed to, each carrying a priority and an overflow list of posted
//! entries.

use portals_types::{Handle, ListKind, PtIndex, PtOptions, PtlError, Result, PT_ANY};
use spin::Mutex;

struct PtSlot {
    allocated: bool,
    enabled: bool,
    options: PtOptions,
    eq_handle: Handle,
    priority: Vec<Handle>,
    overflow: Vec<Handle>,
}

impl PtSlot {
    const fn empty() -> PtSlot {
        PtSlot {
            allocated: false,
            enabled: false,
            options: PtOptions::empty(),
            eq_handle: Handle::NONE,
            priority: Vec::new(),
            overflow: Vec::new(),
        }
    }
}

pub struct PortalTable {
    slots: Vec<Mutex<PtSlot>>,
}

impl PortalTable {
    pub fn new(max_pt_index: u32) -> PortalTable {
        PortalTable {
            slots: (0..=max_pt_index).map(|_| Mutex::new(PtSlot::empty())).collect(),
        }
    }

    /// Allocate a specific index, or the lowest free one for `PT_ANY`.
    /// Allocated indexes start enabled.
    pub fn alloc(
        &self,
        requested: PtIndex,
        options: PtOptions,
        eq_handle: Handle,
    ) -> Result<PtIndex> {
        let range: Vec<usize> = if requested == PT_ANY {
            (0..self.slots.len()).collect()
        } else {
            let index = requested as usize;
            if index >= self.slots.len() {
                return Err(PtlError::InvalidArg);
            }
            vec![index]
        };
        for index in range {
            let mut slot = self.slots[index].lock();
            if !slot.allocated {
                *slot = PtSlot {
                    allocated: true,
                    enabled: true,
                    options,
                    eq_handle,
                    priority: Vec::new(),
                    overflow: Vec::new(),
                };
                return Ok(index as PtIndex);
            }
        }
        if requested == PT_ANY {
            Err(PtlError::NoSpace)
        } else {
            Err(PtlError::InUse)
        }
    }

    /// Free an index. Entries must have been unlinked first.
    pub fn free(&self, index: PtIndex) -> Result<()> {
        let mut slot = self.checked(index)?.lock();
        if !slot.allocated {
            return Err(PtlError::InvalidArg);
        }
        if !slot.priority.is_empty() || !slot.overflow.is_empty() {
            return Err(PtlError::InUse);
        }
        *slot = PtSlot::empty();
        Ok(())
    }

    pub fn enable(&self, index: PtIndex) -> Result<()> {
        let mut slot = self.checked(index)?.lock();
        if !slot.allocated {
            return Err(PtlError::InvalidArg);
        }
        slot.enabled = true;
        Ok(())
    }

    pub fn disable(&self, index: PtIndex) -> Result<()> {
        let mut slot = self.checked(index)?.lock();
        if !slot.allocated {
            return Err(PtlError::InvalidArg);
        }
        slot.enabled = false;
        Ok(())
    }

    fn checked(&self, index: PtIndex) -> Result<&Mutex<PtSlot>> {
        self.slots.get(index as usize).ok_or(PtlError::InvalidArg)
    }

    /// Append an entry handle to one of the lists.
    pub fn append(&self, index: PtIndex, list: ListKind, entry: Handle) -> Result<()> {
        let mut slot = self.checked(index)?.lock();
        if !slot.allocated {
            return Err(PtlError::InvalidArg);
        }
        match list {
            ListKind::Priority => slot.priority.push(entry),
            ListKind::Overflow => slot.overflow.push(entry),
        }
        Ok(())
    }

    /// Drop an entry handle from whichever list holds it.
    pub fn unlink(&self, index: PtIndex, entry: Handle) -> Result<()> {
        let mut slot = self.checked(index)?.lock();
        let before = slot.priority.len() + slot.overflow.len();
        slot.priority.retain(|h| *h != entry);
        slot.overflow.retain(|h| *h != entry);
        if slot.priority.len() + slot.overflow.len() == before {
            return Err(PtlError::InvalidArg);
        }
        Ok(())
    }

    /// Snapshot for match traversal: priority list first, then overflow.
    /// `None` when the index is disabled or unallocated.
    pub fn candidates(&self, index: PtIndex) -> Option<(Vec<Handle>, Handle)> {
        let slot = self.checked(index).ok()?.lock();
        if !slot.allocated || !slot.enabled {
            return None;
        }
        let mut all = slot.priority.clone();
        all.extend_from_slice(&slot.overflow);
        Some((all, slot.eq_handle))
    }

    pub fn is_enabled(&self, index: PtIndex) -> bool {
        self.checked(index)
            .map(|slot| {
                let slot = slot.lock();
                slot.allocated && slot.enabled
            })
            .unwrap_or(false)
    }
}
