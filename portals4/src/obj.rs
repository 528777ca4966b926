//! Handle-addressed object arenas. Every MD/LE/ME/CT/EQ lives in the arena
//! of its owning NI; a handle carries the slot index plus a generation that
//! is bumped on free, so a stale handle can never reach a recycled object.
//!
//! In-flight work pins objects by cloning the `Arc` out of the slot;
//! freeing a handle only unlinks it, the object itself is dropped when the
//! last reference goes away.

use std::sync::Arc;

use portals_types::{Handle, ObjType, PtlError, Result};
use spin::Mutex;

struct Slot<T> {
    gen: u32,
    obj: Option<Arc<T>>,
}

pub struct Arena<T> {
    ni_index: u8,
    ty: ObjType,
    max: u32,
    inner: Mutex<ArenaInner<T>>,
}

struct ArenaInner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    pub fn new(ni_index: u8, ty: ObjType, max: u32) -> Self {
        Self {
            ni_index,
            ty,
            max,
            inner: Mutex::new(ArenaInner { slots: Vec::new(), free: Vec::new() }),
        }
    }

    /// Insert an object and mint its handle. Fails with `NoSpace` once the
    /// arena holds `max` live objects.
    pub fn alloc(&self, obj: T) -> Result<Handle> {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                if inner.slots.len() as u32 >= self.max {
                    return Err(PtlError::NoSpace);
                }
                inner.slots.push(Slot { gen: 1, obj: None });
                (inner.slots.len() - 1) as u32
            }
        };
        let slot = &mut inner.slots[index as usize];
        debug_assert!(slot.obj.is_none());
        slot.obj = Some(Arc::new(obj));
        Ok(Handle::new(self.ni_index, self.ty, slot.gen, index))
    }

    fn slot_for<'a>(&self, inner: &'a ArenaInner<T>, handle: Handle) -> Result<&'a Slot<T>> {
        handle.expect_type(self.ty)?;
        if handle.ni_index() != self.ni_index {
            return Err(PtlError::InvalidArg);
        }
        let slot = inner
            .slots
            .get(handle.index() as usize)
            .ok_or(PtlError::InvalidArg)?;
        if slot.gen != handle.generation() || slot.obj.is_none() {
            return Err(PtlError::InvalidArg);
        }
        Ok(slot)
    }

    /// Look up a live object, pinning it for the caller.
    pub fn get(&self, handle: Handle) -> Result<Arc<T>> {
        let inner = self.inner.lock();
        let slot = self.slot_for(&inner, handle)?;
        Ok(slot.obj.as_ref().unwrap().clone())
    }

    /// Unlink a handle. The returned `Arc` may outlive the slot if work is
    /// still holding references.
    pub fn free(&self, handle: Handle) -> Result<Arc<T>> {
        let mut inner = self.inner.lock();
        self.slot_for(&inner, handle)?;
        let index = handle.index();
        let slot = &mut inner.slots[index as usize];
        let obj = slot.obj.take().unwrap();
        // wrap within the 26-bit field rather than ever re-issuing gen 0
        slot.gen = if slot.gen >= (1 << 26) - 1 { 1 } else { slot.gen + 1 };
        inner.free.push(index);
        Ok(obj)
    }

    /// Number of live objects.
    pub fn live(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free.len()
    }

    /// Run `f` over every live object.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<T>)) {
        let inner = self.inner.lock();
        for slot in &inner.slots {
            if let Some(obj) = &slot.obj {
                f(obj);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_is_rejected() {
        let arena: Arena<u32> = Arena::new(0, ObjType::Ct, 8);
        let h = arena.alloc(5).unwrap();
        assert_eq!(*arena.get(h).unwrap(), 5);
        arena.free(h).unwrap();
        assert_eq!(arena.get(h), Err(PtlError::InvalidArg));
        // the slot is recycled under a fresh generation
        let h2 = arena.alloc(9).unwrap();
        assert_eq!(h2.index(), h.index());
        assert_ne!(h2, h);
        assert_eq!(arena.get(h), Err(PtlError::InvalidArg));
        assert_eq!(*arena.get(h2).unwrap(), 9);
    }

    #[test]
    fn wrong_type_is_rejected() {
        let cts: Arena<u32> = Arena::new(0, ObjType::Ct, 8);
        let eqs: Arena<u32> = Arena::new(0, ObjType::Eq, 8);
        let h = cts.alloc(1).unwrap();
        assert_eq!(eqs.get(h), Err(PtlError::InvalidArg));
    }

    #[test]
    fn capacity_is_enforced() {
        let arena: Arena<u8> = Arena::new(0, ObjType::Md, 2);
        let a = arena.alloc(0).unwrap();
        let _b = arena.alloc(1).unwrap();
        assert_eq!(arena.alloc(2), Err(PtlError::NoSpace));
        arena.free(a).unwrap();
        arena.alloc(3).unwrap();
        assert_eq!(arena.live(), 2);
    }

    #[test]
    fn freed_object_survives_while_pinned() {
        let arena: Arena<String> = Arena::new(1, ObjType::Eq, 4);
        let h = arena.alloc("held".to_string()).unwrap();
        let pin = arena.get(h).unwrap();
        arena.free(h).unwrap();
        assert_eq!(pin.as_str(), "held");
    }
}
