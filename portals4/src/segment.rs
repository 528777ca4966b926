//! Export/import of client memory segments. The PPE never dereferences a
//! client pointer; everything that crosses the command queue is a
//! [`SegmentHandle`] that the memory-sharing facility resolves into a
//! PPE-side pointer on use.
//!
//! The facility itself (XPMEM, KNEM, a kernel copy module) is a deployment
//! concern behind [`SegmentMapper`]; [`LocalMapper`] is the in-tree
//! implementation for the arrangement where the PPE shares the client's
//! address space.

use std::collections::HashMap;

use portals_types::{IoVec, PtlError, Result};
use spin::Mutex;

/// Opaque, plain-data reference to an exported segment. Crosses the
/// command queue by value.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentHandle {
    pub id: u64,
    pub len: u64,
}

impl SegmentHandle {
    pub const NONE: SegmentHandle = SegmentHandle { id: 0, len: 0 };

    pub fn is_none(&self) -> bool {
        self.id == 0
    }
}

/// A slice of an exported segment, as carried by the kernel-assisted copy
/// path of the shared-memory transport.
#[derive(Clone, Copy, Debug)]
pub struct CookieWindow {
    pub handle: SegmentHandle,
    pub offset: u64,
    pub len: u64,
}

pub trait SegmentMapper: Send + Sync {
    /// Register `len` bytes at `base` of the calling process for import.
    fn export(&self, base: *const u8, len: usize) -> Result<SegmentHandle>;

    /// Resolve a handle to a pointer valid in the importing process.
    /// Imports are reference counted and idempotent: importing the same
    /// handle again returns the same pointer.
    fn import(&self, handle: SegmentHandle) -> Result<*mut u8>;

    /// Drop one import reference, or the export itself once no imports
    /// remain.
    fn release(&self, handle: SegmentHandle);
}

struct Exported {
    base: *mut u8,
    len: u64,
    refs: u32,
}

/// Mapper for a PPE living in the exporting process: handles resolve to
/// the original pointer and the translation offset is zero.
pub struct LocalMapper {
    table: Mutex<HashMap<u64, Exported>>,
    capacity: usize,
    next_id: Mutex<u64>,
}

unsafe impl Send for LocalMapper {}
unsafe impl Sync for LocalMapper {}

impl LocalMapper {
    pub fn new(capacity: usize) -> Self {
        Self { table: Mutex::new(HashMap::new()), capacity, next_id: Mutex::new(1) }
    }
}

impl SegmentMapper for LocalMapper {
    fn export(&self, base: *const u8, len: usize) -> Result<SegmentHandle> {
        let mut table = self.table.lock();
        if table.len() >= self.capacity {
            return Err(PtlError::NoSpace);
        }
        let mut next = self.next_id.lock();
        let id = *next;
        *next += 1;
        table.insert(id, Exported { base: base as *mut u8, len: len as u64, refs: 1 });
        Ok(SegmentHandle { id, len: len as u64 })
    }

    fn import(&self, handle: SegmentHandle) -> Result<*mut u8> {
        let mut table = self.table.lock();
        let seg = table.get_mut(&handle.id).ok_or(PtlError::InvalidArg)?;
        // a zero length marks a cookie import: the exporter's record is
        // authoritative and only the id travels
        if handle.len != 0 && seg.len != handle.len {
            return Err(PtlError::InvalidArg);
        }
        seg.refs += 1;
        Ok(seg.base)
    }

    fn release(&self, handle: SegmentHandle) {
        let mut table = self.table.lock();
        if let Some(seg) = table.get_mut(&handle.id) {
            seg.refs -= 1;
            if seg.refs == 0 {
                table.remove(&handle.id);
            }
        }
    }
}

/// An I/O vector exported element by element, plus the handle array itself
/// exported as one more segment so the PPE sees a single descriptor.
pub struct ExportedIovec {
    pub handles: Box<[SegmentHandle]>,
    pub list_handle: SegmentHandle,
}

impl ExportedIovec {
    pub fn export(mapper: &dyn SegmentMapper, iov: &[IoVec]) -> Result<ExportedIovec> {
        let mut handles = Vec::with_capacity(iov.len());
        for elem in iov {
            match mapper.export(elem.base as *const u8, elem.len as usize) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    for handle in &handles {
                        mapper.release(*handle);
                    }
                    return Err(err);
                }
            }
        }
        let handles = handles.into_boxed_slice();
        let list_bytes = std::mem::size_of_val(&*handles);
        let list_handle = match mapper.export(handles.as_ptr().cast(), list_bytes) {
            Ok(handle) => handle,
            Err(err) => {
                for handle in &*handles {
                    mapper.release(*handle);
                }
                return Err(err);
            }
        };
        Ok(ExportedIovec { handles, list_handle })
    }

    pub fn release(&self, mapper: &dyn SegmentMapper) {
        mapper.release(self.list_handle);
        for handle in &*self.handles {
            mapper.release(*handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_import_release() {
        let mapper = LocalMapper::new(8);
        let data = [0u8; 32];
        let handle = mapper.export(data.as_ptr(), data.len()).unwrap();
        let ptr = mapper.import(handle).unwrap();
        assert_eq!(ptr as *const u8, data.as_ptr());
        // idempotent
        assert_eq!(mapper.import(handle).unwrap() as *const u8, data.as_ptr());
        mapper.release(handle);
        mapper.release(handle);
        assert!(mapper.import(handle).is_ok(), "export reference still held");
        mapper.release(handle);
        mapper.release(handle);
        assert_eq!(mapper.import(handle), Err(PtlError::InvalidArg));
    }

    #[test]
    fn stale_or_mismatched_handles_fail() {
        let mapper = LocalMapper::new(8);
        let data = [0u8; 16];
        let handle = mapper.export(data.as_ptr(), 16).unwrap();
        let forged = SegmentHandle { id: handle.id, len: 999 };
        assert_eq!(mapper.import(forged), Err(PtlError::InvalidArg));
        assert_eq!(
            mapper.import(SegmentHandle { id: 777, len: 16 }),
            Err(PtlError::InvalidArg)
        );
    }

    #[test]
    fn table_capacity_is_no_space() {
        let mapper = LocalMapper::new(1);
        let data = [0u8; 4];
        let _a = mapper.export(data.as_ptr(), 4).unwrap();
        assert_eq!(mapper.export(data.as_ptr(), 4), Err(PtlError::NoSpace));
    }

    #[test]
    fn iovec_exports_elements_and_list() {
        let mapper = LocalMapper::new(16);
        let bufs = [vec![1u8; 64], vec![2u8; 128]];
        let iov: Vec<IoVec> = bufs
            .iter()
            .map(|b| IoVec { base: b.as_ptr() as u64, len: b.len() as u64 })
            .collect();
        let exported = ExportedIovec::export(&mapper, &iov).unwrap();
        assert_eq!(exported.handles.len(), 2);
        let list = mapper.import(exported.list_handle).unwrap();
        let seen =
            unsafe { std::slice::from_raw_parts(list.cast::<SegmentHandle>(), 2) };
        assert_eq!(seen, &*exported.handles);
        mapper.release(exported.list_handle);
        exported.release(&mapper);
    }
}
