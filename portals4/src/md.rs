//! Memory descriptors: registered send/receive sources on the initiator
//! side. The client exports the memory; the PPE resolves the export into
//! its own address space once at bind time and works on plain segments
//! from then on.

use portals_types::{Handle, MdOptions, PtlError, Result};

use crate::segment::{SegmentHandle, SegmentMapper};

/// A PPE-resolved span of user memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Seg {
    pub addr: u64,
    pub len: u64,
}

/// Walk `[offset, offset+len)` of a segment list as `(addr, len)` pieces.
pub fn walk(segs: &[Seg], mut offset: u64, mut len: u64) -> Vec<Seg> {
    let mut out = Vec::new();
    for seg in segs {
        if len == 0 {
            break;
        }
        if offset >= seg.len {
            offset -= seg.len;
            continue;
        }
        let take = (seg.len - offset).min(len);
        out.push(Seg { addr: seg.addr + offset, len: take });
        offset = 0;
        len -= take;
    }
    out
}

/// Copy out of a segment list into `dst`.
///
/// # Safety
/// The segments must reference live, resolved memory.
pub unsafe fn copy_from_segs(segs: &[Seg], offset: u64, dst: &mut [u8]) {
    let mut done = 0usize;
    for piece in walk(segs, offset, dst.len() as u64) {
        std::ptr::copy_nonoverlapping(
            piece.addr as *const u8,
            dst.as_mut_ptr().add(done),
            piece.len as usize,
        );
        done += piece.len as usize;
    }
    debug_assert_eq!(done, dst.len());
}

/// Copy `src` into a segment list.
///
/// # Safety
/// The segments must reference live, resolved memory.
pub unsafe fn copy_to_segs(segs: &[Seg], offset: u64, src: &[u8]) {
    let mut done = 0usize;
    for piece in walk(segs, offset, src.len() as u64) {
        std::ptr::copy_nonoverlapping(
            src.as_ptr().add(done),
            piece.addr as *mut u8,
            piece.len as usize,
        );
        done += piece.len as usize;
    }
    debug_assert_eq!(done, src.len());
}

/// A bound memory descriptor, PPE side.
pub struct Md {
    /// Client-space start, reported back in events.
    pub start: u64,
    /// Total bytes across all segments.
    pub length: u64,
    pub options: MdOptions,
    pub eq_handle: Handle,
    pub ct_handle: Handle,
    pub segs: Box<[Seg]>,
    /// The export behind each segment, index-aligned with `segs`; these
    /// are the cookies the kernel-assisted copy path hands to a peer.
    pub seg_handles: Box<[SegmentHandle]>,
    /// Everything imported at bind time, released on destroy.
    imports: Box<[SegmentHandle]>,
}

impl Md {
    /// Resolve a bind request. For an iovec descriptor `mapping` names the
    /// exported handle array and `length` is the element count; otherwise
    /// `mapping` is the one exported span.
    pub fn resolve(
        mapper: &dyn SegmentMapper,
        start: u64,
        length: u64,
        options: MdOptions,
        eq_handle: Handle,
        ct_handle: Handle,
        mapping: SegmentHandle,
    ) -> Result<Md> {
        let resolved = resolve_segs(
            mapper,
            mapping,
            options.contains(MdOptions::IOVEC),
            length,
        )?;
        Ok(Md {
            start,
            length: resolved.total,
            options,
            eq_handle,
            ct_handle,
            segs: resolved.segs,
            seg_handles: resolved.seg_handles,
            imports: resolved.imports,
        })
    }

    /// Describe `[offset, offset+len)` as kernel-copy cookies.
    pub fn cookie_windows(&self, mut offset: u64, mut len: u64) -> Vec<crate::segment::CookieWindow> {
        let mut out = Vec::new();
        for (seg, handle) in self.segs.iter().zip(&*self.seg_handles) {
            if len == 0 {
                break;
            }
            if offset >= seg.len {
                offset -= seg.len;
                continue;
            }
            let take = (seg.len - offset).min(len);
            out.push(crate::segment::CookieWindow {
                handle: *handle,
                offset,
                len: take,
            });
            offset = 0;
            len -= take;
        }
        out
    }

    pub fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        if offset + len > self.length {
            return Err(PtlError::InvalidArg);
        }
        Ok(())
    }

    /// Release every import this descriptor holds.
    pub fn unmap(&self, mapper: &dyn SegmentMapper) {
        for handle in &*self.imports {
            mapper.release(*handle);
        }
    }
}

/// Result of resolving an export into PPE segments.
pub struct ResolvedSegs {
    pub segs: Box<[Seg]>,
    pub seg_handles: Box<[SegmentHandle]>,
    pub imports: Box<[SegmentHandle]>,
    pub total: u64,
}

/// Shared resolve path for MDs and list entries.
pub fn resolve_segs(
    mapper: &dyn SegmentMapper,
    mapping: SegmentHandle,
    iovec: bool,
    length: u64,
) -> Result<ResolvedSegs> {
    if !iovec {
        let base = mapper.import(mapping)?;
        return Ok(ResolvedSegs {
            segs: vec![Seg { addr: base as u64, len: length }].into_boxed_slice(),
            seg_handles: vec![mapping].into_boxed_slice(),
            imports: vec![mapping].into_boxed_slice(),
            total: length,
        });
    }
    // the mapping names an array of per-element handles
    let num = length as usize;
    let list_ptr = mapper.import(mapping)?;
    let handles =
        unsafe { std::slice::from_raw_parts(list_ptr.cast::<SegmentHandle>(), num) };
    let mut segs = Vec::with_capacity(num);
    let mut seg_handles = Vec::with_capacity(num);
    let mut imports = vec![mapping];
    let mut total = 0u64;
    for handle in handles {
        match mapper.import(*handle) {
            Ok(base) => {
                segs.push(Seg { addr: base as u64, len: handle.len });
                seg_handles.push(*handle);
                imports.push(*handle);
                total += handle.len;
            }
            Err(err) => {
                for done in &imports {
                    mapper.release(*done);
                }
                return Err(err);
            }
        }
    }
    Ok(ResolvedSegs {
        segs: segs.into_boxed_slice(),
        seg_handles: seg_handles.into_boxed_slice(),
        imports: imports.into_boxed_slice(),
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_spans_elements() {
        let segs = [
            Seg { addr: 0x1000, len: 16 },
            Seg { addr: 0x2000, len: 8 },
            Seg { addr: 0x3000, len: 32 },
        ];
        let pieces = walk(&segs, 12, 20);
        assert_eq!(
            pieces,
            vec![
                Seg { addr: 0x100c, len: 4 },
                Seg { addr: 0x2000, len: 8 },
                Seg { addr: 0x3000, len: 8 },
            ]
        );
    }

    #[test]
    fn copies_cross_boundaries() {
        let a = [1u8, 2, 3, 4];
        let b = [5u8, 6, 7, 8];
        let segs = [
            Seg { addr: a.as_ptr() as u64, len: 4 },
            Seg { addr: b.as_ptr() as u64, len: 4 },
        ];
        let mut out = [0u8; 6];
        unsafe { copy_from_segs(&segs, 1, &mut out) };
        assert_eq!(out, [2, 3, 4, 5, 6, 7]);
    }
}
