//! List entries and match entries: the receive targets posted to a portal
//! index. An LE is an ME whose bits never participate in matching.

use std::sync::atomic::{AtomicBool, Ordering};

use portals_types::{
    EntryOptions, Handle, ListKind, MatchBits, ProcessId, PtIndex, Result,
};

use crate::md::{resolve_segs, Seg};
use crate::segment::{SegmentHandle, SegmentMapper};

pub struct MatchEntry {
    /// Client-space start, reported in target events.
    pub start: u64,
    pub length: u64,
    pub options: EntryOptions,
    pub ct_handle: Handle,
    pub match_bits: MatchBits,
    pub ignore_bits: MatchBits,
    pub pt_index: PtIndex,
    pub list: ListKind,
    pub user_ptr: u64,
    pub segs: Box<[Seg]>,
    imports: Box<[SegmentHandle]>,
    /// Cleared when a `USE_ONCE` entry consumes its match.
    active: AtomicBool,
    /// Whether this entry takes part in matching (posted to a matching NI).
    pub matching: bool,
}

impl MatchEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        mapper: &dyn SegmentMapper,
        start: u64,
        length: u64,
        options: EntryOptions,
        ct_handle: Handle,
        match_bits: MatchBits,
        ignore_bits: MatchBits,
        pt_index: PtIndex,
        list: ListKind,
        user_ptr: u64,
        mapping: SegmentHandle,
        matching: bool,
    ) -> Result<MatchEntry> {
        let resolved = resolve_segs(
            mapper,
            mapping,
            options.contains(EntryOptions::IOVEC),
            length,
        )?;
        let (segs, imports, total) = (resolved.segs, resolved.imports, resolved.total);
        Ok(MatchEntry {
            start,
            length: total,
            options,
            ct_handle,
            match_bits,
            ignore_bits,
            pt_index,
            list,
            user_ptr,
            segs,
            imports,
            active: AtomicBool::new(true),
            matching,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether an incoming request may land here.
    pub fn accepts(&self, bits: MatchBits, _initiator: ProcessId, wants_put: bool) -> bool {
        if !self.is_active() {
            return false;
        }
        if wants_put && !self.options.contains(EntryOptions::OP_PUT) {
            return false;
        }
        if !wants_put && !self.options.contains(EntryOptions::OP_GET) {
            return false;
        }
        if self.matching {
            (bits ^ self.match_bits) & !self.ignore_bits == 0
        } else {
            true
        }
    }

    /// Consume the entry if it is single-use. Returns whether it was
    /// unlinked by this call.
    pub fn consume(&self) -> bool {
        if self.options.contains(EntryOptions::USE_ONCE) {
            self.active.swap(false, Ordering::AcqRel)
        } else {
            false
        }
    }

    pub fn unmap(&self, mapper: &dyn SegmentMapper) {
        for handle in &*self.imports {
            mapper.release(*handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::LocalMapper;

    fn entry(match_bits: u64, ignore_bits: u64, options: EntryOptions) -> MatchEntry {
        let mapper = LocalMapper::new(4);
        let mem = Box::leak(vec![0u8; 64].into_boxed_slice());
        let mapping = mapper.export(mem.as_ptr(), 64).unwrap();
        MatchEntry::resolve(
            &mapper,
            mem.as_ptr() as u64,
            64,
            options,
            Handle::NONE,
            match_bits,
            ignore_bits,
            0,
            ListKind::Priority,
            0,
            mapping,
            true,
        )
        .unwrap()
    }

    #[test]
    fn bits_match_under_ignore_mask() {
        let e = entry(0xab00, 0x00ff, EntryOptions::OP_PUT);
        let who = ProcessId::logical(0);
        assert!(e.accepts(0xab12, who, true));
        assert!(!e.accepts(0xac12, who, true));
        // op gating
        assert!(!e.accepts(0xab12, who, false));
    }

    #[test]
    fn use_once_consumes_exactly_once() {
        let e = entry(0, u64::MAX, EntryOptions::OP_PUT | EntryOptions::USE_ONCE);
        let who = ProcessId::logical(1);
        assert!(e.accepts(7, who, true));
        assert!(e.consume());
        assert!(!e.is_active());
        assert!(!e.accepts(7, who, true));
        assert!(!e.consume());
    }

    #[test]
    fn persistent_entry_survives_consume() {
        let e = entry(0, u64::MAX, EntryOptions::OP_PUT | EntryOptions::OP_GET);
        assert!(!e.consume());
        assert!(e.is_active());
    }
}
