//! On-wire structures consumed by the transports. Scatter/gather entries
//! travel between nodes, so they are fixed little-endian; everything that
//! stays on one host crosses shared memory as plain `repr(C)`.

use byteorder::LittleEndian;
use zerocopy::{AsBytes, FromBytes, U32, U64};

use num_enum::IntoPrimitive;
use strum_macros::FromRepr;

/// One scatter/gather element: a remote or local address, a length and the
/// protection key that registered the region.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Debug)]
pub struct Sge {
    pub addr: U64<LittleEndian>,
    pub length: U32<LittleEndian>,
    pub key: U32<LittleEndian>,
}

impl Sge {
    pub fn new(addr: u64, length: u32, key: u32) -> Self {
        Self { addr: U64::new(addr), length: U32::new(length), key: U32::new(key) }
    }
}

impl Default for Sge {
    fn default() -> Self {
        Sge::new(0, 0, 0)
    }
}

/// One kernel-assisted copy element for the shared-memory transport:
/// an exported-segment cookie, an offset into it and a length.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Debug)]
pub struct MemIovec {
    pub cookie: U64<LittleEndian>,
    pub offset: U64<LittleEndian>,
    pub length: U64<LittleEndian>,
}

impl MemIovec {
    pub fn new(cookie: u64, offset: u64, length: u64) -> Self {
        Self {
            cookie: U64::new(cookie),
            offset: U64::new(offset),
            length: U64::new(length),
        }
    }
}

impl Default for MemIovec {
    fn default() -> Self {
        MemIovec::new(0, 0, 0)
    }
}

/// How the data section of a message describes its payload.
#[repr(u8)]
#[derive(FromRepr, IntoPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataFormat {
    /// No data section.
    None = 0,
    /// Payload bytes follow the header inline.
    Inline = 1,
    /// A short array of [`Sge`] follows; the target drives RDMA against it.
    Sge = 2,
    /// One [`Sge`] follows describing a remote array of [`Sge`] that must
    /// be fetched before the transfer can start.
    IndirectSge = 3,
    /// An array of [`MemIovec`] follows; the receiver copies through the
    /// segment mapper.
    MemIovec = 4,
}

/// Direction of payload flow relative to the target.
#[repr(u8)]
#[derive(FromRepr, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataDir {
    /// Data flows initiator to target (put/atomic deposit).
    In = 0,
    /// Data flows target to initiator (get/reply).
    Out = 1,
}

/// Maximum number of scatter/gather entries carried inline in a message;
/// larger descriptors go through [`DataFormat::IndirectSge`].
pub const MAX_INLINE_SGE: usize = 16;

/// Payload operand carried by swap-family atomics.
pub const OPERAND_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn wire_sizes_are_packed() {
        assert_eq!(size_of::<Sge>(), 16);
        assert_eq!(size_of::<MemIovec>(), 24);
    }

    #[test]
    fn sge_encodes_little_endian() {
        let sge = Sge::new(0x0102_0304_0506_0708, 0x1122_3344, 5);
        let bytes = sge.as_bytes();
        assert_eq!(bytes[0], 0x08);
        assert_eq!(bytes[8], 0x44);
    }
}
