//! User-space one-sided messaging substrate in the Portals style.
//!
//! Applications link the light client ([`Portals`]); all interface state
//! lives in the process plumbing engine ([`ppe::Ppe`]), reached over a
//! shared-memory command channel. Three transports move payloads: RDMA
//! over a verbs-like provider for off-node peers, a shared-memory pad for
//! node-local peers, and the command channel itself for everything the
//! engine can do with a local function call.

mod channel;
mod command;
mod conn;
mod ct;
mod eq;
mod md;
mod me;
mod mr;
mod ni;
mod obj;
mod ops;
mod params;
mod pool;
mod pt;
mod queue;
mod rdma;
mod segment;
mod shm;
mod shmem;

pub mod client;
pub mod ppe;
pub mod verbs;

pub use client::{EntryDesc, MdDesc, Portals};
pub use params::{params, Params};
pub use portals_types as types;
pub use segment::{LocalMapper, SegmentHandle, SegmentMapper};
