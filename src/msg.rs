//! Wire protocol spoken by the instrumented child over its pipe.
//!
//! Records are packed little-endian with no framing beyond their fixed sizes;
//! `gep` and `memcmp` records are immediately followed by their payload record
//! and must be consumed contiguously.

use speedy::{Readable, Writable};

/// Fixed-size header record, one per runtime event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Readable, Writable)]
pub struct PipeMsg {
    pub msg_type: u16,
    pub flags: u16,
    pub id: u32,
    pub label: u32,
    pub result: u64,
    pub addr: u64,
    pub context: u32,
}

pub(crate) const PIPE_MSG_SIZE: usize = 32;

/// Payload following a `gep`-typed [`PipeMsg`]. Accepted and validated, but
/// otherwise unused (reserved for array-bounds inference).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Readable, Writable)]
pub struct GepMsg {
    pub ptr_label: u32,
    pub index_label: u32,
    pub num_elems: u64,
    pub elem_size: u64,
    pub current_offset: i64,
    pub ptr: u64,
}

pub(crate) const GEP_MSG_SIZE: usize = 40;

/// Header of the payload following a `memcmp`-typed [`PipeMsg`]; the header is
/// trailed by `PipeMsg::result` content bytes (the concrete operand).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Readable, Writable)]
pub struct MemcmpMsg {
    pub label: u32,
}

pub(crate) const MEMCMP_MSG_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Cond,
    Gep,
    Memcmp,
    Fsize,
    Unknown(u16),
}

impl From<u16> for MsgKind {
    fn from(raw: u16) -> Self {
        match raw {
            0 => Self::Cond,
            1 => Self::Gep,
            2 => Self::Memcmp,
            3 => Self::Fsize,
            other => Self::Unknown(other),
        }
    }
}
