//! The taint runtime's label table, shared with us over SysV shared memory.
//!
//! The child allocates labels as it tracks data flow and writes one
//! [`LabelInfo`] record per label; we only ever read. The segment is sized for
//! the whole label universe up front and relies on demand faulting, so the
//! address-space reservation is large while the resident set stays small.

use std::io;

use thiserror::Error;

/// Opaque handle into the label table.
pub type Label = u32;

/// Labels below this value are literal operands, not table entries.
pub const CONST_OFFSET: Label = 1;
/// The "no label" literal slot.
pub const CONST_LABEL: Label = 0;
/// Sentinel for a slot the runtime has not finished writing. Never valid in a
/// live expression.
pub const INIT_LABEL: Label = 0xffff_ffff;

/// One record of the shared label table, written by the child's runtime.
///
/// `op` is either a plain opcode from [`op`], or `op::ICMP | (predicate << 8)`
/// with a predicate from [`pred`]. For binary ops, an operand label below
/// [`CONST_OFFSET`] means the corresponding `opN` holds the literal value. The
/// input-byte terminal (`op == 0`) stores its buffer offset in `op1`; a `Load`
/// points at its first byte's terminal via `l1` and carries the byte length in
/// `l2`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelInfo {
    pub l1: Label,
    pub l2: Label,
    pub op: u16,
    pub size: u16,
    pub op1: u64,
    pub op2: u64,
}

/// Opcodes recorded by the runtime (shared-header contract).
pub mod op {
    pub const LOAD: u16 = 1;
    pub const TRUNC: u16 = 2;
    pub const EXTRACT: u16 = 3;
    pub const CONCAT: u16 = 4;
    pub const ZEXT: u16 = 5;
    pub const SEXT: u16 = 6;
    pub const ADD: u16 = 7;
    pub const SUB: u16 = 8;
    pub const MUL: u16 = 9;
    pub const UDIV: u16 = 10;
    pub const SDIV: u16 = 11;
    pub const UREM: u16 = 12;
    pub const SREM: u16 = 13;
    pub const SHL: u16 = 14;
    pub const LSHR: u16 = 15;
    pub const ASHR: u16 = 16;
    pub const AND: u16 = 17;
    pub const OR: u16 = 18;
    pub const XOR: u16 = 19;
    pub const ICMP: u16 = 20;
    pub const MEMCMP: u16 = 21;
    pub const FSIZE: u16 = 22;
}

/// Comparison predicates, using the LLVM `CmpInst` numbering.
pub mod pred {
    pub const EQ: u16 = 32;
    pub const NE: u16 = 33;
    pub const UGT: u16 = 34;
    pub const UGE: u16 = 35;
    pub const ULT: u16 = 36;
    pub const ULE: u16 = 37;
    pub const SGT: u16 = 38;
    pub const SGE: u16 = 39;
    pub const SLT: u16 = 40;
    pub const SLE: u16 = 41;
}

#[inline]
pub(crate) fn base_op(op: u16) -> u16 {
    op & 0xff
}

#[inline]
pub(crate) fn is_icmp(op: u16) -> bool {
    base_op(op) == op::ICMP
}

#[inline]
pub(crate) fn icmp_pred(op: u16) -> u16 {
    op >> 8
}

#[cfg(test)]
pub(crate) fn icmp_op(predicate: u16) -> u16 {
    op::ICMP | (predicate << 8)
}

/// Bounds-checked label resolution. The engine never materializes owned
/// pointers into the table; everything goes through this accessor.
pub trait LabelSource {
    fn label_info(&self, label: Label) -> Option<&LabelInfo>;
}

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shmget failed: {0}")]
    Create(io::Error),
    #[error("shmat failed: {0}")]
    Attach(io::Error),
}

/// Read-only view over the SysV shared-memory label table.
///
/// Owns the segment id: the mapping is detached and the id removed on drop.
pub struct ShmLabelTable {
    shm_id: i32,
    base: *const LabelInfo,
    capacity: usize,
}

impl ShmLabelTable {
    pub fn new(bytes: usize) -> Result<Self, ShmError> {
        let shm_id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                bytes,
                libc::IPC_CREAT | libc::SHM_NORESERVE | 0o600,
            )
        };
        if shm_id < 0 {
            return Err(ShmError::Create(io::Error::last_os_error()));
        }
        let base = unsafe { libc::shmat(shm_id, std::ptr::null(), libc::SHM_RDONLY) };
        if base as isize == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };
            return Err(ShmError::Attach(err));
        }
        Ok(Self {
            shm_id,
            base: base as *const LabelInfo,
            capacity: bytes / std::mem::size_of::<LabelInfo>(),
        })
    }

    /// Segment id, handed to the child so its runtime can attach writable.
    pub fn shm_id(&self) -> i32 {
        self.shm_id
    }
}

impl LabelSource for ShmLabelTable {
    fn label_info(&self, label: Label) -> Option<&LabelInfo> {
        ((label as usize) < self.capacity).then(|| unsafe { &*self.base.add(label as usize) })
    }
}

impl Drop for ShmLabelTable {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.base as *const libc::c_void);
            libc::shmctl(self.shm_id, libc::IPC_RMID, std::ptr::null_mut());
        }
    }
}

/// In-memory label table for tests.
#[cfg(test)]
pub(crate) struct VecLabelTable(pub Vec<LabelInfo>);

#[cfg(test)]
impl LabelSource for VecLabelTable {
    fn label_info(&self, label: Label) -> Option<&LabelInfo> {
        self.0.get(label as usize)
    }
}
