//! Branch identity and the coverage seam.
//!
//! The engine only asks one question of coverage: "is the negated side of
//! this branch worth solving for?". The default manager answers it with a
//! virgin bitmap over (id, context, direction) edges, AFL-sized.

use bitvec::bitvec;
use bitvec::vec::BitVec;

use crate::expr::xxhash;

pub(crate) const BRANCH_MAP_SIZE: usize = 1 << 16;

/// Identity of one observed branch direction. Two contexts are equal iff all
/// fields match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BranchContext {
    pub addr: u64,
    pub id: u32,
    pub direction: bool,
    pub context: u32,
    pub is_loop: bool,
    pub is_unreachable: bool,
}

impl BranchContext {
    /// Same branch, opposite direction.
    pub fn negated(&self) -> Self {
        Self {
            direction: !self.direction,
            ..self.clone()
        }
    }
}

pub trait CovManager {
    fn add_branch(
        &mut self,
        addr: u64,
        id: u32,
        direction: bool,
        context: u32,
        is_loop: bool,
        is_unreachable: bool,
    ) -> BranchContext;

    /// Whether solving toward `ctx` could reach something new. Claims the
    /// edge: asking again for the same context returns false.
    fn is_branch_interesting(&mut self, ctx: &BranchContext) -> bool;
}

/// Default coverage: a virgin bitmap indexed by the hashed
/// (id, context, direction) edge.
pub struct EdgeCovManager {
    virgin: BitVec,
}

impl EdgeCovManager {
    pub fn new() -> Self {
        Self {
            virgin: bitvec![0; BRANCH_MAP_SIZE * 2],
        }
    }

    fn slot(ctx: &BranchContext) -> usize {
        xxhash(ctx.id, ctx.context, ctx.direction as u32) as usize % (BRANCH_MAP_SIZE * 2)
    }
}

impl Default for EdgeCovManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CovManager for EdgeCovManager {
    fn add_branch(
        &mut self,
        addr: u64,
        id: u32,
        direction: bool,
        context: u32,
        is_loop: bool,
        is_unreachable: bool,
    ) -> BranchContext {
        BranchContext {
            addr,
            id,
            direction,
            context,
            is_loop,
            is_unreachable,
        }
    }

    fn is_branch_interesting(&mut self, ctx: &BranchContext) -> bool {
        if ctx.is_unreachable {
            return false;
        }
        let slot = Self::slot(ctx);
        let seen = self.virgin[slot];
        if !seen {
            self.virgin.set(slot, true);
        }
        !seen
    }
}
