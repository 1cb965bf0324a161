//! Constraints and search tasks.
//!
//! A [`Constraint`] is one relational expression plus its input-argument
//! mapping; it is immutable after build and shared by handle across every
//! task that mentions it. A [`SearchTask`] aggregates the constraints of one
//! DNF clause and owns all per-task mutable state, most importantly the
//! re-binding of each constraint's argument slots onto the task-wide input
//! array.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use bitvec::array::BitArray;
use log::warn;

use crate::expr::{AstKind, AstNode, AST_KIND_COUNT};
use crate::HashMap;

/// Which ops occur in a constraint, indexed by `AstKind`.
pub type OpSet = BitArray<[u64; (AST_KIND_COUNT + 63) / 64]>;

/// First two slots of the argument array are reserved for the comparison
/// operands.
pub const RET_OFFSET: usize = 2;

/// atoi annotation: (result length, base, string length).
pub type AtoiInfo = (u32, u32, u32);

#[derive(Debug, Clone, Default)]
pub struct Constraint {
    /// Relational root (or `Memcmp`/`MemcmpN` for content-copy constraints).
    pub ast: AstNode,
    /// Comparison kind recorded when the constraint was first built. Kept
    /// separately from `ast` because formula rewriting may negate it; tasks
    /// re-bind their own view in [`ConsMeta`].
    pub comparison: AstKind,
    /// Input offset -> index into `input_args`. Ordered: walking it yields
    /// offsets ascending.
    pub local_map: BTreeMap<u32, u32>,
    /// Argument slots: `(true, _)` entries are symbolic and get their global
    /// index bound at task finalization; `(false, v)` entries hold literal v.
    pub input_args: Vec<(bool, u64)>,
    /// Input offset -> byte value at build time.
    pub inputs: HashMap<u32, u8>,
    /// Input offset -> group width for the first byte of each read group,
    /// 0 for the rest.
    pub shapes: HashMap<u32, u32>,
    /// Offset -> atoi annotation.
    pub atoi_info: HashMap<u32, AtoiInfo>,
    /// Ops appearing anywhere in the tree.
    pub ops: OpSet,
    /// Number of constant slots in `input_args`.
    pub const_num: u32,
    /// Concrete operand snapshots from the originating record.
    pub op1: u64,
    pub op2: u64,
    /// Known content for `Memcmp`/`MemcmpN` constraints.
    pub memcmp_data: Option<Vec<u8>>,
}

impl Constraint {
    pub fn is_memcmp(&self) -> bool {
        matches!(self.comparison, AstKind::Memcmp | AstKind::MemcmpN)
    }
}

pub type ConstraintRef = Rc<Constraint>;

/// Per-task view of one shared constraint.
#[derive(Debug, Clone, Default)]
pub struct ConsMeta {
    /// Copy of the constraint's argument slots with symbolic entries rebound
    /// to indices into the task's global input array.
    pub input_args: Vec<(bool, u64)>,
    /// Effective comparison for this task (formula rewriting may have negated
    /// the shared constraint's).
    pub comparison: AstKind,
    /// Maximal runs of consecutive input offsets, as (start, length); hints
    /// for input-to-state inference.
    pub i2s_candidates: Vec<(u32, u32)>,
    pub op1: u64,
    pub op2: u64,
}

/// One solvable unit: the constraints of a single DNF clause plus the scratch
/// state solvers mutate. Created per clause, finalized exactly once, then
/// read-mostly.
#[derive(Debug, Default)]
pub struct SearchTask {
    /// Shared, strictly read-only constraints.
    pub constraints: Vec<ConstraintRef>,
    /// Per-clause comparison kinds, one per constraint.
    pub comparisons: Vec<AstKind>,
    /// Per-constraint mutable metadata, filled by [`SearchTask::finalize`].
    pub consmeta: Vec<ConsMeta>,

    /// Union of all constraint inputs as (offset, initial value), in
    /// first-insertion order.
    pub inputs: Vec<(u32, u8)>,
    /// Offset -> group width.
    pub shapes: HashMap<u32, u32>,
    /// Aggregated atoi annotations.
    pub atoi_info: HashMap<u32, AtoiInfo>,
    /// Maximum constant count over the constraints.
    pub max_const_num: u32,
    /// Global input index -> constraints using that byte (memcmp constraints
    /// excluded; they do not participate in gradient search).
    pub cmap: HashMap<u32, Vec<usize>>,
    /// Flat argument array shared by all of this task's evaluations; sized
    /// `RET_OFFSET + inputs + max_const_num + 1`, never reallocated.
    pub scratch_args: Vec<u64>,

    // solver scratch state
    pub min_distances: Vec<u64>,
    pub distances: Vec<u64>,
    pub plus_distances: Vec<u64>,
    pub minus_distances: Vec<u64>,

    pub start: Option<Instant>,
    pub stopped: bool,
    pub attempts: u32,

    pub solved: bool,
    /// Offset -> solved byte value.
    pub solution: HashMap<u32, u8>,

    /// Previously solved task to warm-start from.
    pub base_task: Option<TaskRef>,
    /// Reserved.
    pub skip_next: bool,
}

pub type TaskRef = Rc<RefCell<SearchTask>>;

impl SearchTask {
    pub fn has_finalized(&self) -> bool {
        !self.scratch_args.is_empty()
    }

    /// Aggregates the constraints: assigns every distinct input offset a
    /// global argument index, rebinds each constraint's symbolic slots onto
    /// it, records which constraints touch which byte, and collects the
    /// consecutive-offset runs used for input-to-state inference.
    pub fn finalize(&mut self) {
        debug_assert!(!self.has_finalized());
        let mut sym_map: HashMap<u32, u32> = HashMap::default();
        for i in 0..self.constraints.len() {
            let constraint = self.constraints[i].clone();
            let mut cm = ConsMeta {
                input_args: constraint.input_args.clone(),
                comparison: self.comparisons[i],
                i2s_candidates: Vec::new(),
                op1: constraint.op1,
                op2: constraint.op2,
            };
            let is_memcmp = matches!(cm.comparison, AstKind::Memcmp | AstKind::MemcmpN);

            let mut last_offset: Option<u32> = None;
            let mut run_len: u32 = 0;
            for (&offset, &local_idx) in &constraint.local_map {
                let global_idx = match sym_map.get(&offset) {
                    Some(&idx) => idx,
                    None => {
                        let idx = self.inputs.len() as u32;
                        sym_map.insert(offset, idx);
                        let value = constraint.inputs.get(&offset).copied().unwrap_or(0);
                        self.inputs.push((offset, value));
                        let shape = constraint.shapes.get(&offset).copied().unwrap_or(0);
                        self.shapes.insert(offset, shape);
                        idx
                    }
                };
                if !is_memcmp {
                    self.cmap.entry(global_idx).or_default().push(i);
                }
                if let Some(slot) = cm.input_args.get_mut(local_idx as usize) {
                    slot.1 = global_idx as u64;
                }

                // local_map iterates offsets in ascending order; a gap closes
                // the current consecutive run
                if let Some(last) = last_offset {
                    if last + 1 != offset {
                        cm.i2s_candidates.push((last + 1 - run_len, run_len));
                        run_len = 0;
                    }
                }
                last_offset = Some(offset);
                run_len += 1;
            }
            if let Some(last) = last_offset {
                cm.i2s_candidates.push((last + 1 - run_len, run_len));
            }

            for (&offset, &info) in &constraint.atoi_info {
                let str_len = info.2;
                for j in 0..str_len {
                    if sym_map.contains_key(&(offset + j)) {
                        warn!("atoi byte {} used by other constraints", offset + j);
                    }
                }
                match self.atoi_info.get(&offset) {
                    Some(existing) if *existing != info => {
                        warn!("conflicting atoi annotations at offset {offset}");
                    }
                    _ => {
                        self.atoi_info.insert(offset, info);
                    }
                }
            }

            self.max_const_num = self.max_const_num.max(constraint.const_num);
            self.consmeta.push(cm);
        }

        self.scratch_args =
            vec![0; RET_OFFSET + self.inputs.len() + self.max_const_num as usize + 1];
        let n = self.constraints.len();
        self.min_distances = vec![0; n];
        self.distances = vec![0; n];
        self.plus_distances = vec![0; n];
        self.minus_distances = vec![0; n];
    }

    /// Overwrites initial values with the base task's solution where offsets
    /// overlap.
    pub fn load_hint(&mut self) {
        let Some(base) = self.base_task.clone() else {
            return;
        };
        let base = base.borrow();
        if !base.solved {
            return;
        }
        for (offset, value) in &mut self.inputs {
            if let Some(&solved) = base.solution.get(offset) {
                *value = solved;
            }
        }
    }
}
