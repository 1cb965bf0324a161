//! Constraint-driven mutation engine for coverage-guided fuzzers.
//!
//! An instrumented target runs under a taint-tracking runtime and streams its
//! symbolic branch predicates over a pipe. For every predicate whose untaken
//! side still looks interesting, this crate rebuilds the predicate as an
//! expression over input bytes, negates it, flattens the negation into a
//! disjunction of relational clauses, and hands each clause to a solver as a
//! self-contained search task. Solved tasks come back as concrete input
//! mutations for the host fuzzer to validate.

pub mod cov;
pub mod driver;
pub mod expr;
pub mod msg;
pub mod shmem;
pub mod solve;

pub(crate) use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

#[cfg(test)]
mod tests;

// Hard cap on staged inputs, matching the usual fuzzer file limit.
pub(crate) const MAX_INPUT_SIZE: usize = 1 << 20; // 1 MiB

pub use cov::{BranchContext, CovManager, EdgeCovManager};
pub use driver::{Engine, EngineError, EngineOpts};
pub use expr::{AstKind, AstNode, ExprError};
pub use shmem::{Label, LabelInfo, LabelSource, ShmLabelTable};
pub use solve::task::{ConsMeta, Constraint, ConstraintRef, SearchTask, TaskRef};
pub use solve::{FifoTaskManager, Solver, SolverStatus, TaskManager};
