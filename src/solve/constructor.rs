//! Turns one branch predicate into search tasks.
//!
//! The pipeline is: boolean skeleton extraction, negation-normal form for the
//! requested direction, disjunctive normal form, then one finalized
//! [`SearchTask`] per clause with constraints pulled from (or inserted into)
//! the per-input expression cache.

use std::cell::RefCell;
use std::rc::Rc;

use log::warn;

use crate::expr::builder::ExprBuilder;
use crate::expr::formula::{to_dnf, to_nnf};
use crate::expr::roots::RootFinder;
use crate::expr::{AstKind, AstNode, ExprError};
use crate::shmem::{op, Label, LabelSource, CONST_OFFSET, INIT_LABEL};
use crate::solve::task::{ConstraintRef, SearchTask, TaskRef};
use crate::{HashMap, HashSet};

pub(crate) struct TaskConstructor<'a> {
    pub table: &'a dyn LabelSource,
    pub buf: &'a [u8],
    pub expr_cache: &'a mut HashMap<Label, ConstraintRef>,
    pub input_dep_cache: &'a mut HashMap<Label, Rc<HashSet<u32>>>,
    pub memcmp_cache: &'a HashMap<Label, Vec<u8>>,
}

impl TaskConstructor<'_> {
    /// Parses the predicate under `label` into a DNF of relational clauses
    /// for the given target direction and builds one task per clause.
    pub fn construct_tasks(
        &mut self,
        target_direction: bool,
        label: Label,
    ) -> Result<Vec<TaskRef>, ExprError> {
        let finder = RootFinder::new(self.table);
        let (mut root, _) = finder.find_roots(label)?;
        if root.kind() == AstKind::Bool {
            // the skeleton folded to a constant, nothing to negate
            return Ok(Vec::new());
        }

        to_nnf(target_direction, &mut root);

        let mut tasks = Vec::new();
        for clause in to_dnf(&root) {
            match self.construct_task(&clause) {
                Ok(task) => tasks.push(task),
                Err(err) => warn!("dropping clause for label {label}: {err}"),
            }
        }
        Ok(tasks)
    }

    fn construct_task(&mut self, clause: &[&AstNode]) -> Result<TaskRef, ExprError> {
        let mut task = SearchTask::default();
        for leaf in clause {
            if !leaf.kind().is_relational() {
                return Err(ExprError::NonRelationalLeaf(leaf.kind()));
            }
            let constraint = match self.expr_cache.get(&leaf.label()) {
                Some(cached) => cached.clone(),
                None => {
                    let builder = ExprBuilder::new(self.table, self.buf, self.memcmp_cache);
                    let mut constraint = builder.parse_constraint(leaf.label())?;
                    if !constraint.is_memcmp() {
                        // the leaf kind carries any negation applied during
                        // the formula rewrite
                        constraint.comparison = leaf.kind();
                        constraint.ast.kind = leaf.kind();
                    }
                    let constraint = Rc::new(constraint);
                    self.expr_cache.insert(leaf.label(), constraint.clone());
                    constraint
                }
            };
            let comparison = if constraint.is_memcmp() {
                match leaf.kind() {
                    AstKind::Equal => AstKind::Memcmp,
                    AstKind::Distinct => AstKind::MemcmpN,
                    other => return Err(ExprError::NonRelationalLeaf(other)),
                }
            } else {
                leaf.kind()
            };
            task.comparisons.push(comparison);
            task.constraints.push(constraint);
        }
        task.finalize();
        Ok(Rc::new(RefCell::new(task)))
    }

    /// Set of input offsets the label's expression depends on, memoized per
    /// input. A condition with no dependencies cannot be steered by mutation.
    pub fn input_deps(&mut self, label: Label) -> Rc<HashSet<u32>> {
        collect_input_deps(self.table, self.input_dep_cache, label)
    }
}

fn collect_input_deps(
    table: &dyn LabelSource,
    cache: &mut HashMap<Label, Rc<HashSet<u32>>>,
    label: Label,
) -> Rc<HashSet<u32>> {
    if label < CONST_OFFSET || label == INIT_LABEL {
        return Rc::new(HashSet::default());
    }
    if let Some(deps) = cache.get(&label) {
        return deps.clone();
    }
    let mut deps = HashSet::default();
    if let Some(info) = table.label_info(label) {
        let info = *info;
        if info.op == 0 {
            deps.insert(info.op1 as u32);
        } else if info.op == op::LOAD {
            if let Some(first) = table.label_info(info.l1) {
                let start = first.op1 as u32;
                deps.extend(start..start.saturating_add(info.l2));
            }
        } else {
            for operand in [info.l1, info.l2] {
                if operand >= CONST_OFFSET && operand != INIT_LABEL {
                    deps.extend(collect_input_deps(table, cache, operand).iter().copied());
                }
            }
        }
    }
    let deps = Rc::new(deps);
    cache.insert(label, deps.clone());
    deps
}
