//! Boolean-formula rewrites over skeletons: negation normal form, then
//! disjunctive normal form. Each DNF clause later becomes one search task.

use super::{AstKind, AstNode};

/// Pushes negation down to the relational leaves. `expected == true` asks for
/// the formula as seen; `false` asks for its negation. `LNot` nodes are
/// eliminated by flipping `expected` for their child.
pub(crate) fn to_nnf(expected: bool, node: &mut AstNode) {
    match node.kind {
        AstKind::LNot => {
            if let Some(mut child) = node.children.pop() {
                to_nnf(!expected, &mut child);
                *node = child;
            }
        }
        AstKind::LAnd => {
            if !expected {
                node.kind = AstKind::LOr;
            }
            for child in &mut node.children {
                to_nnf(expected, child);
            }
        }
        AstKind::LOr => {
            if !expected {
                node.kind = AstKind::LAnd;
            }
            for child in &mut node.children {
                to_nnf(expected, child);
            }
        }
        AstKind::Xor => {
            // a ^ b negates by negating one side
            if !expected {
                if let Some(first) = node.children.first_mut() {
                    to_nnf(false, first);
                }
                for child in node.children.iter_mut().skip(1) {
                    to_nnf(true, child);
                }
            } else {
                for child in &mut node.children {
                    to_nnf(true, child);
                }
            }
        }
        kind if kind.is_relational() => {
            if !expected {
                node.kind = kind.negate();
            }
        }
        _ => {}
    }
}

/// Flattens an NNF skeleton into a disjunction of conjunctions, returned as
/// clauses of leaf references. A conjunction multiplies out its children's
/// clause lists; a pure-constant side leaves the other side unchanged.
pub(crate) fn to_dnf(node: &AstNode) -> Vec<Vec<&AstNode>> {
    match node.kind {
        AstKind::LAnd if node.children.len() == 2 => {
            let left = to_dnf(&node.children[0]);
            let right = to_dnf(&node.children[1]);
            if left.is_empty() {
                return right;
            }
            if right.is_empty() {
                return left;
            }
            let mut formula = Vec::with_capacity(left.len() * right.len());
            for a in &left {
                for b in &right {
                    let mut clause = a.clone();
                    clause.extend_from_slice(b);
                    formula.push(clause);
                }
            }
            formula
        }
        AstKind::LOr if node.children.len() == 2 => {
            let mut formula = to_dnf(&node.children[0]);
            formula.extend(to_dnf(&node.children[1]));
            formula
        }
        _ => vec![vec![node]],
    }
}
