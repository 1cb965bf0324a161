//! Extracts the boolean skeleton of a branch predicate.
//!
//! Walks the same label graph as the builder but keeps only the boolean
//! structure, treating each comparison as an atomic leaf that still carries
//! its label. Boolean identities are folded on the way up, so a skeleton that
//! collapses to a constant means there is nothing to negate.

use log::warn;

use super::{AstKind, AstNode, ExprError};
use crate::shmem::{base_op, icmp_pred, op, pred, Label, LabelInfo, LabelSource, CONST_OFFSET, INIT_LABEL};
use crate::HashSet;

pub(crate) struct RootFinder<'a> {
    table: &'a dyn LabelSource,
}

impl<'a> RootFinder<'a> {
    pub fn new(table: &'a dyn LabelSource) -> Self {
        Self { table }
    }

    fn info(&self, label: Label) -> Result<&LabelInfo, ExprError> {
        if label < CONST_OFFSET || label == INIT_LABEL {
            return Err(ExprError::InvalidLabel(label));
        }
        self.table
            .label_info(label)
            .ok_or(ExprError::InvalidLabel(label))
    }

    /// Returns the boolean skeleton rooted at `label` and whether any
    /// relational leaf was emitted under it. A skeleton without leaves is a
    /// `Bool` constant.
    pub fn find_roots(&self, label: Label) -> Result<(AstNode, bool), ExprError> {
        let mut visited = HashSet::default();
        self.walk(label, &mut visited)
    }

    fn walk(
        &self,
        label: Label,
        visited: &mut HashSet<Label>,
    ) -> Result<(AstNode, bool), ExprError> {
        if !visited.insert(label) {
            // deduplicated within one walk; the caller sees a constant
            return Ok((AstNode::bool_node(0), false));
        }
        let info = *self.info(label)?;

        if info.op == 0 || info.op == op::LOAD {
            return Ok((AstNode::bool_node(0), false));
        }

        match base_op(info.op) {
            op::AND => self.simplify_land(&info, visited),
            op::OR => self.simplify_lor(&info, visited),
            op::XOR => self.simplify_xor(&info, visited),
            op::ICMP => self.icmp_root(label, &info, visited),
            _ => self.visit_operands(&info, visited),
        }
    }

    /// Non-boolean interior op: no skeleton node of its own, just surface
    /// whatever the operands contain.
    fn visit_operands(
        &self,
        info: &LabelInfo,
        visited: &mut HashSet<Label>,
    ) -> Result<(AstNode, bool), ExprError> {
        let mut node = AstNode::bool_node(0);
        let mut added = false;
        if info.l2 >= CONST_OFFSET {
            let (n, a) = self.walk(info.l2, visited)?;
            if a {
                node = n;
            }
            added |= a;
        }
        if info.l1 >= CONST_OFFSET {
            let (n, a) = self.walk(info.l1, visited)?;
            if a {
                node = n;
            }
            added |= a;
        }
        Ok((node, added))
    }

    /// Follows a chain of ZExt records; if it bottoms out at a 1-bit value,
    /// that value's label is returned (compilers widen booleans this way).
    fn strip_zext(&self, label: Label) -> Result<Label, ExprError> {
        if label < CONST_OFFSET {
            return Ok(label);
        }
        let mut info = *self.info(label)?;
        while base_op(info.op) == op::ZEXT {
            let inner = info.l1;
            if inner < CONST_OFFSET {
                return Ok(label);
            }
            info = *self.info(inner)?;
            if info.size == 1 {
                return Ok(inner);
            }
        }
        Ok(label)
    }

    /// Peels zexts off both operands. When neither operand strips and the
    /// record is wider than a bit, this is a plain bitwise op, handled
    /// generically; `None` is returned for that case.
    #[allow(clippy::type_complexity)]
    fn boolean_operands(
        &self,
        info: &LabelInfo,
        visited: &mut HashSet<Label>,
    ) -> Result<Option<(Label, (AstNode, bool))>, ExprError> {
        let lhs = if info.l1 >= CONST_OFFSET {
            self.strip_zext(info.l1)?
        } else {
            0
        };
        let rhs = self.strip_zext(info.l2)?;
        if rhs == info.l2 && lhs == info.l1 && info.size != 1 {
            return Ok(None);
        }
        // the runtime keeps the rhs symbolic, so parse it first
        let right = if rhs >= CONST_OFFSET {
            self.walk(rhs, visited)?
        } else {
            (AstNode::bool_node(0), false)
        };
        Ok(Some((lhs, right)))
    }

    fn simplify_land(
        &self,
        info: &LabelInfo,
        visited: &mut HashSet<Label>,
    ) -> Result<(AstNode, bool), ExprError> {
        let Some((lhs, (right, rr))) = self.boolean_operands(info, visited)? else {
            return self.visit_operands(info, visited);
        };
        if !rr && right.bool_value == 0 {
            // x && 0 == 0
            return Ok((AstNode::bool_node(0), false));
        }
        if lhs == 0 {
            // literal lhs: 0 && x == 0, 1 && x == x
            return if info.op1 == 0 {
                Ok((AstNode::bool_node(0), false))
            } else {
                Ok((right, rr))
            };
        }
        let (left, lr) = self.walk(lhs, visited)?;
        match (lr, rr) {
            (false, _) if left.bool_value == 0 => Ok((AstNode::bool_node(0), false)),
            (false, false) => Ok((AstNode::bool_node(1), false)),
            (false, true) => Ok((right, true)),
            (true, false) => Ok((left, true)), // rhs folded to 1
            (true, true) => {
                let mut node = AstNode {
                    kind: AstKind::LAnd,
                    bits: 1,
                    ..AstNode::default()
                };
                node.children.push(right);
                node.children.push(left);
                Ok((node, true))
            }
        }
    }

    fn simplify_lor(
        &self,
        info: &LabelInfo,
        visited: &mut HashSet<Label>,
    ) -> Result<(AstNode, bool), ExprError> {
        let Some((lhs, (right, rr))) = self.boolean_operands(info, visited)? else {
            return self.visit_operands(info, visited);
        };
        if !rr && right.bool_value == 1 {
            // x || 1 == 1
            return Ok((AstNode::bool_node(1), false));
        }
        if lhs == 0 {
            // literal lhs: 1 || x == 1, 0 || x == x
            return if info.op1 == 1 {
                Ok((AstNode::bool_node(1), false))
            } else {
                Ok((right, rr))
            };
        }
        let (left, lr) = self.walk(lhs, visited)?;
        match (lr, rr) {
            (false, _) if left.bool_value == 1 => Ok((AstNode::bool_node(1), false)),
            (false, false) => Ok((AstNode::bool_node(0), false)),
            (false, true) => Ok((right, true)),
            (true, false) => Ok((left, true)), // rhs folded to 0
            (true, true) => {
                let mut node = AstNode {
                    kind: AstKind::LOr,
                    bits: 1,
                    ..AstNode::default()
                };
                node.children.push(right);
                node.children.push(left);
                Ok((node, true))
            }
        }
    }

    fn simplify_xor(
        &self,
        info: &LabelInfo,
        visited: &mut HashSet<Label>,
    ) -> Result<(AstNode, bool), ExprError> {
        let Some((lhs, (right, rr))) = self.boolean_operands(info, visited)? else {
            return self.visit_operands(info, visited);
        };
        if lhs == 0 {
            // xor against a literal is how compilers spell logical not
            if !rr {
                let value = right.bool_value ^ (info.op1 as u8 & 1);
                return Ok((AstNode::bool_node(value), false));
            }
            return if info.op1 & 1 == 1 {
                Ok((lnot(right), true))
            } else {
                Ok((right, true))
            };
        }
        let (left, lr) = self.walk(lhs, visited)?;
        match (lr, rr) {
            (false, false) => Ok((
                AstNode::bool_node(left.bool_value ^ right.bool_value),
                false,
            )),
            (false, true) => {
                if left.bool_value == 1 {
                    Ok((lnot(right), true))
                } else {
                    Ok((right, true))
                }
            }
            (true, false) => {
                if right.bool_value == 1 {
                    Ok((lnot(left), true))
                } else {
                    Ok((left, true))
                }
            }
            (true, true) => {
                let mut node = AstNode {
                    kind: AstKind::Xor,
                    bits: 1,
                    ..AstNode::default()
                };
                node.children.push(right);
                node.children.push(left);
                Ok((node, true))
            }
        }
    }

    fn icmp_root(
        &self,
        label: Label,
        info: &LabelInfo,
        visited: &mut HashSet<Label>,
    ) -> Result<(AstNode, bool), ExprError> {
        let (lnode, lr) = if info.l1 >= CONST_OFFSET {
            self.walk(self.strip_zext(info.l1)?, visited)?
        } else {
            (AstNode::bool_node(0), false)
        };
        let (rnode, rr) = if info.l2 >= CONST_OFFSET {
            self.walk(self.strip_zext(info.l2)?, visited)?
        } else {
            (AstNode::bool_node(0), false)
        };

        // A comparison over something that itself contains comparisons must
        // be a boolean tested against 0/1 under eq/ne; rewrite per parity.
        if lr {
            if info.l2 >= CONST_OFFSET {
                warn!("boolean compared against boolean at label {label}");
                return Ok((AstNode::bool_node(0), false));
            }
            return self.bool_cmp_const(label, info.op, info.op2, lnode);
        }
        if rr {
            if info.l1 >= CONST_OFFSET {
                warn!("boolean compared against boolean at label {label}");
                return Ok((AstNode::bool_node(0), false));
            }
            return self.bool_cmp_const(label, info.op, info.op1, rnode);
        }

        // both operands are leaf-level: this comparison is a sub-root
        let kind = AstKind::from_pred(icmp_pred(info.op)).ok_or(ExprError::UnknownOp {
            op: info.op,
            label,
        })?;
        let node = AstNode {
            kind,
            bits: 1,
            label,
            ..AstNode::default()
        };
        Ok((node, true))
    }

    fn bool_cmp_const(
        &self,
        label: Label,
        raw_op: u16,
        constant: u64,
        skeleton: AstNode,
    ) -> Result<(AstNode, bool), ExprError> {
        let predicate = icmp_pred(raw_op);
        if predicate != pred::EQ && predicate != pred::NE {
            warn!("boolean under non-equality comparison at label {label}");
            return Ok((AstNode::bool_node(0), false));
        }
        let keep = (predicate == pred::EQ && constant == 1)
            || (predicate == pred::NE && constant == 0);
        if keep {
            Ok((skeleton, true))
        } else {
            Ok((lnot(skeleton), true))
        }
    }
}

fn lnot(child: AstNode) -> AstNode {
    let mut node = AstNode {
        kind: AstKind::LNot,
        bits: 1,
        ..AstNode::default()
    };
    node.children.push(child);
    node
}
