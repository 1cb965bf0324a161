//! Rebuilds one relational predicate from the label table into an [`AstNode`]
//! tree while recording which input bytes it depends on.

use log::trace;

use super::{xxhash, AstKind, AstNode, ExprError};
use crate::shmem::{base_op, icmp_pred, is_icmp, op, pred, Label, LabelInfo, LabelSource, CONST_OFFSET, INIT_LABEL};
use crate::solve::task::Constraint;
use crate::{HashMap, HashSet};

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

pub struct ExprBuilder<'a> {
    table: &'a dyn LabelSource,
    buf: &'a [u8],
    memcmp_cache: &'a HashMap<Label, Vec<u8>>,
}

impl<'a> ExprBuilder<'a> {
    pub fn new(
        table: &'a dyn LabelSource,
        buf: &'a [u8],
        memcmp_cache: &'a HashMap<Label, Vec<u8>>,
    ) -> Self {
        Self {
            table,
            buf,
            memcmp_cache,
        }
    }

    fn info(&self, label: Label) -> Result<&LabelInfo, ExprError> {
        if label < CONST_OFFSET || label == INIT_LABEL {
            return Err(ExprError::InvalidLabel(label));
        }
        self.table
            .label_info(label)
            .ok_or(ExprError::InvalidLabel(label))
    }

    /// Builds the constraint rooted at `label`, which must be a comparison
    /// record. The returned constraint owns its tree and argument mapping;
    /// nothing is shared with other builds.
    pub fn parse_constraint(&self, label: Label) -> Result<Constraint, ExprError> {
        let info = *self.info(label)?;
        trace!("constructing constraint for label {label}");
        debug_assert!(is_icmp(info.op));

        let mut constraint = Constraint::default();
        if self.build_memcmp(&info, &mut constraint)? {
            return Ok(constraint);
        }

        let mut visited = HashSet::default();
        let mut root = AstNode::default();
        self.build(label, &mut root, &mut constraint, &mut visited)?;
        constraint.comparison = root.kind;
        constraint.op1 = info.op1;
        constraint.op2 = info.op2;
        constraint.ast = root;
        Ok(constraint)
    }

    fn build(
        &self,
        label: Label,
        node: &mut AstNode,
        constraint: &mut Constraint,
        visited: &mut HashSet<Label>,
    ) -> Result<(), ExprError> {
        let info = *self.info(label)?;
        trace!(
            "{label} = (l1:{}, l2:{}, op:{}, size:{}, op1:{}, op2:{})",
            info.l1,
            info.l2,
            info.op,
            info.size,
            info.op1,
            info.op2
        );

        // Nodes can't be shared across constraints, but duplicates within one
        // constraint collapse to a placeholder carrying just label and width.
        if visited.contains(&label) {
            node.label = label;
            node.bits = info.size;
            return Ok(());
        }

        if info.op == 0 {
            // input byte terminal
            let offset = info.op1 as usize;
            if offset >= self.buf.len() {
                return Err(ExprError::OutOfBounds {
                    offset,
                    len: 1,
                    size: self.buf.len(),
                });
            }
            node.kind = AstKind::Read;
            node.bits = 8;
            node.label = label;
            node.index = offset as u32;
            node.hash = self.map_arg(constraint, offset, 1);
            constraint.ops.set(AstKind::Read as usize, true);
            return Ok(());
        }

        if info.op == op::LOAD {
            let offset = self.info(info.l1)?.op1 as usize;
            let len = info.l2 as usize;
            if offset + len > self.buf.len() {
                return Err(ExprError::OutOfBounds {
                    offset,
                    len,
                    size: self.buf.len(),
                });
            }
            node.kind = AstKind::Read;
            node.bits = (len * 8) as u16;
            node.label = label;
            node.index = offset as u32;
            node.hash = self.map_arg(constraint, offset, len);
            constraint.ops.set(AstKind::Read as usize, true);
            return Ok(());
        }

        let kind = if is_icmp(info.op) {
            AstKind::from_pred(icmp_pred(info.op))
        } else {
            AstKind::from_op(info.op)
        }
        .ok_or(ExprError::UnknownOp { op: info.op, label })?;

        node.kind = kind;
        node.bits = info.size;
        node.label = label;
        constraint.ops.set(kind as usize, true);

        let mut left = AstNode::default();
        if info.l1 >= CONST_OFFSET {
            self.build(info.l1, &mut left, constraint, visited)?;
            visited.insert(info.l1);
        } else {
            self.constant_leaf(&mut left, &info, constraint, Side::Left)?;
        }
        node.children.push(left);

        if matches!(base_op(info.op), op::ZEXT | op::SEXT | op::EXTRACT | op::TRUNC) {
            node.hash = xxhash(info.size as u32, kind as u32, node.children[0].hash);
            // Extract records its low-bit offset
            node.index = if base_op(info.op) == op::EXTRACT {
                info.op2 as u32
            } else {
                0
            };
            return Ok(());
        }

        let mut right = AstNode::default();
        if info.l2 >= CONST_OFFSET {
            self.build(info.l2, &mut right, constraint, visited)?;
            visited.insert(info.l2);
        } else {
            self.constant_leaf(&mut right, &info, constraint, Side::Right)?;
        }
        node.children.push(right);

        // Comparisons hash as a single Bool tag: as long as the operands
        // match, the same function works for any of them.
        let hash_kind = if kind.is_relational() {
            AstKind::Bool
        } else {
            kind
        };
        node.hash = xxhash(
            node.children[0].hash,
            ((hash_kind as u32) << 16) | info.size as u32,
            node.children[1].hash,
        );
        Ok(())
    }

    fn constant_leaf(
        &self,
        node: &mut AstNode,
        info: &LabelInfo,
        constraint: &mut Constraint,
        side: Side,
    ) -> Result<(), ExprError> {
        let mut size = info.size;
        // A concat's size covers both operands; the constant side is whatever
        // the symbolic side leaves over.
        if base_op(info.op) == op::CONCAT {
            let other = match side {
                Side::Left => info.l2,
                Side::Right => info.l1,
            };
            size = size.saturating_sub(self.info(other)?.size);
        }
        node.kind = AstKind::Constant;
        node.bits = size;
        node.label = 0;
        let arg_index = constraint.input_args.len() as u32;
        node.index = arg_index;
        let value = match side {
            Side::Left => info.op1,
            Side::Right => info.op2,
        };
        constraint.input_args.push((false, value));
        constraint.const_num += 1;
        constraint.ops.set(AstKind::Constant as usize, true);
        node.hash = xxhash(size as u32, AstKind::Constant as u32, arg_index);
        Ok(())
    }

    /// Records each byte of `[offset, offset + len)` in the constraint's
    /// argument mapping and returns the leaf hash for the group.
    fn map_arg(&self, constraint: &mut Constraint, offset: usize, len: usize) -> u32 {
        let mut hash = 0;
        for i in 0..len {
            let off = (offset + i) as u32;
            let arg_index = match constraint.local_map.get(&off) {
                Some(&idx) => idx,
                None => {
                    let idx = constraint.input_args.len() as u32;
                    constraint.inputs.insert(off, self.buf[offset + i]);
                    constraint.local_map.insert(off, idx);
                    constraint.input_args.push((true, 0));
                    idx
                }
            };
            if i == 0 {
                constraint.shapes.insert(off, len as u32);
                hash = xxhash((len * 8) as u32, AstKind::Read as u32, arg_index);
            } else {
                constraint.shapes.insert(off, 0);
            }
        }
        hash
    }

    /// Detects `memcmp(sym, known, n) ==/!= 0` roots and builds them as
    /// content-copy constraints. The runtime only ships content when one
    /// operand is concrete, and pipe ordering guarantees the cache entry
    /// precedes any branch on the result.
    fn build_memcmp(
        &self,
        info: &LabelInfo,
        constraint: &mut Constraint,
    ) -> Result<bool, ExprError> {
        if !is_icmp(info.op) {
            return Ok(false);
        }
        let predicate = icmp_pred(info.op);
        if predicate != pred::EQ && predicate != pred::NE {
            return Ok(false);
        }
        let is_memcmp_label = |label: Label| {
            label >= CONST_OFFSET
                && self
                    .table
                    .label_info(label)
                    .is_some_and(|i| i.op == op::MEMCMP)
        };
        let (mlabel, rhs) = if is_memcmp_label(info.l1) && info.l2 < CONST_OFFSET {
            (info.l1, info.op2)
        } else if is_memcmp_label(info.l2) && info.l1 < CONST_OFFSET {
            (info.l2, info.op1)
        } else {
            return Ok(false);
        };
        if rhs != 0 {
            // ordered comparison against the memcmp result, not a match test
            return Ok(false);
        }

        let minfo = *self.info(mlabel)?;
        let data = self
            .memcmp_cache
            .get(&mlabel)
            .ok_or(ExprError::MissingMemcmpData(mlabel))?;

        // The symbolic operand must be one contiguous read for content copy
        // to make sense.
        let sym = if minfo.l1 >= CONST_OFFSET {
            minfo.l1
        } else {
            minfo.l2
        };
        let sinfo = *self.info(sym)?;
        let (offset, len) = if sinfo.op == op::LOAD {
            (self.info(sinfo.l1)?.op1 as usize, sinfo.l2 as usize)
        } else if sinfo.op == 0 {
            (sinfo.op1 as usize, 1)
        } else {
            return Err(ExprError::MemcmpShape(mlabel));
        };
        if len != data.len() {
            return Err(ExprError::MemcmpShape(mlabel));
        }
        if offset + len > self.buf.len() {
            return Err(ExprError::OutOfBounds {
                offset,
                len,
                size: self.buf.len(),
            });
        }

        let mut read = AstNode {
            kind: AstKind::Read,
            bits: (len * 8) as u16,
            label: sym,
            index: offset as u32,
            ..AstNode::default()
        };
        read.hash = self.map_arg(constraint, offset, len);

        let mut root = AstNode {
            kind: AstKind::Memcmp,
            bits: read.bits,
            label: mlabel,
            ..AstNode::default()
        };
        root.hash = xxhash(root.bits as u32, AstKind::Memcmp as u32, read.hash);
        root.children.push(read);

        constraint.ops.set(AstKind::Read as usize, true);
        constraint.ops.set(AstKind::Memcmp as usize, true);
        constraint.comparison = AstKind::Memcmp;
        constraint.memcmp_data = Some(data.clone());
        constraint.ast = root;
        Ok(true)
    }
}
