//! Expression trees rebuilt from the label table.

use std::fmt;

use thiserror::Error;
use xxhash_rust::xxh32::xxh32;

use crate::shmem::{op, pred, Label};

pub(crate) mod builder;
pub(crate) mod formula;
pub(crate) mod roots;

pub use builder::ExprBuilder;

/// Node kinds. Relational kinds are the only ones that may root a constraint;
/// `Memcmp`/`MemcmpN` mark constraints solved by copying known content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AstKind {
    #[default]
    Bool = 0,
    Constant,
    Read,
    Concat,
    Extract,
    ZExt,
    SExt,
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    Neg,
    Not,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    Equal,
    Distinct,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
    LOr,
    LAnd,
    LNot,
    Ite,
    Load,
    Memcmp,
    MemcmpN,
}

pub(crate) const AST_KIND_COUNT: usize = AstKind::MemcmpN as usize + 1;

impl AstKind {
    pub fn is_relational(self) -> bool {
        matches!(
            self,
            Self::Equal
                | Self::Distinct
                | Self::Ult
                | Self::Ule
                | Self::Ugt
                | Self::Uge
                | Self::Slt
                | Self::Sle
                | Self::Sgt
                | Self::Sge
        )
    }

    /// Logical negation of a relational kind.
    pub fn negate(self) -> Self {
        match self {
            Self::Equal => Self::Distinct,
            Self::Distinct => Self::Equal,
            Self::Ult => Self::Uge,
            Self::Ule => Self::Ugt,
            Self::Ugt => Self::Ule,
            Self::Uge => Self::Ult,
            Self::Slt => Self::Sge,
            Self::Sle => Self::Sgt,
            Self::Sgt => Self::Sle,
            Self::Sge => Self::Slt,
            other => other,
        }
    }

    pub(crate) fn from_pred(predicate: u16) -> Option<Self> {
        Some(match predicate {
            pred::EQ => Self::Equal,
            pred::NE => Self::Distinct,
            pred::UGT => Self::Ugt,
            pred::UGE => Self::Uge,
            pred::ULT => Self::Ult,
            pred::ULE => Self::Ule,
            pred::SGT => Self::Sgt,
            pred::SGE => Self::Sge,
            pred::SLT => Self::Slt,
            pred::SLE => Self::Sle,
            _ => return None,
        })
    }

    pub(crate) fn from_op(raw: u16) -> Option<Self> {
        Some(match raw {
            op::TRUNC | op::EXTRACT => Self::Extract,
            op::CONCAT => Self::Concat,
            op::ZEXT => Self::ZExt,
            op::SEXT => Self::SExt,
            op::ADD => Self::Add,
            op::SUB => Self::Sub,
            op::MUL => Self::Mul,
            op::UDIV => Self::UDiv,
            op::SDIV => Self::SDiv,
            op::UREM => Self::URem,
            op::SREM => Self::SRem,
            op::SHL => Self::Shl,
            op::LSHR => Self::LShr,
            op::ASHR => Self::AShr,
            op::AND => Self::And,
            op::OR => Self::Or,
            op::XOR => Self::Xor,
            _ => return None,
        })
    }
}

/// Structural hash over three words, used to share JIT'ed comparison functions
/// and cache entries across structurally equal expressions.
pub(crate) fn xxhash(h1: u32, h2: u32, h3: u32) -> u32 {
    let mut words = [0u8; 12];
    words[0..4].copy_from_slice(&h1.to_le_bytes());
    words[4..8].copy_from_slice(&h2.to_le_bytes());
    words[8..12].copy_from_slice(&h3.to_le_bytes());
    xxh32(&words, 0)
}

/// One node of a rebuilt expression.
///
/// `hash` is a pure function of the structure: leaves hash their width, kind
/// and argument index; interior nodes fold their ordered child hashes, with
/// every relational kind collapsed to `Bool` so the same operands share a
/// function regardless of which comparison sits on top.
#[derive(Debug, Clone, Default)]
pub struct AstNode {
    pub(crate) kind: AstKind,
    pub(crate) bits: u16,
    pub(crate) label: Label,
    pub(crate) index: u32,
    pub(crate) hash: u32,
    pub(crate) bool_value: u8,
    pub(crate) children: Vec<AstNode>,
}

impl AstNode {
    pub(crate) fn bool_node(value: u8) -> Self {
        Self {
            kind: AstKind::Bool,
            bits: 1,
            bool_value: value,
            ..Self::default()
        }
    }

    pub fn kind(&self) -> AstKind {
        self.kind
    }

    pub fn bits(&self) -> u16 {
        self.bits
    }

    pub fn label(&self) -> Label {
        self.label
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn bool_value(&self) -> u8 {
        self.bool_value
    }

    pub fn children(&self) -> &[AstNode] {
        &self.children
    }
}

impl fmt::Display for AstNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?}, {}, {}", self.kind, self.label, self.bits)?;
        for child in &self.children {
            write!(f, ", {child}")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("invalid label {0}")]
    InvalidLabel(Label),
    #[error("unknown op {op:#x} at label {label}")]
    UnknownOp { op: u16, label: Label },
    #[error("read of {len} bytes at offset {offset} past input of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("no cached content for memcmp label {0}")]
    MissingMemcmpData(Label),
    #[error("unsupported memcmp operand shape at label {0}")]
    MemcmpShape(Label),
    #[error("clause leaf is not relational (kind {0:?})")]
    NonRelationalLeaf(AstKind),
}
