//! Operation vocabulary recorded by the graph builder.
//!
//! Every operation the expression core can fuse is a variant of [`Operation`],
//! carrying its parameter payload inline. Code generation and the reference
//! interpreter both match exhaustively over this enum, so adding a variant
//! without a lowering fails to compile rather than silently dropping the op.

use serde::{Deserialize, Serialize};

use crate::dtype::{DType, Shape};

/// Elementwise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Tanh,
    Erf,
    Sqrt,
    Rsqrt,
    Reciprocal,
}

impl UnaryOp {
    /// Transcendentals and reciprocals only make sense on floats; `Neg`/`Abs`
    /// accept any signed numeric type.
    pub fn accepts(self, dtype: DType) -> bool {
        match self {
            UnaryOp::Neg | UnaryOp::Abs => dtype.is_numeric(),
            _ => dtype.is_float(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Erf => "erf",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Rsqrt => "rsqrt",
            UnaryOp::Reciprocal => "recip",
        }
    }
}

/// Elementwise binary operations.
///
/// `Maximum`/`Minimum` are comparison-based: `if l > r { l } else { r }` and
/// `if l < r { l } else { r }`. A NaN on the left fails the comparison and
/// falls through to the right operand. Every backend dialect emits the same
/// comparison, so the rule is portable by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Minimum => "minimum",
        }
    }
}

/// Parameter payload for element type conversion.
///
/// Float-to-integer casts saturate at the integer range and map NaN to zero.
/// Casting to `I1` produces `value != 0`. These rules are fixed here, not per
/// backend, so fused and eager evaluation agree bit-for-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

/// Parameter payload for the wrapped-shift indexing operation.
///
/// `offset[axis]` elements are added to each coordinate, modulo the extent.
/// The input is read at the shifted coordinate, so the input must already be
/// materialized; the planner cuts fusion below a shift.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShiftSpec {
    pub offset: Vec<i64>,
}

/// Closed operation vocabulary with per-variant parameter payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Cast(CastSpec),
    Select,
    Shift(ShiftSpec),
}

/// Construction-time failures raised by [`record_operation`](crate::graph::Context::record_operation).
///
/// Both are local to the offending call: the graph is never modified when one
/// of these is returned.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("{op} expects {expected} operand(s), got {got}")]
    ArityMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{op}: {detail}")]
    TypeMismatch { op: &'static str, detail: String },
}

impl Operation {
    /// Declared operand count.
    pub fn arity(&self) -> usize {
        match self {
            Operation::Unary(_) | Operation::Cast(_) | Operation::Shift(_) => 1,
            Operation::Binary(_) => 2,
            Operation::Select => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Unary(op) => op.name(),
            Operation::Binary(op) => op.name(),
            Operation::Cast(_) => "cast",
            Operation::Select => "select",
            Operation::Shift(_) => "shift",
        }
    }

    /// Whether the planner may recompute this node in more than one kernel
    /// instead of materializing it when it has several consumers.
    pub fn is_trivially_cheap(&self) -> bool {
        matches!(
            self,
            Operation::Unary(UnaryOp::Neg) | Operation::Unary(UnaryOp::Abs) | Operation::Cast(_)
        )
    }

    /// Whether fusion may continue through this operation's operands.
    ///
    /// Indexing operations read their input at remapped coordinates, which is
    /// only expressible against materialized data.
    pub fn fuses_through_operands(&self) -> bool {
        !matches!(self, Operation::Shift(_))
    }

    /// Validates operand types/shapes and derives the result spec.
    ///
    /// The checks mirror the construction-error taxonomy: operand count is the
    /// caller's responsibility (`ArityMismatch` is raised before this runs);
    /// everything here surfaces as `TypeMismatch`.
    pub fn result_spec(
        &self,
        operands: &[(DType, &Shape)],
    ) -> Result<(DType, Shape), GraphError> {
        debug_assert_eq!(operands.len(), self.arity());
        let mismatch = |detail: String| GraphError::TypeMismatch {
            op: self.name(),
            detail,
        };

        match self {
            Operation::Unary(op) => {
                let (dtype, shape) = operands[0];
                if !op.accepts(dtype) {
                    return Err(mismatch(format!("not defined for {}", dtype.name())));
                }
                Ok((dtype, shape.clone()))
            }
            Operation::Binary(_) => {
                let (ld, ls) = operands[0];
                let (rd, rs) = operands[1];
                if ld != rd {
                    return Err(mismatch(format!(
                        "operand dtypes differ: {} vs {}",
                        ld.name(),
                        rd.name()
                    )));
                }
                if !ld.is_numeric() {
                    return Err(mismatch(format!("not defined for {}", ld.name())));
                }
                let shape = Shape::broadcast(ls, rs)
                    .ok_or_else(|| mismatch(format!("shapes {ls} and {rs} do not broadcast")))?;
                Ok((ld, shape))
            }
            Operation::Cast(spec) => {
                let (_, shape) = operands[0];
                Ok((spec.dtype, shape.clone()))
            }
            Operation::Select => {
                let (cd, cs) = operands[0];
                let (ad, as_) = operands[1];
                let (bd, bs) = operands[2];
                if cd != DType::I1 {
                    return Err(mismatch(format!(
                        "condition must be i1, got {}",
                        cd.name()
                    )));
                }
                if ad != bd {
                    return Err(mismatch(format!(
                        "branch dtypes differ: {} vs {}",
                        ad.name(),
                        bd.name()
                    )));
                }
                let branches = Shape::broadcast(as_, bs)
                    .ok_or_else(|| mismatch(format!("shapes {as_} and {bs} do not broadcast")))?;
                let shape = Shape::broadcast(cs, &branches).ok_or_else(|| {
                    mismatch(format!("condition shape {cs} does not broadcast"))
                })?;
                Ok((ad, shape))
            }
            Operation::Shift(spec) => {
                let (dtype, shape) = operands[0];
                if spec.offset.len() != shape.rank() {
                    return Err(mismatch(format!(
                        "offset rank {} does not match input rank {}",
                        spec.offset.len(),
                        shape.rank()
                    )));
                }
                Ok((dtype, shape.clone()))
            }
        }
    }
}
