//! C-like kernel source emission.
//!
//! One guarded global-thread body per kernel: a load per directly-read input
//! (broadcast index arithmetic folded into the load), one SSA assignment per
//! step in dependency order, and a single store of the final step. Numeric
//! semantics are fixed by the operation vocabulary and mirrored exactly by
//! the reference interpreter, so fused and eager results agree across
//! backends.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::dtype::{DType, Shape};
use crate::op::{BinaryOp, Operation, UnaryOp};

use super::program::{KernelProgram, StepArg};

fn c_type(dtype: DType) -> &'static str {
    match dtype {
        DType::I1 => "char",
        DType::Si32 => "int",
        DType::Si64 => "long",
        DType::F32 => "float",
        DType::F64 => "double",
    }
}

fn math_call(base: &str, dtype: DType, arg: &str) -> String {
    match dtype {
        DType::F32 => format!("{base}f({arg})"),
        _ => format!("{base}({arg})"),
    }
}

fn one(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "1.0f",
        _ => "1.0",
    }
}

fn unary_expr(op: UnaryOp, dtype: DType, arg: &str) -> String {
    match op {
        UnaryOp::Neg => format!("-({arg})"),
        UnaryOp::Abs if dtype.is_float() => math_call("fabs", dtype, arg),
        UnaryOp::Abs => format!("(({arg}) < 0 ? -({arg}) : ({arg}))"),
        UnaryOp::Exp => math_call("exp", dtype, arg),
        UnaryOp::Log => math_call("log", dtype, arg),
        UnaryOp::Tanh => math_call("tanh", dtype, arg),
        UnaryOp::Erf => math_call("erf", dtype, arg),
        UnaryOp::Sqrt => math_call("sqrt", dtype, arg),
        UnaryOp::Rsqrt => format!("({} / {})", one(dtype), math_call("sqrt", dtype, arg)),
        UnaryOp::Reciprocal => format!("({} / ({arg}))", one(dtype)),
    }
}

fn binary_expr(op: BinaryOp, lhs: &str, rhs: &str) -> String {
    match op {
        BinaryOp::Add => format!("({lhs}) + ({rhs})"),
        BinaryOp::Sub => format!("({lhs}) - ({rhs})"),
        BinaryOp::Mul => format!("({lhs}) * ({rhs})"),
        BinaryOp::Div => format!("({lhs}) / ({rhs})"),
        BinaryOp::Maximum => format!("(({lhs}) > ({rhs})) ? ({lhs}) : ({rhs})"),
        BinaryOp::Minimum => format!("(({lhs}) < ({rhs})) ? ({lhs}) : ({rhs})"),
    }
}

/// Saturating float-to-integer conversion helper, one per (src, dst) pair.
/// NaN maps to zero; out-of-range values clamp to the integer extremes,
/// matching the interpreter's conversion exactly.
fn sat_cast_helper(src: DType, dst: DType) -> String {
    let (bound, max_lit, min_lit) = match dst {
        DType::Si32 => ("2147483648", "2147483647", "(-2147483647 - 1)"),
        DType::Si64 => (
            "9223372036854775808",
            "9223372036854775807L",
            "(-9223372036854775807L - 1L)",
        ),
        _ => unreachable!("saturating casts only target integers"),
    };
    let fsuffix = if src == DType::F32 { "f" } else { "" };
    format!(
        "static inline {dst_ty} {name}({src_ty} v) {{\n\
         \x20   if (v != v) {{ return 0; }}\n\
         \x20   if (v >= {bound}.0{fsuffix}) {{ return {max_lit}; }}\n\
         \x20   if (v < -{bound}.0{fsuffix}) {{ return {min_lit}; }}\n\
         \x20   return ({dst_ty})v;\n\
         }}\n",
        dst_ty = c_type(dst),
        src_ty = c_type(src),
        name = sat_cast_name(src, dst),
    )
}

fn sat_cast_name(src: DType, dst: DType) -> String {
    format!("veld_cast_{}_{}", src.name(), dst.name())
}

fn cast_expr(src: DType, dst: DType, arg: &str) -> String {
    if dst == DType::I1 {
        format!("(char)(({arg}) != 0)")
    } else if src.is_float() && dst.is_integer() {
        format!("{}({arg})", sat_cast_name(src, dst))
    } else {
        format!("({})({arg})", c_type(dst))
    }
}

/// Builds the element-index expression for reading one input at the current
/// output position. Same-shape reads collapse to `gid`; broadcast axes
/// (extent 1) contribute nothing; shifted reads wrap per axis.
fn load_index_expr(out_shape: &Shape, in_shape: &Shape, shift: Option<&[i64]>) -> String {
    if shift.is_none() && in_shape.dims() == out_shape.dims() {
        return "gid".to_string();
    }
    let out_dims = out_shape.dims();
    let out_strides = out_shape.strides();
    let in_dims = in_shape.dims();
    let in_strides = in_shape.strides();
    let align = out_dims.len() - in_dims.len();

    let mut terms = Vec::new();
    for axis in 0..in_dims.len() {
        if in_dims[axis] == 1 {
            continue;
        }
        let out_axis = axis + align;
        let mut coord = format!("(gid / {}) % {}", out_strides[out_axis], out_dims[out_axis]);
        if let Some(offsets) = shift {
            let extent = in_dims[axis] as i64;
            let wrapped = ((offsets[axis] % extent) + extent) % extent;
            if wrapped != 0 {
                coord = format!("(({coord}) + {wrapped}) % {}", in_dims[axis]);
            }
        }
        if in_strides[axis] == 1 {
            terms.push(format!("({coord})"));
        } else {
            terms.push(format!("({coord}) * {}", in_strides[axis]));
        }
    }
    if terms.is_empty() {
        "0".to_string()
    } else {
        terms.join(" + ")
    }
}

/// Emits the complete kernel source for one program.
pub fn emit_source(name: &str, program: &KernelProgram) -> String {
    let step_dtypes = program.step_dtypes();
    let mut out = String::new();

    // Saturating-cast helpers, emitted once per conversion pair in use.
    let mut helper_pairs: BTreeSet<(DType, DType)> = BTreeSet::new();
    for (idx, step) in program.steps.iter().enumerate() {
        if let Operation::Cast(spec) = &step.op {
            let src = arg_dtype(program, &step_dtypes, idx, 0);
            if src.is_float() && spec.dtype.is_integer() {
                helper_pairs.insert((src, spec.dtype));
            }
        }
    }
    for (src, dst) in &helper_pairs {
        out.push_str(&sat_cast_helper(*src, *dst));
        out.push('\n');
    }

    // Signature: one pointer per input slot, the output pointer, the element
    // count guard.
    let _ = write!(out, "__kernel void {name}(");
    for (slot, spec) in program.inputs.iter().enumerate() {
        let _ = write!(
            out,
            "\n    __global const {}* in{slot},",
            c_type(spec.dtype)
        );
    }
    let _ = write!(
        out,
        "\n    __global {}* out,\n    const ulong n)\n{{\n",
        c_type(program.output.dtype)
    );
    out.push_str("    const ulong gid = get_global_id(0);\n");
    out.push_str("    if (gid >= n) {\n        return;\n    }\n");

    // One load per input read directly (indexing reads stay inline in their
    // step, since they remap coordinates themselves).
    let mut direct: BTreeSet<usize> = BTreeSet::new();
    for step in &program.steps {
        if matches!(step.op, Operation::Shift(_)) {
            continue;
        }
        for arg in &step.args {
            if let StepArg::Input(slot) = arg {
                direct.insert(*slot);
            }
        }
    }
    for slot in &direct {
        let spec = &program.inputs[*slot];
        let idx = load_index_expr(&program.output.shape, &spec.shape, None);
        let _ = writeln!(
            out,
            "    const {} x{slot} = in{slot}[{idx}];",
            c_type(spec.dtype)
        );
    }

    // Step bodies in dependency order; operands reference earlier values by
    // name, so expressions shared through CSE are computed exactly once.
    for (idx, step) in program.steps.iter().enumerate() {
        let var = |arg: &StepArg| match arg {
            StepArg::Input(slot) => format!("x{slot}"),
            StepArg::Step(step) => format!("v{step}"),
        };
        let expr = match &step.op {
            Operation::Unary(op) => {
                unary_expr(*op, arg_dtype(program, &step_dtypes, idx, 0), &var(&step.args[0]))
            }
            Operation::Binary(op) => binary_expr(*op, &var(&step.args[0]), &var(&step.args[1])),
            Operation::Cast(spec) => cast_expr(
                arg_dtype(program, &step_dtypes, idx, 0),
                spec.dtype,
                &var(&step.args[0]),
            ),
            Operation::Select => format!(
                "(({}) != 0) ? ({}) : ({})",
                var(&step.args[0]),
                var(&step.args[1]),
                var(&step.args[2])
            ),
            Operation::Shift(spec) => {
                let StepArg::Input(slot) = step.args[0] else {
                    unreachable!("indexing reads materialized inputs only");
                };
                let idx_expr = load_index_expr(
                    &program.output.shape,
                    &program.inputs[slot].shape,
                    Some(&spec.offset),
                );
                format!("in{slot}[{idx_expr}]")
            }
        };
        let _ = writeln!(out, "    const {} v{idx} = {expr};", c_type(step_dtypes[idx]));
    }

    let _ = writeln!(out, "    out[gid] = v{};", program.steps.len() - 1);
    out.push_str("}\n");
    out
}

fn arg_dtype(program: &KernelProgram, step_dtypes: &[DType], step: usize, arg: usize) -> DType {
    match program.steps[step].args[arg] {
        StepArg::Input(slot) => program.inputs[slot].dtype,
        StepArg::Step(idx) => step_dtypes[idx],
    }
}
