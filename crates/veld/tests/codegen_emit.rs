use std::sync::Arc;

use anyhow::Result;
use smallvec::smallvec;
use veld::codegen::{emit_source, kernel_for, KernelProgram, KernelStep, StepArg};
use veld::{
    Array, BinaryOp, BufferSpec, CastSpec, Context, DType, HostBuffer, Operation, Shape,
    ShiftSpec,
};
use veld_backend_ref_cpu::CpuBackend;

fn spec(dtype: DType, dims: &[usize]) -> BufferSpec {
    BufferSpec::new(dtype, Shape::new(dims.to_vec()))
}

/// `out = (in0 + in1) * (in0 + in1)` with the add shared through CSE.
fn shared_add_program() -> KernelProgram {
    KernelProgram {
        inputs: vec![spec(DType::F32, &[3]), spec(DType::F32, &[3])],
        steps: vec![
            KernelStep {
                op: Operation::Binary(BinaryOp::Add),
                args: smallvec![StepArg::Input(0), StepArg::Input(1)],
            },
            KernelStep {
                op: Operation::Binary(BinaryOp::Mul),
                args: smallvec![StepArg::Step(0), StepArg::Step(0)],
            },
        ],
        output: spec(DType::F32, &[3]),
    }
}

#[test]
fn emission_is_deterministic_and_cached() {
    let program = shared_add_program();
    let first = kernel_for(&program);
    let second = kernel_for(&program);
    assert!(Arc::ptr_eq(&first, &second), "same program, one emission");
    assert_eq!(first.source, emit_source(&first.name, &program));
    assert!(first.name.starts_with("veld_fused_"));
}

#[test]
fn each_input_is_read_once_and_shared_steps_reuse_their_value() {
    let program = shared_add_program();
    let source = emit_source("veld_fused_test", &program);

    assert_eq!(source.matches("const float x0 = in0[").count(), 1);
    assert_eq!(source.matches("const float x1 = in1[").count(), 1);
    // The shared add is computed once and referenced by name twice.
    assert_eq!(source.matches("(x0) + (x1)").count(), 1);
    assert!(source.contains("(v0) * (v0)"));
    assert!(source.contains("out[gid] = v1;"));
}

#[test]
fn same_shape_reads_collapse_to_gid_and_broadcasts_decompose() {
    let program = KernelProgram {
        inputs: vec![spec(DType::F32, &[2, 3]), spec(DType::F32, &[3])],
        steps: vec![KernelStep {
            op: Operation::Binary(BinaryOp::Add),
            args: smallvec![StepArg::Input(0), StepArg::Input(1)],
        }],
        output: spec(DType::F32, &[2, 3]),
    };
    let source = emit_source("veld_fused_test", &program);

    assert!(source.contains("const float x0 = in0[gid];"));
    // The row vector ignores the leading axis and indexes by column.
    assert!(source.contains("const float x1 = in1[((gid / 1) % 3)];"));
}

#[test]
fn saturating_cast_emits_its_helper() {
    let program = KernelProgram {
        inputs: vec![spec(DType::F32, &[4])],
        steps: vec![KernelStep {
            op: Operation::Cast(CastSpec { dtype: DType::Si32 }),
            args: smallvec![StepArg::Input(0)],
        }],
        output: spec(DType::Si32, &[4]),
    };
    let source = emit_source("veld_fused_test", &program);

    assert!(source.contains("static inline int veld_cast_f32_si32(float v)"));
    assert!(source.contains("if (v != v) { return 0; }"));
    assert!(source.contains("const int v0 = veld_cast_f32_si32(x0);"));

    // Integer widening needs no helper, just a plain cast.
    let widen = KernelProgram {
        inputs: vec![spec(DType::Si32, &[4])],
        steps: vec![KernelStep {
            op: Operation::Cast(CastSpec { dtype: DType::Si64 }),
            args: smallvec![StepArg::Input(0)],
        }],
        output: spec(DType::Si64, &[4]),
    };
    let source = emit_source("veld_fused_test", &widen);
    assert!(!source.contains("static inline"));
    assert!(source.contains("const long v0 = (long)(x0);"));
}

#[test]
fn shifted_reads_fold_the_wrapped_offset_into_the_load() {
    let program = KernelProgram {
        inputs: vec![spec(DType::F32, &[5])],
        steps: vec![KernelStep {
            op: Operation::Shift(ShiftSpec { offset: vec![-1] }),
            args: smallvec![StepArg::Input(0)],
        }],
        output: spec(DType::F32, &[5]),
    };
    let source = emit_source("veld_fused_test", &program);

    // -1 normalizes to +4 modulo the extent.
    assert!(source.contains("in0[((((gid / 1) % 5) + 4) % 5)]"));
}

#[test]
fn comparison_based_min_max_text_matches_the_documented_rule() {
    let program = KernelProgram {
        inputs: vec![spec(DType::F32, &[2]), spec(DType::F32, &[2])],
        steps: vec![KernelStep {
            op: Operation::Binary(BinaryOp::Maximum),
            args: smallvec![StepArg::Input(0), StepArg::Input(1)],
        }],
        output: spec(DType::F32, &[2]),
    };
    let source = emit_source("veld_fused_test", &program);
    assert!(source.contains("((x0) > (x1)) ? (x0) : (x1)"));
}

// The semantics the emitted text encodes are mirrored by the reference
// interpreter; the remaining tests pin them down end to end.

fn cpu_context() -> Arc<Context<CpuBackend>> {
    Context::new(Arc::new(CpuBackend::new()))
}

#[test]
fn cast_saturates_and_maps_nan_to_zero() -> Result<()> {
    let ctx = cpu_context();
    let values = Array::from_host(
        &ctx,
        HostBuffer::from_f32(Shape::new([4]), &[3.0e9, -3.0e9, f32::NAN, 7.9])
            .expect("length matches shape"),
    )?;
    let cast = values.cast(DType::Si32)?;
    assert_eq!(
        cast.to_host()?.as_i32().expect("i32 payload"),
        vec![i32::MAX, i32::MIN, 0, 7]
    );
    Ok(())
}

#[test]
fn maximum_lets_a_left_nan_fall_through() -> Result<()> {
    let ctx = cpu_context();
    let lhs = Array::from_host(
        &ctx,
        HostBuffer::from_f32(Shape::new([2]), &[f32::NAN, 5.0]).expect("length matches shape"),
    )?;
    let rhs = Array::from_host(
        &ctx,
        HostBuffer::from_f32(Shape::new([2]), &[5.0, f32::NAN]).expect("length matches shape"),
    )?;
    let result = lhs.maximum(&rhs)?.to_host()?.as_f32().expect("f32 payload");

    assert_eq!(result[0], 5.0, "NaN on the left yields the right operand");
    assert!(result[1].is_nan(), "NaN on the right survives the comparison");
    Ok(())
}

#[test]
fn shift_wraps_around_the_extent() -> Result<()> {
    let ctx = cpu_context();
    let values = Array::from_host(
        &ctx,
        HostBuffer::from_f32(Shape::new([5]), &[1.0, 2.0, 3.0, 4.0, 5.0])
            .expect("length matches shape"),
    )?;
    let shifted = values.shift([2])?;
    assert_eq!(
        shifted.to_host()?.as_f32().expect("f32 payload"),
        vec![3.0, 4.0, 5.0, 1.0, 2.0]
    );
    Ok(())
}

#[test]
fn unary_chain_matches_host_math() -> Result<()> {
    let ctx = cpu_context();
    let input = [0.25f32, 1.0, 2.0, 9.0];
    let values = Array::from_host(
        &ctx,
        HostBuffer::from_f32(Shape::new([4]), &input).expect("length matches shape"),
    )?;
    let result = values
        .sqrt()?
        .recip()?
        .to_host()?
        .as_f32()
        .expect("f32 payload");
    for (got, x) in result.iter().zip(input.iter()) {
        assert!((got - 1.0 / x.sqrt()).abs() < 1e-6);
    }
    Ok(())
}
