//! Host-memory buffers and the kernel-program interpreter.

use std::sync::{Arc, RwLock};

use veld::backend::{BackendError, BackendResult, ComputeBackend};
use veld::codegen::{Kernel, KernelProgram, StepArg};
use veld::dtype::{BufferSpec, DType, HostBuffer, Shape};
use veld::op::{BinaryOp, Operation, UnaryOp};

/// Dense host storage, one variant per supported dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum CpuData {
    I1(Vec<u8>),
    Si32(Vec<i32>),
    Si64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl CpuData {
    fn zeroed(spec: &BufferSpec) -> CpuData {
        let n = spec.element_count();
        match spec.dtype {
            DType::I1 => CpuData::I1(vec![0; n]),
            DType::Si32 => CpuData::Si32(vec![0; n]),
            DType::Si64 => CpuData::Si64(vec![0; n]),
            DType::F32 => CpuData::F32(vec![0.0; n]),
            DType::F64 => CpuData::F64(vec![0.0; n]),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            CpuData::I1(_) => DType::I1,
            CpuData::Si32(_) => DType::Si32,
            CpuData::Si64(_) => DType::Si64,
            CpuData::F32(_) => DType::F32,
            CpuData::F64(_) => DType::F64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuData::I1(v) => v.len(),
            CpuData::Si32(v) => v.len(),
            CpuData::Si64(v) => v.len(),
            CpuData::F32(v) => v.len(),
            CpuData::F64(v) => v.len(),
        }
    }
}

/// Host buffer handle. Clones alias the same storage, per the backend
/// contract.
#[derive(Clone)]
pub struct CpuBuffer {
    spec: BufferSpec,
    data: Arc<RwLock<CpuData>>,
}

impl CpuBuffer {
    pub fn spec(&self) -> &BufferSpec {
        &self.spec
    }

    pub fn read(&self) -> CpuData {
        self.data.read().expect("cpu buffer poisoned").clone()
    }
}

/// Reference backend executing kernel programs on the host.
#[derive(Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl ComputeBackend for CpuBackend {
    type BufferHandle = CpuBuffer;

    fn backend_name(&self) -> &str {
        "ref-cpu"
    }

    fn alloc(&self, spec: &BufferSpec) -> BackendResult<Self::BufferHandle> {
        Ok(CpuBuffer {
            spec: spec.clone(),
            data: Arc::new(RwLock::new(CpuData::zeroed(spec))),
        })
    }

    fn upload(&self, host: &HostBuffer) -> BackendResult<Self::BufferHandle> {
        let data = decode(host)?;
        Ok(CpuBuffer {
            spec: host.spec.clone(),
            data: Arc::new(RwLock::new(data)),
        })
    }

    fn download(&self, spec: &BufferSpec, handle: &Self::BufferHandle) -> BackendResult<HostBuffer> {
        if handle.spec != *spec {
            return Err(BackendError::execution("download spec mismatch"));
        }
        Ok(encode(spec, &handle.read()))
    }

    fn launch(
        &self,
        kernel: &Kernel,
        inputs: &[Self::BufferHandle],
        output: &Self::BufferHandle,
    ) -> BackendResult<()> {
        let program = &kernel.program;
        if inputs.len() != program.inputs.len() {
            return Err(BackendError::execution("kernel input arity mismatch"));
        }
        for (handle, spec) in inputs.iter().zip(program.inputs.iter()) {
            if handle.spec != *spec {
                return Err(BackendError::execution("kernel input spec mismatch"));
            }
        }
        if output.spec != program.output {
            return Err(BackendError::execution("kernel output spec mismatch"));
        }

        let input_data: Vec<CpuData> = inputs.iter().map(CpuBuffer::read).collect();
        let result = run_program(program, &input_data)?;
        if result.dtype() != program.output.dtype || result.len() != program.output.element_count()
        {
            return Err(BackendError::execution("kernel produced malformed output"));
        }
        *output.data.write().expect("cpu buffer poisoned") = result;
        Ok(())
    }
}

fn decode(host: &HostBuffer) -> BackendResult<CpuData> {
    let malformed = || BackendError::execution("host payload length mismatch");
    if host.bytes.len() != host.spec.byte_len() {
        return Err(malformed());
    }
    macro_rules! decode_as {
        ($variant:ident, $ty:ty) => {{
            const WIDTH: usize = std::mem::size_of::<$ty>();
            let mut values = Vec::with_capacity(host.bytes.len() / WIDTH);
            for chunk in host.bytes.chunks_exact(WIDTH) {
                let mut raw = [0u8; WIDTH];
                raw.copy_from_slice(chunk);
                values.push(<$ty>::from_le_bytes(raw));
            }
            CpuData::$variant(values)
        }};
    }
    Ok(match host.spec.dtype {
        DType::I1 => CpuData::I1(host.bytes.clone()),
        DType::Si32 => decode_as!(Si32, i32),
        DType::Si64 => decode_as!(Si64, i64),
        DType::F32 => decode_as!(F32, f32),
        DType::F64 => decode_as!(F64, f64),
    })
}

fn encode(spec: &BufferSpec, data: &CpuData) -> HostBuffer {
    let mut bytes = Vec::with_capacity(spec.byte_len());
    match data {
        CpuData::I1(v) => bytes.extend_from_slice(v),
        CpuData::Si32(v) => v.iter().for_each(|x| bytes.extend_from_slice(&x.to_le_bytes())),
        CpuData::Si64(v) => v.iter().for_each(|x| bytes.extend_from_slice(&x.to_le_bytes())),
        CpuData::F32(v) => v.iter().for_each(|x| bytes.extend_from_slice(&x.to_le_bytes())),
        CpuData::F64(v) => v.iter().for_each(|x| bytes.extend_from_slice(&x.to_le_bytes())),
    }
    HostBuffer {
        spec: spec.clone(),
        bytes,
    }
}

/// Maps every output element index to the source element index for one
/// input, honoring trailing-aligned broadcast and optional wrapped shifts —
/// the same coordinate arithmetic the emitted source folds into its loads.
fn gather_map(out_shape: &Shape, in_shape: &Shape, shift: Option<&[i64]>) -> Vec<usize> {
    let n = out_shape.element_count();
    if shift.is_none() && in_shape.dims() == out_shape.dims() {
        return (0..n).collect();
    }
    let out_dims = out_shape.dims();
    let out_strides = out_shape.strides();
    let in_dims = in_shape.dims();
    let in_strides = in_shape.strides();
    let align = out_dims.len() - in_dims.len();

    (0..n)
        .map(|gid| {
            let mut idx = 0usize;
            for axis in 0..in_dims.len() {
                if in_dims[axis] == 1 {
                    continue;
                }
                let out_axis = axis + align;
                let mut coord = (gid / out_strides[out_axis]) % out_dims[out_axis];
                if let Some(offsets) = shift {
                    let extent = in_dims[axis] as i64;
                    let wrapped = (((offsets[axis] % extent) + extent) % extent) as usize;
                    coord = (coord + wrapped) % in_dims[axis];
                }
                idx += coord * in_strides[axis];
            }
            idx
        })
        .collect()
}

fn gather(data: &CpuData, map: &[usize]) -> CpuData {
    macro_rules! gather_as {
        ($variant:ident, $v:expr) => {
            CpuData::$variant(map.iter().map(|&i| $v[i]).collect())
        };
    }
    match data {
        CpuData::I1(v) => gather_as!(I1, v),
        CpuData::Si32(v) => gather_as!(Si32, v),
        CpuData::Si64(v) => gather_as!(Si64, v),
        CpuData::F32(v) => gather_as!(F32, v),
        CpuData::F64(v) => gather_as!(F64, v),
    }
}

/// Interprets the step list over the full output domain. Every step value is
/// evaluated at each output coordinate, which is exactly what the emitted
/// scalar kernel does per thread.
fn run_program(program: &KernelProgram, inputs: &[CpuData]) -> BackendResult<CpuData> {
    let out_shape = &program.output.shape;
    let mut steps: Vec<CpuData> = Vec::with_capacity(program.steps.len());

    for step in &program.steps {
        let operand = |arg: &StepArg, steps: &[CpuData]| -> CpuData {
            match arg {
                StepArg::Step(idx) => steps[*idx].clone(),
                StepArg::Input(slot) => {
                    let map = gather_map(out_shape, &program.inputs[*slot].shape, None);
                    gather(&inputs[*slot], &map)
                }
            }
        };
        let value = match &step.op {
            Operation::Unary(op) => eval_unary(*op, operand(&step.args[0], &steps))?,
            Operation::Binary(op) => eval_binary(
                *op,
                operand(&step.args[0], &steps),
                operand(&step.args[1], &steps),
            )?,
            Operation::Cast(spec) => eval_cast(spec.dtype, operand(&step.args[0], &steps)),
            Operation::Select => eval_select(
                operand(&step.args[0], &steps),
                operand(&step.args[1], &steps),
                operand(&step.args[2], &steps),
            )?,
            Operation::Shift(spec) => {
                let StepArg::Input(slot) = step.args[0] else {
                    return Err(BackendError::execution(
                        "shift step must read a kernel input",
                    ));
                };
                let map = gather_map(
                    out_shape,
                    &program.inputs[slot].shape,
                    Some(&spec.offset),
                );
                gather(&inputs[slot], &map)
            }
        };
        steps.push(value);
    }

    steps
        .pop()
        .ok_or_else(|| BackendError::execution("kernel program has no steps"))
}

fn eval_unary(op: UnaryOp, value: CpuData) -> BackendResult<CpuData> {
    macro_rules! float_unary {
        ($variant:ident, $v:expr, $erf:path, $one:expr) => {
            CpuData::$variant(match op {
                UnaryOp::Neg => $v.iter().map(|x| -x).collect(),
                UnaryOp::Abs => $v.iter().map(|x| x.abs()).collect(),
                UnaryOp::Exp => $v.iter().map(|x| x.exp()).collect(),
                UnaryOp::Log => $v.iter().map(|x| x.ln()).collect(),
                UnaryOp::Tanh => $v.iter().map(|x| x.tanh()).collect(),
                UnaryOp::Erf => $v.iter().map(|x| $erf(*x)).collect(),
                UnaryOp::Sqrt => $v.iter().map(|x| x.sqrt()).collect(),
                UnaryOp::Rsqrt => $v.iter().map(|x| $one / x.sqrt()).collect(),
                UnaryOp::Reciprocal => $v.iter().map(|x| $one / x).collect(),
            })
        };
    }
    macro_rules! int_unary {
        ($variant:ident, $v:expr) => {
            match op {
                UnaryOp::Neg => CpuData::$variant($v.iter().map(|x| x.wrapping_neg()).collect()),
                UnaryOp::Abs => CpuData::$variant($v.iter().map(|x| x.wrapping_abs()).collect()),
                _ => {
                    return Err(BackendError::execution(
                        "transcendental applied to integer data",
                    ))
                }
            }
        };
    }
    Ok(match value {
        CpuData::F32(v) => float_unary!(F32, v, libm::erff, 1.0f32),
        CpuData::F64(v) => float_unary!(F64, v, libm::erf, 1.0f64),
        CpuData::Si32(v) => int_unary!(Si32, v),
        CpuData::Si64(v) => int_unary!(Si64, v),
        CpuData::I1(_) => {
            return Err(BackendError::execution("unary op applied to i1 data"))
        }
    })
}

fn eval_binary(op: BinaryOp, lhs: CpuData, rhs: CpuData) -> BackendResult<CpuData> {
    macro_rules! float_binary {
        ($variant:ident, $l:expr, $r:expr) => {
            CpuData::$variant(
                $l.iter()
                    .zip($r.iter())
                    .map(|(l, r)| match op {
                        BinaryOp::Add => l + r,
                        BinaryOp::Sub => l - r,
                        BinaryOp::Mul => l * r,
                        BinaryOp::Div => l / r,
                        // Comparison-based: NaN on the left falls through to
                        // the right operand, matching the emitted ternary.
                        BinaryOp::Maximum => {
                            if l > r {
                                *l
                            } else {
                                *r
                            }
                        }
                        BinaryOp::Minimum => {
                            if l < r {
                                *l
                            } else {
                                *r
                            }
                        }
                    })
                    .collect(),
            )
        };
    }
    macro_rules! int_binary {
        ($variant:ident, $l:expr, $r:expr) => {{
            let mut out = Vec::with_capacity($l.len());
            for (l, r) in $l.iter().zip($r.iter()) {
                out.push(match op {
                    BinaryOp::Add => l.wrapping_add(*r),
                    BinaryOp::Sub => l.wrapping_sub(*r),
                    BinaryOp::Mul => l.wrapping_mul(*r),
                    BinaryOp::Div => {
                        if *r == 0 {
                            return Err(BackendError::execution("integer division by zero"));
                        }
                        l.wrapping_div(*r)
                    }
                    BinaryOp::Maximum => {
                        if l > r {
                            *l
                        } else {
                            *r
                        }
                    }
                    BinaryOp::Minimum => {
                        if l < r {
                            *l
                        } else {
                            *r
                        }
                    }
                });
            }
            CpuData::$variant(out)
        }};
    }
    Ok(match (lhs, rhs) {
        (CpuData::F32(l), CpuData::F32(r)) => float_binary!(F32, l, r),
        (CpuData::F64(l), CpuData::F64(r)) => float_binary!(F64, l, r),
        (CpuData::Si32(l), CpuData::Si32(r)) => int_binary!(Si32, l, r),
        (CpuData::Si64(l), CpuData::Si64(r)) => int_binary!(Si64, l, r),
        _ => return Err(BackendError::execution("binary operand dtype mismatch")),
    })
}

/// Conversions match the documented cast semantics: float-to-int saturates
/// with NaN mapping to zero (Rust's `as` already does this), int-to-int
/// wraps, and casts to `i1` produce `value != 0`.
fn eval_cast(dst: DType, value: CpuData) -> CpuData {
    macro_rules! from_vec {
        ($v:expr, $zero:expr) => {
            match dst {
                DType::I1 => CpuData::I1($v.iter().map(|x| u8::from(*x != $zero)).collect()),
                DType::Si32 => CpuData::Si32($v.iter().map(|x| *x as i32).collect()),
                DType::Si64 => CpuData::Si64($v.iter().map(|x| *x as i64).collect()),
                DType::F32 => CpuData::F32($v.iter().map(|x| *x as f32).collect()),
                DType::F64 => CpuData::F64($v.iter().map(|x| *x as f64).collect()),
            }
        };
    }
    match value {
        CpuData::I1(v) => match dst {
            DType::I1 => CpuData::I1(v),
            DType::Si32 => CpuData::Si32(v.iter().map(|x| i32::from(*x)).collect()),
            DType::Si64 => CpuData::Si64(v.iter().map(|x| i64::from(*x)).collect()),
            DType::F32 => CpuData::F32(v.iter().map(|x| f32::from(*x)).collect()),
            DType::F64 => CpuData::F64(v.iter().map(|x| f64::from(*x)).collect()),
        },
        CpuData::Si32(v) => from_vec!(v, 0),
        CpuData::Si64(v) => from_vec!(v, 0),
        CpuData::F32(v) => from_vec!(v, 0.0),
        CpuData::F64(v) => from_vec!(v, 0.0),
    }
}

fn eval_select(cond: CpuData, a: CpuData, b: CpuData) -> BackendResult<CpuData> {
    let CpuData::I1(cond) = cond else {
        return Err(BackendError::execution("select condition must be i1"));
    };
    macro_rules! select_as {
        ($variant:ident, $a:expr, $b:expr) => {
            CpuData::$variant(
                cond.iter()
                    .zip($a.iter().zip($b.iter()))
                    .map(|(c, (a, b))| if *c != 0 { *a } else { *b })
                    .collect(),
            )
        };
    }
    Ok(match (a, b) {
        (CpuData::I1(a), CpuData::I1(b)) => select_as!(I1, a, b),
        (CpuData::Si32(a), CpuData::Si32(b)) => select_as!(Si32, a, b),
        (CpuData::Si64(a), CpuData::Si64(b)) => select_as!(Si64, a, b),
        (CpuData::F32(a), CpuData::F32(b)) => select_as!(F32, a, b),
        (CpuData::F64(a), CpuData::F64(b)) => select_as!(F64, a, b),
        _ => return Err(BackendError::execution("select branch dtype mismatch")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_map_is_identity_for_matching_shapes() {
        let shape = Shape::new([2, 3]);
        assert_eq!(gather_map(&shape, &shape, None), (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn gather_map_broadcasts_trailing_aligned() {
        let out = Shape::new([2, 3]);
        let row = Shape::new([3]);
        assert_eq!(gather_map(&out, &row, None), vec![0, 1, 2, 0, 1, 2]);

        let column = Shape::new([2, 1]);
        assert_eq!(gather_map(&out, &column, None), vec![0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn gather_map_wraps_negative_shifts() {
        let shape = Shape::new([4]);
        assert_eq!(
            gather_map(&shape, &shape, Some(&[-1])),
            vec![3, 0, 1, 2]
        );
    }

    #[test]
    fn integer_division_by_zero_is_an_execution_error() {
        let err = eval_binary(
            BinaryOp::Div,
            CpuData::Si32(vec![1, 2]),
            CpuData::Si32(vec![1, 0]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("division by zero"), "{err}");
    }
}
