//! Scalar element types, static shapes, and buffer metadata.

use serde::{Deserialize, Serialize};

/// Enumerates scalar element types supported by the expression core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si32,
    Si64,
    F32,
    F64,
}

impl DType {
    /// Returns `true` when the dtype is a signed integer.
    pub fn is_integer(self) -> bool {
        matches!(self, DType::Si32 | DType::Si64)
    }

    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Returns `true` when the dtype participates in arithmetic (everything but `I1`).
    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float()
    }

    /// Returns the storage size in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::Si32 => 4,
            DType::Si64 => 8,
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    /// Short lowercase name used in kernel labels and error messages.
    pub fn name(self) -> &'static str {
        match self {
            DType::I1 => "i1",
            DType::Si32 => "si32",
            DType::Si64 => "si64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

/// Logical array shape as an ordered list of static extents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Rank-0 shape for a single scalar element.
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Total element count; a rank-0 shape holds one element.
    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Row-major strides over this shape, in elements.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.dims.len()];
        let mut acc = 1usize;
        for (stride, dim) in strides.iter_mut().zip(self.dims.iter()).rev() {
            *stride = acc;
            acc *= *dim;
        }
        strides
    }

    /// Computes the broadcast shape of two operands, trailing-aligned.
    ///
    /// An extent of 1 stretches to the other operand's extent; any other
    /// disagreement makes the pair incompatible.
    pub fn broadcast(lhs: &Shape, rhs: &Shape) -> Option<Shape> {
        let rank = lhs.rank().max(rhs.rank());
        let mut dims = vec![0usize; rank];
        for axis in 0..rank {
            let l = lhs.extent_from_end(rank - 1 - axis);
            let r = rhs.extent_from_end(rank - 1 - axis);
            dims[axis] = match (l, r) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => return None,
            };
        }
        Some(Shape::new(dims))
    }

    /// Extent at `offset` axes from the trailing edge; missing leading axes read as 1.
    fn extent_from_end(&self, offset: usize) -> usize {
        if offset < self.dims.len() {
            self.dims[self.dims.len() - 1 - offset]
        } else {
            1
        }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

/// Buffer metadata coupling dtype and shape, used at the backend boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl BufferSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn element_count(&self) -> usize {
        self.shape.element_count()
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size_in_bytes()
    }
}

/// Dense host-side payload used to move data across the backend boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBuffer {
    pub spec: BufferSpec,
    pub bytes: Vec<u8>,
}

macro_rules! host_buffer_ctor {
    ($ctor:ident, $reader:ident, $ty:ty, $dtype:expr) => {
        /// Builds a host buffer from typed elements, validating the element count.
        pub fn $ctor(shape: Shape, values: &[$ty]) -> Option<HostBuffer> {
            if shape.element_count() != values.len() {
                return None;
            }
            let mut bytes = Vec::with_capacity(values.len() * std::mem::size_of::<$ty>());
            for value in values {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            Some(HostBuffer {
                spec: BufferSpec::new($dtype, shape),
                bytes,
            })
        }

        /// Reads the payload back as typed elements when the dtype matches.
        pub fn $reader(&self) -> Option<Vec<$ty>> {
            if self.spec.dtype != $dtype {
                return None;
            }
            const WIDTH: usize = std::mem::size_of::<$ty>();
            let mut values = Vec::with_capacity(self.bytes.len() / WIDTH);
            for chunk in self.bytes.chunks_exact(WIDTH) {
                let mut raw = [0u8; WIDTH];
                raw.copy_from_slice(chunk);
                values.push(<$ty>::from_le_bytes(raw));
            }
            Some(values)
        }
    };
}

impl HostBuffer {
    host_buffer_ctor!(from_f32, as_f32, f32, DType::F32);
    host_buffer_ctor!(from_f64, as_f64, f64, DType::F64);
    host_buffer_ctor!(from_i32, as_i32, i32, DType::Si32);
    host_buffer_ctor!(from_i64, as_i64, i64, DType::Si64);

    /// Builds an `I1` host buffer from raw 0/1 bytes.
    pub fn from_bool(shape: Shape, values: &[bool]) -> Option<HostBuffer> {
        if shape.element_count() != values.len() {
            return None;
        }
        Some(HostBuffer {
            spec: BufferSpec::new(DType::I1, shape),
            bytes: values.iter().map(|v| u8::from(*v)).collect(),
        })
    }

    pub fn as_bool(&self) -> Option<Vec<bool>> {
        if self.spec.dtype != DType::I1 {
            return None;
        }
        Some(self.bytes.iter().map(|b| *b != 0).collect())
    }
}
