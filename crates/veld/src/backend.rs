//! Abstract capability consumed from the backend execution layer.
//!
//! The core never sees a concrete buffer representation: it allocates,
//! launches, and frees through this trait and otherwise treats handles as
//! opaque. Kernel launches must be observed in submission order by the
//! device (streams/events are the backend's concern, not this core's).

use crate::codegen::Kernel;
use crate::dtype::{BufferSpec, HostBuffer};
use crate::op::Operation;

/// Failure surfaced by a backend collaborator, propagated unchanged.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("kernel execution failed: {0}")]
    Execution(String),
    #[error("{op} is not supported by this backend: {reason}")]
    Unsupported { op: &'static str, reason: String },
}

impl BackendError {
    pub fn allocation(message: impl Into<String>) -> Self {
        BackendError::Allocation(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution(message.into())
    }

    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unsupported {
            op,
            reason: reason.into(),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Compute backend capability: allocate, move, launch, release.
pub trait ComputeBackend: Send + Sync {
    /// Opaque device buffer handle. Cloning must alias the same storage.
    type BufferHandle: Clone + Send + Sync + 'static;

    /// Human-readable backend identifier (e.g. `"ref-cpu"`, `"cuda"`).
    fn backend_name(&self) -> &str;

    /// Allocates an uninitialized buffer for one kernel output.
    fn alloc(&self, spec: &BufferSpec) -> BackendResult<Self::BufferHandle>;

    /// Materializes a host payload into device memory.
    fn upload(&self, host: &HostBuffer) -> BackendResult<Self::BufferHandle>;

    /// Reads a buffer back into host memory (tests and debugging).
    fn download(&self, spec: &BufferSpec, handle: &Self::BufferHandle) -> BackendResult<HostBuffer>;

    /// Runs one fused kernel: reads `inputs` in slot order, writes `output`.
    ///
    /// The launch must be sequenced after the launches that produced its
    /// inputs, from the device's point of view.
    fn launch(
        &self,
        kernel: &Kernel,
        inputs: &[Self::BufferHandle],
        output: &Self::BufferHandle,
    ) -> BackendResult<()>;

    /// Releases a buffer the core no longer references. Backends with
    /// reference-counted handles may leave this as the default no-op.
    fn free(&self, handle: Self::BufferHandle) {
        let _ = handle;
    }

    /// Whether this backend can execute the operation. Checked before any
    /// kernel for a plan is emitted, so an unsupported op aborts evaluation
    /// instead of being silently dropped.
    fn supports(&self, op: &Operation) -> bool {
        let _ = op;
        true
    }
}
