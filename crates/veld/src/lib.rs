//! Lazy array expression core with kernel fusion.
//!
//! Array operators record nodes into a shared DAG instead of executing.
//! When a value is actually needed, the fusion planner partitions the
//! reachable subgraph into a minimal sequence of kernel launches, the code
//! generator emits source for each partition, and the configured backend
//! compiles and dispatches them. Materialized results replace their
//! subgraphs with buffer leaves, collapsing the graph.

pub mod array;
pub mod backend;
pub mod codegen;
pub mod config;
pub mod dtype;
pub mod eval;
pub mod fusion;
pub mod graph;
pub mod op;

pub use array::Array;
pub use backend::{BackendError, BackendResult, ComputeBackend};
pub use codegen::{Kernel, KernelProgram, KernelStep, StepArg};
pub use config::EvalConfig;
pub use dtype::{BufferSpec, DType, HostBuffer, Shape};
pub use eval::EvalError;
pub use graph::{Context, Node, NodeId, NodeKind};
pub use op::{BinaryOp, CastSpec, GraphError, Operation, ShiftSpec, UnaryOp};
