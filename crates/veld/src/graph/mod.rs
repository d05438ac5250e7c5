//! Lazy expression graph: nodes, structural signatures, and the builder.
//!
//! The graph is the core's central data structure. Array operators record
//! nodes here without executing anything; evaluation walks the recorded DAG.
//!
//! ```text
//! Array
//!   |
//!   | holds Arc<Context>
//!   v
//! Context
//!   |
//!   +-- signature cache (CSE lookup-or-insert, mutex-guarded)
//!   |
//!   +-- materialization memo (node id -> buffer, mutex-guarded)
//!   |
//!   +-- ComputeBackend (allocation + launches)
//! ```
//!
//! Nodes are immutable once constructed and shared via `Arc`; the DAG shape
//! (including CSE-induced sharing) is intentional and is never deep-copied.
//! Only the two caches above mutate, each behind its own mutex, so completed
//! nodes can be read concurrently by multiple evaluations without locking.

mod context;
mod node;
pub(crate) mod signature;

pub use context::Context;
pub use node::{BufferLeaf, NaryExpr, Node, NodeId, NodeKind};
