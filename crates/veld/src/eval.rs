//! Evaluation driver: plan, emit, dispatch, commit.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{BackendError, ComputeBackend};
use crate::codegen::{kernel_for, lower};
use crate::fusion::plan;
use crate::graph::{Context, Node, NodeId};

/// Failures surfaced by [`evaluate`]. The lazy graph is left intact in every
/// case: no buffer is swapped into any handle, so the caller may retry, e.g.
/// on a backend that supports the offending operation.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("operation {op} is not supported by backend {backend}")]
    UnsupportedOperation { op: &'static str, backend: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Evaluates the DAG rooted at `root` and returns its buffer.
///
/// Partitions run in dependency order; each launch reads leaf buffers or
/// outputs of earlier partitions. Intermediate and output buffers are
/// committed to the context's materialization memo only after every
/// partition succeeded — a failed evaluation releases everything it
/// produced and changes nothing, so retries start from the unevaluated
/// graph rather than a partially built buffer set.
pub fn evaluate<B: ComputeBackend + 'static>(
    ctx: &Context<B>,
    root: &Arc<Node<B>>,
) -> Result<B::BufferHandle, EvalError> {
    if let Some(handle) = root.buffer_handle() {
        return Ok(handle.clone());
    }
    if let Some(handle) = ctx.materialized_handle(root.id()) {
        return Ok(handle);
    }

    let backend = ctx.backend();
    let partitions = plan(
        root,
        &ctx.materialized_ids(),
        ctx.config().fusion_height_limit,
    );

    // Reject unsupported operations before emitting or launching anything.
    for partition in &partitions {
        for node in &partition.nodes {
            let op = node
                .operation()
                .expect("planner placed a leaf inside a partition");
            if !backend.supports(op) {
                return Err(EvalError::UnsupportedOperation {
                    op: op.name(),
                    backend: backend.backend_name().to_string(),
                });
            }
        }
    }

    let mut produced: Vec<(Arc<Node<B>>, B::BufferHandle)> = Vec::new();
    let mut produced_by_id: HashMap<NodeId, B::BufferHandle> = HashMap::new();

    let release = |backend: &Arc<B>, produced: Vec<(Arc<Node<B>>, B::BufferHandle)>| {
        for (_, handle) in produced {
            backend.free(handle);
        }
    };

    for partition in &partitions {
        let kernel = kernel_for(&lower(partition));

        let mut inputs = Vec::with_capacity(partition.inputs.len());
        for input in &partition.inputs {
            let handle = if let Some(handle) = input.buffer_handle() {
                handle.clone()
            } else if let Some(handle) = produced_by_id.get(&input.id()) {
                handle.clone()
            } else if let Some(handle) = ctx.materialized_handle(input.id()) {
                handle
            } else {
                unreachable!("partition input is neither a leaf nor an earlier output");
            };
            inputs.push(handle);
        }

        let output = match backend.alloc(&partition.root.spec()) {
            Ok(handle) => handle,
            Err(err) => {
                release(backend, produced);
                return Err(err.into());
            }
        };
        if let Err(err) = backend.launch(&kernel, &inputs, &output) {
            backend.free(output);
            release(backend, produced);
            return Err(err.into());
        }

        produced_by_id.insert(partition.root.id(), output.clone());
        produced.push((Arc::clone(&partition.root), output));
    }

    let result = produced_by_id
        .get(&root.id())
        .cloned()
        .expect("final partition computes the requested root");
    ctx.record_materialized(produced);
    Ok(result)
}
