//! Shared graph context: node construction, CSE, and the materialization memo.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};

use crate::backend::ComputeBackend;
use crate::config::EvalConfig;
use crate::dtype::BufferSpec;
use crate::op::{GraphError, Operation, UnaryOp};

use super::node::{BufferLeaf, NaryExpr, Node, NodeId, NodeKind};
use super::signature::{expr_signature, leaf_signature};

static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_buffer_id() -> u64 {
    BUFFER_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Signature-keyed cache of live nodes, used for lookup-or-insert CSE.
///
/// Entries are weak: the graph owns node lifetime, the cache never does.
/// Dead entries are swept from a bucket whenever it is probed and from the
/// whole table when it grows past a watermark.
struct CseCache<B: ComputeBackend + 'static> {
    table: HashMap<u64, Vec<Weak<Node<B>>>>,
    sweep_watermark: usize,
}

impl<B: ComputeBackend + 'static> CseCache<B> {
    fn new() -> Self {
        Self {
            table: HashMap::new(),
            sweep_watermark: 256,
        }
    }

    fn lookup(
        &mut self,
        signature: u64,
        op: &Operation,
        children: &[Arc<Node<B>>],
    ) -> Option<Arc<Node<B>>> {
        let bucket = self.table.get_mut(&signature)?;
        let mut found = None;
        bucket.retain(|weak| match weak.upgrade() {
            Some(node) => {
                if found.is_none() && structurally_equal(&node, op, children) {
                    found = Some(node);
                }
                true
            }
            None => false,
        });
        if bucket.is_empty() {
            self.table.remove(&signature);
        }
        found
    }

    fn insert(&mut self, node: &Arc<Node<B>>) {
        self.table
            .entry(node.signature)
            .or_default()
            .push(Arc::downgrade(node));
        if self.table.len() >= self.sweep_watermark {
            self.sweep();
            self.sweep_watermark = (self.table.len() * 2).max(256);
        }
    }

    fn sweep(&mut self) {
        self.table.retain(|_, bucket| {
            bucket.retain(|weak| weak.strong_count() > 0);
            !bucket.is_empty()
        });
    }
}

/// Signature collisions must never alias distinct expressions, so a cache hit
/// is confirmed structurally: same operation (tag and payload) and the same
/// child nodes by identity. Children are CSE'd themselves, which makes the
/// identity comparison complete.
fn structurally_equal<B: ComputeBackend + 'static>(
    candidate: &Node<B>,
    op: &Operation,
    children: &[Arc<Node<B>>],
) -> bool {
    match &candidate.kind {
        NodeKind::Buffer(_) => false,
        NodeKind::Nary(expr) => {
            expr.op == *op
                && expr.children.len() == children.len()
                && expr
                    .children
                    .iter()
                    .zip(children.iter())
                    .all(|(a, b)| Arc::ptr_eq(a, b))
        }
    }
}

struct MaterializedEntry<B: ComputeBackend + 'static> {
    node: Weak<Node<B>>,
    handle: B::BufferHandle,
}

/// Shared context every array handle of one backend instance points at.
///
/// Holds the backend, the evaluation configuration, and the two mutable
/// tables (CSE cache, materialization memo). Everything else in the graph is
/// immutable after construction.
pub struct Context<B: ComputeBackend + 'static> {
    backend: Arc<B>,
    config: EvalConfig,
    next_node: AtomicU64,
    cse: Mutex<CseCache<B>>,
    materialized: Mutex<HashMap<NodeId, MaterializedEntry<B>>>,
}

impl<B: ComputeBackend + 'static> Context<B> {
    pub fn new(backend: Arc<B>) -> Arc<Self> {
        Self::with_config(backend, EvalConfig::default())
    }

    pub fn with_config(backend: Arc<B>, config: EvalConfig) -> Arc<Self> {
        Arc::new(Context {
            backend,
            config,
            next_node: AtomicU64::new(0),
            cse: Mutex::new(CseCache::new()),
            materialized: Mutex::new(HashMap::new()),
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    fn allocate_id(&self) -> NodeId {
        NodeId(self.next_node.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// Wraps an externally materialized buffer as a height-0 leaf.
    pub fn import_buffer(&self, handle: B::BufferHandle, spec: BufferSpec) -> Arc<Node<B>> {
        let buffer_id = next_buffer_id();
        Arc::new(Node {
            id: self.allocate_id(),
            dtype: spec.dtype,
            shape: spec.shape,
            height: 0,
            signature: leaf_signature(buffer_id),
            kind: NodeKind::Buffer(BufferLeaf { buffer_id, handle }),
        })
    }

    /// Records one operation, reusing an existing node when the expression is
    /// structurally identical to one already reachable from live handles.
    ///
    /// The arity and type checks happen before anything is allocated, so a
    /// failed call leaves the graph untouched. On a cache hit the existing
    /// node is returned without allocation: aliasing is the intended,
    /// observable CSE effect, and is safe because nodes never mutate.
    pub fn record_operation(
        &self,
        op: Operation,
        children: &[Arc<Node<B>>],
    ) -> Result<Arc<Node<B>>, GraphError> {
        if children.len() != op.arity() {
            return Err(GraphError::ArityMismatch {
                op: op.name(),
                expected: op.arity(),
                got: children.len(),
            });
        }
        let operand_specs: Vec<_> = children
            .iter()
            .map(|child| (child.dtype, &child.shape))
            .collect();
        let (dtype, shape) = op.result_spec(&operand_specs)?;

        let child_signatures: Vec<u64> = children.iter().map(|c| c.signature).collect();
        let signature = expr_signature(&op, dtype, &child_signatures);

        let mut cse = self.cse.lock().expect("cse cache poisoned");
        if let Some(existing) = cse.lookup(signature, &op, children) {
            return Ok(existing);
        }

        let height = 1 + children.iter().map(|c| c.height).max().unwrap_or(0);
        let node = Arc::new(Node {
            id: self.allocate_id(),
            dtype,
            shape,
            height,
            signature,
            kind: NodeKind::Nary(NaryExpr {
                op,
                children: children.iter().cloned().collect(),
            }),
        });
        cse.insert(&node);
        Ok(node)
    }

    /// Convenience constructor for the one-child case.
    pub fn unary(&self, op: UnaryOp, child: &Arc<Node<B>>) -> Result<Arc<Node<B>>, GraphError> {
        self.record_operation(Operation::Unary(op), std::slice::from_ref(child))
    }

    /// Convenience constructor for the two-child case.
    pub fn binary(
        &self,
        op: crate::op::BinaryOp,
        lhs: &Arc<Node<B>>,
        rhs: &Arc<Node<B>>,
    ) -> Result<Arc<Node<B>>, GraphError> {
        self.record_operation(Operation::Binary(op), &[Arc::clone(lhs), Arc::clone(rhs)])
    }

    /// Returns the buffer already produced for `id`, when the node is still
    /// alive and a previous evaluation materialized it.
    pub(crate) fn materialized_handle(&self, id: NodeId) -> Option<B::BufferHandle> {
        let memo = self.materialized.lock().expect("materialization memo poisoned");
        let entry = memo.get(&id)?;
        entry.node.upgrade().map(|_| entry.handle.clone())
    }

    /// Snapshot of node ids with a live materialized buffer, used by the
    /// planner to treat them as available inputs.
    pub(crate) fn materialized_ids(&self) -> std::collections::HashSet<NodeId> {
        let memo = self.materialized.lock().expect("materialization memo poisoned");
        memo.iter()
            .filter(|(_, entry)| entry.node.strong_count() > 0)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Commits the buffers of one fully successful evaluation. Dead entries
    /// are swept on the way in; a failed evaluation never reaches this.
    pub(crate) fn record_materialized(&self, produced: Vec<(Arc<Node<B>>, B::BufferHandle)>) {
        let mut memo = self.materialized.lock().expect("materialization memo poisoned");
        memo.retain(|_, entry| entry.node.strong_count() > 0);
        for (node, handle) in produced {
            memo.insert(
                node.id,
                MaterializedEntry {
                    node: Arc::downgrade(&node),
                    handle,
                },
            );
        }
    }
}
