//! Immutable DAG nodes: materialized buffer leaves and recorded operations.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::backend::ComputeBackend;
use crate::dtype::{BufferSpec, DType, Shape};
use crate::op::Operation;

/// Stable node identifier, unique within one [`Context`](super::Context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Leaf payload wrapping an already-materialized device buffer.
///
/// `buffer_id` is the identity leaves hash on: two different buffers never
/// compare equal, even with identical contents.
pub struct BufferLeaf<B: ComputeBackend + 'static> {
    pub(crate) buffer_id: u64,
    pub(crate) handle: B::BufferHandle,
}

/// Interior payload: an operation over an ordered child list.
pub struct NaryExpr<B: ComputeBackend + 'static> {
    pub(crate) op: Operation,
    pub(crate) children: SmallVec<[Arc<Node<B>>; 2]>,
}

/// Node variants. The graph is polymorphic over exactly these two.
pub enum NodeKind<B: ComputeBackend + 'static> {
    Buffer(BufferLeaf<B>),
    Nary(NaryExpr<B>),
}

/// A single vertex in the lazy expression DAG.
///
/// Nodes are constructed bottom-up from existing nodes, so the graph rooted
/// at any node is acyclic by construction. All fields are fixed at
/// construction; evaluation produces new buffer leaves, it never mutates
/// existing nodes.
pub struct Node<B: ComputeBackend + 'static> {
    pub(crate) id: NodeId,
    pub(crate) dtype: DType,
    pub(crate) shape: Shape,
    pub(crate) height: usize,
    pub(crate) signature: u64,
    pub(crate) kind: NodeKind<B>,
}

impl<B: ComputeBackend + 'static> Node<B> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn spec(&self) -> BufferSpec {
        BufferSpec::new(self.dtype, self.shape.clone())
    }

    /// Longest path to a leaf: 0 for buffers, `1 + max(child heights)` else.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Structural equality key. Equal signatures (plus the structural check
    /// the builder performs) mean the nodes are interchangeable for every
    /// current and future consumer.
    pub fn signature(&self) -> u64 {
        self.signature
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self.kind, NodeKind::Buffer(_))
    }

    pub fn kind(&self) -> &NodeKind<B> {
        &self.kind
    }

    /// The recorded operation, `None` for leaves.
    pub fn operation(&self) -> Option<&Operation> {
        match &self.kind {
            NodeKind::Buffer(_) => None,
            NodeKind::Nary(expr) => Some(&expr.op),
        }
    }

    /// Ordered children, empty for leaves.
    pub fn children(&self) -> &[Arc<Node<B>>] {
        match &self.kind {
            NodeKind::Buffer(_) => &[],
            NodeKind::Nary(expr) => &expr.children,
        }
    }

    /// The wrapped buffer handle when this node is a leaf.
    pub fn buffer_handle(&self) -> Option<&B::BufferHandle> {
        match &self.kind {
            NodeKind::Buffer(leaf) => Some(&leaf.handle),
            NodeKind::Nary(_) => None,
        }
    }
}

impl<B: ComputeBackend + 'static> std::fmt::Debug for Node<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            NodeKind::Buffer(leaf) => write!(
                f,
                "{} = buffer#{} : {}{}",
                self.id,
                leaf.buffer_id,
                self.dtype.name(),
                self.shape
            ),
            NodeKind::Nary(expr) => {
                write!(f, "{} = {}(", self.id, expr.op.name())?;
                for (idx, child) in expr.children.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", child.id)?;
                }
                write!(f, ") : {}{} h{}", self.dtype.name(), self.shape, self.height)
            }
        }
    }
}
