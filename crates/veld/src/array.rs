//! Lazy array handles that delay evaluation until a value is required.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, ensure, Result};

use crate::backend::ComputeBackend;
use crate::dtype::{DType, HostBuffer, Shape};
use crate::eval::evaluate;
use crate::graph::{Context, Node};
use crate::op::{BinaryOp, CastSpec, Operation, ShiftSpec, UnaryOp};

/// Handle over a lazy expression. Clones share both the context and the
/// current root, so evaluating any clone collapses the graph for all of
/// them. The nodes below the root are shared with every other handle whose
/// expression includes them; that sharing is the point of CSE and is never
/// deep-copied.
pub struct Array<B: ComputeBackend + 'static> {
    ctx: Arc<Context<B>>,
    root: Arc<Mutex<Arc<Node<B>>>>,
}

impl<B: ComputeBackend + 'static> Clone for Array<B> {
    fn clone(&self) -> Self {
        Array {
            ctx: Arc::clone(&self.ctx),
            root: Arc::clone(&self.root),
        }
    }
}

impl<B: ComputeBackend + 'static> std::fmt::Debug for Array<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let node = self.root.lock().unwrap();
        f.debug_struct("Array")
            .field("dtype", &node.dtype)
            .field("shape", &node.shape)
            .finish()
    }
}

impl<B: ComputeBackend + 'static> Array<B> {
    /// Transfers a host payload into backend memory and wraps it as a leaf.
    pub fn from_host(ctx: &Arc<Context<B>>, host: HostBuffer) -> Result<Self> {
        let handle = ctx.backend().upload(&host)?;
        let node = ctx.import_buffer(handle, host.spec);
        Ok(Self::from_node(ctx, node))
    }

    /// Wraps an existing node from the same context.
    pub fn from_node(ctx: &Arc<Context<B>>, node: Arc<Node<B>>) -> Self {
        Array {
            ctx: Arc::clone(ctx),
            root: Arc::new(Mutex::new(node)),
        }
    }

    pub fn context(&self) -> &Arc<Context<B>> {
        &self.ctx
    }

    /// Snapshot of the current root node.
    pub fn node(&self) -> Arc<Node<B>> {
        Arc::clone(&self.root.lock().expect("array root poisoned"))
    }

    pub fn dtype(&self) -> DType {
        self.node().dtype()
    }

    pub fn shape(&self) -> Shape {
        self.node().shape().clone()
    }

    fn record(&self, op: Operation, children: &[Arc<Node<B>>]) -> Result<Self> {
        let node = self.ctx.record_operation(op, children)?;
        Ok(Self::from_node(&self.ctx, node))
    }

    fn binary(&self, op: BinaryOp, rhs: &Array<B>) -> Result<Self> {
        ensure!(
            Arc::ptr_eq(&self.ctx, &rhs.ctx),
            "operands belong to different contexts"
        );
        self.record(Operation::Binary(op), &[self.node(), rhs.node()])
    }

    fn unary(&self, op: UnaryOp) -> Result<Self> {
        self.record(Operation::Unary(op), &[self.node()])
    }

    pub fn add(&self, rhs: &Array<B>) -> Result<Self> {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(&self, rhs: &Array<B>) -> Result<Self> {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn mul(&self, rhs: &Array<B>) -> Result<Self> {
        self.binary(BinaryOp::Mul, rhs)
    }

    pub fn div(&self, rhs: &Array<B>) -> Result<Self> {
        self.binary(BinaryOp::Div, rhs)
    }

    pub fn maximum(&self, rhs: &Array<B>) -> Result<Self> {
        self.binary(BinaryOp::Maximum, rhs)
    }

    pub fn minimum(&self, rhs: &Array<B>) -> Result<Self> {
        self.binary(BinaryOp::Minimum, rhs)
    }

    pub fn neg(&self) -> Result<Self> {
        self.unary(UnaryOp::Neg)
    }

    pub fn abs(&self) -> Result<Self> {
        self.unary(UnaryOp::Abs)
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Self> {
        self.unary(UnaryOp::Log)
    }

    pub fn tanh(&self) -> Result<Self> {
        self.unary(UnaryOp::Tanh)
    }

    pub fn erf(&self) -> Result<Self> {
        self.unary(UnaryOp::Erf)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn rsqrt(&self) -> Result<Self> {
        self.unary(UnaryOp::Rsqrt)
    }

    pub fn recip(&self) -> Result<Self> {
        self.unary(UnaryOp::Reciprocal)
    }

    pub fn cast(&self, dtype: DType) -> Result<Self> {
        self.record(Operation::Cast(CastSpec { dtype }), &[self.node()])
    }

    /// Elementwise choose: `cond ? a : b`, broadcasting all three operands.
    pub fn select(cond: &Array<B>, a: &Array<B>, b: &Array<B>) -> Result<Self> {
        ensure!(
            Arc::ptr_eq(&cond.ctx, &a.ctx) && Arc::ptr_eq(&a.ctx, &b.ctx),
            "operands belong to different contexts"
        );
        cond.record(Operation::Select, &[cond.node(), a.node(), b.node()])
    }

    /// Reads this array at per-axis wrapped offsets.
    pub fn shift(&self, offset: impl Into<Vec<i64>>) -> Result<Self> {
        self.record(
            Operation::Shift(ShiftSpec {
                offset: offset.into(),
            }),
            &[self.node()],
        )
    }

    /// Forces materialization: fuses and launches whatever the current root
    /// still needs, then replaces the root with a leaf over the produced
    /// buffer. The old subgraph is reclaimed once no other handle holds it.
    pub fn eval(&self) -> Result<()> {
        let node = self.node();
        if node.is_buffer() {
            return Ok(());
        }
        let handle = evaluate(&self.ctx, &node)?;
        let leaf = self.ctx.import_buffer(handle, node.spec());
        *self.root.lock().expect("array root poisoned") = leaf;
        Ok(())
    }

    /// Evaluates (if needed) and reads the buffer back to host memory.
    pub fn to_host(&self) -> Result<HostBuffer> {
        self.eval()?;
        let node = self.node();
        let handle = node
            .buffer_handle()
            .ok_or_else(|| anyhow!("evaluation did not produce a buffer"))?;
        Ok(self.ctx.backend().download(&node.spec(), handle)?)
    }
}
