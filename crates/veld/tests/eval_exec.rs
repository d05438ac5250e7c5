use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use veld::backend::{BackendResult, ComputeBackend};
use veld::{
    Array, BufferSpec, Context, DType, EvalConfig, HostBuffer, Kernel, Operation, Shape,
};
use veld_backend_ref_cpu::{CpuBackend, CpuBuffer};

/// Delegating backend that counts launches and can inject failures or
/// reject operations, so tests can observe the evaluation driver.
struct ProbeBackend {
    inner: CpuBackend,
    launches: AtomicUsize,
    fail_launches: AtomicBool,
    reject_select: bool,
}

impl ProbeBackend {
    fn new() -> Self {
        ProbeBackend {
            inner: CpuBackend::new(),
            launches: AtomicUsize::new(0),
            fail_launches: AtomicBool::new(false),
            reject_select: false,
        }
    }

    fn rejecting_select() -> Self {
        ProbeBackend {
            reject_select: true,
            ..Self::new()
        }
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn set_failing(&self, failing: bool) {
        self.fail_launches.store(failing, Ordering::SeqCst);
    }
}

impl ComputeBackend for ProbeBackend {
    type BufferHandle = CpuBuffer;

    fn backend_name(&self) -> &str {
        "ref-cpu-probe"
    }

    fn alloc(&self, spec: &BufferSpec) -> BackendResult<Self::BufferHandle> {
        self.inner.alloc(spec)
    }

    fn upload(&self, host: &HostBuffer) -> BackendResult<Self::BufferHandle> {
        self.inner.upload(host)
    }

    fn download(&self, spec: &BufferSpec, handle: &Self::BufferHandle) -> BackendResult<HostBuffer> {
        self.inner.download(spec, handle)
    }

    fn launch(
        &self,
        kernel: &Kernel,
        inputs: &[Self::BufferHandle],
        output: &Self::BufferHandle,
    ) -> BackendResult<()> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(veld::BackendError::execution("injected launch failure"));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.inner.launch(kernel, inputs, output)
    }

    fn supports(&self, op: &Operation) -> bool {
        !(self.reject_select && matches!(op, Operation::Select))
    }
}

fn probe_context() -> (Arc<Context<ProbeBackend>>, Arc<ProbeBackend>) {
    let backend = Arc::new(ProbeBackend::new());
    (Context::new(Arc::clone(&backend)), backend)
}

fn leaf(ctx: &Arc<Context<ProbeBackend>>, data: &[f32]) -> Result<Array<ProbeBackend>> {
    let host = HostBuffer::from_f32(Shape::new([data.len()]), data)
        .expect("length matches shape");
    Array::from_host(ctx, host)
}

fn read_f32(array: &Array<ProbeBackend>) -> Result<Vec<f32>> {
    Ok(array.to_host()?.as_f32().expect("f32 payload"))
}

#[test]
fn shared_add_evaluates_in_one_kernel() -> Result<()> {
    let (ctx, backend) = probe_context();
    let a = leaf(&ctx, &[1.0, 2.0, 3.0])?;
    let b = leaf(&ctx, &[4.0, 5.0, 6.0])?;

    let sum = a.add(&b)?;
    let c = sum.mul(&a.add(&b)?)?;
    assert_eq!(backend.launches(), 0, "nothing runs before evaluation");

    assert_eq!(read_f32(&c)?, vec![25.0, 49.0, 81.0]);
    assert_eq!(backend.launches(), 1, "shared add fuses into the one kernel");
    Ok(())
}

#[test]
fn long_chain_runs_as_five_kernels() -> Result<()> {
    let backend = Arc::new(ProbeBackend::new());
    let ctx = Context::with_config(Arc::clone(&backend), EvalConfig::with_height_limit(10));

    let one = leaf(&ctx, &[1.0, 1.0, 1.0])?;
    let mut x = leaf(&ctx, &[1.0, 2.0, 3.0])?;
    for _ in 0..50 {
        x = x.add(&one)?;
    }

    assert_eq!(read_f32(&x)?, vec![51.0, 52.0, 53.0]);
    assert_eq!(backend.launches(), 5);
    Ok(())
}

#[test]
fn fused_and_eager_evaluation_agree() -> Result<()> {
    let expression = |ctx: &Arc<Context<ProbeBackend>>| -> Result<Array<ProbeBackend>> {
        let a = leaf(ctx, &[0.5, -1.5, 2.0, 3.25])?;
        let b = leaf(ctx, &[4.0, 0.25, -2.0, 1.0])?;

        // Depth 1.
        let d1 = a.add(&b)?;
        // Depth 2 with a transcendental.
        let d2 = d1.tanh()?.mul(&b.abs()?.sqrt()?)?;
        // Deep chain that exceeds the fused-mode height limit.
        let mut chain = d2;
        for _ in 0..12 {
            chain = chain.add(&a)?.mul(&b.recip()?)?;
        }
        Ok(chain)
    };

    let backend = Arc::new(ProbeBackend::new());
    let fused_ctx = Context::with_config(Arc::clone(&backend), EvalConfig::with_height_limit(8));
    let eager_ctx = Context::with_config(Arc::clone(&backend), EvalConfig::with_height_limit(1));

    let fused = read_f32(&expression(&fused_ctx)?)?;
    let eager = read_f32(&expression(&eager_ctx)?)?;
    assert_eq!(fused.len(), eager.len());
    for (f, e) in fused.iter().zip(eager.iter()) {
        assert!(
            (f - e).abs() <= 1e-5 * e.abs().max(1.0),
            "fused {f} diverged from eager {e}"
        );
    }
    Ok(())
}

#[test]
fn re_evaluation_is_idempotent_and_launch_free() -> Result<()> {
    let (ctx, backend) = probe_context();
    let a = leaf(&ctx, &[1.0, 2.0])?;
    let b = leaf(&ctx, &[3.0, 4.0])?;
    let c = a.add(&b)?.exp()?;
    let alias = c.clone();

    let first = read_f32(&c)?;
    assert_eq!(backend.launches(), 1);

    // Same handle, a clone, and a fresh read all reuse the buffer.
    let second = read_f32(&c)?;
    let third = read_f32(&alias)?;
    assert_eq!(backend.launches(), 1);
    assert_eq!(first, second);
    assert_eq!(first, third);

    // The evaluated root collapsed to a leaf; new work builds on the buffer.
    assert!(c.node().is_buffer());
    let more = c.mul(&a)?;
    more.eval()?;
    assert_eq!(backend.launches(), 2);
    Ok(())
}

#[test]
fn evaluating_a_subexpression_reuses_the_memoized_buffer() -> Result<()> {
    let (ctx, backend) = probe_context();
    let a = leaf(&ctx, &[1.0, 2.0])?;
    let b = leaf(&ctx, &[3.0, 4.0])?;

    let shared = a.add(&b)?;
    let root = shared.exp()?.mul(&shared.tanh()?)?;
    root.eval()?;
    let launches_for_root = backend.launches();

    // `shared` was materialized as a partition output while evaluating
    // `root`; forcing it now must not launch anything new.
    let direct = read_f32(&shared)?;
    assert_eq!(backend.launches(), launches_for_root);
    assert_eq!(direct, vec![4.0, 6.0]);
    Ok(())
}

#[test]
fn unsupported_operation_aborts_and_preserves_the_graph() -> Result<()> {
    let backend = Arc::new(ProbeBackend::rejecting_select());
    let ctx = Context::new(Arc::clone(&backend));

    let a = leaf(&ctx, &[1.0, 0.0, 2.0])?;
    let b = leaf(&ctx, &[5.0, 6.0, 7.0])?;
    let cond = a.cast(DType::I1)?;
    let chosen = Array::select(&cond, &a, &b)?;

    let err = chosen.eval().unwrap_err();
    assert!(err.to_string().contains("not supported"), "{err}");
    assert_eq!(backend.launches(), 0, "nothing may launch before the check");
    assert!(!chosen.node().is_buffer(), "graph must stay lazy for retry");

    // The context stays usable for expressions the backend does support.
    assert_eq!(read_f32(&a.add(&b)?)?, vec![6.0, 6.0, 9.0]);
    Ok(())
}

#[test]
fn failed_launches_commit_nothing() -> Result<()> {
    let backend = Arc::new(ProbeBackend::new());
    let ctx = Context::with_config(Arc::clone(&backend), EvalConfig::with_height_limit(2));

    let one = leaf(&ctx, &[1.0, 1.0])?;
    let mut x = leaf(&ctx, &[0.0, 0.0])?;
    for _ in 0..6 {
        x = x.add(&one)?;
    }

    backend.set_failing(true);
    let err = x.eval().unwrap_err();
    assert!(err.to_string().contains("injected launch failure"), "{err}");
    assert!(!x.node().is_buffer());

    // Retry runs the full plan: no partial buffer set survived the failure.
    backend.set_failing(false);
    assert_eq!(read_f32(&x)?, vec![6.0, 6.0]);
    assert_eq!(backend.launches(), 3, "three partitions at height limit 2");
    Ok(())
}

#[test]
fn broadcast_select_and_cast_evaluate_together() -> Result<()> {
    let (ctx, backend) = probe_context();
    let matrix = Array::from_host(
        &ctx,
        HostBuffer::from_f32(Shape::new([2, 3]), &[1.0, -2.0, 3.0, -4.0, 5.0, -6.0])
            .expect("length matches shape"),
    )?;
    let row = leaf(&ctx, &[10.0, 20.0, 30.0])?;

    // Negative entries become |m| + row (broadcast along the rows);
    // non-negative entries pass through unchanged.
    let zero = leaf(&ctx, &[0.0])?;
    let cond = matrix.minimum(&zero)?.cast(DType::I1)?;
    let blended = Array::select(&cond, &matrix.abs()?.add(&row)?, &matrix)?;

    let values = read_f32(&blended)?;
    assert_eq!(values, vec![1.0, 22.0, 3.0, 14.0, 5.0, 36.0]);
    assert!(backend.launches() >= 1);
    Ok(())
}
