//! Kernel code generation: partition lowering, source emission, caching.
//!
//! Emitted kernels are cached process-wide by program signature so repeated
//! evaluations of structurally identical partitions reuse one emission.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use once_cell::sync::Lazy;

use crate::graph::signature::hash_serializable;

mod emit;
mod program;

pub use emit::emit_source;
pub use program::{lower, KernelProgram, KernelStep, StepArg};

/// Number of emitted kernels retained before LRU eviction kicks in.
const KERNEL_CACHE_CAPACITY: usize = 128;

static KERNEL_CACHE: Lazy<Mutex<LruCache<u64, Arc<Kernel>>>> = Lazy::new(|| {
    Mutex::new(LruCache::new(
        NonZeroUsize::new(KERNEL_CACHE_CAPACITY).expect("cache capacity is non-zero"),
    ))
});

/// A fused kernel ready for dispatch: the structured program for backends
/// that interpret or recompile, and the emitted source text for backends
/// that compile it directly.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    pub name: String,
    pub source: String,
    pub program: KernelProgram,
}

/// Returns the cached kernel for `program`, emitting it on first use.
///
/// Hash collisions are disambiguated by comparing the cached program, so a
/// collision costs a recompile, never a wrong kernel.
pub fn kernel_for(program: &KernelProgram) -> Arc<Kernel> {
    let signature = hash_serializable(program);
    let mut cache = KERNEL_CACHE.lock().expect("kernel cache poisoned");
    if let Some(kernel) = cache.get(&signature) {
        if kernel.program == *program {
            return Arc::clone(kernel);
        }
    }
    let name = format!("veld_fused_{signature:016x}");
    let kernel = Arc::new(Kernel {
        source: emit_source(&name, program),
        name,
        program: program.clone(),
    });
    cache.put(signature, Arc::clone(&kernel));
    kernel
}
