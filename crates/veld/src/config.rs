//! Evaluation configuration.

use std::env;
use std::sync::OnceLock;

/// Fallback fusion height limit when the environment does not override it.
pub const DEFAULT_FUSION_HEIGHT_LIMIT: usize = 8;

static ENV_HEIGHT_LIMIT: OnceLock<Option<usize>> = OnceLock::new();

fn env_height_limit() -> Option<usize> {
    *ENV_HEIGHT_LIMIT.get_or_init(|| match env::var("VELD_FUSION_HEIGHT") {
        Ok(value) => value.trim().parse::<usize>().ok().filter(|limit| *limit > 0),
        Err(_) => None,
    })
}

/// Tunables for one evaluation context.
///
/// The fusion height limit bounds the longest chain of operations fused into
/// a single kernel, which is how this core respects backend resource limits
/// (argument counts, register pressure). It is the only recognized option.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub fusion_height_limit: usize,
}

impl EvalConfig {
    pub fn with_height_limit(fusion_height_limit: usize) -> Self {
        Self {
            fusion_height_limit,
        }
    }
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            fusion_height_limit: env_height_limit().unwrap_or(DEFAULT_FUSION_HEIGHT_LIMIT),
        }
    }
}
