//! Partitioning of the lazy DAG into fused kernel launches.

mod planner;

pub use planner::{plan, KernelPartition};
