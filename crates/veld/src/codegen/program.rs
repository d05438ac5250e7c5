//! Backend-agnostic kernel programs lowered from fusion partitions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::backend::ComputeBackend;
use crate::dtype::{BufferSpec, DType};
use crate::fusion::KernelPartition;
use crate::op::Operation;

/// Reference to a step operand: an input slot or an earlier step's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepArg {
    Input(usize),
    Step(usize),
}

/// One computed value inside a fused kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelStep {
    pub op: Operation,
    pub args: SmallVec<[StepArg; 2]>,
}

/// A complete fused kernel: input slots, topologically ordered steps, and
/// the output the final step writes.
///
/// The program carries no node references, so backends and the kernel cache
/// can hold it without keeping graphs alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelProgram {
    pub inputs: Vec<BufferSpec>,
    pub steps: Vec<KernelStep>,
    pub output: BufferSpec,
}

impl KernelProgram {
    /// Result dtype of every step, in step order.
    pub fn step_dtypes(&self) -> Vec<DType> {
        let mut dtypes = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let arg_dtype = |arg: &StepArg| match arg {
                StepArg::Input(slot) => self.inputs[*slot].dtype,
                StepArg::Step(idx) => dtypes[*idx],
            };
            let dtype = match &step.op {
                Operation::Cast(spec) => spec.dtype,
                Operation::Select => arg_dtype(&step.args[1]),
                _ => arg_dtype(&step.args[0]),
            };
            dtypes.push(dtype);
        }
        dtypes
    }
}

/// Lowers a partition to its kernel program.
///
/// Interior nodes become steps in the partition's topological order; boundary
/// nodes become input slots. The planner guarantees every operand of every
/// interior node is either an earlier interior node or a partition input.
pub fn lower<B: ComputeBackend + 'static>(partition: &KernelPartition<B>) -> KernelProgram {
    let input_slots: HashMap<_, _> = partition
        .inputs
        .iter()
        .enumerate()
        .map(|(slot, node)| (node.id(), slot))
        .collect();
    let mut step_index = HashMap::new();

    let mut steps = Vec::with_capacity(partition.nodes.len());
    for (idx, node) in partition.nodes.iter().enumerate() {
        let op = node
            .operation()
            .expect("planner placed a leaf inside a partition")
            .clone();
        let args = node
            .children()
            .iter()
            .map(|child| {
                let id = child.id();
                if let Some(step) = step_index.get(&id) {
                    StepArg::Step(*step)
                } else {
                    StepArg::Input(
                        *input_slots
                            .get(&id)
                            .expect("partition operand is neither a step nor an input"),
                    )
                }
            })
            .collect();
        steps.push(KernelStep { op, args });
        step_index.insert(node.id(), idx);
    }

    KernelProgram {
        inputs: partition.inputs.iter().map(|node| node.spec()).collect(),
        steps,
        output: partition.root.spec(),
    }
}
