// Copyright (c) 2017-2021 Fabian Schuiki

use crate::{
    config::OptimizerConfig,
    ir::{prelude::*, ClassTable},
};
use rayon::prelude::*;
use std::sync::Arc;

/// An optimization pass.
///
/// The optimization infrastructure will always call `run_on_module()` or
/// `run_on_graph()`. Implementors of the trait should override the function
/// at their desired level of granularity. The `Pass` trait provides a sane
/// default for all `run_*()` functions.
pub trait Pass {
    /// Run this pass on an entire module.
    ///
    /// The methods of the module are processed in parallel.
    fn run_on_module(ctx: &PassContext, module: &mut Module) -> bool {
        module
            .par_graphs_mut()
            .map(|graph| Self::run_on_graph(ctx, graph))
            .reduce(|| false, |a, b| a || b)
    }

    /// Run this pass on the flow graph of a single method.
    ///
    /// Visits the instructions of all blocks in reverse postorder. Instructions
    /// removed by an earlier visit are skipped.
    fn run_on_graph(ctx: &PassContext, graph: &mut FlowGraph) -> bool {
        let mut modified = false;
        let blocks = graph.reverse_postorder().to_vec();
        for bb in blocks {
            for inst in graph.insts_vec(bb) {
                if graph.is_inst_inserted(inst) {
                    modified |= Self::run_on_inst(ctx, inst, graph);
                }
            }
        }
        modified
    }

    /// Run this pass on an instruction.
    #[allow(unused_variables)]
    fn run_on_inst(ctx: &PassContext, inst: Inst, graph: &mut FlowGraph) -> bool {
        false
    }
}

/// Additional context and configuration for optimizations.
///
/// The context is shared by all worker threads and therefore read-only.
#[derive(Clone)]
pub struct PassContext {
    pub config: OptimizerConfig,
    pub classes: Arc<ClassTable>,
}

impl PassContext {
    pub fn new(config: OptimizerConfig, classes: Arc<ClassTable>) -> Self {
        Self { config, classes }
    }
}
