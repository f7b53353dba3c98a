// Copyright (c) 2017-2020 Fabian Schuiki

//! The optimization pipeline.

use crate::{
    error::{Bailout, Result},
    ir::{FlowGraph, Module},
    opt::{Pass, PassContext},
    pass::{
        ApplyClassIds, Canonicalize, ConstantPropagation, DominatorBasedCse,
        LoadElimination, LoopInvariantCodeMotion, RangeAnalysis, SelectRepresentations,
        SmiPropagation, Specialize, TypePropagation,
    },
    ssa::compute_ssa,
    verifier::Verifier,
};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

/// A single step of the pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Specialize,
    ApplyClassIds,
    Canonicalize,
    Types,
    Sccp,
    LoadElim,
    Cse,
    Licm,
    Smi,
    Range,
    Repr,
}

/// All stages, in the order they are listed by the command line tools.
pub static STAGES: [Stage; 11] = [
    Stage::Specialize,
    Stage::ApplyClassIds,
    Stage::Canonicalize,
    Stage::Types,
    Stage::Sccp,
    Stage::LoadElim,
    Stage::Cse,
    Stage::Licm,
    Stage::Smi,
    Stage::Range,
    Stage::Repr,
];

static STAGE_TIMES: [AtomicU64; 11] = [
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
];

impl Stage {
    /// The short name of the stage.
    pub fn name(self) -> &'static str {
        match self {
            Stage::Specialize => "specialize",
            Stage::ApplyClassIds => "classids",
            Stage::Canonicalize => "canon",
            Stage::Types => "types",
            Stage::Sccp => "sccp",
            Stage::LoadElim => "loadelim",
            Stage::Cse => "cse",
            Stage::Licm => "licm",
            Stage::Smi => "smi",
            Stage::Range => "range",
            Stage::Repr => "repr",
        }
    }

    /// Look up a stage by its short name.
    pub fn from_name(name: &str) -> Option<Stage> {
        STAGES.iter().cloned().find(|s| s.name() == name)
    }

    fn index(self) -> usize {
        STAGES.iter().position(|&s| s == self).unwrap_or(0)
    }

    /// The total time spent in this stage across all methods, in nanoseconds.
    pub fn time(self) -> u64 {
        STAGE_TIMES[self.index()].load(Ordering::Relaxed)
    }

    /// Run the stage on a single method. Returns whether the graph changed.
    pub fn run(self, ctx: &PassContext, graph: &mut FlowGraph) -> bool {
        let t0 = time::precise_time_ns();
        let modified = match self {
            Stage::Specialize => Specialize::run_on_graph(ctx, graph),
            Stage::ApplyClassIds => ApplyClassIds::run_on_graph(ctx, graph),
            Stage::Canonicalize => Canonicalize::run_on_graph(ctx, graph),
            Stage::Types => TypePropagation::run_on_graph(ctx, graph),
            Stage::Sccp => ConstantPropagation::run_on_graph(ctx, graph),
            Stage::LoadElim => LoadElimination::run_on_graph(ctx, graph),
            Stage::Cse => DominatorBasedCse::run_on_graph(ctx, graph),
            Stage::Licm => LoopInvariantCodeMotion::run_on_graph(ctx, graph),
            Stage::Smi => SmiPropagation::run_on_graph(ctx, graph),
            Stage::Range => RangeAnalysis::run_on_graph(ctx, graph),
            Stage::Repr => SelectRepresentations::run_on_graph(ctx, graph),
        };
        let t1 = time::precise_time_ns();
        STAGE_TIMES[self.index()].fetch_add(t1 - t0, Ordering::Relaxed);
        debug!(
            "Ran {} on {} ({})",
            self.name(),
            graph.name,
            if modified { "modified" } else { "unchanged" }
        );
        if ctx.config.trace_optimization {
            debug!("After {}:\n{}", self.name(), graph.dump());
        }
        modified
    }
}

/// The stages run by `optimize`, given a configuration.
pub fn default_stages(ctx: &PassContext) -> Vec<Stage> {
    let config = &ctx.config;
    let mut stages = vec![Stage::Specialize, Stage::Canonicalize];
    if config.propagate_types {
        stages.extend(&[Stage::Types, Stage::ApplyClassIds, Stage::Canonicalize]);
    }
    if config.constant_propagation {
        stages.extend(&[Stage::Sccp, Stage::Canonicalize]);
    }
    if config.load_cse {
        stages.push(Stage::LoadElim);
    }
    if config.cse {
        stages.push(Stage::Cse);
    }
    if config.licm {
        stages.push(Stage::Licm);
    }
    // Range analysis relies on checks hoisted through loop phis by LICM.
    if config.range_analysis {
        stages.extend(&[Stage::Smi, Stage::Range]);
    }
    stages.extend(&[Stage::Canonicalize, Stage::Repr]);
    stages
}

/// Build SSA form for a method and run the full optimization pipeline.
///
/// On a bailout the graph is left in an unspecified state; the caller should
/// discard it and keep running the unoptimized code.
pub fn optimize(ctx: &PassContext, graph: &mut FlowGraph) -> Result<()> {
    compute_ssa(graph)?;
    verify(ctx, graph, "SSA construction")?;
    if ctx.config.trace_optimization {
        debug!("After SSA construction:\n{}", graph.dump());
    }
    run_stages(ctx, graph, &default_stages(ctx))?;
    Ok(())
}

/// Run a sequence of stages on a graph that is already in SSA form.
pub fn run_stages(ctx: &PassContext, graph: &mut FlowGraph, stages: &[Stage]) -> Result<()> {
    for &stage in stages {
        stage.run(ctx, graph);
    }
    verify(ctx, graph, "optimization")
}

/// Optimize every method of a module in parallel.
///
/// Returns one result per method, in module order.
pub fn optimize_module(ctx: &PassContext, module: &mut Module) -> Vec<Result<()>> {
    module
        .par_graphs_mut()
        .map(|graph| {
            let result = optimize(ctx, graph);
            if let Err(ref e) = result {
                info!("Bailing out of {}: {}", graph.name, e);
            }
            result
        })
        .collect()
}

/// Verify the graph if the configuration asks for it.
fn verify(ctx: &PassContext, graph: &FlowGraph, after: &str) -> Result<()> {
    if !ctx.config.should_verify() {
        return Ok(());
    }
    let mut verifier = Verifier::new();
    verifier.verify_graph(graph);
    verifier.finish().map_err(|errs| {
        error!("Verification of {} failed after {}:\n{}", graph.name, after, errs);
        Bailout::MalformedGraph(format!("{} invariant violations after {}", errs.len(), after))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;

    #[test]
    fn stage_names_round_trip() {
        for &stage in STAGES.iter() {
            assert_eq!(Stage::from_name(stage.name()), Some(stage));
        }
        assert_eq!(Stage::from_name("bogus"), None);
    }

    #[test]
    fn disabled_stages_are_skipped() {
        let config = OptimizerConfig {
            propagate_types: false,
            constant_propagation: false,
            licm: false,
            ..Default::default()
        };
        let ctx = PassContext::new(config, Default::default());
        let stages = default_stages(&ctx);
        assert!(!stages.contains(&Stage::Types));
        assert!(!stages.contains(&Stage::Sccp));
        assert!(!stages.contains(&Stage::Licm));
        assert_eq!(stages.last(), Some(&Stage::Repr));
    }
}
