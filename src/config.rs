// Copyright (c) 2017-2020 Fabian Schuiki

//! Optimizer configuration.

use serde::{Deserialize, Serialize};

/// Knobs controlling which optimizations run and how aggressive they are.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// The largest number of receiver classes for which a call is turned into
    /// a polymorphic dispatch.
    pub max_polymorphic_checks: usize,
    /// Whether the target keeps 64 bit integers unboxed. If not, wide integer
    /// arithmetic stays a call.
    pub unboxed_mints: bool,
    /// Whether the class hierarchy may be consulted to skip class checks.
    pub use_cha: bool,
    pub propagate_types: bool,
    pub constant_propagation: bool,
    pub load_cse: bool,
    pub cse: bool,
    pub licm: bool,
    pub range_analysis: bool,
    /// Whether range analysis may remove array bounds checks.
    pub array_bounds_check_elimination: bool,
    /// Verify the graph after construction and at the end of the pipeline,
    /// even in release builds.
    pub verify: bool,
    /// Dump the graph after every pass.
    pub trace_optimization: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_polymorphic_checks: 4,
            unboxed_mints: true,
            use_cha: true,
            propagate_types: true,
            constant_propagation: true,
            load_cse: true,
            cse: true,
            licm: true,
            range_analysis: true,
            array_bounds_check_elimination: true,
            verify: false,
            trace_optimization: false,
        }
    }
}

impl OptimizerConfig {
    /// Check whether the graph should be verified between stages.
    pub fn should_verify(&self) -> bool {
        self.verify || cfg!(debug_assertions)
    }
}
