// Copyright (c) 2017-2019 Fabian Schuiki

//! Optimization and analysis passes on the flow graph.
//!
//! This module implements the passes that specialize, simplify, and annotate
//! the SSA form of a method before it is handed to the backend.

pub mod canonicalize;
pub mod cse;
pub mod licm;
pub mod load_elim;
pub mod range;
pub mod repr;
pub mod sccp;
pub mod smi;
pub mod specialize;
pub mod types;

pub use canonicalize::Canonicalize;
pub use cse::DominatorBasedCse;
pub use licm::LoopInvariantCodeMotion;
pub use load_elim::LoadElimination;
pub use range::RangeAnalysis;
pub use repr::SelectRepresentations;
pub use sccp::ConstantPropagation;
pub use smi::SmiPropagation;
pub use specialize::{ApplyClassIds, Specialize};
pub use types::TypePropagation;
