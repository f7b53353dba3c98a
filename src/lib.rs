// Copyright (c) 2017 Fabian Schuiki

//! The optimizing middle-end of a method JIT. This library builds an SSA flow
//! graph from the unoptimized graph of a method and runs the optimization
//! pipeline over it.

#[macro_use]
extern crate log;

pub mod analysis;
pub mod config;
pub mod error;
pub mod ir;
pub mod opt;
pub mod pass;
pub mod ssa;
pub mod table;
pub mod verifier;

pub use crate::{config::OptimizerConfig, error::Bailout};
