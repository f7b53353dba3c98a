// Copyright (c) 2017-2020 Fabian Schuiki

//! Analysis passes on the IR
//!
//! This module implements the control flow analyses the SSA construction and
//! the optimization passes build upon.

mod domtree;
mod loops;

pub use self::domtree::*;
pub use self::loops::*;
