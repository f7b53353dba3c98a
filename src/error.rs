// Copyright (c) 2017-2020 Fabian Schuiki

//! Reasons for abandoning the optimization of a method.

use crate::ir::Block;
use thiserror::Error;

/// A construct the optimizer cannot handle.
///
/// A bailout aborts the optimization of the current method. The caller keeps
/// executing the unoptimized code instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Bailout {
    /// The graph has exception handler entries.
    #[error("Catch-entry support in SSA")]
    CatchEntry,
    /// An instruction consumed more values than the expression stack held.
    #[error("expression stack underflow in {block}")]
    StackUnderflow { block: Block },
    /// A local variable slot beyond the parameters and locals was accessed.
    #[error("unresolved local variable slot {slot}")]
    UnresolvedLocal { slot: usize },
    /// The graph violates an invariant the optimizer relies on.
    #[error("malformed graph: {0}")]
    MalformedGraph(String),
}

/// The result of a stage that may bail out.
pub type Result<T> = std::result::Result<T, Bailout>;
