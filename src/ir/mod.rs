// Copyright (c) 2017-2019 Fabian Schuiki

//! Representation of methods as flow graphs.
//!
//! This module implements the intermediate representation around which the rest
//! of the optimizer is built. A method is a `FlowGraph` of basic blocks, each
//! holding a linked list of instructions. Instructions that produce a value are
//! definitions; every input of an instruction is a use edge that is recorded in
//! the use list of the definition it refers to.

use crate::impl_table_key;
use serde::{Deserialize, Serialize};

mod builder;
mod class_table;
mod env;
mod graph;
mod ic;
mod inst;
mod layout;
mod module;
mod object;
pub mod prelude;
mod range;
mod token;
pub mod writer;

pub use self::builder::*;
pub use self::class_table::*;
pub use self::env::*;
pub use self::graph::*;
pub use self::ic::*;
pub use self::inst::*;
pub use self::module::*;
pub use self::object::*;
pub use self::range::*;
pub use self::token::*;

impl_table_key! {
    /// A basic block.
    struct Block(u32) as "B";

    /// An instruction, possibly a definition.
    struct Inst(u32) as "i";

    /// A function known to the class table.
    #[derive(Serialize, Deserialize)]
    struct FunctionId(u32) as "fn";
}

impl Block {
    /// A placeholder for blocks that have not been created yet.
    pub fn invalid() -> Self {
        Block(std::u32::MAX)
    }
}

impl Inst {
    /// A placeholder for inputs that have not been filled in yet.
    ///
    /// This is used for phi inputs between phi placement and renaming.
    pub fn invalid() -> Self {
        Inst(std::u32::MAX)
    }
}

/// An identifier of a deoptimization point in the unoptimized code.
pub type DeoptId = u32;
