// Copyright (c) 2017-2020 Fabian Schuiki

//! Re-exports of commonly used IR items.

pub use crate::ir::{
    Block, BlockKind, ClassId, ClassTable, Comparison, Constant, FlowGraph, GraphBuilder, IcData,
    Inst, InstData, Module, Opcode, Representation, Token, Use,
};
