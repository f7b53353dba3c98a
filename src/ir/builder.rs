// Copyright (c) 2017-2020 Fabian Schuiki

//! Construction of the unoptimized flow graph.
//!
//! The builder produces the graph the way a tree-walking code generator
//! would: local variables are accessed through `LoadLocal` and `StoreLocal`
//! instructions and call arguments are pushed explicitly. Values travel on an
//! implicit expression stack, so every instruction must consume its inputs in
//! the order they were produced. SSA construction checks this and later
//! removes the local accesses.

use crate::ir::{
    Block, BlockKind, ClassId, Comparison, Constant, FlowGraph, FunctionId, IcData, Inst,
    InstData, InstanceCall, Opcode, Token,
};
use std::{ops::Deref, sync::Arc};

/// A cursor that appends instructions to a flow graph.
pub struct GraphBuilder<'a> {
    graph: &'a mut FlowGraph,
    block: Block,
}

impl<'a> Deref for GraphBuilder<'a> {
    type Target = FlowGraph;
    fn deref(&self) -> &FlowGraph {
        &*self.graph
    }
}

impl<'a> GraphBuilder<'a> {
    /// Create a builder that appends to the normal entry of `graph`.
    pub fn new(graph: &'a mut FlowGraph) -> Self {
        let block = graph.normal_entry();
        Self { graph, block }
    }

    /// The block instructions are currently appended to.
    pub fn block(&self) -> Block {
        self.block
    }

    /// Append all following instructions to the end of `bb`.
    pub fn append_to(&mut self, bb: Block) {
        self.block = bb;
    }

    /// Create a block reached by exactly one branch edge.
    pub fn target_block(&mut self) -> Block {
        self.graph.add_block(BlockKind::Target)
    }

    /// Create a block reached by gotos.
    pub fn join_block(&mut self) -> Block {
        self.graph.add_block(BlockKind::Join)
    }

    /// Create an entry reached when an exception is caught.
    pub fn catch_entry(&mut self) -> Block {
        self.graph.add_catch_entry()
    }

    /// Get the graph being built.
    pub fn graph_mut(&mut self) -> &mut FlowGraph {
        &mut *self.graph
    }

    /// Add a new instruction at the end of the current block.
    ///
    /// The value inputs are marked as consumed from the expression stack.
    /// Pushed arguments stay on the stack until the call pops them and are
    /// not marked.
    pub fn build_inst(&mut self, data: InstData) -> Inst {
        let needs_deopt_id = match data.opcode() {
            Opcode::Constant
            | Opcode::LoadLocal
            | Opcode::StoreLocal
            | Opcode::PushArgument
            | Opcode::Goto => false,
            _ => true,
        };
        for &arg in data.args() {
            self.graph[arg].is_used = true;
        }
        let inst = self.graph.add_inst(data);
        if needs_deopt_id {
            let id = self.graph.alloc_deopt_id();
            self.graph[inst].deopt_id = Some(id);
        }
        self.graph.link_inst(self.block, inst);
        inst
    }

    pub fn constant(&mut self, value: Constant) -> Inst {
        self.build_inst(InstData::Constant { value })
    }

    pub fn smi(&mut self, value: i64) -> Inst {
        self.constant(Constant::Smi(value))
    }

    pub fn null(&mut self) -> Inst {
        self.constant(Constant::Null)
    }

    /// Read a local variable slot. Parameters occupy the first slots.
    pub fn load_local(&mut self, slot: usize) -> Inst {
        self.build_inst(InstData::LoadLocal { slot })
    }

    /// Write a local variable slot.
    ///
    /// The store itself evaluates to the stored value; if nothing consumes it
    /// the store is a plain statement.
    pub fn store_local(&mut self, slot: usize, value: Inst) -> Inst {
        self.build_inst(InstData::StoreLocal {
            slot,
            args: [value],
        })
    }

    /// Push a call argument.
    ///
    /// The push is placed directly after the instruction producing `value`,
    /// so the arguments of a call may be evaluated before any of them is
    /// pushed.
    pub fn push_argument(&mut self, value: Inst) -> Inst {
        let data = InstData::PushArgument { args: [value] };
        if self.graph.inst_block(value) != Some(self.block) {
            return self.build_inst(data);
        }
        self.graph[value].is_used = true;
        let push = self.graph.add_inst(data);
        self.graph.link_inst_after(value, push);
        push
    }

    fn push_arguments(&mut self, values: &[Inst]) -> Vec<Inst> {
        values.iter().map(|&v| self.push_argument(v)).collect()
    }

    /// Emit a dynamically dispatched call. The receiver is the first value.
    pub fn instance_call(
        &mut self,
        name: &str,
        token: Token,
        values: &[Inst],
        checked_argument_count: usize,
        ic: Option<IcData>,
    ) -> Inst {
        let arguments = self.push_arguments(values);
        self.build_inst(InstData::InstanceCall(Box::new(InstanceCall {
            name: name.into(),
            token,
            arguments,
            ic: ic.map(Arc::new),
            checked_argument_count,
        })))
    }

    /// Emit a call of a binary operator such as `a + b`.
    pub fn binary_call(&mut self, op: Token, left: Inst, right: Inst, ic: Option<IcData>) -> Inst {
        self.instance_call(op.symbol(), op, &[left, right], 2, ic)
    }

    /// Emit a call of a getter such as `obj.field`.
    pub fn getter_call(&mut self, field: &str, receiver: Inst, ic: Option<IcData>) -> Inst {
        let name = format!("get:{}", field);
        self.instance_call(&name, Token::Get, &[receiver], 1, ic)
    }

    /// Emit a call of a setter such as `obj.field = value`.
    pub fn setter_call(
        &mut self,
        field: &str,
        receiver: Inst,
        value: Inst,
        ic: Option<IcData>,
    ) -> Inst {
        let name = format!("set:{}", field);
        self.instance_call(&name, Token::Set, &[receiver, value], 1, ic)
    }

    pub fn static_call(&mut self, function: FunctionId, values: &[Inst]) -> Inst {
        let arguments = self.push_arguments(values);
        self.build_inst(InstData::StaticCall {
            function,
            arguments,
            result_cid: ClassId::DYNAMIC,
        })
    }

    /// Emit a call of a constructor whose result class is known, such as the
    /// fixed-length array constructor `new List(n)`.
    pub fn constructor_call(
        &mut self,
        function: FunctionId,
        values: &[Inst],
        result_cid: ClassId,
    ) -> Inst {
        let arguments = self.push_arguments(values);
        self.build_inst(InstData::StaticCall {
            function,
            arguments,
            result_cid,
        })
    }

    pub fn allocate_object(&mut self, class_id: ClassId, values: &[Inst]) -> Inst {
        let arguments = self.push_arguments(values);
        self.build_inst(InstData::AllocateObject {
            class_id,
            arguments,
        })
    }

    /// Allocate a fixed-length array holding `values`.
    pub fn create_array(&mut self, values: &[Inst]) -> Inst {
        let arguments = self.push_arguments(values);
        self.build_inst(InstData::CreateArray { arguments })
    }

    pub fn load_field(&mut self, object: Inst, offset: usize, immutable: bool) -> Inst {
        self.build_inst(InstData::LoadField {
            offset,
            result_cid: ClassId::DYNAMIC,
            recognized: crate::ir::RecognizedMethod::Unknown,
            immutable,
            args: [object],
        })
    }

    pub fn store_field(&mut self, object: Inst, offset: usize, value: Inst) -> Inst {
        self.build_inst(InstData::StoreField {
            offset,
            needs_barrier: true,
            args: [object, value],
        })
    }

    /// Emit a comparison that produces a boolean value.
    pub fn compare(&mut self, comparison: Comparison) -> Inst {
        self.build_inst(InstData::Compare(comparison))
    }

    /// Emit a conditional branch. Both targets must be target blocks.
    pub fn branch(&mut self, comparison: Comparison, then_bb: Block, else_bb: Block) -> Inst {
        self.build_inst(InstData::Branch {
            comparison,
            targets: [then_bb, else_bb],
        })
    }

    /// Branch on a boolean value by comparing it strictly against `true`.
    pub fn branch_if(&mut self, condition: Inst, then_bb: Block, else_bb: Block) -> Inst {
        let t = self.constant(Constant::Bool(true));
        self.branch(
            Comparison::strict(Token::EqStrict, condition, t),
            then_bb,
            else_bb,
        )
    }

    /// Jump to a join block.
    pub fn goto(&mut self, target: Block) -> Inst {
        self.build_inst(InstData::Goto { target })
    }

    pub fn return_value(&mut self, value: Inst) -> Inst {
        self.build_inst(InstData::unary(Opcode::Return, value))
    }

    pub fn throw(&mut self, value: Inst) -> Inst {
        self.build_inst(InstData::unary(Opcode::Throw, value))
    }
}
