// Copyright (c) 2017-2021 Fabian Schuiki

//! Instruction ordering within blocks.

use crate::{
    ir::{Block, Inst},
    table::SecondaryTable,
};

/// The position of every instruction within its block.
///
/// Each block holds a doubly linked list of instructions. Phis and the
/// initial definitions of the graph entry are kept outside of these lists.
#[derive(Default, Clone)]
pub(super) struct InstLayout {
    blocks: SecondaryTable<Block, BlockNode>,
    insts: SecondaryTable<Inst, InstNode>,
}

#[derive(Default, Clone)]
struct BlockNode {
    first_inst: Option<Inst>,
    last_inst: Option<Inst>,
}

#[derive(Clone)]
struct InstNode {
    block: Block,
    prev: Option<Inst>,
    next: Option<Inst>,
}

impl InstLayout {
    fn block_node(&mut self, block: Block) -> &mut BlockNode {
        if !self.blocks.contains(block) {
            self.blocks.add(block, BlockNode::default());
        }
        &mut self.blocks[block]
    }

    /// Append an instruction to the end of a block.
    pub fn append_inst(&mut self, inst: Inst, block: Block) {
        let last = self.block_node(block).last_inst;
        self.insts.add(
            inst,
            InstNode {
                block,
                prev: last,
                next: None,
            },
        );
        if let Some(prev) = last {
            self.insts[prev].next = Some(inst);
        }
        let node = self.block_node(block);
        if node.first_inst.is_none() {
            node.first_inst = Some(inst);
        }
        node.last_inst = Some(inst);
    }

    /// Prepend an instruction to the beginning of a block.
    pub fn prepend_inst(&mut self, inst: Inst, block: Block) {
        let first = self.block_node(block).first_inst;
        self.insts.add(
            inst,
            InstNode {
                block,
                prev: None,
                next: first,
            },
        );
        if let Some(next) = first {
            self.insts[next].prev = Some(inst);
        }
        let node = self.block_node(block);
        if node.last_inst.is_none() {
            node.last_inst = Some(inst);
        }
        node.first_inst = Some(inst);
    }

    /// Insert an instruction after another one.
    pub fn insert_inst_after(&mut self, inst: Inst, after: Inst) {
        let block = self.insts[after].block;
        let next = self.insts[after].next;
        self.insts.add(
            inst,
            InstNode {
                block,
                prev: Some(after),
                next,
            },
        );
        if let Some(next) = next {
            self.insts[next].prev = Some(inst);
        }
        self.insts[after].next = Some(inst);
        let node = self.block_node(block);
        if node.last_inst == Some(after) {
            node.last_inst = Some(inst);
        }
    }

    /// Insert an instruction before another one.
    pub fn insert_inst_before(&mut self, inst: Inst, before: Inst) {
        let block = self.insts[before].block;
        let prev = self.insts[before].prev;
        self.insts.add(
            inst,
            InstNode {
                block,
                prev,
                next: Some(before),
            },
        );
        if let Some(prev) = prev {
            self.insts[prev].next = Some(inst);
        }
        self.insts[before].prev = Some(inst);
        let node = self.block_node(block);
        if node.first_inst == Some(before) {
            node.first_inst = Some(inst);
        }
    }

    /// Remove an instruction from its block.
    pub fn remove_inst(&mut self, inst: Inst) {
        let node = self.insts.remove(inst).expect("inst not in layout");
        if let Some(next) = node.next {
            self.insts[next].prev = node.prev;
        }
        if let Some(prev) = node.prev {
            self.insts[prev].next = node.next;
        }
        let block = self.block_node(node.block);
        if block.first_inst == Some(inst) {
            block.first_inst = node.next;
        }
        if block.last_inst == Some(inst) {
            block.last_inst = node.prev;
        }
    }

    /// Move all instructions of one block to the end of another.
    pub fn move_insts(&mut self, from: Block, to: Block) {
        let insts: Vec<_> = self.insts(from).collect();
        for inst in insts {
            self.remove_inst(inst);
            self.append_inst(inst, to);
        }
    }

    /// Check whether an instruction is placed in a block.
    pub fn is_inst_inserted(&self, inst: Inst) -> bool {
        self.insts.contains(inst)
    }

    /// The block an instruction is placed in.
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.insts.get(inst).map(|n| n.block)
    }

    /// Iterate over the instructions of a block in order.
    pub fn insts<'a>(&'a self, block: Block) -> impl Iterator<Item = Inst> + 'a {
        std::iter::successors(self.first_inst(block), move |&inst| self.next_inst(inst))
    }

    pub fn first_inst(&self, block: Block) -> Option<Inst> {
        self.blocks.get(block).and_then(|n| n.first_inst)
    }

    pub fn last_inst(&self, block: Block) -> Option<Inst> {
        self.blocks.get(block).and_then(|n| n.last_inst)
    }

    pub fn prev_inst(&self, inst: Inst) -> Option<Inst> {
        self.insts[inst].prev
    }

    pub fn next_inst(&self, inst: Inst) -> Option<Inst> {
        self.insts[inst].next
    }
}
