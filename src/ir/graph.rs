// Copyright (c) 2017-2019 Fabian Schuiki

//! The flow graph of a method.

use crate::{
    impl_table_indexing,
    ir::{
        layout::InstLayout, Block, ClassId, Constant, DeoptId, Environment, Inst, InstData,
        Opcode, Range, Representation,
    },
    table::{PrimaryTable, TableKey},
};
use hibitset::BitSet;
use std::collections::HashMap;

/// A use edge: input `index` of instruction `user`.
///
/// The same type is used for environment uses, in which case `index` is the
/// position within the environment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Use {
    pub user: Inst,
    pub index: usize,
}

/// The kind of a basic block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockKind {
    /// The unique entry of the graph. Holds the initial definitions and has
    /// the normal entry and any catch entries as successors.
    GraphEntry,
    /// A block with exactly one predecessor, targeted by a branch.
    Target,
    /// A block with any number of predecessors, reached by gotos. Only join
    /// blocks carry phis.
    Join,
}

/// A basic block.
#[derive(Clone, Debug)]
pub struct BlockData {
    pub kind: BlockKind,
    pub(crate) preds: Vec<Block>,
    pub(crate) phis: Vec<Inst>,
    pub preorder_number: Option<usize>,
    pub postorder_number: Option<usize>,
    /// The immediate dominator.
    pub dominator: Option<Block>,
    /// The blocks immediately dominated by this one.
    pub dominated: Vec<Block>,
    /// The preorder numbers of the blocks in the loop, if this block is a
    /// loop header.
    pub loop_info: Option<BitSet>,
}

impl BlockData {
    fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            preds: vec![],
            phis: vec![],
            preorder_number: None,
            postorder_number: None,
            dominator: None,
            dominated: vec![],
            loop_info: None,
        }
    }

    pub fn is_join(&self) -> bool {
        self.kind == BlockKind::Join
    }
}

/// An instruction together with its place in the graph.
#[derive(Clone, Debug)]
pub struct InstNode {
    pub data: InstData,
    pub(crate) block: Option<Block>,
    pub(crate) ssa_index: Option<u32>,
    pub(crate) env: Option<Environment>,
    pub deopt_id: Option<DeoptId>,
    pub(crate) input_uses: Vec<Use>,
    pub(crate) env_uses: Vec<Use>,
    pub(crate) cid: Option<ClassId>,
    pub range: Option<Range>,
    /// The value a redundant load was replaced with.
    pub replacement: Option<Inst>,
    /// Whether the unoptimized code consumes the value from the expression
    /// stack. Only meaningful before SSA construction.
    pub is_used: bool,
}

impl InstNode {
    fn new(data: InstData) -> Self {
        Self {
            data,
            block: None,
            ssa_index: None,
            env: None,
            deopt_id: None,
            input_uses: vec![],
            env_uses: vec![],
            cid: None,
            range: None,
            replacement: None,
            is_used: false,
        }
    }
}

/// Index allocators of one compilation.
///
/// Every method being compiled owns its own counters, so methods can be
/// optimized on different threads.
#[derive(Copy, Clone, Debug, Default)]
pub struct CompilationCounters {
    pub next_ssa_index: u32,
    pub next_deopt_id: DeoptId,
}

/// The flow graph of a single method.
#[derive(Clone)]
pub struct FlowGraph {
    /// The name of the method.
    pub name: String,
    /// The number of fixed parameters, which occupy the first local slots.
    pub parameter_count: usize,
    /// The number of local variables in addition to the parameters.
    pub local_count: usize,
    /// The class this method is an instance method of, if any.
    pub owner: Option<ClassId>,
    pub counters: CompilationCounters,
    pub(crate) blocks: PrimaryTable<Block, BlockData>,
    pub(crate) insts: PrimaryTable<Inst, InstNode>,
    layout: InstLayout,
    graph_entry: Block,
    normal_entry: Block,
    catch_entries: Vec<Block>,
    initial_definitions: Vec<Inst>,
    reaching_cids: HashMap<Use, ClassId>,
    pub(crate) preorder: Vec<Block>,
    pub(crate) postorder: Vec<Block>,
    pub(crate) reverse_postorder: Vec<Block>,
    pub(crate) parent: Vec<Option<usize>>,
    pub(crate) assigned_vars: Vec<BitSet>,
}

impl_table_indexing!(FlowGraph, blocks, Block, BlockData);
impl_table_indexing!(FlowGraph, insts, Inst, InstNode);

impl FlowGraph {
    /// Create an empty graph with a graph entry and a normal entry block.
    pub fn new(name: impl Into<String>, parameter_count: usize, local_count: usize) -> Self {
        let mut blocks = PrimaryTable::new();
        let graph_entry = blocks.add(BlockData::new(BlockKind::GraphEntry));
        let normal_entry = blocks.add(BlockData::new(BlockKind::Target));
        Self {
            name: name.into(),
            parameter_count,
            local_count,
            owner: None,
            counters: Default::default(),
            blocks,
            insts: PrimaryTable::new(),
            layout: Default::default(),
            graph_entry,
            normal_entry,
            catch_entries: vec![],
            initial_definitions: vec![],
            reaching_cids: HashMap::new(),
            preorder: vec![],
            postorder: vec![],
            reverse_postorder: vec![],
            parent: vec![],
            assigned_vars: vec![],
        }
    }

    /// The number of local variable slots, parameters included.
    pub fn variable_count(&self) -> usize {
        self.parameter_count + self.local_count
    }

    pub fn graph_entry(&self) -> Block {
        self.graph_entry
    }

    pub fn normal_entry(&self) -> Block {
        self.normal_entry
    }

    pub fn catch_entries(&self) -> &[Block] {
        &self.catch_entries
    }

    /// Register an additional entry reached from the graph entry when an
    /// exception is caught.
    pub fn add_catch_entry(&mut self) -> Block {
        let bb = self.add_block(BlockKind::Target);
        self.catch_entries.push(bb);
        bb
    }

    /// Create a new, empty block.
    pub fn add_block(&mut self, kind: BlockKind) -> Block {
        self.blocks.add(BlockData::new(kind))
    }

    /// An upper bound on block indices.
    pub fn block_id_bound(&self) -> usize {
        self.blocks.capacity()
    }

    /// An upper bound on instruction indices.
    pub fn inst_id_bound(&self) -> usize {
        self.insts.capacity()
    }

    /// The kind of a block.
    pub fn block_kind(&self, bb: Block) -> BlockKind {
        self[bb].kind
    }

    pub fn is_join(&self, bb: Block) -> bool {
        self[bb].kind == BlockKind::Join
    }

    /// The predecessors of a block, as of the last block discovery.
    ///
    /// Join predecessors are sorted by block index; phi inputs follow the
    /// same order.
    pub fn preds(&self, bb: Block) -> &[Block] {
        &self[bb].preds
    }

    /// The position of a predecessor in a join's predecessor list.
    pub fn pred_index(&self, bb: Block, pred: Block) -> Option<usize> {
        self[bb].preds.iter().position(|&p| p == pred)
    }

    /// The successors of a block.
    pub fn succs(&self, bb: Block) -> Vec<Block> {
        if bb == self.graph_entry {
            let mut succs = vec![self.normal_entry];
            succs.extend(self.catch_entries.iter().cloned());
            return succs;
        }
        match self.last_inst(bb) {
            Some(last) => self[last].data.blocks().to_vec(),
            None => vec![],
        }
    }

    /// Record a predecessor edge, keeping join predecessors sorted.
    pub(crate) fn add_pred(&mut self, bb: Block, pred: Block) {
        let preds = &mut self.blocks[bb].preds;
        let index = preds
            .iter()
            .position(|p| p.index() > pred.index())
            .unwrap_or(preds.len());
        preds.insert(index, pred);
    }

    /// The blocks in preorder, as of the last block discovery.
    pub fn preorder(&self) -> &[Block] {
        &self.preorder
    }

    /// The blocks in postorder, as of the last block discovery.
    pub fn postorder(&self) -> &[Block] {
        &self.postorder
    }

    /// The blocks in reverse postorder, as of the last block discovery.
    pub fn reverse_postorder(&self) -> &[Block] {
        &self.reverse_postorder
    }

    /// The local variable slots assigned in a block, indexed by preorder
    /// number.
    pub fn assigned_vars(&self) -> &[BitSet] {
        &self.assigned_vars
    }

    /// Check whether block `a` dominates block `b`.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        let mut current = Some(b);
        while let Some(bb) = current {
            if bb == a {
                return true;
            }
            current = self[bb].dominator;
        }
        false
    }

    /// The loop headers of the graph in reverse postorder.
    pub fn loop_headers(&self) -> Vec<Block> {
        self.reverse_postorder
            .iter()
            .cloned()
            .filter(|&bb| self[bb].loop_info.is_some())
            .collect()
    }

    /// The phis of a join block.
    pub fn phis(&self, bb: Block) -> &[Inst] {
        &self[bb].phis
    }

    /// Create a phi with empty inputs for a local variable slot.
    pub fn add_phi(&mut self, bb: Block, slot: Option<usize>, input_count: usize) -> Inst {
        let phi = self.insts.add(InstNode::new(InstData::Phi {
            slot,
            args: vec![Inst::invalid(); input_count],
            alive: false,
            representation: Representation::Tagged,
        }));
        self.insts[phi].block = Some(bb);
        self.blocks[bb].phis.push(phi);
        phi
    }

    /// Make a phi created with `add_phi` live in its block, registering its
    /// input uses.
    pub fn insert_phi(&mut self, phi: Inst) {
        if let InstData::Phi { alive, .. } = &mut self.insts[phi].data {
            *alive = true;
        }
        self.add_input_uses(phi);
    }

    /// Remove a phi from its block.
    pub fn remove_phi(&mut self, phi: Inst) {
        if let Some(bb) = self.insts[phi].block {
            self.blocks[bb].phis.retain(|&p| p != phi);
        }
        self.remove_input_uses(phi);
        self.remove_env_uses(phi);
        self.insts[phi].block = None;
    }

    /// Check whether a phi has been marked live.
    pub fn is_phi_alive(&self, phi: Inst) -> bool {
        match self[phi].data {
            InstData::Phi { alive, .. } => alive,
            _ => false,
        }
    }

    /// Mark a phi as live.
    pub fn mark_phi_alive(&mut self, phi: Inst) {
        if let InstData::Phi { alive, .. } = &mut self.insts[phi].data {
            *alive = true;
        }
    }

    /// The definitions available on entry to the graph.
    pub fn initial_definitions(&self) -> &[Inst] {
        &self.initial_definitions
    }

    /// Add a constant or parameter to the initial definitions.
    pub fn add_initial_definition(&mut self, data: InstData) -> Inst {
        let inst = self.insts.add(InstNode::new(data));
        self.insts[inst].block = Some(self.graph_entry);
        self.initial_definitions.push(inst);
        inst
    }

    /// Find or create an initial constant definition.
    pub fn get_constant(&mut self, value: Constant) -> Inst {
        let existing = self.initial_definitions.iter().cloned().find(|&def| {
            self[def].data.constant() == Some(&value)
        });
        match existing {
            Some(def) => def,
            None => {
                let def = self.add_initial_definition(InstData::Constant { value });
                self.alloc_ssa_index(def);
                def
            }
        }
    }

    /// The null constant.
    pub fn constant_null(&mut self) -> Inst {
        self.get_constant(Constant::Null)
    }

    /// Create a new instruction that is not placed in any block yet.
    pub fn add_inst(&mut self, data: InstData) -> Inst {
        self.insts.add(InstNode::new(data))
    }

    /// Place an instruction at the end of a block without touching use lists.
    pub(crate) fn link_inst(&mut self, bb: Block, inst: Inst) {
        self.layout.append_inst(inst, bb);
        self.insts[inst].block = Some(bb);
    }

    pub(crate) fn link_inst_after(&mut self, after: Inst, inst: Inst) {
        self.layout.insert_inst_after(inst, after);
        self.insts[inst].block = self.insts[after].block;
    }

    /// Append an instruction to a block.
    pub fn append_inst(&mut self, bb: Block, inst: Inst) {
        self.link_inst(bb, inst);
        self.add_input_uses(inst);
        self.add_env_uses(inst);
    }

    /// Insert an instruction before another one.
    pub fn insert_before(&mut self, before: Inst, inst: Inst) {
        self.layout.insert_inst_before(inst, before);
        self.insts[inst].block = self.insts[before].block;
        self.add_input_uses(inst);
        self.add_env_uses(inst);
    }

    /// Insert an instruction after another one.
    pub fn insert_after(&mut self, after: Inst, inst: Inst) {
        self.layout.insert_inst_after(inst, after);
        self.insts[inst].block = self.insts[after].block;
        self.add_input_uses(inst);
        self.add_env_uses(inst);
    }

    /// Insert an instruction at the start of a block.
    pub fn prepend_inst(&mut self, bb: Block, inst: Inst) {
        self.layout.prepend_inst(inst, bb);
        self.insts[inst].block = Some(bb);
        self.add_input_uses(inst);
        self.add_env_uses(inst);
    }

    /// Remove an instruction from its block.
    ///
    /// The instruction must not have any uses left.
    pub fn remove_inst(&mut self, inst: Inst) {
        debug_assert!(
            !self.has_uses(inst),
            "{} removed while still in use by {:?}",
            inst,
            self[inst].input_uses
        );
        self.remove_input_uses(inst);
        self.remove_env_uses(inst);
        self.layout.remove_inst(inst);
        self.insts[inst].block = None;
    }

    /// Move an instruction in front of another one, keeping its uses.
    pub fn move_inst_before(&mut self, inst: Inst, before: Inst) {
        self.layout.remove_inst(inst);
        self.layout.insert_inst_before(inst, before);
        self.insts[inst].block = self.insts[before].block;
    }

    /// Check whether instruction `a` dominates instruction `b`.
    ///
    /// Initial definitions dominate everything; a phi dominates everything
    /// its block dominates.
    pub fn inst_dominates(&self, a: Inst, b: Inst) -> bool {
        let (bb_a, bb_b) = match (self[a].block, self[b].block) {
            (Some(x), Some(y)) => (x, y),
            _ => return false,
        };
        if bb_a == self.graph_entry || self[a].data.opcode() == Opcode::Phi {
            return a != b && self.dominates(bb_a, bb_b);
        }
        if bb_a != bb_b {
            return self.dominates(bb_a, bb_b);
        }
        if self[b].data.opcode() == Opcode::Phi {
            return false;
        }
        let mut current = self.next_inst(a);
        while let Some(inst) = current {
            if inst == b {
                return true;
            }
            current = self.next_inst(inst);
        }
        false
    }

    /// Move the instructions of one block to the end of another.
    pub fn move_insts(&mut self, from: Block, to: Block) {
        let insts: Vec<_> = self.layout.insts(from).collect();
        self.layout.move_insts(from, to);
        for inst in insts {
            self.insts[inst].block = Some(to);
        }
    }

    /// Check whether an instruction is currently placed in a block list.
    pub fn is_inst_inserted(&self, inst: Inst) -> bool {
        self.layout.is_inst_inserted(inst)
    }

    /// The block an instruction, phi, or initial definition belongs to.
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self[inst].block
    }

    /// Iterate over the instructions of a block.
    pub fn insts<'a>(&'a self, bb: Block) -> impl Iterator<Item = Inst> + 'a {
        self.layout.insts(bb)
    }

    /// Collect the instructions of a block, for passes that mutate the block
    /// while walking it.
    pub fn insts_vec(&self, bb: Block) -> Vec<Inst> {
        self.layout.insts(bb).collect()
    }

    pub fn first_inst(&self, bb: Block) -> Option<Inst> {
        self.layout.first_inst(bb)
    }

    pub fn last_inst(&self, bb: Block) -> Option<Inst> {
        self.layout.last_inst(bb)
    }

    pub fn prev_inst(&self, inst: Inst) -> Option<Inst> {
        self.layout.prev_inst(inst)
    }

    pub fn next_inst(&self, inst: Inst) -> Option<Inst> {
        self.layout.next_inst(inst)
    }

    /// The instruction data.
    pub fn inst(&self, inst: Inst) -> &InstData {
        &self[inst].data
    }

    /// The opcode of an instruction.
    pub fn opcode(&self, inst: Inst) -> Opcode {
        self[inst].data.opcode()
    }

    /// The value inputs of an instruction.
    pub fn args(&self, inst: Inst) -> &[Inst] {
        self[inst].data.args()
    }

    /// One value input of an instruction.
    pub fn arg(&self, inst: Inst, index: usize) -> Inst {
        self[inst].data.args()[index]
    }

    /// The constant a definition evaluates to, if it is a constant.
    pub fn constant_of(&self, def: Inst) -> Option<&Constant> {
        self[def].data.constant()
    }

    /// The small integer a definition evaluates to, if it is one.
    pub fn smi_constant_of(&self, def: Inst) -> Option<i64> {
        self.constant_of(def).and_then(Constant::as_smi)
    }

    /// Retarget input `index` of `user` to another definition.
    pub fn set_arg(&mut self, user: Inst, index: usize, def: Inst) {
        let use_ = Use { user, index };
        let old = self.insts[user].data.args()[index];
        if let Some(node) = self.insts.get_mut(old) {
            node.input_uses.retain(|&u| u != use_);
        }
        self.insts[user].data.args_mut()[index] = def;
        self.reaching_cids.remove(&use_);
        if let Some(node) = self.insts.get_mut(def) {
            node.input_uses.push(use_);
        }
    }

    /// Retarget input `index` of `user` without maintaining use lists.
    ///
    /// Used while the use lists are not yet built.
    pub(crate) fn set_arg_raw(&mut self, user: Inst, index: usize, def: Inst) {
        self.insts[user].data.args_mut()[index] = def;
    }

    /// The input uses of a definition.
    pub fn input_uses(&self, def: Inst) -> &[Use] {
        &self[def].input_uses
    }

    /// The environment uses of a definition.
    pub fn env_uses(&self, def: Inst) -> &[Use] {
        &self[def].env_uses
    }

    /// Check whether any instruction or environment refers to a definition.
    pub fn has_uses(&self, def: Inst) -> bool {
        !self[def].input_uses.is_empty() || !self[def].env_uses.is_empty()
    }

    /// Check whether any instruction refers to a definition.
    pub fn has_input_uses(&self, def: Inst) -> bool {
        !self[def].input_uses.is_empty()
    }

    /// Redirect every use of `old` to `new`.
    pub fn replace_uses_with(&mut self, old: Inst, new: Inst) {
        if old == new {
            return;
        }
        let input_uses = std::mem::replace(&mut self.insts[old].input_uses, vec![]);
        for &use_ in &input_uses {
            self.insts[use_.user].data.args_mut()[use_.index] = new;
            self.reaching_cids.remove(&use_);
        }
        self.insts[new].input_uses.extend(input_uses);
        let env_uses = std::mem::replace(&mut self.insts[old].env_uses, vec![]);
        for &use_ in &env_uses {
            if let Some(env) = self.insts[use_.user].env.as_mut() {
                env.set_value_at(use_.index, new);
            }
        }
        self.insts[new].env_uses.extend(env_uses);
    }

    /// Replace an instruction by another one that is not yet placed.
    ///
    /// The replacement takes the place of the original in its block, inherits
    /// its deoptimization target, and takes over all its uses. If the original
    /// had an SSA index, the replacement gets one as well.
    pub fn replace_inst(&mut self, old: Inst, new: Inst) {
        self.copy_deopt_target(new, old);
        self.insert_before(old, new);
        self.ensure_ssa_index(new, old);
        self.replace_uses_with(old, new);
        self.remove_inst(old);
    }

    /// Replace a definition by an existing one, removing it from the graph.
    pub fn replace_with_existing(&mut self, old: Inst, existing: Inst) {
        self.replace_uses_with(old, existing);
        self.remove_inst(old);
    }

    /// The deoptimization environment of an instruction.
    pub fn env(&self, inst: Inst) -> Option<&Environment> {
        self[inst].env.as_ref()
    }

    /// Attach a deoptimization environment, updating environment uses.
    pub fn set_env(&mut self, inst: Inst, env: Option<Environment>) {
        self.remove_env_uses(inst);
        self.insts[inst].env = env;
        if self[inst].block.is_some() {
            self.add_env_uses(inst);
        }
    }

    /// Copy the deopt id and environment of `from` onto `to`.
    pub fn copy_deopt_target(&mut self, to: Inst, from: Inst) {
        self.insts[to].deopt_id = self[from].deopt_id;
        let env = self[from].env.clone();
        self.set_env(to, env);
    }

    /// Allocate a fresh deopt id.
    pub fn alloc_deopt_id(&mut self) -> DeoptId {
        let id = self.counters.next_deopt_id;
        self.counters.next_deopt_id += 1;
        id
    }

    /// The SSA index of a definition, if it has one.
    pub fn ssa_index(&self, def: Inst) -> Option<u32> {
        self[def].ssa_index
    }

    /// Assign a fresh SSA index to a definition.
    pub fn alloc_ssa_index(&mut self, def: Inst) -> u32 {
        let index = self.counters.next_ssa_index;
        self.counters.next_ssa_index += 1;
        self.insts[def].ssa_index = Some(index);
        index
    }

    /// Give `replacement` an SSA index if `original` had one.
    pub fn ensure_ssa_index(&mut self, replacement: Inst, original: Inst) {
        if self[replacement].ssa_index.is_none()
            && self[original].ssa_index.is_some()
            && self[replacement].data.is_definition()
        {
            self.alloc_ssa_index(replacement);
        }
    }

    /// The propagated class of a definition.
    pub fn cid(&self, def: Inst) -> ClassId {
        let node = &self[def];
        match node.cid {
            Some(cid) => cid,
            None => match node.data.opcode() {
                Opcode::Phi => ClassId::ILLEGAL,
                Opcode::Parameter | Opcode::AssertAssignable => ClassId::DYNAMIC,
                _ => node.data.result_cid(),
            },
        }
    }

    /// Update the propagated class of a definition.
    ///
    /// Returns whether the class changed.
    pub fn set_cid(&mut self, def: Inst, cid: ClassId) -> bool {
        let changed = self.cid(def) != cid;
        self.insts[def].cid = Some(cid);
        changed
    }

    /// The class known to reach a specific use, if narrower than the class of
    /// the definition.
    pub fn reaching_cid(&self, use_: Use) -> Option<ClassId> {
        self.reaching_cids.get(&use_).cloned()
    }

    /// Record the class known to reach a specific use.
    pub fn set_reaching_cid(&mut self, use_: Use, cid: ClassId) {
        self.reaching_cids.insert(use_, cid);
    }

    /// The class of the value flowing into input `index` of `user`.
    pub fn use_cid(&self, user: Inst, index: usize) -> ClassId {
        match self.reaching_cid(Use { user, index }) {
            Some(cid) => cid,
            None => self.cid(self.arg(user, index)),
        }
    }

    fn add_input_uses(&mut self, inst: Inst) {
        let args = self.insts[inst].data.args().to_vec();
        for (index, def) in args.into_iter().enumerate() {
            if let Some(node) = self.insts.get_mut(def) {
                node.input_uses.push(Use { user: inst, index });
            }
        }
    }

    fn remove_input_uses(&mut self, inst: Inst) {
        let args = self.insts[inst].data.args().to_vec();
        for (index, def) in args.into_iter().enumerate() {
            let use_ = Use { user: inst, index };
            if let Some(node) = self.insts.get_mut(def) {
                node.input_uses.retain(|&u| u != use_);
            }
        }
    }

    fn add_env_uses(&mut self, inst: Inst) {
        let values: Vec<Inst> = match self.insts[inst].env.as_ref() {
            Some(env) => env.values().collect(),
            None => return,
        };
        for (index, def) in values.into_iter().enumerate() {
            if let Some(node) = self.insts.get_mut(def) {
                node.env_uses.push(Use { user: inst, index });
            }
        }
    }

    fn remove_env_uses(&mut self, inst: Inst) {
        let values: Vec<Inst> = match self.insts[inst].env.as_ref() {
            Some(env) => env.values().collect(),
            None => return,
        };
        for (index, def) in values.into_iter().enumerate() {
            let use_ = Use { user: inst, index };
            if let Some(node) = self.insts.get_mut(def) {
                node.env_uses.retain(|&u| u != use_);
            }
        }
    }

    /// Rebuild every use list from scratch.
    ///
    /// Walks the blocks in preorder; phis register the uses of their inputs,
    /// which flow in along the predecessor edges.
    pub fn compute_use_lists(&mut self) {
        for node in self.insts.values_mut() {
            node.input_uses.clear();
            node.env_uses.clear();
        }
        let blocks = self.preorder.clone();
        for bb in blocks {
            let phis = self[bb].phis.clone();
            for phi in phis {
                if self.is_phi_alive(phi) {
                    self.add_input_uses(phi);
                }
            }
            let insts = self.insts_vec(bb);
            for inst in insts {
                self.add_input_uses(inst);
                self.add_env_uses(inst);
            }
        }
    }

    /// Iterate over all definitions reachable in the current block order:
    /// initial definitions, live phis, and block instructions.
    pub fn definitions(&self) -> Vec<Inst> {
        let mut defs = self.initial_definitions.clone();
        for &bb in &self.reverse_postorder {
            defs.extend(self[bb].phis.iter().cloned().filter(|&p| self.is_phi_alive(p)));
            defs.extend(self.insts(bb).filter(|&i| self[i].data.is_definition()));
        }
        defs
    }
}
