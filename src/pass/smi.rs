// Copyright (c) 2017-2020 Fabian Schuiki

//! Small Integer Propagation

use crate::{
    ir::prelude::*,
    opt::prelude::*,
    table::TableKey,
};
use hibitset::BitSet;

/// Small Integer Propagation
///
/// Proves values to be small integers. A walk of the dominator tree records
/// the values checked by a dominating `CheckSmi` and marks the uses of such
/// values in branches and phis. Phis all of whose inputs are small integers
/// then become small integers themselves, optimistically across loops.
pub struct SmiPropagation;

impl Pass for SmiPropagation {
    fn run_on_graph(_ctx: &PassContext, graph: &mut FlowGraph) -> bool {
        let mut prop = SmiPropagator::new(graph);
        prop.propagate_checks(graph);
        prop.process_phis(graph);
        debug!(
            "Propagated small integers in {} ({} changes)",
            graph.name, prop.changes
        );
        prop.changes > 0
    }
}

enum Step {
    Enter(Block),
    Leave(Block, usize),
}

struct SmiPropagator {
    known_smis: BitSet,
    rollback: Vec<Inst>,
    worklist: Vec<Inst>,
    in_worklist: BitSet,
    changes: usize,
}

impl SmiPropagator {
    fn new(graph: &FlowGraph) -> Self {
        let bound = graph.inst_id_bound() as u32;
        Self {
            known_smis: BitSet::with_capacity(bound),
            rollback: vec![],
            worklist: vec![],
            in_worklist: BitSet::with_capacity(bound),
            changes: 0,
        }
    }

    fn is_known(&self, def: Inst) -> bool {
        self.known_smis.contains(def.index() as u32)
    }

    fn add_to_worklist(&mut self, phi: Inst) {
        if !self.in_worklist.add(phi.index() as u32) {
            self.worklist.push(phi);
        }
    }

    fn mark_use(&mut self, graph: &mut FlowGraph, use_: Use) {
        if graph.reaching_cid(use_) != Some(ClassId::SMI) {
            graph.set_reaching_cid(use_, ClassId::SMI);
            self.changes += 1;
        }
    }

    /// Walk the dominator tree, tracking the values checked on the way down.
    fn propagate_checks(&mut self, graph: &mut FlowGraph) {
        let mut stack = vec![Step::Enter(graph.graph_entry())];
        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(bb) => {
                    let rollback_point = self.rollback.len();
                    self.visit_block(graph, bb);
                    stack.push(Step::Leave(bb, rollback_point));
                    for &child in graph[bb].dominated.iter().rev() {
                        stack.push(Step::Enter(child));
                    }
                }
                Step::Leave(bb, rollback_point) => {
                    self.visit_join_edge(graph, bb);
                    for def in self.rollback.drain(rollback_point..) {
                        self.known_smis.remove(def.index() as u32);
                    }
                }
            }
        }
    }

    fn visit_block(&mut self, graph: &mut FlowGraph, bb: Block) {
        for inst in graph.insts_vec(bb) {
            match graph.opcode(inst) {
                Opcode::CheckSmi => {
                    let value = graph.arg(inst, 0);
                    if !self.known_smis.add(value.index() as u32) {
                        self.rollback.push(value);
                    }
                }
                Opcode::Branch => {
                    for index in 0..graph.args(inst).len() {
                        if self.is_known(graph.arg(inst, index)) {
                            self.mark_use(graph, Use { user: inst, index });
                        }
                    }
                }
                _ => (),
            }
        }
    }

    /// Mark the phi inputs flowing along the goto at the end of a block.
    fn visit_join_edge(&mut self, graph: &mut FlowGraph, bb: Block) {
        let target = match graph.last_inst(bb).map(|last| graph.inst(last)) {
            Some(InstData::Goto { target }) => *target,
            _ => return,
        };
        let index = match graph.pred_index(target, bb) {
            Some(index) => index,
            None => return,
        };
        for phi in graph.phis(target).to_vec() {
            if self.is_known(graph.arg(phi, index)) && graph.cid(phi) != ClassId::SMI {
                self.mark_use(graph, Use { user: phi, index });
                self.add_to_worklist(phi);
            }
        }
    }

    /// Decide which phis are small integers.
    ///
    /// First every phi that could be a small integer is assumed to be one.
    /// Then phis with an input that is not a small integer are demoted, and
    /// the demotion spreads to the phis using them.
    fn process_phis(&mut self, graph: &mut FlowGraph) {
        let mut i = 0;
        while i < self.worklist.len() {
            let phi = self.worklist[i];
            i += 1;
            graph.set_cid(phi, ClassId::SMI);
            for use_ in graph.input_uses(phi).to_vec() {
                let user = use_.user;
                if graph.opcode(user) == Opcode::Phi
                    && graph.cid(user) != ClassId::SMI
                    && is_possibly_smi_phi(graph, user)
                {
                    self.add_to_worklist(user);
                }
            }
        }

        while let Some(phi) = self.worklist.pop() {
            self.in_worklist.remove(phi.index() as u32);
            if is_definitely_smi_phi(graph, phi) {
                continue;
            }
            graph.set_cid(phi, ClassId::DYNAMIC);
            for use_ in graph.input_uses(phi).to_vec() {
                let user = use_.user;
                if graph.opcode(user) == Opcode::Phi && graph.cid(user) == ClassId::SMI {
                    self.add_to_worklist(user);
                }
            }
        }

        for def in graph.definitions() {
            if graph.opcode(def) == Opcode::Phi && graph.cid(def) == ClassId::SMI {
                self.changes += 1;
                trace!("Phi {} is a small integer", def);
            }
        }
    }
}

fn is_definitely_smi_phi(graph: &FlowGraph, phi: Inst) -> bool {
    (0..graph.args(phi).len()).all(|index| graph.use_cid(phi, index) == ClassId::SMI)
}

fn is_possibly_smi_phi(graph: &FlowGraph, phi: Inst) -> bool {
    (0..graph.args(phi).len()).all(|index| match graph.use_cid(phi, index) {
        ClassId::SMI | ClassId::DYNAMIC | ClassId::ILLEGAL => true,
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::OptimizerConfig, ssa::compute_ssa};

    fn ctx() -> PassContext {
        PassContext::new(OptimizerConfig::default(), Default::default())
    }

    /// `i = x; [check x;] while (i < n) { i = i + 1 } return i;`
    fn loop_from_param(checked: bool) -> (FlowGraph, Block, Inst) {
        let mut graph = FlowGraph::new("f", 2, 1);
        let mut b = GraphBuilder::new(&mut graph);
        let header = b.join_block();
        let body = b.target_block();
        let exit = b.target_block();
        if checked {
            let x = b.load_local(0);
            b.build_inst(InstData::unary(Opcode::CheckSmi, x));
        }
        let x = b.load_local(0);
        b.store_local(2, x);
        b.goto(header);
        b.append_to(header);
        let i = b.load_local(2);
        let n = b.load_local(1);
        let mut cmp = Comparison::relational(Token::Lt, i, n, None);
        cmp.operands_cid = ClassId::SMI;
        let branch = b.branch(cmp, body, exit);
        b.append_to(body);
        let i = b.load_local(2);
        let one = b.smi(1);
        let next = b.build_inst(InstData::binary_smi_op(Token::Add, i, one));
        b.store_local(2, next);
        b.goto(header);
        b.append_to(exit);
        let i = b.load_local(2);
        b.return_value(i);
        compute_ssa(&mut graph).unwrap();
        (graph, header, branch)
    }

    #[test]
    fn checked_loop_phi_is_smi() {
        let _ = env_logger::try_init();
        let (mut graph, header, _) = loop_from_param(true);
        assert!(SmiPropagation::run_on_graph(&ctx(), &mut graph));
        let phi = graph.phis(header)[0];
        assert_eq!(graph.cid(phi), ClassId::SMI);
    }

    #[test]
    fn unchecked_loop_phi_is_not_smi() {
        let (mut graph, header, _) = loop_from_param(false);
        SmiPropagation::run_on_graph(&ctx(), &mut graph);
        let phi = graph.phis(header)[0];
        assert_ne!(graph.cid(phi), ClassId::SMI);
    }

    #[test]
    fn checked_value_reaches_branch() {
        let mut graph = FlowGraph::new("f", 1, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let then_bb = b.target_block();
        let else_bb = b.target_block();
        let x = b.load_local(0);
        b.build_inst(InstData::unary(Opcode::CheckSmi, x));
        let x = b.load_local(0);
        let zero = b.smi(0);
        let branch = b.branch(Comparison::strict(Token::EqStrict, x, zero), then_bb, else_bb);
        for &bb in &[then_bb, else_bb] {
            b.append_to(bb);
            let n = b.null();
            b.return_value(n);
        }
        compute_ssa(&mut graph).unwrap();
        assert!(SmiPropagation::run_on_graph(&ctx(), &mut graph));
        assert_eq!(graph.use_cid(branch, 0), ClassId::SMI);
        assert_eq!(graph.cid(graph.initial_definitions()[1]), ClassId::DYNAMIC);
    }
}
