// Copyright (c) 2017-2020 Fabian Schuiki

//! Loop-Invariant Code Motion

use crate::{
    analysis::{compute_loops, find_pre_header, loop_contains},
    ir::prelude::*,
    opt::prelude::*,
};
use hibitset::BitSetLike;

/// Loop-Invariant Code Motion
///
/// Moves instructions whose inputs are all defined outside a loop into the
/// loop's pre-header. Loops without a pre-header are left alone.
pub struct LoopInvariantCodeMotion;

impl Pass for LoopInvariantCodeMotion {
    fn run_on_graph(_ctx: &PassContext, graph: &mut FlowGraph) -> bool {
        let mut modified = false;
        for header in compute_loops(graph) {
            let pre_header = match find_pre_header(graph, header) {
                Some(bb) => bb,
                None => {
                    trace!("Skipping loop {} without pre-header", header);
                    continue;
                }
            };
            modified |= hoist_loop(graph, header, pre_header);
        }
        modified
    }
}

/// The blocks of the loop with the given header.
fn loop_blocks(graph: &FlowGraph, header: Block) -> Vec<Block> {
    match &graph[header].loop_info {
        Some(info) => info.iter().map(|n| graph.preorder()[n as usize]).collect(),
        None => vec![],
    }
}

fn hoist_loop(graph: &mut FlowGraph, header: Block, pre_header: Block) -> bool {
    let blocks = loop_blocks(graph, header);
    // Loads of mutable fields stay put if anything in the loop may write
    // memory.
    let has_side_effects = blocks
        .iter()
        .any(|&bb| graph.insts(bb).any(|inst| graph.inst(inst).has_side_effect()));

    let mut modified = false;
    for bb in blocks {
        for inst in graph.insts_vec(bb) {
            let data = graph.inst(inst);
            if data.opcode() == Opcode::PushArgument || data.is_type_assertion() {
                continue;
            }
            let movable = match data {
                InstData::LoadField {
                    immutable: false, ..
                } => !has_side_effects,
                _ => !data.affected_by_side_effect(),
            };
            if !movable {
                continue;
            }
            let invariant = data.args().iter().all(|&input| {
                graph
                    .inst_block(input)
                    .map(|def_bb| graph.dominates(def_bb, pre_header))
                    .unwrap_or(false)
            });
            if invariant {
                modified |= hoist(graph, inst, pre_header);
            } else if data.opcode() == Opcode::CheckSmi
                && graph.opcode(data.args()[0]) == Opcode::Phi
            {
                modified |= hoist_check_smi_through_phi(graph, inst, header, pre_header);
            }
        }
    }
    modified
}

/// Move an instruction in front of the pre-header's goto.
///
/// An instruction that may deoptimize resumes at the goto's deoptimization
/// point afterwards.
fn hoist(graph: &mut FlowGraph, inst: Inst, pre_header: Block) -> bool {
    let last = match graph.last_inst(pre_header) {
        Some(last) if graph.opcode(last) == Opcode::Goto => last,
        _ => return false,
    };
    let can_deoptimize = graph.inst(inst).can_deoptimize();
    if can_deoptimize && graph.env(last).is_none() {
        return false;
    }
    trace!(
        "Hoisting {} {} from {:?} to {}",
        graph.opcode(inst),
        inst,
        graph.inst_block(inst),
        pre_header
    );
    graph.move_inst_before(inst, last);
    if can_deoptimize {
        graph.copy_deopt_target(inst, last);
    }
    true
}

/// Hoist a small integer check of a loop phi whose only input that is not
/// known to be a small integer flows in from the pre-header.
///
/// The check then tests that input in the pre-header, and the phi becomes a
/// small integer.
fn hoist_check_smi_through_phi(
    graph: &mut FlowGraph,
    check: Inst,
    header: Block,
    pre_header: Block,
) -> bool {
    let phi = graph.arg(check, 0);
    let phi_block = match graph.inst_block(phi) {
        Some(bb) if loop_contains(graph, header, bb) => bb,
        _ => return false,
    };
    if graph.cid(phi) == ClassId::SMI {
        trace!("Removing {} of small integer phi {}", check, phi);
        graph.remove_inst(check);
        return true;
    }

    let mut non_smi_input = None;
    for index in 0..graph.args(phi).len() {
        match graph.use_cid(phi, index) {
            ClassId::SMI => continue,
            ClassId::DYNAMIC if non_smi_input.is_none() => non_smi_input = Some(index),
            _ => return false,
        }
    }
    let index = match non_smi_input {
        Some(index) if graph.preds(phi_block).get(index) == Some(&pre_header) => index,
        _ => return false,
    };
    if !hoist(graph, check, pre_header) {
        return false;
    }
    let input = graph.arg(phi, index);
    graph.set_arg(check, 0, input);
    graph.set_cid(phi, ClassId::SMI);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::OptimizerConfig, ssa::compute_ssa};

    fn ctx() -> PassContext {
        PassContext::new(OptimizerConfig::default(), Default::default())
    }

    /// Build `i = 0; while (i < 10) { body; i = i + 1 } return null;` with
    /// slot 1 as the counter. Returns the entry, header, and body blocks.
    fn counted_loop(
        params: usize,
        locals: usize,
        body: impl FnOnce(&mut GraphBuilder),
    ) -> (FlowGraph, [Block; 3]) {
        let mut graph = FlowGraph::new("loop", params, locals);
        let mut b = GraphBuilder::new(&mut graph);
        let entry = b.block();
        let header = b.join_block();
        let body_bb = b.target_block();
        let exit = b.target_block();
        let zero = b.smi(0);
        b.store_local(1, zero);
        b.goto(header);
        b.append_to(header);
        let i = b.load_local(1);
        let ten = b.smi(10);
        let mut cmp = Comparison::relational(Token::Lt, i, ten, None);
        cmp.operands_cid = ClassId::SMI;
        b.branch(cmp, body_bb, exit);
        b.append_to(body_bb);
        body(&mut b);
        let i = b.load_local(1);
        let one = b.smi(1);
        let next = b.build_inst(InstData::binary_smi_op(Token::Add, i, one));
        b.store_local(1, next);
        b.goto(header);
        b.append_to(exit);
        let n = b.null();
        b.return_value(n);
        compute_ssa(&mut graph).unwrap();
        (graph, [entry, header, body_bb])
    }

    fn field_load(graph: &FlowGraph, bb: Block) -> Option<Inst> {
        graph
            .insts(bb)
            .find(|&inst| graph.opcode(inst) == Opcode::LoadField)
    }

    #[test]
    fn invariant_load_is_hoisted() {
        let _ = env_logger::try_init();
        let (mut graph, [entry, _, body]) = counted_loop(1, 2, |b| {
            let obj = b.load_local(0);
            let v = b.load_field(obj, 16, false);
            b.store_local(2, v);
        });
        let load = field_load(&graph, body).unwrap();
        assert!(LoopInvariantCodeMotion::run_on_graph(&ctx(), &mut graph));
        assert_eq!(graph.inst_block(load), Some(entry));
        let goto = graph.last_inst(entry).unwrap();
        assert!(graph.inst_dominates(load, goto));
        assert!(field_load(&graph, body).is_none());
    }

    #[test]
    fn load_stays_in_loop_with_store() {
        let (mut graph, [_, _, body]) = counted_loop(1, 2, |b| {
            let obj = b.load_local(0);
            let v = b.load_field(obj, 16, false);
            b.store_local(2, v);
            let obj = b.load_local(0);
            let c = b.smi(3);
            b.store_field(obj, 24, c);
        });
        let load = field_load(&graph, body).unwrap();
        LoopInvariantCodeMotion::run_on_graph(&ctx(), &mut graph);
        assert_eq!(graph.inst_block(load), Some(body));
    }

    #[test]
    fn check_smi_moves_to_pre_header() {
        let _ = env_logger::try_init();
        let mut check = None;
        let (mut graph, [entry, header, body]) = counted_loop(1, 1, |b| {
            let i = b.load_local(1);
            check = Some(b.build_inst(InstData::unary(Opcode::CheckSmi, i)));
        });
        let check = check.unwrap();
        // Start the counter at the parameter instead of zero.
        let param = graph.initial_definitions()[1];
        let phi = graph.phis(header)[0];
        let entry_index = graph.pred_index(header, entry).unwrap();
        graph.set_arg(phi, entry_index, param);
        assert_eq!(graph.inst_block(check), Some(body));

        assert!(LoopInvariantCodeMotion::run_on_graph(&ctx(), &mut graph));
        assert_eq!(graph.inst_block(check), Some(entry));
        assert_eq!(graph.arg(check, 0), param);
        assert_eq!(graph.cid(phi), ClassId::SMI);
        assert!(graph.env(check).is_some());
    }
}
