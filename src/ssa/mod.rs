// Copyright (c) 2017-2020 Fabian Schuiki

//! Construction of SSA form.
//!
//! The unoptimized graph accesses local variables through `LoadLocal` and
//! `StoreLocal` instructions and passes values between instructions on an
//! implicit expression stack. This module places phis at the iterated
//! dominance frontier of every variable's stores, renames every use to its
//! reaching definition, and removes the local accesses.

use crate::{
    analysis::{compute_dominators, discover_blocks},
    error::{Bailout, Result},
    ir::{Block, BlockKind, FlowGraph, Inst, InstData, Opcode},
};
use hibitset::{BitSet, BitSetLike};
use imbl::Vector;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

/// Convert the unoptimized graph of a method into SSA form.
///
/// On success the blocks are ordered, the dominator tree is computed, every
/// used definition carries an SSA index, only live phis remain, and the use
/// lists are built.
pub fn compute_ssa(graph: &mut FlowGraph) -> Result<()> {
    let t0 = time::precise_time_ns();
    if !graph.catch_entries().is_empty() {
        return Err(Bailout::CatchEntry);
    }
    discover_blocks(graph);
    check_edge_split_form(graph)?;
    let frontier = compute_dominators(graph);
    insert_phis(graph, &frontier)?;
    let live_phis = rename(graph)?;
    mark_live_phis(graph, live_phis);
    graph.compute_use_lists();
    remove_dead_phis(graph);
    let t1 = time::precise_time_ns();
    SSA_TIME.fetch_add(t1 - t0, Ordering::Relaxed);
    debug!(
        "Built SSA for {} with {} definitions",
        graph.name, graph.counters.next_ssa_index
    );
    Ok(())
}

/// Make sure every block ends in a terminator, branches only target blocks
/// with a single predecessor, and gotos only target join blocks.
fn check_edge_split_form(graph: &FlowGraph) -> Result<()> {
    for &bb in graph.preorder() {
        if bb == graph.graph_entry() {
            continue;
        }
        let last = match graph.last_inst(bb) {
            Some(inst) if graph.inst(inst).is_terminator() => inst,
            _ => {
                return Err(Bailout::MalformedGraph(format!(
                    "{} does not end in a terminator",
                    bb
                )))
            }
        };
        let expected = match graph.opcode(last) {
            Opcode::Branch => BlockKind::Target,
            _ => BlockKind::Join,
        };
        for &succ in graph.inst(last).blocks() {
            if graph.block_kind(succ) != expected {
                return Err(Bailout::MalformedGraph(format!(
                    "edge {} -> {} is not split",
                    bb, succ
                )));
            }
        }
    }
    Ok(())
}

/// Place phis at the iterated dominance frontier of each variable's stores.
///
/// Phis are created dead and without inputs. `has_already` and `work` hold,
/// per block, the highest variable index for which the block received a phi
/// or went onto the worklist, respectively.
fn insert_phis(graph: &mut FlowGraph, frontier: &[BitSet]) -> Result<()> {
    let block_count = graph.preorder().len();
    let mut has_already = vec![-1isize; block_count];
    let mut work = vec![-1isize; block_count];
    let mut worklist = vec![];
    for var_index in 0..graph.variable_count() {
        let var = var_index as isize;
        for block_index in 0..block_count {
            if graph.assigned_vars()[block_index].contains(var_index as u32) {
                work[block_index] = var;
                worklist.push(block_index);
            }
        }
        while let Some(current) = worklist.pop() {
            for index in (&frontier[current]).iter() {
                let index = index as usize;
                if has_already[index] >= var {
                    continue;
                }
                let bb = graph.preorder()[index];
                if !graph.is_join(bb) {
                    return Err(Bailout::MalformedGraph(format!(
                        "{} has multiple predecessors but is not a join",
                        bb
                    )));
                }
                let input_count = graph.preds(bb).len();
                graph.add_phi(bb, Some(var_index), input_count);
                has_already[index] = var;
                if work[index] < var {
                    work[index] = var;
                    worklist.push(index);
                }
            }
        }
    }
    Ok(())
}

/// Rename every use to its reaching definition.
///
/// Walks the dominator tree with an explicit stack. Each block is entered
/// with its own snapshot of the renaming environment: one slot per local
/// variable followed by the expression stack. Returns the phis that reach a
/// load of a local.
///
/// Every input must be the entry on top of the expression stack. Inputs that
/// are loads or stores of locals are looked up in `resolved`, which maps each
/// renamed local access to the value it produced.
fn rename(graph: &mut FlowGraph) -> Result<Vec<Inst>> {
    let null = graph.constant_null();
    let mut env = Vector::new();
    for index in 0..graph.parameter_count {
        let param = graph.add_initial_definition(InstData::Parameter { index });
        graph.alloc_ssa_index(param);
        env.push_back(param);
    }
    for _ in graph.parameter_count..graph.variable_count() {
        env.push_back(null);
    }

    let mut live_phis = vec![];
    let mut resolved = HashMap::new();
    let mut stack = vec![(graph.normal_entry(), env)];
    while let Some((bb, mut env)) = stack.pop() {
        rename_block(graph, bb, &mut env, &mut resolved, &mut live_phis)?;

        // Edge-split form guarantees that only a block ending in a goto has
        // a join successor.
        if let Some(last) = graph.last_inst(bb) {
            if let InstData::Goto { target } = *graph.inst(last) {
                let pred_index = match graph.pred_index(target, bb) {
                    Some(i) => i,
                    None => {
                        return Err(Bailout::MalformedGraph(format!(
                            "{} is not a predecessor of {}",
                            bb, target
                        )))
                    }
                };
                for phi in graph.phis(target).to_vec() {
                    let slot = phi_slot(graph, phi);
                    graph.set_arg_raw(phi, pred_index, env[slot]);
                }
            }
        }

        for &child in graph[bb].dominated.iter().rev() {
            stack.push((child, env.clone()));
        }
    }
    Ok(live_phis)
}

fn phi_slot(graph: &FlowGraph, phi: Inst) -> usize {
    match *graph.inst(phi) {
        InstData::Phi { slot: Some(slot), .. } => slot,
        _ => unreachable!("{} is not a variable phi", phi),
    }
}

fn rename_block(
    graph: &mut FlowGraph,
    bb: Block,
    env: &mut Vector<Inst>,
    resolved: &mut HashMap<Inst, Inst>,
    live_phis: &mut Vec<Inst>,
) -> Result<()> {
    let variable_count = graph.variable_count();

    for phi in graph.phis(bb).to_vec() {
        let slot = phi_slot(graph, phi);
        env.set(slot, phi);
        graph.alloc_ssa_index(phi);
    }

    for inst in graph.insts_vec(bb) {
        let needs_env = {
            let data = graph.inst(inst);
            data.can_deoptimize() || data.opcode() == Opcode::Goto
        };
        if needs_env {
            graph[inst].env = Some(crate::ir::Environment::new(
                env.clone(),
                graph.parameter_count,
            ));
        }

        // Pop the inputs off the expression stack. Loads and stores of
        // locals are replaced by the value they produce.
        let input_count = graph.args(inst).len();
        for index in (0..input_count).rev() {
            let reaching = pop_stack(env, variable_count, bb)?;
            let input = graph.arg(inst, index);
            let is_local = matches!(graph.opcode(input), Opcode::LoadLocal | Opcode::StoreLocal);
            let expected = if is_local {
                resolved.get(&input).cloned()
            } else {
                Some(input)
            };
            if expected != Some(reaching) {
                return Err(Bailout::MalformedGraph(format!(
                    "input {} of {} is {} but the expression stack holds {}",
                    index, inst, input, reaching
                )));
            }
            if is_local {
                if graph.is_inst_inserted(input) {
                    graph.remove_inst(input);
                }
                graph.set_arg_raw(inst, index, reaching);
            }
        }
        let arguments = graph.inst(inst).arguments().to_vec();
        for &argument in arguments.iter().rev() {
            let reaching = pop_stack(env, variable_count, bb)?;
            if reaching != argument {
                return Err(Bailout::MalformedGraph(format!(
                    "{} expects argument {} but the expression stack holds {}",
                    inst, argument, reaching
                )));
            }
        }

        // A branch that cannot deoptimize still marks the point at which the
        // block is left.
        if graph.opcode(inst) == Opcode::Branch && graph[inst].env.is_none() {
            graph[inst].env = Some(crate::ir::Environment::new(
                env.clone(),
                graph.parameter_count,
            ));
        }

        let is_used = graph[inst].is_used;
        let is_definition = graph.inst(inst).is_definition();
        let local = match *graph.inst(inst) {
            InstData::StoreLocal { slot, args } => Some((slot, Some(args[0]))),
            InstData::LoadLocal { slot } => Some((slot, None)),
            _ => None,
        };
        match local {
            Some((slot, _)) if slot >= variable_count => {
                return Err(Bailout::UnresolvedLocal { slot });
            }
            Some((slot, Some(stored))) => {
                env.set(slot, stored);
                resolved.insert(inst, stored);
                if is_used {
                    env.push_back(stored);
                } else {
                    graph.remove_inst(inst);
                }
            }
            Some((slot, None)) => {
                let value = env[slot];
                if graph.opcode(value) == Opcode::Phi && !graph.is_phi_alive(value) {
                    graph.mark_phi_alive(value);
                    live_phis.push(value);
                }
                resolved.insert(inst, value);
                if is_used {
                    env.push_back(value);
                } else {
                    graph.remove_inst(inst);
                }
            }
            None if graph.opcode(inst) == Opcode::PushArgument => {
                env.push_back(inst);
            }
            None if is_definition && is_used => {
                graph.alloc_ssa_index(inst);
                env.push_back(inst);
            }
            None => (),
        }
    }
    Ok(())
}

/// Pop the top of the expression stack, which sits above the local slots.
fn pop_stack(env: &mut Vector<Inst>, variable_count: usize, bb: Block) -> Result<Inst> {
    if env.len() <= variable_count {
        return Err(Bailout::StackUnderflow { block: bb });
    }
    env.pop_back().ok_or(Bailout::StackUnderflow { block: bb })
}

/// Propagate liveness from live phis to the phis they use.
fn mark_live_phis(graph: &mut FlowGraph, mut live_phis: Vec<Inst>) {
    while let Some(phi) = live_phis.pop() {
        for used in graph.args(phi).to_vec() {
            if graph.opcode(used) == Opcode::Phi && !graph.is_phi_alive(used) {
                graph.mark_phi_alive(used);
                live_phis.push(used);
            }
        }
    }
}

/// Remove the phis no load ever reached. Deoptimization environments that
/// still mention such a phi see the null constant instead.
fn remove_dead_phis(graph: &mut FlowGraph) {
    let null = graph.constant_null();
    let mut removed = 0;
    for bb in graph.preorder().to_vec() {
        for phi in graph.phis(bb).to_vec() {
            if graph.is_phi_alive(phi) {
                continue;
            }
            graph.replace_uses_with(phi, null);
            graph.remove_phi(phi);
            removed += 1;
        }
    }
    trace!("Removed {} dead phis in {}", removed, graph.name);
}

/// Total time spent constructing SSA form.
pub static SSA_TIME: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::prelude::*;
    use std::collections::HashSet;

    /// `x = 0; if (p) { x = 1 } return x;`
    fn conditional_store() -> (FlowGraph, Block) {
        let mut graph = FlowGraph::new("f", 1, 1);
        let mut b = GraphBuilder::new(&mut graph);
        let then_bb = b.target_block();
        let else_bb = b.target_block();
        let join = b.join_block();
        let zero = b.smi(0);
        b.store_local(1, zero);
        let p = b.load_local(0);
        b.branch_if(p, then_bb, else_bb);
        b.append_to(then_bb);
        let one = b.smi(1);
        b.store_local(1, one);
        b.goto(join);
        b.append_to(else_bb);
        b.goto(join);
        b.append_to(join);
        let x = b.load_local(1);
        b.return_value(x);
        (graph, join)
    }

    #[test]
    fn phi_at_merge_of_stores() {
        let (mut graph, join) = conditional_store();
        compute_ssa(&mut graph).unwrap();
        assert_eq!(graph.phis(join).len(), 1);
        let phi = graph.phis(join)[0];
        assert!(graph.is_phi_alive(phi));
        let inputs: Vec<_> = graph
            .args(phi)
            .iter()
            .map(|&i| graph.smi_constant_of(i))
            .collect();
        assert_eq!(inputs, vec![Some(1), Some(0)]);
        let ret = graph.last_inst(join).unwrap();
        assert_eq!(graph.args(ret), &[phi]);
        assert_eq!(graph.input_uses(phi).len(), 1);
        for bb in graph.preorder().to_vec() {
            for inst in graph.insts(bb) {
                assert!(!matches!(
                    graph.opcode(inst),
                    Opcode::LoadLocal | Opcode::StoreLocal
                ));
            }
        }
    }

    #[test]
    fn unused_phis_are_removed() {
        let (mut graph, join) = conditional_store();
        // Replace the final load by a constant so the phi is never read.
        let ret = graph.last_inst(join).unwrap();
        let load = graph.arg(ret, 0);
        graph[load].data = InstData::Constant {
            value: Constant::Smi(5),
        };
        compute_ssa(&mut graph).unwrap();
        assert!(graph.phis(join).is_empty());
    }

    #[test]
    fn parameters_and_null_are_initial_definitions() {
        let (mut graph, _) = conditional_store();
        compute_ssa(&mut graph).unwrap();
        let defs = graph.initial_definitions().to_vec();
        assert_eq!(defs.len(), 2);
        assert_eq!(graph.constant_of(defs[0]), Some(&Constant::Null));
        assert_eq!(graph.ssa_index(defs[0]), Some(0));
        assert_eq!(graph.opcode(defs[1]), Opcode::Parameter);
        assert_eq!(graph.ssa_index(defs[1]), Some(1));
    }

    /// `x = 0; y = 5; while (p) { if (p) { x = 1 } } return x + y;`
    ///
    /// Returns the graph and the loop header, the inner merge, and the
    /// inner branch blocks.
    fn store_in_nested_branch() -> (FlowGraph, [Block; 4]) {
        let mut graph = FlowGraph::new("f", 1, 2);
        let mut b = GraphBuilder::new(&mut graph);
        let header = b.join_block();
        let body = b.target_block();
        let exit = b.target_block();
        let then_bb = b.target_block();
        let else_bb = b.target_block();
        let merge = b.join_block();
        let zero = b.smi(0);
        b.store_local(1, zero);
        let five = b.smi(5);
        b.store_local(2, five);
        b.goto(header);
        b.append_to(header);
        let p = b.load_local(0);
        b.branch_if(p, body, exit);
        b.append_to(body);
        let p = b.load_local(0);
        b.branch_if(p, then_bb, else_bb);
        b.append_to(then_bb);
        let one = b.smi(1);
        b.store_local(1, one);
        b.goto(merge);
        b.append_to(else_bb);
        b.goto(merge);
        b.append_to(merge);
        b.goto(header);
        b.append_to(exit);
        let x = b.load_local(1);
        let y = b.load_local(2);
        let sum = b.build_inst(InstData::binary_smi_op(Token::Add, x, y));
        b.return_value(sum);
        (graph, [header, merge, then_bb, else_bb])
    }

    #[test]
    fn phis_only_at_iterated_frontier_of_stores() {
        let _ = env_logger::try_init();
        let (mut graph, [header, merge, then_bb, else_bb]) = store_in_nested_branch();
        compute_ssa(&mut graph).unwrap();

        // Only `x` is stored inside the loop, so only `x` gets phis, and
        // only at the inner merge and the loop header.
        assert_eq!(graph.phis(header).len(), 1);
        assert_eq!(graph.phis(merge).len(), 1);
        let outer = graph.phis(header)[0];
        let inner = graph.phis(merge)[0];
        assert!(graph.is_phi_alive(outer));
        assert!(graph.is_phi_alive(inner));

        let then_index = graph.pred_index(merge, then_bb).unwrap();
        let else_index = graph.pred_index(merge, else_bb).unwrap();
        assert_eq!(graph.smi_constant_of(graph.arg(inner, then_index)), Some(1));
        assert_eq!(graph.arg(inner, else_index), outer);
        assert!(graph.args(outer).contains(&inner));

        // The sum reads `x` through the header phi and `y` directly.
        let sum = graph
            .definitions()
            .into_iter()
            .find(|&def| graph.opcode(def) == Opcode::BinarySmiOp)
            .unwrap();
        assert_eq!(graph.arg(sum, 0), outer);
        assert_eq!(graph.smi_constant_of(graph.arg(sum, 1)), Some(5));
    }

    #[test]
    fn use_lists_are_recomputed_identically() {
        let (mut graph, _) = store_in_nested_branch();
        compute_ssa(&mut graph).unwrap();
        let snapshot = |graph: &FlowGraph| -> Vec<(Inst, HashSet<Use>, HashSet<Use>)> {
            graph
                .definitions()
                .into_iter()
                .map(|def| {
                    let inputs: HashSet<_> = graph.input_uses(def).iter().cloned().collect();
                    let envs: HashSet<_> = graph.env_uses(def).iter().cloned().collect();
                    assert_eq!(inputs.len(), graph.input_uses(def).len());
                    assert_eq!(envs.len(), graph.env_uses(def).len());
                    (def, inputs, envs)
                })
                .collect()
        };
        let before = snapshot(&graph);
        assert!(before.iter().any(|(_, inputs, _)| !inputs.is_empty()));
        assert!(before.iter().any(|(_, _, envs)| !envs.is_empty()));
        graph.compute_use_lists();
        assert_eq!(snapshot(&graph), before);
        graph.compute_use_lists();
        assert_eq!(snapshot(&graph), before);
    }

    #[test]
    fn operands_keep_their_order() {
        let _ = env_logger::try_init();
        // return x - y; with the arguments pushed after both loads.
        let mut graph = FlowGraph::new("f", 2, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.load_local(0);
        let y = b.load_local(1);
        let difference = b.binary_call(Token::Sub, x, y, None);
        b.return_value(difference);
        compute_ssa(&mut graph).unwrap();

        let params = graph.initial_definitions()[1..].to_vec();
        let pushed: Vec<_> = graph
            .inst(difference)
            .arguments()
            .iter()
            .map(|&push| graph.arg(push, 0))
            .collect();
        assert_eq!(pushed, params);
    }

    #[test]
    fn inputs_out_of_stack_order_are_rejected() {
        let mut graph = FlowGraph::new("f", 2, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let y = b.load_local(1);
        let x = b.load_local(0);
        let difference = b.build_inst(InstData::binary_smi_op(Token::Sub, x, y));
        b.return_value(difference);
        match compute_ssa(&mut graph) {
            Err(Bailout::MalformedGraph(_)) => (),
            other => panic!("expected a malformed graph, got {:?}", other),
        }
    }

    #[test]
    fn catch_entries_bail_out() {
        let mut graph = FlowGraph::new("f", 0, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let n = b.null();
        b.return_value(n);
        let catch = b.catch_entry();
        b.append_to(catch);
        let n = b.null();
        b.return_value(n);
        assert_eq!(compute_ssa(&mut graph), Err(Bailout::CatchEntry));
    }

    #[test]
    fn underflow_bails_out() {
        let mut graph = FlowGraph::new("f", 0, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let n = b.null();
        b.return_value(n);
        // The constant is consumed twice.
        let entry = b.block();
        b.return_value(n);
        assert_eq!(
            compute_ssa(&mut graph),
            Err(Bailout::StackUnderflow { block: entry })
        );
    }
}
