// Copyright (c) 2017-2020 Fabian Schuiki

//! Dominator-Based Common Subexpression Elimination

use crate::ir::{prelude::*, ValueNumberKey};
use crate::opt::prelude::*;
use std::collections::HashMap;

/// Dominator-Based Common Subexpression Elimination
///
/// This pass walks the dominator tree and replaces instructions that compute
/// the same value as an instruction in a dominating position. Only
/// instructions not affected by side effects are considered.
pub struct DominatorBasedCse;

impl Pass for DominatorBasedCse {
    fn run_on_graph(_ctx: &PassContext, graph: &mut FlowGraph) -> bool {
        let mut replaced = 0;

        // Each child in the dominator tree sees the values of its dominators.
        // The last child takes over its parent's map instead of a copy.
        let mut stack = vec![(graph.graph_entry(), HashMap::new())];
        while let Some((bb, mut values)) = stack.pop() {
            replaced += optimize_block(graph, bb, &mut values);
            let children = &graph[bb].dominated;
            if let Some((&last, rest)) = children.split_last() {
                for &child in rest {
                    stack.push((child, values.clone()));
                }
                stack.push((last, values));
            }
        }

        debug!("Replaced {} instructions in {}", replaced, graph.name);
        replaced > 0
    }
}

fn optimize_block(
    graph: &mut FlowGraph,
    bb: Block,
    values: &mut HashMap<ValueNumberKey, Inst>,
) -> usize {
    let mut replaced = 0;
    for inst in graph.insts_vec(bb) {
        let data = graph.inst(inst);
        if data.affected_by_side_effect() || data.is_terminator() {
            continue;
        }
        let key = data.value_number_key();
        match values.get(&key) {
            Some(&existing) => {
                trace!("Replacing {} with {}", inst, existing);
                graph.replace_with_existing(inst, existing);
                replaced += 1;
            }
            None => {
                values.insert(key, inst);
            }
        }
    }
    replaced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::OptimizerConfig, ssa::compute_ssa};

    fn ctx() -> PassContext {
        PassContext::new(OptimizerConfig::default(), Default::default())
    }

    #[test]
    fn identical_arithmetic_is_shared() {
        let _ = env_logger::try_init();
        let mut graph = FlowGraph::new("f", 2, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.load_local(0);
        let y = b.load_local(1);
        let first = b.build_inst(InstData::binary_smi_op(Token::Add, x, y));
        let x = b.load_local(0);
        let y = b.load_local(1);
        let second = b.build_inst(InstData::binary_smi_op(Token::Add, x, y));
        let product = b.build_inst(InstData::binary_smi_op(Token::Mul, first, second));
        b.return_value(product);
        compute_ssa(&mut graph).unwrap();

        assert!(DominatorBasedCse::run_on_graph(&ctx(), &mut graph));
        assert!(!graph.is_inst_inserted(second));
        assert_eq!(graph.args(product), &[first, first]);
    }

    #[test]
    fn sibling_branches_do_not_share() {
        let mut graph = FlowGraph::new("f", 2, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let then_bb = b.target_block();
        let else_bb = b.target_block();
        let p = b.load_local(0);
        b.branch_if(p, then_bb, else_bb);
        let mut adds = vec![];
        for &bb in &[then_bb, else_bb] {
            b.append_to(bb);
            let x = b.load_local(1);
            let one = b.smi(1);
            let sum = b.build_inst(InstData::binary_smi_op(Token::Add, x, one));
            adds.push(sum);
            b.return_value(sum);
        }
        compute_ssa(&mut graph).unwrap();

        assert!(!DominatorBasedCse::run_on_graph(&ctx(), &mut graph));
        assert!(adds.iter().all(|&add| graph.is_inst_inserted(add)));
    }

    #[test]
    fn dominating_value_reaches_both_branches() {
        let mut graph = FlowGraph::new("f", 2, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let then_bb = b.target_block();
        let else_bb = b.target_block();
        let x = b.load_local(1);
        let one = b.smi(1);
        let dominating = b.build_inst(InstData::binary_smi_op(Token::Add, x, one));
        b.build_inst(InstData::unary(Opcode::CheckSmi, dominating));
        let p = b.load_local(0);
        b.branch_if(p, then_bb, else_bb);
        let mut rets = vec![];
        for &bb in &[then_bb, else_bb] {
            b.append_to(bb);
            let x = b.load_local(1);
            let one = b.smi(1);
            let sum = b.build_inst(InstData::binary_smi_op(Token::Add, x, one));
            rets.push(b.return_value(sum));
        }
        compute_ssa(&mut graph).unwrap();

        assert!(DominatorBasedCse::run_on_graph(&ctx(), &mut graph));
        assert_eq!(graph.arg(rets[0], 0), dominating);
        assert_eq!(graph.arg(rets[1], 0), dominating);
    }

    #[test]
    fn only_immutable_loads_are_shared() {
        let mut graph = FlowGraph::new("f", 1, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let obj = b.load_local(0);
        let a = b.load_field(obj, 8, true);
        let obj = b.load_local(0);
        let a2 = b.load_field(obj, 8, true);
        let s = b.build_inst(InstData::binary_smi_op(Token::Add, a, a2));
        let obj = b.load_local(0);
        let m = b.load_field(obj, 16, false);
        let obj = b.load_local(0);
        let m2 = b.load_field(obj, 16, false);
        let t = b.build_inst(InstData::binary_smi_op(Token::Add, m, m2));
        let u = b.build_inst(InstData::binary_smi_op(Token::Add, s, t));
        b.return_value(u);
        compute_ssa(&mut graph).unwrap();

        assert!(DominatorBasedCse::run_on_graph(&ctx(), &mut graph));
        assert!(!graph.is_inst_inserted(a2));
        assert!(graph.is_inst_inserted(m2));
    }

    #[test]
    fn duplicate_check_is_removed() {
        let mut graph = FlowGraph::new("f", 1, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.load_local(0);
        b.build_inst(InstData::unary(Opcode::CheckSmi, x));
        let x = b.load_local(0);
        let second = b.build_inst(InstData::unary(Opcode::CheckSmi, x));
        let x = b.load_local(0);
        b.return_value(x);
        compute_ssa(&mut graph).unwrap();

        assert!(DominatorBasedCse::run_on_graph(&ctx(), &mut graph));
        assert!(!graph.is_inst_inserted(second));
    }
}
