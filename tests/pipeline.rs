// Copyright (c) 2017-2020 Fabian Schuiki

use indoc::indoc;
use jitopt::{
    ir::prelude::*,
    opt::{default_stages, optimize, optimize_module, prelude::*, Stage},
    ssa::compute_ssa,
    Bailout, OptimizerConfig,
};
use std::sync::Arc;

fn ctx() -> PassContext {
    let mut config = OptimizerConfig::default();
    config.verify = true;
    PassContext::new(config, Arc::new(ClassTable::new()))
}

/// `return p;`
fn identity() -> FlowGraph {
    let mut graph = FlowGraph::new("id", 1, 0);
    let mut b = GraphBuilder::new(&mut graph);
    let p = b.load_local(0);
    b.return_value(p);
    graph
}

/// `s = 0; for (i = 0; i < n; i++) s = s + i; return s;`
fn counting_loop(name: &str) -> FlowGraph {
    let mut graph = FlowGraph::new(name, 1, 2);
    let mut b = GraphBuilder::new(&mut graph);
    let header = b.join_block();
    let body = b.target_block();
    let exit = b.target_block();
    let n = b.load_local(0);
    b.build_inst(InstData::unary(Opcode::CheckSmi, n));
    for &slot in &[1, 2] {
        let zero = b.smi(0);
        b.store_local(slot, zero);
    }
    b.goto(header);

    b.append_to(header);
    let i = b.load_local(2);
    let n = b.load_local(0);
    let mut cmp = Comparison::relational(Token::Lt, i, n, None);
    cmp.operands_cid = ClassId::SMI;
    b.branch(cmp, body, exit);

    b.append_to(body);
    let s = b.load_local(1);
    let i = b.load_local(2);
    let sum = b.build_inst(InstData::binary_smi_op(Token::Add, s, i));
    b.store_local(1, sum);
    let i = b.load_local(2);
    let one = b.smi(1);
    let next = b.build_inst(InstData::binary_smi_op(Token::Add, i, one));
    b.store_local(2, next);
    b.goto(header);

    b.append_to(exit);
    let s = b.load_local(1);
    b.return_value(s);
    graph
}

#[test]
fn ssa_form_dump() {
    let _ = env_logger::try_init();
    let mut graph = identity();
    compute_ssa(&mut graph).unwrap();
    assert_eq!(
        graph.dump().to_string(),
        indoc!(
            "
            graph id (1 params, 0 locals) {
            B0[graph]:
              v0 <- Constant(null)
              v1 <- Parameter(0)
            B1[target] pred(B0) idom B0:
              Return(v1)
            }
            "
        )
    );
}

#[test]
fn catch_entries_bail_out() {
    let mut graph = identity();
    graph.add_catch_entry();
    assert_eq!(optimize(&ctx(), &mut graph), Err(Bailout::CatchEntry));
}

#[test]
fn stack_underflow_bails_out() {
    let mut graph = FlowGraph::new("underflow", 1, 0);
    let mut b = GraphBuilder::new(&mut graph);
    let p = b.load_local(0);
    let sum = b.build_inst(InstData::binary_smi_op(Token::Add, p, p));
    b.return_value(sum);
    match optimize(&ctx(), &mut graph) {
        Err(Bailout::StackUnderflow { block }) => assert_eq!(block, graph.normal_entry()),
        other => panic!("expected a stack underflow, got {:?}", other),
    }
}

#[test]
fn disabled_passes_are_skipped() {
    let mut ctx = ctx();
    ctx.config.constant_propagation = false;
    ctx.config.licm = false;
    ctx.config.range_analysis = false;
    let stages = default_stages(&ctx);
    assert!(!stages.contains(&Stage::Sccp));
    assert!(!stages.contains(&Stage::Licm));
    assert!(!stages.contains(&Stage::Range));
    assert!(stages.contains(&Stage::LoadElim));
    assert_eq!(stages.first(), Some(&Stage::Specialize));
    assert_eq!(stages.last(), Some(&Stage::Repr));
}

#[test]
fn module_is_optimized_in_parallel() {
    let _ = env_logger::try_init();
    let mut module = Module::new(Arc::new(ClassTable::new()));
    for n in 0..16 {
        module.add_graph(counting_loop(&format!("loop{}", n)));
    }
    module.add_graph({
        let mut graph = identity();
        graph.add_catch_entry();
        graph
    });

    let results = optimize_module(&ctx(), &mut module);
    assert_eq!(results.len(), 17);
    assert!(results[..16].iter().all(|r| r.is_ok()));
    assert_eq!(results[16], Err(Bailout::CatchEntry));

    // Both loop variables keep their phis.
    for graph in module.graphs().take(16) {
        let header = graph
            .reverse_postorder()
            .iter()
            .cloned()
            .find(|&bb| graph.is_join(bb))
            .unwrap();
        let live_phis = graph
            .phis(header)
            .iter()
            .filter(|&&phi| graph.is_phi_alive(phi))
            .count();
        assert_eq!(live_phis, 2, "{}", graph.dump());
    }
}
