// Copyright (c) 2017-2020 Fabian Schuiki

//! End-to-end runs of the optimizer over small methods.

use jitopt::{
    ir::{prelude::*, InstData},
    opt::{optimize, prelude::*},
    OptimizerConfig,
};
use std::sync::Arc;

fn ctx(classes: ClassTable) -> PassContext {
    let mut config = OptimizerConfig::default();
    config.verify = true;
    PassContext::new(config, Arc::new(classes))
}

/// All instructions placed in the reachable blocks of a graph.
fn all_insts(graph: &FlowGraph) -> Vec<Inst> {
    graph
        .reverse_postorder()
        .iter()
        .flat_map(|&bb| graph.insts(bb))
        .collect()
}

fn count(graph: &FlowGraph, opcode: Opcode) -> usize {
    all_insts(graph)
        .into_iter()
        .filter(|&inst| graph.opcode(inst) == opcode)
        .count()
}

#[test]
fn counted_loop_over_new_list_has_no_bounds_check() {
    let _ = env_logger::try_init();
    let classes = ClassTable::new();
    let new_list = classes.lookup_static(ClassId::ARRAY, "new").unwrap();

    // a = new List(n); for (i = 0; i < n; i++) a[i] = i;
    let mut graph = FlowGraph::new("fill", 1, 2);
    let mut b = GraphBuilder::new(&mut graph);
    let header = b.join_block();
    let body = b.target_block();
    let exit = b.target_block();
    let n = b.load_local(0);
    let a = b.constructor_call(new_list, &[n], ClassId::ARRAY);
    b.store_local(1, a);
    let zero = b.smi(0);
    b.store_local(2, zero);
    b.goto(header);

    b.append_to(header);
    let i = b.load_local(2);
    let n = b.load_local(0);
    let mut cmp = Comparison::relational(Token::Lt, i, n, None);
    cmp.operands_cid = ClassId::SMI;
    b.branch(cmp, body, exit);

    b.append_to(body);
    let a = b.load_local(1);
    let i = b.load_local(2);
    b.build_inst(InstData::CheckArrayBound {
        array_cid: ClassId::ARRAY,
        args: [a, i],
    });
    let a = b.load_local(1);
    let i = b.load_local(2);
    let value = b.load_local(2);
    b.build_inst(InstData::StoreIndexed {
        class_id: ClassId::ARRAY,
        needs_barrier: false,
        args: [a, i, value],
    });
    let i = b.load_local(2);
    let one = b.smi(1);
    let next = b.build_inst(InstData::binary_smi_op(Token::Add, i, one));
    b.store_local(2, next);
    b.goto(header);

    b.append_to(exit);
    let a = b.load_local(1);
    b.return_value(a);

    let checks_in_body = graph
        .insts(body)
        .filter(|&inst| graph.opcode(inst) == Opcode::CheckArrayBound)
        .count();
    assert_eq!(checks_in_body, 1);
    optimize(&ctx(classes), &mut graph).unwrap();
    assert_eq!(count(&graph, Opcode::CheckArrayBound), 0);
    assert_eq!(count(&graph, Opcode::StoreIndexed), 1);
}

#[test]
fn mixed_number_feedback_becomes_guarded_double_add() {
    let _ = env_logger::try_init();
    let classes = ClassTable::new();
    let smi_add = classes.resolve_dynamic(ClassId::SMI, "+").unwrap();
    let mut ic = IcData::new("+", 2);
    ic.add_check(vec![ClassId::SMI, ClassId::SMI], smi_add);
    ic.add_check(vec![ClassId::SMI, ClassId::DOUBLE], smi_add);

    // return x + y;
    let mut graph = FlowGraph::new("add", 2, 0);
    let mut b = GraphBuilder::new(&mut graph);
    let x = b.load_local(0);
    let y = b.load_local(1);
    let sum = b.binary_call(Token::Add, x, y, Some(ic));
    b.return_value(sum);

    optimize(&ctx(classes), &mut graph).unwrap();
    assert_eq!(count(&graph, Opcode::CheckEitherNonSmi), 1);
    assert_eq!(count(&graph, Opcode::BinaryDoubleOp), 1);
    assert_eq!(count(&graph, Opcode::BinarySmiOp), 0);
    assert_eq!(count(&graph, Opcode::InstanceCall), 0);
    assert_eq!(count(&graph, Opcode::PolymorphicInstanceCall), 0);

    // The guard comes first and the sum is boxed for the return.
    let entry = graph.normal_entry();
    assert_eq!(
        graph.first_inst(entry).map(|inst| graph.opcode(inst)),
        Some(Opcode::CheckEitherNonSmi)
    );
    let ret = graph.last_inst(entry).unwrap();
    assert_eq!(graph.opcode(graph.arg(ret, 0)), Opcode::BoxDouble);

    // The unboxed operands are the parameters in source order.
    let params = graph.initial_definitions()[1..].to_vec();
    let sum = graph.arg(graph.arg(ret, 0), 0);
    assert_eq!(graph.opcode(sum), Opcode::BinaryDoubleOp);
    let operands: Vec<_> = graph
        .args(sum)
        .iter()
        .map(|&arg| unboxed_source(&graph, arg))
        .collect();
    assert_eq!(operands, params);
    let guard = graph.first_inst(entry).unwrap();
    assert_eq!(graph.args(guard), &params[..]);
}

/// Follow unboxing conversions back to the tagged definition.
fn unboxed_source(graph: &FlowGraph, mut def: Inst) -> Inst {
    while matches!(
        graph.opcode(def),
        Opcode::UnboxDouble | Opcode::UnboxInteger
    ) {
        def = graph.arg(def, 0);
    }
    def
}

#[test]
fn subtraction_keeps_operand_order() {
    let _ = env_logger::try_init();
    let classes = ClassTable::new();
    let smi_sub = classes.resolve_dynamic(ClassId::SMI, "-").unwrap();
    let mut ic = IcData::new("-", 2);
    ic.add_check(vec![ClassId::SMI, ClassId::SMI], smi_sub);

    // return x - y;
    let mut graph = FlowGraph::new("sub", 2, 0);
    let mut b = GraphBuilder::new(&mut graph);
    let x = b.load_local(0);
    let y = b.load_local(1);
    let difference = b.binary_call(Token::Sub, x, y, Some(ic));
    b.return_value(difference);

    optimize(&ctx(classes), &mut graph).unwrap();
    let ops: Vec<_> = all_insts(&graph)
        .into_iter()
        .filter(|&inst| graph.opcode(inst) == Opcode::BinarySmiOp)
        .collect();
    assert_eq!(ops.len(), 1);
    let operands: Vec<_> = graph
        .args(ops[0])
        .iter()
        .map(|&arg| unboxed_source(&graph, arg))
        .collect();
    assert_eq!(operands, graph.initial_definitions()[1..].to_vec());
}

#[test]
fn constant_condition_drops_dead_branch() {
    let _ = env_logger::try_init();

    // k = true; if (k) r = 1; else r = 2; return r;
    let mut graph = FlowGraph::new("select", 0, 2);
    let mut b = GraphBuilder::new(&mut graph);
    let then_bb = b.target_block();
    let else_bb = b.target_block();
    let join = b.join_block();
    let k = b.constant(Constant::Bool(true));
    b.store_local(0, k);
    let k = b.load_local(0);
    b.branch_if(k, then_bb, else_bb);
    for (&bb, value) in [then_bb, else_bb].iter().zip(1..) {
        b.append_to(bb);
        let r = b.smi(value);
        b.store_local(1, r);
        b.goto(join);
    }
    b.append_to(join);
    let r = b.load_local(1);
    let ret = b.return_value(r);

    optimize(&ctx(ClassTable::new()), &mut graph).unwrap();

    let jump = graph.last_inst(graph.normal_entry()).unwrap();
    assert_eq!(graph.inst(jump), &InstData::Goto { target: then_bb });
    assert!(!graph.reverse_postorder().contains(&else_bb));
    for &bb in graph.reverse_postorder() {
        assert!(!graph[bb].dominated.contains(&else_bb));
        assert!(!graph.preds(bb).contains(&else_bb));
    }
    assert_eq!(graph.constant_of(graph.arg(ret, 0)), Some(&Constant::Smi(1)));
}

#[test]
fn load_after_unrelated_store_reuses_value() {
    let _ = env_logger::try_init();

    // x = o.f; o.g = v; y = o.f; return [x, y];
    let mut graph = FlowGraph::new("reload", 2, 0);
    let mut b = GraphBuilder::new(&mut graph);
    let o = b.load_local(0);
    let first = b.load_field(o, 8, false);
    let o = b.load_local(0);
    let v = b.load_local(1);
    b.store_field(o, 16, v);
    let o = b.load_local(0);
    let second = b.load_field(o, 8, false);
    let pair = b.create_array(&[first, second]);
    b.return_value(pair);

    optimize(&ctx(ClassTable::new()), &mut graph).unwrap();
    assert_eq!(count(&graph, Opcode::LoadField), 1);
    assert!(graph.is_inst_inserted(first));
    assert!(!graph.is_inst_inserted(second));
    assert_eq!(count(&graph, Opcode::StoreField), 1);
}

#[test]
fn invariant_load_is_hoisted_once() {
    let _ = env_logger::try_init();

    // while (i < n) { s = o.f + o.f + o.f; i = i + 1 } return s;
    let mut graph = FlowGraph::new("hoist", 2, 2);
    let mut b = GraphBuilder::new(&mut graph);
    let header = b.join_block();
    let body = b.target_block();
    let exit = b.target_block();
    let n = b.load_local(1);
    b.build_inst(InstData::unary(Opcode::CheckSmi, n));
    let zero = b.smi(0);
    b.store_local(2, zero);
    let zero = b.smi(0);
    b.store_local(3, zero);
    b.goto(header);

    b.append_to(header);
    let i = b.load_local(2);
    let n = b.load_local(1);
    let mut cmp = Comparison::relational(Token::Lt, i, n, None);
    cmp.operands_cid = ClassId::SMI;
    b.branch(cmp, body, exit);

    b.append_to(body);
    let o = b.load_local(0);
    let first = b.load_field(o, 8, false);
    let o = b.load_local(0);
    let second = b.load_field(o, 8, false);
    let partial = b.build_inst(InstData::binary_smi_op(Token::Add, first, second));
    let o = b.load_local(0);
    let third = b.load_field(o, 8, false);
    let sum = b.build_inst(InstData::binary_smi_op(Token::Add, partial, third));
    b.store_local(3, sum);
    let i = b.load_local(2);
    let one = b.smi(1);
    let next = b.build_inst(InstData::binary_smi_op(Token::Add, i, one));
    b.store_local(2, next);
    b.goto(header);

    b.append_to(exit);
    let s = b.load_local(3);
    b.return_value(s);

    optimize(&ctx(ClassTable::new()), &mut graph).unwrap();
    let remaining: Vec<_> = all_insts(&graph)
        .into_iter()
        .filter(|&inst| graph.opcode(inst) == Opcode::LoadField)
        .collect();
    assert_eq!(remaining.len(), 1);
    assert_eq!(graph.inst_block(remaining[0]), Some(graph.normal_entry()));
}
