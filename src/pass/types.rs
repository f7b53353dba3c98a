// Copyright (c) 2017-2020 Fabian Schuiki

//! Type Propagation

use crate::ir::prelude::*;
use crate::opt::prelude::*;

/// Type Propagation
///
/// Computes the class id of every definition by iterating over the blocks in
/// reverse postorder until no class id changes. Phis merge the class ids of
/// their inputs. Type checks whose outcome follows from the propagated class
/// of their input are removed along the way.
pub struct TypePropagation;

impl Pass for TypePropagation {
    fn run_on_graph(ctx: &PassContext, graph: &mut FlowGraph) -> bool {
        let mut modified = visit_parameters(ctx, graph);
        let mut iterations = 0;
        loop {
            iterations += 1;
            let changed = visit_blocks(ctx, graph);
            modified |= changed;
            if !changed {
                break;
            }
        }
        debug!(
            "Propagated types in {} after {} iterations",
            graph.name, iterations
        );
        modified
    }
}

/// Assign class ids to the parameters.
///
/// The receiver of an instance method has the class of the method's owner,
/// unless a subclass might be passed instead.
fn visit_parameters(ctx: &PassContext, graph: &mut FlowGraph) -> bool {
    let mut changed = false;
    for def in graph.initial_definitions().to_vec() {
        let index = match *graph.inst(def) {
            InstData::Parameter { index } => index,
            _ => continue,
        };
        let cid = match graph.owner {
            Some(owner) if index == 0 && ctx.config.use_cha && !ctx.classes.has_subclasses(owner) => {
                owner
            }
            _ => ClassId::DYNAMIC,
        };
        changed |= graph.set_cid(def, cid);
    }
    changed
}

fn visit_blocks(ctx: &PassContext, graph: &mut FlowGraph) -> bool {
    let mut changed = false;
    for bb in graph.reverse_postorder().to_vec() {
        for phi in graph.phis(bb).to_vec() {
            if graph.is_phi_alive(phi) {
                changed |= visit_phi(graph, phi);
            }
        }
        for inst in graph.insts_vec(bb) {
            if !graph.is_inst_inserted(inst) {
                continue;
            }
            if eliminate_type_check(ctx, graph, inst) {
                changed = true;
                continue;
            }
            let data = graph.inst(inst);
            if data.is_definition() && data.opcode() != Opcode::PushArgument {
                let cid = data.result_cid();
                changed |= graph.set_cid(inst, cid);
            }
        }
    }
    changed
}

/// Merge the class ids of the phi inputs.
///
/// Inputs not visited yet are ignored. If two inputs disagree the phi is
/// dynamic.
fn visit_phi(graph: &mut FlowGraph, phi: Inst) -> bool {
    let mut changed = false;
    let mut merged = ClassId::ILLEGAL;
    for &input in graph.args(phi) {
        let cid = graph.cid(input);
        if cid == ClassId::ILLEGAL {
            changed = true;
            continue;
        }
        if merged == ClassId::ILLEGAL {
            merged = cid;
        } else if merged != cid {
            merged = ClassId::DYNAMIC;
        }
    }
    if merged == ClassId::ILLEGAL {
        merged = ClassId::DYNAMIC;
    }
    graph.set_cid(phi, merged) || changed
}

/// The class of a value, if it is precise enough to decide type tests.
fn known_cid(graph: &FlowGraph, user: Inst) -> Option<ClassId> {
    match graph.use_cid(user, 0) {
        ClassId::DYNAMIC | ClassId::ILLEGAL => None,
        cid => Some(cid),
    }
}

/// Remove a type assertion or type test whose outcome is known.
fn eliminate_type_check(ctx: &PassContext, graph: &mut FlowGraph, inst: Inst) -> bool {
    let classes = &ctx.classes;
    match *graph.inst(inst) {
        InstData::AssertAssignable { ty, args } => match known_cid(graph, inst) {
            Some(cid) if cid == ClassId::NULL || classes.is_subtype(cid, ty) => {
                trace!("Eliminating assertion {} of {} on {}", inst, ty, cid);
                graph.replace_with_existing(inst, args[0]);
                true
            }
            _ => false,
        },
        InstData::Unary {
            opcode: Opcode::AssertBoolean,
            args,
        } => match known_cid(graph, inst) {
            Some(ClassId::BOOL) => {
                trace!("Eliminating boolean assertion {}", inst);
                graph.replace_with_existing(inst, args[0]);
                true
            }
            _ => false,
        },
        InstData::InstanceOf { ty, negate, .. } => match known_cid(graph, inst) {
            Some(cid) => {
                let result = classes.is_subtype(cid, ty) != negate;
                trace!("Folding type test {} of {} on {} to {}", inst, ty, cid, result);
                let constant = graph.get_constant(Constant::Bool(result));
                graph.replace_with_existing(inst, constant);
                true
            }
            None => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::OptimizerConfig,
        ir::{ClassTable, FunctionKind, RecognizedMethod},
        ssa::compute_ssa,
    };
    use std::sync::Arc;

    fn ctx() -> PassContext {
        PassContext::new(OptimizerConfig::default(), Default::default())
    }

    /// `x = a; if (p) { x = b } return x;`
    fn merge(a: Constant, b: Constant) -> (FlowGraph, Block) {
        let mut graph = FlowGraph::new("f", 1, 1);
        let mut g = GraphBuilder::new(&mut graph);
        let then_bb = g.target_block();
        let else_bb = g.target_block();
        let join = g.join_block();
        let first = g.constant(a);
        g.store_local(1, first);
        let p = g.load_local(0);
        g.branch_if(p, then_bb, else_bb);
        g.append_to(then_bb);
        let second = g.constant(b);
        g.store_local(1, second);
        g.goto(join);
        g.append_to(else_bb);
        g.goto(join);
        g.append_to(join);
        let x = g.load_local(1);
        g.return_value(x);
        compute_ssa(&mut graph).unwrap();
        (graph, join)
    }

    #[test]
    fn phi_of_equal_classes_keeps_class() {
        let _ = env_logger::try_init();
        let (mut graph, join) = merge(Constant::Smi(0), Constant::Smi(1));
        TypePropagation::run_on_graph(&ctx(), &mut graph);
        let phi = graph.phis(join)[0];
        assert_eq!(graph.cid(phi), ClassId::SMI);
    }

    #[test]
    fn phi_of_different_classes_is_dynamic() {
        let (mut graph, join) = merge(Constant::Smi(0), Constant::Double(1.0));
        TypePropagation::run_on_graph(&ctx(), &mut graph);
        let phi = graph.phis(join)[0];
        assert_eq!(graph.cid(phi), ClassId::DYNAMIC);
    }

    #[test]
    fn receiver_of_leaf_class_is_known() {
        let mut classes = ClassTable::new();
        let point = classes.add_class("Point", None);
        classes.add_method(point, "norm", FunctionKind::Regular, RecognizedMethod::Unknown);
        let ctx = PassContext::new(OptimizerConfig::default(), Arc::new(classes));

        let mut graph = FlowGraph::new("Point.norm", 1, 0);
        graph.owner = Some(point);
        let mut b = GraphBuilder::new(&mut graph);
        let this = b.load_local(0);
        b.return_value(this);
        compute_ssa(&mut graph).unwrap();
        TypePropagation::run_on_graph(&ctx, &mut graph);
        let receiver = graph.initial_definitions()[1];
        assert_eq!(graph.cid(receiver), point);
    }

    #[test]
    fn type_test_on_known_class_is_folded() {
        let mut graph = FlowGraph::new("f", 0, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let c = b.smi(3);
        let test = b.build_inst(InstData::InstanceOf {
            ty: ClassId::NUM,
            negate: true,
            args: [c],
        });
        let ret = b.return_value(test);
        compute_ssa(&mut graph).unwrap();
        assert!(TypePropagation::run_on_graph(&ctx(), &mut graph));
        assert!(!graph.is_inst_inserted(test));
        assert_eq!(graph.constant_of(graph.arg(ret, 0)), Some(&Constant::Bool(false)));
    }
}
