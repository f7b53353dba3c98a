// Copyright (c) 2017-2020 Fabian Schuiki

//! Representation Selection

use crate::ir::{prelude::*, Representation};
use crate::opt::prelude::*;

/// Representation Selection
///
/// Keeps phis of doubles (and of wide integers, if the target supports them
/// unboxed) unboxed, and inserts a conversion wherever a value flows into an
/// input that expects a different representation.
pub struct SelectRepresentations;

impl Pass for SelectRepresentations {
    fn run_on_graph(ctx: &PassContext, graph: &mut FlowGraph) -> bool {
        let mut modified = unbox_phis(ctx, graph);
        let mut conversions = 0;
        for def in graph.initial_definitions().to_vec() {
            conversions += insert_conversions_for(graph, def);
        }
        for bb in graph.reverse_postorder().to_vec() {
            for phi in graph.phis(bb).to_vec() {
                if graph.is_phi_alive(phi) {
                    conversions += insert_conversions_for(graph, phi);
                }
            }
            for inst in graph.insts_vec(bb) {
                if graph.inst(inst).is_definition() {
                    conversions += insert_conversions_for(graph, inst);
                }
            }
        }
        debug!("Inserted {} conversions in {}", conversions, graph.name);
        modified |= conversions > 0;
        modified
    }
}

fn unbox_phis(ctx: &PassContext, graph: &mut FlowGraph) -> bool {
    let mut modified = false;
    for bb in graph.reverse_postorder().to_vec() {
        for phi in graph.phis(bb).to_vec() {
            let unboxed = match graph.cid(phi) {
                ClassId::DOUBLE => Representation::UnboxedDouble,
                ClassId::MINT if ctx.config.unboxed_mints => Representation::UnboxedMint,
                _ => continue,
            };
            if let InstData::Phi { representation, .. } = &mut graph[phi].data {
                if *representation != unboxed {
                    trace!("Unboxing phi {} as {}", phi, unboxed);
                    *representation = unboxed;
                    modified = true;
                }
            }
        }
    }
    modified
}

fn insert_conversions_for(graph: &mut FlowGraph, def: Inst) -> usize {
    let from = graph.inst(def).representation();
    let mut inserted = 0;
    for use_ in graph.input_uses(def).to_vec() {
        let user = use_.user;
        let to = graph.inst(user).required_input_representation(use_.index);
        if from == to {
            continue;
        }

        // Conversions for a phi input happen at the end of the predecessor.
        let (before, deopt_target) = if graph.opcode(user) == Opcode::Phi {
            if !graph.is_phi_alive(user) {
                continue;
            }
            let pred = graph
                .inst_block(user)
                .and_then(|bb| graph.preds(bb).get(use_.index).cloned());
            match pred.and_then(|pred| graph.last_inst(pred)) {
                Some(last) => (last, last),
                None => continue,
            }
        } else if graph.is_inst_inserted(user) {
            (user, user)
        } else {
            continue;
        };

        if let Some(converted) = insert_conversion(graph, def, from, to, before, deopt_target) {
            trace!(
                "Converting {} from {} to {} for {} with {}",
                def,
                from,
                to,
                user,
                converted
            );
            graph.set_arg(user, use_.index, converted);
            inserted += 1;
        }
    }
    inserted
}

/// Build the instructions converting `def` between two representations in
/// front of `before`. Returns the converted value.
fn insert_conversion(
    graph: &mut FlowGraph,
    def: Inst,
    from: Representation,
    to: Representation,
    before: Inst,
    deopt_target: Inst,
) -> Option<Inst> {
    use Representation::*;
    let steps: &[Opcode] = match (from, to) {
        (Tagged, UnboxedMint) => &[Opcode::UnboxInteger],
        (UnboxedMint, Tagged) => &[Opcode::BoxInteger],
        (UnboxedMint, UnboxedDouble) => &[Opcode::BoxInteger, Opcode::UnboxDouble],
        (UnboxedDouble, Tagged) => &[Opcode::BoxDouble],
        (UnboxedDouble, UnboxedMint) => &[Opcode::BoxDouble, Opcode::UnboxInteger],
        (Tagged, UnboxedDouble) => {
            // Small integer constants become double constants, other small
            // integers are converted without a check.
            if let Some(value) = graph.smi_constant_of(def) {
                let constant = graph.get_constant(Constant::Double(value as f64));
                return Some(insert_step(graph, Opcode::UnboxDouble, constant, before, deopt_target));
            }
            if graph.cid(def) == ClassId::SMI {
                &[Opcode::SmiToDouble]
            } else {
                &[Opcode::UnboxDouble]
            }
        }
        _ => return None,
    };
    let mut value = def;
    for &opcode in steps {
        value = insert_step(graph, opcode, value, before, deopt_target);
    }
    Some(value)
}

fn insert_step(
    graph: &mut FlowGraph,
    opcode: Opcode,
    value: Inst,
    before: Inst,
    deopt_target: Inst,
) -> Inst {
    let converted = graph.add_inst(InstData::unary(opcode, value));
    if graph.inst(converted).can_deoptimize() && graph.env(deopt_target).is_some() {
        graph.copy_deopt_target(converted, deopt_target);
    }
    graph.insert_before(before, converted);
    graph.alloc_ssa_index(converted);
    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::OptimizerConfig, pass::TypePropagation, ssa::compute_ssa};

    fn ctx() -> PassContext {
        PassContext::new(OptimizerConfig::default(), Default::default())
    }

    fn double_op(op: Token, left: Inst, right: Inst) -> InstData {
        InstData::binary_op(Opcode::BinaryDoubleOp, op, left, right)
    }

    #[test]
    fn double_loop_phi_is_unboxed() {
        let _ = env_logger::try_init();
        // x = 0.0; while (p) { x = x + 1.5 } return x;
        let mut graph = FlowGraph::new("f", 1, 1);
        let mut b = GraphBuilder::new(&mut graph);
        let entry = b.block();
        let header = b.join_block();
        let body = b.target_block();
        let exit = b.target_block();
        let zero = b.constant(Constant::Double(0.0));
        b.store_local(1, zero);
        b.goto(header);
        b.append_to(header);
        let p = b.load_local(0);
        b.branch_if(p, body, exit);
        b.append_to(body);
        let x = b.load_local(1);
        let step = b.constant(Constant::Double(1.5));
        let sum = b.build_inst(double_op(Token::Add, x, step));
        b.store_local(1, sum);
        b.goto(header);
        b.append_to(exit);
        let x = b.load_local(1);
        let ret = b.return_value(x);
        compute_ssa(&mut graph).unwrap();
        TypePropagation::run_on_graph(&ctx(), &mut graph);

        assert!(SelectRepresentations::run_on_graph(&ctx(), &mut graph));
        let phi = graph.arg(sum, 0);
        assert_eq!(graph.opcode(phi), Opcode::Phi);
        assert_eq!(graph.inst(phi).representation(), Representation::UnboxedDouble);

        // The initial value is unboxed at the end of the entry block.
        let entry_index = graph.pred_index(header, entry).unwrap();
        let initial = graph.arg(phi, entry_index);
        assert_eq!(graph.opcode(initial), Opcode::UnboxDouble);
        assert_eq!(graph.inst_block(initial), Some(entry));

        // The loop step is unboxed in front of the add; the sum flows into
        // the phi unchanged.
        assert_eq!(graph.opcode(graph.arg(sum, 1)), Opcode::UnboxDouble);
        let body_index = graph.pred_index(header, body).unwrap();
        assert_eq!(graph.arg(phi, body_index), sum);

        // Returning the value boxes it again.
        let boxed = graph.arg(ret, 0);
        assert_eq!(graph.opcode(boxed), Opcode::BoxDouble);
        assert_eq!(graph.arg(boxed, 0), phi);
    }

    #[test]
    fn smi_constant_becomes_double_constant() {
        let mut graph = FlowGraph::new("f", 1, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.load_local(0);
        let two = b.smi(2);
        let product = b.build_inst(double_op(Token::Mul, x, two));
        b.return_value(product);
        compute_ssa(&mut graph).unwrap();

        assert!(SelectRepresentations::run_on_graph(&ctx(), &mut graph));
        let unboxed = graph.arg(product, 1);
        assert_eq!(graph.opcode(unboxed), Opcode::UnboxDouble);
        assert_eq!(
            graph.constant_of(graph.arg(unboxed, 0)),
            Some(&Constant::Double(2.0))
        );
        assert_eq!(graph.opcode(graph.arg(product, 0)), Opcode::UnboxDouble);
    }

    #[test]
    fn mint_result_is_boxed_for_return() {
        let mut graph = FlowGraph::new("f", 2, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.load_local(0);
        let y = b.load_local(1);
        let sum = b.build_inst(InstData::binary_op(Opcode::BinaryMintOp, Token::Add, x, y));
        let ret = b.return_value(sum);
        compute_ssa(&mut graph).unwrap();

        assert!(SelectRepresentations::run_on_graph(&ctx(), &mut graph));
        assert_eq!(graph.opcode(graph.arg(sum, 0)), Opcode::UnboxInteger);
        assert_eq!(graph.opcode(graph.arg(sum, 1)), Opcode::UnboxInteger);
        let boxed = graph.arg(ret, 0);
        assert_eq!(graph.opcode(boxed), Opcode::BoxInteger);
        assert_eq!(graph.arg(boxed, 0), sum);
    }
}
