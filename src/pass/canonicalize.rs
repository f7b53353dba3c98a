// Copyright (c) 2017-2020 Fabian Schuiki

//! Canonicalization

use crate::ir::{prelude::*, CompareKind, Representation, Use};
use crate::opt::prelude::*;

/// Canonicalization
///
/// Applies the local simplification rule of every instruction once. An
/// instruction is either removed outright (redundant checks) or replaced by
/// an existing definition that computes the same value.
pub struct Canonicalize;

impl Pass for Canonicalize {
    fn run_on_inst(ctx: &PassContext, inst: Inst, graph: &mut FlowGraph) -> bool {
        match canonicalize(ctx, graph, inst) {
            Some(Rewrite::Remove) => {
                trace!("Removing redundant {} {}", graph.opcode(inst), inst);
                graph.remove_inst(inst);
                true
            }
            Some(Rewrite::Replace(def)) => {
                trace!("Replacing {} {} by {}", graph.opcode(inst), inst, def);
                graph.ensure_ssa_index(def, inst);
                graph.replace_with_existing(inst, def);
                true
            }
            Some(Rewrite::Modified) => true,
            None => false,
        }
    }
}

/// The outcome of canonicalizing an instruction.
enum Rewrite {
    /// The instruction has no effect and no uses.
    Remove,
    /// The instruction computes the same value as an existing definition.
    Replace(Inst),
    /// The instruction was simplified in place.
    Modified,
}

fn canonicalize(ctx: &PassContext, graph: &mut FlowGraph, inst: Inst) -> Option<Rewrite> {
    match graph.opcode(inst) {
        Opcode::BinarySmiOp => canonicalize_binary_op(graph, inst, ClassId::SMI),
        Opcode::BinaryMintOp => canonicalize_binary_op(graph, inst, ClassId::MINT),
        Opcode::BinaryDoubleOp => canonicalize_binary_op(graph, inst, ClassId::DOUBLE),
        Opcode::AssertBoolean => {
            if graph.use_cid(inst, 0) == ClassId::BOOL {
                Some(Rewrite::Replace(graph.arg(inst, 0)))
            } else {
                None
            }
        }
        Opcode::AssertAssignable => canonicalize_assert_assignable(ctx, graph, inst),
        Opcode::StrictCompare => strict_compare_replacement(graph, inst).map(Rewrite::Replace),
        Opcode::Branch => merge_comparison_into_branch(graph, inst),
        Opcode::CheckClass => {
            let value_cid = graph.use_cid(inst, 0);
            match graph.inst(inst) {
                InstData::CheckClass { checks, .. }
                    if value_cid != ClassId::DYNAMIC && checks.has_receiver_class_id(value_cid) =>
                {
                    Some(Rewrite::Remove)
                }
                _ => None,
            }
        }
        Opcode::CheckSmi => {
            if graph.use_cid(inst, 0) == ClassId::SMI {
                Some(Rewrite::Remove)
            } else {
                None
            }
        }
        Opcode::CheckEitherNonSmi => {
            if graph.use_cid(inst, 0) == ClassId::DOUBLE || graph.use_cid(inst, 1) == ClassId::DOUBLE
            {
                Some(Rewrite::Remove)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// The integer value of a constant, accepting doubles without a fraction.
fn integer_constant(graph: &FlowGraph, def: Inst) -> Option<i64> {
    match graph.constant_of(def)? {
        Constant::Double(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => Some(*v as i64),
        c => c.as_int(),
    }
}

fn canonicalize_binary_op(graph: &FlowGraph, inst: Inst, cid: ClassId) -> Option<Rewrite> {
    let (op, left, right) = match *graph.inst(inst) {
        InstData::BinaryOp { op, args, .. } => (op, args[0], args[1]),
        _ => return None,
    };
    commutative_identity(graph, op, cid, left, right)
        .or_else(|| commutative_identity(graph, op, cid, right, left))
        .map(Rewrite::Replace)
}

/// Simplify `constant op other` for commutative operators.
fn commutative_identity(
    graph: &FlowGraph,
    op: Token,
    cid: ClassId,
    constant: Inst,
    other: Inst,
) -> Option<Inst> {
    let value = integer_constant(graph, constant)?;
    let is_double = cid == ClassId::DOUBLE;
    match (op, value) {
        // The other operand must already be a double for the identity to
        // hold without an implicit conversion.
        (Token::Mul, 1) if is_double => {
            if graph.inst(other).representation() == Representation::UnboxedDouble {
                Some(other)
            } else {
                None
            }
        }
        (Token::Mul, 1) => Some(other),
        // 0.0 * NaN is NaN, and 0.0 + -0.0 is 0.0.
        (Token::Mul, 0) if !is_double => Some(constant),
        (Token::Add, 0) if !is_double => Some(other),
        (Token::BitAnd, 0) => Some(constant),
        (Token::BitAnd, -1) => Some(other),
        (Token::BitOr, 0) => Some(other),
        (Token::BitOr, -1) => Some(constant),
        (Token::BitXor, 0) => Some(other),
        _ => None,
    }
}

fn canonicalize_assert_assignable(
    ctx: &PassContext,
    graph: &FlowGraph,
    inst: Inst,
) -> Option<Rewrite> {
    let (ty, value) = match *graph.inst(inst) {
        InstData::AssertAssignable { ty, args } => (ty, args[0]),
        _ => return None,
    };
    let cid = graph.use_cid(inst, 0);
    let redundant = match ty {
        ClassId::INT => cid == ClassId::SMI || cid == ClassId::MINT,
        ClassId::DOUBLE => cid == ClassId::DOUBLE,
        ClassId::BOOL => cid == ClassId::BOOL,
        _ => cid != ClassId::DYNAMIC && cid != ClassId::ILLEGAL && ctx.classes.is_assignable(cid, ty),
    };
    if redundant {
        return Some(Rewrite::Replace(value));
    }
    match *graph.inst(value) {
        InstData::AssertAssignable { ty: inner, .. } if inner == ty => Some(Rewrite::Replace(value)),
        _ => None,
    }
}

/// The definition a strict comparison `e === true` reduces to, if `e` is
/// known to be a boolean.
fn strict_compare_replacement(graph: &FlowGraph, inst: Inst) -> Option<Inst> {
    let comparison = graph.inst(inst).comparison()?;
    if comparison.kind != CompareKind::Strict || comparison.op != Token::EqStrict {
        return None;
    }
    let (left, right) = (comparison.args[0], comparison.args[1]);
    if graph.constant_of(right) != Some(&Constant::Bool(true)) {
        return None;
    }
    if graph.use_cid(inst, 0) == ClassId::BOOL {
        Some(left)
    } else {
        None
    }
}

/// Fold a comparison into the branch that tests its result.
///
/// A branch on `c === true` where `c` is a comparison only used by the
/// branch tests `c` directly.
fn merge_comparison_into_branch(graph: &mut FlowGraph, branch: Inst) -> Option<Rewrite> {
    let compare = strict_compare_replacement(graph, branch)?;
    let comparison = match graph.inst(compare) {
        InstData::Compare(c) => c.clone(),
        _ => return None,
    };
    let uses = graph.input_uses(compare);
    if uses.len() != 1 || uses[0] != (Use { user: branch, index: 0 }) {
        return None;
    }
    if !graph.env_uses(compare).is_empty() {
        return None;
    }
    // A comparison that may call out must not move across other effects.
    if comparison.is_generic() && !only_pure_insts_between(graph, compare, branch) {
        return None;
    }
    trace!("Merging comparison {} into {}", compare, branch);
    graph.set_arg(branch, 0, comparison.args[0]);
    graph.set_arg(branch, 1, comparison.args[1]);
    if let Some(c) = graph[branch].data.comparison_mut() {
        let args = c.args;
        *c = Comparison {
            args,
            ..comparison.clone()
        };
    }
    if comparison.is_generic() {
        graph.copy_deopt_target(branch, compare);
    }
    graph.remove_inst(compare);
    Some(Rewrite::Modified)
}

fn only_pure_insts_between(graph: &FlowGraph, first: Inst, last: Inst) -> bool {
    let mut current = graph.next_inst(first);
    while let Some(inst) = current {
        if inst == last {
            return true;
        }
        let data = graph.inst(inst);
        if data.has_side_effect() || data.can_deoptimize() {
            return false;
        }
        current = graph.next_inst(inst);
    }
    false
}
