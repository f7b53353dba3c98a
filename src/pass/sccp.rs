// Copyright (c) 2017-2020 Fabian Schuiki

//! Sparse Conditional Constant Propagation

use crate::{
    analysis::{compute_dominators, discover_blocks},
    ir::{prelude::*, CompareKind, RecognizedMethod},
    opt::prelude::*,
    table::{SecondaryTable, TableKey},
};
use hibitset::BitSet;

/// Sparse Conditional Constant Propagation
///
/// Computes the constant value of every definition reachable from the entry,
/// taking only executable control flow edges into account. Afterwards,
/// unreachable blocks are dropped, branches with a dead successor become
/// jumps, and cheap constant values are rematerialized.
pub struct ConstantPropagation;

impl Pass for ConstantPropagation {
    fn run_on_graph(_ctx: &PassContext, graph: &mut FlowGraph) -> bool {
        let mut prop = Propagator::new(graph);
        prop.analyze(graph);
        prop.transform(graph)
    }
}

/// A lattice element.
#[derive(Clone, Debug, PartialEq)]
enum Value {
    /// Not yet known to be anything.
    Unknown,
    Const(Constant),
    NonConstant,
}

impl Value {
    /// The least upper bound of two values.
    fn join(self, other: &Value) -> Value {
        match (self, other) {
            (Value::Unknown, v) => v.clone(),
            (v, Value::Unknown) => v,
            (Value::Const(a), Value::Const(b)) if a == *b => Value::Const(a),
            _ => Value::NonConstant,
        }
    }

    fn bool(value: bool) -> Value {
        Value::Const(Constant::Bool(value))
    }
}

struct Propagator {
    values: SecondaryTable<Inst, Value>,
    reachable: BitSet,
    block_worklist: Vec<Block>,
    def_worklist: Vec<Inst>,
    def_marks: BitSet,
}

impl Propagator {
    fn new(graph: &FlowGraph) -> Self {
        Self {
            values: SecondaryTable::new(),
            reachable: BitSet::with_capacity(graph.block_id_bound() as u32),
            block_worklist: vec![],
            def_worklist: vec![],
            def_marks: BitSet::with_capacity(graph.inst_id_bound() as u32),
        }
    }

    fn is_reachable(&self, bb: Block) -> bool {
        self.reachable.contains(bb.index() as u32)
    }

    fn value(&self, def: Inst) -> &Value {
        self.values.get(def).unwrap_or(&Value::Unknown)
    }

    fn set_value(&mut self, graph: &FlowGraph, def: Inst, value: Value) {
        if *self.value(def) == value {
            return;
        }
        self.values.insert(def, value);
        if graph.has_input_uses(def) && !self.def_marks.add(def.index() as u32) {
            self.def_worklist.push(def);
        }
    }

    fn mark_reachable(&mut self, bb: Block) {
        if !self.reachable.add(bb.index() as u32) {
            self.block_worklist.push(bb);
        }
    }

    /// Run both worklists to a fixpoint.
    fn analyze(&mut self, graph: &FlowGraph) {
        self.mark_reachable(graph.graph_entry());
        loop {
            if let Some(bb) = self.block_worklist.pop() {
                self.visit_block(graph, bb);
            } else if let Some(def) = self.def_worklist.pop() {
                self.def_marks.remove(def.index() as u32);
                for use_ in graph.input_uses(def).to_vec() {
                    let reachable = graph
                        .inst_block(use_.user)
                        .map(|bb| self.is_reachable(bb))
                        .unwrap_or(false);
                    if reachable {
                        self.visit_inst(graph, use_.user);
                    }
                }
            } else {
                break;
            }
        }
    }

    fn visit_block(&mut self, graph: &FlowGraph, bb: Block) {
        trace!("Reached {}", bb);
        if bb == graph.graph_entry() {
            for &def in graph.initial_definitions() {
                self.visit_inst(graph, def);
            }
            for succ in graph.succs(bb) {
                self.mark_reachable(succ);
            }
            return;
        }
        for &phi in graph.phis(bb) {
            if graph.is_phi_alive(phi) {
                self.visit_phi(graph, phi);
            }
        }
        for inst in graph.insts(bb) {
            self.visit_inst(graph, inst);
        }
    }

    fn visit_phi(&mut self, graph: &FlowGraph, phi: Inst) {
        let bb = match graph.inst_block(phi) {
            Some(bb) => bb,
            None => return,
        };
        let mut value = Value::Unknown;
        for (&pred, &input) in graph.preds(bb).iter().zip(graph.args(phi)) {
            if self.is_reachable(pred) {
                value = value.join(self.value(input));
            }
        }
        self.set_value(graph, phi, value);
    }

    fn visit_inst(&mut self, graph: &FlowGraph, inst: Inst) {
        let value = match graph.inst(inst) {
            InstData::Phi { .. } => return self.visit_phi(graph, inst),
            InstData::Goto { target } => {
                let target = *target;
                // A new edge into a reachable join adds an input to its phis.
                if self.is_reachable(target) {
                    for &phi in graph.phis(target) {
                        if graph.is_phi_alive(phi) {
                            self.visit_phi(graph, phi);
                        }
                    }
                } else {
                    self.mark_reachable(target);
                }
                return;
            }
            InstData::Branch {
                comparison,
                targets,
            } => {
                match self.evaluate_comparison(graph, inst, comparison) {
                    Value::Const(Constant::Bool(true)) => self.mark_reachable(targets[0]),
                    Value::Const(_) => self.mark_reachable(targets[1]),
                    Value::Unknown | Value::NonConstant => {
                        self.mark_reachable(targets[0]);
                        self.mark_reachable(targets[1]);
                    }
                }
                return;
            }
            InstData::Constant { value } => Value::Const(value.clone()),
            InstData::Parameter { .. } => Value::NonConstant,
            InstData::PushArgument { args } => self.value(args[0]).clone(),
            InstData::Constraint { args, .. } => self.value(args[0]).clone(),
            InstData::Compare(c) => self.evaluate_comparison(graph, inst, c),
            InstData::BinaryOp {
                opcode: Opcode::BinarySmiOp,
                op,
                args,
                ..
            } => match (self.value(args[0]), self.value(args[1])) {
                (Value::NonConstant, _) | (_, Value::NonConstant) => Value::NonConstant,
                (Value::Const(l), Value::Const(r)) => match (l.as_smi(), r.as_smi()) {
                    (Some(l), Some(r)) => fold_smi_op(*op, l, r)
                        .map(|v| Value::Const(Constant::int(v)))
                        .unwrap_or(Value::NonConstant),
                    _ => Value::NonConstant,
                },
                _ => return,
            },
            InstData::Unary {
                opcode: Opcode::BooleanNegate,
                args,
            } => match self.value(args[0]) {
                Value::Const(Constant::Bool(b)) => Value::bool(!b),
                Value::Unknown => return,
                _ => Value::NonConstant,
            },
            InstData::LoadField {
                recognized: RecognizedMethod::ObjectArrayLength,
                args,
                ..
            } => match graph.inst(args[0]) {
                InstData::CreateArray { arguments } => {
                    Value::Const(Constant::Smi(arguments.len() as i64))
                }
                _ => Value::NonConstant,
            },
            InstData::StoreField { .. } | InstData::StoreIndexed { .. } => Value::NonConstant,
            data if !data.is_definition() => return,
            data => {
                let args = data.args();
                if args.iter().any(|&a| *self.value(a) == Value::NonConstant) {
                    Value::NonConstant
                } else if args.iter().any(|&a| *self.value(a) == Value::Unknown) {
                    return;
                } else {
                    Value::NonConstant
                }
            }
        };
        self.set_value(graph, inst, value);
    }

    /// The value of a comparison, standing alone or embedded in a branch.
    fn evaluate_comparison(&self, graph: &FlowGraph, inst: Inst, c: &Comparison) -> Value {
        let left = self.value(c.args[0]);
        let right = self.value(c.args[1]);
        match c.kind {
            CompareKind::Strict => {
                let negate = c.op == Token::NeStrict;
                match (left, right) {
                    (Value::Const(l), Value::Const(r)) => Value::bool((l == r) != negate),
                    (Value::NonConstant, _) | (_, Value::NonConstant) => {
                        // Comparing against null decides the comparison if the
                        // class of the other operand is known.
                        let known = |index| match graph.use_cid(inst, index) {
                            ClassId::DYNAMIC | ClassId::ILLEGAL => None,
                            cid => Some(cid),
                        };
                        let other = match (left, right) {
                            (Value::Const(Constant::Null), _) => known(1),
                            (_, Value::Const(Constant::Null)) => known(0),
                            _ => None,
                        };
                        match other {
                            Some(cid) => Value::bool((cid == ClassId::NULL) != negate),
                            None => Value::NonConstant,
                        }
                    }
                    _ => Value::Unknown,
                }
            }
            CompareKind::Equality | CompareKind::Relational => match (left, right) {
                (Value::Const(l), Value::Const(r)) => match (l.as_int(), r.as_int()) {
                    (Some(l), Some(r)) => match c.op {
                        Token::Eq => Value::bool(l == r),
                        Token::Ne => Value::bool(l != r),
                        Token::Lt => Value::bool(l < r),
                        Token::Gt => Value::bool(l > r),
                        Token::Lte => Value::bool(l <= r),
                        Token::Gte => Value::bool(l >= r),
                        _ => Value::NonConstant,
                    },
                    _ => Value::NonConstant,
                },
                (Value::Unknown, _) | (_, Value::Unknown) => Value::Unknown,
                _ => Value::NonConstant,
            },
        }
    }

    /// Rewrite the graph according to the analysis results.
    fn transform(&self, graph: &mut FlowGraph) -> bool {
        let mut modified = false;
        let blocks = graph.reverse_postorder().to_vec();

        // Rematerialize cheap constants while the use lists still match the
        // uncompacted phi inputs.
        for &bb in &blocks {
            if !self.is_reachable(bb) || bb == graph.graph_entry() {
                continue;
            }
            for inst in graph.insts_vec(bb) {
                let value = match self.value(inst) {
                    Value::Const(c) if c.is_cheap() => c.clone(),
                    _ => continue,
                };
                match graph.opcode(inst) {
                    Opcode::Constant
                    | Opcode::PushArgument
                    | Opcode::StoreField
                    | Opcode::StoreIndexed => continue,
                    _ => (),
                }
                trace!("Constant {} = {}", inst, value);
                let constant = graph.add_inst(InstData::Constant { value });
                graph.insert_before(inst, constant);
                graph.ensure_ssa_index(constant, inst);
                graph.replace_uses_with(inst, constant);
                graph.remove_inst(inst);
                modified = true;
            }
        }

        let mut redundant_phis = vec![];
        for &bb in &blocks {
            if !self.is_reachable(bb) {
                trace!("Unreachable {}", bb);
                modified = true;
                continue;
            }

            // Drop the phi inputs of unreachable predecessors. Predecessors
            // are rediscovered in block index order, which the surviving
            // inputs already follow.
            if graph.is_join(bb) {
                let live: Vec<usize> = graph
                    .preds(bb)
                    .iter()
                    .enumerate()
                    .filter(|&(_, &pred)| self.is_reachable(pred))
                    .map(|(index, _)| index)
                    .collect();
                let pred_count = graph.preds(bb).len();
                for phi in graph.phis(bb).to_vec() {
                    if live.len() < pred_count {
                        if let InstData::Phi { args, .. } = &mut graph[phi].data {
                            *args = live.iter().map(|&index| args[index]).collect();
                        }
                    }
                    if graph.args(phi).len() <= 1 {
                        redundant_phis.push(phi);
                    }
                }
            }

            // Replace branches with a dead successor by jumps.
            let branch = match graph.last_inst(bb) {
                Some(inst) if graph.opcode(inst) == Opcode::Branch => inst,
                _ => continue,
            };
            let targets = [graph.inst(branch).blocks()[0], graph.inst(branch).blocks()[1]];
            let live = match (self.is_reachable(targets[0]), self.is_reachable(targets[1])) {
                (true, false) => targets[0],
                (false, true) => targets[1],
                _ => continue,
            };
            trace!("Replacing {} by a jump to {}", branch, live);
            // The jump resumes at the branch's deoptimization point, so code
            // hoisted in front of it can still deoptimize.
            let jump = graph.add_inst(InstData::Goto { target: live });
            graph.copy_deopt_target(jump, branch);
            graph.remove_inst(branch);
            graph.append_inst(bb, jump);
            graph[live].kind = BlockKind::Join;
            modified = true;
        }

        discover_blocks(graph);
        compute_dominators(graph);
        graph.compute_use_lists();

        for phi in redundant_phis {
            let replacement = match graph.args(phi).first() {
                Some(&input) => input,
                None => continue,
            };
            trace!("Removing redundant phi {}", phi);
            graph.replace_uses_with(phi, replacement);
            graph.remove_phi(phi);
            modified = true;
        }
        debug!("Propagated constants in {}", graph.name);
        modified
    }
}

/// Evaluate a small integer operation on constant operands.
///
/// Returns `None` if the operation throws or its result does not fit into 64
/// bits.
fn fold_smi_op(op: Token, left: i64, right: i64) -> Option<i64> {
    match op {
        Token::Add => left.checked_add(right),
        Token::Sub => left.checked_sub(right),
        Token::Mul => left.checked_mul(right),
        Token::TruncDiv => left.checked_div(right),
        Token::Mod => {
            let r = left.checked_rem(right)?;
            if r >= 0 {
                Some(r)
            } else if right < 0 {
                Some(r - right)
            } else {
                Some(r + right)
            }
        }
        Token::Shl if right >= 0 && right < 64 => {
            let result = left.checked_shl(right as u32)?;
            if result >> right == left {
                Some(result)
            } else {
                None
            }
        }
        Token::Shr if right >= 0 => Some(left >> right.min(63)),
        Token::BitAnd => Some(left & right),
        Token::BitOr => Some(left | right),
        Token::BitXor => Some(left ^ right),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::OptimizerConfig, ssa::compute_ssa};

    fn ctx() -> PassContext {
        PassContext::new(OptimizerConfig::default(), Default::default())
    }

    #[test]
    fn join_is_monotonic() {
        let one = Value::Const(Constant::Smi(1));
        let two = Value::Const(Constant::Smi(2));
        assert_eq!(Value::Unknown.join(&one), one);
        assert_eq!(one.clone().join(&Value::Unknown), one);
        assert_eq!(one.clone().join(&one), one);
        assert_eq!(one.clone().join(&two), Value::NonConstant);
        assert_eq!(Value::NonConstant.join(&one), Value::NonConstant);
    }

    #[test]
    fn smi_folding() {
        assert_eq!(fold_smi_op(Token::Add, 3, 4), Some(7));
        assert_eq!(fold_smi_op(Token::Mod, -7, 3), Some(2));
        assert_eq!(fold_smi_op(Token::Mod, -7, -3), Some(2));
        assert_eq!(fold_smi_op(Token::TruncDiv, 1, 0), None);
        assert_eq!(fold_smi_op(Token::Shl, 1, 4), Some(16));
        assert_eq!(fold_smi_op(Token::Shl, 1, 64), None);
        assert_eq!(fold_smi_op(Token::Shr, -8, 100), Some(-1));
    }

    /// `if (k) { return 1 } else { return 2 }` with a constant `k`.
    fn constant_branch(k: bool) -> (FlowGraph, Inst, [Block; 2]) {
        let mut graph = FlowGraph::new("f", 0, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let then_bb = b.target_block();
        let else_bb = b.target_block();
        let cond = b.constant(Constant::Bool(k));
        let branch = b.branch_if(cond, then_bb, else_bb);
        for (bb, v) in [(then_bb, 1), (else_bb, 2)].iter().cloned() {
            b.append_to(bb);
            let c = b.smi(v);
            b.return_value(c);
        }
        compute_ssa(&mut graph).unwrap();
        (graph, branch, [then_bb, else_bb])
    }

    #[test]
    fn constant_branch_becomes_jump() {
        let _ = env_logger::try_init();
        let (mut graph, branch, [then_bb, else_bb]) = constant_branch(true);
        assert!(ConstantPropagation::run_on_graph(&ctx(), &mut graph));
        assert!(!graph.is_inst_inserted(branch));
        let entry = graph.normal_entry();
        let last = graph.last_inst(entry).unwrap();
        assert_eq!(graph.inst(last), &InstData::Goto { target: then_bb });
        assert!(graph.is_join(then_bb));
        assert!(!graph.preorder().contains(&else_bb));
        assert!(!graph.reverse_postorder().contains(&else_bb));
        assert_eq!(graph[then_bb].dominator, Some(entry));
        assert!(graph[entry].dominated.iter().all(|&bb| bb != else_bb));
    }

    #[test]
    fn jump_keeps_deoptimization_point_of_branch() {
        let (mut graph, branch, _) = constant_branch(true);
        let env = graph.env(branch).cloned();
        let deopt_id = graph[branch].deopt_id;
        assert!(env.is_some());
        assert!(deopt_id.is_some());

        ConstantPropagation::run_on_graph(&ctx(), &mut graph);
        let jump = graph.last_inst(graph.normal_entry()).unwrap();
        assert_eq!(graph.opcode(jump), Opcode::Goto);
        assert_eq!(graph.env(jump).cloned(), env);
        assert_eq!(graph[jump].deopt_id, deopt_id);
    }

    #[test]
    fn false_branch_keeps_else() {
        let (mut graph, _, [then_bb, else_bb]) = constant_branch(false);
        ConstantPropagation::run_on_graph(&ctx(), &mut graph);
        assert!(graph.preorder().contains(&else_bb));
        assert!(!graph.preorder().contains(&then_bb));
    }

    #[test]
    fn phi_of_dead_edge_is_removed() {
        // x = 1; if (true) { x = 2 } return x + 0;
        let mut graph = FlowGraph::new("f", 0, 1);
        let mut b = GraphBuilder::new(&mut graph);
        let then_bb = b.target_block();
        let else_bb = b.target_block();
        let join = b.join_block();
        let one = b.smi(1);
        b.store_local(0, one);
        let t = b.constant(Constant::Bool(true));
        b.branch_if(t, then_bb, else_bb);
        b.append_to(then_bb);
        let two = b.smi(2);
        b.store_local(0, two);
        b.goto(join);
        b.append_to(else_bb);
        b.goto(join);
        b.append_to(join);
        let x = b.load_local(0);
        let zero = b.smi(0);
        let sum = b.build_inst(InstData::binary_smi_op(Token::Add, x, zero));
        let ret = b.return_value(sum);
        compute_ssa(&mut graph).unwrap();
        assert_eq!(graph.phis(join).len(), 1);

        assert!(ConstantPropagation::run_on_graph(&ctx(), &mut graph));
        assert!(graph.phis(join).is_empty());
        assert_eq!(graph.preds(join), &[then_bb]);
        // The sum folds to 2 and is rematerialized as a constant.
        let result = graph.arg(ret, 0);
        assert_eq!(graph.smi_constant_of(result), Some(2));
        assert!(!graph.is_inst_inserted(sum));
    }

    #[test]
    fn null_comparison_with_known_class() {
        let mut graph = FlowGraph::new("f", 1, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.load_local(0);
        let n = b.null();
        let cmp = b.compare(Comparison::strict(Token::EqStrict, x, n));
        b.return_value(cmp);
        compute_ssa(&mut graph).unwrap();
        let param = graph.initial_definitions()[1];
        graph.set_cid(param, ClassId::SMI);

        let mut prop = Propagator::new(&graph);
        prop.analyze(&graph);
        assert_eq!(prop.value(cmp), &Value::bool(false));
        assert_eq!(prop.value(param), &Value::NonConstant);
    }

    #[test]
    fn loop_counter_is_not_constant() {
        // i = 0; while (i < 10) { i = i + 1 } return i;
        let mut graph = FlowGraph::new("f", 0, 1);
        let mut b = GraphBuilder::new(&mut graph);
        let header = b.join_block();
        let body = b.target_block();
        let exit = b.target_block();
        let zero = b.smi(0);
        b.store_local(0, zero);
        b.goto(header);
        b.append_to(header);
        let i = b.load_local(0);
        let ten = b.smi(10);
        let mut cmp = Comparison::relational(Token::Lt, i, ten, None);
        cmp.operands_cid = ClassId::SMI;
        b.branch(cmp, body, exit);
        b.append_to(body);
        let i = b.load_local(0);
        let one = b.smi(1);
        let next = b.build_inst(InstData::binary_smi_op(Token::Add, i, one));
        b.store_local(0, next);
        b.goto(header);
        b.append_to(exit);
        let i = b.load_local(0);
        b.return_value(i);
        compute_ssa(&mut graph).unwrap();

        let mut prop = Propagator::new(&graph);
        prop.analyze(&graph);
        let phi = graph.phis(header)[0];
        assert_eq!(prop.value(phi), &Value::NonConstant);
        assert!(prop.is_reachable(body));
        assert!(prop.is_reachable(exit));
    }
}
