// Copyright (c) 2017-2020 Fabian Schuiki

//! Range Analysis and Bounds Check Elimination

use crate::{
    analysis::{compute_loops, loop_contains},
    ir::{
        is_valid_smi, length_offset_for, prelude::*, CompareKind, Range, RangeBoundary,
        RecognizedMethod,
        ARRAY_MAX_ELEMENTS, SMI_MAX, SMI_MIN, STRING_MAX_ELEMENTS,
    },
    opt::prelude::*,
    table::TableKey,
};
use hibitset::BitSet;
use std::collections::HashMap;

/// Range Analysis
///
/// Computes symbolic ranges for the small integer values of a graph and
/// removes array bounds checks whose index provably lies within the array.
///
/// The analysis runs in four steps:
///
/// 1. Collect the definitions proven to be small integers.
/// 2. Insert `Constraint` instructions after small integer checks, on the
///    edges of comparison branches, and after bounds checks. Every use
///    dominated by the constraint is renamed to refer to it.
/// 3. Walk the dominator tree and infer the range of every value. Loop
///    header phis are recognized as induction variables where possible.
///    Redundant bounds checks are removed along the way.
/// 4. Remove the constraints again.
pub struct RangeAnalysis;

impl Pass for RangeAnalysis {
    fn run_on_graph(ctx: &PassContext, graph: &mut FlowGraph) -> bool {
        compute_loops(graph);
        let mut analysis = RangeAnalyzer::new(ctx);
        analysis.collect_smi_values(graph);
        analysis.insert_constraints(graph);
        analysis.infer_ranges(graph);
        analysis.remove_constraints(graph);
        debug!(
            "Inferred ranges in {} ({} constraints, {} bounds checks removed)",
            graph.name,
            analysis.constraints.len(),
            analysis.removed_checks
        );
        analysis.removed_checks > 0 || analysis.cleared_overflows > 0
    }
}

/// Upper limit on the length of symbol chains followed while comparing
/// boundaries.
const MAX_SYMBOL_DEPTH: usize = 64;

/// A point in the graph after which a constraint holds.
#[derive(Copy, Clone, Debug)]
enum Position {
    BlockStart(Block),
    After(Inst),
}

struct RangeAnalyzer<'a> {
    ctx: &'a PassContext,
    smi_values: Vec<Inst>,
    smi_checks: Vec<Inst>,
    constraints: Vec<Inst>,
    smi_definitions: BitSet,
    array_lengths: HashMap<Inst, RangeBoundary>,
    length_loads: Vec<Inst>,
    removed_checks: usize,
    cleared_overflows: usize,
}

impl<'a> RangeAnalyzer<'a> {
    fn new(ctx: &'a PassContext) -> Self {
        Self {
            ctx,
            smi_values: vec![],
            smi_checks: vec![],
            constraints: vec![],
            smi_definitions: BitSet::new(),
            array_lengths: HashMap::new(),
            length_loads: vec![],
            removed_checks: 0,
            cleared_overflows: 0,
        }
    }

    fn collect_smi_values(&mut self, graph: &mut FlowGraph) {
        for def in graph.definitions() {
            graph[def].range = None;
        }
        for bb in graph.reverse_postorder().to_vec() {
            for inst in graph.insts(bb) {
                let data = graph.inst(inst);
                if data.is_definition() {
                    if graph.cid(inst) == ClassId::SMI && graph.ssa_index(inst).is_some() {
                        self.smi_values.push(inst);
                    }
                } else if data.opcode() == Opcode::CheckSmi {
                    self.smi_checks.push(inst);
                }
            }
            for &phi in graph.phis(bb) {
                if graph.is_phi_alive(phi) && graph.cid(phi) == ClassId::SMI {
                    self.smi_values.push(phi);
                }
            }
        }
    }

    fn insert_constraints(&mut self, graph: &mut FlowGraph) {
        for check in self.smi_checks.clone() {
            let value = graph.arg(check, 0);
            self.insert_constraint_for(graph, value, Range::unknown(), Position::After(check), None);
        }
        for def in self.smi_values.clone() {
            self.insert_constraints_for(graph, def);
        }
        // Constrained values may be constrained further.
        let mut i = 0;
        while i < self.constraints.len() {
            let constraint = self.constraints[i];
            self.insert_constraints_for(graph, constraint);
            i += 1;
        }
    }

    /// Constrain a value after the branches and bounds checks using it.
    fn insert_constraints_for(&mut self, graph: &mut FlowGraph, def: Inst) {
        for use_ in graph.input_uses(def).to_vec() {
            // Earlier constraints may have renamed the use already.
            if graph.inst_block(use_.user).is_none() || graph.arg(use_.user, use_.index) != def {
                continue;
            }
            match graph.opcode(use_.user) {
                Opcode::Branch => self.constrain_after_branch(graph, def, use_),
                Opcode::CheckArrayBound if use_.index == 1 => {
                    self.constrain_after_bounds_check(graph, def, use_.user)
                }
                _ => (),
            }
        }
    }

    fn constrain_after_branch(&mut self, graph: &mut FlowGraph, def: Inst, use_: Use) {
        let (comparison, targets) = match graph.inst(use_.user) {
            InstData::Branch {
                comparison,
                targets,
            } => (comparison.clone(), *targets),
            _ => return,
        };
        if comparison.kind == CompareKind::Strict || comparison.operands_cid != ClassId::SMI {
            return;
        }
        let (boundary, op) = if use_.index == 0 {
            (comparison.args[1], comparison.op)
        } else {
            (comparison.args[0], comparison.op.flip_comparison())
        };
        let true_range = match constraint_range(graph, op, boundary) {
            Some(range) => range,
            None => return,
        };
        let false_range = match constraint_range(graph, op.negate_comparison(), boundary) {
            Some(range) => range,
            None => return,
        };
        self.insert_constraint_for(
            graph,
            def,
            true_range,
            Position::BlockStart(targets[0]),
            Some(boundary),
        );
        self.insert_constraint_for(
            graph,
            def,
            false_range,
            Position::BlockStart(targets[1]),
            Some(boundary),
        );
    }

    fn constrain_after_bounds_check(&mut self, graph: &mut FlowGraph, def: Inst, check: Inst) {
        let array_cid = match graph.inst(check) {
            InstData::CheckArrayBound { array_cid, .. } => *array_cid,
            _ => return,
        };
        if !has_fixed_length(array_cid) {
            return;
        }
        let length = self.array_length(graph, check);
        let max = match length {
            RangeBoundary::Constant(v) => RangeBoundary::Constant(v - 1),
            RangeBoundary::Symbol(symbol, offset) => RangeBoundary::Symbol(symbol, offset - 1),
            RangeBoundary::Unknown => RangeBoundary::max_smi(),
        };
        let range = Range::new(RangeBoundary::Constant(0), max);
        self.insert_constraint_for(graph, def, range, Position::After(check), None);
    }

    /// Insert a constraint on `def` and rename the uses it dominates.
    ///
    /// The optional dependency becomes a second input of the constraint.
    /// Constants are not constrained.
    fn insert_constraint_for(
        &mut self,
        graph: &mut FlowGraph,
        def: Inst,
        range: Range,
        position: Position,
        dependency: Option<Inst>,
    ) -> Option<Inst> {
        if graph.constant_of(def).is_some() {
            return None;
        }
        let mut args = vec![def];
        if let Some(dependency) = dependency {
            if graph.constant_of(dependency).is_none() {
                args.push(dependency);
            }
        }
        let constraint = graph.add_inst(InstData::Constraint { range, args });
        rename_dominated_uses(graph, def, position, constraint);
        match position {
            Position::BlockStart(bb) => graph.prepend_inst(bb, constraint),
            Position::After(inst) => graph.insert_after(inst, constraint),
        }
        graph.alloc_ssa_index(constraint);
        trace!("Constraining {} to {} at {:?}", def, range, position);
        self.constraints.push(constraint);
        Some(constraint)
    }

    /// The length of the array checked by a bounds check.
    ///
    /// Lengths are shared between all checks of the same array. Arrays
    /// allocated with a known length reuse that length. Otherwise a length
    /// load is synthesized; it is never placed in the graph and only serves
    /// as a symbol in range boundaries.
    fn array_length(&mut self, graph: &mut FlowGraph, check: Inst) -> RangeBoundary {
        let (array_cid, array) = match graph.inst(check) {
            InstData::CheckArrayBound { array_cid, args } => (*array_cid, args[0]),
            _ => return RangeBoundary::Unknown,
        };
        if let Some(&length) = self.array_lengths.get(&array) {
            return length;
        }
        let length = match graph.inst(array) {
            InstData::StaticCall {
                arguments,
                result_cid: ClassId::ARRAY,
                ..
            } if !arguments.is_empty() => {
                let pushed = arguments[arguments.len() - 1];
                let value = graph.arg(pushed, 0);
                from_definition(graph, value, 0)
            }
            InstData::CreateArray { arguments } => RangeBoundary::Constant(arguments.len() as i64),
            InstData::Constant {
                value: Constant::Array(elements),
            } => RangeBoundary::Constant(elements.len() as i64),
            _ => self.synthesize_length_load(graph, array, array_cid),
        };
        self.array_lengths.insert(array, length);
        length
    }

    fn synthesize_length_load(
        &mut self,
        graph: &mut FlowGraph,
        array: Inst,
        array_cid: ClassId,
    ) -> RangeBoundary {
        let offset = match length_offset_for(array_cid) {
            Some(offset) => offset,
            None => return RangeBoundary::Unknown,
        };
        let recognized = match array_cid {
            ClassId::ARRAY => RecognizedMethod::ObjectArrayLength,
            ClassId::IMMUTABLE_ARRAY => RecognizedMethod::ImmutableArrayLength,
            c if c.is_string() => RecognizedMethod::StringBaseLength,
            _ => RecognizedMethod::ByteArrayBaseLength,
        };
        let load = graph.add_inst(InstData::LoadField {
            offset,
            result_cid: ClassId::SMI,
            recognized,
            immutable: true,
            args: [array],
        });
        graph.alloc_ssa_index(load);
        graph[load].range = Some(length_range(recognized));
        self.length_loads.push(load);
        RangeBoundary::Symbol(load, 0)
    }

    fn is_smi_definition(&self, def: Inst) -> bool {
        self.smi_definitions.contains(def.index() as u32)
    }

    fn infer_ranges(&mut self, graph: &mut FlowGraph) {
        for &def in self.smi_values.iter().chain(self.constraints.iter()) {
            self.smi_definitions.add(def.index() as u32);
        }
        let mut stack = vec![graph.graph_entry()];
        while let Some(bb) = stack.pop() {
            self.infer_block(graph, bb);
            stack.extend(graph[bb].dominated.iter().rev().cloned());
        }
    }

    fn infer_block(&mut self, graph: &mut FlowGraph, bb: Block) {
        if bb == graph.graph_entry() {
            for def in graph.initial_definitions().to_vec() {
                if let Some(value) = graph.smi_constant_of(def) {
                    graph[def].range = Some(Range::constant(value));
                }
            }
        }

        if graph.is_join(bb) {
            let is_loop_header = graph[bb].loop_info.is_some();
            for phi in graph.phis(bb).to_vec() {
                if !graph.is_phi_alive(phi) || !self.is_smi_definition(phi) {
                    continue;
                }
                if is_loop_header {
                    if let Some(range) = infer_induction_variable_range(graph, bb, phi) {
                        trace!("Induction variable {} in {}", phi, range);
                        graph[phi].range = Some(range);
                        continue;
                    }
                }
                let range = infer_phi_range(graph, phi);
                graph[phi].range = Some(range);
            }
        }

        for inst in graph.insts_vec(bb) {
            if self.is_smi_definition(inst) {
                self.infer_definition_range(graph, inst);
            } else if self.ctx.config.array_bounds_check_elimination
                && graph.opcode(inst) == Opcode::CheckArrayBound
            {
                let length = self.array_length(graph, inst);
                if is_redundant_bounds_check(graph, inst, length) {
                    trace!("Removing redundant bounds check {}", inst);
                    graph.remove_inst(inst);
                    self.removed_checks += 1;
                }
            }
        }
    }

    fn infer_definition_range(&mut self, graph: &mut FlowGraph, def: Inst) {
        let range = match graph.inst(def) {
            InstData::Constant { value } => match value.as_smi() {
                Some(v) => Range::constant(v),
                None => Range::unknown(),
            },
            InstData::Constraint { range, args } => {
                let value_range = graph[args[0]].range;
                infer_constraint_range(graph, *range, value_range)
            }
            InstData::BinaryOp {
                opcode: Opcode::BinarySmiOp,
                op,
                args,
                overflow,
            } => {
                let (op, args, overflow) = (*op, *args, *overflow);
                let (range, can_overflow) = infer_binary_smi_op_range(graph, op, args);
                if overflow && can_overflow == Some(false) {
                    trace!("{} cannot overflow", def);
                    if let InstData::BinaryOp { overflow, .. } = &mut graph[def].data {
                        *overflow = false;
                    }
                    self.cleared_overflows += 1;
                }
                range
            }
            InstData::LoadField { recognized, .. } => length_range(*recognized),
            InstData::LoadIndexed { class_id, .. } => match *class_id {
                ClassId::INT8_ARRAY => Range::between(-128, 127),
                ClassId::UINT8_ARRAY
                | ClassId::UINT8_CLAMPED_ARRAY
                | ClassId::EXTERNAL_UINT8_ARRAY
                | ClassId::ONE_BYTE_STRING => Range::between(0, 0xff),
                ClassId::INT16_ARRAY => Range::between(-32768, 32767),
                ClassId::UINT16_ARRAY | ClassId::TWO_BYTE_STRING => Range::between(0, 0xffff),
                _ => Range::unknown(),
            },
            _ => Range::unknown(),
        };
        graph[def].range = Some(range);
    }

    /// Replace every constraint by the value it constrains.
    fn remove_constraints(&mut self, graph: &mut FlowGraph) {
        let unwrapped: HashMap<Inst, Inst> = self
            .constraints
            .iter()
            .map(|&c| (c, unwrap_constraint(graph, c)))
            .collect();
        for &constraint in &self.constraints {
            graph.replace_uses_with(constraint, unwrapped[&constraint]);
        }
        for &constraint in &self.constraints {
            graph.remove_inst(constraint);
        }

        // Boundaries must not refer to the removed constraints, nor to the
        // length loads that were never placed. The latter widen to the
        // constant bounds of the length.
        let length_loads = &self.length_loads;
        let rewrite = |graph: &FlowGraph, boundary: RangeBoundary, upper: bool| {
            let boundary = match boundary {
                RangeBoundary::Symbol(symbol, offset) => match unwrapped.get(&symbol) {
                    Some(&def) => from_definition(graph, def, offset),
                    None => boundary,
                },
                b => b,
            };
            match boundary {
                RangeBoundary::Symbol(symbol, _) if length_loads.contains(&symbol) => {
                    resolve_bound(graph, boundary, upper)
                }
                b => b,
            }
        };
        for def in graph.definitions() {
            if let Some(range) = graph[def].range {
                let min = rewrite(graph, range.min, false);
                let max = rewrite(graph, range.max, true);
                graph[def].range = Some(Range::new(min, max));
            }
        }
    }
}

/// Check whether the length of arrays of a class never changes.
fn has_fixed_length(class_id: ClassId) -> bool {
    class_id.is_fixed_length_array() || class_id.is_string()
}

fn length_range(recognized: RecognizedMethod) -> Range {
    match recognized {
        RecognizedMethod::ObjectArrayLength | RecognizedMethod::ImmutableArrayLength => {
            Range::between(0, ARRAY_MAX_ELEMENTS)
        }
        RecognizedMethod::ByteArrayBaseLength => Range::between(0, SMI_MAX),
        RecognizedMethod::StringBaseLength => Range::between(0, STRING_MAX_ELEMENTS),
        _ => Range::unknown(),
    }
}

/// The range of the left operand of a comparison that holds, given the right
/// operand. For example `a < b` constrains `a` to `[-inf, b - 1]`.
fn constraint_range(graph: &FlowGraph, op: Token, boundary: Inst) -> Option<Range> {
    let min = RangeBoundary::min_smi();
    let max = RangeBoundary::max_smi();
    let range = match op {
        Token::Eq => Range::new(
            from_definition(graph, boundary, 0),
            from_definition(graph, boundary, 0),
        ),
        Token::Ne => Range::unknown(),
        Token::Lt => Range::new(min, from_definition(graph, boundary, -1)),
        Token::Gt => Range::new(from_definition(graph, boundary, 1), max),
        Token::Lte => Range::new(min, from_definition(graph, boundary, 0)),
        Token::Gte => Range::new(from_definition(graph, boundary, 0), max),
        _ => return None,
    };
    Some(range)
}

/// Check whether a use lies after the given position.
///
/// A phi use lies at the end of the corresponding predecessor.
fn is_dominated_use(graph: &FlowGraph, position: Position, use_: Use) -> bool {
    let (dom_block, after) = match position {
        Position::BlockStart(bb) => (bb, None),
        Position::After(inst) => match graph.inst_block(inst) {
            Some(bb) => (bb, Some(inst)),
            None => return false,
        },
    };
    let use_block = match graph.inst_block(use_.user) {
        Some(bb) => bb,
        None => return false,
    };
    if graph.opcode(use_.user) == Opcode::Phi {
        return match graph.preds(use_block).get(use_.index) {
            Some(&pred) => graph.dominates(dom_block, pred),
            None => false,
        };
    }
    if use_block != dom_block {
        return graph.dominates(dom_block, use_block);
    }
    let after = match after {
        Some(after) => after,
        None => return true,
    };
    let mut current = graph.next_inst(after);
    while let Some(inst) = current {
        if inst == use_.user {
            return true;
        }
        current = graph.next_inst(inst);
    }
    false
}

fn rename_dominated_uses(graph: &mut FlowGraph, def: Inst, position: Position, other: Inst) {
    for use_ in graph.input_uses(def).to_vec() {
        if use_.user == other {
            continue;
        }
        if graph.opcode(use_.user) == Opcode::Phi && !graph.is_phi_alive(use_.user) {
            continue;
        }
        if is_dominated_use(graph, position, use_) {
            graph.set_arg(use_.user, use_.index, other);
        }
    }
}

fn unwrap_constraint(graph: &FlowGraph, mut def: Inst) -> Inst {
    for _ in 0..MAX_SYMBOL_DEPTH {
        match graph.inst(def) {
            InstData::Constraint { args, .. } => def = args[0],
            _ => break,
        }
    }
    def
}

/// A boundary at a definition plus an offset. Constants fold right away.
fn from_definition(graph: &FlowGraph, def: Inst, offset: i64) -> RangeBoundary {
    match graph.smi_constant_of(def) {
        Some(value) => RangeBoundary::Constant(value.saturating_add(offset)),
        None => RangeBoundary::Symbol(def, offset),
    }
}

/// Resolve a boundary to a constant by following symbols to their ranges.
fn resolve_bound(graph: &FlowGraph, boundary: RangeBoundary, upper: bool) -> RangeBoundary {
    let (unknown, overflow) = if upper {
        (RangeBoundary::max_smi(), RangeBoundary::overflowed_max_smi())
    } else {
        (RangeBoundary::min_smi(), RangeBoundary::overflowed_min_smi())
    };
    let mut offset: i64 = 0;
    let mut current = boundary;
    for _ in 0..MAX_SYMBOL_DEPTH {
        match current {
            RangeBoundary::Constant(_) if offset == 0 => return current,
            RangeBoundary::Constant(v) => {
                return match v.checked_add(offset) {
                    Some(v) if is_valid_smi(v) => RangeBoundary::Constant(v),
                    _ => overflow,
                }
            }
            RangeBoundary::Unknown => current = unknown,
            RangeBoundary::Symbol(def, o) => {
                offset = match offset.checked_add(o) {
                    Some(offset) => offset,
                    None => return overflow,
                };
                current = match graph[def].range {
                    Some(range) if upper => range.max,
                    Some(range) => range.min,
                    None => unknown,
                };
            }
        }
    }
    unknown
}

fn lower_bound(graph: &FlowGraph, boundary: RangeBoundary) -> RangeBoundary {
    resolve_bound(graph, boundary, false)
}

fn upper_bound(graph: &FlowGraph, boundary: RangeBoundary) -> RangeBoundary {
    resolve_bound(graph, boundary, true)
}

/// The smallest constant a range may contain.
fn constant_min(graph: &FlowGraph, range: Option<Range>) -> RangeBoundary {
    match range {
        Some(range) => lower_bound(graph, range.min),
        None => RangeBoundary::min_smi(),
    }
}

/// The largest constant a range may contain.
fn constant_max(graph: &FlowGraph, range: Option<Range>) -> RangeBoundary {
    match range {
        Some(range) => upper_bound(graph, range.max),
        None => RangeBoundary::max_smi(),
    }
}

/// Check whether two definitions compute the same value.
fn are_equal_definitions(graph: &FlowGraph, a: Inst, b: Inst) -> bool {
    let a = unwrap_constraint(graph, a);
    let b = unwrap_constraint(graph, b);
    a == b || {
        let data = graph.inst(a);
        !data.affected_by_side_effect()
            && data.value_number_key() == graph.inst(b).value_number_key()
    }
}

fn depend_on_same_symbol(graph: &FlowGraph, a: RangeBoundary, b: RangeBoundary) -> bool {
    match (a.symbol(), b.symbol()) {
        (Some(x), Some(y)) => are_equal_definitions(graph, x, y),
        _ => false,
    }
}

fn is_equal(graph: &FlowGraph, a: RangeBoundary, b: RangeBoundary) -> bool {
    match (a, b) {
        (RangeBoundary::Constant(x), RangeBoundary::Constant(y)) => x == y,
        (RangeBoundary::Symbol(_, x), RangeBoundary::Symbol(_, y)) => {
            x == y && depend_on_same_symbol(graph, a, b)
        }
        _ => false,
    }
}

fn is_min_smi(boundary: Option<RangeBoundary>) -> bool {
    match boundary {
        None => true,
        Some(RangeBoundary::Constant(v)) => v <= SMI_MIN,
        Some(_) => false,
    }
}

fn is_max_smi(boundary: Option<RangeBoundary>) -> bool {
    match boundary {
        None => true,
        Some(RangeBoundary::Constant(v)) => v >= SMI_MAX,
        Some(_) => false,
    }
}

/// Fold constraints and constant additions into the offset of a symbolic
/// boundary.
fn canonicalize_boundary(
    graph: &FlowGraph,
    boundary: RangeBoundary,
    overflow: RangeBoundary,
) -> RangeBoundary {
    let (mut symbol, mut offset) = match boundary {
        RangeBoundary::Symbol(symbol, offset) => (symbol, offset),
        b => return b,
    };
    for _ in 0..MAX_SYMBOL_DEPTH {
        let step = match graph.inst(symbol) {
            InstData::Constraint { args, .. } => Some((args[0], 0)),
            InstData::BinaryOp {
                opcode: Opcode::BinarySmiOp,
                op: Token::Add,
                args,
                ..
            } => match (graph.smi_constant_of(args[0]), graph.smi_constant_of(args[1])) {
                (_, Some(c)) => Some((args[0], c)),
                (Some(c), _) => Some((args[1], c)),
                _ => None,
            },
            InstData::BinaryOp {
                opcode: Opcode::BinarySmiOp,
                op: Token::Sub,
                args,
                ..
            } => graph.smi_constant_of(args[1]).map(|c| (args[0], -c)),
            _ => None,
        };
        let (next, delta) = match step {
            Some(step) => step,
            None => break,
        };
        offset = match offset.checked_add(delta) {
            Some(offset) if is_valid_smi(offset) => offset,
            _ => return overflow,
        };
        symbol = next;
    }
    from_definition(graph, symbol, offset)
}

/// Replace a symbolic boundary by the symbolic maximum of its symbol.
fn canonicalize_max_boundary(graph: &FlowGraph, boundary: &mut RangeBoundary) -> bool {
    canonicalize_through_range(graph, boundary, true)
}

/// Replace a symbolic boundary by the symbolic minimum of its symbol.
fn canonicalize_min_boundary(graph: &FlowGraph, boundary: &mut RangeBoundary) -> bool {
    canonicalize_through_range(graph, boundary, false)
}

fn canonicalize_through_range(graph: &FlowGraph, boundary: &mut RangeBoundary, upper: bool) -> bool {
    let (symbol, offset) = match *boundary {
        RangeBoundary::Symbol(symbol, offset) => (symbol, offset),
        _ => return false,
    };
    let next = match graph[symbol].range {
        Some(range) if upper => range.max,
        Some(range) => range.min,
        None => return false,
    };
    let (next_symbol, next_offset) = match next {
        RangeBoundary::Symbol(symbol, offset) => (symbol, offset),
        _ => return false,
    };
    let overflow = if upper {
        RangeBoundary::overflowed_max_smi()
    } else {
        RangeBoundary::overflowed_min_smi()
    };
    *boundary = match next_offset.checked_add(offset) {
        Some(offset) if is_valid_smi(offset) => canonicalize_boundary(
            graph,
            RangeBoundary::Symbol(next_symbol, offset),
            overflow,
        ),
        _ => overflow,
    };
    true
}

/// The smaller of two boundaries, as a constant unless both share a symbol.
fn boundary_min(graph: &FlowGraph, a: RangeBoundary, b: RangeBoundary) -> RangeBoundary {
    if depend_on_same_symbol(graph, a, b) {
        return if a.offset() <= b.offset() { a } else { b };
    }
    let min_a = lower_bound(graph, a).clamp().value();
    let min_b = lower_bound(graph, b).clamp().value();
    RangeBoundary::Constant(min_a.min(min_b))
}

/// The larger of two boundaries, as a constant unless both share a symbol.
fn boundary_max(graph: &FlowGraph, a: RangeBoundary, b: RangeBoundary) -> RangeBoundary {
    if depend_on_same_symbol(graph, a, b) {
        return if a.offset() >= b.offset() { a } else { b };
    }
    let max_a = upper_bound(graph, a).clamp().value();
    let max_b = upper_bound(graph, b).clamp().value();
    RangeBoundary::Constant(max_a.max(max_b))
}

/// Intersect the range a constraint imposes with the range of its value.
fn infer_constraint_range(graph: &FlowGraph, constraint: Range, value: Option<Range>) -> Range {
    let value_min = value.map(|r| r.min);
    let value_max = value.map(|r| r.max);

    let min = match value_min {
        _ if is_min_smi(value_min) && !is_min_smi(Some(constraint.min)) => constraint.min,
        Some(value_min) if is_min_smi(Some(constraint.min)) && !is_min_smi(Some(value_min)) => {
            value_min
        }
        Some(value_min) if is_equal(graph, constraint.min, value_min) => constraint.min,
        _ => {
            let mut min = RangeBoundary::Unknown;
            if let Some(value_min) = value_min {
                let overflow = RangeBoundary::overflowed_min_smi();
                let mut a = canonicalize_boundary(graph, constraint.min, overflow);
                let mut b = canonicalize_boundary(graph, value_min, overflow);
                for _ in 0..MAX_SYMBOL_DEPTH {
                    if depend_on_same_symbol(graph, a, b) {
                        min = if a.offset() <= b.offset() { b } else { a };
                        break;
                    }
                    if !(canonicalize_min_boundary(graph, &mut a)
                        || canonicalize_min_boundary(graph, &mut b))
                    {
                        break;
                    }
                }
            }
            if min.is_unknown() {
                min = boundary_max(
                    graph,
                    constant_min(graph, value),
                    lower_bound(graph, constraint.min),
                );
            }
            min
        }
    };

    let max = match value_max {
        _ if is_max_smi(value_max) && !is_max_smi(Some(constraint.max)) => constraint.max,
        Some(value_max) if is_max_smi(Some(constraint.max)) && !is_max_smi(Some(value_max)) => {
            value_max
        }
        Some(value_max) if is_equal(graph, constraint.max, value_max) => constraint.max,
        _ => {
            let mut max = RangeBoundary::Unknown;
            if let Some(value_max) = value_max {
                let overflow = RangeBoundary::overflowed_max_smi();
                let mut a = canonicalize_boundary(graph, constraint.max, overflow);
                let mut b = canonicalize_boundary(graph, value_max, overflow);
                for _ in 0..MAX_SYMBOL_DEPTH {
                    if depend_on_same_symbol(graph, a, b) {
                        max = if a.offset() <= b.offset() { a } else { b };
                        break;
                    }
                    if !(canonicalize_max_boundary(graph, &mut a)
                        || canonicalize_max_boundary(graph, &mut b))
                    {
                        break;
                    }
                }
            }
            if max.is_unknown() {
                max = boundary_min(
                    graph,
                    constant_max(graph, value),
                    upper_bound(graph, constraint.max),
                );
            }
            max
        }
    };

    Range::new(min, max)
}

/// Check whether the index of a bounds check provably lies within the
/// array, first by comparing constant bounds and then symbolically.
fn is_redundant_bounds_check(graph: &FlowGraph, check: Inst, length: RangeBoundary) -> bool {
    let (array_cid, index) = match graph.inst(check) {
        InstData::CheckArrayBound { array_cid, args } => (*array_cid, args[1]),
        _ => return false,
    };
    if !has_fixed_length(array_cid) || length.is_unknown() {
        return false;
    }
    let index_range = match graph[index].range {
        Some(range) => range,
        None => return false,
    };
    if constant_min(graph, Some(index_range)).value() < 0 {
        return false;
    }
    let overflow = RangeBoundary::overflowed_max_smi();
    let mut max = canonicalize_boundary(graph, index_range.max, overflow);
    if max.overflowed() {
        return false;
    }
    if upper_bound(graph, max).value() < lower_bound(graph, length).value() {
        return true;
    }
    let mut length = canonicalize_boundary(graph, length, overflow);
    if length.overflowed() {
        return false;
    }
    for _ in 0..MAX_SYMBOL_DEPTH {
        if depend_on_same_symbol(graph, max, length) {
            return max.offset() < length.offset();
        }
        if !(canonicalize_max_boundary(graph, &mut max)
            || canonicalize_min_boundary(graph, &mut length))
        {
            break;
        }
    }
    false
}

/// Merge the ranges of the phi inputs.
fn infer_phi_range(graph: &FlowGraph, phi: Inst) -> Range {
    let mut bounds: Option<(RangeBoundary, RangeBoundary)> = None;
    for &input in graph.args(phi) {
        let range = match graph[input].range {
            Some(range) => range,
            None => return Range::unknown(),
        };
        let min = constant_min(graph, Some(range));
        let max = constant_max(graph, Some(range));
        bounds = Some(match bounds {
            None => (min, max),
            Some((lo, hi)) => (boundary_min(graph, lo, min), boundary_max(graph, hi, max)),
        });
    }
    match bounds {
        Some((min, max)) => Range::new(min, max),
        None => Range::unknown(),
    }
}

fn symbolic_add(a: RangeBoundary, b: RangeBoundary) -> Option<RangeBoundary> {
    let (symbol, offset, constant) = match (a, b) {
        (RangeBoundary::Symbol(s, o), RangeBoundary::Constant(c))
        | (RangeBoundary::Constant(c), RangeBoundary::Symbol(s, o)) => (s, o, c),
        _ => return None,
    };
    if !is_valid_smi(constant) {
        return None;
    }
    let offset = offset.checked_add(constant).filter(|&o| is_valid_smi(o))?;
    Some(RangeBoundary::Symbol(symbol, offset))
}

fn symbolic_sub(a: RangeBoundary, b: RangeBoundary) -> Option<RangeBoundary> {
    match (a, b) {
        (RangeBoundary::Symbol(s, o), RangeBoundary::Constant(c)) if is_valid_smi(c) => {
            let offset = o.checked_sub(c).filter(|&o| is_valid_smi(o))?;
            Some(RangeBoundary::Symbol(s, offset))
        }
        _ => None,
    }
}

fn is_array_length(graph: &FlowGraph, def: Inst) -> bool {
    match graph.inst(def) {
        InstData::LoadField { recognized, .. } => match recognized {
            RecognizedMethod::ObjectArrayLength | RecognizedMethod::ImmutableArrayLength => true,
            _ => false,
        },
        _ => false,
    }
}

/// The range of a small integer operation, and whether it can overflow if
/// that is known.
fn infer_binary_smi_op_range(graph: &FlowGraph, op: Token, args: [Inst; 2]) -> (Range, Option<bool>) {
    let (left, right) = (args[0], args[1]);
    let (left_range, right_range) = match (graph[left].range, graph[right].range) {
        (Some(l), Some(r)) => (l, r),
        _ => return (Range::unknown(), None),
    };
    let (left_min, left_max) = if is_array_length(graph, left) {
        (
            RangeBoundary::Symbol(left, 0),
            RangeBoundary::Symbol(left, 0),
        )
    } else {
        (left_range.min, left_range.max)
    };
    let cmin = |r| constant_min(graph, Some(r));
    let cmax = |r| constant_max(graph, Some(r));

    let (min, max) = match op {
        Token::Add => (
            symbolic_add(left_min, right_range.min).unwrap_or_else(|| {
                RangeBoundary::add(
                    cmin(left_range),
                    cmin(right_range),
                    RangeBoundary::overflowed_min_smi(),
                )
            }),
            symbolic_add(left_max, right_range.max).unwrap_or_else(|| {
                RangeBoundary::add(
                    cmax(right_range),
                    cmax(left_range),
                    RangeBoundary::overflowed_max_smi(),
                )
            }),
        ),
        Token::Sub => (
            symbolic_sub(left_min, right_range.max).unwrap_or_else(|| {
                RangeBoundary::sub(
                    cmin(left_range),
                    cmax(right_range),
                    RangeBoundary::overflowed_min_smi(),
                )
            }),
            symbolic_sub(left_max, right_range.min).unwrap_or_else(|| {
                RangeBoundary::sub(
                    cmax(left_range),
                    cmin(right_range),
                    RangeBoundary::overflowed_max_smi(),
                )
            }),
        ),
        Token::BitAnd if cmin(right_range).value() >= 0 => {
            (RangeBoundary::Constant(0), cmax(right_range))
        }
        Token::BitAnd if cmin(left_range).value() >= 0 => {
            (RangeBoundary::Constant(0), cmax(left_range))
        }
        _ => return (Range::unknown(), None),
    };

    let overflow = lower_bound(graph, min).overflowed() || upper_bound(graph, max).overflowed();
    (Range::new(min.clamp(), max.clamp()), Some(overflow))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Direction {
    Unknown,
    Positive,
    Negative,
    Both,
}

impl Direction {
    fn invert(self) -> Self {
        match self {
            Direction::Positive => Direction::Negative,
            Direction::Negative => Direction::Positive,
            d => d,
        }
    }

    fn update(&mut self, growth: Direction) {
        if *self == Direction::Unknown {
            *self = growth;
        } else if *self != growth {
            *self = Direction::Both;
        }
    }
}

/// The sign of a value, if known.
fn to_direction(graph: &FlowGraph, value: Inst) -> Direction {
    if let Some(v) = graph.smi_constant_of(value) {
        return if v >= 0 {
            Direction::Positive
        } else {
            Direction::Negative
        };
    }
    match graph[value].range {
        Some(range) if constant_min(graph, Some(range)).value() >= 0 => Direction::Positive,
        Some(range) if constant_max(graph, Some(range)).value() <= 0 => Direction::Negative,
        _ => Direction::Unknown,
    }
}

/// Recognize a loop header phi as an induction variable.
///
/// The phi must depend on exactly one value from outside the loop and
/// otherwise only on additions and subtractions involving itself. If all
/// steps move in the same direction, the phi is bounded by its initial value
/// on one side.
fn infer_induction_variable_range(graph: &FlowGraph, header: Block, var: Inst) -> Option<Range> {
    let mut initial_value = None;
    let mut direction = Direction::Unknown;
    let mut marked = BitSet::new();
    let mut worklist = vec![];
    let mut mark = |def: Inst, worklist: &mut Vec<Inst>| {
        let def = unwrap_constraint(graph, def);
        if !marked.add(def.index() as u32) {
            worklist.push(def);
        }
    };
    mark(var, &mut worklist);

    while let Some(def) = worklist.pop() {
        match graph.inst(def) {
            InstData::Phi { args, .. } => {
                for &input in args {
                    let inside = graph
                        .inst_block(input)
                        .map(|bb| loop_contains(graph, header, bb))
                        .unwrap_or(false);
                    if inside {
                        mark(input, &mut worklist);
                        continue;
                    }
                    match initial_value {
                        None => initial_value = Some(input),
                        Some(initial) if initial == input => (),
                        Some(_) => return None,
                    }
                }
            }
            InstData::BinaryOp {
                opcode: Opcode::BinarySmiOp,
                op: Token::Add,
                args,
                ..
            } => {
                let growth_right = to_direction(graph, args[1]);
                let growth_left = to_direction(graph, args[0]);
                if growth_right != Direction::Unknown {
                    direction.update(growth_right);
                    mark(args[0], &mut worklist);
                } else if growth_left != Direction::Unknown {
                    direction.update(growth_left);
                    mark(args[1], &mut worklist);
                } else {
                    return None;
                }
            }
            InstData::BinaryOp {
                opcode: Opcode::BinarySmiOp,
                op: Token::Sub,
                args,
                ..
            } => {
                let growth_right = to_direction(graph, args[1]);
                if growth_right == Direction::Unknown {
                    return None;
                }
                direction.update(growth_right.invert());
                mark(args[0], &mut worklist);
            }
            _ => return None,
        }
    }

    let initial_value = initial_value?;
    Some(match direction {
        Direction::Positive => Range::new(
            from_definition(graph, initial_value, 0),
            RangeBoundary::max_smi(),
        ),
        Direction::Negative => Range::new(
            RangeBoundary::min_smi(),
            from_definition(graph, initial_value, 0),
        ),
        Direction::Unknown | Direction::Both => Range::unknown(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::OptimizerConfig, ir::FunctionId, pass::TypePropagation, ssa::compute_ssa};

    fn ctx() -> PassContext {
        PassContext::new(OptimizerConfig::default(), Default::default())
    }

    /// `a = <array>; for (i = 0; i < <bound>; i++) { check a[i]; a[i] = i }`
    ///
    /// Slot 0 is the parameter `n`, slot 1 the array, slot 2 the counter.
    fn fill_loop(
        array: impl FnOnce(&mut GraphBuilder) -> Inst,
        bound: impl Fn(&mut GraphBuilder) -> Inst,
        op: Token,
    ) -> (FlowGraph, Inst, Block) {
        let mut graph = FlowGraph::new("fill", 1, 2);
        let mut b = GraphBuilder::new(&mut graph);
        let header = b.join_block();
        let body = b.target_block();
        let exit = b.target_block();
        let a = array(&mut b);
        b.store_local(1, a);
        let zero = b.smi(0);
        b.store_local(2, zero);
        b.goto(header);

        b.append_to(header);
        let i = b.load_local(2);
        let limit = bound(&mut b);
        let mut cmp = Comparison::relational(op, i, limit, None);
        cmp.operands_cid = ClassId::SMI;
        b.branch(cmp, body, exit);

        b.append_to(body);
        let a = b.load_local(1);
        let i = b.load_local(2);
        let check = b.build_inst(InstData::CheckArrayBound {
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
        let n = b.null();
        b.return_value(n);
        compute_ssa(&mut graph).unwrap();
        TypePropagation::run_on_graph(&ctx(), &mut graph);
        (graph, check, header)
    }

    fn new_list(b: &mut GraphBuilder) -> Inst {
        let n = b.load_local(0);
        b.constructor_call(FunctionId::new(0), &[n], ClassId::ARRAY)
    }

    fn param(b: &mut GraphBuilder) -> Inst {
        b.load_local(0)
    }

    #[test]
    fn bounds_check_of_counted_loop_is_removed() {
        let _ = env_logger::try_init();
        let (mut graph, check, header) = fill_loop(new_list, param, Token::Lt);
        assert!(graph.is_inst_inserted(check));
        assert!(RangeAnalysis::run_on_graph(&ctx(), &mut graph));
        assert!(!graph.is_inst_inserted(check));

        let phi = graph.phis(header)[0];
        assert_eq!(
            graph[phi].range,
            Some(Range::new(RangeBoundary::Constant(0), RangeBoundary::max_smi()))
        );
        let constraints = graph
            .definitions()
            .into_iter()
            .filter(|&def| graph.opcode(def) == Opcode::Constraint)
            .count();
        assert_eq!(constraints, 0);
    }

    #[test]
    fn bounds_check_against_constant_length_is_removed() {
        let (mut graph, check, _) = fill_loop(
            |b| {
                let values: Vec<_> = (0..3).map(|v| b.smi(v)).collect();
                b.create_array(&values)
            },
            |b| b.smi(3),
            Token::Lt,
        );
        assert!(RangeAnalysis::run_on_graph(&ctx(), &mut graph));
        assert!(!graph.is_inst_inserted(check));
    }

    #[test]
    fn inclusive_bound_keeps_check() {
        let (mut graph, check, _) = fill_loop(new_list, param, Token::Lte);
        RangeAnalysis::run_on_graph(&ctx(), &mut graph);
        assert!(graph.is_inst_inserted(check));
    }

    #[test]
    fn elimination_can_be_disabled() {
        let mut config = OptimizerConfig::default();
        config.array_bounds_check_elimination = false;
        let ctx = PassContext::new(config, Default::default());
        let (mut graph, check, _) = fill_loop(new_list, param, Token::Lt);
        RangeAnalysis::run_on_graph(&ctx, &mut graph);
        assert!(graph.is_inst_inserted(check));
    }

    #[test]
    fn ranges_only_name_placed_definitions() {
        let _ = env_logger::try_init();
        // The array comes from an opaque call, so its length is loaded.
        let (mut graph, check, _) = fill_loop(
            |b| b.static_call(FunctionId::new(0), &[]),
            param,
            Token::Lt,
        );
        RangeAnalysis::run_on_graph(&ctx(), &mut graph);
        assert!(graph.is_inst_inserted(check));

        let defs = graph.definitions();
        for &def in &defs {
            let range = match graph[def].range {
                Some(range) => range,
                None => continue,
            };
            for &boundary in &[range.min, range.max] {
                if let RangeBoundary::Symbol(symbol, _) = boundary {
                    assert!(
                        defs.contains(&symbol),
                        "range of {} names unplaced {}\n{}",
                        def,
                        symbol,
                        graph.dump()
                    );
                }
            }
        }
    }

    #[test]
    fn induction_variable_counting_down() {
        // i = n; while (i > 0) { i = i - 1 }
        let mut graph = FlowGraph::new("down", 1, 1);
        let mut b = GraphBuilder::new(&mut graph);
        let header = b.join_block();
        let body = b.target_block();
        let exit = b.target_block();
        let n = b.load_local(0);
        b.build_inst(InstData::unary(Opcode::CheckSmi, n));
        let n = b.load_local(0);
        b.store_local(1, n);
        b.goto(header);
        b.append_to(header);
        let i = b.load_local(1);
        let zero = b.smi(0);
        let mut cmp = Comparison::relational(Token::Gt, i, zero, None);
        cmp.operands_cid = ClassId::SMI;
        b.branch(cmp, body, exit);
        b.append_to(body);
        let i = b.load_local(1);
        let one = b.smi(1);
        let next = b.build_inst(InstData::binary_smi_op(Token::Sub, i, one));
        b.store_local(1, next);
        b.goto(header);
        b.append_to(exit);
        let i = b.load_local(1);
        b.return_value(i);
        compute_ssa(&mut graph).unwrap();

        let phi = graph.phis(header)[0];
        graph.set_cid(phi, ClassId::SMI);
        RangeAnalysis::run_on_graph(&ctx(), &mut graph);
        let param = graph.initial_definitions()[1];
        assert_eq!(
            graph[phi].range,
            Some(Range::new(RangeBoundary::min_smi(), RangeBoundary::Symbol(param, 0)))
        );
        // Inside the loop the counter is positive, so decrementing it cannot
        // overflow.
        match graph.inst(next) {
            InstData::BinaryOp { overflow, .. } => assert!(!overflow),
            data => panic!("unexpected {:?}", data),
        }
    }

    #[test]
    fn boundaries_compare_symbolically() {
        let mut graph = FlowGraph::new("f", 1, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let p = b.load_local(0);
        b.return_value(p);
        compute_ssa(&mut graph).unwrap();
        let n = graph.initial_definitions()[1];
        let a = RangeBoundary::Symbol(n, -1);
        let b = RangeBoundary::Symbol(n, 2);
        // Symbols without ranges compare by offset only when they agree.
        assert_eq!(boundary_min(&graph, a, b), a);
        assert_eq!(boundary_max(&graph, a, b), b);
        assert_eq!(
            symbolic_add(a, RangeBoundary::Constant(3)),
            Some(RangeBoundary::Symbol(n, 2))
        );
        assert_eq!(symbolic_sub(RangeBoundary::Constant(3), a), None);
    }
}
