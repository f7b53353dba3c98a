// Copyright (c) 2017-2020 Fabian Schuiki

//! Load Elimination

use crate::{ir::prelude::*, opt::prelude::*, table::TableKey};
use hibitset::{BitSet, BitSetAnd, BitSetLike, BitSetNot, BitSetOr};
use std::collections::HashMap;

/// Load Elimination
///
/// Replaces loads of mutable fields and array elements by a value that is
/// known to be in memory at that point: an earlier load of the same location,
/// or the value stored there. Availability is computed per block and then
/// propagated across the graph. Where different values reach a join, a phi
/// merging them is created if it turns out not to be redundant.
pub struct LoadElimination;

impl Pass for LoadElimination {
    fn run_on_graph(_ctx: &PassContext, graph: &mut FlowGraph) -> bool {
        let numbering = LoadNumbering::compute(graph);
        if numbering.num_exprs == 0 {
            return false;
        }
        let mut opt = LoadOptimizer::new(numbering);
        opt.compute_initial_sets(graph);
        opt.compute_out_values(graph);
        opt.forward_loads(graph);
        opt.emit_phis(graph);
        debug!(
            "Eliminated {} loads in {} ({} expressions, {} phis)",
            opt.removed, graph.name, opt.numbering.num_exprs, opt.emitted_phis
        );
        opt.removed > 0
    }
}

/// The memory location a load reads or a store writes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum LoadKey {
    Field(Inst, usize),
    Indexed(Inst, Inst),
}

/// The set of loads a store may interfere with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Location {
    Field(usize),
    Element,
}

fn is_candidate(data: &InstData) -> bool {
    match data {
        InstData::LoadField { immutable, .. } => !immutable,
        InstData::LoadIndexed { .. } => true,
        _ => false,
    }
}

fn load_key(data: &InstData) -> Option<(LoadKey, Location)> {
    match *data {
        InstData::LoadField { offset, args, .. } => {
            Some((LoadKey::Field(args[0], offset), Location::Field(offset)))
        }
        InstData::LoadIndexed { args, .. } => {
            Some((LoadKey::Indexed(args[0], args[1]), Location::Element))
        }
        _ => None,
    }
}

/// The location written by a store, together with the value stored if it
/// can be forwarded to a later load.
///
/// Stores into typed arrays other than doubles may convert the stored value
/// and are never forwarded.
fn store_key(data: &InstData) -> Option<(LoadKey, Location, Option<Inst>)> {
    match *data {
        InstData::StoreField { offset, args, .. } => Some((
            LoadKey::Field(args[0], offset),
            Location::Field(offset),
            Some(args[1]),
        )),
        InstData::StoreIndexed { class_id, args, .. } => {
            let forwarded = match class_id {
                ClassId::ARRAY | ClassId::FLOAT64_ARRAY => Some(args[2]),
                _ => None,
            };
            Some((
                LoadKey::Indexed(args[0], args[1]),
                Location::Element,
                forwarded,
            ))
        }
        _ => None,
    }
}

/// Expression ids of the candidate loads.
struct LoadNumbering {
    num_exprs: u32,
    expr_ids: HashMap<Inst, u32>,
    by_key: HashMap<LoadKey, u32>,
    /// The expression ids a store to each location kills.
    kill_by_location: HashMap<Location, BitSet>,
}

impl LoadNumbering {
    fn compute(graph: &FlowGraph) -> Self {
        let mut numbering = LoadNumbering {
            num_exprs: 0,
            expr_ids: HashMap::new(),
            by_key: HashMap::new(),
            kill_by_location: HashMap::new(),
        };
        for &bb in graph.reverse_postorder() {
            for inst in graph.insts(bb) {
                let data = graph.inst(inst);
                if !is_candidate(data) {
                    continue;
                }
                let (key, location) = match load_key(data) {
                    Some(k) => k,
                    None => continue,
                };
                let next = numbering.num_exprs;
                let id = *numbering.by_key.entry(key).or_insert(next);
                if id == next {
                    numbering.num_exprs += 1;
                    numbering
                        .kill_by_location
                        .entry(location)
                        .or_insert_with(BitSet::new)
                        .add(id);
                }
                numbering.expr_ids.insert(inst, id);
            }
        }
        numbering
    }
}

#[derive(Default)]
struct BlockSets {
    gen: BitSet,
    kill: BitSet,
    in_: BitSet,
    out: BitSet,
    /// Loads that may be replaced by a value reaching the block.
    exposed: Vec<Inst>,
    /// The value of each expression available at the block exit.
    out_values: HashMap<u32, Inst>,
}

struct LoadOptimizer {
    numbering: LoadNumbering,
    blocks: HashMap<Block, BlockSets>,
    all_exprs: BitSet,
    /// Phis created while merging values, not yet live.
    phis: Vec<Inst>,
    pending: BitSet,
    removed: usize,
    emitted_phis: usize,
}

fn copy_set(set: impl BitSetLike) -> BitSet {
    let mut result = BitSet::new();
    for i in set.iter() {
        result.add(i);
    }
    result
}

fn same_set(a: &BitSet, b: &BitSet) -> bool {
    a.iter().eq(b.iter())
}

/// Follow the chain of replacements of removed loads.
fn resolve(graph: &FlowGraph, mut def: Inst) -> Inst {
    while let Some(replacement) = graph[def].replacement {
        def = replacement;
    }
    def
}

impl LoadOptimizer {
    fn new(numbering: LoadNumbering) -> Self {
        let mut all_exprs = BitSet::new();
        for id in 0..numbering.num_exprs {
            all_exprs.add(id);
        }
        Self {
            numbering,
            blocks: HashMap::new(),
            all_exprs,
            phis: vec![],
            pending: BitSet::new(),
            removed: 0,
            emitted_phis: 0,
        }
    }

    /// Compute the loads each block generates and kills, replacing locally
    /// redundant loads right away.
    fn compute_initial_sets(&mut self, graph: &mut FlowGraph) {
        for bb in graph.reverse_postorder().to_vec() {
            let mut sets = BlockSets::default();
            for inst in graph.insts_vec(bb) {
                let data = graph.inst(inst);

                if let Some((key, location, stored)) = store_key(data) {
                    if let Some(killed) = self.numbering.kill_by_location.get(&location) {
                        sets.kill = copy_set(BitSetOr(&sets.kill, killed));
                        sets.gen = copy_set(BitSetAnd(&sets.gen, BitSetNot(killed)));
                        let forwarded = stored.and_then(|v| {
                            self.numbering.by_key.get(&key).map(|&id| (id, v))
                        });
                        if let Some((id, value)) = forwarded {
                            trace!("Forwarding stored {} to expression {}", value, id);
                            sets.gen.add(id);
                            sets.out_values.insert(id, value);
                        }
                    }
                    continue;
                }

                if data.has_side_effect() {
                    sets.kill = copy_set(&self.all_exprs);
                    sets.gen.clear();
                    continue;
                }

                let id = match self.numbering.expr_ids.get(&inst) {
                    Some(&id) => id,
                    None => continue,
                };
                if sets.gen.contains(id) {
                    if let Some(&value) = sets.out_values.get(&id) {
                        let value = resolve(graph, value);
                        self.replace_load(graph, inst, value);
                        continue;
                    }
                } else if !sets.kill.contains(id) {
                    sets.exposed.push(inst);
                }
                sets.gen.add(id);
                sets.out_values.insert(id, inst);
            }
            sets.out = copy_set(&sets.gen);
            self.blocks.insert(bb, sets);
        }
    }

    fn replace_load(&mut self, graph: &mut FlowGraph, load: Inst, value: Inst) {
        trace!("Replacing load {} with {}", load, value);
        graph.ensure_ssa_index(value, load);
        graph.replace_uses_with(load, value);
        graph.remove_inst(load);
        graph[load].replacement = Some(value);
        self.removed += 1;
    }

    /// Propagate availability until nothing changes:
    /// `IN = ∩ OUT(pred)` and `OUT = GEN ∪ (IN - KILL)`.
    fn compute_out_values(&mut self, graph: &mut FlowGraph) {
        let order = graph.reverse_postorder().to_vec();
        let mut changed = true;
        while changed {
            changed = false;
            for &bb in &order {
                let mut incoming: Option<BitSet> = None;
                for pred in graph.preds(bb) {
                    let pred_out = match self.blocks.get(pred) {
                        Some(sets) => &sets.out,
                        None => continue,
                    };
                    incoming = Some(match incoming {
                        None => copy_set(pred_out),
                        Some(set) => copy_set(BitSetAnd(&set, pred_out)),
                    });
                }
                let incoming = incoming.unwrap_or_else(BitSet::new);

                let sets = match self.blocks.get_mut(&bb) {
                    Some(sets) => sets,
                    None => continue,
                };
                if same_set(&incoming, &sets.in_) {
                    continue;
                }
                sets.in_ = incoming;
                let out = copy_set(BitSetOr(
                    &sets.gen,
                    BitSetAnd(&sets.in_, BitSetNot(&sets.kill)),
                ));
                if same_set(&out, &sets.out) {
                    continue;
                }
                sets.out = out;
                changed = true;

                let missing: Vec<u32> = (&sets.out)
                    .iter()
                    .filter(|id| !sets.out_values.contains_key(id))
                    .collect();
                for id in missing {
                    if let Some(value) = self.merge_incoming_values(graph, bb, id) {
                        if let Some(sets) = self.blocks.get_mut(&bb) {
                            sets.out_values.insert(id, value);
                        }
                    }
                }
            }
        }
    }

    /// The value of an expression on entry to a block, creating a phi if the
    /// predecessors provide different values.
    fn merge_incoming_values(&mut self, graph: &mut FlowGraph, bb: Block, id: u32) -> Option<Inst> {
        let mut values = Vec::with_capacity(graph.preds(bb).len());
        for pred in graph.preds(bb) {
            let value = self.blocks.get(pred)?.out_values.get(&id)?;
            values.push(resolve(graph, *value));
        }
        let first = *values.first()?;
        if values.iter().all(|&v| v == first) {
            return Some(first);
        }

        // Phis are only inserted once forwarding is done, since some of them
        // turn out to be redundant.
        let phi = graph.add_phi(bb, None, values.len());
        for (index, value) in values.into_iter().enumerate() {
            graph.set_arg(phi, index, value);
        }
        graph.alloc_ssa_index(phi);
        trace!("Merging expression {} in {} with {}", id, bb, phi);
        self.pending.add(phi.index() as u32);
        self.phis.push(phi);
        Some(phi)
    }

    /// Replace the exposed loads of each block with the value reaching it.
    fn forward_loads(&mut self, graph: &mut FlowGraph) {
        for bb in graph.reverse_postorder().to_vec() {
            let (exposed, incoming) = match self.blocks.get(&bb) {
                Some(sets) => (sets.exposed.clone(), copy_set(&sets.in_)),
                None => continue,
            };
            for load in exposed {
                let id = self.numbering.expr_ids[&load];
                if !incoming.contains(id) {
                    continue;
                }
                let replacement = match self.merge_incoming_values(graph, bb, id) {
                    Some(value) => resolve(graph, value),
                    None => continue,
                };
                if replacement != load {
                    self.replace_load(graph, load, replacement);
                }
            }
        }
    }

    /// Insert the phis that are used and not redundant, and drop the rest.
    fn emit_phis(&mut self, graph: &mut FlowGraph) {
        for phi in std::mem::take(&mut self.phis) {
            if graph.inst_block(phi).is_none() {
                continue;
            }
            if !graph.has_uses(phi) {
                self.discard_phi(graph, phi);
            } else if !self.eliminate_redundant_phi(graph, phi) {
                graph.mark_phi_alive(phi);
                self.pending.remove(phi.index() as u32);
                self.emitted_phis += 1;
            }
        }
    }

    fn discard_phi(&mut self, graph: &mut FlowGraph, phi: Inst) {
        graph.remove_phi(phi);
        self.pending.remove(phi.index() as u32);
    }

    /// Check whether a phi, looking through other pending phis, always takes
    /// the same value. If so, the phis involved are replaced by that value.
    fn eliminate_redundant_phi(&mut self, graph: &mut FlowGraph, phi: Inst) -> bool {
        let mut value = None;
        let mut worklist = vec![phi];
        let mut visited = BitSet::new();
        visited.add(phi.index() as u32);
        let mut i = 0;
        while i < worklist.len() {
            let current = worklist[i];
            i += 1;
            for &input in graph.args(current) {
                if input == current {
                    continue;
                }
                if self.pending.contains(input.index() as u32) {
                    if !visited.add(input.index() as u32) {
                        worklist.push(input);
                    }
                    continue;
                }
                match value {
                    None => value = Some(input),
                    Some(v) if v == input => (),
                    Some(_) => return false,
                }
            }
        }
        let value = match value {
            Some(value) => value,
            None => return false,
        };
        trace!("Phis {:?} are redundant, all take {}", worklist, value);
        for &p in &worklist {
            graph.replace_uses_with(p, value);
            graph[p].replacement = Some(value);
        }
        for p in worklist {
            self.discard_phi(graph, p);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::OptimizerConfig, ssa::compute_ssa};

    fn ctx() -> PassContext {
        PassContext::new(OptimizerConfig::default(), Default::default())
    }

    fn loads(graph: &FlowGraph) -> Vec<Inst> {
        graph
            .definitions()
            .into_iter()
            .filter(|&def| graph.opcode(def) == Opcode::LoadField)
            .collect()
    }

    #[test]
    fn store_to_other_field_keeps_load_available() {
        let _ = env_logger::try_init();
        let mut graph = FlowGraph::new("f", 1, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let obj = b.load_local(0);
        let first = b.load_field(obj, 16, false);
        let obj = b.load_local(0);
        let v = b.smi(1);
        b.store_field(obj, 24, v);
        let obj = b.load_local(0);
        let second = b.load_field(obj, 16, false);
        let sum = b.build_inst(InstData::binary_smi_op(Token::Add, first, second));
        b.return_value(sum);
        compute_ssa(&mut graph).unwrap();

        assert!(LoadElimination::run_on_graph(&ctx(), &mut graph));
        assert!(!graph.is_inst_inserted(second));
        assert_eq!(graph.args(sum), &[first, first]);
    }

    #[test]
    fn store_to_same_field_is_forwarded() {
        let mut graph = FlowGraph::new("f", 2, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let obj = b.load_local(0);
        let first = b.load_field(obj, 16, false);
        let obj = b.load_local(0);
        let v = b.load_local(1);
        b.store_field(obj, 16, v);
        let obj = b.load_local(0);
        let second = b.load_field(obj, 16, false);
        let sum = b.build_inst(InstData::binary_smi_op(Token::Add, first, second));
        b.return_value(sum);
        compute_ssa(&mut graph).unwrap();

        let value = graph.initial_definitions()[2];
        assert!(LoadElimination::run_on_graph(&ctx(), &mut graph));
        assert!(graph.is_inst_inserted(first));
        assert_eq!(graph.args(sum), &[first, value]);
    }

    #[test]
    fn call_kills_loads() {
        let mut graph = FlowGraph::new("f", 1, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let obj = b.load_local(0);
        b.load_field(obj, 16, false);
        let obj = b.load_local(0);
        b.instance_call("mutate", Token::Illegal, &[obj], 1, None);
        let obj = b.load_local(0);
        let second = b.load_field(obj, 16, false);
        b.return_value(second);
        compute_ssa(&mut graph).unwrap();

        assert!(!LoadElimination::run_on_graph(&ctx(), &mut graph));
        assert!(graph.is_inst_inserted(second));
    }

    #[test]
    fn different_values_merge_in_phi() {
        let mut graph = FlowGraph::new("f", 2, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let then_bb = b.target_block();
        let else_bb = b.target_block();
        let join = b.join_block();
        let p = b.load_local(1);
        b.branch_if(p, then_bb, else_bb);
        for &bb in &[then_bb, else_bb] {
            b.append_to(bb);
            let obj = b.load_local(0);
            b.load_field(obj, 16, false);
            b.goto(join);
        }
        b.append_to(join);
        let obj = b.load_local(0);
        let merged = b.load_field(obj, 16, false);
        let ret = b.return_value(merged);
        compute_ssa(&mut graph).unwrap();

        assert!(LoadElimination::run_on_graph(&ctx(), &mut graph));
        assert_eq!(loads(&graph).len(), 2);
        let phi = graph.arg(ret, 0);
        assert_eq!(graph.opcode(phi), Opcode::Phi);
        assert!(graph.is_phi_alive(phi));
        assert_eq!(graph.inst_block(phi), Some(join));
    }

    #[test]
    fn loop_load_reuses_value_from_before_loop() {
        let mut graph = FlowGraph::new("f", 1, 1);
        let mut b = GraphBuilder::new(&mut graph);
        let header = b.join_block();
        let body = b.target_block();
        let exit = b.target_block();
        let obj = b.load_local(0);
        let before = b.load_field(obj, 16, false);
        b.store_local(1, before);
        b.goto(header);
        b.append_to(header);
        let i = b.load_local(1);
        let zero = b.smi(0);
        let mut cmp = Comparison::relational(Token::Gt, i, zero, None);
        cmp.operands_cid = ClassId::SMI;
        b.branch(cmp, body, exit);
        b.append_to(body);
        let i = b.load_local(1);
        let obj = b.load_local(0);
        let inside = b.load_field(obj, 16, false);
        let next = b.build_inst(InstData::binary_smi_op(Token::Sub, i, inside));
        b.store_local(1, next);
        b.goto(header);
        b.append_to(exit);
        let n = b.null();
        b.return_value(n);
        compute_ssa(&mut graph).unwrap();

        assert!(LoadElimination::run_on_graph(&ctx(), &mut graph));
        assert!(!graph.is_inst_inserted(inside));
        assert_eq!(graph.arg(next, 1), before);
        // The merged phi turned out redundant and was dropped.
        let live_phis = graph
            .phis(header)
            .iter()
            .filter(|&&phi| graph.is_phi_alive(phi))
            .count();
        assert_eq!(live_phis, 1);
    }
}
