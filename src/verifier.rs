// Copyright (c) 2017-2021 Fabian Schuiki

//! Verification of flow graph integrity.
//!
//! This module implements verification of the SSA flow graph. It checks that
//! blocks end in terminators, that the use lists agree with the inputs and
//! environments of instructions, and that every definition dominates its uses.

use crate::{
    ir::{prelude::*, writer::write_inst},
    table::TableKey,
};
use std::{
    fmt::Display,
    ops::{Deref, DerefMut},
};

/// A flow graph verifier.
///
/// The `Verifier` acts as a context to call the various graph checking
/// functions on. It keeps track of errors.
#[derive(Default)]
pub struct Verifier {
    errors: VerifierErrors,
    graph_name: Option<String>,
}

impl Verifier {
    /// Create a new verifier.
    pub fn new() -> Self {
        Default::default()
    }

    /// Verify the integrity of every graph in a `Module`.
    pub fn verify_module(&mut self, module: &Module) {
        for graph in module.graphs() {
            self.verify_graph(graph);
        }
    }

    /// Verify the integrity of a `FlowGraph`.
    pub fn verify_graph(&mut self, graph: &FlowGraph) {
        self.graph_name = Some(format!("graph {}", graph.name));

        for &bb in graph.reverse_postorder() {
            self.verify_block(graph, bb);
        }
        for &def in graph.initial_definitions() {
            self.verify_uses(graph, def);
        }

        self.graph_name = None;
    }

    /// Verify a single block, its phis, and its instructions.
    pub fn verify_block(&mut self, graph: &FlowGraph, bb: Block) {
        for succ in graph.succs(bb) {
            if graph.pred_index(succ, bb).is_none() {
                self.error(
                    bb.to_string(),
                    format!("{} is missing from the predecessors of {}", bb, succ),
                );
            }
        }

        for &phi in graph.phis(bb) {
            if !graph.is_phi_alive(phi) {
                continue;
            }
            if graph.args(phi).len() != graph.preds(bb).len() {
                self.error(
                    describe(graph, phi),
                    format!(
                        "phi has {} inputs but {} has {} predecessors",
                        graph.args(phi).len(),
                        bb,
                        graph.preds(bb).len()
                    ),
                );
            }
            self.verify_inputs(graph, phi);
            self.verify_uses(graph, phi);
        }

        if bb == graph.graph_entry() {
            return;
        }
        let last = match graph.last_inst(bb) {
            Some(last) => last,
            None => {
                self.error(bb.to_string(), "block is empty");
                return;
            }
        };
        for inst in graph.insts(bb) {
            // Check that there are no terminators in the middle of the block.
            let is_terminator = graph.inst(inst).is_terminator();
            if is_terminator && inst != last {
                self.error(
                    describe(graph, inst),
                    format!("terminator must be at the end of block {}", bb),
                );
            }
            if !is_terminator && inst == last {
                self.error(
                    bb.to_string(),
                    format!("last instruction `{}` must be a terminator", describe(graph, inst)),
                );
            }
            if graph.inst_block(inst) != Some(bb) {
                self.error(describe(graph, inst), format!("not recorded as part of {}", bb));
            }
            self.verify_inputs(graph, inst);
            self.verify_env(graph, inst);
            self.verify_uses(graph, inst);
        }
    }

    /// Check that the inputs of an instruction or phi are placed, registered
    /// in their use lists, and dominate the instruction.
    fn verify_inputs(&mut self, graph: &FlowGraph, user: Inst) {
        let is_phi = graph.opcode(user) == Opcode::Phi;
        for (index, &def) in graph.args(user).iter().enumerate() {
            if !is_placed(graph, def) {
                self.error(
                    describe(graph, user),
                    format!("input {} refers to {} which is not in the graph", index, def),
                );
                continue;
            }
            let use_ = Use { user, index };
            if !graph.input_uses(def).contains(&use_) {
                self.error(
                    describe(graph, user),
                    format!("input {} is missing from the uses of {}", index, def),
                );
            }

            // Phi inputs flow in along the edge from the matching predecessor.
            let dominated = if is_phi {
                let pred = graph
                    .inst_block(user)
                    .and_then(|bb| graph.preds(bb).get(index).cloned());
                match pred.and_then(|pred| graph.last_inst(pred)) {
                    Some(last) => graph.inst_dominates(def, last),
                    None => false,
                }
            } else {
                graph.inst_dominates(def, user)
            };
            if !dominated {
                self.error(
                    describe(graph, def),
                    format!("does not dominate use in `{}`", describe(graph, user)),
                );
            }
        }
    }

    /// Check that the environment values of an instruction are registered in
    /// their use lists.
    fn verify_env(&mut self, graph: &FlowGraph, user: Inst) {
        let env = match graph.env(user) {
            Some(env) => env,
            None => return,
        };
        for (index, def) in env.values().enumerate() {
            if !is_placed(graph, def) {
                self.error(
                    describe(graph, user),
                    format!("environment refers to {} which is not in the graph", def),
                );
            } else if !graph.env_uses(def).contains(&Use { user, index }) {
                self.error(
                    describe(graph, user),
                    format!("environment slot {} is missing from the uses of {}", index, def),
                );
            }
        }
    }

    /// Check that the use lists of a definition point back at it.
    fn verify_uses(&mut self, graph: &FlowGraph, def: Inst) {
        for use_ in graph.input_uses(def) {
            let user = use_.user;
            if graph.opcode(user) == Opcode::Phi && !graph.is_phi_alive(user) {
                continue;
            }
            if !is_placed(graph, user) {
                self.error(
                    describe(graph, def),
                    format!("used by {} which is not in the graph", user),
                );
            } else if graph.args(user).get(use_.index) != Some(&def) {
                self.error(
                    describe(graph, def),
                    format!("stale use as input {} of `{}`", use_.index, describe(graph, user)),
                );
            }
        }
    }

    fn error(&mut self, object: String, message: impl Into<String>) {
        self.errors.push(VerifierError {
            graph: self.graph_name.clone(),
            object: Some(object),
            message: message.into(),
        });
    }

    /// Finish verification and return the result.
    ///
    /// Consumes the verifier.
    pub fn finish(self) -> Result<(), VerifierErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }

    /// Finish verification and panic if errors occurred.
    ///
    /// Consumes the verifier.
    pub fn finish_panic(self) {
        match self.finish() {
            Ok(()) => (),
            Err(errs) => panic!("Verification failed:\n{}", errs),
        }
    }
}

/// Check whether a definition is part of the graph: an initial definition, a
/// live phi, or an instruction placed in a block.
fn is_placed(graph: &FlowGraph, def: Inst) -> bool {
    if def.index() >= graph.inst_id_bound() || graph.inst_block(def).is_none() {
        return false;
    }
    match graph.opcode(def) {
        Opcode::Phi => graph.is_phi_alive(def),
        _ => graph.is_inst_inserted(def) || graph.initial_definitions().contains(&def),
    }
}

fn describe(graph: &FlowGraph, inst: Inst) -> String {
    let mut s = String::new();
    match write_inst(&mut s, graph, inst) {
        Ok(()) => s,
        Err(_) => inst.to_string(),
    }
}

/// A verification error.
#[derive(Debug)]
pub struct VerifierError {
    /// The graph within which the error occurred.
    pub graph: Option<String>,
    /// The object which caused the error.
    pub object: Option<String>,
    /// The error message.
    pub message: String,
}

impl Display for VerifierError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(ref graph) = self.graph {
            write!(f, "{}: ", graph)?;
        }
        if let Some(ref object) = self.object {
            write!(f, "{}: ", object)?;
        }
        write!(f, "{}", self.message)?;
        Ok(())
    }
}

/// A list of verification errors.
#[derive(Debug, Default)]
pub struct VerifierErrors(pub Vec<VerifierError>);

impl Deref for VerifierErrors {
    type Target = Vec<VerifierError>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for VerifierErrors {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for VerifierErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for err in self.iter() {
            writeln!(f, "- {}", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::compute_ssa;

    /// `x = p ? 1 : 2; return x;`
    fn diamond() -> (FlowGraph, Inst) {
        let mut graph = FlowGraph::new("f", 1, 1);
        let mut b = GraphBuilder::new(&mut graph);
        let then_bb = b.target_block();
        let else_bb = b.target_block();
        let join = b.join_block();
        let p = b.load_local(0);
        b.branch_if(p, then_bb, else_bb);
        for (&bb, value) in [then_bb, else_bb].iter().zip(1..) {
            b.append_to(bb);
            let k = b.smi(value);
            b.store_local(1, k);
            b.goto(join);
        }
        b.append_to(join);
        let x = b.load_local(1);
        let ret = b.return_value(x);
        compute_ssa(&mut graph).unwrap();
        (graph, ret)
    }

    #[test]
    fn well_formed_graph_verifies() {
        let _ = env_logger::try_init();
        let (graph, _) = diamond();
        let mut verifier = Verifier::new();
        verifier.verify_graph(&graph);
        verifier.finish_panic();
    }

    #[test]
    fn stale_input_is_reported() {
        let (mut graph, ret) = diamond();
        let phi = graph.arg(ret, 0);
        // Retarget the input behind the use lists' back.
        let zero = graph.get_constant(Constant::Smi(0));
        graph.set_arg_raw(ret, 0, zero);

        let mut verifier = Verifier::new();
        verifier.verify_graph(&graph);
        let errs = verifier.finish().unwrap_err();
        let text = errs.to_string();
        assert!(text.contains("missing from the uses"), "{}", text);
        assert!(text.contains("stale use"), "{}", text);
        assert!(graph.input_uses(phi).iter().any(|u| u.user == ret));
    }

    #[test]
    fn missing_terminator_is_reported() {
        let (mut graph, ret) = diamond();
        let value = graph.arg(ret, 0);
        let check = graph.add_inst(InstData::unary(Opcode::CheckSmi, value));
        graph.insert_after(ret, check);

        let mut verifier = Verifier::new();
        verifier.verify_graph(&graph);
        let errs = verifier.finish().unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("must be at the end")));
        assert!(errs.iter().any(|e| e.message.contains("must be a terminator")));
        assert!(errs.iter().all(|e| e.graph.as_deref() == Some("graph f")));
    }
}
