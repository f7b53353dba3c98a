// Copyright (c) 2017-2020 Fabian Schuiki

//! Emitting flow graphs as human-readable text.

use crate::ir::{BlockKind, FlowGraph, Inst, InstData, Representation};
use itertools::Itertools;
use std::fmt::{self, Write};

/// The name under which a definition is printed.
///
/// Definitions with an SSA index print as `v<n>`, everything else by its
/// instruction index.
pub fn value_name(graph: &FlowGraph, inst: Inst) -> String {
    match graph.ssa_index(inst) {
        Some(index) => format!("v{}", index),
        None => format!("{}", inst),
    }
}

/// Write a whole graph, blocks in reverse postorder.
pub fn write_graph(out: &mut impl Write, graph: &FlowGraph) -> fmt::Result {
    writeln!(
        out,
        "graph {} ({} params, {} locals) {{",
        graph.name, graph.parameter_count, graph.local_count
    )?;
    let blocks: Vec<_> = if graph.reverse_postorder().is_empty() {
        std::iter::once(graph.graph_entry())
            .chain(std::iter::once(graph.normal_entry()))
            .collect()
    } else {
        graph.reverse_postorder().to_vec()
    };
    for bb in blocks {
        let kind = match graph.block_kind(bb) {
            BlockKind::GraphEntry => "graph",
            BlockKind::Target => "target",
            BlockKind::Join => "join",
        };
        write!(out, "{}[{}]", bb, kind)?;
        if !graph.preds(bb).is_empty() {
            write!(out, " pred({})", graph.preds(bb).iter().format(", "))?;
        }
        if let Some(idom) = graph[bb].dominator {
            write!(out, " idom {}", idom)?;
        }
        if graph[bb].loop_info.is_some() {
            write!(out, " loop")?;
        }
        writeln!(out, ":")?;
        if bb == graph.graph_entry() {
            for &def in graph.initial_definitions() {
                write_line(out, graph, def)?;
            }
        }
        for &phi in graph.phis(bb) {
            if graph.is_phi_alive(phi) {
                write_line(out, graph, phi)?;
            }
        }
        for inst in graph.insts(bb) {
            write_line(out, graph, inst)?;
        }
    }
    writeln!(out, "}}")
}

fn write_line(out: &mut impl Write, graph: &FlowGraph, inst: Inst) -> fmt::Result {
    write!(out, "  ")?;
    write_inst(out, graph, inst)?;
    writeln!(out)
}

/// Write a single instruction.
pub fn write_inst(out: &mut impl Write, graph: &FlowGraph, inst: Inst) -> fmt::Result {
    let data = graph.inst(inst);
    if data.is_definition() && graph.ssa_index(inst).is_some() {
        write!(out, "{} <- ", value_name(graph, inst))?;
    }
    write!(out, "{}", data.opcode())?;
    match data {
        InstData::Constant { value } => write!(out, "({})", value)?,
        InstData::Parameter { index } => write!(out, "({})", index)?,
        InstData::LoadLocal { slot } => write!(out, ":{}", slot)?,
        InstData::StoreLocal { slot, .. } => write!(out, ":{}", slot)?,
        InstData::InstanceCall(call) => write!(out, ":{}", call.name)?,
        InstData::PolymorphicInstanceCall { call, ic, .. } => {
            write!(out, ":{} {}", call.name, ic)?
        }
        InstData::StaticCall { function, .. } => write!(out, ":{}", function)?,
        InstData::AllocateObject { class_id, .. } => write!(out, ":{}", class_id)?,
        InstData::BinaryOp { op, .. } | InstData::UnaryOp { op, .. } => write!(out, ":{}", op)?,
        InstData::CheckClass { checks, .. } => write!(out, " {}", checks)?,
        InstData::CheckArrayBound { array_cid, .. } => write!(out, ":{}", array_cid)?,
        InstData::LoadField { offset, .. } | InstData::StoreField { offset, .. } => {
            write!(out, ":{}", offset)?
        }
        InstData::LoadIndexed { class_id, .. } | InstData::StoreIndexed { class_id, .. } => {
            write!(out, ":{}", class_id)?
        }
        InstData::Compare(c) => write!(out, ":{}:{}", c.op, c.operands_cid)?,
        InstData::InstanceOf { ty, negate, .. } => {
            write!(out, ":{}{}", if *negate { "!" } else { "" }, ty)?
        }
        InstData::AssertAssignable { ty, .. } => write!(out, ":{}", ty)?,
        InstData::InvokeMathCFunction { function, .. } => write!(out, ":{:?}", function)?,
        InstData::Constraint { range, .. } => write!(out, " {}", range)?,
        _ => (),
    }
    let args = data.args();
    let arguments = data.arguments();
    if !args.is_empty() || !arguments.is_empty() {
        write!(
            out,
            "({})",
            args.iter()
                .chain(arguments.iter())
                .map(|&arg| value_name(graph, arg))
                .format(", ")
        )?;
    }
    match data {
        InstData::Goto { target } => write!(out, " {}", target)?,
        InstData::Branch {
            comparison,
            targets,
        } => write!(
            out,
            " if {} {}:{} then {} else {}",
            comparison.op,
            comparison.opcode(),
            comparison.operands_cid,
            targets[0],
            targets[1]
        )?,
        _ => (),
    }
    if let Some(range) = graph[inst].range {
        write!(out, " {}", range)?;
    }
    if data.is_definition() && data.representation() != Representation::Tagged {
        write!(out, " {}", data.representation())?;
    }
    if let Some(env) = graph.env(inst) {
        write!(
            out,
            " env={{{}}}",
            env.values().map(|value| value_name(graph, value)).format(", ")
        )?;
    }
    Ok(())
}

/// Temporary object to print a graph with `{}`.
pub struct GraphDumper<'a>(pub &'a FlowGraph);

impl fmt::Display for GraphDumper<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_graph(f, self.0)
    }
}

impl FlowGraph {
    /// Dump the graph in human-readable form.
    pub fn dump(&self) -> GraphDumper {
        GraphDumper(self)
    }
}
