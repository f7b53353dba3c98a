// Copyright (c) 2017-2020 Fabian Schuiki

//! A batch of methods compiled together.
//!
//! This module implements the `Module`, a collection of flow graphs that are
//! optimized independently of each other. Every graph owns its own counters,
//! so the graphs of a module can be handed to different worker threads.

use crate::ir::{ClassTable, FlowGraph};
use rayon::prelude::*;
use std::sync::Arc;

/// A collection of methods sharing one class table.
pub struct Module {
    /// The class hierarchy and method tables the graphs refer to.
    pub classes: Arc<ClassTable>,
    graphs: Vec<FlowGraph>,
}

impl Module {
    /// Create a new empty module.
    pub fn new(classes: Arc<ClassTable>) -> Self {
        Self {
            classes,
            graphs: vec![],
        }
    }

    /// Dump the module in human-readable form.
    pub fn dump(&self) -> ModuleDumper {
        ModuleDumper(self)
    }

    /// Add a method to the module. Returns its index.
    pub fn add_graph(&mut self, graph: FlowGraph) -> usize {
        self.graphs.push(graph);
        self.graphs.len() - 1
    }

    /// The number of methods in the module.
    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    /// Check whether the module holds no methods.
    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    /// Access a method.
    pub fn graph(&self, index: usize) -> &FlowGraph {
        &self.graphs[index]
    }

    /// Mutably access a method.
    pub fn graph_mut(&mut self, index: usize) -> &mut FlowGraph {
        &mut self.graphs[index]
    }

    /// Iterate over the methods.
    pub fn graphs(&self) -> impl Iterator<Item = &FlowGraph> {
        self.graphs.iter()
    }

    /// Iterate mutably over the methods.
    pub fn graphs_mut(&mut self) -> impl Iterator<Item = &mut FlowGraph> {
        self.graphs.iter_mut()
    }

    /// Iterate mutably over the methods in parallel.
    pub fn par_graphs_mut(&mut self) -> impl ParallelIterator<Item = &mut FlowGraph> {
        self.graphs.par_iter_mut()
    }

    /// Remove all methods from the module.
    pub fn take_graphs(&mut self) -> Vec<FlowGraph> {
        std::mem::replace(&mut self.graphs, vec![])
    }
}

/// Temporary object to dump a `Module` in human-readable form for debugging.
pub struct ModuleDumper<'a>(&'a Module);

impl std::fmt::Display for ModuleDumper<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut newline = false;
        for graph in self.0.graphs() {
            if newline {
                writeln!(f)?;
            }
            newline = true;
            write!(f, "{}", graph.dump())?;
        }
        Ok(())
    }
}
