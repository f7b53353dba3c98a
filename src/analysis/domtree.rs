// Copyright (c) 2017-2020 Fabian Schuiki

//! Block ordering and dominators.

use crate::ir::{Block, FlowGraph, InstData};
use hibitset::BitSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Compute the preorder, postorder, and reverse postorder of the blocks.
///
/// Performs a depth-first traversal from the graph entry. Successors are
/// visited last to first, so the first successor of a branch ends up first in
/// reverse postorder. Along the way the predecessor lists are rebuilt, the
/// spanning tree parent of each block is recorded, and the local variable
/// slots stored to in each block are collected. Blocks that are not reached
/// are dropped from all orderings.
///
/// May be called again after the graph changed shape.
pub fn discover_blocks(graph: &mut FlowGraph) {
    let t0 = time::precise_time_ns();
    graph.preorder.clear();
    graph.postorder.clear();
    graph.parent.clear();
    graph.assigned_vars.clear();
    let blocks: Vec<Block> = graph.blocks.keys().collect();
    for bb in blocks {
        let data = &mut graph[bb];
        data.preorder_number = None;
        data.postorder_number = None;
    }

    let entry = graph.graph_entry();
    visit_block(graph, entry, None);
    let mut stack: Vec<(Block, Vec<Block>)> = vec![(entry, graph.succs(entry))];

    while let Some((bb, pending)) = stack.last_mut() {
        let bb = *bb;
        match pending.pop() {
            Some(succ) => {
                if graph[succ].preorder_number.is_some() {
                    graph.add_pred(succ, bb);
                } else {
                    visit_block(graph, succ, Some(bb));
                    let succs = graph.succs(succ);
                    stack.push((succ, succs));
                }
            }
            None => {
                stack.pop();
                graph[bb].postorder_number = Some(graph.postorder.len());
                graph.postorder.push(bb);
            }
        }
    }

    graph.reverse_postorder = graph.postorder.iter().rev().cloned().collect();
    let t1 = time::precise_time_ns();
    DISCOVER_BLOCKS_TIME.fetch_add(t1 - t0, Ordering::Relaxed);
    trace!(
        "Discovered {} blocks of {} in preorder {:?}",
        graph.preorder.len(),
        graph.name,
        graph.preorder
    );
}

/// Assign a preorder number on first discovery of a block.
fn visit_block(graph: &mut FlowGraph, bb: Block, pred: Option<Block>) {
    graph[bb].preds.clear();
    if let Some(pred) = pred {
        graph.add_pred(bb, pred);
    }
    let parent = pred.and_then(|p| graph[p].preorder_number);
    graph.parent.push(parent);
    graph[bb].preorder_number = Some(graph.preorder.len());
    graph.preorder.push(bb);

    let mut vars = BitSet::with_capacity(graph.variable_count() as u32);
    for inst in graph.insts(bb) {
        if let InstData::StoreLocal { slot, .. } = *graph.inst(inst) {
            vars.add(slot as u32);
        }
    }
    graph.assigned_vars.push(vars);
}

/// Compute the immediate dominators and the dominance frontier.
///
/// Uses the SEMI-NCA algorithm described in Georgiadis, Tarjan, and Werneck's
/// "Finding Dominators in Practice". The immediate dominator and the
/// dominated blocks are stored in each block. The returned frontier is
/// indexed by preorder number and holds preorder numbers.
///
/// Requires a preceding `discover_blocks`.
pub fn compute_dominators(graph: &mut FlowGraph) -> Vec<BitSet> {
    let t0 = time::precise_time_ns();
    let size = graph.preorder.len();
    let mut parent: Vec<isize> = graph
        .parent
        .iter()
        .map(|p| p.map(|p| p as isize).unwrap_or(-1))
        .collect();
    let mut idom = parent.clone();
    let mut semi: Vec<isize> = (0..size as isize).collect();
    let mut label: Vec<isize> = (0..size as isize).collect();
    let mut frontier: Vec<BitSet> = (0..size)
        .map(|_| BitSet::with_capacity(size as u32))
        .collect();

    // Semidominators, visiting blocks in reverse preorder. The link-eval
    // forest is kept in `parent` and compressed in place.
    for bb in graph.preorder.clone() {
        graph[bb].dominator = None;
        graph[bb].dominated.clear();
    }
    for block_index in (1..size).rev() {
        let bb = graph.preorder[block_index];
        for &pred in &graph[bb].preds {
            let pred_index = match graph[pred].preorder_number {
                Some(i) => i as isize,
                None => continue,
            };
            let mut best = pred_index;
            if pred_index > block_index as isize {
                compress_path(block_index as isize, pred_index, &mut parent, &mut label);
                best = label[pred_index as usize];
            }
            semi[block_index] = semi[block_index].min(semi[best as usize]);
        }
        label[block_index] = semi[block_index];
    }

    // Immediate dominators are the nearest common ancestor of the spanning
    // tree parent and the semidominator.
    for block_index in 1..size {
        let mut dom_index = idom[block_index];
        while dom_index > semi[block_index] {
            dom_index = idom[dom_index as usize];
        }
        idom[block_index] = dom_index;
        let bb = graph.preorder[block_index];
        let dom = graph.preorder[dom_index as usize];
        graph[bb].dominator = Some(dom);
        graph[dom].dominated.push(bb);
    }

    // Dominance frontier, after Cooper, Harvey, and Kennedy's "A Simple,
    // Fast Dominance Algorithm" (Figure 5).
    for block_index in 0..size {
        let bb = graph.preorder[block_index];
        if graph[bb].preds.len() <= 1 {
            continue;
        }
        let dom = graph[bb].dominator;
        for &pred in &graph[bb].preds {
            let mut runner = pred;
            while Some(runner) != dom {
                if let Some(n) = graph[runner].preorder_number {
                    frontier[n].add(block_index as u32);
                }
                match graph[runner].dominator {
                    Some(next) => runner = next,
                    None => break,
                }
            }
        }
    }

    let t1 = time::precise_time_ns();
    DOMINATOR_TREE_TIME.fetch_add(t1 - t0, Ordering::Relaxed);
    frontier
}

/// Compress the path from `current_index` towards `start_index` in the
/// link-eval forest, updating each label to the minimum on its path.
fn compress_path(start_index: isize, current_index: isize, parent: &mut [isize], label: &mut [isize]) {
    let mut path = vec![];
    let mut index = current_index;
    while parent[index as usize] > start_index {
        path.push(index);
        index = parent[index as usize];
    }
    for &index in path.iter().rev() {
        let next = parent[index as usize] as usize;
        let index = index as usize;
        label[index] = label[index].min(label[next]);
        parent[index] = parent[next];
    }
}

/// Total time spent computing dominators.
pub static DOMINATOR_TREE_TIME: AtomicU64 = AtomicU64::new(0);

/// Total time spent discovering blocks.
pub static DISCOVER_BLOCKS_TIME: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::prelude::*;
    use hibitset::BitSetLike;

    /// Build a diamond: entry branches to `then` and `else`, which both jump
    /// to `join`.
    fn diamond() -> (FlowGraph, [Block; 4]) {
        let mut graph = FlowGraph::new("diamond", 1, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let entry = b.block();
        let then_bb = b.target_block();
        let else_bb = b.target_block();
        let join = b.join_block();
        let p = b.load_local(0);
        b.branch_if(p, then_bb, else_bb);
        b.append_to(then_bb);
        b.goto(join);
        b.append_to(else_bb);
        b.goto(join);
        b.append_to(join);
        let n = b.null();
        b.return_value(n);
        (graph, [entry, then_bb, else_bb, join])
    }

    #[test]
    fn diamond_orders() {
        let (mut graph, [entry, then_bb, else_bb, join]) = diamond();
        discover_blocks(&mut graph);
        let ge = graph.graph_entry();
        assert_eq!(graph.preorder(), &[ge, entry, else_bb, join, then_bb]);
        assert_eq!(graph.reverse_postorder(), &[ge, entry, then_bb, else_bb, join]);
        assert_eq!(graph.preds(join), &[then_bb, else_bb]);
        assert_eq!(graph.preds(then_bb), &[entry]);
    }

    #[test]
    fn diamond_dominators() {
        let (mut graph, [entry, then_bb, else_bb, join]) = diamond();
        discover_blocks(&mut graph);
        let frontier = compute_dominators(&mut graph);
        assert_eq!(graph[join].dominator, Some(entry));
        assert_eq!(graph[then_bb].dominator, Some(entry));
        assert_eq!(graph[entry].dominator, Some(graph.graph_entry()));
        assert_eq!(graph[graph.graph_entry()].dominator, None);
        assert!(graph.dominates(entry, join));
        assert!(!graph.dominates(then_bb, join));

        let join_index = graph[join].preorder_number.unwrap() as u32;
        let then_index = graph[then_bb].preorder_number.unwrap();
        let else_index = graph[else_bb].preorder_number.unwrap();
        let entry_index = graph[entry].preorder_number.unwrap();
        assert_eq!((&frontier[then_index]).iter().collect::<Vec<_>>(), vec![join_index]);
        assert_eq!((&frontier[else_index]).iter().collect::<Vec<_>>(), vec![join_index]);
        assert!((&frontier[entry_index]).iter().next().is_none());
    }

    /// A loop whose body is a diamond:
    ///
    /// ```text
    /// entry -> header -> body -> then/else -> merge -> header
    ///                 \-> exit
    /// ```
    fn looped_diamond() -> (FlowGraph, [Block; 8]) {
        let mut graph = FlowGraph::new("loop", 1, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let entry = b.block();
        let header = b.join_block();
        let body = b.target_block();
        let exit = b.target_block();
        let then_bb = b.target_block();
        let else_bb = b.target_block();
        let merge = b.join_block();
        b.goto(header);
        b.append_to(header);
        let p = b.load_local(0);
        b.branch_if(p, body, exit);
        b.append_to(body);
        let p = b.load_local(0);
        b.branch_if(p, then_bb, else_bb);
        for &bb in &[then_bb, else_bb] {
            b.append_to(bb);
            b.goto(merge);
        }
        b.append_to(merge);
        b.goto(header);
        b.append_to(exit);
        let n = b.null();
        b.return_value(n);
        let ge = graph.graph_entry();
        (
            graph,
            [ge, entry, header, body, exit, then_bb, else_bb, merge],
        )
    }

    #[test]
    fn loop_dominators_and_frontiers() {
        let (mut graph, [ge, entry, header, body, exit, then_bb, else_bb, merge]) =
            looped_diamond();
        discover_blocks(&mut graph);
        let frontier = compute_dominators(&mut graph);

        let idoms = [
            (entry, ge),
            (header, entry),
            (body, header),
            (exit, header),
            (then_bb, body),
            (else_bb, body),
            (merge, body),
        ];
        for &(bb, dom) in &idoms {
            assert_eq!(graph[bb].dominator, Some(dom), "idom of {}", bb);
        }
        assert_eq!(graph.preds(header).len(), 2);
        assert!(graph.dominates(header, merge));
        assert!(!graph.dominates(then_bb, merge));
        assert!(!graph.dominates(merge, header));

        let frontier_of = |bb: Block| -> Vec<Block> {
            let index = graph[bb].preorder_number.unwrap();
            let mut blocks: Vec<_> = (&frontier[index])
                .iter()
                .map(|i| graph.preorder()[i as usize])
                .collect();
            blocks.sort();
            blocks
        };
        assert_eq!(frontier_of(then_bb), vec![merge]);
        assert_eq!(frontier_of(else_bb), vec![merge]);
        assert_eq!(frontier_of(merge), vec![header]);
        assert_eq!(frontier_of(body), vec![header]);
        assert_eq!(frontier_of(header), vec![header]);
        assert!(frontier_of(entry).is_empty());
        assert!(frontier_of(exit).is_empty());
    }

    #[test]
    fn assigned_vars_follow_stores() {
        let mut graph = FlowGraph::new("f", 0, 2);
        let mut b = GraphBuilder::new(&mut graph);
        let c = b.smi(1);
        b.store_local(1, c);
        let n = b.null();
        b.return_value(n);
        discover_blocks(&mut graph);
        let vars = &graph.assigned_vars()[1];
        assert!(vars.contains(1));
        assert!(!vars.contains(0));
    }
}
