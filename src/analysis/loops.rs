// Copyright (c) 2017-2020 Fabian Schuiki

//! Natural loop detection.

use crate::ir::{Block, FlowGraph};
use hibitset::{BitSet, BitSetLike};

/// Find the natural loops of the graph.
///
/// Every predecessor of a block that the block dominates closes a back edge.
/// The blocks that reach the back edge without passing through the header
/// form the loop body; loops sharing a header are merged. The body is stored
/// in the header's `loop_info` as a set of preorder numbers.
///
/// Returns the loop headers in postorder. Requires up-to-date dominators.
pub fn compute_loops(graph: &mut FlowGraph) -> Vec<Block> {
    for &bb in &graph.preorder {
        graph.blocks[bb].loop_info = None;
    }
    let mut headers = vec![];
    let postorder = graph.postorder.clone();
    for bb in postorder {
        let preds = graph.preds(bb).to_vec();
        for pred in preds {
            if !graph.dominates(bb, pred) {
                continue;
            }
            let body = find_loop(graph, pred, bb);
            trace!("Loop with header {} and back edge from {}", bb, pred);
            match graph.blocks[bb].loop_info.as_mut() {
                Some(info) => {
                    for index in (&body).iter() {
                        info.add(index);
                    }
                }
                None => {
                    graph.blocks[bb].loop_info = Some(body);
                    headers.push(bb);
                }
            }
        }
    }
    headers
}

/// Collect the blocks of the loop with back edge `back_edge -> header`.
fn find_loop(graph: &FlowGraph, back_edge: Block, header: Block) -> BitSet {
    let mut body = BitSet::with_capacity(graph.preorder.len() as u32);
    body.add(preorder_number(graph, header));
    let mut stack = vec![];
    if back_edge != header {
        body.add(preorder_number(graph, back_edge));
        stack.push(back_edge);
    }
    while let Some(bb) = stack.pop() {
        for &pred in graph.preds(bb) {
            if !body.add(preorder_number(graph, pred)) {
                stack.push(pred);
            }
        }
    }
    body
}

fn preorder_number(graph: &FlowGraph, bb: Block) -> u32 {
    graph[bb].preorder_number.map(|n| n as u32).unwrap_or(std::u32::MAX)
}

/// Check whether a block belongs to the loop of a header.
pub fn loop_contains(graph: &FlowGraph, header: Block, bb: Block) -> bool {
    match (&graph[header].loop_info, graph[bb].preorder_number) {
        (Some(info), Some(n)) => info.contains(n as u32),
        _ => false,
    }
}

/// Find the pre-header of a loop: the predecessor of the header that is also
/// its immediate dominator.
pub fn find_pre_header(graph: &FlowGraph, header: Block) -> Option<Block> {
    let dom = graph[header].dominator?;
    graph.preds(header).iter().cloned().find(|&p| p == dom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{compute_dominators, discover_blocks},
        ir::prelude::*,
    };

    #[test]
    fn simple_loop() {
        let mut graph = FlowGraph::new("loop", 1, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let entry = b.block();
        let header = b.join_block();
        let body = b.target_block();
        let exit = b.target_block();
        b.goto(header);
        b.append_to(header);
        let p = b.load_local(0);
        b.branch_if(p, body, exit);
        b.append_to(body);
        b.goto(header);
        b.append_to(exit);
        let n = b.null();
        b.return_value(n);

        discover_blocks(&mut graph);
        compute_dominators(&mut graph);
        let headers = compute_loops(&mut graph);
        assert_eq!(headers, vec![header]);
        assert!(loop_contains(&graph, header, body));
        assert!(loop_contains(&graph, header, header));
        assert!(!loop_contains(&graph, header, exit));
        assert!(!loop_contains(&graph, header, entry));
        assert_eq!(find_pre_header(&graph, header), Some(entry));
    }
}
