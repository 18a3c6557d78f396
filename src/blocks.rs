//! Basic-block reconstruction over the per-instruction CFG.
//!
//! The builder records one node per executed instruction; graph consumers
//! expect the conventional basic-block view. The synthesizer walks a function
//! root, coalescing straight-line runs of basic and call instructions into
//! blocks, splitting at control-flow joins, and closing blocks at branches,
//! jumps and returns. Classification is never redone here.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::cfg::{Cfg, FunctionId, NodeId};
use crate::{Address, InsnKind};

/// Identifier of a block within one synthesized graph.
pub type BlockId = usize;

/// Block-level graph of one function: newline-joined display labels per
/// block, duplicate edges suppressed. Ready for any directed-graph writer.
#[derive(Debug, Default)]
pub struct BlockGraph {
    labels: Vec<String>,
    edges: Vec<(BlockId, BlockId)>,
}

impl BlockGraph {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, id: BlockId) -> &str {
        &self.labels[id]
    }

    /// Blocks in creation order.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &str)> {
        self.labels.iter().enumerate().map(|(i, l)| (i, l.as_str()))
    }

    pub fn edges(&self) -> &[(BlockId, BlockId)] {
        &self.edges
    }
}

/// Block graph of one discovered function, tagged for emission.
#[derive(Debug)]
pub struct FunctionGraph {
    pub function: FunctionId,
    pub root: Address,
    pub graph: BlockGraph,
}

/// Synthesize the block-level graph reachable from `root`.
pub fn synthesize(cfg: &Cfg, root: NodeId) -> BlockGraph {
    let mut syn = Synthesizer {
        cfg,
        graph: BlockGraph::default(),
        by_label: HashMap::new(),
        tails: HashMap::new(),
    };
    syn.walk(root, None);
    syn.graph
}

/// Synthesize the `i`-th function in discovery order, if it exists.
pub fn synthesize_function(cfg: &Cfg, i: usize) -> Option<FunctionGraph> {
    let root = cfg.function_root(i)?;
    Some(FunctionGraph {
        function: i as FunctionId,
        root: cfg.node(root).instruction().addr(),
        graph: synthesize(cfg, root),
    })
}

/// Synthesize every discovered function. The finished CFG is immutable, so
/// the per-function walks fan out across threads.
pub fn synthesize_all(cfg: &Cfg) -> Vec<FunctionGraph> {
    let count = cfg.roster().len();
    log::debug!("synthesizing block graphs for {} functions", count);
    (0..count)
        .into_par_iter()
        .filter_map(|i| synthesize_function(cfg, i))
        .collect()
}

struct Synthesizer<'a> {
    cfg: &'a Cfg,
    graph: BlockGraph,
    /// Blocks are identified by their label, so a block reached along two
    /// paths is emitted once.
    by_label: HashMap<String, BlockId>,
    /// Self-loop tail blocks, one per re-entered block entry.
    tails: HashMap<NodeId, BlockId>,
}

impl<'a> Synthesizer<'a> {
    fn intern(&mut self, label: String) -> BlockId {
        if let Some(&id) = self.by_label.get(&label) {
            return id;
        }
        let id = self.graph.labels.len();
        self.graph.labels.push(label.clone());
        self.by_label.insert(label, id);
        id
    }

    /// Returns true when the edge was not already present.
    fn add_edge(&mut self, from: BlockId, to: BlockId) -> bool {
        if self.graph.edges.contains(&(from, to)) {
            return false;
        }
        self.graph.edges.push((from, to));
        true
    }

    fn tail_for(&mut self, entry: NodeId) -> BlockId {
        if let Some(&id) = self.tails.get(&entry) {
            return id;
        }
        // A fresh block carrying the entry's label, deliberately not interned:
        // it exists to make the self-loop visible.
        let id = self.graph.labels.len();
        self.graph.labels.push(self.cfg.node(entry).label().to_string());
        self.tails.insert(entry, id);
        id
    }

    fn walk(&mut self, entry: NodeId, pred: Option<BlockId>) {
        let cfg = self.cfg;
        let mut lines: Vec<&str> = Vec::new();
        let mut cur = entry;

        loop {
            let node = cfg.node(cur);
            if !matches!(node.kind(), InsnKind::Basic | InsnKind::Call) {
                break;
            }

            // More than one parent past the entry: a control-flow join, and
            // with it a block boundary.
            if cur != entry && node.in_degree() > 1 {
                let block = self.intern(lines.join("\n"));
                if let Some(p) = pred {
                    self.add_edge(p, block);
                }
                self.walk(cur, Some(block));
                return;
            }

            lines.push(node.label());

            if node.kind() == InsnKind::Call {
                // A call whose observed fall-through exists is an internal
                // instruction of the block; otherwise the block ends here.
                let fall = node
                    .successors()
                    .iter()
                    .copied()
                    .find(|&s| cfg.node(s).instruction().addr() == node.instruction().next_addr());
                match fall {
                    Some(f) => cur = f,
                    None => {
                        let block = self.intern(lines.join("\n"));
                        if let Some(p) = pred {
                            self.add_edge(p, block);
                        }
                        return;
                    }
                }
            } else {
                if node.out_degree() == 0 {
                    let block = self.intern(lines.join("\n"));
                    if let Some(p) = pred {
                        self.add_edge(p, block);
                    }
                    return;
                }
                let next = node.successors()[0];
                if next == entry {
                    // The straight line folds back onto its own entry: emit
                    // the block plus an explicitly self-looping tail.
                    let block = self.intern(lines.join("\n"));
                    if let Some(p) = pred {
                        self.add_edge(p, block);
                    }
                    let tail = self.tail_for(entry);
                    self.add_edge(block, tail);
                    self.add_edge(tail, tail);
                    return;
                }
                cur = next;
            }
        }

        // A branch, jump or ret terminates the block.
        let node = cfg.node(cur);
        lines.push(node.label());
        let block = self.intern(lines.join("\n"));
        let fresh = match pred {
            Some(p) => self.add_edge(p, block),
            None => true,
        };
        // Only descend along edges seen for the first time; a repeated edge
        // means this region is already synthesized (and breaks cycles).
        if fresh && matches!(node.kind(), InsnKind::Branch | InsnKind::Jump) {
            for &s in node.successors() {
                self.walk(s, Some(block));
            }
        }
    }
}
