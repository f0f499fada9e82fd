//! Control-flow graph queries: dominators, post-dominators, natural loops.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::algo::dominators::simple_fast;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use super::{Function, Terminator};

/// Block-level CFG of one function. Block 0 is the entry.
pub struct Cfg {
    pub labels: Vec<String>,
    index: HashMap<String, usize>,
    pub succs: Vec<Vec<usize>>,
    pub preds: Vec<Vec<usize>>,
}

/// Immediate-dominator tree over block indices.
pub struct DomTree {
    idom: Vec<Option<usize>>,
    reachable: Vec<bool>,
}

impl DomTree {
    pub fn idom(&self, b: usize) -> Option<usize> {
        self.idom[b]
    }

    pub fn is_reachable(&self, b: usize) -> bool {
        self.reachable[b]
    }

    /// Reflexive dominance. Unreachable blocks dominate nothing and are
    /// dominated by everything.
    pub fn dominates(&self, a: usize, b: usize) -> bool {
        if !self.reachable[b] {
            return true;
        }
        if !self.reachable[a] {
            return false;
        }
        let mut cur = Some(b);
        while let Some(c) = cur {
            if c == a {
                return true;
            }
            cur = self.idom[c];
        }
        false
    }
}

/// A natural loop, identified by its header.
#[derive(Clone, Debug)]
pub struct Loop {
    pub header: String,
    pub latches: Vec<String>,
    pub blocks: BTreeSet<String>,
}

impl Loop {
    pub fn contains(&self, label: &str) -> bool {
        self.blocks.contains(label)
    }
}

impl Cfg {
    pub fn new(f: &Function) -> Self {
        let labels: Vec<String> = f.blocks.iter().map(|b| b.label.clone()).collect();
        let index: HashMap<String, usize> = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i))
            .collect();
        let mut succs = vec![Vec::new(); labels.len()];
        let mut preds = vec![Vec::new(); labels.len()];
        for (i, b) in f.blocks.iter().enumerate() {
            for s in b.term.successors() {
                if let Some(&j) = index.get(s) {
                    if !succs[i].contains(&j) {
                        succs[i].push(j);
                        preds[j].push(i);
                    }
                }
            }
        }
        Self {
            labels,
            index,
            succs,
            preds,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn idx(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn label(&self, i: usize) -> &str {
        &self.labels[i]
    }

    fn graph(&self, reversed: bool, extra_root_edges: &[usize]) -> (DiGraph<(), ()>, NodeIndex) {
        let n = self.labels.len();
        let mut g: DiGraph<(), ()> = DiGraph::with_capacity(n + 1, n * 2);
        for _ in 0..n {
            g.add_node(());
        }
        for (i, ss) in self.succs.iter().enumerate() {
            for &s in ss {
                if reversed {
                    g.add_edge(NodeIndex::new(s), NodeIndex::new(i), ());
                } else {
                    g.add_edge(NodeIndex::new(i), NodeIndex::new(s), ());
                }
            }
        }
        if extra_root_edges.is_empty() {
            return (g, NodeIndex::new(0));
        }
        let root = g.add_node(());
        for &e in extra_root_edges {
            g.add_edge(root, NodeIndex::new(e), ());
        }
        (g, root)
    }

    fn tree(&self, g: &DiGraph<(), ()>, root: NodeIndex) -> DomTree {
        let n = self.labels.len();
        let doms = simple_fast(g, root);
        let mut reachable = vec![false; n];
        let mut dfs = Dfs::new(g, root);
        while let Some(node) = dfs.next(g) {
            if node.index() < n {
                reachable[node.index()] = true;
            }
        }
        let idom = (0..n)
            .map(|i| {
                doms.immediate_dominator(NodeIndex::new(i))
                    .map(|d| d.index())
                    .filter(|&d| d < n)
            })
            .collect();
        DomTree { idom, reachable }
    }

    pub fn dominators(&self) -> DomTree {
        if self.is_empty() {
            return DomTree {
                idom: Vec::new(),
                reachable: Vec::new(),
            };
        }
        let (g, root) = self.graph(false, &[]);
        self.tree(&g, root)
    }

    /// Post-dominators, rooted at a virtual exit joined to every block
    /// without successors.
    pub fn post_dominators(&self) -> DomTree {
        let exits: Vec<usize> = (0..self.len())
            .filter(|&i| self.succs[i].is_empty())
            .collect();
        if exits.is_empty() {
            return DomTree {
                idom: vec![None; self.len()],
                reachable: vec![false; self.len()],
            };
        }
        let (g, root) = self.graph(true, &exits);
        self.tree(&g, root)
    }

    /// Blocks reachable from the entry.
    pub fn reachable(&self) -> HashSet<usize> {
        let mut seen = HashSet::new();
        if self.is_empty() {
            return seen;
        }
        let mut stack = vec![0];
        while let Some(b) = stack.pop() {
            if seen.insert(b) {
                stack.extend(self.succs[b].iter().copied());
            }
        }
        seen
    }

    /// Natural loops, one per header, outermost first.
    pub fn natural_loops(&self, dom: &DomTree) -> Vec<Loop> {
        let mut by_header: Vec<(usize, Vec<usize>, BTreeSet<usize>)> = Vec::new();
        for t in 0..self.len() {
            if !dom.is_reachable(t) {
                continue;
            }
            for &h in &self.succs[t] {
                if !dom.dominates(h, t) {
                    continue;
                }
                let mut body: BTreeSet<usize> = BTreeSet::new();
                body.insert(h);
                let mut stack = vec![t];
                while let Some(b) = stack.pop() {
                    if body.insert(b) {
                        stack.extend(self.preds[b].iter().copied().filter(|&p| dom.is_reachable(p)));
                    }
                }
                match by_header.iter_mut().find(|(hh, _, _)| *hh == h) {
                    Some((_, latches, blocks)) => {
                        latches.push(t);
                        blocks.extend(body);
                    }
                    None => by_header.push((h, vec![t], body)),
                }
            }
        }
        by_header.sort_by_key(|(_, _, blocks)| std::cmp::Reverse(blocks.len()));
        by_header
            .into_iter()
            .map(|(h, latches, blocks)| Loop {
                header: self.labels[h].clone(),
                latches: latches.iter().map(|&l| self.labels[l].clone()).collect(),
                blocks: blocks.iter().map(|&b| self.labels[b].clone()).collect(),
            })
            .collect()
    }

    /// Predecessors of the loop header from outside the loop.
    pub fn outside_preds(&self, lp: &Loop) -> Vec<String> {
        let Some(h) = self.idx(&lp.header) else {
            return Vec::new();
        };
        self.preds[h]
            .iter()
            .map(|&p| self.labels[p].clone())
            .filter(|l| !lp.contains(l))
            .collect()
    }
}

/// The unique outside predecessor of a loop header that branches only to
/// the header.
pub fn preheader(f: &Function, cfg: &Cfg, lp: &Loop) -> Option<String> {
    let outside = cfg.outside_preds(lp);
    if outside.len() != 1 {
        return None;
    }
    let p = &outside[0];
    let block = f.block(p)?;
    match &block.term {
        Terminator::Br(t) if *t == lp.header => Some(p.clone()),
        _ => None,
    }
}
