//! Direct-call graph of a module.

use std::collections::BTreeSet;

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::{Dfs, Reversed};

use super::Module;

/// Caller → callee edges between function names. Declarations are nodes
/// without outgoing edges.
pub struct CallGraph<'m> {
    graph: DiGraphMap<&'m str, ()>,
}

impl<'m> CallGraph<'m> {
    pub fn new(module: &'m Module) -> Self {
        let mut graph = DiGraphMap::new();
        for f in &module.functions {
            graph.add_node(f.name.as_str());
        }
        for f in &module.functions {
            for inst in f.insts() {
                if let Some(callee) = inst.callee() {
                    if let Some(target) = module.function(callee) {
                        graph.add_edge(f.name.as_str(), target.name.as_str(), ());
                    }
                }
            }
        }
        Self { graph }
    }

    /// `root` plus every function reachable from it by direct calls.
    pub fn closure(&self, root: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let Some(start) = self.graph.nodes().find(|n| *n == root) else {
            return out;
        };
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(n) = dfs.next(&self.graph) {
            out.insert(n.to_string());
        }
        out
    }

    /// Every function that can reach one of `targets` through calls,
    /// targets included.
    pub fn callers_of(&self, targets: &BTreeSet<String>) -> BTreeSet<String> {
        let reversed = Reversed(&self.graph);
        let mut out = BTreeSet::new();
        for t in targets {
            let Some(start) = self.graph.nodes().find(|n| *n == t.as_str()) else {
                continue;
            };
            let mut dfs = Dfs::new(reversed, start);
            while let Some(n) = dfs.next(reversed) {
                out.insert(n.to_string());
            }
        }
        out
    }

    pub fn callees(&self, caller: &str) -> Vec<&'m str> {
        match self.graph.nodes().find(|n| *n == caller) {
            Some(n) => self.graph.neighbors(n).collect(),
            None => Vec::new(),
        }
    }
}
