//! Control-flow graph built alongside lowering
//!
//! The lowering driver creates one [`CfgBlock`] per IR basic block and one
//! [`CfgEdge`] per transfer, and records a linear-state snapshot every
//! time a block is terminated. The graph itself never mutates linear
//! states; it is the substrate the linear checker walks after the whole
//! function has been lowered.

use crate::registry::LinearState;
use std::collections::{HashMap, HashSet, VecDeque};

pub type BlockId = usize;

/// Linear states of all visible variables at one program point:
/// variable name -> path -> state
pub type LinearSnapshot = HashMap<String, HashMap<Vec<usize>, LinearState>>;

/// Check snapshot compatibility: for every (variable, path), both sides
/// must agree on activeness. Exact states may differ (consumed vs
/// undefined merge fine); active vs anything else does not.
pub fn snapshots_compatible(a: &LinearSnapshot, b: &LinearSnapshot) -> bool {
    let mut names: HashSet<&String> = a.keys().collect();
    names.extend(b.keys());
    for name in names {
        let empty = HashMap::new();
        let pa = a.get(name).unwrap_or(&empty);
        let pb = b.get(name).unwrap_or(&empty);
        let mut paths: HashSet<&Vec<usize>> = pa.keys().collect();
        paths.extend(pb.keys());
        for path in paths {
            let sa = pa.get(path).copied().unwrap_or(LinearState::Undefined);
            let sb = pb.get(path).copied().unwrap_or(LinearState::Undefined);
            if sa.is_active() != sb.is_active() {
                return false;
            }
        }
    }
    true
}

/// One differing (variable, path) between two snapshots
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDiff {
    pub var: String,
    pub path: Vec<usize>,
    pub left: LinearState,
    pub right: LinearState,
}

impl SnapshotDiff {
    pub fn path_display(&self) -> String {
        if self.path.is_empty() {
            self.var.clone()
        } else {
            let parts: Vec<String> = self.path.iter().map(|i| i.to_string()).collect();
            format!("{}.{}", self.var, parts.join("."))
        }
    }
}

/// All activeness differences between two snapshots, sorted for stable
/// error output
pub fn snapshot_diffs(a: &LinearSnapshot, b: &LinearSnapshot) -> Vec<SnapshotDiff> {
    let mut names: Vec<&String> = {
        let mut set: HashSet<&String> = a.keys().collect();
        set.extend(b.keys());
        set.into_iter().collect()
    };
    names.sort();
    let mut diffs = Vec::new();
    for name in names {
        let empty = HashMap::new();
        let pa = a.get(name).unwrap_or(&empty);
        let pb = b.get(name).unwrap_or(&empty);
        let mut paths: Vec<&Vec<usize>> = {
            let mut set: HashSet<&Vec<usize>> = pa.keys().collect();
            set.extend(pb.keys());
            set.into_iter().collect()
        };
        paths.sort();
        for path in paths {
            let sa = pa.get(path).copied().unwrap_or(LinearState::Undefined);
            let sb = pb.get(path).copied().unwrap_or(LinearState::Undefined);
            if sa.is_active() != sb.is_active() {
                diffs.push(SnapshotDiff {
                    var: name.clone(),
                    path: path.clone(),
                    left: sa,
                    right: sb,
                });
            }
        }
    }
    diffs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Sequential,
    BranchTrue,
    BranchFalse,
    LoopBack,
    Goto,
    GotoEnd,
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct CfgEdge {
    pub source: BlockId,
    pub target: BlockId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone)]
pub struct CfgBlock {
    pub id: BlockId,
    /// IR label of the corresponding basic block
    pub ir_label: String,
    /// Function-relative lines of the statements lowered into this block,
    /// kept for error reporting only
    pub stmt_lines: Vec<u32>,
    pub terminated: bool,
}

/// CFG for one function's compilation
#[derive(Debug)]
pub struct Cfg {
    pub func_name: String,
    pub blocks: HashMap<BlockId, CfgBlock>,
    pub edges: Vec<CfgEdge>,
    pub entry: BlockId,
    pub return_blocks: HashSet<BlockId>,
    pub entry_snapshots: HashMap<BlockId, LinearSnapshot>,
    pub exit_snapshots: HashMap<BlockId, LinearSnapshot>,
    next_id: BlockId,
}

impl Cfg {
    pub fn new(func_name: impl Into<String>) -> Self {
        let mut blocks = HashMap::new();
        blocks.insert(
            0,
            CfgBlock {
                id: 0,
                ir_label: "entry".to_string(),
                stmt_lines: Vec::new(),
                terminated: false,
            },
        );
        Cfg {
            func_name: func_name.into(),
            blocks,
            edges: Vec::new(),
            entry: 0,
            return_blocks: HashSet::new(),
            entry_snapshots: HashMap::new(),
            exit_snapshots: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn add_block(&mut self, ir_label: impl Into<String>) -> BlockId {
        let id = self.next_id;
        self.next_id += 1;
        self.blocks.insert(
            id,
            CfgBlock {
                id,
                ir_label: ir_label.into(),
                stmt_lines: Vec::new(),
                terminated: false,
            },
        );
        id
    }

    pub fn add_edge(&mut self, source: BlockId, target: BlockId, kind: EdgeKind) {
        self.edges.push(CfgEdge { source, target, kind });
    }

    pub fn mark_terminated(&mut self, block: BlockId, snapshot: LinearSnapshot) {
        if let Some(b) = self.blocks.get_mut(&block) {
            b.terminated = true;
        }
        self.exit_snapshots.insert(block, snapshot);
    }

    pub fn mark_return(&mut self, block: BlockId) {
        self.return_blocks.insert(block);
    }

    pub fn record_stmt_line(&mut self, block: BlockId, line: u32) {
        if let Some(b) = self.blocks.get_mut(&block) {
            b.stmt_lines.push(line);
        }
    }

    /// An edge is a back edge when tagged as a loop back edge, or when a
    /// goto targets a block created earlier than its source (block ids
    /// follow program order).
    pub fn is_back_edge(edge: &CfgEdge) -> bool {
        match edge.kind {
            EdgeKind::LoopBack => true,
            EdgeKind::Goto | EdgeKind::GotoEnd => edge.target <= edge.source,
            _ => false,
        }
    }

    pub fn back_edges(&self) -> impl Iterator<Item = &CfgEdge> {
        self.edges.iter().filter(|e| Self::is_back_edge(e))
    }

    /// Forward predecessors of a block (back edges excluded)
    pub fn forward_predecessors(&self, block: BlockId) -> Vec<BlockId> {
        self.edges
            .iter()
            .filter(|e| e.target == block && !Self::is_back_edge(e))
            .map(|e| e.source)
            .collect()
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.edges
            .iter()
            .filter(|e| e.source == block)
            .map(|e| e.target)
            .collect()
    }

    /// Blocks reachable from entry, in a topological order over forward
    /// edges. Unreachable blocks are omitted; cycles through back edges do
    /// not stall the walk.
    pub fn topo_order(&self) -> Vec<BlockId> {
        let reachable = self.reachable_set();
        let mut in_degree: HashMap<BlockId, usize> = HashMap::new();
        for id in &reachable {
            in_degree.insert(*id, 0);
        }
        for e in &self.edges {
            if Self::is_back_edge(e) {
                continue;
            }
            if reachable.contains(&e.source) && reachable.contains(&e.target) {
                *in_degree.entry(e.target).or_insert(0) += 1;
            }
        }
        let mut queue: VecDeque<BlockId> = VecDeque::new();
        if reachable.contains(&self.entry) {
            queue.push_back(self.entry);
        }
        // Other zero-in-degree reachable blocks (targets of back edges only)
        let mut seeds: Vec<BlockId> = reachable
            .iter()
            .copied()
            .filter(|id| *id != self.entry && in_degree.get(id) == Some(&0))
            .collect();
        seeds.sort_unstable();
        queue.extend(seeds);

        let mut order = Vec::with_capacity(reachable.len());
        let mut seen: HashSet<BlockId> = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            let mut next: Vec<BlockId> = Vec::new();
            for e in &self.edges {
                if e.source != id || Self::is_back_edge(e) {
                    continue;
                }
                if !reachable.contains(&e.target) {
                    continue;
                }
                let deg = in_degree.get_mut(&e.target).expect("reachable target");
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    next.push(e.target);
                }
            }
            next.sort_unstable();
            queue.extend(next);
        }
        order
    }

    fn reachable_set(&self) -> HashSet<BlockId> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.entry];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            for e in &self.edges {
                if e.source == id && !seen.contains(&e.target) {
                    stack.push(e.target);
                }
            }
        }
        seen
    }

    /// Reachable blocks with no successors at all (sinks). Explicit return
    /// blocks are exits even when a trailing unreachable-continuation block
    /// was appended after them.
    pub fn exit_blocks(&self) -> Vec<BlockId> {
        let reachable = self.reachable_set();
        let mut exits: Vec<BlockId> = reachable
            .iter()
            .copied()
            .filter(|id| self.successors(*id).is_empty() || self.return_blocks.contains(id))
            .collect();
        exits.sort_unstable();
        exits.dedup();
        exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(var: &str, path: Vec<usize>, state: LinearState) -> LinearSnapshot {
        let mut s = LinearSnapshot::new();
        s.entry(var.to_string()).or_default().insert(path, state);
        s
    }

    #[test]
    fn test_compatibility_ignores_consumed_vs_undefined() {
        let a = snap("t", vec![], LinearState::Consumed);
        let b = snap("t", vec![], LinearState::Undefined);
        assert!(snapshots_compatible(&a, &b));
    }

    #[test]
    fn test_compatibility_rejects_active_mismatch() {
        let a = snap("t", vec![], LinearState::Active);
        let b = snap("t", vec![], LinearState::Consumed);
        assert!(!snapshots_compatible(&a, &b));
        let diffs = snapshot_diffs(&a, &b);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path_display(), "t");
    }

    #[test]
    fn test_missing_variable_is_undefined() {
        let a = snap("t", vec![0], LinearState::Active);
        let b = LinearSnapshot::new();
        assert!(!snapshots_compatible(&a, &b));
        let diffs = snapshot_diffs(&a, &b);
        assert_eq!(diffs[0].path_display(), "t.0");
    }

    #[test]
    fn test_topo_order_linear_chain() {
        let mut cfg = Cfg::new("f");
        let b1 = cfg.add_block("b1");
        let b2 = cfg.add_block("b2");
        cfg.add_edge(cfg.entry, b1, EdgeKind::Sequential);
        cfg.add_edge(b1, b2, EdgeKind::Sequential);
        assert_eq!(cfg.topo_order(), vec![cfg.entry, b1, b2]);
    }

    #[test]
    fn test_topo_order_skips_back_edges() {
        let mut cfg = Cfg::new("f");
        let header = cfg.add_block("loop_header");
        let body = cfg.add_block("loop_body");
        let exit = cfg.add_block("loop_exit");
        cfg.add_edge(cfg.entry, header, EdgeKind::Sequential);
        cfg.add_edge(header, body, EdgeKind::BranchTrue);
        cfg.add_edge(header, exit, EdgeKind::BranchFalse);
        cfg.add_edge(body, header, EdgeKind::LoopBack);
        let order = cfg.topo_order();
        assert_eq!(order.len(), 4);
        let pos = |id: BlockId| order.iter().position(|b| *b == id).unwrap();
        assert!(pos(header) < pos(body));
        assert!(pos(header) < pos(exit));
    }

    #[test]
    fn test_unreachable_blocks_omitted() {
        let mut cfg = Cfg::new("f");
        let reachable = cfg.add_block("b1");
        let orphan = cfg.add_block("orphan");
        cfg.add_edge(cfg.entry, reachable, EdgeKind::Sequential);
        let order = cfg.topo_order();
        assert!(order.contains(&reachable));
        assert!(!order.contains(&orphan));
    }

    #[test]
    fn test_exit_blocks_include_returns() {
        let mut cfg = Cfg::new("f");
        let ret = cfg.add_block("ret");
        let cont = cfg.add_block("unreachable_cont");
        cfg.add_edge(cfg.entry, ret, EdgeKind::Sequential);
        cfg.add_edge(ret, cont, EdgeKind::Unreachable);
        cfg.mark_return(ret);
        let exits = cfg.exit_blocks();
        assert!(exits.contains(&ret));
    }

    #[test]
    fn test_forward_goto_is_not_back_edge() {
        let e = CfgEdge { source: 1, target: 5, kind: EdgeKind::Goto };
        assert!(!Cfg::is_back_edge(&e));
        let e = CfgEdge { source: 5, target: 1, kind: EdgeKind::Goto };
        assert!(Cfg::is_back_edge(&e));
    }
}
