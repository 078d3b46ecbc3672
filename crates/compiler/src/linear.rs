//! Linear-resource checker: forward dataflow over the CFG
//!
//! The lowering driver is the single source of truth for in-block state
//! transitions; it records entry/exit snapshots on the CFG as it lowers.
//! This checker replays those snapshots and validates the three global
//! invariants:
//!
//! 1. merge points: all forward predecessors must agree on activeness
//! 2. loop back edges: the back-edge source must match the header entry
//! 3. function exits: every path must be consumed, and all exits agree
//!
//! The activeness relation is exact compatibility, not a join: divergent
//! linearity is always an error.

use crate::cfg::{snapshot_diffs, snapshots_compatible, BlockId, Cfg, LinearSnapshot, SnapshotDiff};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearErrorKind {
    MergeInconsistent,
    LoopInvariantViolated,
    UnconsumedAtExit,
    ExitInconsistent,
}

impl LinearErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            LinearErrorKind::MergeInconsistent => "merge_inconsistent",
            LinearErrorKind::LoopInvariantViolated => "loop_invariant_violated",
            LinearErrorKind::UnconsumedAtExit => "unconsumed_at_exit",
            LinearErrorKind::ExitInconsistent => "exit_inconsistent",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinearCheckError {
    pub kind: LinearErrorKind,
    pub block: BlockId,
    pub message: String,
    pub diffs: Vec<SnapshotDiff>,
}

impl LinearCheckError {
    pub fn format(&self) -> String {
        let mut out = format!("{}: {}", self.kind.name(), self.message);
        for diff in &self.diffs {
            out.push_str(&format!(
                "\n  {}: {} vs {}",
                diff.path_display(),
                diff.left.name(),
                diff.right.name()
            ));
        }
        out
    }
}

/// Validate one function's CFG. Returns every violation found, in block
/// order, so callers can report them all at once.
pub fn check_cfg(cfg: &Cfg) -> Vec<LinearCheckError> {
    let mut errors = Vec::new();
    let order = cfg.topo_order();
    debug!(func = %cfg.func_name, blocks = order.len(), "linear check");

    // 1. Merge compatibility at every block with several forward preds
    for &block in &order {
        let preds = cfg.forward_predecessors(block);
        if preds.len() < 2 {
            continue;
        }
        let with_snapshots: Vec<(BlockId, &LinearSnapshot)> = preds
            .iter()
            .filter_map(|p| cfg.exit_snapshots.get(p).map(|s| (*p, s)))
            .collect();
        for window in with_snapshots.windows(2) {
            let (pa, sa) = window[0];
            let (pb, sb) = window[1];
            if !snapshots_compatible(sa, sb) {
                errors.push(LinearCheckError {
                    kind: LinearErrorKind::MergeInconsistent,
                    block,
                    message: format!(
                        "paths into block {} disagree on linear state (from blocks {} and {})",
                        block, pa, pb
                    ),
                    diffs: snapshot_diffs(sa, sb),
                });
            }
        }
    }

    // 2. Loop invariant on every back edge
    for edge in cfg.back_edges() {
        let (Some(exit), Some(entry)) = (
            cfg.exit_snapshots.get(&edge.source),
            cfg.entry_snapshots.get(&edge.target),
        ) else {
            continue;
        };
        if !snapshots_compatible(exit, entry) {
            errors.push(LinearCheckError {
                kind: LinearErrorKind::LoopInvariantViolated,
                block: edge.target,
                message: format!(
                    "loop body (block {}) changes linear state relative to loop entry (block {})",
                    edge.source, edge.target
                ),
                diffs: snapshot_diffs(exit, entry),
            });
        }
    }

    // 3. Exit discipline: nothing active at any exit, and exits agree
    let exits = cfg.exit_blocks();
    let mut first_exit: Option<(BlockId, &LinearSnapshot)> = None;
    for &block in &exits {
        let Some(snapshot) = cfg.exit_snapshots.get(&block) else {
            continue;
        };
        let mut leaked: Vec<SnapshotDiff> = Vec::new();
        for (var, paths) in snapshot {
            for (path, state) in paths {
                if state.is_active() {
                    leaked.push(SnapshotDiff {
                        var: var.clone(),
                        path: path.clone(),
                        left: *state,
                        right: crate::registry::LinearState::Consumed,
                    });
                }
            }
        }
        if !leaked.is_empty() {
            leaked.sort_by(|a, b| a.var.cmp(&b.var).then(a.path.cmp(&b.path)));
            let names: Vec<String> = leaked.iter().map(|d| d.path_display()).collect();
            errors.push(LinearCheckError {
                kind: LinearErrorKind::UnconsumedAtExit,
                block,
                message: format!(
                    "linear token{} {} still active at function exit",
                    if names.len() == 1 { "" } else { "s" },
                    names.join(", ")
                ),
                diffs: leaked,
            });
        }
        match first_exit {
            None => first_exit = Some((block, snapshot)),
            Some((first_block, first_snapshot)) => {
                if !snapshots_compatible(first_snapshot, snapshot) {
                    errors.push(LinearCheckError {
                        kind: LinearErrorKind::ExitInconsistent,
                        block,
                        message: format!(
                            "exit block {} disagrees with exit block {} on linear state",
                            block, first_block
                        ),
                        diffs: snapshot_diffs(first_snapshot, snapshot),
                    });
                }
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::EdgeKind;
    use crate::registry::LinearState;
    use std::collections::HashMap;

    fn snap(entries: &[(&str, Vec<usize>, LinearState)]) -> LinearSnapshot {
        let mut s = LinearSnapshot::new();
        for (var, path, state) in entries {
            s.entry(var.to_string())
                .or_insert_with(HashMap::new)
                .insert(path.clone(), *state);
        }
        s
    }

    #[test]
    fn test_consumed_on_straight_line_passes() {
        let mut cfg = Cfg::new("main");
        let body = cfg.add_block("body");
        cfg.add_edge(cfg.entry, body, EdgeKind::Sequential);
        cfg.entry_snapshots
            .insert(cfg.entry, snap(&[("t", vec![], LinearState::Active)]));
        cfg.mark_terminated(cfg.entry, snap(&[("t", vec![], LinearState::Active)]));
        cfg.entry_snapshots
            .insert(body, snap(&[("t", vec![], LinearState::Active)]));
        cfg.mark_terminated(body, snap(&[("t", vec![], LinearState::Consumed)]));
        cfg.mark_return(body);
        assert!(check_cfg(&cfg).is_empty());
    }

    #[test]
    fn test_unconsumed_at_exit() {
        let mut cfg = Cfg::new("main");
        cfg.entry_snapshots
            .insert(cfg.entry, snap(&[("t", vec![], LinearState::Active)]));
        cfg.mark_terminated(cfg.entry, snap(&[("t", vec![], LinearState::Active)]));
        cfg.mark_return(cfg.entry);
        let errors = check_cfg(&cfg);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, LinearErrorKind::UnconsumedAtExit);
        assert!(errors[0].format().contains("t"));
    }

    #[test]
    fn test_merge_inconsistent_branches() {
        // if cond: consume(t)   (no else) -> merge disagrees
        let mut cfg = Cfg::new("main");
        let then_b = cfg.add_block("if_then");
        let else_b = cfg.add_block("if_else");
        let merge = cfg.add_block("if_merge");
        cfg.add_edge(cfg.entry, then_b, EdgeKind::BranchTrue);
        cfg.add_edge(cfg.entry, else_b, EdgeKind::BranchFalse);
        cfg.add_edge(then_b, merge, EdgeKind::Sequential);
        cfg.add_edge(else_b, merge, EdgeKind::Sequential);
        cfg.mark_terminated(cfg.entry, snap(&[("t", vec![], LinearState::Active)]));
        cfg.mark_terminated(then_b, snap(&[("t", vec![], LinearState::Consumed)]));
        cfg.mark_terminated(else_b, snap(&[("t", vec![], LinearState::Active)]));
        let errors = check_cfg(&cfg);
        assert!(errors
            .iter()
            .any(|e| e.kind == LinearErrorKind::MergeInconsistent));
        let merge_err = errors
            .iter()
            .find(|e| e.kind == LinearErrorKind::MergeInconsistent)
            .unwrap();
        assert_eq!(merge_err.block, merge);
        assert_eq!(merge_err.diffs.len(), 1);
    }

    #[test]
    fn test_loop_invariant_violation() {
        // while cond: consume(t)  - consumes a pre-loop token inside the body
        let mut cfg = Cfg::new("main");
        let header = cfg.add_block("while_header");
        let body = cfg.add_block("while_body");
        let exit = cfg.add_block("while_exit");
        cfg.add_edge(cfg.entry, header, EdgeKind::Sequential);
        cfg.add_edge(header, body, EdgeKind::BranchTrue);
        cfg.add_edge(header, exit, EdgeKind::BranchFalse);
        cfg.add_edge(body, header, EdgeKind::LoopBack);
        cfg.mark_terminated(cfg.entry, snap(&[("t", vec![], LinearState::Active)]));
        cfg.entry_snapshots
            .insert(header, snap(&[("t", vec![], LinearState::Active)]));
        cfg.mark_terminated(header, snap(&[("t", vec![], LinearState::Active)]));
        cfg.mark_terminated(body, snap(&[("t", vec![], LinearState::Consumed)]));
        cfg.mark_terminated(exit, snap(&[("t", vec![], LinearState::Consumed)]));
        cfg.mark_return(exit);
        let errors = check_cfg(&cfg);
        assert!(errors
            .iter()
            .any(|e| e.kind == LinearErrorKind::LoopInvariantViolated));
    }

    #[test]
    fn test_exit_inconsistent() {
        let mut cfg = Cfg::new("main");
        let ret_a = cfg.add_block("ret_a");
        let ret_b = cfg.add_block("ret_b");
        cfg.add_edge(cfg.entry, ret_a, EdgeKind::BranchTrue);
        cfg.add_edge(cfg.entry, ret_b, EdgeKind::BranchFalse);
        cfg.mark_terminated(cfg.entry, snap(&[]));
        // a consumed its token, b never defined one: both non-active, fine.
        cfg.mark_terminated(ret_a, snap(&[("t", vec![], LinearState::Consumed)]));
        cfg.mark_terminated(ret_b, snap(&[("u", vec![], LinearState::Active)]));
        cfg.mark_return(ret_a);
        cfg.mark_return(ret_b);
        let errors = check_cfg(&cfg);
        // 'u' active at exit b: unconsumed + exits disagree
        assert!(errors
            .iter()
            .any(|e| e.kind == LinearErrorKind::UnconsumedAtExit));
        assert!(errors
            .iter()
            .any(|e| e.kind == LinearErrorKind::ExitInconsistent));
    }

    #[test]
    fn test_infinite_loop_without_break_passes() {
        // while True with no break: exit block exists but is unreachable
        let mut cfg = Cfg::new("main");
        let header = cfg.add_block("while_header");
        let body = cfg.add_block("while_body");
        let _exit = cfg.add_block("while_exit");
        cfg.add_edge(cfg.entry, header, EdgeKind::Sequential);
        cfg.add_edge(header, body, EdgeKind::Sequential);
        cfg.add_edge(body, header, EdgeKind::LoopBack);
        cfg.mark_terminated(cfg.entry, snap(&[("t", vec![], LinearState::Active)]));
        cfg.entry_snapshots
            .insert(header, snap(&[("t", vec![], LinearState::Active)]));
        cfg.mark_terminated(header, snap(&[("t", vec![], LinearState::Active)]));
        cfg.mark_terminated(body, snap(&[("t", vec![], LinearState::Active)]));
        // No reachable exit: nothing to check, token is trapped in the loop
        assert!(check_cfg(&cfg).is_empty());
    }
}
