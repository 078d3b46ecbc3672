//! Scoped labels and goto / goto_end
//!
//! `with label("X"):` creates two blocks: `X.begin` at the parent scope
//! (visible to siblings and nephews) and `X.end` inside the body (visible
//! only from within). Visibility:
//!
//! - `goto("X")`: self, ancestors, siblings, uncles
//! - `goto_end("X")`: self and ancestors only
//!
//! Both forms exit to the target's parent depth, emitting defers for every
//! scope left behind. Forward references branch through a fixup block that
//! is filled in (defers + final jump) when the label appears; a fixup left
//! unfilled at function end is an unresolved-goto error.

use crate::ast::Stmt;
use crate::cfg::{BlockId, EdgeKind, LinearSnapshot};
use crate::error::{CompileError, CompileResult};
use std::collections::HashMap;

use super::Visitor;

#[derive(Debug, Clone)]
pub struct LabelContext {
    pub name: String,
    /// Depth inside the label body
    pub scope_depth: usize,
    /// Depth at the `with` statement
    pub parent_scope_depth: usize,
    pub begin_block: BlockId,
    pub begin_label: String,
    pub end_block: BlockId,
    pub end_label: String,
    pub line: u32,
    pub used: bool,
}

#[derive(Debug, Clone)]
pub struct PendingGoto {
    pub name: String,
    pub fixup_block: BlockId,
    pub fixup_label: String,
    pub origin_scope_depth: usize,
    /// Defer-stack length at the goto site
    pub defer_len: usize,
    pub snapshot: LinearSnapshot,
    pub line: u32,
}

#[derive(Debug, Default)]
pub struct LabelState {
    pub all: Vec<LabelContext>,
    /// Indices of the current nesting chain
    pub stack: Vec<usize>,
    pub by_name: HashMap<String, usize>,
    /// parent depth -> labels opened at that depth (sibling/uncle lookup)
    pub by_parent: HashMap<usize, Vec<usize>>,
    pub pending: Vec<PendingGoto>,
}

impl Visitor<'_> {
    pub(crate) fn lower_label_block(
        &mut self,
        name: &str,
        body: &[Stmt],
        line: u32,
    ) -> CompileResult<()> {
        if self.labels.by_name.contains_key(name) {
            return Err(self.err_at(
                CompileError::syntax(format!("duplicate label '{}'", name)),
                line,
            ));
        }
        let parent_depth = self.vars.depth();
        let (begin_block, begin_label) = self.new_named_block(&format!("L_{}_begin", name));
        let (end_block, end_label) = self.new_named_block(&format!("L_{}_end", name));

        self.branch_to(begin_block, &begin_label.clone(), EdgeKind::Sequential)?;

        let index = self.labels.all.len();
        self.labels.by_name.insert(name.to_string(), index);
        self.labels
            .by_parent
            .entry(parent_depth)
            .or_default()
            .push(index);
        self.labels.stack.push(index);

        self.open_scope();
        self.labels.all.push(LabelContext {
            name: name.to_string(),
            scope_depth: self.vars.depth(),
            parent_scope_depth: parent_depth,
            begin_block,
            begin_label: begin_label.clone(),
            end_block,
            end_label: end_label.clone(),
            line,
            used: false,
        });

        // A label definition satisfies any forward gotos waiting on it
        self.resolve_pending_gotos(index)?;

        self.switch_to(begin_block, &begin_label)?;
        let lowered = self.lower_stmts(body);
        self.labels.stack.pop();
        lowered?;
        self.close_scope(line)?;
        if !self.func.current_terminated() {
            self.cfg
                .add_edge(self.current_block, end_block, EdgeKind::Sequential);
            self.func.branch(&end_label)?;
            self.seal_current();
        }
        self.switch_to(end_block, &end_label)
    }

    /// `goto("X")` / `goto_end("X")`
    pub(crate) fn lower_goto(&mut self, name: &str, is_end: bool, line: u32) -> CompileResult<()> {
        if let Some(&index) = self.labels.by_name.get(name) {
            let context = self.labels.all[index].clone();
            let on_stack = self.labels.stack.contains(&index);
            if is_end {
                if !on_stack {
                    return Err(self.err_at(
                        CompileError::syntax(format!(
                            "goto_end('{}') must be inside the label it targets",
                            name
                        )),
                        line,
                    ));
                }
            } else if !on_stack && context.parent_scope_depth > self.vars.depth() {
                return Err(self.err_at(
                    CompileError::syntax(format!(
                        "label '{}' is not visible from here",
                        name
                    )),
                    line,
                ));
            }
            self.labels.all[index].used = true;

            // Both forms exit every scope down to the target's parent
            self.emit_defers_down_to_exclusive(context.parent_scope_depth, line)?;

            let (target_block, target_label, kind) = if is_end {
                (context.end_block, context.end_label.clone(), EdgeKind::GotoEnd)
            } else {
                (context.begin_block, context.begin_label.clone(), EdgeKind::Goto)
            };
            self.cfg.add_edge(self.current_block, target_block, kind);
            self.func.branch(&target_label)?;
            self.seal_current();
            return Ok(());
        }

        if is_end {
            // Ancestors are already on the stack, so an unknown goto_end
            // target can never become legal later
            return Err(self.err_at(
                CompileError::syntax(format!(
                    "goto_end('{}') must be inside the label it targets",
                    name
                )),
                line,
            ));
        }

        // Forward reference: jump through a fixup block that the label
        // definition fills in
        let (fixup_block, fixup_label) = self.new_block(&format!("goto_{}_fixup", name));
        self.cfg
            .add_edge(self.current_block, fixup_block, EdgeKind::Sequential);
        self.func.branch(&fixup_label)?;
        self.seal_current();
        self.labels.pending.push(PendingGoto {
            name: name.to_string(),
            fixup_block,
            fixup_label,
            origin_scope_depth: self.vars.depth(),
            defer_len: self.defers.len(),
            snapshot: self.capture_snapshot(),
            line,
        });
        Ok(())
    }

    /// Defers for scopes strictly deeper than `parent_depth`
    fn emit_defers_down_to_exclusive(&mut self, parent_depth: usize, line: u32) -> CompileResult<()> {
        let mut depth = self.vars.depth();
        while depth > parent_depth {
            self.emit_defers_for_scope(depth, line)?;
            depth -= 1;
        }
        Ok(())
    }

    /// Fill in fixup blocks for forward gotos now satisfied by `index`
    fn resolve_pending_gotos(&mut self, index: usize) -> CompileResult<()> {
        let context = self.labels.all[index].clone();
        let waiting: Vec<PendingGoto> = {
            let (resolved, still_pending): (Vec<_>, Vec<_>) = self
                .labels
                .pending
                .drain(..)
                .partition(|p| p.name == context.name);
            self.labels.pending = still_pending;
            resolved
        };
        if waiting.is_empty() {
            return Ok(());
        }
        self.labels.all[index].used = true;

        let saved_label = self.func.current_label().to_string();
        let saved_block = self.current_block;
        for pending in waiting {
            // A forward target must sit at or above the origin's nesting
            // (sibling or uncle); jumping into a deeper scope is invalid
            if context.parent_scope_depth > pending.origin_scope_depth {
                return Err(self.err_at(
                    CompileError::syntax(format!(
                        "goto('{}') jumps into a scope it never entered",
                        context.name
                    )),
                    pending.line,
                ));
            }
            self.func.position_at(&pending.fixup_label)?;
            self.current_block = pending.fixup_block;
            self.cfg
                .entry_snapshots
                .insert(pending.fixup_block, pending.snapshot.clone());
            self.emit_defer_snapshot(
                pending.defer_len,
                context.parent_scope_depth,
                pending.line,
            )?;
            self.cfg
                .add_edge(pending.fixup_block, context.begin_block, EdgeKind::Goto);
            self.func.branch(&context.begin_label)?;
            self.cfg
                .mark_terminated(pending.fixup_block, pending.snapshot.clone());
        }
        self.func.position_at(&saved_label)?;
        self.current_block = saved_block;
        Ok(())
    }

    /// Flat `__label("n")`: a bare jump target at the current scope
    pub(crate) fn flat_label(&mut self, name: &str, line: u32) -> CompileResult<()> {
        if self.labels.by_name.contains_key(name) {
            return Err(self.err_at(
                CompileError::syntax(format!("duplicate label '{}'", name)),
                line,
            ));
        }
        let (block, label) = self.new_named_block(&format!("L_{}_begin", name));
        self.branch_to(block, &label.clone(), EdgeKind::Sequential)?;
        let depth = self.vars.depth();
        let index = self.labels.all.len();
        self.labels.by_name.insert(name.to_string(), index);
        self.labels.by_parent.entry(depth).or_default().push(index);
        self.labels.all.push(LabelContext {
            name: name.to_string(),
            scope_depth: depth,
            parent_scope_depth: depth,
            begin_block: block,
            begin_label: label.clone(),
            end_block: block,
            end_label: label.clone(),
            line,
            used: false,
        });
        self.resolve_pending_gotos(index)?;
        self.switch_to(block, &label)
    }

    /// Called at function end: pending gotos are fatal, unused labels warn
    pub(crate) fn check_unresolved_labels(&mut self) -> CompileResult<()> {
        if let Some(pending) = self.labels.pending.first() {
            return Err(self.err_at(
                CompileError::syntax(format!("unresolved goto('{}')", pending.name)),
                pending.line,
            ));
        }
        let unused: Vec<(String, u32)> = self
            .labels
            .all
            .iter()
            .filter(|l| !l.used)
            .map(|l| (l.name.clone(), l.line))
            .collect();
        for (name, line) in unused {
            let location = self.location(line);
            self.session
                .warn(format!("unused label '{}' ({})", name, location));
        }
        Ok(())
    }
}
