//! AST lowering driver
//!
//! The visitor walks one function's statements, emitting IR through the
//! builder adapter while growing the CFG, the linear states, the defer
//! stack, and the label registry in lockstep. After the whole group is
//! lowered, the linear checker replays the recorded CFG snapshots.
//!
//! Submodules:
//! - `exprs`: expression lowering and the type-dispatch protocol
//! - `assignments`: assign / annotated assign / augmented assign
//! - `calls`: call lowering, intrinsics, ABI, inline splicing
//! - `control_flow`: if / while / for / match / with / try
//! - `defer`: deferred-call stack and exit emission
//! - `labels`: scoped labels and goto / goto_end

mod assignments;
mod calls;
mod control_flow;
mod defer;
mod exprs;
mod labels;

use crate::ast::{FunctionDef, SourceLocation, Stmt, StmtKind};
use crate::build::deps::GroupKey;
use crate::cfg::{BlockId, Cfg, EdgeKind, LinearSnapshot};
use crate::effects::EffectContext;
use crate::error::{CompileError, CompileResult};
use crate::ir::{FunctionIr, IrModule};
use crate::registry::{LinearState, VariableInfo, VariableRegistry};
use crate::session::CompilerSession;
use crate::types::Type;
use crate::valueref::ValueRef;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::debug;

pub use defer::DeferEntry;
pub use labels::{LabelContext, LabelState};

/// Innermost-loop bookkeeping for break/continue
#[derive(Debug, Clone)]
pub(crate) struct LoopFrame {
    pub header_label: String,
    pub header_block: BlockId,
    pub exit_label: String,
    pub exit_block: BlockId,
    /// Scope depth of the loop body
    pub scope_depth: usize,
}

/// A callee that must be specialized with the current effect suffix and
/// compiled into the same group
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingSpecialization {
    pub qualified_name: String,
    pub context: EffectContext,
}

/// Lowers one function body into IR + CFG
pub struct Visitor<'a> {
    pub(crate) session: &'a mut CompilerSession,
    pub(crate) module_ir: &'a mut IrModule,
    pub(crate) func: FunctionIr,
    pub(crate) cfg: Cfg,
    pub(crate) vars: VariableRegistry,
    pub(crate) current_block: BlockId,
    /// File whose namespace bare names resolve in; swapped while splicing
    /// a yield body from another module
    pub(crate) current_file: PathBuf,
    pub(crate) qualified_name: String,
    pub(crate) group_key: GroupKey,
    pub(crate) return_type: Type,
    pub(crate) func_start_line: u32,
    pub(crate) effect_context: EffectContext,
    pub(crate) loop_frames: Vec<LoopFrame>,
    pub(crate) defers: Vec<DeferEntry>,
    pub(crate) labels: LabelState,
    pub(crate) inline_counter: u32,
    pub(crate) pending_specializations: Vec<PendingSpecialization>,
}

impl<'a> Visitor<'a> {
    pub fn new(
        session: &'a mut CompilerSession,
        module_ir: &'a mut IrModule,
        def: &FunctionDef,
        qualified_name: &str,
        mangled_name: &str,
        group_key: GroupKey,
        effect_context: EffectContext,
    ) -> CompileResult<Self> {
        let info = session
            .functions
            .get(qualified_name)
            .ok_or_else(|| {
                CompileError::name_error(format!("function '{}' is not registered", qualified_name))
            })?
            .clone();
        let ret_ir = info.return_type.ir_type()?;
        let mut func = FunctionIr::new(mangled_name, ret_ir);
        let cfg = Cfg::new(mangled_name);
        let mut vars = VariableRegistry::new();

        // Parameters: linear ones are zero-sized at the ABI and carry no
        // operand; everything else gets a stack slot so the body can take
        // addresses uniformly
        for (name, ty) in info.param_names.iter().zip(info.param_types.iter()) {
            let mut var = VariableInfo::new(name.clone(), 0, ty.clone());
            var.is_parameter = true;
            if ty.contains_linear() {
                var.activate_linear_paths();
            }
            if !ty.is_linear() {
                let ir_ty = ty.ir_type()?;
                let operand = func.add_param(&ir_ty, name);
                let slot = func.alloca(&ir_ty, name);
                // Spilling the incoming value initializes fresh storage;
                // declared qualifiers only constrain later stores
                func.store(&ir_ty, &operand, &slot, crate::types::Qualifiers::NONE)?;
                var.storage = Some(slot);
            }
            vars.declare(var)?;
        }

        let mut visitor = Visitor {
            session,
            module_ir,
            func,
            cfg,
            vars,
            current_block: 0,
            current_file: group_key.file.clone(),
            qualified_name: qualified_name.to_string(),
            group_key,
            return_type: info.return_type.clone(),
            func_start_line: def.start_line,
            effect_context,
            loop_frames: Vec::new(),
            defers: Vec::new(),
            labels: LabelState::default(),
            inline_counter: 0,
            pending_specializations: Vec::new(),
        };
        let entry_snapshot = visitor.capture_snapshot();
        visitor.cfg.entry_snapshots.insert(0, entry_snapshot);
        Ok(visitor)
    }

    /// True source location of a function-relative statement line
    pub(crate) fn location(&self, line: u32) -> SourceLocation {
        SourceLocation::new(
            self.group_key.file.clone(),
            self.func_start_line + line.saturating_sub(1),
        )
    }

    pub(crate) fn err_at(&self, err: CompileError, line: u32) -> CompileError {
        err.with_location(self.location(line))
    }

    // ---- block management -------------------------------------------------

    /// Create a linked IR block + CFG block
    pub(crate) fn new_block(&mut self, prefix: &str) -> (BlockId, String) {
        let label = self.func.add_block(prefix);
        let id = self.cfg.add_block(label.clone());
        (id, label)
    }

    /// Create a block with an exact label (scoped label begin/end blocks)
    pub(crate) fn new_named_block(&mut self, label: &str) -> (BlockId, String) {
        let label = self.func.add_named_block(label);
        let id = self.cfg.add_block(label.clone());
        (id, label)
    }

    /// Switch the insertion point, recording the entry snapshot
    pub(crate) fn switch_to(&mut self, block: BlockId, label: &str) -> CompileResult<()> {
        self.func.position_at(label)?;
        self.current_block = block;
        let snapshot = self.capture_snapshot();
        self.cfg.entry_snapshots.entry(block).or_insert(snapshot);
        Ok(())
    }

    /// Record the exit snapshot of the current block and mark it done
    pub(crate) fn seal_current(&mut self) {
        let snapshot = self.capture_snapshot();
        self.cfg.mark_terminated(self.current_block, snapshot);
    }

    /// Branch to `target`, sealing the current block
    pub(crate) fn branch_to(&mut self, target: BlockId, label: &str, kind: EdgeKind) -> CompileResult<()> {
        self.cfg.add_edge(self.current_block, target, kind);
        self.func.branch(label)?;
        self.seal_current();
        Ok(())
    }

    pub(crate) fn capture_snapshot(&self) -> LinearSnapshot {
        let mut snapshot = LinearSnapshot::new();
        for (name, info) in self.vars.visible() {
            if !info.linear_states.is_empty() {
                snapshot.insert(name.to_string(), info.linear_states.clone());
            }
        }
        snapshot
    }

    /// When statements follow a terminator, lowering continues into a
    /// fresh continuation block that only unreachable paths enter
    pub(crate) fn ensure_open_block(&mut self) -> CompileResult<()> {
        if !self.func.current_terminated() {
            return Ok(());
        }
        let (id, label) = self.new_block("unreachable_cont");
        self.cfg
            .add_edge(self.current_block, id, EdgeKind::Unreachable);
        self.switch_to(id, &label)
    }

    // ---- linear state helpers ---------------------------------------------

    pub(crate) fn linear_state_of(&self, var: &str, path: &[usize]) -> LinearState {
        self.vars
            .lookup(var)
            .map(|v| v.linear_state(path))
            .unwrap_or(LinearState::Undefined)
    }

    pub(crate) fn set_linear_state(&mut self, var: &str, path: &[usize], state: LinearState) {
        if let Some(info) = self.vars.lookup_mut(var) {
            info.linear_states.insert(path.to_vec(), state);
        }
    }

    /// Consume a linear source (function argument, move, explicit consume).
    /// Inside a loop, consuming a token that was activated outside the loop
    /// is rejected up front; the CFG check would also catch it at the back
    /// edge, but this gives a precise location.
    pub(crate) fn consume_linear(&mut self, value: &ValueRef, line: u32) -> CompileResult<()> {
        let (Some(var), Some(path)) = (&value.var_name, &value.linear_path) else {
            return Ok(());
        };
        let state = self.linear_state_of(var, path);
        if !state.is_active() {
            return Err(self.err_at(
                CompileError::linear(format!(
                    "use_after_{}: token '{}' is {}",
                    if state == LinearState::Moved { "move" } else { "consume" },
                    var,
                    state.name()
                )),
                line,
            ));
        }
        if let Some(info) = self.vars.lookup(var) {
            if !self.loop_frames.is_empty()
                && info.linear_scope_depth < self.innermost_loop_depth()
            {
                return Err(self.err_at(
                    CompileError::linear(format!(
                        "loop_invariant_violated: token '{}' was active before the loop \
                         and cannot be consumed inside it",
                        var
                    )),
                    line,
                ));
            }
        }
        let var = var.clone();
        let path = path.clone();
        self.set_linear_state(&var, &path, LinearState::Consumed);
        Ok(())
    }

    fn innermost_loop_depth(&self) -> usize {
        self.loop_frames
            .last()
            .map(|f| f.scope_depth)
            .unwrap_or(0)
    }

    // ---- statement dispatch -----------------------------------------------

    pub(crate) fn lower_stmts(&mut self, stmts: &[Stmt]) -> CompileResult<()> {
        for stmt in stmts {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    pub(crate) fn lower_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        self.ensure_open_block()?;
        self.cfg.record_stmt_line(self.current_block, stmt.line);
        match &stmt.kind {
            StmtKind::Pass => Ok(()),
            StmtKind::Expr { value } => {
                self.eval_expr_for_effect(value, stmt.line)?;
                Ok(())
            }
            StmtKind::Assign { targets, value } => self.lower_assign(targets, value, stmt.line),
            StmtKind::AnnAssign { target, annotation, value } => {
                self.lower_ann_assign(target, annotation, value.as_ref(), stmt.line)
            }
            StmtKind::AugAssign { target, op, value } => {
                self.lower_aug_assign(target, *op, value, stmt.line)
            }
            StmtKind::If { test, body, orelse } => self.lower_if(test, body, orelse, stmt.line),
            StmtKind::While { test, body } => self.lower_while(test, body, stmt.line),
            StmtKind::For { target, iter, body } => self.lower_for(target, iter, body, stmt.line),
            StmtKind::Match { subject, cases } => self.lower_match(subject, cases, stmt.line),
            StmtKind::With { context, target, body } => {
                self.lower_with(context, target.as_deref(), body, stmt.line)
            }
            StmtKind::Try { body, finalbody } => self.lower_try(body, finalbody, stmt.line),
            StmtKind::Return { value } => self.lower_return(value.as_ref(), stmt.line),
            StmtKind::Break => self.lower_break(stmt.line),
            StmtKind::Continue => self.lower_continue(stmt.line),
        }
    }

    fn lower_return(&mut self, value: Option<&crate::ast::Expr>, line: u32) -> CompileResult<()> {
        let result = match value {
            Some(expr) => {
                let evaluated = self.eval_expr(expr, line)?;
                let coerced = self.coerce_to(evaluated, &self.return_type.clone(), line)?;
                // Returning a linear value transfers ownership to the caller
                self.consume_linear(&coerced, line)?;
                Some(coerced)
            }
            None => None,
        };
        if !self.return_type.is_void() && result.is_none() {
            return Err(self.err_at(
                CompileError::type_error(format!(
                    "function returns '{}' but this return has no value",
                    self.return_type
                )),
                line,
            ));
        }

        // All scopes unwind at a return
        self.emit_defers_down_to(0, line)?;

        match &result {
            Some(value) if !self.return_type.is_void() => {
                let ir_ty = self.return_type.ir_type()?;
                let operand = self.load_if_address(value)?;
                self.func.ret(Some((&ir_ty, &operand.ir)))?;
            }
            _ => self.func.ret(None)?,
        }
        self.cfg.mark_return(self.current_block);
        self.seal_current();
        Ok(())
    }

    fn lower_break(&mut self, line: u32) -> CompileResult<()> {
        let frame = self
            .loop_frames
            .last()
            .cloned()
            .ok_or_else(|| self.err_at(CompileError::syntax("break outside a loop"), line))?;
        self.emit_defers_down_to(frame.scope_depth, line)?;
        self.branch_to(frame.exit_block, &frame.exit_label.clone(), EdgeKind::Sequential)
    }

    fn lower_continue(&mut self, line: u32) -> CompileResult<()> {
        let frame = self
            .loop_frames
            .last()
            .cloned()
            .ok_or_else(|| self.err_at(CompileError::syntax("continue outside a loop"), line))?;
        self.emit_defers_down_to(frame.scope_depth, line)?;
        self.branch_to(frame.header_block, &frame.header_label.clone(), EdgeKind::LoopBack)
    }

    /// Finish the function: implicit return on fallthrough, unresolved
    /// goto check, unused-label warnings
    pub fn finish(mut self, def: &FunctionDef) -> CompileResult<FunctionLowered> {
        if !self.func.current_terminated() {
            if self.return_type.is_void() {
                self.emit_defers_down_to(0, def.body.last().map(|s| s.line).unwrap_or(1))?;
                self.func.ret(None)?;
                self.cfg.mark_return(self.current_block);
                self.seal_current();
            } else {
                // Falling off the end of a value-returning function is
                // only reachable when control provably cannot get here
                // (e.g. an infinite loop); the trap documents that
                self.func.unreachable()?;
                self.seal_current();
            }
        }
        self.check_unresolved_labels()?;

        debug!(func = %self.qualified_name, blocks = self.cfg.blocks.len(), "lowered function");
        Ok(FunctionLowered {
            rendered: self.func.render(),
            cfg: self.cfg,
            pending_specializations: self.pending_specializations,
        })
    }
}

/// Output of lowering one function
pub struct FunctionLowered {
    pub rendered: String,
    pub cfg: Cfg,
    pub(crate) pending_specializations: Vec<PendingSpecialization>,
}

/// Compile every function of one group into a rendered IR module, running
/// the linear checker on each function's CFG. Two passes: signatures were
/// registered up front (declaration pass), so bodies can call each other
/// freely; specializations queued while lowering are drained into the same
/// module until none remain.
pub fn compile_group(session: &mut CompilerSession, key: &GroupKey) -> CompileResult<String> {
    session.begin_group(key);
    let mut module_ir = IrModule::new();

    // Named aggregates used anywhere in this session's classes
    for ty in session.classes.values() {
        if let Some((name, body)) = ty.ir_type_definition()? {
            module_ir.define_type(&name, &body);
        }
    }

    let mut queue: Vec<(String, EffectContext)> = session
        .functions
        .iter()
        .filter(|f| f.group_key == *key && !f.is_extern && !f.is_inline)
        .filter(|f| f.def_ast.as_ref().is_some_and(|d| !d.is_generator()))
        .map(|f| {
            let context = session
                .function_contexts
                .get(&f.qualified_name)
                .cloned()
                .unwrap_or_default();
            (f.qualified_name.clone(), context)
        })
        .collect();
    queue.sort_by(|a, b| a.0.cmp(&b.0));

    let mut compiled: Vec<String> = Vec::new();
    while let Some((qualified, context)) = queue.pop() {
        if compiled.contains(&qualified) {
            continue;
        }
        let info = session
            .functions
            .get(&qualified)
            .ok_or_else(|| {
                CompileError::name_error(format!("function '{}' vanished from registry", qualified))
            })?
            .clone();
        let def: Rc<FunctionDef> = info.def_ast.clone().ok_or_else(|| {
            CompileError::build(format!("function '{}' has no body to compile", qualified))
        })?;

        session.effects.push_context(context.clone());
        let result = (|| -> CompileResult<FunctionLowered> {
            let mut visitor = Visitor::new(
                session,
                &mut module_ir,
                &def,
                &qualified,
                &info.mangled_name,
                key.clone(),
                context.clone(),
            )?;
            visitor.lower_stmts(&def.body)?;
            visitor.finish(&def)
        })();
        session.effects.pop_context();
        let lowered = result?;

        let linear_errors = crate::linear::check_cfg(&lowered.cfg);
        if let Some(first) = linear_errors.first() {
            return Err(CompileError::at(
                crate::error::ErrorKind::Linear,
                first.format(),
                SourceLocation::new(key.file.clone(), def.start_line),
            ));
        }

        module_ir.push_function(lowered.rendered);
        compiled.push(qualified);
        for pending in lowered.pending_specializations {
            if !compiled.contains(&pending.qualified_name) {
                queue.push((pending.qualified_name, pending.context));
            }
        }
    }

    Ok(module_ir.render())
}
