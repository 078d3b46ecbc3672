//! Deferred execution
//!
//! `defer(f, a, b)` captures `f` and its argument values at registration
//! time. Entries live on a per-function stack keyed by scope depth and
//! are *emitted* (not unregistered) at every exit of their scope: scope
//! fallthrough, return, break/continue, and gotos that cross the scope.
//! Only actual scope closure unregisters them. Within one scope entries
//! run in FIFO order; across scopes the innermost scope unwinds first.
//!
//! Captured arguments are spilled to stack slots so the emitted calls are
//! valid on every exit path, not just ones dominated by the registration.

use crate::ast::Expr;
use crate::build::deps::CallableDep;
use crate::error::{CompileError, CompileResult};
use crate::types::{Qualifiers, Type};

use super::Visitor;

/// One registered deferred call
#[derive(Debug, Clone)]
pub struct DeferEntry {
    pub scope_depth: usize,
    pub callee_qualified: String,
    pub mangled: String,
    /// Captured arguments: (stack slot, parameter type)
    pub arg_slots: Vec<(String, Type)>,
    pub return_type: Type,
    pub line: u32,
}

impl Visitor<'_> {
    /// `defer(f, ...args)`: resolve the callee, capture arguments now,
    /// and push the entry at the current scope depth
    pub(crate) fn register_defer(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        line: u32,
    ) -> CompileResult<()> {
        let name = callee
            .dotted_path()
            .map(|p| p.join("."))
            .ok_or_else(|| {
                self.err_at(CompileError::syntax("defer needs a named callable"), line)
            })?;
        let info = self
            .session
            .resolve_function(&name, &self.current_file)
            .cloned()
            .ok_or_else(|| {
                self.err_at(
                    CompileError::name_error(format!("unresolved defer callee '{}'", name)),
                    line,
                )
            })?;
        if info.is_inline {
            return Err(self.err_at(
                CompileError::syntax("inline functions cannot be deferred"),
                line,
            ));
        }
        if args.len() != info.param_types.len() {
            return Err(self.err_at(
                CompileError::overload(format!(
                    "'{}' takes {} arguments, got {}",
                    name,
                    info.param_types.len(),
                    args.len()
                )),
                line,
            ));
        }

        let mut arg_slots = Vec::with_capacity(args.len());
        for (arg, param_ty) in args.iter().zip(info.param_types.iter()) {
            let value = self.eval_expr(arg, line)?;
            self.check_readable(&value, line)?;
            // Capture transfers linear arguments at registration time
            self.transfer_if_linear(&value, line)?;
            if param_ty.is_linear() {
                continue;
            }
            let operand = self.materialize(&value, param_ty, line)?;
            let ir_ty = param_ty.ir_type()?;
            let slot = self.func.alloca(&ir_ty, "defer_arg");
            self.func.store(&ir_ty, &operand, &slot, Qualifiers::NONE)?;
            arg_slots.push((slot, param_ty.unwrapped().clone()));
        }

        let caller = self.qualified_name.clone();
        self.session.deps.record_call(
            &self.group_key,
            &caller,
            CallableDep {
                name: info.mangled_name.clone(),
                group_key: (!info.is_extern).then(|| info.group_key.clone()),
                extern_: info.is_extern,
                link_libraries: info.link_libraries.clone(),
                link_objects: info.link_objects.clone(),
            },
        );
        if info.group_key != self.group_key || info.is_extern {
            let param_irs: CompileResult<Vec<String>> = info
                .param_types
                .iter()
                .filter(|t| !t.is_linear())
                .map(|t| t.ir_type())
                .collect();
            self.module_ir.declare_function(
                &info.mangled_name,
                &info.return_type.ir_type()?,
                &param_irs?,
                false,
            );
        }

        self.defers.push(DeferEntry {
            scope_depth: self.vars.depth(),
            callee_qualified: info.qualified_name.clone(),
            mangled: info.mangled_name,
            arg_slots,
            return_type: info.return_type,
            line,
        });
        Ok(())
    }

    /// Emit the deferred calls registered at exactly `depth`, FIFO
    pub(crate) fn emit_defers_for_scope(&mut self, depth: usize, line: u32) -> CompileResult<()> {
        let entries: Vec<DeferEntry> = self
            .defers
            .iter()
            .filter(|e| e.scope_depth == depth)
            .cloned()
            .collect();
        for entry in entries {
            self.emit_defer_call(&entry, line)?;
        }
        Ok(())
    }

    /// Unwind defers from the current depth down to `target_depth`
    /// inclusive (innermost scope first)
    pub(crate) fn emit_defers_down_to(&mut self, target_depth: usize, line: u32) -> CompileResult<()> {
        let mut depth = self.vars.depth();
        loop {
            self.emit_defers_for_scope(depth, line)?;
            if depth == target_depth {
                break;
            }
            depth -= 1;
        }
        Ok(())
    }

    /// Emit a snapshot of the defer stack (used by forward-goto fixups):
    /// entries among the first `upto` with depth > `above_depth`
    pub(crate) fn emit_defer_snapshot(
        &mut self,
        upto: usize,
        above_depth: usize,
        line: u32,
    ) -> CompileResult<()> {
        let entries: Vec<DeferEntry> = self.defers[..upto.min(self.defers.len())]
            .iter()
            .filter(|e| e.scope_depth > above_depth)
            .cloned()
            .collect();
        // Innermost scopes unwind first, FIFO within a scope
        let mut depths: Vec<usize> = entries.iter().map(|e| e.scope_depth).collect();
        depths.sort_unstable();
        depths.dedup();
        for depth in depths.into_iter().rev() {
            for entry in entries.iter().filter(|e| e.scope_depth == depth) {
                self.emit_defer_call(entry, line)?;
            }
        }
        Ok(())
    }

    pub(crate) fn unregister_defers_at(&mut self, depth: usize) {
        self.defers.retain(|e| e.scope_depth != depth);
    }

    fn emit_defer_call(&mut self, entry: &DeferEntry, _line: u32) -> CompileResult<()> {
        let mut args: Vec<(String, Type)> = Vec::with_capacity(entry.arg_slots.len());
        for (slot, ty) in &entry.arg_slots {
            let loaded = self.func.load(&ty.ir_type()?, slot, Qualifiers::NONE)?;
            args.push((loaded, ty.clone()));
        }
        let callee = format!("@{}", entry.mangled);
        self.func
            .call(&callee, &args, args.len(), false, &entry.return_type)?;
        Ok(())
    }
}
