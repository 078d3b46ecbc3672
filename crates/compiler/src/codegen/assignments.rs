//! Assignment lowering
//!
//! Plain assignment infers a type for new names and stores into existing
//! ones; annotated assignment declares; augmented assignment is
//! load-op-store. Ownership transfers ride on assignments: assigning a
//! named linear value consumes the source and activates the target, and
//! assigning over a still-active linear target is rejected.

use crate::ast::{BinOp, Expr, SourceLocation};
use crate::error::{CompileError, CompileResult};
use crate::registry::{LinearState, VariableInfo};
use crate::resolver::TypeResolver;
use crate::types::Type;
use crate::valueref::{ValueKind, ValueRef};

use super::Visitor;

impl Visitor<'_> {
    pub(crate) fn lower_assign(
        &mut self,
        targets: &[Expr],
        value: &Expr,
        line: u32,
    ) -> CompileResult<()> {
        let [target] = targets else {
            return Err(self.err_at(
                CompileError::syntax("chained assignment is not supported"),
                line,
            ));
        };
        match target {
            Expr::Tuple(elements) => self.lower_tuple_unpack(elements, value, line),
            Expr::Name(name) => {
                let evaluated = self.eval_expr(value, line)?;
                self.assign_to_name(name, evaluated, line)
            }
            Expr::Subscript { .. } | Expr::Attribute { .. } => {
                let evaluated = self.eval_expr(value, line)?;
                let place = self.eval_place(target, line)?;
                self.store_into_place(&place, evaluated, line)
            }
            other => Err(self.err_at(
                CompileError::syntax(format!("invalid assignment target {:?}", other)),
                line,
            )),
        }
    }

    pub(crate) fn lower_ann_assign(
        &mut self,
        target: &Expr,
        annotation: &Expr,
        value: Option<&Expr>,
        line: u32,
    ) -> CompileResult<()> {
        let Expr::Name(name) = target else {
            return Err(self.err_at(
                CompileError::syntax("annotated assignment target must be a name"),
                line,
            ));
        };
        if Type::builtin(name).is_some() || self.session.classes.contains_key(name) {
            return Err(self.err_at(
                CompileError::syntax(format!("'{}' is a reserved type name", name)),
                line,
            ));
        }
        let ty = {
            let mut resolver =
                TypeResolver::new(&self.session.classes, &mut self.session.type_cache);
            resolver.resolve(annotation).map_err(|e| {
                e.with_location(SourceLocation::new(
                    self.group_key.file.clone(),
                    self.func_start_line + line.saturating_sub(1),
                ))
            })?
        };
        if self.vars.is_declared_in_current_scope(name) {
            return Err(self.err_at(
                CompileError::syntax(format!(
                    "variable '{}' is already declared in this scope",
                    name
                )),
                line,
            ));
        }

        let evaluated = match value {
            Some(expr) => Some(self.eval_expr(expr, line)?),
            None => None,
        };
        self.declare_local(name, ty, evaluated, line)?;
        Ok(())
    }

    pub(crate) fn lower_aug_assign(
        &mut self,
        target: &Expr,
        op: BinOp,
        value: &Expr,
        line: u32,
    ) -> CompileResult<()> {
        let place = self.eval_place(target, line)?;
        if place.type_hint.contains_linear() {
            return Err(self.err_at(
                CompileError::linear("augmented assignment on a linear location"),
                line,
            ));
        }
        if place.type_hint.qualifiers().is_const {
            return Err(self.err_at(
                CompileError::const_qualifier("augmented assignment to a const location"),
                line,
            ));
        }
        let synthesized = Expr::BinOp {
            left: Box::new(target.clone()),
            op,
            right: Box::new(value.clone()),
        };
        let result = self.eval_expr(&synthesized, line)?;
        self.store_into_place(&place, result, line)
    }

    /// Declare a fresh local with a stack slot, optionally initialized
    pub(crate) fn declare_local(
        &mut self,
        name: &str,
        ty: Type,
        value: Option<ValueRef>,
        line: u32,
    ) -> CompileResult<VariableInfo> {
        let mut var = VariableInfo::new(name, self.vars.depth(), ty.clone());
        var.source = Some(self.location(line));
        var.linear_scope_depth = self.vars.depth();
        if !ty.is_linear() && !ty.is_void() {
            let ir_ty = ty.ir_type().map_err(|e| self.err_at(e, line))?;
            var.storage = Some(self.func.alloca(&ir_ty, name));
        }

        if let Some(v) = &value {
            self.check_readable(v, line)?;
            self.transfer_if_linear(v, line)?;
        }

        if let Some(v) = value {
            if let Some(slot) = var.storage.clone() {
                let operand = self.materialize(&v, &ty, line)?;
                let ir_ty = ty.ir_type()?;
                // Declaration initializes fresh storage; the declared
                // qualifiers constrain later stores, not this one
                self.func
                    .store(&ir_ty, &operand, &slot, crate::types::Qualifiers::NONE)?;
            }
            if ty.contains_linear() {
                var.activate_linear_paths();
            }
        }
        self.vars.declare(var.clone()).map_err(|e| self.err_at(e, line))?;
        Ok(var)
    }

    /// Assign into a (possibly new) simple name
    pub(crate) fn assign_to_name(
        &mut self,
        name: &str,
        value: ValueRef,
        line: u32,
    ) -> CompileResult<()> {
        self.check_readable(&value, line)?;
        if self.vars.lookup(name).is_none() {
            // New binding: infer the type from the right-hand side
            let ty = self.concrete_type_of(&value).map_err(|e| self.err_at(e, line))?;
            if ty.is_void() {
                return Err(self.err_at(
                    CompileError::type_error(format!(
                        "cannot bind '{}' to a void expression",
                        name
                    )),
                    line,
                ));
            }
            self.declare_local(name, ty, Some(value), line)?;
            return Ok(());
        }

        let (ty, storage, active_paths) = {
            let info = self.vars.lookup(name).expect("checked above");
            let active: Vec<Vec<usize>> = info
                .linear_states
                .iter()
                .filter(|(_, s)| s.is_active())
                .map(|(p, _)| p.clone())
                .collect();
            (info.type_hint.clone(), info.storage.clone(), active)
        };
        if !active_paths.is_empty() {
            return Err(self.err_at(
                CompileError::linear(format!(
                    "cannot reassign '{}': its linear content is not consumed",
                    name
                )),
                line,
            ));
        }
        if ty.qualifiers().is_const {
            return Err(self.err_at(
                CompileError::const_qualifier(format!("cannot assign to const '{}'", name)),
                line,
            ));
        }

        let transferred = value.tracks_linear();
        self.transfer_if_linear(&value, line)?;
        if let Some(slot) = storage {
            let operand = self.materialize(&value, &ty, line)?;
            let ir_ty = ty.ir_type()?;
            self.func.store(&ir_ty, &operand, &slot, ty.qualifiers())?;
        }
        if ty.contains_linear() && (transferred || !value.tracks_linear()) {
            // Fresh value or completed transfer: the target holds the
            // tokens now
            let depth = self.vars.depth();
            if let Some(info) = self.vars.lookup_mut(name) {
                info.activate_linear_paths();
                info.linear_scope_depth = depth;
            }
        }
        Ok(())
    }

    /// Evaluate an assignment target to an address reference
    pub(crate) fn eval_place(&mut self, target: &Expr, line: u32) -> CompileResult<ValueRef> {
        let place = match target {
            Expr::Name(name) => {
                let info = self.vars.lookup(name).ok_or_else(|| {
                    self.err_at(
                        CompileError::name_error(format!("unresolved name '{}'", name)),
                        line,
                    )
                })?;
                let ty = info.type_hint.clone();
                let slot = info.storage.clone().ok_or_else(|| {
                    self.err_at(
                        CompileError::type_error(format!("'{}' has no addressable storage", name)),
                        line,
                    )
                })?;
                let mut place = ValueRef::address(slot, ty.clone()).with_var(name);
                if ty.is_linear() {
                    place = place.with_linear_source(name, Vec::new());
                }
                place
            }
            Expr::Subscript { .. } => self.eval_lvalue_or_value(target, line)?,
            Expr::Attribute { value, attr } => {
                let base = self.eval_expr(value, line)?;
                self.handle_attribute(base, attr, line)?
            }
            other => {
                return Err(self.err_at(
                    CompileError::syntax(format!("invalid assignment target {:?}", other)),
                    line,
                ));
            }
        };
        if place.kind != ValueKind::Address {
            return Err(self.err_at(
                CompileError::type_error("assignment target is not addressable"),
                line,
            ));
        }
        Ok(place)
    }

    /// Store through an address place, honoring qualifiers and linear rules
    pub(crate) fn store_into_place(
        &mut self,
        place: &ValueRef,
        value: ValueRef,
        line: u32,
    ) -> CompileResult<()> {
        self.check_readable(&value, line)?;
        // Storing over an active token would leak it
        if let (Some(var), Some(path)) = (&place.var_name, &place.linear_path) {
            if self.linear_state_of(var, path).is_active() {
                return Err(self.err_at(
                    CompileError::linear(format!(
                        "cannot overwrite '{}': its linear content is not consumed",
                        var
                    )),
                    line,
                ));
            }
        }
        let ty = place.type_hint.clone();
        let quals = ty.qualifiers();
        if quals.is_const {
            return Err(self.err_at(
                CompileError::const_qualifier("cannot store through a const-qualified location"),
                line,
            ));
        }
        self.transfer_if_linear(&value, line)?;
        if !ty.is_linear() {
            let operand = self.materialize(&value, &ty, line)?;
            let ir_ty = ty.ir_type()?;
            self.func.store(&ir_ty, &operand, &place.ir, quals)?;
        }
        if let (Some(var), Some(path)) = (&place.var_name, &place.linear_path) {
            let var = var.clone();
            let path = path.clone();
            self.set_linear_state(&var, &path, LinearState::Active);
        }
        Ok(())
    }

    /// `a, b = e` for compile-time tuples and matching-arity structs
    fn lower_tuple_unpack(
        &mut self,
        elements: &[Expr],
        value: &Expr,
        line: u32,
    ) -> CompileResult<()> {
        // Pairwise tuple-to-tuple assignment
        if let Expr::Tuple(values) = value {
            if values.len() != elements.len() {
                return Err(self.err_at(
                    CompileError::type_error(format!(
                        "cannot unpack {} values into {} targets",
                        values.len(),
                        elements.len()
                    )),
                    line,
                ));
            }
            let evaluated: CompileResult<Vec<ValueRef>> =
                values.iter().map(|v| self.eval_expr(v, line)).collect();
            for (target, v) in elements.iter().zip(evaluated?) {
                match target {
                    Expr::Name(name) => self.assign_to_name(name, v, line)?,
                    _ => {
                        let place = self.eval_place(target, line)?;
                        self.store_into_place(&place, v, line)?;
                    }
                }
            }
            return Ok(());
        }

        // Struct unpacking with per-field linear accounting
        let source = self.eval_expr(value, line)?;
        let Type::Struct(body) = source.type_hint.unwrapped().clone() else {
            return Err(self.err_at(
                CompileError::type_error(format!(
                    "cannot unpack non-struct type '{}'",
                    source.type_hint
                )),
                line,
            ));
        };
        if body.fields.len() != elements.len() {
            return Err(self.err_at(
                CompileError::type_error(format!(
                    "struct '{}' has {} fields but {} targets were given",
                    body.name,
                    body.fields.len(),
                    elements.len()
                )),
                line,
            ));
        }
        for (index, target) in elements.iter().enumerate() {
            let field = self.handle_attribute(source.clone(), &body.fields[index].0.clone(), line)?;
            match target {
                Expr::Name(name) => self.assign_to_name(name, field, line)?,
                _ => {
                    let place = self.eval_place(target, line)?;
                    self.store_into_place(&place, field, line)?;
                }
            }
        }
        Ok(())
    }
}
