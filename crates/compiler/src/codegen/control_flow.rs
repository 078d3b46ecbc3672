//! Control-flow lowering
//!
//! Each construct grows the CFG exactly as §lowering requires: new blocks
//! at branch targets, loop headers/bodies/exits, match arms, and label
//! boundaries; edges tagged at the branch source. `for` loops come in two
//! shapes: counting loops over `seq(...)` and generator drives, which
//! splice the generator body through the inline kernel instead of calling
//! anything.

use crate::ast::{Constant, Expr, MatchCase, MatchPattern, Stmt};
use crate::cfg::EdgeKind;
use crate::error::{CompileError, CompileResult};
use crate::exhaustive;
use crate::inline::{
    check_inlinable, expand, has_loop_controls, rewrite_loop_controls, ExitRule, InlineMode,
};
use crate::types::{enum_payload_offset, Qualifiers, Type};
use crate::valueref::{ValueKind, ValueRef};

use super::{LoopFrame, Visitor};

impl Visitor<'_> {
    /// Enter a lexical scope for a nested block
    pub(crate) fn open_scope(&mut self) {
        self.vars.enter_scope();
    }

    /// Close the innermost scope: run its defers on the fallthrough path,
    /// then unregister them
    pub(crate) fn close_scope(&mut self, line: u32) -> CompileResult<()> {
        let depth = self.vars.depth();
        if !self.func.current_terminated() {
            self.emit_defers_for_scope(depth, line)?;
        }
        self.unregister_defers_at(depth);
        self.vars.exit_scope();
        Ok(())
    }

    pub(crate) fn lower_if(
        &mut self,
        test: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
        line: u32,
    ) -> CompileResult<()> {
        let condition = self.eval_expr(test, line)?;
        let cond = self.to_bool(&condition, line)?;
        let (then_block, then_label) = self.new_block("if_then");
        let (merge_block, merge_label) = self.new_block("if_merge");
        let (else_block, else_label) = if orelse.is_empty() {
            (merge_block, merge_label.clone())
        } else {
            self.new_block("if_else")
        };

        self.cfg.add_edge(self.current_block, then_block, EdgeKind::BranchTrue);
        self.cfg.add_edge(self.current_block, else_block, EdgeKind::BranchFalse);
        self.func.conditional_branch(&cond, &then_label, &else_label)?;
        self.seal_current();

        self.switch_to(then_block, &then_label)?;
        self.open_scope();
        self.lower_stmts(body)?;
        self.close_scope(line)?;
        if !self.func.current_terminated() {
            self.branch_to(merge_block, &merge_label.clone(), EdgeKind::Sequential)?;
        }

        if !orelse.is_empty() {
            self.switch_to(else_block, &else_label)?;
            self.open_scope();
            self.lower_stmts(orelse)?;
            self.close_scope(line)?;
            if !self.func.current_terminated() {
                self.branch_to(merge_block, &merge_label.clone(), EdgeKind::Sequential)?;
            }
        }

        self.switch_to(merge_block, &merge_label)
    }

    pub(crate) fn lower_while(&mut self, test: &Expr, body: &[Stmt], line: u32) -> CompileResult<()> {
        let (header_block, header_label) = self.new_block("while_header");
        let (body_block, body_label) = self.new_block("while_body");
        let (exit_block, exit_label) = self.new_block("while_exit");
        self.branch_to(header_block, &header_label.clone(), EdgeKind::Sequential)?;
        self.switch_to(header_block, &header_label)?;

        // `while True` leaves the exit block without any incoming edge so
        // code after the loop is provably unreachable
        let infinite = matches!(test, Expr::Constant(Constant::Bool(true)));
        if infinite {
            self.cfg.add_edge(self.current_block, body_block, EdgeKind::Sequential);
            self.func.branch(&body_label)?;
            self.seal_current();
        } else {
            let condition = self.eval_expr(test, line)?;
            let cond = self.to_bool(&condition, line)?;
            self.cfg.add_edge(self.current_block, body_block, EdgeKind::BranchTrue);
            self.cfg.add_edge(self.current_block, exit_block, EdgeKind::BranchFalse);
            self.func.conditional_branch(&cond, &body_label, &exit_label)?;
            self.seal_current();
        }

        self.switch_to(body_block, &body_label)?;
        self.open_scope();
        self.loop_frames.push(LoopFrame {
            header_label: header_label.clone(),
            header_block,
            exit_label: exit_label.clone(),
            exit_block,
            scope_depth: self.vars.depth(),
        });
        let lowered = self.lower_stmts(body);
        self.loop_frames.pop();
        lowered?;
        self.close_scope(line)?;
        if !self.func.current_terminated() {
            self.branch_to(header_block, &header_label, EdgeKind::LoopBack)?;
        }

        self.switch_to(exit_block, &exit_label)
    }

    pub(crate) fn lower_for(
        &mut self,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
        line: u32,
    ) -> CompileResult<()> {
        let Expr::Call { func, args, .. } = iter else {
            return Err(self.err_at(
                CompileError::syntax("for loops iterate seq(...) or an inlinable generator"),
                line,
            ));
        };
        if let Some(path) = func.dotted_path() {
            if path.len() == 1 && path[0] == "seq" {
                return self.lower_counting_for(target, args, body, line);
            }
            let name = path.join(".");
            if let Some(info) = self
                .session
                .resolve_function(&name, &self.current_file)
                .cloned()
            {
                if info.def_ast.as_ref().is_some_and(|d| d.is_generator()) {
                    return self.lower_generator_for(target, &info, args, body, line);
                }
            }
        }
        Err(self.err_at(
            CompileError::syntax("for loops iterate seq(...) or an inlinable generator"),
            line,
        ))
    }

    /// `for i in seq(start, stop[, step])` lowers to a native counting loop
    fn lower_counting_for(
        &mut self,
        target: &Expr,
        args: &[Expr],
        body: &[Stmt],
        line: u32,
    ) -> CompileResult<()> {
        let Expr::Name(loop_var) = target else {
            return Err(self.err_at(
                CompileError::syntax("seq(...) loops take a single name target"),
                line,
            ));
        };
        let (start, stop, step) = match args {
            [start, stop] => (start, stop, None),
            [start, stop, step] => (start, stop, Some(step)),
            _ => {
                return Err(self.err_at(
                    CompileError::syntax("seq(start, stop[, step]) takes two or three arguments"),
                    line,
                ));
            }
        };

        let start_ref = self.eval_expr(start, line)?;
        let stop_ref = self.eval_expr(stop, line)?;
        let counter_ty = {
            let a = self.concrete_type_of(&start_ref)?;
            let b = self.concrete_type_of(&stop_ref)?;
            crate::types::promote_binary(&a, &b).map_err(|e| self.err_at(e, line))?
        };
        if !counter_ty.is_integer() {
            return Err(self.err_at(
                CompileError::type_error("seq(...) bounds must be integers"),
                line,
            ));
        }
        // Negative constant steps count down
        let descending = matches!(step, Some(Expr::Constant(Constant::Int(v))) if *v < 0)
            || matches!(
                step,
                Some(Expr::UnaryOp { op: crate::ast::UnaryOp::USub, .. })
            );
        let step_op = match step {
            Some(expr) => {
                let step_ref = self.eval_expr(expr, line)?;
                self.materialize(&step_ref, &counter_ty, line)?
            }
            None => "1".to_string(),
        };

        if self.vars.lookup(loop_var).is_none() {
            self.declare_local(loop_var, counter_ty.clone(), Some(start_ref.clone()), line)?;
        } else {
            self.assign_to_name(loop_var, start_ref.clone(), line)?;
        }
        let slot = self
            .vars
            .lookup(loop_var)
            .and_then(|v| v.storage.clone())
            .ok_or_else(|| {
                self.err_at(CompileError::build("loop counter has no storage"), line)
            })?;
        let stop_op = self.materialize(&stop_ref, &counter_ty, line)?;
        let ir_ty = counter_ty.ir_type()?;

        let (header_block, header_label) = self.new_block("for_header");
        let (body_block, body_label) = self.new_block("for_body");
        let (incr_block, incr_label) = self.new_block("for_incr");
        let (exit_block, exit_label) = self.new_block("for_exit");

        self.branch_to(header_block, &header_label.clone(), EdgeKind::Sequential)?;
        self.switch_to(header_block, &header_label)?;
        let current = self.func.load(&ir_ty, &slot, Qualifiers::NONE)?;
        let cmp = if descending { "icmp sgt" } else { signed_lt(&counter_ty) };
        let cond = self.func.cmp(cmp, &ir_ty, &current, &stop_op)?;
        self.cfg.add_edge(self.current_block, body_block, EdgeKind::BranchTrue);
        self.cfg.add_edge(self.current_block, exit_block, EdgeKind::BranchFalse);
        self.func.conditional_branch(&cond, &body_label, &exit_label)?;
        self.seal_current();

        self.switch_to(body_block, &body_label)?;
        self.open_scope();
        // continue targets the increment, not the condition
        self.loop_frames.push(LoopFrame {
            header_label: incr_label.clone(),
            header_block: incr_block,
            exit_label: exit_label.clone(),
            exit_block,
            scope_depth: self.vars.depth(),
        });
        let lowered = self.lower_stmts(body);
        self.loop_frames.pop();
        lowered?;
        self.close_scope(line)?;
        if !self.func.current_terminated() {
            self.branch_to(incr_block, &incr_label.clone(), EdgeKind::Sequential)?;
        }

        self.switch_to(incr_block, &incr_label)?;
        let current = self.func.load(&ir_ty, &slot, Qualifiers::NONE)?;
        let bumped = self.func.binop("add", &ir_ty, &current, &step_op)?;
        self.func.store(&ir_ty, &bumped, &slot, Qualifiers::NONE)?;
        self.branch_to(header_block, &header_label, EdgeKind::LoopBack)?;

        self.switch_to(exit_block, &exit_label)
    }

    /// `for x in gen(...)`: the generator body is spliced here through the
    /// yield exit rule; no call to the generator is ever emitted
    fn lower_generator_for(
        &mut self,
        target: &Expr,
        info: &crate::registry::FunctionInfo,
        args: &[Expr],
        body: &[Stmt],
        line: u32,
    ) -> CompileResult<()> {
        let def = info.def_ast.clone().ok_or_else(|| {
            self.err_at(
                CompileError::build(format!("generator '{}' has no body", info.qualified_name)),
                line,
            )
        })?;
        check_inlinable(&def, InlineMode::Yield).map_err(|e| self.err_at(e, line))?;
        if args.len() != info.param_types.len() {
            return Err(self.err_at(
                CompileError::overload(format!(
                    "'{}' takes {} arguments, got {}",
                    info.qualified_name,
                    info.param_types.len(),
                    args.len()
                )),
                line,
            ));
        }

        // The loop variable holds each yielded value; tuple targets unpack
        // a struct-yielding generator per iteration
        let yield_ty = info.return_type.clone();
        let n = self.inline_counter;
        self.inline_counter += 1;
        let (loop_var, mut caller_body) = match target {
            Expr::Name(name) => (name.clone(), body.to_vec()),
            Expr::Tuple(elements) => {
                let tmp = format!("__yield{}", n);
                let mut prefixed = vec![Stmt::new(
                    line,
                    crate::ast::StmtKind::Assign {
                        targets: vec![Expr::Tuple(elements.clone())],
                        value: Expr::name(tmp.clone()),
                    },
                )];
                prefixed.extend(body.iter().cloned());
                (tmp, prefixed)
            }
            _ => {
                return Err(self.err_at(
                    CompileError::syntax("for target must be a name or tuple of names"),
                    line,
                ));
            }
        };

        self.open_scope();
        if self.vars.lookup(&loop_var).is_none() || !matches!(target, Expr::Name(_)) {
            self.declare_local(&loop_var, yield_ty, None, line)?;
        }

        let break_flag = if has_loop_controls(&caller_body) {
            let flag = format!("__brk{}", n);
            caller_body = rewrite_loop_controls(&caller_body, &flag);
            Some(flag)
        } else {
            None
        };

        let expansion = expand(
            &def,
            ExitRule::Yield { loop_var, loop_body: caller_body, break_flag },
            &mut self.inline_counter,
        )
        .map_err(|e| self.err_at(e, line))?;

        for (binding, (arg, param_ty)) in expansion
            .param_bindings
            .iter()
            .zip(args.iter().zip(info.param_types.iter()))
        {
            let value = self.eval_expr(arg, line)?;
            self.check_readable(&value, line)?;
            self.declare_local(&binding.fresh_name, param_ty.clone(), Some(value), line)?;
        }

        // Generator module globals win while its body is spliced
        let saved_file = std::mem::replace(&mut self.current_file, info.source_file.clone());
        let lowered = (|| -> CompileResult<()> {
            self.lower_stmts(&expansion.prelude)?;
            self.lower_stmts(&expansion.body)
        })();
        self.current_file = saved_file;
        lowered?;
        self.close_scope(line)
    }

    // ---- match ------------------------------------------------------------

    pub(crate) fn lower_match(
        &mut self,
        subject: &Expr,
        cases: &[MatchCase],
        line: u32,
    ) -> CompileResult<()> {
        let subject_ref = self.eval_expr(subject, line)?;
        let subject_ty = self.concrete_type_of(&subject_ref)?;

        let missing = exhaustive::check_match(&subject_ty, cases, &self.session.enums)
            .map_err(|e| self.err_at(e, line))?;
        if !missing.is_empty() {
            return Err(self.err_at(exhaustive::exhaustiveness_error(&missing), line));
        }
        self.warn_shadowed_guards(cases, line);

        // Pin the subject in a slot so every arm reads the same value
        let subject_ref = self.pin_subject(subject_ref, &subject_ty, line)?;

        let (merge_block, merge_label) = self.new_block("match_merge");
        for case in cases {
            let (arm_block, arm_label) = self.new_block("match_arm");
            let (next_block, next_label) = self.new_block("match_next");
            let cond = self.pattern_test(&subject_ref, &subject_ty, &case.pattern, line)?;
            match cond {
                Some(cond) => {
                    self.cfg.add_edge(self.current_block, arm_block, EdgeKind::BranchTrue);
                    self.cfg.add_edge(self.current_block, next_block, EdgeKind::BranchFalse);
                    self.func.conditional_branch(&cond, &arm_label, &next_label)?;
                    self.seal_current();
                }
                None => {
                    self.cfg.add_edge(self.current_block, arm_block, EdgeKind::Sequential);
                    self.func.branch(&arm_label)?;
                    self.seal_current();
                }
            }

            self.switch_to(arm_block, &arm_label)?;
            self.open_scope();
            self.declare_pattern_bindings(&subject_ref, &subject_ty, &case.pattern, line)?;
            if let Some(guard) = &case.guard {
                let guard_ref = self.eval_expr(guard, line)?;
                let guard_cond = self.to_bool(&guard_ref, line)?;
                let (guard_pass_block, guard_pass_label) = self.new_block("match_guard_pass");
                self.cfg
                    .add_edge(self.current_block, guard_pass_block, EdgeKind::BranchTrue);
                self.cfg
                    .add_edge(self.current_block, next_block, EdgeKind::BranchFalse);
                self.func
                    .conditional_branch(&guard_cond, &guard_pass_label, &next_label)?;
                self.seal_current();
                self.switch_to(guard_pass_block, &guard_pass_label)?;
            }
            self.lower_stmts(&case.body)?;
            self.close_scope(line)?;
            if !self.func.current_terminated() {
                self.branch_to(merge_block, &merge_label.clone(), EdgeKind::Sequential)?;
            }

            self.switch_to(next_block, &next_label)?;
        }
        // Exhaustiveness holds, so the fallthrough is dead
        self.func.unreachable()?;
        self.seal_current();
        self.switch_to(merge_block, &merge_label)
    }

    fn pin_subject(
        &mut self,
        subject: ValueRef,
        ty: &Type,
        line: u32,
    ) -> CompileResult<ValueRef> {
        if subject.kind == ValueKind::Address {
            return Ok(subject);
        }
        let ir_ty = ty.ir_type()?;
        let slot = self.func.alloca(&ir_ty, "match_subject");
        let operand = self.materialize(&subject, ty, line)?;
        self.func.store(&ir_ty, &operand, &slot, Qualifiers::NONE)?;
        Ok(ValueRef::address(slot, ty.clone()))
    }

    /// Structural test for one pattern; `None` means irrefutable
    fn pattern_test(
        &mut self,
        subject: &ValueRef,
        subject_ty: &Type,
        pattern: &MatchPattern,
        line: u32,
    ) -> CompileResult<Option<String>> {
        match pattern {
            MatchPattern::Wildcard { .. } => Ok(None),
            MatchPattern::Literal(constant) => {
                let literal = ValueRef::py_const(constant.clone());
                let loaded = self.load_if_address(subject)?;
                let operand = self.materialize(&literal, subject_ty, line)?;
                let ir_ty = subject_ty.ir_type()?;
                let opcode = if subject_ty.is_float() { "fcmp oeq" } else { "icmp eq" };
                Ok(Some(self.func.cmp(opcode, &ir_ty, &loaded.ir, &operand)?))
            }
            MatchPattern::Value { path } => {
                let tag = self.variant_tag(path, line)?;
                let tag_val = self.load_enum_tag(subject, subject_ty)?;
                Ok(Some(self.func.cmp("icmp eq", "i32", &tag_val, &tag.to_string())?))
            }
            MatchPattern::Sequence(parts) => match subject_ty.unwrapped().clone() {
                Type::Enum(_) => {
                    let Some(MatchPattern::Value { path }) = parts.first() else {
                        return Err(self.err_at(
                            CompileError::type_error(
                                "enum tuple pattern must start with a variant reference",
                            ),
                            line,
                        ));
                    };
                    let tag = self.variant_tag(path, line)?;
                    let tag_val = self.load_enum_tag(subject, subject_ty)?;
                    let tag_cond =
                        self.func.cmp("icmp eq", "i32", &tag_val, &tag.to_string())?;
                    // Literal payload sub-patterns refine the test
                    if let Some(sub) = parts.get(1) {
                        if let MatchPattern::Literal(_) = sub {
                            let payload = self.enum_payload_ref(subject, subject_ty, path, line)?;
                            let payload_ty = payload.type_hint.clone();
                            if let Some(sub_cond) =
                                self.pattern_test(&payload, &payload_ty, sub, line)?
                            {
                                return Ok(Some(
                                    self.func.binop("and", "i1", &tag_cond, &sub_cond)?,
                                ));
                            }
                        }
                    }
                    Ok(Some(tag_cond))
                }
                Type::Struct(body) => {
                    let mut cond: Option<String> = None;
                    for (index, part) in parts.iter().enumerate() {
                        let field_name = body.fields[index].0.clone();
                        let field = self.handle_attribute(subject.clone(), &field_name, line)?;
                        let field_ty = field.type_hint.clone();
                        if let Some(sub) = self.pattern_test(&field, &field_ty, part, line)? {
                            cond = Some(match cond {
                                Some(prev) => self.func.binop("and", "i1", &prev, &sub)?,
                                None => sub,
                            });
                        }
                    }
                    Ok(cond)
                }
                other => Err(self.err_at(
                    CompileError::type_error(format!(
                        "tuple pattern applied to non-aggregate '{}'",
                        other
                    )),
                    line,
                )),
            },
            MatchPattern::Or(alternatives) => {
                let mut cond: Option<String> = None;
                for alt in alternatives {
                    let sub = self
                        .pattern_test(subject, subject_ty, alt, line)?
                        .unwrap_or_else(|| "true".to_string());
                    cond = Some(match cond {
                        Some(prev) => self.func.binop("or", "i1", &prev, &sub)?,
                        None => sub,
                    });
                }
                Ok(cond)
            }
        }
    }

    /// Declare capture bindings for a matched arm
    fn declare_pattern_bindings(
        &mut self,
        subject: &ValueRef,
        subject_ty: &Type,
        pattern: &MatchPattern,
        line: u32,
    ) -> CompileResult<()> {
        match pattern {
            MatchPattern::Wildcard { binding: Some(name) } => {
                let value = self.load_if_address(subject)?;
                self.declare_local(name, subject_ty.clone(), Some(value), line)?;
                Ok(())
            }
            MatchPattern::Sequence(parts) => match subject_ty.unwrapped().clone() {
                Type::Enum(_) => {
                    let Some(MatchPattern::Value { path }) = parts.first() else {
                        return Ok(());
                    };
                    if let Some(sub) = parts.get(1) {
                        let payload = self.enum_payload_ref(subject, subject_ty, path, line)?;
                        let payload_ty = payload.type_hint.clone();
                        self.declare_pattern_bindings(&payload, &payload_ty, sub, line)?;
                    }
                    Ok(())
                }
                Type::Struct(body) => {
                    for (index, part) in parts.iter().enumerate() {
                        let field_name = body.fields[index].0.clone();
                        let field = self.handle_attribute(subject.clone(), &field_name, line)?;
                        let field_ty = field.type_hint.clone();
                        self.declare_pattern_bindings(&field, &field_ty, part, line)?;
                    }
                    Ok(())
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn variant_tag(&self, path: &[String], line: u32) -> CompileResult<i64> {
        let [enum_name, variant_name] = path else {
            return Err(self.err_at(
                CompileError::name_error(format!(
                    "'{}' is not an enum variant reference",
                    path.join(".")
                )),
                line,
            ));
        };
        let body = self.session.enums.get(enum_name).ok_or_else(|| {
            self.err_at(
                CompileError::name_error(format!("unknown enum '{}'", enum_name)),
                line,
            )
        })?;
        let (_, variant) = body.variant(variant_name).ok_or_else(|| {
            self.err_at(
                CompileError::name_error(format!(
                    "enum '{}' has no variant '{}'",
                    enum_name, variant_name
                )),
                line,
            )
        })?;
        Ok(variant.tag)
    }

    fn load_enum_tag(&mut self, subject: &ValueRef, subject_ty: &Type) -> CompileResult<String> {
        let enum_ir = subject_ty.ir_type()?;
        let tag_addr = self.func.struct_gep(&enum_ir, &subject.ir, 0)?;
        self.func.load("i32", &tag_addr, Qualifiers::NONE)
    }

    /// Address of the payload area typed as the variant's payload
    fn enum_payload_ref(
        &mut self,
        subject: &ValueRef,
        subject_ty: &Type,
        path: &[String],
        line: u32,
    ) -> CompileResult<ValueRef> {
        let Type::Enum(body) = subject_ty.unwrapped().clone() else {
            return Err(self.err_at(
                CompileError::type_error("payload pattern on a non-enum subject"),
                line,
            ));
        };
        let [_, variant_name] = path else {
            return Err(self.err_at(
                CompileError::name_error("malformed variant reference"),
                line,
            ));
        };
        let (_, variant) = body.variant(variant_name).ok_or_else(|| {
            self.err_at(
                CompileError::name_error(format!("unknown variant '{}'", variant_name)),
                line,
            )
        })?;
        let payload_ty = variant.payload.clone().ok_or_else(|| {
            self.err_at(
                CompileError::type_error(format!("variant '{}' has no payload", variant_name)),
                line,
            )
        })?;
        let offset = enum_payload_offset(&body)?;
        let addr = self.func.gep(
            "i8",
            &subject.ir,
            &[format!("i64 {}", offset)],
        )?;
        Ok(ValueRef::address(addr, payload_ty))
    }

    fn warn_shadowed_guards(&mut self, cases: &[MatchCase], line: u32) {
        let mut saw_catch_all = false;
        for case in cases {
            let irrefutable = matches!(case.pattern, MatchPattern::Wildcard { .. });
            if saw_catch_all && case.guard.is_some() {
                let location = self.location(line);
                self.session.warn(format!(
                    "guarded match arm is shadowed by an earlier catch-all ({})",
                    location
                ));
            }
            if irrefutable && case.guard.is_none() {
                saw_catch_all = true;
            }
        }
    }

    // ---- with / try -------------------------------------------------------

    pub(crate) fn lower_with(
        &mut self,
        context: &Expr,
        target: Option<&str>,
        body: &[Stmt],
        line: u32,
    ) -> CompileResult<()> {
        if target.is_some() {
            return Err(self.err_at(
                CompileError::syntax("with ... as <name> has no compiled meaning here"),
                line,
            ));
        }
        if let Expr::Call { func, args, .. } = context {
            if let Some(path) = func.dotted_path() {
                match path.as_slice() {
                    [name] if name == "label" => {
                        let [Expr::Constant(Constant::Str(label))] = args.as_slice() else {
                            return Err(self.err_at(
                                CompileError::syntax("label(name) takes a string literal"),
                                line,
                            ));
                        };
                        return self.lower_label_block(label, body, line);
                    }
                    [name] if name == "effect" => {
                        return Err(self.err_at(
                            CompileError::syntax(
                                "effect contexts wrap declarations, not statements",
                            ),
                            line,
                        ));
                    }
                    _ => {}
                }
            }
        }
        Err(self.err_at(
            CompileError::syntax("unsupported with-statement context"),
            line,
        ))
    }

    /// `try/finally`: the finally body runs on the structured fallthrough.
    /// Early exits from the protected body are rejected up front since no
    /// unwinder exists to run the finalizer on those paths.
    pub(crate) fn lower_try(
        &mut self,
        body: &[Stmt],
        finalbody: &[Stmt],
        line: u32,
    ) -> CompileResult<()> {
        if finalbody.is_empty() {
            return Err(self.err_at(
                CompileError::syntax("try without finally has no compiled meaning"),
                line,
            ));
        }
        if contains_early_exit(body) {
            return Err(self.err_at(
                CompileError::syntax(
                    "return/break/continue/goto inside try ... finally is not supported",
                ),
                line,
            ));
        }
        self.open_scope();
        self.lower_stmts(body)?;
        self.close_scope(line)?;
        self.lower_stmts(finalbody)
    }
}

fn signed_lt(ty: &Type) -> &'static str {
    match ty.unwrapped() {
        Type::Int { signed: false, .. } => "icmp ult",
        _ => "icmp slt",
    }
}

fn contains_early_exit(stmts: &[Stmt]) -> bool {
    use crate::ast::StmtKind;
    stmts.iter().any(|stmt| match &stmt.kind {
        StmtKind::Return { .. } | StmtKind::Break | StmtKind::Continue => true,
        StmtKind::Expr { value: Expr::Call { func, .. } } => func
            .dotted_path()
            .map(|p| {
                matches!(
                    p.as_slice(),
                    [name] if name == "goto" || name == "goto_end" || name == "__goto"
                )
            })
            .unwrap_or(false),
        StmtKind::If { body, orelse, .. } => {
            contains_early_exit(body) || contains_early_exit(orelse)
        }
        StmtKind::With { body, .. } => contains_early_exit(body),
        StmtKind::Match { cases, .. } => cases.iter().any(|c| contains_early_exit(&c.body)),
        StmtKind::Try { body, finalbody } => {
            contains_early_exit(body) || contains_early_exit(finalbody)
        }
        // Loops confine their own break/continue
        StmtKind::While { body, .. } | StmtKind::For { body, .. } => {
            contains_return_or_goto(body)
        }
        _ => false,
    })
}

fn contains_return_or_goto(stmts: &[Stmt]) -> bool {
    use crate::ast::StmtKind;
    stmts.iter().any(|stmt| match &stmt.kind {
        StmtKind::Return { .. } => true,
        StmtKind::Expr { value: Expr::Call { func, .. } } => func
            .dotted_path()
            .map(|p| {
                matches!(
                    p.as_slice(),
                    [name] if name == "goto" || name == "goto_end" || name == "__goto"
                )
            })
            .unwrap_or(false),
        StmtKind::If { body, orelse, .. } => {
            contains_return_or_goto(body) || contains_return_or_goto(orelse)
        }
        StmtKind::While { body, .. } | StmtKind::For { body, .. } => {
            contains_return_or_goto(body)
        }
        StmtKind::With { body, .. } => contains_return_or_goto(body),
        StmtKind::Match { cases, .. } => cases.iter().any(|c| contains_return_or_goto(&c.body)),
        StmtKind::Try { body, finalbody } => {
            contains_return_or_goto(body) || contains_return_or_goto(finalbody)
        }
        _ => false,
    })
}
