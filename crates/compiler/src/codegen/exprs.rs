//! Expression lowering
//!
//! Every expression becomes a [`ValueRef`]. Named variables evaluate to
//! addresses; loads happen lazily when a first-class value is needed, so
//! lvalue and rvalue positions share one path. Python constants stay
//! deferred (`PyConst`) until a typed context fixes them.

use crate::ast::{BinOp, BoolOpKind, CmpOp, Constant, Expr, UnaryOp};
use crate::cfg::EdgeKind;
use crate::error::{CompileError, CompileResult};
use crate::registry::LinearState;
use crate::types::{default_constant_type, promote_binary, Qualifiers, Type};
use crate::valueref::{ValueKind, ValueRef};

use super::Visitor;

impl Visitor<'_> {
    pub(crate) fn eval_expr(&mut self, expr: &Expr, line: u32) -> CompileResult<ValueRef> {
        match expr {
            Expr::Name(name) => self.eval_name(name, line),
            Expr::Constant(c) => Ok(ValueRef::py_const(c.clone())),
            Expr::BinOp { left, op, right } => self.eval_binop(left, *op, right, line),
            Expr::UnaryOp { op, operand } => self.eval_unaryop(*op, operand, line),
            Expr::BoolOp { op, values } => self.eval_boolop(*op, values, line),
            Expr::Compare { left, ops, comparators } => {
                self.eval_compare(left, ops, comparators, line)
            }
            Expr::Call { func, args, keywords } => self.eval_call(func, args, keywords, line),
            Expr::Subscript { .. } => self.eval_lvalue_or_value(expr, line),
            Expr::Attribute { .. } => self.eval_attribute_expr(expr, line),
            Expr::IfExp { test, body, orelse } => self.eval_ifexp(test, body, orelse, line),
            Expr::Yield { .. } => Err(self.err_at(
                CompileError::syntax("yield is only valid inside an inlined generator body"),
                line,
            )),
            Expr::Lambda { .. } => Err(self.err_at(
                CompileError::syntax("lambda has no compiled value; pass a named function"),
                line,
            )),
            Expr::Tuple(_) | Expr::List(_) => Err(self.err_at(
                CompileError::type_error("tuple/list literals only appear in unpacking targets"),
                line,
            )),
        }
    }

    /// Statement-position expression: result discarded
    pub(crate) fn eval_expr_for_effect(&mut self, expr: &Expr, line: u32) -> CompileResult<()> {
        match expr {
            Expr::Call { func, args, keywords } => {
                self.eval_call_stmt(func, args, keywords, line)?;
                Ok(())
            }
            other => {
                self.eval_expr(other, line)?;
                Ok(())
            }
        }
    }

    fn eval_name(&mut self, name: &str, line: u32) -> CompileResult<ValueRef> {
        if name == "nullptr" {
            return Ok(ValueRef::null(Type::Void));
        }
        if let Some(info) = self.vars.lookup(name) {
            let ty = info.type_hint.clone();
            let storage = info.storage.clone();
            let mut vref = match storage {
                Some(slot) => ValueRef::address(slot, ty.clone()).with_var(name),
                // Zero-sized linear token: no storage, only state
                None => ValueRef::value("zeroinitializer", ty.clone()).with_var(name),
            };
            if ty.contains_linear() {
                // A bare reference tracks the whole-variable path; field
                // access narrows it below in eval_attribute
                let root: Vec<usize> = Vec::new();
                if ty.is_linear() || ty.linear_paths().contains(&root) {
                    vref = vref.with_linear_source(name, root);
                } else {
                    vref = vref.with_var(name);
                }
            }
            return Ok(vref);
        }
        // A compiled function used as a value: function-pointer exposure
        if let Some(info) = self
            .session
            .resolve_function(name, &self.current_file)
            .cloned()
        {
            if info.is_inline {
                return Err(self.err_at(
                    CompileError::type_error(format!(
                        "inline function '{}' has no address",
                        name
                    )),
                    line,
                ));
            }
            let ty = Type::FuncPtr {
                params: info.param_types.clone(),
                ret: Box::new(info.return_type.clone()),
            };
            let operand = format!("@{}", info.mangled_name);
            self.declare_callee(&info.mangled_name)?;
            return Ok(ValueRef::value(operand, ty));
        }
        if self.session.classes.contains_key(name) {
            return Err(self.err_at(
                CompileError::type_error(format!("type '{}' used as a value", name)),
                line,
            ));
        }
        Err(self.err_at(
            CompileError::name_error(format!("unresolved name '{}'", name)),
            line,
        ))
    }

    /// Attribute in value position: struct field access or a bare enum
    /// variant reference
    fn eval_attribute_expr(&mut self, expr: &Expr, line: u32) -> CompileResult<ValueRef> {
        let Expr::Attribute { value, attr } = expr else {
            unreachable!("caller matched Attribute");
        };
        // EnumName.Variant builds a payload-less enum value
        if let Expr::Name(base) = value.as_ref() {
            if let Some(body) = self.session.enums.get(base).cloned() {
                let Some((_, variant)) = body.variant(attr) else {
                    return Err(self.err_at(
                        CompileError::name_error(format!(
                            "enum '{}' has no variant '{}'",
                            base, attr
                        )),
                        line,
                    ));
                };
                if variant.payload.is_some() {
                    return Err(self.err_at(
                        CompileError::type_error(format!(
                            "variant '{}.{}' carries a payload; construct it with arguments",
                            base, attr
                        )),
                        line,
                    ));
                }
                let tag = variant.tag;
                return self.build_enum_value(&body, tag, None, line);
            }
        }
        let base = self.eval_expr(value, line)?;
        self.handle_attribute(base, attr, line)
    }

    /// Struct/refined attribute dispatch. Address bases yield field
    /// addresses; value bases extract.
    pub(crate) fn handle_attribute(
        &mut self,
        base: ValueRef,
        attr: &str,
        line: u32,
    ) -> CompileResult<ValueRef> {
        let base_ty = base.type_hint.clone();
        let Type::Struct(body) = base_ty.unwrapped().clone() else {
            return Err(self.err_at(
                CompileError::type_error(format!(
                    "type '{}' has no attribute '{}'",
                    base.type_hint, attr
                )),
                line,
            ));
        };
        let index = body.field_index(attr).ok_or_else(|| {
            self.err_at(
                CompileError::type_error(format!(
                    "struct '{}' has no field '{}'",
                    body.name, attr
                )),
                line,
            )
        })?;
        let field_ty = body.fields[index].1.clone();
        let quals = base_ty.qualifiers();
        let aggregate_ir = base_ty.ir_type()?;

        let mut result = match base.kind {
            ValueKind::Address => {
                let addr = self.func.struct_gep(&aggregate_ir, &base.ir, index)?;
                ValueRef::address(addr, Type::qualified(field_ty.clone(), quals))
            }
            ValueKind::Value => {
                let value = self.func.extract_value(&aggregate_ir, &base.ir, index)?;
                ValueRef::value(value, field_ty.clone())
            }
            _ => {
                return Err(self.err_at(
                    CompileError::type_error("attribute access needs a struct value"),
                    line,
                ));
            }
        };
        // Narrow the linear path through the field
        if field_ty.contains_linear() {
            if let Some(var) = &base.var_name {
                let mut path = base.linear_path.clone().unwrap_or_default();
                path.push(index);
                result = result.with_linear_source(var.clone(), path);
            }
        }
        Ok(result)
    }

    /// Subscript in value or lvalue position. Arrays decay to pointers
    /// before indexing; pointer subscripts are plain element arithmetic.
    pub(crate) fn eval_lvalue_or_value(&mut self, expr: &Expr, line: u32) -> CompileResult<ValueRef> {
        let Expr::Subscript { value, index } = expr else {
            return self.eval_expr(expr, line);
        };
        let base = self.eval_expr(value, line)?;
        let index_ref = self.eval_expr(index, line)?;
        self.handle_subscript(base, index_ref, line)
    }

    pub(crate) fn handle_subscript(
        &mut self,
        base: ValueRef,
        index: ValueRef,
        line: u32,
    ) -> CompileResult<ValueRef> {
        let index_op = self.materialize(&index, &Type::I64, line)?;
        let base_ty = base.type_hint.clone();
        let quals = base_ty.qualifiers();
        match base_ty.unwrapped() {
            Type::Array { element, dims } => {
                if base.kind != ValueKind::Address {
                    return Err(self.err_at(
                        CompileError::type_error("cannot index an unaddressed array value"),
                        line,
                    ));
                }
                // Decay: index through the first dimension; the result is
                // an element (1-D) or sub-array (k-D) address
                let result_ty = if dims.len() <= 1 {
                    (**element).clone()
                } else {
                    Type::Array { element: element.clone(), dims: dims[1..].to_vec() }
                };
                let array_ir = base_ty.ir_type()?;
                let addr = self.func.gep(
                    &array_ir,
                    &base.ir,
                    &["i64 0".to_string(), format!("i64 {}", index_op)],
                )?;
                Ok(ValueRef::address(addr, Type::qualified(result_ty, quals)))
            }
            Type::Ptr { pointee } => {
                let pointee = (**pointee).clone();
                let ptr_value = self.load_if_address(&base)?;
                let element_ir = pointee.ir_type()?;
                let addr = self.func.index_gep(&element_ir, &ptr_value.ir, &index_op)?;
                Ok(ValueRef::address(addr, Type::qualified(pointee, quals)))
            }
            other => Err(self.err_at(
                CompileError::type_error(format!("type '{}' is not subscriptable", other)),
                line,
            )),
        }
    }

    fn eval_binop(&mut self, left: &Expr, op: BinOp, right: &Expr, line: u32) -> CompileResult<ValueRef> {
        let lhs = self.eval_expr(left, line)?;
        let rhs = self.eval_expr(right, line)?;

        // Constant folding keeps both sides deferred
        if let (Some(Constant::Int(a)), Some(Constant::Int(b))) = (&lhs.constant, &rhs.constant) {
            if let Some(folded) = fold_int(*a, op, *b) {
                return Ok(ValueRef::py_const(Constant::Int(folded)));
            }
        }

        // Pointer arithmetic: ptr +/- int
        if lhs.type_hint.is_pointer() && matches!(op, BinOp::Add | BinOp::Sub) {
            let Type::Ptr { pointee } = lhs.type_hint.unwrapped().clone() else {
                return Err(self.err_at(
                    CompileError::type_error("function pointers do not support arithmetic"),
                    line,
                ));
            };
            let ptr = self.load_if_address(&lhs)?;
            let mut offset = self.materialize(&rhs, &Type::I64, line)?;
            if op == BinOp::Sub {
                offset = self.func.binop("sub", "i64", "0", &offset)?;
            }
            let element_ir = pointee.ir_type()?;
            let addr = self.func.index_gep(&element_ir, &ptr.ir, &offset)?;
            return Ok(ValueRef::value(addr, Type::ptr_to((*pointee).clone())));
        }

        let result_ty = self.common_type(&lhs, &rhs, line)?;
        let lhs_op = self.materialize(&lhs, &result_ty, line)?;
        let rhs_op = self.materialize(&rhs, &result_ty, line)?;
        let ir_ty = result_ty.ir_type()?;
        let opcode = binop_opcode(op, &result_ty).ok_or_else(|| {
            self.err_at(
                CompileError::type_error(format!(
                    "operator '{}' is not defined for '{}'",
                    op, result_ty
                )),
                line,
            )
        })?;
        let result = self.func.binop(opcode, &ir_ty, &lhs_op, &rhs_op)?;
        Ok(ValueRef::value(result, result_ty))
    }

    fn eval_unaryop(&mut self, op: UnaryOp, operand: &Expr, line: u32) -> CompileResult<ValueRef> {
        let value = self.eval_expr(operand, line)?;
        match op {
            UnaryOp::Not => {
                let b = self.to_bool(&value, line)?;
                let inverted = self.func.binop("xor", "i1", &b, "true")?;
                Ok(ValueRef::value(inverted, Type::Bool))
            }
            UnaryOp::USub => {
                if let Some(Constant::Int(v)) = &value.constant {
                    return Ok(ValueRef::py_const(Constant::Int(-v)));
                }
                if let Some(Constant::Float(v)) = &value.constant {
                    return Ok(ValueRef::py_const(Constant::Float(-v)));
                }
                let ty = self.concrete_type_of(&value)?;
                let op_str = self.materialize(&value, &ty, line)?;
                let ir_ty = ty.ir_type()?;
                let result = if ty.is_float() {
                    self.func.binop("fsub", &ir_ty, &float_literal(-0.0), &op_str)?
                } else {
                    self.func.binop("sub", &ir_ty, "0", &op_str)?
                };
                Ok(ValueRef::value(result, ty))
            }
            UnaryOp::UAdd => Ok(value),
            UnaryOp::Invert => {
                let ty = self.concrete_type_of(&value)?;
                if !ty.is_integer() {
                    return Err(self.err_at(
                        CompileError::type_error("~ requires an integer operand"),
                        line,
                    ));
                }
                let op_str = self.materialize(&value, &ty, line)?;
                let ir_ty = ty.ir_type()?;
                let result = self.func.binop("xor", &ir_ty, &op_str, "-1")?;
                Ok(ValueRef::value(result, ty))
            }
        }
    }

    /// Short-circuit and/or through a bool slot and branch chain
    fn eval_boolop(&mut self, op: BoolOpKind, values: &[Expr], line: u32) -> CompileResult<ValueRef> {
        let slot = self.func.alloca("i1", "boolop");
        let (end_block, end_label) = self.new_block("boolop_end");
        let last = values.len() - 1;
        for (i, value) in values.iter().enumerate() {
            let evaluated = self.eval_expr(value, line)?;
            let b = self.to_bool(&evaluated, line)?;
            self.func.store("i1", &b, &slot, Qualifiers::NONE)?;
            if i < last {
                let (next_block, next_label) = self.new_block("boolop_next");
                match op {
                    BoolOpKind::And => {
                        self.cfg.add_edge(self.current_block, next_block, EdgeKind::BranchTrue);
                        self.cfg.add_edge(self.current_block, end_block, EdgeKind::BranchFalse);
                        self.func.conditional_branch(&b, &next_label, &end_label)?;
                    }
                    BoolOpKind::Or => {
                        self.cfg.add_edge(self.current_block, end_block, EdgeKind::BranchTrue);
                        self.cfg.add_edge(self.current_block, next_block, EdgeKind::BranchFalse);
                        self.func.conditional_branch(&b, &end_label, &next_label)?;
                    }
                }
                self.seal_current();
                self.switch_to(next_block, &next_label)?;
            }
        }
        self.branch_to(end_block, &end_label.clone(), EdgeKind::Sequential)?;
        self.switch_to(end_block, &end_label)?;
        let result = self.func.load("i1", &slot, Qualifiers::NONE)?;
        Ok(ValueRef::value(result, Type::Bool))
    }

    fn eval_compare(
        &mut self,
        left: &Expr,
        ops: &[CmpOp],
        comparators: &[Expr],
        line: u32,
    ) -> CompileResult<ValueRef> {
        if ops.len() != comparators.len() || ops.is_empty() {
            return Err(self.err_at(CompileError::syntax("malformed comparison"), line));
        }
        let mut current = self.eval_expr(left, line)?;
        let mut accumulated: Option<String> = None;
        for (op, comparator) in ops.iter().zip(comparators.iter()) {
            let rhs = self.eval_expr(comparator, line)?;
            let flag = self.compare_pair(&current, *op, &rhs, line)?;
            accumulated = Some(match accumulated {
                Some(prev) => self.func.binop("and", "i1", &prev, &flag)?,
                None => flag,
            });
            current = rhs;
        }
        Ok(ValueRef::value(accumulated.expect("at least one op"), Type::Bool))
    }

    fn compare_pair(
        &mut self,
        lhs: &ValueRef,
        op: CmpOp,
        rhs: &ValueRef,
        line: u32,
    ) -> CompileResult<String> {
        // Pointer comparison against nullptr or another pointer
        if lhs.type_hint.is_pointer() || rhs.type_hint.is_pointer() {
            let lhs_op = self.load_if_address(lhs)?;
            let rhs_op = self.load_if_address(rhs)?;
            let opcode = match op {
                CmpOp::Eq => "icmp eq",
                CmpOp::NotEq => "icmp ne",
                _ => {
                    return Err(self.err_at(
                        CompileError::type_error("pointers support only == and !="),
                        line,
                    ));
                }
            };
            return self.func.cmp(opcode, "ptr", &lhs_op.ir, &rhs_op.ir);
        }
        let ty = self.common_type(lhs, rhs, line)?;
        let lhs_op = self.materialize(lhs, &ty, line)?;
        let rhs_op = self.materialize(rhs, &ty, line)?;
        let ir_ty = ty.ir_type()?;
        let opcode = cmp_opcode(op, &ty);
        self.func.cmp(&opcode, &ir_ty, &lhs_op, &rhs_op)
    }

    fn eval_ifexp(
        &mut self,
        test: &Expr,
        body: &Expr,
        orelse: &Expr,
        line: u32,
    ) -> CompileResult<ValueRef> {
        let condition = self.eval_expr(test, line)?;
        let cond = self.to_bool(&condition, line)?;
        let (then_block, then_label) = self.new_block("ifexp_then");
        let (else_block, else_label) = self.new_block("ifexp_else");
        let (merge_block, merge_label) = self.new_block("ifexp_merge");
        self.cfg.add_edge(self.current_block, then_block, EdgeKind::BranchTrue);
        self.cfg.add_edge(self.current_block, else_block, EdgeKind::BranchFalse);
        self.func.conditional_branch(&cond, &then_label, &else_label)?;
        self.seal_current();

        self.switch_to(then_block, &then_label)?;
        let then_value = self.eval_expr(body, line)?;
        let result_ty = self.concrete_type_of(&then_value)?;
        let ir_ty = result_ty.ir_type()?;
        let slot = self.func.alloca(&ir_ty, "ifexp");
        let then_op = self.materialize(&then_value, &result_ty, line)?;
        self.func.store(&ir_ty, &then_op, &slot, Qualifiers::NONE)?;
        self.branch_to(merge_block, &merge_label.clone(), EdgeKind::Sequential)?;

        self.switch_to(else_block, &else_label)?;
        let else_value = self.eval_expr(orelse, line)?;
        let else_op = self.materialize(&else_value, &result_ty, line)?;
        self.func.store(&ir_ty, &else_op, &slot, Qualifiers::NONE)?;
        self.branch_to(merge_block, &merge_label.clone(), EdgeKind::Sequential)?;

        self.switch_to(merge_block, &merge_label)?;
        let result = self.func.load(&ir_ty, &slot, Qualifiers::NONE)?;
        Ok(ValueRef::value(result, result_ty))
    }

    // ---- conversion helpers -----------------------------------------------

    /// Address refs load to first-class values; everything else passes
    /// through unchanged
    pub(crate) fn load_if_address(&mut self, value: &ValueRef) -> CompileResult<ValueRef> {
        if value.kind != ValueKind::Address {
            return Ok(value.clone());
        }
        let ty = value.type_hint.clone();
        let ir_ty = ty.ir_type()?;
        let loaded = self.func.load(&ir_ty, &value.ir, ty.qualifiers())?;
        let mut out = ValueRef::value(loaded, ty);
        out.var_name = value.var_name.clone();
        out.linear_path = value.linear_path.clone();
        Ok(out)
    }

    /// The concrete type of a reference, defaulting deferred constants
    pub(crate) fn concrete_type_of(&self, value: &ValueRef) -> CompileResult<Type> {
        if let Some(constant) = &value.constant {
            return default_constant_type(constant);
        }
        Ok(value.type_hint.clone())
    }

    /// Common arithmetic type of two operands, letting deferred constants
    /// adopt the typed peer
    fn common_type(&self, lhs: &ValueRef, rhs: &ValueRef, line: u32) -> CompileResult<Type> {
        let result = match (&lhs.constant, &rhs.constant) {
            (Some(_), None) => {
                let rhs_ty = rhs.type_hint.clone();
                if rhs_ty.is_integer() || rhs_ty.is_float() || rhs_ty.unwrapped() == &Type::Bool {
                    Ok(rhs_ty.unwrapped().clone())
                } else {
                    promote_binary(&self.concrete_type_of(lhs)?, &rhs_ty)
                }
            }
            (None, Some(_)) => {
                let lhs_ty = lhs.type_hint.clone();
                if lhs_ty.is_integer() || lhs_ty.is_float() || lhs_ty.unwrapped() == &Type::Bool {
                    Ok(lhs_ty.unwrapped().clone())
                } else {
                    promote_binary(&lhs_ty, &self.concrete_type_of(rhs)?)
                }
            }
            _ => promote_binary(&self.concrete_type_of(lhs)?, &self.concrete_type_of(rhs)?),
        };
        result.map_err(|e| self.err_at(e, line))
    }

    /// Produce an operand of exactly `target` type: coerce then load
    pub(crate) fn materialize(
        &mut self,
        value: &ValueRef,
        target: &Type,
        line: u32,
    ) -> CompileResult<String> {
        let coerced = self.coerce_to(value.clone(), target, line)?;
        let loaded = self.load_if_address(&coerced)?;
        Ok(loaded.ir)
    }

    /// Implicit conversion toward `target`. Widening only; narrowing and
    /// int<->pointer conversions must be explicit casts.
    pub(crate) fn coerce_to(
        &mut self,
        value: ValueRef,
        target: &Type,
        line: u32,
    ) -> CompileResult<ValueRef> {
        // Deferred constants promote directly to the target
        if let Some(constant) = value.constant.clone() {
            return self.promote_constant(&constant, target, line);
        }
        let source_ty = value.type_hint.clone();
        if source_ty.compatible_with(target) {
            return Ok(value);
        }
        // nullptr adapts to any pointer target
        if value.kind == ValueKind::PtrConst && target.is_pointer() {
            let mut out = value;
            out.type_hint = target.unwrapped().clone();
            return Ok(out);
        }
        let loaded = self.load_if_address(&value)?;
        match (source_ty.unwrapped(), target.unwrapped()) {
            (Type::Int { width: sw, signed }, Type::Int { width: tw, .. }) if sw < tw => {
                let opcode = if *signed { "sext" } else { "zext" };
                let converted = self.func.cast(
                    opcode,
                    &loaded.ir,
                    &source_ty.ir_type()?,
                    &target.ir_type()?,
                )?;
                Ok(ValueRef::value(converted, target.unwrapped().clone()))
            }
            (Type::Float { width: 32 }, Type::Float { width: 64 }) => {
                let converted = self.func.cast("fpext", &loaded.ir, "float", "double")?;
                Ok(ValueRef::value(converted, Type::F64))
            }
            (Type::Int { signed, .. }, Type::Float { .. }) => {
                let opcode = if *signed { "sitofp" } else { "uitofp" };
                let converted = self.func.cast(
                    opcode,
                    &loaded.ir,
                    &source_ty.ir_type()?,
                    &target.ir_type()?,
                )?;
                Ok(ValueRef::value(converted, target.unwrapped().clone()))
            }
            (Type::Bool, Type::Int { .. }) => {
                let converted =
                    self.func.cast("zext", &loaded.ir, "i1", &target.ir_type()?)?;
                Ok(ValueRef::value(converted, target.unwrapped().clone()))
            }
            (Type::Int { .. }, Type::Ptr { .. }) | (Type::Ptr { .. }, Type::Int { .. }) => {
                Err(self.err_at(
                    CompileError::type_error(format!(
                        "implicit conversion between '{}' and '{}' is forbidden; \
                         use an explicit ptr[...] cast",
                        source_ty, target
                    )),
                    line,
                ))
            }
            _ => Err(self.err_at(
                CompileError::type_error(format!(
                    "cannot implicitly convert '{}' to '{}'",
                    source_ty, target
                )),
                line,
            )),
        }
    }

    /// Render a deferred constant at a concrete type
    pub(crate) fn promote_constant(
        &mut self,
        constant: &Constant,
        target: &Type,
        line: u32,
    ) -> CompileResult<ValueRef> {
        let target_ty = if matches!(target, Type::PyConst) {
            default_constant_type(constant).map_err(|e| self.err_at(e, line))?
        } else {
            target.unwrapped().clone()
        };
        match (constant, &target_ty) {
            (Constant::Int(v), Type::Int { width, signed }) => {
                if !int_fits(*v, *width, *signed) {
                    return Err(self.err_at(
                        CompileError::type_error(format!(
                            "constant {} does not fit in {}",
                            v, target_ty
                        )),
                        line,
                    ));
                }
                Ok(ValueRef::value(v.to_string(), target_ty))
            }
            (Constant::Int(v), Type::Float { .. }) => {
                Ok(ValueRef::value(float_literal(*v as f64), target_ty))
            }
            (Constant::Int(_), Type::Ptr { .. }) => Err(self.err_at(
                CompileError::type_error(
                    "implicit Python int to pointer conversion is forbidden; \
                     use ptr[T](...)",
                ),
                line,
            )),
            (Constant::Float(v), Type::Float { width }) => {
                let rendered = if *width == 32 {
                    float32_literal(*v)
                } else {
                    float_literal(*v)
                };
                Ok(ValueRef::value(rendered, target_ty))
            }
            (Constant::Bool(v), Type::Bool) => {
                Ok(ValueRef::value(if *v { "true" } else { "false" }, Type::Bool))
            }
            (Constant::Bool(v), Type::Int { .. }) => {
                Ok(ValueRef::value(i64::from(*v).to_string(), target_ty))
            }
            (Constant::Str(s), Type::Ptr { pointee }) if pointee.unwrapped() == &Type::I8 => {
                let global = self.module_ir.intern_string(s);
                Ok(ValueRef::value(global, Type::ptr_to(Type::I8)))
            }
            _ => Err(self.err_at(
                CompileError::type_error(format!(
                    "constant {} cannot take type '{}'",
                    constant, target_ty
                )),
                line,
            )),
        }
    }

    /// Truthiness: bools pass through, numbers compare against zero,
    /// pointers against null
    pub(crate) fn to_bool(&mut self, value: &ValueRef, line: u32) -> CompileResult<String> {
        if let Some(Constant::Bool(b)) = &value.constant {
            return Ok(if *b { "true" } else { "false" }.to_string());
        }
        let ty = self.concrete_type_of(value)?;
        let operand = self.materialize(value, &ty, line)?;
        match ty.unwrapped() {
            Type::Bool => Ok(operand),
            Type::Int { .. } => self.func.cmp("icmp ne", &ty.ir_type()?, &operand, "0"),
            Type::Float { .. } => self.func.cmp("fcmp une", &ty.ir_type()?, &operand, "0.0"),
            Type::Ptr { .. } | Type::FuncPtr { .. } => {
                self.func.cmp("icmp ne", "ptr", &operand, "null")
            }
            other => Err(self.err_at(
                CompileError::type_error(format!("type '{}' has no truth value", other)),
                line,
            )),
        }
    }

    /// Build an enum aggregate in a slot: tag plus optional payload
    pub(crate) fn build_enum_value(
        &mut self,
        body: &crate::types::EnumBody,
        tag: i64,
        payload: Option<(&ValueRef, &Type)>,
        line: u32,
    ) -> CompileResult<ValueRef> {
        let enum_ty = Type::Enum(std::rc::Rc::new(body.clone()));
        let enum_ir = enum_ty.ir_type()?;
        let slot = self.func.alloca(&enum_ir, &body.name.to_lowercase());
        let tag_addr = self.func.struct_gep(&enum_ir, &slot, 0)?;
        self.func.store("i32", &tag.to_string(), &tag_addr, Qualifiers::NONE)?;
        if let Some((value, payload_ty)) = payload {
            let operand = self.materialize(value, payload_ty, line)?;
            let payload_addr = self.func.struct_gep(&enum_ir, &slot, 1)?;
            self.func
                .store(&payload_ty.ir_type()?, &operand, &payload_addr, Qualifiers::NONE)?;
        }
        Ok(ValueRef::address(slot, enum_ty))
    }

    /// Mark a linear source consumed when the surrounding operation moves
    /// ownership out of it (argument passing, plain moves)
    pub(crate) fn transfer_if_linear(&mut self, value: &ValueRef, line: u32) -> CompileResult<()> {
        if value.type_hint.contains_linear() && value.tracks_linear() {
            self.consume_linear(value, line)?;
        }
        Ok(())
    }

    /// Guard loads of linear-tracked locations: reading an inactive token
    /// is use-after-consume
    pub(crate) fn check_readable(&self, value: &ValueRef, line: u32) -> CompileResult<()> {
        if let (Some(var), Some(path)) = (&value.var_name, &value.linear_path) {
            let state = self.linear_state_of(var, path);
            if state == LinearState::Consumed || state == LinearState::Moved {
                return Err(self.err_at(
                    CompileError::linear(format!(
                        "use_after_consume: token '{}' was already consumed",
                        var
                    )),
                    line,
                ));
            }
        }
        Ok(())
    }
}

fn fold_int(a: i64, op: BinOp, b: i64) -> Option<i64> {
    match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mult => a.checked_mul(b),
        BinOp::Div | BinOp::FloorDiv => a.checked_div(b),
        BinOp::Mod => a.checked_rem(b),
        BinOp::LShift => u32::try_from(b).ok().and_then(|s| a.checked_shl(s)),
        BinOp::RShift => u32::try_from(b).ok().and_then(|s| a.checked_shr(s)),
        BinOp::BitOr => Some(a | b),
        BinOp::BitXor => Some(a ^ b),
        BinOp::BitAnd => Some(a & b),
    }
}

fn binop_opcode(op: BinOp, ty: &Type) -> Option<&'static str> {
    let (is_float, signed) = match ty.unwrapped() {
        Type::Float { .. } => (true, true),
        Type::Int { signed, .. } => (false, *signed),
        Type::Bool => (false, false),
        _ => return None,
    };
    let opcode = match (op, is_float) {
        (BinOp::Add, false) => "add",
        (BinOp::Add, true) => "fadd",
        (BinOp::Sub, false) => "sub",
        (BinOp::Sub, true) => "fsub",
        (BinOp::Mult, false) => "mul",
        (BinOp::Mult, true) => "fmul",
        (BinOp::Div, false) | (BinOp::FloorDiv, false) => {
            if signed {
                "sdiv"
            } else {
                "udiv"
            }
        }
        (BinOp::Div, true) => "fdiv",
        (BinOp::FloorDiv, true) => return None,
        (BinOp::Mod, false) => {
            if signed {
                "srem"
            } else {
                "urem"
            }
        }
        (BinOp::Mod, true) => "frem",
        (BinOp::LShift, false) => "shl",
        (BinOp::RShift, false) => {
            if signed {
                "ashr"
            } else {
                "lshr"
            }
        }
        (BinOp::BitOr, false) => "or",
        (BinOp::BitXor, false) => "xor",
        (BinOp::BitAnd, false) => "and",
        _ => return None,
    };
    Some(opcode)
}

fn cmp_opcode(op: CmpOp, ty: &Type) -> String {
    match ty.unwrapped() {
        Type::Float { .. } => {
            let suffix = match op {
                CmpOp::Eq => "oeq",
                CmpOp::NotEq => "une",
                CmpOp::Lt => "olt",
                CmpOp::LtE => "ole",
                CmpOp::Gt => "ogt",
                CmpOp::GtE => "oge",
            };
            format!("fcmp {}", suffix)
        }
        Type::Int { signed, .. } => {
            let suffix = match (op, signed) {
                (CmpOp::Eq, _) => "eq",
                (CmpOp::NotEq, _) => "ne",
                (CmpOp::Lt, true) => "slt",
                (CmpOp::Lt, false) => "ult",
                (CmpOp::LtE, true) => "sle",
                (CmpOp::LtE, false) => "ule",
                (CmpOp::Gt, true) => "sgt",
                (CmpOp::Gt, false) => "ugt",
                (CmpOp::GtE, true) => "sge",
                (CmpOp::GtE, false) => "uge",
            };
            format!("icmp {}", suffix)
        }
        _ => {
            let suffix = match op {
                CmpOp::Eq => "eq",
                _ => "ne",
            };
            format!("icmp {}", suffix)
        }
    }
}

/// Hex-encoded double literal, exact for any f64
fn float_literal(v: f64) -> String {
    format!("0x{:016X}", v.to_bits())
}

/// f32 literals are spelled as the double that rounds to the same float
fn float32_literal(v: f64) -> String {
    format!("0x{:016X}", ((v as f32) as f64).to_bits())
}

fn int_fits(v: i64, width: u8, signed: bool) -> bool {
    match (width, signed) {
        (8, true) => i8::try_from(v).is_ok(),
        (16, true) => i16::try_from(v).is_ok(),
        (32, true) => i32::try_from(v).is_ok(),
        (64, true) => true,
        (8, false) => u8::try_from(v).is_ok(),
        (16, false) => u16::try_from(v).is_ok(),
        (32, false) => u32::try_from(v).is_ok(),
        // Any 64-bit pattern is a valid u64 constant
        (64, false) => true,
        _ => false,
    }
}
