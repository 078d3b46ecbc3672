//! Call lowering
//!
//! Resolution order for a call expression:
//!
//! 1. intrinsics (`move`, `consume`, `sizeof`, `typeof`, `assume`,
//!    `refine`, `defer`, `char`, flat `__label`/`__goto`, `linear()`)
//! 2. `effect.<name>.<fn>` dereferences through the override stack
//! 3. enum variant and struct constructors
//! 4. type-constructor expressions (`array[T,N]()`, `ptr[T](x)`, `i32(x)`)
//! 5. registered functions: inline splice or native call
//! 6. function-pointer variables
//!
//! Every emitted call registers the callee in the group's dependency list,
//! and calls under an effect suffix retarget callees that transitively
//! reach an overridden effect to suffixed specializations compiled into
//! this same group.

use crate::ast::{Constant, Expr};
use crate::build::deps::CallableDep;
use crate::effects::{mangle, reaches_overridden_effect};
use crate::error::{CompileError, CompileResult};
use crate::inline::{check_inlinable, expand, ExitRule, InlineMode};
use crate::registry::FunctionInfo;
use crate::resolver::TypeResolver;
use crate::types::{Qualifiers, Type};
use crate::valueref::{ValueKind, ValueRef};

use super::Visitor;

impl Visitor<'_> {
    pub(crate) fn eval_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        keywords: &[(String, Expr)],
        line: u32,
    ) -> CompileResult<ValueRef> {
        let result = self.eval_call_inner(func, args, keywords, line)?;
        match result {
            Some(value) => Ok(value),
            None => Err(self.err_at(
                CompileError::type_error("void call used in value position"),
                line,
            )),
        }
    }

    pub(crate) fn eval_call_stmt(
        &mut self,
        func: &Expr,
        args: &[Expr],
        keywords: &[(String, Expr)],
        line: u32,
    ) -> CompileResult<Option<ValueRef>> {
        self.eval_call_inner(func, args, keywords, line)
    }

    fn eval_call_inner(
        &mut self,
        func: &Expr,
        args: &[Expr],
        keywords: &[(String, Expr)],
        line: u32,
    ) -> CompileResult<Option<ValueRef>> {
        if let Some(path) = func.dotted_path() {
            match path.as_slice() {
                [single] => {
                    if let Some(result) = self.eval_intrinsic(single, args, line)? {
                        return Ok(result);
                    }
                }
                [head, rest @ ..] if head == "effect" => {
                    return self.eval_effect_call(rest, args, line);
                }
                [class, variant] => {
                    if let Some(body) = self.session.enums.get(class).cloned() {
                        return self
                            .eval_enum_constructor(&body, variant, args, line)
                            .map(Some);
                    }
                }
                _ => {}
            }
        }

        // Struct constructor by class name
        if let Expr::Name(name) = func {
            if let Some(ty) = self.session.classes.get(name).cloned() {
                if let Type::Struct(body) = ty.unwrapped().clone() {
                    return self
                        .eval_struct_constructor(&body, args, keywords, line)
                        .map(Some);
                }
                return Err(self.err_at(
                    CompileError::type_error(format!(
                        "enum '{}' is constructed through its variants",
                        name
                    )),
                    line,
                ));
            }
            // Builtin scalar conversion: i32(x), f64(x), ...
            if let Some(target) = Type::builtin(name) {
                return self.eval_scalar_cast(target, args, line).map(Some);
            }
        }

        // Type-constructor expression: array[...]() / ptr[T](x)
        if let Expr::Subscript { .. } = func {
            if let Ok(ty) = self.try_resolve_type(func) {
                return self.eval_type_constructor(ty, args, line);
            }
        }

        if !keywords.is_empty() {
            return Err(self.err_at(
                CompileError::overload("keyword arguments are only valid on struct constructors"),
                line,
            ));
        }

        // Registered function
        if let Some(path) = func.dotted_path() {
            let name = path.join(".");
            if let Some(info) = self
                .session
                .resolve_function(&name, &self.current_file)
                .cloned()
            {
                return self.eval_function_call(&info, args, line);
            }
        }

        // Function pointer variable
        let callee = self.eval_expr(func, line)?;
        if let Type::FuncPtr { params, ret } = callee.type_hint.unwrapped().clone() {
            let loaded = self.load_if_address(&callee)?;
            return self.emit_indirect_call(&loaded.ir, &params, &ret, args, line);
        }

        Err(self.err_at(
            CompileError::name_error(format!(
                "unresolved callee {:?}",
                func.dotted_path().map(|p| p.join(".")).unwrap_or_default()
            )),
            line,
        ))
    }

    // ---- intrinsics -------------------------------------------------------

    /// Returns `Ok(None)` when `name` is not an intrinsic
    #[allow(clippy::type_complexity)]
    fn eval_intrinsic(
        &mut self,
        name: &str,
        args: &[Expr],
        line: u32,
    ) -> CompileResult<Option<Option<ValueRef>>> {
        match name {
            "move" => {
                let [arg] = args else {
                    return Err(self.err_at(CompileError::syntax("move(x) takes one argument"), line));
                };
                let value = self.eval_expr(arg, line)?;
                self.check_readable(&value, line)?;
                let mut moved = self.load_if_address(&value)?;
                if value.tracks_linear() {
                    self.consume_linear(&value, line)?;
                    // The moved-out value is fresh; it no longer aliases
                    // the source path
                    moved.var_name = None;
                    moved.linear_path = None;
                }
                Ok(Some(Some(moved)))
            }
            "consume" => {
                let [arg] = args else {
                    return Err(
                        self.err_at(CompileError::syntax("consume(t) takes one argument"), line)
                    );
                };
                let value = self.eval_expr(arg, line)?;
                if !value.type_hint.contains_linear() {
                    return Err(self.err_at(
                        CompileError::type_error("consume() expects a linear token"),
                        line,
                    ));
                }
                self.consume_linear(&value, line)?;
                Ok(Some(None))
            }
            "linear" => {
                if !args.is_empty() {
                    return Err(
                        self.err_at(CompileError::syntax("linear() takes no arguments"), line)
                    );
                }
                Ok(Some(Some(ValueRef::value("zeroinitializer", Type::Linear))))
            }
            "typeof" => {
                let [arg] = args else {
                    return Err(
                        self.err_at(CompileError::syntax("typeof(x) takes one argument"), line)
                    );
                };
                let value = self.eval_expr(arg, line)?;
                let ty = self.concrete_type_of(&value)?;
                let mut marker = ValueRef::py_const(Constant::None);
                marker.type_hint = ty;
                marker.constant = None;
                Ok(Some(Some(marker)))
            }
            "sizeof" => {
                let [arg] = args else {
                    return Err(
                        self.err_at(CompileError::syntax("sizeof(T) takes one argument"), line)
                    );
                };
                let ty = match self.try_resolve_type(arg) {
                    Ok(ty) => ty,
                    Err(_) => {
                        let value = self.eval_expr(arg, line)?;
                        if value.constant.is_none() && value.type_hint == Type::PyConst {
                            value.type_hint
                        } else {
                            self.concrete_type_of(&value)?
                        }
                    }
                };
                let size = ty.byte_size().map_err(|e| self.err_at(e, line))?;
                Ok(Some(Some(ValueRef::py_const(Constant::Int(size as i64)))))
            }
            "assume" | "refine" => {
                let (first, rest) = args.split_first().ok_or_else(|| {
                    self.err_at(
                        CompileError::syntax(format!("{}(v, ...) needs a subject", name)),
                        line,
                    )
                })?;
                let value = self.eval_expr(first, line)?;
                let base = self.concrete_type_of(&value)?;
                let mut predicates = Vec::new();
                let mut tags = Vec::new();
                for extra in rest {
                    match extra {
                        Expr::Constant(Constant::Str(tag)) => tags.push(tag.clone()),
                        Expr::Name(pred) => predicates.push(pred.clone()),
                        Expr::Lambda { .. } => predicates.push("<lambda>".to_string()),
                        _ => {
                            return Err(self.err_at(
                                CompileError::type_error(
                                    "refinement arguments must be predicates or string tags",
                                ),
                                line,
                            ));
                        }
                    }
                }
                let mut refined = value;
                refined.type_hint = Type::Refined {
                    base: Box::new(base),
                    predicates,
                    tags,
                };
                Ok(Some(Some(refined)))
            }
            "defer" => {
                let (callee, rest) = args.split_first().ok_or_else(|| {
                    self.err_at(CompileError::syntax("defer(f, ...) needs a callable"), line)
                })?;
                self.register_defer(callee, rest, line)?;
                Ok(Some(None))
            }
            "char" => {
                let [Expr::Constant(Constant::Str(s))] = args else {
                    return Err(self.err_at(
                        CompileError::syntax("char(c) takes a one-character string"),
                        line,
                    ));
                };
                let mut chars = s.chars();
                let (Some(c), None) = (chars.next(), chars.next()) else {
                    return Err(self.err_at(
                        CompileError::syntax("char(c) takes a one-character string"),
                        line,
                    ));
                };
                Ok(Some(Some(ValueRef::py_const(Constant::Int(c as i64)))))
            }
            "__label" => {
                let [Expr::Constant(Constant::Str(label))] = args else {
                    return Err(
                        self.err_at(CompileError::syntax("__label(name) takes a string"), line)
                    );
                };
                self.flat_label(label, line)?;
                Ok(Some(None))
            }
            "__goto" => {
                let [Expr::Constant(Constant::Str(label))] = args else {
                    return Err(
                        self.err_at(CompileError::syntax("__goto(name) takes a string"), line)
                    );
                };
                self.lower_goto(label, false, line)?;
                Ok(Some(None))
            }
            "goto" | "goto_end" => {
                let [Expr::Constant(Constant::Str(label))] = args else {
                    return Err(self.err_at(
                        CompileError::syntax(format!("{}(name) takes a string", name)),
                        line,
                    ));
                };
                self.lower_goto(label, name == "goto_end", line)?;
                Ok(Some(None))
            }
            "seq" => Err(self.err_at(
                CompileError::syntax("seq(...) is only valid as a for-loop iterator"),
                line,
            )),
            "label" => Err(self.err_at(
                CompileError::syntax("label(name) is only valid as `with label(...)`"),
                line,
            )),
            _ => Ok(None),
        }
    }

    // ---- effects ----------------------------------------------------------

    fn eval_effect_call(
        &mut self,
        path: &[String],
        args: &[Expr],
        line: u32,
    ) -> CompileResult<Option<ValueRef>> {
        let [effect, function] = path else {
            return Err(self.err_at(
                CompileError::name_error("effect calls have the form effect.<name>.<fn>"),
                line,
            ));
        };
        let implementation = self
            .session
            .effects
            .resolve(effect, function)
            .map_err(|e| self.err_at(e, line))?
            .to_string();
        self.session
            .deps
            .record_effect_use(&self.group_key, effect);
        let info = self
            .session
            .functions
            .get(&implementation)
            .cloned()
            .ok_or_else(|| {
                self.err_at(
                    CompileError::name_error(format!(
                        "effect implementation '{}' is not registered",
                        implementation
                    )),
                    line,
                )
            })?;
        self.eval_function_call(&info, args, line)
    }

    // ---- constructors -----------------------------------------------------

    fn eval_enum_constructor(
        &mut self,
        body: &crate::types::EnumBody,
        variant: &str,
        args: &[Expr],
        line: u32,
    ) -> CompileResult<ValueRef> {
        let Some((_, var)) = body.variant(variant) else {
            return Err(self.err_at(
                CompileError::name_error(format!(
                    "enum '{}' has no variant '{}'",
                    body.name, variant
                )),
                line,
            ));
        };
        let tag = var.tag;
        let payload_ty = var.payload.clone();
        match (&payload_ty, args) {
            (None, []) => self.build_enum_value(&body.clone(), tag, None, line),
            (Some(ty), [arg]) => {
                let value = self.eval_expr(arg, line)?;
                self.transfer_if_linear(&value, line)?;
                let ty = ty.clone();
                self.build_enum_value(&body.clone(), tag, Some((&value, &ty)), line)
            }
            _ => Err(self.err_at(
                CompileError::type_error(format!(
                    "variant '{}.{}' takes {} argument{}",
                    body.name,
                    variant,
                    usize::from(payload_ty.is_some()),
                    if payload_ty.is_some() { "" } else { "s" }
                )),
                line,
            )),
        }
    }

    fn eval_struct_constructor(
        &mut self,
        body: &crate::types::StructBody,
        args: &[Expr],
        keywords: &[(String, Expr)],
        line: u32,
    ) -> CompileResult<ValueRef> {
        let struct_ty = Type::Struct(std::rc::Rc::new(body.clone()));
        let struct_ir = struct_ty.ir_type()?;

        // Positional first, then keywords fill the remaining fields
        let mut values: Vec<Option<ValueRef>> = vec![None; body.fields.len()];
        if args.len() > body.fields.len() {
            return Err(self.err_at(
                CompileError::type_error(format!(
                    "struct '{}' has {} fields, got {} positional arguments",
                    body.name,
                    body.fields.len(),
                    args.len()
                )),
                line,
            ));
        }
        for (i, arg) in args.iter().enumerate() {
            values[i] = Some(self.eval_expr(arg, line)?);
        }
        for (key, arg) in keywords {
            let index = body.field_index(key).ok_or_else(|| {
                self.err_at(
                    CompileError::type_error(format!(
                        "struct '{}' has no field '{}'",
                        body.name, key
                    )),
                    line,
                )
            })?;
            if values[index].is_some() {
                return Err(self.err_at(
                    CompileError::type_error(format!("field '{}' given twice", key)),
                    line,
                ));
            }
            values[index] = Some(self.eval_expr(arg, line)?);
        }

        let slot = self.func.alloca(&struct_ir, &body.name.to_lowercase());
        for (index, ((field_name, field_ty), value)) in
            body.fields.iter().zip(values.into_iter()).enumerate()
        {
            let value = value.ok_or_else(|| {
                self.err_at(
                    CompileError::type_error(format!(
                        "struct '{}' is missing field '{}'",
                        body.name, field_name
                    )),
                    line,
                )
            })?;
            self.transfer_if_linear(&value, line)?;
            if field_ty.is_linear() {
                continue;
            }
            let operand = self.materialize(&value, field_ty, line)?;
            let addr = self.func.struct_gep(&struct_ir, &slot, index)?;
            self.func
                .store(&field_ty.ir_type()?, &operand, &addr, Qualifiers::NONE)?;
        }
        Ok(ValueRef::address(slot, struct_ty))
    }

    fn eval_scalar_cast(&mut self, target: Type, args: &[Expr], line: u32) -> CompileResult<ValueRef> {
        let [arg] = args else {
            return Err(self.err_at(
                CompileError::type_error(format!("{}(x) takes one argument", target)),
                line,
            ));
        };
        let value = self.eval_expr(arg, line)?;
        if let Some(constant) = value.constant.clone() {
            return self.promote_constant(&constant, &target, line);
        }
        let source = self.concrete_type_of(&value)?;
        let loaded = self.load_if_address(&value)?;
        let from_ir = source.ir_type()?;
        let to_ir = target.ir_type()?;
        let opcode = match (source.unwrapped(), target.unwrapped()) {
            (a, b) if a == b => return Ok(loaded),
            (Type::Int { width: sw, signed }, Type::Int { width: tw, .. }) => {
                if sw > tw {
                    "trunc"
                } else if *signed {
                    "sext"
                } else {
                    "zext"
                }
            }
            (Type::Int { signed: true, .. }, Type::Float { .. }) => "sitofp",
            (Type::Int { signed: false, .. }, Type::Float { .. }) => "uitofp",
            (Type::Float { .. }, Type::Int { signed: true, .. }) => "fptosi",
            (Type::Float { .. }, Type::Int { signed: false, .. }) => "fptoui",
            (Type::Float { width: 32 }, Type::Float { width: 64 }) => "fpext",
            (Type::Float { width: 64 }, Type::Float { width: 32 }) => "fptrunc",
            (Type::Bool, Type::Int { .. }) => "zext",
            _ => {
                return Err(self.err_at(
                    CompileError::type_error(format!(
                        "no conversion from '{}' to '{}'",
                        source, target
                    )),
                    line,
                ));
            }
        };
        let converted = self.func.cast(opcode, &loaded.ir, &from_ir, &to_ir)?;
        Ok(ValueRef::value(converted, target))
    }

    /// `array[T,N]()` zero-initializes; `ptr[T](x)` is the explicit cast
    /// escape hatch
    fn eval_type_constructor(
        &mut self,
        ty: Type,
        args: &[Expr],
        line: u32,
    ) -> CompileResult<Option<ValueRef>> {
        match ty.unwrapped().clone() {
            Type::Array { .. } => {
                if !args.is_empty() {
                    return Err(self.err_at(
                        CompileError::type_error("array constructors take no arguments"),
                        line,
                    ));
                }
                let ir_ty = ty.ir_type()?;
                let slot = self.func.alloca(&ir_ty, "arr");
                self.func
                    .store(&ir_ty, "zeroinitializer", &slot, Qualifiers::NONE)?;
                Ok(Some(ValueRef::address(slot, ty)))
            }
            Type::Ptr { pointee } => {
                let [arg] = args else {
                    return Err(self.err_at(
                        CompileError::type_error("ptr[T](x) takes one argument"),
                        line,
                    ));
                };
                let value = self.eval_expr(arg, line)?;
                let source = self.concrete_type_of(&value)?;
                let target = Type::ptr_to((*pointee).clone());
                match source.unwrapped() {
                    // Explicit integer-to-pointer cast
                    Type::Int { .. } => {
                        let operand = self.materialize(&value, &Type::I64, line)?;
                        let converted = self.func.cast("inttoptr", &operand, "i64", "ptr")?;
                        Ok(Some(ValueRef::value(converted, target)))
                    }
                    // Pointer reinterpretation is free with opaque pointers
                    Type::Ptr { .. } | Type::FuncPtr { .. } => {
                        let loaded = self.load_if_address(&value)?;
                        Ok(Some(ValueRef::value(loaded.ir, target)))
                    }
                    // Array decay through an explicit cast
                    Type::Array { .. } => {
                        if value.kind != ValueKind::Address {
                            return Err(self.err_at(
                                CompileError::type_error("cannot take a pointer to an array value"),
                                line,
                            ));
                        }
                        Ok(Some(ValueRef::value(value.ir, target)))
                    }
                    other => Err(self.err_at(
                        CompileError::type_error(format!(
                            "ptr[...] cannot cast from '{}'",
                            other
                        )),
                        line,
                    )),
                }
            }
            other => Err(self.err_at(
                CompileError::type_error(format!("'{}' is not constructible", other)),
                line,
            )),
        }
    }

    /// Resolve an expression as a type annotation without reporting errors
    pub(crate) fn try_resolve_type(&mut self, expr: &Expr) -> CompileResult<Type> {
        let mut resolver = TypeResolver::new(&self.session.classes, &mut self.session.type_cache);
        resolver.resolve(expr)
    }

    // ---- function calls ---------------------------------------------------

    pub(crate) fn eval_function_call(
        &mut self,
        info: &FunctionInfo,
        args: &[Expr],
        line: u32,
    ) -> CompileResult<Option<ValueRef>> {
        if info.is_inline {
            return self.splice_inline_call(info, args, line);
        }
        if info
            .def_ast
            .as_ref()
            .is_some_and(|def| def.is_generator())
        {
            return Err(self.err_at(
                CompileError::syntax(format!(
                    "generator '{}' can only be driven by a for loop",
                    info.qualified_name
                )),
                line,
            ));
        }
        if args.len() != info.param_types.len() && !(info.is_extern && info_is_vararg(info)) {
            return Err(self.err_at(
                CompileError::overload(format!(
                    "'{}' takes {} argument{}, got {}",
                    info.qualified_name,
                    info.param_types.len(),
                    if info.param_types.len() == 1 { "" } else { "s" },
                    args.len()
                )),
                line,
            ));
        }
        if info.is_extern && args.len() < info.param_types.len() {
            return Err(self.err_at(
                CompileError::overload(format!(
                    "'{}' needs at least {} arguments",
                    info.qualified_name,
                    info.param_types.len()
                )),
                line,
            ));
        }

        // Effect-suffix propagation: under an active suffix, a callee that
        // transitively reaches an overridden effect is retargeted to a
        // specialization compiled into this group
        let target_mangled = self.specialized_target(info)?;

        let mut lowered_args: Vec<(String, Type)> = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            let value = self.eval_expr(arg, line)?;
            self.check_readable(&value, line)?;
            match info.param_types.get(i) {
                Some(param_ty) => {
                    // Passing a linear argument transfers ownership to the
                    // callee
                    self.transfer_if_linear(&value, line)?;
                    if param_ty.is_linear() {
                        continue;
                    }
                    let operand = self.materialize(&value, param_ty, line)?;
                    lowered_args.push((operand, param_ty.unwrapped().clone()));
                }
                None => {
                    // Vararg tail: C default promotions happen in the
                    // builder
                    let ty = self.concrete_type_of(&value)?;
                    let operand = self.materialize(&value, &ty, line)?;
                    lowered_args.push((operand, ty));
                }
            }
        }

        self.record_call_dep(info, &target_mangled);
        // A retargeted specialization is defined later in this same module,
        // so it must not also be declared
        let is_specialized = target_mangled != info.mangled_name;
        if !is_specialized && (info.group_key != self.group_key || info.is_extern) {
            self.declare_callee_info(info, &target_mangled)?;
        }

        let fixed = info
            .param_types
            .iter()
            .filter(|t| !t.is_linear())
            .count();
        let callee = format!("@{}", target_mangled);
        let result = self.func.call(
            &callee,
            &lowered_args,
            fixed,
            info.is_extern && info_is_vararg(info),
            &info.return_type,
        )?;
        match result {
            Some(operand) => Ok(Some(ValueRef::value(operand, info.return_type.clone()))),
            None if info.return_type.is_linear() => {
                // A returned token materializes as a fresh active value
                Ok(Some(ValueRef::value("zeroinitializer", Type::Linear)))
            }
            None => Ok(None),
        }
    }

    fn emit_indirect_call(
        &mut self,
        callee_operand: &str,
        params: &[Type],
        ret: &Type,
        args: &[Expr],
        line: u32,
    ) -> CompileResult<Option<ValueRef>> {
        if args.len() != params.len() {
            return Err(self.err_at(
                CompileError::overload(format!(
                    "function pointer takes {} arguments, got {}",
                    params.len(),
                    args.len()
                )),
                line,
            ));
        }
        let mut lowered: Vec<(String, Type)> = Vec::new();
        for (arg, param_ty) in args.iter().zip(params.iter()) {
            let value = self.eval_expr(arg, line)?;
            self.transfer_if_linear(&value, line)?;
            if param_ty.is_linear() {
                continue;
            }
            let operand = self.materialize(&value, param_ty, line)?;
            lowered.push((operand, param_ty.unwrapped().clone()));
        }
        let result = self
            .func
            .call(callee_operand, &lowered, lowered.len(), false, ret)?;
        Ok(result.map(|operand| ValueRef::value(operand, ret.clone())))
    }

    /// Pick the call target under the active effect suffix, registering
    /// and queueing the specialization when needed
    fn specialized_target(&mut self, info: &FunctionInfo) -> CompileResult<String> {
        let Some(suffix) = self.effect_context.suffix.clone() else {
            return Ok(info.mangled_name.clone());
        };
        if info.is_extern || info.group_key.effect_suffix.as_deref() == Some(suffix.as_str()) {
            return Ok(info.mangled_name.clone());
        }
        let overridden: std::collections::HashSet<String> =
            self.effect_context.overrides.keys().cloned().collect();
        if overridden.is_empty()
            || !reaches_overridden_effect(&info.qualified_name, &overridden, &self.session.functions)
        {
            return Ok(info.mangled_name.clone());
        }

        let base_name = info
            .qualified_name
            .rsplit_once('.')
            .map(|(_, n)| n)
            .unwrap_or(&info.qualified_name);
        let mangled = mangle(
            base_name,
            info.group_key.compile_suffix.as_deref(),
            Some(&suffix),
        );
        let spec_qualified = format!("{}${}", info.qualified_name, suffix);
        if !self.session.functions.contains(&spec_qualified) {
            let mut spec = info.clone();
            spec.qualified_name = spec_qualified.clone();
            spec.mangled_name = mangled.clone();
            spec.group_key = self.group_key.clone();
            spec.shared_lib_path = None;
            self.session.functions.register(spec)?;
            self.session
                .function_contexts
                .insert(spec_qualified.clone(), self.effect_context.clone());
        }
        let pending = super::PendingSpecialization {
            qualified_name: spec_qualified,
            context: self.effect_context.clone(),
        };
        if !self.pending_specializations.contains(&pending) {
            self.pending_specializations.push(pending);
        }
        Ok(mangled)
    }

    fn record_call_dep(&mut self, info: &FunctionInfo, target_mangled: &str) {
        let caller = self
            .session
            .functions
            .get(&self.qualified_name)
            .map(|f| f.mangled_name.clone())
            .unwrap_or_else(|| self.qualified_name.clone());
        let dep = CallableDep {
            name: target_mangled.to_string(),
            group_key: if info.is_extern {
                None
            } else if target_mangled == info.mangled_name {
                Some(info.group_key.clone())
            } else {
                Some(self.group_key.clone())
            },
            extern_: info.is_extern,
            link_libraries: info.link_libraries.clone(),
            link_objects: info.link_objects.clone(),
        };
        self.session.deps.record_call(&self.group_key, &caller, dep);
    }

    /// Emit a `declare` for a callee defined outside this module
    fn declare_callee_info(&mut self, info: &FunctionInfo, mangled: &str) -> CompileResult<()> {
        let param_irs: CompileResult<Vec<String>> = info
            .param_types
            .iter()
            .filter(|t| !t.is_linear())
            .map(|t| t.ir_type())
            .collect();
        self.module_ir.declare_function(
            mangled,
            &info.return_type.ir_type()?,
            &param_irs?,
            info.is_extern && info_is_vararg(info),
        );
        Ok(())
    }

    /// Declaration for a function referenced by name (function-pointer use)
    pub(crate) fn declare_callee(&mut self, mangled: &str) -> CompileResult<()> {
        if let Some(info) = self.session.functions.get_by_mangled(mangled).cloned() {
            if info.group_key != self.group_key || info.is_extern {
                self.declare_callee_info(&info, mangled)?;
            }
        }
        Ok(())
    }

    /// Splice an `@inline` callee at this call site. The expansion is
    /// lowered like hand-written statements, so the CFG and linear checker
    /// see identical semantics to an out-of-line call.
    fn splice_inline_call(
        &mut self,
        info: &FunctionInfo,
        args: &[Expr],
        line: u32,
    ) -> CompileResult<Option<ValueRef>> {
        let def = info.def_ast.clone().ok_or_else(|| {
            self.err_at(
                CompileError::build(format!("inline '{}' has no body", info.qualified_name)),
                line,
            )
        })?;
        check_inlinable(&def, InlineMode::Inline).map_err(|e| self.err_at(e, line))?;

        let has_result = !info.return_type.is_void();
        let n = self.inline_counter;
        let result_var = has_result.then(|| format!("__inl_ret{}", n));
        let flag_var = format!("__inl_flag{}", n);
        self.inline_counter += 1;

        let expansion = expand(
            &def,
            ExitRule::Return { result_var: result_var.clone(), flag_var },
            &mut self.inline_counter,
        )
        .map_err(|e| self.err_at(e, line))?;

        // Bind evaluated arguments to the renamed parameters
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
        for (binding, (arg, param_ty)) in expansion
            .param_bindings
            .iter()
            .zip(args.iter().zip(info.param_types.iter()))
        {
            let value = self.eval_expr(arg, line)?;
            self.check_readable(&value, line)?;
            self.declare_local(&binding.fresh_name, param_ty.clone(), Some(value), line)?;
        }

        // Module-level names in the splice resolve against the callee's
        // module for the duration of the body
        let saved_file = std::mem::replace(&mut self.current_file, info.source_file.clone());
        let lowered = (|| -> CompileResult<()> {
            self.lower_stmts(&expansion.prelude)?;
            self.lower_stmts(&expansion.body)
        })();
        self.current_file = saved_file;
        lowered?;

        match expansion.result_var {
            Some(result) => {
                let value = self.eval_expr(&Expr::Name(result), line)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

fn info_is_vararg(info: &FunctionInfo) -> bool {
    info.def_ast.as_ref().is_some_and(|d| d.vararg)
}
