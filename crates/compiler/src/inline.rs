//! Universal inline kernel
//!
//! One engine serves `@inline` calls, yield-generator inlining into `for`
//! loops, and closure materialization. Input: the callee's AST, the names
//! visible at the call site, and an exit-point rule. Output: a statement
//! list the visitor splices and then lowers normally, so the CFG and the
//! linear checker see exactly what hand-written code would produce.
//!
//! Locals are renamed to fresh identifiers; captured names are left alone
//! and resolve in the caller's scope. Exits rewrite through the rule:
//!
//! - return: `return e` -> `result = move(e); flag = True; break`, body
//!   wrapped in `while True` so nested loops short-circuit consistently
//! - yield: `yield e` -> `loop_var = move(e); <caller loop body>`, with
//!   break/continue in the caller body rewritten through a one-iteration
//!   guard loop
//! - macro: `return e` -> `e` as an expression statement

use crate::ast::{Constant, Expr, FunctionDef, Stmt, StmtKind, UnaryOp};
use crate::error::{CompileError, CompileResult};
use std::collections::{HashMap, HashSet};

/// Why a function may not be inlined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineMode {
    /// `@inline` function call
    Inline,
    /// Generator driven by a `for` loop
    Yield,
    /// Compile-time macro splice
    Macro,
}

/// Exit-point rule selected by the caller
#[derive(Debug, Clone)]
pub enum ExitRule {
    Return {
        /// Receives the returned value; absent for void callees
        result_var: Option<String>,
        flag_var: String,
    },
    Yield {
        loop_var: String,
        /// Caller's loop body, spliced at every yield site
        loop_body: Vec<Stmt>,
        /// Present when the caller body contains break/continue
        break_flag: Option<String>,
    },
    Macro,
}

/// Result of expanding one call site
#[derive(Debug)]
pub struct InlineExpansion {
    /// Fresh names for the callee parameters, in declaration order. The
    /// visitor binds the already-evaluated argument values to these names
    /// before lowering `body`.
    pub param_bindings: Vec<ParamBinding>,
    /// Declarations the splice needs (result and flag variables)
    pub prelude: Vec<Stmt>,
    pub body: Vec<Stmt>,
    /// Name holding the call result, for `Return` rules with a value
    pub result_var: Option<String>,
    /// Callee's source file, so module-level names in the spliced body
    /// resolve against the callee's module while it is being lowered
    pub callee_file: std::path::PathBuf,
}

pub struct ParamBinding {
    pub fresh_name: String,
    pub original_name: String,
    pub annotation: Expr,
}

impl std::fmt::Debug for ParamBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} as {}", self.original_name, self.fresh_name)
    }
}

/// Enforce the inlinability filter. There is no out-of-line fallback: a
/// construct that must inline but cannot is a hard error.
pub fn check_inlinable(def: &FunctionDef, mode: InlineMode) -> CompileResult<()> {
    if crate::effects::called_names(def).contains(&def.name) {
        return Err(CompileError::syntax(format!(
            "'{}' is recursive and cannot be inlined",
            def.name
        )));
    }
    if body_contains_lambda(&def.body) {
        return Err(CompileError::syntax(format!(
            "'{}' contains a lambda and cannot be inlined",
            def.name
        )));
    }
    match mode {
        InlineMode::Inline | InlineMode::Macro => {
            if def.is_generator() {
                return Err(CompileError::syntax(format!(
                    "'{}' yields; call it from a for loop instead",
                    def.name
                )));
            }
        }
        InlineMode::Yield => {
            if !def.is_generator() {
                return Err(CompileError::syntax(format!(
                    "'{}' never yields and cannot drive a for loop",
                    def.name
                )));
            }
            if returns_value(&def.body) {
                return Err(CompileError::syntax(format!(
                    "generator '{}' must not return a value",
                    def.name
                )));
            }
        }
    }
    Ok(())
}

fn body_contains_lambda(stmts: &[Stmt]) -> bool {
    fn expr_has_lambda(expr: &Expr) -> bool {
        match expr {
            Expr::Lambda { .. } => true,
            Expr::BinOp { left, right, .. } => expr_has_lambda(left) || expr_has_lambda(right),
            Expr::UnaryOp { operand, .. } => expr_has_lambda(operand),
            Expr::BoolOp { values, .. } => values.iter().any(expr_has_lambda),
            Expr::Compare { left, comparators, .. } => {
                expr_has_lambda(left) || comparators.iter().any(expr_has_lambda)
            }
            Expr::Call { func, args, keywords } => {
                expr_has_lambda(func)
                    || args.iter().any(expr_has_lambda)
                    || keywords.iter().any(|(_, v)| expr_has_lambda(v))
            }
            Expr::Subscript { value, index } => expr_has_lambda(value) || expr_has_lambda(index),
            Expr::Attribute { value, .. } => expr_has_lambda(value),
            Expr::Tuple(parts) | Expr::List(parts) => parts.iter().any(expr_has_lambda),
            Expr::Yield { value: Some(v) } => expr_has_lambda(v),
            Expr::IfExp { test, body, orelse } => {
                expr_has_lambda(test) || expr_has_lambda(body) || expr_has_lambda(orelse)
            }
            _ => false,
        }
    }
    walk_any(stmts, &mut |stmt| match &stmt.kind {
        StmtKind::Assign { targets, value } => {
            targets.iter().any(expr_has_lambda) || expr_has_lambda(value)
        }
        StmtKind::AnnAssign { value, .. } => value.as_ref().is_some_and(expr_has_lambda),
        StmtKind::AugAssign { target, value, .. } => {
            expr_has_lambda(target) || expr_has_lambda(value)
        }
        StmtKind::If { test, .. } | StmtKind::While { test, .. } => expr_has_lambda(test),
        StmtKind::For { iter, .. } => expr_has_lambda(iter),
        StmtKind::Return { value } => value.as_ref().is_some_and(expr_has_lambda),
        StmtKind::Expr { value } => expr_has_lambda(value),
        _ => false,
    })
}

fn returns_value(stmts: &[Stmt]) -> bool {
    walk_any(stmts, &mut |stmt| {
        matches!(&stmt.kind, StmtKind::Return { value: Some(_) })
    })
}

/// Depth-first statement predicate walk
fn walk_any(stmts: &[Stmt], pred: &mut impl FnMut(&Stmt) -> bool) -> bool {
    for stmt in stmts {
        if pred(stmt) {
            return true;
        }
        let nested: Vec<&Vec<Stmt>> = match &stmt.kind {
            StmtKind::If { body, orelse, .. } => vec![body, orelse],
            StmtKind::While { body, .. } | StmtKind::For { body, .. } => vec![body],
            StmtKind::With { body, .. } => vec![body],
            StmtKind::Try { body, finalbody } => vec![body, finalbody],
            StmtKind::Match { cases, .. } => cases.iter().map(|c| &c.body).collect(),
            _ => vec![],
        };
        for block in nested {
            if walk_any(block, pred) {
                return true;
            }
        }
    }
    false
}

/// Partition of names referenced by a callee body
#[derive(Debug, Default)]
pub struct ScopeAnalysis {
    pub locals: HashSet<String>,
    pub captured: HashSet<String>,
}

/// Classify every name in the body: assignment/loop/with targets are
/// locals, parameters are handled separately, and any other referenced
/// name is captured from the caller scope.
pub fn analyze_scope(def: &FunctionDef) -> ScopeAnalysis {
    let mut analysis = ScopeAnalysis::default();
    let params: HashSet<&str> = def.params.iter().map(|p| p.name.as_str()).collect();
    collect_locals(&def.body, &mut analysis.locals);
    let mut referenced = HashSet::new();
    collect_names(&def.body, &mut referenced);
    for name in referenced {
        if !analysis.locals.contains(&name) && !params.contains(name.as_str()) {
            analysis.captured.insert(name);
        }
    }
    analysis
}

fn collect_target_names(expr: &Expr, out: &mut HashSet<String>) {
    match expr {
        Expr::Name(n) => {
            out.insert(n.clone());
        }
        Expr::Tuple(parts) => parts.iter().for_each(|p| collect_target_names(p, out)),
        // Subscript/attribute targets mutate existing storage, they do not
        // bind a new local
        _ => {}
    }
}

fn collect_locals(stmts: &[Stmt], out: &mut HashSet<String>) {
    walk_any(stmts, &mut |stmt| {
        match &stmt.kind {
            StmtKind::Assign { targets, .. } => {
                targets.iter().for_each(|t| collect_target_names(t, out));
            }
            StmtKind::AnnAssign { target, .. } => collect_target_names(target, out),
            StmtKind::For { target, .. } => collect_target_names(target, out),
            StmtKind::With { target: Some(name), .. } => {
                out.insert(name.clone());
            }
            _ => {}
        }
        false
    });
}

fn collect_names(stmts: &[Stmt], out: &mut HashSet<String>) {
    fn expr_names(expr: &Expr, out: &mut HashSet<String>) {
        match expr {
            Expr::Name(n) => {
                out.insert(n.clone());
            }
            Expr::BinOp { left, right, .. } => {
                expr_names(left, out);
                expr_names(right, out);
            }
            Expr::UnaryOp { operand, .. } => expr_names(operand, out),
            Expr::BoolOp { values, .. } => values.iter().for_each(|v| expr_names(v, out)),
            Expr::Compare { left, comparators, .. } => {
                expr_names(left, out);
                comparators.iter().for_each(|c| expr_names(c, out));
            }
            Expr::Call { func, args, keywords } => {
                expr_names(func, out);
                args.iter().for_each(|a| expr_names(a, out));
                keywords.iter().for_each(|(_, v)| expr_names(v, out));
            }
            Expr::Subscript { value, index } => {
                expr_names(value, out);
                expr_names(index, out);
            }
            Expr::Attribute { value, .. } => expr_names(value, out),
            Expr::Tuple(parts) | Expr::List(parts) => {
                parts.iter().for_each(|p| expr_names(p, out));
            }
            Expr::Yield { value: Some(v) } => expr_names(v, out),
            Expr::IfExp { test, body, orelse } => {
                expr_names(test, out);
                expr_names(body, out);
                expr_names(orelse, out);
            }
            _ => {}
        }
    }
    walk_any(stmts, &mut |stmt| {
        match &stmt.kind {
            StmtKind::Assign { targets, value } => {
                targets.iter().for_each(|t| expr_names(t, out));
                expr_names(value, out);
            }
            StmtKind::AnnAssign { target, value, .. } => {
                expr_names(target, out);
                if let Some(v) = value {
                    expr_names(v, out);
                }
            }
            StmtKind::AugAssign { target, value, .. } => {
                expr_names(target, out);
                expr_names(value, out);
            }
            StmtKind::If { test, .. } | StmtKind::While { test, .. } => expr_names(test, out),
            StmtKind::For { target, iter, .. } => {
                expr_names(target, out);
                expr_names(iter, out);
            }
            StmtKind::Match { subject, cases } => {
                expr_names(subject, out);
                for case in cases {
                    if let Some(g) = &case.guard {
                        expr_names(g, out);
                    }
                }
            }
            StmtKind::With { context, .. } => expr_names(context, out),
            StmtKind::Return { value: Some(v) } => expr_names(v, out),
            StmtKind::Expr { value } => expr_names(value, out),
            _ => {}
        }
        false
    });
}

/// Expand a call to `def` at one call site.
///
/// `counter` is the visitor's per-function inline counter; each expansion
/// consumes a range of it so fresh names never collide.
pub fn expand(
    def: &FunctionDef,
    rule: ExitRule,
    counter: &mut u32,
) -> CompileResult<InlineExpansion> {
    let analysis = analyze_scope(def);
    let mut rename: HashMap<String, String> = HashMap::new();
    let mut fresh = |name: &str, counter: &mut u32| {
        let fresh_name = format!("{}__inl{}", name, *counter);
        *counter += 1;
        fresh_name
    };

    let mut param_bindings = Vec::with_capacity(def.params.len());
    for param in &def.params {
        let fresh_name = fresh(&param.name, counter);
        rename.insert(param.name.clone(), fresh_name.clone());
        param_bindings.push(ParamBinding {
            fresh_name,
            original_name: param.name.clone(),
            annotation: param.annotation.clone(),
        });
    }
    let mut locals: Vec<&String> = analysis.locals.iter().collect();
    locals.sort();
    for local in locals {
        rename.insert(local.clone(), fresh(local, counter));
    }

    let mut prelude = Vec::new();
    let mut result_var = None;
    match &rule {
        ExitRule::Return { result_var: result, flag_var } => {
            if let Some(result) = result {
                result_var = Some(result.clone());
                if let Some(returns) = &def.returns {
                    prelude.push(Stmt::new(
                        1,
                        StmtKind::AnnAssign {
                            target: Expr::name(result.clone()),
                            annotation: returns.clone(),
                            value: None,
                        },
                    ));
                }
            }
            prelude.push(Stmt::new(
                1,
                StmtKind::AnnAssign {
                    target: Expr::name(flag_var.clone()),
                    annotation: Expr::name("bool"),
                    value: Some(Expr::Constant(Constant::Bool(false))),
                },
            ));
        }
        ExitRule::Yield { break_flag: Some(flag), .. } => {
            prelude.push(Stmt::new(
                1,
                StmtKind::AnnAssign {
                    target: Expr::name(flag.clone()),
                    annotation: Expr::name("bool"),
                    value: Some(Expr::Constant(Constant::Bool(false))),
                },
            ));
        }
        _ => {}
    }

    let mut transformed = transform_stmts(&def.body, &rename, &rule)?;
    let body = match &rule {
        ExitRule::Return { flag_var, .. } => {
            // while True: body; break - so every return path exits through
            // one break and nested loops re-check the flag
            insert_flag_checks(&mut transformed, flag_var);
            transformed.push(Stmt::new(1, StmtKind::Break));
            vec![Stmt::new(
                1,
                StmtKind::While {
                    test: Expr::Constant(Constant::Bool(true)),
                    body: transformed,
                },
            )]
        }
        ExitRule::Yield { break_flag, .. } => {
            if let Some(flag) = break_flag {
                insert_flag_checks(&mut transformed, flag);
            }
            transformed
        }
        ExitRule::Macro => transformed,
    };

    Ok(InlineExpansion {
        param_bindings,
        prelude,
        body,
        result_var,
        callee_file: std::path::PathBuf::new(),
    })
}

/// After every loop, re-check the exit flag so a return or break inside a
/// nested loop unwinds the whole splice
fn insert_flag_checks(stmts: &mut Vec<Stmt>, flag: &str) {
    let mut i = 0;
    while i < stmts.len() {
        match &mut stmts[i].kind {
            StmtKind::While { body, .. } | StmtKind::For { body, .. } => {
                insert_flag_checks(body, flag);
                let line = stmts[i].line;
                stmts.insert(
                    i + 1,
                    Stmt::new(
                        line,
                        StmtKind::If {
                            test: Expr::name(flag),
                            body: vec![Stmt::new(line, StmtKind::Break)],
                            orelse: vec![],
                        },
                    ),
                );
                i += 2;
            }
            StmtKind::If { body, orelse, .. } => {
                insert_flag_checks(body, flag);
                insert_flag_checks(orelse, flag);
                i += 1;
            }
            StmtKind::Match { cases, .. } => {
                for case in cases.iter_mut() {
                    insert_flag_checks(&mut case.body, flag);
                }
                i += 1;
            }
            StmtKind::With { body, .. } => {
                insert_flag_checks(body, flag);
                i += 1;
            }
            _ => i += 1,
        }
    }
}

fn transform_stmts(
    stmts: &[Stmt],
    rename: &HashMap<String, String>,
    rule: &ExitRule,
) -> CompileResult<Vec<Stmt>> {
    let mut out = Vec::with_capacity(stmts.len());
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::Return { value } => {
                out.extend(transform_return(stmt.line, value.as_ref(), rename, rule)?);
            }
            StmtKind::Expr { value: Expr::Yield { value } } => {
                out.extend(transform_yield(
                    stmt.line,
                    value.as_deref(),
                    rename,
                    rule,
                )?);
            }
            other => out.push(Stmt::new(stmt.line, rewrite_stmt_kind(other, rename, rule)?)),
        }
    }
    Ok(out)
}

fn transform_return(
    line: u32,
    value: Option<&Expr>,
    rename: &HashMap<String, String>,
    rule: &ExitRule,
) -> CompileResult<Vec<Stmt>> {
    match rule {
        ExitRule::Return { result_var, flag_var } => {
            let mut out = Vec::new();
            match (result_var, value) {
                (Some(result), Some(value)) => {
                    // result = move(e): the move keeps linear transfers legal
                    out.push(Stmt::new(
                        line,
                        StmtKind::Assign {
                            targets: vec![Expr::name(result.clone())],
                            value: Expr::call(
                                Expr::name("move"),
                                vec![rewrite_expr(value, rename)],
                            ),
                        },
                    ));
                }
                (None, Some(value)) => {
                    // Returned value is discarded; still evaluate it
                    out.push(Stmt::new(
                        line,
                        StmtKind::Expr { value: rewrite_expr(value, rename) },
                    ));
                }
                _ => {}
            }
            out.push(Stmt::new(
                line,
                StmtKind::Assign {
                    targets: vec![Expr::name(flag_var.clone())],
                    value: Expr::Constant(Constant::Bool(true)),
                },
            ));
            out.push(Stmt::new(line, StmtKind::Break));
            Ok(out)
        }
        ExitRule::Yield { .. } => {
            // Filter guarantees generators only have bare returns: exit the
            // iteration entirely through the break flag machinery
            Ok(vec![Stmt::new(line, StmtKind::Break)])
        }
        ExitRule::Macro => match value {
            Some(value) => Ok(vec![Stmt::new(
                line,
                StmtKind::Expr { value: rewrite_expr(value, rename) },
            )]),
            None => Ok(vec![]),
        },
    }
}

fn transform_yield(
    line: u32,
    value: Option<&Expr>,
    rename: &HashMap<String, String>,
    rule: &ExitRule,
) -> CompileResult<Vec<Stmt>> {
    let ExitRule::Yield { loop_var, loop_body, break_flag } = rule else {
        return Err(CompileError::syntax("yield outside a generator body"));
    };
    let value = value.ok_or_else(|| CompileError::syntax("yield needs a value"))?;
    let mut iteration = vec![Stmt::new(
        line,
        StmtKind::Assign {
            targets: vec![Expr::name(loop_var.clone())],
            value: Expr::call(Expr::name("move"), vec![rewrite_expr(value, rename)]),
        },
    )];
    iteration.extend(loop_body.iter().cloned());
    match break_flag {
        Some(flag) => {
            // Single-iteration guard loop so break/continue in the caller
            // body have a loop to land on
            iteration.push(Stmt::new(line, StmtKind::Break));
            Ok(vec![Stmt::new(
                line,
                StmtKind::While {
                    test: Expr::UnaryOp {
                        op: UnaryOp::Not,
                        operand: Box::new(Expr::name(flag.clone())),
                    },
                    body: iteration,
                },
            )])
        }
        None => Ok(iteration),
    }
}

fn rewrite_stmt_kind(
    kind: &StmtKind,
    rename: &HashMap<String, String>,
    rule: &ExitRule,
) -> CompileResult<StmtKind> {
    let kind = match kind {
        StmtKind::Assign { targets, value } => StmtKind::Assign {
            targets: targets.iter().map(|t| rewrite_expr(t, rename)).collect(),
            value: rewrite_expr(value, rename),
        },
        StmtKind::AnnAssign { target, annotation, value } => StmtKind::AnnAssign {
            target: rewrite_expr(target, rename),
            annotation: annotation.clone(),
            value: value.as_ref().map(|v| rewrite_expr(v, rename)),
        },
        StmtKind::AugAssign { target, op, value } => StmtKind::AugAssign {
            target: rewrite_expr(target, rename),
            op: *op,
            value: rewrite_expr(value, rename),
        },
        StmtKind::If { test, body, orelse } => StmtKind::If {
            test: rewrite_expr(test, rename),
            body: transform_stmts(body, rename, rule)?,
            orelse: transform_stmts(orelse, rename, rule)?,
        },
        StmtKind::While { test, body } => StmtKind::While {
            test: rewrite_expr(test, rename),
            body: transform_stmts(body, rename, rule)?,
        },
        StmtKind::For { target, iter, body } => StmtKind::For {
            target: rewrite_expr(target, rename),
            iter: rewrite_expr(iter, rename),
            body: transform_stmts(body, rename, rule)?,
        },
        StmtKind::Match { subject, cases } => StmtKind::Match {
            subject: rewrite_expr(subject, rename),
            cases: cases
                .iter()
                .map(|c| {
                    Ok(crate::ast::MatchCase {
                        pattern: c.pattern.clone(),
                        guard: c.guard.as_ref().map(|g| rewrite_expr(g, rename)),
                        body: transform_stmts(&c.body, rename, rule)?,
                    })
                })
                .collect::<CompileResult<Vec<_>>>()?,
        },
        StmtKind::With { context, target, body } => StmtKind::With {
            context: rewrite_expr(context, rename),
            target: target
                .as_ref()
                .map(|t| rename.get(t).cloned().unwrap_or_else(|| t.clone())),
            body: transform_stmts(body, rename, rule)?,
        },
        StmtKind::Try { body, finalbody } => StmtKind::Try {
            body: transform_stmts(body, rename, rule)?,
            finalbody: transform_stmts(finalbody, rename, rule)?,
        },
        StmtKind::Expr { value } => StmtKind::Expr { value: rewrite_expr(value, rename) },
        StmtKind::Break => StmtKind::Break,
        StmtKind::Continue => StmtKind::Continue,
        StmtKind::Pass => StmtKind::Pass,
        StmtKind::Return { .. } => {
            unreachable!("returns are handled by transform_stmts")
        }
    };
    Ok(kind)
}

fn rewrite_expr(expr: &Expr, rename: &HashMap<String, String>) -> Expr {
    match expr {
        Expr::Name(n) => match rename.get(n) {
            Some(fresh) => Expr::Name(fresh.clone()),
            None => expr.clone(),
        },
        Expr::BinOp { left, op, right } => Expr::BinOp {
            left: Box::new(rewrite_expr(left, rename)),
            op: *op,
            right: Box::new(rewrite_expr(right, rename)),
        },
        Expr::UnaryOp { op, operand } => Expr::UnaryOp {
            op: *op,
            operand: Box::new(rewrite_expr(operand, rename)),
        },
        Expr::BoolOp { op, values } => Expr::BoolOp {
            op: *op,
            values: values.iter().map(|v| rewrite_expr(v, rename)).collect(),
        },
        Expr::Compare { left, ops, comparators } => Expr::Compare {
            left: Box::new(rewrite_expr(left, rename)),
            ops: ops.clone(),
            comparators: comparators.iter().map(|c| rewrite_expr(c, rename)).collect(),
        },
        Expr::Call { func, args, keywords } => Expr::Call {
            func: Box::new(rewrite_expr(func, rename)),
            args: args.iter().map(|a| rewrite_expr(a, rename)).collect(),
            keywords: keywords
                .iter()
                .map(|(k, v)| (k.clone(), rewrite_expr(v, rename)))
                .collect(),
        },
        Expr::Subscript { value, index } => Expr::Subscript {
            value: Box::new(rewrite_expr(value, rename)),
            index: Box::new(rewrite_expr(index, rename)),
        },
        Expr::Attribute { value, attr } => Expr::Attribute {
            value: Box::new(rewrite_expr(value, rename)),
            attr: attr.clone(),
        },
        Expr::Tuple(parts) => Expr::Tuple(parts.iter().map(|p| rewrite_expr(p, rename)).collect()),
        Expr::List(parts) => Expr::List(parts.iter().map(|p| rewrite_expr(p, rename)).collect()),
        Expr::Yield { value } => Expr::Yield {
            value: value.as_ref().map(|v| Box::new(rewrite_expr(v, rename))),
        },
        Expr::IfExp { test, body, orelse } => Expr::IfExp {
            test: Box::new(rewrite_expr(test, rename)),
            body: Box::new(rewrite_expr(body, rename)),
            orelse: Box::new(rewrite_expr(orelse, rename)),
        },
        Expr::Lambda { .. } | Expr::Constant(_) => expr.clone(),
    }
}

/// Rewrite break/continue in a caller loop body before it is spliced at
/// yield sites: break sets the break flag then leaves the guard loop;
/// continue just leaves the guard loop (one iteration done). Nested loops
/// inside the body keep their own break/continue.
pub fn rewrite_loop_controls(body: &[Stmt], break_flag: &str) -> Vec<Stmt> {
    let mut out = Vec::with_capacity(body.len());
    for stmt in body {
        let kind = match &stmt.kind {
            StmtKind::Break => {
                out.push(Stmt::new(
                    stmt.line,
                    StmtKind::Assign {
                        targets: vec![Expr::name(break_flag)],
                        value: Expr::Constant(Constant::Bool(true)),
                    },
                ));
                StmtKind::Break
            }
            StmtKind::Continue => StmtKind::Break,
            StmtKind::If { test, body, orelse } => StmtKind::If {
                test: test.clone(),
                body: rewrite_loop_controls(body, break_flag),
                orelse: rewrite_loop_controls(orelse, break_flag),
            },
            StmtKind::Match { subject, cases } => StmtKind::Match {
                subject: subject.clone(),
                cases: cases
                    .iter()
                    .map(|c| crate::ast::MatchCase {
                        pattern: c.pattern.clone(),
                        guard: c.guard.clone(),
                        body: rewrite_loop_controls(&c.body, break_flag),
                    })
                    .collect(),
            },
            // A nested loop owns its break/continue
            other => other.clone(),
        };
        out.push(Stmt::new(stmt.line, kind));
    }
    out
}

/// True when any statement is a break/continue that would escape the body
pub fn has_loop_controls(body: &[Stmt]) -> bool {
    fn check(stmts: &[Stmt]) -> bool {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::Break | StmtKind::Continue => return true,
                StmtKind::If { body, orelse, .. } => {
                    if check(body) || check(orelse) {
                        return true;
                    }
                }
                StmtKind::Match { cases, .. } => {
                    if cases.iter().any(|c| check(&c.body)) {
                        return true;
                    }
                }
                StmtKind::With { body, .. } | StmtKind::Try { body, .. } => {
                    if check(body) {
                        return true;
                    }
                }
                // While/For own their controls
                _ => {}
            }
        }
        false
    }
    check(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FunctionKind, Param};

    fn adder() -> FunctionDef {
        // def adder(a: i32, b: i32) -> i32:
        //     total = a + b
        //     return total
        FunctionDef {
            name: "adder".to_string(),
            kind: FunctionKind::Inline,
            params: vec![
                Param { name: "a".to_string(), annotation: Expr::name("i32") },
                Param { name: "b".to_string(), annotation: Expr::name("i32") },
            ],
            returns: Some(Expr::name("i32")),
            vararg: false,
            body: vec![
                Stmt::new(
                    1,
                    StmtKind::Assign {
                        targets: vec![Expr::name("total")],
                        value: Expr::binop(
                            Expr::name("a"),
                            crate::ast::BinOp::Add,
                            Expr::name("b"),
                        ),
                    },
                ),
                Stmt::new(2, StmtKind::Return { value: Some(Expr::name("total")) }),
            ],
            start_line: 10,
        }
    }

    fn r#gen() -> FunctionDef {
        // def gen() -> i32:
        //     for i in seq(0, 10): yield i
        FunctionDef {
            name: "gen".to_string(),
            kind: FunctionKind::Compile { suffix: None },
            params: vec![],
            returns: Some(Expr::name("i32")),
            vararg: false,
            body: vec![Stmt::new(
                1,
                StmtKind::For {
                    target: Expr::name("i"),
                    iter: Expr::call(Expr::name("seq"), vec![Expr::int(0), Expr::int(10)]),
                    body: vec![Stmt::new(
                        2,
                        StmtKind::Expr {
                            value: Expr::Yield { value: Some(Box::new(Expr::name("i"))) },
                        },
                    )],
                },
            )],
            start_line: 1,
        }
    }

    #[test]
    fn test_scope_analysis_partitions() {
        let def = adder();
        let analysis = analyze_scope(&def);
        assert!(analysis.locals.contains("total"));
        assert!(!analysis.captured.contains("a"));
        assert!(!analysis.captured.contains("total"));
    }

    #[test]
    fn test_captured_names_stay_in_caller_scope() {
        let mut def = adder();
        def.body.insert(
            0,
            Stmt::new(
                1,
                StmtKind::Expr {
                    value: Expr::call(Expr::name("log_call"), vec![Expr::name("outer")]),
                },
            ),
        );
        let analysis = analyze_scope(&def);
        assert!(analysis.captured.contains("outer"));
        assert!(analysis.captured.contains("log_call"));
    }

    #[test]
    fn test_return_expansion_shape() {
        let def = adder();
        let mut counter = 0;
        let expansion = expand(
            &def,
            ExitRule::Return {
                result_var: Some("__ret0".to_string()),
                flag_var: "__flag0".to_string(),
            },
            &mut counter,
        )
        .unwrap();

        assert_eq!(expansion.param_bindings.len(), 2);
        assert!(expansion.param_bindings[0].fresh_name.starts_with("a__inl"));
        assert_eq!(expansion.result_var.as_deref(), Some("__ret0"));
        // Body is a single while True
        assert_eq!(expansion.body.len(), 1);
        let StmtKind::While { test, body } = &expansion.body[0].kind else {
            panic!("expected while wrapper");
        };
        assert_eq!(test, &Expr::Constant(Constant::Bool(true)));
        // return rewrote to: result = move(total'); flag = True; break; ... break
        let has_move = body.iter().any(|s| match &s.kind {
            StmtKind::Assign { value: Expr::Call { func, .. }, .. } => {
                matches!(&**func, Expr::Name(n) if n == "move")
            }
            _ => false,
        });
        assert!(has_move);
        assert!(matches!(body.last().unwrap().kind, StmtKind::Break));
    }

    #[test]
    fn test_locals_renamed_consistently() {
        let def = adder();
        let mut counter = 0;
        let expansion = expand(
            &def,
            ExitRule::Return {
                result_var: Some("__ret0".to_string()),
                flag_var: "__flag0".to_string(),
            },
            &mut counter,
        )
        .unwrap();
        let rendered = format!("{:?}", expansion.body);
        assert!(rendered.contains("total__inl"));
        assert!(!rendered.contains("\"total\""));
    }

    #[test]
    fn test_yield_expansion_splices_loop_body() {
        let def = r#gen();
        let mut counter = 0;
        let loop_body = vec![Stmt::new(
            1,
            StmtKind::Expr {
                value: Expr::call(Expr::name("use_item"), vec![Expr::name("x")]),
            },
        )];
        let expansion = expand(
            &def,
            ExitRule::Yield {
                loop_var: "x".to_string(),
                loop_body,
                break_flag: None,
            },
            &mut counter,
        )
        .unwrap();
        let rendered = format!("{:?}", expansion.body);
        assert!(rendered.contains("use_item"));
        assert!(rendered.contains("move"));
    }

    #[test]
    fn test_yield_with_break_wraps_in_guard_loop() {
        let def = r#gen();
        let mut counter = 0;
        let caller_body = vec![Stmt::new(1, StmtKind::Break)];
        let rewritten = rewrite_loop_controls(&caller_body, "__brk0");
        let expansion = expand(
            &def,
            ExitRule::Yield {
                loop_var: "x".to_string(),
                loop_body: rewritten,
                break_flag: Some("__brk0".to_string()),
            },
            &mut counter,
        )
        .unwrap();
        // Prelude declares the break flag
        assert!(expansion.prelude.iter().any(|s| matches!(
            &s.kind,
            StmtKind::AnnAssign { target: Expr::Name(n), .. } if n == "__brk0"
        )));
        let rendered = format!("{:?}", expansion.body);
        assert!(rendered.contains("__brk0"));
    }

    #[test]
    fn test_macro_rule_splices_return_as_expression() {
        let def = adder();
        let mut counter = 0;
        let expansion = expand(&def, ExitRule::Macro, &mut counter).unwrap();
        // No while-wrapper, no flag: the return becomes a bare expression
        assert!(expansion.prelude.is_empty());
        assert!(expansion.result_var.is_none());
        let last = expansion.body.last().unwrap();
        assert!(matches!(last.kind, StmtKind::Expr { .. }));
    }

    #[test]
    fn test_filter_rejects_recursion() {
        let mut def = adder();
        def.body.push(Stmt::new(
            3,
            StmtKind::Expr { value: Expr::call(Expr::name("adder"), vec![]) },
        ));
        assert!(check_inlinable(&def, InlineMode::Inline).is_err());
    }

    #[test]
    fn test_filter_rejects_non_generator_for_yield() {
        assert!(check_inlinable(&adder(), InlineMode::Yield).is_err());
        assert!(check_inlinable(&r#gen(), InlineMode::Yield).is_ok());
    }

    #[test]
    fn test_filter_rejects_generator_for_inline() {
        assert!(check_inlinable(&r#gen(), InlineMode::Inline).is_err());
    }

    #[test]
    fn test_continue_becomes_guard_break() {
        let body = vec![Stmt::new(1, StmtKind::Continue)];
        let rewritten = rewrite_loop_controls(&body, "__brk0");
        assert_eq!(rewritten.len(), 1);
        assert!(matches!(rewritten[0].kind, StmtKind::Break));
    }

    #[test]
    fn test_has_loop_controls_ignores_nested_loops() {
        let body = vec![Stmt::new(
            1,
            StmtKind::While {
                test: Expr::Constant(Constant::Bool(true)),
                body: vec![Stmt::new(2, StmtKind::Break)],
            },
        )];
        assert!(!has_loop_controls(&body));
        let direct = vec![Stmt::new(1, StmtKind::Break)];
        assert!(has_loop_controls(&direct));
    }
}
