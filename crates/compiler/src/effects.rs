//! Effect overlay and suffix mangling
//!
//! An effect is a named namespace of callables (`effect.mem.malloc`). Each
//! effect has a process-default namespace; `with effect(mem=..., suffix=..)`
//! pushes an override context. Functions compiled under a context get the
//! context's suffix mangled into their symbol, and callees that transitively
//! reach an overridden effect are re-specialized with the same suffix so one
//! shared library carries the whole overridden call tree.

use crate::ast::{Expr, FunctionDef, Stmt, StmtKind};
use crate::error::{CompileError, CompileResult};
use crate::registry::FunctionRegistry;
use std::collections::{HashMap, HashSet};

/// Mangle a function symbol from its base name and suffixes, collapsing
/// separators for absent parts. Pure in `(base, compile_suffix,
/// effect_suffix)` so repeated compilations agree byte for byte.
pub fn mangle(base: &str, compile_suffix: Option<&str>, effect_suffix: Option<&str>) -> String {
    let mut out = base.to_string();
    for suffix in [compile_suffix, effect_suffix].into_iter().flatten() {
        if !suffix.is_empty() {
            out.push('_');
            out.push_str(suffix);
        }
    }
    out
}

/// A namespace of effect callables: effect function name -> qualified name
/// of the implementation in the function registry
#[derive(Debug, Clone, Default)]
pub struct EffectNamespace {
    pub name: String,
    pub functions: HashMap<String, String>,
}

impl EffectNamespace {
    pub fn new(name: impl Into<String>) -> Self {
        EffectNamespace { name: name.into(), functions: HashMap::new() }
    }

    pub fn with_function(mut self, effect_fn: &str, implementation: &str) -> Self {
        self.functions
            .insert(effect_fn.to_string(), implementation.to_string());
        self
    }
}

/// One entry of the compilation-context stack
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectContext {
    /// effect name -> namespace name
    pub overrides: HashMap<String, String>,
    pub suffix: Option<String>,
}

/// Session-wide effect state: registered namespaces, per-effect defaults,
/// and the active override stack.
#[derive(Debug, Default)]
pub struct EffectRegistry {
    namespaces: HashMap<String, EffectNamespace>,
    /// effect name -> default namespace name
    defaults: HashMap<String, String>,
    stack: Vec<EffectContext>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_namespace(&mut self, namespace: EffectNamespace) {
        self.namespaces.insert(namespace.name.clone(), namespace);
    }

    pub fn set_default(&mut self, effect: &str, namespace: &str) {
        self.defaults.insert(effect.to_string(), namespace.to_string());
    }

    pub fn push_context(&mut self, context: EffectContext) {
        self.stack.push(context);
    }

    pub fn pop_context(&mut self) -> Option<EffectContext> {
        self.stack.pop()
    }

    /// Suffix of the innermost context that carries one
    pub fn active_suffix(&self) -> Option<&str> {
        self.stack
            .iter()
            .rev()
            .find_map(|c| c.suffix.as_deref())
    }

    /// Effect names overridden by any active context
    pub fn overridden_effects(&self) -> HashSet<String> {
        self.stack
            .iter()
            .flat_map(|c| c.overrides.keys().cloned())
            .collect()
    }

    /// Resolve `effect.<effect>.<function>` against the override stack,
    /// innermost context first, then the process-wide default.
    pub fn resolve(&self, effect: &str, function: &str) -> CompileResult<&str> {
        let namespace_name = self
            .stack
            .iter()
            .rev()
            .find_map(|c| c.overrides.get(effect))
            .or_else(|| self.defaults.get(effect))
            .ok_or_else(|| {
                CompileError::name_error(format!("no namespace bound for effect '{}'", effect))
            })?;
        let namespace = self.namespaces.get(namespace_name).ok_or_else(|| {
            CompileError::name_error(format!(
                "effect namespace '{}' is not registered",
                namespace_name
            ))
        })?;
        namespace
            .functions
            .get(function)
            .map(String::as_str)
            .ok_or_else(|| {
                CompileError::name_error(format!(
                    "effect namespace '{}' has no callable '{}'",
                    namespace_name, function
                ))
            })
    }
}

/// Collect the names a function body calls (plain and dotted callees)
pub fn called_names(def: &FunctionDef) -> HashSet<String> {
    let mut names = HashSet::new();
    fn walk_expr(expr: &Expr, names: &mut HashSet<String>) {
        match expr {
            Expr::Call { func, args, keywords } => {
                if let Some(path) = func.dotted_path() {
                    names.insert(path.join("."));
                } else {
                    walk_expr(func, names);
                }
                for a in args {
                    walk_expr(a, names);
                }
                for (_, v) in keywords {
                    walk_expr(v, names);
                }
            }
            Expr::BinOp { left, right, .. } => {
                walk_expr(left, names);
                walk_expr(right, names);
            }
            Expr::UnaryOp { operand, .. } => walk_expr(operand, names),
            Expr::BoolOp { values, .. } => values.iter().for_each(|v| walk_expr(v, names)),
            Expr::Compare { left, comparators, .. } => {
                walk_expr(left, names);
                comparators.iter().for_each(|c| walk_expr(c, names));
            }
            Expr::Subscript { value, index } => {
                walk_expr(value, names);
                walk_expr(index, names);
            }
            Expr::Attribute { value, .. } => walk_expr(value, names),
            Expr::Tuple(parts) | Expr::List(parts) => {
                parts.iter().for_each(|p| walk_expr(p, names));
            }
            Expr::Yield { value: Some(v) } => walk_expr(v, names),
            Expr::IfExp { test, body, orelse } => {
                walk_expr(test, names);
                walk_expr(body, names);
                walk_expr(orelse, names);
            }
            _ => {}
        }
    }
    fn walk_stmts(stmts: &[Stmt], names: &mut HashSet<String>) {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::Assign { targets, value } => {
                    targets.iter().for_each(|t| walk_expr(t, names));
                    walk_expr(value, names);
                }
                StmtKind::AnnAssign { value, .. } => {
                    if let Some(v) = value {
                        walk_expr(v, names);
                    }
                }
                StmtKind::AugAssign { target, value, .. } => {
                    walk_expr(target, names);
                    walk_expr(value, names);
                }
                StmtKind::If { test, body, orelse } => {
                    walk_expr(test, names);
                    walk_stmts(body, names);
                    walk_stmts(orelse, names);
                }
                StmtKind::While { test, body } => {
                    walk_expr(test, names);
                    walk_stmts(body, names);
                }
                StmtKind::For { iter, body, .. } => {
                    walk_expr(iter, names);
                    walk_stmts(body, names);
                }
                StmtKind::Match { subject, cases } => {
                    walk_expr(subject, names);
                    for case in cases {
                        if let Some(g) = &case.guard {
                            walk_expr(g, names);
                        }
                        walk_stmts(&case.body, names);
                    }
                }
                StmtKind::With { context, body, .. } => {
                    walk_expr(context, names);
                    walk_stmts(body, names);
                }
                StmtKind::Try { body, finalbody } => {
                    walk_stmts(body, names);
                    walk_stmts(finalbody, names);
                }
                StmtKind::Return { value: Some(v) } => walk_expr(v, names),
                StmtKind::Expr { value } => walk_expr(value, names),
                _ => {}
            }
        }
    }
    walk_stmts(&def.body, &mut names);
    names
}

/// Direct effect names a function dereferences (`effect.<name>.<fn>`)
pub fn direct_effect_uses(def: &FunctionDef) -> HashSet<String> {
    called_names(def)
        .into_iter()
        .filter_map(|name| {
            let mut parts = name.split('.');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("effect"), Some(effect), Some(_)) => Some(effect.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Does `qualified_name` reach any of `overridden` directly or through its
/// callees? Drives suffix propagation: a caller compiled under an override
/// context calls the suffixed specialization of any callee for which this
/// returns true.
pub fn reaches_overridden_effect(
    qualified_name: &str,
    overridden: &HashSet<String>,
    registry: &FunctionRegistry,
) -> bool {
    fn walk(
        name: &str,
        overridden: &HashSet<String>,
        registry: &FunctionRegistry,
        visited: &mut HashSet<String>,
    ) -> bool {
        if !visited.insert(name.to_string()) {
            return false;
        }
        let Some(info) = registry.get(name) else {
            return false;
        };
        if info
            .effect_dependencies
            .iter()
            .any(|e| overridden.contains(e))
        {
            return true;
        }
        let Some(def) = &info.def_ast else {
            return false;
        };
        let module_prefix = name.rsplit_once('.').map(|(m, _)| m).unwrap_or("");
        for callee in called_names(def) {
            if callee.starts_with("effect.") {
                continue;
            }
            let qualified = if callee.contains('.') {
                callee.clone()
            } else if module_prefix.is_empty() {
                callee.clone()
            } else {
                format!("{}.{}", module_prefix, callee)
            };
            if walk(&qualified, overridden, registry, visited) {
                return true;
            }
        }
        false
    }
    let mut visited = HashSet::new();
    walk(qualified_name, overridden, registry, &mut visited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::FunctionKind;
    use crate::build::deps::GroupKey;
    use crate::registry::FunctionInfo;
    use crate::types::Type;

    #[test]
    fn test_mangle_collapses_missing_suffixes() {
        assert_eq!(mangle("f", None, None), "f");
        assert_eq!(mangle("f", Some("i32"), None), "f_i32");
        assert_eq!(mangle("f", None, Some("cnt")), "f_cnt");
        assert_eq!(mangle("f", Some("i32"), Some("cnt")), "f_i32_cnt");
        assert_eq!(mangle("f", Some(""), Some("cnt")), "f_cnt");
    }

    #[test]
    fn test_mangle_is_pure() {
        assert_eq!(
            mangle("work", None, Some("tracked")),
            mangle("work", None, Some("tracked"))
        );
    }

    fn registry_with_malloc() -> EffectRegistry {
        let mut reg = EffectRegistry::new();
        reg.register_namespace(
            EffectNamespace::new("libc_mem")
                .with_function("malloc", "libc.malloc")
                .with_function("free", "libc.free"),
        );
        reg.register_namespace(
            EffectNamespace::new("counting_mem")
                .with_function("malloc", "trace.counting_malloc")
                .with_function("free", "trace.counting_free"),
        );
        reg.set_default("mem", "libc_mem");
        reg
    }

    #[test]
    fn test_resolve_default_namespace() {
        let reg = registry_with_malloc();
        assert_eq!(reg.resolve("mem", "malloc").unwrap(), "libc.malloc");
    }

    #[test]
    fn test_override_shadows_default_and_pops() {
        let mut reg = registry_with_malloc();
        let mut overrides = HashMap::new();
        overrides.insert("mem".to_string(), "counting_mem".to_string());
        reg.push_context(EffectContext { overrides, suffix: Some("cnt".to_string()) });
        assert_eq!(reg.resolve("mem", "malloc").unwrap(), "trace.counting_malloc");
        assert_eq!(reg.active_suffix(), Some("cnt"));
        reg.pop_context();
        assert_eq!(reg.resolve("mem", "malloc").unwrap(), "libc.malloc");
        assert_eq!(reg.active_suffix(), None);
    }

    #[test]
    fn test_unknown_effect_is_name_error() {
        let reg = registry_with_malloc();
        let err = reg.resolve("io", "write").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Name);
    }

    fn function(name: &str, body: Vec<Stmt>) -> FunctionDef {
        FunctionDef {
            name: name.to_string(),
            kind: FunctionKind::Compile { suffix: None },
            params: vec![],
            returns: None,
            vararg: false,
            body,
            start_line: 1,
        }
    }

    fn call_stmt(path: &[&str]) -> Stmt {
        let mut expr = Expr::name(path[0]);
        for part in &path[1..] {
            expr = Expr::attribute(expr, *part);
        }
        Stmt::new(1, StmtKind::Expr { value: Expr::call(expr, vec![]) })
    }

    #[test]
    fn test_direct_effect_uses() {
        let def = function("f", vec![call_stmt(&["effect", "mem", "malloc"])]);
        let uses = direct_effect_uses(&def);
        assert!(uses.contains("mem"));
        assert_eq!(uses.len(), 1);
    }

    fn info(qualified: &str, def: FunctionDef, effects: Vec<String>) -> FunctionInfo {
        FunctionInfo {
            qualified_name: qualified.to_string(),
            mangled_name: def.name.clone(),
            source_file: "mod.py".into(),
            param_names: vec![],
            param_types: vec![],
            return_type: Type::Void,
            effect_dependencies: effects,
            group_key: GroupKey::for_file("mod.py"),
            shared_lib_path: None,
            is_extern: false,
            is_inline: false,
            link_libraries: vec![],
            link_objects: vec![],
            calling_convention: None,
            def_ast: Some(std::rc::Rc::new(def)),
        }
    }

    #[test]
    fn test_transitive_effect_reachability() {
        // a calls b, b uses effect.mem
        let mut registry = FunctionRegistry::new();
        let b = function("b", vec![call_stmt(&["effect", "mem", "malloc"])]);
        registry
            .register(info("mod.b", b, vec!["mem".to_string()]))
            .unwrap();
        let a = function("a", vec![call_stmt(&["b"])]);
        registry.register(info("mod.a", a, vec![])).unwrap();

        let overridden: HashSet<String> = ["mem".to_string()].into_iter().collect();
        assert!(reaches_overridden_effect("mod.a", &overridden, &registry));
        assert!(reaches_overridden_effect("mod.b", &overridden, &registry));

        let other: HashSet<String> = ["io".to_string()].into_iter().collect();
        assert!(!reaches_overridden_effect("mod.a", &other, &registry));
    }

    #[test]
    fn test_reachability_handles_recursion() {
        // mutual recursion between a and b must not loop
        let mut registry = FunctionRegistry::new();
        let a = function("a", vec![call_stmt(&["b"])]);
        let b = function("b", vec![call_stmt(&["a"])]);
        registry.register(info("mod.a", a, vec![])).unwrap();
        registry.register(info("mod.b", b, vec![])).unwrap();
        let overridden: HashSet<String> = ["mem".to_string()].into_iter().collect();
        assert!(!reaches_overridden_effect("mod.a", &overridden, &registry));
    }
}
