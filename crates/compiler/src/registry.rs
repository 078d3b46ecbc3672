//! Variable and function registries
//!
//! [`VariableRegistry`] is the lowering driver's lexically-scoped symbol
//! table: shadowing is allowed across scopes and rejected inside one
//! scope. Variables that carry linear substructure own one state entry per
//! path into that substructure; the driver mutates those states in place
//! and the CFG checker validates them later.
//!
//! [`FunctionRegistry`] is session-wide: every declared function (compiled,
//! inline, extern, and effect-suffixed specializations) is registered here
//! so call sites, the build graph, and the loader agree on signatures and
//! mangled names.

use crate::ast::{FunctionDef, SourceLocation};
use crate::build::deps::GroupKey;
use crate::error::{CompileError, CompileResult};
use crate::types::Type;
use crate::valueref::ValueRef;
use std::collections::HashMap;
use std::rc::Rc;

/// Linear-resource state of one path inside one variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearState {
    Undefined,
    Active,
    Consumed,
    /// Ownership transferred to another location
    Moved,
}

impl LinearState {
    /// The only distinction merges care about
    pub fn is_active(&self) -> bool {
        matches!(self, LinearState::Active)
    }

    pub fn name(&self) -> &'static str {
        match self {
            LinearState::Undefined => "undefined",
            LinearState::Active => "active",
            LinearState::Consumed => "consumed",
            LinearState::Moved => "moved",
        }
    }
}

/// Everything the driver knows about one declared variable
#[derive(Debug, Clone)]
pub struct VariableInfo {
    pub name: String,
    pub scope_level: usize,
    pub type_hint: Type,
    /// Stack slot operand when the variable is addressable
    pub storage: Option<String>,
    pub value_ref: Option<ValueRef>,
    pub source: Option<SourceLocation>,
    pub is_parameter: bool,
    /// One entry per path into linear substructure
    pub linear_states: HashMap<Vec<usize>, LinearState>,
    /// Scope depth at which the linear content became active
    pub linear_scope_depth: usize,
}

impl VariableInfo {
    pub fn new(name: impl Into<String>, scope_level: usize, type_hint: Type) -> Self {
        VariableInfo {
            name: name.into(),
            scope_level,
            type_hint,
            storage: None,
            value_ref: None,
            source: None,
            is_parameter: false,
            linear_states: HashMap::new(),
            linear_scope_depth: scope_level,
        }
    }

    /// Initialize linear state entries for every linear path of the type
    pub fn activate_linear_paths(&mut self) {
        for path in self.type_hint.linear_paths() {
            self.linear_states.insert(path, LinearState::Active);
        }
    }

    pub fn linear_state(&self, path: &[usize]) -> LinearState {
        self.linear_states
            .get(path)
            .copied()
            .unwrap_or(LinearState::Undefined)
    }
}

/// Nested lexical scopes with shadowing across (not within) scopes
#[derive(Debug)]
pub struct VariableRegistry {
    scopes: Vec<HashMap<String, VariableInfo>>,
}

impl Default for VariableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableRegistry {
    pub fn new() -> Self {
        VariableRegistry { scopes: vec![HashMap::new()] }
    }

    /// Current scope depth (0 = function body)
    pub fn depth(&self) -> usize {
        self.scopes.len() - 1
    }

    pub fn enter_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Pop the innermost scope, returning its variables for cleanup checks
    pub fn exit_scope(&mut self) -> Vec<VariableInfo> {
        debug_assert!(self.scopes.len() > 1, "cannot exit the function scope");
        let scope = self.scopes.pop().unwrap_or_default();
        scope.into_values().collect()
    }

    /// Declare a variable in the current scope. Redeclaration in the same
    /// scope is an error; shadowing an outer scope is permitted.
    pub fn declare(&mut self, mut info: VariableInfo) -> CompileResult<()> {
        let depth = self.depth();
        info.scope_level = depth;
        let scope = self.scopes.last_mut().expect("at least one scope");
        if scope.contains_key(&info.name) {
            return Err(CompileError::syntax(format!(
                "variable '{}' is already declared in this scope",
                info.name
            )));
        }
        scope.insert(info.name.clone(), info);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&VariableInfo> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut VariableInfo> {
        self.scopes.iter_mut().rev().find_map(|s| s.get_mut(name))
    }

    pub fn is_declared_in_current_scope(&self, name: &str) -> bool {
        self.scopes
            .last()
            .map(|s| s.contains_key(name))
            .unwrap_or(false)
    }

    /// All visible variables, innermost shadowing outer
    pub fn visible(&self) -> HashMap<&str, &VariableInfo> {
        let mut out: HashMap<&str, &VariableInfo> = HashMap::new();
        for scope in &self.scopes {
            for (name, info) in scope {
                out.insert(name.as_str(), info);
            }
        }
        out
    }
}

/// Session-wide record of a declared function
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub qualified_name: String,
    pub mangled_name: String,
    pub source_file: std::path::PathBuf,
    pub param_names: Vec<String>,
    pub param_types: Vec<Type>,
    pub return_type: Type,
    /// Effect names this function dereferences, directly
    pub effect_dependencies: Vec<String>,
    pub group_key: GroupKey,
    /// Set once the group's shared library has been linked
    pub shared_lib_path: Option<std::path::PathBuf>,
    pub is_extern: bool,
    pub is_inline: bool,
    pub link_libraries: Vec<String>,
    pub link_objects: Vec<String>,
    pub calling_convention: Option<String>,
    /// Body kept for inline splicing and suffix specialization
    pub def_ast: Option<Rc<FunctionDef>>,
}

impl FunctionInfo {
    /// True when any parameter or the return carries linear substructure
    pub fn touches_linear(&self) -> bool {
        self.param_types.iter().any(|t| t.contains_linear()) || self.return_type.contains_linear()
    }
}

/// Session-wide function table, addressable by qualified or mangled name
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    by_qualified: HashMap<String, FunctionInfo>,
    mangled_to_qualified: HashMap<String, String>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, info: FunctionInfo) -> CompileResult<()> {
        if let Some(existing) = self.by_qualified.get(&info.qualified_name) {
            if existing.mangled_name != info.mangled_name {
                return Err(CompileError::overload(format!(
                    "function '{}' is already registered with a different signature",
                    info.qualified_name
                )));
            }
        }
        self.mangled_to_qualified
            .insert(info.mangled_name.clone(), info.qualified_name.clone());
        self.by_qualified.insert(info.qualified_name.clone(), info);
        Ok(())
    }

    pub fn get(&self, qualified_name: &str) -> Option<&FunctionInfo> {
        self.by_qualified.get(qualified_name)
    }

    pub fn get_mut(&mut self, qualified_name: &str) -> Option<&mut FunctionInfo> {
        self.by_qualified.get_mut(qualified_name)
    }

    pub fn get_by_mangled(&self, mangled: &str) -> Option<&FunctionInfo> {
        let qualified = self.mangled_to_qualified.get(mangled)?;
        self.by_qualified.get(qualified)
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.by_qualified.contains_key(qualified_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionInfo> {
        self.by_qualified.values()
    }

    /// Drop every function belonging to a group (used on compile failure)
    pub fn evict_group(&mut self, key: &GroupKey) {
        let doomed: Vec<String> = self
            .by_qualified
            .values()
            .filter(|f| &f.group_key == key)
            .map(|f| f.qualified_name.clone())
            .collect();
        for name in doomed {
            if let Some(info) = self.by_qualified.remove(&name) {
                self.mangled_to_qualified.remove(&info.mangled_name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, ty: Type) -> VariableInfo {
        VariableInfo::new(name, 0, ty)
    }

    #[test]
    fn test_redeclare_in_same_scope_rejected() {
        let mut reg = VariableRegistry::new();
        reg.declare(info("x", Type::I32)).unwrap();
        let err = reg.declare(info("x", Type::I64)).unwrap_err();
        assert!(err.to_string().contains("already declared"));
    }

    #[test]
    fn test_shadowing_across_scopes() {
        let mut reg = VariableRegistry::new();
        reg.declare(info("x", Type::I32)).unwrap();
        reg.enter_scope();
        reg.declare(info("x", Type::I64)).unwrap();
        assert_eq!(reg.lookup("x").unwrap().type_hint, Type::I64);
        reg.exit_scope();
        assert_eq!(reg.lookup("x").unwrap().type_hint, Type::I32);
    }

    #[test]
    fn test_linear_activation() {
        let mut v = info("t", Type::Linear);
        v.activate_linear_paths();
        assert_eq!(v.linear_state(&[]), LinearState::Active);
        assert_eq!(v.linear_state(&[0]), LinearState::Undefined);
    }

    #[test]
    fn test_visible_prefers_inner_scope() {
        let mut reg = VariableRegistry::new();
        reg.declare(info("x", Type::I32)).unwrap();
        reg.enter_scope();
        reg.declare(info("x", Type::Bool)).unwrap();
        let visible = reg.visible();
        assert_eq!(visible.get("x").unwrap().type_hint, Type::Bool);
    }

    #[test]
    fn test_function_registry_mangled_lookup() {
        let mut reg = FunctionRegistry::new();
        reg.register(FunctionInfo {
            qualified_name: "mod.f".to_string(),
            mangled_name: "f_cnt".to_string(),
            source_file: "mod.py".into(),
            param_names: vec![],
            param_types: vec![],
            return_type: Type::Void,
            effect_dependencies: vec![],
            group_key: GroupKey::for_file("mod.py"),
            shared_lib_path: None,
            is_extern: false,
            is_inline: false,
            link_libraries: vec![],
            link_objects: vec![],
            calling_convention: None,
            def_ast: None,
        })
        .unwrap();
        assert!(reg.get_by_mangled("f_cnt").is_some());
        assert!(reg.get("mod.f").is_some());

        reg.evict_group(&GroupKey::for_file("mod.py"));
        assert!(reg.get("mod.f").is_none());
        assert!(reg.get_by_mangled("f_cnt").is_none());
    }
}
