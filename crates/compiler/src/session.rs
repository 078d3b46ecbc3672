//! Compiler session
//!
//! All process-wide state lives on one [`CompilerSession`] value passed
//! explicitly: the type cache, declared classes, the function registry,
//! effect namespaces, the dependency tracker, and the output manager.
//! File locks remain the only cross-process coordination.

use crate::ast::{
    ClassDef, ClassKind, EffectScope, FunctionDef, FunctionKind, Item, Module, SourceLocation,
};
use crate::build::deps::{DependencyTracker, GroupKey};
use crate::build::output::{mtime_seconds, OutputManager};
use crate::config::CompilerConfig;
use crate::effects::{direct_effect_uses, mangle, EffectContext, EffectRegistry};
use crate::error::{CompileError, CompileResult};
use crate::registry::{FunctionInfo, FunctionRegistry};
use crate::resolver::TypeResolver;
use crate::types::{EnumBody, EnumVariant, StructBody, Type, TypeCache};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// Module namespace: the source file's stem
pub fn module_namespace(file: &Path) -> String {
    file.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string())
}

pub struct CompilerSession {
    pub config: CompilerConfig,
    pub type_cache: TypeCache,
    /// Declared struct/enum types by bare name
    pub classes: HashMap<String, Type>,
    /// Enum bodies by name, for pattern checking
    pub enums: HashMap<String, Rc<EnumBody>>,
    pub functions: FunctionRegistry,
    pub effects: EffectRegistry,
    pub deps: DependencyTracker,
    pub output: OutputManager,
    /// Registered module ASTs by source path
    pub modules: HashMap<PathBuf, Module>,
    /// Effect context each function was declared under
    pub function_contexts: HashMap<String, EffectContext>,
    /// Non-fatal diagnostics accumulated during compilation
    pub warnings: Vec<String>,
}

impl CompilerSession {
    pub fn new(config: CompilerConfig) -> Self {
        let output = OutputManager::new(config.build_dir.clone());
        CompilerSession {
            config,
            type_cache: TypeCache::new(),
            classes: HashMap::new(),
            enums: HashMap::new(),
            functions: FunctionRegistry::new(),
            effects: EffectRegistry::new(),
            deps: DependencyTracker::new(),
            output,
            modules: HashMap::new(),
            function_contexts: HashMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.warnings.push(message);
    }

    /// Register a module: declare its classes, then its functions. The
    /// bodies are not lowered here; this is the declaration pass that makes
    /// mutual recursion and cross-module references resolvable.
    pub fn register_module(&mut self, module: &Module) -> CompileResult<()> {
        self.register_classes(&module.items, &module.file)?;
        self.register_functions(&module.items, &module.file, &[])?;
        self.modules.insert(module.file.clone(), module.clone());
        debug!(file = %module.file.display(), "registered module");
        Ok(())
    }

    fn register_classes(&mut self, items: &[Item], file: &Path) -> CompileResult<()> {
        // Forward string references may point at later classes, so iterate
        // to a fixpoint before failing
        let mut pending: Vec<&ClassDef> = Vec::new();
        fn collect<'a>(items: &'a [Item], out: &mut Vec<&'a ClassDef>) {
            for item in items {
                match item {
                    Item::Class(c) => out.push(c),
                    Item::EffectScope(scope) => collect(&scope.items, out),
                    _ => {}
                }
            }
        }
        collect(items, &mut pending);

        let mut made_progress = true;
        while made_progress && !pending.is_empty() {
            made_progress = false;
            let mut still_pending = Vec::new();
            for class in pending {
                match self.declare_class(class, file) {
                    Ok(()) => made_progress = true,
                    Err(e) if e.kind == crate::error::ErrorKind::Name => still_pending.push(class),
                    Err(e) => return Err(e),
                }
            }
            pending = still_pending;
        }
        if let Some(class) = pending.first() {
            return Err(CompileError::at(
                crate::error::ErrorKind::Name,
                format!("unresolved type reference in class '{}'", class.name),
                SourceLocation::new(file, class.line),
            ));
        }
        Ok(())
    }

    fn declare_class(&mut self, class: &ClassDef, file: &Path) -> CompileResult<()> {
        if self.classes.contains_key(&class.name) {
            return Err(CompileError::at(
                crate::error::ErrorKind::Syntax,
                format!("type '{}' is already declared", class.name),
                SourceLocation::new(file, class.line),
            ));
        }
        match class.kind {
            ClassKind::Struct => {
                let mut fields = Vec::with_capacity(class.fields.len());
                for field in &class.fields {
                    let mut resolver = TypeResolver::new(&self.classes, &mut self.type_cache);
                    let ty = resolver.resolve(&field.annotation)?;
                    fields.push((field.name.clone(), ty));
                }
                let ty = Type::Struct(Rc::new(StructBody { name: class.name.clone(), fields }));
                self.classes.insert(class.name.clone(), ty);
            }
            ClassKind::Enum => {
                let mut variants = Vec::with_capacity(class.variants.len());
                let mut next_tag = 0i64;
                for variant in &class.variants {
                    let payload = match &variant.payload {
                        Some(annotation) => {
                            let mut resolver =
                                TypeResolver::new(&self.classes, &mut self.type_cache);
                            Some(resolver.resolve(annotation)?)
                        }
                        None => None,
                    };
                    let tag = variant.tag.unwrap_or(next_tag);
                    next_tag = tag + 1;
                    variants.push(EnumVariant { name: variant.name.clone(), payload, tag });
                }
                let body = Rc::new(EnumBody { name: class.name.clone(), variants });
                self.enums.insert(class.name.clone(), body.clone());
                self.classes.insert(class.name.clone(), Type::Enum(body));
            }
        }
        Ok(())
    }

    fn register_functions(
        &mut self,
        items: &[Item],
        file: &Path,
        scopes: &[&EffectScope],
    ) -> CompileResult<()> {
        for item in items {
            match item {
                Item::Function(def) => self.declare_function(def, file, scopes)?,
                Item::EffectScope(scope) => {
                    let mut nested: Vec<&EffectScope> = scopes.to_vec();
                    nested.push(scope);
                    self.register_functions(&scope.items, file, &nested)?;
                }
                Item::Class(_) => {}
            }
        }
        Ok(())
    }

    fn declare_function(
        &mut self,
        def: &FunctionDef,
        file: &Path,
        scopes: &[&EffectScope],
    ) -> CompileResult<()> {
        let effect_suffix = scopes.iter().rev().find_map(|s| s.suffix.clone());
        let (compile_suffix, is_extern, is_inline, libs, objects, convention) = match &def.kind {
            FunctionKind::Compile { suffix } => {
                if suffix.is_some() && effect_suffix.is_some() {
                    return Err(CompileError::at(
                        crate::error::ErrorKind::Syntax,
                        format!(
                            "'{}' combines compile(suffix=...) with an enclosing \
                             effect(suffix=...); use one suffix source",
                            def.name
                        ),
                        SourceLocation::new(file, def.start_line),
                    ));
                }
                (suffix.clone(), false, false, vec![], vec![], None)
            }
            FunctionKind::Inline => (None, false, true, vec![], vec![], None),
            FunctionKind::Extern { libs, objects, calling_convention } => (
                None,
                true,
                false,
                libs.clone(),
                objects.clone(),
                calling_convention.clone(),
            ),
        };
        if def.vararg && !is_extern {
            return Err(CompileError::at(
                crate::error::ErrorKind::Syntax,
                format!("'{}': varargs are only valid on extern declarations", def.name),
                SourceLocation::new(file, def.start_line),
            ));
        }

        let mut param_names = Vec::with_capacity(def.params.len());
        let mut param_types = Vec::with_capacity(def.params.len());
        for param in &def.params {
            let mut resolver = TypeResolver::new(&self.classes, &mut self.type_cache);
            param_names.push(param.name.clone());
            param_types.push(resolver.resolve(&param.annotation)?);
        }
        let return_type = match &def.returns {
            Some(annotation) => {
                let mut resolver = TypeResolver::new(&self.classes, &mut self.type_cache);
                resolver.resolve(annotation)?
            }
            None => Type::Void,
        };

        let namespace = module_namespace(file);
        let qualified_name = format!("{}.{}", namespace, def.name);
        let mangled_name = if is_extern {
            def.name.clone()
        } else {
            mangle(&def.name, compile_suffix.as_deref(), effect_suffix.as_deref())
        };
        let group_key = GroupKey {
            file: file.to_path_buf(),
            scope: None,
            compile_suffix,
            effect_suffix,
        };

        let mut context = EffectContext::default();
        for scope in scopes {
            for o in &scope.overrides {
                context
                    .overrides
                    .insert(o.effect.clone(), o.namespace.clone());
            }
            if scope.suffix.is_some() {
                context.suffix = scope.suffix.clone();
            }
        }
        self.function_contexts
            .insert(qualified_name.clone(), context);

        self.functions.register(FunctionInfo {
            qualified_name,
            mangled_name,
            source_file: file.to_path_buf(),
            param_names,
            param_types,
            return_type,
            effect_dependencies: direct_effect_uses(def).into_iter().collect(),
            group_key,
            shared_lib_path: None,
            is_extern,
            is_inline,
            link_libraries: libs,
            link_objects: objects,
            calling_convention: convention,
            def_ast: Some(Rc::new(def.clone())),
        })
    }

    /// Resolve a callee name from `current_file`'s viewpoint: bare names
    /// prefer the current module, dotted names are used as-is.
    pub fn resolve_function(&self, name: &str, current_file: &Path) -> Option<&FunctionInfo> {
        if name.contains('.') {
            return self.functions.get(name);
        }
        let local = format!("{}.{}", module_namespace(current_file), name);
        self.functions.get(&local).or_else(|| {
            // Fall back to a unique match in any registered module
            let mut found = None;
            for info in self.functions.iter() {
                if info.qualified_name.rsplit_once('.').map(|(_, n)| n) == Some(name) {
                    if found.is_some() {
                        return None;
                    }
                    found = Some(info);
                }
            }
            found
        })
    }

    /// Begin dependency tracking for a group
    pub fn begin_group(&mut self, key: &GroupKey) {
        let source_mtime = mtime_seconds(&key.file);
        self.deps.begin_group(key.clone(), source_mtime);
    }

    /// Evict all state for a failed group so a retry starts fresh
    pub fn evict_group(&mut self, key: &GroupKey) {
        self.deps.evict_group(key);
        self.output.evict(key);
        self.functions.evict_group(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{EffectOverride, FieldDef, Param, Stmt, StmtKind, VariantDef};
    use crate::ast::Expr;

    fn session() -> CompilerSession {
        CompilerSession::new(CompilerConfig::default())
    }

    fn point_class() -> ClassDef {
        ClassDef {
            name: "Point".to_string(),
            kind: ClassKind::Struct,
            fields: vec![
                FieldDef { name: "x".to_string(), annotation: Expr::name("i32") },
                FieldDef { name: "y".to_string(), annotation: Expr::name("i32") },
            ],
            variants: vec![],
            line: 1,
        }
    }

    fn compile_fn(name: &str) -> FunctionDef {
        FunctionDef {
            name: name.to_string(),
            kind: FunctionKind::Compile { suffix: None },
            params: vec![Param { name: "a".to_string(), annotation: Expr::name("i32") }],
            returns: Some(Expr::name("i32")),
            vararg: false,
            body: vec![Stmt::new(1, StmtKind::Return { value: Some(Expr::name("a")) })],
            start_line: 4,
        }
    }

    #[test]
    fn test_register_module_declares_classes_and_functions() {
        let mut session = session();
        let mut module = Module::new("demo.py");
        module.items.push(Item::Class(point_class()));
        module.items.push(Item::Function(compile_fn("ident")));
        session.register_module(&module).unwrap();

        assert!(session.classes.contains_key("Point"));
        let info = session.functions.get("demo.ident").unwrap();
        assert_eq!(info.mangled_name, "ident");
        assert_eq!(info.param_types, vec![Type::I32]);
    }

    #[test]
    fn test_forward_string_reference_between_classes() {
        let mut session = session();
        let mut module = Module::new("demo.py");
        // Holder references Point before it is declared
        module.items.push(Item::Class(ClassDef {
            name: "Holder".to_string(),
            kind: ClassKind::Struct,
            fields: vec![FieldDef {
                name: "p".to_string(),
                annotation: Expr::string("Point"),
            }],
            variants: vec![],
            line: 1,
        }));
        module.items.push(Item::Class(point_class()));
        session.register_module(&module).unwrap();
        assert!(session.classes.contains_key("Holder"));
    }

    #[test]
    fn test_effect_scope_suffix_mangles_functions() {
        let mut session = session();
        let mut module = Module::new("demo.py");
        module.items.push(Item::EffectScope(EffectScope {
            overrides: vec![EffectOverride {
                effect: "mem".to_string(),
                namespace: "counting_mem".to_string(),
            }],
            suffix: Some("cnt".to_string()),
            items: vec![Item::Function(compile_fn("f"))],
            line: 1,
        }));
        session.register_module(&module).unwrap();
        let info = session.functions.get("demo.f").unwrap();
        assert_eq!(info.mangled_name, "f_cnt");
        assert_eq!(info.group_key.effect_suffix.as_deref(), Some("cnt"));
        let context = session.function_contexts.get("demo.f").unwrap();
        assert_eq!(
            context.overrides.get("mem").map(String::as_str),
            Some("counting_mem")
        );
    }

    #[test]
    fn test_double_suffix_rejected() {
        let mut session = session();
        let mut module = Module::new("demo.py");
        let mut def = compile_fn("f");
        def.kind = FunctionKind::Compile { suffix: Some("i64".to_string()) };
        module.items.push(Item::EffectScope(EffectScope {
            overrides: vec![],
            suffix: Some("cnt".to_string()),
            items: vec![Item::Function(def)],
            line: 1,
        }));
        let err = session.register_module(&module).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Syntax);
    }

    #[test]
    fn test_vararg_on_compiled_function_rejected() {
        let mut session = session();
        let mut module = Module::new("demo.py");
        let mut def = compile_fn("f");
        def.vararg = true;
        module.items.push(Item::Function(def));
        let err = session.register_module(&module).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Syntax);
    }

    #[test]
    fn test_enum_tags_number_sequentially_after_explicit() {
        let mut session = session();
        let mut module = Module::new("demo.py");
        module.items.push(Item::Class(ClassDef {
            name: "Code".to_string(),
            kind: ClassKind::Enum,
            fields: vec![],
            variants: vec![
                VariantDef { name: "A".to_string(), payload: None, tag: Some(10) },
                VariantDef { name: "B".to_string(), payload: None, tag: None },
            ],
            line: 1,
        }));
        session.register_module(&module).unwrap();
        let body = session.enums.get("Code").unwrap();
        assert_eq!(body.variants[0].tag, 10);
        assert_eq!(body.variants[1].tag, 11);
    }

    #[test]
    fn test_resolve_function_prefers_local_module() {
        let mut session = session();
        let mut module = Module::new("demo.py");
        module.items.push(Item::Function(compile_fn("f")));
        session.register_module(&module).unwrap();
        let info = session.resolve_function("f", Path::new("demo.py")).unwrap();
        assert_eq!(info.qualified_name, "demo.f");
        assert!(session
            .resolve_function("demo.f", Path::new("other.py"))
            .is_some());
    }
}
