//! pythoc compiler library
//!
//! Compiles a Python-syntax surface language with explicit low-level type
//! annotations into native shared libraries through textual LLVM IR.
//!
//! The pipeline:
//!
//! 1. the host frontend hands over a [`ast::Module`] (usually as JSON)
//! 2. [`session::CompilerSession::register_module`] declares classes and
//!    function signatures (forward references resolve here)
//! 3. [`compile_module`] lowers each compilation group to IR, runs the
//!    linear and exhaustiveness checks, and emits `.o` + `.deps` behind a
//!    per-group file lock
//! 4. [`loader::Loader`] links shared libraries on demand, loads them in
//!    dependency order with cycle tolerance, and dispatches host calls
//!
//! ```rust,ignore
//! use pythoc::{CompilerConfig, CompilerSession, compile_module, load_module_file};
//!
//! let mut session = CompilerSession::new(CompilerConfig::from_env());
//! let module = load_module_file(Path::new("demo.json"))?;
//! let groups = compile_module(&mut session, &module)?;
//! ```

pub mod ast;
pub mod build;
pub mod cfg;
pub mod codegen;
pub mod config;
pub mod effects;
pub mod error;
pub mod exhaustive;
pub mod inline;
pub mod ir;
pub mod linear;
pub mod loader;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod types;
pub mod valueref;

pub use ast::Module;
pub use build::deps::{GroupDeps, GroupKey};
pub use build::output::FileLock;
pub use config::{CompilerConfig, OptimizationLevel};
pub use error::{CompileError, CompileResult, ErrorKind};
pub use loader::{Loader, ScalarValue};
pub use session::CompilerSession;
pub use types::Type;

use build::output::mtime_seconds;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// Read a frontend-produced module AST from JSON
pub fn load_module_file(path: &Path) -> CompileResult<Module> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        CompileError::build(format!("failed to read '{}': {}", path.display(), e))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        CompileError::build(format!("malformed module AST '{}': {}", path.display(), e))
    })
}

/// Register and compile one module. Returns the group keys that now have
/// up-to-date objects.
pub fn compile_module(
    session: &mut CompilerSession,
    module: &Module,
) -> CompileResult<Vec<GroupKey>> {
    session.register_module(module)?;
    let keys = module_group_keys(session, &module.file);
    for key in &keys {
        ensure_group(session, key)?;
    }
    Ok(keys.into_iter().collect())
}

/// Group keys of a registered module that produce objects (externs,
/// inline functions, and generators compile into their callers)
pub fn module_group_keys(session: &CompilerSession, file: &Path) -> BTreeSet<GroupKey> {
    session
        .functions
        .iter()
        .filter(|f| f.source_file == file && !f.is_extern && !f.is_inline)
        .filter(|f| f.def_ast.as_ref().is_some_and(|d| !d.is_generator()))
        .map(|f| f.group_key.clone())
        .collect()
}

/// Bring one group's object file up to date. The whole
/// cache-check/compile/write cycle runs under the group's advisory file
/// lock; a concurrent builder that wins the race leaves us a cache hit.
pub fn ensure_group(session: &mut CompilerSession, key: &GroupKey) -> CompileResult<()> {
    if session.output.is_up_to_date(key) {
        return Ok(());
    }
    let paths = session.output.paths(key);
    let _lock = FileLock::acquire(&paths.lock)?;

    if !session.output.object_is_stale(key) {
        // Cache hit: restore link dependencies from the persisted record
        let deps = GroupDeps::load(&paths.deps)?;
        debug!(group = %key, "cache hit, restoring deps");
        session.deps.restore_group(deps);
        session.output.mark_up_to_date(key);
        return Ok(());
    }

    let compiled = (|| -> CompileResult<()> {
        let ir = codegen::compile_group(session, key)?;
        session.output.compile_ir(key, &ir, &session.config)?;
        let deps = session
            .deps
            .group(key)
            .cloned()
            .unwrap_or_else(|| GroupDeps::new(key.clone(), mtime_seconds(&key.file)));
        session.output.write_deps(key, &deps)?;
        Ok(())
    })();
    match compiled {
        Ok(()) => {
            info!(group = %key, "compiled");
            session.output.mark_up_to_date(key);
            Ok(())
        }
        Err(e) => {
            // Evict so a later attempt starts from a clean slate
            session.evict_group(key);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        ClassDef, ClassKind, Constant, EffectOverride, EffectScope, Expr, FieldDef, FunctionDef,
        FunctionKind, Item, MatchCase, MatchPattern, Param, Stmt, StmtKind, VariantDef,
    };
    use crate::effects::EffectNamespace;

    fn session() -> CompilerSession {
        CompilerSession::new(CompilerConfig::default())
    }

    fn compiled(name: &str, params: &[(&str, &str)], returns: Option<&str>, body: Vec<Stmt>) -> FunctionDef {
        FunctionDef {
            name: name.to_string(),
            kind: FunctionKind::Compile { suffix: None },
            params: params
                .iter()
                .map(|(n, t)| Param { name: n.to_string(), annotation: Expr::name(*t) })
                .collect(),
            returns: returns.map(Expr::name),
            vararg: false,
            body,
            start_line: 1,
        }
    }

    fn ret(line: u32, value: Expr) -> Stmt {
        Stmt::new(line, StmtKind::Return { value: Some(value) })
    }

    fn expr_stmt(line: u32, value: Expr) -> Stmt {
        Stmt::new(line, StmtKind::Expr { value })
    }

    /// Scenario 1: hello-struct compiles to one module with both functions
    #[test]
    fn test_hello_struct_group() {
        let mut session = session();
        let mut module = Module::new("demo.py");
        module.items.push(Item::Class(ClassDef {
            name: "Point".to_string(),
            kind: ClassKind::Struct,
            fields: vec![
                FieldDef { name: "x".to_string(), annotation: Expr::name("i32") },
                FieldDef { name: "y".to_string(), annotation: Expr::name("i32") },
            ],
            variants: vec![],
            line: 1,
        }));
        module.items.push(Item::Function(compiled(
            "make",
            &[("a", "i32"), ("b", "i32")],
            Some("Point"),
            vec![ret(
                1,
                Expr::call(Expr::name("Point"), vec![Expr::name("a"), Expr::name("b")]),
            )],
        )));
        module.items.push(Item::Function(compiled(
            "sumxy",
            &[("p", "Point")],
            Some("i32"),
            vec![ret(
                1,
                Expr::binop(
                    Expr::attribute(Expr::name("p"), "x"),
                    ast::BinOp::Add,
                    Expr::attribute(Expr::name("p"), "y"),
                ),
            )],
        )));
        session.register_module(&module).unwrap();
        let ir = codegen::compile_group(&mut session, &GroupKey::for_file("demo.py")).unwrap();
        assert!(ir.contains("%Point = type { i32, i32 }"));
        assert!(ir.contains("define %Point @make"));
        assert!(ir.contains("define i32 @sumxy"));
    }

    /// Scenario 2: a token consumed exactly once passes; a leaked one is a
    /// LinearError at the function's exit
    #[test]
    fn test_linear_token_exactness() {
        let take = compiled(
            "take",
            &[("t", "linear")],
            None,
            vec![expr_stmt(
                1,
                Expr::call(Expr::name("consume"), vec![Expr::name("t")]),
            )],
        );
        let ok_main = compiled(
            "main",
            &[],
            None,
            vec![
                Stmt::new(
                    1,
                    StmtKind::Assign {
                        targets: vec![Expr::name("t")],
                        value: Expr::call(Expr::name("linear"), vec![]),
                    },
                ),
                expr_stmt(2, Expr::call(Expr::name("take"), vec![Expr::name("t")])),
            ],
        );

        let mut ok_session = session();
        let mut module = Module::new("demo.py");
        module.items.push(Item::Function(take.clone()));
        module.items.push(Item::Function(ok_main));
        ok_session.register_module(&module).unwrap();
        codegen::compile_group(&mut ok_session, &GroupKey::for_file("demo.py")).unwrap();

        // Same module but main never consumes the token
        let leaky_main = compiled(
            "main",
            &[],
            None,
            vec![
                Stmt::new(
                    1,
                    StmtKind::Assign {
                        targets: vec![Expr::name("t")],
                        value: Expr::call(Expr::name("linear"), vec![]),
                    },
                ),
                Stmt::new(2, StmtKind::Pass),
            ],
        );
        let mut leaky_session = session();
        let mut module = Module::new("demo.py");
        module.items.push(Item::Function(take));
        module.items.push(Item::Function(leaky_main));
        leaky_session.register_module(&module).unwrap();
        let err =
            codegen::compile_group(&mut leaky_session, &GroupKey::for_file("demo.py")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Linear);
        assert!(err.message.contains("unconsumed_at_exit"), "{}", err.message);
    }

    /// Scenario 3: the uncovered variant is named in the error
    #[test]
    fn test_match_exhaustiveness_error() {
        let mut session = session();
        let mut module = Module::new("demo.py");
        module.items.push(Item::Class(ClassDef {
            name: "Status".to_string(),
            kind: ClassKind::Enum,
            fields: vec![],
            variants: vec![
                VariantDef {
                    name: "Ok".to_string(),
                    payload: Some(Expr::name("i32")),
                    tag: None,
                },
                VariantDef {
                    name: "Err".to_string(),
                    payload: Some(Expr::name("i32")),
                    tag: None,
                },
            ],
            line: 1,
        }));
        module.items.push(Item::Function(compiled(
            "explain",
            &[("s", "Status")],
            Some("i32"),
            vec![Stmt::new(
                1,
                StmtKind::Match {
                    subject: Expr::name("s"),
                    cases: vec![MatchCase {
                        pattern: MatchPattern::Sequence(vec![
                            MatchPattern::Value {
                                path: vec!["Status".to_string(), "Ok".to_string()],
                            },
                            MatchPattern::Wildcard { binding: Some("n".to_string()) },
                        ]),
                        guard: None,
                        body: vec![ret(2, Expr::name("n"))],
                    }],
                },
            )],
        )));
        session.register_module(&module).unwrap();
        let err = codegen::compile_group(&mut session, &GroupKey::for_file("demo.py")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exhaustiveness);
        assert!(err.message.contains("(Status.Err, _)"), "{}", err.message);
    }

    /// Scenario 4: yield inlining - no call to the generator survives, the
    /// loop runs natively in the caller
    #[test]
    fn test_yield_inlining_emits_no_call() {
        let mut session = session();
        let mut module = Module::new("demo.py");
        module.items.push(Item::Function(compiled(
            "gen",
            &[],
            Some("i32"),
            vec![Stmt::new(
                1,
                StmtKind::For {
                    target: Expr::name("i"),
                    iter: Expr::call(Expr::name("seq"), vec![Expr::int(0), Expr::int(10)]),
                    body: vec![expr_stmt(
                        2,
                        Expr::Yield { value: Some(Box::new(Expr::name("i"))) },
                    )],
                },
            )],
        )));
        module.items.push(Item::Function(compiled(
            "first_even",
            &[],
            Some("i32"),
            vec![Stmt::new(
                1,
                StmtKind::For {
                    target: Expr::name("x"),
                    iter: Expr::call(Expr::name("gen"), vec![]),
                    body: vec![Stmt::new(
                        2,
                        StmtKind::If {
                            test: Expr::Compare {
                                left: Box::new(Expr::binop(
                                    Expr::name("x"),
                                    ast::BinOp::Mod,
                                    Expr::int(2),
                                )),
                                ops: vec![ast::CmpOp::Eq],
                                comparators: vec![Expr::int(0)],
                            },
                            body: vec![ret(3, Expr::name("x"))],
                            orelse: vec![],
                        },
                    )],
                },
            )],
        )));
        session.register_module(&module).unwrap();
        let ir = codegen::compile_group(&mut session, &GroupKey::for_file("demo.py")).unwrap();
        assert!(ir.contains("define i32 @first_even"));
        // The generator inlines away completely
        assert!(!ir.contains("@gen"), "generator must not be called:\n{}", ir);
        assert!(ir.contains("for_header"));
    }

    /// Scenario 5: effect override with transitive propagation - the
    /// suffixed caller and the suffixed copy of its callee land in one
    /// group, and the deps record the effect
    #[test]
    fn test_effect_override_transitive_propagation() {
        let mut session = session();
        session.effects.register_namespace(
            EffectNamespace::new("libc_mem")
                .with_function("malloc", "demo.counting_malloc")
                .with_function("free", "demo.counting_free"),
        );
        session.effects.register_namespace(
            EffectNamespace::new("counting_mem")
                .with_function("malloc", "demo.counting_malloc")
                .with_function("free", "demo.counting_free"),
        );
        session.effects.set_default("mem", "libc_mem");

        let mut module = Module::new("demo.py");
        for (name, param, returns) in [
            ("counting_malloc", ("n", "u64"), Some("ptr[void]")),
            ("counting_free", ("p", "ptr[void]"), None),
        ] {
            let annotation = if param.1.contains('[') {
                Expr::subscript(Expr::name("ptr"), Expr::name("void"))
            } else {
                Expr::name(param.1)
            };
            module.items.push(Item::Function(FunctionDef {
                name: name.to_string(),
                kind: FunctionKind::Extern {
                    libs: vec!["tracemem".to_string()],
                    objects: vec![],
                    calling_convention: None,
                },
                params: vec![Param { name: param.0.to_string(), annotation }],
                returns: returns.map(|r| {
                    if r.contains('[') {
                        Expr::subscript(Expr::name("ptr"), Expr::name("void"))
                    } else {
                        Expr::name(r)
                    }
                }),
                vararg: false,
                body: vec![],
                start_line: 1,
            }));
        }
        // g reaches effect.mem directly
        module.items.push(Item::Function(compiled(
            "g",
            &[("n", "u64")],
            None,
            vec![
                Stmt::new(
                    1,
                    StmtKind::Assign {
                        targets: vec![Expr::name("p")],
                        value: Expr::call(
                            Expr::attribute(Expr::attribute(Expr::name("effect"), "mem"), "malloc"),
                            vec![Expr::name("n")],
                        ),
                    },
                ),
                expr_stmt(
                    2,
                    Expr::call(
                        Expr::attribute(Expr::attribute(Expr::name("effect"), "mem"), "free"),
                        vec![Expr::name("p")],
                    ),
                ),
            ],
        )));
        // f is compiled under the override context and calls g
        module.items.push(Item::EffectScope(EffectScope {
            overrides: vec![EffectOverride {
                effect: "mem".to_string(),
                namespace: "counting_mem".to_string(),
            }],
            suffix: Some("cnt".to_string()),
            items: vec![Item::Function(compiled(
                "f",
                &[("n", "u64")],
                None,
                vec![expr_stmt(1, Expr::call(Expr::name("g"), vec![Expr::name("n")]))],
            ))],
            line: 1,
        }));
        session.register_module(&module).unwrap();

        let key = GroupKey {
            file: "demo.py".into(),
            scope: None,
            compile_suffix: None,
            effect_suffix: Some("cnt".to_string()),
        };
        let ir = codegen::compile_group(&mut session, &key).unwrap();
        assert!(ir.contains("define void @f_cnt"));
        assert!(ir.contains("define void @g_cnt"), "co-located specialization:\n{}", ir);
        let deps = session.deps.group(&key).unwrap();
        assert!(deps.effects_used.contains(&"mem".to_string()));
        assert!(deps.link_libraries.contains(&"tracemem".to_string()));
    }

    /// Scenario 6: defer + goto_end unwinds label scope then function scope
    #[test]
    fn test_defer_goto_unwind_order() {
        let mut session = session();
        let mut module = Module::new("demo.py");
        for name in ["log_end", "log_cleanup", "do_work"] {
            module
                .items
                .push(Item::Function(compiled(name, &[], None, vec![Stmt::new(1, StmtKind::Pass)])));
        }
        module.items.push(Item::Function(compiled(
            "check_error",
            &[],
            Some("bool"),
            vec![ret(1, Expr::Constant(Constant::Bool(false)))],
        )));
        module.items.push(Item::Function(compiled(
            "run",
            &[],
            Some("i32"),
            vec![
                expr_stmt(1, Expr::call(Expr::name("defer"), vec![Expr::name("log_end")])),
                Stmt::new(
                    2,
                    StmtKind::With {
                        context: Expr::call(Expr::name("label"), vec![Expr::string("main")]),
                        target: None,
                        body: vec![
                            expr_stmt(
                                3,
                                Expr::call(Expr::name("defer"), vec![Expr::name("log_cleanup")]),
                            ),
                            Stmt::new(
                                4,
                                StmtKind::If {
                                    test: Expr::call(Expr::name("check_error"), vec![]),
                                    body: vec![expr_stmt(
                                        5,
                                        Expr::call(
                                            Expr::name("goto_end"),
                                            vec![Expr::string("main")],
                                        ),
                                    )],
                                    orelse: vec![],
                                },
                            ),
                            expr_stmt(6, Expr::call(Expr::name("do_work"), vec![])),
                        ],
                    },
                ),
                ret(7, Expr::int(0)),
            ],
        )));
        session.register_module(&module).unwrap();
        let ir = codegen::compile_group(&mut session, &GroupKey::for_file("demo.py")).unwrap();

        let run_ir = ir.split("define i32 @run").nth(1).expect("run function present");
        // Both the goto_end path and the fallthrough run the label-scope
        // defer; the function-scope defer runs once before the return
        assert_eq!(run_ir.matches("call void @log_cleanup").count(), 2, "{}", run_ir);
        assert_eq!(run_ir.matches("call void @log_end").count(), 1);
        // The goto_end path unwinds the label scope before jumping
        assert!(
            run_ir.contains("call void @log_cleanup()\n  br label %L_main_end"),
            "{}",
            run_ir
        );
        // After the label block, the function-scope defer runs before the
        // return (both live in the L_main_end block)
        let end_block = run_ir
            .split("L_main_end:")
            .nth(1)
            .expect("end block present");
        let end_block = end_block.split("\n\n").next().unwrap_or(end_block);
        let end_pos = end_block.find("call void @log_end").expect("log_end in end block");
        let ret_pos = end_block.find("ret i32 0").expect("return in end block");
        assert!(end_pos < ret_pos);
    }

    /// Decay property: subscripting an array goes through its decayed
    /// pointer form, qualifiers preserved
    #[test]
    fn test_array_subscript_and_const_store() {
        let mut session = session();
        let mut module = Module::new("demo.py");
        module.items.push(Item::Function(compiled(
            "sum3",
            &[],
            Some("i32"),
            vec![
                Stmt::new(
                    1,
                    StmtKind::AnnAssign {
                        target: Expr::name("a"),
                        annotation: Expr::subscript(
                            Expr::name("array"),
                            Expr::Tuple(vec![Expr::name("i32"), Expr::int(3)]),
                        ),
                        value: Some(Expr::call(
                            Expr::subscript(
                                Expr::name("array"),
                                Expr::Tuple(vec![Expr::name("i32"), Expr::int(3)]),
                            ),
                            vec![],
                        )),
                    },
                ),
                Stmt::new(
                    2,
                    StmtKind::Assign {
                        targets: vec![Expr::subscript(Expr::name("a"), Expr::int(0))],
                        value: Expr::int(7),
                    },
                ),
                ret(3, Expr::subscript(Expr::name("a"), Expr::int(0))),
            ],
        )));
        session.register_module(&module).unwrap();
        let ir = codegen::compile_group(&mut session, &GroupKey::for_file("demo.py")).unwrap();
        assert!(ir.contains("getelementptr [3 x i32]"));

        // Writing through a const location is rejected
        let mut const_session = CompilerSession::new(CompilerConfig::default());
        let mut module = Module::new("demo.py");
        module.items.push(Item::Function(compiled(
            "poke",
            &[("p", "i32")],
            None,
            vec![
                Stmt::new(
                    1,
                    StmtKind::AnnAssign {
                        target: Expr::name("c"),
                        annotation: Expr::subscript(Expr::name("const"), Expr::name("i32")),
                        value: Some(Expr::int(1)),
                    },
                ),
                Stmt::new(
                    2,
                    StmtKind::Assign {
                        targets: vec![Expr::name("c")],
                        value: Expr::int(2),
                    },
                ),
            ],
        )));
        const_session.register_module(&module).unwrap();
        let err = codegen::compile_group(&mut const_session, &GroupKey::for_file("demo.py"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConstQualifier);
    }

    /// Branch-divergent consumption is a merge error with a per-path diff
    #[test]
    fn test_branch_divergent_linearity_rejected() {
        let mut session = session();
        let mut module = Module::new("demo.py");
        module.items.push(Item::Function(compiled(
            "maybe_take",
            &[("t", "linear"), ("c", "bool")],
            None,
            vec![Stmt::new(
                1,
                StmtKind::If {
                    test: Expr::name("c"),
                    body: vec![expr_stmt(
                        2,
                        Expr::call(Expr::name("consume"), vec![Expr::name("t")]),
                    )],
                    orelse: vec![],
                },
            )],
        )));
        session.register_module(&module).unwrap();
        let err = codegen::compile_group(&mut session, &GroupKey::for_file("demo.py")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Linear);
        assert!(err.message.contains("merge_inconsistent"), "{}", err.message);
    }

    /// Cache idempotence: the second ensure_group on an unchanged source
    /// is a no-op cache hit (observable through the up-to-date index)
    #[test]
    fn test_group_cache_hit_restores_deps() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("demo.py");
        std::fs::write(&source, "# source").unwrap();

        let key = GroupKey::for_file(&source);
        let mut deps = GroupDeps::new(key.clone(), mtime_seconds(&source));
        deps.link_libraries.push("m".to_string());

        let config = CompilerConfig::default().with_build_dir(dir.path().join("build"));
        let mut session = CompilerSession::new(config);
        let paths = session.output.paths(&key);
        std::fs::create_dir_all(paths.object.parent().unwrap()).unwrap();
        std::fs::write(&paths.object, b"obj").unwrap();
        build::output::atomic_write(&paths.deps, deps.to_json().unwrap().as_bytes()).unwrap();

        ensure_group(&mut session, &key).unwrap();
        assert!(session.output.is_up_to_date(&key));
        // Link flags came back from the .deps file without recompiling
        let restored = session.deps.group(&key).unwrap();
        assert_eq!(restored.link_libraries, vec!["m".to_string()]);
    }
}
