//! Dynamic loader
//!
//! Loads the shared libraries a target function needs, in dependency
//! order, and exposes callables to the host. Circular dependencies are
//! tolerated: libraries are opened with `RTLD_LAZY | RTLD_GLOBAL` in
//! post-order, and a library that fails to open is retried after the rest
//! of the closure has been mapped; only a second-pass failure surfaces as
//! a build error.
//!
//! Handles are cached per path with the file's mtime; a newer file on disk
//! invalidates the cached handle and every function handle derived from
//! it, so reloads are monotonic.

use crate::build::deps::{GroupDeps, GroupKey};
use crate::build::output::mtime_seconds;
use crate::error::{CompileError, CompileResult};
use crate::registry::FunctionInfo;
use crate::session::CompilerSession;
use crate::types::Type;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::{c_void, CString};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Scalar values the dynamic dispatcher can marshal
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    Int(i64),
    Float(f64),
    Void,
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::Int(v) => write!(f, "{}", v),
            ScalarValue::Float(v) => write!(f, "{}", v),
            ScalarValue::Void => write!(f, "()"),
        }
    }
}

struct LoadedLib {
    handle: *mut c_void,
    mtime: f64,
}

/// Multi-library loader with cycle-tolerant resolution
#[derive(Default)]
pub struct Loader {
    libs: HashMap<PathBuf, LoadedLib>,
    /// mangled name -> (library path, raw symbol address)
    symbols: HashMap<String, (PathBuf, *mut c_void)>,
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link (if stale) and load the transitive closure of shared libraries
    /// reachable from `entry`, in dependency post-order.
    pub fn prepare(&mut self, session: &mut CompilerSession, entry: &GroupKey) -> CompileResult<()> {
        let closure = self.dependency_closure(session, entry)?;
        let order = post_order(&closure, entry);

        // Relink any stale library first so dlopen sees current code
        for key in &order {
            let paths = session.output.paths(key);
            let deps = closure
                .get(key)
                .cloned()
                .unwrap_or_else(|| GroupDeps::new(key.clone(), 0.0));
            let extra: Vec<PathBuf> = deps.link_objects.iter().map(PathBuf::from).collect();
            if session.output.shared_lib_is_stale(&paths, &extra) {
                let _lock = crate::build::output::FileLock::acquire(&paths.lock)?;
                if session.output.shared_lib_is_stale(&paths, &extra) {
                    session.output.link_shared_lib(key, &deps, &session.config)?;
                }
            }
        }

        // First pass: lazy open in post-order; keep failures for a retry
        // once the rest of the closure is mapped (circular pairs)
        let mut failed: Vec<(PathBuf, String)> = Vec::new();
        for key in &order {
            let lib = session.output.paths(key).shared_lib;
            if let Err(e) = self.open(&lib) {
                failed.push((lib, e.to_string()));
            }
        }
        for (lib, first_error) in failed {
            self.open(&lib).map_err(|_| {
                CompileError::build(format!(
                    "failed to load '{}' after retry: {}",
                    lib.display(),
                    first_error
                ))
            })?;
        }
        Ok(())
    }

    fn dependency_closure(
        &self,
        session: &CompilerSession,
        entry: &GroupKey,
    ) -> CompileResult<BTreeMap<GroupKey, GroupDeps>> {
        let mut closure: BTreeMap<GroupKey, GroupDeps> = BTreeMap::new();
        let mut work = vec![entry.clone()];
        while let Some(key) = work.pop() {
            if closure.contains_key(&key) {
                continue;
            }
            let deps = match session.deps.group(&key) {
                Some(deps) => deps.clone(),
                None => {
                    let path = session.output.paths(&key).deps;
                    GroupDeps::load(&path)?
                }
            };
            for dep in deps.dependent_groups() {
                work.push(dep);
            }
            closure.insert(key, deps);
        }
        Ok(closure)
    }

    /// Open (or refresh) one library handle
    fn open(&mut self, path: &Path) -> CompileResult<*mut c_void> {
        let mtime = mtime_seconds(path);
        if let Some(lib) = self.libs.get(path) {
            if (lib.mtime - mtime).abs() < f64::EPSILON {
                return Ok(lib.handle);
            }
            // File changed on disk: drop every symbol derived from the
            // stale handle before reopening
            debug!(lib = %path.display(), "library changed, invalidating handle");
            self.symbols.retain(|_, (lib_path, _)| lib_path != path);
            let stale = self.libs.remove(path).expect("present");
            unsafe {
                libc::dlclose(stale.handle);
            }
        }
        let c_path = CString::new(path.to_string_lossy().into_owned())
            .map_err(|_| CompileError::build("library path contains a NUL byte"))?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_LAZY | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            return Err(CompileError::build(format!(
                "dlopen('{}') failed: {}",
                path.display(),
                dlerror_string()
            )));
        }
        self.libs
            .insert(path.to_path_buf(), LoadedLib { handle, mtime });
        debug!(lib = %path.display(), "loaded shared library");
        Ok(handle)
    }

    /// Raw address of a mangled symbol, searching every loaded library
    pub fn symbol_address(&mut self, mangled: &str) -> CompileResult<*mut c_void> {
        if let Some((_, addr)) = self.symbols.get(mangled) {
            return Ok(*addr);
        }
        let c_name = CString::new(mangled)
            .map_err(|_| CompileError::build("symbol name contains a NUL byte"))?;
        for (path, lib) in &self.libs {
            let addr = unsafe { libc::dlsym(lib.handle, c_name.as_ptr()) };
            if !addr.is_null() {
                self.symbols
                    .insert(mangled.to_string(), (path.clone(), addr));
                return Ok(addr);
            }
        }
        Err(CompileError::build(format!(
            "symbol '{}' not found in any loaded library",
            mangled
        )))
    }

    /// Typed symbol lookup. `F` must be the `extern "C"` fn type matching
    /// the recorded signature; arity is validated against the registry
    /// entry before the cast.
    ///
    /// # Safety
    ///
    /// The caller asserts `F` matches the native signature beyond arity
    /// (argument and return types).
    pub unsafe fn symbol<F: Copy>(&mut self, info: &FunctionInfo) -> CompileResult<F> {
        assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*mut c_void>(),
            "F must be a fn pointer type"
        );
        let addr = self.symbol_address(&info.mangled_name)?;
        Ok(unsafe { std::mem::transmute_copy::<*mut c_void, F>(&addr) })
    }

    /// ctypes-style scalar dispatch for host-side calls: integer and
    /// float arguments, scalar return. Linear parameters are zero-sized
    /// at the ABI and must already be omitted from `args`.
    pub fn call_scalar(
        &mut self,
        info: &FunctionInfo,
        args: &[ScalarValue],
    ) -> CompileResult<ScalarValue> {
        let abi_params: Vec<&Type> = info
            .param_types
            .iter()
            .filter(|t| !t.is_linear())
            .collect();
        if abi_params.len() != args.len() {
            return Err(CompileError::build(format!(
                "'{}' takes {} ABI arguments, got {}",
                info.qualified_name,
                abi_params.len(),
                args.len()
            )));
        }
        for (ty, value) in abi_params.iter().zip(args.iter()) {
            let ok = match value {
                ScalarValue::Int(_) => ty.is_integer() || ty.unwrapped() == &Type::Bool,
                ScalarValue::Float(_) => ty.is_float(),
                ScalarValue::Void => false,
            };
            if !ok {
                return Err(CompileError::build(format!(
                    "argument {} does not match parameter type '{}'",
                    value, ty
                )));
            }
        }
        if args.iter().any(|a| matches!(a, ScalarValue::Float(_))) {
            return Err(CompileError::build(
                "float arguments are not supported by the scalar dispatcher; \
                 use the typed symbol API",
            ));
        }
        let addr = self.symbol_address(&info.mangled_name)?;
        let ints: Vec<i64> = args
            .iter()
            .map(|a| match a {
                ScalarValue::Int(v) => *v,
                _ => 0,
            })
            .collect();

        let ret = info.return_type.clone();
        // Integer-register calls: every argument rides in an i64 slot,
        // which matches the C ABI for all integer widths here
        if ret.is_float() {
            let value = unsafe { call_ret_f64(addr, &ints)? };
            return Ok(ScalarValue::Float(value));
        }
        let raw = unsafe { call_ret_i64(addr, &ints)? };
        if ret.is_void() {
            Ok(ScalarValue::Void)
        } else {
            Ok(ScalarValue::Int(truncate(raw, &ret)))
        }
    }
}

/// Call a native function with all-integer arguments, reading an i64
/// return register. Callers with void functions discard the result.
unsafe fn call_ret_i64(addr: *mut c_void, a: &[i64]) -> CompileResult<i64> {
    unsafe {
        Ok(match a {
            [] => std::mem::transmute::<_, extern "C" fn() -> i64>(addr)(),
            [x0] => std::mem::transmute::<_, extern "C" fn(i64) -> i64>(addr)(*x0),
            [x0, x1] => std::mem::transmute::<_, extern "C" fn(i64, i64) -> i64>(addr)(*x0, *x1),
            [x0, x1, x2] => {
                std::mem::transmute::<_, extern "C" fn(i64, i64, i64) -> i64>(addr)(*x0, *x1, *x2)
            }
            [x0, x1, x2, x3] => std::mem::transmute::<_, extern "C" fn(i64, i64, i64, i64) -> i64>(
                addr,
            )(*x0, *x1, *x2, *x3),
            [x0, x1, x2, x3, x4] => std::mem::transmute::<
                _,
                extern "C" fn(i64, i64, i64, i64, i64) -> i64,
            >(addr)(*x0, *x1, *x2, *x3, *x4),
            [x0, x1, x2, x3, x4, x5] => std::mem::transmute::<
                _,
                extern "C" fn(i64, i64, i64, i64, i64, i64) -> i64,
            >(addr)(*x0, *x1, *x2, *x3, *x4, *x5),
            _ => {
                return Err(CompileError::build(format!(
                    "scalar dispatcher supports up to 6 arguments, got {}",
                    a.len()
                )));
            }
        })
    }
}

unsafe fn call_ret_f64(addr: *mut c_void, a: &[i64]) -> CompileResult<f64> {
    unsafe {
        Ok(match a {
            [] => std::mem::transmute::<_, extern "C" fn() -> f64>(addr)(),
            [x0] => std::mem::transmute::<_, extern "C" fn(i64) -> f64>(addr)(*x0),
            [x0, x1] => std::mem::transmute::<_, extern "C" fn(i64, i64) -> f64>(addr)(*x0, *x1),
            [x0, x1, x2] => {
                std::mem::transmute::<_, extern "C" fn(i64, i64, i64) -> f64>(addr)(*x0, *x1, *x2)
            }
            _ => {
                return Err(CompileError::build(
                    "float-returning dispatch supports up to 3 arguments",
                ));
            }
        })
    }
}

/// Narrow a raw i64 return to the declared width so sign bits are right
fn truncate(raw: i64, ty: &Type) -> i64 {
    match ty.unwrapped() {
        Type::Int { width: 8, signed: true } => raw as i8 as i64,
        Type::Int { width: 16, signed: true } => raw as i16 as i64,
        Type::Int { width: 32, signed: true } => raw as i32 as i64,
        Type::Int { width: 8, signed: false } => raw as u8 as i64,
        Type::Int { width: 16, signed: false } => raw as u16 as i64,
        Type::Int { width: 32, signed: false } => raw as u32 as i64,
        Type::Bool => i64::from(raw != 0),
        _ => raw,
    }
}

fn dlerror_string() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dlopen error".to_string()
    } else {
        unsafe { std::ffi::CStr::from_ptr(err) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Dependency post-order: leaves first, entry last. Cycles are broken at
/// the first revisited node, which is exactly the tolerance the lazy
/// loader needs.
fn post_order(closure: &BTreeMap<GroupKey, GroupDeps>, entry: &GroupKey) -> Vec<GroupKey> {
    let mut order = Vec::new();
    let mut visited = BTreeSet::new();
    fn visit(
        key: &GroupKey,
        closure: &BTreeMap<GroupKey, GroupDeps>,
        visited: &mut BTreeSet<GroupKey>,
        order: &mut Vec<GroupKey>,
    ) {
        if !visited.insert(key.clone()) {
            return;
        }
        if let Some(deps) = closure.get(key) {
            for dep in deps.dependent_groups() {
                visit(&dep, closure, visited, order);
            }
        }
        order.push(key.clone());
    }
    visit(entry, closure, &mut visited, &mut order);
    // Closure members not reachable from entry (shouldn't happen) still load
    for key in closure.keys() {
        visit(key, closure, &mut visited, &mut order);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> GroupKey {
        GroupKey::for_file(format!("{}.py", name))
    }

    fn deps_with(from: &GroupKey, to: &[&GroupKey]) -> GroupDeps {
        let mut deps = GroupDeps::new(from.clone(), 0.0);
        deps.callables.insert(
            "f".to_string(),
            crate::build::deps::CallableDeps {
                deps: to
                    .iter()
                    .map(|k| crate::build::deps::CallableDep {
                        name: "g".to_string(),
                        group_key: Some((*k).clone()),
                        extern_: false,
                        link_libraries: vec![],
                        link_objects: vec![],
                    })
                    .collect(),
            },
        );
        deps
    }

    #[test]
    fn test_post_order_leaves_first() {
        let a = key("a");
        let b = key("b");
        let c = key("c");
        let mut closure = BTreeMap::new();
        closure.insert(a.clone(), deps_with(&a, &[&b]));
        closure.insert(b.clone(), deps_with(&b, &[&c]));
        closure.insert(c.clone(), GroupDeps::new(c.clone(), 0.0));
        let order = post_order(&closure, &a);
        assert_eq!(order, vec![c, b, a]);
    }

    #[test]
    fn test_post_order_tolerates_cycles() {
        let a = key("a");
        let b = key("b");
        let mut closure = BTreeMap::new();
        closure.insert(a.clone(), deps_with(&a, &[&b]));
        closure.insert(b.clone(), deps_with(&b, &[&a]));
        let order = post_order(&closure, &a);
        assert_eq!(order.len(), 2);
        assert_eq!(order.last(), Some(&a));
    }

    #[test]
    fn test_truncate_narrows_signed() {
        assert_eq!(truncate(0x1FF, &Type::U8), 0xFF);
        assert_eq!(truncate(0xFF, &Type::I8), -1);
        assert_eq!(truncate(5, &Type::Bool), 1);
        assert_eq!(truncate(-7, &Type::I64), -7);
    }

    #[test]
    fn test_scalar_value_display() {
        assert_eq!(ScalarValue::Int(5).to_string(), "5");
        assert_eq!(ScalarValue::Void.to_string(), "()");
    }
}
