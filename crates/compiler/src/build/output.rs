//! Output manager: build artifacts, locks, invalidation, linking
//!
//! Per-group artifacts live under the build tree, mirroring the source
//! path:
//!
//! ```text
//! build/pkg/mod[.scope][.csuf][.esuf].ll      (optional, PC_SAVE_UNOPT_IR)
//! build/pkg/mod[.scope][.csuf][.esuf].o
//! build/pkg/mod[.scope][.csuf][.esuf].so     (.dylib on macOS)
//! build/pkg/mod[.scope][.csuf][.esuf].deps
//! build/pkg/mod[.scope][.csuf][.esuf].lock
//! ```
//!
//! Every cache-check/compile/write cycle holds an advisory `flock` on the
//! group's `.lock` sentinel so concurrent builds cooperate: the loser of
//! the race re-checks inside the lock and takes the cache hit. All final
//! writes go through `<path>.tmp.<pid>` + rename.

use crate::build::deps::{GroupDeps, GroupKey};
use crate::config::{CompilerConfig, OptimizationLevel};
use crate::error::{CompileError, CompileResult};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Minimum clang major version; the generated IR uses opaque pointers
const MIN_CLANG_VERSION: u32 = 15;

static C_DRIVER: OnceLock<Result<String, String>> = OnceLock::new();

/// Locate the platform C driver, preferring clang (it accepts `.ll` input
/// directly). The result is cached for the process.
pub fn find_c_driver() -> CompileResult<String> {
    C_DRIVER
        .get_or_init(|| {
            let output = Command::new("clang").arg("--version").output().map_err(|e| {
                format!(
                    "failed to run clang: {}. Install clang {} or later.",
                    e, MIN_CLANG_VERSION
                )
            })?;
            if !output.status.success() {
                return Err(format!(
                    "clang --version failed with exit code {:?}",
                    output.status.code()
                ));
            }
            let version_str = String::from_utf8_lossy(&output.stdout);
            let version = parse_clang_version(&version_str).ok_or_else(|| {
                format!(
                    "could not parse clang version from: {}",
                    version_str.lines().next().unwrap_or(&version_str)
                )
            })?;
            // Apple clang numbering differs; Apple clang 14 is LLVM 15
            let is_apple = version_str.contains("Apple clang");
            let effective_min = if is_apple { 14 } else { MIN_CLANG_VERSION };
            if version < effective_min {
                return Err(format!(
                    "clang {} detected but {} or later is required (opaque pointers)",
                    version, effective_min
                ));
            }
            Ok("clang".to_string())
        })
        .clone()
        .map_err(CompileError::build)
}

/// Parse the major version from `clang --version` output
fn parse_clang_version(output: &str) -> Option<u32> {
    for line in output.lines() {
        if line.contains("clang version")
            && let Some(idx) = line.find("version ")
        {
            let major: String = line[idx + 8..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if !major.is_empty() {
                return major.parse().ok();
            }
        }
    }
    None
}

/// Platform extension for shared libraries
pub fn shared_lib_extension() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "dylib"
    }
    #[cfg(target_os = "windows")]
    {
        "dll"
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        "so"
    }
}

/// Advisory file lock on a sentinel path. Held for the whole
/// cache-check/compile/link/write cycle of one group; released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: fs::File,
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(path: &Path) -> CompileResult<FileLock> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(CompileError::build(format!(
                    "flock on '{}' failed: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(FileLock { file, path: path.to_path_buf() })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        debug!(lock = %self.path.display(), "released build lock");
    }
}

/// Atomically replace `dst` with `content` via a pid-tagged temp file
pub fn atomic_write(dst: &Path, content: &[u8]) -> CompileResult<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(dst);
    fs::write(&tmp, content)?;
    fs::rename(&tmp, dst)?;
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp.{}", std::process::id()));
    PathBuf::from(tmp)
}

/// Modification time as fractional seconds since the epoch; 0.0 when the
/// file does not exist
pub fn mtime_seconds(path: &Path) -> f64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Resolved artifact paths for one group
#[derive(Debug, Clone)]
pub struct GroupPaths {
    pub unopt_ir: PathBuf,
    pub object: PathBuf,
    pub shared_lib: PathBuf,
    pub deps: PathBuf,
    pub lock: PathBuf,
}

/// Owns the build tree and the per-process record of what was compiled
#[derive(Debug)]
pub struct OutputManager {
    build_dir: PathBuf,
    /// Groups compiled (or cache-verified) by this process
    up_to_date: HashSet<GroupKey>,
}

impl OutputManager {
    pub fn new(build_dir: impl Into<PathBuf>) -> Self {
        OutputManager { build_dir: build_dir.into(), up_to_date: HashSet::new() }
    }

    pub fn paths(&self, key: &GroupKey) -> GroupPaths {
        let rel_dir = key.file.parent().unwrap_or_else(|| Path::new(""));
        let dir = self.build_dir.join(rel_dir);
        let stem = key.artifact_stem();
        GroupPaths {
            unopt_ir: dir.join(format!("{}.ll", stem)),
            object: dir.join(format!("{}.o", stem)),
            shared_lib: dir.join(format!("{}.{}", stem, shared_lib_extension())),
            deps: dir.join(format!("{}.deps", stem)),
            lock: dir.join(format!("{}.lock", stem)),
        }
    }

    pub fn mark_up_to_date(&mut self, key: &GroupKey) {
        self.up_to_date.insert(key.clone());
    }

    pub fn is_up_to_date(&self, key: &GroupKey) -> bool {
        self.up_to_date.contains(key)
    }

    /// Evict a group after a failed compilation so a retry starts fresh
    pub fn evict(&mut self, key: &GroupKey) {
        self.up_to_date.remove(key);
    }

    /// A group needs recompiling when its source is newer than its object
    /// (or the object or deps file is missing)
    pub fn object_is_stale(&self, key: &GroupKey) -> bool {
        let paths = self.paths(key);
        if !paths.object.exists() || !paths.deps.exists() {
            return true;
        }
        mtime_seconds(&key.file) > mtime_seconds(&paths.object)
    }

    /// A shared library needs relinking when any dependent object is newer
    pub fn shared_lib_is_stale(&self, paths: &GroupPaths, extra_objects: &[PathBuf]) -> bool {
        if !paths.shared_lib.exists() {
            return true;
        }
        let lib_mtime = mtime_seconds(&paths.shared_lib);
        if mtime_seconds(&paths.object) > lib_mtime {
            return true;
        }
        extra_objects
            .iter()
            .any(|obj| mtime_seconds(obj) > lib_mtime)
    }

    /// Compile rendered IR into the group's object file. The IR is written
    /// to a temp `.ll`, compiled with the C driver, and the object renamed
    /// into place. With `save_unopt_ir` the pre-optimization IR is kept at
    /// its stable path.
    pub fn compile_ir(
        &self,
        key: &GroupKey,
        ir_text: &str,
        config: &CompilerConfig,
    ) -> CompileResult<PathBuf> {
        let paths = self.paths(key);
        if let Some(parent) = paths.object.parent() {
            fs::create_dir_all(parent)?;
        }
        let ir_path = if config.save_unopt_ir {
            atomic_write(&paths.unopt_ir, ir_text.as_bytes())?;
            paths.unopt_ir.clone()
        } else {
            let tmp = temp_sibling(&paths.unopt_ir);
            fs::write(&tmp, ir_text)?;
            tmp
        };

        let driver = find_c_driver()?;
        let tmp_obj = temp_sibling(&paths.object);
        let output = Command::new(&driver)
            .arg(opt_flag(config.opt_level))
            .arg("-c")
            .arg(&ir_path)
            .arg("-fPIC")
            .arg("-o")
            .arg(&tmp_obj)
            .output()
            .map_err(|e| CompileError::build(format!("failed to run {}: {}", driver, e)))?;
        if !config.save_unopt_ir {
            let _ = fs::remove_file(&ir_path);
        }
        if !output.status.success() {
            let _ = fs::remove_file(&tmp_obj);
            return Err(CompileError::build(format!(
                "object compilation failed:\n{}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        fs::rename(&tmp_obj, &paths.object)?;
        debug!(object = %paths.object.display(), "compiled group object");
        Ok(paths.object)
    }

    /// Link the group's shared library from its object plus recorded link
    /// dependencies. Finalized by atomic rename.
    pub fn link_shared_lib(
        &self,
        key: &GroupKey,
        deps: &GroupDeps,
        config: &CompilerConfig,
    ) -> CompileResult<PathBuf> {
        let paths = self.paths(key);
        if !paths.object.exists() {
            return Err(CompileError::build(format!(
                "missing object file '{}'",
                paths.object.display()
            )));
        }
        let driver = find_c_driver()?;
        let tmp_lib = temp_sibling(&paths.shared_lib);
        let mut cmd = Command::new(&driver);
        cmd.arg(shared_flag()).arg("-o").arg(&tmp_lib).arg(&paths.object);
        // Cross-library symbols resolve lazily at dlopen time; macOS
        // defaults to eager resolution at link time
        #[cfg(target_os = "macos")]
        cmd.arg("-undefined").arg("dynamic_lookup");
        for obj in &deps.link_objects {
            cmd.arg(obj);
        }
        for path in &config.library_paths {
            cmd.arg("-L").arg(path);
        }
        for lib in deps.link_libraries.iter().chain(config.libraries.iter()) {
            if lib.contains('/') || lib.ends_with(".a") || lib.ends_with(".o") {
                cmd.arg(lib);
            } else {
                cmd.arg(format!("-l{}", lib));
            }
        }
        let output = cmd
            .output()
            .map_err(|e| CompileError::build(format!("failed to run {}: {}", driver, e)))?;
        if !output.status.success() {
            let _ = fs::remove_file(&tmp_lib);
            return Err(CompileError::build(format!(
                "link failed:\n{}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        fs::rename(&tmp_lib, &paths.shared_lib)?;
        debug!(lib = %paths.shared_lib.display(), "linked shared library");
        Ok(paths.shared_lib)
    }

    /// Persist the group's `.deps` record
    pub fn write_deps(&self, key: &GroupKey, deps: &GroupDeps) -> CompileResult<()> {
        let paths = self.paths(key);
        atomic_write(&paths.deps, deps.to_json()?.as_bytes())
    }
}

fn opt_flag(level: OptimizationLevel) -> &'static str {
    level.flag()
}

fn shared_flag() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "-dynamiclib"
    }
    #[cfg(not(target_os = "macos"))]
    {
        "-shared"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clang_version_variants() {
        assert_eq!(
            parse_clang_version("clang version 15.0.0 (https://llvm.org)"),
            Some(15)
        );
        assert_eq!(
            parse_clang_version("Apple clang version 14.0.3 (clang-1403.0.22.14.1)"),
            Some(14)
        );
        assert_eq!(
            parse_clang_version("Ubuntu clang version 18.1.3"),
            Some(18)
        );
        assert_eq!(parse_clang_version("no version here"), None);
    }

    #[test]
    fn test_group_paths_mirror_source_tree() {
        let manager = OutputManager::new("build");
        let key = GroupKey {
            file: PathBuf::from("pkg/mod.py"),
            scope: None,
            compile_suffix: None,
            effect_suffix: Some("cnt".to_string()),
        };
        let paths = manager.paths(&key);
        assert_eq!(paths.object, PathBuf::from("build/pkg/mod.cnt.o"));
        assert_eq!(paths.deps, PathBuf::from("build/pkg/mod.cnt.deps"));
        assert_eq!(paths.lock, PathBuf::from("build/pkg/mod.cnt.lock"));
        assert!(paths
            .shared_lib
            .to_string_lossy()
            .starts_with("build/pkg/mod.cnt."));
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.deps");
        atomic_write(&target, b"one").unwrap();
        atomic_write(&target, b"two").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"two");
        // No temp litter left behind
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["out.deps".to_string()]);
    }

    #[test]
    fn test_stale_object_detection() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("mod.py");
        fs::write(&source, "x = 1").unwrap();
        let manager = OutputManager::new(dir.path().join("build"));
        let key = GroupKey::for_file(&source);
        // No object yet: stale
        assert!(manager.object_is_stale(&key));
        let paths = manager.paths(&key);
        fs::create_dir_all(paths.object.parent().unwrap()).unwrap();
        fs::write(&paths.object, b"obj").unwrap();
        fs::write(&paths.deps, b"{}").unwrap();
        // Object newer than source: fresh
        assert!(!manager.object_is_stale(&key));
    }

    #[test]
    fn test_file_lock_acquire_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("group.lock");
        {
            let _lock = FileLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
        }
        // Re-acquirable after drop
        let _again = FileLock::acquire(&lock_path).unwrap();
    }

    #[test]
    fn test_eviction_clears_up_to_date() {
        let mut manager = OutputManager::new("build");
        let key = GroupKey::for_file("mod.py");
        manager.mark_up_to_date(&key);
        assert!(manager.is_up_to_date(&key));
        manager.evict(&key);
        assert!(!manager.is_up_to_date(&key));
    }
}
