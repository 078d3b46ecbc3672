//! Dependency tracking and `.deps` persistence
//!
//! A compilation group is the set of functions compiled into one object
//! file / shared library, identified by [`GroupKey`]. While a group is
//! being compiled the tracker records every callee each function reaches,
//! plus the link libraries and extra objects externs pull in. The result
//! is serialized as a versioned `.deps` JSON file next to the object so a
//! cache hit can restore link dependencies without recompiling anything.
//!
//! Layered invalidation:
//!     source -> .ll -> .o -> .so -> in-process handle
//! Each layer updates only when its input changes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::{CompileError, CompileResult};

/// Version of the `.deps` file format
pub const DEPS_VERSION: u32 = 1;

/// Identifier for a compilation group.
///
/// Serialized as the 4-element list `[file, scope, compile_suffix,
/// effect_suffix]` (stable `.deps` schema).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    /// Source file path
    pub file: PathBuf,
    /// Scope qualifier for nested compilation scopes
    pub scope: Option<String>,
    /// From `@compile(suffix=...)`
    pub compile_suffix: Option<String>,
    /// From `with effect(suffix=...)`
    pub effect_suffix: Option<String>,
}

impl GroupKey {
    pub fn for_file(file: impl Into<PathBuf>) -> Self {
        GroupKey {
            file: file.into(),
            scope: None,
            compile_suffix: None,
            effect_suffix: None,
        }
    }

    pub fn with_effect_suffix(mut self, suffix: Option<String>) -> Self {
        self.effect_suffix = suffix;
        self
    }

    /// Base name for this group's build artifacts:
    /// `<stem>[.scope][.compile_suffix][.effect_suffix]`
    pub fn artifact_stem(&self) -> String {
        let mut stem = self
            .file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());
        for part in [&self.scope, &self.compile_suffix, &self.effect_suffix]
            .into_iter()
            .flatten()
        {
            stem.push('.');
            stem.push_str(part);
        }
        stem
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file.display())?;
        for part in [&self.scope, &self.compile_suffix, &self.effect_suffix]
            .into_iter()
            .flatten()
        {
            write!(f, ".{}", part)?;
        }
        Ok(())
    }
}

impl Serialize for GroupKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.file, &self.scope, &self.compile_suffix, &self.effect_suffix).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for GroupKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        type Raw = (PathBuf, Option<String>, Option<String>, Option<String>);
        let (file, scope, compile_suffix, effect_suffix) = Raw::deserialize(deserializer)?;
        Ok(GroupKey { file, scope, compile_suffix, effect_suffix })
    }
}

/// One callee a compiled function depends on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallableDep {
    /// Mangled callee name
    pub name: String,
    /// Group the callee lives in; `None` for externs
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub group_key: Option<GroupKey>,
    /// True for extern declarations resolved at link time
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub extern_: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub link_libraries: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub link_objects: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallableDeps {
    pub deps: Vec<CallableDep>,
}

/// Persisted dependency record for one compilation group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDeps {
    pub version: u32,
    pub group_key: GroupKey,
    /// mtime of the source file when the group was compiled (seconds)
    pub source_mtime: f64,
    /// mangled function name -> its callee list
    pub callables: BTreeMap<String, CallableDeps>,
    pub link_objects: Vec<String>,
    pub link_libraries: Vec<String>,
    pub effects_used: Vec<String>,
}

impl GroupDeps {
    pub fn new(group_key: GroupKey, source_mtime: f64) -> Self {
        GroupDeps {
            version: DEPS_VERSION,
            group_key,
            source_mtime,
            callables: BTreeMap::new(),
            link_objects: Vec::new(),
            link_libraries: Vec::new(),
            effects_used: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> CompileResult<GroupDeps> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CompileError::build(format!("failed to read deps file '{}': {}", path.display(), e))
        })?;
        let deps: GroupDeps = serde_json::from_str(&text).map_err(|e| {
            CompileError::build(format!("malformed deps file '{}': {}", path.display(), e))
        })?;
        if deps.version != DEPS_VERSION {
            return Err(CompileError::build(format!(
                "deps file '{}' has unsupported version {}",
                path.display(),
                deps.version
            )));
        }
        Ok(deps)
    }

    pub fn to_json(&self) -> CompileResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CompileError::build(format!("failed to serialize deps: {}", e)))
    }

    /// Groups this group links against (direct dependencies)
    pub fn dependent_groups(&self) -> BTreeSet<GroupKey> {
        let mut groups = BTreeSet::new();
        for callable in self.callables.values() {
            for dep in &callable.deps {
                if let Some(key) = &dep.group_key {
                    if *key != self.group_key {
                        groups.insert(key.clone());
                    }
                }
            }
        }
        groups
    }
}

/// In-memory dependency tracker for groups being compiled in this process
#[derive(Debug, Default)]
pub struct DependencyTracker {
    groups: BTreeMap<GroupKey, GroupDeps>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        DependencyTracker { groups: BTreeMap::new() }
    }

    pub fn begin_group(&mut self, key: GroupKey, source_mtime: f64) {
        self.groups
            .entry(key.clone())
            .or_insert_with(|| GroupDeps::new(key, source_mtime));
    }

    /// Record that `caller` (mangled, in `group`) depends on `dep`
    pub fn record_call(&mut self, group: &GroupKey, caller: &str, dep: CallableDep) {
        let Some(entry) = self.groups.get_mut(group) else {
            return;
        };
        for lib in &dep.link_libraries {
            if !entry.link_libraries.contains(lib) {
                entry.link_libraries.push(lib.clone());
            }
        }
        for obj in &dep.link_objects {
            if !entry.link_objects.contains(obj) {
                entry.link_objects.push(obj.clone());
            }
        }
        let callable = entry.callables.entry(caller.to_string()).or_default();
        if !callable.deps.contains(&dep) {
            callable.deps.push(dep);
        }
    }

    pub fn record_effect_use(&mut self, group: &GroupKey, effect: &str) {
        if let Some(entry) = self.groups.get_mut(group) {
            if !entry.effects_used.iter().any(|e| e == effect) {
                entry.effects_used.push(effect.to_string());
            }
        }
    }

    pub fn group(&self, key: &GroupKey) -> Option<&GroupDeps> {
        self.groups.get(key)
    }

    /// Replace the in-memory record with one reloaded from disk (cache hit)
    pub fn restore_group(&mut self, deps: GroupDeps) {
        self.groups.insert(deps.group_key.clone(), deps);
    }

    /// Drop a group after a failed compilation so a retry starts fresh
    pub fn evict_group(&mut self, key: &GroupKey) {
        self.groups.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> GroupKey {
        GroupKey::for_file("pkg/mod.py")
    }

    #[test]
    fn test_artifact_stem_plain() {
        assert_eq!(key().artifact_stem(), "mod");
    }

    #[test]
    fn test_artifact_stem_with_suffixes() {
        let k = GroupKey {
            file: PathBuf::from("pkg/mod.py"),
            scope: None,
            compile_suffix: Some("i32".to_string()),
            effect_suffix: Some("cnt".to_string()),
        };
        assert_eq!(k.artifact_stem(), "mod.i32.cnt");
    }

    #[test]
    fn test_group_key_serializes_as_list() {
        let k = GroupKey {
            file: PathBuf::from("pkg/mod.py"),
            scope: None,
            compile_suffix: None,
            effect_suffix: Some("cnt".to_string()),
        };
        let json = serde_json::to_string(&k).unwrap();
        assert_eq!(json, r#"["pkg/mod.py",null,null,"cnt"]"#);
        let back: GroupKey = serde_json::from_str(&json).unwrap();
        assert_eq!(k, back);
    }

    #[test]
    fn test_deps_json_roundtrip() {
        let mut deps = GroupDeps::new(key(), 1234.5);
        deps.callables.insert(
            "f".to_string(),
            CallableDeps {
                deps: vec![CallableDep {
                    name: "malloc".to_string(),
                    group_key: None,
                    extern_: true,
                    link_libraries: vec!["c".to_string()],
                    link_objects: vec![],
                }],
            },
        );
        deps.effects_used.push("mem".to_string());
        let json = deps.to_json().unwrap();
        let back: GroupDeps = serde_json::from_str(&json).unwrap();
        assert_eq!(deps, back);
        assert_eq!(back.version, DEPS_VERSION);
    }

    #[test]
    fn test_tracker_merges_link_libraries() {
        let mut tracker = DependencyTracker::new();
        tracker.begin_group(key(), 0.0);
        let dep = CallableDep {
            name: "puts".to_string(),
            group_key: None,
            extern_: true,
            link_libraries: vec!["c".to_string()],
            link_objects: vec![],
        };
        tracker.record_call(&key(), "f", dep.clone());
        tracker.record_call(&key(), "g", dep);
        let group = tracker.group(&key()).unwrap();
        assert_eq!(group.link_libraries, vec!["c".to_string()]);
        assert_eq!(group.callables.len(), 2);
    }

    #[test]
    fn test_dependent_groups_excludes_self_and_externs() {
        let mut deps = GroupDeps::new(key(), 0.0);
        let other = GroupKey::for_file("pkg/other.py");
        deps.callables.insert(
            "f".to_string(),
            CallableDeps {
                deps: vec![
                    CallableDep {
                        name: "g".to_string(),
                        group_key: Some(key()),
                        extern_: false,
                        link_libraries: vec![],
                        link_objects: vec![],
                    },
                    CallableDep {
                        name: "h".to_string(),
                        group_key: Some(other.clone()),
                        extern_: false,
                        link_libraries: vec![],
                        link_objects: vec![],
                    },
                    CallableDep {
                        name: "puts".to_string(),
                        group_key: None,
                        extern_: true,
                        link_libraries: vec![],
                        link_objects: vec![],
                    },
                ],
            },
        );
        let groups = deps.dependent_groups();
        assert_eq!(groups.len(), 1);
        assert!(groups.contains(&other));
    }

    #[test]
    fn test_eviction() {
        let mut tracker = DependencyTracker::new();
        tracker.begin_group(key(), 0.0);
        assert!(tracker.group(&key()).is_some());
        tracker.evict_group(&key());
        assert!(tracker.group(&key()).is_none());
    }
}
