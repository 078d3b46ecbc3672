//! Incremental build graph: dependency tracking and artifact management

pub mod deps;
pub mod output;

pub use deps::{CallableDep, DependencyTracker, GroupDeps, GroupKey, DEPS_VERSION};
pub use output::{FileLock, GroupPaths, OutputManager};
