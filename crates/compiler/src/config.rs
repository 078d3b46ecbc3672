//! Compiler configuration
//!
//! Built from CLI flags plus the `PC_OPT_LEVEL` and `PC_SAVE_UNOPT_IR`
//! environment variables. The config travels on the session; nothing else
//! reads the environment.

use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationLevel {
    O0,
    O1,
    #[default]
    O2,
    O3,
}

impl OptimizationLevel {
    pub fn from_int(level: i64) -> Self {
        match level {
            i64::MIN..=0 => OptimizationLevel::O0,
            1 => OptimizationLevel::O1,
            2 => OptimizationLevel::O2,
            _ => OptimizationLevel::O3,
        }
    }

    /// Flag understood by the C driver
    pub fn flag(&self) -> &'static str {
        match self {
            OptimizationLevel::O0 => "-O0",
            OptimizationLevel::O1 => "-O1",
            OptimizationLevel::O2 => "-O2",
            OptimizationLevel::O3 => "-O3",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Root of the build tree; artifacts mirror source paths underneath
    pub build_dir: PathBuf,
    pub opt_level: OptimizationLevel,
    /// Also dump pre-optimization IR next to the object file
    pub save_unopt_ir: bool,
    /// Extra `-L` search paths
    pub library_paths: Vec<PathBuf>,
    /// Extra `-l` libraries applied to every link
    pub libraries: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            build_dir: PathBuf::from("build"),
            opt_level: OptimizationLevel::default(),
            save_unopt_ir: false,
            library_paths: Vec::new(),
            libraries: Vec::new(),
        }
    }
}

impl CompilerConfig {
    /// Default config with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = CompilerConfig::default();
        if let Ok(level) = std::env::var("PC_OPT_LEVEL") {
            if let Ok(level) = level.trim().parse::<i64>() {
                config.opt_level = OptimizationLevel::from_int(level);
            }
        }
        if let Ok(value) = std::env::var("PC_SAVE_UNOPT_IR") {
            config.save_unopt_ir = is_truthy(&value);
        }
        config
    }

    pub fn with_build_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_dir = dir.into();
        self
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opt_level_from_int_clamps() {
        assert_eq!(OptimizationLevel::from_int(-3), OptimizationLevel::O0);
        assert_eq!(OptimizationLevel::from_int(0), OptimizationLevel::O0);
        assert_eq!(OptimizationLevel::from_int(2), OptimizationLevel::O2);
        assert_eq!(OptimizationLevel::from_int(9), OptimizationLevel::O3);
    }

    #[test]
    fn test_truthy_parsing() {
        assert!(is_truthy("1"));
        assert!(is_truthy("yes"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn test_default_config() {
        let config = CompilerConfig::default();
        assert_eq!(config.build_dir, PathBuf::from("build"));
        assert_eq!(config.opt_level, OptimizationLevel::O2);
        assert!(!config.save_unopt_ir);
    }
}
