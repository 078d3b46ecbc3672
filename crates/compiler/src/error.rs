//! Compile error categories
//!
//! Every failure the compiler can report belongs to one of a closed set of
//! categories with a stable user-facing name. Errors carry a message and,
//! where known, a source location already adjusted to the true source line
//! (function start line + statement line - 1).

use crate::ast::SourceLocation;

pub type CompileResult<T> = Result<T, CompileError>;

/// Error category. The `Display` prefix is the stable user-facing name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Annotation resolution, rejected coercions, field mismatches
    Type,
    /// Linear-resource violations found by the CFG checker
    Linear,
    /// Non-exhaustive match
    Exhaustiveness,
    /// Duplicate labels, unresolved gotos, reserved-name misuse
    Syntax,
    /// Unresolved name in type position, unresolved callee
    Name,
    /// Store through a `const`-qualified location
    ConstQualifier,
    /// Linker failure, missing object, library load failure
    Build,
    /// Ambiguous or missing overload resolution
    Overload,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Type => "TypeError",
            ErrorKind::Linear => "LinearError",
            ErrorKind::Exhaustiveness => "ExhaustivenessError",
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Name => "NameError",
            ErrorKind::ConstQualifier => "ConstQualifierError",
            ErrorKind::Build => "BuildError",
            ErrorKind::Overload => "OverloadError",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: Option<SourceLocation>,
}

impl CompileError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CompileError { kind, message: message.into(), location: None }
    }

    pub fn at(kind: ErrorKind, message: impl Into<String>, location: SourceLocation) -> Self {
        CompileError { kind, message: message.into(), location: Some(location) }
    }

    /// Attach a location if the error does not already carry one
    pub fn with_location(mut self, location: SourceLocation) -> Self {
        if self.location.is_none() {
            self.location = Some(location);
        }
        self
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn linear(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Linear, message)
    }

    pub fn exhaustiveness(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exhaustiveness, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }

    pub fn name_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Name, message)
    }

    pub fn const_qualifier(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConstQualifier, message)
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Build, message)
    }

    pub fn overload(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overload, message)
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{}: {} ({})", self.kind.name(), self.message, loc),
            None => write!(f, "{}: {}", self.kind.name(), self.message),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<std::fmt::Error> for CompileError {
    fn from(e: std::fmt::Error) -> Self {
        CompileError::build(format!("IR generation error: {}", e))
    }
}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        CompileError::build(format!("I/O error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_without_location() {
        let e = CompileError::type_error("cannot convert Python int to pointer");
        assert_eq!(
            e.to_string(),
            "TypeError: cannot convert Python int to pointer"
        );
    }

    #[test]
    fn test_display_with_location() {
        let e = CompileError::linear("unconsumed_at_exit: token 't' still active")
            .with_location(SourceLocation::new("main.py", 12));
        assert_eq!(
            e.to_string(),
            "LinearError: unconsumed_at_exit: token 't' still active (main.py:12)"
        );
    }

    #[test]
    fn test_with_location_keeps_first() {
        let e = CompileError::at(
            ErrorKind::Syntax,
            "duplicate label 'main'",
            SourceLocation::new("a.py", 3),
        )
        .with_location(SourceLocation::new("b.py", 9));
        assert_eq!(e.location.unwrap().line, 3);
    }

    #[test]
    fn test_stable_category_names() {
        assert_eq!(ErrorKind::ConstQualifier.name(), "ConstQualifierError");
        assert_eq!(ErrorKind::Exhaustiveness.name(), "ExhaustivenessError");
        assert_eq!(ErrorKind::Overload.name(), "OverloadError");
    }
}
