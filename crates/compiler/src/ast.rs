//! Surface AST for pythoc
//!
//! The surface parser is an external collaborator: the host frontend hands
//! the compiler a module in this shape (typically as JSON). The statement
//! and expression sets are deliberately restricted; anything outside them
//! is rejected before lowering.
//!
//! Decorators arrive pre-resolved as declaration tags ([`FunctionKind`],
//! [`ClassKind`]) so the compiler never sees decorator expressions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Source location for error reporting and tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: PathBuf,
    /// 1-indexed line in the original source file
    pub line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<PathBuf>, line: u32) -> Self {
        SourceLocation { file: file.into(), line }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)
    }
}

/// A compilation unit: one source file worth of declarations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Path of the source file this module was parsed from
    pub file: PathBuf,
    pub items: Vec<Item>,
}

impl Module {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Module { file: file.into(), items: Vec::new() }
    }

    /// Find a function item by name, descending into effect scopes
    pub fn find_function(&self, name: &str) -> Option<&FunctionDef> {
        fn walk<'a>(items: &'a [Item], name: &str) -> Option<&'a FunctionDef> {
            for item in items {
                match item {
                    Item::Function(f) if f.name == name => return Some(f),
                    Item::EffectScope(scope) => {
                        if let Some(f) = walk(&scope.items, name) {
                            return Some(f);
                        }
                    }
                    _ => {}
                }
            }
            None
        }
        walk(&self.items, name)
    }
}

/// Declaration tag for a function (resolved decorator)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FunctionKind {
    /// `@compile` / `@compile(suffix=...)`
    Compile { suffix: Option<String> },
    /// `@inline` - body is spliced at every call site
    Inline,
    /// `@extern(lib=..., calling_convention=..., ...)`
    Extern {
        libs: Vec<String>,
        objects: Vec<String>,
        calling_convention: Option<String>,
    },
}

/// Top-level declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Item {
    Function(FunctionDef),
    Class(ClassDef),
    /// `with effect(name=Namespace, ..., suffix="s"):` wrapping declarations
    EffectScope(EffectScope),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub annotation: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub kind: FunctionKind,
    pub params: Vec<Param>,
    /// Return annotation; `None` means `void`
    pub returns: Option<Expr>,
    /// C-style trailing varargs (extern declarations only)
    #[serde(default)]
    pub vararg: bool,
    pub body: Vec<Stmt>,
    /// 1-indexed line of the `def` in the source file. Statement lines are
    /// function-relative, so `start_line + stmt.line - 1` recovers the true
    /// source line.
    pub start_line: u32,
}

impl FunctionDef {
    /// True when the body contains a `yield` anywhere
    pub fn is_generator(&self) -> bool {
        fn stmts_yield(stmts: &[Stmt]) -> bool {
            stmts.iter().any(stmt_yields)
        }
        fn stmt_yields(stmt: &Stmt) -> bool {
            match &stmt.kind {
                StmtKind::Expr { value } => matches!(value, Expr::Yield { .. }),
                StmtKind::If { body, orelse, .. } => stmts_yield(body) || stmts_yield(orelse),
                StmtKind::While { body, .. } | StmtKind::For { body, .. } => stmts_yield(body),
                StmtKind::With { body, .. } => stmts_yield(body),
                StmtKind::Try { body, finalbody } => stmts_yield(body) || stmts_yield(finalbody),
                StmtKind::Match { cases, .. } => cases.iter().any(|c| stmts_yield(&c.body)),
                _ => false,
            }
        }
        stmts_yield(&self.body)
    }
}

/// Declaration tag for a class (resolved decorator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassKind {
    /// `@compile` on a class: a C-layout struct
    Struct,
    /// `@enum` on a class: a tagged union
    Enum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub annotation: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantDef {
    pub name: String,
    /// Payload annotation; `None` for a bare variant
    pub payload: Option<Expr>,
    /// Explicit tag value; variants without one are numbered in order
    pub tag: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub kind: ClassKind,
    /// Struct fields (empty for enums)
    pub fields: Vec<FieldDef>,
    /// Enum variants (empty for structs)
    pub variants: Vec<VariantDef>,
    pub line: u32,
}

/// One `name=Namespace` pair from `with effect(...)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectOverride {
    /// Effect name as dereferenced in source (`effect.<name>.<fn>`)
    pub effect: String,
    /// Registered namespace that supplies the overriding callables
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectScope {
    pub overrides: Vec<EffectOverride>,
    pub suffix: Option<String>,
    pub items: Vec<Item>,
    pub line: u32,
}

/// A statement with its function-relative line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub line: u32,
    pub kind: StmtKind,
}

impl Stmt {
    pub fn new(line: u32, kind: StmtKind) -> Self {
        Stmt { line, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    /// `x = e` / `a, b = e` (tuple target)
    Assign { targets: Vec<Expr>, value: Expr },
    /// `x: T = e` / `x: T` - declaration
    AnnAssign {
        target: Expr,
        annotation: Expr,
        value: Option<Expr>,
    },
    /// `x += e` and friends
    AugAssign { target: Expr, op: BinOp, value: Expr },
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While { test: Expr, body: Vec<Stmt> },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
    },
    Match { subject: Expr, cases: Vec<MatchCase> },
    /// `with label("x"):` and friends inside a function
    With {
        context: Expr,
        target: Option<String>,
        body: Vec<Stmt>,
    },
    /// Only the `try/finally` form is accepted
    Try {
        body: Vec<Stmt>,
        finalbody: Vec<Stmt>,
    },
    Return { value: Option<Expr> },
    Break,
    Continue,
    Pass,
    Expr { value: Expr },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCase {
    pub pattern: MatchPattern,
    pub guard: Option<Expr>,
    pub body: Vec<Stmt>,
}

/// Surface match patterns, pre-normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchPattern {
    /// `_` or a capture name
    Wildcard { binding: Option<String> },
    /// A literal constant (`True`, `0`, ...)
    Literal(Constant),
    /// A dotted value reference, e.g. `Status.Ok`
    Value { path: Vec<String> },
    /// Tuple pattern, e.g. `(Status.Ok, n)`
    Sequence(Vec<MatchPattern>),
    /// `p1 | p2`
    Or(Vec<MatchPattern>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    None,
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "{}", v),
            Constant::Float(v) => write!(f, "{}", v),
            Constant::Bool(v) => write!(f, "{}", if *v { "True" } else { "False" }),
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::None => write!(f, "None"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Name(String),
    Constant(Constant),
    BinOp {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    UnaryOp { op: UnaryOp, operand: Box<Expr> },
    BoolOp { op: BoolOpKind, values: Vec<Expr> },
    Compare {
        left: Box<Expr>,
        ops: Vec<CmpOp>,
        comparators: Vec<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<(String, Expr)>,
    },
    Subscript { value: Box<Expr>, index: Box<Expr> },
    Attribute { value: Box<Expr>, attr: String },
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Yield { value: Option<Box<Expr>> },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    /// Accepted only as an uninterpreted predicate argument to
    /// `assume`/`refine`; lowering it as a value is an error
    Lambda { params: Vec<String>, body: Box<Expr> },
}

impl Expr {
    pub fn name(s: impl Into<String>) -> Self {
        Expr::Name(s.into())
    }

    pub fn int(v: i64) -> Self {
        Expr::Constant(Constant::Int(v))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Expr::Constant(Constant::Str(s.into()))
    }

    pub fn call(func: Expr, args: Vec<Expr>) -> Self {
        Expr::Call { func: Box::new(func), args, keywords: Vec::new() }
    }

    pub fn attribute(value: Expr, attr: impl Into<String>) -> Self {
        Expr::Attribute { value: Box::new(value), attr: attr.into() }
    }

    pub fn subscript(value: Expr, index: Expr) -> Self {
        Expr::Subscript { value: Box::new(value), index: Box::new(index) }
    }

    pub fn binop(left: Expr, op: BinOp, right: Expr) -> Self {
        Expr::BinOp { left: Box::new(left), op, right: Box::new(right) }
    }

    /// Flatten a dotted name chain (`a.b.c`) into its path segments
    pub fn dotted_path(&self) -> Option<Vec<String>> {
        match self {
            Expr::Name(n) => Some(vec![n.clone()]),
            Expr::Attribute { value, attr } => {
                let mut path = value.dotted_path()?;
                path.push(attr.clone());
                Some(path)
            }
            _ => None,
        }
    }
}

/// Binary operators (Python spelling)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mult,
    Div,
    FloorDiv,
    Mod,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mult => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::LShift => "<<",
            BinOp::RShift => ">>",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::BitAnd => "&",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    USub,
    UAdd,
    Not,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOpKind {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
}

impl std::fmt::Display for CmpOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtE => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtE => ">=",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotted_path_simple() {
        let e = Expr::name("x");
        assert_eq!(e.dotted_path(), Some(vec!["x".to_string()]));
    }

    #[test]
    fn test_dotted_path_chain() {
        let e = Expr::attribute(Expr::attribute(Expr::name("effect"), "mem"), "malloc");
        assert_eq!(
            e.dotted_path(),
            Some(vec!["effect".to_string(), "mem".to_string(), "malloc".to_string()])
        );
    }

    #[test]
    fn test_dotted_path_rejects_calls() {
        let e = Expr::call(Expr::name("f"), vec![]);
        assert_eq!(e.dotted_path(), None);
    }

    #[test]
    fn test_generator_detection() {
        let f = FunctionDef {
            name: "gen".to_string(),
            kind: FunctionKind::Compile { suffix: None },
            params: vec![],
            returns: Some(Expr::name("i32")),
            vararg: false,
            body: vec![Stmt::new(
                1,
                StmtKind::For {
                    target: Expr::name("i"),
                    iter: Expr::call(Expr::name("seq"), vec![Expr::int(0), Expr::int(10)]),
                    body: vec![Stmt::new(
                        2,
                        StmtKind::Expr {
                            value: Expr::Yield { value: Some(Box::new(Expr::name("i"))) },
                        },
                    )],
                },
            )],
            start_line: 1,
        };
        assert!(f.is_generator());
    }

    #[test]
    fn test_module_roundtrip_json() {
        let mut module = Module::new("demo.py");
        module.items.push(Item::Function(FunctionDef {
            name: "main".to_string(),
            kind: FunctionKind::Compile { suffix: None },
            params: vec![],
            returns: None,
            vararg: false,
            body: vec![Stmt::new(1, StmtKind::Pass)],
            start_line: 3,
        }));
        let json = serde_json::to_string(&module).unwrap();
        let back: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(module, back);
    }

    #[test]
    fn test_find_function_inside_effect_scope() {
        let mut module = Module::new("demo.py");
        module.items.push(Item::EffectScope(EffectScope {
            overrides: vec![EffectOverride {
                effect: "mem".to_string(),
                namespace: "counting_mem".to_string(),
            }],
            suffix: Some("cnt".to_string()),
            items: vec![Item::Function(FunctionDef {
                name: "f".to_string(),
                kind: FunctionKind::Compile { suffix: None },
                params: vec![],
                returns: None,
                vararg: false,
                body: vec![Stmt::new(1, StmtKind::Pass)],
                start_line: 2,
            })],
            line: 1,
        }));
        assert!(module.find_function("f").is_some());
        assert!(module.find_function("g").is_none());
    }
}
