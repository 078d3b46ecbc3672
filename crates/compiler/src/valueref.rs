//! Uniform value references
//!
//! Every expression the lowering driver evaluates becomes a [`ValueRef`]:
//! either a loaded IR value, an address whose pointee is the hinted type, a
//! deferred Python constant, or a typed pointer constant (`nullptr`). The
//! wrapper also carries the variable name and linear path when the
//! reference points into a linear-tracked location, so ownership transfers
//! can be recorded at the use site.

use crate::ast::Constant;
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `ir` is a pointer to a `type_hint`-typed location
    Address,
    /// `ir` is a first-class value of `type_hint`
    Value,
    /// An unpromoted host constant; `ir` is empty until promotion
    PyConst,
    /// A typed pointer constant (`nullptr`)
    PtrConst,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueRef {
    pub kind: ValueKind,
    /// Textual IR operand (`%t3`, `42`, `null`, ...)
    pub ir: String,
    /// For `Address` refs that were loaded: the backing address operand
    pub address: Option<String>,
    pub type_hint: Type,
    /// The deferred constant for `PyConst` refs
    pub constant: Option<Constant>,
    /// Source variable this reference points into, when any
    pub var_name: Option<String>,
    /// Path to the linear token inside `var_name`, when linear-tracked
    pub linear_path: Option<Vec<usize>>,
}

impl ValueRef {
    /// A first-class IR value
    pub fn value(ir: impl Into<String>, type_hint: Type) -> Self {
        ValueRef {
            kind: ValueKind::Value,
            ir: ir.into(),
            address: None,
            type_hint,
            constant: None,
            var_name: None,
            linear_path: None,
        }
    }

    /// An address whose pointee is `type_hint`
    pub fn address(ir: impl Into<String>, type_hint: Type) -> Self {
        ValueRef {
            kind: ValueKind::Address,
            ir: ir.into(),
            address: None,
            type_hint,
            constant: None,
            var_name: None,
            linear_path: None,
        }
    }

    /// An unpromoted Python constant
    pub fn py_const(constant: Constant) -> Self {
        ValueRef {
            kind: ValueKind::PyConst,
            ir: String::new(),
            address: None,
            type_hint: Type::PyConst,
            constant: Some(constant),
            var_name: None,
            linear_path: None,
        }
    }

    /// A typed null pointer
    pub fn null(pointee: Type) -> Self {
        ValueRef {
            kind: ValueKind::PtrConst,
            ir: "null".to_string(),
            address: None,
            type_hint: Type::ptr_to(pointee),
            constant: None,
            var_name: None,
            linear_path: None,
        }
    }

    /// Tag this reference as pointing into a linear-tracked location
    pub fn with_linear_source(mut self, var: impl Into<String>, path: Vec<usize>) -> Self {
        self.var_name = Some(var.into());
        self.linear_path = Some(path);
        self
    }

    pub fn with_var(mut self, var: impl Into<String>) -> Self {
        self.var_name = Some(var.into());
        self
    }

    pub fn is_address(&self) -> bool {
        self.kind == ValueKind::Address
    }

    pub fn is_py_const(&self) -> bool {
        self.kind == ValueKind::PyConst
    }

    /// True when this reference tracks a linear token location
    pub fn tracks_linear(&self) -> bool {
        self.var_name.is_some() && self.linear_path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_constructor() {
        let v = ValueRef::value("%t1", Type::I32);
        assert_eq!(v.kind, ValueKind::Value);
        assert_eq!(v.ir, "%t1");
        assert!(!v.tracks_linear());
    }

    #[test]
    fn test_py_const_defers_type() {
        let v = ValueRef::py_const(Constant::Int(42));
        assert!(v.is_py_const());
        assert_eq!(v.type_hint, Type::PyConst);
        assert_eq!(v.constant, Some(Constant::Int(42)));
    }

    #[test]
    fn test_null_is_pointer_typed() {
        let v = ValueRef::null(Type::I8);
        assert_eq!(v.kind, ValueKind::PtrConst);
        assert_eq!(v.type_hint, Type::ptr_to(Type::I8));
        assert_eq!(v.ir, "null");
    }

    #[test]
    fn test_linear_source_tagging() {
        let v = ValueRef::address("%slot", Type::Linear).with_linear_source("t", vec![]);
        assert!(v.tracks_linear());
        assert_eq!(v.var_name.as_deref(), Some("t"));
        assert_eq!(v.linear_path, Some(vec![]));
    }
}
