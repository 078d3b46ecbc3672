//! Annotation resolution: AST expressions in type position become [`Type`]s
//!
//! Annotations reuse the expression grammar (`ptr[i32]`, `array[f64,16]`,
//! `const[ptr[u8]]`, `func[[i32,i32],i32]`, `"Point"` forward strings), so
//! the resolver walks the same AST the lowering driver sees. Specialized
//! types are cached per canonical subscript key.

use crate::ast::{Constant, Expr};
use crate::error::{CompileError, CompileResult};
use crate::types::{Qualifiers, Type, TypeCache};
use std::collections::HashMap;

pub struct TypeResolver<'a> {
    /// Declared struct/enum types by name
    classes: &'a HashMap<String, Type>,
    cache: &'a mut TypeCache,
}

impl<'a> TypeResolver<'a> {
    pub fn new(classes: &'a HashMap<String, Type>, cache: &'a mut TypeCache) -> Self {
        TypeResolver { classes, cache }
    }

    pub fn resolve(&mut self, expr: &Expr) -> CompileResult<Type> {
        match expr {
            Expr::Name(name) => self.resolve_name(name),
            // Forward reference as a string literal
            Expr::Constant(Constant::Str(name)) => self.resolve_name(name),
            Expr::Constant(Constant::None) => Ok(Type::Void),
            Expr::Subscript { value, index } => {
                let key = annotation_key(expr)?;
                if let Some(head) = simple_name(value) {
                    let head = head.to_string();
                    let index = (**index).clone();
                    let classes = self.classes;
                    self.cache.get_or_insert_with(&key, || {
                        let mut scratch = TypeCache::new();
                        let mut inner = TypeResolver { classes, cache: &mut scratch };
                        inner.resolve_subscript(&head, &index)
                    })
                } else {
                    Err(CompileError::type_error(format!(
                        "unsupported type annotation '{}'",
                        key
                    )))
                }
            }
            Expr::Attribute { .. } => {
                // Module-qualified reference: the final segment names the type
                let path = expr.dotted_path().ok_or_else(|| {
                    CompileError::type_error("unsupported attribute chain in type position")
                })?;
                self.resolve_name(path.last().expect("non-empty path"))
            }
            other => Err(CompileError::type_error(format!(
                "expression {:?} is not a type annotation",
                other
            ))),
        }
    }

    fn resolve_name(&mut self, name: &str) -> CompileResult<Type> {
        if let Some(ty) = Type::builtin(name) {
            return Ok(ty);
        }
        if let Some(ty) = self.classes.get(name) {
            return Ok(ty.clone());
        }
        match name {
            "ptr" | "array" | "func" | "union" | "refined" | "const" | "volatile" => {
                Err(CompileError::type_error(format!(
                    "'{}' requires subscript parameters in type position",
                    name
                )))
            }
            _ => Err(CompileError::name_error(format!(
                "unknown type name '{}'",
                name
            ))),
        }
    }

    fn resolve_subscript(&mut self, head: &str, index: &Expr) -> CompileResult<Type> {
        match head {
            "ptr" => Ok(Type::ptr_to(self.resolve(index)?)),
            "const" => Ok(Type::qualified(self.resolve(index)?, Qualifiers::CONST)),
            "volatile" => Ok(Type::qualified(self.resolve(index)?, Qualifiers::VOLATILE)),
            "array" => {
                let parts = tuple_parts(index);
                if parts.len() < 2 {
                    return Err(CompileError::type_error(
                        "array[...] needs an element type and at least one dimension",
                    ));
                }
                let element = self.resolve(parts[0])?;
                let mut dims = Vec::with_capacity(parts.len() - 1);
                for dim in &parts[1..] {
                    match dim {
                        Expr::Constant(Constant::Int(n)) if *n > 0 => dims.push(*n as u64),
                        _ => {
                            return Err(CompileError::type_error(
                                "array dimensions must be positive integer constants",
                            ));
                        }
                    }
                }
                Ok(Type::array_of(element, dims))
            }
            "union" => {
                let parts = tuple_parts(index);
                if parts.len() < 2 {
                    return Err(CompileError::type_error(
                        "union[...] needs at least two alternatives",
                    ));
                }
                let variants: CompileResult<Vec<Type>> =
                    parts.iter().map(|p| self.resolve(p)).collect();
                Ok(Type::Union { variants: variants? })
            }
            "func" => {
                let parts = tuple_parts(index);
                let [params_expr, ret_expr] = parts.as_slice() else {
                    return Err(CompileError::type_error(
                        "func[...] takes a parameter list and a return type",
                    ));
                };
                let Expr::List(param_exprs) = params_expr else {
                    return Err(CompileError::type_error(
                        "func[...] parameters must be a list of types",
                    ));
                };
                let params: CompileResult<Vec<Type>> =
                    param_exprs.iter().map(|p| self.resolve(p)).collect();
                Ok(Type::FuncPtr {
                    params: params?,
                    ret: Box::new(self.resolve(ret_expr)?),
                })
            }
            "refined" => {
                let parts = tuple_parts(index);
                if parts.is_empty() {
                    return Err(CompileError::type_error(
                        "refined[...] needs an underlying type",
                    ));
                }
                let base = self.resolve(parts[0])?;
                let mut tags = Vec::new();
                for tag in &parts[1..] {
                    match tag {
                        Expr::Constant(Constant::Str(s)) => tags.push(s.clone()),
                        _ => {
                            return Err(CompileError::type_error(
                                "refined[...] tags must be string literals",
                            ));
                        }
                    }
                }
                Ok(Type::Refined { base: Box::new(base), predicates: Vec::new(), tags })
            }
            other => Err(CompileError::type_error(format!(
                "'{}' cannot be subscripted in type position",
                other
            ))),
        }
    }
}

fn simple_name(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Name(n) => Some(n.as_str()),
        _ => None,
    }
}

fn tuple_parts(index: &Expr) -> Vec<&Expr> {
    match index {
        Expr::Tuple(parts) => parts.iter().collect(),
        other => vec![other],
    }
}

/// Canonical cache key for an annotation expression
fn annotation_key(expr: &Expr) -> CompileResult<String> {
    match expr {
        Expr::Name(n) => Ok(n.clone()),
        Expr::Constant(Constant::Str(s)) => Ok(s.clone()),
        Expr::Constant(Constant::Int(n)) => Ok(n.to_string()),
        Expr::Subscript { value, index } => Ok(format!(
            "{}[{}]",
            annotation_key(value)?,
            annotation_key(index)?
        )),
        Expr::Tuple(parts) | Expr::List(parts) => {
            let keys: CompileResult<Vec<String>> = parts.iter().map(annotation_key).collect();
            Ok(keys?.join(","))
        }
        Expr::Attribute { .. } => {
            let path = expr.dotted_path().ok_or_else(|| {
                CompileError::type_error("unsupported attribute chain in type position")
            })?;
            Ok(path.join("."))
        }
        other => Err(CompileError::type_error(format!(
            "expression {:?} is not a type annotation",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StructBody;
    use std::rc::Rc;

    fn classes() -> HashMap<String, Type> {
        let mut map = HashMap::new();
        map.insert(
            "Point".to_string(),
            Type::Struct(Rc::new(StructBody {
                name: "Point".to_string(),
                fields: vec![
                    ("x".to_string(), Type::I32),
                    ("y".to_string(), Type::I32),
                ],
            })),
        );
        map
    }

    fn resolve(expr: &Expr) -> CompileResult<Type> {
        let classes = classes();
        let mut cache = TypeCache::new();
        TypeResolver::new(&classes, &mut cache).resolve(expr)
    }

    #[test]
    fn test_builtin_scalars() {
        assert_eq!(resolve(&Expr::name("i32")).unwrap(), Type::I32);
        assert_eq!(resolve(&Expr::name("u8")).unwrap(), Type::U8);
        assert_eq!(resolve(&Expr::name("f64")).unwrap(), Type::F64);
        assert_eq!(resolve(&Expr::name("void")).unwrap(), Type::Void);
        assert_eq!(resolve(&Expr::name("linear")).unwrap(), Type::Linear);
    }

    #[test]
    fn test_ptr_annotation() {
        let expr = Expr::subscript(Expr::name("ptr"), Expr::name("i32"));
        assert_eq!(resolve(&expr).unwrap(), Type::ptr_to(Type::I32));
    }

    #[test]
    fn test_array_annotation_multi_dim() {
        let expr = Expr::subscript(
            Expr::name("array"),
            Expr::Tuple(vec![Expr::name("i32"), Expr::int(4), Expr::int(5)]),
        );
        assert_eq!(resolve(&expr).unwrap(), Type::array_of(Type::I32, vec![4, 5]));
    }

    #[test]
    fn test_array_rejects_zero_dimension() {
        let expr = Expr::subscript(
            Expr::name("array"),
            Expr::Tuple(vec![Expr::name("i32"), Expr::int(0)]),
        );
        assert!(resolve(&expr).is_err());
    }

    #[test]
    fn test_const_qualifier_wrapping() {
        let expr = Expr::subscript(
            Expr::name("const"),
            Expr::subscript(Expr::name("ptr"), Expr::name("u8")),
        );
        let ty = resolve(&expr).unwrap();
        assert!(ty.qualifiers().is_const);
        assert_eq!(ty.unwrapped(), &Type::ptr_to(Type::U8));
    }

    #[test]
    fn test_func_pointer_annotation() {
        let expr = Expr::subscript(
            Expr::name("func"),
            Expr::Tuple(vec![
                Expr::List(vec![Expr::name("i32"), Expr::name("i32")]),
                Expr::name("i32"),
            ]),
        );
        assert_eq!(
            resolve(&expr).unwrap(),
            Type::FuncPtr {
                params: vec![Type::I32, Type::I32],
                ret: Box::new(Type::I32),
            }
        );
    }

    #[test]
    fn test_class_and_forward_string() {
        let by_name = resolve(&Expr::name("Point")).unwrap();
        let by_string = resolve(&Expr::string("Point")).unwrap();
        assert_eq!(by_name, by_string);
        assert!(matches!(by_name.unwrapped(), Type::Struct(_)));
    }

    #[test]
    fn test_unknown_name_is_name_error() {
        let err = resolve(&Expr::name("Missing")).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Name);
    }

    #[test]
    fn test_bare_ptr_rejected() {
        let err = resolve(&Expr::name("ptr")).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Type);
    }

    #[test]
    fn test_refined_annotation_with_tags() {
        let expr = Expr::subscript(
            Expr::name("refined"),
            Expr::Tuple(vec![Expr::name("Point"), Expr::string("checked")]),
        );
        let ty = resolve(&expr).unwrap();
        match ty {
            Type::Refined { tags, .. } => assert_eq!(tags, vec!["checked".to_string()]),
            other => panic!("expected refined type, got {}", other),
        }
    }
}
