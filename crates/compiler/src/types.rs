//! Type lattice for pythoc
//!
//! Every type the surface language can name is a [`Type`] value: builtin
//! scalars, pointers, arrays, C-layout structs, tagged enums, untagged
//! unions, function pointers, linear tokens, refinement wrappers, and
//! qualifier wrappers. Types are immutable; aggregate bodies are shared
//! through `Rc` so clones stay cheap.
//!
//! Size and alignment follow the C ABI for the host target (LP64). The
//! textual IR mapping lives here too so the IR builder never needs to
//! re-derive layout.

use crate::error::{CompileError, CompileResult};
use std::collections::HashMap;
use std::rc::Rc;

/// `const` / `volatile` qualifier set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Qualifiers {
    pub is_const: bool,
    pub is_volatile: bool,
}

impl Qualifiers {
    pub const NONE: Qualifiers = Qualifiers { is_const: false, is_volatile: false };
    pub const CONST: Qualifiers = Qualifiers { is_const: true, is_volatile: false };
    pub const VOLATILE: Qualifiers = Qualifiers { is_const: false, is_volatile: true };

    pub fn union(self, other: Qualifiers) -> Qualifiers {
        Qualifiers {
            is_const: self.is_const || other.is_const,
            is_volatile: self.is_volatile || other.is_volatile,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.is_const && !self.is_volatile
    }
}

impl std::fmt::Display for Qualifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.is_const {
            parts.push("const");
        }
        if self.is_volatile {
            parts.push("volatile");
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// Body of a named struct type
#[derive(Debug, Clone, PartialEq)]
pub struct StructBody {
    pub name: String,
    pub fields: Vec<(String, Type)>,
}

impl StructBody {
    /// Index of a field by name
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumVariant {
    pub name: String,
    pub payload: Option<Type>,
    pub tag: i64,
}

/// Body of a tagged-union enum type
#[derive(Debug, Clone, PartialEq)]
pub struct EnumBody {
    pub name: String,
    pub variants: Vec<EnumVariant>,
}

impl EnumBody {
    pub fn variant(&self, name: &str) -> Option<(usize, &EnumVariant)> {
        self.variants
            .iter()
            .enumerate()
            .find(|(_, v)| v.name == name)
    }
}

/// The type lattice
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Int { width: u8, signed: bool },
    Float { width: u8 },
    Bool,
    Void,
    Ptr { pointee: Box<Type> },
    /// Fixed-size array, possibly multi-dimensional
    Array { element: Box<Type>, dims: Vec<u64> },
    Struct(Rc<StructBody>),
    /// Untagged union of alternatives
    Union { variants: Vec<Type> },
    Enum(Rc<EnumBody>),
    FuncPtr { params: Vec<Type>, ret: Box<Type> },
    /// Zero-sized linear token
    Linear,
    /// Base type plus uninterpreted predicates / string tags
    Refined {
        base: Box<Type>,
        predicates: Vec<String>,
        tags: Vec<String>,
    },
    Qualified { inner: Box<Type>, quals: Qualifiers },
    /// Singleton type of a not-yet-promoted Python constant
    PyConst,
}

impl Type {
    pub const I8: Type = Type::Int { width: 8, signed: true };
    pub const I16: Type = Type::Int { width: 16, signed: true };
    pub const I32: Type = Type::Int { width: 32, signed: true };
    pub const I64: Type = Type::Int { width: 64, signed: true };
    pub const U8: Type = Type::Int { width: 8, signed: false };
    pub const U16: Type = Type::Int { width: 16, signed: false };
    pub const U32: Type = Type::Int { width: 32, signed: false };
    pub const U64: Type = Type::Int { width: 64, signed: false };
    pub const F32: Type = Type::Float { width: 32 };
    pub const F64: Type = Type::Float { width: 64 };

    /// Look up a builtin scalar by its reserved annotation name
    pub fn builtin(name: &str) -> Option<Type> {
        let ty = match name {
            "i8" => Type::I8,
            "i16" => Type::I16,
            "i32" => Type::I32,
            "i64" => Type::I64,
            "u8" => Type::U8,
            "u16" => Type::U16,
            "u32" => Type::U32,
            "u64" => Type::U64,
            "f32" => Type::F32,
            "f64" => Type::F64,
            "bool" => Type::Bool,
            "char" => Type::I8,
            "void" => Type::Void,
            "linear" => Type::Linear,
            _ => return None,
        };
        Some(ty)
    }

    pub fn ptr_to(pointee: Type) -> Type {
        Type::Ptr { pointee: Box::new(pointee) }
    }

    pub fn array_of(element: Type, dims: Vec<u64>) -> Type {
        Type::Array { element: Box::new(element), dims }
    }

    pub fn qualified(inner: Type, quals: Qualifiers) -> Type {
        if quals.is_empty() {
            return inner;
        }
        match inner {
            // Collapse nested wrappers into one qualifier set
            Type::Qualified { inner, quals: existing } => Type::Qualified {
                inner,
                quals: existing.union(quals),
            },
            other => Type::Qualified { inner: Box::new(other), quals },
        }
    }

    /// Strip qualifier and refinement wrappers down to the structural type
    pub fn unwrapped(&self) -> &Type {
        match self {
            Type::Qualified { inner, .. } => inner.unwrapped(),
            Type::Refined { base, .. } => base.unwrapped(),
            other => other,
        }
    }

    /// Qualifiers carried by this type (through wrapping)
    pub fn qualifiers(&self) -> Qualifiers {
        match self {
            Type::Qualified { inner, quals } => quals.union(inner.qualifiers()),
            Type::Refined { base, .. } => base.qualifiers(),
            _ => Qualifiers::NONE,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.unwrapped(), Type::Int { .. })
    }

    pub fn is_float(&self) -> bool {
        matches!(self.unwrapped(), Type::Float { .. })
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.unwrapped(), Type::Ptr { .. } | Type::FuncPtr { .. })
    }

    pub fn is_void(&self) -> bool {
        matches!(self.unwrapped(), Type::Void)
    }

    pub fn is_linear(&self) -> bool {
        matches!(self.unwrapped(), Type::Linear)
    }

    /// Size in bytes per the target ABI
    pub fn byte_size(&self) -> CompileResult<u64> {
        match self {
            Type::Int { width, .. } => Ok(u64::from(*width) / 8),
            Type::Float { width } => Ok(u64::from(*width) / 8),
            Type::Bool => Ok(1),
            Type::Void => Ok(0),
            Type::Ptr { .. } | Type::FuncPtr { .. } => Ok(8),
            Type::Array { element, dims } => {
                let count: u64 = dims.iter().product();
                Ok(element.byte_size()? * count)
            }
            Type::Struct(body) => {
                let layout = struct_layout(&body.fields)?;
                Ok(layout.size)
            }
            Type::Union { variants } => {
                let mut size = 0u64;
                let mut align = 1u64;
                for v in variants {
                    size = size.max(v.byte_size()?);
                    align = align.max(v.alignment()?);
                }
                Ok(round_up(size, align))
            }
            Type::Enum(body) => {
                let layout = enum_layout(body)?;
                Ok(layout.size)
            }
            Type::Linear => Ok(0),
            Type::Refined { base, .. } => base.byte_size(),
            Type::Qualified { inner, .. } => inner.byte_size(),
            Type::PyConst => Err(CompileError::type_error(
                "sizeof is undefined for an unpromoted Python constant",
            )),
        }
    }

    /// Alignment in bytes per the target ABI
    pub fn alignment(&self) -> CompileResult<u64> {
        match self {
            Type::Int { width, .. } => Ok(u64::from(*width) / 8),
            Type::Float { width } => Ok(u64::from(*width) / 8),
            Type::Bool => Ok(1),
            Type::Void | Type::Linear => Ok(1),
            Type::Ptr { .. } | Type::FuncPtr { .. } => Ok(8),
            Type::Array { element, .. } => element.alignment(),
            Type::Struct(body) => {
                let mut align = 1u64;
                for (_, f) in &body.fields {
                    align = align.max(f.alignment()?);
                }
                Ok(align)
            }
            Type::Union { variants } => {
                let mut align = 1u64;
                for v in variants {
                    align = align.max(v.alignment()?);
                }
                Ok(align)
            }
            Type::Enum(body) => {
                let layout = enum_layout(body)?;
                Ok(layout.align)
            }
            Type::Refined { base, .. } => base.alignment(),
            Type::Qualified { inner, .. } => inner.alignment(),
            Type::PyConst => Err(CompileError::type_error(
                "alignment is undefined for an unpromoted Python constant",
            )),
        }
    }

    /// Textual LLVM IR spelling of this type
    pub fn ir_type(&self) -> CompileResult<String> {
        match self {
            Type::Int { width, .. } => Ok(format!("i{}", width)),
            Type::Float { width: 32 } => Ok("float".to_string()),
            Type::Float { .. } => Ok("double".to_string()),
            Type::Bool => Ok("i1".to_string()),
            Type::Void => Ok("void".to_string()),
            Type::Ptr { .. } | Type::FuncPtr { .. } => Ok("ptr".to_string()),
            Type::Array { element, dims } => {
                let mut inner = element.ir_type()?;
                for d in dims.iter().rev() {
                    inner = format!("[{} x {}]", d, inner);
                }
                Ok(inner)
            }
            Type::Struct(body) => Ok(format!("%{}", body.name)),
            Type::Union { .. } => Ok(format!("[{} x i8]", self.byte_size()?)),
            Type::Enum(body) => Ok(format!("%{}", body.name)),
            Type::Linear => Ok("{}".to_string()),
            Type::Refined { base, .. } => base.ir_type(),
            Type::Qualified { inner, .. } => inner.ir_type(),
            Type::PyConst => Err(CompileError::type_error(
                "an unpromoted Python constant has no IR type",
            )),
        }
    }

    /// IR body of a named aggregate (`%Name = type <body>`)
    pub fn ir_type_definition(&self) -> CompileResult<Option<(String, String)>> {
        match self.unwrapped() {
            Type::Struct(body) => {
                let fields: CompileResult<Vec<String>> =
                    body.fields.iter().map(|(_, t)| t.ir_type()).collect();
                Ok(Some((body.name.clone(), format!("{{ {} }}", fields?.join(", ")))))
            }
            Type::Enum(body) => {
                let layout = enum_layout(body)?;
                Ok(Some((
                    body.name.clone(),
                    format!("{{ i32, [{} x i8] }}", layout.payload_size),
                )))
            }
            _ => Ok(None),
        }
    }

    /// Array-to-pointer decay. A 1-D `array[T,N]` decays to `ptr[T]`; a
    /// k-D array decays to a pointer to its first sub-array. Qualifiers
    /// survive the decay (`const array` becomes `const ptr`).
    pub fn decay(&self) -> Type {
        match self {
            Type::Array { element, dims } => {
                if dims.len() <= 1 {
                    Type::ptr_to((**element).clone())
                } else {
                    Type::ptr_to(Type::Array {
                        element: element.clone(),
                        dims: dims[1..].to_vec(),
                    })
                }
            }
            Type::Qualified { inner, quals } => Type::qualified(inner.decay(), *quals),
            Type::Refined { base, .. } => base.decay(),
            other => other.clone(),
        }
    }

    /// Byte offset of struct field `index`
    pub fn field_offset(&self, index: usize) -> CompileResult<u64> {
        match self.unwrapped() {
            Type::Struct(body) => {
                let layout = struct_layout(&body.fields)?;
                layout.offsets.get(index).copied().ok_or_else(|| {
                    CompileError::type_error(format!(
                        "field index {} out of range for struct '{}'",
                        index, body.name
                    ))
                })
            }
            other => Err(CompileError::type_error(format!(
                "field offset requested on non-struct type '{}'",
                other
            ))),
        }
    }

    /// All paths from this type into linear substructure. A bare linear
    /// token contributes the empty path; a struct contributes one path per
    /// linear-bearing field, prefixed by the field index.
    pub fn linear_paths(&self) -> Vec<Vec<usize>> {
        match self.unwrapped() {
            Type::Linear => vec![Vec::new()],
            Type::Struct(body) => {
                let mut paths = Vec::new();
                for (i, (_, field)) in body.fields.iter().enumerate() {
                    for sub in field.linear_paths() {
                        let mut path = vec![i];
                        path.extend(sub);
                        paths.push(path);
                    }
                }
                paths
            }
            _ => Vec::new(),
        }
    }

    pub fn contains_linear(&self) -> bool {
        !self.linear_paths().is_empty()
    }

    /// Structural compatibility used for assignment and argument passing.
    /// Refinements are transparent toward fewer constraints; qualifiers on
    /// the value side are ignored (they matter only through addresses).
    pub fn compatible_with(&self, other: &Type) -> bool {
        self.unwrapped() == other.unwrapped()
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Int { width, signed } => {
                write!(f, "{}{}", if *signed { "i" } else { "u" }, width)
            }
            Type::Float { width } => write!(f, "f{}", width),
            Type::Bool => write!(f, "bool"),
            Type::Void => write!(f, "void"),
            Type::Ptr { pointee } => write!(f, "ptr[{}]", pointee),
            Type::Array { element, dims } => {
                let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                write!(f, "array[{},{}]", element, dims.join(","))
            }
            Type::Struct(body) => write!(f, "{}", body.name),
            Type::Union { variants } => {
                let names: Vec<String> = variants.iter().map(|v| v.to_string()).collect();
                write!(f, "union[{}]", names.join(","))
            }
            Type::Enum(body) => write!(f, "{}", body.name),
            Type::FuncPtr { params, ret } => {
                let params: Vec<String> = params.iter().map(|p| p.to_string()).collect();
                write!(f, "func[[{}],{}]", params.join(","), ret)
            }
            Type::Linear => write!(f, "linear"),
            Type::Refined { base, tags, .. } => {
                if tags.is_empty() {
                    write!(f, "refined[{}]", base)
                } else {
                    write!(f, "refined[{},{}]", base, tags.join(","))
                }
            }
            Type::Qualified { inner, quals } => write!(f, "{}[{}]", quals, inner),
            Type::PyConst => write!(f, "pyconst"),
        }
    }
}

struct StructLayout {
    offsets: Vec<u64>,
    size: u64,
}

fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

fn struct_layout(fields: &[(String, Type)]) -> CompileResult<StructLayout> {
    let mut offsets = Vec::with_capacity(fields.len());
    let mut offset = 0u64;
    let mut align = 1u64;
    for (_, field) in fields {
        let a = field.alignment()?;
        offset = round_up(offset, a);
        offsets.push(offset);
        offset += field.byte_size()?;
        align = align.max(a);
    }
    Ok(StructLayout { offsets, size: round_up(offset, align) })
}

struct EnumLayout {
    payload_size: u64,
    size: u64,
    align: u64,
}

fn enum_layout(body: &EnumBody) -> CompileResult<EnumLayout> {
    let mut payload_size = 0u64;
    let mut payload_align = 1u64;
    for v in &body.variants {
        if let Some(payload) = &v.payload {
            payload_size = payload_size.max(payload.byte_size()?);
            payload_align = payload_align.max(payload.alignment()?);
        }
    }
    let align = payload_align.max(4);
    let payload_offset = round_up(4, payload_align.max(1));
    Ok(EnumLayout {
        payload_size,
        size: round_up(payload_offset + payload_size, align),
        align,
    })
}

/// Byte offset of an enum's payload area
pub fn enum_payload_offset(body: &EnumBody) -> CompileResult<u64> {
    let mut payload_align = 1u64;
    for v in &body.variants {
        if let Some(payload) = &v.payload {
            payload_align = payload_align.max(payload.alignment()?);
        }
    }
    Ok(round_up(4, payload_align))
}

/// Integer/float promotion for binary operations.
///
/// Floats dominate ints; the wider float dominates. Between integers the
/// wider operand wins, and at equal width unsignedness wins (the dominant
/// operand selects signedness).
pub fn promote_binary(lhs: &Type, rhs: &Type) -> CompileResult<Type> {
    let l = lhs.unwrapped();
    let r = rhs.unwrapped();
    match (l, r) {
        (Type::Float { width: lw }, Type::Float { width: rw }) => {
            Ok(Type::Float { width: (*lw).max(*rw) })
        }
        (Type::Float { .. }, Type::Int { .. }) | (Type::Float { .. }, Type::Bool) => {
            Ok(l.clone())
        }
        (Type::Int { .. }, Type::Float { .. }) | (Type::Bool, Type::Float { .. }) => {
            Ok(r.clone())
        }
        (Type::Int { width: lw, signed: ls }, Type::Int { width: rw, signed: rs }) => {
            if lw > rw {
                Ok(l.clone())
            } else if rw > lw {
                Ok(r.clone())
            } else {
                Ok(Type::Int { width: *lw, signed: *ls && *rs })
            }
        }
        (Type::Int { .. }, Type::Bool) => Ok(l.clone()),
        (Type::Bool, Type::Int { .. }) => Ok(r.clone()),
        (Type::Bool, Type::Bool) => Ok(Type::Bool),
        _ => Err(CompileError::type_error(format!(
            "no common arithmetic type for '{}' and '{}'",
            lhs, rhs
        ))),
    }
}

/// Default promotion of a Python constant when no other constraint exists:
/// int literals become i32, float literals become f64.
pub fn default_constant_type(constant: &crate::ast::Constant) -> CompileResult<Type> {
    match constant {
        crate::ast::Constant::Int(_) => Ok(Type::I32),
        crate::ast::Constant::Float(_) => Ok(Type::F64),
        crate::ast::Constant::Bool(_) => Ok(Type::Bool),
        crate::ast::Constant::Str(_) => Ok(Type::ptr_to(Type::I8)),
        crate::ast::Constant::None => Err(CompileError::type_error(
            "None has no compiled representation",
        )),
    }
}

/// Cache of specialized types keyed by their canonical subscript rendering
/// (`array[i32,10]`, `ptr[Point]`, ...). Specializations are immutable, so
/// hits simply clone the cached value.
#[derive(Debug, Default)]
pub struct TypeCache {
    entries: HashMap<String, Type>,
}

impl TypeCache {
    pub fn new() -> Self {
        TypeCache { entries: HashMap::new() }
    }

    pub fn get_or_insert_with(
        &mut self,
        key: &str,
        build: impl FnOnce() -> CompileResult<Type>,
    ) -> CompileResult<Type> {
        if let Some(ty) = self.entries.get(key) {
            return Ok(ty.clone());
        }
        let ty = build()?;
        self.entries.insert(key.to_string(), ty.clone());
        Ok(ty)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> Type {
        Type::Struct(Rc::new(StructBody {
            name: "Point".to_string(),
            fields: vec![
                ("x".to_string(), Type::I32),
                ("y".to_string(), Type::I32),
            ],
        }))
    }

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(Type::I8.byte_size().unwrap(), 1);
        assert_eq!(Type::U64.byte_size().unwrap(), 8);
        assert_eq!(Type::F32.byte_size().unwrap(), 4);
        assert_eq!(Type::Bool.byte_size().unwrap(), 1);
        assert_eq!(Type::ptr_to(Type::Void).byte_size().unwrap(), 8);
        assert_eq!(Type::Linear.byte_size().unwrap(), 0);
    }

    #[test]
    fn test_struct_layout_with_padding() {
        let ty = Type::Struct(Rc::new(StructBody {
            name: "Mixed".to_string(),
            fields: vec![
                ("a".to_string(), Type::I8),
                ("b".to_string(), Type::I64),
                ("c".to_string(), Type::I8),
            ],
        }));
        // a at 0, b padded to 8, c at 16, total rounded to 24
        assert_eq!(ty.field_offset(0).unwrap(), 0);
        assert_eq!(ty.field_offset(1).unwrap(), 8);
        assert_eq!(ty.field_offset(2).unwrap(), 16);
        assert_eq!(ty.byte_size().unwrap(), 24);
        assert_eq!(ty.alignment().unwrap(), 8);
    }

    #[test]
    fn test_array_decay_one_dim() {
        let arr = Type::array_of(Type::I32, vec![10]);
        assert_eq!(arr.decay(), Type::ptr_to(Type::I32));
    }

    #[test]
    fn test_array_decay_multi_dim() {
        let arr = Type::array_of(Type::I32, vec![4, 5]);
        assert_eq!(arr.decay(), Type::ptr_to(Type::array_of(Type::I32, vec![5])));
    }

    #[test]
    fn test_decay_preserves_qualifiers() {
        let arr = Type::qualified(Type::array_of(Type::I32, vec![10]), Qualifiers::CONST);
        let decayed = arr.decay();
        assert!(decayed.qualifiers().is_const);
        assert_eq!(decayed.unwrapped(), &Type::ptr_to(Type::I32));
    }

    #[test]
    fn test_array_ir_type_nesting() {
        let arr = Type::array_of(Type::I32, vec![4, 5]);
        assert_eq!(arr.ir_type().unwrap(), "[4 x [5 x i32]]");
    }

    #[test]
    fn test_enum_layout() {
        let status = Type::Enum(Rc::new(EnumBody {
            name: "Status".to_string(),
            variants: vec![
                EnumVariant { name: "Ok".to_string(), payload: Some(Type::I32), tag: 0 },
                EnumVariant { name: "Err".to_string(), payload: Some(Type::I32), tag: 1 },
            ],
        }));
        // i32 tag + i32 payload
        assert_eq!(status.byte_size().unwrap(), 8);
        let (name, body) = status.ir_type_definition().unwrap().unwrap();
        assert_eq!(name, "Status");
        assert_eq!(body, "{ i32, [4 x i8] }");
    }

    #[test]
    fn test_promotion_width() {
        let t = promote_binary(&Type::I32, &Type::I64).unwrap();
        assert_eq!(t, Type::I64);
    }

    #[test]
    fn test_promotion_unsigned_wins_at_equal_width() {
        let t = promote_binary(&Type::I32, &Type::U32).unwrap();
        assert_eq!(t, Type::U32);
    }

    #[test]
    fn test_promotion_float_dominates() {
        let t = promote_binary(&Type::I64, &Type::F32).unwrap();
        assert_eq!(t, Type::F32);
        let t = promote_binary(&Type::F32, &Type::F64).unwrap();
        assert_eq!(t, Type::F64);
    }

    #[test]
    fn test_linear_paths_nested_struct() {
        let inner = Type::Struct(Rc::new(StructBody {
            name: "Inner".to_string(),
            fields: vec![
                ("tok".to_string(), Type::Linear),
                ("n".to_string(), Type::I32),
            ],
        }));
        let outer = Type::Struct(Rc::new(StructBody {
            name: "Outer".to_string(),
            fields: vec![
                ("a".to_string(), inner),
                ("t".to_string(), Type::Linear),
            ],
        }));
        let paths = outer.linear_paths();
        assert_eq!(paths, vec![vec![0, 0], vec![1]]);
    }

    #[test]
    fn test_refined_is_structurally_transparent() {
        let refined = Type::Refined {
            base: Box::new(point()),
            predicates: vec!["non_zero".to_string()],
            tags: vec!["checked".to_string()],
        };
        assert!(refined.compatible_with(&point()));
        assert_eq!(refined.byte_size().unwrap(), point().byte_size().unwrap());
    }

    #[test]
    fn test_display_round_trips_common_spellings() {
        assert_eq!(Type::I32.to_string(), "i32");
        assert_eq!(Type::U8.to_string(), "u8");
        assert_eq!(Type::ptr_to(Type::I32).to_string(), "ptr[i32]");
        assert_eq!(Type::array_of(Type::I32, vec![10]).to_string(), "array[i32,10]");
        assert_eq!(
            Type::qualified(Type::I32, Qualifiers::CONST).to_string(),
            "const[i32]"
        );
    }

    #[test]
    fn test_type_cache_hits() {
        let mut cache = TypeCache::new();
        let a = cache
            .get_or_insert_with("array[i32,10]", || Ok(Type::array_of(Type::I32, vec![10])))
            .unwrap();
        let b = cache
            .get_or_insert_with("array[i32,10]", || {
                panic!("cache should have hit");
            })
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_pyconst_has_no_size() {
        assert!(Type::PyConst.byte_size().is_err());
    }
}
