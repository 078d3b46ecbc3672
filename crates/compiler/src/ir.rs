//! IR builder adapter
//!
//! A thin, safe layer over textual LLVM IR. The lowering driver only talks
//! to this adapter: it enforces qualifier rules (no store through `const`,
//! `volatile` accesses stay volatile), applies C default promotions to
//! vararg calls, and handles indirect passing of large aggregates. The
//! rendered module is handed to the platform C driver, which owns actual
//! object emission.

use crate::error::{CompileError, CompileResult};
use crate::types::{Qualifiers, Type};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

/// Aggregates above this many bytes are passed and returned indirectly
const MAX_DIRECT_AGGREGATE: u64 = 16;

/// Target triple for the host platform
pub fn target_triple() -> &'static str {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        "arm64-apple-macosx14.0.0"
    }

    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    {
        "x86_64-apple-darwin"
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        "x86_64-unknown-linux-gnu"
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        "aarch64-unknown-linux-gnu"
    }

    #[cfg(not(any(
        all(target_os = "macos", target_arch = "aarch64"),
        all(target_os = "macos", target_arch = "x86_64"),
        all(target_os = "linux", target_arch = "x86_64"),
        all(target_os = "linux", target_arch = "aarch64")
    )))]
    {
        "unknown"
    }
}

/// One module's worth of IR: named types, globals, declarations, functions
#[derive(Debug, Default)]
pub struct IrModule {
    type_defs: BTreeMap<String, String>,
    declares: BTreeMap<String, String>,
    globals: Vec<String>,
    functions: Vec<String>,
    string_constants: HashMap<String, String>,
    string_counter: usize,
}

impl IrModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named aggregate (`%Name = type { ... }`)
    pub fn define_type(&mut self, name: &str, body: &str) {
        self.type_defs
            .entry(name.to_string())
            .or_insert_with(|| body.to_string());
    }

    /// Declare an external function once
    pub fn declare_function(&mut self, symbol: &str, ret_ir: &str, param_irs: &[String], vararg: bool) {
        let mut params = param_irs.join(", ");
        if vararg {
            if params.is_empty() {
                params = "...".to_string();
            } else {
                params.push_str(", ...");
            }
        }
        self.declares
            .entry(symbol.to_string())
            .or_insert_with(|| format!("declare {} @{}({})", ret_ir, symbol, params));
    }

    /// Intern a string literal, returning its global operand. Identical
    /// contents share one private constant.
    pub fn intern_string(&mut self, content: &str) -> String {
        if let Some(name) = self.string_constants.get(content) {
            return format!("@{}", name);
        }
        let name = format!("str.{}", self.string_counter);
        self.string_counter += 1;
        let mut encoded = String::new();
        for byte in content.as_bytes() {
            match byte {
                b' '..=b'~' if *byte != b'"' && *byte != b'\\' => encoded.push(*byte as char),
                b => {
                    let _ = write!(&mut encoded, "\\{:02X}", b);
                }
            }
        }
        self.globals.push(format!(
            "@{} = private unnamed_addr constant [{} x i8] c\"{}\\00\"",
            name,
            content.len() + 1,
            encoded
        ));
        self.string_constants.insert(content.to_string(), name.clone());
        format!("@{}", name)
    }

    pub fn push_function(&mut self, rendered: String) {
        self.functions.push(rendered);
    }

    /// Render the complete `.ll` module
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(&mut out, "target triple = \"{}\"", target_triple());
        let _ = writeln!(&mut out);
        for (name, body) in &self.type_defs {
            let _ = writeln!(&mut out, "%{} = type {}", name, body);
        }
        if !self.type_defs.is_empty() {
            let _ = writeln!(&mut out);
        }
        for global in &self.globals {
            let _ = writeln!(&mut out, "{}", global);
        }
        if !self.globals.is_empty() {
            let _ = writeln!(&mut out);
        }
        for decl in self.declares.values() {
            let _ = writeln!(&mut out, "{}", decl);
        }
        if !self.declares.is_empty() {
            let _ = writeln!(&mut out);
        }
        for func in &self.functions {
            let _ = writeln!(&mut out, "{}", func);
        }
        out
    }
}

#[derive(Debug)]
struct IrBlock {
    label: String,
    insts: Vec<String>,
    terminated: bool,
}

/// Builder for one function's IR. Blocks are created up front or on
/// demand; instructions go to the current block until it is terminated.
#[derive(Debug)]
pub struct FunctionIr {
    pub name: String,
    ret_ir: String,
    params: Vec<(String, String)>,
    blocks: Vec<IrBlock>,
    current: usize,
    temp_counter: usize,
    block_counter: usize,
    allocas: Vec<String>,
    internal: bool,
}

impl FunctionIr {
    pub fn new(name: impl Into<String>, ret_ir: impl Into<String>) -> Self {
        FunctionIr {
            name: name.into(),
            ret_ir: ret_ir.into(),
            params: Vec::new(),
            blocks: vec![IrBlock {
                label: "entry".to_string(),
                insts: Vec::new(),
                terminated: false,
            }],
            current: 0,
            temp_counter: 0,
            block_counter: 0,
            allocas: Vec::new(),
            internal: false,
        }
    }

    pub fn set_internal(&mut self, internal: bool) {
        self.internal = internal;
    }

    /// Add a parameter, returning its operand
    pub fn add_param(&mut self, ir_type: &str, name: &str) -> String {
        let operand = format!("%arg.{}", name);
        self.params.push((ir_type.to_string(), operand.clone()));
        operand
    }

    pub fn fresh_temp(&mut self) -> String {
        let t = format!("%t{}", self.temp_counter);
        self.temp_counter += 1;
        t
    }

    /// Create a labeled block; does not switch to it
    pub fn add_block(&mut self, prefix: &str) -> String {
        let label = format!("{}{}", prefix, self.block_counter);
        self.block_counter += 1;
        self.blocks.push(IrBlock { label: label.clone(), insts: Vec::new(), terminated: false });
        label
    }

    /// Create a block with an exact label (scoped label begin/end blocks
    /// need deterministic names for forward references)
    pub fn add_named_block(&mut self, label: &str) -> String {
        self.blocks.push(IrBlock {
            label: label.to_string(),
            insts: Vec::new(),
            terminated: false,
        });
        label.to_string()
    }

    /// Switch the insertion point to `label`
    pub fn position_at(&mut self, label: &str) -> CompileResult<()> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.label == label)
            .ok_or_else(|| CompileError::build(format!("unknown IR block '{}'", label)))?;
        self.current = index;
        Ok(())
    }

    pub fn current_label(&self) -> &str {
        &self.blocks[self.current].label
    }

    pub fn current_terminated(&self) -> bool {
        self.blocks[self.current].terminated
    }

    fn emit(&mut self, inst: String) -> CompileResult<()> {
        let block = &mut self.blocks[self.current];
        if block.terminated {
            return Err(CompileError::build(format!(
                "instruction after terminator in block '{}'",
                block.label
            )));
        }
        block.insts.push(inst);
        Ok(())
    }

    fn emit_terminator(&mut self, inst: String) -> CompileResult<()> {
        self.emit(inst)?;
        self.blocks[self.current].terminated = true;
        Ok(())
    }

    /// Stack slot in the entry block
    pub fn alloca(&mut self, ir_type: &str, hint: &str) -> String {
        let slot = format!("%{}.addr{}", hint, self.temp_counter);
        self.temp_counter += 1;
        self.allocas.push(format!("  {} = alloca {}", slot, ir_type));
        slot
    }

    pub fn load(&mut self, ir_type: &str, addr: &str, quals: Qualifiers) -> CompileResult<String> {
        let dst = self.fresh_temp();
        let volatile = if quals.is_volatile { "volatile " } else { "" };
        self.emit(format!("  {} = load {}{}, ptr {}", dst, volatile, ir_type, addr))?;
        Ok(dst)
    }

    /// Store with qualifier enforcement. A `const`-qualified destination is
    /// rejected here so no caller can emit the store by accident.
    pub fn store(
        &mut self,
        ir_type: &str,
        value: &str,
        addr: &str,
        quals: Qualifiers,
    ) -> CompileResult<()> {
        if quals.is_const {
            return Err(CompileError::const_qualifier(
                "cannot store through a const-qualified location",
            ));
        }
        let volatile = if quals.is_volatile { "volatile " } else { "" };
        self.emit(format!("  store {}{} {}, ptr {}", volatile, ir_type, value, addr))
    }

    /// `getelementptr` with explicit index operands
    pub fn gep(&mut self, base_ir_type: &str, addr: &str, indices: &[String]) -> CompileResult<String> {
        let dst = self.fresh_temp();
        self.emit(format!(
            "  {} = getelementptr {}, ptr {}, {}",
            dst,
            base_ir_type,
            addr,
            indices.join(", ")
        ))?;
        Ok(dst)
    }

    /// Field address inside a named aggregate
    pub fn struct_gep(&mut self, aggregate_ir: &str, addr: &str, index: usize) -> CompileResult<String> {
        self.gep(aggregate_ir, addr, &["i32 0".to_string(), format!("i32 {}", index)])
    }

    /// Pointer arithmetic: `base + index` in units of `element_ir`
    pub fn index_gep(&mut self, element_ir: &str, addr: &str, index: &str) -> CompileResult<String> {
        self.gep(element_ir, addr, &[format!("i64 {}", index)])
    }

    pub fn extract_value(&mut self, aggregate_ir: &str, value: &str, index: usize) -> CompileResult<String> {
        let dst = self.fresh_temp();
        self.emit(format!(
            "  {} = extractvalue {} {}, {}",
            dst, aggregate_ir, value, index
        ))?;
        Ok(dst)
    }

    pub fn insert_value(
        &mut self,
        aggregate_ir: &str,
        aggregate: &str,
        element_ir: &str,
        element: &str,
        index: usize,
    ) -> CompileResult<String> {
        let dst = self.fresh_temp();
        self.emit(format!(
            "  {} = insertvalue {} {}, {} {}, {}",
            dst, aggregate_ir, aggregate, element_ir, element, index
        ))?;
        Ok(dst)
    }

    pub fn bitcast(&mut self, value: &str, from_ir: &str, to_ir: &str) -> CompileResult<String> {
        let dst = self.fresh_temp();
        self.emit(format!("  {} = bitcast {} {} to {}", dst, from_ir, value, to_ir))?;
        Ok(dst)
    }

    /// Generic two-operand instruction (`add`, `fmul`, `and`, ...)
    pub fn binop(&mut self, opcode: &str, ir_type: &str, lhs: &str, rhs: &str) -> CompileResult<String> {
        let dst = self.fresh_temp();
        self.emit(format!("  {} = {} {} {}, {}", dst, opcode, ir_type, lhs, rhs))?;
        Ok(dst)
    }

    /// Integer or float comparison (`icmp slt`, `fcmp olt`, ...)
    pub fn cmp(&mut self, opcode: &str, ir_type: &str, lhs: &str, rhs: &str) -> CompileResult<String> {
        let dst = self.fresh_temp();
        self.emit(format!("  {} = {} {} {}, {}", dst, opcode, ir_type, lhs, rhs))?;
        Ok(dst)
    }

    /// Conversion instruction (`sext`, `trunc`, `sitofp`, ...)
    pub fn cast(&mut self, opcode: &str, value: &str, from_ir: &str, to_ir: &str) -> CompileResult<String> {
        let dst = self.fresh_temp();
        self.emit(format!("  {} = {} {} {} to {}", dst, opcode, from_ir, value, to_ir))?;
        Ok(dst)
    }

    pub fn branch(&mut self, label: &str) -> CompileResult<()> {
        self.emit_terminator(format!("  br label %{}", label))
    }

    pub fn conditional_branch(&mut self, cond: &str, then_label: &str, else_label: &str) -> CompileResult<()> {
        self.emit_terminator(format!(
            "  br i1 {}, label %{}, label %{}",
            cond, then_label, else_label
        ))
    }

    pub fn ret(&mut self, value: Option<(&str, &str)>) -> CompileResult<()> {
        match value {
            Some((ir_type, operand)) => self.emit_terminator(format!("  ret {} {}", ir_type, operand)),
            None => self.emit_terminator("  ret void".to_string()),
        }
    }

    pub fn unreachable(&mut self) -> CompileResult<()> {
        self.emit_terminator("  unreachable".to_string())
    }

    /// Call with per-argument ABI handling.
    ///
    /// `callee` is a finished operand: `@symbol` for direct calls or an SSA
    /// `%temp` for calls through a function pointer. Fixed arguments are
    /// passed as given (the lowering driver has already converted them to
    /// the parameter types); large aggregates go indirect through a
    /// temporary slot. Arguments beyond `fixed_params` (varargs) get C
    /// default promotions: sub-i32 integers widen to i32, f32 widens to f64.
    pub fn call(
        &mut self,
        callee: &str,
        args: &[(String, Type)],
        fixed_params: usize,
        vararg: bool,
        return_hint: &Type,
    ) -> CompileResult<Option<String>> {
        let mut rendered: Vec<String> = Vec::with_capacity(args.len());
        for (i, (operand, ty)) in args.iter().enumerate() {
            let ir_type = ty.ir_type()?;
            if i >= fixed_params && vararg {
                let (promoted_ir, promoted) = self.promote_vararg(operand, ty)?;
                rendered.push(format!("{} {}", promoted_ir, promoted));
            } else if is_large_aggregate(ty)? {
                let slot = self.alloca(&ir_type, "byval");
                self.store(&ir_type, operand, &slot, Qualifiers::NONE)?;
                rendered.push(format!("ptr byval({}) {}", ir_type, slot));
            } else {
                rendered.push(format!("{} {}", ir_type, operand));
            }
        }
        let ret_ir = return_hint.ir_type()?;
        // Vararg calls must repeat the callee's fixed prototype
        let signature = if vararg {
            let fixed: Vec<String> = args
                .iter()
                .take(fixed_params)
                .map(|(_, t)| t.ir_type())
                .collect::<CompileResult<_>>()?;
            format!("({}, ...) ", fixed.join(", "))
        } else {
            String::new()
        };
        if return_hint.is_void() {
            self.emit(format!(
                "  call {} {}{}({})",
                ret_ir,
                signature,
                callee,
                rendered.join(", ")
            ))?;
            Ok(None)
        } else {
            let dst = self.fresh_temp();
            self.emit(format!(
                "  {} = call {} {}{}({})",
                dst,
                ret_ir,
                signature,
                callee,
                rendered.join(", ")
            ))?;
            Ok(Some(dst))
        }
    }

    fn promote_vararg(&mut self, operand: &str, ty: &Type) -> CompileResult<(String, String)> {
        match ty.unwrapped() {
            Type::Int { width, signed } if *width < 32 => {
                let op = if *signed { "sext" } else { "zext" };
                let promoted = self.cast(op, operand, &ty.ir_type()?, "i32")?;
                Ok(("i32".to_string(), promoted))
            }
            Type::Bool => {
                let promoted = self.cast("zext", operand, "i1", "i32")?;
                Ok(("i32".to_string(), promoted))
            }
            Type::Float { width: 32 } => {
                let promoted = self.cast("fpext", operand, "float", "double")?;
                Ok(("double".to_string(), promoted))
            }
            _ => Ok((ty.ir_type()?, operand.to_string())),
        }
    }

    /// Render the finished function definition
    pub fn render(&self) -> String {
        let mut out = String::new();
        let params: Vec<String> = self
            .params
            .iter()
            .map(|(ty, name)| format!("{} {}", ty, name))
            .collect();
        let linkage = if self.internal { "internal " } else { "" };
        let _ = writeln!(
            &mut out,
            "define {}{} @{}({}) {{",
            linkage,
            self.ret_ir,
            self.name,
            params.join(", ")
        );
        for (i, block) in self.blocks.iter().enumerate() {
            let _ = writeln!(&mut out, "{}:", block.label);
            if i == 0 {
                for alloca in &self.allocas {
                    let _ = writeln!(&mut out, "{}", alloca);
                }
            }
            for inst in &block.insts {
                let _ = writeln!(&mut out, "{}", inst);
            }
            if !block.terminated {
                // Blocks left open (e.g. unreachable continuations) must
                // still parse as valid IR
                let _ = writeln!(&mut out, "  unreachable");
            }
        }
        let _ = writeln!(&mut out, "}}");
        out
    }
}

fn is_large_aggregate(ty: &Type) -> CompileResult<bool> {
    let aggregate = matches!(
        ty.unwrapped(),
        Type::Struct(_) | Type::Enum(_) | Type::Array { .. } | Type::Union { .. }
    );
    Ok(aggregate && ty.byte_size()? > MAX_DIRECT_AGGREGATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_to_const_rejected() {
        let mut f = FunctionIr::new("f", "void");
        let err = f.store("i32", "0", "%slot", Qualifiers::CONST).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ConstQualifier);
    }

    #[test]
    fn test_volatile_load_store() {
        let mut f = FunctionIr::new("f", "void");
        let slot = f.alloca("i32", "x");
        f.store("i32", "1", &slot, Qualifiers::VOLATILE).unwrap();
        let loaded = f.load("i32", &slot, Qualifiers::VOLATILE).unwrap();
        let rendered = f.render();
        assert!(rendered.contains("store volatile i32 1"));
        assert!(rendered.contains(&format!("{} = load volatile i32", loaded)));
    }

    #[test]
    fn test_no_instructions_after_terminator() {
        let mut f = FunctionIr::new("f", "void");
        f.ret(None).unwrap();
        assert!(f.binop("add", "i32", "1", "2").is_err());
    }

    #[test]
    fn test_vararg_promotions() {
        let mut f = FunctionIr::new("f", "void");
        f.call(
            "@printf",
            &[
                ("@str".to_string(), Type::ptr_to(Type::I8)),
                ("%small".to_string(), Type::I8),
                ("%flt".to_string(), Type::F32),
            ],
            1,
            true,
            &Type::I32,
        )
        .unwrap();
        let rendered = f.render();
        assert!(rendered.contains("sext i8 %small to i32"));
        assert!(rendered.contains("fpext float %flt to double"));
        assert!(rendered.contains("call i32 (ptr, ...) @printf"));
    }

    #[test]
    fn test_string_interning_dedupes() {
        let mut module = IrModule::new();
        let a = module.intern_string("hi");
        let b = module.intern_string("hi");
        let c = module.intern_string("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        let rendered = module.render();
        assert_eq!(rendered.matches("private unnamed_addr constant").count(), 2);
    }

    #[test]
    fn test_module_render_order() {
        let mut module = IrModule::new();
        module.define_type("Point", "{ i32, i32 }");
        module.declare_function("malloc", "ptr", &["i64".to_string()], false);
        let mut f = FunctionIr::new("main", "i32");
        f.ret(Some(("i32", "0"))).unwrap();
        module.push_function(f.render());
        let rendered = module.render();
        let type_pos = rendered.find("%Point = type").unwrap();
        let decl_pos = rendered.find("declare ptr @malloc").unwrap();
        let def_pos = rendered.find("define i32 @main").unwrap();
        assert!(type_pos < decl_pos && decl_pos < def_pos);
    }

    #[test]
    fn test_blocks_render_in_creation_order() {
        let mut f = FunctionIr::new("f", "void");
        let then_b = f.add_block("if_then");
        let merge = f.add_block("if_merge");
        f.conditional_branch("%c", &then_b, &merge).unwrap();
        f.position_at(&then_b).unwrap();
        f.branch(&merge).unwrap();
        f.position_at(&merge).unwrap();
        f.ret(None).unwrap();
        let rendered = f.render();
        let entry = rendered.find("entry:").unwrap();
        let then_pos = rendered.find(&format!("{}:", then_b)).unwrap();
        let merge_pos = rendered.find(&format!("{}:", merge)).unwrap();
        assert!(entry < then_pos && then_pos < merge_pos);
    }
}
