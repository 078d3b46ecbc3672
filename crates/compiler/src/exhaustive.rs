//! Pattern-matrix exhaustiveness checking for match statements
//!
//! Maranget-style: the matrix holds one row per unguarded arm (a guard may
//! evaluate false, so guarded rows never count toward coverage) and one
//! column per subject component. A column whose type is finite (bool, enum
//! with finite payloads, struct of finite fields) is checked by
//! enumerating its constructors and specializing; an infinite column
//! (ints, floats, pointers) is covered only by a wildcard.
//!
//! Descent into enum payloads is bounded by the set of enums already on
//! the path, so recursive payloads terminate: a payload type already in
//! progress is treated as infinite and needs a wildcard.

use crate::ast::{Constant, MatchCase, MatchPattern};
use crate::error::{CompileError, CompileResult};
use crate::types::{EnumBody, Type};
use std::collections::HashMap;
use std::rc::Rc;

/// Cap on reported witnesses so degenerate matches stay readable
const MAX_WITNESSES: usize = 8;

/// Normalized pattern, one per matrix cell
#[derive(Debug, Clone, PartialEq)]
pub enum Pat {
    Wildcard,
    LitInt(i64),
    LitBool(bool),
    /// Enum variant or struct aggregate
    Constructor {
        tag: i64,
        name: String,
        subs: Vec<Pat>,
    },
    Or(Vec<Pat>),
}

impl Pat {
    fn is_wildcard(&self) -> bool {
        matches!(self, Pat::Wildcard)
    }
}

/// Normalize one surface case pattern against the subject type.
///
/// `enums` resolves dotted variant references (`Status.Ok`).
pub fn normalize_pattern(
    pattern: &MatchPattern,
    subject: &Type,
    enums: &HashMap<String, Rc<EnumBody>>,
) -> CompileResult<Pat> {
    match pattern {
        MatchPattern::Wildcard { .. } => Ok(Pat::Wildcard),
        MatchPattern::Literal(Constant::Int(v)) => Ok(Pat::LitInt(*v)),
        MatchPattern::Literal(Constant::Bool(v)) => Ok(Pat::LitBool(*v)),
        MatchPattern::Literal(c) => Err(CompileError::type_error(format!(
            "unsupported literal pattern {}",
            c
        ))),
        MatchPattern::Value { path } => {
            let (body, index) = resolve_variant(path, enums)?;
            let variant = &body.variants[index];
            if variant.payload.is_some() {
                return Err(CompileError::type_error(format!(
                    "variant '{}' carries a payload; match it as ({}, <pattern>)",
                    variant.name,
                    path.join(".")
                )));
            }
            Ok(Pat::Constructor {
                tag: variant.tag,
                name: format!("{}.{}", body.name, variant.name),
                subs: Vec::new(),
            })
        }
        MatchPattern::Sequence(parts) => match subject.unwrapped() {
            Type::Enum(_) => {
                let Some(MatchPattern::Value { path }) = parts.first() else {
                    return Err(CompileError::type_error(
                        "enum tuple pattern must start with a variant reference",
                    ));
                };
                let (body, index) = resolve_variant(path, enums)?;
                let variant = &body.variants[index];
                let payload = variant.payload.clone();
                let expected = usize::from(payload.is_some());
                if parts.len() - 1 != expected {
                    return Err(CompileError::type_error(format!(
                        "variant '{}' expects {} payload pattern{}, got {}",
                        variant.name,
                        expected,
                        if expected == 1 { "" } else { "s" },
                        parts.len() - 1
                    )));
                }
                let mut subs = Vec::new();
                if let Some(payload_ty) = payload {
                    subs.push(normalize_pattern(&parts[1], &payload_ty, enums)?);
                }
                Ok(Pat::Constructor {
                    tag: variant.tag,
                    name: format!("{}.{}", body.name, variant.name),
                    subs,
                })
            }
            Type::Struct(body) => {
                if parts.len() != body.fields.len() {
                    return Err(CompileError::type_error(format!(
                        "struct '{}' has {} fields, pattern has {}",
                        body.name,
                        body.fields.len(),
                        parts.len()
                    )));
                }
                let subs: CompileResult<Vec<Pat>> = parts
                    .iter()
                    .zip(body.fields.iter())
                    .map(|(p, (_, t))| normalize_pattern(p, t, enums))
                    .collect();
                Ok(Pat::Constructor {
                    tag: 0,
                    name: body.name.clone(),
                    subs: subs?,
                })
            }
            other => Err(CompileError::type_error(format!(
                "tuple pattern applied to non-aggregate type '{}'",
                other
            ))),
        },
        MatchPattern::Or(alts) => {
            let alts: CompileResult<Vec<Pat>> = alts
                .iter()
                .map(|p| normalize_pattern(p, subject, enums))
                .collect();
            Ok(Pat::Or(alts?))
        }
    }
}

fn resolve_variant(
    path: &[String],
    enums: &HashMap<String, Rc<EnumBody>>,
) -> CompileResult<(Rc<EnumBody>, usize)> {
    let (enum_name, variant_name) = match path {
        [e, v] => (e, v),
        _ => {
            return Err(CompileError::name_error(format!(
                "'{}' is not an enum variant reference",
                path.join(".")
            )));
        }
    };
    let body = enums.get(enum_name).ok_or_else(|| {
        CompileError::name_error(format!("unknown enum '{}' in pattern", enum_name))
    })?;
    let (index, _) = body.variant(variant_name).ok_or_else(|| {
        CompileError::name_error(format!(
            "enum '{}' has no variant '{}'",
            enum_name, variant_name
        ))
    })?;
    Ok((body.clone(), index))
}

/// One enumerable constructor of a finite type
struct Ctor {
    tag: i64,
    display: String,
    sub_types: Vec<Type>,
}

/// Enumerate the constructors of a finite type; `None` when infinite.
/// `in_progress` holds enum names already on the descent path.
fn finite_constructors(ty: &Type, in_progress: &mut Vec<String>) -> Option<Vec<Ctor>> {
    match ty.unwrapped() {
        Type::Bool => Some(vec![
            Ctor { tag: 0, display: "False".to_string(), sub_types: vec![] },
            Ctor { tag: 1, display: "True".to_string(), sub_types: vec![] },
        ]),
        Type::Enum(body) => {
            if in_progress.iter().any(|n| n == &body.name) {
                return None;
            }
            in_progress.push(body.name.clone());
            let ctors = body
                .variants
                .iter()
                .map(|v| Ctor {
                    tag: v.tag,
                    display: format!("{}.{}", body.name, v.name),
                    sub_types: v.payload.iter().cloned().collect(),
                })
                .collect();
            in_progress.pop();
            Some(ctors)
        }
        Type::Struct(body) => {
            let sub_types: Vec<Type> = body.fields.iter().map(|(_, t)| t.clone()).collect();
            Some(vec![Ctor {
                tag: 0,
                display: body.name.clone(),
                sub_types,
            }])
        }
        _ => None,
    }
}

/// A witness: one human-readable string per remaining column
type Witness = Vec<String>;

fn expand_or_rows(rows: &[Vec<Pat>]) -> Vec<Vec<Pat>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match row.first() {
            Some(Pat::Or(alts)) => {
                for alt in alts {
                    let mut expanded = row.clone();
                    expanded[0] = alt.clone();
                    out.push(expanded);
                }
            }
            _ => out.push(row.clone()),
        }
    }
    out
}

/// Witnesses of values not covered by the matrix. Empty result means the
/// matrix is exhaustive.
fn uncovered(
    rows: &[Vec<Pat>],
    types: &[Type],
    in_progress: &mut Vec<String>,
) -> Vec<Witness> {
    if types.is_empty() {
        // No columns left: covered iff any row survived specialization
        return if rows.is_empty() { vec![Vec::new()] } else { Vec::new() };
    }
    let rows = expand_or_rows(rows);
    let head_ty = &types[0];
    let rest_types = &types[1..];

    match finite_constructors(head_ty, in_progress) {
        Some(ctors) => {
            let mut witnesses = Vec::new();
            for ctor in ctors {
                let arity = ctor.sub_types.len();
                let mut specialized: Vec<Vec<Pat>> = Vec::new();
                for row in &rows {
                    match &row[0] {
                        Pat::Wildcard => {
                            let mut new_row = vec![Pat::Wildcard; arity];
                            new_row.extend_from_slice(&row[1..]);
                            specialized.push(new_row);
                        }
                        Pat::Constructor { tag, subs, .. } if *tag == ctor.tag => {
                            let mut new_row = subs.clone();
                            new_row.extend_from_slice(&row[1..]);
                            specialized.push(new_row);
                        }
                        Pat::LitBool(v) => {
                            let tag = i64::from(*v);
                            if tag == ctor.tag {
                                specialized.push(row[1..].to_vec());
                            }
                        }
                        _ => {}
                    }
                }
                let mut sub_types: Vec<Type> = ctor.sub_types.clone();
                sub_types.extend_from_slice(rest_types);
                for sub_witness in uncovered(&specialized, &sub_types, in_progress) {
                    let (payload, rest) = sub_witness.split_at(arity);
                    let head = if arity == 0 {
                        ctor.display.clone()
                    } else {
                        format!("({}, {})", ctor.display, payload.join(", "))
                    };
                    let mut witness = vec![head];
                    witness.extend_from_slice(rest);
                    witnesses.push(witness);
                    if witnesses.len() >= MAX_WITNESSES {
                        return witnesses;
                    }
                }
            }
            witnesses
        }
        None => {
            // Infinite head column: only wildcard rows keep matching
            let default_rows: Vec<Vec<Pat>> = rows
                .iter()
                .filter(|row| row[0].is_wildcard())
                .map(|row| row[1..].to_vec())
                .collect();
            uncovered(&default_rows, rest_types, in_progress)
                .into_iter()
                .map(|mut w| {
                    w.insert(0, "_".to_string());
                    w
                })
                .collect()
        }
    }
}

/// Check a match statement for exhaustiveness.
///
/// Returns the uncovered patterns in human-readable form; an empty vector
/// means the match is exhaustive. Guarded arms are excluded from the
/// matrix (a guard may fail at runtime).
pub fn check_match(
    subject: &Type,
    cases: &[MatchCase],
    enums: &HashMap<String, Rc<EnumBody>>,
) -> CompileResult<Vec<String>> {
    let mut rows = Vec::new();
    for case in cases {
        if case.guard.is_some() {
            continue;
        }
        rows.push(vec![normalize_pattern(&case.pattern, subject, enums)?]);
    }
    let mut in_progress = Vec::new();
    let witnesses = uncovered(&rows, std::slice::from_ref(subject), &mut in_progress);
    Ok(witnesses
        .into_iter()
        .map(|w| w.join(", "))
        .collect())
}

/// Build the ExhaustivenessError for a non-empty witness list
pub fn exhaustiveness_error(missing: &[String]) -> CompileError {
    CompileError::exhaustiveness(format!(
        "match is not exhaustive; uncovered: {}",
        missing.join("; ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnumVariant;

    fn status() -> (Type, HashMap<String, Rc<EnumBody>>) {
        let body = Rc::new(EnumBody {
            name: "Status".to_string(),
            variants: vec![
                EnumVariant { name: "Ok".to_string(), payload: Some(Type::I32), tag: 0 },
                EnumVariant { name: "Err".to_string(), payload: Some(Type::I32), tag: 1 },
            ],
        });
        let mut enums = HashMap::new();
        enums.insert("Status".to_string(), body.clone());
        (Type::Enum(body), enums)
    }

    fn color() -> (Type, HashMap<String, Rc<EnumBody>>) {
        let body = Rc::new(EnumBody {
            name: "Color".to_string(),
            variants: vec![
                EnumVariant { name: "Red".to_string(), payload: None, tag: 0 },
                EnumVariant { name: "Green".to_string(), payload: None, tag: 1 },
                EnumVariant { name: "Blue".to_string(), payload: None, tag: 2 },
            ],
        });
        let mut enums = HashMap::new();
        enums.insert("Color".to_string(), body.clone());
        (Type::Enum(body), enums)
    }

    fn case(pattern: MatchPattern) -> MatchCase {
        MatchCase { pattern, guard: None, body: vec![] }
    }

    fn variant(path: &[&str]) -> MatchPattern {
        MatchPattern::Value { path: path.iter().map(|s| s.to_string()).collect() }
    }

    #[test]
    fn test_wildcard_is_exhaustive() {
        let (ty, enums) = status();
        let missing = check_match(
            &ty,
            &[case(MatchPattern::Wildcard { binding: None })],
            &enums,
        )
        .unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_missing_variant_reported() {
        let (ty, enums) = status();
        let missing = check_match(
            &ty,
            &[case(MatchPattern::Sequence(vec![
                variant(&["Status", "Ok"]),
                MatchPattern::Wildcard { binding: Some("n".to_string()) },
            ]))],
            &enums,
        )
        .unwrap();
        assert_eq!(missing, vec!["(Status.Err, _)".to_string()]);
    }

    #[test]
    fn test_all_bare_variants_cover() {
        let (ty, enums) = color();
        let missing = check_match(
            &ty,
            &[
                case(variant(&["Color", "Red"])),
                case(variant(&["Color", "Green"])),
                case(variant(&["Color", "Blue"])),
            ],
            &enums,
        )
        .unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_or_pattern_counts_both_sides() {
        let (ty, enums) = color();
        let missing = check_match(
            &ty,
            &[
                case(MatchPattern::Or(vec![
                    variant(&["Color", "Red"]),
                    variant(&["Color", "Green"]),
                ])),
                case(variant(&["Color", "Blue"])),
            ],
            &enums,
        )
        .unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_guarded_arm_does_not_count() {
        let (ty, enums) = color();
        let mut guarded = case(MatchPattern::Wildcard { binding: None });
        guarded.guard = Some(crate::ast::Expr::name("cond"));
        let missing = check_match(&ty, &[guarded], &enums).unwrap();
        assert_eq!(missing.len(), 3);
    }

    #[test]
    fn test_bool_enumeration() {
        let enums = HashMap::new();
        let missing = check_match(
            &Type::Bool,
            &[case(MatchPattern::Literal(Constant::Bool(true)))],
            &enums,
        )
        .unwrap();
        assert_eq!(missing, vec!["False".to_string()]);
    }

    #[test]
    fn test_int_subject_needs_wildcard() {
        let enums = HashMap::new();
        let missing = check_match(
            &Type::I32,
            &[case(MatchPattern::Literal(Constant::Int(0)))],
            &enums,
        )
        .unwrap();
        assert_eq!(missing, vec!["_".to_string()]);
    }

    #[test]
    fn test_enum_payload_enumeration() {
        // enum with bool payload: covering only (Flag.Set, True) leaves
        // (Flag.Set, False) open
        let body = Rc::new(EnumBody {
            name: "Flag".to_string(),
            variants: vec![
                EnumVariant { name: "Set".to_string(), payload: Some(Type::Bool), tag: 0 },
                EnumVariant { name: "Clear".to_string(), payload: None, tag: 1 },
            ],
        });
        let mut enums = HashMap::new();
        enums.insert("Flag".to_string(), body.clone());
        let ty = Type::Enum(body);
        let missing = check_match(
            &ty,
            &[
                case(MatchPattern::Sequence(vec![
                    variant(&["Flag", "Set"]),
                    MatchPattern::Literal(Constant::Bool(true)),
                ])),
                case(variant(&["Flag", "Clear"])),
            ],
            &enums,
        )
        .unwrap();
        assert_eq!(missing, vec!["(Flag.Set, False)".to_string()]);
    }

    #[test]
    fn test_in_progress_enum_treated_as_infinite() {
        // A payload type already on the descent path degrades to infinite,
        // which bounds recursion through self-referential enums
        let (ty, _) = color();
        let mut in_progress = vec!["Color".to_string()];
        assert!(finite_constructors(&ty, &mut in_progress).is_none());
    }
}
