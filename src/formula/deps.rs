//! Dependency resolution: which raw sensor keys does a formula read?
//!
//! Derived from the compiled AST rather than by scanning text, so every
//! literal field lookup is found. Lookups with a computed key are not
//! tracked.

use std::collections::BTreeMap;

use serde::Serialize;

use super::eval::GLOBAL_FNS;
use super::parser::{Expr, Program, Stmt};
use super::Formula;
use crate::FormulaError;

// ---

/// Anchor used when a formula reads no raw sensor at all, so every derived
/// series still has timestamps to align on.
pub const FALLBACK_DEPENDENCY: &str = "pressure:barometer";

/// Key of the timestamp entry in every field mapping.
pub const TIMESTAMP_FIELD: &str = "d";

/// Raw-sensor keys read by a formula (first-seen order, no duplicates) and
/// the short field name for each.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependencies {
    // ---
    pub dependency_keys: Vec<String>,
    pub field_mapping: BTreeMap<String, String>,
}

/// Compile `source` and resolve its dependencies.
pub fn resolve(source: &str) -> Result<Dependencies, FormulaError> {
    Ok(Formula::compile(source)?.dependencies())
}

/// Part of a sensor key after the category separator, or the whole key.
pub fn short_name(key: &str) -> &str {
    key.split_once(':').map_or(key, |(_, name)| name)
}

pub(crate) fn dependencies_of(program: &Program) -> Dependencies {
    // ---
    let mut keys = Vec::new();
    for stmt in &program.body {
        visit_stmt(stmt, &mut keys);
    }
    if keys.is_empty() {
        keys.push(FALLBACK_DEPENDENCY.to_string());
    }

    let mut field_mapping: BTreeMap<String, String> = keys
        .iter()
        .map(|k| (k.clone(), short_name(k).to_string()))
        .collect();
    field_mapping.insert(TIMESTAMP_FIELD.to_string(), "timestamp".to_string());

    Dependencies {
        dependency_keys: keys,
        field_mapping,
    }
}

fn is_sensor_key(s: &str) -> bool {
    matches!(s.split_once(':'), Some((cat, name)) if !cat.is_empty() && !name.is_empty())
}

fn push_unique(keys: &mut Vec<String>, key: &str) {
    if !keys.iter().any(|k| k == key) {
        keys.push(key.to_string());
    }
}

fn visit_stmt(stmt: &Stmt, keys: &mut Vec<String>) {
    // ---
    match stmt {
        Stmt::Let(_, e) | Stmt::Return(e) | Stmt::Expr(e) => visit_expr(e, keys),
        Stmt::If(cond, then, otherwise) => {
            visit_expr(cond, keys);
            then.iter().chain(otherwise).for_each(|s| visit_stmt(s, keys));
        }
        Stmt::Block(body) => body.iter().for_each(|s| visit_stmt(s, keys)),
    }
}

fn visit_expr(expr: &Expr, keys: &mut Vec<String>) {
    // ---
    match expr {
        Expr::Index(target, index) => {
            visit_expr(target, keys);
            match index.as_ref() {
                Expr::Str(key) if is_sensor_key(key) => push_unique(keys, key),
                other => visit_expr(other, keys),
            }
        }
        Expr::Call(callee, args) => {
            visit_expr(callee, keys);
            let aggregate = matches!(callee.as_ref(), Expr::Ident(name) if GLOBAL_FNS.contains(&name.as_str()));
            for arg in args {
                match arg {
                    Expr::Str(key) if aggregate && is_sensor_key(key) => push_unique(keys, key),
                    other => visit_expr(other, keys),
                }
            }
        }
        Expr::Member(target, _) | Expr::Unary(_, target) => visit_expr(target, keys),
        Expr::Binary(_, l, r) | Expr::Logical(_, l, r) => {
            visit_expr(l, keys);
            visit_expr(r, keys);
        }
        Expr::Cond(c, t, f) => {
            visit_expr(c, keys);
            visit_expr(t, keys);
            visit_expr(f, keys);
        }
        Expr::Object(fields) => fields.iter().for_each(|(_, e)| visit_expr(e, keys)),
        Expr::Num(_)
        | Expr::Str(_)
        | Expr::Bool(_)
        | Expr::Null
        | Expr::Placeholder(_)
        | Expr::Ident(_) => {}
    }
}
