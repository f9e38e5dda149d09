//! Sandboxed formula language for derived sensors.
//!
//! A formula is compiled once (when a definition is saved or loaded) into a
//! restricted AST: arithmetic, comparisons, an allow-listed function set and
//! field lookups. Nothing outside that grammar is ever executed.
//!
//! EMBP gateway: `lexer` and `parser` are private, `eval` and `deps` export
//! the evaluation and dependency-resolution surface.

mod deps;
mod eval;
mod lexer;
mod parser;

pub use deps::{resolve, short_name, Dependencies, FALLBACK_DEPENDENCY, TIMESTAMP_FIELD};
pub use eval::{StationConstants, Value};

use eval::{Interpreter, GLOBAL_FNS, MATH_CONSTS, MATH_FNS, TIME_METHODS};
use parser::{parse_program, Expr, Name, Program, Stmt};

use crate::models::Record;
use crate::FormulaError;

// ---

const PLACEHOLDERS: &[&str] = &["longitude", "latitude", "altitude"];

/// A compiled formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    // ---
    source: String,
    program: Program,
}

impl Formula {
    // ---
    /// Parse and statically check `source`. Unknown identifiers, functions
    /// and placeholders are rejected here rather than at evaluation time.
    pub fn compile(source: &str) -> Result<Self, FormulaError> {
        // ---
        let program = parse_program(source)?;
        let mut checker = Checker {
            scope: if program.params.is_empty() {
                vec!["data".into(), "history".into(), "forecast".into()]
            } else {
                program.params.clone()
            },
        };
        checker.block(&program.body)?;

        Ok(Self {
            source: source.to_string(),
            program,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn dependencies(&self) -> Dependencies {
        deps::dependencies_of(&self.program)
    }

    /// Evaluate against one record (point-wise derivation). The record is
    /// bound to the first parameter, or to `data` for a bare body.
    pub fn evaluate<'a>(
        &self,
        record: &'a Record,
        constants: &StationConstants,
    ) -> Result<Value<'a>, FormulaError> {
        // ---
        let name = self.param(0, "data");
        Interpreter::new(vec![(name, Value::Record(record))], constants).run(&self.program)
    }

    /// Evaluate once over whole arrays (model-style derivation). History and
    /// forecast are bound to the first two parameters, or to `history` and
    /// `forecast` for a bare body.
    pub fn evaluate_model<'a>(
        &self,
        history: &'a [Record],
        forecast: &'a [Record],
        constants: &StationConstants,
    ) -> Result<Value<'a>, FormulaError> {
        // ---
        let bindings = vec![
            (self.param(0, "history"), Value::Series(history)),
            (self.param(1, "forecast"), Value::Series(forecast)),
        ];
        Interpreter::new(bindings, constants).run(&self.program)
    }

    fn param(&self, idx: usize, default: &str) -> String {
        // ---
        if self.program.params.is_empty() {
            default.to_string()
        } else {
            self.program
                .params
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("${idx}"))
        }
    }
}

/// Compile `source` and evaluate it against one record.
pub fn evaluate<'a>(
    source: &str,
    record: &'a Record,
    constants: &StationConstants,
) -> Result<Value<'a>, FormulaError> {
    Formula::compile(source)?.evaluate(record, constants)
}

/// Static checks over the AST: every identifier is bound, every call targets
/// the allow-list.
struct Checker {
    scope: Vec<String>,
}

/// Offset of the first name inside `expr`, for errors about the whole
/// expression.
fn offset_of(expr: &Expr) -> Option<usize> {
    // ---
    match expr {
        Expr::Ident(name) | Expr::Placeholder(name) => Some(name.pos),
        Expr::Member(target, name) => offset_of(target).or(Some(name.pos)),
        Expr::Index(target, _) | Expr::Call(target, _) | Expr::Unary(_, target) => offset_of(target),
        Expr::Binary(_, l, r) | Expr::Logical(_, l, r) => offset_of(l).or_else(|| offset_of(r)),
        Expr::Cond(c, _, _) => offset_of(c),
        Expr::Object(fields) => fields.iter().find_map(|(_, e)| offset_of(e)),
        Expr::Num(_) | Expr::Str(_) | Expr::Bool(_) | Expr::Null => None,
    }
}

impl Checker {
    // ---
    fn reject(&self, at: &Name, message: String) -> FormulaError {
        FormulaError::parse(at.pos, message)
    }

    fn bound(&self, name: &str) -> bool {
        self.scope.iter().any(|n| n == name)
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<(), FormulaError> {
        // ---
        let mark = self.scope.len();
        for stmt in stmts {
            match stmt {
                Stmt::Let(name, init) => {
                    self.expr(init)?;
                    self.scope.push(name.clone());
                }
                Stmt::Return(e) | Stmt::Expr(e) => self.expr(e)?,
                Stmt::If(cond, then, otherwise) => {
                    self.expr(cond)?;
                    self.block(then)?;
                    self.block(otherwise)?;
                }
                Stmt::Block(body) => self.block(body)?,
            }
        }
        self.scope.truncate(mark);
        Ok(())
    }

    fn is_math(&self, expr: &Expr) -> bool {
        matches!(expr, Expr::Ident(name) if name == "Math" && !self.bound("Math"))
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), FormulaError> {
        // ---
        match expr {
            Expr::Num(_) | Expr::Str(_) | Expr::Bool(_) | Expr::Null => Ok(()),
            Expr::Placeholder(name) => {
                if PLACEHOLDERS.contains(&name.as_str()) {
                    Ok(())
                } else {
                    Err(self.reject(name, format!("unknown placeholder %{name}%")))
                }
            }
            Expr::Ident(name) => {
                if self.bound(name) {
                    Ok(())
                } else {
                    Err(self.reject(name, format!("'{name}' is not defined")))
                }
            }
            Expr::Object(fields) => fields.iter().try_for_each(|(_, e)| self.expr(e)),
            Expr::Member(target, name) if self.is_math(target) => {
                if MATH_CONSTS.contains(&name.as_str()) {
                    Ok(())
                } else {
                    Err(self.reject(name, format!("Math.{name} is not available")))
                }
            }
            Expr::Member(target, _) | Expr::Unary(_, target) => self.expr(target),
            Expr::Index(target, index) => {
                self.expr(target)?;
                self.expr(index)
            }
            Expr::Binary(_, l, r) | Expr::Logical(_, l, r) => {
                self.expr(l)?;
                self.expr(r)
            }
            Expr::Cond(c, t, f) => {
                self.expr(c)?;
                self.expr(t)?;
                self.expr(f)
            }
            Expr::Call(callee, args) => {
                self.callee(callee)?;
                args.iter().try_for_each(|a| self.expr(a))
            }
        }
    }

    fn callee(&mut self, callee: &Expr) -> Result<(), FormulaError> {
        // ---
        match callee {
            Expr::Member(target, name) if self.is_math(target) => {
                if MATH_FNS.contains(&name.as_str()) {
                    Ok(())
                } else {
                    Err(self.reject(name, format!("Math.{name} is not available")))
                }
            }
            Expr::Member(target, method) => {
                if !TIME_METHODS.contains(&method.as_str()) {
                    return Err(self.reject(method, format!("method '{method}' is not available")));
                }
                self.expr(target)
            }
            Expr::Ident(name) if !self.bound(name) && GLOBAL_FNS.contains(&name.as_str()) => Ok(()),
            Expr::Ident(name) => Err(self.reject(name, format!("'{name}' is not a function"))),
            other => Err(FormulaError::parse(
                offset_of(other).unwrap_or(0),
                "expression is not callable",
            )),
        }
    }
}
