//! Tree-walking evaluator for compiled formulas.
//!
//! Pure: no I/O, no loops, no user-defined functions, so evaluation always
//! terminates. The only inputs are the bound record(s) and station constants.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::parser::{BinOp, Expr, Program, Stmt, UnOp};
use crate::models::Record;
use crate::FormulaError;

// ---

/// Fixed station coordinates bound to `%longitude%`, `%latitude%`, `%altitude%`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StationConstants {
    // ---
    pub longitude: f64,
    pub latitude: f64,
    pub altitude: f64,
}

impl StationConstants {
    // ---
    pub(crate) fn get(&self, name: &str) -> Option<f64> {
        match name {
            "longitude" => Some(self.longitude),
            "latitude" => Some(self.latitude),
            "altitude" => Some(self.altitude),
            _ => None,
        }
    }
}

/// Result of evaluating a formula or one of its sub-expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<'a> {
    // ---
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Time(DateTime<Utc>),
    Record(&'a Record),
    Series(&'a [Record]),
    Object(BTreeMap<String, Value<'a>>),
}

impl Value<'_> {
    // ---
    /// Reduce a formula result to a plottable scalar. Objects reduce to their
    /// `value` field. `None` marks the point invalid.
    pub fn to_scalar(&self) -> Option<f64> {
        // ---
        let n = match self {
            Value::Number(n) => *n,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Object(fields) => return fields.get("value")?.to_scalar(),
            _ => return None,
        };
        n.is_finite().then_some(n)
    }

    fn truthy(&self) -> bool {
        // ---
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Text(s) => !s.is_empty(),
            _ => true,
        }
    }

    fn type_name(&self) -> &'static str {
        // ---
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Text(_) => "string",
            Value::Time(_) => "timestamp",
            Value::Record(_) => "record",
            Value::Series(_) => "series",
            Value::Object(_) => "object",
        }
    }

    fn to_number(&self) -> Result<f64, FormulaError> {
        // ---
        match self {
            Value::Number(n) => Ok(*n),
            Value::Bool(b) => Ok(f64::from(u8::from(*b))),
            Value::Null => Ok(0.0),
            Value::Time(t) => Ok(t.timestamp_millis() as f64),
            other => Err(FormulaError::runtime(format!(
                "expected a number, got {}",
                other.type_name()
            ))),
        }
    }
}

pub(crate) const MATH_FNS: &[&str] = &[
    "abs", "sqrt", "cbrt", "exp", "log", "log10", "log2", "pow", "min", "max", "round", "floor",
    "ceil", "trunc", "sign", "sin", "cos", "tan", "asin", "acos", "atan", "atan2", "hypot",
];

pub(crate) const MATH_CONSTS: &[&str] = &["PI", "E", "LN2", "LN10", "SQRT2"];

pub(crate) const GLOBAL_FNS: &[&str] = &[
    "isNaN", "isFinite", "dayOfYear", "mean", "sum", "min", "max", "first", "last", "count",
];

pub(crate) const TIME_METHODS: &[&str] = &[
    "getTime",
    "valueOf",
    "getUTCHours",
    "getHours",
    "getUTCMinutes",
    "getMinutes",
    "getUTCMonth",
    "getMonth",
    "getUTCFullYear",
    "getFullYear",
    "getUTCDate",
    "getDate",
    "getUTCDay",
    "getDay",
];

enum Flow<'a> {
    Normal(Option<Value<'a>>),
    Return(Value<'a>),
}

/// Evaluation context: variable bindings plus station constants.
pub(crate) struct Interpreter<'a, 'c> {
    // ---
    vars: Vec<(String, Value<'a>)>,
    constants: &'c StationConstants,
}

impl<'a, 'c> Interpreter<'a, 'c> {
    // ---
    pub(crate) fn new(bindings: Vec<(String, Value<'a>)>, constants: &'c StationConstants) -> Self {
        Self {
            vars: bindings,
            constants,
        }
    }

    /// Run a program. The result is the first `return`, or the value of the
    /// last expression statement, or null.
    pub(crate) fn run(&mut self, program: &Program) -> Result<Value<'a>, FormulaError> {
        // ---
        match self.block(&program.body)? {
            Flow::Return(v) => Ok(v),
            Flow::Normal(last) => Ok(last.unwrap_or(Value::Null)),
        }
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<Flow<'a>, FormulaError> {
        // ---
        let mark = self.vars.len();
        let mut last = None;
        for stmt in stmts {
            match self.stmt(stmt)? {
                Flow::Return(v) => {
                    self.vars.truncate(mark);
                    return Ok(Flow::Return(v));
                }
                Flow::Normal(v) => last = v,
            }
        }
        self.vars.truncate(mark);
        Ok(Flow::Normal(last))
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<Flow<'a>, FormulaError> {
        // ---
        match stmt {
            Stmt::Let(name, init) => {
                let value = self.eval(init)?;
                self.vars.push((name.clone(), value));
                Ok(Flow::Normal(None))
            }
            Stmt::Return(expr) => Ok(Flow::Return(self.eval(expr)?)),
            Stmt::Expr(expr) => Ok(Flow::Normal(Some(self.eval(expr)?))),
            Stmt::If(cond, then, otherwise) => {
                if self.eval(cond)?.truthy() {
                    self.block(then)
                } else {
                    self.block(otherwise)
                }
            }
            Stmt::Block(body) => self.block(body),
        }
    }

    fn lookup(&self, name: &str) -> Result<Value<'a>, FormulaError> {
        // ---
        self.vars
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| FormulaError::runtime(format!("'{name}' is not defined")))
    }

    fn is_bound(&self, name: &str) -> bool {
        self.vars.iter().any(|(n, _)| n == name)
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value<'a>, FormulaError> {
        // ---
        match expr {
            Expr::Num(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Text(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Placeholder(name) => self
                .constants
                .get(name)
                .map(Value::Number)
                .ok_or_else(|| FormulaError::runtime(format!("unknown placeholder %{name}%"))),
            Expr::Ident(name) => self.lookup(name),
            Expr::Object(fields) => {
                let mut out = BTreeMap::new();
                for (key, value) in fields {
                    out.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Object(out))
            }
            Expr::Member(target, name) => {
                if self.is_math(target) {
                    return math_const(name);
                }
                let target = self.eval(target)?;
                member(&target, name)
            }
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                index_value(&target, &index)
            }
            Expr::Call(callee, args) => self.call(callee, args),
            Expr::Unary(op, operand) => {
                let v = self.eval(operand)?;
                Ok(match op {
                    UnOp::Neg => Value::Number(-v.to_number()?),
                    UnOp::Plus => Value::Number(v.to_number()?),
                    UnOp::Not => Value::Bool(!v.truthy()),
                })
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                binary(*op, &l, &r)
            }
            Expr::Logical(is_and, lhs, rhs) => {
                let l = self.eval(lhs)?;
                if l.truthy() == *is_and {
                    self.eval(rhs)
                } else {
                    Ok(l)
                }
            }
            Expr::Cond(cond, then, otherwise) => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }

    fn is_math(&self, expr: &Expr) -> bool {
        matches!(expr, Expr::Ident(name) if name == "Math" && !self.is_bound("Math"))
    }

    fn call(&mut self, callee: &Expr, args: &[Expr]) -> Result<Value<'a>, FormulaError> {
        // ---
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }

        match callee {
            Expr::Member(target, name) if self.is_math(target) => math_call(name, &values),
            Expr::Member(target, method) => {
                let target = self.eval(target)?;
                match target {
                    Value::Time(t) => time_method(t, method),
                    other => Err(FormulaError::runtime(format!(
                        "{} has no method '{method}'",
                        other.type_name()
                    ))),
                }
            }
            Expr::Ident(name) => global_call(name, &values),
            _ => Err(FormulaError::runtime("expression is not callable")),
        }
    }
}

fn member<'a>(target: &Value<'a>, name: &str) -> Result<Value<'a>, FormulaError> {
    // ---
    match (target, name) {
        (Value::Series(rows), "length") => Ok(Value::Number(rows.len() as f64)),
        (Value::Text(s), "length") => Ok(Value::Number(s.chars().count() as f64)),
        (Value::Record(_), _) => index_value(target, &Value::Text(name.to_string())),
        (Value::Object(fields), _) => Ok(fields.get(name).cloned().unwrap_or(Value::Null)),
        (other, _) => Err(FormulaError::runtime(format!(
            "cannot read '{name}' of {}",
            other.type_name()
        ))),
    }
}

fn index_value<'a>(target: &Value<'a>, index: &Value<'a>) -> Result<Value<'a>, FormulaError> {
    // ---
    match (target, index) {
        (Value::Record(record), Value::Text(key)) if key == "d" => Ok(Value::Time(record.timestamp)),
        (Value::Record(record), Value::Text(key)) => record
            .get(key)
            .map(Value::Number)
            .ok_or_else(|| FormulaError::runtime(format!("missing field '{key}'"))),
        (Value::Series(rows), Value::Number(i)) => {
            let rows: &'a [Record] = *rows;
            let valid = *i >= 0.0 && i.fract() == 0.0;
            Ok(valid
                .then(|| rows.get(*i as usize))
                .flatten()
                .map_or(Value::Null, Value::Record))
        }
        (Value::Object(fields), Value::Text(key)) => {
            Ok(fields.get(key).cloned().unwrap_or(Value::Null))
        }
        (t, i) => Err(FormulaError::runtime(format!(
            "cannot index {} with {}",
            t.type_name(),
            i.type_name()
        ))),
    }
}

fn binary<'a>(op: BinOp, l: &Value<'a>, r: &Value<'a>) -> Result<Value<'a>, FormulaError> {
    // ---
    use BinOp::*;

    match op {
        Eq => return Ok(Value::Bool(strict_eq(l, r))),
        Ne => return Ok(Value::Bool(!strict_eq(l, r))),
        Add => {
            if let (Value::Text(a), b) | (b, Value::Text(a)) = (l, r) {
                let (a, b) = (a.clone(), display(b));
                return Ok(Value::Text(if matches!(l, Value::Text(_)) {
                    a + &b
                } else {
                    b + &a
                }));
            }
        }
        Lt | Le | Gt | Ge => {
            if let (Value::Text(a), Value::Text(b)) = (l, r) {
                return Ok(Value::Bool(match op {
                    Lt => a < b,
                    Le => a <= b,
                    Gt => a > b,
                    _ => a >= b,
                }));
            }
        }
        _ => {}
    }

    let (a, b) = (l.to_number()?, r.to_number()?);
    Ok(match op {
        Add => Value::Number(a + b),
        Sub => Value::Number(a - b),
        Mul => Value::Number(a * b),
        Div => Value::Number(a / b),
        Rem => Value::Number(a % b),
        Pow => Value::Number(a.powf(b)),
        Lt => Value::Bool(a < b),
        Le => Value::Bool(a <= b),
        Gt => Value::Bool(a > b),
        Ge => Value::Bool(a >= b),
        Eq | Ne => unreachable!("handled above"),
    })
}

fn strict_eq(l: &Value<'_>, r: &Value<'_>) -> bool {
    // ---
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Text(a), Value::Text(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::Time(a), Value::Time(b)) => a == b,
        _ => false,
    }
}

fn display(v: &Value<'_>) -> String {
    // ---
    match v {
        Value::Number(n) => n.to_string(),
        Value::Text(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Time(t) => t.to_rfc3339(),
        other => other.type_name().to_string(),
    }
}

fn math_const<'a>(name: &str) -> Result<Value<'a>, FormulaError> {
    // ---
    use std::f64::consts;

    let v = match name {
        "PI" => consts::PI,
        "E" => consts::E,
        "LN2" => consts::LN_2,
        "LN10" => consts::LN_10,
        "SQRT2" => consts::SQRT_2,
        _ => return Err(FormulaError::runtime(format!("Math.{name} is not available"))),
    };
    Ok(Value::Number(v))
}

fn numbers(args: &[Value<'_>]) -> Result<Vec<f64>, FormulaError> {
    args.iter().map(Value::to_number).collect()
}

fn math_call<'a>(name: &str, args: &[Value<'a>]) -> Result<Value<'a>, FormulaError> {
    // ---
    let xs = numbers(args)?;
    let arg = |i: usize| xs.get(i).copied().unwrap_or(f64::NAN);

    let v = match name {
        "abs" => arg(0).abs(),
        "sqrt" => arg(0).sqrt(),
        "cbrt" => arg(0).cbrt(),
        "exp" => arg(0).exp(),
        "log" => arg(0).ln(),
        "log10" => arg(0).log10(),
        "log2" => arg(0).log2(),
        "pow" => arg(0).powf(arg(1)),
        "round" => (arg(0) + 0.5).floor(),
        "floor" => arg(0).floor(),
        "ceil" => arg(0).ceil(),
        "trunc" => arg(0).trunc(),
        "sign" => {
            let x = arg(0);
            if x == 0.0 || x.is_nan() {
                x
            } else {
                x.signum()
            }
        }
        "sin" => arg(0).sin(),
        "cos" => arg(0).cos(),
        "tan" => arg(0).tan(),
        "asin" => arg(0).asin(),
        "acos" => arg(0).acos(),
        "atan" => arg(0).atan(),
        "atan2" => arg(0).atan2(arg(1)),
        "hypot" => xs.iter().map(|x| x * x).sum::<f64>().sqrt(),
        "min" => xs.iter().copied().fold(f64::INFINITY, nan_min),
        "max" => xs.iter().copied().fold(f64::NEG_INFINITY, nan_max),
        _ => return Err(FormulaError::runtime(format!("Math.{name} is not available"))),
    };
    Ok(Value::Number(v))
}

fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

fn global_call<'a>(name: &str, args: &[Value<'a>]) -> Result<Value<'a>, FormulaError> {
    // ---
    match (name, args) {
        ("isNaN", [v]) => Ok(Value::Bool(v.to_number().map_or(true, f64::is_nan))),
        ("isFinite", [v]) => Ok(Value::Bool(matches!(v, Value::Number(n) if n.is_finite()))),
        ("dayOfYear", [Value::Time(t)]) => Ok(Value::Number(f64::from(t.ordinal()))),
        (agg, [Value::Series(rows), Value::Text(key)]) => aggregate(agg, rows, key),
        _ => Err(FormulaError::runtime(format!(
            "invalid call to {name}() with {} argument(s)",
            args.len()
        ))),
    }
}

fn aggregate<'a>(name: &str, rows: &[Record], key: &str) -> Result<Value<'a>, FormulaError> {
    // ---
    let mut values = rows.iter().filter_map(|r| r.get(key));

    let v = match name {
        "count" => Some(values.count() as f64),
        "sum" => Some(values.sum()),
        "mean" => {
            let (n, total) = values.fold((0usize, 0.0), |(n, t), v| (n + 1, t + v));
            (n > 0).then(|| total / n as f64)
        }
        "min" => values.reduce(f64::min),
        "max" => values.reduce(f64::max),
        "first" => values.next(),
        "last" => values.last(),
        _ => {
            return Err(FormulaError::runtime(format!(
                "{name}() does not accept a series"
            )))
        }
    };
    Ok(v.map_or(Value::Null, Value::Number))
}

fn time_method<'a>(t: DateTime<Utc>, method: &str) -> Result<Value<'a>, FormulaError> {
    // ---
    let v = match method {
        "getTime" | "valueOf" => t.timestamp_millis() as f64,
        "getUTCHours" | "getHours" => f64::from(t.hour()),
        "getUTCMinutes" | "getMinutes" => f64::from(t.minute()),
        "getUTCMonth" | "getMonth" => f64::from(t.month0()),
        "getUTCFullYear" | "getFullYear" => f64::from(t.year()),
        "getUTCDate" | "getDate" => f64::from(t.day()),
        "getUTCDay" | "getDay" => f64::from(t.weekday().num_days_from_sunday()),
        _ => {
            return Err(FormulaError::runtime(format!(
                "timestamp has no method '{method}'"
            )))
        }
    };
    Ok(Value::Number(v))
}
