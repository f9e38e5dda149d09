//! Recursive-descent parser producing the restricted formula AST.
//!
//! Accepted shapes: `name = p => expr`, `(a, b) => { ... }`,
//! `function f(a) { ... }`, or a bare statement list. Anything outside the
//! grammar is rejected here, before a definition is ever stored.

use std::fmt;
use std::ops::Deref;

use super::lexer::{tokenize, Tok, Token};
use crate::FormulaError;

// ---

/// Deepest expression or statement nesting accepted. Chained operators and
/// postfix accessors count one level each, so evaluation depth is bounded too.
const MAX_NESTING: usize = 128;

/// An identifier and the byte offset it was read from. Equality ignores the
/// offset.
#[derive(Debug, Clone)]
pub(crate) struct Name {
    pub text: String,
    pub pos: usize,
}

impl Name {
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Deref for Name {
    type Target = str;

    fn deref(&self) -> &str {
        &self.text
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        self.text == other
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
impl From<&str> for Name {
    fn from(text: &str) -> Self {
        Self {
            text: text.to_string(),
            pos: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    // ---
    Num(f64),
    Str(String),
    Bool(bool),
    Null,
    Placeholder(Name),
    Ident(Name),
    Object(Vec<(String, Expr)>),
    Member(Box<Expr>, Name),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// `&&` / `||`, short-circuiting.
    Logical(bool, Box<Expr>, Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum UnOp {
    Neg,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BinOp {
    // ---
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    // ---
    Let(String, Expr),
    Return(Expr),
    Expr(Expr),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    Block(Vec<Stmt>),
}

/// Parsed program: parameter names (empty when the source is a bare body)
/// and the statements of the body.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Program {
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

const RESERVED: &[&str] = &[
    "let", "const", "var", "return", "if", "else", "function", "true", "false", "null",
    "undefined", "while", "for", "do", "new", "this", "class", "import", "export", "delete",
    "eval", "with", "yield", "await", "async", "throw", "try", "catch", "switch",
];

pub(crate) fn parse_program(src: &str) -> Result<Program, FormulaError> {
    // ---
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let program = parser.program()?;
    parser.expect_eof()?;
    Ok(program)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Current nesting, checked against [`MAX_NESTING`].
    depth: usize,
}

impl Parser {
    // ---
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn peek_at(&self, ahead: usize) -> &Tok {
        let idx = (self.pos + ahead).min(self.tokens.len() - 1);
        &self.tokens[idx].tok
    }

    fn here(&self) -> usize {
        self.tokens[self.pos].pos
    }

    fn advance(&mut self) -> Tok {
        let tok = self.tokens[self.pos].tok.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Tok::Punct(q) if *q == p)
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Ident(name) if name == kw)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), FormulaError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{p}'")))
        }
    }

    fn expect_eof(&self) -> Result<(), FormulaError> {
        match self.peek() {
            Tok::Eof => Ok(()),
            _ => Err(self.error("unexpected trailing input")),
        }
    }

    fn error(&self, message: impl Into<String>) -> FormulaError {
        let found = match self.peek() {
            Tok::Eof => "end of input".to_string(),
            Tok::Num(n) => n.to_string(),
            Tok::Str(s) => format!("'{s}'"),
            Tok::Ident(s) | Tok::Placeholder(s) => s.clone(),
            Tok::Punct(p) => p.to_string(),
        };
        FormulaError::parse(self.here(), format!("{}, found {}", message.into(), found))
    }

    /// Enter one nesting level. Callers undo it with `self.depth -= n` on
    /// success; an error abandons the whole parse.
    fn nest(&mut self) -> Result<(), FormulaError> {
        // ---
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(FormulaError::parse(self.here(), "formula nested too deeply"));
        }
        Ok(())
    }

    fn name(&mut self) -> Result<Name, FormulaError> {
        let pos = self.here();
        Ok(Name {
            text: self.ident()?,
            pos,
        })
    }

    fn ident(&mut self) -> Result<String, FormulaError> {
        // ---
        match self.peek().clone() {
            Tok::Ident(name) if !RESERVED.contains(&name.as_str()) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    // --- program shapes

    fn program(&mut self) -> Result<Program, FormulaError> {
        // ---
        // `name = <function>`: the binding name carries no meaning.
        if matches!(self.peek(), Tok::Ident(_))
            && matches!(self.peek_at(1), Tok::Punct("="))
            && !self.is_keyword("let")
            && !self.is_keyword("const")
            && !self.is_keyword("var")
        {
            let save = self.pos;
            self.advance();
            self.advance();
            if self.at_function_head() {
                return self.function();
            }
            self.pos = save;
        }

        if self.at_function_head() {
            return self.function();
        }

        let body = self.statements(|p| matches!(p.peek(), Tok::Eof))?;
        Ok(Program {
            params: Vec::new(),
            body,
        })
    }

    fn at_function_head(&self) -> bool {
        // ---
        if self.is_keyword("function") {
            return true;
        }
        if matches!(self.peek(), Tok::Ident(_)) && matches!(self.peek_at(1), Tok::Punct("=>")) {
            return true;
        }
        if self.is_punct("(") {
            // `(a, b) =>`: scan to the matching paren
            let mut depth = 0usize;
            let mut i = 0;
            loop {
                match self.peek_at(i) {
                    Tok::Punct("(") => depth += 1,
                    Tok::Punct(")") => {
                        depth -= 1;
                        if depth == 0 {
                            return matches!(self.peek_at(i + 1), Tok::Punct("=>"));
                        }
                    }
                    Tok::Eof => return false,
                    _ => {}
                }
                i += 1;
            }
        }
        false
    }

    fn function(&mut self) -> Result<Program, FormulaError> {
        // ---
        let params;
        if self.is_keyword("function") {
            self.advance();
            if matches!(self.peek(), Tok::Ident(_)) {
                self.ident()?;
            }
            params = self.param_list()?;
            self.expect_punct("{")?;
            let body = self.statements(|p| p.is_punct("}"))?;
            self.expect_punct("}")?;
            self.eat_punct(";");
            return Ok(Program { params, body });
        }

        if self.is_punct("(") {
            params = self.param_list()?;
        } else {
            params = vec![self.ident()?];
        }
        self.expect_punct("=>")?;

        let body = if self.is_punct("{") && !self.looks_like_object_literal() {
            self.advance();
            let body = self.statements(|p| p.is_punct("}"))?;
            self.expect_punct("}")?;
            body
        } else {
            vec![Stmt::Return(self.expr()?)]
        };
        self.eat_punct(";");
        Ok(Program { params, body })
    }

    fn param_list(&mut self) -> Result<Vec<String>, FormulaError> {
        // ---
        self.expect_punct("(")?;
        let mut params = Vec::new();
        if !self.is_punct(")") {
            loop {
                params.push(self.ident()?);
                if !self.eat_punct(",") {
                    break;
                }
            }
        }
        self.expect_punct(")")?;
        Ok(params)
    }

    /// `{}` or `{ key: ...` after an arrow is an object, not a block.
    fn looks_like_object_literal(&self) -> bool {
        matches!(self.peek_at(1), Tok::Punct("}"))
            || (matches!(self.peek_at(1), Tok::Ident(_) | Tok::Str(_))
                && matches!(self.peek_at(2), Tok::Punct(":")))
    }

    // --- statements

    fn statements(&mut self, done: impl Fn(&Self) -> bool) -> Result<Vec<Stmt>, FormulaError> {
        // ---
        let mut stmts = Vec::new();
        while !done(&*self) {
            if matches!(self.peek(), Tok::Eof) {
                return Err(self.error("unexpected end of formula"));
            }
            if self.eat_punct(";") {
                continue;
            }
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, FormulaError> {
        // ---
        self.nest()?;
        let stmt = self.statement_inner()?;
        self.depth -= 1;
        Ok(stmt)
    }

    fn statement_inner(&mut self) -> Result<Stmt, FormulaError> {
        // ---
        if self.is_keyword("let") || self.is_keyword("const") || self.is_keyword("var") {
            self.advance();
            let name = self.ident()?;
            self.expect_punct("=")?;
            let value = self.expr()?;
            self.end_statement()?;
            return Ok(Stmt::Let(name, value));
        }
        if self.is_keyword("return") {
            self.advance();
            let value = self.expr()?;
            self.end_statement()?;
            return Ok(Stmt::Return(value));
        }
        if self.is_keyword("if") {
            self.advance();
            self.expect_punct("(")?;
            let cond = self.expr()?;
            self.expect_punct(")")?;
            let then = self.branch()?;
            let otherwise = if self.is_keyword("else") {
                self.advance();
                self.branch()?
            } else {
                Vec::new()
            };
            return Ok(Stmt::If(cond, then, otherwise));
        }
        if self.is_punct("{") {
            self.advance();
            let body = self.statements(|p| p.is_punct("}"))?;
            self.expect_punct("}")?;
            return Ok(Stmt::Block(body));
        }
        if let Tok::Ident(name) = self.peek() {
            let literal = matches!(name.as_str(), "true" | "false" | "null" | "undefined");
            if RESERVED.contains(&name.as_str()) && !literal {
                return Err(self.error("unsupported statement"));
            }
        }
        let expr = self.expr()?;
        self.end_statement()?;
        Ok(Stmt::Expr(expr))
    }

    fn branch(&mut self) -> Result<Vec<Stmt>, FormulaError> {
        // ---
        match self.statement()? {
            Stmt::Block(body) => Ok(body),
            stmt => Ok(vec![stmt]),
        }
    }

    /// Semicolons are optional before `}` and end of input.
    fn end_statement(&mut self) -> Result<(), FormulaError> {
        // ---
        if self.eat_punct(";") || self.is_punct("}") || matches!(self.peek(), Tok::Eof) {
            return Ok(());
        }
        // A newline-separated statement starts with a keyword or identifier.
        if matches!(self.peek(), Tok::Ident(_)) {
            return Ok(());
        }
        Err(self.error("expected ';'"))
    }

    // --- expressions, lowest precedence first

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        // ---
        self.nest()?;
        let expr = self.conditional()?;
        self.depth -= 1;
        Ok(expr)
    }

    fn conditional(&mut self) -> Result<Expr, FormulaError> {
        // ---
        let cond = self.logical_or()?;
        if self.eat_punct("?") {
            let then = self.expr()?;
            self.expect_punct(":")?;
            let otherwise = self.expr()?;
            return Ok(Expr::Cond(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn logical_or(&mut self) -> Result<Expr, FormulaError> {
        // ---
        let mut lhs = self.logical_and()?;
        let mark = self.depth;
        while self.eat_punct("||") {
            self.nest()?;
            let rhs = self.logical_and()?;
            lhs = Expr::Logical(false, Box::new(lhs), Box::new(rhs));
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn logical_and(&mut self) -> Result<Expr, FormulaError> {
        // ---
        let mut lhs = self.equality()?;
        let mark = self.depth;
        while self.eat_punct("&&") {
            self.nest()?;
            let rhs = self.equality()?;
            lhs = Expr::Logical(true, Box::new(lhs), Box::new(rhs));
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, FormulaError> {
        self.binary_level(
            &[("===", BinOp::Eq), ("!==", BinOp::Ne), ("==", BinOp::Eq), ("!=", BinOp::Ne)],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr, FormulaError> {
        self.binary_level(
            &[("<=", BinOp::Le), (">=", BinOp::Ge), ("<", BinOp::Lt), (">", BinOp::Gt)],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, FormulaError> {
        self.binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Expr, FormulaError> {
        self.binary_level(
            &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Rem)],
            Self::exponent,
        )
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Expr, FormulaError>,
    ) -> Result<Expr, FormulaError> {
        // ---
        let mut lhs = next(self)?;
        let mark = self.depth;
        'outer: loop {
            for (p, op) in ops {
                if self.eat_punct(p) {
                    self.nest()?;
                    let rhs = next(self)?;
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'outer;
                }
            }
            self.depth = mark;
            return Ok(lhs);
        }
    }

    /// `**` is right-associative.
    fn exponent(&mut self) -> Result<Expr, FormulaError> {
        // ---
        let base = self.unary()?;
        if self.eat_punct("**") {
            self.nest()?;
            let exp = self.exponent()?;
            self.depth -= 1;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        // ---
        let op = if self.eat_punct("-") {
            UnOp::Neg
        } else if self.eat_punct("+") {
            UnOp::Plus
        } else if self.eat_punct("!") {
            UnOp::Not
        } else {
            return self.postfix();
        };
        self.nest()?;
        let operand = self.unary()?;
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn postfix(&mut self) -> Result<Expr, FormulaError> {
        // ---
        let mut expr = self.primary()?;
        let mark = self.depth;
        loop {
            if self.eat_punct(".") {
                self.nest()?;
                let pos = self.here();
                let text = match self.advance() {
                    Tok::Ident(text) => text,
                    _ => return Err(self.error("expected property name")),
                };
                expr = Expr::Member(Box::new(expr), Name { text, pos });
            } else if self.eat_punct("[") {
                self.nest()?;
                let index = self.expr()?;
                self.expect_punct("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat_punct("(") {
                self.nest()?;
                let mut args = Vec::new();
                if !self.is_punct(")") {
                    loop {
                        args.push(self.expr()?);
                        if !self.eat_punct(",") {
                            break;
                        }
                    }
                }
                self.expect_punct(")")?;
                expr = Expr::Call(Box::new(expr), args);
            } else {
                self.depth = mark;
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        // ---
        match self.peek().clone() {
            Tok::Num(n) => {
                self.advance();
                Ok(Expr::Num(n))
            }
            Tok::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            Tok::Placeholder(text) => {
                let pos = self.here();
                self.advance();
                Ok(Expr::Placeholder(Name { text, pos }))
            }
            Tok::Ident(name) => match name.as_str() {
                "true" | "false" => {
                    self.advance();
                    Ok(Expr::Bool(name == "true"))
                }
                "null" | "undefined" => {
                    self.advance();
                    Ok(Expr::Null)
                }
                _ => Ok(Expr::Ident(self.name()?)),
            },
            Tok::Punct("(") => {
                self.advance();
                let inner = self.expr()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Tok::Punct("{") => self.object(),
            _ => Err(self.error("expected expression")),
        }
    }

    fn object(&mut self) -> Result<Expr, FormulaError> {
        // ---
        self.expect_punct("{")?;
        let mut fields = Vec::new();
        while !self.is_punct("}") {
            let key = match self.advance() {
                Tok::Ident(name) | Tok::Str(name) => name,
                _ => return Err(self.error("expected object key")),
            };
            self.expect_punct(":")?;
            fields.push((key, self.expr()?));
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct("}")?;
        Ok(Expr::Object(fields))
    }
}
