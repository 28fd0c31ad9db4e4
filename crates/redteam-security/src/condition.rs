//! Restricted condition interpreter for policy rules.
//!
//! A purpose-built expression evaluator: literals, context identifiers,
//! property/index access, arithmetic, comparisons, boolean logic, and a
//! fixed set of string/array builtins. There are no loops, no definitions,
//! no I/O, and no host access; regex arguments must be literals and are
//! compiled once when the rule is compiled. Evaluation is bounded by an
//! operation-fuel counter and a wall-clock deadline; any failure is
//! reported as an error the policy engine converts into "did not match".

use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Maximum nesting depth accepted by the parser.
const MAX_PARSE_DEPTH: usize = 64;

/// Maximum condition source length in bytes.
const MAX_SOURCE_LEN: usize = 4_096;

/// Compiled-regex size limit for `matches` patterns.
const REGEX_SIZE_LIMIT: usize = 1 << 16;

/// How often (in fuel steps) the wall-clock deadline is re-checked.
const DEADLINE_CHECK_MASK: u32 = 0xFF;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A runtime value inside the condition sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Convert a JSON value into a sandbox value.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "array",
            Value::Map(_) => "object",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors and budget
// ---------------------------------------------------------------------------

/// Why a condition failed to compile or evaluate.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    Parse(String),
    Type(String),
    UnknownIdentifier(String),
    /// Fuel or wall-clock budget exhausted.
    Budget,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Parse(msg) => write!(f, "parse error: {msg}"),
            EvalError::Type(msg) => write!(f, "type error: {msg}"),
            EvalError::UnknownIdentifier(name) => write!(f, "unknown identifier: {name}"),
            EvalError::Budget => write!(f, "evaluation budget exhausted"),
        }
    }
}

/// Per-evaluation resource budget: an operation counter plus a wall-clock
/// deadline checked every few steps.
pub struct Budget {
    deadline: Instant,
    fuel: u32,
    steps: u32,
}

impl Budget {
    pub fn new(wall_clock: Duration, fuel: u32) -> Self {
        Self {
            deadline: Instant::now() + wall_clock,
            fuel,
            steps: 0,
        }
    }

    fn step(&mut self) -> Result<(), EvalError> {
        if self.fuel == 0 {
            return Err(EvalError::Budget);
        }
        self.fuel -= 1;
        self.steps = self.steps.wrapping_add(1);
        if (self.steps & DEADLINE_CHECK_MASK) == 0 && Instant::now() >= self.deadline {
            return Err(EvalError::Budget);
        }
        Ok(())
    }
}

/// Variable bindings visible to a condition.
#[derive(Debug, Default)]
pub struct Context {
    vars: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: &str, value: Value) -> Self {
        self.vars.insert(name.to_string(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(String),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call {
        target: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    /// `target.matches("pattern")` with the pattern compiled at rule load.
    Matches(Box<Expr>, Regex),
}

/// A compiled condition, ready to evaluate against a [`Context`].
#[derive(Debug, Clone)]
pub struct Program {
    root: Expr,
}

/// Compile condition source text into a [`Program`].
pub fn compile(source: &str) -> Result<Program, EvalError> {
    if source.len() > MAX_SOURCE_LEN {
        return Err(EvalError::Parse(format!(
            "condition longer than {MAX_SOURCE_LEN} bytes"
        )));
    }
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let root = parser.parse_expr(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::Parse(format!(
            "unexpected trailing token: {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(Program { root })
}

impl Program {
    /// Evaluate against `ctx` under `budget`.
    pub fn evaluate(&self, ctx: &Context, budget: &mut Budget) -> Result<Value, EvalError> {
        eval(&self.root, ctx, budget)
    }

    /// Evaluate and report whether the result is exactly boolean `true`.
    pub fn matches(&self, ctx: &Context, budget: &mut Budget) -> Result<bool, EvalError> {
        Ok(self.evaluate(ctx, budget)? == Value::Bool(true))
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Not,
    OrOr,
    AndAnd,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::EqEq);
                } else {
                    return Err(EvalError::Parse("single '=' is not an operator".into()));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.next() == Some('&') {
                    tokens.push(Token::AndAnd);
                } else {
                    return Err(EvalError::Parse("single '&' is not an operator".into()));
                }
            }
            '|' => {
                chars.next();
                if chars.next() == Some('|') {
                    tokens.push(Token::OrOr);
                } else {
                    return Err(EvalError::Parse("single '|' is not an operator".into()));
                }
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => return Err(EvalError::Parse("unterminated string".into())),
                        Some(ch) if ch == quote => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(esc @ ('\\' | '"' | '\'')) => s.push(esc),
                            other => {
                                return Err(EvalError::Parse(format!(
                                    "invalid escape: \\{other:?}"
                                )))
                            }
                        },
                        Some(ch) => s.push(ch),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: f64 = s
                    .parse()
                    .map_err(|_| EvalError::Parse(format!("invalid number: {s}")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match s.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(s),
                });
            }
            other => {
                return Err(EvalError::Parse(format!("unexpected character: {other:?}")));
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser (recursive descent)
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token) -> Result<(), EvalError> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(EvalError::Parse(format!(
                "expected {token:?}, found {other:?}"
            ))),
        }
    }

    fn parse_expr(&mut self, depth: usize) -> Result<Expr, EvalError> {
        self.parse_or(depth)
    }

    fn check_depth(depth: usize) -> Result<usize, EvalError> {
        if depth >= MAX_PARSE_DEPTH {
            return Err(EvalError::Parse("expression too deeply nested".into()));
        }
        Ok(depth + 1)
    }

    fn parse_or(&mut self, depth: usize) -> Result<Expr, EvalError> {
        let depth = Self::check_depth(depth)?;
        let mut lhs = self.parse_and(depth)?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let rhs = self.parse_and(depth)?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self, depth: usize) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_equality(depth)?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let rhs = self.parse_equality(depth)?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self, depth: usize) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_comparison(depth)?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.next();
            let rhs = self.parse_comparison(depth)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self, depth: usize) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_additive(depth)?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.next();
            let rhs = self.parse_additive(depth)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self, depth: usize) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_multiplicative(depth)?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let rhs = self.parse_multiplicative(depth)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self, depth: usize) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_unary(depth)?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.next();
            let rhs = self.parse_unary(depth)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self, depth: usize) -> Result<Expr, EvalError> {
        let depth = Self::check_depth(depth)?;
        match self.peek() {
            Some(Token::Not) => {
                self.next();
                Ok(Expr::Not(Box::new(self.parse_unary(depth)?)))
            }
            Some(Token::Minus) => {
                self.next();
                Ok(Expr::Neg(Box::new(self.parse_unary(depth)?)))
            }
            _ => self.parse_postfix(depth),
        }
    }

    fn parse_postfix(&mut self, depth: usize) -> Result<Expr, EvalError> {
        let mut expr = self.parse_primary(depth)?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(EvalError::Parse(format!(
                                "expected property name after '.', found {other:?}"
                            )))
                        }
                    };
                    if self.peek() == Some(&Token::LParen) {
                        self.next();
                        let mut args = Vec::new();
                        if self.peek() != Some(&Token::RParen) {
                            loop {
                                args.push(self.parse_expr(depth)?);
                                if self.peek() == Some(&Token::Comma) {
                                    self.next();
                                } else {
                                    break;
                                }
                            }
                        }
                        self.expect(Token::RParen)?;
                        expr = if name == "matches" {
                            Self::build_matches(expr, args)?
                        } else {
                            Expr::Call {
                                target: Box::new(expr),
                                method: name,
                                args,
                            }
                        };
                    } else {
                        expr = Expr::Field(Box::new(expr), name);
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.parse_expr(depth)?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// `matches` requires a single literal pattern so the regex is compiled
    /// once, at rule load, under a size limit.
    fn build_matches(target: Expr, mut args: Vec<Expr>) -> Result<Expr, EvalError> {
        if args.len() != 1 {
            return Err(EvalError::Parse("matches() takes exactly one argument".into()));
        }
        let pattern = match args.pop() {
            Some(Expr::Literal(Value::Str(pattern))) => pattern,
            _ => {
                return Err(EvalError::Parse(
                    "matches() requires a string literal pattern".into(),
                ))
            }
        };
        let regex = RegexBuilder::new(&pattern)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|e| EvalError::Parse(format!("invalid matches() pattern: {e}")))?;
        Ok(Expr::Matches(Box::new(target), regex))
    }

    fn parse_primary(&mut self, depth: usize) -> Result<Expr, EvalError> {
        let depth = Self::check_depth(depth)?;
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Literal(Value::Num(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.parse_expr(depth)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(EvalError::Parse(format!(
                "expected expression, found {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, ctx: &Context, budget: &mut Budget) -> Result<Value, EvalError> {
    budget.step()?;
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => ctx
            .vars
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownIdentifier(name.clone())),
        Expr::Field(target, name) => {
            let target = eval(target, ctx, budget)?;
            field_access(&target, name)
        }
        Expr::Index(target, index) => {
            let target = eval(target, ctx, budget)?;
            let index = eval(index, ctx, budget)?;
            index_access(&target, &index)
        }
        Expr::Not(inner) => match eval(inner, ctx, budget)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(EvalError::Type(format!("! applied to {}", other.type_name()))),
        },
        Expr::Neg(inner) => match eval(inner, ctx, budget)? {
            Value::Num(n) => Ok(Value::Num(-n)),
            other => Err(EvalError::Type(format!(
                "unary - applied to {}",
                other.type_name()
            ))),
        },
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, ctx, budget),
        Expr::Call {
            target,
            method,
            args,
        } => {
            let target = eval(target, ctx, budget)?;
            let args = args
                .iter()
                .map(|a| eval(a, ctx, budget))
                .collect::<Result<Vec<_>, _>>()?;
            call_builtin(&target, method, &args)
        }
        Expr::Matches(target, regex) => match eval(target, ctx, budget)? {
            Value::Str(s) => Ok(Value::Bool(regex.is_match(&s))),
            Value::Null => Ok(Value::Bool(false)),
            other => Err(EvalError::Type(format!(
                "matches() target must be a string, got {}",
                other.type_name()
            ))),
        },
    }
}

fn eval_binary(
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    ctx: &Context,
    budget: &mut Budget,
) -> Result<Value, EvalError> {
    // Short-circuit boolean operators
    if matches!(op, BinOp::And | BinOp::Or) {
        let left = match eval(lhs, ctx, budget)? {
            Value::Bool(b) => b,
            other => {
                return Err(EvalError::Type(format!(
                    "logical operator applied to {}",
                    other.type_name()
                )))
            }
        };
        let short = match op {
            BinOp::And => !left,
            _ => left,
        };
        if short {
            return Ok(Value::Bool(left));
        }
        return match eval(rhs, ctx, budget)? {
            Value::Bool(b) => Ok(Value::Bool(b)),
            other => Err(EvalError::Type(format!(
                "logical operator applied to {}",
                other.type_name()
            ))),
        };
    }

    let left = eval(lhs, ctx, budget)?;
    let right = eval(rhs, ctx, budget)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(left == right)),
        BinOp::Ne => Ok(Value::Bool(left != right)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => compare(op, &left, &right),
        BinOp::Add => match (&left, &right) {
            (Value::Num(a), Value::Num(b)) => Ok(Value::Num(a + b)),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
            _ => Err(EvalError::Type(format!(
                "+ applied to {} and {}",
                left.type_name(),
                right.type_name()
            ))),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => match (&left, &right) {
            (Value::Num(a), Value::Num(b)) => Ok(Value::Num(match op {
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                _ => a % b,
            })),
            _ => Err(EvalError::Type(format!(
                "arithmetic applied to {} and {}",
                left.type_name(),
                right.type_name()
            ))),
        },
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn compare(op: BinOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    let ordering = match (left, right) {
        (Value::Num(a), Value::Num(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => {
            return Err(EvalError::Type(format!(
                "cannot compare {} and {}",
                left.type_name(),
                right.type_name()
            )))
        }
    };
    let Some(ordering) = ordering else {
        // NaN comparisons are false, matching IEEE semantics
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Ge => ordering.is_ge(),
        _ => unreachable!(),
    }))
}

fn field_access(target: &Value, name: &str) -> Result<Value, EvalError> {
    match (target, name) {
        (Value::Map(map), _) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        (Value::Str(s), "length") => Ok(Value::Num(s.chars().count() as f64)),
        (Value::List(items), "length") => Ok(Value::Num(items.len() as f64)),
        (Value::Null, _) => Ok(Value::Null),
        _ => Err(EvalError::Type(format!(
            "no property '{name}' on {}",
            target.type_name()
        ))),
    }
}

fn index_access(target: &Value, index: &Value) -> Result<Value, EvalError> {
    match (target, index) {
        (Value::List(items), Value::Num(n)) => {
            let idx = *n as i64;
            if idx < 0 || idx as usize >= items.len() {
                Ok(Value::Null)
            } else {
                Ok(items[idx as usize].clone())
            }
        }
        (Value::Map(map), Value::Str(key)) => Ok(map.get(key).cloned().unwrap_or(Value::Null)),
        _ => Err(EvalError::Type(format!(
            "cannot index {} with {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

fn call_builtin(target: &Value, method: &str, args: &[Value]) -> Result<Value, EvalError> {
    let arity = |expected: usize| -> Result<(), EvalError> {
        if args.len() != expected {
            return Err(EvalError::Type(format!(
                "{method}() takes {expected} argument(s), got {}",
                args.len()
            )));
        }
        Ok(())
    };

    match method {
        "contains" | "includes" => {
            arity(1)?;
            match (target, &args[0]) {
                (Value::Str(s), Value::Str(needle)) => Ok(Value::Bool(s.contains(needle.as_str()))),
                (Value::List(items), needle) => Ok(Value::Bool(items.contains(needle))),
                _ => Err(EvalError::Type(format!(
                    "{method}() not supported on {}",
                    target.type_name()
                ))),
            }
        }
        "startsWith" => {
            arity(1)?;
            match (target, &args[0]) {
                (Value::Str(s), Value::Str(prefix)) => {
                    Ok(Value::Bool(s.starts_with(prefix.as_str())))
                }
                _ => Err(EvalError::Type("startsWith() requires strings".into())),
            }
        }
        "endsWith" => {
            arity(1)?;
            match (target, &args[0]) {
                (Value::Str(s), Value::Str(suffix)) => Ok(Value::Bool(s.ends_with(suffix.as_str()))),
                _ => Err(EvalError::Type("endsWith() requires strings".into())),
            }
        }
        "lower" | "toLowerCase" => {
            arity(0)?;
            match target {
                Value::Str(s) => Ok(Value::Str(s.to_lowercase())),
                _ => Err(EvalError::Type("lower() requires a string".into())),
            }
        }
        "upper" | "toUpperCase" => {
            arity(0)?;
            match target {
                Value::Str(s) => Ok(Value::Str(s.to_uppercase())),
                _ => Err(EvalError::Type("upper() requires a string".into())),
            }
        }
        "length" => {
            arity(0)?;
            field_access(target, "length")
        }
        other => Err(EvalError::Type(format!("unknown method: {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
