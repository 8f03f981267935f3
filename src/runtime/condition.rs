//! Restricted expression evaluator for edge guards, condition branches and
//! timer delays
//!
//! The grammar is closed: literals, variable paths, arithmetic, comparisons
//! and boolean operators. There are no function calls and no assignment, so
//! evaluation cannot have side effects.
//!
//! ```text
//! expr    := or
//! or      := and (("||" | "or") and)*
//! and     := not (("&&" | "and") not)*
//! not     := ("!" | "not") not | cmp
//! cmp     := sum (("==" | "!=" | ">" | ">=" | "<" | "<=" | "in") sum)?
//! sum     := prod (("+" | "-") prod)*
//! prod    := unary (("*" | "/" | "%") unary)*
//! unary   := "-" unary | postfix
//! postfix := primary ("." ident | "[" expr "]")*
//! primary := number | string | true | false | null | ident
//!          | "(" expr ")" | "[" (expr ("," expr)*)? "]"
//! ```

use serde_json::{Number, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("Parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Type error: {0}")]
    Type(String),

    #[error("Division by zero")]
    DivisionByZero,
}

type ConditionResult<T> = Result<T, ConditionError>;

/// Parse and evaluate an expression in one go
pub fn evaluate(source: &str, variables: &HashMap<String, Value>) -> ConditionResult<Value> {
    Expression::parse(source)?.evaluate(variables)
}

/// Parse and evaluate an expression, reducing the result to its truthiness
pub fn evaluate_bool(source: &str, variables: &HashMap<String, Value>) -> ConditionResult<bool> {
    evaluate(source, variables).map(|value| is_truthy(&value))
}

/// `null`, `false`, `0`, `""` and empty collections are falsy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Deepest grouping (parentheses, brackets, `!` and unary `-` chains) a
/// parser accepts
const MAX_NESTING: usize = 64;

/// Longest expression, in tokens
const MAX_TOKENS: usize = 1024;

/// A parsed expression, reusable across evaluations
#[derive(Debug, Clone)]
pub struct Expression {
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> ConditionResult<Self> {
        let tokens = Lexer::new(source).tokenize()?;
        if let Some((_, position)) = tokens.get(MAX_TOKENS) {
            return Err(ConditionError::Parse {
                position: *position,
                message: format!("expression longer than {} tokens", MAX_TOKENS),
            });
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_or()?;
        parser.expect_end()?;
        Ok(Self { root })
    }

    pub fn evaluate(&self, variables: &HashMap<String, Value>) -> ConditionResult<Value> {
        eval(&self.root, variables)
    }
}

// ── Lexer ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    EqEq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Eof,
}

struct Lexer {
    input: Vec<char>,
    pos: usize,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    fn tokenize(mut self) -> ConditionResult<Vec<(Token, usize)>> {
        let mut tokens = Vec::new();
        loop {
            while self.peek().map(char::is_whitespace).unwrap_or(false) {
                self.pos += 1;
            }
            let start = self.pos;
            let Some(ch) = self.peek() else {
                tokens.push((Token::Eof, start));
                return Ok(tokens);
            };
            let token = match ch {
                '0'..='9' => self.number()?,
                '"' | '\'' => self.string(ch)?,
                c if c.is_alphabetic() || c == '_' || c == '$' => self.word(),
                _ => self.symbol()?,
            };
            tokens.push((token, start));
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn error(&self, message: impl Into<String>) -> ConditionError {
        ConditionError::Parse {
            position: self.pos,
            message: message.into(),
        }
    }

    fn number(&mut self) -> ConditionResult<Token> {
        let start = self.pos;
        while self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            self.pos += 1;
        }
        if self.peek() == Some('.') && self.peek_at(1).map(|c| c.is_ascii_digit()).unwrap_or(false) {
            self.pos += 1;
            while self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                self.pos += 1;
            }
        }
        let text: String = self.input[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error(format!("invalid number '{}'", text)))
    }

    fn string(&mut self, quote: char) -> ConditionResult<Token> {
        self.pos += 1;
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string literal")),
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(Token::Str(text));
                }
                Some('\\') => {
                    let escaped = self
                        .peek_at(1)
                        .ok_or_else(|| self.error("unterminated escape"))?;
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                    self.pos += 2;
                }
                Some(c) => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn word(&mut self) -> Token {
        let start = self.pos;
        while self
            .peek()
            .map(|c| c.is_alphanumeric() || c == '_' || c == '$')
            .unwrap_or(false)
        {
            self.pos += 1;
        }
        let word: String = self.input[start..self.pos].iter().collect();
        match word.as_str() {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "in" => Token::In,
            _ => Token::Ident(word),
        }
    }

    fn symbol(&mut self) -> ConditionResult<Token> {
        let ch = self.peek().unwrap_or('\0');
        let next = self.peek_at(1);
        let (token, width) = match (ch, next) {
            ('=', Some('=')) => {
                // `===` is accepted as a synonym of `==`
                let width = if self.peek_at(2) == Some('=') { 3 } else { 2 };
                (Token::EqEq, width)
            }
            ('!', Some('=')) => {
                let width = if self.peek_at(2) == Some('=') { 3 } else { 2 };
                (Token::NotEq, width)
            }
            ('>', Some('=')) => (Token::Ge, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('>', _) => (Token::Gt, 1),
            ('<', _) => (Token::Lt, 1),
            ('!', _) => (Token::Not, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('.', _) => (Token::Dot, 1),
            (',', _) => (Token::Comma, 1),
            ('=', _) => return Err(self.error("assignment is not allowed, use '=='")),
            (other, _) => return Err(self.error(format!("unexpected character '{}'", other))),
        };
        self.pos += width;
        Ok(token)
    }
}

// ── Parser ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    /// Run `parse` one grouping level deeper
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ConditionResult<T>) -> ConditionResult<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("expression nested deeper than {} levels", MAX_NESTING)));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|(token, _)| token)
            .unwrap_or(&Token::Eof)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, at)| *at).unwrap_or(0)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        self.pos += 1;
        token
    }

    fn error(&self, message: impl Into<String>) -> ConditionError {
        ConditionError::Parse {
            position: self.position(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token) -> ConditionResult<()> {
        if *self.peek() == expected {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}, found {:?}", expected, self.peek())))
        }
    }

    fn expect_end(&self) -> ConditionResult<()> {
        match self.peek() {
            Token::Eof => Ok(()),
            other => Err(self.error(format!("unexpected trailing {:?}", other))),
        }
    }

    fn parse_or(&mut self) -> ConditionResult<Expr> {
        let mut left = self.parse_and()?;
        while *self.peek() == Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ConditionResult<Expr> {
        let mut left = self.parse_not()?;
        while *self.peek() == Token::And {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ConditionResult<Expr> {
        if *self.peek() == Token::Not {
            self.advance();
            return Ok(Expr::Not(Box::new(self.nested(Self::parse_not)?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ConditionResult<Expr> {
        let left = self.parse_sum()?;
        let op = match self.peek() {
            Token::EqEq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::Ne,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::In => BinaryOp::In,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_sum()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_sum(&mut self) -> ConditionResult<Expr> {
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_product()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_product(&mut self) -> ConditionResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> ConditionResult<Expr> {
        if *self.peek() == Token::Minus {
            self.advance();
            return Ok(Expr::Neg(Box::new(self.nested(Self::parse_unary)?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ConditionResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    match self.advance() {
                        Token::Ident(name) => expr = Expr::Member(Box::new(expr), name),
                        other => {
                            return Err(self.error(format!("expected field name, found {:?}", other)))
                        }
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.nested(Self::parse_or)?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> ConditionResult<Expr> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(number_value(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => Ok(Expr::Var(name)),
            Token::LParen => {
                let inner = self.nested(Self::parse_or)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if *self.peek() != Token::RBracket {
                    items.push(self.nested(Self::parse_or)?);
                    while *self.peek() == Token::Comma {
                        self.advance();
                        items.push(self.nested(Self::parse_or)?);
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::Array(items))
            }
            other => {
                self.pos -= 1;
                Err(self.error(format!("unexpected {:?}", other)))
            }
        }
    }
}

// ── Evaluation ───────────────────────────────────────────────────────

fn eval(expr: &Expr, vars: &HashMap<String, Value>) -> ConditionResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(name) => Ok(lookup(name, vars)),
        Expr::Member(target, field) => Ok(match eval(target, vars)? {
            Value::Object(map) => map.get(field).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }),
        Expr::Index(target, index) => {
            let target = eval(target, vars)?;
            let index = eval(index, vars)?;
            Ok(match (&target, &index) {
                (Value::Array(items), Value::Number(n)) => n
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned()
                    .unwrap_or(Value::Null),
                (Value::Object(map), Value::String(key)) => {
                    map.get(key).cloned().unwrap_or(Value::Null)
                }
                _ => Value::Null,
            })
        }
        Expr::Array(items) => items
            .iter()
            .map(|item| eval(item, vars))
            .collect::<ConditionResult<Vec<_>>>()
            .map(Value::Array),
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&eval(inner, vars)?))),
        Expr::Neg(inner) => match eval(inner, vars)? {
            Value::Number(n) => Ok(number_value(-n.as_f64().unwrap_or(0.0))),
            other => Err(ConditionError::Type(format!("cannot negate {}", other))),
        },
        Expr::Binary(BinaryOp::And, left, right) => {
            if !is_truthy(&eval(left, vars)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(is_truthy(&eval(right, vars)?)))
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            if is_truthy(&eval(left, vars)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(is_truthy(&eval(right, vars)?)))
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, vars)?;
            let right = eval(right, vars)?;
            binary(*op, &left, &right)
        }
    }
}

/// Resolves a root identifier. `variables` addresses the whole bag unless a
/// variable of that name exists.
fn lookup(name: &str, vars: &HashMap<String, Value>) -> Value {
    if let Some(value) = vars.get(name) {
        return value.clone();
    }
    if name == "variables" {
        return Value::Object(vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    }
    Value::Null
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> ConditionResult<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(left, right))),
        BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le => compare(op, left, right),
        BinaryOp::In => contains(left, right).map(Value::Bool),
        BinaryOp::Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(number_value(as_f64(a) + as_f64(b))),
            (Value::String(a), b) => Ok(Value::String(format!("{}{}", a, display(b)))),
            (a, Value::String(b)) => Ok(Value::String(format!("{}{}", display(a), b))),
            _ => Err(type_error("+", left, right)),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (Value::Number(a), Value::Number(b)) = (left, right) else {
                return Err(type_error(op_symbol(op), left, right));
            };
            let (a, b) = (as_f64(a), as_f64(b));
            let result = match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div if b == 0.0 => return Err(ConditionError::DivisionByZero),
                BinaryOp::Div => a / b,
                BinaryOp::Rem if b == 0.0 => return Err(ConditionError::DivisionByZero),
                _ => a % b,
            };
            Ok(number_value(result))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit operators are handled in eval"),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> ConditionResult<Value> {
    let ordering = match (left, right) {
        // Missing variables never satisfy an ordering comparison
        (Value::Null, _) | (_, Value::Null) => return Ok(Value::Bool(false)),
        (Value::Number(a), Value::Number(b)) => as_f64(a).partial_cmp(&as_f64(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => return Err(type_error(op_symbol(op), left, right)),
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(match op {
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        BinaryOp::Lt => ordering.is_lt(),
        _ => ordering.is_le(),
    }))
}

fn contains(needle: &Value, haystack: &Value) -> ConditionResult<bool> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| loose_eq(item, needle))),
        Value::String(text) => match needle {
            Value::String(part) => Ok(text.contains(part.as_str())),
            other => Err(type_error("in", other, haystack)),
        },
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            other => Err(type_error("in", other, haystack)),
        },
        Value::Null => Ok(false),
        other => Err(type_error("in", needle, other)),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => as_f64(a) == as_f64(b),
        _ => left == right,
    }
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(0.0)
}

/// Integral results stay integers so `1 + 1 == 2` serializes as `2`
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn op_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::And => "&&",
        BinaryOp::Or => "||",
        BinaryOp::Eq => "==",
        BinaryOp::Ne => "!=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::In => "in",
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
    }
}

fn type_error(op: &str, left: &Value, right: &Value) -> ConditionError {
    ConditionError::Type(format!("cannot apply '{}' to {} and {}", op, left, right))
}
