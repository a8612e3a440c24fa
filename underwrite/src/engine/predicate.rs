//! Safe guard predicates for conditional steps.
//!
//! A deliberately closed expression subset: comparisons, `and`/`or`/`not`,
//! parentheses, numeric/string/boolean literals, and dotted field access over
//! prior assessments (`<agent_key>.status`, `<agent_key>.confidence`,
//! `<agent_key>.structured_result.<field>...`). The config loader parses each
//! guard once and caches the predicate on its step; evaluation reads the
//! ledger without executing anything else.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::ledger::RunLedger;

#[derive(Debug, Error)]
pub enum PredicateError {
    #[error("unexpected character {0:?}")]
    UnexpectedChar(char),
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("trailing input after expression: {0}")]
    TrailingInput(String),
    #[error("unterminated string literal")]
    UnterminatedString,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(Vec<String>),
    Number(f64),
    Str(String),
    Bool(bool),
    And,
    Or,
    Not,
    Op(CompareOp),
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Path(p) => write!(f, "{}", p.join(".")),
            Token::Number(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::Bool(b) => write!(f, "{}", b),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::Not => write!(f, "not"),
            Token::Op(op) => write!(f, "{}", op),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Number(f64),
    Str(String),
    Bool(bool),
    Path(Vec<String>),
}

/// A parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    /// A bare operand; true only for a boolean `true` value.
    Truthy(Operand),
}

impl Predicate {
    pub fn parse(input: &str) -> Result<Self, PredicateError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let predicate = parser.or_expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(PredicateError::TrailingInput(
                parser.tokens[parser.pos].to_string(),
            ));
        }
        Ok(predicate)
    }

    /// Evaluates against prior assessments. Unresolvable paths make any
    /// comparison false rather than failing the run.
    pub fn eval(&self, ledger: &RunLedger) -> bool {
        match self {
            Predicate::And(a, b) => a.eval(ledger) && b.eval(ledger),
            Predicate::Or(a, b) => a.eval(ledger) || b.eval(ledger),
            Predicate::Not(inner) => !inner.eval(ledger),
            Predicate::Compare { left, op, right } => {
                match (resolve(left, ledger), resolve(right, ledger)) {
                    (Some(l), Some(r)) => compare(&l, *op, &r),
                    _ => false,
                }
            }
            Predicate::Truthy(operand) => {
                matches!(resolve(operand, ledger), Some(Value::Bool(true)))
            }
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, PredicateError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
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
            '=' => {
                chars.next();
                match chars.next() {
                    Some('=') => tokens.push(Token::Op(CompareOp::Eq)),
                    _ => return Err(PredicateError::UnexpectedChar('=')),
                }
            }
            '!' => {
                chars.next();
                match chars.next() {
                    Some('=') => tokens.push(Token::Op(CompareOp::Ne)),
                    _ => return Err(PredicateError::UnexpectedChar('!')),
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CompareOp::Le));
                } else {
                    tokens.push(Token::Op(CompareOp::Lt));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CompareOp::Ge));
                } else {
                    tokens.push(Token::Op(CompareOp::Gt));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return Err(PredicateError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = s
                    .parse::<f64>()
                    .map_err(|_| PredicateError::UnexpectedToken(s.clone()))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut segments = vec![String::new()];
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        if let Some(segment) = segments.last_mut() {
                            segment.push(ch);
                        }
                        chars.next();
                    } else if ch == '.' {
                        segments.push(String::new());
                        chars.next();
                    } else {
                        break;
                    }
                }
                if segments.iter().any(|s| s.is_empty()) {
                    return Err(PredicateError::UnexpectedChar('.'));
                }
                match segments.as_slice() {
                    [word] if word == "and" => tokens.push(Token::And),
                    [word] if word == "or" => tokens.push(Token::Or),
                    [word] if word == "not" => tokens.push(Token::Not),
                    [word] if word == "true" => tokens.push(Token::Bool(true)),
                    [word] if word == "false" => tokens.push(Token::Bool(false)),
                    _ => tokens.push(Token::Path(segments)),
                }
            }
            other => return Err(PredicateError::UnexpectedChar(other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, PredicateError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(PredicateError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn or_expr(&mut self) -> Result<Predicate, PredicateError> {
        let mut left = self.and_expr()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Predicate, PredicateError> {
        let mut left = self.not_expr()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.pos += 1;
            let right = self.not_expr()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Predicate, PredicateError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.pos += 1;
            return Ok(Predicate::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Predicate, PredicateError> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.pos += 1;
            let inner = self.or_expr()?;
            match self.next()? {
                Token::RParen => return Ok(inner),
                other => return Err(PredicateError::UnexpectedToken(other.to_string())),
            }
        }
        let left = self.operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.operand()?;
            return Ok(Predicate::Compare { left, op, right });
        }
        Ok(Predicate::Truthy(left))
    }

    fn operand(&mut self) -> Result<Operand, PredicateError> {
        match self.next()? {
            Token::Path(p) => Ok(Operand::Path(p)),
            Token::Number(n) => Ok(Operand::Number(n)),
            Token::Str(s) => Ok(Operand::Str(s)),
            Token::Bool(b) => Ok(Operand::Bool(b)),
            other => Err(PredicateError::UnexpectedToken(other.to_string())),
        }
    }
}

/// Resolves an operand to a JSON value against the ledger.
fn resolve(operand: &Operand, ledger: &RunLedger) -> Option<Value> {
    match operand {
        Operand::Number(n) => serde_json::Number::from_f64(*n).map(Value::Number),
        Operand::Str(s) => Some(Value::String(s.clone())),
        Operand::Bool(b) => Some(Value::Bool(*b)),
        Operand::Path(segments) => {
            let assessment = ledger.assessment(segments.first()?)?;
            match segments.get(1).map(String::as_str) {
                Some("status") => serde_json::to_value(assessment.status).ok(),
                Some("confidence") => serde_json::Number::from_f64(assessment.confidence)
                    .map(Value::Number),
                Some("risk_factors") => serde_json::to_value(&assessment.risk_factors).ok(),
                Some("structured_result") => {
                    let mut current = assessment.structured_result.as_ref()?;
                    for segment in &segments[2..] {
                        current = current.get(segment)?;
                    }
                    Some(current.clone())
                }
                _ => None,
            }
        }
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return match op {
            CompareOp::Eq => l == r,
            CompareOp::Ne => l != r,
            CompareOp::Lt => l < r,
            CompareOp::Le => l <= r,
            CompareOp::Gt => l > r,
            CompareOp::Ge => l >= r,
        };
    }
    match op {
        CompareOp::Eq => left == right,
        CompareOp::Ne => left != right,
        _ => false,
    }
}
