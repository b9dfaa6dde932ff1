// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The match engine: compiled boolean expressions over record fields.
//!
//! A match expression selects records by content, e.g.
//!
//! ```text
//! Type == 'stats.counter' && Severity <= 4
//! Payload =~ /user=(?P<user>\w+)/ || Fields[service] == 'auth'
//! ```
//!
//! Expressions are compiled once ([`CompiledMatcher`]) and evaluated per
//! record by the router. A successful `=~` populates [`Captures`] from the
//! regex's named groups; the captures travel to the matched runner alongside
//! the pack. A [`MatchRunner`] pairs a compiled matcher with the delivery
//! channel of the filter or output runner it fronts.

use crate::error::{PipelineError, Result};
use crate::message::{FieldValue, Message};
use crate::pack::{PackCapture, SharedPack};
use regex::Regex;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Bindings extracted by a matcher's regex named groups.
pub type Captures = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Re,
    NotRe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldRef {
    Type,
    Logger,
    Severity,
    Payload,
    Hostname,
    Uuid,
    Timestamp,
    Pid,
    Field(String),
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
    Pattern(Regex),
}

#[derive(Debug, Clone)]
enum Expr {
    True,
    False,
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp { field: FieldRef, op: CmpOp, value: Value },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Op(CmpOp),
    Ident(String),
    FieldsIdx(String),
    Str(String),
    Num(f64),
    Pattern(String),
}

fn syntax_error(expression: &str, detail: impl std::fmt::Display) -> PipelineError {
    PipelineError::Config(format!("invalid match expression '{expression}': {detail}"))
}

fn lex(expression: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();

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
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(syntax_error(expression, "expected '&&'"));
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(syntax_error(expression, "expected '||'"));
                }
                tokens.push(Token::Or);
            }
            '=' => {
                chars.next();
                match chars.next() {
                    Some('=') => tokens.push(Token::Op(CmpOp::Eq)),
                    Some('~') => tokens.push(Token::Op(CmpOp::Re)),
                    _ => return Err(syntax_error(expression, "expected '==' or '=~'")),
                }
            }
            '!' => {
                chars.next();
                match chars.next() {
                    Some('=') => tokens.push(Token::Op(CmpOp::Ne)),
                    Some('~') => tokens.push(Token::Op(CmpOp::NotRe)),
                    _ => return Err(syntax_error(expression, "expected '!=' or '!~'")),
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Le));
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Ge));
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => s.push(escaped),
                            None => return Err(syntax_error(expression, "unterminated string")),
                        },
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return Err(syntax_error(expression, "unterminated string")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '/' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => {
                                // Preserve regex escapes verbatim, but let \/
                                // stand for a literal slash.
                                if escaped != '/' {
                                    s.push('\\');
                                }
                                s.push(escaped);
                            }
                            None => return Err(syntax_error(expression, "unterminated regex")),
                        },
                        Some('/') => break,
                        Some(ch) => s.push(ch),
                        None => return Err(syntax_error(expression, "unterminated regex")),
                    }
                }
                tokens.push(Token::Pattern(s));
            }
            '0'..='9' | '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' || ch == 'e' || ch == 'E' || ch == '+' || ch == '-' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let num: f64 =
                    s.parse().map_err(|_| syntax_error(expression, format!("bad number '{s}'")))?;
                tokens.push(Token::Num(num));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if ident == "Fields" && chars.peek() == Some(&'[') {
                    chars.next();
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(ch) => name.push(ch),
                            None => {
                                return Err(syntax_error(expression, "unterminated Fields[...]"))
                            }
                        }
                    }
                    tokens.push(Token::FieldsIdx(name));
                } else {
                    tokens.push(Token::Ident(ident));
                }
            }
            _ => return Err(syntax_error(expression, format!("unexpected character '{c}'"))),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, detail: impl std::fmt::Display) -> PipelineError {
        syntax_error(self.expression, detail)
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_primary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_primary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                if self.next() != Some(Token::RParen) {
                    return Err(self.error("expected ')'"));
                }
                Ok(expr)
            }
            Some(Token::Ident(ident)) => match ident.as_str() {
                "TRUE" => Ok(Expr::True),
                "FALSE" => Ok(Expr::False),
                "Type" => self.parse_comparison(FieldRef::Type),
                "Logger" => self.parse_comparison(FieldRef::Logger),
                "Severity" => self.parse_comparison(FieldRef::Severity),
                "Payload" => self.parse_comparison(FieldRef::Payload),
                "Hostname" => self.parse_comparison(FieldRef::Hostname),
                "Uuid" => self.parse_comparison(FieldRef::Uuid),
                "Timestamp" => self.parse_comparison(FieldRef::Timestamp),
                "Pid" => self.parse_comparison(FieldRef::Pid),
                other => Err(self.error(format!("unknown field '{other}'"))),
            },
            Some(Token::FieldsIdx(name)) => self.parse_comparison(FieldRef::Field(name)),
            Some(tok) => Err(self.error(format!("unexpected token {tok:?}"))),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn parse_comparison(&mut self, field: FieldRef) -> Result<Expr> {
        let Some(Token::Op(op)) = self.next() else {
            return Err(self.error("expected a comparison operator"));
        };
        let value = match self.next() {
            Some(Token::Str(s)) => Value::Str(s),
            Some(Token::Num(n)) => Value::Num(n),
            Some(Token::Ident(ident)) if ident == "TRUE" => Value::Bool(true),
            Some(Token::Ident(ident)) if ident == "FALSE" => Value::Bool(false),
            Some(Token::Pattern(p)) => {
                let re = Regex::new(&p)
                    .map_err(|e| self.error(format!("bad regex /{p}/: {e}")))?;
                Value::Pattern(re)
            }
            _ => return Err(self.error("expected a literal value")),
        };

        let is_pattern = matches!(value, Value::Pattern(_));
        let is_re_op = matches!(op, CmpOp::Re | CmpOp::NotRe);
        if is_pattern != is_re_op {
            return Err(self.error("'=~' and '!~' require a /regex/ operand, other operators a literal"));
        }

        Ok(Expr::Cmp { field, op, value })
    }
}

enum Target<'a> {
    S(Cow<'a, str>),
    N(f64),
    B(bool),
    Missing,
}

#[allow(clippy::cast_precision_loss)]
fn resolve<'a>(field: &FieldRef, msg: &'a Message) -> Target<'a> {
    match field {
        FieldRef::Type => Target::S(Cow::Borrowed(&msg.msg_type)),
        FieldRef::Logger => Target::S(Cow::Borrowed(&msg.logger)),
        FieldRef::Payload => Target::S(Cow::Borrowed(&msg.payload)),
        FieldRef::Hostname => Target::S(Cow::Borrowed(&msg.hostname)),
        FieldRef::Uuid => Target::S(Cow::Owned(msg.uuid.to_string())),
        FieldRef::Severity => Target::N(f64::from(msg.severity)),
        FieldRef::Timestamp => Target::N(msg.timestamp_ns as f64),
        FieldRef::Pid => Target::N(f64::from(msg.pid)),
        FieldRef::Field(name) => match msg.field(name) {
            Some(FieldValue::Str(s)) => Target::S(Cow::Borrowed(s)),
            Some(FieldValue::Int(v)) => Target::N(*v as f64),
            Some(FieldValue::Double(v)) => Target::N(*v),
            Some(FieldValue::Bool(v)) => Target::B(*v),
            // Byte and array fields are not matchable.
            _ => Target::Missing,
        },
    }
}

fn ordering_matches(op: CmpOp, ord: Ordering) -> bool {
    match op {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Ne => ord != Ordering::Equal,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
        CmpOp::Re | CmpOp::NotRe => false,
    }
}

fn eval(expr: &Expr, msg: &Message, caps: &mut Captures) -> bool {
    match expr {
        Expr::True => true,
        Expr::False => false,
        Expr::And(left, right) => eval(left, msg, caps) && eval(right, msg, caps),
        Expr::Or(left, right) => eval(left, msg, caps) || eval(right, msg, caps),
        Expr::Cmp { field, op, value } => {
            let target = resolve(field, msg);
            match (target, value) {
                (Target::S(s), Value::Str(v)) => ordering_matches(*op, s.as_ref().cmp(v.as_str())),
                (Target::S(s), Value::Pattern(re)) => match op {
                    CmpOp::Re => re.captures(&s).map_or(false, |found| {
                        for name in re.capture_names().flatten() {
                            if let Some(m) = found.name(name) {
                                caps.insert(name.to_string(), m.as_str().to_string());
                            }
                        }
                        true
                    }),
                    CmpOp::NotRe => !re.is_match(&s),
                    _ => false,
                },
                (Target::N(a), Value::Num(b)) => {
                    a.partial_cmp(b).is_some_and(|ord| ordering_matches(*op, ord))
                }
                (Target::B(a), Value::Bool(b)) => match op {
                    CmpOp::Eq => a == *b,
                    CmpOp::Ne => a != *b,
                    _ => false,
                },
                // Missing fields and type mismatches never match.
                _ => false,
            }
        }
    }
}

/// A compiled match expression plus the optional signer predicate.
#[derive(Debug, Clone)]
pub struct CompiledMatcher {
    expression: String,
    expr: Expr,
    signer: Option<String>,
}

impl CompiledMatcher {
    /// Compiles `expression`, wrapping it with a signer check when `signer`
    /// is non-empty: the record's `signer` field must equal it.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] on any syntax or regex error.
    pub fn compile(expression: &str, signer: Option<String>) -> Result<Self> {
        let tokens = lex(expression)?;
        let mut parser = Parser { expression, tokens, pos: 0 };
        let expr = parser.parse_expr()?;
        if parser.peek().is_some() {
            return Err(parser.error("trailing tokens"));
        }
        let signer = signer.filter(|s| !s.is_empty());
        Ok(Self { expression: expression.to_string(), expr, signer })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Evaluates the matcher against a record. `Some` carries the extracted
    /// captures (possibly empty); `None` means no match.
    pub fn evaluate(&self, msg: &Message) -> Option<Captures> {
        if let Some(want) = &self.signer {
            if msg.field_str("signer") != Some(want.as_str()) {
                return None;
            }
        }
        let mut caps = Captures::new();
        eval(&self.expr, msg, &mut caps).then_some(caps)
    }
}

/// A compiled matcher bound to the delivery channel of the filter or output
/// runner it fronts. Owned and evaluated exclusively by the router.
#[derive(Debug)]
pub struct MatchRunner {
    runner_name: Arc<str>,
    matcher: CompiledMatcher,
    tx: mpsc::Sender<PackCapture>,
}

impl MatchRunner {
    pub fn new(runner_name: Arc<str>, matcher: CompiledMatcher, tx: mpsc::Sender<PackCapture>) -> Self {
        Self { runner_name, matcher, tx }
    }

    pub fn runner_name(&self) -> &str {
        &self.runner_name
    }

    pub fn evaluate(&self, msg: &Message) -> Option<Captures> {
        self.matcher.evaluate(msg)
    }

    /// Delivers a matched pack downstream, waiting for channel capacity.
    /// This send is the pipeline's backpressure point. Returns false when
    /// the runner's input channel has closed.
    pub async fn deliver(&self, pack: SharedPack, captures: Captures) -> bool {
        self.tx.send(PackCapture { pack, captures }).await.is_ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn msg() -> Message {
        let mut m = Message::new();
        m.msg_type.push_str("stats.counter");
        m.logger.push_str("udp-in");
        m.severity = 4;
        m.payload.push_str("user=alice action=login");
        m.hostname.push_str("node-7");
        m.set_field("service", "auth");
        m.set_field("attempts", 3i64);
        m.set_field("cached", true);
        m
    }

    fn matches(expr: &str) -> bool {
        CompiledMatcher::compile(expr, None).unwrap().evaluate(&msg()).is_some()
    }

    #[test]
    fn string_equality() {
        assert!(matches("Type == 'stats.counter'"));
        assert!(!matches("Type == 'other'"));
        assert!(matches("Type != 'other'"));
    }

    #[test]
    fn numeric_comparisons() {
        assert!(matches("Severity <= 4"));
        assert!(matches("Severity < 5"));
        assert!(!matches("Severity > 4"));
        assert!(matches("Fields[attempts] >= 3"));
    }

    #[test]
    fn logical_precedence() {
        // && binds tighter than ||.
        assert!(matches("Type == 'other' || Type == 'stats.counter' && Severity == 4"));
        assert!(!matches("(Type == 'other' || Type == 'stats.counter') && Severity == 7"));
    }

    #[test]
    fn field_lookup_and_booleans() {
        assert!(matches("Fields[service] == 'auth'"));
        assert!(matches("Fields[cached] == TRUE"));
        assert!(!matches("Fields[cached] == FALSE"));
        // Missing fields never match, in either polarity.
        assert!(!matches("Fields[nope] == 'x'"));
        assert!(!matches("Fields[nope] != 'x'"));
    }

    #[test]
    fn regex_match_extracts_named_captures() {
        let matcher =
            CompiledMatcher::compile(r"Payload =~ /user=(?P<user>\w+)/", None).unwrap();
        let caps = matcher.evaluate(&msg()).unwrap();
        assert_eq!(caps.get("user").map(String::as_str), Some("alice"));

        let matcher = CompiledMatcher::compile(r"Payload !~ /logout/", None).unwrap();
        assert!(matcher.evaluate(&msg()).is_some());
    }

    #[test]
    fn signer_gates_evaluation() {
        let matcher = CompiledMatcher::compile("TRUE", Some("trusted".to_string())).unwrap();
        let mut m = msg();
        assert!(matcher.evaluate(&m).is_none());
        m.set_field("signer", "trusted");
        assert!(matcher.evaluate(&m).is_some());

        // Empty signer strings mean "no signer predicate".
        let matcher = CompiledMatcher::compile("TRUE", Some(String::new())).unwrap();
        assert!(matcher.evaluate(&msg()).is_some());
    }

    #[test]
    fn syntax_errors_are_config_errors() {
        for bad in [
            "Type ==",
            "Type = 'x'",
            "Bogus == 'x'",
            "Type == 'x' &&",
            "Type =~ 'not-a-regex'",
            "Payload == /re/",
            "(Type == 'x'",
            "Type == 'x' extra",
        ] {
            let err = CompiledMatcher::compile(bad, None).unwrap_err();
            assert!(
                matches!(err, PipelineError::Config(_)),
                "expected config error for '{bad}', got {err:?}"
            );
        }
    }
}
