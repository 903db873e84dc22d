//! Safe expression evaluator for hook conditions.
//!
//! Evaluates simple expressions against a JSON context. Intentionally NOT
//! Turing-complete: no function calls, no method access, no assignment, no
//! imports. Anything outside the grammar fails to parse, which rejects the
//! declaring directive at load time.
//!
//! Grammar: literals (numbers, strings, booleans, null), dotted path access
//! (numeric segments index arrays), comparison (`== != < > <= >=`), logical
//! (`and or not`), membership (`in`, `not in`), arithmetic (`+ - * /`).
//! Missing paths resolve to null; ordered comparisons with null on either
//! side are false.

use serde_json::Value;

use crate::error::Result;
use crate::error::RyeErr;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Comp(&'static str),
    In,
    NotIn,
    And,
    Or,
    Not,
    Arith(char),
    LParen,
    RParen,
    Ident(String),
    Dot,
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Arith(c));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = match two.as_str() {
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    _ => None,
                };
                if let Some(op) = op {
                    tokens.push(Token::Comp(op));
                    i += 2;
                } else if c == '<' {
                    tokens.push(Token::Comp("<"));
                    i += 1;
                } else if c == '>' {
                    tokens.push(Token::Comp(">"));
                    i += 1;
                } else {
                    return Err(RyeErr::Expression(format!(
                        "unexpected character '{c}' in expression"
                    )));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(RyeErr::Expression("unterminated string literal".into()));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A digit followed by `.` followed by an identifier is a
                    // path segment boundary, not a decimal point.
                    if chars[i] == '.'
                        && i + 1 < chars.len()
                        && !chars[i + 1].is_ascii_digit()
                    {
                        break;
                    }
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let n = raw
                    .parse::<f64>()
                    .map_err(|_| RyeErr::Expression(format!("invalid number '{raw}'")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "null" => tokens.push(Token::Null),
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "in" => tokens.push(Token::In),
                    "not" => {
                        // Lookahead for `not in`.
                        let mut j = i;
                        while j < chars.len() && chars[j].is_whitespace() {
                            j += 1;
                        }
                        if chars[j..].starts_with(&['i', 'n'])
                            && chars
                                .get(j + 2)
                                .is_none_or(|c| !c.is_ascii_alphanumeric() && *c != '_')
                        {
                            tokens.push(Token::NotIn);
                            i = j + 2;
                        } else {
                            tokens.push(Token::Not);
                        }
                    }
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            _ => {
                return Err(RyeErr::Expression(format!(
                    "unexpected character '{c}' in expression"
                )));
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Comp(&'static str, Box<Ast>, Box<Ast>),
    In(bool, Box<Ast>, Box<Ast>),
    Arith(char, Box<Ast>, Box<Ast>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse(&mut self) -> Result<Ast> {
        let ast = self.parse_or()?;
        if let Some(tok) = self.peek() {
            return Err(RyeErr::Expression(format!("unexpected token: {tok:?}")));
        }
        Ok(ast)
    }

    fn parse_or(&mut self) -> Result<Ast> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.consume();
            let right = self.parse_and()?;
            left = Ast::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Ast> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.consume();
            let right = self.parse_not()?;
            left = Ast::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Ast> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.consume();
            let operand = self.parse_not()?;
            return Ok(Ast::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Ast> {
        let left = self.parse_additive()?;
        match self.peek() {
            Some(Token::Comp(op)) => {
                let op = *op;
                self.consume();
                let right = self.parse_additive()?;
                Ok(Ast::Comp(op, Box::new(left), Box::new(right)))
            }
            Some(Token::In) => {
                self.consume();
                let right = self.parse_additive()?;
                Ok(Ast::In(false, Box::new(left), Box::new(right)))
            }
            Some(Token::NotIn) => {
                self.consume();
                let right = self.parse_additive()?;
                Ok(Ast::In(true, Box::new(left), Box::new(right)))
            }
            _ => Ok(left),
        }
    }

    fn parse_additive(&mut self) -> Result<Ast> {
        let mut left = self.parse_term()?;
        while let Some(Token::Arith(op @ ('+' | '-'))) = self.peek() {
            let op = *op;
            self.consume();
            let right = self.parse_term()?;
            left = Ast::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Ast> {
        let mut left = self.parse_factor()?;
        while let Some(Token::Arith(op @ ('*' | '/'))) = self.peek() {
            let op = *op;
            self.consume();
            let right = self.parse_factor()?;
            left = Ast::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Ast> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Ast::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Ast::Literal(Value::String(s))),
            Some(Token::Bool(b)) => Ok(Ast::Literal(Value::Bool(b))),
            Some(Token::Null) => Ok(Ast::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.consume() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(RyeErr::Expression(format!(
                        "expected ')', got {other:?}"
                    ))),
                }
            }
            Some(Token::Ident(first)) => {
                let mut parts = vec![first];
                while matches!(self.peek(), Some(Token::Dot)) {
                    self.consume();
                    match self.consume() {
                        Some(Token::Ident(part)) => parts.push(part),
                        Some(Token::Number(n)) if n.fract() == 0.0 => {
                            parts.push(format!("{}", n as u64));
                        }
                        other => {
                            return Err(RyeErr::Expression(format!(
                                "expected path segment, got {other:?}"
                            )));
                        }
                    }
                }
                // A path followed by `(` would be a function call; the
                // grammar has no production for it.
                if matches!(self.peek(), Some(Token::LParen)) {
                    return Err(RyeErr::Expression(format!(
                        "function calls are not allowed: {}(...)",
                        parts.join(".")
                    )));
                }
                Ok(Ast::Path(parts))
            }
            other => Err(RyeErr::Expression(format!(
                "unexpected token: {other:?}"
            ))),
        }
    }
}

/// Resolve a dotted path against a JSON context. Numeric segments index
/// arrays. Missing paths yield null, never an error.
pub fn resolve_path(context: &Value, parts: &[String]) -> Value {
    let mut current = context;
    for part in parts {
        current = match current {
            Value::Object(map) => match map.get(part) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match part.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

/// Resolve a dotted path given as a string (`"state.items.0.name"`).
pub fn resolve_path_str(context: &Value, path: &str) -> Value {
    let parts: Vec<String> = path.split('.').map(str::to_string).collect();
    resolve_path(context, &parts)
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn eval(ast: &Ast, context: &Value) -> Value {
    match ast {
        Ast::Literal(v) => v.clone(),
        Ast::Path(parts) => resolve_path(context, parts),
        Ast::Not(inner) => Value::Bool(!truthy(&eval(inner, context))),
        Ast::And(l, r) => {
            let left = eval(l, context);
            if truthy(&left) {
                eval(r, context)
            } else {
                left
            }
        }
        Ast::Or(l, r) => {
            let left = eval(l, context);
            if truthy(&left) {
                left
            } else {
                eval(r, context)
            }
        }
        Ast::Comp(op, l, r) => {
            let left = eval(l, context);
            let right = eval(r, context);
            let result = match *op {
                "==" => values_equal(&left, &right),
                "!=" => !values_equal(&left, &right),
                // Ordered comparisons with null on either side are false.
                ordered => match (as_f64(&left), as_f64(&right)) {
                    (Some(a), Some(b)) => match ordered {
                        "<" => a < b,
                        ">" => a > b,
                        "<=" => a <= b,
                        ">=" => a >= b,
                        _ => false,
                    },
                    _ => match (&left, &right) {
                        (Value::String(a), Value::String(b)) => match ordered {
                            "<" => a < b,
                            ">" => a > b,
                            "<=" => a <= b,
                            ">=" => a >= b,
                            _ => false,
                        },
                        _ => false,
                    },
                },
            };
            Value::Bool(result)
        }
        Ast::In(negated, l, r) => {
            let needle = eval(l, context);
            let haystack = eval(r, context);
            let contained = match &haystack {
                Value::Null => false,
                Value::Array(items) => items.iter().any(|v| values_equal(v, &needle)),
                Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
                Value::Object(map) => needle.as_str().is_some_and(|n| map.contains_key(n)),
                _ => false,
            };
            // `x not in null` is vacuously true, matching the membership
            // semantics of the condition language.
            if *negated {
                Value::Bool(matches!(haystack, Value::Null) || !contained)
            } else {
                Value::Bool(contained)
            }
        }
        Ast::Arith(op, l, r) => {
            let a = as_f64(&eval(l, context)).unwrap_or(0.0);
            let b = as_f64(&eval(r, context)).unwrap_or(0.0);
            let result = match op {
                '+' => a + b,
                '-' => a - b,
                '*' => a * b,
                '/' => {
                    if b == 0.0 {
                        0.0
                    } else {
                        a / b
                    }
                }
                _ => 0.0,
            };
            serde_json::Number::from_f64(result)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Parse an expression, rejecting anything outside the grammar.
pub fn validate_expression(expr: &str) -> Result<()> {
    let tokens = tokenize(expr)?;
    Parser { tokens, pos: 0 }.parse()?;
    Ok(())
}

/// Evaluate an expression against a context, coercing to bool.
pub fn evaluate_expression(expr: &str, context: &Value) -> Result<bool> {
    let tokens = tokenize(expr)?;
    let ast = Parser { tokens, pos: 0 }.parse()?;
    Ok(truthy(&eval(&ast, context)))
}

/// Whether a hook condition matches: absent or empty conditions always
/// match; malformed ones fail loudly.
pub fn condition_matches(condition: Option<&str>, context: &Value) -> Result<bool> {
    match condition {
        None => Ok(true),
        Some(expr) if expr.trim().is_empty() => Ok(true),
        Some(expr) => evaluate_expression(expr, context),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "event": {"code": "permission_denied", "count": 3},
            "limits": {"turns": 10},
            "state": {"items": [{"name": "first"}, {"name": "second"}]},
            "tags": ["alpha", "beta"],
        })
    }

    #[test]
    fn comparisons() {
        let ctx = ctx();
        assert!(evaluate_expression("event.code == \"permission_denied\"", &ctx).unwrap());
        assert!(evaluate_expression("event.count < limits.turns", &ctx).unwrap());
        assert!(!evaluate_expression("event.count >= limits.turns", &ctx).unwrap());
        assert!(evaluate_expression("event.count != 4", &ctx).unwrap());
    }

    #[test]
    fn logical_and_membership() {
        let ctx = ctx();
        assert!(
            evaluate_expression("\"alpha\" in tags and event.count > 1", &ctx).unwrap()
        );
        assert!(evaluate_expression("\"gamma\" not in tags", &ctx).unwrap());
        assert!(evaluate_expression("not (event.count > 5)", &ctx).unwrap());
    }

    #[test]
    fn numeric_path_segments_index_arrays() {
        let ctx = ctx();
        assert!(
            evaluate_expression("state.items.0.name == \"first\"", &ctx).unwrap()
        );
        assert!(
            evaluate_expression("state.items.1.name == \"second\"", &ctx).unwrap()
        );
    }

    #[test]
    fn missing_paths_are_null_and_ordered_comparisons_false() {
        let ctx = ctx();
        assert!(!evaluate_expression("missing.path > 0", &ctx).unwrap());
        assert!(!evaluate_expression("missing.path < 0", &ctx).unwrap());
        assert!(evaluate_expression("missing.path == null", &ctx).unwrap());
    }

    #[test]
    fn arithmetic() {
        let ctx = ctx();
        assert!(evaluate_expression("event.count * 2 + 1 == 7", &ctx).unwrap());
        assert!(evaluate_expression("event.count / 0 == 0", &ctx).unwrap());
    }

    #[test]
    fn function_calls_are_rejected() {
        let ctx = ctx();
        assert!(evaluate_expression("len(tags) > 0", &ctx).is_err());
        assert!(evaluate_expression("event.code.upper() == \"X\"", &ctx).is_err());
    }

    #[test]
    fn assignment_is_rejected() {
        let ctx = ctx();
        assert!(evaluate_expression("event.count = 5", &ctx).is_err());
    }

    #[test]
    fn empty_condition_matches() {
        let ctx = ctx();
        assert!(condition_matches(None, &ctx).unwrap());
        assert!(condition_matches(Some("  "), &ctx).unwrap());
        assert!(!condition_matches(Some("event.count > 99"), &ctx).unwrap());
    }
}
