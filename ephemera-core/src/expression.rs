//! Condition expressions and their memoized evaluation.
//!
//! Conditions are small boolean/numeric expressions over named bindings,
//! e.g. `lightsOn && !(visits > 3)`. They are evaluated in a sandbox: the
//! only inputs are the values bound by the condition's dependency mapping,
//! and evaluation has no side effects.
//!
//! Supported syntax, loosest binding first:
//!
//! | Form | Notes |
//! |---|---|
//! | `a ? b : c` | right associative |
//! | `a \|\| b`, `a && b` | short-circuit, yield an operand |
//! | `== != === !==` | numbers compare numerically, everything else structurally |
//! | `< <= > >=` | strings lexicographically, everything else as numbers |
//! | `+ -` | `+` concatenates when either side is a string |
//! | `* / %` | division by zero is an error |
//! | `!x`, `-x`, `(x)` | |
//!
//! Literals are numbers, single- or double-quoted strings, `true`, `false`
//! and `null`.

use crate::coalesce::CoalescingCache;
use crate::error::{CacheError, CacheResult};
use crate::id::ObjectId;
use crate::variables::VariableStateCache;
use serde_json::{Number, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::trace;

/// Error type for expression parsing and evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("Parse error in `{expression}` at {position}: {reason}")]
    Parse {
        expression: String,
        position: usize,
        reason: String,
    },
    #[error("Unbound identifier: {0}")]
    UnboundIdentifier(String),
    #[error("Division by zero")]
    DivisionByZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Identifier(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Question,
    Colon,
}

/// Operators in longest-match order.
const OPERATORS: [&str; 16] = [
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!",
];

fn parse_error(expression: &str, position: usize, reason: impl Into<String>) -> ExpressionError {
    ExpressionError::Parse {
        expression: expression.to_string(),
        position,
        reason: reason.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        match ch {
            '(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            '?' => {
                tokens.push((start, Token::Question));
                i += 1;
            }
            ':' => {
                tokens.push((start, Token::Colon));
                i += 1;
            }
            '\'' | '"' => {
                let quote = ch;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(parse_error(source, start, "unterminated string")),
                        Some(&c) if c == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| parse_error(source, i, "dangling escape"))?;
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&c) => {
                            value.push(c);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Str(value)));
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| parse_error(source, start, format!("invalid number `{text}`")))?;
                tokens.push((start, Token::Number(number)));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
            }
            _ => {
                let op = OPERATORS.iter().find(|op| {
                    op.chars()
                        .enumerate()
                        .all(|(offset, c)| chars.get(i + offset) == Some(&c))
                });
                match op {
                    Some(op) => {
                        tokens.push((start, Token::Op(*op)));
                        i += op.len();
                    }
                    None => {
                        return Err(parse_error(source, start, format!("unexpected character `{ch}`")))
                    }
                }
            }
        }
    }

    Ok(tokens)
}

fn binary_precedence(op: &str) -> Option<u8> {
    match op {
        "||" => Some(1),
        "&&" => Some(2),
        "==" | "!=" | "===" | "!==" => Some(3),
        "<" | "<=" | ">" | ">=" => Some(4),
        "+" | "-" => Some(5),
        "*" | "/" | "%" => Some(6),
        _ => None,
    }
}

fn keyword(name: &str) -> Option<Value> {
    match name {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        "null" | "undefined" => Some(Value::Null),
        _ => None,
    }
}

/// Deepest nesting of parentheses, ternaries and prefix operators.
const MAX_DEPTH: usize = 64;

/// Longest expression, in tokens. Bounds the depth of operator chains.
const MAX_TOKENS: usize = 1024;

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.source.len())
    }

    fn error(&self, reason: impl Into<String>) -> ExpressionError {
        parse_error(self.source, self.position(), reason)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, token)| token.clone());
        self.pos += 1;
        token
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    fn conditional(&mut self) -> Result<Expr, ExpressionError> {
        self.descend()?;
        let expr = self.ternary();
        self.depth -= 1;
        expr
    }

    fn ternary(&mut self) -> Result<Expr, ExpressionError> {
        let test = self.binary(1)?;
        if self.peek() != Some(&Token::Question) {
            return Ok(test);
        }
        self.advance();
        let consequent = self.conditional()?;
        if self.advance() != Some(Token::Colon) {
            self.pos -= 1;
            return Err(self.error("expected `:`"));
        }
        let alternate = self.conditional()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    fn binary(&mut self, min_precedence: u8) -> Result<Expr, ExpressionError> {
        let mut left = self.unary()?;
        loop {
            let (op, precedence) = match self.peek() {
                Some(Token::Op(op)) => match binary_precedence(op) {
                    Some(p) if p >= min_precedence => (*op, p),
                    _ => break,
                },
                _ => break,
            };
            self.advance();
            let right = Box::new(self.binary(precedence + 1)?);
            let left_box = Box::new(left);
            left = match op {
                "&&" => Expr::Logical {
                    op: LogicalOp::And,
                    left: left_box,
                    right,
                },
                "||" => Expr::Logical {
                    op: LogicalOp::Or,
                    left: left_box,
                    right,
                },
                _ => Expr::Binary {
                    op: match op {
                        "+" => BinaryOp::Add,
                        "-" => BinaryOp::Subtract,
                        "*" => BinaryOp::Multiply,
                        "/" => BinaryOp::Divide,
                        "%" => BinaryOp::Remainder,
                        "<" => BinaryOp::Less,
                        "<=" => BinaryOp::LessEqual,
                        ">" => BinaryOp::Greater,
                        ">=" => BinaryOp::GreaterEqual,
                        "==" | "===" => BinaryOp::Equal,
                        _ => BinaryOp::NotEqual,
                    },
                    left: left_box,
                    right,
                },
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        let op = match self.peek() {
            Some(Token::Op("!")) => UnaryOp::Not,
            Some(Token::Op("-")) => UnaryOp::Negate,
            _ => return self.primary(),
        };
        self.advance();
        self.descend()?;
        let operand = self.unary();
        self.depth -= 1;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => Ok(match keyword(&name) {
                Some(value) => Expr::Literal(value),
                None => Expr::Identifier(name),
            }),
            Some(Token::LParen) => {
                let inner = self.conditional()?;
                if self.advance() != Some(Token::RParen) {
                    self.pos -= 1;
                    return Err(self.error("expected `)`"));
                }
                Ok(inner)
            }
            Some(_) => {
                self.pos -= 1;
                Err(self.error("unexpected token"))
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

impl Expr {
    /// Parse an expression.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let mut parser = Parser {
            source,
            tokens: tokenize(source)?,
            pos: 0,
            depth: 0,
        };
        if parser.tokens.is_empty() {
            return Err(parse_error(source, 0, "empty expression"));
        }
        if parser.tokens.len() > MAX_TOKENS {
            return Err(parse_error(source, 0, format!("more than {MAX_TOKENS} tokens")));
        }
        let expr = parser.conditional()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Evaluate against a set of bindings.
    pub fn evaluate(&self, bindings: &BTreeMap<String, Value>) -> Result<Value, ExpressionError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Identifier(name) => bindings
                .get(name)
                .cloned()
                .ok_or_else(|| ExpressionError::UnboundIdentifier(name.clone())),
            Expr::Unary { op, operand } => {
                let value = operand.evaluate(bindings)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!is_truthy(&value)),
                    UnaryOp::Negate => number_value(-to_number(&value)),
                })
            }
            Expr::Logical { op, left, right } => {
                let left = left.evaluate(bindings)?;
                match (op, is_truthy(&left)) {
                    (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(left),
                    _ => right.evaluate(bindings),
                }
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if is_truthy(&test.evaluate(bindings)?) {
                    consequent.evaluate(bindings)
                } else {
                    alternate.evaluate(bindings)
                }
            }
            Expr::Binary { op, left, right } => {
                let left = left.evaluate(bindings)?;
                let right = right.evaluate(bindings)?;
                apply_binary(*op, &left, &right)
            }
        }
    }
}

fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    let numeric = |f: fn(f64, f64) -> f64| number_value(f(to_number(left), to_number(right)));
    Ok(match op {
        BinaryOp::Add => match (left, right) {
            (Value::String(_), _) | (_, Value::String(_)) => {
                Value::String(format!("{}{}", display(left), display(right)))
            }
            _ => numeric(|a, b| a + b),
        },
        BinaryOp::Subtract => numeric(|a, b| a - b),
        BinaryOp::Multiply => numeric(|a, b| a * b),
        BinaryOp::Divide | BinaryOp::Remainder => {
            let divisor = to_number(right);
            if divisor == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            let dividend = to_number(left);
            number_value(if op == BinaryOp::Divide {
                dividend / divisor
            } else {
                dividend % divisor
            })
        }
        BinaryOp::Equal => Value::Bool(values_equal(left, right)),
        BinaryOp::NotEqual => Value::Bool(!values_equal(left, right)),
        BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => to_number(left).partial_cmp(&to_number(right)),
            };
            Value::Bool(match ordering {
                None => false,
                Some(ordering) => match op {
                    BinaryOp::Less => ordering.is_lt(),
                    BinaryOp::LessEqual => ordering.is_le(),
                    BinaryOp::Greater => ordering.is_gt(),
                    _ => ordering.is_ge(),
                },
            })
        }
    })
}

/// Truthiness of a value: `false`, `null`, `0`, `NaN` and `""` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// Integral results stay integers so they compare and print naturally.
fn number_value(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse and evaluate `source` in one step.
pub fn evaluate(source: &str, bindings: &BTreeMap<String, Value>) -> Result<Value, ExpressionError> {
    Expr::parse(source)?.evaluate(bindings)
}

/// Memoization key: the exact expression text plus its name→id bindings.
///
/// The mapping is ordered, so two requests that list the same bindings in a
/// different order share one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EvaluationKey {
    pub expression: String,
    pub mapping: BTreeMap<String, ObjectId>,
}

/// Memoized evaluation of expressions over game state.
#[derive(Debug)]
pub struct ExpressionEvaluator {
    results: CoalescingCache<EvaluationKey, Value>,
    evaluations: AtomicUsize,
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self {
            results: CoalescingCache::new("evaluations"),
            evaluations: AtomicUsize::new(0),
        }
    }

    /// Evaluate `expression` with `mapping` bound through `variables`.
    ///
    /// Identical `(expression, mapping)` pairs share one evaluation and one
    /// variable fetch.
    pub async fn get(
        &self,
        variables: &VariableStateCache,
        expression: &str,
        mapping: &BTreeMap<String, ObjectId>,
    ) -> CacheResult<Value> {
        let key = EvaluationKey {
            expression: expression.to_string(),
            mapping: mapping.clone(),
        };
        self.results
            .add([key.clone()], |keys| async move {
                let bindings = variables.get(mapping).await?;
                self.evaluations.fetch_add(1, Ordering::SeqCst);
                let value = evaluate(expression, &bindings)?;
                trace!(expression, %value, "evaluated");
                Ok::<_, CacheError>(keys.into_iter().map(|key| (key, value.clone())).collect::<HashMap<_, _>>())
            })
            .await;
        self.results.get(&key).await
    }

    /// Forget every memoized result whose bindings mention `id`.
    pub fn invalidate_by_variable(&self, id: &ObjectId) -> usize {
        self.results
            .invalidate_where(|key, _| key.mapping.values().any(|bound| bound == id))
            .len()
    }

    /// How many evaluations have actually run (cache hits excluded).
    pub fn evaluation_count(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.results.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(source: &str, bindings: &[(&str, Value)]) -> Value {
        let bindings = bindings
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        evaluate(source, &bindings).unwrap()
    }

    #[test]
    fn test_literals_and_precedence() {
        assert_eq!(eval("1 + 2 * 3", &[]), json!(7));
        assert_eq!(eval("(1 + 2) * 3", &[]), json!(9));
        assert_eq!(eval("7 % 4 - 1", &[]), json!(2));
        assert_eq!(eval("1 / 4", &[]), json!(0.25));
        assert_eq!(eval("'a' + \"b\"", &[]), json!("ab"));
        assert_eq!(eval("'n' + 1", &[]), json!("n1"));
    }

    #[test]
    fn test_logic_and_comparison() {
        let b = [("open", json!(true)), ("visits", json!(4))];
        assert_eq!(eval("open && visits > 3", &b), json!(true));
        assert_eq!(eval("!open || visits < 3", &b), json!(false));
        assert_eq!(eval("visits === 4", &b), json!(true));
        assert_eq!(eval("visits != 4.0", &b), json!(false));
        assert_eq!(eval("'abc' < 'abd'", &[]), json!(true));
        assert_eq!(eval("open ? 'lit' : 'dark'", &b), json!("lit"));
    }

    #[test]
    fn test_short_circuit_returns_operand() {
        assert_eq!(eval("0 || 'fallback'", &[]), json!("fallback"));
        assert_eq!(eval("'' && missing", &[]), json!(""));
    }

    #[test]
    fn test_nested_ternary_is_right_associative() {
        assert_eq!(eval("false ? 1 : true ? 2 : 3", &[]), json!(2));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("0")));
        assert!(is_truthy(&json!([])));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            evaluate("missing", &BTreeMap::new()),
            Err(ExpressionError::UnboundIdentifier(name)) if name == "missing"
        ));
        assert!(matches!(Expr::parse("1 +"), Err(ExpressionError::Parse { .. })));
        assert!(matches!(Expr::parse("(1"), Err(ExpressionError::Parse { .. })));
        assert!(matches!(Expr::parse("1 2"), Err(ExpressionError::Parse { .. })));
        assert!(matches!(Expr::parse("a ? b"), Err(ExpressionError::Parse { .. })));
        assert!(matches!(Expr::parse("'open"), Err(ExpressionError::Parse { .. })));
        assert!(matches!(Expr::parse("a = 1"), Err(ExpressionError::Parse { .. })));
        assert_eq!(
            evaluate("1 / 0", &BTreeMap::new()),
            Err(ExpressionError::DivisionByZero)
        );
    }

    #[test]
    fn test_nesting_is_capped() {
        let nested = |depth: usize| format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(eval(&nested(32), &[]), json!(1));
        assert!(matches!(Expr::parse(&nested(100)), Err(ExpressionError::Parse { .. })));
        assert!(matches!(
            Expr::parse(&nested(100_000)),
            Err(ExpressionError::Parse { .. })
        ));

        assert_eq!(eval(&format!("{}true", "!".repeat(10)), &[]), json!(true));
        assert!(matches!(
            Expr::parse(&format!("{}true", "!".repeat(5_000))),
            Err(ExpressionError::Parse { .. })
        ));
        assert!(matches!(
            Expr::parse(&["1"; 2_000].join(" + ")),
            Err(ExpressionError::Parse { .. })
        ));
    }
}
