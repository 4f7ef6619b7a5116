//! Decimal expression evaluator and the `calculate` tool.
//!
//! Grammar:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '%') unary)*
//! unary   := ('+' | '-') unary | primary
//! primary := number | '(' expr ')'
//! ```
//!
//! Numbers are decimal literals with `.` as the separator. All arithmetic is
//! checked; results are normalized so `21.00` renders as `21`.

use std::str::FromStr;

use serde::Deserialize;
use serde_json::{Value, json};
use tally_types::{Decimal, canonical_decimal};
use thiserror::Error;

use crate::{ToolExecutor, ToolFut, parse_args};

const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalcError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("unexpected '{found}' at position {pos}")]
    UnexpectedToken { found: String, pos: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("arithmetic overflow")]
    Overflow,
    #[error("expression nested too deeply")]
    TooDeep,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Decimal),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => n.to_string(),
            Token::Plus => "+".to_string(),
            Token::Minus => "-".to_string(),
            Token::Star => "*".to_string(),
            Token::Slash => "/".to_string(),
            Token::Percent => "%".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, CalcError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let token = match ch {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                tokens.push((Token::Number(parse_number(&literal)?), start));
                continue;
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '(' => Token::LParen,
            ')' => Token::RParen,
            other => return Err(CalcError::UnexpectedChar { ch: other, pos: i }),
        };
        tokens.push((token, i));
        i += 1;
    }

    Ok(tokens)
}

fn parse_number(literal: &str) -> Result<Decimal, CalcError> {
    let invalid = || CalcError::InvalidNumber(literal.to_string());

    if literal.matches('.').count() > 1 || literal.ends_with('.') {
        return Err(invalid());
    }
    let padded;
    let literal_for_parse = if literal.starts_with('.') {
        padded = format!("0{literal}");
        padded.as_str()
    } else {
        literal
    };
    Decimal::from_str(literal_for_parse).map_err(|_| invalid())
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn enter(&mut self) -> Result<(), CalcError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(CalcError::TooDeep);
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Decimal, CalcError> {
        let mut acc = self.term()?;
        while let Some(op) = self.peek() {
            let apply: fn(Decimal, Decimal) -> Option<Decimal> = match op {
                Token::Plus => Decimal::checked_add,
                Token::Minus => Decimal::checked_sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.term()?;
            acc = apply(acc, rhs).ok_or(CalcError::Overflow)?;
        }
        Ok(acc)
    }

    fn term(&mut self) -> Result<Decimal, CalcError> {
        let mut acc = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(op @ (Token::Star | Token::Slash | Token::Percent)) => op.clone(),
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            acc = match op {
                Token::Star => acc.checked_mul(rhs).ok_or(CalcError::Overflow)?,
                _ if rhs.is_zero() => return Err(CalcError::DivisionByZero),
                Token::Slash => acc.checked_div(rhs).ok_or(CalcError::Overflow)?,
                _ => acc.checked_rem(rhs).ok_or(CalcError::Overflow)?,
            };
        }
        Ok(acc)
    }

    fn unary(&mut self) -> Result<Decimal, CalcError> {
        match self.peek() {
            Some(Token::Plus) => {
                self.pos += 1;
                self.enter()?;
                let value = self.unary();
                self.depth -= 1;
                value
            }
            Some(Token::Minus) => {
                self.pos += 1;
                self.enter()?;
                let value = self.unary().map(|v| -v);
                self.depth -= 1;
                value
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Decimal, CalcError> {
        match self.next() {
            Some((Token::Number(n), _)) => Ok(n),
            Some((Token::LParen, _)) => {
                self.enter()?;
                let value = self.expr()?;
                self.depth -= 1;
                match self.next() {
                    Some((Token::RParen, _)) => Ok(value),
                    Some((token, pos)) => Err(CalcError::UnexpectedToken {
                        found: token.describe(),
                        pos,
                    }),
                    None => Err(CalcError::UnexpectedEnd),
                }
            }
            Some((token, pos)) => Err(CalcError::UnexpectedToken {
                found: token.describe(),
                pos,
            }),
            None => Err(CalcError::UnexpectedEnd),
        }
    }
}

/// Evaluate an arithmetic expression to a normalized decimal.
pub fn evaluate(expression: &str) -> Result<Decimal, CalcError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(CalcError::Empty);
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;

    if let Some((token, pos)) = parser.next() {
        return Err(CalcError::UnexpectedToken {
            found: token.describe(),
            pos,
        });
    }

    Ok(value.normalize())
}

/// Render an evaluation as the text handed back to the model.
#[must_use]
pub fn calculate(expression: &str) -> String {
    match evaluate(expression) {
        Ok(value) => canonical_decimal(&value),
        Err(e) => format!("Calculation error: {e}"),
    }
}

#[derive(Debug, Deserialize)]
struct CalculateArgs {
    expression: String,
}

/// The `calculate` tool.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalculatorTool;

impl ToolExecutor for CalculatorTool {
    fn name(&self) -> &'static str {
        "calculate"
    }

    fn description(&self) -> &'static str {
        "Evaluate an arithmetic expression with exact decimal math. Supports + - * / %, \
         parentheses and unary minus. Use '.' as the decimal separator."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Arithmetic expression, e.g. \"(100 - 15) * 0.21\""
                }
            },
            "required": ["expression"],
            "additionalProperties": false
        })
    }

    fn execute(&self, args: Value) -> ToolFut<'_> {
        Box::pin(async move {
            let args: CalculateArgs = parse_args(&args)?;
            let output = calculate(&args.expression);
            tracing::debug!(expression = %args.expression, output = %output, "calculate");
            Ok(output)
        })
    }
}
