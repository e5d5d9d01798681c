//! Breakpoint conditions: a tiny C-like expression language over registers and memory.
//!
//! ```text
//! r3 == 0x80001234 && read_u32(r1 + 8) != 0
//! ```
//!
//! Every value is an `i64`. A condition holds when it evaluates to a non-zero value.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use easyerr::Error;
use gekko::Address;
use gekko::state::Register;

use crate::system::System;

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("unexpected character {ch:?} at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },
    #[error("unexpected end of condition")]
    UnexpectedEnd,
    #[error("unexpected {token:?} at offset {offset}")]
    UnexpectedToken { token: String, offset: usize },
    #[error("unknown register {name:?}")]
    UnknownRegister { name: String },
    #[error("unknown function {name:?}")]
    UnknownFunction { name: String },
    #[error("invalid number {text:?}")]
    InvalidNumber { text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

impl UnaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Neg => "-",
            Self::Not => "!",
            Self::BitNot => "~",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    And,
    Or,
}

impl BinaryOp {
    fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "*" => Self::Mul,
            "/" => Self::Div,
            "%" => Self::Rem,
            "+" => Self::Add,
            "-" => Self::Sub,
            "<<" => Self::Shl,
            ">>" => Self::Shr,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            "&" => Self::BitAnd,
            "^" => Self::BitXor,
            "|" => Self::BitOr,
            "&&" => Self::And,
            "||" => Self::Or,
            _ => return None,
        })
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Shl => "<<",
            Self::Shr => ">>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::BitAnd => "&",
            Self::BitXor => "^",
            Self::BitOr => "|",
            Self::And => "&&",
            Self::Or => "||",
        }
    }

    /// Binding strength, C style.
    fn precedence(self) -> u8 {
        match self {
            Self::Mul | Self::Div | Self::Rem => 10,
            Self::Add | Self::Sub => 9,
            Self::Shl | Self::Shr => 8,
            Self::Lt | Self::Le | Self::Gt | Self::Ge => 7,
            Self::Eq | Self::Ne => 6,
            Self::BitAnd => 5,
            Self::BitXor => 4,
            Self::BitOr => 3,
            Self::And => 2,
            Self::Or => 1,
        }
    }

    fn apply(self, lhs: i64, rhs: i64) -> i64 {
        match self {
            Self::Mul => lhs.wrapping_mul(rhs),
            Self::Div => lhs.checked_div(rhs).unwrap_or(0),
            Self::Rem => lhs.checked_rem(rhs).unwrap_or(0),
            Self::Add => lhs.wrapping_add(rhs),
            Self::Sub => lhs.wrapping_sub(rhs),
            Self::Shl => lhs.wrapping_shl(rhs as u32),
            Self::Shr => lhs.wrapping_shr(rhs as u32),
            Self::Lt => (lhs < rhs) as i64,
            Self::Le => (lhs <= rhs) as i64,
            Self::Gt => (lhs > rhs) as i64,
            Self::Ge => (lhs >= rhs) as i64,
            Self::Eq => (lhs == rhs) as i64,
            Self::Ne => (lhs != rhs) as i64,
            Self::BitAnd => lhs & rhs,
            Self::BitXor => lhs ^ rhs,
            Self::BitOr => lhs | rhs,
            Self::And => (lhs != 0 && rhs != 0) as i64,
            Self::Or => (lhs != 0 || rhs != 0) as i64,
        }
    }
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(i64),
    Register { name: String, reg: Register },
    /// A memory read of `width` bytes.
    Read { width: u8, addr: Box<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(value) => write!(f, "{value:#X}"),
            Self::Register { name, .. } => write!(f, "{name}"),
            Self::Read { width, addr } => write!(f, "read_u{}({addr})", width * 8),
            Self::Unary { op, expr } => write!(f, "({}{expr})", op.symbol()),
            Self::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
        }
    }
}

impl Expr {
    /// Evaluates this expression. Memory reads never raise guest exceptions: reads which fail
    /// evaluate to zero.
    pub fn eval(&self, sys: &mut System) -> i64 {
        match self {
            Self::Literal(value) => *value,
            Self::Register { reg, .. } => sys.cpu.register(*reg) as i64,
            Self::Read { width, addr } => {
                let addr = Address(addr.eval(sys) as u32);
                match width {
                    1 => sys.host_try_read::<u8>(addr).map_or(0, |r| r.value as i64),
                    2 => sys.host_try_read::<u16>(addr).map_or(0, |r| r.value as i64),
                    _ => sys.host_try_read::<u32>(addr).map_or(0, |r| r.value as i64),
                }
            }
            Self::Unary { op, expr } => {
                let value = expr.eval(sys);
                match op {
                    UnaryOp::Neg => value.wrapping_neg(),
                    UnaryOp::Not => (value == 0) as i64,
                    UnaryOp::BitNot => !value,
                }
            }
            Self::Binary { op, lhs, rhs } => {
                let lhs = lhs.eval(sys);
                match op {
                    // short circuit, like C
                    BinaryOp::And if lhs == 0 => 0,
                    BinaryOp::Or if lhs != 0 => 1,
                    _ => op.apply(lhs, rhs.eval(sys)),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(i64),
    Ident(String),
    Symbol(&'static str),
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Ident(ident) => write!(f, "{ident}"),
            Self::Symbol(symbol) => write!(f, "{symbol}"),
        }
    }
}

const SYMBOLS: [&str; 23] = [
    "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "*", "/", "%", "+", "-", "<", ">", "&", "^",
    "|", "!", "~", "(", ")", ",",
];

fn parse_number(text: &str) -> Result<i64, ConditionError> {
    let parsed = match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).map(|v| v as i64),
        None => text.parse::<u64>().map(|v| v as i64),
    };

    parsed.map_err(|_| ConditionError::InvalidNumber {
        text: text.to_owned(),
    })
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let mut tokens = Vec::new();
    let mut offset = 0;

    while offset < input.len() {
        let rest = &input[offset..];
        let Some(ch) = rest.chars().next() else {
            break;
        };

        if ch.is_whitespace() {
            offset += ch.len_utf8();
            continue;
        }

        if ch.is_ascii_alphanumeric() || ch == '_' {
            let len = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            let word = &rest[..len];

            let token = if ch.is_ascii_digit() {
                Token::Number(parse_number(word)?)
            } else {
                Token::Ident(word.to_owned())
            };

            tokens.push((offset, token));
            offset += len;
            continue;
        }

        let Some(symbol) = SYMBOLS.iter().find(|s| rest.starts_with(**s)) else {
            return Err(ConditionError::UnexpectedChar { ch, offset });
        };

        tokens.push((offset, Token::Symbol(*symbol)));
        offset += symbol.len();
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, t)| t)
    }

    fn next(&mut self) -> Result<(usize, Token), ConditionError> {
        let token = self
            .tokens
            .get(self.position)
            .cloned()
            .ok_or(ConditionError::UnexpectedEnd)?;

        self.position += 1;
        Ok(token)
    }

    fn expect(&mut self, symbol: &'static str) -> Result<(), ConditionError> {
        match self.next()? {
            (_, Token::Symbol(s)) if s == symbol => Ok(()),
            (offset, token) => Err(ConditionError::UnexpectedToken {
                token: token.to_string(),
                offset,
            }),
        }
    }

    fn binary(&mut self, min_precedence: u8) -> Result<Expr, ConditionError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Symbol(symbol)) = self.peek() {
            let Some(op) = BinaryOp::from_symbol(symbol) else {
                break;
            };

            if op.precedence() < min_precedence {
                break;
            }

            self.position += 1;
            let rhs = self.binary(op.precedence() + 1)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }

        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        let (offset, token) = self.next()?;
        let op = match token {
            Token::Number(value) => return Ok(Expr::Literal(value)),
            Token::Ident(name) => return self.ident(name),
            Token::Symbol("(") => {
                let expr = self.binary(0)?;
                self.expect(")")?;
                return Ok(expr);
            }
            Token::Symbol("-") => UnaryOp::Neg,
            Token::Symbol("!") => UnaryOp::Not,
            Token::Symbol("~") => UnaryOp::BitNot,
            token => {
                return Err(ConditionError::UnexpectedToken {
                    token: token.to_string(),
                    offset,
                });
            }
        };

        Ok(Expr::Unary {
            op,
            expr: Box::new(self.unary()?),
        })
    }

    fn ident(&mut self, name: String) -> Result<Expr, ConditionError> {
        if self.peek() != Some(&Token::Symbol("(")) {
            let reg = name
                .parse::<Register>()
                .map_err(|()| ConditionError::UnknownRegister { name: name.clone() })?;

            return Ok(Expr::Register { name, reg });
        }

        let width = match name.as_str() {
            "read_u8" => 1,
            "read_u16" => 2,
            "read_u32" => 4,
            _ => return Err(ConditionError::UnknownFunction { name }),
        };

        self.expect("(")?;
        let addr = self.binary(0)?;
        self.expect(")")?;

        Ok(Expr::Read {
            width,
            addr: Box::new(addr),
        })
    }
}

/// A parsed breakpoint condition. Cheap to clone.
#[derive(Clone)]
pub struct Condition {
    source: Arc<str>,
    expr: Arc<Expr>,
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Condition").field(&self.source).finish()
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.expr.fmt(f)
    }
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let mut parser = Parser {
            tokens: tokenize(source)?,
            position: 0,
        };

        let expr = parser.binary(0)?;
        if let Some((offset, token)) = parser.tokens.get(parser.position) {
            return Err(ConditionError::UnexpectedToken {
                token: token.to_string(),
                offset: *offset,
            });
        }

        Ok(Self {
            source: Arc::from(source),
            expr: Arc::new(expr),
        })
    }

    /// The text this condition was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn eval(&self, sys: &mut System) -> i64 {
        self.expr.eval(sys)
    }

    /// Whether this condition holds.
    pub fn is_true(&self, sys: &mut System) -> bool {
        self.eval(sys) != 0
    }
}
