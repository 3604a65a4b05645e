//! Message selectors.
//!
//! A SUBSCRIBE frame may carry a `selector` header: a small predicate over
//! message headers, compiled once at subscription time and evaluated against
//! each delivery. Grammar:
//!
//! ```text
//! expr   := term ( OR term )*
//! term   := factor ( AND factor )*
//! factor := ident ( '=' | '!=' ) 'literal'  |  '(' expr ')'
//! ```
//!
//! `AND`/`OR` are case-insensitive. A comparison against a header the
//! message does not carry is false (and its negation true).

use std::fmt;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("selector syntax error at offset {0}: {1}")]
    Syntax(usize, &'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Literal(String),
    Eq,
    Neq,
    And,
    Or,
    Open,
    Close,
}

#[derive(Debug, Clone)]
enum Expr {
    Compare {
        key: String,
        negated: bool,
        value: String,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
pub struct Selector {
    expr: Expr,
}

impl Selector {
    pub fn compile(input: &str) -> Result<Selector, SelectorError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            len: input.len(),
        };
        let expr = parser.or_expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(SelectorError::Syntax(input.len(), "trailing input"));
        }
        Ok(Selector { expr })
    }

    pub fn evaluate(&self, headers: &[(String, String)]) -> bool {
        eval(&self.expr, headers)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.expr)
    }
}

fn eval(expr: &Expr, headers: &[(String, String)]) -> bool {
    match expr {
        Expr::Compare {
            key,
            negated,
            value,
        } => {
            let found = headers
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v == value);
            match (found, negated) {
                (Some(eq), false) => eq,
                (Some(eq), true) => !eq,
                // Absent header: equality is false, negation is true.
                (None, negated) => *negated,
            }
        }
        Expr::And(a, b) => eval(a, headers) && eval(b, headers),
        Expr::Or(a, b) => eval(a, headers) || eval(b, headers),
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, SelectorError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' => i += 1,
            b'(' => {
                tokens.push((i, Token::Open));
                i += 1;
            }
            b')' => {
                tokens.push((i, Token::Close));
                i += 1;
            }
            b'=' => {
                tokens.push((i, Token::Eq));
                i += 1;
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((i, Token::Neq));
                    i += 2;
                } else {
                    return Err(SelectorError::Syntax(i, "expected '=' after '!'"));
                }
            }
            b'<' => {
                if bytes.get(i + 1) == Some(&b'>') {
                    tokens.push((i, Token::Neq));
                    i += 2;
                } else {
                    return Err(SelectorError::Syntax(i, "expected '>' after '<'"));
                }
            }
            b'\'' => {
                let start = i + 1;
                let Some(rel) = bytes[start..].iter().position(|&c| c == b'\'') else {
                    return Err(SelectorError::Syntax(i, "unterminated string literal"));
                };
                let literal = &input[start..start + rel];
                tokens.push((i, Token::Literal(literal.to_owned())));
                i = start + rel + 1;
            }
            c if c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b'.' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric()
                        || bytes[i] == b'_'
                        || bytes[i] == b'-'
                        || bytes[i] == b'.')
                {
                    i += 1;
                }
                let word = &input[start..i];
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    _ => Token::Ident(word.to_owned()),
                };
                tokens.push((start, token));
            }
            _ => return Err(SelectorError::Syntax(i, "unexpected character")),
        }
    }
    if tokens.is_empty() {
        return Err(SelectorError::Syntax(0, "empty selector"));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.len, |(o, _)| *o)
    }

    fn or_expr(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.factor()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.factor()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, SelectorError> {
        match self.peek().cloned() {
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.or_expr()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(SelectorError::Syntax(self.offset(), "expected ')'"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Ident(key)) => {
                self.pos += 1;
                let negated = match self.peek() {
                    Some(Token::Eq) => false,
                    Some(Token::Neq) => true,
                    _ => {
                        return Err(SelectorError::Syntax(
                            self.offset(),
                            "expected comparison operator",
                        ));
                    }
                };
                self.pos += 1;
                let Some(Token::Literal(value)) = self.peek().cloned() else {
                    return Err(SelectorError::Syntax(
                        self.offset(),
                        "expected quoted literal",
                    ));
                };
                self.pos += 1;
                Ok(Expr::Compare {
                    key,
                    negated,
                    value,
                })
            }
            _ => Err(SelectorError::Syntax(self.offset(), "expected comparison")),
        }
    }
}
