//! Integer expressions used for grid shapes and array lengths.
//!
//! Grammar:
//!
//! ```text
//! top     := '[' sum (',' sum)* ']' | sum
//! sum     := product (('+' | '-') product)*
//! product := unary (('*' | '/' | '%') unary)*
//! unary   := '-' unary | primary
//! primary := NUMBER | IDENT | IDENT '(' sum (',' sum)* ')' | '(' sum ')'
//! ```
//!
//! Built-in functions are `ceilDiv(a, b)`, `min(a, b)` and `max(a, b)`.
//!
//! ```
//! use compute_kernel::expr::{Bindings, Expr};
//!
//! let grid = Expr::parse("[nf, ceilDiv(n, 64)]").unwrap();
//! let mut env = Bindings::new();
//! env.insert("nf".to_string(), 3);
//! env.insert("n".to_string(), 100);
//! assert_eq!(grid.eval_list(&env).unwrap(), vec![3, 2]);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Values visible to an expression, by identifier
pub type Bindings = BTreeMap<String, i64>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(i64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Ident(name) => write!(f, "{name}"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
        }
    }
}

struct Lexer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Lexer { input, position: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn consume(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.position += ch.len_utf8();
        Some(ch)
    }

    fn take_while(&mut self, accept: impl Fn(char) -> bool) -> &'a str {
        let start = self.position;
        while self.peek().is_some_and(&accept) {
            self.consume();
        }
        &self.input[start..self.position]
    }

    fn tokenize(mut self) -> std::result::Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        loop {
            self.take_while(char::is_whitespace);
            let Some(ch) = self.peek() else {
                return Ok(tokens);
            };
            let token = match ch {
                '0'..='9' => {
                    let digits = self.take_while(|c| c.is_ascii_digit());
                    Token::Number(digits.parse().map_err(|_| format!("number {digits} is too large"))?)
                }
                c if c.is_alphabetic() || c == '_' => {
                    Token::Ident(self.take_while(|c| c.is_alphanumeric() || c == '_').to_string())
                }
                _ => {
                    self.consume();
                    match ch {
                        '+' => Token::Plus,
                        '-' => Token::Minus,
                        '*' => Token::Star,
                        '/' => Token::Slash,
                        '%' => Token::Percent,
                        ',' => Token::Comma,
                        '(' => Token::LParen,
                        ')' => Token::RParen,
                        '[' => Token::LBracket,
                        ']' => Token::RBracket,
                        other => return Err(format!("unexpected character '{other}'")),
                    }
                }
            };
            tokens.push(token);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Number(i64),
    Ident(String),
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
    List(Vec<Node>),
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

type ParseResult<T> = std::result::Result<T, String>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned()?;
        self.position += 1;
        Some(token)
    }

    fn expect(&mut self, expected: Token) -> ParseResult<()> {
        match self.consume() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected '{expected}' but found '{token}'")),
            None => Err(format!("expected '{expected}' but the expression ended")),
        }
    }

    fn parse_top(&mut self) -> ParseResult<Node> {
        let node = if self.peek() == Some(&Token::LBracket) {
            self.consume();
            Node::List(self.parse_arguments(Token::RBracket)?)
        } else {
            self.parse_sum()?
        };
        match self.peek() {
            None => Ok(node),
            Some(token) => Err(format!("unexpected '{token}' after end of expression")),
        }
    }

    fn parse_arguments(&mut self, close: Token) -> ParseResult<Vec<Node>> {
        let mut items = vec![self.parse_sum()?];
        while self.peek() == Some(&Token::Comma) {
            self.consume();
            items.push(self.parse_sum()?);
        }
        self.expect(close)?;
        Ok(items)
    }

    fn parse_sum(&mut self) -> ParseResult<Node> {
        let mut node = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(node),
            };
            self.consume();
            node = Node::Binary(op, Box::new(node), Box::new(self.parse_product()?));
        }
    }

    fn parse_product(&mut self) -> ParseResult<Node> {
        let mut node = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => return Ok(node),
            };
            self.consume();
            node = Node::Binary(op, Box::new(node), Box::new(self.parse_unary()?));
        }
    }

    fn parse_unary(&mut self) -> ParseResult<Node> {
        if self.peek() == Some(&Token::Minus) {
            self.consume();
            return Ok(Node::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ParseResult<Node> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Node::Number(n)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.consume();
                    let args = self.parse_arguments(Token::RParen)?;
                    Ok(Node::Call(name, args))
                } else {
                    Ok(Node::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_sum()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(token) => Err(format!("unexpected '{token}'")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

/// A parsed expression, keeping its source text for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expr {
    source: String,
    root: Node,
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        let tokens = Lexer::new(source)
            .tokenize()
            .map_err(|reason| Error::expression(source, reason))?;
        let root = Parser { tokens, position: 0 }
            .parse_top()
            .map_err(|reason| Error::expression(source, reason))?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_list(&self) -> bool {
        matches!(self.root, Node::List(_))
    }

    /// The identifier when the whole expression is a single name.
    pub fn as_identifier(&self) -> Option<&str> {
        match &self.root {
            Node::Ident(name) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Evaluate a scalar expression.
    pub fn eval(&self, env: &Bindings) -> Result<i64> {
        match &self.root {
            Node::List(_) => Err(Error::expression(&self.source, "expected a scalar but found a list")),
            node => self.eval_node(node, env),
        }
    }

    /// Evaluate a list expression; a scalar yields a one-element list.
    pub fn eval_list(&self, env: &Bindings) -> Result<Vec<i64>> {
        match &self.root {
            Node::List(items) => items.iter().map(|item| self.eval_node(item, env)).collect(),
            node => Ok(vec![self.eval_node(node, env)?]),
        }
    }

    fn eval_node(&self, node: &Node, env: &Bindings) -> Result<i64> {
        let fail = |reason: String| Error::expression(&self.source, reason);
        match node {
            Node::Number(n) => Ok(*n),
            Node::Ident(name) => env
                .get(name)
                .copied()
                .ok_or_else(|| fail(format!("unknown identifier '{name}'"))),
            Node::Neg(inner) => self
                .eval_node(inner, env)?
                .checked_neg()
                .ok_or_else(|| fail("overflow".to_string())),
            Node::Binary(op, lhs, rhs) => {
                let a = self.eval_node(lhs, env)?;
                let b = self.eval_node(rhs, env)?;
                let result = match op {
                    BinOp::Add => a.checked_add(b),
                    BinOp::Sub => a.checked_sub(b),
                    BinOp::Mul => a.checked_mul(b),
                    BinOp::Div | BinOp::Rem if b == 0 => return Err(fail("division by zero".to_string())),
                    BinOp::Div => a.checked_div(b),
                    BinOp::Rem => a.checked_rem(b),
                };
                result.ok_or_else(|| fail("overflow".to_string()))
            }
            Node::Call(name, args) => {
                let values = args
                    .iter()
                    .map(|arg| self.eval_node(arg, env))
                    .collect::<Result<Vec<_>>>()?;
                let &[a, b] = values.as_slice() else {
                    return Err(fail(format!("{name} takes 2 arguments but {} were given", values.len())));
                };
                match name.as_str() {
                    "ceilDiv" => ceil_div(a, b).ok_or_else(|| fail("division by zero".to_string())),
                    "min" => Ok(a.min(b)),
                    "max" => Ok(a.max(b)),
                    other => Err(fail(format!("unknown function '{other}'"))),
                }
            }
            Node::List(_) => Err(fail("nested lists are not allowed".to_string())),
        }
    }
}

fn ceil_div(a: i64, b: i64) -> Option<i64> {
    let quotient = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) == (b < 0)) {
        quotient.checked_add(1)
    } else {
        Some(quotient)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn env(pairs: &[(&str, i64)]) -> Bindings {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_precedence_and_parentheses() {
        let e = env(&[("a", 2), ("b", 3), ("c", 4)]);
        assert_eq!(Expr::parse("a + b * c").unwrap().eval(&e).unwrap(), 14);
        assert_eq!(Expr::parse("(a + b) * c").unwrap().eval(&e).unwrap(), 20);
        assert_eq!(Expr::parse("-a + c % b").unwrap().eval(&e).unwrap(), -1);
    }

    #[test]
    fn test_grid_list() {
        let e = env(&[("nf", 5), ("nb", 130)]);
        let grid = Expr::parse("[nf, ceilDiv(nb, 64)]").unwrap();
        assert!(grid.is_list());
        assert_eq!(grid.eval_list(&e).unwrap(), vec![5, 3]);
        assert!(grid.eval(&e).is_err());
    }

    #[test]
    fn test_identifier_detection() {
        assert_eq!(Expr::parse(" n ").unwrap().as_identifier(), Some("n"));
        assert_eq!(Expr::parse("n + 1").unwrap().as_identifier(), None);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(Expr::parse("a +"), Err(Error::Expression { .. })));
        assert!(matches!(Expr::parse("a $ b"), Err(Error::Expression { .. })));
        assert!(matches!(Expr::parse("[a, b"), Err(Error::Expression { .. })));

        let e = env(&[("a", 1)]);
        let err = Expr::parse("a / 0").unwrap().eval(&e).unwrap_err();
        assert!(err.to_string().contains("division by zero"));
        assert!(Expr::parse("missing").unwrap().eval(&e).is_err());
        assert!(Expr::parse("pow(a, 2)").unwrap().eval(&e).is_err());
        assert!(Expr::parse("min(a)").unwrap().eval(&e).is_err());
    }

    proptest! {
        #[test]
        fn prop_arithmetic_matches_native(a in -1000i64..1000, b in -1000i64..1000, c in 1i64..1000) {
            let e = env(&[("a", a), ("b", b), ("c", c)]);
            let value = Expr::parse("a * b - (a + b) / c + max(a, b) % c").unwrap().eval(&e).unwrap();
            prop_assert_eq!(value, a * b - (a + b) / c + a.max(b) % c);
        }

        #[test]
        fn prop_ceil_div_covers_numerator(a in 0i64..1_000_000, b in 1i64..10_000) {
            let e = env(&[("a", a), ("b", b)]);
            let q = Expr::parse("ceilDiv(a, b)").unwrap().eval(&e).unwrap();
            prop_assert!(q * b >= a);
            prop_assert!((q - 1) * b < a || a == 0);
        }
    }
}
