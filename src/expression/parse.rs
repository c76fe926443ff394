//! Hand-rolled lexer and recursive-descent parser for the expression grammar.
//!
//! The lexer works on byte offsets so spans can be mapped back onto the source for
//! error underlining, while still accepting non-ASCII unit symbols (`µs`, `°`).

use crate::error::{CompilationError, Span};
use crate::expression::ast::{Ast, AstNode, BinaryOp, UnaryOp};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number { value: f64, integer: Option<i64> },
    Identifier(String),
    /// `%` and `°` are valid unit suffixes but not identifier characters.
    UnitSymbol(char),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
struct Spanned {
    token: Token,
    span: Span,
}

fn syntax_error(message: impl Into<String>) -> CompilationError {
    CompilationError::Syntax(message.into())
}

fn lex(source: &str) -> Result<Vec<Spanned>, CompilationError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c.is_ascii_digit() || c == '.' {
            let mut end = start;
            let mut has_dot = false;
            let mut has_exp = false;
            let mut has_digits = false;
            while let Some(&(pos, d)) = chars.peek() {
                if d.is_ascii_digit() {
                    has_digits = true;
                } else if d == '.' && !has_dot && !has_exp {
                    // Only part of the number when followed by a digit or after digits
                    has_dot = true;
                } else if (d == 'e' || d == 'E') && has_digits && !has_exp {
                    // Exponent requires at least one digit after the optional sign
                    let mut ahead = chars.clone();
                    ahead.next();
                    let mut next = ahead.peek().map(|&(_, n)| n);
                    if next == Some('+') || next == Some('-') {
                        ahead.next();
                        next = ahead.peek().map(|&(_, n)| n);
                    }
                    if !next.is_some_and(|n| n.is_ascii_digit()) {
                        break;
                    }
                    has_exp = true;
                    chars.next(); // consume 'e'
                    if let Some(&(_, sign)) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            chars.next();
                        }
                    }
                    end = pos;
                    continue;
                } else {
                    break;
                }
                end = pos;
                chars.next();
            }
            let text = &source[start..=end];
            if !has_digits {
                return Err(syntax_error(format!(
                    "unexpected character '.' at offset {start}"
                )));
            }
            let value: f64 = text
                .parse()
                .map_err(|_| syntax_error(format!("invalid number \"{text}\"")))?;
            let integer = if has_dot || has_exp {
                None
            } else {
                text.parse::<i64>().ok()
            };
            tokens.push(Spanned {
                token: Token::Number { value, integer },
                span: (start, end + 1),
            });
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let mut end = start;
            while let Some(&(pos, d)) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    end = pos + d.len_utf8() - 1;
                    chars.next();
                } else if d == '.' {
                    // Dotted name segment: only when followed by an identifier start
                    let mut ahead = chars.clone();
                    ahead.next();
                    if ahead
                        .peek()
                        .is_some_and(|&(_, n)| n.is_alphabetic() || n == '_')
                    {
                        end = pos;
                        chars.next();
                    } else {
                        break;
                    }
                } else {
                    break;
                }
            }
            let name = &source[start..=end];
            tokens.push(Spanned {
                token: Token::Identifier(name.to_string()),
                span: (start, end + 1),
            });
            continue;
        }
        let (token, width) = match c {
            '%' | '°' => (Token::UnitSymbol(c), c.len_utf8()),
            '+' => (Token::Plus, 1),
            '-' => (Token::Minus, 1),
            '/' => (Token::Slash, 1),
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            ',' => (Token::Comma, 1),
            '*' => {
                chars.next();
                if chars.peek().is_some_and(|&(_, n)| n == '*') {
                    chars.next();
                    tokens.push(Spanned {
                        token: Token::DoubleStar,
                        span: (start, start + 2),
                    });
                } else {
                    tokens.push(Spanned {
                        token: Token::Star,
                        span: (start, start + 1),
                    });
                }
                continue;
            }
            other => {
                return Err(syntax_error(format!(
                    "unexpected character '{other}' at offset {start}"
                )))
            }
        };
        chars.next();
        tokens.push(Spanned {
            token,
            span: (start, start + width),
        });
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<Spanned, CompilationError> {
        match self.next() {
            Some(spanned) if spanned.token == token => Ok(spanned),
            Some(spanned) => Err(syntax_error(format!(
                "expected {what} at offset {}",
                spanned.span.0
            ))),
            None => Err(syntax_error(format!("expected {what} at end of input"))),
        }
    }

    fn expression(&mut self) -> Result<Ast, CompilationError> {
        self.additive()
    }

    fn additive(&mut self) -> Result<Ast, CompilationError> {
        let mut lhs = self.multiplicative()?;
        while let Some(spanned) = self.peek() {
            let op = match spanned.token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.next();
            let rhs = self.multiplicative()?;
            let span = (lhs.span.0, rhs.span.1);
            lhs = Ast {
                node: AstNode::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            };
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Ast, CompilationError> {
        let mut lhs = self.power()?;
        while let Some(spanned) = self.peek() {
            let op = match spanned.token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => break,
            };
            self.next();
            let rhs = self.power()?;
            let span = (lhs.span.0, rhs.span.1);
            lhs = Ast {
                node: AstNode::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            };
        }
        Ok(lhs)
    }

    fn power(&mut self) -> Result<Ast, CompilationError> {
        let base = self.unary()?;
        if self.peek().is_some_and(|s| s.token == Token::DoubleStar) {
            self.next();
            let exponent = self.unary()?;
            let span = (base.span.0, exponent.span.1);
            return Ok(Ast {
                node: AstNode::Binary {
                    op: BinaryOp::Pow,
                    lhs: Box::new(base),
                    rhs: Box::new(exponent),
                },
                span,
            });
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Ast, CompilationError> {
        if let Some(spanned) = self.peek() {
            let op = match spanned.token {
                Token::Plus => Some(UnaryOp::Plus),
                Token::Minus => Some(UnaryOp::Neg),
                _ => None,
            };
            if let Some(op) = op {
                let start = spanned.span.0;
                self.next();
                let operand = self.primary()?;
                let span = (start, operand.span.1);
                return Ok(Ast {
                    node: AstNode::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                    span,
                });
            }
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Ast, CompilationError> {
        let spanned = self
            .next()
            .ok_or_else(|| syntax_error("unexpected end of input"))?;
        match spanned.token {
            Token::Number { value, integer } => {
                // An identifier or unit symbol right after a number is its unit
                if let Some(next) = self.peek().cloned() {
                    let unit = match &next.token {
                        Token::Identifier(name) => Some(name.clone()),
                        Token::UnitSymbol(symbol) => Some(symbol.to_string()),
                        _ => None,
                    };
                    if let Some(unit) = unit {
                        self.next();
                        return Ok(Ast {
                            node: AstNode::Quantity {
                                magnitude: value,
                                unit,
                            },
                            span: (spanned.span.0, next.span.1),
                        });
                    }
                }
                let node = match integer {
                    Some(int) => AstNode::Integer(int),
                    None => AstNode::Float(value),
                };
                Ok(Ast {
                    node,
                    span: spanned.span,
                })
            }
            Token::Identifier(name) => {
                if self.peek().is_some_and(|s| s.token == Token::LParen) {
                    self.next();
                    let mut args = Vec::new();
                    if self.peek().is_some_and(|s| s.token != Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            match self.peek().map(|s| s.token.clone()) {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                    }
                    let close = self.expect(Token::RParen, "')'")?;
                    return Ok(Ast {
                        node: AstNode::Call {
                            function: name,
                            args,
                        },
                        span: (spanned.span.0, close.span.1),
                    });
                }
                Ok(Ast {
                    node: AstNode::Identifier(name),
                    span: spanned.span,
                })
            }
            Token::LParen => {
                let inner = self.expression()?;
                let close = self.expect(Token::RParen, "')'")?;
                Ok(Ast {
                    node: inner.node,
                    span: (spanned.span.0, close.span.1),
                })
            }
            other => Err(syntax_error(format!(
                "unexpected token {other:?} at offset {}",
                spanned.span.0
            ))),
        }
    }
}

/// Parses a full expression source string.
pub fn parse(source: &str) -> Result<Ast, CompilationError> {
    let tokens = lex(source)?;
    if tokens.is_empty() {
        return Err(syntax_error("empty expression"));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.expression()?;
    if let Some(extra) = parser.peek() {
        return Err(syntax_error(format!(
            "unexpected trailing input at offset {}",
            extra.span.0
        )));
    }
    Ok(ast)
}
