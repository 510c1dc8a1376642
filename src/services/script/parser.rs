//! Hand-rolled lexer and recursive-descent parser for strategy scripts.

use thiserror::Error;

use super::{Expr, Script, Stmt};

/// Syntax errors with a line number for the validator's report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("line {line}: unexpected '{got}', expected {expected}")]
    Unexpected {
        line: usize,
        got: String,
        expected: &'static str,
    },

    #[error("unexpected end of script, expected {expected}")]
    UnexpectedEnd { expected: &'static str },

    #[error("line {line}: invalid number '{text}'")]
    InvalidNumber { line: usize, text: String },

    #[error("line {line}: invalid character '{ch}'")]
    InvalidChar { line: usize, ch: char },

    #[error("line {line}: duplicate binding '{name}'")]
    DuplicateBinding { line: usize, name: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Semi,
    Eq,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::LBrace => write!(f, "{{"),
            Self::RBrace => write!(f, "}}"),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::Comma => write!(f, ","),
            Self::Semi => write!(f, ";"),
            Self::Eq => write!(f, "="),
        }
    }
}

fn lex(source: &str) -> Result<Vec<(Token, usize)>, ScriptError> {
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut chars = source.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '{' => {
                tokens.push((Token::LBrace, line));
                chars.next();
            }
            '}' => {
                tokens.push((Token::RBrace, line));
                chars.next();
            }
            '(' => {
                tokens.push((Token::LParen, line));
                chars.next();
            }
            ')' => {
                tokens.push((Token::RParen, line));
                chars.next();
            }
            ',' => {
                tokens.push((Token::Comma, line));
                chars.next();
            }
            ';' => {
                tokens.push((Token::Semi, line));
                chars.next();
            }
            '=' => {
                tokens.push((Token::Eq, line));
                chars.next();
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Ident(ident), line));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' || c == '-' || c == 'e' || c == 'E' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value: f64 = text
                    .parse()
                    .map_err(|_| ScriptError::InvalidNumber {
                        line,
                        text: text.clone(),
                    })?;
                tokens.push((Token::Number(value), line));
            }
            c => return Err(ScriptError::InvalidChar { line, ch: c }),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |(_, l)| *l)
    }

    fn next(&mut self, expected: &'static str) -> Result<Token, ScriptError> {
        let token = self
            .tokens
            .get(self.pos)
            .map(|(t, _)| t.clone())
            .ok_or(ScriptError::UnexpectedEnd { expected })?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, want: &Token, expected: &'static str) -> Result<(), ScriptError> {
        let line = self.line();
        let got = self.next(expected)?;
        if &got == want {
            Ok(())
        } else {
            Err(ScriptError::Unexpected {
                line,
                got: got.to_string(),
                expected,
            })
        }
    }

    fn ident(&mut self, expected: &'static str) -> Result<String, ScriptError> {
        let line = self.line();
        match self.next(expected)? {
            Token::Ident(name) => Ok(name),
            got => Err(ScriptError::Unexpected {
                line,
                got: got.to_string(),
                expected,
            }),
        }
    }

    fn script(&mut self) -> Result<Script, ScriptError> {
        let line = self.line();
        let kw = self.ident("'strategy'")?;
        if kw != "strategy" {
            return Err(ScriptError::Unexpected {
                line,
                got: kw,
                expected: "'strategy'",
            });
        }
        let name = self.ident("strategy name")?;
        self.expect(&Token::LBrace, "'{'")?;
        let mut statements = Vec::new();
        let mut bound: Vec<String> = Vec::new();
        while self.peek() != Some(&Token::RBrace) {
            statements.push(self.statement(&mut bound)?);
        }
        self.expect(&Token::RBrace, "'}'")?;
        if self.pos != self.tokens.len() {
            return Err(ScriptError::Unexpected {
                line: self.line(),
                got: self.peek().map(ToString::to_string).unwrap_or_default(),
                expected: "end of script",
            });
        }
        Ok(Script { name, statements })
    }

    fn statement(&mut self, bound: &mut Vec<String>) -> Result<Stmt, ScriptError> {
        let line = self.line();
        let head = self.ident("'let' or 'positions'")?;
        let stmt = if head == "let" {
            let name = self.ident("binding name")?;
            if bound.iter().any(|b| *b == name) {
                return Err(ScriptError::DuplicateBinding { line, name });
            }
            bound.push(name.clone());
            self.expect(&Token::Eq, "'='")?;
            let expr = self.expr()?;
            Stmt::Let { name, expr }
        } else if head == "positions" {
            self.expect(&Token::Eq, "'='")?;
            let expr = self.expr()?;
            Stmt::Positions { expr }
        } else {
            return Err(ScriptError::Unexpected {
                line,
                got: head,
                expected: "'let' or 'positions'",
            });
        };
        self.expect(&Token::Semi, "';'")?;
        Ok(stmt)
    }

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        let line = self.line();
        match self.next("expression")? {
            Token::Number(value) => Ok(Expr::Number(value)),
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    self.call(name)
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            got => Err(ScriptError::Unexpected {
                line,
                got: got.to_string(),
                expected: "expression",
            }),
        }
    }

    fn call(&mut self, name: String) -> Result<Expr, ScriptError> {
        self.expect(&Token::LParen, "'('")?;
        let mut inputs = Vec::new();
        let mut params = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                // A named parameter is `ident = number`; anything else
                // is a positional input expression.
                if let Some(Token::Ident(_)) = self.peek() {
                    if self.tokens.get(self.pos + 1).map(|(t, _)| t) == Some(&Token::Eq) {
                        let pname = self.ident("parameter name")?;
                        self.expect(&Token::Eq, "'='")?;
                        let line = self.line();
                        match self.next("parameter value")? {
                            Token::Number(value) => params.push((pname, value)),
                            got => {
                                return Err(ScriptError::Unexpected {
                                    line,
                                    got: got.to_string(),
                                    expected: "numeric parameter value",
                                })
                            }
                        }
                    } else {
                        inputs.push(self.expr()?);
                    }
                } else {
                    inputs.push(self.expr()?);
                }
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen, "')'")?;
        Ok(Expr::Call {
            name,
            inputs,
            params,
        })
    }
}

/// Parse strategy-script text.
pub fn parse(source: &str) -> Result<Script, ScriptError> {
    let tokens = lex(source)?;
    Parser { tokens, pos: 0 }.script()
}
