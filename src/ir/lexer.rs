use std::ops::Range;

use crate::diagnostic::Diagnostic;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Tok {
    /// Keywords, type names, labels.
    Word(String),
    /// `%name`
    Local(String),
    /// `@name`
    Global(String),
    /// `!name`
    Meta(String),
    Int(i64),
    /// `0x...` raw bit pattern.
    Hex(u64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Equals,
    Colon,
    Eof,
}

impl Tok {
    pub(crate) fn describe(&self) -> String {
        match self {
            Tok::Word(w) => format!("'{}'", w),
            Tok::Local(n) => format!("'%{}'", n),
            Tok::Global(n) => format!("'@{}'", n),
            Tok::Meta(n) => format!("'!{}'", n),
            Tok::Int(v) => format!("integer {}", v),
            Tok::Hex(v) => format!("0x{:X}", v),
            Tok::Str(_) => "string literal".to_string(),
            Tok::LParen => "'('".to_string(),
            Tok::RParen => "')'".to_string(),
            Tok::LBracket => "'['".to_string(),
            Tok::RBracket => "']'".to_string(),
            Tok::LBrace => "'{'".to_string(),
            Tok::RBrace => "'}'".to_string(),
            Tok::Comma => "','".to_string(),
            Tok::Equals => "'='".to_string(),
            Tok::Colon => "':'".to_string(),
            Tok::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Token {
    pub tok: Tok,
    pub span: Range<usize>,
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'_' | b'.' | b'$' | b'-')
}

pub(crate) struct Lexer<'src> {
    source: &'src [u8],
    pos: usize,
}

impl<'src> Lexer<'src> {
    pub(crate) fn new(source: &'src str) -> Self {
        Self {
            source: source.as_bytes(),
            pos: 0,
        }
    }

    pub(crate) fn tokenize(mut self) -> Result<Vec<Token>, Diagnostic> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let is_eof = tok.tok == Tok::Eof;
            tokens.push(tok);
            if is_eof {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                self.pos += 1;
            } else if c == b';' {
                while let Some(c) = self.peek() {
                    if c == b'\n' {
                        break;
                    }
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    fn read_name(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(is_name_char) {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.source[start..self.pos]).into_owned()
    }

    fn next_token(&mut self) -> Result<Token, Diagnostic> {
        self.skip_whitespace_and_comments();
        let start = self.pos;
        let Some(c) = self.peek() else {
            return Ok(Token {
                tok: Tok::Eof,
                span: start..start,
            });
        };

        let single = |t: Tok| Some(t);
        let punct = match c {
            b'(' => single(Tok::LParen),
            b')' => single(Tok::RParen),
            b'[' => single(Tok::LBracket),
            b']' => single(Tok::RBracket),
            b'{' => single(Tok::LBrace),
            b'}' => single(Tok::RBrace),
            b',' => single(Tok::Comma),
            b'=' => single(Tok::Equals),
            b':' => single(Tok::Colon),
            _ => None,
        };
        if let Some(tok) = punct {
            self.pos += 1;
            return Ok(Token {
                tok,
                span: start..self.pos,
            });
        }

        let tok = match c {
            b'%' | b'@' | b'!' => {
                self.pos += 1;
                let name = self.read_name();
                if name.is_empty() {
                    return Err(Diagnostic::error(
                        format!("expected a name after '{}'", c as char),
                        start..self.pos,
                    ));
                }
                match c {
                    b'%' => Tok::Local(name),
                    b'@' => Tok::Global(name),
                    _ => Tok::Meta(name),
                }
            }
            b'"' => self.read_string(start)?,
            b'0' if self.source.get(self.pos + 1) == Some(&b'x') => {
                self.pos += 2;
                let digits = self.read_name();
                let bits = u64::from_str_radix(&digits, 16).map_err(|_| {
                    Diagnostic::error(format!("invalid hex literal '0x{}'", digits), start..self.pos)
                })?;
                Tok::Hex(bits)
            }
            b'-' | b'0'..=b'9' => {
                self.pos += 1;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let text = String::from_utf8_lossy(&self.source[start..self.pos]).into_owned();
                let v = text.parse::<i64>().map_err(|_| {
                    Diagnostic::error(format!("invalid integer '{}'", text), start..self.pos)
                })?;
                Tok::Int(v)
            }
            c if c.is_ascii_alphabetic() || c == b'_' || c == b'.' || c == b'$' => {
                Tok::Word(self.read_name())
            }
            other => {
                return Err(Diagnostic::error(
                    format!("unexpected character '{}'", other as char),
                    start..start + 1,
                ))
            }
        };
        Ok(Token {
            tok,
            span: start..self.pos,
        })
    }

    fn read_string(&mut self, start: usize) -> Result<Tok, Diagnostic> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(Diagnostic::error(
                        "unterminated string literal".to_string(),
                        start..self.pos,
                    ))
                }
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    let escaped = self.source.get(self.pos + 1).copied();
                    match escaped {
                        Some(b'n') => out.push(b'\n'),
                        Some(b'"') => out.push(b'"'),
                        Some(b'\\') => out.push(b'\\'),
                        _ => {
                            return Err(Diagnostic::error(
                                "invalid escape in string literal".to_string(),
                                self.pos..self.pos + 2,
                            ))
                        }
                    }
                    self.pos += 2;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        Ok(Tok::Str(String::from_utf8_lossy(&out).into_owned()))
    }
}
