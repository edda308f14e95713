//! Hand-written lexer. Out of scope per the spec beyond "produces an AST
//! we can resolve and compile" — no attempt at great error recovery here.

#[derive(Clone, Debug, PartialEq)]
pub enum Tok {
    Ident(String),
    Int(i32),
    Float(f32),
    Str(String),
    True,
    False,
    Nil,
    This,
    DollarDollar,
    Positional(u32),
    Discard,
    If,
    Else,
    While,
    For,
    In,
    Break,
    Continue,
    Return,
    Yield,
    And,
    Or,

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    ObjOpen, // `[=`
    Comma,
    Semi,
    Colon,
    DoubleColon,
    Arrow, // `->`
    Assign,
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Tilde,
    Bang,
    PushBack, // `<<`
    Dot,
    Eof,
}

#[derive(Clone, Debug)]
pub struct Token {
    pub tok: Tok,
    pub line: i32,
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: i32,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.bump();
                }
                Some(b'#') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token, String> {
        self.skip_trivia();
        let line = self.line;
        let Some(c) = self.peek() else {
            return Ok(Token { tok: Tok::Eof, line });
        };
        let tok = match c {
            b'(' => {
                self.bump();
                Tok::LParen
            }
            b')' => {
                self.bump();
                Tok::RParen
            }
            b'{' => {
                self.bump();
                Tok::LBrace
            }
            b'}' => {
                self.bump();
                Tok::RBrace
            }
            b'[' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    Tok::ObjOpen
                } else {
                    Tok::LBracket
                }
            }
            b']' => {
                self.bump();
                Tok::RBracket
            }
            b',' => {
                self.bump();
                Tok::Comma
            }
            b';' => {
                self.bump();
                Tok::Semi
            }
            b'.' => {
                self.bump();
                Tok::Dot
            }
            b':' => {
                self.bump();
                if self.peek() == Some(b':') {
                    self.bump();
                    Tok::DoubleColon
                } else {
                    Tok::Colon
                }
            }
            b'=' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    Tok::Eq
                } else {
                    Tok::Assign
                }
            }
            b'!' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    Tok::NotEq
                } else {
                    Tok::Bang
                }
            }
            b'<' => {
                self.bump();
                match self.peek() {
                    Some(b'=') => {
                        self.bump();
                        Tok::LtEq
                    }
                    Some(b'<') => {
                        self.bump();
                        Tok::PushBack
                    }
                    _ => Tok::Lt,
                }
            }
            b'>' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    Tok::GtEq
                } else {
                    Tok::Gt
                }
            }
            b'+' => {
                self.bump();
                Tok::Plus
            }
            b'-' => {
                self.bump();
                if self.peek() == Some(b'>') {
                    self.bump();
                    Tok::Arrow
                } else {
                    Tok::Minus
                }
            }
            b'*' => {
                self.bump();
                Tok::Star
            }
            b'/' => {
                self.bump();
                Tok::Slash
            }
            b'%' => {
                self.bump();
                Tok::Percent
            }
            b'^' => {
                self.bump();
                Tok::Caret
            }
            b'~' => {
                self.bump();
                Tok::Tilde
            }
            b'$' => {
                self.bump();
                if self.peek() == Some(b'$') {
                    self.bump();
                    Tok::DollarDollar
                } else {
                    let start = self.pos;
                    while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                        self.bump();
                    }
                    let s = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
                    Tok::Positional(s.parse().map_err(|_| "malformed positional parameter".to_string())?)
                }
            }
            b'"' => self.lex_string()?,
            c if c.is_ascii_digit() => self.lex_number(),
            c if c == b'_' || c.is_ascii_alphabetic() => self.lex_ident(),
            other => return Err(format!("unexpected byte 0x{other:02x} at line {line}")),
        };
        Ok(Token { tok, line })
    }

    fn lex_string(&mut self) -> Result<Tok, String> {
        self.bump(); // opening quote
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return Err("unterminated string literal".to_string()),
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'n') => s.push('\n'),
                    Some(b't') => s.push('\t'),
                    Some(b'"') => s.push('"'),
                    Some(b'\\') => s.push('\\'),
                    Some(other) => s.push(other as char),
                    None => return Err("unterminated escape sequence".to_string()),
                },
                Some(c) => s.push(c as char),
            }
        }
        Ok(Tok::Str(s))
    }

    fn lex_number(&mut self) -> Tok {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') && self.peek2().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        if is_float {
            Tok::Float(text.parse().unwrap_or(0.0))
        } else {
            Tok::Int(text.parse().unwrap_or(0))
        }
    }

    fn lex_ident(&mut self) -> Tok {
        let start = self.pos;
        while self.peek().is_some_and(|c| c == b'_' || c.is_ascii_alphanumeric()) {
            self.bump();
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        match text {
            "true" => Tok::True,
            "false" => Tok::False,
            "nil" => Tok::Nil,
            "this" => Tok::This,
            "_" => Tok::Discard,
            "if" => Tok::If,
            "else" => Tok::Else,
            "while" => Tok::While,
            "for" => Tok::For,
            "in" => Tok::In,
            "break" => Tok::Break,
            "continue" => Tok::Continue,
            "return" => Tok::Return,
            "yield" => Tok::Yield,
            "and" => Tok::And,
            "or" => Tok::Or,
            other => Tok::Ident(other.to_string()),
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, String> {
        let mut out = Vec::new();
        loop {
            let tok = self.next_token()?;
            let is_eof = tok.tok == Tok::Eof;
            out.push(tok);
            if is_eof {
                break;
            }
        }
        Ok(out)
    }
}
