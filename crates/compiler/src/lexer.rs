//! Lexer for Flow source text.
//!
//! Consumes UTF-8 bytes and yields a token vector with source
//! locations. CRLF and LF line endings are accepted transparently.
//! `#` starts a line comment.
//!
//! Literal forms with lookahead: IPv4 (`10.0.0.1`), bracketed IPv6
//! (`[::1]`), CIDR (`10.0.0.0/8`), and regex literals (`/.../`), which
//! are only recognised in operand position so `a / b` stays a
//! division.

use flow_core::{DiagnosticReport, SourceLocation, SourcePosition};
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // keywords
    Handler,
    Var,
    If,
    Then,
    Else,
    Match,
    On,
    Import,
    From,
    And,
    Or,
    Xor,
    Not,
    In,
    True,
    False,

    Ident(String),
    Number(i64),
    String(String),
    IpAddr(IpAddr),
    Cidr(flow_core::Cidr),
    RegExp(String),
    /// `$1`, `$2`, ...: capture-group reference of the latest regex
    /// match.
    CaptureRef(i64),

    // punctuation and operators
    Assign,       // =
    Eq,           // ==
    Ne,           // !=
    Lt,           // <
    Le,           // <=
    Gt,           // >
    Ge,           // >=
    RegexMatch,   // =~
    PrefixMatch,  // =^
    SuffixMatch,  // =$
    Plus,         // +
    Minus,        // -
    Mul,          // *
    Div,          // /
    Rem,          // %
    Pow,          // **
    Shl,          // <<
    Shr,          // >>
    BitNot,       // ~
    LParen,       // (
    RParen,       // )
    LBrace,       // {
    RBrace,       // }
    LBracket,     // [
    RBracket,     // ]
    Comma,        // ,
    Semicolon,    // ;
    Colon,        // :
    DotDot,       // ..

    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier '{}'", name),
            TokenKind::Number(n) => format!("number {}", n),
            TokenKind::String(_) => "string literal".to_string(),
            TokenKind::IpAddr(ip) => format!("IP literal {}", ip),
            TokenKind::Cidr(c) => format!("CIDR literal {}", c),
            TokenKind::RegExp(_) => "regex literal".to_string(),
            TokenKind::CaptureRef(n) => format!("capture reference ${}", n),
            TokenKind::Eof => "end of file".to_string(),
            other => format!("'{}'", symbol_text(other)),
        }
    }
}

fn symbol_text(kind: &TokenKind) -> &'static str {
    match kind {
        TokenKind::Handler => "handler",
        TokenKind::Var => "var",
        TokenKind::If => "if",
        TokenKind::Then => "then",
        TokenKind::Else => "else",
        TokenKind::Match => "match",
        TokenKind::On => "on",
        TokenKind::Import => "import",
        TokenKind::From => "from",
        TokenKind::And => "and",
        TokenKind::Or => "or",
        TokenKind::Xor => "xor",
        TokenKind::Not => "not",
        TokenKind::In => "in",
        TokenKind::True => "true",
        TokenKind::False => "false",
        TokenKind::Assign => "=",
        TokenKind::Eq => "==",
        TokenKind::Ne => "!=",
        TokenKind::Lt => "<",
        TokenKind::Le => "<=",
        TokenKind::Gt => ">",
        TokenKind::Ge => ">=",
        TokenKind::RegexMatch => "=~",
        TokenKind::PrefixMatch => "=^",
        TokenKind::SuffixMatch => "=$",
        TokenKind::Plus => "+",
        TokenKind::Minus => "-",
        TokenKind::Mul => "*",
        TokenKind::Div => "/",
        TokenKind::Rem => "%",
        TokenKind::Pow => "**",
        TokenKind::Shl => "<<",
        TokenKind::Shr => ">>",
        TokenKind::BitNot => "~",
        TokenKind::LParen => "(",
        TokenKind::RParen => ")",
        TokenKind::LBrace => "{",
        TokenKind::RBrace => "}",
        TokenKind::LBracket => "[",
        TokenKind::RBracket => "]",
        TokenKind::Comma => ",",
        TokenKind::Semicolon => ";",
        TokenKind::Colon => ":",
        TokenKind::DotDot => "..",
        _ => "?",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub location: SourceLocation,
}

pub struct Lexer<'s> {
    source: &'s [u8],
    filename: String,
    pos: usize,
    line: u32,
    column: u32,
    tokens: Vec<Token>,
}

/// Tokenizes `source`, reporting token errors into `report`. Recovery
/// skips to the next whitespace and continues.
pub fn tokenize(source: &str, filename: &str, report: &mut DiagnosticReport) -> Vec<Token> {
    Lexer::new(source, filename).run(report)
}

impl<'s> Lexer<'s> {
    fn new(source: &'s str, filename: &str) -> Self {
        Lexer {
            source: source.as_bytes(),
            filename: filename.to_string(),
            pos: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
        }
    }

    fn run(mut self, report: &mut DiagnosticReport) -> Vec<Token> {
        loop {
            self.skip_whitespace_and_comments();
            if self.at_end() {
                break;
            }
            let begin = self.position();
            if let Err(message) = self.scan_token(begin) {
                let end = self.position();
                report.token_error(self.location(begin, end), message);
                self.recover();
            }
        }
        let eof = self.position();
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            location: self.location(eof, eof),
        });
        self.tokens
    }

    fn at_end(&self) -> bool {
        self.pos >= self.source.len()
    }

    fn peek(&self) -> u8 {
        self.source.get(self.pos).copied().unwrap_or(0)
    }

    fn peek_at(&self, offset: usize) -> u8 {
        self.source.get(self.pos + offset).copied().unwrap_or(0)
    }

    fn bump(&mut self) -> u8 {
        let byte = self.peek();
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        byte
    }

    fn position(&self) -> SourcePosition {
        SourcePosition::new(self.line, self.column, self.pos as u32)
    }

    fn location(&self, begin: SourcePosition, end: SourcePosition) -> SourceLocation {
        SourceLocation::new(self.filename.clone(), begin, end)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.bump();
                }
                b'#' => {
                    while !self.at_end() && self.peek() != b'\n' {
                        self.bump();
                    }
                }
                _ => return,
            }
        }
    }

    /// Error recovery: re-synchronise at the next whitespace.
    fn recover(&mut self) {
        while !self.at_end() && !self.peek().is_ascii_whitespace() {
            self.bump();
        }
    }

    fn push(&mut self, kind: TokenKind, begin: SourcePosition) {
        let end = self.position();
        let location = self.location(begin, end);
        self.tokens.push(Token { kind, location });
    }

    /// True when a `/` here starts a regex literal rather than a
    /// division: at expression starts, after operators, and after
    /// punctuation that introduces an operand.
    fn regex_allowed(&self) -> bool {
        match self.tokens.last().map(|t| &t.kind) {
            None => true,
            Some(
                TokenKind::Ident(_)
                | TokenKind::Number(_)
                | TokenKind::String(_)
                | TokenKind::IpAddr(_)
                | TokenKind::Cidr(_)
                | TokenKind::RegExp(_)
                | TokenKind::RParen
                | TokenKind::RBracket
                | TokenKind::True
                | TokenKind::False,
            ) => false,
            Some(_) => true,
        }
    }

    fn scan_token(&mut self, begin: SourcePosition) -> Result<(), String> {
        let byte = self.peek();
        match byte {
            b'"' => self.scan_string(begin),
            b'\'' => self.scan_raw_string(begin),
            b'/' if self.regex_allowed() => self.scan_regexp(begin),
            b'[' if self.looks_like_ipv6() => self.scan_ipv6(begin),
            b'0'..=b'9' => self.scan_number(begin),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                self.scan_ident(begin);
                Ok(())
            }
            _ => self.scan_symbol(begin),
        }
    }

    fn scan_ident(&mut self, begin: SourcePosition) {
        let start = self.pos;
        while matches!(self.peek(), b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'.') {
            // '.' joins qualified names like req.path, but ".." is the
            // range punctuator
            if self.peek() == b'.' && self.peek_at(1) == b'.' {
                break;
            }
            if self.peek() == b'.' && !self.peek_at(1).is_ascii_alphanumeric() && self.peek_at(1) != b'_' {
                break;
            }
            self.bump();
        }
        let text = String::from_utf8_lossy(&self.source[start..self.pos]).into_owned();
        let kind = match text.as_str() {
            "handler" => TokenKind::Handler,
            "var" => TokenKind::Var,
            "if" => TokenKind::If,
            "then" => TokenKind::Then,
            "else" => TokenKind::Else,
            "match" => TokenKind::Match,
            "on" => TokenKind::On,
            "import" => TokenKind::Import,
            "from" => TokenKind::From,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "xor" => TokenKind::Xor,
            "not" => TokenKind::Not,
            "in" => TokenKind::In,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            _ => TokenKind::Ident(text),
        };
        self.push(kind, begin);
    }

    fn scan_number(&mut self, begin: SourcePosition) -> Result<(), String> {
        // hex
        if self.peek() == b'0' && (self.peek_at(1) == b'x' || self.peek_at(1) == b'X') {
            self.bump();
            self.bump();
            let start = self.pos;
            while self.peek().is_ascii_hexdigit() {
                self.bump();
            }
            if start == self.pos {
                return Err("invalid hex literal: expected hex digits after 0x".to_string());
            }
            let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap_or("");
            let value = i64::from_str_radix(text, 16)
                .map_err(|_| format!("invalid hex literal '0x{}'", text))?;
            self.push(TokenKind::Number(value), begin);
            return Ok(());
        }

        // IPv4 (and optional /prefix) or plain decimal
        if let Some((ip, consumed)) = self.try_ipv4() {
            for _ in 0..consumed {
                self.bump();
            }
            return self.finish_ip(IpAddr::V4(ip), begin);
        }

        let start = self.pos;
        while self.peek().is_ascii_digit() {
            self.bump();
        }
        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap_or("");
        let value: i64 = text
            .parse()
            .map_err(|_| format!("numeric literal '{}' out of range", text))?;
        self.push(TokenKind::Number(value), begin);
        Ok(())
    }

    /// Attempts to read `a.b.c.d` from the current position without
    /// consuming input; returns the address and its byte length.
    fn try_ipv4(&self) -> Option<(std::net::Ipv4Addr, usize)> {
        let mut offset = 0;
        let mut octets = [0u8; 4];
        for (i, octet) in octets.iter_mut().enumerate() {
            let mut digits = 0;
            let mut value: u32 = 0;
            while self.peek_at(offset).is_ascii_digit() && digits < 3 {
                value = value * 10 + u32::from(self.peek_at(offset) - b'0');
                offset += 1;
                digits += 1;
            }
            if digits == 0 || value > 255 {
                return None;
            }
            *octet = value as u8;
            if i < 3 {
                if self.peek_at(offset) != b'.' {
                    return None;
                }
                offset += 1;
            }
        }
        // reject "1.2.3.4.5" and identifier tails
        if self.peek_at(offset) == b'.' || self.peek_at(offset).is_ascii_alphanumeric() {
            return None;
        }
        Some((
            std::net::Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]),
            offset,
        ))
    }

    fn finish_ip(&mut self, ip: IpAddr, begin: SourcePosition) -> Result<(), String> {
        if self.peek() == b'/' && self.peek_at(1).is_ascii_digit() {
            self.bump();
            let start = self.pos;
            while self.peek().is_ascii_digit() {
                self.bump();
            }
            let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap_or("");
            let prefix: u8 = text
                .parse()
                .map_err(|_| format!("invalid CIDR prefix '{}'", text))?;
            let max = match ip {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max {
                return Err(format!("CIDR prefix /{} exceeds /{}", prefix, max));
            }
            self.push(TokenKind::Cidr(flow_core::Cidr::new(ip, prefix)), begin);
        } else {
            self.push(TokenKind::IpAddr(ip), begin);
        }
        Ok(())
    }

    /// `[` opens an IPv6 literal when hex digits, `:` and `.` lead to
    /// a `]` with at least one colon in between.
    fn looks_like_ipv6(&self) -> bool {
        let mut offset = 1;
        let mut colons = 0;
        while offset < 48 {
            match self.peek_at(offset) {
                b':' => colons += 1,
                b'.' => {}
                b if b.is_ascii_hexdigit() => {}
                b']' => return colons > 0,
                _ => return false,
            }
            offset += 1;
        }
        false
    }

    fn scan_ipv6(&mut self, begin: SourcePosition) -> Result<(), String> {
        self.bump(); // [
        let start = self.pos;
        while self.peek() != b']' && !self.at_end() {
            self.bump();
        }
        let text = String::from_utf8_lossy(&self.source[start..self.pos]).into_owned();
        if self.at_end() {
            return Err("unclosed IPv6 literal".to_string());
        }
        self.bump(); // ]
        let ip: std::net::Ipv6Addr = text
            .parse()
            .map_err(|_| format!("invalid IPv6 literal '[{}]'", text))?;
        self.finish_ip(IpAddr::V6(ip), begin)
    }

    fn scan_string(&mut self, begin: SourcePosition) -> Result<(), String> {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            if self.at_end() || self.peek() == b'\n' {
                return Err("unclosed string literal".to_string());
            }
            match self.bump() {
                b'"' => break,
                b'\\' => {
                    let escape = self.bump();
                    match escape {
                        b'\\' => value.push('\\'),
                        b'"' => value.push('"'),
                        b'n' => value.push('\n'),
                        b'r' => value.push('\r'),
                        b't' => value.push('\t'),
                        b'0' => value.push('\0'),
                        b'x' => {
                            let hi = self.bump();
                            let lo = self.bump();
                            let code = hex_value(hi)
                                .zip(hex_value(lo))
                                .map(|(h, l)| h * 16 + l)
                                .ok_or_else(|| "invalid \\xHH escape".to_string())?;
                            value.push(code as u8 as char);
                        }
                        other => {
                            return Err(format!("invalid escape '\\{}'", other as char));
                        }
                    }
                }
                byte => value.push(byte as char),
            }
        }
        self.push(TokenKind::String(value), begin);
        Ok(())
    }

    /// Single-quoted raw string: no escapes.
    fn scan_raw_string(&mut self, begin: SourcePosition) -> Result<(), String> {
        self.bump();
        let start = self.pos;
        while self.peek() != b'\'' {
            if self.at_end() || self.peek() == b'\n' {
                return Err("unclosed raw string literal".to_string());
            }
            self.bump();
        }
        let value = String::from_utf8_lossy(&self.source[start..self.pos]).into_owned();
        self.bump(); // closing quote
        self.push(TokenKind::String(value), begin);
        Ok(())
    }

    fn scan_regexp(&mut self, begin: SourcePosition) -> Result<(), String> {
        self.bump(); // opening slash
        let mut pattern = String::new();
        loop {
            if self.at_end() || self.peek() == b'\n' {
                return Err("unclosed regex literal".to_string());
            }
            match self.bump() {
                b'/' => break,
                b'\\' => {
                    // keep the backslash; only "\/" unescapes
                    if self.peek() == b'/' {
                        pattern.push('/');
                        self.bump();
                    } else {
                        pattern.push('\\');
                    }
                }
                byte => pattern.push(byte as char),
            }
        }
        // flags (only 'i' is meaningful to the regex engine here)
        while self.peek().is_ascii_alphabetic() {
            let flag = self.bump();
            if flag == b'i' {
                pattern = format!("(?i){}", pattern);
            }
        }
        self.push(TokenKind::RegExp(pattern), begin);
        Ok(())
    }

    fn scan_symbol(&mut self, begin: SourcePosition) -> Result<(), String> {
        let byte = self.bump();
        let kind = match byte {
            b'=' => match self.peek() {
                b'=' => {
                    self.bump();
                    TokenKind::Eq
                }
                b'~' => {
                    self.bump();
                    TokenKind::RegexMatch
                }
                b'^' => {
                    self.bump();
                    TokenKind::PrefixMatch
                }
                b'$' => {
                    self.bump();
                    TokenKind::SuffixMatch
                }
                _ => TokenKind::Assign,
            },
            b'!' if self.peek() == b'=' => {
                self.bump();
                TokenKind::Ne
            }
            b'<' => match self.peek() {
                b'=' => {
                    self.bump();
                    TokenKind::Le
                }
                b'<' => {
                    self.bump();
                    TokenKind::Shl
                }
                _ => TokenKind::Lt,
            },
            b'>' => match self.peek() {
                b'=' => {
                    self.bump();
                    TokenKind::Ge
                }
                b'>' => {
                    self.bump();
                    TokenKind::Shr
                }
                _ => TokenKind::Gt,
            },
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => {
                if self.peek() == b'*' {
                    self.bump();
                    TokenKind::Pow
                } else {
                    TokenKind::Mul
                }
            }
            b'/' => TokenKind::Div,
            b'%' => TokenKind::Rem,
            b'~' => TokenKind::BitNot,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b',' => TokenKind::Comma,
            b';' => TokenKind::Semicolon,
            b':' => TokenKind::Colon,
            b'.' => {
                if self.peek() == b'.' {
                    self.bump();
                    TokenKind::DotDot
                } else {
                    return Err("unexpected '.'".to_string());
                }
            }
            b'$' => {
                let start = self.pos;
                while self.peek().is_ascii_digit() {
                    self.bump();
                }
                if start == self.pos {
                    return Err("expected capture group number after '$'".to_string());
                }
                let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap_or("0");
                let index: i64 = text
                    .parse()
                    .map_err(|_| format!("capture reference '${}' out of range", text))?;
                TokenKind::CaptureRef(index)
            }
            other => {
                return Err(format!("invalid byte 0x{:02x} in input", other));
            }
        };
        self.push(kind, begin);
        Ok(())
    }
}

fn hex_value(byte: u8) -> Option<u32> {
    (byte as char).to_digit(16)
}
