use std::{
    collections::{BTreeMap, VecDeque},
    str::Chars,
};

use itertools::{PeekNth, peek_nth};
use once_cell::sync::Lazy;
use strum::EnumString;

use crate::frontend::SourceFile;

#[derive(Debug)]
pub struct Lexer<'source> {
    source: &'source SourceFile,
    position: usize,
    line_number: usize,
    chars: PeekNth<Chars<'source>>,
    peek_buffer: VecDeque<Token>,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /* Words */
    Keyword(Keyword), // int
    Identifier,       // main

    /* Literals */
    IntegerLiteral, // 42

    /* Delimiters */
    OpenParen,  // (
    CloseParen, // )
    OpenBrace,  // {
    CloseBrace, // }
    Semicolon,  // ;
    Comma,      // ,

    /* Unary + Binary Ops */
    Minus, // -

    /* Binary Ops */
    Plus,                 // +
    Asterisk,             // *
    Divide,               // /
    Modulus,              // %
    DoubleEquals,         // ==
    NotEquals,            // !=
    LessThan,             // <
    LessThanOrEqualTo,    // <=
    GreaterThan,          // >
    GreaterThanOrEqualTo, // >=

    /* Assignment */
    Equals, // =
}

impl TokenKind {
    pub fn is_comparison_operator(&self) -> bool {
        matches!(
            self,
            Self::DoubleEquals
                | Self::NotEquals
                | Self::LessThan
                | Self::LessThanOrEqualTo
                | Self::GreaterThan
                | Self::GreaterThanOrEqualTo
        )
    }

    pub fn is_term_operator(&self) -> bool {
        matches!(self, Self::Plus | Self::Minus)
    }

    pub fn is_factor_operator(&self) -> bool {
        matches!(self, Self::Asterisk | Self::Divide | Self::Modulus)
    }

    pub fn is_type_specifier(&self) -> bool {
        matches!(
            self,
            Self::Keyword(Keyword::Char | Keyword::Short | Keyword::Int | Keyword::Long)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Keyword {
    Char,
    Short,
    Int,
    Long,
    Return,
    If,
    Else,
    While,
}

/// Table of single char tokens (matched after longer sequences are checked for)
static SINGLE_TOKENS: Lazy<BTreeMap<char, TokenKind>> = Lazy::new(|| {
    BTreeMap::from([
        ('(', TokenKind::OpenParen),
        (')', TokenKind::CloseParen),
        ('{', TokenKind::OpenBrace),
        ('}', TokenKind::CloseBrace),
        (';', TokenKind::Semicolon),
        (',', TokenKind::Comma),
        ('-', TokenKind::Minus),
        ('+', TokenKind::Plus),
        ('*', TokenKind::Asterisk),
        ('/', TokenKind::Divide),
        ('%', TokenKind::Modulus),
        ('=', TokenKind::Equals),
        ('<', TokenKind::LessThan),
        ('>', TokenKind::GreaterThan),
    ])
});

#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source SourceFile) -> Self {
        Self {
            source,
            chars: peek_nth(source.contents.chars()),
            position: 0,
            line_number: 0,
            peek_buffer: VecDeque::new(),
        }
    }

    pub fn source(&self) -> &SourceFile {
        self.source
    }

    fn report_fatal_error(&self, message: &str) -> ! {
        eprintln!(
            "Fatal error reported in Lexer ({}:{}:{}):",
            self.source.origin,
            self.line_number + 1,
            self.source.column_for_position(self.position)
        );
        eprintln!("{message}");
        std::process::exit(1);
    }

    fn ignore_whitespace(&mut self) {
        while let Some(c) = self.chars.peek().copied() {
            if !c.is_ascii_whitespace() {
                break;
            }

            if c == '\n' {
                self.line_number += 1;
            }

            self.chars.next();
            self.position += 1;
        }
    }

    fn ignore_line(&mut self) {
        while let Some(c) = self.chars.peek().copied() {
            if c == '\n' {
                break;
            }

            self.chars.next();
            self.position += 1;
        }
    }

    fn ignore_block_comment(&mut self) {
        // Consume the opening "/*"
        self.chars.next();
        self.chars.next();
        self.position += 2;

        loop {
            let Some(c) = self.chars.peek().copied() else {
                self.report_fatal_error("Reached end of file while reading block comment");
            };

            if c == '\n' {
                self.line_number += 1;
            }

            if c == '*' && self.chars.peek_nth(1) == Some(&'/') {
                self.chars.next();
                self.chars.next();
                self.position += 2;
                return;
            }

            self.chars.next();
            self.position += 1;
        }
    }

    // Keyword or identifier
    fn read_word(&mut self) -> Token {
        let start_position = self.position;

        while let Some(c) = self.chars.peek().copied() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }

            self.chars.next();
            self.position += 1;
        }

        let span = self.new_span(start_position);
        let value = self.source.value_of_span(span);

        let kind = if let Ok(keyword) = value.parse() {
            TokenKind::Keyword(keyword)
        } else {
            TokenKind::Identifier
        };

        Token { kind, span }
    }

    fn read_number(&mut self) -> Token {
        let start_position = self.position;

        while let Some(c) = self.chars.peek().copied() {
            if !c.is_ascii_digit() {
                break;
            }

            self.chars.next();
            self.position += 1;
        }

        Token {
            kind: TokenKind::IntegerLiteral,
            span: self.new_span(start_position),
        }
    }

    fn read_single(&mut self, kind: TokenKind) -> Token {
        let start_position = self.position;

        self.chars.next();
        self.position += 1;

        Token {
            kind,
            span: self.new_span(start_position),
        }
    }

    fn read_double(&mut self, kind: TokenKind) -> Token {
        let start_position = self.position;

        self.chars.next();
        self.chars.next();

        self.position += 2;

        Token {
            kind,
            span: self.new_span(start_position),
        }
    }

    fn new_span(&self, start: usize) -> Span {
        Span {
            start,
            end: self.position,
        }
    }

    pub fn peek(&mut self) -> Option<Token> {
        self.peek_nth(0)
    }

    pub fn peek_nth(&mut self, n: usize) -> Option<Token> {
        while self.peek_buffer.len() <= n {
            let token = self.read_token()?;
            self.peek_buffer.push_back(token);
        }

        self.peek_buffer.get(n).cloned()
    }

    pub fn next(&mut self) -> Option<Token> {
        if let Some(token) = self.peek_buffer.pop_front() {
            return Some(token);
        }

        self.read_token()
    }

    fn read_token(&mut self) -> Option<Token> {
        loop {
            self.ignore_whitespace();

            let first = self.chars.peek().copied();
            match (first, self.chars.peek_nth(1).copied()) {
                (Some('/'), Some('/')) => self.ignore_line(),
                (Some('/'), Some('*')) => self.ignore_block_comment(),
                _ => break,
            }
        }

        let c = self.chars.peek().copied()?;

        let token = match c {
            c if c.is_ascii_alphabetic() || c == '_' => self.read_word(),
            c if c.is_ascii_digit() => self.read_number(),
            '=' if self.chars.peek_nth(1) == Some(&'=') => {
                self.read_double(TokenKind::DoubleEquals)
            }
            '!' if self.chars.peek_nth(1) == Some(&'=') => self.read_double(TokenKind::NotEquals),
            '<' if self.chars.peek_nth(1) == Some(&'=') => {
                self.read_double(TokenKind::LessThanOrEqualTo)
            }
            '>' if self.chars.peek_nth(1) == Some(&'=') => {
                self.read_double(TokenKind::GreaterThanOrEqualTo)
            }
            c => match SINGLE_TOKENS.get(&c) {
                Some(kind) => self.read_single(*kind),
                None => self.report_fatal_error(&format!("Unexpected character: {c:?}")),
            },
        };

        Some(token)
    }
}
