//! Lossless lexer for PHP-shaped source files.
//!
//! The structural scanner and the compositor only ever look at token kinds and
//! token text; everything else about the host language is opaque. The one hard
//! invariant here is losslessness: concatenating the `text` of every token
//! reproduces the input byte-for-byte, because merged output is serialized by
//! plain token concatenation.
//!
//! Bare punctuation characters that a typical PHP lexer hands back as naked
//! strings are normalized into [`TokenKind::Punctuation`] so downstream stages
//! never have to branch on token shape. The `{$` interpolation opener inside
//! double-quoted strings gets its own [`TokenKind::CurlyOpen`] marker; its
//! closing `}` is an ordinary punctuation token that the scanner skips via a
//! one-shot flag.

/// Smallest lexical unit: kind, literal text, and the line it starts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Keyword,
    Identifier,
    /// A `$name` variable.
    Variable,
    Punctuation,
    StringLiteral,
    /// The `{` that opens a `{$...}` interpolation inside a double-quoted string.
    CurlyOpen,
    Comment,
    Whitespace,
    /// Inline HTML, open/close tags, numbers - anything the scanner ignores.
    Other,
}

impl Token {
    /// Keyword comparison, case-insensitive the way the host language is.
    pub fn is_keyword(&self, word: &str) -> bool {
        self.kind == TokenKind::Keyword && self.text.eq_ignore_ascii_case(word)
    }

    pub fn is_punct(&self, ch: char) -> bool {
        self.kind == TokenKind::Punctuation && self.text.len() == 1 && self.text.starts_with(ch)
    }
}

/// Reserved words the lexer classifies as [`TokenKind::Keyword`].
///
/// Only `class`, `function` and the visibility modifiers matter structurally;
/// the rest are classified for completeness and never inspected downstream.
const KEYWORDS: &[&str] = &[
    "abstract",
    "array",
    "as",
    "break",
    "case",
    "catch",
    "class",
    "clone",
    "const",
    "continue",
    "declare",
    "default",
    "do",
    "echo",
    "else",
    "elseif",
    "extends",
    "final",
    "finally",
    "for",
    "foreach",
    "function",
    "global",
    "if",
    "implements",
    "include",
    "include_once",
    "instanceof",
    "interface",
    "isset",
    "list",
    "namespace",
    "new",
    "print",
    "private",
    "protected",
    "public",
    "require",
    "require_once",
    "return",
    "static",
    "switch",
    "throw",
    "trait",
    "try",
    "unset",
    "use",
    "var",
    "while",
];

/// Multi-character operators, longest first so prefixes never shadow them.
const OPERATORS: &[&str] = &[
    "<=>", "===", "!==", "**=", "...", "??=", "<<=", ">>=", "?->", "->", "=>", "::", "==", "!=",
    "<>", "<=", ">=", "&&", "||", "++", "--", "+=", "-=", "*=", "/=", ".=", "%=", "&=", "|=",
    "^=", "??", "**", "<<", ">>",
];

/// Tokenize `source`. Total: malformed input (unterminated strings, stray
/// bytes) still lexes, it just produces less precise token kinds.
pub fn lex(source: &str) -> Vec<Token> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            tokens: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<Token> {
        while self.pos < self.src.len() {
            self.lex_inline_html();
            while self.pos < self.src.len() {
                if self.starts_with("?>") {
                    let (start, line) = (self.pos, self.line);
                    self.bump_n(2);
                    self.emit(TokenKind::Other, start, line);
                    break;
                }
                self.lex_php_token();
            }
        }
        self.tokens
    }

    // -- low-level cursor -------------------------------------------------

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.as_bytes().get(self.pos + offset).copied()
    }

    // Byte-based: the cursor may sit mid-character while scanning strings
    // or inline HTML, where a &str slice would panic.
    fn starts_with(&self, prefix: &str) -> bool {
        self.src.as_bytes()[self.pos..].starts_with(prefix.as_bytes())
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        if byte == b'\n' {
            self.line += 1;
        }
        self.pos += 1;
        Some(byte)
    }

    fn bump_n(&mut self, n: usize) {
        for _ in 0..n {
            self.bump();
        }
    }

    fn emit(&mut self, kind: TokenKind, start: usize, line: u32) {
        self.tokens.push(Token {
            kind,
            text: self.src[start..self.pos].to_string(),
            line,
        });
    }

    // -- modes ------------------------------------------------------------

    /// Consume inline HTML up to the next open tag, then the open tag itself.
    fn lex_inline_html(&mut self) {
        let (start, line) = (self.pos, self.line);
        while self.pos < self.src.len() && !self.starts_with("<?") {
            self.bump();
        }
        if self.pos > start {
            self.emit(TokenKind::Other, start, line);
        }
        if self.pos < self.src.len() {
            let (start, line) = (self.pos, self.line);
            if self.starts_with("<?php") {
                self.bump_n(5);
            } else if self.starts_with("<?=") {
                self.bump_n(3);
            } else {
                self.bump_n(2);
            }
            self.emit(TokenKind::Other, start, line);
        }
    }

    /// Lex exactly one token in PHP mode. Always consumes at least one byte.
    fn lex_php_token(&mut self) {
        let (start, line) = (self.pos, self.line);
        let byte = match self.peek() {
            Some(byte) => byte,
            None => return,
        };

        if byte.is_ascii_whitespace() {
            while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
                self.bump();
            }
            self.emit(TokenKind::Whitespace, start, line);
        } else if self.starts_with("//") || byte == b'#' {
            while self.peek().is_some_and(|b| b != b'\n') {
                self.bump();
            }
            self.emit(TokenKind::Comment, start, line);
        } else if self.starts_with("/*") {
            self.bump_n(2);
            while self.pos < self.src.len() && !self.starts_with("*/") {
                self.bump();
            }
            self.bump_n(2);
            self.emit(TokenKind::Comment, start, line);
        } else if byte == b'\'' {
            self.lex_single_quoted();
        } else if byte == b'"' {
            self.lex_double_quoted();
        } else if self.starts_with("<<<") {
            self.lex_heredoc();
        } else if byte == b'$' && self.peek_at(1).is_some_and(is_ident_start) {
            self.bump();
            while self.peek().is_some_and(is_ident_continue) {
                self.bump();
            }
            self.emit(TokenKind::Variable, start, line);
        } else if is_ident_start(byte) {
            while self.peek().is_some_and(is_ident_continue) {
                self.bump();
            }
            let lower = self.src[start..self.pos].to_ascii_lowercase();
            let kind = if KEYWORDS.contains(&lower.as_str()) {
                TokenKind::Keyword
            } else {
                TokenKind::Identifier
            };
            self.emit(kind, start, line);
        } else if byte.is_ascii_digit() {
            self.lex_number();
        } else {
            for op in OPERATORS {
                if self.starts_with(op) {
                    self.bump_n(op.len());
                    self.emit(TokenKind::Punctuation, start, line);
                    return;
                }
            }
            self.bump();
            self.emit(TokenKind::Punctuation, start, line);
        }
    }

    fn lex_single_quoted(&mut self) {
        let (start, line) = (self.pos, self.line);
        self.bump();
        loop {
            match self.peek() {
                None => break,
                Some(b'\\') => {
                    self.bump();
                    self.bump();
                }
                Some(b'\'') => {
                    self.bump();
                    break;
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
        self.emit(TokenKind::StringLiteral, start, line);
    }

    /// Double-quoted strings split around `{$...}` interpolations: the string
    /// segments stay [`TokenKind::StringLiteral`], the opener becomes a
    /// [`TokenKind::CurlyOpen`] marker and the interior is lexed as code.
    fn lex_double_quoted(&mut self) {
        let mut start = self.pos;
        let mut line = self.line;
        self.bump();
        loop {
            match self.peek() {
                None => {
                    if self.pos > start {
                        self.emit(TokenKind::StringLiteral, start, line);
                    }
                    return;
                }
                Some(b'\\') => {
                    self.bump();
                    self.bump();
                }
                Some(b'"') => {
                    self.bump();
                    self.emit(TokenKind::StringLiteral, start, line);
                    return;
                }
                Some(b'{') if self.peek_at(1) == Some(b'$') => {
                    if self.pos > start {
                        self.emit(TokenKind::StringLiteral, start, line);
                    }
                    let brace_line = self.line;
                    self.bump();
                    self.tokens.push(Token {
                        kind: TokenKind::CurlyOpen,
                        text: "{".to_string(),
                        line: brace_line,
                    });
                    self.lex_interpolation();
                    start = self.pos;
                    line = self.line;
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    /// Lex the code interior of a `{$...}` interpolation through its closing
    /// brace, which is emitted as an ordinary punctuation token.
    fn lex_interpolation(&mut self) {
        let mut depth = 0usize;
        while let Some(byte) = self.peek() {
            if byte == b'}' && depth == 0 {
                let line = self.line;
                self.bump();
                self.tokens.push(Token {
                    kind: TokenKind::Punctuation,
                    text: "}".to_string(),
                    line,
                });
                return;
            }
            let before = self.tokens.len();
            self.lex_php_token();
            for token in &self.tokens[before..] {
                if token.kind == TokenKind::Punctuation {
                    match token.text.as_str() {
                        "{" => depth += 1,
                        "}" => depth = depth.saturating_sub(1),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Heredoc and nowdoc bodies are one opaque string literal. The closing
    /// label is matched at line start, allowing leading indentation.
    fn lex_heredoc(&mut self) {
        let (start, line) = (self.pos, self.line);
        self.bump_n(3);
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.bump();
        }
        let quote = match self.peek() {
            Some(q @ (b'"' | b'\'')) => {
                self.bump();
                Some(q)
            }
            _ => None,
        };
        let label_start = self.pos;
        while self.peek().is_some_and(is_ident_continue) {
            self.bump();
        }
        let label = self.src[label_start..self.pos].to_string();
        if quote.is_some() {
            self.bump();
        }
        if label.is_empty() {
            self.emit(TokenKind::Other, start, line);
            return;
        }
        loop {
            loop {
                match self.bump() {
                    None => {
                        self.emit(TokenKind::StringLiteral, start, line);
                        return;
                    }
                    Some(b'\n') => break,
                    Some(_) => {}
                }
            }
            let mut probe = self.pos;
            while matches!(self.src.as_bytes().get(probe), Some(b' ') | Some(b'\t')) {
                probe += 1;
            }
            if self.src.as_bytes()[probe..].starts_with(label.as_bytes()) {
                let after = probe + label.len();
                let terminated = match self.src.as_bytes().get(after) {
                    None => true,
                    Some(&b) => !is_ident_continue(b),
                };
                if terminated {
                    self.bump_n(after - self.pos);
                    self.emit(TokenKind::StringLiteral, start, line);
                    return;
                }
            }
        }
    }

    fn lex_number(&mut self) {
        let (start, line) = (self.pos, self.line);
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.bump();
        }
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            self.bump();
            while self
                .peek()
                .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
            {
                self.bump();
            }
        }
        self.emit(TokenKind::Other, start, line);
    }
}

fn is_ident_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_' || byte >= 0x80
}

fn is_ident_continue(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte >= 0x80
}
