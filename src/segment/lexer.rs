use crate::error::SegmentationError;

/// Position inside the source. `utf16` is what trace events speak, `byte`
/// is what Rust slicing speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub byte: usize,
    pub utf16: usize,
    pub line: u32,
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor {
            byte: 0,
            utf16: 0,
            line: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Word,
    Variable,
    Number,
    Str,
    Quoted,
    Punct,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub start: Cursor,
    pub end: Cursor,
}

impl Token<'_> {
    pub fn is_word(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct && self.text.starts_with(c)
    }
}

struct Scanner<'a> {
    src: &'a str,
    pos: Cursor,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos.byte..].chars().next()
    }

    fn peek2(&self) -> Option<char> {
        let mut chars = self.src[self.pos.byte..].chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos.byte += c.len_utf8();
        self.pos.utf16 += c.len_utf16();
        // \r\n counts once, on the \n
        if c == '\n' || (c == '\r' && self.peek() != Some('\n')) {
            self.pos.line += 1;
        }
        Some(c)
    }

    fn eat_while(&mut self, pred: impl Fn(char) -> bool) {
        while self.peek().is_some_and(&pred) {
            self.bump();
        }
    }

    /// Consumes a literal delimited by `close`, where a doubled `close` is an
    /// escaped one. The opening delimiter has to be consumed already.
    fn delimited(&mut self, close: char) -> Option<()> {
        loop {
            match self.bump()? {
                c if c == close => {
                    if self.peek() == Some(close) {
                        self.bump();
                    } else {
                        return Some(());
                    }
                }
                _ => {}
            }
        }
    }

    /// Block comments nest in T-SQL.
    fn block_comment(&mut self) -> Option<()> {
        self.bump();
        self.bump();
        let mut depth = 1usize;
        while depth > 0 {
            match (self.bump()?, self.peek()) {
                ('/', Some('*')) => {
                    self.bump();
                    depth += 1;
                }
                ('*', Some('/')) => {
                    self.bump();
                    depth -= 1;
                }
                _ => {}
            }
        }
        Some(())
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '#'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '@' | '#' | '$')
}

/// Splits T-SQL into significant tokens. Whitespace and comments are dropped.
pub(crate) fn tokenize(src: &str) -> Result<Vec<Token<'_>>, SegmentationError> {
    let mut s = Scanner {
        src,
        pos: Cursor::default(),
    };
    let mut tokens = vec![];

    while let Some(c) = s.peek() {
        let start = s.pos;
        let kind = match c {
            c if c.is_whitespace() => {
                s.bump();
                continue;
            }
            '-' if s.peek2() == Some('-') => {
                s.eat_while(|c| c != '\n' && c != '\r');
                continue;
            }
            '/' if s.peek2() == Some('*') => {
                s.block_comment()
                    .ok_or(SegmentationError::UnterminatedComment { line: start.line })?;
                continue;
            }
            '\'' => {
                s.bump();
                s.delimited('\'')
                    .ok_or(SegmentationError::UnterminatedString { line: start.line })?;
                TokenKind::Str
            }
            'N' | 'n' if s.peek2() == Some('\'') => {
                s.bump();
                s.bump();
                s.delimited('\'')
                    .ok_or(SegmentationError::UnterminatedString { line: start.line })?;
                TokenKind::Str
            }
            '[' | '"' => {
                s.bump();
                s.delimited(if c == '[' { ']' } else { '"' })
                    .ok_or(SegmentationError::UnterminatedIdentifier { line: start.line })?;
                TokenKind::Quoted
            }
            '@' => {
                s.bump();
                s.eat_while(is_ident_char);
                TokenKind::Variable
            }
            c if c.is_ascii_digit() => {
                s.eat_while(|c| c.is_ascii_alphanumeric() || c == '.');
                TokenKind::Number
            }
            c if is_ident_start(c) => {
                s.eat_while(is_ident_char);
                TokenKind::Word
            }
            _ => {
                s.bump();
                TokenKind::Punct
            }
        };
        tokens.push(Token {
            kind,
            text: &src[start.byte..s.pos.byte],
            start,
            end: s.pos,
        });
    }

    Ok(tokens)
}
