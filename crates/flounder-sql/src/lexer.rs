//! Byte-level SQL lexer.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // literals
    IntegerConstant,
    DecimalConstant,
    StringConstant,
    Identifier,
    // punctuation
    Comma,
    LeftParen,
    RightParen,
    Star,
    Plus,
    Minus,
    Slash,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Neq,
    Semicolon,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

/// SQL lexer producing a token stream; keywords stay `Identifier` tokens and
/// are matched case-insensitively by the parser.
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
        }
    }

    pub fn tokenize(source: &'a str) -> Vec<Token> {
        let mut lexer = Self::new(source);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token();
            let is_eof = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        tokens
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, n: usize) -> Option<u8> {
        self.src.get(self.pos + n).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                self.advance();
            } else if c == b'-' && self.peek_at(1) == Some(b'-') {
                // line comment
                while let Some(c) = self.peek() {
                    self.advance();
                    if c == b'\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn token(kind: TokenKind, text: impl Into<String>) -> Token {
        Token {
            kind,
            text: text.into(),
        }
    }

    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();
        let Some(c) = self.peek() else {
            return Self::token(TokenKind::Eof, "");
        };

        match c {
            b'\'' => self.lex_string(),
            b'0'..=b'9' => self.lex_number(),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_identifier(),
            b',' => {
                self.advance();
                Self::token(TokenKind::Comma, ",")
            }
            b'(' => {
                self.advance();
                Self::token(TokenKind::LeftParen, "(")
            }
            b')' => {
                self.advance();
                Self::token(TokenKind::RightParen, ")")
            }
            b'*' => {
                self.advance();
                Self::token(TokenKind::Star, "*")
            }
            b'+' => {
                self.advance();
                Self::token(TokenKind::Plus, "+")
            }
            b'-' => {
                self.advance();
                Self::token(TokenKind::Minus, "-")
            }
            b'/' => {
                self.advance();
                Self::token(TokenKind::Slash, "/")
            }
            b';' => {
                self.advance();
                Self::token(TokenKind::Semicolon, ";")
            }
            b'=' => {
                self.advance();
                Self::token(TokenKind::Eq, "=")
            }
            b'<' => {
                self.advance();
                match self.peek() {
                    Some(b'=') => {
                        self.advance();
                        Self::token(TokenKind::Le, "<=")
                    }
                    Some(b'>') => {
                        self.advance();
                        Self::token(TokenKind::Neq, "<>")
                    }
                    _ => Self::token(TokenKind::Lt, "<"),
                }
            }
            b'>' => {
                self.advance();
                if self.peek() == Some(b'=') {
                    self.advance();
                    Self::token(TokenKind::Ge, ">=")
                } else {
                    Self::token(TokenKind::Gt, ">")
                }
            }
            b'!' if self.peek_at(1) == Some(b'=') => {
                self.advance();
                self.advance();
                Self::token(TokenKind::Neq, "!=")
            }
            other => {
                self.advance();
                Self::token(TokenKind::Identifier, (other as char).to_string())
            }
        }
    }

    fn lex_string(&mut self) -> Token {
        // opening quote
        self.advance();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b'\'' {
                break;
            }
            self.advance();
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        // closing quote
        self.advance();
        Self::token(TokenKind::StringConstant, text)
    }

    fn lex_number(&mut self) -> Token {
        let start = self.pos;
        let mut saw_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.advance();
            } else if c == b'.' && !saw_dot {
                saw_dot = true;
                self.advance();
            } else {
                break;
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        let kind = if saw_dot {
            TokenKind::DecimalConstant
        } else {
            TokenKind::IntegerConstant
        };
        Self::token(kind, text)
    }

    fn lex_identifier(&mut self) -> Token {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'.' {
                self.advance();
            } else {
                break;
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        Self::token(TokenKind::Identifier, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        Lexer::tokenize(sql).iter().map(|t| t.kind).collect()
    }

    #[test]
    fn numbers_split_into_integer_and_decimal() {
        assert_eq!(
            kinds("42 15.5"),
            vec![
                TokenKind::IntegerConstant,
                TokenKind::DecimalConstant,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn strings_drop_quotes() {
        let toks = Lexer::tokenize("'hello world'");
        assert_eq!(toks[0].kind, TokenKind::StringConstant);
        assert_eq!(toks[0].text, "hello world");
    }

    #[test]
    fn comparison_operators() {
        assert_eq!(
            kinds("< <= > >= = <> !="),
            vec![
                TokenKind::Lt,
                TokenKind::Le,
                TokenKind::Gt,
                TokenKind::Ge,
                TokenKind::Eq,
                TokenKind::Neq,
                TokenKind::Neq,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn full_select_statement() {
        let toks = Lexer::tokenize("SELECT a, sum(b) FROM rel WHERE a < 10.0 GROUP BY a");
        assert_eq!(toks[0].text, "SELECT");
        assert_eq!(toks[0].kind, TokenKind::Identifier);
        assert!(toks.iter().any(|t| t.kind == TokenKind::DecimalConstant));
    }

    #[test]
    fn line_comments_are_skipped() {
        assert_eq!(
            kinds("a -- trailing comment\nb"),
            vec![TokenKind::Identifier, TokenKind::Identifier, TokenKind::Eof]
        );
    }
}
