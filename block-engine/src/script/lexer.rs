// Block Script Lexer
// Tokenizes block-script statements and expressions

use std::fmt;

/// Token types for block scripts
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    String(String),

    Identifier(String),

    // Operators
    Plus,     // +
    Minus,    // -
    Star,     // *
    Slash,    // /
    Percent,  // %
    Assign,   // =
    Eq,       // ==
    Ne,       // !=
    Lt,       // <
    Le,       // <=
    Gt,       // >
    Ge,       // >=
    And,      // &&
    Or,       // ||
    Not,      // !
    Dot,      // .
    Comma,    // ,
    Colon,    // :
    Question, // ?

    // Delimiters
    LParen,    // (
    RParen,    // )
    LBracket,  // [
    RBracket,  // ]
    LBrace,    // {
    RBrace,    // }
    Semicolon, // ;

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Assign => write!(f, "="),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Question => write!(f, "?"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::Semicolon => write!(f, ";"),
            Token::Eof => write!(f, "end of script"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lex error at position {}: {}", self.position, self.message)
    }
}

impl std::error::Error for LexError {}

/// Lexer for block scripts. `#` starts a comment running to end of line.
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }

        Ok(tokens)
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_trivia();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };
        self.position = pos;

        let single = match ch {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '.' => Some(Token::Dot),
            ',' => Some(Token::Comma),
            ':' => Some(Token::Colon),
            '?' => Some(Token::Question),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '{' => Some(Token::LBrace),
            '}' => Some(Token::RBrace),
            ';' => Some(Token::Semicolon),
            _ => None,
        };
        if let Some(token) = single {
            self.advance();
            return Ok(token);
        }

        match ch {
            '=' => Ok(self.one_or_two('=', Token::Eq, Token::Assign)),
            '!' => Ok(self.one_or_two('=', Token::Ne, Token::Not)),
            '<' => Ok(self.one_or_two('=', Token::Le, Token::Lt)),
            '>' => Ok(self.one_or_two('=', Token::Ge, Token::Gt)),
            '&' => self.doubled('&', Token::And),
            '|' => self.doubled('|', Token::Or),
            '\'' | '"' => self.read_string(ch),
            '0'..='9' => self.read_number(),
            'a'..='z' | 'A'..='Z' | '_' => Ok(self.read_identifier()),
            _ => Err(LexError {
                message: format!("unexpected character: '{}'", ch),
                position: pos,
            }),
        }
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    /// Consume the current char; if `second` follows, consume it too
    fn one_or_two(&mut self, second: char, two: Token, one: Token) -> Token {
        self.advance();
        if self.peek_char() == Some(second) {
            self.advance();
            two
        } else {
            one
        }
    }

    fn doubled(&mut self, ch: char, token: Token) -> Result<Token, LexError> {
        let pos = self.position;
        self.advance();
        if self.peek_char() == Some(ch) {
            self.advance();
            Ok(token)
        } else {
            Err(LexError {
                message: format!("expected '{}{}' operator", ch, ch),
                position: pos,
            })
        }
    }

    fn skip_trivia(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() {
                self.advance();
            } else if ch == '#' {
                while let Some(c) = self.peek_char() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    /// Quotes are escaped by doubling them: 'it''s'
    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        let start = self.position;
        self.advance();

        let mut value = String::new();
        loop {
            match self.advance() {
                Some((_, c)) if c == quote => {
                    if self.peek_char() == Some(quote) {
                        value.push(quote);
                        self.advance();
                    } else {
                        break;
                    }
                }
                Some((_, c)) => value.push(c),
                None => {
                    return Err(LexError {
                        message: "unterminated string".to_string(),
                        position: start,
                    });
                }
            }
        }

        Ok(Token::String(value))
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        let mut text = String::new();
        self.take_digits(&mut text);

        // A '.' is a decimal point only when a digit follows; otherwise it is
        // member access on the literal.
        if self.peek_char() == Some('.') {
            let mut lookahead = self.chars.clone();
            lookahead.next();
            if matches!(lookahead.peek(), Some(&(_, c)) if c.is_ascii_digit()) {
                text.push('.');
                self.advance();
                self.take_digits(&mut text);
            }
        }

        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| LexError {
                message: format!("invalid number: {}", text),
                position: start,
            })
    }

    fn take_digits(&mut self, text: &mut String) {
        while let Some(c) = self.peek_char() {
            if !c.is_ascii_digit() {
                break;
            }
            text.push(c);
            self.advance();
        }
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();
        while let Some(c) = self.peek_char() {
            if !(c.is_alphanumeric() || c == '_') {
                break;
            }
            ident.push(c);
            self.advance();
        }

        match ident.as_str() {
            "null" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Identifier(ident),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(input: &str) -> Vec<Token> {
        Lexer::new(input).tokenize().unwrap()
    }

    #[test]
    fn test_assignment_statement() {
        assert_eq!(
            lex("Result = X + Y;"),
            vec![
                Token::Identifier("Result".to_string()),
                Token::Assign,
                Token::Identifier("X".to_string()),
                Token::Plus,
                Token::Identifier("Y".to_string()),
                Token::Semicolon,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_assign_versus_equality() {
        assert_eq!(
            lex("a == b = c"),
            vec![
                Token::Identifier("a".to_string()),
                Token::Eq,
                Token::Identifier("b".to_string()),
                Token::Assign,
                Token::Identifier("c".to_string()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_comparison_and_logic() {
        assert_eq!(
            lex("< <= > >= != && || !"),
            vec![
                Token::Lt,
                Token::Le,
                Token::Gt,
                Token::Ge,
                Token::Ne,
                Token::And,
                Token::Or,
                Token::Not,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_strings_with_both_quotes() {
        assert_eq!(
            lex(r#"'it''s' "say ""hi""""#),
            vec![
                Token::String("it's".to_string()),
                Token::String(r#"say "hi""#.to_string()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            lex("42 3.14 0"),
            vec![
                Token::Number(42.0),
                Token::Number(3.14),
                Token::Number(0.0),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            lex("# bump\nCount = Count + 1 # inline\n"),
            vec![
                Token::Identifier("Count".to_string()),
                Token::Assign,
                Token::Identifier("Count".to_string()),
                Token::Plus,
                Token::Number(1.0),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_keywords_are_case_sensitive() {
        assert_eq!(
            lex("true True"),
            vec![
                Token::True,
                Token::Identifier("True".to_string()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_single_ampersand_rejected() {
        let err = Lexer::new("a & b").tokenize().unwrap_err();
        assert_eq!(err.position, 2);
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("'open").tokenize().unwrap_err();
        assert!(err.message.contains("unterminated"));
    }
}
