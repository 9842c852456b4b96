//! Tokenizer for the snippet language.

use std::fmt;

use thiserror::Error;

/// A lexing or parsing error with its source position (1-based).
#[derive(Debug, Clone, Error, PartialEq)]
#[error("syntax error at {line}:{column}: {message}")]
pub struct SyntaxError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),

    // Keywords
    Let,
    Fn,
    Return,
    If,
    Else,
    While,
    For,
    In,
    Break,
    Continue,
    Try,
    Catch,
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Import,
    From,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
    Semi,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    StarStar,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    AndAnd,
    OrOr,
    Bang,

    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Ident(name) => write!(f, "identifier `{name}`"),
            Tok::Int(n) => write!(f, "integer {n}"),
            Tok::Float(n) => write!(f, "number {n}"),
            Tok::Str(_) => f.write_str("string literal"),
            Tok::Eof => f.write_str("end of input"),
            other => write!(f, "`{}`", other.symbol()),
        }
    }
}

impl Tok {
    fn symbol(&self) -> &'static str {
        match self {
            Tok::Let => "let",
            Tok::Fn => "fn",
            Tok::Return => "return",
            Tok::If => "if",
            Tok::Else => "else",
            Tok::While => "while",
            Tok::For => "for",
            Tok::In => "in",
            Tok::Break => "break",
            Tok::Continue => "continue",
            Tok::Try => "try",
            Tok::Catch => "catch",
            Tok::True => "true",
            Tok::False => "false",
            Tok::Null => "null",
            Tok::And => "and",
            Tok::Or => "or",
            Tok::Not => "not",
            Tok::Import => "import",
            Tok::From => "from",
            Tok::LParen => "(",
            Tok::RParen => ")",
            Tok::LBracket => "[",
            Tok::RBracket => "]",
            Tok::LBrace => "{",
            Tok::RBrace => "}",
            Tok::Comma => ",",
            Tok::Dot => ".",
            Tok::Colon => ":",
            Tok::Semi => ";",
            Tok::Plus => "+",
            Tok::Minus => "-",
            Tok::Star => "*",
            Tok::Slash => "/",
            Tok::Percent => "%",
            Tok::StarStar => "**",
            Tok::EqEq => "==",
            Tok::NotEq => "!=",
            Tok::Lt => "<",
            Tok::Le => "<=",
            Tok::Gt => ">",
            Tok::Ge => ">=",
            Tok::Assign => "=",
            Tok::PlusEq => "+=",
            Tok::MinusEq => "-=",
            Tok::StarEq => "*=",
            Tok::SlashEq => "/=",
            Tok::AndAnd => "&&",
            Tok::OrOr => "||",
            Tok::Bang => "!",
            Tok::Ident(_) | Tok::Int(_) | Tok::Float(_) | Tok::Str(_) | Tok::Eof => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
    pub column: u32,
    /// A line break separates this token from the previous one.
    pub newline_before: bool,
}

fn keyword(word: &str) -> Option<Tok> {
    let tok = match word {
        "let" => Tok::Let,
        "fn" => Tok::Fn,
        "return" => Tok::Return,
        "if" => Tok::If,
        "else" => Tok::Else,
        "while" => Tok::While,
        "for" => Tok::For,
        "in" => Tok::In,
        "break" => Tok::Break,
        "continue" => Tok::Continue,
        "try" => Tok::Try,
        "catch" => Tok::Catch,
        "true" => Tok::True,
        "false" => Tok::False,
        "null" => Tok::Null,
        "and" => Tok::And,
        "or" => Tok::Or,
        "not" => Tok::Not,
        "import" => Tok::Import,
        "from" => Tok::From,
        _ => return None,
    };
    Some(tok)
}

/// True when `name` could be bound as a variable in a snippet.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && keyword(name).is_none()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    column: u32,
    saw_newline: bool,
}

/// Splits source text into tokens. The last token is always [`Tok::Eof`].
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut lexer = Lexer {
        chars: source.chars().peekable(),
        line: 1,
        column: 1,
        saw_newline: false,
    };
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.tok == Tok::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

impl Lexer<'_> {
    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
            self.saw_newline = true;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else if c == '#' || (c == '/' && self.second() == Some('/')) {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
            } else {
                break;
            }
        }
    }

    fn second(&self) -> Option<char> {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.next()
    }

    fn next_token(&mut self) -> Result<Token, SyntaxError> {
        self.skip_trivia();
        let (line, column) = (self.line, self.column);
        let newline_before = std::mem::take(&mut self.saw_newline);
        let token = |tok| Token {
            tok,
            line,
            column,
            newline_before,
        };

        let Some(c) = self.bump() else {
            return Ok(token(Tok::Eof));
        };

        let tok = match c {
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            '{' => Tok::LBrace,
            '}' => Tok::RBrace,
            ',' => Tok::Comma,
            '.' => Tok::Dot,
            ':' => Tok::Colon,
            ';' => Tok::Semi,
            '%' => Tok::Percent,
            '+' if self.eat('=') => Tok::PlusEq,
            '+' => Tok::Plus,
            '-' if self.eat('=') => Tok::MinusEq,
            '-' => Tok::Minus,
            '*' if self.eat('*') => Tok::StarStar,
            '*' if self.eat('=') => Tok::StarEq,
            '*' => Tok::Star,
            '/' if self.eat('=') => Tok::SlashEq,
            '/' => Tok::Slash,
            '=' if self.eat('=') => Tok::EqEq,
            '=' => Tok::Assign,
            '!' if self.eat('=') => Tok::NotEq,
            '!' => Tok::Bang,
            '<' if self.eat('=') => Tok::Le,
            '<' => Tok::Lt,
            '>' if self.eat('=') => Tok::Ge,
            '>' => Tok::Gt,
            '&' if self.eat('&') => Tok::AndAnd,
            '|' if self.eat('|') => Tok::OrOr,
            '"' | '\'' => Tok::Str(self.string(c, line, column)?),
            c if c.is_ascii_digit() => self.number(c, line, column)?,
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(c) = self.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        word.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                keyword(&word).unwrap_or(Tok::Ident(word))
            }
            other => {
                return Err(SyntaxError::new(
                    format!("unexpected character {other:?}"),
                    line,
                    column,
                ))
            }
        };

        Ok(token(tok))
    }

    fn string(&mut self, quote: char, line: u32, column: u32) -> Result<String, SyntaxError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    return Err(SyntaxError::new("unterminated string literal", line, column))
                }
                Some(c) if c == quote => return Ok(out),
                Some('\\') => {
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some('\\') => '\\',
                        Some('\'') => '\'',
                        Some('"') => '"',
                        Some(other) => {
                            return Err(SyntaxError::new(
                                format!("unknown escape sequence \\{other}"),
                                self.line,
                                self.column,
                            ))
                        }
                        None => {
                            return Err(SyntaxError::new(
                                "unterminated string literal",
                                line,
                                column,
                            ))
                        }
                    };
                    out.push(escaped);
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self, first: char, line: u32, column: u32) -> Result<Tok, SyntaxError> {
        let mut text = String::from(first);
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    text.push(c);
                }
                self.bump();
            } else if c == '.' && !is_float && self.second().is_some_and(|d| d.is_ascii_digit()) {
                is_float = true;
                text.push(c);
                self.bump();
            } else if (c == 'e' || c == 'E') && !text.contains('e') {
                is_float = true;
                text.push('e');
                self.bump();
                if let Some(sign @ ('+' | '-')) = self.peek() {
                    text.push(sign);
                    self.bump();
                }
            } else {
                break;
            }
        }

        let invalid = || SyntaxError::new(format!("invalid number literal `{text}`"), line, column);
        if is_float {
            text.parse::<f64>().map(Tok::Float).map_err(|_| invalid())
        } else {
            text.parse::<i64>().map(Tok::Int).map_err(|_| invalid())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        tokenize(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_simple_statement() {
        assert_eq!(
            toks("let x = 1 + 2.5;"),
            vec![
                Tok::Let,
                Tok::Ident("x".into()),
                Tok::Assign,
                Tok::Int(1),
                Tok::Plus,
                Tok::Float(2.5),
                Tok::Semi,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_compound_operators() {
        assert_eq!(
            toks("a ** b += c != d <= e && f || !g"),
            vec![
                Tok::Ident("a".into()),
                Tok::StarStar,
                Tok::Ident("b".into()),
                Tok::PlusEq,
                Tok::Ident("c".into()),
                Tok::NotEq,
                Tok::Ident("d".into()),
                Tok::Le,
                Tok::Ident("e".into()),
                Tok::AndAnd,
                Tok::Ident("f".into()),
                Tok::OrOr,
                Tok::Bang,
                Tok::Ident("g".into()),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(
            toks(r#"'hi' "a\nb\"c""#),
            vec![
                Tok::Str("hi".into()),
                Tok::Str("a\nb\"c".into()),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            toks("# a comment\nx // another\n"),
            vec![Tok::Ident("x".into()), Tok::Eof]
        );
    }

    #[test]
    fn test_newline_tracking_and_positions() {
        let tokens = tokenize("a\n  b").unwrap();
        assert!(!tokens[0].newline_before);
        assert!(tokens[1].newline_before);
        assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(toks("1_000"), vec![Tok::Int(1000), Tok::Eof]);
        assert_eq!(toks("1e3"), vec![Tok::Float(1000.0), Tok::Eof]);
        assert_eq!(toks("2.5e-1"), vec![Tok::Float(0.25), Tok::Eof]);
        // `1.foo` is a field access, not a float
        assert_eq!(
            toks("1.x"),
            vec![Tok::Int(1), Tok::Dot, Tok::Ident("x".into()), Tok::Eof]
        );
    }

    #[test]
    fn test_integer_overflow_is_syntax_error() {
        let err = tokenize("99999999999999999999").unwrap_err();
        assert!(err.message.contains("invalid number literal"));
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("print('oops)").unwrap_err();
        assert_eq!((err.line, err.column), (1, 7));
        assert!(err.to_string().contains("unterminated string"));
    }

    #[test]
    fn test_unexpected_character() {
        let err = tokenize("a $ b").unwrap_err();
        assert!(err.message.contains("'$'"));
        assert_eq!(err.column, 3);
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("web_search"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("while"));
    }
}
