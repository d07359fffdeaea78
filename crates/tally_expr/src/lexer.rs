use crate::diagnostics::SourceSpan;
use crate::errors::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: SourceSpan,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),

    If,
    Elif,
    Else,
    For,
    In,
    While,
    Def,
    Return,
    Break,
    Pass,
    Try,
    Except,
    Finally,
    As,
    And,
    Or,
    Not,
    Is,
    True,
    False,
    None,
    /// Keywords of the host grammar that the expression language refuses.
    Reserved(String),

    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    LShift,
    RShift,
    Amp,
    Pipe,
    Caret,
    Tilde,
    EqEq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Semicolon,

    Newline,
    Indent,
    Dedent,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Name(n) => format!("name '{}'", n),
            TokenKind::Int(i) => format!("number {}", i),
            TokenKind::Float(f) => format!("number {}", f),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Reserved(k) => format!("keyword '{}'", k),
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::Indent => "indent".to_string(),
            TokenKind::Dedent => "dedent".to_string(),
            TokenKind::Eof => "end of expression".to_string(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::If => "if",
            TokenKind::Elif => "elif",
            TokenKind::Else => "else",
            TokenKind::For => "for",
            TokenKind::In => "in",
            TokenKind::While => "while",
            TokenKind::Def => "def",
            TokenKind::Return => "return",
            TokenKind::Break => "break",
            TokenKind::Pass => "pass",
            TokenKind::Try => "try",
            TokenKind::Except => "except",
            TokenKind::Finally => "finally",
            TokenKind::As => "as",
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Not => "not",
            TokenKind::Is => "is",
            TokenKind::True => "True",
            TokenKind::False => "False",
            TokenKind::None => "None",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::DoubleStar => "**",
            TokenKind::Slash => "/",
            TokenKind::DoubleSlash => "//",
            TokenKind::Percent => "%",
            TokenKind::LShift => "<<",
            TokenKind::RShift => ">>",
            TokenKind::Amp => "&",
            TokenKind::Pipe => "|",
            TokenKind::Caret => "^",
            TokenKind::Tilde => "~",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::LtE => "<=",
            TokenKind::Gt => ">",
            TokenKind::GtE => ">=",
            TokenKind::Assign => "=",
            TokenKind::PlusAssign => "+=",
            TokenKind::MinusAssign => "-=",
            TokenKind::StarAssign => "*=",
            TokenKind::SlashAssign => "/=",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Dot => ".",
            TokenKind::Semicolon => ";",
            _ => "?",
        }
    }
}

fn keyword(ident: &str) -> Option<TokenKind> {
    let kind = match ident {
        "if" => TokenKind::If,
        "elif" => TokenKind::Elif,
        "else" => TokenKind::Else,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "while" => TokenKind::While,
        "def" => TokenKind::Def,
        "return" => TokenKind::Return,
        "break" => TokenKind::Break,
        "pass" => TokenKind::Pass,
        "try" => TokenKind::Try,
        "except" => TokenKind::Except,
        "finally" => TokenKind::Finally,
        "as" => TokenKind::As,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "is" => TokenKind::Is,
        "True" => TokenKind::True,
        "False" => TokenKind::False,
        "None" => TokenKind::None,
        "lambda" | "import" | "from" | "class" | "global" | "nonlocal" | "del" | "with" | "yield"
        | "continue" | "raise" | "assert" | "async" | "await" => TokenKind::Reserved(ident.to_string()),
        _ => return None,
    };
    Some(kind)
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    Lexer::new(src).run()
}

struct Lexer<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    tokens: Vec<Token>,
    indents: Vec<usize>,
    depth: usize,
    at_line_start: bool,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().collect(),
            pos: 0,
            tokens: Vec::new(),
            indents: vec![0],
            depth: 0,
            at_line_start: true,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, ExprError> {
        loop {
            if self.at_line_start && self.depth == 0 {
                self.indentation()?;
            }
            let Some((offset, c)) = self.peek() else {
                break;
            };
            match c {
                ' ' | '\t' | '\r' | '\x0c' => self.bump(),
                '\n' => {
                    self.bump();
                    if self.depth == 0 {
                        self.newline(offset);
                        self.at_line_start = true;
                    }
                }
                '#' => self.skip_comment(),
                '\\' if self.peek_at(1).map(|(_, c)| c) == Some('\n') => {
                    self.bump();
                    self.bump();
                }
                '"' | '\'' => self.string(offset, false)?,
                _ if c.is_ascii_digit() => self.number(offset)?,
                '.' if self.peek_at(1).is_some_and(|(_, c)| c.is_ascii_digit()) => self.number(offset)?,
                _ if c.is_alphabetic() || c == '_' => self.name(offset)?,
                _ => self.operator(offset, c)?,
            }
        }

        let end = self.src.len();
        self.newline(end);
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent, end, 0);
        }
        self.push(TokenKind::Eof, end, 0);
        Ok(self.tokens)
    }

    fn peek(&self) -> Option<(usize, char)> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<(usize, char)> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn offset(&self) -> usize {
        self.peek().map(|(o, _)| o).unwrap_or(self.src.len())
    }

    fn push(&mut self, kind: TokenKind, offset: usize, len: usize) {
        self.tokens.push(Token {
            kind,
            span: SourceSpan::new(offset, len),
        });
    }

    fn newline(&mut self, offset: usize) {
        match self.tokens.last() {
            None => {}
            Some(t) if t.kind == TokenKind::Newline => {}
            Some(_) => self.push(TokenKind::Newline, offset, 0),
        }
    }

    fn skip_comment(&mut self) {
        while let Some((_, c)) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn indentation(&mut self) -> Result<(), ExprError> {
        loop {
            let mut col = 0usize;
            while let Some((_, c)) = self.peek() {
                match c {
                    ' ' => col += 1,
                    '\t' => col = (col / 8 + 1) * 8,
                    '\x0c' => col = 0,
                    _ => break,
                }
                self.bump();
            }
            match self.peek() {
                None => return Ok(()),
                Some((_, '\n')) | Some((_, '\r')) => self.bump(),
                Some((_, '#')) => self.skip_comment(),
                Some((offset, _)) => {
                    // A leading indent on the first line is the base level.
                    if self.tokens.is_empty() {
                        self.indents = vec![col];
                    }
                    let current = self.indents.last().copied().unwrap_or(0);
                    if col > current {
                        self.indents.push(col);
                        self.push(TokenKind::Indent, offset, 0);
                    } else {
                        while col < self.indents.last().copied().unwrap_or(0) {
                            self.indents.pop();
                            self.push(TokenKind::Dedent, offset, 0);
                        }
                        if self.indents.last().copied().unwrap_or(0) != col {
                            return Err(ExprError::indentation(
                                self.src,
                                SourceSpan::new(offset, 1),
                                "unindent does not match any outer indentation level",
                            ));
                        }
                    }
                    self.at_line_start = false;
                    return Ok(());
                }
            }
        }
    }

    fn string(&mut self, start: usize, raw: bool) -> Result<(), ExprError> {
        let Some((_, quote)) = self.peek() else {
            return Ok(());
        };
        let triple = self.peek_at(1).map(|(_, c)| c) == Some(quote) && self.peek_at(2).map(|(_, c)| c) == Some(quote);
        let quote_len = if triple { 3 } else { 1 };
        for _ in 0..quote_len {
            self.bump();
        }

        let mut content = String::new();
        loop {
            let Some((offset, c)) = self.peek() else {
                let len = self.src.len() - start;
                return Err(ExprError::syntax(
                    self.src,
                    SourceSpan::new(start, len),
                    "unterminated string literal",
                ));
            };
            if c == quote {
                if !triple {
                    self.bump();
                    break;
                }
                let closes = self.peek_at(1).map(|(_, c)| c) == Some(quote)
                    && self.peek_at(2).map(|(_, c)| c) == Some(quote);
                if closes {
                    self.bump();
                    self.bump();
                    self.bump();
                    break;
                }
                content.push(c);
                self.bump();
                continue;
            }
            if c == '\n' && !triple {
                return Err(ExprError::syntax(
                    self.src,
                    SourceSpan::new(start, offset - start),
                    "unterminated string literal",
                ));
            }
            if c == '\\' && !raw {
                self.bump();
                let Some((_, escaped)) = self.peek() else {
                    continue;
                };
                self.bump();
                match escaped {
                    'n' => content.push('\n'),
                    't' => content.push('\t'),
                    'r' => content.push('\r'),
                    '0' => content.push('\0'),
                    '\\' => content.push('\\'),
                    '\'' => content.push('\''),
                    '"' => content.push('"'),
                    '\n' => {}
                    other => {
                        content.push('\\');
                        content.push(other);
                    }
                }
                continue;
            }
            content.push(c);
            self.bump();
        }

        let end = self.offset();
        self.push(TokenKind::Str(content), start, end - start);
        Ok(())
    }

    fn number(&mut self, start: usize) -> Result<(), ExprError> {
        let radix = match (self.peek().map(|(_, c)| c), self.peek_at(1).map(|(_, c)| c)) {
            (Some('0'), Some('x' | 'X')) => Some(16),
            (Some('0'), Some('o' | 'O')) => Some(8),
            (Some('0'), Some('b' | 'B')) => Some(2),
            _ => None,
        };

        if let Some(radix) = radix {
            self.bump();
            self.bump();
            let mut digits = String::new();
            while let Some((_, c)) = self.peek() {
                if c.is_digit(radix) {
                    digits.push(c);
                } else if c != '_' {
                    break;
                }
                self.bump();
            }
            let end = self.offset();
            let value = i64::from_str_radix(&digits, radix).map_err(|_| {
                ExprError::syntax(self.src, SourceSpan::new(start, end - start), "invalid integer literal")
            })?;
            self.push(TokenKind::Int(value), start, end - start);
            return Ok(());
        }

        let mut text = String::new();
        let mut is_float = false;
        while let Some((_, c)) = self.peek() {
            match c {
                '0'..='9' => text.push(c),
                '_' => {}
                '.' if !is_float => {
                    is_float = true;
                    text.push(c);
                }
                'e' | 'E' => {
                    let next = self.peek_at(1).map(|(_, c)| c);
                    let after = self.peek_at(2).map(|(_, c)| c);
                    let exponent = match next {
                        Some(d) if d.is_ascii_digit() => true,
                        Some('+' | '-') => after.is_some_and(|d| d.is_ascii_digit()),
                        _ => false,
                    };
                    if !exponent {
                        break;
                    }
                    is_float = true;
                    text.push('e');
                    self.bump();
                    if let Some((_, sign @ ('+' | '-'))) = self.peek() {
                        text.push(sign);
                        self.bump();
                    }
                    continue;
                }
                _ => break,
            }
            self.bump();
        }

        let end = self.offset();
        let span = SourceSpan::new(start, end - start);
        let kind = if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| ExprError::syntax(self.src, span, "invalid number literal"))?;
            TokenKind::Float(value)
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| ExprError::syntax(self.src, span, "integer literal is too large"))?;
            TokenKind::Int(value)
        };
        self.push(kind, start, end - start);
        Ok(())
    }

    fn name(&mut self, start: usize) -> Result<(), ExprError> {
        let mut ident = String::new();
        while let Some((_, c)) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                ident.push(c);
                self.bump();
            } else {
                break;
            }
        }

        if let Some((_, '"' | '\'')) = self.peek() {
            match ident.as_str() {
                "r" | "R" => return self.string(start, true),
                "u" | "U" => return self.string(start, false),
                "f" | "F" | "b" | "B" | "rb" | "br" | "fr" | "rf" => {
                    let end = self.offset();
                    return Err(ExprError::syntax(
                        self.src,
                        SourceSpan::new(start, end - start),
                        format!("string prefix '{}' is not supported", ident),
                    ));
                }
                _ => {}
            }
        }

        let len = ident.len();
        let kind = keyword(&ident).unwrap_or(TokenKind::Name(ident));
        self.push(kind, start, len);
        Ok(())
    }

    fn operator(&mut self, start: usize, c: char) -> Result<(), ExprError> {
        let next = self.peek_at(1).map(|(_, c)| c);
        let double = match (c, next) {
            ('*', Some('*')) => Some(TokenKind::DoubleStar),
            ('/', Some('/')) => Some(TokenKind::DoubleSlash),
            ('<', Some('<')) => Some(TokenKind::LShift),
            ('>', Some('>')) => Some(TokenKind::RShift),
            ('=', Some('=')) => Some(TokenKind::EqEq),
            ('!', Some('=')) => Some(TokenKind::NotEq),
            ('<', Some('=')) => Some(TokenKind::LtE),
            ('>', Some('=')) => Some(TokenKind::GtE),
            ('+', Some('=')) => Some(TokenKind::PlusAssign),
            ('-', Some('=')) => Some(TokenKind::MinusAssign),
            ('*', Some('=')) => Some(TokenKind::StarAssign),
            ('/', Some('=')) => Some(TokenKind::SlashAssign),
            _ => None,
        };
        if let Some(kind) = double {
            self.bump();
            self.bump();
            self.push(kind, start, 2);
            return Ok(());
        }

        let kind = match c {
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '&' => TokenKind::Amp,
            '|' => TokenKind::Pipe,
            '^' => TokenKind::Caret,
            '~' => TokenKind::Tilde,
            '<' => TokenKind::Lt,
            '>' => TokenKind::Gt,
            '=' => TokenKind::Assign,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '.' => TokenKind::Dot,
            ';' => TokenKind::Semicolon,
            '(' | '[' | '{' => {
                self.depth += 1;
                match c {
                    '(' => TokenKind::LParen,
                    '[' => TokenKind::LBracket,
                    _ => TokenKind::LBrace,
                }
            }
            ')' | ']' | '}' => {
                self.depth = self.depth.saturating_sub(1);
                match c {
                    ')' => TokenKind::RParen,
                    ']' => TokenKind::RBracket,
                    _ => TokenKind::RBrace,
                }
            }
            _ => {
                return Err(ExprError::syntax(
                    self.src,
                    SourceSpan::new(start, c.len_utf8()),
                    format!("unexpected character '{}'", c),
                ));
            }
        };
        self.bump();
        self.push(kind, start, c.len_utf8());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_simple_expression() {
        assert_eq!(
            kinds("amount * 2"),
            vec![
                TokenKind::Name("amount".into()),
                TokenKind::Star,
                TokenKind::Int(2),
                TokenKind::Newline,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_indent_and_dedent() {
        let k = kinds("if x:\n    y = 1\nz");
        assert!(k.contains(&TokenKind::Indent));
        assert!(k.contains(&TokenKind::Dedent));
        assert_eq!(k.last(), Some(&TokenKind::Eof));
    }

    #[test]
    fn test_newlines_ignored_inside_brackets() {
        let k = kinds("[1,\n 2]");
        assert_eq!(k.iter().filter(|k| **k == TokenKind::Newline).count(), 1);
    }

    #[test]
    fn test_float_and_exponent() {
        assert_eq!(kinds("1.5e3")[0], TokenKind::Float(1500.0));
        assert_eq!(kinds(".25")[0], TokenKind::Float(0.25));
        assert_eq!(kinds("0x1f")[0], TokenKind::Int(31));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(kinds(r#""a\"b\n""#)[0], TokenKind::Str("a\"b\n".into()));
        assert_eq!(kinds(r"r'a\d'")[0], TokenKind::Str("a\\d".into()));
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("'abc").is_err());
    }

    #[test]
    fn test_bad_dedent() {
        let err = tokenize("if x:\n    y\n  z").unwrap_err();
        assert!(err.message().contains("unindent"));
    }
}
