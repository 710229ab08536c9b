use std::str::FromStr;

use kstring::KString;
use strum_macros::{EnumString, IntoStaticStr};

use super::{Pos, ScriptError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Keyword {
    Let,
    If,
    Else,
    While,
    For,
    In,
    Fn,
    Return,
    Break,
    Continue,
    True,
    False,
    Null,
    Class,
}

impl Keyword {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punct {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Dot,
    Colon,
    Question,
    Assign,
    PlusAssign,
    MinusAssign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    And,
    Or,
}

impl Punct {
    pub fn as_str(self) -> &'static str {
        use Punct::*;
        match self {
            LParen => "(",
            RParen => ")",
            LBracket => "[",
            RBracket => "]",
            LBrace => "{",
            RBrace => "}",
            Comma => ",",
            Semi => ";",
            Dot => ".",
            Colon => ":",
            Question => "?",
            Assign => "=",
            PlusAssign => "+=",
            MinusAssign => "-=",
            Eq => "==",
            Ne => "!=",
            Lt => "<",
            Le => "<=",
            Gt => ">",
            Ge => ">=",
            Plus => "+",
            Minus => "-",
            Star => "*",
            Slash => "/",
            Percent => "%",
            Not => "!",
            And => "&&",
            Or => "||",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(KString),
    Int(i64),
    Float(f64),
    Str(String),
    Punct(Punct),
    Keyword(Keyword),
    /// A statement built outside of the token stream, by index; used
    /// to put template text between the pieces of a block.
    Splice(usize),
    Eof,
}

impl Tok {
    pub fn describe(&self) -> String {
        match self {
            Tok::Ident(s) => format!("identifier `{s}`"),
            Tok::Int(i) => format!("number {i}"),
            Tok::Float(x) => format!("number {x}"),
            Tok::Str(_) => "string literal".into(),
            Tok::Punct(p) => format!("`{}`", p.as_str()),
            Tok::Keyword(k) => format!("keyword `{}`", k.as_str()),
            Tok::Splice(_) => "template text".into(),
            Tok::Eof => "end of code".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub pos: Pos,
    /// Byte range in the lexed source.
    pub start: usize,
    pub end: usize,
}

struct Lexer<'s> {
    src: &'s str,
    offset: usize,
    pos: Pos,
}

impl<'s> Lexer<'s> {
    fn peek(&self) -> Option<char> {
        self.src[self.offset..].chars().next()
    }

    fn peek2(&self) -> Option<char> {
        let mut cs = self.src[self.offset..].chars();
        cs.next();
        cs.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.offset += c.len_utf8();
        if c == '\n' {
            self.pos.line += 1;
            self.pos.column = 1;
        } else {
            self.pos.column += 1;
        }
        Some(c)
    }

    fn bump_if(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn skip_trivia(&mut self) -> Result<(), ScriptError> {
        loop {
            match (self.peek(), self.peek2()) {
                (Some(c), _) if c.is_whitespace() => {
                    self.bump();
                }
                (Some('/'), Some('/')) => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break
                        }
                    }
                }
                (Some('/'), Some('*')) => {
                    let start = self.pos;
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            None => return Err(ScriptError::new(
                                start, "unterminated block comment")),
                            Some('*') if self.peek() == Some('/') => {
                                self.bump();
                                break
                            }
                            Some(_) => (),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn string(&mut self, quote: char, start: Pos) -> Result<Tok, ScriptError> {
        let mut s = String::new();
        loop {
            let c = self.bump().ok_or_else(
                || ScriptError::new(start, "unterminated string literal"))?;
            if c == quote {
                return Ok(Tok::Str(s))
            }
            if c != '\\' {
                s.push(c);
                continue
            }
            let escpos = self.pos;
            let e = self.bump().ok_or_else(
                || ScriptError::new(start, "unterminated string literal"))?;
            match e {
                'n' => s.push('\n'),
                'r' => s.push('\r'),
                't' => s.push('\t'),
                '0' => s.push('\0'),
                '\\' => s.push('\\'),
                '"' => s.push('"'),
                '\'' => s.push('\''),
                'u' => {
                    if !self.bump_if('{') {
                        return Err(ScriptError::new(escpos, "expected `{` after \\u"))
                    }
                    let mut hex = String::new();
                    while let Some(c) = self.peek() {
                        if c == '}' {
                            break
                        }
                        hex.push(c);
                        self.bump();
                    }
                    if !self.bump_if('}') {
                        return Err(ScriptError::new(escpos, "unterminated \\u{...} escape"))
                    }
                    let ch = u32::from_str_radix(&hex, 16).ok()
                        .and_then(char::from_u32)
                        .ok_or_else(|| ScriptError::new(
                            escpos, format!("invalid unicode escape {hex:?}")))?;
                    s.push(ch);
                }
                other => return Err(ScriptError::new(
                    escpos, format!("unknown escape sequence \\{other}"))),
            }
        }
    }

    fn number(&mut self, start: Pos) -> Result<Tok, ScriptError> {
        let from = self.offset;
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.bump();
            } else if c == '.' && !is_float
                && self.peek2().map_or(false, |d| d.is_ascii_digit())
            {
                is_float = true;
                self.bump();
            } else if (c == 'e' || c == 'E')
                && self.peek2().map_or(false, |d| d.is_ascii_digit() || d == '-' || d == '+')
            {
                is_float = true;
                self.bump();
                if let Some('-') | Some('+') = self.peek() {
                    self.bump();
                }
            } else {
                break
            }
        }
        let text: String = self.src[from..self.offset].chars().filter(|c| *c != '_').collect();
        if is_float {
            f64::from_str(&text).map(Tok::Float).map_err(
                |_| ScriptError::new(start, format!("invalid number {text:?}")))
        } else {
            i64::from_str(&text).map(Tok::Int).map_err(
                |_| ScriptError::new(start, format!("integer {text:?} out of range")))
        }
    }

    fn punct(&mut self, c: char, start: Pos) -> Result<Punct, ScriptError> {
        use Punct::*;
        let p = match c {
            '(' => LParen,
            ')' => RParen,
            '[' => LBracket,
            ']' => RBracket,
            '{' => LBrace,
            '}' => RBrace,
            ',' => Comma,
            ';' => Semi,
            '.' => Dot,
            ':' => Colon,
            '?' => Question,
            '*' => Star,
            '/' => Slash,
            '%' => Percent,
            '=' => if self.bump_if('=') { Eq } else { Assign },
            '!' => if self.bump_if('=') { Ne } else { Not },
            '<' => if self.bump_if('=') { Le } else { Lt },
            '>' => if self.bump_if('=') { Ge } else { Gt },
            '+' => if self.bump_if('=') { PlusAssign } else { Plus },
            '-' => if self.bump_if('=') { MinusAssign } else { Minus },
            '&' if self.bump_if('&') => And,
            '|' if self.bump_if('|') => Or,
            _ => return Err(ScriptError::new(start, format!("unexpected character {c:?}"))),
        };
        Ok(p)
    }

    fn next_token(&mut self) -> Result<Token, ScriptError> {
        self.skip_trivia()?;
        let start = self.offset;
        let pos = self.pos;
        let c = match self.bump() {
            None => return Ok(Token { tok: Tok::Eof, pos, start, end: start }),
            Some(c) => c,
        };
        let tok =
            if c == '_' || c.is_alphabetic() {
                while let Some(c) = self.peek() {
                    if c == '_' || c.is_alphanumeric() {
                        self.bump();
                    } else {
                        break
                    }
                }
                let word = &self.src[start..self.offset];
                match Keyword::from_str(word) {
                    Ok(k) => Tok::Keyword(k),
                    Err(_) => Tok::Ident(KString::from_ref(word)),
                }
            } else if c.is_ascii_digit() {
                // put it back, number() wants to see all digits
                self.offset = start;
                self.pos = pos;
                self.number(pos)?
            } else if c == '"' || c == '\'' {
                self.string(c, pos)?
            } else {
                Tok::Punct(self.punct(c, pos)?)
            };
        Ok(Token { tok, pos, start, end: self.offset })
    }
}

/// Split `src` into tokens; `origin` is the position of the first
/// character of `src` in the file it was taken from. The result
/// always ends with a `Tok::Eof` token.
pub fn tokenize(src: &str, origin: Pos) -> Result<Vec<Token>, ScriptError> {
    let mut lexer = Lexer { src, offset: 0, pos: origin };
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let eof = token.tok == Tok::Eof;
        tokens.push(token);
        if eof {
            return Ok(tokens)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<Tok> {
        tokenize(s, Pos::START).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn t_basic() {
        assert_eq!(toks("let x = 1 + 2.5;"),
                   vec![Tok::Keyword(Keyword::Let),
                        Tok::Ident("x".into()),
                        Tok::Punct(Punct::Assign),
                        Tok::Int(1),
                        Tok::Punct(Punct::Plus),
                        Tok::Float(2.5),
                        Tok::Punct(Punct::Semi),
                        Tok::Eof]);
        assert_eq!(toks("a >= b && !c != d"),
                   vec![Tok::Ident("a".into()),
                        Tok::Punct(Punct::Ge),
                        Tok::Ident("b".into()),
                        Tok::Punct(Punct::And),
                        Tok::Punct(Punct::Not),
                        Tok::Ident("c".into()),
                        Tok::Punct(Punct::Ne),
                        Tok::Ident("d".into()),
                        Tok::Eof]);
    }

    #[test]
    fn t_strings() {
        assert_eq!(toks(r#""a\"b\n" 'c"d' "\u{e4}""#),
                   vec![Tok::Str("a\"b\n".into()),
                        Tok::Str("c\"d".into()),
                        Tok::Str("ä".into()),
                        Tok::Eof]);
        let e = tokenize("\"abc", Pos::START).unwrap_err();
        assert_eq!(e.message, "unterminated string literal");
        assert!(tokenize(r#""\q""#, Pos::START).is_err());
    }

    #[test]
    fn t_comments_and_positions() {
        let ts = tokenize("// hi\n  foo /* x\ny */ bar", Pos::new(10, 3)).unwrap();
        assert_eq!(ts[0].tok, Tok::Ident("foo".into()));
        assert_eq!(ts[0].pos, Pos::new(11, 3));
        assert_eq!(ts[1].tok, Tok::Ident("bar".into()));
        assert_eq!(ts[1].pos, Pos::new(12, 6));
        assert_eq!(&"// hi\n  foo /* x\ny */ bar"[ts[1].start..ts[1].end], "bar");
    }

    #[test]
    fn t_numbers() {
        assert_eq!(toks("1_000 3e2 7.25"),
                   vec![Tok::Int(1000), Tok::Float(300.), Tok::Float(7.25), Tok::Eof]);
        // `1.foo` is an int followed by a field access
        assert_eq!(toks("1.x"),
                   vec![Tok::Int(1), Tok::Punct(Punct::Dot), Tok::Ident("x".into()), Tok::Eof]);
        assert!(tokenize("99999999999999999999", Pos::START).is_err());
    }
}
