//! Tokens of the native expression grammar, produced with logos.
//!
//! Anything the lexer does not recognise (operators, template literals,
//! regular expressions, non-ASCII identifiers) is reported as an error and
//! makes the expression fall back to the scripting runtime.

use logos::Logos;

/// Byte range in the expression source.
pub type Span = std::ops::Range<usize>;

/// A token together with its source span.
pub type SpannedToken = (Token, Span);

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
pub enum Token {
    #[token("return")]
    Return,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    #[regex(r"[A-Za-z_$][A-Za-z0-9_$]*", |lex| lex.slice().to_string(), priority = 0)]
    Ident(String),

    #[regex(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?", lex_number)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", lex_number)]
    Number(f64),

    #[regex(r#""([^"\\\n]|\\.)*""#, lex_string)]
    #[regex(r"'([^'\\\n]|\\.)*'", lex_string)]
    String(String),

    #[token("...")]
    Ellipsis,
    #[token("?.")]
    OptionalDot,
    #[token(".")]
    Dot,
    #[token("-")]
    Minus,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Return => write!(f, "return"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Null => write!(f, "null"),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "{:?}", s),
            Token::Ellipsis => write!(f, "..."),
            Token::OptionalDot => write!(f, "?."),
            Token::Dot => write!(f, "."),
            Token::Minus => write!(f, "-"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Semicolon => write!(f, ";"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
        }
    }
}

/// Tokenizes the whole source, stopping at the first unrecognised input.
pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>, Span> {
    let mut tokens = Vec::new();
    for (token, span) in Token::lexer(source).spanned() {
        match token {
            Ok(token) => tokens.push((token, span)),
            Err(()) => return Err(span),
        }
    }
    Ok(tokens)
}

fn lex_number(lex: &mut logos::Lexer<Token>) -> Option<f64> {
    let slice = lex.slice();
    // Legacy octal literals are not plain decimals.
    if slice.len() > 1 && slice.starts_with('0') && slice.as_bytes()[1].is_ascii_digit() {
        return None;
    }
    slice.parse().ok()
}

fn lex_string(lex: &mut logos::Lexer<Token>) -> Option<String> {
    let slice = lex.slice();
    unescape(&slice[1..slice.len() - 1])
}

/// Resolves JavaScript string escapes. Returns `None` for escapes the
/// grammar does not accept (octal, line continuations, lone surrogates).
fn unescape(body: &str) -> Option<String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '0' if !chars.peek().is_some_and(|c| c.is_ascii_digit()) => out.push('\0'),
            'x' => {
                let hex: String = [chars.next()?, chars.next()?].iter().collect();
                out.push(char::from_u32(u32::from_str_radix(&hex, 16).ok()?)?);
            }
            'u' => {
                let unit = read_unicode_escape(&mut chars)?;
                if (0xD800..0xDC00).contains(&unit) {
                    // High surrogate must be followed by an escaped low surrogate.
                    if chars.next()? != '\\' || chars.next()? != 'u' {
                        return None;
                    }
                    let low = read_unicode_escape(&mut chars)?;
                    if !(0xDC00..0xE000).contains(&low) {
                        return None;
                    }
                    let code = 0x10000 + ((unit - 0xD800) << 10) + (low - 0xDC00);
                    out.push(char::from_u32(code)?);
                } else {
                    out.push(char::from_u32(unit)?);
                }
            }
            c if c.is_ascii_digit() => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

fn read_unicode_escape(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<u32> {
    if chars.peek() == Some(&'{') {
        chars.next();
        let mut hex = String::new();
        loop {
            match chars.next()? {
                '}' => break,
                c => hex.push(c),
            }
        }
        if hex.is_empty() || hex.len() > 6 {
            return None;
        }
        return u32::from_str_radix(&hex, 16).ok().filter(|code| *code <= 0x10FFFF);
    }
    let hex: String = [chars.next()?, chars.next()?, chars.next()?, chars.next()?]
        .iter()
        .collect();
    u32::from_str_radix(&hex, 16).ok()
}
