//! Recursive descent over the token stream.
//!
//! The parser never fails hard: anything outside the native grammar is
//! reported as a [`Rejection`] and the expression is handed to the
//! scripting runtime instead.

use super::lexer::{Span, SpannedToken, Token};
use super::plan::{js_number, numeric_key, Element, Member, Node, Segment};
use serde_json::Value;

/// Nesting depth beyond which an expression is left to the runtime.
pub const MAX_DEPTH: usize = 128;

/// Names resolved through the prototype chain when a plain JSON value is read.
/// Reading them natively would yield `undefined` where the runtime yields a
/// function, so they may only appear as the last step of a path.
const PROTOTYPE_MEMBERS: &[&str] = &[
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
    "at",
    "charAt",
    "charCodeAt",
    "codePointAt",
    "concat",
    "copyWithin",
    "endsWith",
    "entries",
    "every",
    "fill",
    "filter",
    "find",
    "findIndex",
    "findLast",
    "findLastIndex",
    "flat",
    "flatMap",
    "forEach",
    "hasOwnProperty",
    "includes",
    "indexOf",
    "isPrototypeOf",
    "join",
    "keys",
    "lastIndexOf",
    "localeCompare",
    "map",
    "match",
    "matchAll",
    "normalize",
    "padEnd",
    "padStart",
    "pop",
    "propertyIsEnumerable",
    "push",
    "reduce",
    "reduceRight",
    "repeat",
    "replace",
    "replaceAll",
    "reverse",
    "search",
    "shift",
    "slice",
    "some",
    "sort",
    "splice",
    "split",
    "startsWith",
    "substr",
    "substring",
    "toExponential",
    "toFixed",
    "toLocaleLowerCase",
    "toLocaleString",
    "toLocaleUpperCase",
    "toLowerCase",
    "toPrecision",
    "toReversed",
    "toSorted",
    "toSpliced",
    "toString",
    "toUpperCase",
    "trim",
    "trimEnd",
    "trimStart",
    "unshift",
    "valueOf",
    "values",
    "with",
];

/// Names that are never handled natively, wherever they appear.
const RESERVED: &[&str] = &["__proto__", "constructor", "prototype"];

/// Why an expression is outside the native grammar.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub reason: String,
    pub span: Span,
}

pub struct Parser<'a> {
    source: &'a str,
    tokens: &'a [SpannedToken],
    pos: usize,
    depth: usize,
}

type ParseResult<T> = Result<T, Rejection>;

impl<'a> Parser<'a> {
    pub fn new(source: &'a str, tokens: &'a [SpannedToken]) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    /// Parses a whole program: `"return" [expr] [";"]` or a bare `expr`.
    ///
    /// A bare expression followed by `;` is a statement whose value a
    /// function body discards, so it is left to the runtime.
    pub fn parse_program(&mut self) -> ParseResult<Node> {
        let returns = matches!(self.tokens.first(), Some((Token::Return, _)));
        if let Some((Token::Return, span)) = self.tokens.first() {
            let span = span.clone();
            self.pos += 1;
            if let Some((_, next)) = self.tokens.get(self.pos) {
                // A line break after `return` ends the statement.
                let gap = &self.source[span.end..next.start];
                if gap.contains(['\n', '\r', '\u{2028}', '\u{2029}']) {
                    return Err(self.reject("line break after return"));
                }
            }
        }

        let node = if self.at_end() || self.check(&Token::Semicolon) {
            Node::Undefined
        } else {
            self.parse_expr()?
        };

        if self.check(&Token::Semicolon) && !returns {
            return Err(self.reject("expression statement without return"));
        }
        self.match_token(&Token::Semicolon);
        if !self.at_end() {
            return Err(self.reject(format!(
                "unexpected '{}' after expression",
                self.tokens[self.pos].0
            )));
        }
        Ok(node)
    }

    // === Utility methods ===

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| s.clone())
            .unwrap_or_else(|| self.source.len()..self.source.len())
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn match_token(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> ParseResult<()> {
        if self.match_token(token) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", token)))
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn reject(&self, reason: impl Into<String>) -> Rejection {
        Rejection {
            reason: reason.into(),
            span: self.peek_span(),
        }
    }

    fn unexpected(&self, expected: &str) -> Rejection {
        match self.peek() {
            Some(found) => self.reject(format!("expected {}, found '{}'", expected, found)),
            None => self.reject(format!("expected {}, found end of input", expected)),
        }
    }

    fn enter(&mut self) -> ParseResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.reject("expression nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // === Grammar ===

    fn parse_expr(&mut self) -> ParseResult<Node> {
        self.enter()?;
        let result = self.parse_postfix();
        self.leave();
        result
    }

    fn parse_postfix(&mut self) -> ParseResult<Node> {
        let base = self.parse_primary()?;
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let key = self.parse_name()?;
                    segments.push(Segment {
                        key,
                        optional: false,
                    });
                }
                Some(Token::OptionalDot) => {
                    self.pos += 1;
                    let key = if self.match_token(&Token::LBracket) {
                        self.parse_index()?
                    } else {
                        self.parse_name()?
                    };
                    segments.push(Segment {
                        key,
                        optional: true,
                    });
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let key = self.parse_index()?;
                    segments.push(Segment {
                        key,
                        optional: false,
                    });
                }
                Some(Token::LParen) => return Err(self.reject("function calls are not supported")),
                _ => break,
            }
        }

        if segments.is_empty() {
            return Ok(base);
        }
        if matches!(base, Node::Literal(_) | Node::Undefined) {
            return Err(self.reject("property access on a literal"));
        }
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            if RESERVED.contains(&segment.key.as_str())
                || (i < last && PROTOTYPE_MEMBERS.contains(&segment.key.as_str()))
            {
                return Err(self.reject(format!(
                    "property '{}' resolves through the prototype chain",
                    segment.key
                )));
            }
        }
        // `(a?.b).c` must not short-circuit `.c`, so parenthesised chains
        // are never merged into the outer one.
        Ok(Node::Path {
            base: Box::new(base),
            segments,
        })
    }

    /// `[` already consumed: a string or integer key followed by `]`.
    fn parse_index(&mut self) -> ParseResult<String> {
        let key = match self.advance() {
            Some(Token::String(s)) => s,
            Some(Token::Number(n)) => {
                numeric_key(n).ok_or_else(|| self.reject("non-integer numeric index"))?
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                return Err(self.reject("computed property access"));
            }
        };
        self.expect(&Token::RBracket)?;
        Ok(key)
    }

    /// Identifier after `.`; keywords are valid property names.
    fn parse_name(&mut self) -> ParseResult<String> {
        let name = match self.peek() {
            Some(Token::Ident(name)) => name.clone(),
            Some(Token::Return) => "return".to_string(),
            Some(Token::True) => "true".to_string(),
            Some(Token::False) => "false".to_string(),
            Some(Token::Null) => "null".to_string(),
            _ => return Err(self.unexpected("property name")),
        };
        self.pos += 1;
        Ok(name)
    }

    fn parse_primary(&mut self) -> ParseResult<Node> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => match name.as_str() {
                "$" => {
                    self.pos += 1;
                    Ok(Node::Input)
                }
                "undefined" => {
                    self.pos += 1;
                    Ok(Node::Undefined)
                }
                other => Err(self.reject(format!("unknown identifier '{}'", other))),
            },
            Some(Token::String(s)) => {
                self.pos += 1;
                Ok(Node::Literal(Value::String(s)))
            }
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(Node::Literal(js_number(n)))
            }
            Some(Token::Minus) => {
                self.pos += 1;
                match self.advance() {
                    Some(Token::Number(n)) => Ok(Node::Literal(js_number(-n))),
                    _ => Err(self.reject("unary minus is only supported on numbers")),
                }
            }
            Some(Token::True) => {
                self.pos += 1;
                Ok(Node::Literal(Value::Bool(true)))
            }
            Some(Token::False) => {
                self.pos += 1;
                Ok(Node::Literal(Value::Bool(false)))
            }
            Some(Token::Null) => {
                self.pos += 1;
                Ok(Node::Literal(Value::Null))
            }
            Some(Token::LBrace) => {
                self.pos += 1;
                self.parse_object()
            }
            Some(Token::LBracket) => {
                self.pos += 1;
                self.parse_array()
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Return) => Err(self.reject("multiple statements")),
            _ => Err(self.unexpected("expression")),
        }
    }

    /// `{` already consumed.
    fn parse_object(&mut self) -> ParseResult<Node> {
        let mut members = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.match_token(&Token::Ellipsis) {
                members.push(Member::Spread(self.parse_expr()?));
            } else {
                let key = self.parse_key()?;
                if !self.match_token(&Token::Colon) {
                    return Err(match self.peek() {
                        Some(Token::Comma) | Some(Token::RBrace) => {
                            self.reject("shorthand properties are not supported")
                        }
                        Some(Token::LParen) => self.reject("methods are not supported"),
                        _ => self.unexpected("':'"),
                    });
                }
                members.push(Member::Property(key, self.parse_expr()?));
            }
            if !self.match_token(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RBrace)?;
        Ok(Node::Object(members))
    }

    fn parse_key(&mut self) -> ParseResult<String> {
        let key = match self.peek().cloned() {
            Some(Token::String(s)) => s,
            Some(Token::Number(n)) => {
                numeric_key(n).ok_or_else(|| self.reject("non-integer numeric key"))?
            }
            Some(Token::LBracket) => return Err(self.reject("computed keys are not supported")),
            Some(_) => return self.parse_name().and_then(|name| self.check_key(name)),
            None => return Err(self.unexpected("property key")),
        };
        self.pos += 1;
        self.check_key(key)
    }

    fn check_key(&self, key: String) -> ParseResult<String> {
        if RESERVED.contains(&key.as_str()) {
            return Err(self.reject(format!("reserved key '{}'", key)));
        }
        Ok(key)
    }

    /// `[` already consumed.
    fn parse_array(&mut self) -> ParseResult<Node> {
        let mut elements = Vec::new();
        while !self.check(&Token::RBracket) {
            if self.check(&Token::Comma) {
                return Err(self.reject("array holes are not supported"));
            }
            if self.match_token(&Token::Ellipsis) {
                elements.push(Element::Spread(self.parse_expr()?));
            } else {
                elements.push(Element::Item(self.parse_expr()?));
            }
            if !self.match_token(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RBracket)?;
        Ok(Node::Array(elements))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::tokenize;
    use serde_json::json;

    fn parse(source: &str) -> ParseResult<Node> {
        let tokens = tokenize(source).unwrap();
        Parser::new(source, &tokens).parse_program()
    }

    fn path(keys: &[&str]) -> Node {
        Node::Path {
            base: Box::new(Node::Input),
            segments: keys
                .iter()
                .map(|k| Segment {
                    key: k.to_string(),
                    optional: false,
                })
                .collect(),
        }
    }

    #[test]
    fn test_spread_with_property() {
        assert_eq!(
            parse("return {...$, hello: $.id}").unwrap(),
            Node::Object(vec![
                Member::Spread(Node::Input),
                Member::Property("hello".to_string(), path(&["id"])),
            ])
        );
    }

    #[test]
    fn test_bare_expression_and_semicolon() {
        assert_eq!(parse("$.a.b").unwrap(), path(&["a", "b"]));
        assert_eq!(parse("return $.a.b;").unwrap(), path(&["a", "b"]));
        assert_eq!(parse("return;").unwrap(), Node::Undefined);
    }

    #[test]
    fn test_statement_without_return_is_rejected() {
        for source in ["$.id;", "{a: $.id};", ";"] {
            let rejection = parse(source).unwrap_err();
            assert_eq!(rejection.reason, "expression statement without return");
        }
    }

    #[test]
    fn test_bracket_access() {
        assert_eq!(
            parse(r#"$["user agent"][0]"#).unwrap(),
            path(&["user agent", "0"])
        );
    }

    #[test]
    fn test_optional_chain() {
        let node = parse("$?.a?.[1]").unwrap();
        let Node::Path { segments, .. } = node else {
            panic!("expected path");
        };
        assert!(segments.iter().all(|s| s.optional));
        assert_eq!(segments[1].key, "1");
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            parse("[1, -2.5, 'x', true, null, undefined]").unwrap(),
            Node::Array(vec![
                Element::Item(Node::Literal(json!(1))),
                Element::Item(Node::Literal(json!(-2.5))),
                Element::Item(Node::Literal(json!("x"))),
                Element::Item(Node::Literal(json!(true))),
                Element::Item(Node::Literal(Value::Null)),
                Element::Item(Node::Undefined),
            ])
        );
    }

    #[test]
    fn test_keyword_and_numeric_keys() {
        assert_eq!(
            parse("({return: 1, 2: $.null, 'k': 3,})").unwrap(),
            Node::Object(vec![
                Member::Property("return".to_string(), Node::Literal(json!(1))),
                Member::Property("2".to_string(), path(&["null"])),
                Member::Property("k".to_string(), Node::Literal(json!(3))),
            ])
        );
    }

    #[test]
    fn test_rejections() {
        for source in [
            "$.items.map(i)",
            "foo",
            "{a}",
            "{[$.k]: 1}",
            "return\n$.id",
            "$.a; $.b",
            "[1,,2]",
            "{__proto__: $}",
            "$.constructor",
            "$.toString.name",
            "'abc'.length",
            "$[$.k]",
            "-$.a",
        ] {
            assert!(parse(source).is_err(), "{source} should be rejected");
        }
    }

    #[test]
    fn test_prototype_member_allowed_last() {
        assert_eq!(parse("$.arr.map").unwrap(), path(&["arr", "map"]));
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}$.a{}", "[".repeat(MAX_DEPTH + 1), "]".repeat(MAX_DEPTH + 1));
        assert!(parse(&deep).is_err());
        let shallow = format!("{}$.a{}", "[".repeat(10), "]".repeat(10));
        assert!(parse(&shallow).is_ok());
    }
}
