//! Recursive descent parser for match-tree queries
//!
//! # Grammar
//!
//! ```text
//! or     := and ('|' and)*
//! and    := simple (('&' | ε) simple)*       adjacency implies and
//! simple := '-' simple | '(' or ')' | term
//! term   := token
//!         | token ':' token                  stream-qualified term
//!         | '"' token* '"'                   phrase
//!         | token ':' '"' token* '"'         stream-qualified phrase
//! ```
//!
//! Tokens end at whitespace or any of `&|():-"`; a backslash escapes each of
//! those plus itself. Errors carry the character offset they occurred at.

use std::collections::HashMap;

use crate::error::{BitGridError, Result};
use crate::index::types::StreamId;

/// Parsed match tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TermMatchNode {
    Unigram(String, StreamId),
    Phrase(Vec<String>, StreamId),
    And(Vec<TermMatchNode>),
    Or(Vec<TermMatchNode>),
    Not(Box<TermMatchNode>),
}

/// Maps a `token ':'` prefix to a stream
pub trait StreamResolver {
    fn resolve(&self, name: &str) -> Option<StreamId>;
}

/// Name-keyed stream resolver
#[derive(Clone, Debug, Default)]
pub struct StreamMap {
    streams: HashMap<String, StreamId>,
}

impl StreamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, stream: StreamId) {
        self.streams.insert(name.into(), stream);
    }
}

impl StreamResolver for StreamMap {
    fn resolve(&self, name: &str) -> Option<StreamId> {
        self.streams.get(name).copied()
    }
}

/// Characters that terminate a token unless escaped
const DELIMITERS: &[char] = &['&', '|', '(', ')', ':', '-', '"'];

/// Stream every unqualified term is drawn from
const DEFAULT_STREAM: StreamId = 0;

/// Parser for one query string
pub struct QueryParser<'a> {
    input: Vec<char>,
    position: usize,
    resolver: Option<&'a dyn StreamResolver>,
}

impl<'a> QueryParser<'a> {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
            resolver: None,
        }
    }

    /// Resolve `token ':'` prefixes through `resolver`; without one, every
    /// qualified term is a parse error
    pub fn with_stream_resolver(mut self, resolver: &'a dyn StreamResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Parse the whole input into a match tree
    pub fn parse(&mut self) -> Result<TermMatchNode> {
        let node = self.parse_or()?;
        self.skip_white();
        if let Some(c) = self.peek() {
            return Err(self.error(self.position, format!("unexpected '{}'", c)));
        }
        Ok(node)
    }

    fn parse_or(&mut self) -> Result<TermMatchNode> {
        let mut children = vec![self.parse_and()?];
        loop {
            self.skip_white();
            if self.peek() == Some('|') {
                self.advance();
                children.push(self.parse_and()?);
            } else {
                break;
            }
        }
        Ok(Self::collapse(children, TermMatchNode::Or))
    }

    fn parse_and(&mut self) -> Result<TermMatchNode> {
        let mut children = vec![self.parse_simple()?];
        loop {
            self.skip_white();
            match self.peek() {
                Some('&') => {
                    self.advance();
                    children.push(self.parse_simple()?);
                }
                // Anything but the end of the production is an implicit '&'.
                Some(')') | Some('|') | None => break,
                Some(_) => children.push(self.parse_simple()?),
            }
        }
        Ok(Self::collapse(children, TermMatchNode::And))
    }

    fn parse_simple(&mut self) -> Result<TermMatchNode> {
        self.skip_white();
        match self.peek() {
            Some('-') => {
                self.advance();
                self.skip_white();
                Ok(TermMatchNode::Not(Box::new(self.parse_simple()?)))
            }
            Some('(') => {
                self.advance();
                let node = self.parse_or()?;
                self.skip_white();
                self.expect_delimiter(')')?;
                Ok(node)
            }
            _ => self.parse_term(),
        }
    }

    fn parse_term(&mut self) -> Result<TermMatchNode> {
        self.skip_white();
        if self.peek() == Some('"') {
            return self.parse_phrase(DEFAULT_STREAM);
        }

        let start = self.position;
        let left = self.parse_token()?;
        if self.peek() == Some(':') {
            self.advance();
            let stream = self.resolve_stream(&left, start)?;
            if self.peek() == Some('"') {
                self.parse_phrase(stream)
            } else {
                let right = self.parse_token()?;
                Ok(TermMatchNode::Unigram(right, stream))
            }
        } else {
            Ok(TermMatchNode::Unigram(left, DEFAULT_STREAM))
        }
    }

    fn parse_phrase(&mut self, stream: StreamId) -> Result<TermMatchNode> {
        self.expect_delimiter('"')?;
        let mut grams = Vec::new();
        loop {
            self.skip_white();
            match self.peek() {
                Some('"') => {
                    self.advance();
                    break;
                }
                None => return Err(self.error(self.position, "expected '\"'".to_string())),
                _ => grams.push(self.parse_token()?),
            }
        }
        Ok(TermMatchNode::Phrase(grams, stream))
    }

    fn parse_token(&mut self) -> Result<String> {
        let start = self.position;
        let mut token = String::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() || DELIMITERS.contains(&c) {
                break;
            }
            self.advance();
            if c == '\\' {
                match self.peek() {
                    Some(escaped) if escaped == '\\' || DELIMITERS.contains(&escaped) => {
                        self.advance();
                        token.push(escaped);
                    }
                    _ => {
                        return Err(self.error(self.position, "bad escape character".to_string()))
                    }
                }
            } else {
                token.push(c);
            }
        }
        if token.is_empty() {
            return Err(self.error(start, "expected token".to_string()));
        }
        Ok(token)
    }

    fn resolve_stream(&self, name: &str, position: usize) -> Result<StreamId> {
        match self.resolver.and_then(|resolver| resolver.resolve(name)) {
            Some(stream) => Ok(stream),
            None => Err(self.error(position, format!("unknown stream '{}'", name))),
        }
    }

    fn collapse(
        mut children: Vec<TermMatchNode>,
        combine: fn(Vec<TermMatchNode>) -> TermMatchNode,
    ) -> TermMatchNode {
        if children.len() == 1 {
            children.remove(0)
        } else {
            combine(children)
        }
    }

    fn expect_delimiter(&mut self, expected: char) -> Result<()> {
        match self.peek() {
            Some(c) if c == expected => {
                self.advance();
                Ok(())
            }
            found => {
                let message = match found {
                    Some(c) => format!("expected '{}', got '{}'", expected, c),
                    None => format!("expected '{}'", expected),
                };
                Err(self.error(self.position, message))
            }
        }
    }

    fn skip_white(&mut self) {
        while self.peek().map_or(false, char::is_whitespace) {
            self.advance();
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn error(&self, position: usize, message: String) -> BitGridError {
        BitGridError::Parse { position, message }
    }
}
