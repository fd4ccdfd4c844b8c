//! Line-based query language.
//!
//! ```text
//! # comments and blank lines are skipped
//! frames  = Const("video.mp4")
//! boxes   = Detect(frames; "yolo")
//! tracks  = Track(boxes; "0.5")
//! ```
//!
//! Every statement defines one node: `name = Operator(arg; arg; ...)`.
//! Double-quoted arguments are literals and may contain `;`, `(` and `)`;
//! `\"` and `\\` are the only escapes. Bare identifiers refer to nodes
//! defined on earlier lines.

use crate::error::{ParseError, ParseErrorKind};
use crate::graph::{Argument, Graph, Node};

/// Parses a whole query into a graph.
pub fn parse(query: &str) -> Result<Graph, ParseError> {
    let mut graph = Graph::new();

    for (i, line) in query.lines().enumerate() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fail = |kind| ParseError { line: i + 1, kind };

        let node = statement(line).map_err(fail)?;
        let node = graph.define(node).map_err(|e| fail(e.into()))?;

        tracing::debug!("parsed {node}");
    }

    Ok(graph)
}

fn statement(line: &str) -> Result<Node, ParseErrorKind> {
    let (name, rhs) = line
        .split_once('=')
        .ok_or(ParseErrorKind::MissingAssignment)?;

    let name = identifier(name.trim())?;

    let (operator, rest) = rhs
        .split_once('(')
        .ok_or(ParseErrorKind::MissingOpenParen)?;

    let operator = identifier(operator.trim())?;

    Ok(Node::new(name, operator, arguments(rest)?))
}

/// Parses everything after the opening parenthesis.
fn arguments(input: &str) -> Result<Vec<Argument>, ParseErrorKind> {
    let mut arguments = Vec::new();
    let mut rest = input.trim_start();

    if let Some(tail) = rest.strip_prefix(')') {
        return finish(tail).map(|()| arguments);
    }

    loop {
        if rest.is_empty() {
            return Err(ParseErrorKind::MissingCloseParen);
        }

        let (argument, tail) = match rest.strip_prefix('"') {
            Some(quoted) => {
                let (value, tail) = literal(quoted)?;
                let tail = tail.trim_start();

                if !tail.is_empty() && !tail.starts_with([';', ')']) {
                    return Err(ParseErrorKind::TrailingLiteral(tail.to_string()));
                }

                (Argument::Literal(value), tail)
            }
            None => {
                let end = rest.find([';', ')']).unwrap_or(rest.len());
                let token = rest[..end].trim();

                if token.is_empty() {
                    return Err(ParseErrorKind::EmptyArgument);
                }

                (Argument::Node(identifier(token)?.to_string()), &rest[end..])
            }
        };

        arguments.push(argument);

        if let Some(next) = tail.strip_prefix(';') {
            rest = next.trim_start();
        } else if let Some(tail) = tail.strip_prefix(')') {
            return finish(tail).map(|()| arguments);
        } else {
            return Err(ParseErrorKind::MissingCloseParen);
        }
    }
}

fn finish(tail: &str) -> Result<(), ParseErrorKind> {
    match tail.trim() {
        "" => Ok(()),
        extra => Err(ParseErrorKind::TrailingInput(extra.to_string())),
    }
}

/// Reads a literal up to its closing quote, returning the unescaped value
/// and whatever follows the quote.
fn literal(input: &str) -> Result<(String, &str), ParseErrorKind> {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &input[i + 1..])),
            '\\' => match chars.next() {
                Some((_, e @ ('"' | '\\'))) => value.push(e),
                Some((_, other)) => {
                    value.push('\\');
                    value.push(other);
                }
                None => break,
            },
            c => value.push(c),
        }
    }

    Err(ParseErrorKind::UnterminatedString)
}

fn identifier(token: &str) -> Result<&str, ParseErrorKind> {
    let mut chars = token.chars();

    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(token)
    } else {
        Err(ParseErrorKind::InvalidIdentifier(token.to_string()))
    }
}
