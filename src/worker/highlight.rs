//! Syntax highlighting using tree-sitter
//!
//! Produces, for every line of a file version:
//! - A packed token stream: repeated `(kind: u8, byte length: LEB128)`
//!   covering the whole line
//!
//! and for the file as a whole:
//! - Code contexts: definitions with their line span and signature label
//!
//! With the conflicts flag set, merge conflict marker lines are blanked before
//! parsing and emitted as a single conflict-marker token.

use super::language::Language;
use anyhow::{anyhow, bail, Context, Result};
use std::borrow::Cow;
use std::ops::Range;

/// Kind of a highlighted token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenKind {
    Plain = 0,
    Keyword = 1,
    Identifier = 2,
    String = 3,
    Comment = 4,
    Number = 5,
    Operator = 6,
    Punctuation = 7,
    Type = 8,
    ConflictMarker = 9,
}

impl TokenKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => TokenKind::Plain,
            1 => TokenKind::Keyword,
            2 => TokenKind::Identifier,
            3 => TokenKind::String,
            4 => TokenKind::Comment,
            5 => TokenKind::Number,
            6 => TokenKind::Operator,
            7 => TokenKind::Punctuation,
            8 => TokenKind::Type,
            9 => TokenKind::ConflictMarker,
            _ => return None,
        })
    }
}

/// A run of bytes of one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub length: usize,
}

/// A definition spanning `first_line..=last_line` (0-based)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeContext {
    pub first_line: usize,
    pub last_line: usize,
    pub label: String,
}

/// Output of highlighting one file version
#[derive(Debug, Clone, Default)]
pub struct HighlightedFile {
    /// Packed tokens, one entry per line
    pub lines: Vec<Vec<u8>>,
    pub contexts: Vec<CodeContext>,
}

/// Encode tokens as `(kind, LEB128 length)` pairs
pub fn pack_tokens(tokens: &[Token]) -> Vec<u8> {
    let mut data = Vec::with_capacity(tokens.len() * 2);
    for token in tokens {
        data.push(token.kind as u8);
        let mut length = token.length;
        loop {
            let byte = (length & 0x7f) as u8;
            length >>= 7;
            if length == 0 {
                data.push(byte);
                break;
            }
            data.push(byte | 0x80);
        }
    }
    data
}

/// Decode a packed token stream
pub fn unpack_tokens(data: &[u8]) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut bytes = data.iter();

    while let Some(&kind) = bytes.next() {
        let kind = TokenKind::from_u8(kind).ok_or_else(|| anyhow!("Unknown token kind {}", kind))?;
        let mut length = 0usize;
        let mut shift = 0;
        loop {
            let Some(&byte) = bytes.next() else {
                bail!("Truncated token length");
            };
            if shift >= usize::BITS {
                bail!("Token length overflows");
            }
            length |= ((byte & 0x7f) as usize) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        tokens.push(Token { kind, length });
    }

    Ok(tokens)
}

/// Decode file contents using the first encoding that fits; the last one is
/// forced with replacement characters
pub fn decode(data: &[u8], encodings: &[String]) -> String {
    let last = encodings.len().saturating_sub(1);

    for (index, encoding) in encodings.iter().enumerate() {
        let forced = index == last;
        match encoding.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => match std::str::from_utf8(data) {
                Ok(text) => return text.to_string(),
                Err(_) if forced => return String::from_utf8_lossy(data).into_owned(),
                Err(_) => continue,
            },
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => {
                return data.iter().map(|&b| b as char).collect();
            }
            _ => continue,
        }
    }

    String::from_utf8_lossy(data).into_owned()
}

fn is_conflict_marker(line: &str) -> bool {
    ["<<<<<<<", "=======", ">>>>>>>", "|||||||"]
        .iter()
        .any(|marker| line.starts_with(marker))
}

/// Byte ranges of lines without terminators, matching `diff::split_lines`
fn line_ranges(source: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    if source.is_empty() {
        return ranges;
    }
    let mut start = 0;
    for (pos, byte) in source.bytes().enumerate() {
        if byte == b'\n' {
            ranges.push(start..pos);
            start = pos + 1;
        }
    }
    if start < source.len() {
        ranges.push(start..source.len());
    }
    ranges
}

/// Highlights source files
pub struct Highlighter {
    rust_parser: tree_sitter::Parser,
    python_parser: tree_sitter::Parser,
}

impl Highlighter {
    /// Create a new highlighter
    pub fn new() -> Result<Self> {
        let mut rust_parser = tree_sitter::Parser::new();
        rust_parser
            .set_language(&Language::Rust.tree_sitter_language())
            .context("Failed to set Rust language")?;

        let mut python_parser = tree_sitter::Parser::new();
        python_parser
            .set_language(&Language::Python.tree_sitter_language())
            .context("Failed to set Python language")?;

        Ok(Self {
            rust_parser,
            python_parser,
        })
    }

    /// Highlight one file version
    pub fn highlight(
        &mut self,
        source: &str,
        language: Language,
        conflicts: bool,
    ) -> Result<HighlightedFile> {
        let lines = line_ranges(source);

        let markers: Vec<bool> = lines
            .iter()
            .map(|range| conflicts && is_conflict_marker(&source[range.clone()]))
            .collect();

        let parse_source: Cow<'_, str> = if markers.iter().any(|&m| m) {
            let mut blanked = source.as_bytes().to_vec();
            for (range, _) in lines.iter().zip(&markers).filter(|(_, &m)| m) {
                blanked[range.clone()].fill(b' ');
            }
            // Marker lines are ASCII, so blanking keeps the text valid UTF-8
            Cow::Owned(String::from_utf8(blanked).context("Failed to blank conflict markers")?)
        } else {
            Cow::Borrowed(source)
        };

        let parser = match language {
            Language::Rust => &mut self.rust_parser,
            Language::Python => &mut self.python_parser,
        };
        let tree = parser
            .parse(parse_source.as_ref(), None)
            .ok_or_else(|| anyhow!("Failed to parse {} source", language))?;

        let mut spans = Vec::new();
        collect_spans(tree.root_node(), &mut spans);
        spans.sort_by_key(|(range, _)| range.start);

        let mut packed = Vec::with_capacity(lines.len());
        let mut first = 0;
        for (range, &marker) in lines.iter().zip(&markers) {
            if marker {
                packed.push(pack_tokens(&[Token {
                    kind: TokenKind::ConflictMarker,
                    length: range.len(),
                }]));
                continue;
            }
            while first < spans.len() && spans[first].0.end <= range.start {
                first += 1;
            }
            packed.push(pack_tokens(&line_tokens(range, &spans[first..])));
        }

        let mut contexts = Vec::new();
        collect_contexts(tree.root_node(), parse_source.as_ref(), language, &mut contexts);

        Ok(HighlightedFile {
            lines: packed,
            contexts,
        })
    }
}

/// Tokens covering one line, gaps filled with plain text
fn line_tokens(line: &Range<usize>, spans: &[(Range<usize>, TokenKind)]) -> Vec<Token> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut cursor = line.start;

    let mut push = |kind: TokenKind, length: usize| {
        if length == 0 {
            return;
        }
        match tokens.last_mut() {
            Some(last) if last.kind == kind => last.length += length,
            _ => tokens.push(Token { kind, length }),
        }
    };

    for (span, kind) in spans {
        if span.start >= line.end {
            break;
        }
        let start = span.start.max(cursor);
        let end = span.end.min(line.end);
        if start >= end {
            continue;
        }
        push(TokenKind::Plain, start - cursor);
        push(*kind, end - start);
        cursor = end;
    }
    push(TokenKind::Plain, line.end.saturating_sub(cursor));

    tokens
}

/// Nodes highlighted as a whole, without descending
fn whole_node_kind(kind: &str) -> Option<TokenKind> {
    match kind {
        "string_literal" | "raw_string_literal" | "char_literal" | "string" => {
            Some(TokenKind::String)
        }
        "line_comment" | "block_comment" | "comment" => Some(TokenKind::Comment),
        _ => None,
    }
}

fn leaf_kind(node: tree_sitter::Node) -> Option<TokenKind> {
    let kind = node.kind();
    if !node.is_named() {
        let first = kind.chars().next()?;
        return Some(if first.is_alphabetic() || first == '_' {
            TokenKind::Keyword
        } else if matches!(
            kind,
            "(" | ")" | "[" | "]" | "{" | "}" | "," | ";" | ":" | "." | "::" | "#"
        ) {
            TokenKind::Punctuation
        } else {
            TokenKind::Operator
        });
    }

    match kind {
        "identifier" | "field_identifier" | "shorthand_field_identifier" => {
            Some(TokenKind::Identifier)
        }
        "type_identifier" | "primitive_type" => Some(TokenKind::Type),
        "integer_literal" | "float_literal" | "integer" | "float" => Some(TokenKind::Number),
        "self" | "super" | "crate" | "mutable_specifier" | "true" | "false" | "none" => {
            Some(TokenKind::Keyword)
        }
        _ => None,
    }
}

fn collect_spans(node: tree_sitter::Node, spans: &mut Vec<(Range<usize>, TokenKind)>) {
    if let Some(kind) = whole_node_kind(node.kind()) {
        spans.push((node.start_byte()..node.end_byte(), kind));
        return;
    }

    if node.child_count() == 0 {
        if let Some(kind) = leaf_kind(node) {
            if node.end_byte() > node.start_byte() {
                spans.push((node.start_byte()..node.end_byte(), kind));
            }
        }
        return;
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_spans(child, spans);
    }
}

fn is_definition(kind: &str, language: Language) -> bool {
    match language {
        Language::Rust => matches!(
            kind,
            "function_item" | "impl_item" | "struct_item" | "enum_item" | "trait_item" | "mod_item"
        ),
        Language::Python => matches!(kind, "function_definition" | "class_definition"),
    }
}

/// Definition text up to its body, whitespace collapsed
fn signature(node: tree_sitter::Node, source: &str) -> Option<String> {
    let end = node
        .child_by_field_name("body")
        .map(|body| body.start_byte())
        .unwrap_or_else(|| node.end_byte());
    let text = source.get(node.start_byte()..end)?;
    let label = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(':')
        .trim_end()
        .to_string();
    (!label.is_empty()).then_some(label)
}

fn collect_contexts(
    node: tree_sitter::Node,
    source: &str,
    language: Language,
    contexts: &mut Vec<CodeContext>,
) {
    if is_definition(node.kind(), language) {
        if let Some(label) = signature(node, source) {
            contexts.push(CodeContext {
                first_line: node.start_position().row,
                last_line: node.end_position().row,
                label,
            });
        }
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_contexts(child, source, language, contexts);
    }
}
