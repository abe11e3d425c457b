//! Cursor-relative text extraction. Character offsets count chars.

use std::sync::LazyLock;

use regex::Regex;

static LABEL_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@{0,2}[\w.~+-]*//[\w./+-]*(:[\w./+=,@~-]+)?|:[\w./+=,@~-]+").expect("Invalid label token regex")
});

/// A span of one line, in chars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub start: u32,
    pub end: u32,
}

pub fn line_at(text: &str, line: u32) -> Option<&str> {
    text.lines().nth(line as usize)
}

fn char_to_byte(line: &str, character: u32) -> usize {
    line.char_indices().nth(character as usize).map_or(line.len(), |(i, _)| i)
}

fn byte_to_char(line: &str, byte: usize) -> u32 {
    line[..byte].chars().count() as u32
}

/// Contents of the quoted string whose quotes enclose `character`.
pub fn string_literal_at(line: &str, character: u32) -> Option<Token> {
    let mut open: Option<(usize, char)> = None;
    let mut escaped = false;
    for (index, c) in line.chars().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match (open, c) {
            (Some(_), '\\') => escaped = true,
            (Some((start, quote)), c) if c == quote => {
                let end = index as u32;
                if (start as u32) < character && character <= end {
                    return Some(Token {
                        text: line.chars().skip(start + 1).take(index - start - 1).collect(),
                        start: start as u32 + 1,
                        end,
                    });
                }
                open = None;
            }
            (None, '"' | '\'') => open = Some((index, c)),
            (None, '#') => return None,
            _ => {}
        }
    }
    None
}

/// A label-shaped token (`//pkg:name`, `:name`, `@repo//pkg`) spanning
/// `character`.
pub fn label_token_at(line: &str, character: u32) -> Option<Token> {
    let cursor = char_to_byte(line, character);
    LABEL_TOKEN
        .find_iter(line)
        .find(|m| m.start() <= cursor && cursor <= m.end())
        .map(|m| Token { text: m.as_str().to_string(), start: byte_to_char(line, m.start()), end: byte_to_char(line, m.end()) })
}

/// Identifier characters immediately before `character`.
pub fn word_prefix_at(line: &str, character: u32) -> &str {
    let cursor = char_to_byte(line, character);
    let head = &line[..cursor];
    let start = head
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_alphanumeric() || *c == '_')
        .last()
        .map_or(cursor, |(i, _)| i);
    &head[start..]
}

/// Text of a string literal before `character`, if the cursor is inside one.
pub fn string_prefix_at(line: &str, character: u32) -> Option<String> {
    let cursor = char_to_byte(line, character);
    let head = &line[..cursor];
    let mut open: Option<(usize, char)> = None;
    for (index, c) in head.char_indices() {
        match open {
            Some((_, quote)) if c == quote => open = None,
            None if c == '"' || c == '\'' => open = Some((index, c)),
            _ => {}
        }
    }
    open.map(|(start, _)| head[start + 1..].to_string())
}
