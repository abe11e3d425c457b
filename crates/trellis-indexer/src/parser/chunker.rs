//! Splits a file into top-level statement chunks
//!
//! A chunk ends at a newline seen outside any bracket or string when the
//! next line starts in column 0 with something other than a comment or a
//! closing bracket. Chunks are parsed independently so one broken
//! statement cannot take the rest of the file down with it.
//!
//! Inside an unclosed bracket a column-0 line that opens a call
//! (`name(`) still starts a new chunk, as does an assignment (`name =`)
//! after a blank line. The bracket count resets there, so a statement the
//! user is still typing only costs that statement.

/// A slice of the source and its byte offset in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub offset: usize,
    pub text: &'a str,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    Single(u8),
    Triple(u8),
}

pub fn split(source: &str) -> Vec<Chunk<'_>> {
    let bytes = source.as_bytes();
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut depth: usize = 0;
    let mut quote: Option<Quote> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(Quote::Single(q)) => {
                if b == b'\\' {
                    i += 2;
                    continue;
                }
                // An unterminated short string ends at the line break.
                if b == q || b == b'\n' {
                    quote = None;
                    if b == b'\n' {
                        continue;
                    }
                }
            }
            Some(Quote::Triple(q)) => {
                if b == b'\\' {
                    i += 2;
                    continue;
                }
                if b == q && bytes.get(i + 1) == Some(&q) && bytes.get(i + 2) == Some(&q) {
                    quote = None;
                    i += 3;
                    continue;
                }
            }
            None => match b {
                b'#' => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                    continue;
                }
                b'"' | b'\'' => {
                    if bytes.get(i + 1) == Some(&b) && bytes.get(i + 2) == Some(&b) {
                        quote = Some(Quote::Triple(b));
                        i += 3;
                        continue;
                    }
                    quote = Some(Quote::Single(b));
                }
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => depth = depth.saturating_sub(1),
                b'\n' if !continued_line(bytes, i) && boundary(bytes, i, depth) => {
                    if !source[start..=i].trim().is_empty() {
                        chunks.push(Chunk { offset: start, text: &source[start..=i] });
                    }
                    start = i + 1;
                    depth = 0;
                }
                _ => {}
            },
        }
        i += 1;
    }

    if start < source.len() && !source[start..].trim().is_empty() {
        chunks.push(Chunk { offset: start, text: &source[start..] });
    }
    chunks
}

/// True if the newline at `newline` follows a backslash continuation.
fn continued_line(bytes: &[u8], newline: usize) -> bool {
    let before = if newline > 0 && bytes[newline - 1] == b'\r' { newline.saturating_sub(2) } else { newline.saturating_sub(1) };
    newline > 0 && bytes.get(before) == Some(&b'\\')
}

fn boundary(bytes: &[u8], newline: usize, depth: usize) -> bool {
    let next = newline + 1;
    if depth == 0 {
        return starts_statement(bytes, next);
    }
    match statement_head(bytes, next) {
        Some(Head::Call) => true,
        Some(Head::Assign) => line_blank_before(bytes, newline),
        None => false,
    }
}

enum Head {
    Call,
    Assign,
}

/// `identifier(` or `identifier =` starting at `line_start`.
fn statement_head(bytes: &[u8], line_start: usize) -> Option<Head> {
    let first = *bytes.get(line_start)?;
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return None;
    }
    let mut i = line_start + 1;
    while bytes.get(i).is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_') {
        i += 1;
    }
    while matches!(bytes.get(i), Some(b' ' | b'\t')) {
        i += 1;
    }
    match (bytes.get(i), bytes.get(i + 1)) {
        (Some(b'('), _) => Some(Head::Call),
        (Some(b'='), next) if next != Some(&b'=') => Some(Head::Assign),
        _ => None,
    }
}

/// True if the line ending at `newline` holds only whitespace.
fn line_blank_before(bytes: &[u8], newline: usize) -> bool {
    let start = bytes[..newline].iter().rposition(|b| *b == b'\n').map_or(0, |p| p + 1);
    bytes[start..newline].iter().all(u8::is_ascii_whitespace)
}

fn starts_statement(bytes: &[u8], line_start: usize) -> bool {
    match bytes.get(line_start) {
        None => false,
        Some(b) => !matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b'#' | b')' | b']' | b'}'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(source: &str) -> Vec<&str> {
        split(source).into_iter().map(|c| c.text.trim()).collect()
    }

    #[test]
    fn test_splits_top_level_statements() {
        let source = "load(\"//x:defs.bzl\", \"rule\")\n\nrule(\n    name = \"a\",\n)\nX = [1,\n2]\n";
        assert_eq!(
            texts(source),
            vec!["load(\"//x:defs.bzl\", \"rule\")", "rule(\n    name = \"a\",\n)", "X = [1,\n2]"]
        );
    }

    #[test]
    fn test_brackets_inside_strings_and_comments_are_ignored() {
        let source = "a(name = \"(\")  # )\nb(srcs = ['''\n]\n'''])\nc()\n";
        let chunks = texts(source);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[1].starts_with("b("));
    }

    #[test]
    fn test_offsets_point_into_source() {
        let source = "a()\nb()\n";
        let chunks = split(source);
        assert_eq!(chunks[1].offset, 4);
        assert_eq!(&source[chunks[1].offset..chunks[1].offset + 3], "b()");
    }

    #[test]
    fn test_unterminated_call_ends_at_next_call() {
        let source = "go_library(name = \"a\"\n\ngo_library(name = \"b\")\n\ngo_library(name = \"c\")\n";
        assert_eq!(
            texts(source),
            vec!["go_library(name = \"a\"", "go_library(name = \"b\")", "go_library(name = \"c\")"]
        );
    }

    #[test]
    fn test_unterminated_list_ends_at_assignment_after_blank_line() {
        let source = "X = [1,\n\nY = 2\nz()\n";
        assert_eq!(texts(source), vec!["X = [1,", "Y = 2", "z()"]);
    }

    #[test]
    fn test_column_zero_keyword_stays_inside_call() {
        let source = "a(\nname = \"x\",\nsrcs = [\"x.go\"],\n)\nb()\n";
        assert_eq!(texts(source), vec!["a(\nname = \"x\",\nsrcs = [\"x.go\"],\n)", "b()"]);
    }

    #[test]
    fn test_column_zero_closer_stays_attached() {
        let source = "a(\n    name = \"x\",\n)\nb()\n";
        assert_eq!(texts(source), vec!["a(\n    name = \"x\",\n)", "b()"]);
    }
}
