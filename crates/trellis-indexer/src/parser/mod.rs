//! Build file parser
//!
//! `parse` never fails: the text is split into top-level chunks, each chunk
//! is parsed on its own, and a chunk that does not parse becomes a single
//! `Syntax` diagnostic covering the unparsable remainder of that chunk.

pub mod chunker;

use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;
use thiserror::Error;

use trellis_core::{Argument, Diagnostic, DiagnosticKind, Label, LoadedSymbol, Position, Range, Statement, StatementKind, Value};

#[derive(Parser)]
#[grammar = "parser/build.pest"]
struct BuildParser;

/// Statements and diagnostics recovered from one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFile {
    pub statements: Vec<Statement>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Grammar-shape mismatch while lowering the parse tree.
#[derive(Debug, Error)]
#[error("malformed {what} at byte {offset}")]
struct LowerError {
    what: &'static str,
    offset: usize,
}

/// Byte offset to line/character conversion for one source text.
/// Characters count Unicode scalar values.
#[derive(Debug, Clone)]
pub struct LineIndex<'a> {
    text: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    pub fn new(text: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
        LineIndex { text, line_starts }
    }

    pub fn position(&self, offset: usize) -> Position {
        let offset = offset.min(self.text.len());
        let line = self.line_starts.partition_point(|&start| start <= offset).saturating_sub(1);
        let start = self.line_starts[line];
        let character = self.text.get(start..offset).map_or(0, |s| s.chars().count());
        Position::new(line as u32, character as u32)
    }

    pub fn range(&self, start: usize, end: usize) -> Range {
        Range::new(self.position(start), self.position(end))
    }

    /// Byte offset of a position, clamped to the text.
    pub fn offset(&self, position: Position) -> usize {
        let Some(&start) = self.line_starts.get(position.line as usize) else {
            return self.text.len();
        };
        let line_end = self.line_starts.get(position.line as usize + 1).copied().unwrap_or(self.text.len());
        self.text[start..line_end]
            .char_indices()
            .nth(position.character as usize)
            .map_or(line_end, |(i, _)| start + i)
    }
}

/// Parse one file's text. Never aborts on malformed input.
pub fn parse(text: &str) -> ParsedFile {
    let index = LineIndex::new(text);
    let mut parsed = ParsedFile::default();

    for chunk in chunker::split(text) {
        let lowered = BuildParser::parse(Rule::chunk, chunk.text)
            .map_err(|err| syntax_diagnostic(&index, chunk, &err))
            .and_then(|mut pairs| {
                let lower = Lowering { index: &index, base: chunk.offset };
                let root = pairs.next().ok_or_else(|| {
                    Diagnostic::error(DiagnosticKind::Syntax, "empty parse", index.range(chunk.offset, chunk.offset))
                })?;
                lower.chunk(root).map_err(|err| {
                    let at = chunk.offset + err.offset;
                    Diagnostic::error(DiagnosticKind::Syntax, err.to_string(), index.range(at, chunk.offset + chunk.text.len()))
                })
            });

        match lowered {
            Ok(statements) => parsed.statements.extend(statements),
            Err(diagnostic) => {
                tracing::debug!("Skipping unparsable statement: {}", diagnostic);
                parsed.diagnostics.push(diagnostic);
            }
        }
    }
    parsed
}

fn syntax_diagnostic(index: &LineIndex<'_>, chunk: chunker::Chunk<'_>, err: &pest::error::Error<Rule>) -> Diagnostic {
    let local = match err.location {
        pest::error::InputLocation::Pos(pos) => pos,
        pest::error::InputLocation::Span((start, _)) => start,
    };
    let start = chunk.offset + local;
    let end = chunk.offset + chunk.text.trim_end().len();
    let message = match &err.variant {
        pest::error::ErrorVariant::ParsingError { positives, .. } if !positives.is_empty() => {
            let expected: Vec<String> = positives.iter().map(|r| describe(*r).to_string()).collect();
            format!("syntax error: expected {}", expected.join(" or "))
        }
        variant => format!("syntax error: {}", variant.message()),
    };
    Diagnostic::error(DiagnosticKind::Syntax, message, index.range(start, end.max(start)))
}

fn describe(rule: Rule) -> &'static str {
    match rule {
        Rule::expression | Rule::binary | Rule::unary | Rule::postfix | Rule::argument => "expression",
        Rule::identifier => "identifier",
        Rule::string => "string",
        Rule::bin_op => "operator",
        Rule::call => "`(`",
        Rule::EOI => "end of statement",
        Rule::assign_op => "`=`",
        Rule::dict_entry => "dict entry",
        _ => "token",
    }
}

/// Converts pest pairs of one chunk into model statements.
struct Lowering<'i> {
    index: &'i LineIndex<'i>,
    base: usize,
}

type Lowered<T> = Result<T, LowerError>;

impl Lowering<'_> {
    fn range(&self, pair: &Pair<'_, Rule>) -> Range {
        let span = pair.as_span();
        self.index.range(self.base + span.start(), self.base + span.end())
    }

    fn raw(&self, pair: &Pair<'_, Rule>) -> String {
        pair.as_str().to_string()
    }

    fn chunk(&self, pair: Pair<'_, Rule>) -> Lowered<Vec<Statement>> {
        let mut statements = Vec::new();
        for inner in pair.into_inner() {
            let range = self.range(&inner);
            let kind = match inner.as_rule() {
                Rule::load_stmt => Some(self.load(inner)?),
                Rule::assignment => Some(self.assignment(inner)?),
                Rule::expr_stmt => self.expression_statement(inner)?,
                _ => None,
            };
            if let Some(kind) = kind {
                statements.push(Statement { kind, range });
            }
        }
        Ok(statements)
    }

    fn load(&self, pair: Pair<'_, Rule>) -> Lowered<StatementKind> {
        let offset = pair.as_span().start();
        let mut inner = pair.into_inner();
        let module = inner
            .next()
            .map(|p| string_literal(&p))
            .ok_or(LowerError { what: "load", offset })?;

        let mut symbols = Vec::new();
        for arg in inner {
            match arg.as_rule() {
                Rule::string => {
                    let name = string_literal(&arg);
                    symbols.push(LoadedSymbol { local: name.clone(), exported: name });
                }
                Rule::load_alias => {
                    let offset = arg.as_span().start();
                    let mut parts = arg.into_inner();
                    let local = parts.next().map(|p| p.as_str().to_string());
                    let exported = parts.next().map(|p| string_literal(&p));
                    match (local, exported) {
                        (Some(local), Some(exported)) => symbols.push(LoadedSymbol { local, exported }),
                        _ => return Err(LowerError { what: "load alias", offset }),
                    }
                }
                _ => {}
            }
        }
        Ok(StatementKind::Load { module, symbols })
    }

    fn assignment(&self, pair: Pair<'_, Rule>) -> Lowered<StatementKind> {
        let offset = pair.as_span().start();
        let mut inner = pair.into_inner();
        let (Some(lhs), Some(op), Some(rhs)) = (inner.next(), inner.next(), inner.next()) else {
            return Err(LowerError { what: "assignment", offset });
        };
        let names: Vec<&str> = lhs.into_inner().map(|p| p.as_str()).collect();
        let name = names.join(", ");
        let value = self.expression(rhs)?;
        let value = if op.as_str() == "+=" {
            Value::Concat(vec![Value::Identifier(name.clone()), value])
        } else {
            value
        };
        Ok(StatementKind::Assignment { name, value })
    }

    /// Only call expressions are statements worth keeping; docstrings and
    /// other bare expressions are dropped.
    fn expression_statement(&self, pair: Pair<'_, Rule>) -> Lowered<Option<StatementKind>> {
        let offset = pair.as_span().start();
        let expression = pair.into_inner().next().ok_or(LowerError { what: "statement", offset })?;
        Ok(match self.expression(expression)? {
            Value::Call { name, arguments } => Some(StatementKind::RuleInvocation { kind: name, arguments }),
            _ => None,
        })
    }

    fn expression(&self, pair: Pair<'_, Rule>) -> Lowered<Value> {
        let raw = self.raw(&pair);
        let offset = pair.as_span().start();
        let mut inner = pair.into_inner();
        let binary = inner.next().ok_or(LowerError { what: "expression", offset })?;
        if inner.next().is_some() {
            // `a if cond else b`
            return Ok(Value::Expression(raw));
        }
        self.binary(binary)
    }

    fn binary(&self, pair: Pair<'_, Rule>) -> Lowered<Value> {
        let raw = self.raw(&pair);
        let mut operands = Vec::new();
        let mut only_plus = true;
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::bin_op => only_plus &= inner.as_str() == "+",
                _ => operands.push(inner),
            }
        }
        if operands.len() == 1 {
            if let Some(single) = operands.pop() {
                return self.unary(single);
            }
        }
        if !only_plus {
            return Ok(Value::Expression(raw));
        }
        let parts = operands.into_iter().map(|p| self.unary(p)).collect::<Lowered<Vec<_>>>()?;
        Ok(Value::Concat(parts))
    }

    fn unary(&self, pair: Pair<'_, Rule>) -> Lowered<Value> {
        let raw = self.raw(&pair);
        let offset = pair.as_span().start();
        let mut ops = Vec::new();
        let mut postfix = None;
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::unary_op => ops.push(inner.as_str().to_string()),
                _ => postfix = Some(inner),
            }
        }
        let value = self.postfix(postfix.ok_or(LowerError { what: "operand", offset })?)?;
        match (ops.as_slice(), &value) {
            ([], _) => Ok(value),
            ([op], Value::Number(n)) if op == "-" => Ok(Value::Number(-n)),
            ([op], Value::Number(n)) if op == "+" => Ok(Value::Number(*n)),
            _ => Ok(Value::Expression(raw)),
        }
    }

    fn postfix(&self, pair: Pair<'_, Rule>) -> Lowered<Value> {
        let raw = self.raw(&pair);
        let offset = pair.as_span().start();
        let mut inner = pair.into_inner();
        let primary = inner.next().ok_or(LowerError { what: "operand", offset })?;
        let suffixes: Vec<Pair<'_, Rule>> = inner.collect();

        if suffixes.is_empty() {
            return self.primary(primary);
        }
        if primary.as_rule() != Rule::identifier {
            return Ok(Value::Expression(raw));
        }

        // Dotted callee: `native.cc_library(...)`.
        let mut name = primary.as_str().to_string();
        let mut rest = suffixes.into_iter().peekable();
        while let Some(suffix) = rest.next_if(|s| s.as_rule() == Rule::attribute) {
            if let Some(ident) = suffix.into_inner().next() {
                name.push('.');
                name.push_str(ident.as_str());
            }
        }
        let Some(call) = rest.next() else {
            return Ok(Value::Identifier(name));
        };
        if call.as_rule() != Rule::call || rest.next().is_some() {
            return Ok(Value::Expression(raw));
        }

        let arguments = call.into_inner().map(|a| self.argument(a)).collect::<Lowered<Vec<_>>>()?;
        Ok(structural_call(name, arguments))
    }

    fn argument(&self, pair: Pair<'_, Rule>) -> Lowered<Argument> {
        let range = self.range(&pair);
        let offset = pair.as_span().start();
        let inner = pair.into_inner().next().ok_or(LowerError { what: "argument", offset })?;
        match inner.as_rule() {
            Rule::kwarg => {
                let mut parts = inner.into_inner();
                let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
                    return Err(LowerError { what: "keyword argument", offset });
                };
                Ok(Argument { name: Some(name.as_str().to_string()), value: self.expression(value)?, range })
            }
            Rule::star_arg => Ok(Argument { name: None, value: Value::Expression(self.raw(&inner)), range }),
            _ => Ok(Argument { name: None, value: self.expression(inner)?, range }),
        }
    }

    fn primary(&self, pair: Pair<'_, Rule>) -> Lowered<Value> {
        let offset = pair.as_span().start();
        match pair.as_rule() {
            Rule::string => {
                let text = string_literal(&pair);
                if Label::is_label_shaped(&text) {
                    Ok(Value::TargetReference(text))
                } else {
                    Ok(Value::String(text))
                }
            }
            Rule::number => parse_number(pair.as_str())
                .map(Value::Number)
                .ok_or(LowerError { what: "number", offset }),
            Rule::identifier => Ok(match pair.as_str() {
                "True" => Value::Boolean(true),
                "False" => Value::Boolean(false),
                "None" => Value::None,
                other => Value::Identifier(other.to_string()),
            }),
            Rule::list => {
                if has_comprehension(&pair) {
                    return Ok(Value::Expression(self.raw(&pair)));
                }
                let items = pair.into_inner().map(|p| self.expression(p)).collect::<Lowered<Vec<_>>>()?;
                Ok(Value::List(items))
            }
            Rule::dict => {
                if has_comprehension(&pair) {
                    return Ok(Value::Expression(self.raw(&pair)));
                }
                let entries = pair.into_inner().map(|e| self.dict_entry(e)).collect::<Lowered<Vec<_>>>()?;
                Ok(Value::Dict(entries))
            }
            Rule::paren => {
                if has_comprehension(&pair) {
                    return Ok(Value::Expression(self.raw(&pair)));
                }
                let mut tuple = false;
                let mut items = Vec::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::trailing_comma => tuple = true,
                        _ => items.push(self.expression(inner)?),
                    }
                }
                if items.len() == 1 && !tuple {
                    Ok(items.remove(0))
                } else {
                    Ok(Value::List(items))
                }
            }
            _ => Ok(Value::Expression(self.raw(&pair))),
        }
    }

    fn dict_entry(&self, pair: Pair<'_, Rule>) -> Lowered<(Value, Value)> {
        let offset = pair.as_span().start();
        let mut parts = pair.into_inner();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            return Err(LowerError { what: "dict entry", offset });
        };
        Ok((self.expression(key)?, self.expression(value)?))
    }
}

/// `glob` and `select` keep their shape; everything else is a plain call.
fn structural_call(name: String, arguments: Vec<Argument>) -> Value {
    let callee = name.rsplit('.').next().unwrap_or_default().to_string();
    match callee.as_str() {
        "glob" => {
            let list_items = |value: &Value| match value {
                Value::List(items) => items.clone(),
                other => vec![other.clone()],
            };
            let include = arguments
                .iter()
                .find(|a| a.name.is_none() || a.name.as_deref() == Some("include"))
                .map(|a| list_items(&a.value))
                .unwrap_or_default();
            let exclude = arguments
                .iter()
                .find(|a| a.name.as_deref() == Some("exclude"))
                .map(|a| list_items(&a.value))
                .unwrap_or_default();
            Value::Glob { include, exclude }
        }
        "select" => {
            if let Some(Value::Dict(entries)) = arguments.first().map(|a| &a.value) {
                return Value::Select(entries.clone());
            }
            Value::Call { name, arguments }
        }
        _ => Value::Call { name, arguments },
    }
}

fn has_comprehension(pair: &Pair<'_, Rule>) -> bool {
    pair.clone().into_inner().any(|p| p.as_rule() == Rule::comprehension)
}

fn parse_number(text: &str) -> Option<f64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    text.parse().ok()
}

/// Decoded contents of a `string` pair.
fn string_literal(pair: &Pair<'_, Rule>) -> String {
    let mut raw = false;
    let mut body = "";
    for inner in pair.clone().into_inner() {
        match inner.as_rule() {
            Rule::string_prefix => raw = inner.as_str().contains(['r', 'R']),
            _ => {
                if let Some(b) = inner.into_inner().next() {
                    body = b.as_str();
                }
            }
        }
    }
    if raw { body.to_string() } else { unescape(body) }
}

fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\n') => {}
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(ch) => out.push(ch),
                    None => {
                        out.push_str("\\x");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
