//! Static discovery of a script's tunable top-level values.
//!
//! Only module-level statements of the form `name = literal` (optionally
//! annotated or chained) are recognised. The script is tokenised with enough
//! of the language grammar to find statement boundaries and reject malformed
//! input; nothing is ever evaluated.

use crate::error::AnalysisError;
use crate::kind::{ParamKind, ParamValue};
use crate::notebook;
use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub kind: ParamKind,
    pub default: ParamValue,
    /// Position among recognised parameters, in source order.
    pub declaration_order: usize,
    /// 1-based line of the assignment that supplied `default`.
    pub line: usize,
}

/// Ordered, name-unique set of parameters for one script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    params: Vec<Parameter>,
}

impl Schema {
    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Record a literal assignment. A repeated name keeps its original
    /// position and takes the later value.
    fn assign(&mut self, name: &str, kind: ParamKind, default: ParamValue, line: usize) {
        if let Some(existing) = self.params.iter_mut().find(|p| p.name == name) {
            existing.kind = kind;
            existing.default = default;
            existing.line = line;
            return;
        }
        let declaration_order = self.params.len();
        self.params.push(Parameter {
            name: name.to_string(),
            kind,
            default,
            declaration_order,
            line,
        });
    }

    /// Rewrite string defaults that name an existing path relative to
    /// `base_dir` into absolute paths. Runs execute from their own report
    /// directory, so relative paths would otherwise dangle.
    pub fn expand_existing_paths(&mut self, base_dir: &Path) {
        for param in &mut self.params {
            let ParamValue::String(value) = &param.default else {
                continue;
            };
            if value.is_empty() || value.contains('\n') {
                continue;
            }
            let candidate = base_dir.join(value);
            if !candidate.exists() {
                continue;
            }
            if let Ok(resolved) = candidate.canonicalize() {
                param.default = ParamValue::String(resolved.to_string_lossy().to_string());
            }
        }
    }
}

#[derive(Debug, Clone)]
struct AssignmentSite {
    name: String,
    span: Range<usize>,
}

/// A parsed script: its text, its schema, and where each literal lives.
#[derive(Debug, Clone)]
pub struct ScriptAnalysis {
    pub origin: String,
    pub source: String,
    pub schema: Schema,
    sites: Vec<AssignmentSite>,
}

impl ScriptAnalysis {
    /// Script text with every top-level literal assignment of a bound name
    /// replaced by the bound value.
    pub fn render<'a, I>(&self, bindings: I) -> String
    where
        I: IntoIterator<Item = (&'a str, &'a ParamValue)>,
    {
        let values: HashMap<&str, &ParamValue> = bindings.into_iter().collect();
        let mut edits: Vec<(&Range<usize>, String)> = self
            .sites
            .iter()
            .filter_map(|site| {
                values
                    .get(site.name.as_str())
                    .map(|v| (&site.span, v.to_python_literal()))
            })
            .collect();
        edits.sort_by_key(|(span, _)| span.start);

        let mut out = String::with_capacity(self.source.len());
        let mut cursor = 0;
        for (span, text) in edits {
            // Chained targets share one literal span; the first binding wins.
            if span.start < cursor {
                continue;
            }
            out.push_str(&self.source[cursor..span.start]);
            out.push_str(&text);
            cursor = span.end;
        }
        out.push_str(&self.source[cursor..]);
        out
    }
}

/// Analyze a `.py` script or `.ipynb` notebook on disk.
pub fn analyze_path(path: &Path) -> Result<ScriptAnalysis, AnalysisError> {
    let raw = fs::read_to_string(path).map_err(|source| AnalysisError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let origin = path.display().to_string();
    if notebook::is_notebook(path) {
        let source = notebook::linearize(&raw, path)?;
        analyze_source(&source, &origin)
    } else {
        analyze_source(&raw, &origin)
    }
}

pub fn analyze_source(source: &str, origin: &str) -> Result<ScriptAnalysis, AnalysisError> {
    let lines = Lexer::new(source, origin).logical_lines()?;
    check_indentation(&lines, source, origin)?;

    let mut schema = Schema::default();
    let mut sites = Vec::new();
    for line in lines.iter().filter(|l| l.indent == 0) {
        for statement in split_depth0(&line.tokens, ";") {
            let Some(assignment) = match_assignment(statement) else {
                continue;
            };
            let Some((value, kind)) = parse_literal(assignment.rhs) else {
                tracing::debug!(
                    targets = ?assignment.targets,
                    line = line.line,
                    "skipping non-literal assignment"
                );
                continue;
            };
            let span = assignment.rhs[0].start..assignment.rhs[assignment.rhs.len() - 1].end;
            for target in assignment.targets {
                schema.assign(target, kind.clone(), value.clone(), line.line);
                sites.push(AssignmentSite {
                    name: target.to_string(),
                    span: span.clone(),
                });
            }
        }
    }

    Ok(ScriptAnalysis {
        origin: origin.to_string(),
        source: source.to_string(),
        schema,
        sites,
    })
}

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "**", "//", ">>", "<<", "<=", ">=", "==", "!=", "->", "+=",
    "-=", "*=", "/=", "%=", "&=", "|=", "^=", "@=", ":=", "+", "-", "*", "/", "%", "@", "&", "|",
    "^", "~", "<", ">", "=", ".", ",", ":", ";",
];

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Name(String),
    Number(String),
    /// `plain` is false for bytes and f-strings, which are not literals here.
    Str { value: String, plain: bool },
    Op(&'static str),
    Open(char),
    Close(char),
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

impl Token {
    fn is_op(&self, op: &str) -> bool {
        matches!(self.kind, TokenKind::Op(o) if o == op)
    }

    fn name(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Name(n) => Some(n),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct LogicalLine {
    indent: usize,
    line: usize,
    /// Byte offset of the first token, used for error positions.
    start: usize,
    tokens: Vec<Token>,
}

struct Lexer<'a> {
    src: &'a str,
    origin: &'a str,
    chars: Vec<(usize, char)>,
    i: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str, origin: &'a str) -> Self {
        Self {
            src,
            origin,
            chars: src.char_indices().collect(),
            i: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.i).map(|(_, c)| *c)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.i + ahead).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars.get(self.i).map(|(o, _)| *o).unwrap_or(self.src.len())
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.i += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error_at(&self, offset: usize, detail: impl Into<String>) -> AnalysisError {
        syntax_error(self.src, self.origin, offset, detail)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn logical_lines(mut self) -> Result<Vec<LogicalLine>, AnalysisError> {
        let mut lines = Vec::new();
        let mut brackets: Vec<(char, usize)> = Vec::new();
        let mut tokens: Vec<Token> = Vec::new();
        let mut at_line_start = true;
        let mut indent = 0;
        let mut line_no = 1;

        loop {
            if at_line_start {
                let mut width = 0;
                while let Some(c) = self.peek() {
                    match c {
                        ' ' => width += 1,
                        '\t' => width = (width / 8 + 1) * 8,
                        '\x0c' => width = 0,
                        _ => break,
                    }
                    self.bump();
                }
                match self.peek() {
                    None => break,
                    Some('\n') | Some('\r') => {
                        self.bump();
                        continue;
                    }
                    Some('#') => {
                        self.skip_comment();
                        continue;
                    }
                    Some(_) => {
                        indent = width;
                        line_no = self.line;
                        at_line_start = false;
                    }
                }
            }

            let Some(c) = self.peek() else { break };
            let start = self.offset();
            match c {
                '\n' => {
                    self.bump();
                    if brackets.is_empty() {
                        if !tokens.is_empty() {
                            lines.push(LogicalLine {
                                indent,
                                line: line_no,
                                start: tokens[0].start,
                                tokens: std::mem::take(&mut tokens),
                            });
                        }
                        at_line_start = true;
                    }
                }
                ' ' | '\t' | '\r' | '\x0c' => {
                    self.bump();
                }
                '#' => self.skip_comment(),
                '\\' => {
                    self.bump();
                    if self.peek() == Some('\r') {
                        self.bump();
                    }
                    match self.peek() {
                        Some('\n') => {
                            self.bump();
                        }
                        None => {
                            return Err(self.error_at(start, "unexpected end of file after line continuation"))
                        }
                        Some(_) => {
                            return Err(self.error_at(
                                start,
                                "unexpected character after line continuation character",
                            ))
                        }
                    }
                }
                '(' | '[' | '{' => {
                    self.bump();
                    brackets.push((c, start));
                    tokens.push(Token {
                        kind: TokenKind::Open(c),
                        start,
                        end: start + 1,
                    });
                }
                ')' | ']' | '}' => {
                    self.bump();
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match brackets.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, _)) => {
                            return Err(self.error_at(
                                start,
                                format!(
                                    "closing parenthesis '{c}' does not match opening parenthesis '{open}'"
                                ),
                            ))
                        }
                        None => return Err(self.error_at(start, format!("unmatched '{c}'"))),
                    }
                    tokens.push(Token {
                        kind: TokenKind::Close(c),
                        start,
                        end: start + 1,
                    });
                }
                '"' | '\'' => tokens.push(self.lex_string("", start)?),
                c if c.is_ascii_digit() || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())) => {
                    tokens.push(self.lex_number(start)?);
                }
                c if c == '_' || c.is_alphabetic() => {
                    let mut ident = String::new();
                    while let Some(c) = self.peek() {
                        if c == '_' || c.is_alphanumeric() {
                            ident.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    if matches!(self.peek(), Some('"') | Some('\'')) && is_string_prefix(&ident) {
                        tokens.push(self.lex_string(&ident, start)?);
                    } else {
                        tokens.push(Token {
                            kind: TokenKind::Name(ident),
                            start,
                            end: self.offset(),
                        });
                    }
                }
                _ => {
                    let rest = &self.src[start..];
                    let Some(&op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
                        return Err(self.error_at(start, format!("invalid character '{c}'")));
                    };
                    for _ in 0..op.chars().count() {
                        self.bump();
                    }
                    tokens.push(Token {
                        kind: TokenKind::Op(op),
                        start,
                        end: self.offset(),
                    });
                }
            }
        }

        if let Some((open, at)) = brackets.last() {
            return Err(self.error_at(*at, format!("'{open}' was never closed")));
        }
        if !tokens.is_empty() {
            lines.push(LogicalLine {
                indent,
                line: line_no,
                start: tokens[0].start,
                tokens,
            });
        }
        Ok(lines)
    }

    fn lex_number(&mut self, start: usize) -> Result<Token, AnalysisError> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            let exponent_sign = (c == '+' || c == '-')
                && matches!(text.chars().last(), Some('e') | Some('E'))
                && !text.starts_with("0x")
                && !text.starts_with("0X");
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || exponent_sign {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if parse_number(&text).is_none() {
            return Err(self.error_at(start, format!("invalid number literal '{text}'")));
        }
        Ok(Token {
            kind: TokenKind::Number(text),
            start,
            end: self.offset(),
        })
    }

    fn lex_string(&mut self, prefix: &str, start: usize) -> Result<Token, AnalysisError> {
        let lower = prefix.to_ascii_lowercase();
        let raw = lower.contains('r');
        let plain = !lower.contains('b') && !lower.contains('f');

        let Some(quote) = self.bump() else {
            return Err(self.error_at(start, "unterminated string literal"));
        };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }
        let unterminated = if triple {
            "unterminated triple-quoted string literal"
        } else {
            "unterminated string literal"
        };

        let mut value = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error_at(start, unterminated));
            };
            match c {
                '\n' if !triple => return Err(self.error_at(start, unterminated)),
                '\\' => {
                    let escape_at = self.offset();
                    let Some(next) = self.bump() else {
                        return Err(self.error_at(start, unterminated));
                    };
                    if raw {
                        value.push('\\');
                        value.push(next);
                    } else {
                        self.decode_escape(next, escape_at, &mut value)?;
                    }
                }
                c if c == quote => {
                    if !triple {
                        break;
                    }
                    if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                        self.bump();
                        self.bump();
                        break;
                    }
                    value.push(c);
                }
                c => value.push(c),
            }
        }

        Ok(Token {
            kind: TokenKind::Str { value, plain },
            start,
            end: self.offset(),
        })
    }

    fn decode_escape(
        &mut self,
        next: char,
        at: usize,
        value: &mut String,
    ) -> Result<(), AnalysisError> {
        match next {
            '\n' => {}
            '\r' => {
                if self.peek() == Some('\n') {
                    self.bump();
                }
            }
            'n' => value.push('\n'),
            't' => value.push('\t'),
            'r' => value.push('\r'),
            'a' => value.push('\x07'),
            'b' => value.push('\x08'),
            'f' => value.push('\x0c'),
            'v' => value.push('\x0b'),
            '\\' | '\'' | '"' => value.push(next),
            'x' | 'u' | 'U' => {
                let width = match next {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let mut digits = String::new();
                for _ in 0..width {
                    match self.peek() {
                        Some(d) if d.is_ascii_hexdigit() => {
                            digits.push(d);
                            self.bump();
                        }
                        _ => break,
                    }
                }
                let decoded = if digits.len() == width {
                    u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32)
                } else {
                    None
                };
                match decoded {
                    Some(ch) => value.push(ch),
                    None => {
                        return Err(self.error_at(at, format!("truncated or invalid \\{next} escape")))
                    }
                }
            }
            '0'..='7' => {
                let mut digits = String::from(next);
                while digits.len() < 3 {
                    match self.peek() {
                        Some(d @ '0'..='7') => {
                            digits.push(d);
                            self.bump();
                        }
                        _ => break,
                    }
                }
                let code = u32::from_str_radix(&digits, 8).unwrap_or(0);
                value.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            other => {
                value.push('\\');
                value.push(other);
            }
        }
        Ok(())
    }
}

fn is_string_prefix(ident: &str) -> bool {
    matches!(
        ident.to_ascii_lowercase().as_str(),
        "r" | "u" | "b" | "f" | "br" | "rb" | "fr" | "rf"
    )
}

fn syntax_error(src: &str, origin: &str, offset: usize, detail: impl Into<String>) -> AnalysisError {
    let offset = offset.min(src.len());
    let before = &src[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = src[line_start..offset].chars().count() + 1;
    AnalysisError::Syntax {
        origin: origin.to_string(),
        line,
        column,
        detail: detail.into(),
    }
}

fn check_indentation(lines: &[LogicalLine], src: &str, origin: &str) -> Result<(), AnalysisError> {
    let mut stack = vec![0usize];
    let mut opens_block = false;
    for line in lines {
        let top = *stack.last().unwrap_or(&0);
        if line.indent > top {
            if !opens_block {
                return Err(syntax_error(src, origin, line.start, "unexpected indent"));
            }
            stack.push(line.indent);
        } else {
            if opens_block {
                return Err(syntax_error(src, origin, line.start, "expected an indented block"));
            }
            while stack.last().is_some_and(|t| *t > line.indent) {
                stack.pop();
            }
            if stack.last() != Some(&line.indent) {
                return Err(syntax_error(
                    src,
                    origin,
                    line.start,
                    "unindent does not match any outer indentation level",
                ));
            }
        }
        opens_block = line.tokens.last().is_some_and(|t| t.is_op(":"));
    }
    if opens_block {
        return Err(syntax_error(src, origin, src.len(), "expected an indented block"));
    }
    Ok(())
}

/// Split `tokens` on `op` occurring outside any brackets.
fn split_depth0<'t>(tokens: &'t [Token], op: &str) -> Vec<&'t [Token]> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (idx, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::Open(_) => depth += 1,
            TokenKind::Close(_) => depth = depth.saturating_sub(1),
            _ if depth == 0 && token.is_op(op) => {
                parts.push(&tokens[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&tokens[start..]);
    parts.retain(|p| !p.is_empty());
    parts
}

struct Assignment<'t> {
    targets: Vec<&'t str>,
    rhs: &'t [Token],
}

fn match_assignment(statement: &[Token]) -> Option<Assignment<'_>> {
    let first = statement.first()?.name()?;
    if KEYWORDS.contains(&first) {
        return None;
    }
    if statement
        .iter()
        .any(|t| matches!(t.name(), Some("lambda")))
    {
        return None;
    }
    let segments = split_depth0(statement, "=");
    if segments.len() < 2 {
        return None;
    }
    let (rhs, lhs) = segments.split_last()?;

    let mut targets = Vec::new();
    for (idx, segment) in lhs.iter().enumerate() {
        let annotated = segment.len() > 2 && segment[1].is_op(":");
        let name = match segment {
            [single] => single.name(),
            [first, ..] if annotated && idx == 0 && lhs.len() == 1 => first.name(),
            _ => None,
        };
        if let Some(name) = name.filter(|n| !KEYWORDS.contains(n)) {
            targets.push(name);
        }
    }
    if targets.is_empty() {
        return None;
    }
    Some(Assignment { targets, rhs })
}

enum Number {
    Int(i64),
    Float(f64),
    /// Valid syntax with no counterpart in the kind set (complex, huge ints).
    Other,
}

fn parse_number(text: &str) -> Option<Number> {
    if text.starts_with('_') || text.ends_with('_') || text.contains("__") {
        return None;
    }
    let t = text.replace('_', "");
    let lower = t.to_ascii_lowercase();
    if let Some(body) = lower.strip_suffix('j') {
        return body.parse::<f64>().ok().map(|_| Number::Other);
    }
    for (prefix, radix) in [("0x", 16), ("0o", 8), ("0b", 2)] {
        if let Some(digits) = lower.strip_prefix(prefix) {
            if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
                return None;
            }
            return Some(
                i64::from_str_radix(digits, radix)
                    .map(Number::Int)
                    .unwrap_or(Number::Other),
            );
        }
    }
    if lower.contains('.') || lower.contains('e') {
        if lower.contains("inf") || lower.contains("nan") {
            return None;
        }
        return lower.parse::<f64>().ok().map(Number::Float);
    }
    if !lower.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if lower.len() > 1 && lower.starts_with('0') && lower.chars().any(|c| c != '0') {
        return None;
    }
    Some(lower.parse::<i64>().map(Number::Int).unwrap_or(Number::Other))
}

/// Parse a complete literal occupying all of `tokens`, returning the value
/// together with its inferred kind.
fn parse_literal(tokens: &[Token]) -> Option<(ParamValue, ParamKind)> {
    let mut parser = LiteralParser { tokens, pos: 0 };
    let value = parser.literal()?;
    if parser.pos != tokens.len() {
        return None;
    }
    let kind = value.infer_kind()?;
    let value = value.conform(&kind)?;
    Some((value, kind))
}

struct LiteralParser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl LiteralParser<'_> {
    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(token)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn literal(&mut self) -> Option<ParamValue> {
        let token = self.next()?.clone();
        match token.kind {
            TokenKind::Op(sign @ ("-" | "+")) => {
                let TokenKind::Number(text) = &self.next()?.kind else {
                    return None;
                };
                match (parse_number(text)?, sign) {
                    (Number::Int(i), "-") => i.checked_neg().map(ParamValue::Integer),
                    (Number::Int(i), _) => Some(ParamValue::Integer(i)),
                    (Number::Float(f), "-") => Some(ParamValue::Float(-f)),
                    (Number::Float(f), _) => Some(ParamValue::Float(f)),
                    (Number::Other, _) => None,
                }
            }
            TokenKind::Number(text) => match parse_number(&text)? {
                Number::Int(i) => Some(ParamValue::Integer(i)),
                Number::Float(f) => Some(ParamValue::Float(f)),
                Number::Other => None,
            },
            TokenKind::Str { value, plain } => {
                if !plain {
                    return None;
                }
                let mut joined = value;
                while let Some(TokenKind::Str { value, plain }) = self.peek().map(|t| &t.kind) {
                    if !plain {
                        return None;
                    }
                    joined.push_str(value);
                    self.pos += 1;
                }
                Some(ParamValue::String(joined))
            }
            TokenKind::Name(name) => match name.as_str() {
                "True" => Some(ParamValue::Boolean(true)),
                "False" => Some(ParamValue::Boolean(false)),
                _ => None,
            },
            TokenKind::Open('[') => {
                let mut items = Vec::new();
                loop {
                    if matches!(self.peek()?.kind, TokenKind::Close(']')) {
                        self.pos += 1;
                        break;
                    }
                    items.push(self.literal()?);
                    let sep = self.next()?;
                    match sep.kind {
                        TokenKind::Close(']') => break,
                        TokenKind::Op(",") => continue,
                        _ => return None,
                    }
                }
                Some(ParamValue::List(items))
            }
            _ => None,
        }
    }
}
