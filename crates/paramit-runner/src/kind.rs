//! Closed set of parameter kinds and values.
//!
//! Every parameter discovered in a script has one of these kinds, derived
//! from its literal default. Coercion of command-line text, conversion to and
//! from the configuration artifact, and rendering back into script syntax all
//! match exhaustively on it.

use serde_json::Value as JsonValue;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Integer,
    Float,
    String,
    Boolean,
    List(Box<ParamKind>),
}

impl ParamKind {
    pub fn list_of(inner: ParamKind) -> Self {
        ParamKind::List(Box::new(inner))
    }

    /// Smallest kind both `self` and `other` conform to, if any.
    /// Integers widen to floats; nothing else converts.
    pub fn join(&self, other: &ParamKind) -> Option<ParamKind> {
        match (self, other) {
            (a, b) if a == b => Some(a.clone()),
            (ParamKind::Integer, ParamKind::Float) | (ParamKind::Float, ParamKind::Integer) => {
                Some(ParamKind::Float)
            }
            (ParamKind::List(a), ParamKind::List(b)) => a.join(b).map(ParamKind::list_of),
            _ => None,
        }
    }

    /// Parse one raw command-line value as this kind.
    ///
    /// List kinds expect a bracketed literal such as `[1, 2, 3]`.
    pub fn coerce(&self, raw: &str) -> Option<ParamValue> {
        let text = raw.trim();
        match self {
            ParamKind::Integer => text.parse::<i64>().ok().map(ParamValue::Integer),
            ParamKind::Float => text
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(ParamValue::Float),
            ParamKind::Boolean => {
                if text.eq_ignore_ascii_case("true") {
                    Some(ParamValue::Boolean(true))
                } else if text.eq_ignore_ascii_case("false") {
                    Some(ParamValue::Boolean(false))
                } else {
                    None
                }
            }
            ParamKind::String => Some(ParamValue::String(raw.to_string())),
            ParamKind::List(inner) => {
                let body = text.strip_prefix('[')?.strip_suffix(']')?;
                let mut pieces = split_top_level(body);
                if pieces.last().is_some_and(|p| p.trim().is_empty()) {
                    pieces.pop();
                }
                let mut items = Vec::with_capacity(pieces.len());
                for piece in pieces {
                    let piece = piece.trim();
                    if piece.is_empty() {
                        return None;
                    }
                    let piece = match **inner {
                        ParamKind::String => strip_quotes(piece),
                        _ => piece,
                    };
                    items.push(inner.coerce(piece)?);
                }
                Some(ParamValue::List(items))
            }
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Integer => write!(f, "integer"),
            ParamKind::Float => write!(f, "float"),
            ParamKind::String => write!(f, "string"),
            ParamKind::Boolean => write!(f, "boolean"),
            ParamKind::List(inner) => write!(f, "list of {inner}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    List(Vec<ParamValue>),
}

impl ParamValue {
    /// Kind of this value on its own. `None` for an empty list or a list
    /// whose elements share no common kind.
    pub fn infer_kind(&self) -> Option<ParamKind> {
        match self {
            ParamValue::Integer(_) => Some(ParamKind::Integer),
            ParamValue::Float(_) => Some(ParamKind::Float),
            ParamValue::String(_) => Some(ParamKind::String),
            ParamValue::Boolean(_) => Some(ParamKind::Boolean),
            ParamValue::List(items) => {
                let mut iter = items.iter();
                let mut kind = iter.next()?.infer_kind()?;
                for item in iter {
                    kind = kind.join(&item.infer_kind()?)?;
                }
                Some(ParamKind::list_of(kind))
            }
        }
    }

    /// Convert this value to `kind`, widening integers to floats where
    /// needed. `None` when the value does not fit.
    pub fn conform(&self, kind: &ParamKind) -> Option<ParamValue> {
        match (self, kind) {
            (ParamValue::Integer(i), ParamKind::Integer) => Some(ParamValue::Integer(*i)),
            (ParamValue::Integer(i), ParamKind::Float) => Some(ParamValue::Float(*i as f64)),
            (ParamValue::Float(v), ParamKind::Float) if v.is_finite() => {
                Some(ParamValue::Float(*v))
            }
            (ParamValue::String(s), ParamKind::String) => Some(ParamValue::String(s.clone())),
            (ParamValue::Boolean(b), ParamKind::Boolean) => Some(ParamValue::Boolean(*b)),
            (ParamValue::List(items), ParamKind::List(inner)) => items
                .iter()
                .map(|item| item.conform(inner))
                .collect::<Option<Vec<_>>>()
                .map(ParamValue::List),
            _ => None,
        }
    }

    /// Source text for this value in the target script language.
    pub fn to_python_literal(&self) -> String {
        match self {
            ParamValue::Integer(i) => i.to_string(),
            ParamValue::Float(v) => float_repr(*v),
            ParamValue::Boolean(true) => "True".to_string(),
            ParamValue::Boolean(false) => "False".to_string(),
            ParamValue::String(s) => python_string_literal(s),
            ParamValue::List(items) => format!(
                "[{}]",
                items
                    .iter()
                    .map(ParamValue::to_python_literal)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    pub fn to_toml(&self) -> toml::Value {
        match self {
            ParamValue::Integer(i) => toml::Value::Integer(*i),
            ParamValue::Float(v) => toml::Value::Float(*v),
            ParamValue::String(s) => toml::Value::String(s.clone()),
            ParamValue::Boolean(b) => toml::Value::Boolean(*b),
            ParamValue::List(items) => {
                toml::Value::Array(items.iter().map(ParamValue::to_toml).collect())
            }
        }
    }

    pub fn from_toml(value: &toml::Value) -> Option<ParamValue> {
        match value {
            toml::Value::Integer(i) => Some(ParamValue::Integer(*i)),
            toml::Value::Float(v) if v.is_finite() => Some(ParamValue::Float(*v)),
            toml::Value::String(s) => Some(ParamValue::String(s.clone())),
            toml::Value::Boolean(b) => Some(ParamValue::Boolean(*b)),
            toml::Value::Array(items) => items
                .iter()
                .map(ParamValue::from_toml)
                .collect::<Option<Vec<_>>>()
                .map(ParamValue::List),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            ParamValue::Integer(i) => JsonValue::from(*i),
            ParamValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            ParamValue::String(s) => JsonValue::String(s.clone()),
            ParamValue::Boolean(b) => JsonValue::Bool(*b),
            ParamValue::List(items) => {
                JsonValue::Array(items.iter().map(ParamValue::to_json).collect())
            }
        }
    }

    /// Filesystem-safe fragment used in run directory names.
    pub fn slug_fragment(&self) -> String {
        let raw = match self {
            ParamValue::Integer(i) => i.to_string(),
            ParamValue::Float(v) => float_repr(*v),
            ParamValue::String(s) => s.clone(),
            ParamValue::Boolean(b) => b.to_string(),
            ParamValue::List(items) => items
                .iter()
                .map(ParamValue::slug_fragment)
                .collect::<Vec<_>>()
                .join("-"),
        };
        let cleaned: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .take(24)
            .collect();
        if cleaned.is_empty() {
            "empty".to_string()
        } else {
            cleaned
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_python_literal())
    }
}

/// Shortest round-tripping float text that still reads as a float.
fn float_repr(v: f64) -> String {
    format!("{v:?}")
}

fn python_string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32))
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

pub(crate) fn strip_quotes(piece: &str) -> &str {
    for quote in ['"', '\''] {
        if piece.len() >= 2 && piece.starts_with(quote) && piece.ends_with(quote) {
            return &piece[1..piece.len() - 1];
        }
    }
    piece
}

/// Split on commas that are not nested inside brackets or quotes.
pub(crate) fn split_top_level(raw: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (idx, c) in raw.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '[' | '(' | '{' => depth += 1,
                ']' | ')' | '}' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    pieces.push(&raw[start..idx]);
                    start = idx + 1;
                }
                _ => {}
            },
        }
    }
    pieces.push(&raw[start..]);
    pieces
}
