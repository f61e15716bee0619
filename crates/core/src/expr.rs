//! Path-expression templates over object trees.
//!
//! Templates mix literal text with `{{.spec.nodeName}}`-style field paths.
//! The delimiters are configurable. A path that resolves to nothing renders
//! as [`ExprError::NoValue`]; callers uniformly treat empty output, missing
//! values and evaluation errors as "skip/omit".

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("template parse: {0}")]
    Parse(String),
    #[error("no value for path {0}")]
    NoValue(String),
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Path(Vec<Step>),
}

#[derive(Debug, Clone)]
enum Step {
    Key(String),
    Index(usize),
}

/// A compiled template. Compile once at configuration time, render per object.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Compile `text` using the given open/close delimiters (default `{{`/`}}`).
    pub fn compile(text: &str, delims: (&str, &str)) -> Result<Self, ExprError> {
        let (open, close) = delims;
        if open.is_empty() || close.is_empty() {
            return Err(ExprError::Parse("empty delimiter".into()));
        }
        let mut segments = Vec::new();
        let mut rest = text;
        while let Some(start) = rest.find(open) {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + open.len()..];
            let end = after
                .find(close)
                .ok_or_else(|| ExprError::Parse(format!("unclosed {open} in {text:?}")))?;
            segments.push(Segment::Path(parse_path(after[..end].trim())?));
            rest = &after[end + close.len()..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self { source: text.to_string(), segments })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render against an object tree. Scalars render bare, composites as
    /// compact JSON, absent or null values fail with [`ExprError::NoValue`].
    pub fn render(&self, root: &Value) -> Result<String, ExprError> {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Path(steps) => out.push_str(&eval(root, steps)?),
            }
        }
        Ok(out)
    }
}

fn parse_path(expr: &str) -> Result<Vec<Step>, ExprError> {
    let expr = expr.strip_prefix('.').unwrap_or(expr);
    if expr.is_empty() {
        return Err(ExprError::Parse("empty path expression".into()));
    }
    let mut steps = Vec::new();
    for part in expr.split('.') {
        let (key, indexes) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if key.is_empty() && steps.is_empty() && indexes.is_empty() {
            return Err(ExprError::Parse(format!("bad path segment in {expr:?}")));
        }
        if !key.is_empty() {
            steps.push(Step::Key(key.to_string()));
        }
        let mut rest = indexes;
        while let Some(open) = rest.find('[') {
            let close = rest
                .find(']')
                .ok_or_else(|| ExprError::Parse(format!("unclosed index in {expr:?}")))?;
            let idx: usize = rest[open + 1..close]
                .parse()
                .map_err(|_| ExprError::Parse(format!("bad index in {expr:?}")))?;
            steps.push(Step::Index(idx));
            rest = &rest[close + 1..];
        }
    }
    Ok(steps)
}

fn eval(root: &Value, steps: &[Step]) -> Result<String, ExprError> {
    let describe = || {
        steps
            .iter()
            .map(|s| match s {
                Step::Key(k) => format!(".{k}"),
                Step::Index(i) => format!("[{i}]"),
            })
            .collect::<String>()
    };
    let mut cur = root;
    for step in steps {
        cur = match step {
            Step::Key(k) => cur.get(k),
            Step::Index(i) => cur.get(i),
        }
        .ok_or_else(|| ExprError::NoValue(describe()))?;
    }
    match cur {
        Value::Null => Err(ExprError::NoValue(describe())),
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => serde_json::to_string(other).map_err(|e| ExprError::Parse(e.to_string())),
    }
}
