//! Template expression evaluation.
//!
//! An input value is either a literal JSON value or a string containing
//! one or more `{{path}}` substitutions. Paths are dotted references
//! rooted at `input`, `tasks`, or `env`, with numeric bracket indexing
//! (`tasks.x.output.items[0].id`). Templates compile once into a list
//! of literal and path segments so repeated evaluation (the output
//! mapper, retried tasks) never re-parses.

use crate::context::{ContextSnapshot, TaskStatus};
use serde_json::Value;
use snafu::prelude::*;

#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("Template syntax error in '{expr}': {message}"))]
    Syntax { expr: String, message: String },

    #[snafu(display("Reference '{path}' cannot be resolved yet: task '{task}' is not complete"))]
    Unresolved { path: String, task: String },

    #[snafu(display("Unknown reference '{path}'"))]
    Missing { path: String },

    #[snafu(display("Type mismatch at '{path}': {message}"))]
    TypeMismatch { path: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// One step of a path: a field access or an array index.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Field(String),
    Index(usize),
}

/// A parsed `{{...}}` reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub root: String,
    pub steps: Vec<Step>,
    raw: String,
}

impl Path {
    /// The task id this path depends on, when rooted at `tasks`.
    #[must_use]
    pub fn referenced_task(&self) -> Option<&str> {
        if self.root != "tasks" {
            return None;
        }
        match self.steps.first() {
            Some(Step::Field(id)) => Some(id),
            Some(Step::Index(_)) | None => None,
        }
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Expr(Path),
}

/// A compiled template: literal text interleaved with path references.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
    raw: String,
}

impl Template {
    /// Compile a template string. Strings without `{{` compile to a
    /// single literal segment.
    pub fn parse(input: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = input;

        while let Some(open) = rest.find("{{") {
            let (literal, after_open) = rest.split_at(open);
            if !literal.is_empty() {
                segments.push(Segment::Literal(literal.to_string()));
            }
            let body = &after_open[2..];
            let close = body.find("}}").ok_or_else(|| Error::Syntax {
                expr: input.to_string(),
                message: "unbalanced '{{' without matching '}}'".to_string(),
            })?;
            let expr = body[..close].trim();
            if expr.is_empty() {
                return Err(Error::Syntax {
                    expr: input.to_string(),
                    message: "empty path".to_string(),
                });
            }
            segments.push(Segment::Expr(parse_path(expr, input)?));
            rest = &body[close + 2..];
        }
        if !rest.is_empty() || segments.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            segments,
            raw: input.to_string(),
        })
    }

    /// Whether the template contains no substitutions at all.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Every path referenced by this template.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Expr(p) => Some(p),
            Segment::Literal(_) => None,
        })
    }

    /// Evaluate against a context snapshot.
    ///
    /// A template that is exactly one `{{path}}` with no surrounding
    /// text yields the referenced value with its native type. Anything
    /// else evaluates in string mode, substituting each reference with
    /// its canonical JSON rendering (strings unquoted).
    pub fn evaluate(&self, ctx: &ContextSnapshot) -> Result<Value> {
        if let [Segment::Expr(path)] = self.segments.as_slice() {
            return resolve(path, ctx);
        }
        Ok(Value::String(self.render(ctx)?))
    }

    /// Evaluate in string mode regardless of shape.
    pub fn evaluate_text(&self, ctx: &ContextSnapshot) -> Result<String> {
        self.render(ctx)
    }

    fn render(&self, ctx: &ContextSnapshot) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Expr(path) => {
                    let value = resolve(path, ctx)?;
                    match value {
                        Value::String(s) => out.push_str(&s),
                        other => out.push_str(&other.to_string()),
                    }
                }
            }
        }
        Ok(out)
    }
}

fn parse_path(expr: &str, full: &str) -> Result<Path> {
    let syntax = |message: String| Error::Syntax {
        expr: full.to_string(),
        message,
    };

    let mut chars = expr.chars().peekable();
    let root = read_ident(&mut chars).ok_or_else(|| syntax(format!("invalid path '{expr}'")))?;

    let mut steps = Vec::new();
    loop {
        match chars.peek() {
            None => break,
            Some('.') => {
                chars.next();
                let field = read_ident(&mut chars)
                    .ok_or_else(|| syntax(format!("expected field name in '{expr}'")))?;
                steps.push(Step::Field(field));
            }
            Some('[') => {
                chars.next();
                let mut digits = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_digit() {
                        digits.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.next() != Some(']') || digits.is_empty() {
                    return Err(syntax(format!("invalid index in '{expr}'")));
                }
                let index = digits
                    .parse()
                    .map_err(|_| syntax(format!("invalid index in '{expr}'")))?;
                steps.push(Step::Index(index));
            }
            Some(other) => {
                return Err(syntax(format!("unexpected character '{other}' in '{expr}'")));
            }
        }
    }

    Ok(Path {
        root,
        steps,
        raw: expr.to_string(),
    })
}

fn read_ident(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<String> {
    let mut ident = String::new();
    while let Some(c) = chars.peek() {
        if c.is_ascii_alphanumeric() || *c == '_' || *c == '-' {
            ident.push(*c);
            chars.next();
        } else {
            break;
        }
    }
    if ident.is_empty() { None } else { Some(ident) }
}

fn resolve(path: &Path, ctx: &ContextSnapshot) -> Result<Value> {
    match path.root.as_str() {
        "input" => walk(&ctx.input, &path.steps, path),
        "env" => walk(&ctx.env, &path.steps, path),
        "tasks" => {
            let (first, rest) = match path.steps.split_first() {
                Some(split) => split,
                None => {
                    return Err(Error::TypeMismatch {
                        path: path.raw.clone(),
                        message: "a task id is required after 'tasks'".to_string(),
                    });
                }
            };
            let task_id = match first {
                Step::Field(id) => id,
                Step::Index(_) => {
                    return Err(Error::TypeMismatch {
                        path: path.raw.clone(),
                        message: "tasks are addressed by id, not index".to_string(),
                    });
                }
            };
            let snapshot = ctx.tasks.get(task_id).ok_or_else(|| Error::Missing {
                path: path.raw.clone(),
            })?;
            if !snapshot.is_terminal() {
                return Err(Error::Unresolved {
                    path: path.raw.clone(),
                    task: task_id.clone(),
                });
            }
            // A cancelled task carries no usable output; readers see it
            // as unresolved rather than a missing field.
            if snapshot.status == Some(TaskStatus::Cancelled) {
                return Err(Error::Unresolved {
                    path: path.raw.clone(),
                    task: task_id.clone(),
                });
            }
            walk(&snapshot.value, rest, path)
        }
        _ => Err(Error::Missing {
            path: path.raw.clone(),
        }),
    }
}

fn walk(value: &Value, steps: &[Step], path: &Path) -> Result<Value> {
    let mut current = value;
    for step in steps {
        match step {
            Step::Field(field) => match current {
                Value::Object(map) => {
                    current = map.get(field).ok_or_else(|| Error::Missing {
                        path: path.raw.clone(),
                    })?;
                }
                _ => {
                    return Err(Error::TypeMismatch {
                        path: path.raw.clone(),
                        message: format!("cannot read field '{field}' of a non-object"),
                    });
                }
            },
            Step::Index(index) => match current {
                Value::Array(items) => {
                    current = items.get(*index).ok_or_else(|| Error::Missing {
                        path: path.raw.clone(),
                    })?;
                }
                _ => {
                    return Err(Error::TypeMismatch {
                        path: path.raw.clone(),
                        message: format!("cannot index [{index}] into a non-array"),
                    });
                }
            },
        }
    }
    Ok(current.clone())
}

/// Evaluate an arbitrary JSON value: strings are compiled and
/// evaluated, maps and arrays recurse, everything else passes through.
pub fn evaluate_value(value: &Value, ctx: &ContextSnapshot) -> Result<Value> {
    match value {
        Value::String(s) => Template::parse(s)?.evaluate(ctx),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), evaluate_value(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate_value(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

/// Collect every template path referenced anywhere inside a JSON value.
pub fn scan_value(value: &Value) -> Result<Vec<Path>> {
    let mut paths = Vec::new();
    collect(value, &mut paths)?;
    Ok(paths)
}

fn collect(value: &Value, out: &mut Vec<Path>) -> Result<()> {
    match value {
        Value::String(s) => {
            out.extend(Template::parse(s)?.paths().cloned());
        }
        Value::Object(map) => {
            for v in map.values() {
                collect(v, out)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}
