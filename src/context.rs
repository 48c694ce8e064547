//! Per-user variable context and the path language used to read JSON values.
//!
//! Paths are dotted keys with optional bracket selectors: `data.items[0].id`,
//! `data.items[*]` (one element picked uniformly at random), or `items.0`.

use crate::model::Credential;
use indexmap::IndexMap;
use rand::Rng;
use serde_json::{Map, Value};
use std::borrow::Cow;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    Any,
}

/// A parsed path into a JSON document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePath {
    segments: Vec<Segment>,
}

impl ValuePath {
    pub fn parse(path: &str) -> Self {
        let path = path.trim();
        let path = path
            .strip_prefix("$.")
            .or_else(|| path.strip_prefix('$'))
            .unwrap_or(path);

        let mut segments = Vec::new();
        for part in path.split('.') {
            let (head, mut rest) = match part.find('[') {
                Some(i) => (&part[..i], &part[i..]),
                None => (part, ""),
            };
            if !head.is_empty() {
                segments.push(Segment::Key(head.to_string()));
            }
            while let Some(stripped) = rest.strip_prefix('[') {
                let Some(end) = stripped.find(']') else {
                    // unterminated selector, keep it as a literal key
                    segments.push(Segment::Key(rest.to_string()));
                    break;
                };
                let selector = stripped[..end].trim();
                segments.push(match selector {
                    "*" => Segment::Any,
                    s => match s.parse::<usize>() {
                        Ok(i) => Segment::Index(i),
                        Err(_) => Segment::Key(s.trim_matches(|c: char| c == '"' || c == '\'').to_string()),
                    },
                });
                rest = &stripped[end + 1..];
            }
        }
        Self { segments }
    }

    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match (segment, current) {
                (Segment::Key(k), Value::Object(map)) => map.get(k)?,
                (Segment::Key(k), Value::Array(items)) => items.get(k.parse::<usize>().ok()?)?,
                (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
                (Segment::Any, Value::Array(items)) if !items.is_empty() => {
                    &items[rand::thread_rng().gen_range(0..items.len())]
                }
                _ => return None,
            };
        }
        Some(current)
    }

    fn resolve_in<'a>(&self, map: &'a Map<String, Value>) -> Option<&'a Value> {
        let (first, rest) = self.segments.split_first()?;
        let Segment::Key(key) = first else {
            return None;
        };
        let head = map.get(key)?;
        ValuePath {
            segments: rest.to_vec(),
        }
        .resolve(head)
    }
}

/// Textual form of a value inside a rendered template.
pub fn display_value(value: &Value) -> Cow<'_, str> {
    match value {
        Value::Null => Cow::Borrowed(""),
        Value::String(s) => Cow::Borrowed(s.as_str()),
        other => Cow::Owned(other.to_string()),
    }
}

/// Variables owned by one virtual user for its whole lifetime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    vars: Map<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// `input` overlaid with the credential's fields.
    pub fn seed(input: &Map<String, Value>, credential: Option<&Credential>) -> Self {
        let mut ctx = Self { vars: input.clone() };
        if let Some(credential) = credential {
            ctx.merge(credential);
        }
        ctx
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Dotted lookup, e.g. `user.profile.id`.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        ValuePath::parse(path).resolve_in(&self.vars)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    pub fn merge(&mut self, values: &Map<String, Value>) {
        for (k, v) in values {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    /// Copies `source` to `target` for each entry, in order. Missing sources are skipped.
    pub fn alias(&mut self, aliases: &IndexMap<String, String>) {
        for (source, target) in aliases {
            if let Some(value) = self.lookup(source).cloned() {
                self.vars.insert(target.clone(), value);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.vars
    }
}

impl From<Map<String, Value>> for Context {
    fn from(vars: Map<String, Value>) -> Self {
        Self { vars }
    }
}
