//! Turns an [`ActionNode`] and a user's [`Context`] into a concrete request.
//!
//! Two placeholder kinds with different failure policies:
//! - `:name` at the start of the URL or of a path segment must resolve, or the
//!   step fails with [`TemplateError::MissingPathParam`].
//! - `{{dot.path}}` anywhere in the URL, header values and string leaves of the
//!   body and parameters. Unresolved placeholders render as an empty string.

use crate::context::{display_value, Context};
use crate::error::TemplateError;
use crate::model::{ActionNode, HttpMethod};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::HashMap;

static PATH_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|/):([A-Za-z_][A-Za-z0-9_]*)").expect("valid path param regex"));

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("valid placeholder regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedRequest {
    pub endpoint_id: String,
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub params: Option<Map<String, Value>>,
}

impl RenderedRequest {
    /// Query pairs with non-string values in their JSON text form.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), display_value(v).into_owned()))
            .collect()
    }
}

pub fn render(node: &ActionNode, ctx: &Context) -> Result<RenderedRequest, TemplateError> {
    let url = render_str(&render_path_params(&node.url, ctx)?, ctx);

    let headers = node
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), render_str(v, ctx)))
        .collect();

    let body = node.body.as_ref().map(|b| render_value(b, ctx));

    let params = node.parameters.as_ref().map(|p| {
        p.iter()
            .map(|(k, v)| (k.clone(), render_value(v, ctx)))
            .collect()
    });

    Ok(RenderedRequest {
        endpoint_id: node.id.clone(),
        method: node.method,
        url,
        headers,
        body,
        params,
    })
}

fn render_path_params(url: &str, ctx: &Context) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(url.len());
    let mut last = 0;
    for caps in PATH_PARAM.captures_iter(url) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        let value = match ctx.get(name.as_str()) {
            None | Some(Value::Null) => {
                return Err(TemplateError::MissingPathParam(name.as_str().to_string()))
            }
            Some(v) => v,
        };
        out.push_str(&url[last..name.start() - 1]);
        out.push_str(&urlencoding::encode(&display_value(value)));
        last = whole.end();
    }
    out.push_str(&url[last..]);
    Ok(out)
}

/// Replaces every `{{path}}` in `s`.
pub fn render_str(s: &str, ctx: &Context) -> String {
    PLACEHOLDER
        .replace_all(s, |caps: &Captures| {
            ctx.lookup(caps[1].trim())
                .map(|v| display_value(v).into_owned())
                .unwrap_or_default()
        })
        .into_owned()
}

fn render_value(value: &Value, ctx: &Context) -> Value {
    match value {
        Value::String(s) => Value::String(render_str(s, ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}
