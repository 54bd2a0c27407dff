//! Placeholder scanning and path resolution.
//!
//! Supported forms:
//! - `${{activity.name}}` or `{{activity.name}}`
//! - `${{activity.status.type}}` - nested attribute
//! - `${{activity.#users.email}}` - project over an array, joined with ", "
//! - `${{activity.#orders.#items.sku}}` - nested projection
//! - `${{activity.users.0.email}}` - array index
//! - `${{activity.<field_id>}}` - user-defined form field
//! - `${{activity.&<field_id>}}` - stored field value as JSON
//! - `${{vars.NAME}}` - process-level variable

use std::sync::OnceLock;

use regex_lite::{Captures, Regex};
use serde_json::Value;

use super::Snapshot;

/// Rendered in place of anything that cannot be resolved.
pub const FALLBACK: &str = "-";

const JOIN: &str = ", ";

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER_REGEX
        .get_or_init(|| Regex::new(r"\$?\{\{\s*([^{}]*?)\s*\}\}").expect("valid regex"))
}

/// Render every placeholder in `template` against `snapshot`.
pub fn resolve(template: &str, snapshot: &Snapshot) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &Captures| {
            resolve_expression(&caps[1], snapshot).unwrap_or_else(|| FALLBACK.to_string())
        })
        .into_owned()
}

/// Resolve a list of recipient templates into distinct addresses.
///
/// The bare keyword `users` expands to every activity user's email.
/// Projections that render several values are split back into one
/// address each.
pub fn resolve_recipients(templates: &[String], snapshot: &Snapshot) -> Vec<String> {
    let mut recipients: Vec<String> = Vec::new();
    let mut push = |address: &str| {
        let address = address.trim();
        if !address.is_empty() && address != FALLBACK && !recipients.iter().any(|r| r == address)
        {
            recipients.push(address.to_string());
        }
    };

    for template in templates {
        if template.trim() == "users" {
            for email in snapshot.user_emails() {
                push(&email);
            }
            continue;
        }
        let rendered = resolve(template, snapshot);
        for part in rendered.split(',') {
            push(part);
        }
    }

    recipients
}

fn resolve_expression(expr: &str, snapshot: &Snapshot) -> Option<String> {
    let segments: Vec<&str> = expr.split('.').map(str::trim).collect();
    let (namespace, path) = segments.split_first()?;

    match *namespace {
        "activity" => resolve_activity(path, snapshot),
        "vars" => {
            if path.is_empty() {
                return None;
            }
            snapshot
                .var(&path.join("."))
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }
        _ => None,
    }
}

fn resolve_activity(path: &[&str], snapshot: &Snapshot) -> Option<String> {
    let (first, rest) = path.split_first()?;

    if let Some(field_id) = first.strip_prefix('&') {
        return match snapshot.raw_field(field_id)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        };
    }

    match first.strip_prefix('#') {
        Some(name) => project(snapshot.root(name)?, rest),
        None => walk(snapshot.root(first)?, rest),
    }
}

fn walk(value: &Value, path: &[&str]) -> Option<String> {
    let Some((segment, rest)) = path.split_first() else {
        return render(value);
    };

    if let Some(name) = segment.strip_prefix('#') {
        return project(value.get(name)?, rest);
    }

    let next = match value {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }?;
    walk(next, rest)
}

/// Elements that do not resolve are skipped; an all-empty projection
/// falls back.
fn project(value: &Value, rest: &[&str]) -> Option<String> {
    let items = value.as_array()?;
    let parts: Vec<String> = items.iter().filter_map(|item| walk(item, rest)).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(JOIN))
    }
}

fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(render).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(JOIN))
            }
        }
        Value::Object(_) => Some(value.to_string()),
    }
}
