//! `${...}` placeholder substitution for sub-action parameters.
//!
//! Three namespaces resolve inside braces:
//! - `${name}`: current Variable Store value
//! - `${vault:name}`: Vault Store value
//! - `${event:field}`: trigger payload field (dots descend into objects)
//!
//! Rules: every occurrence in a string is substituted left-to-right in a
//! single pass; substituted values are never re-scanned. An unknown name
//! substitutes the empty string. `$${` escapes to a literal `${`. An
//! unclosed `${` passes through verbatim. Plain variable names may not
//! contain `:`; the prefix before a colon is a reserved namespace.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde_json::Value;

use crate::variables::VariableStore;
use crate::vault::VaultStore;

/// Value sources for one interpolation pass.
pub struct Interpolator<'a> {
    variables: &'a VariableStore,
    vault: &'a VaultStore,
    event: &'a Value,
}

impl<'a> Interpolator<'a> {
    pub fn new(variables: &'a VariableStore, vault: &'a VaultStore, event: &'a Value) -> Self {
        Self {
            variables,
            vault,
            event,
        }
    }

    /// Expand every string inside a JSON parameter tree.
    pub async fn expand_value(&self, value: &Value) -> Result<Value> {
        let mut names = BTreeSet::new();
        collect_from_value(value, &mut names);

        let mut resolved = BTreeMap::new();
        for name in names {
            let substitute = self.resolve(&name).await?.unwrap_or_default();
            resolved.insert(name, substitute);
        }

        Ok(substitute_in_value(value, &resolved))
    }

    /// Expand placeholders in a single string.
    pub async fn expand_str(&self, input: &str) -> Result<String> {
        let value = self.expand_value(&Value::String(input.to_string())).await?;
        match value {
            Value::String(s) => Ok(s),
            _ => unreachable!("string expansion yields a string"),
        }
    }

    async fn resolve(&self, name: &str) -> Result<Option<String>> {
        if let Some(key) = name.strip_prefix("vault:") {
            return self.vault.get(key);
        }
        if let Some(path) = name.strip_prefix("event:") {
            let pointer = format!("/{}", path.replace('.', "/"));
            return Ok(self.event.pointer(&pointer).map(stringify));
        }
        Ok(self.variables.get(name).await?.map(|v| stringify(&v)))
    }
}

/// Render a JSON value as substitution text: strings verbatim, null as
/// empty, everything else as compact JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn collect_from_value(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => collect_placeholders(s, out),
        Value::Array(items) => {
            for item in items {
                collect_from_value(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_from_value(item, out);
            }
        }
        _ => {}
    }
}

fn substitute_in_value(value: &Value, resolved: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, resolved)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_in_value(item, resolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_in_value(v, resolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Collect placeholder names from one string, honoring the escape rule.
fn collect_placeholders(input: &str, out: &mut BTreeSet<String>) {
    scan(input, |segment| {
        if let Segment::Placeholder(name) = segment {
            out.insert(name.to_string());
        }
    });
}

/// Substitute placeholders in one string from a resolved map.
fn substitute(input: &str, resolved: &BTreeMap<String, String>) -> String {
    let mut output = String::with_capacity(input.len());
    scan(input, |segment| match segment {
        Segment::Literal(text) => output.push_str(text),
        Segment::Escaped => output.push_str("${"),
        Segment::Placeholder(name) => {
            if let Some(value) = resolved.get(name) {
                output.push_str(value);
            }
        }
    });
    output
}

enum Segment<'a> {
    Literal(&'a str),
    /// A `$${` escape, rendering as a literal `${`.
    Escaped,
    Placeholder(&'a str),
}

/// Single-pass scanner shared by collection and substitution.
fn scan<'a>(input: &'a str, mut emit: impl FnMut(Segment<'a>)) {
    let mut rest = input;
    loop {
        let Some(pos) = rest.find('$') else {
            if !rest.is_empty() {
                emit(Segment::Literal(rest));
            }
            return;
        };

        if pos > 0 {
            emit(Segment::Literal(&rest[..pos]));
        }
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("$${") {
            emit(Segment::Escaped);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("${") {
            match after.find('}') {
                Some(end) => {
                    emit(Segment::Placeholder(&after[..end]));
                    rest = &after[end + 1..];
                }
                None => {
                    // Unclosed placeholder passes through verbatim.
                    emit(Segment::Literal(tail));
                    return;
                }
            }
        } else {
            emit(Segment::Literal(&tail[..1]));
            rest = &tail[1..];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn fixtures(temp: &TempDir) -> (VariableStore, VaultStore) {
        let variables = VariableStore::open(&temp.path().join("variables.db")).unwrap();
        let vault = VaultStore::open(&temp.path().join("vault")).unwrap();
        variables.set("foo", json!("bar")).await.unwrap();
        variables.set("count", json!(42)).await.unwrap();
        vault.set("token", "s3cret").unwrap();
        (variables, vault)
    }

    #[tokio::test]
    async fn single_variable() {
        let temp = TempDir::new().unwrap();
        let (variables, vault) = fixtures(&temp).await;
        let event = json!({});
        let interp = Interpolator::new(&variables, &vault, &event);

        assert_eq!(interp.expand_str("${foo}").await.unwrap(), "bar");
    }

    #[tokio::test]
    async fn unset_variable_is_empty_string() {
        let temp = TempDir::new().unwrap();
        let (variables, vault) = fixtures(&temp).await;
        let event = json!({});
        let interp = Interpolator::new(&variables, &vault, &event);

        assert_eq!(interp.expand_str("<${missing}>").await.unwrap(), "<>");
    }

    #[tokio::test]
    async fn multiple_placeholders_in_one_string() {
        let temp = TempDir::new().unwrap();
        let (variables, vault) = fixtures(&temp).await;
        let event = json!({});
        let interp = Interpolator::new(&variables, &vault, &event);

        assert_eq!(
            interp.expand_str("${foo} x ${count} x ${foo}").await.unwrap(),
            "bar x 42 x bar"
        );
    }

    #[tokio::test]
    async fn vault_and_event_namespaces() {
        let temp = TempDir::new().unwrap();
        let (variables, vault) = fixtures(&temp).await;
        let event = json!({"user": "alice", "body": {"nested": "deep"}});
        let interp = Interpolator::new(&variables, &vault, &event);

        assert_eq!(interp.expand_str("${vault:token}").await.unwrap(), "s3cret");
        assert_eq!(interp.expand_str("${event:user}").await.unwrap(), "alice");
        assert_eq!(
            interp.expand_str("${event:body.nested}").await.unwrap(),
            "deep"
        );
    }

    #[tokio::test]
    async fn escape_produces_literal() {
        let temp = TempDir::new().unwrap();
        let (variables, vault) = fixtures(&temp).await;
        let event = json!({});
        let interp = Interpolator::new(&variables, &vault, &event);

        assert_eq!(interp.expand_str("$${foo}").await.unwrap(), "${foo}");
        assert_eq!(interp.expand_str("a $ b").await.unwrap(), "a $ b");
    }

    #[tokio::test]
    async fn unclosed_placeholder_passes_through() {
        let temp = TempDir::new().unwrap();
        let (variables, vault) = fixtures(&temp).await;
        let event = json!({});
        let interp = Interpolator::new(&variables, &vault, &event);

        assert_eq!(interp.expand_str("${foo").await.unwrap(), "${foo");
    }

    #[tokio::test]
    async fn substituted_values_are_not_rescanned() {
        let temp = TempDir::new().unwrap();
        let (variables, vault) = fixtures(&temp).await;
        variables.set("outer", json!("${foo}")).await.unwrap();
        let event = json!({});
        let interp = Interpolator::new(&variables, &vault, &event);

        // The stored value contains placeholder syntax; it must come out
        // verbatim, not expanded a second time.
        assert_eq!(interp.expand_str("${outer}").await.unwrap(), "${foo}");
    }

    #[tokio::test]
    async fn expands_nested_parameter_trees() {
        let temp = TempDir::new().unwrap();
        let (variables, vault) = fixtures(&temp).await;
        let event = json!({"user": "alice"});
        let interp = Interpolator::new(&variables, &vault, &event);

        let params = json!({
            "text": "hi ${event:user}",
            "headers": {"authorization": "Bearer ${vault:token}"},
            "tags": ["${foo}", 7]
        });
        let expanded = interp.expand_value(&params).await.unwrap();
        assert_eq!(
            expanded,
            json!({
                "text": "hi alice",
                "headers": {"authorization": "Bearer s3cret"},
                "tags": ["bar", 7]
            })
        );
    }
}
