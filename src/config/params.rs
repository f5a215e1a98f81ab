use crate::{Error, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Named values available to `{{name}}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables {
    values: HashMap<String, String>,
}

impl Variables {
    /// Create empty variables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Insert a value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Get a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `overrides` on top of `defaults`. Keys present in both take the override.
    pub fn merged(defaults: &Variables, overrides: &Variables) -> Self {
        let mut values = defaults.values.clone();
        for (k, v) in &overrides.values {
            values.insert(k.clone(), v.clone());
        }
        Self { values }
    }

    /// Parse from CLI args like "key=value".
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut vars = Self::new();
        for arg in args {
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                Error::Config(format!("invalid param '{}', expected key=value", arg))
            })?;
            vars.values.insert(key.to_string(), value.to_string());
        }
        Ok(vars)
    }
}

impl From<HashMap<String, String>> for Variables {
    fn from(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

impl FromIterator<(String, String)> for Variables {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Substitute `{{name}}` placeholders in a string.
///
/// Unknown names are left verbatim and logged; they are never an error.
pub fn substitute(template: &str, vars: &Variables) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    placeholder()
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            match vars.get(name) {
                Some(value) => {
                    debug!("substituted {{{{{}}}}}", name);
                    value.to_string()
                }
                None => {
                    warn!("unresolved placeholder {{{{{}}}}} left as-is", name);
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

/// Recursively substitute placeholders in every string of a JSON value.
/// Object keys are left untouched.
pub fn substitute_value(value: &mut Value, vars: &Variables) {
    match value {
        Value::String(s) => {
            if s.contains("{{") {
                *s = substitute(s, vars);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                substitute_value(v, vars);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_value(v, vars);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substitute_simple() {
        let vars = Variables::new().set("q", "hello");
        assert_eq!(substitute("{{q}}", &vars), "hello");
    }

    #[test]
    fn test_substitute_multiple_and_spacing() {
        let vars = Variables::new().set("a", "1").set("b", "2");
        assert_eq!(substitute("{{a}} + {{ b }} = 3", &vars), "1 + 2 = 3");
    }

    #[test]
    fn test_substitute_unresolved_left_verbatim() {
        let vars = Variables::new().set("a", "1");
        assert_eq!(substitute("{{a}}/{{missing}}", &vars), "1/{{missing}}");
    }

    #[test]
    fn test_substitute_value_noop_without_references() {
        let original = json!({
            "type": "type",
            "selectors": [["#search"]],
            "value": "{{other}} and plain text",
            "nested": [{"url": "https://example.com/{{x}}"}]
        });
        let mut value = original.clone();
        substitute_value(&mut value, &Variables::new().set("unused", "zzz"));
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            serde_json::to_string(&original).unwrap()
        );
    }

    #[test]
    fn test_substitute_value_nested() {
        let mut value = json!({
            "steps": [{"type": "navigate", "url": "https://{{host}}/search?q={{q}}"}],
            "{{q}}": "key untouched"
        });
        let vars = Variables::new().set("host", "example.com").set("q", "rust");
        substitute_value(&mut value, &vars);
        assert_eq!(value["steps"][0]["url"], "https://example.com/search?q=rust");
        assert!(value.get("{{q}}").is_some());
    }

    #[test]
    fn test_merged_override_wins() {
        let defaults = Variables::new().set("a", "default").set("b", "keep");
        let overrides = Variables::new().set("a", "override").set("c", "new");
        let merged = Variables::merged(&defaults, &overrides);
        assert_eq!(merged.get("a"), Some("override"));
        assert_eq!(merged.get("b"), Some("keep"));
        assert_eq!(merged.get("c"), Some("new"));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_params_from_args() {
        let args = vec!["user=alice".to_string(), "query=a=b".to_string()];
        let vars = Variables::from_args(&args).unwrap();
        assert_eq!(vars.get("user"), Some("alice"));
        assert_eq!(vars.get("query"), Some("a=b"));
        assert!(Variables::from_args(&["nope".to_string()]).is_err());
    }
}
