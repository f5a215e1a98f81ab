use crate::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Per-installation settings. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Timeout for steps that wait on the page, unless the step sets its own.
    pub default_timeout_ms: u64,
    /// Poll interval for waits and element resolution.
    pub poll_interval_ms: u64,
    /// Debug pacing: pause between steps.
    pub step_delay_ms: u64,
    /// Keep sessions attached after a script completes.
    pub keep_alive: bool,
    pub session: SessionSettings,
    pub relay: RelaySettings,
    pub clickable: ClickableSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            poll_interval_ms: 100,
            step_delay_ms: 0,
            keep_alive: true,
            session: SessionSettings::default(),
            relay: RelaySettings::default(),
            clickable: ClickableSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse settings from YAML.
    pub fn parse(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Pause before the single reattach attempt after an unexpected detach.
    pub reattach_backoff_ms: u64,
    /// How long to wait for a freshly attached page to report ready.
    pub ready_timeout_ms: u64,
    /// How long a step waits for the reattach outcome before giving up.
    pub recover_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reattach_backoff_ms: 100,
            ready_timeout_ms: 10_000,
            recover_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Pending requests are rejected after this long.
    pub timeout_ms: u64,
    /// How often the pending map is swept for expired entries.
    pub sweep_interval_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5 * 60 * 1000,
            sweep_interval_ms: 1_000,
            reconnect_attempts: 5,
            reconnect_backoff_ms: 250,
        }
    }
}

/// Predicate used by the clickable-ancestor walk.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ClickableSettings {
    pub max_depth: u32,
    pub tags: Vec<String>,
    pub roles: Vec<String>,
    /// Substrings matched against class names and data attributes.
    pub keywords: Vec<String>,
}

impl Default for ClickableSettings {
    fn default() -> Self {
        let list = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            max_depth: 10,
            tags: list(&["a", "button", "input", "select", "textarea", "label", "summary", "option"]),
            roles: list(&[
                "button", "link", "menuitem", "option", "tab", "checkbox", "radio", "switch",
                "treeitem",
            ]),
            keywords: list(&["btn", "button", "clickable", "link", "card", "item"]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_settings_use_defaults() {
        let s = Settings::parse("").unwrap();
        assert_eq!(s.default_timeout_ms, 10_000);
        assert!(s.keep_alive);
        assert_eq!(s.session.reattach_backoff_ms, 100);
        assert_eq!(s.relay.timeout_ms, 300_000);
        assert_eq!(s.clickable.max_depth, 10);
    }

    #[test]
    fn test_partial_settings() {
        let yaml = r#"
step_delay_ms: 250
keep_alive: false
relay:
  timeout_ms: 2000
clickable:
  max_depth: 4
  tags: [button]
"#;
        let s = Settings::parse(yaml).unwrap();
        assert_eq!(s.step_delay_ms, 250);
        assert!(!s.keep_alive);
        assert_eq!(s.relay.timeout_ms, 2000);
        assert_eq!(s.relay.sweep_interval_ms, 1_000);
        assert_eq!(s.clickable.max_depth, 4);
        assert_eq!(s.clickable.tags, vec!["button"]);
        assert!(!s.clickable.roles.is_empty());
    }
}
