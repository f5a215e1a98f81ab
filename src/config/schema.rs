use super::params::Variables;
use super::steps::{Action, Step};
use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Maximum nesting of `steps` blocks accepted at load time.
pub const MAX_NESTING_DEPTH: usize = 16;

/// A declarative automation program.
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    /// Identifier assigned by the store it was loaded from.
    #[serde(skip)]
    pub id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Named defaults for `{{name}}` placeholders.
    #[serde(default)]
    pub parameters: Variables,

    /// Steps to execute, in order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Script {
    /// Load a script from a JSON or YAML file. The file stem becomes the id.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut script = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::parse_yaml(&content)?,
            _ => Self::parse(&content)?,
        };
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            script.id = stem.to_string();
        }
        Ok(script)
    }

    /// Parse a script from a JSON string.
    pub fn parse(json: &str) -> Result<Self> {
        let script: Script = serde_json::from_str(json)?;
        script.validate()?;
        Ok(script)
    }

    /// Parse a script from a YAML string.
    pub fn parse_yaml(yaml: &str) -> Result<Self> {
        // Round-trip through JSON values so steps keep a JSON source for substitution.
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        let script: Script = serde_json::from_value(value)?;
        script.validate()?;
        Ok(script)
    }

    /// Set the id and return self.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Total number of steps including nested ones.
    pub fn step_count(&self) -> usize {
        fn count(steps: &[Step]) -> usize {
            steps.iter().map(|s| 1 + count(s.children())).sum()
        }
        count(&self.steps)
    }

    fn validate(&self) -> Result<()> {
        fn check(steps: &[Step], depth: usize) -> Result<()> {
            if depth > MAX_NESTING_DEPTH {
                return Err(Error::Config(format!(
                    "steps nested deeper than {} levels",
                    MAX_NESTING_DEPTH
                )));
            }
            for step in steps {
                match &step.action {
                    Action::Navigate(a) if a.url.is_empty() => {
                        return Err(Error::Config("navigate step needs a url".into()));
                    }
                    Action::Click(a) if a.selectors.is_empty() => {
                        return Err(Error::Config("click step needs selectors".into()));
                    }
                    Action::Type(a) if a.selectors.is_empty() => {
                        return Err(Error::Config("type step needs selectors".into()));
                    }
                    Action::Hover(a) if a.selectors.is_empty() => {
                        return Err(Error::Config("hover step needs selectors".into()));
                    }
                    Action::WaitForElement(a) if a.selectors.is_empty() => {
                        return Err(Error::Config("waitForElement step needs selectors".into()));
                    }
                    Action::Steps(a) => check(&a.steps, depth + 1)?,
                    _ => {}
                }
            }
            Ok(())
        }
        check(&self.steps, 0)
    }
}
