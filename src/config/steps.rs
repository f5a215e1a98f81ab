use super::params::{self, Variables};
use serde::de::{self, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Ordered fallback list of selector strings, tried left to right.
pub type SelectorAlternative = Vec<String>;

/// All selector alternatives for a step, tried in order until one resolves.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Selectors(pub Vec<SelectorAlternative>);

impl Selectors {
    pub fn new(alternatives: Vec<SelectorAlternative>) -> Self {
        Self(alternatives)
    }

    /// One alternative holding a single selector.
    pub fn single(selector: impl Into<String>) -> Self {
        Self(vec![vec![selector.into()]])
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|alt| alt.is_empty())
    }

    pub fn alternatives(&self) -> &[SelectorAlternative] {
        &self.0
    }
}

impl fmt::Display for Selectors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flat: Vec<&str> = self.0.iter().flatten().map(|s| s.as_str()).collect();
        write!(f, "[{}]", flat.join(", "))
    }
}

impl<'de> Deserialize<'de> for Selectors {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Item {
            One(String),
            Many(Vec<String>),
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            List(Vec<Item>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::One(s) => Selectors(vec![vec![s]]),
            Raw::List(items) => Selectors(
                items
                    .into_iter()
                    .map(|item| match item {
                        Item::One(s) => vec![s],
                        Item::Many(v) => v,
                    })
                    .collect(),
            ),
        })
    }
}

/// Step kinds, used for reporting and progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Navigate,
    Click,
    Type,
    Hover,
    Scroll,
    WaitForElement,
    WaitForExpression,
    SetViewport,
    KeyEvent,
    NestedSteps,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Click => "click",
            Self::Type => "type",
            Self::Hover => "hover",
            Self::Scroll => "scroll",
            Self::WaitForElement => "wait-for-element",
            Self::WaitForExpression => "wait-for-expression",
            Self::SetViewport => "set-viewport",
            Self::KeyEvent => "key-event",
            Self::NestedSteps => "nested-steps",
        }
    }

    /// Whether steps of this kind target an element that should be clickable.
    pub fn is_click_class(&self) -> bool {
        matches!(self, Self::Click)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step does.
#[derive(Debug, Clone)]
pub enum Action {
    Navigate(NavigateAction),
    Click(ClickAction),
    Type(TypeAction),
    Hover(TargetAction),
    Scroll(ScrollAction),
    WaitForElement(WaitForElementAction),
    WaitForExpression(WaitForExpressionAction),
    SetViewport(SetViewportAction),
    Key(KeyAction),
    Steps(StepsAction),
}

impl Action {
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Navigate(_) => StepKind::Navigate,
            Self::Click(_) => StepKind::Click,
            Self::Type(_) => StepKind::Type,
            Self::Hover(_) => StepKind::Hover,
            Self::Scroll(_) => StepKind::Scroll,
            Self::WaitForElement(_) => StepKind::WaitForElement,
            Self::WaitForExpression(_) => StepKind::WaitForExpression,
            Self::SetViewport(_) => StepKind::SetViewport,
            Self::Key(_) => StepKind::KeyEvent,
            Self::Steps(_) => StepKind::NestedSteps,
        }
    }
}

/// Accepted values of a step's `type` field.
pub const STEP_TYPES: &[&str] = &[
    "navigate",
    "click",
    "doubleClick",
    "type",
    "change",
    "hover",
    "scroll",
    "waitForElement",
    "waitForExpression",
    "setViewport",
    "keyDown",
    "keyUp",
    "keyPress",
    "steps",
];

/// One automation instruction.
///
/// The raw JSON is kept alongside the typed form so that placeholders can be
/// substituted into every string field right before the step runs.
#[derive(Debug, Clone)]
pub struct Step {
    pub action: Action,
    /// Skip the step when this evaluates false.
    pub condition: Option<Condition>,
    /// Repeat the step body.
    pub repeat: Option<LoopSpec>,
    /// Per-step timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
    source: Value,
}

#[derive(Deserialize)]
struct Common {
    #[serde(default)]
    condition: Option<Condition>,
    #[serde(rename = "loop", default)]
    repeat: Option<LoopSpec>,
    #[serde(default)]
    timeout: Option<u64>,
}

impl Step {
    /// Build a step from its JSON form. Unknown `type` values are rejected.
    pub fn from_value(source: Value) -> Result<Self, serde_json::Error> {
        let ty = source
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| serde_json::Error::custom("step is missing a string `type` field"))?
            .to_string();

        let action = match ty.as_str() {
            "navigate" => Action::Navigate(serde_json::from_value(source.clone())?),
            "click" | "doubleClick" => {
                let mut a: ClickAction = serde_json::from_value(source.clone())?;
                a.click_count = if ty == "doubleClick" { 2 } else { 1 };
                Action::Click(a)
            }
            "type" | "change" => Action::Type(serde_json::from_value(source.clone())?),
            "hover" => Action::Hover(serde_json::from_value(source.clone())?),
            "scroll" => Action::Scroll(serde_json::from_value(source.clone())?),
            "waitForElement" => Action::WaitForElement(serde_json::from_value(source.clone())?),
            "waitForExpression" => {
                Action::WaitForExpression(serde_json::from_value(source.clone())?)
            }
            "setViewport" => Action::SetViewport(serde_json::from_value(source.clone())?),
            "keyDown" | "keyUp" | "keyPress" => {
                let mut a: KeyAction = serde_json::from_value(source.clone())?;
                a.direction = match ty.as_str() {
                    "keyDown" => KeyDirection::Down,
                    "keyUp" => KeyDirection::Up,
                    _ => KeyDirection::Press,
                };
                Action::Key(a)
            }
            "steps" => Action::Steps(serde_json::from_value(source.clone())?),
            other => return Err(de::Error::unknown_variant(other, STEP_TYPES)),
        };

        let common: Common = serde_json::from_value(source.clone())?;
        Ok(Self {
            action,
            condition: common.condition,
            repeat: common.repeat,
            timeout_ms: common.timeout,
            source,
        })
    }

    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }

    /// The JSON form this step was parsed from.
    pub fn source(&self) -> &Value {
        &self.source
    }

    /// Return a copy of this step (and its children) with placeholders substituted.
    ///
    /// Runs even with no variables so unresolved placeholders are still logged.
    pub fn resolve(&self, vars: &Variables) -> Result<Step, serde_json::Error> {
        let mut source = self.source.clone();
        params::substitute_value(&mut source, vars);
        if source == self.source {
            return Ok(self.clone());
        }
        Step::from_value(source)
    }

    /// Nested children, if this is a `steps` step.
    pub fn children(&self) -> &[Step] {
        match &self.action {
            Action::Steps(a) => &a.steps,
            _ => &[],
        }
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let source = Value::deserialize(deserializer)?;
        Step::from_value(source).map_err(D::Error::custom)
    }
}

// --- Step payloads ---

#[derive(Debug, Clone, Deserialize)]
pub struct NavigateAction {
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    #[serde(alias = "primary")]
    Left,
    #[serde(alias = "auxiliary")]
    Middle,
    #[serde(alias = "secondary")]
    Right,
}

impl MouseButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Middle => "middle",
            Self::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickAction {
    pub selectors: Selectors,
    /// Offset from the element's top-left corner. Defaults to the center.
    #[serde(rename = "offsetX")]
    pub offset_x: Option<f64>,
    #[serde(rename = "offsetY")]
    pub offset_y: Option<f64>,
    #[serde(default)]
    pub button: MouseButton,
    #[serde(skip)]
    pub click_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypeAction {
    pub selectors: Selectors,
    pub value: String,
}

/// Generic payload that just needs a target element.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetAction {
    pub selectors: Selectors,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScrollAction {
    /// Scroll inside this element instead of the window.
    #[serde(default)]
    pub selectors: Selectors,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaitForElementAction {
    pub selectors: Selectors,
    #[serde(default)]
    pub visible: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaitForExpressionAction {
    pub expression: String,
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetViewportAction {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_scale")]
    pub device_scale_factor: f64,
    #[serde(default)]
    pub is_mobile: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyDirection {
    Down,
    Up,
    #[default]
    Press,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyAction {
    pub key: String,
    #[serde(skip)]
    pub direction: KeyDirection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepsAction {
    pub steps: Vec<Step>,
}

/// Loop descriptor: run the step body `iterations` times.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSpec {
    pub iterations: u32,
    #[serde(default)]
    pub wait_between_ms: u64,
    /// Checked before each iteration; a false result ends the loop.
    #[serde(default)]
    pub condition: Option<Condition>,
}

/// A check against current page state.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawCondition")]
pub enum Condition {
    /// JS expression, truthy result passes.
    Expression(String),
    /// Element presence (or absence when `exists` is false).
    Element { selectors: Selectors, exists: bool },
    UrlContains(String),
    TextContains(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCondition {
    Expression(String),
    Map(ConditionMap),
}

fn yes() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConditionMap {
    expression: Option<String>,
    selectors: Option<Selectors>,
    #[serde(default = "yes")]
    exists: bool,
    url_contains: Option<String>,
    text_contains: Option<String>,
}

impl TryFrom<RawCondition> for Condition {
    type Error = String;

    fn try_from(raw: RawCondition) -> Result<Self, Self::Error> {
        let map = match raw {
            RawCondition::Expression(e) => return Ok(Condition::Expression(e)),
            RawCondition::Map(m) => m,
        };
        let mut found = Vec::new();
        if let Some(e) = map.expression {
            found.push(Condition::Expression(e));
        }
        if let Some(selectors) = map.selectors {
            found.push(Condition::Element {
                selectors,
                exists: map.exists,
            });
        }
        if let Some(u) = map.url_contains {
            found.push(Condition::UrlContains(u));
        }
        if let Some(t) = map.text_contains {
            found.push(Condition::TextContains(t));
        }
        match found.len() {
            1 => Ok(found.remove(0)),
            0 => Err("condition needs one of expression, selectors, urlContains, textContains".into()),
            _ => Err("condition must specify exactly one check".into()),
        }
    }
}
