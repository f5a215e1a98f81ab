pub mod params;
pub mod schema;
pub mod settings;
pub mod steps;

pub use params::Variables;
pub use schema::Script;
pub use settings::{ClickableSettings, RelaySettings, SessionSettings, Settings};
pub use steps::{Action, Condition, LoopSpec, Selectors, Step, StepKind};
