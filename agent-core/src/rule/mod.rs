pub mod callback;
mod engine;
pub mod schema;
pub mod verify;

pub use engine::{Engine, RuleDiagnostic, SetRulesOptions, SetRulesReport};
pub use schema::{Hookpoint, Rule, RuleData, RulePack, RuleSignature};
pub use verify::RuleVerifier;
