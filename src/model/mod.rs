//! Core data model.
//!
//! An event is something notable that happened. A rule decides which
//! channels and recipients see it.

pub mod event;
pub mod rule;
pub mod vocab;

pub use event::{Event, EventId};
pub use rule::{Routing, Rule, RuleDraft, RuleId, RuleSpec};
pub use vocab::{Channel, Severity};
