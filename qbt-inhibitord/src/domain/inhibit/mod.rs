pub mod arbiter;
pub mod holder;
pub mod signal;
pub mod source;
pub mod value_object;

pub use arbiter::{arbitrate, Arbiter, ArbiterPhase, Decision, Enforcement, TickOutcome};
pub use holder::{HolderError, InhibitHolder};
pub use signal::ChangeEvent;
pub use source::{InhibitSource, Vote};
pub use value_object::{SourceRole, StateSnapshot, StateUpdate};
