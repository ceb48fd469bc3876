//! Domain model module declarations.

pub mod identity;
pub mod recipe;
pub mod report;

pub use identity::{ConfigIdentity, Identity, IdentityProvider};
pub use recipe::{Parameters, Recipe, Step};
pub use report::{StepOutcome, StepReport, StepResult};
