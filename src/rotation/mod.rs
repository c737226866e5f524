//! Dual-slot rotation.
//!
//! Two database users (slot A and slot B) exist at all times. A run moves the
//! application from the active slot to the standby slot, and only after the
//! application is verified on the new slot does it give the old slot a fresh
//! password. Both users authenticate during the rolling restart, so old and
//! new replicas can coexist.
//!
//! - [`plan`] decides what a run does from durable state
//! - [`RotationEngine`] executes the decision
//! - [`RunReport`] summarizes the outcome

pub mod engine;
pub mod plan;
pub mod report;

pub use engine::{RotationEngine, RotationRun};
pub use plan::Plan;
pub use report::{RunReport, RunStatus, Severity};
