//! Bluetooth COM-port selection and failure classification.

pub mod classify;
pub mod ports;

pub use classify::{FailureClassification, FailurePhase, FailureSummary, classify, summarize};
pub use ports::{PlanStrategy, PortPlan, SerialCandidate, candidate_plans, discover_candidates};
