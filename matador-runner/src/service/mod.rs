//! Service layer
//!
//! The experiment service drives one pair attempt through its external
//! stages and classifies the result. It is trait-based so the scheduler can
//! be tested against scripted outcomes.

mod experiment;

pub use experiment::{ExperimentService, ExperimentTiming, StandardExperimentService};
