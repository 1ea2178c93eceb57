//! Matador Core
//!
//! Core types and algorithms for the Matador pairwise measurement runner.
//!
//! This crate contains:
//! - Domain types: nodes, candidate pool, status matrix, attempts, outcomes
//! - Command templates: typed registry of the external stage commands
//!
//! Nothing in here spawns processes. Execution lives in the runner.

pub mod domain;
pub mod template;

pub use domain::attempt::{Attempt, Endpoint};
pub use domain::matrix::{InvalidCellCode, PairCell, StatusMatrix};
pub use domain::node::{CandidatePool, Coordinates, CountryGroup, Node, RecordError, parse_records};
pub use domain::outcome::{Failure, Outcome, Side};
pub use template::{CommandTemplate, Placeholder, Stage, TemplateError, TemplateParams, TemplateRegistry};
