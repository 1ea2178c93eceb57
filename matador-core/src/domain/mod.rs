//! Core domain types
//!
//! These types are shared by the pairing scheduler (which owns the pool and
//! the matrix) and the experiment coordinator (which consumes attempts and
//! produces outcomes).

pub mod attempt;
pub mod matrix;
pub mod node;
pub mod outcome;
