//! Final status matrix snapshot

use anyhow::{Context, Result};
use matador_core::StatusMatrix;
use serde::Serialize;
use std::path::Path;

use crate::scheduler::RunOutcome;

/// JSON record of a finished run
#[derive(Debug, Serialize)]
pub struct MatrixSnapshot<'a> {
    pub countries: Vec<String>,
    pub attempts: u32,
    pub outcome: String,
    pub exit_code: u8,
    pub matrix: &'a StatusMatrix,
}

impl<'a> MatrixSnapshot<'a> {
    pub fn new(
        countries: Vec<String>,
        attempts: u32,
        outcome: &RunOutcome,
        matrix: &'a StatusMatrix,
    ) -> Self {
        Self {
            countries,
            attempts,
            outcome: outcome.to_string(),
            exit_code: outcome.exit_code(),
            matrix,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize matrix")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write matrix to {}", path.display()))
    }
}
