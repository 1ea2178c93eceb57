//! Pair status matrix
//!
//! Square, symmetric record of every country pair's state. Row and column
//! indices are country group indices of the candidate pool.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A number outside the pair cell codes 0 to 4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid pair cell code {0}")]
pub struct InvalidCellCode(pub u8);

/// State of one country pair
///
/// Serialized as its numeric code, the same value the audit table shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PairCell {
    /// Never tried and one of the countries ran out of candidates
    Exhausted = 0,
    /// Never tried
    Untried = 1,
    /// Succeeded once, but an endpoint was replaced afterwards
    Retry = 2,
    /// Succeeded
    Succeeded = 3,
    /// A transient failure occurred; needs a separate re-measurement
    IsolatedRetry = 4,
}

impl PairCell {
    /// Numeric code used in the rendered audit table
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether the scheduler should attempt this pair
    pub fn is_schedulable(self) -> bool {
        matches!(self, PairCell::Untried | PairCell::Retry)
    }
}

impl From<PairCell> for u8 {
    fn from(cell: PairCell) -> Self {
        cell.code()
    }
}

impl TryFrom<u8> for PairCell {
    type Error = InvalidCellCode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(PairCell::Exhausted),
            1 => Ok(PairCell::Untried),
            2 => Ok(PairCell::Retry),
            3 => Ok(PairCell::Succeeded),
            4 => Ok(PairCell::IsolatedRetry),
            other => Err(InvalidCellCode(other)),
        }
    }
}

/// Symmetric matrix of pair states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMatrix {
    size: usize,
    cells: Vec<PairCell>,
}

impl StatusMatrix {
    /// Creates an `n x n` matrix with every pair untried
    pub fn new(size: usize) -> Self {
        Self {
            size,
            cells: vec![PairCell::Untried; size * size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the cell at `(i, j)`
    ///
    /// Out-of-range indices read as `Exhausted`.
    pub fn get(&self, i: usize, j: usize) -> PairCell {
        self.index(i, j)
            .and_then(|idx| self.cells.get(idx).copied())
            .unwrap_or(PairCell::Exhausted)
    }

    /// Writes `cell` to both `(i, j)` and `(j, i)`
    pub fn set_pair(&mut self, i: usize, j: usize, cell: PairCell) {
        for idx in [self.index(i, j), self.index(j, i)].into_iter().flatten() {
            self.cells[idx] = cell;
        }
    }

    /// Downgrades every succeeded pair involving country `k` to retry
    ///
    /// Returns the number of pairs changed.
    pub fn demote_country(&mut self, k: usize) -> usize {
        self.replace_in_cross(k, PairCell::Succeeded, PairCell::Retry)
    }

    /// Marks every untried pair involving country `k` as exhausted
    ///
    /// Retry cells are left alone. Returns the number of pairs changed.
    pub fn exhaust_country(&mut self, k: usize) -> usize {
        self.replace_in_cross(k, PairCell::Untried, PairCell::Exhausted)
    }

    /// Checks `matrix[i][j] == matrix[j][i]` for every pair
    pub fn is_symmetric(&self) -> bool {
        (0..self.size).all(|i| (0..self.size).all(|j| self.get(i, j) == self.get(j, i)))
    }

    /// Iterates over the rows as cell slices
    pub fn rows(&self) -> impl Iterator<Item = &[PairCell]> {
        self.cells.chunks(self.size.max(1))
    }

    /// Counts cells (both halves) currently in state `cell`
    pub fn count(&self, cell: PairCell) -> usize {
        self.cells.iter().filter(|c| **c == cell).count()
    }

    /// Renders the audit table with country codes as row and column headers
    ///
    /// ```text
    ///    BE CH
    /// BE 03 02
    /// CH 02 01
    /// ```
    pub fn render(&self, labels: &[String]) -> String {
        let mut out = String::from("   ");
        out.push_str(&labels.join(" "));
        out.push('\n');

        for (i, row) in self.rows().enumerate().take(self.size) {
            let label = labels.get(i).map(String::as_str).unwrap_or("??");
            let values: Vec<String> = row.iter().map(|c| format!("{:02}", c.code())).collect();
            out.push_str(label);
            out.push(' ');
            out.push_str(&values.join(" "));
            out.push('\n');
        }

        out
    }

    fn index(&self, i: usize, j: usize) -> Option<usize> {
        (i < self.size && j < self.size).then_some(i * self.size + j)
    }

    fn replace_in_cross(&mut self, k: usize, from: PairCell, to: PairCell) -> usize {
        if k >= self.size {
            return 0;
        }

        let mut changed = 0;
        for other in 0..self.size {
            if self.get(k, other) == from {
                self.set_pair(k, other, to);
                changed += 1;
            }
        }
        changed
    }
}
