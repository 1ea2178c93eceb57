//! Pairing scheduler
//!
//! Sweeps every ordered pair of countries (row `i`, column `j`) and runs an
//! attempt for each cell that is still untried or needs a retry, using the
//! current front hostname of both countries.
//!
//! Outcomes move the sweep as follows:
//! - Success: cell becomes succeeded, counter increments, next column
//! - Endpoint A failure: front node of row country is discarded, its
//!   succeeded cells go back to retry and the row is processed again
//! - Endpoint B failure: same for the column country; when it lies before the
//!   current row the sweep restarts at that country, otherwise at the next row
//! - Transient: cell becomes isolated retry, counter increments, next column
//! - Fatal: the run stops
//!
//! A country without candidates left gets its untried cells exhausted and is
//! skipped from then on.

use matador_core::{Attempt, CandidatePool, Endpoint, Outcome, PairCell, StatusMatrix};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::service::ExperimentService;

/// How a scheduling run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every pair reached a terminal state
    Completed,
    /// Stopped early by a fatal failure or interruption
    Aborted(String),
}

impl RunOutcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Aborted(_) => 3,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => f.write_str("completed"),
            RunOutcome::Aborted(reason) => write!(f, "aborted: {}", reason),
        }
    }
}

/// Owns the candidate pool and status matrix for one run
pub struct PairingScheduler {
    pool: CandidatePool,
    matrix: StatusMatrix,
    counter: u32,
    storage_root: String,
    service: Arc<dyn ExperimentService>,
    cancel: CancellationToken,
}

impl PairingScheduler {
    pub fn new(
        pool: CandidatePool,
        storage_root: impl Into<String>,
        service: Arc<dyn ExperimentService>,
        cancel: CancellationToken,
    ) -> Self {
        let matrix = StatusMatrix::new(pool.len());
        Self {
            pool,
            matrix,
            counter: 0,
            storage_root: storage_root.into(),
            service,
            cancel,
        }
    }

    pub fn matrix(&self) -> &StatusMatrix {
        &self.matrix
    }

    pub fn pool(&self) -> &CandidatePool {
        &self.pool
    }

    /// Global attempt counter; counts successful and transient attempts
    pub fn attempts(&self) -> u32 {
        self.counter
    }

    /// Country codes in matrix order
    pub fn labels(&self) -> Vec<String> {
        self.pool.country_codes()
    }

    /// Runs the sweep until every pair is resolved or a fatal failure occurs
    pub async fn run(&mut self) -> RunOutcome {
        let size = self.pool.len() as isize;
        info!("Scheduling pairs across {} countries", size);

        let mut i: isize = 0;
        while i < size {
            let row = i as usize;

            if !self.pool.has_candidates(row) {
                self.exhaust(row);
                i += 1;
                continue;
            }

            let mut j = 0;
            while j < self.pool.len() {
                if self.cancel.is_cancelled() {
                    warn!("Run interrupted before attempt {}", self.counter);
                    return RunOutcome::Aborted("interrupted".to_string());
                }

                if !self.pool.has_candidates(j) {
                    self.exhaust(j);
                    j += 1;
                    continue;
                }

                if !self.matrix.get(row, j).is_schedulable() {
                    j += 1;
                    continue;
                }

                let Some(attempt) = self.attempt_for(row, j) else {
                    j += 1;
                    continue;
                };

                info!(
                    "Start experiment {} between {} and {}",
                    attempt.sequence_label(),
                    attempt.a.hostname,
                    attempt.b.hostname
                );

                let outcome = self.service.run_attempt(&attempt, &self.cancel).await;
                match outcome {
                    Outcome::Success => {
                        self.matrix.set_pair(row, j, PairCell::Succeeded);
                        self.counter += 1;
                        info!("Experiment {} was successful", attempt.sequence_label());
                        j += 1;
                    }
                    Outcome::Transient(msg) => {
                        warn!(
                            "Experiment {} hit a transient failure, moving on with the next pair: {}",
                            attempt.sequence_label(),
                            msg
                        );
                        self.matrix.set_pair(row, j, PairCell::IsolatedRetry);
                        self.counter += 1;
                        j += 1;
                    }
                    Outcome::EndpointAFailure(msg) => {
                        self.replace_front(row, &attempt.a.hostname, &msg);
                        i -= 1;
                        break;
                    }
                    Outcome::EndpointBFailure(msg) => {
                        self.replace_front(j, &attempt.b.hostname, &msg);
                        let column = j as isize;
                        if i > column {
                            i = column - 1;
                        }
                        break;
                    }
                    Outcome::Fatal(msg) => {
                        error!(
                            "A fatal failure occurred in experiment {}, the measurement is terminated: {}",
                            attempt.sequence_label(),
                            msg
                        );
                        return RunOutcome::Aborted(msg);
                    }
                }
            }

            i += 1;
        }

        info!(
            "All pairs resolved after {} experiment(s): {} succeeded, {} isolated retry, {} exhausted",
            self.counter,
            self.pairs_in(PairCell::Succeeded),
            self.pairs_in(PairCell::IsolatedRetry),
            self.pairs_in(PairCell::Exhausted),
        );
        RunOutcome::Completed
    }

    fn attempt_for(&self, i: usize, j: usize) -> Option<Attempt> {
        let a = self.pool.front(i)?;
        let b = self.pool.front(j)?;
        Some(Attempt::new(
            Endpoint::from(a),
            Endpoint::from(b),
            self.counter,
            self.storage_root.as_str(),
        ))
    }

    /// Discards the failed front node of `country` and reopens its succeeded pairs
    ///
    /// A country left without candidates is exhausted right away; the sweep
    /// may never visit its row again.
    fn replace_front(&mut self, country: usize, hostname: &str, reason: &str) {
        warn!(
            "{} did not work properly: {}. The next hostname of {} will be tried",
            hostname,
            reason,
            self.pool.country(country).unwrap_or("?")
        );
        self.pool.discard_front(country);
        let demoted = self.matrix.demote_country(country);
        debug!(
            "{} pair(s) of {} set back to retry, {} candidate(s) left",
            demoted,
            self.pool.country(country).unwrap_or("?"),
            self.pool.remaining(country)
        );

        if !self.pool.has_candidates(country) {
            self.exhaust(country);
        }
    }

    fn exhaust(&mut self, country: usize) {
        let exhausted = self.matrix.exhaust_country(country);
        if exhausted > 0 {
            warn!(
                "All nodes of {} did not work, {} pair(s) exhausted",
                self.pool.country(country).unwrap_or("?"),
                exhausted
            );
        }
    }

    /// Unordered pairs in state `cell`
    fn pairs_in(&self, cell: PairCell) -> usize {
        let diagonal = (0..self.matrix.size())
            .filter(|&k| self.matrix.get(k, k) == cell)
            .count();
        (self.matrix.count(cell) + diagonal) / 2
    }
}
