//! Attempt outcomes and the failure taxonomy
//!
//! Every failure of an external operation is classified into one of four
//! tiers. The scheduler reacts only to these tiers.

use std::fmt;

use thiserror::Error;

/// Which endpoint of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    A,
    B,
}

impl Side {
    /// 1-based index used in result file names
    pub fn number(self) -> u8 {
        match self {
            Side::A => 1,
            Side::B => 2,
        }
    }

    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => f.write_str("A"),
            Side::B => f.write_str("B"),
        }
    }
}

/// A classified failure raised inside an attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Failure {
    /// Site-specific failure; recovered by replacing that endpoint's node
    #[error("endpoint {0} failure: {1}")]
    Endpoint(Side, String),

    /// Pair-level failure; no change to the candidate pool
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unrecoverable; the whole run stops
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl Failure {
    pub fn endpoint(side: Side, message: impl Into<String>) -> Self {
        Self::Endpoint(side, message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn severity(&self) -> u8 {
        Outcome::from(self.clone()).severity()
    }
}

/// Result of one pair attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    EndpointAFailure(String),
    EndpointBFailure(String),
    Fatal(String),
    Transient(String),
}

impl Outcome {
    /// Fatal > endpoint failure > transient > success
    pub fn severity(&self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::Transient(_) => 1,
            Outcome::EndpointAFailure(_) | Outcome::EndpointBFailure(_) => 2,
            Outcome::Fatal(_) => 3,
        }
    }

    /// Keeps the more severe of `self` and `other`
    ///
    /// On equal severity the existing outcome wins.
    pub fn escalate(self, other: Outcome) -> Outcome {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Outcome::Fatal(_))
    }

    /// Short name for log lines
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::EndpointAFailure(_) => "endpoint-a-failure",
            Outcome::EndpointBFailure(_) => "endpoint-b-failure",
            Outcome::Fatal(_) => "fatal",
            Outcome::Transient(_) => "transient",
        }
    }

    /// Failure message, if any
    pub fn message(&self) -> Option<&str> {
        match self {
            Outcome::Success => None,
            Outcome::EndpointAFailure(msg)
            | Outcome::EndpointBFailure(msg)
            | Outcome::Fatal(msg)
            | Outcome::Transient(msg) => Some(msg),
        }
    }
}

impl From<Failure> for Outcome {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Endpoint(Side::A, msg) => Outcome::EndpointAFailure(msg),
            Failure::Endpoint(Side::B, msg) => Outcome::EndpointBFailure(msg),
            Failure::Transient(msg) => Outcome::Transient(msg),
            Failure::Fatal(msg) => Outcome::Fatal(msg),
        }
    }
}

impl From<Result<(), Failure>> for Outcome {
    fn from(result: Result<(), Failure>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(failure) => failure.into(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{}: {}", self.label(), msg),
            None => f.write_str(self.label()),
        }
    }
}
