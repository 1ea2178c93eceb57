//! Attempt value object
//!
//! Built fresh for each coordinator invocation and dropped afterwards.

use chrono::{DateTime, Local};

use crate::domain::node::{Coordinates, Node};
use crate::domain::outcome::Side;
use crate::template::{Placeholder, TemplateParams};

/// Timestamp format used in capture file names
pub const TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H:%M:%S";

/// One endpoint of an attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub country_code: String,
    pub hostname: String,
    pub coordinates: Coordinates,
}

impl From<&Node> for Endpoint {
    fn from(node: &Node) -> Self {
        Self {
            country_code: node.country_code.clone(),
            hostname: node.hostname.clone(),
            coordinates: node.coordinates.clone(),
        }
    }
}

/// A single pair attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub a: Endpoint,
    pub b: Endpoint,
    /// Global attempt counter at the time of this attempt
    pub counter: u32,
    /// Root directory for results on both endpoints, with trailing slash
    pub storage_root: String,
}

impl Attempt {
    pub fn new(a: Endpoint, b: Endpoint, counter: u32, storage_root: impl Into<String>) -> Self {
        let mut storage_root = storage_root.into();
        if !storage_root.is_empty() && !storage_root.ends_with('/') {
            storage_root.push('/');
        }
        Self {
            a,
            b,
            counter,
            storage_root,
        }
    }

    pub fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }

    /// Counter zero-padded to four digits
    pub fn sequence_label(&self) -> String {
        format!("{:04}", self.counter)
    }

    /// Per-workload result directory
    pub fn workload_dir(&self, workload: &str) -> String {
        format!("{}{}/", self.storage_root, workload)
    }

    /// Capture file name for one side of a workload run
    pub fn capture_file(&self, side: Side, workload: &str, at: DateTime<Local>) -> String {
        let own = self.endpoint(side);
        let peer = self.endpoint(side.other());
        format!(
            "{}_{}_{}_{}_{}_capture_to_{}_{}_{}.dump",
            self.sequence_label(),
            side.number(),
            workload,
            own.country_code,
            own.hostname,
            peer.country_code,
            peer.hostname,
            at.format(TIMESTAMP_FORMAT)
        )
    }

    /// Template parameters describing `side` and its peer
    ///
    /// Workload-specific slots are added by the caller.
    pub fn params(&self, side: Side) -> TemplateParams {
        let own = self.endpoint(side);
        let peer = self.endpoint(side.other());
        TemplateParams::new()
            .with(Placeholder::Hostname, own.hostname.as_str())
            .with(Placeholder::Country, own.country_code.as_str())
            .with(Placeholder::Coordinates, own.coordinates.to_string())
            .with(Placeholder::PeerHostname, peer.hostname.as_str())
            .with(Placeholder::PeerCountry, peer.country_code.as_str())
            .with(Placeholder::PeerCoordinates, peer.coordinates.to_string())
            .with(Placeholder::Storage, self.storage_root.as_str())
            .with(Placeholder::Counter, self.sequence_label())
    }

    /// Human-readable pair description for log lines
    pub fn describe(&self) -> String {
        format!(
            "#{} {}/{} <-> {}/{}",
            self.sequence_label(),
            self.a.country_code,
            self.a.hostname,
            self.b.country_code,
            self.b.hostname
        )
    }
}
