//! Node records and the per-country candidate pool
//!
//! Input records arrive as one line per node:
//!
//! ```text
//! BE planetlab1.extern.kuleuven.be 50.8625 4.68599
//! CH planetlab2.inf.ethz.ch 47.3794 8.54513
//! ```
//!
//! Records must already be grouped by country code. The pool groups
//! contiguous runs of equal codes and never sorts, so an unsorted file
//! produces several groups for the same country.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing node records
#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    /// A line did not contain the four required fields
    #[error("line {line}: expected 'country hostname longitude latitude', found {found} field(s)")]
    MissingFields { line: usize, found: usize },

    /// A coordinate could not be parsed as a number
    #[error("line {line}: invalid {field} '{value}'")]
    InvalidCoordinate {
        line: usize,
        field: &'static str,
        value: String,
    },
}

/// Geographic position of a node
///
/// Displays as `longitude,latitude` using the record's own text, so a value
/// such as `4.0` reaches the location command unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub longitude: f64,
    pub latitude: f64,
    text: String,
}

impl Coordinates {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
            text: format!("{},{}", longitude, latitude),
        }
    }

    fn from_record(line: usize, longitude: &str, latitude: &str) -> Result<Self, RecordError> {
        Ok(Self {
            longitude: parse_coordinate(line, "longitude", longitude)?,
            latitude: parse_coordinate(line, "latitude", latitude)?,
            text: format!("{},{}", longitude, latitude),
        })
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// A remote vantage point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub country_code: String,
    pub hostname: String,
    pub coordinates: Coordinates,
}

/// Parses node records, one per line
///
/// Blank lines and lines starting with `#` are skipped. Fields beyond the
/// fourth are ignored.
pub fn parse_records(text: &str) -> Result<Vec<Node>, RecordError> {
    let mut nodes = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let [country, hostname, longitude, latitude, ..] = fields.as_slice() else {
            return Err(RecordError::MissingFields {
                line,
                found: fields.len(),
            });
        };

        nodes.push(Node {
            country_code: country.to_string(),
            hostname: hostname.to_string(),
            coordinates: Coordinates::from_record(line, longitude, latitude)?,
        });
    }

    Ok(nodes)
}

fn parse_coordinate(line: usize, field: &'static str, value: &str) -> Result<f64, RecordError> {
    value
        .parse::<f64>()
        .map_err(|_| RecordError::InvalidCoordinate {
            line,
            field,
            value: value.to_string(),
        })
}

/// The remaining candidate nodes of one country, consumed front to back
#[derive(Debug, Clone)]
pub struct CountryGroup {
    pub country_code: String,
    candidates: VecDeque<Node>,
}

impl CountryGroup {
    /// Current candidate, if any remain
    pub fn front(&self) -> Option<&Node> {
        self.candidates.front()
    }

    /// Number of candidates still available
    pub fn remaining(&self) -> usize {
        self.candidates.len()
    }
}

/// Candidate nodes grouped by country, in input order
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    groups: Vec<CountryGroup>,
}

impl CandidatePool {
    /// Groups contiguous records with equal country codes
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut groups: Vec<CountryGroup> = Vec::new();

        for node in nodes {
            match groups.last_mut() {
                Some(group) if group.country_code == node.country_code => {
                    group.candidates.push_back(node);
                }
                _ => groups.push(CountryGroup {
                    country_code: node.country_code.clone(),
                    candidates: VecDeque::from([node]),
                }),
            }
        }

        Self { groups }
    }

    /// Number of country groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Country code of group `idx`
    pub fn country(&self, idx: usize) -> Option<&str> {
        self.groups.get(idx).map(|g| g.country_code.as_str())
    }

    /// Current front candidate of group `idx`
    pub fn front(&self, idx: usize) -> Option<&Node> {
        self.groups.get(idx).and_then(CountryGroup::front)
    }

    /// Whether group `idx` still has at least one candidate
    pub fn has_candidates(&self, idx: usize) -> bool {
        self.front(idx).is_some()
    }

    pub fn remaining(&self, idx: usize) -> usize {
        self.groups.get(idx).map_or(0, CountryGroup::remaining)
    }

    /// Discards the front candidate of group `idx`
    ///
    /// Returns the discarded node, or `None` if the group was already empty.
    pub fn discard_front(&mut self, idx: usize) -> Option<Node> {
        self.groups
            .get_mut(idx)
            .and_then(|g| g.candidates.pop_front())
    }

    /// Country codes in group order, used as matrix labels
    pub fn country_codes(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.country_code.clone()).collect()
    }

    pub fn groups(&self) -> &[CountryGroup] {
        &self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# country hostname longitude latitude
BE planetlab1.extern.kuleuven.be 50.8625 4.68599
BE planetlab2.extern.kuleuven.be 50.8625 4.68599

CH planetlab2.inf.ethz.ch 47.3794 8.54513
CZ planetlab1.cesnet.cz 50.102 14.3916
";

    #[test]
    fn test_parse_records() {
        let nodes = parse_records(SAMPLE).unwrap();
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[0].country_code, "BE");
        assert_eq!(nodes[2].hostname, "planetlab2.inf.ethz.ch");
        assert_eq!(nodes[3].coordinates.latitude, 14.3916);
        assert_eq!(nodes[3].coordinates.to_string(), "50.102,14.3916");
    }

    #[test]
    fn test_coordinates_keep_record_text() {
        let nodes = parse_records("BE h1 4.0 50.86250
CH h2 8.54510 -0
").unwrap();
        assert_eq!(nodes[0].coordinates.longitude, 4.0);
        assert_eq!(nodes[0].coordinates.to_string(), "4.0,50.86250");
        assert_eq!(nodes[1].coordinates.to_string(), "8.54510,-0");
        assert_eq!(Coordinates::new(4.5, 50.0).to_string(), "4.5,50");
    }

    #[test]
    fn test_parse_records_reports_line() {
        let err = parse_records("BE h1 1.0 2.0\nCH h2 1.0\n").unwrap_err();
        assert_eq!(err, RecordError::MissingFields { line: 2, found: 3 });

        let err = parse_records("BE h1 east 2.0").unwrap_err();
        assert!(matches!(
            err,
            RecordError::InvalidCoordinate {
                line: 1,
                field: "longitude",
                ..
            }
        ));
    }

    #[test]
    fn test_pool_groups_contiguous_countries() {
        let pool = CandidatePool::from_nodes(parse_records(SAMPLE).unwrap());
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.country_codes(), vec!["BE", "CH", "CZ"]);
        assert_eq!(pool.remaining(0), 2);
        assert_eq!(
            pool.front(0).map(|n| n.hostname.as_str()),
            Some("planetlab1.extern.kuleuven.be")
        );
    }

    #[test]
    fn test_pool_does_not_sort() {
        let nodes = parse_records("DE a 0 0\nFR b 0 0\nDE c 0 0\n").unwrap();
        let pool = CandidatePool::from_nodes(nodes);
        assert_eq!(pool.country_codes(), vec!["DE", "FR", "DE"]);
    }

    #[test]
    fn test_discard_front_until_exhausted() {
        let mut pool = CandidatePool::from_nodes(parse_records(SAMPLE).unwrap());

        let first = pool.discard_front(0).unwrap();
        assert_eq!(first.hostname, "planetlab1.extern.kuleuven.be");
        assert!(pool.has_candidates(0));

        pool.discard_front(0);
        assert!(!pool.has_candidates(0));
        assert!(pool.discard_front(0).is_none());
        assert_eq!(pool.country(0), Some("BE"));
    }
}
