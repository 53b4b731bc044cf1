//! Directed, weighted edges between motes.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{MoteId, TopologyError};

/// Packet delivery ratio of a link, guaranteed to lie in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Pdr(f64);

impl Pdr {
    /// Link that always delivers.
    pub const PERFECT: Pdr = Pdr(1.0);

    /// Validates a raw delivery ratio.
    ///
    /// # Errors
    ///
    /// - `TopologyError::InvalidPdr` - If the value is NaN or outside `[0, 1]`
    pub fn new(value: f64) -> Result<Self, TopologyError> {
        if (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(TopologyError::InvalidPdr { value })
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Whether a transmission over this link can ever succeed.
    pub fn is_usable(self) -> bool {
        self.0 > 0.0
    }
}

impl TryFrom<f64> for Pdr {
    type Error = TopologyError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Pdr> for f64 {
    fn from(pdr: Pdr) -> Self {
        pdr.0
    }
}

impl fmt::Display for Pdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Directed connection from one mote to another.
///
/// Serializes as `{from, to, pdr}`, the record shape used by connection
/// listings and topology exports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub from: MoteId,
    pub to: MoteId,
    pub pdr: Pdr,
}

impl Link {
    pub fn new(from: MoteId, to: MoteId, pdr: Pdr) -> Self {
        Self { from, to, pdr }
    }

    /// Ordered pair identifying this link within the graph.
    pub fn key(&self) -> (MoteId, MoteId) {
        (self.from, self.to)
    }

    /// Returns true if either endpoint is `id`.
    pub fn touches(&self, id: MoteId) -> bool {
        self.from == id || self.to == id
    }
}
