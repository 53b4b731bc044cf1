//! Probabilistic packet delivery over the topology graph.
//!
//! The engine only reads the graph. Each transmission takes one draw from
//! the injected [`RandomSource`] and is delivered when the draw falls below
//! the link's PDR.

pub mod random;

use std::sync::Arc;

use parking_lot::Mutex;

pub use random::{DeterministicRng, EntropySource, RandomSource, ScriptedDraws};

use crate::topology::{Link, MoteId, TopologyError, TopologyGraph};

/// Result of a single simulated transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionOutcome {
    Delivered,
    Lost,
    /// The ordered pair has no link; nothing can be delivered.
    NoLink,
}

impl TransmissionOutcome {
    pub fn is_delivered(self) -> bool {
        self == TransmissionOutcome::Delivered
    }
}

pub struct PropagationEngine {
    graph: Arc<TopologyGraph>,
    random: Mutex<Box<dyn RandomSource>>,
}

impl PropagationEngine {
    /// Engine drawing from OS entropy.
    pub fn new(graph: Arc<TopologyGraph>) -> Self {
        Self::with_random_source(graph, Box::new(EntropySource))
    }

    /// Engine whose outcomes are reproducible for a given seed.
    pub fn seeded(graph: Arc<TopologyGraph>, seed: u64) -> Self {
        Self::with_random_source(graph, Box::new(DeterministicRng::from_seed(seed)))
    }

    pub fn with_random_source(graph: Arc<TopologyGraph>, random: Box<dyn RandomSource>) -> Self {
        Self {
            graph,
            random: Mutex::new(random),
        }
    }

    /// Builds an engine from the simulation section of the configuration.
    pub fn from_config(graph: Arc<TopologyGraph>, seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(graph, seed),
            None => Self::new(graph),
        }
    }

    /// Simulates one transmission from `from` to `to`.
    ///
    /// # Errors
    ///
    /// - `TopologyError::UnknownMote` - If either mote is absent from the graph
    pub fn transmit(&self, from: MoteId, to: MoteId) -> Result<TransmissionOutcome, TopologyError> {
        for id in [from, to] {
            if !self.graph.contains_mote(id) {
                return Err(TopologyError::UnknownMote { id });
            }
        }
        Ok(match self.graph.link(from, to) {
            Some(link) => self.draw(&link),
            None => TransmissionOutcome::NoLink,
        })
    }

    /// Simulates one transmission heard by every out-neighbor of `from`.
    /// Each neighbor gets an independent draw; results are ordered by
    /// neighbor address.
    ///
    /// # Errors
    ///
    /// - `TopologyError::UnknownMote` - If `from` is absent from the graph
    pub fn broadcast(&self, from: MoteId) -> Result<Vec<(MoteId, TransmissionOutcome)>, TopologyError> {
        let neighbors = self.graph.neighbors(from)?;
        let outcomes = neighbors
            .iter()
            .map(|link| (link.to, self.draw(link)))
            .collect::<Vec<_>>();
        tracing::trace!(
            mote = %from,
            heard_by = outcomes.iter().filter(|(_, outcome)| outcome.is_delivered()).count(),
            "Simulated broadcast"
        );
        Ok(outcomes)
    }

    /// Current connections of the underlying graph.
    pub fn retrieve_connections(&self) -> Vec<Link> {
        self.graph.all_connections()
    }

    fn draw(&self, link: &Link) -> TransmissionOutcome {
        let draw = self.random.lock().next_unit();
        if draw < link.pdr.value() {
            TransmissionOutcome::Delivered
        } else {
            TransmissionOutcome::Lost
        }
    }
}
