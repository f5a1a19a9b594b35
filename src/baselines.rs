//! Baseline topology of the GMRT: the central square versus the arms.
//!
//! GMRT antennas are named by location, `C` for the central square and
//! `E`/`S`/`W` for the three arms. Short central-square baselines see
//! extended emission and far more ground RFI than the long arm baselines,
//! so flagging thresholds differ by class. Baseline lists are derived from
//! the antenna table rather than hardcoded, so a partial array (antennas
//! missing from the observation) yields the right selectors.

use itertools::Itertools;

use crate::constants::CORE_ANTENNA_PREFIX;

/// Baseline classes, by the antennas at each end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineClass {
    /// Both antennas in the central square.
    Compact,
    /// At least one antenna on an arm.
    Extended,
}

/// Unordered antenna pairs of one observation, classified by array zone.
#[derive(Debug, Clone)]
pub struct BaselineTopology {
    antennas: Vec<String>,
}

impl BaselineTopology {
    /// A topology over the antennas present in one observation, in antenna
    /// table order.
    pub fn new(antennas: Vec<String>) -> Self {
        Self { antennas }
    }

    /// Whether an antenna sits in the central square.
    pub fn is_core(antenna: &str) -> bool {
        antenna.starts_with(CORE_ANTENNA_PREFIX)
    }

    /// Classify one baseline. A name without a GMRT zone prefix counts as
    /// an arm antenna.
    pub fn classify(a: &str, b: &str) -> BaselineClass {
        if Self::is_core(a) && Self::is_core(b) {
            BaselineClass::Compact
        } else {
            BaselineClass::Extended
        }
    }

    /// All baselines, each pair once, in antenna-table order.
    pub fn baselines(&self) -> impl Iterator<Item = (&str, &str)> {
        self.antennas
            .iter()
            .tuple_combinations()
            .map(|(a, b)| (a.as_str(), b.as_str()))
    }

    /// The baselines of one class.
    pub fn baselines_in(&self, class: BaselineClass) -> Vec<(&str, &str)> {
        self.baselines()
            .filter(|(a, b)| Self::classify(a, b) == class)
            .collect()
    }

    /// Baseline selector for one class, `A&B` pairs joined with `;`.
    pub fn selection(&self, class: BaselineClass) -> String {
        self.baselines_in(class)
            .iter()
            .map(|(a, b)| format!("{a}&{b}"))
            .join(";")
    }
}
