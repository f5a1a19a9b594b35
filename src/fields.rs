//! Classification of observed fields into amplitude calibrators, phase
//! calibrators and science targets.

use std::collections::HashSet;

use crate::constants::{FLUX_REFERENCE_PRIORITY, STANDARD_AMP_CALIBRATORS};

/// The observed fields of one measurement set, partitioned by role.
///
/// Every field lands in exactly one class and observation order is
/// preserved within each class. Amplitude calibrators double as bandpass
/// calibrators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    /// Standard flux-density calibrators
    pub amp_cals: Vec<String>,
    /// Catalogued phase calibrators
    pub phase_cals: Vec<String>,
    /// Everything else
    pub targets: Vec<String>,
}

impl FieldSet {
    /// All calibrators, amplitude first, in observation order.
    pub fn calibrators(&self) -> Vec<String> {
        let mut cals = self.amp_cals.clone();
        cals.extend(self.phase_cals.iter().cloned());
        cals
    }

    /// The field whose model anchors the flux scale: `3C286` when observed,
    /// then `3C147`, then the first amplitude calibrator.
    pub fn flux_reference(&self) -> Option<&str> {
        for preferred in FLUX_REFERENCE_PRIORITY {
            if let Some(found) = self.amp_cals.iter().find(|f| *f == preferred) {
                return Some(found);
            }
        }
        self.amp_cals.first().map(String::as_str)
    }

    /// Whether the observation carries a usable flux calibrator.
    pub fn has_flux_calibrator(&self) -> bool {
        !self.amp_cals.is_empty()
    }
}

/// Partitions field names by matching them against the standard flux
/// calibrators and a phase-calibrator catalogue.
#[derive(Debug, Clone)]
pub struct FieldClassifier {
    catalogue: HashSet<String>,
}

impl FieldClassifier {
    /// A classifier over a phase-calibrator catalogue, typically the names
    /// from a VLA calibrator list.
    pub fn new<I, S>(catalogue: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            catalogue: catalogue.into_iter().map(Into::into).collect(),
        }
    }

    /// Partition `fields` into amplitude calibrators, phase calibrators and
    /// targets.
    ///
    /// A standard flux calibrator is an amplitude calibrator even when it
    /// also appears in the catalogue; a catalogued field is a phase
    /// calibrator; everything else is a target.
    pub fn classify(&self, fields: &[String]) -> FieldSet {
        let mut set = FieldSet::default();
        for field in fields {
            if STANDARD_AMP_CALIBRATORS.contains(&field.as_str()) {
                set.amp_cals.push(field.clone());
            } else if self.catalogue.contains(field) {
                set.phase_cals.push(field.clone());
            } else {
                set.targets.push(field.clone());
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> FieldClassifier {
        FieldClassifier::new(["J1822-0938", "J0405-1308", "3C286"])
    }

    fn names(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn partitions_in_observation_order() {
        let set = classifier().classify(&names(&[
            "3C286",
            "J1822-0938",
            "DEEP2",
            "J0405-1308",
            "GRB210905A",
        ]));
        assert_eq!(set.amp_cals, names(&["3C286"]));
        assert_eq!(set.phase_cals, names(&["J1822-0938", "J0405-1308"]));
        assert_eq!(set.targets, names(&["DEEP2", "GRB210905A"]));
    }

    #[test]
    fn standard_calibrator_outranks_catalogue() {
        // 3C286 is in the catalogue too but must classify as amplitude.
        let set = classifier().classify(&names(&["3C286"]));
        assert_eq!(set.amp_cals, names(&["3C286"]));
        assert!(set.phase_cals.is_empty());
    }

    #[test]
    fn every_field_lands_in_exactly_one_class() {
        let fields = names(&["3C48", "J1822-0938", "DEEP2"]);
        let set = classifier().classify(&fields);
        let total = set.amp_cals.len() + set.phase_cals.len() + set.targets.len();
        assert_eq!(total, fields.len());
        for field in &fields {
            let hits = [&set.amp_cals, &set.phase_cals, &set.targets]
                .iter()
                .filter(|class| class.contains(field))
                .count();
            assert_eq!(hits, 1, "{field} classified {hits} times");
        }
    }

    #[test]
    fn flux_reference_prefers_3c286() {
        let set = classifier().classify(&names(&["3C48", "3C286", "DEEP2"]));
        assert_eq!(set.flux_reference(), Some("3C286"));

        let set = classifier().classify(&names(&["3C48", "3C147"]));
        assert_eq!(set.flux_reference(), Some("3C147"));

        let set = classifier().classify(&names(&["0137+331", "3C48"]));
        assert_eq!(set.flux_reference(), Some("0137+331"));

        let set = classifier().classify(&names(&["DEEP2"]));
        assert_eq!(set.flux_reference(), None);
        assert!(!set.has_flux_calibrator());
    }

    #[test]
    fn calibrators_lists_amplitude_first() {
        let set = classifier().classify(&names(&["J1822-0938", "3C48", "DEEP2"]));
        assert_eq!(set.calibrators(), names(&["3C48", "J1822-0938"]));
    }
}
