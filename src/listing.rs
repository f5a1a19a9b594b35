//! Observation listings: a JSON dump of the metadata the pipeline plans
//! against.
//!
//! The control layer never opens a measurement set itself. A listing carries
//! the field/scan layout, the antenna table, per-window channel frequencies
//! and (optionally) the raw mean-amplitude statistics the bad-antenna
//! detector needs, so a whole reduction can be planned offline and rendered
//! as a script.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{AmpStatQuery, EngineError, MetadataReader};

/// Error loading or saving an [`ObsListing`].
#[derive(Error, Debug)]
pub enum ListingError {
    /// The listing file could not be opened or read.
    #[error("could not read listing {path}: {source}")]
    Io {
        /// The listing path
        path: PathBuf,
        /// The underlying io error
        source: std::io::Error,
    },
    /// The listing file is not valid listing JSON.
    #[error("could not parse listing {path}: {source}")]
    Parse {
        /// The listing path
        path: PathBuf,
        /// The underlying serde error
        source: serde_json::Error,
    },
}

/// One observed field and its scans, in observation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldEntry {
    /// Field name as recorded by the observatory
    pub name: String,
    /// Scan ids on this field, ascending
    pub scans: Vec<u32>,
}

/// One raw mean-amplitude measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmpStat {
    /// Scan id the mean was computed over
    pub scan: u32,
    /// Antenna name
    pub antenna: String,
    /// Correlation, e.g. `rr`
    pub correlation: String,
    /// Mean raw visibility amplitude, flags ignored
    pub mean: f64,
}

/// Observation metadata dump, the offline stand-in for a measurement set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObsListing {
    /// The measurement set this listing describes
    pub vis: String,
    /// Fields in observation order
    pub fields: Vec<FieldEntry>,
    /// The antenna table
    pub antennas: Vec<String>,
    /// Channel centre frequencies in Hz, one list per spectral window
    pub spw_frequencies_hz: Vec<Vec<f64>>,
    /// Raw mean amplitudes on the calibrator scans; empty when the dump
    /// was made without statistics
    #[serde(default)]
    pub raw_amplitudes: Vec<AmpStat>,
}

impl ObsListing {
    /// Load a listing from a JSON file.
    ///
    /// # Errors
    ///
    /// A [`ListingError`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ListingError> {
        let file = File::open(path).map_err(|source| ListingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| ListingError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the listing as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// A [`ListingError`] when the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ListingError> {
        let rendered = serde_json::to_string_pretty(self).map_err(|source| ListingError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, rendered).map_err(|source| ListingError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Whether the dump carries amplitude statistics. Without them the
    /// bad-antenna sweep has nothing to measure and is skipped.
    pub fn has_amplitude_stats(&self) -> bool {
        !self.raw_amplitudes.is_empty()
    }

    /// Total scan count across all fields.
    pub fn scan_count(&self) -> usize {
        self.fields.iter().map(|f| f.scans.len()).sum()
    }

    /// Scan counts per field name, observation order.
    pub fn scans_by_field(&self) -> BTreeMap<&str, usize> {
        self.fields
            .iter()
            .map(|f| (f.name.as_str(), f.scans.len()))
            .collect()
    }
}

impl MetadataReader for ObsListing {
    fn field_names(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.fields.iter().map(|f| f.name.clone()).collect())
    }

    fn scans_for_field(&self, field: &str) -> Result<Vec<u32>, EngineError> {
        self.fields
            .iter()
            .find(|f| f.name == field)
            .map(|f| f.scans.clone())
            .ok_or_else(|| {
                EngineError::new("listing", &self.vis, format!("no field named {field}"))
            })
    }

    fn antennas(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.antennas.clone())
    }

    fn channel_count(&self, spw: usize) -> Result<usize, EngineError> {
        self.channel_frequencies(spw).map(|freqs| freqs.len())
    }

    fn channel_frequencies(&self, spw: usize) -> Result<Vec<f64>, EngineError> {
        self.spw_frequencies_hz.get(spw).cloned().ok_or_else(|| {
            EngineError::new("listing", &self.vis, format!("no spectral window {spw}"))
        })
    }

    fn raw_mean_amplitude(&self, query: &AmpStatQuery) -> Result<f64, EngineError> {
        self.raw_amplitudes
            .iter()
            .find(|stat| {
                stat.scan == query.scan
                    && stat.antenna == query.antenna
                    && stat.correlation == query.correlation
            })
            .map(|stat| stat.mean)
            .ok_or_else(|| {
                EngineError::new(
                    "listing",
                    &self.vis,
                    format!(
                        "no {} statistics for {} on scan {}",
                        query.correlation, query.antenna, query.scan
                    ),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn listing() -> ObsListing {
        ObsListing {
            vis: "obs.ms".to_string(),
            fields: vec![
                FieldEntry {
                    name: "3C286".to_string(),
                    scans: vec![1],
                },
                FieldEntry {
                    name: "DEEP2".to_string(),
                    scans: vec![2, 3],
                },
            ],
            antennas: vec!["C00".to_string(), "W06".to_string()],
            spw_frequencies_hz: vec![vec![0.3e9, 0.4e9]],
            raw_amplitudes: vec![AmpStat {
                scan: 1,
                antenna: "C00".to_string(),
                correlation: "rr".to_string(),
                mean: 4.2,
            }],
        }
    }

    #[test]
    fn round_trips_through_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("obs.listing.json");
        let original = listing();
        original.save(&path).unwrap();
        let loaded = ObsListing::load(&path).unwrap();
        assert_eq!(loaded.vis, original.vis);
        assert_eq!(loaded.fields, original.fields);
        assert_eq!(loaded.raw_amplitudes, original.raw_amplitudes);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ObsListing::load(Path::new("/nonexistent/obs.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/obs.json"));
    }

    #[test]
    fn serves_metadata_queries() {
        let listing = listing();
        assert_eq!(
            listing.field_names().unwrap(),
            vec!["3C286".to_string(), "DEEP2".to_string()]
        );
        assert_eq!(listing.scans_for_field("DEEP2").unwrap(), vec![2, 3]);
        assert_eq!(listing.channel_count(0).unwrap(), 2);
        assert!(listing.channel_frequencies(1).is_err());
        assert_eq!(listing.scan_count(), 3);
    }

    #[test]
    fn amplitude_lookup_misses_are_errors() {
        let listing = listing();
        let hit = AmpStatQuery {
            scan: 1,
            antenna: "C00".to_string(),
            correlation: "rr".to_string(),
            spw: "0:500~600".to_string(),
        };
        assert_eq!(listing.raw_mean_amplitude(&hit).unwrap(), 4.2);

        let miss = AmpStatQuery {
            correlation: "ll".to_string(),
            ..hit
        };
        assert!(listing.raw_mean_amplitude(&miss).is_err());
        assert!(listing.has_amplitude_stats());
    }
}
