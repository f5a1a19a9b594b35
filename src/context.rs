//! Assembly of everything a run derives from the observation itself:
//! field roles, scan lists, channel windows, baseline topology and the
//! pre-computed manual flags.

use std::path::PathBuf;

use log::{info, warn};

use crate::baselines::BaselineTopology;
use crate::config::{ConfigError, PipelineConfig};
use crate::detection::{AntennaSweep, BadAntennaDetector, BadChannelDetector};
use crate::engine::{FlagCommand, MetadataReader};
use crate::error::TarangError;
use crate::fields::{FieldClassifier, FieldSet};
use crate::windows::ChannelWindows;

/// The observation-derived state of one reduction, assembled once up front
/// and read-only from then on.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// The measurement set being reduced
    pub vis: PathBuf,
    /// Fields partitioned by role
    pub fields: FieldSet,
    /// Scans on amplitude calibrators, ascending
    pub amp_cal_scans: Vec<u32>,
    /// Scans on phase calibrators, ascending
    pub phase_cal_scans: Vec<u32>,
    /// Scans on targets, ascending
    pub target_scans: Vec<u32>,
    /// Channel windows for this correlator mode
    pub windows: ChannelWindows,
    /// Baseline topology of the observed array
    pub topology: BaselineTopology,
    /// Manual flags from the bad-antenna sweep
    pub antenna_flags: Vec<FlagCommand>,
    /// Antennas condemned on at least one calibrator scan, in detection
    /// order
    pub bad_antennas: Vec<String>,
    /// Manual flag covering the persistent RFI channels, if any fall in
    /// the observed band
    pub channel_flag: Option<FlagCommand>,
    /// Reference antenna, known to be working
    pub refant: String,
}

impl PipelineContext {
    /// Classify the observation, derive the channel windows and run the
    /// detectors, yielding a context ready to drive the stages.
    ///
    /// `run_antenna_detection` is forced off when the metadata source has no
    /// amplitude statistics.
    ///
    /// # Errors
    ///
    /// A [`ConfigError`] when the observation has no calibrators or an
    /// unsupported channel count, or a [`TarangError`] when the metadata
    /// cannot be read.
    pub fn assemble<M: MetadataReader>(
        reader: &M,
        config: &PipelineConfig,
        catalogue: &[String],
        vis: PathBuf,
        run_antenna_detection: bool,
    ) -> Result<Self, TarangError> {
        let field_names = reader.field_names()?;
        let fields = FieldClassifier::new(catalogue.iter().cloned()).classify(&field_names);
        if fields.amp_cals.is_empty() && fields.phase_cals.is_empty() {
            return Err(ConfigError::NoCalibrators.into());
        }
        info!(
            "classified fields: {} amplitude calibrators, {} phase calibrators, {} targets",
            fields.amp_cals.len(),
            fields.phase_cals.len(),
            fields.targets.len()
        );

        let nchan = reader.channel_count(0)?;
        let windows = ChannelWindows::for_channel_count(nchan).ok_or(
            ConfigError::UnknownChannelCount {
                nchan,
                supported: ChannelWindows::supported_counts(),
            },
        )?;

        let amp_cal_scans = Self::scans_of(reader, &fields.amp_cals)?;
        let phase_cal_scans = Self::scans_of(reader, &fields.phase_cals)?;
        let target_scans = Self::scans_of(reader, &fields.targets)?;

        let antennas = reader.antennas()?;
        let topology = BaselineTopology::new(antennas.clone());

        let sweep = if run_antenna_detection && config.toggles.detect_bad_antennas {
            let mut cal_scans = amp_cal_scans.clone();
            cal_scans.extend(&phase_cal_scans);
            cal_scans.sort_unstable();
            BadAntennaDetector::new(reader, windows.probe.clone(), config.mean_amp_cutoff)
                .detect(&antennas, &cal_scans, &target_scans)
        } else {
            AntennaSweep::default()
        };

        let channel_flag = if config.toggles.detect_bad_channels {
            BadChannelDetector::new(reader).detect(0)?
        } else {
            None
        };

        let refant = Self::pick_refant(&config.refant, &antennas, &sweep.antennas);

        Ok(Self {
            vis,
            fields,
            amp_cal_scans,
            phase_cal_scans,
            target_scans,
            windows,
            topology,
            antenna_flags: sweep.commands,
            bad_antennas: sweep.antennas,
            channel_flag,
            refant,
        })
    }

    fn scans_of<M: MetadataReader>(
        reader: &M,
        fields: &[String],
    ) -> Result<Vec<u32>, TarangError> {
        let mut scans = Vec::new();
        for field in fields {
            scans.extend(reader.scans_for_field(field)?);
        }
        scans.sort_unstable();
        Ok(scans)
    }

    /// The configured reference antenna, unless the sweep condemned it, in
    /// which case the first antenna never condemned takes over.
    fn pick_refant(configured: &str, antennas: &[String], bad_antennas: &[String]) -> String {
        let condemned = |name: &str| bad_antennas.iter().any(|a| a == name);
        if !condemned(configured) {
            return configured.to_string();
        }
        match antennas.iter().find(|a| !condemned(a)) {
            Some(replacement) => {
                warn!(
                    "reference antenna {configured} was flagged, \
                     using {replacement} instead"
                );
                replacement.clone()
            }
            None => {
                warn!("every antenna was flagged at least once, keeping refant {configured}");
                configured.to_string()
            }
        }
    }

    /// All calibrator scans, ascending.
    pub fn calibrator_scans(&self) -> Vec<u32> {
        let mut scans = self.amp_cal_scans.clone();
        scans.extend(&self.phase_cal_scans);
        scans.sort_unstable();
        scans
    }

    /// Comma-joined field selection for the amplitude calibrators.
    pub fn amp_cal_selection(&self) -> String {
        self.fields.amp_cals.join(",")
    }

    /// Comma-joined field selection for the phase calibrators.
    pub fn phase_cal_selection(&self) -> String {
        self.fields.phase_cals.join(",")
    }

    /// Comma-joined field selection for the targets.
    pub fn target_selection(&self) -> String {
        self.fields.targets.join(",")
    }
}
