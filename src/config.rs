//! Run configuration: stage toggles and the numeric knobs of every stage.
//!
//! A [`PipelineConfig`] is built once (by the CLI or a library caller),
//! validated once, and passed by shared reference everywhere else. The
//! defaults are the standard uGMRT continuum reduction settings.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::constants::{DEFAULT_MEAN_AMP_CUTOFF, SELFCAL_NITER_BASE, SELFCAL_NITER_CAP};

/// Configuration and reference-data errors, all fatal before any engine
/// call is made.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The phase-calibrator reference list could not be loaded.
    #[error("could not load phase-calibrator list {path}: {reason}")]
    ReferenceList {
        /// The list path
        path: PathBuf,
        /// Why loading failed
        reason: String,
    },
    /// The correlator channel count has no channel-window profile.
    #[error("no channel windows known for {nchan} channels (supported: {supported:?})")]
    UnknownChannelCount {
        /// The channel count of spectral window 0
        nchan: usize,
        /// The channel counts a profile exists for
        supported: Vec<usize>,
    },
    /// Fewer solution intervals than self-calibration rounds.
    #[error("{rounds} self-cal rounds need {rounds} solution intervals, got {provided}")]
    SolintCount {
        /// Configured round count
        rounds: usize,
        /// Number of intervals provided
        provided: usize,
    },
    /// More phase-only rounds than total rounds.
    #[error("{phase} phase-only rounds exceed the {total} total rounds")]
    PhaseRounds {
        /// Configured phase-only round count
        phase: usize,
        /// Configured total round count
        total: usize,
    },
    /// A solution interval is neither `int`, `inf` nor a quantity.
    #[error("unparseable solution interval {value:?}")]
    BadSolint {
        /// The offending interval
        value: String,
    },
    /// A clip range is inverted or otherwise unusable.
    #[error("invalid {name} clip range [{low}, {high}]")]
    BadClipRange {
        /// Which range is broken
        name: &'static str,
        /// Lower clip bound
        low: f64,
        /// Upper clip bound
        high: f64,
    },
    /// The observation has neither amplitude nor phase calibrators.
    #[error("no amplitude or phase calibrators in the observation, nothing to calibrate against")]
    NoCalibrators,
}

/// Units accepted in a solution-interval quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum SolintUnit {
    /// Seconds
    #[strum(serialize = "s")]
    Seconds,
    /// Minutes
    #[strum(serialize = "min")]
    Minutes,
    /// Hours
    #[strum(serialize = "h")]
    Hours,
}

impl SolintUnit {
    /// Seconds per one of this unit.
    pub fn seconds(&self) -> f64 {
        match self {
            SolintUnit::Seconds => 1.0,
            SolintUnit::Minutes => 60.0,
            SolintUnit::Hours => 3600.0,
        }
    }
}

/// Parse a solution interval into seconds. `int` (per-integration) parses
/// to zero, `inf` (per-scan) to infinity.
///
/// # Errors
///
/// A [`ConfigError::BadSolint`] when the value is not a recognised keyword
/// or a number followed by a [`SolintUnit`].
pub fn parse_solint(value: &str) -> Result<f64, ConfigError> {
    match value {
        "int" => return Ok(0.0),
        "inf" => return Ok(f64::INFINITY),
        _ => {}
    }
    let split = value
        .find(|c: char| c.is_alphabetic())
        .ok_or_else(|| ConfigError::BadSolint {
            value: value.to_string(),
        })?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().map_err(|_| ConfigError::BadSolint {
        value: value.to_string(),
    })?;
    let unit = SolintUnit::from_str(unit).map_err(|_| ConfigError::BadSolint {
        value: value.to_string(),
    })?;
    Ok(number * unit.seconds())
}

/// Load the phase-calibrator reference names from a text file: whitespace
/// separated tokens, `#` starts a comment.
///
/// # Errors
///
/// A [`ConfigError::ReferenceList`] when the file is unreadable or yields
/// no names.
pub fn load_phase_cal_list(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReferenceList {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let names: Vec<String> = content
        .lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(str::split_whitespace)
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return Err(ConfigError::ReferenceList {
            path: path.to_path_buf(),
            reason: "no calibrator names in file".to_string(),
        });
    }
    Ok(names)
}

/// Which top-level stages a run performs. Skipping a stage assumes its
/// products already exist on disk from an earlier run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageToggles {
    /// Sweep calibrator scans for dead antennas
    pub detect_bad_antennas: bool,
    /// Map the persistent RFI bands onto the channel axis
    pub detect_bad_channels: bool,
    /// First-channel, quack, clip and tfcrop passes before calibration
    pub initial_flagging: bool,
    /// The first delay/bandpass/gain calibration pass
    pub initial_calibration: bool,
    /// Flagging on the corrected column
    pub post_cal_flagging: bool,
    /// Redo the calibration pass on the better-flagged data
    pub recalibration: bool,
    /// Split the corrected target data into per-field files
    pub split_targets: bool,
    /// Flagging on the split file
    pub split_flagging: bool,
    /// Channel-average the split file
    pub average_channels: bool,
    /// Flagging on the averaged file
    pub averaged_flagging: bool,
    /// The self-calibration loop
    pub selfcal: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            detect_bad_antennas: true,
            detect_bad_channels: true,
            initial_flagging: true,
            initial_calibration: true,
            post_cal_flagging: true,
            recalibration: true,
            split_targets: true,
            split_flagging: true,
            average_channels: true,
            averaged_flagging: true,
            selfcal: true,
        }
    }
}

/// Everything a run needs to know, read once and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Which stages run
    pub toggles: StageToggles,
    /// Reference antenna, must be a working antenna
    pub refant: String,
    /// Raw mean amplitudes below this condemn an antenna for a scan
    pub mean_amp_cutoff: f64,
    /// Seconds flagged at the start and end of every scan
    pub quack_interval_s: f64,
    /// Amplitude clip range on flux calibrators
    pub clip_flux_cal: (f64, f64),
    /// Amplitude clip range on phase calibrators
    pub clip_phase_cal: (f64, f64),
    /// Amplitude clip range on targets
    pub clip_target: (f64, f64),
    /// Amplitude clip range on self-cal residuals
    pub clip_residual: (f64, f64),
    /// Channels averaged together after the target split
    pub average_width: u32,
    /// Total self-calibration rounds `N`; the loop images rounds `0..=N`
    pub selfcal_rounds: usize,
    /// Rounds solved phase-only before switching to amplitude+phase
    pub phase_only_rounds: usize,
    /// Starting clean threshold in mJy, decays as `T0/(i+1)`
    pub threshold_mjy: f64,
    /// First-round clean iteration limit, doubles per round
    pub niter_base: u32,
    /// Clean iteration ceiling
    pub niter_cap: u32,
    /// Image pixel size, e.g. `2.0arcsec`
    pub cell: String,
    /// Image width and height in pixels
    pub imsize: u32,
    /// Taylor terms in the wide-band clean
    pub nterms: u8,
    /// W-projection planes, `-1` to auto-size
    pub wproj_planes: i32,
    /// Per-round gain solution intervals, at least `selfcal_rounds` long
    pub solints: Vec<String>,
    /// Baseline-length cutoff for the calibration solves
    pub uvrange_cal: String,
    /// Baseline-length cutoff for the phase-only self-cal solves
    pub uvrange_selfcal: String,
    /// Stop after a single dirty image instead of running the loop
    pub make_dirty_only: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            toggles: StageToggles::default(),
            refant: "C00".to_string(),
            mean_amp_cutoff: DEFAULT_MEAN_AMP_CUTOFF,
            quack_interval_s: 10.0,
            clip_flux_cal: (0.0, 60.0),
            clip_phase_cal: (0.0, 60.0),
            clip_target: (0.0, 30.0),
            clip_residual: (0.0, 10.0),
            average_width: 10,
            selfcal_rounds: 8,
            phase_only_rounds: 4,
            threshold_mjy: 0.1,
            niter_base: SELFCAL_NITER_BASE,
            niter_cap: SELFCAL_NITER_CAP,
            cell: "2.0arcsec".to_string(),
            imsize: 12000,
            nterms: 2,
            wproj_planes: -1,
            solints: [
                "8.0min", "4.0min", "2.0min", "1.0min", "8.0min", "4.0min", "2.0min", "1.0min",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            uvrange_cal: String::new(),
            uvrange_selfcal: String::new(),
            make_dirty_only: false,
        }
    }
}

impl PipelineConfig {
    /// Check the internal consistency of the configuration.
    ///
    /// # Errors
    ///
    /// A [`ConfigError`] naming the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.phase_only_rounds > self.selfcal_rounds {
            return Err(ConfigError::PhaseRounds {
                phase: self.phase_only_rounds,
                total: self.selfcal_rounds,
            });
        }
        if self.solints.len() < self.selfcal_rounds {
            return Err(ConfigError::SolintCount {
                rounds: self.selfcal_rounds,
                provided: self.solints.len(),
            });
        }
        for solint in &self.solints {
            parse_solint(solint)?;
        }
        for (name, range) in [
            ("flux-calibrator", self.clip_flux_cal),
            ("phase-calibrator", self.clip_phase_cal),
            ("target", self.clip_target),
            ("residual", self.clip_residual),
        ] {
            if range.0 >= range.1 {
                return Err(ConfigError::BadClipRange {
                    name,
                    low: range.0,
                    high: range.1,
                });
            }
        }
        Ok(())
    }

    /// The solution interval of one self-cal round.
    pub fn solint(&self, round: usize) -> &str {
        &self.solints[round]
    }
}
