//! Interfaces to the external engines that perform the interferometric heavy
//! lifting: calibration solves, deconvolution, flagging and measurement-set
//! transforms.
//!
//! The pipeline core only decides *what* to run and in *which order*; every
//! operation here is a synchronous call into a collaborator. The bundled
//! [`script::ScriptEngine`] renders each call as a CASA task invocation.

pub mod script;

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use derive_builder::Builder;
use thiserror::Error;

/// Error raised by an engine implementation when a task cannot be completed.
///
/// The pipeline core maps these into its own error taxonomy with the failing
/// stage attached; engines only report the task, the file and a reason.
#[derive(Error, Debug, Clone)]
#[error("{task} failed on {vis}: {message}")]
pub struct EngineError {
    /// The engine task that failed (e.g. `gaincal`, `tclean`)
    pub task: String,
    /// The visibility file or table the task was operating on
    pub vis: String,
    /// What the engine had to say about it
    pub message: String,
}

impl EngineError {
    /// Convenience constructor used by engine implementations.
    pub fn new<T: Into<String>, V: Into<String>, M: Into<String>>(
        task: T,
        vis: V,
        message: M,
    ) -> Self {
        Self {
            task: task.into(),
            vis: vis.into(),
            message: message.into(),
        }
    }
}

/// A single manual flagging instruction, serialized into the flag-command
/// protocol understood by [`FlaggingEngine::apply_manual_flags`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagCommand {
    /// Flag whole antennas for the duration of one scan.
    Antennas {
        /// Antenna names, flagged together
        antennas: Vec<String>,
        /// The scan they are flagged on
        scan: u32,
    },
    /// Flag a channel selection across all times and baselines.
    Channels {
        /// Composite spectral-window selector, e.g. `0:101, 0:102`
        selector: String,
    },
}

impl Display for FlagCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagCommand::Antennas { antennas, scan } => {
                write!(f, "mode='manual' antenna='{}' scan='{}'", antennas.join("; "), scan)
            }
            FlagCommand::Channels { selector } => {
                write!(f, "mode='manual' spw='{}'", selector)
            }
        }
    }
}

/// Calibration solution mode for a self-calibration round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalMode {
    /// Phase-only solutions.
    Phase,
    /// Amplitude and phase solutions.
    PhaseAmplitude,
}

impl CalMode {
    /// The single-letter code used in task arguments and table names.
    pub fn code(&self) -> &'static str {
        match self {
            CalMode::Phase => "p",
            CalMode::PhaseAmplitude => "ap",
        }
    }
}

impl Display for CalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalMode::Phase => write!(f, "phase-only"),
            CalMode::PhaseAmplitude => write!(f, "amplitude+phase"),
        }
    }
}

impl Default for CalMode {
    fn default() -> Self {
        CalMode::PhaseAmplitude
    }
}

/// Gain solution type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainType {
    /// Complex gains (`G`).
    Gain,
    /// Antenna-based delays (`K`).
    Delay,
}

impl GainType {
    /// The task argument code.
    pub fn code(&self) -> &'static str {
        match self {
            GainType::Gain => "G",
            GainType::Delay => "K",
        }
    }
}

impl Default for GainType {
    fn default() -> Self {
        GainType::Gain
    }
}

/// Which column of a measurement set an operation reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataColumn {
    /// Raw visibilities.
    Data,
    /// Calibrated visibilities.
    Corrected,
    /// Calibrated visibilities minus the current model.
    Residual,
}

impl DataColumn {
    /// The task argument name for this column.
    pub fn casa_name(&self) -> &'static str {
        match self {
            DataColumn::Data => "data",
            DataColumn::Corrected => "corrected",
            DataColumn::Residual => "residual_data",
        }
    }
}

impl Default for DataColumn {
    fn default() -> Self {
        DataColumn::Data
    }
}

/// Where a quack flag bites: the start or the end of each scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuackMode {
    /// Flag the first `interval` seconds of every scan (`beg`).
    Beginning,
    /// Flag the last `interval` seconds of every scan (`endb`).
    End,
}

impl QuackMode {
    /// The task argument code.
    pub fn code(&self) -> &'static str {
        match self {
            QuackMode::Beginning => "beg",
            QuackMode::End => "endb",
        }
    }
}

/// One gain (or delay) solve.
#[derive(Builder, Debug, Default, Clone)]
pub struct GainSolve {
    /// Input visibility file
    pub vis: PathBuf,
    /// Output calibration table
    pub table: PathBuf,
    /// Field selection the solutions are derived from
    pub field: String,
    /// Spectral window selection, empty for all channels
    #[builder(default)]
    pub spw: String,
    /// Baseline-length cutoff, empty for no cutoff
    #[builder(default)]
    pub uvrange: String,
    /// Solution interval (`int`, `inf` or a quantity like `8.0min`)
    pub solint: String,
    /// Reference antenna name
    pub refant: String,
    /// Minimum signal-to-noise for a solution to be kept
    #[builder(default = "2.0")]
    pub min_snr: f64,
    /// Complex gains or delays
    #[builder(default = "GainType::Gain")]
    pub gain_type: GainType,
    /// Solve for phase only, or amplitude and phase
    #[builder(default = "CalMode::PhaseAmplitude")]
    pub mode: CalMode,
    /// Normalize solution amplitudes to one
    #[builder(default)]
    pub solnorm: bool,
    /// Append to the output table instead of overwriting it
    #[builder(default)]
    pub append: bool,
    /// Tables applied on the fly while solving
    #[builder(default)]
    pub chain: Vec<PathBuf>,
    /// Per-chain-entry interpolation, same length as `chain`
    #[builder(default)]
    pub interp: Vec<String>,
}

/// One bandpass solve.
#[derive(Builder, Debug, Default, Clone)]
pub struct BandpassSolve {
    /// Input visibility file
    pub vis: PathBuf,
    /// Output calibration table
    pub table: PathBuf,
    /// Field selection the solutions are derived from
    pub field: String,
    /// Spectral window selection
    #[builder(default)]
    pub spw: String,
    /// Solution interval
    #[builder(default = "\"inf\".to_string()")]
    pub solint: String,
    /// Reference antenna name
    pub refant: String,
    /// Minimum signal-to-noise for a solution to be kept
    #[builder(default = "2.0")]
    pub min_snr: f64,
    /// Normalize solution amplitudes to one
    #[builder(default = "true")]
    pub solnorm: bool,
    /// Interpolate over at most this many flagged channels
    #[builder(default = "8")]
    pub fill_gaps: u32,
    /// Tables applied on the fly while solving
    #[builder(default)]
    pub chain: Vec<PathBuf>,
    /// Per-chain-entry interpolation, same length as `chain`
    #[builder(default)]
    pub interp: Vec<String>,
}

/// One flux-scale transfer from reference to secondary calibrators.
#[derive(Debug, Default, Clone)]
pub struct FluxScale {
    /// Input visibility file
    pub vis: PathBuf,
    /// Gain table holding solutions for reference and transfer fields
    pub caltable: PathBuf,
    /// Output table with rescaled gains
    pub fluxtable: PathBuf,
    /// Field whose model flux anchors the scale
    pub reference: String,
    /// Fields whose gains are rescaled
    pub transfer: Vec<String>,
}

/// One application of calibration tables to a field selection.
#[derive(Debug, Default, Clone)]
pub struct ApplyCal {
    /// Input visibility file
    pub vis: PathBuf,
    /// Field selection written to the corrected column
    pub field: String,
    /// Spectral window selection
    pub spw: String,
    /// Tables to apply, in order
    pub gaintables: Vec<PathBuf>,
    /// Per-table solution-field selection, same length as `gaintables`
    pub gainfield: Vec<String>,
    /// Per-table interpolation, same length as `gaintables`
    pub interp: Vec<String>,
    /// Calibrate data weights as well
    pub calwt: bool,
    /// Application mode, e.g. `calflag`; empty for the engine default
    pub applymode: String,
    /// Correct for parallactic-angle rotation
    pub parang: bool,
}

/// One deconvolution run.
#[derive(Builder, Debug, Default, Clone)]
pub struct CleanRequest {
    /// Input visibility file
    pub vis: PathBuf,
    /// Output image base name
    pub image_name: String,
    /// Field selection
    #[builder(default = "\"0\".to_string()")]
    pub field: String,
    /// Spectral window selection
    #[builder(default = "\"0\".to_string()")]
    pub spw: String,
    /// Clean iteration limit; zero produces a dirty image
    pub niter: u32,
    /// Clean threshold in mJy
    pub threshold_mjy: f64,
    /// Pixel size, e.g. `2.0arcsec`
    pub cell: String,
    /// Image width and height in pixels
    pub imsize: u32,
    /// Taylor terms for the wide-band expansion
    #[builder(default = "2")]
    pub nterms: u8,
    /// W-projection plane count, `-1` to auto-size
    #[builder(default = "-1")]
    pub wproj_planes: i32,
    /// Multi-scale clean component scales in pixels
    #[builder(default = "vec![0, 5, 15]")]
    pub scales: Vec<u32>,
    /// Store the model visibilities for a following solve
    #[builder(default = "true")]
    pub save_model: bool,
}

/// One measurement-set split.
#[derive(Debug, Default, Clone)]
pub struct SplitRequest {
    /// Input visibility file
    pub vis: PathBuf,
    /// Output visibility file
    pub out: PathBuf,
    /// Field selection carried into the output
    pub field: String,
    /// Spectral window selection carried into the output
    pub spw: String,
    /// Column the output data column is copied from
    pub column: DataColumn,
    /// Average this many channels together, `1` for no averaging
    pub chan_bin: u32,
}

impl SplitRequest {
    /// Whether the split averages channels.
    pub fn averages(&self) -> bool {
        self.chan_bin > 1
    }
}

/// One clip pass: flag amplitudes outside a closed range.
#[derive(Debug, Default, Clone)]
pub struct ClipScan {
    /// Input visibility file
    pub vis: PathBuf,
    /// Field selection
    pub field: String,
    /// Spectral window selection
    pub spw: String,
    /// Column the amplitudes are read from
    pub column: DataColumn,
    /// Amplitudes outside `(min, max)` are flagged
    pub range: (f64, f64),
}

/// One flag-growing pass: a sample is flagged when enough of its
/// time/frequency neighbourhood already is.
#[derive(Debug, Default, Clone)]
pub struct ExtendFlags {
    /// Input visibility file
    pub vis: PathBuf,
    /// Field selection
    pub field: String,
    /// Spectral window selection
    pub spw: String,
    /// Column named in the pass (flags are column-independent)
    pub column: DataColumn,
    /// Flag a whole integration when this percentage of it is flagged
    pub grow_time: f64,
    /// Flag a whole channel when this percentage of it is flagged
    pub grow_freq: f64,
    /// Flag all correlations when any one is flagged
    pub extend_pols: bool,
}

/// Statistical outlier detection algorithm.
#[derive(Debug, Clone, PartialEq)]
pub enum OutlierMode {
    /// Time-frequency crop: fit and reject against smoothed bandpass/gain
    /// shapes.
    TfCrop {
        /// Rejection threshold along time, in sigma
        time_cutoff: f64,
        /// Rejection threshold along frequency, in sigma
        freq_cutoff: f64,
        /// Fit shape along time (`line` or `poly`)
        time_fit: String,
        /// Fit shape along frequency (`line` or `poly`)
        freq_fit: String,
    },
    /// Sliding-window RMS rejection.
    RFlag {
        /// Local RMS multiplier along time
        time_dev_scale: f64,
        /// Local RMS multiplier along frequency
        freq_dev_scale: f64,
    },
}

impl Default for OutlierMode {
    fn default() -> Self {
        OutlierMode::RFlag {
            time_dev_scale: 5.0,
            freq_dev_scale: 5.0,
        }
    }
}

/// One statistical flagging pass.
#[derive(Builder, Debug, Default, Clone)]
pub struct OutlierScan {
    /// Input visibility file
    pub vis: PathBuf,
    /// Field selection, empty for all fields
    #[builder(default)]
    pub field: String,
    /// Baseline selection, `None` for all baselines
    #[builder(default)]
    pub antenna: Option<String>,
    /// Spectral window selection
    #[builder(default)]
    pub spw: String,
    /// Column the statistics are computed on
    #[builder(default = "DataColumn::Data")]
    pub column: DataColumn,
    /// Detection algorithm and thresholds
    pub mode: OutlierMode,
    /// Statistics window along time (`scan` or a quantity like `300s`)
    #[builder(default = "\"scan\".to_string()")]
    pub ntime: String,
    /// Let the statistics window span scan boundaries
    #[builder(default)]
    pub combine_scans: bool,
    /// Extra ceiling on spectral deviation, `None` for the engine default
    #[builder(default)]
    pub spectral_max: Option<f64>,
    /// Require this channel fraction before a whole window is flagged
    #[builder(default)]
    pub min_chan_frac: Option<f64>,
    /// Also flag the samples adjacent in time to a flagged one
    #[builder(default)]
    pub flag_near_time: bool,
}

/// Counts from a flag summary, broken down by field.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlagSummary {
    /// Flagged fraction per field name, in `0.0..=1.0`. May be empty when
    /// the engine defers statistics (e.g. a script renderer).
    pub field_fractions: BTreeMap<String, f64>,
}

impl FlagSummary {
    /// Flagged percentage for one field, if the engine reported it.
    pub fn percent_for(&self, field: &str) -> Option<f64> {
        self.field_fractions.get(field).map(|f| f * 100.0)
    }
}

/// Gain, bandpass and flux-scale solving, and table application.
pub trait CalibrationEngine {
    /// Clear the corrected and model columns, returning the file to its
    /// uncalibrated state.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the reset cannot be performed.
    fn reset_calibration(&mut self, vis: &Path) -> Result<(), EngineError>;

    /// Set the model visibilities of `field` from a flux-density standard.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the field has no model in the standard.
    fn set_flux_model(
        &mut self,
        vis: &Path,
        field: &str,
        spw: &str,
        standard: &str,
    ) -> Result<(), EngineError>;

    /// Remove a stale calibration table so a fresh solve can replace it.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the table exists but cannot be removed.
    fn discard_table(&mut self, table: &Path) -> Result<(), EngineError>;

    /// Solve antenna gains (or delays) into `req.table`.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the solve fails or yields no solutions.
    fn solve_gains(&mut self, req: &GainSolve) -> Result<(), EngineError>;

    /// Solve a bandpass into `req.table`.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the solve fails or yields no solutions.
    fn solve_bandpass(&mut self, req: &BandpassSolve) -> Result<(), EngineError>;

    /// Rescale gains of the transfer fields against the reference field.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the scale cannot be derived.
    fn solve_flux_scale(&mut self, req: &FluxScale) -> Result<(), EngineError>;

    /// Apply calibration tables to the corrected column of `req.field`.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the application fails.
    fn apply(&mut self, req: &ApplyCal) -> Result<(), EngineError>;
}

/// Deconvolution and image export.
pub trait ImagingEngine {
    /// Deconvolve `req.vis` into the image products under `req.image_name`.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when imaging fails.
    fn clean(&mut self, req: &CleanRequest) -> Result<(), EngineError>;

    /// Export a restored image to FITS.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the image cannot be exported.
    fn export_fits(&mut self, image: &Path, fits: &Path) -> Result<(), EngineError>;
}

/// Flagging operations.
pub trait FlaggingEngine {
    /// Apply a batch of manual flag commands.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the batch cannot be applied.
    fn apply_manual_flags(&mut self, vis: &Path, commands: &[FlagCommand])
        -> Result<(), EngineError>;

    /// Flag `interval_s` seconds at the start or end of every scan.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the flags cannot be applied.
    fn quack(&mut self, vis: &Path, interval_s: f64, mode: QuackMode) -> Result<(), EngineError>;

    /// Flag amplitudes outside a closed range.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the flags cannot be applied.
    fn clip(&mut self, req: &ClipScan) -> Result<(), EngineError>;

    /// Run a statistical outlier detection pass.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the pass cannot be run.
    fn detect_outliers(&mut self, req: &OutlierScan) -> Result<(), EngineError>;

    /// Grow existing flags along time and frequency.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the flags cannot be applied.
    fn extend(&mut self, req: &ExtendFlags) -> Result<(), EngineError>;

    /// Collect flag statistics.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the statistics cannot be collected.
    fn summarize(&mut self, vis: &Path, column: DataColumn) -> Result<FlagSummary, EngineError>;
}

/// Measurement-set splitting and channel averaging.
pub trait TransformEngine {
    /// Write a new measurement set from a selection of `req.vis`.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the output cannot be written.
    fn split(&mut self, req: &SplitRequest) -> Result<(), EngineError>;
}

/// Query sent to [`MetadataReader::raw_mean_amplitude`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmpStatQuery {
    /// Scan id
    pub scan: u32,
    /// Antenna name
    pub antenna: String,
    /// Correlation, e.g. `rr`
    pub correlation: String,
    /// Channel window the mean is computed over
    pub spw: String,
}

/// Read-only access to observation metadata and visibility statistics.
///
/// Implementations are bound to one observation; [`crate::ObsListing`]
/// implements this from a metadata dump for offline planning.
pub trait MetadataReader {
    /// All field names, in observation order.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the field table cannot be read.
    fn field_names(&self) -> Result<Vec<String>, EngineError>;

    /// Scan ids on one field, ascending.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the scan table cannot be read.
    fn scans_for_field(&self, field: &str) -> Result<Vec<u32>, EngineError>;

    /// The full antenna table.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the antenna table cannot be read.
    fn antennas(&self) -> Result<Vec<String>, EngineError>;

    /// Channel count of one spectral window.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the window is unknown.
    fn channel_count(&self, spw: usize) -> Result<usize, EngineError>;

    /// Channel centre frequencies of one spectral window, in Hz.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the window is unknown.
    fn channel_frequencies(&self, spw: usize) -> Result<Vec<f64>, EngineError>;

    /// Mean raw visibility amplitude for one antenna over one scan,
    /// ignoring flags.
    ///
    /// # Errors
    ///
    /// An [`EngineError`] when the statistic cannot be computed; callers
    /// treat the antenna as unmeasurable for that scan.
    fn raw_mean_amplitude(&self, query: &AmpStatQuery) -> Result<f64, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn antenna_flag_command_matches_protocol() {
        let cmd = FlagCommand::Antennas {
            antennas: vec!["C00".to_string(), "W06".to_string()],
            scan: 12,
        };
        assert_eq!(cmd.to_string(), "mode='manual' antenna='C00; W06' scan='12'");
    }

    #[test]
    fn channel_flag_command_matches_protocol() {
        let cmd = FlagCommand::Channels {
            selector: "0:101, 0:102".to_string(),
        };
        assert_eq!(cmd.to_string(), "mode='manual' spw='0:101, 0:102'");
    }

    #[test]
    fn gain_solve_builder_fills_defaults() {
        let req = GainSolveBuilder::default()
            .vis("x.ms".into())
            .table("x.ms.K1".into())
            .field("3C286".to_string())
            .solint("60s".to_string())
            .refant("C00".to_string())
            .build()
            .unwrap();
        assert_eq!(req.min_snr, 2.0);
        assert_eq!(req.gain_type, GainType::Gain);
        assert!(!req.append);
        assert!(req.chain.is_empty());
    }

    #[test]
    fn flag_summary_reports_percent() {
        let mut summary = FlagSummary::default();
        summary
            .field_fractions
            .insert("DEEP2".to_string(), 0.125);
        assert_eq!(summary.percent_for("DEEP2"), Some(12.5));
        assert_eq!(summary.percent_for("3C48"), None);
    }
}
