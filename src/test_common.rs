//! Shared fixtures and mock engines for unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::constants::GMRT_ANTENNA_NAMES;
use crate::engine::{
    AmpStatQuery, ApplyCal, BandpassSolve, CalibrationEngine, CleanRequest, ClipScan, DataColumn,
    EngineError, ExtendFlags, FlagCommand, FlagSummary, FlaggingEngine, FluxScale, GainSolve,
    ImagingEngine, MetadataReader, OutlierScan, QuackMode, SplitRequest, TransformEngine,
};

/// A canned observation serving metadata and raw amplitude statistics.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockObservation {
    /// Field name and its scans, observation order
    pub fields: Vec<(String, Vec<u32>)>,
    pub antennas: Vec<String>,
    pub frequencies: Vec<f64>,
    /// Mean raw amplitude per (scan, antenna, correlation)
    pub means: HashMap<(u32, String, String), f64>,
    /// Mean returned when no override is set
    pub default_mean: f64,
    failing: HashSet<(u32, String)>,
}

impl MockObservation {
    pub fn new() -> Self {
        Self {
            default_mean: 1.0,
            ..Self::default()
        }
    }

    pub fn set_mean(&mut self, scan: u32, antenna: &str, correlation: &str, mean: f64) {
        self.means
            .insert((scan, antenna.to_string(), correlation.to_string()), mean);
    }

    /// Make every statistics query for this antenna and scan fail.
    pub fn fail_stats_for(&mut self, scan: u32, antenna: &str) {
        self.failing.insert((scan, antenna.to_string()));
    }
}

impl MetadataReader for MockObservation {
    fn field_names(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.fields.iter().map(|(name, _)| name.clone()).collect())
    }

    fn scans_for_field(&self, field: &str) -> Result<Vec<u32>, EngineError> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, scans)| scans.clone())
            .ok_or_else(|| EngineError::new("msmd", "mock.ms", format!("no field named {field}")))
    }

    fn antennas(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.antennas.clone())
    }

    fn channel_count(&self, spw: usize) -> Result<usize, EngineError> {
        if spw == 0 {
            Ok(self.frequencies.len())
        } else {
            Err(EngineError::new(
                "msmd",
                "mock.ms",
                format!("no spectral window {spw}"),
            ))
        }
    }

    fn channel_frequencies(&self, spw: usize) -> Result<Vec<f64>, EngineError> {
        if spw == 0 {
            Ok(self.frequencies.clone())
        } else {
            Err(EngineError::new(
                "msmd",
                "mock.ms",
                format!("no spectral window {spw}"),
            ))
        }
    }

    fn raw_mean_amplitude(&self, query: &AmpStatQuery) -> Result<f64, EngineError> {
        if self.failing.contains(&(query.scan, query.antenna.clone())) {
            return Err(EngineError::new(
                "visstat",
                "mock.ms",
                format!("no rows for {} on scan {}", query.antenna, query.scan),
            ));
        }
        let key = (
            query.scan,
            query.antenna.clone(),
            query.correlation.clone(),
        );
        Ok(self.means.get(&key).copied().unwrap_or(self.default_mean))
    }
}

/// One operation seen by a [`RecordingEngine`].
#[derive(Debug, Clone)]
pub(crate) enum EngineCall {
    ClearCal(PathBuf),
    SetFluxModel { vis: PathBuf, field: String },
    DiscardTable(PathBuf),
    SolveGains(GainSolve),
    SolveBandpass(BandpassSolve),
    SolveFluxScale(FluxScale),
    Apply(ApplyCal),
    Clean(CleanRequest),
    ExportFits { image: PathBuf, fits: PathBuf },
    ManualFlags { vis: PathBuf, commands: Vec<FlagCommand> },
    Quack { interval_s: f64, mode: QuackMode },
    Clip(ClipScan),
    Outliers(OutlierScan),
    Extend(ExtendFlags),
    Summary { vis: PathBuf, column: DataColumn },
    Split(SplitRequest),
}

impl EngineCall {
    /// Short task name for order assertions.
    pub fn name(&self) -> &'static str {
        match self {
            EngineCall::ClearCal(_) => "clearcal",
            EngineCall::SetFluxModel { .. } => "setjy",
            EngineCall::DiscardTable(_) => "discard",
            EngineCall::SolveGains(_) => "gaincal",
            EngineCall::SolveBandpass(_) => "bandpass",
            EngineCall::SolveFluxScale(_) => "fluxscale",
            EngineCall::Apply(_) => "applycal",
            EngineCall::Clean(_) => "clean",
            EngineCall::ExportFits { .. } => "exportfits",
            EngineCall::ManualFlags { .. } => "manualflags",
            EngineCall::Quack { .. } => "quack",
            EngineCall::Clip(_) => "clip",
            EngineCall::Outliers(_) => "outliers",
            EngineCall::Extend(_) => "extend",
            EngineCall::Summary { .. } => "summary",
            EngineCall::Split(_) => "split",
        }
    }
}

/// An engine that records every operation and succeeds, except on the one
/// task name it was told to fail.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingEngine {
    pub calls: Vec<EngineCall>,
    /// Fail any call whose [`EngineCall::name`] matches
    pub fail_on: Option<&'static str>,
    /// Returned from every summary call
    pub summary: FlagSummary,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.calls.iter().map(EngineCall::name).collect()
    }

    pub fn gain_solves(&self) -> Vec<&GainSolve> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::SolveGains(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn applies(&self) -> Vec<&ApplyCal> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::Apply(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn cleans(&self) -> Vec<&CleanRequest> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::Clean(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn splits(&self) -> Vec<&SplitRequest> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::Split(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    fn record(&mut self, call: EngineCall) -> Result<(), EngineError> {
        let name = call.name();
        self.calls.push(call);
        match self.fail_on {
            Some(failing) if failing == name => {
                Err(EngineError::new(name, "mock.ms", "forced failure"))
            }
            _ => Ok(()),
        }
    }
}

impl CalibrationEngine for RecordingEngine {
    fn reset_calibration(&mut self, vis: &Path) -> Result<(), EngineError> {
        self.record(EngineCall::ClearCal(vis.to_path_buf()))
    }

    fn set_flux_model(
        &mut self,
        vis: &Path,
        field: &str,
        _spw: &str,
        _standard: &str,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::SetFluxModel {
            vis: vis.to_path_buf(),
            field: field.to_string(),
        })
    }

    fn discard_table(&mut self, table: &Path) -> Result<(), EngineError> {
        self.record(EngineCall::DiscardTable(table.to_path_buf()))
    }

    fn solve_gains(&mut self, req: &GainSolve) -> Result<(), EngineError> {
        self.record(EngineCall::SolveGains(req.clone()))
    }

    fn solve_bandpass(&mut self, req: &BandpassSolve) -> Result<(), EngineError> {
        self.record(EngineCall::SolveBandpass(req.clone()))
    }

    fn solve_flux_scale(&mut self, req: &FluxScale) -> Result<(), EngineError> {
        self.record(EngineCall::SolveFluxScale(req.clone()))
    }

    fn apply(&mut self, req: &ApplyCal) -> Result<(), EngineError> {
        self.record(EngineCall::Apply(req.clone()))
    }
}

impl ImagingEngine for RecordingEngine {
    fn clean(&mut self, req: &CleanRequest) -> Result<(), EngineError> {
        self.record(EngineCall::Clean(req.clone()))
    }

    fn export_fits(&mut self, image: &Path, fits: &Path) -> Result<(), EngineError> {
        self.record(EngineCall::ExportFits {
            image: image.to_path_buf(),
            fits: fits.to_path_buf(),
        })
    }
}

impl FlaggingEngine for RecordingEngine {
    fn apply_manual_flags(
        &mut self,
        vis: &Path,
        commands: &[FlagCommand],
    ) -> Result<(), EngineError> {
        self.record(EngineCall::ManualFlags {
            vis: vis.to_path_buf(),
            commands: commands.to_vec(),
        })
    }

    fn quack(&mut self, _vis: &Path, interval_s: f64, mode: QuackMode) -> Result<(), EngineError> {
        self.record(EngineCall::Quack { interval_s, mode })
    }

    fn clip(&mut self, req: &ClipScan) -> Result<(), EngineError> {
        self.record(EngineCall::Clip(req.clone()))
    }

    fn detect_outliers(&mut self, req: &OutlierScan) -> Result<(), EngineError> {
        self.record(EngineCall::Outliers(req.clone()))
    }

    fn extend(&mut self, req: &ExtendFlags) -> Result<(), EngineError> {
        self.record(EngineCall::Extend(req.clone()))
    }

    fn summarize(&mut self, vis: &Path, column: DataColumn) -> Result<FlagSummary, EngineError> {
        self.record(EngineCall::Summary {
            vis: vis.to_path_buf(),
            column,
        })?;
        Ok(self.summary.clone())
    }
}

impl TransformEngine for RecordingEngine {
    fn split(&mut self, req: &SplitRequest) -> Result<(), EngineError> {
        self.record(EngineCall::Split(req.clone()))
    }
}

pub(crate) fn gmrt_antennas() -> Vec<String> {
    GMRT_ANTENNA_NAMES
        .iter()
        .map(|name| name.to_string())
        .collect()
}

/// A healthy band-3 observation: one flux calibrator, one phase calibrator,
/// one target, the full array and a 2048-channel 300-500 MHz band.
pub(crate) fn standard_observation() -> MockObservation {
    let mut obs = MockObservation::new();
    obs.fields = vec![
        ("3C286".to_string(), vec![1]),
        ("J1822-0938".to_string(), vec![2, 4, 6]),
        ("DEEP2".to_string(), vec![3, 5]),
    ];
    obs.antennas = gmrt_antennas();
    obs.frequencies = (0..2048).map(|i| 0.3e9 + i as f64 * 97656.25).collect();
    obs.default_mean = 5.0;
    obs
}
