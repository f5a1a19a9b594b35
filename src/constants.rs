//! Useful constants.
//!
//! Values here are the operational defaults for uGMRT continuum reduction;
//! everything is overridable through [`crate::PipelineConfig`].

/// Flux-density standards recognised as amplitude calibrators, including the
/// B1950 aliases the observatory scheduler emits.
pub const STANDARD_AMP_CALIBRATORS: [&str; 6] = [
    "3C48", "3C147", "3C286", "0542+498", "1331+305", "0137+331",
];

/// Preferred flux-scale reference sources, best first. The first of these
/// present among the amplitude calibrators anchors the flux transfer.
pub const FLUX_REFERENCE_PRIORITY: [&str; 2] = ["3C286", "3C147"];

/// Known persistent uGMRT RFI bands in Hz, as a flat sequence where each
/// consecutive pair is one (lower, upper) interval. Channels strictly inside
/// any interval are always bad.
pub const PERSISTENT_RFI_HZ: [f64; 8] = [
    0.36e9, 0.3796e9, 0.486e9, 0.49355e9, 0.8808e9, 0.885596e9, 0.7646e9, 0.769092e9,
];

/// The thirty GMRT antennas. Names with a `C` prefix are in the central
/// square; `E`, `S` and `W` prefixes are the arm antennas.
pub const GMRT_ANTENNA_NAMES: [&str; 30] = [
    "C00", "C01", "C02", "C03", "C04", "C05", "C06", "C08", "C09", "C10", "C11", "C12", "C13",
    "C14", "E02", "E03", "E04", "E05", "E06", "S01", "S02", "S03", "S04", "S06", "W01", "W02",
    "W03", "W04", "W05", "W06",
];

/// Antenna name prefix of the central square.
pub const CORE_ANTENNA_PREFIX: char = 'C';

/// Correlations sampled by the raw mean-amplitude statistic.
pub const DEFAULT_CORRELATIONS: [&str; 2] = ["rr", "ll"];

/// Raw mean amplitudes below this mark an antenna dead for the scan.
pub const DEFAULT_MEAN_AMP_CUTOFF: f64 = 0.4;

/// Clean iteration count for the first self-calibration round; doubles each
/// round after that.
pub const SELFCAL_NITER_BASE: u32 = 1500;

/// Ceiling on the per-round clean iteration count.
pub const SELFCAL_NITER_CAP: u32 = 200_000;

/// Flux-density standard passed to the model-setting task.
pub const FLUX_STANDARD: &str = "Perley-Butler 2013";
