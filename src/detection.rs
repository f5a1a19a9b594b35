//! Statistical detection of dead antennas and persistently bad channels.
//!
//! Both detectors run before any calibration, on raw amplitudes, and emit
//! manual flag commands rather than flagging directly. Batching the
//! commands keeps a record of what was condemned and why, and lets a dry
//! run show the damage without touching the data.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};
use thiserror::Error;

use crate::constants::{DEFAULT_CORRELATIONS, PERSISTENT_RFI_HZ};
use crate::engine::{AmpStatQuery, EngineError, FlagCommand, MetadataReader};

#[derive(Error, Debug)]
pub enum DetectionError {
    /// The metadata needed for detection could not be read.
    #[error(transparent)]
    Metadata(#[from] EngineError),
}

/// The outcome of a bad-antenna sweep: the per-scan flag commands plus
/// the set of antennas condemned on at least one calibrator scan, in
/// detection order.
#[derive(Debug, Default, PartialEq)]
pub struct AntennaSweep {
    /// Manual flags, one antenna set per affected scan.
    pub commands: Vec<FlagCommand>,
    /// Every antenna condemned at least once, deduplicated.
    pub antennas: Vec<String>,
}

/// Finds antennas with no usable signal on the calibrator scans.
///
/// An antenna whose mean raw amplitude over a narrow clean window falls
/// below the cutoff in either correlation is dead or severely detuned for
/// that scan. Detection runs only on calibrator scans, where the expected
/// amplitude is known to be high; a flagged calibrator scan also condemns
/// the neighbouring target scans, which share the antenna state but are
/// too faint to test directly.
#[derive(Debug)]
pub struct BadAntennaDetector<'a, M> {
    reader: &'a M,
    probe: String,
    cutoff: f64,
}

impl<'a, M: MetadataReader> BadAntennaDetector<'a, M> {
    /// A detector reading amplitudes over the `probe` channel window and
    /// condemning antennas whose scan mean falls below `cutoff`.
    pub fn new<S: Into<String>>(reader: &'a M, probe: S, cutoff: f64) -> Self {
        Self {
            reader,
            probe: probe.into(),
            cutoff,
        }
    }

    /// Worst-correlation test for one antenna on one scan. A statistics
    /// query that fails marks the antenna bad for the scan.
    fn antenna_is_bad(&self, antenna: &str, scan: u32) -> bool {
        let mut worst = f64::INFINITY;
        for correlation in DEFAULT_CORRELATIONS {
            let query = AmpStatQuery {
                scan,
                antenna: antenna.to_string(),
                correlation: correlation.to_string(),
                spw: self.probe.clone(),
            };
            match self.reader.raw_mean_amplitude(&query) {
                Ok(mean) => worst = worst.min(mean),
                Err(err) => {
                    warn!(
                        "no {correlation} statistics for {antenna} on scan {scan}, \
                         treating it as bad: {err}"
                    );
                    return true;
                }
            }
        }
        worst < self.cutoff
    }

    /// Flag commands for every antenna found dead on a calibrator scan,
    /// expanded onto adjacent target scans.
    pub fn detect(
        &self,
        antennas: &[String],
        cal_scans: &[u32],
        target_scans: &[u32],
    ) -> AntennaSweep {
        // Progress bar for the sweep; one statistics query per antenna,
        // correlation and calibrator scan adds up on long observations.
        let sweep_progress = ProgressBar::with_draw_target(
            Some(cal_scans.len() as u64 * antennas.len() as u64),
            ProgressDrawTarget::stderr(),
        );
        sweep_progress.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{msg:16}: [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent:3}% ({eta:5})",
                )
                .unwrap()
                .progress_chars("=> "),
        );
        sweep_progress.set_message("antenna sweep");

        let mut sweep = AntennaSweep::default();
        for &scan in cal_scans {
            let mut bad = Vec::new();
            for antenna in antennas {
                if self.antenna_is_bad(antenna, scan) {
                    bad.push(antenna.clone());
                }
                sweep_progress.inc(1);
            }
            if bad.is_empty() {
                continue;
            }
            info!("bad antennas on scan {scan}: {}", bad.join(", "));
            for antenna in &bad {
                if !sweep.antennas.contains(antenna) {
                    sweep.antennas.push(antenna.clone());
                }
            }
            sweep.commands.push(FlagCommand::Antennas {
                antennas: bad.clone(),
                scan,
            });
            if let Some(previous) = scan.checked_sub(1) {
                if target_scans.contains(&previous) {
                    sweep.commands.push(FlagCommand::Antennas {
                        antennas: bad.clone(),
                        scan: previous,
                    });
                }
            }
            let next = scan + 1;
            if target_scans.contains(&next) {
                sweep.commands.push(FlagCommand::Antennas {
                    antennas: bad,
                    scan: next,
                });
            }
        }
        sweep_progress.finish();
        sweep
    }
}

/// Finds channels that fall inside the known persistent RFI bands.
///
/// GMRT sees fixed transmitters whose frequencies never move; any channel
/// inside one of those bands is flagged for the whole observation before
/// statistical flagging runs.
#[derive(Debug)]
pub struct BadChannelDetector<'a, M> {
    reader: &'a M,
}

impl<'a, M: MetadataReader> BadChannelDetector<'a, M> {
    pub fn new(reader: &'a M) -> Self {
        Self { reader }
    }

    /// A single flag command covering every channel of `spw` inside a
    /// persistent RFI band, or `None` when the band is clean.
    ///
    /// Channels are listed per RFI band, ascending within each. Band edges
    /// are exclusive.
    ///
    /// # Errors
    ///
    /// A [`DetectionError`] when the channel frequencies cannot be read.
    pub fn detect(&self, spw: usize) -> Result<Option<FlagCommand>, DetectionError> {
        let frequencies = self.reader.channel_frequencies(spw)?;
        let mut selectors = Vec::new();
        for window in PERSISTENT_RFI_HZ.chunks_exact(2) {
            let (low, high) = (window[0], window[1]);
            for (channel, freq) in frequencies.iter().enumerate() {
                if *freq > low && *freq < high {
                    selectors.push(format!("{spw}:{channel}"));
                }
            }
        }
        if selectors.is_empty() {
            info!("no persistent RFI frequencies fall in the observed band");
            return Ok(None);
        }
        info!("{} channels sit in persistent RFI bands", selectors.len());
        Ok(Some(FlagCommand::Channels {
            selector: selectors.join(", "),
        }))
    }
}
