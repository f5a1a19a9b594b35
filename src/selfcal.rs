//! The self-calibration loop: image, flag residuals, solve gains off the
//! model, apply, split, repeat on the split.
//!
//! Each round images the output of the previous round, so errors never
//! accumulate in one file; the gain solves start from scratch each round
//! (no table chaining) and the solution lineage is kept in the
//! [`ArtifactRegistry`] instead. Early rounds solve phase only; amplitude
//! joins once the model is believable. The final round only images and
//! flags, since a solve without a following image would go unused.

use std::path::{Path, PathBuf};

use log::{debug, info};
use strum_macros::Display;
use thiserror::Error;

use crate::artifacts::{ArtifactRegistry, ResourceError};
use crate::config::PipelineConfig;
use crate::engine::{
    ApplyCal, CalMode, CalibrationEngine, CleanRequest, ClipScan, DataColumn, EngineError,
    FlaggingEngine, GainSolve, ImagingEngine, OutlierMode, OutlierScan, SplitRequest,
    TransformEngine,
};
use crate::error::TarangError;

/// Error from the imaging side of the loop.
#[derive(Error, Debug)]
pub enum ImagingError {
    /// Deconvolution failed.
    #[error("deconvolution failed in round {round}: {source}")]
    Clean {
        /// The self-calibration round
        round: usize,
        /// The engine's account of the failure
        source: EngineError,
    },
    /// The restored image could not be exported.
    #[error("could not export the round-{round} image: {source}")]
    Export {
        /// The self-calibration round
        round: usize,
        /// The engine's account of the failure
        source: EngineError,
    },
    /// Residual flagging failed.
    #[error("residual flagging failed in round {round}: {source}")]
    ResidualFlag {
        /// The self-calibration round
        round: usize,
        /// The engine's account of the failure
        source: EngineError,
    },
    /// The round's gain solve failed.
    #[error("the round-{round} gain solve failed: {source}")]
    Solve {
        /// The self-calibration round
        round: usize,
        /// The engine's account of the failure
        source: EngineError,
    },
    /// The round's solutions could not be applied.
    #[error("could not apply the round-{round} solutions: {source}")]
    Apply {
        /// The self-calibration round
        round: usize,
        /// The engine's account of the failure
        source: EngineError,
    },
}

/// Where one round currently is, for trace logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
enum RoundState {
    Imaging,
    ResidualFlagging,
    GainSolving,
    Applying,
    Splitting,
    Cleanup,
}

/// The per-round knobs, derived once from the configuration.
#[derive(Debug, Clone)]
pub struct SelfCalSchedule {
    rounds: usize,
    phase_only: usize,
    threshold_mjy: f64,
    niter_base: u32,
    niter_cap: u32,
    solints: Vec<String>,
}

impl SelfCalSchedule {
    /// Derive the schedule from a validated configuration.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            rounds: config.selfcal_rounds,
            phase_only: config.phase_only_rounds,
            threshold_mjy: config.threshold_mjy,
            niter_base: config.niter_base,
            niter_cap: config.niter_cap,
            solints: config.solints.clone(),
        }
    }

    /// Total rounds `N`; the loop images rounds `0..=N`.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Clean iteration limit of one round, doubling per round up to the cap.
    pub fn niter(&self, round: usize) -> u32 {
        let doubled = (u64::from(self.niter_base)) << round.min(32);
        doubled.min(u64::from(self.niter_cap)) as u32
    }

    /// Clean threshold of one round in mJy, decaying harmonically.
    pub fn threshold_mjy(&self, round: usize) -> f64 {
        self.threshold_mjy / (round + 1) as f64
    }

    /// Solution mode of one round.
    pub fn mode(&self, round: usize) -> CalMode {
        if round < self.phase_only {
            CalMode::Phase
        } else {
            CalMode::PhaseAmplitude
        }
    }

    /// Solution interval of one round.
    pub fn solint(&self, round: usize) -> &str {
        &self.solints[round]
    }
}

/// What one round produced. The terminal round has no gain table or
/// output file.
#[derive(Debug, Clone)]
pub struct SelfCalRound {
    /// Round index
    pub round: usize,
    /// Solution mode the round solved in
    pub mode: CalMode,
    /// Base name of the image
    pub image: String,
    /// FITS export of the restored image
    pub fits: PathBuf,
    /// The gain table solved this round
    pub gain_table: Option<PathBuf>,
    /// The calibrated file handed to the next round
    pub output_vis: Option<PathBuf>,
}

/// Drives the whole loop against one engine.
#[derive(Debug)]
pub struct SelfCalLoop<'a> {
    config: &'a PipelineConfig,
    schedule: SelfCalSchedule,
    refant: String,
}

impl<'a> SelfCalLoop<'a> {
    /// A loop solving against `refant`, scheduled from the configuration.
    pub fn new<S: Into<String>>(config: &'a PipelineConfig, refant: S) -> Self {
        Self {
            config,
            schedule: SelfCalSchedule::from_config(config),
            refant: refant.into(),
        }
    }

    /// The derived schedule, for plan displays.
    pub fn schedule(&self) -> &SelfCalSchedule {
        &self.schedule
    }

    /// Run the loop on `input`, the channel-averaged target file.
    ///
    /// # Errors
    ///
    /// A [`TarangError`] from the first step that fails; everything already
    /// produced stays on disk.
    pub fn run<E>(
        &self,
        engine: &mut E,
        registry: &mut ArtifactRegistry,
        input: &Path,
    ) -> Result<Vec<SelfCalRound>, TarangError>
    where
        E: ImagingEngine + FlaggingEngine + CalibrationEngine + TransformEngine,
    {
        if self.schedule.rounds() == 0 || self.config.make_dirty_only {
            info!("making a single dirty image of {}", input.display());
            let image = ArtifactRegistry::dirty_image_name();
            let fits = self.image(engine, registry, input, &image, 0, 0)?;
            return Ok(vec![SelfCalRound {
                round: 0,
                mode: CalMode::Phase,
                image,
                fits,
                gain_table: None,
                output_vis: None,
            }]);
        }

        let total = self.schedule.rounds();
        let mut current = input.to_path_buf();
        let mut rounds = Vec::with_capacity(total + 1);
        for round in 0..=total {
            let mode = self.schedule.mode(round);
            info!(
                "self-cal round {round}/{total} ({mode}) on {}",
                current.display()
            );

            let image = ArtifactRegistry::image_name(round);
            let fits = self.image(
                engine,
                registry,
                &current,
                &image,
                round,
                self.schedule.niter(round),
            )?;
            self.flag_residual(engine, &current, round)?;

            if round == total {
                // The last image is the product; a solve here would never
                // be applied to anything that gets imaged again.
                rounds.push(SelfCalRound {
                    round,
                    mode,
                    image,
                    fits,
                    gain_table: None,
                    output_vis: None,
                });
                break;
            }

            let gain_table = self.solve_round(engine, registry, &current, round, mode)?;

            debug!("round {round}: {}", RoundState::Applying);
            engine
                .apply(&ApplyCal {
                    vis: current.clone(),
                    field: "0".to_string(),
                    spw: String::new(),
                    gaintables: vec![gain_table.clone()],
                    gainfield: vec!["0".to_string()],
                    interp: vec!["linear".to_string()],
                    calwt: false,
                    applymode: "calflag".to_string(),
                    parang: false,
                })
                .map_err(|source| ImagingError::Apply { round, source })?;

            debug!("round {round}: {}", RoundState::Splitting);
            let output = registry.register_round_vis(round);
            engine
                .split(&SplitRequest {
                    vis: current.clone(),
                    out: output.clone(),
                    field: "0".to_string(),
                    spw: "0".to_string(),
                    column: DataColumn::Corrected,
                    chan_bin: 1,
                })
                .map_err(|source| ResourceError::Split { round, source })?;

            // The split supersedes the previous round's file; the loop
            // input itself is never retired.
            if let Some(previous) = round.checked_sub(1) {
                debug!("round {round}: {}", RoundState::Cleanup);
                registry.retire_round_vis(previous)?;
            }

            rounds.push(SelfCalRound {
                round,
                mode,
                image,
                fits,
                gain_table: Some(gain_table),
                output_vis: Some(output.clone()),
            });
            current = output;
        }
        Ok(rounds)
    }

    /// Clean one image and export it to FITS, returning the FITS path.
    fn image<E: ImagingEngine>(
        &self,
        engine: &mut E,
        registry: &ArtifactRegistry,
        vis: &Path,
        image: &str,
        round: usize,
        niter: u32,
    ) -> Result<PathBuf, ImagingError> {
        debug!("round {round}: {}", RoundState::Imaging);
        engine
            .clean(&CleanRequest {
                vis: vis.to_path_buf(),
                image_name: image.to_string(),
                field: "0".to_string(),
                spw: "0".to_string(),
                niter,
                threshold_mjy: self.schedule.threshold_mjy(round),
                cell: self.config.cell.clone(),
                imsize: self.config.imsize,
                nterms: self.config.nterms,
                wproj_planes: self.config.wproj_planes,
                scales: vec![0, 5, 15],
                save_model: true,
            })
            .map_err(|source| ImagingError::Clean { round, source })?;
        let restored = registry.restored_image(image, self.config.nterms);
        let fits = registry.fits_path(image);
        engine
            .export_fits(&restored, &fits)
            .map_err(|source| ImagingError::Export { round, source })?;
        Ok(fits)
    }

    /// Reject model misfits before they contaminate the next solve: a
    /// sliding-window pass and a clip, both on the residual column.
    fn flag_residual<E: FlaggingEngine>(
        &self,
        engine: &mut E,
        vis: &Path,
        round: usize,
    ) -> Result<(), ImagingError> {
        debug!("round {round}: {}", RoundState::ResidualFlagging);
        let wrap = |source| ImagingError::ResidualFlag { round, source };
        engine
            .detect_outliers(&OutlierScan {
                vis: vis.to_path_buf(),
                column: DataColumn::Residual,
                mode: OutlierMode::RFlag {
                    time_dev_scale: 3.0,
                    freq_dev_scale: 3.0,
                },
                ntime: "scan".to_string(),
                spectral_max: Some(500.0),
                ..OutlierScan::default()
            })
            .map_err(wrap)?;
        engine
            .clip(&ClipScan {
                vis: vis.to_path_buf(),
                field: String::new(),
                spw: String::new(),
                column: DataColumn::Residual,
                range: self.config.clip_residual,
            })
            .map_err(wrap)?;
        engine.summarize(vis, DataColumn::Residual).map_err(wrap)?;
        Ok(())
    }

    /// Solve this round's gains off the model written by the clean. Phase
    /// rounds honour the self-cal baseline cutoff; amplitude rounds use
    /// every baseline and normalize, so the flux scale cannot drift.
    fn solve_round<E: CalibrationEngine>(
        &self,
        engine: &mut E,
        registry: &mut ArtifactRegistry,
        vis: &Path,
        round: usize,
        mode: CalMode,
    ) -> Result<PathBuf, ImagingError> {
        debug!("round {round}: {}", RoundState::GainSolving);
        let solint = self.schedule.solint(round);
        let (_, table) = registry.register_gain_table(round, mode, solint);
        let uvrange = match mode {
            CalMode::Phase => self.config.uvrange_selfcal.clone(),
            CalMode::PhaseAmplitude => String::new(),
        };
        engine
            .solve_gains(&GainSolve {
                vis: vis.to_path_buf(),
                table: table.clone(),
                field: "0".to_string(),
                spw: String::new(),
                uvrange,
                solint: solint.to_string(),
                refant: self.refant.clone(),
                min_snr: 2.0,
                mode,
                solnorm: mode == CalMode::PhaseAmplitude,
                ..GainSolve::default()
            })
            .map_err(|source| ImagingError::Solve { round, source })?;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::{EngineCall, RecordingEngine};
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn config(rounds: usize, phase_only: usize) -> PipelineConfig {
        PipelineConfig {
            selfcal_rounds: rounds,
            phase_only_rounds: phase_only,
            solints: vec!["1.0min".to_string(); rounds.max(1)],
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn schedule_doubles_iterations_up_to_the_cap() {
        let schedule = SelfCalSchedule::from_config(&PipelineConfig::default());
        assert_eq!(schedule.niter(0), 1500);
        assert_eq!(schedule.niter(1), 3000);
        assert_eq!(schedule.niter(7), 192_000);
        assert_eq!(schedule.niter(8), 200_000);
        assert_eq!(schedule.niter(20), 200_000);
    }

    #[test]
    fn schedule_decays_the_threshold() {
        let schedule = SelfCalSchedule::from_config(&PipelineConfig::default());
        assert_abs_diff_eq!(schedule.threshold_mjy(0), 0.1);
        assert_abs_diff_eq!(schedule.threshold_mjy(1), 0.05);
        assert_abs_diff_eq!(schedule.threshold_mjy(7), 0.0125);
    }

    #[test]
    fn schedule_switches_mode_at_the_phase_boundary() {
        let schedule = SelfCalSchedule::from_config(&PipelineConfig::default());
        assert_eq!(schedule.mode(0), CalMode::Phase);
        assert_eq!(schedule.mode(3), CalMode::Phase);
        assert_eq!(schedule.mode(4), CalMode::PhaseAmplitude);
        assert_eq!(schedule.mode(8), CalMode::PhaseAmplitude);
    }

    #[test]
    fn zero_rounds_yields_one_dirty_image() {
        let config = config(0, 0);
        let looper = SelfCalLoop::new(&config, "C00");
        let mut registry = ArtifactRegistry::new("work");
        let mut engine = RecordingEngine::new();
        let rounds = looper
            .run(&mut engine, &mut registry, Path::new("DEEP2avg-split.ms"))
            .unwrap();
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].image, "dirty-img");
        assert!(rounds[0].gain_table.is_none());
        let cleans = engine.cleans();
        assert_eq!(cleans.len(), 1);
        assert_eq!(cleans[0].niter, 0);
        assert_eq!(engine.names(), vec!["clean", "exportfits"]);
    }

    #[test]
    fn two_round_loop_runs_the_full_cycle() {
        let config = config(2, 1);
        let looper = SelfCalLoop::new(&config, "C00");
        let mut registry = ArtifactRegistry::new("work");
        let mut engine = RecordingEngine::new();
        let rounds = looper
            .run(&mut engine, &mut registry, Path::new("DEEP2avg-split.ms"))
            .unwrap();
        assert_eq!(rounds.len(), 3);
        assert_eq!(
            engine.names(),
            vec![
                // round 0: image, flag residuals, solve, apply, split
                "clean", "exportfits", "outliers", "clip", "summary", "gaincal", "applycal",
                "split",
                // round 1, imaging the round-0 split
                "clean", "exportfits", "outliers", "clip", "summary", "gaincal", "applycal",
                "split",
                // terminal round: image and flag only
                "clean", "exportfits", "outliers", "clip", "summary",
            ]
        );

        let solves = engine.gain_solves();
        assert_eq!(solves[0].table, PathBuf::from("work/p0.GT"));
        assert_eq!(solves[0].mode, CalMode::Phase);
        assert!(!solves[0].solnorm);
        assert_eq!(solves[1].table, PathBuf::from("work/ap1.GT"));
        assert!(solves[1].solnorm);

        let splits = engine.splits();
        assert_eq!(splits[0].vis, PathBuf::from("DEEP2avg-split.ms"));
        assert_eq!(splits[0].out, PathBuf::from("work/vis-selfcal0.ms"));
        assert_eq!(splits[0].column, DataColumn::Corrected);
        assert_eq!(splits[1].vis, PathBuf::from("work/vis-selfcal0.ms"));
        assert_eq!(splits[1].out, PathBuf::from("work/vis-selfcal1.ms"));

        let cleans = engine.cleans();
        assert_eq!(cleans[0].vis, PathBuf::from("DEEP2avg-split.ms"));
        assert_eq!(cleans[1].vis, PathBuf::from("work/vis-selfcal0.ms"));
        assert_eq!(cleans[2].vis, PathBuf::from("work/vis-selfcal1.ms"));
        assert_eq!(cleans[1].niter, 3000);
        assert_abs_diff_eq!(cleans[2].threshold_mjy, 0.1 / 3.0);
    }

    #[test]
    fn superseded_round_files_are_deleted() {
        let dir = tempdir().unwrap();
        let config = config(2, 1);
        let looper = SelfCalLoop::new(&config, "C00");
        let mut registry = ArtifactRegistry::new(dir.path());
        // Pretend the round-0 split materialized on disk.
        let round0 = dir.path().join("vis-selfcal0.ms");
        std::fs::create_dir(&round0).unwrap();

        let mut engine = RecordingEngine::new();
        looper
            .run(&mut engine, &mut registry, Path::new("DEEP2avg-split.ms"))
            .unwrap();
        // Retired when the round-1 split landed.
        assert!(!round0.exists());
        assert!(registry.round_vis(0).is_none());
        assert!(registry.round_vis(1).is_some());
    }

    #[test]
    fn residual_flags_read_the_residual_column() {
        let config = config(1, 1);
        let looper = SelfCalLoop::new(&config, "C00");
        let mut registry = ArtifactRegistry::new("work");
        let mut engine = RecordingEngine::new();
        looper
            .run(&mut engine, &mut registry, Path::new("DEEP2avg-split.ms"))
            .unwrap();
        for call in &engine.calls {
            match call {
                EngineCall::Outliers(req) => {
                    assert_eq!(req.column, DataColumn::Residual);
                    assert!(matches!(
                        req.mode,
                        OutlierMode::RFlag {
                            time_dev_scale,
                            freq_dev_scale,
                        } if time_dev_scale == 3.0 && freq_dev_scale == 3.0
                    ));
                }
                EngineCall::Clip(req) => {
                    assert_eq!(req.column, DataColumn::Residual);
                    assert_eq!(req.range, (0.0, 10.0));
                }
                _ => {}
            }
        }
    }

    #[test]
    fn a_failed_clean_stops_the_loop() {
        let config = config(3, 2);
        let looper = SelfCalLoop::new(&config, "C00");
        let mut registry = ArtifactRegistry::new("work");
        let mut engine = RecordingEngine::new();
        engine.fail_on = Some("clean");
        let err = looper
            .run(&mut engine, &mut registry, Path::new("DEEP2avg-split.ms"))
            .unwrap_err();
        assert!(matches!(
            err,
            TarangError::Imaging(ImagingError::Clean { round: 0, .. })
        ));
        assert_eq!(engine.names(), vec!["clean"]);
    }
}
