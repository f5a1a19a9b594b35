//! The direction-independent calibration pass: delay, bandpass and gain
//! solves against the calibrators, flux-scale transfer, and application to
//! every field.
//!
//! The pass runs twice in a full reduction. The initial pass works on
//! lightly-flagged data; after the corrected column has been flagged the
//! whole pass is redone from scratch with a `recal` suffix on every table,
//! replacing the first-pass solutions rather than refining them.

use std::path::PathBuf;

use log::{info, warn};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::constants::FLUX_STANDARD;
use crate::context::PipelineContext;
use crate::engine::{
    ApplyCal, BandpassSolve, CalMode, CalibrationEngine, EngineError, FluxScale, GainSolve,
    GainType,
};

/// Error from the calibration pass. Every solve is load-bearing, so the
/// first failure aborts the pass.
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// The corrected and model columns could not be reset.
    #[error("could not reset calibration: {source}")]
    Reset {
        /// The engine's account of the failure
        source: EngineError,
    },
    /// A flux-density model could not be set.
    #[error("could not set the flux model of {field}: {source}")]
    Model {
        /// The amplitude calibrator being modelled
        field: String,
        /// The engine's account of the failure
        source: EngineError,
    },
    /// A solve (or the removal of its stale table) failed.
    #[error("the {stage} solve failed: {source}")]
    Solve {
        /// Which solve failed
        stage: &'static str,
        /// The engine's account of the failure
        source: EngineError,
    },
    /// Solutions could not be applied to a field selection.
    #[error("could not apply calibration to {field}: {source}")]
    Apply {
        /// The field selection being corrected
        field: String,
        /// The engine's account of the failure
        source: EngineError,
    },
}

/// One full calibration pass over one measurement set.
#[derive(Debug)]
pub struct CalibrationPass<'a> {
    ctx: &'a PipelineContext,
    config: &'a PipelineConfig,
    /// Appended to every table name; `recal` distinguishes the redone pass
    suffix: &'static str,
}

impl<'a> CalibrationPass<'a> {
    /// The first pass, tables named without a suffix.
    pub fn initial(ctx: &'a PipelineContext, config: &'a PipelineConfig) -> Self {
        Self {
            ctx,
            config,
            suffix: "",
        }
    }

    /// The redone pass after post-calibration flagging, tables suffixed
    /// `recal`.
    pub fn redo(ctx: &'a PipelineContext, config: &'a PipelineConfig) -> Self {
        Self {
            ctx,
            config,
            suffix: "recal",
        }
    }

    /// Calibration tables sit next to the measurement set, named after it.
    fn table(&self, kind: &str) -> PathBuf {
        PathBuf::from(format!(
            "{}.{}{}",
            self.ctx.vis.display(),
            kind,
            self.suffix
        ))
    }

    /// Run the pass: solve delay, provisional gains, bandpass and
    /// per-calibrator gains, transfer the flux scale, and apply.
    ///
    /// # Errors
    ///
    /// A [`CalibrationError`] naming the first step that failed.
    pub fn run<E: CalibrationEngine>(&self, engine: &mut E) -> Result<(), CalibrationError> {
        let vis = &self.ctx.vis;
        let flag_spw = &self.ctx.windows.flag;
        let refant = &self.ctx.refant;

        engine
            .reset_calibration(vis)
            .map_err(|source| CalibrationError::Reset { source })?;

        // The delay and bandpass shapes come from the flux calibrators.
        // Without one the phase calibrators have to carry them, on unit
        // models, and the flux scale stays arbitrary.
        let bandpass_cals = if self.ctx.fields.amp_cals.is_empty() {
            warn!(
                "no standard flux calibrator observed, solving delay and bandpass \
                 on the phase calibrators with unscaled models"
            );
            &self.ctx.fields.phase_cals
        } else {
            &self.ctx.fields.amp_cals
        };
        let bandpass_field = bandpass_cals.join(",");

        for field in &self.ctx.fields.amp_cals {
            engine
                .set_flux_model(vis, field, flag_spw, FLUX_STANDARD)
                .map_err(|source| CalibrationError::Model {
                    field: field.clone(),
                    source,
                })?;
        }

        let interp_chain = |n: usize| vec!["nearest,nearestflag".to_string(); n];

        let delay_table = self.table("K1");
        self.solve(engine, "delay", &delay_table, |engine| {
            engine.solve_gains(&GainSolve {
                vis: vis.clone(),
                table: delay_table.clone(),
                field: bandpass_cals[0].clone(),
                spw: flag_spw.clone(),
                solint: "60s".to_string(),
                refant: refant.clone(),
                min_snr: 2.0,
                gain_type: GainType::Delay,
                mode: CalMode::PhaseAmplitude,
                solnorm: true,
                ..GainSolve::default()
            })
        })?;

        // Provisional gains so the bandpass solve sees phase-stable data.
        let pregain_table = self.table("AP.G0");
        self.solve(engine, "provisional gain", &pregain_table, |engine| {
            engine.solve_gains(&GainSolve {
                vis: vis.clone(),
                table: pregain_table.clone(),
                field: bandpass_field.clone(),
                spw: flag_spw.clone(),
                solint: "int".to_string(),
                refant: refant.clone(),
                min_snr: 2.0,
                mode: CalMode::PhaseAmplitude,
                append: true,
                chain: vec![delay_table.clone()],
                interp: interp_chain(1),
                ..GainSolve::default()
            })
        })?;

        let bandpass_table = self.table("B1");
        self.solve(engine, "bandpass", &bandpass_table, |engine| {
            engine.solve_bandpass(&BandpassSolve {
                vis: vis.clone(),
                table: bandpass_table.clone(),
                field: bandpass_field.clone(),
                spw: flag_spw.clone(),
                solint: "inf".to_string(),
                refant: refant.clone(),
                min_snr: 2.0,
                solnorm: true,
                fill_gaps: 8,
                chain: vec![delay_table.clone(), pregain_table.clone()],
                interp: interp_chain(2),
            })
        })?;

        // One appended gain solve per calibrator, over the inner gain
        // window, so the flux-scale transfer can rescale each field
        // separately.
        let gain_table = self.table("AP.G.");
        engine
            .discard_table(&gain_table)
            .map_err(|source| CalibrationError::Solve {
                stage: "per-calibrator gain",
                source,
            })?;
        for field in self.ctx.fields.calibrators() {
            engine
                .solve_gains(&GainSolve {
                    vis: vis.clone(),
                    table: gain_table.clone(),
                    field: field.clone(),
                    spw: self.ctx.windows.gain.clone(),
                    uvrange: self.config.uvrange_cal.clone(),
                    solint: "120s".to_string(),
                    refant: refant.clone(),
                    min_snr: 2.0,
                    mode: CalMode::PhaseAmplitude,
                    append: true,
                    chain: vec![delay_table.clone(), bandpass_table.clone()],
                    interp: interp_chain(2),
                    ..GainSolve::default()
                })
                .map_err(|source| CalibrationError::Solve {
                    stage: "per-calibrator gain",
                    source,
                })?;
        }

        let scale_table = self.flux_scale(engine, &gain_table)?;

        self.apply_all(engine, &[scale_table, delay_table, bandpass_table])?;
        info!("finished the {} calibration pass", self.pass_name());
        Ok(())
    }

    fn pass_name(&self) -> &'static str {
        if self.suffix.is_empty() {
            "initial"
        } else {
            "redone"
        }
    }

    fn solve<E, F>(
        &self,
        engine: &mut E,
        stage: &'static str,
        table: &PathBuf,
        run: F,
    ) -> Result<(), CalibrationError>
    where
        E: CalibrationEngine,
        F: FnOnce(&mut E) -> Result<(), EngineError>,
    {
        engine
            .discard_table(table)
            .and_then(|()| run(engine))
            .map_err(|source| CalibrationError::Solve { stage, source })
    }

    /// Transfer the flux scale from the reference calibrator onto the phase
    /// calibrators. Without phase calibrators (or without any flux
    /// calibrator to anchor against) the per-calibrator gains are applied
    /// unscaled.
    fn flux_scale<E: CalibrationEngine>(
        &self,
        engine: &mut E,
        gain_table: &PathBuf,
    ) -> Result<PathBuf, CalibrationError> {
        let reference = match self.ctx.fields.flux_reference() {
            Some(reference) if !self.ctx.fields.phase_cals.is_empty() => reference.to_string(),
            _ => {
                warn!("skipping the flux-scale transfer, gains will be applied unscaled");
                return Ok(gain_table.clone());
            }
        };
        let scale_table = self.table("fluxscale");
        self.solve(engine, "flux scale", &scale_table, |engine| {
            engine.solve_flux_scale(&FluxScale {
                vis: self.ctx.vis.clone(),
                caltable: gain_table.clone(),
                fluxtable: scale_table.clone(),
                reference: reference.clone(),
                transfer: self.ctx.fields.phase_cals.clone(),
            })
        })?;
        info!("flux scale anchored on {reference}");
        Ok(scale_table)
    }

    /// Apply `[scale, delay, bandpass]` to every field. Calibrators get
    /// their own solutions; targets get the phase-calibrator gains
    /// interpolated linearly across the bracketing scans.
    fn apply_all<E: CalibrationEngine>(
        &self,
        engine: &mut E,
        gaintables: &[PathBuf; 3],
    ) -> Result<(), CalibrationError> {
        let mut apply = |field: String, gainfield: Vec<String>, interp: Vec<String>| {
            engine
                .apply(&ApplyCal {
                    vis: self.ctx.vis.clone(),
                    field: field.clone(),
                    spw: self.ctx.windows.flag.clone(),
                    gaintables: gaintables.to_vec(),
                    gainfield,
                    interp,
                    calwt: false,
                    applymode: String::new(),
                    parang: false,
                })
                .map_err(|source| CalibrationError::Apply { field, source })
        };
        let own = |sel: &str| vec![sel.to_string(), String::new(), String::new()];
        let strs = |parts: [&str; 3]| parts.map(str::to_string).to_vec();

        for field in &self.ctx.fields.amp_cals {
            apply(field.clone(), own(field), strs(["nearest", "", ""]))?;
        }
        let phase_sel = self.ctx.phase_cal_selection();
        if !phase_sel.is_empty() {
            apply(
                phase_sel.clone(),
                own(&phase_sel),
                strs(["nearest", "", "nearest"]),
            )?;
        }
        if !self.ctx.fields.targets.is_empty() {
            // Without phase calibrators the flux calibrators bracket the
            // targets instead.
            let gain_source = if phase_sel.is_empty() {
                self.ctx.amp_cal_selection()
            } else {
                phase_sel
            };
            apply(
                self.ctx.target_selection(),
                own(&gain_source),
                strs(["linear", "", "nearest"]),
            )?;
        }
        Ok(())
    }
}
