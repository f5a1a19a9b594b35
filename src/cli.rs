//! Command line interface helpers for tarang.

use std::ffi::OsString;
use std::fmt::{Debug, Display};
use std::path::PathBuf;
use std::str::FromStr;

use clap::{arg, command, ValueHint::FilePath};
use log::{debug, info, trace, warn};
use prettytable::{format as prettyformat, row, table};

use crate::artifacts::ArtifactRegistry;
use crate::calibration::CalibrationPass;
use crate::checkpoint::{Checkpoint, Stage};
use crate::config::{load_phase_cal_list, PipelineConfig};
use crate::context::PipelineContext;
use crate::engine::script::ScriptEngine;
use crate::engine::{CalibrationEngine, DataColumn, SplitRequest, TransformEngine};
use crate::error::{CLIError::InvalidCommandLineArgument, TarangError, TarangError::DryRun};
use crate::fields::FieldClassifier;
use crate::flagging;
use crate::listing::ObsListing;
use crate::selfcal::{SelfCalLoop, SelfCalSchedule};
use crate::windows::ChannelWindows;

/// Everything a run needs: the observation listing, the configuration and
/// the paths the run reads and writes.
#[derive(Debug)]
pub struct TarangContext {
    /// Metadata dump of the observation being reduced
    pub listing: ObsListing,
    /// Stage toggles and numeric knobs
    pub config: PipelineConfig,
    /// Known phase-calibrator names, loaded from the reference list
    pub catalogue: Vec<String>,
    /// Directory reduction products land in
    pub workdir: PathBuf,
    /// Path the rendered script is written to
    pub script_out: PathBuf,
    /// Path of the stage checkpoint file
    pub checkpoint_path: PathBuf,
    /// Whether to resume after the last completed stage
    pub resume: bool,
}

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

/// stolen from hyperdrive
/// Write many info-level log lines of how this executable was compiled.
///
/// # Errors
///
/// propagates writeln! fails
pub fn fmt_build_info(f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match GIT_HEAD_REF {
        Some(hr) => {
            let dirty = GIT_DIRTY.unwrap_or(false);
            writeln!(
                f,
                "Compiled on git commit hash: {}{}",
                GIT_COMMIT_HASH.unwrap_or("<unknown>"),
                if dirty { " (dirty)" } else { "" }
            )?;
            writeln!(f, "            git head ref: {}", hr)?;
        }
        None => writeln!(f, "Compiled on git commit hash: <no git info>")?,
    }
    writeln!(f, "            {}", BUILT_TIME_UTC)?;
    writeln!(f, "         with compiler {}", RUSTC_VERSION)?;
    writeln!(f)?;
    Ok(())
}

impl Display for TarangContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} version {}", PKG_NAME, PKG_VERSION)?;

        fmt_build_info(f)?;

        writeln!(f, "Observation:          {}", self.listing.vis)?;
        writeln!(f, "Antennas:             {}", self.listing.antennas.len())?;
        let nchan = self
            .listing
            .spw_frequencies_hz
            .first()
            .map(Vec::len)
            .unwrap_or(0);
        writeln!(f, "Channels:             {nchan}")?;
        writeln!(f, "Scans:                {}", self.listing.scan_count())?;
        writeln!(f, "Reference antenna:    {}", self.config.refant)?;
        if let Some(windows) = ChannelWindows::for_channel_count(nchan) {
            writeln!(f, "Probe window:         {}", windows.probe)?;
            writeln!(f, "Flagging window:      {}", windows.flag)?;
            writeln!(f, "Gain window:          {}", windows.gain)?;
        }

        let field_names: Vec<String> = self
            .listing
            .fields
            .iter()
            .map(|entry| entry.name.clone())
            .collect();
        let fields =
            FieldClassifier::new(self.catalogue.iter().cloned()).classify(&field_names);
        let role_of = |name: &String| {
            if fields.amp_cals.contains(name) {
                "flux calibrator"
            } else if fields.phase_cals.contains(name) {
                "phase calibrator"
            } else {
                "target"
            }
        };
        let mut field_table = table!([r => "field", "role", "scans"]);
        for entry in &self.listing.fields {
            field_table.add_row(row![r =>
                entry.name,
                role_of(&entry.name),
                entry.scans.len(),
            ]);
        }
        field_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
        writeln!(f, "Fields:")?;
        writeln!(f, "{}", field_table)?;

        let toggles = &self.config.toggles;
        for (enabled, what) in [
            (
                toggles.detect_bad_antennas && self.listing.has_amplitude_stats(),
                "sweep the calibrator scans for dead antennas",
            ),
            (
                toggles.detect_bad_channels,
                "flag the persistent interference bands",
            ),
            (toggles.initial_flagging, "flag the raw data"),
            (
                toggles.initial_calibration,
                "run the initial calibration pass",
            ),
            (toggles.post_cal_flagging, "flag the corrected data"),
            (toggles.recalibration, "redo the calibration pass"),
            (toggles.split_targets, "split the corrected target data"),
            (toggles.split_flagging, "flag the split data"),
            (toggles.average_channels, "average the split channels"),
            (toggles.averaged_flagging, "flag the averaged data"),
            (toggles.selfcal, "self-calibrate the targets"),
        ] {
            writeln!(
                f,
                "{} {}.",
                if enabled { "Will" } else { "Will not" },
                what
            )?;
        }

        if toggles.selfcal {
            let schedule = SelfCalSchedule::from_config(&self.config);
            let mut plan = table!([r => "round", "mode", "solint", "niter", "threshold [mJy]"]);
            for round in 0..=schedule.rounds() {
                if round == schedule.rounds() {
                    plan.add_row(row![r =>
                        round,
                        "image only",
                        "",
                        schedule.niter(round),
                        format!("{:.4}", schedule.threshold_mjy(round)),
                    ]);
                } else {
                    plan.add_row(row![r =>
                        round,
                        schedule.mode(round),
                        schedule.solint(round),
                        schedule.niter(round),
                        format!("{:.4}", schedule.threshold_mjy(round)),
                    ]);
                }
            }
            plan.set_format(*prettyformat::consts::FORMAT_CLEAN);
            writeln!(f, "Self-calibration plan:")?;
            writeln!(f, "{}", plan)?;
        }

        writeln!(f, "Work directory:       {}", self.workdir.display())?;
        writeln!(f, "Script output:        {}", self.script_out.display())?;
        writeln!(f, "Checkpoint:           {}", self.checkpoint_path.display())?;
        Ok(())
    }
}

fn optional_value<T>(
    matches: &clap::ArgMatches,
    option: &str,
    expected: &str,
) -> Result<Option<T>, TarangError>
where
    T: FromStr,
{
    match matches.value_of(option) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| {
            TarangError::CLIError(InvalidCommandLineArgument {
                option: format!("--{option}"),
                expected: expected.to_string(),
                received: raw.to_string(),
            })
        }),
    }
}

fn optional_range(
    matches: &clap::ArgMatches,
    option: &str,
) -> Result<Option<(f64, f64)>, TarangError> {
    let Some(values) = matches.values_of(option) else {
        return Ok(None);
    };
    let values: Vec<&str> = values.collect();
    let parsed: Result<Vec<f64>, _> = values.iter().map(|v| v.parse()).collect();
    match parsed.as_deref() {
        Ok([low, high]) => Ok(Some((*low, *high))),
        _ => Err(TarangError::CLIError(InvalidCommandLineArgument {
            option: format!("--{option} <MIN> <MAX>"),
            expected: "two amplitudes".to_string(),
            received: values.join(" "),
        })),
    }
}

impl TarangContext {
    #[allow(clippy::cognitive_complexity)]
    fn get_matches<I, T>(args: I) -> Result<clap::ArgMatches, TarangError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        let app = command!()
            .arg_required_else_help(true)
            .next_line_help(false)
            .about(
                "Drive the flagging, calibration and self-calibration of \
                 uGMRT continuum visibility data.",
            )
            .args(&[
                // input options
                arg!(listing: <LISTING> "Observation listing JSON dumped from the measurement set")
                    .value_hint(FilePath)
                    .required(true)
                    .help_heading("INPUT"),
                arg!(--"phase-cal-list" <PATH> "File of known phase-calibrator names")
                    .value_hint(FilePath)
                    .required(false)
                    .default_value("vla-cals.list")
                    .help_heading("INPUT"),

                // run control
                arg!(-w --workdir <DIR> "Directory reduction products land in")
                    .required(false)
                    .default_value(".")
                    .help_heading("OUTPUT"),
                arg!(-s --"script-out" <PATH> "Path for the rendered script")
                    .value_hint(FilePath)
                    .required(false)
                    .help_heading("OUTPUT"),
                arg!(--checkpoint <PATH> "Path of the stage checkpoint file")
                    .value_hint(FilePath)
                    .required(false)
                    .help_heading("OUTPUT"),
                arg!(--resume "Skip the stages a previous run already completed"),
                arg!(--"dry-run" "Just print the summary and exit"),

                // stage toggles
                arg!(--"no-detect-antennas" "Do not sweep for dead antennas")
                    .help_heading("STAGES"),
                arg!(--"no-detect-channels" "Do not flag the persistent interference bands")
                    .help_heading("STAGES"),
                arg!(--"no-flag-init" "Do not flag the raw data")
                    .help_heading("STAGES"),
                arg!(--"no-init-cal" "Do not run the initial calibration pass")
                    .help_heading("STAGES"),
                arg!(--"no-postcal-flag" "Do not flag the corrected data")
                    .help_heading("STAGES"),
                arg!(--"no-recal" "Do not redo the calibration pass")
                    .help_heading("STAGES"),
                arg!(--"no-split" "Do not split the corrected target data")
                    .help_heading("STAGES"),
                arg!(--"no-split-flag" "Do not flag the split data")
                    .help_heading("STAGES"),
                arg!(--"no-average" "Do not average the split channels")
                    .help_heading("STAGES"),
                arg!(--"no-avg-flag" "Do not flag the averaged data")
                    .help_heading("STAGES"),
                arg!(--"no-selfcal" "Do not self-calibrate the targets")
                    .help_heading("STAGES"),

                // calibration options
                arg!(--refant <ANT> "Reference antenna name")
                    .required(false)
                    .help_heading("CALIBRATION"),
                arg!(--"amp-cutoff" <MEAN> "Raw mean amplitude below which an antenna is dead")
                    .required(false)
                    .help_heading("CALIBRATION"),
                arg!(--"uvrange-cal" <RANGE> "Baseline-length cutoff for the calibration solves")
                    .required(false)
                    .help_heading("CALIBRATION"),

                // flagging options
                arg!(--quack <SECONDS> "Seconds flagged at the start and end of every scan")
                    .required(false)
                    .help_heading("FLAGGING"),
                arg!(--"clip-flux-cal" "Amplitude clip range on flux calibrators")
                    .value_names(&["MIN", "MAX"])
                    .required(false)
                    .help_heading("FLAGGING"),
                arg!(--"clip-phase-cal" "Amplitude clip range on phase calibrators")
                    .value_names(&["MIN", "MAX"])
                    .required(false)
                    .help_heading("FLAGGING"),
                arg!(--"clip-target" "Amplitude clip range on targets")
                    .value_names(&["MIN", "MAX"])
                    .required(false)
                    .help_heading("FLAGGING"),
                arg!(--"clip-residual" "Amplitude clip range on self-cal residuals")
                    .value_names(&["MIN", "MAX"])
                    .required(false)
                    .help_heading("FLAGGING"),

                // averaging
                arg!(--"avg-width" <CHANNELS> "Channels averaged together after the target split")
                    .required(false)
                    .help_heading("AVERAGING"),

                // imaging and self-calibration
                arg!(--"selfcal-rounds" <N> "Self-calibration rounds")
                    .required(false)
                    .help_heading("SELF-CALIBRATION"),
                arg!(--"phase-only-rounds" <N> "Rounds solved phase-only before amplitude joins")
                    .required(false)
                    .help_heading("SELF-CALIBRATION"),
                arg!(--solint <SOLINT>... "Per-round solution intervals, e.g. 8.0min")
                    .multiple_values(true)
                    .required(false)
                    .help_heading("SELF-CALIBRATION"),
                arg!(--"uvrange-selfcal" <RANGE> "Baseline-length cutoff for the phase-only solves")
                    .required(false)
                    .help_heading("SELF-CALIBRATION"),
                arg!(--threshold <MJY> "Starting clean threshold in mJy")
                    .required(false)
                    .help_heading("IMAGING"),
                arg!(--cell <SIZE> "Image pixel size, e.g. 2.0arcsec")
                    .required(false)
                    .help_heading("IMAGING"),
                arg!(--imsize <PIXELS> "Image width and height in pixels")
                    .required(false)
                    .help_heading("IMAGING"),
                arg!(--nterms <N> "Taylor terms in the wide-band clean")
                    .required(false)
                    .help_heading("IMAGING"),
                arg!(--"wproj-planes" <N> "W-projection planes, -1 to auto-size")
                    .required(false)
                    .allow_hyphen_values(true)
                    .help_heading("IMAGING"),
                arg!(--"make-dirty" "Stop after a single dirty image")
                    .help_heading("IMAGING"),
            ]);
        let matches = app.try_get_matches_from(args)?;
        Ok(matches)
    }

    fn parse_config(matches: &clap::ArgMatches) -> Result<PipelineConfig, TarangError> {
        let mut config = PipelineConfig::default();

        config.toggles.detect_bad_antennas = !matches.is_present("no-detect-antennas");
        config.toggles.detect_bad_channels = !matches.is_present("no-detect-channels");
        config.toggles.initial_flagging = !matches.is_present("no-flag-init");
        config.toggles.initial_calibration = !matches.is_present("no-init-cal");
        config.toggles.post_cal_flagging = !matches.is_present("no-postcal-flag");
        config.toggles.recalibration = !matches.is_present("no-recal");
        config.toggles.split_targets = !matches.is_present("no-split");
        config.toggles.split_flagging = !matches.is_present("no-split-flag");
        config.toggles.average_channels = !matches.is_present("no-average");
        config.toggles.averaged_flagging = !matches.is_present("no-avg-flag");
        config.toggles.selfcal = !matches.is_present("no-selfcal");
        config.make_dirty_only = matches.is_present("make-dirty");

        if let Some(refant) = matches.value_of("refant") {
            config.refant = refant.to_string();
        }
        if let Some(cell) = matches.value_of("cell") {
            config.cell = cell.to_string();
        }
        if let Some(uvrange) = matches.value_of("uvrange-cal") {
            config.uvrange_cal = uvrange.to_string();
        }
        if let Some(uvrange) = matches.value_of("uvrange-selfcal") {
            config.uvrange_selfcal = uvrange.to_string();
        }
        if let Some(cutoff) = optional_value(matches, "amp-cutoff", "a mean amplitude")? {
            config.mean_amp_cutoff = cutoff;
        }
        if let Some(quack) = optional_value(matches, "quack", "an interval in seconds")? {
            config.quack_interval_s = quack;
        }
        if let Some(width) = optional_value(matches, "avg-width", "a channel count")? {
            config.average_width = width;
        }
        if let Some(rounds) = optional_value(matches, "selfcal-rounds", "a round count")? {
            config.selfcal_rounds = rounds;
        }
        if let Some(rounds) = optional_value(matches, "phase-only-rounds", "a round count")? {
            config.phase_only_rounds = rounds;
        }
        if let Some(threshold) = optional_value(matches, "threshold", "a flux in mJy")? {
            config.threshold_mjy = threshold;
        }
        if let Some(imsize) = optional_value(matches, "imsize", "a pixel count")? {
            config.imsize = imsize;
        }
        if let Some(nterms) = optional_value(matches, "nterms", "a term count")? {
            config.nterms = nterms;
        }
        if let Some(planes) = optional_value(matches, "wproj-planes", "a plane count")? {
            config.wproj_planes = planes;
        }
        if let Some(solints) = matches.values_of("solint") {
            config.solints = solints.map(str::to_string).collect();
        }
        if let Some(range) = optional_range(matches, "clip-flux-cal")? {
            config.clip_flux_cal = range;
        }
        if let Some(range) = optional_range(matches, "clip-phase-cal")? {
            config.clip_phase_cal = range;
        }
        if let Some(range) = optional_range(matches, "clip-target")? {
            config.clip_target = range;
        }
        if let Some(range) = optional_range(matches, "clip-residual")? {
            config.clip_residual = range;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse an argument list into a validated context.
    ///
    /// # Errors
    ///
    /// A [`TarangError`] when the arguments, the listing or the reference
    /// list are unusable, or [`TarangError::DryRun`] after printing the
    /// summary of a `--dry-run` invocation.
    pub fn from_args<I, T>(args: I) -> Result<Self, TarangError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        debug!("args:\n{:?}", &args);
        let matches = Self::get_matches(args)?;
        trace!("arg matches:\n{:?}", &matches);

        let listing_path = match matches.value_of("listing") {
            Some(path) => PathBuf::from(path),
            None => unreachable!("<LISTING> is required, enforced by clap"),
        };
        let listing = ObsListing::load(&listing_path)?;

        let catalogue_path = match matches.value_of("phase-cal-list") {
            Some(path) => PathBuf::from(path),
            None => unreachable!("--phase-cal-list has a default, enforced by clap"),
        };
        let catalogue = load_phase_cal_list(&catalogue_path)?;

        let config = Self::parse_config(&matches)?;

        let workdir = match matches.value_of("workdir") {
            Some(dir) => PathBuf::from(dir),
            None => unreachable!("--workdir has a default, enforced by clap"),
        };
        let script_out = matches
            .value_of("script-out")
            .map(PathBuf::from)
            .unwrap_or_else(|| workdir.join("tarang-reduce.py"));
        let checkpoint_path = matches
            .value_of("checkpoint")
            .map(PathBuf::from)
            .unwrap_or_else(|| workdir.join("tarang.checkpoint.json"));

        let ctx = Self {
            listing,
            config,
            catalogue,
            workdir,
            script_out,
            checkpoint_path,
            resume: matches.is_present("resume"),
        };

        info!("{}", &ctx);

        if matches.is_present("dry-run") {
            return Err(DryRun {});
        }

        Ok(ctx)
    }

    /// Run every enabled stage, rendering the engine calls into the script
    /// file and recording completed stages in the checkpoint.
    ///
    /// # Errors
    ///
    /// A [`TarangError`] from the first stage that fails; the checkpoint
    /// keeps everything completed before it.
    pub fn run(self) -> Result<(), TarangError> {
        let vis = PathBuf::from(&self.listing.vis);
        let run_antenna_detection = self.listing.has_amplitude_stats();
        if !run_antenna_detection && self.config.toggles.detect_bad_antennas {
            warn!("the listing carries no amplitude statistics, skipping the antenna sweep");
        }
        let ctx = crate::with_increment_duration!(
            "assemble",
            PipelineContext::assemble(
                &self.listing,
                &self.config,
                &self.catalogue,
                vis,
                run_antenna_detection,
            )
        )?;

        let mut checkpoint = Checkpoint::load(&self.checkpoint_path)?;
        if !self.resume {
            checkpoint.reset()?;
        }

        let mut engine = ScriptEngine::new();
        let mut registry = ArtifactRegistry::new(&self.workdir);
        let toggles = &self.config.toggles;

        let skip = |stage: Stage, enabled: bool, checkpoint: &Checkpoint| {
            if !enabled {
                info!("{stage} is disabled, skipping");
                return true;
            }
            if checkpoint.is_complete(stage) {
                info!("{stage} already completed, skipping");
                return true;
            }
            false
        };

        if !skip(Stage::InitialFlagging, toggles.initial_flagging, &checkpoint) {
            engine.comment("pre-calibration flagging");
            crate::with_increment_duration!(
                "flag",
                flagging::initial_flagging(&mut engine, &ctx, &self.config)
            )?;
            checkpoint.record(Stage::InitialFlagging)?;
        }

        if !skip(
            Stage::InitialCalibration,
            toggles.initial_calibration,
            &checkpoint,
        ) {
            engine.comment("initial calibration pass");
            crate::with_increment_duration!(
                "calibrate",
                CalibrationPass::initial(&ctx, &self.config).run(&mut engine)
            )?;
            checkpoint.record(Stage::InitialCalibration)?;
        }

        if !skip(Stage::PostCalFlagging, toggles.post_cal_flagging, &checkpoint) {
            engine.comment("post-calibration flagging");
            crate::with_increment_duration!(
                "flag",
                flagging::post_calibration_flagging(&mut engine, &ctx, &self.config)
            )?;
            checkpoint.record(Stage::PostCalFlagging)?;
        }

        if !skip(Stage::Recalibration, toggles.recalibration, &checkpoint) {
            engine.comment("redone calibration pass");
            crate::with_increment_duration!(
                "calibrate",
                CalibrationPass::redo(&ctx, &self.config).run(&mut engine)
            )?;
            checkpoint.record(Stage::Recalibration)?;
        }

        // Product names are derived up front so a resumed run addresses the
        // same files an uninterrupted one would have produced.
        let products: Vec<(String, PathBuf, PathBuf)> = ctx
            .fields
            .targets
            .iter()
            .map(|field| {
                let split = registry.split_vis(field);
                let averaged = registry.averaged_vis(&split);
                (field.clone(), split, averaged)
            })
            .collect();
        if products.is_empty() {
            warn!("no target fields, the reduction ends at calibration");
        }

        if !skip(Stage::SplitTargets, toggles.split_targets, &checkpoint) {
            engine.comment("splitting the corrected target data");
            for (field, split, _) in &products {
                crate::with_increment_duration!(
                    "split",
                    engine.split(&SplitRequest {
                        vis: ctx.vis.clone(),
                        out: split.clone(),
                        field: field.clone(),
                        spw: ctx.windows.gain.clone(),
                        column: DataColumn::Corrected,
                        chan_bin: 1,
                    })
                )?;
            }
            checkpoint.record(Stage::SplitTargets)?;
        }

        if !skip(Stage::SplitFlagging, toggles.split_flagging, &checkpoint) {
            engine.comment("flagging the split data");
            for (_, split, _) in &products {
                crate::with_increment_duration!(
                    "flag",
                    flagging::split_flagging(&mut engine, split, &ctx.topology)
                )?;
            }
            checkpoint.record(Stage::SplitFlagging)?;
        }

        if !skip(Stage::AverageChannels, toggles.average_channels, &checkpoint) {
            engine.comment("channel averaging");
            for (_, split, averaged) in &products {
                crate::with_increment_duration!(
                    "split",
                    engine.split(&SplitRequest {
                        vis: split.clone(),
                        out: averaged.clone(),
                        field: "0".to_string(),
                        spw: "0".to_string(),
                        column: DataColumn::Data,
                        chan_bin: self.config.average_width,
                    })
                )?;
            }
            checkpoint.record(Stage::AverageChannels)?;
        }

        if !skip(
            Stage::AveragedFlagging,
            toggles.averaged_flagging,
            &checkpoint,
        ) {
            engine.comment("flagging the averaged data");
            for (_, _, averaged) in &products {
                crate::with_increment_duration!(
                    "flag",
                    flagging::averaged_flagging(&mut engine, averaged, &ctx.topology)
                )?;
            }
            checkpoint.record(Stage::AveragedFlagging)?;
        }

        if !skip(Stage::SelfCal, toggles.selfcal, &checkpoint) {
            if let Some((field, _, averaged)) = products.last() {
                if products.len() > 1 {
                    warn!(
                        "{} target fields observed, self-calibrating only {field}",
                        products.len()
                    );
                }
                engine.comment(&format!("self-calibration of {field}"));
                engine.reset_calibration(averaged)?;
                let looper = SelfCalLoop::new(&self.config, ctx.refant.as_str());
                let rounds = crate::with_increment_duration!(
                    "selfcal",
                    looper.run(&mut engine, &mut registry, averaged)
                )?;
                info!("self-calibration produced {} images", rounds.len());
            }
            checkpoint.record(Stage::SelfCal)?;
        }

        let rendered = engine.render();
        std::fs::write(&self.script_out, rendered).map_err(|source| {
            TarangError::ScriptWrite {
                path: self.script_out.clone(),
                source,
            }
        })?;
        info!(
            "wrote {} script lines to {}",
            engine.len(),
            self.script_out.display()
        );
        Ok(())
    }
}
