//! The batched flagging passes of a reduction.
//!
//! Four passes run at fixed points: before calibration on raw data, after
//! calibration on the corrected column, on the per-target split, and on
//! the channel-averaged split. Thresholds differ by field role and, on
//! target data, by baseline class: the short central-square baselines see
//! far more interference than the arms and are cropped harder.

use std::path::Path;

use log::info;

use crate::baselines::{BaselineClass, BaselineTopology};
use crate::config::PipelineConfig;
use crate::context::PipelineContext;
use crate::engine::{
    ClipScan, DataColumn, EngineError, ExtendFlags, FlagCommand, FlagSummary, FlaggingEngine,
    OutlierMode, OutlierScan, QuackMode,
};

fn tfcrop(time_cutoff: f64, freq_cutoff: f64, time_fit: &str, freq_fit: &str) -> OutlierMode {
    OutlierMode::TfCrop {
        time_cutoff,
        freq_cutoff,
        time_fit: time_fit.to_string(),
        freq_fit: freq_fit.to_string(),
    }
}

fn rflag(time_dev_scale: f64, freq_dev_scale: f64) -> OutlierMode {
    OutlierMode::RFlag {
        time_dev_scale,
        freq_dev_scale,
    }
}

fn log_summary(label: &str, summary: &FlagSummary) {
    if summary.field_fractions.is_empty() {
        info!("flag summary after {label}: deferred by the engine");
        return;
    }
    for (field, fraction) in &summary.field_fractions {
        info!(
            "flag summary after {label}: {field} {:.2}% flagged",
            fraction * 100.0
        );
    }
}

/// Pre-calibration flagging on raw data: the manual flags from detection,
/// quack intervals, amplitude clips and a first statistical pass.
///
/// # Errors
///
/// An [`EngineError`] from the first pass that fails.
pub fn initial_flagging<E: FlaggingEngine>(
    engine: &mut E,
    ctx: &PipelineContext,
    config: &PipelineConfig,
) -> Result<FlagSummary, EngineError> {
    let vis = &ctx.vis;
    let spw = &ctx.windows.flag;

    // The first channel carries no valid data in any correlator mode.
    let mut manual = vec![FlagCommand::Channels {
        selector: "0:0".to_string(),
    }];
    if let Some(channel_flag) = &ctx.channel_flag {
        manual.push(channel_flag.clone());
    }
    manual.extend(ctx.antenna_flags.iter().cloned());
    engine.apply_manual_flags(vis, &manual)?;

    engine.quack(vis, config.quack_interval_s, QuackMode::Beginning)?;
    engine.quack(vis, config.quack_interval_s, QuackMode::End)?;

    let amp_sel = ctx.amp_cal_selection();
    if !amp_sel.is_empty() {
        engine.clip(&ClipScan {
            vis: vis.clone(),
            field: amp_sel,
            spw: spw.clone(),
            column: DataColumn::Data,
            range: config.clip_flux_cal,
        })?;
    }

    let phase_sel = ctx.phase_cal_selection();
    if !phase_sel.is_empty() {
        engine.clip(&ClipScan {
            vis: vis.clone(),
            field: phase_sel.clone(),
            spw: spw.clone(),
            column: DataColumn::Data,
            range: config.clip_phase_cal,
        })?;
        engine.detect_outliers(&OutlierScan {
            vis: vis.clone(),
            field: phase_sel.clone(),
            spw: spw.clone(),
            mode: tfcrop(5.0, 5.0, "line", "line"),
            ntime: "scan".to_string(),
            ..OutlierScan::default()
        })?;
        engine.extend(&ExtendFlags {
            vis: vis.clone(),
            field: phase_sel,
            spw: spw.clone(),
            column: DataColumn::Data,
            grow_time: 80.0,
            grow_freq: 80.0,
            extend_pols: true,
        })?;
    }

    let targets = ctx.target_selection();
    if !targets.is_empty() {
        engine.clip(&ClipScan {
            vis: vis.clone(),
            field: targets.clone(),
            spw: spw.clone(),
            column: DataColumn::Data,
            range: config.clip_target,
        })?;
        engine.detect_outliers(&OutlierScan {
            vis: vis.clone(),
            field: targets.clone(),
            spw: spw.clone(),
            mode: tfcrop(6.0, 6.0, "poly", "poly"),
            ntime: "scan".to_string(),
            ..OutlierScan::default()
        })?;
        engine.extend(&ExtendFlags {
            vis: vis.clone(),
            field: targets,
            spw: spw.clone(),
            column: DataColumn::Data,
            grow_time: 80.0,
            grow_freq: 80.0,
            extend_pols: true,
        })?;
    }

    let summary = engine.summarize(vis, DataColumn::Data)?;
    log_summary("initial flagging", &summary);
    Ok(summary)
}

/// Post-calibration flagging on the corrected column, where calibration
/// errors and weaker interference become visible. Target passes run per
/// baseline class.
///
/// # Errors
///
/// An [`EngineError`] from the first pass that fails.
pub fn post_calibration_flagging<E: FlaggingEngine>(
    engine: &mut E,
    ctx: &PipelineContext,
    config: &PipelineConfig,
) -> Result<FlagSummary, EngineError> {
    let vis = &ctx.vis;
    let spw = &ctx.windows.flag;

    let amp_sel = ctx.amp_cal_selection();
    if !amp_sel.is_empty() {
        engine.clip(&ClipScan {
            vis: vis.clone(),
            field: amp_sel,
            spw: spw.clone(),
            column: DataColumn::Corrected,
            range: config.clip_flux_cal,
        })?;
    }

    let phase_sel = ctx.phase_cal_selection();
    if !phase_sel.is_empty() {
        engine.clip(&ClipScan {
            vis: vis.clone(),
            field: phase_sel.clone(),
            spw: spw.clone(),
            column: DataColumn::Corrected,
            range: config.clip_phase_cal,
        })?;
        engine.detect_outliers(&OutlierScan {
            vis: vis.clone(),
            field: phase_sel.clone(),
            spw: spw.clone(),
            column: DataColumn::Corrected,
            mode: tfcrop(6.0, 5.0, "line", "line"),
            ntime: "scan".to_string(),
            ..OutlierScan::default()
        })?;
        engine.detect_outliers(&OutlierScan {
            vis: vis.clone(),
            field: phase_sel.clone(),
            spw: spw.clone(),
            column: DataColumn::Corrected,
            mode: rflag(4.0, 4.0),
            ntime: "scan".to_string(),
            spectral_max: Some(500.0),
            ..OutlierScan::default()
        })?;
        engine.extend(&ExtendFlags {
            vis: vis.clone(),
            field: phase_sel,
            spw: spw.clone(),
            column: DataColumn::Corrected,
            grow_time: 90.0,
            grow_freq: 90.0,
            extend_pols: false,
        })?;
    }

    let targets = ctx.target_selection();
    if !targets.is_empty() {
        engine.clip(&ClipScan {
            vis: vis.clone(),
            field: targets.clone(),
            spw: spw.clone(),
            column: DataColumn::Corrected,
            range: config.clip_target,
        })?;
        let compact = ctx.topology.selection(BaselineClass::Compact);
        let extended = ctx.topology.selection(BaselineClass::Extended);
        for (antenna, mode) in [
            (&compact, tfcrop(8.0, 8.0, "poly", "line")),
            (&extended, tfcrop(6.0, 5.0, "poly", "line")),
            (&compact, rflag(8.0, 5.0)),
            (&extended, rflag(5.0, 5.0)),
        ] {
            if antenna.is_empty() {
                continue;
            }
            engine.detect_outliers(&OutlierScan {
                vis: vis.clone(),
                field: targets.clone(),
                antenna: Some(antenna.clone()),
                spw: spw.clone(),
                column: DataColumn::Corrected,
                mode,
                ntime: "scan".to_string(),
                spectral_max: Some(500.0),
                ..OutlierScan::default()
            })?;
        }
    }

    let summary = engine.summarize(vis, DataColumn::Corrected)?;
    log_summary("post-calibration flagging", &summary);
    Ok(summary)
}

/// Flagging on a freshly split single-target file: one broad crop over all
/// baselines, then per-class sliding-window rejection.
///
/// # Errors
///
/// An [`EngineError`] from the first pass that fails.
pub fn split_flagging<E: FlaggingEngine>(
    engine: &mut E,
    vis: &Path,
    topology: &BaselineTopology,
) -> Result<FlagSummary, EngineError> {
    engine.detect_outliers(&OutlierScan {
        vis: vis.to_path_buf(),
        mode: tfcrop(8.0, 8.0, "line", "line"),
        ntime: "300s".to_string(),
        ..OutlierScan::default()
    })?;
    for (class, mode) in [
        (BaselineClass::Compact, rflag(6.0, 6.0)),
        (BaselineClass::Extended, rflag(5.0, 5.0)),
    ] {
        let antenna = topology.selection(class);
        if antenna.is_empty() {
            continue;
        }
        engine.detect_outliers(&OutlierScan {
            vis: vis.to_path_buf(),
            antenna: Some(antenna),
            mode,
            ntime: "scan".to_string(),
            spectral_max: Some(1e6),
            ..OutlierScan::default()
        })?;
    }
    let summary = engine.summarize(vis, DataColumn::Data)?;
    log_summary("split flagging", &summary);
    Ok(summary)
}

/// Flagging on the channel-averaged file. Averaging concentrates faint
/// broadband interference, so the windows span scans and flag the
/// neighbouring integrations too.
///
/// # Errors
///
/// An [`EngineError`] from the first pass that fails.
pub fn averaged_flagging<E: FlaggingEngine>(
    engine: &mut E,
    vis: &Path,
    topology: &BaselineTopology,
) -> Result<FlagSummary, EngineError> {
    for class in [BaselineClass::Extended, BaselineClass::Compact] {
        let antenna = topology.selection(class);
        if antenna.is_empty() {
            continue;
        }
        engine.detect_outliers(&OutlierScan {
            vis: vis.to_path_buf(),
            antenna: Some(antenna),
            mode: rflag(6.0, 6.0),
            ntime: "300s".to_string(),
            combine_scans: true,
            spectral_max: Some(1e6),
            min_chan_frac: Some(0.8),
            flag_near_time: true,
            ..OutlierScan::default()
        })?;
    }
    let summary = engine.summarize(vis, DataColumn::Data)?;
    log_summary("averaged flagging", &summary);
    Ok(summary)
}
