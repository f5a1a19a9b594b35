//! An engine that renders every operation as a line of a CASA-compatible
//! Python script instead of executing it.
//!
//! The pipeline drives a [`ScriptEngine`] exactly as it would drive a live
//! engine; the result is a reduction script that can be replayed under
//! `casa -c`. Metadata queries are not part of this engine, planning reads
//! them from an [`crate::ObsListing`] dump instead.

use std::path::Path;

use super::{
    ApplyCal, BandpassSolve, CalibrationEngine, CleanRequest, ClipScan, DataColumn,
    EngineError, ExtendFlags, FlagCommand, FlagSummary, FlaggingEngine, FluxScale, GainSolve,
    ImagingEngine, OutlierMode, OutlierScan, QuackMode, SplitRequest, TransformEngine,
};

/// Trailing arguments shared by every flagdata invocation that writes flags.
const FLAGDATA_TAIL: &str = "action='apply', flagbackup=True, overwrite=True, writeflags=True";

/// Accumulates CASA task invocations as script lines.
#[derive(Debug, Clone)]
pub struct ScriptEngine {
    lines: Vec<String>,
}

impl ScriptEngine {
    /// An empty script with the standard preamble.
    pub fn new() -> Self {
        Self {
            lines: vec![
                concat!("# CASA reduction script generated by tarang ", env!("CARGO_PKG_VERSION"))
                    .to_string(),
                "import os".to_string(),
            ],
        }
    }

    /// Append a comment line, used to label pipeline stages in the output.
    pub fn comment(&mut self, text: &str) {
        self.lines.push(String::new());
        self.lines.push(format!("# {text}"));
    }

    /// The rendered script.
    pub fn render(&self) -> String {
        let mut script = self.lines.join("\n");
        script.push('\n');
        script
    }

    /// Number of task invocations and comments recorded so far.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether anything beyond the preamble has been recorded.
    pub fn is_empty(&self) -> bool {
        self.lines.len() <= 2
    }

    fn push(&mut self, line: String) {
        self.lines.push(line);
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn py_str(s: &str) -> String {
    format!("'{s}'")
}

fn py_path(p: &Path) -> String {
    format!("'{}'", p.display())
}

fn py_bool(b: bool) -> &'static str {
    if b {
        "True"
    } else {
        "False"
    }
}

// Debug formatting keeps the decimal point, so whole numbers stay floats
// on the Python side.
fn py_float(f: f64) -> String {
    format!("{f:?}")
}

fn py_str_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| py_str(s)).collect();
    format!("[{}]", quoted.join(", "))
}

fn py_path_list(items: &[std::path::PathBuf]) -> String {
    let quoted: Vec<String> = items.iter().map(|p| py_path(p)).collect();
    format!("[{}]", quoted.join(", "))
}

fn py_int_list(items: &[u32]) -> String {
    let rendered: Vec<String> = items.iter().map(|i| i.to_string()).collect();
    format!("[{}]", rendered.join(", "))
}

impl CalibrationEngine for ScriptEngine {
    fn reset_calibration(&mut self, vis: &Path) -> Result<(), EngineError> {
        self.push(format!("clearcal(vis={})", py_path(vis)));
        Ok(())
    }

    fn set_flux_model(
        &mut self,
        vis: &Path,
        field: &str,
        spw: &str,
        standard: &str,
    ) -> Result<(), EngineError> {
        self.push(format!(
            "setjy(vis={}, field={}, spw={}, scalebychan=True, standard={})",
            py_path(vis),
            py_str(field),
            py_str(spw),
            py_str(standard)
        ));
        Ok(())
    }

    fn discard_table(&mut self, table: &Path) -> Result<(), EngineError> {
        self.push(format!("os.system('rm -rf {}')", table.display()));
        Ok(())
    }

    fn solve_gains(&mut self, req: &GainSolve) -> Result<(), EngineError> {
        self.push(format!(
            "gaincal(vis={}, caltable={}, field={}, spw={}, uvrange={}, solint={}, refant={}, \
             minsnr={}, solnorm={}, gaintype={}, calmode={}, append={}, gaintable={}, interp={}, \
             parang=True)",
            py_path(&req.vis),
            py_path(&req.table),
            py_str(&req.field),
            py_str(&req.spw),
            py_str(&req.uvrange),
            py_str(&req.solint),
            py_str(&req.refant),
            py_float(req.min_snr),
            py_bool(req.solnorm),
            py_str(req.gain_type.code()),
            py_str(req.mode.code()),
            py_bool(req.append),
            py_path_list(&req.chain),
            py_str_list(&req.interp)
        ));
        Ok(())
    }

    fn solve_bandpass(&mut self, req: &BandpassSolve) -> Result<(), EngineError> {
        self.push(format!(
            "bandpass(vis={}, caltable={}, field={}, spw={}, solint={}, refant={}, minsnr={}, \
             solnorm={}, fillgaps={}, gaintable={}, interp={}, parang=True)",
            py_path(&req.vis),
            py_path(&req.table),
            py_str(&req.field),
            py_str(&req.spw),
            py_str(&req.solint),
            py_str(&req.refant),
            py_float(req.min_snr),
            py_bool(req.solnorm),
            req.fill_gaps,
            py_path_list(&req.chain),
            py_str_list(&req.interp)
        ));
        Ok(())
    }

    fn solve_flux_scale(&mut self, req: &FluxScale) -> Result<(), EngineError> {
        self.push(format!(
            "fluxscale(vis={}, caltable={}, fluxtable={}, reference={}, transfer={}, \
             incremental=False)",
            py_path(&req.vis),
            py_path(&req.caltable),
            py_path(&req.fluxtable),
            py_str(&req.reference),
            py_str(&req.transfer.join(", "))
        ));
        Ok(())
    }

    fn apply(&mut self, req: &ApplyCal) -> Result<(), EngineError> {
        let applymode = if req.applymode.is_empty() {
            String::new()
        } else {
            format!(" applymode={},", py_str(&req.applymode))
        };
        self.push(format!(
            "applycal(vis={}, field={}, spw={}, gaintable={}, gainfield={}, interp={},{} \
             calwt={}, parang={})",
            py_path(&req.vis),
            py_str(&req.field),
            py_str(&req.spw),
            py_path_list(&req.gaintables),
            py_str_list(&req.gainfield),
            py_str_list(&req.interp),
            applymode,
            py_bool(req.calwt),
            py_bool(req.parang)
        ));
        Ok(())
    }
}

impl ImagingEngine for ScriptEngine {
    fn clean(&mut self, req: &CleanRequest) -> Result<(), EngineError> {
        let deconvolver = if req.nterms > 1 { "mtmfs" } else { "multiscale" };
        let savemodel = if req.save_model { "modelcolumn" } else { "none" };
        self.push(format!(
            "tclean(vis={}, imagename={}, selectdata=True, field={}, spw={}, imsize={}, \
             cell={}, robust=0, weighting='briggs', specmode='mfs', nterms={}, niter={}, \
             usemask='auto-multithresh', minbeamfrac=0.1, smallscalebias=0.6, threshold={}, \
             aterm=True, pblimit=-1, deconvolver={}, gridder='wproject', wprojplanes={}, \
             scales={}, wbawp=False, restoration=True, savemodel={}, cyclefactor=0.5, \
             parallel=False, interactive=False)",
            py_path(&req.vis),
            py_str(&req.image_name),
            py_str(&req.field),
            py_str(&req.spw),
            req.imsize,
            py_str(&req.cell),
            req.nterms,
            req.niter,
            py_str(&format!("{}mJy", py_float(req.threshold_mjy))),
            py_str(deconvolver),
            req.wproj_planes,
            py_int_list(&req.scales),
            py_str(savemodel)
        ));
        Ok(())
    }

    fn export_fits(&mut self, image: &Path, fits: &Path) -> Result<(), EngineError> {
        self.push(format!(
            "exportfits(imagename={}, fitsimage={})",
            py_path(image),
            py_path(fits)
        ));
        Ok(())
    }
}

impl FlaggingEngine for ScriptEngine {
    fn apply_manual_flags(
        &mut self,
        vis: &Path,
        commands: &[FlagCommand],
    ) -> Result<(), EngineError> {
        // Commands contain single quotes, so the list entries are
        // double-quoted.
        let quoted: Vec<String> = commands.iter().map(|c| format!("\"{c}\"")).collect();
        self.push(format!(
            "flagdata(vis={}, mode='list', inpfile=[{}], action='apply')",
            py_path(vis),
            quoted.join(", ")
        ));
        Ok(())
    }

    fn quack(&mut self, vis: &Path, interval_s: f64, mode: QuackMode) -> Result<(), EngineError> {
        self.push(format!(
            "flagdata(vis={}, mode='quack', quackinterval={}, quackmode={}, action='apply', \
             savepars=True)",
            py_path(vis),
            py_float(interval_s),
            py_str(mode.code())
        ));
        Ok(())
    }

    fn clip(&mut self, req: &ClipScan) -> Result<(), EngineError> {
        self.push(format!(
            "flagdata(vis={}, mode='clip', field={}, spw={}, clipminmax=[{}, {}], \
             datacolumn={}, clipoutside=True, clipzeros=True, extendpols=False, {})",
            py_path(&req.vis),
            py_str(&req.field),
            py_str(&req.spw),
            py_float(req.range.0),
            py_float(req.range.1),
            py_str(req.column.casa_name()),
            FLAGDATA_TAIL
        ));
        Ok(())
    }

    fn detect_outliers(&mut self, req: &OutlierScan) -> Result<(), EngineError> {
        let antenna = match &req.antenna {
            Some(sel) => format!(" antenna={},", py_str(sel)),
            None => String::new(),
        };
        match &req.mode {
            OutlierMode::TfCrop {
                time_cutoff,
                freq_cutoff,
                time_fit,
                freq_fit,
            } => {
                self.push(format!(
                    "flagdata(vis={}, mode='tfcrop', field={}, spw={},{} datacolumn={}, \
                     ntime={}, combinescans={}, timecutoff={}, freqcutoff={}, timefit={}, \
                     freqfit={}, flagdimension='freqtime', usewindowstats='sum', \
                     extendflags=False, {})",
                    py_path(&req.vis),
                    py_str(&req.field),
                    py_str(&req.spw),
                    antenna,
                    py_str(req.column.casa_name()),
                    py_str(&req.ntime),
                    py_bool(req.combine_scans),
                    py_float(*time_cutoff),
                    py_float(*freq_cutoff),
                    py_str(time_fit),
                    py_str(freq_fit),
                    FLAGDATA_TAIL
                ));
            }
            OutlierMode::RFlag {
                time_dev_scale,
                freq_dev_scale,
            } => {
                let mut extras = String::new();
                if let Some(frac) = req.min_chan_frac {
                    extras.push_str(&format!(" minchanfrac={},", py_float(frac)));
                }
                if req.flag_near_time {
                    extras.push_str(" flagneartime=True,");
                }
                if req.combine_scans {
                    extras.push_str(" basecnt=True, fieldcnt=True,");
                }
                if let Some(max) = req.spectral_max {
                    extras.push_str(&format!(" spectralmax={},", py_float(max)));
                }
                self.push(format!(
                    "flagdata(vis={}, mode='rflag', field={}, spw={},{} datacolumn={}, \
                     ntime={}, combinescans={}, winsize=3,{} timedevscale={}, freqdevscale={}, \
                     extendflags=False, {})",
                    py_path(&req.vis),
                    py_str(&req.field),
                    py_str(&req.spw),
                    antenna,
                    py_str(req.column.casa_name()),
                    py_str(&req.ntime),
                    py_bool(req.combine_scans),
                    extras,
                    py_float(*time_dev_scale),
                    py_float(*freq_dev_scale),
                    FLAGDATA_TAIL
                ));
            }
        }
        Ok(())
    }

    fn extend(&mut self, req: &ExtendFlags) -> Result<(), EngineError> {
        self.push(format!(
            "flagdata(vis={}, mode='extend', field={}, spw={}, datacolumn={}, clipzeros=True, \
             ntime='scan', extendflags=False, extendpols={}, growtime={}, growfreq={}, \
             growaround=False, flagneartime=False, flagnearfreq=False, {})",
            py_path(&req.vis),
            py_str(&req.field),
            py_str(&req.spw),
            py_str(req.column.casa_name()),
            py_bool(req.extend_pols),
            py_float(req.grow_time),
            py_float(req.grow_freq),
            FLAGDATA_TAIL
        ));
        Ok(())
    }

    fn summarize(&mut self, vis: &Path, column: DataColumn) -> Result<FlagSummary, EngineError> {
        self.push(format!(
            "flagsummary = flagdata(vis={}, mode='summary', datacolumn={})",
            py_path(vis),
            py_str(column.casa_name())
        ));
        // The statistics only exist when the script runs.
        Ok(FlagSummary::default())
    }
}

impl TransformEngine for ScriptEngine {
    fn split(&mut self, req: &SplitRequest) -> Result<(), EngineError> {
        self.push(format!(
            "mstransform(vis={}, field={}, spw={}, chanaverage={}, chanbin={}, datacolumn={}, \
             outputvis={})",
            py_path(&req.vis),
            py_str(&req.field),
            py_str(&req.spw),
            py_bool(req.averages()),
            req.chan_bin,
            py_str(req.column.casa_name()),
            py_path(&req.out)
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CalMode, GainType};

    #[test]
    fn preamble_imports_os() {
        let engine = ScriptEngine::new();
        assert!(engine.render().contains("import os"));
        assert!(engine.is_empty());
    }

    #[test]
    fn renders_delay_solve() {
        let mut engine = ScriptEngine::new();
        let req = GainSolve {
            vis: "obs.ms".into(),
            table: "obs.ms.K1".into(),
            field: "3C286".to_string(),
            spw: "0:201~1800".to_string(),
            uvrange: String::new(),
            solint: "60s".to_string(),
            refant: "C00".to_string(),
            min_snr: 2.0,
            gain_type: GainType::Delay,
            mode: CalMode::PhaseAmplitude,
            solnorm: true,
            append: false,
            chain: vec![],
            interp: vec![],
        };
        engine.solve_gains(&req).unwrap();
        let script = engine.render();
        assert!(script.contains(
            "gaincal(vis='obs.ms', caltable='obs.ms.K1', field='3C286', spw='0:201~1800', \
             uvrange='', solint='60s', refant='C00', minsnr=2.0, solnorm=True, gaintype='K', \
             calmode='ap', append=False, gaintable=[], interp=[], parang=True)"
        ));
    }

    #[test]
    fn renders_manual_flag_batch() {
        let mut engine = ScriptEngine::new();
        let commands = vec![
            FlagCommand::Antennas {
                antennas: vec!["C00".to_string(), "W06".to_string()],
                scan: 3,
            },
            FlagCommand::Channels {
                selector: "0:101".to_string(),
            },
        ];
        engine
            .apply_manual_flags(Path::new("obs.ms"), &commands)
            .unwrap();
        assert!(engine.render().contains(
            "flagdata(vis='obs.ms', mode='list', \
             inpfile=[\"mode='manual' antenna='C00; W06' scan='3'\", \
             \"mode='manual' spw='0:101'\"], action='apply')"
        ));
    }

    #[test]
    fn renders_windowed_rflag() {
        let mut engine = ScriptEngine::new();
        let req = OutlierScan {
            vis: "avg.ms".into(),
            field: "DEEP2".to_string(),
            antenna: Some("C00&C01".to_string()),
            spw: "0".to_string(),
            column: DataColumn::Data,
            mode: OutlierMode::RFlag {
                time_dev_scale: 6.0,
                freq_dev_scale: 6.0,
            },
            ntime: "300s".to_string(),
            combine_scans: true,
            spectral_max: Some(1e6),
            min_chan_frac: Some(0.8),
            flag_near_time: true,
        };
        engine.detect_outliers(&req).unwrap();
        let script = engine.render();
        assert!(script.contains("mode='rflag'"));
        assert!(script.contains("antenna='C00&C01'"));
        assert!(script.contains("minchanfrac=0.8, flagneartime=True, basecnt=True, fieldcnt=True"));
        assert!(script.contains("spectralmax=1000000.0"));
        assert!(script.contains("timedevscale=6.0, freqdevscale=6.0"));
    }

    #[test]
    fn clean_switches_deconvolver_on_nterms() {
        let mut engine = ScriptEngine::new();
        let mut req = CleanRequest {
            vis: "avg.ms".into(),
            image_name: "selfcalimg0".to_string(),
            field: "0".to_string(),
            spw: "0".to_string(),
            niter: 1500,
            threshold_mjy: 0.1,
            cell: "2.0arcsec".to_string(),
            imsize: 5000,
            nterms: 2,
            wproj_planes: -1,
            scales: vec![0, 5, 15],
            save_model: true,
        };
        engine.clean(&req).unwrap();
        assert!(engine.render().contains("deconvolver='mtmfs'"));
        assert!(engine.render().contains("threshold='0.1mJy'"));

        req.nterms = 1;
        let mut engine = ScriptEngine::new();
        engine.clean(&req).unwrap();
        assert!(engine.render().contains("deconvolver='multiscale'"));
    }

    #[test]
    fn renders_averaging_split() {
        let mut engine = ScriptEngine::new();
        let req = SplitRequest {
            vis: "DEEP2split.ms".into(),
            out: "DEEP2avg-split.ms".into(),
            field: "0".to_string(),
            spw: "0".to_string(),
            column: DataColumn::Data,
            chan_bin: 10,
        };
        engine.split(&req).unwrap();
        assert!(engine.render().contains(
            "mstransform(vis='DEEP2split.ms', field='0', spw='0', chanaverage=True, \
             chanbin=10, datacolumn='data', outputvis='DEEP2avg-split.ms')"
        ));
    }

    #[test]
    fn comments_label_stages() {
        let mut engine = ScriptEngine::new();
        engine.comment("initial calibration");
        engine.reset_calibration(Path::new("obs.ms")).unwrap();
        let script = engine.render();
        assert!(script.contains("\n# initial calibration\nclearcal(vis='obs.ms')\n"));
        assert!(!engine.is_empty());
    }
}
