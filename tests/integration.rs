//! End-to-end runs through the public API: a listing fixture goes in, a
//! rendered script and a checkpoint come out.

#![cfg(feature = "cli")]

use std::path::{Path, PathBuf};

use tempfile::{tempdir, TempDir};

use tarang::{
    cli::TarangContext,
    listing::{AmpStat, FieldEntry, ObsListing},
    Checkpoint, Stage, TarangError,
};

fn fixture_listing(with_stats: bool) -> ObsListing {
    let antennas = vec![
        "C00".to_string(),
        "C01".to_string(),
        "E02".to_string(),
        "W06".to_string(),
    ];
    let cal_scans = [1u32, 2, 4];
    let mut raw_amplitudes = Vec::new();
    if with_stats {
        for scan in cal_scans {
            for antenna in &antennas {
                for correlation in ["rr", "ll"] {
                    // C01 goes dead on the phase calibrator's first scan.
                    let mean = if antenna == "C01" && scan == 2 { 0.1 } else { 5.0 };
                    raw_amplitudes.push(AmpStat {
                        scan,
                        antenna: antenna.clone(),
                        correlation: correlation.to_string(),
                        mean,
                    });
                }
            }
        }
    }
    ObsListing {
        vis: "obs.ms".to_string(),
        fields: vec![
            FieldEntry {
                name: "3C286".to_string(),
                scans: vec![1],
            },
            FieldEntry {
                name: "J1822-0938".to_string(),
                scans: vec![2, 4],
            },
            FieldEntry {
                name: "DEEP2".to_string(),
                scans: vec![3],
            },
        ],
        antennas,
        spw_frequencies_hz: vec![(0..2048)
            .map(|chan| 0.3e9 + chan as f64 * 97656.25)
            .collect()],
        raw_amplitudes,
    }
}

fn fixture(dir: &TempDir, with_stats: bool) -> (PathBuf, PathBuf) {
    let listing_path = dir.path().join("obs.listing.json");
    fixture_listing(with_stats).save(&listing_path).unwrap();
    let cals_path = dir.path().join("vla-cals.list");
    std::fs::write(&cals_path, "# known phase calibrators\nJ1822-0938\n").unwrap();
    (listing_path, cals_path)
}

fn base_args(dir: &TempDir, listing: &Path, cals: &Path) -> Vec<String> {
    [
        "tarang",
        listing.to_str().unwrap(),
        "--phase-cal-list",
        cals.to_str().unwrap(),
        "--workdir",
        dir.path().to_str().unwrap(),
        "--selfcal-rounds",
        "2",
        "--phase-only-rounds",
        "1",
        "--solint",
        "4.0min",
        "2.0min",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn position(script: &str, needle: &str) -> usize {
    script
        .find(needle)
        .unwrap_or_else(|| panic!("{needle:?} not found in the rendered script"))
}

#[test]
fn full_run_renders_an_ordered_script() {
    let dir = tempdir().unwrap();
    let (listing, cals) = fixture(&dir, true);
    let ctx = TarangContext::from_args(&base_args(&dir, &listing, &cals)).unwrap();
    let script_out = ctx.script_out.clone();
    ctx.run().unwrap();

    let script = std::fs::read_to_string(&script_out).unwrap();

    // The dead antenna found by the sweep is flagged manually.
    assert!(script.contains("antenna='C01'"));
    // The persistent interference channels fall inside this band.
    assert!(script.contains("0:0"));

    // Flagging precedes calibration; the calibration pass runs in solve
    // order; the targets are split, averaged and imaged at the end.
    let quack = position(&script, "mode='quack'");
    let clearcal = position(&script, "clearcal(vis='obs.ms')");
    let setjy = position(&script, "setjy(");
    let delay = position(&script, "gaintype='K'");
    let bandpass = position(&script, "bandpass(");
    let fluxscale = position(&script, "fluxscale(");
    let applycal = position(&script, "applycal(");
    let split = position(&script, "DEEP2split.ms");
    let averaged = position(&script, "DEEP2avg-split.ms");
    let clean = position(&script, "tclean(");
    let export = position(&script, "exportfits(");
    assert!(quack < clearcal);
    assert!(clearcal < setjy);
    assert!(setjy < delay);
    assert!(delay < bandpass);
    assert!(bandpass < fluxscale);
    assert!(fluxscale < applycal);
    assert!(applycal < split);
    assert!(split < averaged);
    assert!(averaged < clean);
    assert!(clean < export);

    // Two rounds solve, the terminal round only images.
    assert!(script.contains("p0.GT"));
    assert!(script.contains("ap1.GT"));
    assert!(script.contains("selfcalimg2"));
    assert!(!script.contains("p2.GT"));

    // The redone pass names its tables apart from the first pass.
    assert!(script.contains("obs.ms.K1recal"));
    assert!(script.contains("obs.ms.B1recal"));
}

#[test]
fn checkpoint_records_the_last_stage() {
    let dir = tempdir().unwrap();
    let (listing, cals) = fixture(&dir, false);
    let ctx = TarangContext::from_args(&base_args(&dir, &listing, &cals)).unwrap();
    let checkpoint_path = ctx.checkpoint_path.clone();
    ctx.run().unwrap();

    let checkpoint = Checkpoint::load(&checkpoint_path).unwrap();
    assert_eq!(checkpoint.last_completed(), Some(Stage::SelfCal));
}

#[test]
fn resumed_run_reissues_nothing() {
    let dir = tempdir().unwrap();
    let (listing, cals) = fixture(&dir, false);
    let args = base_args(&dir, &listing, &cals);
    TarangContext::from_args(&args).unwrap().run().unwrap();

    let mut resumed_args = args.clone();
    resumed_args.push("--resume".to_string());
    let resumed = TarangContext::from_args(&resumed_args).unwrap();
    let script_out = resumed.script_out.clone();
    resumed.run().unwrap();

    let script = std::fs::read_to_string(&script_out).unwrap();
    assert!(!script.contains("gaincal"));
    assert!(!script.contains("flagdata"));
}

#[test]
fn rerun_without_resume_starts_over() {
    let dir = tempdir().unwrap();
    let (listing, cals) = fixture(&dir, false);
    let args = base_args(&dir, &listing, &cals);
    TarangContext::from_args(&args).unwrap().run().unwrap();

    // Without --resume the checkpoint is reset and every stage runs again.
    let rerun = TarangContext::from_args(&args).unwrap();
    let script_out = rerun.script_out.clone();
    rerun.run().unwrap();
    let script = std::fs::read_to_string(&script_out).unwrap();
    assert!(script.contains("gaincal"));
}

#[test]
fn skipped_stages_leave_no_trace_in_the_script() {
    let dir = tempdir().unwrap();
    let (listing, cals) = fixture(&dir, false);
    let mut args = base_args(&dir, &listing, &cals);
    args.extend([
        "--no-selfcal".to_string(),
        "--no-average".to_string(),
        "--no-avg-flag".to_string(),
    ]);
    let ctx = TarangContext::from_args(&args).unwrap();
    let script_out = ctx.script_out.clone();
    ctx.run().unwrap();

    let script = std::fs::read_to_string(&script_out).unwrap();
    assert!(script.contains("DEEP2split.ms"));
    assert!(!script.contains("avg-split.ms"));
    assert!(!script.contains("tclean("));
}

#[test]
fn listing_without_calibrators_is_rejected_at_run_time() {
    let dir = tempdir().unwrap();
    let mut listing = fixture_listing(false);
    listing.fields = vec![FieldEntry {
        name: "DEEP2".to_string(),
        scans: vec![1, 2],
    }];
    let listing_path = dir.path().join("obs.listing.json");
    listing.save(&listing_path).unwrap();
    let cals_path = dir.path().join("vla-cals.list");
    std::fs::write(&cals_path, "J1822-0938\n").unwrap();

    let ctx = TarangContext::from_args(&base_args(&dir, &listing_path, &cals_path)).unwrap();
    assert!(matches!(ctx.run(), Err(TarangError::Config(_))));
}
