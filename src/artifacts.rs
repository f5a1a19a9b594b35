//! Naming and lifecycle of the files a reduction produces: images, FITS
//! exports, gain tables and intermediate visibility files.
//!
//! Every product name is derived here so the stages never concatenate
//! strings themselves, and so a resumed run finds the same names a fresh
//! run would have produced. The registry also owns deletion of superseded
//! intermediates, which is what keeps an imaging run from filling the disk
//! with one multi-hundred-gigabyte file per round.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use thiserror::Error;

use crate::engine::{CalMode, EngineError};

/// Error in artifact housekeeping.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// A superseded intermediate could not be deleted.
    #[error("could not delete {path}: {source}")]
    Delete {
        /// The file or directory being deleted
        path: PathBuf,
        /// The underlying io error
        source: io::Error,
    },
    /// The split producing a round's visibility file failed.
    #[error("could not split the round-{round} visibility file: {source}")]
    Split {
        /// The self-calibration round
        round: usize,
        /// The engine's account of the failure
        source: EngineError,
    },
}

/// One registered self-calibration gain table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GainTable {
    /// Table name on disk, e.g. `p2.GT`
    pub name: String,
    /// The round that solved it
    pub round: usize,
    /// Phase-only or amplitude+phase
    pub mode: CalMode,
    /// The solution interval it was solved at
    pub solint: String,
    /// Index of the table solved the round before, forming a lineage chain
    pub parent: Option<usize>,
}

/// Registry of everything a reduction writes, rooted at one work directory.
#[derive(Debug, Clone, Default)]
pub struct ArtifactRegistry {
    workdir: PathBuf,
    tables: Vec<GainTable>,
    vis_files: BTreeMap<usize, PathBuf>,
}

impl ArtifactRegistry {
    /// A registry rooted at `workdir`; all product paths are under it.
    pub fn new<P: Into<PathBuf>>(workdir: P) -> Self {
        Self {
            workdir: workdir.into(),
            ..Self::default()
        }
    }

    /// The work directory products land in.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Base name of the image of one round.
    pub fn image_name(round: usize) -> String {
        format!("selfcalimg{round}")
    }

    /// Base name of the single dirty image of a no-selfcal run.
    pub fn dirty_image_name() -> String {
        "dirty-img".to_string()
    }

    /// Path of the restored image an imaging run leaves behind. Wide-band
    /// cleans restore into a `.tt0` plane.
    pub fn restored_image(&self, image_name: &str, nterms: u8) -> PathBuf {
        let suffix = if nterms > 1 { ".image.tt0" } else { ".image" };
        self.workdir.join(format!("{image_name}{suffix}"))
    }

    /// Path of the FITS export of one image.
    pub fn fits_path(&self, image_name: &str) -> PathBuf {
        self.workdir.join(format!("{image_name}.fits"))
    }

    /// Register the gain table of one round and hand back its index and
    /// path. The table chains to the previously registered table, so the
    /// full solution lineage can be reconstructed later.
    pub fn register_gain_table(
        &mut self,
        round: usize,
        mode: CalMode,
        solint: &str,
    ) -> (usize, PathBuf) {
        let name = format!("{}{round}.GT", mode.code());
        let parent = self.tables.len().checked_sub(1);
        self.tables.push(GainTable {
            name: name.clone(),
            round,
            mode,
            solint: solint.to_string(),
            parent,
        });
        (self.tables.len() - 1, self.workdir.join(name))
    }

    /// The registered gain tables, oldest first.
    pub fn gain_tables(&self) -> &[GainTable] {
        &self.tables
    }

    /// Lineage of one table, newest first, ending at the first round.
    pub fn lineage(&self, index: usize) -> Vec<&GainTable> {
        let mut chain = Vec::new();
        let mut cursor = Some(index);
        while let Some(idx) = cursor {
            let table = &self.tables[idx];
            chain.push(table);
            cursor = table.parent;
        }
        chain
    }

    /// Register and name the calibrated visibility file a round splits out.
    pub fn register_round_vis(&mut self, round: usize) -> PathBuf {
        let path = self.workdir.join(format!("vis-selfcal{round}.ms"));
        self.vis_files.insert(round, path.clone());
        path
    }

    /// The visibility file of one round, if registered and not yet retired.
    pub fn round_vis(&self, round: usize) -> Option<&PathBuf> {
        self.vis_files.get(&round)
    }

    /// Name of the per-field split of the corrected target data.
    pub fn split_vis(&self, field: &str) -> PathBuf {
        self.workdir.join(format!("{field}split.ms"))
    }

    /// Name of the channel-averaged counterpart of a split file. The
    /// `split.ms` suffix is replaced rather than appended, so
    /// `DEEP2split.ms` averages into `DEEP2avg-split.ms`.
    pub fn averaged_vis(&self, split: &Path) -> PathBuf {
        let name = split
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = name.strip_suffix("split.ms").unwrap_or(&name);
        self.workdir.join(format!("{stem}avg-split.ms"))
    }

    /// Delete the visibility file of one superseded round. A file already
    /// gone (or never materialized, as in a script-rendering run) is not an
    /// error.
    ///
    /// # Errors
    ///
    /// A [`ResourceError::Delete`] when the file exists but cannot be
    /// removed.
    pub fn retire_round_vis(&mut self, round: usize) -> Result<(), ResourceError> {
        let Some(path) = self.vis_files.remove(&round) else {
            return Ok(());
        };
        debug!("retiring superseded visibility file {}", path.display());
        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "round-{round} visibility file {} was already gone",
                    path.display()
                );
                Ok(())
            }
            Err(source) => Err(ResourceError::Delete { path, source }),
        }
    }
}
