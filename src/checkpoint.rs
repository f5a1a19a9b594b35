//! Resumable runs: a small JSON file recording the last completed stage.
//!
//! A reduction takes hours to days, mostly inside engine tasks. The
//! checkpoint lets a crashed or interrupted run pick up after the last
//! stage that finished, provided its products are still on disk.

use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

/// Error loading or saving a checkpoint file.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The checkpoint file could not be read or written.
    #[error("could not access checkpoint {path}: {source}")]
    Io {
        /// The checkpoint path
        path: PathBuf,
        /// The underlying io error
        source: std::io::Error,
    },
    /// The checkpoint file is not valid checkpoint JSON.
    #[error("could not parse checkpoint {path}: {source}")]
    Parse {
        /// The checkpoint path
        path: PathBuf,
        /// The underlying serde error
        source: serde_json::Error,
    },
}

/// The resumable stages of a reduction, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    /// Pre-calibration flagging on raw data
    InitialFlagging,
    /// The first calibration pass
    InitialCalibration,
    /// Flagging on the corrected column
    PostCalFlagging,
    /// The redone calibration pass
    Recalibration,
    /// Per-target splits of the corrected data
    SplitTargets,
    /// Flagging on the split file
    SplitFlagging,
    /// Channel averaging of the split
    AverageChannels,
    /// Flagging on the averaged file
    AveragedFlagging,
    /// The self-calibration loop
    SelfCal,
}

impl Stage {
    fn ordinal(self) -> usize {
        Stage::iter().position(|s| s == self).unwrap_or(0)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    last_completed: Option<Stage>,
}

/// Progress record of one run, persisted after every completed stage.
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    last_completed: Option<Stage>,
}

impl Checkpoint {
    /// Load the checkpoint at `path`; a missing file means a fresh run.
    ///
    /// # Errors
    ///
    /// A [`CheckpointError`] when the file exists but cannot be read or
    /// parsed.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                debug!("no checkpoint at {}, starting fresh", path.display());
                return Ok(Self {
                    path: path.to_path_buf(),
                    last_completed: None,
                });
            }
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let file: CheckpointFile =
            serde_json::from_str(&content).map_err(|source| CheckpointError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if let Some(stage) = file.last_completed {
            info!("resuming after {stage}");
        }
        Ok(Self {
            path: path.to_path_buf(),
            last_completed: file.last_completed,
        })
    }

    /// The last stage recorded as complete.
    pub fn last_completed(&self) -> Option<Stage> {
        self.last_completed
    }

    /// Whether a stage already completed in an earlier run.
    pub fn is_complete(&self, stage: Stage) -> bool {
        self.last_completed
            .map(|last| stage.ordinal() <= last.ordinal())
            .unwrap_or(false)
    }

    /// Record a stage as complete and persist immediately, so a crash
    /// between stages loses nothing.
    ///
    /// # Errors
    ///
    /// A [`CheckpointError`] when the file cannot be written.
    pub fn record(&mut self, stage: Stage) -> Result<(), CheckpointError> {
        self.last_completed = Some(stage);
        let rendered = serde_json::to_string_pretty(&CheckpointFile {
            last_completed: self.last_completed,
        })
        .map_err(|source| CheckpointError::Parse {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, rendered).map_err(|source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Forget all recorded progress and delete the file.
    ///
    /// # Errors
    ///
    /// A [`CheckpointError`] when the file exists but cannot be removed.
    pub fn reset(&mut self) -> Result<(), CheckpointError> {
        self.last_completed = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_a_fresh_run() {
        let dir = tempdir().unwrap();
        let checkpoint = Checkpoint::load(&dir.path().join("run.checkpoint.json")).unwrap();
        assert_eq!(checkpoint.last_completed(), None);
        assert!(!checkpoint.is_complete(Stage::InitialFlagging));
    }

    #[test]
    fn recording_persists_across_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.checkpoint.json");
        let mut checkpoint = Checkpoint::load(&path).unwrap();
        checkpoint.record(Stage::Recalibration).unwrap();

        let reloaded = Checkpoint::load(&path).unwrap();
        assert_eq!(reloaded.last_completed(), Some(Stage::Recalibration));
        assert!(reloaded.is_complete(Stage::InitialFlagging));
        assert!(reloaded.is_complete(Stage::Recalibration));
        assert!(!reloaded.is_complete(Stage::SplitTargets));
        assert!(!reloaded.is_complete(Stage::SelfCal));
    }

    #[test]
    fn reset_forgets_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.checkpoint.json");
        let mut checkpoint = Checkpoint::load(&path).unwrap();
        checkpoint.record(Stage::SelfCal).unwrap();
        checkpoint.reset().unwrap();
        assert!(!path.exists());

        let reloaded = Checkpoint::load(&path).unwrap();
        assert_eq!(reloaded.last_completed(), None);
    }

    #[test]
    fn stage_names_round_trip_as_kebab_case() {
        assert_eq!(Stage::InitialFlagging.to_string(), "initial-flagging");
        assert_eq!(Stage::SelfCal.to_string(), "self-cal");
        assert_eq!("averaged-flagging".parse(), Ok(Stage::AveragedFlagging));
        let rendered = serde_json::to_string(&Stage::SplitTargets).unwrap();
        assert_eq!(rendered, "\"split-targets\"");
    }
}
