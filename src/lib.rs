#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::missing_errors_doc)]

//! Tarang is a library for planning and driving the reduction of uGMRT
//! (upgraded Giant Metrewave Radio Telescope) continuum interferometry
//! data: field classification, dead-antenna and RFI-channel detection,
//! direction-independent calibration, batched flagging and a
//! self-calibration imaging loop.
//!
//! The decision layer is separated from the interferometric heavy lifting:
//! every operation goes through the traits in [`engine`], and the bundled
//! [`ScriptEngine`] renders a whole reduction as a CASA-compatible Python
//! script from nothing but a JSON metadata dump.
//!
//! # Examples
//!
//! Classify an observation and plan its channel windows offline:
//!
//! ```rust
//! use tarang::{ChannelWindows, FieldClassifier};
//!
//! let classifier = FieldClassifier::new(["J1822-0938"]);
//! let fields = classifier.classify(&[
//!     "3C286".to_string(),
//!     "J1822-0938".to_string(),
//!     "DEEP2".to_string(),
//! ]);
//! assert_eq!(fields.amp_cals, vec!["3C286".to_string()]);
//! assert_eq!(fields.flux_reference(), Some("3C286"));
//!
//! let windows = ChannelWindows::for_channel_count(2048).unwrap();
//! assert_eq!(windows.probe, "0:500~600");
//! ```
//!
//! Render a calibration reset as CASA script lines:
//!
//! ```rust
//! use std::path::Path;
//! use tarang::engine::CalibrationEngine;
//! use tarang::ScriptEngine;
//!
//! let mut engine = ScriptEngine::new();
//! engine.comment("initial calibration");
//! engine.reset_calibration(Path::new("obs.ms")).unwrap();
//! assert!(engine.render().contains("clearcal(vis='obs.ms')"));
//! ```

pub mod artifacts;
pub mod baselines;
pub mod calibration;
pub mod checkpoint;
pub mod config;
pub mod constants;
pub mod context;
pub mod detection;
pub mod engine;
pub mod error;
pub mod fields;
pub mod flagging;
pub mod listing;
pub mod selfcal;
pub mod windows;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(test)]
pub(crate) mod test_common;

pub use artifacts::{ArtifactRegistry, GainTable, ResourceError};
pub use baselines::{BaselineClass, BaselineTopology};
pub use calibration::{CalibrationError, CalibrationPass};
pub use checkpoint::{Checkpoint, CheckpointError, Stage};
pub use config::{ConfigError, PipelineConfig, StageToggles};
pub use context::PipelineContext;
pub use detection::{AntennaSweep, BadAntennaDetector, BadChannelDetector, DetectionError};
pub use engine::script::ScriptEngine;
pub use error::{CLIError, TarangError};
pub use fields::{FieldClassifier, FieldSet};
pub use listing::{AmpStat, FieldEntry, ListingError, ObsListing};
pub use selfcal::{ImagingError, SelfCalLoop, SelfCalRound, SelfCalSchedule};
pub use windows::ChannelWindows;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use lazy_static::lazy_static;

lazy_static! {
    /// Wall-clock time spent in each named phase of a run.
    static ref DURATIONS: Mutex<HashMap<String, Duration>> = Mutex::new(HashMap::new());
}

/// Add elapsed time to a named phase. Used through
/// [`with_increment_duration!`].
pub fn increment_duration(name: &str, duration: Duration) {
    if let Ok(mut durations) = DURATIONS.lock() {
        *durations.entry(name.to_string()).or_default() += duration;
    }
}

/// A snapshot of the per-phase durations recorded so far.
pub fn get_durations() -> HashMap<String, Duration> {
    DURATIONS
        .lock()
        .map(|durations| durations.clone())
        .unwrap_or_default()
}

/// Time an expression and add its wall-clock duration to a named phase.
#[macro_export]
macro_rules! with_increment_duration {
    ($name:expr, $expr:expr) => {{
        let _timer = ::std::time::Instant::now();
        let _result = $expr;
        $crate::increment_duration($name, _timer.elapsed());
        _result
    }};
}
