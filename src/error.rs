//! Error handling for tarang.

use thiserror::Error;

/// General error type for any step of the pipeline.
#[derive(Error, Debug)]
pub enum TarangError {
    #[error(transparent)]
    /// Error derived from [`crate::config::ConfigError`]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    /// Error derived from [`crate::detection::DetectionError`]
    Detection(#[from] crate::detection::DetectionError),

    #[error(transparent)]
    /// Error derived from [`crate::calibration::CalibrationError`]
    Calibration(#[from] crate::calibration::CalibrationError),

    #[error(transparent)]
    /// Error derived from [`crate::selfcal::ImagingError`]
    Imaging(#[from] crate::selfcal::ImagingError),

    #[error(transparent)]
    /// Error derived from [`crate::artifacts::ResourceError`]
    Resource(#[from] crate::artifacts::ResourceError),

    #[error(transparent)]
    /// Error derived from [`crate::listing::ListingError`]
    Listing(#[from] crate::listing::ListingError),

    #[error(transparent)]
    /// Error derived from [`crate::checkpoint::CheckpointError`]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),

    #[error(transparent)]
    /// Error derived from [`crate::engine::EngineError`]
    Engine(#[from] crate::engine::EngineError),

    #[error("could not write the rendered script to {path}: {source}")]
    /// The rendered script could not be written
    ScriptWrite {
        /// The output path
        path: std::path::PathBuf,
        /// The underlying io error
        source: std::io::Error,
    },

    #[error("{0}")]
    /// Invalid command line argument
    CLIError(CLIError),

    #[error("You selected dry run")]
    /// enabled dry run
    DryRun {},

    #[cfg(feature = "cli")]
    #[error(transparent)]
    /// Error derived from [`clap::Error`]
    ClapError(#[from] clap::Error),
}

/// Errors in the command line interface.
#[derive(Error, Debug)]
pub enum CLIError {
    /// And invalid command line argument was provided.
    #[error("Invalid Command Line Argument: {option}: expected {expected}, received {received}")]
    InvalidCommandLineArgument {
        /// The option that was invalid
        option: String,
        /// What was expected of the option
        expected: String,
        /// What was actually received
        received: String,
    },
}
