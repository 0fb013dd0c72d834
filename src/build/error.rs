use std::path::PathBuf;

use thiserror::Error;

use super::types::Step;
use crate::docker::EngineError;

/// Why a build run failed. Every variant is fatal to the run.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid output_dir {}: {reason}", .path.display())]
    OutputDir { path: PathBuf, reason: &'static str },

    #[error("failed to provision build environment from `{image}`: {source}")]
    Provisioning {
        image: String,
        #[source]
        source: EngineError,
    },

    #[error("failed to copy {} into the build environment: {source}", .path.display())]
    Population {
        path: PathBuf,
        #[source]
        source: EngineError,
    },

    #[error("failed to run the build: {source}")]
    Execution {
        #[source]
        source: EngineError,
    },

    #[error("build exited with status {exit_code}")]
    BuildFailed { exit_code: i64 },

    #[error("failed to extract `{remote}` to {}: {source}", .local.display())]
    Extraction {
        remote: String,
        local: PathBuf,
        #[source]
        source: EngineError,
    },

    #[error("failed to remove build environment {handle}: {source}")]
    Teardown {
        handle: String,
        #[source]
        source: EngineError,
    },

    #[error("interrupted before {step}")]
    Interrupted { step: Step },
}

impl BuildError {
    /// The step this error aborted.
    pub fn step(&self) -> Step {
        match self {
            BuildError::OutputDir { .. } | BuildError::Provisioning { .. } => Step::Provision,
            BuildError::Population { .. } => Step::Populate,
            BuildError::Execution { .. } | BuildError::BuildFailed { .. } => Step::Execute,
            BuildError::Extraction { .. } => Step::Extract,
            BuildError::Teardown { .. } => Step::Teardown,
            BuildError::Interrupted { step } => *step,
        }
    }
}
