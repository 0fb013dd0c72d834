use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the build environment is provisioned and how the build is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Create a stopped container, copy the source tree in, then start it
    /// and attach to its output.
    CopyIn,
    /// Launch the image detached and wait for it to exit.
    Detached,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::CopyIn => "copy-in",
            Strategy::Detached => "detached",
        }
    }

    /// Whether the local source tree is copied into the environment.
    pub fn populates(&self) -> bool {
        matches!(self, Strategy::CopyIn)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: String,
    pub image: String,
    /// Overrides the image's default command when non-empty.
    pub command: Vec<String>,
    pub strategy: Strategy,
    pub source_dir: PathBuf,
    pub workspace: String,
    pub artifact_path: String,
    pub output_dir: PathBuf,
    pub clean_output: bool,
    pub check_exit_status: bool,
    pub timeout: Option<u64>,
    pub run_as_invoking_user: bool,
    pub report: Option<PathBuf>,
}

impl Config {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: "docker".to_string(),
            image: "sweethome3d-build".to_string(),
            command: Vec::new(),
            strategy: Strategy::CopyIn,
            source_dir: PathBuf::from("."),
            workspace: "/workspace".to_string(),
            artifact_path: "/workspace/install".to_string(),
            output_dir: PathBuf::from("build"),
            clean_output: true,
            check_exit_status: true,
            timeout: None,
            run_as_invoking_user: false,
            report: None,
        }
    }
}
