use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::error::BuildError;
use crate::config::Strategy;

/// One step of a build run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Provision,
    Populate,
    Execute,
    Extract,
    Teardown,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Provision => "provision",
            Step::Populate => "populate",
            Step::Execute => "execute",
            Step::Extract => "extract",
            Step::Teardown => "teardown",
        }
    }

    /// State reached when this step completes.
    pub fn completes_into(&self) -> State {
        match self {
            Step::Provision => State::Provisioned,
            Step::Populate => State::Populated,
            Step::Execute => State::Executing,
            Step::Extract => State::Extracted,
            Step::Teardown => State::TornDown,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last state a run reached. `Start` is initial; a run always ends in
/// `TornDown` once provisioning succeeded and teardown went through.
///
/// `Executing` covers the build from start until its artifacts are
/// extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    #[default]
    Start,
    Provisioned,
    Populated,
    Executing,
    Extracted,
    TornDown,
}

/// Terminal result of a run, reported once.
#[derive(Debug)]
pub enum Outcome {
    Success,
    Failure(BuildError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Failure(_) => 1,
        }
    }

    pub fn error(&self) -> Option<&BuildError> {
        match self {
            Outcome::Success => None,
            Outcome::Failure(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub success: bool,
    pub duration_ms: u64,
}

/// Machine-readable summary of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub image: String,
    pub strategy: Strategy,
    pub handle: Option<String>,
    pub state: State,
    pub steps: Vec<StepRecord>,
    pub exit_code: Option<i64>,
    pub artifacts: usize,
    pub success: bool,
    pub error: Option<String>,
}

impl RunReport {
    pub fn new(image: &str, strategy: Strategy) -> Self {
        Self {
            image: image.to_string(),
            strategy,
            handle: None,
            state: State::Start,
            steps: Vec::new(),
            exit_code: None,
            artifacts: 0,
            success: false,
            error: None,
        }
    }

    /// Steps that were attempted, in order.
    pub fn attempted(&self) -> Vec<Step> {
        self.steps.iter().map(|r| r.step).collect()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize run report")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write run report to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_complete_into_states_in_order() {
        let states: Vec<State> = [
            Step::Provision,
            Step::Populate,
            Step::Execute,
            Step::Extract,
            Step::Teardown,
        ]
        .iter()
        .map(Step::completes_into)
        .collect();
        assert_eq!(
            states,
            vec![
                State::Provisioned,
                State::Populated,
                State::Executing,
                State::Extracted,
                State::TornDown
            ]
        );
    }

    #[test]
    fn outcome_exit_codes() {
        assert_eq!(Outcome::Success.exit_code(), 0);
        let failed = Outcome::Failure(BuildError::BuildFailed { exit_code: 2 });
        assert_eq!(failed.exit_code(), 1);
        assert!(!failed.is_success());
        assert!(failed.error().is_some());
    }

    #[test]
    fn report_serializes_lowercase_names() {
        let mut report = RunReport::new("img", Strategy::Detached);
        report.steps.push(StepRecord {
            step: Step::Provision,
            success: true,
            duration_ms: 12,
        });
        report.state = State::TornDown;
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["strategy"], "detached");
        assert_eq!(json["state"], "torn-down");
        assert_eq!(json["steps"][0]["step"], "provision");
    }

    #[test]
    fn report_writes_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        RunReport::new("img", Strategy::CopyIn).write(&path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let back: RunReport = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.image, "img");
        assert_eq!(back.strategy, Strategy::CopyIn);
    }
}
