// The build workflow: provision, populate, execute, extract, teardown.

mod environment;
mod error;
pub mod orchestrator;
mod types;

pub use environment::Environment;
pub use error::BuildError;
pub use orchestrator::{BUILD_OUTPUT_TARGET, BuildRunner};
pub use types::{Outcome, RunReport, State, Step, StepRecord};
