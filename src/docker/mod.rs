// Container engine access: provisioning, copying, streaming output, cancellation.

pub mod engine;
pub mod run;
pub mod types;

pub use engine::{CliEngine, Engine, user_args};
pub use types::{
    BuildStatus, CancelToken, ContainerCommand, EngineError, EnvironmentHandle, OutputLine,
    ProcessResult,
};
