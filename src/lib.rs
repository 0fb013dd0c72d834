//! Out-of-tree builds inside a throwaway container.
//!
//! [`build::BuildRunner`] provisions an environment through a
//! [`docker::Engine`], optionally copies the source tree in, runs the
//! build, copies the artifact directory back out and always removes the
//! environment it created.

pub mod build;
pub mod config;
pub mod docker;
pub mod interrupt;
pub mod logging;
