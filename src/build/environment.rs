use tracing::{info, warn};

use crate::docker::{Engine, EngineError, EnvironmentHandle};

/// A provisioned build environment that is removed exactly once.
///
/// Call [`Environment::teardown`] to remove it and observe the result. If
/// the guard is dropped first (early return, panic) removal still happens,
/// best effort.
pub struct Environment<'e, E: Engine + ?Sized> {
    engine: &'e E,
    handle: EnvironmentHandle,
    released: bool,
}

impl<'e, E: Engine + ?Sized> Environment<'e, E> {
    pub fn new(engine: &'e E, handle: EnvironmentHandle) -> Self {
        Self {
            engine,
            handle,
            released: false,
        }
    }

    pub fn handle(&self) -> &EnvironmentHandle {
        &self.handle
    }

    pub fn teardown(mut self) -> Result<(), EngineError> {
        self.released = true;
        info!(handle = %self.handle.short(), "removing build environment");
        self.engine.remove(&self.handle)
    }
}

impl<E: Engine + ?Sized> Drop for Environment<'_, E> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        warn!(handle = %self.handle.short(), "build environment dropped without teardown");
        if let Err(e) = self.engine.remove(&self.handle) {
            warn!(handle = %self.handle.short(), error = %e, "failed to remove build environment");
        }
    }
}
