//! Runtime boundary
//!
//! The compiler's output is the instruction list; everything past that
//! is a [`Runtime`]. The in-crate [`Injector`] is the reference
//! implementation used by the tests and the default `run` loop — real
//! deployments may hand the instructions to their own wiring layer.

mod injector;
mod run;

pub use injector::Injector;
pub use run::{RunControl, RunError, RunOptions, Runner, RuntimeFactory};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ResolveError;

/// An injection runtime driving a compiled graph: instantiate and wire
/// on `start`, release on `stop` within the given timeout.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn start(&mut self) -> Result<(), ResolveError>;

    async fn stop(&mut self, timeout: Duration) -> Result<(), ResolveError>;

    /// Resolves when the runtime terminates on its own. The default
    /// never resolves; the run loop then reacts to signals only.
    async fn done(&mut self) {
        std::future::pending::<()>().await
    }
}
