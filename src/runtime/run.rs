//! Run loop with restart support
//!
//! Running an [`App`] (rather than merely building it) compiles the
//! graph, hands it to a runtime, and waits on three signals: the
//! restart channel, the shutdown channel, and the runtime's own
//! completion — whichever fires first. On restart the runtime is
//! stopped within the bounded timeout and the whole graph is rebuilt,
//! so an external watcher (e.g. a configuration change detector) can
//! drive live reconfiguration through [`RunControl::restart`].

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::build::{App, CompiledGraph};
use crate::error::{CompileError, ResolveError};

use super::{Injector, Runtime};

/// Errors surfaced by [`Runner::run`].
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

#[derive(Clone, Copy, Debug)]
pub struct RunOptions {
    /// Bound on each shutdown (per stop hook in the reference runtime).
    pub stop_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(15),
        }
    }
}

/// Builds the runtime driving each compiled graph. The default wires
/// the reference [`Injector`].
pub type RuntimeFactory = Box<dyn Fn(CompiledGraph) -> Result<Box<dyn Runtime>, ResolveError> + Send + Sync>;

/// Signal handle for a running [`Runner`]. Both channels are
/// single-slot: signalling an already-signalled runner is a no-op.
#[derive(Clone)]
pub struct RunControl {
    restart_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RunControl {
    /// Request a stop-rebuild-restart cycle.
    pub fn restart(&self) {
        let _ = self.restart_tx.try_send(());
    }

    /// Request a final shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
    }
}

pub struct Runner {
    app: App,
    options: RunOptions,
    factory: RuntimeFactory,
    restart_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl App {
    /// Prepare a run loop over this tree. The returned control handle
    /// fires the restart/shutdown signals.
    pub fn runner(self, options: RunOptions) -> (Runner, RunControl) {
        let (restart_tx, restart_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            Runner {
                app: self,
                options,
                factory: Box::new(|graph| Ok(Box::new(Injector::new(graph)?) as Box<dyn Runtime>)),
                restart_rx,
                shutdown_rx,
            },
            RunControl {
                restart_tx,
                shutdown_tx,
            },
        )
    }
}

impl Runner {
    /// Swap in a different runtime implementation.
    pub fn with_runtime_factory(mut self, factory: RuntimeFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Build, start, and supervise until shutdown. Each restart signal
    /// stops the runtime within the bounded timeout and rebuilds the
    /// whole graph from the (re-evaluated) tree.
    pub async fn run(mut self) -> Result<(), RunError> {
        loop {
            let graph = self.app.build()?;
            debug!(instructions = graph.instructions.len(), "graph built");
            let mut runtime = (self.factory)(graph)?;
            runtime.start().await?;
            info!("runtime started");

            tokio::select! {
                _ = runtime.done() => {
                    info!("runtime finished on its own");
                    runtime.stop(self.options.stop_timeout).await?;
                    return Ok(());
                }
                restart = self.restart_rx.recv() => {
                    runtime.stop(self.options.stop_timeout).await?;
                    match restart {
                        Some(()) => {
                            info!("restart signal received, rebuilding graph");
                            continue;
                        }
                        // control handle dropped: nothing can signal us again
                        None => return Ok(()),
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    runtime.stop(self.options.stop_timeout).await?;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingRuntime {
        starts: Arc<AtomicU32>,
        stops: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Runtime for CountingRuntime {
        async fn start(&mut self) -> Result<(), ResolveError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&mut self, _timeout: Duration) -> Result<(), ResolveError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn restart_rebuilds_and_restarts() {
        let starts = Arc::new(AtomicU32::new(0));
        let stops = Arc::new(AtomicU32::new(0));
        let (starts_f, stops_f) = (Arc::clone(&starts), Arc::clone(&stops));

        let (runner, control) = App::new().runner(RunOptions::default());
        let runner = runner.with_runtime_factory(Box::new(move |_graph| {
            Ok(Box::new(CountingRuntime {
                starts: Arc::clone(&starts_f),
                stops: Arc::clone(&stops_f),
            }) as Box<dyn Runtime>)
        }));

        let task = tokio::spawn(runner.run());
        tokio::task::yield_now().await;
        control.restart();
        // give the loop a moment to cycle, then shut down
        tokio::time::sleep(Duration::from_millis(50)).await;
        control.shutdown();
        task.await.unwrap().unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_once() {
        let starts = Arc::new(AtomicU32::new(0));
        let stops = Arc::new(AtomicU32::new(0));
        let (starts_f, stops_f) = (Arc::clone(&starts), Arc::clone(&stops));

        let (runner, control) = App::new().runner(RunOptions::default());
        let runner = runner.with_runtime_factory(Box::new(move |_graph| {
            Ok(Box::new(CountingRuntime {
                starts: Arc::clone(&starts_f),
                stops: Arc::clone(&stops_f),
            }) as Box<dyn Runtime>)
        }));

        let task = tokio::spawn(runner.run());
        tokio::task::yield_now().await;
        control.shutdown();
        task.await.unwrap().unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
