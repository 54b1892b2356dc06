//! Phase runner - ordered, named, fail-fast step sequences
//!
//! A [`Phase`] expresses a strict per-host sequence such as "init master0":
//! steps run in declaration order, the first failure aborts the rest, and
//! the returned error carries the phase name. Retries are never done here;
//! the connection layer already retries where that makes sense.

use std::fmt;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

/// Error from a failed phase, wrapping the first failing step's error.
#[derive(Debug)]
pub struct PhaseError<E> {
    phase: String,
    source: E,
}

impl<E> PhaseError<E> {
    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn into_source(self) -> E {
        self.source
    }
}

impl<E: fmt::Display> fmt::Display for PhaseError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to {}: {}", self.phase, self.source)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PhaseError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// An ordered sequence of fallible steps bound to a phase name.
///
/// Purely transient: constructed per invocation, consumed by [`Phase::run`].
pub struct Phase<'a, E> {
    name: String,
    steps: Vec<BoxFuture<'a, Result<(), E>>>,
}

impl<'a, E> Phase<'a, E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step. Futures are lazy, so nothing runs until [`Phase::run`].
    pub fn step<F>(mut self, fut: F) -> Self
    where
        F: std::future::Future<Output = Result<(), E>> + Send + 'a,
    {
        self.steps.push(fut.boxed());
        self
    }

    /// Execute the steps strictly in declaration order, stopping at the
    /// first failure.
    pub async fn run(self) -> Result<(), PhaseError<E>> {
        let total = self.steps.len();
        for (i, step) in self.steps.into_iter().enumerate() {
            debug!("phase {}: step {}/{}", self.name, i + 1, total);
            if let Err(source) = step.await {
                return Err(PhaseError {
                    phase: self.name,
                    source,
                });
            }
        }
        Ok(())
    }
}
