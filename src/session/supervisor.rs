//! Session job supervision: one foreground job whose completion ends the
//! session, any number of background jobs cancelled when it does.

use {
    std::{future::Future, time::Duration},
    thiserror::Error,
    tokio::{task::JoinSet, time},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::defaults;

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SupervisorError {
    #[error("a foreground job is already registered")]
    ForegroundAlreadyRegistered,
}

/// Tracks the session's jobs under a single cancellation scope.
///
/// Cancellation is cooperative: every job is expected to select its I/O
/// against the token handed out by [`cancellation`][Supervisor::cancellation]
/// and unwind promptly once it fires. Jobs that do not are aborted when the
/// grace period runs out.
pub struct Supervisor {
    cancel: CancellationToken,
    grace: Duration,
    foreground: Option<tokio::task::JoinHandle<anyhow::Result<()>>>,
    background: JoinSet<()>,
}

impl Supervisor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_grace(cancel, defaults::shutdown_grace())
    }

    pub fn with_grace(cancel: CancellationToken, grace: Duration) -> Self {
        Supervisor {
            cancel,
            grace,
            foreground: None,
            background: JoinSet::new(),
        }
    }

    /// The token every job must bind its I/O to.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register the single foreground job. A second registration is
    /// rejected; the session has exactly one job that defines its lifetime.
    pub fn register_foreground<F>(&mut self, job: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.foreground.is_some() {
            return Err(SupervisorError::ForegroundAlreadyRegistered);
        }
        self.foreground = Some(tokio::spawn(job));
        Ok(())
    }

    /// Spawn a background job. Failures are logged, not propagated: a
    /// broken forward or tee must not take the session down.
    pub fn spawn_background<F>(&mut self, job: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.background.spawn(async move {
            if let Err(error) = job.await {
                debug!("background job ended with error: {error:#}");
            }
        });
    }

    /// Block until the foreground job finishes or the scope is cancelled,
    /// then wind down every background job, aborting whatever is still
    /// running when the grace period expires.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        let result = match self.foreground.take() {
            Some(mut foreground) => {
                tokio::select! {
                    joined = &mut foreground => flatten(joined),
                    () = self.cancel.cancelled() => {
                        // Cancelled from outside: give the foreground the
                        // grace period to notice the token and unwind.
                        match time::timeout(self.grace, &mut foreground).await {
                            Ok(joined) => flatten(joined),
                            Err(_elapsed) => {
                                warn!("foreground job ignored cancellation; aborting");
                                foreground.abort();
                                Ok(())
                            }
                        }
                    }
                }
            }
            None => {
                self.cancel.cancelled().await;
                Ok(())
            }
        };

        // Foreground is done one way or another; no feature outlives it.
        self.cancel.cancel();
        let drained = time::timeout(self.grace, async {
            while self.background.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("background jobs did not stop within the grace period; aborting them");
            self.background.shutdown().await;
        }

        result
    }
}

fn flatten(joined: Result<anyhow::Result<()>, tokio::task::JoinError>) -> anyhow::Result<()> {
    match joined {
        Ok(result) => result,
        Err(error) if error.is_panic() => Err(anyhow::anyhow!("foreground job panicked")),
        Err(_cancelled) => Ok(()),
    }
}
