//! Convergence polling.
//!
//! Waits for an asynchronously mutated resource to settle in one of a set of
//! terminal states by re-fetching its state at a fixed interval.

use std::fmt::Display;
use std::future::Future;

use tracing::{debug, info, warn};

use crate::config::PollSettings;
use crate::error::{Error, Result, ValidationError};

/// One fetch outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation<S> {
    /// The identifier resolved and the resource is in this state.
    Present(S),
    /// The identifier no longer resolves.
    Vanished,
}

/// A single wait for one resource. Discarded once the wait returns.
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceRequest<'a, S> {
    pub id: &'a str,
    pub terminal: &'a [S],
    pub settings: PollSettings,
}

impl<'a, S> ConvergenceRequest<'a, S>
where
    S: Copy + PartialEq + Display,
{
    pub fn new(id: &'a str, terminal: &'a [S], settings: PollSettings) -> Self {
        Self {
            id,
            terminal,
            settings,
        }
    }

    /// Fetch immediately, then every `interval`, until a terminal state shows up.
    ///
    /// Performs at most `max_attempts` fetches and never sleeps after the last
    /// one. A failed fetch is not retried; it ends the wait with
    /// [`Error::FetchFailed`].
    pub async fn wait<F, Fut>(&self, mut fetch: F) -> Result<S>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Observation<S>>>,
    {
        if self.id.is_empty() {
            return Err(ValidationError::MissingIdentifier.into());
        }
        if self.terminal.is_empty() {
            return Err(ValidationError::EmptyTerminalSet.into());
        }
        self.settings.validate()?;

        let max_attempts = self.settings.max_attempts;
        let mut last_state: Option<S> = None;

        for attempt in 1..=max_attempts {
            let observed = fetch().await.map_err(|e| Error::FetchFailed {
                id: self.id.to_string(),
                attempt,
                source: Box::new(e),
            })?;

            match observed {
                Observation::Vanished => {
                    warn!(resource_id = %self.id, attempt, "Resource vanished while polling");
                    return Err(Error::ResourceVanished {
                        id: self.id.to_string(),
                        attempt,
                    });
                }
                Observation::Present(state) => {
                    debug!(resource_id = %self.id, attempt, %state, "Polled state");
                    if self.terminal.contains(&state) {
                        if attempt > 1 {
                            info!(resource_id = %self.id, attempt, %state, "Converged");
                        }
                        return Ok(state);
                    }
                    last_state = Some(state);
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.settings.interval).await;
            }
        }

        let last_state = last_state.map(|s| s.to_string()).unwrap_or_default();
        warn!(
            resource_id = %self.id,
            attempts = max_attempts,
            last_state = %last_state,
            "Timed out waiting for convergence"
        );
        Err(Error::ConvergenceTimeout {
            id: self.id.to_string(),
            attempts: max_attempts,
            last_state,
        })
    }
}

/// Shorthand for `ConvergenceRequest::new(..).wait(fetch)`.
pub async fn await_state<S, F, Fut>(
    id: &str,
    fetch: F,
    terminal: &[S],
    settings: PollSettings,
) -> Result<S>
where
    S: Copy + PartialEq + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Observation<S>>>,
{
    ConvergenceRequest::new(id, terminal, settings)
        .wait(fetch)
        .await
}
