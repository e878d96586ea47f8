use crate::error::{AttemptError, Result, ScanError};
use crate::session::Session;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bounds for one logical operation: `max_identities` identities, each tried
/// `retries_per_identity` times.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_identities: usize,
    pub retries_per_identity: usize,
    pub retry_wait: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_identities: usize, retries_per_identity: usize) -> Self {
        Self {
            max_identities: max_identities.max(1),
            retries_per_identity: retries_per_identity.max(1),
            retry_wait: Duration::from_secs(3),
            call_timeout: Duration::from_secs(30),
        }
    }

    /// Defaults for the session bootstrap requests.
    pub fn bootstrap() -> Self {
        Self::new(10, 3)
    }

    pub fn with_retry_wait(mut self, retry_wait: Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_identities * self.retries_per_identity
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bootstrap()
    }
}

/// Runs an outbound call until it succeeds, rotating the session's identity
/// between rounds of retries.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    policy: RetryPolicy,
}

impl Executor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Drive `call` through the retry loop.
    ///
    /// `call` receives the session's current client and is invoked at most
    /// `max_attempts()` times. `AttemptError::Fatal` stops the loop at once.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        session: &mut Session,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut(Client) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let policy = &self.policy;
        let mut attempts = 0;
        let mut last_error = String::from("no attempt made");

        for identity_attempt in 1..=policy.max_identities {
            if identity_attempt > 1 {
                info!(
                    "{}: rotating identity ({}/{})",
                    operation, identity_attempt, policy.max_identities
                );
                session.rotate_identity().await?;
            }

            for retry in 1..=policy.retries_per_identity {
                if retry > 1 && !policy.retry_wait.is_zero() {
                    tokio::time::sleep(policy.retry_wait).await;
                }
                attempts += 1;
                debug!(
                    "{}: attempt {} (identity {}, retry {})",
                    operation, attempts, identity_attempt, retry
                );

                let attempt = tokio::time::timeout(policy.call_timeout, call(session.client()));
                let outcome = match attempt.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(AttemptError::Timeout(policy.call_timeout)),
                };

                match outcome {
                    Ok(value) => {
                        if attempts > 1 {
                            info!("{}: succeeded after {} attempts", operation, attempts);
                        }
                        return Ok(value);
                    }
                    Err(AttemptError::Fatal(e)) => {
                        error!("{}: fatal error: {}", operation, e);
                        return Err(e);
                    }
                    Err(e) => {
                        if e.is_blocked() {
                            warn!(
                                "{}: blocked or rate limited ({}), identity {} retry {}",
                                operation, e, identity_attempt, retry
                            );
                        } else {
                            warn!(
                                "{}: attempt failed ({}), identity {} retry {}",
                                operation, e, identity_attempt, retry
                            );
                        }
                        last_error = e.to_string();
                    }
                }
            }
        }

        error!(
            "{}: giving up after {} attempts, last error: {}",
            operation, attempts, last_error
        );
        Err(ScanError::Exhausted {
            operation: operation.to_string(),
            attempts,
            last_error,
        })
    }
}

fn check_status(response: &Response) -> std::result::Result<(), AttemptError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(AttemptError::Status(status.as_u16()))
    }
}

pub async fn read_text(response: Response) -> std::result::Result<String, AttemptError> {
    check_status(&response)?;
    Ok(response.text().await?)
}

/// A body that fails to parse counts as a failed attempt, not a fatal error.
pub async fn read_json<T: DeserializeOwned>(
    response: Response,
) -> std::result::Result<T, AttemptError> {
    let body = read_text(response).await?;
    serde_json::from_str(&body).map_err(|e| AttemptError::Decode(e.to_string()))
}

pub async fn get_text(client: Client, url: String) -> std::result::Result<String, AttemptError> {
    let response = client.get(&url).send().await?;
    read_text(response).await
}
