//! Retry and token renewal around remote calls.
//!
//! Stage code never retries on its own; every remote call made by the HTTP
//! adapters goes through [`call_with_renewal`] so that expired tokens and
//! transient connectivity problems are handled in one place.

use std::future::Future;
use std::time::Duration;

use super::ClientError;

/// Retry policy for remote calls.
#[derive(Debug, Clone, derive_new::new)]
pub struct RetryPolicy {
    /// Maximal number of retries on connectivity errors.
    pub max_retries: u32,
    /// Backoff before the first retry; doubled on each further retry.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// Run `op`, renewing credentials via `renew` once on an authorization error
/// and retrying connectivity errors with exponential backoff.
///
/// Any other error is returned unchanged.
pub async fn call_with_renewal<T, Op, Fut, Renew, RenewFut>(
    policy: &RetryPolicy,
    renew: Renew,
    op: Op,
) -> Result<T, ClientError>
where
    Op: Fn() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
    Renew: Fn() -> RenewFut,
    RenewFut: Future<Output = Result<(), ClientError>>,
{
    let mut renewed = false;
    let mut attempt = 0u32;
    let mut backoff = policy.initial_backoff;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(ClientError::Auth(message)) if !renewed => {
                tracing::info!("renewing access token after auth failure: {}", &message);
                renew().await?;
                renewed = true;
            }
            Err(ClientError::Connect(e)) if attempt < policy.max_retries => {
                attempt += 1;
                tracing::warn!(
                    "connectivity problem (attempt {}/{}), retrying in {:?}: {}",
                    attempt,
                    policy.max_retries,
                    backoff,
                    &e
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}
