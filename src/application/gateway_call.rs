use crate::config::EngineSettings;
use crate::domain::payment::GatewayOperation;
use crate::domain::processor::GatewayError;
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Timeout and retry rules applied to every outbound gateway call.
///
/// Each attempt gets its own timeout. Only transient failures are retried; a
/// timeout is returned as-is since the gateway may have acted on the request.
#[derive(Debug, Clone)]
pub struct GatewayCallPolicy {
    pub timeout: Duration,
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl GatewayCallPolicy {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            timeout: settings.gateway_timeout,
            max_retries: settings.max_gateway_retries,
            min_delay: settings.retry_min_delay,
            max_delay: settings.retry_max_delay,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }

    pub async fn call<T, F, Fut>(
        &self,
        operation: GatewayOperation,
        gateway: &str,
        call: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let limit = self.timeout;
        let attempt = || {
            let pending = call();
            async move {
                tokio::time::timeout(limit, pending)
                    .await
                    .unwrap_or(Err(GatewayError::Timeout(limit)))
            }
        };

        attempt
            .retry(self.backoff())
            .when(GatewayError::is_transient)
            .notify(|err, delay| {
                warn!(
                    gateway,
                    %operation,
                    error = %err,
                    retry_in = ?delay,
                    "Gateway call failed; retrying"
                );
            })
            .await
    }
}

impl Default for GatewayCallPolicy {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}
