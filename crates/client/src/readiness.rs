//! Model readiness gate
//!
//! Before a request is issued the target model must be loaded. If the server
//! does not report it ready, a load is requested and readiness is polled until
//! it succeeds or the timeout elapses.

use crate::transport::Transport;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use trtllm_common::{Result, TrtLlmError, METRICS};
use tracing::{debug, info};

/// How long to wait for a model and how often to poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl ReadinessPolicy {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

/// Wait until `model` reports ready, loading it first if it is not
///
/// Fails with [`TrtLlmError::LoadTimeout`] once `policy.timeout` has elapsed
/// without the model becoming ready. Errors from the readiness and load calls
/// themselves are returned unchanged.
pub async fn wait_until_ready<T>(transport: &T, model: &str, policy: &ReadinessPolicy) -> Result<()>
where
    T: Transport + ?Sized,
{
    if transport.is_model_ready(model).await? {
        return Ok(());
    }

    info!("Model {} is not ready, requesting load via {}", model, transport.kind());
    let start = Instant::now();
    transport.load_model(model).await?;

    loop {
        if transport.is_model_ready(model).await? {
            let waited = start.elapsed();
            METRICS.client.model_ready_wait.observe(waited.as_secs_f64());
            info!("Model {} ready after {:?}", model, waited);
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return Err(TrtLlmError::load_timeout(model, policy.timeout));
        }

        let remaining = policy.timeout - elapsed;
        debug!("Model {} not ready yet, {:?} left", model, remaining);
        sleep(policy.poll_interval.min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedServer;

    fn policy(timeout_ms: u64) -> ReadinessPolicy {
        ReadinessPolicy::new(Duration::from_millis(timeout_ms), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_ready_model_skips_load() {
        let server = ScriptedServer::ready();
        wait_until_ready(&server, "ensemble", &policy(1000)).await.unwrap();
        assert_eq!(server.load_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_becomes_ready_after_load() {
        let server = ScriptedServer::ready_after_polls(5);
        wait_until_ready(&server, "ensemble", &policy(1000)).await.unwrap();
        assert_eq!(server.load_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_times_out_at_deadline() {
        let server = ScriptedServer::never_ready();
        let start = Instant::now();

        let err = wait_until_ready(&server, "ensemble", &policy(1000)).await.unwrap_err();
        let waited = start.elapsed();

        assert!(matches!(err, TrtLlmError::LoadTimeout { ref model, timeout }
            if model == "ensemble" && timeout == Duration::from_secs(1)));
        assert!(waited >= Duration::from_secs(1), "returned too early: {:?}", waited);
        assert!(waited < Duration::from_millis(1100), "returned too late: {:?}", waited);
        assert_eq!(server.load_calls(), 1);
    }

    #[tokio::test]
    async fn test_load_failure_is_returned() {
        let server = ScriptedServer::never_ready();
        server.fail_loads("model control disabled");

        let err = wait_until_ready(&server, "ensemble", &policy(1000)).await.unwrap_err();
        assert!(matches!(err, TrtLlmError::Server(_)));
    }
}
