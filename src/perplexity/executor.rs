//! Request executor
//!
//! Runs one upstream call per invocation, bounded by the configured timeout
//! and cancellable by the host, and classifies what happened into an
//! [`InvocationOutcome`].

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::perplexity::transport::{Transport, UpstreamRequest, UpstreamResponse};
use crate::perplexity::types::InvocationOutcome;

/// Executes `ask_perplexity` invocations against the upstream
pub struct RequestExecutor {
    /// Upstream transport
    transport: Arc<dyn Transport>,

    /// Shared configuration
    config: Arc<Config>,
}

impl RequestExecutor {
    /// Create a new executor
    pub fn new(transport: Arc<dyn Transport>, config: Arc<Config>) -> Self {
        Self { transport, config }
    }

    fn build_request(&self, arguments: Value) -> UpstreamRequest {
        UpstreamRequest {
            url: self.config.chat_completions_url(),
            bearer_token: self.config.api_key.clone().unwrap_or_default(),
            body: arguments,
        }
    }

    /// Run one invocation.
    ///
    /// The upstream call runs in its own task. Whichever of cancellation,
    /// response, or timeout is observed first decides the outcome, with
    /// cancellation checked first. On cancellation or timeout the task is
    /// aborted and awaited before returning, so no request outlives the call.
    pub async fn execute(&self, arguments: Value, cancel: CancellationToken) -> InvocationOutcome {
        let request = self.build_request(arguments);
        let timeout = self.config.request_timeout;
        tracing::debug!("Sending request to {}", request.url);

        let transport = Arc::clone(&self.transport);
        let mut task = tokio::spawn(async move { transport.send(request).await });
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                task.abort();
                let _ = (&mut task).await;
                InvocationOutcome::Cancelled
            }
            joined = &mut task => match joined {
                Ok(Ok(response)) => classify(response),
                Ok(Err(e)) => InvocationOutcome::UnexpectedError {
                    message: e.to_string(),
                },
                Err(e) => InvocationOutcome::UnexpectedError {
                    message: format!("request task failed: {}", e),
                },
            },
            _ = &mut deadline => {
                task.abort();
                let _ = (&mut task).await;
                InvocationOutcome::TimedOut { after: timeout }
            }
        };

        match &outcome {
            InvocationOutcome::Success(_) | InvocationOutcome::Cancelled => {
                tracing::info!("ask_perplexity finished: {}", outcome.kind());
            }
            InvocationOutcome::TimedOut { after } => {
                tracing::warn!("ask_perplexity timed out after {:?}", after);
            }
            InvocationOutcome::UpstreamError { message, .. }
            | InvocationOutcome::UnexpectedError { message } => {
                tracing::warn!("ask_perplexity failed ({}): {}", outcome.kind(), message);
            }
        }

        outcome
    }
}

/// Map a received response to an outcome; the body is never parsed
fn classify(response: UpstreamResponse) -> InvocationOutcome {
    if response.is_success() {
        InvocationOutcome::Success(response.body)
    } else {
        let message = response.status_line();
        let body = Some(response.body).filter(|b| !b.is_empty());
        InvocationOutcome::UpstreamError { message, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::perplexity::transport::TransportError;

    /// Flags when the in-flight future is dropped, i.e. aborted or finished
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    enum Reply {
        Response(u16, &'static str),
        ConnectError,
    }

    struct StubTransport {
        calls: AtomicUsize,
        delay: Duration,
        reply: Reply,
        completed: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
        seen: std::sync::Mutex<Option<UpstreamRequest>>,
    }

    impl StubTransport {
        fn new(delay: Duration, reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                reply,
                completed: Arc::new(AtomicBool::new(false)),
                dropped: Arc::new(AtomicBool::new(false)),
                seen: std::sync::Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn send(
            &self,
            request: UpstreamRequest,
        ) -> std::result::Result<UpstreamResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen.lock().unwrap() = Some(request);
            let _guard = DropFlag(self.dropped.clone());

            tokio::time::sleep(self.delay).await;
            self.completed.store(true, Ordering::SeqCst);

            match self.reply {
                Reply::Response(status, body) => Ok(UpstreamResponse {
                    status,
                    reason: None,
                    body: body.to_string(),
                }),
                Reply::ConnectError => Err(TransportError::Connect {
                    attempts: 3,
                    message: "dns error: no such host".to_string(),
                }),
            }
        }
    }

    fn executor(stub: Arc<StubTransport>) -> RequestExecutor {
        let config = Config::default().with_api_key("test-key");
        RequestExecutor::new(stub, Arc::new(config))
    }

    fn args() -> Value {
        json!({
            "model": "llama-3.1-sonar-small-128k-online",
            "messages": [{"role": "user", "content": "Why is the sky blue?"}]
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_passes_body_through() {
        let body = r#"{"id":"x",  "choices":[]}"#;
        let stub = StubTransport::new(Duration::from_secs(1), Reply::Response(200, body));
        let outcome = executor(stub.clone())
            .execute(args(), CancellationToken::new())
            .await;

        assert_eq!(outcome, InvocationOutcome::Success(body.to_string()));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_carries_arguments_and_credential() {
        let stub = StubTransport::new(Duration::ZERO, Reply::Response(200, "{}"));
        executor(stub.clone())
            .execute(args(), CancellationToken::new())
            .await;

        let seen = stub.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.url, "https://api.perplexity.ai/chat/completions");
        assert_eq!(seen.bearer_token, "test-key");
        assert_eq!(seen.body, args());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_success_status_is_upstream_error() {
        let stub = StubTransport::new(
            Duration::ZERO,
            Reply::Response(401, r#"{"error":"bad key"}"#),
        );
        let outcome = executor(stub)
            .execute(args(), CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            InvocationOutcome::UpstreamError {
                message: "HTTP 401".to_string(),
                body: Some(r#"{"error":"bad key"}"#.to_string()),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_error_body_is_omitted() {
        let stub = StubTransport::new(Duration::ZERO, Reply::Response(503, ""));
        let outcome = executor(stub)
            .execute(args(), CancellationToken::new())
            .await;

        assert!(matches!(
            outcome,
            InvocationOutcome::UpstreamError { body: None, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_is_unexpected_error() {
        let stub = StubTransport::new(Duration::ZERO, Reply::ConnectError);
        let outcome = executor(stub)
            .execute(args(), CancellationToken::new())
            .await;

        match outcome {
            InvocationOutcome::UnexpectedError { message } => {
                assert!(message.contains("no such host"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_in_flight_request() {
        let stub = StubTransport::new(Duration::from_secs(120), Reply::Response(200, "{}"));
        let outcome = executor(stub.clone())
            .execute(args(), CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            InvocationOutcome::TimedOut {
                after: Duration::from_secs(60)
            }
        );
        assert!(stub.dropped.load(Ordering::SeqCst));
        assert!(!stub.completed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_response() {
        let stub = StubTransport::new(Duration::from_secs(10), Reply::Response(200, "{}"));
        let executor = executor(stub.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let outcome = executor.execute(args(), cancel).await;
        assert_eq!(outcome, InvocationOutcome::Cancelled);
        assert!(stub.dropped.load(Ordering::SeqCst));

        // The stubbed response would have landed by now; it must never arrive.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!stub.completed.load(Ordering::SeqCst));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_wins_over_ready_response() {
        let stub = StubTransport::new(Duration::ZERO, Reply::Response(200, "{}"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = executor(stub).execute(args(), cancel).await;
        assert_eq!(outcome, InvocationOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_invocations_are_independent() {
        let slow = StubTransport::new(Duration::from_secs(90), Reply::Response(200, "slow"));
        let fast = StubTransport::new(Duration::from_secs(5), Reply::Response(200, "fast"));
        let slow_exec = executor(slow);
        let fast_exec = executor(fast);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let untouched = CancellationToken::new();

        let (a, b, c) = tokio::join!(
            slow_exec.execute(args(), CancellationToken::new()),
            fast_exec.execute(args(), untouched),
            fast_exec.execute(args(), cancelled),
        );

        assert!(matches!(a, InvocationOutcome::TimedOut { .. }));
        assert_eq!(b, InvocationOutcome::Success("fast".to_string()));
        assert_eq!(c, InvocationOutcome::Cancelled);
    }
}
