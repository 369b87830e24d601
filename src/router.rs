//! Priority-ordered provider routing behind per-provider circuit breakers.
//!
//! For each call the router walks the provider list once:
//!
//! 1. Ask the provider's breaker for admission. A rejected provider is
//!    skipped without any network traffic.
//! 2. Invoke the first admitted provider under its per-call timeout.
//! 3. On failure record it and move to the next provider. The same provider
//!    is never retried within one call.
//!
//! When nothing could be admitted, or every admitted provider failed, the
//! call fails with [`RouteError::AllProvidersUnavailable`] straight away.
//!
//! Provider calls run on their own task. If the caller is dropped (a client
//! hung up), the call still finishes and its outcome still reaches the
//! breaker.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::breaker::{Admission, BreakerConfig, BreakerHandle, BreakerStatus};
use crate::config::ProviderConfig;
use crate::error::{ProviderAttempt, ProviderError, RouteError};
use crate::llm::{create_provider, Completion, CompletionProvider, Prompt};

/// One provider and the breaker guarding it.
#[derive(Clone)]
pub struct Route {
    provider: Arc<dyn CompletionProvider>,
    breaker: BreakerHandle,
    timeout: Duration,
}

impl Route {
    pub fn new(provider: Arc<dyn CompletionProvider>, breaker: BreakerConfig, timeout: Duration) -> Self {
        let breaker = BreakerHandle::new(provider.name(), breaker);
        Self {
            provider,
            breaker,
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }
}

/// A successful routed completion.
#[derive(Debug, Clone)]
pub struct Routed {
    pub completion: Completion,
    /// Provider that produced `completion`.
    pub provider: String,
    /// Providers skipped or failed before it, in order.
    pub skipped: Vec<ProviderAttempt>,
}

pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// `routes` is in priority order.
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Build one route per `[[providers]]` entry, keeping file order.
    pub fn from_config(providers: &[ProviderConfig]) -> Result<Self> {
        let routes = providers
            .iter()
            .map(|p| Ok(Route::new(create_provider(p)?, BreakerConfig::from(p), p.timeout())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(routes))
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.name().to_string()).collect()
    }

    pub fn breaker(&self, name: &str) -> Option<&BreakerHandle> {
        self.routes
            .iter()
            .find(|r| r.name() == name)
            .map(|r| &r.breaker)
    }

    pub fn status(&self) -> Vec<BreakerStatus> {
        self.routes.iter().map(|r| r.breaker.status()).collect()
    }

    pub async fn complete(&self, prompt: Arc<Prompt>) -> Result<Routed, RouteError> {
        let mut attempts = Vec::new();

        for route in &self.routes {
            let admission = route.breaker.admit();
            if !admission.is_allowed() {
                debug!(provider = route.name(), "circuit open; skipping provider");
                attempts.push(ProviderAttempt {
                    provider: route.name().to_string(),
                    error: ProviderError::Unavailable,
                });
                continue;
            }

            let call = tokio::spawn(invoke(route.clone(), Arc::clone(&prompt), admission));
            let outcome = match call.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(ProviderError::Transport(format!(
                    "provider task failed: {}",
                    join_err
                ))),
            };

            match outcome {
                Ok(completion) => {
                    return Ok(Routed {
                        completion,
                        provider: route.name().to_string(),
                        skipped: attempts,
                    })
                }
                Err(error) => {
                    warn!(provider = route.name(), %error, "provider call failed; trying next");
                    attempts.push(ProviderAttempt {
                        provider: route.name().to_string(),
                        error,
                    });
                }
            }
        }

        Err(RouteError::AllProvidersUnavailable { attempts })
    }
}

/// Run one provider call and report the outcome to its breaker.
async fn invoke(route: Route, prompt: Arc<Prompt>, admission: Admission) -> Result<Completion, ProviderError> {
    let result = match tokio::time::timeout(route.timeout, route.provider.complete(&prompt)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(route.timeout)),
    };

    match &result {
        Ok(_) => route.breaker.record_success(admission),
        Err(e) if e.counts_toward_breaker() => route.breaker.record_failure(admission),
        Err(_) => route.breaker.record_neutral(admission),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::llm::MockProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and fails while `failing` is set.
    struct Scripted {
        name: String,
        calls: AtomicUsize,
        failing: std::sync::atomic::AtomicBool,
        error: ProviderError,
    }

    impl Scripted {
        fn new(name: &str, failing: bool) -> Arc<Self> {
            Self::with_error(name, failing, ProviderError::Transport("boom".into()))
        }

        fn with_error(name: &str, failing: bool, error: ProviderError) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                calls: AtomicUsize::new(0),
                failing: std::sync::atomic::AtomicBool::new(failing),
                error,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionProvider for Scripted {
        fn name(&self) -> &str {
            &self.name
        }
        async fn complete(&self, _prompt: &Prompt) -> Result<Completion, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(self.error.clone());
            }
            Ok(Completion {
                text: format!("from {}", self.name),
                tokens_in: 1,
                tokens_out: 2,
            })
        }
    }

    fn route(p: Arc<dyn CompletionProvider>, threshold: u32, reset_secs: u64) -> Route {
        Route::new(
            p,
            BreakerConfig::new(threshold, Duration::from_secs(reset_secs)),
            Duration::from_secs(5),
        )
    }

    fn prompt() -> Arc<Prompt> {
        Arc::new(Prompt::new("q", Vec::new()))
    }

    #[tokio::test]
    async fn test_primary_serves_when_healthy() {
        let primary = Scripted::new("primary", false);
        let fallback = Scripted::new("fallback", false);
        let router = Router::new(vec![route(primary.clone(), 3, 30), route(fallback.clone(), 3, 30)]);

        let routed = router.complete(prompt()).await.unwrap();
        assert_eq!(routed.provider, "primary");
        assert!(routed.skipped.is_empty());
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_failure_falls_through_without_same_provider_retry() {
        let primary = Scripted::new("primary", true);
        let fallback = Scripted::new("fallback", false);
        let router = Router::new(vec![route(primary.clone(), 3, 30), route(fallback.clone(), 3, 30)]);

        let routed = router.complete(prompt()).await.unwrap();
        assert_eq!(routed.provider, "fallback");
        assert_eq!(routed.completion.text, "from fallback");
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn test_open_primary_is_skipped_without_a_call() {
        let primary = Scripted::new("primary", true);
        let fallback = Scripted::new("fallback", false);
        let router = Router::new(vec![route(primary.clone(), 3, 30), route(fallback.clone(), 3, 30)]);

        for _ in 0..3 {
            router.complete(prompt()).await.unwrap();
        }
        assert_eq!(router.breaker("primary").unwrap().status().state, BreakerState::Open);
        assert_eq!(primary.calls(), 3);

        let routed = router.complete(prompt()).await.unwrap();
        assert_eq!(routed.provider, "fallback");
        assert_eq!(primary.calls(), 3, "open circuit must short-circuit");
        assert_eq!(routed.skipped[0].error, ProviderError::Unavailable);
    }

    #[tokio::test]
    async fn test_all_open_fails_immediately() {
        let a = Scripted::new("a", true);
        let b = Scripted::new("b", true);
        let router = Router::new(vec![route(a.clone(), 1, 3600), route(b.clone(), 1, 3600)]);

        assert!(router.complete(prompt()).await.is_err());
        let started = std::time::Instant::now();
        let err = router.complete(prompt()).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(100));

        let RouteError::AllProvidersUnavailable { attempts } = err;
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| a.error == ProviderError::Unavailable));
        assert_eq!((a.calls(), b.calls()), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let slow: Arc<dyn CompletionProvider> =
            Arc::new(MockProvider::new("slow").with_latency(Duration::from_secs(10)));
        let router = Router::new(vec![Route::new(
            slow,
            BreakerConfig::new(1, Duration::from_secs(30)),
            Duration::from_secs(1),
        )]);

        let RouteError::AllProvidersUnavailable { attempts } =
            router.complete(prompt()).await.unwrap_err();
        assert_eq!(attempts[0].error, ProviderError::Timeout(Duration::from_secs(1)));
        assert_eq!(router.breaker("slow").unwrap().status().state, BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_recovers_primary() {
        let primary = Scripted::new("primary", true);
        let fallback = Scripted::new("fallback", false);
        let router = Router::new(vec![route(primary.clone(), 3, 30), route(fallback.clone(), 3, 30)]);
        for _ in 0..3 {
            router.complete(prompt()).await.unwrap();
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        router.complete(prompt()).await.unwrap();
        assert_eq!(primary.calls(), 3);

        primary.failing.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(20)).await;
        let routed = router.complete(prompt()).await.unwrap();
        assert_eq!(routed.provider, "primary");
        assert_eq!(primary.calls(), 4);
        assert_eq!(router.breaker("primary").unwrap().status().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_auth_errors_do_not_trip_breaker() {
        let primary = Scripted::with_error("primary", true, ProviderError::Auth("401".into()));
        let fallback = Scripted::new("fallback", false);
        let router = Router::new(vec![route(primary.clone(), 1, 30), route(fallback, 1, 30)]);

        for _ in 0..3 {
            assert_eq!(router.complete(prompt()).await.unwrap().provider, "fallback");
        }
        assert_eq!(primary.calls(), 3);
        assert_eq!(router.breaker("primary").unwrap().status().state, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_caller_still_updates_breaker() {
        let slow: Arc<dyn CompletionProvider> = Arc::new(
            MockProvider::failing("slow").with_latency(Duration::from_millis(500)),
        );
        let router = Arc::new(Router::new(vec![Route::new(
            slow,
            BreakerConfig::new(1, Duration::from_secs(30)),
            Duration::from_secs(5),
        )]));

        let caller = {
            let router = router.clone();
            tokio::spawn(async move { router.complete(prompt()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(router.breaker("slow").unwrap().status().state, BreakerState::Open);
    }
}
