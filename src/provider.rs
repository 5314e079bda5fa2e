//! ProviderWrapper (C5) — a transparent rate-limit-aware `Provider`
//! decorator, per `spec.md` §4.5.
//!
//! `spec.md` §1/§6 treat the concrete provider-call shape
//! (`callApi(prompt, context, options) -> { output?, error?, metadata?,
//! tokenUsage?, sessionId? }`) as the one fixed point of an otherwise
//! duck-typed interface, so it's rendered here as a concrete
//! [`ProviderRequest`]/[`ProviderResponse`] pair rather than left generic —
//! that's also what makes the wrapper object-safe, which idempotent
//! wrapping (`spec.md` §8 property 11) needs: `Provider` is a trait object
//! (`Arc<dyn Provider>`), and `wrap` downcasts via `std::any::Any` to
//! detect an already-wrapped instance and hand the same `Arc` back instead
//! of stacking a second layer — the Rust rendering of "carries a sentinel
//! marker" from `spec.md` §4.5, since there's no dynamic property bag to
//! stash a marker on.

use crate::assertion::TokenUsage;
use crate::error::ClassifiedError;
use crate::rate_limit::{Extractors, ProviderId, RateLimitRegistry};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// `callApi(prompt, context, options)`'s arguments, per `spec.md` §6.
/// Prompt rendering and the shape of `options`/`vars` stay a caller
/// concern (`spec.md` §1); this crate only needs something to route.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub prompt: String,
    pub vars: serde_json::Map<String, serde_json::Value>,
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// `response.metadata.http.{status, statusText, headers}` from `spec.md`
/// §4.5/§6. Headers are stored already lowercased, matching "read
/// case-insensitively" in §4.5.
#[derive(Debug, Clone, Default)]
pub struct HttpMetadata {
    pub status: Option<u16>,
    pub status_text: Option<String>,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata {
    pub http: Option<HttpMetadata>,
}

/// `{ output?, error?, metadata?, tokenUsage?, sessionId? }` from
/// `spec.md` §6. `error` here is a field on an otherwise-successful
/// response (e.g. a 200 body describing a model refusal) — distinct from
/// a thrown transport error, which surfaces as `Err(ProviderError)`.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metadata: Option<ResponseMetadata>,
    pub token_usage: Option<TokenUsage>,
    pub session_id: Option<String>,
}

/// A thrown transport failure — the provider's `callApi` never returned,
/// it raised. Separate from `ProviderResponse.error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub message: String,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

impl From<crate::error::SlotQueueError> for ProviderError {
    fn from(err: crate::error::SlotQueueError) -> Self {
        ProviderError {
            message: err.to_string(),
        }
    }
}

const RATE_LIMIT_INDICATORS: &[&str] = &["429", "rate limit", "too many requests"];

fn text_indicates_rate_limit(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_INDICATORS.iter().any(|m| lower.contains(m))
}

/// Whatever a caller's transport layer produces for a single prompt call.
/// `id()`/`label()` are the identity surface `spec.md` §6 requires every
/// provider to expose; `call_api` is the one call path the wrapper
/// intercepts. `as_any` backs the idempotent-wrap check below.
#[async_trait]
pub trait Provider: Any + Send + Sync {
    fn id(&self) -> &str;

    fn label(&self) -> Option<&str> {
        None
    }

    async fn call_api(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    fn as_any(&self) -> &dyn Any;
}

/// Wraps a [`Provider`], delegating `id`/`label` and routing `call_api`
/// through a [`RateLimitRegistry`] so concurrency/quota admission and
/// retry apply transparently — `spec.md` §4.5's "transparently
/// intercepting provider calls".
pub struct WrappedProvider {
    inner: Arc<dyn Provider>,
    registry: Arc<RateLimitRegistry>,
    retry_policy: RetryPolicy,
}

impl WrappedProvider {
    fn provider_id(&self) -> ProviderId {
        match self.inner.label() {
            Some(label) => ProviderId::with_label(self.inner.id(), label),
            None => ProviderId::new(self.inner.id()),
        }
    }

    /// The underlying provider this wrapper delegates to — for callers
    /// that need to reach a method beyond the `Provider` surface, mirroring
    /// `spec.md` §4.5's "delegate unknown operations back to the
    /// underlying instance" via an explicit accessor (Rust has no
    /// catch-all proxy).
    pub fn inner(&self) -> &Arc<dyn Provider> {
        &self.inner
    }
}

/// Wraps `provider` so its calls route through `registry` under
/// `retry_policy`. Idempotent: if `provider` is already a
/// [`WrappedProvider`] (checked via `Any`, since there is no runtime
/// marker property to test for directly), the same `Arc` is returned
/// unchanged rather than nesting a second wrapper — `spec.md` §8
/// property 11.
pub fn wrap(
    provider: Arc<dyn Provider>,
    registry: Arc<RateLimitRegistry>,
    retry_policy: RetryPolicy,
) -> Arc<dyn Provider> {
    if provider.as_any().downcast_ref::<WrappedProvider>().is_some() {
        return provider;
    }
    Arc::new(WrappedProvider {
        inner: provider,
        registry,
        retry_policy,
    })
}

#[async_trait]
impl Provider for WrappedProvider {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn label(&self) -> Option<&str> {
        self.inner.label()
    }

    async fn call_api(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let provider_id = self.provider_id();
        let inner = Arc::clone(&self.inner);

        self.registry
            .execute(&provider_id, &self.retry_policy, &DefaultExtractors, move || {
                let inner = Arc::clone(&inner);
                let request = request.clone();
                async move { inner.call_api(request).await }
            })
            .await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The extractor set `spec.md` §4.5 prescribes for the generic `Provider`
/// shape: headers from `response.metadata.http.headers`, rate-limit
/// detection from the HTTP status or text indicators, and `retry-after`
/// parsed from the same header map.
struct DefaultExtractors;

impl Extractors<ProviderResponse, ProviderError> for DefaultExtractors {
    fn get_headers(&self, response: &ProviderResponse) -> HashMap<String, String> {
        response
            .metadata
            .as_ref()
            .and_then(|m| m.http.as_ref())
            .map(|http| http.headers.clone())
            .unwrap_or_default()
    }

    fn is_rate_limited_response(&self, response: &ProviderResponse) -> bool {
        let http_429 = response
            .metadata
            .as_ref()
            .and_then(|m| m.http.as_ref())
            .and_then(|http| http.status)
            == Some(429);
        if http_429 {
            return true;
        }
        response
            .error
            .as_deref()
            .map(text_indicates_rate_limit)
            .unwrap_or(false)
    }

    fn get_retry_after_response(&self, response: &ProviderResponse) -> Option<i64> {
        let headers = self.get_headers(response);
        headers
            .get("retry-after")
            .and_then(|v| crate::headers::parse_retry_after(v))
            .map(|ms| ms as i64)
    }

    fn classify_error(&self, error: &ProviderError) -> ClassifiedError {
        let classified = ClassifiedError::new(error.message.clone());
        if text_indicates_rate_limit(&error.message) {
            classified.rate_limited()
        } else {
            classified
        }
    }

    fn get_retry_after_error(&self, _error: &ProviderError) -> Option<i64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::SlotQueueConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Echo {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Provider for Echo {
        fn id(&self) -> &str {
            "echo"
        }

        async fn call_api(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderResponse {
                output: Some(serde_json::json!(request.prompt)),
                ..Default::default()
            })
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn registry() -> Arc<RateLimitRegistry> {
        Arc::new(RateLimitRegistry::new(SlotQueueConfig::default()))
    }

    #[tokio::test]
    async fn delegates_id_and_call() {
        let echo = Arc::new(Echo {
            calls: AtomicU32::new(0),
        });
        let wrapped = wrap(echo, registry(), RetryPolicy::default());
        assert_eq!(wrapped.id(), "echo");
        assert_eq!(wrapped.label(), None);

        let res = wrapped
            .call_api(ProviderRequest {
                prompt: "hi".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(res.output, Some(serde_json::json!("hi")));
    }

    /// `spec.md` §8 property 11 — re-wrapping returns the same instance.
    #[tokio::test]
    async fn re_wrapping_is_idempotent() {
        let echo = Arc::new(Echo {
            calls: AtomicU32::new(0),
        });
        let reg = registry();
        let policy = RetryPolicy::default();
        let once = wrap(echo, Arc::clone(&reg), policy);
        let twice = wrap(Arc::clone(&once), Arc::clone(&reg), policy);
        assert!(Arc::ptr_eq(&once, &twice));
    }

    #[tokio::test]
    async fn retries_on_rate_limited_response_then_succeeds() {
        struct Flaky {
            calls: AtomicU32,
        }
        #[async_trait]
        impl Provider for Flaky {
            fn id(&self) -> &str {
                "flaky"
            }
            async fn call_api(
                &self,
                _request: ProviderRequest,
            ) -> Result<ProviderResponse, ProviderError> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Ok(ProviderResponse {
                        metadata: Some(ResponseMetadata {
                            http: Some(HttpMetadata {
                                status: Some(429),
                                status_text: None,
                                headers: HashMap::new(),
                            }),
                        }),
                        ..Default::default()
                    })
                } else {
                    Ok(ProviderResponse {
                        output: Some(serde_json::json!("ok")),
                        ..Default::default()
                    })
                }
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
        });
        let policy = RetryPolicy::new(3, 1, 5, 0.0);
        let wrapped = wrap(flaky, registry(), policy);
        let res = wrapped
            .call_api(ProviderRequest::default())
            .await
            .unwrap();
        assert_eq!(res.output, Some(serde_json::json!("ok")));
    }
}
