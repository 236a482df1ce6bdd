//! Error boundaries: named failure isolation with retry and fallback.
//!
//! A boundary wraps an operation, retries it a configured number of
//! times, and on final failure substitutes a caller-supplied fallback
//! value (typically a degraded response) while recording metrics and
//! an enriched error context. With `rethrow` the original error also
//! propagates after the fallback runs, so an outer boundary can
//! observe the same failure with its own context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{CellStoreError, Result, ValidationError};
use crate::types::Timestamp;

/// Caller-supplied context for one wrapped call.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    /// Logical operation name.
    pub operation: Option<String>,
    /// Request identifier or description.
    pub request: Option<String>,
    /// Arbitrary extra context.
    pub metadata: Option<Value>,
}

/// Context handed to `on_error` and the fallback.
///
/// Merges the caller's [`CallContext`] with what the boundary knows.
#[derive(Clone, Debug)]
pub struct ErrorContext {
    /// Name of the boundary that caught the error.
    pub boundary_name: String,
    /// When the final failure was observed.
    pub timestamp: Timestamp,
    /// Stack captured at catch time.
    pub stack: String,
    /// Caller's operation name.
    pub operation: Option<String>,
    /// Caller's request identifier.
    pub request: Option<String>,
    /// Caller's extra context.
    pub metadata: Option<Value>,
}

/// Boundary metrics snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundaryMetrics {
    /// Wrapped calls that exhausted retries.
    pub error_count: u64,
    /// Fallback values produced.
    pub fallback_count: u64,
    /// Calls that failed at least once and then succeeded on retry.
    pub recovery_count: u64,
    /// Most recent final failure.
    pub last_error_at: Option<Timestamp>,
    /// `error_count / total wrapped calls`, 0.0 before any call.
    pub error_rate: f64,
}

#[derive(Debug, Default)]
struct MetricsInner {
    errors: u64,
    fallbacks: u64,
    recoveries: u64,
    invocations: u64,
    last_error_at: Option<Timestamp>,
}

type Fallback<T> = Box<dyn Fn(&CellStoreError, &ErrorContext) -> T + Send + Sync>;
type OnError = Box<dyn Fn(&CellStoreError, &ErrorContext) + Send + Sync>;

/// A named retry + fallback scope producing `T`.
pub struct ErrorBoundary<T> {
    name: String,
    fallback: Fallback<T>,
    on_error: Option<OnError>,
    rethrow: bool,
    max_retries: u32,
    retry_delay_ms: u64,
    error_state: AtomicBool,
    metrics: Mutex<MetricsInner>,
}

impl<T> std::fmt::Debug for ErrorBoundary<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorBoundary")
            .field("name", &self.name)
            .field("rethrow", &self.rethrow)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl<T> ErrorBoundary<T> {
    /// Creates a boundary.
    ///
    /// # Errors
    /// Rejects an empty name. (The fallback is required by
    /// construction.)
    pub fn new(
        name: impl Into<String>,
        fallback: impl Fn(&CellStoreError, &ErrorContext) -> T + Send + Sync + 'static,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::required_field("name").into());
        }
        Ok(Self {
            name,
            fallback: Box::new(fallback),
            on_error: None,
            rethrow: false,
            max_retries: 0,
            retry_delay_ms: 0,
            error_state: AtomicBool::new(false),
            metrics: Mutex::new(MetricsInner::default()),
        })
    }

    /// Installs an error observer, called before the fallback.
    pub fn on_error(
        mut self,
        observer: impl Fn(&CellStoreError, &ErrorContext) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(observer));
        self
    }

    /// Rethrows the original error after the fallback runs so an outer
    /// boundary also observes it.
    pub fn rethrow(mut self) -> Self {
        self.rethrow = true;
        self
    }

    /// Extra attempts after the first failure.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Fixed delay between attempts.
    pub fn retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    /// The boundary's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `op` under the boundary.
    ///
    /// On success returns the operation's value. On final failure the
    /// fallback value is returned as `Ok` - unless `rethrow` is set,
    /// in which case the original error is returned after the fallback
    /// (and `on_error`) have run.
    pub fn wrap(
        &self,
        mut op: impl FnMut() -> Result<T>,
        ctx: Option<CallContext>,
    ) -> Result<T> {
        self.metrics.lock().unwrap().invocations += 1;

        let mut attempt: u32 = 0;
        let error = loop {
            match op() {
                Ok(value) => {
                    if attempt > 0 {
                        self.metrics.lock().unwrap().recoveries += 1;
                        debug!(boundary = %self.name, attempt, "Recovered on retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if attempt < self.max_retries {
                        attempt += 1;
                        if self.retry_delay_ms > 0 {
                            std::thread::sleep(Duration::from_millis(self.retry_delay_ms));
                        }
                        continue;
                    }
                    break err;
                }
            }
        };

        self.error_state.store(true, Ordering::Release);
        {
            let mut metrics = self.metrics.lock().unwrap();
            metrics.errors += 1;
            metrics.fallbacks += 1;
            metrics.last_error_at = Some(Timestamp::now());
        }

        let enriched = self.enrich(ctx);
        warn!(boundary = %self.name, error = %error, "Boundary caught error");
        if let Some(observer) = &self.on_error {
            observer(&error, &enriched);
        }
        let fallback_value = (self.fallback)(&error, &enriched);

        if self.rethrow {
            // The fallback already ran; hand the original error up
            drop(fallback_value);
            return Err(error);
        }
        Ok(fallback_value)
    }

    /// Whether the boundary has caught an error since the last clear.
    pub fn is_in_error_state(&self) -> bool {
        self.error_state.load(Ordering::Acquire)
    }

    /// Clears the latched error state.
    pub fn clear_error_state(&self) {
        self.error_state.store(false, Ordering::Release);
    }

    /// Returns the metrics snapshot.
    pub fn metrics(&self) -> BoundaryMetrics {
        let metrics = self.metrics.lock().unwrap();
        BoundaryMetrics {
            error_count: metrics.errors,
            fallback_count: metrics.fallbacks,
            recovery_count: metrics.recoveries,
            last_error_at: metrics.last_error_at,
            error_rate: if metrics.invocations == 0 {
                0.0
            } else {
                metrics.errors as f64 / metrics.invocations as f64
            },
        }
    }

    /// Zeroes all metrics.
    pub fn reset_metrics(&self) {
        *self.metrics.lock().unwrap() = MetricsInner::default();
    }

    fn enrich(&self, ctx: Option<CallContext>) -> ErrorContext {
        let ctx = ctx.unwrap_or_default();
        ErrorContext {
            boundary_name: self.name.clone(),
            timestamp: Timestamp::now(),
            stack: std::backtrace::Backtrace::force_capture().to_string(),
            operation: ctx.operation,
            request: ctx.request,
            metadata: ctx.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn storage_err<T>() -> Result<T> {
        Err(StorageError::transaction("boom"))?
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = ErrorBoundary::<i32>::new("", |_, _| 0);
        assert!(result.unwrap_err().is_validation());
    }

    #[test]
    fn test_success_passes_through() {
        let boundary = ErrorBoundary::new("b", |_, _| -1).unwrap();
        let value = boundary.wrap(|| Ok(42), None).unwrap();
        assert_eq!(value, 42);
        assert!(!boundary.is_in_error_state());
        assert_eq!(boundary.metrics().error_count, 0);
    }

    #[test]
    fn test_failure_returns_fallback() {
        let boundary = ErrorBoundary::new("b", |_, _| -1).unwrap();
        let value = boundary.wrap(|| storage_err::<i32>(), None).unwrap();
        assert_eq!(value, -1);
        assert!(boundary.is_in_error_state());

        let metrics = boundary.metrics();
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.fallback_count, 1);
        assert!(metrics.last_error_at.is_some());
        assert!((metrics.error_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retries_then_recovers() {
        let boundary = ErrorBoundary::new("b", |_, _| -1)
            .unwrap()
            .max_retries(2);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let value = boundary
            .wrap(
                move || {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        storage_err()
                    } else {
                        Ok(7)
                    }
                },
                None,
            )
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let metrics = boundary.metrics();
        assert_eq!(metrics.recovery_count, 1);
        assert_eq!(metrics.error_count, 0);
    }

    #[test]
    fn test_retries_exhausted_falls_back() {
        let boundary = ErrorBoundary::new("b", |_, _| -1)
            .unwrap()
            .max_retries(2);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let value = boundary
            .wrap(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    storage_err::<i32>()
                },
                None,
            )
            .unwrap();
        assert_eq!(value, -1);
        // 1 initial + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_on_error_sees_original_error_and_context() {
        let seen = Arc::new(Mutex::new(None::<(String, String)>));
        let sink = Arc::clone(&seen);
        let boundary = ErrorBoundary::new("payments", move |_, _| ())
            .unwrap()
            .on_error(move |error, ctx| {
                *sink.lock().unwrap() =
                    Some((error.to_string(), ctx.boundary_name.clone()));
            });

        boundary
            .wrap(
                || storage_err::<()>(),
                Some(CallContext {
                    operation: Some("charge".to_string()),
                    ..Default::default()
                }),
            )
            .unwrap();

        let (error, name) = seen.lock().unwrap().clone().unwrap();
        // Original error identity survives into the observer
        assert!(error.contains("boom"));
        assert_eq!(name, "payments");
    }

    #[test]
    fn test_context_enrichment() {
        let captured = Arc::new(Mutex::new(None::<ErrorContext>));
        let sink = Arc::clone(&captured);
        let boundary = ErrorBoundary::new("api", move |_, ctx: &ErrorContext| {
            *sink.lock().unwrap() = Some(ctx.clone());
            "degraded"
        })
        .unwrap();

        boundary
            .wrap(
                || storage_err::<&str>(),
                Some(CallContext {
                    operation: Some("list".to_string()),
                    request: Some("GET /things".to_string()),
                    metadata: Some(serde_json::json!({ "tenant": "a" })),
                }),
            )
            .unwrap();

        let ctx = captured.lock().unwrap().clone().unwrap();
        assert_eq!(ctx.boundary_name, "api");
        assert_eq!(ctx.operation.as_deref(), Some("list"));
        assert_eq!(ctx.request.as_deref(), Some("GET /things"));
        assert!(!ctx.stack.is_empty());
        assert!(ctx.timestamp.as_millis() > 0);
    }

    #[test]
    fn test_rethrow_fires_fallback_then_errors() {
        let fallback_ran = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fallback_ran);
        let boundary = ErrorBoundary::new("inner", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
        .rethrow();

        let result = boundary.wrap(|| storage_err::<()>(), None);
        assert!(result.is_err());
        assert_eq!(fallback_ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_boundary_absorbs_without_rethrow() {
        let inner = ErrorBoundary::new("inner", |_, _| 0).unwrap();
        let outer = ErrorBoundary::new("outer", |_, _| -1).unwrap();

        let value = outer
            .wrap(|| inner.wrap(|| storage_err::<i32>(), None), None)
            .unwrap();
        // Inner absorbed the failure; outer saw success
        assert_eq!(value, 0);
        assert_eq!(outer.metrics().error_count, 0);
        assert_eq!(inner.metrics().error_count, 1);
    }

    #[test]
    fn test_nested_boundary_both_fire_with_rethrow() {
        let inner = ErrorBoundary::new("inner", |_, _| 0).unwrap().rethrow();
        let outer = ErrorBoundary::new("outer", |_, _| -1).unwrap();

        let value = outer
            .wrap(|| inner.wrap(|| storage_err::<i32>(), None), None)
            .unwrap();
        assert_eq!(value, -1);
        assert_eq!(inner.metrics().error_count, 1);
        assert_eq!(outer.metrics().error_count, 1);
    }

    #[test]
    fn test_clear_error_state() {
        let boundary = ErrorBoundary::new("b", |_, _| ()).unwrap();
        boundary.wrap(|| storage_err::<()>(), None).unwrap();
        assert!(boundary.is_in_error_state());
        boundary.clear_error_state();
        assert!(!boundary.is_in_error_state());
    }

    #[test]
    fn test_reset_metrics() {
        let boundary = ErrorBoundary::new("b", |_, _| ()).unwrap();
        boundary.wrap(|| storage_err::<()>(), None).unwrap();
        boundary.reset_metrics();
        assert_eq!(boundary.metrics(), BoundaryMetrics::default());
    }

    #[test]
    fn test_error_rate_mixes_successes() {
        let boundary = ErrorBoundary::new("b", |_, _| 0).unwrap();
        boundary.wrap(|| Ok(1), None).unwrap();
        boundary.wrap(|| storage_err::<i32>(), None).unwrap();
        boundary.wrap(|| Ok(1), None).unwrap();
        boundary.wrap(|| Ok(1), None).unwrap();

        let metrics = boundary.metrics();
        assert!((metrics.error_rate - 0.25).abs() < f64::EPSILON);
    }
}
