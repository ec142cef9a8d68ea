//! # Rate Limiter
//!
//! Sliding-window admission control backed by the shared distributed store.
//! Two independent quotas apply to every request: a per-user window and a
//! global window across all callers. The count-and-record step is a single
//! atomic store operation, so concurrent requests across processes cannot
//! both slip past the limit. Store outages fail open: admission control is
//! protective, never a new point of failure.

use crate::backend::{DistributedStore, MetricsSink};
use crate::config::LimiterSettings;
use crate::error::{DbAccessError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const USER_PREFIX: &str = "ratelimit:user:";
const GLOBAL_KEY: &str = "ratelimit:global";

/// Identity of the caller for quota purposes.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    pub user_id: Option<String>,
    pub admin: bool,
}

impl RequestScope {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            admin: false,
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Admin traffic bypasses both quotas entirely.
    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            admin: true,
        }
    }
}

pub struct RateLimiter {
    settings: LimiterSettings,
    store: Arc<dyn DistributedStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimiter {
    pub fn new(
        settings: LimiterSettings,
        store: Arc<dyn DistributedStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            settings,
            store,
            metrics,
        }
    }

    /// Admit or reject one request. Per-user quota is checked before the
    /// global one, so a single saturated user is named in the rejection
    /// instead of burning global capacity.
    pub async fn allow(&self, scope: &RequestScope) -> Result<()> {
        if scope.admin {
            return Ok(());
        }

        if let Some(user_id) = &scope.user_id {
            let key = format!("{USER_PREFIX}{user_id}");
            self.check_window(&key, self.settings.per_user_limit, || {
                format!("user:{user_id}")
            })
            .await?;
        }

        self.check_window(GLOBAL_KEY, self.settings.global_limit, || {
            "global".to_string()
        })
        .await
    }

    async fn check_window<F>(&self, key: &str, limit: u32, scope_label: F) -> Result<()>
    where
        F: FnOnce() -> String,
    {
        let decision = match self
            .store
            .count_and_record(key, self.settings.window(), limit)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                // Fail open on store trouble; the database still has the
                // pool and breakers in front of it.
                warn!(key, error = %e, "rate-limit store unavailable, admitting request");
                self.metrics.incr_counter("rate_limit_store_errors", 1, &[]);
                return Ok(());
            }
        };

        if decision.allowed {
            return Ok(());
        }

        let scope = scope_label();
        let retry_after = decision
            .retry_after
            .unwrap_or_else(|| self.settings.window());
        debug!(
            %scope,
            count = decision.current_count,
            limit,
            retry_after_ms = retry_after.as_millis() as u64,
            "request rejected by rate limiter"
        );
        self.metrics.incr_counter(
            "rate_limit_rejections",
            1,
            &[("scope", scope.clone())],
        );
        Err(DbAccessError::RateLimited { scope, retry_after })
    }

    /// Window length, exposed for callers that surface Retry-After hints.
    pub fn window(&self) -> Duration {
        self.settings.window()
    }
}
