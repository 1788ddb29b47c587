//! Per-tenant daily quota counters.
//!
//! Counters are plain atomics keyed by tenant id, lazily created behind a
//! read-write lock. The day stamp (UTC) rides next to the count; the first
//! access on a new day resets the counter under the write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{Datelike, Utc};
use tracing::debug;

use crate::error::{DomainError, Sentinel};

struct TenantCounter {
    count: AtomicU64,
    /// UTC day as days-from-CE.
    day: AtomicI32,
}

/// Daily message quota per tenant.
pub struct TenantQuota {
    daily_limit: u64,
    counters: RwLock<HashMap<String, Arc<TenantCounter>>>,
}

impl TenantQuota {
    pub fn new(daily_limit: u64) -> Self {
        Self {
            daily_limit,
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn daily_limit(&self) -> u64 {
        self.daily_limit
    }

    /// Count one operation against the tenant.
    ///
    /// Returns the tenant's usage for today, or `TenantLimitHit` once the
    /// daily limit is exceeded.
    pub fn check_and_increment(&self, tenant_id: &str) -> Result<u64, DomainError> {
        let counter = self.counter_for(tenant_id);
        let today = Utc::now().date_naive().num_days_from_ce();

        if counter.day.load(Ordering::Acquire) != today {
            // Reset under the write lock so two tasks crossing midnight
            // don't both zero a counter that already took today's traffic.
            let _guard = self.counters.write().unwrap();
            if counter.day.load(Ordering::Acquire) != today {
                debug!(tenant = tenant_id, "Resetting daily quota counter");
                counter.count.store(0, Ordering::Release);
                counter.day.store(today, Ordering::Release);
            }
        }

        let used = counter.count.fetch_add(1, Ordering::SeqCst) + 1;
        if used > self.daily_limit {
            return Err(DomainError::new(
                "TenantQuota.CheckAndIncrement",
                Sentinel::TenantLimitHit,
            ));
        }
        Ok(used)
    }

    /// Today's usage without incrementing.
    pub fn usage(&self, tenant_id: &str) -> u64 {
        let today = Utc::now().date_naive().num_days_from_ce();
        let counters = self.counters.read().unwrap();
        counters
            .get(tenant_id)
            .filter(|c| c.day.load(Ordering::Acquire) == today)
            .map_or(0, |c| c.count.load(Ordering::SeqCst))
    }

    fn counter_for(&self, tenant_id: &str) -> Arc<TenantCounter> {
        if let Some(counter) = self.counters.read().unwrap().get(tenant_id) {
            return Arc::clone(counter);
        }
        let mut counters = self.counters.write().unwrap();
        Arc::clone(counters.entry(tenant_id.to_string()).or_insert_with(|| {
            Arc::new(TenantCounter {
                count: AtomicU64::new(0),
                day: AtomicI32::new(Utc::now().date_naive().num_days_from_ce()),
            })
        }))
    }

    #[cfg(test)]
    fn backdate(&self, tenant_id: &str, days_ago: i32) {
        let counter = self.counter_for(tenant_id);
        let today = Utc::now().date_naive().num_days_from_ce();
        counter.day.store(today - days_ago, Ordering::Release);
    }
}
