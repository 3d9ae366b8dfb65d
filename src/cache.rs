//! Read-through TTL cache in front of the analytics computations.

use anyhow::Result;
use serde_json::Value;

use crate::event::now_unix;
use crate::store::Store;

/// TTL for raw hourly distributions.
pub const TTL_DISTRIBUTION: u64 = 3_600;
/// TTL for scored recommendations.
pub const TTL_RECOMMENDATION: u64 = 4 * 3_600;
/// TTL for everything else.
pub const TTL_DEFAULT: u64 = 86_400;

/// Keyed (tenant, kind, period) cache over the insights table.
#[derive(Clone)]
pub struct InsightCache {
    store: Store,
}

impl InsightCache {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Return the cached value when fresh, otherwise compute and store it.
    /// The boolean is true on a cache hit.
    pub fn read_through<F>(
        &self,
        tenant_id: i64,
        kind: &str,
        period: &str,
        ttl_secs: u64,
        compute: F,
    ) -> Result<(Value, bool)>
    where
        F: FnOnce() -> Result<Value>,
    {
        if let Some((data, expires_at)) = self.store.insight(tenant_id, kind, period)? {
            if expires_at > now_unix() {
                return Ok((data, true));
            }
        }
        let data = compute()?;
        self.store
            .put_insight(tenant_id, kind, period, &data, ttl_secs)?;
        Ok((data, false))
    }

    /// Drop every cached row for a tenant.
    pub fn invalidate(&self, tenant_id: i64) -> Result<()> {
        self.store.invalidate_insights(tenant_id)
    }
}
