//! Unavailable-market cache.
//!
//! Combines the catalog's static unsupported set with markets learned to be
//! unavailable at runtime (failed bids, reclaimed instances). Learned
//! entries carry a fixed TTL against the injected clock and are never
//! cleared early; a repeat mark simply restarts the TTL.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use spotgrid_core::{InstanceType, SharedClock, Zone};
use tokio::sync::RwLock;
use tracing::debug;

use crate::catalog::MarketCatalog;

/// Instance types per zone.
pub type MarketSet = BTreeMap<Zone, BTreeSet<InstanceType>>;

/// Cheap to clone; clones share the learned entries.
#[derive(Debug, Clone)]
pub struct MarketCache {
    /// (zone, instance type) → expiry in ms.
    learned: Arc<RwLock<HashMap<(Zone, InstanceType), u64>>>,
    unsupported: Arc<MarketSet>,
    clock: SharedClock,
    ttl: Duration,
}

impl MarketCache {
    pub fn new(catalog: &MarketCatalog, clock: SharedClock, ttl: Duration) -> Self {
        Self {
            learned: Arc::new(RwLock::new(HashMap::new())),
            unsupported: Arc::new(catalog.unsupported_markets()),
            clock,
            ttl,
        }
    }

    pub async fn mark_unavailable(&self, zone: &Zone, instance_type: &InstanceType) {
        let now = self.clock.now_millis();
        let expires_at = now + self.ttl.as_millis() as u64;
        let mut learned = self.learned.write().await;
        learned.retain(|_, expiry| *expiry > now);
        learned.insert((zone.clone(), instance_type.clone()), expires_at);
        debug!(%zone, %instance_type, expires_at, "market marked unavailable");
    }

    /// Static unsupported markets plus every unexpired learned entry.
    ///
    /// Every catalog zone has a key, possibly with an empty set.
    pub async fn unavailable_markets(&self) -> MarketSet {
        let now = self.clock.now_millis();
        let mut markets = (*self.unsupported).clone();
        let learned = self.learned.read().await;
        for ((zone, instance_type), expiry) in learned.iter() {
            if *expiry > now {
                markets
                    .entry(zone.clone())
                    .or_default()
                    .insert(instance_type.clone());
            }
        }
        markets
    }

    pub async fn is_available(&self, zone: &Zone, instance_type: &InstanceType) -> bool {
        if self
            .unsupported
            .get(zone)
            .is_some_and(|types| types.contains(instance_type))
        {
            return false;
        }
        let now = self.clock.now_millis();
        !self
            .learned
            .read()
            .await
            .get(&(zone.clone(), instance_type.clone()))
            .is_some_and(|expiry| *expiry > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotgrid_core::ManualClock;

    const TTL: Duration = Duration::from_secs(15 * 60);

    #[tokio::test]
    async fn marked_market_expires_after_ttl() {
        let clock = ManualClock::new(1_000_000);
        let cache = MarketCache::new(&MarketCatalog::builtin(), clock.clone(), TTL);
        let zone = Zone::from("us-west-2b");
        let ty = InstanceType::from("m4.large");

        assert!(cache.is_available(&zone, &ty).await);
        cache.mark_unavailable(&zone, &ty).await;
        assert!(cache.unavailable_markets().await[&zone].contains(&ty));
        assert!(!cache.is_available(&zone, &ty).await);

        clock.advance(TTL - Duration::from_secs(1));
        assert!(cache.unavailable_markets().await[&zone].contains(&ty));

        clock.advance(Duration::from_secs(1));
        assert!(!cache.unavailable_markets().await[&zone].contains(&ty));
        assert!(cache.is_available(&zone, &ty).await);
    }

    #[tokio::test]
    async fn static_set_always_present() {
        let clock = ManualClock::new(0);
        let cache = MarketCache::new(&MarketCatalog::builtin(), clock.clone(), TTL);
        let zone = Zone::from("us-east-1a");
        let t2 = InstanceType::from("t2.small");
        assert!(cache.unavailable_markets().await[&zone].contains(&t2));
        clock.advance(Duration::from_secs(24 * 3600));
        assert!(!cache.is_available(&zone, &t2).await);
    }

    #[tokio::test]
    async fn concurrent_marks_are_idempotent() {
        let clock = ManualClock::new(0);
        let cache = MarketCache::new(&MarketCatalog::builtin(), clock, TTL);
        let zone = Zone::from("us-west-1a");
        let ty = InstanceType::from("c4.large");

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let (zone, ty) = (zone.clone(), ty.clone());
            tasks.spawn(async move { cache.mark_unavailable(&zone, &ty).await });
        }
        while tasks.join_next().await.is_some() {}

        let markets = cache.unavailable_markets().await;
        let learned: Vec<_> = markets[&zone]
            .iter()
            .filter(|t| !t.as_str().starts_with("t2."))
            .collect();
        assert_eq!(learned, vec![&ty]);
    }
}
