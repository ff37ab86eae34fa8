//! Matching engine: the cheapest legal spot market for a request.

use std::sync::Arc;

use spotgrid_cloud::CloudProvider;
use spotgrid_core::{CloudAccount, InstanceType, MarketConfig, Zone};
use spotgrid_state::{ResourceShape, StateStore, UserId};
use tracing::{debug, warn};

use crate::availability::{MarketCache, MarketSet};
use crate::catalog::MarketCatalog;
use crate::error::{MarketError, MarketResult};

/// Resources a job asks for.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MatchRequest {
    pub cpu: f64,
    pub memory_mb: u64,
    pub gpu: u32,
    pub disk_gb: f64,
}

impl From<&ResourceShape> for MatchRequest {
    fn from(shape: &ResourceShape) -> Self {
        Self {
            cpu: shape.cpu,
            memory_mb: shape.memory_mb,
            gpu: shape.gpu,
            disk_gb: shape.disk_gb,
        }
    }
}

impl MatchRequest {
    fn shape(&self) -> ResourceShape {
        ResourceShape {
            cpu: self.cpu,
            memory_mb: self.memory_mb,
            gpu: self.gpu,
            disk_gb: self.disk_gb,
        }
    }
}

/// Where to bid and how much.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketMatch {
    pub zone: Zone,
    pub instance_type: InstanceType,
    /// Observed minimum price times the bid buffer, $/hr.
    pub bid_price: f64,
}

pub struct MatchingEngine {
    pub(crate) catalog: Arc<MarketCatalog>,
    pub(crate) cache: MarketCache,
    pub(crate) cloud: Arc<dyn CloudProvider>,
    pub(crate) store: StateStore,
    bid_buffer: f64,
    price_ceiling: f64,
}

impl MatchingEngine {
    pub fn new(
        catalog: Arc<MarketCatalog>,
        cache: MarketCache,
        cloud: Arc<dyn CloudProvider>,
        store: StateStore,
        config: &MarketConfig,
    ) -> Self {
        Self {
            catalog,
            cache,
            cloud,
            store,
            bid_buffer: config.bid_buffer,
            price_ceiling: config.price_ceiling,
        }
    }

    pub fn catalog(&self) -> &MarketCatalog {
        &self.catalog
    }

    pub fn cache(&self) -> &MarketCache {
        &self.cache
    }

    /// Pick the cheapest (zone, instance type) that fits `request` and that
    /// the user can actually bid on.
    ///
    /// Markets are scanned in catalog order (zones by region, instance types
    /// by name); the first market seen at the minimum price wins.
    pub async fn match_request(
        &self,
        user_id: UserId,
        request: &MatchRequest,
    ) -> MarketResult<MarketMatch> {
        let user = self.store.require_user(user_id)?;
        let unavailable = self.user_unavailable_markets(&user.account).await;
        let fitting = self.catalog.fitting(&request.shape());

        let candidates: Vec<(Zone, Vec<InstanceType>)> = self
            .catalog
            .zones()
            .map(|zone| {
                let excluded = unavailable.get(zone);
                let types: Vec<InstanceType> = fitting
                    .iter()
                    .filter(|t| !excluded.is_some_and(|set| set.contains(*t)))
                    .cloned()
                    .collect();
                (zone.clone(), types)
            })
            .filter(|(_, types)| !types.is_empty())
            .collect();

        if candidates.is_empty() {
            return Err(MarketError::NoCandidateMarket(format!(
                "no available market fits cpu {} mem {}MB gpu {} disk {}GB",
                request.cpu, request.memory_mb, request.gpu, request.disk_gb
            )));
        }

        let mut best: Option<(Zone, InstanceType, f64)> = None;
        for (zone, types) in &candidates {
            let prices = match self
                .cloud
                .current_spot_prices(&user.account, zone, types)
                .await
            {
                Ok(prices) => prices,
                Err(e) => {
                    warn!(user_id, %zone, error = %e, "spot price lookup failed, skipping zone");
                    continue;
                }
            };
            for sample in prices {
                if !types.contains(&sample.instance_type) {
                    continue;
                }
                let price = match sample.price.parse::<f64>() {
                    Ok(p) if p.is_finite() && p >= 0.0 => p,
                    _ => {
                        warn!(%zone, instance_type = %sample.instance_type, price = %sample.price, "malformed spot price, skipping");
                        continue;
                    }
                };
                if best.as_ref().is_none_or(|(_, _, min)| price < *min) {
                    best = Some((zone.clone(), sample.instance_type, price));
                }
            }
        }

        let (zone, instance_type, price) = best.ok_or_else(|| {
            MarketError::NoCandidateMarket("no spot price available for any candidate market".into())
        })?;
        let bid_price = price * self.bid_buffer;
        if bid_price > self.price_ceiling {
            return Err(MarketError::PriceCeiling {
                bid: bid_price,
                ceiling: self.price_ceiling,
            });
        }

        debug!(user_id, %zone, %instance_type, price, bid_price, "market matched");
        Ok(MarketMatch {
            zone,
            instance_type,
            bid_price,
        })
    }

    /// The global unavailable set plus every market the account cannot use:
    /// zones without a subnet and regions without an ssh key.
    pub async fn user_unavailable_markets(&self, account: &CloudAccount) -> MarketSet {
        let mut markets = self.cache.unavailable_markets().await;
        let all: Vec<InstanceType> = self.catalog.instance_types().cloned().collect();

        for region in self.catalog.regions() {
            let has_key = account.ssh_key(region).is_some_and(|k| !k.is_empty());
            for zone in self.catalog.zones_in(region) {
                let has_subnet = account.subnet(zone).is_some_and(|s| !s.is_empty());
                if !has_key || !has_subnet {
                    debug!(%zone, has_key, has_subnet, "account cannot use zone");
                    markets
                        .entry(zone.clone())
                        .or_default()
                        .extend(all.iter().cloned());
                }
            }
        }
        markets
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use spotgrid_cloud::SimulatedCloud;
    use spotgrid_core::{ManualClock, Region};
    use spotgrid_state::User;
    use std::time::Duration;

    pub(crate) struct Fixture {
        pub engine: MatchingEngine,
        pub cloud: SimulatedCloud,
        pub store: StateStore,
        pub clock: Arc<ManualClock>,
        pub user_id: UserId,
    }

    /// Engine over a single-region catalog so every market is spelled out.
    pub(crate) async fn fixture() -> Fixture {
        let catalog = Arc::new(
            MarketCatalog::from_toml(
                r#"
                [regions]
                "us-west-2" = ["us-west-2a", "us-west-2b", "us-west-2c"]

                [instances."m4.large"]
                cpu = 2.0
                memory_mb = 8192

                [instances."c4.large"]
                cpu = 2.0
                memory_mb = 3840

                [instances."t2.micro"]
                cpu = 1.0
                memory_mb = 512

                [supported]
                "us-west-2" = ["m4.large", "c4.large"]
                "#,
            )
            .unwrap(),
        );
        let clock = ManualClock::new(1_000_000);
        let store = StateStore::open_in_memory().unwrap().with_clock(clock.clone());
        let cloud = SimulatedCloud::new(clock.clone());
        let cache = MarketCache::new(&catalog, clock.clone(), Duration::from_secs(900));
        let user = store
            .put_user(&User {
                id: 0,
                name: "ada".into(),
                account: CloudAccount::wired_for(catalog.zones()),
            })
            .unwrap();
        let engine = MatchingEngine::new(
            catalog,
            cache,
            Arc::new(cloud.clone()),
            store.clone(),
            &MarketConfig::default(),
        );
        Fixture {
            engine,
            cloud,
            store,
            clock,
            user_id: user.id,
        }
    }

    fn small() -> MatchRequest {
        MatchRequest {
            cpu: 1.0,
            memory_mb: 512,
            gpu: 0,
            disk_gb: 0.0,
        }
    }

    fn zone(name: &str) -> Zone {
        Zone::from(name)
    }

    #[tokio::test]
    async fn picks_global_minimum_with_buffer() {
        let f = fixture().await;
        let m4 = InstanceType::from("m4.large");
        f.cloud.set_price(&zone("us-west-2a"), &m4, "0.40").await;
        f.cloud.set_price(&zone("us-west-2b"), &m4, "0.10").await;
        f.cloud.set_price(&zone("us-west-2c"), &m4, "0.50").await;

        let m = f.engine.match_request(f.user_id, &small()).await.unwrap();
        assert_eq!(m.zone, zone("us-west-2b"));
        assert_eq!(m.instance_type, m4);
        assert!((m.bid_price - 0.125).abs() < 1e-12);
    }

    #[tokio::test]
    async fn every_price_over_ceiling_is_an_error() {
        let f = fixture().await;
        for z in ["us-west-2a", "us-west-2b", "us-west-2c"] {
            f.cloud.set_price(&zone(z), &InstanceType::from("m4.large"), "1.70").await;
            f.cloud.set_price(&zone(z), &InstanceType::from("c4.large"), "1.61").await;
        }
        let err = f.engine.match_request(f.user_id, &small()).await.unwrap_err();
        assert!(matches!(err, MarketError::PriceCeiling { .. }));
        assert!(err.is_no_market());
    }

    #[tokio::test]
    async fn excluded_markets_are_never_priced() {
        let f = fixture().await;
        let c4 = InstanceType::from("c4.large");
        let m4 = InstanceType::from("m4.large");
        f.cloud.set_price(&zone("us-west-2a"), &c4, "0.01").await;
        f.cloud.set_price(&zone("us-west-2c"), &m4, "0.30").await;
        f.engine.cache().mark_unavailable(&zone("us-west-2a"), &c4).await;

        let m = f.engine.match_request(f.user_id, &small()).await.unwrap();
        assert_eq!((m.zone, m.instance_type), (zone("us-west-2c"), m4));

        // Once the TTL lapses the cheap market is back.
        f.clock.advance(Duration::from_secs(901));
        let m = f.engine.match_request(f.user_id, &small()).await.unwrap();
        assert_eq!(m.instance_type, c4);
    }

    #[tokio::test]
    async fn all_markets_excluded_is_an_error() {
        let f = fixture().await;
        for z in ["us-west-2a", "us-west-2b", "us-west-2c"] {
            for t in ["m4.large", "c4.large"] {
                f.cloud.set_price(&zone(z), &InstanceType::from(t), "0.05").await;
                f.engine.cache().mark_unavailable(&zone(z), &InstanceType::from(t)).await;
            }
        }
        let err = f.engine.match_request(f.user_id, &small()).await.unwrap_err();
        assert!(matches!(err, MarketError::NoCandidateMarket(_)));
    }

    #[tokio::test]
    async fn account_gaps_exclude_zones_and_regions() {
        let f = fixture().await;
        let m4 = InstanceType::from("m4.large");
        f.cloud.set_price(&zone("us-west-2a"), &m4, "0.05").await;
        f.cloud.set_price(&zone("us-west-2b"), &m4, "0.20").await;

        let mut user = f.store.require_user(f.user_id).unwrap();
        user.account.subnet_ids.remove(&zone("us-west-2a"));
        f.store.put_user(&user).unwrap();
        let m = f.engine.match_request(f.user_id, &small()).await.unwrap();
        assert_eq!(m.zone, zone("us-west-2b"));

        user.account.ssh_keys.remove(&Region::from("us-west-2"));
        f.store.put_user(&user).unwrap();
        let err = f.engine.match_request(f.user_id, &small()).await.unwrap_err();
        assert!(matches!(err, MarketError::NoCandidateMarket(_)));
    }

    #[tokio::test]
    async fn failing_zone_and_malformed_prices_are_skipped() {
        let f = fixture().await;
        let m4 = InstanceType::from("m4.large");
        f.cloud.set_price(&zone("us-west-2a"), &m4, "0.01").await;
        f.cloud.fail_prices_in(&zone("us-west-2a")).await;
        f.cloud.set_price(&zone("us-west-2b"), &m4, "cheap").await;
        f.cloud.set_price(&zone("us-west-2c"), &m4, "0.90").await;

        let m = f.engine.match_request(f.user_id, &small()).await.unwrap();
        assert_eq!(m.zone, zone("us-west-2c"));
    }

    #[tokio::test]
    async fn oversized_request_has_no_candidates() {
        let f = fixture().await;
        let request = MatchRequest {
            cpu: 64.0,
            ..small()
        };
        let err = f.engine.match_request(f.user_id, &request).await.unwrap_err();
        assert!(matches!(err, MarketError::NoCandidateMarket(_)));
    }

    #[tokio::test]
    async fn unknown_user_is_a_state_error() {
        let f = fixture().await;
        let err = f.engine.match_request(999, &small()).await.unwrap_err();
        assert!(matches!(err, MarketError::State(_)));
    }
}
