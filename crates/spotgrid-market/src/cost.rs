//! Spot cost integration.
//!
//! Spot prices are piecewise constant: each sample holds until the next one.
//! Cost over `[start, end]` is the sum of `hours × price` across those
//! pieces, with the first piece starting at `start` and the last ending at
//! `end`.

use spotgrid_cloud::SpotPrice;
use spotgrid_state::{Resource, ResourceId};
use tracing::{debug, warn};

use crate::engine::MatchingEngine;
use crate::error::MarketResult;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Integrate a price history (oldest first) over `[start, end]` in ms.
///
/// Samples whose price does not parse contribute nothing.
pub fn integrate_price_history(history: &[SpotPrice], start: u64, end: u64) -> f64 {
    if history.is_empty() || end <= start {
        return 0.0;
    }
    if history[0].timestamp > start {
        warn!(
            first_sample = history[0].timestamp,
            start, "price history does not cover the start of the interval"
        );
    }

    let mut total = 0.0;
    for (i, sample) in history.iter().enumerate() {
        let from = if i == 0 { start } else { sample.timestamp.max(start) };
        let to = match history.get(i + 1) {
            Some(next) => next.timestamp.min(end),
            None => end,
        };
        let price = match sample.price.parse::<f64>() {
            Ok(p) => p,
            Err(_) => {
                warn!(price = %sample.price, timestamp = sample.timestamp, "could not parse spot price");
                continue;
            }
        };
        let hours = to.saturating_sub(from) as f64 / MILLIS_PER_HOUR;
        total += hours * price;
    }
    total
}

impl MatchingEngine {
    /// What `resource` cost between `start` and `end` (ms) at spot prices.
    pub async fn cost_between(&self, resource: &Resource, start: u64, end: u64) -> MarketResult<f64> {
        let user = self.store.require_user(resource.owner_id)?;
        let history = self
            .cloud
            .spot_price_history(
                &user.account,
                &resource.zone,
                &resource.instance_type,
                start,
                end,
            )
            .await?;
        if history.is_empty() {
            warn!(
                resource_id = resource.id,
                zone = %resource.zone,
                instance_type = %resource.instance_type,
                "empty spot price history"
            );
            return Ok(0.0);
        }
        let cost = integrate_price_history(&history, start, end);
        debug!(resource_id = resource.id, start, end, cost, "resource cost computed");
        Ok(cost)
    }

    /// Cost of a resource from its launch until now.
    pub async fn track_resource_cost(&self, resource_id: ResourceId) -> MarketResult<f64> {
        let resource = self.store.require_resource(resource_id)?;
        let now = self.store.clock().now_millis();
        self.cost_between(&resource, resource.launch_time, now).await
    }
}
