use crate::chart::bars::fold_observation;
use crate::chart::subscriptions::{BarHandler, Subscription, SubscriptionTable};
use crate::chart::types::{
    Bar, BarUpdate, CurveSnapshot, Direction, PriceObservation, Resolution, SeriesKey,
};

/// Routes inbound feed events to matching subscriptions and drives the bar
/// builder plus fan-out. Owns the subscription table and the shared price
/// cache; callers serialize mutation through a single lock.
#[derive(Default)]
pub struct EventRouter {
    table: SubscriptionTable,
    price_cache: Vec<f64>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &mut self,
        series_key: SeriesKey,
        resolution: Resolution,
        instrument_id: &str,
        initial_bar: Option<Bar>,
        handler_id: &str,
        callback: BarHandler,
    ) {
        self.table.subscribe(
            series_key,
            resolution,
            instrument_id,
            initial_bar,
            handler_id,
            callback,
        );
    }

    pub fn unsubscribe(&mut self, handler_id: &str) {
        self.table.unsubscribe(handler_id);
    }

    pub fn subscription_count(&self) -> usize {
        self.table.len()
    }

    pub fn current_bar(&self, series_key: SeriesKey) -> Option<Bar> {
        self.table.get(series_key).and_then(|entry| entry.current_bar)
    }

    pub fn cached_price(&self, index: SeriesKey) -> Option<f64> {
        self.price_cache.get(index as usize).copied()
    }

    /// Instrument update path: derive the price from the curve snapshot and
    /// feed every subscription tracking that instrument.
    pub fn on_instrument_update(
        &mut self,
        instrument_id: &str,
        snapshot: CurveSnapshot,
        now_ms: i64,
    ) {
        let Some(price) = snapshot.spot_price() else {
            log::debug!("dropping update for {instrument_id}: curve has no token reserves");
            return;
        };
        let observation = PriceObservation::at(now_ms, price);

        self.table.for_each_mut(|subscription| {
            if subscription.instrument_id != instrument_id {
                return;
            }
            if let Some(update) = apply_observation(subscription, observation) {
                subscription.fan_out(&update);
            }
        });
    }

    /// Batched price path: refresh the cache for every updated index, then
    /// feed the subscription keyed to each index from the cache.
    pub fn on_price_batch(&mut self, updates: &[(SeriesKey, f64)], now_ms: i64) {
        for &(index, price) in updates {
            self.cache_price(index, price);
        }

        let mut seen: Vec<SeriesKey> = Vec::with_capacity(updates.len());
        for &(index, _) in updates {
            if seen.contains(&index) {
                continue;
            }
            seen.push(index);

            let Some(price) = self.cached_price(index) else {
                continue;
            };
            let observation = PriceObservation::at(now_ms, price);
            if let Some(subscription) = self.table.get_mut(index) {
                if let Some(update) = apply_observation(subscription, observation) {
                    subscription.fan_out(&update);
                }
            }
        }
    }

    /// Distinct instruments currently tracked, in insertion order.
    pub fn instrument_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        self.table.for_each(|entry| {
            if !ids.iter().any(|id| id == &entry.instrument_id) {
                ids.push(entry.instrument_id.clone());
            }
        });
        ids
    }

    /// Series that need a history refetch for this instrument.
    pub fn redraw_targets(&self, instrument_id: &str) -> Vec<(SeriesKey, Resolution)> {
        let mut targets = Vec::new();
        self.table.for_each(|entry| {
            if entry.instrument_id == instrument_id {
                targets.push((entry.series_key, entry.resolution));
            }
        });
        targets
    }

    /// Rehydrate one series from fetched history: fan the bars out in order
    /// and adopt the tail as the current bar unless the live stream has
    /// already moved past it (last writer wins).
    pub fn apply_history(&mut self, series_key: SeriesKey, bars: &[Bar]) {
        let Some(last) = bars.last().copied() else {
            return;
        };
        let Some(subscription) = self.table.get_mut(series_key) else {
            return;
        };

        let mut previous_close = subscription.last_close;
        for bar in bars {
            let update = BarUpdate {
                series_key,
                bar: *bar,
                direction: Direction::from_prices(bar.close, previous_close),
            };
            subscription.fan_out(&update);
            previous_close = Some(bar.close);
        }

        let should_replace = subscription
            .current_bar
            .map(|current| last.time >= current.time)
            .unwrap_or(true);
        if should_replace {
            subscription.current_bar = Some(last);
            subscription.last_close = Some(last.close);
        }
    }

    fn cache_price(&mut self, index: SeriesKey, price: f64) {
        if !price.is_finite() {
            log::debug!("ignoring non-finite cached price for index {index}");
            return;
        }
        let slot = index as usize;
        if slot >= self.price_cache.len() {
            self.price_cache.resize(slot + 1, 0.0);
        }
        self.price_cache[slot] = price;
    }
}

/// Shared aggregation step for both ingestion paths: fold the observation,
/// stamp the display direction, and store the result as the current bar.
fn apply_observation(
    subscription: &mut Subscription,
    observation: PriceObservation,
) -> Option<BarUpdate> {
    let folded = fold_observation(
        subscription.current_bar.as_ref(),
        subscription.resolution,
        observation,
    )?;
    let direction = Direction::from_prices(observation.price, subscription.last_close);
    subscription.current_bar = Some(folded);
    subscription.last_close = Some(folded.close);
    Some(BarUpdate {
        series_key: subscription.series_key,
        bar: folded,
        direction,
    })
}
