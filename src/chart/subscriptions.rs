use crate::chart::types::{Bar, BarUpdate, Resolution, SeriesKey};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Callback registered by a chart widget. Invoked once per bar mutation.
pub type BarHandler = Box<dyn FnMut(&BarUpdate) + Send>;

struct HandlerSlot {
    handler_id: String,
    callback: BarHandler,
}

/// Live binding between one chart series and its registered handlers.
/// Owns the bar being built; exactly one current bar exists per series.
pub struct Subscription {
    pub series_key: SeriesKey,
    pub resolution: Resolution,
    pub instrument_id: String,
    pub current_bar: Option<Bar>,
    pub last_close: Option<f64>,
    handlers: Vec<HandlerSlot>,
}

impl Subscription {
    fn new(
        series_key: SeriesKey,
        resolution: Resolution,
        instrument_id: String,
        initial_bar: Option<Bar>,
    ) -> Self {
        let last_close = initial_bar.map(|bar| bar.close);
        Self {
            series_key,
            resolution,
            instrument_id,
            current_bar: initial_bar,
            last_close,
            handlers: Vec::new(),
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Deliver one update to every handler. A panicking handler is isolated
    /// so its siblings still receive the bar.
    pub fn fan_out(&mut self, update: &BarUpdate) {
        for slot in &mut self.handlers {
            let delivery = catch_unwind(AssertUnwindSafe(|| (slot.callback)(update)));
            if delivery.is_err() {
                log::warn!(
                    "bar handler '{}' panicked on series {}; continuing fan-out",
                    slot.handler_id,
                    update.series_key
                );
            }
        }
    }
}

/// Registry of active subscriptions, keyed by series. Iteration follows
/// insertion order. Entries live exactly as long as they have handlers.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: Vec<Subscription>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, series_key: SeriesKey) -> Option<&Subscription> {
        self.entries
            .iter()
            .find(|entry| entry.series_key == series_key)
    }

    pub fn get_mut(&mut self, series_key: SeriesKey) -> Option<&mut Subscription> {
        self.entries
            .iter_mut()
            .find(|entry| entry.series_key == series_key)
    }

    pub fn remove(&mut self, series_key: SeriesKey) -> Option<Subscription> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.series_key == series_key)?;
        Some(self.entries.remove(position))
    }

    pub fn for_each(&self, mut visitor: impl FnMut(&Subscription)) {
        for entry in &self.entries {
            visitor(entry);
        }
    }

    pub fn for_each_mut(&mut self, mut visitor: impl FnMut(&mut Subscription)) {
        for entry in &mut self.entries {
            visitor(entry);
        }
    }

    /// Register a handler on a series. An existing subscription keeps its
    /// resolution, instrument, and bar state; the first subscriber wins.
    pub fn subscribe(
        &mut self,
        series_key: SeriesKey,
        resolution: Resolution,
        instrument_id: &str,
        initial_bar: Option<Bar>,
        handler_id: &str,
        callback: BarHandler,
    ) {
        let slot = HandlerSlot {
            handler_id: handler_id.to_string(),
            callback,
        };

        if let Some(existing) = self.get_mut(series_key) {
            existing.handlers.push(slot);
            return;
        }

        let mut subscription = Subscription::new(
            series_key,
            resolution,
            instrument_id.to_string(),
            initial_bar,
        );
        subscription.handlers.push(slot);
        self.entries.push(subscription);
    }

    /// Drop the handler wherever it is registered; the subscription goes
    /// with it when no handlers remain. Unknown ids are a no-op.
    pub fn unsubscribe(&mut self, handler_id: &str) {
        for index in 0..self.entries.len() {
            let entry = &mut self.entries[index];
            let before = entry.handlers.len();
            entry.handlers.retain(|slot| slot.handler_id != handler_id);
            if entry.handlers.len() < before {
                if entry.handlers.is_empty() {
                    self.entries.remove(index);
                }
                return;
            }
        }
    }
}
