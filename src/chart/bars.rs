use crate::chart::types::{Bar, PriceObservation, Resolution};

/// Closing boundary of the bucket containing `observed_at`. Bars are keyed
/// by the boundary they close on, not the bucket's open time.
pub fn next_bar_time(observed_at: i64, resolution: Resolution) -> i64 {
    let period = resolution.period_ms();
    observed_at.div_euclid(period) * period + period
}

/// Fold one observation into the current bar state.
///
/// Returns the resulting bar: a fresh one when the observation lands past
/// the current bar's boundary (or no bar exists yet), the amended current
/// bar otherwise. A non-finite price returns None and the caller keeps the
/// prior state untouched.
pub fn fold_observation(
    current: Option<&Bar>,
    resolution: Resolution,
    observation: PriceObservation,
) -> Option<Bar> {
    if !observation.price.is_finite() {
        log::debug!(
            "dropping observation at {} with non-finite price",
            observation.observed_at
        );
        return None;
    }

    let bucket_time = next_bar_time(observation.observed_at, resolution);
    let volume_delta = observation.volume_delta.unwrap_or(0.0).max(0.0);

    match current {
        Some(bar) if bucket_time <= bar.time => {
            let mut amended = *bar;
            amended.apply_observation(observation.price, volume_delta);
            Some(amended)
        }
        _ => Some(Bar::from_observation(
            bucket_time,
            observation.price,
            volume_delta,
        )),
    }
}
