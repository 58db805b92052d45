use crate::chart::gateway::{connect_feed_stream, fetch_chart_history};
use crate::chart::router::EventRouter;
use crate::chart::types::{
    parse_feed_payload, CurveSnapshot, FeedConnectionState, FeedEvent, FeedStatusSnapshot,
    StreamConfig,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const STATUS_ERROR_THROTTLE_MS: u64 = 500;
const MOCK_TICK_INTERVAL_MS: u64 = 25;
const MOCK_BASE_SOL_RESERVES: u64 = 30_000_000_000;
const MOCK_TOKEN_RESERVES: u64 = 1_073_000_191_000_000;

pub type SharedRouter = Arc<Mutex<EventRouter>>;
pub type SharedStatus = Arc<RwLock<FeedStatusSnapshot>>;

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_state: Option<FeedConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

struct StreamRuntimeContext<'a> {
    config: &'a StreamConfig,
    http_client: &'a Client,
    router: &'a SharedRouter,
    status_store: &'a SharedStatus,
    status_throttle: &'a Mutex<StatusPublishThrottle>,
    last_event_ms: &'a AtomicI64,
    cancel_token: &'a CancellationToken,
}

enum StreamDirective {
    Continue,
    ImmediateReconnect,
}

/// Handle for a running chart stream. Dropping it does not stop the task;
/// call `stop` for a clean shutdown.
pub struct ChartStreamHandle {
    cancellation_token: CancellationToken,
    join_handle: tokio::task::JoinHandle<()>,
}

impl ChartStreamHandle {
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub async fn stop(self) {
        self.cancellation_token.cancel();
        let _ = self.join_handle.await;
    }
}

pub fn start_chart_stream(
    config: StreamConfig,
    router: SharedRouter,
    status_store: SharedStatus,
) -> ChartStreamHandle {
    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let join_handle = tokio::spawn(async move {
        run_chart_stream(config, router, status_store, task_token).await;
    });

    ChartStreamHandle {
        cancellation_token,
        join_handle,
    }
}

pub async fn run_chart_stream(
    config: StreamConfig,
    router: SharedRouter,
    status_store: SharedStatus,
    cancel_token: CancellationToken,
) {
    let http_client = Client::new();
    let status_throttle = Mutex::new(StatusPublishThrottle::default());
    let last_event_ms = AtomicI64::new(0);

    let context = StreamRuntimeContext {
        config: &config,
        http_client: &http_client,
        router: &router,
        status_store: &status_store,
        status_throttle: &status_throttle,
        last_event_ms: &last_event_ms,
        cancel_token: &cancel_token,
    };

    if config.mock_mode {
        publish_status(
            &context,
            FeedConnectionState::Live,
            Some("mock mode active".to_string()),
        )
        .await;

        run_mock_producer(&context).await;

        publish_status(
            &context,
            FeedConnectionState::Stopped,
            Some("mock stream stopped".to_string()),
        )
        .await;
        return;
    }

    let mut reconnect_attempt = 0_u32;
    while !cancel_token.is_cancelled() {
        let phase = if reconnect_attempt == 0 {
            FeedConnectionState::Connecting
        } else {
            FeedConnectionState::Reconnecting
        };
        let reason = if reconnect_attempt == 0 {
            Some("opening feed stream".to_string())
        } else {
            Some(format!("reconnect attempt {reconnect_attempt}"))
        };
        publish_status(&context, phase, reason).await;

        match connect_feed_stream(&config.ws_url).await {
            Ok(mut feed_stream) => {
                reconnect_attempt = 0;
                publish_status(
                    &context,
                    FeedConnectionState::Live,
                    Some("feed connected".to_string()),
                )
                .await;

                let mut immediate_reconnect = false;
                loop {
                    let frame = tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        next_message = feed_stream.next() => next_message,
                    };

                    let Some(frame_result) = frame else {
                        break;
                    };

                    match frame_result {
                        Ok(message) => match handle_message(message, &context).await {
                            StreamDirective::Continue => {}
                            StreamDirective::ImmediateReconnect => {
                                immediate_reconnect = true;
                                break;
                            }
                        },
                        Err(error) => {
                            publish_status_throttled(
                                &context,
                                FeedConnectionState::Reconnecting,
                                Some(format!("feed frame error: {error}")),
                            )
                            .await;
                            break;
                        }
                    }
                }

                if cancel_token.is_cancelled() {
                    break;
                }
                if immediate_reconnect {
                    reconnect_attempt = 0;
                    continue;
                }
            }
            Err(error) => {
                publish_status_throttled(
                    &context,
                    FeedConnectionState::Reconnecting,
                    Some(format!("feed connect error: {error}")),
                )
                .await;
            }
        }

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(reconnect_attempt);
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    publish_status(
        &context,
        FeedConnectionState::Stopped,
        Some("stream stopped".to_string()),
    )
    .await;
}

async fn handle_message(
    message: Message,
    context: &StreamRuntimeContext<'_>,
) -> StreamDirective {
    let event = match message {
        Message::Text(text_payload) => {
            let mut owned_payload = text_payload.into_bytes();
            match parse_feed_payload(owned_payload.as_mut_slice()) {
                Ok(parsed) => parsed,
                Err(error) => {
                    log::warn!("skipping undecodable feed payload: {error}");
                    return StreamDirective::Continue;
                }
            }
        }
        Message::Binary(mut binary_payload) => {
            match parse_feed_payload(binary_payload.as_mut_slice()) {
                Ok(parsed) => parsed,
                Err(error) => {
                    log::warn!("skipping undecodable binary feed payload: {error}");
                    return StreamDirective::Continue;
                }
            }
        }
        Message::Close(_) => return StreamDirective::ImmediateReconnect,
        _ => return StreamDirective::Continue,
    };

    let now_ms = now_unix_ms();
    context.last_event_ms.store(now_ms, Ordering::Relaxed);

    match event {
        FeedEvent::Redraw { instrument_id } => {
            redraw_instrument(
                context.http_client,
                context.config,
                context.router,
                &instrument_id,
            )
            .await;
        }
        synchronous => {
            apply_feed_event(context.router, &synchronous, now_ms);
        }
    }

    StreamDirective::Continue
}

/// Apply a parsed event to the router. Redraw events are not handled here;
/// they need the async history fetch.
fn apply_feed_event(router: &SharedRouter, event: &FeedEvent, now_ms: i64) {
    match event {
        FeedEvent::InstrumentUpdate {
            instrument_id,
            snapshot,
        } => {
            router
                .lock()
                .on_instrument_update(instrument_id, *snapshot, now_ms);
        }
        FeedEvent::PriceBatch { updates } => {
            router.lock().on_price_batch(updates, now_ms);
        }
        FeedEvent::Redraw { .. } => {}
    }
}

/// Full-redraw fallback: refetch history for every series tracking the
/// instrument and rehydrate them. A failed fetch is treated as "no data";
/// nothing is emitted and the live state stays as it was.
pub async fn redraw_instrument(
    client: &Client,
    config: &StreamConfig,
    router: &SharedRouter,
    instrument_id: &str,
) {
    let targets = router.lock().redraw_targets(instrument_id);

    for (series_key, resolution) in targets {
        match fetch_chart_history(
            client,
            &config.api_url,
            resolution,
            instrument_id,
            config.history_limit,
        )
        .await
        {
            Ok(bars) => {
                router.lock().apply_history(series_key, &bars);
            }
            Err(error) => {
                log::warn!(
                    "history refetch failed for {instrument_id} series {series_key}: {error}"
                );
            }
        }
    }
}

async fn run_mock_producer(context: &StreamRuntimeContext<'_>) {
    let mut tick = 0_u64;
    let mut sol_reserves = MOCK_BASE_SOL_RESERVES;
    let mut ticker = tokio::time::interval(Duration::from_millis(MOCK_TICK_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while !context.cancel_token.is_cancelled() {
        tokio::select! {
            _ = context.cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                tick = tick.saturating_add(1);
                let upward_move = tick % 2 == 0;
                sol_reserves = if upward_move {
                    sol_reserves.saturating_add(50_000_000)
                } else {
                    sol_reserves.saturating_sub(30_000_000)
                };
                let snapshot = CurveSnapshot {
                    virtual_sol_reserves: sol_reserves,
                    virtual_token_reserves: MOCK_TOKEN_RESERVES,
                };

                let now_ms = now_unix_ms();
                context.last_event_ms.store(now_ms, Ordering::Relaxed);
                let instruments = context.router.lock().instrument_ids();
                for instrument_id in instruments {
                    context
                        .router
                        .lock()
                        .on_instrument_update(&instrument_id, snapshot, now_ms);
                }
            }
        }
    }
}

async fn publish_status(
    context: &StreamRuntimeContext<'_>,
    state: FeedConnectionState,
    reason: Option<String>,
) {
    let last_event_ms = match context.last_event_ms.load(Ordering::Relaxed) {
        0 => None,
        value => Some(value),
    };
    let snapshot = FeedStatusSnapshot {
        state,
        last_event_ms,
        reason,
    };

    log::info!(
        "feed status: {:?}{}",
        snapshot.state,
        snapshot
            .reason
            .as_deref()
            .map(|reason| format!(" ({reason})"))
            .unwrap_or_default()
    );

    let mut writable = context.status_store.write().await;
    *writable = snapshot;
}

fn allow_status_publish(
    throttle: &Mutex<StatusPublishThrottle>,
    state: FeedConnectionState,
    reason: &Option<String>,
) -> bool {
    let mut writable = throttle.lock();
    let now = Instant::now();
    let should_throttle = matches!(
        state,
        FeedConnectionState::Error | FeedConnectionState::Reconnecting
    );

    if should_throttle
        && writable.last_state == Some(state)
        && writable.last_reason == *reason
        && writable
            .last_emit
            .map(|instant| {
                now.duration_since(instant) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS)
            })
            .unwrap_or(false)
    {
        return false;
    }

    writable.last_state = Some(state);
    writable.last_reason = reason.clone();
    writable.last_emit = Some(now);
    true
}

async fn publish_status_throttled(
    context: &StreamRuntimeContext<'_>,
    state: FeedConnectionState,
    reason: Option<String>,
) {
    if !allow_status_publish(context.status_throttle, state, &reason) {
        return;
    }
    publish_status(context, state, reason).await;
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = (now_unix_ms().unsigned_abs() % 250).min(249);
    Duration::from_millis((base_ms + jitter_ms).min(5_000))
}

fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::types::{Resolution, StartStreamArgs};
    use std::sync::atomic::AtomicUsize;

    fn shared_router() -> SharedRouter {
        Arc::new(Mutex::new(EventRouter::new()))
    }

    fn mock_config() -> StreamConfig {
        StartStreamArgs {
            ws_url: None,
            api_url: None,
            history_limit: Some(50),
            mock_mode: Some(true),
        }
        .normalize()
        .expect("mock config is valid")
    }

    #[test]
    fn reconnect_delay_grows_and_caps() {
        assert!(reconnect_delay(1) >= Duration::from_millis(400));
        assert!(reconnect_delay(1) < Duration::from_millis(700));
        assert_eq!(reconnect_delay(20), Duration::from_millis(5_000));
    }

    #[test]
    fn status_throttle_suppresses_repeated_errors() {
        let throttle = Mutex::new(StatusPublishThrottle::default());
        let reason = Some("feed connect error: refused".to_string());

        assert!(allow_status_publish(
            &throttle,
            FeedConnectionState::Reconnecting,
            &reason
        ));
        assert!(!allow_status_publish(
            &throttle,
            FeedConnectionState::Reconnecting,
            &reason
        ));
        // A state change always goes through.
        assert!(allow_status_publish(
            &throttle,
            FeedConnectionState::Live,
            &None
        ));
    }

    #[test]
    fn parsed_events_reach_the_router() {
        let router = shared_router();
        let delivered = Arc::new(AtomicUsize::new(0));
        {
            let delivered = Arc::clone(&delivered);
            router.lock().subscribe(
                0,
                Resolution::from_millis(5_000).expect("5s resolution is valid"),
                "GxkX3mint",
                None,
                "widget-0",
                Box::new(move |_| {
                    delivered.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let mut payload = br#"{"type":"priceBatch","pairs":[0,1.5]}"#.to_vec();
        let event = parse_feed_payload(payload.as_mut_slice()).expect("payload parses");
        apply_feed_event(&router, &event, 1_000);

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        let bar = router.lock().current_bar(0).expect("bar was built");
        assert_eq!(bar.time, 5_000);
        assert_eq!(bar.close, 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn mock_stream_builds_bars_and_stops_cleanly() {
        let router = shared_router();
        router.lock().subscribe(
            0,
            Resolution::minutes(1),
            "mock-mint",
            None,
            "widget-0",
            Box::new(|_| {}),
        );
        let status_store: SharedStatus =
            Arc::new(RwLock::new(FeedStatusSnapshot::stopped(None)));

        let handle = start_chart_stream(
            mock_config(),
            Arc::clone(&router),
            Arc::clone(&status_store),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.stop().await;

        let bar = router.lock().current_bar(0);
        assert!(bar.is_some(), "mock producer should have built a bar");
        assert!(bar.expect("bar exists").is_well_formed());

        let status = status_store.read().await;
        assert_eq!(status.state, FeedConnectionState::Stopped);
    }
}
