use crate::error::FeedError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HISTORY_LIMIT: u16 = 300;
pub const DEFAULT_MOCK_MODE: bool = false;
pub const MIN_HISTORY_LIMIT: u16 = 1;
pub const MAX_HISTORY_LIMIT: u16 = 5_000;

pub const MILLIS_PER_MINUTE: i64 = 60_000;

/// Numeric trading-pair index used to key chart series. Batched price
/// events address subscriptions by this index.
pub type SeriesKey = u32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedConnectionState {
    Connecting,
    Live,
    Reconnecting,
    Stopped,
    Error,
}

/// Bar period. Whole-minute resolutions serialize to the TradingView-style
/// path segment ("1", "5", "60"); anything else falls back to "<ms>ms".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution(i64);

impl Resolution {
    pub fn from_millis(period_ms: i64) -> Result<Self, FeedError> {
        if period_ms <= 0 {
            return Err(FeedError::InvalidArgument(format!(
                "resolution period must be positive, got {period_ms}ms"
            )));
        }
        Ok(Self(period_ms))
    }

    pub const fn minutes(count: u32) -> Self {
        Self(count as i64 * MILLIS_PER_MINUTE)
    }

    pub const fn period_ms(self) -> i64 {
        self.0
    }

    pub fn path_segment(self) -> String {
        if self.0 % MILLIS_PER_MINUTE == 0 {
            (self.0 / MILLIS_PER_MINUTE).to_string()
        } else {
            format!("{}ms", self.0)
        }
    }
}

/// Price movement relative to the previous close. Carried on bar updates
/// for display only; it never alters OHLC math.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Flat,
}

impl Direction {
    pub fn from_prices(price: f64, previous_close: Option<f64>) -> Self {
        match previous_close {
            Some(close) if price > close => Self::Up,
            Some(close) if price < close => Self::Down,
            _ => Self::Flat,
        }
    }
}

/// One OHLC candle. `time` is the bucket's closing boundary in epoch ms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn from_observation(bucket_time: i64, price: f64, volume: f64) -> Self {
        Self {
            time: bucket_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    pub fn apply_observation(&mut self, price: f64, volume_delta: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume_delta;
    }

    pub fn is_well_formed(&self) -> bool {
        let finite = self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite();
        finite
            && self.volume >= 0.0
            && self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
    }
}

/// Normalized inbound observation, shared by both ingestion paths.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceObservation {
    pub observed_at: i64,
    pub price: f64,
    pub volume_delta: Option<f64>,
}

impl PriceObservation {
    pub fn at(observed_at: i64, price: f64) -> Self {
        Self {
            observed_at,
            price,
            volume_delta: None,
        }
    }
}

/// Value delivered to every handler registered on a series, one invocation
/// per bar mutation.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BarUpdate {
    pub series_key: SeriesKey,
    pub bar: Bar,
    pub direction: Direction,
}

/// Bonding-curve reserve snapshot for one instrument. SOL reserves are in
/// lamports, token reserves in base units (6 decimals).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CurveSnapshot {
    pub virtual_sol_reserves: u64,
    pub virtual_token_reserves: u64,
}

impl CurveSnapshot {
    /// Spot price in SOL per token from the virtual reserve ratio.
    /// Returns None when the token reserve is zero.
    pub fn spot_price(&self) -> Option<f64> {
        if self.virtual_token_reserves == 0 {
            return None;
        }
        let vsol = self.virtual_sol_reserves as f64;
        let vtok = self.virtual_token_reserves as f64;
        // lamports/1e9 over base-units/1e6 simplifies to ratio * 1e-3
        Some((vsol / vtok) * 1e-3)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FeedEventWire {
    #[serde(rename_all = "camelCase")]
    InstrumentUpdate {
        instrument_id: String,
        snapshot: CurveSnapshot,
    },
    PriceBatch {
        pairs: Vec<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Redraw {
        instrument_id: String,
    },
}

/// Validated inbound feed event.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    InstrumentUpdate {
        instrument_id: String,
        snapshot: CurveSnapshot,
    },
    PriceBatch {
        updates: Vec<(SeriesKey, f64)>,
    },
    Redraw {
        instrument_id: String,
    },
}

impl TryFrom<FeedEventWire> for FeedEvent {
    type Error = FeedError;

    fn try_from(value: FeedEventWire) -> Result<Self, Self::Error> {
        match value {
            FeedEventWire::InstrumentUpdate {
                instrument_id,
                snapshot,
            } => {
                if instrument_id.is_empty() {
                    return Err(FeedError::InvalidArgument(
                        "instrumentUpdate requires a non-empty instrumentId".to_string(),
                    ));
                }
                Ok(Self::InstrumentUpdate {
                    instrument_id,
                    snapshot,
                })
            }
            FeedEventWire::PriceBatch { pairs } => {
                if pairs.len() % 2 != 0 {
                    return Err(FeedError::InvalidArgument(format!(
                        "priceBatch pairs must have even length, got {}",
                        pairs.len()
                    )));
                }
                let mut updates = Vec::with_capacity(pairs.len() / 2);
                for chunk in pairs.chunks_exact(2) {
                    let (index, price) = (chunk[0], chunk[1]);
                    if !index.is_finite() || index < 0.0 || index.fract() != 0.0 {
                        return Err(FeedError::InvalidArgument(format!(
                            "priceBatch index must be a non-negative integer, got {index}"
                        )));
                    }
                    if index > SeriesKey::MAX as f64 {
                        return Err(FeedError::InvalidArgument(format!(
                            "priceBatch index {index} exceeds the series key range"
                        )));
                    }
                    // Non-finite prices pass through; the bar builder drops them.
                    updates.push((index as SeriesKey, price));
                }
                Ok(Self::PriceBatch { updates })
            }
            FeedEventWire::Redraw { instrument_id } => {
                if instrument_id.is_empty() {
                    return Err(FeedError::InvalidArgument(
                        "redraw requires a non-empty instrumentId".to_string(),
                    ));
                }
                Ok(Self::Redraw { instrument_id })
            }
        }
    }
}

pub fn parse_feed_payload(payload: &mut [u8]) -> Result<FeedEvent, FeedError> {
    let wire: FeedEventWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamArgs {
    pub ws_url: Option<String>,
    pub api_url: Option<String>,
    pub history_limit: Option<u16>,
    pub mock_mode: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ws_url: String,
    pub api_url: String,
    pub history_limit: u16,
    pub mock_mode: bool,
}

impl StartStreamArgs {
    pub fn normalize(self) -> Result<StreamConfig, FeedError> {
        let mock_mode = self.mock_mode.unwrap_or(DEFAULT_MOCK_MODE);

        let ws_url = self.ws_url.unwrap_or_default().trim().to_string();
        if !mock_mode && !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(FeedError::InvalidArgument(
                "wsUrl must use a ws:// or wss:// scheme".to_string(),
            ));
        }

        let api_url = self
            .api_url
            .unwrap_or_default()
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !mock_mode && !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(FeedError::InvalidArgument(
                "apiUrl must use an http:// or https:// scheme".to_string(),
            ));
        }

        let history_limit = self.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if !(MIN_HISTORY_LIMIT..=MAX_HISTORY_LIMIT).contains(&history_limit) {
            return Err(FeedError::InvalidArgument(format!(
                "historyLimit must be between {MIN_HISTORY_LIMIT} and {MAX_HISTORY_LIMIT}"
            )));
        }

        Ok(StreamConfig {
            ws_url,
            api_url,
            history_limit,
            mock_mode,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatusSnapshot {
    pub state: FeedConnectionState,
    pub last_event_ms: Option<i64>,
    pub reason: Option<String>,
}

impl FeedStatusSnapshot {
    pub fn stopped(reason: Option<String>) -> Self {
        Self {
            state: FeedConnectionState::Stopped,
            last_event_ms: None,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instrument_update_payload() {
        let mut payload = br#"{"type":"instrumentUpdate","instrumentId":"GxkX3mint","snapshot":{"virtualSolReserves":30000000000,"virtualTokenReserves":1073000191000000}}"#
            .to_vec();
        let event = parse_feed_payload(&mut payload).expect("instrumentUpdate should parse");

        match event {
            FeedEvent::InstrumentUpdate {
                instrument_id,
                snapshot,
            } => {
                assert_eq!(instrument_id, "GxkX3mint");
                assert_eq!(snapshot.virtual_sol_reserves, 30_000_000_000);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parses_price_batch_into_index_price_updates() {
        let mut payload = br#"{"type":"priceBatch","pairs":[0,1.5,3,2.75]}"#.to_vec();
        let event = parse_feed_payload(&mut payload).expect("priceBatch should parse");

        assert_eq!(
            event,
            FeedEvent::PriceBatch {
                updates: vec![(0, 1.5), (3, 2.75)]
            }
        );
    }

    #[test]
    fn rejects_odd_length_price_batch() {
        let mut payload = br#"{"type":"priceBatch","pairs":[0,1.5,3]}"#.to_vec();
        assert!(parse_feed_payload(&mut payload).is_err());
    }

    #[test]
    fn rejects_fractional_price_batch_index() {
        let mut payload = br#"{"type":"priceBatch","pairs":[1.5,2.0]}"#.to_vec();
        assert!(parse_feed_payload(&mut payload).is_err());
    }

    #[test]
    fn rejects_unknown_event_type() {
        let mut payload = br#"{"type":"orderBook","bids":[]}"#.to_vec();
        assert!(parse_feed_payload(&mut payload).is_err());
    }

    #[test]
    fn parses_redraw_event() {
        let mut payload = br#"{"type":"redraw","instrumentId":"GxkX3mint"}"#.to_vec();
        let event = parse_feed_payload(&mut payload).expect("redraw should parse");
        assert_eq!(
            event,
            FeedEvent::Redraw {
                instrument_id: "GxkX3mint".to_string()
            }
        );
    }

    #[test]
    fn spot_price_uses_virtual_reserve_ratio() {
        let snapshot = CurveSnapshot {
            virtual_sol_reserves: 30_000_000_000,
            virtual_token_reserves: 1_073_000_191_000_000,
        };
        let price = snapshot.spot_price().expect("price should exist");
        let expected = 30.0 / 1_073_000_191.0;
        assert!((price - expected).abs() < 1e-15);
    }

    #[test]
    fn spot_price_is_none_for_zero_token_reserves() {
        let snapshot = CurveSnapshot {
            virtual_sol_reserves: 1_000,
            virtual_token_reserves: 0,
        };
        assert!(snapshot.spot_price().is_none());
    }

    #[test]
    fn resolution_path_segment_uses_minutes_when_whole() {
        assert_eq!(Resolution::minutes(5).path_segment(), "5");
        assert_eq!(
            Resolution::from_millis(5_000)
                .expect("5s resolution is valid")
                .path_segment(),
            "5000ms"
        );
    }

    #[test]
    fn resolution_rejects_non_positive_period() {
        assert!(Resolution::from_millis(0).is_err());
        assert!(Resolution::from_millis(-60_000).is_err());
    }

    #[test]
    fn direction_compares_against_previous_close() {
        assert_eq!(Direction::from_prices(11.0, Some(10.0)), Direction::Up);
        assert_eq!(Direction::from_prices(9.0, Some(10.0)), Direction::Down);
        assert_eq!(Direction::from_prices(10.0, Some(10.0)), Direction::Flat);
        assert_eq!(Direction::from_prices(10.0, None), Direction::Flat);
    }

    #[test]
    fn normalizes_stream_args() {
        let config = StartStreamArgs {
            ws_url: Some("wss://stream.launchpad.io/feed".to_string()),
            api_url: Some("https://api.launchpad.io/".to_string()),
            history_limit: None,
            mock_mode: None,
        }
        .normalize()
        .expect("valid args should normalize");

        assert_eq!(config.ws_url, "wss://stream.launchpad.io/feed");
        assert_eq!(config.api_url, "https://api.launchpad.io");
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
        assert!(!config.mock_mode);
    }

    #[test]
    fn rejects_non_websocket_scheme() {
        let result = StartStreamArgs {
            ws_url: Some("https://stream.launchpad.io".to_string()),
            api_url: Some("https://api.launchpad.io".to_string()),
            history_limit: None,
            mock_mode: None,
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn validates_history_limit_range() {
        let result = StartStreamArgs {
            ws_url: Some("wss://stream.launchpad.io".to_string()),
            api_url: Some("https://api.launchpad.io".to_string()),
            history_limit: Some(9_000),
            mock_mode: None,
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn mock_mode_does_not_require_endpoints() {
        let config = StartStreamArgs {
            ws_url: None,
            api_url: None,
            history_limit: Some(50),
            mock_mode: Some(true),
        }
        .normalize()
        .expect("mock mode should not require endpoints");
        assert!(config.mock_mode);
    }

    #[test]
    fn well_formed_bar_accepts_equal_bounds() {
        let bar = Bar::from_observation(5_000, 10.0, 0.0);
        assert!(bar.is_well_formed());
    }

    #[test]
    fn well_formed_bar_rejects_inverted_range() {
        let bar = Bar {
            time: 5_000,
            open: 10.0,
            high: 9.0,
            low: 10.0,
            close: 10.0,
            volume: 0.0,
        };
        assert!(!bar.is_well_formed());
    }
}
