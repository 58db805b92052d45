use crate::chart::types::{Bar, Resolution};
use crate::error::FeedError;
use reqwest::Client;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type FeedWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn chart_endpoint(api_url: &str, resolution: Resolution, instrument_id: &str, count: u16) -> String {
    format!(
        "{api_url}/chart/{}/{instrument_id}/{count}",
        resolution.path_segment()
    )
}

pub async fn connect_feed_stream(ws_url: &str) -> Result<FeedWsStream, FeedError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(ws_url, Some(ws_config), true).await?;
    Ok(stream)
}

/// Fetch historical bars for one series. Returns them ascending by time
/// with duplicate buckets collapsed; malformed records fail the whole
/// fetch so callers never seed charts from partial garbage.
pub async fn fetch_chart_history(
    client: &Client,
    api_url: &str,
    resolution: Resolution,
    instrument_id: &str,
    count: u16,
) -> Result<Vec<Bar>, FeedError> {
    let endpoint = chart_endpoint(api_url, resolution, instrument_id, count);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let mut bars = response.json::<Vec<Bar>>().await?;

    for bar in &bars {
        if !bar.is_well_formed() {
            return Err(FeedError::InvalidArgument(format!(
                "chart history for {instrument_id} contains a malformed bar at {}",
                bar.time
            )));
        }
    }

    bars.sort_unstable_by_key(|bar| bar.time);
    bars.dedup_by_key(|bar| bar.time);
    Ok(bars)
}
