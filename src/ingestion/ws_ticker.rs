use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::models::PriceTick;

use super::{FeedError, PriceFeed};

const PING_INTERVAL: Duration = Duration::from_secs(25);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One entry of an aggregate mini-ticker frame.
#[derive(Debug, Deserialize)]
struct MiniTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    close: String,
}

#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
    method: &'static str,
    params: [&'a str; 1],
    id: u64,
}

/// WebSocket adapter for an all-markets mini-ticker stream.
pub struct WsTickerFeed {
    url: String,
    stream: String,
    write: Option<SplitSink<WsStream, Message>>,
    read: Option<SplitStream<WsStream>>,
    ping_timer: Option<Interval>,
    pending: VecDeque<PriceTick>,
    request_id: u64,
}

impl WsTickerFeed {
    pub fn new(url: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: stream.into(),
            write: None,
            read: None,
            ping_timer: None,
            pending: VecDeque::new(),
            request_id: 0,
        }
    }
}

#[async_trait]
impl PriceFeed for WsTickerFeed {
    async fn connect(&mut self) -> Result<(), FeedError> {
        self.disconnect().await;
        tracing::info!(url = %self.url, "Connecting to price feed...");

        let (ws_stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        let (write, read) = ws_stream.split();
        self.write = Some(write);
        self.read = Some(read);

        let mut ping_timer = interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping_timer.tick().await; // consume the first immediate tick
        self.ping_timer = Some(ping_timer);

        tracing::info!("Price feed connected");
        Ok(())
    }

    async fn subscribe_all(&mut self) -> Result<(), FeedError> {
        let write = self
            .write
            .as_mut()
            .ok_or_else(|| FeedError::Subscribe("not connected".into()))?;

        self.request_id += 1;
        let request = SubscribeRequest {
            method: "SUBSCRIBE",
            params: [self.stream.as_str()],
            id: self.request_id,
        };
        let body = serde_json::to_string(&request).map_err(|e| FeedError::Subscribe(e.to_string()))?;
        write
            .send(Message::Text(body.into()))
            .await
            .map_err(|e| FeedError::Subscribe(e.to_string()))?;

        tracing::info!(stream = %self.stream, "Subscribed to aggregate ticker stream");
        Ok(())
    }

    async fn next_tick(&mut self) -> Result<PriceTick, FeedError> {
        loop {
            if let Some(tick) = self.pending.pop_front() {
                return Ok(tick);
            }

            let (Some(read), Some(write), Some(ping_timer)) =
                (self.read.as_mut(), self.write.as_mut(), self.ping_timer.as_mut())
            else {
                return Err(FeedError::Closed);
            };

            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.pending.extend(parse_mini_tickers(text.as_ref()));
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| FeedError::Stream(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::warn!("Price feed server sent close frame");
                            return Err(FeedError::Closed);
                        }
                        Some(Ok(_)) => {} // Binary, Pong, Frame
                        Some(Err(e)) => return Err(FeedError::Stream(e.to_string())),
                        None => return Err(FeedError::Closed),
                    }
                }
                _ = ping_timer.tick() => {
                    write
                        .send(Message::Ping(Vec::new().into()))
                        .await
                        .map_err(|e| FeedError::Stream(e.to_string()))?;
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut write) = self.write.take() {
            if let Err(e) = write.close().await {
                tracing::debug!(error = %e, "Price feed close handshake failed");
            }
        }
        self.read = None;
        self.ping_timer = None;
        self.pending.clear();
    }
}

/// Parse a text frame into ticks. Accepts a bare array, a single object, or
/// a combined-stream wrapper `{"stream": .., "data": [..]}`. Anything else
/// (subscription acks, heartbeats) yields nothing.
fn parse_mini_tickers(text: &str) -> Vec<PriceTick> {
    let tickers = if let Ok(tickers) = serde_json::from_str::<Vec<MiniTicker>>(text) {
        tickers
    } else if let Ok(ticker) = serde_json::from_str::<MiniTicker>(text) {
        vec![ticker]
    } else if let Some(data) = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("data").cloned())
    {
        serde_json::from_value::<Vec<MiniTicker>>(data.clone())
            .or_else(|_| serde_json::from_value::<MiniTicker>(data).map(|t| vec![t]))
            .unwrap_or_default()
    } else {
        tracing::trace!(raw = %text, "Non-ticker message received");
        Vec::new()
    };

    tickers
        .into_iter()
        .filter_map(|t| {
            let price = Decimal::from_str(&t.close).ok()?;
            (price > Decimal::ZERO).then(|| PriceTick::new(&t.symbol, price))
        })
        .collect()
}
