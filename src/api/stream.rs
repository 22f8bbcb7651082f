use crate::error::BotError;
use crate::feed::TradeStream;
use crate::models::RawTick;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Coinbase Advanced Trade market data websocket
pub struct CoinbaseStream {
    ws_url: String,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    events: Vec<StreamEvent>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    trades: Vec<TradeEntry>,
}

#[derive(Debug, Deserialize)]
struct TradeEntry {
    product_id: String,
    price: String,
    size: String,
    time: DateTime<Utc>,
}

impl CoinbaseStream {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }
}

/// Ticks carried by one text frame; unknown channels yield nothing
fn parse_message(text: &str, instrument: &str) -> Result<Vec<RawTick>> {
    let message: StreamMessage = serde_json::from_str(text)?;

    match message.channel.as_str() {
        "market_trades" => {
            let mut ticks = Vec::new();
            for trade in message.events.into_iter().flat_map(|e| e.trades) {
                if trade.product_id != instrument {
                    continue;
                }
                let (Ok(price), Ok(size)) = (trade.price.parse::<f64>(), trade.size.parse::<f64>()) else {
                    tracing::warn!(price = %trade.price, size = %trade.size, "Unparseable trade skipped");
                    continue;
                };
                ticks.push(RawTick::Trade {
                    price,
                    size,
                    time: trade.time,
                });
            }
            // snapshots list newest first
            ticks.sort_by_key(|t| match t {
                RawTick::Trade { time, .. } => *time,
                _ => DateTime::<Utc>::MIN_UTC,
            });
            Ok(ticks)
        }
        "heartbeats" => Ok(message
            .timestamp
            .map(|time| vec![RawTick::Heartbeat { time }])
            .unwrap_or_default()),
        _ => Ok(Vec::new()),
    }
}

#[async_trait]
impl TradeStream for CoinbaseStream {
    async fn run(&self, instrument: &str, tx: mpsc::Sender<RawTick>) -> Result<()> {
        tracing::info!("Connecting to Coinbase stream: {}", self.ws_url);

        let (ws_stream, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| BotError::Feed(format!("websocket connect failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        for channel in ["market_trades", "heartbeats"] {
            let subscribe = json!({
                "type": "subscribe",
                "product_ids": [instrument],
                "channel": channel,
            });
            write
                .send(Message::Text(subscribe.to_string()))
                .await
                .map_err(|e| BotError::Feed(format!("subscribe failed: {}", e)))?;
        }
        tracing::info!(instrument, "Subscribed to market_trades and heartbeats");

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match parse_message(&text, instrument) {
                    Ok(ticks) => {
                        for tick in ticks {
                            if tx.send(tick).await.is_err() {
                                tracing::debug!("Tick receiver closed, leaving stream");
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => tracing::warn!("Failed to parse stream message: {}", e),
                },
                Ok(Message::Ping(data)) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(frame)) => {
                    tracing::warn!("Coinbase stream closed: {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(BotError::Feed(format!("websocket error: {}", e)));
                }
            }
        }

        Err(BotError::Feed("websocket stream ended".to_string()))
    }
}
