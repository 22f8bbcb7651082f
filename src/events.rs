use crate::models::{IdempotencyKey, OrderOutcome, Side, Signal};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Structured record of everything the pipeline decides or observes
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    CandleClosed {
        instrument: String,
        open_time: DateTime<Utc>,
        close: f64,
    },
    FeedGap {
        instrument: String,
        expected: DateTime<Utc>,
        received: DateTime<Utc>,
    },
    StaleFeed {
        instrument: String,
        last_close_age_secs: i64,
    },
    Signal {
        instrument: String,
        signal: Signal,
        strength: f64,
        rsi: Option<f64>,
        close: Option<f64>,
    },
    Vetoed {
        instrument: String,
        side: Option<Side>,
        reason: String,
    },
    OrderTransition {
        key: IdempotencyKey,
        from: String,
        to: String,
    },
    OrderOutcome {
        key: IdempotencyKey,
        side: Side,
        outcome: OrderOutcome,
    },
    ReconciliationStarted {
        key: IdempotencyKey,
    },
    ReconciliationResolved {
        key: IdempotencyKey,
        outcome: OrderOutcome,
    },
    /// Fatal: position truth cannot be established, no further orders
    TradingHalted {
        instrument: String,
        key: IdempotencyKey,
        elapsed_secs: u64,
    },
    LedgerUpdated {
        instrument: String,
        position_size: f64,
        cash: f64,
        realized_pnl: f64,
    },
}

impl PipelineEvent {
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            PipelineEvent::TradingHalted { .. }
                | PipelineEvent::StaleFeed { .. }
                | PipelineEvent::OrderOutcome {
                    outcome: OrderOutcome::Filled { .. },
                    ..
                }
        )
    }
}

/// Destination for pipeline events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Writes events to the tracing subscriber under `coinbot::events`
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &PipelineEvent) {
        let payload = serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));
        match event {
            PipelineEvent::TradingHalted { .. } => {
                error!(target: "coinbot::events", event = %payload, "FATAL: trading halted")
            }
            PipelineEvent::StaleFeed { .. }
            | PipelineEvent::FeedGap { .. }
            | PipelineEvent::ReconciliationStarted { .. } => {
                warn!(target: "coinbot::events", event = %payload)
            }
            _ => info!(target: "coinbot::events", event = %payload),
        }
    }
}

/// Keeps every event in memory; used by tests and the `status` command
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&PipelineEvent) -> bool) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| pred(ev)).count())
            .unwrap_or(0)
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Posts alert events to a Discord webhook. Delivery is best-effort.
#[derive(Debug, Clone)]
pub struct DiscordSink {
    client: reqwest::Client,
    webhook_url: String,
}

impl DiscordSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }

    fn format(event: &PipelineEvent) -> String {
        match event {
            PipelineEvent::TradingHalted {
                instrument,
                key,
                elapsed_secs,
            } => format!(
                "**TRADING HALTED** {}\norder {} unresolved after {}s; manual intervention required",
                instrument, key, elapsed_secs
            ),
            PipelineEvent::StaleFeed {
                instrument,
                last_close_age_secs,
            } => format!(
                "Stale feed on {}: last closed candle {}s ago",
                instrument, last_close_age_secs
            ),
            PipelineEvent::OrderOutcome {
                side,
                outcome: OrderOutcome::Filled {
                    fill_price,
                    fill_size,
                },
                ..
            } => format!("{} filled: {:.8} @ {:.2}", side, fill_size, fill_price),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

impl EventSink for DiscordSink {
    fn emit(&self, event: &PipelineEvent) {
        if !event.is_alert() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let client = self.client.clone();
        let url = self.webhook_url.clone();
        let body = serde_json::json!({ "content": Self::format(event) });
        handle.spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!("Discord webhook failed: {}", resp.status())
                }
                Err(e) => warn!("Discord webhook error: {}", e),
                _ => {}
            }
        });
    }
}

/// Broadcasts to several sinks
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &PipelineEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(TracingSink));

        fanout.emit(&PipelineEvent::StaleFeed {
            instrument: "BTC-USD".to_string(),
            last_close_age_secs: 400,
        });

        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = PipelineEvent::Vetoed {
            instrument: "BTC-USD".to_string(),
            side: Some(Side::Buy),
            reason: "cooldown_active".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "vetoed");
        assert_eq!(json["side"], "BUY");
    }

    #[test]
    fn test_alert_classification() {
        let halted = PipelineEvent::TradingHalted {
            instrument: "BTC-USD".to_string(),
            key: IdempotencyKey::from("k"),
            elapsed_secs: 300,
        };
        let fill = PipelineEvent::OrderOutcome {
            key: IdempotencyKey::from("k"),
            side: Side::Sell,
            outcome: OrderOutcome::Filled {
                fill_price: 100.0,
                fill_size: 1.0,
            },
        };
        let rejected = PipelineEvent::OrderOutcome {
            key: IdempotencyKey::from("k"),
            side: Side::Sell,
            outcome: OrderOutcome::Rejected {
                reason: "x".to_string(),
            },
        };

        assert!(halted.is_alert());
        assert!(fill.is_alert());
        assert!(!rejected.is_alert());
        assert!(DiscordSink::format(&halted).contains("TRADING HALTED"));
    }
}
