use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// OHLCV candlestick. Immutable once closed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Flat candle at a single price (all OHLC equal)
    pub fn flat(open_time: DateTime<Utc>, price: f64, volume: f64) -> Self {
        Self {
            open_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    /// Fold a trade into a still-forming candle
    pub fn absorb_trade(&mut self, price: f64, size: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += size;
    }
}

/// Raw market data as delivered by a stream or a poll, before normalization
#[derive(Debug, Clone, PartialEq)]
pub enum RawTick {
    /// A single executed trade (stream source)
    Trade {
        price: f64,
        size: f64,
        time: DateTime<Utc>,
    },
    /// A candle snapshot; `closed` is false while the bar is still forming
    Candle { candle: Candle, closed: bool },
    /// Clock signal with no price content; closes a partial candle that is due
    Heartbeat { time: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Trading signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// Indicator values for the most recent closed candle.
/// Fields are `None` during warm-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IndicatorSnapshot {
    pub candle_time: Option<DateTime<Utc>>,
    pub close: Option<f64>,
    pub rsi: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_mid: Option<f64>,
    pub bb_lower: Option<f64>,
}

impl IndicatorSnapshot {
    pub fn is_warm(&self) -> bool {
        self.close.is_some()
            && self.rsi.is_some()
            && self.bb_upper.is_some()
            && self.bb_mid.is_some()
            && self.bb_lower.is_some()
    }

    /// Position of the close inside the band, 0 = lower, 1 = upper
    pub fn band_position(&self) -> Option<f64> {
        let (close, upper, lower) = (self.close?, self.bb_upper?, self.bb_lower?);
        if upper == lower {
            return Some(0.5);
        }
        Some((close - lower) / (upper - lower))
    }
}

/// Discrete intent produced by the signal generator, with the snapshot
/// that produced it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeIntent {
    pub signal: Signal,
    pub strength: f64,
    pub snapshot: IndicatorSnapshot,
}

impl TradeIntent {
    pub fn hold(snapshot: IndicatorSnapshot) -> Self {
        Self {
            signal: Signal::Hold,
            strength: 0.0,
            snapshot,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Why an order was requested
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderReason {
    Signal,
    StopLoss,
    TakeProfit,
}

impl OrderReason {
    pub fn is_forced_exit(&self) -> bool {
        matches!(self, OrderReason::StopLoss | OrderReason::TakeProfit)
    }
}

/// Deterministic identifier of one logical order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Same (instrument, decision time, side) always yields the same key
    pub fn derive(instrument: &str, decided_at: DateTime<Utc>, side: Side) -> Self {
        let name = format!("{}|{}|{}", instrument, decided_at.to_rfc3339(), side);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Fully specified order produced by the risk gate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub side: Side,
    pub instrument: String,
    pub size_in_base: f64,
    pub order_type: OrderType,
    pub idempotency_key: IdempotencyKey,
    /// Price the decision was made at
    pub reference_price: f64,
    pub limit_price: Option<f64>,
    pub reason: OrderReason,
    pub decided_at: DateTime<Utc>,
}

impl OrderRequest {
    pub fn quote_value(&self) -> f64 {
        self.size_in_base * self.reference_price
    }
}

/// Terminal result of one submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OrderOutcome {
    Filled { fill_price: f64, fill_size: f64 },
    Rejected { reason: String },
    TimedOut,
    /// Outcome could not be observed; requires reconciliation
    Unknown,
}

impl OrderOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, OrderOutcome::Filled { .. })
    }
}

/// Confirmed fill handed to the position ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    pub idempotency_key: IdempotencyKey,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub reason: OrderReason,
    pub filled_at: DateTime<Utc>,
}

impl Fill {
    /// Build a fill from a request and its outcome; `None` unless filled
    pub fn from_outcome(
        request: &OrderRequest,
        outcome: &OrderOutcome,
        filled_at: DateTime<Utc>,
    ) -> Option<Self> {
        match outcome {
            OrderOutcome::Filled {
                fill_price,
                fill_size,
            } => Some(Self {
                idempotency_key: request.idempotency_key.clone(),
                side: request.side,
                price: *fill_price,
                size: *fill_size,
                reason: request.reason,
                filled_at,
            }),
            _ => None,
        }
    }
}

/// Open exposure in the instrument; absent when flat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub size_in_base: f64,
    /// Average entry price across entry fills
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Realized P&L of partial exits so far in this round trip
    #[serde(default)]
    pub realized_pnl: f64,
}

impl Position {
    /// Unrealized P&L in percent of entry price
    pub fn unrealized_pct(&self, mark_price: f64) -> f64 {
        (mark_price - self.entry_price) / self.entry_price * 100.0
    }

    pub fn value_at(&self, mark_price: f64) -> f64 {
        self.size_in_base * mark_price
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct CooldownTimer {
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl CooldownTimer {
    /// True while `now` is still inside the cooldown window
    pub fn is_active(&self, now: DateTime<Utc>, period: chrono::Duration) -> bool {
        match self.last_trade_at {
            Some(last) => now - last < period,
            None => false,
        }
    }

    pub fn remaining(&self, now: DateTime<Utc>, period: chrono::Duration) -> chrono::Duration {
        match self.last_trade_at {
            Some(last) => (period - (now - last)).max(chrono::Duration::zero()),
            None => chrono::Duration::zero(),
        }
    }
}

/// Account figures the risk gate sizes against, in quote currency
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AccountState {
    pub portfolio_value: f64,
    pub available_balance: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let a = IdempotencyKey::derive("BTC-USD", t, Side::Buy);
        let b = IdempotencyKey::derive("BTC-USD", t, Side::Buy);
        assert_eq!(a, b);

        let other_side = IdempotencyKey::derive("BTC-USD", t, Side::Sell);
        let other_time = IdempotencyKey::derive("BTC-USD", t + Duration::minutes(1), Side::Buy);
        let other_pair = IdempotencyKey::derive("ETH-USD", t, Side::Buy);
        assert_ne!(a, other_side);
        assert_ne!(a, other_time);
        assert_ne!(a, other_pair);
    }

    #[test]
    fn test_cooldown_timer() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let period = Duration::seconds(300);

        let idle = CooldownTimer::default();
        assert!(!idle.is_active(t, period));

        let timer = CooldownTimer {
            last_trade_at: Some(t),
        };
        assert!(timer.is_active(t + Duration::seconds(299), period));
        assert!(!timer.is_active(t + Duration::seconds(300), period));
        assert_eq!(
            timer.remaining(t + Duration::seconds(100), period),
            Duration::seconds(200)
        );
    }

    #[test]
    fn test_absorb_trade() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut candle = Candle::flat(t, 100.0, 1.0);

        candle.absorb_trade(103.0, 0.5);
        candle.absorb_trade(98.0, 0.25);

        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 103.0);
        assert_eq!(candle.low, 98.0);
        assert_eq!(candle.close, 98.0);
        assert_eq!(candle.volume, 1.75);
    }

    #[test]
    fn test_band_position() {
        let snapshot = IndicatorSnapshot {
            close: Some(95.0),
            bb_upper: Some(110.0),
            bb_lower: Some(90.0),
            ..Default::default()
        };
        assert_eq!(snapshot.band_position(), Some(0.25));
    }

    #[test]
    fn test_fill_only_from_filled_outcome() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let request = OrderRequest {
            side: Side::Buy,
            instrument: "BTC-USD".to_string(),
            size_in_base: 0.1,
            order_type: OrderType::Market,
            idempotency_key: IdempotencyKey::derive("BTC-USD", t, Side::Buy),
            reference_price: 100.0,
            limit_price: None,
            reason: OrderReason::Signal,
            decided_at: t,
        };

        assert!(Fill::from_outcome(&request, &OrderOutcome::Unknown, t).is_none());
        let fill = Fill::from_outcome(
            &request,
            &OrderOutcome::Filled {
                fill_price: 101.0,
                fill_size: 0.1,
            },
            t,
        )
        .unwrap();
        assert_eq!(fill.side, Side::Buy);
        assert_eq!(fill.price, 101.0);
    }
}
