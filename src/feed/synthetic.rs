use super::price_feed::CandleFetcher;
use crate::config::CandleInterval;
use crate::error::BotError;
use crate::models::Candle;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady uptrend with noise (+2% daily average)
    Uptrend,
    /// Steady downtrend with noise (-2% daily average)
    Downtrend,
    /// Sideways/choppy market (±1% around mean)
    Sideways,
    /// High volatility (±5% large swings)
    Volatile,
    /// Every 50th candle missing
    WithGaps,
    /// Repeating cycle: slow rise, then a 25% slide
    Crash,
}

impl std::str::FromStr for MarketScenario {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uptrend" => Ok(MarketScenario::Uptrend),
            "downtrend" => Ok(MarketScenario::Downtrend),
            "sideways" => Ok(MarketScenario::Sideways),
            "volatile" => Ok(MarketScenario::Volatile),
            "gaps" | "with_gaps" => Ok(MarketScenario::WithGaps),
            "crash" => Ok(MarketScenario::Crash),
            other => Err(format!("unknown scenario: {}", other)),
        }
    }
}

const CRASH_CYCLE: usize = 200;
const DEFAULT_RETENTION: usize = 1_000;

struct PathState {
    rng: StdRng,
    price: f64,
    /// Path index of `candles[0]`; path index i opens at anchor + i * interval
    first_index: usize,
    candles: VecDeque<Candle>,
}

/// Seeded, time-anchored synthetic market usable as a candle source.
///
/// The path is generated lazily and memoized, so repeated fetches of the
/// same window return identical candles. Only the newest `retention`
/// candles are kept; older ones drop out of later fetches.
pub struct SyntheticMarket {
    scenario: MarketScenario,
    interval: Duration,
    anchor: DateTime<Utc>,
    base_price: f64,
    base_volume: f64,
    retention: usize,
    state: Mutex<PathState>,
}

impl SyntheticMarket {
    /// Create a new market with a seed for reproducibility
    pub fn new(seed: u64, scenario: MarketScenario, interval: Duration, anchor: DateTime<Utc>) -> Self {
        let base_price = 50_000.0;
        Self {
            scenario,
            interval,
            anchor,
            base_price,
            base_volume: 12.0,
            retention: DEFAULT_RETENTION,
            state: Mutex::new(PathState {
                rng: StdRng::seed_from_u64(seed),
                price: base_price,
                first_index: 0,
                candles: VecDeque::new(),
            }),
        }
    }

    /// Keep at most `candles` memoized, typically the series capacity
    pub fn with_retention(mut self, candles: usize) -> Self {
        self.retention = candles.max(1);
        self
    }

    /// Market whose path starts `history` intervals before now
    pub fn with_history(seed: u64, scenario: MarketScenario, interval: Duration, history: usize) -> Self {
        let secs = interval.num_seconds().max(1);
        let ts = Utc::now().timestamp();
        let now_floor = DateTime::<Utc>::from_timestamp(ts - ts.rem_euclid(secs), 0).unwrap_or_else(Utc::now);
        Self::new(seed, scenario, interval, now_floor - interval * history as i32)
    }

    /// First `n` candles of the path, oldest first
    pub fn generate(&self, n: usize) -> Result<Vec<Candle>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let end = self.anchor + self.interval * (n as i32 - 1);
        self.window(self.anchor, end)
    }

    fn window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Candle>> {
        if end < self.anchor {
            return Ok(Vec::new());
        }
        let step = self.interval.num_seconds().max(1);
        let last_index = ((end - self.anchor).num_seconds() / step) as usize;

        let mut state = self
            .state
            .lock()
            .map_err(|e| BotError::Feed(e.to_string()))?;
        let next = state.first_index + state.candles.len();
        for i in next..=last_index {
            let candle = self.next_candle(&mut state, i);
            state.candles.push_back(candle);
        }

        let first = state.first_index;
        let window = state
            .candles
            .iter()
            .enumerate()
            .map(|(k, c)| (first + k, c))
            .take_while(|(i, _)| *i <= last_index)
            .filter(|(i, c)| c.open_time >= start && !self.is_gap(*i))
            .map(|(_, c)| c.clone())
            .collect();

        while state.candles.len() > self.retention {
            state.candles.pop_front();
            state.first_index += 1;
        }
        Ok(window)
    }

    fn is_gap(&self, index: usize) -> bool {
        self.scenario == MarketScenario::WithGaps && index % 50 == 49
    }

    fn next_candle(&self, state: &mut PathState, i: usize) -> Candle {
        let price = state.price;
        let per_day = 24.0 * 60.0 / (self.interval.num_minutes().max(1) as f64);

        let change = match self.scenario {
            MarketScenario::Uptrend => {
                price * (0.02 / per_day) + price * state.rng.gen_range(-0.001..0.001)
            }
            MarketScenario::Downtrend => {
                price * (-0.02 / per_day) + price * state.rng.gen_range(-0.001..0.001)
            }
            MarketScenario::Sideways | MarketScenario::WithGaps => {
                (self.base_price - price) * 0.1 + price * state.rng.gen_range(-0.01..0.01)
            }
            MarketScenario::Volatile => price * state.rng.gen_range(-0.05..0.05),
            MarketScenario::Crash => {
                let phase = i % CRASH_CYCLE;
                if phase < CRASH_CYCLE / 2 {
                    price * state.rng.gen_range(-0.005..0.01)
                } else {
                    let drop_rate = -0.25 / (CRASH_CYCLE as f64 / 2.0);
                    price * drop_rate + price * state.rng.gen_range(-0.005..0.005)
                }
            }
        };

        state.price = (price + change).max(self.base_price * 0.2);
        let open_time = self.anchor + self.interval * i as i32;
        self.create_candle(&mut state.rng, state.price, open_time)
    }

    /// Realistic OHLC around the close price
    fn create_candle(&self, rng: &mut StdRng, close: f64, open_time: DateTime<Utc>) -> Candle {
        let noise_pct = 0.002;

        let high = close * (1.0 + rng.gen_range(0.0..noise_pct));
        let low = close * (1.0 - rng.gen_range(0.0..noise_pct));
        let open = (close * (1.0 + rng.gen_range(-noise_pct..noise_pct))).clamp(low, high);
        let volume = self.base_volume * rng.gen_range(0.7..1.3);

        Candle {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

#[async_trait]
impl CandleFetcher for SyntheticMarket {
    async fn fetch_candles(
        &self,
        _instrument: &str,
        _interval: CandleInterval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        self.window(start, end)
    }
}
