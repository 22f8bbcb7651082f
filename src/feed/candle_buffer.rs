use crate::error::BotError;
use crate::models::{Candle, RawTick};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

/// Bounded, strictly ordered run of closed candles
#[derive(Debug, Clone, PartialEq)]
pub struct CandleSeries {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl CandleSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    /// Append if strictly newer than the last candle; evicts the oldest on overflow.
    /// Returns false when the candle was dropped as a duplicate or out of order.
    fn push(&mut self, candle: Candle) -> bool {
        if let Some(last) = self.candles.back() {
            if candle.open_time <= last.open_time {
                return false;
            }
        }
        self.candles.push_back(candle);
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
        true
    }
}

/// Missing candles between two consecutive closed candles
#[derive(Debug, Clone, PartialEq)]
pub struct FeedGap {
    pub expected: DateTime<Utc>,
    pub received: DateTime<Utc>,
}

/// What a single tick changed in the buffer
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ingested {
    pub closed: Option<Candle>,
    pub gap: Option<FeedGap>,
}

#[derive(Debug)]
struct FeedState {
    series: CandleSeries,
    partial: Option<Candle>,
    /// Wall-clock time the newest closed candle was appended
    last_close_at: DateTime<Utc>,
    latest_price: Option<f64>,
    gaps: u64,
    dropped: u64,
}

/// Thread-safe market feed buffer for one instrument
///
/// A single ingestion task writes; decision cycles read snapshots.
#[derive(Clone)]
pub struct FeedBuffer {
    state: Arc<RwLock<FeedState>>,
    instrument: String,
    interval: Duration,
    staleness_window: Duration,
}

impl FeedBuffer {
    /// Create a new feed buffer
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of closed candles kept
    /// * `interval` - Candle interval used to bucket trades and detect gaps
    /// * `staleness_window` - Maximum age of the newest closed candle
    pub fn new(
        instrument: impl Into<String>,
        capacity: usize,
        interval: Duration,
        staleness_window: Duration,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(FeedState {
                series: CandleSeries::new(capacity),
                partial: None,
                last_close_at: Utc::now(),
                latest_price: None,
                gaps: 0,
                dropped: 0,
            })),
            instrument: instrument.into(),
            interval,
            staleness_window,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Normalize a raw tick, received now
    pub fn ingest(&self, tick: RawTick) -> Result<Ingested> {
        self.ingest_at(tick, Utc::now())
    }

    /// Normalize a raw tick received at `received_at`
    pub fn ingest_at(&self, tick: RawTick, received_at: DateTime<Utc>) -> Result<Ingested> {
        let mut guard = self.state.write().map_err(|e| BotError::Feed(e.to_string()))?;
        let state: &mut FeedState = &mut guard;

        match tick {
            RawTick::Trade { price, size, time } => {
                if !(price.is_finite() && price > 0.0) {
                    state.dropped += 1;
                    return Ok(Ingested::default());
                }
                state.latest_price = Some(price);
                let bucket = self.bucket_start(time)?;

                match state.partial.as_ref().map(|p| p.open_time) {
                    Some(open_time) if open_time == bucket => {
                        if let Some(partial) = state.partial.as_mut() {
                            partial.absorb_trade(price, size);
                        }
                        Ok(Ingested::default())
                    }
                    Some(open_time) if open_time > bucket => {
                        state.dropped += 1;
                        Ok(Ingested::default())
                    }
                    _ => {
                        if self.is_closed_already(state, bucket) {
                            state.dropped += 1;
                            return Ok(Ingested::default());
                        }
                        let previous = state.partial.replace(Candle::flat(bucket, price, size));
                        match previous {
                            Some(done) => Ok(self.append(state, done, received_at)),
                            None => Ok(Ingested::default()),
                        }
                    }
                }
            }
            RawTick::Candle { candle, closed } => {
                if !candle.close.is_finite() || candle.close <= 0.0 {
                    state.dropped += 1;
                    return Ok(Ingested::default());
                }
                state.latest_price = Some(candle.close);

                if closed {
                    if matches!(&state.partial, Some(p) if p.open_time <= candle.open_time) {
                        state.partial = None;
                    }
                    return Ok(self.append(state, candle, received_at));
                }

                if self.is_closed_already(state, candle.open_time) {
                    state.dropped += 1;
                    return Ok(Ingested::default());
                }
                match state.partial.take() {
                    Some(older) if older.open_time < candle.open_time => {
                        state.partial = Some(candle);
                        Ok(self.append(state, older, received_at))
                    }
                    Some(newer) if newer.open_time > candle.open_time => {
                        state.partial = Some(newer);
                        state.dropped += 1;
                        Ok(Ingested::default())
                    }
                    _ => {
                        state.partial = Some(candle);
                        Ok(Ingested::default())
                    }
                }
            }
            RawTick::Heartbeat { time } => {
                let due = matches!(&state.partial, Some(p) if p.open_time + self.interval <= time);
                if !due {
                    return Ok(Ingested::default());
                }
                match state.partial.take() {
                    Some(done) => Ok(self.append(state, done, received_at)),
                    None => Ok(Ingested::default()),
                }
            }
        }
    }

    /// Read-only snapshot of the closed candles
    pub fn current_series(&self) -> Result<CandleSeries> {
        let state = self.state.read().map_err(|e| BotError::Feed(e.to_string()))?;
        Ok(state.series.clone())
    }

    /// The still-forming candle, if any
    pub fn partial(&self) -> Result<Option<Candle>> {
        let state = self.state.read().map_err(|e| BotError::Feed(e.to_string()))?;
        Ok(state.partial.clone())
    }

    /// Most recent traded or candle close price
    pub fn latest_price(&self) -> Option<f64> {
        self.state.read().ok().and_then(|s| s.latest_price)
    }

    pub fn last_closed_time(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.series.last().map(|c| c.open_time))
    }

    pub fn gap_count(&self) -> u64 {
        self.state.read().map(|s| s.gaps).unwrap_or(0)
    }

    pub fn dropped_count(&self) -> u64 {
        self.state.read().map(|s| s.dropped).unwrap_or(0)
    }

    /// Fails with `StaleFeed` when no closed candle arrived within the window
    pub fn check_staleness(&self, now: DateTime<Utc>) -> Result<()> {
        let state = self.state.read().map_err(|e| BotError::Feed(e.to_string()))?;
        let age = now - state.last_close_at;
        if age > self.staleness_window {
            return Err(BotError::StaleFeed {
                last_close_age_secs: age.num_seconds(),
                window_secs: self.staleness_window.num_seconds(),
            });
        }
        Ok(())
    }

    fn append(&self, state: &mut FeedState, candle: Candle, received_at: DateTime<Utc>) -> Ingested {
        let gap = state.series.last().and_then(|last| {
            let expected = last.open_time + self.interval;
            (candle.open_time > expected).then(|| FeedGap {
                expected,
                received: candle.open_time,
            })
        });

        if !state.series.push(candle.clone()) {
            tracing::debug!(
                instrument = %self.instrument,
                open_time = %candle.open_time,
                "Dropped duplicate or out-of-order candle"
            );
            state.dropped += 1;
            return Ingested::default();
        }

        if let Some(g) = &gap {
            state.gaps += 1;
            tracing::warn!(
                instrument = %self.instrument,
                expected = %g.expected,
                received = %g.received,
                "Gap in candle series"
            );
        }

        state.last_close_at = received_at;
        Ingested {
            closed: Some(candle),
            gap,
        }
    }

    fn is_closed_already(&self, state: &FeedState, open_time: DateTime<Utc>) -> bool {
        state
            .series
            .last()
            .map(|last| open_time <= last.open_time)
            .unwrap_or(false)
    }

    fn bucket_start(&self, time: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let secs = self.interval.num_seconds().max(1);
        let ts = time.timestamp();
        DateTime::<Utc>::from_timestamp(ts - ts.rem_euclid(secs), 0)
            .ok_or_else(|| BotError::Feed(format!("timestamp out of range: {}", time)))
    }
}
