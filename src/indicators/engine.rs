use super::bollinger::calculate_bollinger;
use super::rsi::WilderRsi;
use crate::config::StrategyConfig;
use crate::feed::CandleSeries;
use crate::models::IndicatorSnapshot;
use chrono::{DateTime, Utc};

/// Maintains indicator state across decision cycles.
///
/// RSI advances one close at a time over candles newer than the last one
/// processed; Bollinger Bands are taken over the trailing window.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    config: StrategyConfig,
    rsi: WilderRsi,
    last_processed: Option<DateTime<Utc>>,
}

impl IndicatorEngine {
    pub fn new(config: StrategyConfig) -> Self {
        let rsi = WilderRsi::new(config.rsi_period);
        Self {
            config,
            rsi,
            last_processed: None,
        }
    }

    /// Candles needed before every snapshot field is present
    pub fn warmup_len(&self) -> usize {
        self.config.max_lookback()
    }

    pub fn update(&mut self, series: &CandleSeries) -> IndicatorSnapshot {
        let Some(last) = series.last() else {
            return IndicatorSnapshot::default();
        };

        if self.needs_replay(series) {
            tracing::debug!(
                candles = series.len(),
                "Replaying indicator state over full series"
            );
            self.rsi = WilderRsi::new(self.config.rsi_period);
            self.last_processed = None;
        }

        for candle in series.iter() {
            if self.last_processed.map_or(true, |t| candle.open_time > t) {
                self.rsi.update(candle.close);
                self.last_processed = Some(candle.open_time);
            }
        }

        let closes = series.closes();
        let bands = calculate_bollinger(
            &closes,
            self.config.bollinger_period,
            self.config.bollinger_std,
        );

        IndicatorSnapshot {
            candle_time: Some(last.open_time),
            close: Some(last.close),
            rsi: self.rsi.value(),
            bb_upper: bands.map(|b| b.upper),
            bb_mid: bands.map(|b| b.mid),
            bb_lower: bands.map(|b| b.lower),
        }
    }

    /// The series went backwards, or skipped past everything we have seen
    fn needs_replay(&self, series: &CandleSeries) -> bool {
        let Some(processed) = self.last_processed else {
            return false;
        };
        let newest = series.last().map(|c| c.open_time);
        let oldest = series.iter().next().map(|c| c.open_time);
        newest < Some(processed) || oldest > Some(processed)
    }
}
