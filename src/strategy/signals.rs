use crate::config::StrategyConfig;
use crate::models::{IndicatorSnapshot, Signal, TradeIntent};

/// Maps an indicator snapshot to a trade intent.
///
/// BUY needs RSI below the oversold threshold *and* the close at or below the
/// lower band; SELL mirrors it on the upper side. Anything else is HOLD.
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    config: StrategyConfig,
}

impl SignalGenerator {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn decide(&self, snapshot: &IndicatorSnapshot) -> TradeIntent {
        let (Some(rsi), Some(close), Some(upper), Some(lower)) =
            (snapshot.rsi, snapshot.close, snapshot.bb_upper, snapshot.bb_lower)
        else {
            return TradeIntent::hold(snapshot.clone());
        };
        if snapshot.bb_mid.is_none() {
            return TradeIntent::hold(snapshot.clone());
        }

        let buy = rsi < self.config.rsi_oversold && close <= lower;
        let sell = rsi > self.config.rsi_overbought && close >= upper;
        debug_assert!(
            !(buy && sell),
            "BUY and SELL conditions both hold (rsi={}, close={}, lower={}, upper={})",
            rsi,
            close,
            lower,
            upper
        );

        let signal = match (buy, sell) {
            (true, false) => Signal::Buy,
            (false, true) => Signal::Sell,
            _ => Signal::Hold,
        };

        if signal == Signal::Hold {
            return TradeIntent::hold(snapshot.clone());
        }

        TradeIntent {
            signal,
            strength: self.strength(snapshot),
            snapshot: snapshot.clone(),
        }
    }

    /// 0..1 extremity of RSI and band position, averaged
    pub fn strength(&self, snapshot: &IndicatorSnapshot) -> f64 {
        let (Some(rsi), Some(position)) = (snapshot.rsi, snapshot.band_position()) else {
            return 0.0;
        };
        let oversold = self.config.rsi_oversold;
        let overbought = self.config.rsi_overbought;

        let rsi_strength = if rsi <= oversold && oversold > 0.0 {
            (oversold - rsi) / oversold
        } else if rsi >= overbought && overbought < 100.0 {
            (rsi - overbought) / (100.0 - overbought)
        } else {
            0.0
        };

        let band_strength = if position <= 0.1 {
            (0.1 - position) / 0.1
        } else if position >= 0.9 {
            (position - 0.9) / 0.1
        } else {
            0.0
        };

        ((rsi_strength + band_strength) / 2.0).clamp(0.0, 1.0)
    }
}
