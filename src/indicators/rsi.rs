/// Calculate Relative Strength Index (RSI) with Wilder's smoothing
///
/// Average gain and loss are seeded from the changes between the first
/// `period` closes, then smoothed with `avg = (avg * (period - 1) + new) / period`
/// for every later close.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    let mut rsi = WilderRsi::new(period);
    let mut value = None;
    for &price in prices {
        value = rsi.update(price);
    }
    value
}

/// Incremental Wilder RSI, fed one close at a time
#[derive(Debug, Clone)]
pub struct WilderRsi {
    period: usize,
    prev_close: Option<f64>,
    seen: usize,
    gain_sum: f64,
    loss_sum: f64,
    avg_gain: f64,
    avg_loss: f64,
}

impl WilderRsi {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(2),
            prev_close: None,
            seen: 0,
            gain_sum: 0.0,
            loss_sum: 0.0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        }
    }

    /// Number of closes consumed so far
    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn value(&self) -> Option<f64> {
        if self.seen < self.period {
            return None;
        }
        if self.avg_loss == 0.0 {
            return Some(100.0);
        }
        let rs = self.avg_gain / self.avg_loss;
        Some(100.0 - (100.0 / (1.0 + rs)))
    }

    pub fn update(&mut self, close: f64) -> Option<f64> {
        self.seen += 1;

        let Some(prev) = self.prev_close.replace(close) else {
            return self.value();
        };
        let change = close - prev;
        let (gain, loss) = if change > 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };

        let p = self.period as f64;
        if self.seen < self.period {
            self.gain_sum += gain;
            self.loss_sum += loss;
        } else if self.seen == self.period {
            self.gain_sum += gain;
            self.loss_sum += loss;
            self.avg_gain = self.gain_sum / (p - 1.0);
            self.avg_loss = self.loss_sum / (p - 1.0);
        } else {
            self.avg_gain = (self.avg_gain * (p - 1.0) + gain) / p;
            self.avg_loss = (self.avg_loss * (p - 1.0) + loss) / p;
        }

        self.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_calculation() {
        let prices = vec![
            44.0, 44.25, 44.5, 43.75, 44.0, 44.5, 45.0, 45.5, 45.25, 45.5, 46.0, 46.5, 46.25,
            46.0, 46.5,
        ];

        let rsi = calculate_rsi(&prices, 14);
        assert!(rsi.is_some());

        let rsi_value = rsi.unwrap();
        assert!(rsi_value > 0.0 && rsi_value < 100.0);
    }

    #[test]
    fn test_rsi_insufficient_data() {
        let prices = vec![100.0, 102.0, 101.0];
        assert!(calculate_rsi(&prices, 14).is_none());
        // period closes are enough
        assert!(calculate_rsi(&prices, 3).is_some());
    }

    #[test]
    fn test_rsi_all_gains() {
        let prices = vec![100.0, 101.0, 102.0, 103.0, 104.0, 105.0];
        assert_eq!(calculate_rsi(&prices, 5), Some(100.0));
    }

    #[test]
    fn test_rsi_all_losses() {
        let prices = vec![105.0, 104.0, 103.0, 102.0, 101.0, 100.0];
        assert_eq!(calculate_rsi(&prices, 5), Some(0.0));
    }

    #[test]
    fn test_seed_then_wilder_update() {
        // period 3: seed changes +2, -1 -> avg_gain 1.0, avg_loss 0.5
        let mut rsi = WilderRsi::new(3);
        assert_eq!(rsi.update(10.0), None);
        assert_eq!(rsi.update(12.0), None);
        let seeded = rsi.update(11.0).unwrap();
        assert!((seeded - (100.0 - 100.0 / 3.0)).abs() < 1e-9);

        // next change +1.5 -> avg_gain (1*2+1.5)/3, avg_loss (0.5*2)/3
        let next = rsi.update(12.5).unwrap();
        let rs = (3.5 / 3.0) / (1.0 / 3.0);
        assert!((next - (100.0 - 100.0 / (1.0 + rs))).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_bounded() {
        let mut price = 100.0;
        let mut rsi = WilderRsi::new(14);
        for i in 0..500 {
            price *= if (i * 7919) % 13 < 6 { 1.013 } else { 0.989 };
            if let Some(value) = rsi.update(price) {
                assert!((0.0..=100.0).contains(&value), "{}", value);
            }
        }
    }

    #[test]
    fn test_incremental_matches_batch() {
        let prices: Vec<f64> = (0..60).map(|i| 100.0 + ((i as f64) * 0.7).sin() * 5.0).collect();
        let mut rsi = WilderRsi::new(14);
        let mut last = None;
        for &p in &prices {
            last = rsi.update(p);
        }
        assert_eq!(last, calculate_rsi(&prices, 14));
    }
}
