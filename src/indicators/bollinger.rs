use super::moving_average::{calculate_sma, calculate_std_dev};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub mid: f64,
    pub lower: f64,
}

/// Bollinger Bands over the last `period` prices: SMA ± `num_std` population std-devs
pub fn calculate_bollinger(prices: &[f64], period: usize, num_std: f64) -> Option<BollingerBands> {
    let mid = calculate_sma(prices, period)?;
    let std = calculate_std_dev(prices, period)?;
    Some(BollingerBands {
        upper: mid + num_std * std,
        mid,
        lower: mid - num_std * std,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bands() {
        let prices = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let bands = calculate_bollinger(&prices, 8, 2.0).unwrap();
        assert_eq!(bands.mid, 5.0);
        assert_eq!(bands.upper, 9.0);
        assert_eq!(bands.lower, 1.0);
    }

    #[test]
    fn test_flat_series_collapses_band() {
        let prices = vec![100.0; 20];
        let bands = calculate_bollinger(&prices, 20, 2.0).unwrap();
        assert_eq!(bands.upper, bands.lower);
    }

    #[test]
    fn test_warmup() {
        assert!(calculate_bollinger(&[1.0, 2.0], 20, 2.0).is_none());
    }
}
