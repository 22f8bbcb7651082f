// Technical indicators module
// Implements RSI (Wilder) and Bollinger Bands for the decision pipeline

pub mod bollinger;
pub mod engine;
pub mod moving_average;
pub mod rsi;

pub use bollinger::{calculate_bollinger, BollingerBands};
pub use engine::IndicatorEngine;
pub use moving_average::{calculate_sma, calculate_std_dev};
pub use rsi::{calculate_rsi, WilderRsi};
