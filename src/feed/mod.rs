pub mod candle_buffer;
pub mod price_feed;
pub mod synthetic;

pub use candle_buffer::{CandleSeries, FeedBuffer, FeedGap, Ingested};
pub use price_feed::{load_history, CandleFetcher, FeedHandle, TradeStream};
pub use synthetic::{MarketScenario, SyntheticMarket};
