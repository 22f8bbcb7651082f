pub mod coinbase;
pub mod stream;

pub use coinbase::{CoinbaseClient, CoinbaseVenue};
pub use stream::CoinbaseStream;
