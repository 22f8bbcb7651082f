// Signal generation
pub mod signals;

pub use signals::SignalGenerator;
