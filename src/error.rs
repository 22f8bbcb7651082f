use thiserror::Error;

/// Whether a failed request may have reached the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Failed before the request left the process (connect refused, DNS)
    NotSent,
    /// Request was written; the response was lost (timeout, reset, 5xx)
    MaybeReceived,
}

/// Typed error hierarchy for the trading pipeline.
///
/// Library code returns these; the binary wraps them with `anyhow::Context`.
#[derive(Error, Debug)]
pub enum BotError {
    // -- Feed ---------------------------------------------------------------
    #[error("stale feed: last closed candle {last_close_age_secs}s ago (window {window_secs}s)")]
    StaleFeed {
        last_close_age_secs: i64,
        window_secs: i64,
    },

    #[error("indicator warm-up: {have}/{need} candles")]
    IndicatorWarmup { have: usize, need: usize },

    #[error("feed error: {0}")]
    Feed(String),

    // -- Execution ----------------------------------------------------------
    #[error("transient execution failure: {reason} ({delivery:?})")]
    TransientExecution { reason: String, delivery: Delivery },

    #[error("order {key} unresolved after {elapsed_secs}s of reconciliation")]
    AmbiguousExecution { key: String, elapsed_secs: u64 },

    #[error("venue rejected order: {reason}")]
    VenueRejection { reason: String },

    #[error("invalid order transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("trading halted for {instrument}: position truth cannot be established")]
    TradingHalted { instrument: String },

    // -- Ledger -------------------------------------------------------------
    #[error("ledger store failure: {reason}")]
    LedgerStore { reason: String },

    // -- Configuration ------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),

    // -- Forwarded errors ---------------------------------------------------
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Settings(#[from] config::ConfigError),
}

impl BotError {
    /// Errors after which trading for the instrument must stop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BotError::AmbiguousExecution { .. }
                | BotError::TradingHalted { .. }
                | BotError::LedgerStore { .. }
        )
    }
}
