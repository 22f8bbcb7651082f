use crate::error::BotError;
use crate::models::OrderType;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Governs what the execution engine's submit call does
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// Instant no-op fill at the decision price
    Test,
    /// Simulated fill against live prices
    Paper,
    /// Real venue call
    Live,
}

impl FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "test" => Ok(TradingMode::Test),
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            other => Err(format!("Invalid trading mode: {}", other)),
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradingMode::Test => "test",
            TradingMode::Paper => "paper",
            TradingMode::Live => "live",
        };
        f.write_str(s)
    }
}

/// Candle interval, restricted to granularities the venue serves
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CandleInterval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    SixHours,
    OneDay,
}

impl CandleInterval {
    pub fn minutes(&self) -> i64 {
        match self {
            CandleInterval::OneMinute => 1,
            CandleInterval::FiveMinutes => 5,
            CandleInterval::FifteenMinutes => 15,
            CandleInterval::ThirtyMinutes => 30,
            CandleInterval::OneHour => 60,
            CandleInterval::TwoHours => 120,
            CandleInterval::SixHours => 360,
            CandleInterval::OneDay => 1440,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.minutes())
    }

    /// Coinbase Advanced Trade granularity name
    pub fn granularity(&self) -> &'static str {
        match self {
            CandleInterval::OneMinute => "ONE_MINUTE",
            CandleInterval::FiveMinutes => "FIVE_MINUTE",
            CandleInterval::FifteenMinutes => "FIFTEEN_MINUTE",
            CandleInterval::ThirtyMinutes => "THIRTY_MINUTE",
            CandleInterval::OneHour => "ONE_HOUR",
            CandleInterval::TwoHours => "TWO_HOUR",
            CandleInterval::SixHours => "SIX_HOUR",
            CandleInterval::OneDay => "ONE_DAY",
        }
    }
}

impl FromStr for CandleInterval {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "1m" => Ok(CandleInterval::OneMinute),
            "5m" => Ok(CandleInterval::FiveMinutes),
            "15m" => Ok(CandleInterval::FifteenMinutes),
            "30m" => Ok(CandleInterval::ThirtyMinutes),
            "1h" => Ok(CandleInterval::OneHour),
            "2h" => Ok(CandleInterval::TwoHours),
            "6h" => Ok(CandleInterval::SixHours),
            "1d" => Ok(CandleInterval::OneDay),
            other => Err(format!("Invalid candle interval: {}", other)),
        }
    }
}

/// Risk gate parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of portfolio value (0, 1]
    pub max_position_size: f64,
    pub stop_loss_percentage: f64,
    pub take_profit_percentage: f64,
    /// Quote currency
    pub min_order_size: f64,
    pub cooldown_period_secs: i64,
    pub order_type: OrderType,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: 0.1,
            stop_loss_percentage: 2.0,
            take_profit_percentage: 5.0,
            min_order_size: 10.0,
            cooldown_period_secs: 300,
            order_type: OrderType::Market,
        }
    }
}

impl RiskConfig {
    pub fn cooldown_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_period_secs)
    }
}

/// Indicator and signal thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub bollinger_period: usize,
    pub bollinger_std: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            bollinger_period: 20,
            bollinger_std: 2.0,
        }
    }
}

impl StrategyConfig {
    /// Longest lookback of any indicator
    pub fn max_lookback(&self) -> usize {
        self.rsi_period.max(self.bollinger_period)
    }
}

/// Market feed parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub candle_interval: CandleInterval,
    pub websocket_enabled: bool,
    pub data_fetch_interval_secs: u64,
    pub series_capacity: usize,
    pub staleness_window_secs: i64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            candle_interval: CandleInterval::OneMinute,
            websocket_enabled: true,
            data_fetch_interval_secs: 60,
            series_capacity: 200,
            staleness_window_secs: 180,
        }
    }
}

impl FeedConfig {
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_window_secs)
    }
}

/// Execution engine retry / reconciliation budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub max_submit_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub submit_timeout_secs: u64,
    pub fill_timeout_secs: u64,
    pub fill_poll_interval_ms: u64,
    pub reconcile_window_secs: u64,
    pub paper_slippage_bps: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_submit_attempts: 3,
            retry_base_delay_ms: 500,
            submit_timeout_secs: 10,
            fill_timeout_secs: 30,
            fill_poll_interval_ms: 1000,
            reconcile_window_secs: 300,
            paper_slippage_bps: 10,
        }
    }
}

/// Complete, validated configuration. Built once and passed into components.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub api_name: String,
    pub api_key: String,
    pub api_url: String,
    pub ws_url: String,
    pub mode: TradingMode,
    pub trading_pair: String,
    pub risk: RiskConfig,
    pub strategy: StrategyConfig,
    pub feed: FeedConfig,
    pub execution: ExecutionConfig,
    pub initial_balance: f64,
    pub log_level: String,
    pub log_file: Option<String>,
    pub ledger_path: String,
    pub redis_url: Option<String>,
    pub discord_webhook_url: Option<String>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            api_name: String::new(),
            api_key: String::new(),
            api_url: "https://api.coinbase.com".to_string(),
            ws_url: "wss://advanced-trade-ws.coinbase.com".to_string(),
            mode: TradingMode::Test,
            trading_pair: "BTC-USD".to_string(),
            risk: RiskConfig::default(),
            strategy: StrategyConfig::default(),
            feed: FeedConfig::default(),
            execution: ExecutionConfig::default(),
            initial_balance: 10_000.0,
            log_level: "INFO".to_string(),
            log_file: Some("trading_bot.log".to_string()),
            ledger_path: "ledger.json".to_string(),
            redis_url: None,
            discord_webhook_url: None,
        }
    }
}

/// Flat shape of the environment, before parsing into typed sections
#[derive(Debug, Deserialize)]
struct RawConfig {
    coinbase_api_name: String,
    coinbase_api_key: String,
    coinbase_api_url: String,
    coinbase_ws_url: String,
    trading_mode: String,
    trading_pair: String,
    candle_interval: String,
    order_type: String,
    max_position_size: f64,
    stop_loss_percentage: f64,
    take_profit_percentage: f64,
    min_order_size: f64,
    cooldown_period: i64,
    rsi_period: i64,
    rsi_oversold: f64,
    rsi_overbought: f64,
    bollinger_period: i64,
    bollinger_std: f64,
    websocket_enabled: bool,
    data_fetch_interval: u64,
    series_capacity: i64,
    staleness_window: Option<i64>,
    max_submit_attempts: u32,
    retry_base_delay_ms: u64,
    submit_timeout_secs: u64,
    fill_timeout_secs: u64,
    reconcile_window_secs: u64,
    paper_slippage_bps: u32,
    initial_balance: f64,
    log_level: String,
    log_file: String,
    ledger_path: String,
    redis_url: Option<String>,
    discord_webhook_url: Option<String>,
}

/// Load configuration from `.env` and the process environment.
///
/// `overrides` are `(key, value)` pairs, e.g. from command-line flags, that
/// take precedence over every other source.
pub fn load_config(overrides: &[(&str, String)]) -> Result<TradingConfig> {
    dotenvy::dotenv().ok();
    load_config_with(config::Environment::default(), overrides)
}

/// Load configuration from an explicit environment source
pub fn load_config_from(env: config::Environment) -> Result<TradingConfig> {
    load_config_with(env, &[])
}

fn load_config_with(env: config::Environment, overrides: &[(&str, String)]) -> Result<TradingConfig> {
    let mut builder = config::Config::builder()
        .set_default("coinbase_api_name", "")?
        .set_default("coinbase_api_key", "")?
        .set_default("coinbase_api_url", "https://api.coinbase.com")?
        .set_default("coinbase_ws_url", "wss://advanced-trade-ws.coinbase.com")?
        .set_default("trading_mode", "test")?
        .set_default("trading_pair", "BTC-USD")?
        .set_default("candle_interval", "1m")?
        .set_default("order_type", "market")?
        .set_default("max_position_size", 0.1)?
        .set_default("stop_loss_percentage", 2.0)?
        .set_default("take_profit_percentage", 5.0)?
        .set_default("min_order_size", 10.0)?
        .set_default("cooldown_period", 300)?
        .set_default("rsi_period", 14)?
        .set_default("rsi_oversold", 30.0)?
        .set_default("rsi_overbought", 70.0)?
        .set_default("bollinger_period", 20)?
        .set_default("bollinger_std", 2.0)?
        .set_default("websocket_enabled", true)?
        .set_default("data_fetch_interval", 60)?
        .set_default("series_capacity", 200)?
        .set_default("max_submit_attempts", 3)?
        .set_default("retry_base_delay_ms", 500)?
        .set_default("submit_timeout_secs", 10)?
        .set_default("fill_timeout_secs", 30)?
        .set_default("reconcile_window_secs", 300)?
        .set_default("paper_slippage_bps", 10)?
        .set_default("initial_balance", 10000.0)?
        .set_default("log_level", "INFO")?
        .set_default("log_file", "trading_bot.log")?
        .set_default("ledger_path", "ledger.json")?
        .add_source(env.try_parsing(true));
    for (key, value) in overrides {
        builder = builder.set_override(*key, value.as_str())?;
    }
    let settings = builder.build()?;

    let raw: RawConfig = settings.try_deserialize()?;
    let config = raw.into_config()?;
    config.validate()?;

    tracing::debug!(
        mode = %config.mode,
        pair = %config.trading_pair,
        "Configuration loaded"
    );

    Ok(config)
}

impl RawConfig {
    fn into_config(self) -> Result<TradingConfig> {
        let mut errors = Vec::new();

        let mode = self.trading_mode.parse().unwrap_or_else(|e| {
            errors.push(e);
            TradingMode::Test
        });
        let candle_interval: CandleInterval = self.candle_interval.parse().unwrap_or_else(|e| {
            errors.push(e);
            CandleInterval::OneMinute
        });
        let order_type = match self.order_type.to_ascii_lowercase().as_str() {
            "market" => OrderType::Market,
            "limit" => OrderType::Limit,
            other => {
                errors.push(format!("Invalid order type: {}", other));
                OrderType::Market
            }
        };

        if self.rsi_period < 0 || self.bollinger_period < 0 || self.series_capacity < 0 {
            errors.push("periods and capacity must not be negative".to_string());
        }

        if !errors.is_empty() {
            return Err(BotError::Config(format!(
                "Configuration errors: {}",
                errors.join("; ")
            )));
        }

        let staleness_window_secs = self
            .staleness_window
            .unwrap_or(candle_interval.minutes() * 60 * 3);

        Ok(TradingConfig {
            api_name: self.coinbase_api_name,
            api_key: self.coinbase_api_key,
            api_url: self.coinbase_api_url,
            ws_url: self.coinbase_ws_url,
            mode,
            trading_pair: self.trading_pair,
            risk: RiskConfig {
                max_position_size: self.max_position_size,
                stop_loss_percentage: self.stop_loss_percentage,
                take_profit_percentage: self.take_profit_percentage,
                min_order_size: self.min_order_size,
                cooldown_period_secs: self.cooldown_period,
                order_type,
            },
            strategy: StrategyConfig {
                rsi_period: self.rsi_period as usize,
                rsi_oversold: self.rsi_oversold,
                rsi_overbought: self.rsi_overbought,
                bollinger_period: self.bollinger_period as usize,
                bollinger_std: self.bollinger_std,
            },
            feed: FeedConfig {
                candle_interval,
                websocket_enabled: self.websocket_enabled,
                data_fetch_interval_secs: self.data_fetch_interval,
                series_capacity: self.series_capacity as usize,
                staleness_window_secs,
            },
            execution: ExecutionConfig {
                max_submit_attempts: self.max_submit_attempts,
                retry_base_delay_ms: self.retry_base_delay_ms,
                submit_timeout_secs: self.submit_timeout_secs,
                fill_timeout_secs: self.fill_timeout_secs,
                reconcile_window_secs: self.reconcile_window_secs,
                paper_slippage_bps: self.paper_slippage_bps,
                ..ExecutionConfig::default()
            },
            initial_balance: self.initial_balance,
            log_level: self.log_level,
            log_file: Some(self.log_file).filter(|f| !f.is_empty()),
            ledger_path: self.ledger_path,
            redis_url: self.redis_url.filter(|u| !u.is_empty()),
            discord_webhook_url: self.discord_webhook_url.filter(|u| !u.is_empty()),
        })
    }
}

impl TradingConfig {
    /// Check every constraint and report all violations at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.mode == TradingMode::Live && (self.api_name.is_empty() || self.api_key.is_empty())
        {
            errors.push("Coinbase API credentials are required".to_string());
        }

        if self.trading_pair.is_empty() {
            errors.push("trading_pair must not be empty".to_string());
        }

        for (name, value, schemes) in [
            ("coinbase_api_url", &self.api_url, ["http", "https"]),
            ("coinbase_ws_url", &self.ws_url, ["ws", "wss"]),
        ] {
            match url::Url::parse(value) {
                Ok(parsed) if schemes.contains(&parsed.scheme()) => {}
                Ok(parsed) => errors.push(format!(
                    "{} has unsupported scheme '{}'",
                    name,
                    parsed.scheme()
                )),
                Err(e) => errors.push(format!("{} is not a valid URL: {}", name, e)),
            }
        }

        let risk = &self.risk;
        if !(risk.max_position_size > 0.0 && risk.max_position_size <= 1.0) {
            errors.push("max_position_size must be between 0 and 1".to_string());
        }
        if risk.stop_loss_percentage <= 0.0 {
            errors.push("stop_loss_percentage must be positive".to_string());
        }
        if risk.take_profit_percentage <= 0.0 {
            errors.push("take_profit_percentage must be positive".to_string());
        }
        if risk.min_order_size <= 0.0 {
            errors.push("min_order_size must be positive".to_string());
        }
        if risk.cooldown_period_secs < 0 {
            errors.push("cooldown_period must not be negative".to_string());
        }

        let strategy = &self.strategy;
        if strategy.rsi_period < 2 {
            errors.push("rsi_period must be at least 2".to_string());
        }
        if !(0.0 <= strategy.rsi_oversold
            && strategy.rsi_oversold < strategy.rsi_overbought
            && strategy.rsi_overbought <= 100.0)
        {
            errors.push("Invalid RSI thresholds".to_string());
        }
        if strategy.bollinger_period == 0 {
            errors.push("bollinger_period must be positive".to_string());
        }
        if strategy.bollinger_std <= 0.0 {
            errors.push("bollinger_std must be positive".to_string());
        }

        if self.feed.series_capacity < strategy.max_lookback() {
            errors.push(format!(
                "series_capacity ({}) must cover the longest indicator lookback ({})",
                self.feed.series_capacity,
                strategy.max_lookback()
            ));
        }
        if self.feed.staleness_window_secs <= 0 {
            errors.push("staleness_window must be positive".to_string());
        }
        if self.execution.max_submit_attempts == 0 {
            errors.push("max_submit_attempts must be at least 1".to_string());
        }
        if self.initial_balance < 0.0 {
            errors.push("initial_balance must not be negative".to_string());
        }

        if !errors.is_empty() {
            return Err(BotError::Config(format!(
                "Configuration errors: {}",
                errors.join("; ")
            )));
        }

        Ok(())
    }

    /// Quote side of the trading pair, e.g. `USD` for `BTC-USD`
    pub fn quote_currency(&self) -> &str {
        self.trading_pair
            .split_once('-')
            .map(|(_, quote)| quote)
            .unwrap_or("USD")
    }
}
