use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coinbot::api::{CoinbaseClient, CoinbaseStream, CoinbaseVenue};
use coinbot::config::{load_config, TradingConfig, TradingMode};
use coinbot::events::{DiscordSink, EventSink, FanoutSink, TracingSink};
use coinbot::execution::{ExecutionEngine, FillModel, PositionLedger, SimulatedVenue, Venue};
use coinbot::feed::{load_history, CandleFetcher, FeedBuffer, FeedHandle, MarketScenario, SyntheticMarket, TradeStream};
use coinbot::logging::init_tracing;
use coinbot::persistence::{JsonFileStore, LedgerStore, RedisLedgerStore};
use coinbot::pipeline::Pipeline;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "coinbot", version, about = "RSI + Bollinger Bands trading bot for Coinbase Advanced Trade")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading loop (default)
    Run {
        /// Override TRADING_MODE
        #[arg(long)]
        mode: Option<TradingMode>,
        /// Override TRADING_PAIR
        #[arg(long)]
        pair: Option<String>,
        /// Feed from a seeded synthetic market instead of Coinbase
        #[arg(long)]
        synthetic: Option<MarketScenario>,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Validate configuration and print the effective settings
    CheckConfig,
    /// Print the persisted position ledger
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run {
        mode: None,
        pair: None,
        synthetic: None,
        seed: 42,
    });

    // flags win over the environment and .env
    let mut overrides = Vec::new();
    if let Command::Run { mode, pair, .. } = &command {
        if let Some(mode) = mode {
            overrides.push(("trading_mode", mode.to_string()));
        }
        if let Some(pair) = pair {
            overrides.push(("trading_pair", pair.clone()));
        }
    }

    let config = load_config(&overrides).context("Failed to load configuration")?;
    let _guard = init_tracing(&config.log_level, config.log_file.as_deref())
        .context("Failed to initialise logging")?;

    match command {
        Command::Run {
            synthetic, seed, ..
        } => run(config, synthetic, seed).await,
        Command::CheckConfig => {
            print_config(&config);
            Ok(())
        }
        Command::Status => status(&config).await,
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

async fn connect_store(config: &TradingConfig) -> Result<Arc<dyn LedgerStore>> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisLedgerStore::new(url)
                .await
                .with_context(|| format!("Failed to connect to Redis at {}", url))?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("Ledger persisted to {}", config.ledger_path);
            Ok(Arc::new(JsonFileStore::new(&config.ledger_path)))
        }
    }
}

fn build_sink(config: &TradingConfig) -> Arc<dyn EventSink> {
    let mut sink = FanoutSink::new().with(Arc::new(TracingSink));
    if let Some(url) = &config.discord_webhook_url {
        tracing::info!("Discord alerts enabled");
        sink = sink.with(Arc::new(DiscordSink::new(url.clone())));
    }
    Arc::new(sink)
}

fn build_venue(
    config: &TradingConfig,
    client: &CoinbaseClient,
    feed: &FeedBuffer,
) -> Arc<dyn Venue> {
    match config.mode {
        TradingMode::Test => Arc::new(SimulatedVenue::instant()),
        TradingMode::Paper => Arc::new(SimulatedVenue::new(FillModel::Slippage {
            bps: config.execution.paper_slippage_bps,
            prices: feed.clone(),
        })),
        TradingMode::Live => Arc::new(CoinbaseVenue::new(client.clone(), config.trading_pair.clone())),
    }
}

async fn load_ledger(config: &TradingConfig, store: &dyn LedgerStore) -> Result<PositionLedger> {
    let loaded = store
        .load(&config.trading_pair)
        .await
        .context("Failed to load position ledger")?;

    Ok(match loaded {
        Some(snapshot) => {
            if let Some(pending) = &snapshot.unresolved {
                tracing::warn!(
                    key = %pending.request.idempotency_key,
                    since = %pending.since,
                    "Unresolved order from previous run, reconciling before trading"
                );
            }
            PositionLedger::restore(snapshot, &config.risk)
        }
        None => {
            tracing::info!(
                "No ledger found, starting flat with {:.2} {}",
                config.initial_balance,
                config.quote_currency()
            );
            PositionLedger::new(&config.trading_pair, config.initial_balance, &config.risk)
        }
    })
}

// ============================================================================
// Commands
// ============================================================================

async fn run(config: TradingConfig, synthetic: Option<MarketScenario>, seed: u64) -> Result<()> {
    tracing::info!("🚀 coinbot starting");
    tracing::info!("  Mode: {}", config.mode);
    tracing::info!("  Pair: {}", config.trading_pair);
    tracing::info!("  Interval: {} min", config.feed.candle_interval.minutes());

    let sink = build_sink(&config);
    let store = connect_store(&config).await?;
    let ledger = load_ledger(&config, store.as_ref()).await?;

    let interval = config.feed.candle_interval;
    let feed = FeedBuffer::new(
        &config.trading_pair,
        config.feed.series_capacity,
        interval.duration(),
        config.feed.staleness_window(),
    );

    let client = CoinbaseClient::new(&config.api_url, &config.api_key)
        .context("Failed to build Coinbase client")?;
    let (fetcher, stream): (Arc<dyn CandleFetcher>, Option<Arc<dyn TradeStream>>) = match synthetic {
        Some(scenario) => {
            tracing::info!("  Feed: synthetic {:?} (seed {})", scenario, seed);
            let market = SyntheticMarket::with_history(
                seed,
                scenario,
                interval.duration(),
                config.feed.series_capacity,
            )
            .with_retention(config.feed.series_capacity);
            (Arc::new(market) as Arc<dyn CandleFetcher>, None)
        }
        None => (
            Arc::new(client.clone()) as Arc<dyn CandleFetcher>,
            Some(Arc::new(CoinbaseStream::new(&config.ws_url)) as Arc<dyn TradeStream>),
        ),
    };

    let history = (config.strategy.max_lookback() * 2).min(config.feed.series_capacity);
    match load_history(fetcher.as_ref(), &feed, interval, history).await {
        Ok(n) => tracing::info!("✓ Loaded {} historical candles", n),
        Err(e) => tracing::warn!("Failed to load history, warming up live: {}", e),
    }

    let venue = build_venue(&config, &client, &feed);
    let execution = ExecutionEngine::new(venue, store, sink.clone(), config.execution.clone());
    let mut pipeline = Pipeline::new(&config, feed.clone(), execution, ledger, sink.clone());

    if config.mode == TradingMode::Live {
        pipeline
            .sync_balance()
            .await
            .context("Failed to read account balance")?;
    }
    pipeline.log_stats();

    let feed_handle = FeedHandle::spawn(feed, fetcher, stream, config.feed.clone(), sink);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut decisions = tokio::spawn(pipeline.run(feed_handle.trigger(), shutdown_rx));

    tracing::info!("Press Ctrl+C to stop...");

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        result = &mut decisions => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
            shutdown_tx.send_replace(true);
            decisions.await
        }
    };

    feed_handle.shutdown().await;

    let ledger = result
        .context("Decision loop panicked")?
        .context("Decision loop stopped on a fatal error")?;
    let stats = ledger.stats();
    tracing::info!(
        "👋 coinbot stopped: {} fills, {} closed trades, win rate {:.1}%, realized P&L {:.2}",
        stats.fills,
        stats.closed_trades,
        stats.win_rate() * 100.0,
        stats.realized_pnl
    );
    Ok(())
}

fn print_config(config: &TradingConfig) {
    println!("Configuration OK");
    println!("  mode:              {}", config.mode);
    println!("  trading pair:      {}", config.trading_pair);
    println!("  candle interval:   {} min", config.feed.candle_interval.minutes());
    println!("  order type:        {:?}", config.risk.order_type);
    println!("  max position size: {:.0}%", config.risk.max_position_size * 100.0);
    println!(
        "  stop / take:       {:.2}% / {:.2}%",
        config.risk.stop_loss_percentage, config.risk.take_profit_percentage
    );
    println!("  min order size:    {:.2}", config.risk.min_order_size);
    println!("  cooldown:          {}s", config.risk.cooldown_period_secs);
    println!(
        "  RSI:               {} ({} / {})",
        config.strategy.rsi_period, config.strategy.rsi_oversold, config.strategy.rsi_overbought
    );
    println!(
        "  Bollinger:         {} x {}",
        config.strategy.bollinger_period, config.strategy.bollinger_std
    );
    println!("  websocket:         {}", config.feed.websocket_enabled);
    println!(
        "  ledger store:      {}",
        if config.redis_url.is_some() { "redis" } else { config.ledger_path.as_str() }
    );
    println!(
        "  credentials:       {}",
        if config.api_key.is_empty() { "not set" } else { "set" }
    );
}

async fn status(config: &TradingConfig) -> Result<()> {
    let store = connect_store(config).await?;
    let Some(snapshot) = store
        .load(&config.trading_pair)
        .await
        .context("Failed to load position ledger")?
    else {
        println!("No ledger for {}", config.trading_pair);
        return Ok(());
    };

    println!("{} (updated {})", snapshot.instrument, snapshot.updated_at);
    match &snapshot.position {
        Some(p) => println!(
            "  position: {:.8} @ {:.2} (stop {:.2}, take {:.2}) since {}",
            p.size_in_base, p.entry_price, p.stop_loss, p.take_profit, p.opened_at
        ),
        None => println!("  position: flat"),
    }
    println!("  cash:     {:.2}", snapshot.cash);
    if let Some(last) = snapshot.cooldown.last_trade_at {
        println!("  last trade: {}", last);
    }
    println!(
        "  fills {} | closed {} | win rate {:.1}% | realized P&L {:.2} | max drawdown {:.2}%",
        snapshot.stats.fills,
        snapshot.stats.closed_trades,
        snapshot.stats.win_rate() * 100.0,
        snapshot.stats.realized_pnl,
        snapshot.stats.max_drawdown_pct
    );
    if let Some(pending) = &snapshot.unresolved {
        println!(
            "  UNRESOLVED order {} ({} {:.8}) since {}",
            pending.request.idempotency_key, pending.request.side, pending.request.size_in_base, pending.since
        );
    }
    Ok(())
}
