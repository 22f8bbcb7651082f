use super::candle_buffer::FeedBuffer;
use crate::config::{CandleInterval, FeedConfig};
use crate::events::{EventSink, PipelineEvent};
use crate::models::{Candle, RawTick};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Bounded queue between sources and the ingestion task; senders wait when full
pub const TICK_CHANNEL_CAPACITY: usize = 1024;

/// Pull interface for historical and recent candles
#[async_trait]
pub trait CandleFetcher: Send + Sync {
    /// Candles with open_time in `[start, end]`, oldest first
    async fn fetch_candles(
        &self,
        instrument: &str,
        interval: CandleInterval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;
}

/// Push interface delivering trades
#[async_trait]
pub trait TradeStream: Send + Sync {
    /// Forward ticks until the connection fails or the receiver goes away
    async fn run(&self, instrument: &str, tx: mpsc::Sender<RawTick>) -> Result<()>;
}

/// Tag fetched candles as closed when their interval has fully elapsed
pub fn to_ticks(candles: Vec<Candle>, interval: chrono::Duration, now: DateTime<Utc>) -> Vec<RawTick> {
    candles
        .into_iter()
        .map(|candle| {
            let closed = candle.open_time + interval <= now;
            RawTick::Candle { candle, closed }
        })
        .collect()
}

/// Seed the buffer with recent history so indicators are warm at start.
/// Returns the number of closed candles loaded.
pub async fn load_history(
    fetcher: &dyn CandleFetcher,
    buffer: &FeedBuffer,
    interval: CandleInterval,
    count: usize,
) -> Result<usize> {
    let now = Utc::now();
    let start = now - interval.duration() * count as i32;
    let candles = fetcher
        .fetch_candles(buffer.instrument(), interval, start, now)
        .await?;

    let mut loaded = 0;
    for tick in to_ticks(candles, interval.duration(), now) {
        if buffer.ingest(tick)?.closed.is_some() {
            loaded += 1;
        }
    }

    tracing::info!(
        instrument = %buffer.instrument(),
        loaded,
        requested = count,
        "Loaded historical candles"
    );

    Ok(loaded)
}

/// Pull source: fetch the two most recent intervals on every tick of `every`
pub async fn poll_candles(
    fetcher: Arc<dyn CandleFetcher>,
    instrument: String,
    interval: CandleInterval,
    every: Duration,
    tx: mpsc::Sender<RawTick>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let now = Utc::now();
        let start = now - interval.duration() * 2;
        match fetcher.fetch_candles(&instrument, interval, start, now).await {
            Ok(candles) => {
                for tick in to_ticks(candles, interval.duration(), now) {
                    if tx.send(tick).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(instrument = %instrument, "Candle poll failed: {}", e);
            }
        }
    }

    tracing::debug!(instrument = %instrument, "Polling stopped");
}

/// Clock source that lets the buffer close a due partial candle without a new trade
pub async fn heartbeat(every: Duration, tx: mpsc::Sender<RawTick>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if tx.send(RawTick::Heartbeat { time: Utc::now() }).await.is_err() {
            break;
        }
    }
}

/// Stream first; on failure fall back to polling for the rest of the session
pub async fn run_sources(
    stream: Option<Arc<dyn TradeStream>>,
    fetcher: Arc<dyn CandleFetcher>,
    instrument: String,
    config: FeedConfig,
    tx: mpsc::Sender<RawTick>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Some(stream) = stream {
        let result = tokio::select! {
            r = stream.run(&instrument, tx.clone()) => r,
            _ = shutdown.changed() => return,
        };
        match result {
            Ok(()) => tracing::warn!(instrument = %instrument, "Market stream closed"),
            Err(e) => tracing::error!(instrument = %instrument, "Market stream failed: {}", e),
        }
        tracing::warn!(instrument = %instrument, "Falling back to polling");
    }

    poll_candles(
        fetcher,
        instrument,
        config.candle_interval,
        Duration::from_secs(config.data_fetch_interval_secs.max(1)),
        tx,
        shutdown,
    )
    .await
}

/// Single writer: drains the tick queue into the buffer and fires the
/// cycle trigger with the open_time of each newly closed candle
pub async fn run_ingestion(
    buffer: FeedBuffer,
    mut rx: mpsc::Receiver<RawTick>,
    trigger: watch::Sender<Option<DateTime<Utc>>>,
    sink: Arc<dyn EventSink>,
) {
    while let Some(tick) = rx.recv().await {
        match buffer.ingest(tick) {
            Ok(ingested) => {
                if let Some(gap) = ingested.gap {
                    sink.emit(&PipelineEvent::FeedGap {
                        instrument: buffer.instrument().to_string(),
                        expected: gap.expected,
                        received: gap.received,
                    });
                }
                if let Some(candle) = ingested.closed {
                    sink.emit(&PipelineEvent::CandleClosed {
                        instrument: buffer.instrument().to_string(),
                        open_time: candle.open_time,
                        close: candle.close,
                    });
                    trigger.send_replace(Some(candle.open_time));
                }
            }
            Err(e) => {
                tracing::warn!(instrument = %buffer.instrument(), "Failed to ingest tick: {}", e);
            }
        }
    }

    tracing::debug!(instrument = %buffer.instrument(), "Ingestion stopped");
}

/// Running feed tasks for one instrument
pub struct FeedHandle {
    trigger: watch::Receiver<Option<DateTime<Utc>>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl FeedHandle {
    /// Spawn sources, heartbeat and ingestion on the current runtime
    pub fn spawn(
        buffer: FeedBuffer,
        fetcher: Arc<dyn CandleFetcher>,
        stream: Option<Arc<dyn TradeStream>>,
        config: FeedConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (tick_tx, tick_rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        let (trigger_tx, trigger_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stream = stream.filter(|_| config.websocket_enabled);
        let mut tasks = Vec::with_capacity(3);

        tasks.push(tokio::spawn(run_sources(
            stream,
            fetcher,
            buffer.instrument().to_string(),
            config,
            tick_tx.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(heartbeat(
            Duration::from_secs(1),
            tick_tx,
            shutdown_rx,
        )));
        tasks.push(tokio::spawn(run_ingestion(buffer, tick_rx, trigger_tx, sink)));

        Self {
            trigger: trigger_rx,
            shutdown: shutdown_tx,
            tasks,
        }
    }

    /// Newest-wins notification of closed candles
    pub fn trigger(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.trigger.clone()
    }

    /// Stop sources; ingestion drains what is queued and exits
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("Feed task ended abnormally: {}", e);
            }
        }
    }
}
