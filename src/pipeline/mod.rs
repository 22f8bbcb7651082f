use crate::config::TradingConfig;
use crate::error::BotError;
use crate::events::{EventSink, PipelineEvent};
use crate::execution::{ExecutionEngine, PositionLedger};
use crate::feed::FeedBuffer;
use crate::indicators::IndicatorEngine;
use crate::models::{OrderOutcome, Signal};
use crate::risk::{RiskDecision, RiskGate, VetoReason};
use crate::strategy::SignalGenerator;
use crate::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

const METRICS_INTERVAL_SECS: u64 = 300;

/// What one decision cycle did
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Trading halted for the instrument; nothing evaluated
    Halted,
    Stale { last_close_age_secs: i64 },
    /// Newest closed candle was already decided on
    NoNewCandle,
    Warmup { have: usize, need: usize },
    Hold,
    Vetoed(VetoReason),
    Executed(OrderOutcome),
    /// Order could not be submitted this cycle; retried on a later one
    Deferred(String),
}

/// Decision-and-execution pipeline for one instrument.
///
/// Cycles take `&mut self`, so two cycles for the same instrument can never
/// overlap; each instrument gets its own pipeline.
pub struct Pipeline {
    instrument: String,
    quote_currency: String,
    feed: FeedBuffer,
    indicators: IndicatorEngine,
    signals: SignalGenerator,
    gate: RiskGate,
    execution: ExecutionEngine,
    ledger: PositionLedger,
    sink: Arc<dyn EventSink>,
    last_decided: Option<DateTime<Utc>>,
    stale: bool,
}

impl Pipeline {
    pub fn new(
        config: &TradingConfig,
        feed: FeedBuffer,
        execution: ExecutionEngine,
        ledger: PositionLedger,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            instrument: config.trading_pair.clone(),
            quote_currency: config.quote_currency().to_string(),
            feed,
            indicators: IndicatorEngine::new(config.strategy.clone()),
            signals: SignalGenerator::new(config.strategy.clone()),
            gate: RiskGate::new(config.trading_pair.clone(), config.risk.clone()),
            execution,
            ledger,
            sink,
            last_decided: None,
            stale: false,
        }
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn is_halted(&self) -> bool {
        self.execution.is_halted()
    }

    /// Pull the venue's available quote balance into the ledger, when it has one
    pub async fn sync_balance(&mut self) -> Result<()> {
        match self
            .execution
            .venue()
            .available_balance(&self.quote_currency)
            .await
        {
            Ok(Some(balance)) => {
                tracing::debug!(currency = %self.quote_currency, balance, "Balance synced");
                self.ledger.sync_cash(balance);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(BotError::Feed(format!("balance query failed: {}", e))),
        }
    }

    /// Run one decision cycle against the feed as of `now`.
    ///
    /// Errors are returned only when they are fatal or the feed is unreadable;
    /// business outcomes (veto, hold, rejection) come back as [`CycleOutcome`].
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        if self.execution.is_halted() {
            return Ok(CycleOutcome::Halted);
        }

        // an unresolved order blocks everything else for the instrument
        if self.ledger.unresolved().is_some() {
            self.execution.reconcile(&mut self.ledger, now).await?;
        }

        match self.feed.check_staleness(now) {
            Ok(()) => self.stale = false,
            Err(BotError::StaleFeed {
                last_close_age_secs,
                window_secs,
            }) => {
                if !self.stale {
                    tracing::warn!(
                        instrument = %self.instrument,
                        last_close_age_secs,
                        window_secs,
                        "Feed is stale, skipping decisions"
                    );
                    self.sink.emit(&PipelineEvent::StaleFeed {
                        instrument: self.instrument.clone(),
                        last_close_age_secs,
                    });
                }
                self.stale = true;
                return Ok(CycleOutcome::Stale {
                    last_close_age_secs,
                });
            }
            Err(e) => return Err(e),
        }

        let series = self.feed.current_series()?;
        let Some(newest) = series.last().map(|c| c.open_time) else {
            return Ok(CycleOutcome::NoNewCandle);
        };
        if self.last_decided == Some(newest) {
            return Ok(CycleOutcome::NoNewCandle);
        }
        self.last_decided = Some(newest);

        let snapshot = self.indicators.update(&series);
        let intent = self.signals.decide(&snapshot);

        self.sink.emit(&PipelineEvent::Signal {
            instrument: self.instrument.clone(),
            signal: intent.signal,
            strength: intent.strength,
            rsi: snapshot.rsi,
            close: snapshot.close,
        });
        if intent.signal != Signal::Hold {
            tracing::info!(
                instrument = %self.instrument,
                signal = ?intent.signal,
                strength = intent.strength,
                rsi = ?snapshot.rsi,
                close = ?snapshot.close,
                "Signal generated"
            );
        }

        let Some(mark) = snapshot.close else {
            return Ok(CycleOutcome::Hold);
        };
        // decisions read a snapshot; the fill below mutates the live ledger
        let view = self.ledger.read();
        let account = self.ledger.account_state(mark);

        match self.gate.evaluate(&intent, &view, account, now) {
            RiskDecision::NoAction if !snapshot.is_warm() => {
                let warmup = BotError::IndicatorWarmup {
                    have: series.len(),
                    need: self.indicators.warmup_len(),
                };
                tracing::debug!(instrument = %self.instrument, "{}", warmup);
                Ok(CycleOutcome::Warmup {
                    have: series.len(),
                    need: self.indicators.warmup_len(),
                })
            }
            RiskDecision::NoAction => Ok(CycleOutcome::Hold),
            RiskDecision::Veto(veto) => {
                self.sink.emit(&PipelineEvent::Vetoed {
                    instrument: self.instrument.clone(),
                    side: Some(veto.side),
                    reason: veto.reason.to_string(),
                });
                Ok(CycleOutcome::Vetoed(veto.reason))
            }
            RiskDecision::Order(request) => {
                match self.execution.submit(request, &mut self.ledger, now).await {
                    Ok(outcome) => {
                        if let OrderOutcome::Rejected { reason } = &outcome {
                            let rejection = BotError::VenueRejection {
                                reason: reason.clone(),
                            };
                            tracing::warn!(instrument = %self.instrument, "{}", rejection);
                        }
                        Ok(CycleOutcome::Executed(outcome))
                    }
                    Err(e) if e.is_fatal() => Err(e),
                    Err(e) => {
                        tracing::warn!(instrument = %self.instrument, "Order deferred: {}", e);
                        Ok(CycleOutcome::Deferred(e.to_string()))
                    }
                }
            }
        }
    }

    /// Log ledger statistics; mirrors the periodic metrics report
    pub fn log_stats(&self) {
        let snapshot = self.ledger.read();
        let mark = self.feed.latest_price().unwrap_or_else(|| {
            snapshot
                .position
                .as_ref()
                .map(|p| p.entry_price)
                .unwrap_or(0.0)
        });

        tracing::info!(
            instrument = %self.instrument,
            equity = snapshot.equity(mark),
            cash = snapshot.cash,
            position_size = snapshot.position.as_ref().map(|p| p.size_in_base).unwrap_or(0.0),
            fills = snapshot.stats.fills,
            closed_trades = snapshot.stats.closed_trades,
            win_rate = snapshot.stats.win_rate(),
            realized_pnl = snapshot.stats.realized_pnl,
            max_drawdown_pct = snapshot.stats.max_drawdown_pct,
            gaps = self.feed.gap_count(),
            halted = self.execution.is_halted(),
            "📊 Trading metrics"
        );
    }

    /// Run a cycle at wall-clock time. Returns `false` when shutdown was
    /// requested while an order was being reconciled.
    async fn cycle_logged(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        let now = Utc::now();

        // reconciliation can poll for the whole window; shutdown must not wait
        // on it. The unresolved order stays persisted for the next start.
        if self.ledger.unresolved().is_some() && !self.execution.is_halted() {
            let reconciled = tokio::select! {
                result = self.execution.reconcile(&mut self.ledger, now) => Some(result),
                _ = shutdown.changed() => None,
            };
            match reconciled {
                None => {
                    tracing::warn!(
                        instrument = %self.instrument,
                        "Shutdown during reconciliation, order left unresolved"
                    );
                    return Ok(false);
                }
                Some(Err(e)) => {
                    self.absorb(e)?;
                    return Ok(true);
                }
                Some(Ok(_)) => {}
            }
        }

        match self.run_cycle(now).await {
            Ok(outcome) => {
                tracing::debug!(instrument = %self.instrument, outcome = ?outcome, "Cycle complete");
            }
            Err(e) => self.absorb(e)?,
        }
        Ok(true)
    }

    fn absorb(&self, e: BotError) -> Result<()> {
        match e {
            // the halt has been raised; keep the loop alive for metrics
            e if self.execution.is_halted() => {
                tracing::error!(instrument = %self.instrument, "Trading halted: {}", e);
                Ok(())
            }
            e if e.is_fatal() => Err(e),
            e => {
                tracing::warn!(instrument = %self.instrument, "Cycle failed: {}", e);
                Ok(())
            }
        }
    }

    /// Drive cycles from closed-candle notifications until shutdown.
    ///
    /// A watchdog tick every candle interval also runs a cycle, so staleness
    /// and pending reconciliation are noticed when candles stop arriving.
    pub async fn run(
        mut self,
        mut trigger: watch::Receiver<Option<DateTime<Utc>>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PositionLedger> {
        let every = self
            .feed
            .interval()
            .to_std()
            .unwrap_or(Duration::from_secs(60));
        let mut watchdog = tokio::time::interval(every);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut metrics = tokio::time::interval(Duration::from_secs(METRICS_INTERVAL_SECS));
        metrics.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(instrument = %self.instrument, "💹 Decision loop starting");

        loop {
            tokio::select! {
                changed = trigger.changed() => {
                    if changed.is_err() {
                        tracing::warn!(instrument = %self.instrument, "Feed closed, leaving decision loop");
                        break;
                    }
                    if !self.cycle_logged(&mut shutdown).await? {
                        break;
                    }
                }
                _ = watchdog.tick() => {
                    if !self.cycle_logged(&mut shutdown).await? {
                        break;
                    }
                }
                _ = metrics.tick() => self.log_stats(),
                _ = shutdown.changed() => {
                    tracing::info!(instrument = %self.instrument, "Shutdown requested");
                    break;
                }
            }
        }

        self.log_stats();
        Ok(self.ledger)
    }
}
