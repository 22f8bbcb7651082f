use super::order::PendingOrder;
use crate::config::RiskConfig;
use crate::models::{AccountState, CooldownTimer, Fill, IdempotencyKey, Position, Side};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fill keys remembered for de-duplication
const APPLIED_KEYS_KEPT: usize = 256;

/// Realized performance, updated on fills
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub fills: u64,
    pub closed_trades: u64,
    pub wins: u64,
    pub realized_pnl: f64,
    pub peak_equity: f64,
    /// Percent below peak equity, worst seen
    pub max_drawdown_pct: f64,
}

impl LedgerStats {
    pub fn win_rate(&self) -> f64 {
        if self.closed_trades == 0 {
            return 0.0;
        }
        self.wins as f64 / self.closed_trades as f64
    }
}

/// Complete ledger contents; also the persisted document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub instrument: String,
    pub position: Option<Position>,
    pub cooldown: CooldownTimer,
    /// Quote currency not tied up in the position
    pub cash: f64,
    pub stats: LedgerStats,
    #[serde(default)]
    pub applied_keys: Vec<IdempotencyKey>,
    /// Order awaiting reconciliation, if any
    #[serde(default)]
    pub unresolved: Option<PendingOrder>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerSnapshot {
    pub fn position_value(&self, mark_price: f64) -> f64 {
        self.position
            .as_ref()
            .map(|p| p.value_at(mark_price))
            .unwrap_or(0.0)
    }

    pub fn equity(&self, mark_price: f64) -> f64 {
        self.cash + self.position_value(mark_price)
    }
}

/// Source of truth for exposure, entry price and cooldown.
/// Mutated only through confirmed fills.
#[derive(Debug, Clone)]
pub struct PositionLedger {
    state: LedgerSnapshot,
    stop_loss_pct: f64,
    take_profit_pct: f64,
}

impl PositionLedger {
    pub fn new(instrument: impl Into<String>, initial_cash: f64, risk: &RiskConfig) -> Self {
        Self {
            state: LedgerSnapshot {
                instrument: instrument.into(),
                position: None,
                cooldown: CooldownTimer::default(),
                cash: initial_cash,
                stats: LedgerStats {
                    peak_equity: initial_cash,
                    ..LedgerStats::default()
                },
                applied_keys: Vec::new(),
                unresolved: None,
                updated_at: Utc::now(),
            },
            stop_loss_pct: risk.stop_loss_percentage,
            take_profit_pct: risk.take_profit_percentage,
        }
    }

    /// Rebuild from a persisted snapshot
    pub fn restore(state: LedgerSnapshot, risk: &RiskConfig) -> Self {
        tracing::info!(
            instrument = %state.instrument,
            has_position = state.position.is_some(),
            cash = state.cash,
            realized_pnl = state.stats.realized_pnl,
            "Restored position ledger"
        );
        Self {
            state,
            stop_loss_pct: risk.stop_loss_percentage,
            take_profit_pct: risk.take_profit_percentage,
        }
    }

    /// Immutable copy for one decision cycle
    pub fn read(&self) -> LedgerSnapshot {
        self.state.clone()
    }

    pub fn instrument(&self) -> &str {
        &self.state.instrument
    }

    pub fn position(&self) -> Option<&Position> {
        self.state.position.as_ref()
    }

    pub fn cooldown(&self) -> CooldownTimer {
        self.state.cooldown
    }

    pub fn stats(&self) -> &LedgerStats {
        &self.state.stats
    }

    pub fn unresolved(&self) -> Option<&PendingOrder> {
        self.state.unresolved.as_ref()
    }

    pub(crate) fn set_unresolved(&mut self, pending: Option<PendingOrder>, now: DateTime<Utc>) {
        self.state.unresolved = pending;
        self.state.updated_at = now;
    }

    /// Replace cash with the venue's available balance (live start-up)
    pub fn sync_cash(&mut self, available: f64) {
        self.state.cash = available;
        if self.state.stats.peak_equity < available {
            self.state.stats.peak_equity = available;
        }
    }

    pub fn account_state(&self, mark_price: f64) -> AccountState {
        AccountState {
            portfolio_value: self.state.equity(mark_price),
            available_balance: self.state.cash.max(0.0),
        }
    }

    /// Apply a confirmed fill. Returns false if this fill was already applied.
    pub fn apply_fill(&mut self, fill: &Fill) -> bool {
        if self.state.applied_keys.contains(&fill.idempotency_key) {
            tracing::warn!(
                key = %fill.idempotency_key,
                "Fill already applied, ignoring"
            );
            return false;
        }

        match fill.side {
            Side::Buy => self.apply_entry(fill),
            Side::Sell => self.apply_exit(fill),
        }

        self.state.cooldown.last_trade_at = Some(fill.filled_at);
        self.state.stats.fills += 1;
        self.state.applied_keys.push(fill.idempotency_key.clone());
        if self.state.applied_keys.len() > APPLIED_KEYS_KEPT {
            let excess = self.state.applied_keys.len() - APPLIED_KEYS_KEPT;
            self.state.applied_keys.drain(..excess);
        }

        let equity = self.state.equity(fill.price);
        let stats = &mut self.state.stats;
        if equity > stats.peak_equity {
            stats.peak_equity = equity;
        } else if stats.peak_equity > 0.0 {
            let drawdown = (stats.peak_equity - equity) / stats.peak_equity * 100.0;
            stats.max_drawdown_pct = stats.max_drawdown_pct.max(drawdown);
        }
        self.state.updated_at = fill.filled_at;

        true
    }

    fn apply_entry(&mut self, fill: &Fill) {
        self.state.cash -= fill.price * fill.size;

        let (size, entry_price, opened_at, realized_pnl) = match &self.state.position {
            Some(p) => {
                let size = p.size_in_base + fill.size;
                let entry = (p.entry_price * p.size_in_base + fill.price * fill.size) / size;
                (size, entry, p.opened_at, p.realized_pnl)
            }
            None => (fill.size, fill.price, fill.filled_at, 0.0),
        };

        self.state.position = Some(Position {
            size_in_base: size,
            entry_price,
            opened_at,
            stop_loss: entry_price * (1.0 - self.stop_loss_pct / 100.0),
            take_profit: entry_price * (1.0 + self.take_profit_pct / 100.0),
            realized_pnl,
        });

        tracing::info!(
            instrument = %self.state.instrument,
            price = fill.price,
            size = fill.size,
            entry_price,
            position_size = size,
            "Position opened/extended"
        );
    }

    fn apply_exit(&mut self, fill: &Fill) {
        self.state.cash += fill.price * fill.size;

        let Some(position) = self.state.position.as_mut() else {
            tracing::warn!(
                instrument = %self.state.instrument,
                key = %fill.idempotency_key,
                "Exit fill with no open position"
            );
            return;
        };

        let sold = fill.size.min(position.size_in_base);
        let pnl = sold * (fill.price - position.entry_price);
        position.size_in_base -= sold;
        position.realized_pnl += pnl;
        let round_trip_pnl = position.realized_pnl;
        self.state.stats.realized_pnl += pnl;

        let dust = position.size_in_base <= 1e-9 * sold.max(1.0);
        if dust {
            self.state.position = None;
            self.state.stats.closed_trades += 1;
            if round_trip_pnl > 0.0 {
                self.state.stats.wins += 1;
            }
        }

        tracing::info!(
            instrument = %self.state.instrument,
            price = fill.price,
            size = fill.size,
            pnl,
            realized_pnl = self.state.stats.realized_pnl,
            closed = dust,
            reason = ?fill.reason,
            "Position reduced/closed"
        );
    }
}
