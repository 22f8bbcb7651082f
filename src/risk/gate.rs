use crate::config::RiskConfig;
use crate::execution::position_ledger::LedgerSnapshot;
use crate::models::{
    AccountState, IdempotencyKey, OrderReason, OrderRequest, OrderType, Position, Side, Signal,
    TradeIntent,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VetoReason {
    CooldownActive,
    PositionLimit,
    BelowMinSize,
    NoPositionToExit,
}

impl VetoReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            VetoReason::CooldownActive => "cooldown_active",
            VetoReason::PositionLimit => "position_limit",
            VetoReason::BelowMinSize => "below_min_size",
            VetoReason::NoPositionToExit => "no_position_to_exit",
        }
    }
}

impl fmt::Display for VetoReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Veto {
    pub reason: VetoReason,
    pub side: Side,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Order(OrderRequest),
    Veto(Veto),
    /// HOLD with no stop-loss / take-profit trigger
    NoAction,
}

/// Turns a trade intent into an order request, or explains why not.
///
/// Stop-loss / take-profit is checked first on every cycle and overrides the
/// intent. After that: cooldown, direction, sizing, short-circuiting on the
/// first failure.
#[derive(Debug, Clone)]
pub struct RiskGate {
    instrument: String,
    config: RiskConfig,
    /// Position (`opened_at`, size) whose first forced exit was already issued.
    /// Any fill that changes the size re-arms the cooldown bypass.
    forced_exit_issued_for: Option<(DateTime<Utc>, f64)>,
}

impl RiskGate {
    pub fn new(instrument: impl Into<String>, config: RiskConfig) -> Self {
        Self {
            instrument: instrument.into(),
            config,
            forced_exit_issued_for: None,
        }
    }

    pub fn evaluate(
        &mut self,
        intent: &TradeIntent,
        ledger: &LedgerSnapshot,
        account: AccountState,
        now: DateTime<Utc>,
    ) -> RiskDecision {
        let Some(price) = intent.snapshot.close.filter(|p| *p > 0.0) else {
            return RiskDecision::NoAction;
        };
        let decided_at = intent.snapshot.candle_time.unwrap_or(now);
        let cooling = ledger.cooldown.is_active(now, self.config.cooldown_period());

        if let Some(position) = &ledger.position {
            if let Some(reason) = self.exit_trigger(position, price) {
                let marker = (position.opened_at, position.size_in_base);
                let first_exit = self.forced_exit_issued_for != Some(marker);
                if cooling && !first_exit {
                    return self.veto(
                        VetoReason::CooldownActive,
                        Side::Sell,
                        format!("forced exit retry, {}", self.cooldown_detail(ledger, now)),
                    );
                }
                self.forced_exit_issued_for = Some(marker);

                tracing::warn!(
                    instrument = %self.instrument,
                    reason = ?reason,
                    entry_price = position.entry_price,
                    price,
                    pnl_pct = position.unrealized_pct(price),
                    "Forced exit triggered"
                );
                return RiskDecision::Order(self.request(
                    Side::Sell,
                    position.size_in_base,
                    price,
                    reason,
                    decided_at,
                ));
            }
        }

        let side = match intent.signal {
            Signal::Hold => return RiskDecision::NoAction,
            Signal::Buy => Side::Buy,
            Signal::Sell => Side::Sell,
        };

        // 1. Cooldown
        if cooling {
            return self.veto(
                VetoReason::CooldownActive,
                side,
                self.cooldown_detail(ledger, now),
            );
        }

        let cap = self.config.max_position_size * account.portfolio_value;
        let position_value = ledger.position_value(price);

        // 2. Direction
        match side {
            Side::Buy if position_value >= cap => {
                return self.veto(
                    VetoReason::PositionLimit,
                    side,
                    format!("position ${:.2} at cap ${:.2}", position_value, cap),
                );
            }
            Side::Sell if ledger.position.is_none() => {
                return self.veto(
                    VetoReason::NoPositionToExit,
                    side,
                    "flat".to_string(),
                );
            }
            _ => {}
        }

        // 3. Sizing
        let (size_in_base, quote) = match (side, &ledger.position) {
            (Side::Sell, Some(position)) => {
                (position.size_in_base, position.value_at(price))
            }
            _ => {
                let quote = (cap - position_value).min(account.available_balance);
                (quote / price, quote)
            }
        };

        if quote < self.config.min_order_size {
            return self.veto(
                VetoReason::BelowMinSize,
                side,
                format!(
                    "${:.2} below minimum ${:.2}",
                    quote, self.config.min_order_size
                ),
            );
        }

        RiskDecision::Order(self.request(side, size_in_base, price, OrderReason::Signal, decided_at))
    }

    fn exit_trigger(&self, position: &Position, price: f64) -> Option<OrderReason> {
        let pnl_pct = position.unrealized_pct(price);
        if pnl_pct <= -self.config.stop_loss_percentage {
            Some(OrderReason::StopLoss)
        } else if pnl_pct >= self.config.take_profit_percentage {
            Some(OrderReason::TakeProfit)
        } else {
            None
        }
    }

    fn request(
        &self,
        side: Side,
        size_in_base: f64,
        price: f64,
        reason: OrderReason,
        decided_at: DateTime<Utc>,
    ) -> OrderRequest {
        let limit_price = match self.config.order_type {
            OrderType::Market => None,
            OrderType::Limit => Some(match side {
                Side::Buy => price * 0.999,
                Side::Sell => price * 1.001,
            }),
        };

        OrderRequest {
            side,
            instrument: self.instrument.clone(),
            size_in_base,
            order_type: self.config.order_type,
            idempotency_key: IdempotencyKey::derive(&self.instrument, decided_at, side),
            reference_price: price,
            limit_price,
            reason,
            decided_at,
        }
    }

    fn veto(&self, reason: VetoReason, side: Side, detail: String) -> RiskDecision {
        tracing::info!(
            instrument = %self.instrument,
            side = %side,
            reason = %reason,
            detail = %detail,
            "Risk veto"
        );
        RiskDecision::Veto(Veto {
            reason,
            side,
            detail,
        })
    }

    fn cooldown_detail(&self, ledger: &LedgerSnapshot, now: DateTime<Utc>) -> String {
        let remaining = ledger
            .cooldown
            .remaining(now, self.config.cooldown_period());
        format!("{}s remaining", remaining.num_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CooldownTimer, IndicatorSnapshot};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn intent(signal: Signal, close: f64) -> TradeIntent {
        TradeIntent {
            signal,
            strength: 0.5,
            snapshot: IndicatorSnapshot {
                candle_time: Some(t0()),
                close: Some(close),
                rsi: Some(25.0),
                bb_upper: Some(close * 1.1),
                bb_mid: Some(close * 1.05),
                bb_lower: Some(close),
            },
        }
    }

    fn flat_ledger(cash: f64) -> LedgerSnapshot {
        LedgerSnapshot {
            instrument: "BTC-USD".to_string(),
            position: None,
            cooldown: CooldownTimer::default(),
            cash,
            stats: Default::default(),
            applied_keys: Vec::new(),
            unresolved: None,
            updated_at: t0(),
        }
    }

    fn holding(entry: f64, size: f64, last_trade: DateTime<Utc>) -> LedgerSnapshot {
        LedgerSnapshot {
            position: Some(Position {
                size_in_base: size,
                entry_price: entry,
                opened_at: last_trade,
                stop_loss: entry * 0.98,
                take_profit: entry * 1.05,
                realized_pnl: 0.0,
            }),
            cooldown: CooldownTimer {
                last_trade_at: Some(last_trade),
            },
            cash: 10_000.0 - entry * size,
            ..flat_ledger(0.0)
        }
    }

    fn account(portfolio: f64, available: f64) -> AccountState {
        AccountState {
            portfolio_value: portfolio,
            available_balance: available,
        }
    }

    fn gate() -> RiskGate {
        RiskGate::new("BTC-USD", RiskConfig::default())
    }

    #[test]
    fn test_buy_sized_at_max_position() {
        let mut gate = gate();
        let decision = gate.evaluate(
            &intent(Signal::Buy, 100.0),
            &flat_ledger(10_000.0),
            account(10_000.0, 10_000.0),
            t0(),
        );

        let RiskDecision::Order(order) = decision else {
            panic!("expected order, got {:?}", decision);
        };
        assert_eq!(order.side, Side::Buy);
        assert!((order.size_in_base - 10.0).abs() < 1e-9);
        assert!((order.quote_value() - 1_000.0).abs() < 1e-9);
        assert_eq!(order.reason, OrderReason::Signal);
        assert_eq!(
            order.idempotency_key,
            IdempotencyKey::derive("BTC-USD", t0(), Side::Buy)
        );
    }

    #[test]
    fn test_buy_limited_by_available_balance() {
        let mut gate = gate();
        let decision = gate.evaluate(
            &intent(Signal::Buy, 100.0),
            &flat_ledger(500.0),
            account(10_000.0, 500.0),
            t0(),
        );
        let RiskDecision::Order(order) = decision else {
            panic!("expected order");
        };
        assert!((order.quote_value() - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_hold_is_no_action() {
        let mut gate = gate();
        let decision = gate.evaluate(
            &intent(Signal::Hold, 100.0),
            &flat_ledger(10_000.0),
            account(10_000.0, 10_000.0),
            t0(),
        );
        assert_eq!(decision, RiskDecision::NoAction);
    }

    #[test]
    fn test_cooldown_vetoes_signal() {
        let mut gate = gate();
        let mut ledger = flat_ledger(10_000.0);
        ledger.cooldown.last_trade_at = Some(t0() - Duration::seconds(100));

        let decision = gate.evaluate(
            &intent(Signal::Buy, 100.0),
            &ledger,
            account(10_000.0, 10_000.0),
            t0(),
        );
        let RiskDecision::Veto(veto) = decision else {
            panic!("expected veto");
        };
        assert_eq!(veto.reason, VetoReason::CooldownActive);
        assert_eq!(veto.detail, "200s remaining");
    }

    #[test]
    fn test_position_limit() {
        let mut gate = gate();
        let ledger = holding(100.0, 10.0, t0() - Duration::hours(1));

        let decision = gate.evaluate(
            &intent(Signal::Buy, 100.0),
            &ledger,
            account(10_000.0, 9_000.0),
            t0(),
        );
        assert!(matches!(
            decision,
            RiskDecision::Veto(Veto {
                reason: VetoReason::PositionLimit,
                ..
            })
        ));
    }

    #[test]
    fn test_sell_when_flat() {
        let mut gate = gate();
        let decision = gate.evaluate(
            &intent(Signal::Sell, 100.0),
            &flat_ledger(10_000.0),
            account(10_000.0, 10_000.0),
            t0(),
        );
        assert!(matches!(
            decision,
            RiskDecision::Veto(Veto {
                reason: VetoReason::NoPositionToExit,
                ..
            })
        ));
    }

    #[test]
    fn test_below_min_size() {
        let mut gate = gate();
        let decision = gate.evaluate(
            &intent(Signal::Buy, 100.0),
            &flat_ledger(5.0),
            account(10_000.0, 5.0),
            t0(),
        );
        assert!(matches!(
            decision,
            RiskDecision::Veto(Veto {
                reason: VetoReason::BelowMinSize,
                ..
            })
        ));
    }

    #[test]
    fn test_partial_position_tops_up_to_cap() {
        let mut gate = gate();
        let ledger = holding(100.0, 4.0, t0() - Duration::hours(1));

        let decision = gate.evaluate(
            &intent(Signal::Buy, 100.0),
            &ledger,
            account(10_000.0, 9_600.0),
            t0(),
        );
        let RiskDecision::Order(order) = decision else {
            panic!("expected order");
        };
        assert!((order.quote_value() - 600.0).abs() < 1e-9);
    }

    #[test]
    fn test_stop_loss_ignores_intent_and_cooldown_on_first_exit() {
        let mut gate = gate();
        // entered one minute ago, cooldown still active
        let ledger = holding(100.0, 10.0, t0() - Duration::minutes(1));

        let decision = gate.evaluate(
            &intent(Signal::Buy, 97.0),
            &ledger,
            account(9_970.0, 9_000.0),
            t0(),
        );
        let RiskDecision::Order(order) = decision else {
            panic!("expected forced exit, got {:?}", decision);
        };
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.reason, OrderReason::StopLoss);
        assert_eq!(order.size_in_base, 10.0);
    }

    #[test]
    fn test_repeated_forced_exit_respects_cooldown() {
        let mut gate = gate();
        let ledger = holding(100.0, 10.0, t0() - Duration::minutes(1));
        let first = gate.evaluate(
            &intent(Signal::Hold, 97.0),
            &ledger,
            account(9_970.0, 9_000.0),
            t0(),
        );
        assert!(matches!(first, RiskDecision::Order(_)));

        // exit did not fill; next cycle, same position
        let second = gate.evaluate(
            &intent(Signal::Hold, 96.0),
            &ledger,
            account(9_960.0, 9_000.0),
            t0() + Duration::minutes(1),
        );
        assert!(matches!(
            second,
            RiskDecision::Veto(Veto {
                reason: VetoReason::CooldownActive,
                ..
            })
        ));

        // once cooldown has run out it retries
        let third = gate.evaluate(
            &intent(Signal::Hold, 96.0),
            &ledger,
            account(9_960.0, 9_000.0),
            t0() + Duration::minutes(10),
        );
        assert!(matches!(third, RiskDecision::Order(_)));
    }

    #[test]
    fn test_partial_exit_fill_rearms_forced_exit() {
        let mut gate = gate();
        let ledger = holding(100.0, 10.0, t0() - Duration::minutes(1));
        let first = gate.evaluate(
            &intent(Signal::Hold, 97.0),
            &ledger,
            account(9_970.0, 9_000.0),
            t0(),
        );
        assert!(matches!(first, RiskDecision::Order(_)));

        // 4 of 10 filled at t0: size shrinks, cooldown restarts
        let mut reduced = ledger.clone();
        if let Some(position) = reduced.position.as_mut() {
            position.size_in_base = 6.0;
        }
        reduced.cooldown.last_trade_at = Some(t0());

        let second = gate.evaluate(
            &intent(Signal::Hold, 96.0),
            &reduced,
            account(9_960.0, 9_388.0),
            t0() + Duration::minutes(1),
        );
        let RiskDecision::Order(order) = second else {
            panic!("remaining position must stay closeable, got {:?}", second);
        };
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.reason, OrderReason::StopLoss);
        assert_eq!(order.size_in_base, 6.0);

        // unfilled again, same size: now subject to cooldown
        let third = gate.evaluate(
            &intent(Signal::Hold, 96.0),
            &reduced,
            account(9_960.0, 9_388.0),
            t0() + Duration::minutes(2),
        );
        assert!(matches!(
            third,
            RiskDecision::Veto(Veto {
                reason: VetoReason::CooldownActive,
                ..
            })
        ));
    }

    #[test]
    fn test_top_up_rearms_forced_exit() {
        let mut gate = gate();
        let ledger = holding(100.0, 4.0, t0() - Duration::minutes(1));
        assert!(matches!(
            gate.evaluate(
                &intent(Signal::Hold, 97.0),
                &ledger,
                account(9_988.0, 9_600.0),
                t0(),
            ),
            RiskDecision::Order(_)
        ));

        let mut topped_up = ledger.clone();
        if let Some(position) = topped_up.position.as_mut() {
            position.size_in_base = 8.0;
        }
        topped_up.cooldown.last_trade_at = Some(t0());

        let decision = gate.evaluate(
            &intent(Signal::Hold, 97.0),
            &topped_up,
            account(9_976.0, 9_200.0),
            t0() + Duration::minutes(1),
        );
        let RiskDecision::Order(order) = decision else {
            panic!("expected forced exit, got {:?}", decision);
        };
        assert_eq!(order.size_in_base, 8.0);
    }

    #[test]
    fn test_take_profit_retry_respects_cooldown() {
        let mut gate = gate();
        let ledger = holding(100.0, 10.0, t0() - Duration::minutes(1));
        let first = gate.evaluate(
            &intent(Signal::Hold, 106.0),
            &ledger,
            account(10_060.0, 9_000.0),
            t0(),
        );
        let RiskDecision::Order(order) = first else {
            panic!("expected take-profit exit");
        };
        assert_eq!(order.reason, OrderReason::TakeProfit);

        let second = gate.evaluate(
            &intent(Signal::Hold, 106.0),
            &ledger,
            account(10_060.0, 9_000.0),
            t0() + Duration::minutes(1),
        );
        assert!(matches!(
            second,
            RiskDecision::Veto(Veto {
                reason: VetoReason::CooldownActive,
                ..
            })
        ));
    }

    #[test]
    fn test_take_profit() {
        let mut gate = gate();
        let ledger = holding(100.0, 10.0, t0() - Duration::hours(1));
        let decision = gate.evaluate(
            &intent(Signal::Hold, 106.0),
            &ledger,
            account(10_060.0, 9_000.0),
            t0(),
        );
        let RiskDecision::Order(order) = decision else {
            panic!("expected take-profit exit");
        };
        assert_eq!(order.reason, OrderReason::TakeProfit);
    }

    #[test]
    fn test_limit_order_prices() {
        let config = RiskConfig {
            order_type: OrderType::Limit,
            ..RiskConfig::default()
        };
        let mut gate = RiskGate::new("BTC-USD", config);
        let decision = gate.evaluate(
            &intent(Signal::Buy, 100.0),
            &flat_ledger(10_000.0),
            account(10_000.0, 10_000.0),
            t0(),
        );
        let RiskDecision::Order(order) = decision else {
            panic!("expected order");
        };
        assert_eq!(order.limit_price, Some(100.0 * 0.999));
    }

    #[test]
    fn test_buy_never_exceeds_cap() {
        let mut gate = gate();
        for (portfolio, available, held) in [
            (10_000.0, 10_000.0, 0.0),
            (10_000.0, 100_000.0, 0.0),
            (50_000.0, 3_000.0, 2.0),
            (1_000.0, 1_000.0, 0.5),
        ] {
            let mut ledger = flat_ledger(available);
            if held > 0.0 {
                ledger = holding(100.0, held, t0() - Duration::hours(1));
            }
            if let RiskDecision::Order(order) = gate.evaluate(
                &intent(Signal::Buy, 100.0),
                &ledger,
                account(portfolio, available),
                t0(),
            ) {
                assert!(order.quote_value() <= 0.1 * portfolio + 1e-9);
            }
        }
    }
}
