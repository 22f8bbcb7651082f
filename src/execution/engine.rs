use super::order::{OrderState, PendingOrder, TrackedOrder};
use super::position_ledger::PositionLedger;
use super::venue::{PlaceAck, Venue, VenueError, VenueOrderStatus};
use crate::config::ExecutionConfig;
use crate::error::{BotError, Delivery};
use crate::events::{EventSink, PipelineEvent};
use crate::models::{Fill, IdempotencyKey, OrderOutcome, OrderRequest};
use crate::persistence::LedgerStore;
use crate::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

/// Longest pause between reconciliation queries
const MAX_RECONCILE_BACKOFF: Duration = Duration::from_secs(30);

/// Submits orders, retries transient failures, confirms fills, and
/// reconciles orders whose outcome was lost.
pub struct ExecutionEngine {
    venue: Arc<dyn Venue>,
    store: Arc<dyn LedgerStore>,
    sink: Arc<dyn EventSink>,
    config: ExecutionConfig,
    halted: bool,
}

impl ExecutionEngine {
    pub fn new(
        venue: Arc<dyn Venue>,
        store: Arc<dyn LedgerStore>,
        sink: Arc<dyn EventSink>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            venue,
            store,
            sink,
            config,
            halted: false,
        }
    }

    /// True once reconciliation has given up; no further orders are placed
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn venue(&self) -> &Arc<dyn Venue> {
        &self.venue
    }

    /// Submit one order and settle its outcome into the ledger.
    ///
    /// `now` is the decision cycle's clock; fills and pending orders are
    /// stamped with it.
    ///
    /// Only failures that never left the process are resent blindly. After a
    /// failure that may have reached the venue, the order is looked up by key
    /// first and resent only if the venue has no record of it.
    pub async fn submit(
        &mut self,
        request: OrderRequest,
        ledger: &mut PositionLedger,
        now: DateTime<Utc>,
    ) -> Result<OrderOutcome> {
        if self.halted {
            return Err(BotError::TradingHalted {
                instrument: request.instrument.clone(),
            });
        }
        if let Some(pending) = ledger.unresolved() {
            return Err(BotError::TransientExecution {
                reason: format!(
                    "order {} awaits reconciliation",
                    pending.request.idempotency_key
                ),
                delivery: Delivery::NotSent,
            });
        }

        let mut order = TrackedOrder::new(request);
        let key = order.request.idempotency_key.clone();
        let max_attempts = self.config.max_submit_attempts.max(1);
        let submit_timeout = Duration::from_secs(self.config.submit_timeout_secs);
        let mut outcome = None;

        tracing::info!(
            key = %key,
            side = %order.request.side,
            size = order.request.size_in_base,
            price = order.request.reference_price,
            reason = ?order.request.reason,
            "Submitting order"
        );

        for attempt in 1..=max_attempts {
            self.transition(&mut order, OrderState::Submitted { attempt })?;

            match timeout(submit_timeout, self.venue.place_order(&order.request)).await {
                Ok(Ok(PlaceAck::Filled {
                    fill_price,
                    fill_size,
                })) => {
                    outcome = Some(OrderOutcome::Filled {
                        fill_price,
                        fill_size,
                    });
                }
                Ok(Ok(PlaceAck::Accepted { venue_order_id })) => {
                    tracing::debug!(key = %key, venue_order_id = %venue_order_id, "Order accepted");
                    outcome = Some(self.await_fill(&key).await);
                }
                Ok(Err(VenueError::Rejected { reason })) => {
                    outcome = Some(OrderOutcome::Rejected { reason });
                }
                Ok(Err(VenueError::Transient { reason, delivery })) => {
                    tracing::warn!(
                        key = %key,
                        attempt,
                        delivery = ?delivery,
                        "Transient submit failure: {}",
                        reason
                    );
                    if delivery == Delivery::MaybeReceived {
                        outcome = self.lookup_after_failure(&key).await;
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        key = %key,
                        attempt,
                        timeout_secs = submit_timeout.as_secs(),
                        "Submit timed out"
                    );
                    outcome = self.lookup_after_failure(&key).await;
                }
            }

            if outcome.is_some() {
                break;
            }
            if attempt < max_attempts {
                sleep(self.backoff(attempt)).await;
            }
        }

        let outcome = outcome.unwrap_or(OrderOutcome::Unknown);
        self.settle(&mut order, outcome.clone(), ledger, now).await?;
        Ok(outcome)
    }

    /// Ask the venue about an order whose submission may have reached it.
    ///
    /// `None` means the venue has no record of the key and resending is safe.
    /// A failed lookup settles as `Unknown` rather than risk a second order.
    async fn lookup_after_failure(&self, key: &IdempotencyKey) -> Option<OrderOutcome> {
        let query_timeout = Duration::from_secs(self.config.submit_timeout_secs);

        match timeout(query_timeout, self.venue.order_status(key)).await {
            Ok(Ok(VenueOrderStatus::NotFound)) => {
                tracing::debug!(key = %key, "Order not at venue, safe to resend");
                None
            }
            Ok(Ok(VenueOrderStatus::Filled {
                fill_price,
                fill_size,
            })) => {
                tracing::info!(key = %key, "Order filled despite failed submit");
                Some(OrderOutcome::Filled {
                    fill_price,
                    fill_size,
                })
            }
            Ok(Ok(VenueOrderStatus::Rejected { reason })) => {
                Some(OrderOutcome::Rejected { reason })
            }
            Ok(Ok(VenueOrderStatus::Pending)) => Some(self.await_fill(key).await),
            Ok(Err(e)) => {
                tracing::warn!(key = %key, "Status lookup after failed submit failed: {}", e);
                Some(OrderOutcome::Unknown)
            }
            Err(_) => {
                tracing::warn!(key = %key, "Status lookup after failed submit timed out");
                Some(OrderOutcome::Unknown)
            }
        }
    }

    /// Resolve an order left `Unknown`, before any new order for the instrument.
    ///
    /// Returns the resolved outcome, or `None` when nothing was pending. When
    /// the reconciliation window runs out, trading halts and a fatal error is
    /// returned.
    pub async fn reconcile(
        &mut self,
        ledger: &mut PositionLedger,
        now: DateTime<Utc>,
    ) -> Result<Option<OrderOutcome>> {
        let Some(pending) = ledger.unresolved().cloned() else {
            return Ok(None);
        };
        if self.halted {
            return Err(BotError::TradingHalted {
                instrument: pending.request.instrument.clone(),
            });
        }

        let key = pending.request.idempotency_key.clone();
        self.sink
            .emit(&PipelineEvent::ReconciliationStarted { key: key.clone() });

        let window = Duration::from_secs(self.config.reconcile_window_secs);
        let query_timeout = Duration::from_secs(self.config.submit_timeout_secs);
        let started = Instant::now();
        let mut attempt = 1;

        let outcome = loop {
            match timeout(query_timeout, self.venue.order_status(&key)).await {
                Ok(Ok(VenueOrderStatus::Filled {
                    fill_price,
                    fill_size,
                })) => {
                    break OrderOutcome::Filled {
                        fill_price,
                        fill_size,
                    }
                }
                Ok(Ok(VenueOrderStatus::Rejected { reason })) => {
                    break OrderOutcome::Rejected { reason }
                }
                Ok(Ok(VenueOrderStatus::NotFound)) => {
                    break OrderOutcome::Rejected {
                        reason: "not found at venue".to_string(),
                    }
                }
                Ok(Ok(VenueOrderStatus::Pending)) => {
                    tracing::info!(key = %key, "Order still working at venue");
                }
                Ok(Err(e)) => tracing::warn!(key = %key, "Reconciliation query failed: {}", e),
                Err(_) => tracing::warn!(key = %key, "Reconciliation query timed out"),
            }

            let elapsed = started.elapsed();
            if elapsed >= window {
                return Err(self.halt(&pending, elapsed));
            }
            sleep(self.backoff(attempt).min(MAX_RECONCILE_BACKOFF).min(window - elapsed)).await;
            attempt += 1;
        };

        tracing::info!(key = %key, outcome = ?outcome, "Order reconciled");
        self.sink.emit(&PipelineEvent::ReconciliationResolved {
            key: key.clone(),
            outcome: outcome.clone(),
        });

        let mut order = TrackedOrder::resume_unknown(pending.request);
        ledger.set_unresolved(None, now);
        self.settle(&mut order, outcome.clone(), ledger, now).await?;
        Ok(Some(outcome))
    }

    /// Poll an accepted order until filled, rejected, or the fill timeout.
    /// On timeout, cancel and look once more.
    async fn await_fill(&self, key: &IdempotencyKey) -> OrderOutcome {
        let fill_timeout = Duration::from_secs(self.config.fill_timeout_secs);
        let poll = Duration::from_millis(self.config.fill_poll_interval_ms.max(1));
        let query_timeout = Duration::from_secs(self.config.submit_timeout_secs);
        let deadline = Instant::now() + fill_timeout;

        while Instant::now() < deadline {
            sleep(poll.min(deadline - Instant::now())).await;
            match timeout(query_timeout, self.venue.order_status(key)).await {
                Ok(Ok(VenueOrderStatus::Filled {
                    fill_price,
                    fill_size,
                })) => {
                    return OrderOutcome::Filled {
                        fill_price,
                        fill_size,
                    }
                }
                Ok(Ok(VenueOrderStatus::Rejected { reason })) => {
                    return OrderOutcome::Rejected { reason }
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::debug!(key = %key, "Fill poll failed: {}", e),
                Err(_) => tracing::debug!(key = %key, "Fill poll timed out"),
            }
        }

        tracing::warn!(key = %key, "Order not filled in time, cancelling");
        if let Err(e) = self.venue.cancel_order(key).await {
            tracing::warn!(key = %key, "Cancel failed: {}", e);
        }

        match timeout(query_timeout, self.venue.order_status(key)).await {
            Ok(Ok(VenueOrderStatus::Filled {
                fill_price,
                fill_size,
            })) => OrderOutcome::Filled {
                fill_price,
                fill_size,
            },
            Ok(Ok(VenueOrderStatus::Rejected { .. })) | Ok(Ok(VenueOrderStatus::NotFound)) => {
                OrderOutcome::TimedOut
            }
            // still working or unobservable: the order may yet fill
            _ => OrderOutcome::Unknown,
        }
    }

    async fn settle(
        &self,
        order: &mut TrackedOrder,
        outcome: OrderOutcome,
        ledger: &mut PositionLedger,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(order, OrderState::from_outcome(&outcome))?;
        let request = &order.request;

        self.sink.emit(&PipelineEvent::OrderOutcome {
            key: request.idempotency_key.clone(),
            side: request.side,
            outcome: outcome.clone(),
        });

        match &outcome {
            OrderOutcome::Filled { .. } => {
                if let Some(fill) = Fill::from_outcome(request, &outcome, now) {
                    if ledger.apply_fill(&fill) {
                        let snapshot = ledger.read();
                        self.sink.emit(&PipelineEvent::LedgerUpdated {
                            instrument: snapshot.instrument.clone(),
                            position_size: snapshot
                                .position
                                .as_ref()
                                .map(|p| p.size_in_base)
                                .unwrap_or(0.0),
                            cash: snapshot.cash,
                            realized_pnl: snapshot.stats.realized_pnl,
                        });
                    }
                }
            }
            OrderOutcome::Rejected { reason } => {
                tracing::warn!(key = %request.idempotency_key, "Order rejected: {}", reason);
            }
            OrderOutcome::TimedOut => {
                tracing::warn!(key = %request.idempotency_key, "Order timed out unfilled");
            }
            OrderOutcome::Unknown => {
                tracing::error!(
                    key = %request.idempotency_key,
                    "Order outcome unknown, reconciliation required"
                );
                ledger.set_unresolved(
                    Some(PendingOrder {
                        request: request.clone(),
                        since: now,
                    }),
                    now,
                );
            }
        }

        self.persist(ledger).await
    }

    async fn persist(&self, ledger: &PositionLedger) -> Result<()> {
        self.store
            .save(&ledger.read())
            .await
            .map_err(|e| BotError::LedgerStore {
                reason: e.to_string(),
            })
    }

    fn transition(&self, order: &mut TrackedOrder, next: OrderState) -> Result<()> {
        let from = order.transition(next)?;
        self.sink.emit(&PipelineEvent::OrderTransition {
            key: order.request.idempotency_key.clone(),
            from: from.to_string(),
            to: next.to_string(),
        });
        Ok(())
    }

    fn halt(&mut self, pending: &PendingOrder, elapsed: Duration) -> BotError {
        self.halted = true;
        let key = pending.request.idempotency_key.clone();

        tracing::error!(
            instrument = %pending.request.instrument,
            key = %key,
            elapsed_secs = elapsed.as_secs(),
            "Reconciliation window exhausted, halting trading"
        );
        self.sink.emit(&PipelineEvent::TradingHalted {
            instrument: pending.request.instrument.clone(),
            key: key.clone(),
            elapsed_secs: elapsed.as_secs(),
        });

        BotError::AmbiguousExecution {
            key: key.to_string(),
            elapsed_secs: elapsed.as_secs(),
        }
    }

    /// base * 2^(attempt - 1)
    fn backoff(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.config.retry_base_delay_ms);
        base.saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::events::MemorySink;
    use crate::execution::venue::{SimFault, SimulatedVenue};
    use crate::models::{OrderReason, OrderType, Side};
    use crate::persistence::MemoryStore;

    struct Harness {
        engine: ExecutionEngine,
        venue: Arc<SimulatedVenue>,
        store: MemoryStore,
        sink: Arc<MemorySink>,
        ledger: PositionLedger,
    }

    fn harness() -> Harness {
        let venue = Arc::new(SimulatedVenue::instant());
        let store = MemoryStore::new();
        let sink = Arc::new(MemorySink::new());
        let engine = ExecutionEngine::new(
            venue.clone(),
            Arc::new(store.clone()),
            sink.clone(),
            ExecutionConfig::default(),
        );
        Harness {
            engine,
            venue,
            store,
            sink,
            ledger: PositionLedger::new("BTC-USD", 10_000.0, &RiskConfig::default()),
        }
    }

    fn buy(size: f64) -> OrderRequest {
        let t = Utc::now();
        OrderRequest {
            side: Side::Buy,
            instrument: "BTC-USD".to_string(),
            size_in_base: size,
            order_type: OrderType::Market,
            idempotency_key: IdempotencyKey::derive("BTC-USD", t, Side::Buy),
            reference_price: 100.0,
            limit_price: None,
            reason: OrderReason::Signal,
            decided_at: t,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_filled_on_first_attempt() {
        let mut h = harness();
        let outcome = h.engine.submit(buy(5.0), &mut h.ledger, Utc::now()).await.unwrap();

        assert!(outcome.is_filled());
        assert_eq!(h.ledger.position().unwrap().size_in_base, 5.0);
        assert_eq!(h.store.save_count(), 1);
        assert_eq!(
            h.sink
                .count(|e| matches!(e, PipelineEvent::OrderTransition { .. })),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_timeouts_then_success() {
        let mut h = harness();
        h.venue.script_place([SimFault::Timeout, SimFault::Timeout]);

        let outcome = h.engine.submit(buy(5.0), &mut h.ledger, Utc::now()).await.unwrap();

        assert!(outcome.is_filled());
        assert_eq!(h.venue.place_calls(), 3);
        assert_eq!(h.venue.fill_count(), 1);
        assert_eq!(h.ledger.stats().fills, 1);
        assert_eq!(h.ledger.position().unwrap().size_in_base, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_response_retry_is_deduplicated() {
        let mut h = harness();
        h.venue.script_place([SimFault::LostResponse]);

        let outcome = h.engine.submit(buy(5.0), &mut h.ledger, Utc::now()).await.unwrap();

        assert!(outcome.is_filled());
        assert_eq!(h.venue.fill_count(), 1);
        // found by key, never resent
        assert_eq!(h.venue.place_calls(), 1);
        assert_eq!(h.venue.status_calls(), 1);
        assert_eq!(h.ledger.position().unwrap().size_in_base, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_looks_up_before_resending() {
        let mut h = harness();
        h.venue.script_place([SimFault::ServerError]);

        let outcome = h.engine.submit(buy(5.0), &mut h.ledger, Utc::now()).await.unwrap();

        assert!(outcome.is_filled());
        assert_eq!(h.venue.status_calls(), 1);
        assert_eq!(h.venue.place_calls(), 2);
        assert_eq!(h.venue.fill_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_lookup_goes_unknown_without_resend() {
        let mut h = harness();
        h.venue.script_place([SimFault::ServerError]);
        h.venue.script_status([SimFault::ServerError]);

        let outcome = h.engine.submit(buy(5.0), &mut h.ledger, Utc::now()).await.unwrap();

        assert_eq!(outcome, OrderOutcome::Unknown);
        assert_eq!(h.venue.place_calls(), 1);
        assert_eq!(h.venue.status_calls(), 1);
        assert!(h.ledger.unresolved().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_refused_resends_without_lookup() {
        let mut h = harness();
        h.venue
            .script_place([SimFault::ConnectRefused, SimFault::ConnectRefused]);

        let outcome = h.engine.submit(buy(5.0), &mut h.ledger, Utc::now()).await.unwrap();

        assert!(outcome.is_filled());
        assert_eq!(h.venue.place_calls(), 3);
        assert_eq!(h.venue.status_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_stamped_with_cycle_clock() {
        let mut h = harness();
        let cycle = Utc::now() - chrono::Duration::days(30);

        h.engine.submit(buy(5.0), &mut h.ledger, cycle).await.unwrap();

        assert_eq!(h.ledger.cooldown().last_trade_at, Some(cycle));
        assert_eq!(h.ledger.position().unwrap().opened_at, cycle);
        assert_eq!(h.store.latest().unwrap().updated_at, cycle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_terminal() {
        let mut h = harness();
        h.venue
            .script_place([SimFault::Reject("INSUFFICIENT_FUND".to_string())]);

        let outcome = h.engine.submit(buy(5.0), &mut h.ledger, Utc::now()).await.unwrap();

        assert!(matches!(outcome, OrderOutcome::Rejected { .. }));
        assert_eq!(h.venue.place_calls(), 1);
        assert!(h.ledger.position().is_none());
        assert!(h.ledger.cooldown().last_trade_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_leave_unknown() {
        let mut h = harness();
        h.venue.script_place([
            SimFault::ServerError,
            SimFault::ServerError,
            SimFault::ServerError,
        ]);

        let outcome = h.engine.submit(buy(5.0), &mut h.ledger, Utc::now()).await.unwrap();

        assert_eq!(outcome, OrderOutcome::Unknown);
        assert!(h.ledger.position().is_none());
        assert!(h.ledger.unresolved().is_some());
        assert!(h.store.latest().unwrap().unresolved.is_some());

        // new submissions wait for reconciliation
        assert!(h.engine.submit(buy(1.0), &mut h.ledger, Utc::now()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_order_never_booked() {
        let mut h = harness();
        h.venue.script_place([
            SimFault::ConnectRefused,
            SimFault::ConnectRefused,
            SimFault::ConnectRefused,
        ]);
        let outcome = h.engine.submit(buy(5.0), &mut h.ledger, Utc::now()).await.unwrap();
        assert_eq!(outcome, OrderOutcome::Unknown);

        let resolved = h.engine.reconcile(&mut h.ledger, Utc::now()).await.unwrap();

        assert!(matches!(resolved, Some(OrderOutcome::Rejected { .. })));
        assert!(h.ledger.unresolved().is_none());
        assert!(h.ledger.position().is_none());
        assert!(h.store.latest().unwrap().unresolved.is_none());

        // nothing pending any more
        assert_eq!(h.engine.reconcile(&mut h.ledger, Utc::now()).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_applies_hidden_fill() {
        let mut h = harness();
        let request = buy(5.0);
        h.venue.place_order(&request).await.unwrap();
        h.ledger.set_unresolved(
            Some(PendingOrder {
                request,
                since: Utc::now(),
            }),
            Utc::now(),
        );
        h.venue.script_status([SimFault::ServerError, SimFault::ServerError]);

        let resolved = h.engine.reconcile(&mut h.ledger, Utc::now()).await.unwrap();

        assert!(matches!(resolved, Some(OrderOutcome::Filled { .. })));
        assert_eq!(h.ledger.position().unwrap().size_in_base, 5.0);
        assert!(h.ledger.unresolved().is_none());
        assert_eq!(h.venue.fill_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_window_exhausted_halts() {
        let mut h = harness();
        h.ledger.set_unresolved(
            Some(PendingOrder {
                request: buy(5.0),
                since: Utc::now(),
            }),
            Utc::now(),
        );
        h.venue.script_status(std::iter::repeat(SimFault::ServerError).take(1000));

        let err = h.engine.reconcile(&mut h.ledger, Utc::now()).await.unwrap_err();

        assert!(err.is_fatal());
        assert!(h.engine.is_halted());
        assert!(h.ledger.unresolved().is_some());
        assert_eq!(
            h.sink
                .count(|e| matches!(e, PipelineEvent::TradingHalted { .. })),
            1
        );
        assert!(matches!(
            h.engine.submit(buy(1.0), &mut h.ledger, Utc::now()).await,
            Err(BotError::TradingHalted { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resting_order_times_out() {
        let mut h = harness();
        h.venue.script_place([SimFault::Rest]);

        let outcome = h.engine.submit(buy(5.0), &mut h.ledger, Utc::now()).await.unwrap();

        assert_eq!(outcome, OrderOutcome::TimedOut);
        assert!(h.ledger.position().is_none());
        assert!(h.ledger.unresolved().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_store_failure_is_fatal() {
        let mut h = harness();
        h.store.set_failing(true);

        let err = h.engine.submit(buy(5.0), &mut h.ledger, Utc::now()).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_backoff_doubles() {
        let h = harness();
        assert_eq!(h.engine.backoff(1), Duration::from_millis(500));
        assert_eq!(h.engine.backoff(2), Duration::from_millis(1000));
        assert_eq!(h.engine.backoff(3), Duration::from_millis(2000));
    }
}
