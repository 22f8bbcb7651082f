use crate::error::Delivery;
use crate::feed::FeedBuffer;
use crate::models::{IdempotencyKey, OrderRequest, Side};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VenueError {
    /// Retryable: connection reset, timeout, 5xx
    #[error("transient venue failure: {reason}")]
    Transient { reason: String, delivery: Delivery },

    /// Terminal: risk rule, insufficient funds, invalid size
    #[error("rejected by venue: {reason}")]
    Rejected { reason: String },
}

impl VenueError {
    pub fn transient(reason: impl Into<String>, delivery: Delivery) -> Self {
        VenueError::Transient {
            reason: reason.into(),
            delivery,
        }
    }
}

/// Immediate answer to an order placement
#[derive(Debug, Clone, PartialEq)]
pub enum PlaceAck {
    /// Resting at the venue; poll for the fill
    Accepted { venue_order_id: String },
    Filled { fill_price: f64, fill_size: f64 },
}

/// Venue-side status of an order looked up by idempotency key
#[derive(Debug, Clone, PartialEq)]
pub enum VenueOrderStatus {
    Filled { fill_price: f64, fill_size: f64 },
    Rejected { reason: String },
    Pending,
    /// The venue has no order with this key
    NotFound,
}

/// Outbound order interface
#[async_trait]
pub trait Venue: Send + Sync {
    /// Place an order. The idempotency key doubles as the client order id,
    /// so placing the same key twice yields one order.
    async fn place_order(&self, request: &OrderRequest) -> Result<PlaceAck, VenueError>;

    async fn order_status(&self, key: &IdempotencyKey) -> Result<VenueOrderStatus, VenueError>;

    async fn cancel_order(&self, key: &IdempotencyKey) -> Result<(), VenueError>;

    /// Available balance in `currency`, when the venue holds real funds
    async fn available_balance(&self, _currency: &str) -> Result<Option<f64>, VenueError> {
        Ok(None)
    }
}

/// Scripted misbehaviour for the simulated venue, consumed one per call
#[derive(Debug, Clone, PartialEq)]
pub enum SimFault {
    /// Hangs past any submit timeout; nothing reaches the book
    Timeout,
    /// Order is booked and filled, but the response is lost
    LostResponse,
    /// 5xx before the order is booked
    ServerError,
    /// Connection refused; request never left
    ConnectRefused,
    Reject(String),
    /// Booked but left resting without a fill
    Rest,
}

/// How the simulated venue prices fills
#[derive(Clone)]
pub enum FillModel {
    /// Fill instantly at the request's reference price
    Instant,
    /// Fill at the latest feed price moved against us by `bps`
    Slippage { bps: u32, prices: FeedBuffer },
}

#[derive(Default)]
struct SimState {
    orders: HashMap<IdempotencyKey, VenueOrderStatus>,
    place_faults: VecDeque<SimFault>,
    status_faults: VecDeque<SimFault>,
    place_calls: u32,
    status_calls: u32,
    fills: u32,
}

/// In-process venue for test and paper modes.
///
/// De-duplicates by idempotency key, so a retried placement never fills twice.
pub struct SimulatedVenue {
    model: FillModel,
    state: Mutex<SimState>,
}

impl SimulatedVenue {
    pub fn new(model: FillModel) -> Self {
        Self {
            model,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn instant() -> Self {
        Self::new(FillModel::Instant)
    }

    /// Queue faults for upcoming `place_order` calls
    pub fn script_place(&self, faults: impl IntoIterator<Item = SimFault>) {
        if let Ok(mut state) = self.state.lock() {
            state.place_faults.extend(faults);
        }
    }

    /// Queue faults for upcoming `order_status` calls
    pub fn script_status(&self, faults: impl IntoIterator<Item = SimFault>) {
        if let Ok(mut state) = self.state.lock() {
            state.status_faults.extend(faults);
        }
    }

    /// Distinct fills executed
    pub fn fill_count(&self) -> u32 {
        self.state.lock().map(|s| s.fills).unwrap_or(0)
    }

    pub fn place_calls(&self) -> u32 {
        self.state.lock().map(|s| s.place_calls).unwrap_or(0)
    }

    pub fn status_calls(&self) -> u32 {
        self.state.lock().map(|s| s.status_calls).unwrap_or(0)
    }

    /// Fill a resting order, as the market would
    pub fn fill_resting(&self, key: &IdempotencyKey, fill_price: f64, fill_size: f64) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(status) = state.orders.get_mut(key) {
                if *status == VenueOrderStatus::Pending {
                    *status = VenueOrderStatus::Filled {
                        fill_price,
                        fill_size,
                    };
                    state.fills += 1;
                }
            }
        }
    }

    fn fill_price(&self, request: &OrderRequest) -> f64 {
        match &self.model {
            FillModel::Instant => request.limit_price.unwrap_or(request.reference_price),
            FillModel::Slippage { bps, prices } => {
                let base = prices.latest_price().unwrap_or(request.reference_price);
                let slip = *bps as f64 / 10_000.0;
                match request.side {
                    Side::Buy => base * (1.0 + slip),
                    Side::Sell => base * (1.0 - slip),
                }
            }
        }
    }

    fn book(&self, state: &mut SimState, request: &OrderRequest) -> VenueOrderStatus {
        let status = VenueOrderStatus::Filled {
            fill_price: self.fill_price(request),
            fill_size: request.size_in_base,
        };
        state
            .orders
            .insert(request.idempotency_key.clone(), status.clone());
        state.fills += 1;
        status
    }
}

fn ack_for(status: &VenueOrderStatus, key: &IdempotencyKey) -> Result<PlaceAck, VenueError> {
    match status {
        VenueOrderStatus::Filled {
            fill_price,
            fill_size,
        } => Ok(PlaceAck::Filled {
            fill_price: *fill_price,
            fill_size: *fill_size,
        }),
        VenueOrderStatus::Rejected { reason } => Err(VenueError::Rejected {
            reason: reason.clone(),
        }),
        VenueOrderStatus::Pending | VenueOrderStatus::NotFound => Ok(PlaceAck::Accepted {
            venue_order_id: key.to_string(),
        }),
    }
}

#[async_trait]
impl Venue for SimulatedVenue {
    async fn place_order(&self, request: &OrderRequest) -> Result<PlaceAck, VenueError> {
        let key = &request.idempotency_key;
        let fault = {
            let mut state = self
                .state
                .lock()
                .map_err(|e| VenueError::transient(e.to_string(), Delivery::NotSent))?;
            state.place_calls += 1;

            if let Some(existing) = state.orders.get(key).cloned() {
                tracing::debug!(key = %key, "Duplicate placement collapsed");
                return ack_for(&existing, key);
            }

            match state.place_faults.pop_front() {
                Some(SimFault::LostResponse) => {
                    self.book(&mut state, request);
                    return Err(VenueError::transient(
                        "connection reset",
                        Delivery::MaybeReceived,
                    ));
                }
                Some(SimFault::Reject(reason)) => {
                    state.orders.insert(
                        key.clone(),
                        VenueOrderStatus::Rejected {
                            reason: reason.clone(),
                        },
                    );
                    return Err(VenueError::Rejected { reason });
                }
                Some(SimFault::Rest) => {
                    state.orders.insert(key.clone(), VenueOrderStatus::Pending);
                    return Ok(PlaceAck::Accepted {
                        venue_order_id: key.to_string(),
                    });
                }
                Some(SimFault::ServerError) => {
                    return Err(VenueError::transient(
                        "503 service unavailable",
                        Delivery::MaybeReceived,
                    ));
                }
                Some(SimFault::ConnectRefused) => {
                    return Err(VenueError::transient(
                        "connection refused",
                        Delivery::NotSent,
                    ));
                }
                other => other,
            }
        };

        if fault == Some(SimFault::Timeout) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return Err(VenueError::transient("request timed out", Delivery::MaybeReceived));
        }

        let mut state = self
            .state
            .lock()
            .map_err(|e| VenueError::transient(e.to_string(), Delivery::NotSent))?;
        let status = self.book(&mut state, request);
        ack_for(&status, key)
    }

    async fn order_status(&self, key: &IdempotencyKey) -> Result<VenueOrderStatus, VenueError> {
        let fault = {
            let mut state = self
                .state
                .lock()
                .map_err(|e| VenueError::transient(e.to_string(), Delivery::NotSent))?;
            state.status_calls += 1;
            match state.status_faults.pop_front() {
                None => {
                    return Ok(state
                        .orders
                        .get(key)
                        .cloned()
                        .unwrap_or(VenueOrderStatus::NotFound))
                }
                Some(fault) => fault,
            }
        };

        if fault == SimFault::Timeout {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Err(VenueError::transient(
            "status query failed",
            Delivery::MaybeReceived,
        ))
    }

    async fn cancel_order(&self, key: &IdempotencyKey) -> Result<(), VenueError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| VenueError::transient(e.to_string(), Delivery::NotSent))?;
        if let Some(status) = state.orders.get_mut(key) {
            if *status == VenueOrderStatus::Pending {
                *status = VenueOrderStatus::Rejected {
                    reason: "cancelled".to_string(),
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderReason, OrderType};
    use chrono::Utc;

    fn request(side: Side) -> OrderRequest {
        let t = Utc::now();
        OrderRequest {
            side,
            instrument: "BTC-USD".to_string(),
            size_in_base: 0.02,
            order_type: OrderType::Market,
            idempotency_key: IdempotencyKey::derive("BTC-USD", t, side),
            reference_price: 50_000.0,
            limit_price: None,
            reason: OrderReason::Signal,
            decided_at: t,
        }
    }

    #[tokio::test]
    async fn test_instant_fill_at_reference_price() {
        let venue = SimulatedVenue::instant();
        let ack = venue.place_order(&request(Side::Buy)).await.unwrap();
        assert_eq!(
            ack,
            PlaceAck::Filled {
                fill_price: 50_000.0,
                fill_size: 0.02
            }
        );
        assert_eq!(venue.fill_count(), 1);
    }

    #[tokio::test]
    async fn test_same_key_fills_once() {
        let venue = SimulatedVenue::instant();
        let req = request(Side::Buy);

        venue.script_place([SimFault::LostResponse]);
        assert!(venue.place_order(&req).await.is_err());
        let retry = venue.place_order(&req).await.unwrap();

        assert!(matches!(retry, PlaceAck::Filled { .. }));
        assert_eq!(venue.fill_count(), 1);
        assert_eq!(venue.place_calls(), 2);
    }

    #[tokio::test]
    async fn test_reject_is_sticky() {
        let venue = SimulatedVenue::instant();
        let req = request(Side::Sell);
        venue.script_place([SimFault::Reject("INSUFFICIENT_FUND".to_string())]);

        assert!(matches!(
            venue.place_order(&req).await,
            Err(VenueError::Rejected { .. })
        ));
        assert!(matches!(
            venue.order_status(&req.idempotency_key).await.unwrap(),
            VenueOrderStatus::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_key_not_found() {
        let venue = SimulatedVenue::instant();
        let status = venue
            .order_status(&IdempotencyKey::from("nope"))
            .await
            .unwrap();
        assert_eq!(status, VenueOrderStatus::NotFound);
    }

    #[tokio::test]
    async fn test_resting_order_cancel() {
        let venue = SimulatedVenue::instant();
        let req = request(Side::Buy);
        venue.script_place([SimFault::Rest]);

        assert!(matches!(
            venue.place_order(&req).await.unwrap(),
            PlaceAck::Accepted { .. }
        ));
        venue.cancel_order(&req.idempotency_key).await.unwrap();
        assert_eq!(
            venue.order_status(&req.idempotency_key).await.unwrap(),
            VenueOrderStatus::Rejected {
                reason: "cancelled".to_string()
            }
        );
        assert_eq!(venue.fill_count(), 0);
    }

    #[tokio::test]
    async fn test_paper_slippage() {
        let prices = FeedBuffer::new(
            "BTC-USD",
            10,
            chrono::Duration::minutes(1),
            chrono::Duration::minutes(3),
        );
        prices
            .ingest(crate::models::RawTick::Trade {
                price: 40_000.0,
                size: 1.0,
                time: Utc::now(),
            })
            .unwrap();
        let venue = SimulatedVenue::new(FillModel::Slippage { bps: 10, prices });

        let PlaceAck::Filled { fill_price, .. } = venue.place_order(&request(Side::Buy)).await.unwrap()
        else {
            panic!("expected fill");
        };
        assert!((fill_price - 40_040.0).abs() < 1e-6);

        let PlaceAck::Filled { fill_price, .. } = venue.place_order(&request(Side::Sell)).await.unwrap()
        else {
            panic!("expected fill");
        };
        assert!((fill_price - 39_960.0).abs() < 1e-6);
    }
}
