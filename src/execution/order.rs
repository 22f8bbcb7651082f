use crate::error::BotError;
use crate::models::{OrderOutcome, OrderRequest};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one logical order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrderState {
    Created,
    Submitted { attempt: u32 },
    Filled,
    Rejected,
    TimedOut,
    /// Outcome not observed; only reconciliation can move it on
    Unknown,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Rejected | OrderState::TimedOut
        )
    }

    pub fn can_transition_to(&self, next: &OrderState) -> bool {
        use OrderState::*;
        match (self, next) {
            (Created, Submitted { attempt: 1 }) => true,
            (Submitted { attempt: a }, Submitted { attempt: b }) => *b == a + 1,
            (Submitted { .. }, Filled | Rejected | TimedOut | Unknown) => true,
            (Unknown, Filled | Rejected) => true,
            _ => false,
        }
    }

    /// State an outcome settles the order in
    pub fn from_outcome(outcome: &OrderOutcome) -> Self {
        match outcome {
            OrderOutcome::Filled { .. } => OrderState::Filled,
            OrderOutcome::Rejected { .. } => OrderState::Rejected,
            OrderOutcome::TimedOut => OrderState::TimedOut,
            OrderOutcome::Unknown => OrderState::Unknown,
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderState::Created => write!(f, "created"),
            OrderState::Submitted { attempt } => write!(f, "submitted#{}", attempt),
            OrderState::Filled => write!(f, "filled"),
            OrderState::Rejected => write!(f, "rejected"),
            OrderState::TimedOut => write!(f, "timed_out"),
            OrderState::Unknown => write!(f, "unknown"),
        }
    }
}

/// An order request plus its validated state history
#[derive(Debug, Clone)]
pub struct TrackedOrder {
    pub request: OrderRequest,
    state: OrderState,
    history: Vec<(OrderState, DateTime<Utc>)>,
}

impl TrackedOrder {
    pub fn new(request: OrderRequest) -> Self {
        Self {
            request,
            state: OrderState::Created,
            history: vec![(OrderState::Created, Utc::now())],
        }
    }

    /// Resume tracking an order whose outcome was left unknown
    pub fn resume_unknown(request: OrderRequest) -> Self {
        Self {
            request,
            state: OrderState::Unknown,
            history: vec![(OrderState::Unknown, Utc::now())],
        }
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    pub fn history(&self) -> &[(OrderState, DateTime<Utc>)] {
        &self.history
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: OrderState) -> Result<OrderState> {
        if !self.state.can_transition_to(&next) {
            return Err(BotError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let previous = self.state;
        self.state = next;
        self.history.push((next, Utc::now()));
        Ok(previous)
    }
}

/// Order left in `Unknown`, persisted until reconciliation settles it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub request: OrderRequest,
    pub since: DateTime<Utc>,
}
