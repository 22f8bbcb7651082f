// Order lifecycle, venues and the position ledger
pub mod engine;
pub mod order;
pub mod position_ledger;
pub mod venue;

pub use engine::ExecutionEngine;
pub use order::{OrderState, PendingOrder, TrackedOrder};
pub use position_ledger::{LedgerSnapshot, LedgerStats, PositionLedger};
pub use venue::{FillModel, PlaceAck, SimFault, SimulatedVenue, Venue, VenueError, VenueOrderStatus};
