// Risk management module
pub mod gate;

pub use gate::{RiskDecision, RiskGate, Veto, VetoReason};
