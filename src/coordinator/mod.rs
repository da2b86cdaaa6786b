//! Swap coordination: the event-driven engine that turns observed ledger
//! events into escrow submissions, auctions, settlements, and refunds

pub mod backoff;
pub mod engine;

pub use engine::{OrderIntent, OrderView, SwapCoordinator};

use crate::escrow::EscrowLeg;
use crate::fill::{Amount, OrderCompletion, OrderId};

/// Outbound notifications for API consumers and resolvers
#[derive(Debug, Clone)]
pub enum CoordinatorNotice {
    /// The fill secret handed to the winning resolver once both escrows
    /// stand. Disclosure is the point of no return for this fill.
    SecretDisclosed {
        order_id: OrderId,
        fill_index: u32,
        resolver: String,
        secret: Vec<u8>,
    },
    FillRecorded {
        order_id: OrderId,
        fill_index: u32,
        resolver: String,
        fill_amount: Amount,
        dest_amount: Amount,
    },
    FillRefunded {
        order_id: OrderId,
        fill_index: u32,
        leg: EscrowLeg,
    },
    OrderCompleted(OrderCompletion),
    OrderExpired {
        order_id: OrderId,
    },
}
