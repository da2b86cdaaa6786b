//! Durable state for orders, fills, escrows, auctions, and event cursors

pub mod manager;

pub use manager::PgStateManager;

use crate::auction::Auction;
use crate::error::CoordinatorResult;
use crate::escrow::Escrow;
use crate::fill::{Fill, Order};
use crate::ledger::EventCursor;

use async_trait::async_trait;

/// Aggregate counts for the status API
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub orders_open: u64,
    pub orders_filled: u64,
    pub orders_expired: u64,
    pub fills_settled: u64,
    pub fills_failed: u64,
}

/// Persistence seam for the coordinator.
///
/// The in-memory books remain the source of truth for protocol decisions;
/// the store mirrors them durably and carries the per-ledger cursors that
/// make replay resumable. `apply_fill_settlement` is the one mutation with
/// protocol weight: its conditional decrement is the durable backstop
/// against over-filling an order.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_order(&self, order: &Order) -> CoordinatorResult<()>;
    async fn save_fill(&self, fill: &Fill) -> CoordinatorResult<()>;
    async fn save_escrow(&self, escrow: &Escrow) -> CoordinatorResult<()>;
    async fn save_auction(&self, auction: &Auction) -> CoordinatorResult<()>;

    /// Atomically decrement the order's remaining amount for a settled
    /// fill. Returns false when the guard fails (insufficient remainder),
    /// without mutating anything.
    async fn apply_fill_settlement(
        &self,
        order: &Order,
        fill: &Fill,
    ) -> CoordinatorResult<bool>;

    async fn load_open_orders(&self) -> CoordinatorResult<Vec<Order>>;
    async fn load_fills(&self, order_id: &crate::fill::OrderId) -> CoordinatorResult<Vec<Fill>>;
    /// Escrows still open, for refund sweeps to pick up after a restart
    async fn load_open_escrows(&self) -> CoordinatorResult<Vec<Escrow>>;
    /// Auctions still open, so in-progress rounds survive a restart
    async fn load_auctions(&self) -> CoordinatorResult<Vec<Auction>>;

    async fn get_cursor(&self, ledger_id: &str) -> CoordinatorResult<EventCursor>;
    async fn save_cursor(&self, ledger_id: &str, cursor: EventCursor) -> CoordinatorResult<()>;

    async fn health_check(&self) -> CoordinatorResult<()>;
    async fn stats(&self) -> CoordinatorResult<StoreStats>;
}

#[cfg(test)]
pub mod memory {
    //! Volatile store used by unit tests

    use super::*;
    use crate::auction::{AuctionId, AuctionStatus};
    use crate::escrow::EscrowId;
    use crate::fill::{Amount, OrderId};
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryStore {
        orders: Mutex<HashMap<OrderId, Order>>,
        fills: Mutex<HashMap<OrderId, Vec<Fill>>>,
        escrows: Mutex<HashMap<EscrowId, Escrow>>,
        auctions: Mutex<HashMap<AuctionId, Auction>>,
        remaining: Mutex<HashMap<OrderId, Amount>>,
        cursors: Mutex<HashMap<String, EventCursor>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn save_order(&self, order: &Order) -> CoordinatorResult<()> {
            self.remaining
                .lock()
                .await
                .entry(order.order_id)
                .or_insert(order.remaining_amount);
            self.orders.lock().await.insert(order.order_id, order.clone());
            Ok(())
        }

        async fn save_fill(&self, fill: &Fill) -> CoordinatorResult<()> {
            let mut fills = self.fills.lock().await;
            let entry = fills.entry(fill.order_id).or_default();
            match entry.iter_mut().find(|f| f.fill_index == fill.fill_index) {
                Some(existing) => *existing = fill.clone(),
                None => entry.push(fill.clone()),
            }
            Ok(())
        }

        async fn save_escrow(&self, escrow: &Escrow) -> CoordinatorResult<()> {
            self.escrows
                .lock()
                .await
                .insert(escrow.escrow_id, escrow.clone());
            Ok(())
        }

        async fn save_auction(&self, auction: &Auction) -> CoordinatorResult<()> {
            self.auctions
                .lock()
                .await
                .insert(auction.auction_id, auction.clone());
            Ok(())
        }

        async fn apply_fill_settlement(
            &self,
            order: &Order,
            fill: &Fill,
        ) -> CoordinatorResult<bool> {
            let mut remaining = self.remaining.lock().await;
            let r = remaining.entry(order.order_id).or_insert(order.source_amount);
            if *r < fill.fill_amount {
                return Ok(false);
            }
            *r -= fill.fill_amount;
            Ok(true)
        }

        async fn load_open_orders(&self) -> CoordinatorResult<Vec<Order>> {
            Ok(self.orders.lock().await.values().cloned().collect())
        }

        async fn load_fills(&self, order_id: &OrderId) -> CoordinatorResult<Vec<Fill>> {
            Ok(self
                .fills
                .lock()
                .await
                .get(order_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn load_open_escrows(&self) -> CoordinatorResult<Vec<Escrow>> {
            Ok(self
                .escrows
                .lock()
                .await
                .values()
                .filter(|e| e.is_open())
                .cloned()
                .collect())
        }

        async fn load_auctions(&self) -> CoordinatorResult<Vec<Auction>> {
            Ok(self
                .auctions
                .lock()
                .await
                .values()
                .filter(|a| a.status == AuctionStatus::Open)
                .cloned()
                .collect())
        }

        async fn get_cursor(&self, ledger_id: &str) -> CoordinatorResult<EventCursor> {
            Ok(self
                .cursors
                .lock()
                .await
                .get(ledger_id)
                .copied()
                .unwrap_or(0))
        }

        async fn save_cursor(&self, ledger_id: &str, cursor: EventCursor) -> CoordinatorResult<()> {
            self.cursors
                .lock()
                .await
                .insert(ledger_id.to_string(), cursor);
            Ok(())
        }

        async fn health_check(&self) -> CoordinatorResult<()> {
            Ok(())
        }

        async fn stats(&self) -> CoordinatorResult<StoreStats> {
            Ok(StoreStats::default())
        }
    }
}
