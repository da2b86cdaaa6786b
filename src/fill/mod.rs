//! Order book and fill ledger
//!
//! The fill ledger is the single source of truth for `remaining_amount`.
//! Fills are append-only; settlement decrements the remainder as one
//! check-then-decrement operation under the book's write lock, so two
//! concurrent resolvers can never jointly over-fill an order.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::escrow::Hashlock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub type OrderId = [u8; 32];
/// All amounts are integer smallest-denomination values
pub type Amount = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Registered, no auction currently running
    Announced,
    Auctioning,
    /// An escrow pair is being built or settled for the active fill
    Filling,
    FullyFilled,
    Cancelled,
    Expired,
    /// Invariant breach: no further fills, pending manual reconciliation
    Frozen,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Announced => "announced",
            OrderStatus::Auctioning => "auctioning",
            OrderStatus::Filling => "filling",
            OrderStatus::FullyFilled => "fully_filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
            OrderStatus::Frozen => "frozen",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::FullyFilled | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }
}

/// A maker's signed intent to exchange `source_amount` on the source ledger
/// for at least `min_dest_amount` on the destination ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub maker: String,
    pub source_ledger: String,
    pub dest_ledger: String,
    pub source_amount: Amount,
    pub min_dest_amount: Amount,
    pub deadline: DateTime<Utc>,
    /// Absolute expiry of the source-leg escrows
    pub timelock: DateTime<Utc>,
    pub allows_partial_fill: bool,
    pub min_fill_amount: Amount,
    pub master_hashlock: Hashlock,
    pub status: OrderStatus,
    pub remaining_amount: Amount,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillState {
    /// Auction won, no escrow yet
    Pending,
    SourceEscrowed,
    PairEscrowed,
    Settled,
    Failed,
}

impl FillState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillState::Pending => "pending",
            FillState::SourceEscrowed => "source_escrowed",
            FillState::PairEscrowed => "pair_escrowed",
            FillState::Settled => "settled",
            FillState::Failed => "failed",
        }
    }

    fn in_flight(&self) -> bool {
        matches!(
            self,
            FillState::Pending | FillState::SourceEscrowed | FillState::PairEscrowed
        )
    }
}

/// One resolver's incremental settlement against an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub fill_index: u32,
    pub resolver: String,
    pub fill_amount: Amount,
    pub dest_amount: Amount,
    pub hashlock: Hashlock,
    pub state: FillState,
    pub recorded_at: DateTime<Utc>,
}

pub type FillId = (OrderId, u32);

/// Fired once when an order's remainder reaches zero
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCompletion {
    pub order_id: OrderId,
    pub total_filled: Amount,
    pub fill_count: u32,
    pub resolvers: Vec<String>,
}

/// Proportional destination amount for a partial fill, rounded down so the
/// aggregate delivered never exceeds the committed total. The rounding
/// remainder accrues to the maker.
pub fn proportional_dest_amount(
    min_dest_amount: Amount,
    fill_amount: Amount,
    source_amount: Amount,
) -> Amount {
    if source_amount == 0 {
        return 0;
    }
    ((min_dest_amount as u128 * fill_amount as u128) / source_amount as u128) as Amount
}

pub struct FillLedger {
    orders: RwLock<HashMap<OrderId, Order>>,
    fills: RwLock<HashMap<OrderId, Vec<Fill>>>,
}

impl FillLedger {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            fills: RwLock::new(HashMap::new()),
        }
    }

    /// Register an order. Re-registration of a known order is a no-op;
    /// returns whether the order was newly inserted.
    pub async fn register_order(&self, mut order: Order) -> bool {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.order_id) {
            return false;
        }
        if order.remaining_amount == 0 {
            order.remaining_amount = order.source_amount;
        }
        orders.insert(order.order_id, order);
        true
    }

    pub async fn get_order(&self, order_id: &OrderId) -> Option<Order> {
        self.orders.read().await.get(order_id).cloned()
    }

    pub async fn fills_for(&self, order_id: &OrderId) -> Vec<Fill> {
        self.fills
            .read()
            .await
            .get(order_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_fill(&self, order_id: &OrderId, fill_index: u32) -> Option<Fill> {
        self.fills
            .read()
            .await
            .get(order_id)
            .and_then(|fills| fills.iter().find(|f| f.fill_index == fill_index).cloned())
    }

    pub async fn next_fill_index(&self, order_id: &OrderId) -> u32 {
        self.fills
            .read()
            .await
            .get(order_id)
            .map(|fills| fills.len() as u32)
            .unwrap_or(0)
    }

    pub async fn set_status(&self, order_id: &OrderId, status: OrderStatus) {
        if let Some(order) = self.orders.write().await.get_mut(order_id) {
            order.status = status;
        }
    }

    /// Check the fill-size rules against the amount still uncommitted
    /// (remaining minus in-flight fills)
    pub async fn validate_fill_amount(
        &self,
        order_id: &OrderId,
        fill_amount: Amount,
    ) -> CoordinatorResult<()> {
        let orders = self.orders.read().await;
        let order = orders.get(order_id).ok_or(CoordinatorError::OrderNotFound {
            order_id: hex::encode(order_id),
        })?;

        match order.status {
            OrderStatus::Frozen => {
                return Err(CoordinatorError::OrderFrozen {
                    order_id: hex::encode(order_id),
                })
            }
            s if s.is_terminal() => {
                return Err(CoordinatorError::OrderClosed {
                    order_id: hex::encode(order_id),
                    status: s.as_str().to_string(),
                })
            }
            _ => {}
        }

        if !order.allows_partial_fill && fill_amount != order.source_amount {
            return Err(CoordinatorError::PartialFillsDisabled {
                order_id: hex::encode(order_id),
            });
        }

        let in_flight: Amount = self
            .fills
            .read()
            .await
            .get(order_id)
            .map(|fills| {
                fills
                    .iter()
                    .filter(|f| f.state.in_flight())
                    .map(|f| f.fill_amount)
                    .sum()
            })
            .unwrap_or(0);

        let available = order.remaining_amount.saturating_sub(in_flight);
        if fill_amount == 0 || fill_amount > available {
            return Err(CoordinatorError::FillExceedsRemaining {
                order_id: hex::encode(order_id),
                fill_amount,
                remaining: available,
            });
        }

        // Below-minimum fills are allowed only when they exhaust the remainder
        if fill_amount < order.min_fill_amount && fill_amount != available {
            return Err(CoordinatorError::FillTooSmall {
                order_id: hex::encode(order_id),
                fill_amount,
                min_fill_amount: order.min_fill_amount,
            });
        }

        Ok(())
    }

    /// Open a fill after an auction win. Validates the fill-size rules and
    /// appends a Pending fill record; the remainder is untouched until
    /// settlement.
    pub async fn begin_fill(
        &self,
        order_id: &OrderId,
        fill_index: u32,
        resolver: &str,
        fill_amount: Amount,
        hashlock: Hashlock,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<FillId> {
        self.validate_fill_amount(order_id, fill_amount).await?;

        // Lock order matches record_fill: orders before fills
        let orders = self.orders.read().await;
        let order = orders
            .get(order_id)
            .cloned()
            .ok_or(CoordinatorError::OrderNotFound {
                order_id: hex::encode(order_id),
            })?;

        let mut fills = self.fills.write().await;
        let order_fills = fills.entry(*order_id).or_default();
        if let Some(existing) = order_fills.iter().find(|f| f.fill_index == fill_index) {
            // Replay of a win we already acted on
            return Ok((existing.order_id, existing.fill_index));
        }

        order_fills.push(Fill {
            order_id: *order_id,
            fill_index,
            resolver: resolver.to_string(),
            fill_amount,
            dest_amount: proportional_dest_amount(
                order.min_dest_amount,
                fill_amount,
                order.source_amount,
            ),
            hashlock,
            state: FillState::Pending,
            recorded_at: now,
        });

        Ok((*order_id, fill_index))
    }

    /// Reinstate a fill loaded from the store on startup, bypassing the
    /// fill-size validation that already ran when it was first opened
    pub async fn restore_fill(&self, fill: Fill) {
        let mut fills = self.fills.write().await;
        let entry = fills.entry(fill.order_id).or_default();
        if !entry.iter().any(|f| f.fill_index == fill.fill_index) {
            entry.push(fill);
        }
    }

    pub async fn set_fill_state(
        &self,
        order_id: &OrderId,
        fill_index: u32,
        state: FillState,
    ) -> CoordinatorResult<()> {
        let mut fills = self.fills.write().await;
        let fill = fills
            .get_mut(order_id)
            .and_then(|fs| fs.iter_mut().find(|f| f.fill_index == fill_index))
            .ok_or(CoordinatorError::OrderNotFound {
                order_id: hex::encode(order_id),
            })?;
        fill.state = state;
        Ok(())
    }

    /// Settle a fill: the atomic check-then-decrement against the order's
    /// remainder. Replaying an already-settled fill is a no-op. Returns the
    /// completion event when the remainder reaches zero.
    pub async fn record_fill(
        &self,
        order_id: &OrderId,
        fill_index: u32,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<(FillId, Option<OrderCompletion>)> {
        let mut orders = self.orders.write().await;
        let mut fills = self.fills.write().await;

        let order = orders.get_mut(order_id).ok_or(CoordinatorError::OrderNotFound {
            order_id: hex::encode(order_id),
        })?;

        if order.status == OrderStatus::Frozen {
            return Err(CoordinatorError::OrderFrozen {
                order_id: hex::encode(order_id),
            });
        }

        let fill = fills
            .get_mut(order_id)
            .and_then(|fs| fs.iter_mut().find(|f| f.fill_index == fill_index))
            .ok_or(CoordinatorError::OrderNotFound {
                order_id: hex::encode(order_id),
            })?;

        if fill.state == FillState::Settled {
            return Ok(((*order_id, fill_index), None));
        }
        if fill.state == FillState::Failed {
            return Err(CoordinatorError::InvariantBreach {
                order_id: hex::encode(order_id),
                message: format!("settlement attempted on failed fill {}", fill_index),
            });
        }

        if fill.fill_amount > order.remaining_amount {
            // Over-fill reaching settlement means the accounting upstream
            // is broken; freeze this order only.
            order.status = OrderStatus::Frozen;
            warn!(
                "Freezing order {}: fill {} of {} exceeds remaining {}",
                hex::encode(order_id),
                fill_index,
                fill.fill_amount,
                order.remaining_amount
            );
            return Err(CoordinatorError::FillExceedsRemaining {
                order_id: hex::encode(order_id),
                fill_amount: fill.fill_amount,
                remaining: order.remaining_amount,
            });
        }

        order.remaining_amount -= fill.fill_amount;
        fill.state = FillState::Settled;
        fill.recorded_at = now;

        let completion = if order.remaining_amount == 0 {
            order.status = OrderStatus::FullyFilled;
            let settled: Vec<&Fill> = fills
                .get(order_id)
                .map(|fs| fs.iter().filter(|f| f.state == FillState::Settled).collect())
                .unwrap_or_default();
            let mut resolvers: Vec<String> =
                settled.iter().map(|f| f.resolver.clone()).collect();
            // Non-adjacent repeats too: a resolver may settle fills 0 and 2
            resolvers.sort_unstable();
            resolvers.dedup();
            info!(
                "Order {} fully filled across {} fills",
                hex::encode(order_id),
                settled.len()
            );
            Some(OrderCompletion {
                order_id: *order_id,
                total_filled: order.source_amount,
                fill_count: settled.len() as u32,
                resolvers,
            })
        } else {
            None
        };

        Ok(((*order_id, fill_index), completion))
    }

    /// Mark an in-flight fill as failed; its amount never enters the
    /// remainder accounting
    pub async fn mark_fill_failed(&self, order_id: &OrderId, fill_index: u32) {
        if let Some(fill) = self
            .fills
            .write()
            .await
            .get_mut(order_id)
            .and_then(|fs| fs.iter_mut().find(|f| f.fill_index == fill_index))
        {
            if fill.state != FillState::Settled {
                fill.state = FillState::Failed;
            }
        }
    }

    /// Cancel an order. Only allowed while nothing has filled or is in
    /// flight; after that, timeout is the only cancellation path.
    pub async fn cancel(&self, order_id: &OrderId) -> CoordinatorResult<()> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(order_id).ok_or(CoordinatorError::OrderNotFound {
            order_id: hex::encode(order_id),
        })?;

        if order.status.is_terminal() || order.status == OrderStatus::Frozen {
            return Err(CoordinatorError::OrderClosed {
                order_id: hex::encode(order_id),
                status: order.status.as_str().to_string(),
            });
        }

        let has_activity = order.remaining_amount != order.source_amount
            || self
                .fills
                .read()
                .await
                .get(order_id)
                .map(|fs| fs.iter().any(|f| f.state != FillState::Failed))
                .unwrap_or(false);
        if has_activity {
            return Err(CoordinatorError::CancelAfterFill {
                order_id: hex::encode(order_id),
            });
        }

        order.status = OrderStatus::Cancelled;
        Ok(())
    }

    /// Orders past their deadline with nothing in flight
    pub async fn expirable_orders(&self, now: DateTime<Utc>) -> Vec<OrderId> {
        let orders = self.orders.read().await;
        let fills = self.fills.read().await;
        orders
            .values()
            .filter(|o| {
                !o.status.is_terminal()
                    && o.status != OrderStatus::Frozen
                    && now >= o.deadline
                    && !fills
                        .get(&o.order_id)
                        .map(|fs| fs.iter().any(|f| f.state.in_flight()))
                        .unwrap_or(false)
            })
            .map(|o| o.order_id)
            .collect()
    }

    pub async fn freeze(&self, order_id: &OrderId) {
        self.set_status(order_id, OrderStatus::Frozen).await;
    }

    /// Conservation check: settled total and remainder for an order
    pub async fn conservation(&self, order_id: &OrderId) -> Option<(Amount, Amount)> {
        let orders = self.orders.read().await;
        let order = orders.get(order_id)?;
        let settled: Amount = self
            .fills
            .read()
            .await
            .get(order_id)
            .map(|fs| {
                fs.iter()
                    .filter(|f| f.state == FillState::Settled)
                    .map(|f| f.fill_amount)
                    .sum()
            })
            .unwrap_or(0);
        Some((settled, order.remaining_amount))
    }

    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }
}

impl Default for FillLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_order(n: u8, source_amount: Amount, partial: bool, min_fill: Amount) -> Order {
        let now = Utc::now();
        Order {
            order_id: [n; 32],
            maker: "maker".to_string(),
            source_ledger: "alpha".to_string(),
            dest_ledger: "beta".to_string(),
            source_amount,
            min_dest_amount: source_amount / 2,
            deadline: now + Duration::hours(12),
            timelock: now + Duration::hours(24),
            allows_partial_fill: partial,
            min_fill_amount: min_fill,
            master_hashlock: [0; 32],
            status: OrderStatus::Announced,
            remaining_amount: source_amount,
            created_at: now,
        }
    }

    async fn settle(
        ledger: &FillLedger,
        order_id: &OrderId,
        fill_index: u32,
        resolver: &str,
        amount: Amount,
    ) -> CoordinatorResult<(FillId, Option<OrderCompletion>)> {
        let now = Utc::now();
        ledger
            .begin_fill(order_id, fill_index, resolver, amount, [1; 32], now)
            .await?;
        ledger.record_fill(order_id, fill_index, now).await
    }

    #[tokio::test]
    async fn two_partial_fills_complete_the_order() {
        let ledger = FillLedger::new();
        ledger.register_order(test_order(1, 100, true, 10)).await;
        let oid = [1u8; 32];

        let (_, completion) = settle(&ledger, &oid, 0, "resolver-a", 40).await.unwrap();
        assert!(completion.is_none());
        assert_eq!(ledger.conservation(&oid).await.unwrap(), (40, 60));

        let (_, completion) = settle(&ledger, &oid, 1, "resolver-b", 60).await.unwrap();
        let completion = completion.unwrap();
        assert_eq!(completion.total_filled, 100);
        assert_eq!(completion.fill_count, 2);
        assert_eq!(completion.resolvers, vec!["resolver-a", "resolver-b"]);

        let order = ledger.get_order(&oid).await.unwrap();
        assert_eq!(order.status, OrderStatus::FullyFilled);
        assert_eq!(ledger.conservation(&oid).await.unwrap(), (100, 0));

        // Proportional dest amounts sum to at most min_dest_amount
        let fills = ledger.fills_for(&oid).await;
        let dest_total: Amount = fills.iter().map(|f| f.dest_amount).sum();
        assert!(dest_total <= 50);
    }

    #[tokio::test]
    async fn completion_lists_each_resolver_once() {
        let ledger = FillLedger::new();
        ledger.register_order(test_order(1, 100, true, 10)).await;
        let oid = [1u8; 32];

        // resolver-a settles the first and third fills
        settle(&ledger, &oid, 0, "resolver-a", 30).await.unwrap();
        settle(&ledger, &oid, 1, "resolver-b", 30).await.unwrap();
        let (_, completion) = settle(&ledger, &oid, 2, "resolver-a", 40).await.unwrap();

        let completion = completion.unwrap();
        assert_eq!(completion.fill_count, 3);
        assert_eq!(completion.resolvers, vec!["resolver-a", "resolver-b"]);
    }

    #[tokio::test]
    async fn fill_below_minimum_rejected_unless_it_exhausts_the_order() {
        let ledger = FillLedger::new();
        ledger.register_order(test_order(1, 100, true, 10)).await;
        let oid = [1u8; 32];

        let err = settle(&ledger, &oid, 0, "r", 5).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::FillTooSmall { .. }));

        settle(&ledger, &oid, 0, "r", 95).await.unwrap();
        // 5 below the minimum, but it exhausts the remainder
        let (_, completion) = settle(&ledger, &oid, 1, "r", 5).await.unwrap();
        assert!(completion.is_some());
    }

    #[tokio::test]
    async fn fill_exceeding_remaining_rejected() {
        let ledger = FillLedger::new();
        ledger.register_order(test_order(1, 100, true, 10)).await;
        let oid = [1u8; 32];

        settle(&ledger, &oid, 0, "r", 70).await.unwrap();
        let err = settle(&ledger, &oid, 1, "r", 70).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::FillExceedsRemaining { .. }));
        assert_eq!(ledger.conservation(&oid).await.unwrap(), (70, 30));
    }

    #[tokio::test]
    async fn in_flight_fills_reserve_the_remainder() {
        let ledger = FillLedger::new();
        ledger.register_order(test_order(1, 100, true, 10)).await;
        let oid = [1u8; 32];
        let now = Utc::now();

        // Two resolvers race for 70% each; the first reservation wins
        ledger
            .begin_fill(&oid, 0, "resolver-a", 70, [1; 32], now)
            .await
            .unwrap();
        let err = ledger
            .begin_fill(&oid, 1, "resolver-b", 70, [2; 32], now)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::FillExceedsRemaining { .. }));

        // A failed fill releases its reservation
        ledger.mark_fill_failed(&oid, 0).await;
        ledger
            .begin_fill(&oid, 1, "resolver-b", 70, [2; 32], now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn partial_fills_disabled_requires_full_amount() {
        let ledger = FillLedger::new();
        ledger.register_order(test_order(1, 100, false, 0)).await;
        let oid = [1u8; 32];

        let err = settle(&ledger, &oid, 0, "r", 50).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::PartialFillsDisabled { .. }));

        let (_, completion) = settle(&ledger, &oid, 0, "r", 100).await.unwrap();
        assert!(completion.is_some());
    }

    #[tokio::test]
    async fn settlement_replay_is_a_noop() {
        let ledger = FillLedger::new();
        ledger.register_order(test_order(1, 100, true, 10)).await;
        let oid = [1u8; 32];
        let now = Utc::now();

        settle(&ledger, &oid, 0, "r", 40).await.unwrap();
        // Same fill settled again: no double decrement
        ledger.record_fill(&oid, 0, now).await.unwrap();
        assert_eq!(ledger.conservation(&oid).await.unwrap(), (40, 60));
    }

    #[tokio::test]
    async fn registration_replay_is_a_noop() {
        let ledger = FillLedger::new();
        assert!(ledger.register_order(test_order(1, 100, true, 10)).await);
        assert!(!ledger.register_order(test_order(1, 100, true, 10)).await);
        assert_eq!(ledger.order_count().await, 1);
    }

    #[tokio::test]
    async fn cancel_only_before_any_fill() {
        let ledger = FillLedger::new();
        ledger.register_order(test_order(1, 100, true, 10)).await;
        ledger.register_order(test_order(2, 100, true, 10)).await;

        ledger.cancel(&[2u8; 32]).await.unwrap();
        assert_eq!(
            ledger.get_order(&[2u8; 32]).await.unwrap().status,
            OrderStatus::Cancelled
        );

        settle(&ledger, &[1u8; 32], 0, "r", 40).await.unwrap();
        let err = ledger.cancel(&[1u8; 32]).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::CancelAfterFill { .. }));
    }

    #[tokio::test]
    async fn frozen_order_accepts_no_fills() {
        let ledger = FillLedger::new();
        ledger.register_order(test_order(1, 100, true, 10)).await;
        let oid = [1u8; 32];

        ledger.freeze(&oid).await;
        let err = settle(&ledger, &oid, 0, "r", 40).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::OrderFrozen { .. }));
    }

    #[test]
    fn dest_amounts_round_down_in_favor_of_the_maker() {
        // 100 source -> 33 dest; fills of 40 and 60
        assert_eq!(proportional_dest_amount(33, 40, 100), 13);
        assert_eq!(proportional_dest_amount(33, 60, 100), 19);
        assert!(13 + 19 <= 33);

        // Large values do not overflow
        assert_eq!(
            proportional_dest_amount(u64::MAX, u64::MAX, u64::MAX),
            u64::MAX
        );
    }
}
