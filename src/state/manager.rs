//! PostgreSQL state manager

use super::{Store, StoreStats};
use crate::auction::{Auction, AuctionStatus};
use crate::config::DatabaseConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::escrow::{Escrow, EscrowLeg, EscrowStatus};
use crate::fill::{Fill, Order, OrderId, OrderStatus};
use crate::ledger::EventCursor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// Store implementation backed by PostgreSQL
pub struct PgStateManager {
    pool: PgPool,
}

impl PgStateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> CoordinatorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(CoordinatorError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id BYTEA PRIMARY KEY,
                maker TEXT NOT NULL,
                source_ledger TEXT NOT NULL,
                dest_ledger TEXT NOT NULL,
                source_amount BIGINT NOT NULL,
                min_dest_amount BIGINT NOT NULL,
                deadline TIMESTAMPTZ NOT NULL,
                timelock TIMESTAMPTZ NOT NULL,
                allows_partial_fill BOOLEAN NOT NULL,
                min_fill_amount BIGINT NOT NULL,
                master_hashlock BYTEA NOT NULL,
                status VARCHAR(20) NOT NULL,
                remaining_amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fills (
                order_id BYTEA NOT NULL,
                fill_index INT NOT NULL,
                resolver TEXT NOT NULL,
                fill_amount BIGINT NOT NULL,
                dest_amount BIGINT NOT NULL,
                hashlock BYTEA NOT NULL,
                state VARCHAR(20) NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (order_id, fill_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS escrows (
                escrow_id BYTEA PRIMARY KEY,
                order_id BYTEA NOT NULL,
                fill_index INT NOT NULL,
                leg VARCHAR(12) NOT NULL,
                ledger_id TEXT NOT NULL,
                hashlock BYTEA NOT NULL,
                timelock TIMESTAMPTZ NOT NULL,
                amount BIGINT NOT NULL,
                status VARCHAR(10) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                settled_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_escrows_order
            ON escrows (order_id, fill_index)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS auctions (
                auction_id BYTEA PRIMARY KEY,
                order_id BYTEA NOT NULL,
                fill_index INT NOT NULL,
                amount BIGINT NOT NULL,
                start_price BIGINT NOT NULL,
                floor_price BIGINT NOT NULL,
                decay_per_second BIGINT NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ NOT NULL,
                status VARCHAR(10) NOT NULL,
                bids JSONB NOT NULL DEFAULT '[]',
                round INT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_cursors (
                ledger_id TEXT PRIMARY KEY,
                cursor_position BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn order_status_from_str(s: &str) -> OrderStatus {
    match s {
        "auctioning" => OrderStatus::Auctioning,
        "filling" => OrderStatus::Filling,
        "fully_filled" => OrderStatus::FullyFilled,
        "cancelled" => OrderStatus::Cancelled,
        "expired" => OrderStatus::Expired,
        "frozen" => OrderStatus::Frozen,
        _ => OrderStatus::Announced,
    }
}

fn fill_state_from_str(s: &str) -> crate::fill::FillState {
    use crate::fill::FillState;
    match s {
        "source_escrowed" => FillState::SourceEscrowed,
        "pair_escrowed" => FillState::PairEscrowed,
        "settled" => FillState::Settled,
        "failed" => FillState::Failed,
        _ => FillState::Pending,
    }
}

fn bytes32(row_bytes: Vec<u8>) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&row_bytes[..32]);
    out
}

#[async_trait]
impl Store for PgStateManager {
    async fn save_order(&self, order: &Order) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders
                (order_id, maker, source_ledger, dest_ledger, source_amount,
                 min_dest_amount, deadline, timelock, allows_partial_fill,
                 min_fill_amount, master_hashlock, status, remaining_amount,
                 created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (order_id)
            DO UPDATE SET status = $12, remaining_amount = $13, updated_at = NOW()
            "#,
        )
        .bind(&order.order_id[..])
        .bind(&order.maker)
        .bind(&order.source_ledger)
        .bind(&order.dest_ledger)
        .bind(order.source_amount as i64)
        .bind(order.min_dest_amount as i64)
        .bind(order.deadline)
        .bind(order.timelock)
        .bind(order.allows_partial_fill)
        .bind(order.min_fill_amount as i64)
        .bind(&order.master_hashlock[..])
        .bind(order.status.as_str())
        .bind(order.remaining_amount as i64)
        .bind(order.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_fill(&self, fill: &Fill) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fills
                (order_id, fill_index, resolver, fill_amount, dest_amount,
                 hashlock, state, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (order_id, fill_index)
            DO UPDATE SET state = $7, recorded_at = $8
            "#,
        )
        .bind(&fill.order_id[..])
        .bind(fill.fill_index as i32)
        .bind(&fill.resolver)
        .bind(fill.fill_amount as i64)
        .bind(fill.dest_amount as i64)
        .bind(&fill.hashlock[..])
        .bind(fill.state.as_str())
        .bind(fill.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_escrow(&self, escrow: &Escrow) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO escrows
                (escrow_id, order_id, fill_index, leg, ledger_id, hashlock,
                 timelock, amount, status, created_at, settled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (escrow_id)
            DO UPDATE SET status = $9, settled_at = $11
            "#,
        )
        .bind(&escrow.escrow_id[..])
        .bind(&escrow.order_id[..])
        .bind(escrow.fill_index as i32)
        .bind(escrow.leg.as_str())
        .bind(&escrow.ledger_id)
        .bind(&escrow.hashlock[..])
        .bind(escrow.timelock)
        .bind(escrow.amount as i64)
        .bind(escrow.status.as_str())
        .bind(escrow.created_at)
        .bind(escrow.settled_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_auction(&self, auction: &Auction) -> CoordinatorResult<()> {
        let bids = serde_json::to_value(&auction.bids)
            .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO auctions
                (auction_id, order_id, fill_index, amount, start_price,
                 floor_price, decay_per_second, start_time, end_time, status,
                 bids, round)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (auction_id)
            DO UPDATE SET status = $10, bids = $11
            "#,
        )
        .bind(&auction.auction_id[..])
        .bind(&auction.order_id[..])
        .bind(auction.fill_index as i32)
        .bind(auction.amount as i64)
        .bind(auction.start_price as i64)
        .bind(auction.floor_price as i64)
        .bind(auction.decay_per_second as i64)
        .bind(auction.start_time)
        .bind(auction.end_time)
        .bind(auction.status.as_str())
        .bind(bids)
        .bind(auction.round as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn apply_fill_settlement(&self, order: &Order, fill: &Fill) -> CoordinatorResult<bool> {
        let mut tx = self.pool.begin().await?;

        // Conditional decrement: the WHERE guard makes check-then-decrement
        // one atomic operation, so concurrent settlements cannot over-fill.
        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET remaining_amount = remaining_amount - $1, updated_at = NOW()
            WHERE order_id = $2 AND remaining_amount >= $1
            "#,
        )
        .bind(fill.fill_amount as i64)
        .bind(&order.order_id[..])
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO fills
                (order_id, fill_index, resolver, fill_amount, dest_amount,
                 hashlock, state, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'settled', $7)
            ON CONFLICT (order_id, fill_index)
            DO UPDATE SET state = 'settled', recorded_at = $7
            "#,
        )
        .bind(&fill.order_id[..])
        .bind(fill.fill_index as i32)
        .bind(&fill.resolver)
        .bind(fill.fill_amount as i64)
        .bind(fill.dest_amount as i64)
        .bind(&fill.hashlock[..])
        .bind(fill.recorded_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            "Settled fill {} of order {} for {}",
            fill.fill_index,
            hex::encode(fill.order_id),
            fill.fill_amount
        );
        Ok(true)
    }

    async fn load_open_orders(&self) -> CoordinatorResult<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, maker, source_ledger, dest_ledger, source_amount,
                   min_dest_amount, deadline, timelock, allows_partial_fill,
                   min_fill_amount, master_hashlock, status, remaining_amount,
                   created_at
            FROM orders
            WHERE status NOT IN ('fully_filled', 'cancelled', 'expired')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let orders = rows
            .into_iter()
            .map(|row| Order {
                order_id: bytes32(row.get("order_id")),
                maker: row.get("maker"),
                source_ledger: row.get("source_ledger"),
                dest_ledger: row.get("dest_ledger"),
                source_amount: row.get::<i64, _>("source_amount") as u64,
                min_dest_amount: row.get::<i64, _>("min_dest_amount") as u64,
                deadline: row.get::<DateTime<Utc>, _>("deadline"),
                timelock: row.get::<DateTime<Utc>, _>("timelock"),
                allows_partial_fill: row.get("allows_partial_fill"),
                min_fill_amount: row.get::<i64, _>("min_fill_amount") as u64,
                master_hashlock: bytes32(row.get("master_hashlock")),
                status: order_status_from_str(row.get::<String, _>("status").as_str()),
                remaining_amount: row.get::<i64, _>("remaining_amount") as u64,
                created_at: row.get::<DateTime<Utc>, _>("created_at"),
            })
            .collect();

        Ok(orders)
    }

    async fn load_fills(&self, order_id: &OrderId) -> CoordinatorResult<Vec<Fill>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, fill_index, resolver, fill_amount, dest_amount,
                   hashlock, state, recorded_at
            FROM fills
            WHERE order_id = $1
            ORDER BY fill_index
            "#,
        )
        .bind(&order_id[..])
        .fetch_all(&self.pool)
        .await?;

        let fills = rows
            .into_iter()
            .map(|row| Fill {
                order_id: bytes32(row.get("order_id")),
                fill_index: row.get::<i32, _>("fill_index") as u32,
                resolver: row.get("resolver"),
                fill_amount: row.get::<i64, _>("fill_amount") as u64,
                dest_amount: row.get::<i64, _>("dest_amount") as u64,
                hashlock: bytes32(row.get("hashlock")),
                state: fill_state_from_str(row.get::<String, _>("state").as_str()),
                recorded_at: row.get::<DateTime<Utc>, _>("recorded_at"),
            })
            .collect();

        Ok(fills)
    }

    async fn load_open_escrows(&self) -> CoordinatorResult<Vec<Escrow>> {
        let rows = sqlx::query(
            r#"
            SELECT escrow_id, order_id, fill_index, leg, ledger_id, hashlock,
                   timelock, amount, created_at
            FROM escrows
            WHERE status = 'open'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let escrows = rows
            .into_iter()
            .map(|row| Escrow {
                escrow_id: bytes32(row.get("escrow_id")),
                order_id: bytes32(row.get("order_id")),
                fill_index: row.get::<i32, _>("fill_index") as u32,
                leg: if row.get::<String, _>("leg") == "destination" {
                    EscrowLeg::Destination
                } else {
                    EscrowLeg::Source
                },
                ledger_id: row.get("ledger_id"),
                hashlock: bytes32(row.get("hashlock")),
                timelock: row.get::<DateTime<Utc>, _>("timelock"),
                amount: row.get::<i64, _>("amount") as u64,
                status: EscrowStatus::Open,
                created_at: row.get::<DateTime<Utc>, _>("created_at"),
                settled_at: None,
                revealed_secret: None,
            })
            .collect();

        Ok(escrows)
    }

    async fn load_auctions(&self) -> CoordinatorResult<Vec<Auction>> {
        let rows = sqlx::query(
            r#"
            SELECT auction_id, order_id, fill_index, amount, start_price,
                   floor_price, decay_per_second, start_time, end_time, bids,
                   round
            FROM auctions
            WHERE status = 'open'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let bids: serde_json::Value = row.get("bids");
                let bids = serde_json::from_value(bids)
                    .map_err(|e| CoordinatorError::Internal(e.to_string()))?;
                Ok(Auction {
                    auction_id: bytes32(row.get("auction_id")),
                    order_id: bytes32(row.get("order_id")),
                    fill_index: row.get::<i32, _>("fill_index") as u32,
                    amount: row.get::<i64, _>("amount") as u64,
                    start_price: row.get::<i64, _>("start_price") as u64,
                    floor_price: row.get::<i64, _>("floor_price") as u64,
                    decay_per_second: row.get::<i64, _>("decay_per_second") as u64,
                    start_time: row.get::<DateTime<Utc>, _>("start_time"),
                    end_time: row.get::<DateTime<Utc>, _>("end_time"),
                    bids,
                    status: AuctionStatus::Open,
                    round: row.get::<i32, _>("round") as u32,
                })
            })
            .collect()
    }

    async fn get_cursor(&self, ledger_id: &str) -> CoordinatorResult<EventCursor> {
        let row = sqlx::query("SELECT cursor_position FROM ledger_cursors WHERE ledger_id = $1")
            .bind(ledger_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|r| r.get::<i64, _>("cursor_position") as u64)
            .unwrap_or(0))
    }

    async fn save_cursor(&self, ledger_id: &str, cursor: EventCursor) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_cursors (ledger_id, cursor_position, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (ledger_id)
            DO UPDATE SET cursor_position = $2, updated_at = NOW()
            "#,
        )
        .bind(ledger_id)
        .bind(cursor as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;
        Ok(())
    }

    async fn stats(&self) -> CoordinatorResult<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM orders
                 WHERE status IN ('announced', 'auctioning', 'filling')) AS orders_open,
                (SELECT COUNT(*) FROM orders WHERE status = 'fully_filled') AS orders_filled,
                (SELECT COUNT(*) FROM orders WHERE status = 'expired') AS orders_expired,
                (SELECT COUNT(*) FROM fills WHERE state = 'settled') AS fills_settled,
                (SELECT COUNT(*) FROM fills WHERE state = 'failed') AS fills_failed
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            orders_open: row.get::<i64, _>("orders_open") as u64,
            orders_filled: row.get::<i64, _>("orders_filled") as u64,
            orders_expired: row.get::<i64, _>("orders_expired") as u64,
            fills_settled: row.get::<i64, _>("fills_settled") as u64,
            fills_failed: row.get::<i64, _>("fills_failed") as u64,
        })
    }
}
