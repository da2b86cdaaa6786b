//! The swap coordination engine
//!
//! One engine instance drives every order through its lifecycle:
//! registration, Dutch auction, escrow pair construction, secret release,
//! settlement, and refund. All mutations for a given order are serialized
//! through a per-order lock, so event handling needs no global ordering
//! beyond what each ledger stream already provides. Handlers are
//! idempotent against replayed events; the stream cursor may rewind after
//! a crash and nothing double-settles.

use crate::auction::{Auction, AuctionBook, AuctionId, AuctionParams, AuctionStatus, BidResult};
use crate::config::{CoordinatorConfig, Settings};
use crate::coordinator::backoff::Backoff;
use crate::coordinator::CoordinatorNotice;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::escrow::{
    escrow_id_for, hashlock_of, EscrowBook, EscrowId, EscrowLeg, EscrowStatus, Hashlock,
    TimelockBounds,
};
use crate::fill::{Amount, Fill, FillLedger, FillState, Order, OrderId, OrderStatus};
use crate::ledger::{
    EscrowCreateRequest, LedgerClient, LedgerEvent, LedgerEventEnvelope, LedgerManager,
};
use crate::state::Store;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Settled escrows are kept around this long for the status API
const SETTLED_RETENTION: i64 = 24;

/// A maker's request to open an order, as accepted by the API
#[derive(Debug, Clone, Deserialize)]
pub struct OrderIntent {
    pub maker: String,
    pub source_ledger: String,
    pub dest_ledger: String,
    pub source_amount: Amount,
    pub min_dest_amount: Amount,
    pub deadline: DateTime<Utc>,
    pub timelock: DateTime<Utc>,
    pub allows_partial_fill: bool,
    pub min_fill_amount: Amount,
}

/// Order snapshot for the status API
#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    pub order: Order,
    pub fills: Vec<Fill>,
    pub auction: Option<Auction>,
}

/// Per-fill secrets are derived from the order's master secret, so each
/// fill claims with a preimage that was never observable before its own
/// escrow pair existed.
fn derive_fill_secret(master: &[u8; 32], fill_index: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(master);
    hasher.update(fill_index.to_be_bytes());
    hasher.finalize().into()
}

pub struct SwapCoordinator {
    config: CoordinatorConfig,
    auction_defaults: AuctionParams,
    ledgers: Arc<LedgerManager>,
    store: Arc<dyn Store>,
    escrows: EscrowBook,
    auctions: AuctionBook,
    fills: FillLedger,
    /// Master secrets live in memory only. After a restart the custody of
    /// unsettled fills is forfeited and those escrows unwind via refund.
    master_secrets: DashMap<OrderId, [u8; 32]>,
    order_locks: DashMap<OrderId, Arc<Mutex<()>>>,
    /// Escrows with a refund already submitted this lifetime, so sweeps
    /// do not resubmit while the event is still in flight
    refunds_inflight: DashMap<EscrowId, ()>,
    notice_tx: broadcast::Sender<CoordinatorNotice>,
    shutdown: RwLock<bool>,
}

impl SwapCoordinator {
    pub fn new(settings: &Settings, ledgers: Arc<LedgerManager>, store: Arc<dyn Store>) -> Self {
        let (notice_tx, _) = broadcast::channel(1000);
        Self {
            config: settings.coordinator.clone(),
            auction_defaults: AuctionParams {
                start_price: settings.auction.start_price,
                floor_price: settings.auction.floor_price,
                decay_per_second: settings.auction.decay_per_second,
                duration: Duration::seconds(settings.auction.duration_secs as i64),
            },
            ledgers,
            store,
            escrows: EscrowBook::new(TimelockBounds::from_secs(
                settings.escrow.min_timelock_secs,
                settings.escrow.max_timelock_secs,
            )),
            auctions: AuctionBook::new(),
            fills: FillLedger::new(),
            master_secrets: DashMap::new(),
            order_locks: DashMap::new(),
            refunds_inflight: DashMap::new(),
            notice_tx,
            shutdown: RwLock::new(false),
        }
    }

    /// Reload open orders, fills, escrows, and live auction rounds from
    /// the store after a restart. Master secrets are not recoverable, so
    /// fills that were mid-flight unwind via the refund path; orders left
    /// between fills go back on auction.
    pub async fn restore(&self, now: DateTime<Utc>) -> CoordinatorResult<()> {
        let orders = self.store.load_open_orders().await?;
        let mut order_ids = Vec::with_capacity(orders.len());
        for order in orders {
            let order_id = order.order_id;
            self.fills.register_order(order).await;
            for fill in self.store.load_fills(&order_id).await? {
                self.fills.restore_fill(fill).await;
            }
            order_ids.push(order_id);
        }

        // Open escrows must be visible to the refund sweep
        for escrow in self.store.load_open_escrows().await? {
            self.escrows.restore(escrow).await;
        }
        for auction in self.store.load_auctions().await? {
            self.auctions.restore(auction).await;
        }

        // An order between fills needs an auction to make progress again
        for order_id in &order_ids {
            let order = match self.fills.get_order(order_id).await {
                Some(order) => order,
                None => continue,
            };
            if !matches!(
                order.status,
                OrderStatus::Announced | OrderStatus::Auctioning
            ) {
                continue;
            }
            let live = self
                .auctions
                .latest_for_order(order_id)
                .await
                .map(|a| a.status == AuctionStatus::Open)
                .unwrap_or(false);
            if !live {
                if let Err(e) = self.open_auction(order_id, now).await {
                    warn!(
                        "Could not reopen auction for order {}: {}",
                        hex::encode(order_id),
                        e
                    );
                }
            }
        }

        if !order_ids.is_empty() {
            info!("Restored {} open orders from store", order_ids.len());
        }
        Ok(())
    }

    /// Main loop: consume the fanned-in ledger event stream and run
    /// periodic sweeps until shutdown
    pub async fn run(self: Arc<Self>) {
        let mut events = self.ledgers.subscribe_events();
        let mut sweep = tokio::time::interval(std::time::Duration::from_secs(
            self.config.sweep_interval_secs,
        ));

        info!("Swap coordinator {} started", self.config.instance_id);

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                event = events.recv() => match event {
                    Ok(envelope) => {
                        if let Err(e) = self.handle_envelope(&envelope, Utc::now()).await {
                            if e.should_alert() {
                                error!("Event handling failed: {}", e);
                            } else {
                                warn!("Event handling failed: {}", e);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event stream lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = sweep.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }

        info!("Swap coordinator stopped");
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<CoordinatorNotice> {
        self.notice_tx.subscribe()
    }

    /// Apply one observed ledger event. All handlers are replay-safe.
    pub async fn handle_envelope(
        &self,
        envelope: &LedgerEventEnvelope,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<()> {
        let lock = self.order_lock(&envelope.event.order_id());
        let _guard = lock.lock().await;

        match &envelope.event {
            LedgerEvent::OrderCreated { order } => {
                self.handle_order_created(order.clone(), now).await
            }
            LedgerEvent::EscrowCreated {
                escrow_id,
                order_id,
                fill_index,
                leg,
                hashlock,
                timelock,
                amount,
            } => {
                self.handle_escrow_created(
                    &envelope.ledger_id,
                    *escrow_id,
                    *order_id,
                    *fill_index,
                    *leg,
                    *hashlock,
                    *timelock,
                    *amount,
                    now,
                )
                .await
            }
            LedgerEvent::EscrowClaimed {
                escrow_id,
                order_id,
                fill_index,
                leg,
                secret,
            } => {
                self.handle_escrow_claimed(*escrow_id, *order_id, *fill_index, *leg, secret, now)
                    .await
            }
            LedgerEvent::EscrowRefunded {
                escrow_id,
                order_id,
                fill_index,
                leg,
            } => {
                self.handle_escrow_refunded(*escrow_id, *order_id, *fill_index, *leg, now)
                    .await
            }
        }
    }

    /// Open a new order through the API. The coordinator mints the master
    /// secret here and acts as its custodian for the order's lifetime.
    pub async fn submit_order(
        &self,
        intent: OrderIntent,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<OrderId> {
        // Both ledgers must be configured before funds can move
        self.ledgers.client(&intent.source_ledger)?;
        self.ledgers.client(&intent.dest_ledger)?;

        if intent.source_amount == 0 {
            return Err(CoordinatorError::InvalidAmount { amount: 0 });
        }
        if intent.min_dest_amount == 0 {
            return Err(CoordinatorError::InvalidAmount { amount: 0 });
        }

        let bounds = self.escrows.bounds();
        if intent.timelock < now + bounds.min || intent.timelock > now + bounds.max {
            return Err(CoordinatorError::InvalidTimelock {
                message: format!(
                    "timelock {} outside [{}, {}]",
                    intent.timelock,
                    now + bounds.min,
                    now + bounds.max
                ),
            });
        }
        if intent.deadline <= now || intent.deadline > intent.timelock {
            return Err(CoordinatorError::InvalidTimelock {
                message: format!(
                    "deadline {} must fall after {} and at or before the timelock {}",
                    intent.deadline, now, intent.timelock
                ),
            });
        }

        let mut master = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut master);

        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let mut hasher = Sha256::new();
        hasher.update(b"order");
        hasher.update(intent.maker.as_bytes());
        hasher.update(intent.source_ledger.as_bytes());
        hasher.update(intent.dest_ledger.as_bytes());
        hasher.update(nonce);
        let order_id: OrderId = hasher.finalize().into();

        let order = Order {
            order_id,
            maker: intent.maker,
            source_ledger: intent.source_ledger,
            dest_ledger: intent.dest_ledger,
            source_amount: intent.source_amount,
            min_dest_amount: intent.min_dest_amount,
            deadline: intent.deadline,
            timelock: intent.timelock,
            allows_partial_fill: intent.allows_partial_fill,
            min_fill_amount: intent.min_fill_amount,
            master_hashlock: hashlock_of(&master),
            status: OrderStatus::Announced,
            remaining_amount: intent.source_amount,
            created_at: now,
        };

        self.master_secrets.insert(order_id, master);

        let lock = self.order_lock(&order_id);
        let _guard = lock.lock().await;
        self.handle_order_created(order, now).await?;

        Ok(order_id)
    }

    /// Cancel an order that has seen no fills. Once anything is in flight
    /// the only way out is the deadline.
    pub async fn cancel_order(&self, order_id: &OrderId) -> CoordinatorResult<()> {
        let lock = self.order_lock(order_id);
        let _guard = lock.lock().await;

        self.fills.cancel(order_id).await?;
        if let Some(order) = self.fills.get_order(order_id).await {
            self.store.save_order(&order).await?;
        }
        self.master_secrets.remove(order_id);
        crate::metrics::record_order_cancelled();
        info!("Order {} cancelled", hex::encode(order_id));
        Ok(())
    }

    pub async fn order_status(&self, order_id: &OrderId) -> CoordinatorResult<OrderView> {
        let order = self
            .fills
            .get_order(order_id)
            .await
            .ok_or(CoordinatorError::OrderNotFound {
                order_id: hex::encode(order_id),
            })?;
        let fills = self.fills.fills_for(order_id).await;
        let auction = self.auctions.latest_for_order(order_id).await;
        Ok(OrderView {
            order,
            fills,
            auction,
        })
    }

    /// Submit a resolver's bid. A winning bid immediately opens the fill
    /// and submits the source escrow.
    pub async fn place_bid(
        &self,
        auction_id: &AuctionId,
        resolver: &str,
        price: Amount,
        fill_amount: Amount,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<BidResult> {
        let auction = self
            .auctions
            .get(auction_id)
            .await
            .ok_or(CoordinatorError::AuctionNotFound {
                auction_id: hex::encode(auction_id),
            })?;

        let lock = self.order_lock(&auction.order_id);
        let _guard = lock.lock().await;

        // Re-read under the lock; the auction may have been won or expired
        // while we waited. Its state comes first so a late bidder sees the
        // auction outcome, not a fill-accounting error.
        let auction = self
            .auctions
            .get(auction_id)
            .await
            .ok_or(CoordinatorError::AuctionNotFound {
                auction_id: hex::encode(auction_id),
            })?;
        match auction.status {
            AuctionStatus::Filled => {
                return Err(CoordinatorError::AuctionFilled {
                    auction_id: hex::encode(auction_id),
                })
            }
            AuctionStatus::Expired => {
                return Err(CoordinatorError::AuctionExpired {
                    auction_id: hex::encode(auction_id),
                    end_time: auction.end_time.to_rfc3339(),
                })
            }
            AuctionStatus::Open => {}
        }

        // Validate the amount before touching the auction, so a losing
        // amount never claims the opportunity
        self.fills
            .validate_fill_amount(&auction.order_id, fill_amount)
            .await?;

        let result = self
            .auctions
            .place_bid(auction_id, resolver, price, fill_amount, now)
            .await?;

        match &result {
            BidResult::Won {
                price, fill_amount, ..
            } => {
                crate::metrics::record_bid("won");
                info!(
                    "Resolver {} won auction {} at price {} for {} units",
                    resolver,
                    hex::encode(auction_id),
                    price,
                    fill_amount
                );
                self.start_fill(
                    &auction.order_id,
                    auction.fill_index,
                    resolver,
                    *fill_amount,
                    now,
                )
                .await?;
            }
            BidResult::Lost { current_price } => {
                crate::metrics::record_bid("lost");
                debug!(
                    "Resolver {} bid {} above current price {} on auction {}",
                    resolver,
                    price,
                    current_price,
                    hex::encode(auction_id)
                );
            }
        }

        if let Some(auction) = self.auctions.get(auction_id).await {
            self.store.save_auction(&auction).await?;
        }

        Ok(result)
    }

    /// Periodic maintenance: expire bidless auctions, refund expired
    /// escrows, expire orders past their deadline, prune settled state
    pub async fn sweep(&self, now: DateTime<Utc>) {
        for auction in self.auctions.expire_due(now).await {
            crate::metrics::record_auction_expired();
            let lock = self.order_lock(&auction.order_id);
            let _guard = lock.lock().await;

            if let Some(order) = self.fills.get_order(&auction.order_id).await {
                if order.status == OrderStatus::Auctioning {
                    // No resolver took it; the order waits out its deadline
                    info!(
                        "Auction {} expired with no winner, order {} back to announced",
                        hex::encode(auction.auction_id),
                        hex::encode(auction.order_id)
                    );
                    self.fills
                        .set_status(&auction.order_id, OrderStatus::Announced)
                        .await;
                    if let Some(order) = self.fills.get_order(&auction.order_id).await {
                        if let Err(e) = self.store.save_order(&order).await {
                            warn!("Failed to persist order: {}", e);
                        }
                    }
                }
            }
            if let Some(auction) = self.auctions.get(&auction.auction_id).await {
                if let Err(e) = self.store.save_auction(&auction).await {
                    warn!("Failed to persist auction: {}", e);
                }
            }
        }

        // Skip one sweep after each submission so the refund event can
        // land, then try again: submissions are idempotent, so a lost
        // event costs one sweep interval, not the refund
        for escrow in self.escrows.open_expired(now).await {
            if self.refunds_inflight.insert(escrow.escrow_id, ()).is_some() {
                self.refunds_inflight.remove(&escrow.escrow_id);
                continue;
            }
            let result = match self.ledgers.client(&escrow.ledger_id) {
                Ok(client) => client.submit_refund(&escrow.escrow_id).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => {
                    crate::metrics::record_refund_submitted();
                    info!(
                        "Refund submitted for expired escrow {} on {}",
                        hex::encode(escrow.escrow_id),
                        escrow.ledger_id
                    );
                }
                Err(e) => {
                    warn!(
                        "Refund submission for {} failed: {}",
                        hex::encode(escrow.escrow_id),
                        e
                    );
                    self.refunds_inflight.remove(&escrow.escrow_id);
                }
            }
        }

        for order_id in self.fills.expirable_orders(now).await {
            let lock = self.order_lock(&order_id);
            let _guard = lock.lock().await;

            self.fills.set_status(&order_id, OrderStatus::Expired).await;
            if let Some(order) = self.fills.get_order(&order_id).await {
                if let Err(e) = self.store.save_order(&order).await {
                    warn!("Failed to persist order: {}", e);
                }
            }
            self.master_secrets.remove(&order_id);
            crate::metrics::record_order_expired();
            info!("Order {} expired past its deadline", hex::encode(order_id));
            let _ = self
                .notice_tx
                .send(CoordinatorNotice::OrderExpired { order_id });
        }

        self.escrows
            .prune_settled(now, Duration::hours(SETTLED_RETENTION))
            .await;

        // Entries for escrows that settled or were pruned have no refund
        // left to suppress
        let inflight: Vec<EscrowId> =
            self.refunds_inflight.iter().map(|e| *e.key()).collect();
        for escrow_id in inflight {
            let open = self
                .escrows
                .get(&escrow_id)
                .await
                .map(|e| e.is_open())
                .unwrap_or(false);
            if !open {
                self.refunds_inflight.remove(&escrow_id);
            }
        }

        crate::metrics::set_open_escrows(self.escrows.open_count().await);
    }

    async fn handle_order_created(
        &self,
        order: Order,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<()> {
        let order_id = order.order_id;
        let source_ledger = order.source_ledger.clone();
        let dest_ledger = order.dest_ledger.clone();

        if !self.fills.register_order(order).await {
            debug!("Replay of known order {}", hex::encode(order_id));
            return Ok(());
        }

        self.ensure_master_secret(&order_id);
        crate::metrics::record_order_registered(&source_ledger, &dest_ledger);
        info!(
            "Order {} registered ({} -> {})",
            hex::encode(order_id),
            source_ledger,
            dest_ledger
        );

        if let Some(order) = self.fills.get_order(&order_id).await {
            self.store.save_order(&order).await?;
        }

        self.open_auction(&order_id, now).await
    }

    /// Start (or resume) the auction for the next fill opportunity
    async fn open_auction(&self, order_id: &OrderId, now: DateTime<Utc>) -> CoordinatorResult<()> {
        let order = self
            .fills
            .get_order(order_id)
            .await
            .ok_or(CoordinatorError::OrderNotFound {
                order_id: hex::encode(order_id),
            })?;

        if order.status.is_terminal() || order.status == OrderStatus::Frozen {
            return Ok(());
        }
        if now >= order.deadline || order.remaining_amount == 0 {
            return Ok(());
        }

        let fill_index = self.fills.next_fill_index(order_id).await;
        let auction_id = self
            .auctions
            .start(
                *order_id,
                fill_index,
                order.remaining_amount,
                self.auction_defaults,
                now,
            )
            .await?;

        self.fills.set_status(order_id, OrderStatus::Auctioning).await;
        if let Some(auction) = self.auctions.get(&auction_id).await {
            self.store.save_auction(&auction).await?;
        }
        crate::metrics::record_auction_opened();
        info!(
            "Auction {} open for order {} fill {} ({} units on offer)",
            hex::encode(auction_id),
            hex::encode(order_id),
            fill_index,
            order.remaining_amount
        );

        Ok(())
    }

    /// An auction was won: open the fill and lock the maker's funds on
    /// the source ledger
    async fn start_fill(
        &self,
        order_id: &OrderId,
        fill_index: u32,
        resolver: &str,
        fill_amount: Amount,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<()> {
        let order = self
            .fills
            .get_order(order_id)
            .await
            .ok_or(CoordinatorError::OrderNotFound {
                order_id: hex::encode(order_id),
            })?;

        // A restored order has no master secret; mint a fresh one here so
        // new fills stay claimable. Fills hashlocked under the old master
        // are unrecoverable and unwind via refund.
        self.ensure_master_secret(order_id);
        let master = self
            .master_secrets
            .get(order_id)
            .map(|s| *s)
            .ok_or_else(|| {
                CoordinatorError::Internal(format!(
                    "no master secret for order {}",
                    hex::encode(order_id)
                ))
            })?;
        let hashlock = hashlock_of(&derive_fill_secret(&master, fill_index));

        self.fills
            .begin_fill(order_id, fill_index, resolver, fill_amount, hashlock, now)
            .await?;
        if let Some(fill) = self.fills.get_fill(order_id, fill_index).await {
            self.store.save_fill(&fill).await?;
        }
        self.fills.set_status(order_id, OrderStatus::Filling).await;

        let request = EscrowCreateRequest {
            escrow_id: escrow_id_for(order_id, fill_index, EscrowLeg::Source),
            order_id: *order_id,
            fill_index,
            leg: EscrowLeg::Source,
            hashlock,
            timelock: order.timelock,
            amount: fill_amount,
            depositor: order.maker.clone(),
            recipient: resolver.to_string(),
        };
        let client = self.ledgers.client(&order.source_ledger)?;

        match self
            .submit_with_retry("escrow_create", || client.submit_escrow_create(&request))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(
                    "Source escrow creation failed for order {} fill {}: {}",
                    hex::encode(order_id),
                    fill_index,
                    e
                );
                self.fail_fill(order_id, fill_index).await;
                // The opportunity goes back to auction under a new index
                self.open_auction(order_id, now).await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_escrow_created(
        &self,
        ledger_id: &str,
        escrow_id: EscrowId,
        order_id: OrderId,
        fill_index: u32,
        leg: EscrowLeg,
        hashlock: Hashlock,
        timelock: DateTime<Utc>,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<()> {
        match self
            .escrows
            .create(
                order_id, fill_index, leg, ledger_id, hashlock, timelock, amount, now,
            )
            .await
        {
            Ok(_) => {}
            Err(CoordinatorError::DuplicateEscrow { .. }) => {
                debug!(
                    "Replay of escrow creation for order {} fill {} {}",
                    hex::encode(order_id),
                    fill_index,
                    leg.as_str()
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if let Some(escrow) = self.escrows.get(&escrow_id).await {
            self.store.save_escrow(&escrow).await?;
        }
        crate::metrics::record_escrow_created(leg.as_str());
        info!(
            "Escrow {} confirmed on {} for order {} fill {} ({} leg)",
            hex::encode(escrow_id),
            ledger_id,
            hex::encode(order_id),
            fill_index,
            leg.as_str()
        );

        match leg {
            EscrowLeg::Source => {
                self.fills
                    .set_fill_state(&order_id, fill_index, FillState::SourceEscrowed)
                    .await?;
                self.create_mirror_escrow(&order_id, fill_index, timelock, now)
                    .await
            }
            EscrowLeg::Destination => {
                self.fills
                    .set_fill_state(&order_id, fill_index, FillState::PairEscrowed)
                    .await?;
                self.claim_destination(&order_id, fill_index, escrow_id, now)
                    .await
            }
        }
    }

    /// The source leg stands: lock the resolver's funds on the destination
    /// ledger, with a timelock shortened by the safety margin
    async fn create_mirror_escrow(
        &self,
        order_id: &OrderId,
        fill_index: u32,
        source_timelock: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<()> {
        let order = self
            .fills
            .get_order(order_id)
            .await
            .ok_or(CoordinatorError::OrderNotFound {
                order_id: hex::encode(order_id),
            })?;
        let fill = self
            .fills
            .get_fill(order_id, fill_index)
            .await
            .ok_or(CoordinatorError::OrderNotFound {
                order_id: hex::encode(order_id),
            })?;

        let dest_timelock =
            source_timelock - Duration::seconds(self.config.safety_margin_secs as i64);
        if dest_timelock <= now || dest_timelock - now < self.escrows.bounds().min {
            // Not enough claim window left on the destination leg; the
            // source escrow unwinds via the refund sweep at its timelock
            self.fail_fill(order_id, fill_index).await;
            return Err(CoordinatorError::TimelockOrderingViolation {
                source_timelock: source_timelock.to_rfc3339(),
                dest_timelock: dest_timelock.to_rfc3339(),
            });
        }

        let request = EscrowCreateRequest {
            escrow_id: escrow_id_for(order_id, fill_index, EscrowLeg::Destination),
            order_id: *order_id,
            fill_index,
            leg: EscrowLeg::Destination,
            hashlock: fill.hashlock,
            timelock: dest_timelock,
            amount: fill.dest_amount,
            depositor: fill.resolver.clone(),
            recipient: order.maker.clone(),
        };
        let client = self.ledgers.client(&order.dest_ledger)?;

        match self
            .submit_with_retry("escrow_create", || client.submit_escrow_create(&request))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(
                    "Mirror escrow creation failed for order {} fill {}: {}",
                    hex::encode(order_id),
                    fill_index,
                    e
                );
                self.fail_fill(order_id, fill_index).await;
                // One eager refund attempt; the source timelock has almost
                // certainly not passed, so the sweep is the real unwind path
                let source_id = escrow_id_for(order_id, fill_index, EscrowLeg::Source);
                if let Ok(source_client) = self.ledgers.client(&order.source_ledger) {
                    if let Err(refund_err) = source_client.submit_refund(&source_id).await {
                        debug!(
                            "Eager refund of {} declined: {}",
                            hex::encode(source_id),
                            refund_err
                        );
                    }
                }
                // The remainder re-auctions now
                self.open_auction(order_id, now).await?;
                Err(CoordinatorError::MirrorCreationFailed {
                    order_id: hex::encode(order_id),
                    fill_index,
                })
            }
        }
    }

    /// Both escrows stand: disclose the fill secret and claim the
    /// destination leg for the maker. The destination leg goes first
    /// because its claim window closes first.
    async fn claim_destination(
        &self,
        order_id: &OrderId,
        fill_index: u32,
        dest_escrow_id: EscrowId,
        _now: DateTime<Utc>,
    ) -> CoordinatorResult<()> {
        let order = self
            .fills
            .get_order(order_id)
            .await
            .ok_or(CoordinatorError::OrderNotFound {
                order_id: hex::encode(order_id),
            })?;
        let fill = self
            .fills
            .get_fill(order_id, fill_index)
            .await
            .ok_or(CoordinatorError::OrderNotFound {
                order_id: hex::encode(order_id),
            })?;

        let master = match self.master_secrets.get(order_id).map(|s| *s) {
            Some(master) => master,
            None => {
                // Custody was lost across a restart; both legs unwind via
                // the refund sweep
                warn!(
                    "No master secret for order {} fill {}, leaving escrows to refund",
                    hex::encode(order_id),
                    fill_index
                );
                return Ok(());
            }
        };
        let secret = derive_fill_secret(&master, fill_index);
        if hashlock_of(&secret) != fill.hashlock {
            // The master in memory is not the one this fill's hashlock was
            // derived from, so no claimable preimage exists
            warn!(
                "Secret for order {} fill {} is not recoverable, leaving escrows to refund",
                hex::encode(order_id),
                fill_index
            );
            return Ok(());
        }

        let _ = self.notice_tx.send(CoordinatorNotice::SecretDisclosed {
            order_id: *order_id,
            fill_index,
            resolver: fill.resolver.clone(),
            secret: secret.to_vec(),
        });

        let client = self.ledgers.client(&order.dest_ledger)?;
        match self
            .submit_with_retry("claim", || client.submit_claim(&dest_escrow_id, &secret))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(
                    "Destination claim failed for order {} fill {}: {}",
                    hex::encode(order_id),
                    fill_index,
                    e
                );
                crate::metrics::record_claim_propagation_failure();
                Err(CoordinatorError::ClaimPropagationFailed {
                    order_id: hex::encode(order_id),
                    fill_index,
                })
            }
        }
    }

    /// A claim on one leg reveals the secret; propagate it to the other
    /// leg, and settle the fill once both legs are claimed
    async fn handle_escrow_claimed(
        &self,
        escrow_id: EscrowId,
        order_id: OrderId,
        fill_index: u32,
        leg: EscrowLeg,
        secret: &[u8],
        now: DateTime<Utc>,
    ) -> CoordinatorResult<()> {
        match self.escrows.claim(&escrow_id, secret, now).await {
            Ok(()) => {}
            Err(CoordinatorError::AlreadySettled { .. }) => {
                debug!("Replay of claim on {}", hex::encode(escrow_id));
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if let Some(escrow) = self.escrows.get(&escrow_id).await {
            self.store.save_escrow(&escrow).await?;
        }
        crate::metrics::record_escrow_claimed(leg.as_str());
        info!(
            "Escrow {} claimed ({} leg of order {} fill {})",
            hex::encode(escrow_id),
            leg.as_str(),
            hex::encode(order_id),
            fill_index
        );

        let (source, dest) = self.escrows.find_pair(&order_id, fill_index).await;

        let counterpart = match leg.counterpart() {
            EscrowLeg::Source => source.clone(),
            EscrowLeg::Destination => dest.clone(),
        };
        if let Some(other) = counterpart {
            if other.is_open() {
                let client = self.ledgers.client(&other.ledger_id)?;
                let other_id = other.escrow_id;
                let started = std::time::Instant::now();
                match self
                    .submit_with_retry("claim", || client.submit_claim(&other_id, secret))
                    .await
                {
                    Ok(_) => {
                        crate::metrics::record_claim_propagation_latency(
                            started.elapsed().as_secs_f64(),
                        );
                    }
                    Err(e) => {
                        error!(
                            "Claim propagation to {} failed for order {} fill {}: {}",
                            other.ledger_id,
                            hex::encode(order_id),
                            fill_index,
                            e
                        );
                        crate::metrics::record_claim_propagation_failure();
                        return Err(CoordinatorError::ClaimPropagationFailed {
                            order_id: hex::encode(order_id),
                            fill_index,
                        });
                    }
                }
                // Settlement happens when the counterpart's claim event
                // comes back around
                return Ok(());
            }
        }

        let both_claimed = matches!(
            (&source, &dest),
            (Some(s), Some(d))
                if (s.status == EscrowStatus::Claimed || s.escrow_id == escrow_id)
                    && (d.status == EscrowStatus::Claimed || d.escrow_id == escrow_id)
        );
        if both_claimed {
            self.settle_fill(&order_id, fill_index, now).await?;
        }

        Ok(())
    }

    /// Both legs claimed: record the fill against the order's remainder,
    /// durably and in memory
    async fn settle_fill(
        &self,
        order_id: &OrderId,
        fill_index: u32,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<()> {
        let (_, completion) = self.fills.record_fill(order_id, fill_index, now).await?;

        let order = self
            .fills
            .get_order(order_id)
            .await
            .ok_or(CoordinatorError::OrderNotFound {
                order_id: hex::encode(order_id),
            })?;
        let fill = self
            .fills
            .get_fill(order_id, fill_index)
            .await
            .ok_or(CoordinatorError::OrderNotFound {
                order_id: hex::encode(order_id),
            })?;

        if !self.store.apply_fill_settlement(&order, &fill).await? {
            // The durable remainder guard disagrees with the in-memory
            // books; stop this order until someone reconciles it
            self.fills.freeze(order_id).await;
            if let Some(order) = self.fills.get_order(order_id).await {
                self.store.save_order(&order).await?;
            }
            return Err(CoordinatorError::InvariantBreach {
                order_id: hex::encode(order_id),
                message: "durable remainder guard rejected settlement".to_string(),
            });
        }

        self.store.save_fill(&fill).await?;
        self.store.save_order(&order).await?;
        crate::metrics::record_fill_settled(fill.fill_amount);
        info!(
            "Fill {} of order {} settled: {} units by {}, {} remaining",
            fill_index,
            hex::encode(order_id),
            fill.fill_amount,
            fill.resolver,
            order.remaining_amount
        );

        let _ = self.notice_tx.send(CoordinatorNotice::FillRecorded {
            order_id: *order_id,
            fill_index,
            resolver: fill.resolver.clone(),
            fill_amount: fill.fill_amount,
            dest_amount: fill.dest_amount,
        });

        match completion {
            Some(completion) => {
                crate::metrics::record_order_completed();
                self.master_secrets.remove(order_id);
                let _ = self
                    .notice_tx
                    .send(CoordinatorNotice::OrderCompleted(completion));
                Ok(())
            }
            // The remainder goes back to auction
            None => self.open_auction(order_id, now).await,
        }
    }

    async fn handle_escrow_refunded(
        &self,
        escrow_id: EscrowId,
        order_id: OrderId,
        fill_index: u32,
        leg: EscrowLeg,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<()> {
        let escrow = match self.escrows.get(&escrow_id).await {
            Some(escrow) => escrow,
            None => {
                debug!("Refund event for unknown escrow {}", hex::encode(escrow_id));
                return Ok(());
            }
        };

        // The ledger is authoritative; mirror the refund even if the local
        // clock has not reached the timelock yet
        let effective = now.max(escrow.timelock);
        match self.escrows.refund(&escrow_id, effective).await {
            Ok(()) => {}
            Err(CoordinatorError::AlreadySettled { .. }) => {
                debug!("Replay of refund on {}", hex::encode(escrow_id));
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if let Some(escrow) = self.escrows.get(&escrow_id).await {
            self.store.save_escrow(&escrow).await?;
        }
        self.refunds_inflight.remove(&escrow_id);
        crate::metrics::record_escrow_refunded(leg.as_str());
        info!(
            "Escrow {} refunded ({} leg of order {} fill {})",
            hex::encode(escrow_id),
            leg.as_str(),
            hex::encode(order_id),
            fill_index
        );

        self.fail_fill(&order_id, fill_index).await;
        let _ = self.notice_tx.send(CoordinatorNotice::FillRefunded {
            order_id,
            fill_index,
            leg,
        });

        // A refunded leg ends this fill; the remainder can re-auction if
        // the order is still live
        self.open_auction(&order_id, now).await
    }

    async fn fail_fill(&self, order_id: &OrderId, fill_index: u32) {
        self.fills.mark_fill_failed(order_id, fill_index).await;
        if let Some(fill) = self.fills.get_fill(order_id, fill_index).await {
            if fill.state == FillState::Failed {
                crate::metrics::record_fill_failed();
                if let Err(e) = self.store.save_fill(&fill).await {
                    warn!("Failed to persist fill: {}", e);
                }
            }
        }
    }

    #[cfg(test)]
    fn refunds_pending(&self) -> usize {
        self.refunds_inflight.len()
    }

    fn ensure_master_secret(&self, order_id: &OrderId) {
        self.master_secrets.entry(*order_id).or_insert_with(|| {
            let mut secret = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            secret
        });
    }

    fn order_lock(&self, order_id: &OrderId) -> Arc<Mutex<()>> {
        self.order_locks
            .entry(*order_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Retry a ledger submission with exponential backoff. Only transient
    /// errors are retried; protocol rejections surface immediately.
    async fn submit_with_retry<T, F, Fut>(&self, operation: &str, mut submit: F) -> CoordinatorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = CoordinatorResult<T>>,
    {
        let mut backoff = Backoff::from_config(&self.config);
        loop {
            match submit().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "{} failed (attempt {}): {}, retrying in {:?}",
                            operation,
                            backoff.attempts_made(),
                            e,
                            delay
                        );
                        crate::metrics::record_retry(operation);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::mock::MockLedger;
    use crate::state::memory::MemoryStore;
    use tokio::sync::mpsc;

    fn test_settings() -> Settings {
        let toml_str = r#"
            [coordinator]
            instance_id = "test"
            safety_margin_secs = 300
            sweep_interval_secs = 1
            max_retries = 3
            retry_base_delay_ms = 1
            retry_max_delay_ms = 5
            health_check_interval_secs = 30

            [database]
            url = "postgres://unused"
            max_connections = 1
            min_connections = 1

            [api]
            host = "127.0.0.1"
            port = 0

            [metrics]
            enabled = false
            port = 0

            [auction]
            start_price = 1000
            floor_price = 100
            decay_per_second = 10
            duration_secs = 300

            [escrow]
            min_timelock_secs = 3600
            max_timelock_secs = 172800

            [ledgers.alpha]
            name = "alpha"
            endpoint = "mock://alpha"
            enabled = true

            [ledgers.beta]
            name = "beta"
            endpoint = "mock://beta"
            enabled = true
        "#;
        toml::from_str(toml_str).unwrap()
    }

    struct Harness {
        coordinator: Arc<SwapCoordinator>,
        ledgers: Arc<LedgerManager>,
        store: Arc<MemoryStore>,
        alpha: Arc<MockLedger>,
        beta: Arc<MockLedger>,
        alpha_rx: mpsc::Receiver<LedgerEventEnvelope>,
        beta_rx: mpsc::Receiver<LedgerEventEnvelope>,
    }

    impl Harness {
        async fn new() -> Self {
            let ledgers = Arc::new(LedgerManager::new());
            let alpha = Arc::new(MockLedger::new("alpha"));
            let beta = Arc::new(MockLedger::new("beta"));
            ledgers.register(alpha.clone());
            ledgers.register(beta.clone());

            let store = Arc::new(MemoryStore::new());
            let coordinator = Arc::new(SwapCoordinator::new(
                &test_settings(),
                ledgers.clone(),
                store.clone(),
            ));

            let alpha_rx = alpha.subscribe(0).await.unwrap();
            let beta_rx = beta.subscribe(0).await.unwrap();

            Self {
                coordinator,
                ledgers,
                store,
                alpha,
                beta,
                alpha_rx,
                beta_rx,
            }
        }

        /// Deliver every pending ledger event to the coordinator, looping
        /// until both streams drain (handlers submit follow-up transactions
        /// that produce more events)
        async fn pump(&mut self, now: DateTime<Utc>) -> Vec<CoordinatorError> {
            let mut errors = Vec::new();
            loop {
                let mut progressed = false;
                while let Ok(envelope) = self.alpha_rx.try_recv() {
                    progressed = true;
                    if let Err(e) = self.coordinator.handle_envelope(&envelope, now).await {
                        errors.push(e);
                    }
                }
                while let Ok(envelope) = self.beta_rx.try_recv() {
                    progressed = true;
                    if let Err(e) = self.coordinator.handle_envelope(&envelope, now).await {
                        errors.push(e);
                    }
                }
                if !progressed {
                    break;
                }
            }
            errors
        }

        fn order(
            &self,
            n: u8,
            amount: Amount,
            partial: bool,
            min_fill: Amount,
            now: DateTime<Utc>,
        ) -> Order {
            Order {
                order_id: [n; 32],
                maker: "maker".to_string(),
                source_ledger: "alpha".to_string(),
                dest_ledger: "beta".to_string(),
                source_amount: amount,
                min_dest_amount: amount / 2,
                deadline: now + Duration::hours(2),
                timelock: now + Duration::hours(2),
                allows_partial_fill: partial,
                min_fill_amount: min_fill,
                master_hashlock: [0; 32],
                status: OrderStatus::Announced,
                remaining_amount: amount,
                created_at: now,
            }
        }
    }

    #[test]
    fn fill_secrets_are_distinct_per_index() {
        let master = [7u8; 32];
        let s0 = derive_fill_secret(&master, 0);
        let s1 = derive_fill_secret(&master, 1);
        assert_ne!(s0, s1);
        assert_ne!(hashlock_of(&s0), hashlock_of(&s1));
    }

    #[tokio::test]
    async fn full_fill_settles_both_legs() {
        let mut h = Harness::new().await;
        let now = Utc::now();
        let order = h.order(1, 100, false, 0, now);
        let order_id = order.order_id;

        h.alpha.inject_order(order).await;
        assert!(h.pump(now).await.is_empty());

        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.order.status, OrderStatus::Auctioning);
        let auction = view.auction.unwrap();

        let bid_time = now + Duration::seconds(5);
        let result = h
            .coordinator
            .place_bid(&auction.auction_id, "resolver-a", 900, 100, bid_time)
            .await
            .unwrap();
        assert!(matches!(result, BidResult::Won { price: 900, .. }));

        assert!(h.pump(bid_time).await.is_empty());

        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.order.status, OrderStatus::FullyFilled);
        assert_eq!(view.order.remaining_amount, 0);
        assert_eq!(view.fills.len(), 1);
        assert_eq!(view.fills[0].state, FillState::Settled);
        assert_eq!(view.fills[0].dest_amount, 50);

        let source_id = escrow_id_for(&order_id, 0, EscrowLeg::Source);
        let dest_id = escrow_id_for(&order_id, 0, EscrowLeg::Destination);
        assert_eq!(h.alpha.escrow_status(&source_id).await, Some("claimed"));
        assert_eq!(h.beta.escrow_status(&dest_id).await, Some("claimed"));
    }

    #[tokio::test]
    async fn partial_fills_reauction_until_complete() {
        let mut h = Harness::new().await;
        let now = Utc::now();
        let order = h.order(2, 100, true, 10, now);
        let order_id = order.order_id;
        let mut notices = h.coordinator.subscribe_notices();

        h.alpha.inject_order(order).await;
        h.pump(now).await;

        let auction = h
            .coordinator
            .order_status(&order_id)
            .await
            .unwrap()
            .auction
            .unwrap();
        let t1 = now + Duration::seconds(90);
        let result = h
            .coordinator
            .place_bid(&auction.auction_id, "resolver-a", 100, 40, t1)
            .await
            .unwrap();
        assert!(matches!(result, BidResult::Won { fill_amount: 40, .. }));
        assert!(h.pump(t1).await.is_empty());

        // First fill settled, remainder re-auctioned
        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.order.remaining_amount, 60);
        assert_eq!(view.order.status, OrderStatus::Auctioning);
        let auction = view.auction.unwrap();
        assert_eq!(auction.fill_index, 1);
        assert_eq!(auction.amount, 60);

        let t2 = t1 + Duration::seconds(60);
        h.coordinator
            .place_bid(&auction.auction_id, "resolver-b", 100, 60, t2)
            .await
            .unwrap();
        assert!(h.pump(t2).await.is_empty());

        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.order.status, OrderStatus::FullyFilled);
        assert_eq!(view.order.remaining_amount, 0);

        // Delivered destination amounts never exceed the committed minimum
        let dest_total: Amount = view.fills.iter().map(|f| f.dest_amount).sum();
        assert!(dest_total <= 50);

        let mut recorded = 0;
        let mut completed = false;
        while let Ok(notice) = notices.try_recv() {
            match notice {
                CoordinatorNotice::FillRecorded { .. } => recorded += 1,
                CoordinatorNotice::OrderCompleted(completion) => {
                    assert_eq!(completion.fill_count, 2);
                    assert_eq!(completion.total_filled, 100);
                    completed = true;
                }
                _ => {}
            }
        }
        assert_eq!(recorded, 2);
        assert!(completed);
    }

    #[tokio::test]
    async fn mirror_failure_fails_the_fill_and_reauctions() {
        let mut h = Harness::new().await;
        let now = Utc::now();
        let order = h.order(3, 100, true, 10, now);
        let order_id = order.order_id;

        h.alpha.inject_order(order).await;
        h.pump(now).await;

        h.beta.fail_all(true).await;
        let auction = h
            .coordinator
            .order_status(&order_id)
            .await
            .unwrap()
            .auction
            .unwrap();
        let t1 = now + Duration::seconds(90);
        h.coordinator
            .place_bid(&auction.auction_id, "resolver-a", 100, 40, t1)
            .await
            .unwrap();

        let errors = h.pump(t1).await;
        assert!(errors
            .iter()
            .any(|e| matches!(e, CoordinatorError::MirrorCreationFailed { .. })));

        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.fills[0].state, FillState::Failed);
        // Nothing settled, so the remainder is untouched
        assert_eq!(view.order.remaining_amount, 100);
        // The opportunity is back on auction under the next index
        let auction = view.auction.unwrap();
        assert_eq!(auction.fill_index, 1);

        // Destination recovers and a second resolver takes the order
        h.beta.fail_all(false).await;
        let t2 = t1 + Duration::seconds(30);
        h.coordinator
            .place_bid(&auction.auction_id, "resolver-b", 100, 100, t2)
            .await
            .unwrap();
        assert!(h.pump(t2).await.is_empty());

        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.order.status, OrderStatus::FullyFilled);
    }

    #[tokio::test]
    async fn transient_submission_failures_are_retried() {
        let mut h = Harness::new().await;
        let now = Utc::now();
        let order = h.order(4, 100, false, 0, now);
        let order_id = order.order_id;

        h.alpha.inject_order(order).await;
        h.pump(now).await;

        // Two transient failures fit inside max_retries = 3
        h.beta.fail_next(2).await;
        let auction = h
            .coordinator
            .order_status(&order_id)
            .await
            .unwrap()
            .auction
            .unwrap();
        let t1 = now + Duration::seconds(90);
        h.coordinator
            .place_bid(&auction.auction_id, "resolver-a", 100, 100, t1)
            .await
            .unwrap();
        assert!(h.pump(t1).await.is_empty());

        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.order.status, OrderStatus::FullyFilled);
    }

    #[tokio::test]
    async fn expired_source_escrow_is_refunded_by_the_sweep() {
        let mut h = Harness::new().await;
        let now = Utc::now();
        let order = h.order(5, 100, true, 10, now);
        let order_id = order.order_id;

        h.alpha.inject_order(order).await;
        h.pump(now).await;

        // Mirror creation fails for good: the source escrow is stranded
        h.beta.fail_all(true).await;
        let auction = h
            .coordinator
            .order_status(&order_id)
            .await
            .unwrap()
            .auction
            .unwrap();
        let t1 = now + Duration::seconds(90);
        h.coordinator
            .place_bid(&auction.auction_id, "resolver-a", 100, 40, t1)
            .await
            .unwrap();
        h.pump(t1).await;

        let source_id = escrow_id_for(&order_id, 0, EscrowLeg::Source);
        assert_eq!(h.alpha.escrow_status(&source_id).await, Some("open"));

        // Past the source timelock the sweep submits the refund
        let after_expiry = now + Duration::hours(2) + Duration::seconds(1);
        h.alpha.set_now(after_expiry).await;
        h.coordinator.sweep(after_expiry).await;
        h.pump(after_expiry).await;

        assert_eq!(h.alpha.escrow_status(&source_id).await, Some("refunded"));
        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.fills[0].state, FillState::Failed);
    }

    #[tokio::test]
    async fn replayed_events_change_nothing() {
        let mut h = Harness::new().await;
        let now = Utc::now();
        let order = h.order(6, 100, false, 0, now);
        let order_id = order.order_id;

        h.alpha.inject_order(order).await;
        h.pump(now).await;
        let auction = h
            .coordinator
            .order_status(&order_id)
            .await
            .unwrap()
            .auction
            .unwrap();
        let t1 = now + Duration::seconds(5);
        h.coordinator
            .place_bid(&auction.auction_id, "resolver-a", 900, 100, t1)
            .await
            .unwrap();
        assert!(h.pump(t1).await.is_empty());

        // Replay the entire history of both ledgers, as a cursor rewind
        // after a crash would
        for envelope in h.alpha.event_log().await {
            h.coordinator.handle_envelope(&envelope, t1).await.unwrap();
        }
        for envelope in h.beta.event_log().await {
            h.coordinator.handle_envelope(&envelope, t1).await.unwrap();
        }
        assert!(h.pump(t1).await.is_empty());

        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.order.status, OrderStatus::FullyFilled);
        assert_eq!(view.order.remaining_amount, 0);
        assert_eq!(view.fills.len(), 1);
    }

    #[tokio::test]
    async fn bidless_auction_expires_and_order_waits_for_its_deadline() {
        let mut h = Harness::new().await;
        let now = Utc::now();
        let order = h.order(7, 100, true, 10, now);
        let order_id = order.order_id;
        let mut notices = h.coordinator.subscribe_notices();

        h.alpha.inject_order(order).await;
        h.pump(now).await;

        // Auction runs out with no bids
        let after_auction = now + Duration::seconds(400);
        h.coordinator.sweep(after_auction).await;
        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.order.status, OrderStatus::Announced);
        assert_eq!(view.auction.unwrap().status, crate::auction::AuctionStatus::Expired);

        // Past the deadline the order expires
        let after_deadline = now + Duration::hours(3);
        h.coordinator.sweep(after_deadline).await;
        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.order.status, OrderStatus::Expired);

        let mut expired = false;
        while let Ok(notice) = notices.try_recv() {
            if matches!(notice, CoordinatorNotice::OrderExpired { order_id: oid } if oid == order_id)
            {
                expired = true;
            }
        }
        assert!(expired);
    }

    #[tokio::test]
    async fn api_submitted_orders_validate_and_auction() {
        let h = Harness::new().await;
        let now = Utc::now();

        let intent = OrderIntent {
            maker: "maker".to_string(),
            source_ledger: "alpha".to_string(),
            dest_ledger: "beta".to_string(),
            source_amount: 100,
            min_dest_amount: 50,
            deadline: now + Duration::hours(2),
            timelock: now + Duration::hours(2),
            allows_partial_fill: true,
            min_fill_amount: 10,
        };
        let order_id = h.coordinator.submit_order(intent.clone(), now).await.unwrap();

        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.order.status, OrderStatus::Auctioning);
        assert_eq!(view.order.master_hashlock.len(), 32);

        // Unknown ledger rejected
        let mut bad = intent.clone();
        bad.dest_ledger = "gamma".to_string();
        let err = h.coordinator.submit_order(bad, now).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::LedgerNotFound { .. }));

        // Timelock below the minimum bound rejected
        let mut bad = intent.clone();
        bad.timelock = now + Duration::minutes(30);
        let err = h.coordinator.submit_order(bad, now).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidTimelock { .. }));

        // A fresh order with no fills can be cancelled
        let order_id = h.coordinator.submit_order(intent, now).await.unwrap();
        h.coordinator.cancel_order(&order_id).await.unwrap();
        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.order.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn restored_coordinator_refunds_pre_crash_escrows() {
        let mut h = Harness::new().await;
        let now = Utc::now();
        let order = h.order(8, 100, true, 10, now);
        let order_id = order.order_id;

        h.alpha.inject_order(order).await;
        h.pump(now).await;

        // Mirror creation fails, stranding the source escrow
        h.beta.fail_all(true).await;
        let auction = h
            .coordinator
            .order_status(&order_id)
            .await
            .unwrap()
            .auction
            .unwrap();
        let t1 = now + Duration::seconds(90);
        h.coordinator
            .place_bid(&auction.auction_id, "resolver-a", 100, 40, t1)
            .await
            .unwrap();
        h.pump(t1).await;

        let source_id = escrow_id_for(&order_id, 0, EscrowLeg::Source);
        assert_eq!(h.alpha.escrow_status(&source_id).await, Some("open"));

        // A second instance comes up on the same store and ledgers
        let restored = Arc::new(SwapCoordinator::new(
            &test_settings(),
            h.ledgers.clone(),
            h.store.clone(),
        ));
        restored.restore(t1).await.unwrap();

        let view = restored.order_status(&order_id).await.unwrap();
        assert_eq!(view.order.remaining_amount, 100);
        let auction = view.auction.unwrap();
        assert_eq!(auction.fill_index, 1);
        assert_eq!(auction.status, AuctionStatus::Open);

        // The reloaded escrow is swept once its timelock passes
        let after = now + Duration::hours(2) + Duration::seconds(1);
        h.alpha.set_now(after).await;
        restored.sweep(after).await;
        while let Ok(envelope) = h.alpha_rx.try_recv() {
            restored.handle_envelope(&envelope, after).await.unwrap();
        }

        assert_eq!(h.alpha.escrow_status(&source_id).await, Some("refunded"));
    }

    #[tokio::test]
    async fn restart_without_the_master_secret_leaves_the_pair_to_refund() {
        let mut h = Harness::new().await;
        let now = Utc::now();
        let order = h.order(9, 100, false, 0, now);
        let order_id = order.order_id;

        h.alpha.inject_order(order).await;
        h.pump(now).await;
        let auction = h
            .coordinator
            .order_status(&order_id)
            .await
            .unwrap()
            .auction
            .unwrap();
        let t1 = now + Duration::seconds(5);
        h.coordinator
            .place_bid(&auction.auction_id, "resolver-a", 900, 100, t1)
            .await
            .unwrap();

        // Deliver the source leg only, so the mirror is submitted but its
        // confirmation is still in flight at the crash
        while let Ok(envelope) = h.alpha_rx.try_recv() {
            h.coordinator.handle_envelope(&envelope, t1).await.unwrap();
        }

        let restored = Arc::new(SwapCoordinator::new(
            &test_settings(),
            h.ledgers.clone(),
            h.store.clone(),
        ));
        restored.restore(t1).await.unwrap();

        // The restarted instance sees the mirror confirmation but holds no
        // master secret, so it must not attempt a claim
        while let Ok(envelope) = h.beta_rx.try_recv() {
            restored.handle_envelope(&envelope, t1).await.unwrap();
        }

        let source_id = escrow_id_for(&order_id, 0, EscrowLeg::Source);
        let dest_id = escrow_id_for(&order_id, 0, EscrowLeg::Destination);
        assert_eq!(h.alpha.escrow_status(&source_id).await, Some("open"));
        assert_eq!(h.beta.escrow_status(&dest_id).await, Some("open"));
    }

    #[tokio::test]
    async fn refund_is_retried_when_the_event_goes_missing() {
        let mut h = Harness::new().await;
        let now = Utc::now();
        let order = h.order(10, 100, true, 10, now);
        let order_id = order.order_id;

        h.alpha.inject_order(order).await;
        h.pump(now).await;

        h.beta.fail_all(true).await;
        let auction = h
            .coordinator
            .order_status(&order_id)
            .await
            .unwrap()
            .auction
            .unwrap();
        let t1 = now + Duration::seconds(90);
        h.coordinator
            .place_bid(&auction.auction_id, "resolver-a", 100, 40, t1)
            .await
            .unwrap();
        h.pump(t1).await;

        let after = now + Duration::hours(2) + Duration::seconds(1);
        h.alpha.set_now(after).await;
        h.coordinator.sweep(after).await;
        assert_eq!(h.coordinator.refunds_pending(), 1);

        // The refund confirmation never arrives
        while h.alpha_rx.try_recv().is_ok() {}

        // One grace sweep, then the next sweep resubmits
        h.coordinator.sweep(after).await;
        assert_eq!(h.coordinator.refunds_pending(), 0);
        h.coordinator.sweep(after).await;
        assert_eq!(h.coordinator.refunds_pending(), 1);
    }

    #[tokio::test]
    async fn bids_after_a_win_report_the_auction_outcome() {
        let mut h = Harness::new().await;
        let now = Utc::now();
        let order = h.order(11, 100, false, 0, now);
        let order_id = order.order_id;

        h.alpha.inject_order(order).await;
        h.pump(now).await;
        let auction = h
            .coordinator
            .order_status(&order_id)
            .await
            .unwrap()
            .auction
            .unwrap();
        let t1 = now + Duration::seconds(5);
        h.coordinator
            .place_bid(&auction.auction_id, "resolver-a", 900, 100, t1)
            .await
            .unwrap();
        assert!(h.pump(t1).await.is_empty());

        // The auction is decided; a late full-amount bid must be told so
        // rather than tripping over the fill accounting
        let err = h
            .coordinator
            .place_bid(&auction.auction_id, "resolver-b", 900, 100, t1)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::AuctionFilled { .. }));
    }

    #[tokio::test]
    async fn mirror_with_too_short_a_claim_window_is_rejected() {
        let mut h = Harness::new().await;
        let now = Utc::now();
        // Just over the minimum timelock: after the safety margin is taken
        // off, the destination leg's window falls below the minimum
        let mut order = h.order(12, 100, false, 0, now);
        order.timelock = now + Duration::seconds(3700);
        order.deadline = order.timelock;
        let order_id = order.order_id;

        h.alpha.inject_order(order).await;
        h.pump(now).await;
        let auction = h
            .coordinator
            .order_status(&order_id)
            .await
            .unwrap()
            .auction
            .unwrap();
        let t1 = now + Duration::seconds(90);
        h.coordinator
            .place_bid(&auction.auction_id, "resolver-a", 100, 100, t1)
            .await
            .unwrap();

        let errors = h.pump(t1).await;
        assert!(errors
            .iter()
            .any(|e| matches!(e, CoordinatorError::TimelockOrderingViolation { .. })));

        let view = h.coordinator.order_status(&order_id).await.unwrap();
        assert_eq!(view.fills[0].state, FillState::Failed);
        // The destination leg was never submitted
        let dest_id = escrow_id_for(&order_id, 0, EscrowLeg::Destination);
        assert_eq!(h.beta.escrow_status(&dest_id).await, None);
    }
}
