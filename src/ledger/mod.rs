//! Ledger client interface and multi-ledger event fan-in
//!
//! The coordinator never talks to a ledger directly; everything goes
//! through `LedgerClient`, which exposes idempotent submissions and a
//! cursor-resumable event subscription. Concrete adapters (RPC plumbing,
//! signing) live outside this crate; the in-tree mock is the only
//! simulation mode and exists for tests.

#[cfg(test)]
pub mod mock;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::escrow::{EscrowId, EscrowLeg, Hashlock};
use crate::fill::{Amount, Order, OrderId};
use crate::state::Store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

pub type LedgerId = String;
/// Monotonic position in a ledger's event stream
pub type EventCursor = u64;
/// Opaque reference to a submitted ledger transaction
pub type SubmissionRef = String;

/// Instruction to lock funds on a ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowCreateRequest {
    pub escrow_id: EscrowId,
    pub order_id: OrderId,
    pub fill_index: u32,
    pub leg: EscrowLeg,
    pub hashlock: Hashlock,
    pub timelock: DateTime<Utc>,
    pub amount: Amount,
    pub depositor: String,
    pub recipient: String,
}

/// Events observed on a ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LedgerEvent {
    OrderCreated {
        order: Order,
    },
    EscrowCreated {
        escrow_id: EscrowId,
        order_id: OrderId,
        fill_index: u32,
        leg: EscrowLeg,
        hashlock: Hashlock,
        timelock: DateTime<Utc>,
        amount: Amount,
    },
    /// A claim necessarily reveals the secret
    EscrowClaimed {
        escrow_id: EscrowId,
        order_id: OrderId,
        fill_index: u32,
        leg: EscrowLeg,
        secret: Vec<u8>,
    },
    EscrowRefunded {
        escrow_id: EscrowId,
        order_id: OrderId,
        fill_index: u32,
        leg: EscrowLeg,
    },
}

impl LedgerEvent {
    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::OrderCreated { .. } => "order_created",
            LedgerEvent::EscrowCreated { .. } => "escrow_created",
            LedgerEvent::EscrowClaimed { .. } => "escrow_claimed",
            LedgerEvent::EscrowRefunded { .. } => "escrow_refunded",
        }
    }

    pub fn order_id(&self) -> OrderId {
        match self {
            LedgerEvent::OrderCreated { order } => order.order_id,
            LedgerEvent::EscrowCreated { order_id, .. } => *order_id,
            LedgerEvent::EscrowClaimed { order_id, .. } => *order_id,
            LedgerEvent::EscrowRefunded { order_id, .. } => *order_id,
        }
    }
}

/// An event with its stream position, as delivered to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEventEnvelope {
    pub ledger_id: LedgerId,
    pub cursor: EventCursor,
    pub observed_at: DateTime<Utc>,
    pub event: LedgerEvent,
}

/// One ledger's submission and subscription surface.
///
/// Submissions must be idempotent: resubmitting an already-applied
/// operation is a successful no-op on the ledger side.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    fn ledger_id(&self) -> &str;

    async fn submit_escrow_create(
        &self,
        req: &EscrowCreateRequest,
    ) -> CoordinatorResult<SubmissionRef>;

    async fn submit_claim(
        &self,
        escrow_id: &EscrowId,
        secret: &[u8],
    ) -> CoordinatorResult<SubmissionRef>;

    async fn submit_refund(&self, escrow_id: &EscrowId) -> CoordinatorResult<SubmissionRef>;

    /// Subscribe to events strictly after `from`
    async fn subscribe(
        &self,
        from: EventCursor,
    ) -> CoordinatorResult<mpsc::Receiver<LedgerEventEnvelope>>;

    async fn health_check(&self) -> bool;
}

/// Owns the configured ledger clients and fans their event streams into
/// one broadcast channel
pub struct LedgerManager {
    clients: DashMap<LedgerId, Arc<dyn LedgerClient>>,
    event_tx: broadcast::Sender<LedgerEventEnvelope>,
}

impl LedgerManager {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(10000);
        Self {
            clients: DashMap::new(),
            event_tx,
        }
    }

    pub fn register(&self, client: Arc<dyn LedgerClient>) {
        info!("Registered ledger client: {}", client.ledger_id());
        self.clients.insert(client.ledger_id().to_string(), client);
    }

    pub fn client(&self, ledger_id: &str) -> CoordinatorResult<Arc<dyn LedgerClient>> {
        self.clients
            .get(ledger_id)
            .map(|c| c.clone())
            .ok_or(CoordinatorError::LedgerNotFound {
                ledger_id: ledger_id.to_string(),
            })
    }

    pub fn ledger_ids(&self) -> Vec<LedgerId> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LedgerEventEnvelope> {
        self.event_tx.subscribe()
    }

    /// Start one pump task per ledger: resume the subscription from the
    /// persisted cursor, forward events to the broadcast channel, and
    /// persist the cursor after each event
    pub async fn start_pumps(&self, store: Arc<dyn Store>) -> CoordinatorResult<()> {
        // Snapshot the clients before awaiting; holding a map guard across
        // an await point can deadlock
        let clients: Vec<(LedgerId, Arc<dyn LedgerClient>)> = self
            .clients
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (ledger_id, client) in clients {
            let store = store.clone();
            let event_tx = self.event_tx.clone();

            let cursor = store.get_cursor(&ledger_id).await?;
            info!("Resuming ledger {} from cursor {}", ledger_id, cursor);

            tokio::spawn(async move {
                loop {
                    let from = store.get_cursor(&ledger_id).await.unwrap_or(0);
                    let mut rx = match client.subscribe(from).await {
                        Ok(rx) => rx,
                        Err(e) => {
                            error!("Subscription to {} failed: {}", ledger_id, e);
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                            continue;
                        }
                    };

                    while let Some(envelope) = rx.recv().await {
                        let cursor = envelope.cursor;
                        crate::metrics::record_event(&envelope.ledger_id, envelope.event.name());
                        if event_tx.send(envelope).is_err() {
                            // No receivers, that's okay
                        }
                        if let Err(e) = store.save_cursor(&ledger_id, cursor).await {
                            warn!("Failed to save cursor for {}: {}", ledger_id, e);
                        }
                    }

                    warn!("Event stream for {} closed, resubscribing", ledger_id);
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            });
        }

        Ok(())
    }

    /// Health check for all ledgers
    pub async fn health_check(&self) -> Vec<(LedgerId, bool)> {
        let clients: Vec<(LedgerId, Arc<dyn LedgerClient>)> = self
            .clients
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut results = Vec::with_capacity(clients.len());
        for (ledger_id, client) in clients {
            let healthy = client.health_check().await;
            crate::metrics::record_ledger_health(&ledger_id, healthy);
            results.push((ledger_id, healthy));
        }
        results
    }
}

impl Default for LedgerManager {
    fn default() -> Self {
        Self::new()
    }
}
