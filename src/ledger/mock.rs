//! In-process ledger test double
//!
//! Applies submissions to its own escrow table and echoes the resulting
//! events, the way a real ledger adapter would observe them. Supports
//! injected submission failures for retry tests and a time override so
//! timelock behavior can be driven without waiting.

use super::{
    EscrowCreateRequest, EventCursor, LedgerClient, LedgerEvent, LedgerEventEnvelope,
    SubmissionRef,
};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::escrow::{hashlock_of, EscrowId, EscrowLeg, Hashlock};
use crate::fill::{Amount, Order, OrderId};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq)]
enum MockEscrowStatus {
    Open,
    Claimed,
    Refunded,
}

#[derive(Debug, Clone)]
struct MockEscrow {
    order_id: OrderId,
    fill_index: u32,
    leg: EscrowLeg,
    hashlock: Hashlock,
    timelock: DateTime<Utc>,
    #[allow(dead_code)]
    amount: Amount,
    status: MockEscrowStatus,
}

struct Inner {
    cursor: EventCursor,
    escrows: HashMap<EscrowId, MockEscrow>,
    log: Vec<LedgerEventEnvelope>,
    subscribers: Vec<mpsc::Sender<LedgerEventEnvelope>>,
    fail_next: u32,
    fail_all: bool,
    now_override: Option<DateTime<Utc>>,
}

pub struct MockLedger {
    ledger_id: String,
    inner: Mutex<Inner>,
}

impl MockLedger {
    pub fn new(ledger_id: &str) -> Self {
        Self {
            ledger_id: ledger_id.to_string(),
            inner: Mutex::new(Inner {
                cursor: 0,
                escrows: HashMap::new(),
                log: Vec::new(),
                subscribers: Vec::new(),
                fail_next: 0,
                fail_all: false,
                now_override: None,
            }),
        }
    }

    /// Fail the next `n` submissions with a retryable error
    pub async fn fail_next(&self, n: u32) {
        self.inner.lock().await.fail_next = n;
    }

    /// Fail every submission until cleared
    pub async fn fail_all(&self, fail: bool) {
        self.inner.lock().await.fail_all = fail;
    }

    /// Pin the ledger's notion of "now" for timelock checks
    pub async fn set_now(&self, now: DateTime<Utc>) {
        self.inner.lock().await.now_override = Some(now);
    }

    /// Announce an order on this ledger, as its maker would
    pub async fn inject_order(&self, order: Order) {
        let mut inner = self.inner.lock().await;
        let event = LedgerEvent::OrderCreated { order };
        Self::emit(&self.ledger_id, &mut inner, event);
    }

    pub async fn escrow_status(&self, escrow_id: &EscrowId) -> Option<&'static str> {
        self.inner
            .lock()
            .await
            .escrows
            .get(escrow_id)
            .map(|e| match e.status {
                MockEscrowStatus::Open => "open",
                MockEscrowStatus::Claimed => "claimed",
                MockEscrowStatus::Refunded => "refunded",
            })
    }

    pub async fn event_log(&self) -> Vec<LedgerEventEnvelope> {
        self.inner.lock().await.log.clone()
    }

    fn emit(ledger_id: &str, inner: &mut Inner, event: LedgerEvent) {
        inner.cursor += 1;
        let envelope = LedgerEventEnvelope {
            ledger_id: ledger_id.to_string(),
            cursor: inner.cursor,
            observed_at: Utc::now(),
            event,
        };
        inner.log.push(envelope.clone());
        inner
            .subscribers
            .retain(|tx| tx.try_send(envelope.clone()).is_ok());
    }

    fn check_failure(inner: &mut Inner, ledger_id: &str) -> CoordinatorResult<()> {
        if inner.fail_all {
            return Err(CoordinatorError::Submission {
                ledger_id: ledger_id.to_string(),
                message: "injected failure".to_string(),
            });
        }
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(CoordinatorError::Submission {
                ledger_id: ledger_id.to_string(),
                message: "injected transient failure".to_string(),
            });
        }
        Ok(())
    }

    fn now(inner: &Inner) -> DateTime<Utc> {
        inner.now_override.unwrap_or_else(Utc::now)
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    fn ledger_id(&self) -> &str {
        &self.ledger_id
    }

    async fn submit_escrow_create(
        &self,
        req: &EscrowCreateRequest,
    ) -> CoordinatorResult<SubmissionRef> {
        let mut inner = self.inner.lock().await;
        Self::check_failure(&mut inner, &self.ledger_id)?;

        // Idempotent: resubmission of an existing escrow is a no-op
        if inner.escrows.contains_key(&req.escrow_id) {
            return Ok(format!("mock-create-{}", hex::encode(&req.escrow_id[..8])));
        }

        inner.escrows.insert(
            req.escrow_id,
            MockEscrow {
                order_id: req.order_id,
                fill_index: req.fill_index,
                leg: req.leg,
                hashlock: req.hashlock,
                timelock: req.timelock,
                amount: req.amount,
                status: MockEscrowStatus::Open,
            },
        );

        let event = LedgerEvent::EscrowCreated {
            escrow_id: req.escrow_id,
            order_id: req.order_id,
            fill_index: req.fill_index,
            leg: req.leg,
            hashlock: req.hashlock,
            timelock: req.timelock,
            amount: req.amount,
        };
        Self::emit(&self.ledger_id, &mut inner, event);

        Ok(format!("mock-create-{}", hex::encode(&req.escrow_id[..8])))
    }

    async fn submit_claim(
        &self,
        escrow_id: &EscrowId,
        secret: &[u8],
    ) -> CoordinatorResult<SubmissionRef> {
        let mut inner = self.inner.lock().await;
        Self::check_failure(&mut inner, &self.ledger_id)?;

        let now = Self::now(&inner);
        let escrow = inner
            .escrows
            .get(escrow_id)
            .ok_or(CoordinatorError::EscrowNotFound {
                escrow_id: hex::encode(escrow_id),
            })?;

        if escrow.status != MockEscrowStatus::Open {
            // Already settled: idempotent no-op
            return Ok(format!("mock-claim-{}", hex::encode(&escrow_id[..8])));
        }
        if now >= escrow.timelock {
            return Err(CoordinatorError::Expired {
                escrow_id: hex::encode(escrow_id),
                timelock: escrow.timelock.to_rfc3339(),
            });
        }
        if hashlock_of(secret) != escrow.hashlock {
            return Err(CoordinatorError::InvalidSecret);
        }

        let event = {
            let escrow = inner.escrows.get_mut(escrow_id).unwrap();
            escrow.status = MockEscrowStatus::Claimed;
            LedgerEvent::EscrowClaimed {
                escrow_id: *escrow_id,
                order_id: escrow.order_id,
                fill_index: escrow.fill_index,
                leg: escrow.leg,
                secret: secret.to_vec(),
            }
        };
        Self::emit(&self.ledger_id, &mut inner, event);

        Ok(format!("mock-claim-{}", hex::encode(&escrow_id[..8])))
    }

    async fn submit_refund(&self, escrow_id: &EscrowId) -> CoordinatorResult<SubmissionRef> {
        let mut inner = self.inner.lock().await;
        Self::check_failure(&mut inner, &self.ledger_id)?;

        let now = Self::now(&inner);
        let escrow = inner
            .escrows
            .get(escrow_id)
            .ok_or(CoordinatorError::EscrowNotFound {
                escrow_id: hex::encode(escrow_id),
            })?;

        if escrow.status != MockEscrowStatus::Open {
            return Ok(format!("mock-refund-{}", hex::encode(&escrow_id[..8])));
        }
        if now < escrow.timelock {
            return Err(CoordinatorError::NotExpired {
                escrow_id: hex::encode(escrow_id),
                timelock: escrow.timelock.to_rfc3339(),
            });
        }

        let event = {
            let escrow = inner.escrows.get_mut(escrow_id).unwrap();
            escrow.status = MockEscrowStatus::Refunded;
            LedgerEvent::EscrowRefunded {
                escrow_id: *escrow_id,
                order_id: escrow.order_id,
                fill_index: escrow.fill_index,
                leg: escrow.leg,
            }
        };
        Self::emit(&self.ledger_id, &mut inner, event);

        Ok(format!("mock-refund-{}", hex::encode(&escrow_id[..8])))
    }

    async fn subscribe(
        &self,
        from: EventCursor,
    ) -> CoordinatorResult<mpsc::Receiver<LedgerEventEnvelope>> {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::channel(1000);
        for envelope in inner.log.iter().filter(|e| e.cursor > from) {
            let _ = tx.try_send(envelope.clone());
        }
        inner.subscribers.push(tx);
        Ok(rx)
    }

    async fn health_check(&self) -> bool {
        true
    }
}
