//! Hashlocked, time-locked escrow state machine
//!
//! One `Escrow` is one ledger-local lock of funds for one leg of a fill.
//! The lifecycle is `Open -> {Claimed | Refunded}`; both transitions are
//! terminal and mutually exclusive. A claim requires the hashlock preimage
//! and must land strictly before the timelock; a refund requires the
//! timelock to have passed. The disjoint windows are what make
//! refund-after-timeout safe across two ledgers with no shared clock.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::fill::{Amount, OrderId};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

pub type EscrowId = [u8; 32];
pub type Hashlock = [u8; 32];

/// Secrets beyond this length are rejected outright rather than hashed.
pub const MAX_SECRET_LEN: usize = 128;

/// SHA-256 commitment over a secret
pub fn hashlock_of(secret: &[u8]) -> Hashlock {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EscrowLeg {
    Source,
    Destination,
}

impl EscrowLeg {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowLeg::Source => "source",
            EscrowLeg::Destination => "destination",
        }
    }

    pub fn counterpart(&self) -> EscrowLeg {
        match self {
            EscrowLeg::Source => EscrowLeg::Destination,
            EscrowLeg::Destination => EscrowLeg::Source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowStatus {
    Open,
    Claimed,
    Refunded,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Open => "open",
            EscrowStatus::Claimed => "claimed",
            EscrowStatus::Refunded => "refunded",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub escrow_id: EscrowId,
    pub order_id: OrderId,
    pub fill_index: u32,
    pub leg: EscrowLeg,
    pub ledger_id: String,
    pub hashlock: Hashlock,
    pub timelock: DateTime<Utc>,
    pub amount: Amount,
    pub status: EscrowStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    /// Set on claim; this is how the secret propagates to the other leg.
    pub revealed_secret: Option<Vec<u8>>,
}

impl Escrow {
    pub fn is_open(&self) -> bool {
        self.status == EscrowStatus::Open
    }
}

/// Deterministic escrow id, so a replayed creation maps to the same escrow
pub fn escrow_id_for(order_id: &OrderId, fill_index: u32, leg: EscrowLeg) -> EscrowId {
    let mut hasher = Sha256::new();
    hasher.update(b"escrow");
    hasher.update(order_id);
    hasher.update(fill_index.to_be_bytes());
    hasher.update([leg as u8]);
    hasher.finalize().into()
}

/// Allowed distance of a timelock from creation time
#[derive(Debug, Clone, Copy)]
pub struct TimelockBounds {
    pub min: Duration,
    pub max: Duration,
}

impl TimelockBounds {
    pub fn from_secs(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min: Duration::seconds(min_secs as i64),
            max: Duration::seconds(max_secs as i64),
        }
    }
}

/// Authoritative book of escrows across all configured ledgers
pub struct EscrowBook {
    bounds: TimelockBounds,
    escrows: RwLock<HashMap<EscrowId, Escrow>>,
    by_fill: RwLock<HashMap<(OrderId, u32, EscrowLeg), EscrowId>>,
    /// Preimage hashes that already settled an escrow, keyed to the fill
    /// they settled. A secret may settle both legs of its own fill and
    /// nothing else.
    used_preimages: RwLock<HashMap<Hashlock, (OrderId, u32)>>,
}

impl EscrowBook {
    pub fn new(bounds: TimelockBounds) -> Self {
        Self {
            bounds,
            escrows: RwLock::new(HashMap::new()),
            by_fill: RwLock::new(HashMap::new()),
            used_preimages: RwLock::new(HashMap::new()),
        }
    }

    pub fn bounds(&self) -> TimelockBounds {
        self.bounds
    }

    /// Create an escrow for one leg of a fill
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        order_id: OrderId,
        fill_index: u32,
        leg: EscrowLeg,
        ledger_id: &str,
        hashlock: Hashlock,
        timelock: DateTime<Utc>,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<EscrowId> {
        if amount == 0 {
            return Err(CoordinatorError::InvalidAmount { amount });
        }

        if timelock < now + self.bounds.min || timelock > now + self.bounds.max {
            return Err(CoordinatorError::InvalidTimelock {
                message: format!(
                    "timelock {} outside [{}, {}] from {}",
                    timelock,
                    now + self.bounds.min,
                    now + self.bounds.max,
                    now
                ),
            });
        }

        let key = (order_id, fill_index, leg);
        let mut by_fill = self.by_fill.write().await;
        if by_fill.contains_key(&key) {
            return Err(CoordinatorError::DuplicateEscrow {
                order_id: hex::encode(order_id),
                fill_index,
                leg: leg.as_str().to_string(),
            });
        }

        let escrow_id = escrow_id_for(&order_id, fill_index, leg);
        let escrow = Escrow {
            escrow_id,
            order_id,
            fill_index,
            leg,
            ledger_id: ledger_id.to_string(),
            hashlock,
            timelock,
            amount,
            status: EscrowStatus::Open,
            created_at: now,
            settled_at: None,
            revealed_secret: None,
        };

        by_fill.insert(key, escrow_id);
        self.escrows.write().await.insert(escrow_id, escrow);

        Ok(escrow_id)
    }

    /// Claim an open escrow with the hashlock preimage
    pub async fn claim(
        &self,
        escrow_id: &EscrowId,
        secret: &[u8],
        now: DateTime<Utc>,
    ) -> CoordinatorResult<()> {
        let mut escrows = self.escrows.write().await;
        let escrow = escrows
            .get_mut(escrow_id)
            .ok_or(CoordinatorError::EscrowNotFound {
                escrow_id: hex::encode(escrow_id),
            })?;

        if escrow.status != EscrowStatus::Open {
            return Err(CoordinatorError::AlreadySettled {
                escrow_id: hex::encode(escrow_id),
            });
        }

        // The claim window closes exactly at the timelock. This asymmetry
        // against refund (which opens at the timelock) keeps the windows
        // disjoint under any cross-ledger ordering.
        if now >= escrow.timelock {
            return Err(CoordinatorError::Expired {
                escrow_id: hex::encode(escrow_id),
                timelock: escrow.timelock.to_rfc3339(),
            });
        }

        if secret.is_empty() || secret.len() > MAX_SECRET_LEN {
            return Err(CoordinatorError::InvalidSecret);
        }
        let preimage_hash = hashlock_of(secret);
        if preimage_hash != escrow.hashlock {
            return Err(CoordinatorError::InvalidSecret);
        }

        // Single-use preimages: a secret settles at most one fill.
        let mut used = self.used_preimages.write().await;
        match used.get(&preimage_hash) {
            Some(&(oid, fidx)) if (oid, fidx) != (escrow.order_id, escrow.fill_index) => {
                return Err(CoordinatorError::InvalidSecret);
            }
            _ => {
                used.insert(preimage_hash, (escrow.order_id, escrow.fill_index));
            }
        }

        escrow.status = EscrowStatus::Claimed;
        escrow.settled_at = Some(now);
        escrow.revealed_secret = Some(secret.to_vec());

        Ok(())
    }

    /// Refund an expired escrow. Permissionless: anyone may trigger it once
    /// the timelock has passed, so liveness never depends on one actor.
    pub async fn refund(&self, escrow_id: &EscrowId, now: DateTime<Utc>) -> CoordinatorResult<()> {
        let mut escrows = self.escrows.write().await;
        let escrow = escrows
            .get_mut(escrow_id)
            .ok_or(CoordinatorError::EscrowNotFound {
                escrow_id: hex::encode(escrow_id),
            })?;

        if escrow.status != EscrowStatus::Open {
            return Err(CoordinatorError::AlreadySettled {
                escrow_id: hex::encode(escrow_id),
            });
        }

        if now < escrow.timelock {
            return Err(CoordinatorError::NotExpired {
                escrow_id: hex::encode(escrow_id),
                timelock: escrow.timelock.to_rfc3339(),
            });
        }

        escrow.status = EscrowStatus::Refunded;
        escrow.settled_at = Some(now);

        Ok(())
    }

    pub async fn get(&self, escrow_id: &EscrowId) -> Option<Escrow> {
        self.escrows.read().await.get(escrow_id).cloned()
    }

    /// Both legs of a fill, in (source, destination) order
    pub async fn find_pair(
        &self,
        order_id: &OrderId,
        fill_index: u32,
    ) -> (Option<Escrow>, Option<Escrow>) {
        let by_fill = self.by_fill.read().await;
        let escrows = self.escrows.read().await;

        let lookup = |leg: EscrowLeg| {
            by_fill
                .get(&(*order_id, fill_index, leg))
                .and_then(|id| escrows.get(id).cloned())
        };

        (lookup(EscrowLeg::Source), lookup(EscrowLeg::Destination))
    }

    /// Open escrows whose timelock has passed and can be refunded
    pub async fn open_expired(&self, now: DateTime<Utc>) -> Vec<Escrow> {
        self.escrows
            .read()
            .await
            .values()
            .filter(|e| e.is_open() && now >= e.timelock)
            .cloned()
            .collect()
    }

    pub async fn open_count(&self) -> usize {
        self.escrows
            .read()
            .await
            .values()
            .filter(|e| e.is_open())
            .count()
    }

    /// Remove settled escrows older than the given age
    pub async fn prune_settled(&self, now: DateTime<Utc>, max_age: Duration) {
        // Lock order matches create/find_pair: by_fill before escrows
        let mut by_fill = self.by_fill.write().await;
        let mut escrows = self.escrows.write().await;

        let stale: Vec<EscrowId> = escrows
            .values()
            .filter(|e| {
                !e.is_open()
                    && e.settled_at
                        .map(|t| now - t > max_age)
                        .unwrap_or(false)
            })
            .map(|e| e.escrow_id)
            .collect();

        if stale.is_empty() {
            return;
        }

        let ids: HashSet<EscrowId> = stale.iter().copied().collect();
        by_fill.retain(|_, id| !ids.contains(id));
        for id in stale {
            escrows.remove(&id);
        }
    }

    /// Reinstate an escrow loaded from the store on startup, bypassing the
    /// timelock bounds that were enforced when it was first created
    pub async fn restore(&self, escrow: Escrow) {
        let key = (escrow.order_id, escrow.fill_index, escrow.leg);
        let mut by_fill = self.by_fill.write().await;
        let mut escrows = self.escrows.write().await;
        if !escrows.contains_key(&escrow.escrow_id) {
            by_fill.insert(key, escrow.escrow_id);
            escrows.insert(escrow.escrow_id, escrow);
        }
    }
}
