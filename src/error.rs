//! Error types for the swap coordinator

use thiserror::Error;

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Protocol violations: rejected immediately, never retried.
    #[error("Secret does not match hashlock")]
    InvalidSecret,

    #[error("Timelock outside allowed bounds: {message}")]
    InvalidTimelock { message: String },

    #[error("Escrow already exists for order {order_id} fill {fill_index} ({leg})")]
    DuplicateEscrow {
        order_id: String,
        fill_index: u32,
        leg: String,
    },

    #[error("Escrow {escrow_id} already settled")]
    AlreadySettled { escrow_id: String },

    #[error("Claim window for escrow {escrow_id} closed at {timelock}")]
    Expired { escrow_id: String, timelock: String },

    #[error("Escrow {escrow_id} not yet refundable before {timelock}")]
    NotExpired { escrow_id: String, timelock: String },

    #[error("Escrow {escrow_id} not found")]
    EscrowNotFound { escrow_id: String },

    #[error("Invalid escrow amount: {amount}")]
    InvalidAmount { amount: u64 },

    #[error("Order {order_id} not found")]
    OrderNotFound { order_id: String },

    #[error("Order {order_id} is frozen pending reconciliation")]
    OrderFrozen { order_id: String },

    #[error("Order {order_id} is {status} and accepts no further fills")]
    OrderClosed { order_id: String, status: String },

    #[error("Fill of {fill_amount} below minimum {min_fill_amount} for order {order_id}")]
    FillTooSmall {
        order_id: String,
        fill_amount: u64,
        min_fill_amount: u64,
    },

    #[error("Fill of {fill_amount} exceeds remaining {remaining} for order {order_id}")]
    FillExceedsRemaining {
        order_id: String,
        fill_amount: u64,
        remaining: u64,
    },

    #[error("Order {order_id} does not allow partial fills")]
    PartialFillsDisabled { order_id: String },

    #[error("Order {order_id} cannot be cancelled after a fill")]
    CancelAfterFill { order_id: String },

    #[error("Auction {auction_id} not found")]
    AuctionNotFound { auction_id: String },

    #[error("Auction {auction_id} ended at {end_time}")]
    AuctionExpired { auction_id: String, end_time: String },

    #[error("Auction {auction_id} already has a winning bid")]
    AuctionFilled { auction_id: String },

    #[error("Fill opportunity for order {order_id} fill {fill_index} already claimed")]
    OpportunityAlreadyClaimed { order_id: String, fill_index: u32 },

    #[error(
        "Destination timelock {dest_timelock} must precede source timelock {source_timelock} \
         by at least the safety margin"
    )]
    TimelockOrderingViolation {
        source_timelock: String,
        dest_timelock: String,
    },

    // Transient infrastructure errors: retried with bounded backoff.
    #[error("Ledger connection error for {ledger_id}: {message}")]
    LedgerConnection { ledger_id: String, message: String },

    #[error("Submission failed on {ledger_id}: {message}")]
    Submission { ledger_id: String, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Ledger {ledger_id} not found")]
    LedgerNotFound { ledger_id: String },

    // Escalations after retry exhaustion.
    #[error("Failed to create mirrored escrow for order {order_id} fill {fill_index}")]
    MirrorCreationFailed { order_id: String, fill_index: u32 },

    #[error("Failed to propagate claim secret for order {order_id} fill {fill_index}")]
    ClaimPropagationFailed { order_id: String, fill_index: u32 },

    // Safety-critical breach: fatal for the affected order only.
    #[error("Invariant breach on order {order_id}: {message}")]
    InvariantBreach { order_id: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::LedgerConnection { .. }
                | CoordinatorError::Submission { .. }
                | CoordinatorError::Timeout { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            CoordinatorError::MirrorCreationFailed { .. }
                | CoordinatorError::ClaimPropagationFailed { .. }
                | CoordinatorError::InvariantBreach { .. }
        )
    }

    /// Check if error freezes the affected order
    pub fn is_fatal_for_order(&self) -> bool {
        matches!(self, CoordinatorError::InvariantBreach { .. })
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
