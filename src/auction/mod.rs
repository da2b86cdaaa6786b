//! Dutch auction engine for resolver selection
//!
//! Each fill opportunity runs a linearly decaying price auction. The price
//! is a pure function of elapsed time, recomputed on every read; the first
//! bid at or below the current price wins and the auction becomes immutable.
//! Losing bids are kept for audit and never affect state.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::fill::{Amount, OrderId};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;

pub type AuctionId = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuctionStatus {
    Open,
    Filled,
    Expired,
}

impl AuctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionStatus::Open => "open",
            AuctionStatus::Filled => "filled",
            AuctionStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub resolver: String,
    pub price: Amount,
    /// Portion of the auctioned amount the resolver commits to fill
    pub fill_amount: Amount,
    pub at: DateTime<Utc>,
    pub winning: bool,
}

/// Decay parameters applied to a fill opportunity
#[derive(Debug, Clone, Copy)]
pub struct AuctionParams {
    pub start_price: Amount,
    pub floor_price: Amount,
    pub decay_per_second: Amount,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auction {
    pub auction_id: AuctionId,
    pub order_id: OrderId,
    pub fill_index: u32,
    /// Amount on offer: the order's remaining amount when the auction opened
    pub amount: Amount,
    pub start_price: Amount,
    pub floor_price: Amount,
    pub decay_per_second: Amount,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub bids: Vec<Bid>,
    pub status: AuctionStatus,
    /// Auction round for this fill opportunity; part of the auction id, so
    /// a re-opened opportunity never reuses an id
    pub round: u32,
}

impl Auction {
    /// Current acceptance price: linear decay clamped at the floor.
    /// Computed, never stored, so no background repricing is needed.
    pub fn current_price(&self, now: DateTime<Utc>) -> Amount {
        if now <= self.start_time {
            return self.start_price;
        }
        let elapsed = (now - self.start_time).num_seconds() as u64;
        let decayed = self
            .start_price
            .saturating_sub(self.decay_per_second.saturating_mul(elapsed));
        decayed.max(self.floor_price)
    }

    pub fn winning_bid(&self) -> Option<&Bid> {
        self.bids.iter().find(|b| b.winning)
    }
}

/// Outcome of a bid submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BidResult {
    Won {
        auction_id: AuctionId,
        price: Amount,
        fill_amount: Amount,
    },
    /// Bid above the current price: recorded for audit, auction stays open
    Lost { current_price: Amount },
}

fn auction_id_for(order_id: &OrderId, fill_index: u32, round: u32) -> AuctionId {
    let mut hasher = Sha256::new();
    hasher.update(b"auction");
    hasher.update(order_id);
    hasher.update(fill_index.to_be_bytes());
    hasher.update(round.to_be_bytes());
    hasher.finalize().into()
}

/// Book of auctions, one live auction per fill opportunity
pub struct AuctionBook {
    auctions: RwLock<HashMap<AuctionId, Auction>>,
    by_fill: RwLock<HashMap<(OrderId, u32), AuctionId>>,
    rounds: RwLock<HashMap<(OrderId, u32), u32>>,
}

impl AuctionBook {
    pub fn new() -> Self {
        Self {
            auctions: RwLock::new(HashMap::new()),
            by_fill: RwLock::new(HashMap::new()),
            rounds: RwLock::new(HashMap::new()),
        }
    }

    /// Open an auction for a fill opportunity. Re-opening while a previous
    /// round is still open returns the existing auction (replay safety);
    /// after a won round the opportunity is claimed for good.
    pub async fn start(
        &self,
        order_id: OrderId,
        fill_index: u32,
        amount: Amount,
        params: AuctionParams,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<AuctionId> {
        let key = (order_id, fill_index);
        let mut by_fill = self.by_fill.write().await;
        let mut auctions = self.auctions.write().await;

        if let Some(existing_id) = by_fill.get(&key) {
            if let Some(existing) = auctions.get(existing_id) {
                match existing.status {
                    AuctionStatus::Open => return Ok(*existing_id),
                    AuctionStatus::Filled => {
                        return Err(CoordinatorError::OpportunityAlreadyClaimed {
                            order_id: hex::encode(order_id),
                            fill_index,
                        })
                    }
                    AuctionStatus::Expired => {}
                }
            }
        }

        let mut rounds = self.rounds.write().await;
        let next_round = rounds.entry(key).or_insert(0);
        let round = *next_round;
        let auction_id = auction_id_for(&order_id, fill_index, round);
        *next_round += 1;

        let auction = Auction {
            auction_id,
            order_id,
            fill_index,
            amount,
            start_price: params.start_price,
            floor_price: params.floor_price,
            decay_per_second: params.decay_per_second,
            start_time: now,
            end_time: now + params.duration,
            bids: Vec::new(),
            status: AuctionStatus::Open,
            round,
        };

        by_fill.insert(key, auction_id);
        auctions.insert(auction_id, auction);

        Ok(auction_id)
    }

    /// Submit a bid. First bid at or below the decaying price wins;
    /// callers are serialized per order, so arrival order is authoritative.
    pub async fn place_bid(
        &self,
        auction_id: &AuctionId,
        resolver: &str,
        offered_price: Amount,
        fill_amount: Amount,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<BidResult> {
        let mut auctions = self.auctions.write().await;
        let auction = auctions
            .get_mut(auction_id)
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

        if now >= auction.end_time {
            auction.status = AuctionStatus::Expired;
            return Err(CoordinatorError::AuctionExpired {
                auction_id: hex::encode(auction_id),
                end_time: auction.end_time.to_rfc3339(),
            });
        }

        let current = auction.current_price(now);
        let winning = offered_price <= current;

        auction.bids.push(Bid {
            resolver: resolver.to_string(),
            price: offered_price,
            fill_amount,
            at: now,
            winning,
        });

        if winning {
            auction.status = AuctionStatus::Filled;
            Ok(BidResult::Won {
                auction_id: *auction_id,
                price: offered_price,
                fill_amount,
            })
        } else {
            Ok(BidResult::Lost {
                current_price: current,
            })
        }
    }

    pub async fn get(&self, auction_id: &AuctionId) -> Option<Auction> {
        self.auctions.read().await.get(auction_id).cloned()
    }

    pub async fn latest_for_order(&self, order_id: &OrderId) -> Option<Auction> {
        let by_fill = self.by_fill.read().await;
        let auctions = self.auctions.read().await;
        by_fill
            .iter()
            .filter(|((oid, _), _)| oid == order_id)
            .max_by_key(|((_, fill_index), _)| *fill_index)
            .and_then(|(_, id)| auctions.get(id).cloned())
    }

    /// Reinstate an auction loaded from the store on startup, advancing the
    /// round counter so a later re-open cannot collide with its id
    pub async fn restore(&self, auction: Auction) {
        let key = (auction.order_id, auction.fill_index);
        let mut by_fill = self.by_fill.write().await;
        let mut auctions = self.auctions.write().await;
        let mut rounds = self.rounds.write().await;

        let next = rounds.entry(key).or_insert(0);
        if *next <= auction.round {
            *next = auction.round + 1;
        }
        by_fill.insert(key, auction.auction_id);
        auctions.insert(auction.auction_id, auction);
    }

    /// Expire open auctions past their end time, returning the ones that
    /// closed without a winner so the coordinator can act on them
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Vec<Auction> {
        let mut auctions = self.auctions.write().await;
        let mut expired = Vec::new();
        for auction in auctions.values_mut() {
            if auction.status == AuctionStatus::Open && now >= auction.end_time {
                auction.status = AuctionStatus::Expired;
                expired.push(auction.clone());
            }
        }
        expired
    }
}

impl Default for AuctionBook {
    fn default() -> Self {
        Self::new()
    }
}
