//! Deterministic Identifier Generator
//!
//! Stable event/order/trade IDs derived from `(run_id, kind, counter,
//! fingerprint)` via SHA-256. No system randomness anywhere: identical runs
//! produce identical IDs to the last character, across machines.
//!
//! IDs deliberately do not look like UUIDs. Anything UUID-shaped reaching
//! the engine is evidence of ambient randomness leaking in, and is rejected
//! at admission.

use crate::dryrun::clock::Millis;
use crate::dryrun::events::{OrderType, Side};
use crate::dryrun::fixed::Fp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex length of the hash portion of an ID.
const ID_HEX_LEN: usize = 24;

/// Domain tag baked into every hash, versioned with the ID format.
const ID_DOMAIN: &str = "DRYRUN_ID_V1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Order ID matches the `xxxxxxxx-xxxx-` UUID prefix shape.
    RandomLikeOrderId { order_id: String },
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdError::RandomLikeOrderId { order_id } => {
                write!(f, "invalid_random_like_order_id: {order_id}")
            }
        }
    }
}

impl std::error::Error for IdError {}

/// Inputs that pin down an order identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFingerprint {
    pub ts_ms: Millis,
    pub side: Side,
    pub qty: Fp,
    pub order_type: OrderType,
    pub price: Option<Fp>,
}

/// Inputs that pin down a trade identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeFingerprint {
    pub entry_ts_ms: Millis,
    pub close_ts_ms: Millis,
    pub side: Side,
    pub qty: Fp,
}

/// Deterministic ID factory for one run. Counters are monotonic per kind and
/// part of the hashed input, so replays line up ID-for-ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdGenerator {
    run_id: String,
    event_counter: u64,
    order_counter: u64,
    trade_counter: u64,
}

impl IdGenerator {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            event_counter: 0,
            order_counter: 0,
            trade_counter: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn digest(&self, kind: &str, counter: u64, fingerprint: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(ID_DOMAIN.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.run_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(counter.to_be_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint);
        let digest = hasher.finalize();
        hex::encode(&digest[..ID_HEX_LEN / 2])
    }

    pub fn next_event_id(&mut self, ts_ms: Millis) -> String {
        let counter = self.event_counter;
        self.event_counter += 1;
        let id = self.digest("event", counter, &ts_ms.to_be_bytes());
        format!("ev-{id}")
    }

    pub fn next_order_id(&mut self, fp: &OrderFingerprint) -> String {
        let counter = self.order_counter;
        self.order_counter += 1;
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&fp.ts_ms.to_be_bytes());
        bytes.push(match fp.side {
            Side::Buy => b'B',
            Side::Sell => b'S',
        });
        bytes.extend_from_slice(&fp.qty.raw().to_be_bytes());
        bytes.push(match fp.order_type {
            OrderType::Market => b'M',
            OrderType::Limit => b'L',
        });
        bytes.extend_from_slice(&fp.price.unwrap_or(Fp::ZERO).raw().to_be_bytes());
        let id = self.digest("order", counter, &bytes);
        format!("ord-{id}")
    }

    pub fn next_trade_id(&mut self, fp: &TradeFingerprint) -> String {
        let counter = self.trade_counter;
        self.trade_counter += 1;
        let mut bytes = Vec::with_capacity(48);
        bytes.extend_from_slice(&fp.entry_ts_ms.to_be_bytes());
        bytes.extend_from_slice(&fp.close_ts_ms.to_be_bytes());
        bytes.push(match fp.side {
            Side::Buy => b'B',
            Side::Sell => b'S',
        });
        bytes.extend_from_slice(&fp.qty.raw().to_be_bytes());
        let id = self.digest("trade", counter, &bytes);
        format!("trd-{id}")
    }
}

/// Reject order IDs that look like UUIDs (`^[0-9a-f]{8}-[0-9a-f]{4}-`).
pub fn validate_order_id(order_id: &str) -> Result<(), IdError> {
    let bytes = order_id.as_bytes();
    let is_hex = |b: u8| b.is_ascii_digit() || (b'a'..=b'f').contains(&b);
    let uuid_shaped = bytes.len() >= 14
        && bytes[..8].iter().all(|&b| is_hex(b))
        && bytes[8] == b'-'
        && bytes[9..13].iter().all(|&b| is_hex(b))
        && bytes[13] == b'-';
    if uuid_shaped {
        return Err(IdError::RandomLikeOrderId {
            order_id: order_id.to_string(),
        });
    }
    Ok(())
}
