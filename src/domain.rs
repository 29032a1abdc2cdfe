// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque per-symbol subscription token (GUID shaped `8-4-4-4-12`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(raw: impl Into<String>) -> Self { Self(raw.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Venue { Exchange, Forex }

impl Venue {
    pub fn label(&self) -> &'static str {
        match self { Venue::Exchange => "exchange", Venue::Forex => "forex" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide { Bid, Ask }

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel { pub price: f64, pub volume: f64 }

/// Latest book for one subscription. Level order is venue delivery order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub instrument_id: SubscriptionId,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp: i64,
}

impl OrderBook {
    pub fn side(&self, side: BookSide) -> &[PriceLevel] {
        match side { BookSide::Bid => &self.bids, BookSide::Ask => &self.asks }
    }
}
