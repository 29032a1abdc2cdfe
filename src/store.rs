// ===============================
// src/store.rs
// ===============================
//
// Latest order book per subscription id. Written by the two feed clients,
// read by the calculator. Every write is a single whole-book replace under
// one lock scope, so readers never observe a half-applied update.
//
use ahash::AHashMap as HashMap;
use std::sync::RwLock;

use crate::domain::{OrderBook, SubscriptionId};
use crate::registry::SubscriptionRegistry;

#[derive(Default)]
pub struct OrderBookStore {
    books: RwLock<HashMap<SubscriptionId, OrderBook>>,
}

impl OrderBookStore {
    pub fn new() -> Self { Self::default() }

    pub fn replace(&self, book: OrderBook) {
        let mut books = self.books.write().unwrap_or_else(|p| p.into_inner());
        books.insert(book.instrument_id.clone(), book);
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<OrderBook> {
        self.books.read().unwrap_or_else(|p| p.into_inner()).get(id).cloned()
    }

    /// Book for a human symbol, resolved through the registry.
    pub fn book_for(&self, registry: &SubscriptionRegistry, symbol: &str) -> Option<OrderBook> {
        registry.id_of(symbol).and_then(|id| self.get(&id))
    }

    /// (bid levels, ask levels) for logging.
    pub fn depth(&self, id: &SubscriptionId) -> Option<(usize, usize)> {
        self.books
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .map(|b| (b.bids.len(), b.asks.len()))
    }

    pub fn len(&self) -> usize {
        self.books.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}
