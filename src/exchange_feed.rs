// ===============================
// src/exchange_feed.rs
// ===============================
//
// Exchange order-book feed over WebSocket (JSON text frames).
//
// - one `OrderBookGetAndSubscribe` per tracked symbol, sent from a side task
//   so book frames are consumed while subscriptions are still going out
// - every book frame carries full depth: the stored book is replaced wholesale
// - peer close or a failed subscription marks the feed disconnected and ends
//   `run`; no reconnect
//
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, error::ProtocolError, Message},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::{OrderBook, PriceLevel, SubscriptionId, Venue};
use crate::metrics::{BOOK_UPDATES, FEED_CONNECTED, FRAMES_DROPPED};
use crate::registry::SubscriptionRegistry;
use crate::store::OrderBookStore;
use crate::token::{TokenCache, TokenError, TokenSource};

pub const BOOK_DEPTH: u32 = 10;
const EXCHANGE: &str = "MOEX";
const FREQUENCY_MS: u32 = 1000;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("bad ws url `{0}`")]
    Url(String),
    #[error("websocket error: {0}")]
    Ws(#[from] tungstenite::Error),
    #[error("connection closed by server")]
    ConnectionClosed,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("subscription task: {0}")]
    Subscription(String),
}

#[derive(Debug, Deserialize)]
struct BookFrame {
    guid: Option<String>,
    data: Option<BookData>,
}

#[derive(Debug, Deserialize)]
struct BookData {
    #[serde(default)]
    bids: Vec<PriceLevel>,
    #[serde(default)]
    asks: Vec<PriceLevel>,
    #[serde(default)]
    timestamp: i64,
}

pub fn subscribe_frame(code: &str, guid: &SubscriptionId, token: &str) -> serde_json::Value {
    json!({
        "opcode": "OrderBookGetAndSubscribe",
        "code": code,
        "depth": BOOK_DEPTH,
        "exchange": EXCHANGE,
        "format": "Simple",
        "frequency": FREQUENCY_MS,
        "guid": guid.as_str(),
        "token": token,
    })
}

fn is_peer_close(e: &tungstenite::Error) -> bool {
    matches!(
        e,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}

pub struct ExchangeFeedClient<S> {
    ws_url: String,
    symbols: Vec<String>,
    registry: Arc<SubscriptionRegistry>,
    store: Arc<OrderBookStore>,
    tokens: Arc<Mutex<TokenCache<S>>>,
    connected: watch::Sender<bool>,
}

impl<S: TokenSource> ExchangeFeedClient<S> {
    pub fn new(
        ws_url: impl Into<String>,
        symbols: Vec<String>,
        registry: Arc<SubscriptionRegistry>,
        store: Arc<OrderBookStore>,
        tokens: TokenCache<S>,
    ) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            ws_url: ws_url.into(),
            symbols,
            registry,
            store,
            tokens: Arc::new(Mutex::new(tokens)),
            connected,
        }
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> { self.connected.subscribe() }

    fn set_connected(&self, up: bool) {
        self.connected.send_replace(up);
        FEED_CONNECTED.with_label_values(&[Venue::Exchange.label()]).set(up as i64);
    }

    /// Decode one text frame; `true` when it replaced a tracked book.
    pub fn on_text(&self, txt: &str) -> bool {
        let frame: BookFrame = match serde_json::from_str(txt) {
            Ok(f) => f,
            Err(e) => {
                warn!(%e, "undecodable exchange frame");
                FRAMES_DROPPED.with_label_values(&[Venue::Exchange.label()]).inc();
                return false;
            }
        };
        let (Some(guid), Some(data)) = (frame.guid, frame.data) else {
            debug!(frame = %txt, "non-book frame");
            return false;
        };
        match self.registry.symbol_of(&guid) {
            Some(symbol) if self.symbols.contains(&symbol) => {
                self.store.replace(OrderBook {
                    instrument_id: SubscriptionId::new(guid),
                    bids: data.bids,
                    asks: data.asks,
                    timestamp: data.timestamp,
                });
                BOOK_UPDATES.with_label_values(&[Venue::Exchange.label()]).inc();
                true
            }
            _ => {
                debug!(%guid, "frame for unknown subscription");
                false
            }
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), FeedError> {
        let url = Url::parse(&self.ws_url).map_err(|_| FeedError::Url(self.ws_url.clone()))?;
        info!(%url, symbols = ?self.symbols, "connecting exchange feed");
        let (ws, _resp) = connect_async(url.as_str()).await?;
        self.set_connected(true);
        info!("exchange feed connected");

        let (mut sink, mut stream) = ws.split();
        let mut subscriber = {
            let symbols = self.symbols.clone();
            let registry = self.registry.clone();
            let tokens = self.tokens.clone();
            tokio::spawn(async move {
                for code in &symbols {
                    let token = tokens.lock().await.token().await?;
                    let guid = registry.generate(code);
                    let frame = subscribe_frame(code, &guid, &token);
                    sink.send(Message::Text(frame.to_string())).await?;
                    debug!(%code, %guid, "subscription sent");
                }
                info!(count = symbols.len(), "exchange subscriptions sent");
                Ok::<_, FeedError>(sink)
            })
        };

        // the sink comes back from the subscription task once every frame is out
        let mut sink = None;
        let mut subscribing = true;
        let outcome = loop {
            tokio::select! {
                done = &mut subscriber, if subscribing => {
                    subscribing = false;
                    match done {
                        Ok(Ok(s)) => sink = Some(s),
                        Ok(Err(e)) => {
                            error!(%e, "exchange subscription failed");
                            break Err(e);
                        }
                        Err(e) => {
                            error!(%e, "exchange subscription task died");
                            break Err(FeedError::Subscription(e.to_string()));
                        }
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(txt))) => { self.on_text(&txt); }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("exchange feed closed by server");
                        break Err(FeedError::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) if is_peer_close(&e) => {
                        warn!(%e, "exchange feed closed by server");
                        break Err(FeedError::ConnectionClosed);
                    }
                    Some(Err(e)) => {
                        error!(%e, "exchange feed read error");
                        break Err(e.into());
                    }
                },
                _ = shutdown.changed() => {
                    info!("exchange feed shutting down");
                    break Ok(());
                }
            }
        };

        self.set_connected(false);
        if subscribing {
            subscriber.abort();
            if let Ok(Ok(s)) = subscriber.await {
                sink = Some(s);
            }
        }
        if let Some(mut s) = sink {
            let _ = s.close().await;
        }
        outcome
    }
}
