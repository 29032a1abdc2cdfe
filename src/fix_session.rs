// ===============================
// src/fix_session.rs
// ===============================
//
// FIX 4.4 market-data session over plain TCP.
//
//   Disconnected --connect()--> Connecting --logon sent--> LoggedOn
//   LoggedOn --logout recv / peer close / disconnect()--> Closed
//
// - heartbeat task: sends 35=0 every `heartbeat` while the session stays up
// - listen loop   : buffers the byte stream, parses one message at a time from
//                   the front and advances by the re-encoded message length
// - W / X         : merged into a per-instrument book (volume keyed), then the
//                   whole book is written to the shared store
//
// No reconnection; the caller decides whether to build a new client.
//
use ahash::AHashMap as HashMap;
use chrono::Utc;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{watch, Mutex, Notify},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::domain::{OrderBook, PriceLevel, SubscriptionId, Venue};
use crate::fix_codec::{self, msg_type, tag, FixMessage};
use crate::metrics::{BOOK_UPDATES, FEED_CONNECTED, FIX_MESSAGES, FRAMES_DROPPED};
use crate::registry::SubscriptionRegistry;
use crate::store::OrderBookStore;

const READ_CHUNK: usize = 4096;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum FixError {
    #[error("connect to {addr} timed out after {secs}s")]
    Timeout { addr: String, secs: u64 },
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("not connected to server")]
    NotConnected,
    #[error("connection closed by server")]
    ConnectionClosed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState { Disconnected, Connecting, LoggedOn, Closed }

impl SessionState {
    pub fn is_logged_on(self) -> bool { self == SessionState::LoggedOn }
}

#[derive(Debug, Clone)]
pub struct FixConfig {
    pub host: String,
    pub port: u16,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub sender_sub_id: Option<String>,
    pub target_sub_id: Option<String>,
    pub username: String,
    pub password: String,
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    pub request_pacing: Duration,
    /// (FIX symbol id, instrument name), e.g. ("1678", "EURUSD")
    pub symbols: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// Book maintenance
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct Sides { bids: Vec<PriceLevel>, asks: Vec<PriceLevel> }

/// In-memory forex books keyed by FIX symbol id.
pub struct FixBookSet {
    ids: HashMap<String, SubscriptionId>,
    books: HashMap<SubscriptionId, Sides>,
}

/// Same volume on the same side replaces the price; anything else appends.
fn merge_level(levels: &mut Vec<PriceLevel>, price: f64, volume: f64) {
    match levels.iter_mut().find(|l| l.volume == volume) {
        Some(level) => level.price = price,
        None => levels.push(PriceLevel { price, volume }),
    }
}

fn parse_num(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
}

impl FixBookSet {
    pub fn new(symbols: &[(String, String)], registry: &SubscriptionRegistry) -> Self {
        let mut ids = HashMap::new();
        let mut books = HashMap::new();
        for (fix_id, name) in symbols {
            let id = registry.generate(name);
            books.insert(id.clone(), Sides::default());
            ids.insert(fix_id.clone(), id);
        }
        Self { ids, books }
    }

    pub fn subscription(&self, fix_symbol: &str) -> Option<&SubscriptionId> {
        self.ids.get(fix_symbol)
    }

    /// Apply every entry of a W or X message, then publish each touched book.
    /// Returns the number of books written to the store.
    pub fn apply(&mut self, msg: &FixMessage, store: &OrderBookStore, now_secs: i64) -> usize {
        let Some(count) = msg.get_str(tag::NO_MD_ENTRIES).and_then(|s| s.trim().parse::<usize>().ok()) else {
            return 0;
        };
        let mut touched: Vec<SubscriptionId> = Vec::new();

        for i in 0..count {
            // snapshots carry one 55 for the whole message, incrementals one per entry
            let symbol = msg.get_nth_str(tag::SYMBOL, i).or_else(|| msg.get_str(tag::SYMBOL));
            let Some(id) = symbol.and_then(|s| self.ids.get(s)) else { continue };
            let (Some(price), Some(volume)) = (
                parse_num(msg.get_nth_str(tag::MD_ENTRY_PX, i)),
                parse_num(msg.get_nth_str(tag::MD_ENTRY_SIZE, i)),
            ) else {
                debug!(entry = i, "md entry without price/size, skipped");
                continue;
            };
            let sides = self.books.entry(id.clone()).or_default();
            match msg.get_nth_str(tag::MD_ENTRY_TYPE, i) {
                Some("0") => merge_level(&mut sides.bids, price, volume),
                Some("1") => merge_level(&mut sides.asks, price, volume),
                _ => continue,
            }
            if !touched.contains(id) {
                touched.push(id.clone());
            }
        }

        for id in &touched {
            let sides = &self.books[id];
            store.replace(OrderBook {
                instrument_id: id.clone(),
                bids: sides.bids.clone(),
                asks: sides.asks.clone(),
                timestamp: now_secs,
            });
            BOOK_UPDATES.with_label_values(&[Venue::Forex.label()]).inc();
        }
        touched.len()
    }
}

// ---------------------------------------------------------------------------
// Session shared between the listen loop and the heartbeat task
// ---------------------------------------------------------------------------

struct Shared {
    cfg: FixConfig,
    seq: AtomicU64,
    stay_connected: AtomicBool,
    peer_logged_out: AtomicBool,
    writer: Mutex<Option<OwnedWriteHalf>>,
    state: watch::Sender<SessionState>,
}

impl Shared {
    fn stay_connected(&self) -> bool { self.stay_connected.load(Ordering::SeqCst) }

    fn set_state(&self, s: SessionState) {
        self.state.send_replace(s);
        FEED_CONNECTED
            .with_label_values(&[Venue::Forex.label()])
            .set(s.is_logged_on() as i64);
    }

    fn base_message(&self, kind: &str) -> FixMessage {
        let mut msg = FixMessage::new();
        msg.append_pair(tag::MSG_TYPE, kind)
            .append_pair(tag::SENDER_COMP_ID, &self.cfg.sender_comp_id)
            .append_pair(tag::TARGET_COMP_ID, &self.cfg.target_comp_id);
        if let Some(sub) = self.cfg.sender_sub_id.as_deref().filter(|s| !s.is_empty()) {
            msg.append_pair(tag::SENDER_SUB_ID, sub);
        }
        if let Some(sub) = self.cfg.target_sub_id.as_deref().filter(|s| !s.is_empty()) {
            msg.append_pair(tag::TARGET_SUB_ID, sub);
        }
        msg.append_pair(tag::MSG_SEQ_NUM, self.seq.fetch_add(1, Ordering::SeqCst))
            .append_pair(tag::SENDING_TIME, fix_codec::utc_timestamp());
        msg
    }

    async fn write_to(w: &mut OwnedWriteHalf, msg: &FixMessage) -> Result<(), FixError> {
        w.write_all(&msg.encode()).await?;
        w.flush().await?;
        FIX_MESSAGES
            .with_label_values(&["out", msg.msg_type().unwrap_or("?")])
            .inc();
        Ok(())
    }

    async fn send(&self, msg: &FixMessage) -> Result<(), FixError> {
        let mut guard = self.writer.lock().await;
        let w = guard.as_mut().ok_or(FixError::NotConnected)?;
        Self::write_to(w, msg).await
    }

    async fn send_logon(&self) -> Result<(), FixError> {
        let mut msg = self.base_message(msg_type::LOGON);
        msg.append_pair(tag::ENCRYPT_METHOD, 0)
            .append_pair(tag::HEART_BT_INT, self.cfg.heartbeat.as_secs())
            .append_pair(tag::RESET_SEQ_NUM_FLAG, "Y")
            .append_pair(tag::USERNAME, &self.cfg.username)
            .append_pair(tag::PASSWORD, &self.cfg.password);
        self.send(&msg).await?;
        info!(sender = %self.cfg.sender_comp_id, target = %self.cfg.target_comp_id, "logon sent");
        Ok(())
    }

    async fn send_heartbeat(&self, test_req_id: Option<&[u8]>) -> Result<(), FixError> {
        let mut msg = self.base_message(msg_type::HEARTBEAT);
        if let Some(id) = test_req_id {
            msg.append_bytes(tag::TEST_REQ_ID, id);
        }
        self.send(&msg).await
    }

    async fn request_market_data(&self) -> Result<(), FixError> {
        let base = Utc::now().timestamp();
        for (i, (fix_id, name)) in self.cfg.symbols.iter().enumerate() {
            let mut msg = self.base_message(msg_type::MARKET_DATA_REQUEST);
            msg.append_pair(tag::MD_REQ_ID, base + i as i64 + 1)
                .append_pair(tag::SUBSCRIPTION_REQUEST_TYPE, "1") // snapshot + updates
                .append_pair(tag::MARKET_DEPTH, 0) // full book
                .append_pair(tag::MD_UPDATE_TYPE, 1) // incremental
                .append_pair(tag::NO_MD_ENTRY_TYPES, 2)
                .append_pair(tag::MD_ENTRY_TYPE, "0")
                .append_pair(tag::MD_ENTRY_TYPE, "1")
                .append_pair(tag::NO_RELATED_SYM, "1")
                .append_pair(tag::SYMBOL, fix_id);
            self.send(&msg).await?;
            info!(symbol = %fix_id, instrument = %name, "market data request sent");
            sleep(self.cfg.request_pacing).await;
        }
        Ok(())
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, store: Arc<OrderBookStore>, tracked: Vec<(String, SubscriptionId)>) {
    while shared.stay_connected() {
        sleep(shared.cfg.heartbeat).await;
        if !shared.stay_connected() {
            break;
        }
        for (name, id) in &tracked {
            if let Some((bids, asks)) = store.depth(id) {
                debug!(instrument = %name, bids, asks, "forex book depth");
            }
        }
        if let Err(e) = shared.send_heartbeat(None).await {
            warn!(%e, "heartbeat send failed");
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct FixClient {
    shared: Arc<Shared>,
    store: Arc<OrderBookStore>,
    books: FixBookSet,
    tracked: Vec<(String, SubscriptionId)>,
    reader: Option<OwnedReadHalf>,
    heartbeat_task: Option<JoinHandle<()>>,
}

fn peer_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

impl FixClient {
    pub fn new(cfg: FixConfig, registry: Arc<SubscriptionRegistry>, store: Arc<OrderBookStore>) -> Self {
        let books = FixBookSet::new(&cfg.symbols, &registry);
        let tracked = cfg
            .symbols
            .iter()
            .filter_map(|(fix_id, name)| books.subscription(fix_id).map(|id| (name.clone(), id.clone())))
            .collect();
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                cfg,
                seq: AtomicU64::new(1),
                stay_connected: AtomicBool::new(false),
                peer_logged_out: AtomicBool::new(false),
                writer: Mutex::new(None),
                state,
            }),
            store,
            books,
            tracked,
            reader: None,
            heartbeat_task: None,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> { self.shared.state.subscribe() }

    pub fn state(&self) -> SessionState { *self.shared.state.borrow() }

    pub async fn connect(&mut self) -> Result<(), FixError> {
        let cfg = &self.shared.cfg;
        let addr = format!("{}:{}", cfg.host, cfg.port);
        self.shared.set_state(SessionState::Connecting);
        info!(%addr, "connecting to FIX server");

        let stream = match timeout(cfg.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(source)) => {
                error!(%addr, %source, "FIX connect failed");
                self.shared.set_state(SessionState::Disconnected);
                return Err(FixError::Connect { addr, source });
            }
            Err(_) => {
                let secs = cfg.connect_timeout.as_secs();
                error!(%addr, secs, "FIX connect timed out");
                self.shared.set_state(SessionState::Disconnected);
                return Err(FixError::Timeout { addr, secs });
            }
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        *self.shared.writer.lock().await = Some(writer);
        self.reader = Some(reader);

        self.shared.peer_logged_out.store(false, Ordering::SeqCst);
        self.shared.send_logon().await?;
        self.shared.stay_connected.store(true, Ordering::SeqCst);
        self.shared.set_state(SessionState::LoggedOn);
        self.heartbeat_task = Some(tokio::spawn(heartbeat_loop(
            self.shared.clone(),
            self.store.clone(),
            self.tracked.clone(),
        )));
        info!("FIX session established");
        Ok(())
    }

    async fn process_message(&mut self, msg: &FixMessage) -> Result<(), FixError> {
        let kind = msg
            .msg_type()
            .ok_or_else(|| FixError::Protocol("message without MsgType".into()))?;
        FIX_MESSAGES.with_label_values(&["in", kind]).inc();
        match kind {
            msg_type::HEARTBEAT => {}
            msg_type::TEST_REQUEST => {
                if let Some(id) = msg.get(tag::TEST_REQ_ID) {
                    self.shared.send_heartbeat(Some(id)).await?;
                }
            }
            msg_type::LOGOUT => {
                info!("logout received from server");
                self.shared.peer_logged_out.store(true, Ordering::SeqCst);
                self.shared.stay_connected.store(false, Ordering::SeqCst);
            }
            msg_type::MARKET_DATA_SNAPSHOT | msg_type::MARKET_DATA_INCREMENTAL => {
                let written = self.books.apply(msg, &self.store, Utc::now().timestamp());
                if written == 0 {
                    debug!(kind, "market data message touched no tracked instrument");
                }
            }
            other => debug!(msg_type = other, "ignored FIX message"),
        }
        Ok(())
    }

    /// Parse and handle every complete message at the front of `buffer`.
    async fn drain(&mut self, buffer: &mut Vec<u8>) -> Result<usize, FixError> {
        let mut handled = 0;
        while !buffer.is_empty() {
            let Some(msg) = fix_codec::parse(buffer)? else { break };
            let consumed = msg.encode().len();
            if consumed <= buffer.len() {
                buffer.drain(..consumed);
            } else {
                warn!(consumed, buffered = buffer.len(), "message length issue, clearing buffer");
                buffer.clear();
            }
            self.process_message(&msg).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Receive loop. Returns `Ok` after a logout, `ConnectionClosed` when the
    /// peer goes away. `first_read` is signalled once data has arrived.
    pub async fn listen(&mut self, first_read: &Notify) -> Result<(), FixError> {
        let mut reader = self.reader.take().ok_or(FixError::NotConnected)?;
        let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK * 2);
        let mut chunk = [0u8; READ_CHUNK];
        let mut announced = false;

        let outcome = loop {
            if !self.shared.stay_connected() {
                break Ok(());
            }
            let n = match reader.read(&mut chunk).await {
                Ok(0) => {
                    warn!("connection closed by server");
                    self.shared.stay_connected.store(false, Ordering::SeqCst);
                    break Err(FixError::ConnectionClosed);
                }
                Ok(n) => n,
                Err(e) if peer_closed(&e) => {
                    warn!(%e, "connection closed by server");
                    self.shared.stay_connected.store(false, Ordering::SeqCst);
                    break Err(FixError::ConnectionClosed);
                }
                Err(e) => {
                    error!(%e, "error in listen loop");
                    sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };
            buffer.extend_from_slice(&chunk[..n]);

            if let Err(e) = self.drain(&mut buffer).await {
                error!(%e, "error in listen loop");
                FRAMES_DROPPED.with_label_values(&[Venue::Forex.label()]).inc();
                if matches!(e, FixError::Protocol(_)) {
                    buffer.clear();
                }
                sleep(ERROR_BACKOFF).await;
            }
            if !announced && self.shared.stay_connected() {
                announced = true;
                first_read.notify_one();
            }
        };
        self.reader = Some(reader);
        outcome
    }

    /// Cancels the heartbeat, sends logout if the socket is still writable,
    /// closes the transport. No logout goes out once the server has sent its
    /// own. Safe to call more than once.
    pub async fn disconnect(&mut self) {
        self.shared.stay_connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
            let _ = task.await;
        }
        let writer = self.shared.writer.lock().await.take();
        if let Some(mut w) = writer {
            if self.shared.peer_logged_out.load(Ordering::SeqCst) {
                debug!("server logged out, closing without reply");
            } else {
                let logout = self.shared.base_message(msg_type::LOGOUT);
                match Shared::write_to(&mut w, &logout).await {
                    Ok(()) => info!("logout sent"),
                    Err(e) => debug!(%e, "logout not sent"),
                }
            }
            let _ = w.shutdown().await;
        }
        self.reader = None;
        if self.state() != SessionState::Closed {
            self.shared.set_state(SessionState::Closed);
            info!("disconnected from FIX server");
        }
    }

    /// Full session: connect, listen, request market data after the first
    /// read, run until logout / peer close / shutdown, then disconnect.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), FixError> {
        self.connect().await?;

        let first_read = Arc::new(Notify::new());
        let requester = {
            let shared = self.shared.clone();
            let first_read = first_read.clone();
            tokio::spawn(async move {
                first_read.notified().await;
                if let Err(e) = shared.request_market_data().await {
                    warn!(%e, "market data request failed");
                }
            })
        };

        let outcome = tokio::select! {
            r = self.listen(&first_read) => r,
            _ = shutdown.changed() => {
                info!("FIX client shutting down");
                Ok(())
            }
        };
        requester.abort();
        self.disconnect().await;
        outcome
    }
}

/// Log every session transition until shutdown or until the client is gone.
pub async fn log_state_changes(
    mut state: watch::Receiver<SessionState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::convert::Infallible> {
    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let s = *state.borrow_and_update();
                info!(state = ?s, connected = s.is_logged_on(), "FIX session state");
            }
            _ = shutdown.changed() => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_cfg(port: u16) -> FixConfig {
        FixConfig {
            host: "127.0.0.1".into(),
            port,
            sender_comp_id: "demo.ctrader.1".into(),
            target_comp_id: "cServer".into(),
            sender_sub_id: Some("QUOTE".into()),
            target_sub_id: Some("QUOTE".into()),
            username: "1".into(),
            password: "secret".into(),
            heartbeat: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
            request_pacing: Duration::from_millis(1),
            symbols: vec![("1678".into(), "EURUSD".into()), ("1718".into(), "XAUUSD".into())],
        }
    }

    fn client(port: u16) -> (FixClient, Arc<SubscriptionRegistry>, Arc<OrderBookStore>) {
        let reg = Arc::new(SubscriptionRegistry::new());
        let store = Arc::new(OrderBookStore::new());
        (FixClient::new(test_cfg(port), reg.clone(), store.clone()), reg, store)
    }

    async fn read_msg(stream: &mut TcpStream, buf: &mut Vec<u8>) -> FixMessage {
        loop {
            if let Some(msg) = fix_codec::parse(buf).unwrap() {
                let n = msg.encode().len();
                buf.drain(..n);
                return msg;
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed the socket");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn server_msg(kind: &str) -> FixMessage {
        let mut m = FixMessage::new();
        m.append_pair(tag::MSG_TYPE, kind)
            .append_pair(tag::SENDER_COMP_ID, "cServer")
            .append_pair(tag::TARGET_COMP_ID, "demo.ctrader.1")
            .append_pair(tag::MSG_SEQ_NUM, 1)
            .append_pair(tag::SENDING_TIME, "20250320-10:00:00.000");
        m
    }

    fn snapshot(symbol: &str, entries: &[(&str, &str, &str)]) -> FixMessage {
        let mut m = server_msg(msg_type::MARKET_DATA_SNAPSHOT);
        m.append_pair(tag::SYMBOL, symbol).append_pair(tag::NO_MD_ENTRIES, entries.len());
        for (kind, px, size) in entries {
            m.append_pair(tag::MD_ENTRY_TYPE, kind)
                .append_pair(tag::MD_ENTRY_PX, px)
                .append_pair(tag::MD_ENTRY_SIZE, size);
        }
        m
    }

    fn incremental(entries: &[(&str, &str, &str, &str)]) -> FixMessage {
        let mut m = server_msg(msg_type::MARKET_DATA_INCREMENTAL);
        m.append_pair(tag::NO_MD_ENTRIES, entries.len());
        for (symbol, kind, px, size) in entries {
            m.append_pair(tag::MD_UPDATE_ACTION, 0)
                .append_pair(tag::MD_ENTRY_TYPE, kind)
                .append_pair(tag::SYMBOL, symbol)
                .append_pair(tag::MD_ENTRY_PX, px)
                .append_pair(tag::MD_ENTRY_SIZE, size);
        }
        m
    }

    #[test]
    fn incremental_with_known_volume_updates_in_place() {
        let reg = SubscriptionRegistry::new();
        let store = OrderBookStore::new();
        let mut books = FixBookSet::new(&test_cfg(0).symbols, &reg);

        let snap = snapshot("1678", &[("0", "1.0810", "1000000"), ("1", "1.0812", "1000000"), ("1", "1.0813", "3000000")]);
        assert_eq!(books.apply(&snap, &store, 100), 1);
        let upd = incremental(&[("1678", "1", "1.0815", "1000000"), ("1678", "0", "1.0809", "2000000")]);
        assert_eq!(books.apply(&upd, &store, 101), 1);

        let book = store.book_for(&reg, "EURUSD").unwrap();
        assert_eq!(book.timestamp, 101);
        assert_eq!(book.asks, vec![
            PriceLevel { price: 1.0815, volume: 1_000_000.0 },
            PriceLevel { price: 1.0813, volume: 3_000_000.0 },
        ]);
        assert_eq!(book.bids, vec![
            PriceLevel { price: 1.0810, volume: 1_000_000.0 },
            PriceLevel { price: 1.0809, volume: 2_000_000.0 },
        ]);
    }

    #[test]
    fn untracked_symbols_and_bad_entries_are_skipped() {
        let reg = SubscriptionRegistry::new();
        let store = OrderBookStore::new();
        let mut books = FixBookSet::new(&test_cfg(0).symbols, &reg);

        let upd = incremental(&[("9999", "0", "1.0", "1"), ("1718", "0", "oops", "1"), ("1718", "2", "2650.1", "5")]);
        assert_eq!(books.apply(&upd, &store, 1), 0);
        assert_eq!(store.len(), 0);
        assert!(books.apply(&server_msg(msg_type::MARKET_DATA_SNAPSHOT), &store, 1) == 0);
    }

    #[tokio::test]
    async fn logon_carries_session_fields() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut fix, _, _) = client(port);

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            read_msg(&mut sock, &mut buf).await
        });
        fix.connect().await.unwrap();
        assert!(fix.state().is_logged_on());

        let logon = server.await.unwrap();
        assert_eq!(logon.begin_string(), "FIX.4.4");
        assert_eq!(logon.msg_type(), Some("A"));
        assert_eq!(logon.get_str(tag::MSG_SEQ_NUM), Some("1"));
        assert_eq!(logon.get_str(tag::SENDER_SUB_ID), Some("QUOTE"));
        assert_eq!(logon.get_str(tag::TARGET_SUB_ID), Some("QUOTE"));
        assert_eq!(logon.get_str(tag::ENCRYPT_METHOD), Some("0"));
        assert_eq!(logon.get_str(tag::HEART_BT_INT), Some("30"));
        assert_eq!(logon.get_str(tag::RESET_SEQ_NUM_FLAG), Some("Y"));
        assert_eq!(logon.get_str(tag::USERNAME), Some("1"));
        assert_eq!(logon.get_str(tag::PASSWORD), Some("secret"));
        fix.disconnect().await;
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let (mut fix, _, _) = client(port);
        let err = fix.connect().await.unwrap_err();
        assert!(matches!(err, FixError::Connect { .. } | FixError::Timeout { .. }), "{err}");
        assert_eq!(fix.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn session_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (fix, reg, store) = client(port);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            assert_eq!(read_msg(&mut sock, &mut buf).await.msg_type(), Some("A"));

            // test request split across two writes exercises buffering
            let mut tr = server_msg(msg_type::TEST_REQUEST);
            tr.append_pair(tag::TEST_REQ_ID, "TR-42");
            let bytes = tr.encode();
            sock.write_all(&bytes[..10]).await.unwrap();
            sock.flush().await.unwrap();
            sleep(Duration::from_millis(20)).await;
            sock.write_all(&bytes[10..]).await.unwrap();

            // two market data requests and the heartbeat reply, in any order
            let mut requested = Vec::new();
            let mut reply = None;
            while requested.len() < 2 || reply.is_none() {
                let m = read_msg(&mut sock, &mut buf).await;
                match m.msg_type() {
                    Some("V") => requested.push(m.get_str(tag::SYMBOL).unwrap().to_string()),
                    Some("0") => reply = m.get_str(tag::TEST_REQ_ID).map(str::to_string),
                    other => panic!("unexpected {other:?}"),
                }
            }

            // snapshot + incremental back to back in one write
            let mut burst = snapshot("1718", &[("0", "2650.10", "5"), ("1", "2650.40", "5")]).encode();
            burst.extend(incremental(&[("1718", "0", "2650.20", "5")]).encode());
            sock.write_all(&burst).await.unwrap();

            sock.write_all(&server_msg(msg_type::LOGOUT).encode()).await.unwrap();
            sock.read_to_end(&mut buf).await.unwrap();
            (requested, reply, buf)
        });

        let outcome = fix.run(shutdown_rx).await;
        assert!(outcome.is_ok(), "{outcome:?}");

        let (requested, reply, trailing) = server.await.unwrap();
        assert_eq!(requested, vec!["1678".to_string(), "1718".to_string()]);
        assert_eq!(reply.as_deref(), Some("TR-42"));
        // logout from the server ends the session without a reply
        assert!(trailing.is_empty(), "{:?}", String::from_utf8_lossy(&trailing));

        let gold = store.book_for(&reg, "XAUUSD").unwrap();
        assert_eq!(gold.bids, vec![PriceLevel { price: 2650.20, volume: 5.0 }]);
        assert_eq!(gold.asks, vec![PriceLevel { price: 2650.40, volume: 5.0 }]);
    }

    fn kinds_of(mut raw: Vec<u8>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Some(m) = fix_codec::parse(&raw).unwrap() {
            raw.drain(..m.encode().len());
            kinds.push(m.msg_type().unwrap().to_string());
        }
        assert!(raw.is_empty(), "trailing bytes: {raw:?}");
        kinds
    }

    #[tokio::test]
    async fn server_logout_gets_no_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (fix, _, _) = client(port);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&server_msg(msg_type::LOGOUT).encode()).await.unwrap();
            let mut all = Vec::new();
            sock.read_to_end(&mut all).await.unwrap();
            kinds_of(all)
        });

        assert!(fix.run(shutdown_rx).await.is_ok());
        assert_eq!(server.await.unwrap(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn heartbeats_flow_until_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut cfg = test_cfg(port);
        cfg.heartbeat = Duration::from_millis(50);
        let mut fix = FixClient::new(cfg, Arc::new(SubscriptionRegistry::new()), Arc::new(OrderBookStore::new()));
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            assert_eq!(read_msg(&mut sock, &mut buf).await.msg_type(), Some("A"));
            for _ in 0..3 {
                let hb = read_msg(&mut sock, &mut buf).await;
                assert_eq!(hb.msg_type(), Some("0"));
                assert_eq!(hb.get(tag::TEST_REQ_ID), None);
            }
            seen_tx.send(()).unwrap();
            sock.read_to_end(&mut buf).await.unwrap();
            kinds_of(buf)
        });

        fix.connect().await.unwrap();
        seen_rx.await.unwrap();
        fix.disconnect().await;

        // a heartbeat already in flight may precede the logout, nothing follows it
        let tail = server.await.unwrap();
        let (last, before) = tail.split_last().unwrap();
        assert_eq!(last, "5");
        assert!(before.iter().all(|k| k == "0"), "{tail:?}");
    }

    #[tokio::test]
    async fn listen_recovers_after_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (fix, _, _) = client(port);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            assert_eq!(read_msg(&mut sock, &mut buf).await.msg_type(), Some("A"));

            sock.write_all(b"garbage\x01not fix at all\x01").await.unwrap();
            sleep(ERROR_BACKOFF + Duration::from_millis(200)).await;

            let mut tr = server_msg(msg_type::TEST_REQUEST);
            tr.append_pair(tag::TEST_REQ_ID, "X");
            sock.write_all(&tr.encode()).await.unwrap();

            let reply = loop {
                let m = read_msg(&mut sock, &mut buf).await;
                if m.msg_type() == Some("0") {
                    break m;
                }
            };
            sock.write_all(&server_msg(msg_type::LOGOUT).encode()).await.unwrap();
            reply.get_str(tag::TEST_REQ_ID).map(str::to_string)
        });

        assert!(fix.run(shutdown_rx).await.is_ok());
        assert_eq!(server.await.unwrap().as_deref(), Some("X"));
    }

    #[tokio::test]
    async fn peer_close_ends_listen() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut fix, _, _) = client(port);

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            read_msg(&mut sock, &mut buf).await;
            drop(sock);
        });
        fix.connect().await.unwrap();
        server.await.unwrap();

        let notify = Notify::new();
        let err = fix.listen(&notify).await.unwrap_err();
        assert!(matches!(err, FixError::ConnectionClosed));
        fix.disconnect().await;
        assert_eq!(fix.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut fix, _, _) = client(port);

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut all = Vec::new();
            sock.read_to_end(&mut all).await.unwrap();
            kinds_of(all)
        });
        fix.connect().await.unwrap();
        fix.disconnect().await;
        fix.disconnect().await;

        assert_eq!(server.await.unwrap(), vec!["A".to_string(), "5".to_string()]);
        assert_eq!(fix.state(), SessionState::Closed);
        assert!(matches!(fix.shared.request_market_data().await, Err(FixError::NotConnected)));
    }

    #[tokio::test]
    async fn state_changes_are_published() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut fix, _, _) = client(port);
        let mut state = fix.subscribe_state();
        assert_eq!(*state.borrow(), SessionState::Disconnected);

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut all = Vec::new();
            sock.read_to_end(&mut all).await.unwrap();
        });
        fix.connect().await.unwrap();
        assert!(state.has_changed().unwrap());
        assert!(state.borrow_and_update().is_logged_on());

        fix.disconnect().await;
        assert_eq!(*state.borrow_and_update(), SessionState::Closed);
        server.await.unwrap();

        // the logger drains the last transition and stops once the client is gone
        let (_stop_tx, stop) = watch::channel(false);
        let logger = tokio::spawn(log_state_changes(fix.subscribe_state(), stop));
        drop(fix);
        tokio::time::timeout(Duration::from_secs(1), logger).await.unwrap().unwrap().unwrap();
    }
}
