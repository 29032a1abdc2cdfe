// ===============================
// src/metrics.rs
// ===============================
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feeds --------
pub static BOOK_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("book_updates_total", "order books replaced in the store"),
        &["venue"],
    )
    .unwrap()
});

pub static FEED_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("feed_connected", "1 while the venue session is up, 0 otherwise"),
        &["venue"],
    )
    .unwrap()
});

pub static FRAMES_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("frames_dropped_total", "undecodable inbound frames"),
        &["venue"],
    )
    .unwrap()
});

pub static FIX_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fix_messages_total", "FIX messages by direction and MsgType"),
        &["direction", "msg_type"],
    )
    .unwrap()
});

// -------- Calculator --------
pub static CALC_CYCLES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("calc_cycles_total", "spread sheet evaluations").unwrap());

pub static CALC_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("calc_errors_total", "spread rows that failed to evaluate").unwrap());

pub static SPREAD_PROFIT: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("spread_profit", "latest profit per spread row"), &["slot", "asset"]).unwrap()
});

pub static SPREAD_CUR_AV: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("spread_current_average", "current spread value per row"), &["slot", "asset"])
        .unwrap()
});

pub static SPREAD_MC: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("spread_margin_call", "margin-call level per row"), &["slot", "asset"]).unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(BOOK_UPDATES.clone())),
        REGISTRY.register(Box::new(FEED_CONNECTED.clone())),
        REGISTRY.register(Box::new(FRAMES_DROPPED.clone())),
        REGISTRY.register(Box::new(FIX_MESSAGES.clone())),
        REGISTRY.register(Box::new(CALC_CYCLES.clone())),
        REGISTRY.register(Box::new(CALC_ERRORS.clone())),
        REGISTRY.register(Box::new(SPREAD_PROFIT.clone())),
        REGISTRY.register(Box::new(SPREAD_CUR_AV.clone())),
        REGISTRY.register(Box::new(SPREAD_MC.clone())),
    ] {
        // AlreadyReg on a second init is fine
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let rsp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") | (&Method::GET, "/metrics") => Response::builder()
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()),
    };
    Ok(rsp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serve `/metrics` until `shutdown` flips. Bind failures are logged, not fatal.
pub async fn serve_metrics(port: u16, mut shutdown: watch::Receiver<bool>) -> Result<(), hyper::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let builder = match Server::try_bind(&addr) {
        Ok(b) => b,
        Err(e) => {
            error!(%e, %addr, "metrics bind failed");
            return Ok(());
        }
    };
    info!("metrics listening on http://{addr}/metrics");
    builder
        .serve(make)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
