// ===============================
// src/supervisor.rs
// ===============================
//
// Owns every long-lived task and the shutdown signal they watch.
//
use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::{
    select,
    sync::watch,
    task::{JoinError, JoinSet},
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::calculator::ArbitrageCalculator;
use crate::config::{load_sheet, store_sheet};

pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<&'static str>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub finished: usize,
    pub aborted: usize,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { shutdown, tasks: JoinSet::new() }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> { self.shutdown.subscribe() }

    pub fn len(&self) -> usize { self.tasks.len() }

    /// Run `fut` as a named task; its error is logged, never propagated.
    pub fn spawn<F, E>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        info!(task = name, "task started");
        self.tasks.spawn(async move {
            match fut.await {
                Ok(()) => info!(task = name, "task finished"),
                Err(e) => error!(task = name, %e, "task failed"),
            }
            name
        });
    }

    /// Next task to end on its own (`None` once all are gone).
    pub async fn join_next(&mut self) -> Option<&'static str> {
        loop {
            match self.tasks.join_next().await? {
                Ok(name) => return Some(name),
                Err(e) => log_join_error(&e),
            }
        }
    }

    /// Signal every task, wait up to `grace`, then abort what is left.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        info!(tasks = self.tasks.len(), "shutting down");
        self.shutdown.send_replace(true);
        let mut report = ShutdownReport::default();

        let drained = timeout(grace, async {
            while let Some(res) = self.tasks.join_next().await {
                match res {
                    Ok(_) => report.finished += 1,
                    Err(e) => log_join_error(&e),
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(left = self.tasks.len(), ?grace, "tasks still running, aborting");
            self.tasks.abort_all();
            while let Some(res) = self.tasks.join_next().await {
                match res {
                    Ok(_) => report.finished += 1,
                    Err(e) if e.is_cancelled() => report.aborted += 1,
                    Err(e) => log_join_error(&e),
                }
            }
        }
        info!(finished = report.finished, aborted = report.aborted, "shutdown complete");
        report
    }
}

impl Default for Supervisor {
    fn default() -> Self { Self::new() }
}

fn log_join_error(e: &JoinError) {
    if e.is_cancelled() {
        debug!("task cancelled");
    } else {
        error!(%e, "task panicked");
    }
}

/// Calculation cycle: every `every`, while the exchange feed is up, re-read
/// the sheet, evaluate it and write it back.
pub async fn poll_spreads(
    calc: ArbitrageCalculator,
    orders: PathBuf,
    every: Duration,
    feed_up: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::convert::Infallible> {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if !*feed_up.borrow() {
            debug!("exchange feed down, cycle skipped");
            continue;
        }
        let mut sheet = match load_sheet(&orders) {
            Ok(s) => s,
            Err(e) => {
                warn!(%e, "spread sheet unavailable, cycle skipped");
                continue;
            }
        };
        let summary = calc.evaluate(&mut sheet);
        if let Err(e) = store_sheet(&orders, &sheet) {
            warn!(%e, "spread sheet not written");
        }
        info!(
            computed = summary.computed,
            failed = summary.failed,
            skipped = summary.skipped,
            inactive = summary.inactive,
            "spread cycle"
        );
        for (slot, o) in sheet.orders.iter().enumerate().filter(|(_, o)| o.is_active()) {
            debug!(slot, asset = %o.asset, ent_av = ?o.ent_av, cur_av = ?o.cur_av, mc = ?o.mc, profit = ?o.profit, "spread");
        }
    }
    info!("spread poll loop stopped");
    Ok(())
}
