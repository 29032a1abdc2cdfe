// ===============================
// src/calculator.rs
// ===============================
//
// Spread evaluation over the live books.
//
// Each sheet row is a two-leg position. Per cycle a row is computed into a
// scratch copy and committed only when every step succeeds; a failing row keeps
// the fields it had before. Input fields (lots, prices, exit) are never
// rewritten, so running a cycle twice on unchanged books is a no-op.
//
use ahash::AHashMap as HashMap;
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::contract_code::{ContractCodeError, ContractCodeResolver};
use crate::domain::{BookSide, PriceLevel};
use crate::metrics::{CALC_CYCLES, CALC_ERRORS, SPREAD_CUR_AV, SPREAD_MC, SPREAD_PROFIT};
use crate::registry::SubscriptionRegistry;
use crate::store::OrderBookStore;

pub const DEFAULT_SLOTS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// `A-B`: both legs are exchange shares; averages are differences.
    StockStock,
    /// `A/B`: exchange leg against a futures leg; averages are ratios.
    StockFuture,
    /// `FUT1!/XXXUSD`: exchange futures against a forex instrument.
    FutureForex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpreadLegs {
    pub first: String,
    pub second: String,
    pub regime: Regime,
}

/// The only place a regime is derived from an asset string.
pub fn classify(asset: &str) -> Option<SpreadLegs> {
    let asset = asset.trim();
    let (regime, sep) = if asset.ends_with("USD") {
        (Regime::FutureForex, '/')
    } else if asset.contains('/') {
        (Regime::StockFuture, '/')
    } else if asset.contains('-') {
        (Regime::StockStock, '-')
    } else {
        return None;
    };
    let (first, second) = asset.split_once(sep)?;
    let (first, second) = (first.trim(), second.trim());
    if first.is_empty() || second.is_empty() {
        return None;
    }
    Some(SpreadLegs { first: first.to_string(), second: second.to_string(), regime })
}

#[derive(Debug, Error, PartialEq)]
pub enum CalcError {
    #[error("no lot multiplier for leg `{0}`")]
    MissingMultiplier(String),
    #[error(transparent)]
    ContractCode(#[from] ContractCodeError),
}

/// Lenient numeric read of a sheet cell: anything unparsable is `0.0`.
pub fn safe_float(s: &str) -> f64 {
    match s.trim().replace(',', ".").parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

/// Round to `digits` decimals, halves to even.
pub fn round_to(v: f64, digits: i32) -> f64 {
    let k = 10f64.powi(digits);
    (v * k).round_ties_even() / k
}

fn text_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    })
}

fn optional_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse().ok(),
        _ => None,
    })
}

/// One sheet row. Inputs stay text the way the sheet holds them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpreadOrder {
    #[serde(deserialize_with = "text_or_number")]
    pub asset: String,
    #[serde(deserialize_with = "text_or_number")]
    pub lot1: String,
    #[serde(deserialize_with = "text_or_number")]
    pub price1: String,
    #[serde(deserialize_with = "text_or_number")]
    pub lot2: String,
    #[serde(deserialize_with = "text_or_number")]
    pub price2: String,
    #[serde(deserialize_with = "text_or_number")]
    pub exit: String,

    #[serde(deserialize_with = "optional_number")]
    pub ent_av: Option<f64>,
    #[serde(deserialize_with = "optional_number")]
    pub cur_av: Option<f64>,
    #[serde(deserialize_with = "optional_number")]
    pub cur_price1: Option<f64>,
    #[serde(deserialize_with = "optional_number")]
    pub cur_price2: Option<f64>,
    #[serde(deserialize_with = "optional_number")]
    pub position1: Option<f64>,
    #[serde(deserialize_with = "optional_number")]
    pub position2: Option<f64>,
    #[serde(deserialize_with = "optional_number")]
    pub mc: Option<f64>,
    #[serde(deserialize_with = "optional_number")]
    pub profit: Option<f64>,
}

impl SpreadOrder {
    pub fn is_active(&self) -> bool { safe_float(&self.lot1) != 0.0 || safe_float(&self.lot2) != 0.0 }

    fn clear_computed(&mut self) {
        self.ent_av = None;
        self.cur_av = None;
        self.profit = None;
        self.mc = None;
    }
}

fn default_orders() -> Vec<SpreadOrder> { vec![SpreadOrder::default(); DEFAULT_SLOTS] }

/// The externally edited sheet: market parameters plus spread rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadSheet {
    #[serde(default, deserialize_with = "text_or_number")]
    pub usdrub: String,
    #[serde(default, deserialize_with = "text_or_number")]
    pub payout: String,
    #[serde(default, deserialize_with = "text_or_number")]
    pub mc_stocks: String,
    #[serde(default, deserialize_with = "text_or_number")]
    pub mc_features: String,
    #[serde(default = "default_orders")]
    pub orders: Vec<SpreadOrder>,
}

impl Default for SpreadSheet {
    fn default() -> Self {
        Self {
            usdrub: String::new(),
            payout: String::new(),
            mc_stocks: String::new(),
            mc_features: String::new(),
            orders: default_orders(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MarketParams {
    usd: f64,
    payout: f64,
    mc_stocks: f64,
    mc_features: f64,
}

impl MarketParams {
    fn from_sheet(sheet: &SpreadSheet) -> Self {
        Self {
            usd: safe_float(&sheet.usdrub),
            payout: safe_float(&sheet.payout),
            mc_stocks: safe_float(&sheet.mc_stocks),
            mc_features: safe_float(&sheet.mc_features),
        }
    }
}

/// Contract multiplier per leg symbol (`ED1!` -> 1000, `EURUSD` -> 100000).
#[derive(Debug, Clone, Default)]
pub struct FeatureLotTable(HashMap<String, f64>);

impl FeatureLotTable {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, symbol: impl Into<String>, multiplier: f64) { self.0.insert(symbol.into(), multiplier); }

    pub fn multiplier(&self, symbol: &str) -> Option<f64> { self.0.get(symbol).copied() }

    pub fn len(&self) -> usize { self.0.len() }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DepthPolicy {
    /// First level of the chosen side.
    #[default]
    TopOfBook,
    /// First level at which cumulative volume covers `|lot|`; deepest level otherwise.
    WalkDepth,
}

impl FromStr for DepthPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "top" | "top_of_book" => Ok(DepthPolicy::TopOfBook),
            "walk" | "walk_depth" => Ok(DepthPolicy::WalkDepth),
            other => Err(format!("unknown depth policy `{other}` (top|walk)")),
        }
    }
}

pub fn best_price(levels: &[PriceLevel], lot: f64, policy: DepthPolicy) -> Option<f64> {
    match policy {
        DepthPolicy::TopOfBook => levels.first().map(|l| l.price),
        DepthPolicy::WalkDepth => {
            let want = lot.abs();
            let mut cumulative = 0.0;
            for level in levels {
                cumulative += level.volume;
                if cumulative >= want {
                    return Some(level.price);
                }
            }
            levels.last().map(|l| l.price)
        }
    }
}

/// Difference for share pairs, ratio otherwise (`x / 0` reads as 0).
fn spread_average(regime: Regime, first: f64, second: f64) -> f64 {
    match regime {
        Regime::StockStock => round_to(first - second, 2),
        Regime::StockFuture | Regime::FutureForex if second == 0.0 => 0.0,
        Regime::StockFuture | Regime::FutureForex => round_to(first / second, 5),
    }
}

fn stock_margin_call(position1: f64, position2: f64, ent_av: f64, budget: f64) -> Option<f64> {
    if position1 == 0.0 || position2 == 0.0 || ent_av == 0.0 {
        return None;
    }
    let cushion = budget / (position1.abs() + position2.abs());
    if position1 > 0.0 && position2 < 0.0 {
        Some(round_to(ent_av - cushion, 2))
    } else if position1 < 0.0 && position2 > 0.0 {
        Some(round_to(ent_av + cushion, 2))
    } else {
        None
    }
}

fn forex_margin_call(price1: f64, position1: f64, p: &MarketParams) -> Option<f64> {
    if position1 == 0.0 {
        return Some(0.0);
    }
    if price1 == 0.0 || p.usd == 0.0 || p.mc_features == 0.0 {
        return None;
    }
    let shift = p.mc_features / position1 / p.usd;
    let level = if position1 > 0.0 { price1 + shift } else { price1 - shift };
    Some(round_to(level, 2))
}

/// Everything the profit formulas read, already numeric.
struct ProfitInputs {
    regime: Regime,
    position1: f64,
    position2: f64,
    price1: f64,
    price2: f64,
    cur1: f64,
    cur2: f64,
    ent_av: f64,
    cur_av: f64,
    exit: Option<f64>,
}

fn profit(i: &ProfitInputs, p: &MarketParams) -> Option<f64> {
    let current = i.exit.unwrap_or(i.cur_av);
    let nz = |x: f64| x != 0.0;
    let by_average = nz(i.position1) && nz(i.ent_av) && nz(current);
    let by_legs = nz(i.position2) && nz(i.price1) && nz(i.price2) && nz(i.cur1) && nz(i.cur2);
    if !(by_average || by_legs) {
        return None;
    }

    match (i.regime, i.exit) {
        (Regime::StockStock, _) => {
            Some(round_to((current - i.ent_av) * i.position1 * (100.0 - p.payout) / 100.0, 2))
        }
        (Regime::FutureForex, None) => {
            let mut first = (i.cur1 - i.price1) * i.position1;
            if first > 0.0 {
                first *= round_to((100.0 - p.payout) / 100.0, 2);
            }
            let second = (i.cur2 - i.price2) * i.position2;
            Some(round_to((first + second) * p.usd, 2))
        }
        (Regime::FutureForex, Some(exit)) if exit != 0.0 => {
            let change = -(i.ent_av / exit * 100.0 - 100.0);
            Some(round_to(change * i.position1 * i.price1 / 100.0 * p.usd, 2))
        }
        (Regime::FutureForex, Some(_)) | (Regime::StockFuture, _) => None,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub computed: usize,
    pub inactive: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct ArbitrageCalculator {
    registry: Arc<SubscriptionRegistry>,
    store: Arc<OrderBookStore>,
    resolver: ContractCodeResolver,
    lots: FeatureLotTable,
    policy: DepthPolicy,
}

impl ArbitrageCalculator {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        store: Arc<OrderBookStore>,
        resolver: ContractCodeResolver,
        lots: FeatureLotTable,
        policy: DepthPolicy,
    ) -> Self {
        Self { registry, store, resolver, lots, policy }
    }

    pub fn evaluate(&self, sheet: &mut SpreadSheet) -> CycleSummary {
        self.evaluate_at(sheet, Local::now().naive_local())
    }

    /// One cycle against a fixed local time (used for contract resolution).
    pub fn evaluate_at(&self, sheet: &mut SpreadSheet, now: NaiveDateTime) -> CycleSummary {
        CALC_CYCLES.inc();
        let params = MarketParams::from_sheet(sheet);
        let mut summary = CycleSummary::default();

        for (slot, order) in sheet.orders.iter_mut().enumerate() {
            if !order.is_active() {
                order.clear_computed();
                summary.inactive += 1;
                continue;
            }
            let Some(legs) = classify(&order.asset) else {
                debug!(slot, asset = %order.asset, "unclassifiable asset, row skipped");
                summary.skipped += 1;
                continue;
            };
            match self.compute(order, &legs, &params, now) {
                Ok(done) => {
                    *order = done;
                    publish(slot, order);
                    summary.computed += 1;
                }
                Err(e) => {
                    warn!(slot, asset = %order.asset, %e, "spread calculation failed");
                    CALC_ERRORS.inc();
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    fn positions(&self, legs: &SpreadLegs, lot1: f64, lot2: f64) -> Result<(f64, f64), CalcError> {
        if legs.regime == Regime::StockStock {
            return Ok((lot1, lot2));
        }
        let mult = |leg: &str| {
            self.lots.multiplier(leg).ok_or_else(|| CalcError::MissingMultiplier(leg.to_string()))
        };
        Ok((round_to(lot1 * mult(&legs.first)?, 3), round_to(lot2 * mult(&legs.second)?, 3)))
    }

    fn leg_price(&self, symbol: &str, lot: f64) -> Option<f64> {
        let book = self.store.book_for(&self.registry, symbol)?;
        let side = if lot < 0.0 { BookSide::Ask } else { BookSide::Bid };
        best_price(book.side(side), lot, self.policy)
    }

    fn compute(
        &self,
        order: &SpreadOrder,
        legs: &SpreadLegs,
        params: &MarketParams,
        now: NaiveDateTime,
    ) -> Result<SpreadOrder, CalcError> {
        let mut out = order.clone();
        let lot1 = safe_float(&order.lot1);
        let price1 = safe_float(&order.price1);
        let lot2 = safe_float(&order.lot2);
        let price2 = safe_float(&order.price2);

        let (position1, position2) = self.positions(legs, lot1, lot2)?;
        let ent_av = spread_average(legs.regime, price1, price2);

        // no entry prices: a single-leg holding priced from the second lot
        let (side1, side2) = if price1 == 0.0 && price2 == 0.0 { (-lot2, -lot2) } else { (lot1, lot2) };

        let first_symbol = match legs.regime {
            Regime::FutureForex => self.resolver.resolve_at(&legs.first, now)?,
            Regime::StockStock | Regime::StockFuture => legs.first.clone(),
        };
        let cur1 = self.leg_price(&first_symbol, side1);
        let cur2 = self.leg_price(&legs.second, side2);
        let cur_av = spread_average(legs.regime, cur1.unwrap_or(0.0), cur2.unwrap_or(0.0));

        out.position1 = Some(position1);
        out.position2 = Some(position2);
        out.ent_av = Some(ent_av);
        out.cur_price1 = cur1;
        out.cur_price2 = cur2;
        out.cur_av = Some(cur_av);

        let mc = match legs.regime {
            Regime::StockStock => stock_margin_call(position1, position2, ent_av, params.mc_stocks),
            Regime::FutureForex => forex_margin_call(price1, position1, params),
            Regime::StockFuture => None,
        };
        if mc.is_some() {
            out.mc = mc;
        }

        let exit = (!order.exit.trim().is_empty()).then(|| safe_float(&order.exit));
        out.profit = profit(
            &ProfitInputs {
                regime: legs.regime,
                position1,
                position2,
                price1,
                price2,
                cur1: cur1.unwrap_or(0.0),
                cur2: cur2.unwrap_or(0.0),
                ent_av,
                cur_av,
                exit,
            },
            params,
        );
        Ok(out)
    }
}

fn publish(slot: usize, order: &SpreadOrder) {
    let slot = slot.to_string();
    let labels = [slot.as_str(), order.asset.as_str()];
    if let Some(v) = order.cur_av {
        SPREAD_CUR_AV.with_label_values(&labels).set(v);
    }
    if let Some(v) = order.profit {
        SPREAD_PROFIT.with_label_values(&labels).set(v);
    }
    if let Some(v) = order.mc {
        SPREAD_MC.with_label_values(&labels).set(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderBook;
    use chrono::NaiveDate;

    fn lvl(price: f64, volume: f64) -> PriceLevel { PriceLevel { price, volume } }

    fn march_10() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap().and_hms_opt(12, 0, 0).unwrap()
    }

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        store: Arc<OrderBookStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self { registry: Arc::new(SubscriptionRegistry::new()), store: Arc::new(OrderBookStore::new()) }
        }

        fn book(&self, symbol: &str, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) {
            let id = self.registry.generate(symbol);
            self.store.replace(OrderBook { instrument_id: id, bids, asks, timestamp: 1 });
        }

        fn calculator(&self, policy: DepthPolicy) -> ArbitrageCalculator {
            let mut lots = FeatureLotTable::new();
            lots.insert("ED1!", 1000.0);
            lots.insert("EURUSD", 100000.0);
            ArbitrageCalculator::new(
                self.registry.clone(),
                self.store.clone(),
                ContractCodeResolver::default(),
                lots,
                policy,
            )
        }
    }

    fn row(asset: &str, lot1: &str, price1: &str, lot2: &str, price2: &str) -> SpreadOrder {
        SpreadOrder {
            asset: asset.into(),
            lot1: lot1.into(),
            price1: price1.into(),
            lot2: lot2.into(),
            price2: price2.into(),
            ..Default::default()
        }
    }

    fn sheet(orders: Vec<SpreadOrder>) -> SpreadSheet {
        SpreadSheet {
            usdrub: "83.45".into(),
            payout: "0".into(),
            mc_stocks: "591".into(),
            mc_features: "236000".into(),
            orders,
        }
    }

    #[test]
    fn classifies_by_shape() {
        assert_eq!(classify("TATN-TATNP").unwrap().regime, Regime::StockStock);
        let ff = classify("ED1!/EURUSD").unwrap();
        assert_eq!(ff.regime, Regime::FutureForex);
        assert_eq!((ff.first.as_str(), ff.second.as_str()), ("ED1!", "EURUSD"));
        assert_eq!(classify("SV1!/SILVFUT").unwrap().regime, Regime::StockFuture);
        assert_eq!(classify("TATN"), None);
        assert_eq!(classify("XAUUSD"), None);
        assert_eq!(classify("-TATNP"), None);
    }

    #[test]
    fn lenient_numbers() {
        assert_eq!(safe_float(" 12.5 "), 12.5);
        assert_eq!(safe_float("0,25"), 0.25);
        assert_eq!(safe_float(""), 0.0);
        assert_eq!(safe_float("abc"), 0.0);
        assert_eq!(safe_float("NaN"), 0.0);
    }

    #[test]
    fn depth_policies() {
        let levels = [lvl(100.0, 5.0), lvl(99.0, 10.0), lvl(98.0, 50.0)];
        assert_eq!(best_price(&levels, 12.0, DepthPolicy::TopOfBook), Some(100.0));
        assert_eq!(best_price(&levels, -12.0, DepthPolicy::WalkDepth), Some(99.0));
        assert_eq!(best_price(&levels, 5.0, DepthPolicy::WalkDepth), Some(100.0));
        assert_eq!(best_price(&levels, 500.0, DepthPolicy::WalkDepth), Some(98.0));
        assert_eq!(best_price(&[], 1.0, DepthPolicy::TopOfBook), None);
        assert_eq!("walk".parse::<DepthPolicy>(), Ok(DepthPolicy::WalkDepth));
        assert!("deep".parse::<DepthPolicy>().is_err());
    }

    #[test]
    fn stock_pair_profit() {
        let fx = Fixture::new();
        fx.book("TATN", vec![lvl(760.1, 30.0)], vec![lvl(760.4, 30.0)]);
        fx.book("TATNP", vec![lvl(714.8, 30.0)], vec![lvl(715.0, 30.0)]);
        let mut s = sheet(vec![row("TATN-TATNP", "100", "735", "-100", "715")]);

        let summary = fx.calculator(DepthPolicy::TopOfBook).evaluate_at(&mut s, march_10());
        assert_eq!(summary.computed, 1);
        let o = &s.orders[0];
        assert_eq!(o.ent_av, Some(20.0));
        // long leg sells into bids, short leg buys from asks
        assert_eq!((o.cur_price1, o.cur_price2), (Some(760.1), Some(715.0)));
        assert_eq!(o.cur_av, Some(45.1));
        assert_eq!(o.profit, Some(2510.0));
        assert_eq!(o.mc, Some(round_to(20.0 - 591.0 / 200.0, 2)));
    }

    #[test]
    fn halves_round_to_even() {
        assert_eq!(round_to(0.125, 2), 0.12);
        assert_eq!(round_to(0.375, 2), 0.38);
        assert_eq!(round_to(-0.125, 2), -0.12);
        assert_eq!(round_to(2.5, 0), 2.0);
        assert_eq!(round_to(3.5, 0), 4.0);
        assert_eq!(round_to(1.23456, 3), 1.235);
    }

    #[test]
    fn short_long_margin_call() {
        assert_eq!(stock_margin_call(-100.0, 100.0, 1.0, 591.0), Some(3.96));
        assert_eq!(stock_margin_call(100.0, 100.0, 1.0, 591.0), None);
        assert_eq!(stock_margin_call(-100.0, 100.0, 0.0, 591.0), None);
    }

    #[test]
    fn payout_discounts_stock_profit() {
        let params = MarketParams { usd: 1.0, payout: 10.0, mc_stocks: 0.0, mc_features: 0.0 };
        let inputs = ProfitInputs {
            regime: Regime::StockStock,
            position1: 100.0,
            position2: -100.0,
            price1: 735.0,
            price2: 715.0,
            cur1: 760.0,
            cur2: 715.0,
            ent_av: 20.0,
            cur_av: 45.0,
            exit: None,
        };
        assert_eq!(profit(&inputs, &params), Some(2250.0));
    }

    #[test]
    fn future_forex_row() {
        let fx = Fixture::new();
        fx.book("ED-3.25", vec![lvl(1.09, 50.0)], vec![lvl(1.091, 50.0)]);
        fx.book("EURUSD", vec![lvl(1.0868, 1e6)], vec![lvl(1.087, 1e6)]);
        let mut s = sheet(vec![row("ED1!/EURUSD", "1", "1.085", "-0.01", "1.084")]);
        s.payout = "7".into();

        fx.calculator(DepthPolicy::TopOfBook).evaluate_at(&mut s, march_10());
        let o = &s.orders[0];
        assert_eq!((o.position1, o.position2), (Some(1000.0), Some(-1000.0)));
        assert_eq!(o.ent_av, Some(1.00092));
        assert_eq!((o.cur_price1, o.cur_price2), (Some(1.09), Some(1.087)));
        assert_eq!(o.cur_av, Some(1.00276));
        assert_eq!(o.mc, Some(3.91));
        assert_eq!(o.profit, Some(137.69));

        s.orders[0].exit = "1.005".into();
        fx.calculator(DepthPolicy::TopOfBook).evaluate_at(&mut s, march_10());
        assert_eq!(s.orders[0].profit, Some(367.58));
    }

    #[test]
    fn missing_books_leave_profit_empty() {
        let fx = Fixture::new();
        let mut s = sheet(vec![row("TATN-TATNP", "100", "735", "-100", "715")]);
        fx.calculator(DepthPolicy::TopOfBook).evaluate_at(&mut s, march_10());
        let o = &s.orders[0];
        assert_eq!(o.cur_price1, None);
        assert_eq!(o.cur_av, Some(0.0));
        assert_eq!(o.profit, None);
    }

    #[test]
    fn single_leg_holding_uses_mirrored_sides() {
        let fx = Fixture::new();
        fx.book("TATN", vec![lvl(760.0, 1.0)], vec![lvl(761.0, 1.0)]);
        fx.book("TATNP", vec![lvl(714.0, 1.0)], vec![lvl(715.0, 1.0)]);
        let mut s = sheet(vec![row("TATN-TATNP", "", "", "100", "")]);

        fx.calculator(DepthPolicy::TopOfBook).evaluate_at(&mut s, march_10());
        let o = &s.orders[0];
        assert_eq!((o.cur_price1, o.cur_price2), (Some(761.0), Some(715.0)));
        // inputs are not rewritten
        assert_eq!((o.lot1.as_str(), o.lot2.as_str()), ("", "100"));
    }

    #[test]
    fn repeated_cycles_are_idempotent() {
        let fx = Fixture::new();
        fx.book("TATN", vec![lvl(760.1, 30.0)], vec![lvl(760.4, 30.0)]);
        fx.book("TATNP", vec![lvl(714.8, 30.0)], vec![lvl(715.0, 30.0)]);
        let calc = fx.calculator(DepthPolicy::TopOfBook);
        let mut s = sheet(vec![
            row("TATN-TATNP", "100", "735", "-100", "715"),
            row("TATN-TATNP", "", "", "-50", ""),
        ]);

        calc.evaluate_at(&mut s, march_10());
        let first = s.clone();
        calc.evaluate_at(&mut s, march_10());
        assert_eq!(s, first);
    }

    #[test]
    fn inactive_row_is_cleared() {
        let fx = Fixture::new();
        let mut o = row("TATN-TATNP", "0", "735", "", "715");
        o.profit = Some(1.0);
        o.mc = Some(2.0);
        o.ent_av = Some(3.0);
        o.cur_av = Some(4.0);
        let mut s = sheet(vec![o]);
        let summary = fx.calculator(DepthPolicy::TopOfBook).evaluate_at(&mut s, march_10());
        assert_eq!(summary.inactive, 1);
        let o = &s.orders[0];
        assert_eq!((o.ent_av, o.cur_av, o.profit, o.mc), (None, None, None, None));
    }

    #[test]
    fn failing_row_keeps_prior_fields() {
        let fx = Fixture::new();
        fx.book("TATN", vec![lvl(760.1, 30.0)], vec![]);
        fx.book("TATNP", vec![], vec![lvl(715.0, 30.0)]);
        let mut broken = row("GD1!/XAUUSD", "1", "3000", "-1", "2990");
        broken.profit = Some(12.5);
        broken.mc = Some(7.0);
        let mut s = sheet(vec![broken.clone(), row("TATN-TATNP", "100", "735", "-100", "715")]);

        let summary = fx.calculator(DepthPolicy::TopOfBook).evaluate_at(&mut s, march_10());
        assert_eq!(summary, CycleSummary { computed: 1, inactive: 0, skipped: 0, failed: 1 });
        assert_eq!(s.orders[0], broken);
        assert_eq!(s.orders[1].profit, Some(2510.0));
    }

    #[test]
    fn sheet_accepts_numbers_and_blanks() {
        let raw = r#"{
            "usdrub": 83.45, "payout": "7", "mc_stocks": "", "mc_features": 236000,
            "orders": [
                {"asset": "TATN-TATNP", "lot1": 100, "price1": "735", "lot2": -100, "price2": 715,
                 "exit": "", "ent_av": "", "profit": 2510.0}
            ]
        }"#;
        let s: SpreadSheet = serde_json::from_str(raw).unwrap();
        assert_eq!(s.usdrub, "83.45");
        assert_eq!(s.orders[0].lot2, "-100");
        assert_eq!(s.orders[0].ent_av, None);
        assert_eq!(s.orders[0].profit, Some(2510.0));

        let empty: SpreadSheet = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.orders.len(), DEFAULT_SLOTS);
    }
}
