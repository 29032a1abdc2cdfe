// ===============================
// src/config.rs
// ===============================
//
// Startup configuration: CLI flags (with env fallback, `.env` loaded first),
// the venue credential file and the instrument universe. Any failure here is
// fatal. The spread sheet is runtime input and is re-read every cycle.
//
use ahash::AHashMap as HashMap;
use chrono::NaiveDateTime;
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::calculator::{DepthPolicy, FeatureLotTable, SpreadSheet};
use crate::contract_code::{is_generic_code, ContractCodeError, ContractCodeResolver};
use crate::fix_session::FixConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}: neither STOCKS nor FEATURES_FOREX lists any instrument")]
    EmptyUniverse(PathBuf),
    #[error("universe entry: {0}")]
    ContractCode(#[from] ContractCodeError),
}

#[derive(Debug, Clone, Parser)]
#[command(name = "spread_screener", version, about = "Cross-venue spread screener")]
pub struct Args {
    /// Venue credentials (SenderCompID, Username, Password, AlorRefresh)
    #[arg(long, env = "CREDENTIALS_FILE", default_value = "config.json")]
    pub credentials: PathBuf,

    /// Instrument universe (STOCKS, FEATURES_FOREX, ...)
    #[arg(long, env = "ASSETS_FILE", default_value = "assets.json")]
    pub assets: PathBuf,

    /// Spread sheet, re-read and rewritten every cycle
    #[arg(long, env = "ORDERS_FILE", default_value = "orders.json")]
    pub orders: PathBuf,

    #[arg(long, env = "EXCHANGE_WS_URL", default_value = "wss://api.alor.ru/ws")]
    pub exchange_ws_url: String,

    #[arg(long, env = "OAUTH_URL", default_value = "https://oauth.alor.ru")]
    pub oauth_url: String,

    #[arg(long, env = "FIX_HOST", default_value = "live-uk-eqx-02.p.ctrader.com")]
    pub fix_host: String,

    #[arg(long, env = "FIX_PORT", default_value_t = 5201)]
    pub fix_port: u16,

    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Calculation cycle period
    #[arg(long, env = "POLL_MS", default_value_t = 1000)]
    pub poll_ms: u64,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    /// Used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Best-price selection: `top` or `walk`
    #[arg(long, env = "DEPTH_POLICY", default_value = "top")]
    pub depth_policy: DepthPolicy,
}

impl Args {
    /// `.env` first, so its values back the `env = ...` fallbacks.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        Args::parse()
    }

    pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_ms.max(1)) }

    pub fn fix_config(&self, creds: &Credentials, universe: &Universe) -> FixConfig {
        FixConfig {
            host: self.fix_host.clone(),
            port: self.fix_port,
            sender_comp_id: creds.sender_comp_id.clone(),
            target_comp_id: creds.target_comp_id.clone(),
            sender_sub_id: Some(creds.sender_sub_id.clone()),
            target_sub_id: Some(creds.target_sub_id.clone()),
            username: creds.username.clone(),
            password: creds.password.clone(),
            heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
            connect_timeout: Duration::from_secs(10),
            request_pacing: Duration::from_millis(100),
            symbols: universe.forex_symbols(),
        }
    }
}

fn default_target() -> String { "cServer".into() }
fn default_sub_id() -> String { "QUOTE".into() }

#[derive(Clone, Deserialize)]
pub struct Credentials {
    #[serde(rename = "SenderCompID")]
    pub sender_comp_id: String,
    #[serde(rename = "TargetCompID", default = "default_target")]
    pub target_comp_id: String,
    #[serde(rename = "SenderSubID", default = "default_sub_id")]
    pub sender_sub_id: String,
    #[serde(rename = "TargetSubID", default = "default_sub_id")]
    pub target_sub_id: String,
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "AlorRefresh")]
    pub refresh_token: String,
}

// secrets stay out of logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("sender_comp_id", &self.sender_comp_id)
            .field("target_comp_id", &self.target_comp_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// `{"ED1!/EURUSD": {"ED1!": 1000, "EURUSD": 100000}, ...}`
pub type PairLots = BTreeMap<String, BTreeMap<String, f64>>;

fn default_subst() -> BTreeMap<String, String> {
    [("SV", "SILV"), ("GD", "GOLD"), ("NA", "NASD"), ("SF", "SPYF"), ("PT", "PLT"), ("PD", "PLD")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn default_fix_symbols() -> BTreeMap<String, String> {
    [
        ("1678", "EURUSD"),
        ("1718", "XAUUSD"),
        ("1719", "XAGUSD"),
        ("1766", "XPDUSD"),
        ("1767", "XPTUSD"),
        ("1786", "SP500USD"),
        ("1787", "NAS100USD"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Universe {
    /// `"TATN-TATNP"` share pairs
    #[serde(rename = "STOCKS", default)]
    pub stocks: Vec<String>,
    #[serde(rename = "FEATURES_FOREX", default)]
    pub features_forex: PairLots,
    #[serde(rename = "FEATURES_PROP", default)]
    pub features_prop: PairLots,
    #[serde(rename = "FEATURES_PROP_STOCKS", default)]
    pub features_prop_stocks: PairLots,
    #[serde(rename = "FEATURES_SUBST", default = "default_subst")]
    pub subst: BTreeMap<String, String>,
    /// FIX numeric symbol id -> instrument name
    #[serde(rename = "FIX_SYMBOLS", default = "default_fix_symbols")]
    pub fix_symbols: BTreeMap<String, String>,
}

impl Universe {
    pub fn resolver(&self) -> ContractCodeResolver {
        ContractCodeResolver::new(self.subst.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<HashMap<_, _>>())
    }

    /// Exchange subscription codes: both legs of every share pair, then the
    /// futures legs resolved to the contract listed at `now`. Non-futures
    /// legs of the prop tables trade on the exchange too; those of
    /// `FEATURES_FOREX` belong to the FIX venue.
    pub fn exchange_symbols(&self, now: NaiveDateTime) -> Result<Vec<String>, ConfigError> {
        let resolver = self.resolver();
        let mut out: Vec<String> = Vec::new();
        let mut push = |code: String| {
            if !out.contains(&code) {
                out.push(code);
            }
        };

        for pair in &self.stocks {
            pair.split('-').map(str::trim).filter(|s| !s.is_empty()).for_each(|s| push(s.to_string()));
        }
        let tables = [(&self.features_forex, false), (&self.features_prop, true), (&self.features_prop_stocks, true)];
        for (table, plain_legs_on_exchange) in tables {
            for pair in table.keys() {
                for leg in pair.split('/').map(str::trim).filter(|s| !s.is_empty()) {
                    if is_generic_code(leg) {
                        push(resolver.resolve_at(leg, now)?);
                    } else if plain_legs_on_exchange {
                        push(leg.to_string());
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn forex_symbols(&self) -> Vec<(String, String)> {
        self.fix_symbols.iter().map(|(id, name)| (id.clone(), name.clone())).collect()
    }

    /// Every `{leg -> multiplier}` map flattened; a later table wins on clashes.
    pub fn lot_table(&self) -> FeatureLotTable {
        let mut lots = FeatureLotTable::new();
        for table in [&self.features_prop_stocks, &self.features_prop, &self.features_forex] {
            for legs in table.values() {
                for (leg, mult) in legs {
                    lots.insert(leg.clone(), *mult);
                }
            }
        }
        lots
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.into(), source })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Json { path: path.into(), source })
}

pub fn load_credentials(path: &Path) -> Result<Credentials, ConfigError> { read_json(path) }

pub fn load_universe(path: &Path) -> Result<Universe, ConfigError> {
    let universe: Universe = read_json(path)?;
    if universe.stocks.is_empty() && universe.features_forex.is_empty() {
        return Err(ConfigError::EmptyUniverse(path.into()));
    }
    Ok(universe)
}

pub fn load_sheet(path: &Path) -> Result<SpreadSheet, ConfigError> { read_json(path) }

/// Write through a sibling temp file so a reader never sees half a sheet.
pub fn store_sheet(path: &Path, sheet: &SpreadSheet) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write { path: path.into(), source };
    let body = serde_json::to_vec_pretty(sheet).map_err(|e| write_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)
}
