// ===============================
// src/contract_code.rs
// ===============================
//
// Generic futures root ("SV1!") -> listed quarterly contract ("SILV-6.25").
// Quarter-end months are Mar/Jun/Sep/Dec. A contract rolls over on the first
// Thursday on or after day 15 of its month, at 19:00 local.
//
use ahash::AHashMap as HashMap;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Weekday};
use thiserror::Error;

const QUARTER_ENDS: [u32; 4] = [3, 6, 9, 12];
const ROLLOVER_HOUR: u32 = 19;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractCodeError {
    #[error("invalid generic futures code `{0}` (expected <root><digit>!)")]
    Format(String),
    #[error("no calendar date {year}-{month}-01")]
    Date { year: i32, month: u32 },
}

/// `true` for codes shaped `<root><digit>!`.
pub fn is_generic_code(code: &str) -> bool {
    let mut rev = code.chars().rev();
    matches!((rev.next(), rev.next()), (Some('!'), Some(d)) if d.is_ascii_digit())
}

/// Rollover day of the contract expiring in `year`/`month`.
pub fn rollover_date(year: i32, month: u32) -> Result<NaiveDate, ContractCodeError> {
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or(ContractCodeError::Date { year, month })?;
    let mut day = first + Duration::days(14);
    while day.weekday() != Weekday::Thu {
        day += Duration::days(1);
    }
    Ok(day)
}

pub fn resolve(
    code: &str,
    subst: &HashMap<String, String>,
    now: NaiveDateTime,
) -> Result<String, ContractCodeError> {
    if !is_generic_code(code) {
        return Err(ContractCodeError::Format(code.to_string()));
    }
    // both trailing chars are ASCII, so the byte slice is on a char boundary
    let root = &code[..code.len() - 2];
    let mapped = subst.get(root).map(String::as_str).unwrap_or(root);

    let month = now.month();
    let mut year = now.year();
    let mut quarter = QUARTER_ENDS.iter().copied().find(|m| *m >= month).unwrap_or(3);
    let mut expiry = rollover_date(year, quarter)?;

    let today = now.date();
    if today > expiry || (today == expiry && now.hour() >= ROLLOVER_HOUR) {
        quarter += 3;
        if quarter > 12 {
            quarter -= 12;
            year += 1;
        }
        expiry = rollover_date(year, quarter)?;
    }

    Ok(format!("{}-{}.{:02}", mapped, expiry.month(), expiry.year().rem_euclid(100)))
}

/// Substitution table; callers pass the local wall-clock time per call.
#[derive(Debug, Clone, Default)]
pub struct ContractCodeResolver {
    subst: HashMap<String, String>,
}

impl ContractCodeResolver {
    pub fn new(subst: HashMap<String, String>) -> Self { Self { subst } }

    pub fn resolve_at(&self, code: &str, now: NaiveDateTime) -> Result<String, ContractCodeError> {
        resolve(code, &self.subst, now)
    }
}
