use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Response body of a rates endpoint. Only `rates` is required.
#[derive(Serialize, Deserialize)]
pub struct Rates {
    #[serde(default, alias = "base_code")]
    pub base: Option<String>,
    pub rates: HashMap<String, serde_json::Value>,
}

/// Code to rate, relative to a base currency that maps to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateTable(BTreeMap<String, f64>);

impl RateTable {
    /// Builds a table for `base`, inserting the base at 1.0 when the source
    /// left it out. Returns a description of the first bad rate, if any.
    pub fn new<I, K>(base: &str, rates: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let mut map = BTreeMap::new();
        for (code, rate) in rates {
            map.insert(normalize_code(code.as_ref()), rate);
        }
        map.entry(normalize_code(base)).or_insert(1.0);

        let table = Self(map);
        table.validate(base)?;
        Ok(table)
    }

    pub fn validate(&self, base: &str) -> Result<(), String> {
        for (code, rate) in &self.0 {
            if !rate.is_finite() || *rate <= 0.0 {
                return Err(format!("rate for {} is {}", code, rate));
            }
        }
        match self.0.get(&normalize_code(base)) {
            Some(rate) if (*rate - 1.0).abs() < f64::EPSILON => Ok(()),
            Some(rate) => Err(format!("base {} maps to {} instead of 1.0", base, rate)),
            None => Err(format!("base {} missing from table", base)),
        }
    }

    pub fn get(&self, code: &str) -> Option<f64> {
        self.0.get(code).copied()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.contains_key(code)
    }

    /// Adds `code` unless present. Non-positive rates are ignored.
    pub fn insert_missing(&mut self, code: &str, rate: f64) {
        if rate.is_finite() && rate > 0.0 {
            self.0.entry(normalize_code(code)).or_insert(rate);
        }
    }

    pub fn codes(&self) -> BTreeSet<String> {
        self.0.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Re-expresses every rate relative to `base`.
    pub fn rebase(&self, base: &str) -> Option<RateTable> {
        let divisor = self.get(base)?;
        let map = self
            .0
            .iter()
            .map(|(code, rate)| {
                let rate = if code == base { 1.0 } else { rate / divisor };
                (code.clone(), rate)
            })
            .collect();
        Some(RateTable(map))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub base: String,
    pub rates: RateTable,
    pub fetched_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl CacheEntry {
    pub fn new(base: &str, rates: RateTable, ttl_seconds: u64) -> Self {
        Self {
            base: normalize_code(base),
            rates,
            fetched_at: Utc::now(),
            ttl_seconds,
        }
    }

    /// `None` when `ttl_seconds` does not fit a `chrono::Duration`.
    pub fn ttl(&self) -> Option<Duration> {
        i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(Duration::try_seconds)
    }

    /// Checks the TTL range and every rate.
    pub fn validate(&self) -> Result<(), String> {
        if self.ttl().is_none() {
            return Err(format!("ttl_seconds {} is out of range", self.ttl_seconds));
        }
        self.rates.validate(&self.base)
    }

    /// An entry with an unrepresentable TTL is always stale.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl() {
            Some(ttl) => now.signed_duration_since(self.fetched_at) > ttl,
            None => true,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSource {
    /// Fetched from a provider during this call.
    Live,
    /// Fresh cache entry.
    Cache,
    /// Expired cache entry served because a fetch was not possible.
    Stale,
    /// Built-in fallback table.
    Default,
}

/// Rate table handed to callers, with where it came from.
#[derive(Debug, Clone)]
pub struct RatesSnapshot {
    pub base: String,
    pub rates: RateTable,
    pub source: RateSource,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl RatesSnapshot {
    pub fn degraded(&self) -> bool {
        matches!(self.source, RateSource::Stale | RateSource::Default)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub from_code: String,
    pub to_code: String,
    pub amount: Decimal,
}

impl ConversionRequest {
    pub fn new(amount: Decimal, from_code: &str, to_code: &str) -> Self {
        Self {
            from_code: normalize_code(from_code),
            to_code: normalize_code(to_code),
            amount,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conversion {
    pub request: ConversionRequest,
    pub result: Decimal,
    /// Units of `to_code` per unit of `from_code`.
    pub rate: Decimal,
    pub degraded: bool,
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}
