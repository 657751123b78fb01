//! Conversion service: lazily refreshed rates with stale and default
//! fallbacks.
//!
//! A [`Converter`] owns the on-disk [`RateStore`] and a [`RateProvider`].
//! Reads are served from the store while fresh. An expired or missing entry
//! triggers one fetch per base; concurrent callers do not wait for it and get
//! whatever the store (or the built-in table) has. Failed fetches put the base
//! into an exponential backoff so a dead endpoint is not hit on every call.

use crate::api::{ProviderChain, RateProvider};
use crate::cache::RateStore;
use crate::config::{FxConfig, DEFAULT_RATES};
use crate::error::{FxError, FxResult};
use crate::models::{
    normalize_code, CacheEntry, Conversion, ConversionRequest, RateSource, RateTable,
    RatesSnapshot,
};
use crate::money::round_amount;
use parking_lot::Mutex;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    retry_at: Instant,
}

pub struct Converter {
    config: FxConfig,
    store: RateStore,
    provider: Arc<dyn RateProvider>,
    in_flight: Mutex<HashSet<String>>,
    backoff: Mutex<HashMap<String, Backoff>>,
}

/// Clears the in-flight marker for a base when the fetch finishes or is
/// dropped.
struct FetchGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    base: String,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.base);
    }
}

impl Converter {
    pub fn new(config: FxConfig, store: RateStore, provider: Arc<dyn RateProvider>) -> Self {
        Self {
            config,
            store,
            provider,
            in_flight: Mutex::new(HashSet::new()),
            backoff: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the cache file and builds the HTTP provider chain from `config`.
    pub fn from_config(config: FxConfig) -> FxResult<Self> {
        let provider = ProviderChain::from_urls(&config.api_urls, config.timeout)?;
        let store = RateStore::open(config.cache_file.clone());
        Ok(Self::new(config, store, Arc::new(provider)))
    }

    pub fn config(&self) -> &FxConfig {
        &self.config
    }

    pub fn store(&self) -> &RateStore {
        &self.store
    }

    /// Rate table for `base`, fetched only when the cached one is missing or
    /// stale.
    pub async fn get_rates(&self, base: &str) -> FxResult<RatesSnapshot> {
        let base = normalize_code(base);
        let cached = self.store.get(&base);

        if let Some(entry) = &cached {
            if !entry.is_stale() {
                debug!(base = %base, "Cache hit");
                return Ok(snapshot(entry, RateSource::Cache));
            }
            debug!(base = %base, fetched_at = %entry.fetched_at, "Cache entry stale");
        }

        self.fetch_or_fallback(&base, cached, false).await
    }

    /// Fetches `base` ignoring freshness and backoff. Falls back like
    /// [`Converter::get_rates`] when the fetch fails.
    pub async fn refresh(&self, base: &str) -> FxResult<RatesSnapshot> {
        let base = normalize_code(base);
        let cached = self.store.get(&base);
        self.fetch_or_fallback(&base, cached, true).await
    }

    /// Converts through the configured base currency and rounds half-even to
    /// the target's minor unit. Equal codes return `amount` untouched.
    pub async fn convert(
        &self,
        amount: Decimal,
        from_code: &str,
        to_code: &str,
    ) -> FxResult<Conversion> {
        let request = ConversionRequest::new(amount, from_code, to_code);
        if request.from_code == request.to_code {
            return Ok(Conversion {
                result: request.amount,
                rate: Decimal::ONE,
                degraded: false,
                request,
            });
        }

        let snapshot = self.get_rates(&self.config.base).await?;
        let (result, rate) = convert_with_table(&snapshot.rates, &request)?;
        Ok(Conversion {
            request,
            result,
            rate,
            degraded: snapshot.degraded(),
        })
    }

    /// Codes available for the base currency without touching the network.
    pub fn list_supported(&self) -> BTreeSet<String> {
        match self.store.get(&self.config.base) {
            Some(entry) => entry.rates.codes(),
            None => default_table(&self.config.base)
                .map(|t| t.codes())
                .unwrap_or_default(),
        }
    }

    /// Base-currency rates re-expressed relative to `base`. An unknown `base`
    /// falls back to the configured base currency.
    pub async fn rates_for(&self, base: &str) -> FxResult<RatesSnapshot> {
        let requested = normalize_code(base);
        let mut snapshot = self.get_rates(&self.config.base).await?;

        if requested == snapshot.base {
            return Ok(snapshot);
        }
        match snapshot.rates.rebase(&requested) {
            Some(rates) => {
                snapshot.rates = rates;
                snapshot.base = requested;
            }
            None => {
                debug!(base = %requested, fallback = %snapshot.base, "Unknown base, keeping default")
            }
        }
        Ok(snapshot)
    }

    async fn fetch_or_fallback(
        &self,
        base: &str,
        cached: Option<CacheEntry>,
        force: bool,
    ) -> FxResult<RatesSnapshot> {
        if self.config.offline {
            debug!(base, "Offline mode, skipping fetch");
            return self.fallback(base, cached);
        }

        if !force {
            if let Some(wait) = self.backoff_remaining(base) {
                debug!(base, retry_in = ?wait, "Fetch backing off");
                return self.fallback(base, cached);
            }
        }

        let Some(_guard) = self.begin_fetch(base) else {
            debug!(base, "Fetch already in flight, serving cached rates");
            return self.fallback(base, cached);
        };

        // Another caller may have stored fresh rates since `cached` was read.
        let cached = match self.store.get(base) {
            Some(entry) if !force && !entry.is_stale() => {
                debug!(base, "Rates refreshed by another caller");
                return Ok(snapshot(&entry, RateSource::Cache));
            }
            Some(entry) => Some(entry),
            None => cached,
        };

        match self.provider.fetch_rates(base).await {
            Ok(table) => {
                self.backoff.lock().remove(base);
                let table = fill_required(base, table, cached.as_ref());
                let entry = CacheEntry::new(base, table, self.config.ttl.as_secs());
                info!(base, codes = entry.rates.len(), "Fetched exchange rates");

                if let Err(e) = self.store.put(entry.clone()) {
                    warn!(base, error = %e, "Failed to persist rate cache");
                }
                Ok(snapshot(&entry, RateSource::Live))
            }
            Err(e) => {
                let failures = self.record_failure(base);
                warn!(base, failures, error = %e, "Rate fetch failed, using fallback");
                self.fallback(base, cached)
            }
        }
    }

    fn fallback(&self, base: &str, cached: Option<CacheEntry>) -> FxResult<RatesSnapshot> {
        if let Some(entry) = cached {
            let source = if entry.is_stale() {
                RateSource::Stale
            } else {
                RateSource::Cache
            };
            return Ok(snapshot(&entry, source));
        }

        // A table for another base can still serve this one.
        if base != self.config.base {
            if let Some(entry) = self.store.get(&self.config.base) {
                if let Some(rates) = entry.rates.rebase(base) {
                    return Ok(RatesSnapshot {
                        base: base.to_string(),
                        rates,
                        source: RateSource::Stale,
                        fetched_at: Some(entry.fetched_at),
                    });
                }
            }
        }

        match default_table(base) {
            Some(rates) => {
                warn!(base, "No cached rates, serving built-in defaults");
                Ok(RatesSnapshot {
                    base: base.to_string(),
                    rates,
                    source: RateSource::Default,
                    fetched_at: None,
                })
            }
            None => Err(FxError::NoRatesAvailable(base.to_string())),
        }
    }

    fn begin_fetch(&self, base: &str) -> Option<FetchGuard<'_>> {
        if !self.in_flight.lock().insert(base.to_string()) {
            return None;
        }
        Some(FetchGuard {
            in_flight: &self.in_flight,
            base: base.to_string(),
        })
    }

    fn backoff_remaining(&self, base: &str) -> Option<Duration> {
        let backoff = self.backoff.lock();
        let state = backoff.get(base)?;
        state
            .retry_at
            .checked_duration_since(Instant::now())
            .filter(|wait| !wait.is_zero())
    }

    fn record_failure(&self, base: &str) -> u32 {
        let mut backoff = self.backoff.lock();
        let failures = backoff.get(base).map_or(0, |b| b.failures) + 1;
        let delay = backoff_delay(self.config.backoff_initial, self.config.backoff_max, failures);
        backoff.insert(
            base.to_string(),
            Backoff {
                failures,
                retry_at: Instant::now() + delay,
            },
        );
        failures
    }
}

fn snapshot(entry: &CacheEntry, source: RateSource) -> RatesSnapshot {
    RatesSnapshot {
        base: entry.base.clone(),
        rates: entry.rates.clone(),
        source,
        fetched_at: Some(entry.fetched_at),
    }
}

/// `initial * 2^(failures - 1)`, capped at `max`.
fn backoff_delay(initial: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    initial.saturating_mul(factor).min(max)
}

/// Adds the built-in codes a provider left out, taking each from the previous
/// entry for `base` or else from the built-in table.
fn fill_required(base: &str, mut table: RateTable, prior: Option<&CacheEntry>) -> RateTable {
    let Some(defaults) = default_table(base) else {
        return table;
    };

    for (code, default_rate) in defaults.iter() {
        if table.contains(code) {
            continue;
        }
        let (rate, from) = match prior.and_then(|entry| entry.rates.get(code)) {
            Some(rate) => (rate, "previous cache"),
            None => (*default_rate, "defaults"),
        };
        warn!(base, code = %code, rate, from, "Provider omitted rate, filling in");
        table.insert_missing(code, rate);
    }
    table
}

/// Built-in table rebased to `base`, if `base` is one of its codes.
pub fn default_table(base: &str) -> Option<RateTable> {
    let usd = RateTable::new("USD", DEFAULT_RATES.iter().copied()).ok()?;
    usd.rebase(base)
}

/// `amount / rate[from] * rate[to]`, rounded for `to`. Returns the result and
/// the effective rate.
pub fn convert_with_table(
    table: &RateTable,
    request: &ConversionRequest,
) -> FxResult<(Decimal, Decimal)> {
    if request.from_code == request.to_code {
        return Ok((request.amount, Decimal::ONE));
    }

    let from_rate = rate_of(table, &request.from_code)?;
    let to_rate = rate_of(table, &request.to_code)?;

    let overflow = || FxError::InvalidAmount(format!("{} is out of range", request.amount));
    let in_base = request.amount.checked_div(from_rate).ok_or_else(overflow)?;
    let result = in_base.checked_mul(to_rate).ok_or_else(overflow)?;
    let rate = to_rate.checked_div(from_rate).ok_or_else(overflow)?;

    Ok((round_amount(result, &request.to_code), rate))
}

fn rate_of(table: &RateTable, code: &str) -> FxResult<Decimal> {
    let rate = table
        .get(code)
        .ok_or_else(|| FxError::UnknownCurrency(code.to_string()))?;
    Decimal::from_f64(rate)
        .filter(|r| r.is_sign_positive() && !r.is_zero())
        .ok_or_else(|| FxError::CorruptCache(format!("rate for {} is {}", code, rate)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Counts calls and either serves `table` or fails.
    struct MockProvider {
        table: RateTable,
        fail: AtomicBool,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl MockProvider {
        fn new(rates: &[(&str, f64)]) -> Self {
            Self {
                table: RateTable::new("USD", rates.iter().copied()).unwrap(),
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                gate: None,
            }
        }

        fn failing(self) -> Self {
            self.fail.store(true, Ordering::SeqCst);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RateProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn fetch_rates(&self, base: &str) -> FxResult<RateTable> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(FxError::Network("connection refused".into()));
            }
            self.table
                .rebase(base)
                .ok_or_else(|| FxError::MalformedResponse(base.to_string()))
        }
    }

    const SAMPLE: &[(&str, f64)] = &[("USD", 1.0), ("UZS", 12700.0), ("AED", 3.67)];

    fn setup(provider: Arc<MockProvider>) -> (TempDir, Converter) {
        setup_with(provider, |_| {})
    }

    fn setup_with(
        provider: Arc<MockProvider>,
        tweak: impl FnOnce(&mut FxConfig),
    ) -> (TempDir, Converter) {
        let dir = TempDir::new().unwrap();
        let mut config = FxConfig {
            cache_file: dir.path().join("rates_cache.json"),
            ..FxConfig::default()
        };
        tweak(&mut config);
        let store = RateStore::open(config.cache_file.clone());
        (dir, Converter::new(config, store, provider))
    }

    fn seed(converter: &Converter, rates: &[(&str, f64)], age_secs: i64) -> CacheEntry {
        let table = RateTable::new("USD", rates.iter().copied()).unwrap();
        let mut entry = CacheEntry::new("USD", table, 86_400);
        entry.fetched_at = Utc::now() - ChronoDuration::seconds(age_secs);
        converter.store().put(entry.clone()).unwrap();
        entry
    }

    #[tokio::test]
    async fn test_example_conversions() {
        let provider = Arc::new(MockProvider::new(SAMPLE));
        let (_dir, converter) = setup(provider);

        let usd_uzs = converter.convert(dec!(25), "USD", "UZS").await.unwrap();
        assert_eq!(usd_uzs.result, dec!(317500.00));
        assert!(!usd_uzs.degraded);

        let aed_usd = converter.convert(dec!(100), "AED", "USD").await.unwrap();
        assert_eq!(aed_usd.result, dec!(27.25));
    }

    #[tokio::test]
    async fn test_identity_is_exact() {
        let provider = Arc::new(MockProvider::new(SAMPLE));
        let (_dir, converter) = setup(provider.clone());

        let same = converter.convert(dec!(10.005), "uzs", "UZS").await.unwrap();
        assert_eq!(same.result, dec!(10.005));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_within_tolerance() {
        let provider = Arc::new(MockProvider::new(SAMPLE));
        let (_dir, converter) = setup(provider);

        for (from, to) in [("USD", "UZS"), ("AED", "UZS"), ("USD", "AED")] {
            let there = converter.convert(dec!(123.45), from, to).await.unwrap();
            let back = converter.convert(there.result, to, from).await.unwrap();
            assert!((back.result - dec!(123.45)).abs() <= dec!(0.01), "{} -> {}", from, to);
        }
    }

    #[tokio::test]
    async fn test_unknown_currency() {
        let provider = Arc::new(MockProvider::new(SAMPLE));
        let (_dir, converter) = setup(provider);

        let err = converter.convert(dec!(10), "USD", "XXX").await.unwrap_err();
        assert!(matches!(err, FxError::UnknownCurrency(code) if code == "XXX"));
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_fetch() {
        let provider = Arc::new(MockProvider::new(SAMPLE));
        let (_dir, converter) = setup(provider.clone());
        seed(&converter, &[("UZS", 12000.0)], 60);

        let snapshot = converter.get_rates("USD").await.unwrap();
        assert_eq!(snapshot.source, RateSource::Cache);
        assert_eq!(snapshot.rates.get("UZS"), Some(12000.0));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_entry_fetches_once() {
        let provider = Arc::new(MockProvider::new(SAMPLE));
        let (_dir, converter) = setup(provider.clone());
        seed(&converter, &[("UZS", 12000.0)], 90_000);

        let first = converter.get_rates("USD").await.unwrap();
        assert_eq!(first.source, RateSource::Live);
        assert_eq!(first.rates.get("UZS"), Some(12700.0));

        for _ in 0..3 {
            converter.get_rates("USD").await.unwrap();
        }
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_serves_prior_entry_and_backs_off() {
        let provider = Arc::new(MockProvider::new(SAMPLE).failing());
        let (_dir, converter) = setup(provider.clone());
        let prior = seed(&converter, &[("UZS", 12000.0)], 90_000);

        let snapshot = converter.get_rates("USD").await.unwrap();
        assert_eq!(snapshot.source, RateSource::Stale);
        assert!(snapshot.degraded());
        assert_eq!(snapshot.rates, prior.rates);

        converter.get_rates("USD").await.unwrap();
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_defaults_without_cache() {
        let provider = Arc::new(MockProvider::new(SAMPLE).failing());
        let (_dir, converter) = setup(provider);

        let snapshot = converter.get_rates("USD").await.unwrap();
        assert_eq!(snapshot.source, RateSource::Default);
        assert_eq!(snapshot.rates.get("UZS"), Some(12600.0));

        let conversion = converter.convert(dec!(1), "USD", "AED").await.unwrap();
        assert!(conversion.degraded);
        assert_eq!(conversion.result, dec!(3.67));

        let err = converter.get_rates("EUR").await.unwrap_err();
        assert!(matches!(err, FxError::NoRatesAvailable(_)));
    }

    #[tokio::test]
    async fn test_corrupt_entry_forces_refetch() {
        let provider = Arc::new(MockProvider::new(SAMPLE));
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rates_cache.json");
        let fetched_at = Utc::now().to_rfc3339();
        let body = format!(
            r#"{{"USD": {{"base": "USD", "rates": {{"USD": 1.0, "UZS": -5.0}},
                "fetched_at": "{}", "ttl_seconds": 86400}}}}"#,
            fetched_at
        );
        std::fs::write(&path, body).unwrap();

        let config = FxConfig {
            cache_file: path.clone(),
            ..FxConfig::default()
        };
        let converter = Converter::new(config, RateStore::open(path), provider.clone());

        let snapshot = converter.get_rates("USD").await.unwrap();
        assert_eq!(snapshot.source, RateSource::Live);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_get_stale_while_fetch_in_flight() {
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(MockProvider {
            gate: Some(gate.clone()),
            ..MockProvider::new(SAMPLE)
        });
        let (_dir, converter) = setup(provider.clone());
        seed(&converter, &[("UZS", 12000.0)], 90_000);
        let converter = Arc::new(converter);

        let fetching = {
            let converter = converter.clone();
            tokio::spawn(async move { converter.get_rates("USD").await })
        };
        while provider.calls() == 0 {
            tokio::task::yield_now().await;
        }

        let waiting = converter.get_rates("USD").await.unwrap();
        assert_eq!(waiting.source, RateSource::Stale);
        assert_eq!(waiting.rates.get("UZS"), Some(12000.0));

        gate.notify_one();
        let fetched = fetching.await.unwrap().unwrap();
        assert_eq!(fetched.source, RateSource::Live);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_offline_never_fetches() {
        let provider = Arc::new(MockProvider::new(SAMPLE));
        let dir = TempDir::new().unwrap();
        let config = FxConfig {
            cache_file: dir.path().join("rates_cache.json"),
            offline: true,
            ..FxConfig::default()
        };
        let store = RateStore::open(config.cache_file.clone());
        let converter = Converter::new(config, store, provider.clone());

        let snapshot = converter.get_rates("USD").await.unwrap();
        assert_eq!(snapshot.source, RateSource::Default);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_ignores_fresh_cache() {
        let provider = Arc::new(MockProvider::new(SAMPLE));
        let (_dir, converter) = setup(provider.clone());
        seed(&converter, &[("UZS", 12000.0)], 10);

        let snapshot = converter.refresh("usd").await.unwrap();
        assert_eq!(snapshot.source, RateSource::Live);
        assert_eq!(provider.calls(), 1);
        assert_eq!(
            converter.store().get("USD").unwrap().rates.get("UZS"),
            Some(12700.0)
        );
    }

    #[tokio::test]
    async fn test_rates_for_rebases() {
        let provider = Arc::new(MockProvider::new(SAMPLE));
        let (_dir, converter) = setup(provider);

        let aed = converter.rates_for("aed").await.unwrap();
        assert_eq!(aed.base, "AED");
        assert_eq!(aed.rates.get("AED"), Some(1.0));

        let unknown = converter.rates_for("XXX").await.unwrap();
        assert_eq!(unknown.base, "USD");
    }

    #[test]
    fn test_list_supported_uses_defaults_then_cache() {
        let provider = Arc::new(MockProvider::new(SAMPLE));
        let (_dir, converter) = setup(provider);

        let defaults: Vec<_> = converter.list_supported().into_iter().collect();
        assert_eq!(defaults, vec!["AED", "USD", "UZS"]);

        seed(&converter, &[("EUR", 0.92), ("JPY", 150.0)], 0);
        assert!(converter.list_supported().contains("JPY"));
        assert!(!converter.list_supported().contains("UZS"));
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let initial = Duration::from_secs(30);
        let max = Duration::from_secs(3600);
        assert_eq!(backoff_delay(initial, max, 1), Duration::from_secs(30));
        assert_eq!(backoff_delay(initial, max, 2), Duration::from_secs(60));
        assert_eq!(backoff_delay(initial, max, 4), Duration::from_secs(240));
        assert_eq!(backoff_delay(initial, max, 40), max);
    }

    #[tokio::test]
    async fn test_omitted_required_code_filled_from_defaults() {
        let provider = Arc::new(MockProvider::new(&[("AED", 3.6725), ("EUR", 0.92)]));
        let (_dir, converter) = setup(provider);

        let conversion = converter.convert(dec!(25), "USD", "UZS").await.unwrap();
        assert_eq!(conversion.result, dec!(315000.00));

        let stored = converter.store().get("USD").unwrap();
        assert_eq!(stored.rates.get("UZS"), Some(12600.0));
        assert_eq!(stored.rates.get("EUR"), Some(0.92));
    }

    #[tokio::test]
    async fn test_omitted_required_code_filled_from_previous_entry() {
        let provider = Arc::new(MockProvider::new(&[("AED", 3.6725), ("EUR", 0.92)]));
        let (_dir, converter) = setup(provider.clone());
        seed(&converter, &[("UZS", 12700.0), ("AED", 3.67)], 90_000);

        let snapshot = converter.get_rates("USD").await.unwrap();
        assert_eq!(snapshot.source, RateSource::Live);
        assert_eq!(snapshot.rates.get("UZS"), Some(12700.0));
        assert_eq!(snapshot.rates.get("AED"), Some(3.6725));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_skipped_when_store_refreshed_meanwhile() {
        let provider = Arc::new(MockProvider::new(SAMPLE));
        let (_dir, converter) = setup(provider.clone());
        let stale = seed(&converter, &[("UZS", 12000.0)], 90_000);

        // First caller refreshes the base.
        converter.get_rates("USD").await.unwrap();
        assert_eq!(provider.calls(), 1);

        // A caller that read the stale entry before that store completes now.
        let snapshot = converter
            .fetch_or_fallback("USD", Some(stale), false)
            .await
            .unwrap();
        assert_eq!(snapshot.source, RateSource::Cache);
        assert_eq!(snapshot.rates.get("UZS"), Some(12700.0));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_backoff() {
        let provider = Arc::new(MockProvider::new(SAMPLE).failing());
        let (_dir, converter) = setup(provider.clone());

        converter.get_rates("USD").await.unwrap();
        converter.get_rates("USD").await.unwrap();
        assert_eq!(provider.calls(), 1);

        provider.fail.store(false, Ordering::SeqCst);
        let snapshot = converter.refresh("USD").await.unwrap();
        assert_eq!(snapshot.source, RateSource::Live);
        assert_eq!(provider.calls(), 2);
        assert!(converter.backoff.lock().get("USD").is_none());
    }

    #[tokio::test]
    async fn test_success_clears_backoff() {
        let provider = Arc::new(MockProvider::new(SAMPLE).failing());
        let (_dir, converter) = setup_with(provider.clone(), |config| {
            config.backoff_initial = Duration::ZERO;
        });

        let degraded = converter.get_rates("USD").await.unwrap();
        assert_eq!(degraded.source, RateSource::Default);
        assert_eq!(converter.backoff.lock().get("USD").map(|b| b.failures), Some(1));

        provider.fail.store(false, Ordering::SeqCst);
        let live = converter.get_rates("USD").await.unwrap();
        assert_eq!(live.source, RateSource::Live);
        assert_eq!(provider.calls(), 2);
        assert!(converter.backoff.lock().get("USD").is_none());
    }

    #[test]
    fn test_zero_decimal_target() {
        let table = RateTable::new("USD", [("JPY", 150.25)]).unwrap();
        let request = ConversionRequest::new(dec!(3), "USD", "JPY");
        let (result, _) = convert_with_table(&table, &request).unwrap();
        assert_eq!(result, dec!(451));
    }
}
