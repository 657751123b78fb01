use std::{env, path::PathBuf, time::Duration};

pub const BASE_CURRENCY: &str = "USD";
pub const CACHE_FILE: &str = "rates_cache.json";
pub static CACHE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
pub static MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
pub static FETCH_TIMEOUT: Duration = Duration::from_secs(8);
pub static BACKOFF_INITIAL: Duration = Duration::from_secs(30);
pub static BACKOFF_MAX: Duration = Duration::from_secs(60 * 60);
pub const USER_AGENT: &str = concat!("fxconv/", env!("CARGO_PKG_VERSION"));

/// Public endpoints tried in order. `{base}` is replaced with the base code.
pub const DEFAULT_API_URLS: &[&str] = &[
    "https://open.er-api.com/v6/latest/{base}",
    "https://api.exchangerate-api.com/v4/latest/{base}",
    "https://api.frankfurter.app/latest?from={base}",
];

/// Rates served when neither the network nor the cache can help.
pub const DEFAULT_RATES: &[(&str, f64)] = &[("USD", 1.0), ("AED", 3.6725), ("UZS", 12600.0)];

pub const COMMON_CODES: &[&str] = &[
    "USD", "EUR", "GBP", "AED", "SAR", "KWD", "QAR", "OMR", "UZS", "KZT", "RUB", "INR", "PKR",
    "TRY", "CNY", "JPY",
];

#[derive(Debug, Clone)]
pub struct FxConfig {
    pub base: String,
    pub cache_file: PathBuf,
    pub api_urls: Vec<String>,
    pub ttl: Duration,
    pub timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub offline: bool,
}

impl Default for FxConfig {
    fn default() -> Self {
        Self {
            base: BASE_CURRENCY.to_string(),
            cache_file: PathBuf::from(CACHE_FILE),
            api_urls: DEFAULT_API_URLS.iter().map(|u| u.to_string()).collect(),
            ttl: CACHE_DURATION,
            timeout: FETCH_TIMEOUT,
            backoff_initial: BACKOFF_INITIAL,
            backoff_max: BACKOFF_MAX,
            offline: false,
        }
    }
}

impl FxConfig {
    /// Reads overrides from the environment. Call `dotenv().ok()` first to
    /// pick up a `.env` file.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var("FX_CACHE_FILE") {
            config.cache_file = PathBuf::from(path);
        }
        if let Ok(urls) = env::var("FX_API_URLS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
            if !urls.is_empty() {
                config.api_urls = urls;
            }
        }
        if let Some(ms) = env::var("FX_TIMEOUT_MS").ok().and_then(|s| s.parse().ok()) {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env::var("FX_TTL_SECS").ok().and_then(|s| s.parse().ok()) {
            config.ttl = clamp_ttl(Duration::from_secs(secs));
        }
        config.offline = env::var("FX_OFFLINE")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        config
    }
}

fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.min(MAX_TTL)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
