use std::{env, io};

use secrecy::SecretString;
use tracing::debug;

use crate::errors::{LabelError, LabelResult};

const DEFAULT_QUANTIZE_DECIMALS: u8 = 3;
const DEFAULT_POI_SEARCH_RADIUS_M: u32 = 120;
const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 4_000;
const DEFAULT_HEDGE_THRESHOLD: f64 = 0.75;
const DEFAULT_MIGRATION_BATCH_SIZE: usize = 25;

/// In-process configuration for the resolution engine. Every field has a
/// working default; environment overrides are a convenience, never required.
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// Bumped whenever sanitization or labeling rules change; rotates every
    /// cache key so stale entries are never read again.
    pub rules_version: u32,
    pub locale: String,
    /// Decimal places kept when quantizing coordinates. Three places is a
    /// ~110m grid: coarse enough that nearby queries share a cache slot and
    /// a key never pinpoints a submitter.
    pub quantize_decimals: u8,
    pub poi_search_radius_m: u32,
    pub provider_timeout_ms: u64,
    pub confidence_hedge_threshold: f64,
    pub denylist: Vec<String>,
    pub migration_batch_size: usize,
    pub places_api_key: Option<SecretString>,
    pub geocoder_api_key: Option<SecretString>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            rules_version: 1,
            locale: "en-US".to_string(),
            quantize_decimals: DEFAULT_QUANTIZE_DECIMALS,
            poi_search_radius_m: DEFAULT_POI_SEARCH_RADIUS_M,
            provider_timeout_ms: DEFAULT_PROVIDER_TIMEOUT_MS,
            confidence_hedge_threshold: DEFAULT_HEDGE_THRESHOLD,
            denylist: Vec::new(),
            migration_batch_size: DEFAULT_MIGRATION_BATCH_SIZE,
            places_api_key: None,
            geocoder_api_key: None,
        }
    }
}

impl ResolverConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            rules_version: parse_u32("LABEL_RULES_VERSION", defaults.rules_version),
            locale: env::var("LABEL_LOCALE").unwrap_or(defaults.locale),
            quantize_decimals: parse_u8("LABEL_QUANTIZE_DECIMALS", defaults.quantize_decimals),
            poi_search_radius_m: parse_u32("LABEL_POI_RADIUS_M", defaults.poi_search_radius_m),
            provider_timeout_ms: parse_u64("LABEL_PROVIDER_TIMEOUT_MS", defaults.provider_timeout_ms),
            confidence_hedge_threshold: parse_f64(
                "LABEL_HEDGE_THRESHOLD",
                defaults.confidence_hedge_threshold,
            ),
            denylist: parse_list("LABEL_DENYLIST"),
            migration_batch_size: parse_usize(
                "LABEL_MIGRATION_BATCH_SIZE",
                defaults.migration_batch_size,
            ),
            places_api_key: env::var("PLACES_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
        }
    }

    /// Misconfiguration is the one condition allowed to fail loudly; all
    /// runtime data/network conditions degrade instead.
    pub fn validate(&self) -> LabelResult<()> {
        if !(0.0..=1.0).contains(&self.confidence_hedge_threshold) {
            return Err(LabelError::Config(format!(
                "confidence_hedge_threshold must be within [0, 1], got {}",
                self.confidence_hedge_threshold
            )));
        }
        if self.poi_search_radius_m == 0 {
            return Err(LabelError::Config("poi_search_radius_m must be non-zero".into()));
        }
        if self.migration_batch_size == 0 {
            return Err(LabelError::Config("migration_batch_size must be non-zero".into()));
        }
        if self.quantize_decimals > 6 {
            return Err(LabelError::Config(format!(
                "quantize_decimals above 6 defeats coordinate coarsening, got {}",
                self.quantize_decimals
            )));
        }
        Ok(())
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u8(key: &str, default: u8) -> u8 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn parse_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| {
            v.split(',')
                .map(|term| term.trim().to_string())
                .filter(|term| !term.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
