use serde::{Deserialize, Serialize};

/// Raw report coordinate. Inputs carry arbitrary precision; quantization
/// happens at key derivation, never at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Deterministic cache key over (quantized coordinate, locale, rules
/// version). The string is filename-safe so it doubles as the cache entry
/// stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationKey(String);

impl LocationKey {
    pub fn derive(coord: Coordinate, locale: &str, rules_version: u32, decimals: u8) -> Self {
        let lat = quantize(coord.latitude, decimals);
        let lon = quantize(coord.longitude, decimals);
        let decimals = usize::from(decimals);
        Self(format!(
            "{lat:.decimals$}_{lon:.decimals$}_{}_v{rules_version}",
            key_safe_locale(locale),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

fn quantize(value: f64, decimals: u8) -> f64 {
    let scale = 10_f64.powi(i32::from(decimals));
    let rounded = (value * scale).round() / scale;
    // -0.000 and 0.000 must map to the same key
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

fn key_safe_locale(locale: &str) -> String {
    let safe: String = locale
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if safe.is_empty() {
        "und".to_string()
    } else {
        safe
    }
}
