use once_cell::sync::Lazy;
use regex::Regex;

use crate::label::{LabelTier, GENERIC_PLACEHOLDER};

/// Internal grid-index names (Area 42, Cell 7, ...) leak implementation
/// details and must never reach users.
static SYNTHETIC_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(area|cell|grid|zone)\s*\d+$").expect("synthetic name pattern")
});

static TRAILING_QUALIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(area|district|neighborhood|neighbourhood|locality|zone)\s*$")
        .expect("trailing qualifier pattern")
});

/// Pure text transform applied to every candidate name before it is cached
/// or displayed. No I/O, deterministic for a fixed denylist.
pub struct PrivacySanitizer {
    denylist: Vec<Regex>,
}

impl PrivacySanitizer {
    pub fn new(denylist: &[String]) -> Self {
        let denylist = denylist
            .iter()
            .filter(|term| !term.trim().is_empty())
            .map(|term| {
                // Word-boundary match only: a short token must not hit
                // inside an unrelated longer word.
                Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term.trim())))
                    .expect("escaped denylist pattern")
            })
            .collect();
        Self { denylist }
    }

    pub fn sanitize(&self, name: &str, tier: LabelTier) -> String {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return GENERIC_PLACEHOLDER.to_string();
        }
        if SYNTHETIC_NAME.is_match(trimmed) {
            return GENERIC_PLACEHOLDER.to_string();
        }
        if self.is_denied(trimmed) {
            return GENERIC_PLACEHOLDER.to_string();
        }
        match tier {
            LabelTier::Poi => trimmed.to_string(),
            LabelTier::Street | LabelTier::Area => with_area_qualifier(trimmed),
        }
    }

    pub fn is_denied(&self, name: &str) -> bool {
        self.denylist.iter().any(|pattern| pattern.is_match(name))
    }
}

/// Appends the generic qualifier unless the name already ends with an
/// equivalent one.
pub fn with_area_qualifier(name: &str) -> String {
    if TRAILING_QUALIFIER.is_match(name) {
        name.to_string()
    } else {
        format!("{name} area")
    }
}
