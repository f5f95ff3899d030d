use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{LabelError, LabelResult};

/// Fixed fallback shown whenever no trustworthy name exists: provider
/// outage, denylist hit, or synthetic internal names. Never a coordinate,
/// never empty.
pub const GENERIC_PLACEHOLDER: &str = "Unnamed area";

/// Specificity of a resolved label. Closed set; anything else on disk is
/// treated as corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelTier {
    Poi,
    Street,
    Area,
}

impl LabelTier {
    pub fn as_tag(&self) -> &'static str {
        match self {
            LabelTier::Poi => "poi",
            LabelTier::Street => "street",
            LabelTier::Area => "area",
        }
    }

    pub fn parse(value: &str) -> LabelResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "poi" => Ok(LabelTier::Poi),
            "street" => Ok(LabelTier::Street),
            "area" => Ok(LabelTier::Area),
            _ => Err(LabelError::Config(format!("invalid label tier: {value}"))),
        }
    }
}

/// A resolved display label. This is also the on-disk cache entry shape:
/// `{name, tier, confidence, updatedAt}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationLabel {
    pub name: String,
    pub tier: LabelTier,
    pub confidence: f64,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl LocationLabel {
    pub fn new(name: impl Into<String>, tier: LabelTier, confidence: f64) -> Self {
        Self {
            name: name.into(),
            tier,
            confidence: confidence.clamp(0.0, 1.0),
            updated_at: Utc::now(),
        }
    }

    /// Cache reads run this before trusting deserialized bytes; any failure
    /// means the entry is deleted and treated as a miss.
    pub fn is_well_formed(&self) -> bool {
        !self.name.trim().is_empty() && (0.0..=1.0).contains(&self.confidence)
    }
}

/// Resolver output contract: the label plus whether presentation must hedge
/// it. Hedging is carried explicitly, never recomputed by callers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLabel {
    pub label: LocationLabel,
    pub hedged: bool,
}

impl ResolvedLabel {
    pub fn display_text(&self) -> String {
        if self.hedged {
            format!("near {}", self.label.name)
        } else {
            self.label.name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(LocationLabel::new("X", LabelTier::Poi, 1.7).confidence, 1.0);
        assert_eq!(LocationLabel::new("X", LabelTier::Poi, -0.2).confidence, 0.0);
    }

    #[test]
    fn tier_tags_round_trip() {
        for tier in [LabelTier::Poi, LabelTier::Street, LabelTier::Area] {
            assert_eq!(LabelTier::parse(tier.as_tag()).unwrap(), tier);
        }
        assert!(LabelTier::parse("city").is_err());
    }

    #[test]
    fn tier_serializes_to_lowercase_tag() {
        let json = serde_json::to_string(&LabelTier::Street).unwrap();
        assert_eq!(json, "\"street\"");
    }

    #[test]
    fn hedged_labels_qualify_the_name() {
        let label = LocationLabel::new("Blue Bottle Coffee", LabelTier::Poi, 0.6);
        let hedged = ResolvedLabel {
            label: label.clone(),
            hedged: true,
        };
        assert_eq!(hedged.display_text(), "near Blue Bottle Coffee");
        let asserted = ResolvedLabel {
            label,
            hedged: false,
        };
        assert_eq!(asserted.display_text(), "Blue Bottle Coffee");
    }

    #[test]
    fn empty_names_are_malformed() {
        let mut label = LocationLabel::new("Spot", LabelTier::Area, 0.4);
        label.name = "   ".into();
        assert!(!label.is_well_formed());
    }
}
