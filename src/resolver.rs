use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::cache::LabelCacheStore;
use crate::config::ResolverConfig;
use crate::errors::LabelResult;
use crate::key::{Coordinate, LocationKey};
use crate::label::{LabelTier, LocationLabel, ResolvedLabel, GENERIC_PLACEHOLDER};
use crate::providers::{
    poi_confidence, rank_candidates, Candidate, CandidateKind, GeocodePrecision, ProviderSet,
};
use crate::records::{LabeledRecord, RecordResolution};
use crate::sanitizer::PrivacySanitizer;

/// Confidence assigned to locality-level fallbacks. Deliberately low: an
/// area name is honest but vague.
const AREA_CONFIDENCE: f64 = 0.4;

/// Outcome of one resolution attempt. `Unresolved` is a terminal answer for
/// this attempt, not an error: the caller shows the fixed placeholder and a
/// later attempt retries naturally because nothing was cached.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ResolvedLabel),
    Unresolved,
}

impl Resolution {
    pub fn display_text(&self) -> String {
        match self {
            Resolution::Resolved(label) => label.display_text(),
            Resolution::Unresolved => GENERIC_PLACEHOLDER.to_string(),
        }
    }
}

/// Orchestrates tiered lookup (POI -> street -> area -> placeholder) over
/// injected collaborators. Resolution is a pure function of its inputs plus
/// the cache and providers handed in; there is no global state.
pub struct LocationResolver {
    config: ResolverConfig,
    cache: LabelCacheStore,
    providers: ProviderSet,
    sanitizer: PrivacySanitizer,
    inflight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LocationResolver {
    pub fn new(
        config: ResolverConfig,
        cache: LabelCacheStore,
        providers: ProviderSet,
    ) -> LabelResult<Self> {
        config.validate()?;
        let sanitizer = PrivacySanitizer::new(&config.denylist);
        Ok(Self {
            config,
            cache,
            providers,
            sanitizer,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn rules_version(&self) -> u32 {
        self.config.rules_version
    }

    pub fn key_for(&self, coord: Coordinate) -> LocationKey {
        LocationKey::derive(
            coord,
            &self.config.locale,
            self.config.rules_version,
            self.config.quantize_decimals,
        )
    }

    /// Resolve one coordinate to a display label. Never errors and never
    /// blocks on an unbounded wait: provider failures walk down the tiers
    /// and total failure yields the placeholder.
    pub async fn resolve(&self, coord: Coordinate) -> Resolution {
        let key = self.key_for(coord);

        // Fast path, no network.
        if let Some(label) = self.cache.get(&key) {
            return Resolution::Resolved(self.finish(label));
        }

        // One in-flight lookup per key; everyone else waits and then
        // re-reads whatever the winner cached.
        let gate = {
            let mut inflight = self.inflight.lock();
            Arc::clone(
                inflight
                    .entry(key.as_str().to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let _guard = gate.lock().await;

        if let Some(label) = self.cache.get(&key) {
            self.release_gate(&key);
            return Resolution::Resolved(self.finish(label));
        }

        let outcome = match self.lookup_label(coord).await {
            Some(label) => {
                self.cache.set(&key, &label);
                Resolution::Resolved(self.finish(label))
            }
            None => {
                debug!(key = key.as_str(), "all providers exhausted; leaving unresolved");
                Resolution::Unresolved
            }
        };
        self.release_gate(&key);
        outcome
    }

    /// Resolve the record's coordinate and mutate its display fields on
    /// success. Records already resolved under the current rules version are
    /// left untouched.
    pub async fn resolve_record<R: LabeledRecord>(&self, record: &mut R) -> Resolution {
        if let Some(existing) = record.resolution() {
            if existing.resolution_version >= self.config.rules_version {
                return Resolution::Resolved(self.resolved_from_record(existing));
            }
        }

        let outcome = self.resolve(record.coordinate()).await;
        if let Resolution::Resolved(resolved) = &outcome {
            record.apply_resolution(RecordResolution {
                display_name: resolved.label.name.clone(),
                display_tier: resolved.label.tier,
                confidence: resolved.label.confidence,
                resolved_at: Utc::now(),
                resolution_version: self.config.rules_version,
            });
        }
        outcome
    }

    /// The one surface other layers consume: tier-appropriate, hedge-aware
    /// text with no tier or confidence knowledge required by the caller.
    pub fn friendly_label<R: LabeledRecord>(&self, record: &R) -> String {
        match record.resolution() {
            Some(resolution) => self.resolved_from_record(resolution).display_text(),
            None => GENERIC_PLACEHOLDER.to_string(),
        }
    }

    async fn lookup_label(&self, coord: Coordinate) -> Option<LocationLabel> {
        if let Some(label) = self.try_poi(coord).await {
            return Some(label);
        }
        self.try_geocoder(coord).await
    }

    async fn try_poi(&self, coord: Coordinate) -> Option<LocationLabel> {
        let radius = self.config.poi_search_radius_m;
        let candidates = match self.providers.search_nearby(coord, radius).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(?err, "nearby search failed; falling back to geocoder");
                return None;
            }
        };
        let ranked = rank_candidates(candidates);
        let best = ranked.first()?;
        if best.distance_m > f64::from(radius) {
            return None;
        }
        let confidence = poi_confidence(best, ranked.get(1), radius);
        let name = self.sanitizer.sanitize(&best.name, LabelTier::Poi);
        Some(LocationLabel::new(name, LabelTier::Poi, confidence))
    }

    async fn try_geocoder(&self, coord: Coordinate) -> Option<LocationLabel> {
        let candidates = match self.providers.reverse_geocode(coord).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(?err, "reverse geocode failed; no further tiers");
                return None;
            }
        };
        let ranked = rank_candidates(candidates);

        if let Some(street) = ranked.iter().find(|c| c.kind == CandidateKind::Street) {
            let name = self.sanitizer.sanitize(&street.name, LabelTier::Street);
            let confidence = street_confidence(street);
            return Some(LocationLabel::new(name, LabelTier::Street, confidence));
        }

        let area = ranked.iter().find(|c| c.kind == CandidateKind::Locality)?;
        let name = self.sanitizer.sanitize(&area.name, LabelTier::Area);
        Some(LocationLabel::new(name, LabelTier::Area, AREA_CONFIDENCE))
    }

    fn finish(&self, label: LocationLabel) -> ResolvedLabel {
        let hedged = self.should_hedge(label.tier, label.confidence);
        ResolvedLabel { label, hedged }
    }

    fn resolved_from_record(&self, resolution: &RecordResolution) -> ResolvedLabel {
        let mut label = LocationLabel::new(
            resolution.display_name.clone(),
            resolution.display_tier,
            resolution.confidence,
        );
        label.updated_at = resolution.resolved_at;
        ResolvedLabel {
            hedged: self.should_hedge(label.tier, label.confidence),
            label,
        }
    }

    /// An uncertain POI match is presented as "near X" instead of asserted.
    fn should_hedge(&self, tier: LabelTier, confidence: f64) -> bool {
        tier == LabelTier::Poi && confidence < self.config.confidence_hedge_threshold
    }

    fn release_gate(&self, key: &LocationKey) {
        self.inflight.lock().remove(key.as_str());
    }
}

/// Geocoder-reported precision maps to fixed confidence bands.
fn street_confidence(candidate: &Candidate) -> f64 {
    match candidate.precision {
        Some(GeocodePrecision::Rooftop) => 0.9,
        Some(GeocodePrecision::Interpolated) => 0.8,
        Some(GeocodePrecision::Center) => 0.7,
        Some(GeocodePrecision::Approximate) | None => 0.55,
    }
}
