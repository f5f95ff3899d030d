use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::errors::{LabelError, LabelResult};
use crate::key::Coordinate;

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 250;
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Distance margin under which the top two candidates count as ambiguous.
const AMBIGUITY_MARGIN_M: f64 = 25.0;

const DEFAULT_NEARBY_ENDPOINT: &str = "https://places.googleapis.com/v1/places:searchNearby";
const DEFAULT_GEOCODE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Poi,
    Street,
    Locality,
}

/// Geocoder-reported positional precision, mapped to confidence bands by
/// the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeocodePrecision {
    Rooftop,
    Interpolated,
    Center,
    Approximate,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub kind: CandidateKind,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_m: f64,
    pub precision: Option<GeocodePrecision>,
}

#[async_trait]
pub trait NearbySearch: Send + Sync {
    async fn search_nearby(&self, coord: Coordinate, radius_m: u32) -> LabelResult<Vec<Candidate>>;
}

#[async_trait]
pub trait ReverseGeocode: Send + Sync {
    async fn reverse_geocode(&self, coord: Coordinate) -> LabelResult<Vec<Candidate>>;
}

/// Both lookup strategies behind one seam: every call carries the configured
/// timeout and a bounded retry with jittered backoff. Exhausted retries
/// surface as a typed provider failure for the resolver to fall back on.
pub struct ProviderSet {
    nearby: Arc<dyn NearbySearch>,
    geocoder: Arc<dyn ReverseGeocode>,
    timeout_ms: u64,
    jitter_rng: Arc<Mutex<StdRng>>,
}

impl ProviderSet {
    pub fn new(nearby: Arc<dyn NearbySearch>, geocoder: Arc<dyn ReverseGeocode>, timeout_ms: u64) -> Self {
        Self {
            nearby,
            geocoder,
            timeout_ms,
            jitter_rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    #[cfg(test)]
    pub fn with_rng(
        nearby: Arc<dyn NearbySearch>,
        geocoder: Arc<dyn ReverseGeocode>,
        timeout_ms: u64,
        rng: StdRng,
    ) -> Self {
        Self {
            nearby,
            geocoder,
            timeout_ms,
            jitter_rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub async fn search_nearby(&self, coord: Coordinate, radius_m: u32) -> LabelResult<Vec<Candidate>> {
        let nearby = Arc::clone(&self.nearby);
        self.call_with_retry("nearby_search", move || {
            let nearby = Arc::clone(&nearby);
            async move { nearby.search_nearby(coord, radius_m).await }
        })
        .await
    }

    pub async fn reverse_geocode(&self, coord: Coordinate) -> LabelResult<Vec<Candidate>> {
        let geocoder = Arc::clone(&self.geocoder);
        self.call_with_retry("reverse_geocode", move || {
            let geocoder = Arc::clone(&geocoder);
            async move { geocoder.reverse_geocode(coord).await }
        })
        .await
    }

    async fn call_with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> LabelResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LabelResult<T>>,
    {
        let budget = Duration::from_millis(self.timeout_ms);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match timeout(budget, call()).await {
                Ok(result) => result,
                Err(_) => Err(LabelError::ProviderTimeout(self.timeout_ms)),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_provider_failure() && attempt < MAX_ATTEMPTS => {
                    let delay = self.backoff_delay(attempt);
                    warn!(?err, op, attempt, "provider call failed; retrying after {:?}", delay);
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(BASE_BACKOFF_MS * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            let jitter_ms = rng.gen_range(0..BASE_BACKOFF_MS);
            Duration::from_millis(jitter_ms)
        };
        base + jitter
    }
}

/// Sort candidates by distance ascending so the head is always the closest
/// match. Ties keep provider order.
pub fn rank_candidates(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        a.distance_m
            .partial_cmp(&b.distance_m)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

/// POI confidence from absolute distance plus the margin over the runner-up.
/// A close, clearly separated candidate approaches 1.0; a candidate at the
/// search radius with a near-tied rival drops toward 0.3.
pub fn poi_confidence(best: &Candidate, runner_up: Option<&Candidate>, radius_m: u32) -> f64 {
    let radius = f64::from(radius_m.max(1));
    let proximity = 1.0 - (best.distance_m / radius).clamp(0.0, 1.0) * 0.5;
    let separation = match runner_up {
        Some(rival) => {
            let margin = (rival.distance_m - best.distance_m).max(0.0);
            if margin >= AMBIGUITY_MARGIN_M {
                1.0
            } else {
                0.6 + 0.4 * (margin / AMBIGUITY_MARGIN_M)
            }
        }
        None => 1.0,
    };
    (proximity * separation).clamp(0.0, 1.0)
}

pub fn haversine_distance_m(a: Coordinate, b: Coordinate) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

pub struct HttpNearbyClient {
    http: reqwest::Client,
    api_key: SecretString,
    endpoint: String,
}

impl HttpNearbyClient {
    pub fn new(api_key: SecretString) -> Self {
        Self::with_endpoint(api_key, DEFAULT_NEARBY_ENDPOINT.to_string())
    }

    pub fn with_endpoint(api_key: SecretString, endpoint: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("nearby search http client");
        Self {
            http,
            api_key,
            endpoint,
        }
    }
}

#[async_trait]
impl NearbySearch for HttpNearbyClient {
    async fn search_nearby(&self, coord: Coordinate, radius_m: u32) -> LabelResult<Vec<Candidate>> {
        #[derive(serde::Serialize)]
        struct RequestBody<'a> {
            #[serde(rename = "maxResultCount")]
            max_result_count: u8,
            #[serde(rename = "locationRestriction")]
            location_restriction: LocationRestriction<'a>,
        }

        #[derive(serde::Serialize)]
        struct LocationRestriction<'a> {
            circle: Circle<'a>,
        }

        #[derive(serde::Serialize)]
        struct Circle<'a> {
            center: Center<'a>,
            radius: u32,
        }

        #[derive(serde::Serialize)]
        struct Center<'a> {
            latitude: &'a f64,
            longitude: &'a f64,
        }

        #[derive(serde::Deserialize)]
        struct Response {
            places: Option<Vec<ResponsePlace>>,
        }

        #[derive(serde::Deserialize)]
        struct ResponsePlace {
            #[serde(rename = "displayName")]
            display_name: Option<ResponseText>,
            location: Option<ResponseLocation>,
        }

        #[derive(serde::Deserialize)]
        struct ResponseText {
            text: Option<String>,
        }

        #[derive(serde::Deserialize)]
        struct ResponseLocation {
            latitude: Option<f64>,
            longitude: Option<f64>,
        }

        let body = RequestBody {
            max_result_count: 5,
            location_restriction: LocationRestriction {
                circle: Circle {
                    center: Center {
                        latitude: &coord.latitude,
                        longitude: &coord.longitude,
                    },
                    radius: radius_m,
                },
            },
        };

        let response = self
            .http
            .post(&self.endpoint)
            .header("X-Goog-Api-Key", self.api_key.expose_secret())
            .header("X-Goog-FieldMask", "places.displayName,places.location")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await?;
        let candidates = parsed
            .places
            .unwrap_or_default()
            .into_iter()
            .filter_map(|place| {
                let name = place.display_name.and_then(|text| text.text)?;
                let location = place.location?;
                let latitude = location.latitude?;
                let longitude = location.longitude?;
                Some(Candidate {
                    name,
                    kind: CandidateKind::Poi,
                    latitude,
                    longitude,
                    distance_m: haversine_distance_m(coord, Coordinate::new(latitude, longitude)),
                    precision: None,
                })
            })
            .collect();
        Ok(candidates)
    }
}

pub struct HttpReverseGeocoder {
    http: reqwest::Client,
    api_key: SecretString,
    endpoint: String,
}

impl HttpReverseGeocoder {
    pub fn new(api_key: SecretString) -> Self {
        Self::with_endpoint(api_key, DEFAULT_GEOCODE_ENDPOINT.to_string())
    }

    pub fn with_endpoint(api_key: SecretString, endpoint: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reverse geocode http client");
        Self {
            http,
            api_key,
            endpoint,
        }
    }
}

#[async_trait]
impl ReverseGeocode for HttpReverseGeocoder {
    async fn reverse_geocode(&self, coord: Coordinate) -> LabelResult<Vec<Candidate>> {
        #[derive(serde::Deserialize)]
        struct Response {
            status: Option<String>,
            results: Option<Vec<GeoResult>>,
        }

        #[derive(serde::Deserialize)]
        struct GeoResult {
            types: Option<Vec<String>>,
            address_components: Option<Vec<GeoComponent>>,
            geometry: Option<Geometry>,
        }

        #[derive(serde::Deserialize)]
        struct Geometry {
            location: Option<GeoLocation>,
            location_type: Option<String>,
        }

        #[derive(serde::Deserialize)]
        struct GeoLocation {
            lat: Option<f64>,
            lng: Option<f64>,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("latlng", format!("{},{}", coord.latitude, coord.longitude)),
                ("key", self.api_key.expose_secret().to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await?;
        if let Some(status) = parsed.status.as_deref() {
            if status != "OK" && status != "ZERO_RESULTS" {
                return Err(LabelError::Provider(format!("geocoder status {status}")));
            }
        }

        let candidates = parsed
            .results
            .unwrap_or_default()
            .into_iter()
            .filter_map(|result| {
                let result_types = result.types.unwrap_or_default();
                let kind = if result_types.iter().any(|t| t == "route" || t == "street_address") {
                    CandidateKind::Street
                } else if result_types
                    .iter()
                    .any(|t| matches!(t.as_str(), "locality" | "neighborhood" | "sublocality" | "postal_town"))
                {
                    CandidateKind::Locality
                } else {
                    return None;
                };

                let name = component_name(&result.address_components.unwrap_or_default(), kind)?;
                let geometry = result.geometry?;
                let location = geometry.location?;
                let latitude = location.lat?;
                let longitude = location.lng?;
                Some(Candidate {
                    name,
                    kind,
                    latitude,
                    longitude,
                    distance_m: haversine_distance_m(coord, Coordinate::new(latitude, longitude)),
                    precision: geometry.location_type.as_deref().map(parse_precision),
                })
            })
            .collect();
        Ok(candidates)
    }
}

fn parse_precision(tag: &str) -> GeocodePrecision {
    match tag {
        "ROOFTOP" => GeocodePrecision::Rooftop,
        "RANGE_INTERPOLATED" => GeocodePrecision::Interpolated,
        "GEOMETRIC_CENTER" => GeocodePrecision::Center,
        _ => GeocodePrecision::Approximate,
    }
}

#[derive(Debug, serde::Deserialize)]
struct GeoComponent {
    long_name: Option<String>,
    types: Option<Vec<String>>,
}

/// Picks the display name out of a geocoder result's address components,
/// preferring the most specific tag valid for the candidate kind.
fn component_name(components: &[GeoComponent], kind: CandidateKind) -> Option<String> {
    let wanted: &[&str] = match kind {
        CandidateKind::Street => &["route"],
        CandidateKind::Locality => &["neighborhood", "sublocality", "locality", "postal_town"],
        CandidateKind::Poi => &[],
    };
    for tag in wanted {
        for component in components {
            let types = component.types.as_deref().unwrap_or_default();
            if types.iter().any(|t| t == tag) {
                if let Some(name) = component.long_name.as_deref() {
                    let trimmed = name.trim();
                    if !trimmed.is_empty() {
                        return Some(trimmed.to_string());
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn candidate(name: &str, distance_m: f64) -> Candidate {
        Candidate {
            name: name.to_string(),
            kind: CandidateKind::Poi,
            latitude: 0.0,
            longitude: 0.0,
            distance_m,
            precision: None,
        }
    }

    #[test]
    fn ranking_sorts_by_distance() {
        let ranked = rank_candidates(vec![
            candidate("far", 90.0),
            candidate("near", 10.0),
            candidate("mid", 40.0),
        ]);
        let names: Vec<&str> = ranked.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["near", "mid", "far"]);
    }

    #[test]
    fn close_unambiguous_candidate_scores_high() {
        let best = candidate("best", 5.0);
        let rival = candidate("rival", 80.0);
        let confidence = poi_confidence(&best, Some(&rival), 120);
        assert!(confidence > 0.9, "got {confidence}");
    }

    #[test]
    fn near_tied_rival_discounts_confidence() {
        let best = candidate("best", 5.0);
        let rival = candidate("rival", 7.0);
        let clear = poi_confidence(&best, Some(&candidate("far", 80.0)), 120);
        let ambiguous = poi_confidence(&best, Some(&rival), 120);
        assert!(ambiguous < clear, "{ambiguous} vs {clear}");
        assert!(ambiguous > 0.0);
    }

    #[test]
    fn distance_at_radius_halves_the_score() {
        let best = candidate("edge", 120.0);
        let confidence = poi_confidence(&best, None, 120);
        assert!((confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Golden Gate Bridge towers are roughly 1.28km apart.
        let south = Coordinate::new(37.8066, -122.4750);
        let north = Coordinate::new(37.8182, -122.4783);
        let d = haversine_distance_m(south, north);
        assert!((1_200.0..1_400.0).contains(&d), "got {d}");
    }

    struct FlakyNearby {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl NearbySearch for FlakyNearby {
        async fn search_nearby(&self, _coord: Coordinate, _radius_m: u32) -> LabelResult<Vec<Candidate>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(LabelError::Provider("transient".into()))
            } else {
                Ok(vec![candidate("recovered", 12.0)])
            }
        }
    }

    struct NoGeocoder;

    #[async_trait]
    impl ReverseGeocode for NoGeocoder {
        async fn reverse_geocode(&self, _coord: Coordinate) -> LabelResult<Vec<Candidate>> {
            Err(LabelError::Provider("unused".into()))
        }
    }

    #[tokio::test]
    async fn retries_transient_provider_failures() {
        let nearby = Arc::new(FlakyNearby {
            calls: AtomicUsize::new(0),
            fail_first: 1,
        });
        let providers = ProviderSet::with_rng(
            nearby.clone(),
            Arc::new(NoGeocoder),
            1_000,
            StdRng::seed_from_u64(7),
        );
        let found = providers
            .search_nearby(Coordinate::new(1.0, 2.0), 120)
            .await
            .unwrap();
        assert_eq!(found[0].name, "recovered");
        assert_eq!(nearby.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_provider_failure() {
        let nearby = Arc::new(FlakyNearby {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
        });
        let providers = ProviderSet::with_rng(
            nearby.clone(),
            Arc::new(NoGeocoder),
            1_000,
            StdRng::seed_from_u64(7),
        );
        let err = providers
            .search_nearby(Coordinate::new(1.0, 2.0), 120)
            .await
            .unwrap_err();
        assert!(err.is_provider_failure());
        assert_eq!(nearby.calls.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
    }
}
