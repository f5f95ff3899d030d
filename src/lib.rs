mod cache;
mod config;
mod errors;
mod key;
mod label;
mod migration;
mod providers;
mod records;
mod resolver;
mod sanitizer;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use cache::LabelCacheStore;
pub use config::ResolverConfig;
pub use errors::{LabelError, LabelResult};
pub use key::{Coordinate, LocationKey};
pub use label::{LabelTier, LocationLabel, ResolvedLabel, GENERIC_PLACEHOLDER};
pub use migration::{BatchMigrationCoordinator, MigrationProgress, MigrationStats, ProgressObserver};
pub use providers::{
    haversine_distance_m, poi_confidence, rank_candidates, Candidate, CandidateKind,
    GeocodePrecision, HttpNearbyClient, HttpReverseGeocoder, NearbySearch, ProviderSet,
    ReverseGeocode,
};
pub use records::{LabeledRecord, RecordResolution, RecordStore, ReportRecord};
pub use resolver::{LocationResolver, Resolution};
pub use sanitizer::{with_area_qualifier, PrivacySanitizer};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,location_labeler=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
