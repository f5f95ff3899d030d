use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::errors::LabelResult;
use crate::records::RecordStore;
use crate::resolver::{LocationResolver, Resolution};

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationStats {
    pub scanned: usize,
    pub resolved: usize,
    pub skipped: usize,
    pub batches: usize,
}

#[derive(Debug, Clone)]
pub struct MigrationProgress {
    pub scanned: usize,
    pub resolved: usize,
    pub remaining: usize,
}

pub type ProgressObserver = Arc<dyn Fn(MigrationProgress) + Send + Sync>;

/// Sweeps historical unresolved reports through the resolver in small
/// batches, entirely off the interactive path. Resumable: every batch is
/// persisted before the next starts, and a re-run skips whatever already
/// resolved. A record that fails is logged, left unresolved, and picked up
/// by a later run instead of being retried in a loop.
pub struct BatchMigrationCoordinator {
    store: Arc<RecordStore>,
    resolver: Arc<LocationResolver>,
    batch_size: usize,
}

impl BatchMigrationCoordinator {
    pub fn new(store: Arc<RecordStore>, resolver: Arc<LocationResolver>, batch_size: usize) -> Self {
        Self {
            store,
            resolver,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(
        &self,
        cancel_flag: Option<Arc<AtomicBool>>,
        observer: Option<ProgressObserver>,
    ) -> LabelResult<MigrationStats> {
        let version = self.resolver.rules_version();
        let mut stats = MigrationStats::default();
        let mut cursor = 0_i64;

        loop {
            if is_cancelled(&cancel_flag) {
                break;
            }

            let batch = self.store.load_unresolved(version, cursor, self.batch_size)?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = last.id;

            let mut updates = Vec::with_capacity(batch.len());
            let mut interrupted = false;
            for mut record in batch {
                if is_cancelled(&cancel_flag) {
                    interrupted = true;
                    break;
                }
                let id = record.id;
                stats.scanned += 1;
                match self.resolver.resolve_record(&mut record).await {
                    Resolution::Resolved(_) => {
                        if let Some(resolution) = record.resolution.take() {
                            updates.push((id, resolution));
                            stats.resolved += 1;
                        }
                    }
                    Resolution::Unresolved => {
                        warn!(record_id = id, "record left unresolved; will retry on a later run");
                        stats.skipped += 1;
                    }
                }
            }

            // Persist before yielding so an interruption costs at most this
            // batch.
            self.store.apply_resolutions(&updates)?;
            stats.batches += 1;

            if let Some(callback) = &observer {
                callback(MigrationProgress {
                    scanned: stats.scanned,
                    resolved: stats.resolved,
                    remaining: self.store.unresolved_count(version)?,
                });
            }

            if interrupted {
                break;
            }
            tokio::task::yield_now().await;
        }

        info!(
            scanned = stats.scanned,
            resolved = stats.resolved,
            skipped = stats.skipped,
            batches = stats.batches,
            "migration sweep finished"
        );
        Ok(stats)
    }
}

fn is_cancelled(flag: &Option<Arc<AtomicBool>>) -> bool {
    flag.as_ref()
        .map(|flag| flag.load(Ordering::SeqCst))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    use crate::cache::LabelCacheStore;
    use crate::config::ResolverConfig;
    use crate::errors::{LabelError, LabelResult};
    use crate::key::Coordinate;
    use crate::providers::{Candidate, CandidateKind, NearbySearch, ProviderSet, ReverseGeocode};

    use super::*;

    /// Names each lookup after its coordinate; fails for latitudes above the
    /// poison threshold.
    struct GridNearby {
        calls: AtomicUsize,
        poison_above_lat: f64,
    }

    #[async_trait]
    impl NearbySearch for GridNearby {
        async fn search_nearby(
            &self,
            coord: Coordinate,
            _radius_m: u32,
        ) -> LabelResult<Vec<Candidate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if coord.latitude > self.poison_above_lat {
                return Err(LabelError::Provider("poisoned cell".into()));
            }
            Ok(vec![Candidate {
                name: format!("Spot {:.1}", coord.latitude),
                kind: CandidateKind::Poi,
                latitude: coord.latitude,
                longitude: coord.longitude,
                distance_m: 5.0,
                precision: None,
            }])
        }
    }

    struct DeadGeocoder;

    #[async_trait]
    impl ReverseGeocode for DeadGeocoder {
        async fn reverse_geocode(&self, _coord: Coordinate) -> LabelResult<Vec<Candidate>> {
            Err(LabelError::Provider("offline".into()))
        }
    }

    fn build(
        cache_dir: &std::path::Path,
        poison_above_lat: f64,
    ) -> (Arc<RecordStore>, Arc<LocationResolver>, Arc<GridNearby>) {
        let nearby = Arc::new(GridNearby {
            calls: AtomicUsize::new(0),
            poison_above_lat,
        });
        let providers = ProviderSet::with_rng(
            nearby.clone(),
            Arc::new(DeadGeocoder),
            500,
            StdRng::seed_from_u64(3),
        );
        let cache = LabelCacheStore::new(cache_dir).unwrap();
        let resolver = Arc::new(
            LocationResolver::new(ResolverConfig::default(), cache, providers).unwrap(),
        );
        let store = Arc::new(RecordStore::in_memory().unwrap());
        (store, resolver, nearby)
    }

    fn seed_reports(store: &RecordStore, count: usize) {
        for i in 0..count {
            store
                .insert_report(Coordinate::new(i as f64, 20.0))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn sweep_resolves_everything_and_rerun_is_a_no_op() {
        let dir = tempdir().unwrap();
        let (store, resolver, nearby) = build(dir.path(), f64::MAX);
        seed_reports(&store, 5);

        let coordinator = BatchMigrationCoordinator::new(store.clone(), resolver, 2);
        let stats = coordinator.run(None, None).await.unwrap();
        assert_eq!(stats.scanned, 5);
        assert_eq!(stats.resolved, 5);
        assert_eq!(stats.batches, 3);
        assert_eq!(store.unresolved_count(1).unwrap(), 0);

        let rerun = coordinator.run(None, None).await.unwrap();
        assert_eq!(rerun.scanned, 0);
        assert_eq!(nearby.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn one_failing_record_never_aborts_the_batch() {
        let dir = tempdir().unwrap();
        // Latitudes 3.0 and 4.0 hit the poisoned provider cell.
        let (store, resolver, _) = build(dir.path(), 2.5);
        seed_reports(&store, 5);

        let coordinator = BatchMigrationCoordinator::new(store.clone(), resolver, 2);
        let stats = coordinator.run(None, None).await.unwrap();
        assert_eq!(stats.scanned, 5);
        assert_eq!(stats.resolved, 3);
        assert_eq!(stats.skipped, 2);
        assert_eq!(store.unresolved_count(1).unwrap(), 2);
    }

    #[tokio::test]
    async fn interrupted_sweep_resumes_without_re_resolving() {
        let dir = tempdir().unwrap();
        let (store, resolver, nearby) = build(dir.path(), f64::MAX);
        seed_reports(&store, 6);

        let cancel = Arc::new(AtomicBool::new(false));
        let trip = cancel.clone();
        let observer: ProgressObserver = Arc::new(move |progress: MigrationProgress| {
            if progress.scanned >= 2 {
                trip.store(true, Ordering::SeqCst);
            }
        });

        let coordinator = BatchMigrationCoordinator::new(store.clone(), resolver.clone(), 2);
        let first = coordinator
            .run(Some(cancel), Some(observer))
            .await
            .unwrap();
        assert_eq!(first.resolved, 2);
        assert_eq!(store.unresolved_count(1).unwrap(), 4);

        let second = coordinator.run(None, None).await.unwrap();
        assert_eq!(second.scanned, 4);
        assert_eq!(second.resolved, 4);
        assert_eq!(store.unresolved_count(1).unwrap(), 0);
        // Each report's coordinate was looked up exactly once across runs.
        assert_eq!(nearby.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn progress_observer_sees_shrinking_remainder() {
        let dir = tempdir().unwrap();
        let (store, resolver, _) = build(dir.path(), f64::MAX);
        seed_reports(&store, 4);

        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: ProgressObserver = Arc::new(move |progress: MigrationProgress| {
            sink.lock().push(progress.remaining);
        });

        let coordinator = BatchMigrationCoordinator::new(store, resolver, 2);
        coordinator.run(None, Some(observer)).await.unwrap();

        let remaining = seen.lock().clone();
        assert_eq!(remaining, vec![2, 0]);
    }
}
