//! Viewport-keyed dataset cache.
//!
//! Each pan/zoom settle produces a [`ViewportQuery`]; the cache answers it
//! from memory when a fresh entry exists and otherwise fires one background
//! fetch per dataset kind against the configured [`DatasetSource`]. Entries
//! expire after a TTL and the cache is capped, evicting oldest-first. Calling
//! [`ViewportCache::load`] every frame is intended usage: fresh hits and
//! already-pending keys are no-ops, so fetch volume is bounded by distinct
//! viewport keys.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::Context as _;
use geojson::{FeatureCollection, GeoJson};
use log::{debug, warn};
use poll_promise::Promise;

use crate::config::DatasetEndpoints;
use crate::geometry::Bounds;
use crate::registry::LayerRegistry;
use crate::{CLIENT, MapError};

/// The dataset kinds served by the bounded viewport query interface.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum DatasetKind {
    /// Point evidence collected during field inspections.
    Evidence,
    /// Polygon mining/logging concession boundaries.
    Concession,
    /// Polygon results of completed geospatial analyses.
    Analysis,
}

impl DatasetKind {
    /// All dataset kinds, in registry order.
    pub const ALL: [DatasetKind; 3] = [
        DatasetKind::Evidence,
        DatasetKind::Concession,
        DatasetKind::Analysis,
    ];

    pub(crate) const fn index(self) -> usize {
        match self {
            DatasetKind::Evidence => 0,
            DatasetKind::Concession => 1,
            DatasetKind::Analysis => 2,
        }
    }

    /// The URL path segment of this kind's query endpoint.
    pub fn endpoint_path(self) -> &'static str {
        match self {
            DatasetKind::Evidence => "evidence",
            DatasetKind::Concession => "concessions",
            DatasetKind::Analysis => "analyses",
        }
    }

    /// The registry layer id for this kind.
    pub fn layer_id(self) -> &'static str {
        match self {
            DatasetKind::Evidence => "evidence",
            DatasetKind::Concession => "concessions",
            DatasetKind::Analysis => "analyses",
        }
    }

    /// Human readable layer name.
    pub fn display_name(self) -> &'static str {
        match self {
            DatasetKind::Evidence => "Evidence",
            DatasetKind::Concession => "Concessions",
            DatasetKind::Analysis => "Analyses",
        }
    }

    /// Default rendering color for this kind's layer.
    pub fn default_color(self) -> egui::Color32 {
        match self {
            DatasetKind::Evidence => egui::Color32::from_rgb(220, 50, 47),
            DatasetKind::Concession => egui::Color32::from_rgb(38, 139, 210),
            DatasetKind::Analysis => egui::Color32::from_rgb(133, 153, 0),
        }
    }
}

/// A rectangular geographic window at a discrete zoom level, used as the
/// cache key for dataset queries.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportQuery {
    /// The visible bounds of the viewport.
    pub bounds: Bounds,
    /// The discrete zoom level of the viewport.
    pub zoom: u8,
}

impl ViewportQuery {
    /// The cache key: bounds serialized at fixed precision, joined with the
    /// zoom level.
    pub fn cache_key(&self) -> String {
        format!(
            "{:.6},{:.6},{:.6},{:.6}:{}",
            self.bounds.west, self.bounds.south, self.bounds.east, self.bounds.north, self.zoom
        )
    }
}

/// The datasets loaded for one viewport query.
///
/// A kind is absent when its fetch failed or returned nothing parseable; the
/// other kinds are unaffected. Immutable once cached.
#[derive(Clone, Default)]
pub struct DatasetBundle {
    collections: [Option<Arc<FeatureCollection>>; 3],
}

impl DatasetBundle {
    /// The feature collection for a dataset kind, if it loaded.
    pub fn get(&self, kind: DatasetKind) -> Option<&FeatureCollection> {
        self.collections[kind.index()].as_deref()
    }

    pub(crate) fn set(&mut self, kind: DatasetKind, collection: FeatureCollection) {
        self.collections[kind.index()] = Some(Arc::new(collection));
    }

    /// Number of features for a kind; 0 when the kind is absent.
    pub fn feature_count(&self, kind: DatasetKind) -> usize {
        self.get(kind).map_or(0, |fc| fc.features.len())
    }

    /// Whether every dataset kind failed to load.
    pub fn is_empty(&self) -> bool {
        self.collections.iter().all(Option::is_none)
    }
}

/// A cached, read-only dataset bundle with its fetch time.
pub struct CacheEntry {
    /// The datasets fetched for this entry's viewport query.
    pub data: DatasetBundle,
    /// When the bundle finished assembling.
    pub fetched_at: Instant,
}

impl CacheEntry {
    fn is_stale(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() >= ttl
    }
}

/// The backing query interface for dataset fetches.
///
/// One blocking call per (kind, query); the cache runs these on background
/// threads. Implementations are expected to be cheap to share.
pub trait DatasetSource: Send + Sync {
    /// Fetches the feature collection of one dataset kind for one viewport.
    fn fetch(&self, kind: DatasetKind, query: &ViewportQuery)
    -> Result<FeatureCollection, MapError>;
}

/// [`DatasetSource`] implementation over the HTTP query endpoints.
pub struct HttpDatasetSource {
    endpoints: DatasetEndpoints,
}

impl HttpDatasetSource {
    /// Creates a source for the given endpoint configuration.
    pub fn new(endpoints: DatasetEndpoints) -> Self {
        Self { endpoints }
    }
}

impl DatasetSource for HttpDatasetSource {
    fn fetch(
        &self,
        kind: DatasetKind,
        query: &ViewportQuery,
    ) -> Result<FeatureCollection, MapError> {
        let url = self.endpoints.query_url(kind, query);
        debug!("Fetching {} dataset from {}", kind.endpoint_path(), &url);

        let response = CLIENT
            .get(&url)
            .bearer_auth(self.endpoints.bearer_token())
            .send()?;

        if !response.status().is_success() {
            return Err(MapError::DatasetDownloadError(response.status().to_string()));
        }

        let body = response.text()?;
        let geojson: GeoJson = body.parse()?;
        Ok(FeatureCollection::try_from(geojson)?)
    }
}

type FetchPromise = Promise<Result<FeatureCollection, Arc<eyre::Report>>>;

/// An in-flight viewport query: one fetch slot per dataset kind, merged into
/// a bundle as results arrive.
struct PendingQuery {
    fetches: [Option<FetchPromise>; 3],
    bundle: DatasetBundle,
}

impl PendingQuery {
    fn is_settled(&self) -> bool {
        self.fetches.iter().all(Option::is_none)
    }
}

/// The viewport data cache.
pub struct ViewportCache {
    source: Arc<dyn DatasetSource>,
    entries: HashMap<String, CacheEntry>,
    pending: HashMap<String, PendingQuery>,
    ttl: Duration,
    max_entries: usize,
}

impl ViewportCache {
    /// How long a cache entry stays fresh.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

    /// Maximum number of cached viewport entries.
    pub const DEFAULT_MAX_ENTRIES: usize = 50;

    /// Creates a cache with the default TTL and capacity.
    pub fn new(source: Arc<dyn DatasetSource>) -> Self {
        Self::with_limits(source, Self::DEFAULT_TTL, Self::DEFAULT_MAX_ENTRIES)
    }

    /// Creates a cache with explicit TTL and capacity.
    pub fn with_limits(source: Arc<dyn DatasetSource>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            source,
            entries: HashMap::new(),
            pending: HashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Requests the datasets for a viewport.
    ///
    /// A fresh cache hit re-emits the entry's feature counts into the
    /// registry and returns immediately without any network activity. A key
    /// that is already in flight is left alone. Otherwise one background
    /// fetch per dataset kind is spawned; completed fetches are merged in
    /// [`ViewportCache::poll`].
    pub fn load(&mut self, query: &ViewportQuery, registry: &mut LayerRegistry) {
        let key = query.cache_key();

        if let Some(entry) = self.entries.get(&key) {
            if !entry.is_stale(self.ttl) {
                emit_counts(&entry.data, registry);
                return;
            }
        }

        if self.pending.contains_key(&key) {
            // Already in flight; a second call for the same key must not
            // multiply fetches.
            return;
        }

        debug!("Viewport cache miss for key {key}");
        let fetches = DatasetKind::ALL.map(|kind| {
            let source = self.source.clone();
            let query = *query;
            Some(Promise::spawn_thread(
                "fetch_dataset",
                move || -> Result<_, Arc<eyre::Report>> {
                    let result: Result<_, eyre::Report> = source
                        .fetch(kind, &query)
                        .map_err(eyre::Report::from)
                        .with_context(|| {
                            format!("Failed to fetch {} dataset", kind.endpoint_path())
                        });
                    result.map_err(Arc::new)
                },
            ))
        });

        self.pending.insert(
            key,
            PendingQuery {
                fetches,
                bundle: DatasetBundle::default(),
            },
        );
    }

    /// Merges completed fetches into the cache.
    ///
    /// Each resolved dataset kind pushes its feature count into the registry
    /// as it arrives (0 when the fetch failed). Once all three fetches of a
    /// key have settled, the assembled bundle is written as a cache entry and
    /// oldest-first eviction is applied.
    pub fn poll(&mut self, registry: &mut LayerRegistry) {
        let mut settled_keys = Vec::new();

        for (key, pending) in &mut self.pending {
            for kind in DatasetKind::ALL {
                let Some(promise) = pending.fetches[kind.index()].take() else {
                    continue;
                };
                match promise.try_take() {
                    Ok(Ok(collection)) => {
                        registry.set_feature_count(kind.layer_id(), collection.features.len());
                        pending.bundle.set(kind, collection);
                    }
                    Ok(Err(e)) => {
                        // A failed kind degrades to absent and must not fail
                        // the other two fetches.
                        warn!("{:?}", e);
                        registry.set_feature_count(kind.layer_id(), 0);
                    }
                    Err(promise) => {
                        pending.fetches[kind.index()] = Some(promise);
                    }
                }
            }
            if pending.is_settled() {
                settled_keys.push(key.clone());
            }
        }

        for key in settled_keys {
            if let Some(pending) = self.pending.remove(&key) {
                self.entries.insert(
                    key,
                    CacheEntry {
                        data: pending.bundle,
                        fetched_at: Instant::now(),
                    },
                );
            }
        }

        self.evict();
    }

    /// The cached bundle for a viewport, fresh or stale, if any.
    pub fn get(&self, query: &ViewportQuery) -> Option<&DatasetBundle> {
        self.entries.get(&query.cache_key()).map(|entry| &entry.data)
    }

    /// Whether a fetch for this viewport is still outstanding.
    pub fn is_loading(&self, query: &ViewportQuery) -> bool {
        self.pending.contains_key(&query.cache_key())
    }

    /// Whether any fetch at all is outstanding.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self) {
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.fetched_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    debug!("Evicting oldest viewport cache entry {key}");
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

fn emit_counts(bundle: &DatasetBundle, registry: &mut LayerRegistry) {
    for kind in DatasetKind::ALL {
        registry.set_feature_count(kind.layer_id(), bundle.feature_count(kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geojson::Feature;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Counts fetches per kind and can be told to fail specific kinds.
    struct MockSource {
        calls: Mutex<Vec<DatasetKind>>,
        failing: Vec<DatasetKind>,
        features_per_kind: usize,
    }

    impl MockSource {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failing: Vec::new(),
                features_per_kind: 2,
            }
        }

        fn failing(kinds: &[DatasetKind]) -> Self {
            Self {
                failing: kinds.to_vec(),
                ..Self::new()
            }
        }

        fn call_count(&self, kind: DatasetKind) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|k| **k == kind)
                .count()
        }
    }

    impl DatasetSource for MockSource {
        fn fetch(
            &self,
            kind: DatasetKind,
            _query: &ViewportQuery,
        ) -> Result<FeatureCollection, MapError> {
            self.calls.lock().unwrap().push(kind);
            if self.failing.contains(&kind) {
                return Err(MapError::DatasetDownloadError("500".to_string()));
            }
            Ok(FeatureCollection {
                bbox: None,
                features: (0..self.features_per_kind)
                    .map(|_| Feature::default())
                    .collect(),
                foreign_members: None,
            })
        }
    }

    fn query(west: f64) -> ViewportQuery {
        ViewportQuery {
            bounds: Bounds {
                west,
                south: -3.5,
                east: west + 1.0,
                north: -2.5,
            },
            zoom: 12,
        }
    }

    /// Polls until no fetches are outstanding. The mock source resolves
    /// quickly, so a generous iteration cap only guards against bugs.
    fn settle(cache: &mut ViewportCache, registry: &mut LayerRegistry) {
        for _ in 0..5000 {
            cache.poll(registry);
            if !cache.has_pending() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("cache fetches did not settle");
    }

    #[test]
    fn cache_key_fixed_precision() {
        let q = query(-60.5);
        assert_eq!(q.cache_key(), "-60.500000,-3.500000,-59.500000,-2.500000:12");
    }

    #[test]
    fn fresh_hit_issues_no_second_fetch() {
        let source = Arc::new(MockSource::new());
        let mut cache = ViewportCache::new(source.clone() as Arc<dyn DatasetSource>);
        let mut registry = LayerRegistry::new();
        let q = query(-60.0);

        cache.load(&q, &mut registry);
        settle(&mut cache, &mut registry);

        // Two more loads within the TTL must not fetch again.
        cache.load(&q, &mut registry);
        cache.load(&q, &mut registry);

        for kind in DatasetKind::ALL {
            assert_eq!(source.call_count(kind), 1);
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn stale_entry_triggers_fresh_fetches() {
        let source = Arc::new(MockSource::new());
        let mut cache = ViewportCache::with_limits(
            source.clone() as Arc<dyn DatasetSource>,
            Duration::from_millis(10),
            ViewportCache::DEFAULT_MAX_ENTRIES,
        );
        let mut registry = LayerRegistry::new();
        let q = query(-60.0);

        cache.load(&q, &mut registry);
        settle(&mut cache, &mut registry);

        std::thread::sleep(Duration::from_millis(20));
        cache.load(&q, &mut registry);
        settle(&mut cache, &mut registry);

        for kind in DatasetKind::ALL {
            assert_eq!(source.call_count(kind), 2);
        }
    }

    #[test]
    fn in_flight_key_is_not_fetched_twice() {
        let source = Arc::new(MockSource::new());
        let mut cache = ViewportCache::new(source.clone() as Arc<dyn DatasetSource>);
        let mut registry = LayerRegistry::new();
        let q = query(-60.0);

        // Rapid repeated loads before any poll, as a pan tick would produce.
        cache.load(&q, &mut registry);
        cache.load(&q, &mut registry);
        cache.load(&q, &mut registry);
        settle(&mut cache, &mut registry);

        for kind in DatasetKind::ALL {
            assert_eq!(source.call_count(kind), 1);
        }
    }

    #[test]
    fn partial_failure_degrades_one_kind_only() {
        let source = Arc::new(MockSource::failing(&[DatasetKind::Evidence]));
        let mut cache = ViewportCache::new(source as Arc<dyn DatasetSource>);
        let mut registry = LayerRegistry::new();
        let q = query(-60.0);

        cache.load(&q, &mut registry);
        settle(&mut cache, &mut registry);

        let bundle = cache.get(&q).unwrap();
        assert!(bundle.get(DatasetKind::Evidence).is_none());
        assert!(bundle.get(DatasetKind::Concession).is_some());
        assert!(bundle.get(DatasetKind::Analysis).is_some());
        assert!(!bundle.is_empty());

        let evidence = registry.layer_for_kind(DatasetKind::Evidence).unwrap();
        let concession = registry.layer_for_kind(DatasetKind::Concession).unwrap();
        let analysis = registry.layer_for_kind(DatasetKind::Analysis).unwrap();
        assert_eq!(evidence.feature_count, 0);
        assert_eq!(concession.feature_count, 2);
        assert_eq!(analysis.feature_count, 2);
    }

    #[test]
    fn all_failed_bundle_is_empty() {
        let source = Arc::new(MockSource::failing(&DatasetKind::ALL));
        let mut cache = ViewportCache::new(source as Arc<dyn DatasetSource>);
        let mut registry = LayerRegistry::new();
        let q = query(-60.0);

        cache.load(&q, &mut registry);
        settle(&mut cache, &mut registry);

        assert!(cache.get(&q).unwrap().is_empty());
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let source = Arc::new(MockSource::new());
        let mut cache = ViewportCache::with_limits(
            source as Arc<dyn DatasetSource>,
            ViewportCache::DEFAULT_TTL,
            50,
        );
        let mut registry = LayerRegistry::new();

        for i in 0..51 {
            let q = query(-120.0 + i as f64);
            cache.load(&q, &mut registry);
            settle(&mut cache, &mut registry);
        }

        assert_eq!(cache.len(), 50);
        // The first key in was the oldest and must be gone.
        assert!(cache.get(&query(-120.0)).is_none());
        // The newest key is still present.
        assert!(cache.get(&query(-120.0 + 50.0)).is_some());
    }

    #[test]
    fn distinct_keys_are_independent() {
        let source = Arc::new(MockSource::new());
        let mut cache = ViewportCache::new(source.clone() as Arc<dyn DatasetSource>);
        let mut registry = LayerRegistry::new();

        let a = query(-60.0);
        let b = query(-61.0);
        cache.load(&a, &mut registry);
        cache.load(&b, &mut registry);
        settle(&mut cache, &mut registry);

        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_some());
        for kind in DatasetKind::ALL {
            assert_eq!(source.call_count(kind), 2);
        }
    }
}
