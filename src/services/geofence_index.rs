//! Geofence index - the current set of participating sites
//!
//! A `SiteSnapshot` is an immutable view built from one fetch of the site
//! source. Lookups prefilter by bounding box (radius plus margin) before the
//! detector computes exact distances.

use crate::domain::error::DetectError;
use crate::domain::geo::BoundingBox;
use crate::domain::types::{GeoPoint, Site, SiteId};
use crate::io::site_source::SiteSource;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct IndexedSite {
    site: Site,
    bbox: BoundingBox,
}

/// Immutable set of participating sites
#[derive(Debug, Clone, Default)]
pub struct SiteSnapshot {
    sites: Vec<IndexedSite>,
    by_id: FxHashMap<SiteId, usize>,
}

impl SiteSnapshot {
    /// Build from a raw site list, keeping only sites that participate.
    /// The first participating site wins when an id repeats.
    pub fn build(sites: Vec<Site>, margin_m: f64) -> Self {
        let mut snapshot = Self::default();
        for site in sites.into_iter().filter(Site::participates) {
            if snapshot.by_id.contains_key(&site.id) {
                warn!(site_id = %site.id, label = %site.label, "duplicate_site_skipped");
                continue;
            }
            let bbox = BoundingBox::around(site.center, site.radius_m + margin_m.max(0.0));
            snapshot.by_id.insert(site.id, snapshot.sites.len());
            snapshot.sites.push(IndexedSite { site, bbox });
        }
        snapshot
    }

    /// Sites whose padded bounding box contains the point
    pub fn near(&self, point: GeoPoint) -> SmallVec<[&Site; 8]> {
        self.sites.iter().filter(|s| s.bbox.contains(point)).map(|s| &s.site).collect()
    }

    pub fn get(&self, id: SiteId) -> Option<&Site> {
        self.by_id.get(&id).map(|&i| &self.sites[i].site)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// Source of site snapshots for detection
#[async_trait]
pub trait SiteIndex: Send + Sync {
    async fn snapshot(&self) -> Result<Arc<SiteSnapshot>, DetectError>;
}

/// Fixed snapshot (tests and static deployments)
pub struct FixedSiteIndex {
    snapshot: Arc<SiteSnapshot>,
}

impl FixedSiteIndex {
    pub fn new(sites: Vec<Site>, margin_m: f64) -> Self {
        Self { snapshot: Arc::new(SiteSnapshot::build(sites, margin_m)) }
    }
}

#[async_trait]
impl SiteIndex for FixedSiteIndex {
    async fn snapshot(&self) -> Result<Arc<SiteSnapshot>, DetectError> {
        Ok(self.snapshot.clone())
    }
}

struct CacheEntry {
    snapshot: Arc<SiteSnapshot>,
    loaded_at: Instant,
    checked_at: Instant,
}

/// Snapshot cache over a `SiteSource` with bounded refresh and staleness
pub struct CachedSiteIndex {
    source: Box<dyn SiteSource>,
    margin_m: f64,
    refresh_every: Duration,
    max_stale: Duration,
    cache: RwLock<Option<CacheEntry>>,
    /// Single in-flight refresh
    refresh_lock: tokio::sync::Mutex<()>,
}

impl CachedSiteIndex {
    pub fn new(
        source: Box<dyn SiteSource>,
        margin_m: f64,
        refresh_every: Duration,
        max_stale: Duration,
    ) -> Self {
        Self {
            source,
            margin_m,
            refresh_every,
            max_stale,
            cache: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn cached_if_fresh(&self) -> Option<Arc<SiteSnapshot>> {
        let cache = self.cache.read();
        let entry = cache.as_ref()?;
        if entry.checked_at.elapsed() < self.refresh_every
            && entry.loaded_at.elapsed() <= self.max_stale
        {
            Some(entry.snapshot.clone())
        } else {
            None
        }
    }

    async fn refresh(&self) -> Result<Arc<SiteSnapshot>, DetectError> {
        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(snapshot) = self.cached_if_fresh() {
            return Ok(snapshot);
        }

        match self.source.fetch().await {
            Ok(sites) => {
                let fetched = sites.len();
                let snapshot = Arc::new(SiteSnapshot::build(sites, self.margin_m));
                let now = Instant::now();
                info!(
                    source = %self.source.name(),
                    fetched = %fetched,
                    participating = %snapshot.len(),
                    "site_index_refreshed"
                );
                *self.cache.write() =
                    Some(CacheEntry { snapshot: snapshot.clone(), loaded_at: now, checked_at: now });
                Ok(snapshot)
            }
            Err(e) => {
                let mut cache = self.cache.write();
                match cache.as_mut() {
                    Some(entry) if entry.loaded_at.elapsed() <= self.max_stale => {
                        entry.checked_at = Instant::now();
                        warn!(
                            source = %self.source.name(),
                            error = %e,
                            age_secs = %entry.loaded_at.elapsed().as_secs(),
                            "site_index_refresh_failed_using_cached"
                        );
                        Ok(entry.snapshot.clone())
                    }
                    _ => Err(DetectError::SiteIndexUnavailable { reason: e.to_string() }),
                }
            }
        }
    }
}

#[async_trait]
impl SiteIndex for CachedSiteIndex {
    async fn snapshot(&self) -> Result<Arc<SiteSnapshot>, DetectError> {
        if let Some(snapshot) = self.cached_if_fresh() {
            return Ok(snapshot);
        }
        self.refresh().await
    }
}
