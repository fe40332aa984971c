//! In-memory indexes fed by the cluster watchers.
//!
//! Readers take a snapshot of the whole map and never block writers; each
//! write copies the map only when a snapshot is still alive. A relist
//! builds a fresh map on the side and swaps it in once the watcher reports
//! the initial listing is complete.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crds::{TridentMirrorRelationship, TridentVolumeReference};
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use storage_core::{OrchestratorError, Result};
use tracing::warn;

use crate::backoff::{ExponentialBackoff, retry};

/// Any object one of the watchers can cache
#[derive(Debug, Clone)]
pub enum CachedObject {
    Claim(Arc<PersistentVolumeClaim>),
    Volume(Arc<PersistentVolume>),
    Class(Arc<StorageClass>),
    Node(Arc<Node>),
    Mirror(Arc<TridentMirrorRelationship>),
    Reference(Arc<TridentVolumeReference>),
}

impl CachedObject {
    fn kind(&self) -> &'static str {
        match self {
            Self::Claim(_) => <PersistentVolumeClaim as CacheKind>::KIND,
            Self::Volume(_) => <PersistentVolume as CacheKind>::KIND,
            Self::Class(_) => <StorageClass as CacheKind>::KIND,
            Self::Node(_) => <Node as CacheKind>::KIND,
            Self::Mirror(_) => <TridentMirrorRelationship as CacheKind>::KIND,
            Self::Reference(_) => <TridentVolumeReference as CacheKind>::KIND,
        }
    }

    fn key(&self) -> Option<String> {
        match self {
            Self::Claim(o) => CacheKind::cache_key(o.as_ref()),
            Self::Volume(o) => CacheKind::cache_key(o.as_ref()),
            Self::Class(o) => CacheKind::cache_key(o.as_ref()),
            Self::Node(o) => CacheKind::cache_key(o.as_ref()),
            Self::Mirror(o) => CacheKind::cache_key(o.as_ref()),
            Self::Reference(o) => CacheKind::cache_key(o.as_ref()),
        }
    }
}

/// A resource type the indexes know how to store.
///
/// Core objects are keyed by UID, mirror relationships by namespaced name
/// and volume references by `crNamespace_pvcNamespace/pvcName`.
pub trait CacheKind: Sized + Send + Sync + 'static {
    const KIND: &'static str;

    /// Index key, `None` when the object lacks the fields it is keyed by
    fn cache_key(&self) -> Option<String>;

    fn wrap(self: Arc<Self>) -> CachedObject;

    fn unwrap(object: &CachedObject) -> Option<Arc<Self>>;
}

macro_rules! uid_keyed {
    ($ty:ty, $kind:literal, $variant:ident) => {
        impl CacheKind for $ty {
            const KIND: &'static str = $kind;

            fn cache_key(&self) -> Option<String> {
                self.metadata.uid.clone()
            }

            fn wrap(self: Arc<Self>) -> CachedObject {
                CachedObject::$variant(self)
            }

            fn unwrap(object: &CachedObject) -> Option<Arc<Self>> {
                match object {
                    CachedObject::$variant(o) => Some(Arc::clone(o)),
                    _ => None,
                }
            }
        }
    };
}

uid_keyed!(PersistentVolumeClaim, "PersistentVolumeClaim", Claim);
uid_keyed!(PersistentVolume, "PersistentVolume", Volume);
uid_keyed!(StorageClass, "StorageClass", Class);
uid_keyed!(Node, "Node", Node);

impl CacheKind for TridentMirrorRelationship {
    const KIND: &'static str = "TridentMirrorRelationship";

    fn cache_key(&self) -> Option<String> {
        Some(format!("{}/{}", self.namespace()?, self.metadata.name.as_deref()?))
    }

    fn wrap(self: Arc<Self>) -> CachedObject {
        CachedObject::Mirror(self)
    }

    fn unwrap(object: &CachedObject) -> Option<Arc<Self>> {
        match object {
            CachedObject::Mirror(o) => Some(Arc::clone(o)),
            _ => None,
        }
    }
}

impl CacheKind for TridentVolumeReference {
    const KIND: &'static str = "TridentVolumeReference";

    fn cache_key(&self) -> Option<String> {
        self.metadata.namespace.as_ref()?;
        Some(TridentVolumeReference::cache_key(self))
    }

    fn wrap(self: Arc<Self>) -> CachedObject {
        CachedObject::Reference(self)
    }

    fn unwrap(object: &CachedObject) -> Option<Arc<Self>> {
        match object {
            CachedObject::Reference(o) => Some(Arc::clone(o)),
            _ => None,
        }
    }
}

/// Outcome of an index lookup
#[derive(Debug)]
pub enum Lookup<T> {
    Found(Arc<T>),
    NotFound,
    /// The key holds an object of another kind
    WrongType(&'static str),
    /// The index cannot answer yet
    SearchError(String),
}

impl<T: CacheKind> Lookup<T> {
    /// Categorized error for everything but [`Lookup::Found`]
    pub fn into_result(self, key: &str) -> Result<Arc<T>> {
        match self {
            Self::Found(object) => Ok(object),
            Self::NotFound => Err(OrchestratorError::not_found(T::KIND, key)),
            Self::WrongType(found) => Err(OrchestratorError::internal(format!(
                "{} cache entry {key} holds a {found}",
                T::KIND
            ))),
            Self::SearchError(message) => Err(OrchestratorError::BootstrapInProgress(format!(
                "{} cache: {message}",
                T::KIND
            ))),
        }
    }
}

type Objects = BTreeMap<String, CachedObject>;

/// Copy-on-write index for one watcher
#[derive(Debug)]
pub struct Index {
    name: &'static str,
    objects: RwLock<Arc<Objects>>,
    relist: Mutex<Option<Objects>>,
    synced: AtomicBool,
}

impl Index {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            objects: RwLock::new(Arc::new(BTreeMap::new())),
            relist: Mutex::new(None),
            synced: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True once a full listing has been loaded
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Arc<Objects> {
        Arc::clone(&self.objects.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Insert or replace an object
    pub fn apply(&self, object: CachedObject) {
        let Some(key) = object.key() else {
            warn!(index = self.name, kind = object.kind(), "Object has no cache key, skipping");
            return;
        };
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        Arc::make_mut(&mut objects).insert(key, object);
    }

    /// Remove an object, if present
    pub fn remove(&self, object: &CachedObject) {
        if let Some(key) = object.key() {
            let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            Arc::make_mut(&mut objects).remove(&key);
        }
    }

    /// Start collecting a relist; reads keep seeing the previous contents
    pub fn begin_relist(&self) {
        *self.relist.lock().unwrap_or_else(PoisonError::into_inner) = Some(BTreeMap::new());
    }

    pub fn relist_apply(&self, object: CachedObject) {
        let Some(key) = object.key() else {
            warn!(index = self.name, kind = object.kind(), "Object has no cache key, skipping");
            return;
        };
        let mut relist = self.relist.lock().unwrap_or_else(PoisonError::into_inner);
        relist.get_or_insert_with(BTreeMap::new).insert(key, object);
    }

    /// Swap in the relisted contents and mark the index synced
    pub fn finish_relist(&self) {
        let fresh = self
            .relist
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();
        *self.objects.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(fresh);
        self.synced.store(true, Ordering::Release);
    }

    /// Mark synced without a listing
    #[cfg(test)]
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub fn get<T: CacheKind>(&self, key: &str) -> Lookup<T> {
        if !self.is_synced() {
            return Lookup::SearchError(format!("{} index has not synced", self.name));
        }
        match self.snapshot().get(key) {
            None => Lookup::NotFound,
            Some(object) => T::unwrap(object).map_or(Lookup::WrongType(object.kind()), Lookup::Found),
        }
    }

    /// First object of kind `T` matching `predicate`
    pub fn find<T: CacheKind>(&self, predicate: impl Fn(&T) -> bool) -> Lookup<T> {
        if !self.is_synced() {
            return Lookup::SearchError(format!("{} index has not synced", self.name));
        }
        self.snapshot()
            .values()
            .filter_map(T::unwrap)
            .find(|o| predicate(o))
            .map_or(Lookup::NotFound, Lookup::Found)
    }

    /// Every object of kind `T`
    pub fn list<T: CacheKind>(&self) -> Vec<Arc<T>> {
        self.snapshot().values().filter_map(T::unwrap).collect()
    }
}

/// The six watcher indexes
#[derive(Debug)]
pub struct Indexes {
    pub claims: Index,
    pub volumes: Index,
    pub classes: Index,
    pub nodes: Index,
    pub mirrors: Index,
    pub references: Index,
}

impl Default for Indexes {
    fn default() -> Self {
        Self {
            claims: Index::new("claims"),
            volumes: Index::new("volumes"),
            classes: Index::new("classes"),
            nodes: Index::new("nodes"),
            mirrors: Index::new("mirrors"),
            references: Index::new("references"),
        }
    }
}

/// Poll `lookup` until it finds the object or `bound` has elapsed.
///
/// Missing objects and unsynced indexes are retried; a wrong-type entry
/// fails at once.
pub async fn cache_wait<T, F>(what: &str, key: &str, bound: Duration, lookup: F) -> Result<Arc<T>>
where
    T: CacheKind,
    F: Fn() -> Lookup<T>,
{
    retry(
        ExponentialBackoff::default().with_max_elapsed(bound),
        what,
        |e: &OrchestratorError| e.is_not_found() || e.is_retryable(),
        || std::future::ready(lookup().into_result(key)),
    )
    .await
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn synced(name: &'static str) -> Index {
        let index = Index::new(name);
        index.mark_synced();
        index
    }

    #[test]
    fn test_lookup_before_sync_is_a_search_error() {
        let index = Index::new("claims");
        index.apply(Arc::new(claim("ns", "data", Some("1Gi"))).wrap());
        assert!(matches!(
            index.get::<PersistentVolumeClaim>("uid-ns-data"),
            Lookup::SearchError(_)
        ));
    }

    #[test]
    fn test_four_lookup_outcomes() {
        let index = synced("claims");
        index.apply(Arc::new(claim("ns", "data", Some("1Gi"))).wrap());
        index.apply(Arc::new(node("n1")).wrap());

        assert!(matches!(index.get::<PersistentVolumeClaim>("uid-ns-data"), Lookup::Found(_)));
        assert!(matches!(index.get::<PersistentVolumeClaim>("uid-ns-other"), Lookup::NotFound));
        assert!(matches!(
            index.get::<PersistentVolumeClaim>("uid-cluster-n1"),
            Lookup::WrongType("Node")
        ));

        let err = index
            .get::<PersistentVolumeClaim>("uid-cluster-n1")
            .into_result("uid-cluster-n1")
            .expect_err("wrong type");
        assert!(err.to_string().contains("holds a Node"));
    }

    #[test]
    fn test_snapshots_survive_writes() {
        let index = synced("nodes");
        index.apply(Arc::new(node("n1")).wrap());
        let before = index.snapshot();
        index.apply(Arc::new(node("n2")).wrap());
        assert_eq!(before.len(), 1);
        assert_eq!(index.list::<Node>().len(), 2);

        index.remove(&Arc::new(node("n1")).wrap());
        assert_eq!(index.list::<Node>().len(), 1);
    }

    #[test]
    fn test_relist_replaces_contents() {
        let index = Index::new("nodes");
        index.apply(Arc::new(node("gone")).wrap());

        index.begin_relist();
        index.relist_apply(Arc::new(node("n1")).wrap());
        assert!(!index.is_synced());
        index.finish_relist();

        let names: Vec<String> = index.list::<Node>().iter().map(|n| n.name_any()).collect();
        assert_eq!(names, vec!["n1".to_string()]);
        assert!(index.is_synced());
    }

    #[test]
    fn test_find_by_predicate() {
        let index = synced("volumes");
        index.apply(Arc::new(bound_volume("pv-1", "ns", "data")).wrap());
        let found = index.find::<PersistentVolume>(|pv| pv.name_any() == "pv-1");
        assert!(matches!(found, Lookup::Found(_)));
        let missing = index.find::<PersistentVolume>(|pv| pv.name_any() == "pv-2");
        assert!(matches!(missing, Lookup::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_wait_gives_up_after_its_bound() {
        let index = synced("claims");
        let started = tokio::time::Instant::now();
        let err = cache_wait("claim", "uid-ns-data", Duration::from_secs(10), || {
            index.get::<PersistentVolumeClaim>("uid-ns-data")
        })
        .await
        .expect_err("never appears");
        assert!(err.is_not_found());
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_wait_sees_late_arrivals() {
        let index = Arc::new(synced("claims"));
        let writer = Arc::clone(&index);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            writer.apply(Arc::new(claim("ns", "data", Some("1Gi"))).wrap());
        });

        let found = cache_wait("claim", "uid-ns-data", Duration::from_secs(30), || {
            index.get::<PersistentVolumeClaim>("uid-ns-data")
        })
        .await
        .expect("found");
        assert_eq!(found.name_any(), "data");
    }

    #[test]
    fn test_reference_key() {
        let reference = TridentVolumeReference {
            metadata: meta(Some("team-b"), "ref"),
            spec: crds::TridentVolumeReferenceSpec {
                pvc_name: "data".to_string(),
                pvc_namespace: "team-a".to_string(),
            },
        };
        assert_eq!(
            CacheKind::cache_key(&reference),
            Some("team-b_team-a/data".to_string())
        );
    }
}
