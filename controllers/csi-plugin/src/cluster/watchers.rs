//! Cluster watchers.
//!
//! One task per resource type lists then watches it, keeps its index
//! current and hands every event to the plugin. A separate task resyncs
//! storage classes and nodes every minute, and clusters too old for CSI
//! expansion also get the legacy resize pass.

use std::fmt::Debug;
use std::sync::Arc;

use crds::{TridentMirrorRelationship, TridentVolumeReference};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Api, Client, Resource};
use kube_runtime::{WatchStreamExt, watcher};
use serde::de::DeserializeOwned;
use storage_core::{Feature, FrontendHelper};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::index::{CacheKind, Index, Indexes};
use super::{KubernetesPlugin, LEGACY_RESIZE_PERIOD, RESYNC_PERIOD};
use crate::frontend::stopped;

impl KubernetesPlugin {
    /// Spawn the watchers and periodic passes; they stop when `shutdown` flips
    pub fn start(
        self: &Arc<Self>,
        client: &Client,
        namespace: Option<&str>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let custom = |client: Client| -> (Api<TridentMirrorRelationship>, Api<TridentVolumeReference>) {
            match namespace {
                Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
                None => (Api::all(client.clone()), Api::all(client)),
            }
        };
        let (mirrors, references) = custom(client.clone());

        let mut tasks = vec![
            self.spawn_watcher(Api::<PersistentVolumeClaim>::all(client.clone()), |i| &i.claims, shutdown.clone()),
            self.spawn_watcher(Api::<PersistentVolume>::all(client.clone()), |i| &i.volumes, shutdown.clone()),
            self.spawn_watcher(Api::<StorageClass>::all(client.clone()), |i| &i.classes, shutdown.clone()),
            self.spawn_watcher(Api::<Node>::all(client.clone()), |i| &i.nodes, shutdown.clone()),
            self.spawn_watcher(mirrors, |i| &i.mirrors, shutdown.clone()),
            self.spawn_watcher(references, |i| &i.references, shutdown.clone()),
        ];

        let plugin = Arc::clone(self);
        let mut stop = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RESYNC_PERIOD);
            loop {
                tokio::select! {
                    _ = ticker.tick() => plugin.resync().await,
                    () = stopped(&mut stop) => break,
                }
            }
        }));

        if self.supports_feature(Feature::ExpandVolume) {
            debug!("Cluster expands volumes through CSI, legacy resize disabled");
        } else {
            info!(version = %self.version, "Cluster predates CSI expansion, enabling legacy resize");
            let plugin = Arc::clone(self);
            let mut stop = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(LEGACY_RESIZE_PERIOD);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            plugin.resize_pass().await;
                        }
                        () = stopped(&mut stop) => break,
                    }
                }
            }));
        }

        info!(watchers = 6, namespace = ?namespace, "Kubernetes plugin started");
        tasks
    }

    fn spawn_watcher<K>(
        self: &Arc<Self>,
        api: Api<K>,
        index: fn(&Indexes) -> &Index,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        K: CacheKind + Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default,
    {
        let plugin = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = plugin.watch(api, index) => {}
                () = stopped(&mut shutdown) => {}
            }
            debug!(kind = K::KIND, "Watcher stopped");
        })
    }

    /// Feed one resource type into its index until the stream ends.
    ///
    /// Stream errors are logged and the watcher backs off and relists;
    /// handlers never fail the stream.
    async fn watch<K>(&self, api: Api<K>, index: fn(&Indexes) -> &Index)
    where
        K: CacheKind + Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default,
    {
        let index = index(&self.indexes);
        info!(kind = K::KIND, "Starting watcher");

        let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());
        while let Some(result) = stream.next().await {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!(kind = K::KIND, error = %e, "Watcher stream error");
                    continue;
                }
            };

            match event {
                watcher::Event::Apply(object) => {
                    let cached = Arc::new(object).wrap();
                    if Self::accepts(&cached) {
                        index.apply(cached.clone());
                        self.on_apply(&cached).await;
                    }
                }
                watcher::Event::Delete(object) => {
                    let cached = Arc::new(object).wrap();
                    index.remove(&cached);
                    self.on_delete(&cached).await;
                }
                watcher::Event::Init => {
                    debug!(kind = K::KIND, "Watcher relisting");
                    index.begin_relist();
                }
                watcher::Event::InitApply(object) => {
                    let cached = Arc::new(object).wrap();
                    if Self::accepts(&cached) {
                        index.relist_apply(cached.clone());
                        self.on_apply(&cached).await;
                    }
                }
                watcher::Event::InitDone => {
                    index.finish_relist();
                    info!(kind = K::KIND, index = index.name(), objects = index.list::<K>().len(), "Watcher synced");
                }
            }
        }

        warn!(kind = K::KIND, "Watcher stream ended");
    }
}
