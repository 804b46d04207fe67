//! Worker loops, watch-driven enqueueing and periodic resync shared by the
//! controllers.

use std::fmt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::api::v1alpha1::{API_GROUP, API_VERSION};
use crate::controllers::queue::{QueueKey, WorkQueue};
use crate::util::errors::{Error, Result};
use crate::util::metrics::Metrics;

/// Namespace and name of a queued object. The queue only ever carries keys;
/// handlers read the object back from their cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        Some(Self::new(obj.meta().namespace.clone()?, obj.meta().name.clone()?))
    }

    pub fn object_ref<K>(&self) -> ObjectRef<K>
    where
        K: Resource<DynamicType = ()>,
    {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Key of the object's controlling owner, when that owner is a `kind` from
/// our API group.
pub fn controller_owner_key<K: Resource>(obj: &K, kind: &str) -> Option<ObjectKey> {
    let owner = obj.owner_references().iter().find(|o| o.controller == Some(true))?;
    if owner.kind != kind || owner.api_version != format!("{API_GROUP}/{API_VERSION}") {
        return None;
    }
    Some(ObjectKey::new(obj.namespace()?, owner.name.clone()))
}

/// A level-triggered handler driven by a [`WorkQueue`].
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Key: QueueKey + fmt::Display;

    fn name(&self) -> &'static str;

    fn metrics(&self) -> &Metrics;

    /// Converges the object identified by `key`. Must be idempotent.
    async fn sync(&self, key: &Self::Key) -> Result<()>;
}

/// Takes one key off the queue and syncs it. Returns false once the queue
/// has shut down.
pub async fn process_next_work_item<R: Reconciler>(reconciler: &R, queue: &WorkQueue<R::Key>) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    let result = {
        let _timer = reconciler.metrics().count_and_measure(reconciler.name());
        AssertUnwindSafe(reconciler.sync(&key)).catch_unwind().await
    };

    match result {
        Ok(Ok(())) => {
            debug!(controller = reconciler.name(), %key, "synced");
            queue.forget(&key);
        }
        Ok(Err(Error::ErrorWithRequeue(e))) => {
            warn!(controller = reconciler.name(), %key, error = %e, "sync failed, requeueing after {:?}", e.duration);
            reconciler
                .metrics()
                .failures
                .with_label_values(&[reconciler.name(), e.metric_label().as_ref()])
                .inc();
            queue.add_after(key.clone(), e.duration);
        }
        Ok(Err(e)) => {
            warn!(controller = reconciler.name(), %key, error = %e, "sync failed");
            reconciler.metrics().reconcile_failure(reconciler.name(), &e);
            queue.add_rate_limited(key.clone());
        }
        Err(_) => {
            error!(controller = reconciler.name(), %key, "sync panicked");
            reconciler
                .metrics()
                .failures
                .with_label_values(&[reconciler.name(), "panic"])
                .inc();
            queue.add_rate_limited(key.clone());
        }
    }

    queue.done(&key);
    true
}

/// Runs `workers` loops over `queue` until it shuts down and every worker
/// finished its current key.
pub async fn run_workers<R: Reconciler>(reconciler: Arc<R>, queue: WorkQueue<R::Key>, workers: usize) {
    info!(controller = reconciler.name(), workers, "starting workers");
    let handles = (0..workers.max(1)).map(|_| {
        let reconciler = reconciler.clone();
        let queue = queue.clone();
        tokio::spawn(async move { while process_next_work_item(reconciler.as_ref(), &queue).await {} })
    });
    for handle in futures::future::join_all(handles).await {
        if let Err(e) = handle {
            error!(controller = reconciler.name(), error = %e, "worker exited abnormally");
        }
    }
    info!(controller = reconciler.name(), "workers stopped");
}

/// Mirrors `api` into `writer` and enqueues whatever `map` derives from each
/// changed or deleted object.
pub async fn watch_and_enqueue<K, F>(
    api: Api<K>,
    config: watcher::Config,
    writer: Writer<K>,
    queue: WorkQueue<ObjectKey>,
    map: F,
) where
    K: Resource + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
    F: Fn(&K) -> Option<ObjectKey>,
{
    let mut events = pin!(reflector::reflector(writer, watcher(api, config))
        .default_backoff()
        .touched_objects());
    while let Some(event) = events.next().await {
        match event {
            Ok(obj) => {
                if let Some(key) = map(&obj) {
                    queue.add(key);
                }
            }
            Err(e) => warn!(queue = queue.name(), error = %e, "watch stream error"),
        }
    }
}

/// Re-enqueues every object in `store` matching `filter` once per `period`.
pub async fn resync_periodically<K, F>(store: Store<K>, queue: WorkQueue<ObjectKey>, period: Duration, filter: F)
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
    F: Fn(&K) -> bool,
{
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if queue.is_shutting_down() {
            return;
        }
        let mut enqueued = 0;
        for obj in store.state() {
            if !filter(&obj) {
                continue;
            }
            if let Some(key) = ObjectKey::of(obj.as_ref()) {
                queue.add(key);
                enqueued += 1;
            }
        }
        debug!(queue = queue.name(), enqueued, "resync");
    }
}

/// `Api` over one namespace, or all of them when unset.
pub fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Objects in `store` within `namespace` that satisfy `filter`.
pub fn list_namespaced<K, F>(store: &Store<K>, namespace: &str, filter: F) -> Vec<Arc<K>>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
    F: Fn(&K) -> bool,
{
    let mut found: Vec<Arc<K>> = store
        .state()
        .into_iter()
        .filter(|o| o.meta().namespace.as_deref() == Some(namespace) && filter(o))
        .collect();
    found.sort_by(|a, b| a.meta().name.cmp(&b.meta().name));
    found
}
