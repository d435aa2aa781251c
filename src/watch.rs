//! Watch layer: long-running list-then-watch streams keep two local caches
//! (nodes and server pods) current, and every observed event collapses into a
//! single dirty flag. No business logic runs here; decisions belong to the
//! reconciler, which reads whole-cluster snapshots from the caches.

use std::fmt::Debug;
use std::hash::Hash;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{Lookup, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::sync::watch::Receiver;
use tracing::*;

use crate::common::{role_selector, DOTMESH_NAMESPACE};
use crate::error::Error;

/// Guarantees at least one reconcile pass per interval even if a watch event
/// was lost.
const RESYNC_PERIOD: Duration = Duration::from_secs(60);

/// "At least one update has happened since the last reconcile pass."
///
/// A boolean rather than a work queue: the unit of work is always the whole
/// cluster, so consecutive events coalesce into one pass.
#[derive(Default)]
pub struct DirtyFlag {
    updates_needed: Mutex<bool>,
}

impl DirtyFlag {
    pub fn mark(&self) {
        *self.updates_needed.lock().unwrap() = true;
    }

    /// Read and clear in one step.
    pub fn take(&self) -> bool {
        let mut needed = self.updates_needed.lock().unwrap();
        std::mem::take(&mut *needed)
    }
}

pub struct ClusterCaches {
    pub nodes: Store<Node>,
    pub pods: Store<Pod>,
    pub dirty: Arc<DirtyFlag>,
}

impl ClusterCaches {
    /// Spawn the node and pod cache pumps plus the forced-resync timer.
    /// `node_selector` is the user's label expression; empty watches all
    /// nodes.
    pub fn start(client: &Client, node_selector: &str, shutdown: Receiver<bool>) -> Self {
        let dirty = Arc::new(DirtyFlag::default());

        let node_api: Api<Node> = Api::all(client.clone());
        let mut node_cfg = watcher::Config::default();
        if !node_selector.is_empty() {
            node_cfg = node_cfg.labels(node_selector);
        }
        let (nodes, writer) = reflector::store();
        tokio::spawn(pump(
            "node",
            writer,
            watcher(node_api, node_cfg).default_backoff(),
            dirty.clone(),
            shutdown.clone(),
        ));

        let pod_api: Api<Pod> = Api::namespaced(client.clone(), DOTMESH_NAMESPACE);
        let pod_cfg = watcher::Config::default().labels(&role_selector());
        let (pods, writer) = reflector::store();
        tokio::spawn(pump(
            "pod",
            writer,
            watcher(pod_api, pod_cfg).default_backoff(),
            dirty.clone(),
            shutdown.clone(),
        ));

        tokio::spawn(resync_timer(dirty.clone(), shutdown));

        Self { nodes, pods, dirty }
    }

    /// Block until both caches have completed their initial list. The
    /// reconciler must not run before this returns. A shutdown signal aborts
    /// the wait; the caller's run loop then exits on its own first tick.
    pub async fn wait_for_sync(&self, mut shutdown: Receiver<bool>) -> Result<(), Error> {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            ready = self.nodes.wait_until_ready() => {
                ready.map_err(|_| Error::CacheSyncFailed("node"))?;
            }
        }
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            ready = self.pods.wait_until_ready() => {
                ready.map_err(|_| Error::CacheSyncFailed("pod"))?;
            }
        }
        Ok(())
    }
}

/// Drain a watch stream into its cache, marking the dirty flag on every
/// event. Stream errors are retried by the watcher's own backoff; they are
/// only logged here.
async fn pump<K, S>(
    kind: &'static str,
    writer: Writer<K>,
    watch_stream: S,
    dirty: Arc<DirtyFlag>,
    mut shutdown: Receiver<bool>,
) where
    K: Lookup + Clone + Debug,
    K::DynamicType: Eq + Hash + Clone,
    S: Stream<Item = watcher::Result<watcher::Event<K>>>,
{
    let mut stream = pin!(reflector(writer, watch_stream));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    trace!("{} event: {:?}", kind, event);
                    dirty.mark();
                }
                Some(Err(error)) => {
                    warn!("{} watch stream error: {}", kind, error);
                }
                None => break,
            }
        }
    }
    debug!("{} cache pump stopped", kind);
}

async fn resync_timer(dirty: Arc<DirtyFlag>, mut shutdown: Receiver<bool>) {
    let mut tick = tokio::time::interval(RESYNC_PERIOD);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                trace!("forced resync");
                dirty.mark();
            }
        }
    }
}
