//! In-memory Instrumentation store
//!
//! Admission requests read the store concurrently while a single watch loop
//! keeps it in sync with the API server. Lookups never touch the network.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::Instrumentation;
use crate::telemetry::{HeartbeatLog, HeartbeatMetric, Telemetry};

/// `(namespace, name)` of an Instrumentation resource
pub type StoreKey = (String, String);

fn key_of(cr: &Instrumentation) -> StoreKey {
    (cr.namespace().unwrap_or_default(), cr.name_any())
}

/// Instrumentation resources by namespace and name
#[derive(Default)]
pub struct InstrumentationStore {
    items: DashMap<StoreKey, Arc<Instrumentation>>,
}

impl InstrumentationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a resource by namespace and name
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<Instrumentation>> {
        self.items
            .get(&(namespace.to_string(), name.to_string()))
            .map(|e| Arc::clone(e.value()))
    }

    /// Insert or replace a resource
    pub fn upsert(&self, cr: Instrumentation) {
        self.items.insert(key_of(&cr), Arc::new(cr));
    }

    /// Remove a resource, returning it if present
    pub fn remove(&self, namespace: &str, name: &str) -> Option<Arc<Instrumentation>> {
        self.items
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|(_, cr)| cr)
    }

    /// Number of resources held
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store holds no resources
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replace the whole content with `crs`
    ///
    /// New entries are inserted before stale ones are dropped, so readers
    /// never observe a transiently empty store during a relist.
    pub fn replace_all(&self, crs: Vec<Instrumentation>) {
        let keep: HashSet<StoreKey> = crs.iter().map(key_of).collect();
        for cr in crs {
            self.upsert(cr);
        }
        self.items.retain(|key, _| keep.contains(key));
    }
}

/// Folds watcher events into an [`InstrumentationStore`]
///
/// A relist (`Init` .. `InitDone`) is buffered and swapped in at once so
/// resources deleted while the watch was down disappear from the store.
pub struct StoreWriter {
    store: Arc<InstrumentationStore>,
    relist: Option<Vec<Instrumentation>>,
}

impl StoreWriter {
    /// Create a writer for `store`
    pub fn new(store: Arc<InstrumentationStore>) -> Self {
        Self {
            store,
            relist: None,
        }
    }

    /// Apply one watcher event
    pub fn apply_event(&mut self, event: Event<Instrumentation>) {
        match event {
            Event::Apply(cr) => {
                debug!(namespace = ?cr.namespace(), name = %cr.name_any(), "Instrumentation applied");
                self.store.upsert(cr);
            }
            Event::Delete(cr) => {
                let (namespace, name) = key_of(&cr);
                debug!(%namespace, %name, "Instrumentation deleted");
                self.store.remove(&namespace, &name);
            }
            Event::Init => {
                self.relist = Some(Vec::new());
            }
            Event::InitApply(cr) => match self.relist.as_mut() {
                Some(buffer) => buffer.push(cr),
                None => self.store.upsert(cr),
            },
            Event::InitDone => {
                if let Some(crs) = self.relist.take() {
                    self.store.replace_all(crs);
                }
                info!(count = self.store.len(), "Instrumentation store synced");
            }
        }
    }
}

/// Keep `store` in sync with every Instrumentation in the cluster
///
/// Runs until the watch stream ends, which only happens on shutdown. Stream
/// errors are retried by the watcher's backoff.
pub async fn run_watcher(
    client: Client,
    store: Arc<InstrumentationStore>,
    telemetry: Arc<dyn Telemetry>,
) {
    let api: Api<Instrumentation> = Api::all(client);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = std::pin::pin!(stream);
    let mut writer = StoreWriter::new(Arc::clone(&store));

    info!("Instrumentation watcher started");

    while let Some(event) = stream.next().await {
        telemetry.add_heartbeat_metric(HeartbeatMetric::ApiServerCallCount, 1.0);
        match event {
            Ok(event) => {
                let synced = matches!(event, Event::InitDone);
                writer.apply_event(event);
                if synced {
                    telemetry.add_heartbeat_metric(HeartbeatMetric::CrCount, store.len() as f64);
                }
            }
            Err(e) => {
                warn!(error = %e, "Instrumentation watcher error, will retry");
                telemetry.add_heartbeat_metric(HeartbeatMetric::ApiServerCallErrorCount, 1.0);
                telemetry.append_heartbeat_log(
                    HeartbeatLog::ApiServerTopExceptionsEncountered,
                    &e.to_string(),
                );
            }
        }
    }

    warn!("Instrumentation watcher stream ended");
}
