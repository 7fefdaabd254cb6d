//! Core topic runtime.
//!
//! Module map:
//! - `access` — permission bitfield algebra
//! - `types` — user ids, auth levels, the topic naming scheme
//! - `wire` — client/server messages
//! - `session` — connections and the session registry
//! - `topic` — the per-topic single-writer event loop
//! - `hub` — name → topic routing, spawn and reap
//! - `presence` lives inside `topic`; `push` builds receipts
//! - `cluster` — master/proxy partitioning, failover
//! - `users` — process-wide unread counters

pub mod access;
pub mod cluster;
pub mod hub;
pub mod push;
pub mod session;
pub mod topic;
pub mod types;
pub mod users;
pub mod wire;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::core::constants::{
    DEFAULT_IDLE_MASTER_TOPIC_TIMEOUT_SECS, DEFAULT_MAX_DELETE_COUNT, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_MAX_SUBSCRIBER_COUNT, DEFAULT_SESSION_QUEUE_LEN,
};
use crate::data::traits::Store;

use cluster::Cluster;
use hub::Hub;
use push::Push;
use session::SessionStore;
use users::UserCache;

/// Topic runtime limits, resolved from the app config.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub idle_master_topic_timeout: Duration,
    pub max_subscriber_count: usize,
    pub max_message_size: usize,
    pub default_max_delete_count: usize,
    pub session_queue_len: usize,
    /// Tag namespaces only root may add or remove.
    pub restricted_tag_namespaces: Vec<String>,
    /// Tag namespaces hidden from discovery.
    pub masked_tag_namespaces: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            idle_master_topic_timeout: Duration::from_secs(
                DEFAULT_IDLE_MASTER_TOPIC_TIMEOUT_SECS,
            ),
            max_subscriber_count: DEFAULT_MAX_SUBSCRIBER_COUNT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            default_max_delete_count: DEFAULT_MAX_DELETE_COUNT,
            session_queue_len: DEFAULT_SESSION_QUEUE_LEN,
            restricted_tag_namespaces: Vec::new(),
            masked_tag_namespaces: Vec::new(),
        }
    }
}

/// Process-wide server context threaded through construction: the store,
/// the push registry, the session registry, the hub and (when clustered)
/// the cluster handle. The hub and cluster are attached after construction
/// because each needs the context to exist first.
pub struct ServerCtx {
    pub config: RuntimeConfig,
    pub store: Store,
    pub push: Arc<Push>,
    pub sessions: Arc<SessionStore>,
    pub users: Arc<UserCache>,
    hub: OnceLock<Arc<Hub>>,
    cluster: OnceLock<Option<Arc<Cluster>>>,
}

impl ServerCtx {
    pub fn new(config: RuntimeConfig, store: Store, push: Push) -> Arc<ServerCtx> {
        let session_queue_len = config.session_queue_len;
        Arc::new(ServerCtx {
            config,
            store,
            push: Arc::new(push),
            sessions: Arc::new(SessionStore::new(session_queue_len)),
            users: Arc::new(UserCache::new()),
            hub: OnceLock::new(),
            cluster: OnceLock::new(),
        })
    }

    pub fn attach_hub(&self, hub: Arc<Hub>) {
        if self.hub.set(hub).is_err() {
            tracing::warn!("hub attached twice");
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        self.hub.get().expect("hub not attached")
    }

    pub fn attach_cluster(&self, cluster: Option<Arc<Cluster>>) {
        if self.cluster.set(cluster).is_err() {
            tracing::warn!("cluster attached twice");
        }
    }

    /// `None` when running standalone.
    pub fn cluster(&self) -> Option<&Arc<Cluster>> {
        self.cluster.get().and_then(|c| c.as_ref())
    }
}

/// Build a fully wired standalone context: memory-store default, hub
/// attached, no cluster. The app shell uses this for single-node runs and
/// the test suite leans on it heavily.
pub fn standalone_ctx(config: RuntimeConfig, store: Store, push: Push) -> Arc<ServerCtx> {
    let ctx = ServerCtx::new(config, store, push);
    let hub = Hub::new(ctx.clone());
    ctx.attach_hub(hub);
    ctx.attach_cluster(None);
    ctx
}
