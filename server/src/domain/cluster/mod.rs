//! Clustering: the master/proxy message contract.
//!
//! Topics are partitioned across nodes by a consistent-hash ring. A node
//! that is not master for a topic runs a *proxy topic* which relays client
//! packets to the master as [`ClusterReq`] frames; the master represents the
//! peer as a multiplexing session and answers with [`ClusterResp`]. The
//! network transport itself is out of scope: frames are MessagePack blobs
//! handed to a pluggable [`ClusterTransport`], and an in-process loopback
//! implementation backs the tests.

pub mod failover;
pub(crate) mod proxy;
mod ring;

pub use ring::Ring;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::constants::CLUSTER_PEER_QUEUE_LEN;
use crate::domain::ServerCtx;
use crate::domain::hub::{data_from_pub, info_from_note};
use crate::domain::session::Session;
use crate::domain::topic::{JoinReq, LeaveReq, MetaAction, MetaReq, SessUpdate};
use crate::domain::types::{AuthLevel, Uid};
use crate::domain::wire::{ClientMsg, PresFilters, ServerMsg};

use failover::{FailoverConfig, FailoverState, Heartbeat, PingAck, VoteAck, VoteReq};

// =============================================================================
// Errors and configuration
// =============================================================================

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("node {0} is unreachable")]
    Unreachable(String),
    #[error("frame codec error: {0}")]
    Codec(String),
    #[error("invalid cluster configuration: {0}")]
    Config(String),
}

/// Resolved cluster parameters (built from the app config).
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    pub self_name: String,
    /// All configured node names, including this one.
    pub nodes: Vec<String>,
    pub failover: Option<FailoverConfig>,
}

// =============================================================================
// Frames
// =============================================================================

/// Why a request frame was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterReqType {
    Attach,
    Detach,
    Meta,
    Data,
    Broadcast,
    Ping,
}

/// Identity of a proxied client session, carried alongside every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSess {
    pub sid: String,
    pub uid: Option<Uid>,
    pub auth_lvl: AuthLevel,
    pub user_agent: String,
    pub background: bool,
}

impl ClusterSess {
    fn uid(&self) -> Uid {
        self.uid.unwrap_or(Uid::ZERO)
    }
}

/// Proxy → master: a relayed client packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterReq {
    pub node: String,
    pub req_type: ClusterReqType,
    pub topic: Option<String>,
    /// Name the client addressed the topic by.
    pub alias: Option<String>,
    /// The topic is being created under a temporary client-side name.
    pub created: bool,
    /// Creation via the channel alias (`nch…`).
    pub make_chan: bool,
    /// Channel-reader addressing (`chn…`).
    pub is_chan_request: bool,
    pub msg: Option<ClientMsg>,
    pub sess: Option<ClusterSess>,
}

/// Master → proxy: a server message for one (or all) of the proxied
/// sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterResp {
    pub topic: String,
    pub msg: ServerMsg,
    /// Remote client session the message is addressed to; `None` fans out
    /// to every session the proxy multiplexes.
    pub sid: Option<String>,
    /// Presence filters, stripped from the wire form of `msg`.
    pub pres_filters: Option<PresFilters>,
}

/// Proxy → master: session state change of a proxied client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSessUpdate {
    pub node: String,
    pub topic: String,
    pub sess: ClusterSess,
    pub ua_change: Option<String>,
    pub background: Option<bool>,
}

/// Everything that travels between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterFrame {
    Req(ClusterReq),
    Resp(ClusterResp),
    SessUpdate(ClusterSessUpdate),
    /// Offline-presence routing toward the master of `topic`.
    Route {
        topic: String,
        msg: ServerMsg,
        pres_filters: Option<PresFilters>,
    },
    Ping(Heartbeat),
    PingAck(PingAck),
    Vote(VoteReq),
    VoteAck(VoteAck),
}

// =============================================================================
// Transport
// =============================================================================

/// Delivery of encoded frames to a peer. Implementations are expected to
/// keep their own connection state; the cluster core never blocks on them
/// beyond the async send.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn send(&self, node: &str, frame: Vec<u8>) -> Result<(), ClusterError>;
}

/// In-process transport wiring several [`Cluster`] instances together; used
/// by the test suite and single-machine simulations.
#[derive(Default)]
pub struct LoopbackTransport {
    inboxes: DashMap<String, mpsc::Sender<Vec<u8>>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &str, inbox: mpsc::Sender<Vec<u8>>) {
        self.inboxes.insert(node.to_string(), inbox);
    }

    pub fn unregister(&self, node: &str) {
        self.inboxes.remove(node);
    }
}

#[async_trait]
impl ClusterTransport for LoopbackTransport {
    async fn send(&self, node: &str, frame: Vec<u8>) -> Result<(), ClusterError> {
        let Some(tx) = self.inboxes.get(node).map(|tx| tx.clone()) else {
            return Err(ClusterError::Unreachable(node.to_string()));
        };
        tx.send(frame)
            .await
            .map_err(|_| ClusterError::Unreachable(node.to_string()))
    }
}

// =============================================================================
// Cluster
// =============================================================================

pub struct Cluster {
    self_name: String,
    nodes: Vec<String>,
    ring: RwLock<Ring>,
    transport: Arc<dyn ClusterTransport>,
    ctx: OnceLock<Arc<ServerCtx>>,
    inbox_tx: mpsc::Sender<Vec<u8>>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    pub(crate) failover: Option<FailoverConfig>,
    pub(crate) fo: Mutex<FailoverState>,
}

impl Cluster {
    pub fn new(
        spec: ClusterSpec,
        transport: Arc<dyn ClusterTransport>,
    ) -> Result<Arc<Cluster>, ClusterError> {
        if spec.nodes.len() < 2 {
            return Err(ClusterError::Config(
                "a cluster needs at least two nodes".to_string(),
            ));
        }
        if !spec.nodes.contains(&spec.self_name) {
            return Err(ClusterError::Config(format!(
                "self node '{}' is not in the node list",
                spec.self_name
            )));
        }
        if let Some(fo) = &spec.failover
            && fo.enabled
            && spec.nodes.len() < 3
        {
            return Err(ClusterError::Config(
                "failover requires at least three nodes".to_string(),
            ));
        }
        let (inbox_tx, inbox_rx) = mpsc::channel(CLUSTER_PEER_QUEUE_LEN);
        Ok(Arc::new(Cluster {
            ring: RwLock::new(Ring::new(&spec.nodes)),
            fo: Mutex::new(FailoverState::new(&spec.nodes)),
            self_name: spec.self_name,
            nodes: spec.nodes,
            transport,
            ctx: OnceLock::new(),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            failover: spec.failover,
        }))
    }

    pub fn attach_ctx(&self, ctx: Arc<ServerCtx>) {
        let _ = self.ctx.set(ctx);
    }

    fn ctx(&self) -> &Arc<ServerCtx> {
        self.ctx.get().expect("cluster context not attached")
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    pub fn node_names(&self) -> &[String] {
        &self.nodes
    }

    /// Sender the transport layer feeds inbound frames into.
    pub fn inbox(&self) -> mpsc::Sender<Vec<u8>> {
        self.inbox_tx.clone()
    }

    pub fn master_of(&self, topic: &str) -> Option<String> {
        self.ring.read().get(topic).map(str::to_string)
    }

    /// Whether the topic is mastered by another node.
    pub fn is_remote(&self, topic: &str) -> bool {
        self.master_of(topic)
            .map(|master| master != self.self_name)
            .unwrap_or(false)
    }

    pub fn live_nodes(&self) -> Vec<String> {
        self.ring.read().nodes().to_vec()
    }

    /// Rebuild the ring over a new live-node set. Returns whether anything
    /// changed; the caller is responsible for triggering the hub rehash.
    pub fn set_live_nodes(&self, live: &[String]) -> bool {
        let mut sorted: Vec<String> = live.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut ring = self.ring.write();
        if ring.nodes() == sorted.as_slice() {
            return false;
        }
        *ring = Ring::new(&sorted);
        true
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    pub(crate) async fn send_frame(
        &self,
        node: &str,
        frame: &ClusterFrame,
    ) -> Result<(), ClusterError> {
        let bytes = rmp_serde::to_vec_named(frame).map_err(|e| ClusterError::Codec(e.to_string()))?;
        self.transport.send(node, bytes).await
    }

    /// Proxy side: ship a relayed client packet to the topic's master.
    pub(crate) async fn send_to_master(&self, req: ClusterReq) -> Result<(), ClusterError> {
        let topic = req.topic.clone().unwrap_or_default();
        let master = self
            .master_of(&topic)
            .ok_or_else(|| ClusterError::Unreachable(topic.clone()))?;
        self.send_frame(&master, &ClusterFrame::Req(req)).await
    }

    /// Forward a hub-routed message (offline presence) to the remote master
    /// of `topic`.
    pub async fn route_remote(&self, topic: &str, mut msg: ServerMsg) -> Result<(), ClusterError> {
        let master = self
            .master_of(topic)
            .ok_or_else(|| ClusterError::Unreachable(topic.to_string()))?;
        let pres_filters = msg.pres.as_mut().map(|p| std::mem::take(&mut p.filters));
        self.send_frame(
            &master,
            &ClusterFrame::Route {
                topic: topic.to_string(),
                msg,
                pres_filters,
            },
        )
        .await
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Decode and dispatch one inbound frame.
    pub async fn receive(self: &Arc<Self>, bytes: &[u8]) {
        let frame: ClusterFrame = match rmp_serde::from_slice(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable cluster frame dropped");
                return;
            }
        };
        match frame {
            ClusterFrame::Req(req) => self.handle_req(req).await,
            ClusterFrame::Resp(resp) => self.handle_resp(resp),
            ClusterFrame::SessUpdate(update) => self.handle_sess_update(update),
            ClusterFrame::Route {
                topic,
                mut msg,
                pres_filters,
            } => {
                if let (Some(pres), Some(filters)) = (msg.pres.as_mut(), pres_filters) {
                    pres.filters = filters;
                }
                self.ctx().hub().route(&topic, msg);
            }
            ClusterFrame::Ping(hb) => self.on_heartbeat(hb).await,
            ClusterFrame::PingAck(ack) => self.on_ping_ack(ack),
            ClusterFrame::Vote(vote) => self.on_vote(vote).await,
            ClusterFrame::VoteAck(ack) => self.on_vote_ack(ack).await,
        }
    }

    async fn handle_req(self: &Arc<Self>, req: ClusterReq) {
        self.note_peer_alive(&req.node);
        let hub = self.ctx().hub().clone();
        match req.req_type {
            ClusterReqType::Ping => {}
            ClusterReqType::Attach => {
                let (Some(topic), Some(sess_info)) = (req.topic.clone(), req.sess.clone()) else {
                    return;
                };
                let mux = self.mux_session(&req.node, &topic);
                let sub = req.msg.and_then(|m| m.sub);
                let alias = req.alias.unwrap_or_else(|| topic.clone());
                let join = JoinReq {
                    sess: mux,
                    remote_sid: Some(sess_info.sid.clone()),
                    uid: sess_info.uid(),
                    auth_lvl: sess_info.auth_lvl,
                    id: sub.as_ref().and_then(|s| s.id.clone()),
                    alias,
                    is_chan_request: req.is_chan_request,
                    created: req.created,
                    background: sess_info.background,
                    set: sub.as_ref().and_then(|s| s.set.clone()),
                    get: sub.and_then(|s| s.get),
                };
                hub.deliver_join(&topic, req.make_chan, join);
            }
            ClusterReqType::Detach => {
                let (Some(topic), Some(sess_info)) = (req.topic.clone(), req.sess) else {
                    return;
                };
                let mux = self.mux_session(&req.node, &topic);
                let leave = req.msg.and_then(|m| m.leave);
                let req = LeaveReq {
                    sess: mux,
                    remote_sid: Some(sess_info.sid.clone()),
                    uid: sess_info.uid(),
                    unsub: leave.as_ref().map(|l| l.unsub).unwrap_or(false),
                    id: leave
                        .as_ref()
                        .and_then(|l| l.id.clone())
                        .or_else(|| Some(String::new())),
                    alias: req.alias.unwrap_or_else(|| topic.clone()),
                };
                hub.deliver_leave(&topic, req);
            }
            ClusterReqType::Data => {
                let (Some(topic), Some(sess_info)) = (req.topic.clone(), req.sess) else {
                    return;
                };
                let Some(publish) = req.msg.and_then(|m| m.publish) else {
                    return;
                };
                let mux = self.mux_session(&req.node, &topic);
                let mut msg = data_from_pub(&publish, sess_info.uid(), &sess_info.sid, Some(mux));
                msg.rcpt_sid = Some(sess_info.sid);
                hub.deliver_broadcast(&topic, msg, None);
            }
            ClusterReqType::Broadcast => {
                let (Some(topic), Some(sess_info)) = (req.topic.clone(), req.sess) else {
                    return;
                };
                let Some(note) = req.msg.and_then(|m| m.note) else {
                    return;
                };
                let Some(msg) = info_from_note(&note, sess_info.uid(), &sess_info.sid) else {
                    return;
                };
                hub.deliver_broadcast(&topic, msg, None);
            }
            ClusterReqType::Meta => {
                let (Some(topic), Some(sess_info)) = (req.topic.clone(), req.sess) else {
                    return;
                };
                let Some(msg) = req.msg else {
                    return;
                };
                let mux = self.mux_session(&req.node, &topic);
                let alias = req.alias.unwrap_or_else(|| topic.clone());
                let (id, action) = if let Some(get) = msg.get {
                    (get.id, MetaAction::Get(get.query))
                } else if let Some(set) = msg.set {
                    (set.id, MetaAction::Set(set.query))
                } else if let Some(del) = msg.del {
                    (del.id.clone(), MetaAction::Del(del))
                } else {
                    return;
                };
                let req = MetaReq {
                    sess: mux,
                    uid: sess_info.uid(),
                    auth_lvl: sess_info.auth_lvl,
                    remote_sid: Some(sess_info.sid),
                    id,
                    alias,
                    action,
                };
                hub.deliver_meta(&topic, req);
            }
        }
    }

    /// Proxy side: deliver a master reply into the local proxy loop.
    fn handle_resp(&self, resp: ClusterResp) {
        self.ctx().hub().deliver_proxy_resp(&resp.topic.clone(), resp);
    }

    fn handle_sess_update(&self, update: ClusterSessUpdate) {
        self.note_peer_alive(&update.node);
        let sid = format!("mux.{}.{}", update.node, update.topic);
        let Some(mux) = self.ctx().sessions.get(&sid) else {
            return;
        };
        let supd = SessUpdate {
            sess: mux,
            remote_sid: Some(update.sess.sid),
            user_agent: update.ua_change,
            foregrounded: update.background == Some(false),
        };
        self.ctx().hub().deliver_supd(&update.topic, supd);
    }

    // =========================================================================
    // Multiplexing sessions
    // =========================================================================

    /// Get or create the synthetic session representing `node` on `topic`,
    /// with its relay task feeding replies back to the peer.
    fn mux_session(self: &Arc<Self>, node: &str, topic: &str) -> Arc<Session> {
        let sid = format!("mux.{}.{}", node, topic);
        if let Some(sess) = self.ctx().sessions.get(&sid) {
            return sess;
        }
        let (sess, mut handles) = self.ctx().sessions.create_multiplex(node, topic);
        let cluster = self.clone();
        let node = node.to_string();
        let topic = topic.to_string();
        let relay_sid = sid.clone();
        // One relay task per proxied peer-topic link: it serializes the
        // session's outbound queue into response frames. This replaces the
        // dynamic multi-channel fan-in of the original design.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_msg = handles.messages.recv() => {
                        let Some(mut msg) = maybe_msg else { break };
                        let sid = msg.rcpt_sid.take();
                        let pres_filters =
                            msg.pres.as_mut().map(|p| std::mem::take(&mut p.filters));
                        let resp = ClusterResp {
                            topic: topic.clone(),
                            msg,
                            sid,
                            pres_filters,
                        };
                        if let Err(e) = cluster.send_frame(&node, &ClusterFrame::Resp(resp)).await {
                            tracing::warn!(node = %node, topic = %topic, error = %e, "reply relay failed");
                        }
                    }
                    detached = handles.detach.recv() => {
                        // The master topic dropped this link (shutdown or
                        // rehash); the relay dies with it.
                        if detached.is_some() {
                            tracing::debug!(node = %node, topic = %topic, "peer link detached");
                        }
                        break;
                    }
                }
            }
            cluster.ctx().sessions.delete(&relay_sid);
        });
        sess
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the inbox pump and, when failover is enabled, the heartbeat
    /// task. Returns handles for the shutdown service to join.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        if let Some(rx) = self.inbox_rx.lock().take() {
            let cluster = self.clone();
            let mut sd = shutdown.clone();
            let mut rx = rx;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = sd.changed() => break,
                        frame = rx.recv() => match frame {
                            Some(bytes) => cluster.receive(&bytes).await,
                            None => break,
                        }
                    }
                }
            }));
        }
        if self.failover.as_ref().map(|f| f.enabled).unwrap_or(false) {
            tasks.push(self.spawn_failover(shutdown));
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use crate::data::memory::MemoryStore;
    use crate::data::traits::TopicsRepository;
    use crate::data::types::{DefaultAccess, SubscriptionRow, TopicRow, UserRow};
    use crate::domain::RuntimeConfig;
    use crate::domain::access::AccessMode;
    use crate::domain::hub::Hub;
    use crate::domain::push::Push;
    use crate::domain::session::{SessionHandles, SessionProto};
    use crate::domain::types::{AuthLevel, new_grp_name};
    use crate::domain::wire::{
        ClientMsg, MsgClientPub, MsgClientSub, MsgServerCtrl, ServerMsg,
    };

    struct Node {
        ctx: Arc<ServerCtx>,
        cluster: Arc<Cluster>,
        _shutdown: watch::Sender<bool>,
    }

    fn make_node(
        name: &str,
        nodes: &[&str],
        failover: Option<failover::FailoverConfig>,
        store: &Arc<MemoryStore>,
        transport: &Arc<LoopbackTransport>,
    ) -> Node {
        let spec = ClusterSpec {
            self_name: name.to_string(),
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            failover,
        };
        let cluster = Cluster::new(spec, transport.clone() as Arc<dyn ClusterTransport>).unwrap();
        transport.register(name, cluster.inbox());
        let ctx = ServerCtx::new(RuntimeConfig::default(), store.store(), Push::new());
        let hub = Hub::new(ctx.clone());
        ctx.attach_hub(hub);
        cluster.attach_ctx(ctx.clone());
        ctx.attach_cluster(Some(cluster.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        cluster.start(shutdown_rx);
        Node {
            ctx,
            cluster,
            _shutdown: shutdown_tx,
        }
    }

    fn seed_user(store: &Arc<MemoryStore>, id: u64) -> Uid {
        let uid = Uid::new(id);
        let now = Utc::now();
        store.put_user(UserRow {
            uid,
            created: now,
            updated: now,
            state: Default::default(),
            access: DefaultAccess {
                auth: AccessMode::AUTH,
                anon: AccessMode::NONE,
            },
            public: None,
            tags: Vec::new(),
            last_seen: None,
            user_agent: String::new(),
        });
        uid
    }

    async fn seed_group(store: &Arc<MemoryStore>, name: &str, owner: Uid) {
        let now = Utc::now();
        let topic = TopicRow {
            name: name.to_string(),
            created: now,
            updated: now,
            touched: now,
            owner,
            seq_id: 0,
            del_id: 0,
            access: DefaultAccess {
                auth: AccessMode::AUTH,
                anon: AccessMode::NONE,
            },
            public: None,
            tags: Vec::new(),
            is_chan: false,
        };
        let owner_sub = SubscriptionRow::new(
            name,
            owner,
            AccessMode::FULL | AccessMode::OWNER,
            AccessMode::FULL | AccessMode::OWNER,
        );
        TopicsRepository::create(&**store, &topic, &[owner_sub])
            .await
            .unwrap();
    }

    /// Generate a group name placed on `node` by the ring.
    fn grp_mastered_by(cluster: &Cluster, node: &str) -> String {
        loop {
            let name = new_grp_name();
            if cluster.master_of(&name).as_deref() == Some(node) {
                return name;
            }
        }
    }

    fn sub_msg(topic: &str) -> ClientMsg {
        ClientMsg {
            sub: Some(MsgClientSub {
                id: Some("sub".to_string()),
                topic: topic.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pub_msg(topic: &str, content: &str) -> ClientMsg {
        ClientMsg {
            publish: Some(MsgClientPub {
                id: Some("pub".to_string()),
                topic: topic.to_string(),
                head: None,
                content: json!(content),
            }),
            ..Default::default()
        }
    }

    async fn recv_match<F>(h: &mut SessionHandles, mut pred: F) -> ServerMsg
    where
        F: FnMut(&ServerMsg) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let msg = h.messages.recv().await.expect("session channel closed");
                if pred(&msg) {
                    return msg;
                }
            }
        })
        .await
        .expect("timed out waiting for a matching message")
    }

    async fn recv_ctrl(h: &mut SessionHandles) -> MsgServerCtrl {
        recv_match(h, |m| m.ctrl.is_some()).await.ctrl.unwrap()
    }

    #[test]
    fn test_spec_validation() {
        let transport = LoopbackTransport::new();
        let bad = ClusterSpec {
            self_name: "nx".to_string(),
            nodes: vec!["n1".to_string(), "n2".to_string()],
            failover: None,
        };
        assert!(Cluster::new(bad, transport.clone() as Arc<dyn ClusterTransport>).is_err());

        let fo = failover::FailoverConfig {
            enabled: true,
            heartbeat: Duration::from_millis(100),
            vote_after: 4,
            node_fail_after: 4,
        };
        let too_small = ClusterSpec {
            self_name: "n1".to_string(),
            nodes: vec!["n1".to_string(), "n2".to_string()],
            failover: Some(fo),
        };
        assert!(Cluster::new(too_small, transport as Arc<dyn ClusterTransport>).is_err());
    }

    #[test]
    fn test_masters_partition_topics() {
        let transport = LoopbackTransport::new();
        let spec = |name: &str| ClusterSpec {
            self_name: name.to_string(),
            nodes: vec!["n1".to_string(), "n2".to_string(), "n3".to_string()],
            failover: None,
        };
        let c1 = Cluster::new(spec("n1"), transport.clone() as Arc<dyn ClusterTransport>).unwrap();
        let c2 = Cluster::new(spec("n2"), transport as Arc<dyn ClusterTransport>).unwrap();
        for i in 0..100 {
            let name = format!("grp{}", i);
            // Same placement decision everywhere, remote on all but one.
            assert_eq!(c1.master_of(&name), c2.master_of(&name));
            assert_eq!(
                c1.is_remote(&name),
                c1.master_of(&name).as_deref() != Some("n1")
            );
        }
    }

    #[tokio::test]
    async fn test_proxy_relays_publish_to_master() {
        let store = MemoryStore::new();
        let transport = LoopbackTransport::new();
        let n1 = make_node("n1", &["n1", "n2"], None, &store, &transport);
        let n2 = make_node("n2", &["n1", "n2"], None, &store, &transport);

        let a = seed_user(&store, 1);
        let b = seed_user(&store, 2);
        let grp = grp_mastered_by(&n1.cluster, "n1");
        seed_group(&store, &grp, a).await;

        // A attaches on the master node, B through a proxy on n2.
        let (a1, mut ha1) = n1
            .ctx
            .sessions
            .create(SessionProto::Websocket, a, AuthLevel::Auth, "");
        n1.ctx.hub().dispatch(sub_msg(&grp), &a1).await;
        assert_eq!(recv_ctrl(&mut ha1).await.code, 200);

        let (b1, mut hb1) = n2
            .ctx
            .sessions
            .create(SessionProto::Websocket, b, AuthLevel::Auth, "");
        n2.ctx.hub().dispatch(sub_msg(&grp), &b1).await;
        assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

        // B publishes through the proxy; the master assigns the seq and the
        // ack travels back to B's session.
        n2.ctx.hub().dispatch(pub_msg(&grp, "from-proxy"), &b1).await;
        let ctrl = recv_match(&mut hb1, |m| {
            m.ctrl.as_ref().map(|c| c.code == 202).unwrap_or(false)
        })
        .await
        .ctrl
        .unwrap();
        assert_eq!(ctrl.params.unwrap()["seq"], json!(1));

        let data = recv_match(&mut ha1, |m| m.data.is_some()).await.data.unwrap();
        assert_eq!(data.seq, 1);
        assert_eq!(data.content, json!("from-proxy"));

        // And the reverse direction reaches the proxied subscriber.
        n1.ctx.hub().dispatch(pub_msg(&grp, "from-master"), &a1).await;
        let data = recv_match(&mut hb1, |m| m.data.is_some()).await.data.unwrap();
        assert_eq!(data.seq, 2);
        assert_eq!(data.content, json!("from-master"));
    }

    #[tokio::test]
    async fn test_rehash_terminates_and_remasters() {
        let store = MemoryStore::new();
        let transport = LoopbackTransport::new();
        let n1 = make_node("n1", &["n1", "n2"], None, &store, &transport);
        let n2 = make_node("n2", &["n1", "n2"], None, &store, &transport);

        let b = seed_user(&store, 2);
        let grp = grp_mastered_by(&n1.cluster, "n1");
        seed_group(&store, &grp, seed_user(&store, 1)).await;

        let (b1, mut hb1) = n2
            .ctx
            .sessions
            .create(SessionProto::Websocket, b, AuthLevel::Auth, "");
        n2.ctx.hub().dispatch(sub_msg(&grp), &b1).await;
        assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

        // Topology change: n1 loses the topic and terminates its master;
        // the attached (proxied) session sees `term`.
        assert!(n1.cluster.set_live_nodes(&["n2".to_string()]));
        n1.ctx.hub().rehash_topics();
        let pres = recv_match(&mut hb1, |m| {
            m.pres.as_ref().map(|p| p.what == "term").unwrap_or(false)
        })
        .await
        .pres
        .unwrap();
        assert_eq!(pres.topic, grp);

        // n2 adopts the same view; its proxy is now pointless and dropped.
        assert!(n2.cluster.set_live_nodes(&["n2".to_string()]));
        n2.ctx.hub().rehash_topics();
        let detached = tokio::time::timeout(Duration::from_secs(3), hb1.detach.recv())
            .await
            .expect("proxy never detached")
            .unwrap();
        assert_eq!(detached, grp);

        // The next subscribe spawns a local master on n2.
        n2.ctx.hub().dispatch(sub_msg(&grp), &b1).await;
        assert_eq!(recv_ctrl(&mut hb1).await.code, 200);
        assert!(!n2.cluster.is_remote(&grp));
    }

    #[tokio::test]
    async fn test_failover_elects_lowest_live_node() {
        let store = MemoryStore::new();
        let transport = LoopbackTransport::new();
        let fo = failover::FailoverConfig {
            enabled: true,
            heartbeat: Duration::from_millis(25),
            vote_after: 3,
            node_fail_after: 2,
        };
        // n1 would lead by name but never comes up.
        let n2 = make_node(
            "n2",
            &["n1", "n2", "n3"],
            Some(fo.clone()),
            &store,
            &transport,
        );
        let n3 = make_node("n3", &["n1", "n2", "n3"], Some(fo), &store, &transport);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if n2.cluster.is_leader()
                    && n3.cluster.leader().as_deref() == Some("n2")
                    && n2.cluster.live_nodes() == ["n2".to_string(), "n3".to_string()]
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("no leader elected");

        // Followers adopt the leader's live set and drop n1's topics.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if n3.cluster.live_nodes() == ["n2".to_string(), "n3".to_string()] {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("follower never adopted live set");
    }
}
