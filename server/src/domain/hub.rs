//! The hub: routes client packets to topics by name, spawns topic loops on
//! demand (master or proxy, by ring placement), reaps idle topics, and
//! relays offline presence between loops.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot};

use crate::core::constants::{HUB_CMD_QUEUE_LEN, HUB_ROUTE_QUEUE_LEN};
use crate::domain::ServerCtx;
use crate::domain::cluster::proxy;
use crate::domain::session::Session;
use crate::domain::topic::{
    self, ExitReq, JoinReq, LeaveReq, MetaAction, MetaReq, SessUpdate, ShutdownReason, TopicHandle,
    TopicInit,
};
use crate::domain::types::{Uid, resolve_topic_name};
use crate::domain::wire::{
    self, ClientMsg, MsgClientDel, MsgClientGet, MsgClientHi, MsgClientLeave, MsgClientNote,
    MsgClientPub, MsgClientSet, MsgClientSub, MsgServerData, MsgServerInfo, ServerMsg,
};

/// Control commands processed by the hub's own loop.
enum HubCmd {
    Stop {
        name: String,
        reason: ShutdownReason,
    },
}

/// An offline-presence routing envelope: deliver `msg` to the topic named
/// `topic`, wherever it lives.
struct RouteMsg {
    topic: String,
    msg: ServerMsg,
}

pub struct Hub {
    ctx: Arc<ServerCtx>,
    topics: DashMap<String, TopicHandle>,
    cmd_tx: mpsc::Sender<HubCmd>,
    route_tx: mpsc::Sender<RouteMsg>,
}

impl Hub {
    pub fn new(ctx: Arc<ServerCtx>) -> Arc<Hub> {
        let (cmd_tx, cmd_rx) = mpsc::channel(HUB_CMD_QUEUE_LEN);
        let (route_tx, route_rx) = mpsc::channel(HUB_ROUTE_QUEUE_LEN);
        let hub = Arc::new(Hub {
            ctx,
            topics: DashMap::new(),
            cmd_tx,
            route_tx,
        });
        tokio::spawn(hub.clone().cmd_loop(cmd_rx));
        tokio::spawn(hub.clone().route_loop(route_rx));
        hub
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn is_topic_live(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    // =========================================================================
    // Inbound dispatch
    // =========================================================================

    /// Entry point for transport handlers: route one client packet.
    pub async fn dispatch(&self, msg: ClientMsg, sess: &Arc<Session>) {
        if let Some(hi) = msg.hi {
            self.handle_hi(hi, sess);
        } else if let Some(sub) = msg.sub {
            self.handle_sub(sub, sess);
        } else if let Some(leave) = msg.leave {
            self.handle_leave(leave, sess);
        } else if let Some(publish) = msg.publish {
            self.handle_pub(publish, sess);
        } else if let Some(get) = msg.get {
            self.handle_get(get, sess);
        } else if let Some(set) = msg.set {
            self.handle_set(set, sess);
        } else if let Some(del) = msg.del {
            self.handle_del(del, sess);
        } else if let Some(note) = msg.note {
            self.handle_note(note, sess);
        } else if msg.acc.is_some() || msg.login.is_some() {
            // Account and login packets are consumed by the auth layer
            // before dispatch; seeing one here means it is not configured.
            let id = msg
                .acc
                .as_ref()
                .and_then(|a| a.id.as_deref())
                .or(msg.login.as_ref().and_then(|l| l.id.as_deref()));
            sess.queue_out(wire::err_auth_required(id, None, Utc::now()));
        } else {
            sess.queue_out(wire::err_malformed(None, None, Utc::now()));
        }
    }

    /// `{hi}`: user-agent change and background→foreground promotion.
    fn handle_hi(&self, hi: MsgClientHi, sess: &Arc<Session>) {
        let now = Utc::now();
        if let Some(ua) = &hi.user_agent
            && *ua != sess.user_agent()
        {
            sess.set_user_agent(ua);
            let uid = sess.uid();
            if !uid.is_zero()
                && let Some(handle) = self.topics.get(&uid.user_id())
            {
                let _ = handle.supd.try_send(SessUpdate {
                    sess: sess.clone(),
                    remote_sid: None,
                    user_agent: Some(ua.clone()),
                    foregrounded: false,
                });
            }
        }
        if !hi.background && sess.background() {
            sess.set_background(false);
            for name in sess.subs() {
                if let Some(handle) = self.topics.get(&name) {
                    let _ = handle.supd.try_send(SessUpdate {
                        sess: sess.clone(),
                        remote_sid: None,
                        user_agent: None,
                        foregrounded: true,
                    });
                }
            }
        } else if hi.background {
            sess.set_background(true);
        }
        sess.queue_out(wire::no_err(hi.id.as_deref(), None, now));
    }

    fn handle_sub(&self, sub: MsgClientSub, sess: &Arc<Session>) {
        let now = Utc::now();
        let uid = sess.uid();
        let Some(rn) = resolve_topic_name(&sub.topic, uid) else {
            sess.queue_out(wire::err_malformed(sub.id.as_deref(), Some(&sub.topic), now));
            return;
        };
        let join = JoinReq {
            sess: sess.clone(),
            remote_sid: None,
            uid,
            auth_lvl: sess.auth_lvl(),
            id: sub.id,
            alias: rn.alias.clone(),
            // `nch…` creates a channel-enabled group with the creator as a
            // full subscriber; only `chn…` addressing makes a reader.
            is_chan_request: rn.is_chan_request && !rn.created,
            created: rn.created,
            background: sess.background(),
            set: sub.set,
            get: sub.get,
        };
        let make_chan = rn.created && rn.is_chan_request;
        self.deliver_join(&rn.expanded, make_chan, join);
    }

    fn handle_leave(&self, leave: MsgClientLeave, sess: &Arc<Session>) {
        let now = Utc::now();
        let uid = sess.uid();
        let Some(rn) = resolve_topic_name(&leave.topic, uid) else {
            sess.queue_out(wire::err_malformed(
                leave.id.as_deref(),
                Some(&leave.topic),
                now,
            ));
            return;
        };
        let req = LeaveReq {
            sess: sess.clone(),
            remote_sid: None,
            uid,
            unsub: leave.unsub,
            id: leave.id.or_else(|| Some(String::new())),
            alias: rn.alias,
        };
        self.deliver_leave(&rn.expanded, req);
    }

    fn handle_pub(&self, publish: MsgClientPub, sess: &Arc<Session>) {
        let now = Utc::now();
        let uid = sess.uid();
        let Some(rn) = resolve_topic_name(&publish.topic, uid) else {
            sess.queue_out(wire::err_malformed(
                publish.id.as_deref(),
                Some(&publish.topic),
                now,
            ));
            return;
        };
        if !sess.has_sub(&rn.expanded) {
            sess.queue_out(wire::err_attach_first(
                publish.id.as_deref(),
                Some(&publish.topic),
                now,
            ));
            return;
        }
        let size = serde_json::to_vec(&publish.content)
            .map(|v| v.len())
            .unwrap_or(0);
        if size > self.ctx.config.max_message_size {
            sess.queue_out(wire::err_too_large(
                publish.id.as_deref(),
                Some(&publish.topic),
                now,
            ));
            return;
        }
        let msg = data_from_pub(&publish, uid, &sess.sid, Some(sess.clone()));
        self.deliver_broadcast(&rn.expanded, msg, Some((sess, publish.id.as_deref())));
    }

    fn handle_note(&self, note: MsgClientNote, sess: &Arc<Session>) {
        let uid = sess.uid();
        let Some(rn) = resolve_topic_name(&note.topic, uid) else {
            return;
        };
        // Notes are fire-and-forget; missing attachment is a silent drop.
        if !sess.has_sub(&rn.expanded) || uid.is_zero() {
            return;
        }
        let Some(msg) = info_from_note(&note, uid, &sess.sid) else {
            return;
        };
        self.deliver_broadcast(&rn.expanded, msg, None);
    }

    fn handle_get(&self, get: MsgClientGet, sess: &Arc<Session>) {
        let action = MetaAction::Get(get.query);
        self.meta_common(get.id, get.topic, action, sess);
    }

    fn handle_set(&self, set: MsgClientSet, sess: &Arc<Session>) {
        let action = MetaAction::Set(set.query);
        self.meta_common(set.id, set.topic, action, sess);
    }

    fn handle_del(&self, del: MsgClientDel, sess: &Arc<Session>) {
        let id = del.id.clone();
        let topic = del.topic.clone();
        self.meta_common(id, topic, MetaAction::Del(del), sess);
    }

    fn meta_common(
        &self,
        id: Option<String>,
        topic: String,
        action: MetaAction,
        sess: &Arc<Session>,
    ) {
        let now = Utc::now();
        let uid = sess.uid();
        let Some(rn) = resolve_topic_name(&topic, uid) else {
            sess.queue_out(wire::err_malformed(id.as_deref(), Some(&topic), now));
            return;
        };
        if !sess.has_sub(&rn.expanded) {
            sess.queue_out(wire::err_attach_first(id.as_deref(), Some(&topic), now));
            return;
        }
        let Some(handle) = self.topics.get(&rn.expanded).map(|h| h.clone()) else {
            sess.queue_out(wire::err_not_found(id.as_deref(), Some(&topic), now));
            return;
        };
        if handle.status.is_inactive() {
            sess.queue_out(wire::err_locked(id.as_deref(), Some(&topic), now));
            return;
        }
        let req = MetaReq {
            sess: sess.clone(),
            remote_sid: None,
            uid,
            auth_lvl: sess.auth_lvl(),
            id: id.clone(),
            alias: rn.alias,
            action,
        };
        if handle.meta.try_send(req).is_err() {
            sess.queue_out(wire::err_overloaded(id.as_deref(), Some(&topic), now));
        }
    }

    // =========================================================================
    // Delivery primitives (shared with the cluster inbound path)
    // =========================================================================

    /// Hand a join to the topic, spawning it first when needed.
    pub(crate) fn deliver_join(&self, expanded: &str, make_chan: bool, join: JoinReq) {
        match self.topics.entry(expanded.to_string()) {
            Entry::Occupied(entry) => {
                let handle = entry.get().clone();
                drop(entry);
                if handle.status.is_inactive() {
                    // A reaped (panicked or deleted) topic answers Locked
                    // until the handle is gone.
                    let mut reply =
                        wire::err_locked(join.id.as_deref(), Some(&join.alias), Utc::now());
                    reply.rcpt_sid = join.remote_sid.clone();
                    join.sess.queue_out(reply);
                    return;
                }
                if handle.reg.try_send(join).is_err() {
                    tracing::warn!(topic = %handle.name, "reg queue full, join dropped");
                }
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn_topic(entry, expanded, make_chan, Some(join));
                let _ = handle;
            }
        }
    }

    pub(crate) fn deliver_leave(&self, expanded: &str, req: LeaveReq) {
        let now = Utc::now();
        if let Some(handle) = self.topics.get(expanded).map(|h| h.clone()) {
            if handle.unreg.try_send(req).is_err() {
                tracing::warn!(topic = %expanded, "unreg queue full, leave dropped");
            }
            return;
        }
        if req.unsub {
            // The topic is not loaded; bring it up so the loop can delete
            // the subscription row.
            match self.topics.entry(expanded.to_string()) {
                Entry::Occupied(entry) => {
                    let handle = entry.get().clone();
                    drop(entry);
                    let _ = handle.unreg.try_send(req);
                }
                Entry::Vacant(entry) => {
                    let handle = self.spawn_topic(entry, expanded, false, None);
                    let _ = handle.unreg.try_send(req);
                }
            }
        } else if req.id.is_some() {
            req.sess.queue_out(wire::err_not_found(
                req.id.as_deref().filter(|i| !i.is_empty()),
                Some(&req.alias),
                now,
            ));
        }
    }

    /// Hand a data/info/pres message to the topic; on a full broadcast
    /// queue the originator (when known) gets an overload error.
    pub(crate) fn deliver_broadcast(
        &self,
        expanded: &str,
        msg: ServerMsg,
        origin: Option<(&Arc<Session>, Option<&str>)>,
    ) {
        let handle = match self.topics.entry(expanded.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => self.spawn_topic(entry, expanded, false, None),
        };
        if handle.broadcast.try_send(msg).is_err()
            && let Some((sess, id)) = origin
        {
            sess.queue_out(wire::err_overloaded(id, Some(expanded), Utc::now()));
        }
    }

    /// Deliver a master reply into the local proxy topic's loop.
    pub(crate) fn deliver_proxy_resp(&self, topic: &str, resp: crate::domain::cluster::ClusterResp) {
        let Some(handle) = self.topics.get(topic).map(|h| h.clone()) else {
            tracing::debug!(topic = %topic, "reply for unknown proxy topic dropped");
            return;
        };
        let Some(proxy_tx) = handle.proxy.as_ref() else {
            tracing::debug!(topic = %topic, "cluster reply for a master topic dropped");
            return;
        };
        if proxy_tx.try_send(resp).is_err() {
            tracing::warn!(topic = %topic, "proxy queue full, reply dropped");
        }
    }

    /// Deliver a session update into a live topic loop.
    pub(crate) fn deliver_supd(&self, topic: &str, supd: SessUpdate) {
        if let Some(handle) = self.topics.get(topic)
            && handle.supd.try_send(supd).is_err()
        {
            tracing::debug!(topic = %topic, "supd queue full, update dropped");
        }
    }

    pub(crate) fn deliver_meta(&self, expanded: &str, req: MetaReq) {
        let handle = match self.topics.entry(expanded.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => self.spawn_topic(entry, expanded, false, None),
        };
        if handle.meta.try_send(req).is_err() {
            tracing::warn!(topic = %expanded, "meta queue full, request dropped");
        }
    }

    /// Spawn the master or proxy loop for `expanded`, registering its
    /// handle under the vacant map slot the caller holds.
    fn spawn_topic(
        &self,
        entry: dashmap::mapref::entry::VacantEntry<'_, String, TopicHandle>,
        expanded: &str,
        make_chan: bool,
        first_join: Option<JoinReq>,
    ) -> TopicHandle {
        let is_proxy = self
            .ctx
            .cluster()
            .map(|c| c.is_remote(expanded))
            .unwrap_or(false);
        let (handle, rx) = TopicHandle::channels(expanded, is_proxy);
        entry.insert(handle.clone());
        let task = if is_proxy {
            tokio::spawn(proxy::bootstrap(
                self.ctx.clone(),
                handle.clone(),
                rx,
                first_join,
            ))
        } else {
            let init = TopicInit {
                name: expanded.to_string(),
                make_chan,
                ctx: self.ctx.clone(),
                handle: handle.clone(),
            };
            tokio::spawn(topic::bootstrap_master(init, rx, first_join))
        };

        // A panic inside a topic loop is fatal for that topic only: reap it
        // and mark it deleted so clients retrying get Locked.
        let status = handle.status.clone();
        let ctx = self.ctx.clone();
        let name = expanded.to_string();
        tokio::spawn(async move {
            if let Err(e) = task.await
                && e.is_panic()
            {
                tracing::error!(topic = %name, "topic loop panicked, reaping");
                status.mark_deleted();
                ctx.hub().drop_failed(&name);
            }
        });
        handle
    }

    // =========================================================================
    // Offline presence routing
    // =========================================================================

    /// Route a server message to the topic named `topic`. Non-blocking; a
    /// full queue drops presence, never data.
    pub fn route(&self, topic: &str, msg: ServerMsg) {
        if self
            .route_tx
            .try_send(RouteMsg {
                topic: topic.to_string(),
                msg,
            })
            .is_err()
        {
            tracing::debug!(topic = %topic, "route queue full, message dropped");
        }
    }

    async fn route_loop(self: Arc<Hub>, mut rx: mpsc::Receiver<RouteMsg>) {
        while let Some(rm) = rx.recv().await {
            if let Some(cluster) = self.ctx.cluster()
                && cluster.is_remote(&rm.topic)
            {
                if let Err(e) = cluster.route_remote(&rm.topic, rm.msg).await {
                    tracing::debug!(topic = %rm.topic, error = %e, "cluster routing failed");
                }
                continue;
            }
            match self.topics.get(&rm.topic) {
                Some(handle) if !handle.is_proxy => {
                    if handle.broadcast.try_send(rm.msg).is_err() {
                        tracing::debug!(topic = %rm.topic, "broadcast queue full, routed message dropped");
                    }
                }
                _ => {
                    // Target not loaded: the user is fully offline, push
                    // notifications cover them.
                    tracing::trace!(topic = %rm.topic, "routing target not loaded");
                }
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// A transport lost its connection: detach the session from every topic
    /// it holds and drop it from the registry. The session does not wait
    /// for the topics to process the leaves.
    pub fn session_closed(&self, sess: &Arc<Session>) {
        for name in sess.subs() {
            if let Some(handle) = self.topics.get(&name) {
                let req = LeaveReq {
                    sess: sess.clone(),
                    remote_sid: None,
                    uid: sess.uid(),
                    unsub: false,
                    id: None,
                    alias: name.clone(),
                };
                if handle.unreg.try_send(req).is_err() {
                    tracing::warn!(topic = %name, sid = %sess.sid, "unreg queue full, detach dropped");
                }
            }
        }
        self.ctx.sessions.delete(&sess.sid);
    }

    /// Ask the hub to pull a topic out of the index and stop its loop.
    pub fn request_stop(&self, name: &str, reason: ShutdownReason) {
        if self
            .cmd_tx
            .try_send(HubCmd::Stop {
                name: name.to_string(),
                reason,
            })
            .is_err()
        {
            tracing::warn!(topic = %name, "hub command queue full, stop dropped");
        }
    }

    /// Remove a handle whose loop never came up.
    pub(crate) fn drop_failed(&self, name: &str) {
        self.topics.remove(name);
    }

    async fn cmd_loop(self: Arc<Hub>, mut rx: mpsc::Receiver<HubCmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                HubCmd::Stop { name, reason } => {
                    if let Some((_, handle)) = self.topics.remove(&name) {
                        let _ = handle.exit.try_send(ExitReq { reason, done: None });
                    }
                }
            }
        }
    }

    /// Walk every live topic after a topology change: local masters that
    /// now belong elsewhere are terminated (the new master spawns on first
    /// demand); proxies that became local are dropped.
    pub fn rehash_topics(&self) {
        let Some(cluster) = self.ctx.cluster() else {
            return;
        };
        let mut stops = Vec::new();
        for entry in self.topics.iter() {
            let remote = cluster.is_remote(entry.key());
            if !entry.value().is_proxy && remote {
                stops.push((entry.key().clone(), ShutdownReason::Rehashing));
            } else if entry.value().is_proxy && !remote {
                stops.push((entry.key().clone(), ShutdownReason::Shutdown));
            }
        }
        for (name, reason) in stops {
            tracing::debug!(topic = %name, reason = ?reason, "rehash stopping topic");
            self.request_stop(&name, reason);
        }
    }

    /// Stop every topic and wait for the loops to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<TopicHandle> = self
            .topics
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.topics.clear();
        let mut dones = Vec::with_capacity(handles.len());
        for handle in handles {
            let (tx, rx) = oneshot::channel();
            if handle
                .exit
                .send(ExitReq {
                    reason: ShutdownReason::Shutdown,
                    done: Some(tx),
                })
                .await
                .is_ok()
            {
                dones.push(rx);
            }
        }
        futures::future::join_all(dones).await;
        tracing::debug!("all topics stopped");
    }
}

// =============================================================================
// Client → server message conversion
// =============================================================================

/// Build the broadcast form of a `{pub}` packet.
pub(crate) fn data_from_pub(
    publish: &MsgClientPub,
    uid: Uid,
    sid: &str,
    sess: Option<Arc<Session>>,
) -> ServerMsg {
    let mut msg = ServerMsg::from_data(MsgServerData {
        topic: publish.topic.clone(),
        from: None,
        ts: None,
        head: publish.head.clone(),
        seq: 0,
        content: publish.content.clone(),
    });
    msg.as_user = uid;
    msg.skip_sid = Some(sid.to_string());
    msg.id = publish.id.clone();
    msg.sess = sess;
    msg
}

/// Build the broadcast form of a `{note}` packet.
pub(crate) fn info_from_note(note: &MsgClientNote, uid: Uid, sid: &str) -> Option<ServerMsg> {
    match note.what.as_str() {
        "kp" => {}
        "read" | "recv" if note.seq_id > 0 => {}
        _ => return None,
    }
    let mut msg = ServerMsg::from_info(MsgServerInfo {
        topic: note.topic.clone(),
        from: Some(uid.user_id()),
        what: note.what.clone(),
        seq: note.seq_id,
    });
    msg.as_user = uid;
    msg.skip_sid = Some(sid.to_string());
    Some(msg)
}
