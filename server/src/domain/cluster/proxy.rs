//! Proxy topics.
//!
//! On a node that is not master for a topic, the hub spawns a proxy loop
//! instead of a master loop. The proxy holds no business state: it records
//! which local sessions are attached, relays their packets to the master as
//! request frames, and fans master replies back out. The only state it
//! shadows is `last_seq_id`, so locally observed sequence ids are available
//! without a master round-trip.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use crate::domain::ServerCtx;
use crate::domain::session::Session;
use crate::domain::topic::{
    ExitReq, JoinReq, LeaveReq, MetaAction, MetaReq, SessUpdate, TopicHandle, TopicReceivers,
};
use crate::domain::types::Uid;
use crate::domain::wire::{
    self, ClientMsg, MsgClientDel, MsgClientGet, MsgClientLeave, MsgClientNote, MsgClientPub,
    MsgClientSet, MsgClientSub, ServerMsg,
};

use super::{Cluster, ClusterReq, ClusterReqType, ClusterResp, ClusterSess, ClusterSessUpdate};

struct ProxySessionRef {
    sess: Arc<Session>,
    uid: Uid,
    alias: String,
}

pub(crate) struct ProxyTopic {
    name: String,
    ctx: Arc<ServerCtx>,
    cluster: Arc<Cluster>,
    handle: TopicHandle,
    /// Shadow of the master's message counter.
    last_seq_id: u64,
    sessions: HashMap<String, ProxySessionRef>,
    kill_at: Option<Instant>,
}

/// Entry point of every proxy topic task.
pub(crate) async fn bootstrap(
    ctx: Arc<ServerCtx>,
    handle: TopicHandle,
    mut rx: TopicReceivers,
    first_join: Option<JoinReq>,
) {
    let Some(cluster) = ctx.cluster().cloned() else {
        tracing::error!(topic = %handle.name, "proxy topic without a cluster");
        ctx.hub().drop_failed(&handle.name);
        return;
    };
    let mut proxy_rx = rx.proxy.take().expect("proxy channel");
    handle.status.set_loaded();
    let mut proxy = ProxyTopic {
        name: handle.name.clone(),
        ctx,
        cluster,
        handle,
        last_seq_id: 0,
        sessions: HashMap::new(),
        kill_at: None,
    };
    tracing::debug!(topic = %proxy.name, "proxy topic started");
    if let Some(join) = first_join {
        proxy.handle_join(join).await;
    }
    if proxy.sessions.is_empty() {
        proxy.arm_kill_timer();
    }

    fn far_future() -> Instant {
        Instant::now() + Duration::from_secs(86400 * 365)
    }

    loop {
        let kill_at = proxy.kill_at.unwrap_or_else(far_future);
        tokio::select! {
            biased;

            Some(req) = rx.exit.recv() => {
                proxy.terminate(req);
                return;
            }

            Some(join) = rx.reg.recv() => proxy.handle_join(join).await,

            Some(leave) = rx.unreg.recv() => proxy.handle_leave(leave).await,

            Some(msg) = rx.broadcast.recv() => proxy.forward_broadcast(msg).await,

            Some(meta) = rx.meta.recv() => proxy.forward_meta(meta).await,

            Some(upd) = rx.supd.recv() => proxy.forward_supd(upd).await,

            Some(resp) = proxy_rx.recv() => proxy.handle_resp(resp),

            _ = tokio::time::sleep_until(kill_at), if proxy.kill_at.is_some() => {
                proxy.kill_at = None;
                proxy.ctx.hub().request_stop(&proxy.name, crate::domain::topic::ShutdownReason::None);
            }
        }
    }
}

impl ProxyTopic {
    fn arm_kill_timer(&mut self) {
        self.kill_at = Some(Instant::now() + self.ctx.config.idle_master_topic_timeout);
    }

    fn sess_info(&self, sess: &Arc<Session>, sid: &str, uid: Uid, background: bool) -> ClusterSess {
        ClusterSess {
            sid: sid.to_string(),
            uid: (!uid.is_zero()).then_some(uid),
            auth_lvl: sess.auth_lvl(),
            user_agent: sess.user_agent(),
            background,
        }
    }

    fn base_req(&self, req_type: ClusterReqType) -> ClusterReq {
        ClusterReq {
            node: self.cluster.self_name().to_string(),
            req_type,
            topic: Some(self.name.clone()),
            alias: None,
            created: false,
            make_chan: false,
            is_chan_request: false,
            msg: None,
            sess: None,
        }
    }

    async fn handle_join(&mut self, join: JoinReq) {
        self.kill_at = None;
        let key = join.key_sid();
        let mut req = self.base_req(ClusterReqType::Attach);
        req.alias = Some(join.alias.clone());
        req.created = join.created;
        // The nch… alias means "create channel-enabled"; the master applies
        // it at topic creation.
        req.make_chan = join.created && join.alias.starts_with("nch");
        req.is_chan_request = join.is_chan_request;
        req.msg = Some(ClientMsg {
            sub: Some(MsgClientSub {
                id: join.id.clone(),
                topic: join.alias.clone(),
                set: join.set.clone(),
                get: join.get.clone(),
            }),
            ..Default::default()
        });
        req.sess = Some(self.sess_info(&join.sess, &key, join.uid, join.background));

        if let Err(e) = self.cluster.send_to_master(req).await {
            tracing::warn!(topic = %self.name, error = %e, "attach relay failed");
            let mut reply =
                wire::err_cluster_unreachable(join.id.as_deref(), Some(&join.alias), Utc::now());
            reply.rcpt_sid = join.remote_sid.clone();
            join.sess.queue_out(reply);
            return;
        }

        // Record optimistically; the master's {ctrl} travels back by sid.
        join.sess.add_sub(&self.name);
        self.sessions.insert(
            key,
            ProxySessionRef {
                sess: join.sess,
                uid: join.uid,
                alias: join.alias,
            },
        );
    }

    async fn handle_leave(&mut self, leave: LeaveReq) {
        let key = leave.key_sid();
        let mut req = self.base_req(ClusterReqType::Detach);
        req.alias = Some(leave.alias.clone());
        req.msg = Some(ClientMsg {
            leave: Some(MsgClientLeave {
                id: leave.reply_id().map(str::to_string),
                topic: leave.alias.clone(),
                unsub: leave.unsub,
            }),
            ..Default::default()
        });
        req.sess = Some(self.sess_info(&leave.sess, &key, leave.uid, false));

        if let Err(e) = self.cluster.send_to_master(req).await {
            tracing::warn!(topic = %self.name, error = %e, "detach relay failed");
            if leave.id.is_some() {
                let mut reply = wire::err_cluster_unreachable(
                    leave.reply_id(),
                    Some(&leave.alias),
                    Utc::now(),
                );
                reply.rcpt_sid = leave.remote_sid.clone();
                leave.sess.queue_out(reply);
            }
        }

        if let Some(sref) = self.sessions.remove(&key) {
            sref.sess.del_sub(&self.name);
            if leave.id.is_none() {
                sref.sess.detach_topic(&self.name);
            }
        }
        if self.sessions.is_empty() {
            self.arm_kill_timer();
        }
    }

    /// Relay a locally published `{data}`/`{info}` upstream.
    async fn forward_broadcast(&mut self, msg: ServerMsg) {
        let sid = msg
            .skip_sid
            .clone()
            .unwrap_or_else(|| msg.sess.as_ref().map(|s| s.sid.clone()).unwrap_or_default());
        let uid = msg.as_user;

        let req = if let Some(data) = msg.data.as_ref() {
            let mut req = self.base_req(ClusterReqType::Data);
            req.alias = Some(data.topic.clone());
            req.msg = Some(ClientMsg {
                publish: Some(MsgClientPub {
                    id: msg.id.clone(),
                    topic: data.topic.clone(),
                    head: data.head.clone(),
                    content: data.content.clone(),
                }),
                ..Default::default()
            });
            req
        } else if let Some(info) = msg.info.as_ref() {
            let mut req = self.base_req(ClusterReqType::Broadcast);
            req.alias = Some(info.topic.clone());
            req.msg = Some(ClientMsg {
                note: Some(MsgClientNote {
                    topic: info.topic.clone(),
                    what: info.what.clone(),
                    seq_id: info.seq,
                }),
                ..Default::default()
            });
            req
        } else {
            tracing::debug!(topic = %self.name, "proxy dropped unexpected broadcast");
            return;
        };

        let mut req = req;
        let background = msg
            .sess
            .as_ref()
            .map(|s| s.background())
            .unwrap_or(false);
        if let Some(sess) = msg.sess.as_ref() {
            req.sess = Some(self.sess_info(sess, &sid, uid, background));
        } else {
            req.sess = Some(ClusterSess {
                sid: sid.clone(),
                uid: (!uid.is_zero()).then_some(uid),
                auth_lvl: crate::domain::types::AuthLevel::Auth,
                user_agent: String::new(),
                background,
            });
        }

        if let Err(e) = self.cluster.send_to_master(req).await {
            tracing::warn!(topic = %self.name, error = %e, "broadcast relay failed");
            if let Some(sess) = msg.sess.as_ref() {
                let mut reply =
                    wire::err_cluster_unreachable(msg.id.as_deref(), Some(&self.name), Utc::now());
                reply.rcpt_sid = msg.rcpt_sid.clone();
                sess.queue_out(reply);
            }
        }
    }

    async fn forward_meta(&mut self, meta: MetaReq) {
        let key = meta
            .remote_sid
            .clone()
            .unwrap_or_else(|| meta.sess.sid.clone());
        let mut req = self.base_req(ClusterReqType::Meta);
        req.alias = Some(meta.alias.clone());
        req.msg = Some(match &meta.action {
            MetaAction::Get(query) => ClientMsg {
                get: Some(MsgClientGet {
                    id: meta.id.clone(),
                    topic: meta.alias.clone(),
                    query: query.clone(),
                }),
                ..Default::default()
            },
            MetaAction::Set(query) => ClientMsg {
                set: Some(MsgClientSet {
                    id: meta.id.clone(),
                    topic: meta.alias.clone(),
                    query: query.clone(),
                }),
                ..Default::default()
            },
            MetaAction::Del(del) => ClientMsg {
                del: Some(MsgClientDel {
                    id: meta.id.clone(),
                    topic: meta.alias.clone(),
                    ..del.clone()
                }),
                ..Default::default()
            },
        });
        req.sess = Some(self.sess_info(&meta.sess, &key, meta.uid, false));

        if let Err(e) = self.cluster.send_to_master(req).await {
            tracing::warn!(topic = %self.name, error = %e, "meta relay failed");
            let mut reply =
                wire::err_cluster_unreachable(meta.id.as_deref(), Some(&meta.alias), Utc::now());
            reply.rcpt_sid = meta.remote_sid.clone();
            meta.sess.queue_out(reply);
        }
    }

    async fn forward_supd(&mut self, upd: SessUpdate) {
        let key = upd
            .remote_sid
            .clone()
            .unwrap_or_else(|| upd.sess.sid.clone());
        let uid = self.sessions.get(&key).map(|s| s.uid).unwrap_or(Uid::ZERO);
        let update = ClusterSessUpdate {
            node: self.cluster.self_name().to_string(),
            topic: self.name.clone(),
            sess: self.sess_info(&upd.sess, &key, uid, false),
            ua_change: upd.user_agent,
            background: upd.foregrounded.then_some(false),
        };
        let master = match self.cluster.master_of(&self.name) {
            Some(master) => master,
            None => return,
        };
        if let Err(e) = self
            .cluster
            .send_frame(&master, &super::ClusterFrame::SessUpdate(update))
            .await
        {
            tracing::debug!(topic = %self.name, error = %e, "session update relay failed");
        }
    }

    /// A master reply or fan-out copy arrived.
    fn handle_resp(&mut self, resp: ClusterResp) {
        let mut msg = resp.msg;
        if let (Some(pres), Some(filters)) = (msg.pres.as_mut(), resp.pres_filters) {
            pres.filters = filters;
        }
        if let Some(data) = msg.data.as_ref()
            && data.seq > self.last_seq_id
        {
            self.last_seq_id = data.seq;
        }

        match resp.sid {
            Some(sid) => {
                if let Some(sref) = self.sessions.get(&sid) {
                    if !sref.sess.queue_out(msg) {
                        tracing::warn!(topic = %self.name, sid = %sid, "session queue full, dropping reply");
                    }
                } else if let Some(sess) = self.ctx.sessions.get(&sid) {
                    // Reply for a session that already detached locally
                    // (e.g. the final {ctrl} of a leave).
                    sess.queue_out(msg);
                }
            }
            None => {
                // Coarse fan-out: deliver to every multiplexed session,
                // honoring the uid-level filters we can evaluate here.
                let mut evict = Vec::new();
                for (key, sref) in &self.sessions {
                    if let Some(pres) = msg.pres.as_ref() {
                        let f = &pres.filters;
                        if let Some(single) = f.single_user
                            && sref.uid != single
                        {
                            continue;
                        }
                        if let Some(excluded) = f.exclude_user
                            && sref.uid == excluded
                        {
                            continue;
                        }
                        if !f.skip_topic.is_empty() && sref.sess.has_sub(&f.skip_topic) {
                            continue;
                        }
                    }
                    let mut out = msg.clone();
                    out.rcpt_sid = None;
                    if let Some(data) = out.data.as_mut() {
                        data.topic = sref.alias.clone();
                    }
                    if let Some(info) = out.info.as_mut() {
                        info.topic = sref.alias.clone();
                    }
                    if let Some(pres) = out.pres.as_mut()
                        && pres.topic != "me"
                    {
                        pres.topic = sref.alias.clone();
                    }
                    if !sref.sess.queue_out(out) {
                        evict.push(key.clone());
                    }
                }
                for key in evict {
                    tracing::warn!(topic = %self.name, sid = %key, "session queue full, evicting");
                    if let Some(sref) = self.sessions.get(&key) {
                        let leave = LeaveReq {
                            sess: sref.sess.clone(),
                            remote_sid: None,
                            uid: sref.uid,
                            unsub: false,
                            id: None,
                            alias: sref.alias.clone(),
                        };
                        if self.handle.unreg.try_send(leave).is_err() {
                            tracing::warn!(topic = %self.name, "unreg queue full, eviction dropped");
                        }
                    }
                }
            }
        }
    }

    fn terminate(&mut self, req: ExitReq) {
        tracing::debug!(topic = %self.name, reason = ?req.reason, "proxy topic stopping");
        for (_, sref) in self.sessions.drain() {
            sref.sess.del_sub(&self.name);
            sref.sess.detach_topic(&self.name);
        }
        if let Some(done) = req.done {
            let _ = done.send(());
        }
    }
}
