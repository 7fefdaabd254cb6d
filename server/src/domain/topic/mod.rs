//! The per-topic event loop.
//!
//! Every live topic is a single-writer task owning all topic state. External
//! components talk to it through bounded queues bundled in a [`TopicHandle`];
//! nothing outside the loop mutates topic state, and the only externally
//! visible state is the atomic status bitfield. Suspensions inside the loop
//! are store calls only — store latency is topic latency by design.

mod broadcast;
mod init;
mod join;
mod meta;
mod presence;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::core::constants::{
    DEFERRED_NOTIFY_DELAY_MS, TOPIC_BROADCAST_QUEUE_LEN, TOPIC_EXIT_QUEUE_LEN,
    TOPIC_META_QUEUE_LEN, TOPIC_PROXY_QUEUE_LEN, TOPIC_REG_QUEUE_LEN, TOPIC_SUPD_QUEUE_LEN,
    TOPIC_UNREG_QUEUE_LEN, UA_TIMER_DELAY_MS,
};
use crate::domain::ServerCtx;
use crate::domain::access::AccessMode;
use crate::domain::cluster::ClusterResp;
use crate::domain::session::Session;
use crate::domain::types::{AuthLevel, TopicCat, Uid, p2p_uids};
use crate::domain::wire::{
    MsgClientDel, MsgGetQuery, MsgSetQuery, ServerMsg,
};

pub use init::TopicInit;
pub(crate) use init::bootstrap as bootstrap_master;

// =============================================================================
// Status bits
// =============================================================================

const STATUS_LOADED: u32 = 0x01;
const STATUS_PAUSED: u32 = 0x02;
const STATUS_MARKED_DELETED: u32 = 0x04;
const STATUS_READ_ONLY: u32 = 0x08;

/// Atomic status bitfield, readable without entering the loop.
#[derive(Debug, Default)]
pub struct TopicStatus(AtomicU32);

impl TopicStatus {
    fn set(&self, bit: u32) {
        self.0.fetch_or(bit, Ordering::AcqRel);
    }

    fn contains(&self, bit: u32) -> bool {
        self.0.load(Ordering::Acquire) & bit != 0
    }

    pub fn is_loaded(&self) -> bool {
        self.contains(STATUS_LOADED)
    }

    pub(crate) fn set_loaded(&self) {
        self.set(STATUS_LOADED);
    }

    /// Mark the topic dead-by-panic: inactive forever, `Locked` to clients.
    pub(crate) fn mark_deleted(&self) {
        self.set(STATUS_PAUSED | STATUS_MARKED_DELETED);
    }

    /// Writes rejected, reads still served (suspended accounts).
    pub(crate) fn set_read_only(&self) {
        self.set(STATUS_READ_ONLY);
    }

    pub fn is_paused(&self) -> bool {
        self.contains(STATUS_PAUSED)
    }

    pub fn is_deleted(&self) -> bool {
        self.contains(STATUS_MARKED_DELETED)
    }

    pub fn is_read_only(&self) -> bool {
        self.contains(STATUS_READ_ONLY)
    }

    /// Paused or deleted topics answer everything with `Locked`.
    pub fn is_inactive(&self) -> bool {
        self.contains(STATUS_PAUSED | STATUS_MARKED_DELETED)
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Subscribe/attach request (`reg` queue).
#[derive(Debug)]
pub struct JoinReq {
    pub sess: Arc<Session>,
    /// Remote client session id when `sess` is multiplexing.
    pub remote_sid: Option<String>,
    pub uid: Uid,
    pub auth_lvl: AuthLevel,
    pub id: Option<String>,
    /// Name the client addressed the topic by.
    pub alias: String,
    pub is_chan_request: bool,
    /// Topic is being created on behalf of this join.
    pub created: bool,
    pub background: bool,
    pub set: Option<MsgSetQuery>,
    pub get: Option<MsgGetQuery>,
}

impl JoinReq {
    pub(crate) fn key_sid(&self) -> String {
        self.remote_sid
            .clone()
            .unwrap_or_else(|| self.sess.sid.clone())
    }
}

/// Leave/detach/eviction request (`unreg` queue). `id == None` means a
/// detach without a `{ctrl}` reply (session died or was evicted).
#[derive(Debug)]
pub struct LeaveReq {
    pub sess: Arc<Session>,
    pub remote_sid: Option<String>,
    pub uid: Uid,
    pub unsub: bool,
    pub id: Option<String>,
    pub alias: String,
}

impl LeaveReq {
    pub(crate) fn key_sid(&self) -> String {
        self.remote_sid
            .clone()
            .unwrap_or_else(|| self.sess.sid.clone())
    }

    /// Message id to echo; a client leave without an id carries `Some("")`
    /// (reply wanted, nothing to echo), an eviction carries `None`.
    pub(crate) fn reply_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Meta request (`meta` queue).
#[derive(Debug)]
pub struct MetaReq {
    pub sess: Arc<Session>,
    pub remote_sid: Option<String>,
    pub uid: Uid,
    pub auth_lvl: AuthLevel,
    pub id: Option<String>,
    pub alias: String,
    pub action: MetaAction,
}

#[derive(Debug)]
pub enum MetaAction {
    Get(MsgGetQuery),
    Set(MsgSetQuery),
    Del(MsgClientDel),
}

/// Session update (`supd` queue): user-agent change or background session
/// coming to the foreground.
#[derive(Debug)]
pub struct SessUpdate {
    pub sess: Arc<Session>,
    pub remote_sid: Option<String>,
    pub user_agent: Option<String>,
    pub foregrounded: bool,
}

/// Why a topic loop is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Idle timeout; nothing to announce.
    None,
    /// User deleted the topic; announce `gone`.
    Deleted,
    /// Process shutdown.
    Shutdown,
    /// Cluster rehash moved the topic to another node; emit `term` directly
    /// to attached sessions.
    Rehashing,
}

pub struct ExitReq {
    pub reason: ShutdownReason,
    pub done: Option<oneshot::Sender<()>>,
}

// =============================================================================
// Handle
// =============================================================================

/// Senders into a live topic loop, held by the hub.
#[derive(Clone)]
pub struct TopicHandle {
    pub name: String,
    pub is_proxy: bool,
    pub status: Arc<TopicStatus>,
    pub reg: mpsc::Sender<JoinReq>,
    pub unreg: mpsc::Sender<LeaveReq>,
    pub broadcast: mpsc::Sender<ServerMsg>,
    pub meta: mpsc::Sender<MetaReq>,
    pub supd: mpsc::Sender<SessUpdate>,
    pub exit: mpsc::Sender<ExitReq>,
    /// Cluster replies; proxy topics only.
    pub proxy: Option<mpsc::Sender<ClusterResp>>,
}

/// Receiver ends, owned by the topic task.
pub struct TopicReceivers {
    pub reg: mpsc::Receiver<JoinReq>,
    pub unreg: mpsc::Receiver<LeaveReq>,
    pub broadcast: mpsc::Receiver<ServerMsg>,
    pub meta: mpsc::Receiver<MetaReq>,
    pub supd: mpsc::Receiver<SessUpdate>,
    pub exit: mpsc::Receiver<ExitReq>,
    pub proxy: Option<mpsc::Receiver<ClusterResp>>,
}

impl TopicHandle {
    pub fn channels(name: &str, is_proxy: bool) -> (TopicHandle, TopicReceivers) {
        let (reg_tx, reg_rx) = mpsc::channel(TOPIC_REG_QUEUE_LEN);
        let (unreg_tx, unreg_rx) = mpsc::channel(TOPIC_UNREG_QUEUE_LEN);
        let (bcast_tx, bcast_rx) = mpsc::channel(TOPIC_BROADCAST_QUEUE_LEN);
        let (meta_tx, meta_rx) = mpsc::channel(TOPIC_META_QUEUE_LEN);
        let (supd_tx, supd_rx) = mpsc::channel(TOPIC_SUPD_QUEUE_LEN);
        let (exit_tx, exit_rx) = mpsc::channel(TOPIC_EXIT_QUEUE_LEN);
        let (proxy_tx, proxy_rx) = if is_proxy {
            let (tx, rx) = mpsc::channel(TOPIC_PROXY_QUEUE_LEN);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        (
            TopicHandle {
                name: name.to_string(),
                is_proxy,
                status: Arc::new(TopicStatus::default()),
                reg: reg_tx,
                unreg: unreg_tx,
                broadcast: bcast_tx,
                meta: meta_tx,
                supd: supd_tx,
                exit: exit_tx,
                proxy: proxy_tx,
            },
            TopicReceivers {
                reg: reg_rx,
                unreg: unreg_rx,
                broadcast: bcast_rx,
                meta: meta_rx,
                supd: supd_rx,
                exit: exit_rx,
                proxy: proxy_rx,
            },
        )
    }
}

// =============================================================================
// In-memory topic state
// =============================================================================

/// Cached subscription state of one user.
#[derive(Debug, Clone)]
pub(crate) struct PerUser {
    pub mode_want: AccessMode,
    pub mode_given: AccessMode,
    pub private: Option<Value>,
    pub read_id: u64,
    pub recv_id: u64,
    pub del_id: u64,
    /// Attached non-background, non-channel sessions of this user.
    pub online: u32,
    pub deleted: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// On p2p: the counterpart's public, shown to this user as the topic's
    /// public.
    pub p2p_public: Option<Value>,
}

impl PerUser {
    pub fn from_row(row: &crate::data::types::SubscriptionRow) -> PerUser {
        PerUser {
            mode_want: row.mode_want,
            mode_given: row.mode_given,
            private: row.private.clone(),
            read_id: row.read_seq_id,
            recv_id: row.recv_seq_id,
            del_id: row.del_id,
            online: 0,
            deleted: row.deleted_at.is_some(),
            created: row.created,
            updated: row.updated,
            p2p_public: None,
        }
    }

    pub fn effective(&self) -> AccessMode {
        self.mode_want & self.mode_given
    }
}

/// Presence tracking of one contact on a `me` topic.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PerSub {
    pub online: bool,
    pub enabled: bool,
}

/// One attached session (one remote client session for multiplexed refs).
pub(crate) struct SessionRef {
    pub sess: Arc<Session>,
    pub uid: Uid,
    /// Topic name this session addressed; replies and fan-out use it.
    pub alias: String,
    pub is_chan_sub: bool,
    /// Contributes 1 to `per_user[uid].online`.
    pub counted: bool,
}

pub struct Topic {
    pub(crate) name: String,
    pub(crate) cat: TopicCat,
    pub(crate) is_chan: bool,
    pub(crate) status: Arc<TopicStatus>,
    pub(crate) owner: Uid,
    pub(crate) created: DateTime<Utc>,
    pub(crate) updated: DateTime<Utc>,
    pub(crate) touched: DateTime<Utc>,
    pub(crate) last_seq_id: u64,
    pub(crate) del_id: u64,
    pub(crate) access_auth: AccessMode,
    pub(crate) access_anon: AccessMode,
    pub(crate) public: Option<Value>,
    pub(crate) tags: Vec<String>,
    pub(crate) per_user: HashMap<Uid, PerUser>,
    pub(crate) mode_want_union: AccessMode,
    pub(crate) mode_given_union: AccessMode,
    /// `me` only: presence state of the user's contacts.
    pub(crate) per_subs: HashMap<String, PerSub>,
    /// Attached sessions keyed by (remote) session id.
    pub(crate) sessions: HashMap<String, SessionRef>,
    /// `fnd` only: per-session search queries.
    pub(crate) fnd_queries: HashMap<String, Vec<String>>,
    pub(crate) ctx: Arc<ServerCtx>,
    pub(crate) handle: TopicHandle,

    // Timers; `None` means unarmed.
    kill_at: Option<Instant>,
    ua_at: Option<Instant>,
    defr_at: Option<Instant>,
    /// Pending user-agent announcement (`me` only).
    pending_ua: Option<String>,
    /// Users whose deferred `on` presence awaits the coalescing timer.
    pending_on: Vec<Uid>,
}

impl Topic {
    /// Recompute the want/given unions after `per_user` changed.
    pub(crate) fn recompute_unions(&mut self) {
        let mut want = AccessMode::NONE;
        let mut given = AccessMode::NONE;
        for pu in self.per_user.values() {
            if pu.deleted {
                continue;
            }
            want |= pu.mode_want;
            given |= pu.mode_given;
        }
        self.mode_want_union = want;
        self.mode_given_union = given;
    }

    /// Name this topic presents to `uid` (`me`, the peer's user id on p2p,
    /// the group name otherwise).
    pub(crate) fn alias_for(&self, uid: Uid) -> String {
        match self.cat {
            TopicCat::Me => "me".to_string(),
            TopicCat::Fnd => "fnd".to_string(),
            TopicCat::P2P => match p2p_uids(&self.name) {
                Some((a, b)) => {
                    if uid == a {
                        b.user_id()
                    } else {
                        a.user_id()
                    }
                }
                None => self.name.clone(),
            },
            _ => self.name.clone(),
        }
    }

    /// Effective mode used for permission checks; zero-uid (multiplexing
    /// without a concrete user) intentionally over-approximates with the
    /// unions, per-recipient filtering happens downstream.
    pub(crate) fn effective_for(&self, uid: Uid) -> AccessMode {
        if uid.is_zero() {
            return self.mode_want_union & self.mode_given_union;
        }
        self.per_user
            .get(&uid)
            .filter(|pu| !pu.deleted)
            .map(|pu| pu.effective())
            .unwrap_or(AccessMode::NONE)
    }

    /// Reply to the session a request came from, threading the remote
    /// session id for multiplexed requests.
    pub(crate) fn reply(
        &self,
        sess: &Arc<Session>,
        remote_sid: &Option<String>,
        mut msg: ServerMsg,
    ) {
        msg.rcpt_sid = remote_sid.clone();
        if !sess.queue_out(msg) {
            tracing::warn!(topic = %self.name, sid = %sess.sid, "reply dropped, session queue full");
        }
    }

    pub(crate) fn arm_kill_timer(&mut self) {
        if self.cat == TopicCat::Sys {
            return;
        }
        let ttl = self.ctx.config.idle_master_topic_timeout;
        self.kill_at = Some(Instant::now() + ttl);
    }

    pub(crate) fn arm_ua_timer(&mut self) {
        self.ua_at = Some(Instant::now() + Duration::from_millis(UA_TIMER_DELAY_MS));
    }

    pub(crate) fn arm_defr_timer(&mut self) {
        if self.defr_at.is_none() {
            self.defr_at = Some(Instant::now() + Duration::from_millis(DEFERRED_NOTIFY_DELAY_MS));
        }
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    pub(crate) async fn run(mut self, mut rx: TopicReceivers) {
        tracing::debug!(topic = %self.name, category = %self.cat, "topic loop started");
        if self.sessions.is_empty() {
            self.arm_kill_timer();
        }

        fn far_future() -> Instant {
            Instant::now() + Duration::from_secs(86400 * 365)
        }

        loop {
            let kill_at = self.kill_at.unwrap_or_else(far_future);
            let ua_at = self.ua_at.unwrap_or_else(far_future);
            let defr_at = self.defr_at.unwrap_or_else(far_future);

            tokio::select! {
                biased;

                Some(req) = rx.exit.recv() => {
                    self.terminate(req).await;
                    return;
                }

                Some(req) = rx.reg.recv() => {
                    self.handle_join(req).await;
                }

                Some(req) = rx.unreg.recv() => {
                    self.handle_leave(req).await;
                }

                Some(msg) = rx.broadcast.recv() => {
                    self.handle_broadcast(msg).await;
                }

                Some(req) = rx.meta.recv() => {
                    self.handle_meta(req).await;
                }

                Some(upd) = rx.supd.recv() => {
                    self.handle_sess_update(upd).await;
                }

                _ = tokio::time::sleep_until(kill_at), if self.kill_at.is_some() => {
                    self.kill_at = None;
                    self.ctx.hub().request_stop(&self.name, ShutdownReason::None);
                }

                _ = tokio::time::sleep_until(ua_at), if self.ua_at.is_some() => {
                    self.ua_at = None;
                    self.fire_ua_timer();
                }

                _ = tokio::time::sleep_until(defr_at), if self.defr_at.is_some() => {
                    self.defr_at = None;
                    self.flush_deferred_presence();
                }
            }
        }
    }

    /// Session update: user-agent change (`me` debounces the announcement)
    /// or a background session coming to the foreground.
    async fn handle_sess_update(&mut self, upd: SessUpdate) {
        if let Some(ua) = upd.user_agent
            && self.cat == TopicCat::Me
            && self.pending_ua.as_deref() != Some(ua.as_str())
        {
            self.pending_ua = Some(ua);
            self.arm_ua_timer();
        }

        if upd.foregrounded {
            let key = upd
                .remote_sid
                .unwrap_or_else(|| upd.sess.sid.clone());
            let mut promoted = None;
            if let Some(sref) = self.sessions.get_mut(&key)
                && !sref.counted
                && !sref.is_chan_sub
            {
                sref.counted = true;
                promoted = Some(sref.uid);
            }
            if let Some(uid) = promoted {
                if let Some(pu) = self.per_user.get_mut(&uid) {
                    pu.online += 1;
                }
                if !self.pending_on.contains(&uid) {
                    self.pending_on.push(uid);
                }
                self.arm_defr_timer();
            }
        }
    }

    fn fire_ua_timer(&mut self) {
        if let Some(ua) = self.pending_ua.take() {
            self.pres_users_of_interest("ua", Some(&ua));
        }
    }

    /// Announce coalesced deferred `on` presence for freshly foregrounded
    /// sessions.
    fn flush_deferred_presence(&mut self) {
        let pending = std::mem::take(&mut self.pending_on);
        for uid in pending {
            let online = self.per_user.get(&uid).map(|pu| pu.online).unwrap_or(0);
            if online > 0 {
                self.announce_online_change(uid, true, None);
            }
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    async fn terminate(&mut self, req: ExitReq) {
        tracing::debug!(topic = %self.name, reason = ?req.reason, "topic loop stopping");
        self.status.set(STATUS_PAUSED);

        match req.reason {
            ShutdownReason::Deleted => {
                self.status.set(STATUS_MARKED_DELETED);
                // Tell every subscriber the topic is gone, online or not.
                self.pres_subs_offline(
                    "gone",
                    presence::PresParams::default(),
                    AccessMode::NONE,
                    None,
                    false,
                );
                let gone = ServerMsg::from_pres(self.make_pres("gone", None));
                self.fanout(&gone);
            }
            ShutdownReason::Rehashing => {
                // The broadcast queue dies with the loop; deliver `term`
                // straight into each session queue.
                self.pres_subs_online_direct("term");
            }
            ShutdownReason::None | ShutdownReason::Shutdown => {}
        }

        for (_, sref) in self.sessions.drain() {
            sref.sess.del_sub(&self.name);
            sref.sess.detach_topic(&self.name);
        }

        if let Some(done) = req.done {
            let _ = done.send(());
        }
    }
}
