//! Client sessions and the session registry.
//!
//! A session represents one long-lived client connection. The core owns the
//! session's bounded outbound queue, stop signal and detach queue; the
//! transport layer (out of scope here) holds the matching receivers and
//! drains them to the socket. Multiplexing sessions are synthetic: they
//! stand in for a cluster peer relaying many real clients and carry the
//! impersonated user ids in `muids`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::types::{AuthLevel, Uid};
use super::wire::ServerMsg;

/// Transport protocol of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProto {
    Websocket,
    Longpoll,
    Grpc,
    /// Synthetic session standing in for a cluster peer.
    Multiplex,
}

/// Signal telling the transport writer to close the connection, optionally
/// after flushing one final message.
#[derive(Debug)]
pub enum StopSignal {
    Close,
    Final(Box<ServerMsg>),
}

pub struct Session {
    pub sid: String,
    pub proto: SessionProto,
    /// Origin node name for multiplexing sessions.
    pub peer: Option<String>,
    uid: RwLock<Uid>,
    auth_lvl: RwLock<AuthLevel>,
    user_agent: RwLock<String>,
    background: AtomicBool,
    send: mpsc::Sender<ServerMsg>,
    stop: mpsc::Sender<StopSignal>,
    detach: mpsc::Sender<String>,
    subs: Mutex<HashSet<String>>,
    muids: Mutex<Vec<Uid>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("proto", &self.proto)
            .finish()
    }
}

impl Session {
    pub fn uid(&self) -> Uid {
        *self.uid.read()
    }

    pub fn set_uid(&self, uid: Uid) {
        *self.uid.write() = uid;
    }

    pub fn auth_lvl(&self) -> AuthLevel {
        *self.auth_lvl.read()
    }

    pub fn set_auth_lvl(&self, lvl: AuthLevel) {
        *self.auth_lvl.write() = lvl;
    }

    pub fn user_agent(&self) -> String {
        self.user_agent.read().clone()
    }

    pub fn set_user_agent(&self, ua: &str) {
        *self.user_agent.write() = ua.to_string();
    }

    pub fn background(&self) -> bool {
        self.background.load(Ordering::Relaxed)
    }

    pub fn set_background(&self, bg: bool) {
        self.background.store(bg, Ordering::Relaxed);
    }

    pub fn is_multiplex(&self) -> bool {
        self.proto == SessionProto::Multiplex
    }

    /// Non-blocking enqueue of an outbound message. `false` when the queue
    /// is full or the reader is gone; the caller decides whether that means
    /// eviction.
    pub fn queue_out(&self, msg: ServerMsg) -> bool {
        self.send.try_send(msg).is_ok()
    }

    /// Ask the transport to close the connection.
    pub fn stop_session(&self, sig: StopSignal) -> bool {
        self.stop.try_send(sig).is_ok()
    }

    /// Tell the transport side the session is no longer attached to `name`.
    pub fn detach_topic(&self, name: &str) -> bool {
        self.detach.try_send(name.to_string()).is_ok()
    }

    pub fn add_sub(&self, name: &str) -> bool {
        self.subs.lock().insert(name.to_string())
    }

    pub fn del_sub(&self, name: &str) -> bool {
        self.subs.lock().remove(name)
    }

    pub fn has_sub(&self, name: &str) -> bool {
        self.subs.lock().contains(name)
    }

    pub fn sub_count(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn subs(&self) -> Vec<String> {
        self.subs.lock().iter().cloned().collect()
    }

    /// Record an impersonated user on a multiplexing session.
    pub fn add_muid(&self, uid: Uid) {
        let mut muids = self.muids.lock();
        if !muids.contains(&uid) {
            muids.push(uid);
        }
    }

    pub fn del_muid(&self, uid: Uid) {
        self.muids.lock().retain(|u| *u != uid);
    }

    pub fn muids(&self) -> Vec<Uid> {
        self.muids.lock().clone()
    }
}

/// Receiver ends owned by the transport writer (or the test driving it).
pub struct SessionHandles {
    pub messages: mpsc::Receiver<ServerMsg>,
    pub stop: mpsc::Receiver<StopSignal>,
    pub detach: mpsc::Receiver<String>,
}

/// Registry of live sessions.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    queue_len: usize,
}

impl SessionStore {
    pub fn new(queue_len: usize) -> Self {
        SessionStore {
            sessions: DashMap::new(),
            queue_len,
        }
    }

    pub fn create(
        &self,
        proto: SessionProto,
        uid: Uid,
        auth_lvl: AuthLevel,
        user_agent: &str,
    ) -> (Arc<Session>, SessionHandles) {
        self.create_named(Uuid::new_v4().to_string(), proto, None, uid, auth_lvl, user_agent)
    }

    /// Create the multiplexing session representing `node` on `topic`.
    pub fn create_multiplex(&self, node: &str, topic: &str) -> (Arc<Session>, SessionHandles) {
        self.create_named(
            format!("mux.{}.{}", node, topic),
            SessionProto::Multiplex,
            Some(node.to_string()),
            Uid::ZERO,
            AuthLevel::None,
            "",
        )
    }

    fn create_named(
        &self,
        sid: String,
        proto: SessionProto,
        peer: Option<String>,
        uid: Uid,
        auth_lvl: AuthLevel,
        user_agent: &str,
    ) -> (Arc<Session>, SessionHandles) {
        let (send_tx, send_rx) = mpsc::channel(self.queue_len);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (detach_tx, detach_rx) = mpsc::channel(self.queue_len);
        let sess = Arc::new(Session {
            sid: sid.clone(),
            proto,
            peer,
            uid: RwLock::new(uid),
            auth_lvl: RwLock::new(auth_lvl),
            user_agent: RwLock::new(user_agent.to_string()),
            background: AtomicBool::new(false),
            send: send_tx,
            stop: stop_tx,
            detach: detach_tx,
            subs: Mutex::new(HashSet::new()),
            muids: Mutex::new(Vec::new()),
        });
        self.sessions.insert(sid, sess.clone());
        (
            sess,
            SessionHandles {
                messages: send_rx,
                stop: stop_rx,
                detach: detach_rx,
            },
        )
    }

    pub fn get(&self, sid: &str) -> Option<Arc<Session>> {
        self.sessions.get(sid).map(|s| s.clone())
    }

    pub fn delete(&self, sid: &str) -> Option<Arc<Session>> {
        self.sessions.remove(sid).map(|(_, s)| s)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Signal every live session to close.
    pub fn shutdown_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().stop_session(StopSignal::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::wire;
    use chrono::Utc;

    fn store() -> SessionStore {
        SessionStore::new(4)
    }

    #[test]
    fn test_create_and_lookup() {
        let store = store();
        let (sess, _h) = store.create(
            SessionProto::Websocket,
            Uid::new(7),
            AuthLevel::Auth,
            "test-agent",
        );
        assert_eq!(store.count(), 1);
        let found = store.get(&sess.sid).unwrap();
        assert_eq!(found.uid(), Uid::new(7));
        assert_eq!(found.user_agent(), "test-agent");

        store.delete(&sess.sid);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_queue_out_backpressure() {
        let store = store();
        let (sess, _h) = store.create(SessionProto::Websocket, Uid::new(1), AuthLevel::Auth, "");
        for _ in 0..4 {
            assert!(sess.queue_out(wire::no_err(None, None, Utc::now())));
        }
        // Queue full, nobody draining.
        assert!(!sess.queue_out(wire::no_err(None, None, Utc::now())));
    }

    #[test]
    fn test_sub_bookkeeping() {
        let store = store();
        let (sess, _h) = store.create(SessionProto::Websocket, Uid::new(1), AuthLevel::Auth, "");
        assert!(sess.add_sub("grp1"));
        assert!(!sess.add_sub("grp1"));
        assert!(sess.has_sub("grp1"));
        assert_eq!(sess.sub_count(), 1);
        assert!(sess.del_sub("grp1"));
        assert!(!sess.del_sub("grp1"));
    }

    #[test]
    fn test_multiplex_session() {
        let store = store();
        let (sess, _h) = store.create_multiplex("node2", "grp1");
        assert!(sess.is_multiplex());
        assert_eq!(sess.peer.as_deref(), Some("node2"));
        assert!(sess.uid().is_zero());
        sess.add_muid(Uid::new(3));
        sess.add_muid(Uid::new(3));
        sess.add_muid(Uid::new(9));
        assert_eq!(sess.muids(), vec![Uid::new(3), Uid::new(9)]);
        sess.del_muid(Uid::new(3));
        assert_eq!(sess.muids(), vec![Uid::new(9)]);
    }

    #[test]
    fn test_detach_queue() {
        let store = store();
        let (sess, mut h) = store.create(SessionProto::Grpc, Uid::new(1), AuthLevel::Auth, "");
        assert!(sess.detach_topic("grp1"));
        assert_eq!(h.detach.try_recv().unwrap(), "grp1");
    }
}
