//! End-to-end scenarios over the hub, topic loops and the memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::data::memory::MemoryStore;
use crate::data::traits::{SubsRepository, TopicsRepository};
use crate::data::types::{DefaultAccess, UserRow};
use crate::domain::access::AccessMode;
use crate::domain::push::Push;
use crate::domain::session::{Session, SessionHandles, SessionProto};
use crate::domain::types::{AuthLevel, Uid, grp_to_chn};
use crate::domain::wire::{
    ClientMsg, MsgClientDel, MsgClientGet, MsgClientLeave, MsgClientNote, MsgClientPub,
    MsgClientSet, MsgClientSub, MsgGetQuery, MsgRange, MsgServerCtrl, MsgSetDesc, MsgSetQuery,
    MsgSetSub, ServerMsg,
};
use crate::domain::{RuntimeConfig, ServerCtx, standalone_ctx};

struct TestServer {
    ctx: Arc<ServerCtx>,
    store: Arc<MemoryStore>,
}

fn server() -> TestServer {
    server_with(RuntimeConfig::default())
}

fn server_with(config: RuntimeConfig) -> TestServer {
    let store = MemoryStore::new();
    let ctx = standalone_ctx(config, store.store(), Push::new());
    TestServer { ctx, store }
}

impl TestServer {
    fn seed_user(&self, id: u64) -> Uid {
        self.seed_user_with_tags(id, &[])
    }

    fn seed_user_with_tags(&self, id: u64, tags: &[&str]) -> Uid {
        let uid = Uid::new(id);
        let now = Utc::now();
        self.store.put_user(UserRow {
            uid,
            created: now,
            updated: now,
            state: Default::default(),
            access: DefaultAccess {
                auth: AccessMode::AUTH,
                anon: AccessMode::NONE,
            },
            public: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            last_seen: None,
            user_agent: String::new(),
        });
        uid
    }

    fn connect(&self, uid: Uid) -> (Arc<Session>, SessionHandles) {
        self.ctx
            .sessions
            .create(SessionProto::Websocket, uid, AuthLevel::Auth, "test-agent")
    }

    async fn dispatch(&self, msg: ClientMsg, sess: &Arc<Session>) {
        self.ctx.hub().dispatch(msg, sess).await;
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

fn sub_msg_mode(topic: &str, mode: &str) -> ClientMsg {
    ClientMsg {
        sub: Some(MsgClientSub {
            id: Some("sub".to_string()),
            topic: topic.to_string(),
            set: Some(MsgSetQuery {
                sub: Some(MsgSetSub {
                    user: None,
                    mode: Some(mode.to_string()),
                }),
                ..Default::default()
            }),
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

fn note_msg(topic: &str, what: &str, seq: u64) -> ClientMsg {
    ClientMsg {
        note: Some(MsgClientNote {
            topic: topic.to_string(),
            what: what.to_string(),
            seq_id: seq,
        }),
        ..Default::default()
    }
}

fn leave_msg(topic: &str, unsub: bool) -> ClientMsg {
    ClientMsg {
        leave: Some(MsgClientLeave {
            id: Some("leave".to_string()),
            topic: topic.to_string(),
            unsub,
        }),
        ..Default::default()
    }
}

fn get_msg(topic: &str, what: &str) -> ClientMsg {
    ClientMsg {
        get: Some(MsgClientGet {
            id: Some("get".to_string()),
            topic: topic.to_string(),
            query: MsgGetQuery {
                what: what.to_string(),
                ..Default::default()
            },
        }),
        ..Default::default()
    }
}

fn set_sub_msg(topic: &str, user: Option<&str>, mode: &str) -> ClientMsg {
    ClientMsg {
        set: Some(MsgClientSet {
            id: Some("set".to_string()),
            topic: topic.to_string(),
            query: MsgSetQuery {
                sub: Some(MsgSetSub {
                    user: user.map(str::to_string),
                    mode: Some(mode.to_string()),
                }),
                ..Default::default()
            },
        }),
        ..Default::default()
    }
}

fn set_desc_public(topic: &str, public: serde_json::Value) -> ClientMsg {
    ClientMsg {
        set: Some(MsgClientSet {
            id: Some("set".to_string()),
            topic: topic.to_string(),
            query: MsgSetQuery {
                desc: Some(MsgSetDesc {
                    public: Some(public),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }),
        ..Default::default()
    }
}

fn del_msg(topic: &str, ranges: Vec<MsgRange>, hard: bool) -> ClientMsg {
    ClientMsg {
        del: Some(MsgClientDel {
            id: Some("del".to_string()),
            topic: topic.to_string(),
            what: "msg".to_string(),
            hard,
            del_seq: Some(ranges),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn recv_match<F>(h: &mut SessionHandles, mut pred: F) -> ServerMsg
where
    F: FnMut(&ServerMsg) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3), async {
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

async fn assert_silent<F>(h: &mut SessionHandles, pred: F)
where
    F: FnMut(&ServerMsg) -> bool + Copy,
{
    let got = tokio::time::timeout(Duration::from_millis(300), async {
        let mut pred = pred;
        loop {
            let msg = h.messages.recv().await.expect("session channel closed");
            if pred(&msg) {
                return msg;
            }
        }
    })
    .await;
    assert!(got.is_err(), "unexpected message: {:?}", got);
}

/// Create a group through a `new…` join and return its real name.
async fn create_group(srv: &TestServer, sess: &Arc<Session>, h: &mut SessionHandles) -> String {
    srv.dispatch(sub_msg("newtest"), sess).await;
    let ctrl = recv_ctrl(h).await;
    assert_eq!(ctrl.code, 200, "create failed: {:?}", ctrl);
    let name = ctrl.topic.unwrap();
    assert!(name.starts_with("grp"));
    assert_eq!(ctrl.params.unwrap()["tmpname"], json!("newtest"));
    name
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_basic_publish_and_read_receipt() {
    let srv = server();
    let a = srv.seed_user(1);
    let b = srv.seed_user(2);
    let (a1, mut ha1) = srv.connect(a);
    let (a2, mut ha2) = srv.connect(a);
    let (b1, mut hb1) = srv.connect(b);

    let grp = create_group(&srv, &a1, &mut ha1).await;

    srv.dispatch(sub_msg(&grp), &a2).await;
    assert_eq!(recv_ctrl(&mut ha2).await.code, 200);
    srv.dispatch(sub_msg(&grp), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    srv.dispatch(pub_msg(&grp, "hi"), &a1).await;
    let ctrl = recv_ctrl(&mut ha1).await;
    assert_eq!(ctrl.code, 202);
    assert_eq!(ctrl.params.unwrap()["seq"], json!(1));

    // The sender's session is skipped, everyone else gets the data.
    let data = recv_match(&mut ha2, |m| m.data.is_some()).await.data.unwrap();
    assert_eq!(data.seq, 1);
    assert_eq!(data.topic, grp);
    assert_eq!(data.from.as_deref(), Some(a.user_id().as_str()));
    assert_eq!(data.content, json!("hi"));
    let data = recv_match(&mut hb1, |m| m.data.is_some()).await.data.unwrap();
    assert_eq!(data.seq, 1);

    // B reads; subscribed readers observe the receipt.
    srv.dispatch(note_msg(&grp, "read", 1), &b1).await;
    let info = recv_match(&mut ha1, |m| m.info.is_some()).await.info.unwrap();
    assert_eq!(info.what, "read");
    assert_eq!(info.seq, 1);
    assert_eq!(info.from.as_deref(), Some(b.user_id().as_str()));

    // Cursors persisted and monotonic.
    let row = SubsRepository::get(&*srv.store, &grp, b).await.unwrap().unwrap();
    assert_eq!(row.read_seq_id, 1);
    assert_eq!(row.recv_seq_id, 1);
}

#[tokio::test]
async fn test_seq_ids_strictly_increase() {
    let srv = server();
    let a = srv.seed_user(1);
    let (a1, mut ha1) = srv.connect(a);
    let grp = create_group(&srv, &a1, &mut ha1).await;

    for i in 0..3u64 {
        srv.dispatch(pub_msg(&grp, &format!("m{}", i)), &a1).await;
        let ctrl = recv_match(&mut ha1, |m| {
            m.ctrl.as_ref().map(|c| c.code == 202).unwrap_or(false)
        })
        .await
        .ctrl
        .unwrap();
        assert_eq!(ctrl.params.unwrap()["seq"], json!(i + 1));
    }
}

#[tokio::test]
async fn test_read_receipt_never_regresses() {
    let srv = server();
    let a = srv.seed_user(1);
    let b = srv.seed_user(2);
    let (a1, mut ha1) = srv.connect(a);
    let (b1, mut hb1) = srv.connect(b);

    let grp = create_group(&srv, &a1, &mut ha1).await;
    srv.dispatch(sub_msg(&grp), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    srv.dispatch(pub_msg(&grp, "one"), &a1).await;
    srv.dispatch(pub_msg(&grp, "two"), &a1).await;
    recv_match(&mut hb1, |m| {
        m.data.as_ref().map(|d| d.seq == 2).unwrap_or(false)
    })
    .await;

    srv.dispatch(note_msg(&grp, "read", 2), &b1).await;
    let info = recv_match(&mut ha1, |m| m.info.is_some()).await.info.unwrap();
    assert_eq!(info.seq, 2);

    // A stale receipt is ignored entirely.
    srv.dispatch(note_msg(&grp, "read", 1), &b1).await;
    assert_silent(&mut ha1, |m| m.info.is_some()).await;
    let row = SubsRepository::get(&*srv.store, &grp, b).await.unwrap().unwrap();
    assert_eq!(row.read_seq_id, 2);
}

#[tokio::test]
async fn test_ownership_transfer() {
    let srv = server();
    let o = srv.seed_user(1);
    let b = srv.seed_user(2);
    let (o1, mut ho1) = srv.connect(o);
    let (b1, mut hb1) = srv.connect(b);

    let grp = create_group(&srv, &o1, &mut ho1).await;
    srv.dispatch(sub_msg(&grp), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    // Owner grants B everything, including ownership.
    let b_id = b.user_id();
    srv.dispatch(set_sub_msg(&grp, Some(b_id.as_str()), "JRWPASDO"), &o1).await;
    assert_eq!(recv_ctrl(&mut ho1).await.code, 200);

    // B claims the granted bits; the transfer completes.
    srv.dispatch(set_sub_msg(&grp, None, "JRWPASDO"), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    let row = TopicsRepository::get(&*srv.store, &grp).await.unwrap().unwrap();
    assert_eq!(row.owner, b);

    // Exactly one subscription row holds O.
    let subs = srv
        .store
        .get_subs(&grp, &Default::default())
        .await
        .unwrap();
    let owners: Vec<Uid> = subs
        .iter()
        .filter(|s| (s.mode_want & s.mode_given).is_owner())
        .map(|s| s.user)
        .collect();
    assert_eq!(owners, vec![b]);
}

#[tokio::test]
async fn test_owner_cannot_self_ban_or_unsub() {
    let srv = server();
    let o = srv.seed_user(1);
    let (o1, mut ho1) = srv.connect(o);
    let grp = create_group(&srv, &o1, &mut ho1).await;

    // Dropping O or J from the owner's own want is rejected.
    srv.dispatch(set_sub_msg(&grp, None, "JRWPASD"), &o1).await;
    assert_eq!(recv_ctrl(&mut ho1).await.code, 403);

    srv.dispatch(leave_msg(&grp, true), &o1).await;
    assert_eq!(recv_ctrl(&mut ho1).await.code, 403);
}

#[tokio::test]
async fn test_channel_reader() {
    let srv = server();
    let a = srv.seed_user(1);
    let c = srv.seed_user(3);
    let (a1, mut ha1) = srv.connect(a);
    let (c1, mut hc1) = srv.connect(c);

    // Channel-enabled group via the nch… alias.
    srv.dispatch(sub_msg("nchroom"), &a1).await;
    let ctrl = recv_ctrl(&mut ha1).await;
    assert_eq!(ctrl.code, 200);
    let grp = ctrl.topic.unwrap();
    let chn = grp_to_chn(&grp).unwrap();

    srv.dispatch(sub_msg(&chn), &c1).await;
    let ctrl = recv_ctrl(&mut hc1).await;
    assert_eq!(ctrl.code, 200);
    let acs = &ctrl.params.unwrap()["acs"];
    assert_eq!(acs["given"], json!("JRP"));

    // Channel readers get data with the sender stripped, under the alias.
    srv.dispatch(pub_msg(&grp, "broadcast"), &a1).await;
    let data = recv_match(&mut hc1, |m| m.data.is_some()).await.data.unwrap();
    assert_eq!(data.topic, chn);
    assert_eq!(data.from, None);
    assert_eq!(data.seq, 1);

    // Typing from a reader is silently dropped.
    srv.dispatch(note_msg(&chn, "kp", 0), &c1).await;
    assert_silent(&mut ha1, |m| m.info.is_some()).await;

    // And deletion is denied outright.
    srv.dispatch(del_msg(&chn, vec![MsgRange { low: 1, hi: None }], false), &c1).await;
    assert_eq!(recv_ctrl(&mut hc1).await.code, 403);
}

#[tokio::test]
async fn test_non_reader_receives_no_data() {
    let srv = server();
    let a = srv.seed_user(1);
    let b = srv.seed_user(2);
    let (a1, mut ha1) = srv.connect(a);
    let (b1, mut hb1) = srv.connect(b);

    let grp = create_group(&srv, &a1, &mut ha1).await;
    // B asks for join+presence only: no R in the effective mode.
    srv.dispatch(sub_msg_mode(&grp, "JP"), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    srv.dispatch(pub_msg(&grp, "secret"), &a1).await;
    assert_eq!(
        recv_match(&mut ha1, |m| m.ctrl.is_some()).await.ctrl.unwrap().code,
        202
    );
    assert_silent(&mut hb1, |m| m.data.is_some()).await;
}

#[tokio::test]
async fn test_muted_subscriber_gets_no_presence_except_acs_gone() {
    let srv = server();
    let a = srv.seed_user(1);
    let b = srv.seed_user(2);
    let c = srv.seed_user(3);
    let (a1, mut ha1) = srv.connect(a);
    let (b1, mut hb1) = srv.connect(b);
    let (c1, mut hc1) = srv.connect(c);

    let grp = create_group(&srv, &a1, &mut ha1).await;
    // B drops the P bit: muted.
    srv.dispatch(sub_msg_mode(&grp, "JRW"), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    // C joining announces `on`; the muted subscriber must not see it.
    srv.dispatch(sub_msg(&grp), &c1).await;
    assert_eq!(recv_ctrl(&mut hc1).await.code, 200);
    assert_silent(&mut hb1, |m| {
        m.pres.as_ref().map(|p| p.what == "on").unwrap_or(false)
    })
    .await;

    // But an acs change still reaches them.
    let c_id = c.user_id();
    srv.dispatch(set_sub_msg(&grp, Some(c_id.as_str()), "JRWPSD"), &a1).await;
    assert_eq!(recv_ctrl(&mut ha1).await.code, 200);
    let pres = recv_match(&mut hb1, |m| {
        m.pres.as_ref().map(|p| p.what == "acs").unwrap_or(false)
    })
    .await
    .pres
    .unwrap();
    assert_eq!(pres.topic, grp);
}

#[tokio::test]
async fn test_soft_and_hard_delete() {
    let srv = server();
    let a = srv.seed_user(1);
    let b = srv.seed_user(2);
    let (a1, mut ha1) = srv.connect(a);
    let (b1, mut hb1) = srv.connect(b);

    let grp = create_group(&srv, &a1, &mut ha1).await;
    srv.dispatch(sub_msg(&grp), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    for i in 0..4 {
        srv.dispatch(pub_msg(&grp, &format!("m{}", i)), &a1).await;
    }
    recv_match(&mut hb1, |m| {
        m.data.as_ref().map(|d| d.seq == 4).unwrap_or(false)
    })
    .await;

    // B soft-deletes 1..3 for themselves only: no fan-out.
    srv.dispatch(del_msg(&grp, vec![MsgRange { low: 1, hi: Some(3) }], false), &b1).await;
    let ctrl = recv_ctrl(&mut hb1).await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.params.unwrap()["del"], json!(1));
    assert_silent(&mut ha1, |m| {
        m.pres.as_ref().map(|p| p.what == "del").unwrap_or(false)
    })
    .await;

    // The owner hard-deletes everything; readers are notified.
    srv.dispatch(del_msg(&grp, vec![MsgRange { low: 1, hi: Some(5) }], true), &a1).await;
    let ctrl = recv_ctrl(&mut ha1).await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.params.unwrap()["del"], json!(2));
    let pres = recv_match(&mut hb1, |m| {
        m.pres.as_ref().map(|p| p.what == "del").unwrap_or(false)
    })
    .await
    .pres
    .unwrap();
    assert_eq!(pres.del_id, 2);
    assert_eq!(
        pres.del_seq,
        Some(vec![MsgRange {
            low: 1,
            hi: Some(5)
        }])
    );

    let row = SubsRepository::get(&*srv.store, &grp, a).await.unwrap().unwrap();
    assert_eq!(row.del_id, 2);
    let row = SubsRepository::get(&*srv.store, &grp, b).await.unwrap().unwrap();
    assert_eq!(row.del_id, 2);
}

#[tokio::test]
async fn test_delete_rejects_invalid_ranges() {
    let srv = server();
    let a = srv.seed_user(1);
    let (a1, mut ha1) = srv.connect(a);
    let grp = create_group(&srv, &a1, &mut ha1).await;

    srv.dispatch(pub_msg(&grp, "only"), &a1).await;
    recv_match(&mut ha1, |m| m.ctrl.as_ref().map(|c| c.code == 202).unwrap_or(false)).await;

    // Past the end of the message log.
    srv.dispatch(del_msg(&grp, vec![MsgRange { low: 1, hi: Some(9) }], true), &a1).await;
    let ctrl = recv_ctrl(&mut ha1).await;
    assert_eq!(ctrl.code, 400);
    assert_eq!(ctrl.text, "invalid range");
}

#[tokio::test]
async fn test_backpressure_evicts_slow_session() {
    let srv = server_with(RuntimeConfig {
        session_queue_len: 2,
        ..Default::default()
    });
    let a = srv.seed_user(1);
    let b = srv.seed_user(2);
    let (a1, mut ha1) = srv.connect(a);
    let (b1, mut hb1) = srv.connect(b);

    let grp = create_group(&srv, &a1, &mut ha1).await;
    srv.dispatch(sub_msg(&grp), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    // B stops draining; keep publishing until fan-out to B fails and the
    // topic schedules the eviction. A keeps receiving its own acks.
    for i in 0..6 {
        srv.dispatch(pub_msg(&grp, &format!("m{}", i)), &a1).await;
        recv_match(&mut ha1, |m| {
            m.ctrl.as_ref().map(|c| c.code == 202).unwrap_or(false)
        })
        .await;
    }

    let detached = tokio::time::timeout(Duration::from_secs(3), hb1.detach.recv())
        .await
        .expect("eviction never happened")
        .unwrap();
    assert_eq!(detached, grp);
    assert!(!b1.has_sub(&grp));

    // Delivery to other subscribers was never disturbed.
    srv.dispatch(pub_msg(&grp, "after"), &a1).await;
    recv_match(&mut ha1, |m| {
        m.ctrl.as_ref().map(|c| c.code == 202).unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_leave_unsub_is_idempotent() {
    let srv = server();
    let a = srv.seed_user(1);
    let b = srv.seed_user(2);
    let (a1, mut ha1) = srv.connect(a);
    let (b1, mut hb1) = srv.connect(b);

    let grp = create_group(&srv, &a1, &mut ha1).await;
    srv.dispatch(sub_msg(&grp), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    srv.dispatch(leave_msg(&grp, true), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    // Repeating the unsubscribe is a no-op, not an error.
    srv.dispatch(leave_msg(&grp, true), &b1).await;
    let ctrl = recv_ctrl(&mut hb1).await;
    assert_eq!(ctrl.code, 204);
    assert_eq!(ctrl.text, "no action");
}

#[tokio::test]
async fn test_online_counter_tracks_sessions() {
    let srv = server();
    let a = srv.seed_user(1);
    let b = srv.seed_user(2);
    let (a1, mut ha1) = srv.connect(a);
    let (b1, mut hb1) = srv.connect(b);
    let (b2, mut hb2) = srv.connect(b);

    let grp = create_group(&srv, &a1, &mut ha1).await;
    srv.dispatch(sub_msg(&grp), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    // First session of B announces `on` to A.
    recv_match(&mut ha1, |m| {
        m.pres.as_ref().map(|p| p.what == "on").unwrap_or(false)
    })
    .await;

    // Second session attaches silently (already online).
    srv.dispatch(sub_msg(&grp), &b2).await;
    assert_eq!(recv_ctrl(&mut hb2).await.code, 200);
    assert_silent(&mut ha1, |m| {
        m.pres.as_ref().map(|p| p.what == "on").unwrap_or(false)
    })
    .await;

    // One session leaves: still online. The last one leaving goes `off`.
    srv.dispatch(leave_msg(&grp, false), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);
    assert_silent(&mut ha1, |m| {
        m.pres.as_ref().map(|p| p.what == "off").unwrap_or(false)
    })
    .await;
    srv.dispatch(leave_msg(&grp, false), &b2).await;
    assert_eq!(recv_ctrl(&mut hb2).await.code, 200);
    recv_match(&mut ha1, |m| {
        m.pres.as_ref().map(|p| p.what == "off").unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_me_topic_lists_contacts() {
    let srv = server();
    let a = srv.seed_user(1);
    let (a1, mut ha1) = srv.connect(a);

    let grp = create_group(&srv, &a1, &mut ha1).await;

    srv.dispatch(sub_msg("me"), &a1).await;
    assert_eq!(recv_ctrl(&mut ha1).await.code, 200);

    srv.dispatch(get_msg("me", "sub"), &a1).await;
    let meta = recv_match(&mut ha1, |m| m.meta.is_some()).await.meta.unwrap();
    let subs = meta.sub.unwrap();
    assert!(subs.iter().any(|s| s.topic.as_deref() == Some(grp.as_str())));
}

#[tokio::test]
async fn test_fnd_search_by_tags() {
    let srv = server();
    let a = srv.seed_user(1);
    let b = srv.seed_user_with_tags(2, &["travel", "rust"]);
    let (a1, mut ha1) = srv.connect(a);

    srv.dispatch(sub_msg("fnd"), &a1).await;
    assert_eq!(recv_ctrl(&mut ha1).await.code, 200);

    srv.dispatch(set_desc_public("fnd", json!("travel")), &a1).await;
    assert_eq!(recv_ctrl(&mut ha1).await.code, 200);

    srv.dispatch(get_msg("fnd", "sub"), &a1).await;
    let meta = recv_match(&mut ha1, |m| m.meta.is_some()).await.meta.unwrap();
    let subs = meta.sub.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].user.as_deref(), Some(b.user_id().as_str()));
}

#[tokio::test]
async fn test_p2p_between_two_users() {
    let srv = server();
    let a = srv.seed_user(1);
    let b = srv.seed_user(2);
    let (a1, mut ha1) = srv.connect(a);
    let (b1, mut hb1) = srv.connect(b);

    // A opens the conversation by addressing B's user id.
    srv.dispatch(sub_msg(&b.user_id()), &a1).await;
    let ctrl = recv_ctrl(&mut ha1).await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.topic.as_deref(), Some(b.user_id().as_str()));

    // B attaches from their side and reads A's message.
    srv.dispatch(sub_msg(&a.user_id()), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    srv.dispatch(pub_msg(&b.user_id(), "hello"), &a1).await;
    let data = recv_match(&mut hb1, |m| m.data.is_some()).await.data.unwrap();
    // B sees the conversation under A's name.
    assert_eq!(data.topic, a.user_id());
    assert_eq!(data.content, json!("hello"));
}

#[tokio::test]
async fn test_publish_requires_write_permission() {
    let srv = server();
    let a = srv.seed_user(1);
    let b = srv.seed_user(2);
    let (a1, mut ha1) = srv.connect(a);
    let (b1, mut hb1) = srv.connect(b);

    let grp = create_group(&srv, &a1, &mut ha1).await;
    srv.dispatch(sub_msg_mode(&grp, "JRP"), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    srv.dispatch(pub_msg(&grp, "nope"), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 403);
}

#[tokio::test]
async fn test_publish_requires_attach() {
    let srv = server();
    let a = srv.seed_user(1);
    let (a1, mut ha1) = srv.connect(a);
    srv.dispatch(pub_msg("grpnope", "hi"), &a1).await;
    let ctrl = recv_ctrl(&mut ha1).await;
    assert_eq!(ctrl.code, 409);
}

#[tokio::test]
async fn test_subscriber_cap() {
    let srv = server_with(RuntimeConfig {
        max_subscriber_count: 2,
        ..Default::default()
    });
    let a = srv.seed_user(1);
    let b = srv.seed_user(2);
    let c = srv.seed_user(3);
    let (a1, mut ha1) = srv.connect(a);
    let (b1, mut hb1) = srv.connect(b);
    let (c1, mut hc1) = srv.connect(c);

    let grp = create_group(&srv, &a1, &mut ha1).await;
    srv.dispatch(sub_msg(&grp), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);
    srv.dispatch(sub_msg(&grp), &c1).await;
    assert_eq!(recv_ctrl(&mut hc1).await.code, 422);
}

#[tokio::test]
async fn test_idle_topic_is_reaped() {
    let srv = server_with(RuntimeConfig {
        idle_master_topic_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    let a = srv.seed_user(1);
    let (a1, mut ha1) = srv.connect(a);
    let grp = create_group(&srv, &a1, &mut ha1).await;
    assert!(srv.ctx.hub().is_topic_live(&grp));

    srv.dispatch(leave_msg(&grp, false), &a1).await;
    assert_eq!(recv_ctrl(&mut ha1).await.code, 200);

    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if !srv.ctx.hub().is_topic_live(&grp) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("idle topic never reaped");
}

#[tokio::test]
async fn test_deleted_topic_locks_out_clients() {
    let srv = server();
    let a = srv.seed_user(1);
    let b = srv.seed_user(2);
    let (a1, mut ha1) = srv.connect(a);
    let (b1, mut hb1) = srv.connect(b);

    let grp = create_group(&srv, &a1, &mut ha1).await;
    srv.dispatch(sub_msg(&grp), &b1).await;
    assert_eq!(recv_ctrl(&mut hb1).await.code, 200);

    srv.dispatch(
        ClientMsg {
            del: Some(MsgClientDel {
                id: Some("dt".to_string()),
                topic: grp.clone(),
                what: "topic".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        &a1,
    )
    .await;
    assert_eq!(recv_ctrl(&mut ha1).await.code, 200);

    // The topic announces gone and detaches everyone.
    recv_match(&mut hb1, |m| {
        m.pres.as_ref().map(|p| p.what == "gone").unwrap_or(false)
    })
    .await;
    let detached = tokio::time::timeout(Duration::from_secs(3), hb1.detach.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detached, grp);

    // The row is gone from the store.
    assert!(TopicsRepository::get(&*srv.store, &grp).await.unwrap().is_none());
}
