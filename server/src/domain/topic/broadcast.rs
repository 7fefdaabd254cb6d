//! Broadcast handling: `{data}` persistence and fan-out, `{info}` receipts
//! and typing indicators, `{pres}` delivery.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;

use crate::data::types::{MessageRow, SubPatch, TopicPatch};
use crate::domain::access::AccessMode;
use crate::domain::push::{PushPayload, PushRecipient, Receipt};
use crate::domain::types::{TopicCat, Uid, grp_to_chn};
use crate::domain::wire::{self, ServerMsg};

use super::presence::PresParams;
use super::{LeaveReq, Topic};

impl Topic {
    pub(crate) async fn handle_broadcast(&mut self, msg: ServerMsg) {
        if msg.data.is_some() {
            self.handle_data(msg).await;
        } else if msg.info.is_some() {
            self.handle_info(msg).await;
        } else if msg.pres.is_some() {
            self.handle_pres(msg);
        } else {
            tracing::warn!(topic = %self.name, "unexpected message on broadcast queue");
        }
    }

    // =========================================================================
    // {data}
    // =========================================================================

    async fn handle_data(&mut self, mut msg: ServerMsg) {
        let from = msg.as_user;
        let reply_topic = msg.data.as_ref().map(|d| d.topic.clone()).unwrap_or_default();

        if self.status.is_read_only() {
            self.reply_err(&msg, &reply_topic, wire::err_permission_denied);
            return;
        }
        // `sys` accepts writes from anyone attached: it is the
        // report-to-administrators channel.
        if self.cat != TopicCat::Sys && !self.effective_for(from).is_writer() {
            self.reply_err(&msg, &reply_topic, wire::err_permission_denied);
            return;
        }

        let ts = Utc::now();
        let seq = self.last_seq_id + 1;
        let row = {
            let data = msg.data.as_ref().expect("checked above");
            MessageRow {
                topic: self.name.clone(),
                seq_id: seq,
                from,
                ts,
                head: data.head.clone(),
                content: data.content.clone(),
            }
        };
        if let Err(e) = self.ctx.store.messages().save(&row).await {
            tracing::error!(topic = %self.name, error = %e, "message save failed");
            self.reply_err(&msg, &reply_topic, wire::err_unknown);
            return;
        }
        self.last_seq_id = seq;
        self.touched = ts;
        if let Err(e) = self
            .ctx
            .store
            .topics()
            .update(
                &self.name,
                &TopicPatch {
                    seq_id: Some(seq),
                    touched: Some(ts),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::warn!(topic = %self.name, error = %e, "topic counter update failed");
        }

        {
            let data = msg.data.as_mut().expect("checked above");
            data.seq = seq;
            data.ts = Some(ts);
            data.from = (!from.is_zero()).then(|| from.user_id());
        }

        if let Some(sess) = msg.sess.clone() {
            self.reply(
                &sess,
                &msg.rcpt_sid,
                wire::no_err_accepted(
                    msg.id.as_deref(),
                    Some(&reply_topic),
                    ts,
                    Some(json!({ "seq": seq })),
                ),
            );
        }

        self.fanout(&msg);
        self.send_push_receipt(&msg);

        // Wake absent readers through their `me` topics.
        self.pres_subs_offline(
            "msg",
            PresParams {
                seq,
                ..Default::default()
            },
            AccessMode::READ,
            msg.skip_sid.as_deref(),
            true,
        );

        for (&uid, pu) in &self.per_user {
            if uid != from && !pu.deleted && pu.effective().is_reader() {
                self.ctx.users.inc_unread(uid, 1);
            }
        }
    }

    fn reply_err(
        &self,
        msg: &ServerMsg,
        topic: &str,
        make: fn(Option<&str>, Option<&str>, chrono::DateTime<Utc>) -> ServerMsg,
    ) {
        if let Some(sess) = &msg.sess {
            self.reply(
                sess,
                &msg.rcpt_sid,
                make(msg.id.as_deref(), Some(topic), Utc::now()),
            );
        }
    }

    // =========================================================================
    // {info}
    // =========================================================================

    async fn handle_info(&mut self, msg: ServerMsg) {
        let Some(info) = msg.info.as_ref() else {
            return;
        };
        let from = msg.as_user;
        match info.what.as_str() {
            "kp" => {
                // Typing indicators are best-effort: silently dropped when
                // the sender may not write or the topic is frozen.
                if self.status.is_read_only() || !self.effective_for(from).is_writer() {
                    return;
                }
                self.fanout(&msg);
            }
            "read" | "recv" => {
                let seq = info.seq.min(self.last_seq_id);
                if seq == 0 {
                    return;
                }
                let what = info.what.clone();
                let mut patch = SubPatch::default();
                let mut read_delta = 0i64;
                {
                    let Some(pu) = self.per_user.get_mut(&from) else {
                        return;
                    };
                    if what == "read" {
                        if seq <= pu.read_id {
                            return;
                        }
                        read_delta = (seq - pu.read_id) as i64;
                        pu.read_id = seq;
                        patch.read_seq_id = Some(seq);
                        if pu.recv_id < seq {
                            pu.recv_id = seq;
                            patch.recv_seq_id = Some(seq);
                        }
                    } else {
                        if seq <= pu.recv_id {
                            return;
                        }
                        pu.recv_id = seq;
                        patch.recv_seq_id = Some(seq);
                    }
                }
                if let Err(e) = self.ctx.store.subs().update(&self.name, from, &patch).await {
                    tracing::warn!(topic = %self.name, user = %from, error = %e, "receipt update failed");
                }
                if read_delta > 0 {
                    self.ctx.users.inc_unread(from, -read_delta);
                }
                // The user's other sessions learn about the moved cursor
                // through `me`.
                self.pres_single_user_offline(
                    from,
                    &what,
                    PresParams {
                        seq,
                        ..Default::default()
                    },
                    msg.skip_sid.as_deref(),
                );
                self.fanout(&msg);
            }
            other => {
                tracing::debug!(topic = %self.name, what = other, "unknown info event dropped");
            }
        }
    }

    // =========================================================================
    // {pres}
    // =========================================================================

    fn handle_pres(&mut self, msg: ServerMsg) {
        if self.cat == TopicCat::Me {
            let pres = msg.pres.clone().expect("checked by caller");
            if !self.me_process_pres(&pres) {
                return;
            }
        }
        self.fanout(&msg);
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    /// Deliver a message to every eligible attached session. Never blocks:
    /// a session with a full queue is scheduled for eviction through the
    /// `unreg` queue, and if even that queue is full the eviction is dropped
    /// with a log line.
    pub(crate) fn fanout(&mut self, msg: &ServerMsg) {
        let mut evict: Vec<LeaveReq> = Vec::new();

        for (key, sref) in &self.sessions {
            if msg.skip_sid.as_deref() == Some(key.as_str()) {
                continue;
            }
            let coarse_mux = sref.sess.is_multiplex() && sref.uid.is_zero();

            if msg.data.is_some() {
                let allowed = coarse_mux
                    || sref.is_chan_sub
                    || self.effective_for(sref.uid).is_reader();
                if !allowed {
                    continue;
                }
            } else if let Some(info) = &msg.info {
                if sref.is_chan_sub {
                    continue;
                }
                if info.what == "kp" && sref.uid == msg.as_user {
                    // Typing is never echoed to the sender's own sessions.
                    continue;
                }
                if !coarse_mux && !self.effective_for(sref.uid).is_reader() {
                    continue;
                }
            } else if let Some(pres) = &msg.pres {
                if !self.pres_allowed(pres, sref) {
                    continue;
                }
            }

            let mut out = msg.clone();
            out.sess = None;
            out.skip_sid = None;
            out.id = None;
            out.rcpt_sid = sref.sess.is_multiplex().then(|| key.clone());
            if let Some(data) = out.data.as_mut() {
                data.topic = sref.alias.clone();
                if sref.is_chan_sub {
                    data.from = None;
                }
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
                if sref.sess.is_multiplex() {
                    tracing::warn!(
                        topic = %self.name,
                        peer = sref.sess.peer.as_deref().unwrap_or(""),
                        "cluster peer queue full, message dropped"
                    );
                } else {
                    evict.push(LeaveReq {
                        sess: sref.sess.clone(),
                        remote_sid: None,
                        uid: sref.uid,
                        unsub: false,
                        id: None,
                        alias: sref.alias.clone(),
                    });
                }
            }
        }

        for leave in evict {
            tracing::warn!(topic = %self.name, sid = %leave.sess.sid, "session queue full, evicting");
            if self.handle.unreg.try_send(leave).is_err() {
                tracing::warn!(topic = %self.name, "unreg queue full, eviction dropped");
            }
        }
    }

    // =========================================================================
    // Push receipts
    // =========================================================================

    /// Materialize the push receipt for an accepted `{data}` message.
    fn send_push_receipt(&self, msg: &ServerMsg) {
        let Some(data) = msg.data.as_ref() else {
            return;
        };
        let from = msg.as_user;
        let mut to: HashMap<Uid, PushRecipient> = HashMap::new();
        for (&uid, pu) in &self.per_user {
            if uid == from || pu.deleted {
                continue;
            }
            let eff = pu.effective();
            if !(eff.is_presencer() && eff.is_reader()) {
                continue;
            }
            to.insert(
                uid,
                PushRecipient {
                    delivered: pu.online as usize,
                    unread: self.ctx.users.unread(uid),
                },
            );
        }
        let channel = if self.is_chan {
            grp_to_chn(&self.name)
        } else {
            None
        };
        self.ctx.push.push(Receipt {
            to,
            channel,
            payload: PushPayload {
                topic: self.name.clone(),
                from: data.from.clone(),
                ts: data.ts.unwrap_or(Utc::now()),
                seq: data.seq,
                content: Some(data.content.clone()),
            },
        });
    }
}
