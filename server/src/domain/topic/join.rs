//! Subscribe and leave handling.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::data::error::StoreError;
use crate::data::types::{SubPatch, SubscriptionRow};
use crate::domain::access::AccessMode;
use crate::domain::push::ChannelReq;
use crate::domain::types::{AuthLevel, TopicCat, Uid, p2p_uids};
use crate::domain::wire::{self, MsgServerPres, PresFilters, ServerMsg};

use super::meta::ReqCtx;
use super::presence::PresParams;
use super::{JoinReq, LeaveReq, PerUser, SessionRef, Topic};

impl Topic {
    // =========================================================================
    // Subscribe
    // =========================================================================

    pub(crate) async fn handle_join(&mut self, req: JoinReq) {
        let now = Utc::now();
        let reply_to = req.alias.clone();
        if self.status.is_inactive() {
            self.reply(
                &req.sess,
                &req.remote_sid,
                wire::err_locked(req.id.as_deref(), Some(&reply_to), now),
            );
            return;
        }
        self.kill_at = None;

        if req.is_chan_request && !self.is_chan {
            // The chn… alias only exists for channel-enabled groups.
            self.reply(
                &req.sess,
                &req.remote_sid,
                wire::err_not_found(req.id.as_deref(), Some(&reply_to), now),
            );
            return;
        }
        if req.uid.is_zero() {
            self.reply(
                &req.sess,
                &req.remote_sid,
                wire::err_auth_required(req.id.as_deref(), Some(&reply_to), now),
            );
            return;
        }
        if self.cat == TopicCat::Sys && req.auth_lvl < AuthLevel::Auth {
            self.reply(
                &req.sess,
                &req.remote_sid,
                wire::err_permission_denied(req.id.as_deref(), Some(&reply_to), now),
            );
            return;
        }

        let (want, given) = if req.is_chan_request {
            match self.join_channel_reader(&req, now).await {
                Ok(acs) => acs,
                Err(errmsg) => {
                    self.reply(&req.sess, &req.remote_sid, errmsg);
                    return;
                }
            }
        } else {
            match self.join_subscriber(&req, now).await {
                Ok(acs) => acs,
                Err(errmsg) => {
                    self.reply(&req.sess, &req.remote_sid, errmsg);
                    return;
                }
            }
        };

        let uid = req.uid;
        let key = req.key_sid();
        let counted = !req.background && !req.is_chan_request;
        let prev_counted = self
            .sessions
            .remove(&key)
            .map(|p| p.counted)
            .unwrap_or(false);
        self.sessions.insert(
            key.clone(),
            SessionRef {
                sess: req.sess.clone(),
                uid,
                alias: req.alias.clone(),
                is_chan_sub: req.is_chan_request,
                counted,
            },
        );
        req.sess.add_sub(&self.name);
        if req.sess.is_multiplex() {
            req.sess.add_muid(uid);
        }

        let mut went_online = false;
        if counted && !prev_counted
            && let Some(pu) = self.per_user.get_mut(&uid)
        {
            pu.online += 1;
            went_online = pu.online == 1;
        }
        if went_online {
            self.announce_online_change(uid, true, Some(key.clone()));
        }

        if !req.is_chan_request {
            // The subscriber's other sessions learn the assigned mode.
            self.pres_single_user_offline(
                uid,
                "acs",
                PresParams {
                    dwant: Some(want.to_string()),
                    dgiven: Some(given.to_string()),
                    ..Default::default()
                },
                Some(&key),
            );
        }

        let mode = (want & given).to_string();
        let mut params = json!({
            "acs": { "want": want.to_string(), "given": given.to_string(), "mode": mode }
        });
        let reply_topic = if req.created {
            // Topic was created under a temporary client-side name.
            params["tmpname"] = json!(req.alias);
            self.name.clone()
        } else {
            req.alias.clone()
        };
        self.reply(
            &req.sess,
            &req.remote_sid,
            wire::no_err(req.id.as_deref(), Some(&reply_topic), now)
                .with_ctrl_params(params),
        );

        if let Some(get) = req.get.clone() {
            let ctx = ReqCtx {
                sess: req.sess.clone(),
                remote_sid: req.remote_sid.clone(),
                uid,
                auth_lvl: req.auth_lvl,
                id: req.id.clone(),
                alias: reply_topic,
            };
            self.serve_get(&ctx, &get).await;
        }
    }

    /// Channel reader: `mode_given` frozen at the canonical reader set, the
    /// requested `want` clamped to it, nothing cached in `per_user`.
    async fn join_channel_reader(
        &mut self,
        req: &JoinReq,
        now: DateTime<Utc>,
    ) -> Result<(AccessMode, AccessMode), ServerMsg> {
        let uid = req.uid;
        let given = AccessMode::CHN_READER;
        let requested = match self.requested_mode(req) {
            Ok(m) => m,
            Err(()) => {
                return Err(wire::err_malformed(
                    req.id.as_deref(),
                    Some(&req.alias),
                    now,
                ));
            }
        };
        let want = requested.unwrap_or(given) & AccessMode::CHN_READER;

        // Channel subscriptions are stored under the chn… alias.
        let sub_name = req.alias.clone();
        match self.ctx.store.subs().get(&sub_name, uid).await {
            Ok(Some(_)) => {
                let patch = SubPatch {
                    updated: Some(now),
                    mode_want: Some(want),
                    ..Default::default()
                };
                if let Err(e) = self.ctx.store.subs().update(&sub_name, uid, &patch).await {
                    tracing::error!(topic = %self.name, error = %e, "channel sub update failed");
                    return Err(wire::err_unknown(req.id.as_deref(), Some(&req.alias), now));
                }
            }
            Ok(None) => {
                let mut row = SubscriptionRow::new(&sub_name, uid, want, given);
                row.created = now;
                row.updated = now;
                if let Err(e) = self.ctx.store.subs().create(&row).await {
                    tracing::error!(topic = %self.name, error = %e, "channel sub create failed");
                    return Err(wire::err_unknown(req.id.as_deref(), Some(&req.alias), now));
                }
            }
            Err(e) => {
                tracing::error!(topic = %self.name, error = %e, "channel sub lookup failed");
                return Err(wire::err_unknown(req.id.as_deref(), Some(&req.alias), now));
            }
        }

        self.ctx.push.channel_sub(ChannelReq {
            uid,
            channel: sub_name,
            unsub: false,
        });
        Ok((want, given))
    }

    fn requested_mode(&self, req: &JoinReq) -> Result<Option<AccessMode>, ()> {
        let Some(mode) = req
            .set
            .as_ref()
            .and_then(|s| s.sub.as_ref())
            .and_then(|s| s.mode.as_deref())
        else {
            return Ok(None);
        };
        mode.parse::<AccessMode>().map(Some).map_err(|_| ())
    }

    async fn join_subscriber(
        &mut self,
        req: &JoinReq,
        now: DateTime<Utc>,
    ) -> Result<(AccessMode, AccessMode), ServerMsg> {
        let uid = req.uid;
        let requested = match self.requested_mode(req) {
            Ok(m) => m,
            Err(()) => {
                return Err(wire::err_malformed(
                    req.id.as_deref(),
                    Some(&req.alias),
                    now,
                ));
            }
        };

        let existing = self.per_user.get(&uid).filter(|pu| !pu.deleted).cloned();
        match existing {
            Some(_) => {
                if let Some(want) = requested {
                    self.change_own_want(uid, want, req.id.as_deref(), &req.alias, now)
                        .await?;
                }
                let pu = self.per_user.get(&uid).expect("existing subscriber");
                Ok((pu.mode_want, pu.mode_given))
            }
            None => self.new_subscription(req, requested, now).await,
        }
    }

    async fn new_subscription(
        &mut self,
        req: &JoinReq,
        requested: Option<AccessMode>,
        now: DateTime<Utc>,
    ) -> Result<(AccessMode, AccessMode), ServerMsg> {
        let uid = req.uid;
        if self.cat == TopicCat::Grp
            && self.per_user.len() >= self.ctx.config.max_subscriber_count
        {
            return Err(wire::err_policy(req.id.as_deref(), Some(&req.alias), now));
        }

        let given = self.default_given(req.auth_lvl, uid);
        if given.is_empty() {
            return Err(wire::err_permission_denied(
                req.id.as_deref(),
                Some(&req.alias),
                now,
            ));
        }
        let mut want = requested.unwrap_or(given);
        if self.cat == TopicCat::P2P {
            want = (want & AccessMode::P2P) | AccessMode::APPROVE;
        }
        if !given.is_owner() {
            // Ownership can only be granted by the current owner.
            want &= !AccessMode::OWNER;
        }

        let private = req
            .set
            .as_ref()
            .and_then(|s| s.desc.as_ref())
            .and_then(|d| d.private.clone());

        let mut row = SubscriptionRow::new(&self.name, uid, want, given);
        row.created = now;
        row.updated = now;
        row.private = private.clone();
        let create_result = self.ctx.store.subs().create(&row).await;
        match create_result {
            Ok(()) => {}
            Err(StoreError::Duplicate) => {
                // Soft-deleted row: reinstate with the fresh modes.
                let patch = SubPatch {
                    updated: Some(now),
                    mode_want: Some(want),
                    mode_given: Some(given),
                    private: private.clone(),
                    clear_deleted: true,
                    ..Default::default()
                };
                if let Err(e) = self.ctx.store.subs().update(&self.name, uid, &patch).await {
                    tracing::error!(topic = %self.name, user = %uid, error = %e, "resubscribe failed");
                    return Err(wire::err_unknown(req.id.as_deref(), Some(&req.alias), now));
                }
            }
            Err(e) => {
                tracing::error!(topic = %self.name, user = %uid, error = %e, "subscription create failed");
                return Err(wire::err_unknown(req.id.as_deref(), Some(&req.alias), now));
            }
        }

        let mut pu = PerUser::from_row(&row);
        pu.private = private;
        if self.cat == TopicCat::P2P
            && let Some((a, b)) = p2p_uids(&self.name)
        {
            let other = if uid == a { b } else { a };
            if let Ok(Some(user)) = self.ctx.store.users().get(other).await {
                pu.p2p_public = user.public.clone();
            }
        }
        self.per_user.insert(uid, pu);
        self.recompute_unions();

        if self.cat == TopicCat::P2P
            && let Some((a, b)) = p2p_uids(&self.name)
        {
            // Introduce the new subscriber to the counterpart's `me`.
            let other = if uid == a { b } else { a };
            let pres = MsgServerPres {
                topic: "me".to_string(),
                src: uid.user_id(),
                what: "?unkn+en".to_string(),
                ..Default::default()
            };
            self.ctx
                .hub()
                .route(&other.user_id(), ServerMsg::from_pres(pres));
        }

        Ok((want, given))
    }

    /// Default `mode_given` for a fresh subscription.
    fn default_given(&self, auth_lvl: AuthLevel, uid: Uid) -> AccessMode {
        match self.cat {
            TopicCat::P2P => AccessMode::P2P,
            TopicCat::Sys => {
                if auth_lvl == AuthLevel::Root {
                    AccessMode::FULL
                } else {
                    AccessMode::SYS
                }
            }
            TopicCat::Me | TopicCat::Fnd => AccessMode::FULL,
            TopicCat::Grp => {
                if uid == self.owner {
                    AccessMode::FULL | AccessMode::OWNER
                } else if auth_lvl == AuthLevel::Anon {
                    self.access_anon
                } else {
                    self.access_auth
                }
            }
        }
    }

    /// Validate and apply a subscriber's own `want` change; shared by join
    /// and `set.sub` without a user field.
    pub(crate) async fn change_own_want(
        &mut self,
        uid: Uid,
        want_new: AccessMode,
        id: Option<&str>,
        alias: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ServerMsg> {
        let Some(pu) = self.per_user.get(&uid).filter(|pu| !pu.deleted).cloned() else {
            return Err(wire::err_not_found(id, Some(alias), now));
        };

        let mut want = want_new;
        match self.cat {
            TopicCat::P2P => want = (want & AccessMode::P2P) | AccessMode::APPROVE,
            TopicCat::Sys => want &= AccessMode::FULL,
            _ => {}
        }

        if uid == self.owner {
            // The owner cannot self-ban or hand off ownership implicitly.
            if !want.is_owner() || !want.is_joiner() {
                return Err(wire::err_permission_denied(id, Some(alias), now));
            }
        } else if want.is_owner() && !pu.mode_given.is_owner() {
            want &= !AccessMode::OWNER;
        }

        let mut given = pu.mode_given;
        if self.cat == TopicCat::Grp && pu.mode_given.is_approver() {
            // Admins may raise their own given mode, short of delete and
            // ownership.
            given |= want & !(AccessMode::DELETE | AccessMode::OWNER);
        }

        if want == pu.mode_want && given == pu.mode_given {
            return Ok(false);
        }

        let patch = SubPatch {
            updated: Some(now),
            mode_want: Some(want),
            mode_given: (given != pu.mode_given).then_some(given),
            ..Default::default()
        };
        if let Err(e) = self.ctx.store.subs().update(&self.name, uid, &patch).await {
            tracing::error!(topic = %self.name, user = %uid, error = %e, "mode update failed");
            return Err(wire::err_unknown(id, Some(alias), now));
        }

        let dwant = AccessMode::delta(pu.mode_want, want);
        let dgiven = AccessMode::delta(pu.mode_given, given);
        {
            let entry = self.per_user.get_mut(&uid).expect("checked above");
            entry.mode_want = want;
            entry.mode_given = given;
            entry.updated = now;
        }
        self.recompute_unions();

        if (want & given).is_owner() && self.owner != uid {
            self.transfer_ownership(uid, id, alias, now).await?;
        }

        // Other subscribers with presence see the mode change.
        self.pres_subs_online(
            "acs",
            Some(uid),
            PresParams {
                dwant: (!dwant.is_empty()).then_some(dwant),
                dgiven: (!dgiven.is_empty()).then_some(dgiven),
                target: Some(uid.user_id()),
                ..Default::default()
            },
            PresFilters::default(),
            None,
        );
        Ok(true)
    }

    /// Two-write ownership transfer, executed inside the loop: strip `O`
    /// from the old owner's row, then record the new owner. If the second
    /// write fails the inconsistency is logged and repaired on next load.
    pub(crate) async fn transfer_ownership(
        &mut self,
        new_owner: Uid,
        id: Option<&str>,
        alias: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ServerMsg> {
        let old_owner = self.owner;
        if old_owner == new_owner {
            return Ok(());
        }

        if !old_owner.is_zero()
            && let Some(old_pu) = self.per_user.get(&old_owner).cloned()
        {
            let want = old_pu.mode_want & !AccessMode::OWNER;
            let given = old_pu.mode_given & !AccessMode::OWNER;
            let patch = SubPatch {
                updated: Some(now),
                mode_want: Some(want),
                mode_given: Some(given),
                ..Default::default()
            };
            if let Err(e) = self
                .ctx
                .store
                .subs()
                .update(&self.name, old_owner, &patch)
                .await
            {
                tracing::error!(topic = %self.name, error = %e, "owner strip failed");
                return Err(wire::err_unknown(id, Some(alias), now));
            }
            let entry = self.per_user.get_mut(&old_owner).expect("cloned above");
            entry.mode_want = want;
            entry.mode_given = given;
            entry.updated = now;

            self.pres_single_user_offline(
                old_owner,
                "acs",
                PresParams {
                    dgiven: Some("-O".to_string()),
                    target: Some(old_owner.user_id()),
                    ..Default::default()
                },
                None,
            );
        }

        if let Err(e) = self.ctx.store.topics().owner_change(&self.name, new_owner).await {
            // The old owner's row is already stripped; topic init restores
            // consistency from `topic.owner` on next load.
            tracing::error!(topic = %self.name, error = %e, "owner change failed, topic ownerless until repair");
            return Err(wire::err_unknown(id, Some(alias), now));
        }
        self.owner = new_owner;
        self.updated = now;
        self.recompute_unions();
        Ok(())
    }

    // =========================================================================
    // Leave
    // =========================================================================

    pub(crate) async fn handle_leave(&mut self, req: LeaveReq) {
        let now = Utc::now();
        if self.status.is_inactive() && req.id.is_some() {
            self.reply(
                &req.sess,
                &req.remote_sid,
                wire::err_locked(req.reply_id(), Some(&req.alias), now),
            );
            return;
        }

        let key = req.key_sid();
        let uid = if req.uid.is_zero() {
            self.sessions.get(&key).map(|s| s.uid).unwrap_or(Uid::ZERO)
        } else {
            req.uid
        };

        if req.unsub {
            self.leave_unsub(&req, uid, now).await;
        } else {
            self.detach_session(&req, &key, now);
        }

        if self.sessions.is_empty() {
            self.arm_kill_timer();
        }
    }

    /// Detach one session without touching the subscription.
    fn detach_session(&mut self, req: &LeaveReq, key: &str, now: DateTime<Utc>) {
        let Some(sref) = self.sessions.remove(key) else {
            if req.id.is_some() {
                self.reply(
                    &req.sess,
                    &req.remote_sid,
                    wire::err_not_found(req.reply_id(), Some(&req.alias), now),
                );
            }
            return;
        };
        sref.sess.del_sub(&self.name);
        if req.id.is_none() {
            // Eviction or transport death: let the session side know.
            sref.sess.detach_topic(&self.name);
        }
        self.drop_online_ref(&sref, now);
        if req.id.is_some() {
            self.reply(
                &req.sess,
                &req.remote_sid,
                wire::no_err(req.reply_id(), Some(&req.alias), now),
            );
        }
    }

    /// Decrement the online counter for a departing counted session and
    /// announce the transition when it was the user's last.
    fn drop_online_ref(&mut self, sref: &SessionRef, now: DateTime<Utc>) {
        if !sref.counted {
            return;
        }
        let uid = sref.uid;
        let mut went_offline = false;
        if let Some(pu) = self.per_user.get_mut(&uid) {
            pu.online = pu.online.saturating_sub(1);
            went_offline = pu.online == 0;
        }
        if !went_offline {
            return;
        }
        self.announce_online_change(uid, false, None);
        if self.cat == TopicCat::Me {
            // Final presence write for the departing user.
            let ua = sref.sess.user_agent();
            let store = self.ctx.store.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = store.users().update_last_seen(uid, &ua, now).await {
                    tracing::warn!(topic = %name, error = %e, "last seen update failed");
                }
            });
        }
    }

    /// `{leave unsub=true}`: delete the subscription and detach every
    /// session of that user. Repeating it after success is a no-op.
    async fn leave_unsub(&mut self, req: &LeaveReq, uid: Uid, now: DateTime<Utc>) {
        if uid.is_zero() {
            self.reply(
                &req.sess,
                &req.remote_sid,
                wire::err_auth_required(req.reply_id(), Some(&req.alias), now),
            );
            return;
        }
        if self.cat == TopicCat::Me || self.cat == TopicCat::Fnd {
            self.reply(
                &req.sess,
                &req.remote_sid,
                wire::err_permission_denied(req.reply_id(), Some(&req.alias), now),
            );
            return;
        }
        if self.cat == TopicCat::Grp && uid == self.owner {
            // Owners delete the topic instead of abandoning it.
            self.reply(
                &req.sess,
                &req.remote_sid,
                wire::err_permission_denied(req.reply_id(), Some(&req.alias), now),
            );
            return;
        }

        // Channel readers are stored under the chn… alias they subscribed
        // with; regular subscriptions under the topic name. Error replies
        // keep whatever name the session used.
        let is_chan_sub = req.alias.starts_with("chn");
        let sub_name = if is_chan_sub {
            req.alias.clone()
        } else {
            self.name.clone()
        };

        match self.ctx.store.subs().delete(&sub_name, uid, false).await {
            Ok(()) => {}
            Err(StoreError::NotFound) => {
                self.reply(
                    &req.sess,
                    &req.remote_sid,
                    wire::no_err_no_action(req.reply_id(), Some(&req.alias), now),
                );
                return;
            }
            Err(e) => {
                tracing::error!(topic = %self.name, user = %uid, error = %e, "unsubscribe failed");
                self.reply(
                    &req.sess,
                    &req.remote_sid,
                    wire::err_unknown(req.reply_id(), Some(&req.alias), now),
                );
                return;
            }
        }

        self.evict_user(uid, is_chan_sub, now);
        if is_chan_sub {
            self.ctx.push.channel_sub(ChannelReq {
                uid,
                channel: sub_name,
                unsub: true,
            });
        } else {
            self.per_user.remove(&uid);
            self.recompute_unions();
            // The user's other sessions drop the topic from their lists.
            self.pres_single_user_offline(uid, "gone", PresParams::default(), None);
        }

        self.reply(
            &req.sess,
            &req.remote_sid,
            wire::no_err(req.reply_id(), Some(&req.alias), now),
        );
    }

    /// Detach all sessions of `uid` (all channel-reader sessions when
    /// `chan_only`).
    pub(crate) fn evict_user(&mut self, uid: Uid, chan_only: bool, now: DateTime<Utc>) {
        let keys: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, sref)| sref.uid == uid && (!chan_only || sref.is_chan_sub))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(sref) = self.sessions.remove(&key) {
                sref.sess.del_sub(&self.name);
                sref.sess.detach_topic(&self.name);
                self.drop_online_ref(&sref, now);
            }
        }
    }
}
