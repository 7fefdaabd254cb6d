//! Meta handling: `{get}`, `{set}` and `{del}` of desc/sub/data/del/tags/cred.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::data::error::StoreError;
use crate::data::types::{
    CredentialRow, DelTransaction, QueryOpts, SubPatch, TopicPatch, UserPatch, normalize_ranges,
};
use crate::domain::access::AccessMode;
use crate::domain::session::Session;
use crate::domain::types::{AuthLevel, TopicCat, Uid, p2p_uids};
use crate::domain::wire::{
    self, MetaWhat, MsgAccessMode, MsgClientDel, MsgDefaultAcsMode, MsgDelValues, MsgGetOpts,
    MsgGetQuery, MsgLastSeen, MsgServerData, MsgServerMeta, MsgSetQuery, MsgTopicDesc, MsgTopicSub,
    PresFilters, ServerMsg, parse_meta_what,
};

use super::presence::PresParams;
use super::{MetaAction, MetaReq, ShutdownReason, Topic};

/// Common request context threaded through the meta subroutines.
pub(crate) struct ReqCtx {
    pub sess: Arc<Session>,
    pub remote_sid: Option<String>,
    pub uid: Uid,
    pub auth_lvl: AuthLevel,
    pub id: Option<String>,
    pub alias: String,
}

impl ReqCtx {
    fn key_sid(&self) -> String {
        self.remote_sid
            .clone()
            .unwrap_or_else(|| self.sess.sid.clone())
    }
}

fn query_opts(opts: Option<&MsgGetOpts>) -> QueryOpts {
    let Some(opts) = opts else {
        return QueryOpts::default();
    };
    QueryOpts {
        user: opts.user.as_deref().and_then(Uid::from_user_id),
        topic: opts.topic.clone(),
        since_id: opts.since_id,
        before_id: opts.before_id,
        if_modified_since: opts.if_modified_since,
        limit: opts.limit.map(|l| l as usize),
    }
}

impl Topic {
    pub(crate) async fn handle_meta(&mut self, req: MetaReq) {
        let now = Utc::now();
        if self.status.is_inactive() {
            self.reply(
                &req.sess,
                &req.remote_sid,
                wire::err_locked(req.id.as_deref(), Some(&req.alias), now),
            );
            return;
        }
        let ctx = ReqCtx {
            sess: req.sess,
            remote_sid: req.remote_sid,
            uid: req.uid,
            auth_lvl: req.auth_lvl,
            id: req.id,
            alias: req.alias,
        };
        match req.action {
            MetaAction::Get(query) => self.serve_get(&ctx, &query).await,
            MetaAction::Set(query) => self.serve_set(&ctx, &query).await,
            MetaAction::Del(del) => self.serve_del(&ctx, &del).await,
        }
    }

    // =========================================================================
    // {get}
    // =========================================================================

    pub(crate) async fn serve_get(&mut self, ctx: &ReqCtx, query: &MsgGetQuery) {
        let now = Utc::now();
        let what = parse_meta_what(&query.what);
        if what.is_empty() {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_malformed(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        }
        if self.cat == TopicCat::Sys && ctx.auth_lvl != AuthLevel::Root {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_permission_denied(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        }

        let mut meta = MsgServerMeta {
            id: ctx.id.clone(),
            topic: ctx.alias.clone(),
            ts: Some(now),
            ..Default::default()
        };

        if what.contains(MetaWhat::DESC) {
            meta.desc = Some(self.desc_for(ctx));
        }
        if what.contains(MetaWhat::SUB) {
            match self.subs_for(ctx, query.sub.as_ref()).await {
                Ok(subs) => {
                    if !subs.is_empty() {
                        meta.sub = Some(subs);
                    }
                }
                Err(errmsg) => {
                    self.reply(&ctx.sess, &ctx.remote_sid, errmsg);
                    return;
                }
            }
        }
        if what.contains(MetaWhat::DEL) {
            let opts = query_opts(query.del.as_ref());
            match self
                .ctx
                .store
                .messages()
                .get_deleted(&self.name, ctx.uid, &opts)
                .await
            {
                Ok((ranges, del_id)) => {
                    if del_id > 0 {
                        meta.del = Some(MsgDelValues {
                            del_id,
                            del_seq: ranges.into_iter().map(|r| r.to_wire()).collect(),
                        });
                    }
                }
                Err(e) => {
                    tracing::error!(topic = %self.name, error = %e, "get.del failed");
                    self.reply(
                        &ctx.sess,
                        &ctx.remote_sid,
                        wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now),
                    );
                    return;
                }
            }
        }
        if what.contains(MetaWhat::TAGS) && self.tags_readable(ctx.uid) && !self.tags.is_empty() {
            meta.tags = Some(self.tags.clone());
        }
        if what.contains(MetaWhat::CRED) && self.cat == TopicCat::Me {
            match self.ctx.store.users().get_all_creds(ctx.uid, false).await {
                Ok(creds) => {
                    if !creds.is_empty() {
                        meta.cred = Some(
                            creds
                                .into_iter()
                                .map(|c| wire::MsgCredServer {
                                    method: c.method,
                                    value: c.value,
                                    done: c.done,
                                })
                                .collect(),
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(topic = %self.name, error = %e, "get.cred failed");
                }
            }
        }

        let has_meta = meta.desc.is_some()
            || meta.sub.is_some()
            || meta.del.is_some()
            || meta.tags.is_some()
            || meta.cred.is_some();
        if has_meta {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                ServerMsg {
                    meta: Some(Box::new(meta)),
                    ..Default::default()
                },
            );
        }

        if what.contains(MetaWhat::DATA) {
            self.send_data_history(ctx, query.data.as_ref()).await;
        } else if !has_meta {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::no_err_no_action(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
        }
    }

    fn tags_readable(&self, uid: Uid) -> bool {
        match self.cat {
            TopicCat::Me | TopicCat::Fnd => true,
            TopicCat::Grp => {
                let eff = self.effective_for(uid);
                eff.is_sharer() || eff.is_owner()
            }
            _ => false,
        }
    }

    fn desc_for(&self, ctx: &ReqCtx) -> MsgTopicDesc {
        let pu = self.per_user.get(&ctx.uid).filter(|pu| !pu.deleted);
        let acs = match pu {
            Some(pu) => MsgAccessMode::new(pu.mode_want, pu.mode_given),
            // Channel readers are not cached; their mode is canonical.
            None => MsgAccessMode::new(AccessMode::CHN_READER, AccessMode::CHN_READER),
        };
        let defacs = match self.cat {
            TopicCat::Grp | TopicCat::Me => Some(MsgDefaultAcsMode {
                auth: Some(self.access_auth.to_string()),
                anon: Some(self.access_anon.to_string()),
            }),
            _ => None,
        };
        let public = match self.cat {
            TopicCat::P2P => pu.and_then(|pu| pu.p2p_public.clone()),
            _ => self.public.clone(),
        };
        MsgTopicDesc {
            created: Some(self.created),
            updated: Some(self.updated),
            touched: Some(self.touched),
            defacs,
            acs: Some(acs),
            seq: self.last_seq_id,
            read: pu.map(|pu| pu.read_id).unwrap_or(0),
            recv: pu.map(|pu| pu.recv_id).unwrap_or(0),
            clear: pu.map(|pu| pu.del_id).unwrap_or(0),
            is_chan: self.is_chan,
            online: None,
            public,
            private: pu.and_then(|pu| pu.private.clone()),
        }
    }

    async fn subs_for(
        &mut self,
        ctx: &ReqCtx,
        opts: Option<&MsgGetOpts>,
    ) -> Result<Vec<MsgTopicSub>, ServerMsg> {
        let now = Utc::now();
        let opts = query_opts(opts);
        match self.cat {
            TopicCat::Me => {
                let rows = self
                    .ctx
                    .store
                    .users()
                    .get_topics(ctx.uid, &opts)
                    .await
                    .map_err(|e| {
                        tracing::error!(topic = %self.name, error = %e, "get.sub failed");
                        wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now)
                    })?;
                Ok(rows
                    .into_iter()
                    .map(|row| {
                        let alias = match p2p_uids(&row.topic) {
                            Some((a, b)) => {
                                if ctx.uid == a { b.user_id() } else { a.user_id() }
                            }
                            None => row.topic.clone(),
                        };
                        let online = self
                            .per_subs
                            .get(&alias)
                            .map(|s| s.online)
                            .unwrap_or(false);
                        MsgTopicSub {
                            topic: Some(alias),
                            updated: Some(row.updated),
                            deleted: row.deleted_at,
                            online,
                            acs: MsgAccessMode::new(row.mode_want, row.mode_given),
                            read: row.read_seq_id,
                            recv: row.recv_seq_id,
                            clear: row.del_id,
                            seq: row.seq_id,
                            public: row.public,
                            private: row.private,
                            last_seen: row.last_seen.map(|when| MsgLastSeen {
                                when,
                                user_agent: row.user_agent.clone().unwrap_or_default(),
                            }),
                            ..Default::default()
                        }
                    })
                    .collect())
            }
            TopicCat::Fnd => {
                let query = self.fnd_queries.get(&ctx.key_sid()).cloned().unwrap_or_default();
                if query.is_empty() {
                    return Ok(Vec::new());
                }
                let found = self
                    .ctx
                    .store
                    .users()
                    .find_subs(ctx.uid, &query, &opts)
                    .await
                    .map_err(|e| {
                        tracing::error!(topic = %self.name, error = %e, "find failed");
                        wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now)
                    })?;
                Ok(found
                    .into_iter()
                    .map(|f| MsgTopicSub {
                        topic: f.topic,
                        user: f.user.map(|u| u.user_id()),
                        public: f.public,
                        private: (!f.tags.is_empty()).then(|| Value::from(f.tags)),
                        ..Default::default()
                    })
                    .collect())
            }
            _ => {
                // Channel readers may not enumerate the membership.
                if self.per_user.get(&ctx.uid).filter(|pu| !pu.deleted).is_none() {
                    return Err(wire::err_permission_denied(
                        ctx.id.as_deref(),
                        Some(&ctx.alias),
                        now,
                    ));
                }
                let rows = self
                    .ctx
                    .store
                    .topics()
                    .get_users(&self.name, &opts)
                    .await
                    .map_err(|e| {
                        tracing::error!(topic = %self.name, error = %e, "get.sub failed");
                        wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now)
                    })?;
                Ok(rows
                    .into_iter()
                    .map(|row| {
                        let own = row.user == ctx.uid;
                        let online = self
                            .per_user
                            .get(&row.user)
                            .map(|pu| pu.online > 0)
                            .unwrap_or(false);
                        MsgTopicSub {
                            user: Some(row.user.user_id()),
                            updated: Some(row.updated),
                            deleted: row.deleted_at,
                            online,
                            acs: MsgAccessMode::new(row.mode_want, row.mode_given),
                            // Cursors and private data of other subscribers
                            // are not exposed.
                            read: if own { row.read_seq_id } else { 0 },
                            recv: if own { row.recv_seq_id } else { 0 },
                            clear: if own { row.del_id } else { 0 },
                            public: row.public,
                            private: if own { row.private } else { None },
                            last_seen: row.last_seen.map(|when| MsgLastSeen {
                                when,
                                user_agent: row.user_agent.clone().unwrap_or_default(),
                            }),
                            ..Default::default()
                        }
                    })
                    .collect())
            }
        }
    }

    /// Replay stored messages as `{data}` packets followed by a `{ctrl}`
    /// carrying the count.
    async fn send_data_history(&mut self, ctx: &ReqCtx, opts: Option<&MsgGetOpts>) {
        let now = Utc::now();
        let is_chan_sub = self
            .sessions
            .get(&ctx.key_sid())
            .map(|sref| sref.is_chan_sub)
            .unwrap_or(false);
        if !is_chan_sub && !self.effective_for(ctx.uid).is_reader() {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_permission_denied(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        }
        let opts = query_opts(opts);
        let rows = match self
            .ctx
            .store
            .messages()
            .get_all(&self.name, ctx.uid, &opts)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(topic = %self.name, error = %e, "get.data failed");
                self.reply(
                    &ctx.sess,
                    &ctx.remote_sid,
                    wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now),
                );
                return;
            }
        };
        let count = rows.len();
        for row in rows {
            let from = (!row.from.is_zero() && !is_chan_sub).then(|| row.from.user_id());
            let data = MsgServerData {
                topic: ctx.alias.clone(),
                from,
                ts: Some(row.ts),
                head: row.head,
                seq: row.seq_id,
                content: row.content,
            };
            self.reply(&ctx.sess, &ctx.remote_sid, ServerMsg::from_data(data));
        }
        self.reply(
            &ctx.sess,
            &ctx.remote_sid,
            wire::no_err_params(
                ctx.id.as_deref(),
                Some(&ctx.alias),
                now,
                json!({ "count": count, "what": "data" }),
            ),
        );
    }

    // =========================================================================
    // {set}
    // =========================================================================

    pub(crate) async fn serve_set(&mut self, ctx: &ReqCtx, query: &MsgSetQuery) {
        let now = Utc::now();
        let mut changed = false;

        if let Some(desc) = &query.desc {
            match self.set_desc(ctx, desc, now).await {
                Ok(c) => changed = changed || c,
                Err(errmsg) => {
                    self.reply(&ctx.sess, &ctx.remote_sid, errmsg);
                    return;
                }
            }
        }
        if let Some(sub) = &query.sub {
            match self.set_sub(ctx, sub, now).await {
                Ok(c) => changed = changed || c,
                Err(errmsg) => {
                    self.reply(&ctx.sess, &ctx.remote_sid, errmsg);
                    return;
                }
            }
        }
        if let Some(tags) = &query.tags {
            match self.set_tags(ctx, tags, now).await {
                Ok(c) => changed = changed || c,
                Err(errmsg) => {
                    self.reply(&ctx.sess, &ctx.remote_sid, errmsg);
                    return;
                }
            }
        }
        if let Some(cred) = &query.cred {
            if self.cat != TopicCat::Me {
                self.reply(
                    &ctx.sess,
                    &ctx.remote_sid,
                    wire::err_permission_denied(ctx.id.as_deref(), Some(&ctx.alias), now),
                );
                return;
            }
            let row = CredentialRow {
                user: ctx.uid,
                method: cred.method.clone(),
                value: cred.value.clone(),
                done: false,
            };
            if let Err(e) = self.ctx.store.users().upsert_cred(&row).await {
                tracing::error!(topic = %self.name, error = %e, "set.cred failed");
                self.reply(
                    &ctx.sess,
                    &ctx.remote_sid,
                    wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now),
                );
                return;
            }
            changed = true;
        }

        let reply = if changed {
            wire::no_err(ctx.id.as_deref(), Some(&ctx.alias), now)
        } else {
            wire::info_not_modified(ctx.id.as_deref(), Some(&ctx.alias), now)
        };
        self.reply(&ctx.sess, &ctx.remote_sid, reply);
    }

    async fn set_desc(
        &mut self,
        ctx: &ReqCtx,
        desc: &wire::MsgSetDesc,
        now: DateTime<Utc>,
    ) -> Result<bool, ServerMsg> {
        let mut changed = false;
        let wants_shared_change = desc.public.is_some() || desc.default_acs.is_some();

        match self.cat {
            TopicCat::Me => {
                if wants_shared_change {
                    let access = match &desc.default_acs {
                        Some(da) => Some(self.parse_defacs(da, ctx, now)?),
                        None => None,
                    };
                    let patch = UserPatch {
                        updated: Some(now),
                        public: desc.public.clone(),
                        access,
                        ..Default::default()
                    };
                    self.ctx.store.users().update(ctx.uid, &patch).await.map_err(|e| {
                        tracing::error!(topic = %self.name, error = %e, "set.desc failed");
                        wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now)
                    })?;
                    if let Some(public) = &desc.public {
                        self.public = Some(public.clone());
                    }
                    if let Some(access) = access {
                        self.access_auth = access.auth;
                        self.access_anon = access.anon;
                    }
                    self.updated = now;
                    changed = true;
                    // Contacts see the profile update.
                    self.pres_users_of_interest("upd", None);
                }
            }
            TopicCat::Fnd => {
                if let Some(public) = &desc.public {
                    let query = parse_fnd_query(public);
                    self.fnd_queries.insert(ctx.key_sid(), query);
                    changed = true;
                }
            }
            TopicCat::Grp => {
                if wants_shared_change {
                    if ctx.uid != self.owner {
                        return Err(wire::err_permission_denied(
                            ctx.id.as_deref(),
                            Some(&ctx.alias),
                            now,
                        ));
                    }
                    let access = match &desc.default_acs {
                        Some(da) => Some(self.parse_defacs(da, ctx, now)?),
                        None => None,
                    };
                    let patch = TopicPatch {
                        updated: Some(now),
                        public: desc.public.clone(),
                        access,
                        ..Default::default()
                    };
                    self.ctx.store.topics().update(&self.name, &patch).await.map_err(|e| {
                        tracing::error!(topic = %self.name, error = %e, "set.desc failed");
                        wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now)
                    })?;
                    if let Some(public) = &desc.public {
                        self.public = Some(public.clone());
                    }
                    if let Some(access) = access {
                        self.access_auth = access.auth;
                        self.access_anon = access.anon;
                    }
                    self.updated = now;
                    changed = true;
                    self.pres_subs_offline(
                        "upd",
                        PresParams::default(),
                        AccessMode::NONE,
                        None,
                        false,
                    );
                    self.pres_subs_online(
                        "upd",
                        Some(ctx.uid),
                        PresParams::default(),
                        PresFilters::default(),
                        None,
                    );
                }
            }
            TopicCat::P2P => {
                // Shared p2p state is immutable from the client side.
                if wants_shared_change {
                    return Err(wire::err_permission_denied(
                        ctx.id.as_deref(),
                        Some(&ctx.alias),
                        now,
                    ));
                }
            }
            TopicCat::Sys => {
                if ctx.auth_lvl != AuthLevel::Root {
                    return Err(wire::err_permission_denied(
                        ctx.id.as_deref(),
                        Some(&ctx.alias),
                        now,
                    ));
                }
                if let Some(public) = &desc.public {
                    let patch = TopicPatch {
                        updated: Some(now),
                        public: Some(public.clone()),
                        ..Default::default()
                    };
                    self.ctx.store.topics().update(&self.name, &patch).await.map_err(|e| {
                        tracing::error!(topic = %self.name, error = %e, "set.desc failed");
                        wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now)
                    })?;
                    self.public = Some(public.clone());
                    self.updated = now;
                    changed = true;
                }
            }
        }

        if let Some(private) = &desc.private
            && self.cat != TopicCat::Fnd
            && self.per_user.contains_key(&ctx.uid)
        {
            let patch = SubPatch {
                updated: Some(now),
                private: Some(private.clone()),
                ..Default::default()
            };
            self.ctx
                .store
                .subs()
                .update(&self.name, ctx.uid, &patch)
                .await
                .map_err(|e| {
                    tracing::error!(topic = %self.name, error = %e, "private update failed");
                    wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now)
                })?;
            if let Some(pu) = self.per_user.get_mut(&ctx.uid) {
                pu.private = Some(private.clone());
                pu.updated = now;
            }
            changed = true;
        }

        Ok(changed)
    }

    fn parse_defacs(
        &self,
        da: &MsgDefaultAcsMode,
        ctx: &ReqCtx,
        now: DateTime<Utc>,
    ) -> Result<crate::data::types::DefaultAccess, ServerMsg> {
        let parse = |s: &Option<String>, fallback: AccessMode| -> Result<AccessMode, ServerMsg> {
            match s {
                Some(text) => text.parse().map_err(|_| {
                    wire::err_malformed(ctx.id.as_deref(), Some(&ctx.alias), now)
                }),
                None => Ok(fallback),
            }
        };
        Ok(crate::data::types::DefaultAccess {
            auth: parse(&da.auth, self.access_auth)?,
            anon: parse(&da.anon, self.access_anon)?,
        })
    }

    /// `set.sub`: without a user field the actor adjusts their own `want`;
    /// with one, an approver adjusts that user's `given`.
    async fn set_sub(
        &mut self,
        ctx: &ReqCtx,
        sub: &wire::MsgSetSub,
        now: DateTime<Utc>,
    ) -> Result<bool, ServerMsg> {
        let Some(mode_text) = sub.mode.as_deref() else {
            return Ok(false);
        };
        let mode: AccessMode = mode_text
            .parse()
            .map_err(|_| wire::err_malformed(ctx.id.as_deref(), Some(&ctx.alias), now))?;

        let Some(user_text) = sub.user.as_deref() else {
            return self
                .change_own_want(ctx.uid, mode, ctx.id.as_deref(), &ctx.alias, now)
                .await;
        };
        let target = Uid::from_user_id(user_text)
            .ok_or_else(|| wire::err_user_not_found(ctx.id.as_deref(), Some(&ctx.alias), now))?;
        if target == ctx.uid {
            return self
                .change_own_want(ctx.uid, mode, ctx.id.as_deref(), &ctx.alias, now)
                .await;
        }

        let actor_eff = self.effective_for(ctx.uid);
        if !actor_eff.is_approver() {
            return Err(wire::err_permission_denied(
                ctx.id.as_deref(),
                Some(&ctx.alias),
                now,
            ));
        }
        let mut given = mode;
        if self.cat == TopicCat::P2P {
            given = (given & AccessMode::P2P) | AccessMode::APPROVE;
        }
        // Ownership is granted by the current owner only; nobody rewrites
        // the owner's own modes.
        if given.is_owner() && ctx.uid != self.owner {
            return Err(wire::err_permission_denied(
                ctx.id.as_deref(),
                Some(&ctx.alias),
                now,
            ));
        }
        if target == self.owner {
            return Err(wire::err_permission_denied(
                ctx.id.as_deref(),
                Some(&ctx.alias),
                now,
            ));
        }
        let Some(pu) = self.per_user.get(&target).filter(|pu| !pu.deleted).cloned() else {
            return Err(wire::err_user_not_found(
                ctx.id.as_deref(),
                Some(&ctx.alias),
                now,
            ));
        };
        if given == pu.mode_given {
            return Ok(false);
        }

        let patch = SubPatch {
            updated: Some(now),
            mode_given: Some(given),
            ..Default::default()
        };
        self.ctx
            .store
            .subs()
            .update(&self.name, target, &patch)
            .await
            .map_err(|e| {
                tracing::error!(topic = %self.name, user = %target, error = %e, "given update failed");
                wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now)
            })?;

        let dgiven = AccessMode::delta(pu.mode_given, given);
        {
            let entry = self.per_user.get_mut(&target).expect("cloned above");
            entry.mode_given = given;
            entry.updated = now;
        }
        self.recompute_unions();

        let params = PresParams {
            dgiven: Some(dgiven),
            actor: Some(ctx.uid.user_id()),
            target: Some(target.user_id()),
            ..Default::default()
        };
        self.pres_single_user_offline(target, "acs", params.clone(), None);
        self.pres_subs_online("acs", Some(ctx.uid), params, PresFilters::default(), None);
        Ok(true)
    }

    async fn set_tags(
        &mut self,
        ctx: &ReqCtx,
        tags: &[String],
        now: DateTime<Utc>,
    ) -> Result<bool, ServerMsg> {
        match self.cat {
            TopicCat::Fnd => {
                self.fnd_queries.insert(ctx.key_sid(), tags.to_vec());
                return Ok(true);
            }
            TopicCat::Me => {}
            TopicCat::Grp => {
                if ctx.uid != self.owner {
                    return Err(wire::err_permission_denied(
                        ctx.id.as_deref(),
                        Some(&ctx.alias),
                        now,
                    ));
                }
            }
            _ => {
                return Err(wire::err_permission_denied(
                    ctx.id.as_deref(),
                    Some(&ctx.alias),
                    now,
                ));
            }
        }

        // Restricted namespaces may only be touched by root.
        if ctx.auth_lvl != AuthLevel::Root {
            let restricted = &self.ctx.config.restricted_tag_namespaces;
            let in_restricted = |tag: &String| {
                tag.split_once(':')
                    .map(|(ns, _)| restricted.iter().any(|r| r == ns))
                    .unwrap_or(false)
            };
            let old: Vec<&String> = self.tags.iter().filter(|t| in_restricted(t)).collect();
            let new: Vec<&String> = tags.iter().filter(|t| in_restricted(t)).collect();
            if old != new {
                return Err(wire::err_permission_denied(
                    ctx.id.as_deref(),
                    Some(&ctx.alias),
                    now,
                ));
            }
        }

        let tags = tags.to_vec();
        match self.cat {
            TopicCat::Me => {
                let patch = UserPatch {
                    updated: Some(now),
                    tags: Some(tags.clone()),
                    ..Default::default()
                };
                self.ctx.store.users().update(ctx.uid, &patch).await
            }
            _ => {
                let patch = TopicPatch {
                    updated: Some(now),
                    tags: Some(tags.clone()),
                    ..Default::default()
                };
                self.ctx.store.topics().update(&self.name, &patch).await
            }
        }
        .map_err(|e| {
            tracing::error!(topic = %self.name, error = %e, "set.tags failed");
            wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now)
        })?;

        self.tags = tags;
        self.updated = now;
        self.pres_subs_online(
            "tags",
            Some(ctx.uid),
            PresParams::default(),
            PresFilters::default(),
            None,
        );
        Ok(true)
    }

    // =========================================================================
    // {del}
    // =========================================================================

    pub(crate) async fn serve_del(&mut self, ctx: &ReqCtx, del: &MsgClientDel) {
        let now = Utc::now();
        match del.what.as_str() {
            "msg" => self.del_msg(ctx, del, now).await,
            "sub" => self.del_sub(ctx, del, now).await,
            "topic" => self.del_topic(ctx, now).await,
            "cred" => self.del_cred(ctx, del, now).await,
            _ => {
                self.reply(
                    &ctx.sess,
                    &ctx.remote_sid,
                    wire::err_malformed(ctx.id.as_deref(), Some(&ctx.alias), now),
                );
            }
        }
    }

    async fn del_msg(&mut self, ctx: &ReqCtx, del: &MsgClientDel, now: DateTime<Utc>) {
        let eff = self.effective_for(ctx.uid);
        let allowed = if del.hard { eff.is_deleter() } else { eff.is_reader() };
        if !allowed || self.per_user.get(&ctx.uid).filter(|pu| !pu.deleted).is_none() {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_permission_denied(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        }

        let Some(ranges) = del
            .del_seq
            .as_deref()
            .and_then(|r| normalize_ranges(r, self.last_seq_id))
        else {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_invalid_range(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        };
        let count: u64 = ranges.iter().map(|r| r.count()).sum();
        if count as usize > self.ctx.config.default_max_delete_count {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_policy(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        }

        let del_id = self.del_id + 1;
        let tx = DelTransaction {
            del_id,
            user: (!del.hard).then_some(ctx.uid),
            ranges: ranges.clone(),
        };
        if let Err(e) = self.ctx.store.messages().delete_list(&self.name, &tx).await {
            tracing::error!(topic = %self.name, error = %e, "del.msg failed");
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        }
        self.del_id = del_id;
        if let Err(e) = self
            .ctx
            .store
            .topics()
            .update(
                &self.name,
                &TopicPatch {
                    del_id: Some(del_id),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::warn!(topic = %self.name, error = %e, "del counter update failed");
        }

        let affected: Vec<Uid> = if del.hard {
            self.per_user.keys().copied().collect()
        } else {
            vec![ctx.uid]
        };
        for uid in affected {
            if let Some(pu) = self.per_user.get_mut(&uid) {
                pu.del_id = del_id;
            }
            let patch = SubPatch {
                del_id: Some(del_id),
                ..Default::default()
            };
            if let Err(e) = self.ctx.store.subs().update(&self.name, uid, &patch).await {
                tracing::warn!(topic = %self.name, user = %uid, error = %e, "sub del_id update failed");
            }
        }

        self.reply(
            &ctx.sess,
            &ctx.remote_sid,
            wire::no_err_params(
                ctx.id.as_deref(),
                Some(&ctx.alias),
                now,
                json!({ "del": del_id }),
            ),
        );

        if del.hard {
            // Everyone who can read learns about the removed ranges.
            let wire_ranges: Vec<_> = ranges.iter().map(|r| r.to_wire()).collect();
            self.pres_subs_online(
                "del",
                Some(ctx.uid),
                PresParams {
                    del_id,
                    del_seq: Some(wire_ranges.clone()),
                    ..Default::default()
                },
                PresFilters {
                    filter_in: AccessMode::READ,
                    ..Default::default()
                },
                Some(ctx.key_sid()),
            );
            self.pres_subs_offline(
                "del",
                PresParams {
                    del_id,
                    del_seq: Some(wire_ranges),
                    ..Default::default()
                },
                AccessMode::READ,
                None,
                true,
            );
        }
    }

    async fn del_sub(&mut self, ctx: &ReqCtx, del: &MsgClientDel, now: DateTime<Utc>) {
        if self.cat != TopicCat::Grp {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_permission_denied(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        }
        if !self.effective_for(ctx.uid).is_approver() {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_permission_denied(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        }
        let target = del.user.as_deref().and_then(Uid::from_user_id);
        let Some(target) = target else {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_user_not_found(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        };
        if target == self.owner || target == ctx.uid {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_permission_denied(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        }
        if !self.per_user.contains_key(&target) {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_user_not_found(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        }

        match self.ctx.store.subs().delete(&self.name, target, del.hard).await {
            Ok(()) => {}
            Err(StoreError::NotFound) => {
                self.reply(
                    &ctx.sess,
                    &ctx.remote_sid,
                    wire::no_err_no_action(ctx.id.as_deref(), Some(&ctx.alias), now),
                );
                return;
            }
            Err(e) => {
                tracing::error!(topic = %self.name, user = %target, error = %e, "del.sub failed");
                self.reply(
                    &ctx.sess,
                    &ctx.remote_sid,
                    wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now),
                );
                return;
            }
        }

        self.evict_user(target, false, now);
        self.per_user.remove(&target);
        self.recompute_unions();
        self.pres_single_user_offline(target, "gone", PresParams::default(), None);
        self.pres_subs_online(
            "acs",
            Some(target),
            PresParams {
                actor: Some(ctx.uid.user_id()),
                target: Some(target.user_id()),
                dgiven: Some("N".to_string()),
                ..Default::default()
            },
            PresFilters::default(),
            None,
        );
        self.reply(
            &ctx.sess,
            &ctx.remote_sid,
            wire::no_err(ctx.id.as_deref(), Some(&ctx.alias), now),
        );
    }

    async fn del_topic(&mut self, ctx: &ReqCtx, now: DateTime<Utc>) {
        let is_owner = ctx.uid == self.owner && !ctx.uid.is_zero();
        match self.cat {
            TopicCat::P2P => {
                let other_live = p2p_uids(&self.name)
                    .map(|(a, b)| if ctx.uid == a { b } else { a })
                    .and_then(|other| self.per_user.get(&other))
                    .map(|pu| !pu.deleted)
                    .unwrap_or(false);
                if other_live {
                    // The counterpart still holds the conversation: degrade
                    // to an unsubscribe of this side only.
                    let leave = super::LeaveReq {
                        sess: ctx.sess.clone(),
                        remote_sid: ctx.remote_sid.clone(),
                        uid: ctx.uid,
                        unsub: true,
                        id: ctx.id.clone(),
                        alias: ctx.alias.clone(),
                    };
                    self.handle_leave(leave).await;
                    return;
                }
            }
            TopicCat::Grp => {
                if !is_owner {
                    self.reply(
                        &ctx.sess,
                        &ctx.remote_sid,
                        wire::err_permission_denied(ctx.id.as_deref(), Some(&ctx.alias), now),
                    );
                    return;
                }
            }
            _ => {
                self.reply(
                    &ctx.sess,
                    &ctx.remote_sid,
                    wire::err_permission_denied(ctx.id.as_deref(), Some(&ctx.alias), now),
                );
                return;
            }
        }

        if let Err(e) = self.ctx.store.topics().delete(&self.name, true).await {
            tracing::error!(topic = %self.name, error = %e, "del.topic failed");
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        }
        self.reply(
            &ctx.sess,
            &ctx.remote_sid,
            wire::no_err(ctx.id.as_deref(), Some(&ctx.alias), now),
        );
        // The hub pulls the handle and delivers exit(Deleted); the loop
        // announces `gone` on the way out.
        self.ctx.hub().request_stop(&self.name, ShutdownReason::Deleted);
    }

    async fn del_cred(&mut self, ctx: &ReqCtx, del: &MsgClientDel, now: DateTime<Utc>) {
        if self.cat != TopicCat::Me {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_permission_denied(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        }
        let Some(cred) = &del.cred else {
            self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_malformed(ctx.id.as_deref(), Some(&ctx.alias), now),
            );
            return;
        };
        match self
            .ctx
            .store
            .users()
            .delete_cred(ctx.uid, &cred.method, &cred.value)
            .await
        {
            Ok(()) => self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::no_err(ctx.id.as_deref(), Some(&ctx.alias), now),
            ),
            Err(StoreError::NotFound) => self.reply(
                &ctx.sess,
                &ctx.remote_sid,
                wire::err_not_found(ctx.id.as_deref(), Some(&ctx.alias), now),
            ),
            Err(e) => {
                tracing::error!(topic = %self.name, error = %e, "del.cred failed");
                self.reply(
                    &ctx.sess,
                    &ctx.remote_sid,
                    wire::err_unknown(ctx.id.as_deref(), Some(&ctx.alias), now),
                );
            }
        }
    }
}

/// A `fnd` query is an opaque public blob; strings are split on commas and
/// whitespace into required tags.
fn parse_fnd_query(public: &Value) -> Vec<String> {
    match public {
        Value::String(s) => s
            .split([',', ' '])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
