//! Topic loading and creation.
//!
//! The hub inserts the handle into its index and spawns [`bootstrap`]; the
//! task loads (or creates) the topic state from the store, processes the
//! join that triggered the spawn, then enters the event loop. Requests
//! queued while loading are handled by the loop afterwards, in order.

use std::collections::HashMap;

use chrono::Utc;
use thiserror::Error;

use crate::data::error::StoreError;
use crate::data::types::{DefaultAccess, QueryOpts, SubPatch, SubscriptionRow, TopicRow, UserState};
use crate::domain::ServerCtx;
use crate::domain::access::AccessMode;
use crate::domain::types::{TopicCat, Uid, p2p_uids, topic_cat};
use crate::domain::wire;

use std::sync::Arc;

use super::{JoinReq, PerSub, PerUser, Topic, TopicHandle, TopicReceivers};

/// Parameters of a topic being brought to life.
pub struct TopicInit {
    pub name: String,
    /// Created via the `nch…` alias: channel-enabled from birth.
    pub make_chan: bool,
    pub ctx: Arc<ServerCtx>,
    pub handle: TopicHandle,
}

#[derive(Debug, Error)]
pub(crate) enum TopicInitError {
    #[error("topic does not exist")]
    NotFound,
    #[error("counterpart user does not exist")]
    UserNotFound,
    #[error("bad topic name")]
    Malformed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Entry point of every master topic task.
pub(crate) async fn bootstrap(
    init: TopicInit,
    rx: TopicReceivers,
    first_join: Option<JoinReq>,
) {
    let name = init.name.clone();
    let ctx = init.ctx.clone();
    match Topic::load(init, first_join.as_ref()).await {
        Ok(mut topic) => {
            if let Some(join) = first_join {
                topic.handle_join(join).await;
            }
            topic.run(rx).await;
        }
        Err(e) => {
            tracing::warn!(topic = %name, error = %e, "topic init failed");
            if let Some(join) = first_join {
                let reply = match e {
                    TopicInitError::NotFound => {
                        wire::err_not_found(join.id.as_deref(), Some(&join.alias), Utc::now())
                    }
                    TopicInitError::UserNotFound => {
                        wire::err_user_not_found(join.id.as_deref(), Some(&join.alias), Utc::now())
                    }
                    TopicInitError::Malformed => {
                        wire::err_malformed(join.id.as_deref(), Some(&join.alias), Utc::now())
                    }
                    TopicInitError::Store(_) => {
                        wire::err_unknown(join.id.as_deref(), Some(&join.alias), Utc::now())
                    }
                };
                let mut reply = reply;
                reply.rcpt_sid = join.remote_sid.clone();
                join.sess.queue_out(reply);
            }
            ctx.hub().drop_failed(&name);
        }
    }
}

impl Topic {
    fn empty(init: TopicInit, cat: TopicCat) -> Topic {
        let now = Utc::now();
        Topic {
            name: init.name,
            cat,
            is_chan: init.make_chan,
            status: init.handle.status.clone(),
            owner: Uid::ZERO,
            created: now,
            updated: now,
            touched: now,
            last_seq_id: 0,
            del_id: 0,
            access_auth: AccessMode::AUTH,
            access_anon: AccessMode::NONE,
            public: None,
            tags: Vec::new(),
            per_user: HashMap::new(),
            mode_want_union: AccessMode::NONE,
            mode_given_union: AccessMode::NONE,
            per_subs: HashMap::new(),
            sessions: HashMap::new(),
            fnd_queries: HashMap::new(),
            ctx: init.ctx,
            handle: init.handle,
            kill_at: None,
            ua_at: None,
            defr_at: None,
            pending_ua: None,
            pending_on: Vec::new(),
        }
    }

    pub(crate) async fn load(
        init: TopicInit,
        create_join: Option<&JoinReq>,
    ) -> Result<Topic, TopicInitError> {
        let cat = topic_cat(&init.name).ok_or(TopicInitError::Malformed)?;
        let mut topic = Topic::empty(init, cat);
        match cat {
            TopicCat::Me => topic.load_me().await?,
            TopicCat::Fnd => topic.load_fnd().await?,
            TopicCat::Sys => topic.load_sys().await?,
            TopicCat::Grp => topic.load_grp(create_join).await?,
            TopicCat::P2P => topic.load_p2p(create_join).await?,
        }
        topic.recompute_unions();
        topic.status.set_loaded();
        tracing::debug!(topic = %topic.name, category = %topic.cat, "topic loaded");
        Ok(topic)
    }

    async fn load_me(&mut self) -> Result<(), TopicInitError> {
        let uid = Uid::from_user_id(&self.name).ok_or(TopicInitError::Malformed)?;
        let user = self
            .ctx
            .store
            .users()
            .get(uid)
            .await?
            .ok_or(TopicInitError::UserNotFound)?;
        if user.state == UserState::Deleted {
            return Err(TopicInitError::UserNotFound);
        }
        if user.state == UserState::Suspended {
            self.status.set_read_only();
        }
        self.created = user.created;
        self.updated = user.updated;
        self.access_auth = user.access.auth;
        self.access_anon = user.access.anon;
        self.public = user.public.clone();
        self.tags = user.tags.clone();
        self.per_user.insert(
            uid,
            PerUser::synthetic(AccessMode::FULL, AccessMode::FULL, user.created),
        );

        // Contacts of interest: everything the user subscribes to with P.
        let subs = self
            .ctx
            .store
            .users()
            .get_topics(uid, &QueryOpts::default())
            .await?;
        for sub in subs {
            let key = match p2p_uids(&sub.topic) {
                Some((a, b)) => {
                    if uid == a { b.user_id() } else { a.user_id() }
                }
                None => sub.topic.clone(),
            };
            self.per_subs.insert(
                key,
                PerSub {
                    online: false,
                    enabled: (sub.mode_want & sub.mode_given).is_presencer(),
                },
            );
        }
        Ok(())
    }

    async fn load_fnd(&mut self) -> Result<(), TopicInitError> {
        let uid = self
            .name
            .strip_prefix("fnd")
            .map(|suffix| format!("usr{}", suffix))
            .and_then(|s| Uid::from_user_id(&s))
            .ok_or(TopicInitError::Malformed)?;
        let user = self
            .ctx
            .store
            .users()
            .get(uid)
            .await?
            .ok_or(TopicInitError::UserNotFound)?;
        self.created = user.created;
        self.updated = user.updated;
        self.tags = user.tags.clone();
        self.per_user.insert(
            uid,
            PerUser::synthetic(AccessMode::FULL, AccessMode::FULL, user.created),
        );
        Ok(())
    }

    async fn load_sys(&mut self) -> Result<(), TopicInitError> {
        match self.ctx.store.topics().get("sys").await? {
            Some(row) => self.apply_topic_row(&row),
            None => {
                let now = Utc::now();
                let row = TopicRow {
                    name: "sys".to_string(),
                    created: now,
                    updated: now,
                    touched: now,
                    owner: Uid::ZERO,
                    seq_id: 0,
                    del_id: 0,
                    access: DefaultAccess {
                        auth: AccessMode::SYS,
                        anon: AccessMode::NONE,
                    },
                    public: None,
                    tags: Vec::new(),
                    is_chan: false,
                };
                self.ctx.store.topics().create(&row, &[]).await?;
                self.apply_topic_row(&row);
            }
        }
        self.load_subs().await
    }

    async fn load_grp(&mut self, create_join: Option<&JoinReq>) -> Result<(), TopicInitError> {
        match self.ctx.store.topics().get(&self.name).await? {
            Some(row) => {
                self.apply_topic_row(&row);
                self.load_subs().await?;
                self.repair_ownership().await;
                Ok(())
            }
            None => {
                // Only a `new…`/`nch…` join may create; addressing a group
                // that never existed is a plain miss.
                let Some(join) = create_join.filter(|j| j.created) else {
                    return Err(TopicInitError::NotFound);
                };
                let now = Utc::now();
                let desc = join.set.as_ref().and_then(|s| s.desc.as_ref());
                let mut access = DefaultAccess {
                    auth: AccessMode::AUTH,
                    anon: AccessMode::NONE,
                };
                if let Some(da) = desc.and_then(|d| d.default_acs.as_ref()) {
                    if let Some(auth) = da.auth.as_deref().and_then(|s| s.parse().ok()) {
                        access.auth = auth;
                    }
                    if let Some(anon) = da.anon.as_deref().and_then(|s| s.parse().ok()) {
                        access.anon = anon;
                    }
                }
                let row = TopicRow {
                    name: self.name.clone(),
                    created: now,
                    updated: now,
                    touched: now,
                    owner: join.uid,
                    seq_id: 0,
                    del_id: 0,
                    access,
                    public: desc.and_then(|d| d.public.clone()),
                    tags: join.set.as_ref().and_then(|s| s.tags.clone()).unwrap_or_default(),
                    is_chan: self.is_chan,
                };
                self.ctx.store.topics().create(&row, &[]).await?;
                self.apply_topic_row(&row);
                Ok(())
            }
        }
    }

    async fn load_p2p(&mut self, create_join: Option<&JoinReq>) -> Result<(), TopicInitError> {
        let (a, b) = p2p_uids(&self.name).ok_or(TopicInitError::Malformed)?;
        match self.ctx.store.topics().get(&self.name).await? {
            Some(row) => {
                self.apply_topic_row(&row);
                self.load_subs().await?;
            }
            None => {
                let Some(join) = create_join else {
                    return Err(TopicInitError::NotFound);
                };
                let initiator = join.uid;
                let other = if initiator == a { b } else { a };
                let other_user = self
                    .ctx
                    .store
                    .users()
                    .get(other)
                    .await?
                    .ok_or(TopicInitError::UserNotFound)?;
                if other_user.state == UserState::Deleted {
                    return Err(TopicInitError::UserNotFound);
                }
                let now = Utc::now();
                let row = TopicRow {
                    name: self.name.clone(),
                    created: now,
                    updated: now,
                    touched: now,
                    owner: Uid::ZERO,
                    seq_id: 0,
                    del_id: 0,
                    access: DefaultAccess {
                        auth: AccessMode::P2P,
                        anon: AccessMode::NONE,
                    },
                    public: None,
                    tags: Vec::new(),
                    is_chan: false,
                };
                // The counterpart's subscription is created alongside the
                // topic; the initiator's comes from the join flow.
                let other_want = if other_user.access.auth.is_empty() {
                    AccessMode::P2P
                } else {
                    (other_user.access.auth & AccessMode::P2P) | AccessMode::APPROVE
                };
                let other_sub =
                    SubscriptionRow::new(&self.name, other, other_want, AccessMode::P2P);
                self.ctx.store.topics().create(&row, &[other_sub]).await?;
                self.apply_topic_row(&row);
                self.load_subs().await?;
            }
        }

        // Counterpart user data: their public is this side's topic public,
        // and a deleted counterpart invalidates the subscription.
        let users = self.ctx.store.users().get_all(&[a, b]).await?;
        for (uid, other) in [(a, b), (b, a)] {
            let other_user = users.iter().find(|u| u.uid == other);
            let alive = other_user.map(|u| u.state != UserState::Deleted).unwrap_or(false);
            if let Some(pu) = self.per_user.get_mut(&uid) {
                if alive {
                    pu.p2p_public = other_user.and_then(|u| u.public.clone());
                } else {
                    pu.mode_given = AccessMode::INVALID;
                }
            }
        }
        Ok(())
    }

    fn apply_topic_row(&mut self, row: &TopicRow) {
        self.created = row.created;
        self.updated = row.updated;
        self.touched = row.touched;
        self.owner = row.owner;
        self.last_seq_id = row.seq_id;
        self.del_id = row.del_id;
        self.access_auth = row.access.auth;
        self.access_anon = row.access.anon;
        self.public = row.public.clone();
        self.tags = row.tags.clone();
        self.is_chan = self.is_chan || row.is_chan;
    }

    async fn load_subs(&mut self) -> Result<(), TopicInitError> {
        let subs = self
            .ctx
            .store
            .topics()
            .get_subs(&self.name, &QueryOpts::default())
            .await?;
        for sub in &subs {
            self.per_user.insert(sub.user, PerUser::from_row(sub));
        }
        Ok(())
    }

    /// Ownership transfer is two store writes with no transaction; when the
    /// second failed the owner row lost its `O` bit. Restore it from the
    /// authoritative `topic.owner` column.
    async fn repair_ownership(&mut self) {
        if self.owner.is_zero() {
            return;
        }
        let Some(pu) = self.per_user.get(&self.owner) else {
            return;
        };
        if pu.mode_given.is_owner() {
            return;
        }
        tracing::warn!(topic = %self.name, owner = %self.owner, "restoring lost owner bit");
        let want = pu.mode_want | AccessMode::OWNER;
        let given = pu.mode_given | AccessMode::OWNER;
        let patch = SubPatch {
            updated: Some(Utc::now()),
            mode_want: Some(want),
            mode_given: Some(given),
            ..Default::default()
        };
        match self.ctx.store.subs().update(&self.name, self.owner, &patch).await {
            Ok(()) => {
                let entry = self.per_user.get_mut(&self.owner).expect("checked above");
                entry.mode_want = want;
                entry.mode_given = given;
            }
            Err(e) => {
                tracing::error!(topic = %self.name, error = %e, "owner repair failed");
            }
        }
    }
}

impl PerUser {
    /// A subscription that exists only in memory (`me`/`fnd` self-entries).
    pub(crate) fn synthetic(
        want: AccessMode,
        given: AccessMode,
        created: chrono::DateTime<Utc>,
    ) -> PerUser {
        PerUser {
            mode_want: want,
            mode_given: given,
            private: None,
            read_id: 0,
            recv_id: 0,
            del_id: 0,
            online: 0,
            deleted: false,
            created,
            updated: created,
            p2p_public: None,
        }
    }
}
