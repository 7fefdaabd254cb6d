//! Presence generation and filtering.
//!
//! `{pres}` events describe state changes of topics and users: `on`, `off`,
//! `ua`, `upd`, `acs`, `msg`, `read`, `recv`, `gone`, `term`, `tags`,
//! `?unkn`, `?none`, optionally suffixed `+en` (start reporting back) or
//! `+dis` (stop reporting). Online fan-out goes through the topic's own
//! session set; offline fan-out is routed through the hub to the affected
//! users' `me` topics.

use crate::domain::access::AccessMode;
use crate::domain::types::{TopicCat, Uid};
use crate::domain::wire::{MsgAccessMode, MsgRange, MsgServerPres, PresFilters, ServerMsg};

use super::{PerSub, SessionRef, Topic};

/// Parameters attached to a presence event; a concrete sum of everything any
/// `what` variant carries.
#[derive(Debug, Clone, Default)]
pub(crate) struct PresParams {
    pub seq: u64,
    pub del_id: u64,
    pub del_seq: Option<Vec<MsgRange>>,
    pub dwant: Option<String>,
    pub dgiven: Option<String>,
    pub actor: Option<String>,
    pub target: Option<String>,
    pub user_agent: Option<String>,
}

impl PresParams {
    pub fn apply(self, pres: &mut MsgServerPres) {
        pres.seq = self.seq;
        pres.del_id = self.del_id;
        pres.del_seq = self.del_seq;
        pres.actor = self.actor;
        pres.target = self.target;
        pres.user_agent = self.user_agent;
        if self.dwant.is_some() || self.dgiven.is_some() {
            pres.dacs = Some(MsgAccessMode {
                want: self.dwant,
                given: self.dgiven,
                mode: None,
            });
        }
    }
}

/// `what` with the `+en`/`+dis` suffix stripped.
pub(crate) fn base_what(what: &str) -> &str {
    what.split('+').next().unwrap_or(what)
}

impl Topic {
    pub(crate) fn make_pres(&self, what: &str, src: Option<Uid>) -> MsgServerPres {
        MsgServerPres {
            topic: self.name.clone(),
            src: src.map(|u| u.user_id()).unwrap_or_default(),
            what: what.to_string(),
            ..Default::default()
        }
    }

    /// Direct presence to sessions attached to this topic, subject to the
    /// per-recipient filters.
    pub(crate) fn pres_subs_online(
        &mut self,
        what: &str,
        src: Option<Uid>,
        params: PresParams,
        filters: PresFilters,
        skip_sid: Option<String>,
    ) {
        let mut pres = self.make_pres(what, src);
        params.apply(&mut pres);
        pres.filters = filters;
        let mut msg = ServerMsg::from_pres(pres);
        msg.skip_sid = skip_sid;
        self.fanout(&msg);
    }

    /// Like `pres_subs_online` but bypassing per-user filtering; used during
    /// rehash termination when subscription state may already be gone.
    pub(crate) fn pres_subs_online_direct(&mut self, what: &str) {
        for (key, sref) in self.sessions.iter() {
            let mut pres = self.make_pres(what, None);
            pres.topic = sref.alias.clone();
            let mut msg = ServerMsg::from_pres(pres);
            if sref.sess.is_multiplex() {
                msg.rcpt_sid = Some(key.clone());
            }
            sref.sess.queue_out(msg);
        }
    }

    /// Route presence to the `me` topics of subscribers, for delivery to
    /// sessions not attached here. `filter_in` restricts recipients by
    /// effective mode; `offline_only` skips users with sessions attached to
    /// this topic.
    pub(crate) fn pres_subs_offline(
        &self,
        what: &str,
        params: PresParams,
        filter_in: AccessMode,
        skip_sid: Option<&str>,
        offline_only: bool,
    ) {
        for (&uid, pu) in &self.per_user {
            if pu.deleted {
                continue;
            }
            if !filter_in.is_empty() && (pu.effective() & filter_in).is_empty() {
                continue;
            }
            if offline_only && pu.online > 0 {
                continue;
            }
            self.route_to_me(uid, what, params.clone(), skip_sid);
        }
    }

    /// Targeted offline presence for one user, no mode filtering.
    pub(crate) fn pres_single_user_offline(
        &self,
        uid: Uid,
        what: &str,
        params: PresParams,
        skip_sid: Option<&str>,
    ) {
        if uid.is_zero() {
            return;
        }
        self.route_to_me(uid, what, params, skip_sid);
    }

    fn route_to_me(&self, uid: Uid, what: &str, params: PresParams, skip_sid: Option<&str>) {
        let mut pres = MsgServerPres {
            topic: "me".to_string(),
            src: self.alias_for(uid),
            what: what.to_string(),
            ..Default::default()
        };
        params.apply(&mut pres);
        let mut msg = ServerMsg::from_pres(pres);
        msg.skip_sid = skip_sid.map(str::to_string);
        self.ctx.hub().route(&uid.user_id(), msg);
    }

    /// `me` only: announce this user's own state change (`on`, `off`, `ua`)
    /// to every enabled contact.
    pub(crate) fn pres_users_of_interest(&self, what: &str, ua: Option<&str>) {
        if self.cat != TopicCat::Me {
            return;
        }
        for (contact, sub) in &self.per_subs {
            if !sub.enabled || !contact.starts_with("usr") {
                continue;
            }
            let pres = MsgServerPres {
                topic: "me".to_string(),
                src: self.name.clone(),
                what: what.to_string(),
                user_agent: ua.map(str::to_string),
                ..Default::default()
            };
            self.ctx.hub().route(contact, ServerMsg::from_pres(pres));
        }
    }

    /// Presence announcing a user's first session attaching (`on`) or last
    /// one leaving (`off`) within this topic.
    pub(crate) fn announce_online_change(&mut self, uid: Uid, online: bool, skip_sid: Option<String>) {
        if self.cat == TopicCat::Me {
            // The user's own availability is announced to contacts, not to
            // the topic itself.
            self.pres_users_of_interest(if online { "on" } else { "off" }, None);
            return;
        }
        let what = if online { "on" } else { "off" };
        self.pres_subs_online(
            what,
            Some(uid),
            PresParams::default(),
            PresFilters::default(),
            skip_sid,
        );
    }

    /// Per-recipient presence filter check.
    pub(crate) fn pres_allowed(&self, pres: &MsgServerPres, sref: &SessionRef) -> bool {
        if sref.sess.is_multiplex() && sref.uid.is_zero() {
            // Multiplexing without a concrete user: always deliver, the
            // proxy filters per uid.
            return true;
        }
        let f = &pres.filters;
        if let Some(single) = f.single_user
            && sref.uid != single
        {
            return false;
        }
        if let Some(excluded) = f.exclude_user
            && sref.uid == excluded
        {
            return false;
        }
        if !f.skip_topic.is_empty() && sref.sess.has_sub(&f.skip_topic) {
            return false;
        }
        let eff = self.effective_for(sref.uid);
        let what = base_what(&pres.what);
        if what != "gone" && what != "acs" && what != "term" && !eff.is_presencer() {
            return false;
        }
        if !f.filter_in.is_empty() && (eff & f.filter_in).is_empty() {
            return false;
        }
        if !f.filter_out.is_empty() && !(eff & f.filter_out).is_empty() {
            return false;
        }
        true
    }

    /// `me` only: process an inbound presence event before fan-out. Returns
    /// whether the event should be delivered to the user's sessions.
    pub(crate) fn me_process_pres(&mut self, pres: &MsgServerPres) -> bool {
        let src = pres.src.clone();
        if src.is_empty() {
            return true;
        }
        let what = base_what(&pres.what);
        let enable = pres.what.ends_with("+en");
        let disable = pres.what.ends_with("+dis");

        match what {
            "on" | "off" => {
                let Some(entry) = self.per_subs.get_mut(&src) else {
                    return false;
                };
                if enable {
                    entry.enabled = true;
                }
                if disable {
                    entry.enabled = false;
                }
                if !entry.enabled {
                    return false;
                }
                entry.online = what == "on";
                true
            }
            "?unkn" | "?none" => {
                // A topic we were not tracking introduced itself (p2p
                // counterpart subscribed). Record it and report our own
                // availability back if asked.
                let entry = self.per_subs.entry(src.clone()).or_insert(PerSub {
                    online: false,
                    enabled: false,
                });
                if enable {
                    entry.enabled = true;
                    let online = self
                        .sessions
                        .values()
                        .any(|sref| sref.counted);
                    if src.starts_with("usr") {
                        let reply = MsgServerPres {
                            topic: "me".to_string(),
                            src: self.name.clone(),
                            what: if online { "on" } else { "off" }.to_string(),
                            ..Default::default()
                        };
                        self.ctx.hub().route(&src, ServerMsg::from_pres(reply));
                    }
                }
                if disable {
                    entry.enabled = false;
                }
                false
            }
            "gone" => {
                self.per_subs.remove(&src);
                true
            }
            "term" => {
                if let Some(entry) = self.per_subs.get_mut(&src) {
                    entry.online = false;
                }
                true
            }
            _ => true,
        }
    }
}
