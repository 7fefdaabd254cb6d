//! Client/server wire messages.
//!
//! The wire format is symmetric JSON: clients send `{hi}`, `{acc}`,
//! `{login}`, `{sub}`, `{leave}`, `{pub}`, `{get}`, `{set}`, `{del}` and
//! `{note}`; the server answers with `{ctrl}`, `{meta}`, `{data}`, `{pres}`
//! and `{info}`. Every client packet carries an optional `id` echoed in the
//! `{ctrl}` reply. Transport framing (WS/LP/gRPC) lives outside the core;
//! these types are what the framing layers serialize.

use std::collections::HashMap;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::sync::Arc;

use super::access::AccessMode;
use super::session::Session;
use super::types::Uid;

// =============================================================================
// Client messages
// =============================================================================

/// One packet received from a client. Exactly one of the fields is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientMsg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hi: Option<MsgClientHi>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acc: Option<MsgClientAcc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<MsgClientLogin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<MsgClientSub>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leave: Option<MsgClientLeave>,
    #[serde(rename = "pub", skip_serializing_if = "Option::is_none")]
    pub publish: Option<MsgClientPub>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get: Option<MsgClientGet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set: Option<MsgClientSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del: Option<MsgClientDel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<MsgClientNote>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgClientHi {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    /// Presence notifications for this session are deferred until it
    /// foregrounds.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub background: bool,
}

/// Account creation/update. Credential validation is handled by the auth
/// layer; the core only routes the attached desc/tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgClientAcc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<MsgSetDesc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cred: Option<Vec<MsgCredClient>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgClientLogin {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgClientSub {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set: Option<MsgSetQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get: Option<MsgGetQuery>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgClientLeave {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unsub: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgClientPub {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<HashMap<String, Value>>,
    pub content: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgClientGet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    #[serde(flatten)]
    pub query: MsgGetQuery,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgClientSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    #[serde(flatten)]
    pub query: MsgSetQuery,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgClientDel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    /// One of `msg`, `sub`, `topic`, `cred`.
    pub what: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub hard: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del_seq: Option<Vec<MsgRange>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cred: Option<MsgCredClient>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgClientNote {
    pub topic: String,
    /// `kp` (typing), `read` or `recv`.
    pub what: String,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub seq_id: u64,
}

// =============================================================================
// Shared query sub-structures
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgGetQuery {
    /// Space-separated subset of `desc sub data del tags cred`.
    pub what: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<MsgGetOpts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<MsgGetOpts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<MsgGetOpts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del: Option<MsgGetOpts>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgGetOpts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_modified_since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgSetQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<MsgSetDesc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<MsgSetSub>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cred: Option<MsgCredClient>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgSetDesc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_acs: Option<MsgDefaultAcsMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgSetSub {
    /// Absent: the acting user changes their own `want`. Present: an
    /// approver changes this user's `given`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgDefaultAcsMode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anon: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgCredClient {
    pub method: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Half-open interval of message ids. `hi` absent means the single id `low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgRange {
    pub low: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hi: Option<u64>,
}

// =============================================================================
// Server messages
// =============================================================================

/// One packet sent to a client, plus routing metadata the transports never
/// serialize.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerMsg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctrl: Option<MsgServerCtrl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<MsgServerData>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Box<MsgServerMeta>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pres: Option<Box<MsgServerPres>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<MsgServerInfo>,

    /// Session id of the originator; fan-out skips it.
    #[serde(skip)]
    pub skip_sid: Option<String>,
    /// User the packet originated from, for permission checks in the loop.
    #[serde(skip)]
    pub as_user: Uid,
    /// Client message id to echo in the eventual `{ctrl}` reply.
    #[serde(skip)]
    pub id: Option<String>,
    /// Originating session, for error replies from inside the loop.
    #[serde(skip)]
    pub sess: Option<Arc<Session>>,
    /// On a multiplexing session: the remote client session this reply is
    /// addressed to. `None` for fan-out broadcasts.
    #[serde(skip)]
    pub rcpt_sid: Option<String>,
}

impl ServerMsg {
    /// Attach params to a `{ctrl}` reply built by one of the helpers below.
    pub fn with_ctrl_params(mut self, params: Value) -> Self {
        if let Some(ctrl) = self.ctrl.as_mut() {
            ctrl.params = Some(params);
        }
        self
    }

    pub fn from_pres(pres: MsgServerPres) -> Self {
        ServerMsg {
            pres: Some(Box::new(pres)),
            ..Default::default()
        }
    }

    pub fn from_data(data: MsgServerData) -> Self {
        ServerMsg {
            data: Some(Box::new(data)),
            ..Default::default()
        }
    }

    pub fn from_info(info: MsgServerInfo) -> Self {
        ServerMsg {
            info: Some(info),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgServerCtrl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub code: u16,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgServerData {
    pub topic: String,
    /// Sender id; stripped for channel readers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<HashMap<String, Value>>,
    pub seq: u64,
    pub content: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgServerMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<MsgTopicDesc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<Vec<MsgTopicSub>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del: Option<MsgDelValues>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cred: Option<Vec<MsgCredServer>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgTopicDesc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub touched: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defacs: Option<MsgDefaultAcsMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acs: Option<MsgAccessMode>,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub seq: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub read: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub recv: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub clear: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_chan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgTopicSub {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub online: bool,
    pub acs: MsgAccessMode,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub read: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub recv: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub clear: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<MsgLastSeen>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgLastSeen {
    pub when: DateTime<Utc>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgAccessMode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub want: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl MsgAccessMode {
    pub fn new(want: AccessMode, given: AccessMode) -> Self {
        MsgAccessMode {
            want: Some(want.to_string()),
            given: Some(given.to_string()),
            mode: Some((want & given).to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgDelValues {
    pub del_id: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub del_seq: Vec<MsgRange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgCredServer {
    pub method: String,
    pub value: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
}

/// Presence filters attached to a `{pres}` while it travels between loops.
/// Serialized only inside cluster frames, never to clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PresFilters {
    pub filter_in: AccessMode,
    pub filter_out: AccessMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_user: Option<Uid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_user: Option<Uid>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub skip_topic: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgServerPres {
    pub topic: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub src: String,
    pub what: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub seq: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub del_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del_seq: Option<Vec<MsgRange>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Access mode delta for `acs` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dacs: Option<MsgAccessMode>,

    /// Delivery filters; re-attached on the proxy side from the cluster
    /// frame before local fan-out.
    #[serde(skip)]
    pub filters: PresFilters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MsgServerInfo {
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// `kp`, `read` or `recv`.
    pub what: String,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub seq: u64,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

// =============================================================================
// Meta selector
// =============================================================================

bitflags! {
    /// Parsed `what` selector of `{get}`/`{set}` queries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MetaWhat: u8 {
        const DESC = 0x01;
        const SUB = 0x02;
        const DATA = 0x04;
        const DEL = 0x08;
        const TAGS = 0x10;
        const CRED = 0x20;
    }
}

/// Parse a space-separated `what` string; unknown tokens are ignored.
pub fn parse_meta_what(what: &str) -> MetaWhat {
    let mut out = MetaWhat::empty();
    for token in what.split_ascii_whitespace() {
        out |= match token {
            "desc" => MetaWhat::DESC,
            "sub" => MetaWhat::SUB,
            "data" => MetaWhat::DATA,
            "del" => MetaWhat::DEL,
            "tags" => MetaWhat::TAGS,
            "cred" => MetaWhat::CRED,
            _ => MetaWhat::empty(),
        };
    }
    out
}

// =============================================================================
// Ctrl replies
// =============================================================================

fn ctrl(
    code: u16,
    text: &str,
    id: Option<&str>,
    topic: Option<&str>,
    ts: DateTime<Utc>,
    params: Option<Value>,
) -> ServerMsg {
    ServerMsg {
        ctrl: Some(MsgServerCtrl {
            id: id.map(str::to_string),
            topic: topic.map(str::to_string),
            code,
            text: text.to_string(),
            params,
            ts: Some(ts),
        }),
        ..Default::default()
    }
}

pub fn no_err(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(200, "ok", id, topic, ts, None)
}

pub fn no_err_params(
    id: Option<&str>,
    topic: Option<&str>,
    ts: DateTime<Utc>,
    params: Value,
) -> ServerMsg {
    ctrl(200, "ok", id, topic, ts, Some(params))
}

pub fn no_err_accepted(
    id: Option<&str>,
    topic: Option<&str>,
    ts: DateTime<Utc>,
    params: Option<Value>,
) -> ServerMsg {
    ctrl(202, "accepted", id, topic, ts, params)
}

pub fn no_err_no_action(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(204, "no action", id, topic, ts, None)
}

pub fn info_not_modified(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(304, "not modified", id, topic, ts, None)
}

pub fn err_malformed(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(400, "malformed", id, topic, ts, None)
}

pub fn err_invalid_range(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(400, "invalid range", id, topic, ts, None)
}

pub fn err_auth_required(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(401, "authentication required", id, topic, ts, None)
}

pub fn err_permission_denied(
    id: Option<&str>,
    topic: Option<&str>,
    ts: DateTime<Utc>,
) -> ServerMsg {
    ctrl(403, "permission denied", id, topic, ts, None)
}

pub fn err_not_found(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(404, "not found", id, topic, ts, None)
}

pub fn err_user_not_found(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(404, "user not found", id, topic, ts, None)
}

pub fn err_attach_first(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(409, "attach first", id, topic, ts, None)
}

pub fn err_already_exists(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(409, "already exists", id, topic, ts, None)
}

pub fn err_too_large(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(413, "too large", id, topic, ts, None)
}

pub fn err_policy(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(422, "policy violation", id, topic, ts, None)
}

pub fn err_unknown(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(500, "internal error", id, topic, ts, None)
}

pub fn err_cluster_unreachable(
    id: Option<&str>,
    topic: Option<&str>,
    ts: DateTime<Utc>,
) -> ServerMsg {
    ctrl(502, "cluster unreachable", id, topic, ts, None)
}

pub fn err_locked(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(503, "locked", id, topic, ts, None)
}

pub fn err_overloaded(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(503, "overloaded", id, topic, ts, None)
}

pub fn err_timeout(id: Option<&str>, topic: Option<&str>, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(504, "timeout", id, topic, ts, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_msg_pub_roundtrip() {
        let json = r#"{"pub":{"id":"42","topic":"grp1","content":"hi"}}"#;
        let msg: ClientMsg = serde_json::from_str(json).unwrap();
        let publish = msg.publish.as_ref().unwrap();
        assert_eq!(publish.id.as_deref(), Some("42"));
        assert_eq!(publish.topic, "grp1");
        assert_eq!(publish.content, Value::String("hi".into()));
        assert!(!publish.no_echo);

        let back = serde_json::to_string(&msg).unwrap();
        assert!(back.contains("\"pub\""));
    }

    #[test]
    fn test_server_msg_skips_internal_fields() {
        let msg = ServerMsg {
            skip_sid: Some("abc".into()),
            ..no_err(Some("1"), Some("me"), Utc::now())
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("abc"));
        assert!(json.contains("\"code\":200"));
    }

    #[test]
    fn test_pres_filters_not_on_wire() {
        let pres = MsgServerPres {
            topic: "me".into(),
            src: "grp1".into(),
            what: "on".into(),
            filters: PresFilters {
                filter_in: AccessMode::READ,
                ..Default::default()
            },
            ..Default::default()
        };
        let json = serde_json::to_string(&ServerMsg::from_pres(pres)).unwrap();
        assert!(!json.contains("filterIn"));
        assert!(json.contains("\"what\":\"on\""));
    }

    #[test]
    fn test_parse_meta_what() {
        let w = parse_meta_what("desc sub data");
        assert!(w.contains(MetaWhat::DESC | MetaWhat::SUB | MetaWhat::DATA));
        assert!(!w.contains(MetaWhat::TAGS));
        assert_eq!(parse_meta_what("bogus"), MetaWhat::empty());
    }

    #[test]
    fn test_ctrl_echoes_id_and_topic() {
        let msg = err_permission_denied(Some("7"), Some("grp1"), Utc::now());
        let ctrl = msg.ctrl.unwrap();
        assert_eq!(ctrl.id.as_deref(), Some("7"));
        assert_eq!(ctrl.topic.as_deref(), Some("grp1"));
        assert_eq!(ctrl.code, 403);
    }

    #[test]
    fn test_range_single_id() {
        let r: MsgRange = serde_json::from_str(r#"{"low":5}"#).unwrap();
        assert_eq!(r.low, 5);
        assert_eq!(r.hi, None);
    }
}
