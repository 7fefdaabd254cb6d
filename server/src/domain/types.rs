//! User ids, auth levels and the topic naming scheme.
//!
//! Topics are identified internally by an *expanded* name that encodes the
//! category in its prefix: `usr…` (a user's `me` topic), `fnd…` (per-user
//! search), `p2p…` (a byte-sorted pair of user ids), `grp…` (group, with a
//! `chn…` alias when channel-enabled) and `sys`. Clients address topics by
//! the short forms `me`, `fnd`, `usr<id>`, `grp<id>`, `chn<id>`, `sys`, and
//! `new<id>` / `nch<id>` for creation.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// =============================================================================
// Uid
// =============================================================================

/// Opaque numeric user id. Zero is reserved for unauthenticated and
/// multiplexing (cluster) sessions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uid(u64);

impl Uid {
    pub const ZERO: Uid = Uid(0);

    pub fn new(v: u64) -> Self {
        Uid(v)
    }

    /// Generate a fresh random id.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Uid(rng.gen_range(1..u64::MAX))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.to_be_bytes())
    }

    fn decode(s: &str) -> Option<Uid> {
        let bytes = URL_SAFE_NO_PAD.decode(s).ok()?;
        let arr: [u8; 8] = bytes.try_into().ok()?;
        let v = u64::from_be_bytes(arr);
        if v == 0 { None } else { Some(Uid(v)) }
    }

    /// Client-facing user id, also the expanded name of the user's `me` topic.
    pub fn user_id(&self) -> String {
        format!("usr{}", self.encode())
    }

    /// Expanded name of the user's `fnd` topic.
    pub fn fnd_name(&self) -> String {
        format!("fnd{}", self.encode())
    }

    /// Expanded name of the p2p topic between `self` and `other`. The two ids
    /// are byte-sorted so both sides derive the same name. `None` if either
    /// side is zero or both are the same user.
    pub fn p2p_name(&self, other: Uid) -> Option<String> {
        if self.is_zero() || other.is_zero() || *self == other {
            return None;
        }
        let (lo, hi) = if self.0 < other.0 {
            (self.0, other.0)
        } else {
            (other.0, self.0)
        };
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&lo.to_be_bytes());
        bytes[8..].copy_from_slice(&hi.to_be_bytes());
        Some(format!("p2p{}", URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// Parse a client-facing `usr<id>` string.
    pub fn from_user_id(s: &str) -> Option<Uid> {
        Self::decode(s.strip_prefix("usr")?)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user_id())
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.user_id())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Uid::from_user_id(&s).ok_or_else(|| serde::de::Error::custom("malformed user id"))
    }
}

/// Both members of a p2p topic name, in byte-sorted order.
pub fn p2p_uids(name: &str) -> Option<(Uid, Uid)> {
    let bytes = URL_SAFE_NO_PAD.decode(name.strip_prefix("p2p")?).ok()?;
    if bytes.len() != 16 {
        return None;
    }
    let lo = u64::from_be_bytes(bytes[..8].try_into().ok()?);
    let hi = u64::from_be_bytes(bytes[8..].try_into().ok()?);
    if lo == 0 || hi == 0 || lo == hi {
        return None;
    }
    Some((Uid(lo), Uid(hi)))
}

// =============================================================================
// Auth levels
// =============================================================================

/// Authentication level assigned to a session by the auth layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum AuthLevel {
    #[default]
    None,
    Anon,
    Auth,
    Root,
}

// =============================================================================
// Topic categories and names
// =============================================================================

/// Topic category, derived from the expanded name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicCat {
    Me,
    Fnd,
    P2P,
    Grp,
    Sys,
}

impl fmt::Display for TopicCat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicCat::Me => write!(f, "me"),
            TopicCat::Fnd => write!(f, "fnd"),
            TopicCat::P2P => write!(f, "p2p"),
            TopicCat::Grp => write!(f, "grp"),
            TopicCat::Sys => write!(f, "sys"),
        }
    }
}

/// Category of an expanded topic name. `chn…` maps to `Grp`.
pub fn topic_cat(name: &str) -> Option<TopicCat> {
    if name == "sys" {
        return Some(TopicCat::Sys);
    }
    match name.get(..3)? {
        "usr" => Some(TopicCat::Me),
        "fnd" => Some(TopicCat::Fnd),
        "p2p" => Some(TopicCat::P2P),
        "grp" | "chn" => Some(TopicCat::Grp),
        _ => None,
    }
}

/// Generate a fresh group topic name.
pub fn new_grp_name() -> String {
    let mut rng = rand::thread_rng();
    let v: u64 = rng.gen_range(1..u64::MAX);
    format!("grp{}", URL_SAFE_NO_PAD.encode(v.to_be_bytes()))
}

/// Channel alias of a group topic name.
pub fn grp_to_chn(name: &str) -> Option<String> {
    name.strip_prefix("grp").map(|s| format!("chn{}", s))
}

/// Group name behind a channel alias.
pub fn chn_to_grp(name: &str) -> Option<String> {
    name.strip_prefix("chn").map(|s| format!("grp{}", s))
}

/// How a session addressed a topic, resolved against the session's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    /// Expanded (routing) name.
    pub expanded: String,
    /// The name replies to this session should carry (`me`, `grp…`, `chn…`,
    /// a peer's `usr…`, …).
    pub alias: String,
    /// Set when the client asked to create a new topic (`new…` / `nch…`).
    pub created: bool,
    /// Channel-reader addressing (`chn…`).
    pub is_chan_request: bool,
}

/// Expand a client-facing topic name. `None` when the name is malformed or
/// requires an identity the session does not have.
pub fn resolve_topic_name(original: &str, uid: Uid) -> Option<ResolvedName> {
    if original.is_empty() {
        return None;
    }
    let mut created = false;
    let mut is_chan_request = false;
    let expanded = match original {
        "me" => {
            if uid.is_zero() {
                return None;
            }
            uid.user_id()
        }
        "fnd" => {
            if uid.is_zero() {
                return None;
            }
            uid.fnd_name()
        }
        "sys" => "sys".to_string(),
        _ if original.starts_with("new") => {
            created = true;
            new_grp_name()
        }
        _ if original.starts_with("nch") => {
            created = true;
            is_chan_request = true;
            new_grp_name()
        }
        _ if original.starts_with("usr") => {
            let other = Uid::from_user_id(original)?;
            uid.p2p_name(other)?
        }
        _ if original.starts_with("grp") => {
            topic_cat(original)?;
            original.to_string()
        }
        _ if original.starts_with("chn") => {
            is_chan_request = true;
            chn_to_grp(original)?
        }
        _ => return None,
    };
    Some(ResolvedName {
        expanded,
        alias: original.to_string(),
        created,
        is_chan_request,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_roundtrip() {
        let uid = Uid::new(0x0123_4567_89ab_cdef);
        let s = uid.user_id();
        assert!(s.starts_with("usr"));
        assert_eq!(Uid::from_user_id(&s), Some(uid));
    }

    #[test]
    fn test_uid_zero_rejected() {
        assert!(Uid::from_user_id("usrAAAAAAAAAAA").is_none());
        assert!(Uid::ZERO.is_zero());
        assert!(Uid::from_user_id("garbage").is_none());
    }

    #[test]
    fn test_p2p_name_symmetric() {
        let a = Uid::new(17);
        let b = Uid::new(42);
        assert_eq!(a.p2p_name(b), b.p2p_name(a));
        let name = a.p2p_name(b).unwrap();
        assert_eq!(p2p_uids(&name), Some((a, b)));
    }

    #[test]
    fn test_p2p_name_rejects_self_and_zero() {
        let a = Uid::new(17);
        assert!(a.p2p_name(a).is_none());
        assert!(a.p2p_name(Uid::ZERO).is_none());
        assert!(Uid::ZERO.p2p_name(a).is_none());
    }

    #[test]
    fn test_topic_cat() {
        assert_eq!(topic_cat("sys"), Some(TopicCat::Sys));
        assert_eq!(topic_cat(&Uid::new(1).user_id()), Some(TopicCat::Me));
        assert_eq!(topic_cat("grpAbCd"), Some(TopicCat::Grp));
        assert_eq!(topic_cat("chnAbCd"), Some(TopicCat::Grp));
        assert_eq!(topic_cat("bogus"), None);
    }

    #[test]
    fn test_chn_alias_roundtrip() {
        let grp = new_grp_name();
        let chn = grp_to_chn(&grp).unwrap();
        assert_eq!(chn_to_grp(&chn).unwrap(), grp);
    }

    #[test]
    fn test_resolve_me_requires_identity() {
        assert!(resolve_topic_name("me", Uid::ZERO).is_none());
        let uid = Uid::new(5);
        let r = resolve_topic_name("me", uid).unwrap();
        assert_eq!(r.expanded, uid.user_id());
        assert_eq!(r.alias, "me");
        assert!(!r.created);
    }

    #[test]
    fn test_resolve_new_creates_grp() {
        let r = resolve_topic_name("new123", Uid::new(5)).unwrap();
        assert!(r.created);
        assert!(r.expanded.starts_with("grp"));
        assert!(!r.is_chan_request);

        let r = resolve_topic_name("nch123", Uid::new(5)).unwrap();
        assert!(r.created);
        assert!(r.is_chan_request);
    }

    #[test]
    fn test_resolve_usr_to_p2p() {
        let me = Uid::new(5);
        let other = Uid::new(9);
        let r = resolve_topic_name(&other.user_id(), me).unwrap();
        assert_eq!(r.expanded, me.p2p_name(other).unwrap());
        assert_eq!(r.alias, other.user_id());
    }

    #[test]
    fn test_resolve_chn() {
        let r = resolve_topic_name("chnAbCdEf", Uid::new(5)).unwrap();
        assert_eq!(r.expanded, "grpAbCdEf");
        assert!(r.is_chan_request);
        assert_eq!(r.alias, "chnAbCdEf");
    }
}
