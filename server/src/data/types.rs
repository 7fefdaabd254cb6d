//! Row types shared by all store adapters.
//!
//! `public`, `private` and message `content` are uninterpreted JSON blobs;
//! the core never looks inside them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::access::AccessMode;
use crate::domain::types::Uid;
use crate::domain::wire::MsgRange;

// =============================================================================
// Rows
// =============================================================================

/// Default access modes granted to new subscribers by auth level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultAccess {
    pub auth: AccessMode,
    pub anon: AccessMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    #[default]
    Ok,
    Suspended,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub uid: Uid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub state: UserState,
    pub access: DefaultAccess,
    pub public: Option<Value>,
    pub tags: Vec<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct TopicRow {
    pub name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub touched: DateTime<Utc>,
    pub owner: Uid,
    pub seq_id: u64,
    pub del_id: u64,
    pub access: DefaultAccess,
    pub public: Option<Value>,
    pub tags: Vec<String>,
    pub is_chan: bool,
}

/// Durable (user, topic) relation plus the joined columns the query
/// operations fill in (`public`, `seq_id`, `touched`, `last_seen`,
/// `user_agent` describe the counterpart row, not the subscription itself).
#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub topic: String,
    pub user: Uid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub mode_want: AccessMode,
    pub mode_given: AccessMode,
    pub read_seq_id: u64,
    pub recv_seq_id: u64,
    pub del_id: u64,
    pub private: Option<Value>,

    pub public: Option<Value>,
    pub seq_id: u64,
    pub touched: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub user_agent: Option<String>,
}

impl SubscriptionRow {
    pub fn new(topic: &str, user: Uid, want: AccessMode, given: AccessMode) -> Self {
        let now = Utc::now();
        SubscriptionRow {
            topic: topic.to_string(),
            user,
            created: now,
            updated: now,
            deleted_at: None,
            mode_want: want,
            mode_given: given,
            read_seq_id: 0,
            recv_seq_id: 0,
            del_id: 0,
            private: None,
            public: None,
            seq_id: 0,
            touched: None,
            last_seen: None,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub topic: String,
    pub seq_id: u64,
    pub from: Uid,
    pub ts: DateTime<Utc>,
    pub head: Option<HashMap<String, Value>>,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRow {
    pub user: Uid,
    pub method: String,
    pub value: String,
    pub done: bool,
}

/// Search result row of `Users::find_subs`.
#[derive(Debug, Clone)]
pub struct FoundSub {
    /// Matched group topic name, if the match is a topic.
    pub topic: Option<String>,
    /// Matched user, if the match is a user.
    pub user: Option<Uid>,
    pub public: Option<Value>,
    pub tags: Vec<String>,
}

// =============================================================================
// Patches
// =============================================================================

/// Partial update of a user row; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub updated: Option<DateTime<Utc>>,
    pub access: Option<DefaultAccess>,
    pub public: Option<Value>,
    pub tags: Option<Vec<String>>,
}

/// Partial update of a topic row.
#[derive(Debug, Clone, Default)]
pub struct TopicPatch {
    pub updated: Option<DateTime<Utc>>,
    pub touched: Option<DateTime<Utc>>,
    pub seq_id: Option<u64>,
    pub del_id: Option<u64>,
    pub owner: Option<Uid>,
    pub access: Option<DefaultAccess>,
    pub public: Option<Value>,
    pub tags: Option<Vec<String>>,
}

/// Partial update of a subscription row.
#[derive(Debug, Clone, Default)]
pub struct SubPatch {
    pub updated: Option<DateTime<Utc>>,
    pub mode_want: Option<AccessMode>,
    pub mode_given: Option<AccessMode>,
    pub read_seq_id: Option<u64>,
    pub recv_seq_id: Option<u64>,
    pub del_id: Option<u64>,
    pub private: Option<Value>,
    /// Reinstate a soft-deleted subscription.
    pub clear_deleted: bool,
}

// =============================================================================
// Queries
// =============================================================================

/// Common query window for list operations.
#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    pub user: Option<Uid>,
    pub topic: Option<String>,
    pub since_id: Option<u64>,
    pub before_id: Option<u64>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// One normalized half-open deletion range `[low, hi)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelRange {
    pub low: u64,
    pub hi: u64,
}

impl DelRange {
    pub fn count(&self) -> u64 {
        self.hi - self.low
    }

    pub fn contains(&self, seq: u64) -> bool {
        seq >= self.low && seq < self.hi
    }

    pub fn to_wire(self) -> MsgRange {
        if self.hi == self.low + 1 {
            MsgRange {
                low: self.low,
                hi: None,
            }
        } else {
            MsgRange {
                low: self.low,
                hi: Some(self.hi),
            }
        }
    }
}

/// One `del.msg` transaction as handed to the store.
#[derive(Debug, Clone)]
pub struct DelTransaction {
    pub del_id: u64,
    /// `Some` for a soft (per-user) delete, `None` for hard.
    pub user: Option<Uid>,
    pub ranges: Vec<DelRange>,
}

/// Validate and normalize client-supplied deletion ranges: sort, merge,
/// convert to half-open intervals. `None` when any range is out of
/// `1 ≤ low < hi ≤ max_seq + 1`.
pub fn normalize_ranges(ranges: &[MsgRange], max_seq: u64) -> Option<Vec<DelRange>> {
    if ranges.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(ranges.len());
    for r in ranges {
        let hi = r.hi.unwrap_or(r.low + 1);
        if r.low == 0 || r.low >= hi || hi > max_seq + 1 {
            return None;
        }
        out.push(DelRange { low: r.low, hi });
    }
    out.sort_by_key(|r| r.low);
    let mut merged: Vec<DelRange> = Vec::with_capacity(out.len());
    for r in out {
        match merged.last_mut() {
            Some(last) if r.low <= last.hi => last.hi = last.hi.max(r.hi),
            _ => merged.push(r),
        }
    }
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(low: u64, hi: Option<u64>) -> MsgRange {
        MsgRange { low, hi }
    }

    #[test]
    fn test_normalize_single_id() {
        let out = normalize_ranges(&[range(3, None)], 10).unwrap();
        assert_eq!(out, vec![DelRange { low: 3, hi: 4 }]);
        assert_eq!(out[0].count(), 1);
    }

    #[test]
    fn test_normalize_sorts_and_merges() {
        let out = normalize_ranges(&[range(5, Some(8)), range(1, Some(6))], 10).unwrap();
        assert_eq!(out, vec![DelRange { low: 1, hi: 8 }]);
    }

    #[test]
    fn test_normalize_keeps_disjoint() {
        let out = normalize_ranges(&[range(8, Some(10)), range(1, Some(3))], 10).unwrap();
        assert_eq!(
            out,
            vec![DelRange { low: 1, hi: 3 }, DelRange { low: 8, hi: 10 }]
        );
    }

    #[test]
    fn test_normalize_rejects_invalid() {
        assert!(normalize_ranges(&[], 10).is_none());
        assert!(normalize_ranges(&[range(0, Some(2))], 10).is_none());
        assert!(normalize_ranges(&[range(4, Some(4))], 10).is_none());
        assert!(normalize_ranges(&[range(4, Some(3))], 10).is_none());
        assert!(normalize_ranges(&[range(1, Some(12))], 10).is_none());
    }

    #[test]
    fn test_normalize_allows_last_seq_plus_one() {
        assert!(normalize_ranges(&[range(1, Some(11))], 10).is_some());
    }

    #[test]
    fn test_del_range_wire_roundtrip() {
        let single = DelRange { low: 4, hi: 5 };
        assert_eq!(single.to_wire(), MsgRange { low: 4, hi: None });
        let span = DelRange { low: 4, hi: 9 };
        assert_eq!(
            span.to_wire(),
            MsgRange {
                low: 4,
                hi: Some(9)
            }
        );
    }
}
