//! Repository traits for store adapters.
//!
//! The topic runtime consumes exactly this operation set. Adapters implement
//! the four traits; the `Store` handle bundles them for injection. All
//! operations are synchronous from the topic loop's point of view: the loop
//! awaits them inline, so store latency is topic latency by design.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::data::error::StoreError;
use crate::data::types::{
    CredentialRow, DelTransaction, DelRange, FoundSub, MessageRow, QueryOpts, SubPatch,
    SubscriptionRow, TopicPatch, TopicRow, UserPatch, UserRow,
};
use crate::domain::types::Uid;

use std::sync::Arc;

// ============================================================================
// Users
// ============================================================================

#[async_trait]
pub trait UsersRepository: Send + Sync {
    async fn get(&self, uid: Uid) -> Result<Option<UserRow>, StoreError>;

    async fn get_all(&self, uids: &[Uid]) -> Result<Vec<UserRow>, StoreError>;

    /// Live subscriptions of a user, joined with topic data.
    async fn get_topics(&self, uid: Uid, opts: &QueryOpts)
    -> Result<Vec<SubscriptionRow>, StoreError>;

    /// Like `get_topics` but including soft-deleted subscriptions.
    async fn get_topics_any(
        &self,
        uid: Uid,
        opts: &QueryOpts,
    ) -> Result<Vec<SubscriptionRow>, StoreError>;

    /// Discovery: users and group topics matching all `required` tags,
    /// excluding the configured masked namespaces.
    async fn find_subs(
        &self,
        uid: Uid,
        required: &[String],
        opts: &QueryOpts,
    ) -> Result<Vec<FoundSub>, StoreError>;

    async fn update(&self, uid: Uid, patch: &UserPatch) -> Result<(), StoreError>;

    async fn update_last_seen(
        &self,
        uid: Uid,
        user_agent: &str,
        when: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get_all_creds(
        &self,
        uid: Uid,
        valid_only: bool,
    ) -> Result<Vec<CredentialRow>, StoreError>;

    async fn upsert_cred(&self, cred: &CredentialRow) -> Result<(), StoreError>;

    async fn delete_cred(&self, uid: Uid, method: &str, value: &str) -> Result<(), StoreError>;
}

// ============================================================================
// Topics
// ============================================================================

#[async_trait]
pub trait TopicsRepository: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<TopicRow>, StoreError>;

    /// Persist a new topic and the creator's subscription in one step.
    async fn create(&self, topic: &TopicRow, subs: &[SubscriptionRow]) -> Result<(), StoreError>;

    async fn update(&self, name: &str, patch: &TopicPatch) -> Result<(), StoreError>;

    /// Subscriptions of a topic, no user join.
    async fn get_subs(&self, name: &str, opts: &QueryOpts)
    -> Result<Vec<SubscriptionRow>, StoreError>;

    async fn get_subs_any(
        &self,
        name: &str,
        opts: &QueryOpts,
    ) -> Result<Vec<SubscriptionRow>, StoreError>;

    /// Subscriptions of a topic, joined with each subscriber's public data.
    async fn get_users(
        &self,
        name: &str,
        opts: &QueryOpts,
    ) -> Result<Vec<SubscriptionRow>, StoreError>;

    async fn get_users_any(
        &self,
        name: &str,
        opts: &QueryOpts,
    ) -> Result<Vec<SubscriptionRow>, StoreError>;

    /// Move topic ownership to `new_owner` (the topic row only; subscription
    /// mode bits are the caller's responsibility).
    async fn owner_change(&self, name: &str, new_owner: Uid) -> Result<(), StoreError>;

    /// Tear down the topic with its subscriptions and messages.
    async fn delete(&self, name: &str, hard: bool) -> Result<(), StoreError>;
}

// ============================================================================
// Subscriptions
// ============================================================================

#[async_trait]
pub trait SubsRepository: Send + Sync {
    async fn get(&self, topic: &str, user: Uid) -> Result<Option<SubscriptionRow>, StoreError>;

    /// `Duplicate` when a live row already exists.
    async fn create(&self, sub: &SubscriptionRow) -> Result<(), StoreError>;

    async fn update(&self, topic: &str, user: Uid, patch: &SubPatch) -> Result<(), StoreError>;

    /// Soft delete keeps the row with `deleted_at` set; hard delete removes
    /// it entirely.
    async fn delete(&self, topic: &str, user: Uid, hard: bool) -> Result<(), StoreError>;
}

// ============================================================================
// Messages
// ============================================================================

#[async_trait]
pub trait MessagesRepository: Send + Sync {
    /// `Duplicate` when `(topic, seq_id)` is already taken.
    async fn save(&self, msg: &MessageRow) -> Result<(), StoreError>;

    /// Messages visible to `for_user` (hard- and soft-deleted ones skipped).
    async fn get_all(
        &self,
        topic: &str,
        for_user: Uid,
        opts: &QueryOpts,
    ) -> Result<Vec<MessageRow>, StoreError>;

    /// Deletion ranges visible to `for_user` with ids greater than
    /// `opts.since_id`, and the highest deletion transaction id.
    async fn get_deleted(
        &self,
        topic: &str,
        for_user: Uid,
        opts: &QueryOpts,
    ) -> Result<(Vec<DelRange>, u64), StoreError>;

    async fn delete_list(&self, topic: &str, del: &DelTransaction) -> Result<(), StoreError>;
}

// ============================================================================
// Aggregate handle
// ============================================================================

/// Bundle of the four repositories, cloned into every component that talks
/// to the store.
#[derive(Clone)]
pub struct Store {
    users: Arc<dyn UsersRepository>,
    topics: Arc<dyn TopicsRepository>,
    subs: Arc<dyn SubsRepository>,
    messages: Arc<dyn MessagesRepository>,
}

impl Store {
    pub fn new(
        users: Arc<dyn UsersRepository>,
        topics: Arc<dyn TopicsRepository>,
        subs: Arc<dyn SubsRepository>,
        messages: Arc<dyn MessagesRepository>,
    ) -> Self {
        Store {
            users,
            topics,
            subs,
            messages,
        }
    }

    pub fn users(&self) -> &dyn UsersRepository {
        self.users.as_ref()
    }

    pub fn topics(&self) -> &dyn TopicsRepository {
        self.topics.as_ref()
    }

    pub fn subs(&self) -> &dyn SubsRepository {
        self.subs.as_ref()
    }

    pub fn messages(&self) -> &dyn MessagesRepository {
        self.messages.as_ref()
    }
}
